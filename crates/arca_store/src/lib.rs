//! Durable, file-locked state for the provisioning agent.
//!
//! Three documents, all JSON on disk and shared with external tooling:
//! the sprite pool (with its customer assignment index), the task queue
//! written by the checkout intake, and the patch log kept by the
//! self-healing wrapper.

pub mod lock;
pub mod patch_log;
pub mod pool;
pub mod tasks;

pub use lock::{LockError, LockedFile};
pub use patch_log::PatchLog;
pub use pool::{heal, SpritePool};
pub use tasks::{RecoveredTask, TaskStore};
