//! Shared types for the Arcamatrix provisioning agent.
//!
//! Everything that crosses a file or process boundary lives here: the task
//! document consumed from the checkout intake, the sprite pool document, and
//! the patch records written by the self-healing wrapper. The on-disk JSON
//! shapes are externally observable (the intake endpoint and older tooling
//! read them), so unknown keys are preserved on every record and map key
//! order is insertion order.

pub mod defaults;
pub mod naming;
pub mod types;

pub use naming::{canonical_sprite_url, canonicalize_sprite_url, next_sprite_name};
pub use types::{
    Assignment,
    HealthReport,
    PatchEvent,
    PatchPhase,
    PoolDocument,
    PoolStatus,
    PrePatch,
    RootFix,
    SpriteRecord,
    SpriteStatus,
    Task,
    TaskDocument,
    TaskKind,
    TaskMetadata,
    TaskResult,
    TaskStatus,
};
