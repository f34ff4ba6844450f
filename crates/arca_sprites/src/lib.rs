//! Client for the Sprites REST control plane.
//!
//! Three remote operations back everything the agent does to a workspace:
//! create a sprite, write a file into it, and execute a shell command on
//! it. The client is deliberately thin - it owns authentication, parameter
//! encoding and timeouts, while retry policy stays with the callers.

pub mod client;
pub mod text;

pub use client::{ExecOutput, SpritesClient};
pub use text::strip_control_sequences;
