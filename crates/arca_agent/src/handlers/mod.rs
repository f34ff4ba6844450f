//! Domain operations composed from the pool, the sprites client and the
//! routing/mail side channels.

pub mod expand;
pub mod provision;
pub mod recycle;
