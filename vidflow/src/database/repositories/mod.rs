//! Repository layer for database access.
//!
//! Each table gets a trait plus an sqlx implementation, so the worker and the
//! supervisor can be exercised against in-memory fakes.

pub mod asset;
pub mod job;
pub mod stream;

pub use asset::*;
pub use job::*;
pub use stream::*;
