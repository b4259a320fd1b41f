//! Database models for vidflow.
//!
//! These models map directly to the database schema and handle
//! serialization/deserialization of JSON fields.

pub mod asset;
pub mod job;
pub mod stream;

pub use asset::*;
pub use job::*;
pub use stream::*;
