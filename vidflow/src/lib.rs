//! vidflow library crate.
//!
//! A media job worker (analyze, normalize, merge) and a supervisor for
//! long-running live relays, sharing one transient store, one durable store
//! and one set of media collaborators.

pub mod config;
pub mod database;
pub mod domain;
pub mod error;
pub mod jobs;
pub mod logging;
pub mod media;
pub mod panic_hook;
pub mod queue;
pub mod recovery;
pub mod services;
pub mod store;
pub mod stream;
pub mod utils;
pub mod worker;

pub use error::{Error, Result};
