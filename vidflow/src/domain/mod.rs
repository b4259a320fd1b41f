//! Domain layer for vidflow.
//!
//! Job records and stream state are closed enumerations so that illegal
//! states cannot be represented.

pub mod job;
pub mod stream;

pub use job::{JobKind, JobOutputs, JobRecord, JobState, STEP_NOT_ENOUGH_FILES};
pub use stream::{StreamInfo, StreamStatus};
