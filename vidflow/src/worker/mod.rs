//! Job workers: a pool of consumers, each running dequeued jobs through the
//! [`JobExecutor`].

mod executor;
mod pool;

pub use executor::{ExecutorConfig, JobExecutor, MERGE_FADE_SECS, merged_key, normalized_key};
pub use pool::{WorkerPool, WorkerPoolConfig};
