//! Transient store: low-latency hashes and lists for in-flight state.
//!
//! Status-polling clients read `job:<id>` and `stream:<id>` hashes from here;
//! the job queue is a list in the same store. The durable history lives in
//! [`crate::database`].

mod memory;

pub use memory::MemoryStore;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::Result;

/// Name of the list backing the job queue.
pub const JOB_QUEUE_LIST: &str = "job_queue";

/// Hash key of a job record.
pub fn job_key(job_id: &str) -> String {
    format!("job:{job_id}")
}

/// Hash key of a stream entry.
pub fn stream_key(stream_id: &str) -> String {
    format!("stream:{stream_id}")
}

/// Key/value + hash + list store.
///
/// Lists follow push-left / pop-right semantics, so `lpush` followed by
/// `brpop` is FIFO.
#[async_trait]
pub trait TransientStore: Send + Sync {
    /// Merge `fields` into the hash at `key`, creating it if needed.
    async fn hset(&self, key: &str, fields: Vec<(String, String)>) -> Result<()>;

    /// Read one field of a hash.
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;

    /// Read a whole hash. Missing keys yield an empty map.
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Remove a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Push to the head of a list, returning the new length.
    async fn lpush(&self, list: &str, value: String) -> Result<usize>;

    /// Pop from the tail of a list, waiting up to `timeout` for an element.
    ///
    /// Each element is handed to exactly one caller.
    async fn brpop(&self, list: &str, timeout: Duration) -> Result<Option<String>>;

    /// Current length of a list.
    async fn llen(&self, list: &str) -> Result<usize>;
}
