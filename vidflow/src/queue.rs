//! FIFO job queue backed by a transient-store list.
//!
//! The queue carries job ids only; the record itself lives in the stores.
//! Producers push on the left and workers block-pop on the right, so ids
//! come out in enqueue order and each id is delivered to exactly one worker.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::Result;
use crate::store::{JOB_QUEUE_LIST, TransientStore};

/// Job queue configuration.
#[derive(Debug, Clone)]
pub struct JobQueueConfig {
    /// Depth at which enqueue starts logging warnings.
    pub warning_threshold: usize,
    /// Depth at which enqueue logs at critical level.
    pub critical_threshold: usize,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            warning_threshold: 100,
            critical_threshold: 500,
        }
    }
}

/// Queue depth status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueDepthStatus {
    Normal,
    Warning,
    Critical,
}

impl QueueDepthStatus {
    fn classify(depth: usize, config: &JobQueueConfig) -> Self {
        if depth >= config.critical_threshold {
            Self::Critical
        } else if depth >= config.warning_threshold {
            Self::Warning
        } else {
            Self::Normal
        }
    }
}

pub struct JobQueue {
    store: Arc<dyn TransientStore>,
    config: JobQueueConfig,
}

impl JobQueue {
    pub fn new(store: Arc<dyn TransientStore>) -> Self {
        Self::with_config(store, JobQueueConfig::default())
    }

    pub fn with_config(store: Arc<dyn TransientStore>, config: JobQueueConfig) -> Self {
        Self { store, config }
    }

    /// Append a job id to the tail of the queue.
    pub async fn enqueue(&self, job_id: &str) -> Result<()> {
        let depth = self.store.lpush(JOB_QUEUE_LIST, job_id.to_string()).await?;
        match QueueDepthStatus::classify(depth, &self.config) {
            QueueDepthStatus::Normal => debug!(job_id, depth, "Job enqueued"),
            QueueDepthStatus::Warning => {
                warn!(job_id, depth, "Job queue depth above warning threshold")
            }
            QueueDepthStatus::Critical => {
                warn!(job_id, depth, critical = true, "Job queue depth critical")
            }
        }
        Ok(())
    }

    /// Block up to `timeout` for the oldest job id. `None` on timeout.
    pub async fn dequeue(&self, timeout: Duration) -> Result<Option<String>> {
        self.store.brpop(JOB_QUEUE_LIST, timeout).await
    }

    pub async fn len(&self) -> Result<usize> {
        self.store.llen(JOB_QUEUE_LIST).await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    pub async fn depth_status(&self) -> Result<QueueDepthStatus> {
        Ok(QueueDepthStatus::classify(self.len().await?, &self.config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn queue_with(config: JobQueueConfig) -> JobQueue {
        JobQueue::with_config(Arc::new(MemoryStore::new()), config)
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = JobQueue::new(Arc::new(MemoryStore::new()));
        for id in ["a", "b", "c"] {
            queue.enqueue(id).await.unwrap();
        }
        assert_eq!(queue.len().await.unwrap(), 3);

        let timeout = Duration::from_millis(50);
        assert_eq!(queue.dequeue(timeout).await.unwrap().as_deref(), Some("a"));
        assert_eq!(queue.dequeue(timeout).await.unwrap().as_deref(), Some("b"));
        assert_eq!(queue.dequeue(timeout).await.unwrap().as_deref(), Some("c"));
        assert_eq!(queue.dequeue(timeout).await.unwrap(), None);
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_depth_status() {
        let queue = queue_with(JobQueueConfig {
            warning_threshold: 2,
            critical_threshold: 3,
        });
        assert_eq!(queue.depth_status().await.unwrap(), QueueDepthStatus::Normal);
        queue.enqueue("1").await.unwrap();
        queue.enqueue("2").await.unwrap();
        assert_eq!(queue.depth_status().await.unwrap(), QueueDepthStatus::Warning);
        queue.enqueue("3").await.unwrap();
        assert_eq!(queue.depth_status().await.unwrap(), QueueDepthStatus::Critical);
    }

    #[tokio::test]
    async fn test_competing_consumers_get_distinct_ids() {
        let queue = Arc::new(JobQueue::new(Arc::new(MemoryStore::new())));
        let mut consumers = Vec::new();
        for _ in 0..4 {
            let queue = queue.clone();
            consumers.push(tokio::spawn(async move {
                let mut got = Vec::new();
                while let Some(id) = queue.dequeue(Duration::from_millis(100)).await.unwrap() {
                    got.push(id);
                }
                got
            }));
        }
        for i in 0..40 {
            queue.enqueue(&i.to_string()).await.unwrap();
        }

        let mut all = Vec::new();
        for consumer in consumers {
            all.extend(consumer.await.unwrap());
        }
        all.sort_by_key(|id| id.parse::<u32>().unwrap());
        let expected: Vec<String> = (0..40).map(|i| i.to_string()).collect();
        assert_eq!(all, expected);
    }
}
