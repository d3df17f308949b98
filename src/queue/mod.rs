//! Durable queue — named FIFO channels shared by producers and the worker.
//!
//! The dispatcher only ever talks to [`DurableQueue`], so the backing store
//! is swappable:
//!
//! - [`sqlite::SqliteQueue`] — one table in an embedded database, survives
//!   restarts, can be shared by several processes on the same host.
//! - [`memory::MemoryQueue`] — in-process only, for tests and embedding.
//!
//! Delivery semantics: a popped item is removed immediately.  There is no
//! acknowledgment and no redelivery, so a crash after `pop` loses the item.
//! Several consumers on one queue name split the items between them.

pub mod memory;
pub mod sqlite;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{QueueBackend, QueueConfig};
use crate::error::AppError;

#[async_trait]
pub trait DurableQueue: Send + Sync {
    /// Append `item` to the tail of `name`; returns once recorded.
    async fn push(&self, name: &str, item: &str) -> Result<(), AppError>;

    /// Remove and return the head of `name`.
    ///
    /// With `block`, waits for an item when the queue is empty; `timeout`
    /// bounds the wait (`None` waits indefinitely) and an elapsed timeout
    /// yields `Ok(None)`.  Without `block`, returns immediately.
    async fn pop(
        &self,
        name: &str,
        block: bool,
        timeout: Option<Duration>,
    ) -> Result<Option<String>, AppError>;

    async fn size(&self, name: &str) -> Result<usize, AppError>;

    /// Remove and return every queued item, oldest first, without waiting.
    async fn drain_all(&self, name: &str) -> Result<Vec<String>, AppError>;
}

/// Storage key for a queue name, `"<namespace>:<name>"`.
pub fn queue_key(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{namespace}:{name}")
    }
}

/// Open the backend selected by `[queue].backend`.
pub fn open(config: &QueueConfig) -> Result<Arc<dyn DurableQueue>, AppError> {
    Ok(match config.backend {
        QueueBackend::Sqlite => Arc::new(sqlite::SqliteQueue::open(
            &config.path,
            &config.namespace,
            config.poll_interval,
        )?),
        QueueBackend::Memory => Arc::new(memory::MemoryQueue::new(&config.namespace)),
    })
}
