//! In-process queue backend.
//!
//! Items live in a `VecDeque` per key; nothing survives the process.  A
//! shared [`Notify`] wakes blocked poppers on every push.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{DurableQueue, queue_key};
use crate::error::AppError;

pub struct MemoryQueue {
    namespace: String,
    queues: Mutex<HashMap<String, VecDeque<String>>>,
    pushed: Notify,
}

impl MemoryQueue {
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            queues: Mutex::new(HashMap::new()),
            pushed: Notify::new(),
        }
    }

    fn with_queues<T>(
        &self,
        f: impl FnOnce(&mut HashMap<String, VecDeque<String>>) -> T,
    ) -> Result<T, AppError> {
        let mut queues = self
            .queues
            .lock()
            .map_err(|_| AppError::Queue("memory queue lock poisoned".into()))?;
        Ok(f(&mut queues))
    }

    fn try_pop(&self, key: &str) -> Result<Option<String>, AppError> {
        self.with_queues(|q| q.get_mut(key).and_then(VecDeque::pop_front))
    }
}

#[async_trait]
impl DurableQueue for MemoryQueue {
    async fn push(&self, name: &str, item: &str) -> Result<(), AppError> {
        let key = queue_key(&self.namespace, name);
        self.with_queues(|q| q.entry(key).or_default().push_back(item.to_string()))?;
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn pop(
        &self,
        name: &str,
        block: bool,
        timeout: Option<Duration>,
    ) -> Result<Option<String>, AppError> {
        let key = queue_key(&self.namespace, name);
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            // Register interest before checking so a push between the check
            // and the await is not missed.
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.try_pop(&key)? {
                return Ok(Some(item));
            }
            if !block {
                return Ok(None);
            }
            match deadline {
                Some(d) => {
                    if tokio::time::timeout_at(d, notified).await.is_err() {
                        return Ok(None);
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn size(&self, name: &str) -> Result<usize, AppError> {
        let key = queue_key(&self.namespace, name);
        self.with_queues(|q| q.get(&key).map_or(0, VecDeque::len))
    }

    async fn drain_all(&self, name: &str) -> Result<Vec<String>, AppError> {
        let key = queue_key(&self.namespace, name);
        self.with_queues(|q| q.remove(&key).map(Vec::from).unwrap_or_default())
    }
}
