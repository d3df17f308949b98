//! Bounded cache of open entity indexes, keyed by store id.
//!
//! Least recently used entries are dropped once `capacity` is exceeded.
//! Callers evict a store before rebuilding it so stale connections and
//! vocabularies are never served.
//!
//! Indexes are handed out as [`SharedIndex`] so lookups can run on the
//! blocking pool while the cache keeps its entry.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use super::EntityIndex;
use crate::error::AppError;

pub type SharedIndex = Arc<Mutex<EntityIndex>>;

/// Lock a shared index, mapping a poisoned lock to an index error.
pub fn lock(index: &SharedIndex) -> Result<MutexGuard<'_, EntityIndex>, AppError> {
    index
        .lock()
        .map_err(|_| AppError::Index("entity index lock poisoned".into()))
}

struct CachedIndex {
    index: SharedIndex,
    last_used: u64,
}

pub struct IndexCache {
    capacity: usize,
    case_insensitive: bool,
    entries: HashMap<String, CachedIndex>,
    tick: u64,
}

impl IndexCache {
    pub fn new(capacity: usize, case_insensitive: bool) -> Self {
        Self {
            capacity: capacity.max(1),
            case_insensitive,
            entries: HashMap::new(),
            tick: 0,
        }
    }

    /// The cached index for `store_id`, opening it from `dir` on a miss.
    pub async fn get_or_open(&mut self, store_id: &str, dir: &Path) -> Result<SharedIndex, AppError> {
        self.tick += 1;
        let tick = self.tick;

        if let Some(entry) = self.entries.get_mut(store_id) {
            entry.last_used = tick;
            return Ok(Arc::clone(&entry.index));
        }

        let dir = dir.to_path_buf();
        let case_insensitive = self.case_insensitive;
        let index = tokio::task::spawn_blocking(move || EntityIndex::open(&dir, case_insensitive))
            .await
            .map_err(|e| AppError::Index(format!("open index join: {e}")))??;
        let index = Arc::new(Mutex::new(index));

        if self.entries.len() >= self.capacity {
            self.evict_oldest();
        }
        self.entries.insert(
            store_id.to_string(),
            CachedIndex { index: Arc::clone(&index), last_used: tick },
        );
        debug!(%store_id, "index cache: opened");
        Ok(index)
    }

    /// Drop the cached index for `store_id`; returns whether one was held.
    pub fn evict(&mut self, store_id: &str) -> bool {
        let removed = self.entries.remove(store_id).is_some();
        if removed {
            debug!(%store_id, "index cache: evicted");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, store_id: &str) -> bool {
        self.entries.contains_key(store_id)
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.last_used)
            .map(|(id, _)| id.clone());
        if let Some(id) = oldest {
            self.entries.remove(&id);
            debug!(store_id = %id, "index cache: dropped least recently used");
        }
    }
}
