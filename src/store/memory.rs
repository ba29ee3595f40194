//! In-process store backend.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

use super::{now_millis, StoreBackend};
use crate::error::Result;
use crate::ratelimit::{apply, ConsumptionRecord, ConsumptionResult, Quota};

type Slot = Arc<Mutex<Option<ConsumptionRecord>>>;

/// Store backend keeping consumption records in process memory.
///
/// Each key has its own mutex, so consumes on one key are totally ordered
/// while unrelated keys never wait on each other. Budgets are not shared
/// between processes.
#[derive(Default)]
pub struct LocalStore {
    records: DashMap<String, Slot>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume `cost` points from `key` as of `now` (unix milliseconds).
    pub fn consume_at(&self, key: &str, cost: u32, quota: &Quota, now: i64) -> ConsumptionResult {
        // Clone the slot out so the map shard is not held while the key is locked
        let slot = self
            .records
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .value()
            .clone();

        let mut record = slot.lock();
        apply(&mut record, quota, cost, now)
    }

    /// Drop records whose window and penalty have both lapsed.
    ///
    /// Records currently being consumed are left alone. Returns the number of
    /// records removed.
    pub fn purge_expired(&self, now: i64) -> usize {
        let before = self.records.len();
        self.records.retain(|_, slot| {
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            match slot.try_lock() {
                Some(record) => record.map_or(false, |r| !r.is_expired(now)),
                None => true,
            }
        });
        let removed = before.saturating_sub(self.records.len());
        if removed > 0 {
            debug!(removed = removed, "Purged expired local records");
        }
        removed
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl StoreBackend for LocalStore {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn consume(&self, key: &str, cost: u32, quota: &Quota) -> Result<ConsumptionResult> {
        Ok(self.consume_at(key, cost, quota, now_millis()))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) {
        self.records.clear();
    }
}
