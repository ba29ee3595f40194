//! Store backends holding consumption records.
//!
//! [`RedisStore`] shares budgets across processes, [`LocalStore`] keeps them
//! in process memory, and [`FailoverStore`] routes between the two according
//! to a [`FailurePolicy`].

mod failover;
mod memory;
mod redis;

pub use failover::{FailoverStore, FailurePolicy};
pub use memory::LocalStore;
pub use self::redis::RedisStore;

#[cfg(test)]
pub(crate) use failover::tests::FlakyStore;

use async_trait::async_trait;

use crate::error::Result;
use crate::ratelimit::{ConsumptionResult, Quota};

/// Trait for store backends.
///
/// `consume` must evaluate the whole read-check-decrement-and-possibly-block
/// transition for a key as one atomic step.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Consume `cost` points from `key`.
    ///
    /// Fails with [`TollgateError::StoreUnavailable`](crate::error::TollgateError::StoreUnavailable)
    /// when the backend cannot be reached within its timeout.
    async fn consume(&self, key: &str, cost: u32, quota: &Quota) -> Result<ConsumptionResult>;

    /// Check that the backend is reachable.
    async fn ping(&self) -> Result<()>;

    /// Release connections held by the backend.
    async fn shutdown(&self);
}

/// Current unix time in milliseconds.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
