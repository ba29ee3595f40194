//! Failover between the distributed store and the local store.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{now_millis, LocalStore, StoreBackend};
use crate::error::TollgateError;
use crate::ratelimit::{ConsumptionResult, Quota};

/// What to answer while the distributed store is unavailable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Keep enforcing budgets through the in-process store. Budgets are then
    /// per process rather than shared.
    #[default]
    LocalFallback,
    /// Admit every request.
    FailOpen,
    /// Reject every request until the store recovers.
    FailClosed,
}

impl std::fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailurePolicy::LocalFallback => "local_fallback",
            FailurePolicy::FailOpen => "fail_open",
            FailurePolicy::FailClosed => "fail_closed",
        };
        f.write_str(name)
    }
}

/// Store that prefers a distributed backend and degrades when it is
/// unreachable.
///
/// Availability transitions are logged once each way, never per request.
/// While degraded a single background probe pings the distributed backend
/// and restores it once it answers.
pub struct FailoverStore {
    distributed: Option<Arc<dyn StoreBackend>>,
    local: Arc<LocalStore>,
    policy: FailurePolicy,
    available: Arc<AtomicBool>,
    probing: Arc<AtomicBool>,
    recovery_interval: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl FailoverStore {
    /// A store that only ever uses process memory.
    pub fn local_only() -> Self {
        Self::new(None, FailurePolicy::LocalFallback, Duration::from_secs(5))
    }

    /// Create a failover store over an optional distributed backend.
    pub fn new(
        distributed: Option<Arc<dyn StoreBackend>>,
        policy: FailurePolicy,
        recovery_interval: Duration,
    ) -> Self {
        Self {
            distributed,
            local: Arc::new(LocalStore::new()),
            policy,
            available: Arc::new(AtomicBool::new(true)),
            probing: Arc::new(AtomicBool::new(false)),
            recovery_interval,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Check the distributed backend once, degrading if it does not answer.
    ///
    /// Returns whether the distributed backend is usable.
    pub async fn connect(&self) -> bool {
        let Some(distributed) = &self.distributed else {
            return false;
        };

        match distributed.ping().await {
            Ok(()) => {
                info!(backend = distributed.name(), policy = %self.policy, "Distributed store connected");
                true
            }
            Err(e) => {
                self.mark_unavailable(distributed, &e);
                false
            }
        }
    }

    /// Consume `cost` points from `key`.
    ///
    /// Never fails: backend errors are absorbed by the failure policy.
    pub async fn consume(&self, key: &str, cost: u32, quota: &Quota) -> ConsumptionResult {
        if let Some(distributed) = self.active() {
            match distributed.consume(key, cost, quota).await {
                Ok(result) => return result,
                Err(e) => self.mark_unavailable(distributed, &e),
            }
        }

        if self.distributed.is_none() {
            return self.local.consume_at(key, cost, quota, now_millis());
        }

        let now = now_millis();
        match self.policy {
            FailurePolicy::LocalFallback => self.local.consume_at(key, cost, quota, now),
            FailurePolicy::FailOpen => ConsumptionResult::open(quota, now),
            FailurePolicy::FailClosed => {
                ConsumptionResult::closed(quota, now, self.recovery_interval.as_millis() as i64)
            }
        }
    }

    /// Whether the distributed backend is configured and currently reachable.
    pub fn is_distributed(&self) -> bool {
        self.active().is_some()
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// The in-process store used when running local only or degraded.
    pub fn local(&self) -> &Arc<LocalStore> {
        &self.local
    }

    /// Periodically reclaim expired local records.
    pub fn start_sweeper(&self, interval: Duration) {
        let local = self.local.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                local.purge_expired(now_millis());
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Stop background tasks and release backend connections.
    pub async fn shutdown(&self) {
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }

        if let Some(distributed) = &self.distributed {
            distributed.shutdown().await;
        }
        self.local.shutdown().await;
        debug!("Store shut down");
    }

    fn active(&self) -> Option<&Arc<dyn StoreBackend>> {
        self.distributed
            .as_ref()
            .filter(|_| self.available.load(Ordering::Acquire))
    }

    fn mark_unavailable(&self, distributed: &Arc<dyn StoreBackend>, err: &TollgateError) {
        if self.available.swap(false, Ordering::AcqRel) {
            warn!(
                backend = distributed.name(),
                policy = %self.policy,
                error = %err,
                "Distributed store unavailable, degrading"
            );
        }
        self.spawn_probe(distributed.clone());
    }

    fn spawn_probe(&self, distributed: Arc<dyn StoreBackend>) {
        if self.probing.swap(true, Ordering::AcqRel) {
            return;
        }

        let available = self.available.clone();
        let probing = self.probing.clone();
        let interval = self.recovery_interval;

        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match distributed.ping().await {
                    Ok(()) => {
                        // Re-arm before publishing, so a failure right after
                        // recovery can start a new probe
                        probing.store(false, Ordering::Release);
                        available.store(true, Ordering::Release);
                        info!(backend = distributed.name(), "Distributed store recovered");
                        return;
                    }
                    Err(e) => {
                        debug!(backend = distributed.name(), error = %e, "Distributed store still unavailable");
                    }
                }
            }
        });

        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }
}
