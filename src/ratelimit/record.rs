//! Per-key consumption state and the fixed-window-with-penalty algorithm.
//!
//! The same transition is evaluated by the local store in process and by the
//! Redis store inside a Lua script; both must agree on every edge case.

use super::preset::Quota;

/// State kept by a store for one consumption key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumptionRecord {
    /// Points left in the current window
    pub remaining_points: u32,
    /// Unix time in milliseconds at which the window ends
    pub window_expires_at: i64,
    /// Unix time in milliseconds until which every consume is rejected
    pub blocked_until: Option<i64>,
}

impl ConsumptionRecord {
    fn fresh(quota: &Quota, now: i64) -> Self {
        Self {
            remaining_points: quota.points,
            window_expires_at: now.saturating_add(quota.duration_ms),
            blocked_until: None,
        }
    }

    /// Whether the record is blocked at `now`.
    pub fn is_blocked(&self, now: i64) -> bool {
        matches!(self.blocked_until, Some(until) if now < until)
    }

    /// Whether both the window and any penalty have lapsed, so the record can
    /// be reclaimed.
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.window_expires_at && !self.is_blocked(now)
    }
}

/// Outcome of a single consume against a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumptionResult {
    /// Whether the request is admitted
    pub allowed: bool,
    /// Points left in the window after this request
    pub remaining_points: u32,
    /// Milliseconds until the window resets (allowed) or until a retry can
    /// succeed (rejected)
    pub ms_before_next: i64,
    /// Configured budget per window
    pub limit: u32,
    /// Unix time in milliseconds of the next reset
    pub reset_at_ms: i64,
}

impl ConsumptionResult {
    /// An admission granted without consulting any store, reporting a full
    /// budget.
    pub fn open(quota: &Quota, now: i64) -> Self {
        Self {
            allowed: true,
            remaining_points: quota.points,
            ms_before_next: quota.duration_ms,
            limit: quota.points,
            reset_at_ms: now.saturating_add(quota.duration_ms),
        }
    }

    /// A rejection issued without consulting any store.
    pub fn closed(quota: &Quota, now: i64, retry_after_ms: i64) -> Self {
        Self {
            allowed: false,
            remaining_points: 0,
            ms_before_next: retry_after_ms,
            limit: quota.points,
            reset_at_ms: now.saturating_add(retry_after_ms),
        }
    }
}

/// Apply one consume of `cost` points to the record in `slot` at time `now`.
///
/// `slot` is `None` for a key that has never been seen (or has been
/// reclaimed); it is always `Some` afterwards.
pub fn apply(
    slot: &mut Option<ConsumptionRecord>,
    quota: &Quota,
    cost: u32,
    now: i64,
) -> ConsumptionResult {
    if slot.map_or(true, |record| record.is_expired(now)) {
        *slot = Some(ConsumptionRecord::fresh(quota, now));
    }
    let record = slot.get_or_insert_with(|| ConsumptionRecord::fresh(quota, now));

    if let Some(until) = record.blocked_until.filter(|until| now < *until) {
        return ConsumptionResult {
            allowed: false,
            remaining_points: 0,
            ms_before_next: until - now,
            limit: quota.points,
            reset_at_ms: until,
        };
    }

    if record.remaining_points >= cost {
        record.remaining_points -= cost;
        return ConsumptionResult {
            allowed: true,
            remaining_points: record.remaining_points,
            ms_before_next: record.window_expires_at - now,
            limit: quota.points,
            reset_at_ms: record.window_expires_at,
        };
    }

    // Budget exhausted while the window is still active
    let reset_at_ms = if quota.block_ms > 0 {
        let until = now.saturating_add(quota.block_ms);
        record.blocked_until = Some(until);
        until
    } else {
        record.window_expires_at
    };

    ConsumptionResult {
        allowed: false,
        remaining_points: record.remaining_points,
        ms_before_next: reset_at_ms - now,
        limit: quota.points,
        reset_at_ms,
    }
}
