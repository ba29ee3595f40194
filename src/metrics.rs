//! Prometheus metrics for admission decisions.

use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::error::Result;

/// Hit, rejection and remaining-budget metrics.
///
/// Identifier labels are expected to be truncated by the caller (see
/// [`identity::label`](crate::identity::label)) to bound cardinality.
#[derive(Clone)]
pub struct RateLimitMetrics {
    registry: Registry,
    hits: IntCounterVec,
    rejections: IntCounterVec,
    remaining: IntGaugeVec,
}

impl RateLimitMetrics {
    /// Create the metrics and register them in a fresh registry.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let hits = IntCounterVec::new(
            Opts::new("rate_limit_hits_total", "Consume attempts per identifier and endpoint"),
            &["identifier", "endpoint"],
        )?;
        let rejections = IntCounterVec::new(
            Opts::new(
                "rate_limit_rejections_total",
                "Rejected consume attempts per identifier and endpoint",
            ),
            &["identifier", "endpoint"],
        )?;
        let remaining = IntGaugeVec::new(
            Opts::new("rate_limit_remaining", "Points left after the latest decision"),
            &["identifier"],
        )?;

        registry.register(Box::new(hits.clone()))?;
        registry.register(Box::new(rejections.clone()))?;
        registry.register(Box::new(remaining.clone()))?;

        Ok(Self {
            registry,
            hits,
            rejections,
            remaining,
        })
    }

    /// Record one decision.
    pub fn observe(&self, identifier: &str, endpoint: &str, allowed: bool, remaining: u32) {
        self.hits.with_label_values(&[identifier, endpoint]).inc();
        if !allowed {
            self.rejections.with_label_values(&[identifier, endpoint]).inc();
        }
        self.remaining
            .with_label_values(&[identifier])
            .set(remaining as i64);
    }

    /// Encode every metric in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    /// The underlying registry, for hosts that expose additional metrics.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn hits(&self, identifier: &str, endpoint: &str) -> u64 {
        self.hits.with_label_values(&[identifier, endpoint]).get()
    }

    pub fn rejections(&self, identifier: &str, endpoint: &str) -> u64 {
        self.rejections.with_label_values(&[identifier, endpoint]).get()
    }

    pub fn remaining(&self, identifier: &str) -> i64 {
        self.remaining.with_label_values(&[identifier]).get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_counts_hits_and_rejections() {
        let metrics = RateLimitMetrics::new().unwrap();

        metrics.observe("client", "/api", true, 4);
        metrics.observe("client", "/api", true, 3);
        metrics.observe("client", "/api", false, 0);

        assert_eq!(metrics.hits("client", "/api"), 3);
        assert_eq!(metrics.rejections("client", "/api"), 1);
        assert_eq!(metrics.remaining("client"), 0);
    }

    #[test]
    fn test_remaining_is_last_write_wins() {
        let metrics = RateLimitMetrics::new().unwrap();

        metrics.observe("client", "/a", true, 9);
        metrics.observe("client", "/b", true, 42);

        assert_eq!(metrics.remaining("client"), 42);
    }

    #[test]
    fn test_render_exposition() {
        let metrics = RateLimitMetrics::new().unwrap();
        metrics.observe("test-key", "login", false, 0);

        let text = metrics.render().unwrap();
        assert!(text.contains("rate_limit_hits_total{endpoint=\"login\",identifier=\"test-key\"} 1"));
        assert!(text.contains("rate_limit_rejections_total{endpoint=\"login\",identifier=\"test-key\"} 1"));
        assert!(text.contains("rate_limit_remaining{identifier=\"test-key\"} 0"));
    }
}
