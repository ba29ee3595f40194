//! Store key generation.

use super::preset::LimiterConfig;

/// The key under which a store tracks one identifier of one limiter.
///
/// Format: `{key_prefix}:{limiter_name}:{identifier}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsumptionKey(String);

impl ConsumptionKey {
    /// Create the key for `identifier` under the given limiter.
    pub fn new(config: &LimiterConfig, identifier: &str) -> Self {
        Self(format!(
            "{}:{}:{}",
            config.key_prefix(),
            config.name(),
            identifier
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConsumptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
