//! Rate limiting logic and limiter management.

mod key;
mod limiter;
mod preset;
mod record;
mod registry;

pub use key::ConsumptionKey;
pub use limiter::{Decision, RateLimiter};
pub use preset::{LimiterConfig, LimiterOptions, Preset, Quota, DEFAULT_KEY_PREFIX, MAX_DURATION_SECS};
pub use record::{apply, ConsumptionRecord, ConsumptionResult};
pub use registry::LimiterRegistry;
