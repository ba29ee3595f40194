//! Protocol adapters turning decisions into framework responses.
//!
//! [`RateLimitLayer`] is chain-style tower middleware; [`RateLimitHook`]
//! hands the same decision back to a host framework's lifecycle callback.

mod hook;
mod layer;
mod response;

pub use hook::{HookOutcome, RateLimitHook};
pub use layer::{RateLimitLayer, RateLimitMiddleware};
pub use response::{
    apply_headers, header_pairs, RejectionBody, REJECTION_STATUS, X_RATELIMIT_LIMIT,
    X_RATELIMIT_REMAINING, X_RATELIMIT_RESET,
};
