//! Identifier resolution for incoming requests.
//!
//! The identifier is the dimension budgets are tracked along. Resolution
//! order, first non-empty match wins:
//!
//! 1. a caller supplied key generator
//! 2. the `X-API-Key` header
//! 3. an `Authorization: Bearer` token
//! 4. the first hop of `X-Forwarded-For`
//! 5. the peer address of the connection
//! 6. the literal `anonymous`

use axum::extract::ConnectInfo;
use axum::http::{header, HeaderMap, Request};
use std::net::SocketAddr;
use std::sync::Arc;

/// Identifier used when nothing else identifies the caller.
pub const ANONYMOUS: &str = "anonymous";

/// Maximum number of characters of an identifier used as a metrics label.
pub const LABEL_MAX_CHARS: usize = 16;

const API_KEY_HEADER: &str = "x-api-key";
const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// The parts of a request identifier resolution looks at.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub headers: HeaderMap,
    pub peer_addr: Option<SocketAddr>,
}

impl RequestContext {
    pub fn new(headers: HeaderMap, peer_addr: Option<SocketAddr>) -> Self {
        Self { headers, peer_addr }
    }

    /// Capture the context of an HTTP request, including the peer address
    /// when the server was started with connect info.
    pub fn from_request<B>(req: &Request<B>) -> Self {
        Self {
            headers: req.headers().clone(),
            peer_addr: req
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| *addr),
        }
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }
}

/// Caller supplied identifier derivation. Returning `None` (or an empty
/// string) defers to the built-in resolution order.
pub type KeyGenerator = Arc<dyn Fn(&RequestContext) -> Option<String> + Send + Sync>;

/// Resolves the rate limit identifier of a request.
#[derive(Clone, Default)]
pub struct IdentifierResolver {
    key_generator: Option<KeyGenerator>,
}

impl IdentifierResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `generator` ahead of every built-in source.
    pub fn with_key_generator<F>(mut self, generator: F) -> Self
    where
        F: Fn(&RequestContext) -> Option<String> + Send + Sync + 'static,
    {
        self.key_generator = Some(Arc::new(generator));
        self
    }

    /// Resolve the identifier. Always returns a non-empty string.
    pub fn resolve(&self, ctx: &RequestContext) -> String {
        if let Some(generated) = self
            .key_generator
            .as_ref()
            .and_then(|generate| generate(ctx))
            .filter(|id| !id.trim().is_empty())
        {
            return generated;
        }

        if let Some(api_key) = ctx.header(API_KEY_HEADER) {
            return api_key.to_string();
        }

        if let Some(token) = ctx
            .header(header::AUTHORIZATION.as_str())
            .and_then(bearer_token)
        {
            return token.to_string();
        }

        if let Some(first_hop) = ctx
            .header(FORWARDED_FOR_HEADER)
            .and_then(|chain| chain.split(',').next())
            .map(str::trim)
            .filter(|hop| !hop.is_empty())
        {
            return first_hop.to_string();
        }

        if let Some(addr) = ctx.peer_addr {
            return addr.ip().to_string();
        }

        ANONYMOUS.to_string()
    }
}

impl std::fmt::Debug for IdentifierResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentifierResolver")
            .field("key_generator", &self.key_generator.is_some())
            .finish()
    }
}

fn bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

/// Truncate an identifier for use as a metrics label.
pub fn label(identifier: &str) -> &str {
    match identifier.char_indices().nth(LABEL_MAX_CHARS) {
        Some((idx, _)) => &identifier[..idx],
        None => identifier,
    }
}
