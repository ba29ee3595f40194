//! Envoy rate limit service backed by the limiter registry.
//!
//! The request domain names the limiter and the descriptor entries, joined
//! as `key=value,...`, form the identifier. A descriptor carrying a limit
//! override is served by a derived limiter that keeps the base limiter's
//! penalty and key prefix. The number of derived limiters is capped; an
//! override beyond the cap is answered with `RESOURCE_EXHAUSTED`.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tonic::{Request, Response, Status};
use tracing::{debug, info, instrument, warn};

use super::proto::envoy::config::core::v3::HeaderValue;
use super::proto::envoy::extensions::common::ratelimit::v3::rate_limit_descriptor::RateLimitOverride;
use super::proto::envoy::extensions::common::ratelimit::v3::{RateLimitDescriptor, RateLimitUnit};
use super::proto::envoy::service::ratelimit::v3::{
    rate_limit_response::{rate_limit::Unit, Code, DescriptorStatus, RateLimit},
    rate_limit_service_server::RateLimitService,
    RateLimitRequest, RateLimitResponse,
};

use crate::adapter::{header_pairs, RejectionBody};
use crate::identity::ANONYMOUS;
use crate::ratelimit::{Decision, LimiterOptions, LimiterRegistry, RateLimiter};

/// Default cap on limiters derived from descriptor overrides.
pub const DEFAULT_MAX_DERIVED_LIMITERS: usize = 256;

/// Implementation of the Envoy RateLimitService gRPC interface.
pub struct RateLimitServiceImpl {
    /// The registry holding the configured limiters
    registry: Arc<LimiterRegistry>,
    /// Names of limiters created for descriptor overrides
    derived: Mutex<HashSet<String>>,
    max_derived: usize,
}

impl RateLimitServiceImpl {
    /// Create a new RateLimitServiceImpl over the given registry.
    pub fn new(registry: Arc<LimiterRegistry>) -> Self {
        Self {
            registry,
            derived: Mutex::new(HashSet::new()),
            max_derived: DEFAULT_MAX_DERIVED_LIMITERS,
        }
    }

    /// Limit how many distinct overrides get their own limiter.
    pub fn with_max_derived_limiters(mut self, max: usize) -> Self {
        self.max_derived = max;
        self
    }

    /// Resolve the limiter serving a descriptor.
    async fn limiter_for(
        &self,
        base: &Arc<RateLimiter>,
        descriptor: &RateLimitDescriptor,
    ) -> Result<Arc<RateLimiter>, Status> {
        let Some(limit) = &descriptor.limit else {
            return Ok(base.clone());
        };

        let (unit_name, unit_secs) = override_unit(limit)?;
        let name = format!("{}:{}/{}", base.name(), limit.requests_per_unit, unit_name);

        {
            let mut derived = self.derived.lock();
            if !derived.contains(&name) {
                if derived.len() >= self.max_derived {
                    warn!(limiter = %name, max = self.max_derived, "Too many derived limiters");
                    return Err(Status::resource_exhausted(format!(
                        "no room for override limiter '{}'",
                        name
                    )));
                }
                derived.insert(name.clone());
            }
        }

        let options = LimiterOptions::new()
            .points(limit.requests_per_unit as i64)
            .duration_secs(unit_secs)
            .block_duration_secs(base.config().block_duration_secs() as i64)
            .key_prefix(base.config().key_prefix());

        self.registry.create(&name, options).await.map_err(|e| {
            self.derived.lock().remove(&name);
            Status::invalid_argument(e.to_string())
        })
    }
}

/// Identifier of a descriptor: its entries as `key=value`, comma separated.
fn descriptor_identifier(descriptor: &RateLimitDescriptor) -> String {
    if descriptor.entries.is_empty() {
        return ANONYMOUS.to_string();
    }
    descriptor
        .entries
        .iter()
        .map(|e| format!("{}={}", e.key, e.value))
        .collect::<Vec<_>>()
        .join(",")
}

fn override_unit(limit: &RateLimitOverride) -> Result<(&'static str, i64), Status> {
    match RateLimitUnit::try_from(limit.unit) {
        Ok(RateLimitUnit::Second) => Ok(("second", 1)),
        Ok(RateLimitUnit::Minute) => Ok(("minute", 60)),
        Ok(RateLimitUnit::Hour) => Ok(("hour", 3_600)),
        Ok(RateLimitUnit::Day) => Ok(("day", 86_400)),
        Ok(RateLimitUnit::Week) => Ok(("week", 604_800)),
        Ok(RateLimitUnit::Month) => Ok(("month", 2_592_000)),
        Ok(RateLimitUnit::Year) => Ok(("year", 31_536_000)),
        Ok(RateLimitUnit::Unknown) | Err(_) => Err(Status::invalid_argument(format!(
            "unsupported rate limit unit {}",
            limit.unit
        ))),
    }
}

/// Envoy unit for a window length; windows that are not a whole unit report
/// `UNKNOWN`.
fn window_unit(duration_secs: u64) -> Unit {
    match duration_secs {
        1 => Unit::Second,
        60 => Unit::Minute,
        3_600 => Unit::Hour,
        86_400 => Unit::Day,
        604_800 => Unit::Week,
        _ => Unit::Unknown,
    }
}

fn descriptor_status(limiter: &RateLimiter, decision: &Decision) -> DescriptorStatus {
    let code = if decision.is_allowed() {
        Code::Ok
    } else {
        Code::OverLimit
    };

    let until_reset = match decision {
        Decision::Rejected { retry_after, .. } => *retry_after,
        Decision::Allowed { reset_at, .. } => (*reset_at - chrono::Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO),
    };

    DescriptorStatus {
        code: code.into(),
        current_limit: Some(RateLimit {
            name: limiter.name().to_string(),
            requests_per_unit: limiter.config().points(),
            unit: window_unit(limiter.config().duration_secs()).into(),
        }),
        limit_remaining: decision.remaining(),
        duration_until_reset: Some(prost_types::Duration {
            seconds: until_reset.as_secs() as i64,
            nanos: until_reset.subsec_nanos() as i32,
        }),
    }
}

/// Whether `candidate` should replace `current` as the decision whose headers
/// are returned: any rejection beats an admission, otherwise the smaller
/// remaining budget wins.
fn more_restrictive(candidate: &Decision, current: &Decision) -> bool {
    match (candidate.is_allowed(), current.is_allowed()) {
        (false, true) => true,
        (true, false) => false,
        _ => candidate.remaining() < current.remaining(),
    }
}

#[tonic::async_trait]
impl RateLimitService for RateLimitServiceImpl {
    /// Determine whether rate limiting should take place.
    ///
    /// Each descriptor consumes `hits_addend` points (1 when unset) from the
    /// limiter named by the domain.
    #[instrument(
        skip(self, request),
        fields(
            domain = %request.get_ref().domain,
            descriptor_count = request.get_ref().descriptors.len(),
            hits_addend = request.get_ref().hits_addend
        )
    )]
    async fn should_rate_limit(
        &self,
        request: Request<RateLimitRequest>,
    ) -> Result<Response<RateLimitResponse>, Status> {
        let req = request.into_inner();

        debug!(
            domain = %req.domain,
            descriptors = ?req.descriptors,
            hits_addend = req.hits_addend,
            "Processing rate limit request"
        );

        // Validate the request
        if req.domain.is_empty() {
            warn!("Received rate limit request with empty domain");
            return Err(Status::invalid_argument("domain is required"));
        }

        if req.descriptors.is_empty() {
            warn!("Received rate limit request with no descriptors");
            return Err(Status::invalid_argument("at least one descriptor is required"));
        }

        let Some(base) = self.registry.get(&req.domain) else {
            warn!(domain = %req.domain, "Received rate limit request for unknown limiter");
            return Err(Status::not_found(format!("no limiter named '{}'", req.domain)));
        };

        // Get the number of hits to add (default to 1 if not specified)
        let hits = if req.hits_addend == 0 { 1 } else { req.hits_addend };

        let mut statuses = Vec::with_capacity(req.descriptors.len());
        let mut overall_code = Code::Ok;
        let mut headline: Option<(Arc<RateLimiter>, Decision)> = None;

        // Resolve every descriptor before spending any points
        let mut limiters = Vec::with_capacity(req.descriptors.len());
        for descriptor in &req.descriptors {
            limiters.push(self.limiter_for(&base, descriptor).await?);
        }

        for (descriptor, limiter) in req.descriptors.iter().zip(limiters) {
            let identifier = descriptor_identifier(descriptor);
            let decision = limiter.consume_for(&identifier, &req.domain, hits).await;

            // If any descriptor is over limit, the overall response is over limit
            if !decision.is_allowed() {
                overall_code = Code::OverLimit;
            }

            statuses.push(descriptor_status(&limiter, &decision));

            let replace = match &headline {
                Some((_, current)) => more_restrictive(&decision, current),
                None => true,
            };
            if replace {
                headline = Some((limiter, decision));
            }
        }

        let (response_headers_to_add, raw_body) = match &headline {
            Some((limiter, decision)) => {
                let headers = header_pairs(decision)
                    .into_iter()
                    .map(|(name, value)| HeaderValue {
                        key: name.as_str().to_string(),
                        value,
                    })
                    .collect();
                let body = if decision.is_allowed() {
                    Vec::new()
                } else {
                    serde_json::to_vec(&RejectionBody::new(limiter, decision)).unwrap_or_default()
                };
                (headers, body)
            }
            None => (Vec::new(), Vec::new()),
        };

        let response = RateLimitResponse {
            overall_code: overall_code.into(),
            statuses,
            response_headers_to_add,
            request_headers_to_add: Vec::new(),
            raw_body,
        };

        info!(
            domain = %req.domain,
            overall_code = ?overall_code,
            "Rate limit decision made"
        );

        Ok(Response::new(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grpc::proto::envoy::extensions::common::ratelimit::v3::rate_limit_descriptor::Entry;
    use crate::metrics::RateLimitMetrics;

    async fn service(points: i64) -> RateLimitServiceImpl {
        let registry = Arc::new(LimiterRegistry::local(RateLimitMetrics::new().unwrap()));
        registry
            .create("edge", LimiterOptions::new().points(points).duration_secs(60))
            .await
            .unwrap();
        RateLimitServiceImpl::new(registry)
    }

    fn descriptor(key: &str, value: &str) -> RateLimitDescriptor {
        RateLimitDescriptor {
            entries: vec![Entry {
                key: key.to_string(),
                value: value.to_string(),
            }],
            limit: None,
        }
    }

    fn request(domain: &str, descriptors: Vec<RateLimitDescriptor>) -> Request<RateLimitRequest> {
        Request::new(RateLimitRequest {
            domain: domain.to_string(),
            descriptors,
            hits_addend: 0,
        })
    }

    fn header<'a>(response: &'a RateLimitResponse, key: &str) -> Option<&'a str> {
        response
            .response_headers_to_add
            .iter()
            .find(|h| h.key == key)
            .map(|h| h.value.as_str())
    }

    #[tokio::test]
    async fn test_empty_domain_rejected() {
        let service = service(10).await;
        let result = service
            .should_rate_limit(request("", vec![descriptor("test", "value")]))
            .await;

        assert_eq!(result.unwrap_err().code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_empty_descriptors_rejected() {
        let service = service(10).await;
        let result = service.should_rate_limit(request("edge", vec![])).await;

        assert_eq!(result.unwrap_err().code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_unknown_domain_not_found() {
        let service = service(10).await;
        let result = service
            .should_rate_limit(request("missing", vec![descriptor("k", "v")]))
            .await;

        assert_eq!(result.unwrap_err().code(), tonic::Code::NotFound);
    }

    #[tokio::test]
    async fn test_valid_request_returns_ok() {
        let service = service(10).await;
        let response = service
            .should_rate_limit(request("edge", vec![descriptor("api_key", "test-key")]))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(response.overall_code, i32::from(Code::Ok));
        assert_eq!(response.statuses.len(), 1);

        let status = &response.statuses[0];
        assert_eq!(status.limit_remaining, 9);
        let limit = status.current_limit.as_ref().unwrap();
        assert_eq!(limit.requests_per_unit, 10);
        assert_eq!(limit.unit, i32::from(Unit::Minute));

        assert_eq!(header(&response, "x-ratelimit-remaining"), Some("9"));
        assert!(response.raw_body.is_empty());
    }

    #[tokio::test]
    async fn test_over_limit_after_budget() {
        let service = service(2).await;

        for _ in 0..2 {
            let response = service
                .should_rate_limit(request("edge", vec![descriptor("api_key", "test-key")]))
                .await
                .unwrap()
                .into_inner();
            assert_eq!(response.overall_code, i32::from(Code::Ok));
        }

        let response = service
            .should_rate_limit(request("edge", vec![descriptor("api_key", "test-key")]))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(response.overall_code, i32::from(Code::OverLimit));
        assert_eq!(response.statuses[0].code, i32::from(Code::OverLimit));
        assert!(header(&response, "retry-after").is_some());

        let body: RejectionBody = serde_json::from_slice(&response.raw_body).unwrap();
        assert_eq!(body.limit, 2);
    }

    #[tokio::test]
    async fn test_hits_addend_consumes_multiple_points() {
        let service = service(10).await;
        let mut req = request("edge", vec![descriptor("api_key", "bulk")]);
        req.get_mut().hits_addend = 4;

        let response = service.should_rate_limit(req).await.unwrap().into_inner();
        assert_eq!(response.statuses[0].limit_remaining, 6);
    }

    #[tokio::test]
    async fn test_any_over_limit_descriptor_fails_request() {
        let service = service(1).await;
        service
            .should_rate_limit(request("edge", vec![descriptor("user", "a")]))
            .await
            .unwrap();

        let response = service
            .should_rate_limit(request(
                "edge",
                vec![descriptor("user", "b"), descriptor("user", "a")],
            ))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(response.overall_code, i32::from(Code::OverLimit));
        assert_eq!(response.statuses[0].code, i32::from(Code::Ok));
        assert_eq!(response.statuses[1].code, i32::from(Code::OverLimit));
        assert_eq!(header(&response, "x-ratelimit-remaining"), Some("0"));
    }

    #[tokio::test]
    async fn test_descriptor_override_uses_derived_limiter() {
        let service = service(100).await;
        let mut overridden = descriptor("api_key", "limited");
        overridden.limit = Some(RateLimitOverride {
            requests_per_unit: 1,
            unit: RateLimitUnit::Second.into(),
        });

        let first = service
            .should_rate_limit(request("edge", vec![overridden.clone()]))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(first.overall_code, i32::from(Code::Ok));
        let limit = first.statuses[0].current_limit.as_ref().unwrap();
        assert_eq!(limit.requests_per_unit, 1);
        assert_eq!(limit.unit, i32::from(Unit::Second));

        let second = service
            .should_rate_limit(request("edge", vec![overridden]))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(second.overall_code, i32::from(Code::OverLimit));

        assert!(service.registry.get("edge:1/second").is_some());
    }

    #[tokio::test]
    async fn test_unknown_override_unit_rejected() {
        let service = service(100).await;
        let mut overridden = descriptor("api_key", "limited");
        overridden.limit = Some(RateLimitOverride {
            requests_per_unit: 5,
            unit: RateLimitUnit::Unknown.into(),
        });

        let result = service.should_rate_limit(request("edge", vec![overridden])).await;
        assert_eq!(result.unwrap_err().code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_invalid_override_spends_nothing() {
        let service = service(1).await;
        let mut invalid = descriptor("user", "b");
        invalid.limit = Some(RateLimitOverride {
            requests_per_unit: 5,
            unit: RateLimitUnit::Unknown.into(),
        });

        let result = service
            .should_rate_limit(request("edge", vec![descriptor("user", "a"), invalid]))
            .await;
        assert_eq!(result.unwrap_err().code(), tonic::Code::InvalidArgument);

        let edge = service.registry.get("edge").unwrap();
        assert!(edge.consume("user=a", 1).await.is_allowed());
    }

    #[tokio::test]
    async fn test_derived_limiters_are_capped() {
        let service = service(100).await.with_max_derived_limiters(1);
        let with_limit = |requests_per_unit| {
            let mut d = descriptor("api_key", "limited");
            d.limit = Some(RateLimitOverride {
                requests_per_unit,
                unit: RateLimitUnit::Minute.into(),
            });
            d
        };

        let first = service
            .should_rate_limit(request("edge", vec![with_limit(10)]))
            .await;
        assert!(first.is_ok());

        let second = service
            .should_rate_limit(request("edge", vec![with_limit(20)]))
            .await;
        assert_eq!(second.unwrap_err().code(), tonic::Code::ResourceExhausted);
        assert!(service.registry.get("edge:20/minute").is_none());

        // An override that already has a limiter keeps working
        let again = service
            .should_rate_limit(request("edge", vec![with_limit(10)]))
            .await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn test_rejected_override_frees_its_slot() {
        let service = service(100).await.with_max_derived_limiters(1);
        let mut zero = descriptor("api_key", "limited");
        zero.limit = Some(RateLimitOverride {
            requests_per_unit: 0,
            unit: RateLimitUnit::Minute.into(),
        });
        let result = service.should_rate_limit(request("edge", vec![zero])).await;
        assert_eq!(result.unwrap_err().code(), tonic::Code::InvalidArgument);

        let mut valid = descriptor("api_key", "limited");
        valid.limit = Some(RateLimitOverride {
            requests_per_unit: 3,
            unit: RateLimitUnit::Minute.into(),
        });
        assert!(service.should_rate_limit(request("edge", vec![valid])).await.is_ok());
    }

    #[test]
    fn test_descriptor_identifier() {
        let descriptor = RateLimitDescriptor {
            entries: vec![
                Entry {
                    key: "source".to_string(),
                    value: "client_a".to_string(),
                },
                Entry {
                    key: "path".to_string(),
                    value: "/login".to_string(),
                },
            ],
            limit: None,
        };
        assert_eq!(descriptor_identifier(&descriptor), "source=client_a,path=/login");

        let empty = RateLimitDescriptor {
            entries: vec![],
            limit: None,
        };
        assert_eq!(descriptor_identifier(&empty), ANONYMOUS);
    }
}
