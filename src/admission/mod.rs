pub mod quality;
pub mod rate_limit;

pub use quality::NetworkQualityGate;
pub use rate_limit::{BucketState, BucketStore, Decision, RateLimiter};

use crate::config::{AdmissionConfig, NetworkQualityConfig, RateLimitRule};
use http::HeaderMap;
use std::net::IpAddr;
use std::sync::Arc;

/// Header/429 fields for the enforced rule closest to exhaustion.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitInfo {
    pub limit: u64,
    pub remaining: u64,
    pub reset_secs: u64,
    pub retry_after_secs: u64,
}

impl From<Decision> for RateLimitInfo {
    fn from(d: Decision) -> Self {
        Self {
            limit: d.limit,
            remaining: d.remaining,
            reset_secs: d.reset_secs,
            retry_after_secs: d.retry_after_secs,
        }
    }
}

/// Verdict of the admission layer for one request.
pub enum AdmissionOutcome {
    /// Admitted. Carries limit headers when at least one rule applied.
    Allowed(Option<RateLimitInfo>),
    RateLimited(RateLimitInfo),
    PoorQuality(String),
}

/// Request admission: rate limiting across the configured scopes plus the
/// network-quality gate. Built once at startup; all per-request state lives
/// in the limiter's bucket maps.
pub struct AdmissionLayer {
    config: AdmissionConfig,
    quality: NetworkQualityConfig,
    limiter: Arc<RateLimiter>,
}

impl AdmissionLayer {
    pub fn new(config: AdmissionConfig, quality: NetworkQualityConfig) -> Self {
        let limiter = Arc::new(RateLimiter::new(config.max_buckets));
        Self {
            config,
            quality,
            limiter,
        }
    }

    /// Swap in an external bucket store (spec hook).
    pub fn with_store(mut self, store: Arc<dyn BucketStore>) -> Self {
        let limiter = RateLimiter::new(self.config.max_buckets).with_store(store);
        self.limiter = Arc::new(limiter);
        self
    }

    /// Start background bucket eviction.
    pub fn start_gc(&self) {
        self.limiter.start_gc();
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Evaluate every applicable rule for this request. Excluded paths and
    /// per-route overrides are resolved before any bucket is touched.
    pub fn admit(
        &self,
        client_ip: IpAddr,
        path: &str,
        route_pattern: Option<&str>,
        headers: &HeaderMap,
    ) -> AdmissionOutcome {
        if let Err(reason) = NetworkQualityGate::evaluate(&self.quality, headers) {
            metrics::counter!("edge_admission_rejected_total", "reason" => "network_quality")
                .increment(1);
            return AdmissionOutcome::PoorQuality(reason);
        }

        if self
            .config
            .excluded_paths
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
        {
            return AdmissionOutcome::Allowed(None);
        }

        let mut tightest: Option<RateLimitInfo> = None;

        for rule in &self.config.rules {
            let key = match self.rule_key(rule, client_ip, route_pattern, headers) {
                Some(k) => k,
                None => continue,
            };

            let decision = self.limiter.check(rule, &key);
            if !decision.allowed {
                metrics::counter!(
                    "edge_admission_rejected_total",
                    "reason" => "rate_limit",
                    "scope" => rule.scope.clone(),
                )
                .increment(1);
                return AdmissionOutcome::RateLimited(decision.into());
            }

            match tightest {
                Some(info) if info.remaining <= decision.remaining => {}
                _ => tightest = Some(decision.into()),
            }
        }

        AdmissionOutcome::Allowed(tightest)
    }

    /// Resolve the bucket key for a rule, or `None` when the rule does not
    /// apply to this request.
    fn rule_key(
        &self,
        rule: &RateLimitRule,
        client_ip: IpAddr,
        route_pattern: Option<&str>,
        headers: &HeaderMap,
    ) -> Option<String> {
        match rule.scope.as_str() {
            "global" => Some("global".to_string()),
            "per_ip" => Some(format!("ip:{}", client_ip)),
            "per_user" => {
                // Absent user header falls back to the per-IP key.
                let user = self
                    .config
                    .user_header
                    .as_deref()
                    .and_then(|name| headers.get(name))
                    .and_then(|v| v.to_str().ok());
                match user {
                    Some(u) => Some(format!("user:{}", u)),
                    None => Some(format!("ip:{}", client_ip)),
                }
            }
            "per_route" => {
                let bound = rule.route.as_deref()?;
                let matched = route_pattern?;
                if bound == matched {
                    Some(format!("route:{}", bound))
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}
