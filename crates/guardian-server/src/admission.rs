//! Admission control.
//!
//! Wraps an [`AdmissionStore`] with the per-route-class limits, blacklist
//! escalation, security logging and metrics. The store owns the counter
//! state; this layer owns the policy.

use async_trait::async_trait;
use axum::http::HeaderMap;
use guardian_core::{
    AdmissionConfig, AdmissionDecision, AdmissionStats, AdmissionStore, ClientIdentity,
    CounterHit, DenyReason, HitOutcome, Result, RouteClass, SecurityEventType, SharedClock,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, warn};

use crate::auto_heal::Purgeable;
use crate::metrics::Metrics;
use crate::security_log::{SecurityEvent, SecurityLogger};

/// Retry hint when the counter store itself is failing.
const FAIL_CLOSED_RETRY_SECS: u64 = 5;

/// Resolve the admission identity for a request.
///
/// With `trust_forwarded_for`, the first `x-forwarded-for` entry wins, then
/// `x-real-ip`. Otherwise (or when neither is present) the socket peer is
/// used, and `"unknown"` when even that is missing.
pub fn resolve_identity(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trust_forwarded_for: bool,
) -> ClientIdentity {
    if trust_forwarded_for {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(ip) = forwarded {
            return ClientIdentity::new(ip);
        }
        let real_ip = headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(ip) = real_ip {
            return ClientIdentity::new(ip);
        }
    }
    match peer {
        Some(addr) => ClientIdentity::new(addr.ip().to_string()),
        None => ClientIdentity::new("unknown"),
    }
}

/// Per-identity, per-route-class admission with block and blacklist
/// escalation.
pub struct AdmissionController {
    config: AdmissionConfig,
    store: Arc<dyn AdmissionStore>,
    clock: SharedClock,
    metrics: Metrics,
    security_log: Arc<SecurityLogger>,
}

impl AdmissionController {
    pub fn new(
        config: &AdmissionConfig,
        store: Arc<dyn AdmissionStore>,
        clock: SharedClock,
        metrics: Metrics,
        security_log: Arc<SecurityLogger>,
    ) -> Self {
        Self {
            config: config.clone(),
            store,
            clock,
            metrics,
            security_log,
        }
    }

    pub fn trust_forwarded_for(&self) -> bool {
        self.config.trust_forwarded_for
    }

    /// Decide whether one request from `identity` on `route_class` may
    /// proceed. Store failures deny.
    pub async fn check(&self, identity: &ClientIdentity, route_class: RouteClass) -> AdmissionDecision {
        let limit = *self.config.routes.for_class(route_class);
        if !self.config.enabled {
            return AdmissionDecision {
                allowed: true,
                route_class,
                limit: limit.max_requests,
                remaining: limit.max_requests,
                retry_after_secs: None,
                reason: None,
            };
        }

        let decision = match self.evaluate(identity, route_class).await {
            Ok(decision) => decision,
            Err(e) => {
                error!(identity = %identity, route_class = %route_class, error = %e, "admission store failed, denying");
                AdmissionDecision {
                    allowed: false,
                    route_class,
                    limit: limit.max_requests,
                    remaining: 0,
                    retry_after_secs: Some(FAIL_CLOSED_RETRY_SECS),
                    reason: Some(DenyReason::Blocked),
                }
            }
        };
        self.metrics.record_admission(&decision);
        decision
    }

    async fn evaluate(
        &self,
        identity: &ClientIdentity,
        route_class: RouteClass,
    ) -> Result<AdmissionDecision> {
        let limit = *self.config.routes.for_class(route_class);
        let now = self.clock.now();

        if self.store.is_blacklisted(identity).await? {
            self.security_log.log(
                SecurityEvent::new(SecurityEventType::BlockedIp, identity.as_str())
                    .details(json!({ "route_class": route_class, "reason": "blacklisted" })),
            );
            return Ok(AdmissionDecision {
                allowed: false,
                route_class,
                limit: limit.max_requests,
                remaining: 0,
                retry_after_secs: None,
                reason: Some(DenyReason::Blacklisted),
            });
        }

        let CounterHit {
            outcome,
            remaining,
            blocked_until,
        } = self.store.hit(identity, route_class, &limit, now).await?;

        let reason = match outcome {
            HitOutcome::Allowed => {
                return Ok(AdmissionDecision {
                    allowed: true,
                    route_class,
                    limit: limit.max_requests,
                    remaining,
                    retry_after_secs: None,
                    reason: None,
                });
            }
            HitOutcome::NewlyBlocked => {
                let violations = self.store.record_violation(identity, now).await?;
                warn!(
                    identity = %identity,
                    route_class = %route_class,
                    violations,
                    "rate limit exceeded"
                );
                if violations > self.config.blacklist_violation_threshold {
                    self.store.blacklist(identity).await?;
                    warn!(identity = %identity, violations, "identity blacklisted");
                    self.security_log.log(
                        SecurityEvent::new(SecurityEventType::BlockedIp, identity.as_str())
                            .details(json!({ "reason": "auto_blacklist", "violations": violations })),
                    );
                }
                DenyReason::RateLimited
            }
            HitOutcome::StillBlocked => DenyReason::Blocked,
        };

        let retry_after_secs = blocked_until.map(|until| {
            let ms = (until - now).num_milliseconds().max(0) as u64;
            ms.div_ceil(1000)
        });

        self.security_log.log(
            SecurityEvent::new(SecurityEventType::RateLimitExceeded, identity.as_str()).details(
                json!({
                    "route_class": route_class,
                    "reason": reason.as_str(),
                    "retry_after_secs": retry_after_secs,
                }),
            ),
        );

        Ok(AdmissionDecision {
            allowed: false,
            route_class,
            limit: limit.max_requests,
            remaining: 0,
            retry_after_secs,
            reason: Some(reason),
        })
    }

    pub async fn reset_identity(&self, identity: &ClientIdentity) -> Result<usize> {
        self.store.reset_identity(identity).await
    }

    pub async fn blacklist(&self, identity: &ClientIdentity) -> Result<()> {
        warn!(identity = %identity, "identity blacklisted by operator");
        self.store.blacklist(identity).await
    }

    pub async fn unblacklist(&self, identity: &ClientIdentity) -> Result<bool> {
        self.store.unblacklist(identity).await
    }

    pub async fn blacklisted(&self) -> Result<Vec<ClientIdentity>> {
        self.store.blacklisted().await
    }

    pub async fn stats(&self) -> Result<AdmissionStats> {
        self.store.stats(self.clock.now()).await
    }

    /// Drop counters idle for more than two windows.
    pub async fn sweep(&self) -> Result<usize> {
        self.store.sweep(&self.config.routes, self.clock.now()).await
    }
}

#[async_trait]
impl Purgeable for AdmissionController {
    fn name(&self) -> &'static str {
        "admission_counters"
    }

    async fn purge(&self) -> Result<usize> {
        self.sweep().await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use guardian_core::{GuardianError, ManualClock, RouteLimits, SecurityLogConfig, SecurityLogQuery};
    use guardian_storage::{InMemoryAdmissionStore, InMemorySecurityLogRepository};

    struct Fixture {
        controller: AdmissionController,
        clock: Arc<ManualClock>,
        log: Arc<SecurityLogger>,
    }

    fn fixture_with(config: AdmissionConfig, store: Arc<dyn AdmissionStore>) -> Fixture {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 10, 8, 0, 0).unwrap(),
        ));
        let metrics = Metrics::new().unwrap();
        let log = Arc::new(SecurityLogger::new(
            &SecurityLogConfig::default(),
            Arc::new(InMemorySecurityLogRepository::new()),
            clock.clone(),
            metrics.clone(),
        ));
        let controller = AdmissionController::new(&config, store, clock.clone(), metrics, log.clone());
        Fixture {
            controller,
            clock,
            log,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(
            AdmissionConfig::default(),
            Arc::new(InMemoryAdmissionStore::new()),
        )
    }

    fn ip(s: &str) -> ClientIdentity {
        ClientIdentity::new(s)
    }

    #[tokio::test]
    async fn test_api_boundary_60_allowed_61_denied() {
        let f = fixture();
        for i in 1..=60 {
            let d = f.controller.check(&ip("1.1.1.1"), RouteClass::Api).await;
            assert!(d.allowed, "request {i} should be allowed");
            assert_eq!(d.remaining, 60 - i);
        }
        let d = f.controller.check(&ip("1.1.1.1"), RouteClass::Api).await;
        assert!(!d.allowed);
        assert_eq!(d.reason, Some(DenyReason::RateLimited));
        assert_eq!(d.retry_after_secs, Some(300));

        // A different identity is unaffected.
        assert!(f.controller.check(&ip("2.2.2.2"), RouteClass::Api).await.allowed);
    }

    #[tokio::test]
    async fn test_block_holds_regardless_of_window_then_expires() {
        let f = fixture();
        let who = ip("1.1.1.1");
        for _ in 0..6 {
            f.controller.check(&who, RouteClass::Auth).await;
        }
        // Window (15 min) rolls over but the 30 min block still applies.
        f.clock.advance(Duration::minutes(20));
        let d = f.controller.check(&who, RouteClass::Auth).await;
        assert!(!d.allowed);
        assert_eq!(d.reason, Some(DenyReason::Blocked));
        assert_eq!(d.retry_after_secs, Some(600));

        f.clock.advance(Duration::minutes(10));
        assert!(f.controller.check(&who, RouteClass::Auth).await.allowed);
    }

    #[tokio::test]
    async fn test_retry_after_rounds_up() {
        let f = fixture();
        let who = ip("1.1.1.1");
        for _ in 0..6 {
            f.controller.check(&who, RouteClass::Auth).await;
        }
        f.clock.advance(Duration::milliseconds(1500));
        let d = f.controller.check(&who, RouteClass::Auth).await;
        assert_eq!(d.retry_after_secs, Some(30 * 60 - 1));
    }

    #[tokio::test]
    async fn test_eleventh_violation_blacklists() {
        let f = fixture();
        let who = ip("6.6.6.6");
        for violation in 1..=11 {
            for _ in 0..6 {
                f.controller.check(&who, RouteClass::Auth).await;
            }
            if violation < 11 {
                assert!(f.controller.blacklisted().await.unwrap().is_empty());
            }
            f.clock.advance(Duration::minutes(31));
        }
        assert_eq!(f.controller.blacklisted().await.unwrap(), vec![who.clone()]);

        let d = f.controller.check(&who, RouteClass::Public).await;
        assert!(!d.allowed);
        assert_eq!(d.reason, Some(DenyReason::Blacklisted));

        assert!(f.controller.unblacklist(&who).await.unwrap());
        assert!(f.controller.check(&who, RouteClass::Public).await.allowed);
    }

    #[tokio::test]
    async fn test_denials_are_security_logged() {
        let f = fixture();
        for _ in 0..7 {
            f.controller.check(&ip("1.1.1.1"), RouteClass::Auth).await;
        }
        let entries = f
            .log
            .recent(&SecurityLogQuery {
                event_type: Some(SecurityEventType::RateLimitExceeded),
                ..SecurityLogQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn test_disabled_admits_everything() {
        let f = fixture_with(
            AdmissionConfig {
                enabled: false,
                ..AdmissionConfig::default()
            },
            Arc::new(InMemoryAdmissionStore::new()),
        );
        for _ in 0..100 {
            assert!(f.controller.check(&ip("1.1.1.1"), RouteClass::Auth).await.allowed);
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl AdmissionStore for BrokenStore {
        async fn hit(
            &self,
            _: &ClientIdentity,
            _: RouteClass,
            _: &guardian_core::RouteLimit,
            _: chrono::DateTime<Utc>,
        ) -> Result<CounterHit> {
            Err(GuardianError::Storage("connection refused".into()))
        }
        async fn record_violation(&self, _: &ClientIdentity, _: chrono::DateTime<Utc>) -> Result<u32> {
            Err(GuardianError::Storage("connection refused".into()))
        }
        async fn is_blacklisted(&self, _: &ClientIdentity) -> Result<bool> {
            Ok(false)
        }
        async fn blacklist(&self, _: &ClientIdentity) -> Result<()> {
            Ok(())
        }
        async fn unblacklist(&self, _: &ClientIdentity) -> Result<bool> {
            Ok(false)
        }
        async fn blacklisted(&self) -> Result<Vec<ClientIdentity>> {
            Ok(vec![])
        }
        async fn reset_identity(&self, _: &ClientIdentity) -> Result<usize> {
            Ok(0)
        }
        async fn sweep(&self, _: &RouteLimits, _: chrono::DateTime<Utc>) -> Result<usize> {
            Ok(0)
        }
        async fn stats(&self, _: chrono::DateTime<Utc>) -> Result<AdmissionStats> {
            Ok(AdmissionStats::default())
        }
    }

    #[tokio::test]
    async fn test_store_failure_fails_closed() {
        let f = fixture_with(AdmissionConfig::default(), Arc::new(BrokenStore));
        let d = f.controller.check(&ip("1.1.1.1"), RouteClass::Api).await;
        assert!(!d.allowed);
        assert_eq!(d.retry_after_secs, Some(FAIL_CLOSED_RETRY_SECS));
    }

    #[tokio::test]
    async fn test_sweep_and_reset() {
        let f = fixture();
        f.controller.check(&ip("a"), RouteClass::Api).await;
        f.controller.check(&ip("b"), RouteClass::Admin).await;
        assert_eq!(f.controller.stats().await.unwrap().total_tracked, 2);
        assert_eq!(f.controller.reset_identity(&ip("a")).await.unwrap(), 1);

        f.clock.advance(Duration::minutes(3));
        assert_eq!(f.controller.purge().await.unwrap(), 1);
        assert_eq!(f.controller.stats().await.unwrap().total_tracked, 0);
    }

    #[test]
    fn test_resolve_identity_precedence() {
        let peer: SocketAddr = "10.0.0.9:5555".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.7, 10.0.0.1".parse().unwrap());
        headers.insert("x-real-ip", "198.51.100.2".parse().unwrap());

        assert_eq!(resolve_identity(&headers, Some(peer), true).as_str(), "203.0.113.7");
        assert_eq!(resolve_identity(&headers, Some(peer), false).as_str(), "10.0.0.9");

        headers.remove("x-forwarded-for");
        assert_eq!(resolve_identity(&headers, Some(peer), true).as_str(), "198.51.100.2");
        assert_eq!(resolve_identity(&HeaderMap::new(), None, true).as_str(), "unknown");
    }
}
