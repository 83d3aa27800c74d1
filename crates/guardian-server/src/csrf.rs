//! Anti-forgery tokens bound to a principal.
//!
//! Tokens are 32 random bytes, hex-encoded, stored server-side with their
//! issuance time. A token stays valid (and reusable) for its TTL, and only
//! for the identity it was issued to.

use async_trait::async_trait;
use axum::http::{HeaderMap, Method};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use guardian_core::{CsrfConfig, Result, SharedClock};
use rand::RngCore;

use crate::auto_heal::Purgeable;

/// Principal used when a request carries no credentials.
pub const ANONYMOUS: &str = "anonymous";

#[derive(Debug, Clone)]
struct IssuedToken {
    identity: String,
    issued_at: DateTime<Utc>,
}

/// Issues and validates CSRF tokens.
pub struct CsrfGuard {
    config: CsrfConfig,
    ttl: chrono::Duration,
    clock: SharedClock,
    tokens: DashMap<String, IssuedToken>,
}

impl CsrfGuard {
    pub fn new(config: &CsrfConfig, clock: SharedClock) -> Self {
        Self {
            config: config.clone(),
            ttl: chrono::Duration::seconds(config.token_ttl_seconds as i64),
            clock,
            tokens: DashMap::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn header_name(&self) -> &str {
        &self.config.header_name
    }

    pub fn body_field(&self) -> &str {
        &self.config.body_field
    }

    /// Issue a fresh token bound to `identity`.
    pub fn issue(&self, identity: &str) -> String {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token = hex::encode(bytes);
        self.tokens.insert(
            token.clone(),
            IssuedToken {
                identity: identity.to_string(),
                issued_at: self.clock.now(),
            },
        );
        token
    }

    /// Whether `token` is known, unexpired and bound to `identity`.
    /// Expired tokens are removed on sight.
    pub fn validate(&self, token: Option<&str>, identity: &str) -> bool {
        let Some(token) = token.filter(|t| !t.is_empty()) else {
            return false;
        };
        let now = self.clock.now();
        let (expired, bound_ok) = match self.tokens.get(token) {
            Some(issued) => (now - issued.issued_at >= self.ttl, issued.identity == identity),
            None => return false,
        };
        if expired {
            self.tokens
                .remove_if(token, |_, issued| now - issued.issued_at >= self.ttl);
            return false;
        }
        bound_ok
    }

    /// Remove expired tokens; returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.tokens.len();
        self.tokens.retain(|_, issued| now - issued.issued_at < self.ttl);
        before.saturating_sub(self.tokens.len())
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Safe methods and exempt route prefixes skip CSRF validation.
    pub fn is_exempt(&self, method: &Method, path: &str) -> bool {
        if matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS) {
            return true;
        }
        self.config
            .exempt_routes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }
}

/// Principal a token is bound to: the admin id header, else the
/// authorization header, else [`ANONYMOUS`].
pub fn bound_identity(headers: &HeaderMap) -> String {
    ["x-admin-id", "authorization"]
        .iter()
        .find_map(|name| {
            headers
                .get(*name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        })
        .unwrap_or_else(|| ANONYMOUS.to_string())
}

#[async_trait]
impl Purgeable for CsrfGuard {
    fn name(&self) -> &'static str {
        "csrf_tokens"
    }

    async fn purge(&self) -> Result<usize> {
        Ok(self.sweep())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use guardian_core::ManualClock;
    use std::sync::Arc;

    fn guard() -> (CsrfGuard, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 10, 8, 0, 0).unwrap(),
        ));
        (CsrfGuard::new(&CsrfConfig::default(), clock.clone()), clock)
    }

    #[test]
    fn test_token_is_64_hex_chars_and_unique() {
        let (g, _) = guard();
        let a = g.issue("admin-1");
        let b = g.issue("admin-1");
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
        assert_eq!(g.len(), 2);
    }

    #[test]
    fn test_token_bound_to_identity_and_reusable() {
        let (g, _) = guard();
        let token = g.issue("A");
        assert!(g.validate(Some(&token), "A"));
        assert!(g.validate(Some(&token), "A"));
        assert!(!g.validate(Some(&token), "B"));
    }

    #[test]
    fn test_missing_unknown_and_expired_tokens_rejected() {
        let (g, clock) = guard();
        assert!(!g.validate(None, "A"));
        assert!(!g.validate(Some(""), "A"));
        assert!(!g.validate(Some("deadbeef"), "A"));

        let token = g.issue("A");
        clock.advance(Duration::minutes(59));
        assert!(g.validate(Some(&token), "A"));
        clock.advance(Duration::minutes(1));
        assert!(!g.validate(Some(&token), "A"));
        assert!(g.is_empty());
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let (g, clock) = guard();
        g.issue("old");
        clock.advance(Duration::minutes(45));
        let fresh = g.issue("new");
        clock.advance(Duration::minutes(20));
        assert_eq!(g.sweep(), 1);
        assert_eq!(g.len(), 1);
        assert!(g.validate(Some(&fresh), "new"));
    }

    #[test]
    fn test_exemptions() {
        let (g, _) = guard();
        assert!(g.is_exempt(&Method::GET, "/api/bookings"));
        assert!(g.is_exempt(&Method::OPTIONS, "/api/bookings"));
        assert!(g.is_exempt(&Method::POST, "/api/chat/message"));
        assert!(g.is_exempt(&Method::POST, "/api/stripe/webhook"));
        assert!(g.is_exempt(&Method::POST, "/api/admin/auth/login"));
        assert!(!g.is_exempt(&Method::POST, "/api/bookings"));
        assert!(!g.is_exempt(&Method::DELETE, "/api/admin/guardian/blacklist/1.2.3.4"));
    }

    #[test]
    fn test_bound_identity_precedence() {
        let mut headers = HeaderMap::new();
        assert_eq!(bound_identity(&headers), ANONYMOUS);
        headers.insert("authorization", "Bearer abc".parse().unwrap());
        assert_eq!(bound_identity(&headers), "Bearer abc");
        headers.insert("x-admin-id", "admin-7".parse().unwrap());
        assert_eq!(bound_identity(&headers), "admin-7");
    }
}
