//! Administrator sessions.
//!
//! A successful login with a current password yields an opaque bearer token
//! (32 random bytes, hex-encoded) held server-side until its TTL lapses.
//! Operator routes under `/api/admin/` resolve the caller from
//! `Authorization: Bearer <token>`. A configured bootstrap token stands in
//! for a platform admin before the first account exists.

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use guardian_core::{AccountsConfig, Result, SharedClock, TenantId};
use rand::RngCore;
use serde::Serialize;
use uuid::Uuid;

use crate::accounts::LoginOutcome;
use crate::auto_heal::Purgeable;

/// Email recorded for requests made with the bootstrap token.
pub const BOOTSTRAP_ADMIN: &str = "bootstrap";

/// Authenticated administrator attached to an operator request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdminSession {
    pub credential_id: Uuid,
    pub email: String,
    pub role: String,
    /// `None` for platform admins.
    pub tenant_id: Option<TenantId>,
    pub expires_at: DateTime<Utc>,
}

impl AdminSession {
    pub fn is_platform_admin(&self) -> bool {
        self.tenant_id.is_none()
    }
}

/// Issued admin sessions keyed by token.
pub struct AdminSessions {
    ttl: chrono::Duration,
    bootstrap_token: Option<String>,
    clock: SharedClock,
    sessions: DashMap<String, AdminSession>,
}

impl AdminSessions {
    pub fn new(config: &AccountsConfig, clock: SharedClock) -> Self {
        Self {
            ttl: chrono::Duration::minutes(config.session_ttl_minutes.max(1)),
            bootstrap_token: config.bootstrap_token.clone().filter(|t| !t.is_empty()),
            clock,
            sessions: DashMap::new(),
        }
    }

    /// Open a session for a verified login.
    pub fn issue(&self, login: &LoginOutcome) -> (String, AdminSession) {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token = hex::encode(bytes);
        let session = AdminSession {
            credential_id: login.credential_id,
            email: login.email.clone(),
            role: login.role.clone(),
            tenant_id: login.tenant_id.clone(),
            expires_at: self.clock.now() + self.ttl,
        };
        self.sessions.insert(token.clone(), session.clone());
        (token, session)
    }

    /// Session for `token`, if known and unexpired. Expired sessions are
    /// removed on sight.
    pub fn resolve(&self, token: &str) -> Option<AdminSession> {
        let now = self.clock.now();
        if let Some(bootstrap) = &self.bootstrap_token {
            if constant_time_eq(bootstrap.as_bytes(), token.as_bytes()) {
                return Some(AdminSession {
                    credential_id: Uuid::nil(),
                    email: BOOTSTRAP_ADMIN.to_string(),
                    role: BOOTSTRAP_ADMIN.to_string(),
                    tenant_id: None,
                    expires_at: now + self.ttl,
                });
            }
        }
        let session = self.sessions.get(token).map(|s| s.clone())?;
        if session.expires_at <= now {
            self.sessions.remove_if(token, |_, s| s.expires_at <= now);
            return None;
        }
        Some(session)
    }

    /// End a session; returns whether it existed.
    pub fn revoke(&self, token: &str) -> bool {
        self.sessions.remove(token).is_some()
    }

    /// Drop every session of one credential, e.g. after an unlock or a
    /// password change.
    pub fn revoke_credential(&self, credential_id: Uuid) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, s| s.credential_id != credential_id);
        before.saturating_sub(self.sessions.len())
    }

    /// Remove expired sessions; returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.sessions.len();
        self.sessions.retain(|_, s| s.expires_at > now);
        before.saturating_sub(self.sessions.len())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait]
impl Purgeable for AdminSessions {
    fn name(&self) -> &'static str {
        "admin_sessions"
    }

    async fn purge(&self) -> Result<usize> {
        Ok(self.sweep())
    }
}

/// Token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            v.strip_prefix("Bearer ")
                .or_else(|| v.strip_prefix("bearer "))
        })
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
