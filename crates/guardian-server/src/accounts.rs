//! Administrator credential lifecycle.
//!
//! Provisional creation, login verification with lockout, password change
//! with strength and reuse checks, and manual unlock. Hashing runs on the
//! blocking pool.

use chrono::{DateTime, Duration, Utc};
use guardian_core::{
    AccountsConfig, AdminCredential, CredentialRepository, GuardianError, Result,
    SecurityEventType, SharedClock, TenantId,
};
use guardian_security::PasswordPolicy;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::security_log::{SecurityEvent, SecurityLogger};

/// A freshly created provisional account. The password is shown once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionalAccount {
    pub credential_id: Uuid,
    pub email: String,
    pub temporary_password: String,
    pub expires_at: DateTime<Utc>,
}

/// Successful login.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginOutcome {
    pub credential_id: Uuid,
    pub email: String,
    pub role: String,
    pub tenant_id: Option<TenantId>,
    pub must_change_password: bool,
    /// The password is older than the configured maximum age.
    pub password_expired: bool,
}

/// Administrator account operations.
pub struct AccountService {
    config: AccountsConfig,
    policy: Arc<PasswordPolicy>,
    repo: Arc<dyn CredentialRepository>,
    clock: SharedClock,
    security_log: Arc<SecurityLogger>,
}

impl AccountService {
    pub fn new(
        config: &AccountsConfig,
        repo: Arc<dyn CredentialRepository>,
        clock: SharedClock,
        security_log: Arc<SecurityLogger>,
    ) -> Result<Self> {
        Ok(Self {
            config: config.clone(),
            policy: Arc::new(PasswordPolicy::new(config)?),
            repo,
            clock,
            security_log,
        })
    }

    pub fn policy(&self) -> &PasswordPolicy {
        &self.policy
    }

    async fn hash(&self, password: &str) -> Result<String> {
        let policy = Arc::clone(&self.policy);
        let password = password.to_string();
        tokio::task::spawn_blocking(move || policy.hash_password(&password))
            .await
            .map_err(|e| GuardianError::Security(format!("hashing task failed: {e}")))?
    }

    async fn verify(&self, password: &str, hash: &str) -> Result<bool> {
        let policy = Arc::clone(&self.policy);
        let password = password.to_string();
        let hash = hash.to_string();
        tokio::task::spawn_blocking(move || policy.verify_password(&password, &hash))
            .await
            .map_err(|e| GuardianError::Security(format!("verification task failed: {e}")))?
    }

    async fn in_history(&self, password: &str, history: &[String]) -> Result<bool> {
        let policy = Arc::clone(&self.policy);
        let password = password.to_string();
        let history = history.to_vec();
        tokio::task::spawn_blocking(move || policy.is_in_history(&password, &history))
            .await
            .map_err(|e| GuardianError::Security(format!("history check failed: {e}")))?
    }

    /// Create a provisional credential with a random password that expires
    /// after `provisional_expiry_days`.
    pub async fn create_provisional(
        &self,
        email: &str,
        tenant_id: Option<TenantId>,
        role: &str,
    ) -> Result<ProvisionalAccount> {
        let email = email.trim().to_lowercase();
        let password = self.policy.generate_provisional_password();
        let hash = self.hash(&password).await?;
        let now = self.clock.now();
        let expires_at = now + Duration::days(self.config.provisional_expiry_days);

        let credential = AdminCredential {
            id: Uuid::new_v4(),
            email: email.clone(),
            tenant_id,
            role: role.to_string(),
            password_hash: hash.clone(),
            password_history: vec![hash],
            is_provisional: true,
            provisional_expiry: Some(expires_at),
            must_change_password: true,
            failed_attempts: 0,
            locked_until: None,
            password_changed_at: None,
            created_at: now,
        };
        self.repo.insert(&credential).await?;
        info!(email = %email, role, "provisional credential created");

        Ok(ProvisionalAccount {
            credential_id: credential.id,
            email,
            temporary_password: password,
            expires_at,
        })
    }

    /// Verify a login attempt from `identity`.
    ///
    /// An active lock is reported before the password is checked, so the
    /// correct password cannot be probed while locked.
    pub async fn verify_login(
        &self,
        email: &str,
        password: &str,
        identity: &str,
    ) -> Result<LoginOutcome> {
        let email = email.trim().to_lowercase();
        let Some(mut credential) = self.repo.find_by_email(&email).await? else {
            self.auth_failure(identity, &email, "unknown_account");
            return Err(GuardianError::InvalidCredentials);
        };
        let now = self.clock.now();

        if let Some(until) = credential.locked_until {
            if until > now {
                self.auth_failure(identity, &email, "locked");
                return Err(GuardianError::CredentialLocked { until });
            }
            self.repo.reset_failures(credential.id).await?;
            credential.failed_attempts = 0;
            credential.locked_until = None;
        }

        if !self.verify(password, &credential.password_hash).await? {
            let lock_until = now + Duration::minutes(self.config.lockout_minutes);
            let updated = self
                .repo
                .register_failure(credential.id, self.config.max_failed_attempts, lock_until)
                .await?;
            self.auth_failure(identity, &email, "wrong_password");
            if updated.is_locked(now) {
                warn!(email = %email, attempts = updated.failed_attempts, "account locked");
                self.security_log.log(
                    SecurityEvent::new(SecurityEventType::AccountLocked, identity)
                        .details(json!({ "email": email, "until": lock_until })),
                );
            }
            return Err(GuardianError::InvalidCredentials);
        }

        if credential.provisional_expired(now) {
            self.security_log.log(
                SecurityEvent::new(SecurityEventType::ProvisionalExpired, identity)
                    .details(json!({ "email": email })),
            );
            return Err(GuardianError::CredentialExpired);
        }

        if credential.failed_attempts > 0 {
            self.repo.reset_failures(credential.id).await?;
        }
        self.security_log.log(
            SecurityEvent::new(SecurityEventType::AuthSuccess, identity)
                .tenant(credential.tenant_id.clone())
                .details(json!({ "email": email })),
        );

        let password_expired = credential.password_changed_at.is_some_and(|changed| {
            now - changed > Duration::days(self.config.max_password_age_days)
        });
        Ok(LoginOutcome {
            credential_id: credential.id,
            email,
            role: credential.role,
            tenant_id: credential.tenant_id,
            must_change_password: credential.must_change_password || credential.is_provisional,
            password_expired,
        })
    }

    fn auth_failure(&self, identity: &str, email: &str, reason: &str) {
        self.security_log.log(
            SecurityEvent::new(SecurityEventType::AuthFailure, identity)
                .details(json!({ "email": email, "reason": reason })),
        );
    }

    /// Change a password after verifying the current one. Makes a
    /// provisional credential permanent.
    pub async fn change_password(
        &self,
        credential_id: Uuid,
        current_password: &str,
        new_password: &str,
        identity: &str,
    ) -> Result<()> {
        let mut credential = self
            .repo
            .find_by_id(credential_id)
            .await?
            .ok_or_else(|| GuardianError::NotFound(format!("credential {credential_id}")))?;
        let now = self.clock.now();

        if let Some(until) = credential.locked_until.filter(|until| *until > now) {
            return Err(GuardianError::CredentialLocked { until });
        }
        if !self.verify(current_password, &credential.password_hash).await? {
            self.auth_failure(identity, &credential.email, "wrong_current_password");
            return Err(GuardianError::InvalidCredentials);
        }

        let report = self.policy.validate_strength(new_password);
        if !report.valid {
            return Err(GuardianError::WeakPassword(report.errors));
        }
        if self
            .in_history(new_password, &credential.password_history)
            .await?
        {
            return Err(GuardianError::PasswordReused);
        }

        let hash = self.hash(new_password).await?;
        credential.password_history.insert(0, hash.clone());
        credential
            .password_history
            .truncate(self.policy.history_count());
        credential.password_hash = hash;
        credential.is_provisional = false;
        credential.provisional_expiry = None;
        credential.must_change_password = false;
        credential.failed_attempts = 0;
        credential.locked_until = None;
        credential.password_changed_at = Some(now);
        self.repo.update(&credential).await?;

        self.security_log.log(
            SecurityEvent::new(SecurityEventType::PasswordChange, identity)
                .tenant(credential.tenant_id.clone())
                .details(json!({ "email": credential.email })),
        );
        info!(email = %credential.email, "password changed");
        Ok(())
    }

    /// Clear a lock before it lapses.
    pub async fn unlock(&self, credential_id: Uuid) -> Result<()> {
        self.repo.reset_failures(credential_id).await?;
        info!(credential_id = %credential_id, "account unlocked manually");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use guardian_core::{ManualClock, SecurityLogConfig, SecurityLogQuery};
    use guardian_storage::{InMemoryCredentialRepository, InMemorySecurityLogRepository};

    use crate::metrics::Metrics;

    const STRONG: &str = "Tr1cky!Falcon#42";

    struct Fixture {
        accounts: AccountService,
        clock: Arc<ManualClock>,
        log: Arc<SecurityLogger>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 10, 8, 0, 0).unwrap(),
        ));
        let log = Arc::new(SecurityLogger::new(
            &SecurityLogConfig::default(),
            Arc::new(InMemorySecurityLogRepository::new()),
            clock.clone(),
            Metrics::new().unwrap(),
        ));
        let config = AccountsConfig {
            argon2_memory_kib: 256,
            argon2_iterations: 1,
            ..AccountsConfig::default()
        };
        let accounts = AccountService::new(
            &config,
            Arc::new(InMemoryCredentialRepository::new()),
            clock.clone(),
            log.clone(),
        )
        .unwrap();
        Fixture {
            accounts,
            clock,
            log,
        }
    }

    #[tokio::test]
    async fn test_provisional_login_requires_change() {
        let f = fixture();
        let account = f
            .accounts
            .create_provisional("Owner@Salon.example", Some(TenantId::new("salon-a")), "owner")
            .await
            .unwrap();
        assert_eq!(account.email, "owner@salon.example");
        assert_eq!(account.temporary_password.len(), 16);

        let login = f
            .accounts
            .verify_login("owner@salon.example", &account.temporary_password, "1.2.3.4")
            .await
            .unwrap();
        assert!(login.must_change_password);
        assert!(!login.password_expired);
        assert_eq!(login.tenant_id, Some(TenantId::new("salon-a")));
    }

    #[tokio::test]
    async fn test_lockout_after_five_failures_even_with_correct_password() {
        let f = fixture();
        let account = f
            .accounts
            .create_provisional("a@example.com", None, "admin")
            .await
            .unwrap();

        for _ in 0..5 {
            let err = f
                .accounts
                .verify_login("a@example.com", "wrong", "ip")
                .await
                .unwrap_err();
            assert!(matches!(err, GuardianError::InvalidCredentials));
        }
        let err = f
            .accounts
            .verify_login("a@example.com", &account.temporary_password, "ip")
            .await
            .unwrap_err();
        assert!(matches!(err, GuardianError::CredentialLocked { .. }));

        let locked = f
            .log
            .recent(&SecurityLogQuery {
                event_type: Some(SecurityEventType::AccountLocked),
                ..SecurityLogQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(locked.len(), 1);

        // The lock lapses after 30 minutes.
        f.clock.advance(Duration::minutes(30));
        f.accounts
            .verify_login("a@example.com", &account.temporary_password, "ip")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_manual_unlock() {
        let f = fixture();
        let account = f
            .accounts
            .create_provisional("b@example.com", None, "admin")
            .await
            .unwrap();
        for _ in 0..5 {
            let _ = f.accounts.verify_login("b@example.com", "nope", "ip").await;
        }
        f.accounts.unlock(account.credential_id).await.unwrap();
        f.accounts
            .verify_login("b@example.com", &account.temporary_password, "ip")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_expired_provisional_is_distinct_from_wrong_password() {
        let f = fixture();
        let account = f
            .accounts
            .create_provisional("c@example.com", None, "admin")
            .await
            .unwrap();
        f.clock.advance(Duration::days(7));

        let err = f
            .accounts
            .verify_login("c@example.com", &account.temporary_password, "ip")
            .await
            .unwrap_err();
        assert!(matches!(err, GuardianError::CredentialExpired));

        let err = f
            .accounts
            .verify_login("c@example.com", "wrong", "ip")
            .await
            .unwrap_err();
        assert!(matches!(err, GuardianError::InvalidCredentials));
    }

    #[tokio::test]
    async fn test_change_password_enforces_strength_and_history() {
        let f = fixture();
        let account = f
            .accounts
            .create_provisional("d@example.com", None, "admin")
            .await
            .unwrap();
        let id = account.credential_id;
        let temp = account.temporary_password.as_str();

        let err = f
            .accounts
            .change_password(id, temp, "short", "ip")
            .await
            .unwrap_err();
        assert!(matches!(err, GuardianError::WeakPassword(_)));

        let err = f
            .accounts
            .change_password(id, "not-current", STRONG, "ip")
            .await
            .unwrap_err();
        assert!(matches!(err, GuardianError::InvalidCredentials));

        f.accounts.change_password(id, temp, STRONG, "ip").await.unwrap();

        // Changing back to the same password is a reuse.
        let err = f
            .accounts
            .change_password(id, STRONG, STRONG, "ip")
            .await
            .unwrap_err();
        assert!(matches!(err, GuardianError::PasswordReused));

        let login = f
            .accounts
            .verify_login("d@example.com", STRONG, "ip")
            .await
            .unwrap();
        assert!(!login.must_change_password);

        // Permanent now: the provisional expiry no longer applies.
        f.clock.advance(Duration::days(8));
        f.accounts
            .verify_login("d@example.com", STRONG, "ip")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_password_age_flag() {
        let f = fixture();
        let account = f
            .accounts
            .create_provisional("e@example.com", None, "admin")
            .await
            .unwrap();
        f.accounts
            .change_password(account.credential_id, &account.temporary_password, STRONG, "ip")
            .await
            .unwrap();
        f.clock.advance(Duration::days(91));
        let login = f
            .accounts
            .verify_login("e@example.com", STRONG, "ip")
            .await
            .unwrap();
        assert!(login.password_expired);
    }

    #[tokio::test]
    async fn test_unknown_account_is_invalid_credentials() {
        let f = fixture();
        let err = f
            .accounts
            .verify_login("ghost@example.com", STRONG, "ip")
            .await
            .unwrap_err();
        assert!(matches!(err, GuardianError::InvalidCredentials));
    }
}
