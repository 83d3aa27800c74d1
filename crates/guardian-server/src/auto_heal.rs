//! Auto-heal controller.
//!
//! A two-state machine (normal / degraded) plus narrow, idempotent
//! remediations keyed by metric name. Degraded mode is entered on a cost
//! shutdown tier or an explicit `costs` remediation and is only ever left
//! through [`AutoHealController::exit_degraded`]. Remediations never
//! propagate errors or panics; every attempt ends up as a
//! [`RemediationOutcome`] in a bounded action history.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use guardian_core::{AutoHealConfig, GuardianError, Result, SharedClock};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::alerts::AlertDispatcher;
use crate::health_alerts::HealthAlerter;
use crate::metrics::Metrics;

/// Ring entries kept when the memory remediation trims alert histories.
const TRIMMED_HISTORY: usize = 100;

/// A cache or table that can shed non-essential entries under memory
/// pressure.
#[async_trait]
pub trait Purgeable: Send + Sync {
    fn name(&self) -> &'static str;

    /// Drop what can be dropped; returns the number of entries removed.
    async fn purge(&self) -> Result<usize>;
}

#[async_trait]
impl Purgeable for AlertDispatcher {
    fn name(&self) -> &'static str {
        "quota_alert_history"
    }

    async fn purge(&self) -> Result<usize> {
        Ok(self.trim_history(TRIMMED_HISTORY))
    }
}

#[async_trait]
impl Purgeable for HealthAlerter {
    fn name(&self) -> &'static str {
        "health_alert_history"
    }

    async fn purge(&self) -> Result<usize> {
        Ok(self.trim_history(TRIMMED_HISTORY))
    }
}

/// Operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Normal,
    Degraded,
}

/// Current mode with when and why it was entered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeStatus {
    pub mode: Mode,
    pub since: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Feature restrictions business handlers apply while degraded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradedPolicy {
    /// `None` means no cap.
    pub max_response_tokens: Option<u32>,
    pub image_generation: bool,
    pub voice_synthesis: bool,
    pub essential_notifications_only: bool,
}

impl DegradedPolicy {
    pub fn unrestricted() -> Self {
        Self {
            max_response_tokens: None,
            image_generation: true,
            voice_synthesis: true,
            essential_notifications_only: false,
        }
    }
}

/// Result of one remediation attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemediationOutcome {
    pub id: Uuid,
    pub metric: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub detail: Value,
    pub attempted_at: DateTime<Utc>,
}

/// What a remediation did before it was wrapped into an outcome.
struct Remedy {
    action: &'static str,
    success: bool,
    error: Option<String>,
    detail: Value,
}

impl Remedy {
    fn ok(action: &'static str, detail: Value) -> Self {
        Self {
            action,
            success: true,
            error: None,
            detail,
        }
    }
}

type CredentialLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Degraded-mode state machine and remediation runner.
pub struct AutoHealController {
    config: AutoHealConfig,
    clock: SharedClock,
    metrics: Metrics,
    state: RwLock<ModeStatus>,
    purgeables: Vec<Arc<dyn Purgeable>>,
    credentials: CredentialLookup,
    actions: Mutex<VecDeque<RemediationOutcome>>,
}

impl AutoHealController {
    pub fn new(
        config: &AutoHealConfig,
        clock: SharedClock,
        metrics: Metrics,
        purgeables: Vec<Arc<dyn Purgeable>>,
    ) -> Self {
        let since = clock.now();
        metrics.set_degraded(false);
        Self {
            config: config.clone(),
            clock,
            metrics,
            state: RwLock::new(ModeStatus {
                mode: Mode::Normal,
                since,
                reason: None,
            }),
            purgeables,
            credentials: Arc::new(|key: &str| {
                std::env::var(key).ok().filter(|v| !v.trim().is_empty())
            }),
            actions: Mutex::new(VecDeque::new()),
        }
    }

    /// Replace the process-environment credential lookup.
    #[must_use]
    pub fn with_credential_lookup<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.credentials = Arc::new(lookup);
        self
    }

    pub fn is_degraded(&self) -> bool {
        self.state.read().mode == Mode::Degraded
    }

    pub fn status(&self) -> ModeStatus {
        self.state.read().clone()
    }

    pub fn degraded_policy(&self) -> DegradedPolicy {
        if self.is_degraded() {
            DegradedPolicy {
                max_response_tokens: Some(self.config.degraded_max_response_tokens),
                image_generation: false,
                voice_synthesis: false,
                essential_notifications_only: true,
            }
        } else {
            DegradedPolicy::unrestricted()
        }
    }

    /// Enter degraded mode. Returns `false` if already degraded.
    pub fn enter_degraded(&self, reason: &str) -> bool {
        let mut state = self.state.write();
        if state.mode == Mode::Degraded {
            return false;
        }
        *state = ModeStatus {
            mode: Mode::Degraded,
            since: self.clock.now(),
            reason: Some(reason.to_string()),
        };
        drop(state);
        self.metrics.set_degraded(true);
        error!(reason, "entering degraded mode");
        true
    }

    /// Leave degraded mode. Returns `false` if not degraded.
    pub fn exit_degraded(&self, actor: &str) -> bool {
        let mut state = self.state.write();
        if state.mode == Mode::Normal {
            return false;
        }
        *state = ModeStatus {
            mode: Mode::Normal,
            since: self.clock.now(),
            reason: Some(format!("manual exit by {actor}")),
        };
        drop(state);
        self.metrics.set_degraded(false);
        info!(actor, "degraded mode exited");
        true
    }

    /// Run the remediation for `metric`. Never fails; errors and panics are
    /// reported in the outcome.
    pub async fn attempt(&self, metric: &str, data: Value) -> RemediationOutcome {
        let result = AssertUnwindSafe(self.remediate(metric, &data))
            .catch_unwind()
            .await;

        let remedy = match result {
            Ok(Ok(remedy)) => remedy,
            Ok(Err(e)) => Remedy {
                action: "none",
                success: false,
                error: Some(e.to_string()),
                detail: Value::Null,
            },
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Remedy {
                    action: "none",
                    success: false,
                    error: Some(
                        GuardianError::Remediation(format!("panicked: {message}")).to_string(),
                    ),
                    detail: Value::Null,
                }
            }
        };

        let outcome = RemediationOutcome {
            id: Uuid::new_v4(),
            metric: metric.to_string(),
            success: remedy.success,
            action: Some(remedy.action.to_string()).filter(|a| a != "none"),
            error: remedy.error,
            detail: remedy.detail,
            attempted_at: self.clock.now(),
        };

        if outcome.success {
            info!(metric, action = ?outcome.action, "remediation succeeded");
        } else {
            warn!(metric, error = ?outcome.error, "remediation failed");
        }

        let mut actions = self.actions.lock();
        actions.push_back(outcome.clone());
        while actions.len() > self.config.action_history_capacity.max(1) {
            actions.pop_front();
        }
        outcome
    }

    async fn remediate(&self, metric: &str, data: &Value) -> Result<Remedy> {
        match metric {
            "memory" => {
                let mut purged = BTreeMap::new();
                let mut failures = BTreeMap::new();
                let mut dropped = 0usize;
                for target in &self.purgeables {
                    match target.purge().await {
                        Ok(n) => {
                            dropped += n;
                            purged.insert(target.name(), n);
                        }
                        Err(e) => {
                            failures.insert(target.name(), e.to_string());
                        }
                    }
                }
                Ok(Remedy {
                    action: "purge_caches",
                    success: failures.is_empty(),
                    error: (!failures.is_empty())
                        .then(|| format!("{} purge target(s) failed", failures.len())),
                    detail: json!({ "dropped": dropped, "purged": purged, "failures": failures }),
                })
            }
            "database" => {
                info!("database remediation requested; the pool reconnects on its own");
                Ok(Remedy::ok("db_reconnect_requested", data.clone()))
            }
            "apis" => {
                let missing = self.missing_credentials();
                if missing.is_empty() {
                    Ok(Remedy::ok("credentials_verified", json!({ "missing": [] })))
                } else {
                    Ok(Remedy {
                        action: "credentials_verified",
                        success: false,
                        error: Some("missing_credentials".to_string()),
                        detail: json!({ "missing": missing }),
                    })
                }
            }
            "costs" => {
                let reason = data
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("cost shutdown tier reached");
                let entered = self.enter_degraded(reason);
                Ok(Remedy::ok("degraded_mode", json!({ "entered": entered })))
            }
            _ => Ok(Remedy {
                action: "none",
                success: false,
                error: Some("unknown_metric".to_string()),
                detail: Value::Null,
            }),
        }
    }

    /// Required credential names that are unset or blank.
    pub fn missing_credentials(&self) -> Vec<String> {
        self.config
            .required_credentials
            .iter()
            .filter(|key| (self.credentials)(key.as_str()).is_none())
            .cloned()
            .collect()
    }

    /// Most recent remediation outcomes, newest first.
    pub fn actions(&self, limit: usize) -> Vec<RemediationOutcome> {
        self.actions.lock().iter().rev().take(limit).cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
