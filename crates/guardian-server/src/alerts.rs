//! Quota alert dispatch.
//!
//! Fires a warning and/or critical alert when a tenant's month-to-date cost
//! crosses the configured percentages of its plan limit. A `(tenant, level)`
//! pair alerts at most once per cooldown interval; the check-and-set is a
//! single `DashMap` entry operation so concurrent callers cannot both win.
//!
//! Every alert is logged, kept in a bounded ring for recent-history queries,
//! queued for write-behind persistence, and optionally posted to a webhook
//! (Slack Block Kit for `hooks.slack.com`, generic JSON otherwise). The POST
//! is spawned with a short timeout and degrades to log-only on failure.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use guardian_core::{
    AlertConfig, AlertLevel, AlertRecord, AlertRepository, GuardianError, QuotaStatus, Result,
    SharedClock, TenantId,
};
use parking_lot::Mutex;
use reqwest::Client;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::metrics::Metrics;
use crate::FlushReport;

// ---------------------------------------------------------------------------
// Webhook delivery
// ---------------------------------------------------------------------------

/// Whether a webhook URL is a Slack incoming-webhook endpoint.
pub(crate) fn is_slack_webhook(url: &str) -> bool {
    url.contains("hooks.slack.com") || url.contains("hooks.slack-gov.com")
}

/// HTTP client with the channel timeout applied to every request.
pub(crate) fn channel_client(timeout_ms: u64) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_millis(timeout_ms))
        .build()
        .map_err(|e| GuardianError::Config(format!("failed to build alert HTTP client: {e}")))
}

/// POST `payload` to `url` on a background task. Failures are logged only.
pub(crate) fn spawn_post<P>(client: &Client, url: &str, payload: P, channel: &'static str)
where
    P: Serialize + Send + 'static,
{
    let client = client.clone();
    let url = url.to_string();
    tokio::spawn(async move {
        match client.post(&url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(channel, "alert delivered");
            }
            Ok(resp) => {
                error!(channel, status = %resp.status(), "alert delivery rejected");
            }
            Err(e) => {
                error!(channel, error = %e, "alert delivery failed, logged only");
            }
        }
    });
}

/// Slack Block Kit webhook payload.
#[derive(Debug, Serialize)]
pub(crate) struct SlackPayload {
    text: String,
    blocks: Vec<SlackBlock>,
}

#[derive(Debug, Serialize)]
struct SlackBlock {
    #[serde(rename = "type")]
    block_type: &'static str,
    text: SlackText,
}

#[derive(Debug, Serialize)]
struct SlackText {
    #[serde(rename = "type")]
    text_type: &'static str,
    text: String,
}

impl SlackPayload {
    pub(crate) fn new(header: &str, body: String) -> Self {
        Self {
            text: header.to_string(),
            blocks: vec![
                SlackBlock {
                    block_type: "header",
                    text: SlackText {
                        text_type: "plain_text",
                        text: header.to_string(),
                    },
                },
                SlackBlock {
                    block_type: "section",
                    text: SlackText {
                        text_type: "mrkdwn",
                        text: body,
                    },
                },
            ],
        }
    }
}

/// Generic (non-Slack) quota alert payload.
#[derive(Debug, Serialize)]
struct QuotaAlertPayload {
    alert_type: &'static str,
    id: String,
    tenant_id: String,
    level: AlertLevel,
    percentage: u32,
    cost: f64,
    limit: f64,
    plan: String,
    message: String,
    timestamp: String,
}

// ---------------------------------------------------------------------------
// AlertDispatcher
// ---------------------------------------------------------------------------

/// Evaluates quota status against the alert tiers and dispatches alerts.
pub struct AlertDispatcher {
    enabled: bool,
    warning_percent: u32,
    critical_percent: u32,
    cooldown: chrono::Duration,
    webhook_url: Option<String>,
    client: Client,
    clock: SharedClock,
    repo: Arc<dyn AlertRepository>,
    metrics: Metrics,
    /// `(tenant, level)` → last dispatch time.
    cooldowns: DashMap<(TenantId, AlertLevel), DateTime<Utc>>,
    /// Newest at the back.
    history: Mutex<VecDeque<AlertRecord>>,
    capacity: usize,
    /// Records awaiting persistence, oldest first.
    pending: Mutex<VecDeque<AlertRecord>>,
    max_pending: usize,
}

impl AlertDispatcher {
    pub fn new(
        config: &AlertConfig,
        repo: Arc<dyn AlertRepository>,
        clock: SharedClock,
        metrics: Metrics,
    ) -> Result<Self> {
        Ok(Self {
            enabled: config.enabled,
            warning_percent: config.warning_percent,
            critical_percent: config.critical_percent,
            cooldown: chrono::Duration::seconds(config.quota_cooldown_seconds as i64),
            webhook_url: config.webhook_url.clone().filter(|u| !u.is_empty()),
            client: channel_client(config.channel_timeout_ms)?,
            clock,
            repo,
            metrics,
            cooldowns: DashMap::new(),
            history: Mutex::new(VecDeque::new()),
            capacity: config.history_capacity.max(1),
            pending: Mutex::new(VecDeque::new()),
            max_pending: config.max_pending.max(1),
        })
    }

    /// Atomically claim the right to alert for `(tenant, level)` at `now`.
    fn claim(&self, tenant_id: &TenantId, level: AlertLevel, now: DateTime<Utc>) -> bool {
        match self.cooldowns.entry((tenant_id.clone(), level)) {
            Entry::Occupied(mut last) => {
                if now - *last.get() < self.cooldown {
                    false
                } else {
                    last.insert(now);
                    true
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        }
    }

    /// Dispatch an alert for every tier `status` has reached whose
    /// `(tenant, level)` cooldown has elapsed. Returns the alerts created.
    pub fn check_and_alert(&self, status: &QuotaStatus) -> Vec<AlertRecord> {
        if !self.enabled {
            return Vec::new();
        }
        let now = self.clock.now();
        let mut fired = Vec::new();

        let tiers = [
            (AlertLevel::Critical, self.critical_percent),
            (AlertLevel::Warning, self.warning_percent),
        ];
        for (level, threshold) in tiers {
            if status.percentage < threshold {
                continue;
            }
            if !self.claim(&status.tenant_id, level, now) {
                debug!(tenant_id = %status.tenant_id, level = %level, "quota alert suppressed by cooldown");
                continue;
            }
            let record = AlertRecord {
                id: Uuid::new_v4(),
                tenant_id: status.tenant_id.clone(),
                level,
                percentage: status.percentage,
                message: self.message(level, status),
                created_at: now,
            };
            self.dispatch(&record, status);
            fired.push(record);
        }
        fired
    }

    fn message(&self, level: AlertLevel, status: &QuotaStatus) -> String {
        match level {
            AlertLevel::Critical => format!(
                "CRITICAL: tenant {} exceeded its quota\n- Usage: {}% ({:.2} / {:.2})\n- Plan: {}\n- Action: upgrade the plan or restrict usage",
                status.tenant_id, status.percentage, status.cost, status.limit, status.plan_name
            ),
            AlertLevel::Warning => format!(
                "WARNING: tenant {} is approaching its quota\n- Usage: {}% ({:.2} / {:.2})\n- Plan: {}\n- Critical threshold: {}%",
                status.tenant_id,
                status.percentage,
                status.cost,
                status.limit,
                status.plan_name,
                self.critical_percent
            ),
        }
    }

    fn dispatch(&self, record: &AlertRecord, status: &QuotaStatus) {
        match record.level {
            AlertLevel::Critical => error!(
                tenant_id = %record.tenant_id,
                percentage = record.percentage,
                plan = %status.plan_name,
                "quota alert: critical"
            ),
            AlertLevel::Warning => warn!(
                tenant_id = %record.tenant_id,
                percentage = record.percentage,
                plan = %status.plan_name,
                "quota alert: warning"
            ),
        }
        self.metrics.record_quota_alert(record.level);

        {
            let mut history = self.history.lock();
            history.push_back(record.clone());
            while history.len() > self.capacity {
                history.pop_front();
            }
        }
        {
            let mut pending = self.pending.lock();
            pending.push_back(record.clone());
            self.cap_pending(&mut pending);
        }

        if let Some(url) = &self.webhook_url {
            if is_slack_webhook(url) {
                let header = format!("Guardian quota alert ({})", record.level);
                spawn_post(&self.client, url, SlackPayload::new(&header, record.message.clone()), "quota_webhook");
            } else {
                let payload = QuotaAlertPayload {
                    alert_type: "quota",
                    id: record.id.to_string(),
                    tenant_id: record.tenant_id.to_string(),
                    level: record.level,
                    percentage: record.percentage,
                    cost: status.cost,
                    limit: status.limit,
                    plan: status.plan_name.clone(),
                    message: record.message.clone(),
                    timestamp: record.created_at.to_rfc3339(),
                };
                spawn_post(&self.client, url, payload, "quota_webhook");
            }
        }
    }

    /// Forget cooldowns for one tenant, or for everyone.
    pub fn reset_alerts(&self, tenant_id: Option<&TenantId>) {
        match tenant_id {
            Some(tenant) => {
                self.cooldowns.retain(|(t, _), _| t != tenant);
                info!(tenant_id = %tenant, "quota alert cooldowns reset");
            }
            None => {
                self.cooldowns.clear();
                info!("all quota alert cooldowns reset");
            }
        }
    }

    /// Most recent alerts, newest first.
    pub fn recent_alerts(&self, limit: usize) -> Vec<AlertRecord> {
        self.history.lock().iter().rev().take(limit).cloned().collect()
    }

    /// Most recent alerts for one tenant, newest first.
    pub fn alerts_for_tenant(&self, tenant_id: &TenantId, limit: usize) -> Vec<AlertRecord> {
        self.history
            .lock()
            .iter()
            .rev()
            .filter(|a| &a.tenant_id == tenant_id)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Persisted alert history, newest first.
    pub async fn persisted_alerts(
        &self,
        tenant_id: Option<&TenantId>,
        limit: usize,
    ) -> Result<Vec<AlertRecord>> {
        match tenant_id {
            Some(tenant) => self.repo.tenant_alerts(tenant, limit).await,
            None => self.repo.recent_alerts(limit).await,
        }
    }

    /// Drop ring entries beyond `keep`; returns how many were dropped.
    pub fn trim_history(&self, keep: usize) -> usize {
        let mut history = self.history.lock();
        let excess = history.len().saturating_sub(keep);
        history.drain(..excess);
        excess
    }

    fn cap_pending(&self, pending: &mut VecDeque<AlertRecord>) {
        let excess = pending.len().saturating_sub(self.max_pending);
        if excess > 0 {
            pending.drain(..excess);
            warn!(
                dropped = excess,
                max_pending = self.max_pending,
                "alert persistence queue full, dropped oldest records"
            );
        }
    }

    pub fn pending_records(&self) -> usize {
        self.pending.lock().len()
    }

    /// Persist queued alert records. Failed records go back to the front of
    /// the queue in their original order.
    pub async fn flush(&self) -> FlushReport {
        let batch: Vec<AlertRecord> = self.pending.lock().drain(..).collect();
        let mut report = FlushReport::default();
        let mut failed = Vec::new();

        for record in batch {
            match self.repo.save_alert(&record).await {
                Ok(()) => report.written += 1,
                Err(e) => {
                    warn!(alert_id = %record.id, error = %e, "alert persistence failed, will retry");
                    failed.push(record);
                }
            }
        }
        report.failed = failed.len();
        if !failed.is_empty() {
            let mut pending = self.pending.lock();
            for record in failed.into_iter().rev() {
                pending.push_front(record);
            }
            self.cap_pending(&mut pending);
        }
        report
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
