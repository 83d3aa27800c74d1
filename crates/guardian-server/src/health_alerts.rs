//! Health-monitoring alerts.
//!
//! `send(level, title, data)` is throttled per `(level, title)` and fans out
//! by level: CRITICAL goes to the urgent channel, URGENT to the secondary
//! channel, and every level lands in the durable journal (one JSON line per
//! alert under `journal_dir/{YYYY-MM-DD}.jsonl`, or a structured tracing
//! record when no journal directory is configured). Journal lines are
//! written by a background task fed through a bounded queue, so `send` never
//! waits on the filesystem.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use guardian_core::{AlertConfig, HealthAlert, HealthLevel, Result, SharedClock};
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::alerts::{channel_client, is_slack_webhook, spawn_post, SlackPayload};
use crate::metrics::Metrics;

/// Maximum length of the urgent-channel text.
const URGENT_TEXT_LIMIT: usize = 160;

/// Alerts queued for the journal writer before new ones fall back to tracing.
const JOURNAL_QUEUE: usize = 1024;

/// Result of a [`HealthAlerter::send`] call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendOutcome {
    pub sent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert: Option<HealthAlert>,
}

#[derive(Debug, Serialize)]
struct ChannelPayload<'a> {
    alert_type: &'static str,
    level: HealthLevel,
    title: &'a str,
    text: &'a str,
    data: &'a Value,
    timestamp: String,
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Single writer for the daily journal files. The task starts on the first
/// submitted alert, inside whatever runtime is sending.
struct Journal {
    dir: PathBuf,
    tx: mpsc::Sender<HealthAlert>,
    rx: Mutex<Option<mpsc::Receiver<HealthAlert>>>,
}

impl Journal {
    fn new(dir: PathBuf) -> Self {
        let (tx, rx) = mpsc::channel(JOURNAL_QUEUE);
        Self {
            dir,
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Queue an alert; hands it back when the queue is full or closed.
    fn submit(&self, alert: HealthAlert) -> std::result::Result<(), HealthAlert> {
        if let Some(rx) = self.rx.lock().take() {
            tokio::spawn(run_journal(self.dir.clone(), rx));
        }
        self.tx.try_send(alert).map_err(|e| match e {
            mpsc::error::TrySendError::Full(alert) => {
                warn!(capacity = JOURNAL_QUEUE, "health alert journal queue full");
                alert
            }
            mpsc::error::TrySendError::Closed(alert) => alert,
        })
    }
}

async fn run_journal(dir: PathBuf, mut rx: mpsc::Receiver<HealthAlert>) {
    while let Some(alert) = rx.recv().await {
        if let Err(e) = append_journal(&dir, &alert).await {
            warn!(error = %e, dir = %dir.display(), "health alert journal write failed");
            trace_alert(&alert);
        }
    }
}

async fn append_journal(dir: &Path, alert: &HealthAlert) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(format!("{}.jsonl", alert.created_at.format("%Y-%m-%d")));
    let mut line = serde_json::to_vec(alert)?;
    line.push(b'\n');
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await?;
    file.write_all(&line).await?;
    file.flush().await
}

fn trace_alert(alert: &HealthAlert) {
    match alert.level {
        HealthLevel::Critical | HealthLevel::Urgent => error!(
            target: "guardian::health",
            level = alert.level.as_str(),
            title = %alert.title,
            data = %alert.data,
            "health alert"
        ),
        HealthLevel::Warning => warn!(
            target: "guardian::health",
            title = %alert.title,
            data = %alert.data,
            "health alert"
        ),
        HealthLevel::Info => info!(
            target: "guardian::health",
            title = %alert.title,
            data = %alert.data,
            "health alert"
        ),
    }
}

/// Throttled, level-routed alerting for operational health signals.
pub struct HealthAlerter {
    cooldown: chrono::Duration,
    urgent_url: Option<String>,
    secondary_url: Option<String>,
    journal: Option<Journal>,
    client: Client,
    clock: SharedClock,
    metrics: Metrics,
    cooldowns: DashMap<(HealthLevel, String), DateTime<Utc>>,
    history: Mutex<VecDeque<HealthAlert>>,
    capacity: usize,
}

impl HealthAlerter {
    pub fn new(config: &AlertConfig, clock: SharedClock, metrics: Metrics) -> Result<Self> {
        Ok(Self {
            cooldown: chrono::Duration::seconds(config.health_cooldown_seconds as i64),
            urgent_url: config.urgent_channel_url.clone().filter(|u| !u.is_empty()),
            secondary_url: config.secondary_channel_url.clone().filter(|u| !u.is_empty()),
            journal: config
                .journal_dir
                .as_ref()
                .map(|dir| Journal::new(PathBuf::from(dir))),
            client: channel_client(config.channel_timeout_ms)?,
            clock,
            metrics,
            cooldowns: DashMap::new(),
            history: Mutex::new(VecDeque::new()),
            capacity: config.history_capacity.max(1),
        })
    }

    fn claim(&self, level: HealthLevel, title: &str, now: DateTime<Utc>) -> bool {
        match self.cooldowns.entry((level, title.to_string())) {
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

    /// Send a health alert unless the same `(level, title)` fired within the
    /// cooldown.
    pub async fn send(&self, level: HealthLevel, title: &str, data: Value) -> SendOutcome {
        let now = self.clock.now();
        if !self.claim(level, title, now) {
            debug!(level = %level.as_str(), title, "health alert suppressed by cooldown");
            return SendOutcome {
                sent: false,
                reason: Some("cooldown".to_string()),
                alert: None,
            };
        }

        let alert = HealthAlert {
            id: Uuid::new_v4(),
            level,
            title: title.to_string(),
            data,
            created_at: now,
        };
        self.metrics.record_health_alert(level);

        match level {
            HealthLevel::Critical => {
                if let Some(url) = &self.urgent_url {
                    let text = truncate_chars(
                        &format!("[GUARDIAN CRITICAL] {}: {}", alert.title, alert.data),
                        URGENT_TEXT_LIMIT,
                    );
                    self.post(url, &alert, &text, "urgent_channel");
                }
            }
            HealthLevel::Urgent => {
                if let Some(url) = &self.secondary_url {
                    let text = format!("[GUARDIAN URGENT] {}\n{}", alert.title, alert.data);
                    self.post(url, &alert, &text, "secondary_channel");
                }
            }
            HealthLevel::Warning | HealthLevel::Info => {}
        }

        self.write_journal(&alert);

        {
            let mut history = self.history.lock();
            history.push_back(alert.clone());
            while history.len() > self.capacity {
                history.pop_front();
            }
        }

        SendOutcome {
            sent: true,
            reason: None,
            alert: Some(alert),
        }
    }

    fn post(&self, url: &str, alert: &HealthAlert, text: &str, channel: &'static str) {
        if is_slack_webhook(url) {
            let header = format!("Guardian health alert ({})", alert.level.as_str());
            spawn_post(&self.client, url, SlackPayload::new(&header, text.to_string()), channel);
        } else {
            let payload = serde_json::to_value(ChannelPayload {
                alert_type: "health",
                level: alert.level,
                title: &alert.title,
                text,
                data: &alert.data,
                timestamp: alert.created_at.to_rfc3339(),
            });
            match payload {
                Ok(payload) => spawn_post(&self.client, url, payload, channel),
                Err(e) => error!(channel, error = %e, "failed to encode health alert payload"),
            }
        }
    }

    /// Hand the alert to the journal writer, or emit it as a tracing record
    /// when no journal is configured or the queue is unavailable.
    fn write_journal(&self, alert: &HealthAlert) {
        let rejected = match &self.journal {
            Some(journal) => journal.submit(alert.clone()).err(),
            None => Some(alert.clone()),
        };
        if let Some(alert) = rejected {
            trace_alert(&alert);
        }
    }

    /// Most recent health alerts, newest first.
    pub fn history(&self, limit: usize) -> Vec<HealthAlert> {
        self.history.lock().iter().rev().take(limit).cloned().collect()
    }

    /// Drop ring entries beyond `keep`; returns how many were dropped.
    pub fn trim_history(&self, keep: usize) -> usize {
        let mut history = self.history.lock();
        let excess = history.len().saturating_sub(keep);
        history.drain(..excess);
        excess
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use guardian_core::ManualClock;
    use serde_json::json;
    use std::sync::Arc;

    fn alerter(config: AlertConfig) -> (HealthAlerter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 10, 8, 0, 0).unwrap(),
        ));
        let alerter = HealthAlerter::new(&config, clock.clone(), Metrics::new().unwrap()).unwrap();
        (alerter, clock)
    }

    #[tokio::test]
    async fn test_cooldown_per_level_and_title() {
        let (a, clock) = alerter(AlertConfig::default());
        assert!(a.send(HealthLevel::Warning, "db slow", json!({})).await.sent);

        let again = a.send(HealthLevel::Warning, "db slow", json!({})).await;
        assert!(!again.sent);
        assert_eq!(again.reason.as_deref(), Some("cooldown"));

        // Different level or title is a different key.
        assert!(a.send(HealthLevel::Critical, "db slow", json!({})).await.sent);
        assert!(a.send(HealthLevel::Warning, "memory", json!({})).await.sent);

        clock.advance(chrono::Duration::minutes(5));
        assert!(a.send(HealthLevel::Warning, "db slow", json!({})).await.sent);
        assert_eq!(a.history(10).len(), 4);
    }

    /// The journal is written in the background; wait for `lines` entries.
    async fn read_journal_lines(path: &Path, lines: usize) -> String {
        for _ in 0..100 {
            if let Ok(contents) = tokio::fs::read_to_string(path).await {
                if contents.lines().count() >= lines {
                    return contents;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        panic!("journal {} never reached {lines} lines", path.display());
    }

    #[tokio::test]
    async fn test_journal_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let (a, _) = alerter(AlertConfig {
            journal_dir: Some(dir.path().to_string_lossy().into_owned()),
            ..AlertConfig::default()
        });
        a.send(HealthLevel::Info, "startup", json!({"version": "1"})).await;
        a.send(HealthLevel::Urgent, "disk", json!({"free": 3})).await;

        let contents = read_journal_lines(&dir.path().join("2026-03-10.jsonl"), 2).await;
        let lines: Vec<HealthAlert> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].title, "startup");
        assert_eq!(lines[1].level, HealthLevel::Urgent);
    }

    #[tokio::test]
    async fn test_send_does_not_wait_on_unwritable_journal() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("journal");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let (a, _) = alerter(AlertConfig {
            journal_dir: Some(blocker.join("nested").to_string_lossy().into_owned()),
            ..AlertConfig::default()
        });

        let outcome = a.send(HealthLevel::Critical, "disk", json!({"free": 0})).await;
        assert!(outcome.sent);
        assert_eq!(a.history(10).len(), 1);
        // The writer task survives a failed write and keeps draining.
        assert!(a.send(HealthLevel::Warning, "disk", json!({"free": 1})).await.sent);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(a.journal.as_ref().is_some_and(|j| !j.tx.is_closed()));
    }

    #[tokio::test]
    async fn test_history_newest_first_and_bounded() {
        let (a, _) = alerter(AlertConfig {
            history_capacity: 2,
            ..AlertConfig::default()
        });
        for title in ["a", "b", "c"] {
            a.send(HealthLevel::Info, title, Value::Null).await;
        }
        let history = a.history(10);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].title, "c");
        assert_eq!(a.trim_history(0), 2);
    }

    #[tokio::test]
    async fn test_critical_goes_to_urgent_channel_truncated() {
        use axum::routing::post;
        use axum::Router;

        let received: Arc<tokio::sync::Mutex<Vec<Value>>> = Arc::default();
        let store = received.clone();
        let app = Router::new().route(
            "/urgent",
            post(move |axum::Json(body): axum::Json<Value>| {
                let store = store.clone();
                async move {
                    store.lock().await.push(body);
                    axum::http::StatusCode::OK
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let (a, _) = alerter(AlertConfig {
            urgent_channel_url: Some(format!("http://{addr}/urgent")),
            ..AlertConfig::default()
        });
        a.send(HealthLevel::Warning, "not routed", json!({})).await;
        a.send(HealthLevel::Critical, "daily cost shutdown tier", json!({"detail": "x".repeat(400)}))
            .await;

        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        let payloads = received.lock().await;
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0]["level"], "critical");
        let text = payloads[0]["text"].as_str().unwrap();
        assert_eq!(text.chars().count(), URGENT_TEXT_LIMIT);
        assert!(text.starts_with("[GUARDIAN CRITICAL] daily cost shutdown tier"));
    }

    #[test]
    fn test_truncate_chars_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("ok", 10), "ok");
    }
}
