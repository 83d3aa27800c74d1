//! Buffered security event log.
//!
//! Events are mirrored to `tracing` immediately and buffered for batch
//! persistence. The background flusher writes a batch every
//! `flush_interval_seconds` or as soon as `buffer_size` entries are waiting,
//! whichever comes first. A failed batch goes back to the front of the
//! buffer; the buffer never holds more than `max_buffered` entries.

use chrono::Duration;
use guardian_core::{
    Result, SecurityEventType, SecurityLogConfig, SecurityLogEntry, SecurityLogQuery,
    SecurityLogRepository, SecurityLogStats, SecuritySeverity, SharedClock, TenantId,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::metrics::Metrics;
use crate::FlushReport;

/// Severity assigned when the caller does not pick one.
pub fn default_severity(event_type: SecurityEventType) -> SecuritySeverity {
    use SecurityEventType::*;
    match event_type {
        SqlInjectionAttempt => SecuritySeverity::Critical,
        XssAttempt | PromptInjectionAttempt | BlockedIp | AccountLocked => SecuritySeverity::High,
        AuthSuccess | PasswordChange | PasswordReset => SecuritySeverity::Low,
        RateLimitExceeded | InvalidInput | PathTraversalAttempt | CsrfFailure | AuthFailure
        | SuspiciousActivity | PermissionDenied | ProvisionalExpired => SecuritySeverity::Medium,
    }
}

/// A security event before it is stamped and buffered.
#[derive(Debug, Clone)]
pub struct SecurityEvent {
    event_type: SecurityEventType,
    severity: SecuritySeverity,
    identity: String,
    tenant_id: Option<TenantId>,
    path: Option<String>,
    method: Option<String>,
    details: Value,
}

impl SecurityEvent {
    pub fn new(event_type: SecurityEventType, identity: impl Into<String>) -> Self {
        Self {
            event_type,
            severity: default_severity(event_type),
            identity: identity.into(),
            tenant_id: None,
            path: None,
            method: None,
            details: Value::Null,
        }
    }

    #[must_use]
    pub fn severity(mut self, severity: SecuritySeverity) -> Self {
        self.severity = severity;
        self
    }

    #[must_use]
    pub fn tenant(mut self, tenant_id: Option<TenantId>) -> Self {
        self.tenant_id = tenant_id;
        self
    }

    #[must_use]
    pub fn request(mut self, method: impl Into<String>, path: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self.path = Some(path.into());
        self
    }

    #[must_use]
    pub fn details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// Buffers security log entries and writes them to storage in batches.
pub struct SecurityLogger {
    repo: Arc<dyn SecurityLogRepository>,
    clock: SharedClock,
    metrics: Metrics,
    buffer_size: usize,
    max_buffered: usize,
    buffer: Mutex<VecDeque<SecurityLogEntry>>,
    flush_wanted: Notify,
    flushing: tokio::sync::Mutex<()>,
}

impl SecurityLogger {
    pub fn new(
        config: &SecurityLogConfig,
        repo: Arc<dyn SecurityLogRepository>,
        clock: SharedClock,
        metrics: Metrics,
    ) -> Self {
        Self {
            repo,
            clock,
            metrics,
            buffer_size: config.buffer_size.max(1),
            max_buffered: config.max_buffered.max(1),
            buffer: Mutex::new(VecDeque::new()),
            flush_wanted: Notify::new(),
            flushing: tokio::sync::Mutex::new(()),
        }
    }

    /// Record an event. Never blocks on storage.
    pub fn log(&self, event: SecurityEvent) -> SecurityLogEntry {
        let entry = SecurityLogEntry {
            id: Uuid::new_v4(),
            event_type: event.event_type,
            severity: event.severity,
            identity: event.identity,
            tenant_id: event.tenant_id,
            path: event.path,
            method: event.method,
            details: event.details,
            created_at: self.clock.now(),
        };
        mirror(&entry);

        let len = {
            let mut buffer = self.buffer.lock();
            buffer.push_back(entry.clone());
            while buffer.len() > self.max_buffered {
                buffer.pop_front();
            }
            buffer.len()
        };
        if len >= self.buffer_size {
            self.flush_wanted.notify_one();
        }
        entry
    }

    /// Resolves when the buffer has reached its flush size.
    pub async fn flush_requested(&self) {
        self.flush_wanted.notified().await;
    }

    pub fn buffered(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Write every buffered entry in one batch.
    pub async fn flush(&self) -> FlushReport {
        let _guard = self.flushing.lock().await;
        let batch: Vec<SecurityLogEntry> = self.buffer.lock().drain(..).collect();
        if batch.is_empty() {
            return FlushReport::default();
        }

        match self.repo.insert_batch(&batch).await {
            Ok(()) => {
                self.metrics.record_log_flush(true);
                debug!(entries = batch.len(), "security log batch flushed");
                FlushReport {
                    written: batch.len(),
                    failed: 0,
                }
            }
            Err(e) => {
                self.metrics.record_log_flush(false);
                let failed = batch.len();
                let mut buffer = self.buffer.lock();
                for entry in batch.into_iter().rev() {
                    buffer.push_front(entry);
                }
                let mut dropped = 0usize;
                while buffer.len() > self.max_buffered {
                    buffer.pop_front();
                    dropped += 1;
                }
                warn!(error = %e, failed, dropped, "security log flush failed, entries re-queued");
                FlushReport { written: 0, failed }
            }
        }
    }

    /// Persisted and still-buffered entries matching `query`, newest first.
    pub async fn recent(&self, query: &SecurityLogQuery) -> Result<Vec<SecurityLogEntry>> {
        let mut entries = self.repo.query(query).await?;
        {
            let buffer = self.buffer.lock();
            entries.extend(buffer.iter().filter(|e| query.matches(e)).cloned());
        }
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        entries.dedup_by_key(|e| e.id);
        entries.truncate(query.limit);
        Ok(entries)
    }

    /// Counts by type and severity over the last `hours` hours.
    pub async fn stats(&self, hours: i64) -> Result<SecurityLogStats> {
        let query = SecurityLogQuery {
            since: Some(self.clock.now() - Duration::hours(hours.max(0))),
            limit: usize::MAX,
            ..SecurityLogQuery::default()
        };
        let entries = self.recent(&query).await?;
        let mut stats = SecurityLogStats {
            total: entries.len(),
            ..SecurityLogStats::default()
        };
        for entry in &entries {
            *stats.by_type.entry(entry.event_type).or_default() += 1;
            *stats.by_severity.entry(entry.severity).or_default() += 1;
        }
        Ok(stats)
    }
}

fn mirror(entry: &SecurityLogEntry) {
    let event_type = entry.event_type.as_str();
    let identity = entry.identity.as_str();
    let path = entry.path.as_deref().unwrap_or("");
    match entry.severity {
        SecuritySeverity::Critical => error!(
            target: "guardian::security",
            event_type, identity, path, details = %entry.details,
            "security event"
        ),
        SecuritySeverity::High => warn!(
            target: "guardian::security",
            event_type, identity, path, details = %entry.details,
            "security event"
        ),
        SecuritySeverity::Medium => info!(
            target: "guardian::security",
            event_type, identity, path,
            "security event"
        ),
        SecuritySeverity::Low => debug!(
            target: "guardian::security",
            event_type, identity, path,
            "security event"
        ),
    }
}
