//! Prometheus metrics for the Guardian.
//!
//! Provides a [`Metrics`] struct holding every collector and a handler that
//! renders them in Prometheus exposition text format at `/metrics`.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use guardian_core::{AdmissionDecision, AlertLevel, HealthLevel, ThreatFinding};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

use crate::state::AppState;

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Holds all Prometheus collectors for the Guardian.
///
/// Constructed once at startup and shared through [`AppState`]. Components
/// call the `record_*` helpers after each decision.
#[derive(Clone)]
pub struct Metrics {
    /// Private registry, isolated from the global default so tests are
    /// deterministic.
    registry: Registry,

    /// Admission decisions, labelled by route class and outcome.
    pub admission_decisions_total: IntCounterVec,

    /// Threat findings, labelled by kind.
    pub threat_findings_total: IntCounterVec,

    /// Rejected anti-forgery tokens.
    pub csrf_failures_total: IntCounter,

    /// Quota alerts dispatched, labelled by level.
    pub quota_alerts_total: IntCounterVec,

    /// Health alerts dispatched, labelled by level.
    pub health_alerts_total: IntCounterVec,

    /// Accrued usage cost in micro-USD, labelled by tenant and service.
    pub usage_cost_micro_usd_total: IntCounterVec,

    /// 1 while degraded mode is active.
    pub degraded_mode: IntGauge,

    /// Security log batch flushes, labelled by status (success|error).
    pub security_log_flushes_total: IntCounterVec,
}

fn counter_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> prometheus::Result<IntCounterVec> {
    let metric = IntCounterVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

impl Metrics {
    /// Create a `Metrics` instance with every collector registered.
    ///
    /// # Errors
    ///
    /// Fails only when two collectors share a name, which is a programming
    /// error caught at startup.
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let admission_decisions_total = counter_vec(
            &registry,
            "guardian_admission_decisions_total",
            "Admission decisions",
            &["route_class", "outcome"],
        )?;
        let threat_findings_total = counter_vec(
            &registry,
            "guardian_threat_findings_total",
            "Threat findings detected in request payloads",
            &["kind"],
        )?;

        let csrf_failures_total = IntCounter::new(
            "guardian_csrf_failures_total",
            "Requests rejected for a missing or invalid CSRF token",
        )?;
        registry.register(Box::new(csrf_failures_total.clone()))?;

        let quota_alerts_total = counter_vec(
            &registry,
            "guardian_quota_alerts_total",
            "Quota alerts dispatched",
            &["level"],
        )?;
        let health_alerts_total = counter_vec(
            &registry,
            "guardian_health_alerts_total",
            "Health alerts dispatched",
            &["level"],
        )?;
        let usage_cost_micro_usd_total = counter_vec(
            &registry,
            "guardian_usage_cost_micro_usd_total",
            "Accrued usage cost in micro-USD (divide by 1_000_000 for USD)",
            &["tenant", "service"],
        )?;

        let degraded_mode = IntGauge::new(
            "guardian_degraded_mode",
            "Degraded mode state (1 = degraded)",
        )?;
        registry.register(Box::new(degraded_mode.clone()))?;

        let security_log_flushes_total = counter_vec(
            &registry,
            "guardian_security_log_flushes_total",
            "Security log batch flushes",
            &["status"],
        )?;

        Ok(Self {
            registry,
            admission_decisions_total,
            threat_findings_total,
            csrf_failures_total,
            quota_alerts_total,
            health_alerts_total,
            usage_cost_micro_usd_total,
            degraded_mode,
            security_log_flushes_total,
        })
    }

    /// Render all registered metrics in Prometheus text exposition format.
    pub fn gather_text(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    // -- convenience helpers ------------------------------------------------

    pub fn record_admission(&self, decision: &AdmissionDecision) {
        let outcome = match decision.reason {
            None => "allowed",
            Some(reason) => reason.as_str(),
        };
        self.admission_decisions_total
            .with_label_values(&[decision.route_class.as_str(), outcome])
            .inc();
    }

    pub fn record_threats(&self, findings: &[ThreatFinding]) {
        for f in findings {
            self.threat_findings_total
                .with_label_values(&[f.kind.as_str()])
                .inc();
        }
    }

    pub fn record_csrf_failure(&self) {
        self.csrf_failures_total.inc();
    }

    pub fn record_quota_alert(&self, level: AlertLevel) {
        self.quota_alerts_total
            .with_label_values(&[level.as_str()])
            .inc();
    }

    pub fn record_health_alert(&self, level: HealthLevel) {
        self.health_alerts_total
            .with_label_values(&[level.as_str()])
            .inc();
    }

    /// Record accrued cost in USD.
    ///
    /// Stored as micro-USD in an integer counter to avoid floating-point
    /// drift in Prometheus counters.
    pub fn record_cost(&self, tenant: &str, service: &str, cost_usd: f64) {
        let micro_usd = (cost_usd * 1_000_000.0) as u64;
        if micro_usd > 0 {
            self.usage_cost_micro_usd_total
                .with_label_values(&[tenant, service])
                .inc_by(micro_usd);
        }
    }

    pub fn set_degraded(&self, degraded: bool) {
        self.degraded_mode.set(i64::from(degraded));
    }

    pub fn record_log_flush(&self, success: bool) {
        let status = if success { "success" } else { "error" };
        self.security_log_flushes_total
            .with_label_values(&[status])
            .inc();
    }
}

// ---------------------------------------------------------------------------
// /metrics endpoint handler
// ---------------------------------------------------------------------------

/// Axum handler returning Prometheus-format metrics. Unauthenticated, as is
/// conventional for scrape endpoints.
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics.gather_text() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            text,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "text/plain")],
            format!("Failed to gather metrics: {e}"),
        )
            .into_response(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
