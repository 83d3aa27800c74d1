//! Core types, traits, and errors for Guardian
//!
//! This crate holds the foundational types shared by every Guardian component:
//! identities, admission counters, threat findings, usage aggregates, alert and
//! security-log records, admin credentials, the configuration tree, and the
//! async repository traits implemented by `guardian-storage`.

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

pub mod config;

pub use config::{
    AccountsConfig, AdmissionConfig, AlertConfig, AutoHealConfig, CostTierConfig, CostTiers,
    CsrfConfig, Environment, GuardianConfig, HealthConfig, IsolationConfig, LoggingConfig,
    PricingConfig, QuotaConfig, RouteLimit, RouteLimits, SecurityLogConfig, ShutdownConfig,
    StorageConfig, ThreatConfig,
};

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// Identifier of an isolated customer account.
///
/// Tenants are owned by configuration and referenced by their slug, so the
/// identifier is a plain string rather than a UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub String);

impl TenantId {
    /// Create a tenant identifier from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Admission-control partition key, typically the caller's network origin.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientIdentity(pub String);

impl ClientIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientIdentity {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Source of wall-clock time.
///
/// Every time-windowed component takes a clock by injection so windows,
/// cooldowns and expiries can be driven deterministically in tests.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current UTC time.
    fn now(&self) -> DateTime<Utc>;
}

/// Shared clock handle.
pub type SharedClock = Arc<dyn Clock>;

/// Clock backed by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for deterministic tests.
#[derive(Debug)]
pub struct ManualClock {
    now: parking_lot::Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: parking_lot::Mutex::new(start),
        }
    }

    /// Move the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    /// Jump the clock to an absolute instant.
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

// ---------------------------------------------------------------------------
// Admission types
// ---------------------------------------------------------------------------

/// Coarse route category used to select rate-limit parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteClass {
    Public,
    Api,
    Admin,
    Auth,
}

impl RouteClass {
    /// All route classes, in configuration order.
    pub const ALL: [RouteClass; 4] = [
        RouteClass::Public,
        RouteClass::Api,
        RouteClass::Admin,
        RouteClass::Auth,
    ];

    /// Classify a request path.
    ///
    /// Login and registration endpoints are `auth` wherever they live, admin
    /// consoles are `admin`, the rest of `/api/` is `api`, and everything
    /// else is `public`.
    pub fn classify(path: &str) -> Self {
        if path.contains("/auth/login") || path.contains("/auth/register") {
            RouteClass::Auth
        } else if path.starts_with("/api/admin") || path.starts_with("/api/nexus") {
            RouteClass::Admin
        } else if path.starts_with("/api/") {
            RouteClass::Api
        } else {
            RouteClass::Public
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RouteClass::Public => "public",
            RouteClass::Api => "api",
            RouteClass::Admin => "admin",
            RouteClass::Auth => "auth",
        }
    }
}

impl std::fmt::Display for RouteClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RouteClass {
    type Err = GuardianError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "public" => Ok(RouteClass::Public),
            "api" => Ok(RouteClass::Api),
            "admin" => Ok(RouteClass::Admin),
            "auth" => Ok(RouteClass::Auth),
            other => Err(GuardianError::Config(format!("unknown route class '{other}'"))),
        }
    }
}

/// Fixed-window counter for one `(identity, route class)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterEntry {
    /// Start of the current window.
    pub window_start: DateTime<Utc>,
    /// Requests counted in the current window.
    pub count: u32,
    /// Set while the pair is blocked.
    pub blocked_until: Option<DateTime<Utc>>,
    /// Last time a request touched this entry.
    pub last_seen: DateTime<Utc>,
}

/// Outcome of registering one request against a [`CounterEntry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HitOutcome {
    /// Counted and within capacity.
    Allowed,
    /// This request pushed the count past capacity; a block was just set.
    NewlyBlocked,
    /// A block set earlier is still active.
    StillBlocked,
}

impl CounterEntry {
    /// A fresh entry whose window opens at `now`.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            window_start: now,
            count: 0,
            blocked_until: None,
            last_seen: now,
        }
    }

    /// Register one request.
    ///
    /// The count never exceeds `max_requests` without the entry transitioning
    /// to blocked. An expired block restarts the entry with a fresh window.
    pub fn hit(&mut self, limit: &RouteLimit, now: DateTime<Utc>) -> HitOutcome {
        self.last_seen = now;

        if let Some(until) = self.blocked_until {
            if now < until {
                return HitOutcome::StillBlocked;
            }
            *self = CounterEntry::new(now);
        }

        if now - self.window_start >= limit.window() {
            self.window_start = now;
            self.count = 0;
        }

        self.count = self.count.saturating_add(1);
        if self.count > limit.max_requests {
            self.blocked_until = Some(now + limit.block_duration());
            HitOutcome::NewlyBlocked
        } else {
            HitOutcome::Allowed
        }
    }

    /// Requests left in the current window.
    pub fn remaining(&self, limit: &RouteLimit) -> u32 {
        limit.max_requests.saturating_sub(self.count)
    }

    /// Whether a block is active at `now`.
    pub fn is_blocked(&self, now: DateTime<Utc>) -> bool {
        self.blocked_until.is_some_and(|until| now < until)
    }

    /// Idle for more than two window lengths and not blocked.
    pub fn is_stale(&self, limit: &RouteLimit, now: DateTime<Utc>) -> bool {
        !self.is_blocked(now) && now - self.last_seen > limit.window() * 2
    }
}

/// Result of an [`AdmissionStore::hit`] call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterHit {
    pub outcome: HitOutcome,
    /// Requests left in the window after this hit.
    pub remaining: u32,
    pub blocked_until: Option<DateTime<Utc>>,
}

/// Why a request was denied admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// This request exceeded the window capacity.
    RateLimited,
    /// The identity is serving a block from an earlier violation.
    Blocked,
    /// The identity is on the blacklist.
    Blacklisted,
}

impl DenyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DenyReason::RateLimited => "rate_limited",
            DenyReason::Blocked => "blocked",
            DenyReason::Blacklisted => "blacklisted",
        }
    }
}

/// Admission decision returned to the HTTP layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionDecision {
    pub allowed: bool,
    pub route_class: RouteClass,
    /// Window capacity for the route class.
    pub limit: u32,
    pub remaining: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenyReason>,
}

/// Snapshot of the admission counter table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdmissionStats {
    pub total_tracked: usize,
    pub blocked: usize,
    pub blacklisted: usize,
    pub by_route_class: BTreeMap<RouteClass, usize>,
}

// ---------------------------------------------------------------------------
// Threat types
// ---------------------------------------------------------------------------

/// Family of a detected threat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatKind {
    SqlInjection,
    Xss,
    PathTraversal,
    PromptInjection,
    /// Payload nesting exceeded the configured depth cap.
    DepthExceeded,
}

impl ThreatKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ThreatKind::SqlInjection => "sql_injection",
            ThreatKind::Xss => "xss",
            ThreatKind::PathTraversal => "path_traversal",
            ThreatKind::PromptInjection => "prompt_injection",
            ThreatKind::DepthExceeded => "depth_exceeded",
        }
    }
}

impl std::fmt::Display for ThreatKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single threat located in a payload. Never persisted on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreatFinding {
    /// Location in the payload, e.g. `body.items[2].name`.
    pub path: String,
    pub kind: ThreatKind,
    /// Name of the pattern that matched.
    pub pattern: String,
    /// Leading characters of the offending value.
    pub snippet: String,
}

/// Outcome of scanning a payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    pub valid: bool,
    pub findings: Vec<ThreatFinding>,
}

impl ScanReport {
    pub fn from_findings(findings: Vec<ThreatFinding>) -> Self {
        Self {
            valid: findings.is_empty(),
            findings,
        }
    }

    /// Whether any finding is of the given kind.
    pub fn has_kind(&self, kind: ThreatKind) -> bool {
        self.findings.iter().any(|f| f.kind == kind)
    }
}

// ---------------------------------------------------------------------------
// Usage & quota types
// ---------------------------------------------------------------------------

/// Aggregated usage within one period.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub calls: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost: f64,
}

impl UsageTotals {
    /// Accrue one billable call. Negative or non-finite costs are ignored so
    /// the cost stays monotonically non-decreasing. Counters saturate.
    pub fn accrue(&mut self, cost: f64, tokens_in: u64, tokens_out: u64) {
        self.calls = self.calls.saturating_add(1);
        self.tokens_in = self.tokens_in.saturating_add(tokens_in);
        self.tokens_out = self.tokens_out.saturating_add(tokens_out);
        if cost.is_finite() && cost > 0.0 {
            self.cost += cost;
        }
    }

    /// Add another aggregate into this one.
    pub fn merge(&mut self, other: &UsageTotals) {
        self.calls = self.calls.saturating_add(other.calls);
        self.tokens_in = self.tokens_in.saturating_add(other.tokens_in);
        self.tokens_out = self.tokens_out.saturating_add(other.tokens_out);
        self.cost += other.cost;
    }
}

/// Durable per-tenant, per-day usage row keyed by `(tenant_id, date)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyUsageRow {
    pub tenant_id: TenantId,
    pub date: NaiveDate,
    #[serde(flatten)]
    pub totals: UsageTotals,
    pub updated_at: DateTime<Utc>,
}

/// Static plan definition looked up by `Tenant::plan`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaPlan {
    /// Plan key referenced by tenants, e.g. `starter`.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Monthly cost budget in USD.
    pub cost_per_month_limit: f64,
    #[serde(default)]
    pub sms_per_month: u32,
    #[serde(default)]
    pub api_calls_per_day: u32,
    /// `None` means unlimited.
    #[serde(default)]
    pub max_users: Option<u32>,
}

/// Tenant registry entry. Owned by configuration; never mutated here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    #[serde(default)]
    pub name: String,
    pub plan: String,
    #[serde(default)]
    pub features: Vec<String>,
}

/// Month-to-date quota evaluation for one tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaStatus {
    pub tenant_id: TenantId,
    pub plan_id: String,
    pub plan_name: String,
    pub within_limits: bool,
    /// Month-to-date cost as a rounded percentage of the plan limit.
    pub percentage: u32,
    pub cost: f64,
    pub calls: u64,
    pub limit: f64,
}

/// Position of an aggregate cost against the configured cost tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CostStatus {
    Ok,
    Warning,
    Critical,
    Shutdown,
}

impl CostStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CostStatus::Ok => "ok",
            CostStatus::Warning => "warning",
            CostStatus::Critical => "critical",
            CostStatus::Shutdown => "shutdown",
        }
    }
}

// ---------------------------------------------------------------------------
// Alert types
// ---------------------------------------------------------------------------

/// Quota alert tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Warning,
    Critical,
}

impl AlertLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertLevel::Warning => "warning",
            AlertLevel::Critical => "critical",
        }
    }
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted quota alert. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub level: AlertLevel,
    /// Month-to-date percentage when the alert fired.
    pub percentage: u32,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Severity of a health-monitoring alert, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Info,
    Warning,
    Urgent,
    Critical,
}

impl HealthLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthLevel::Info => "info",
            HealthLevel::Warning => "warning",
            HealthLevel::Urgent => "urgent",
            HealthLevel::Critical => "critical",
        }
    }
}

impl std::fmt::Display for HealthLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health-monitoring alert as kept in history and written to the journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthAlert {
    pub id: Uuid,
    pub level: HealthLevel,
    pub title: String,
    pub data: Value,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Security log types
// ---------------------------------------------------------------------------

/// Kind of security event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventType {
    RateLimitExceeded,
    InvalidInput,
    SqlInjectionAttempt,
    XssAttempt,
    PathTraversalAttempt,
    PromptInjectionAttempt,
    CsrfFailure,
    AuthFailure,
    AuthSuccess,
    SuspiciousActivity,
    BlockedIp,
    PermissionDenied,
    PasswordChange,
    PasswordReset,
    AccountLocked,
    ProvisionalExpired,
}

impl SecurityEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            SecurityEventType::RateLimitExceeded => "rate_limit_exceeded",
            SecurityEventType::InvalidInput => "invalid_input",
            SecurityEventType::SqlInjectionAttempt => "sql_injection_attempt",
            SecurityEventType::XssAttempt => "xss_attempt",
            SecurityEventType::PathTraversalAttempt => "path_traversal_attempt",
            SecurityEventType::PromptInjectionAttempt => "prompt_injection_attempt",
            SecurityEventType::CsrfFailure => "csrf_failure",
            SecurityEventType::AuthFailure => "auth_failure",
            SecurityEventType::AuthSuccess => "auth_success",
            SecurityEventType::SuspiciousActivity => "suspicious_activity",
            SecurityEventType::BlockedIp => "blocked_ip",
            SecurityEventType::PermissionDenied => "permission_denied",
            SecurityEventType::PasswordChange => "password_change",
            SecurityEventType::PasswordReset => "password_reset",
            SecurityEventType::AccountLocked => "account_locked",
            SecurityEventType::ProvisionalExpired => "provisional_expired",
        }
    }
}

impl std::fmt::Display for SecurityEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SecurityEventType {
    type Err = GuardianError;

    fn from_str(s: &str) -> Result<Self> {
        serde_json::from_value(Value::String(s.to_string()))
            .map_err(|_| GuardianError::NotFound(format!("security event type '{s}'")))
    }
}

/// Severity of a security event, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecuritySeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl SecuritySeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            SecuritySeverity::Low => "low",
            SecuritySeverity::Medium => "medium",
            SecuritySeverity::High => "high",
            SecuritySeverity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for SecuritySeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SecuritySeverity {
    type Err = GuardianError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(SecuritySeverity::Low),
            "medium" => Ok(SecuritySeverity::Medium),
            "high" => Ok(SecuritySeverity::High),
            "critical" => Ok(SecuritySeverity::Critical),
            other => Err(GuardianError::NotFound(format!("severity '{other}'"))),
        }
    }
}

/// Append-only security log row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityLogEntry {
    pub id: Uuid,
    pub event_type: SecurityEventType,
    pub severity: SecuritySeverity,
    pub identity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<TenantId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    pub details: Value,
    pub created_at: DateTime<Utc>,
}

/// Filters for querying security logs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityLogQuery {
    pub event_type: Option<SecurityEventType>,
    pub severity: Option<SecuritySeverity>,
    pub identity: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: usize,
}

impl Default for SecurityLogQuery {
    fn default() -> Self {
        Self {
            event_type: None,
            severity: None,
            identity: None,
            since: None,
            limit: 100,
        }
    }
}

impl SecurityLogQuery {
    /// Whether an entry passes every filter set on the query.
    pub fn matches(&self, entry: &SecurityLogEntry) -> bool {
        self.event_type.map_or(true, |t| entry.event_type == t)
            && self.severity.map_or(true, |s| entry.severity == s)
            && self
                .identity
                .as_deref()
                .map_or(true, |i| entry.identity == i)
            && self.since.map_or(true, |since| entry.created_at >= since)
    }
}

/// Aggregate counts over a time range of security logs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecurityLogStats {
    pub total: usize,
    pub by_type: BTreeMap<SecurityEventType, usize>,
    pub by_severity: BTreeMap<SecuritySeverity, usize>,
}

// ---------------------------------------------------------------------------
// Credential types
// ---------------------------------------------------------------------------

/// Administrator credential with lockout and provisional-lifetime state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminCredential {
    pub id: Uuid,
    pub email: String,
    pub tenant_id: Option<TenantId>,
    pub role: String,
    pub password_hash: String,
    /// Most recent hash first.
    pub password_history: Vec<String>,
    pub is_provisional: bool,
    /// Always `Some` while `is_provisional` is set.
    pub provisional_expiry: Option<DateTime<Utc>>,
    pub must_change_password: bool,
    pub failed_attempts: u32,
    pub locked_until: Option<DateTime<Utc>>,
    pub password_changed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl AdminCredential {
    /// Whether a lock is active at `now`.
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.is_some_and(|until| until > now)
    }

    /// Whether a provisional credential has outlived its expiry.
    pub fn provisional_expired(&self, now: DateTime<Utc>) -> bool {
        self.is_provisional && self.provisional_expiry.map_or(true, |exp| exp <= now)
    }
}

// ---------------------------------------------------------------------------
// Generic records (tenant-scoped persistence)
// ---------------------------------------------------------------------------

/// A schemaless row as seen by the tenant isolation layer.
pub type Record = serde_json::Map<String, Value>;

/// Column holding the owning tenant on every scoped row.
pub const TENANT_COLUMN: &str = "tenant_id";

/// Equality filter over record fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordFilter {
    pub conditions: Vec<(String, Value)>,
    pub limit: Option<usize>,
}

impl RecordFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an equality condition.
    #[must_use]
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push((field.into(), value.into()));
        self
    }

    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `record` satisfies every condition.
    pub fn matches(&self, record: &Record) -> bool {
        self.conditions
            .iter()
            .all(|(field, value)| record.get(field) == Some(value))
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors raised across the Guardian.
#[derive(Debug, thiserror::Error)]
pub enum GuardianError {
    /// Admission control denied the request; recoverable after the delay.
    #[error("Admission denied, retry after {retry_after_secs}s")]
    AdmissionDenied {
        /// Seconds until the caller may retry.
        retry_after_secs: u64,
    },

    /// The payload contained one or more threats.
    #[error("Validation failed with {findings} finding(s)")]
    ValidationFailed {
        /// Number of findings.
        findings: usize,
    },

    /// The anti-forgery token was missing, unknown, expired or foreign.
    #[error("CSRF token missing or invalid")]
    CsrfInvalid,

    /// The tenant has consumed its plan budget.
    #[error("Quota exceeded for tenant {tenant_id} ({percentage}% of plan limit)")]
    QuotaExceeded {
        /// The tenant over budget.
        tenant_id: TenantId,
        /// Month-to-date percentage.
        percentage: u32,
    },

    /// Too many failed logins; the account is locked.
    #[error("Account locked until {until}")]
    CredentialLocked {
        /// When the lock lapses.
        until: DateTime<Utc>,
    },

    /// Provisional credential used past its expiry.
    #[error("Provisional credential expired")]
    CredentialExpired,

    /// Unknown account or wrong password.
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// The new password violates the strength policy.
    #[error("Password rejected: {}", .0.join("; "))]
    WeakPassword(Vec<String>),

    /// The new password matches one of the recent hashes.
    #[error("Password was used recently")]
    PasswordReused,

    /// A remediation action failed. Never surfaced to end users.
    #[error("Remediation failed: {0}")]
    Remediation(String),

    /// Storage layer error.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization / deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// An operation attempted to cross a tenant boundary.
    #[error("Tenant scope violation: {0}")]
    TenantScope(String),

    /// Pattern compilation or hashing failure.
    #[error("Security error: {0}")]
    Security(String),
}

impl GuardianError {
    /// Stable machine-readable code used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            GuardianError::AdmissionDenied { .. } => "admission_denied",
            GuardianError::ValidationFailed { .. } => "validation_failed",
            GuardianError::CsrfInvalid => "csrf_invalid",
            GuardianError::QuotaExceeded { .. } => "quota_exceeded",
            GuardianError::CredentialLocked { .. } => "credential_locked",
            GuardianError::CredentialExpired => "credential_expired",
            GuardianError::InvalidCredentials => "invalid_credentials",
            GuardianError::WeakPassword(_) => "weak_password",
            GuardianError::PasswordReused => "password_reused",
            GuardianError::Remediation(_) => "remediation_failed",
            GuardianError::Storage(_) => "storage_error",
            GuardianError::Serialization(_) => "serialization_error",
            GuardianError::Config(_) => "config_error",
            GuardianError::NotFound(_) => "not_found",
            GuardianError::TenantScope(_) => "tenant_scope",
            GuardianError::Security(_) => "security_error",
        }
    }
}

/// Convenience alias for `std::result::Result<T, GuardianError>`.
pub type Result<T> = std::result::Result<T, GuardianError>;

// ---------------------------------------------------------------------------
// Storage traits
// ---------------------------------------------------------------------------

/// Durable per-day usage aggregates.
#[async_trait]
pub trait UsageRepository: Send + Sync {
    /// Insert or replace the aggregate row for `(tenant_id, date)`.
    async fn upsert_daily(&self, row: &DailyUsageRow) -> Result<()>;

    /// Day rows for one tenant on or after `since`.
    async fn load_since(&self, tenant_id: &TenantId, since: NaiveDate)
        -> Result<Vec<DailyUsageRow>>;

    /// Day rows for every tenant on or after `since`.
    async fn load_all_since(&self, since: NaiveDate) -> Result<Vec<DailyUsageRow>>;

    /// Backend liveness probe.
    async fn health_check(&self) -> Result<()>;
}

/// Append-only quota alert history.
#[async_trait]
pub trait AlertRepository: Send + Sync {
    async fn save_alert(&self, alert: &AlertRecord) -> Result<()>;

    /// Most recent alerts, newest first.
    async fn recent_alerts(&self, limit: usize) -> Result<Vec<AlertRecord>>;

    /// Most recent alerts for one tenant, newest first.
    async fn tenant_alerts(&self, tenant_id: &TenantId, limit: usize) -> Result<Vec<AlertRecord>>;
}

/// Batched security log sink.
#[async_trait]
pub trait SecurityLogRepository: Send + Sync {
    /// Persist a batch atomically: either every entry is stored or none.
    async fn insert_batch(&self, entries: &[SecurityLogEntry]) -> Result<()>;

    /// Matching entries, newest first.
    async fn query(&self, query: &SecurityLogQuery) -> Result<Vec<SecurityLogEntry>>;
}

/// Administrator credential storage.
#[async_trait]
pub trait CredentialRepository: Send + Sync {
    async fn insert(&self, credential: &AdminCredential) -> Result<()>;

    async fn find_by_email(&self, email: &str) -> Result<Option<AdminCredential>>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<AdminCredential>>;

    /// Replace the stored credential with the same id.
    async fn update(&self, credential: &AdminCredential) -> Result<()>;

    /// Atomically increment the failure counter, locking the account until
    /// `lock_until` once the counter reaches `max_attempts`.
    async fn register_failure(
        &self,
        id: Uuid,
        max_attempts: u32,
        lock_until: DateTime<Utc>,
    ) -> Result<AdminCredential>;

    /// Clear the failure counter and any lock.
    async fn reset_failures(&self, id: Uuid) -> Result<()>;
}

/// Schemaless row store wrapped by the tenant isolation layer.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn select(&self, entity: &str, filter: &RecordFilter) -> Result<Vec<Record>>;

    /// Insert rows, returning them as stored (with generated `id`s).
    async fn insert(&self, entity: &str, rows: Vec<Record>) -> Result<Vec<Record>>;

    /// Insert rows or replace existing rows matching on `conflict_keys`.
    async fn upsert(
        &self,
        entity: &str,
        rows: Vec<Record>,
        conflict_keys: &[String],
    ) -> Result<Vec<Record>>;

    /// Merge `patch` into every matching row; returns the number updated.
    async fn update(&self, entity: &str, filter: &RecordFilter, patch: Record) -> Result<u64>;

    /// Delete every matching row; returns the number deleted.
    async fn delete(&self, entity: &str, filter: &RecordFilter) -> Result<u64>;
}

/// Shared admission-control state: counters, violations, and blacklist.
///
/// `hit` must be atomic per `(identity, route class)`: no two concurrent
/// calls for the same key may both observe the pre-increment count.
#[async_trait]
pub trait AdmissionStore: Send + Sync {
    /// Register one request against the pair's counter.
    async fn hit(
        &self,
        identity: &ClientIdentity,
        route_class: RouteClass,
        limit: &RouteLimit,
        now: DateTime<Utc>,
    ) -> Result<CounterHit>;

    /// Count a distinct violation for the identity's current UTC day and
    /// return the day's total.
    async fn record_violation(&self, identity: &ClientIdentity, now: DateTime<Utc>)
        -> Result<u32>;

    async fn is_blacklisted(&self, identity: &ClientIdentity) -> Result<bool>;

    async fn blacklist(&self, identity: &ClientIdentity) -> Result<()>;

    /// Returns whether the identity was on the blacklist.
    async fn unblacklist(&self, identity: &ClientIdentity) -> Result<bool>;

    async fn blacklisted(&self) -> Result<Vec<ClientIdentity>>;

    /// Drop all counters and violations for an identity.
    async fn reset_identity(&self, identity: &ClientIdentity) -> Result<usize>;

    /// Purge stale counter entries; returns the number removed.
    async fn sweep(&self, limits: &RouteLimits, now: DateTime<Utc>) -> Result<usize>;

    async fn stats(&self, now: DateTime<Utc>) -> Result<AdmissionStats>;
}

// ---------------------------------------------------------------------------
// Storage composite
// ---------------------------------------------------------------------------

/// Every storage concern the Guardian depends on, bundled for injection.
#[derive(Clone)]
pub struct Storage {
    pub usage: Arc<dyn UsageRepository>,
    pub alerts: Arc<dyn AlertRepository>,
    pub security_logs: Arc<dyn SecurityLogRepository>,
    pub credentials: Arc<dyn CredentialRepository>,
    pub records: Arc<dyn RecordStore>,
    pub admission: Arc<dyn AdmissionStore>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap()
    }

    fn api_limit() -> RouteLimit {
        RouteLimit {
            window_ms: 60_000,
            max_requests: 60,
            block_duration_ms: 300_000,
        }
    }

    #[test]
    fn test_route_classification() {
        assert_eq!(RouteClass::classify("/api/auth/login"), RouteClass::Auth);
        assert_eq!(
            RouteClass::classify("/api/admin/auth/login"),
            RouteClass::Auth
        );
        assert_eq!(RouteClass::classify("/api/client/auth/register"), RouteClass::Auth);
        assert_eq!(RouteClass::classify("/api/admin/tenants"), RouteClass::Admin);
        assert_eq!(RouteClass::classify("/api/nexus/stats"), RouteClass::Admin);
        assert_eq!(RouteClass::classify("/api/bookings"), RouteClass::Api);
        assert_eq!(RouteClass::classify("/"), RouteClass::Public);
        assert_eq!(RouteClass::classify("/book/salon"), RouteClass::Public);
    }

    #[test]
    fn test_route_class_from_str() {
        assert_eq!("API".parse::<RouteClass>().unwrap(), RouteClass::Api);
        assert!("nope".parse::<RouteClass>().is_err());
    }

    #[test]
    fn test_counter_boundary_at_max_requests() {
        let limit = api_limit();
        let mut entry = CounterEntry::new(t0());
        for _ in 0..60 {
            assert_eq!(entry.hit(&limit, t0()), HitOutcome::Allowed);
        }
        assert_eq!(entry.remaining(&limit), 0);
        assert_eq!(entry.hit(&limit, t0()), HitOutcome::NewlyBlocked);
        assert_eq!(entry.blocked_until, Some(t0() + Duration::minutes(5)));
        assert_eq!(entry.hit(&limit, t0()), HitOutcome::StillBlocked);
    }

    #[test]
    fn test_counter_window_rollover_resets_count() {
        let limit = api_limit();
        let mut entry = CounterEntry::new(t0());
        for _ in 0..60 {
            entry.hit(&limit, t0());
        }
        let later = t0() + Duration::seconds(60);
        assert_eq!(entry.hit(&limit, later), HitOutcome::Allowed);
        assert_eq!(entry.count, 1);
        assert_eq!(entry.window_start, later);
    }

    #[test]
    fn test_counter_expired_block_restarts_window() {
        let limit = api_limit();
        let mut entry = CounterEntry::new(t0());
        for _ in 0..61 {
            entry.hit(&limit, t0());
        }
        assert!(entry.is_blocked(t0() + Duration::minutes(4)));
        let after = t0() + Duration::minutes(5);
        assert_eq!(entry.hit(&limit, after), HitOutcome::Allowed);
        assert_eq!(entry.count, 1);
        assert!(entry.blocked_until.is_none());
    }

    #[test]
    fn test_counter_staleness() {
        let limit = api_limit();
        let mut entry = CounterEntry::new(t0());
        entry.hit(&limit, t0());
        assert!(!entry.is_stale(&limit, t0() + Duration::seconds(120)));
        assert!(entry.is_stale(&limit, t0() + Duration::seconds(121)));
    }

    #[test]
    fn test_blocked_entry_is_never_stale() {
        let limit = RouteLimit {
            window_ms: 1_000,
            max_requests: 1,
            block_duration_ms: 60_000,
        };
        let mut entry = CounterEntry::new(t0());
        entry.hit(&limit, t0());
        entry.hit(&limit, t0());
        assert!(!entry.is_stale(&limit, t0() + Duration::seconds(30)));
    }

    #[test]
    fn test_usage_totals_ignore_negative_cost() {
        let mut totals = UsageTotals::default();
        totals.accrue(1.5, 10, 20);
        totals.accrue(-3.0, 0, 0);
        totals.accrue(f64::NAN, 0, 0);
        assert_eq!(totals.calls, 3);
        assert!((totals.cost - 1.5).abs() < f64::EPSILON);
        assert_eq!(totals.tokens_in, 10);
        assert_eq!(totals.tokens_out, 20);
    }

    #[test]
    fn test_usage_totals_saturate_on_huge_token_counts() {
        let mut totals = UsageTotals::default();
        totals.accrue(0.01, u64::MAX, 10);
        totals.accrue(0.01, u64::MAX, 10);
        assert_eq!(totals.calls, 2);
        assert_eq!(totals.tokens_in, u64::MAX);
        assert_eq!(totals.tokens_out, 20);

        let mut merged = totals.clone();
        merged.merge(&totals);
        assert_eq!(merged.tokens_in, u64::MAX);
        assert_eq!(merged.calls, 4);
    }

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(t0());
        clock.advance(Duration::minutes(90));
        assert_eq!(clock.now(), t0() + Duration::minutes(90));
    }

    #[test]
    fn test_record_filter_matches() {
        let mut record = Record::new();
        record.insert("tenant_id".into(), Value::from("t1"));
        record.insert("status".into(), Value::from("open"));
        assert!(RecordFilter::new().eq("tenant_id", "t1").matches(&record));
        assert!(!RecordFilter::new()
            .eq("tenant_id", "t1")
            .eq("status", "closed")
            .matches(&record));
        assert!(RecordFilter::new().matches(&record));
    }

    #[test]
    fn test_security_log_query_matches() {
        let entry = SecurityLogEntry {
            id: Uuid::new_v4(),
            event_type: SecurityEventType::XssAttempt,
            severity: SecuritySeverity::High,
            identity: "10.0.0.1".into(),
            tenant_id: None,
            path: Some("/api/bookings".into()),
            method: Some("POST".into()),
            details: Value::Null,
            created_at: t0(),
        };
        let query = SecurityLogQuery {
            severity: Some(SecuritySeverity::High),
            since: Some(t0() - Duration::hours(1)),
            ..Default::default()
        };
        assert!(query.matches(&entry));
        let query = SecurityLogQuery {
            event_type: Some(SecurityEventType::CsrfFailure),
            ..Default::default()
        };
        assert!(!query.matches(&entry));
    }

    #[test]
    fn test_event_type_round_trips_through_str() {
        let parsed: SecurityEventType = "prompt_injection_attempt".parse().unwrap();
        assert_eq!(parsed, SecurityEventType::PromptInjectionAttempt);
        assert_eq!(parsed.to_string(), "prompt_injection_attempt");
    }

    #[test]
    fn test_provisional_expiry() {
        let cred = AdminCredential {
            id: Uuid::new_v4(),
            email: "owner@example.com".into(),
            tenant_id: Some(TenantId::new("salon")),
            role: "owner".into(),
            password_hash: String::new(),
            password_history: vec![],
            is_provisional: true,
            provisional_expiry: Some(t0() + Duration::days(7)),
            must_change_password: true,
            failed_attempts: 0,
            locked_until: None,
            password_changed_at: None,
            created_at: t0(),
        };
        assert!(!cred.provisional_expired(t0()));
        assert!(cred.provisional_expired(t0() + Duration::days(7)));
        assert!(!cred.is_locked(t0()));
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(GuardianError::CsrfInvalid.code(), "csrf_invalid");
        let err = GuardianError::WeakPassword(vec!["too short".into(), "no digit".into()]);
        assert_eq!(err.to_string(), "Password rejected: too short; no digit");
    }
}
