//! Guardian configuration tree.
//!
//! Every threshold the Guardian acts on (rate limits, cost tiers, alert
//! percentages, password rules) lives here as named, defaulted fields so a
//! deployment can override any of them from YAML. [`GuardianConfig::validate`]
//! runs at startup and rejects inconsistent trees before any component is
//! built.

use serde::{Deserialize, Serialize};

use crate::{
    CostStatus, GuardianError, QuotaPlan, Result, RouteClass, Tenant, TenantId,
};

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Top level
// ---------------------------------------------------------------------------

/// Deployment environment. Anything other than production enables
/// diagnostic detail in validation error bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Production,
    Development,
}

/// Root configuration for a Guardian deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardianConfig {
    /// Address the HTTP server binds to.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub threat: ThreatConfig,
    #[serde(default)]
    pub csrf: CsrfConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub cost_tiers: CostTierConfig,
    #[serde(default)]
    pub alerts: AlertConfig,
    #[serde(default)]
    pub auto_heal: AutoHealConfig,
    #[serde(default)]
    pub security_log: SecurityLogConfig,
    #[serde(default)]
    pub accounts: AccountsConfig,
    #[serde(default)]
    pub isolation: IsolationConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for GuardianConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            environment: Environment::default(),
            logging: LoggingConfig::default(),
            storage: StorageConfig::default(),
            admission: AdmissionConfig::default(),
            threat: ThreatConfig::default(),
            csrf: CsrfConfig::default(),
            quota: QuotaConfig::default(),
            cost_tiers: CostTierConfig::default(),
            alerts: AlertConfig::default(),
            auto_heal: AutoHealConfig::default(),
            security_log: SecurityLogConfig::default(),
            accounts: AccountsConfig::default(),
            isolation: IsolationConfig::default(),
            health: HealthConfig::default(),
            shutdown: ShutdownConfig::default(),
        }
    }
}

impl GuardianConfig {
    /// Whether validation errors may carry full finding detail.
    pub fn diagnostics_enabled(&self) -> bool {
        self.environment != Environment::Production
    }

    /// Reject configurations that would make a component misbehave.
    pub fn validate(&self) -> Result<()> {
        for class in RouteClass::ALL {
            self.admission
                .routes
                .for_class(class)
                .validate()
                .map_err(|e| GuardianError::Config(format!("admission.routes.{class}: {e}")))?;
        }
        if self.admission.blacklist_violation_threshold == 0 {
            return Err(config_err("admission.blacklist_violation_threshold must be > 0"));
        }
        if self.threat.max_depth == 0 || self.threat.max_string_length == 0 {
            return Err(config_err("threat.max_depth and threat.max_string_length must be > 0"));
        }
        if self.csrf.token_ttl_seconds == 0 {
            return Err(config_err("csrf.token_ttl_seconds must be > 0"));
        }

        if self.quota.plans.is_empty() {
            return Err(config_err("quota.plans must define at least one plan"));
        }
        for plan in &self.quota.plans {
            if plan.id.trim().is_empty() {
                return Err(config_err("quota.plans: plan id must not be empty"));
            }
            if !(plan.cost_per_month_limit.is_finite() && plan.cost_per_month_limit > 0.0) {
                return Err(GuardianError::Config(format!(
                    "quota.plans.{}: cost_per_month_limit must be positive",
                    plan.id
                )));
            }
        }
        if self.quota.plan(&self.quota.default_plan).is_none() {
            return Err(GuardianError::Config(format!(
                "quota.default_plan '{}' is not a defined plan",
                self.quota.default_plan
            )));
        }
        self.quota.pricing.validate()?;

        self.cost_tiers
            .daily
            .validate()
            .map_err(|e| GuardianError::Config(format!("cost_tiers.daily: {e}")))?;
        self.cost_tiers
            .monthly
            .validate()
            .map_err(|e| GuardianError::Config(format!("cost_tiers.monthly: {e}")))?;

        if self.alerts.warning_percent == 0
            || self.alerts.warning_percent > self.alerts.critical_percent
        {
            return Err(config_err(
                "alerts.warning_percent must be > 0 and <= alerts.critical_percent",
            ));
        }
        if self.alerts.history_capacity == 0 {
            return Err(config_err("alerts.history_capacity must be > 0"));
        }

        if self.security_log.buffer_size == 0
            || self.security_log.max_buffered < self.security_log.buffer_size
        {
            return Err(config_err(
                "security_log.buffer_size must be > 0 and <= security_log.max_buffered",
            ));
        }

        let accounts = &self.accounts;
        if accounts.min_password_length < 8 {
            return Err(config_err("accounts.min_password_length must be at least 8"));
        }
        if accounts.password_history == 0 {
            return Err(config_err("accounts.password_history must be > 0"));
        }
        if accounts.max_failed_attempts == 0 {
            return Err(config_err("accounts.max_failed_attempts must be > 0"));
        }
        if accounts.provisional_password_length < 4 {
            return Err(config_err("accounts.provisional_password_length must be at least 4"));
        }

        if self.health.memory_warning_percent >= self.health.memory_critical_percent
            || self.health.db_latency_warning_ms >= self.health.db_latency_critical_ms
        {
            return Err(config_err("health warning tiers must be below critical tiers"));
        }
        Ok(())
    }
}

fn config_err(msg: &str) -> GuardianError {
    GuardianError::Config(msg.to_string())
}

// ---------------------------------------------------------------------------
// Ambient sections
// ---------------------------------------------------------------------------

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `guardian_server=debug`.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `text` or `json`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// `memory` or `sqlite`.
    #[serde(default = "default_storage_profile")]
    pub profile: String,
    /// Database file path (used by the `sqlite` profile).
    #[serde(default = "default_database_path")]
    pub database_path: String,
    /// Shared admission counter store. Requires the `redis_backend` feature.
    #[serde(default)]
    pub redis_url: Option<String>,
}

fn default_storage_profile() -> String {
    "memory".to_string()
}

fn default_database_path() -> String {
    "guardian.db".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            profile: default_storage_profile(),
            database_path: default_database_path(),
            redis_url: None,
        }
    }
}

/// Graceful shutdown configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// Seconds to wait for in-flight work after a signal.
    #[serde(default = "default_shutdown_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_shutdown_timeout_seconds() -> u64 {
    30
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_shutdown_timeout_seconds(),
        }
    }
}

// ---------------------------------------------------------------------------
// Admission
// ---------------------------------------------------------------------------

/// Rate-limit parameters for one route class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteLimit {
    pub window_ms: u64,
    pub max_requests: u32,
    pub block_duration_ms: u64,
}

impl RouteLimit {
    pub const fn new(window_ms: u64, max_requests: u32, block_duration_ms: u64) -> Self {
        Self {
            window_ms,
            max_requests,
            block_duration_ms,
        }
    }

    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.window_ms as i64)
    }

    pub fn block_duration(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.block_duration_ms as i64)
    }

    fn validate(&self) -> std::result::Result<(), &'static str> {
        if self.window_ms == 0 {
            return Err("window_ms must be > 0");
        }
        if self.max_requests == 0 {
            return Err("max_requests must be > 0");
        }
        if self.block_duration_ms == 0 {
            return Err("block_duration_ms must be > 0");
        }
        Ok(())
    }
}

/// Limits for each route class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteLimits {
    #[serde(default = "default_public_limit")]
    pub public: RouteLimit,
    #[serde(default = "default_api_limit")]
    pub api: RouteLimit,
    #[serde(default = "default_admin_limit")]
    pub admin: RouteLimit,
    #[serde(default = "default_auth_limit")]
    pub auth: RouteLimit,
}

fn default_public_limit() -> RouteLimit {
    RouteLimit::new(60_000, 60, 5 * 60_000)
}

fn default_api_limit() -> RouteLimit {
    RouteLimit::new(60_000, 60, 5 * 60_000)
}

fn default_admin_limit() -> RouteLimit {
    RouteLimit::new(60_000, 200, 2 * 60_000)
}

fn default_auth_limit() -> RouteLimit {
    RouteLimit::new(15 * 60_000, 5, 30 * 60_000)
}

impl Default for RouteLimits {
    fn default() -> Self {
        Self {
            public: default_public_limit(),
            api: default_api_limit(),
            admin: default_admin_limit(),
            auth: default_auth_limit(),
        }
    }
}

impl RouteLimits {
    pub fn for_class(&self, class: RouteClass) -> &RouteLimit {
        match class {
            RouteClass::Public => &self.public,
            RouteClass::Api => &self.api,
            RouteClass::Admin => &self.admin,
            RouteClass::Auth => &self.auth,
        }
    }
}

/// Admission controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub routes: RouteLimits,
    /// An identity with more violations than this in one UTC day is blacklisted.
    #[serde(default = "default_blacklist_violation_threshold")]
    pub blacklist_violation_threshold: u32,
    #[serde(default = "default_admission_sweep_interval")]
    pub sweep_interval_seconds: u64,
    /// Resolve the identity from `x-forwarded-for` / `x-real-ip`.
    #[serde(default = "default_true")]
    pub trust_forwarded_for: bool,
}

fn default_blacklist_violation_threshold() -> u32 {
    10
}

fn default_admission_sweep_interval() -> u64 {
    300
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            routes: RouteLimits::default(),
            blacklist_violation_threshold: default_blacklist_violation_threshold(),
            sweep_interval_seconds: default_admission_sweep_interval(),
            trust_forwarded_for: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Threat detection
// ---------------------------------------------------------------------------

/// Threat detector and sanitizer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Nesting deeper than this is itself a finding.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    /// Sanitized strings are truncated to this many characters.
    #[serde(default = "default_max_string_length")]
    pub max_string_length: usize,
    #[serde(default = "default_max_key_length")]
    pub max_key_length: usize,
    #[serde(default = "default_snippet_length")]
    pub snippet_length: usize,
    #[serde(default)]
    pub escape_html: bool,
    /// Path prefixes that carry AI-facing conversational text.
    #[serde(default = "default_conversation_routes")]
    pub conversation_routes: Vec<String>,
    /// Body fields holding the conversational turn.
    #[serde(default = "default_conversation_fields")]
    pub conversation_fields: Vec<String>,
}

fn default_max_depth() -> usize {
    10
}

fn default_max_string_length() -> usize {
    10_000
}

fn default_max_key_length() -> usize {
    100
}

fn default_snippet_length() -> usize {
    50
}

fn default_conversation_routes() -> Vec<String> {
    vec!["/api/chat".to_string()]
}

fn default_conversation_fields() -> Vec<String> {
    vec![
        "message".to_string(),
        "content".to_string(),
        "text".to_string(),
    ]
}

impl Default for ThreatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_depth: default_max_depth(),
            max_string_length: default_max_string_length(),
            max_key_length: default_max_key_length(),
            snippet_length: default_snippet_length(),
            escape_html: false,
            conversation_routes: default_conversation_routes(),
            conversation_fields: default_conversation_fields(),
        }
    }
}

// ---------------------------------------------------------------------------
// CSRF
// ---------------------------------------------------------------------------

/// Anti-forgery token configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsrfConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_csrf_ttl")]
    pub token_ttl_seconds: u64,
    #[serde(default = "default_csrf_sweep_interval")]
    pub sweep_interval_seconds: u64,
    /// Path prefixes reachable without a prior page load.
    #[serde(default = "default_csrf_exempt_routes")]
    pub exempt_routes: Vec<String>,
    #[serde(default = "default_csrf_header")]
    pub header_name: String,
    #[serde(default = "default_csrf_body_field")]
    pub body_field: String,
}

fn default_csrf_ttl() -> u64 {
    3600
}

fn default_csrf_sweep_interval() -> u64 {
    600
}

fn default_csrf_exempt_routes() -> Vec<String> {
    [
        "/api/chat",
        "/api/whatsapp",
        "/api/twilio",
        "/api/stripe/webhook",
        "/api/admin/auth/login",
        "/api/admin/login",
        "/api/client/auth",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_csrf_header() -> String {
    "x-csrf-token".to_string()
}

fn default_csrf_body_field() -> String {
    "_csrf".to_string()
}

impl Default for CsrfConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            token_ttl_seconds: default_csrf_ttl(),
            sweep_interval_seconds: default_csrf_sweep_interval(),
            exempt_routes: default_csrf_exempt_routes(),
            header_name: default_csrf_header(),
            body_field: default_csrf_body_field(),
        }
    }
}

// ---------------------------------------------------------------------------
// Quota & pricing
// ---------------------------------------------------------------------------

/// Unit prices for every billable upstream service, in USD.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    #[serde(default = "default_text_input_per_1k")]
    pub text_input_per_1k_tokens: f64,
    #[serde(default = "default_text_output_per_1k")]
    pub text_output_per_1k_tokens: f64,
    #[serde(default = "default_speech_per_character")]
    pub speech_per_character: f64,
    #[serde(default = "default_sms_outbound")]
    pub sms_outbound: f64,
    #[serde(default = "default_sms_inbound")]
    pub sms_inbound: f64,
    #[serde(default = "default_voice_per_minute")]
    pub voice_per_minute: f64,
    /// Fraction of the charged amount, e.g. `0.029`.
    #[serde(default = "default_card_fee_rate")]
    pub card_fee_rate: f64,
    #[serde(default = "default_card_fee_fixed")]
    pub card_fee_fixed: f64,
    #[serde(default = "default_maps_per_request")]
    pub maps_per_request: f64,
}

fn default_text_input_per_1k() -> f64 {
    0.003
}

fn default_text_output_per_1k() -> f64 {
    0.015
}

fn default_speech_per_character() -> f64 {
    0.00003
}

fn default_sms_outbound() -> f64 {
    0.05
}

fn default_sms_inbound() -> f64 {
    0.01
}

fn default_voice_per_minute() -> f64 {
    0.02
}

fn default_card_fee_rate() -> f64 {
    0.029
}

fn default_card_fee_fixed() -> f64 {
    0.30
}

fn default_maps_per_request() -> f64 {
    0.005
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            text_input_per_1k_tokens: default_text_input_per_1k(),
            text_output_per_1k_tokens: default_text_output_per_1k(),
            speech_per_character: default_speech_per_character(),
            sms_outbound: default_sms_outbound(),
            sms_inbound: default_sms_inbound(),
            voice_per_minute: default_voice_per_minute(),
            card_fee_rate: default_card_fee_rate(),
            card_fee_fixed: default_card_fee_fixed(),
            maps_per_request: default_maps_per_request(),
        }
    }
}

impl PricingConfig {
    fn validate(&self) -> Result<()> {
        let prices = [
            ("text_input_per_1k_tokens", self.text_input_per_1k_tokens),
            ("text_output_per_1k_tokens", self.text_output_per_1k_tokens),
            ("speech_per_character", self.speech_per_character),
            ("sms_outbound", self.sms_outbound),
            ("sms_inbound", self.sms_inbound),
            ("voice_per_minute", self.voice_per_minute),
            ("card_fee_rate", self.card_fee_rate),
            ("card_fee_fixed", self.card_fee_fixed),
            ("maps_per_request", self.maps_per_request),
        ];
        for (name, value) in prices {
            if !value.is_finite() || value < 0.0 {
                return Err(GuardianError::Config(format!(
                    "quota.pricing.{name} must be a non-negative number"
                )));
            }
        }
        Ok(())
    }
}

/// Plan catalogue, tenant registry and usage persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    #[serde(default = "default_plans")]
    pub plans: Vec<QuotaPlan>,
    /// Plan applied to unknown tenants and unknown plan keys.
    #[serde(default = "default_plan_id")]
    pub default_plan: String,
    #[serde(default)]
    pub tenants: Vec<Tenant>,
    #[serde(default)]
    pub pricing: PricingConfig,
    /// Interval of the write-behind usage flush.
    #[serde(default = "default_usage_flush_interval")]
    pub flush_interval_seconds: u64,
}

fn default_plans() -> Vec<QuotaPlan> {
    vec![
        QuotaPlan {
            id: "starter".to_string(),
            name: "Starter".to_string(),
            cost_per_month_limit: 15.0,
            sms_per_month: 100,
            api_calls_per_day: 500,
            max_users: Some(1),
        },
        QuotaPlan {
            id: "pro".to_string(),
            name: "Pro".to_string(),
            cost_per_month_limit: 40.0,
            sms_per_month: 300,
            api_calls_per_day: 2000,
            max_users: Some(3),
        },
        QuotaPlan {
            id: "business".to_string(),
            name: "Business".to_string(),
            cost_per_month_limit: 100.0,
            sms_per_month: 1000,
            api_calls_per_day: 10_000,
            max_users: None,
        },
    ]
}

fn default_plan_id() -> String {
    "starter".to_string()
}

fn default_usage_flush_interval() -> u64 {
    5
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            plans: default_plans(),
            default_plan: default_plan_id(),
            tenants: Vec::new(),
            pricing: PricingConfig::default(),
            flush_interval_seconds: default_usage_flush_interval(),
        }
    }
}

impl QuotaConfig {
    pub fn plan(&self, id: &str) -> Option<&QuotaPlan> {
        self.plans.iter().find(|p| p.id == id)
    }

    pub fn tenant(&self, id: &TenantId) -> Option<&Tenant> {
        self.tenants.iter().find(|t| &t.id == id)
    }
}

/// Warning / critical / shutdown tiers for an aggregate cost.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostTiers {
    pub warning: f64,
    pub critical: f64,
    /// Crossing this tier on the daily aggregate enters degraded mode.
    pub shutdown: f64,
}

impl CostTiers {
    /// Highest tier reached by `cost`.
    pub fn classify(&self, cost: f64) -> CostStatus {
        if cost >= self.shutdown {
            CostStatus::Shutdown
        } else if cost >= self.critical {
            CostStatus::Critical
        } else if cost >= self.warning {
            CostStatus::Warning
        } else {
            CostStatus::Ok
        }
    }

    fn validate(&self) -> std::result::Result<(), &'static str> {
        if !(self.warning > 0.0 && self.warning < self.critical && self.critical < self.shutdown) {
            return Err("tiers must satisfy 0 < warning < critical < shutdown");
        }
        Ok(())
    }
}

/// Global cost tiers evaluated on every recorded usage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostTierConfig {
    #[serde(default = "default_daily_tiers")]
    pub daily: CostTiers,
    #[serde(default = "default_monthly_tiers")]
    pub monthly: CostTiers,
}

fn default_daily_tiers() -> CostTiers {
    CostTiers {
        warning: 30.0,
        critical: 50.0,
        shutdown: 100.0,
    }
}

fn default_monthly_tiers() -> CostTiers {
    CostTiers {
        warning: 500.0,
        critical: 800.0,
        shutdown: 1000.0,
    }
}

impl Default for CostTierConfig {
    fn default() -> Self {
        Self {
            daily: default_daily_tiers(),
            monthly: default_monthly_tiers(),
        }
    }
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

/// Quota alerts and health alert fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_warning_percent")]
    pub warning_percent: u32,
    #[serde(default = "default_critical_percent")]
    pub critical_percent: u32,
    /// Suppression window per `(tenant, level)`.
    #[serde(default = "default_quota_cooldown")]
    pub quota_cooldown_seconds: u64,
    /// Suppression window per `(level, title)`.
    #[serde(default = "default_health_cooldown")]
    pub health_cooldown_seconds: u64,
    /// Webhook for quota alerts. Slack incoming-webhook URLs get a Slack payload.
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// Out-of-band channel for critical health alerts (SMS gateway).
    #[serde(default)]
    pub urgent_channel_url: Option<String>,
    /// Secondary channel for urgent health alerts (mail relay).
    #[serde(default)]
    pub secondary_channel_url: Option<String>,
    /// Upper bound on any outbound channel call.
    #[serde(default = "default_channel_timeout_ms")]
    pub channel_timeout_ms: u64,
    /// Capacity of the in-memory alert rings.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    /// Directory for the daily health alert journal.
    #[serde(default)]
    pub journal_dir: Option<String>,
    /// Interval of the write-behind alert persistence flush.
    #[serde(default = "default_alert_flush_interval")]
    pub flush_interval_seconds: u64,
    /// Records held for persistence; the oldest are dropped beyond this.
    #[serde(default = "default_alert_max_pending")]
    pub max_pending: usize,
}

fn default_warning_percent() -> u32 {
    80
}

fn default_critical_percent() -> u32 {
    100
}

fn default_quota_cooldown() -> u64 {
    3600
}

fn default_health_cooldown() -> u64 {
    300
}

fn default_channel_timeout_ms() -> u64 {
    3000
}

fn default_history_capacity() -> usize {
    1000
}

fn default_alert_flush_interval() -> u64 {
    10
}

fn default_alert_max_pending() -> usize {
    10_000
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            warning_percent: default_warning_percent(),
            critical_percent: default_critical_percent(),
            quota_cooldown_seconds: default_quota_cooldown(),
            health_cooldown_seconds: default_health_cooldown(),
            webhook_url: None,
            urgent_channel_url: None,
            secondary_channel_url: None,
            channel_timeout_ms: default_channel_timeout_ms(),
            history_capacity: default_history_capacity(),
            journal_dir: None,
            flush_interval_seconds: default_alert_flush_interval(),
            max_pending: default_alert_max_pending(),
        }
    }
}

// ---------------------------------------------------------------------------
// Auto-heal & health
// ---------------------------------------------------------------------------

/// Auto-heal controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoHealConfig {
    /// Environment variables that must be set for upstream APIs to work.
    #[serde(default = "default_required_credentials")]
    pub required_credentials: Vec<String>,
    /// Response-token cap applied while degraded.
    #[serde(default = "default_degraded_max_tokens")]
    pub degraded_max_response_tokens: u32,
    #[serde(default = "default_action_history")]
    pub action_history_capacity: usize,
}

fn default_required_credentials() -> Vec<String> {
    vec![
        "GUARDIAN_LLM_API_KEY".to_string(),
        "GUARDIAN_MESSAGING_ACCOUNT_SID".to_string(),
        "GUARDIAN_PAYMENTS_SECRET_KEY".to_string(),
    ]
}

fn default_degraded_max_tokens() -> u32 {
    500
}

fn default_action_history() -> usize {
    100
}

impl Default for AutoHealConfig {
    fn default() -> Self {
        Self {
            required_credentials: default_required_credentials(),
            degraded_max_response_tokens: default_degraded_max_tokens(),
            action_history_capacity: default_action_history(),
        }
    }
}

/// Periodic health monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_health_interval")]
    pub check_interval_seconds: u64,
    #[serde(default = "default_db_latency_warning")]
    pub db_latency_warning_ms: u64,
    #[serde(default = "default_db_latency_critical")]
    pub db_latency_critical_ms: u64,
    /// Capacity of the in-memory tables (admission counters and CSRF tokens).
    #[serde(default = "default_max_tracked_entries")]
    pub max_tracked_entries: usize,
    #[serde(default = "default_memory_warning_percent")]
    pub memory_warning_percent: u32,
    #[serde(default = "default_memory_critical_percent")]
    pub memory_critical_percent: u32,
}

fn default_health_interval() -> u64 {
    300
}

fn default_db_latency_warning() -> u64 {
    1000
}

fn default_db_latency_critical() -> u64 {
    2000
}

fn default_max_tracked_entries() -> usize {
    100_000
}

fn default_memory_warning_percent() -> u32 {
    75
}

fn default_memory_critical_percent() -> u32 {
    90
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_seconds: default_health_interval(),
            db_latency_warning_ms: default_db_latency_warning(),
            db_latency_critical_ms: default_db_latency_critical(),
            max_tracked_entries: default_max_tracked_entries(),
            memory_warning_percent: default_memory_warning_percent(),
            memory_critical_percent: default_memory_critical_percent(),
        }
    }
}

// ---------------------------------------------------------------------------
// Security log
// ---------------------------------------------------------------------------

/// Buffered security log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityLogConfig {
    /// Flush as soon as this many entries are buffered.
    #[serde(default = "default_log_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_log_flush_interval")]
    pub flush_interval_seconds: u64,
    /// Oldest entries are dropped beyond this many after failed flushes.
    #[serde(default = "default_log_max_buffered")]
    pub max_buffered: usize,
}

fn default_log_buffer_size() -> usize {
    10
}

fn default_log_flush_interval() -> u64 {
    30
}

fn default_log_max_buffered() -> usize {
    1000
}

impl Default for SecurityLogConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_log_buffer_size(),
            flush_interval_seconds: default_log_flush_interval(),
            max_buffered: default_log_max_buffered(),
        }
    }
}

// ---------------------------------------------------------------------------
// Accounts
// ---------------------------------------------------------------------------

/// Credential policy for administrator accounts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountsConfig {
    #[serde(default = "default_min_password_length")]
    pub min_password_length: usize,
    /// Number of recent hashes a new password may not match.
    #[serde(default = "default_password_history")]
    pub password_history: usize,
    #[serde(default = "default_provisional_expiry_days")]
    pub provisional_expiry_days: i64,
    #[serde(default = "default_provisional_password_length")]
    pub provisional_password_length: usize,
    #[serde(default = "default_max_failed_attempts")]
    pub max_failed_attempts: u32,
    #[serde(default = "default_lockout_minutes")]
    pub lockout_minutes: i64,
    #[serde(default = "default_max_password_age_days")]
    pub max_password_age_days: i64,
    /// Argon2 memory cost in KiB.
    #[serde(default = "default_argon2_memory_kib")]
    pub argon2_memory_kib: u32,
    #[serde(default = "default_argon2_iterations")]
    pub argon2_iterations: u32,
    #[serde(default = "default_argon2_parallelism")]
    pub argon2_parallelism: u32,
    /// Lifetime of an admin session issued at login.
    #[serde(default = "default_session_ttl_minutes")]
    pub session_ttl_minutes: i64,
    /// Bearer token accepted as a platform admin on the operator routes.
    /// Intended for provisioning the first account; leave unset afterwards.
    #[serde(default)]
    pub bootstrap_token: Option<String>,
}

fn default_min_password_length() -> usize {
    12
}

fn default_password_history() -> usize {
    5
}

fn default_provisional_expiry_days() -> i64 {
    7
}

fn default_provisional_password_length() -> usize {
    16
}

fn default_max_failed_attempts() -> u32 {
    5
}

fn default_lockout_minutes() -> i64 {
    30
}

fn default_max_password_age_days() -> i64 {
    90
}

fn default_argon2_memory_kib() -> u32 {
    19_456
}

fn default_argon2_iterations() -> u32 {
    2
}

fn default_argon2_parallelism() -> u32 {
    1
}

fn default_session_ttl_minutes() -> i64 {
    480
}

impl Default for AccountsConfig {
    fn default() -> Self {
        Self {
            min_password_length: default_min_password_length(),
            password_history: default_password_history(),
            provisional_expiry_days: default_provisional_expiry_days(),
            provisional_password_length: default_provisional_password_length(),
            max_failed_attempts: default_max_failed_attempts(),
            lockout_minutes: default_lockout_minutes(),
            max_password_age_days: default_max_password_age_days(),
            argon2_memory_kib: default_argon2_memory_kib(),
            argon2_iterations: default_argon2_iterations(),
            argon2_parallelism: default_argon2_parallelism(),
            session_ttl_minutes: default_session_ttl_minutes(),
            bootstrap_token: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Isolation
// ---------------------------------------------------------------------------

/// Tenant isolation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationConfig {
    /// Entities shared across tenants; never scoped.
    #[serde(default = "default_shared_entities")]
    pub shared_entities: Vec<String>,
}

fn default_shared_entities() -> Vec<String> {
    [
        "tenants",
        "admin_users",
        "guardian_usage",
        "guardian_alerts",
        "guardian_security_logs",
        "guardian_credentials",
        "health_metrics",
        "health_alerts",
        "migration_log",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            shared_entities: default_shared_entities(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
