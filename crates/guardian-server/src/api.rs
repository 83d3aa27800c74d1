//! REST API for usage ingestion, operator controls and admin accounts.
//!
//! | Method | Path | Purpose |
//! |---|---|---|
//! | GET | `/health` | liveness, mode and component checks |
//! | GET | `/metrics` | Prometheus text format |
//! | GET | `/api/csrf-token` | issue an anti-forgery token |
//! | POST | `/api/guardian/usage` | record a billable call |
//! | GET | `/api/guardian/quota/:tenant_id` | month-to-date quota status |
//! | GET | `/api/guardian/quota/:tenant_id/enforce` | `402` when over budget |
//! | GET | `/api/guardian/costs` | global daily and monthly cost |
//! | GET | `/api/guardian/degraded` | degraded-mode signal and policy |
//! | GET | `/api/records/:entity` | tenant-scoped record query |
//! | POST | `/api/records/:entity` | tenant-scoped record insert |
//! | GET | `/api/admin/guardian/alerts` | recent quota and health alerts |
//! | POST | `/api/admin/guardian/alerts/reset` | clear alert cooldowns |
//! | GET | `/api/admin/guardian/security-logs` | security log query and stats |
//! | GET/POST | `/api/admin/guardian/blacklist` | list / add blacklist entries |
//! | DELETE | `/api/admin/guardian/blacklist/:identity` | remove a blacklist entry |
//! | GET | `/api/admin/guardian/admission` | admission table stats |
//! | DELETE | `/api/admin/guardian/admission/:identity` | reset an identity's counters |
//! | GET | `/api/admin/guardian/health` | health history and remediation log |
//! | POST | `/api/admin/guardian/degraded/exit` | leave degraded mode |
//! | POST | `/api/admin/accounts/provisional` | create a provisional credential |
//! | POST | `/api/admin/accounts/:id/unlock` | clear a login lock |
//! | POST | `/api/admin/auth/login` | verify admin credentials, open a session |
//! | POST | `/api/admin/auth/logout` | end the calling session |
//! | POST | `/api/admin/auth/change-password` | change an admin password |
//!
//! Every `/api/admin/` route except login and change-password requires
//! `Authorization: Bearer <session token>` from a platform admin. Record
//! routes require `x-tenant-id` and never reach shared entities.

use axum::extract::{Path, Query, State};
use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Extension, Json, Router};
use chrono::Duration;
use guardian_core::{
    ClientIdentity, GuardianError, Record, RecordFilter, SecurityEventType, SecurityLogQuery,
    SecuritySeverity, TenantId,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

use crate::csrf::bound_identity;
use crate::metrics::metrics_handler;
use crate::middleware::{
    admin_auth_middleware, admission_middleware, csrf_middleware, tenant_context_middleware,
    validation_middleware,
};
use crate::sessions::{bearer_token, AdminSession};
use crate::pricing::BillableService;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Error responses
// ---------------------------------------------------------------------------

/// JSON body of every error response.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Machine-readable code.
    pub error: String,
    pub message: String,
    #[serde(rename = "retryAfter", skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorBody {
    pub fn new(error: &str, message: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            retry_after: None,
            details: None,
        }
    }

    #[must_use]
    pub fn retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    #[must_use]
    pub fn details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Build a JSON error response.
fn api_error(status: StatusCode, error: &str, message: &str) -> Response {
    (status, Json(ErrorBody::new(error, message))).into_response()
}

/// A [`GuardianError`] rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub GuardianError);

impl From<GuardianError> for ApiError {
    fn from(e: GuardianError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let code = err.code();
        match &err {
            GuardianError::AdmissionDenied { retry_after_secs } => {
                let body = ErrorBody::new(code, "Too many requests, please retry later")
                    .retry_after(*retry_after_secs);
                let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
                response
                    .headers_mut()
                    .insert(RETRY_AFTER, HeaderValue::from(*retry_after_secs));
                response
            }
            GuardianError::ValidationFailed { .. } => {
                api_error(StatusCode::BAD_REQUEST, code, "Request contains invalid input")
            }
            GuardianError::CsrfInvalid => {
                api_error(StatusCode::FORBIDDEN, code, "CSRF token missing or invalid")
            }
            GuardianError::QuotaExceeded { percentage, .. } => {
                let body = ErrorBody::new(
                    code,
                    "Your plan's monthly usage limit has been reached. Upgrade your plan to continue.",
                )
                .details(json!({ "percentage": percentage }));
                (StatusCode::PAYMENT_REQUIRED, Json(body)).into_response()
            }
            GuardianError::CredentialLocked { until } => {
                let body = ErrorBody::new(code, "Account temporarily locked")
                    .details(json!({ "locked_until": until }));
                (StatusCode::LOCKED, Json(body)).into_response()
            }
            GuardianError::CredentialExpired => api_error(
                StatusCode::FORBIDDEN,
                code,
                "Temporary password expired, ask an administrator for a new one",
            ),
            GuardianError::InvalidCredentials => {
                api_error(StatusCode::UNAUTHORIZED, code, "Invalid email or password")
            }
            GuardianError::WeakPassword(reasons) => {
                let body = ErrorBody::new(code, "Password does not meet the strength policy")
                    .details(json!({ "errors": reasons }));
                (StatusCode::UNPROCESSABLE_ENTITY, Json(body)).into_response()
            }
            GuardianError::PasswordReused => api_error(
                StatusCode::UNPROCESSABLE_ENTITY,
                code,
                "Password was used recently, choose another one",
            ),
            GuardianError::NotFound(what) => {
                api_error(StatusCode::NOT_FOUND, code, &format!("Not found: {what}"))
            }
            GuardianError::TenantScope(_) => {
                api_error(StatusCode::FORBIDDEN, code, "Access outside the tenant scope")
            }
            _ => {
                error!(error = %err, "request failed");
                api_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", "Internal server error")
            }
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn requester(identity: Option<Extension<ClientIdentity>>) -> String {
    identity
        .map(|Extension(id)| id.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

// ---------------------------------------------------------------------------
// Health and tokens
// ---------------------------------------------------------------------------

/// `GET /health`
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let report = state.health.check().await;
    Json(json!({
        "status": report.status,
        "degraded": state.auto_heal.is_degraded(),
        "mode": report.mode,
        "components": report.components,
        "checked_at": report.checked_at,
    }))
}

/// `GET /api/csrf-token` issues a token bound to the caller's principal.
pub async fn csrf_token_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Json<Value> {
    let token = state.csrf.issue(&bound_identity(&headers));
    Json(json!({
        "token": token,
        "expiresIn": state.config.csrf.token_ttl_seconds,
    }))
}

// ---------------------------------------------------------------------------
// Usage, quota and costs
// ---------------------------------------------------------------------------

/// Body of `POST /api/guardian/usage`.
#[derive(Debug, Deserialize)]
pub struct UsageRequest {
    pub tenant_id: TenantId,
    pub service: String,
    /// Explicit cost in USD. When absent the cost is priced from `units`
    /// and the token counts.
    pub cost: Option<f64>,
    pub units: Option<f64>,
    #[serde(default)]
    pub tokens_in: u64,
    #[serde(default)]
    pub tokens_out: u64,
}

/// `POST /api/guardian/usage`
pub async fn record_usage_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UsageRequest>,
) -> Response {
    let cost = match req.cost {
        Some(cost) if cost.is_finite() && cost >= 0.0 => cost,
        Some(_) => {
            return api_error(
                StatusCode::BAD_REQUEST,
                "invalid_usage",
                "cost must be a non-negative number",
            )
        }
        None => match BillableService::parse(&req.service) {
            Some(service) => state
                .pricing
                .price(service, req.units, req.tokens_in, req.tokens_out),
            None => {
                return api_error(
                    StatusCode::BAD_REQUEST,
                    "invalid_usage",
                    &format!("no pricing for service '{}', supply a cost", req.service),
                )
            }
        },
    };
    let receipt = state
        .record_usage(&req.tenant_id, &req.service, cost, req.tokens_in, req.tokens_out)
        .await;
    (StatusCode::CREATED, Json(receipt)).into_response()
}

/// `GET /api/guardian/quota/:tenant_id`
pub async fn quota_handler(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<String>,
) -> Json<Value> {
    let tenant_id = TenantId::new(tenant_id);
    let status = state.quota.check_quota(&tenant_id);
    Json(json!({
        "quota": status,
        "day": state.quota.day_usage(&tenant_id),
        "month": state.quota.month_usage(&tenant_id),
    }))
}

/// `GET /api/guardian/quota/:tenant_id/enforce` answers `402` once the
/// tenant has used its monthly budget.
pub async fn enforce_quota_handler(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let status = state.ensure_within_quota(&TenantId::new(tenant_id))?;
    Ok(Json(json!(status)))
}

/// `GET /api/guardian/costs`
pub async fn costs_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "daily": state.quota.daily_costs(),
        "monthly": state.quota.monthly_costs(),
        "degraded": state.auto_heal.is_degraded(),
    }))
}

/// `GET /api/guardian/degraded`
pub async fn degraded_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "degraded": state.auto_heal.is_degraded(),
        "status": state.auto_heal.status(),
        "policy": state.auto_heal.degraded_policy(),
    }))
}

// ---------------------------------------------------------------------------
// Tenant-scoped records
// ---------------------------------------------------------------------------

/// `GET /api/records/:entity` with query parameters as equality filters.
/// Requires a bound tenant; shared entities answer 403.
pub async fn list_records_handler(
    State(state): State<Arc<AppState>>,
    Path(entity): Path<String>,
    Query(params): Query<std::collections::BTreeMap<String, String>>,
) -> ApiResult<Json<Value>> {
    let filter = params
        .into_iter()
        .fold(RecordFilter::new(), |filter, (field, value)| filter.eq(field, value));
    let records = state.scoped.for_request(&entity)?.select(&entity, &filter).await?;
    Ok(Json(json!({ "records": records })))
}

/// `POST /api/records/:entity` with one object or an array of objects.
pub async fn insert_records_handler(
    State(state): State<Arc<AppState>>,
    Path(entity): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let rows: Vec<Record> = match body {
        Value::Object(row) => vec![row],
        Value::Array(items) => {
            let mut rows = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::Object(row) => rows.push(row),
                    _ => {
                        return api_error(
                            StatusCode::BAD_REQUEST,
                            "invalid_record",
                            "records must be JSON objects",
                        )
                    }
                }
            }
            rows
        }
        _ => {
            return api_error(
                StatusCode::BAD_REQUEST,
                "invalid_record",
                "records must be JSON objects",
            )
        }
    };
    let repo = match state.scoped.for_request(&entity) {
        Ok(repo) => repo,
        Err(e) => return ApiError(e).into_response(),
    };
    match repo.insert(&entity, rows).await {
        Ok(records) => (StatusCode::CREATED, Json(json!({ "records": records }))).into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

// ---------------------------------------------------------------------------
// Operator: alerts and logs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct AlertsParams {
    pub tenant_id: Option<String>,
    pub limit: Option<usize>,
    /// Read from the alert repository instead of the in-memory ring.
    #[serde(default)]
    pub persisted: bool,
}

/// Default page size.
const DEFAULT_LIMIT: usize = 50;

/// Maximum page size.
const MAX_LIMIT: usize = 1000;

fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT)
}

/// `GET /api/admin/guardian/alerts`
pub async fn alerts_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AlertsParams>,
) -> ApiResult<Json<Value>> {
    let limit = clamp_limit(params.limit);
    let tenant = params.tenant_id.map(TenantId::new);
    let alerts = if params.persisted {
        state.alerts.persisted_alerts(tenant.as_ref(), limit).await?
    } else {
        match &tenant {
            Some(tenant) => state.alerts.alerts_for_tenant(tenant, limit),
            None => state.alerts.recent_alerts(limit),
        }
    };
    Ok(Json(json!({
        "alerts": alerts,
        "health_alerts": state.health_alerts.history(limit),
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct ResetAlertsRequest {
    pub tenant_id: Option<String>,
}

/// `POST /api/admin/guardian/alerts/reset`
pub async fn reset_alerts_handler(
    State(state): State<Arc<AppState>>,
    body: Option<Json<ResetAlertsRequest>>,
) -> Json<Value> {
    let tenant = body.and_then(|Json(req)| req.tenant_id).map(TenantId::new);
    state.alerts.reset_alerts(tenant.as_ref());
    Json(json!({ "reset": true, "tenant_id": tenant }))
}

#[derive(Debug, Deserialize)]
pub struct SecurityLogParams {
    pub event_type: Option<SecurityEventType>,
    pub severity: Option<SecuritySeverity>,
    pub identity: Option<String>,
    /// Look-back window for the query and the stats.
    pub hours: Option<i64>,
    pub limit: Option<usize>,
}

/// `GET /api/admin/guardian/security-logs`
pub async fn security_logs_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SecurityLogParams>,
) -> ApiResult<Json<Value>> {
    let hours = params.hours.unwrap_or(24).max(1);
    let query = SecurityLogQuery {
        event_type: params.event_type,
        severity: params.severity,
        identity: params.identity,
        since: Some(state.clock.now() - Duration::hours(hours)),
        limit: clamp_limit(params.limit),
    };
    let logs = state.security_log.recent(&query).await?;
    let stats = state.security_log.stats(hours).await?;
    Ok(Json(json!({ "logs": logs, "stats": stats })))
}

// ---------------------------------------------------------------------------
// Operator: admission
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct BlacklistRequest {
    pub identity: String,
}

/// `GET /api/admin/guardian/blacklist`
pub async fn list_blacklist_handler(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let blacklisted = state.admission.blacklisted().await?;
    Ok(Json(json!({ "blacklisted": blacklisted })))
}

/// `POST /api/admin/guardian/blacklist`
pub async fn add_blacklist_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BlacklistRequest>,
) -> ApiResult<Response> {
    let identity = ClientIdentity::new(req.identity.trim());
    state.admission.blacklist(&identity).await?;
    Ok((StatusCode::CREATED, Json(json!({ "blacklisted": identity }))).into_response())
}

/// `DELETE /api/admin/guardian/blacklist/:identity`
pub async fn remove_blacklist_handler(
    State(state): State<Arc<AppState>>,
    Path(identity): Path<String>,
) -> ApiResult<Json<Value>> {
    let identity = ClientIdentity::new(identity);
    let removed = state.admission.unblacklist(&identity).await?;
    Ok(Json(json!({ "identity": identity, "removed": removed })))
}

/// `GET /api/admin/guardian/admission`
pub async fn admission_stats_handler(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Value>> {
    let stats = state.admission.stats().await?;
    Ok(Json(json!(stats)))
}

/// `DELETE /api/admin/guardian/admission/:identity`
pub async fn reset_identity_handler(
    State(state): State<Arc<AppState>>,
    Path(identity): Path<String>,
) -> ApiResult<Json<Value>> {
    let identity = ClientIdentity::new(identity);
    let cleared = state.admission.reset_identity(&identity).await?;
    Ok(Json(json!({ "identity": identity, "cleared": cleared })))
}

// ---------------------------------------------------------------------------
// Operator: health and degraded mode
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub limit: Option<usize>,
}

/// `GET /api/admin/guardian/health`
pub async fn health_history_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HistoryParams>,
) -> Json<Value> {
    let limit = params.limit.unwrap_or(20).min(MAX_LIMIT);
    Json(json!({
        "reports": state.health.history(limit),
        "actions": state.auto_heal.actions(limit),
        "missing_credentials": state.auto_heal.missing_credentials(),
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct ExitDegradedRequest {
    pub actor: Option<String>,
}

/// `POST /api/admin/guardian/degraded/exit`
pub async fn exit_degraded_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    session: Option<Extension<AdminSession>>,
    body: Option<Json<ExitDegradedRequest>>,
) -> Json<Value> {
    let actor = body
        .and_then(|Json(req)| req.actor)
        .or_else(|| session.map(|Extension(s)| s.email))
        .unwrap_or_else(|| bound_identity(&headers));
    let exited = state.auto_heal.exit_degraded(&actor);
    Json(json!({ "exited": exited, "status": state.auto_heal.status() }))
}

// ---------------------------------------------------------------------------
// Admin accounts
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ProvisionalRequest {
    pub email: String,
    pub tenant_id: Option<String>,
    pub role: Option<String>,
}

/// `POST /api/admin/accounts/provisional`
pub async fn create_provisional_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ProvisionalRequest>,
) -> ApiResult<Response> {
    if !state.threat.validate_email(&req.email) {
        return Ok(api_error(
            StatusCode::BAD_REQUEST,
            "invalid_email",
            "A valid email address is required",
        ));
    }
    let account = state
        .accounts
        .create_provisional(
            &req.email,
            req.tenant_id.map(TenantId::new),
            req.role.as_deref().unwrap_or("admin"),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(account)).into_response())
}

/// `POST /api/admin/accounts/:id/unlock`
pub async fn unlock_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    state.accounts.unlock(id).await?;
    state.sessions.revoke_credential(id);
    Ok(Json(json!({ "unlocked": true })))
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// `POST /api/admin/auth/login`
///
/// A session token is issued only when the password is current; provisional
/// and expired passwords must be changed first.
pub async fn login_handler(
    State(state): State<Arc<AppState>>,
    identity: Option<Extension<ClientIdentity>>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Json<Value>> {
    let outcome = state
        .accounts
        .verify_login(&req.email, &req.password, &requester(identity))
        .await?;
    let mut body = json!(outcome);
    if !outcome.must_change_password && !outcome.password_expired {
        let (token, session) = state.sessions.issue(&outcome);
        body["token"] = json!(token);
        body["session_expires_at"] = json!(session.expires_at);
    }
    Ok(Json(body))
}

/// `POST /api/admin/auth/logout`
pub async fn logout_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Json<Value> {
    let revoked = bearer_token(&headers).is_some_and(|token| state.sessions.revoke(token));
    Json(json!({ "logged_out": revoked }))
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub credential_id: Uuid,
    pub current_password: String,
    pub new_password: String,
}

/// `POST /api/admin/auth/change-password`
pub async fn change_password_handler(
    State(state): State<Arc<AppState>>,
    identity: Option<Extension<ClientIdentity>>,
    Json(req): Json<ChangePasswordRequest>,
) -> ApiResult<Json<Value>> {
    state
        .accounts
        .change_password(
            req.credential_id,
            &req.current_password,
            &req.new_password,
            &requester(identity),
        )
        .await?;
    state.sessions.revoke_credential(req.credential_id);
    Ok(Json(json!({ "changed": true })))
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Every Guardian route, without state or guards.
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/api/csrf-token", get(csrf_token_handler))
        .route("/api/guardian/usage", post(record_usage_handler))
        .route("/api/guardian/quota/:tenant_id", get(quota_handler))
        .route("/api/guardian/quota/:tenant_id/enforce", get(enforce_quota_handler))
        .route("/api/guardian/costs", get(costs_handler))
        .route("/api/guardian/degraded", get(degraded_handler))
        .route(
            "/api/records/:entity",
            get(list_records_handler).post(insert_records_handler),
        )
        .route("/api/admin/guardian/alerts", get(alerts_handler))
        .route("/api/admin/guardian/alerts/reset", post(reset_alerts_handler))
        .route("/api/admin/guardian/security-logs", get(security_logs_handler))
        .route(
            "/api/admin/guardian/blacklist",
            get(list_blacklist_handler).post(add_blacklist_handler),
        )
        .route(
            "/api/admin/guardian/blacklist/:identity",
            delete(remove_blacklist_handler),
        )
        .route("/api/admin/guardian/admission", get(admission_stats_handler))
        .route(
            "/api/admin/guardian/admission/:identity",
            delete(reset_identity_handler),
        )
        .route("/api/admin/guardian/health", get(health_history_handler))
        .route("/api/admin/guardian/degraded/exit", post(exit_degraded_handler))
        .route("/api/admin/accounts/provisional", post(create_provisional_handler))
        .route("/api/admin/accounts/:id/unlock", post(unlock_handler))
        .route("/api/admin/auth/login", post(login_handler))
        .route("/api/admin/auth/logout", post(logout_handler))
        .route("/api/admin/auth/change-password", post(change_password_handler))
}

/// Wrap `routes` in the guard stack. Services embedding the Guardian merge
/// their own routes into [`api_routes`] before calling this.
pub fn with_guards(routes: Router<Arc<AppState>>, state: Arc<AppState>) -> Router {
    routes
        .route_layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            validation_middleware,
        ))
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            csrf_middleware,
        ))
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            admin_auth_middleware,
        ))
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            admission_middleware,
        ))
        .layer(axum::middleware::from_fn(tenant_context_middleware))
        .with_state(state)
}

/// Build the axum [`Router`] with every route and the guard stack.
pub fn build_router(state: Arc<AppState>) -> Router {
    with_guards(api_routes(), state)
}
