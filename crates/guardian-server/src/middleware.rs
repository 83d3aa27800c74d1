//! Request guards applied in front of every handler.
//!
//! Order, outermost first: tenant context, admission, admin auth, CSRF,
//! validation. All but validation wrap the whole router; validation is a
//! route layer so matched path parameters are available to the threat scan.

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, FromRequestParts, Query, RawPathParams, State};
use axum::http::header::{CONTENT_LENGTH, RETRY_AFTER};
use axum::http::request::Parts;
use axum::http::{HeaderValue, Method, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use guardian_core::{
    AdmissionDecision, ClientIdentity, DenyReason, RouteClass, ScanReport, SecurityEventType,
    TenantId, ThreatFinding, ThreatKind,
};
use guardian_storage::{current_tenant, with_tenant};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::warn;

use crate::admission::resolve_identity;
use crate::api::ErrorBody;
use crate::csrf::bound_identity;
use crate::security_log::SecurityEvent;
use crate::sessions::bearer_token;
use crate::state::AppState;

/// Header binding a request to a tenant.
pub const TENANT_HEADER: &str = "x-tenant-id";

/// Operator routes; everything below requires an admin session.
pub const ADMIN_PREFIX: &str = "/api/admin/";

/// Admin routes reachable without a session. Both verify a password.
const ADMIN_PUBLIC_ROUTES: [&str; 2] = [
    "/api/admin/auth/login",
    "/api/admin/auth/change-password",
];

/// Largest request body the guards will buffer.
const MAX_BODY_BYTES: usize = 1024 * 1024;

// ---------------------------------------------------------------------------
// Tenant context
// ---------------------------------------------------------------------------

/// Bind the `x-tenant-id` tenant to the task serving this request so
/// scoped repositories pick it up.
pub async fn tenant_context_middleware(mut req: Request<Body>, next: Next) -> Response {
    let tenant = req
        .headers()
        .get(TENANT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(TenantId::new);
    match tenant {
        Some(tenant) => {
            req.extensions_mut().insert(tenant.clone());
            with_tenant(tenant, next.run(req)).await
        }
        None => next.run(req).await,
    }
}

// ---------------------------------------------------------------------------
// Admission
// ---------------------------------------------------------------------------

/// Rate limit, block and blacklist enforcement per client identity and
/// route class.
pub async fn admission_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let identity = resolve_identity(req.headers(), peer, state.admission.trust_forwarded_for());
    let route_class = RouteClass::classify(req.uri().path());
    let decision = state.admission.check(&identity, route_class).await;

    let mut response = if decision.allowed {
        req.extensions_mut().insert(identity);
        next.run(req).await
    } else {
        denied_response(&decision)
    };
    set_rate_limit_headers(&mut response, &decision);
    response
}

fn denied_response(decision: &AdmissionDecision) -> Response {
    let reason = decision.reason.unwrap_or(DenyReason::RateLimited);
    if reason == DenyReason::Blacklisted {
        let body = ErrorBody::new(reason.as_str(), "Access from this client has been blocked");
        return (StatusCode::FORBIDDEN, Json(body)).into_response();
    }

    let retry_after = decision.retry_after_secs.unwrap_or(1);
    let body = ErrorBody::new(reason.as_str(), "Too many requests, please retry later")
        .retry_after(retry_after);
    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    response
        .headers_mut()
        .insert(RETRY_AFTER, HeaderValue::from(retry_after));
    response
}

fn set_rate_limit_headers(response: &mut Response, decision: &AdmissionDecision) {
    let headers = response.headers_mut();
    headers.insert("x-ratelimit-limit", HeaderValue::from(decision.limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(decision.remaining));
}

// ---------------------------------------------------------------------------
// Admin auth
// ---------------------------------------------------------------------------

/// Resolve the admin session behind every operator route. Missing or unknown
/// bearer tokens get 401; tenant-bound admins get 403.
pub async fn admin_auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let path = req.uri().path();
    if !path.starts_with(ADMIN_PREFIX) || ADMIN_PUBLIC_ROUTES.contains(&path) {
        return next.run(req).await;
    }

    let session = bearer_token(req.headers()).and_then(|token| state.sessions.resolve(token));
    let (parts, body) = req.into_parts();
    let Some(session) = session else {
        state.security_log.log(
            SecurityEvent::new(SecurityEventType::AuthFailure, requester(&parts))
                .request(parts.method.as_str(), parts.uri.path())
                .details(json!({ "reason": "missing or unknown admin session" })),
        );
        let body = ErrorBody::new("unauthorized", "Admin session required");
        return (StatusCode::UNAUTHORIZED, Json(body)).into_response();
    };

    if !session.is_platform_admin() {
        state.security_log.log(
            SecurityEvent::new(SecurityEventType::PermissionDenied, session.email.clone())
                .tenant(session.tenant_id.clone())
                .request(parts.method.as_str(), parts.uri.path()),
        );
        let body = ErrorBody::new("forbidden", "Operator routes require a platform admin");
        return (StatusCode::FORBIDDEN, Json(body)).into_response();
    }

    req = Request::from_parts(parts, body);
    req.extensions_mut().insert(session);
    next.run(req).await
}

// ---------------------------------------------------------------------------
// CSRF
// ---------------------------------------------------------------------------

/// Require a valid anti-forgery token on state-changing requests to
/// non-exempt routes. The token is read from the configured header, else
/// from the JSON body field.
pub async fn csrf_middleware(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let csrf = &state.csrf;
    if !csrf.enabled() || csrf.is_exempt(req.method(), req.uri().path()) {
        return next.run(req).await;
    }

    let bound = bound_identity(req.headers());
    let header_token = req
        .headers()
        .get(csrf.header_name())
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let (parts, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => return payload_too_large(),
    };
    let token = header_token.or_else(|| {
        serde_json::from_slice::<Value>(&bytes)
            .ok()
            .and_then(|v| v.get(csrf.body_field()).and_then(Value::as_str).map(str::to_string))
    });

    if csrf.validate(token.as_deref(), &bound) {
        return next.run(Request::from_parts(parts, Body::from(bytes))).await;
    }

    state.metrics.record_csrf_failure();
    state.security_log.log(
        SecurityEvent::new(SecurityEventType::CsrfFailure, requester(&parts))
            .tenant(current_tenant())
            .request(parts.method.as_str(), parts.uri.path())
            .details(json!({ "token_present": token.is_some(), "bound_identity": bound })),
    );
    let body = ErrorBody::new("csrf_invalid", "CSRF token missing or invalid");
    (StatusCode::FORBIDDEN, Json(body)).into_response()
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn is_state_changing(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH | Method::DELETE)
}

fn requester(parts: &Parts) -> String {
    parts
        .extensions
        .get::<ClientIdentity>()
        .map(|id| id.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn event_type_for(kind: ThreatKind) -> SecurityEventType {
    match kind {
        ThreatKind::SqlInjection => SecurityEventType::SqlInjectionAttempt,
        ThreatKind::Xss => SecurityEventType::XssAttempt,
        ThreatKind::PathTraversal => SecurityEventType::PathTraversalAttempt,
        ThreatKind::PromptInjection => SecurityEventType::PromptInjectionAttempt,
        ThreatKind::DepthExceeded => SecurityEventType::InvalidInput,
    }
}

fn payload_too_large() -> Response {
    let body = ErrorBody::new("payload_too_large", "Request body too large");
    (StatusCode::PAYLOAD_TOO_LARGE, Json(body)).into_response()
}

async fn path_params(parts: &mut Parts) -> Value {
    match RawPathParams::from_request_parts(parts, &()).await {
        Ok(params) => Value::Object(
            params
                .iter()
                .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
                .collect(),
        ),
        Err(_) => Value::Object(Map::new()),
    }
}

fn query_params(parts: &Parts) -> Value {
    match Query::<HashMap<String, String>>::try_from_uri(&parts.uri) {
        Ok(Query(map)) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, Value::String(v)))
                .collect(),
        ),
        // Scan the raw query rather than skipping it.
        Err(_) => json!({ "raw": parts.uri.query().unwrap_or_default() }),
    }
}

/// Screen `{body, query, params}` for threats, reject on any finding and
/// pass a sanitized JSON body on success.
pub async fn validation_middleware(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if !state.config.threat.enabled {
        return next.run(req).await;
    }

    let (mut parts, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => return payload_too_large(),
    };

    let body_value = if bytes.is_empty() {
        Value::Null
    } else {
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(value) => value,
            Err(e) if is_state_changing(&parts.method) => {
                state.security_log.log(
                    SecurityEvent::new(SecurityEventType::InvalidInput, requester(&parts))
                        .tenant(current_tenant())
                        .request(parts.method.as_str(), parts.uri.path())
                        .details(json!({ "reason": "undecodable_body" })),
                );
                let mut body = ErrorBody::new("validation_failed", "Request body is not valid JSON");
                if state.config.diagnostics_enabled() {
                    body = body.details(json!({ "parse_error": e.to_string() }));
                }
                return (StatusCode::BAD_REQUEST, Json(body)).into_response();
            }
            Err(_) => Value::Null,
        }
    };

    let payload = json!({
        "body": body_value,
        "query": query_params(&parts),
        "params": path_params(&mut parts).await,
    });
    let mut findings = state.threat.scan(&payload).findings;
    if state.threat.is_conversation_route(parts.uri.path()) {
        findings.extend(state.threat.scan_conversation(&body_value).findings);
    }

    if !findings.is_empty() {
        return reject(&state, &parts, ScanReport::from_findings(findings));
    }

    let forwarded = if body_value.is_null() {
        bytes
    } else {
        match serde_json::to_vec(&state.threat.sanitize(&body_value)) {
            Ok(clean) => {
                parts.headers.remove(CONTENT_LENGTH);
                Bytes::from(clean)
            }
            Err(_) => bytes,
        }
    };
    next.run(Request::from_parts(parts, Body::from(forwarded))).await
}

fn reject(state: &AppState, parts: &Parts, report: ScanReport) -> Response {
    state.metrics.record_threats(&report.findings);

    let mut by_kind: BTreeMap<&'static str, (ThreatKind, Vec<&ThreatFinding>)> = BTreeMap::new();
    for finding in &report.findings {
        by_kind
            .entry(finding.kind.as_str())
            .or_insert_with(|| (finding.kind, Vec::new()))
            .1
            .push(finding);
    }
    let identity = requester(parts);
    for (kind, (threat, findings)) in &by_kind {
        warn!(
            identity = %identity,
            path = %parts.uri.path(),
            kind = *kind,
            count = findings.len(),
            "request rejected by threat scan"
        );
        state.security_log.log(
            SecurityEvent::new(event_type_for(*threat), identity.clone())
                .tenant(current_tenant())
                .request(parts.method.as_str(), parts.uri.path())
                .details(json!({ "findings": findings })),
        );
    }

    let threats: Vec<&str> = by_kind.keys().copied().collect();
    let mut details = json!({ "threats": threats });
    if state.config.diagnostics_enabled() {
        details["findings"] = json!(report.findings);
    }
    let body = ErrorBody::new("validation_failed", "Request contains invalid input").details(details);
    (StatusCode::BAD_REQUEST, Json(body)).into_response()
}
