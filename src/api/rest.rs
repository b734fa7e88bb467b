// vigil: REST API

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::alerts::engine::{AlertCommands, EngineHandle};
use crate::alerts::rule::{Rule, RuleSpec};
use crate::alerts::state::{AlertInstance, AlertState};
use crate::alerts::store::RuleStore;
use crate::api::models::*;
use crate::auth::{Permission, Role, TokenIssuer, UserStore};
use crate::config::Config;
use crate::error::CoreError;
use crate::hub::HubHandle;
use crate::metrics::{encode_text, CustomMetrics, InternalMetrics, MetricRegistry};
use crate::notify::webhook::{execute_command, parse_interactive, parse_slash};
use crate::notify::SinkSet;
use crate::tasks::TaskRegistry;

/// Everything the handlers need
pub struct AppState {
    pub config: Config,
    pub registry: Arc<MetricRegistry>,
    pub custom: Arc<CustomMetrics>,
    pub rules: Arc<RuleStore>,
    pub engine: EngineHandle,
    pub hub: HubHandle,
    pub users: Arc<UserStore>,
    pub tokens: Arc<TokenIssuer>,
    pub sinks: Arc<SinkSet>,
    pub tasks: Arc<TaskRegistry>,
    pub started_at: DateTime<Utc>,
}

/// Core error carried out of a handler
pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::Conflict(_) => StatusCode::CONFLICT,
            CoreError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            CoreError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            CoreError::Forbidden(_) => StatusCode::FORBIDDEN,
            CoreError::NotConfigured(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::Transient(_) | CoreError::Permanent(_) => StatusCode::BAD_GATEWAY,
            CoreError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            CoreError::Canceled(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// Authenticated caller, extracted from the bearer token
pub struct AuthUser {
    pub username: String,
    pub role: Role,
}

impl AuthUser {
    pub fn require(&self, permission: Permission) -> Result<(), ApiError> {
        self.role.require(permission).map_err(ApiError)
    }
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|h| h.strip_prefix("Bearer "))
            .ok_or_else(|| {
                ApiError(CoreError::Unauthorized("missing bearer token".to_string()))
            })?;
        authorize(state, token).map_err(ApiError)
    }
}

/// Verify a token and confirm the account is still active
pub fn authorize(state: &AppState, token: &str) -> Result<AuthUser, CoreError> {
    let claims = state.tokens.verify(token)?;
    match state.users.get(&claims.sub) {
        Ok(user) if user.active => Ok(AuthUser {
            username: claims.sub,
            role: claims.role,
        }),
        _ => Err(CoreError::Unauthorized("invalid credentials".to_string())),
    }
}

/// Build the API router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/auth/login", post(login))
        .route("/api/auth/logout", post(logout))
        .route("/api/auth/whoami", get(whoami))
        .route("/api/system/status", get(system_status))
        .route("/api/system/health", get(health))
        .route("/api/system/metrics", get(metrics_json))
        .route("/metrics", get(metrics_text))
        .route("/api/alerts", get(list_rules).post(create_rule))
        .route("/api/alerts/active", get(active_alerts))
        .route("/api/alerts/:id", get(get_rule).put(update_rule).delete(delete_rule))
        .route("/api/alerts/:id/silence", post(silence_alert))
        .route("/api/alerts/:id/resolve", post(resolve_alert))
        .route("/api/tasks", get(list_tasks))
        .route("/api/tasks/:id", get(get_task))
        .route("/api/tasks/:id/stop", post(stop_task))
        .route("/api/notify/test", post(test_notification))
        .route("/api/users", get(list_users).post(create_user))
        .route("/api/users/:name", get(get_user))
        .route("/api/users/:name/password", put(update_password))
        .route("/api/users/:name/deactivate", post(deactivate_user))
        .route("/api/custom-metrics", get(list_custom_metrics).post(create_custom_metric))
        .route("/api/custom-metrics/summary", get(custom_metrics_summary))
        .route("/api/custom-metrics/record", post(record_custom_metric))
        .route("/api/custom-metrics/:name", delete(delete_custom_metric))
        .route("/api/callbacks/interactive", post(interactive_callback))
        .route("/api/callbacks/slash", post(slash_callback))
        .route("/ws", get(crate::api::ws::upgrade))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

// --- auth ---

async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let user = state.users.authenticate(&req.username, &req.password)?;
    let token = state.tokens.issue(&user.username, user.role)?;
    let claims = state.tokens.verify(&token)?;
    Ok(Json(LoginResponse {
        token,
        username: user.username,
        role: user.role,
        expires_at: claims.exp,
    }))
}

async fn logout(_user: AuthUser) -> Json<OkResponse> {
    // tokens are self-contained; the client discards its copy
    Json(OkResponse::new())
}

async fn whoami(user: AuthUser) -> Json<WhoamiResponse> {
    Json(WhoamiResponse {
        username: user.username,
        role: user.role,
    })
}

// --- system ---

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

fn status_body(state: &AppState) -> SystemStatusResponse {
    let alerts = state.engine.status();
    SystemStatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        hostname: hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string()),
        uptime_secs: (Utc::now() - state.started_at).num_seconds().max(0) as u64,
        rules: state.rules.len(),
        active_alerts: alerts
            .iter()
            .filter(|a| a.state == AlertState::Firing)
            .count(),
        subscribers: state.hub.subscriber_count(),
        sinks: state.sinks.names(),
        running_tasks: state
            .tasks
            .list(usize::MAX, 0, Some(crate::tasks::TaskStatus::Running))
            .len(),
    }
}

async fn system_status(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> Result<Json<SystemStatusResponse>, ApiError> {
    user.require(Permission::Read)?;
    Ok(Json(status_body(&state)))
}

async fn metrics_text(State(state): State<Arc<AppState>>) -> Response {
    let mut body = encode_text(&state.registry.gather());
    body.push_str(&InternalMetrics::global().encode());
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}

async fn metrics_json(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Query(query): Query<MetricsFormatQuery>,
) -> Result<Response, ApiError> {
    user.require(Permission::Read)?;
    match query.format.as_deref() {
        None | Some("json") => Ok(Json(json!({
            "metrics": state.registry.gather(),
        }))
        .into_response()),
        Some("text-exposition") => Ok(metrics_text(State(state)).await),
        Some(other) => Err(ApiError(CoreError::InvalidInput(format!(
            "unknown metrics format: {}",
            other
        )))),
    }
}

// --- alert rules ---

async fn list_rules(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> Result<Json<Vec<Rule>>, ApiError> {
    user.require(Permission::Read)?;
    Ok(Json(state.rules.list()))
}

async fn active_alerts(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> Result<Json<Vec<AlertInstance>>, ApiError> {
    user.require(Permission::Read)?;
    Ok(Json(state.engine.status()))
}

async fn get_rule(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<Rule>, ApiError> {
    user.require(Permission::Read)?;
    Ok(Json(state.rules.get(id)?))
}

async fn create_rule(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(spec): Json<RuleSpec>,
) -> Result<(StatusCode, Json<Rule>), ApiError> {
    user.require(Permission::WriteAlerts)?;
    let rule = state.rules.add(spec)?;
    Ok((StatusCode::CREATED, Json(rule)))
}

async fn update_rule(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Json(spec): Json<RuleSpec>,
) -> Result<Json<Rule>, ApiError> {
    user.require(Permission::WriteAlerts)?;
    Ok(Json(state.rules.update(id, spec)?))
}

async fn delete_rule(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<OkResponse>, ApiError> {
    user.require(Permission::WriteAlerts)?;
    state.rules.delete(id)?;
    Ok(Json(OkResponse::new()))
}

async fn silence_alert(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Json(req): Json<SilenceRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    user.require(Permission::WriteAlerts)?;
    if req.duration_secs == 0 {
        return Err(ApiError(CoreError::InvalidInput(
            "silence duration must be non-zero".to_string(),
        )));
    }
    state.engine.silence(id, req.duration_secs).await?;
    Ok(Json(OkResponse::new()))
}

async fn resolve_alert(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<OkResponse>, ApiError> {
    user.require(Permission::WriteAlerts)?;
    state.engine.resolve(id).await?;
    Ok(Json(OkResponse::new()))
}

// --- tasks ---

async fn list_tasks(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Query(query): Query<TaskListQuery>,
) -> Result<Json<Vec<crate::tasks::TaskInfo>>, ApiError> {
    user.require(Permission::Read)?;
    Ok(Json(state.tasks.list(query.limit, query.offset, query.status)))
}

async fn get_task(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<crate::tasks::TaskInfo>, ApiError> {
    user.require(Permission::Read)?;
    Ok(Json(state.tasks.get(id)?))
}

async fn stop_task(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<OkResponse>, ApiError> {
    user.require(Permission::WriteTasks)?;
    state.tasks.stop(id)?;
    Ok(Json(OkResponse::new()))
}

// --- notifications ---

async fn test_notification(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(req): Json<TestNotificationRequest>,
) -> Result<Json<TestNotificationResponse>, ApiError> {
    user.require(Permission::WriteAlerts)?;
    let message = req
        .message
        .unwrap_or_else(|| "vigil test notification".to_string());

    let mut results = HashMap::new();
    match req.kind.as_deref() {
        Some(kind) => {
            let sink = state.sinks.get(kind).ok_or_else(|| {
                ApiError(CoreError::NotFound(format!("sink {}", kind)))
            })?;
            let outcome = sink.test(&message).await;
            results.insert(
                sink.name().to_string(),
                outcome.map_or_else(|e| e.to_string(), |_| "ok".to_string()),
            );
        }
        None => {
            for sink in state.sinks.iter() {
                let outcome = sink.test(&message).await;
                results.insert(
                    sink.name().to_string(),
                    outcome.map_or_else(|e| e.to_string(), |_| "ok".to_string()),
                );
            }
        }
    }
    Ok(Json(TestNotificationResponse { results }))
}

// --- users ---

async fn list_users(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> Result<Json<Vec<crate::auth::User>>, ApiError> {
    user.require(Permission::ManageUsers)?;
    Ok(Json(state.users.list()))
}

async fn get_user(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(name): Path<String>,
) -> Result<Json<crate::auth::User>, ApiError> {
    user.require(Permission::ManageUsers)?;
    Ok(Json(state.users.get(&name)?))
}

async fn create_user(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(req): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<crate::auth::User>), ApiError> {
    user.require(Permission::ManageUsers)?;
    let created = state
        .users
        .create(&req.username, &req.email, &req.password, req.role)?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn update_password(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(name): Path<String>,
    Json(req): Json<UpdatePasswordRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    // users change their own password; admins change anyone's
    if user.username != name {
        user.require(Permission::ManageUsers)?;
    }
    state.users.update_password(&name, &req.password)?;
    Ok(Json(OkResponse::new()))
}

async fn deactivate_user(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(name): Path<String>,
) -> Result<Json<OkResponse>, ApiError> {
    user.require(Permission::ManageUsers)?;
    state.users.deactivate(&name)?;
    Ok(Json(OkResponse::new()))
}

// --- custom metrics ---

async fn list_custom_metrics(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> Result<Json<Vec<crate::metrics::CustomMetricDef>>, ApiError> {
    user.require(Permission::Read)?;
    Ok(Json(state.custom.list()))
}

async fn custom_metrics_summary(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> Result<Json<Vec<crate::metrics::MetricOverview>>, ApiError> {
    user.require(Permission::Read)?;
    Ok(Json(state.custom.summary()))
}

async fn create_custom_metric(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(req): Json<CreateCustomMetricRequest>,
) -> Result<(StatusCode, Json<crate::metrics::CustomMetricDef>), ApiError> {
    user.require(Permission::WriteTasks)?;
    let def = state.custom.create(req.shape)?;
    Ok((StatusCode::CREATED, Json(def)))
}

async fn delete_custom_metric(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(name): Path<String>,
) -> Result<Json<OkResponse>, ApiError> {
    user.require(Permission::WriteTasks)?;
    state.custom.delete(&name)?;
    Ok(Json(OkResponse::new()))
}

async fn record_custom_metric(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(req): Json<RecordMetricRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    user.require(Permission::WriteTasks)?;
    state
        .custom
        .record(&req.name, req.action, &req.labels, req.value, req.duration_secs)?;
    Ok(Json(OkResponse::new()))
}

// --- chat callbacks ---

async fn interactive_callback(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let command = parse_interactive(&payload)?;
    Ok(Json(execute_command(command, &state.engine).await?))
}

async fn slash_callback(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let command = parse_slash(&payload)?;
    Ok(Json(execute_command(command, &state.engine).await?))
}
