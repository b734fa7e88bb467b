// vigil: API request/response models

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::auth::Role;
use crate::metrics::{MetricShape, RecordAction};
use crate::tasks::TaskStatus;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub username: String,
    pub role: Role,
    pub expires_at: i64,
}

#[derive(Debug, Serialize)]
pub struct WhoamiResponse {
    pub username: String,
    pub role: Role,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct SystemStatusResponse {
    pub version: &'static str,
    pub hostname: String,
    pub uptime_secs: u64,
    pub rules: usize,
    pub active_alerts: usize,
    pub subscribers: usize,
    pub sinks: Vec<&'static str>,
    pub running_tasks: usize,
}

#[derive(Debug, Deserialize)]
pub struct MetricsFormatQuery {
    #[serde(default)]
    pub format: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SilenceRequest {
    pub duration_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct TaskListQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub status: Option<TaskStatus>,
}

fn default_limit() -> usize {
    50
}

#[derive(Debug, Deserialize)]
pub struct TestNotificationRequest {
    /// Sink name, e.g. "chat-webhook"; omitted means every configured sink
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TestNotificationResponse {
    pub results: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    pub role: Role,
}

#[derive(Debug, Deserialize)]
pub struct UpdatePasswordRequest {
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateCustomMetricRequest {
    #[serde(flatten)]
    pub shape: MetricShape,
}

#[derive(Debug, Deserialize)]
pub struct RecordMetricRequest {
    pub name: String,
    pub action: RecordAction,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub duration_secs: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct OkResponse {
    pub ok: bool,
}

impl OkResponse {
    pub fn new() -> Self {
        Self { ok: true }
    }
}
