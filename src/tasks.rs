// vigil: Background task registry

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::hub::protocol::HubMessage;
use crate::hub::HubHandle;

/// Lifecycle of a tracked background task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Running,
    Stopped,
    Completed,
    Failed,
}

/// Externally visible task record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: Uuid,
    pub name: String,
    pub status: TaskStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

struct Tracked {
    info: TaskInfo,
    stop: watch::Sender<bool>,
}

/// Registry of long-running service tasks
///
/// Tasks register at spawn and watch their stop signal; status changes are
/// broadcast to subscribers as task-update envelopes.
pub struct TaskRegistry {
    tasks: RwLock<HashMap<Uuid, Tracked>>,
    hub: HubHandle,
}

impl TaskRegistry {
    pub fn new(hub: HubHandle) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            hub,
        }
    }

    /// Track a new task; the returned receiver fires when a stop is requested
    pub fn register(&self, name: &str) -> (Uuid, watch::Receiver<bool>) {
        let (stop, stop_rx) = watch::channel(false);
        let info = TaskInfo {
            id: Uuid::new_v4(),
            name: name.to_string(),
            status: TaskStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            detail: None,
        };
        let id = info.id;
        self.tasks.write().insert(id, Tracked { info, stop });
        self.broadcast_update(id);
        (id, stop_rx)
    }

    fn finish(&self, id: Uuid, status: TaskStatus, detail: Option<String>) {
        let mut tasks = self.tasks.write();
        if let Some(tracked) = tasks.get_mut(&id) {
            if tracked.info.status == TaskStatus::Running {
                tracked.info.status = status;
                tracked.info.finished_at = Some(Utc::now());
                tracked.info.detail = detail;
            }
        }
    }

    /// Mark a task as finished normally
    pub fn complete(&self, id: Uuid) {
        self.finish(id, TaskStatus::Completed, None);
        self.broadcast_update(id);
    }

    /// Mark a task as failed
    pub fn fail(&self, id: Uuid, detail: &str) {
        self.finish(id, TaskStatus::Failed, Some(detail.to_string()));
        self.broadcast_update(id);
    }

    /// Request a stop; the task observes its signal and exits
    pub fn stop(&self, id: Uuid) -> CoreResult<()> {
        let mut tasks = self.tasks.write();
        let tracked = tasks
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("task {}", id)))?;
        if tracked.info.status != TaskStatus::Running {
            return Err(CoreError::InvalidInput(format!(
                "task {} is not running",
                id
            )));
        }
        let _ = tracked.stop.send(true);
        tracked.info.status = TaskStatus::Stopped;
        tracked.info.finished_at = Some(Utc::now());
        info!(task = %id, name = %tracked.info.name, "Task stopped");
        drop(tasks);
        self.broadcast_update(id);
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> CoreResult<TaskInfo> {
        self.tasks
            .read()
            .get(&id)
            .map(|t| t.info.clone())
            .ok_or_else(|| CoreError::NotFound(format!("task {}", id)))
    }

    /// Tasks ordered newest first, with offset/limit paging
    pub fn list(&self, limit: usize, offset: usize, status: Option<TaskStatus>) -> Vec<TaskInfo> {
        let mut tasks: Vec<TaskInfo> = self
            .tasks
            .read()
            .values()
            .map(|t| t.info.clone())
            .filter(|info| status.map_or(true, |s| info.status == s))
            .collect();
        tasks.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        tasks.into_iter().skip(offset).take(limit.max(1)).collect()
    }

    fn broadcast_update(&self, id: Uuid) {
        if let Ok(info) = self.get(id) {
            self.hub.try_broadcast(HubMessage::task_update(json!(info)));
        }
    }
}
