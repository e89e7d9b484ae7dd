//! Task creation, update, and cancellation.

use std::sync::Arc;

use serde_json::Value;
use slatedb::IsolationLevel;
use tracing::debug;

use crate::codec::{decode_task_data, encode_task_data, encode_task_id};
use crate::ids::TaskId;
use crate::keys::{path_key, scheduled_key, task_key, LAST_TASK_ID_KEY};
use crate::manager::gc::GcOutcome;
use crate::manager::helpers::retry_on_txn_conflict;
use crate::manager::{Task, TaskManager, TaskManagerError};
use crate::promise::TaskFailure;
use crate::task::{
    now_epoch_ms, to_deadline, to_delay, to_priority, TaskData, TaskInfo, TaskStatus,
};

/// Parameters for `schedule_task`.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub handler_id: String,
    pub parameters: Vec<Value>,
    /// Relative offset from creation time, ms. Negative values clamp to 0.
    pub delay_ms: i64,
    /// Per-attempt execution budget, ms. `None` means unbounded.
    pub deadline_ms: Option<u64>,
    /// Clamped to [-128, 127]; larger values win dispatch.
    pub priority: i64,
    /// Grouping tags; tags must not contain '/'.
    pub path: Vec<String>,
    /// Skip eager promise registration; callers can still subscribe later.
    pub lazy: bool,
}

impl TaskSpec {
    pub fn new(handler_id: impl Into<String>) -> Self {
        TaskSpec {
            handler_id: handler_id.into(),
            parameters: Vec::new(),
            delay_ms: 0,
            deadline_ms: None,
            priority: 0,
            path: Vec::new(),
            lazy: false,
        }
    }
}

/// Partial mutation of a still-scheduled task.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub handler_id: Option<String>,
    pub parameters: Option<Vec<Value>>,
    pub delay_ms: Option<i64>,
    /// `Some(None)` clears the deadline.
    pub deadline_ms: Option<Option<u64>>,
    pub priority: Option<i64>,
    pub path: Option<Vec<String>>,
}

enum CancelOutcome {
    Active,
    Removed,
    Missing,
}

impl TaskManager {
    /// Create a task and persist it into the scheduled index.
    pub async fn schedule_task(self: &Arc<Self>, spec: TaskSpec) -> Result<Task, TaskManagerError> {
        validate_path(&spec.path)?;
        let data = TaskData {
            handler_id: spec.handler_id,
            parameters: spec.parameters,
            timestamp_ms: now_epoch_ms(),
            delay_ms: to_delay(spec.delay_ms),
            priority: to_priority(spec.priority),
            deadline_ms: to_deadline(spec.deadline_ms),
            path: spec.path,
        };

        let id = retry_on_txn_conflict("schedule_task", || self.schedule_task_inner(&data)).await?;
        if !spec.lazy {
            let _ = self.promises.subscribe(id);
        }
        self.scheduler.trigger();
        debug!(task_id = %id, handler_id = %data.handler_id, due_ms = data.due_time_ms(), "task scheduled");

        Ok(Task {
            manager: Arc::downgrade(self),
            info: TaskInfo::new(id, TaskStatus::Scheduled, &data),
        })
    }

    async fn schedule_task_inner(&self, data: &TaskData) -> Result<TaskId, TaskManagerError> {
        // Id allocation is serialized so the persisted high-water mark moves
        // monotonically even under concurrent scheduling.
        let _alloc = self.last_id_lock.lock().await;
        let id = self.ids.generate();

        let txn = self.db.begin(IsolationLevel::SerializableSnapshot).await?;
        txn.put(task_key(&id).as_bytes(), &encode_task_data(data)?)?;
        txn.put(scheduled_key(data.due_time_ms(), &id).as_bytes(), b"")?;
        txn.put(path_key(&data.path, &id).as_bytes(), b"")?;
        txn.put(LAST_TASK_ID_KEY.as_bytes(), &encode_task_id(&id))?;
        txn.commit().await?;
        Ok(id)
    }

    /// Mutate a task that is still in the scheduled index. Fails with
    /// `TaskRunning` once the task has been queued or dispatched.
    pub async fn update_task(
        &self,
        id: TaskId,
        patch: TaskPatch,
    ) -> Result<TaskInfo, TaskManagerError> {
        if let Some(path) = &patch.path {
            validate_path(path)?;
        }
        let info = retry_on_txn_conflict("update_task", || self.update_task_inner(id, &patch)).await?;
        self.scheduler.trigger();
        Ok(info)
    }

    async fn update_task_inner(
        &self,
        id: TaskId,
        patch: &TaskPatch,
    ) -> Result<TaskInfo, TaskManagerError> {
        let _guard = self.locks.lock(id).await;
        let txn = self.db.begin(IsolationLevel::SerializableSnapshot).await?;

        let Some(raw) = txn.get(task_key(&id).as_bytes()).await? else {
            return Err(TaskManagerError::TaskMissing(id));
        };
        let mut data = decode_task_data(&raw)?;

        let old_scheduled_key = scheduled_key(data.due_time_ms(), &id);
        if txn.get(old_scheduled_key.as_bytes()).await?.is_none() {
            return Err(TaskManagerError::TaskRunning(id));
        }
        let old_path_key = path_key(&data.path, &id);

        if let Some(handler_id) = &patch.handler_id {
            data.handler_id = handler_id.clone();
        }
        if let Some(parameters) = &patch.parameters {
            data.parameters = parameters.clone();
        }
        if let Some(delay_ms) = patch.delay_ms {
            data.delay_ms = to_delay(delay_ms);
        }
        if let Some(deadline_ms) = patch.deadline_ms {
            data.deadline_ms = to_deadline(deadline_ms);
        }
        if let Some(priority) = patch.priority {
            data.priority = to_priority(priority);
        }
        if let Some(path) = &patch.path {
            data.path = path.clone();
        }

        txn.delete(old_scheduled_key.as_bytes())?;
        txn.delete(old_path_key.as_bytes())?;
        txn.put(task_key(&id).as_bytes(), &encode_task_data(&data)?)?;
        txn.put(scheduled_key(data.due_time_ms(), &id).as_bytes(), b"")?;
        txn.put(path_key(&data.path, &id).as_bytes(), b"")?;
        txn.commit().await?;

        Ok(TaskInfo::new(id, TaskStatus::Scheduled, &data))
    }

    /// Cancel a task.
    ///
    /// Active tasks are signalled cooperatively through their cancellation
    /// token and settle once the executor observes it. Scheduled and queued
    /// tasks are garbage collected immediately and settle with a synthesized
    /// cancellation failure carrying `reason`.
    pub async fn cancel_task(
        &self,
        id: TaskId,
        reason: impl Into<String>,
    ) -> Result<(), TaskManagerError> {
        let reason = reason.into();
        loop {
            if self.try_cancel_active(&id, &reason) {
                return Ok(());
            }
            match self.cancel_inactive(id).await? {
                CancelOutcome::Removed => {
                    self.promises
                        .settle(id, Err(TaskFailure::Cancelled(reason)));
                    debug!(task_id = %id, "cancelled inactive task");
                    return Ok(());
                }
                CancelOutcome::Missing => return Err(TaskManagerError::TaskMissing(id)),
                // Dispatched between our check and the task lock; go around
                // and cancel through the executor's token.
                CancelOutcome::Active => continue,
            }
        }
    }

    fn try_cancel_active(&self, id: &TaskId, reason: &str) -> bool {
        let active = self.active.lock().unwrap();
        if let Some(entry) = active.get(id) {
            *entry.reason.lock().unwrap() = Some(reason.to_string());
            entry.cancel.cancel();
            true
        } else {
            false
        }
    }

    async fn cancel_inactive(&self, id: TaskId) -> Result<CancelOutcome, TaskManagerError> {
        match self.gc_task(id, false).await? {
            GcOutcome::Removed => Ok(CancelOutcome::Removed),
            GcOutcome::Missing => Ok(CancelOutcome::Missing),
            GcOutcome::StillActive => Ok(CancelOutcome::Active),
        }
    }
}

fn validate_path(path: &[String]) -> Result<(), TaskManagerError> {
    for tag in path {
        if tag.contains('/') {
            return Err(TaskManagerError::InvalidPathTag(tag.clone()));
        }
    }
    Ok(())
}
