//! Garbage collection and requeue.
//!
//! Failures here are never swallowed: they indicate store corruption and are
//! fatal to the owning loop.

use slatedb::IsolationLevel;

use crate::codec::decode_task_data;
use crate::ids::TaskId;
use crate::keys::{active_key, path_key, queued_key, scheduled_key, task_key};
use crate::manager::helpers::retry_on_txn_conflict;
use crate::manager::{TaskManager, TaskManagerError};
use crate::task::priority_to_key;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GcOutcome {
    Removed,
    Missing,
    /// Only reported when the caller asked not to collect an active task.
    StillActive,
}

impl TaskManager {
    /// Remove every persisted row of a task in one transaction.
    ///
    /// With `expect_active` the task is being settled by its executor and the
    /// active row is collected along with the rest. Without it (cancellation
    /// of a scheduled or queued task) an active task is left untouched and
    /// reported as `StillActive`.
    pub(crate) async fn gc_task(
        &self,
        id: TaskId,
        expect_active: bool,
    ) -> Result<GcOutcome, TaskManagerError> {
        retry_on_txn_conflict("gc_task", || self.gc_task_inner(id, expect_active))
            .await
            .map_err(|e| TaskManagerError::GarbageCollection {
                id,
                source: Box::new(e),
            })
    }

    async fn gc_task_inner(
        &self,
        id: TaskId,
        expect_active: bool,
    ) -> Result<GcOutcome, TaskManagerError> {
        let _guard = self.locks.lock(id).await;
        let txn = self.db.begin(IsolationLevel::SerializableSnapshot).await?;

        let Some(raw) = txn.get(task_key(&id).as_bytes()).await? else {
            return Ok(GcOutcome::Missing);
        };
        let data = decode_task_data(&raw)?;

        if !expect_active && txn.get(active_key(&id).as_bytes()).await?.is_some() {
            return Ok(GcOutcome::StillActive);
        }

        // The task occupies exactly one state index, but deletes are
        // idempotent so all candidate rows go in one pass.
        txn.delete(task_key(&id).as_bytes())?;
        txn.delete(active_key(&id).as_bytes())?;
        txn.delete(scheduled_key(data.due_time_ms(), &id).as_bytes())?;
        txn.delete(
            queued_key(priority_to_key(data.priority), data.due_time_ms(), &id).as_bytes(),
        )?;
        txn.delete(path_key(&data.path, &id).as_bytes())?;
        txn.commit().await?;
        Ok(GcOutcome::Removed)
    }

    /// Move a task from the active index back to the queued index after a
    /// handler retry signal. Returns false if the task vanished meanwhile.
    pub(crate) async fn requeue_task(&self, id: TaskId) -> Result<bool, TaskManagerError> {
        retry_on_txn_conflict("requeue_task", || self.requeue_task_inner(id))
            .await
            .map_err(|e| TaskManagerError::Requeue {
                id,
                source: Box::new(e),
            })
    }

    async fn requeue_task_inner(&self, id: TaskId) -> Result<bool, TaskManagerError> {
        let _guard = self.locks.lock(id).await;
        let txn = self.db.begin(IsolationLevel::SerializableSnapshot).await?;

        let Some(raw) = txn.get(task_key(&id).as_bytes()).await? else {
            return Ok(false);
        };
        let data = decode_task_data(&raw)?;

        txn.delete(active_key(&id).as_bytes())?;
        txn.put(
            queued_key(priority_to_key(data.priority), data.due_time_ms(), &id).as_bytes(),
            b"",
        )?;
        txn.commit().await?;
        Ok(true)
    }
}
