//! The queuing loop: moves queued tasks to the active index in ascending
//! (priority, due time, id) order, subject to the concurrency cap.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use slatedb::{DbIterator, IsolationLevel};
use tracing::{debug, error};

use crate::codec::decode_task_data;
use crate::keys::{active_key, end_bound, parse_queued_key, queued_key, task_key, QueuedKey,
    QUEUED_PREFIX};
use crate::manager::helpers::retry_on_txn_conflict;
use crate::manager::{ActiveEntry, TaskManager, TaskManagerError};
use crate::task::TaskData;

impl TaskManager {
    pub(crate) fn spawn_queueing_loop(self: &Arc<Self>) {
        if self.queue.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            // Dispatch anything already queued at startup.
            manager.queue.notify.notify_one();
            loop {
                manager.queue.notify.notified().await;
                if !manager.queue.is_running() {
                    break;
                }
                if let Err(e) = manager.process_queued_batch().await {
                    error!(error = %e, "queuing loop failed, stopping");
                    manager.record_loop_failure(TaskManagerError::QueueLoop(e.to_string()));
                    manager.queue.running.store(false, Ordering::SeqCst);
                    break;
                }
            }
        });
        *self.queue.worker.lock().unwrap() = Some(handle);
    }

    /// One iteration: claim the head of the queued index while capacity
    /// remains. The capacity check runs per entry, before each dispatch, so
    /// the cap is never exceeded even under rapid dispatch.
    async fn process_queued_batch(self: &Arc<Self>) -> Result<(), TaskManagerError> {
        loop {
            if self.active_count() >= self.config.active_limit {
                break;
            }
            let Some(entry) = self.next_queued_entry().await? else {
                break;
            };
            let activated = retry_on_txn_conflict("activate_task", || {
                self.activate_task_inner(&entry)
            })
            .await?;
            let Some(data) = activated else {
                // Raced with cancellation; take the next entry.
                continue;
            };

            // Register in the active map before dispatch so the in-flight
            // count covers the new task immediately.
            let active_entry = ActiveEntry::new();
            self.active
                .lock()
                .unwrap()
                .insert(entry.id, active_entry.clone());
            debug!(task_id = %entry.id, handler_id = %data.handler_id, "task dispatched");

            let manager = Arc::clone(self);
            tokio::spawn(async move {
                manager.execute_task(entry.id, data, active_entry).await;
            });
        }
        Ok(())
    }

    /// Head of the queued index: the eligible task with the highest priority,
    /// earliest due time, and smallest id.
    async fn next_queued_entry(&self) -> Result<Option<QueuedKey>, TaskManagerError> {
        let start: Vec<u8> = QUEUED_PREFIX.as_bytes().to_vec();
        let end = end_bound(QUEUED_PREFIX);
        let mut iter: DbIterator = self.db.scan::<Vec<u8>, _>(start..=end).await?;

        match iter.next().await? {
            Some(kv) => {
                let key = String::from_utf8_lossy(&kv.key);
                Ok(Some(parse_queued_key(&key)?))
            }
            None => Ok(None),
        }
    }

    /// Atomically move one task from queued to active. Returns the task's
    /// record, or None if the entry vanished under us.
    async fn activate_task_inner(
        &self,
        entry: &QueuedKey,
    ) -> Result<Option<TaskData>, TaskManagerError> {
        let _guard = self.locks.lock(entry.id).await;
        let txn = self.db.begin(IsolationLevel::SerializableSnapshot).await?;

        let qk = queued_key(entry.priority_key, entry.due_ms, &entry.id);
        if txn.get(qk.as_bytes()).await?.is_none() {
            return Ok(None);
        }
        let Some(raw) = txn.get(task_key(&entry.id).as_bytes()).await? else {
            txn.delete(qk.as_bytes())?;
            txn.commit().await?;
            return Ok(None);
        };
        let data = decode_task_data(&raw)?;

        txn.delete(qk.as_bytes())?;
        txn.put(active_key(&entry.id).as_bytes(), b"")?;
        txn.commit().await?;
        Ok(Some(data))
    }
}
