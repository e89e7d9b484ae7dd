//! The scheduling loop: moves due tasks from the scheduled index to the
//! queued index in ascending (due time, id) order.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use slatedb::{DbIterator, IsolationLevel};
use tracing::{debug, error};

use crate::codec::decode_task_data;
use crate::ids::TaskId;
use crate::keys::{
    end_bound, parse_scheduled_key, queued_key, scheduled_key, task_key, SCHEDULED_PREFIX,
};
use crate::manager::helpers::retry_on_txn_conflict;
use crate::manager::{ArmedTimer, TaskManager, TaskManagerError};
use crate::task::{now_epoch_ms, priority_to_key};

impl TaskManager {
    pub(crate) fn spawn_scheduling_loop(self: &Arc<Self>) {
        if self.scheduler.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            // Pick up anything already due at startup.
            manager.scheduler.notify.notify_one();
            loop {
                manager.scheduler.notify.notified().await;
                if !manager.scheduler.is_running() {
                    break;
                }
                match manager.process_scheduled_batch().await {
                    Ok(moved) if moved > 0 => {
                        debug!(moved, "scheduling loop queued due tasks");
                        manager.queue.trigger();
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "scheduling loop failed, stopping");
                        manager.record_loop_failure(TaskManagerError::SchedulerLoop(e.to_string()));
                        manager.scheduler.running.store(false, Ordering::SeqCst);
                        break;
                    }
                }
            }
        });
        *self.scheduler.worker.lock().unwrap() = Some(handle);
    }

    /// One iteration: queue everything due within the lookahead window, then
    /// arm the wake timer for the next pending entry.
    async fn process_scheduled_batch(self: &Arc<Self>) -> Result<usize, TaskManagerError> {
        let horizon = now_epoch_ms() + self.config.lookahead_ms;
        let due = self.scan_due_entries(horizon).await?;

        let mut moved = 0;
        for (due_ms, id) in due {
            let queued =
                retry_on_txn_conflict("queue_task", || self.queue_task_inner(due_ms, id)).await?;
            if queued {
                moved += 1;
            }
        }

        if let Some(next_due) = self.peek_next_scheduled().await? {
            self.arm_scheduler_timer(next_due);
        }
        Ok(moved)
    }

    /// Collect scheduled entries due at or before `horizon`, in (due, id)
    /// order. The index is sorted by due time so the scan stops at the first
    /// entry beyond the horizon.
    async fn scan_due_entries(
        &self,
        horizon: u64,
    ) -> Result<Vec<(u64, TaskId)>, TaskManagerError> {
        let start: Vec<u8> = SCHEDULED_PREFIX.as_bytes().to_vec();
        let end = end_bound(SCHEDULED_PREFIX);
        let mut iter: DbIterator = self.db.scan::<Vec<u8>, _>(start..=end).await?;

        let mut due = Vec::new();
        while let Some(kv) = iter.next().await? {
            let key = String::from_utf8_lossy(&kv.key);
            let parsed = parse_scheduled_key(&key)?;
            if parsed.due_ms > horizon {
                break;
            }
            due.push((parsed.due_ms, parsed.id));
        }
        Ok(due)
    }

    /// Atomically move one task from scheduled to queued. Skips silently if
    /// the entry vanished (cancelled or already moved) under us.
    async fn queue_task_inner(&self, due_ms: u64, id: TaskId) -> Result<bool, TaskManagerError> {
        let _guard = self.locks.lock(id).await;
        let txn = self.db.begin(IsolationLevel::SerializableSnapshot).await?;

        let sk = scheduled_key(due_ms, &id);
        if txn.get(sk.as_bytes()).await?.is_none() {
            return Ok(false);
        }
        let Some(raw) = txn.get(task_key(&id).as_bytes()).await? else {
            // Cancelled under us: clear the dangling index row.
            txn.delete(sk.as_bytes())?;
            txn.commit().await?;
            return Ok(false);
        };
        let data = decode_task_data(&raw)?;

        txn.delete(sk.as_bytes())?;
        txn.put(
            queued_key(priority_to_key(data.priority), data.due_time_ms(), &id).as_bytes(),
            b"",
        )?;
        txn.commit().await?;
        Ok(true)
    }

    async fn peek_next_scheduled(&self) -> Result<Option<u64>, TaskManagerError> {
        let start: Vec<u8> = SCHEDULED_PREFIX.as_bytes().to_vec();
        let end = end_bound(SCHEDULED_PREFIX);
        let mut iter: DbIterator = self.db.scan::<Vec<u8>, _>(start..=end).await?;

        match iter.next().await? {
            Some(kv) => {
                let key = String::from_utf8_lossy(&kv.key);
                Ok(Some(parse_scheduled_key(&key)?.due_ms))
            }
            None => Ok(None),
        }
    }

    /// Arm the single wake timer for `due_ms`. The timer is a shared
    /// resource: a sooner deadline always wins and a later one never
    /// replaces it.
    fn arm_scheduler_timer(&self, due_ms: u64) {
        let mut slot = self.scheduler.timer.lock().unwrap();
        if let Some(armed) = slot.as_ref() {
            if armed.due_ms <= due_ms {
                return;
            }
            armed.handle.abort();
        }

        let wait = Duration::from_millis(due_ms.saturating_sub(now_epoch_ms()));
        let state = Arc::clone(&self.scheduler);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            state.timer.lock().unwrap().take();
            state.notify.notify_one();
        });
        *slot = Some(ArmedTimer { due_ms, handle });
    }
}
