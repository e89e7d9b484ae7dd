//! Per-task execution under a deadline and cooperative cancellation.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::handler::{TaskContext, TaskHandlerError};
use crate::ids::TaskId;
use crate::manager::{ActiveEntry, TaskManager};
use crate::promise::{TaskFailure, TaskSettlement};
use crate::task::{TaskData, TaskInfo, TaskStatus};

enum HandlerOutcome {
    /// Handler raised the retry signal: move back to queued, no settlement.
    Requeue,
    /// Terminal: garbage collect, then emit this settlement.
    Settle(TaskSettlement),
}

impl TaskManager {
    /// Run one active task to settlement. Terminal outcomes remove every
    /// persisted row *before* the settlement event fires, so no observer sees
    /// an event for a task whose storage still exists.
    pub(crate) async fn execute_task(
        self: Arc<Self>,
        id: TaskId,
        data: TaskData,
        entry: ActiveEntry,
    ) {
        let outcome = self.run_handler(id, &data, &entry).await;

        let settlement = match outcome {
            HandlerOutcome::Requeue => match self.requeue_task(id).await {
                Ok(_) => None,
                Err(e) => {
                    // Store corruption; surface it and halt the pipeline.
                    error!(task_id = %id, error = %e, "requeue failed, stopping processing");
                    self.record_loop_failure(e);
                    self.finish_active(id, None);
                    self.stop_processing().await;
                    return;
                }
            },
            HandlerOutcome::Settle(settlement) => match self.gc_task(id, true).await {
                Ok(_) => Some(settlement),
                Err(e) => {
                    error!(task_id = %id, error = %e, "garbage collection failed, stopping processing");
                    self.record_loop_failure(e);
                    self.finish_active(id, None);
                    self.stop_processing().await;
                    return;
                }
            },
        };

        self.finish_active(id, settlement);
    }

    fn finish_active(&self, id: TaskId, settlement: Option<TaskSettlement>) {
        self.active.lock().unwrap().remove(&id);
        if let Some(settlement) = settlement {
            self.promises.settle(id, settlement);
        }
        // Capacity opened up.
        self.queue.trigger();
    }

    async fn run_handler(
        &self,
        id: TaskId,
        data: &TaskData,
        entry: &ActiveEntry,
    ) -> HandlerOutcome {
        // A missing handler at dispatch time is terminal, not a retry.
        let Some(handler) = self.handlers.get(&data.handler_id) else {
            debug!(task_id = %id, handler_id = %data.handler_id, "no handler registered");
            return HandlerOutcome::Settle(Err(TaskFailure::HandlerMissing(
                data.handler_id.clone(),
            )));
        };

        let deadline = data
            .deadline()
            .map(|budget_ms| Instant::now() + Duration::from_millis(budget_ms));
        let ctx = TaskContext {
            cancel: entry.cancel.clone(),
            deadline,
        };
        let info = TaskInfo::new(id, TaskStatus::Active, data);

        let fut = handler.handle(ctx, info, data.parameters.clone());
        tokio::pin!(fut);

        let result: Option<Result<Value, TaskHandlerError>> = if let Some(deadline) = deadline {
            tokio::select! {
                res = &mut fut => Some(res),
                _ = entry.cancel.cancelled() => None,
                _ = tokio::time::sleep_until(deadline) => {
                    entry.cancel.cancel();
                    return HandlerOutcome::Settle(Err(TaskFailure::TimedOut));
                }
            }
        } else {
            tokio::select! {
                res = &mut fut => Some(res),
                _ = entry.cancel.cancelled() => None,
            }
        };

        match result {
            Some(Ok(value)) => HandlerOutcome::Settle(Ok(value)),
            Some(Err(TaskHandlerError::Requeue)) => HandlerOutcome::Requeue,
            Some(Err(TaskHandlerError::Failed(message))) => {
                HandlerOutcome::Settle(Err(TaskFailure::Handler(message)))
            }
            None => {
                let reason = entry
                    .reason
                    .lock()
                    .unwrap()
                    .take()
                    .unwrap_or_else(|| "cancelled".to_string());
                HandlerOutcome::Settle(Err(TaskFailure::Cancelled(reason)))
            }
        }
    }
}
