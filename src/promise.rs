//! Settlement registry: one memoized channel per pending task id.
//!
//! Settlements fire only after the task's rows have been durably removed, so
//! no observer ever sees an event for a task whose storage still exists.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;

use crate::ids::TaskId;

/// Terminal failure of a task, delivered through its promise.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TaskFailure {
    #[error("task {0} is no longer tracked")]
    Missing(TaskId),
    #[error("no handler registered for {0}")]
    HandlerMissing(String),
    #[error("task deadline exceeded")]
    TimedOut,
    #[error("task cancelled: {0}")]
    Cancelled(String),
    #[error("task handler failed: {0}")]
    Handler(String),
}

pub type TaskSettlement = Result<Value, TaskFailure>;

pub(crate) type SettlementReceiver = watch::Receiver<Option<TaskSettlement>>;

#[derive(Default)]
pub struct PromiseRegistry {
    channels: Mutex<HashMap<TaskId, watch::Sender<Option<TaskSettlement>>>>,
}

impl PromiseRegistry {
    pub fn new() -> Self {
        PromiseRegistry::default()
    }

    /// Subscribe to a task's settlement. All subscribers of a pending task
    /// share the one channel, so the registry holds at most one entry per id.
    pub(crate) fn subscribe(&self, id: TaskId) -> SettlementReceiver {
        let mut channels = self.channels.lock().unwrap();
        if let Some(tx) = channels.get(&id) {
            return tx.subscribe();
        }
        let (tx, rx) = watch::channel(None);
        channels.insert(id, tx);
        rx
    }

    /// Fire the one-shot settlement for a task and drop its channel. A task
    /// with no subscribers settles silently.
    pub(crate) fn settle(&self, id: TaskId, settlement: TaskSettlement) {
        if let Some(tx) = self.channels.lock().unwrap().remove(&id) {
            let _ = tx.send(Some(settlement));
        }
    }

    /// Whether any settlement channel is registered for `id`.
    pub fn is_pending(&self, id: &TaskId) -> bool {
        self.channels.lock().unwrap().contains_key(id)
    }
}
