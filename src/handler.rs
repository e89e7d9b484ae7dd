//! The handler contract consumed by the executor.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::task::TaskInfo;

/// Errors a handler may return.
///
/// `Requeue` is the designated retry signal: the task is moved back to the
/// queued index and no settlement event is emitted. Any other error is
/// terminal and settles the task's promise with a handler failure.
#[derive(Debug, Error)]
pub enum TaskHandlerError {
    #[error("task requested requeue")]
    Requeue,
    #[error("{0}")]
    Failed(String),
}

/// Execution context handed to a handler.
///
/// Handlers observe `cancel` cooperatively; it fires on deadline expiry,
/// explicit cancellation, and manager shutdown.
#[derive(Clone)]
pub struct TaskContext {
    pub cancel: CancellationToken,
    /// Absolute deadline of this attempt, if the task carries a budget.
    pub deadline: Option<Instant>,
}

impl TaskContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// A registered function performing a task's actual work.
///
/// On deadline expiry or cancellation the executor stops polling the
/// handler's future, so it is dropped at its next await point rather than
/// running until it observes the token. Side effects between await points
/// complete; anything after the next await does not. Handlers needing
/// cleanup on cancellation should guard it with a drop guard or check
/// `ctx.cancel` before committing work.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: TaskContext,
        info: TaskInfo,
        parameters: Vec<Value>,
    ) -> Result<Value, TaskHandlerError>;
}

/// Dynamic dispatch table from handler id to handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        HandlerRegistry::default()
    }

    pub fn register(&self, handler_id: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers
            .write()
            .unwrap()
            .insert(handler_id.into(), handler);
    }

    pub fn deregister(&self, handler_id: &str) {
        self.handlers.write().unwrap().remove(handler_id);
    }

    pub fn get(&self, handler_id: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.read().unwrap().get(handler_id).cloned()
    }

    pub fn handler_ids(&self) -> Vec<String> {
        self.handlers.read().unwrap().keys().cloned().collect()
    }
}
