//! Crash-recoverable persistent task scheduling for the keeper identity node.
//!
//! Tasks move through a durable three-state pipeline (scheduled -> queued ->
//! active) persisted in a transactional ordered store. Two independent
//! control loops drive the transitions, coordinating only through the store
//! and explicit wake signals; an executor runs each active task's handler
//! under a deadline and cooperative cancellation. Unclean shutdowns are
//! repaired on open by re-queuing anything left active, giving at-least-once
//! execution.

pub mod codec;
pub mod handler;
pub mod ids;
pub mod keys;
pub mod locks;
pub mod manager;
pub mod promise;
pub mod settings;
pub mod storage;
pub mod task;
pub mod trace;

pub use handler::{HandlerRegistry, TaskContext, TaskHandler, TaskHandlerError};
pub use ids::{TaskId, TaskIdGenerator};
pub use manager::{Task, TaskManager, TaskManagerError, TaskPatch, TaskPromise, TaskSpec};
pub use promise::{TaskFailure, TaskSettlement};
pub use settings::{Backend, TaskManagerConfig};
pub use task::{TaskData, TaskInfo, TaskOrder, TaskStatus};
