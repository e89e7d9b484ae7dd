//! Task records and the scalar codecs used in ordered keys.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::TaskId;

/// Get current epoch time in milliseconds.
pub fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Sentinel for an unbounded deadline; the store cannot represent infinities.
pub const DEADLINE_UNBOUNDED_MS: u64 = u64::MAX;

/// Clamp an arbitrary priority input into the signed-byte range.
pub fn to_priority(n: i64) -> i8 {
    n.clamp(-128, 127) as i8
}

/// Order-preserving priority encoding: a smaller encoded byte sorts first and
/// denotes a higher priority, so numerically larger priorities win dispatch.
pub fn priority_to_key(p: i8) -> u8 {
    (127 - p as i16) as u8
}

pub fn priority_from_key(b: u8) -> i8 {
    (127 - b as i16) as i8
}

/// Clamp a delay to a non-negative millisecond count.
pub fn to_delay(n: i64) -> u64 {
    n.max(0) as u64
}

pub fn to_deadline(deadline_ms: Option<u64>) -> u64 {
    deadline_ms.unwrap_or(DEADLINE_UNBOUNDED_MS)
}

pub fn from_deadline(encoded: u64) -> Option<u64> {
    (encoded != DEADLINE_UNBOUNDED_MS).then_some(encoded)
}

/// The three live pipeline states of a tracked task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Scheduled,
    Queued,
    Active,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Scheduled => "scheduled",
            TaskStatus::Queued => "queued",
            TaskStatus::Active => "active",
        }
    }
}

/// Iteration order for `get_tasks`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOrder {
    Asc,
    Desc,
}

/// The persisted task record. The task table is the sole source of truth for
/// the payload; every index row is derived from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskData {
    pub handler_id: String,
    pub parameters: Vec<Value>,
    /// Creation time, unix ms.
    pub timestamp_ms: u64,
    pub delay_ms: u64,
    pub priority: i8,
    /// Relative execution budget in ms; `DEADLINE_UNBOUNDED_MS` means none.
    pub deadline_ms: u64,
    pub path: Vec<String>,
}

impl TaskData {
    /// Absolute due time used by the scheduled and queued indices.
    pub fn due_time_ms(&self) -> u64 {
        self.timestamp_ms.saturating_add(self.delay_ms)
    }

    pub fn deadline(&self) -> Option<u64> {
        from_deadline(self.deadline_ms)
    }
}

/// Caller-facing metadata snapshot of a task.
#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub id: TaskId,
    pub status: TaskStatus,
    pub handler_id: String,
    pub parameters: Vec<Value>,
    pub delay_ms: u64,
    pub deadline_ms: Option<u64>,
    pub priority: i8,
    pub path: Vec<String>,
    /// Creation time, unix ms.
    pub created_ms: u64,
    /// Absolute due time, unix ms.
    pub scheduled_ms: u64,
}

impl TaskInfo {
    pub(crate) fn new(id: TaskId, status: TaskStatus, data: &TaskData) -> Self {
        TaskInfo {
            id,
            status,
            handler_id: data.handler_id.clone(),
            parameters: data.parameters.clone(),
            delay_ms: data.delay_ms,
            deadline_ms: data.deadline(),
            priority: data.priority,
            path: data.path.clone(),
            created_ms: data.timestamp_ms,
            scheduled_ms: data.due_time_ms(),
        }
    }
}
