//! Composite ordered key layout over the store.
//!
//! Numeric fields are zero-padded so lexicographic byte order equals numeric
//! order. Two manager instances must not share the same store; every key here
//! is relative to one manager's database.
//!
//! - `tasks/<id>`                      task record (payload source of truth)
//! - `scheduled/<due:020>/<id>`        due-time index
//! - `queued/<prio:03>/<due:020>/<id>` dispatch-order index
//! - `active/<id>`                     in-flight index
//! - `path/<tag>/../<tag>/<id>`        grouping index
//! - `meta/last_task_id`               monotonic id high-water mark

use thiserror::Error;

use crate::ids::TaskId;

pub const TASK_PREFIX: &str = "tasks/";
pub const SCHEDULED_PREFIX: &str = "scheduled/";
pub const QUEUED_PREFIX: &str = "queued/";
pub const ACTIVE_PREFIX: &str = "active/";
pub const PATH_PREFIX: &str = "path/";
pub const LAST_TASK_ID_KEY: &str = "meta/last_task_id";

#[derive(Debug, Clone, Error)]
pub enum KeyParseError {
    #[error("unexpected key layout: {0}")]
    Layout(String),
    #[error("invalid numeric field in key: {0}")]
    Numeric(String),
    #[error("invalid task id in key: {0}")]
    Id(String),
}

/// The key for a task's record by id.
pub fn task_key(id: &TaskId) -> String {
    format!("{}{}", TASK_PREFIX, id)
}

/// Scheduled-index key, ordered by (due time, id).
pub fn scheduled_key(due_ms: u64, id: &TaskId) -> String {
    format!("{}{:020}/{}", SCHEDULED_PREFIX, due_ms, id)
}

/// Queued-index key, ordered by (encoded priority, due time, id).
/// Priority is the primary field so higher-priority tasks always sort first.
pub fn queued_key(priority_key: u8, due_ms: u64, id: &TaskId) -> String {
    format!("{}{:03}/{:020}/{}", QUEUED_PREFIX, priority_key, due_ms, id)
}

/// Active-index key by id.
pub fn active_key(id: &TaskId) -> String {
    format!("{}{}", ACTIVE_PREFIX, id)
}

/// Path-index key: grouping tags followed by the id. Tags must not contain '/'.
pub fn path_key(path: &[String], id: &TaskId) -> String {
    let mut key = path_prefix(path);
    key.push_str(&id.to_hex());
    key
}

/// Prefix covering every path-index entry at or below `path`.
pub fn path_prefix(path: &[String]) -> String {
    let mut prefix = String::from(PATH_PREFIX);
    for tag in path {
        prefix.push_str(tag);
        prefix.push('/');
    }
    prefix
}

/// Exclusive-ish upper bound for a prefix scan.
pub fn end_bound(prefix: &str) -> Vec<u8> {
    let mut bound = prefix.as_bytes().to_vec();
    bound.push(0xFF);
    bound
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledKey {
    pub due_ms: u64,
    pub id: TaskId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedKey {
    pub priority_key: u8,
    pub due_ms: u64,
    pub id: TaskId,
}

pub fn parse_task_key(key: &str) -> Result<TaskId, KeyParseError> {
    let rest = key
        .strip_prefix(TASK_PREFIX)
        .ok_or_else(|| KeyParseError::Layout(key.to_string()))?;
    TaskId::from_hex(rest).map_err(|e| KeyParseError::Id(e.to_string()))
}

pub fn parse_scheduled_key(key: &str) -> Result<ScheduledKey, KeyParseError> {
    let rest = key
        .strip_prefix(SCHEDULED_PREFIX)
        .ok_or_else(|| KeyParseError::Layout(key.to_string()))?;
    let (due_part, id_part) = rest
        .split_once('/')
        .ok_or_else(|| KeyParseError::Layout(key.to_string()))?;
    let due_ms = due_part
        .parse::<u64>()
        .map_err(|e| KeyParseError::Numeric(e.to_string()))?;
    let id = TaskId::from_hex(id_part).map_err(|e| KeyParseError::Id(e.to_string()))?;
    Ok(ScheduledKey { due_ms, id })
}

pub fn parse_queued_key(key: &str) -> Result<QueuedKey, KeyParseError> {
    let rest = key
        .strip_prefix(QUEUED_PREFIX)
        .ok_or_else(|| KeyParseError::Layout(key.to_string()))?;
    let mut parts = rest.splitn(3, '/');
    let priority_part = parts
        .next()
        .ok_or_else(|| KeyParseError::Layout(key.to_string()))?;
    let due_part = parts
        .next()
        .ok_or_else(|| KeyParseError::Layout(key.to_string()))?;
    let id_part = parts
        .next()
        .ok_or_else(|| KeyParseError::Layout(key.to_string()))?;
    let priority_key = priority_part
        .parse::<u8>()
        .map_err(|e| KeyParseError::Numeric(e.to_string()))?;
    let due_ms = due_part
        .parse::<u64>()
        .map_err(|e| KeyParseError::Numeric(e.to_string()))?;
    let id = TaskId::from_hex(id_part).map_err(|e| KeyParseError::Id(e.to_string()))?;
    Ok(QueuedKey {
        priority_key,
        due_ms,
        id,
    })
}

pub fn parse_active_key(key: &str) -> Result<TaskId, KeyParseError> {
    let rest = key
        .strip_prefix(ACTIVE_PREFIX)
        .ok_or_else(|| KeyParseError::Layout(key.to_string()))?;
    TaskId::from_hex(rest).map_err(|e| KeyParseError::Id(e.to_string()))
}

/// Extract the id from a path-index key; the tag segments precede it.
pub fn parse_path_key(key: &str) -> Result<TaskId, KeyParseError> {
    if !key.starts_with(PATH_PREFIX) {
        return Err(KeyParseError::Layout(key.to_string()));
    }
    let id_part = key
        .rsplit('/')
        .next()
        .ok_or_else(|| KeyParseError::Layout(key.to_string()))?;
    TaskId::from_hex(id_part).map_err(|e| KeyParseError::Id(e.to_string()))
}
