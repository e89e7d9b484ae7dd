//! Startup repair of state left by an unclean shutdown.
//!
//! Tasks found in the active index on open did not finish; they move back to
//! the queued index so no task is silently lost. Handlers must therefore
//! tolerate at-least-once execution.

use slatedb::{Db, DbIterator, IsolationLevel, WriteBatch};
use tracing::{info, warn};

use crate::codec::{decode_task_data, decode_task_id};
use crate::ids::TaskId;
use crate::keys::{end_bound, parse_active_key, queued_key, task_key, ACTIVE_PREFIX,
    LAST_TASK_ID_KEY};
use crate::manager::TaskManagerError;
use crate::task::priority_to_key;

/// Move every dangling active entry back to the queued index. Active rows
/// without a task record are dropped outright.
pub(crate) async fn repair_dangling_tasks(db: &Db) -> Result<usize, TaskManagerError> {
    let start: Vec<u8> = ACTIVE_PREFIX.as_bytes().to_vec();
    let end = end_bound(ACTIVE_PREFIX);
    let mut iter: DbIterator = db.scan::<Vec<u8>, _>(start..=end).await?;

    let mut keys = Vec::new();
    while let Some(kv) = iter.next().await? {
        keys.push(String::from_utf8_lossy(&kv.key).into_owned());
    }
    if keys.is_empty() {
        return Ok(0);
    }

    let txn = db.begin(IsolationLevel::SerializableSnapshot).await?;
    let mut repaired = 0;
    for key in keys {
        let id: TaskId = parse_active_key(&key)?;
        let Some(raw) = txn.get(task_key(&id).as_bytes()).await? else {
            warn!(task_id = %id, "dropping active entry without a task record");
            txn.delete(key.as_bytes())?;
            continue;
        };
        let data = decode_task_data(&raw)?;

        txn.delete(key.as_bytes())?;
        txn.put(
            queued_key(priority_to_key(data.priority), data.due_time_ms(), &id).as_bytes(),
            b"",
        )?;
        repaired += 1;
    }
    txn.commit().await?;

    if repaired > 0 {
        info!(repaired, "re-queued tasks left active by an unclean shutdown");
    }
    Ok(repaired)
}

/// Discard every row in the store. Used by `fresh` opens.
pub(crate) async fn clear_all(db: &Db) -> Result<(), TaskManagerError> {
    let start: Vec<u8> = Vec::new();
    let end: Vec<u8> = vec![0xFF];
    let mut iter: DbIterator = db.scan::<Vec<u8>, _>(start..=end).await?;

    let mut batch = WriteBatch::new();
    let mut cleared = 0usize;
    while let Some(kv) = iter.next().await? {
        batch.delete(&kv.key);
        cleared += 1;
    }
    if cleared > 0 {
        db.write(batch).await?;
        info!(cleared, "discarded persisted task state for a fresh start");
    }
    Ok(())
}

/// Read the persisted id high-water mark, if any.
pub(crate) async fn read_last_task_id(db: &Db) -> Result<Option<TaskId>, TaskManagerError> {
    match db.get(LAST_TASK_ID_KEY.as_bytes()).await? {
        Some(raw) => Ok(Some(decode_task_id(&raw)?)),
        None => Ok(None),
    }
}
