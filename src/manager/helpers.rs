//! Helper functions shared across manager submodules.

use std::future::Future;
use std::time::Duration;

use slatedb::{Db, DbIterator, ErrorKind as SlateErrorKind};
use tracing::debug;

use crate::keys::end_bound;
use crate::manager::TaskManagerError;

/// Run a transactional closure, retrying on optimistic-concurrency conflicts
/// with bounded exponential backoff.
pub(crate) async fn retry_on_txn_conflict<T, Fut>(
    op: &'static str,
    mut f: impl FnMut() -> Fut,
) -> Result<T, TaskManagerError>
where
    Fut: Future<Output = Result<T, TaskManagerError>>,
{
    const MAX_RETRIES: usize = 5;

    for attempt in 0..MAX_RETRIES {
        match f().await {
            Err(TaskManagerError::Slate(ref e)) if e.kind() == SlateErrorKind::Transaction => {
                if attempt + 1 < MAX_RETRIES {
                    let delay_ms = 10 * (1 << attempt); // 10ms, 20ms, 40ms, 80ms
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    debug!(op, attempt = attempt + 1, "transaction conflict, retrying");
                    continue;
                }
            }
            other => return other,
        }
    }

    Err(TaskManagerError::TransactionConflict(op))
}

/// Scan every key under `prefix` in ascending order, up to `limit`.
pub(crate) async fn scan_keys(
    db: &Db,
    prefix: &str,
    limit: Option<usize>,
) -> Result<Vec<String>, TaskManagerError> {
    let start: Vec<u8> = prefix.as_bytes().to_vec();
    let end = end_bound(prefix);
    let mut iter: DbIterator = db.scan::<Vec<u8>, _>(start..=end).await?;

    let mut keys = Vec::new();
    while let Some(kv) = iter.next().await? {
        keys.push(String::from_utf8_lossy(&kv.key).into_owned());
        if limit.is_some_and(|l| keys.len() >= l) {
            break;
        }
    }
    Ok(keys)
}
