//! Named per-task locks.
//!
//! Every mutation of a single task's rows (queue transition, garbage
//! collection, requeue, update, cancel) holds that task's lock for the life
//! of the enclosing transaction, serializing the two loops and direct API
//! calls against each other per task id.

use std::collections::HashMap;
use std::sync::{Mutex as StdMutex, Weak};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::ids::TaskId;

#[derive(Default)]
pub struct TaskLocks {
    entries: StdMutex<HashMap<TaskId, Weak<Mutex<()>>>>,
}

/// Guard for one task's named lock. Dropping it releases the lock; the table
/// entry is reclaimed lazily on later lock calls.
pub struct TaskLockGuard {
    _guard: OwnedMutexGuard<()>,
}

impl TaskLocks {
    pub fn new() -> Self {
        TaskLocks::default()
    }

    pub async fn lock(&self, id: TaskId) -> TaskLockGuard {
        let cell = {
            let mut entries = self.entries.lock().unwrap();
            entries.retain(|_, weak| weak.strong_count() > 0);
            match entries.get(&id).and_then(Weak::upgrade) {
                Some(cell) => cell,
                None => {
                    let cell = Arc::new(Mutex::new(()));
                    entries.insert(id, Arc::downgrade(&cell));
                    cell
                }
            }
        };
        TaskLockGuard {
            _guard: cell.lock_owned().await,
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_, weak| weak.strong_count() > 0);
        entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lock_is_exclusive_per_id() {
        let locks = Arc::new(TaskLocks::new());
        let id = TaskId::from_u128(7);
        let guard = locks.lock(id).await;

        let contender = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.lock(id).await;
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn table_entries_are_reclaimed() {
        let locks = TaskLocks::new();
        {
            let _a = locks.lock(TaskId::from_u128(1)).await;
            let _b = locks.lock(TaskId::from_u128(2)).await;
            assert_eq!(locks.len(), 2);
        }
        assert_eq!(locks.len(), 0);
    }
}
