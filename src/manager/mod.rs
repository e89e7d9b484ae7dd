//! Task manager - the composition root of the scheduling pipeline.
//!
//! This module contains the core `TaskManager` type and its implementation,
//! split across multiple submodules for organization:
//!
//! - `helpers`: transaction retry and prefix-scan utilities
//! - `schedule`: task creation, update, and cancellation
//! - `scheduling`: the scheduled -> queued control loop
//! - `queueing`: the queued -> active control loop
//! - `execute`: per-task execution under deadline and cancellation
//! - `gc`: garbage collection and requeue of settled tasks
//! - `recover`: startup repair of state left by an unclean shutdown

mod execute;
mod gc;
mod helpers;
mod queueing;
mod recover;
mod schedule;
mod scheduling;

pub use schedule::{TaskPatch, TaskSpec};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use slatedb::Db;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::codec::{decode_task_data, CodecError};
use crate::handler::HandlerRegistry;
use crate::ids::{TaskId, TaskIdGenerator};
use crate::keys::{
    active_key, parse_path_key, parse_task_key, path_prefix, queued_key, task_key, KeyParseError,
    TASK_PREFIX,
};
use crate::locks::TaskLocks;
use crate::promise::{PromiseRegistry, SettlementReceiver, TaskFailure, TaskSettlement};
use crate::settings::TaskManagerConfig;
use crate::storage::{open_db, StorageError};
use crate::task::{priority_to_key, TaskInfo, TaskOrder, TaskStatus};

#[derive(Debug, Error)]
pub enum TaskManagerError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Slate(#[from] slatedb::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Key(#[from] KeyParseError),
    #[error("task {0} is no longer tracked")]
    TaskMissing(TaskId),
    #[error("task {0} has left the scheduled state")]
    TaskRunning(TaskId),
    #[error("path tag contains '/': {0}")]
    InvalidPathTag(String),
    #[error("task manager is closed")]
    Closed,
    #[error("garbage collection failed for task {id}: {source}")]
    GarbageCollection {
        id: TaskId,
        source: Box<TaskManagerError>,
    },
    #[error("requeue failed for task {id}: {source}")]
    Requeue {
        id: TaskId,
        source: Box<TaskManagerError>,
    },
    #[error("transaction conflict during {0}, exceeded max retries")]
    TransactionConflict(&'static str),
    #[error("scheduling loop failed: {0}")]
    SchedulerLoop(String),
    #[error("queuing loop failed: {0}")]
    QueueLoop(String),
}

/// Shared shape of the two control loops: a long-lived worker parked on a
/// notification, plus at most one armed wake timer.
pub(crate) struct LoopState {
    pub(crate) running: AtomicBool,
    pub(crate) notify: Notify,
    pub(crate) worker: StdMutex<Option<JoinHandle<()>>>,
    pub(crate) timer: StdMutex<Option<ArmedTimer>>,
}

pub(crate) struct ArmedTimer {
    pub(crate) due_ms: u64,
    pub(crate) handle: JoinHandle<()>,
}

impl LoopState {
    fn new() -> Arc<Self> {
        Arc::new(LoopState {
            running: AtomicBool::new(false),
            notify: Notify::new(),
            worker: StdMutex::new(None),
            timer: StdMutex::new(None),
        })
    }

    /// Immediate wake. Stores a permit if the loop is mid-iteration.
    pub(crate) fn trigger(&self) {
        self.notify.notify_one();
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn shut_down(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(timer) = self.timer.lock().unwrap().take() {
            timer.handle.abort();
        }
        self.notify.notify_one();
        let worker = self.worker.lock().unwrap().take();
        if let Some(handle) = worker {
            let _ = handle.await;
        }
    }
}

/// In-memory record of one in-flight task. Process-local cache only; the
/// active index in the store remains the source of truth across restarts.
#[derive(Clone)]
pub(crate) struct ActiveEntry {
    pub(crate) cancel: CancellationToken,
    pub(crate) reason: Arc<StdMutex<Option<String>>>,
}

impl ActiveEntry {
    fn new() -> Self {
        ActiveEntry {
            cancel: CancellationToken::new(),
            reason: Arc::new(StdMutex::new(None)),
        }
    }
}

/// Persistent task scheduler over a transactional ordered store.
///
/// Owns the store instance; two managers must not share one database.
pub struct TaskManager {
    pub(crate) db: Arc<Db>,
    pub(crate) config: TaskManagerConfig,
    pub(crate) handlers: Arc<HandlerRegistry>,
    pub(crate) locks: TaskLocks,
    /// Serializes `lastTaskId` allocation under concurrent `schedule_task`.
    pub(crate) last_id_lock: tokio::sync::Mutex<()>,
    pub(crate) ids: TaskIdGenerator,
    pub(crate) promises: PromiseRegistry,
    pub(crate) active: StdMutex<HashMap<TaskId, ActiveEntry>>,
    pub(crate) scheduler: Arc<LoopState>,
    pub(crate) queue: Arc<LoopState>,
    /// First fatal pipeline error since processing last started, if any.
    pub(crate) loop_error: StdMutex<Option<Arc<TaskManagerError>>>,
}

impl TaskManager {
    /// Open a manager over the configured store.
    ///
    /// Unless `config.fresh` is set, state left by an unclean shutdown is
    /// recovered: dangling active entries move back to the queued index and
    /// the id generator is reseeded from the persisted high-water mark.
    /// With `lazy` the two loops stay parked until `start_processing`.
    pub async fn open(
        config: TaskManagerConfig,
        handlers: Arc<HandlerRegistry>,
        lazy: bool,
    ) -> Result<Arc<Self>, TaskManagerError> {
        let db = Arc::new(open_db(&config).await?);

        if config.fresh {
            recover::clear_all(&db).await?;
        } else {
            recover::repair_dangling_tasks(&db).await?;
        }
        let seed = recover::read_last_task_id(&db).await?;

        let manager = Arc::new(TaskManager {
            db,
            config,
            handlers,
            locks: TaskLocks::new(),
            last_id_lock: tokio::sync::Mutex::new(()),
            ids: TaskIdGenerator::new(seed),
            promises: PromiseRegistry::new(),
            active: StdMutex::new(HashMap::new()),
            scheduler: LoopState::new(),
            queue: LoopState::new(),
            loop_error: StdMutex::new(None),
        });

        if !lazy {
            manager.start_processing();
        }
        Ok(manager)
    }

    /// Start both control loops. Idempotent. Clears any recorded pipeline
    /// failure from a previous run.
    pub fn start_processing(self: &Arc<Self>) {
        *self.loop_error.lock().unwrap() = None;
        self.spawn_scheduling_loop();
        self.spawn_queueing_loop();
    }

    /// Stop both control loops after their current iteration and disarm any
    /// wake timers. In-flight tasks keep running.
    pub async fn stop_processing(&self) {
        self.scheduler.shut_down().await;
        self.queue.shut_down().await;
    }

    pub fn is_processing(&self) -> bool {
        self.scheduler.is_running() || self.queue.is_running()
    }

    /// The error that killed the pipeline, if a loop or executor stopped on a
    /// fatal store failure. `None` after a clean `stop_processing`.
    pub fn last_loop_error(&self) -> Option<Arc<TaskManagerError>> {
        self.loop_error.lock().unwrap().clone()
    }

    /// Record the first fatal pipeline error; later ones keep the original
    /// diagnosis.
    pub(crate) fn record_loop_failure(&self, err: TaskManagerError) {
        let mut slot = self.loop_error.lock().unwrap();
        if slot.is_none() {
            *slot = Some(Arc::new(err));
        }
    }

    /// Stop processing, cancel in-flight tasks cooperatively, and close the
    /// underlying store.
    pub async fn close(&self) -> Result<(), TaskManagerError> {
        self.stop_processing().await;

        {
            let active = self.active.lock().unwrap();
            for entry in active.values() {
                *entry.reason.lock().unwrap() = Some("task manager stopping".to_string());
                entry.cancel.cancel();
            }
        }
        // Wait for executors to settle; they remove themselves from the map.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !self.active.lock().unwrap().is_empty() {
            if tokio::time::Instant::now() >= deadline {
                debug!("closing with executors still settling");
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        self.db.flush().await?;
        self.db.close().await?;
        Ok(())
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub(crate) fn active_count(&self) -> usize {
        self.active.lock().unwrap().len()
    }

    /// Fetch one task's metadata, or `None` if it is no longer tracked.
    pub async fn get_task(&self, id: TaskId) -> Result<Option<TaskInfo>, TaskManagerError> {
        let Some(raw) = self.db.get(task_key(&id).as_bytes()).await? else {
            return Ok(None);
        };
        let data = decode_task_data(&raw)?;
        let status = self.task_status(&id, &data).await?;
        Ok(Some(TaskInfo::new(id, status, &data)))
    }

    /// Range lookup ordered by task id, optionally restricted to a path
    /// prefix.
    pub async fn get_tasks(
        &self,
        order: TaskOrder,
        path: Option<&[String]>,
    ) -> Result<Vec<TaskInfo>, TaskManagerError> {
        let ids: Vec<TaskId> = match path {
            None => {
                let keys = helpers::scan_keys(&self.db, TASK_PREFIX, None).await?;
                keys.iter()
                    .map(|k| parse_task_key(k))
                    .collect::<Result<_, _>>()?
            }
            Some(path) => {
                let prefix = path_prefix(path);
                let keys = helpers::scan_keys(&self.db, &prefix, None).await?;
                keys.iter()
                    .map(|k| parse_path_key(k))
                    .collect::<Result<_, _>>()?
            }
        };

        let mut tasks = Vec::with_capacity(ids.len());
        for id in ids {
            // A task may settle between the scan and the point lookup.
            if let Some(info) = self.get_task(id).await? {
                tasks.push(info);
            }
        }
        if order == TaskOrder::Desc {
            tasks.reverse();
        }
        Ok(tasks)
    }

    /// Get the memoized settlement promise for a task.
    ///
    /// Repeated calls for the same pending id share one settlement channel.
    /// If the task is no longer tracked and nothing has fired yet, the
    /// promise resolves immediately with a missing-task failure instead of
    /// hanging forever.
    pub async fn get_task_promise(
        self: &Arc<Self>,
        id: TaskId,
    ) -> Result<TaskPromise, TaskManagerError> {
        let rx = self.promises.subscribe(id);
        if self.db.get(task_key(&id).as_bytes()).await?.is_none() && rx.borrow().is_none() {
            self.promises.settle(id, Err(TaskFailure::Missing(id)));
        }
        Ok(TaskPromise {
            id,
            rx,
            manager: Arc::downgrade(self),
        })
    }

    pub(crate) async fn task_status(
        &self,
        id: &TaskId,
        data: &crate::task::TaskData,
    ) -> Result<TaskStatus, TaskManagerError> {
        if self.db.get(active_key(id).as_bytes()).await?.is_some() {
            return Ok(TaskStatus::Active);
        }
        let qk = queued_key(priority_to_key(data.priority), data.due_time_ms(), id);
        if self.db.get(qk.as_bytes()).await?.is_some() {
            return Ok(TaskStatus::Queued);
        }
        Ok(TaskStatus::Scheduled)
    }
}

/// Caller-facing handle to a scheduled task.
#[derive(Debug)]
pub struct Task {
    pub(crate) manager: Weak<TaskManager>,
    pub(crate) info: TaskInfo,
}

impl Task {
    pub fn id(&self) -> TaskId {
        self.info.id
    }

    /// Metadata snapshot captured when the handle was produced.
    pub fn info(&self) -> &TaskInfo {
        &self.info
    }

    /// The task's settlement promise. Lazily constructed and memoized per
    /// task id, so fetching metadata never allocates execution-path state.
    pub async fn promise(&self) -> Result<TaskPromise, TaskManagerError> {
        let manager = self.manager.upgrade().ok_or(TaskManagerError::Closed)?;
        manager.get_task_promise(self.info.id).await
    }

    pub async fn cancel(&self, reason: impl Into<String>) -> Result<(), TaskManagerError> {
        let manager = self.manager.upgrade().ok_or(TaskManagerError::Closed)?;
        manager.cancel_task(self.info.id, reason).await
    }
}

/// A cancellable future over one task's settlement.
pub struct TaskPromise {
    pub(crate) id: TaskId,
    pub(crate) rx: SettlementReceiver,
    pub(crate) manager: Weak<TaskManager>,
}

impl TaskPromise {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Wait for the task to settle. Observes exactly one of: the handler's
    /// resolved value, its terminal error, a missing-task failure, or a
    /// cancellation reason.
    pub async fn wait(mut self) -> TaskSettlement {
        loop {
            if let Some(settlement) = self.rx.borrow_and_update().clone() {
                return settlement;
            }
            if self.rx.changed().await.is_err() {
                // Registry dropped without settling: the manager went away.
                return Err(TaskFailure::Missing(self.id));
            }
        }
    }

    /// Cancel the underlying task; the settlement carries `reason`.
    pub async fn cancel(&self, reason: impl Into<String>) -> Result<(), TaskManagerError> {
        let manager = self.manager.upgrade().ok_or(TaskManagerError::Closed)?;
        manager.cancel_task(self.id, reason).await
    }
}
