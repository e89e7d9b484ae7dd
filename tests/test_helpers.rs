#![allow(dead_code, unused_macros)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Semaphore;

use keeper::{
    Backend, HandlerRegistry, TaskContext, TaskHandler, TaskHandlerError, TaskId, TaskInfo,
    TaskManager, TaskManagerConfig,
};

/// Wrap a test body in a hard timeout so a hang fails instead of wedging CI.
macro_rules! with_timeout {
    ($ms:expr, $body:block) => {{
        tokio::time::timeout(std::time::Duration::from_millis($ms), async move { $body })
            .await
            .expect("test timed out")
    }};
}

pub fn test_config(path: &str) -> TaskManagerConfig {
    TaskManagerConfig {
        backend: Backend::Fs,
        path: path.to_string(),
        active_limit: 8,
        lookahead_ms: 100,
        fresh: false,
        flush_interval_ms: Some(10),
    }
}

/// Open a lazy manager over a fresh temp directory. The tempdir must outlive
/// the manager, so it is returned alongside.
pub async fn open_temp_manager(
    handlers: Arc<HandlerRegistry>,
) -> (tempfile::TempDir, Arc<TaskManager>) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let manager = open_manager_at(&tmp.path().to_string_lossy(), handlers).await;
    (tmp, manager)
}

/// Open a lazy manager over an existing directory (for restart tests).
pub async fn open_manager_at(path: &str, handlers: Arc<HandlerRegistry>) -> Arc<TaskManager> {
    TaskManager::open(test_config(path), handlers, true)
        .await
        .expect("open manager")
}

/// Records the order of invocations; optionally sleeps to simulate work.
pub struct RecordingHandler {
    pub calls: Arc<Mutex<Vec<TaskId>>>,
    pub work_ms: u64,
}

impl RecordingHandler {
    pub fn new(work_ms: u64) -> (Arc<Self>, Arc<Mutex<Vec<TaskId>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let handler = Arc::new(RecordingHandler {
            calls: Arc::clone(&calls),
            work_ms,
        });
        (handler, calls)
    }
}

#[async_trait]
impl TaskHandler for RecordingHandler {
    async fn handle(
        &self,
        _ctx: TaskContext,
        info: TaskInfo,
        _parameters: Vec<Value>,
    ) -> Result<Value, TaskHandlerError> {
        self.calls.lock().unwrap().push(info.id);
        if self.work_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.work_ms)).await;
        }
        Ok(Value::Null)
    }
}

/// Blocks until a gate permit is released; tracks peak concurrency.
pub struct GatedHandler {
    pub gate: Arc<Semaphore>,
    pub running: Arc<AtomicUsize>,
    pub peak: Arc<AtomicUsize>,
}

impl GatedHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(GatedHandler {
            gate: Arc::new(Semaphore::new(0)),
            running: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        })
    }
}

#[async_trait]
impl TaskHandler for GatedHandler {
    async fn handle(
        &self,
        _ctx: TaskContext,
        _info: TaskInfo,
        _parameters: Vec<Value>,
    ) -> Result<Value, TaskHandlerError> {
        let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_running, Ordering::SeqCst);
        let permit = self.gate.acquire().await.expect("gate closed");
        permit.forget();
        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(Value::Null)
    }
}

/// Raises the retry signal a fixed number of times before succeeding.
pub struct FlakyHandler {
    pub remaining_failures: Arc<AtomicUsize>,
    pub attempts: Arc<AtomicUsize>,
}

impl FlakyHandler {
    pub fn new(failures: usize) -> Arc<Self> {
        Arc::new(FlakyHandler {
            remaining_failures: Arc::new(AtomicUsize::new(failures)),
            attempts: Arc::new(AtomicUsize::new(0)),
        })
    }
}

#[async_trait]
impl TaskHandler for FlakyHandler {
    async fn handle(
        &self,
        _ctx: TaskContext,
        _info: TaskInfo,
        _parameters: Vec<Value>,
    ) -> Result<Value, TaskHandlerError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.remaining_failures.load(Ordering::SeqCst) > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(TaskHandlerError::Requeue);
        }
        Ok(Value::Null)
    }
}

/// Count the persisted rows under one key prefix.
pub async fn count_rows(manager: &TaskManager, prefix: &str) -> usize {
    let start: Vec<u8> = prefix.as_bytes().to_vec();
    let end = keeper::keys::end_bound(prefix);
    let mut iter = manager
        .db()
        .scan::<Vec<u8>, _>(start..=end)
        .await
        .expect("scan");
    let mut count = 0;
    while iter.next().await.expect("scan next").is_some() {
        count += 1;
    }
    count
}

/// Assert that no index or record row remains for any task.
pub async fn assert_store_drained(manager: &TaskManager) {
    for prefix in [
        keeper::keys::TASK_PREFIX,
        keeper::keys::SCHEDULED_PREFIX,
        keeper::keys::QUEUED_PREFIX,
        keeper::keys::ACTIVE_PREFIX,
        keeper::keys::PATH_PREFIX,
    ] {
        assert_eq!(
            count_rows(manager, prefix).await,
            0,
            "rows left under {prefix}"
        );
    }
}

/// Poll until `f` returns true or the timeout elapses; returns the final state.
pub async fn wait_until<F: Fn() -> bool>(timeout_ms: u64, f: F) -> bool {
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_millis(timeout_ms);
    while tokio::time::Instant::now() < deadline {
        if f() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    f()
}
