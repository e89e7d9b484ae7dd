use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Fs,
    Memory,
}

/// Configuration for one task manager instance.
#[derive(Debug, Deserialize, Clone)]
pub struct TaskManagerConfig {
    pub backend: Backend,
    pub path: String,
    /// Maximum number of concurrently executing tasks.
    #[serde(default = "default_active_limit")]
    pub active_limit: usize,
    /// How far ahead of now the scheduling loop considers a task due.
    #[serde(default = "default_lookahead_ms")]
    pub lookahead_ms: u64,
    /// Discard all persisted task state on open instead of recovering it.
    #[serde(default)]
    pub fresh: bool,
    #[serde(default)]
    pub flush_interval_ms: Option<u64>,
}

fn default_active_limit() -> usize {
    8
}

fn default_lookahead_ms() -> u64 {
    100
}

impl TaskManagerConfig {
    /// In-memory store, useful for tests and ephemeral nodes.
    pub fn memory() -> Self {
        TaskManagerConfig {
            backend: Backend::Memory,
            path: "keeper-tasks".to_string(),
            active_limit: default_active_limit(),
            lookahead_ms: default_lookahead_ms(),
            fresh: false,
            flush_interval_ms: None,
        }
    }

    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let data = fs::read_to_string(p)?;
                let cfg: Self = toml::from_str(&data)?;
                Ok(cfg)
            }
            None => Ok(TaskManagerConfig {
                backend: Backend::Fs,
                path: "/tmp/keeper-tasks".to_string(),
                active_limit: default_active_limit(),
                lookahead_ms: default_lookahead_ms(),
                fresh: false,
                flush_interval_ms: None,
            }),
        }
    }
}
