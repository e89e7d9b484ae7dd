use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use slatedb::object_store::ObjectStore;
use slatedb::{Db, Error as SlateError};
use thiserror::Error;

use crate::settings::{Backend, TaskManagerConfig};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("slatedb error: {0}")]
    Slate(#[from] SlateError),
    #[error("invalid store path: {0}")]
    InvalidPath(String),
}

/// Result of resolving an object store, includes the canonical path used
pub struct ResolvedStore {
    pub store: Arc<dyn ObjectStore>,
    pub canonical_path: String,
}

pub fn resolve_object_store(backend: &Backend, path: &str) -> Result<ResolvedStore, StorageError> {
    match backend {
        Backend::Fs => {
            // Ensure the directory exists before creating the LocalFileSystem root
            let root = Path::new(path);
            if !root.exists() {
                fs::create_dir_all(root).map_err(|e| {
                    StorageError::InvalidPath(format!("failed to create fs root {}: {}", path, e))
                })?;
            }
            // Canonicalize to avoid URL-encoding issues with relative paths
            let canonical_path = root.canonicalize().map_err(|e| {
                StorageError::InvalidPath(format!("failed to canonicalize path {}: {}", path, e))
            })?;
            let canonical_str = canonical_path.to_string_lossy().to_string();
            // Use slatedb's re-exported object_store to ensure trait compatibility
            let store = slatedb::object_store::local::LocalFileSystem::new_with_prefix(
                &canonical_str,
            )
            .map_err(|e| StorageError::InvalidPath(format!("{}", e)))?;
            Ok(ResolvedStore {
                store: Arc::new(store),
                canonical_path: canonical_str,
            })
        }
        Backend::Memory => Ok(ResolvedStore {
            store: Arc::new(slatedb::object_store::memory::InMemory::new()),
            canonical_path: path.to_string(),
        }),
    }
}

/// Open the SlateDB instance backing one task manager.
pub async fn open_db(cfg: &TaskManagerConfig) -> Result<Db, StorageError> {
    let resolved = resolve_object_store(&cfg.backend, &cfg.path)?;
    let mut builder = slatedb::DbBuilder::new(resolved.canonical_path.as_str(), resolved.store);
    if let Some(flush_ms) = cfg.flush_interval_ms {
        let settings = slatedb::config::Settings {
            flush_interval: Some(Duration::from_millis(flush_ms)),
            ..Default::default()
        };
        builder = builder.with_settings(settings);
    }
    Ok(builder.build().await?)
}
