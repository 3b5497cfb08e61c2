// ABOUTME: Durable key/value storage shared by execution units
// ABOUTME: Memory and JSON-file backends with last-write-wins semantics

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// Minimal async key/value contract backing credential and session tokens.
///
/// Units treat this as eventually-consistent storage: concurrent writers are
/// tolerated with last-write-wins, and no transactional guarantee exists. A
/// freshly spawned unit reads its session state from here instead of
/// re-authenticating.
pub trait PersistentStore: Send + Sync {
    /// Fetch the value for `key`, or `None` when absent.
    fn get(&self, key: &str) -> BoxFuture<'_, Option<String>>;

    /// Store `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: &str) -> BoxFuture<'_, io::Result<()>>;

    /// Delete `key` if present.
    fn remove(&self, key: &str) -> BoxFuture<'_, io::Result<()>>;
}

/// Process-local store. The default backing for pooled strategies, since all
/// execution units live in one process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistentStore for MemoryStore {
    fn get(&self, key: &str) -> BoxFuture<'_, Option<String>> {
        let key = key.to_string();
        Box::pin(async move { self.entries.read().await.get(&key).cloned() })
    }

    fn set(&self, key: &str, value: &str) -> BoxFuture<'_, io::Result<()>> {
        let key = key.to_string();
        let value = value.to_string();
        Box::pin(async move {
            self.entries.write().await.insert(key, value);
            Ok(())
        })
    }

    fn remove(&self, key: &str) -> BoxFuture<'_, io::Result<()>> {
        let key = key.to_string();
        Box::pin(async move {
            self.entries.write().await.remove(&key);
            Ok(())
        })
    }
}

/// Store persisted as a single JSON object on disk, so session state
/// survives process restarts.
///
/// Every write rewrites the whole file under a lock; concurrent writers
/// observe last-write-wins, which is all the contract requires.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    /// Store backed by the given file. The parent directory is created on
    /// first write.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    /// Store at the platform data directory (`<data_dir>/portico/store.json`).
    pub fn default_location() -> io::Result<Self> {
        let base = dirs::data_dir()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no data directory"))?;
        Ok(Self::new(base.join("portico").join("store.json")))
    }

    async fn read_all(&self) -> HashMap<String, String> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(path = %self.path.display(), error = %e, "Corrupt store file, starting empty");
                HashMap::new()
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read store file");
                HashMap::new()
            }
        }
    }

    async fn write_all(&self, entries: &HashMap<String, String>) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let raw = serde_json::to_string_pretty(entries)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tokio::fs::write(&self.path, raw).await
    }
}

impl PersistentStore for JsonFileStore {
    fn get(&self, key: &str) -> BoxFuture<'_, Option<String>> {
        let key = key.to_string();
        Box::pin(async move {
            let _guard = self.lock.lock().await;
            self.read_all().await.get(&key).cloned()
        })
    }

    fn set(&self, key: &str, value: &str) -> BoxFuture<'_, io::Result<()>> {
        let key = key.to_string();
        let value = value.to_string();
        Box::pin(async move {
            let _guard = self.lock.lock().await;
            let mut entries = self.read_all().await;
            entries.insert(key, value);
            self.write_all(&entries).await?;
            debug!(path = %self.path.display(), "Store updated");
            Ok(())
        })
    }

    fn remove(&self, key: &str) -> BoxFuture<'_, io::Result<()>> {
        let key = key.to_string();
        Box::pin(async move {
            let _guard = self.lock.lock().await;
            let mut entries = self.read_all().await;
            if entries.remove(&key).is_some() {
                self.write_all(&entries).await?;
            }
            Ok(())
        })
    }
}

/// Shared handle type used throughout the gateway.
pub type SharedStore = Arc<dyn PersistentStore>;
