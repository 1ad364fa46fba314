use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Per-username interaction counts, persisted as a flat JSON object.
///
/// Persistence is best effort: read and write failures are logged and
/// never reach the caller.
#[derive(Debug)]
pub struct UsageStore {
    path: PathBuf,
    counts: BTreeMap<String, u64>,
}

impl UsageStore {
    /// Read the file at `path`. A missing or unreadable file yields an empty store.
    pub fn load(path: &Path) -> Self {
        let counts = match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<BTreeMap<String, u64>>(&content) {
                Ok(counts) => {
                    info!(
                        "Loaded usage data for {} user(s) from {}",
                        counts.len(),
                        path.display()
                    );
                    counts
                }
                Err(e) => {
                    warn!("Error loading user data from {}: {}", path.display(), e);
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(
                    "Usage file {} not found, starting with empty user data",
                    path.display()
                );
                BTreeMap::new()
            }
            Err(e) => {
                warn!("Error loading user data from {}: {}", path.display(), e);
                BTreeMap::new()
            }
        };

        Self {
            path: path.to_path_buf(),
            counts,
        }
    }

    /// Overwrite the backing file with the full mapping.
    pub fn save(&self) {
        if let Err(e) = self.try_save() {
            warn!("Error saving user data to {}: {:#}", self.path.display(), e);
        }
    }

    fn try_save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string(&self.counts)?;
        std::fs::write(&self.path, json)?;
        debug!("Saved usage data to {}", self.path.display());
        Ok(())
    }

    /// Bump the count for `key` in memory and return the new value.
    pub fn increment(&mut self, key: &str) -> u64 {
        let count = self.counts.entry(key.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn count(&self, key: &str) -> u64 {
        self.counts.get(key).copied().unwrap_or(0)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Usage accounting collaborator owned by the command handler.
///
/// All access to the store goes through one mutex, so concurrent events
/// serialize their increment-and-save and never lose an update.
#[derive(Clone)]
pub struct Accounting {
    store: Option<Arc<Mutex<UsageStore>>>,
}

impl Accounting {
    pub fn enabled(store: UsageStore) -> Self {
        Self {
            store: Some(Arc::new(Mutex::new(store))),
        }
    }

    pub fn disabled() -> Self {
        Self { store: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    /// Increment and persist the count for `username`.
    /// Returns `None` when accounting is disabled.
    pub async fn record(&self, username: &str) -> Option<u64> {
        let store = self.store.as_ref()?;
        let mut store = store.lock().await;
        let count = store.increment(username);
        store.save();
        Some(count)
    }

    #[cfg(test)]
    pub async fn count(&self, username: &str) -> Option<u64> {
        let store = self.store.as_ref()?;
        let count = store.lock().await.count(username);
        Some(count)
    }
}
