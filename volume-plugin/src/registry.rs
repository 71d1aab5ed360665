//! Volume Registry and its JSON state file.
//!
//! The registry owns the name → record map behind a single reader/writer
//! lock. Callers only reach the map through the guards returned by
//! [`Registry::read`] and [`Registry::write`], so every access happens under
//! the lock. The whole map is rewritten to the state file after each
//! mutation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

use crate::error::StateError;
use crate::types::{VolumeRecord, VolumeSummary};

/// On-disk shape of the registry.
pub type StateDb = BTreeMap<String, VolumeRecord>;

/// State file name under the plugin root
pub const STATE_FILE_NAME: &str = "freenas-state.json";

pub struct Registry {
    volumes: RwLock<StateDb>,
    state_path: PathBuf,
}

impl Registry {
    /// Empty registry persisting to `state_path`.
    pub fn empty(state_path: impl Into<PathBuf>) -> Self {
        Self {
            volumes: RwLock::new(StateDb::new()),
            state_path: state_path.into(),
        }
    }

    /// Load the registry from `state_path`; a missing file yields an empty registry.
    pub async fn load(state_path: impl Into<PathBuf>) -> Result<Self, StateError> {
        let state_path = state_path.into();
        let db = load_state(&state_path).await?;
        info!(
            path = %state_path.display(),
            volumes = db.len(),
            "Loaded volume state"
        );
        Ok(Self {
            volumes: RwLock::new(db),
            state_path,
        })
    }

    /// Exclusive access for the duration of a lifecycle operation.
    pub async fn write(&self) -> RegistryWriteGuard<'_> {
        RegistryWriteGuard {
            volumes: self.volumes.write().await,
            state_path: &self.state_path,
        }
    }

    /// Shared access for lookups of immutable record fields.
    pub async fn read(&self) -> RegistryReadGuard<'_> {
        RegistryReadGuard {
            volumes: self.volumes.read().await,
        }
    }
}

pub struct RegistryWriteGuard<'a> {
    volumes: RwLockWriteGuard<'a, StateDb>,
    state_path: &'a Path,
}

impl RegistryWriteGuard<'_> {
    pub fn get(&self, name: &str) -> Option<&VolumeRecord> {
        self.volumes.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut VolumeRecord> {
        self.volumes.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.volumes.contains_key(name)
    }

    pub fn insert(&mut self, record: VolumeRecord) {
        self.volumes.insert(record.name.clone(), record);
    }

    pub fn remove(&mut self, name: &str) -> Option<VolumeRecord> {
        self.volumes.remove(name)
    }

    pub fn summaries(&self) -> Vec<VolumeSummary> {
        self.volumes.values().map(VolumeRecord::summary).collect()
    }

    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }

    /// Number of volumes with at least one mount holder.
    pub fn mounted_count(&self) -> usize {
        self.volumes.values().filter(|v| v.connections > 0).count()
    }

    /// Rewrite the state file from the current map.
    pub async fn persist(&self) -> Result<(), StateError> {
        write_state(self.state_path, &self.volumes).await?;
        debug!(path = %self.state_path.display(), volumes = self.volumes.len(), "Persisted volume state");
        Ok(())
    }
}

pub struct RegistryReadGuard<'a> {
    volumes: RwLockReadGuard<'a, StateDb>,
}

impl RegistryReadGuard<'_> {
    pub fn get(&self, name: &str) -> Option<&VolumeRecord> {
        self.volumes.get(name)
    }

    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    /// Number of volumes with at least one mount holder.
    pub fn mounted_count(&self) -> usize {
        self.volumes.values().filter(|v| v.connections > 0).count()
    }
}

/// Load the state file.
///
/// Returns an empty map if the file doesn't exist. Record names are taken
/// from the map keys and connection counts start at zero.
pub async fn load_state(path: impl AsRef<Path>) -> Result<StateDb, StateError> {
    let path = path.as_ref();

    if !tokio::fs::try_exists(path).await? {
        return Ok(StateDb::new());
    }

    let content = tokio::fs::read_to_string(path).await?;
    if content.trim().is_empty() {
        return Ok(StateDb::new());
    }

    let mut db: StateDb = serde_json::from_str(&content)?;
    for (name, record) in db.iter_mut() {
        record.name = name.clone();
        record.connections = 0;
    }
    Ok(db)
}

/// Write the state file atomically.
///
/// Uses the crash-safe pattern:
/// 1. Write to .new file
/// 2. Copy current to .old (backup)
/// 3. Rename .new to current (atomic)
///
/// File is written with 0644 permissions.
pub async fn write_state(path: impl AsRef<Path>, db: &StateDb) -> Result<(), StateError> {
    use tokio::io::AsyncWriteExt;

    let path = path.as_ref();
    let new_path = path.with_extension("json.new");
    let old_path = path.with_extension("json.old");

    let content = serde_json::to_string_pretty(db)?;
    let mut file = tokio::fs::File::create(&new_path).await?;
    file.write_all(content.as_bytes()).await?;
    file.sync_all().await?;
    drop(file);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o644);
        tokio::fs::set_permissions(&new_path, perms).await?;
    }

    if tokio::fs::try_exists(path).await? {
        tokio::fs::copy(path, &old_path).await?;
    }

    tokio::fs::rename(&new_path, path).await?;

    Ok(())
}
