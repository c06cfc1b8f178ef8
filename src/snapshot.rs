//! Atomic load/save of the full-state snapshot document.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{VaultError, VaultResult};
use crate::schema::{self, LocalStoreSchema};

const SNAPSHOT_FILE: &str = "snapshot.json";

/// Exclusive owner of `snapshot.json`. All mutation goes through [`save`];
/// no other component touches the file directly.
///
/// [`save`]: SnapshotStore::save
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: &Path) -> Self {
        SnapshotStore {
            path: dir.join(SNAPSHOT_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn exists(&self) -> bool {
        tokio::fs::metadata(&self.path).await.is_ok()
    }

    /// Read the snapshot. Absent, unreadable, or corrupt files all yield the
    /// empty template — this is the defensive boundary against corruption,
    /// and it never fails to the caller.
    pub async fn load(&self) -> LocalStoreSchema {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no snapshot on disk, starting empty");
                return LocalStoreSchema::empty();
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "snapshot unreadable, treating as empty");
                return LocalStoreSchema::empty();
            }
        };

        match serde_json::from_str(&text) {
            Ok(value) => schema::normalize(value),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "snapshot unparsable, treating as empty");
                LocalStoreSchema::empty()
            }
        }
    }

    /// Serialize and write via temp-file-then-rename, so a crash mid-write
    /// never leaves a half-written snapshot visible to a later [`load`].
    /// Write errors propagate.
    ///
    /// [`load`]: SnapshotStore::load
    pub async fn save(&self, schema: &LocalStoreSchema) -> VaultResult<()> {
        let contents = serde_json::to_string_pretty(schema)
            .map_err(|e| VaultError::Serialization(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let temp = self.path.with_extension("json.tmp");
        tokio::fs::write(&temp, contents).await?;
        tokio::fs::rename(&temp, &self.path).await?;
        Ok(())
    }
}
