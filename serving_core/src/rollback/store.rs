//! # Rollback Store
//!
//! Durable, append-only records under one directory:
//!
//! - `snapshots.jsonl`: one `Created` or `Removed` record per line. Replaying
//!   the file yields the snapshots still active.
//! - `rollback_history.jsonl`: one `RollbackEvent` per line.
//! - `backups/`: artifact copies named `<snapshot id>.bak`, verified against
//!   their SHA-256 before being restored.
//!
//! A line that fails to parse (a torn write after a crash) is skipped with a
//! warning instead of failing the whole replay.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::{Result, ServingError};
use crate::rollback::snapshot::{ArtifactBackup, OptimizationSnapshot, RollbackEvent};

const SNAPSHOTS_FILE: &str = "snapshots.jsonl";
const HISTORY_FILE: &str = "rollback_history.jsonl";
const BACKUP_DIR: &str = "backups";

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "record")]
enum SnapshotRecord {
    Created(OptimizationSnapshot),
    Removed { id: String, at: DateTime<Utc> },
}

/// # Rollback Store
#[derive(Debug, Clone)]
pub struct RollbackStore {
    dir: PathBuf,
}

impl RollbackStore {
    /// Open (and create) the store rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(dir.join(BACKUP_DIR))?;
        Ok(Self { dir })
    }

    /// Root directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist a new snapshot.
    pub fn append_created(&self, snapshot: &OptimizationSnapshot) -> Result<()> {
        self.append(SNAPSHOTS_FILE, &SnapshotRecord::Created(snapshot.clone()))
    }

    /// Persist the end of a snapshot's life.
    pub fn append_removed(&self, id: &str) -> Result<()> {
        self.append(
            SNAPSHOTS_FILE,
            &SnapshotRecord::Removed {
                id: id.to_string(),
                at: Utc::now(),
            },
        )
    }

    /// Persist a rollback event.
    pub fn append_event(&self, event: &RollbackEvent) -> Result<()> {
        self.append(HISTORY_FILE, event)
    }

    fn append<T: Serialize>(&self, file: &str, record: &T) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut f = OpenOptions::new().create(true).append(true).open(self.dir.join(file))?;
        f.write_all(line.as_bytes())?;
        f.sync_data()?;
        Ok(())
    }

    /// Snapshots created and not yet removed, in creation order.
    pub fn load_snapshots(&self) -> Result<Vec<OptimizationSnapshot>> {
        let mut order: Vec<String> = Vec::new();
        let mut live: BTreeMap<String, OptimizationSnapshot> = BTreeMap::new();
        for record in self.read_lines::<SnapshotRecord>(SNAPSHOTS_FILE)? {
            match record {
                SnapshotRecord::Created(s) => {
                    order.push(s.id.clone());
                    live.insert(s.id.clone(), s);
                }
                SnapshotRecord::Removed { id, .. } => {
                    live.remove(&id);
                }
            }
        }
        Ok(order.into_iter().filter_map(|id| live.remove(&id)).collect())
    }

    /// Every rollback event ever written, oldest first.
    pub fn load_history(&self) -> Result<Vec<RollbackEvent>> {
        self.read_lines(HISTORY_FILE)
    }

    fn read_lines<T: DeserializeOwned>(&self, file: &str) -> Result<Vec<T>> {
        let path = self.dir.join(file);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(&path)?);
        let mut out = Vec::new();
        for (n, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(v) => out.push(v),
                Err(e) => tracing::warn!(file, line = n + 1, error = %e, "skipping unreadable record"),
            }
        }
        Ok(out)
    }

    /// Copy `artifact` into the backup directory and hash it.
    pub fn backup_artifact(&self, snapshot_id: &str, artifact: &Path) -> Result<ArtifactBackup> {
        let bytes = fs::read(artifact)?;
        let backup_path = self.dir.join(BACKUP_DIR).join(format!("{snapshot_id}.bak"));
        fs::write(&backup_path, &bytes)?;
        Ok(ArtifactBackup {
            original_path: artifact.to_path_buf(),
            backup_path,
            sha256: sha256_hex(&bytes),
        })
    }

    /// Put a backup back in place after checking its hash.
    pub fn restore_artifact(&self, snapshot_id: &str, backup: &ArtifactBackup) -> Result<()> {
        let bytes = fs::read(&backup.backup_path)?;
        let actual = sha256_hex(&bytes);
        if actual != backup.sha256 {
            return Err(ServingError::rollback_failure(
                snapshot_id,
                format!("backup hash mismatch: expected {}, found {actual}", backup.sha256),
            ));
        }
        fs::write(&backup.original_path, &bytes)?;
        Ok(())
    }

    /// Delete a backup; a missing file is not an error.
    pub fn remove_backup(&self, backup: &ArtifactBackup) {
        if let Err(e) = fs::remove_file(&backup.backup_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %backup.backup_path.display(), error = %e, "could not delete artifact backup");
            }
        }
    }
}

/// Hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::performance::PerformanceMetrics;
    use crate::rollback::snapshot::OptimizationType;

    fn snapshot(id: &str) -> OptimizationSnapshot {
        OptimizationSnapshot {
            id: id.to_string(),
            optimization: OptimizationType::CacheTuning,
            config: serde_json::json!({"cache_capacity_mb": 64}),
            baseline: PerformanceMetrics::default(),
            artifact: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn replay_skips_removed_and_torn_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = RollbackStore::open(dir.path()).expect("open");
        store.append_created(&snapshot("a")).expect("a");
        store.append_created(&snapshot("b")).expect("b");
        store.append_removed("a").expect("remove a");
        OpenOptions::new()
            .append(true)
            .open(dir.path().join(SNAPSHOTS_FILE))
            .and_then(|mut f| f.write_all(b"{\"record\":\"Crea"))
            .expect("torn line");

        let live = store.load_snapshots().expect("replay");
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, "b");
    }

    #[test]
    fn tampered_backup_is_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = RollbackStore::open(dir.path().join("store")).expect("open");
        let artifact = dir.path().join("model.bin");
        fs::write(&artifact, b"weights-v1").expect("write artifact");

        let backup = store.backup_artifact("s1", &artifact).expect("backup");
        fs::write(&artifact, b"weights-v2").expect("overwrite");
        store.restore_artifact("s1", &backup).expect("restore");
        assert_eq!(fs::read(&artifact).expect("read"), b"weights-v1");

        fs::write(&backup.backup_path, b"corrupted").expect("tamper");
        assert!(matches!(
            store.restore_artifact("s1", &backup),
            Err(ServingError::RollbackFailure { .. })
        ));
    }
}
