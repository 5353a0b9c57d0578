//! File-based snapshot store.
//!
//! Snapshots land under `<data_dir>/raft/snapshots` as a data file plus a
//! JSON metadata sidecar, written temp-then-rename. Only the most recent
//! `retain` snapshots are kept.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::error::{ClusterError, ClusterResult};
use crate::types::RaftSnapshotMeta;

/// Persists snapshots and serves back the most recent one.
pub struct SnapshotStore {
    dir: PathBuf,
    retain: usize,
}

impl SnapshotStore {
    pub fn open(dir: &Path, retain: usize) -> ClusterResult<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            retain: retain.max(1),
        })
    }

    /// Writes a snapshot. The data file lands before its metadata sidecar,
    /// so a reader never sees metadata without data.
    pub fn save(&self, meta: &RaftSnapshotMeta, data: &[u8]) -> ClusterResult<()> {
        let data_path = self.dir.join(format!("{}.snap", meta.snapshot_id));
        let meta_path = self.dir.join(format!("{}.meta", meta.snapshot_id));

        write_atomically(&data_path, data)?;
        write_atomically(&meta_path, &serde_json::to_vec(meta)?)?;

        tracing::info!(
            snapshot_id = %meta.snapshot_id,
            size = data.len(),
            "snapshot persisted"
        );
        self.prune()
    }

    /// Loads the most recent snapshot, if any.
    pub fn load_latest(&self) -> ClusterResult<Option<(RaftSnapshotMeta, Vec<u8>)>> {
        match self.meta_paths_newest_first()?.into_iter().next() {
            Some(meta_path) => {
                let meta: RaftSnapshotMeta = serde_json::from_slice(&fs::read(&meta_path)?)?;
                let data_path = meta_path.with_extension("snap");
                let data = fs::read(&data_path)?;
                Ok(Some((meta, data)))
            }
            None => Ok(None),
        }
    }

    fn prune(&self) -> ClusterResult<()> {
        for stale in self.meta_paths_newest_first()?.into_iter().skip(self.retain) {
            let _ = fs::remove_file(stale.with_extension("snap"));
            let _ = fs::remove_file(&stale);
        }
        Ok(())
    }

    fn meta_paths_newest_first(&self) -> ClusterResult<Vec<PathBuf>> {
        let mut metas: Vec<(SystemTime, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("meta") {
                let modified = entry.metadata()?.modified()?;
                metas.push((modified, path));
            }
        }
        metas.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(metas.into_iter().map(|(_, p)| p).collect())
    }
}

fn write_atomically(path: &Path, data: &[u8]) -> ClusterResult<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path).map_err(|e| {
        ClusterError::Io(std::io::Error::new(
            e.kind(),
            format!("renaming {}: {e}", tmp.display()),
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RaftStoredMembership;
    use tempfile::TempDir;

    fn meta(id: &str) -> RaftSnapshotMeta {
        RaftSnapshotMeta {
            last_log_id: None,
            last_membership: RaftStoredMembership::default(),
            snapshot_id: id.to_string(),
        }
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().expect("create temp dir");
        let store = SnapshotStore::open(dir.path(), 1).expect("open");

        assert!(store.load_latest().expect("load").is_none());

        store.save(&meta("snap-1"), b"state bytes").expect("save");
        let (loaded, data) = store.load_latest().expect("load").expect("snapshot");
        assert_eq!(loaded.snapshot_id, "snap-1");
        assert_eq!(data, b"state bytes");
    }

    #[test]
    fn test_retains_only_latest() {
        let dir = TempDir::new().expect("create temp dir");
        let store = SnapshotStore::open(dir.path(), 1).expect("open");

        store.save(&meta("snap-1"), b"one").expect("save");
        // mtime resolution can be coarse; make the ordering unambiguous.
        std::thread::sleep(std::time::Duration::from_millis(20));
        store.save(&meta("snap-2"), b"two").expect("save");

        let (loaded, data) = store.load_latest().expect("load").expect("snapshot");
        assert_eq!(loaded.snapshot_id, "snap-2");
        assert_eq!(data, b"two");
        assert!(!dir.path().join("snap-1.snap").exists());
    }
}
