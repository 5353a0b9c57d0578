//! Stable store: durable key-value storage for consensus metadata.
//!
//! Holds the vote, the committed log id, the last purged log id, and the
//! state machine's applied state. Backed by an embedded B-tree database in a
//! single file at `<data_dir>/raft/stable`; every write commits before
//! returning.

use std::path::Path;

use redb::{Database, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{ClusterError, ClusterResult};

const STABLE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("stable");

/// Key for the persisted vote.
pub(crate) const VOTE_KEY: &str = "vote";
/// Key for the committed log id.
pub(crate) const COMMITTED_KEY: &str = "committed";
/// Key for the last purged log id.
pub(crate) const LAST_PURGED_KEY: &str = "last_purged";
/// Key for the state machine's last applied log id.
pub(crate) const APPLIED_KEY: &str = "applied";
/// Key for the state machine's last seen membership.
pub(crate) const MEMBERSHIP_KEY: &str = "membership";

/// Durable, single-writer key-to-bytes store.
pub struct StableStore {
    db: Database,
}

impl StableStore {
    /// Opens (or creates) the store and makes sure the table exists so
    /// first reads do not fail.
    pub fn open(path: &Path) -> ClusterResult<Self> {
        let db = Database::create(path).map_err(store_err)?;
        let tx = db.begin_write().map_err(store_err)?;
        tx.open_table(STABLE_TABLE).map_err(store_err)?;
        tx.commit().map_err(store_err)?;
        Ok(Self { db })
    }

    /// Reads and deserializes the value under `key`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> ClusterResult<Option<T>> {
        let tx = self.db.begin_read().map_err(store_err)?;
        let table = tx.open_table(STABLE_TABLE).map_err(store_err)?;
        match table.get(key).map_err(store_err)? {
            Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Serializes and durably writes `value` under `key`.
    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> ClusterResult<()> {
        let data = serde_json::to_vec(value)?;
        let tx = self.db.begin_write().map_err(store_err)?;
        {
            let mut table = tx.open_table(STABLE_TABLE).map_err(store_err)?;
            table.insert(key, data.as_slice()).map_err(store_err)?;
        }
        tx.commit().map_err(store_err)?;
        Ok(())
    }
}

fn store_err(e: impl std::fmt::Display) -> ClusterError {
    ClusterError::StableStore(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_roundtrip_and_overwrite() {
        let dir = TempDir::new().expect("create temp dir");
        let store = StableStore::open(&dir.path().join("stable")).expect("open");

        assert_eq!(store.get::<u64>("term").expect("get"), None);

        store.set("term", &7u64).expect("set");
        assert_eq!(store.get::<u64>("term").expect("get"), Some(7));

        store.set("term", &8u64).expect("overwrite");
        assert_eq!(store.get::<u64>("term").expect("get"), Some(8));
    }

    #[test]
    fn test_survives_reopen() {
        let dir = TempDir::new().expect("create temp dir");
        let path = dir.path().join("stable");

        {
            let store = StableStore::open(&path).expect("open");
            store.set("vote", &(5u64, 3u64)).expect("set");
        }

        let store = StableStore::open(&path).expect("reopen");
        assert_eq!(
            store.get::<(u64, u64)>("vote").expect("get"),
            Some((5, 3))
        );
    }
}
