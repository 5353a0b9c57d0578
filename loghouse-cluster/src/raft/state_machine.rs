//! The finite state machine the consensus engine applies committed commands
//! into.
//!
//! The state IS the record log: applying an append command writes the record
//! and answers with its assigned offset. A snapshot is the log streamed
//! whole (concatenated segment stores); restoring one resets the log so its
//! first offset matches the first record in the stream, then replays every
//! record in order.

use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use loghouse_core::Log;
use loghouse_proto::v1::Record;
use openraft::storage::RaftStateMachine;
use openraft::{
    EntryPayload, RaftSnapshotBuilder, RaftTypeConfig, StorageIOError, StoredMembership,
};
use prost::Message;
use tokio::sync::RwLock;

use crate::command::{Command, CommandResponse};
use crate::error::{ClusterError, ClusterResult};
use crate::raft::snapshot_store::SnapshotStore;
use crate::raft::stable::{APPLIED_KEY, MEMBERSHIP_KEY};
use crate::raft::StableStore;
use crate::types::{
    RaftEntry, RaftLogId, RaftSnapshot, RaftSnapshotMeta, RaftStorageError, RaftStoredMembership,
    TypeConfig,
};

#[derive(Debug, Default)]
struct Applied {
    last_applied: Option<RaftLogId>,
    membership: RaftStoredMembership,
}

/// State machine over the record log.
pub struct StateMachine {
    log: Arc<Log>,
    stable: Arc<StableStore>,
    snapshots: SnapshotStore,
    applied: RwLock<Applied>,
    snapshot_idx: AtomicU64,
}

impl StateMachine {
    /// Opens the state machine, reloading the applied position persisted in
    /// the stable store so a restarted node resumes instead of re-applying
    /// records it already holds.
    pub fn open(
        log: Arc<Log>,
        stable: Arc<StableStore>,
        snapshot_dir: &Path,
        retain: usize,
    ) -> ClusterResult<Self> {
        let snapshots = SnapshotStore::open(snapshot_dir, retain)?;
        let last_applied: Option<RaftLogId> = stable.get(APPLIED_KEY)?.flatten();
        let membership: RaftStoredMembership = stable.get(MEMBERSHIP_KEY)?.unwrap_or_default();
        Ok(Self {
            log,
            stable,
            snapshots,
            applied: RwLock::new(Applied {
                last_applied,
                membership,
            }),
            snapshot_idx: AtomicU64::new(0),
        })
    }

    /// Applies one framed command to the record log. Errors become response
    /// errors routed back to the proposer; the node keeps running.
    fn apply_command(&self, frame: &[u8]) -> CommandResponse {
        match Command::decode(frame) {
            Ok(Command::Append(req)) => match req.record {
                Some(mut record) => match self.log.append(&mut record) {
                    Ok(offset) => CommandResponse::with_offset(offset),
                    Err(e) => CommandResponse::err(e.to_string()),
                },
                None => CommandResponse::err("append request carries no record"),
            },
            Ok(Command::Unknown(tag)) => {
                tracing::debug!(tag, "ignoring command with unknown type tag");
                CommandResponse::ok()
            }
            Err(e) => CommandResponse::err(e.to_string()),
        }
    }

    fn persist_applied(&self, applied: &Applied) -> Result<(), RaftStorageError> {
        self.stable
            .set(APPLIED_KEY, &applied.last_applied)
            .map_err(|e| StorageIOError::write_state_machine(&e))?;
        self.stable
            .set(MEMBERSHIP_KEY, &applied.membership)
            .map_err(|e| StorageIOError::write_state_machine(&e))?;
        Ok(())
    }

    /// Replays a stream of length-prefixed records into the log. The first
    /// record's offset becomes the log's initial offset so the restored
    /// offsets match the leader's exactly.
    fn restore_from_frames(&self, data: &[u8]) -> ClusterResult<()> {
        let mut at = 0usize;
        let mut first = true;
        while at < data.len() {
            if at + 8 > data.len() {
                return Err(ClusterError::Serialization(
                    "truncated snapshot length prefix".to_string(),
                ));
            }
            let len = u64::from_be_bytes(
                data[at..at + 8].try_into().expect("length prefix is 8 bytes"),
            ) as usize;
            let end = at + 8 + len;
            if end > data.len() {
                return Err(ClusterError::Serialization(
                    "truncated snapshot frame".to_string(),
                ));
            }
            let mut record = Record::decode(&data[at + 8..end])?;
            if first {
                self.log.set_initial_offset(record.offset);
                self.log.reset()?;
                first = false;
            }
            self.log.append(&mut record)?;
            at = end;
        }
        Ok(())
    }
}

impl RaftSnapshotBuilder<TypeConfig> for Arc<StateMachine> {
    async fn build_snapshot(&mut self) -> Result<RaftSnapshot, RaftStorageError> {
        let applied = self.applied.read().await;
        let last_log_id = applied.last_applied;
        let last_membership = applied.membership.clone();

        let mut data = Vec::new();
        self.log
            .reader()
            .map_err(|e| StorageIOError::read_state_machine(&e))?
            .read_to_end(&mut data)
            .map_err(|e| StorageIOError::read_state_machine(&e))?;
        drop(applied);

        let snapshot_idx = self.snapshot_idx.fetch_add(1, Ordering::Relaxed) + 1;
        let snapshot_id = if let Some(last) = last_log_id {
            format!("{}-{}-{}", last.leader_id, last.index, snapshot_idx)
        } else {
            format!("--{snapshot_idx}")
        };

        let meta = RaftSnapshotMeta {
            last_log_id,
            last_membership,
            snapshot_id,
        };

        self.snapshots
            .save(&meta, &data)
            .map_err(|e| StorageIOError::write_snapshot(Some(meta.signature()), &e))?;

        Ok(RaftSnapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

impl RaftStateMachine<TypeConfig> for Arc<StateMachine> {
    type SnapshotBuilder = Self;

    async fn applied_state(
        &mut self,
    ) -> Result<(Option<RaftLogId>, RaftStoredMembership), RaftStorageError> {
        let applied = self.applied.read().await;
        Ok((applied.last_applied, applied.membership.clone()))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<CommandResponse>, RaftStorageError>
    where
        I: IntoIterator<Item = RaftEntry> + Send,
    {
        let mut responses = Vec::new();
        let mut applied = self.applied.write().await;

        for entry in entries {
            tracing::debug!(%entry.log_id, "applying entry");
            applied.last_applied = Some(entry.log_id);

            match entry.payload {
                EntryPayload::Blank => responses.push(CommandResponse::ok()),
                EntryPayload::Normal(frame) => responses.push(self.apply_command(&frame)),
                EntryPayload::Membership(membership) => {
                    applied.membership = StoredMembership::new(Some(entry.log_id), membership);
                    responses.push(CommandResponse::ok());
                }
            }
        }

        self.persist_applied(&applied)?;
        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        Arc::clone(self)
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<<TypeConfig as RaftTypeConfig>::SnapshotData>, RaftStorageError> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &RaftSnapshotMeta,
        snapshot: Box<<TypeConfig as RaftTypeConfig>::SnapshotData>,
    ) -> Result<(), RaftStorageError> {
        let data = snapshot.into_inner();
        tracing::info!(
            snapshot_id = %meta.snapshot_id,
            size = data.len(),
            "installing snapshot"
        );

        self.restore_from_frames(&data)
            .map_err(|e| StorageIOError::read_snapshot(Some(meta.signature()), &e))?;

        let mut applied = self.applied.write().await;
        applied.last_applied = meta.last_log_id;
        applied.membership = meta.last_membership.clone();
        self.persist_applied(&applied)?;
        drop(applied);

        self.snapshots
            .save(meta, &data)
            .map_err(|e| StorageIOError::write_snapshot(Some(meta.signature()), &e))?;
        Ok(())
    }

    async fn get_current_snapshot(&mut self) -> Result<Option<RaftSnapshot>, RaftStorageError> {
        match self
            .snapshots
            .load_latest()
            .map_err(|e| StorageIOError::read_snapshot(None, &e))?
        {
            Some((meta, data)) => Ok(Some(RaftSnapshot {
                meta,
                snapshot: Box::new(Cursor::new(data)),
            })),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loghouse_core::LogConfig;
    use openraft::CommittedLeaderId;
    use tempfile::TempDir;

    fn open_sm(dir: &TempDir, initial_offset: u64) -> Arc<StateMachine> {
        let config = LogConfig {
            segment: loghouse_core::SegmentConfig {
                initial_offset,
                ..Default::default()
            },
        };
        let log = Arc::new(Log::open(dir.path().join("log"), config).expect("open log"));
        let stable =
            Arc::new(StableStore::open(&dir.path().join("stable")).expect("open stable"));
        Arc::new(
            StateMachine::open(log, stable, &dir.path().join("snapshots"), 1).expect("open sm"),
        )
    }

    fn append_entry(term: u64, index: u64, value: &[u8]) -> RaftEntry {
        RaftEntry {
            log_id: RaftLogId::new(CommittedLeaderId::new(term, 0), index),
            payload: EntryPayload::Normal(
                Command::append(Record {
                    value: value.to_vec(),
                    ..Default::default()
                })
                .encode(),
            ),
        }
    }

    #[tokio::test]
    async fn test_apply_append_returns_offset() {
        let dir = TempDir::new().expect("create temp dir");
        let mut sm = open_sm(&dir, 0);

        let responses = sm
            .apply([append_entry(1, 1, b"foo"), append_entry(1, 2, b"bar")])
            .await
            .expect("apply");

        assert_eq!(responses[0].offset, Some(0));
        assert_eq!(responses[1].offset, Some(1));

        let (last_applied, _) = sm.applied_state().await.expect("applied state");
        assert_eq!(last_applied.map(|id| id.index), Some(2));

        assert_eq!(sm.log.read(0).expect("read").value, b"foo");
        assert_eq!(sm.log.read(1).expect("read").value, b"bar");
    }

    #[tokio::test]
    async fn test_unknown_command_is_noop() {
        let dir = TempDir::new().expect("create temp dir");
        let mut sm = open_sm(&dir, 0);

        let entry = RaftEntry {
            log_id: RaftLogId::new(CommittedLeaderId::new(1, 0), 1),
            payload: EntryPayload::Normal(vec![99, 1, 2, 3]),
        };
        let responses = sm.apply([entry]).await.expect("apply");
        assert!(responses[0].error.is_none());
        assert!(responses[0].offset.is_none());
    }

    #[tokio::test]
    async fn test_applied_state_survives_reopen() {
        let dir = TempDir::new().expect("create temp dir");
        {
            let mut sm = open_sm(&dir, 0);
            sm.apply([append_entry(1, 1, b"persisted")])
                .await
                .expect("apply");
        }

        let mut sm = open_sm(&dir, 0);
        let (last_applied, _) = sm.applied_state().await.expect("applied state");
        assert_eq!(last_applied.map(|id| id.index), Some(1));
    }

    #[tokio::test]
    async fn test_snapshot_restore_roundtrip() {
        let source_dir = TempDir::new().expect("create temp dir");
        let mut source = open_sm(&source_dir, 0);
        for (i, value) in [b"a", b"b", b"c"].iter().enumerate() {
            source
                .apply([append_entry(1, i as u64 + 1, *value)])
                .await
                .expect("apply");
        }

        let snapshot = source.build_snapshot().await.expect("build snapshot");
        let meta = snapshot.meta.clone();
        let data = snapshot.snapshot;

        // A fresh node with unrelated local state installs the snapshot and
        // converges to the source's log exactly.
        let target_dir = TempDir::new().expect("create temp dir");
        let mut target = open_sm(&target_dir, 0);
        target
            .apply([append_entry(9, 1, b"local junk")])
            .await
            .expect("apply");

        target
            .install_snapshot(&meta, data)
            .await
            .expect("install snapshot");

        assert_eq!(target.log.lowest_offset(), 0);
        assert_eq!(target.log.highest_offset(), 2);
        for (i, value) in [b"a", b"b", b"c"].iter().enumerate() {
            assert_eq!(target.log.read(i as u64).expect("read").value, *value);
        }

        let (last_applied, _) = target.applied_state().await.expect("applied state");
        assert_eq!(last_applied, meta.last_log_id);
    }
}
