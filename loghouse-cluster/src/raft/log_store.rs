//! Consensus log storage backed by the segmented log engine.
//!
//! The engine stores its own proposal log, not only client records. Entries
//! live in a second `loghouse-core` log whose initial offset is 1 (consensus
//! indices are 1-based), so the segment offset a record is assigned IS its
//! consensus index. Each entry is stored as a record whose value is the
//! serialized entry, with the entry's term and payload kind mirrored into
//! the record's `term` and `type` fields.

use std::fmt::Debug;
use std::io;
use std::ops::{Bound, RangeBounds};
use std::path::Path;
use std::sync::Arc;

use loghouse_core::{Log, LogConfig};
use loghouse_proto::v1::Record;
use openraft::storage::{LogFlushed, RaftLogStorage};
use openraft::{EntryPayload, LogState, RaftLogReader, StorageIOError};

use crate::error::ClusterResult;
use crate::raft::stable::{COMMITTED_KEY, LAST_PURGED_KEY, VOTE_KEY};
use crate::raft::StableStore;
use crate::types::{RaftEntry, RaftLogId, RaftStorageError, RaftVote, TypeConfig};

/// Persistent storage for consensus log entries and metadata.
///
/// Entries go to a segmented log under `<data_dir>/raft/log`; the vote, the
/// committed log id, and the last purged log id go to the shared stable
/// store.
#[derive(Clone)]
pub struct LogStore {
    log: Arc<Log>,
    stable: Arc<StableStore>,
}

impl LogStore {
    /// Opens the consensus log in `dir`. The configured initial offset is
    /// forced to 1 regardless of what the record log uses.
    pub fn open(dir: &Path, stable: Arc<StableStore>, mut config: LogConfig) -> ClusterResult<Self> {
        config.segment.initial_offset = 1;
        let log = Arc::new(Log::open(dir, config)?);
        Ok(Self { log, stable })
    }

    /// True when the log holds no entries. With initial offset 1 an empty
    /// log reports a highest offset below its lowest.
    fn is_empty(&self) -> bool {
        self.log.highest_offset() < self.log.lowest_offset()
    }

    /// Appends entries in index order. The segment assigns each record an
    /// offset which must equal the entry's index.
    fn append_sync(&self, entries: impl IntoIterator<Item = RaftEntry>) -> Result<(), RaftStorageError> {
        for entry in entries {
            let mut record = encode_entry(&entry)?;
            let offset = self
                .log
                .append(&mut record)
                .map_err(|e| StorageIOError::write_logs(&e))?;
            if offset != entry.log_id.index {
                let e = io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "entry index {} landed at offset {offset}",
                        entry.log_id.index
                    ),
                );
                return Err(StorageIOError::write_logs(&e).into());
            }
        }
        Ok(())
    }

    fn read_entry(&self, index: u64) -> Result<RaftEntry, RaftStorageError> {
        let record = self
            .log
            .read(index)
            .map_err(|e| StorageIOError::read_logs(&e))?;
        decode_entry(&record)
    }

    /// Flushes segments and truncates index files so a reload infers the
    /// correct entry counts.
    pub fn close(&self) -> ClusterResult<()> {
        self.log.close()?;
        Ok(())
    }
}

fn encode_entry(entry: &RaftEntry) -> Result<Record, RaftStorageError> {
    let value = serde_json::to_vec(entry).map_err(|e| StorageIOError::write_logs(&e))?;
    Ok(Record {
        value,
        offset: 0,
        term: entry.log_id.leader_id.term,
        r#type: payload_kind(entry),
    })
}

fn decode_entry(record: &Record) -> Result<RaftEntry, RaftStorageError> {
    serde_json::from_slice(&record.value).map_err(|e| StorageIOError::read_logs(&e).into())
}

fn payload_kind(entry: &RaftEntry) -> u32 {
    match entry.payload {
        EntryPayload::Normal(_) => 0,
        EntryPayload::Blank => 1,
        EntryPayload::Membership(_) => 2,
    }
}

impl RaftLogReader<TypeConfig> for LogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug>(
        &mut self,
        range: RB,
    ) -> Result<Vec<RaftEntry>, RaftStorageError> {
        if self.is_empty() {
            return Ok(Vec::new());
        }
        let lowest = self.log.lowest_offset();
        let highest = self.log.highest_offset();
        let start = match range.start_bound() {
            Bound::Included(&n) => n,
            Bound::Excluded(&n) => n + 1,
            Bound::Unbounded => lowest,
        }
        .max(lowest);
        let end = match range.end_bound() {
            Bound::Included(&n) => n + 1,
            Bound::Excluded(&n) => n,
            Bound::Unbounded => highest + 1,
        }
        .min(highest + 1);

        let mut entries = Vec::with_capacity(end.saturating_sub(start) as usize);
        for index in start..end {
            entries.push(self.read_entry(index)?);
        }
        Ok(entries)
    }
}

impl RaftLogStorage<TypeConfig> for LogStore {
    type LogReader = Self;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, RaftStorageError> {
        let last_purged_log_id: Option<RaftLogId> = self
            .stable
            .get(LAST_PURGED_KEY)
            .map_err(|e| StorageIOError::read_logs(&e))?;
        let last_log_id = if self.is_empty() {
            last_purged_log_id
        } else {
            Some(self.read_entry(self.log.highest_offset())?.log_id)
        };
        Ok(LogState {
            last_purged_log_id,
            last_log_id,
        })
    }

    async fn save_committed(&mut self, committed: Option<RaftLogId>) -> Result<(), RaftStorageError> {
        self.stable
            .set(COMMITTED_KEY, &committed)
            .map_err(|e| StorageIOError::write_logs(&e))?;
        Ok(())
    }

    async fn read_committed(&mut self) -> Result<Option<RaftLogId>, RaftStorageError> {
        self.stable
            .get(COMMITTED_KEY)
            .map_err(|e| StorageIOError::read_logs(&e).into())
    }

    async fn save_vote(&mut self, vote: &RaftVote) -> Result<(), RaftStorageError> {
        self.stable
            .set(VOTE_KEY, vote)
            .map_err(|e| StorageIOError::write_vote(&e))?;
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<RaftVote>, RaftStorageError> {
        self.stable
            .get(VOTE_KEY)
            .map_err(|e| StorageIOError::read_vote(&e).into())
    }

    async fn append<I>(&mut self, entries: I, callback: LogFlushed<TypeConfig>) -> Result<(), RaftStorageError>
    where
        I: IntoIterator<Item = RaftEntry>,
    {
        self.append_sync(entries)?;
        callback.log_io_completed(Ok(()));
        Ok(())
    }

    async fn truncate(&mut self, log_id: RaftLogId) -> Result<(), RaftStorageError> {
        // Conflict resolution deletes the suffix starting at log_id.
        self.log
            .truncate_after(log_id.index)
            .map_err(|e| StorageIOError::write_logs(&e))?;
        Ok(())
    }

    async fn purge(&mut self, log_id: RaftLogId) -> Result<(), RaftStorageError> {
        // Snapshot compaction discards everything up to and including
        // log_id. Record the high-water mark first so log state stays
        // correct if the truncate is interrupted.
        self.stable
            .set(LAST_PURGED_KEY, &log_id)
            .map_err(|e| StorageIOError::write_logs(&e))?;
        self.log
            .truncate(log_id.index)
            .map_err(|e| StorageIOError::write_logs(&e))?;
        Ok(())
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }
}
