//! A segment: one store and one index sharing a base offset.

use std::fs;
use std::path::{Path, PathBuf};

use loghouse_proto::v1::Record;
use prost::Message;

use crate::config::SegmentConfig;
use crate::error::{LogError, Result};
use crate::index::Index;
use crate::store::Store;

/// Paired store and index files named `<base>.store` / `<base>.index`.
pub(crate) struct Segment {
    store: Store,
    index: Index,
    store_path: PathBuf,
    index_path: PathBuf,
    config: SegmentConfig,
    pub(crate) base_offset: u64,
    pub(crate) next_offset: u64,
}

impl Segment {
    /// Opens (or creates) the segment's files and infers the next offset from
    /// the last index entry: an empty index means the next record is the
    /// segment's first.
    pub(crate) fn open(dir: &Path, base_offset: u64, config: SegmentConfig) -> Result<Self> {
        let store_path = dir.join(format!("{base_offset}.store"));
        let index_path = dir.join(format!("{base_offset}.index"));
        let store = Store::open(&store_path)?;
        let index = Index::open(&index_path, config.max_index_bytes)?;
        let next_offset = match index.read(-1) {
            Ok((rel, _)) => base_offset + u64::from(rel) + 1,
            Err(LogError::EndOfIndex) => base_offset,
            Err(e) => return Err(e),
        };
        Ok(Self {
            store,
            index,
            store_path,
            index_path,
            config,
            base_offset,
            next_offset,
        })
    }

    /// Appends a record, assigning it the segment's next offset. The data
    /// goes to the store first, then the index entry pointing at it.
    pub(crate) fn append(&mut self, record: &mut Record) -> Result<u64> {
        let offset = self.next_offset;
        record.offset = offset;
        let frame = record.encode_to_vec();
        let (_, pos) = self.store.append(&frame)?;
        self.index.write((offset - self.base_offset) as u32, pos)?;
        self.next_offset += 1;
        Ok(offset)
    }

    /// Reads the record at an absolute offset within this segment.
    pub(crate) fn read(&self, offset: u64) -> Result<Record> {
        let (_, pos) = self.index.read((offset - self.base_offset) as i64)?;
        let frame = self.store.read(pos)?;
        Ok(Record::decode(frame.as_slice())?)
    }

    /// Whether either file has reached its cap. A maxed segment is immutable;
    /// the log rolls to a new one.
    pub(crate) fn is_maxed(&self) -> bool {
        self.store.size() >= self.config.max_store_bytes
            || self.index.size() >= self.config.max_index_bytes
    }

    pub(crate) fn reader_handle(&self) -> Result<std::fs::File> {
        self.store.reader_handle()
    }

    /// Flushes the store and truncates the index down to its used bytes.
    pub(crate) fn close(&self) -> Result<()> {
        self.index.close()?;
        self.store.flush()?;
        Ok(())
    }

    /// Closes the segment and deletes both files.
    pub(crate) fn remove(self) -> Result<()> {
        self.close()?;
        fs::remove_file(&self.index_path)?;
        fs::remove_file(&self.store_path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(value: &[u8]) -> Record {
        Record {
            value: value.to_vec(),
            ..Default::default()
        }
    }

    fn config(max_store_bytes: u64, max_index_bytes: u64) -> SegmentConfig {
        SegmentConfig {
            max_store_bytes,
            max_index_bytes,
            initial_offset: 0,
        }
    }

    #[test]
    fn test_append_read() {
        let dir = TempDir::new().expect("create temp dir");
        let mut segment = Segment::open(dir.path(), 16, config(1024, 1024)).expect("open");
        assert_eq!(segment.next_offset, 16);

        for i in 0..3u64 {
            let mut rec = record(b"hello");
            let off = segment.append(&mut rec).expect("append");
            assert_eq!(off, 16 + i);
        }
        assert_eq!(segment.next_offset, 19);

        let rec = segment.read(17).expect("read");
        assert_eq!(rec.value, b"hello");
        assert_eq!(rec.offset, 17);
    }

    #[test]
    fn test_maxed_by_index() {
        let dir = TempDir::new().expect("create temp dir");
        // Room for exactly three index entries.
        let mut segment = Segment::open(dir.path(), 0, config(1024, 36)).expect("open");

        for _ in 0..3 {
            assert!(!segment.is_maxed());
            segment.append(&mut record(b"x")).expect("append");
        }
        assert!(segment.is_maxed());
        assert!(matches!(
            segment.append(&mut record(b"x")),
            Err(LogError::IndexFull)
        ));
    }

    #[test]
    fn test_maxed_by_store() {
        let dir = TempDir::new().expect("create temp dir");
        let mut segment = Segment::open(dir.path(), 0, config(32, 1024)).expect("open");

        segment
            .append(&mut record(&[b'a'; 32]))
            .expect("append");
        assert!(segment.is_maxed());
    }

    #[test]
    fn test_reload_infers_next_offset() {
        let dir = TempDir::new().expect("create temp dir");
        {
            let mut segment = Segment::open(dir.path(), 5, config(1024, 1024)).expect("open");
            segment.append(&mut record(b"one")).expect("append");
            segment.append(&mut record(b"two")).expect("append");
            segment.close().expect("close");
        }

        let segment = Segment::open(dir.path(), 5, config(1024, 1024)).expect("reopen");
        assert_eq!(segment.next_offset, 7);
        assert_eq!(segment.read(6).expect("read").value, b"two");
    }

    #[test]
    fn test_remove_deletes_files() {
        let dir = TempDir::new().expect("create temp dir");
        let mut segment = Segment::open(dir.path(), 0, config(1024, 1024)).expect("open");
        segment.append(&mut record(b"gone")).expect("append");
        segment.remove().expect("remove");

        assert!(!dir.path().join("0.store").exists());
        assert!(!dir.path().join("0.index").exists());
    }
}
