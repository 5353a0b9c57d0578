//! The log: an ordered collection of segments with a single active tail.

use std::fs::{self, File};
use std::io::Read;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use loghouse_proto::v1::Record;
use parking_lot::RwLock;

use crate::config::LogConfig;
use crate::error::{LogError, Result};
use crate::segment::Segment;

struct LogInner {
    config: LogConfig,
    segments: Vec<Segment>,
}

/// Append-only record log over segmented files.
///
/// One writer at a time, readers concurrent. Offsets are dense and monotonic:
/// segment `k + 1` begins exactly where segment `k` ends.
pub struct Log {
    dir: PathBuf,
    inner: RwLock<LogInner>,
}

impl Log {
    /// Opens a log in `dir`, reloading any segments already on disk. When the
    /// directory holds no segments, one is created at the configured initial
    /// offset.
    pub fn open(dir: impl Into<PathBuf>, mut config: LogConfig) -> Result<Self> {
        if config.segment.max_store_bytes == 0 {
            config.segment.max_store_bytes = 1024;
        }
        if config.segment.max_index_bytes == 0 {
            config.segment.max_index_bytes = 1024;
        }
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let segments = Self::setup(&dir, &config)?;
        Ok(Self {
            dir,
            inner: RwLock::new(LogInner { config, segments }),
        })
    }

    /// Scans the directory for segment files, dedupes the base offsets that
    /// both extensions produce, and reopens segments in ascending order. The
    /// last one becomes the active tail.
    fn setup(dir: &Path, config: &LogConfig) -> Result<Vec<Segment>> {
        let mut base_offsets = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let is_segment_file = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("store") | Some("index")
            );
            if !is_segment_file {
                continue;
            }
            if let Some(base) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            {
                base_offsets.push(base);
            }
        }
        base_offsets.sort_unstable();
        base_offsets.dedup();

        let mut segments = Vec::with_capacity(base_offsets.len().max(1));
        for base in base_offsets {
            segments.push(Segment::open(dir, base, config.segment.clone())?);
        }
        if segments.is_empty() {
            segments.push(Segment::open(
                dir,
                config.segment.initial_offset,
                config.segment.clone(),
            )?);
        }
        Ok(segments)
    }

    /// Appends a record to the active segment and returns its offset. When
    /// the active segment maxes out, a fresh one is rolled at the next
    /// offset; the maxed-check and rollover happen under the same write lock
    /// as the append that triggered them.
    pub fn append(&self, record: &mut Record) -> Result<u64> {
        let mut inner = self.inner.write();
        let offset = inner
            .segments
            .last_mut()
            .expect("log always has an active segment")
            .append(record)?;
        let maxed = inner
            .segments
            .last()
            .expect("log always has an active segment")
            .is_maxed();
        if maxed {
            let config = inner.config.segment.clone();
            let segment = Segment::open(&self.dir, offset + 1, config)?;
            tracing::debug!(base_offset = offset + 1, "rolled over to a new segment");
            inner.segments.push(segment);
        }
        Ok(offset)
    }

    /// Reads the record at `offset`. Offsets past the highest (or before the
    /// lowest) deterministically fail with [`LogError::OffsetOutOfRange`].
    pub fn read(&self, offset: u64) -> Result<Record> {
        let inner = self.inner.read();
        let idx = inner
            .segments
            .partition_point(|s| s.base_offset <= offset);
        if idx == 0 {
            return Err(LogError::OffsetOutOfRange(offset));
        }
        let segment = &inner.segments[idx - 1];
        if offset >= segment.next_offset {
            return Err(LogError::OffsetOutOfRange(offset));
        }
        segment.read(offset)
    }

    /// The first segment's base offset.
    pub fn lowest_offset(&self) -> u64 {
        let inner = self.inner.read();
        inner
            .segments
            .first()
            .expect("log always has an active segment")
            .base_offset
    }

    /// The active segment's next offset minus one, or zero when the log has
    /// never held a record.
    pub fn highest_offset(&self) -> u64 {
        let inner = self.inner.read();
        inner
            .segments
            .last()
            .expect("log always has an active segment")
            .next_offset
            .saturating_sub(1)
    }

    /// Removes every segment whose records all fall at or below `lowest`.
    /// Used to discard data that has been snapshotted.
    pub fn truncate(&self, lowest: u64) -> Result<()> {
        let mut inner = self.inner.write();
        let segments = std::mem::take(&mut inner.segments);
        let mut kept = Vec::with_capacity(segments.len());
        for segment in segments {
            if segment.next_offset <= lowest + 1 {
                segment.remove()?;
            } else {
                kept.push(segment);
            }
        }
        if kept.is_empty() {
            // The log keeps exactly one active tail; appends continue right
            // past the cut.
            kept.push(Segment::open(
                &self.dir,
                lowest + 1,
                inner.config.segment.clone(),
            )?);
        }
        tracing::debug!(lowest, segments = kept.len(), "truncated log");
        inner.segments = kept;
        Ok(())
    }

    /// Removes every record at or above `offset`, so the next append is
    /// assigned `offset`. Whole segments above the cut are deleted; the
    /// segment containing it is rebuilt from its retained prefix.
    pub fn truncate_after(&self, offset: u64) -> Result<()> {
        let mut inner = self.inner.write();
        let config = inner.config.segment.clone();
        let segments = std::mem::take(&mut inner.segments);
        let mut kept = Vec::with_capacity(segments.len());
        for segment in segments {
            if segment.base_offset >= offset {
                segment.remove()?;
            } else if segment.next_offset > offset {
                let mut retained = Vec::with_capacity((offset - segment.base_offset) as usize);
                for off in segment.base_offset..offset {
                    retained.push(segment.read(off)?);
                }
                let base = segment.base_offset;
                segment.remove()?;
                let mut rebuilt = Segment::open(&self.dir, base, config.clone())?;
                for mut record in retained {
                    rebuilt.append(&mut record)?;
                }
                kept.push(rebuilt);
            } else {
                kept.push(segment);
            }
        }
        if kept.is_empty() {
            kept.push(Segment::open(&self.dir, offset, config)?);
        }
        inner.segments = kept;
        Ok(())
    }

    /// Removes all segments and the directory, then runs setup again with
    /// the current configuration. Snapshot restore re-points the initial
    /// offset first via [`Log::set_initial_offset`].
    pub fn reset(&self) -> Result<()> {
        let mut inner = self.inner.write();
        for segment in std::mem::take(&mut inner.segments) {
            segment.remove()?;
        }
        fs::remove_dir_all(&self.dir)?;
        fs::create_dir_all(&self.dir)?;
        inner.segments = Self::setup(&self.dir, &inner.config)?;
        Ok(())
    }

    /// Re-points the offset the next [`Log::reset`] starts from.
    pub fn set_initial_offset(&self, offset: u64) {
        self.inner.write().config.segment.initial_offset = offset;
    }

    /// Returns a reader over the whole log: every segment's store from byte
    /// zero to its end, concatenated in order. The reader holds duplicated
    /// file handles, so it does not pin the log's lock while streaming.
    pub fn reader(&self) -> Result<LogReader> {
        let inner = self.inner.read();
        let mut files = Vec::with_capacity(inner.segments.len());
        for segment in &inner.segments {
            files.push(segment.reader_handle()?);
        }
        Ok(LogReader {
            files,
            current: 0,
            pos: 0,
        })
    }

    /// Flushes every segment and truncates the indexes to their used bytes.
    pub fn close(&self) -> Result<()> {
        let inner = self.inner.read();
        for segment in &inner.segments {
            segment.close()?;
        }
        Ok(())
    }

    #[cfg(test)]
    fn segment_bounds(&self) -> Vec<(u64, u64)> {
        self.inner
            .read()
            .segments
            .iter()
            .map(|s| (s.base_offset, s.next_offset))
            .collect()
    }
}

/// Sequential reader over the concatenated segment stores.
pub struct LogReader {
    files: Vec<File>,
    current: usize,
    pos: u64,
}

impl Read for LogReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        while self.current < self.files.len() {
            let n = self.files[self.current].read_at(buf, self.pos)?;
            if n > 0 {
                self.pos += n as u64;
                return Ok(n);
            }
            self.current += 1;
            self.pos = 0;
        }
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SegmentConfig;
    use tempfile::TempDir;

    fn record(value: &[u8]) -> Record {
        Record {
            value: value.to_vec(),
            ..Default::default()
        }
    }

    fn small_segments() -> LogConfig {
        LogConfig {
            segment: SegmentConfig {
                max_store_bytes: 32,
                max_index_bytes: 1024,
                initial_offset: 0,
            },
        }
    }

    #[test]
    fn test_append_read() {
        let dir = TempDir::new().expect("create temp dir");
        let log = Log::open(dir.path(), LogConfig::default()).expect("open log");

        for (i, value) in [b"a", b"b", b"c"].iter().enumerate() {
            let off = log.append(&mut record(*value)).expect("append");
            assert_eq!(off, i as u64);
        }

        assert_eq!(log.read(0).expect("read").value, b"a");
        assert_eq!(log.read(1).expect("read").value, b"b");
        assert_eq!(log.read(2).expect("read").value, b"c");
        assert!(matches!(log.read(3), Err(LogError::OffsetOutOfRange(3))));

        assert_eq!(log.lowest_offset(), 0);
        assert_eq!(log.highest_offset(), 2);
    }

    #[test]
    fn test_rollover_creates_new_segment() {
        let dir = TempDir::new().expect("create temp dir");
        let log = Log::open(dir.path(), small_segments()).expect("open log");

        // One 32-byte value maxes a 32-byte store by itself.
        log.append(&mut record(&[b'x'; 32])).expect("append");
        log.append(&mut record(&[b'y'; 32])).expect("append");

        let bounds = log.segment_bounds();
        assert!(bounds.len() >= 2, "expected a rollover, got {bounds:?}");
        assert_eq!(bounds[1].0, 1);

        assert_eq!(log.read(0).expect("read").value, vec![b'x'; 32]);
        assert_eq!(log.read(1).expect("read").value, vec![b'y'; 32]);
    }

    #[test]
    fn test_reload_is_idempotent() {
        let dir = TempDir::new().expect("create temp dir");
        let bounds = {
            let log = Log::open(dir.path(), small_segments()).expect("open log");
            for i in 0..8u64 {
                log.append(&mut record(format!("record-{i}").as_bytes()))
                    .expect("append");
            }
            log.close().expect("close");
            log.segment_bounds()
        };

        let log = Log::open(dir.path(), small_segments()).expect("reopen log");
        assert_eq!(log.segment_bounds(), bounds);
        assert_eq!(log.lowest_offset(), 0);
        assert_eq!(log.highest_offset(), 7);
        for i in 0..8u64 {
            assert_eq!(
                log.read(i).expect("read").value,
                format!("record-{i}").into_bytes()
            );
        }
    }

    #[test]
    fn test_truncate_drops_old_segments() {
        let dir = TempDir::new().expect("create temp dir");
        let log = Log::open(dir.path(), small_segments()).expect("open log");
        for _ in 0..3 {
            log.append(&mut record(&[b'z'; 32])).expect("append");
        }

        log.truncate(1).expect("truncate");

        assert!(matches!(log.read(0), Err(LogError::OffsetOutOfRange(0))));
        assert!(matches!(log.read(1), Err(LogError::OffsetOutOfRange(1))));
        assert_eq!(log.read(2).expect("read").value, vec![b'z'; 32]);
    }

    #[test]
    fn test_truncate_everything_keeps_appendable_tail() {
        let dir = TempDir::new().expect("create temp dir");
        let log = Log::open(dir.path(), small_segments()).expect("open log");
        for _ in 0..3 {
            log.append(&mut record(&[b'z'; 32])).expect("append");
        }

        log.truncate(2).expect("truncate all");
        let off = log.append(&mut record(b"after")).expect("append");
        assert_eq!(off, 3);
        assert_eq!(log.read(3).expect("read").value, b"after");
    }

    #[test]
    fn test_truncate_after_rebuilds_boundary_segment() {
        let dir = TempDir::new().expect("create temp dir");
        let log = Log::open(dir.path(), LogConfig::default()).expect("open log");
        for i in 0..6u64 {
            log.append(&mut record(format!("v{i}").as_bytes()))
                .expect("append");
        }

        log.truncate_after(3).expect("truncate after");

        assert_eq!(log.highest_offset(), 2);
        assert_eq!(log.read(2).expect("read").value, b"v2");
        assert!(matches!(log.read(3), Err(LogError::OffsetOutOfRange(3))));

        // The next append reuses the truncated offset.
        let off = log.append(&mut record(b"replacement")).expect("append");
        assert_eq!(off, 3);
        assert_eq!(log.read(3).expect("read").value, b"replacement");
    }

    #[test]
    fn test_reset_honors_new_initial_offset() {
        let dir = TempDir::new().expect("create temp dir");
        let log = Log::open(dir.path(), LogConfig::default()).expect("open log");
        log.append(&mut record(b"old")).expect("append");

        log.set_initial_offset(40);
        log.reset().expect("reset");

        let off = log.append(&mut record(b"new")).expect("append");
        assert_eq!(off, 40);
        assert_eq!(log.lowest_offset(), 40);
        assert!(matches!(log.read(0), Err(LogError::OffsetOutOfRange(0))));
    }

    #[test]
    fn test_reader_streams_all_frames() {
        let dir = TempDir::new().expect("create temp dir");
        let log = Log::open(dir.path(), small_segments()).expect("open log");
        let mut expected = 0u64;
        for _ in 0..3 {
            log.append(&mut record(&[b'r'; 32])).expect("append");
            expected += 1;
        }

        let mut buf = Vec::new();
        log.reader()
            .expect("reader")
            .read_to_end(&mut buf)
            .expect("read_to_end");

        // Walk the length-prefixed frames back out.
        let mut frames = 0u64;
        let mut at = 0usize;
        while at < buf.len() {
            let len = u64::from_be_bytes(buf[at..at + 8].try_into().expect("length prefix"));
            at += 8 + len as usize;
            frames += 1;
        }
        assert_eq!(at, buf.len());
        assert_eq!(frames, expected);
    }

    #[test]
    fn test_initial_offset_one() {
        let dir = TempDir::new().expect("create temp dir");
        let config = LogConfig {
            segment: SegmentConfig {
                initial_offset: 1,
                ..Default::default()
            },
        };
        let log = Log::open(dir.path(), config).expect("open log");

        assert_eq!(log.lowest_offset(), 1);
        assert_eq!(log.highest_offset(), 0);

        let off = log.append(&mut record(b"first")).expect("append");
        assert_eq!(off, 1);
        assert_eq!(log.highest_offset(), 1);
    }
}
