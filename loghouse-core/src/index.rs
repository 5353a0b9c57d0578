//! The index file: fixed-stride entries mapping a record's offset relative to
//! the segment base to its byte position in the store.
//!
//! The file is preallocated to its configured cap and memory-mapped so the
//! mapping never has to grow; the logical `size` tracks used bytes and the
//! file is truncated back down to it on close. Relative `u32` offsets keep
//! entries small; `u64` positions address store bytes directly.

use std::fs::{File, OpenOptions};
use std::path::Path;

use memmap2::MmapMut;
use parking_lot::Mutex;

use crate::error::{LogError, Result};

const OFF_WIDTH: u64 = 4;
const POS_WIDTH: u64 = 8;
/// Stride of one index entry.
pub(crate) const ENT_WIDTH: u64 = OFF_WIDTH + POS_WIDTH;

struct IndexInner {
    file: File,
    mmap: MmapMut,
    size: u64,
}

/// Memory-mapped offset index for one segment.
pub(crate) struct Index {
    inner: Mutex<IndexInner>,
}

impl Index {
    /// Opens (or creates) the index file, remembers how many bytes were in
    /// use, then grows the file to `max_index_bytes` and maps it.
    pub(crate) fn open(path: &Path, max_index_bytes: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let size = file.metadata()?.len();
        file.set_len(max_index_bytes)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            inner: Mutex::new(IndexInner { file, mmap, size }),
        })
    }

    /// Appends an entry. Fails with [`LogError::IndexFull`] when the mapped
    /// region has no room for another stride.
    pub(crate) fn write(&self, rel_offset: u32, pos: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.size + ENT_WIDTH > inner.mmap.len() as u64 {
            return Err(LogError::IndexFull);
        }
        let at = inner.size as usize;
        inner.mmap[at..at + OFF_WIDTH as usize].copy_from_slice(&rel_offset.to_be_bytes());
        inner.mmap[at + OFF_WIDTH as usize..at + ENT_WIDTH as usize]
            .copy_from_slice(&pos.to_be_bytes());
        inner.size += ENT_WIDTH;
        Ok(())
    }

    /// Reads the entry at `at`, where `-1` addresses the last entry. Fails
    /// with [`LogError::EndOfIndex`] on an empty index or past used entries.
    pub(crate) fn read(&self, at: i64) -> Result<(u32, u64)> {
        let inner = self.inner.lock();
        let entries = inner.size / ENT_WIDTH;
        if entries == 0 {
            return Err(LogError::EndOfIndex);
        }
        let i = if at == -1 { entries - 1 } else { at as u64 };
        if i >= entries {
            return Err(LogError::EndOfIndex);
        }
        let start = (i * ENT_WIDTH) as usize;
        let rel = u32::from_be_bytes(
            inner.mmap[start..start + OFF_WIDTH as usize]
                .try_into()
                .expect("stride is fixed"),
        );
        let pos = u64::from_be_bytes(
            inner.mmap[start + OFF_WIDTH as usize..start + ENT_WIDTH as usize]
                .try_into()
                .expect("stride is fixed"),
        );
        Ok((rel, pos))
    }

    /// Logical bytes in use.
    pub(crate) fn size(&self) -> u64 {
        self.inner.lock().size
    }

    /// Syncs the mapping and truncates the file back to its used bytes so a
    /// reload infers the correct entry count.
    pub(crate) fn close(&self) -> Result<()> {
        let inner = self.inner.lock();
        inner.mmap.flush()?;
        inner.file.set_len(inner.size)?;
        inner.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_read() {
        let dir = TempDir::new().expect("create temp dir");
        let index = Index::open(&dir.path().join("0.index"), 1024).expect("open index");

        assert!(matches!(index.read(-1), Err(LogError::EndOfIndex)));

        index.write(0, 0).expect("write");
        index.write(1, 27).expect("write");

        assert_eq!(index.read(0).expect("read"), (0, 0));
        assert_eq!(index.read(1).expect("read"), (1, 27));
        assert_eq!(index.read(-1).expect("read last"), (1, 27));
        assert!(matches!(index.read(2), Err(LogError::EndOfIndex)));
    }

    #[test]
    fn test_full_index_rejects_writes() {
        let dir = TempDir::new().expect("create temp dir");
        let index = Index::open(&dir.path().join("0.index"), 2 * ENT_WIDTH).expect("open index");

        index.write(0, 0).expect("write");
        index.write(1, 10).expect("write");
        assert!(matches!(index.write(2, 20), Err(LogError::IndexFull)));
    }

    #[test]
    fn test_close_truncates_for_reload() {
        let dir = TempDir::new().expect("create temp dir");
        let path = dir.path().join("0.index");

        {
            let index = Index::open(&path, 1024).expect("open index");
            index.write(0, 0).expect("write");
            index.write(1, 19).expect("write");
            index.close().expect("close");
        }

        assert_eq!(
            std::fs::metadata(&path).expect("stat").len(),
            2 * ENT_WIDTH
        );

        let index = Index::open(&path, 1024).expect("reopen index");
        assert_eq!(index.read(-1).expect("read last"), (1, 19));
        assert_eq!(index.size(), 2 * ENT_WIDTH);
    }
}
