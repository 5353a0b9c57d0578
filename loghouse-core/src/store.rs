//! The store file: an append-only sequence of length-prefixed record frames.
//!
//! Physical layout is `(length: u64 big-endian, payload)` repeated. Writes go
//! through a buffered writer to cut down on syscalls, which means every read
//! must flush first.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::os::unix::fs::FileExt;
use std::path::Path;

use parking_lot::Mutex;

use crate::error::Result;

/// Width of the length prefix on every frame.
pub(crate) const LEN_WIDTH: u64 = 8;

struct StoreInner {
    writer: BufWriter<File>,
    size: u64,
}

/// Byte-addressed append-only file.
pub(crate) struct Store {
    file: File,
    inner: Mutex<StoreInner>,
}

impl Store {
    /// Opens (or creates) the store file, picking up the existing size when
    /// reloading a segment from disk.
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .create(true)
            .append(true)
            .open(path)?;
        let size = file.metadata()?.len();
        let writer = BufWriter::new(file.try_clone()?);
        Ok(Self {
            file,
            inner: Mutex::new(StoreInner { writer, size }),
        })
    }

    /// Appends a frame and returns `(bytes_written, position)` where the
    /// position is the byte at which the frame's length prefix begins.
    pub(crate) fn append(&self, payload: &[u8]) -> Result<(u64, u64)> {
        let mut inner = self.inner.lock();
        let pos = inner.size;
        inner.writer.write_all(&(payload.len() as u64).to_be_bytes())?;
        inner.writer.write_all(payload)?;
        let written = LEN_WIDTH + payload.len() as u64;
        inner.size += written;
        Ok((written, pos))
    }

    /// Reads the frame whose length prefix starts at `pos`.
    pub(crate) fn read(&self, pos: u64) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock();
        inner.writer.flush()?;
        let mut len = [0u8; LEN_WIDTH as usize];
        self.file.read_exact_at(&mut len, pos)?;
        let mut payload = vec![0u8; u64::from_be_bytes(len) as usize];
        self.file.read_exact_at(&mut payload, pos + LEN_WIDTH)?;
        Ok(payload)
    }

    /// Random-access read of raw store bytes. Returns the number of bytes
    /// read; zero signals end of file.
    pub(crate) fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut inner = self.inner.lock();
        inner.writer.flush()?;
        Ok(self.file.read_at(buf, offset)?)
    }

    /// Logical size: on-disk length once buffered writes are flushed.
    pub(crate) fn size(&self) -> u64 {
        self.inner.lock().size
    }

    /// Flushes buffered writes to the file.
    pub(crate) fn flush(&self) -> Result<()> {
        self.inner.lock().writer.flush()?;
        Ok(())
    }

    /// Duplicates the underlying file handle, flushing first so the clone
    /// observes every appended frame. Used to stream the store for snapshots.
    pub(crate) fn reader_handle(&self) -> Result<File> {
        self.flush()?;
        Ok(self.file.try_clone()?)
    }
}
