//! # Bucket - one flush-worth of pending keys
//!
//! A bucket pairs a fixed-capacity in-memory array of 64-bit hashes with an
//! append-only **side file** holding the serialized keys in arrival order.
//! Slot `i` of the hash array always corresponds to the `i`-th key in the
//! side file.
//!
//! ## Lifecycle
//!
//! ```text
//! append()* ──► prepare() ──► (consume_key() | skip_key())* ──► finish_read() ──► clear()
//!    ▲                                                                              │
//!    └──────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The side file is read back strictly forward. There is no random access by
//! index: the flush walks it once, in arrival order, consuming the keys that
//! turned out to be new and skipping the rest.

use anyhow::{anyhow, ensure, Context, Result};
use codec::{CodecError, Serializer};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Accumulates `(hash, key)` pairs until the next flush.
pub struct Bucket<K> {
    /// Hashes in arrival order; `hashes.len()` is the item count.
    hashes: Vec<u64>,
    capacity: usize,
    aux_path: PathBuf,
    buffer_size: usize,
    serializer: Arc<dyn Serializer<K>>,
    /// Present while accumulating.
    writer: Option<BufWriter<File>>,
    /// Present between `prepare()` and `clear()`.
    reader: Option<BufReader<File>>,
}

impl<K> Bucket<K> {
    /// Creates an empty bucket whose side file lives at `aux_path`.
    ///
    /// Any existing file at that path is truncated: bucket contents never
    /// survive a restart.
    ///
    /// # Errors
    ///
    /// Returns an error if `capacity` is zero or the side file cannot be
    /// created.
    pub fn new<P: AsRef<Path>>(
        aux_path: P,
        capacity: usize,
        buffer_size: usize,
        serializer: Arc<dyn Serializer<K>>,
    ) -> Result<Self> {
        ensure!(capacity > 0, "bucket capacity must be > 0");
        let aux_path = aux_path.as_ref().to_path_buf();
        let writer = Self::open_writer(&aux_path, buffer_size)?;
        Ok(Self {
            hashes: Vec::with_capacity(capacity),
            capacity,
            aux_path,
            buffer_size,
            serializer,
            writer: Some(writer),
            reader: None,
        })
    }

    fn open_writer(path: &Path, buffer_size: usize) -> Result<BufWriter<File>> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("failed to create bucket side file {}", path.display()))?;
        Ok(BufWriter::with_capacity(buffer_size.max(1), file))
    }

    /// Records one key. The hash goes to the next free slot and the key is
    /// serialized to the side file.
    ///
    /// # Errors
    ///
    /// Fails if the bucket is full, is being read back, or on I/O failure.
    /// After an I/O or serializer failure the side file may end in a partial
    /// key, so the bucket must not be flushed.
    pub fn append(&mut self, hash: u64, key: &K) -> Result<()> {
        ensure!(!self.is_full(), "bucket is full ({} items)", self.capacity);
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| anyhow!("bucket is being read back; clear() it first"))?;
        self.serializer.to_stream(key, writer)?;
        self.hashes.push(hash);
        Ok(())
    }

    /// `true` once `len() == capacity()`.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.hashes.len() == self.capacity
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Hashes in arrival order.
    #[must_use]
    pub fn hashes(&self) -> &[u64] {
        &self.hashes
    }

    /// Path of the side file.
    #[must_use]
    pub fn aux_path(&self) -> &Path {
        &self.aux_path
    }

    /// Flushes pending side-file writes and reopens the file for sequential
    /// reading from the start.
    pub fn prepare(&mut self) -> Result<()> {
        let mut writer = self
            .writer
            .take()
            .ok_or_else(|| anyhow!("bucket already prepared for reading"))?;
        writer.flush()?;
        drop(writer);

        let file = File::open(&self.aux_path).with_context(|| {
            format!("failed to reopen bucket side file {}", self.aux_path.display())
        })?;
        self.reader = Some(BufReader::with_capacity(self.buffer_size.max(1), file));
        Ok(())
    }

    fn reader(&mut self) -> Result<&mut BufReader<File>> {
        self.reader
            .as_mut()
            .ok_or_else(|| anyhow!("bucket not prepared for reading"))
    }

    /// Deserializes the next key from the side file.
    pub fn consume_key(&mut self) -> Result<K> {
        let serializer = Arc::clone(&self.serializer);
        let reader = self.reader()?;
        Ok(serializer.from_stream(reader)?)
    }

    /// Advances past the next key without deserializing it.
    pub fn skip_key(&mut self) -> Result<()> {
        let serializer = Arc::clone(&self.serializer);
        let reader = self.reader()?;
        serializer.skip(reader)?;
        Ok(())
    }

    /// Checks that the read cursor sits exactly at the end of the side file.
    ///
    /// Call after every key has been consumed or skipped. A mismatch means
    /// `skip`/`from_stream` disagree with `to_stream` about how many bytes a
    /// key occupies.
    pub fn finish_read(&mut self) -> Result<()> {
        let reader = self.reader()?;
        let pos = reader.stream_position()?;
        let len = reader.get_ref().metadata()?.len();
        if pos != len {
            return Err(CodecError::LengthMismatch {
                expected: len,
                actual: pos,
            })
            .context("bucket side file not consumed to its end");
        }
        Ok(())
    }

    /// Resets the bucket for the next accumulation cycle, truncating the
    /// side file.
    pub fn clear(&mut self) -> Result<()> {
        self.reader = None;
        self.writer = None;
        self.hashes.clear();
        self.writer = Some(Self::open_writer(&self.aux_path, self.buffer_size)?);
        Ok(())
    }
}

impl<K> std::fmt::Debug for Bucket<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucket")
            .field("items", &self.hashes.len())
            .field("capacity", &self.capacity)
            .field("aux_path", &self.aux_path)
            .field("reading", &self.reader.is_some())
            .finish()
    }
}
