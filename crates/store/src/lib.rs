//! # Store - the persistent sorted set of known hashes
//!
//! The store is a single file of fixed-width hash records, strictly ascending
//! and duplicate-free. It is never updated in place: every flush reads the
//! old file once, front to back, while writing the merged result to a sibling
//! temporary file, which then atomically replaces the old one.
//!
//! ## File layout
//!
//! ```text
//! ┌──────────────┬──────────────┬─────┬──────────────┐
//! │ hash_0 (u64) │ hash_1 (u64) │ ... │ hash_n (u64) │   hash_0 < hash_1 < ... < hash_n
//! └──────────────┴──────────────┴─────┴──────────────┘
//! ```
//!
//! Records are 8 bytes in native byte order. The record count is the file
//! length divided by 8; there is no header or footer.
//!
//! ## One flush pass
//!
//! ```text
//! open() ──► consume()* / append()* ──► close()
//!   │                                     │
//!   ├─ store      (read, ascending)       ├─ flush + fsync store.tmp
//!   └─ store.tmp  (write, truncated)      └─ rename store.tmp -> store, fsync dir
//! ```

use anyhow::{anyhow, bail, ensure, Context, Result};
use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Size of one hash record in bytes.
pub const RECORD_BYTES: u64 = 8;

/// File name of the store inside the sieve directory.
pub const STORE_FILENAME: &str = "store";

/// Temporary file the merged store is written to during a flush.
pub const STORE_TMP_FILENAME: &str = "store.tmp";

/// Persistent, ascending, duplicate-free sequence of 64-bit hashes.
pub struct Store {
    path: PathBuf,
    tmp_path: PathBuf,
    buffer_size: usize,
    /// Number of hashes in the committed store file.
    len: u64,
    reader: Option<BufReader<File>>,
    /// Hashes not yet returned by `consume()` in the current pass.
    remaining: u64,
    writer: Option<BufWriter<File>>,
    /// Hashes appended to the temporary file in the current pass.
    written: u64,
    last_written: Option<u64>,
}

impl Store {
    /// Binds a store to `dir`, creating the directory if needed.
    ///
    /// A leftover temporary file from an interrupted flush is discarded: the
    /// committed store is still the old one, and its bucket was never
    /// acknowledged.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the existing
    /// store file is not a whole number of records.
    pub fn new<P: AsRef<Path>>(dir: P, buffer_size: usize) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create store dir {}", dir.display()))?;

        let path = dir.join(STORE_FILENAME);
        let tmp_path = dir.join(STORE_TMP_FILENAME);

        if tmp_path.exists() {
            warn!(path = %tmp_path.display(), "removing leftover store temp file");
            fs::remove_file(&tmp_path)?;
        }

        let len = Self::committed_len(&path)?;

        Ok(Self {
            path,
            tmp_path,
            buffer_size: buffer_size.max(1),
            len,
            reader: None,
            remaining: 0,
            writer: None,
            written: 0,
            last_written: None,
        })
    }

    /// Record count of the committed store file (0 if absent).
    fn committed_len(path: &Path) -> Result<u64> {
        let bytes = match fs::metadata(path) {
            Ok(m) => m.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        if bytes % RECORD_BYTES != 0 {
            bail!(
                "store {} is corrupted: {} bytes is not a multiple of {}",
                path.display(),
                bytes,
                RECORD_BYTES
            );
        }
        Ok(bytes / RECORD_BYTES)
    }

    /// Number of hashes in the committed store.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Path of the committed store file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `true` between `open()` and `close()`.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    /// Starts a merge pass: opens the committed store for sequential reading
    /// and a fresh temporary file for writing. Returns the number of hashes
    /// available to [`consume`](Store::consume).
    pub fn open(&mut self) -> Result<u64> {
        ensure!(!self.is_open(), "store pass already open");

        self.len = Self::committed_len(&self.path)?;
        self.reader = if self.len > 0 {
            let file = File::open(&self.path)
                .with_context(|| format!("failed to open store {}", self.path.display()))?;
            Some(BufReader::with_capacity(self.buffer_size, file))
        } else {
            None
        };
        self.remaining = self.len;

        let tmp = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.tmp_path)
            .with_context(|| format!("failed to create {}", self.tmp_path.display()))?;
        self.writer = Some(BufWriter::with_capacity(self.buffer_size, tmp));
        self.written = 0;
        self.last_written = None;

        Ok(self.len)
    }

    /// Returns the next committed hash, in ascending order.
    ///
    /// # Errors
    ///
    /// Fails if the pass is not open or every hash has been consumed.
    pub fn consume(&mut self) -> Result<u64> {
        ensure!(self.remaining > 0, "store exhausted ({} hashes consumed)", self.len);
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| anyhow!("store pass not open"))?;
        let hash = reader
            .read_u64::<NativeEndian>()
            .context("store truncated while reading")?;
        self.remaining -= 1;
        Ok(hash)
    }

    /// Hashes not yet consumed in the current pass.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Appends one hash to the new store.
    ///
    /// # Errors
    ///
    /// Rejects a hash that is not strictly greater than the previous one: the
    /// store must stay ascending and duplicate-free.
    pub fn append(&mut self, hash: u64) -> Result<()> {
        if let Some(last) = self.last_written {
            ensure!(
                hash > last,
                "store append out of order: {:#018x} after {:#018x}",
                hash,
                last
            );
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| anyhow!("store pass not open"))?;
        writer.write_u64::<NativeEndian>(hash)?;
        self.written += 1;
        self.last_written = Some(hash);
        Ok(())
    }

    /// Commits the pass: flushes and fsyncs the temporary file, then renames
    /// it over the committed store.
    pub fn close(&mut self) -> Result<()> {
        self.reader = None;
        let writer = self
            .writer
            .take()
            .ok_or_else(|| anyhow!("store pass not open"))?;

        let file = writer
            .into_inner()
            .map_err(|e| anyhow!("failed to flush store temp file: {}", e.error()))?;
        file.sync_all()?;
        drop(file);

        fs::rename(&self.tmp_path, &self.path).with_context(|| {
            format!(
                "failed to replace {} with {}",
                self.path.display(),
                self.tmp_path.display()
            )
        })?;

        // Make the rename itself durable.
        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        self.len = self.written;
        self.remaining = 0;
        Ok(())
    }

    /// Reads every committed hash. Intended for inspection and tests; the
    /// flush path never materializes the store.
    pub fn read_all(&self) -> Result<Vec<u64>> {
        let len = Self::committed_len(&self.path)?;
        if len == 0 {
            return Ok(Vec::new());
        }
        let mut reader = BufReader::with_capacity(self.buffer_size, File::open(&self.path)?);
        let mut out = Vec::with_capacity(len as usize);
        for _ in 0..len {
            out.push(reader.read_u64::<NativeEndian>()?);
        }
        Ok(out)
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.path)
            .field("len", &self.len)
            .field("open", &self.is_open())
            .field("remaining", &self.remaining)
            .field("written", &self.written)
            .finish()
    }
}
