//! Disk-backed, blocking FIFO of new keys.
//!
//! ## Segment files
//!
//! Each non-empty batch becomes one file `flow-<id>.seg` in the flow
//! directory:
//!
//! ```text
//! [hash: u64 LE][key_len: u32 LE][serialized key ...]   repeated per record
//! ```
//!
//! `key_len` frames the serializer output so a reader can detect a
//! serializer that consumes a different number of bytes than it wrote.
//!
//! ## Lifecycle
//!
//! ```text
//! prepare_to_append ──► flow-<id>.tmp (written)
//! finished_appending ─► fsync, rename to flow-<id>.seg (published)
//! last record dequeued ─► segment deleted
//! ```
//!
//! Reopening a flow directory discards `.tmp` files (batches never
//! published) and reloads every `.seg` file in id order, so published keys
//! survive a restart. A segment that was partly dequeued before the restart
//! is delivered again from its first record.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use codec::{from_exact_bytes, Serializer};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::{FlowError, NewFlowReceiver};

/// Extension of segment files.
pub const SEGMENT_EXTENSION: &str = "seg";

/// Extension of a batch still being written.
pub const SEGMENT_TMP_EXTENSION: &str = "tmp";

/// Fixed part of a record: hash plus key length.
const RECORD_HEADER_BYTES: u64 = 12;

/// Largest key frame accepted when reading a segment (64 MiB).
const MAX_KEY_FRAME: u32 = 64 * 1024 * 1024;

/// One batch on disk.
#[derive(Debug)]
struct Segment {
    path: PathBuf,
    /// Records not yet dequeued (or, while appending, records written).
    records: u64,
}

struct Appending {
    writer: BufWriter<File>,
    tmp_path: PathBuf,
    segment: Segment,
}

struct FlowState {
    appending: Option<Appending>,
    /// Published segments, oldest first.
    segments: VecDeque<Segment>,
    /// Open reader over `segments.front()`.
    reader: Option<BufReader<File>>,
    /// Published records not yet dequeued.
    size: u64,
    next_id: u64,
    no_more: bool,
    /// Reusable buffer for encoding and decoding keys.
    scratch: Vec<u8>,
}

/// Reference [`NewFlowReceiver`]: persists batches to segment files and
/// exposes a blocking, strictly FIFO dequeue.
///
/// # Blocking semantics
///
/// - Open and empty: [`dequeue_key`](DiskNewFlow::dequeue_key) waits.
/// - Closed and empty: it returns [`FlowError::Exhausted`].
///
/// Keys of a batch become visible only after `finished_appending`.
pub struct DiskNewFlow<K> {
    dir: PathBuf,
    serializer: Arc<dyn Serializer<K>>,
    buffer_size: usize,
    state: Mutex<FlowState>,
    available: Condvar,
}

impl<K> DiskNewFlow<K> {
    /// Creates a flow that keeps its segments in `dir`.
    ///
    /// The directory is created if missing. Unpublished batches left by a
    /// previous instance are removed; published segments are reloaded and
    /// their records are dequeued before any new batch.
    ///
    /// # Errors
    ///
    /// I/O failures, or [`FlowError::Corrupt`] if a published segment does
    /// not frame into whole records.
    pub fn new<P: AsRef<Path>>(
        dir: P,
        serializer: Arc<dyn Serializer<K>>,
        buffer_size: usize,
    ) -> Result<Self, FlowError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Self::cleanup_tmp_segments(&dir);
        let recovered = Self::recover_segments(&dir)?;

        let size: u64 = recovered.iter().map(|(_, seg)| seg.records).sum();
        let next_id = recovered.last().map(|(id, _)| id + 1).unwrap_or(0);
        if size > 0 {
            info!(
                dir = %dir.display(),
                segments = recovered.len(),
                records = size,
                "recovered published flow segments"
            );
        }

        Ok(Self {
            dir,
            serializer,
            buffer_size: buffer_size.max(1),
            state: Mutex::new(FlowState {
                appending: None,
                segments: recovered.into_iter().map(|(_, seg)| seg).collect(),
                reader: None,
                size,
                next_id,
                no_more: false,
                scratch: Vec::with_capacity(256),
            }),
            available: Condvar::new(),
        })
    }

    fn cleanup_tmp_segments(dir: &Path) {
        if let Ok(entries) = fs::read_dir(dir) {
            for entry in entries.flatten() {
                let p = entry.path();
                if p.extension().map(|e| e == SEGMENT_TMP_EXTENSION).unwrap_or(false) {
                    warn!(path = %p.display(), "removing unpublished flow batch");
                    let _ = fs::remove_file(&p);
                }
            }
        }
    }

    /// Published segments in `dir`, ordered by id. Empty segments are
    /// deleted.
    fn recover_segments(dir: &Path) -> Result<Vec<(u64, Segment)>, FlowError> {
        let mut found = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.extension().map(|e| e == SEGMENT_EXTENSION).unwrap_or(false) {
                continue;
            }
            let id = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.strip_prefix("flow-"))
                .and_then(|s| s.parse::<u64>().ok());
            match id {
                Some(id) => found.push((id, path)),
                None => warn!(path = %path.display(), "ignoring unrecognized segment name"),
            }
        }
        found.sort_unstable_by_key(|(id, _)| *id);

        let mut segments = Vec::with_capacity(found.len());
        for (id, path) in found {
            let records = Self::count_records(&path)?;
            if records == 0 {
                let _ = fs::remove_file(&path);
                continue;
            }
            segments.push((id, Segment { path, records }));
        }
        Ok(segments)
    }

    /// Walks the record frames of a segment without decoding keys.
    fn count_records(path: &Path) -> Result<u64, FlowError> {
        let corrupt = |reason: String| FlowError::Corrupt {
            path: path.display().to_string(),
            reason,
        };
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let mut pos = 0u64;
        let mut records = 0u64;
        while pos < file_len {
            if file_len - pos < RECORD_HEADER_BYTES {
                return Err(corrupt(format!("partial record header at byte {}", pos)));
            }
            reader.seek_relative(8)?;
            let len = reader.read_u32::<LittleEndian>()?;
            if len > MAX_KEY_FRAME {
                return Err(corrupt(format!("key frame of {} bytes", len)));
            }
            pos += RECORD_HEADER_BYTES + len as u64;
            if pos > file_len {
                return Err(corrupt(format!("record {} runs past end of file", records)));
            }
            reader.seek_relative(len as i64)?;
            records += 1;
        }
        Ok(records)
    }

    /// Directory holding the segment files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Published items not yet dequeued.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.state.lock().size
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `true` once `no_more_append` has been received.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().no_more
    }

    /// Number of published segment files still on disk.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.state.lock().segments.len()
    }

    /// Removes the next `(hash, key)`, blocking while the flow is open and
    /// empty.
    ///
    /// # Errors
    ///
    /// [`FlowError::Exhausted`] once the flow is closed and drained; I/O or
    /// codec errors if the segment cannot be read.
    pub fn dequeue(&self) -> Result<(u64, K), FlowError> {
        let mut state = self.state.lock();
        while state.size == 0 {
            if state.no_more {
                return Err(FlowError::Exhausted);
            }
            self.available.wait(&mut state);
        }
        self.read_next(&mut state)
    }

    /// Like [`dequeue`](DiskNewFlow::dequeue) but returns only the key.
    pub fn dequeue_key(&self) -> Result<K, FlowError> {
        self.dequeue().map(|(_, key)| key)
    }

    /// Bounded wait: returns `Ok(None)` if nothing arrived within `timeout`.
    ///
    /// Exhaustion is still reported as [`FlowError::Exhausted`].
    pub fn dequeue_key_timeout(&self, timeout: Duration) -> Result<Option<K>, FlowError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.size == 0 {
            if state.no_more {
                return Err(FlowError::Exhausted);
            }
            if self.available.wait_until(&mut state, deadline).timed_out() && state.size == 0 {
                if state.no_more {
                    return Err(FlowError::Exhausted);
                }
                return Ok(None);
            }
        }
        self.read_next(&mut state).map(|(_, key)| Some(key))
    }

    fn read_next(&self, guard: &mut MutexGuard<'_, FlowState>) -> Result<(u64, K), FlowError> {
        let state = &mut **guard;

        let front = state
            .segments
            .front_mut()
            .ok_or(FlowError::Protocol("published size without a segment"))?;

        if state.reader.is_none() {
            let file = File::open(&front.path)?;
            state.reader = Some(BufReader::with_capacity(self.buffer_size, file));
        }
        let reader = state
            .reader
            .as_mut()
            .ok_or(FlowError::Protocol("segment reader missing"))?;

        let (hash, len) = Self::read_record(reader, &mut state.scratch, &front.path)?;
        let key = from_exact_bytes(self.serializer.as_ref(), &state.scratch[..len])?;

        front.records -= 1;
        state.size -= 1;

        // Last record of the front segment: drop it from disk.
        if front.records == 0 {
            let path = front.path.clone();
            state.reader = None;
            state.segments.pop_front();
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to remove drained flow segment");
            }
        }
        Ok((hash, key))
    }

    /// Reads one `[hash][len][bytes]` frame into `scratch`; returns the hash
    /// and the frame length.
    fn read_record(
        reader: &mut BufReader<File>,
        scratch: &mut Vec<u8>,
        path: &Path,
    ) -> Result<(u64, usize), FlowError> {
        let corrupt = |reason: String| FlowError::Corrupt {
            path: path.display().to_string(),
            reason,
        };
        let hash = reader
            .read_u64::<LittleEndian>()
            .map_err(|e| corrupt(format!("reading hash: {}", e)))?;
        let len = reader
            .read_u32::<LittleEndian>()
            .map_err(|e| corrupt(format!("reading key length: {}", e)))?;
        if len > MAX_KEY_FRAME {
            return Err(corrupt(format!("key frame of {} bytes", len)));
        }
        let len = len as usize;
        scratch.clear();
        scratch.resize(len, 0);
        reader
            .read_exact(&mut scratch[..len])
            .map_err(|e| corrupt(format!("reading key: {}", e)))?;
        Ok((hash, len))
    }

    /// Publishes the open batch, if any. Returns the number of records it
    /// held.
    fn publish(&self, state: &mut FlowState) -> Result<u64, FlowError> {
        let Some(Appending {
            writer,
            tmp_path,
            segment,
        }) = state.appending.take()
        else {
            return Err(FlowError::Protocol("finished_appending without prepare_to_append"));
        };

        let file = writer.into_inner().map_err(|e| e.into_error())?;

        let records = segment.records;
        if records == 0 {
            drop(file);
            let _ = fs::remove_file(&tmp_path);
        } else {
            file.sync_all()?;
            drop(file);
            fs::rename(&tmp_path, &segment.path)?;
            if let Ok(dir) = File::open(&self.dir) {
                let _ = dir.sync_all();
            }
            debug!(path = %segment.path.display(), records, "published flow segment");
            state.segments.push_back(segment);
            state.size += records;
            self.available.notify_all();
        }
        Ok(records)
    }
}

impl<K> NewFlowReceiver<K> for DiskNewFlow<K> {
    fn prepare_to_append(&self) -> Result<(), FlowError> {
        let mut state = self.state.lock();
        if state.no_more {
            return Err(FlowError::Protocol("prepare_to_append after no_more_append"));
        }
        if state.appending.is_some() {
            return Err(FlowError::Protocol("prepare_to_append inside an open batch"));
        }

        let id = state.next_id;
        let path = self
            .dir
            .join(format!("flow-{:020}.{}", id, SEGMENT_EXTENSION));
        let tmp_path = self
            .dir
            .join(format!("flow-{:020}.{}", id, SEGMENT_TMP_EXTENSION));
        state.next_id += 1;

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        state.appending = Some(Appending {
            writer: BufWriter::with_capacity(self.buffer_size, file),
            tmp_path,
            segment: Segment { path, records: 0 },
        });
        Ok(())
    }

    fn append(&self, hash: u64, key: &K) -> Result<(), FlowError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let batch = state
            .appending
            .as_mut()
            .ok_or(FlowError::Protocol("append outside a batch"))?;

        state.scratch.clear();
        self.serializer.to_stream(key, &mut state.scratch)?;
        let len = u32::try_from(state.scratch.len()).map_err(|_| {
            FlowError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "serialized key exceeds u32::MAX bytes",
            ))
        })?;

        batch.writer.write_u64::<LittleEndian>(hash)?;
        batch.writer.write_u32::<LittleEndian>(len)?;
        batch.writer.write_all(&state.scratch)?;
        batch.segment.records += 1;
        Ok(())
    }

    fn finished_appending(&self) -> Result<(), FlowError> {
        let mut state = self.state.lock();
        self.publish(&mut state)?;
        Ok(())
    }

    fn no_more_append(&self) -> Result<(), FlowError> {
        let mut state = self.state.lock();
        if state.appending.is_some() {
            warn!("no_more_append with an open batch; publishing it");
            self.publish(&mut state)?;
        }
        state.no_more = true;
        self.available.notify_all();
        Ok(())
    }
}

impl<K> std::fmt::Debug for DiskNewFlow<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DiskNewFlow")
            .field("dir", &self.dir)
            .field("size", &state.size)
            .field("segments", &state.segments.len())
            .field("appending", &state.appending.is_some())
            .field("no_more", &state.no_more)
            .finish()
    }
}
