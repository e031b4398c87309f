//! Segment Storage Abstraction
//!
//! Trait-based backends for the fixed-size segment files the receiver
//! writes, plus the archive-status marker files and timeline history files
//! that live alongside them.
//!
//! ## Implementations
//!
//! - `InMemorySegmentStore`: for unit tests, integration tests and demos
//! - `LocalSegmentStore`: for production (std::fs::File + sync_all)
//!
//! Unlike an append-only log store, segment files are written at exact
//! byte offsets: the stream position dictates where each byte lands.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;

/// Unrecoverable segment I/O fault. Any of these aborts the receiver
/// process; EOF/disconnect conditions never surface here.
#[derive(Debug)]
pub enum WalIoError {
    Open {
        name: String,
        source: std::io::Error,
    },
    Write {
        name: String,
        offset: u64,
        length: usize,
        source: std::io::Error,
    },
    /// The OS accepted a write but transferred nothing. Treated like any
    /// other write fault, never retried.
    ZeroLengthWrite {
        name: String,
        offset: u64,
        length: usize,
    },
    Sync {
        name: String,
        source: std::io::Error,
    },
    Close {
        name: String,
        source: std::io::Error,
    },
    Marker {
        name: String,
        source: std::io::Error,
    },
    History {
        name: String,
        source: std::io::Error,
    },
}

impl std::fmt::Display for WalIoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WalIoError::Open { name, source } => {
                write!(f, "could not open WAL segment {}: {}", name, source)
            }
            WalIoError::Write {
                name,
                offset,
                length,
                source,
            } => write!(
                f,
                "could not write to WAL segment {} at offset {}, length {}: {}",
                name, offset, length, source
            ),
            WalIoError::ZeroLengthWrite {
                name,
                offset,
                length,
            } => write!(
                f,
                "wrote no bytes to WAL segment {} at offset {}, length {}",
                name, offset, length
            ),
            WalIoError::Sync { name, source } => {
                write!(f, "could not fsync WAL segment {}: {}", name, source)
            }
            WalIoError::Close { name, source } => {
                write!(f, "could not close WAL segment {}: {}", name, source)
            }
            WalIoError::Marker { name, source } => {
                write!(f, "could not write archive marker for {}: {}", name, source)
            }
            WalIoError::History { name, source } => {
                write!(f, "could not write history file {}: {}", name, source)
            }
        }
    }
}

impl std::error::Error for WalIoError {}

/// Archival disposition recorded for a completed segment or history file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveDisposition {
    /// Ready for the archiver to pick up.
    Ready,
    /// Done without archiving; prevents a concurrently-configured archiver
    /// from capturing a segment the original source also archives.
    Done,
}

impl ArchiveDisposition {
    fn marker_suffix(self) -> &'static str {
        match self {
            ArchiveDisposition::Ready => ".ready",
            ArchiveDisposition::Done => ".done",
        }
    }
}

/// An open segment file supporting positional writes.
pub trait SegmentFile: Send {
    /// Write at the exact byte offset. Returns the number of bytes
    /// transferred, which may be short; the caller loops. A zero return
    /// for a non-empty buffer is classified by the caller as
    /// [`WalIoError::ZeroLengthWrite`].
    fn write_at(&mut self, data: &[u8], offset: u64) -> Result<usize, WalIoError>;

    /// Durability barrier: block until everything written is recoverable.
    fn sync(&mut self) -> Result<(), WalIoError>;

    /// Close the file. Must only be called after a sync; closing never
    /// substitutes for the durability barrier.
    fn close(self) -> Result<(), WalIoError>;
}

/// Storage backend for segment files, markers and history files.
pub trait SegmentStore: Send + Sync + 'static {
    type File: SegmentFile;

    /// Open a segment file, creating it (pre-sized) if missing.
    fn open(&self, name: &str, size: u64) -> Result<Self::File, WalIoError>;

    /// Record the archival disposition of a completed segment or history
    /// file.
    fn write_marker(&self, name: &str, disposition: ArchiveDisposition) -> Result<(), WalIoError>;

    /// Persist a fetched timeline history file.
    fn write_history_file(&self, name: &str, content: &[u8]) -> Result<(), WalIoError>;

    /// Whether a file of this name already exists.
    fn exists(&self, name: &str) -> bool;

    /// All file names, sorted. Markers are reported under their own names.
    fn list(&self) -> Vec<String>;
}

// ============================================================================
// InMemorySegmentStore - for tests and demos
// ============================================================================

#[derive(Debug, Clone, Default)]
struct InMemorySegment {
    data: Vec<u8>,
    /// Snapshot taken at the last sync; a simulated crash reverts to it.
    synced: Vec<u8>,
}

#[derive(Debug, Default)]
struct InMemoryState {
    segments: HashMap<String, InMemorySegment>,
    markers: HashMap<String, ArchiveDisposition>,
    history: HashMap<String, Vec<u8>>,
    sync_count: u64,
    /// Next `write_at` transfers at most this many bytes (test hook).
    short_write_limit: Option<usize>,
    /// Next `write_at` reports zero bytes transferred (test hook).
    fail_next_write_with_zero: bool,
}

/// In-memory segment store. Clones share state.
#[derive(Clone, Default)]
pub struct InMemorySegmentStore {
    state: Arc<Mutex<InMemoryState>>,
}

impl InMemorySegmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw bytes of a segment, for assertions.
    pub fn segment_data(&self, name: &str) -> Option<Vec<u8>> {
        self.state.lock().segments.get(name).map(|s| s.data.clone())
    }

    /// Bytes of a segment as of the last durability barrier.
    pub fn synced_data(&self, name: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .segments
            .get(name)
            .map(|s| s.synced.clone())
    }

    /// Marker recorded for a file, if any.
    pub fn marker(&self, name: &str) -> Option<ArchiveDisposition> {
        self.state.lock().markers.get(name).copied()
    }

    /// Stored history file content.
    pub fn history_file(&self, name: &str) -> Option<Vec<u8>> {
        self.state.lock().history.get(name).cloned()
    }

    /// Number of durability barriers issued across all segments.
    pub fn sync_count(&self) -> u64 {
        self.state.lock().sync_count
    }

    /// Simulate a crash: every segment reverts to its last synced bytes.
    pub fn simulate_crash(&self) {
        let mut state = self.state.lock();
        for seg in state.segments.values_mut() {
            seg.data = seg.synced.clone();
        }
    }

    /// Make the next write transfer at most `n` bytes.
    pub fn limit_next_write(&self, n: usize) {
        self.state.lock().short_write_limit = Some(n);
    }

    /// Make the next write report zero bytes transferred.
    pub fn fail_next_write_with_zero(&self) {
        self.state.lock().fail_next_write_with_zero = true;
    }
}

/// Writer over one in-memory segment.
pub struct InMemorySegmentFile {
    name: String,
    state: Arc<Mutex<InMemoryState>>,
}

impl SegmentFile for InMemorySegmentFile {
    fn write_at(&mut self, data: &[u8], offset: u64) -> Result<usize, WalIoError> {
        let mut state = self.state.lock();

        if state.fail_next_write_with_zero {
            state.fail_next_write_with_zero = false;
            return Ok(0);
        }
        let transfer = match state.short_write_limit.take() {
            Some(limit) => data.len().min(limit),
            None => data.len(),
        };

        let seg = state
            .segments
            .get_mut(&self.name)
            .expect("segment must exist after open");
        let offset = offset as usize;
        let end = offset
            .checked_add(transfer)
            .expect("segment offset overflow is unreachable");
        if seg.data.len() < end {
            seg.data.resize(end, 0);
        }
        seg.data[offset..end].copy_from_slice(&data[..transfer]);
        Ok(transfer)
    }

    fn sync(&mut self) -> Result<(), WalIoError> {
        let mut state = self.state.lock();
        state.sync_count += 1;
        let seg = state
            .segments
            .get_mut(&self.name)
            .expect("segment must exist after open");
        seg.synced = seg.data.clone();
        Ok(())
    }

    fn close(self) -> Result<(), WalIoError> {
        Ok(())
    }
}

impl SegmentStore for InMemorySegmentStore {
    type File = InMemorySegmentFile;

    fn open(&self, name: &str, size: u64) -> Result<Self::File, WalIoError> {
        debug_assert!(!name.is_empty(), "Precondition: name must not be empty");
        let mut state = self.state.lock();
        state.segments.entry(name.to_string()).or_insert_with(|| {
            let zeroed = vec![0u8; size as usize];
            InMemorySegment {
                data: zeroed.clone(),
                synced: zeroed,
            }
        });
        Ok(InMemorySegmentFile {
            name: name.to_string(),
            state: Arc::clone(&self.state),
        })
    }

    fn write_marker(&self, name: &str, disposition: ArchiveDisposition) -> Result<(), WalIoError> {
        self.state
            .lock()
            .markers
            .insert(name.to_string(), disposition);
        Ok(())
    }

    fn write_history_file(&self, name: &str, content: &[u8]) -> Result<(), WalIoError> {
        self.state
            .lock()
            .history
            .insert(name.to_string(), content.to_vec());
        Ok(())
    }

    fn exists(&self, name: &str) -> bool {
        let state = self.state.lock();
        state.segments.contains_key(name) || state.history.contains_key(name)
    }

    fn list(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut names: Vec<String> = state
            .segments
            .keys()
            .chain(state.history.keys())
            .cloned()
            .collect();
        names.sort();
        names
    }
}

// ============================================================================
// LocalSegmentStore - for production
// ============================================================================

/// Local filesystem segment store. Markers live under `archive_status/`
/// inside the segment directory.
#[derive(Debug, Clone)]
pub struct LocalSegmentStore {
    dir: PathBuf,
}

impl LocalSegmentStore {
    /// Create a store over a directory, creating it (and its
    /// `archive_status/` subdirectory) if missing.
    pub fn new(dir: PathBuf) -> Result<Self, WalIoError> {
        std::fs::create_dir_all(dir.join("archive_status")).map_err(|e| WalIoError::Open {
            name: dir.display().to_string(),
            source: e,
        })?;
        Ok(LocalSegmentStore { dir })
    }

    fn segment_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn marker_path(&self, name: &str, disposition: ArchiveDisposition) -> PathBuf {
        self.dir
            .join("archive_status")
            .join(format!("{}{}", name, disposition.marker_suffix()))
    }
}

/// Writer over one local segment file.
pub struct LocalSegmentFile {
    name: String,
    file: std::fs::File,
}

impl SegmentFile for LocalSegmentFile {
    fn write_at(&mut self, data: &[u8], offset: u64) -> Result<usize, WalIoError> {
        self.file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.write(data))
            .map_err(|e| WalIoError::Write {
                name: self.name.clone(),
                offset,
                length: data.len(),
                source: e,
            })
    }

    fn sync(&mut self) -> Result<(), WalIoError> {
        self.file.sync_all().map_err(|e| WalIoError::Sync {
            name: self.name.clone(),
            source: e,
        })
    }

    fn close(self) -> Result<(), WalIoError> {
        // sync_all already ran; dropping the handle is the close.
        Ok(())
    }
}

impl SegmentStore for LocalSegmentStore {
    type File = LocalSegmentFile;

    fn open(&self, name: &str, size: u64) -> Result<Self::File, WalIoError> {
        debug_assert!(!name.is_empty(), "Precondition: name must not be empty");
        let path = self.segment_path(name);
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| WalIoError::Open {
                name: name.to_string(),
                source: e,
            })?;

        // Pre-size newly created segments so recovery sees full-length files.
        let len = file
            .metadata()
            .map_err(|e| WalIoError::Open {
                name: name.to_string(),
                source: e,
            })?
            .len();
        if len < size {
            file.set_len(size).map_err(|e| WalIoError::Open {
                name: name.to_string(),
                source: e,
            })?;
        }

        Ok(LocalSegmentFile {
            name: name.to_string(),
            file,
        })
    }

    fn write_marker(&self, name: &str, disposition: ArchiveDisposition) -> Result<(), WalIoError> {
        // Replace the opposite marker if present; dispositions are final
        // but a forced-done must win over a stale ready.
        let opposite = match disposition {
            ArchiveDisposition::Ready => ArchiveDisposition::Done,
            ArchiveDisposition::Done => ArchiveDisposition::Ready,
        };
        let _ = std::fs::remove_file(self.marker_path(name, opposite));
        std::fs::write(self.marker_path(name, disposition), b"").map_err(|e| {
            WalIoError::Marker {
                name: name.to_string(),
                source: e,
            }
        })
    }

    fn write_history_file(&self, name: &str, content: &[u8]) -> Result<(), WalIoError> {
        let path = self.segment_path(name);
        let mut file = std::fs::File::create(&path).map_err(|e| WalIoError::History {
            name: name.to_string(),
            source: e,
        })?;
        file.write_all(content)
            .and_then(|_| file.sync_all())
            .map_err(|e| WalIoError::History {
                name: name.to_string(),
                source: e,
            })
    }

    fn exists(&self, name: &str) -> bool {
        self.segment_path(name).exists()
    }

    fn list(&self) -> Vec<String> {
        let mut names = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&self.dir) {
            for entry in entries.flatten() {
                if entry.path().is_file() {
                    if let Some(name) = entry.file_name().to_str() {
                        names.push(name.to_string());
                    }
                }
            }
        }
        names.sort();
        names
    }
}

/// Read back a local segment's bytes. Test/recovery helper.
impl LocalSegmentStore {
    pub fn read_segment(&self, name: &str) -> std::io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        std::fs::File::open(self.segment_path(name))?.read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Which marker exists for a file, if any.
    pub fn marker(&self, name: &str) -> Option<ArchiveDisposition> {
        if self.marker_path(name, ArchiveDisposition::Ready).exists() {
            Some(ArchiveDisposition::Ready)
        } else if self.marker_path(name, ArchiveDisposition::Done).exists() {
            Some(ArchiveDisposition::Done)
        } else {
            None
        }
    }
}
