use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
    sync::mpsc::{self, Receiver, Sender},
};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    cursor::{Cursor, CursorError, CursorStore, Resume},
    identity::FileIdentity,
    lines::{split_block, LineAssembler},
    path_utils::resolve_absolute,
    record::{Record, RecordEmitter, StatusReport},
};

/// Capacity of the buffer used for a single read
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Where to start reading a file that has no usable sidecar yet
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StartPosition {
    Head,
    /// current end of file, only new content is read
    Tail,
    /// byte offset, clamped to the current size
    At(u64),
}

/// Outcome of a single `TailReader::read_and_emit`
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReadStatus {
    /// This many records were emitted
    Emitted(usize),
    /// Bytes were read but no line is complete yet
    NeedMore,
    /// Nothing left to read for now
    AtEof,
}

#[derive(Clone, Debug)]
pub struct TailOptions {
    pub read_buffer_size: usize,
    /// Save the cursor after every N-th emitting chunk. It is always saved at the end of a drain and on close.
    pub persist_every: u32,
}

impl Default for TailOptions {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            persist_every: 1,
        }
    }
}

/// Delivery queues for records and status reports
#[derive(Clone, Debug)]
pub struct Sinks {
    pub records: Sender<Record>,
    pub status: Sender<StatusReport>,
}

impl Sinks {
    /// Unbounded queues together with their receiving ends
    pub fn unbounded() -> (Self, Receiver<Record>, Receiver<StatusReport>) {
        let (records, records_rx) = mpsc::channel();
        let (status, status_rx) = mpsc::channel();
        (Self { records, status }, records_rx, status_rx)
    }
}

/// Possible errors that could happen while tailing a file
#[derive(Error, Debug)]
pub enum TailError {
    #[error("failed to open {path}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("while working with persistent cursor")]
    Cursor(#[from] CursorError),
    #[error("failed to read {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("record queue was closed")]
    SinkClosed,
}

/// Reads appended content of one file and emits it as records, keeping a cursor in a sidecar file.
///
/// ## Usage
///
/// ```rust no_run
/// # use filetrail::{Format, RecordEmitter, Sinks, StartPosition, TailOptions, TailReader};
/// let (sinks, records, _status) = Sinks::unbounded();
/// let emitter = RecordEmitter::new("app", "message", Format::None);
/// let mut reader = TailReader::open("/var/log/app.log", emitter, sinks, TailOptions::default(), StartPosition::Tail)?;
/// reader.drain()?;
/// for record in records.try_iter() {
///     println!("{:?}", record.fields);
/// }
/// # Ok::<(), filetrail::TailError>(())
/// ```
///
/// ## Working principles
///
/// On open, the identity (device and inode) of the file is compared to the one stored in the sidecar `<path>.pos`.
/// If they match, reading continues where the previous run stopped, whatever start position was asked for. If they
/// differ, the file was replaced and reading starts at offset 0. The requested start position only matters for a
/// file seen for the first time.
///
/// Every read consumes up to one buffer of bytes. Bytes after the last newline are held back until a newline
/// terminates them, so a partial line is never emitted. The persisted offset is the end of the last emitted line,
/// which means a held back partial line is read again after a restart rather than lost.
pub struct TailReader {
    path: PathBuf,
    emitter: RecordEmitter,
    sinks: Sinks,
    options: TailOptions,
    identity: FileIdentity,
    position: u64,
    file: Option<File>,
    cursor: Option<CursorStore>,
    read_buf: Vec<u8>,
    lines: LineAssembler,
    unsaved_chunks: u32,
}

impl TailReader {
    /// Opens `path` and seeks to the resume point decided by the sidecar, or to `start` when there is none.
    pub fn open(
        path: impl AsRef<Path>,
        emitter: RecordEmitter,
        sinks: Sinks,
        options: TailOptions,
        start: StartPosition,
    ) -> Result<Self, TailError> {
        let path = resolve_absolute(path.as_ref()).map_err(|source| TailError::Open {
            path: path.as_ref().to_path_buf(),
            source,
        })?;
        let open_error = |source| TailError::Open {
            path: path.clone(),
            source,
        };
        let mut file = File::open(&path).map_err(open_error)?;
        let metadata = file.metadata().map_err(open_error)?;
        let identity = FileIdentity::from_metadata(&metadata);
        let size = metadata.len();

        let (cursor, resume) = CursorStore::open(&path, identity)?;
        let offset = match resume {
            Resume::Fresh => match start {
                StartPosition::Head => 0,
                StartPosition::Tail => size,
                StartPosition::At(offset) => offset.min(size),
            },
            Resume::Replaced { stored } => {
                info!(
                    path = %path.display(),
                    stored = ?stored.map(|identity| identity.to_string()),
                    %identity,
                    "file was replaced since last run, reading from the beginning"
                );
                0
            }
            Resume::Continue(offset) if offset > size => {
                warn!(
                    path = %path.display(),
                    stored_offset = offset,
                    size,
                    lost_bytes = offset - size,
                    "file shrank while not tailed, seeking to its end"
                );
                size
            }
            Resume::Continue(offset) => offset,
        };
        let position = file.seek(SeekFrom::Start(offset)).map_err(open_error)?;
        cursor.save(Cursor::new(identity, position))?;

        info!(path = %path.display(), offset = position, "seeked to resume offset");
        info!(path = %path.display(), %identity, "tracking file identity");

        let read_buf = vec![0; options.read_buffer_size.max(1)];
        Ok(Self {
            path,
            emitter,
            sinks,
            options,
            identity,
            position,
            file: Some(file),
            cursor: Some(cursor),
            read_buf,
            lines: LineAssembler::new(),
            unsaved_chunks: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn tag(&self) -> &str {
        self.emitter.tag()
    }

    /// Identity of the physical file captured at open
    pub fn identity(&self) -> FileIdentity {
        self.identity
    }

    /// Number of bytes read from the current file, including a held back partial line
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Offset right after the last emitted line; this is what gets persisted
    pub fn committed_offset(&self) -> u64 {
        self.position - self.lines.pending().len() as u64
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Performs one read and emits every line it completes. A closed reader is always at EOF.
    pub fn read_and_emit(&mut self) -> Result<ReadStatus, TailError> {
        let Some(file) = self.file.as_mut() else {
            return Ok(ReadStatus::AtEof);
        };
        let read = loop {
            match file.read(&mut self.read_buf) {
                Ok(read) => break read,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(source) => {
                    return Err(TailError::Read {
                        path: self.path.clone(),
                        source,
                    })
                }
            }
        };
        if read == 0 {
            return Ok(ReadStatus::AtEof);
        }
        self.position += read as u64;

        let Some(block) = self.lines.push(&self.read_buf[..read]) else {
            return Ok(ReadStatus::NeedMore);
        };
        let mut emitted = 0;
        for line in split_block(&block) {
            self.sinks
                .records
                .send(self.emitter.emit(line))
                .map_err(|_| TailError::SinkClosed)?;
            emitted += 1;
        }

        self.unsaved_chunks += 1;
        if self.unsaved_chunks >= self.options.persist_every {
            self.commit()?;
        }
        self.report();
        Ok(ReadStatus::Emitted(emitted))
    }

    /// Calls `read_and_emit` until EOF and persists the cursor. Returns the number of emitted records.
    pub fn drain(&mut self) -> Result<usize, TailError> {
        let mut total = 0;
        loop {
            match self.read_and_emit()? {
                ReadStatus::AtEof => break,
                ReadStatus::NeedMore => {}
                ReadStatus::Emitted(emitted) => total += emitted,
            }
        }
        if self.unsaved_chunks > 0 {
            self.commit()?;
        }
        Ok(total)
    }

    /// Seeks to the end of file if it became shorter than what was already read.
    ///
    /// Returns the number of bytes presumed lost. Those bytes, and a partial line held back from them, are never
    /// emitted.
    pub fn restrict_to_current_size(&mut self) -> Result<Option<u64>, TailError> {
        let Some(file) = self.file.as_mut() else {
            return Ok(None);
        };
        let read_error = |source| TailError::Read {
            path: self.path.clone(),
            source,
        };
        let size = file.metadata().map_err(read_error)?.len();
        if size >= self.position {
            return Ok(None);
        }
        let lost = self.position - size;
        self.position = file.seek(SeekFrom::Start(size)).map_err(read_error)?;
        let discarded = self.lines.discard_pending();
        warn!(
            path = %self.path.display(),
            offset = self.position,
            lost_bytes = lost,
            discarded_partial = discarded,
            "file was truncated, seeked to its new end"
        );
        self.commit()?;
        self.report();
        Ok(Some(lost))
    }

    /// Emits a held back partial line as a final record.
    ///
    /// Meant for a file that was rotated away: nothing written to the path from now on can terminate the line.
    pub fn flush_pending(&mut self) -> Result<bool, TailError> {
        let Some(fragment) = self.lines.take_pending() else {
            return Ok(false);
        };
        debug!(
            path = %self.path.display(),
            bytes = fragment.len(),
            "emitting unterminated last line"
        );
        self.sinks
            .records
            .send(self.emitter.emit(&fragment))
            .map_err(|_| TailError::SinkClosed)?;
        self.commit()?;
        self.report();
        Ok(true)
    }

    /// Persists the cursor and releases file and sidecar handles. `position` stays available.
    pub fn close(&mut self) -> Result<(), TailError> {
        if self.file.is_none() {
            return Ok(());
        }
        let saved = self.commit();
        self.file = None;
        self.cursor = None;
        saved
    }

    fn commit(&mut self) -> Result<(), TailError> {
        if let Some(cursor) = &self.cursor {
            cursor.save(Cursor::new(self.identity, self.committed_offset()))?;
        }
        self.unsaved_chunks = 0;
        Ok(())
    }

    fn report(&self) {
        // the monitor is optional, a dropped status queue is not an error
        let _ = self.sinks.status.send(StatusReport {
            path: self.path.clone(),
            tag: self.emitter.tag().to_string(),
            position: self.committed_offset(),
        });
    }
}

/// Persists the cursor if `.close()` was not called. Errors can only be logged here.
impl Drop for TailReader {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(path = %self.path.display(), error = %e, "failed to persist cursor on drop");
        }
    }
}
