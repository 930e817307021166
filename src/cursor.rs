use std::{
    fs::File,
    io::{self, Read, Seek, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use thiserror::Error;

use crate::{identity::FileIdentity, path_utils::position_path};

/// Position inside one physical file, as persisted in the sidecar
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Cursor {
    pub identity: FileIdentity,
    pub offset: u64,
}

impl Cursor {
    pub fn new(identity: FileIdentity, offset: u64) -> Self {
        Self { identity, offset }
    }

    /// Sidecar text record, `"<identity>\t<offset>\n"`
    pub fn encode(&self) -> String {
        format!("{}\t{}\n", self.identity, self.offset)
    }

    /// Parse a sidecar text record.
    ///
    /// The record must be exactly one newline-terminated line. A save cut short by a crash can leave bytes of a
    /// longer previous record behind the new one; such content is rejected rather than read as another offset.
    pub fn decode(text: &str) -> Option<Self> {
        let line = text.strip_suffix('\n')?;
        if line.contains('\n') {
            return None;
        }
        let (identity, offset) = line.split_once('\t')?;
        Some(Self {
            identity: identity.parse().ok()?,
            offset: offset.parse().ok()?,
        })
    }
}

/// Possible errors that could happen while working with a sidecar file
#[derive(Error, Debug)]
pub enum CursorError {
    #[error("while working with sidecar file {path}")]
    IO {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("sidecar lock for {0} was poisoned")]
    Poisoned(PathBuf),
}

/// Where to resume reading, decided from the sidecar found at open time
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Resume {
    /// There was no sidecar (or it was empty). Caller decides the start position.
    Fresh,
    /// Sidecar belongs to a different physical file. Reading starts over at offset 0.
    Replaced { stored: Option<FileIdentity> },
    /// Sidecar matches the live file. Reading continues from the stored offset.
    Continue(u64),
}

/// Durable store for the cursor of exactly one tailed file.
///
/// The sidecar lives next to the tailed file as `<path>.pos` and holds a single text record. Every access goes
/// through a lock owned by this store, so a store is never shared between unrelated files.
///
/// ```rust no_run
/// # use filetrail::{CursorStore, Cursor, FileIdentity, Resume};
/// let live = FileIdentity::of_path("/var/log/app.log")?;
/// let (store, resume) = CursorStore::open("/var/log/app.log", live)?;
/// if let Resume::Continue(offset) = resume {
///     println!("resuming at {offset}");
/// }
/// store.save(Cursor::new(live, 128))?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug)]
pub struct CursorStore {
    path: PathBuf,
    file: Mutex<File>,
}

impl CursorStore {
    /// Opens (creating if needed) the sidecar of `target` and applies the resume policy against `live`.
    ///
    /// A missing or empty sidecar is initialized with `(live, 0)`. A sidecar for another identity is rewritten to
    /// `(live, 0)` right away, so a crash before the first save cannot resurrect the stale offset.
    pub fn open(
        target: impl AsRef<Path>,
        live: FileIdentity,
    ) -> Result<(Self, Resume), CursorError> {
        let path = position_path(target);
        let file = open_sidecar(&path).map_err(|source| CursorError::IO {
            path: path.clone(),
            source,
        })?;
        let store = Self {
            path,
            file: Mutex::new(file),
        };

        let resume = match store.read_raw()? {
            None => {
                store.save(Cursor::new(live, 0))?;
                Resume::Fresh
            }
            Some(text) => match Cursor::decode(&text) {
                Some(stored) if stored.identity == live => Resume::Continue(stored.offset),
                stored => {
                    if stored.is_none() {
                        tracing::warn!(
                            sidecar = %store.path.display(),
                            content = %text.escape_debug(),
                            "malformed sidecar, starting over"
                        );
                    }
                    store.save(Cursor::new(live, 0))?;
                    Resume::Replaced {
                        stored: stored.map(|cursor| cursor.identity),
                    }
                }
            },
        };
        Ok((store, resume))
    }

    /// Path of the sidecar file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the currently persisted cursor, if the sidecar holds a well-formed one
    pub fn load(&self) -> Result<Option<Cursor>, CursorError> {
        Ok(self.read_raw()?.as_deref().and_then(Cursor::decode))
    }

    /// Overwrite the sidecar with `cursor`. The write is synchronous and leaves no trailing bytes of a longer
    /// previous record behind.
    pub fn save(&self, cursor: Cursor) -> Result<(), CursorError> {
        let mut file = self.lock()?;
        let record = cursor.encode();
        let write = |file: &mut File| -> io::Result<()> {
            file.rewind()?;
            file.write_all(record.as_bytes())?;
            file.set_len(record.len() as u64)?;
            file.flush()
        };
        write(&mut file).map_err(|source| self.io_error(source))
    }

    fn read_raw(&self) -> Result<Option<String>, CursorError> {
        let mut file = self.lock()?;
        let mut text = String::new();
        let read = |file: &mut File, text: &mut String| -> io::Result<()> {
            file.rewind()?;
            file.read_to_string(text)?;
            Ok(())
        };
        read(&mut file, &mut text).map_err(|source| self.io_error(source))?;
        if text.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(text))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, File>, CursorError> {
        self.file
            .lock()
            .map_err(|_| CursorError::Poisoned(self.path.clone()))
    }

    fn io_error(&self, source: io::Error) -> CursorError {
        CursorError::IO {
            path: self.path.clone(),
            source,
        }
    }
}

fn open_sidecar(path: &Path) -> io::Result<File> {
    File::options()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}
