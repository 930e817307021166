//! # Filetrail
//!
//! Filetrail follows log files the way log shippers like Fluentd's `in_tail` or Filebeat do: every complete line
//! appended to a file becomes a structured record, the read position survives restarts, and rotation or truncation
//! of the file is followed without losing or duplicating lines.
//!
//! * `CursorStore` keeps the identity (device and inode) of a file together with the offset read so far in a sidecar
//!   file `<path>.pos`, and decides where to resume on startup.
//!
//! ```rust no_run
//! # use filetrail::{CursorStore, Cursor, FileIdentity, Resume};
//! let live = FileIdentity::of_path("/var/log/app.log")?;
//! let (store, resume) = CursorStore::open("/var/log/app.log", live)?;
//! if let Resume::Continue(offset) = resume {
//!     println!("resuming at {offset}");
//! }
//! store.save(Cursor::new(live, 4096))?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! * `TailReader` reads appended content of one file, splits it into lines and delivers them as records, persisting
//!   the cursor as it goes.
//!
//! ```rust no_run
//! # use filetrail::{Format, RecordEmitter, Sinks, StartPosition, TailOptions, TailReader};
//! let (sinks, records, _status) = Sinks::unbounded();
//! let emitter = RecordEmitter::new("app", "message", Format::None);
//! let mut reader = TailReader::open("/var/log/app.log", emitter, sinks, TailOptions::default(), StartPosition::Head)?;
//! reader.drain()?;
//! assert!(records.try_iter().count() > 0);
//! # Ok::<(), filetrail::TailError>(())
//! ```
//!
//! * `RotationWatcher` subscribes to filesystem notifications for the directory of a file and keeps a `TailReader`
//!   attached to whatever file currently sits at the path.
//!
//! * `Agent` runs one `RotationWatcher` per configured file on its own thread.
//!

mod agent;
mod config;
mod cursor;
mod identity;
pub mod lines;
pub mod path_utils;
mod record;
mod tail;
mod watcher;

pub use agent::{Agent, AgentError, StatusBoard};
pub use config::{Config, ConfigError, LogConfig};
pub use cursor::{Cursor, CursorError, CursorStore, Resume};
pub use identity::{FileIdentity, ParseIdentityError};
pub use record::{Format, FormatError, FormatKind, Record, RecordEmitter, StatusReport, DEFAULT_FIELD_NAME};
pub use tail::{ReadStatus, Sinks, StartPosition, TailError, TailOptions, TailReader, DEFAULT_READ_BUFFER_SIZE};
pub use watcher::{RotationWatcher, Subscription, WatchError, WatchEvent};
