use std::{
    io,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use thiserror::Error;

use crate::{
    record::{Format, FormatError, FormatKind, RecordEmitter, DEFAULT_FIELD_NAME},
    tail::{TailOptions, DEFAULT_READ_BUFFER_SIZE},
};

/// Agent configuration, usually read from a TOML file.
///
/// ```toml
/// field_name = "message"
/// read_buffer_size = 65536
/// persist_every = 1
///
/// [[logs]]
/// file = "/var/log/nginx/access.log"
/// tag = "nginx.access"
/// format = "ltsv"
///
/// [[logs]]
/// file = "/var/log/app.log"
/// tag = "app"
/// format = "regexp"
/// regexp = '^(?P<level>\w+) (?P<msg>.*)$'
/// ```
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Field holding the raw line, unless a log overrides it
    #[serde(default = "default_field_name")]
    pub field_name: String,
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    /// Save cursors after every N-th emitting read
    #[serde(default = "default_persist_every")]
    pub persist_every: u32,
    #[serde(default)]
    pub logs: Vec<LogConfig>,
}

/// One tailed file
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    pub file: PathBuf,
    pub tag: String,
    pub field_name: Option<String>,
    #[serde(default)]
    pub format: FormatKind,
    pub regexp: Option<String>,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("couldn't read config file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("couldn't parse config file {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("no log files are configured")]
    NoLogs,
    #[error("log entry #{index} has an empty `{field}`")]
    Empty { index: usize, field: &'static str },
    #[error("`{0}` must be greater than zero")]
    Zero(&'static str),
    #[error("invalid format for {file}")]
    Format {
        file: PathBuf,
        #[source]
        source: FormatError,
    },
}

fn default_field_name() -> String {
    DEFAULT_FIELD_NAME.to_string()
}

fn default_read_buffer_size() -> usize {
    DEFAULT_READ_BUFFER_SIZE
}

fn default_persist_every() -> u32 {
    1
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Configuration for tailing `files` under a single tag, as given on the command line
    pub fn from_args(tag: &str, files: &[PathBuf], field_name: &str) -> Self {
        Self {
            field_name: field_name.to_string(),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            persist_every: 1,
            logs: files
                .iter()
                .map(|file| LogConfig {
                    file: file.clone(),
                    tag: tag.to_string(),
                    field_name: None,
                    format: FormatKind::None,
                    regexp: None,
                })
                .collect(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.logs.is_empty() {
            return Err(ConfigError::NoLogs);
        }
        if self.read_buffer_size == 0 {
            return Err(ConfigError::Zero("read_buffer_size"));
        }
        if self.persist_every == 0 {
            return Err(ConfigError::Zero("persist_every"));
        }
        for (index, log) in self.logs.iter().enumerate() {
            if log.file.as_os_str().is_empty() {
                return Err(ConfigError::Empty {
                    index,
                    field: "file",
                });
            }
            if log.tag.is_empty() {
                return Err(ConfigError::Empty { index, field: "tag" });
            }
            log.emitter(&self.field_name)?;
        }
        Ok(())
    }

    pub fn tail_options(&self) -> TailOptions {
        TailOptions {
            read_buffer_size: self.read_buffer_size,
            persist_every: self.persist_every,
        }
    }
}

impl LogConfig {
    /// Record emitter for this log, falling back to `default_field_name`
    pub fn emitter(&self, default_field_name: &str) -> Result<RecordEmitter, ConfigError> {
        let format =
            Format::build(self.format, self.regexp.as_deref()).map_err(|source| {
                ConfigError::Format {
                    file: self.file.clone(),
                    source,
                }
            })?;
        let field_name = self.field_name.as_deref().unwrap_or(default_field_name);
        Ok(RecordEmitter::new(&self.tag, field_name, format))
    }
}
