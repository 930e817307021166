use std::path::PathBuf;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Field name used for the raw line when none is configured
pub const DEFAULT_FIELD_NAME: &str = "message";

/// Name of a format as it appears in configuration
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatKind {
    #[default]
    None,
    Ltsv,
    Json,
    Regexp,
}

/// Rule turning a raw line into record fields
#[derive(Clone, Debug, Default)]
pub enum Format {
    /// Raw line under the configured field name
    #[default]
    None,
    /// Tab separated `label:value` pairs
    Ltsv,
    /// One JSON object per line
    Json,
    /// Named capture groups of a regular expression
    Regexp(Regex),
}

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("format `regexp` requires a pattern")]
    MissingPattern,
    #[error("invalid regexp pattern")]
    InvalidPattern(#[from] regex::Error),
    #[error("regexp pattern `{0}` has no named capture group, use (?P<name>...)")]
    NoNamedGroups(String),
}

impl Format {
    /// Build a format from its configured kind and optional pattern
    pub fn build(kind: FormatKind, pattern: Option<&str>) -> Result<Self, FormatError> {
        match kind {
            FormatKind::None => Ok(Format::None),
            FormatKind::Ltsv => Ok(Format::Ltsv),
            FormatKind::Json => Ok(Format::Json),
            FormatKind::Regexp => {
                let pattern = pattern.ok_or(FormatError::MissingPattern)?;
                let regex = Regex::new(pattern)?;
                if regex.capture_names().flatten().next().is_none() {
                    return Err(FormatError::NoNamedGroups(pattern.to_string()));
                }
                Ok(Format::Regexp(regex))
            }
        }
    }

    /// Extract fields from `line`. `None` means the line does not fit the format.
    fn extract(&self, line: &str) -> Option<Map<String, Value>> {
        match self {
            Format::None => None,
            Format::Ltsv => {
                let fields: Map<String, Value> = line
                    .split('\t')
                    .filter_map(|item| item.split_once(':'))
                    .map(|(label, value)| (label.to_string(), Value::String(value.to_string())))
                    .collect();
                (!fields.is_empty()).then_some(fields)
            }
            Format::Json => match serde_json::from_str(line) {
                Ok(Value::Object(fields)) => Some(fields),
                _ => None,
            },
            Format::Regexp(regex) => {
                let captures = regex.captures(line)?;
                let fields = regex
                    .capture_names()
                    .flatten()
                    .filter_map(|name| {
                        captures
                            .name(name)
                            .map(|m| (name.to_string(), Value::String(m.as_str().to_string())))
                    })
                    .collect();
                Some(fields)
            }
        }
    }
}

/// Structured record produced for every emitted line
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Record {
    pub tag: String,
    /// unix seconds at emission
    pub time: i64,
    pub fields: Map<String, Value>,
}

/// Position of one tailed file at a point in time, for the monitor
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub path: PathBuf,
    pub tag: String,
    pub position: u64,
}

/// Builds records for lines of one tailed file
#[derive(Clone, Debug)]
pub struct RecordEmitter {
    tag: String,
    field_name: String,
    format: Format,
}

impl RecordEmitter {
    pub fn new(tag: impl Into<String>, field_name: impl Into<String>, format: Format) -> Self {
        Self {
            tag: tag.into(),
            field_name: field_name.into(),
            format,
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn field_name(&self) -> &str {
        &self.field_name
    }

    pub fn emit(&self, line: &[u8]) -> Record {
        self.emit_at(line, chrono::Utc::now().timestamp())
    }

    /// Lines that do not fit the format are kept whole under the field name
    pub fn emit_at(&self, line: &[u8], time: i64) -> Record {
        let line = String::from_utf8_lossy(line);
        let fields = self.format.extract(&line).unwrap_or_else(|| {
            let mut fields = Map::new();
            fields.insert(self.field_name.clone(), Value::String(line.into_owned()));
            fields
        });
        Record {
            tag: self.tag.clone(),
            time,
            fields,
        }
    }
}
