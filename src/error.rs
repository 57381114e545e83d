//! Error taxonomy for the harmonization pipeline.
//!
//! [`ConfigError`] and [`DecodeError`] abort a source run before anything is
//! submitted. [`MappingError`] is scoped to one record and only ever lands in
//! the run report. [`BrokerError`] separates retryable broker trouble from
//! terminal rejections.

use thiserror::Error;

use crate::model::RecordKind;

/// Fatal configuration problems, raised before any I/O against the broker.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("no context model configured for record kind '{0}'")]
    UnresolvedKind(RecordKind),

    #[error("malformed model definition in {path}: {reason}")]
    MalformedModel { path: String, reason: String },

    #[error("duplicate model for record kind '{kind}' in {layer} definitions")]
    DuplicateModel { kind: RecordKind, layer: &'static str },

    #[error("invalid pipeline configuration: {0}")]
    Invalid(String),

    #[error("unknown data source '{0}'")]
    UnknownSource(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Fatal for a single bundle or feed: the input cannot be read at all.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("failed to fetch {location}: {reason}")]
    Fetch { location: String, reason: String },

    #[error("unreadable archive: {0}")]
    Archive(String),

    #[error("missing mandatory table {0}")]
    MissingTable(&'static str),

    #[error("failed to read table {table}: {reason}")]
    Table { table: &'static str, reason: String },

    #[error("malformed feed message: {0}")]
    Protobuf(#[from] prost::DecodeError),

    #[error("feed header has no usable timestamp")]
    MissingTimestamp,

    #[error("unsupported gtfs_realtime_version '{0}'")]
    UnsupportedVersion(String),

    #[error("malformed entity document: {0}")]
    Document(String),
}

/// Per-record failures. Recorded in the run report and skipped, never fatal.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MappingError {
    #[error("missing mandatory attribute: {0}")]
    MissingAttribute(String),

    #[error("empty mandatory attribute: {0}")]
    EmptyAttribute(String),

    #[error("invalid value for attribute {attribute}: {reason}")]
    InvalidValue { attribute: String, reason: String },

    #[error("record has no native key")]
    MissingKey,

    #[error("record kind '{found}' does not match model for '{expected}'")]
    KindMismatch {
        expected: RecordKind,
        found: RecordKind,
    },
}

/// Errors surfaced by a context broker implementation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BrokerError {
    /// Broker unreachable, timed out or answered 5xx. Retried with backoff.
    #[error("broker unavailable: {0}")]
    Transient(String),

    /// Broker refused the request as a whole (4xx). Never retried.
    #[error("broker rejected request ({status}): {reason}")]
    Rejected { status: u16, reason: String },
}

impl BrokerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Transient(_))
    }

    /// Classifies an HTTP status the way the NGSI-LD API uses it: 5xx and 429
    /// are worth retrying, any other non-success status is final.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        if status >= 500 || status == 429 {
            BrokerError::Transient(format!("status {status}: {}", body.into()))
        } else {
            BrokerError::Rejected {
                status,
                reason: body.into(),
            }
        }
    }
}

/// Anything that aborts a single source run before loading starts.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("worker task failed: {0}")]
    Task(String),
}

impl From<reqwest::Error> for BrokerError {
    fn from(err: reqwest::Error) -> Self {
        // connection resets, timeouts and body read failures are all worth another try
        BrokerError::Transient(err.to_string())
    }
}
