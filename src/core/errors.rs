//! GPI-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

use crate::source::SourceKind;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, IngestError>;

/// Top-level error type for the ingestion pipeline.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("[GPI-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[GPI-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[GPI-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[GPI-2001] {0}")]
    Upstream(UpstreamError),

    #[error("[GPI-2002] no telemetry source is configured for preference {preference}")]
    NoSourceConfigured { preference: &'static str },

    #[error("[GPI-2101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[GPI-2501] SQL failure in {context}: {details}")]
    Sql {
        context: &'static str,
        details: String,
    },

    #[error(
        "[GPI-2502] positions write stopped at chunk {failed_chunk}/{chunks_total} \
         after {rows_committed} committed rows: {details}"
    )]
    PartialWrite {
        failed_chunk: usize,
        chunks_total: usize,
        rows_committed: usize,
        details: String,
    },

    #[error("[GPI-3001] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[GPI-3002] run lock at {path} is held by another run")]
    LockBusy { path: PathBuf },

    #[error("[GPI-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl IngestError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "GPI-1001",
            Self::MissingConfig { .. } => "GPI-1002",
            Self::ConfigParse { .. } => "GPI-1003",
            Self::Upstream(_) => "GPI-2001",
            Self::NoSourceConfigured { .. } => "GPI-2002",
            Self::Serialization { .. } => "GPI-2101",
            Self::Sql { .. } => "GPI-2501",
            Self::PartialWrite { .. } => "GPI-2502",
            Self::Io { .. } => "GPI-3001",
            Self::LockBusy { .. } => "GPI-3002",
            Self::Runtime { .. } => "GPI-3900",
        }
    }

    /// Who has to act on this error.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidConfig { .. }
            | Self::MissingConfig { .. }
            | Self::ConfigParse { .. }
            | Self::NoSourceConfigured { .. } => ErrorClass::Config,
            Self::Upstream(_) => ErrorClass::Upstream,
            Self::Sql { .. } | Self::PartialWrite { .. } => ErrorClass::Storage,
            Self::Serialization { .. } => ErrorClass::Internal,
            Self::Io { .. } | Self::LockBusy { .. } | Self::Runtime { .. } => {
                ErrorClass::Environment
            }
        }
    }

    /// Whether the next scheduled run might succeed without operator action.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Upstream(_)
                | Self::Sql { .. }
                | Self::PartialWrite { .. }
                | Self::Io { .. }
                | Self::LockBusy { .. }
                | Self::Runtime { .. }
        )
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

/// Coarse grouping of [`IngestError`] variants, used to pick an exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Bad or missing configuration, including asking for an unconfigured source.
    Config,
    /// Upstream provider failure.
    Upstream,
    /// SQLite write or read failure.
    Storage,
    /// Filesystem, lock, or other host failure.
    Environment,
    /// A bug: something that should always serialize did not.
    Internal,
}

/// Failure category for a single upstream call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamFailure {
    /// The per-call timeout elapsed.
    Timeout,
    /// Connection could not be established or was reset.
    Connect,
    /// Provider answered with a non-2xx status.
    Status,
    /// Body was not valid JSON.
    Decode,
    /// Body was JSON but neither an array nor `{ "positions": [...] }`.
    Malformed,
}

impl UpstreamFailure {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Connect => "connect",
            Self::Status => "status",
            Self::Decode => "decode",
            Self::Malformed => "malformed",
        }
    }
}

/// A failed call to one upstream provider. Recoverable by failover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamError {
    pub source: SourceKind,
    /// HTTP status when the provider answered at all.
    pub status: Option<u16>,
    pub kind: UpstreamFailure,
    pub details: String,
}

impl UpstreamError {
    #[must_use]
    pub fn new(source: SourceKind, kind: UpstreamFailure, details: impl Into<String>) -> Self {
        Self {
            source,
            status: None,
            kind,
            details: details.into(),
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} source {} failure", self.source, self.kind.as_str())?;
        if let Some(status) = self.status {
            write!(f, " (HTTP {status})")?;
        }
        if !self.details.is_empty() {
            write!(f, ": {}", self.details)?;
        }
        Ok(())
    }
}

impl std::error::Error for UpstreamError {}

impl From<UpstreamError> for IngestError {
    fn from(value: UpstreamError) -> Self {
        Self::Upstream(value)
    }
}

impl From<rusqlite::Error> for IngestError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sql {
            context: "rusqlite",
            details: value.to_string(),
        }
    }
}

impl From<serde_json::Error> for IngestError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for IngestError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}

impl From<reqwest::Error> for IngestError {
    fn from(value: reqwest::Error) -> Self {
        Self::Runtime {
            details: format!("http client: {value}"),
        }
    }
}
