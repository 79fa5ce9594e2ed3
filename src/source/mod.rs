//! Upstream telemetry providers: wire shape, HTTP client, and failover fetch.

pub mod fetcher;
pub mod http;
pub mod raw;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::errors::UpstreamError;
use crate::source::raw::RawRecord;

/// Which upstream telemetry provider a call went to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Fast cache-backed provider.
    Primary,
    /// Authoritative tracking platform (credentialed).
    Secondary,
}

impl SourceKind {
    /// Stable lowercase label used in summaries and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator choice of which providers a run may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourcePreference {
    /// Primary first when configured, secondary on any primary failure.
    #[default]
    Auto,
    /// Primary only.
    Primary,
    /// Secondary only.
    Secondary,
}

impl SourcePreference {
    /// Stable lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }
}

impl FromStr for SourcePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "primary" => Ok(Self::Primary),
            "secondary" => Ok(Self::Secondary),
            other => Err(format!(
                "unknown source preference {other:?} (expected auto, primary or secondary)"
            )),
        }
    }
}

/// Whether a provider has enough configuration to be called at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SourceCapability {
    /// Base URL (and credentials, where required) are present.
    pub configured: bool,
}

/// Capability descriptor for both providers, computed once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SourceCapabilities {
    /// Cache-backed provider.
    pub primary: SourceCapability,
    /// Authoritative provider.
    pub secondary: SourceCapability,
}

impl SourceCapabilities {
    /// Capability of one provider.
    #[must_use]
    pub const fn of(&self, kind: SourceKind) -> SourceCapability {
        match kind {
            SourceKind::Primary => self.primary,
            SourceKind::Secondary => self.secondary,
        }
    }
}

/// A provider that can list current positions.
///
/// Implementations must bound every call by their own timeout; an `Err` is
/// always recoverable from the pipeline's point of view.
pub trait TelemetrySource {
    /// Which slot this provider fills.
    fn kind(&self) -> SourceKind;

    /// Fetch raw records, optionally constrained to one device.
    fn fetch_positions(&self, device_id: Option<i64>) -> Result<Vec<RawRecord>, UpstreamError>;
}
