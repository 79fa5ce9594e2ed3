//! Failover fetch across the primary and secondary providers.
//!
//! Provider selection is pure: [`attempt_plan`] turns a preference and the
//! startup capability descriptor into an ordered list of providers. The
//! fetcher then walks that list. In `auto` mode every upstream failure falls
//! through to the next provider, and running out of providers is "no data
//! this cycle" rather than an error. Explicit modes surface transport failures
//! so an operator forcing one provider sees why it did not answer.

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::core::config::Config;
use crate::core::errors::{IngestError, Result, UpstreamError, UpstreamFailure};
use crate::source::http::HttpSource;
use crate::source::raw::RawRecord;
use crate::source::{SourceCapabilities, SourceCapability, SourceKind, SourcePreference, TelemetrySource};

/// Result of one provider call, kept for the run log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchAttempt {
    pub source: SourceKind,
    /// Records returned; `None` when the call failed.
    pub records: Option<usize>,
    /// Failure category when the call failed.
    pub failure: Option<&'static str>,
    pub status: Option<u16>,
    pub error: Option<String>,
    #[serde(serialize_with = "serialize_millis")]
    pub elapsed: Duration,
}

impl FetchAttempt {
    fn succeeded(source: SourceKind, records: usize, elapsed: Duration) -> Self {
        Self {
            source,
            records: Some(records),
            failure: None,
            status: None,
            error: None,
            elapsed,
        }
    }

    fn failed(error: &UpstreamError, elapsed: Duration) -> Self {
        Self {
            source: error.source,
            records: None,
            failure: Some(error.kind.as_str()),
            status: error.status,
            error: Some(error.to_string()),
            elapsed,
        }
    }

    /// Whether the provider answered with a usable payload.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.records.is_some()
    }
}

fn serialize_millis<S: serde::Serializer>(value: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
}

/// Records from the provider that answered, plus the attempt trail.
#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    pub records: Vec<RawRecord>,
    /// Provider whose payload was used; `None` means no provider answered.
    pub source: Option<SourceKind>,
    pub attempts: Vec<FetchAttempt>,
}

/// Fetch failure in an explicit (non-auto) mode, with the attempt trail.
#[derive(Debug)]
pub struct FetchError {
    pub error: IngestError,
    pub attempts: Vec<FetchAttempt>,
}

/// Ordered providers to try for a preference.
///
/// Unconfigured providers are never attempted. An explicit preference for an
/// unconfigured provider yields an empty plan.
#[must_use]
pub fn attempt_plan(preference: SourcePreference, caps: SourceCapabilities) -> Vec<SourceKind> {
    let candidates: &[SourceKind] = match preference {
        SourcePreference::Auto => &[SourceKind::Primary, SourceKind::Secondary],
        SourcePreference::Primary => &[SourceKind::Primary],
        SourcePreference::Secondary => &[SourceKind::Secondary],
    };
    candidates
        .iter()
        .copied()
        .filter(|kind| caps.of(*kind).configured)
        .collect()
}

/// Owns the configured providers and applies the failover policy.
pub struct SourceFetcher {
    primary: Option<Box<dyn TelemetrySource>>,
    secondary: Option<Box<dyn TelemetrySource>>,
    capabilities: SourceCapabilities,
}

impl SourceFetcher {
    /// Build HTTP providers for whatever the config enables.
    pub fn from_config(config: &Config) -> Result<Self> {
        let caps = config.capabilities();
        let primary: Option<Box<dyn TelemetrySource>> = if caps.primary.configured {
            Some(Box::new(HttpSource::primary(&config.primary)?))
        } else {
            None
        };
        let secondary: Option<Box<dyn TelemetrySource>> = if caps.secondary.configured {
            Some(Box::new(HttpSource::secondary(&config.secondary)?))
        } else {
            None
        };
        Ok(Self::new(primary, secondary))
    }

    /// Wire arbitrary providers; capability follows presence.
    #[must_use]
    pub fn new(
        primary: Option<Box<dyn TelemetrySource>>,
        secondary: Option<Box<dyn TelemetrySource>>,
    ) -> Self {
        let capabilities = SourceCapabilities {
            primary: SourceCapability {
                configured: primary.is_some(),
            },
            secondary: SourceCapability {
                configured: secondary.is_some(),
            },
        };
        Self {
            primary,
            secondary,
            capabilities,
        }
    }

    #[must_use]
    pub const fn capabilities(&self) -> SourceCapabilities {
        self.capabilities
    }

    fn provider(&self, kind: SourceKind) -> Option<&dyn TelemetrySource> {
        match kind {
            SourceKind::Primary => self.primary.as_deref(),
            SourceKind::Secondary => self.secondary.as_deref(),
        }
    }

    /// Fetch raw records under `preference`.
    ///
    /// `on_attempt` sees each provider call as it finishes.
    pub fn fetch(
        &self,
        preference: SourcePreference,
        device_id: Option<i64>,
        mut on_attempt: impl FnMut(&FetchAttempt),
    ) -> std::result::Result<FetchOutcome, FetchError> {
        let plan = attempt_plan(preference, self.capabilities);
        let mut attempts = Vec::with_capacity(plan.len());

        if plan.is_empty() && preference != SourcePreference::Auto {
            return Err(FetchError {
                error: IngestError::NoSourceConfigured {
                    preference: preference.as_str(),
                },
                attempts,
            });
        }

        let mut last_error = None;
        for kind in plan {
            let Some(provider) = self.provider(kind) else {
                continue;
            };
            let started = Instant::now();
            match provider.fetch_positions(device_id) {
                Ok(records) => {
                    let attempt = FetchAttempt::succeeded(kind, records.len(), started.elapsed());
                    on_attempt(&attempt);
                    attempts.push(attempt);
                    return Ok(FetchOutcome {
                        records,
                        source: Some(kind),
                        attempts,
                    });
                }
                Err(error) => {
                    let attempt = FetchAttempt::failed(&error, started.elapsed());
                    on_attempt(&attempt);
                    attempts.push(attempt);
                    last_error = Some(error);
                }
            }
        }

        match (preference, last_error) {
            (SourcePreference::Auto, _) | (_, None) => Ok(FetchOutcome {
                records: Vec::new(),
                source: None,
                attempts,
            }),
            (_, Some(error)) if error.kind == UpstreamFailure::Malformed => Ok(FetchOutcome {
                records: Vec::new(),
                source: Some(error.source),
                attempts,
            }),
            (_, Some(error)) => Err(FetchError {
                error: IngestError::Upstream(error),
                attempts,
            }),
        }
    }
}
