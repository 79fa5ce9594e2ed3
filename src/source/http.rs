//! Blocking HTTP client for one telemetry provider.

#![allow(missing_docs)]

use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::ACCEPT;
use serde_json::Value;

use crate::core::config::{PrimarySourceConfig, SecondarySourceConfig};
use crate::core::errors::{Result, UpstreamError, UpstreamFailure};
use crate::source::raw::{RawRecord, extract_records};
use crate::source::{SourceKind, TelemetrySource};

#[derive(Clone)]
struct BasicAuth {
    user: String,
    password: String,
}

/// `GET {base_url}{positions_path}[?deviceId=ID]` against one provider.
pub struct HttpSource {
    kind: SourceKind,
    url: String,
    auth: Option<BasicAuth>,
    timeout: Duration,
    client: Client,
}

impl std::fmt::Debug for HttpSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSource")
            .field("kind", &self.kind)
            .field("url", &self.url)
            .field("authenticated", &self.auth.is_some())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl HttpSource {
    /// Cache-backed provider; no credentials.
    pub fn primary(config: &PrimarySourceConfig) -> Result<Self> {
        Self::build(
            SourceKind::Primary,
            &config.base_url,
            &config.positions_path,
            None,
            Duration::from_secs(config.timeout_secs),
        )
    }

    /// Authoritative provider with basic auth.
    pub fn secondary(config: &SecondarySourceConfig) -> Result<Self> {
        Self::build(
            SourceKind::Secondary,
            &config.base_url,
            &config.positions_path,
            Some(BasicAuth {
                user: config.user.clone(),
                password: config.password.clone(),
            }),
            Duration::from_secs(config.timeout_secs),
        )
    }

    fn build(
        kind: SourceKind,
        base_url: &str,
        positions_path: &str,
        auth: Option<BasicAuth>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .user_agent(concat!("gpsi/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            kind,
            url: format!("{}{positions_path}", base_url.trim_end_matches('/')),
            auth,
            timeout,
            client,
        })
    }

    /// Fully-qualified positions URL (without query string).
    pub fn url(&self) -> &str {
        &self.url
    }

    fn transport_failure(&self, error: &reqwest::Error) -> UpstreamError {
        let kind = if error.is_timeout() {
            UpstreamFailure::Timeout
        } else if error.is_decode() {
            UpstreamFailure::Decode
        } else {
            UpstreamFailure::Connect
        };
        let details = if kind == UpstreamFailure::Timeout {
            format!("no response within {}s", self.timeout.as_secs())
        } else {
            error.to_string()
        };
        UpstreamError::new(self.kind, kind, details)
    }
}

impl TelemetrySource for HttpSource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn fetch_positions(&self, device_id: Option<i64>) -> std::result::Result<Vec<RawRecord>, UpstreamError> {
        let mut request = self.client.get(&self.url).header(ACCEPT, "application/json");
        if let Some(id) = device_id {
            request = request.query(&[("deviceId", id)]);
        }
        if let Some(auth) = &self.auth {
            request = request.basic_auth(&auth.user, Some(&auth.password));
        }

        let response = request
            .send()
            .map_err(|error| self.transport_failure(&error))?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamError::new(
                self.kind,
                UpstreamFailure::Status,
                status.canonical_reason().unwrap_or("non-success status"),
            )
            .with_status(status.as_u16()));
        }

        let body: Value = response.json().map_err(|error| {
            let mut failure = self.transport_failure(&error);
            if failure.kind == UpstreamFailure::Connect {
                failure.kind = UpstreamFailure::Decode;
            }
            failure.with_status(status.as_u16())
        })?;

        extract_records(body).ok_or_else(|| {
            UpstreamError::new(
                self.kind,
                UpstreamFailure::Malformed,
                "expected an array or an object with a positions array",
            )
            .with_status(status.as_u16())
        })
    }
}
