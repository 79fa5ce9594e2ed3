//! Configuration system: TOML file + env var overrides + smart defaults.
//!
//! The loaded [`Config`] is passed explicitly into the pipeline; nothing below
//! the CLI reads the process environment.

#![allow(missing_docs)]

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::errors::{IngestError, Result};
use crate::source::{SourceCapabilities, SourceCapability};
use crate::store::LatestWritePolicy;

const MAX_TIMEOUT_SECS: u64 = 300;
const MAX_CHUNK_SIZE: usize = 10_000;
const REDACTED: &str = "********";

/// Full gpsi configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Config {
    pub primary: PrimarySourceConfig,
    pub secondary: SecondarySourceConfig,
    pub store: StoreConfig,
    pub schedule: ScheduleConfig,
    pub paths: PathsConfig,
}

/// Fast cache-backed provider. Disabled when `base_url` is empty.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PrimarySourceConfig {
    pub base_url: String,
    pub positions_path: String,
    pub timeout_secs: u64,
}

/// Authoritative tracking platform. Disabled unless URL and both credentials are set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SecondarySourceConfig {
    pub base_url: String,
    pub user: String,
    pub password: String,
    pub positions_path: String,
    pub timeout_secs: u64,
}

/// Persistence knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    /// Maximum rows per positions upsert transaction.
    pub chunk_size: usize,
    /// How the latest projection treats an incoming row older than the stored one.
    pub latest_policy: LatestWritePolicy,
}

/// Period of the built-in daemon loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScheduleConfig {
    pub interval_secs: u64,
}

/// Filesystem paths used by gpsi.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub config_file: PathBuf,
    pub sqlite_db: PathBuf,
    pub jsonl_log: PathBuf,
    pub lock_file: PathBuf,
}

impl Default for PrimarySourceConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            positions_path: "/positions".to_string(),
            timeout_secs: 15,
        }
    }
}

impl Default for SecondarySourceConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            user: String::new(),
            password: String::new(),
            positions_path: "/positions".to_string(),
            timeout_secs: 15,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1_000,
            latest_policy: LatestWritePolicy::Overwrite,
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let home_dir = env::var_os("HOME").map_or_else(
            || {
                eprintln!(
                    "[GPI-CONFIG] WARNING: HOME not set, falling back to /tmp for data paths"
                );
                PathBuf::from("/tmp")
            },
            PathBuf::from,
        );
        let cfg = home_dir.join(".config").join("gpsi").join("config.toml");
        let data = home_dir.join(".local").join("share").join("gpsi");
        Self {
            config_file: cfg,
            sqlite_db: data.join("positions.sqlite3"),
            jsonl_log: data.join("runs.jsonl"),
            lock_file: data.join("ingest.lock"),
        }
    }
}

impl Config {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathsConfig::default().config_file
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with(path, env_var)
    }

    /// Same as [`Config::load`] with an injected env lookup.
    pub fn load_with<F>(path: Option<&Path>, lookup: F) -> Result<Self>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);
        let is_explicit_path = path.is_some();

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf).map_err(|source| IngestError::Io {
                path: path_buf.clone(),
                source,
            })?;
            let parsed: Self = toml::from_str(&raw)?;
            parsed
        } else if is_explicit_path {
            return Err(IngestError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.paths.config_file = path_buf;
        cfg.apply_env_overrides_from(lookup)?;
        cfg.normalize_urls();
        cfg.validate()?;
        cfg.warn_partial_secondary();
        Ok(cfg)
    }

    /// Provider capabilities, computed once from the effective config.
    #[must_use]
    pub fn capabilities(&self) -> SourceCapabilities {
        SourceCapabilities {
            primary: SourceCapability {
                configured: !self.primary.base_url.is_empty(),
            },
            secondary: SourceCapability {
                configured: !self.secondary.base_url.is_empty()
                    && !self.secondary.user.is_empty()
                    && !self.secondary.password.is_empty(),
            },
        }
    }

    /// A secondary with a URL but missing credentials is disabled, not rejected.
    fn warn_partial_secondary(&self) {
        let sec = &self.secondary;
        if !sec.base_url.is_empty() && (sec.user.is_empty() || sec.password.is_empty()) {
            eprintln!(
                "[GPI-CONFIG] WARNING: secondary.base_url is set but user/password is missing; \
                 secondary source disabled"
            );
        }
    }

    /// Copy with credentials masked, for display.
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.secondary.password.is_empty() {
            copy.secondary.password = REDACTED.to_string();
        }
        copy
    }

    /// Deterministic hash of the effective config for run events.
    ///
    /// FNV-1a over canonical JSON of the redacted config, so the hash is stable
    /// across processes and never derived from the password.
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(&self.redacted())?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        // primary
        set_string(&mut lookup, "GPI_PRIMARY_BASE_URL", &mut self.primary.base_url);
        set_string(
            &mut lookup,
            "GPI_PRIMARY_POSITIONS_PATH",
            &mut self.primary.positions_path,
        );
        set_u64(
            &mut lookup,
            "GPI_PRIMARY_TIMEOUT_SECS",
            &mut self.primary.timeout_secs,
        )?;

        // secondary
        set_string(
            &mut lookup,
            "GPI_SECONDARY_BASE_URL",
            &mut self.secondary.base_url,
        );
        set_string(&mut lookup, "GPI_SECONDARY_USER", &mut self.secondary.user);
        set_string(
            &mut lookup,
            "GPI_SECONDARY_PASSWORD",
            &mut self.secondary.password,
        );
        set_string(
            &mut lookup,
            "GPI_SECONDARY_POSITIONS_PATH",
            &mut self.secondary.positions_path,
        );
        set_u64(
            &mut lookup,
            "GPI_SECONDARY_TIMEOUT_SECS",
            &mut self.secondary.timeout_secs,
        )?;

        // store
        set_usize(&mut lookup, "GPI_STORE_CHUNK_SIZE", &mut self.store.chunk_size)?;
        if let Some(raw) = lookup_non_empty(&mut lookup, "GPI_STORE_LATEST_POLICY") {
            self.store.latest_policy = raw.trim().parse::<LatestWritePolicy>().map_err(|details| {
                IngestError::ConfigParse {
                    context: "env",
                    details: format!("GPI_STORE_LATEST_POLICY={raw:?}: {details}"),
                }
            })?;
        }

        // schedule
        set_u64(
            &mut lookup,
            "GPI_SCHEDULE_INTERVAL_SECS",
            &mut self.schedule.interval_secs,
        )?;

        // paths
        set_path(&mut lookup, "GPI_SQLITE_DB", &mut self.paths.sqlite_db);
        set_path(&mut lookup, "GPI_JSONL_LOG", &mut self.paths.jsonl_log);
        set_path(&mut lookup, "GPI_LOCK_FILE", &mut self.paths.lock_file);

        Ok(())
    }

    /// Trim whitespace and trailing slashes so URL joins are predictable.
    fn normalize_urls(&mut self) {
        for url in [&mut self.primary.base_url, &mut self.secondary.base_url] {
            let trimmed = url.trim().trim_end_matches('/').to_string();
            *url = trimmed;
        }
        for path in [
            &mut self.primary.positions_path,
            &mut self.secondary.positions_path,
        ] {
            if !path.starts_with('/') {
                path.insert(0, '/');
            }
        }
    }

    fn validate(&self) -> Result<()> {
        for (name, url) in [
            ("primary.base_url", &self.primary.base_url),
            ("secondary.base_url", &self.secondary.base_url),
        ] {
            if !url.is_empty() && !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(IngestError::InvalidConfig {
                    details: format!("{name} must start with http:// or https://, got {url:?}"),
                });
            }
        }

        for (name, secs) in [
            ("primary.timeout_secs", self.primary.timeout_secs),
            ("secondary.timeout_secs", self.secondary.timeout_secs),
        ] {
            if !(1..=MAX_TIMEOUT_SECS).contains(&secs) {
                return Err(IngestError::InvalidConfig {
                    details: format!("{name} must be in [1, {MAX_TIMEOUT_SECS}], got {secs}"),
                });
            }
        }

        if !(1..=MAX_CHUNK_SIZE).contains(&self.store.chunk_size) {
            return Err(IngestError::InvalidConfig {
                details: format!(
                    "store.chunk_size must be in [1, {MAX_CHUNK_SIZE}], got {}",
                    self.store.chunk_size
                ),
            });
        }

        if self.schedule.interval_secs == 0 {
            return Err(IngestError::InvalidConfig {
                details: "schedule.interval_secs must be >= 1".to_string(),
            });
        }

        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok()
}

fn lookup_non_empty<F>(lookup: &mut F, name: &str) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(name).filter(|raw| !raw.trim().is_empty())
}

fn set_string<F>(lookup: &mut F, name: &str, slot: &mut String)
where
    F: FnMut(&str) -> Option<String>,
{
    if let Some(raw) = lookup_non_empty(lookup, name) {
        *slot = raw;
    }
}

fn set_path<F>(lookup: &mut F, name: &str, slot: &mut PathBuf)
where
    F: FnMut(&str) -> Option<String>,
{
    if let Some(raw) = lookup_non_empty(lookup, name) {
        *slot = PathBuf::from(raw);
    }
}

fn set_u64<F>(lookup: &mut F, name: &str, slot: &mut u64) -> Result<()>
where
    F: FnMut(&str) -> Option<String>,
{
    if let Some(raw) = lookup_non_empty(lookup, name) {
        *slot = raw.trim().parse::<u64>().map_err(|error| IngestError::ConfigParse {
            context: "env",
            details: format!("{name}={raw:?}: {error}"),
        })?;
    }
    Ok(())
}

fn set_usize<F>(lookup: &mut F, name: &str, slot: &mut usize) -> Result<()>
where
    F: FnMut(&str) -> Option<String>,
{
    if let Some(raw) = lookup_non_empty(lookup, name) {
        *slot = raw
            .trim()
            .parse::<usize>()
            .map_err(|error| IngestError::ConfigParse {
                context: "env",
                details: format!("{name}={raw:?}: {error}"),
            })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{Config, IngestError, LatestWritePolicy};
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(name, value)| ((*name).to_string(), (*value).to_string()))
            .collect()
    }

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn default_config_is_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.store.chunk_size, 1_000);
        assert_eq!(cfg.primary.timeout_secs, 15);
        assert_eq!(cfg.store.latest_policy, LatestWritePolicy::Overwrite);
    }

    #[test]
    fn default_config_has_no_configured_source() {
        let caps = Config::default().capabilities();
        assert!(!caps.primary.configured);
        assert!(!caps.secondary.configured);
    }

    #[test]
    fn secondary_requires_url_and_credentials() {
        let mut cfg = Config::default();
        cfg.secondary.base_url = "https://tracker.example".to_string();
        assert!(!cfg.capabilities().secondary.configured);

        cfg.secondary.user = "ops".to_string();
        cfg.secondary.password = "secret".to_string();
        assert!(cfg.capabilities().secondary.configured);
    }

    #[test]
    fn env_overrides_fill_sources() {
        let mut cfg = Config::default();
        let overrides = vars(&[
            ("GPI_PRIMARY_BASE_URL", "http://cache:5000/api/traccar/"),
            ("GPI_SECONDARY_BASE_URL", "https://demo.tracker.example/api"),
            ("GPI_SECONDARY_USER", "ops"),
            ("GPI_SECONDARY_PASSWORD", "pw"),
            ("GPI_STORE_CHUNK_SIZE", "250"),
            ("GPI_STORE_LATEST_POLICY", "newer_only"),
        ]);

        cfg.apply_env_overrides_from(|name| overrides.get(name).cloned())
            .expect("env overrides should parse");
        cfg.normalize_urls();

        assert_eq!(cfg.primary.base_url, "http://cache:5000/api/traccar");
        assert_eq!(cfg.store.chunk_size, 250);
        assert_eq!(cfg.store.latest_policy, LatestWritePolicy::NewerOnly);
        let caps = cfg.capabilities();
        assert!(caps.primary.configured);
        assert!(caps.secondary.configured);
    }

    #[test]
    fn empty_env_values_are_ignored() {
        let mut cfg = Config::default();
        cfg.primary.base_url = "http://cache:5000".to_string();
        let overrides = vars(&[("GPI_PRIMARY_BASE_URL", "   ")]);
        cfg.apply_env_overrides_from(|name| overrides.get(name).cloned())
            .expect("blank values are skipped");
        assert_eq!(cfg.primary.base_url, "http://cache:5000");
    }

    #[test]
    fn invalid_numeric_env_rejected() {
        let mut cfg = Config::default();
        let overrides = vars(&[("GPI_PRIMARY_TIMEOUT_SECS", "soon")]);
        let err = cfg
            .apply_env_overrides_from(|name| overrides.get(name).cloned())
            .expect_err("non-numeric timeout should fail");
        match err {
            IngestError::ConfigParse { context, details } => {
                assert_eq!(context, "env");
                assert!(details.contains("GPI_PRIMARY_TIMEOUT_SECS"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unknown_latest_policy_rejected() {
        let mut cfg = Config::default();
        let overrides = vars(&[("GPI_STORE_LATEST_POLICY", "sometimes")]);
        assert!(
            cfg.apply_env_overrides_from(|name| overrides.get(name).cloned())
                .is_err()
        );
    }

    #[test]
    fn zero_chunk_size_rejected() {
        let mut cfg = Config::default();
        cfg.store.chunk_size = 0;
        let err = cfg.validate().expect_err("expected chunk size error");
        assert!(err.to_string().contains("chunk_size"));
    }

    #[test]
    fn timeout_out_of_range_rejected() {
        let mut cfg = Config::default();
        cfg.secondary.timeout_secs = 0;
        let err = cfg.validate().expect_err("expected timeout error");
        assert!(err.to_string().contains("secondary.timeout_secs"));
    }

    #[test]
    fn non_http_base_url_rejected() {
        let mut cfg = Config::default();
        cfg.primary.base_url = "ftp://cache".to_string();
        let err = cfg.validate().expect_err("expected url error");
        assert!(err.to_string().contains("primary.base_url"));
    }

    #[test]
    fn half_configured_secondary_is_disabled_not_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[primary]\nbase_url = \"http://cache:5000\"\n\n\
             [secondary]\nbase_url = \"https://tracker\"\nuser = \"ops\"\n",
        )
        .expect("write config");

        let cfg = Config::load_with(Some(path.as_path()), no_env).expect("config should load");
        let caps = cfg.capabilities();
        assert!(caps.primary.configured);
        assert!(!caps.secondary.configured);

        let overrides = vars(&[("GPI_SECONDARY_PASSWORD", "secret")]);
        let cfg = Config::load_with(Some(path.as_path()), |name| overrides.get(name).cloned())
            .expect("config should load");
        assert!(cfg.capabilities().secondary.configured);
    }

    #[test]
    fn positions_path_gets_leading_slash() {
        let mut cfg = Config::default();
        cfg.primary.positions_path = "api/positions".to_string();
        cfg.normalize_urls();
        assert_eq!(cfg.primary.positions_path, "/api/positions");
    }

    #[test]
    fn redacted_masks_password_and_hash_ignores_it() {
        let mut a = Config::default();
        a.secondary.password = "one".to_string();
        let mut b = Config::default();
        b.secondary.password = "two".to_string();

        assert_eq!(a.redacted().secondary.password, "********");
        assert_eq!(
            a.stable_hash().expect("hash"),
            b.stable_hash().expect("hash")
        );
    }

    #[test]
    fn stable_hash_changes_when_config_changes() {
        let cfg = Config::default();
        let mut modified = Config::default();
        modified.store.chunk_size += 1;
        assert_ne!(
            cfg.stable_hash().expect("hash"),
            modified.stable_hash().expect("hash")
        );
    }

    #[test]
    fn toml_sections_parse() {
        let raw = r#"
            [primary]
            base_url = "http://cache:5000/api/traccar"

            [store]
            chunk_size = 500
            latest_policy = "newer_only"
        "#;
        let cfg: Config = toml::from_str(raw).expect("toml should parse");
        assert_eq!(cfg.store.chunk_size, 500);
        assert_eq!(cfg.store.latest_policy, LatestWritePolicy::NewerOnly);
        assert_eq!(cfg.primary.timeout_secs, 15);
        assert_eq!(cfg.secondary.positions_path, "/positions");
    }

    #[test]
    fn load_from_explicit_file_applies_env() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[schedule]\ninterval_secs = 30\n").expect("write config");
        let overrides = vars(&[("GPI_SCHEDULE_INTERVAL_SECS", "45")]);

        let cfg = Config::load_with(Some(path.as_path()), |name| overrides.get(name).cloned())
            .expect("config should load");
        assert_eq!(cfg.schedule.interval_secs, 45);
        assert_eq!(cfg.paths.config_file, path);
    }

    #[test]
    fn load_returns_error_for_explicit_missing_path() {
        let result = Config::load_with(Some(Path::new("/nonexistent/gpsi/config.toml")), no_env);
        assert!(matches!(result, Err(IngestError::MissingConfig { .. })));
    }

    #[test]
    fn default_paths_end_with_expected_names() {
        let cfg = Config::default();
        assert!(cfg.paths.sqlite_db.ends_with(PathBuf::from("positions.sqlite3")));
        assert!(cfg.paths.lock_file.ends_with(PathBuf::from("ingest.lock")));
    }
}
