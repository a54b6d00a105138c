use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use archiver_logging::archiver_info;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::blocklist::{BlockList, IpRange, DEFAULT_BLOCKED_RANGES};

const ENV_PREFIX: &str = "ARCHIVER_";

/// Process-wide, read-only pipeline configuration.
///
/// Loaded once at startup and handed to the validator, fetcher and
/// orchestrator; nothing mutates it afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiverConfig {
    pub enabled: bool,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    /// Deadline for a whole fetch, HEAD probe and body included. The read
    /// timeout alone resets on every chunk.
    pub fetch_timeout_ms: u64,
    pub max_redirects: usize,
    pub max_content_bytes: u64,
    /// Attempts allowed before a retryable failure stays failed.
    pub max_retries: u32,
    pub retry_backoff_base_ms: u64,
    /// Advertised in the User-Agent so site owners can reach us.
    pub contact_url: String,
    pub max_concurrent_jobs: usize,
    pub blocked_ranges: Vec<IpRange>,
    pub allowed_content_types: Vec<String>,
    pub database_path: Option<PathBuf>,
}

impl Default for ArchiverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            connect_timeout_ms: 10_000,
            read_timeout_ms: 15_000,
            fetch_timeout_ms: 60_000,
            max_redirects: 5,
            max_content_bytes: 10 * 1024 * 1024,
            max_retries: 3,
            retry_backoff_base_ms: 2_000,
            contact_url: "https://example.com/archiver".to_string(),
            max_concurrent_jobs: 8,
            blocked_ranges: DEFAULT_BLOCKED_RANGES.to_vec(),
            allowed_content_types: vec![
                "text/html".to_string(),
                "application/xhtml+xml".to_string(),
            ],
            database_path: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] ron::error::SpannedError),
    #[error("invalid value `{value}` for {key}")]
    InvalidEnv { key: String, value: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl ArchiverConfig {
    /// Defaults, then the optional RON file, then `ARCHIVER_*` environment
    /// variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_ron_file(path)?,
            None => Self::default(),
        };
        config.apply_env(std::env::vars())?;
        config.validate()?;
        archiver_info!(
            "Archiver config loaded (enabled={}, max_redirects={}, max_content_bytes={})",
            config.enabled,
            config.max_redirects,
            config.max_content_bytes
        );
        Ok(config)
    }

    pub fn from_ron_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_ron_str(&text)
    }

    pub fn from_ron_str(text: &str) -> Result<Self, ConfigError> {
        Ok(ron::from_str(text)?)
    }

    /// Applies overrides from `(key, value)` pairs; unrelated keys are ignored.
    pub fn apply_env<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let invalid = || ConfigError::InvalidEnv {
                key: key.clone(),
                value: value.clone(),
            };
            let trimmed = value.trim();
            match name {
                "ENABLED" => self.enabled = parse_bool(trimmed).ok_or_else(invalid)?,
                "CONNECT_TIMEOUT_MS" => {
                    self.connect_timeout_ms = trimmed.parse().map_err(|_| invalid())?
                }
                "READ_TIMEOUT_MS" => self.read_timeout_ms = trimmed.parse().map_err(|_| invalid())?,
                "FETCH_TIMEOUT_MS" => {
                    self.fetch_timeout_ms = trimmed.parse().map_err(|_| invalid())?
                }
                "MAX_REDIRECTS" => self.max_redirects = trimmed.parse().map_err(|_| invalid())?,
                "MAX_CONTENT_BYTES" => {
                    self.max_content_bytes = trimmed.parse().map_err(|_| invalid())?
                }
                "MAX_RETRIES" => self.max_retries = trimmed.parse().map_err(|_| invalid())?,
                "RETRY_BACKOFF_BASE_MS" => {
                    self.retry_backoff_base_ms = trimmed.parse().map_err(|_| invalid())?
                }
                "CONTACT_URL" => self.contact_url = trimmed.to_string(),
                "MAX_CONCURRENT_JOBS" => {
                    self.max_concurrent_jobs = trimmed.parse().map_err(|_| invalid())?
                }
                "BLOCKED_RANGES" => {
                    self.blocked_ranges = trimmed
                        .split(',')
                        .map(str::trim)
                        .filter(|part| !part.is_empty())
                        .map(str::parse)
                        .collect::<Result<_, _>>()
                        .map_err(|_| invalid())?
                }
                "DATABASE_PATH" => self.database_path = Some(PathBuf::from(trimmed)),
                _ => {}
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connect_timeout_ms == 0 || self.read_timeout_ms == 0 || self.fetch_timeout_ms == 0
        {
            return Err(ConfigError::Invalid("timeouts must be non-zero".to_string()));
        }
        if self.max_content_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max_content_bytes must be non-zero".to_string(),
            ));
        }
        if self.max_concurrent_jobs == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_jobs must be at least 1".to_string(),
            ));
        }
        match Url::parse(&self.contact_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(()),
            _ => Err(ConfigError::Invalid(format!(
                "contact_url `{}` is not an http(s) url",
                self.contact_url
            ))),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn retry_backoff_base(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_base_ms)
    }

    /// Delay before automatic retry number `attempt` (1-based): base * 2^(attempt-1).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        Duration::from_millis(self.retry_backoff_base_ms.saturating_mul(factor))
    }

    pub fn user_agent(&self) -> String {
        format!(
            "Mozilla/5.0 (compatible; LinkArchiver/{}; +{})",
            env!("CARGO_PKG_VERSION"),
            self.contact_url
        )
    }

    pub fn block_list(&self) -> BlockList {
        BlockList::new(self.blocked_ranges.clone())
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = ArchiverConfig::default();
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.read_timeout(), Duration::from_secs(15));
        assert_eq!(config.fetch_timeout(), Duration::from_secs(60));
        assert_eq!(config.max_redirects, 5);
        assert_eq!(config.max_content_bytes, 10 * 1024 * 1024);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_backoff_base(), Duration::from_secs(2));
        assert!(config.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn user_agent_carries_contact_url() {
        let config = ArchiverConfig::default();
        assert!(config.user_agent().contains("+https://example.com/archiver"));
    }

    #[test]
    fn ron_file_overrides_only_given_fields() {
        let config = ArchiverConfig::from_ron_str(
            r#"(max_redirects: 2, blocked_ranges: ["10.0.0.0/8"], enabled: false)"#,
        )
        .unwrap();
        assert_eq!(config.max_redirects, 2);
        assert!(!config.enabled);
        assert_eq!(config.blocked_ranges.len(), 1);
        assert_eq!(config.read_timeout_ms, 15_000);
    }

    #[test]
    fn bad_range_in_ron_is_a_parse_error() {
        let err = ArchiverConfig::from_ron_str(r#"(blocked_ranges: ["nope"])"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = ArchiverConfig::default();
        config
            .apply_env(vars(&[
                ("ARCHIVER_ENABLED", "off"),
                ("ARCHIVER_MAX_CONTENT_BYTES", "1024"),
                ("ARCHIVER_FETCH_TIMEOUT_MS", "5000"),
                ("ARCHIVER_BLOCKED_RANGES", "10.0.0.0/8, ::1/128"),
                ("PATH", "/usr/bin"),
            ]))
            .unwrap();
        assert!(!config.enabled);
        assert_eq!(config.max_content_bytes, 1024);
        assert_eq!(config.fetch_timeout(), Duration::from_secs(5));
        assert_eq!(config.block_list().ranges().len(), 2);
    }

    #[test]
    fn invalid_env_value_is_reported() {
        let mut config = ArchiverConfig::default();
        let err = config
            .apply_env(vars(&[("ARCHIVER_MAX_REDIRECTS", "many")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { key, .. } if key == "ARCHIVER_MAX_REDIRECTS"));
    }

    #[test]
    fn retry_delay_doubles() {
        let config = ArchiverConfig::default();
        assert_eq!(config.retry_delay(1), Duration::from_secs(2));
        assert_eq!(config.retry_delay(2), Duration::from_secs(4));
        assert_eq!(config.retry_delay(3), Duration::from_secs(8));
    }

    #[test]
    fn validate_rejects_zero_fetch_deadline() {
        let config = ArchiverConfig {
            fetch_timeout_ms: 0,
            ..ArchiverConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn validate_rejects_non_http_contact() {
        let config = ArchiverConfig {
            contact_url: "mailto:ops@example.com".to_string(),
            ..ArchiverConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
