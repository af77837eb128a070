// ABOUTME: Configuration types and parsing for berth.yml.
// ABOUTME: Handles YAML parsing, file discovery, env overrides and validation.

mod value;

pub use value::{ConfigValue, resolve_values};

use crate::dispatcher::RetryPolicy;
use crate::error::{Error, Result};
use crate::runtime::{BackendKind, CriOptions, Endpoint, ParseEndpointError};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILENAME: &str = "berth.yml";
pub const CONFIG_FILENAME_ALT: &str = "berth.yaml";
pub const CONFIG_FILENAME_DIR: &str = ".berth/config.yml";

pub const ENV_BACKEND: &str = "BERTH_BACKEND";
pub const ENV_ENDPOINT: &str = "BERTH_ENDPOINT";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub retry: RetryPolicy,

    /// Interval of the background state poller. `0s` disables it.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    #[serde(default = "default_stop_timeout", with = "humantime_serde")]
    pub stop_timeout: Duration,

    #[serde(default = "default_kill_grace", with = "humantime_serde")]
    pub kill_grace: Duration,

    /// Force-remove every handle when the session closes.
    #[serde(default)]
    pub remove_on_close: bool,

    #[serde(default)]
    pub labels: BTreeMap<String, ConfigValue>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    /// Omitted: exit_check the well-known local sockets.
    #[serde(default, deserialize_with = "deserialize_backend_kind")]
    pub kind: Option<BackendKind>,

    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    #[serde(default = "default_call_timeout", with = "humantime_serde")]
    pub call_timeout: Duration,

    /// Pod namespace used by the CRI backend.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Root directory for CRI container logs.
    #[serde(default = "default_log_root")]
    pub log_root: PathBuf,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: None,
            endpoint: None,
            connect_timeout: default_connect_timeout(),
            call_timeout: default_call_timeout(),
            namespace: default_namespace(),
            log_root: default_log_root(),
        }
    }
}

impl BackendConfig {
    /// The configured endpoint, if any.
    pub fn endpoint(&self) -> std::result::Result<Option<Endpoint>, ParseEndpointError> {
        self.endpoint.as_deref().map(str::parse).transpose()
    }

    pub fn cri_options(&self) -> CriOptions {
        CriOptions {
            namespace: self.namespace.clone(),
            log_root: self.log_root.clone(),
            connect_timeout: self.connect_timeout,
            call_timeout: self.call_timeout,
        }
    }
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_stop_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_kill_grace() -> Duration {
    Duration::from_secs(5)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_call_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_namespace() -> String {
    "berth".to_string()
}

fn default_log_root() -> PathBuf {
    PathBuf::from("/var/log/berth")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            retry: RetryPolicy::default(),
            poll_interval: default_poll_interval(),
            stop_timeout: default_stop_timeout(),
            kill_grace: default_kill_grace(),
            remove_on_close: false,
            labels: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::ConfigNotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn discover(dir: &Path) -> Result<Self> {
        let candidates = [
            dir.join(CONFIG_FILENAME),
            dir.join(CONFIG_FILENAME_ALT),
            dir.join(CONFIG_FILENAME_DIR),
        ];

        for path in &candidates {
            if path.exists() {
                return Self::load(path);
            }
        }

        Err(Error::ConfigNotFound(dir.to_path_buf()))
    }

    /// Like `discover`, falling back to defaults when no file exists.
    pub fn discover_or_default(dir: &Path) -> Result<Self> {
        match Self::discover(dir) {
            Err(Error::ConfigNotFound(_)) => Ok(Self::default()),
            other => other,
        }
    }

    /// Apply `BERTH_BACKEND` and `BERTH_ENDPOINT` on top of the file values.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(kind) = std::env::var(ENV_BACKEND)
            && !kind.trim().is_empty()
        {
            self.backend.kind = Some(
                kind.parse()
                    .map_err(|e: String| Error::InvalidConfig(format!("{ENV_BACKEND}: {e}")))?,
            );
        }
        if let Ok(endpoint) = std::env::var(ENV_ENDPOINT)
            && !endpoint.trim().is_empty()
        {
            self.backend.endpoint = Some(endpoint);
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        self.backend
            .endpoint()
            .map_err(|e| Error::InvalidConfig(format!("backend.endpoint: {e}")))?;
        if self.backend.call_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "backend.call_timeout must be greater than zero".to_string(),
            ));
        }
        if self.backend.connect_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "backend.connect_timeout must be greater than zero".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::InvalidConfig(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err(Error::InvalidConfig(
                "retry.multiplier must be a finite number >= 1".to_string(),
            ));
        }
        if self.retry.initial_backoff > self.retry.max_backoff {
            return Err(Error::InvalidConfig(
                "retry.initial_backoff cannot exceed retry.max_backoff".to_string(),
            ));
        }
        Ok(())
    }

    /// Configured labels with env references resolved.
    pub fn resolved_labels(&self) -> Result<BTreeMap<String, String>> {
        resolve_values(&self.labels)
    }
}

// Custom deserializers

fn deserialize_backend_kind<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<BackendKind>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: Option<String> = Option::deserialize(deserializer)?;
    s.map(|s| s.parse().map_err(serde::de::Error::custom))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = Config::from_yaml("{}").unwrap();
        assert_eq!(config.backend.kind, None);
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.stop_timeout, Duration::from_secs(10));
        assert_eq!(config.kill_grace, Duration::from_secs(5));
        assert_eq!(config.backend.call_timeout, Duration::from_secs(120));
        assert_eq!(config.backend.namespace, "berth");
        assert_eq!(config.retry, RetryPolicy::default());
    }

    #[test]
    fn backend_kind_accepts_runtime_names() {
        let config = Config::from_yaml("backend:\n  kind: containerd\n").unwrap();
        assert_eq!(config.backend.kind, Some(BackendKind::Cri));
    }

    #[test]
    fn rejects_bad_endpoint() {
        let err = Config::from_yaml("backend:\n  endpoint: ftp://host\n").unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)), "{err}");
    }

    #[test]
    fn rejects_shrinking_retry_multiplier() {
        let err = Config::from_yaml("retry:\n  multiplier: 0.5\n").unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(Config::from_yaml("pol_interval: 5s\n").is_err());
    }

    #[test]
    fn literal_and_env_labels() {
        let config = Config::from_yaml(
            "labels:\n  team: infra\n  owner: { env: BERTH_TEST_UNSET_OWNER, default: ops }\n",
        )
        .unwrap();
        let labels = config.resolved_labels().unwrap();
        assert_eq!(labels["team"], "infra");
        assert_eq!(labels["owner"], "ops");
    }
}
