//! Controller configuration, read from a YAML file
//!
//! Every field has a default, so an empty file (or no file at all) is a valid configuration:
//!
//! ```yaml
//! namespace: fleet
//! watchFilter: team-a
//! concurrency: 10
//! reconcileTimeout: 60s
//! installerTimeout: 30s
//! backoff:
//!   initial: 1s
//!   max: 5m
//!   factor: 2
//! conflictRetries: 3
//! resyncPeriod: 10m
//! installPollInterval: 15s
//! cleanupPollInterval: 5s
//! log:
//!   format: json
//!   filter: info,addon_runtime=debug
//! manifests:
//!   - /etc/addon-controller/fleet.yaml
//! ```
use addon_core::Duration;
use backon::ExponentialBuilder;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "ADDON_CONTROLLER_CONFIG";

/// Failures loading a [`ControllerConfig`]
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("failed to read config file {path:?}: {source}")]
    Read {
        /// The file that was read
        path: PathBuf,
        /// The underlying io error
        #[source]
        source: std::io::Error,
    },
    /// The file is not valid YAML for a configuration
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    /// The values are inconsistent
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Settings for both reconcilers and the process around them
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ControllerConfig {
    /// Only watch this namespace, all namespaces when unset
    pub namespace: Option<String>,
    /// Only reconcile objects whose `cluster.x-k8s.io/watch-filter` label has this value
    pub watch_filter: Option<String>,
    /// Objects reconciled at the same time, per controller
    pub concurrency: usize,
    /// Deadline for a single reconcile
    pub reconcile_timeout: Duration,
    /// Deadline for a single installer call
    pub installer_timeout: Duration,
    /// Retry delays for failed reconciles
    pub backoff: BackoffConfig,
    /// Retries of a write that lost an optimistic concurrency race
    pub conflict_retries: u32,
    /// Reconcile converged objects again after this long
    pub resync_period: Duration,
    /// How often an installing agent is checked on
    pub install_poll_interval: Duration,
    /// How often a deleting addon checks for its remaining instances
    pub cleanup_poll_interval: Duration,
    /// Log output
    pub log: LogConfig,
    /// YAML files whose objects are created in the store at start-up
    pub manifests: Vec<PathBuf>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            watch_filter: None,
            concurrency: 10,
            reconcile_timeout: Duration::from_secs(60),
            installer_timeout: Duration::from_secs(30),
            backoff: BackoffConfig::default(),
            conflict_retries: 3,
            resync_period: Duration::from_secs(600),
            install_poll_interval: Duration::from_secs(15),
            cleanup_poll_interval: Duration::from_secs(5),
            log: LogConfig::default(),
            manifests: Vec::new(),
        }
    }
}

/// Exponential retry delays
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackoffConfig {
    /// Delay after the first failure
    pub initial: Duration,
    /// Ceiling for the delay
    pub max: Duration,
    /// Growth of the delay per consecutive failure
    pub factor: f32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(300),
            factor: 2.0,
        }
    }
}

impl BackoffConfig {
    /// The equivalent backoff builder, without a retry limit
    pub fn builder(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.initial.as_std())
            .with_max_delay(self.max.as_std())
            .with_factor(self.factor)
            .without_max_times()
    }
}

/// Log output settings
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogConfig {
    /// Line format
    pub format: LogFormat,
    /// Default filter directives, `RUST_LOG` takes precedence when set
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            filter: "info".into(),
        }
    }
}

/// Log line format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

impl ControllerConfig {
    /// Load the file named by [`CONFIG_ENV`], or the defaults when it is unset
    pub fn load() -> Result<Self, ConfigError> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_path(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }

    /// Load and validate a configuration file
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&raw)
    }

    /// Parse and validate a configuration document
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        // an empty document deserializes as null rather than an empty map
        let config: Self = if raw.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(raw)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that cannot work together
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backoff.initial > self.backoff.max {
            return Err(ConfigError::Invalid(format!(
                "backoff.initial ({}) must not exceed backoff.max ({})",
                self.backoff.initial, self.backoff.max
            )));
        }
        if self.backoff.factor < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "backoff.factor must be at least 1, got {}",
                self.backoff.factor
            )));
        }
        Ok(())
    }

    /// The runtime settings shared by both controllers
    pub fn runtime_config(&self) -> addon_runtime::Config {
        addon_runtime::Config::default()
            .concurrency(self.concurrency)
            .reconcile_timeout(self.reconcile_timeout.as_std())
            .backoff(self.backoff.builder())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_documents_use_defaults() {
        assert_eq!(ControllerConfig::from_yaml("").unwrap(), ControllerConfig::default());
        let partial = ControllerConfig::from_yaml("concurrency: 2\n").unwrap();
        assert_eq!(partial.concurrency, 2);
        assert_eq!(partial.resync_period, Duration::from_secs(600));
    }

    #[test]
    fn files_are_parsed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "namespace: fleet\nwatchFilter: team-a\ninstallerTimeout: 1m30s\nbackoff:\n  initial: 500ms\n  max: 1m\n  factor: 3\nlog:\n  format: json\nmanifests: [a.yaml]"
        )
        .unwrap();
        let config = ControllerConfig::from_path(file.path()).unwrap();
        assert_eq!(config.namespace.as_deref(), Some("fleet"));
        assert_eq!(config.watch_filter.as_deref(), Some("team-a"));
        assert_eq!(config.installer_timeout, Duration::from_secs(90));
        assert_eq!(config.backoff.initial, Duration::from_millis(500));
        assert_eq!(config.backoff.factor, 3.0);
        assert_eq!(config.log.format, LogFormat::Json);
        assert_eq!(config.log.filter, "info");
        assert_eq!(config.manifests, vec![PathBuf::from("a.yaml")]);
    }

    #[test]
    fn inconsistent_backoff_is_rejected() {
        let err = ControllerConfig::from_yaml("backoff:\n  initial: 10m\n  max: 1m\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        let err = ControllerConfig::from_yaml("backoff:\n  factor: 0.5\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn missing_files_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = ControllerConfig::from_path(&dir.path().join("missing.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
