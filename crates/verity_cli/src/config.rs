//! Fabric configuration.
//!
//! One TOML document with a section per crate. Every field has a default,
//! so an empty file (or no file) is a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use verity_core::Version;
use verity_federation::FederationConfig;
use verity_policy::PolicyConfig;
use verity_replay::ReplayConfig;
use verity_storage::{StoreBackend, StoreConfig};

/// Read when `--config` is not given and the file exists
pub const DEFAULT_CONFIG_FILE: &str = "verity.toml";

/// Engine version this build replays
pub const ENGINE_VERSION: Version = Version::new(1, 0, 0);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration:\n  {}", .0.join("\n  "))]
    Invalid(Vec<String>),
}

/// Log output settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `verity_replay=debug`
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            json: false,
        }
    }
}

/// Configuration for every fabric component
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricConfig {
    pub engine_version: Version,
    pub logging: LoggingConfig,
    pub replay: ReplayConfig,
    pub policy: PolicyConfig,
    pub store: StoreConfig,
    pub federation: FederationConfig,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            engine_version: ENGINE_VERSION,
            logging: LoggingConfig::default(),
            replay: ReplayConfig::default(),
            policy: PolicyConfig::default(),
            store: StoreConfig::default(),
            federation: FederationConfig::default(),
        }
    }
}

impl FabricConfig {
    /// Parse a TOML document without validating it
    ///
    /// # Errors
    ///
    /// Returns error if the text is not valid TOML for this structure
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Load from `path`, or from [`DEFAULT_CONFIG_FILE`] if present, or fall
    /// back to defaults. The result is validated.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed, or fails validation
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => Some(path.to_path_buf()),
            None => Some(PathBuf::from(DEFAULT_CONFIG_FILE)).filter(|p| p.exists()),
        };
        let config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
                    path: path.clone(),
                    source,
                })?;
                Self::from_toml(&text).map_err(|source| ConfigError::Parse { path, source })?
            }
            None => Self::default(),
        };
        let problems = config.validate();
        if problems.is_empty() {
            Ok(config)
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    /// Every problem with the configuration
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if EnvFilter::try_new(&self.logging.level).is_err() {
            problems.push(format!("logging.level `{}` is not a valid filter", self.logging.level));
        }
        if self.replay.timeout_ms == 0 {
            problems.push("replay.timeout_ms must be positive".to_string());
        }
        if self.store.backend == StoreBackend::Dir && self.store.root.as_os_str().is_empty() {
            problems.push("store.root must be set for the dir backend".to_string());
        }
        if let Some(path) = &self.policy.bundle_path {
            if path.as_os_str().is_empty() {
                problems.push("policy.bundle_path is empty".to_string());
            }
        }
        problems.extend(self.federation.validate());
        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use verity_policy::PolicyMode;
    use verity_replay::EngineKind;

    #[test]
    fn test_empty_document_is_default() {
        let config = FabricConfig::from_toml("").unwrap();
        assert_eq!(config, FabricConfig::default());
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_sections_override_defaults() {
        let config = FabricConfig::from_toml(
            r#"
            engine_version = "1.2.0"

            [logging]
            level = "debug"
            json = true

            [replay]
            engine = "strict"
            timeout_ms = 5000

            [policy]
            mode = "warn"

            [store]
            backend = "memory"

            [federation.breaker]
            failure_threshold = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.engine_version, Version::new(1, 2, 0));
        assert!(config.logging.json);
        assert_eq!(config.replay.engine, EngineKind::Strict);
        assert_eq!(config.replay.timeout_ms, 5_000);
        assert_eq!(config.policy.mode, PolicyMode::Warn);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.federation.breaker.failure_threshold, 3);
        assert_eq!(config.federation.breaker.cooldown_ms, 30_000);
    }

    #[test]
    fn test_validate_collects_all_problems() {
        let config = FabricConfig::from_toml(
            r#"
            [logging]
            level = "verity=loudest"

            [replay]
            timeout_ms = 0

            [federation]
            max_delegation_depth = 0
            "#,
        )
        .unwrap();
        let problems = config.validate();
        assert_eq!(problems.len(), 3, "{problems:?}");
    }

    #[test]
    fn test_load_reports_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("verity.toml");
        std::fs::write(&path, "[replay]\ntimeout_ms = 0\n").unwrap();
        assert!(matches!(
            FabricConfig::load(Some(&path)),
            Err(ConfigError::Invalid(problems)) if problems.len() == 1
        ));

        std::fs::write(&path, "[replay\n").unwrap();
        assert!(matches!(
            FabricConfig::load(Some(&path)),
            Err(ConfigError::Parse { .. })
        ));
    }
}
