//! Configuration loading and hot-reload support.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::{EngineSpec, ReliefConfig};

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("File watch error: {0}")]
    Notify(#[from] notify::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Load full ReliefMesh configuration from a YAML file.
pub fn load_config(path: &Path) -> Result<ReliefConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    let config: ReliefConfig = serde_yaml::from_str(&content)?;
    validate_config(&config)?;
    Ok(config)
}

fn validate_config(config: &ReliefConfig) -> Result<(), ConfigError> {
    if config.version == 0 {
        return Err(ConfigError::Invalid(
            "version must be greater than 0".to_string(),
        ));
    }

    if config.app.name.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "app.name must not be empty".to_string(),
        ));
    }

    if config.stores.state.backend.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "stores.state.backend must not be empty".to_string(),
        ));
    }

    if config.bus.trigger.backend.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "bus.trigger.backend must not be empty".to_string(),
        ));
    }

    validate_engine("engines.imagery", &config.engines.imagery)?;
    validate_engine("engines.planning", &config.engines.planning)?;

    if config.intake.max_field_chars == 0 {
        return Err(ConfigError::Invalid(
            "intake.max_field_chars must be > 0".to_string(),
        ));
    }
    if config.intake.publish_attempts == 0 {
        return Err(ConfigError::Invalid(
            "intake.publish_attempts must be > 0".to_string(),
        ));
    }

    if config.damage.concurrency == 0 {
        return Err(ConfigError::Invalid(
            "damage.concurrency must be > 0".to_string(),
        ));
    }
    if config.damage.publish_attempts == 0 {
        return Err(ConfigError::Invalid(
            "damage.publish_attempts must be > 0".to_string(),
        ));
    }

    if config.logistics.concurrency == 0 {
        return Err(ConfigError::Invalid(
            "logistics.concurrency must be > 0".to_string(),
        ));
    }
    if config.logistics.precondition_attempts == 0 {
        return Err(ConfigError::Invalid(
            "logistics.precondition_attempts must be > 0".to_string(),
        ));
    }

    Ok(())
}

fn validate_engine(section: &str, spec: &EngineSpec) -> Result<(), ConfigError> {
    match spec.mode.trim().to_ascii_lowercase().as_str() {
        "fixture" => Ok(()),
        "http" => {
            let endpoint_present = spec
                .endpoint
                .as_deref()
                .map(|e| !e.trim().is_empty())
                .unwrap_or(false);
            if !endpoint_present {
                return Err(ConfigError::Invalid(format!(
                    "{}.endpoint is required for mode http",
                    section
                )));
            }
            if spec.timeout_secs == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{}.timeout_secs must be > 0",
                    section
                )));
            }
            Ok(())
        }
        other => Err(ConfigError::Invalid(format!(
            "{}.mode '{}' is not supported",
            section, other
        ))),
    }
}

/// Manages unified configuration with hot-reload support.
pub struct ConfigManager {
    path: PathBuf,
    config: Arc<RwLock<ReliefConfig>>,
}

impl ConfigManager {
    /// Create a new config manager.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            config: Arc::new(RwLock::new(ReliefConfig::default())),
        }
    }

    /// Get a reference to the current config.
    pub fn config(&self) -> Arc<RwLock<ReliefConfig>> {
        self.config.clone()
    }

    /// Load configuration from file.
    pub async fn load(&self) -> Result<(), ConfigError> {
        let config = load_config(&self.path)?;
        let mut current = self.config.write().await;
        *current = config;
        Ok(())
    }

    /// Start watching for config file changes.
    pub fn start_watching(self: &Arc<Self>) -> Result<ConfigWatcher, ConfigError> {
        let manager = Arc::clone(self);
        let handle = tokio::runtime::Handle::current();

        let mut watcher: RecommendedWatcher =
            notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                if let Ok(event) = res {
                    if matches!(
                        event.kind,
                        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
                    ) {
                        let manager = Arc::clone(&manager);
                        handle.spawn(async move {
                            if let Err(e) = manager.load().await {
                                tracing::error!("Failed to reload config: {}", e);
                            } else {
                                tracing::info!("Config reloaded successfully");
                            }
                        });
                    }
                }
            })?;

        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;
        Ok(ConfigWatcher { _watcher: watcher })
    }
}

/// Keeps the file watcher alive.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(content.as_bytes()).expect("write config");
        file
    }

    #[test]
    fn test_load_minimal_config_applies_defaults() {
        let file = write_config("version: 1\n");
        let config = load_config(file.path()).expect("load");
        assert_eq!(config.app.name, "reliefmesh");
        assert_eq!(config.stores.state.backend, "memory");
        assert_eq!(config.engines.imagery.mode, "fixture");
        assert_eq!(config.logistics.precondition_attempts, 5);
    }

    #[test]
    fn test_http_engine_requires_endpoint() {
        let file = write_config(
            "version: 1\nengines:\n  imagery:\n    mode: http\n",
        );
        let err = load_config(file.path()).expect_err("must reject");
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(err.to_string().contains("engines.imagery.endpoint"));
    }

    #[test]
    fn test_unknown_engine_mode_is_rejected() {
        let file = write_config(
            "version: 1\nengines:\n  planning:\n    mode: carrier-pigeon\n",
        );
        let err = load_config(file.path()).expect_err("must reject");
        assert!(err.to_string().contains("carrier-pigeon"));
    }

    #[test]
    fn test_zero_concurrency_is_rejected() {
        let file = write_config("version: 1\ndamage:\n  concurrency: 0\n");
        let err = load_config(file.path()).expect_err("must reject");
        assert!(err.to_string().contains("damage.concurrency"));
    }

    #[test]
    fn test_full_config_round_trip() {
        let file = write_config(
            r#"
version: 1
app:
  name: reliefmesh
  environment: production
stores:
  state:
    backend: redis
    connection_url: redis://localhost:6379
    key_prefix: "reliefmesh:state"
bus:
  trigger:
    backend: redis
    connection_url: redis://localhost:6379
    key_prefix: "reliefmesh:bus"
engines:
  imagery:
    mode: http
    endpoint: https://analysis.example/api/v1/analyze
    timeout_secs: 240
    model: damage-engine-v2
  planning:
    mode: fixture
logistics:
  precondition_attempts: 8
  requeue_delay_ms: 250
observability:
  log_level: debug
"#,
        );
        let config = load_config(file.path()).expect("load");
        assert_eq!(config.stores.state.backend, "redis");
        assert_eq!(
            config.engines.imagery.endpoint.as_deref(),
            Some("https://analysis.example/api/v1/analyze")
        );
        assert_eq!(config.engines.imagery.timeout_secs, 240);
        assert_eq!(config.logistics.precondition_attempts, 8);
        assert_eq!(config.observability.log_level, "debug");
    }
}
