//! # ReliefMesh Config
//!
//! Unified single-file configuration management. A single `reliefmesh.yaml`
//! configures the app, stores, trigger bus, engines, stage policies, and
//! observability settings.

mod loader;

pub use loader::{load_config, ConfigError, ConfigManager, ConfigWatcher};

use serde::Deserialize;

/// Top-level configuration schema for ReliefMesh.
#[derive(Debug, Clone, Deserialize)]
pub struct ReliefConfig {
    /// Config schema version.
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub stores: StoresConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub engines: EnginesConfig,
    #[serde(default)]
    pub intake: IntakeConfig,
    #[serde(default)]
    pub damage: DamageStageConfig,
    #[serde(default)]
    pub logistics: LogisticsStageConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

fn default_version() -> u32 {
    1
}

impl Default for ReliefConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            app: AppConfig::default(),
            stores: StoresConfig::default(),
            bus: BusConfig::default(),
            engines: EnginesConfig::default(),
            intake: IntakeConfig::default(),
            damage: DamageStageConfig::default(),
            logistics: LogisticsStageConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_app_name")]
    pub name: String,
    #[serde(default = "default_env")]
    pub environment: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            environment: default_env(),
        }
    }
}

fn default_app_name() -> String {
    "reliefmesh".to_string()
}

fn default_env() -> String {
    "development".to_string()
}

/// Backend selection for one store or bus component.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendSpec {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default)]
    pub connection_url: Option<String>,
    #[serde(default)]
    pub key_prefix: Option<String>,
}

impl Default for BackendSpec {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            connection_url: None,
            key_prefix: None,
        }
    }
}

fn default_backend() -> String {
    "memory".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoresConfig {
    #[serde(default)]
    pub state: BackendSpec,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BusConfig {
    #[serde(default)]
    pub trigger: BackendSpec,
}

/// Configuration for one external engine boundary.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSpec {
    /// "fixture" (deterministic, local) or "http".
    #[serde(default = "default_engine_mode")]
    pub mode: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_engine_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub model: Option<String>,
}

impl Default for EngineSpec {
    fn default() -> Self {
        Self {
            mode: default_engine_mode(),
            endpoint: None,
            api_key: None,
            timeout_secs: default_engine_timeout_secs(),
            model: None,
        }
    }
}

fn default_engine_mode() -> String {
    "fixture".to_string()
}

fn default_engine_timeout_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnginesConfig {
    #[serde(default)]
    pub imagery: EngineSpec,
    #[serde(default)]
    pub planning: EngineSpec,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IntakeConfig {
    /// Upper bound on region/event name length (input guardrail).
    #[serde(default = "default_max_field_chars")]
    pub max_field_chars: usize,
    #[serde(default = "default_publish_attempts")]
    pub publish_attempts: u32,
    #[serde(default = "default_publish_backoff_ms")]
    pub publish_backoff_ms: u64,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            max_field_chars: default_max_field_chars(),
            publish_attempts: default_publish_attempts(),
            publish_backoff_ms: default_publish_backoff_ms(),
        }
    }
}

fn default_max_field_chars() -> usize {
    100
}

fn default_publish_attempts() -> u32 {
    3
}

fn default_publish_backoff_ms() -> u64 {
    200
}

#[derive(Debug, Clone, Deserialize)]
pub struct DamageStageConfig {
    /// Number of concurrent consumers on the damage topic.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Bound on one analysis invocation; elapse counts as failure.
    #[serde(default = "default_engine_timeout_secs")]
    pub analysis_timeout_secs: u64,
    #[serde(default = "default_publish_attempts")]
    pub publish_attempts: u32,
    #[serde(default = "default_publish_backoff_ms")]
    pub publish_backoff_ms: u64,
    /// Requeue budget when the owning request is not yet visible.
    #[serde(default = "default_precondition_attempts")]
    pub missing_request_attempts: u32,
    #[serde(default = "default_requeue_delay_ms")]
    pub requeue_delay_ms: u64,
}

impl Default for DamageStageConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            analysis_timeout_secs: default_engine_timeout_secs(),
            publish_attempts: default_publish_attempts(),
            publish_backoff_ms: default_publish_backoff_ms(),
            missing_request_attempts: default_precondition_attempts(),
            requeue_delay_ms: default_requeue_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogisticsStageConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_engine_timeout_secs")]
    pub planning_timeout_secs: u64,
    /// Requeue budget while the damage report is not yet complete.
    #[serde(default = "default_precondition_attempts")]
    pub precondition_attempts: u32,
    #[serde(default = "default_requeue_delay_ms")]
    pub requeue_delay_ms: u64,
}

impl Default for LogisticsStageConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            planning_timeout_secs: default_engine_timeout_secs(),
            precondition_attempts: default_precondition_attempts(),
            requeue_delay_ms: default_requeue_delay_ms(),
        }
    }
}

fn default_concurrency() -> usize {
    2
}

fn default_precondition_attempts() -> u32 {
    5
}

fn default_requeue_delay_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub traces_enabled: bool,
    #[serde(default)]
    pub log_file: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            traces_enabled: false,
            log_file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
