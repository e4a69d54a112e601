//! Bootstrap helpers for starting the pipeline from a single YAML config.

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;

use reliefmesh_config::{
    ConfigError, ConfigManager, DamageStageConfig, EngineSpec, LogisticsStageConfig,
    ObservabilityConfig, ReliefConfig,
};
use reliefmesh_core::bus::{Topic, TriggerBus};
use reliefmesh_core::store::StateStore;
use reliefmesh_engines::{
    AoiResolver, EngineError, FixtureImageryAnalyzer, FixturePlanGenerator, HttpEngineConfig,
    HttpImageryAnalyzer, HttpPlanGenerator, ImageryAnalyzer, InventoryProvider, PlanGenerator,
    StaticAoiResolver, StaticInventoryProvider,
};
use reliefmesh_stores::{InMemoryStateStore, InMemoryTriggerBus};

use crate::damage::{DamageWorker, DamageWorkerConfig};
use crate::intake::{IntakeRouter, IntakeRouterConfig};
use crate::logistics::{LogisticsWorker, LogisticsWorkerConfig};
use crate::worker::spawn_consumers;

/// Runtime bootstrap errors.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("engine build error: {0}")]
    Engine(#[from] EngineError),

    #[error("unsupported {component} backend '{backend}'; inject the component explicitly")]
    UnsupportedBackend {
        component: &'static str,
        backend: String,
    },

    #[error("unsupported engine mode: {0}")]
    UnsupportedEngineMode(String),
}

/// Pre-built components injected into the bootstrap, overriding whatever
/// the config selects. Durable backends (Redis) are wired this way by the
/// server binary, keeping this crate broker-agnostic.
#[derive(Default)]
pub struct PipelineComponents {
    pub store: Option<Arc<dyn StateStore>>,
    pub bus: Option<Arc<dyn TriggerBus>>,
    pub analyzer: Option<Arc<dyn ImageryAnalyzer>>,
    pub generator: Option<Arc<dyn PlanGenerator>>,
    pub inventory: Option<Arc<dyn InventoryProvider>>,
    pub aoi: Option<Arc<dyn AoiResolver>>,
}

impl PipelineComponents {
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_bus(mut self, bus: Arc<dyn TriggerBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_analyzer(mut self, analyzer: Arc<dyn ImageryAnalyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    pub fn with_generator(mut self, generator: Arc<dyn PlanGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn with_inventory(mut self, inventory: Arc<dyn InventoryProvider>) -> Self {
        self.inventory = Some(inventory);
        self
    }

    pub fn with_aoi(mut self, aoi: Arc<dyn AoiResolver>) -> Self {
        self.aoi = Some(aoi);
        self
    }
}

/// Running pipeline bundle created from unified config.
pub struct RuntimeApp {
    pub store: Arc<dyn StateStore>,
    pub bus: Arc<dyn TriggerBus>,
    pub intake: Arc<IntakeRouter>,
    pub config_manager: Arc<ConfigManager>,
    damage: Arc<DamageWorker>,
    logistics: Arc<LogisticsWorker>,
    damage_concurrency: usize,
    logistics_concurrency: usize,
}

impl std::fmt::Debug for RuntimeApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeApp")
            .field("damage_concurrency", &self.damage_concurrency)
            .field("logistics_concurrency", &self.logistics_concurrency)
            .finish_non_exhaustive()
    }
}

static TRACING_INIT: OnceLock<()> = OnceLock::new();

impl RuntimeApp {
    /// Create a runnable pipeline from a single `reliefmesh.yaml`.
    pub async fn from_config_path(path: impl Into<PathBuf>) -> Result<Self, BootstrapError> {
        Self::from_config_path_with_components(path, PipelineComponents::default()).await
    }

    /// Create a runnable pipeline and inject pre-built components.
    pub async fn from_config_path_with_components(
        path: impl Into<PathBuf>,
        components: PipelineComponents,
    ) -> Result<Self, BootstrapError> {
        let config_manager = Arc::new(ConfigManager::new(path.into()));
        config_manager.load().await?;
        let config = config_manager.config().read().await.clone();
        init_tracing_if_needed(&config.observability);

        let store = match components.store {
            Some(store) => store,
            None => build_state_store(&config)?,
        };
        let bus = match components.bus {
            Some(bus) => bus,
            None => build_trigger_bus(&config)?,
        };
        let analyzer = match components.analyzer {
            Some(analyzer) => analyzer,
            None => build_imagery_analyzer(&config.engines.imagery)?,
        };
        let generator = match components.generator {
            Some(generator) => generator,
            None => build_plan_generator(&config.engines.planning)?,
        };
        let inventory = components
            .inventory
            .unwrap_or_else(|| Arc::new(StaticInventoryProvider::default()));
        let aoi = components
            .aoi
            .unwrap_or_else(|| Arc::new(StaticAoiResolver));

        let intake = Arc::new(IntakeRouter::new(
            store.clone(),
            bus.clone(),
            aoi,
            IntakeRouterConfig {
                max_field_chars: config.intake.max_field_chars,
                publish_attempts: config.intake.publish_attempts,
                publish_backoff: Duration::from_millis(config.intake.publish_backoff_ms),
            },
        ));

        let damage = Arc::new(DamageWorker::new(
            store.clone(),
            bus.clone(),
            analyzer,
            damage_worker_config(&config.damage),
        ));

        let logistics = Arc::new(LogisticsWorker::new(
            store.clone(),
            bus.clone(),
            generator,
            inventory,
            logistics_worker_config(&config.logistics),
        ));

        tracing::info!(
            app = %config.app.name,
            environment = %config.app.environment,
            state_backend = %config.stores.state.backend,
            bus_backend = %config.bus.trigger.backend,
            "pipeline components built"
        );

        Ok(Self {
            store,
            bus,
            intake,
            config_manager,
            damage,
            logistics,
            damage_concurrency: config.damage.concurrency,
            logistics_concurrency: config.logistics.concurrency,
        })
    }

    /// Spawn the stage consumers; the pipeline is live once this returns.
    pub fn spawn_workers(&self) -> Vec<JoinHandle<()>> {
        let mut handles = spawn_consumers(
            self.bus.clone(),
            Topic::DamageAnalysis,
            self.damage.clone(),
            self.damage_concurrency,
        );
        handles.extend(spawn_consumers(
            self.bus.clone(),
            Topic::Logistics,
            self.logistics.clone(),
            self.logistics_concurrency,
        ));
        handles
    }
}

fn damage_worker_config(config: &DamageStageConfig) -> DamageWorkerConfig {
    DamageWorkerConfig {
        analysis_timeout: Duration::from_secs(config.analysis_timeout_secs),
        publish_attempts: config.publish_attempts,
        publish_backoff: Duration::from_millis(config.publish_backoff_ms),
        missing_request_attempts: config.missing_request_attempts,
        requeue_delay: Duration::from_millis(config.requeue_delay_ms),
    }
}

fn logistics_worker_config(config: &LogisticsStageConfig) -> LogisticsWorkerConfig {
    LogisticsWorkerConfig {
        planning_timeout: Duration::from_secs(config.planning_timeout_secs),
        precondition_attempts: config.precondition_attempts,
        requeue_delay: Duration::from_millis(config.requeue_delay_ms),
    }
}

fn build_state_store(config: &ReliefConfig) -> Result<Arc<dyn StateStore>, BootstrapError> {
    match config.stores.state.backend.trim().to_ascii_lowercase().as_str() {
        "in_memory" | "memory" => Ok(Arc::new(InMemoryStateStore::new())),
        backend => Err(BootstrapError::UnsupportedBackend {
            component: "state store",
            backend: backend.to_string(),
        }),
    }
}

fn build_trigger_bus(config: &ReliefConfig) -> Result<Arc<dyn TriggerBus>, BootstrapError> {
    match config.bus.trigger.backend.trim().to_ascii_lowercase().as_str() {
        "in_memory" | "memory" => Ok(Arc::new(InMemoryTriggerBus::new())),
        backend => Err(BootstrapError::UnsupportedBackend {
            component: "trigger bus",
            backend: backend.to_string(),
        }),
    }
}

fn build_imagery_analyzer(spec: &EngineSpec) -> Result<Arc<dyn ImageryAnalyzer>, BootstrapError> {
    match spec.mode.trim().to_ascii_lowercase().as_str() {
        "fixture" => Ok(Arc::new(FixtureImageryAnalyzer)),
        "http" => {
            let analyzer = HttpImageryAnalyzer::new(http_engine_config(spec))?;
            Ok(Arc::new(analyzer))
        }
        other => Err(BootstrapError::UnsupportedEngineMode(other.to_string())),
    }
}

fn build_plan_generator(spec: &EngineSpec) -> Result<Arc<dyn PlanGenerator>, BootstrapError> {
    match spec.mode.trim().to_ascii_lowercase().as_str() {
        "fixture" => Ok(Arc::new(FixturePlanGenerator)),
        "http" => {
            let generator = HttpPlanGenerator::new(http_engine_config(spec))?;
            Ok(Arc::new(generator))
        }
        other => Err(BootstrapError::UnsupportedEngineMode(other.to_string())),
    }
}

fn http_engine_config(spec: &EngineSpec) -> HttpEngineConfig {
    HttpEngineConfig {
        endpoint: spec.endpoint.clone().unwrap_or_default(),
        api_key: spec.api_key.clone(),
        timeout_secs: spec.timeout_secs,
        model: spec.model.clone(),
    }
}

fn init_tracing_if_needed(observability: &ObservabilityConfig) {
    TRACING_INIT.get_or_init(|| {
        let fallback_level = match observability.log_level.trim().to_ascii_lowercase().as_str() {
            "trace" => "trace",
            "debug" => "debug",
            "info" => "info",
            "warn" => "warn",
            "error" => "error",
            _ => "info",
        };
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .or_else(|_| tracing_subscriber::EnvFilter::try_new(fallback_level))
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

        match observability
            .log_file
            .as_deref()
            .and_then(log_file::open_writer)
        {
            Some(writer) => {
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_target(true)
                    .with_ansi(false)
                    .with_writer(writer)
                    .try_init();
            }
            None => {
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_target(true)
                    .try_init();
            }
        }

        tracing::info!(
            log_level = %observability.log_level,
            traces_enabled = observability.traces_enabled,
            log_file = observability.log_file.as_deref().unwrap_or("(stdout)"),
            "tracing initialized"
        );
    });
}

mod log_file {
    use std::fs::{create_dir_all, File, OpenOptions};
    use std::io;
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    #[derive(Clone)]
    pub(super) struct SharedFileWriter {
        file: Arc<Mutex<File>>,
    }

    pub(super) fn open_writer(path: &str) -> Option<SharedFileWriter> {
        let file_path = Path::new(path);
        if let Some(parent) = file_path.parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(e) = create_dir_all(parent) {
                    eprintln!("failed to create log directory '{}': {}", parent.display(), e);
                    return None;
                }
            }
        }
        match OpenOptions::new().create(true).append(true).open(file_path) {
            Ok(file) => Some(SharedFileWriter {
                file: Arc::new(Mutex::new(file)),
            }),
            Err(e) => {
                eprintln!("failed to open log file '{}': {}", file_path.display(), e);
                None
            }
        }
    }

    impl io::Write for SharedFileWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut file = self
                .file
                .lock()
                .map_err(|_| io::Error::other("log file mutex poisoned"))?;
            io::Write::write(&mut *file, buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            let mut file = self
                .file
                .lock()
                .map_err(|_| io::Error::other("log file mutex poisoned"))?;
            io::Write::flush(&mut *file)
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SharedFileWriter {
        type Writer = SharedFileWriter;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intake::IntakeRequest;
    use reliefmesh_core::store::read_doc;
    use reliefmesh_core::types::{
        AnalysisStatus, DamageReport, ImageryRefs, LogisticsPlan, PlanStatus, RequestId,
        RequestStatus, RescueRequest,
    };
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(content.as_bytes()).expect("write config");
        file
    }

    fn fast_pipeline_config() -> &'static str {
        r#"
version: 1
damage:
  requeue_delay_ms: 5
logistics:
  requeue_delay_ms: 5
observability:
  log_level: warn
"#
    }

    fn valid_intake() -> IntakeRequest {
        IntakeRequest {
            region_name: "Cebu Province".to_string(),
            event_name: "Typhoon Kalmaegi".to_string(),
            imagery: ImageryRefs::new(
                vec!["gs://imagery/pre.tif".to_string()],
                vec!["gs://imagery/post.tif".to_string()],
            ),
        }
    }

    async fn wait_for_plan(
        app: &RuntimeApp,
        request_id: &RequestId,
    ) -> Option<LogisticsPlan> {
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            if let Some(plan) = read_doc::<LogisticsPlan>(
                app.store.as_ref(),
                reliefmesh_core::store::Collection::LogisticsPlans,
                request_id,
            )
            .await
            .unwrap()
            {
                if plan.plan_status.is_terminal() {
                    return Some(plan);
                }
            }
            if tokio::time::Instant::now() > deadline {
                return None;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_end_to_end_pipeline_completes() {
        let file = write_config(fast_pipeline_config());
        let app = RuntimeApp::from_config_path(file.path()).await.unwrap();
        let _workers = app.spawn_workers();

        let request_id = app.intake.submit(valid_intake()).await.unwrap();

        let plan = wait_for_plan(&app, &request_id)
            .await
            .expect("pipeline must settle");
        assert_eq!(plan.plan_status, PlanStatus::Complete);
        assert!(!plan.actions.is_empty());

        let report: DamageReport = read_doc(
            app.store.as_ref(),
            reliefmesh_core::store::Collection::DamageReports,
            &request_id,
        )
        .await
        .unwrap()
        .expect("report present");
        assert_eq!(report.analysis_status, AnalysisStatus::Complete);
        assert!(!report.findings.is_empty());

        let request: RescueRequest = read_doc(
            app.store.as_ref(),
            reliefmesh_core::store::Collection::Requests,
            &request_id,
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(request.status, RequestStatus::Completed);
    }

    #[tokio::test]
    async fn test_end_to_end_duplicate_bus_delivery_single_completion() {
        use async_trait::async_trait;
        use reliefmesh_engines::{AnalysisOutcome, EngineError, ImageryAnalyzer};
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct CountingFixture {
            calls: AtomicUsize,
        }

        #[async_trait]
        impl ImageryAnalyzer for CountingFixture {
            async fn analyze(
                &self,
                request: &RescueRequest,
            ) -> Result<AnalysisOutcome, EngineError> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                FixtureImageryAnalyzer.analyze(request).await
            }
        }

        let file = write_config(fast_pipeline_config());
        let analyzer = Arc::new(CountingFixture {
            calls: AtomicUsize::new(0),
        });
        // Every publish is delivered twice: intake's damage trigger and the
        // logistics fan-out both get a duplicate.
        let app = RuntimeApp::from_config_path_with_components(
            file.path(),
            PipelineComponents::default()
                .with_bus(Arc::new(reliefmesh_stores::InMemoryTriggerBus::with_delivery_copies(2)))
                .with_analyzer(analyzer.clone()),
        )
        .await
        .unwrap();
        let _workers = app.spawn_workers();

        let request_id = app.intake.submit(valid_intake()).await.unwrap();

        let plan = wait_for_plan(&app, &request_id)
            .await
            .expect("pipeline must settle");
        assert_eq!(plan.plan_status, PlanStatus::Complete);
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsupported_backend_requires_injection() {
        let file = write_config(
            "version: 1\nstores:\n  state:\n    backend: redis\n    connection_url: redis://localhost\n",
        );
        let err = RuntimeApp::from_config_path(file.path())
            .await
            .expect_err("redis needs injection here");
        assert!(matches!(err, BootstrapError::UnsupportedBackend { .. }));
    }

    #[tokio::test]
    async fn test_fixture_engines_built_by_default() {
        let file = write_config("version: 1\n");
        let app = RuntimeApp::from_config_path(file.path()).await.unwrap();
        // No workers spawned: nothing consumes, intake still accepts.
        let request_id = app.intake.submit(valid_intake()).await.unwrap();
        let request: Option<RescueRequest> = read_doc(
            app.store.as_ref(),
            reliefmesh_core::store::Collection::Requests,
            &request_id,
        )
        .await
        .unwrap();
        assert_eq!(request.unwrap().status, RequestStatus::Submitted);
    }
}
