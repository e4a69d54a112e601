//! Damage stage worker.
//!
//! State machine per request: triggered -> analyzing -> (complete | failed).
//! The claim on the DamageReport record is the only defense against
//! at-least-once redelivery; the analysis engine is never invoked twice for
//! one request.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Map;

use reliefmesh_core::bus::{Topic, Trigger, TriggerBus};
use reliefmesh_core::claim::claim;
use reliefmesh_core::store::{read_doc, update_doc, Collection, StateStore, StoreError};
use reliefmesh_core::types::{DamageReport, RequestId, RequestStatus, RescueRequest};
use reliefmesh_engines::ImageryAnalyzer;

use crate::worker::{
    publish_with_retry, requeue_after, StageError, StageOutcome, TriggerHandler,
};

/// Configuration for the damage stage worker.
#[derive(Debug, Clone)]
pub struct DamageWorkerConfig {
    /// Bound on one analysis invocation; elapse counts as engine failure.
    pub analysis_timeout: Duration,
    pub publish_attempts: u32,
    pub publish_backoff: Duration,
    /// Requeue budget while the owning request is not yet visible.
    pub missing_request_attempts: u32,
    pub requeue_delay: Duration,
}

impl Default for DamageWorkerConfig {
    fn default() -> Self {
        Self {
            analysis_timeout: Duration::from_secs(300),
            publish_attempts: 3,
            publish_backoff: Duration::from_millis(200),
            missing_request_attempts: 5,
            requeue_delay: Duration::from_millis(500),
        }
    }
}

/// DamageWorker - consumes damage triggers and produces DamageReports.
pub struct DamageWorker {
    store: Arc<dyn StateStore>,
    bus: Arc<dyn TriggerBus>,
    analyzer: Arc<dyn ImageryAnalyzer>,
    config: DamageWorkerConfig,
}

impl DamageWorker {
    pub fn new(
        store: Arc<dyn StateStore>,
        bus: Arc<dyn TriggerBus>,
        analyzer: Arc<dyn ImageryAnalyzer>,
        config: DamageWorkerConfig,
    ) -> Self {
        Self {
            store,
            bus,
            analyzer,
            config,
        }
    }

    async fn set_request_status(
        &self,
        request_id: &RequestId,
        status: RequestStatus,
    ) -> Result<(), StoreError> {
        let mut fields = Map::new();
        fields.insert(
            "status".to_string(),
            serde_json::to_value(status).map_err(|e| StoreError::Serialization(e.to_string()))?,
        );
        fields.insert(
            "updated_at".to_string(),
            serde_json::to_value(Utc::now())
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
        );
        self.store
            .update_fields(Collection::Requests, request_id, fields)
            .await
    }

    async fn run_analysis(
        &self,
        request: &RescueRequest,
        mut report: DamageReport,
    ) -> Result<StageOutcome, StageError> {
        let request_id = request.request_id.clone();

        let analysis =
            tokio::time::timeout(self.config.analysis_timeout, self.analyzer.analyze(request))
                .await;

        match analysis {
            Ok(Ok(outcome)) => {
                report.complete_with(outcome.findings, outcome.summary, outcome.model);
                update_doc(
                    self.store.as_ref(),
                    Collection::DamageReports,
                    &request_id,
                    &report,
                )
                .await?;
                self.set_request_status(&request_id, RequestStatus::DamageAssessed)
                    .await?;
                tracing::info!(
                    request_id = %request_id,
                    findings = report.findings.len(),
                    "damage analysis complete"
                );

                if let Err(e) = publish_with_retry(
                    self.bus.as_ref(),
                    Topic::Logistics,
                    Trigger::new(request_id.clone()),
                    self.config.publish_attempts,
                    self.config.publish_backoff,
                )
                .await
                {
                    // The report stays complete; a missing logistics trigger
                    // is the detectable stuck state for reconciliation.
                    tracing::error!(
                        request_id = %request_id,
                        error = %e,
                        "logistics trigger publish exhausted retries"
                    );
                }
                Ok(StageOutcome::Completed)
            }
            Ok(Err(e)) => {
                self.settle_failed(&mut report, e.to_string()).await?;
                Ok(StageOutcome::EngineFailed)
            }
            Err(_) => {
                let reason = format!(
                    "analysis timed out after {}s",
                    self.config.analysis_timeout.as_secs()
                );
                self.settle_failed(&mut report, reason).await?;
                Ok(StageOutcome::EngineFailed)
            }
        }
    }

    async fn settle_failed(
        &self,
        report: &mut DamageReport,
        reason: String,
    ) -> Result<(), StageError> {
        let request_id = report.request_id.clone();
        tracing::warn!(request_id = %request_id, error = %reason, "damage analysis failed");
        report.fail(reason);
        update_doc(
            self.store.as_ref(),
            Collection::DamageReports,
            &request_id,
            report,
        )
        .await?;
        self.set_request_status(&request_id, RequestStatus::Failed)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TriggerHandler for DamageWorker {
    fn stage(&self) -> &'static str {
        "damage"
    }

    async fn handle(&self, trigger: Trigger) -> Result<StageOutcome, StageError> {
        let request_id = trigger.request_id.clone();

        // Redelivery guard: any existing report means the stage already ran
        // or is running; a failed report stays failed until externally
        // resubmitted.
        if let Some(report) = read_doc::<DamageReport>(
            self.store.as_ref(),
            Collection::DamageReports,
            &request_id,
        )
        .await?
        {
            if report.analysis_status.is_claimed_or_complete() {
                tracing::debug!(
                    request_id = %request_id,
                    status = %report.analysis_status,
                    "damage trigger discarded; report already present"
                );
            } else {
                tracing::debug!(
                    request_id = %request_id,
                    "damage trigger discarded; report terminally failed, awaiting resubmission"
                );
            }
            return Ok(StageOutcome::Duplicate);
        }

        // The trigger can outrun the request write becoming visible; the bus
        // guarantees no ordering against the store.
        let Some(request) = read_doc::<RescueRequest>(
            self.store.as_ref(),
            Collection::Requests,
            &request_id,
        )
        .await?
        else {
            if trigger.attempt < self.config.missing_request_attempts {
                requeue_after(
                    self.bus.clone(),
                    Topic::DamageAnalysis,
                    trigger.retry(),
                    self.config.requeue_delay,
                );
                return Ok(StageOutcome::Requeued);
            }
            tracing::error!(
                request_id = %request_id,
                attempts = trigger.attempt,
                "request record never became visible; dropping damage trigger"
            );
            return Ok(StageOutcome::Dropped);
        };

        // The claim doubles as the lock: only the worker that transitions
        // the report from absent to analyzing proceeds.
        let placeholder = DamageReport::claim(request_id.clone());
        if !claim(
            self.store.as_ref(),
            Collection::DamageReports,
            &request_id,
            &placeholder,
        )
        .await?
        .acquired()
        {
            tracing::debug!(request_id = %request_id, "lost damage claim race");
            return Ok(StageOutcome::LostClaim);
        }

        self.set_request_status(&request_id, RequestStatus::Analyzing)
            .await?;

        self.run_analysis(&request, placeholder).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reliefmesh_core::types::{
        AnalysisStatus, DamageCategory, DamageFinding, ImageryRefs,
    };
    use reliefmesh_engines::{AnalysisOutcome, EngineError};
    use reliefmesh_stores::{InMemoryStateStore, InMemoryTriggerBus};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingAnalyzer {
        calls: AtomicUsize,
        delay: Duration,
        fail: bool,
    }

    impl CountingAnalyzer {
        fn succeeding() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                fail: true,
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay,
                fail: false,
            }
        }
    }

    #[async_trait]
    impl ImageryAnalyzer for CountingAnalyzer {
        async fn analyze(
            &self,
            request: &RescueRequest,
        ) -> Result<AnalysisOutcome, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(EngineError::Unavailable("model endpoint down".to_string()));
            }
            Ok(AnalysisOutcome {
                findings: vec![DamageFinding {
                    location: request.region_name.clone(),
                    category: DamageCategory::Flooding,
                    confidence: 0.9,
                }],
                summary: Some("coastal flooding".to_string()),
                model: Some("test-engine".to_string()),
            })
        }
    }

    struct Fixture {
        store: Arc<InMemoryStateStore>,
        bus: Arc<InMemoryTriggerBus>,
        analyzer: Arc<CountingAnalyzer>,
        worker: DamageWorker,
    }

    fn fixture(analyzer: CountingAnalyzer, config: DamageWorkerConfig) -> Fixture {
        let store = Arc::new(InMemoryStateStore::new());
        let bus = Arc::new(InMemoryTriggerBus::new());
        let analyzer = Arc::new(analyzer);
        let worker = DamageWorker::new(
            store.clone(),
            bus.clone(),
            analyzer.clone(),
            config,
        );
        Fixture {
            store,
            bus,
            analyzer,
            worker,
        }
    }

    async fn seed_request(store: &InMemoryStateStore) -> RequestId {
        let request = RescueRequest::new(
            "Cebu Province",
            "Typhoon Kalmaegi",
            "{}",
            ImageryRefs::new(vec![], vec!["gs://imagery/post.tif".to_string()]),
        );
        reliefmesh_core::store::create_doc(
            store,
            Collection::Requests,
            &request.request_id,
            &request,
        )
        .await
        .unwrap();
        request.request_id
    }

    #[test]
    fn test_success_writes_complete_report_and_logistics_trigger() {
        tokio_test::block_on(async {
            let f = fixture(CountingAnalyzer::succeeding(), Default::default());
            let request_id = seed_request(&f.store).await;

            let outcome = f.worker.handle(Trigger::new(request_id.clone())).await.unwrap();
            assert_eq!(outcome, StageOutcome::Completed);

            let report: DamageReport =
                read_doc(f.store.as_ref(), Collection::DamageReports, &request_id)
                    .await
                    .unwrap()
                    .expect("report written");
            assert_eq!(report.analysis_status, AnalysisStatus::Complete);
            assert_eq!(report.findings.len(), 1);
            assert_eq!(report.analysis_model.as_deref(), Some("test-engine"));

            let request: RescueRequest =
                read_doc(f.store.as_ref(), Collection::Requests, &request_id)
                    .await
                    .unwrap()
                    .unwrap();
            assert_eq!(request.status, RequestStatus::DamageAssessed);

            assert_eq!(f.bus.queued(Topic::Logistics), 1);
            assert_eq!(f.analyzer.calls.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn test_duplicate_delivery_is_noop_and_analyzer_runs_once() {
        tokio_test::block_on(async {
            let f = fixture(CountingAnalyzer::succeeding(), Default::default());
            let request_id = seed_request(&f.store).await;

            let first = f.worker.handle(Trigger::new(request_id.clone())).await.unwrap();
            let second = f.worker.handle(Trigger::new(request_id.clone())).await.unwrap();
            assert_eq!(first, StageOutcome::Completed);
            assert_eq!(second, StageOutcome::Duplicate);

            assert_eq!(f.analyzer.calls.load(Ordering::SeqCst), 1);
            // Only the first delivery fanned out to logistics.
            assert_eq!(f.bus.queued(Topic::Logistics), 1);
        });
    }

    #[test]
    fn test_concurrent_duplicate_deliveries_single_analysis() {
        tokio_test::block_on(async {
            let f = fixture(
                CountingAnalyzer::slow(Duration::from_millis(50)),
                Default::default(),
            );
            let request_id = seed_request(&f.store).await;

            let worker = Arc::new(f.worker);
            let mut handles = Vec::new();
            for _ in 0..4 {
                let worker = worker.clone();
                let trigger = Trigger::new(request_id.clone());
                handles.push(tokio::spawn(async move { worker.handle(trigger).await }));
            }

            let mut completed = 0;
            for handle in handles {
                let outcome = handle.await.unwrap().unwrap();
                if outcome == StageOutcome::Completed {
                    completed += 1;
                }
            }
            assert_eq!(completed, 1);
            assert_eq!(f.analyzer.calls.load(Ordering::SeqCst), 1);
            assert_eq!(f.bus.queued(Topic::Logistics), 1);
        });
    }

    #[test]
    fn test_engine_failure_settles_failed_and_no_fanout() {
        tokio_test::block_on(async {
            let f = fixture(CountingAnalyzer::failing(), Default::default());
            let request_id = seed_request(&f.store).await;

            let outcome = f.worker.handle(Trigger::new(request_id.clone())).await.unwrap();
            assert_eq!(outcome, StageOutcome::EngineFailed);

            let report: DamageReport =
                read_doc(f.store.as_ref(), Collection::DamageReports, &request_id)
                    .await
                    .unwrap()
                    .unwrap();
            assert_eq!(report.analysis_status, AnalysisStatus::Failed);
            assert!(report.error.as_deref().unwrap().contains("model endpoint down"));

            let request: RescueRequest =
                read_doc(f.store.as_ref(), Collection::Requests, &request_id)
                    .await
                    .unwrap()
                    .unwrap();
            assert_eq!(request.status, RequestStatus::Failed);

            assert_eq!(f.bus.queued(Topic::Logistics), 0);

            // Redelivery after a terminal failure stays a no-op.
            let redelivered = f.worker.handle(Trigger::new(request_id)).await.unwrap();
            assert_eq!(redelivered, StageOutcome::Duplicate);
            assert_eq!(f.analyzer.calls.load(Ordering::SeqCst), 1);
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_analysis_timeout_counts_as_failure() {
        let f = fixture(
            CountingAnalyzer::slow(Duration::from_secs(10)),
            DamageWorkerConfig {
                analysis_timeout: Duration::from_secs(1),
                ..Default::default()
            },
        );
        let request_id = seed_request(&f.store).await;

        let outcome = f.worker.handle(Trigger::new(request_id.clone())).await.unwrap();
        assert_eq!(outcome, StageOutcome::EngineFailed);

        let report: DamageReport =
            read_doc(f.store.as_ref(), Collection::DamageReports, &request_id)
                .await
                .unwrap()
                .unwrap();
        assert_eq!(report.analysis_status, AnalysisStatus::Failed);
        assert!(report.error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_request_requeues_then_drops() {
        let f = fixture(
            CountingAnalyzer::succeeding(),
            DamageWorkerConfig {
                missing_request_attempts: 2,
                requeue_delay: Duration::from_millis(10),
                ..Default::default()
            },
        );
        let request_id = RequestId::from("req-ghost");

        let outcome = f.worker.handle(Trigger::new(request_id.clone())).await.unwrap();
        assert_eq!(outcome, StageOutcome::Requeued);

        // The detached requeue republishes with attempt + 1.
        let mut stream = f.bus.subscribe(Topic::DamageAnalysis).await.unwrap();
        let requeued = stream.recv().await.unwrap().unwrap();
        assert_eq!(requeued.attempt, 1);

        let mut exhausted = Trigger::new(request_id);
        exhausted.attempt = 2;
        let outcome = f.worker.handle(exhausted).await.unwrap();
        assert_eq!(outcome, StageOutcome::Dropped);
        assert_eq!(f.analyzer.calls.load(Ordering::SeqCst), 0);
        assert!(f.store.is_empty(Collection::DamageReports));
    }
}
