//! Logistics stage worker.
//!
//! State machine per request: triggered -> planning -> (complete | failed).
//! A plan is only ever produced from a complete damage report; the trigger
//! may arrive before that report is visible, so the precondition is checked
//! explicitly instead of trusting delivery order.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Map;

use reliefmesh_core::bus::{Topic, Trigger, TriggerBus};
use reliefmesh_core::claim::claim;
use reliefmesh_core::store::{
    put_doc_if_absent, read_doc, update_doc, Collection, CreateOutcome, StateStore, StoreError,
};
use reliefmesh_core::types::{
    AnalysisStatus, DamageReport, LogisticsPlan, RequestId, RequestStatus,
};
use reliefmesh_engines::{InventoryProvider, PlanGenerator};

use crate::worker::{requeue_after, StageError, StageOutcome, TriggerHandler};

const PRECONDITION_REASON: &str = "damage report not ready";

/// Configuration for the logistics stage worker.
#[derive(Debug, Clone)]
pub struct LogisticsWorkerConfig {
    /// Bound on one planning invocation; elapse counts as engine failure.
    pub planning_timeout: Duration,
    /// Requeue budget while the damage report is not yet complete.
    pub precondition_attempts: u32,
    pub requeue_delay: Duration,
}

impl Default for LogisticsWorkerConfig {
    fn default() -> Self {
        Self {
            planning_timeout: Duration::from_secs(300),
            precondition_attempts: 5,
            requeue_delay: Duration::from_millis(500),
        }
    }
}

/// LogisticsWorker - consumes logistics triggers and produces LogisticsPlans.
pub struct LogisticsWorker {
    store: Arc<dyn StateStore>,
    bus: Arc<dyn TriggerBus>,
    generator: Arc<dyn PlanGenerator>,
    inventory: Arc<dyn InventoryProvider>,
    config: LogisticsWorkerConfig,
}

impl LogisticsWorker {
    pub fn new(
        store: Arc<dyn StateStore>,
        bus: Arc<dyn TriggerBus>,
        generator: Arc<dyn PlanGenerator>,
        inventory: Arc<dyn InventoryProvider>,
        config: LogisticsWorkerConfig,
    ) -> Self {
        Self {
            store,
            bus,
            generator,
            inventory,
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

    /// Record the terminal precondition failure as data, without clobbering
    /// a plan another worker may have claimed in the meantime.
    async fn record_precondition_failure(
        &self,
        request_id: &RequestId,
    ) -> Result<StageOutcome, StageError> {
        let failed = LogisticsPlan::failed(request_id.clone(), PRECONDITION_REASON);
        let outcome = put_doc_if_absent(
            self.store.as_ref(),
            Collection::LogisticsPlans,
            request_id,
            &failed,
        )
        .await?;
        if outcome == CreateOutcome::Created {
            tracing::error!(
                request_id = %request_id,
                "logistics precondition never satisfied; plan marked failed"
            );
            // Best effort: the owning request may itself never have become
            // visible.
            if let Err(e) = self
                .set_request_status(request_id, RequestStatus::Failed)
                .await
            {
                tracing::debug!(request_id = %request_id, error = %e, "request status update skipped");
            }
        }
        Ok(StageOutcome::PreconditionFailed)
    }

    async fn run_planning(
        &self,
        report: &DamageReport,
        mut plan: LogisticsPlan,
    ) -> Result<StageOutcome, StageError> {
        let request_id = report.request_id.clone();

        let inventory = match self.inventory.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.settle_failed(&mut plan, format!("inventory snapshot failed: {}", e))
                    .await?;
                return Ok(StageOutcome::EngineFailed);
            }
        };

        let planning = tokio::time::timeout(
            self.config.planning_timeout,
            self.generator.generate(report, &inventory),
        )
        .await;

        match planning {
            Ok(Ok(outcome)) => {
                plan.complete_with(outcome.actions, outcome.summary, outcome.model);
                update_doc(
                    self.store.as_ref(),
                    Collection::LogisticsPlans,
                    &request_id,
                    &plan,
                )
                .await?;
                self.set_request_status(&request_id, RequestStatus::Completed)
                    .await?;
                tracing::info!(
                    request_id = %request_id,
                    actions = plan.actions.len(),
                    "logistics plan complete"
                );
                Ok(StageOutcome::Completed)
            }
            Ok(Err(e)) => {
                self.settle_failed(&mut plan, e.to_string()).await?;
                Ok(StageOutcome::EngineFailed)
            }
            Err(_) => {
                let reason = format!(
                    "planning timed out after {}s",
                    self.config.planning_timeout.as_secs()
                );
                self.settle_failed(&mut plan, reason).await?;
                Ok(StageOutcome::EngineFailed)
            }
        }
    }

    async fn settle_failed(
        &self,
        plan: &mut LogisticsPlan,
        reason: String,
    ) -> Result<(), StageError> {
        let request_id = plan.request_id.clone();
        tracing::warn!(request_id = %request_id, error = %reason, "logistics planning failed");
        plan.fail(reason);
        update_doc(
            self.store.as_ref(),
            Collection::LogisticsPlans,
            &request_id,
            plan,
        )
        .await?;
        self.set_request_status(&request_id, RequestStatus::Failed)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TriggerHandler for LogisticsWorker {
    fn stage(&self) -> &'static str {
        "logistics"
    }

    async fn handle(&self, trigger: Trigger) -> Result<StageOutcome, StageError> {
        let request_id = trigger.request_id.clone();

        // Redelivery guard, symmetric to the damage stage.
        if let Some(plan) = read_doc::<LogisticsPlan>(
            self.store.as_ref(),
            Collection::LogisticsPlans,
            &request_id,
        )
        .await?
        {
            if plan.plan_status.is_claimed_or_complete() {
                tracing::debug!(
                    request_id = %request_id,
                    status = %plan.plan_status,
                    "logistics trigger discarded; plan already present"
                );
            } else {
                tracing::debug!(
                    request_id = %request_id,
                    "logistics trigger discarded; plan terminally failed, awaiting resubmission"
                );
            }
            return Ok(StageOutcome::Duplicate);
        }

        // Precondition: a complete damage report. The bus guarantees neither
        // ordering nor causality with the store, so absence here is normal.
        let report = read_doc::<DamageReport>(
            self.store.as_ref(),
            Collection::DamageReports,
            &request_id,
        )
        .await?;

        let report = match report {
            Some(report) if report.analysis_status == AnalysisStatus::Complete => report,
            Some(report) if report.analysis_status == AnalysisStatus::Failed => {
                // The report can never become complete; requeueing is
                // pointless.
                tracing::warn!(
                    request_id = %request_id,
                    "damage report failed upstream; logistics will not run"
                );
                return self.record_precondition_failure(&request_id).await;
            }
            _ => {
                if trigger.attempt < self.config.precondition_attempts {
                    requeue_after(
                        self.bus.clone(),
                        Topic::Logistics,
                        trigger.retry(),
                        self.config.requeue_delay,
                    );
                    return Ok(StageOutcome::Requeued);
                }
                return self.record_precondition_failure(&request_id).await;
            }
        };

        // Claim: single-writer-wins, same semantics as the damage stage.
        let placeholder = LogisticsPlan::claim(request_id.clone());
        if !claim(
            self.store.as_ref(),
            Collection::LogisticsPlans,
            &request_id,
            &placeholder,
        )
        .await?
        .acquired()
        {
            tracing::debug!(request_id = %request_id, "lost logistics claim race");
            return Ok(StageOutcome::LostClaim);
        }

        self.set_request_status(&request_id, RequestStatus::Planning)
            .await?;

        self.run_planning(&report, placeholder).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reliefmesh_core::store::create_doc;
    use reliefmesh_core::types::{
        DamageCategory, DamageFinding, DeploymentAction, PlanStatus, Priority,
    };
    use reliefmesh_engines::{
        EngineError, InventorySnapshot, PlanOutcome, StaticInventoryProvider,
    };
    use reliefmesh_stores::{InMemoryStateStore, InMemoryTriggerBus};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingGenerator {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingGenerator {
        fn succeeding() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: true,
            }
        }
    }

    #[async_trait]
    impl PlanGenerator for CountingGenerator {
        async fn generate(
            &self,
            report: &DamageReport,
            _inventory: &InventorySnapshot,
        ) -> Result<PlanOutcome, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(EngineError::Unavailable("planner endpoint down".to_string()));
            }
            Ok(PlanOutcome {
                actions: vec![DeploymentAction {
                    resource: "Water Filters (units)".to_string(),
                    quantity: 50,
                    destination: report
                        .findings
                        .first()
                        .map(|f| f.location.clone())
                        .unwrap_or_default(),
                    priority: Priority::Critical,
                }],
                summary: Some("single deployment".to_string()),
                model: Some("test-planner".to_string()),
            })
        }
    }

    struct Fixture {
        store: Arc<InMemoryStateStore>,
        bus: Arc<InMemoryTriggerBus>,
        generator: Arc<CountingGenerator>,
        worker: LogisticsWorker,
    }

    fn fixture(generator: CountingGenerator, config: LogisticsWorkerConfig) -> Fixture {
        let store = Arc::new(InMemoryStateStore::new());
        let bus = Arc::new(InMemoryTriggerBus::new());
        let generator = Arc::new(generator);
        let worker = LogisticsWorker::new(
            store.clone(),
            bus.clone(),
            generator.clone(),
            Arc::new(StaticInventoryProvider::default()),
            config,
        );
        Fixture {
            store,
            bus,
            generator,
            worker,
        }
    }

    async fn seed_report(store: &InMemoryStateStore, status: AnalysisStatus) -> RequestId {
        let request_id = RequestId::generate();
        let mut report = DamageReport::claim(request_id.clone());
        match status {
            AnalysisStatus::Complete => report.complete_with(
                vec![DamageFinding {
                    location: "coastal road".to_string(),
                    category: DamageCategory::Flooding,
                    confidence: 0.9,
                }],
                Some("flooding".to_string()),
                None,
            ),
            AnalysisStatus::Failed => report.fail("upstream failure"),
            _ => {}
        }
        create_doc(store, Collection::DamageReports, &request_id, &report)
            .await
            .unwrap();
        request_id
    }

    async fn seed_request(store: &InMemoryStateStore, request_id: &RequestId) {
        let mut request = reliefmesh_core::types::RescueRequest::new(
            "Cebu Province",
            "Typhoon Kalmaegi",
            "{}",
            Default::default(),
        );
        request.request_id = request_id.clone();
        create_doc(store, Collection::Requests, request_id, &request)
            .await
            .unwrap();
    }

    #[test]
    fn test_complete_report_yields_complete_plan() {
        tokio_test::block_on(async {
            let f = fixture(CountingGenerator::succeeding(), Default::default());
            let request_id = seed_report(&f.store, AnalysisStatus::Complete).await;
            seed_request(&f.store, &request_id).await;

            let outcome = f.worker.handle(Trigger::new(request_id.clone())).await.unwrap();
            assert_eq!(outcome, StageOutcome::Completed);

            let plan: LogisticsPlan =
                read_doc(f.store.as_ref(), Collection::LogisticsPlans, &request_id)
                    .await
                    .unwrap()
                    .expect("plan written");
            assert_eq!(plan.plan_status, PlanStatus::Complete);
            assert_eq!(plan.actions.len(), 1);
            assert_eq!(plan.actions[0].destination, "coastal road");

            let request: reliefmesh_core::types::RescueRequest =
                read_doc(f.store.as_ref(), Collection::Requests, &request_id)
                    .await
                    .unwrap()
                    .unwrap();
            assert_eq!(request.status, RequestStatus::Completed);
        });
    }

    #[test]
    fn test_duplicate_delivery_is_noop() {
        tokio_test::block_on(async {
            let f = fixture(CountingGenerator::succeeding(), Default::default());
            let request_id = seed_report(&f.store, AnalysisStatus::Complete).await;
            seed_request(&f.store, &request_id).await;

            let first = f.worker.handle(Trigger::new(request_id.clone())).await.unwrap();
            let second = f.worker.handle(Trigger::new(request_id.clone())).await.unwrap();
            assert_eq!(first, StageOutcome::Completed);
            assert_eq!(second, StageOutcome::Duplicate);
            assert_eq!(f.generator.calls.load(Ordering::SeqCst), 1);
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_report_requeues_without_creating_plan() {
        let f = fixture(
            CountingGenerator::succeeding(),
            LogisticsWorkerConfig {
                requeue_delay: Duration::from_millis(10),
                ..Default::default()
            },
        );
        let request_id = RequestId::from("req-early");

        let outcome = f.worker.handle(Trigger::new(request_id.clone())).await.unwrap();
        assert_eq!(outcome, StageOutcome::Requeued);

        // Not even a planning placeholder may exist before the report is
        // complete.
        assert!(f.store.is_empty(Collection::LogisticsPlans));
        assert_eq!(f.generator.calls.load(Ordering::SeqCst), 0);

        let mut stream = f.bus.subscribe(Topic::Logistics).await.unwrap();
        let requeued = stream.recv().await.unwrap().unwrap();
        assert_eq!(requeued.attempt, 1);
    }

    #[test]
    fn test_analyzing_report_is_not_planned_yet() {
        tokio_test::block_on(async {
            let f = fixture(CountingGenerator::succeeding(), Default::default());
            let request_id = seed_report(&f.store, AnalysisStatus::Analyzing).await;

            let outcome = f.worker.handle(Trigger::new(request_id.clone())).await.unwrap();
            assert_eq!(outcome, StageOutcome::Requeued);
            assert!(f.store.is_empty(Collection::LogisticsPlans));
        });
    }

    #[test]
    fn test_trigger_before_report_then_completion_yields_one_plan() {
        tokio_test::block_on(async {
            let f = fixture(
                CountingGenerator::succeeding(),
                LogisticsWorkerConfig {
                    requeue_delay: Duration::from_millis(1),
                    ..Default::default()
                },
            );
            let request_id = RequestId::from("req-race");

            let early = f.worker.handle(Trigger::new(request_id.clone())).await.unwrap();
            assert_eq!(early, StageOutcome::Requeued);

            seed_request(&f.store, &request_id).await;
            let mut report = DamageReport::claim(request_id.clone());
            report.complete_with(
                vec![DamageFinding {
                    location: "bridge".to_string(),
                    category: DamageCategory::RoadCut,
                    confidence: 0.8,
                }],
                None,
                None,
            );
            create_doc(f.store.as_ref(), Collection::DamageReports, &request_id, &report)
                .await
                .unwrap();

            // The requeued trigger arrives after the report completed.
            let mut stream = f.bus.subscribe(Topic::Logistics).await.unwrap();
            let requeued = stream.recv().await.unwrap().unwrap();
            let outcome = f.worker.handle(requeued).await.unwrap();
            assert_eq!(outcome, StageOutcome::Completed);

            let plan: LogisticsPlan =
                read_doc(f.store.as_ref(), Collection::LogisticsPlans, &request_id)
                    .await
                    .unwrap()
                    .unwrap();
            assert_eq!(plan.plan_status, PlanStatus::Complete);
            assert_eq!(f.generator.calls.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn test_failed_report_records_terminal_plan_failure() {
        tokio_test::block_on(async {
            let f = fixture(CountingGenerator::succeeding(), Default::default());
            let request_id = seed_report(&f.store, AnalysisStatus::Failed).await;
            seed_request(&f.store, &request_id).await;

            let outcome = f.worker.handle(Trigger::new(request_id.clone())).await.unwrap();
            assert_eq!(outcome, StageOutcome::PreconditionFailed);

            let plan: LogisticsPlan =
                read_doc(f.store.as_ref(), Collection::LogisticsPlans, &request_id)
                    .await
                    .unwrap()
                    .unwrap();
            assert_eq!(plan.plan_status, PlanStatus::Failed);
            assert_eq!(plan.error.as_deref(), Some(PRECONDITION_REASON));
            assert_eq!(f.generator.calls.load(Ordering::SeqCst), 0);
        });
    }

    #[test]
    fn test_exhausted_precondition_budget_records_failure() {
        tokio_test::block_on(async {
            let f = fixture(
                CountingGenerator::succeeding(),
                LogisticsWorkerConfig {
                    precondition_attempts: 3,
                    ..Default::default()
                },
            );
            let request_id = RequestId::from("req-never");

            let mut exhausted = Trigger::new(request_id.clone());
            exhausted.attempt = 3;
            let outcome = f.worker.handle(exhausted).await.unwrap();
            assert_eq!(outcome, StageOutcome::PreconditionFailed);

            let plan: LogisticsPlan =
                read_doc(f.store.as_ref(), Collection::LogisticsPlans, &request_id)
                    .await
                    .unwrap()
                    .unwrap();
            assert_eq!(plan.plan_status, PlanStatus::Failed);
        });
    }

    #[test]
    fn test_generator_failure_settles_failed_plan() {
        tokio_test::block_on(async {
            let f = fixture(CountingGenerator::failing(), Default::default());
            let request_id = seed_report(&f.store, AnalysisStatus::Complete).await;
            seed_request(&f.store, &request_id).await;

            let outcome = f.worker.handle(Trigger::new(request_id.clone())).await.unwrap();
            assert_eq!(outcome, StageOutcome::EngineFailed);

            let plan: LogisticsPlan =
                read_doc(f.store.as_ref(), Collection::LogisticsPlans, &request_id)
                    .await
                    .unwrap()
                    .unwrap();
            assert_eq!(plan.plan_status, PlanStatus::Failed);
            assert!(plan.error.as_deref().unwrap().contains("planner endpoint down"));

            let request: reliefmesh_core::types::RescueRequest =
                read_doc(f.store.as_ref(), Collection::Requests, &request_id)
                    .await
                    .unwrap()
                    .unwrap();
            assert_eq!(request.status, RequestStatus::Failed);
        });
    }
}
