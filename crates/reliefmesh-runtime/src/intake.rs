//! Intake router - first stage of the pipeline.
//!
//! Accepts a rescue request, validates it, resolves the area of interest,
//! writes the initial record, and publishes the damage trigger. Everything
//! past the publish is fire-and-forget from the caller's point of view.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use reliefmesh_core::bus::{Topic, Trigger, TriggerBus};
use reliefmesh_core::store::{create_doc, Collection, StateStore, StoreError};
use reliefmesh_core::types::{ImageryRefs, RequestId, RescueRequest};
use reliefmesh_engines::AoiResolver;

use crate::worker::publish_with_retry;

/// Intake payload as received from the caller.
#[derive(Debug, Clone)]
pub struct IntakeRequest {
    pub region_name: String,
    pub event_name: String,
    pub imagery: ImageryRefs,
}

/// Intake errors, all rejected synchronously.
#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("AOI resolution failed: {0}")]
    Aoi(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Configuration for the intake router.
#[derive(Debug, Clone)]
pub struct IntakeRouterConfig {
    pub max_field_chars: usize,
    pub publish_attempts: u32,
    pub publish_backoff: Duration,
}

impl Default for IntakeRouterConfig {
    fn default() -> Self {
        Self {
            max_field_chars: 100,
            publish_attempts: 3,
            publish_backoff: Duration::from_millis(200),
        }
    }
}

/// IntakeRouter - accepts new rescue requests and starts the pipeline.
pub struct IntakeRouter {
    store: Arc<dyn StateStore>,
    bus: Arc<dyn TriggerBus>,
    aoi: Arc<dyn AoiResolver>,
    config: IntakeRouterConfig,
}

impl IntakeRouter {
    pub fn new(
        store: Arc<dyn StateStore>,
        bus: Arc<dyn TriggerBus>,
        aoi: Arc<dyn AoiResolver>,
        config: IntakeRouterConfig,
    ) -> Self {
        Self {
            store,
            bus,
            aoi,
            config,
        }
    }

    /// Accept a new rescue request.
    ///
    /// Returns once the request record is durable and the damage trigger is
    /// enqueued (or its retry budget is exhausted); no downstream stage has
    /// run yet at that point.
    pub async fn submit(&self, intake: IntakeRequest) -> Result<RequestId, IntakeError> {
        self.validate(&intake)?;

        let aoi_geojson = self
            .aoi
            .resolve(&intake.region_name)
            .await
            .map_err(|e| IntakeError::Aoi(e.to_string()))?;

        let request = RescueRequest::new(
            intake.region_name,
            intake.event_name,
            aoi_geojson,
            intake.imagery,
        );
        let request_id = request.request_id.clone();

        create_doc(
            self.store.as_ref(),
            Collection::Requests,
            &request_id,
            &request,
        )
        .await?;
        tracing::info!(
            request_id = %request_id,
            region_name = %request.region_name,
            event_name = %request.event_name,
            "rescue request accepted"
        );

        if let Err(e) = publish_with_retry(
            self.bus.as_ref(),
            Topic::DamageAnalysis,
            Trigger::new(request_id.clone()),
            self.config.publish_attempts,
            self.config.publish_backoff,
        )
        .await
        {
            // The request record is not rolled back: a request with no
            // trigger is a detectable stuck state for reconciliation.
            tracing::error!(
                request_id = %request_id,
                error = %e,
                "damage trigger publish exhausted retries; request left for reconciliation"
            );
        }

        Ok(request_id)
    }

    fn validate(&self, intake: &IntakeRequest) -> Result<(), IntakeError> {
        let max = self.config.max_field_chars;
        for (field, value) in [
            ("region_name", &intake.region_name),
            ("event_name", &intake.event_name),
        ] {
            if value.trim().is_empty() {
                return Err(IntakeError::Validation(format!("{} is required", field)));
            }
            if value.chars().count() > max {
                return Err(IntakeError::Validation(format!(
                    "{} exceeds {} characters",
                    field, max
                )));
            }
        }
        if intake.imagery.post_event.is_empty() {
            return Err(IntakeError::Validation(
                "at least one post-event imagery reference is required".to_string(),
            ));
        }
        Ok(())
    }
}
