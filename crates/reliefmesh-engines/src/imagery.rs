//! Imagery-analysis function boundary.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use reliefmesh_core::types::{DamageCategory, DamageFinding, RescueRequest};

use crate::http::{build_client, post_json, HttpEngineConfig};
use crate::EngineError;

/// Output of a successful analysis run.
#[derive(Debug, Clone)]
pub struct AnalysisOutcome {
    pub findings: Vec<DamageFinding>,
    pub summary: Option<String>,
    /// Identifier of the engine/model that produced the findings.
    pub model: Option<String>,
}

/// Imagery-analysis function boundary.
///
/// May be slow (minutes) and may fail; callers bound it with a timeout.
#[async_trait]
pub trait ImageryAnalyzer: Send + Sync {
    async fn analyze(&self, request: &RescueRequest) -> Result<AnalysisOutcome, EngineError>;
}

/// HTTP-backed analyzer: posts the request context as JSON and expects a
/// findings document back.
pub struct HttpImageryAnalyzer {
    client: reqwest::Client,
    config: HttpEngineConfig,
}

impl HttpImageryAnalyzer {
    pub fn new(config: HttpEngineConfig) -> Result<Self, EngineError> {
        let client = build_client(&config)?;
        Ok(Self { client, config })
    }
}

#[derive(Debug, Serialize)]
struct AnalyzeRequestBody<'a> {
    request_id: &'a str,
    region_name: &'a str,
    event_name: &'a str,
    aoi_geojson: &'a str,
    pre_event_imagery: &'a [String],
    post_event_imagery: &'a [String],
}

#[derive(Debug, Deserialize)]
struct AnalyzeResponseBody {
    findings: Vec<DamageFinding>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    model: Option<String>,
}

#[async_trait]
impl ImageryAnalyzer for HttpImageryAnalyzer {
    async fn analyze(&self, request: &RescueRequest) -> Result<AnalysisOutcome, EngineError> {
        let body = AnalyzeRequestBody {
            request_id: request.request_id.as_str(),
            region_name: &request.region_name,
            event_name: &request.event_name,
            aoi_geojson: &request.aoi_geojson,
            pre_event_imagery: &request.imagery.pre_event,
            post_event_imagery: &request.imagery.post_event,
        };
        let response: AnalyzeResponseBody =
            post_json(&self.client, &self.config.endpoint, &body).await?;

        Ok(AnalysisOutcome {
            findings: response.findings,
            summary: response.summary,
            model: response.model.or_else(|| self.config.model.clone()),
        })
    }
}

/// Deterministic analyzer for local development and tests: one flooding
/// finding per post-event imagery reference, anchored at the region.
pub struct FixtureImageryAnalyzer;

#[async_trait]
impl ImageryAnalyzer for FixtureImageryAnalyzer {
    async fn analyze(&self, request: &RescueRequest) -> Result<AnalysisOutcome, EngineError> {
        let findings = request
            .imagery
            .post_event
            .iter()
            .enumerate()
            .map(|(i, reference)| DamageFinding {
                location: format!("{} (scene {})", request.region_name, i + 1),
                category: if reference.contains("road") {
                    DamageCategory::RoadCut
                } else {
                    DamageCategory::Flooding
                },
                confidence: 0.9,
            })
            .collect::<Vec<_>>();

        if findings.is_empty() {
            return Err(EngineError::InvalidResponse(
                "no post-event imagery to analyze".to_string(),
            ));
        }

        Ok(AnalysisOutcome {
            summary: Some(format!(
                "{} damage scene(s) detected for {} in {}",
                findings.len(),
                request.event_name,
                request.region_name
            )),
            findings,
            model: Some("fixture-analyzer".to_string()),
        })
    }
}
