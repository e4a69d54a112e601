//! Plan-generation function boundary.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use reliefmesh_core::types::{DamageReport, DeploymentAction, Priority};

use crate::http::{build_client, post_json, HttpEngineConfig};
use crate::inventory::InventorySnapshot;
use crate::EngineError;

/// Output of a successful planning run.
#[derive(Debug, Clone)]
pub struct PlanOutcome {
    /// Ordered deployment sequence, highest priority first.
    pub actions: Vec<DeploymentAction>,
    pub summary: Option<String>,
    pub model: Option<String>,
}

/// Plan-generation function boundary.
#[async_trait]
pub trait PlanGenerator: Send + Sync {
    async fn generate(
        &self,
        report: &DamageReport,
        inventory: &InventorySnapshot,
    ) -> Result<PlanOutcome, EngineError>;
}

/// HTTP-backed generator: posts findings plus the inventory snapshot and
/// expects an ordered action sequence back.
pub struct HttpPlanGenerator {
    client: reqwest::Client,
    config: HttpEngineConfig,
}

impl HttpPlanGenerator {
    pub fn new(config: HttpEngineConfig) -> Result<Self, EngineError> {
        let client = build_client(&config)?;
        Ok(Self { client, config })
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequestBody<'a> {
    request_id: &'a str,
    report: &'a DamageReport,
    inventory: &'a InventorySnapshot,
}

#[derive(Debug, Deserialize)]
struct GenerateResponseBody {
    actions: Vec<DeploymentAction>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    model: Option<String>,
}

#[async_trait]
impl PlanGenerator for HttpPlanGenerator {
    async fn generate(
        &self,
        report: &DamageReport,
        inventory: &InventorySnapshot,
    ) -> Result<PlanOutcome, EngineError> {
        let body = GenerateRequestBody {
            request_id: report.request_id.as_str(),
            report,
            inventory,
        };
        let response: GenerateResponseBody =
            post_json(&self.client, &self.config.endpoint, &body).await?;

        Ok(PlanOutcome {
            actions: response.actions,
            summary: response.summary,
            model: response.model.or_else(|| self.config.model.clone()),
        })
    }
}

/// Deterministic generator for local development and tests: one action per
/// finding, never allocating more than the inventory holds.
pub struct FixturePlanGenerator;

impl FixturePlanGenerator {
    fn resource_for(category: &reliefmesh_core::types::DamageCategory) -> &'static str {
        use reliefmesh_core::types::DamageCategory;
        match category {
            DamageCategory::Flooding => "Water Filters (units)",
            DamageCategory::RoadCut => "Heavy Machinery (bulldozers/excavators)",
            DamageCategory::StructuralCollapse => "Tents (family size)",
            DamageCategory::Landslide => "Heavy Machinery (bulldozers/excavators)",
            DamageCategory::PowerOutage => "Fuel (liters)",
            DamageCategory::Other => "Ready-to-Eat Meals (kits)",
        }
    }
}

#[async_trait]
impl PlanGenerator for FixturePlanGenerator {
    async fn generate(
        &self,
        report: &DamageReport,
        inventory: &InventorySnapshot,
    ) -> Result<PlanOutcome, EngineError> {
        if report.findings.is_empty() {
            return Err(EngineError::InvalidResponse(
                "damage report carries no findings".to_string(),
            ));
        }

        let mut remaining = inventory.stock.clone();
        let mut actions = Vec::new();
        for (i, finding) in report.findings.iter().enumerate() {
            let resource = Self::resource_for(&finding.category);
            let available = remaining.get(resource).copied().unwrap_or(0);
            if available == 0 {
                continue;
            }
            let quantity = (available / 2).max(1);
            remaining.insert(resource.to_string(), available - quantity);
            actions.push(DeploymentAction {
                resource: resource.to_string(),
                quantity,
                destination: finding.location.clone(),
                priority: if i == 0 {
                    Priority::Critical
                } else {
                    Priority::High
                },
            });
        }

        if actions.is_empty() {
            return Err(EngineError::InvalidResponse(
                "inventory exhausted; no deployable resources".to_string(),
            ));
        }

        Ok(PlanOutcome {
            summary: Some(format!(
                "{} deployment(s) for {} finding(s)",
                actions.len(),
                report.findings.len()
            )),
            actions,
            model: Some("fixture-planner".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::StaticInventoryProvider;
    use crate::InventoryProvider;
    use reliefmesh_core::types::{DamageCategory, DamageFinding, RequestId};

    fn report_with(findings: Vec<DamageFinding>) -> DamageReport {
        let mut report = DamageReport::claim(RequestId::from("req-1"));
        report.complete_with(findings, None, None);
        report
    }

    #[test]
    fn test_fixture_generator_respects_inventory_bounds() {
        tokio_test::block_on(async {
            let inventory = StaticInventoryProvider::default().snapshot().await.unwrap();
            let report = report_with(vec![
                DamageFinding {
                    location: "coastal road".to_string(),
                    category: DamageCategory::Flooding,
                    confidence: 0.95,
                },
                DamageFinding {
                    location: "inland barangay".to_string(),
                    category: DamageCategory::Flooding,
                    confidence: 0.7,
                },
            ]);

            let outcome = FixturePlanGenerator
                .generate(&report, &inventory)
                .await
                .unwrap();

            let total: u32 = outcome
                .actions
                .iter()
                .filter(|a| a.resource == "Water Filters (units)")
                .map(|a| a.quantity)
                .sum();
            let available = inventory.stock["Water Filters (units)"];
            assert!(total <= available);
            assert_eq!(outcome.actions[0].priority, Priority::Critical);
        });
    }

    #[test]
    fn test_fixture_generator_rejects_empty_report() {
        tokio_test::block_on(async {
            let inventory = StaticInventoryProvider::default().snapshot().await.unwrap();
            let report = DamageReport::claim(RequestId::from("req-1"));
            let err = FixturePlanGenerator
                .generate(&report, &inventory)
                .await
                .expect_err("empty findings must fail");
            assert!(matches!(err, EngineError::InvalidResponse(_)));
        });
    }
}
