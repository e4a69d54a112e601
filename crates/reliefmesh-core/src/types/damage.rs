//! Damage report record - output of the imagery-analysis stage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::RequestId;

/// Damage report state machine.
///
/// `Analyzing` doubles as the claim state: the worker that transitions the
/// record from absent to `analyzing` owns the analysis run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    #[default]
    Pending,
    Analyzing,
    Complete,
    Failed,
}

impl AnalysisStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AnalysisStatus::Complete | AnalysisStatus::Failed)
    }

    /// Check whether a redelivered trigger must be discarded: a report in
    /// this state is either owned by another worker or already settled.
    pub fn is_claimed_or_complete(&self) -> bool {
        matches!(self, AnalysisStatus::Analyzing | AnalysisStatus::Complete)
    }
}

impl fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AnalysisStatus::Pending => "pending",
            AnalysisStatus::Analyzing => "analyzing",
            AnalysisStatus::Complete => "complete",
            AnalysisStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Category of a detected damage finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DamageCategory {
    Flooding,
    RoadCut,
    StructuralCollapse,
    Landslide,
    PowerOutage,
    Other,
}

/// A single detected damage finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DamageFinding {
    /// Human-readable location or a coordinate pair, engine-defined.
    pub location: String,
    pub category: DamageCategory,
    /// Engine confidence in [0, 1].
    pub confidence: f32,
}

/// DamageReport - written by the damage stage, at most once to a terminal
/// status per request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DamageReport {
    pub request_id: RequestId,
    #[serde(default)]
    pub findings: Vec<DamageFinding>,
    #[serde(default)]
    pub summary: Option<String>,
    pub analysis_status: AnalysisStatus,
    /// Error summary, set when analysis_status = failed.
    #[serde(default)]
    pub error: Option<String>,
    /// Identifier of the engine/model that produced the findings.
    #[serde(default)]
    pub analysis_model: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DamageReport {
    /// Build the claim placeholder the worker writes before invoking the
    /// analysis engine.
    pub fn claim(request_id: RequestId) -> Self {
        let now = Utc::now();
        Self {
            request_id,
            findings: Vec::new(),
            summary: None,
            analysis_status: AnalysisStatus::Analyzing,
            error: None,
            analysis_model: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Settle the report with findings.
    pub fn complete_with(
        &mut self,
        findings: Vec<DamageFinding>,
        summary: Option<String>,
        analysis_model: Option<String>,
    ) {
        self.findings = findings;
        self.summary = summary;
        self.analysis_model = analysis_model;
        self.error = None;
        self.analysis_status = AnalysisStatus::Complete;
        self.updated_at = Utc::now();
    }

    /// Settle the report as failed; terminal unless externally resubmitted.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.error = Some(reason.into());
        self.analysis_status = AnalysisStatus::Failed;
        self.updated_at = Utc::now();
    }
}
