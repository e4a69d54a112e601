//! Rescue request record - the unit of work submitted at intake.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Strongly-typed request identifier.
///
/// The sole join key across all three collections; never changes after
/// intake generates it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Generate a fresh time-ordered identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<RequestId> for String {
    fn from(value: RequestId) -> Self {
        value.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl AsRef<str> for RequestId {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl PartialEq<&str> for RequestId {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

/// Pre-event and post-event imagery references (opaque URIs).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageryRefs {
    #[serde(default)]
    pub pre_event: Vec<String>,
    #[serde(default)]
    pub post_event: Vec<String>,
}

impl ImageryRefs {
    pub fn new(pre_event: Vec<String>, post_event: Vec<String>) -> Self {
        Self {
            pre_event,
            post_event,
        }
    }
}

/// Coarse pipeline progress, mirrored onto the request record so a
/// read-only observer can follow the workflow without joining collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Written by intake; no stage has picked the request up yet.
    Submitted,
    /// The damage stage holds the claim and is running analysis.
    Analyzing,
    /// Damage analysis finished; logistics has not started.
    DamageAssessed,
    /// The logistics stage holds the claim and is generating the plan.
    Planning,
    /// The full pipeline ran to completion.
    Completed,
    /// A stage recorded a terminal failure.
    Failed,
}

impl RequestStatus {
    /// Check whether the pipeline will make no further progress.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Submitted => "submitted",
            RequestStatus::Analyzing => "analyzing",
            RequestStatus::DamageAssessed => "damage_assessed",
            RequestStatus::Planning => "planning",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// RescueRequest - created exactly once by intake.
///
/// Downstream stages mutate only `status` and `updated_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RescueRequest {
    pub request_id: RequestId,
    /// Target geographical area, e.g. "Cebu Province".
    pub region_name: String,
    /// Name of the disaster event, e.g. "Typhoon Kalmaegi".
    pub event_name: String,
    /// Serialized GeoJSON describing the area of interest.
    pub aoi_geojson: String,
    pub imagery: ImageryRefs,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RescueRequest {
    /// Create a new request with a fresh time-ordered id and status
    /// `submitted`.
    pub fn new(
        region_name: impl Into<String>,
        event_name: impl Into<String>,
        aoi_geojson: impl Into<String>,
        imagery: ImageryRefs,
    ) -> Self {
        let now = Utc::now();
        Self {
            request_id: RequestId::generate(),
            region_name: region_name.into(),
            event_name: event_name.into(),
            aoi_geojson: aoi_geojson.into(),
            imagery,
            status: RequestStatus::Submitted,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_status(&mut self, status: RequestStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}
