use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Location;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    High,
    Medium,
    Low,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::High => "High",
            Severity::Medium => "Medium",
            Severity::Low => "Low",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(Severity::High),
            "medium" => Ok(Severity::Medium),
            "low" => Ok(Severity::Low),
            other => Err(format!("unknown severity '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentRecord {
    pub id: i64,
    pub category: String,
    pub severity: Severity,
    pub description: String,
    pub location: Location,
    pub occurred_at: DateTime<Utc>,
}

/// An incident as handed over by the ingestion pipeline, before it has an id.
#[derive(Debug, Clone)]
pub struct NewIncident {
    pub category: String,
    pub severity: Severity,
    pub description: String,
    pub location: Location,
    pub occurred_at: DateTime<Utc>,
}

/// One incident inside one subscription's watch-zone.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub subscription_id: i64,
    pub incident: IncidentRecord,
    pub distance_km: f64,
}

impl MatchResult {
    pub fn incident_id(&self) -> i64 {
        self.incident.id
    }

    /// Distance as shown to subscribers.
    pub fn display_distance_km(&self) -> f64 {
        (self.distance_km * 100.0).round() / 100.0
    }
}
