use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ChannelKind, Coordinates, Severity};
use crate::error::{AppError, Result};

/// Category sentinel meaning "every category".
pub const CATEGORY_WILDCARD: &str = "All";

/// Radius applied when a stored subscription carries none.
pub const DEFAULT_RADIUS_KM: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CadenceTier {
    Immediate,
    Daily,
    Weekly,
}

impl CadenceTier {
    pub const ALL: [CadenceTier; 3] = [
        CadenceTier::Immediate,
        CadenceTier::Daily,
        CadenceTier::Weekly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CadenceTier::Immediate => "immediate",
            CadenceTier::Daily => "daily",
            CadenceTier::Weekly => "weekly",
        }
    }
}

impl fmt::Display for CadenceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CadenceTier {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "immediate" => Ok(CadenceTier::Immediate),
            "daily" => Ok(CadenceTier::Daily),
            "weekly" => Ok(CadenceTier::Weekly),
            other => Err(format!("unknown cadence tier '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: i64,
    pub owner_id: String,
    pub name: String,
    pub center: Coordinates,
    pub location_label: Option<String>,
    pub radius_km: f64,
    /// Empty, or containing [`CATEGORY_WILDCARD`], matches every category.
    pub categories: BTreeSet<String>,
    /// Empty matches every severity.
    pub severities: BTreeSet<Severity>,
    pub channels: BTreeSet<ChannelKind>,
    pub cadence: CadenceTier,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A subscription as created by the management API, before it has an id.
#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub owner_id: String,
    pub name: String,
    pub center: Coordinates,
    pub location_label: Option<String>,
    pub radius_km: f64,
    pub categories: BTreeSet<String>,
    pub severities: BTreeSet<Severity>,
    pub channels: BTreeSet<ChannelKind>,
    pub cadence: CadenceTier,
    pub active: bool,
}

impl Subscription {
    pub fn accepts_all_categories(&self) -> bool {
        self.categories.is_empty()
            || self
                .categories
                .iter()
                .any(|c| c.eq_ignore_ascii_case(CATEGORY_WILDCARD))
    }

    pub fn accepts_category(&self, category: &str) -> bool {
        self.accepts_all_categories()
            || self
                .categories
                .iter()
                .any(|c| c.eq_ignore_ascii_case(category))
    }

    pub fn accepts_severity(&self, severity: Severity) -> bool {
        self.severities.is_empty() || self.severities.contains(&severity)
    }

    /// Categories to push down to the incident store, `None` when any
    /// category is accepted.
    pub fn category_filter(&self) -> Option<Vec<String>> {
        if self.accepts_all_categories() {
            None
        } else {
            Some(self.categories.iter().cloned().collect())
        }
    }

    pub fn severity_filter(&self) -> Option<Vec<Severity>> {
        if self.severities.is_empty() {
            None
        } else {
            Some(self.severities.iter().copied().collect())
        }
    }

    /// Label used in messages for the watch-zone.
    pub fn zone_label(&self) -> &str {
        self.location_label.as_deref().unwrap_or("your location")
    }

    /// Checks the invariants the matcher relies on.
    pub fn validate(&self) -> Result<()> {
        if !self.center.is_valid() {
            return Err(self.malformed(format!(
                "invalid watch-zone center ({}, {})",
                self.center.latitude, self.center.longitude
            )));
        }
        if !self.radius_km.is_finite() || self.radius_km < 0.0 {
            return Err(self.malformed(format!("invalid radius {} km", self.radius_km)));
        }
        Ok(())
    }

    fn malformed(&self, reason: String) -> AppError {
        AppError::MalformedSubscription {
            id: self.id,
            reason,
        }
    }
}
