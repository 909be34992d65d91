//! Collaborator contracts consumed by the engine.
//!
//! [`Repository`](super::Repository) implements all of them on SQLite; tests
//! and alternative deployments can provide their own.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{
    BoundingBox, CadenceTier, Contact, DeliveryRecord, IncidentRecord, NewDelivery, Severity,
    Subscription,
};

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Active subscriptions for one cadence tier. Rows that cannot be parsed
    /// are logged and left out.
    async fn list_active(&self, tier: CadenceTier) -> Result<Vec<Subscription>>;
}

/// Candidate retrieval parameters. Filters are applied by the store where it
/// can; the matcher always re-applies them.
#[derive(Debug, Clone, PartialEq)]
pub struct IncidentQuery {
    pub since: DateTime<Utc>,
    pub categories: Option<Vec<String>>,
    pub severities: Option<Vec<Severity>>,
    pub bbox: Option<BoundingBox>,
}

impl IncidentQuery {
    pub fn since(since: DateTime<Utc>) -> Self {
        Self {
            since,
            categories: None,
            severities: None,
            bbox: None,
        }
    }
}

#[async_trait]
pub trait IncidentStore: Send + Sync {
    async fn query(&self, query: IncidentQuery) -> Result<Vec<IncidentRecord>>;
}

/// An insert conflicts when a record for the same subscription and tier,
/// sent at or after `since`, already covers any of the new record's
/// incidents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoverageConflict {
    pub subscription_id: i64,
    pub tier: CadenceTier,
    pub since: DateTime<Utc>,
}

#[async_trait]
pub trait DeliveryStore: Send + Sync {
    async fn find_covering(
        &self,
        subscription_id: i64,
        tier: CadenceTier,
        since: DateTime<Utc>,
    ) -> Result<Vec<DeliveryRecord>>;

    /// Atomically writes `delivery` unless `conflict` matches an existing
    /// record, in which case nothing is written and
    /// [`AppError::DedupConflict`](crate::error::AppError::DedupConflict) is
    /// returned.
    async fn insert_if_absent(
        &self,
        delivery: NewDelivery,
        conflict: CoverageConflict,
    ) -> Result<DeliveryRecord>;
}

#[async_trait]
pub trait RecipientResolver: Send + Sync {
    /// Contact details on file for a subscription owner. Unknown owners
    /// resolve to an empty contact.
    async fn resolve(&self, owner_id: &str) -> Result<Contact>;
}
