use std::collections::BTreeSet;
use std::sync::Arc;

use crate::db::{CoverageConflict, DeliveryStore};
use crate::error::Result;
use crate::models::{DeliveryRecord, MatchResult, NewDelivery};

use super::window::Window;

/// At-most-once delivery per (subscription, incident) within a tier window.
///
/// Coverage is always read back from the delivery store; nothing is cached
/// between cycles.
pub struct DedupGuard {
    store: Arc<dyn DeliveryStore>,
}

impl DedupGuard {
    pub fn new(store: Arc<dyn DeliveryStore>) -> Self {
        Self { store }
    }

    /// Candidate incidents already covered by a delivery committed inside
    /// `window` for this subscription.
    pub async fn already_notified(
        &self,
        subscription_id: i64,
        candidates: &BTreeSet<i64>,
        window: &Window,
    ) -> Result<BTreeSet<i64>> {
        let covering = self
            .store
            .find_covering(subscription_id, window.tier, window.start)
            .await?;

        let covered = covering
            .iter()
            .flat_map(|record| record.incident_ids.iter())
            .filter(|id| candidates.contains(*id))
            .copied()
            .collect();
        Ok(covered)
    }

    /// Commit point of a cycle. Fails with `DedupConflict` when another cycle
    /// got there first.
    pub async fn commit(&self, delivery: NewDelivery, window: &Window) -> Result<DeliveryRecord> {
        let conflict = CoverageConflict {
            subscription_id: delivery.subscription_id,
            tier: window.tier,
            since: window.start,
        };
        self.store.insert_if_absent(delivery, conflict).await
    }
}

pub fn exclude_covered(matches: Vec<MatchResult>, covered: &BTreeSet<i64>) -> Vec<MatchResult> {
    matches
        .into_iter()
        .filter(|m| !covered.contains(&m.incident_id()))
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::db::Repository;
    use crate::error::AppError;
    use crate::models::{CadenceTier, ChannelKind};

    fn delivery(ids: &[i64], tier: CadenceTier) -> NewDelivery {
        NewDelivery {
            subscription_id: 3,
            owner_id: "owner".to_string(),
            tier,
            incident_ids: ids.iter().copied().collect(),
            channels_succeeded: BTreeSet::from([ChannelKind::Email]),
            incident_count: ids.len(),
            sent_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn covered_set_is_intersection_with_candidates() {
        let repo = Arc::new(Repository::open_in_memory().await.unwrap());
        let guard = DedupGuard::new(repo);
        let window = Window::ending_at(CadenceTier::Immediate, Utc::now() + Duration::seconds(1));

        guard
            .commit(delivery(&[1, 2], CadenceTier::Immediate), &window)
            .await
            .unwrap();
        guard
            .commit(delivery(&[5], CadenceTier::Immediate), &window)
            .await
            .unwrap();

        let candidates = BTreeSet::from([2, 3, 5]);
        let covered = guard.already_notified(3, &candidates, &window).await.unwrap();
        assert_eq!(covered, BTreeSet::from([2, 5]));

        assert!(guard
            .already_notified(4, &candidates, &window)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn coverage_is_scoped_per_tier() {
        let repo = Arc::new(Repository::open_in_memory().await.unwrap());
        let guard = DedupGuard::new(repo);
        let now = Utc::now() + Duration::seconds(1);
        let immediate = Window::ending_at(CadenceTier::Immediate, now);
        let weekly = Window::ending_at(CadenceTier::Weekly, now);

        guard
            .commit(delivery(&[1], CadenceTier::Immediate), &immediate)
            .await
            .unwrap();

        let candidates = BTreeSet::from([1]);
        assert!(guard
            .already_notified(3, &candidates, &weekly)
            .await
            .unwrap()
            .is_empty());
        guard
            .commit(delivery(&[1], CadenceTier::Weekly), &weekly)
            .await
            .unwrap();

        let again = guard
            .commit(delivery(&[1], CadenceTier::Weekly), &weekly)
            .await;
        assert!(matches!(again, Err(AppError::DedupConflict { .. })));
    }
}
