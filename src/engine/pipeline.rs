use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};

use super::dedup::{exclude_covered, DedupGuard};
use super::dispatch::Dispatcher;
use super::geo::{bounding_box, match_incidents};
use super::window::Window;
use crate::db::{DeliveryStore, IncidentQuery, IncidentStore, SubscriptionStore};
use crate::error::{AppError, Result};
use crate::models::{CadenceTier, DeliveryRecord, MatchResult, Subscription};

/// What one subscription's cycle ended with.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    NoMatches,
    /// Every match was already delivered inside the window.
    AlreadyCovered,
    Delivered(DeliveryRecord),
    /// Another cycle committed overlapping coverage first; nothing was written.
    Conflict,
    /// A cycle for the same subscription and tier is still running.
    InFlight,
}

/// Per-tier tally of a scan cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub tier: CadenceTier,
    pub subscriptions: usize,
    pub delivered: usize,
    pub no_matches: usize,
    pub already_covered: usize,
    pub conflicts: usize,
    pub in_flight: usize,
    pub failed: usize,
    pub not_started: usize,
}

impl CycleReport {
    fn new(tier: CadenceTier, subscriptions: usize) -> Self {
        Self {
            tier,
            subscriptions,
            delivered: 0,
            no_matches: 0,
            already_covered: 0,
            conflicts: 0,
            in_flight: 0,
            failed: 0,
            not_started: 0,
        }
    }

    fn record(&mut self, outcome: &CycleOutcome) {
        match outcome {
            CycleOutcome::NoMatches => self.no_matches += 1,
            CycleOutcome::AlreadyCovered => self.already_covered += 1,
            CycleOutcome::Delivered(_) => self.delivered += 1,
            CycleOutcome::Conflict => self.conflicts += 1,
            CycleOutcome::InFlight => self.in_flight += 1,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub cycle_timeout: Duration,
    pub max_concurrent_subscriptions: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            cycle_timeout: Duration::from_secs(120),
            max_concurrent_subscriptions: 5,
        }
    }
}

/// Keys of (subscription, tier) cycles currently running.
#[derive(Default)]
struct SingleFlight {
    active: Arc<Mutex<HashSet<(i64, CadenceTier)>>>,
}

struct FlightGuard {
    key: (i64, CadenceTier),
    active: Arc<Mutex<HashSet<(i64, CadenceTier)>>>,
}

impl SingleFlight {
    fn try_acquire(&self, subscription_id: i64, tier: CadenceTier) -> Option<FlightGuard> {
        let key = (subscription_id, tier);
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        active.insert(key).then(|| FlightGuard {
            key,
            active: Arc::clone(&self.active),
        })
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

/// The per-subscription pipeline: fetch, match, dedup, dispatch, commit.
pub struct Engine {
    subscriptions: Arc<dyn SubscriptionStore>,
    incidents: Arc<dyn IncidentStore>,
    dedup: DedupGuard,
    dispatcher: Dispatcher,
    settings: EngineSettings,
    in_flight: SingleFlight,
}

impl Engine {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionStore>,
        incidents: Arc<dyn IncidentStore>,
        deliveries: Arc<dyn DeliveryStore>,
        dispatcher: Dispatcher,
        settings: EngineSettings,
    ) -> Self {
        Self {
            subscriptions,
            incidents,
            dedup: DedupGuard::new(deliveries),
            dispatcher,
            settings,
            in_flight: SingleFlight::default(),
        }
    }

    /// Runs one scan cycle of `tier` with its window ending at `now`.
    ///
    /// Failures of a single subscription are logged and counted. A store
    /// failure stops subscriptions that have not started yet and is returned
    /// once the running ones finish.
    pub async fn run_tier(&self, tier: CadenceTier, now: DateTime<Utc>) -> Result<CycleReport> {
        let window = Window::ending_at(tier, now);
        let subscriptions = self.subscriptions.list_active(tier).await?;
        let mut report = CycleReport::new(tier, subscriptions.len());
        tracing::debug!(%tier, count = subscriptions.len(), since = %window.start, "Scanning tier");

        let aborted = AtomicBool::new(false);
        let results: Vec<(i64, Option<Result<CycleOutcome>>)> = stream::iter(subscriptions)
            .map(|sub| {
                let aborted = &aborted;
                let window = &window;
                async move {
                    if aborted.load(Ordering::Acquire) {
                        return (sub.id, None);
                    }
                    let result = self.run_with_timeout(&sub, window).await;
                    if matches!(&result, Err(e) if e.is_data_access()) {
                        aborted.store(true, Ordering::Release);
                    }
                    (sub.id, Some(result))
                }
            })
            .buffer_unordered(self.settings.max_concurrent_subscriptions.max(1))
            .collect()
            .await;

        let mut abort_error = None;
        for (subscription_id, result) in results {
            match result {
                None => report.not_started += 1,
                Some(Ok(outcome)) => {
                    if let CycleOutcome::Delivered(record) = &outcome {
                        tracing::info!(
                            subscription_id,
                            %tier,
                            delivery_id = record.id,
                            incidents = record.incident_count,
                            channels = ?record.channels_succeeded,
                            "Sent alert notification"
                        );
                    }
                    report.record(&outcome);
                }
                Some(Err(e)) if e.is_data_access() => {
                    report.failed += 1;
                    tracing::error!(subscription_id, %tier, error = %e, "Store failure, aborting cycle");
                    abort_error.get_or_insert(e);
                }
                Some(Err(e)) => {
                    report.failed += 1;
                    tracing::warn!(subscription_id, %tier, error = %e, "Skipping subscription this cycle");
                }
            }
        }

        match abort_error {
            Some(e) => {
                tracing::error!(
                    %tier,
                    failed = report.failed,
                    not_started = report.not_started,
                    "Cycle aborted"
                );
                Err(e)
            }
            None => Ok(report),
        }
    }

    async fn run_with_timeout(&self, sub: &Subscription, window: &Window) -> Result<CycleOutcome> {
        let limit = self.settings.cycle_timeout;
        tokio::time::timeout(limit, self.run_subscription(sub, window))
            .await
            .map_err(|_| AppError::CycleTimeout {
                subscription_id: sub.id,
                seconds: limit.as_secs(),
            })?
    }

    /// One subscription's cycle. Nothing is persisted unless the final
    /// commit succeeds, so abandoning this future at any point is safe.
    pub async fn run_subscription(&self, sub: &Subscription, window: &Window) -> Result<CycleOutcome> {
        sub.validate()?;

        let Some(_flight) = self.in_flight.try_acquire(sub.id, window.tier) else {
            tracing::debug!(subscription_id = sub.id, tier = %window.tier, "Previous cycle still running");
            return Ok(CycleOutcome::InFlight);
        };

        let query = IncidentQuery {
            since: window.start,
            categories: sub.category_filter(),
            severities: sub.severity_filter(),
            bbox: bounding_box(sub.center, sub.radius_km),
        };
        let candidates = self.incidents.query(query).await?;
        let matches = match_incidents(sub, &candidates);
        if matches.is_empty() {
            return Ok(CycleOutcome::NoMatches);
        }

        let ids: BTreeSet<i64> = matches.iter().map(MatchResult::incident_id).collect();
        let covered = self.dedup.already_notified(sub.id, &ids, window).await?;
        let fresh = exclude_covered(matches, &covered);
        if fresh.is_empty() {
            return Ok(CycleOutcome::AlreadyCovered);
        }

        let delivery = self.dispatcher.dispatch(sub, window.tier, &fresh).await?;
        match self.dedup.commit(delivery, window).await {
            Ok(record) => Ok(CycleOutcome::Delivered(record)),
            Err(e @ AppError::DedupConflict { .. }) => {
                tracing::info!(error = %e, "Discarding duplicate cycle");
                Ok(CycleOutcome::Conflict)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;

    use super::*;

    use crate::engine::testing::{
        dispatcher, engine, engine_with, incident, repository, zone, FakeChannel, CAPE_TOWN,
        JOHANNESBURG, PRETORIA,
    };
    use crate::models::{ChannelKind, IncidentRecord};

    /// An incident store whose backend is down.
    #[derive(Default)]
    struct UnreachableIncidents {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl IncidentStore for UnreachableIncidents {
        async fn query(&self, _query: IncidentQuery) -> Result<Vec<IncidentRecord>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(rusqlite::Error::InvalidQuery.into())
        }
    }

    #[test]
    fn single_flight_blocks_same_key_until_released() {
        let flights = SingleFlight::default();
        let guard = flights.try_acquire(1, CadenceTier::Immediate);
        assert!(guard.is_some());
        assert!(flights.try_acquire(1, CadenceTier::Immediate).is_none());

        // Other tiers and other subscriptions are independent.
        assert!(flights.try_acquire(1, CadenceTier::Weekly).is_some());
        assert!(flights.try_acquire(2, CadenceTier::Immediate).is_some());

        drop(guard);
        assert!(flights.try_acquire(1, CadenceTier::Immediate).is_some());
    }

    #[test]
    fn report_tallies_outcomes() {
        let mut report = CycleReport::new(CadenceTier::Daily, 3);
        report.record(&CycleOutcome::NoMatches);
        report.record(&CycleOutcome::Conflict);
        report.record(&CycleOutcome::AlreadyCovered);
        assert_eq!(report.no_matches, 1);
        assert_eq!(report.conflicts, 1);
        assert_eq!(report.already_covered, 1);
        assert_eq!(report.delivered, 0);
    }

    #[tokio::test]
    async fn second_cycle_does_not_renotify() {
        let repo = repository().await;
        let email = FakeChannel::new(ChannelKind::Email, false);
        let engine = engine(&repo, &[email.clone()]);
        let now = Utc::now();

        let sub_id = repo
            .insert_subscription(zone("Home", JOHANNESBURG, 10.0, CadenceTier::Immediate))
            .await
            .unwrap();
        repo.insert_incident(incident("Robbery", JOHANNESBURG, now - ChronoDuration::minutes(10)))
            .await
            .unwrap();

        let first = engine.run_tier(CadenceTier::Immediate, now).await.unwrap();
        assert_eq!(first.delivered, 1);

        let second = engine.run_tier(CadenceTier::Immediate, Utc::now()).await.unwrap();
        assert_eq!(second.delivered, 0);
        assert_eq!(second.already_covered, 1);

        assert_eq!(email.sent_count(), 1);
        assert_eq!(repo.deliveries_for_subscription(sub_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn partial_channel_failure_still_covers_incidents() {
        let repo = repository().await;
        let email = FakeChannel::new(ChannelKind::Email, true);
        let sms = FakeChannel::new(ChannelKind::Sms, false);
        let engine = engine(&repo, &[email.clone(), sms.clone()]);
        let now = Utc::now();

        let sub_id = repo
            .insert_subscription(zone("Home", JOHANNESBURG, 10.0, CadenceTier::Daily))
            .await
            .unwrap();
        let incident_id = repo
            .insert_incident(incident("Burglary", JOHANNESBURG, now - ChronoDuration::hours(2)))
            .await
            .unwrap();

        engine.run_tier(CadenceTier::Daily, now).await.unwrap();

        let records = repo.deliveries_for_subscription(sub_id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].channels_succeeded, BTreeSet::from([ChannelKind::Sms]));
        assert_eq!(records[0].incident_ids, BTreeSet::from([incident_id]));

        // The failed email channel is not retried for the same incident.
        let again = engine.run_tier(CadenceTier::Daily, Utc::now()).await.unwrap();
        assert_eq!(again.already_covered, 1);
        assert_eq!(email.sent_count(), 1);
        assert_eq!(sms.sent_count(), 1);
    }

    #[tokio::test]
    async fn racing_cycles_commit_once() {
        let repo = repository().await;
        let email = FakeChannel::new(ChannelKind::Email, false);
        // Two engines share the store but not their in-flight tracking, like
        // two worker processes would.
        let first = engine(&repo, &[email.clone()]);
        let second = engine(&repo, &[email.clone()]);
        let now = Utc::now();

        repo.insert_subscription(zone("Home", JOHANNESBURG, 10.0, CadenceTier::Immediate))
            .await
            .unwrap();
        repo.insert_incident(incident("Robbery", JOHANNESBURG, now - ChronoDuration::minutes(5)))
            .await
            .unwrap();

        let subs = repo.list_active(CadenceTier::Immediate).await.unwrap();
        let sub = &subs[0];
        let window = Window::ending_at(CadenceTier::Immediate, now);

        let (a, b) = tokio::join!(
            first.run_subscription(sub, &window),
            second.run_subscription(sub, &window)
        );
        let outcomes = [a.unwrap(), b.unwrap()];

        let delivered = outcomes
            .iter()
            .filter(|o| matches!(o, CycleOutcome::Delivered(_)))
            .count();
        assert_eq!(delivered, 1);
        assert!(outcomes
            .iter()
            .any(|o| matches!(o, CycleOutcome::Conflict | CycleOutcome::AlreadyCovered)));
        assert_eq!(repo.deliveries_for_subscription(sub.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn wildcard_category_matches_everything() {
        let repo = repository().await;
        let email = FakeChannel::new(ChannelKind::Email, false);
        let engine = engine(&repo, &[email.clone()]);
        let now = Utc::now();

        let mut sub = zone("Home", JOHANNESBURG, 10.0, CadenceTier::Immediate);
        sub.categories = BTreeSet::from(["All".to_string()]);
        let sub_id = repo.insert_subscription(sub).await.unwrap();
        for category in ["Robbery", "Vandalism", "Fraud"] {
            repo.insert_incident(incident(category, JOHANNESBURG, now - ChronoDuration::minutes(1)))
                .await
                .unwrap();
        }

        engine.run_tier(CadenceTier::Immediate, now).await.unwrap();

        let records = repo.deliveries_for_subscription(sub_id).await.unwrap();
        assert_eq!(records[0].incident_count, 3);
    }

    #[tokio::test]
    async fn zone_includes_nearby_city_and_excludes_distant_one() {
        let repo = repository().await;
        let email = FakeChannel::new(ChannelKind::Email, false);
        let engine = engine(&repo, &[email.clone()]);
        let now = Utc::now();

        let sub_id = repo
            .insert_subscription(zone("Gauteng", JOHANNESBURG, 60.0, CadenceTier::Weekly))
            .await
            .unwrap();
        let pretoria = repo
            .insert_incident(incident("Hijacking", PRETORIA, now - ChronoDuration::days(2)))
            .await
            .unwrap();
        repo.insert_incident(incident("Hijacking", CAPE_TOWN, now - ChronoDuration::days(2)))
            .await
            .unwrap();
        // Outside the weekly window.
        repo.insert_incident(incident("Hijacking", JOHANNESBURG, now - ChronoDuration::days(8)))
            .await
            .unwrap();

        engine.run_tier(CadenceTier::Weekly, now).await.unwrap();

        let records = repo.deliveries_for_subscription(sub_id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].incident_ids, BTreeSet::from([pretoria]));
        assert_eq!(records[0].tier, CadenceTier::Weekly);
    }

    #[tokio::test]
    async fn malformed_subscription_does_not_stop_the_cycle() {
        let repo = repository().await;
        let email = FakeChannel::new(ChannelKind::Email, false);
        let engine = engine(&repo, &[email.clone()]);
        let now = Utc::now();

        repo.insert_subscription(zone("Broken", JOHANNESBURG, -1.0, CadenceTier::Immediate))
            .await
            .unwrap();
        let healthy = repo
            .insert_subscription(zone("Home", JOHANNESBURG, 10.0, CadenceTier::Immediate))
            .await
            .unwrap();
        repo.insert_incident(incident("Robbery", JOHANNESBURG, now - ChronoDuration::minutes(3)))
            .await
            .unwrap();

        let report = engine.run_tier(CadenceTier::Immediate, now).await.unwrap();
        assert_eq!(report.subscriptions, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(repo.deliveries_for_subscription(healthy).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn store_failure_stops_unstarted_subscriptions() {
        let repo = repository().await;
        let email = FakeChannel::new(ChannelKind::Email, false);
        let incidents = Arc::new(UnreachableIncidents::default());
        let engine = Engine::new(
            repo.clone(),
            incidents.clone(),
            repo.clone(),
            dispatcher(&repo, &[email.clone()]),
            EngineSettings {
                max_concurrent_subscriptions: 1,
                ..EngineSettings::default()
            },
        );

        let mut ids = Vec::new();
        for name in ["Home", "Work", "School"] {
            let id = repo
                .insert_subscription(zone(name, JOHANNESBURG, 10.0, CadenceTier::Immediate))
                .await
                .unwrap();
            ids.push(id);
        }

        let err = engine.run_tier(CadenceTier::Immediate, Utc::now()).await.unwrap_err();
        assert!(err.is_data_access(), "got {err}");

        // Only the first subscription reached the store; the rest never started.
        assert_eq!(incidents.calls.load(Ordering::SeqCst), 1);
        assert_eq!(email.sent_count(), 0);
        for id in ids {
            assert!(repo.deliveries_for_subscription(id).await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn timed_out_cycle_commits_nothing_and_retries() {
        let repo = repository().await;
        let email = FakeChannel::stalling(ChannelKind::Email, Duration::from_millis(500));
        let engine = engine_with(
            &repo,
            &[email.clone()],
            EngineSettings {
                cycle_timeout: Duration::from_millis(50),
                ..EngineSettings::default()
            },
        );
        let now = Utc::now();

        let sub_id = repo
            .insert_subscription(zone("Home", JOHANNESBURG, 10.0, CadenceTier::Immediate))
            .await
            .unwrap();
        repo.insert_incident(incident("Robbery", JOHANNESBURG, now - ChronoDuration::minutes(5)))
            .await
            .unwrap();

        let subs = repo.list_active(CadenceTier::Immediate).await.unwrap();
        let window = Window::ending_at(CadenceTier::Immediate, now);
        let err = engine.run_with_timeout(&subs[0], &window).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::CycleTimeout { subscription_id, .. } if subscription_id == sub_id
        ));

        let report = engine.run_tier(CadenceTier::Immediate, Utc::now()).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.in_flight, 0);
        assert!(repo.deliveries_for_subscription(sub_id).await.unwrap().is_empty());

        // The abandoned cycles released their single-flight slot.
        email.stop_stalling();
        let report = engine.run_tier(CadenceTier::Immediate, Utc::now()).await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(report.in_flight, 0);
        assert_eq!(repo.deliveries_for_subscription(sub_id).await.unwrap().len(), 1);
        assert_eq!(email.sent_count(), 1);
    }
}
