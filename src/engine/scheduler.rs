use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Datelike, Days, Local, NaiveDateTime, NaiveTime, TimeZone, Utc, Weekday};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::pipeline::Engine;
use crate::config::ScheduleConfig;
use crate::error::Result;
use crate::models::CadenceTier;

/// When a tier's timer fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Every(Duration),
    DailyAt(NaiveTime),
    WeeklyAt(Weekday, NaiveTime),
}

impl Trigger {
    pub fn for_tier(tier: CadenceTier, schedule: &ScheduleConfig) -> Result<Self> {
        Ok(match tier {
            CadenceTier::Immediate => Trigger::Every(schedule.immediate_interval()),
            CadenceTier::Daily => Trigger::DailyAt(schedule.daily_time()?),
            CadenceTier::Weekly => {
                Trigger::WeeklyAt(schedule.weekly_weekday()?, schedule.weekly_time()?)
            }
        })
    }

    /// The first firing strictly after `now`, in `now`'s time zone.
    pub fn next_after<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> DateTime<Tz> {
        match *self {
            Trigger::Every(period) => {
                let period = chrono::Duration::from_std(period)
                    .unwrap_or_else(|_| chrono::Duration::minutes(15));
                now.clone() + period
            }
            Trigger::DailyAt(at) => {
                let mut date = now.date_naive();
                loop {
                    let candidate = localize(&now.timezone(), date.and_time(at));
                    if candidate > *now {
                        return candidate;
                    }
                    date = date + Days::new(1);
                }
            }
            Trigger::WeeklyAt(day, at) => {
                let today = now.date_naive();
                let ahead = (7 + day.num_days_from_monday()
                    - today.weekday().num_days_from_monday())
                    % 7;
                let mut date = today + Days::new(u64::from(ahead));
                loop {
                    let candidate = localize(&now.timezone(), date.and_time(at));
                    if candidate > *now {
                        return candidate;
                    }
                    date = date + Days::new(7);
                }
            }
        }
    }

    /// Time to sleep from `now` until the next firing.
    pub fn delay_from<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Duration {
        (self.next_after(now) - now.clone())
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// Wall-clock local times can be skipped or repeated around DST changes;
/// take the earliest valid instant, moving forward out of a gap.
fn localize<Tz: TimeZone>(tz: &Tz, naive: NaiveDateTime) -> DateTime<Tz> {
    let mut naive = naive;
    loop {
        if let Some(dt) = tz.from_local_datetime(&naive).earliest() {
            return dt;
        }
        naive += chrono::Duration::minutes(30);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierState {
    Idle,
    Scanning,
}

/// Owns one independent, cancellable timer task per cadence tier.
pub struct Scheduler {
    engine: Arc<Engine>,
    triggers: Vec<(CadenceTier, Trigger)>,
    states: Arc<Mutex<BTreeMap<CadenceTier, TierState>>>,
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(engine: Arc<Engine>, triggers: Vec<(CadenceTier, Trigger)>) -> Self {
        let states = triggers
            .iter()
            .map(|(tier, _)| (*tier, TierState::Idle))
            .collect();
        Self {
            engine,
            triggers,
            states: Arc::new(Mutex::new(states)),
            token: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    pub fn from_config(engine: Arc<Engine>, schedule: &ScheduleConfig) -> Result<Self> {
        let triggers = CadenceTier::ALL
            .iter()
            .map(|&tier| Trigger::for_tier(tier, schedule).map(|t| (tier, t)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(engine, triggers))
    }

    pub fn state(&self, tier: CadenceTier) -> Option<TierState> {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&tier)
            .copied()
    }

    pub fn is_running(&self) -> bool {
        !self.handles.is_empty()
    }

    /// Spawns the tier timers. Calling it again while running does nothing.
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }
        for &(tier, trigger) in &self.triggers {
            let engine = Arc::clone(&self.engine);
            let states = Arc::clone(&self.states);
            let token = self.token.child_token();
            self.handles.push(tokio::spawn(run_tier_loop(
                engine, tier, trigger, states, token,
            )));
            tracing::info!(%tier, ?trigger, "Tier timer started");
        }
    }

    /// Cancels every tier and waits for the tasks to finish. A cycle that is
    /// mid-flight is dropped before its commit, so it is retried on the next
    /// start.
    pub async fn shutdown(mut self) {
        self.token.cancel();
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Tier task ended abnormally");
            }
        }
        tracing::info!("Scheduler stopped");
    }
}

async fn run_tier_loop(
    engine: Arc<Engine>,
    tier: CadenceTier,
    trigger: Trigger,
    states: Arc<Mutex<BTreeMap<CadenceTier, TierState>>>,
    token: CancellationToken,
) {
    let set_state = |state: TierState| {
        states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tier, state);
    };

    loop {
        let delay = trigger.delay_from(&Local::now());
        tracing::debug!(%tier, ?delay, "Waiting for next tick");
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        set_state(TierState::Scanning);
        tokio::select! {
            _ = token.cancelled() => {
                set_state(TierState::Idle);
                break;
            }
            result = engine.run_tier(tier, Utc::now()) => match result {
                Ok(report) => tracing::info!(
                    %tier,
                    subscriptions = report.subscriptions,
                    delivered = report.delivered,
                    already_covered = report.already_covered,
                    conflicts = report.conflicts,
                    failed = report.failed,
                    "Cycle complete"
                ),
                Err(e) => tracing::error!(%tier, error = %e, "Cycle aborted, retrying next tick"),
            }
        }
        set_state(TierState::Idle);
    }
}
