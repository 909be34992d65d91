use chrono::{DateTime, Duration, Utc};

use crate::models::CadenceTier;

/// How far back a cycle of `tier` looks for incidents and prior deliveries.
pub fn lookback(tier: CadenceTier) -> Duration {
    match tier {
        CadenceTier::Immediate => Duration::hours(1),
        CadenceTier::Daily => Duration::hours(24),
        CadenceTier::Weekly => Duration::days(7),
    }
}

pub fn window_start(now: DateTime<Utc>, tier: CadenceTier) -> DateTime<Utc> {
    now - lookback(tier)
}

/// The reporting window of one cycle. Computed once and shared by the
/// candidate fetch and the dedup lookup so both use the same cutoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub tier: CadenceTier,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    pub fn ending_at(tier: CadenceTier, now: DateTime<Utc>) -> Self {
        Self {
            tier,
            start: window_start(now, tier),
            end: now,
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at <= self.end
    }
}
