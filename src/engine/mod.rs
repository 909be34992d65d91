mod dedup;
mod dispatch;
mod geo;
mod pipeline;
mod scheduler;
mod window;

#[cfg(test)]
mod testing;

pub use dedup::{exclude_covered, DedupGuard};
pub use dispatch::Dispatcher;
pub use geo::{bounding_box, haversine_km, match_incidents, EARTH_RADIUS_KM};
pub use pipeline::{CycleOutcome, CycleReport, Engine, EngineSettings};
pub use scheduler::{Scheduler, TierState, Trigger};
pub use window::{lookback, window_start, Window};
