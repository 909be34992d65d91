mod delivery;
mod incident;
mod location;
mod subscription;

pub use delivery::{ChannelKind, Contact, DeliveryRecord, NewDelivery};
pub use incident::{IncidentRecord, MatchResult, NewIncident, Severity};
pub use location::{BoundingBox, Coordinates, Location};
pub use subscription::{
    CadenceTier, NewSubscription, Subscription, CATEGORY_WILDCARD, DEFAULT_RADIUS_KM,
};
