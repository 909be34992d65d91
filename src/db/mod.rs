mod repository;
mod schema;
mod store;

pub use repository::{format_timestamp, Repository};
pub use store::{
    CoverageConflict, DeliveryStore, IncidentQuery, IncidentStore, RecipientResolver,
    SubscriptionStore,
};
