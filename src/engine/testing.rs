//! Fixtures shared by the engine tests.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::channels::{Channel, Message};
use crate::db::Repository;
use crate::error::{AppError, Result};
use crate::models::{
    CadenceTier, ChannelKind, Contact, Coordinates, Location, NewIncident, NewSubscription,
    Severity,
};

use super::dispatch::Dispatcher;
use super::pipeline::{Engine, EngineSettings};

pub const JOHANNESBURG: Coordinates = Coordinates::new(-26.2041, 28.0473);
pub const PRETORIA: Coordinates = Coordinates::new(-25.7479, 28.2293);
pub const CAPE_TOWN: Coordinates = Coordinates::new(-33.9249, 18.4241);

/// Records every send and optionally fails it or stalls before answering.
pub struct FakeChannel {
    kind: ChannelKind,
    fail: bool,
    stall: Option<Duration>,
    stalling: AtomicBool,
    pub sent: Mutex<Vec<(String, Message)>>,
}

impl FakeChannel {
    pub fn new(kind: ChannelKind, fail: bool) -> Arc<Self> {
        Arc::new(Self {
            kind,
            fail,
            stall: None,
            stalling: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        })
    }

    /// A channel that sleeps for `stall` on every send until
    /// [`stop_stalling`](Self::stop_stalling) is called.
    pub fn stalling(kind: ChannelKind, stall: Duration) -> Arc<Self> {
        Arc::new(Self {
            kind,
            fail: false,
            stall: Some(stall),
            stalling: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn stop_stalling(&self) {
        self.stalling.store(false, Ordering::SeqCst);
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl Channel for FakeChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    async fn send(&self, recipient: &str, message: &Message) -> Result<()> {
        if let Some(stall) = self.stall.filter(|_| self.stalling.load(Ordering::SeqCst)) {
            tokio::time::sleep(stall).await;
        }
        self.sent
            .lock()
            .unwrap()
            .push((recipient.to_string(), message.clone()));
        if self.fail {
            return Err(AppError::ChannelSend {
                channel: self.kind,
                reason: "provider unavailable".to_string(),
            });
        }
        Ok(())
    }
}

pub fn zone(name: &str, center: Coordinates, radius_km: f64, cadence: CadenceTier) -> NewSubscription {
    NewSubscription {
        owner_id: "owner-1".to_string(),
        name: name.to_string(),
        center,
        location_label: Some(name.to_string()),
        radius_km,
        categories: BTreeSet::new(),
        severities: BTreeSet::new(),
        channels: BTreeSet::from([ChannelKind::Email, ChannelKind::Sms]),
        cadence,
        active: true,
    }
}

pub fn incident(category: &str, at: Coordinates, occurred_at: DateTime<Utc>) -> NewIncident {
    NewIncident {
        category: category.to_string(),
        severity: Severity::High,
        description: format!("{} reported", category),
        location: Location {
            coordinates: Some(at),
            address: None,
        },
        occurred_at,
    }
}

/// An in-memory repository with a contact for `owner-1`.
pub async fn repository() -> Arc<Repository> {
    let repo = Repository::open_in_memory().await.unwrap();
    repo.upsert_contact(
        "owner-1",
        Contact {
            email: Some("owner@example.org".to_string()),
            phone: Some("+27110000000".to_string()),
        },
    )
    .await
    .unwrap();
    Arc::new(repo)
}

pub fn engine(repo: &Arc<Repository>, channels: &[Arc<FakeChannel>]) -> Engine {
    engine_with(repo, channels, EngineSettings::default())
}

pub fn engine_with(
    repo: &Arc<Repository>,
    channels: &[Arc<FakeChannel>],
    settings: EngineSettings,
) -> Engine {
    Engine::new(
        repo.clone(),
        repo.clone(),
        repo.clone(),
        dispatcher(repo, channels),
        settings,
    )
}

pub fn dispatcher(repo: &Arc<Repository>, channels: &[Arc<FakeChannel>]) -> Dispatcher {
    let mut dispatcher = Dispatcher::new(repo.clone(), "FindSafety").unwrap();
    for channel in channels {
        dispatcher = dispatcher.with_channel(channel.clone());
    }
    dispatcher
}
