use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::CadenceTier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Email,
    Sms,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Email => "email",
            ChannelKind::Sms => "sms",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "email" => Ok(ChannelKind::Email),
            "sms" => Ok(ChannelKind::Sms),
            other => Err(format!("unknown channel '{}'", other)),
        }
    }
}

/// Audit record produced by a dispatch, not yet committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDelivery {
    pub subscription_id: i64,
    pub owner_id: String,
    pub tier: CadenceTier,
    pub incident_ids: BTreeSet<i64>,
    pub channels_succeeded: BTreeSet<ChannelKind>,
    pub incident_count: usize,
    pub sent_at: DateTime<Utc>,
}

impl NewDelivery {
    pub fn into_record(self, id: i64) -> DeliveryRecord {
        DeliveryRecord {
            id,
            subscription_id: self.subscription_id,
            owner_id: self.owner_id,
            tier: self.tier,
            incident_ids: self.incident_ids,
            channels_succeeded: self.channels_succeeded,
            incident_count: self.incident_count,
            sent_at: self.sent_at,
        }
    }
}

/// Committed audit record. The delivery store is the only source of dedup
/// state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub id: i64,
    pub subscription_id: i64,
    pub owner_id: String,
    pub tier: CadenceTier,
    pub incident_ids: BTreeSet<i64>,
    pub channels_succeeded: BTreeSet<ChannelKind>,
    pub incident_count: usize,
    pub sent_at: DateTime<Utc>,
}

/// Contact details for a subscription owner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub email: Option<String>,
    pub phone: Option<String>,
}

impl Contact {
    pub fn address_for(&self, channel: ChannelKind) -> Option<&str> {
        match channel {
            ChannelKind::Email => self.email.as_deref(),
            ChannelKind::Sms => self.phone.as_deref(),
        }
        .filter(|s| !s.trim().is_empty())
    }
}
