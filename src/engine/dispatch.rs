use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;

use crate::channels::{Channel, Message, MessageTemplates};
use crate::db::RecipientResolver;
use crate::error::{AppError, Result};
use crate::models::{CadenceTier, ChannelKind, Contact, MatchResult, NewDelivery, Subscription};

/// Fans a notification out over a subscription's channels.
///
/// Every requested channel is attempted, concurrently and independently.
/// The resulting record always carries the full incident set so the
/// incidents count as covered even when every channel failed.
pub struct Dispatcher {
    channels: HashMap<ChannelKind, Arc<dyn Channel>>,
    resolver: Arc<dyn RecipientResolver>,
    templates: MessageTemplates,
    brand: String,
}

impl Dispatcher {
    pub fn new(resolver: Arc<dyn RecipientResolver>, brand: impl Into<String>) -> Result<Self> {
        Ok(Self {
            channels: HashMap::new(),
            resolver,
            templates: MessageTemplates::new()?,
            brand: brand.into(),
        })
    }

    /// Registers the implementation for one channel kind, replacing any
    /// previous one.
    pub fn with_channel(mut self, channel: Arc<dyn Channel>) -> Self {
        self.channels.insert(channel.kind(), channel);
        self
    }

    pub fn registered(&self) -> BTreeSet<ChannelKind> {
        self.channels.keys().copied().collect()
    }

    pub async fn dispatch(
        &self,
        sub: &Subscription,
        tier: CadenceTier,
        matches: &[MatchResult],
    ) -> Result<NewDelivery> {
        let contact = self.resolver.resolve(&sub.owner_id).await?;
        let message = self.templates.compose(&self.brand, sub, matches)?;

        let attempts = sub.channels.iter().map(|&kind| {
            let contact = &contact;
            let message = &message;
            async move { (kind, self.send_one(kind, contact, message).await) }
        });

        let mut channels_succeeded = BTreeSet::new();
        for (kind, outcome) in join_all(attempts).await {
            match outcome {
                Ok(()) => {
                    channels_succeeded.insert(kind);
                }
                Err(e) => {
                    tracing::warn!(
                        subscription_id = sub.id,
                        channel = %kind,
                        error = %e,
                        "Channel delivery failed"
                    );
                }
            }
        }

        let incident_ids: BTreeSet<i64> = matches.iter().map(MatchResult::incident_id).collect();
        Ok(NewDelivery {
            subscription_id: sub.id,
            owner_id: sub.owner_id.clone(),
            tier,
            incident_count: incident_ids.len(),
            incident_ids,
            channels_succeeded,
            sent_at: Utc::now(),
        })
    }

    async fn send_one(&self, kind: ChannelKind, contact: &Contact, message: &Message) -> Result<()> {
        let channel = self.channels.get(&kind).ok_or_else(|| AppError::ChannelSend {
            channel: kind,
            reason: "channel is not configured".to_string(),
        })?;
        let recipient = contact
            .address_for(kind)
            .ok_or_else(|| AppError::ChannelSend {
                channel: kind,
                reason: "no recipient on file".to_string(),
            })?;
        channel.send(recipient, message).await
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::engine::testing::{FakeChannel, JOHANNESBURG};
    use crate::models::{IncidentRecord, Location, Severity};

    struct FixedResolver(Contact);

    #[async_trait]
    impl RecipientResolver for FixedResolver {
        async fn resolve(&self, _owner_id: &str) -> Result<Contact> {
            Ok(self.0.clone())
        }
    }

    fn contact() -> Contact {
        Contact {
            email: Some("owner@example.org".to_string()),
            phone: Some("+27110000000".to_string()),
        }
    }

    fn subscription(channels: &[ChannelKind]) -> Subscription {
        Subscription {
            id: 9,
            owner_id: "owner".to_string(),
            name: "Home".to_string(),
            center: JOHANNESBURG,
            location_label: None,
            radius_km: 10.0,
            categories: BTreeSet::new(),
            severities: BTreeSet::new(),
            channels: channels.iter().copied().collect(),
            cadence: CadenceTier::Immediate,
            active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn matches() -> Vec<MatchResult> {
        [11, 12]
            .into_iter()
            .map(|id| MatchResult {
                subscription_id: 9,
                incident: IncidentRecord {
                    id,
                    category: "Robbery".to_string(),
                    severity: Severity::High,
                    description: String::new(),
                    location: Location::default(),
                    occurred_at: Utc::now(),
                },
                distance_km: 1.0,
            })
            .collect()
    }

    #[tokio::test]
    async fn email_failure_does_not_block_sms() {
        let email = FakeChannel::new(ChannelKind::Email, true);
        let sms = FakeChannel::new(ChannelKind::Sms, false);
        let dispatcher = Dispatcher::new(Arc::new(FixedResolver(contact())), "FindSafety")
            .unwrap()
            .with_channel(email.clone())
            .with_channel(sms.clone());

        let sub = subscription(&[ChannelKind::Email, ChannelKind::Sms]);
        let delivery = dispatcher
            .dispatch(&sub, CadenceTier::Immediate, &matches())
            .await
            .unwrap();

        assert_eq!(delivery.channels_succeeded, BTreeSet::from([ChannelKind::Sms]));
        assert_eq!(delivery.incident_ids, BTreeSet::from([11, 12]));
        assert_eq!(delivery.incident_count, 2);
        assert_eq!(email.sent.lock().unwrap()[0].0, "owner@example.org");
        let sms_sent = sms.sent.lock().unwrap();
        assert_eq!(sms_sent[0].0, "+27110000000");
        assert!(sms_sent[0].1.text.contains("2 new incident(s)"));
    }

    #[tokio::test]
    async fn all_channels_failing_still_records_incidents() {
        let dispatcher = Dispatcher::new(Arc::new(FixedResolver(Contact::default())), "FindSafety")
            .unwrap()
            .with_channel(FakeChannel::new(ChannelKind::Email, false));

        let sub = subscription(&[ChannelKind::Email, ChannelKind::Sms]);
        let delivery = dispatcher
            .dispatch(&sub, CadenceTier::Daily, &matches())
            .await
            .unwrap();

        // No contact on file and no SMS implementation registered.
        assert!(delivery.channels_succeeded.is_empty());
        assert_eq!(delivery.incident_ids.len(), 2);
        assert_eq!(delivery.tier, CadenceTier::Daily);
    }

    #[tokio::test]
    async fn only_requested_channels_are_attempted() {
        let email = FakeChannel::new(ChannelKind::Email, false);
        let sms = FakeChannel::new(ChannelKind::Sms, false);
        let dispatcher = Dispatcher::new(Arc::new(FixedResolver(contact())), "FindSafety")
            .unwrap()
            .with_channel(email.clone())
            .with_channel(sms.clone());
        assert_eq!(dispatcher.registered().len(), 2);

        let delivery = dispatcher
            .dispatch(&subscription(&[ChannelKind::Email]), CadenceTier::Immediate, &matches())
            .await
            .unwrap();

        assert_eq!(delivery.channels_succeeded, BTreeSet::from([ChannelKind::Email]));
        assert_eq!(sms.sent_count(), 0);
    }
}
