use std::time::Duration;

use async_trait::async_trait;
use resend_rs::types::CreateEmailBaseOptions;
use resend_rs::Resend;

use super::{Channel, Message};
use crate::config::EmailConfig;
use crate::error::{AppError, Result};
use crate::models::ChannelKind;

/// Email delivery through the Resend API.
pub struct EmailChannel {
    resend: Resend,
    from_address: String,
    reply_to: Option<String>,
}

impl EmailChannel {
    pub fn new(config: &EmailConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("zone-alerts/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            resend: Resend::with_client(&config.api_key, http_client),
            from_address: config.from_address.clone(),
            reply_to: config.reply_to.clone(),
        })
    }

    fn request(&self, recipient: &str, message: &Message) -> CreateEmailBaseOptions {
        let request =
            CreateEmailBaseOptions::new(self.from_address.as_str(), [recipient], message.subject.as_str())
                .with_html(&message.html)
                .with_text(&message.text);
        match &self.reply_to {
            Some(reply_to) => request.with_reply(reply_to.as_str()),
            None => request,
        }
    }
}

#[async_trait]
impl Channel for EmailChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Email
    }

    async fn send(&self, recipient: &str, message: &Message) -> Result<()> {
        let response = self
            .resend
            .emails
            .send(self.request(recipient, message))
            .await
            .map_err(|e| AppError::ChannelSend {
                channel: ChannelKind::Email,
                reason: e.to_string(),
            })?;

        tracing::debug!(recipient, email_id = %response.id, "Email accepted by Resend");
        Ok(())
    }
}
