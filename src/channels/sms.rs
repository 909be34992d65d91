use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use super::{Channel, Message};
use crate::config::SmsConfig;
use crate::error::{AppError, Result};
use crate::models::ChannelKind;

#[derive(Debug, Deserialize)]
struct TwilioMessage {
    sid: Option<String>,
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TwilioError {
    code: Option<i64>,
    message: Option<String>,
}

/// SMS delivery through the Twilio Messages API.
pub struct SmsChannel {
    client: Client,
    api_base: String,
    account_sid: String,
    auth_token: String,
    from_number: String,
}

impl SmsChannel {
    pub fn new(config: &SmsConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            account_sid: config.account_sid.clone(),
            auth_token: config.auth_token.clone(),
            from_number: config.from_number.clone(),
        })
    }

    fn failure(reason: impl ToString) -> AppError {
        AppError::ChannelSend {
            channel: ChannelKind::Sms,
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl Channel for SmsChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Sms
    }

    async fn send(&self, recipient: &str, message: &Message) -> Result<()> {
        let url = format!(
            "{}/Accounts/{}/Messages.json",
            self.api_base, self.account_sid
        );
        let form = [
            ("To", recipient),
            ("From", self.from_number.as_str()),
            ("Body", message.text.as_str()),
        ];

        let response = self
            .client
            .post(url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&form)
            .send()
            .await
            .map_err(Self::failure)?;

        let status = response.status();
        if !status.is_success() {
            let reason = match response.json::<TwilioError>().await {
                Ok(TwilioError {
                    code,
                    message: Some(message),
                }) => format!("HTTP {} (code {}): {}", status, code.unwrap_or_default(), message),
                _ => format!("HTTP {}", status),
            };
            return Err(Self::failure(reason));
        }

        let accepted: TwilioMessage = response.json().await.map_err(Self::failure)?;
        tracing::debug!(
            recipient,
            sid = accepted.sid.as_deref().unwrap_or("-"),
            status = accepted.status.as_deref().unwrap_or("-"),
            "SMS queued"
        );
        Ok(())
    }
}
