mod email;
mod message;
mod sms;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::ChannelKind;

pub use email::EmailChannel;
pub use message::{Message, MessageTemplates, MAX_LISTED_INCIDENTS};
pub use sms::SmsChannel;

/// A delivery channel. Implementations report any failure as
/// [`AppError::ChannelSend`](crate::error::AppError::ChannelSend) and never
/// retry on their own.
#[async_trait]
pub trait Channel: Send + Sync {
    fn kind(&self) -> ChannelKind;

    async fn send(&self, recipient: &str, message: &Message) -> Result<()>;
}
