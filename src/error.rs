use thiserror::Error;

use crate::models::ChannelKind;

#[derive(Error, Debug)]
pub enum AppError {
    /// Store unreachable or a query failed. Aborts the current tier cycle.
    #[error("Data access error: {0}")]
    DataAccess(#[from] tokio_rusqlite::Error),

    #[error("Malformed subscription {id}: {reason}")]
    MalformedSubscription { id: i64, reason: String },

    #[error("{channel} send failed: {reason}")]
    ChannelSend { channel: ChannelKind, reason: String },

    #[error("Coverage for subscription {subscription_id} was already committed")]
    DedupConflict { subscription_id: i64 },

    #[error("Cycle for subscription {subscription_id} timed out after {seconds}s")]
    CycleTimeout { subscription_id: i64, seconds: u64 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Template error: {0}")]
    Template(#[from] handlebars::TemplateError),

    #[error("Render error: {0}")]
    Render(#[from] handlebars::RenderError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        AppError::DataAccess(tokio_rusqlite::Error::Rusqlite(err))
    }
}

impl AppError {
    /// Store-level failures escalate to aborting the tier cycle; everything
    /// else stays local to one subscription or one channel.
    pub fn is_data_access(&self) -> bool {
        matches!(self, AppError::DataAccess(_))
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
