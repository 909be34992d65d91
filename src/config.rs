use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{NaiveTime, Weekday};
use serde::{Deserialize, Serialize};

use crate::engine::EngineSettings;
use crate::error::{AppError, Result};

const APP_DIR: &str = "zone-alerts";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default)]
    pub schedule: ScheduleConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    pub email: Option<EmailConfig>,
    pub sms: Option<SmsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_immediate_interval")]
    pub immediate_interval_minutes: u32,

    /// Local time of the daily digest, `HH:MM`.
    #[serde(default = "default_digest_time")]
    pub daily_at: String,

    #[serde(default = "default_weekly_day")]
    pub weekly_day: String,

    /// Local time of the weekly summary, `HH:MM`.
    #[serde(default = "default_digest_time")]
    pub weekly_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_cycle_timeout")]
    pub cycle_timeout_secs: u64,

    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_subscriptions: usize,

    /// Name shown in notification subjects and texts.
    #[serde(default = "default_brand")]
    pub brand: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    /// Resend API key.
    pub api_key: String,
    pub from_address: String,
    pub reply_to: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsConfig {
    pub account_sid: String,
    pub auth_token: String,
    pub from_number: String,

    #[serde(default = "default_twilio_api")]
    pub api_base: String,
}

fn default_db_path() -> String {
    let data_dir = dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR);
    std::fs::create_dir_all(&data_dir).ok();
    data_dir.join("alerts.db").to_string_lossy().to_string()
}

fn default_immediate_interval() -> u32 {
    15
}

fn default_digest_time() -> String {
    "08:00".to_string()
}

fn default_weekly_day() -> String {
    "monday".to_string()
}

fn default_cycle_timeout() -> u64 {
    120
}

fn default_max_concurrent() -> usize {
    5
}

fn default_brand() -> String {
    "FindSafety".to_string()
}

fn default_twilio_api() -> String {
    "https://api.twilio.com/2010-04-01".to_string()
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            immediate_interval_minutes: default_immediate_interval(),
            daily_at: default_digest_time(),
            weekly_day: default_weekly_day(),
            weekly_at: default_digest_time(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cycle_timeout_secs: default_cycle_timeout(),
            max_concurrent_subscriptions: default_max_concurrent(),
            brand: default_brand(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            schedule: ScheduleConfig::default(),
            engine: EngineConfig::default(),
            email: None,
            sms: None,
        }
    }
}

impl ScheduleConfig {
    pub fn immediate_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.immediate_interval_minutes) * 60)
    }

    pub fn daily_time(&self) -> Result<NaiveTime> {
        parse_clock("schedule.daily_at", &self.daily_at)
    }

    pub fn weekly_time(&self) -> Result<NaiveTime> {
        parse_clock("schedule.weekly_at", &self.weekly_at)
    }

    pub fn weekly_weekday(&self) -> Result<Weekday> {
        self.weekly_day.trim().parse::<Weekday>().map_err(|_| {
            AppError::Config(format!(
                "schedule.weekly_day: '{}' is not a weekday",
                self.weekly_day
            ))
        })
    }
}

impl From<&EngineConfig> for EngineSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            cycle_timeout: Duration::from_secs(config.cycle_timeout_secs),
            max_concurrent_subscriptions: config.max_concurrent_subscriptions,
        }
    }
}

fn parse_clock(field: &str, value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .map_err(|e| AppError::Config(format!("{}: '{}' is not HH:MM ({})", field, value, e)))
}

impl Config {
    /// Loads the default config file, writing one with defaults if missing.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)?;
            toml::from_str::<Config>(&content)?
        } else {
            let config = Config::default();
            config.save_to(config_path)?;
            config
        };
        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self).map_err(|e| AppError::Config(e.to_string()))?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("config.toml")
    }

    pub fn validate(&self) -> Result<()> {
        if self.schedule.immediate_interval_minutes == 0 {
            return Err(AppError::Config(
                "schedule.immediate_interval_minutes must be positive".to_string(),
            ));
        }
        self.schedule.daily_time()?;
        self.schedule.weekly_time()?;
        self.schedule.weekly_weekday()?;

        if self.engine.cycle_timeout_secs == 0 {
            return Err(AppError::Config(
                "engine.cycle_timeout_secs must be positive".to_string(),
            ));
        }
        if self.engine.max_concurrent_subscriptions == 0 {
            return Err(AppError::Config(
                "engine.max_concurrent_subscriptions must be positive".to_string(),
            ));
        }
        if let Some(email) = &self.email {
            if email.api_key.trim().is_empty() {
                return Err(AppError::Config("email.api_key must be set".to_string()));
            }
            if !email.from_address.contains('@') {
                return Err(AppError::Config(format!(
                    "email.from_address: '{}' is not an address",
                    email.from_address
                )));
            }
        }
        if let Some(sms) = &self.sms {
            url::Url::parse(&sms.api_base)
                .map_err(|e| AppError::Config(format!("sms.api_base: {}", e)))?;
        }
        Ok(())
    }
}
