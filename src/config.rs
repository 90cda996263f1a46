use std::collections::HashSet;

use chrono_tz::Tz;
use serenity::model::id::ChannelId;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::streak::DEFAULT_THRESHOLD_MINUTES;

const DEFAULT_DATABASE_URL: &str = "sqlite://streaks.db";
const DEFAULT_TIMEZONE: &str = "Asia/Manila";
const DEFAULT_EVALUATION_CRON: &str = "0 59 23 * * *";
const DEFAULT_WARNING_CRON: &str = "0 0 20 * * *";
const DEFAULT_SWEEP_CRON: &str = "0 */10 * * * *";
const DEFAULT_MAX_SESSION_HOURS: u32 = 4;

#[derive(Debug, Clone)]
pub struct Config {
    pub discord_token: String,
    pub database_url: String,
    pub timezone: Tz,
    /// Empty means every voice channel is tracked.
    pub tracked_channels: HashSet<ChannelId>,
    pub notification_channel: Option<ChannelId>,
    pub threshold_minutes: u32,
    pub evaluation_cron: String,
    pub warning_cron: String,
    /// Sessions older than this are ended when the user is no longer in voice.
    pub max_session_hours: u32,
    pub sweep_cron: String,
}

impl Config {
    /// Reads `.env` if present, then the process environment.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let discord_token = get("DISCORD_TOKEN")
            .ok_or_else(|| Error::Config("DISCORD_TOKEN must be set".to_string()))?;

        let timezone_name = get("STREAK_TIMEZONE").unwrap_or_else(|| DEFAULT_TIMEZONE.to_string());
        let timezone = timezone_name
            .parse::<Tz>()
            .map_err(|_| Error::Config(format!("unknown timezone '{timezone_name}'")))?;

        let tracked_channels = parse_channel_ids(get("TRACKED_VOICE_CHANNEL_IDS").as_deref().unwrap_or(""));
        if tracked_channels.is_empty() {
            info!("no tracked voice channels configured; every voice channel counts");
        } else {
            info!(channels = ?tracked_channels, "tracking study time in selected voice channels");
        }

        let notification_channel = match get("NOTIFICATION_CHANNEL_ID") {
            Some(raw) => Some(parse_channel_id(&raw).ok_or_else(|| {
                Error::Config(format!("NOTIFICATION_CHANNEL_ID '{raw}' is not a channel id"))
            })?),
            None => None,
        };

        let threshold_minutes = match get("MINIMUM_ACTIVITY_MINUTES") {
            Some(raw) => raw.parse::<u32>().ok().filter(|m| *m > 0).ok_or_else(|| {
                Error::Config(format!("MINIMUM_ACTIVITY_MINUTES '{raw}' must be a positive integer"))
            })?,
            None => DEFAULT_THRESHOLD_MINUTES,
        };

        let max_session_hours = match get("MAX_SESSION_HOURS") {
            Some(raw) => raw.parse::<u32>().ok().filter(|h| *h > 0).ok_or_else(|| {
                Error::Config(format!("MAX_SESSION_HOURS '{raw}' must be a positive integer"))
            })?,
            None => DEFAULT_MAX_SESSION_HOURS,
        };

        Ok(Self {
            discord_token,
            database_url: get("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            timezone,
            tracked_channels,
            notification_channel,
            threshold_minutes,
            evaluation_cron: get("EVALUATION_CRON").unwrap_or_else(|| DEFAULT_EVALUATION_CRON.to_string()),
            warning_cron: get("WARNING_CRON").unwrap_or_else(|| DEFAULT_WARNING_CRON.to_string()),
            max_session_hours,
            sweep_cron: get("SESSION_SWEEP_CRON").unwrap_or_else(|| DEFAULT_SWEEP_CRON.to_string()),
        })
    }
}

fn parse_channel_id(raw: &str) -> Option<ChannelId> {
    raw.trim().parse::<u64>().ok().filter(|id| *id != 0).map(ChannelId::new)
}

fn parse_channel_ids(raw: &str) -> HashSet<ChannelId> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| {
            let id = parse_channel_id(s);
            if id.is_none() {
                warn!(value = s, "skipping invalid voice channel id");
            }
            id
        })
        .collect()
}
