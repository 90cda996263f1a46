use std::sync::Arc;

use async_trait::async_trait;
use serenity::all::{ChannelId, CreateEmbed, CreateMessage, GuildId, UserId};
use serenity::http::Http;
use tracing::{debug, info};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    StreakStarted { user_id: UserId, count: u32 },
    StreakContinued { user_id: UserId, count: u32 },
    StreakEnded { user_id: UserId, previous_count: u32 },
    StreakWarning { user_id: UserId, count: u32, threshold_minutes: u32 },
    ActivityCompleted { user_id: UserId, minutes: u32 },
    /// A session closed by the sweep because the user was no longer in voice.
    SessionExpired { user_id: UserId, minutes: u32 },
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::StreakStarted { .. } => "streak_started",
            Notification::StreakContinued { .. } => "streak_continued",
            Notification::StreakEnded { .. } => "streak_ended",
            Notification::StreakWarning { .. } => "streak_warning",
            Notification::ActivityCompleted { .. } => "activity_completed",
            Notification::SessionExpired { .. } => "session_expired",
        }
    }

    pub fn user_id(&self) -> UserId {
        match self {
            Notification::StreakStarted { user_id, .. }
            | Notification::StreakContinued { user_id, .. }
            | Notification::StreakEnded { user_id, .. }
            | Notification::StreakWarning { user_id, .. }
            | Notification::ActivityCompleted { user_id, .. }
            | Notification::SessionExpired { user_id, .. } => *user_id,
        }
    }

    fn embed(&self) -> CreateEmbed {
        let (title, description, colour): (String, String, u32) = match *self {
            Notification::StreakStarted { user_id, count } => (
                "🚀 New Streak Started! 🚀".to_string(),
                format!("<@{user_id}> has started a new study streak! Currently **{count} day** strong. 🔥"),
                0x7CFC00,
            ),
            Notification::StreakContinued { user_id, count } => {
                let (emoji, milestone) = milestone(count);
                (
                    format!("{emoji} Day {count} Complete! {emoji}"),
                    format!("<@{user_id}> is now on a **{count} day** study streak!{milestone}"),
                    0x00AAFF,
                )
            }
            Notification::StreakEnded { user_id, previous_count } => (
                "💔 Streak Ended 💔".to_string(),
                format!(
                    "<@{user_id}>'s study streak of **{previous_count} days** has come to an end. \
                     Join a tracked voice channel today to start a new one! 💪"
                ),
                0xFF0000,
            ),
            Notification::StreakWarning { user_id, count, threshold_minutes } => (
                "⏰ Streak Warning! ⏰".to_string(),
                format!(
                    "<@{user_id}>, your **{count} day** study streak is in danger! \
                     Spend at least **{threshold_minutes} minutes** in a tracked voice channel before midnight to keep it."
                ),
                0xFFA500,
            ),
            Notification::ActivityCompleted { user_id, minutes } => (
                "✅ Daily Activity Complete! ✅".to_string(),
                format!("<@{user_id}> has completed **{minutes} minutes** of voice activity today! 🎯"),
                0x00FF00,
            ),
            Notification::SessionExpired { user_id, minutes } => (
                "⏰ Session Auto-Ended".to_string(),
                format!(
                    "<@{user_id}>'s study session was closed after **{}** because they had left voice \
                     without the bot noticing.",
                    format_minutes(u64::from(minutes))
                ),
                0x808080,
            ),
        };

        CreateEmbed::new().title(title).description(description).colour(colour)
    }
}

/// `95` reads as `1h 35m`.
pub fn format_minutes(minutes: u64) -> String {
    match (minutes / 60, minutes % 60) {
        (0, m) => format!("{m}m"),
        (h, 0) => format!("{h}h"),
        (h, m) => format!("{h}h {m}m"),
    }
}

fn milestone(count: u32) -> (&'static str, &'static str) {
    match count {
        7 => ("🌟", " One week strong!"),
        14 => ("💫", " Two weeks!"),
        30 => ("🏆", " One month!"),
        60 => ("👑", " Two months!"),
        100 => ("🎖️", " 100 days!"),
        _ => ("🔥", ""),
    }
}

/// Outbound sink for streak outcomes. Delivery is best-effort: callers log
/// failures and never undo the state change that produced the notification.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, guild_id: GuildId, notification: Notification) -> Result<()>;
}

/// Posts notifications as embeds to one configured text channel.
pub struct ChannelNotifier {
    http: Arc<Http>,
    channel_id: Option<ChannelId>,
}

impl ChannelNotifier {
    pub fn new(http: Arc<Http>, channel_id: Option<ChannelId>) -> Self {
        if channel_id.is_none() {
            info!("no notification channel configured; streak notifications will only be logged");
        }
        Self { http, channel_id }
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn notify(&self, guild_id: GuildId, notification: Notification) -> Result<()> {
        let Some(channel_id) = self.channel_id else {
            debug!(
                guild_id = guild_id.get(),
                user_id = notification.user_id().get(),
                kind = notification.kind(),
                "dropping notification"
            );
            return Ok(());
        };

        channel_id
            .send_message(&self.http, CreateMessage::new().embed(notification.embed()))
            .await?;
        Ok(())
    }
}
