use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, NaiveDate, Utc};
use serenity::all::Cache;
use serenity::all::ChannelId;
use serenity::all::Command;
use serenity::all::CommandDataOptionValue;
use serenity::all::CommandInteraction;
use serenity::all::CommandOptionType;
use serenity::all::CreateCommand;
use serenity::all::CreateCommandOption;
use serenity::all::CreateInteractionResponse;
use serenity::all::CreateInteractionResponseMessage;
use serenity::all::GuildId;
use serenity::all::Interaction;
use serenity::all::Permissions;
use serenity::all::Ready;
use serenity::all::UserId;
use serenity::async_trait;
use serenity::model::voice::VoiceState;
use serenity::prelude::*;
use tracing::{debug, error, info, warn};

use crate::notifier::format_minutes;
use crate::reconciler::{ReconcilerHandle, VoiceEvent};
use crate::store::StreakRecord;
use crate::streak::StreakEvaluator;

/// Shared handles the gateway callbacks need, stored in the client's type map.
#[derive(Clone)]
pub struct StreakState {
    pub reconciler: ReconcilerHandle,
    pub evaluator: Arc<StreakEvaluator>,
    /// Empty means every voice channel is tracked.
    pub tracked_channels: Arc<HashSet<ChannelId>>,
}

impl TypeMapKey for StreakState {
    type Value = StreakState;
}

pub struct VoiceHandler;

fn streak_commands() -> Vec<CreateCommand> {
    vec![
        CreateCommand::new("streak").description("Shows your study streak and today's voice activity"),
        CreateCommand::new("stats").description("Shows your study time for today, this week, and this month"),
        CreateCommand::new("help").description("Lists what the study bot can do"),
        CreateCommand::new("streakreset")
            .description("Resets a member's current study streak")
            .default_member_permissions(Permissions::ADMINISTRATOR)
            .add_option(
                CreateCommandOption::new(CommandOptionType::User, "user", "Member whose streak is reset")
                    .required(true),
            ),
        CreateCommand::new("cleanupsessions")
            .description("Ends sessions of members who are no longer in a study channel")
            .default_member_permissions(Permissions::ADMINISTRATOR),
    ]
}

#[async_trait]
impl EventHandler for VoiceHandler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!(bot = %ready.user.name, "connected to discord");

        if let Err(e) = Command::set_global_commands(&ctx.http, streak_commands()).await {
            error!("failed to register global commands: {e}");
        }

        // Guild commands show up immediately, global ones can take a while.
        for guild_id in ctx.cache.guilds() {
            if let Err(e) = guild_id.set_commands(&ctx.http, streak_commands()).await {
                warn!(guild_id = guild_id.get(), "failed to register guild commands: {e}");
            }
        }
    }

    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let Some(guild_id) = new.guild_id else {
            return;
        };
        if new.member.as_ref().is_some_and(|member| member.user.bot) {
            return;
        }

        let event = VoiceEvent {
            user_id: new.user_id,
            guild_id,
            previous_channel: old.as_ref().and_then(|v| v.channel_id),
            new_channel: new.channel_id,
        };
        debug!(
            user_id = event.user_id.get(),
            previous = ?event.previous_channel,
            new = ?event.new_channel,
            "voice state update"
        );

        let Some(state) = streak_state(&ctx).await else {
            return;
        };
        if let Err(e) = state.reconciler.submit(event).await {
            error!(user_id = event.user_id.get(), "dropping voice event: {e}");
        }
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        let Interaction::Command(cmd) = interaction else {
            return;
        };
        let Some(state) = streak_state(&ctx).await else {
            return;
        };

        match cmd.data.name.as_str() {
            "streak" => handle_streak(&ctx, &cmd, &state).await,
            "stats" => handle_stats(&ctx, &cmd, &state).await,
            "help" => respond(&ctx, &cmd, &help_text(state.evaluator.threshold_minutes())).await,
            "streakreset" => handle_streak_reset(&ctx, &cmd, &state).await,
            "cleanupsessions" => handle_cleanup_sessions(&ctx, &cmd, &state).await,
            other => debug!(command = other, "ignoring unknown command"),
        }
    }
}

async fn streak_state(ctx: &Context) -> Option<StreakState> {
    let data = ctx.data.read().await;
    let state = data.get::<StreakState>().cloned();
    if state.is_none() {
        error!("streak state missing from client data");
    }
    state
}

async fn handle_streak(ctx: &Context, cmd: &CommandInteraction, state: &StreakState) {
    let Some(guild_id) = cmd.guild_id else {
        respond(ctx, cmd, "The /streak command only works inside a server.").await;
        return;
    };
    let user_id = cmd.user.id;
    let now = Utc::now();

    let record = match state.evaluator.status(user_id, guild_id).await {
        Ok(record) => record,
        Err(e) => {
            error!(user_id = user_id.get(), guild_id = guild_id.get(), "failed to load streak: {e}");
            respond(ctx, cmd, "Could not retrieve your streak information right now.").await;
            return;
        }
    };

    let live_minutes = match state.reconciler.active_session(user_id).await {
        Ok(session) => session
            .filter(|s| s.guild_id == guild_id)
            .map(|s| s.elapsed_minutes(now)),
        Err(e) => {
            warn!(user_id = user_id.get(), "could not query open session: {e}");
            None
        }
    };

    let today = state.evaluator.calendar().to_date(now);
    let text = describe_streak(
        user_id,
        record.as_ref(),
        today,
        state.evaluator.threshold_minutes(),
        live_minutes,
    );
    respond(ctx, cmd, &text).await;
}

async fn handle_stats(ctx: &Context, cmd: &CommandInteraction, state: &StreakState) {
    let Some(guild_id) = cmd.guild_id else {
        respond(ctx, cmd, "The /stats command only works inside a server.").await;
        return;
    };
    let user_id = cmd.user.id;
    let now = Utc::now();

    let record = match state.evaluator.status(user_id, guild_id).await {
        Ok(record) => record,
        Err(e) => {
            error!(user_id = user_id.get(), guild_id = guild_id.get(), "failed to load stats: {e}");
            respond(ctx, cmd, "Could not retrieve your study stats right now.").await;
            return;
        }
    };

    let today = state.evaluator.calendar().to_date(now);
    respond(ctx, cmd, &describe_stats(user_id, record.as_ref(), today)).await;
}

async fn handle_cleanup_sessions(ctx: &Context, cmd: &CommandInteraction, state: &StreakState) {
    let Some(guild_id) = cmd.guild_id else {
        respond(ctx, cmd, "This command only works inside a server.").await;
        return;
    };

    let cache = &ctx.cache;
    let tracked = &state.tracked_channels;
    let swept = state
        .reconciler
        .sweep(Utc::now(), Duration::zero(), Some(guild_id), |user_id, session| {
            still_in_tracked_voice(cache, tracked, session.guild_id, user_id)
        })
        .await;

    let text = match swept {
        Ok(0) => "No stale sessions found.".to_string(),
        Ok(n) => {
            info!(guild_id = guild_id.get(), ended = n, "admin cleaned up stale sessions");
            format!("Ended {n} stale session(s).")
        }
        Err(e) => {
            error!(guild_id = guild_id.get(), "session cleanup failed: {e}");
            "Could not clean up sessions right now.".to_string()
        }
    };
    respond(ctx, cmd, &text).await;
}

async fn handle_streak_reset(ctx: &Context, cmd: &CommandInteraction, state: &StreakState) {
    let Some(guild_id) = cmd.guild_id else {
        respond(ctx, cmd, "This command only works inside a server.").await;
        return;
    };

    let target = cmd
        .data
        .options
        .iter()
        .find(|o| o.name == "user")
        .and_then(|o| match &o.value {
            CommandDataOptionValue::User(id) => Some(*id),
            _ => None,
        });
    let Some(target) = target else {
        respond(ctx, cmd, "Pick the member whose streak should be reset.").await;
        return;
    };

    let text = match state.evaluator.reset_streak(target, guild_id, Utc::now()).await {
        Ok(true) => format!("<@{target}>'s streak has been reset."),
        Ok(false) => format!("<@{target}> has no streak record in this server."),
        Err(e) => {
            error!(user_id = target.get(), guild_id = guild_id.get(), "failed to reset streak: {e}");
            "Could not reset the streak right now.".to_string()
        }
    };
    respond(ctx, cmd, &text).await;
}

async fn respond(ctx: &Context, cmd: &CommandInteraction, content: &str) {
    let response = CreateInteractionResponse::Message(
        CreateInteractionResponseMessage::new()
            .content(content)
            .ephemeral(true),
    );
    if let Err(e) = cmd.create_response(&ctx.http, response).await {
        warn!(command = %cmd.data.name, "failed to respond: {e}");
    }
}

/// Whether the member still sits in a tracked voice channel of `guild_id`.
/// A guild missing from the cache counts as present so nothing ends on a cold cache.
pub fn still_in_tracked_voice(
    cache: &Cache,
    tracked: &HashSet<ChannelId>,
    guild_id: GuildId,
    user_id: UserId,
) -> bool {
    let Some(guild) = cache.guild(guild_id) else {
        return true;
    };
    let channel = guild.voice_states.get(&user_id).and_then(|v| v.channel_id);
    in_tracked_channel(channel, tracked)
}

fn in_tracked_channel(channel: Option<ChannelId>, tracked: &HashSet<ChannelId>) -> bool {
    channel.is_some_and(|c| tracked.is_empty() || tracked.contains(&c))
}

fn help_text(threshold_minutes: u32) -> String {
    [
        "📖 **Study bot**".to_string(),
        format!(
            "Join a study voice channel and stay for at least {threshold_minutes} minute(s) a day to keep your streak going."
        ),
        String::new(),
        "`/streak` - your current and longest streak, plus today's progress".to_string(),
        "`/stats` - study time for today, this week, this month, and overall".to_string(),
        "`/help` - this message".to_string(),
        "`/streakreset` - (admin) reset a member's streak".to_string(),
        "`/cleanupsessions` - (admin) end sessions of members who already left voice".to_string(),
    ]
    .join("\n")
}

fn describe_stats(user_id: UserId, record: Option<&StreakRecord>, today: NaiveDate) -> String {
    let Some(record) = record else {
        return format!("<@{user_id}> has no study time recorded yet. Join a study voice channel to start!");
    };

    [
        format!("📊 Study stats for <@{user_id}>"),
        format!("Today: **{}**", format_minutes(u64::from(record.minutes_on(today)))),
        format!("This week: **{}**", format_minutes(u64::from(record.minutes_in_week_of(today)))),
        format!("This month: **{}**", format_minutes(u64::from(record.minutes_in_month_of(today)))),
        format!("Total: **{}**", format_minutes(record.total_activity_minutes)),
    ]
    .join("\n")
}

fn describe_streak(
    user_id: UserId,
    record: Option<&StreakRecord>,
    today: NaiveDate,
    threshold_minutes: u32,
    live_minutes: Option<u32>,
) -> String {
    let Some(record) = record else {
        return format!(
            "<@{user_id}> hasn't started a study streak yet. \
             Spend {threshold_minutes}+ minutes in a tracked voice channel to begin!"
        );
    };

    let today_minutes = record.minutes_on(today);
    let mut lines = vec![
        format!("🔥 Current streak: **{} days**", record.current_streak_count),
        format!("🏆 Longest streak: **{} days**", record.max_streak_count),
        format!(
            "⏱️ Today: **{today_minutes}/{threshold_minutes} minutes**{}",
            if today_minutes >= threshold_minutes { " ✅" } else { "" }
        ),
        format!("📚 Total tracked time: **{} minutes**", record.total_activity_minutes),
    ];
    if let Some(minutes) = live_minutes {
        lines.push(format!("🎧 In a session right now: **{minutes} minutes** so far"));
    }
    if record.current_streak_count > 0 && today_minutes < threshold_minutes {
        lines.push(format!(
            "⚠️ You need **{} more minutes** today to keep your streak!",
            threshold_minutes - today_minutes
        ));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 10).unwrap()
    }

    fn record(current: u32, minutes: u32, date: NaiveDate) -> StreakRecord {
        StreakRecord {
            user_id: UserId::new(1),
            guild_id: GuildId::new(2),
            current_streak_count: current,
            max_streak_count: current + 2,
            last_activity_date: Some(date),
            daily_activity_minutes: minutes,
            week_start_date: None,
            weekly_activity_minutes: 0,
            month_start_date: None,
            monthly_activity_minutes: 0,
            total_activity_minutes: 500,
            activity_started_at: None,
            streak_evaluated_date: None,
            warning_notified_at: None,
        }
    }

    #[test]
    fn newcomer_gets_onboarding_hint() {
        let text = describe_streak(UserId::new(1), None, today(), 5, None);
        assert!(text.contains("hasn't started"));
        assert!(text.contains("5+ minutes"));
    }

    #[test]
    fn at_risk_streak_shows_remaining_minutes() {
        let record = record(4, 2, today());
        let text = describe_streak(UserId::new(1), Some(&record), today(), 5, Some(7));
        assert!(text.contains("**4 days**"));
        assert!(text.contains("2/5 minutes"));
        assert!(text.contains("3 more minutes"));
        assert!(text.contains("7 minutes** so far"));
    }

    #[test]
    fn yesterdays_minutes_are_not_shown_as_today() {
        let yesterday = today().pred_opt().unwrap();
        let record = record(0, 40, yesterday);
        let text = describe_streak(UserId::new(1), Some(&record), today(), 1, None);
        assert!(text.contains("0/1 minutes"));
        assert!(!text.contains("more minutes"));
    }

    #[test]
    fn stats_only_count_current_periods() {
        let mut record = record(3, 25, today());
        // Tuesday 2025-06-10 falls in the week opened on Sunday 2025-06-08.
        record.week_start_date = NaiveDate::from_ymd_opt(2025, 6, 8);
        record.weekly_activity_minutes = 95;
        record.month_start_date = NaiveDate::from_ymd_opt(2025, 5, 1);
        record.monthly_activity_minutes = 400;

        let text = describe_stats(UserId::new(1), Some(&record), today());
        assert!(text.contains("Today: **25m**"));
        assert!(text.contains("This week: **1h 35m**"));
        assert!(text.contains("This month: **0m**"));
        assert!(text.contains("Total: **8h 20m**"));
    }

    #[test]
    fn stats_without_record() {
        let text = describe_stats(UserId::new(1), None, today());
        assert!(text.contains("no study time recorded"));
    }

    #[test]
    fn help_lists_every_command() {
        let text = help_text(30);
        assert!(text.contains("30 minute(s)"));
        assert_eq!(streak_commands().len(), 5);
        for name in ["streak", "stats", "help", "streakreset", "cleanupsessions"] {
            assert!(text.contains(&format!("`/{name}`")), "missing /{name}");
        }
    }

    #[test]
    fn presence_requires_a_tracked_channel() {
        let tracked: HashSet<ChannelId> = [ChannelId::new(30)].into();
        assert!(in_tracked_channel(Some(ChannelId::new(30)), &tracked));
        assert!(!in_tracked_channel(Some(ChannelId::new(40)), &tracked));
        assert!(!in_tracked_channel(None, &tracked));
        assert!(in_tracked_channel(Some(ChannelId::new(40)), &HashSet::new()));
    }

    #[test]
    fn uncached_guild_counts_as_present() {
        let cache = Cache::new();
        assert!(still_in_tracked_voice(&cache, &HashSet::new(), GuildId::new(2), UserId::new(1)));
    }
}
