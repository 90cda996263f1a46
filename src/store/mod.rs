//! Persistence contract for per-(user, guild) streak state.

mod sqlite;

pub use sqlite::SqliteActivityStore;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serenity::model::id::{GuildId, UserId};

use crate::calendar::{month_start, week_start};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreakRecord {
    pub user_id: UserId,
    pub guild_id: GuildId,
    pub current_streak_count: u32,
    pub max_streak_count: u32,
    /// Calendar date the daily counter belongs to.
    pub last_activity_date: Option<NaiveDate>,
    pub daily_activity_minutes: u32,
    /// Sunday the weekly counter belongs to.
    pub week_start_date: Option<NaiveDate>,
    pub weekly_activity_minutes: u32,
    pub month_start_date: Option<NaiveDate>,
    pub monthly_activity_minutes: u32,
    pub total_activity_minutes: u64,
    pub activity_started_at: Option<DateTime<Utc>>,
    /// Fencing token: the daily batch has already run through this date.
    pub streak_evaluated_date: Option<NaiveDate>,
    pub warning_notified_at: Option<DateTime<Utc>>,
}

impl StreakRecord {
    /// Minutes counted towards `date`; a counter left over from another day is zero.
    pub fn minutes_on(&self, date: NaiveDate) -> u32 {
        if self.last_activity_date == Some(date) {
            self.daily_activity_minutes
        } else {
            0
        }
    }

    pub fn minutes_in_week_of(&self, date: NaiveDate) -> u32 {
        if self.week_start_date == Some(week_start(date)) {
            self.weekly_activity_minutes
        } else {
            0
        }
    }

    pub fn minutes_in_month_of(&self, date: NaiveDate) -> u32 {
        if self.month_start_date == Some(month_start(date)) {
            self.monthly_activity_minutes
        } else {
            0
        }
    }

    pub fn is_evaluated_through(&self, date: NaiveDate) -> bool {
        self.streak_evaluated_date.is_some_and(|d| d >= date)
    }
}

/// Where a batch of minutes ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credit {
    /// Day the minutes were counted towards.
    pub date: NaiveDate,
    /// That day's total after the addition.
    pub daily_minutes: u32,
}

/// The outcome of one daily evaluation, written together with the fence.
///
/// `observed_*` carry the daily counters the decision was based on; the write
/// only lands if they are still current.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub user_id: UserId,
    pub guild_id: GuildId,
    pub new_current: u32,
    pub new_max: u32,
    pub evaluated_date: NaiveDate,
    pub observed_activity_date: Option<NaiveDate>,
    pub observed_minutes: u32,
}

#[async_trait]
pub trait ActivityStore: Send + Sync {
    /// `Ok(None)` when the user has no record in this guild yet.
    async fn get_streak(&self, user_id: UserId, guild_id: GuildId) -> Result<Option<StreakRecord>>;

    /// Creates the record if needed and points the daily counter at `date`.
    /// A counter already at `date` or later is left untouched.
    async fn start_daily_activity(
        &self,
        user_id: UserId,
        guild_id: GuildId,
        date: NaiveDate,
        started_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Adds `minutes` to the daily, weekly, monthly and lifetime counters.
    ///
    /// Minutes go to `date`, or to the day after when the record is already
    /// evaluated through `date`. Period counters left over from an older
    /// period restart from zero.
    async fn accumulate_minutes(
        &self,
        user_id: UserId,
        guild_id: GuildId,
        date: NaiveDate,
        minutes: u32,
        now: DateTime<Utc>,
    ) -> Result<Credit>;

    /// Records whose `streak_evaluated_date` is null or before `date`.
    async fn list_for_evaluation(&self, date: NaiveDate) -> Result<Vec<StreakRecord>>;

    /// Records with a live streak, not yet qualifying on `date`, not yet
    /// evaluated for it, and not warned since `warned_before`.
    async fn list_for_warning(
        &self,
        date: NaiveDate,
        threshold_minutes: u32,
        warned_before: DateTime<Utc>,
    ) -> Result<Vec<StreakRecord>>;

    /// Returns `false` when nothing was written, either because the record is
    /// already fenced for the date or because its daily counters moved.
    async fn apply_evaluation(&self, evaluation: &Evaluation, now: DateTime<Utc>) -> Result<bool>;

    async fn record_warning(&self, user_id: UserId, guild_id: GuildId, at: DateTime<Utc>) -> Result<()>;

    /// Returns `false` when the user has no record.
    async fn reset_streak(&self, user_id: UserId, guild_id: GuildId, now: DateTime<Utc>) -> Result<bool>;
}
