use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serenity::model::id::{GuildId, UserId};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use tracing::{debug, info};

use super::{ActivityStore, Credit, Evaluation, StreakRecord};
use crate::error::Result;

const COLUMNS: &str = "user_id, guild_id, current_streak_count, max_streak_count, \
     last_activity_date, daily_activity_minutes, week_start_date, weekly_activity_minutes, \
     month_start_date, monthly_activity_minutes, total_activity_minutes, activity_start_time, streak_evaluated_date, warning_notified_at";

#[derive(FromRow)]
struct StreakRow {
    user_id: i64,
    guild_id: i64,
    current_streak_count: i64,
    max_streak_count: i64,
    last_activity_date: Option<NaiveDate>,
    daily_activity_minutes: i64,
    week_start_date: Option<NaiveDate>,
    weekly_activity_minutes: i64,
    month_start_date: Option<NaiveDate>,
    monthly_activity_minutes: i64,
    total_activity_minutes: i64,
    activity_start_time: Option<i64>,
    streak_evaluated_date: Option<NaiveDate>,
    warning_notified_at: Option<i64>,
}

impl StreakRow {
    fn into_record(self) -> StreakRecord {
        StreakRecord {
            user_id: UserId::new(self.user_id as u64),
            guild_id: GuildId::new(self.guild_id as u64),
            current_streak_count: self.current_streak_count as u32,
            max_streak_count: self.max_streak_count as u32,
            last_activity_date: self.last_activity_date,
            daily_activity_minutes: self.daily_activity_minutes as u32,
            week_start_date: self.week_start_date,
            weekly_activity_minutes: self.weekly_activity_minutes as u32,
            month_start_date: self.month_start_date,
            monthly_activity_minutes: self.monthly_activity_minutes as u32,
            total_activity_minutes: self.total_activity_minutes as u64,
            activity_started_at: self.activity_start_time.and_then(from_unix),
            streak_evaluated_date: self.streak_evaluated_date,
            warning_notified_at: self.warning_notified_at.and_then(from_unix),
        }
    }
}

fn from_unix(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
}

// Snowflakes stay below 2^63, so the INTEGER column holds them losslessly.
fn user_key(id: UserId) -> i64 {
    id.get() as i64
}

fn guild_key(id: GuildId) -> i64 {
    id.get() as i64
}

pub struct SqliteActivityStore {
    pool: SqlitePool,
}

impl SqliteActivityStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        info!(database_url, "connected to sqlite");
        Ok(Self { pool })
    }

    /// A private in-memory database; one connection so every query sees it.
    #[cfg(test)]
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl ActivityStore for SqliteActivityStore {
    async fn get_streak(&self, user_id: UserId, guild_id: GuildId) -> Result<Option<StreakRecord>> {
        let query = format!("SELECT {COLUMNS} FROM user_streaks WHERE user_id = ?1 AND guild_id = ?2");
        let row: Option<StreakRow> = sqlx::query_as(&query)
            .bind(user_key(user_id))
            .bind(guild_key(guild_id))
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(StreakRow::into_record))
    }

    async fn start_daily_activity(
        &self,
        user_id: UserId,
        guild_id: GuildId,
        date: NaiveDate,
        started_at: DateTime<Utc>,
    ) -> Result<()> {
        let query = r#"
            INSERT INTO user_streaks
                (user_id, guild_id, last_activity_date, daily_activity_minutes,
                 activity_start_time, created_at, updated_at)
            VALUES (?1, ?2, ?3, 0, ?4, ?4, ?4)
            ON CONFLICT(user_id, guild_id) DO UPDATE SET
                last_activity_date = excluded.last_activity_date,
                daily_activity_minutes = 0,
                activity_start_time = excluded.activity_start_time,
                updated_at = excluded.updated_at
            WHERE user_streaks.last_activity_date IS NULL
               OR user_streaks.last_activity_date < excluded.last_activity_date
        "#;

        let result = sqlx::query(query)
            .bind(user_key(user_id))
            .bind(guild_key(guild_id))
            .bind(date)
            .bind(started_at.timestamp())
            .execute(&self.pool)
            .await?;

        debug!(
            user_id = user_id.get(),
            guild_id = guild_id.get(),
            %date,
            initialized = result.rows_affected() > 0,
            "start daily activity"
        );
        Ok(())
    }

    async fn accumulate_minutes(
        &self,
        user_id: UserId,
        guild_id: GuildId,
        date: NaiveDate,
        minutes: u32,
        now: DateTime<Utc>,
    ) -> Result<Credit> {
        // One statement: the fence check, the credited day and every counter
        // update all read the same pre-update row. Weeks start on Sunday
        // (strftime %w is 0 for Sunday), matching `calendar::week_start`.
        let query = r#"
            INSERT INTO user_streaks
                (user_id, guild_id, last_activity_date, daily_activity_minutes,
                 week_start_date, weekly_activity_minutes,
                 month_start_date, monthly_activity_minutes,
                 total_activity_minutes, created_at, updated_at)
            SELECT ?1, ?2, credited.day, ?4,
                   date(credited.day, '-' || strftime('%w', credited.day) || ' days'), ?4,
                   date(credited.day, 'start of month'), ?4,
                   ?4, ?5, ?5
            FROM (
                SELECT CASE
                    WHEN EXISTS (
                        SELECT 1 FROM user_streaks
                        WHERE user_id = ?1 AND guild_id = ?2 AND streak_evaluated_date >= ?3
                    ) THEN date(?3, '+1 day')
                    ELSE ?3
                END AS day
            ) AS credited
            WHERE true
            ON CONFLICT(user_id, guild_id) DO UPDATE SET
                daily_activity_minutes = CASE
                    WHEN user_streaks.last_activity_date IS excluded.last_activity_date
                        THEN user_streaks.daily_activity_minutes + excluded.daily_activity_minutes
                    ELSE excluded.daily_activity_minutes
                END,
                last_activity_date = excluded.last_activity_date,
                weekly_activity_minutes = CASE
                    WHEN user_streaks.week_start_date IS excluded.week_start_date
                        THEN user_streaks.weekly_activity_minutes + excluded.weekly_activity_minutes
                    ELSE excluded.weekly_activity_minutes
                END,
                week_start_date = excluded.week_start_date,
                monthly_activity_minutes = CASE
                    WHEN user_streaks.month_start_date IS excluded.month_start_date
                        THEN user_streaks.monthly_activity_minutes + excluded.monthly_activity_minutes
                    ELSE excluded.monthly_activity_minutes
                END,
                month_start_date = excluded.month_start_date,
                total_activity_minutes = user_streaks.total_activity_minutes + excluded.total_activity_minutes,
                updated_at = excluded.updated_at
            RETURNING last_activity_date, daily_activity_minutes
        "#;

        let (credited, total): (NaiveDate, i64) = sqlx::query_as(query)
            .bind(user_key(user_id))
            .bind(guild_key(guild_id))
            .bind(date)
            .bind(i64::from(minutes))
            .bind(now.timestamp())
            .fetch_one(&self.pool)
            .await?;

        if credited != date {
            debug!(
                user_id = user_id.get(),
                guild_id = guild_id.get(),
                %date,
                %credited,
                "day already evaluated, minutes moved to the next day"
            );
        }
        Ok(Credit {
            date: credited,
            daily_minutes: total as u32,
        })
    }

    async fn list_for_evaluation(&self, date: NaiveDate) -> Result<Vec<StreakRecord>> {
        let query = format!(
            "SELECT {COLUMNS} FROM user_streaks \
             WHERE streak_evaluated_date IS NULL OR streak_evaluated_date < ?1 \
             ORDER BY guild_id, user_id"
        );
        let rows: Vec<StreakRow> = sqlx::query_as(&query).bind(date).fetch_all(&self.pool).await?;

        Ok(rows.into_iter().map(StreakRow::into_record).collect())
    }

    async fn list_for_warning(
        &self,
        date: NaiveDate,
        threshold_minutes: u32,
        warned_before: DateTime<Utc>,
    ) -> Result<Vec<StreakRecord>> {
        let query = format!(
            "SELECT {COLUMNS} FROM user_streaks \
             WHERE current_streak_count > 0 \
               AND (streak_evaluated_date IS NULL OR streak_evaluated_date < ?1) \
               AND NOT (last_activity_date IS ?1 AND daily_activity_minutes >= ?2) \
               AND (warning_notified_at IS NULL OR warning_notified_at < ?3) \
             ORDER BY guild_id, user_id"
        );
        let rows: Vec<StreakRow> = sqlx::query_as(&query)
            .bind(date)
            .bind(i64::from(threshold_minutes))
            .bind(warned_before.timestamp())
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(StreakRow::into_record).collect())
    }

    async fn apply_evaluation(&self, evaluation: &Evaluation, now: DateTime<Utc>) -> Result<bool> {
        let query = r#"
            UPDATE user_streaks SET
                current_streak_count = ?3,
                max_streak_count = MAX(max_streak_count, ?4, ?3),
                streak_evaluated_date = ?5,
                updated_at = ?6
            WHERE user_id = ?1 AND guild_id = ?2
              AND (streak_evaluated_date IS NULL OR streak_evaluated_date < ?5)
              AND last_activity_date IS ?7
              AND daily_activity_minutes = ?8
        "#;

        let result = sqlx::query(query)
            .bind(user_key(evaluation.user_id))
            .bind(guild_key(evaluation.guild_id))
            .bind(i64::from(evaluation.new_current))
            .bind(i64::from(evaluation.new_max))
            .bind(evaluation.evaluated_date)
            .bind(now.timestamp())
            .bind(evaluation.observed_activity_date)
            .bind(i64::from(evaluation.observed_minutes))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn record_warning(&self, user_id: UserId, guild_id: GuildId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE user_streaks SET warning_notified_at = ?3, updated_at = ?3 \
             WHERE user_id = ?1 AND guild_id = ?2",
        )
        .bind(user_key(user_id))
        .bind(guild_key(guild_id))
        .bind(at.timestamp())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn reset_streak(&self, user_id: UserId, guild_id: GuildId, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE user_streaks SET current_streak_count = 0, updated_at = ?3 \
             WHERE user_id = ?1 AND guild_id = ?2",
        )
        .bind(user_key(user_id))
        .bind(guild_key(guild_id))
        .bind(now.timestamp())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
