//! Streak state machine.
//!
//! Two triggers drive it. Voice leaves fold minutes into today's counter
//! ([`StreakEvaluator::record_session`]), and the scheduled daily batch
//! ([`StreakEvaluator::evaluate_day`]) turns that counter into a streak
//! transition. Only the batch ever changes `current_streak_count`, and the
//! `streak_evaluated_date` fence makes it run at most once per user per day.

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serenity::model::id::{GuildId, UserId};
use tracing::{debug, error, info, warn};

use crate::calendar::Calendar;
use crate::error::Result;
use crate::notifier::{Notification, Notifier};
use crate::store::{ActivityStore, Evaluation, StreakRecord};

pub const DEFAULT_THRESHOLD_MINUTES: u32 = 1;

/// Re-reads allowed when live activity lands between a read and its write.
const MAX_EVALUATION_ATTEMPTS: usize = 3;

const WARNING_INTERVAL_HOURS: i64 = 23;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Started { count: u32 },
    Continued { count: u32 },
    Ended { previous_count: u32 },
    Unchanged,
}

impl Transition {
    fn count_after(self, current: u32) -> u32 {
        match self {
            Transition::Started { count } | Transition::Continued { count } => count,
            Transition::Ended { .. } => 0,
            Transition::Unchanged => current,
        }
    }

    fn notification(self, user_id: UserId) -> Option<Notification> {
        match self {
            Transition::Started { count } => Some(Notification::StreakStarted { user_id, count }),
            Transition::Continued { count } => Some(Notification::StreakContinued { user_id, count }),
            Transition::Ended { previous_count } => Some(Notification::StreakEnded { user_id, previous_count }),
            Transition::Unchanged => None,
        }
    }
}

/// The daily transition for `record` when closing `today`.
pub fn decide(record: &StreakRecord, today: NaiveDate, threshold_minutes: u32) -> Transition {
    let qualifies = record.last_activity_date == Some(today)
        && record.daily_activity_minutes >= threshold_minutes;

    match (qualifies, record.current_streak_count) {
        (true, 0) => Transition::Started { count: 1 },
        (true, current) => Transition::Continued { count: current + 1 },
        (false, 0) => Transition::Unchanged,
        (false, previous_count) => Transition::Ended { previous_count },
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EvaluationSummary {
    pub started: usize,
    pub continued: usize,
    pub ended: usize,
    pub unchanged: usize,
    /// Already fenced, vanished, or kept losing the race against live activity.
    pub skipped: usize,
    pub failed: usize,
}

impl EvaluationSummary {
    fn count(&mut self, transition: Transition) {
        match transition {
            Transition::Started { .. } => self.started += 1,
            Transition::Continued { .. } => self.continued += 1,
            Transition::Ended { .. } => self.ended += 1,
            Transition::Unchanged => self.unchanged += 1,
        }
    }
}

pub struct StreakEvaluator {
    store: Arc<dyn ActivityStore>,
    notifier: Arc<dyn Notifier>,
    calendar: Calendar,
    threshold_minutes: u32,
}

impl StreakEvaluator {
    pub fn new(
        store: Arc<dyn ActivityStore>,
        notifier: Arc<dyn Notifier>,
        calendar: Calendar,
        threshold_minutes: u32,
    ) -> Self {
        Self {
            store,
            notifier,
            calendar,
            threshold_minutes,
        }
    }

    pub fn calendar(&self) -> Calendar {
        self.calendar
    }

    pub fn threshold_minutes(&self) -> u32 {
        self.threshold_minutes
    }

    /// Makes sure the user's daily counter points at the day of `now`.
    pub async fn start_activity(&self, user_id: UserId, guild_id: GuildId, now: DateTime<Utc>) -> Result<()> {
        let today = self.calendar.to_date(now);
        self.store.start_daily_activity(user_id, guild_id, today, now).await
    }

    /// Folds a closed session into the daily counter. Returns the new daily
    /// total, or `None` when the session was too short to count.
    pub async fn record_session(
        &self,
        user_id: UserId,
        guild_id: GuildId,
        minutes: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<u32>> {
        if minutes == 0 {
            return Ok(None);
        }

        let today = self.calendar.to_date(now);
        let credit = self
            .store
            .accumulate_minutes(user_id, guild_id, today, minutes, now)
            .await?;
        let total = credit.daily_minutes;

        info!(
            user_id = user_id.get(),
            guild_id = guild_id.get(),
            minutes,
            total,
            day = %credit.date,
            "recorded voice activity"
        );

        let previous = total.saturating_sub(minutes);
        if previous < self.threshold_minutes && total >= self.threshold_minutes {
            self.deliver(guild_id, Notification::ActivityCompleted { user_id, minutes: total })
                .await;
        }
        Ok(Some(total))
    }

    /// Announces a session closed by the stale-session sweep.
    pub async fn session_expired(&self, user_id: UserId, guild_id: GuildId, minutes: u32) {
        self.deliver(guild_id, Notification::SessionExpired { user_id, minutes })
            .await;
    }

    /// Runs the daily transition for every record not yet evaluated for the
    /// day of `now`. Safe to re-run: fenced records are skipped.
    pub async fn evaluate_day(&self, now: DateTime<Utc>) -> Result<EvaluationSummary> {
        let today = self.calendar.to_date(now);
        let candidates = self.store.list_for_evaluation(today).await?;
        info!(%today, candidates = candidates.len(), "running daily streak evaluation");

        let mut summary = EvaluationSummary::default();
        for candidate in candidates {
            match self
                .evaluate_user(candidate.user_id, candidate.guild_id, today, now)
                .await
            {
                Ok(Some(transition)) => summary.count(transition),
                Ok(None) => summary.skipped += 1,
                Err(e) => {
                    summary.failed += 1;
                    error!(
                        user_id = candidate.user_id.get(),
                        guild_id = candidate.guild_id.get(),
                        "streak evaluation failed: {e}"
                    );
                }
            }
        }

        info!(%today, ?summary, "daily streak evaluation finished");
        Ok(summary)
    }

    async fn evaluate_user(
        &self,
        user_id: UserId,
        guild_id: GuildId,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<Option<Transition>> {
        for attempt in 1..=MAX_EVALUATION_ATTEMPTS {
            // Always decide on the freshest row, not the batch listing.
            let Some(record) = self.store.get_streak(user_id, guild_id).await? else {
                return Ok(None);
            };
            if record.is_evaluated_through(today) {
                return Ok(None);
            }

            let transition = decide(&record, today, self.threshold_minutes);
            let new_current = transition.count_after(record.current_streak_count);
            let evaluation = Evaluation {
                user_id,
                guild_id,
                new_current,
                new_max: record.max_streak_count.max(new_current),
                evaluated_date: today,
                observed_activity_date: record.last_activity_date,
                observed_minutes: record.daily_activity_minutes,
            };

            if self.store.apply_evaluation(&evaluation, now).await? {
                info!(
                    user_id = user_id.get(),
                    guild_id = guild_id.get(),
                    minutes = record.minutes_on(today),
                    from = record.current_streak_count,
                    to = new_current,
                    ?transition,
                    "streak evaluated"
                );
                if let Some(notification) = transition.notification(user_id) {
                    self.deliver(guild_id, notification).await;
                }
                return Ok(Some(transition));
            }

            debug!(
                user_id = user_id.get(),
                guild_id = guild_id.get(),
                attempt,
                "record changed under evaluation, re-reading"
            );
        }

        warn!(
            user_id = user_id.get(),
            guild_id = guild_id.get(),
            "gave up evaluating after {MAX_EVALUATION_ATTEMPTS} attempts"
        );
        Ok(None)
    }

    /// Warns users whose streak is at risk today. Returns how many were warned.
    pub async fn send_warnings(&self, now: DateTime<Utc>) -> Result<usize> {
        let today = self.calendar.to_date(now);
        let warned_before = now - Duration::hours(WARNING_INTERVAL_HOURS);
        let candidates = self
            .store
            .list_for_warning(today, self.threshold_minutes, warned_before)
            .await?;

        let mut warned = 0;
        for record in candidates {
            // Stamp first so a failed delivery is never repeated within the interval.
            if let Err(e) = self.store.record_warning(record.user_id, record.guild_id, now).await {
                error!(user_id = record.user_id.get(), "failed to record streak warning: {e}");
                continue;
            }

            self.deliver(
                record.guild_id,
                Notification::StreakWarning {
                    user_id: record.user_id,
                    count: record.current_streak_count,
                    threshold_minutes: self.threshold_minutes,
                },
            )
            .await;
            warned += 1;
        }

        info!(%today, warned, "streak warning check finished");
        Ok(warned)
    }

    pub async fn status(&self, user_id: UserId, guild_id: GuildId) -> Result<Option<StreakRecord>> {
        self.store.get_streak(user_id, guild_id).await
    }

    pub async fn reset_streak(&self, user_id: UserId, guild_id: GuildId, now: DateTime<Utc>) -> Result<bool> {
        let reset = self.store.reset_streak(user_id, guild_id, now).await?;
        if reset {
            info!(user_id = user_id.get(), guild_id = guild_id.get(), "streak reset");
        }
        Ok(reset)
    }

    async fn deliver(&self, guild_id: GuildId, notification: Notification) {
        let kind = notification.kind();
        let user_id = notification.user_id();
        if let Err(e) = self.notifier.notify(guild_id, notification).await {
            warn!(
                guild_id = guild_id.get(),
                user_id = user_id.get(),
                kind,
                "failed to deliver notification: {e}"
            );
        }
    }
}
