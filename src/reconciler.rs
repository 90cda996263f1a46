//! Turns raw voice-state changes into open/close session signals.
//!
//! The gateway redelivers and coalesces voice updates, so events are first
//! deduplicated, then folded into an in-memory map of open sessions. All of
//! that state lives in one [`Reconciler`] driven by a single worker task;
//! the rest of the bot talks to it through a cloneable [`ReconcilerHandle`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serenity::model::id::{ChannelId, GuildId, UserId};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::streak::StreakEvaluator;

const DEDUPE_WINDOW_SECS: i64 = 3;
const DEDUPE_RETENTION_SECS: i64 = 15;
/// A second join this soon after a session opened is treated as a redelivery.
const REJOIN_GRACE_SECS: i64 = 10;
const QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoiceEvent {
    pub user_id: UserId,
    pub guild_id: GuildId,
    pub previous_channel: Option<ChannelId>,
    pub new_channel: Option<ChannelId>,
}

impl VoiceEvent {
    /// The channel entered, if this event enters one.
    pub fn joined(&self) -> Option<ChannelId> {
        self.new_channel.filter(|c| self.previous_channel != Some(*c))
    }

    /// The channel left, if this event leaves one.
    pub fn left(&self) -> Option<ChannelId> {
        self.previous_channel.filter(|c| self.new_channel != Some(*c))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveSession {
    pub guild_id: GuildId,
    pub start_time: DateTime<Utc>,
}

impl ActiveSession {
    pub fn elapsed_minutes(&self, now: DateTime<Utc>) -> u32 {
        (now - self.start_time).num_minutes().max(0) as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Duplicate,
    Opened,
    /// Moved between tracked channels; the open session carries on.
    Continued,
    Closed { minutes: u32 },
    /// A join inside the grace window of the open session, or a leave from a
    /// guild other than the one the open session belongs to.
    Ignored,
    /// Nothing relevant to session accounting.
    Untracked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum DedupeKey {
    Join { user: UserId, channel: ChannelId, guild: GuildId },
    AnyJoin { user: UserId, guild: GuildId },
    Leave { user: UserId, channel: ChannelId, guild: GuildId },
}

#[derive(Default)]
struct Deduper {
    last_seen: HashMap<DedupeKey, DateTime<Utc>>,
}

impl Deduper {
    fn keys(event: &VoiceEvent) -> Vec<DedupeKey> {
        let user = event.user_id;
        let guild = event.guild_id;
        let mut keys = Vec::with_capacity(3);

        if let Some(channel) = event.joined() {
            keys.push(DedupeKey::Join { user, channel, guild });
            if event.previous_channel.is_none() {
                keys.push(DedupeKey::AnyJoin { user, guild });
            }
        }
        if let Some(channel) = event.left() {
            keys.push(DedupeKey::Leave { user, channel, guild });
        }
        keys
    }

    /// Returns `true` for a redelivery; otherwise remembers the event.
    fn is_duplicate(&mut self, event: &VoiceEvent, now: DateTime<Utc>) -> bool {
        let keys = Self::keys(event);
        let window = Duration::seconds(DEDUPE_WINDOW_SECS);

        if keys
            .iter()
            .filter_map(|key| self.last_seen.get(key))
            .any(|seen| now - *seen < window)
        {
            return true;
        }

        for key in keys {
            self.last_seen.insert(key, now);
        }
        let retention = Duration::seconds(DEDUPE_RETENTION_SECS);
        self.last_seen.retain(|_, seen| now - *seen <= retention);
        false
    }
}

pub struct Reconciler {
    evaluator: Arc<StreakEvaluator>,
    tracked_channels: HashSet<ChannelId>,
    sessions: HashMap<UserId, ActiveSession>,
    deduper: Deduper,
}

impl Reconciler {
    /// An empty `tracked_channels` set tracks every voice channel.
    pub fn new(evaluator: Arc<StreakEvaluator>, tracked_channels: HashSet<ChannelId>) -> Self {
        Self {
            evaluator,
            tracked_channels,
            sessions: HashMap::new(),
            deduper: Deduper::default(),
        }
    }

    fn is_tracked(&self, channel: ChannelId) -> bool {
        self.tracked_channels.is_empty() || self.tracked_channels.contains(&channel)
    }

    pub fn active_session(&self, user_id: UserId) -> Option<ActiveSession> {
        self.sessions.get(&user_id).copied()
    }

    #[cfg(test)]
    pub fn open_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub async fn handle(&mut self, event: VoiceEvent, now: DateTime<Utc>) -> Outcome {
        if self.deduper.is_duplicate(&event, now) {
            debug!(
                user_id = event.user_id.get(),
                previous = ?event.previous_channel,
                new = ?event.new_channel,
                "skipping duplicate voice event"
            );
            return Outcome::Duplicate;
        }

        if event.previous_channel.is_none() && self.sessions.contains_key(&event.user_id) {
            warn!(
                user_id = event.user_id.get(),
                "inconsistent state: open session for a user who was in no voice channel"
            );
        }

        let joined_tracked = event.joined().filter(|c| self.is_tracked(*c));
        let left_tracked = event.left().filter(|c| self.is_tracked(*c));

        let session_here = self
            .sessions
            .get(&event.user_id)
            .is_some_and(|s| s.guild_id == event.guild_id);

        match joined_tracked {
            Some(channel) if left_tracked.is_some() && session_here => {
                debug!(user_id = event.user_id.get(), channel = channel.get(), "moved between tracked channels");
                Outcome::Continued
            }
            Some(_) => self.open_session(event.user_id, event.guild_id, now).await,
            // Leaving, or moving somewhere untracked, both end the session.
            None if (event.joined().is_some() || event.left().is_some())
                && self.sessions.contains_key(&event.user_id)
                && !session_here =>
            {
                // A leave from guild A delivered after the join in guild B.
                warn!(
                    user_id = event.user_id.get(),
                    guild_id = event.guild_id.get(),
                    "inconsistent state: leave from a guild without the open session, ignoring"
                );
                Outcome::Ignored
            }
            None if event.joined().is_some() || event.left().is_some() => {
                match self.close_session(event.user_id, now).await {
                    Some(minutes) => Outcome::Closed { minutes },
                    None => Outcome::Untracked,
                }
            }
            None => Outcome::Untracked,
        }
    }

    async fn open_session(&mut self, user_id: UserId, guild_id: GuildId, now: DateTime<Utc>) -> Outcome {
        if let Some(existing) = self.sessions.get(&user_id) {
            if existing.guild_id == guild_id && now - existing.start_time < Duration::seconds(REJOIN_GRACE_SECS) {
                debug!(user_id = user_id.get(), "join within grace window of open session, ignoring");
                return Outcome::Ignored;
            }
            info!(user_id = user_id.get(), "join while a session was open, closing the old one first");
            self.close_session(user_id, now).await;
        }

        self.sessions.insert(
            user_id,
            ActiveSession {
                guild_id,
                start_time: now,
            },
        );
        info!(user_id = user_id.get(), guild_id = guild_id.get(), "study session opened");

        if let Err(e) = self.evaluator.start_activity(user_id, guild_id, now).await {
            error!(user_id = user_id.get(), "failed to initialize daily activity: {e}");
        }
        Outcome::Opened
    }

    /// Removes the session before persisting so a failed write can never
    /// leave it around to be counted twice.
    async fn close_session(&mut self, user_id: UserId, now: DateTime<Utc>) -> Option<u32> {
        let session = self.sessions.remove(&user_id)?;
        let minutes = session.elapsed_minutes(now);
        info!(
            user_id = user_id.get(),
            guild_id = session.guild_id.get(),
            minutes,
            "study session closed"
        );
        if !self.evaluator.calendar().is_same_day(session.start_time, now) {
            debug!(user_id = user_id.get(), "session crossed midnight, crediting the day it ended");
        }

        if let Err(e) = self
            .evaluator
            .record_session(user_id, session.guild_id, minutes, now)
            .await
        {
            error!(user_id = user_id.get(), minutes, "failed to record session minutes: {e}");
        }
        Some(minutes)
    }

    /// Sessions open for at least `max_age`, limited to `guild` when given.
    pub fn stale_sessions(
        &self,
        now: DateTime<Utc>,
        max_age: Duration,
        guild: Option<GuildId>,
    ) -> Vec<(UserId, ActiveSession)> {
        self.sessions
            .iter()
            .filter(|(_, s)| now - s.start_time >= max_age)
            .filter(|(_, s)| guild.is_none_or(|g| g == s.guild_id))
            .map(|(user_id, s)| (*user_id, *s))
            .collect()
    }

    /// Closes each listed session that is still the one open for its user.
    /// Returns how many were closed.
    pub async fn expire(&mut self, sessions: Vec<(UserId, ActiveSession)>, now: DateTime<Utc>) -> usize {
        let mut expired = 0;
        for (user_id, session) in sessions {
            if self.sessions.get(&user_id) != Some(&session) {
                debug!(user_id = user_id.get(), "session changed since the sweep looked, keeping it");
                continue;
            }
            if let Some(minutes) = self.close_session(user_id, now).await {
                info!(user_id = user_id.get(), minutes, "expired stale session");
                if minutes > 0 {
                    self.evaluator.session_expired(user_id, session.guild_id, minutes).await;
                }
                expired += 1;
            }
        }
        expired
    }

    /// Closes every open session at `now`. Returns how many were flushed.
    pub async fn shutdown(&mut self, now: DateTime<Utc>) -> usize {
        let users: Vec<UserId> = self.sessions.keys().copied().collect();
        for user_id in &users {
            self.close_session(*user_id, now).await;
        }
        info!(flushed = users.len(), "flushed open sessions");
        users.len()
    }
}

enum Command {
    Voice {
        event: VoiceEvent,
        received_at: DateTime<Utc>,
    },
    ActiveSession {
        user_id: UserId,
        reply: oneshot::Sender<Option<ActiveSession>>,
    },
    StaleSessions {
        now: DateTime<Utc>,
        max_age: Duration,
        guild: Option<GuildId>,
        reply: oneshot::Sender<Vec<(UserId, ActiveSession)>>,
    },
    Expire {
        sessions: Vec<(UserId, ActiveSession)>,
        now: DateTime<Utc>,
        reply: oneshot::Sender<usize>,
    },
    Shutdown {
        reply: oneshot::Sender<usize>,
    },
}

/// Cloneable handle to the single task that owns the [`Reconciler`].
///
/// Commands are processed strictly in arrival order, so a user's leave is
/// always accounted before their next join.
#[derive(Clone)]
pub struct ReconcilerHandle {
    tx: mpsc::Sender<Command>,
}

impl ReconcilerHandle {
    pub fn spawn(reconciler: Reconciler) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let worker = tokio::spawn(run(reconciler, rx));
        (Self { tx }, worker)
    }

    /// Queues an event, waiting for room when the worker is behind.
    pub async fn submit(&self, event: VoiceEvent) -> Result<()> {
        let command = Command::Voice {
            event,
            received_at: Utc::now(),
        };
        self.tx.send(command).await.map_err(|_| Error::WorkerClosed)
    }

    pub async fn active_session(&self, user_id: UserId) -> Result<Option<ActiveSession>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::ActiveSession { user_id, reply })
            .await
            .map_err(|_| Error::WorkerClosed)?;
        rx.await.map_err(|_| Error::WorkerClosed)
    }

    /// Closes sessions older than `max_age` whose user `still_present`
    /// reports as gone. Returns how many were closed.
    pub async fn sweep<F>(
        &self,
        now: DateTime<Utc>,
        max_age: Duration,
        guild: Option<GuildId>,
        still_present: F,
    ) -> Result<usize>
    where
        F: Fn(UserId, &ActiveSession) -> bool,
    {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::StaleSessions { now, max_age, guild, reply })
            .await
            .map_err(|_| Error::WorkerClosed)?;
        let stale = rx.await.map_err(|_| Error::WorkerClosed)?;

        let gone: Vec<_> = stale
            .into_iter()
            .filter(|(user_id, session)| !still_present(*user_id, session))
            .collect();
        if gone.is_empty() {
            return Ok(0);
        }

        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Expire { sessions: gone, now, reply })
            .await
            .map_err(|_| Error::WorkerClosed)?;
        rx.await.map_err(|_| Error::WorkerClosed)
    }

    /// Flushes every open session and stops the worker.
    pub async fn shutdown(&self) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Shutdown { reply })
            .await
            .map_err(|_| Error::WorkerClosed)?;
        rx.await.map_err(|_| Error::WorkerClosed)
    }
}

async fn run(mut reconciler: Reconciler, mut rx: mpsc::Receiver<Command>) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Voice { event, received_at } => {
                reconciler.handle(event, received_at).await;
            }
            Command::ActiveSession { user_id, reply } => {
                let _ = reply.send(reconciler.active_session(user_id));
            }
            Command::StaleSessions { now, max_age, guild, reply } => {
                let _ = reply.send(reconciler.stale_sessions(now, max_age, guild));
            }
            Command::Expire { sessions, now, reply } => {
                let _ = reply.send(reconciler.expire(sessions, now).await);
            }
            Command::Shutdown { reply } => {
                let flushed = reconciler.shutdown(Utc::now()).await;
                let _ = reply.send(flushed);
                break;
            }
        }
    }
    debug!("voice event worker stopped");
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::calendar::Calendar;
    use crate::notifier::Notification;
    use crate::notifier::testing::RecordingNotifier;
    use crate::store::testing::ScriptedStore;
    use crate::store::{ActivityStore, SqliteActivityStore};

    const USER: UserId = UserId::new(10);
    const GUILD: GuildId = GuildId::new(20);
    const STUDY: ChannelId = ChannelId::new(30);
    const STUDY_2: ChannelId = ChannelId::new(31);
    const LOUNGE: ChannelId = ChannelId::new(40);
    const OTHER_GUILD: GuildId = GuildId::new(21);
    const OTHER_STUDY: ChannelId = ChannelId::new(50);

    fn t0() -> DateTime<Utc> {
        // 12:00 in Manila.
        Utc.with_ymd_and_hms(2025, 6, 10, 4, 0, 0).unwrap()
    }

    fn join(channel: ChannelId) -> VoiceEvent {
        VoiceEvent {
            user_id: USER,
            guild_id: GUILD,
            previous_channel: None,
            new_channel: Some(channel),
        }
    }

    fn leave(channel: ChannelId) -> VoiceEvent {
        VoiceEvent {
            user_id: USER,
            guild_id: GUILD,
            previous_channel: Some(channel),
            new_channel: None,
        }
    }

    fn moved(from: ChannelId, to: ChannelId) -> VoiceEvent {
        VoiceEvent {
            user_id: USER,
            guild_id: GUILD,
            previous_channel: Some(from),
            new_channel: Some(to),
        }
    }

    fn in_guild(guild_id: GuildId, mut event: VoiceEvent) -> VoiceEvent {
        event.guild_id = guild_id;
        event
    }

    fn reconciler_over(
        store: Arc<dyn ActivityStore>,
        notifier: Arc<RecordingNotifier>,
        tracked: &[ChannelId],
    ) -> (Reconciler, Arc<StreakEvaluator>) {
        let evaluator = Arc::new(StreakEvaluator::new(
            store,
            notifier,
            Calendar::new(chrono_tz::Asia::Manila),
            1,
        ));
        let reconciler = Reconciler::new(evaluator.clone(), tracked.iter().copied().collect());
        (reconciler, evaluator)
    }

    async fn setup(tracked: &[ChannelId]) -> (Reconciler, Arc<SqliteActivityStore>, Arc<StreakEvaluator>) {
        let store = Arc::new(SqliteActivityStore::in_memory().await.unwrap());
        let (reconciler, evaluator) =
            reconciler_over(store.clone(), Arc::new(RecordingNotifier::default()), tracked);
        (reconciler, store, evaluator)
    }

    async fn minutes_in(store: &impl ActivityStore, guild_id: GuildId) -> u32 {
        store
            .get_streak(USER, guild_id)
            .await
            .unwrap()
            .map_or(0, |r| r.daily_activity_minutes)
    }

    async fn daily_minutes(store: &SqliteActivityStore) -> u32 {
        minutes_in(store, GUILD).await
    }

    #[test]
    fn classifies_join_leave_and_move() {
        assert_eq!(join(STUDY).joined(), Some(STUDY));
        assert_eq!(join(STUDY).left(), None);
        assert_eq!(leave(STUDY).left(), Some(STUDY));
        assert_eq!(moved(STUDY, LOUNGE).joined(), Some(LOUNGE));
        assert_eq!(moved(STUDY, LOUNGE).left(), Some(STUDY));

        // Mute/deafen updates keep the same channel on both sides.
        let same = moved(STUDY, STUDY);
        assert_eq!((same.joined(), same.left()), (None, None));
    }

    #[tokio::test]
    async fn duplicate_join_opens_one_session() {
        let (mut reconciler, _, _) = setup(&[STUDY]).await;

        assert_eq!(reconciler.handle(join(STUDY), t0()).await, Outcome::Opened);
        assert_eq!(
            reconciler.handle(join(STUDY), t0() + Duration::milliseconds(400)).await,
            Outcome::Duplicate
        );
        assert_eq!(reconciler.open_sessions(), 1);
        assert_eq!(reconciler.active_session(USER).unwrap().start_time, t0());
    }

    #[tokio::test]
    async fn dedupe_entries_expire() {
        let (mut reconciler, _, _) = setup(&[STUDY]).await;

        reconciler.handle(join(STUDY), t0()).await;
        let outcome = reconciler.handle(join(STUDY), t0() + Duration::seconds(5)).await;

        // Past the dedupe window but inside the rejoin grace window.
        assert_eq!(outcome, Outcome::Ignored);
        assert_eq!(reconciler.deduper.last_seen.len(), 2);

        // Join keys are older than the retention period by now; only the leave remains.
        reconciler.handle(leave(STUDY), t0() + Duration::seconds(30)).await;
        assert_eq!(reconciler.deduper.last_seen.len(), 1);
    }

    #[tokio::test]
    async fn closing_session_flushes_minutes() {
        let (mut reconciler, store, evaluator) = setup(&[STUDY]).await;

        reconciler.handle(join(STUDY), t0()).await;
        let outcome = reconciler.handle(leave(STUDY), t0() + Duration::minutes(3)).await;

        assert_eq!(outcome, Outcome::Closed { minutes: 3 });
        assert_eq!(reconciler.open_sessions(), 0);
        assert_eq!(daily_minutes(&store).await, 3);

        let summary = evaluator
            .evaluate_day(t0() + Duration::hours(11) + Duration::minutes(59))
            .await
            .unwrap();
        assert_eq!(summary.started, 1);
        assert_eq!(daily_minutes(&store).await, 3);
    }

    #[tokio::test]
    async fn stale_counter_restarts_on_new_day() {
        let (mut reconciler, store, evaluator) = setup(&[]).await;
        evaluator
            .record_session(USER, GUILD, 50, t0() - Duration::days(1))
            .await
            .unwrap();

        reconciler.handle(join(STUDY), t0()).await;
        reconciler.handle(leave(STUDY), t0() + Duration::minutes(4)).await;

        assert_eq!(daily_minutes(&store).await, 4);
    }

    #[tokio::test]
    async fn untracked_channels_are_ignored() {
        let (mut reconciler, store, _) = setup(&[STUDY]).await;

        assert_eq!(reconciler.handle(join(LOUNGE), t0()).await, Outcome::Untracked);
        assert_eq!(reconciler.open_sessions(), 0);
        assert_eq!(store.get_streak(USER, GUILD).await.unwrap(), None);
    }

    #[tokio::test]
    async fn moving_to_untracked_channel_closes_session() {
        let (mut reconciler, store, _) = setup(&[STUDY]).await;

        reconciler.handle(join(STUDY), t0()).await;
        let outcome = reconciler
            .handle(moved(STUDY, LOUNGE), t0() + Duration::minutes(12))
            .await;

        assert_eq!(outcome, Outcome::Closed { minutes: 12 });
        assert!(reconciler.active_session(USER).is_none());
        assert_eq!(daily_minutes(&store).await, 12);
    }

    #[tokio::test]
    async fn moving_between_tracked_channels_keeps_session() {
        let (mut reconciler, store, _) = setup(&[STUDY, STUDY_2]).await;

        reconciler.handle(join(STUDY), t0()).await;
        let outcome = reconciler
            .handle(moved(STUDY, STUDY_2), t0() + Duration::seconds(90))
            .await;
        assert_eq!(outcome, Outcome::Continued);

        reconciler.handle(leave(STUDY_2), t0() + Duration::seconds(150)).await;
        // One continuous 2.5 minute block, not two sub-minute fragments.
        assert_eq!(daily_minutes(&store).await, 2);
    }

    #[tokio::test]
    async fn late_rejoin_replaces_open_session() {
        let (mut reconciler, store, _) = setup(&[STUDY]).await;

        reconciler.handle(join(STUDY), t0()).await;
        // The leave was never delivered; a fresh join arrives much later.
        let later = t0() + Duration::minutes(20);
        assert_eq!(reconciler.handle(join(STUDY), later).await, Outcome::Opened);

        assert_eq!(daily_minutes(&store).await, 20);
        assert_eq!(reconciler.active_session(USER).unwrap().start_time, later);
    }

    #[tokio::test]
    async fn leave_without_session_is_harmless() {
        let (mut reconciler, store, _) = setup(&[]).await;
        assert_eq!(reconciler.handle(leave(STUDY), t0()).await, Outcome::Untracked);
        assert_eq!(store.get_streak(USER, GUILD).await.unwrap(), None);
    }

    #[tokio::test]
    async fn shutdown_flushes_open_sessions() {
        let (mut reconciler, store, _) = setup(&[]).await;
        reconciler.handle(join(STUDY), t0()).await;

        let flushed = reconciler.shutdown(t0() + Duration::minutes(10)).await;

        assert_eq!(flushed, 1);
        assert_eq!(reconciler.open_sessions(), 0);
        assert_eq!(daily_minutes(&store).await, 10);
    }

    #[tokio::test]
    async fn worker_preserves_order_and_answers_queries() {
        let (reconciler, store, _) = setup(&[]).await;
        let (handle, worker) = ReconcilerHandle::spawn(reconciler);

        handle.submit(join(STUDY)).await.unwrap();
        let session = handle.active_session(USER).await.unwrap();
        assert_eq!(session.map(|s| s.guild_id), Some(GUILD));

        assert_eq!(handle.shutdown().await.unwrap(), 1);
        worker.await.unwrap();
        assert!(matches!(handle.submit(leave(STUDY)).await, Err(Error::WorkerClosed)));
        assert!(store.get_streak(USER, GUILD).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn late_leave_from_previous_guild_keeps_new_session() {
        let (mut reconciler, store, _) = setup(&[]).await;
        let hop = t0() + Duration::minutes(20);

        reconciler.handle(join(STUDY), t0()).await;
        assert_eq!(
            reconciler.handle(in_guild(OTHER_GUILD, join(OTHER_STUDY)), hop).await,
            Outcome::Opened
        );
        // The leave from the first guild arrives after the join in the second.
        assert_eq!(
            reconciler.handle(leave(STUDY), hop + Duration::seconds(1)).await,
            Outcome::Ignored
        );
        assert_eq!(reconciler.active_session(USER).unwrap().guild_id, OTHER_GUILD);

        let outcome = reconciler
            .handle(in_guild(OTHER_GUILD, leave(OTHER_STUDY)), t0() + Duration::minutes(50))
            .await;
        assert_eq!(outcome, Outcome::Closed { minutes: 30 });
        assert_eq!(minutes_in(&*store, OTHER_GUILD).await, 30);
        assert_eq!(minutes_in(&*store, GUILD).await, 20);
    }

    #[tokio::test]
    async fn quick_join_in_another_guild_is_not_a_redelivery() {
        let (mut reconciler, _, _) = setup(&[]).await;

        reconciler.handle(join(STUDY), t0()).await;
        let outcome = reconciler
            .handle(in_guild(OTHER_GUILD, join(OTHER_STUDY)), t0() + Duration::seconds(4))
            .await;

        assert_eq!(outcome, Outcome::Opened);
        assert_eq!(reconciler.active_session(USER).unwrap().guild_id, OTHER_GUILD);
    }

    #[tokio::test]
    async fn failed_write_still_closes_session_once() {
        let store = Arc::new(ScriptedStore::new(SqliteActivityStore::in_memory().await.unwrap()));
        let (mut reconciler, _) =
            reconciler_over(store.clone(), Arc::new(RecordingNotifier::default()), &[STUDY]);

        reconciler.handle(join(STUDY), t0()).await;
        store.fail_accumulate.store(true, std::sync::atomic::Ordering::SeqCst);

        let outcome = reconciler.handle(leave(STUDY), t0() + Duration::minutes(5)).await;
        assert_eq!(outcome, Outcome::Closed { minutes: 5 });
        assert!(reconciler.active_session(USER).is_none());

        // The store recovers, but there is nothing left to count twice.
        store.fail_accumulate.store(false, std::sync::atomic::Ordering::SeqCst);
        let again = reconciler.handle(leave(STUDY), t0() + Duration::minutes(6)).await;
        assert_eq!(again, Outcome::Untracked);
        assert_eq!(minutes_in(&*store, GUILD).await, 0);
    }

    #[tokio::test]
    async fn stale_sessions_are_listed_by_age_and_guild() {
        let (mut reconciler, _, _) = setup(&[]).await;
        reconciler.handle(join(STUDY), t0()).await;

        let max_age = Duration::hours(4);
        assert!(reconciler.stale_sessions(t0() + Duration::hours(3), max_age, None).is_empty());

        let late = t0() + Duration::hours(5);
        let stale = reconciler.stale_sessions(late, max_age, None);
        assert_eq!(stale, vec![(USER, reconciler.active_session(USER).unwrap())]);
        assert!(reconciler.stale_sessions(late, max_age, Some(OTHER_GUILD)).is_empty());
        assert_eq!(reconciler.stale_sessions(late, max_age, Some(GUILD)).len(), 1);
    }

    #[tokio::test]
    async fn expiring_records_minutes_and_notifies() {
        let store = Arc::new(SqliteActivityStore::in_memory().await.unwrap());
        let notifier = Arc::new(RecordingNotifier::default());
        let (mut reconciler, _) = reconciler_over(store.clone(), notifier.clone(), &[]);
        reconciler.handle(join(STUDY), t0()).await;

        let late = t0() + Duration::hours(5);
        let stale = reconciler.stale_sessions(late, Duration::hours(4), None);
        assert_eq!(reconciler.expire(stale, late).await, 1);

        assert!(reconciler.active_session(USER).is_none());
        assert_eq!(daily_minutes(&store).await, 300);
        assert!(notifier.sent().await.iter().any(|n| matches!(
            n,
            Notification::SessionExpired { user_id, minutes: 300 } if *user_id == USER
        )));
    }

    #[tokio::test]
    async fn expire_skips_sessions_replaced_since_listing() {
        let (mut reconciler, store, _) = setup(&[]).await;
        reconciler.handle(join(STUDY), t0()).await;

        let late = t0() + Duration::hours(5);
        let stale = reconciler.stale_sessions(late, Duration::hours(4), None);
        // The user left and came back before the expiry ran.
        reconciler.handle(leave(STUDY), late).await;
        reconciler.handle(join(STUDY), late + Duration::minutes(1)).await;

        assert_eq!(reconciler.expire(stale, late + Duration::minutes(2)).await, 0);
        assert_eq!(
            reconciler.active_session(USER).unwrap().start_time,
            late + Duration::minutes(1)
        );
        assert_eq!(daily_minutes(&store).await, 300);
    }

    #[tokio::test]
    async fn sweep_leaves_present_users_alone() {
        let (reconciler, store, _) = setup(&[]).await;
        let (handle, _worker) = ReconcilerHandle::spawn(reconciler);
        handle.submit(join(STUDY)).await.unwrap();

        let later = Utc::now() + Duration::hours(5);
        let kept = handle
            .sweep(later, Duration::hours(4), None, |_, _| true)
            .await
            .unwrap();
        assert_eq!(kept, 0);
        assert!(handle.active_session(USER).await.unwrap().is_some());

        let swept = handle
            .sweep(later, Duration::hours(4), Some(GUILD), |_, _| false)
            .await
            .unwrap();
        assert_eq!(swept, 1);
        assert!(handle.active_session(USER).await.unwrap().is_none());
        assert!(daily_minutes(&store).await >= 299);
    }
}
