use std::sync::Arc;

use anyhow::Context as _;
use chrono::{Duration, Utc};
use serenity::Client;
use serenity::all::GatewayIntents;
use serenity::http::Http;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod calendar;
mod config;
mod error;
mod notifier;
mod reconciler;
mod scheduler;
mod store;
mod streak;
mod voice_tracker;

use crate::calendar::Calendar;
use crate::config::Config;
use crate::notifier::ChannelNotifier;
use crate::reconciler::{Reconciler, ReconcilerHandle};
use crate::scheduler::Scheduler;
use crate::store::SqliteActivityStore;
use crate::streak::StreakEvaluator;
use crate::voice_tracker::{StreakState, VoiceHandler, still_in_tracked_voice};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("streakbot=info,serenity=warn")),
        )
        .init();

    let config = Config::from_env().context("invalid configuration")?;

    let store = Arc::new(
        SqliteActivityStore::connect(&config.database_url)
            .await
            .with_context(|| format!("failed to open {}", config.database_url))?,
    );
    store.run_migrations().await.context("failed to migrate database")?;

    let http = Arc::new(Http::new(&config.discord_token));
    let notifier = Arc::new(ChannelNotifier::new(http, config.notification_channel));

    let calendar = Calendar::new(config.timezone);
    let evaluator = Arc::new(StreakEvaluator::new(
        store.clone(),
        notifier,
        calendar,
        config.threshold_minutes,
    ));
    info!(
        tz = %calendar.timezone(),
        today = %calendar.today(),
        threshold_minutes = config.threshold_minutes,
        "streak calendar ready"
    );

    let (reconciler, worker) =
        ReconcilerHandle::spawn(Reconciler::new(evaluator.clone(), config.tracked_channels.clone()));
    let tracked_channels = Arc::new(config.tracked_channels.clone());

    let intents = GatewayIntents::GUILDS | GatewayIntents::GUILD_VOICE_STATES;
    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(VoiceHandler)
        .type_map_insert::<StreakState>(StreakState {
            reconciler: reconciler.clone(),
            evaluator: evaluator.clone(),
            tracked_channels: tracked_channels.clone(),
        })
        .await
        .context("failed to create discord client")?;

    let scheduler = Scheduler::new(config.timezone).await?;
    let nightly = evaluator.clone();
    scheduler
        .on_schedule("evaluate-streaks", &config.evaluation_cron, move || {
            let evaluator = nightly.clone();
            async move {
                match evaluator.evaluate_day(Utc::now()).await {
                    Ok(summary) => info!(?summary, "daily streak evaluation finished"),
                    Err(e) => error!("daily streak evaluation failed: {e}"),
                }
            }
        })
        .await?;
    let reminder = evaluator.clone();
    scheduler
        .on_schedule("streak-warnings", &config.warning_cron, move || {
            let evaluator = reminder.clone();
            async move {
                match evaluator.send_warnings(Utc::now()).await {
                    Ok(sent) => info!(sent, "streak warnings sent"),
                    Err(e) => error!("streak warning run failed: {e}"),
                }
            }
        })
        .await?;
    let cache = client.cache.clone();
    let sweeper = reconciler.clone();
    let max_age = Duration::hours(i64::from(config.max_session_hours));
    scheduler
        .on_schedule("session-sweep", &config.sweep_cron, move || {
            let reconciler = sweeper.clone();
            let cache = cache.clone();
            let tracked = tracked_channels.clone();
            async move {
                let swept = reconciler
                    .sweep(Utc::now(), max_age, None, |user_id, session| {
                        still_in_tracked_voice(&cache, &tracked, session.guild_id, user_id)
                    })
                    .await;
                match swept {
                    Ok(0) => {}
                    Ok(ended) => info!(ended, "ended stale sessions"),
                    Err(e) => error!("stale session sweep failed: {e}"),
                }
            }
        })
        .await?;
    scheduler.start().await?;

    let shard_manager = client.shard_manager.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            shard_manager.shutdown_all().await;
        }
    });

    info!("starting bot");
    if let Err(e) = client.start().await {
        error!("client error: {e:?}");
    }

    if let Err(e) = scheduler.shutdown().await {
        warn!("scheduler did not stop cleanly: {e}");
    }
    match reconciler.shutdown().await {
        Ok(flushed) => info!(flushed, "open sessions flushed"),
        Err(e) => warn!("could not flush open sessions: {e}"),
    }
    if let Err(e) = worker.await {
        warn!("reconciler worker ended abnormally: {e}");
    }
    store.close().await;
    info!("bye");
    Ok(())
}
