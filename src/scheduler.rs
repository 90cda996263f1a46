use std::future::Future;
use std::sync::Arc;

use chrono_tz::Tz;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;

use crate::error::Result;

/// Cron triggers evaluated in the bot's calendar timezone.
pub struct Scheduler {
    inner: JobScheduler,
    tz: Tz,
}

impl Scheduler {
    pub async fn new(tz: Tz) -> Result<Self> {
        Ok(Self {
            inner: JobScheduler::new().await?,
            tz,
        })
    }

    /// Runs `handler` on every tick of `cron` (six fields, seconds first).
    pub async fn on_schedule<F, Fut>(&self, name: &'static str, cron: &str, handler: F) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let job = Job::new_async_tz(cron, self.tz, move |_id, _scheduler| {
            let handler = handler.clone();
            Box::pin(async move {
                info!(job = name, "scheduled job fired");
                handler().await;
            })
        })?;

        self.inner.add(job).await?;
        info!(job = name, cron, tz = %self.tz, "scheduled job registered");
        Ok(())
    }

    pub async fn start(&self) -> Result<()> {
        self.inner.start().await?;
        Ok(())
    }

    pub async fn shutdown(mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
