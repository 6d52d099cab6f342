//! Background expiry of live objects
//!
//! One task serves every object. It sleeps until the earliest expiry in the
//! registry's ordered index or the next announce tick, whichever is sooner,
//! and is woken early when an upload moves the earliest deadline. Remaining
//! lifetime is always derived from the persisted creation time, so a restart
//! never extends an object's life.

use crate::registry::Registry;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

pub struct EvictionScheduler {
    registry: Arc<Registry>,
    tick: Duration,
    shutdown: CancellationToken,
}

impl EvictionScheduler {
    pub fn new(registry: Arc<Registry>, tick: Duration) -> Self {
        Self {
            registry,
            tick: tick.max(Duration::from_millis(1)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Stop the scheduler when `token` is cancelled
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) {
        info!(tick = ?self.tick, "Eviction scheduler started");

        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let wait = self
                .registry
                .next_deadline()
                .await
                .map(|deadline| (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO));
            let next_expiry = async move {
                match wait {
                    Some(wait) => sleep(wait).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Eviction scheduler stopped");
                    break;
                }
                _ = ticker.tick() => {
                    self.evict().await;
                    self.registry.announce_remaining(Utc::now()).await;
                }
                _ = next_expiry => {
                    self.evict().await;
                }
                _ = self.registry.schedule_changed() => {
                    debug!("Schedule changed, recomputing next deadline");
                }
            }
        }
    }

    async fn evict(&self) {
        match self.registry.evict_expired(Utc::now()).await {
            Ok(evicted) if !evicted.is_empty() => {
                info!(count = evicted.len(), "Evicted expired objects");
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "Eviction pass failed"),
        }
    }
}
