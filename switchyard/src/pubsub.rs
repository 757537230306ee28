//! Replica coordination over Redis pub/sub
//!
//! Every replica publishes a notice carrying the proxy ID after each committed
//! mutation and reacts to peers' notices by re-reading the config from storage.
//! Publishing happens strictly after the cache invalidation for the same
//! mutation, so a subscriber that re-reads never observes the stale entry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{redis::AsyncCommands, Pool};
use futures::StreamExt;

use crate::{error::Result, supervisor::Supervisor};

/// Outbound side of the change-notice channel
#[async_trait]
pub trait ChangeNotifier: Send + Sync {
    /// Broadcast that a proxy's settings changed
    async fn publish_settings_change(&self, proxy_id: &str) -> Result<()>;
}

/// Redis-backed notifier
pub struct RedisNotifier {
    pool: Pool,
    channel: String,
}

impl RedisNotifier {
    pub fn new(pool: Pool, channel: impl Into<String>) -> Self {
        Self {
            pool,
            channel: channel.into(),
        }
    }
}

#[async_trait]
impl ChangeNotifier for RedisNotifier {
    async fn publish_settings_change(&self, proxy_id: &str) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let receivers: i64 = conn.publish(&self.channel, proxy_id).await?;
        tracing::debug!(proxy_id, receivers, "published settings change");
        Ok(())
    }
}

const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Subscribe to change notices and feed them into the supervisor.
///
/// Runs until the process shuts down; broker disconnects are retried with
/// exponential backoff.
pub async fn run_subscriber(url: String, channel: String, supervisor: Arc<Supervisor>) {
    let mut backoff = Duration::from_secs(1);

    loop {
        match subscribe(&url, &channel, &supervisor).await {
            Ok(()) => {
                tracing::warn!(%channel, "pub/sub stream ended, resubscribing");
                backoff = Duration::from_secs(1);
            }
            Err(e) => {
                tracing::warn!(%channel, "pub/sub subscription failed: {}", e);
            }
        }

        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

async fn subscribe(url: &str, channel: &str, supervisor: &Arc<Supervisor>) -> Result<()> {
    let client = redis::Client::open(url)?;
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(channel).await?;

    tracing::info!(channel, "subscribed to settings changes");

    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let proxy_id: String = match msg.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("ignoring undecodable change notice: {}", e);
                continue;
            }
        };

        if let Err(e) = supervisor.handle_proxy_update(&proxy_id).await {
            tracing::warn!(proxy_id, "failed to apply settings change: {}", e);
        }
    }

    Ok(())
}
