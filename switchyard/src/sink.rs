//! Downstream stats delivery
//!
//! The flusher drains every proxy's counters on an interval and publishes
//! per-target aggregate records to NATS. Delivery is at-least-once: a failed
//! publish merges the window back into the aggregator and the next tick
//! retries.

use std::sync::Arc;
use std::time::Duration;

use async_nats::Client;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    config::StatsConfig,
    error::{Error, Result},
    proxy::stats::StatsWindow,
    supervisor::Supervisor,
};

/// One flushed aggregate. An empty `target_id` carries the proxy-level
/// errors that happened before a target was selected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisitAggregate {
    pub proxy_id: String,
    pub target_id: String,
    pub timestamp: DateTime<Utc>,
    pub request_count: u64,
    pub error_count: u64,
    pub unique_users: Vec<String>,
    /// True when the unique-user set hit its cap and undercounts
    #[serde(default)]
    pub users_sampled: bool,
    pub latency_ms_sum: f64,
    pub latency_samples: u64,
}

/// Where flushed aggregates go
#[async_trait]
pub trait StatsSink: Send + Sync {
    async fn publish(&self, records: &[VisitAggregate]) -> Result<()>;
}

/// NATS-backed sink
pub struct NatsSink {
    client: Client,
    subject: String,
}

impl NatsSink {
    /// Connect to the broker named in the stats config
    pub async fn connect(config: &StatsConfig) -> Result<Self> {
        let client = async_nats::connect(config.nats_url.as_str())
            .await
            .map_err(|e| Error::Nats(format!("failed to connect to {}: {e}", config.nats_url)))?;

        tracing::info!("stats sink connected to {}", config.nats_url);

        Ok(Self {
            client,
            subject: config.subject.clone(),
        })
    }
}

#[async_trait]
impl StatsSink for NatsSink {
    async fn publish(&self, records: &[VisitAggregate]) -> Result<()> {
        for record in records {
            let payload = serde_json::to_vec(record)
                .map_err(|e| Error::Internal(format!("failed to encode visit aggregate: {e}")))?;

            self.client
                .publish(self.subject.clone(), payload.into())
                .await
                .map_err(|e| Error::Nats(format!("failed to publish to {}: {e}", self.subject)))?;
        }

        self.client
            .flush()
            .await
            .map_err(|e| Error::Nats(format!("failed to flush stats sink: {e}")))?;

        Ok(())
    }
}

/// Turn one drained window into sink records
pub fn window_records(
    proxy_id: &str,
    window: &StatsWindow,
    timestamp: DateTime<Utc>,
) -> Vec<VisitAggregate> {
    let mut records: Vec<VisitAggregate> = window
        .per_target
        .iter()
        .map(|(target_id, target)| {
            let mut unique_users: Vec<String> = target.users.iter().cloned().collect();
            unique_users.sort();
            VisitAggregate {
                proxy_id: proxy_id.to_string(),
                target_id: target_id.clone(),
                timestamp,
                request_count: target.requests,
                error_count: target.errors,
                unique_users,
                users_sampled: target.users_sampled,
                latency_ms_sum: target.latency_ms_sum,
                latency_samples: target.latency_samples,
            }
        })
        .collect();
    records.sort_by(|a, b| a.target_id.cmp(&b.target_id));

    if window.proxy_errors > 0 {
        let mut unique_users: Vec<String> = window.error_users.iter().cloned().collect();
        unique_users.sort();
        records.push(VisitAggregate {
            proxy_id: proxy_id.to_string(),
            target_id: String::new(),
            timestamp,
            request_count: 0,
            error_count: window.proxy_errors,
            unique_users,
            users_sampled: false,
            latency_ms_sum: 0.0,
            latency_samples: 0,
        });
    }

    records
}

/// Drain-and-publish loop. Runs until the process shuts down.
pub async fn run_flusher(
    supervisor: Arc<Supervisor>,
    sink: Arc<dyn StatsSink>,
    flush_interval: Duration,
) {
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        flush_once(&supervisor, sink.as_ref()).await;
    }
}

async fn flush_once(supervisor: &Supervisor, sink: &dyn StatsSink) {
    for proxy in supervisor.instances() {
        let stats = proxy.stats();
        let window = stats.drain();
        if window.is_empty() {
            continue;
        }

        let records = window_records(stats.proxy_id(), &window, Utc::now());
        if let Err(e) = sink.publish(&records).await {
            tracing::warn!(
                proxy_id = %stats.proxy_id(),
                "failed to flush stats, keeping window for retry: {}",
                e
            );
            stats.restore(window);
        }
    }
}
