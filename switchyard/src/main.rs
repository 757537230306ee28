use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use switchyard::{
    cache::{self, ProxyCache},
    config::Config,
    database,
    error::Result,
    handlers, proxy,
    pubsub::{self, RedisNotifier},
    sink::{self, NatsSink},
    state::AppState,
    storage::Storage,
    supervisor::Supervisor,
    server,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config);

    tracing::info!("starting switchyard {}", env!("CARGO_PKG_VERSION"));

    let db_pool = database::create_pool(&config.database).await?;
    let redis_pool = cache::create_pool(&config.redis).await?;

    let proxy_cache = ProxyCache::new(redis_pool.clone(), config.redis.cache_ttl_secs);
    let storage = Arc::new(Storage::new(db_pool, proxy_cache));
    storage.initialize().await?;

    let notifier = Arc::new(RedisNotifier::new(
        redis_pool,
        config.redis.pubsub_channel.clone(),
    ));
    let supervisor = Arc::new(Supervisor::new(storage.clone(), notifier));
    supervisor.bootstrap().await?;

    let stats_sink = Arc::new(NatsSink::connect(&config.stats).await?);
    tokio::spawn(sink::run_flusher(
        supervisor.clone(),
        stats_sink,
        Duration::from_secs(config.stats.flush_interval_secs),
    ));

    tokio::spawn(pubsub::run_subscriber(
        config.redis.url.clone(),
        config.redis.pubsub_channel.clone(),
        supervisor.clone(),
    ));

    let state = AppState::new(Arc::new(config.clone()), storage, supervisor.clone());
    let admin = handlers::admin_router(state);
    let ingress = proxy::handler::router(supervisor);

    server::serve(&config, admin, ingress).await
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.admin.log_level.clone()));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
