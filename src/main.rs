use anyhow::{Context, Result};
use liqwatch::alerts::AlertRouter;
use liqwatch::cache::{Cache, MemoryCache, RedisCache};
use liqwatch::cascade::{self, CascadeConfig, CascadeDetector};
use liqwatch::config::{Config, SYMBOLS_TO_TRACK};
use liqwatch::connection::{Pipeline, ShardManager};
use liqwatch::logger;
use liqwatch::market_data::MarketData;
use liqwatch::messaging::{Messenger, Telegram};
use liqwatch::scheduler::Scheduler;
use liqwatch::storage::Storage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    logger::init();

    let cfg = Config::from_env()?;
    info!(
        symbols = SYMBOLS_TO_TRACK.len(),
        channel = cfg.telegram_channel_id.is_some(),
        "starting liqwatch"
    );

    let storage = Arc::new(Storage::open(&cfg.database_path)?);
    let cache: Arc<dyn Cache> = match &cfg.redis_host {
        Some(host) => {
            info!(host = %host, port = cfg.redis_port, "using redis cache");
            Arc::new(RedisCache::connect(host, cfg.redis_port).await?)
        }
        None => Arc::new(MemoryCache::new()),
    };
    let market = Arc::new(MarketData::new(cache)?);
    let messenger: Arc<dyn Messenger> = Arc::new(Telegram::new(&cfg.telegram_bot_token)?);
    let alerts = Arc::new(
        AlertRouter::new(
            storage.clone(),
            messenger,
            cfg.telegram_channel_id,
            cfg.channel_min_liquidation,
        )
        .with_market_data(market.clone()),
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    let cascade = Arc::new(CascadeDetector::new(CascadeConfig::default()));
    let pipeline = Arc::new(Pipeline::new(storage.clone(), cascade.clone(), alerts.clone()));

    let shards = Arc::new(ShardManager::new(
        cfg.futures_ws_url.clone(),
        pipeline,
        shutdown.clone(),
    ));
    shards.start(&SYMBOLS_TO_TRACK);

    tokio::spawn(cascade::run_sweeper(
        cascade.clone(),
        alerts.clone(),
        shutdown.clone(),
    ));

    let scheduler = Scheduler::new(storage, market, alerts, shards, shutdown.clone());
    scheduler.spawn_all();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received, draining");
    shutdown.store(true, Ordering::Relaxed);
    // Grace window: sockets close and the cascade sweeper runs its final drain.
    tokio::time::sleep(Duration::from_secs(5)).await;
    info!("shutdown complete");
    Ok(())
}
