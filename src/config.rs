// Environment configuration and application-wide tunables
// Required variables fail fast at startup; everything else has a default

use anyhow::{anyhow, Context, Result};
use std::time::Duration;

// ============================================================================
// Tunables
// ============================================================================

/// Notional floor for the broadcast channel, overridable via
/// CHANNEL_MIN_LIQUIDATION.
pub const DEFAULT_CHANNEL_MIN_LIQUIDATION: f64 = 250_000.0;

/// Single liquidations at or above this get the whale prefix.
pub const WHALE_ALERT_USD: f64 = 1_000_000.0;

/// Cascade detection window per (symbol, side) bucket.
pub const CASCADE_WINDOW: Duration = Duration::from_secs(10);
pub const CASCADE_MIN_COUNT: u32 = 3;
pub const CASCADE_MIN_VOLUME: f64 = 100_000.0;

/// Open-interest surge threshold in percent, and scan cadence.
pub const OI_SURGE_THRESHOLD_PCT: f64 = 2.5;
pub const OI_SCAN_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Streams per combined WebSocket connection.
pub const WS_SHARD_SIZE: usize = 50;
/// The upstream drops sockets after 24 h; we refresh eagerly just before.
pub const WS_REFRESH_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
pub const WS_PING_INTERVAL: Duration = Duration::from_secs(30);
pub const WS_RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Liquidation rows older than this are deleted by the daily retention job.
pub const RETENTION: Duration = Duration::from_secs(48 * 60 * 60);

/// Subscriber defaults.
pub const DEFAULT_MIN_LIQUIDATION_ALERT: u64 = 10_000;
pub const DEFAULT_REPORT_INTERVAL_HOURS: u32 = 4;
pub const REPORT_INTERVALS: [u32; 4] = [1, 4, 12, 24];

/// Cache TTLs.
pub const AGGREGATED_STATS_TTL: Duration = Duration::from_secs(60);
pub const TOP_FUNDING_TTL: Duration = Duration::from_secs(300);
pub const OI_SNAPSHOT_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const CONTRACT_SIZE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Per-call timeout for venue HTTP and outbound sends.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Perpetual symbol universe subscribed on the liquidation stream.
pub const SYMBOLS_TO_TRACK: [&str; 90] = [
    "BTCUSDT", "ETHUSDT", "BNBUSDT", "SOLUSDT", "XRPUSDT", "ADAUSDT",
    "DOGEUSDT", "AVAXUSDT", "DOTUSDT", "LINKUSDT", "MATICUSDT", "LTCUSDT",
    "TRXUSDT", "UNIUSDT", "ATOMUSDT", "NEARUSDT", "APTUSDT", "ARBUSDT",
    "OPUSDT", "FILUSDT", "INJUSDT", "SUIUSDT", "TIAUSDT", "SEIUSDT",
    "RUNEUSDT", "AAVEUSDT", "MKRUSDT", "LDOUSDT", "SNXUSDT", "CRVUSDT",
    "COMPUSDT", "SUSHIUSDT", "DYDXUSDT", "GMXUSDT", "ALGOUSDT", "XLMUSDT",
    "VETUSDT", "ICPUSDT", "HBARUSDT", "EGLDUSDT", "THETAUSDT", "FTMUSDT",
    "SANDUSDT", "MANAUSDT", "AXSUSDT", "GALAUSDT", "APEUSDT", "CHZUSDT",
    "ENJUSDT", "FLOWUSDT", "KAVAUSDT", "ZILUSDT", "ONEUSDT", "IOTAUSDT",
    "NEOUSDT", "QTUMUSDT", "XTZUSDT", "EOSUSDT", "BCHUSDT", "ETCUSDT",
    "ZECUSDT", "DASHUSDT", "XMRUSDT", "1000PEPEUSDT", "1000SHIBUSDT",
    "1000FLOKIUSDT", "1000BONKUSDT", "WIFUSDT", "ORDIUSDT", "JTOUSDT",
    "PYTHUSDT", "JUPUSDT", "WLDUSDT", "FETUSDT", "RNDRUSDT", "AGIXUSDT",
    "OCEANUSDT", "GRTUSDT", "IMXUSDT", "BLURUSDT", "MASKUSDT", "ENSUSDT",
    "LRCUSDT", "ZRXUSDT", "BATUSDT", "STXUSDT", "MINAUSDT", "ROSEUSDT",
    "CELOUSDT", "KSMUSDT",
];

// ============================================================================
// Environment configuration
// ============================================================================

#[derive(Clone, Debug)]
pub struct Config {
    /// SQLite database path for events and subscribers.
    pub database_path: String,
    pub telegram_bot_token: String,
    /// Base URL of the futures WebSocket endpoint, e.g. wss://fstream.binance.com.
    pub futures_ws_url: String,
    /// Broadcast channel chat id; broadcasting is disabled when unset.
    pub telegram_channel_id: Option<i64>,
    /// Notional floor for channel broadcasts, in USD.
    pub channel_min_liquidation: f64,
    /// Optional external cache backend; the in-process cache is used when unset.
    pub redis_host: Option<String>,
    pub redis_port: u16,
}

impl Config {
    /// Load configuration from the environment. Missing required variables
    /// are a startup error; nothing here is retried.
    pub fn from_env() -> Result<Self> {
        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./liqwatch.db".to_string());
        let telegram_bot_token = require_env("TELEGRAM_BOT_TOKEN")?;
        let futures_ws_url = require_env("FUTURES_WS_URL")?;

        let telegram_channel_id = match std::env::var("TELEGRAM_CHANNEL_ID") {
            Ok(raw) => Some(
                raw.parse::<i64>()
                    .with_context(|| format!("TELEGRAM_CHANNEL_ID is not an integer: {raw}"))?,
            ),
            Err(_) => None,
        };

        let channel_min_liquidation = match std::env::var("CHANNEL_MIN_LIQUIDATION") {
            Ok(raw) => raw
                .parse::<f64>()
                .with_context(|| format!("CHANNEL_MIN_LIQUIDATION is not a number: {raw}"))?,
            Err(_) => DEFAULT_CHANNEL_MIN_LIQUIDATION,
        };

        let redis_host = std::env::var("REDIS_HOST").ok().filter(|h| !h.is_empty());
        let redis_port = match std::env::var("REDIS_PORT") {
            Ok(raw) => raw
                .parse::<u16>()
                .with_context(|| format!("REDIS_PORT is not a port number: {raw}"))?,
            Err(_) => 6379,
        };

        let cfg = Self {
            database_path,
            telegram_bot_token,
            futures_ws_url,
            telegram_channel_id,
            channel_min_liquidation,
            redis_host,
            redis_port,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.telegram_bot_token.trim().is_empty() {
            return Err(anyhow!("TELEGRAM_BOT_TOKEN must not be empty"));
        }
        if !self.futures_ws_url.starts_with("ws://") && !self.futures_ws_url.starts_with("wss://")
        {
            return Err(anyhow!(
                "FUTURES_WS_URL must be a ws:// or wss:// URL, got '{}'",
                self.futures_ws_url
            ));
        }
        if self.channel_min_liquidation < 0.0 {
            return Err(anyhow!("CHANNEL_MIN_LIQUIDATION must be non-negative"));
        }
        Ok(())
    }
}

fn require_env(name: &str) -> Result<String> {
    std::env::var(name).map_err(|_| anyhow!("required environment variable {name} is not set"))
}
