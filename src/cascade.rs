// Cascade detection: short-window burst accumulators per (symbol, side)
//
// The ingest path is the writer via record(); the sweeper task drains
// expired buckets. DashMap gives per-entry locking, so flushes for one
// key serialise while other keys stay independent.

use crate::alerts::AlertRouter;
use crate::config::{CASCADE_MIN_COUNT, CASCADE_MIN_VOLUME, CASCADE_WINDOW};
use crate::types::{CascadeAlert, LiquidationEvent, Side};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Clone, Copy, Debug)]
pub struct CascadeConfig {
    pub window: Duration,
    pub min_count: u32,
    pub min_volume: f64,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            window: CASCADE_WINDOW,
            min_count: CASCADE_MIN_COUNT,
            min_volume: CASCADE_MIN_VOLUME,
        }
    }
}

#[derive(Clone, Debug)]
struct Bucket {
    count: u32,
    total_volume: f64,
    min_price: f64,
    max_price: f64,
    start_time: DateTime<Utc>,
}

impl Bucket {
    fn seed(event: &LiquidationEvent) -> Self {
        Self {
            count: 1,
            total_volume: event.notional(),
            min_price: event.price,
            max_price: event.price,
            start_time: event.time,
        }
    }

    fn absorb(&mut self, event: &LiquidationEvent) {
        self.count += 1;
        self.total_volume += event.notional();
        self.min_price = self.min_price.min(event.price);
        self.max_price = self.max_price.max(event.price);
    }
}

pub struct CascadeDetector {
    buckets: DashMap<(String, Side), Bucket>,
    cfg: CascadeConfig,
}

impl CascadeDetector {
    pub fn new(cfg: CascadeConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            cfg,
        }
    }

    /// Fold one liquidation into its (symbol, side) bucket. Called
    /// synchronously from the ingest path.
    pub fn record(&self, event: &LiquidationEvent) {
        let key = (event.symbol.clone(), event.side);
        self.buckets
            .entry(key)
            .and_modify(|bucket| bucket.absorb(event))
            .or_insert_with(|| Bucket::seed(event));
    }

    /// Remove every bucket whose window has elapsed and return the alerts
    /// for those that met the count and volume thresholds. Buckets that
    /// miss the thresholds are discarded silently.
    pub fn drain_expired(&self, now: DateTime<Utc>) -> Vec<CascadeAlert> {
        let window = ChronoDuration::from_std(self.cfg.window).unwrap_or_else(|_| {
            ChronoDuration::seconds(CASCADE_WINDOW.as_secs() as i64)
        });
        let mut alerts = Vec::new();
        self.buckets.retain(|(symbol, side), bucket| {
            if now - bucket.start_time < window {
                return true;
            }
            if bucket.count >= self.cfg.min_count && bucket.total_volume >= self.cfg.min_volume {
                alerts.push(CascadeAlert {
                    symbol: symbol.clone(),
                    side: *side,
                    count: bucket.count,
                    total_volume: bucket.total_volume,
                    min_price: bucket.min_price,
                    max_price: bucket.max_price,
                    start_time: bucket.start_time,
                });
            } else {
                debug!(
                    symbol = %symbol,
                    count = bucket.count,
                    volume = bucket.total_volume,
                    "bucket expired below cascade thresholds"
                );
            }
            false
        });
        alerts
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

/// Sweeper task: evaluates bucket deadlines once a second and routes the
/// resulting cascade alerts. A final drain pass runs on shutdown so
/// in-flight buckets are not silently lost.
pub async fn run_sweeper(
    detector: Arc<CascadeDetector>,
    alerts: Arc<AlertRouter>,
    shutdown: Arc<AtomicBool>,
) {
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        let shutting_down = shutdown.load(Ordering::Relaxed);
        for alert in detector.drain_expired(Utc::now()) {
            info!(
                symbol = %alert.symbol,
                side = %alert.side,
                count = alert.count,
                volume = alert.total_volume,
                "cascade detected"
            );
            alerts.on_cascade(&alert).await;
        }
        if shutting_down {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event(symbol: &str, side: Side, price: f64, notional: f64, time: DateTime<Utc>) -> LiquidationEvent {
        LiquidationEvent {
            symbol: symbol.to_string(),
            side,
            price,
            quantity: notional / price,
            time,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000).unwrap()
    }

    #[test]
    fn burst_flushes_as_a_single_aggregate() {
        let detector = CascadeDetector::new(CascadeConfig::default());
        let start = t0();
        detector.record(&event("ETHUSDT", Side::Long, 3_000.0, 30_000.0, start));
        detector.record(&event("ETHUSDT", Side::Long, 3_100.0, 40_000.0, start + ChronoDuration::seconds(2)));
        detector.record(&event("ETHUSDT", Side::Long, 2_950.0, 20_000.0, start + ChronoDuration::seconds(4)));
        detector.record(&event("ETHUSDT", Side::Long, 3_050.0, 50_000.0, start + ChronoDuration::seconds(6)));

        // Window not elapsed yet: nothing to flush.
        assert!(detector.drain_expired(start + ChronoDuration::seconds(9)).is_empty());

        let alerts = detector.drain_expired(start + ChronoDuration::seconds(10));
        assert_eq!(alerts.len(), 1);
        let alert = &alerts[0];
        assert_eq!(alert.count, 4);
        assert_eq!(alert.total_volume, 140_000.0);
        assert_eq!(alert.min_price, 2_950.0);
        assert_eq!(alert.max_price, 3_100.0);
        assert_eq!(alert.start_time, start);
        assert_eq!(detector.bucket_count(), 0);
    }

    #[test]
    fn buckets_below_thresholds_expire_silently() {
        let detector = CascadeDetector::new(CascadeConfig::default());
        let start = t0();

        // Two events: below the count floor.
        detector.record(&event("BTCUSDT", Side::Short, 50_000.0, 80_000.0, start));
        detector.record(&event("BTCUSDT", Side::Short, 50_100.0, 90_000.0, start));
        assert!(detector.drain_expired(start + ChronoDuration::seconds(11)).is_empty());
        assert_eq!(detector.bucket_count(), 0);

        // Three events but thin volume: below the volume floor.
        for _ in 0..3 {
            detector.record(&event("BTCUSDT", Side::Short, 50_000.0, 10_000.0, start));
        }
        assert!(detector.drain_expired(start + ChronoDuration::seconds(11)).is_empty());
    }

    #[test]
    fn volume_floor_is_tunable() {
        let detector = CascadeDetector::new(CascadeConfig {
            min_volume: 25_000.0,
            ..CascadeConfig::default()
        });
        let start = t0();
        for _ in 0..3 {
            detector.record(&event("SOLUSDT", Side::Long, 100.0, 10_000.0, start));
        }
        let alerts = detector.drain_expired(start + ChronoDuration::seconds(11));
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].total_volume, 30_000.0);
    }

    #[test]
    fn sides_and_symbols_accumulate_independently() {
        let detector = CascadeDetector::new(CascadeConfig::default());
        let start = t0();
        for _ in 0..3 {
            detector.record(&event("ETHUSDT", Side::Long, 3_000.0, 40_000.0, start));
            detector.record(&event("ETHUSDT", Side::Short, 3_000.0, 40_000.0, start));
            detector.record(&event("BTCUSDT", Side::Long, 50_000.0, 40_000.0, start));
        }
        assert_eq!(detector.bucket_count(), 3);
        let alerts = detector.drain_expired(start + ChronoDuration::seconds(10));
        assert_eq!(alerts.len(), 3);
        assert!(alerts.iter().all(|a| a.count == 3 && a.total_volume == 120_000.0));
    }

    #[test]
    fn flushed_volume_equals_admitted_notional() {
        // Conservation: total flushed volume matches the sum of event
        // notionals admitted for the key, across several windows.
        let detector = CascadeDetector::new(CascadeConfig {
            min_count: 1,
            min_volume: 0.0,
            ..CascadeConfig::default()
        });
        let start = t0();
        let mut admitted = 0.0;
        let mut flushed = 0.0;
        for round in 0..5i64 {
            let base = start + ChronoDuration::seconds(round * 20);
            for i in 0..4 {
                let notional = 1_000.0 * (round * 4 + i + 1) as f64;
                admitted += notional;
                detector.record(&event("XRPUSDT", Side::Long, 0.5, notional, base));
            }
            for alert in detector.drain_expired(base + ChronoDuration::seconds(10)) {
                flushed += alert.total_volume;
            }
        }
        assert!((admitted - flushed).abs() < 1e-6);
    }
}
