// End-to-end pipeline tests: real components over an in-memory database
// and a recording messenger, no network.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use liqwatch::alerts::AlertRouter;
use liqwatch::cascade::{CascadeConfig, CascadeDetector};
use liqwatch::connection::{decode_force_order, Pipeline};
use liqwatch::messaging::{Messenger, SendError};
use liqwatch::storage::Storage;
use liqwatch::types::{LiquidationEvent, Side};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

struct RecordingMessenger {
    sent: Mutex<Vec<(i64, String)>>,
    blocked: HashSet<i64>,
}

impl RecordingMessenger {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            blocked: HashSet::new(),
        })
    }

    fn with_blocked(ids: &[i64]) -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            blocked: ids.iter().copied().collect(),
        })
    }

    fn recipients(&self) -> Vec<i64> {
        self.sent.lock().unwrap().iter().map(|(id, _)| *id).collect()
    }

    fn messages(&self) -> Vec<(i64, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Messenger for RecordingMessenger {
    async fn send(&self, chat_id: i64, text: &str) -> Result<(), SendError> {
        if self.blocked.contains(&chat_id) {
            return Err(SendError::Blocked);
        }
        self.sent.lock().unwrap().push((chat_id, text.to_string()));
        Ok(())
    }
}

async fn subscriber_with(storage: &Storage, chat_id: i64, symbol: &str, min_alert: u64, enabled: bool) {
    storage.find_or_create_subscriber(chat_id, None, None).await.unwrap();
    storage.toggle_tracked_symbol(chat_id, symbol).await.unwrap();
    storage.set_alert_threshold(chat_id, min_alert).await.unwrap();
    if !enabled {
        storage.set_notifications(chat_id, Some(false)).await.unwrap();
    }
}

fn liquidation(symbol: &str, side: Side, price: f64, notional: f64) -> LiquidationEvent {
    LiquidationEvent {
        symbol: symbol.to_string(),
        side,
        price,
        quantity: notional / price,
        time: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
    }
}

#[tokio::test]
async fn buy_force_order_persists_as_short_and_alerts_trackers() {
    let storage = Arc::new(Storage::open_in_memory().unwrap());
    let messenger = RecordingMessenger::new();
    let alerts = Arc::new(AlertRouter::new(
        storage.clone(),
        messenger.clone() as Arc<dyn Messenger>,
        None,
        250_000.0,
    ));
    let cascade = Arc::new(CascadeDetector::new(CascadeConfig::default()));
    let pipeline = Pipeline::new(storage.clone(), cascade, alerts);

    subscriber_with(&storage, 7, "BTCUSDT", 50_000, true).await;

    let frame = r#"{"stream":"btcusdt@forceOrder","data":{"e":"forceOrder","o":{"s":"BTCUSDT","S":"BUY","p":"50000","q":"2","T":1700000000000}}}"#;
    let event = decode_force_order(frame).unwrap();
    pipeline.process(event).await;

    // Persisted exactly once, as a short liquidation at the upstream time.
    let t = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
    let stored = storage
        .overall_liquidations_between(t - ChronoDuration::seconds(1), t + ChronoDuration::seconds(1))
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].side, Side::Short);
    assert_eq!(stored[0].notional(), 100_000.0);
    assert_eq!(stored[0].time, Utc.with_ymd_and_hms(2023, 11, 14, 22, 13, 20).unwrap());

    // The tracking subscriber was over threshold and got the alert.
    let messages = messenger.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].0, 7);
    assert!(messages[0].1.contains("REKT Short"));
}

#[tokio::test]
async fn cascade_burst_emits_one_aggregate_alert() {
    let storage = Arc::new(Storage::open_in_memory().unwrap());
    let messenger = RecordingMessenger::new();
    // Channel configured with the default floor: 140k stays below it.
    let alerts = Arc::new(AlertRouter::new(
        storage.clone(),
        messenger.clone() as Arc<dyn Messenger>,
        Some(-1_000),
        250_000.0,
    ));
    let cascade = Arc::new(CascadeDetector::new(CascadeConfig::default()));

    // Subscriber thresholds: alerts only fire for the aggregate, not the
    // individual sub-100k events.
    subscriber_with(&storage, 9, "ETHUSDT", 100_000, true).await;

    let start = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
    for (offset, notional, price) in [
        (0, 30_000.0, 3_000.0),
        (2, 40_000.0, 3_100.0),
        (4, 20_000.0, 2_950.0),
        (6, 50_000.0, 3_050.0),
    ] {
        let mut event = liquidation("ETHUSDT", Side::Long, price, notional);
        event.time = start + ChronoDuration::seconds(offset);
        cascade.record(&event);
        alerts.on_liquidation(&event).await;
    }
    // No single event crossed the subscriber threshold or the channel floor.
    assert!(messenger.messages().is_empty());

    let flushed = cascade.drain_expired(start + ChronoDuration::seconds(10));
    assert_eq!(flushed.len(), 1);
    let alert = &flushed[0];
    assert_eq!(alert.count, 4);
    assert_eq!(alert.total_volume, 140_000.0);
    assert_eq!(alert.min_price, 2_950.0);
    assert_eq!(alert.max_price, 3_100.0);

    alerts.on_cascade(alert).await;
    let messages = messenger.messages();
    // 140k >= subscriber's 100k but below the 250k channel floor.
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].0, 9);
    assert!(messages[0].1.contains("CASCADE ALERT: ETHUSDT"));
    assert!(!messages[0].1.contains("WHALE"));
}

#[tokio::test]
async fn cascade_broadcasts_once_over_the_channel_floor() {
    let storage = Arc::new(Storage::open_in_memory().unwrap());
    let messenger = RecordingMessenger::new();
    let alerts = AlertRouter::new(
        storage.clone(),
        messenger.clone() as Arc<dyn Messenger>,
        Some(-1_000),
        100_000.0,
    );
    let cascade = Arc::new(CascadeDetector::new(CascadeConfig::default()));
    let start = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
    for _ in 0..4 {
        cascade.record(&liquidation("ETHUSDT", Side::Long, 3_000.0, 35_000.0));
    }
    let flushed = cascade.drain_expired(start + ChronoDuration::seconds(10));
    assert_eq!(flushed.len(), 1);
    alerts.on_cascade(&flushed[0]).await;
    assert_eq!(messenger.recipients(), vec![-1_000]);
}

#[tokio::test]
async fn subscriber_thresholds_filter_fan_out() {
    let storage = Arc::new(Storage::open_in_memory().unwrap());
    let messenger = RecordingMessenger::new();
    let alerts = AlertRouter::new(
        storage.clone(),
        messenger.clone() as Arc<dyn Messenger>,
        None,
        250_000.0,
    );

    // A: low threshold. B: high threshold. C: disabled entirely.
    subscriber_with(&storage, 1, "SOLUSDT", 50_000, true).await;
    subscriber_with(&storage, 2, "SOLUSDT", 200_000, true).await;
    subscriber_with(&storage, 3, "SOLUSDT", 0, false).await;

    alerts
        .on_liquidation(&liquidation("SOLUSDT", Side::Long, 100.0, 100_000.0))
        .await;
    assert_eq!(messenger.recipients(), vec![1]);
}

#[tokio::test]
async fn raising_a_threshold_never_adds_alerts() {
    let stream: Vec<LiquidationEvent> = [20_000.0, 60_000.0, 120_000.0, 300_000.0]
        .iter()
        .map(|n| liquidation("SOLUSDT", Side::Short, 100.0, *n))
        .collect();

    let mut received_by_threshold = Vec::new();
    for threshold in [10_000u64, 100_000, 250_000] {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let messenger = RecordingMessenger::new();
        let alerts = AlertRouter::new(
            storage.clone(),
            messenger.clone() as Arc<dyn Messenger>,
            None,
            f64::MAX,
        );
        subscriber_with(&storage, 5, "SOLUSDT", threshold, true).await;
        for event in &stream {
            alerts.on_liquidation(event).await;
        }
        received_by_threshold.push(messenger.messages().len());
    }
    // Monotone: a higher floor can only shrink the delivered set.
    assert!(received_by_threshold.windows(2).all(|w| w[1] <= w[0]));
    assert_eq!(received_by_threshold, vec![4, 2, 1]);
}

#[tokio::test]
async fn blocked_recipient_gets_notifications_disabled() {
    let storage = Arc::new(Storage::open_in_memory().unwrap());
    let messenger = RecordingMessenger::with_blocked(&[11]);
    let alerts = AlertRouter::new(
        storage.clone(),
        messenger.clone() as Arc<dyn Messenger>,
        None,
        250_000.0,
    );
    subscriber_with(&storage, 11, "BTCUSDT", 10_000, true).await;
    subscriber_with(&storage, 12, "BTCUSDT", 10_000, true).await;

    alerts
        .on_liquidation(&liquidation("BTCUSDT", Side::Long, 50_000.0, 100_000.0))
        .await;

    // The healthy subscriber still got the alert.
    assert_eq!(messenger.recipients(), vec![12]);
    // The blocked one was switched off and is skipped from now on.
    let sub = storage.get_subscriber(11).await.unwrap();
    assert!(!sub.notifications_enabled);
    alerts
        .on_liquidation(&liquidation("BTCUSDT", Side::Long, 50_000.0, 100_000.0))
        .await;
    assert_eq!(messenger.recipients(), vec![12, 12]);
}

#[tokio::test]
async fn oi_surge_reaches_channel_and_base_trackers_regardless_of_threshold() {
    let storage = Arc::new(Storage::open_in_memory().unwrap());
    let messenger = RecordingMessenger::new();
    let alerts = AlertRouter::new(
        storage.clone(),
        messenger.clone() as Arc<dyn Messenger>,
        Some(-1_000),
        250_000.0,
    );
    // Tracks SOLUSDT with a huge liquidation threshold; OI surges ignore it.
    subscriber_with(&storage, 21, "SOLUSDT", 1_000_000_000, true).await;
    subscriber_with(&storage, 22, "BTCUSDT", 0, true).await;

    let surge = liqwatch::types::OiSurgeAlert {
        symbol: "SOL".to_string(),
        previous_oi: 100_000_000.0,
        current_oi: 103_000_000.0,
        percent_change: 3.0,
        price: 150.0,
    };
    alerts.on_oi_surge(&surge).await;

    let mut recipients = messenger.recipients();
    recipients.sort();
    assert_eq!(recipients, vec![-1_000, 21]);
}
