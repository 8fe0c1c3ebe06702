// Sharded WebSocket ingest for the forced-liquidation stream
//
// The symbol universe is split into chunks of at most WS_SHARD_SIZE; each
// chunk gets one combined-stream socket driven by its own task with an
// explicit state machine. The manager broadcasts refresh commands over a
// watch channel; the upstream closes sockets after 24 h, so refreshing on
// our own schedule avoids a thundering reconnect.

use crate::alerts::AlertRouter;
use crate::cascade::CascadeDetector;
use crate::config::{WS_PING_INTERVAL, WS_RECONNECT_BACKOFF, WS_SHARD_SIZE};
use crate::storage::Storage;
use crate::types::{LiquidationEvent, Side};
use chrono::{TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, info, warn};

/// Downstream handling for one decoded event. The three steps run
/// synchronously, in this order: persist, cascade-accumulate, fan-out.
/// Ingest does not buffer; a slow step backpressures its own shard only.
pub struct Pipeline {
    storage: Arc<Storage>,
    cascade: Arc<CascadeDetector>,
    alerts: Arc<AlertRouter>,
}

impl Pipeline {
    pub fn new(
        storage: Arc<Storage>,
        cascade: Arc<CascadeDetector>,
        alerts: Arc<AlertRouter>,
    ) -> Self {
        Self {
            storage,
            cascade,
            alerts,
        }
    }

    pub async fn process(&self, event: LiquidationEvent) {
        if let Err(e) = self.storage.save_liquidation(&event).await {
            // Persistence is best-effort; alerts still go out.
            warn!(symbol = %event.symbol, error = %e, "persist failed, event not stored");
        }
        self.cascade.record(&event);
        self.alerts.on_liquidation(&event).await;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ShardState {
    Connecting,
    Open,
    Closing,
    Closed,
}

fn transition(shard: usize, state: &mut ShardState, next: ShardState) {
    if *state != next {
        debug!(shard, from = ?state, to = ?next, "shard state");
        *state = next;
    }
}

pub struct ShardManager {
    ws_base: String,
    pipeline: Arc<Pipeline>,
    shutdown: Arc<AtomicBool>,
    refresh_tx: watch::Sender<u64>,
}

impl ShardManager {
    pub fn new(ws_base: String, pipeline: Arc<Pipeline>, shutdown: Arc<AtomicBool>) -> Self {
        let (refresh_tx, _) = watch::channel(0u64);
        Self {
            ws_base,
            pipeline,
            shutdown,
            refresh_tx,
        }
    }

    /// Partition the universe and spawn one shard task per chunk.
    pub fn start(&self, symbols: &[&str]) {
        let mut shards = 0;
        for (index, chunk) in symbols.chunks(WS_SHARD_SIZE).enumerate() {
            let url = stream_url(&self.ws_base, chunk);
            let task = ShardTask {
                index,
                url,
                stream_count: chunk.len(),
                pipeline: self.pipeline.clone(),
                shutdown: self.shutdown.clone(),
                refresh_rx: self.refresh_tx.subscribe(),
            };
            tokio::spawn(task.run());
            shards += 1;
        }
        info!(shards, symbols = symbols.len(), "liquidation ingest started");
    }

    /// Broadcast a planned refresh: every shard closes its socket, waits
    /// out the backoff, and reconnects.
    pub fn trigger_refresh(&self) {
        info!("connection refresh requested");
        self.refresh_tx.send_modify(|generation| *generation += 1);
    }
}

/// Combined-stream URL subscribing every chunk member to @forceOrder.
pub fn stream_url(base: &str, symbols: &[&str]) -> String {
    let streams: Vec<String> = symbols
        .iter()
        .map(|s| format!("{}@forceOrder", s.to_lowercase()))
        .collect();
    format!("{}/stream?streams={}", base.trim_end_matches('/'), streams.join("/"))
}

struct ShardTask {
    index: usize,
    url: String,
    stream_count: usize,
    pipeline: Arc<Pipeline>,
    shutdown: Arc<AtomicBool>,
    refresh_rx: watch::Receiver<u64>,
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

impl ShardTask {
    async fn run(self) {
        let ShardTask {
            index,
            url,
            stream_count,
            pipeline,
            shutdown,
            mut refresh_rx,
        } = self;
        let mut state = ShardState::Closed;
        loop {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            transition(index, &mut state, ShardState::Connecting);
            match connect_async(&url).await {
                Ok((ws, _)) => {
                    transition(index, &mut state, ShardState::Open);
                    info!(shard = index, streams = stream_count, "liquidation stream connected");
                    drive(index, &mut state, ws, &pipeline, &shutdown, &mut refresh_rx).await;
                }
                Err(e) => {
                    warn!(shard = index, error = %e, "connect failed");
                }
            }
            transition(index, &mut state, ShardState::Closed);
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            tokio::time::sleep(WS_RECONNECT_BACKOFF).await;
        }
        debug!(shard = index, "shard task exiting");
    }
}

async fn drive(
    index: usize,
    state: &mut ShardState,
    ws: WsStream,
    pipeline: &Pipeline,
    shutdown: &AtomicBool,
    refresh_rx: &mut watch::Receiver<u64>,
) {
    let (mut write, mut read) = ws.split();
    let mut ping = tokio::time::interval(WS_PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.tick().await; // first tick fires immediately

    loop {
        if shutdown.load(Ordering::Relaxed) {
            transition(index, state, ShardState::Closing);
            let _ = write.send(Message::Close(None)).await;
            return;
        }
        tokio::select! {
            _ = ping.tick() => {
                if write.send(Message::Ping(Vec::new())).await.is_err() {
                    warn!(shard = index, "ping failed, reconnecting");
                    return;
                }
            }
            changed = refresh_rx.changed() => {
                if changed.is_ok() {
                    transition(index, state, ShardState::Closing);
                    info!(shard = index, "closing for planned refresh");
                    let _ = write.send(Message::Close(None)).await;
                }
                return;
            }
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Some(event) = decode_force_order(&text) {
                        pipeline.process(event).await;
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = write.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) => {
                    warn!(shard = index, "upstream closed the socket");
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(shard = index, error = %e, "websocket error");
                    return;
                }
                None => {
                    warn!(shard = index, "stream ended");
                    return;
                }
            }
        }
    }
}

/// Decode one combined-stream frame into a liquidation event. Returns
/// `None` for anything that is not a well-formed forceOrder payload;
/// malformed JSON is logged and skipped, never fatal to the shard.
pub fn decode_force_order(text: &str) -> Option<LiquidationEvent> {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "unparseable frame, skipping");
            return None;
        }
    };
    let data = value.get("data").unwrap_or(&value);
    if data.get("e").and_then(Value::as_str) != Some("forceOrder") {
        return None;
    }
    let order = data.get("o")?;
    let symbol = order.get("s").and_then(Value::as_str)?.to_string();
    let side = Side::from_order_side(order.get("S").and_then(Value::as_str).unwrap_or_default());
    let price = num_field(order, "p");
    let quantity = num_field(order, "q");
    if price <= 0.0 || quantity <= 0.0 {
        return None;
    }
    let time = order
        .get("T")
        .and_then(Value::as_i64)
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now);
    Some(LiquidationEvent {
        symbol,
        side,
        price,
        quantity,
        time,
    })
}

fn num_field(value: &Value, key: &str) -> f64 {
    match value.get(key) {
        Some(Value::String(s)) => s.parse().unwrap_or(0.0),
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buy_force_order_decodes_as_short_liquidation() {
        let frame = r#"{"stream":"btcusdt@forceOrder","data":{"e":"forceOrder","o":{"s":"BTCUSDT","S":"BUY","p":"50000","q":"2","T":1700000000000}}}"#;
        let event = decode_force_order(frame).unwrap();
        assert_eq!(event.symbol, "BTCUSDT");
        assert_eq!(event.side, Side::Short);
        assert_eq!(event.notional(), 100_000.0);
        assert_eq!(
            event.time,
            Utc.with_ymd_and_hms(2023, 11, 14, 22, 13, 20).unwrap()
        );
    }

    #[test]
    fn sell_and_unknown_sides_decode_as_long_liquidation() {
        let frame = r#"{"data":{"e":"forceOrder","o":{"s":"ETHUSDT","S":"SELL","p":"3000","q":"1","T":1700000000000}}}"#;
        assert_eq!(decode_force_order(frame).unwrap().side, Side::Long);
        let frame = r#"{"data":{"e":"forceOrder","o":{"s":"ETHUSDT","S":"OTHER","p":"3000","q":"1","T":1700000000000}}}"#;
        assert_eq!(decode_force_order(frame).unwrap().side, Side::Long);
    }

    #[test]
    fn non_force_order_frames_are_ignored() {
        assert!(decode_force_order(r#"{"result":null,"id":1}"#).is_none());
        assert!(decode_force_order(r#"{"data":{"e":"aggTrade","o":{}}}"#).is_none());
        assert!(decode_force_order("not json at all").is_none());
    }

    #[test]
    fn non_positive_price_or_quantity_is_rejected() {
        let frame = r#"{"data":{"e":"forceOrder","o":{"s":"ETHUSDT","S":"BUY","p":"0","q":"2","T":1}}}"#;
        assert!(decode_force_order(frame).is_none());
        let frame = r#"{"data":{"e":"forceOrder","o":{"s":"ETHUSDT","S":"BUY","p":"3000","q":"-1","T":1}}}"#;
        assert!(decode_force_order(frame).is_none());
        let frame = r#"{"data":{"e":"forceOrder","o":{"s":"ETHUSDT","S":"BUY","p":"3000","T":1}}}"#;
        assert!(decode_force_order(frame).is_none());
    }

    #[test]
    fn stream_url_lowercases_and_joins_streams() {
        let url = stream_url("wss://fstream.binance.com/", &["BTCUSDT", "ETHUSDT"]);
        assert_eq!(
            url,
            "wss://fstream.binance.com/stream?streams=btcusdt@forceOrder/ethusdt@forceOrder"
        );
    }
}
