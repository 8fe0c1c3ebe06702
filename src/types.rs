// Core domain types shared across modules

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Side of the position that was forcibly closed.
///
/// The upstream encodes the forced order's side, not the position's: a BUY
/// forced order closes a short, a SELL forced order closes a long.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// Map the upstream forced-order side (`S` field) to the liquidated
    /// position side. Any value other than BUY counts as a long liquidation.
    pub fn from_order_side(order_side: &str) -> Self {
        if order_side == "BUY" {
            Side::Short
        } else {
            Side::Long
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Side::Long => "Long",
            Side::Short => "Short",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A single forced liquidation, as decoded from the upstream stream.
/// Append-only once persisted.
#[derive(Clone, Debug, PartialEq)]
pub struct LiquidationEvent {
    pub symbol: String,
    pub side: Side,
    pub price: f64,
    pub quantity: f64,
    pub time: DateTime<Utc>,
}

impl LiquidationEvent {
    /// Notional in quote currency. Derived, never stored.
    pub fn notional(&self) -> f64 {
        self.price * self.quantity
    }
}

/// A downstream alert recipient, keyed by chat id.
#[derive(Clone, Debug, PartialEq)]
pub struct Subscriber {
    pub chat_id: i64,
    pub first_name: Option<String>,
    pub username: Option<String>,
    pub tracked_symbols: BTreeSet<String>,
    pub notifications_enabled: bool,
    pub report_interval_hours: u32,
    pub min_liquidation_alert: u64,
    pub created_at: DateTime<Utc>,
}

/// Aggregate alert emitted when a burst of same-side liquidations on one
/// symbol crosses the cascade thresholds within the window.
#[derive(Clone, Debug, PartialEq)]
pub struct CascadeAlert {
    pub symbol: String,
    pub side: Side,
    pub count: u32,
    pub total_volume: f64,
    pub min_price: f64,
    pub max_price: f64,
    pub start_time: DateTime<Utc>,
}

/// Emitted by the open-interest scan when aggregate OI moved by more than
/// the surge threshold since the previous snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct OiSurgeAlert {
    /// Base symbol, without quote suffix.
    pub symbol: String,
    pub previous_oi: f64,
    pub current_oi: f64,
    pub percent_change: f64,
    pub price: f64,
}

/// Per-venue slice of the aggregated derivatives stats.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExchangeStats {
    pub name: String,
    pub price: f64,
    pub funding_rate: f64,
    pub next_funding_time: Option<DateTime<Utc>>,
    /// Open interest normalised to quote currency (USD).
    pub open_interest: f64,
    pub url: String,
}

/// Cross-venue aggregate for one base symbol. Value-typed; lives only in
/// the cache for its TTL.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AggregatedStats {
    /// Base symbol, without quote suffix.
    pub symbol: String,
    pub total_open_interest: f64,
    pub avg_price: f64,
    /// Sorted by open interest, descending.
    pub exchanges: Vec<ExchangeStats>,
}

/// Latest top-trader long/short account ratio point.
#[derive(Clone, Debug, PartialEq)]
pub struct LongShortRatio {
    pub symbol: String,
    pub long_short_ratio: f64,
    pub long_account_pct: f64,
    pub short_account_pct: f64,
}

/// One row of the global funding ranking.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FundingEntry {
    pub symbol: String,
    pub funding_rate: f64,
    pub price: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn side_mapping_buy_is_short() {
        assert_eq!(Side::from_order_side("BUY"), Side::Short);
        assert_eq!(Side::from_order_side("SELL"), Side::Long);
        // Unknown values default to long
        assert_eq!(Side::from_order_side("MARKET"), Side::Long);
        assert_eq!(Side::from_order_side(""), Side::Long);
    }

    #[test]
    fn notional_is_price_times_quantity() {
        let event = LiquidationEvent {
            symbol: "BTCUSDT".to_string(),
            side: Side::Short,
            price: 50_000.0,
            quantity: 2.0,
            time: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
        };
        assert_eq!(event.notional(), 100_000.0);
    }
}
