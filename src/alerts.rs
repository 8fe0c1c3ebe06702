// Alert fan-out: routes liquidations, cascades, and OI surges to the
// broadcast channel and to matching subscribers.
//
// Rendering is a pure function of the event; routing never propagates
// failures back into the ingest path.

use crate::config::WHALE_ALERT_USD;
use crate::market_data::MarketData;
use crate::messaging::{Messenger, SendError};
use crate::storage::Storage;
use crate::types::{CascadeAlert, LiquidationEvent, OiSurgeAlert, Side};
use crate::utils::{base_symbol, fmt_millions, fmt_price, fmt_usd, pct_change};
use std::sync::Arc;
use tracing::{info, warn};

pub struct AlertRouter {
    storage: Arc<Storage>,
    messenger: Arc<dyn Messenger>,
    market: Option<Arc<MarketData>>,
    channel_id: Option<i64>,
    channel_min: f64,
}

impl AlertRouter {
    pub fn new(
        storage: Arc<Storage>,
        messenger: Arc<dyn Messenger>,
        channel_id: Option<i64>,
        channel_min: f64,
    ) -> Self {
        Self {
            storage,
            messenger,
            market: None,
            channel_id,
            channel_min,
        }
    }

    /// Enable the optional cache-resident OI line on cascade alerts.
    pub fn with_market_data(mut self, market: Arc<MarketData>) -> Self {
        self.market = Some(market);
        self
    }

    pub async fn on_liquidation(&self, event: &LiquidationEvent) {
        let text = render_liquidation(event);
        let notional = event.notional();
        self.broadcast_if(notional >= self.channel_min, &text).await;
        self.fan_out(&event.symbol, notional, &text).await;
    }

    pub async fn on_cascade(&self, alert: &CascadeAlert) {
        let oi = match &self.market {
            Some(market) => market.cached_open_interest(base_symbol(&alert.symbol)).await,
            None => None,
        };
        let text = render_cascade(alert, oi);
        self.broadcast_if(alert.total_volume >= self.channel_min, &text)
            .await;
        self.fan_out(&alert.symbol, alert.total_volume, &text).await;
    }

    /// OI surges broadcast unconditionally and reach every subscriber
    /// tracking the base symbol, regardless of their notional threshold.
    pub async fn on_oi_surge(&self, alert: &OiSurgeAlert) {
        let text = render_oi_surge(alert);
        self.broadcast_if(true, &text).await;
        match self.storage.active_subscribers().await {
            Ok(subscribers) => {
                for sub in subscribers {
                    let tracks_base = sub
                        .tracked_symbols
                        .iter()
                        .any(|s| base_symbol(s) == alert.symbol);
                    if tracks_base {
                        self.deliver(sub.chat_id, &text, true).await;
                    }
                }
            }
            Err(e) => warn!(error = %e, "subscriber lookup failed, oi fan-out skipped"),
        }
    }

    async fn broadcast_if(&self, eligible: bool, text: &str) {
        if let Some(channel) = self.channel_id {
            if eligible {
                self.deliver(channel, text, false).await;
            }
        }
    }

    async fn fan_out(&self, symbol: &str, notional: f64, text: &str) {
        match self.storage.subscribers_tracking(symbol).await {
            Ok(subscribers) => {
                for sub in subscribers {
                    if notional < sub.min_liquidation_alert as f64 {
                        continue;
                    }
                    self.deliver(sub.chat_id, text, true).await;
                }
            }
            Err(e) => warn!(symbol, error = %e, "subscriber lookup failed, fan-out skipped"),
        }
    }

    /// Apply the blocked-recipient policy: a blocked subscriber gets their
    /// notifications disabled, everything else is logged and dropped.
    pub async fn deliver(&self, chat_id: i64, text: &str, is_subscriber: bool) {
        match self.messenger.send(chat_id, text).await {
            Ok(()) => {}
            Err(SendError::Blocked) if is_subscriber => {
                info!(chat_id, "recipient blocked the bot, disabling notifications");
                if let Err(e) = self.storage.set_notifications(chat_id, Some(false)).await {
                    warn!(chat_id, error = %e, "failed to disable notifications");
                }
            }
            Err(e) => warn!(chat_id, error = %e, "send failed, dropping message"),
        }
    }
}

// ============================================================================
// Rendering
// ============================================================================

pub fn render_liquidation(event: &LiquidationEvent) -> String {
    let icon = match event.side {
        Side::Long => "🔴",
        Side::Short => "🟢",
    };
    let notional = event.notional();
    let mut text = String::new();
    if notional >= WHALE_ALERT_USD {
        text.push_str("🔥 *WHALE ALERT!* 🔥\n");
    }
    text.push_str(&format!(
        "{icon} *#{symbol} REKT {side}:* {value} at ${price}",
        symbol = event.symbol,
        side = event.side.label(),
        value = fmt_usd(notional),
        price = fmt_price(event.price),
    ));
    text
}

pub fn render_cascade(alert: &CascadeAlert, oi_usd: Option<f64>) -> String {
    let (emoji, label) = match alert.side {
        Side::Long => ("🔴", "Longs Rekt"),
        Side::Short => ("🟢", "Shorts Squeezed"),
    };
    let range_pct = pct_change(alert.min_price, alert.max_price);
    let mut text = format!(
        "{emoji} *CASCADE ALERT: {symbol}*\n\n\
         💀 *{label}* (x{count} orders)\n\
         💰 Total Volume: *{volume}* in 10s\n\
         📉 Range: {min} - {max} ({range_pct:.2}%)",
        symbol = alert.symbol,
        count = alert.count,
        volume = fmt_usd(alert.total_volume),
        min = fmt_price(alert.min_price),
        max = fmt_price(alert.max_price),
    );
    if let Some(oi) = oi_usd {
        text.push_str(&format!("\n📊 OI: ${}M", fmt_millions(oi)));
    }
    text
}

pub fn render_oi_surge(alert: &OiSurgeAlert) -> String {
    let rising = alert.percent_change >= 0.0;
    let (head, dot, verb) = if rising {
        ("📈", "🟢", "INCREASED")
    } else {
        ("📉", "🔴", "DROPPED")
    };
    format!(
        "{head} *OI ALERT: {symbol}*\n\n\
         {dot} Open Interest {verb} by *{pct:.1}%* in 15 min!\n\n\
         💵 Price: ${price}\n\
         💰 New OI: *${oi}M*",
        symbol = alert.symbol,
        pct = alert.percent_change.abs(),
        price = fmt_price(alert.price),
        oi = fmt_millions(alert.current_oi),
    )
}
