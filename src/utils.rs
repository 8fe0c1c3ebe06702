// Formatting and symbol helpers shared across modules

/// Format a USD notional for alert and digest text.
/// At or above one million: "$X.XXM"; below: thousands as "$Xk".
pub fn fmt_usd(value: f64) -> String {
    if value >= 1_000_000.0 {
        format!("${:.2}M", value / 1_000_000.0)
    } else {
        format!("${:.0}k", value / 1_000.0)
    }
}

/// Millions with one decimal, for OI lines ("103.0" for 103M).
pub fn fmt_millions(value: f64) -> String {
    format!("{:.1}", value / 1_000_000.0)
}

/// Price formatting: sub-dollar prices keep more precision.
pub fn fmt_price(price: f64) -> String {
    if price < 1.0 {
        format!("{price:.4}")
    } else {
        format!("{price:.2}")
    }
}

/// Strip the quote suffix from a venue symbol: BTCUSDT -> BTC.
/// Symbols without a known suffix are returned unchanged.
pub fn base_symbol(symbol: &str) -> &str {
    for quote in ["USDT", "USDC", "BUSD", "USD"] {
        if let Some(base) = symbol.strip_suffix(quote) {
            if !base.is_empty() {
                return base;
            }
        }
    }
    symbol
}

/// Signed percent change from `previous` to `current`. Zero when the
/// baseline is zero or not finite.
pub fn pct_change(previous: f64, current: f64) -> f64 {
    if previous == 0.0 || !previous.is_finite() {
        return 0.0;
    }
    (current - previous) / previous * 100.0
}
