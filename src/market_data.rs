// Cross-venue derivatives market data: per-venue fetchers, USD
// normalisation, aggregation, and the periodic open-interest surge scan.
//
// Venue failures are isolated: a venue that errors is omitted from the
// aggregate, and only an all-venue failure yields an absent result.

use crate::cache::{get_or_fetch, Cache};
use crate::config::{
    AGGREGATED_STATS_TTL, CONTRACT_SIZE_TTL, HTTP_TIMEOUT, OI_SNAPSHOT_TTL,
    OI_SURGE_THRESHOLD_PCT, TOP_FUNDING_TTL,
};
use crate::types::{AggregatedStats, ExchangeStats, FundingEntry, LongShortRatio, OiSurgeAlert};
use crate::utils::{base_symbol, pct_change};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

const BINANCE_FUTURES_BASE: &str = "https://fapi.binance.com";
const BYBIT_BASE: &str = "https://api.bybit.com";
const MEXC_CONTRACT_BASE: &str = "https://contract.mexc.com";

/// MEXC reports OI as a contract count; multiply by this when the contract
/// detail endpoint is unavailable.
pub const DEFAULT_CONTRACT_SIZE: f64 = 1.0;

const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

pub struct MarketData {
    http: reqwest::Client,
    cache: Arc<dyn Cache>,
}

impl MarketData {
    pub fn new(cache: Arc<dyn Cache>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("failed to build market data HTTP client")?;
        Ok(Self { http, cache })
    }

    async fn get_json(&self, url: &str) -> Result<Value> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .with_context(|| format!("request failed: {url}"))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("upstream returned {status} for {url}"));
        }
        resp.json::<Value>()
            .await
            .with_context(|| format!("invalid JSON from {url}"))
    }

    // ========================================================================
    // Per-venue fetchers
    // ========================================================================

    async fn fetch_binance(&self, base: &str) -> Result<ExchangeStats> {
        let symbol = format!("{base}USDT");
        let price_url = format!("{BINANCE_FUTURES_BASE}/fapi/v1/ticker/price?symbol={symbol}");
        let premium_url = format!("{BINANCE_FUTURES_BASE}/fapi/v1/premiumIndex?symbol={symbol}");
        let oi_url = format!("{BINANCE_FUTURES_BASE}/fapi/v1/openInterest?symbol={symbol}");
        let (price, premium, oi) = tokio::try_join!(
            self.get_json(&price_url),
            self.get_json(&premium_url),
            self.get_json(&oi_url),
        )?;
        Ok(decode_binance(base, &price, &premium, &oi))
    }

    async fn fetch_bybit(&self, base: &str) -> Result<ExchangeStats> {
        let resp = self
            .get_json(&format!(
                "{BYBIT_BASE}/v5/market/tickers?category=linear&symbol={base}USDT"
            ))
            .await?;
        decode_bybit(base, &resp).ok_or_else(|| anyhow!("bybit ticker list empty for {base}"))
    }

    async fn fetch_mexc(&self, base: &str) -> Result<ExchangeStats> {
        let symbol = format!("{base}_USDT");
        let ticker_url = format!("{MEXC_CONTRACT_BASE}/api/v1/contract/ticker?symbol={symbol}");
        let funding_url = format!("{MEXC_CONTRACT_BASE}/api/v1/contract/funding_rate/{symbol}");
        let (ticker, funding) = tokio::join!(
            self.get_json(&ticker_url),
            self.get_json(&funding_url),
        );
        let ticker = ticker?;
        // Funding is best-effort; a failed call leaves the rate at 0.
        let funding = funding.unwrap_or(Value::Null);
        let contract_size = self.contract_size(base).await;
        decode_mexc(base, &ticker, &funding, contract_size)
            .ok_or_else(|| anyhow!("mexc ticker payload missing for {base}"))
    }

    async fn contract_size(&self, base: &str) -> f64 {
        let cache = self.cache.clone();
        resolve_contract_size(cache.as_ref(), base, || async {
            let url =
                format!("{MEXC_CONTRACT_BASE}/api/v1/contract/detail?symbol={base}_USDT");
            match self.get_json(&url).await {
                Ok(resp) => decode_contract_size(&resp),
                Err(e) => {
                    debug!(symbol = %base, error = %e, "mexc contract detail fetch failed");
                    None
                }
            }
        })
        .await
    }

    // ========================================================================
    // Aggregation
    // ========================================================================

    /// Aggregated stats for a base symbol, cached for 60 s. `None` when
    /// every venue failed.
    pub async fn aggregated_stats(&self, base: &str) -> Result<Option<AggregatedStats>> {
        let key = format!("agg:{base}");
        let cached = get_or_fetch(
            self.cache.as_ref(),
            &key,
            Some(AGGREGATED_STATS_TTL),
            || async {
                match self.fetch_aggregated(base).await {
                    Some(stats) => Ok(Some(serde_json::to_string(&stats)?)),
                    None => Ok(None),
                }
            },
        )
        .await?;
        Ok(cached.and_then(|raw| serde_json::from_str(&raw).ok()))
    }

    async fn fetch_aggregated(&self, base: &str) -> Option<AggregatedStats> {
        let (binance, bybit, mexc) = tokio::join!(
            self.fetch_binance(base),
            self.fetch_bybit(base),
            self.fetch_mexc(base),
        );
        let mut venues = Vec::new();
        for (venue, result) in [("binance", binance), ("bybit", bybit), ("mexc", mexc)] {
            match result {
                Ok(stats) => venues.push(stats),
                Err(e) => debug!(venue, symbol = %base, error = %e, "venue omitted from aggregate"),
            }
        }
        aggregate(base, venues)
    }

    /// Cache-only read of a symbol's aggregated OI, for render-time extras.
    /// Never fetches.
    pub async fn cached_open_interest(&self, base: &str) -> Option<f64> {
        let raw = self.cache.get(&format!("agg:{base}")).await.ok()??;
        let stats: AggregatedStats = serde_json::from_str(&raw).ok()?;
        Some(stats.total_open_interest)
    }

    // ========================================================================
    // Open-interest surge scan
    // ========================================================================

    /// Compare current aggregate OI against the stored snapshot and refresh
    /// the snapshot. The first observation for a symbol writes the baseline
    /// and emits nothing.
    pub async fn record_and_compare_oi(
        &self,
        base: &str,
        current_oi: f64,
        price: f64,
    ) -> Result<Option<OiSurgeAlert>> {
        let key = format!("oi_last:{base}");
        let previous = self
            .cache
            .get(&key)
            .await?
            .and_then(|raw| raw.parse::<f64>().ok())
            .filter(|prev| *prev > 0.0);

        let surge = previous.and_then(|prev| {
            let change = pct_change(prev, current_oi);
            if change.abs() >= OI_SURGE_THRESHOLD_PCT {
                Some(OiSurgeAlert {
                    symbol: base.to_string(),
                    previous_oi: prev,
                    current_oi,
                    percent_change: change,
                    price,
                })
            } else {
                None
            }
        });

        // The snapshot is refreshed whether or not a surge fired.
        self.cache
            .set(&key, &current_oi.to_string(), Some(OI_SNAPSHOT_TTL))
            .await?;
        Ok(surge)
    }

    /// Scan the tracked universe; returns every surge found this pass.
    pub async fn oi_surge_scan(&self, bases: &[String]) -> Vec<OiSurgeAlert> {
        let mut alerts = Vec::new();
        for base in bases {
            let stats = match self.aggregated_stats(base).await {
                Ok(Some(stats)) => stats,
                Ok(None) => continue,
                Err(e) => {
                    warn!(symbol = %base, error = %e, "aggregated stats failed during oi scan");
                    continue;
                }
            };
            match self
                .record_and_compare_oi(base, stats.total_open_interest, stats.avg_price)
                .await
            {
                Ok(Some(alert)) => alerts.push(alert),
                Ok(None) => {}
                Err(e) => warn!(symbol = %base, error = %e, "oi snapshot update failed"),
            }
        }
        alerts
    }

    // ========================================================================
    // Funding & positioning
    // ========================================================================

    /// Latest top-trader long/short account ratio for a base symbol.
    pub async fn long_short_ratio(&self, base: &str) -> Result<Option<LongShortRatio>> {
        let symbol = format!("{base}USDT");
        let resp = self
            .get_json(&format!(
                "{BINANCE_FUTURES_BASE}/fapi/v1/topLongShortAccountRatio?symbol={symbol}&period=5m&limit=1"
            ))
            .await?;
        let point = match resp.as_array().and_then(|rows| rows.last()) {
            Some(point) => point,
            None => return Ok(None),
        };
        Ok(Some(LongShortRatio {
            symbol,
            long_short_ratio: field_f64(point, "longShortRatio"),
            long_account_pct: field_f64(point, "longAccount") * 100.0,
            short_account_pct: field_f64(point, "shortAccount") * 100.0,
        }))
    }

    /// Global funding ranking by absolute rate, cached for 5 minutes.
    pub async fn top_funding(&self, limit: usize) -> Result<Vec<FundingEntry>> {
        let mut entries = self.premium_index_sweep().await?;
        entries.sort_by(|a, b| {
            b.funding_rate
                .abs()
                .partial_cmp(&a.funding_rate.abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        entries.truncate(limit);
        Ok(entries)
    }

    /// Best-effort funding map (base symbol -> rate) for digest suffixes.
    /// Empty on failure so digests simply omit funding.
    pub async fn funding_map(&self) -> HashMap<String, f64> {
        match self.premium_index_sweep().await {
            Ok(entries) => entries
                .into_iter()
                .map(|e| (base_symbol(&e.symbol).to_string(), e.funding_rate))
                .collect(),
            Err(e) => {
                warn!(error = %e, "funding sweep failed, digests will omit funding");
                HashMap::new()
            }
        }
    }

    async fn premium_index_sweep(&self) -> Result<Vec<FundingEntry>> {
        let cached = get_or_fetch(
            self.cache.as_ref(),
            "top_funding",
            Some(TOP_FUNDING_TTL),
            || async {
                let resp = self
                    .get_json(&format!("{BINANCE_FUTURES_BASE}/fapi/v1/premiumIndex"))
                    .await?;
                let entries = decode_premium_index(&resp);
                if entries.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(serde_json::to_string(&entries)?))
                }
            },
        )
        .await?;
        Ok(cached
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default())
    }
}

/// Read-through contract-size lookup with the documented default of 1.0
/// whenever the detail endpoint yields nothing usable. Only successful
/// lookups are cached, so a failing venue is retried on the next pass.
pub(crate) async fn resolve_contract_size<F, Fut>(
    cache: &dyn Cache,
    base: &str,
    fetch: F,
) -> f64
where
    F: FnOnce() -> Fut + Send,
    Fut: Future<Output = Option<f64>> + Send,
{
    let key = format!("mexc_csize:{base}");
    let cached = get_or_fetch(cache, &key, Some(CONTRACT_SIZE_TTL), || async {
        Ok(fetch().await.filter(|size| *size > 0.0).map(|s| s.to_string()))
    })
    .await;
    match cached {
        Ok(Some(raw)) => raw.parse().unwrap_or(DEFAULT_CONTRACT_SIZE),
        _ => DEFAULT_CONTRACT_SIZE,
    }
}

// ============================================================================
// Decoders
//
// Venue JSON is heterogeneous and occasionally incomplete; every numeric
// field decodes to 0 when missing or unparsable, and decoding never panics.
// ============================================================================

fn field_f64(value: &Value, key: &str) -> f64 {
    match value.get(key) {
        Some(Value::String(s)) => s.parse().unwrap_or(0.0),
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn field_ms(value: &Value, key: &str) -> Option<DateTime<Utc>> {
    let ms = match value.get(key) {
        Some(Value::String(s)) => s.parse::<i64>().ok()?,
        Some(Value::Number(n)) => n.as_i64()?,
        _ => return None,
    };
    if ms <= 0 {
        return None;
    }
    Utc.timestamp_millis_opt(ms).single()
}

/// Binance reports OI in coin units; USD notional is coins times last price.
pub(crate) fn decode_binance(
    base: &str,
    price: &Value,
    premium: &Value,
    oi: &Value,
) -> ExchangeStats {
    let last_price = field_f64(price, "price");
    ExchangeStats {
        name: "Binance".to_string(),
        price: last_price,
        funding_rate: field_f64(premium, "lastFundingRate"),
        next_funding_time: field_ms(premium, "nextFundingTime"),
        open_interest: field_f64(oi, "openInterest") * last_price,
        url: format!("https://www.binance.com/en/futures/{base}USDT"),
    }
}

/// Bybit linear tickers report OI in coin units as well.
pub(crate) fn decode_bybit(base: &str, resp: &Value) -> Option<ExchangeStats> {
    let ticker = resp.get("result")?.get("list")?.get(0)?;
    let price = field_f64(ticker, "lastPrice");
    Some(ExchangeStats {
        name: "Bybit".to_string(),
        price,
        funding_rate: field_f64(ticker, "fundingRate"),
        next_funding_time: field_ms(ticker, "nextFundingTime"),
        open_interest: field_f64(ticker, "openInterest") * price,
        url: format!("https://www.bybit.com/trade/usdt/{base}USDT"),
    })
}

/// MEXC holdVol is a contract count: USD = holdVol * contractSize * price.
pub(crate) fn decode_mexc(
    base: &str,
    ticker: &Value,
    funding: &Value,
    contract_size: f64,
) -> Option<ExchangeStats> {
    let data = ticker.get("data")?;
    let price = field_f64(data, "lastPrice");
    let funding_data = funding.get("data");
    Some(ExchangeStats {
        name: "MEXC".to_string(),
        price,
        funding_rate: funding_data.map(|d| field_f64(d, "fundingRate")).unwrap_or(0.0),
        next_funding_time: funding_data.and_then(|d| field_ms(d, "nextSettleTime")),
        open_interest: field_f64(data, "holdVol") * contract_size * price,
        url: format!("https://futures.mexc.com/exchange/{base}_USDT"),
    })
}

pub(crate) fn decode_contract_size(resp: &Value) -> Option<f64> {
    let size = field_f64(resp.get("data")?, "contractSize");
    (size > 0.0).then_some(size)
}

fn decode_premium_index(resp: &Value) -> Vec<FundingEntry> {
    resp.as_array()
        .map(|rows| {
            rows.iter()
                .filter_map(|row| {
                    let symbol = row.get("symbol").and_then(Value::as_str)?;
                    if !symbol.ends_with("USDT") {
                        return None;
                    }
                    Some(FundingEntry {
                        symbol: symbol.to_string(),
                        funding_rate: field_f64(row, "lastFundingRate"),
                        price: field_f64(row, "markPrice"),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Fold per-venue stats into the aggregate: total OI, mean price, venues
/// sorted by OI descending. `None` when no venue survived.
pub(crate) fn aggregate(base: &str, mut exchanges: Vec<ExchangeStats>) -> Option<AggregatedStats> {
    if exchanges.is_empty() {
        return None;
    }
    let avg_price = exchanges.iter().map(|e| e.price).sum::<f64>() / exchanges.len() as f64;
    let total_open_interest = exchanges.iter().map(|e| e.open_interest).sum();
    exchanges.sort_by(|a, b| {
        b.open_interest
            .partial_cmp(&a.open_interest)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    Some(AggregatedStats {
        symbol: base.to_string(),
        total_open_interest,
        avg_price,
        exchanges,
    })
}
