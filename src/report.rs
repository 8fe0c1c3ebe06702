// Periodic liquidation digests: per-subscriber window sums with a
// prior-period comparison and a ranked tail.

use crate::storage::Storage;
use crate::types::{Side, Subscriber};
use crate::utils::{base_symbol, fmt_usd};
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Timelike, Utc};
use std::collections::{BTreeMap, HashMap};

/// Sentinel returned when the current window holds no events at all.
/// The caller decides whether to deliver it.
pub const NO_LIQUIDATIONS: &str = "😴 No liquidations in this period.";

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SideTotals {
    pub long: f64,
    pub short: f64,
}

/// Build the digest for one subscriber.
///
/// Scheduled reports compare `[now-H, now)` against `[now-2H, now-H)`.
/// Live reports cover the running hour and scale the prior interval down
/// to the elapsed fraction so the trend arrows compare like with like.
pub async fn generate_report(
    storage: &Storage,
    funding: &HashMap<String, f64>,
    subscriber: &Subscriber,
    interval_hours: u32,
    scheduled: bool,
    now: DateTime<Utc>,
) -> Result<Option<String>> {
    let hours = ChronoDuration::hours(interval_hours.max(1) as i64);
    let (cur_start, cur_end, prior_start, prior_end, prior_scale) = if scheduled {
        (now - hours, now, now - hours - hours, now - hours, 1.0)
    } else {
        let hour_start = start_of_hour(now);
        let elapsed_minutes = (now - hour_start).num_seconds() as f64 / 60.0;
        let scale = elapsed_minutes / (interval_hours.max(1) as f64 * 60.0);
        (hour_start, now, hour_start - hours, hour_start, scale)
    };

    let current = side_totals(storage, subscriber, cur_start, cur_end).await?;
    if current.is_empty() {
        return Ok(Some(NO_LIQUIDATIONS.to_string()));
    }
    let mut prior = side_totals(storage, subscriber, prior_start, prior_end).await?;
    for totals in prior.values_mut() {
        totals.long *= prior_scale;
        totals.short *= prior_scale;
    }

    Ok(render_digest(&current, &prior, funding, scheduled, interval_hours))
}

fn start_of_hour(t: DateTime<Utc>) -> DateTime<Utc> {
    t.date_naive()
        .and_hms_opt(t.hour(), 0, 0)
        .map(|naive| Utc.from_utc_datetime(&naive))
        .unwrap_or(t)
}

async fn side_totals(
    storage: &Storage,
    subscriber: &Subscriber,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<BTreeMap<String, SideTotals>> {
    let mut totals = BTreeMap::new();
    for symbol in &subscriber.tracked_symbols {
        let events = storage.liquidations_between(symbol, start, end).await?;
        if events.is_empty() {
            continue;
        }
        let entry: &mut SideTotals = totals.entry(symbol.clone()).or_default();
        for event in events {
            match event.side {
                Side::Long => entry.long += event.notional(),
                Side::Short => entry.short += event.notional(),
            }
        }
    }
    Ok(totals)
}

/// Pure rendering over the window sums. `None` when both sides filter to
/// empty.
pub fn render_digest(
    current: &BTreeMap<String, SideTotals>,
    prior: &BTreeMap<String, SideTotals>,
    funding: &HashMap<String, f64>,
    scheduled: bool,
    interval_hours: u32,
) -> Option<String> {
    let longs = ranked(current, |t| t.long);
    let shorts = ranked(current, |t| t.short);
    if longs.is_empty() && shorts.is_empty() {
        return None;
    }

    let mut out = if scheduled {
        format!("📊 *{interval_hours}h Liquidation Report*\n")
    } else {
        "📊 *Live Liquidation Report*\n".to_string()
    };

    if !longs.is_empty() {
        out.push_str("\n🔴 *LONGS LIQUIDATED*\n");
        for (symbol, value) in &longs {
            let prior_value = prior.get(*symbol).map(|t| t.long).unwrap_or(0.0);
            out.push_str(&symbol_line(symbol, *value, prior_value, funding));
        }
    }
    if !shorts.is_empty() {
        out.push_str("\n🟢 *SHORTS LIQUIDATED*\n");
        for (symbol, value) in &shorts {
            let prior_value = prior.get(*symbol).map(|t| t.short).unwrap_or(0.0);
            out.push_str(&symbol_line(symbol, *value, prior_value, funding));
        }
    }

    let long_total: f64 = longs.iter().map(|(_, v)| v).sum();
    let short_total: f64 = shorts.iter().map(|(_, v)| v).sum();
    out.push_str(&format!(
        "\n🔴 Longs: {}\n🟢 Shorts: {}\n💥 *TOTAL: {}*\n",
        fmt_usd(long_total),
        fmt_usd(short_total),
        fmt_usd(long_total + short_total),
    ));

    out.push_str("\n🏆 *Top rekted rank*\n");
    for (medal, (symbol, value)) in ["🥇", "🥈", "🥉"].iter().zip(longs.iter().take(3)) {
        out.push_str(&format!("{medal} #{} {} longs\n", base_symbol(symbol), fmt_usd(*value)));
    }
    for (medal, (symbol, value)) in ["🥇", "🥈", "🥉"].iter().zip(shorts.iter().take(3)) {
        out.push_str(&format!("{medal} #{} {} shorts\n", base_symbol(symbol), fmt_usd(*value)));
    }

    Some(out)
}

/// Symbols with a non-zero total for the side, largest first.
fn ranked(
    totals: &BTreeMap<String, SideTotals>,
    side: impl Fn(&SideTotals) -> f64,
) -> Vec<(&String, f64)> {
    let mut entries: Vec<(&String, f64)> = totals
        .iter()
        .map(|(symbol, t)| (symbol, side(t)))
        .filter(|(_, value)| *value > 0.0)
        .collect();
    entries.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    entries
}

fn symbol_line(
    symbol: &str,
    value: f64,
    prior_value: f64,
    funding: &HashMap<String, f64>,
) -> String {
    let arrow = if value > prior_value {
        " ⬆"
    } else if value < prior_value {
        " ⬇"
    } else {
        ""
    };
    let base = base_symbol(symbol);
    let funding_suffix = funding
        .get(base)
        .map(|rate| format!(" | FR: {:.4}%", rate * 100.0))
        .unwrap_or_default();
    format!("#{base}: {}{arrow}{funding_suffix}\n", fmt_usd(value))
}
