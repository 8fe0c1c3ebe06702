// Periodic jobs: hourly digests, daily retention, the 15-minute OI scan,
// and the 24-hour connection refresh.
//
// Each job runs its body in a spawned task behind a per-job mutex; a tick
// that arrives while the previous run is still going is skipped with one
// warning instead of piling up.

use crate::alerts::AlertRouter;
use crate::config::{OI_SCAN_INTERVAL, RETENTION, SYMBOLS_TO_TRACK, WS_REFRESH_INTERVAL};
use crate::connection::ShardManager;
use crate::market_data::MarketData;
use crate::report::{generate_report, NO_LIQUIDATIONS};
use crate::storage::Storage;
use crate::utils::base_symbol;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Timelike, Utc};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct Scheduler {
    storage: Arc<Storage>,
    market: Arc<MarketData>,
    alerts: Arc<AlertRouter>,
    shards: Arc<ShardManager>,
    shutdown: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(
        storage: Arc<Storage>,
        market: Arc<MarketData>,
        alerts: Arc<AlertRouter>,
        shards: Arc<ShardManager>,
        shutdown: Arc<AtomicBool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            market,
            alerts,
            shards,
            shutdown,
        })
    }

    pub fn spawn_all(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(Self::report_job(self.clone())),
            tokio::spawn(Self::retention_job(self.clone())),
            tokio::spawn(Self::oi_job(self.clone())),
            tokio::spawn(Self::refresh_job(self.clone())),
        ]
    }

    // ========================================================================
    // Hourly digests, at minute 0
    // ========================================================================

    async fn report_job(self: Arc<Self>) {
        let guard = Arc::new(Mutex::new(()));
        loop {
            let now = Utc::now();
            let wait = (next_hour(now) - now).to_std().unwrap_or_default();
            tokio::time::sleep(wait).await;
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            let job = self.clone();
            let guard = guard.clone();
            tokio::spawn(async move {
                let Ok(_lock) = guard.try_lock() else {
                    warn!("hourly report job still running, tick skipped");
                    return;
                };
                job.send_scheduled_reports(Utc::now()).await;
            });
        }
    }

    async fn send_scheduled_reports(&self, now: DateTime<Utc>) {
        let subscribers = match self.storage.active_subscribers().await {
            Ok(subscribers) => subscribers,
            Err(e) => {
                warn!(error = %e, "subscriber lookup failed, reports skipped");
                return;
            }
        };
        let due: Vec<_> = subscribers
            .into_iter()
            .filter(|s| due_this_hour(now.hour(), s.report_interval_hours))
            .collect();
        if due.is_empty() {
            return;
        }

        let funding = self.market.funding_map().await;
        let mut sent = 0;
        for sub in due {
            let interval = sub.report_interval_hours.max(1);
            match generate_report(&self.storage, &funding, &sub, interval, true, now).await {
                Ok(Some(text)) if text != NO_LIQUIDATIONS => {
                    self.alerts.deliver(sub.chat_id, &text, true).await;
                    sent += 1;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(chat_id = sub.chat_id, error = %e, "report generation failed")
                }
            }
        }
        info!(sent, hour = now.hour(), "scheduled reports delivered");
    }

    // ========================================================================
    // Daily retention, at 00:00 UTC
    // ========================================================================

    async fn retention_job(self: Arc<Self>) {
        let guard = Arc::new(Mutex::new(()));
        loop {
            let now = Utc::now();
            let wait = (next_midnight(now) - now).to_std().unwrap_or_default();
            tokio::time::sleep(wait).await;
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            let job = self.clone();
            let guard = guard.clone();
            tokio::spawn(async move {
                let Ok(_lock) = guard.try_lock() else {
                    warn!("retention job still running, tick skipped");
                    return;
                };
                let cutoff = Utc::now()
                    - ChronoDuration::from_std(RETENTION)
                        .unwrap_or_else(|_| ChronoDuration::hours(48));
                match job.storage.delete_liquidations_older_than(cutoff).await {
                    Ok(deleted) => info!(deleted, "retention sweep complete"),
                    Err(e) => warn!(error = %e, "retention sweep failed"),
                }
            });
        }
    }

    // ========================================================================
    // Open-interest scan, every 15 minutes
    // ========================================================================

    async fn oi_job(self: Arc<Self>) {
        let guard = Arc::new(Mutex::new(()));
        // The first pass at startup writes the baselines.
        let mut tick = tokio::time::interval(OI_SCAN_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let bases: Arc<Vec<String>> = Arc::new(tracked_bases());
        loop {
            tick.tick().await;
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            let job = self.clone();
            let guard = guard.clone();
            let bases = bases.clone();
            tokio::spawn(async move {
                let Ok(_lock) = guard.try_lock() else {
                    warn!("oi scan still running, tick skipped");
                    return;
                };
                let surges = job.market.oi_surge_scan(&bases).await;
                let count = surges.len();
                for surge in surges {
                    job.alerts.on_oi_surge(&surge).await;
                }
                info!(symbols = bases.len(), surges = count, "oi scan pass complete");
            });
        }
    }

    // ========================================================================
    // Connection refresh, every 24 hours
    // ========================================================================

    async fn refresh_job(self: Arc<Self>) {
        let start = tokio::time::Instant::now() + WS_REFRESH_INTERVAL;
        let mut tick = tokio::time::interval_at(start, WS_REFRESH_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            self.shards.trigger_refresh();
        }
    }
}

/// Base symbols of the tracked universe, deduplicated.
pub fn tracked_bases() -> Vec<String> {
    SYMBOLS_TO_TRACK
        .iter()
        .map(|s| base_symbol(s).to_string())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// A subscriber is due when the UTC hour lands on their interval grid.
pub fn due_this_hour(hour: u32, interval_hours: u32) -> bool {
    hour % interval_hours.max(1) == 0
}

fn next_hour(now: DateTime<Utc>) -> DateTime<Utc> {
    let truncated = now
        .date_naive()
        .and_hms_opt(now.hour(), 0, 0)
        .map(|naive| Utc.from_utc_datetime(&naive))
        .unwrap_or(now);
    truncated + ChronoDuration::hours(1)
}

fn next_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .succ_opt()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
        .unwrap_or_else(|| now + ChronoDuration::days(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_grid_matches_utc_hours() {
        // 4-hour subscribers fire at 0, 4, 8, 12, 16, 20.
        let fired: Vec<u32> = (0..24).filter(|h| due_this_hour(*h, 4)).collect();
        assert_eq!(fired, [0, 4, 8, 12, 16, 20]);
        // Hourly subscribers fire every hour, daily only at midnight.
        assert!((0..24).all(|h| due_this_hour(h, 1)));
        assert_eq!((0..24).filter(|h| due_this_hour(*h, 24)).count(), 1);
    }

    #[test]
    fn boundaries_align_to_hour_and_day() {
        let now = Utc.with_ymd_and_hms(2023, 11, 14, 22, 13, 20).unwrap();
        assert_eq!(next_hour(now), Utc.with_ymd_and_hms(2023, 11, 14, 23, 0, 0).unwrap());
        assert_eq!(
            next_midnight(now),
            Utc.with_ymd_and_hms(2023, 11, 15, 0, 0, 0).unwrap()
        );
        // Exactly on the hour still waits a full period.
        let on_hour = Utc.with_ymd_and_hms(2023, 11, 14, 22, 0, 0).unwrap();
        assert_eq!(next_hour(on_hour), Utc.with_ymd_and_hms(2023, 11, 14, 23, 0, 0).unwrap());
    }

    #[test]
    fn tracked_bases_are_deduplicated() {
        let bases = tracked_bases();
        assert!(!bases.is_empty());
        assert!(bases.windows(2).all(|w| w[0] < w[1]));
        assert!(bases.iter().all(|b| !b.ends_with("USDT")));
    }
}
