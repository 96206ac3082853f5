use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDate};
use tracing::{error, info, warn};

use crate::engine::Engine;

const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Soft cap on one reminder pass. A pass that blows through it is logged and
/// abandoned; the engine's sweep lock keeps the next tick from piling on.
const SWEEP_TIMEOUT: Duration = Duration::from_secs(120);

/// Background task driving the periodic sweeps for one tenant: reminders
/// every five minutes, plus the no-show sweep on the first tick of each new
/// calendar day (which also covers a restart that slept past midnight).
pub async fn run_scheduler(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    let mut last_no_show_day: Option<NaiveDate> = None;

    loop {
        interval.tick().await;
        let now = Local::now().naive_local();

        if last_no_show_day != Some(now.date()) {
            match engine.run_no_show_sweep(now).await {
                Ok(marked) => {
                    last_no_show_day = Some(now.date());
                    if marked > 0 {
                        info!(marked, "no-show sweep finished");
                    }
                }
                Err(e) => error!("no-show sweep failed: {e}"),
            }
        }

        match tokio::time::timeout(SWEEP_TIMEOUT, engine.run_reminder_sweep(now)).await {
            Ok(Ok(report)) if report.total() > 0 => {
                info!(
                    hour = report.hour,
                    half_hour = report.half_hour,
                    starting = report.starting,
                    "reminder sweep finished"
                );
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => error!("reminder sweep failed: {e}"),
            Err(_) => warn!("reminder sweep timed out"),
        }
    }
}

/// Background task that compacts the tenant's WAL once enough appends have
/// accumulated since the last rewrite.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!(appends, "compacted WAL"),
            Err(e) => error!("WAL compaction failed: {e}"),
        }
    }
}
