//! Background refresh sweep.

use grantkeeper_core::TokenManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::MAX_REFRESH_INTERVAL_SECS;

/// Sweep every account each `period` until shutdown.
///
/// The first sweep runs one full period after start. `period` is clamped to
/// between one second and [`MAX_REFRESH_INTERVAL_SECS`].
pub async fn run(manager: Arc<TokenManager>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let period = period.clamp(
        Duration::from_secs(1),
        Duration::from_secs(MAX_REFRESH_INTERVAL_SECS),
    );
    let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    while !*shutdown.borrow() {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = timer.tick() => {}
        }

        debug!("Running refresh sweep");
        let report = manager.sweep().await;
        if report.refreshed + report.failed + report.expired > 0 {
            info!(
                refreshed = report.refreshed,
                failed = report.failed,
                expired = report.expired,
                "Refresh sweep finished"
            );
        }
    }
    debug!("Refresh sweep stopped");
}
