//! Periodic aggregation of every definition

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::aggregation::AggregationEngine;

/// Spawn the background aggregation task
///
/// Each tick runs `aggregate_all(false)`: the execution frequency of every
/// definition decides whether it actually aggregates. Returns `None` when
/// `interval_secs` is 0.
pub fn spawn(engine: AggregationEngine, interval_secs: u64) -> Option<JoinHandle<()>> {
    if interval_secs == 0 {
        info!("Aggregation scheduler disabled by configuration");
        return None;
    }

    info!("Starting aggregation scheduler (interval: {}s)", interval_secs);

    Some(tokio::spawn(async move {
        let mut timer = interval(Duration::from_secs(interval_secs));
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            timer.tick().await;

            match engine.aggregate_all(false).await {
                Ok(runs) => debug!("Scheduled aggregation pass: {} measures aggregated", runs.len()),
                Err(e) => error!("Scheduled aggregation pass failed: {}", e),
            }
        }
    }))
}
