// vigil: Periodic samplers

use std::sync::Arc;

use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::hub::protocol::HubMessage;
use crate::hub::HubHandle;
use crate::metrics::custom::CustomMetrics;
use crate::metrics::registry::{MetricRegistry, MetricShape};

/// Spawn the process-stats sampler
///
/// Records uptime and memory gauges and pushes a system-status envelope to
/// subscribers on every tick.
pub fn spawn_process_sampler(
    registry: Arc<MetricRegistry>,
    hub: HubHandle,
    interval: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let uptime = registry.register(
            MetricShape::gauge("process_uptime_seconds", "Seconds since service start")
                .with_subsystem("vigil"),
        );
        let memory = registry.register(
            MetricShape::gauge("process_resident_memory_bytes", "Resident set size")
                .with_subsystem("vigil"),
        );
        let (uptime, memory) = match (uptime, memory) {
            (Ok(u), Ok(m)) => (u, m),
            _ => {
                warn!("Process metrics already registered with a different shape");
                return;
            }
        };

        let started = std::time::Instant::now();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => if *shutdown.borrow() { break },
                _ = stop.changed() => if *stop.borrow() { break },
            }

            let uptime_secs = started.elapsed().as_secs_f64();
            let _ = registry.observe(&uptime, &[], uptime_secs);
            let rss = resident_memory_bytes();
            if let Some(rss) = rss {
                let _ = registry.observe(&memory, &[], rss);
            }

            hub.broadcast(HubMessage::system_status(json!({
                "uptime_secs": uptime_secs as u64,
                "memory_rss_bytes": rss,
                "subscribers": hub.subscriber_count(),
            })))
            .await;
            debug!(uptime_secs, "Process stats sampled");
        }
    })
}

/// Spawn the custom-metric sampler, pushing metrics-update envelopes
pub fn spawn_custom_sampler(
    custom: Arc<CustomMetrics>,
    hub: HubHandle,
    interval: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => if *shutdown.borrow() { break },
                _ = stop.changed() => if *stop.borrow() { break },
            }

            let rows = custom.summary();
            if rows.is_empty() {
                continue;
            }
            hub.broadcast(HubMessage::metrics_update(json!({ "metrics": rows })))
                .await;
        }
    })
}

/// Resident set size from /proc on Linux; None elsewhere
fn resident_memory_bytes() -> Option<f64> {
    #[cfg(target_os = "linux")]
    {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let pages: f64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        Some(pages * 4096.0)
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}
