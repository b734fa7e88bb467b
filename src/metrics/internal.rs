// vigil: Service self-metrics

// ACCEPTABLE: registration of statically-defined metrics cannot fail at runtime
#![allow(clippy::expect_used)]

use std::sync::OnceLock;

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Counters the service keeps about itself
///
/// These live in a prometheus registry separate from the user-facing metric
/// store; their text output is appended to the exposition endpoint.
pub struct InternalMetrics {
    registry: Registry,
    pub events_dropped: IntCounterVec,
    pub deliveries: IntCounterVec,
    pub delivery_retries: IntCounter,
    pub broadcasts: IntCounter,
    pub subscriber_misses: IntCounter,
    pub subscribers_evicted: IntCounter,
    pub subscribers_connected: IntGauge,
}

impl InternalMetrics {
    fn new() -> Self {
        let registry = Registry::new();

        let events_dropped = IntCounterVec::new(
            Opts::new(
                "vigil_events_dropped_total",
                "Alert events dropped on a full consumer queue",
            ),
            &["consumer"],
        )
        .expect("valid metric opts");
        let deliveries = IntCounterVec::new(
            Opts::new("vigil_deliveries_total", "Notification delivery outcomes"),
            &["sink", "outcome"],
        )
        .expect("valid metric opts");
        let delivery_retries = IntCounter::new(
            "vigil_delivery_retries_total",
            "Notification delivery retry attempts",
        )
        .expect("valid metric opts");
        let broadcasts = IntCounter::new(
            "vigil_hub_broadcasts_total",
            "Events broadcast to subscribers",
        )
        .expect("valid metric opts");
        let subscriber_misses = IntCounter::new(
            "vigil_hub_queue_misses_total",
            "Envelopes not enqueued because a subscriber queue was full",
        )
        .expect("valid metric opts");
        let subscribers_evicted = IntCounter::new(
            "vigil_hub_subscribers_evicted_total",
            "Subscribers closed as slow or unresponsive",
        )
        .expect("valid metric opts");
        let subscribers_connected = IntGauge::new(
            "vigil_hub_subscribers",
            "Currently connected subscribers",
        )
        .expect("valid metric opts");

        registry
            .register(Box::new(events_dropped.clone()))
            .expect("register");
        registry
            .register(Box::new(deliveries.clone()))
            .expect("register");
        registry
            .register(Box::new(delivery_retries.clone()))
            .expect("register");
        registry
            .register(Box::new(broadcasts.clone()))
            .expect("register");
        registry
            .register(Box::new(subscriber_misses.clone()))
            .expect("register");
        registry
            .register(Box::new(subscribers_evicted.clone()))
            .expect("register");
        registry
            .register(Box::new(subscribers_connected.clone()))
            .expect("register");

        Self {
            registry,
            events_dropped,
            deliveries,
            delivery_retries,
            broadcasts,
            subscriber_misses,
            subscribers_evicted,
            subscribers_connected,
        }
    }

    /// Shared instance
    pub fn global() -> &'static InternalMetrics {
        static INSTANCE: OnceLock<InternalMetrics> = OnceLock::new();
        INSTANCE.get_or_init(InternalMetrics::new)
    }

    /// Text exposition of the internal registry
    pub fn encode(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&self.registry.gather(), &mut buf).is_err() {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_metrics_encode() {
        let metrics = InternalMetrics::global();
        metrics.broadcasts.inc();
        metrics
            .deliveries
            .with_label_values(&["chat-webhook", "ok"])
            .inc();
        let text = metrics.encode();
        assert!(text.contains("vigil_hub_broadcasts_total"));
        assert!(text.contains("vigil_deliveries_total"));
    }
}
