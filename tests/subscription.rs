// Subscription fabric: slow-consumer eviction and per-subscriber order

use std::sync::Arc;

use tokio::sync::mpsc;

use vigil::auth::Role;
use vigil::hub::protocol::{HubMessage, MessageType, SubscriptionFilter};
use vigil::hub::{Hub, HubConfig, HubHandle, SubscriberHandle};
use vigil::shutdown::Shutdown;

fn hub(
    queue_capacity: usize,
) -> (
    HubHandle,
    Shutdown,
    tokio::task::JoinHandle<()>,
    mpsc::Sender<vigil::events::AlertEvent>,
) {
    let (hub, handle) = Hub::new(HubConfig {
        queue_capacity,
        ping_interval: std::time::Duration::from_secs(60),
        max_slow_misses: 3,
    });
    let shutdown = Shutdown::new();
    let (event_tx, event_rx) = mpsc::channel(1);
    let task = tokio::spawn(hub.run(event_rx, shutdown.subscribe()));
    (handle, shutdown, task, event_tx)
}

async fn settle() {
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
}

fn numbered_message(i: usize) -> HubMessage {
    HubMessage::system_status(serde_json::json!({ "seq": i }))
}

#[tokio::test]
async fn slow_subscriber_evicted_fast_subscriber_sees_all_in_order() {
    let (handle, shutdown, task, _event_tx) = hub(256);

    // subscriber A never drains its queue
    let slow = SubscriberHandle::new(uuid::Uuid::new_v4(), "slow".to_string(), Role::Viewer);
    let (slow_tx, _slow_rx) = mpsc::channel(256);
    handle.register(Arc::clone(&slow), slow_tx).await.unwrap();

    // subscriber B has room for everything
    let fast = SubscriberHandle::new(uuid::Uuid::new_v4(), "fast".to_string(), Role::Viewer);
    let (fast_tx, mut fast_rx) = mpsc::channel(2048);
    handle.register(Arc::clone(&fast), fast_tx).await.unwrap();
    settle().await;
    assert_eq!(handle.subscriber_count(), 2);

    let total = 1024usize;
    for i in 0..total {
        handle.broadcast(numbered_message(i)).await;
    }
    settle().await;

    // A filled its 256-slot queue, missed repeatedly, and was closed
    assert_eq!(handle.subscriber_count(), 1);
    assert!(*slow.cancelled().borrow());

    // B received all 1024 envelopes in broadcast order
    let mut sequence = Vec::with_capacity(total);
    while let Ok(envelope) = fast_rx.try_recv() {
        sequence.push(envelope.data["seq"].as_u64().unwrap());
    }
    assert_eq!(sequence.len(), total);
    for (expected, got) in sequence.iter().enumerate() {
        assert_eq!(*got, expected as u64);
    }

    shutdown.trigger();
    task.await.unwrap();
}

#[tokio::test]
async fn filter_matching_event_enqueued_exactly_once() {
    let (handle, shutdown, task, _event_tx) = hub(64);

    let sub = SubscriberHandle::new(uuid::Uuid::new_v4(), "filtered".to_string(), Role::Viewer);
    sub.set_filter(SubscriptionFilter {
        event_types: Some([MessageType::SystemStatus].into_iter().collect()),
        ..Default::default()
    });
    let (tx, mut rx) = mpsc::channel(64);
    handle.register(sub, tx).await.unwrap();
    settle().await;

    handle.broadcast(numbered_message(0)).await;
    handle
        .broadcast(HubMessage::metrics_update(serde_json::json!({})))
        .await;
    settle().await;

    let first = rx.try_recv().unwrap();
    assert_eq!(first.message_type, MessageType::SystemStatus);
    // the metrics-update did not match the filter
    assert!(rx.try_recv().is_err());

    shutdown.trigger();
    task.await.unwrap();
}
