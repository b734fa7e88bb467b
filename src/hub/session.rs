// vigil: Subscriber session tasks

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::hub::protocol::{parse_client_frame, ClientRequest, Envelope, MessageType};
use crate::hub::{HubHandle, SubscriberHandle};

const DRAIN_DEADLINE: std::time::Duration = std::time::Duration::from_secs(2);

/// Drive one duplex session to completion
///
/// The session is three cooperating tasks: this registration task, a reader
/// ingesting client frames, and a writer draining the outbound queue.
/// Eviction by the hub cancels both; a socket error on either side tears
/// down only this session.
pub async fn run_session(
    socket: WebSocket,
    handle: Arc<SubscriberHandle>,
    hub: HubHandle,
    initial: Envelope,
) {
    let (queue_tx, queue_rx) = mpsc::channel::<Envelope>(hub.queue_capacity());

    // the initial-state envelope is the first thing the client sees
    if queue_tx.send(initial).await.is_err() {
        return;
    }
    if hub
        .register(Arc::clone(&handle), queue_tx.clone())
        .await
        .is_err()
    {
        return;
    }

    let (ws_tx, ws_rx) = socket.split();
    let writer = tokio::spawn(writer_task(ws_tx, queue_rx, handle.cancelled()));
    let reader = tokio::spawn(reader_task(
        ws_rx,
        Arc::clone(&handle),
        queue_tx,
        handle.cancelled(),
    ));

    // the reader finishing (close, error, unsubscribe, cancel) ends the session
    let _ = reader.await;
    hub.unregister(handle.session_id).await;
    handle.close();
    let _ = writer.await;
    debug!(session = %handle.session_id, "Session finished");
}

async fn writer_task(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut queue_rx: mpsc::Receiver<Envelope>,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            maybe = queue_rx.recv() => match maybe {
                Some(envelope) => {
                    if write_envelope(&mut ws_tx, &envelope).await.is_err() {
                        return;
                    }
                }
                None => break,
            },
            _ = cancel.changed() => {
                if *cancel.borrow() {
                    break;
                }
            }
        }
    }

    // drain whatever is already queued, bounded by a deadline
    let deadline = tokio::time::Instant::now() + DRAIN_DEADLINE;
    while let Ok(envelope) = queue_rx.try_recv() {
        if tokio::time::Instant::now() >= deadline {
            break;
        }
        if write_envelope(&mut ws_tx, &envelope).await.is_err() {
            return;
        }
    }
    let _ = ws_tx.send(Message::Close(None)).await;
}

async fn write_envelope(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    envelope: &Envelope,
) -> Result<(), ()> {
    let text = match serde_json::to_string(envelope) {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "Failed to serialize envelope");
            return Ok(());
        }
    };
    ws_tx.send(Message::Text(text)).await.map_err(|_| ())
}

async fn reader_task(
    mut ws_rx: SplitStream<WebSocket>,
    handle: Arc<SubscriberHandle>,
    queue_tx: mpsc::Sender<Envelope>,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            maybe = ws_rx.next() => {
                let message = match maybe {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        debug!(session = %handle.session_id, error = %e, "Socket error");
                        return;
                    }
                    None => return,
                };
                match message {
                    Message::Text(text) => {
                        if !handle_frame(&text, &handle, &queue_tx).await {
                            return;
                        }
                    }
                    Message::Ping(_) | Message::Pong(_) => handle.note_pong(),
                    Message::Close(_) => return,
                    Message::Binary(_) => {}
                }
            }
            _ = cancel.changed() => {
                if *cancel.borrow() {
                    return;
                }
            }
        }
    }
}

/// Apply one client frame; false ends the session
async fn handle_frame(
    text: &str,
    handle: &Arc<SubscriberHandle>,
    queue_tx: &mpsc::Sender<Envelope>,
) -> bool {
    match parse_client_frame(text) {
        Ok(ClientRequest::Subscribe(filter)) => {
            debug!(session = %handle.session_id, "Filter updated");
            handle.set_filter(filter);
            handle.note_pong();
            true
        }
        Ok(ClientRequest::Unsubscribe) => false,
        Ok(ClientRequest::Ping { id }) => {
            handle.note_pong();
            let pong = Envelope::new(MessageType::Pong, json!({ "reply_to": id }));
            // the pong shares the outbound queue; a full queue drops it
            let _ = queue_tx.try_send(pong);
            true
        }
        Err(reason) => {
            debug!(session = %handle.session_id, reason, "Ignoring malformed frame");
            true
        }
    }
}
