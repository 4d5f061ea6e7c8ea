//! Transport bindings for Stream Hub subscribers (SSE and WebSocket)

use std::convert::Infallible;

use axum::extract::ws::{Message, WebSocket};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

use super::hub::StreamHub;
use crate::gateway::protocol::StreamEvent;

/// Subscribe to `key` and expose the events as an SSE response.
///
/// The subscription lives inside the response stream: when the client goes
/// away the body is dropped, which drops the subscription and unregisters
/// the listener. After a terminal event the hub drops the listener, the
/// channel closes and the stream ends.
pub fn sse_stream(
    hub: &StreamHub,
    key: impl Into<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let key = key.into();
    let (tx, rx) = mpsc::unbounded_channel::<StreamEvent>();
    let subscription = hub.register_listener(key.clone(), move |event| {
        let _ = tx.send(event.clone());
    });
    debug!("SSE subscriber attached to {}", key);

    let stream = UnboundedReceiverStream::new(rx).map(move |event| {
        let _attached = &subscription;
        Ok(to_sse_event(&event))
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn to_sse_event(event: &StreamEvent) -> Event {
    let sse = Event::default().event(event.event_type.as_str());
    match serde_json::to_string(event) {
        Ok(json) => sse.data(json),
        Err(err) => {
            warn!("Failed to serialize stream event: {}", err);
            sse.data("{}")
        }
    }
}

/// Pump events for `key` into a browser WebSocket until the client closes
/// or a terminal event has been sent.
pub async fn forward_to_websocket(socket: WebSocket, hub: StreamHub, key: String) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<StreamEvent>();
    let subscription = hub.register_listener(key.clone(), move |event| {
        let _ = tx.send(event.clone());
    });

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                let json = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(err) => {
                        warn!("Failed to serialize stream event: {}", err);
                        continue;
                    }
                };
                if ws_sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
                if event.event_type.is_terminal() {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            }
            incoming = ws_receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            }
        }
    }

    subscription.unsubscribe();
    debug!("WebSocket subscriber for {} closed", key);
}
