// =============================================================================
// WebSocket Handler — Push-based price updates
// =============================================================================
//
// Clients connect to `/` (or `/ws`) and receive:
//   1. An immediate `initial_prices` message with the full snapshot.
//   2. A `price_update` message with the full snapshot after every update.
//
// Inbound text frames are logged and otherwise ignored. A failed send ends
// the connection, which removes the subscriber.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use crate::app_state::AppState;

/// Axum handler for the WebSocket upgrade request.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

/// Manages a single WebSocket connection lifecycle.
///
/// Runs two branches via `tokio::select!`:
///   1. **Push** — forward queued snapshots from the broadcaster.
///   2. **Recv** — process incoming client frames (Ping, Close, text).
async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>) {
    let mut subscription = state.broadcaster.subscribe();
    let id = subscription.id;
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            // ── Push: initial snapshot first, then updates ─────────────
            queued = subscription.rx.recv() => {
                let Some(payload) = queued else {
                    // Removed from the registry by the broadcaster.
                    break;
                };
                if let Err(e) = sender.send(Message::Text(payload.to_string())).await {
                    debug!(subscriber = %id, error = %e, "WebSocket send failed — disconnecting");
                    break;
                }
            }

            // ── Recv: process incoming frames ───────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<serde_json::Value>(&text) {
                            Ok(value) => debug!(subscriber = %id, msg = %value, "client message received"),
                            Err(e) => debug!(subscriber = %id, error = %e, "unparsable client message"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            debug!(subscriber = %id, error = %e, "Failed to send Pong — disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Binary(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        info!(subscriber = %id, "WebSocket Close frame received");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(subscriber = %id, error = %e, "WebSocket receive error — disconnecting");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    state.broadcaster.unsubscribe(id);
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::RwLock;
    use tokio_tungstenite::{connect_async, tungstenite::Message as ClientMessage};

    use crate::api::rest::router;
    use crate::runtime_config::RuntimeConfig;
    use crate::types::{ClosedCandle, FeedState};

    use super::*;

    async fn next_json<S>(ws: &mut S) -> serde_json::Value
    where
        S: futures_util::Stream<Item = Result<ClientMessage, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("frame before timeout")
                .expect("stream open")
                .expect("valid frame");
            if let ClientMessage::Text(text) = frame {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn socket_gets_snapshot_then_updates_and_unsubscribes_on_close() {
        let state = Arc::new(AppState::new(
            RuntimeConfig::default(),
            Arc::new(RwLock::new(FeedState::Connected)),
        ));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(state.clone());
        tokio::spawn(async move { axum::serve(listener, app).await });

        let (mut ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();

        let initial = next_json(&mut ws).await;
        assert_eq!(initial["type"], "initial_prices");
        assert!(initial["data"].as_object().unwrap().is_empty());
        assert_eq!(state.broadcaster.subscriber_count(), 1);

        state.apply_candle(&ClosedCandle {
            symbol: "BTC".into(),
            open: 100.0,
            high: 105.0,
            low: 95.0,
            close: 102.0,
            volume: 10.0,
            event_time: 1,
        });

        let update = next_json(&mut ws).await;
        assert_eq!(update["type"], "price_update");
        assert_eq!(update["data"]["BTC"]["price"], 102.0);

        ws.close(None).await.unwrap();
        for _ in 0..100 {
            if state.broadcaster.subscriber_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(state.broadcaster.subscriber_count(), 0);
    }
}
