use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use tracing::{debug, warn};

use crate::state::SharedState;

pub async fn ws_handler(ws: WebSocketUpgrade, State(st): State<SharedState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, st))
}

/// Forward progress events until either side goes away.
async fn handle_socket(mut socket: WebSocket, st: SharedState) {
    let mut sub = st.broadcaster.subscribe().await;
    debug!(subscriber=%sub.id, "ws: connected");

    loop {
        tokio::select! {
            ev = sub.receiver.recv() => {
                // None: dropped by the broadcaster for falling behind
                let Some(ev) = ev else { break };
                let json = match serde_json::to_string(&ev) {
                    Ok(j) => j,
                    Err(e) => {
                        warn!("ws: event encode failed: {e}");
                        continue;
                    }
                };
                if socket.send(WsMessage::Text(json)).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => match msg {
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    st.broadcaster.unsubscribe(sub.id).await;
    debug!(subscriber=%sub.id, "ws: disconnected");
}
