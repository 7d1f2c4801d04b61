// handler/realtime.rs
use std::sync::Arc;

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
    Extension, Router,
};
use tokio::sync::mpsc;

use crate::{middleware::JWTAuthMiddeware, models::usermodel::Principal, AppState};

pub fn realtime_handler() -> Router {
    Router::new().route("/", get(notifications_socket))
}

pub async fn notifications_socket(
    ws: WebSocketUpgrade,
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddeware>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, app_state, auth.principal))
}

/// Forwards queued notifications to the socket until either side closes.
async fn handle_socket(mut socket: WebSocket, app_state: Arc<AppState>, principal: Principal) {
    let (sender, mut receiver) = mpsc::unbounded_channel::<String>();
    let channel_id = app_state.registry.register(principal.id, sender);
    tracing::info!("websocket opened for user {}", principal.id);

    loop {
        tokio::select! {
            outgoing = receiver.recv() => match outgoing {
                Some(payload) => {
                    if socket.send(Message::Text(payload)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Ping(data))) => {
                    if socket.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    app_state.registry.unregister(channel_id);
    tracing::info!("websocket closed for user {}", principal.id);
}
