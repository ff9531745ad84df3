use crate::AppState;
use crate::api::error::AppError;
use crate::services::pipeline::Orchestrator;
use axum::{
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use std::sync::Arc;

/// Progress channel for one upload token.
///
/// Frames are JSON `ChannelMessage`s. The server closes the socket after the
/// final `complete` or `error` frame. Connecting a second socket for the same
/// token detaches the first one. Finished sessions are refused with 409.
#[utoipa::path(
    get,
    path = "/ws/upload/{token}",
    params(
        ("token" = String, Path, description = "Upload session token")
    ),
    responses(
        (status = 101, description = "Switching to WebSocket"),
        (status = 404, description = "Unknown or expired session"),
        (status = 409, description = "Upload already finished")
    ),
    tag = "upload"
)]
pub async fn upload_progress(
    State(state): State<AppState>,
    Path(token): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    state.pipeline.ensure_subscribable(&token)?;

    let pipeline = state.pipeline.clone();
    Ok(ws.on_upgrade(move |socket| forward_progress(socket, pipeline, token)))
}

async fn forward_progress(mut socket: WebSocket, pipeline: Arc<Orchestrator>, token: String) {
    // The session may have finished during the handshake
    let (subscriber_id, mut rx) = match pipeline.subscribe(&token) {
        Ok(subscription) => subscription,
        Err(e) => {
            tracing::debug!("Progress subscriber for {} refused: {}", token, e);
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };
    tracing::debug!("🔌 Progress subscriber attached for session {}", token);

    loop {
        tokio::select! {
            msg = rx.recv() => {
                let Some(msg) = msg else {
                    // Replaced by a newer subscriber
                    break;
                };
                let is_final = msg.is_final();
                let text = match serde_json::to_string(&msg) {
                    Ok(t) => t,
                    Err(e) => {
                        tracing::error!("Failed to encode progress frame: {}", e);
                        continue;
                    }
                };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
                if is_final {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    pipeline.progress().unsubscribe(&token, subscriber_id);
    tracing::debug!("🔌 Progress subscriber detached for session {}", token);
}
