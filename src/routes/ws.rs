//! WebSocket handler — per-board canvas relay.
//!
//! DESIGN
//! ======
//! Authentication happens before the upgrade: a missing or rejected token
//! gets a JSON `401` and no socket. Once upgraded, the connection replays
//! the board's history, registers with the session registry, and enters a
//! `select!` loop:
//! - Incoming client frames → broadcast engine (inline, in this task)
//! - Frames queued by peers' broadcasts → forward to this client
//! - Shutdown signal → close frame, then exit
//!
//! LIFECYCLE
//! =========
//! 1. Validate `?token=` (bounded by `AUTH_TIMEOUT_MS`) → upgrade
//! 2. Snapshot the buffer, then replay archive rows and the unarchived
//!    part of the snapshot, as text frames
//! 3. Register on the board with a bounded outbound queue
//! 4. Relay until close, transport error, or shutdown
//! 5. Deregister

use std::collections::{HashMap, HashSet};

use axum::Json;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::services::auth::AuthError;
use crate::services::broadcast;
use crate::state::{AppState, ConnectedClient};

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(
    State(state): State<AppState>,
    Path(board_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let token = params.get("token").map(String::as_str).unwrap_or_default();

    let user_id = match authenticate(&state, token).await {
        Ok(user_id) => user_id,
        Err(e) => {
            info!(%board_id, error = %e, "ws: upgrade rejected");
            return unauthorized(&e);
        }
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    ws.on_upgrade(move |socket| run_ws(socket, state, board_id, user_id))
}

async fn authenticate(state: &AppState, token: &str) -> Result<String, AuthError> {
    if token.is_empty() {
        return Err(AuthError::MissingToken);
    }
    tokio::time::timeout(state.config.auth_timeout, state.auth.validate(token))
        .await
        .unwrap_or(Err(AuthError::Timeout))
}

fn unauthorized(err: &AuthError) -> Response {
    let message = match err {
        AuthError::MissingToken => "Token required",
        _ => "Invalid token",
    };
    (StatusCode::UNAUTHORIZED, Json(json!({ "error": message }))).into_response()
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState, board_id: String, user_id: String) {
    match replay_history(&mut socket, &state, &board_id).await {
        Ok(replayed) => debug!(%board_id, %user_id, replayed, "ws: history replayed"),
        Err(e) => {
            info!(%board_id, %user_id, error = %e, "ws: client left during replay");
            return;
        }
    }

    // Per-connection queue for frames broadcast by board peers.
    let (client_tx, mut client_rx) = mpsc::channel::<Message>(state.config.client_queue_capacity);
    let client = ConnectedClient::new(user_id.clone(), client_tx);
    let conn_id = client.conn_id;
    state.registry.register(&board_id, client).await;

    let clients = state.registry.client_count(&board_id).await;
    info!(%board_id, %user_id, %conn_id, clients, "ws: client connected");

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(msg) = msg else { break };
                let msg = match msg {
                    Ok(msg) => msg,
                    Err(e) => {
                        debug!(%board_id, %conn_id, error = %e, "ws: read failed");
                        break;
                    }
                };
                match msg {
                    Message::Text(_) | Message::Binary(_) => {
                        let delivery = broadcast::on_message(&state, &board_id, &user_id, msg).await;
                        debug!(%board_id, %conn_id, delivered = delivery.delivered, failed = delivery.failed, buffered = delivery.buffered, "ws: relayed frame");
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Some(msg) = client_rx.recv() => {
                if let Err(e) = socket.send(msg).await {
                    debug!(%board_id, %conn_id, error = %e, "ws: write failed");
                    break;
                }
            }
            () = state.shutdown.wait() => {
                let close = CloseFrame { code: close_code::AWAY, reason: "server shutting down".into() };
                let _ = socket.send(Message::Close(Some(close))).await;
                break;
            }
        }
    }

    state.registry.deregister(&board_id, &user_id, conn_id).await;
    info!(%board_id, %user_id, %conn_id, "ws: client disconnected");
}

// =============================================================================
// REPLAY
// =============================================================================

/// Send archived rows, then buffered entries, oldest first. A store that
/// cannot be read is skipped; a socket write failure is returned.
///
/// The buffer is snapshotted before the archive is queried. A sync cycle that
/// runs between the two reads moves entries from one store to the other, and
/// in this order they land in the archive result instead of falling between
/// both reads. Snapshot entries already archived are sent once, from the
/// archive.
async fn replay_history(socket: &mut WebSocket, state: &AppState, board_id: &str) -> Result<usize, axum::Error> {
    let buffered = match state.buffer.range_read(board_id).await {
        Ok(entries) => entries,
        Err(e) => {
            warn!(%board_id, error = %e, "ws: buffer replay skipped");
            Vec::new()
        }
    };

    let mut sent = 0;
    let mut archived_ids = HashSet::new();

    match state.archive.query_by_board(board_id).await {
        Ok(rows) => {
            for row in rows {
                archived_ids.extend(row.buffer_id);
                socket.send(Message::text(row.data)).await?;
                sent += 1;
            }
        }
        Err(e) => warn!(%board_id, error = %e, "ws: archive replay skipped"),
    }

    for entry in buffered.into_iter().filter(|e| !archived_ids.contains(&e.id)) {
        socket.send(Message::text(entry.record.data)).await?;
        sent += 1;
    }

    Ok(sent)
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
