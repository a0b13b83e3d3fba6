//! Broadcast engine — relay one inbound frame to the rest of its board.
//!
//! DESIGN
//! ======
//! Runs inline in the sender's connection task. Three steps per frame:
//! classify, buffer if archival, fan out. Classification and buffering are
//! best effort: a frame that fails to parse, or whose append fails, is
//! still relayed byte-for-byte to every other client on the board.
//!
//! Fan-out holds the board's session lock for the whole enumerate+send span,
//! so two broadcasts on one board never interleave. Sends are `try_send`
//! into bounded per-client queues and never wait on a slow reader.

use axum::extract::ws::Message;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::event;
use crate::services::buffer::BufferedRecord;
use crate::state::{AppState, SessionRegistry, others};

/// What happened to one inbound frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Peers whose queue accepted the frame.
    pub delivered: usize,
    /// Peers skipped because their queue was full or closed.
    pub failed: usize,
    /// Whether the frame was appended to the durable buffer.
    pub buffered: bool,
}

/// Handle one frame read from `sender_id`'s connection on `board_id`.
pub async fn on_message(state: &AppState, board_id: &str, sender_id: &str, raw: Message) -> Delivery {
    let bytes: &[u8] = match &raw {
        Message::Text(text) => text.as_str().as_bytes(),
        Message::Binary(bytes) => &bytes[..],
        _ => return Delivery::default(),
    };

    let buffered = buffer_if_archival(state, board_id, sender_id, bytes).await;

    let mut delivery = fan_out(&state.registry, board_id, sender_id, &raw).await;
    delivery.buffered = buffered;
    delivery
}

async fn buffer_if_archival(state: &AppState, board_id: &str, sender_id: &str, bytes: &[u8]) -> bool {
    let event = match event::parse(bytes) {
        Ok(event) => event,
        Err(e) => {
            debug!(%board_id, user_id = %sender_id, error = %e, "broadcast: unclassified frame relayed as-is");
            return false;
        }
    };
    if !event.is_archival() {
        return false;
    }

    // A frame that parsed as JSON is valid UTF-8.
    let Ok(data) = std::str::from_utf8(bytes) else {
        return false;
    };
    let record = BufferedRecord { user_id: sender_id.to_owned(), action: event.action().to_owned(), data: data.to_owned() };

    match state.buffer.append(board_id, &record).await {
        Ok(id) => {
            debug!(%board_id, user_id = %sender_id, buffer_id = id, "broadcast: buffered");
            true
        }
        Err(e) => {
            warn!(%board_id, user_id = %sender_id, error = %e, "broadcast: buffer append failed");
            false
        }
    }
}

/// Send `raw` to every client on the board not owned by `sender_id`.
pub async fn fan_out(registry: &SessionRegistry, board_id: &str, sender_id: &str, raw: &Message) -> Delivery {
    let Some(session) = registry.session(board_id).await else {
        return Delivery::default();
    };

    let clients = session.lock().await;
    let mut delivery = Delivery::default();
    for client in others(&clients, sender_id) {
        match client.tx.try_send(raw.clone()) {
            Ok(()) => delivery.delivered += 1,
            Err(TrySendError::Full(_)) => {
                delivery.failed += 1;
                warn!(%board_id, user_id = %client.user_id, conn_id = %client.conn_id, "broadcast: client queue full, frame dropped");
            }
            Err(TrySendError::Closed(_)) => {
                delivery.failed += 1;
                debug!(%board_id, user_id = %client.user_id, conn_id = %client.conn_id, "broadcast: client queue closed");
            }
        }
    }
    delivery
}

#[cfg(test)]
#[path = "broadcast_test.rs"]
mod tests;
