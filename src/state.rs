//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor and
//! handed to the sync worker. It owns the session registry, the two stores
//! behind trait objects, the authenticator, config, and the shutdown signal.
//! Nothing here is global: `main` builds one instance for the process.
//!
//! LOCKING
//! =======
//! The registry uses two levels. The board map sits behind a coarse
//! `RwLock` that is held only to look up or create a `BoardSession`. Each
//! session guards its client list with its own `Mutex`, held for
//! register, deregister, and the whole enumerate+send span of a broadcast.
//! The coarse guard is always dropped before a session lock is taken, so
//! boards never wait on each other once their session exists.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::Message;
use tokio::sync::{Mutex, MutexGuard, RwLock, mpsc, watch};
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::services::archive::ArchiveStore;
use crate::services::auth::Authenticator;
use crate::services::buffer::BufferStore;

// =============================================================================
// CONNECTED CLIENT
// =============================================================================

/// One live websocket connection on a board.
#[derive(Debug, Clone)]
pub struct ConnectedClient {
    /// Distinguishes two connections of the same user.
    pub conn_id: Uuid,
    pub user_id: String,
    /// Outbound queue drained by the connection's writer task.
    pub tx: mpsc::Sender<Message>,
}

impl ConnectedClient {
    #[must_use]
    pub fn new(user_id: impl Into<String>, tx: mpsc::Sender<Message>) -> Self {
        Self { conn_id: Uuid::new_v4(), user_id: user_id.into(), tx }
    }
}

// =============================================================================
// BOARD SESSION
// =============================================================================

/// Clients connected to one board, in registration order.
#[derive(Default)]
pub struct BoardSession {
    clients: Mutex<Vec<ConnectedClient>>,
}

impl BoardSession {
    /// Acquire the session lock.
    pub async fn lock(&self) -> MutexGuard<'_, Vec<ConnectedClient>> {
        self.clients.lock().await
    }
}

// =============================================================================
// SESSION REGISTRY
// =============================================================================

/// Board id → live session. Sessions are created on first registration and
/// live for the rest of the process.
#[derive(Default)]
pub struct SessionRegistry {
    boards: RwLock<HashMap<String, Arc<BoardSession>>>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing session for a board, if any client ever registered on it.
    pub async fn session(&self, board_id: &str) -> Option<Arc<BoardSession>> {
        self.boards.read().await.get(board_id).cloned()
    }

    async fn session_or_create(&self, board_id: &str) -> Arc<BoardSession> {
        if let Some(session) = self.session(board_id).await {
            return session;
        }

        // EDGE: another task may have created it between the two locks;
        // `entry` keeps whichever session got there first.
        let mut boards = self.boards.write().await;
        let session = boards.entry(board_id.to_owned()).or_insert_with(|| {
            info!(%board_id, "registry: created board session");
            Arc::new(BoardSession::default())
        });
        Arc::clone(session)
    }

    /// Add a client to a board, creating the session if needed.
    pub async fn register(&self, board_id: &str, client: ConnectedClient) {
        let session = self.session_or_create(board_id).await;
        let mut clients = session.lock().await;
        info!(%board_id, user_id = %client.user_id, conn_id = %client.conn_id, "registry: client registered");
        clients.push(client);
    }

    /// Remove one connection from a board. Returns whether it was present.
    pub async fn deregister(&self, board_id: &str, user_id: &str, conn_id: Uuid) -> bool {
        let Some(session) = self.session(board_id).await else {
            return false;
        };
        let mut clients = session.lock().await;
        let before = clients.len();
        clients.retain(|c| !(c.conn_id == conn_id && c.user_id == user_id));
        let removed = clients.len() < before;
        if removed {
            info!(%board_id, %user_id, %conn_id, remaining = clients.len(), "registry: client deregistered");
        }
        removed
    }

    /// Snapshot of every client on the board except those of `exclude_user_id`.
    pub async fn enumerate_others(&self, board_id: &str, exclude_user_id: &str) -> Vec<ConnectedClient> {
        let Some(session) = self.session(board_id).await else {
            return Vec::new();
        };
        let clients = session.lock().await;
        others(&clients, exclude_user_id).cloned().collect()
    }

    pub async fn client_count(&self, board_id: &str) -> usize {
        match self.session(board_id).await {
            Some(session) => session.lock().await.len(),
            None => 0,
        }
    }
}

/// Clients in a locked session that do not belong to `exclude_user_id`.
pub fn others<'a>(
    clients: &'a [ConnectedClient],
    exclude_user_id: &'a str,
) -> impl Iterator<Item = &'a ConnectedClient> + 'a {
    clients.iter().filter(move |c| c.user_id != exclude_user_id)
}

// =============================================================================
// SHUTDOWN
// =============================================================================

/// Process-wide stop signal observed by the sync worker and every connection.
#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `trigger` has been called, immediately if it already was.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// APP STATE
// =============================================================================

/// Shared application state, injected into Axum handlers via State extractor.
/// Clone is required by Axum; all inner fields are Arc-wrapped or Clone.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub buffer: Arc<dyn BufferStore>,
    pub archive: Arc<dyn ArchiveStore>,
    pub auth: Arc<dyn Authenticator>,
    pub config: Arc<Config>,
    pub shutdown: Shutdown,
}

impl AppState {
    #[must_use]
    pub fn new(
        config: Config,
        buffer: Arc<dyn BufferStore>,
        archive: Arc<dyn ArchiveStore>,
        auth: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new()),
            buffer,
            archive,
            auth,
            config: Arc::new(config),
            shutdown: Shutdown::new(),
        }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================


#[cfg(test)]
#[path = "state_test.rs"]
mod tests;
