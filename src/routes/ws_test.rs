use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Duration, timeout};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::*;
use crate::services::archive::{ArchiveError, ArchiveStore, ArchivedEvent, NewArchivedEvent};
use crate::services::auth::Authenticator;
use crate::services::buffer::{BufferStore, BufferedRecord};
use crate::services::sync::{sync_all_boards, sync_board};
use crate::state::test_helpers::{MemoryArchive, MemoryBuffer, StaticAuthenticator, TestHarness, test_config, test_harness};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const DRAW: &str = r##"{"type":"draw","userId":"user-a","boardId":"b1","payload":{"points":[{"x":1,"y":2},{"x":3,"y":4}],"color":"#123456","thickness":2},"timestamp":1}"##;
const CURSOR: &str = r#"{"type":"cursor_move","userId":"user-c","boardId":"b1","payload":{"x":7,"y":8,"email":"c@example.com"},"timestamp":2}"#;

// =============================================================================
// HELPERS
// =============================================================================

async fn spawn_server(state: AppState) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind test listener");
    let addr = listener.local_addr().expect("listener addr");
    let app = crate::routes::app(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("test server failed");
    });
    addr
}

fn ws_url(addr: SocketAddr, board_id: &str, token: &str) -> String {
    format!("ws://{addr}/canvas/ws/{board_id}?token={token}")
}

async fn connect(addr: SocketAddr, board_id: &str, token: &str) -> Client {
    let (ws, _) = connect_async(ws_url(addr, board_id, token)).await.expect("ws connect");
    ws
}

/// Connect and wait until the registry lists `expected` clients on the board,
/// which also means this client's replay has been fully written.
async fn connect_live(state: &AppState, addr: SocketAddr, board_id: &str, token: &str, expected: usize) -> Client {
    let ws = connect(addr, board_id, token).await;
    wait_for_clients(state, board_id, expected).await;
    ws
}

async fn wait_for_clients(state: &AppState, board_id: &str, expected: usize) {
    timeout(Duration::from_secs(2), async {
        while state.registry.client_count(board_id).await != expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("board {board_id} never reached {expected} clients"));
}

async fn next_text(ws: &mut Client) -> String {
    loop {
        let msg = timeout(Duration::from_secs(1), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("ws read error");
        match msg {
            WsMessage::Text(text) => return text.as_str().to_owned(),
            WsMessage::Ping(_) | WsMessage::Pong(_) => {}
            other => panic!("expected text frame, got {other:?}"),
        }
    }
}

async fn assert_silent(ws: &mut Client) {
    assert!(timeout(Duration::from_millis(150), ws.next()).await.is_err(), "expected no frame");
}

fn archived(board_id: &str, data: &str, buffer_id: Option<i64>) -> NewArchivedEvent {
    NewArchivedEvent {
        board_id: board_id.into(),
        user_id: "user-a".into(),
        action: "draw".into(),
        data: data.into(),
        buffer_id,
    }
}

fn buffered(data: &str) -> BufferedRecord {
    BufferedRecord { user_id: "user-a".into(), action: "draw".into(), data: data.into() }
}

// =============================================================================
// AUTH
// =============================================================================

fn http_status(err: tokio_tungstenite::tungstenite::Error) -> u16 {
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => response.status().as_u16(),
        other => panic!("expected http rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn invalid_token_is_rejected_before_upgrade() {
    let TestHarness { state, .. } = test_harness();
    let addr = spawn_server(state.clone()).await;

    let err = connect_async(ws_url(addr, "b1", "forged")).await.unwrap_err();

    assert_eq!(http_status(err), 401);
    assert_eq!(state.registry.client_count("b1").await, 0);
}

#[tokio::test]
async fn missing_token_is_rejected() {
    let TestHarness { state, .. } = test_harness();
    let addr = spawn_server(state).await;

    let err = connect_async(format!("ws://{addr}/canvas/ws/b1")).await.unwrap_err();
    assert_eq!(http_status(err), 401);
}

struct SlowAuthenticator;

#[async_trait]
impl Authenticator for SlowAuthenticator {
    async fn validate(&self, _token: &str) -> Result<String, AuthError> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok("user-slow".into())
    }
}

#[tokio::test]
async fn slow_authentication_times_out() {
    let mut config = test_config();
    config.auth_timeout = Duration::from_millis(50);
    let state = AppState::new(
        config,
        Arc::new(MemoryBuffer::new()),
        Arc::new(MemoryArchive::new()),
        Arc::new(SlowAuthenticator),
    );
    let addr = spawn_server(state).await;

    let err = connect_async(ws_url(addr, "b1", "any")).await.unwrap_err();
    assert_eq!(http_status(err), 401);
}

#[tokio::test]
async fn unauthorized_body_names_the_problem() {
    let TestHarness { state, .. } = test_harness();
    let addr = spawn_server(state).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /canvas/ws/b1?token=forged HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    assert!(response.starts_with("HTTP/1.1 401"), "{response}");
    assert!(response.contains(r#"{"error":"Invalid token"}"#), "{response}");
}

// =============================================================================
// RELAY
// =============================================================================

#[tokio::test]
async fn draw_reaches_peer_is_buffered_then_archived_and_replayed() {
    let harness = test_harness();
    let state = harness.state.clone();
    let addr = spawn_server(state.clone()).await;

    let mut a = connect_live(&state, addr, "b1", "token-a", 1).await;
    let mut b = connect_live(&state, addr, "b1", "token-b", 2).await;

    a.send(WsMessage::text(DRAW)).await.unwrap();

    assert_eq!(next_text(&mut b).await, DRAW);
    assert_silent(&mut a).await;
    assert_eq!(harness.buffer.length("b1").await.unwrap(), 1);

    let report = sync_all_boards(&state).await;
    assert_eq!(report.archived, 1);
    assert_eq!(harness.buffer.length("b1").await.unwrap(), 0);

    let rows = harness.archive.query_by_board("b1").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].user_id, "user-a");
    assert_eq!(rows[0].data, DRAW);

    let mut c = connect_live(&state, addr, "b1", "token-c", 3).await;
    assert_eq!(next_text(&mut c).await, DRAW);
    assert_silent(&mut c).await;
}

#[tokio::test]
async fn cursor_move_reaches_everyone_else_and_is_not_stored() {
    let harness = test_harness();
    let state = harness.state.clone();
    let addr = spawn_server(state.clone()).await;

    let mut a = connect_live(&state, addr, "b1", "token-a", 1).await;
    let mut b = connect_live(&state, addr, "b1", "token-b", 2).await;
    let mut c = connect_live(&state, addr, "b1", "token-c", 3).await;

    c.send(WsMessage::text(CURSOR)).await.unwrap();

    assert_eq!(next_text(&mut a).await, CURSOR);
    assert_eq!(next_text(&mut b).await, CURSOR);
    assert_silent(&mut c).await;

    assert_eq!(harness.buffer.length("b1").await.unwrap(), 0);
    sync_all_boards(&state).await;
    assert!(harness.archive.rows().is_empty());
}

#[tokio::test]
async fn frames_stay_on_their_board() {
    let TestHarness { state, .. } = test_harness();
    let addr = spawn_server(state.clone()).await;

    let mut a = connect_live(&state, addr, "b1", "token-a", 1).await;
    let mut b = connect_live(&state, addr, "b2", "token-b", 1).await;

    a.send(WsMessage::text(DRAW)).await.unwrap();
    assert_silent(&mut b).await;
}

#[tokio::test]
async fn malformed_frame_is_relayed_verbatim() {
    let harness = test_harness();
    let state = harness.state.clone();
    let addr = spawn_server(state.clone()).await;

    let mut a = connect_live(&state, addr, "b1", "token-a", 1).await;
    let mut b = connect_live(&state, addr, "b1", "token-b", 2).await;

    a.send(WsMessage::text("not json at all")).await.unwrap();
    assert_eq!(next_text(&mut b).await, "not json at all");
    assert_eq!(harness.buffer.length("b1").await.unwrap(), 0);
}

// =============================================================================
// REPLAY
// =============================================================================

#[tokio::test]
async fn replay_sends_archive_rows_before_buffered_entries() {
    let harness = test_harness();
    let state = harness.state.clone();
    harness
        .archive
        .batch_insert(&[archived("b1", r#"{"seq":1}"#, None), archived("b1", r#"{"seq":2}"#, None)])
        .await
        .unwrap();
    harness.buffer.append("b1", &buffered(r#"{"seq":3}"#)).await.unwrap();
    harness.buffer.append("b1", &buffered(r#"{"seq":4}"#)).await.unwrap();
    harness.buffer.append("other", &buffered(r#"{"seq":99}"#)).await.unwrap();
    let addr = spawn_server(state.clone()).await;

    let mut a = connect_live(&state, addr, "b1", "token-a", 1).await;

    let mut replayed = Vec::new();
    for _ in 0..4 {
        replayed.push(next_text(&mut a).await);
    }
    assert_eq!(replayed, vec![r#"{"seq":1}"#, r#"{"seq":2}"#, r#"{"seq":3}"#, r#"{"seq":4}"#]);
    assert_silent(&mut a).await;
}

#[tokio::test]
async fn replay_of_empty_board_sends_nothing() {
    let TestHarness { state, .. } = test_harness();
    let addr = spawn_server(state.clone()).await;

    let mut a = connect_live(&state, addr, "fresh", "token-a", 1).await;
    assert_silent(&mut a).await;
}

#[tokio::test]
async fn replay_skips_buffer_entries_already_archived() {
    let harness = test_harness();
    let state = harness.state.clone();
    let id = harness.buffer.append("b1", &buffered(r#"{"seq":1}"#)).await.unwrap();
    harness.archive.batch_insert(&[archived("b1", r#"{"seq":1}"#, Some(id))]).await.unwrap();
    let addr = spawn_server(state.clone()).await;

    let mut a = connect_live(&state, addr, "b1", "token-a", 1).await;
    assert_eq!(next_text(&mut a).await, r#"{"seq":1}"#);
    assert_silent(&mut a).await;
}

/// Runs one full sync cycle right after the first board query has been
/// answered, as a worker tick landing between replay's two store reads would.
struct SyncAfterQuery {
    inner: Arc<MemoryArchive>,
    buffer: Arc<MemoryBuffer>,
    fired: AtomicBool,
}

#[async_trait]
impl ArchiveStore for SyncAfterQuery {
    async fn batch_insert(&self, events: &[NewArchivedEvent]) -> Result<u64, ArchiveError> {
        self.inner.batch_insert(events).await
    }

    async fn query_by_board(&self, board_id: &str) -> Result<Vec<ArchivedEvent>, ArchiveError> {
        let rows = self.inner.query_by_board(board_id).await?;
        if !self.fired.swap(true, Ordering::SeqCst) {
            let moved = sync_board(self.buffer.as_ref(), self.inner.as_ref(), board_id).await.unwrap();
            assert_eq!(moved, 1);
        }
        Ok(rows)
    }
}

#[tokio::test]
async fn sync_between_replay_reads_neither_drops_nor_repeats() {
    let buffer = Arc::new(MemoryBuffer::new());
    let archive = Arc::new(MemoryArchive::new());
    buffer.append("b1", &buffered(DRAW)).await.unwrap();

    let interleaved = SyncAfterQuery { inner: archive.clone(), buffer: buffer.clone(), fired: AtomicBool::new(false) };
    let auth = Arc::new(StaticAuthenticator::new(&[("token-a", "user-a")]));
    let state = AppState::new(test_config(), buffer.clone(), Arc::new(interleaved), auth);
    let addr = spawn_server(state.clone()).await;

    let mut a = connect_live(&state, addr, "b1", "token-a", 1).await;
    assert_eq!(next_text(&mut a).await, DRAW);
    assert_silent(&mut a).await;

    assert_eq!(buffer.length("b1").await.unwrap(), 0);
    assert_eq!(archive.rows().len(), 1);
}

#[tokio::test]
async fn archive_outage_still_replays_buffer() {
    let harness = test_harness();
    let state = harness.state.clone();
    harness.buffer.append("b1", &buffered(r#"{"seq":7}"#)).await.unwrap();
    harness.archive.set_unavailable(true);
    let addr = spawn_server(state.clone()).await;

    let mut a = connect_live(&state, addr, "b1", "token-a", 1).await;
    assert_eq!(next_text(&mut a).await, r#"{"seq":7}"#);
}

// =============================================================================
// LIFECYCLE
// =============================================================================

#[tokio::test]
async fn closing_the_socket_deregisters_the_client() {
    let TestHarness { state, .. } = test_harness();
    let addr = spawn_server(state.clone()).await;

    let mut a = connect_live(&state, addr, "b1", "token-a", 1).await;
    let _b = connect_live(&state, addr, "b1", "token-b", 2).await;

    a.close(None).await.unwrap();
    wait_for_clients(&state, "b1", 1).await;
    assert_eq!(state.registry.enumerate_others("b1", "nobody").await[0].user_id, "user-b");
}

#[tokio::test]
async fn shutdown_closes_open_connections() {
    let TestHarness { state, .. } = test_harness();
    let addr = spawn_server(state.clone()).await;

    let mut a = connect_live(&state, addr, "b1", "token-a", 1).await;
    state.shutdown.trigger();

    let msg = timeout(Duration::from_secs(1), a.next())
        .await
        .expect("close frame expected")
        .expect("stream ended")
        .expect("ws read error");
    match msg {
        WsMessage::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Away),
        other => panic!("expected close frame, got {other:?}"),
    }
    wait_for_clients(&state, "b1", 0).await;
}

// =============================================================================
// HEALTH
// =============================================================================

async fn http_get(addr: SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

#[tokio::test]
async fn ping_answers_pong() {
    let TestHarness { state, .. } = test_harness();
    let addr = spawn_server(state).await;

    let response = http_get(addr, "/canvas/ping").await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.contains(r#"{"message":"pong"}"#), "{response}");
}

#[tokio::test]
async fn healthz_is_ok() {
    let TestHarness { state, .. } = test_harness();
    let addr = spawn_server(state).await;
    assert!(http_get(addr, "/healthz").await.starts_with("HTTP/1.1 200"));
}
