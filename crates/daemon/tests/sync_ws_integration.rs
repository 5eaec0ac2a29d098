use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use slotsync_common::mutation::{apply_versioned, StateMutation};
use slotsync_common::protocol::ws::{ClientMessage, ServerMessage};
use slotsync_common::types::{ChatMessage, WorkspaceState};
use slotsync_daemon::config::DaemonConfig;
use slotsync_daemon::runtime::{start, DaemonHandle};
use slotsync_daemon::startup::DaemonPaths;
use tempfile::TempDir;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};

type ClientSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn start_daemon(tmp: &TempDir) -> DaemonHandle {
    let mut config = DaemonConfig::default();
    config.server.bind = "127.0.0.1:0".into();
    let paths = DaemonPaths::resolve_in(tmp.path(), &config).expect("paths should resolve");
    start(config, paths).await.expect("daemon should start")
}

async fn connect(addr: SocketAddr, workspace_id: &str, client_id: Option<&str>) -> ClientSocket {
    let url = match client_id {
        Some(id) => format!("ws://{addr}/sync/{workspace_id}?clientId={id}"),
        None => format!("ws://{addr}/sync/{workspace_id}"),
    };
    let (socket, _) = connect_async(url).await.expect("client should connect");
    socket
}

async fn send(socket: &mut ClientSocket, message: &ClientMessage) {
    let encoded = serde_json::to_string(message).expect("client message should encode");
    socket.send(WsMessage::Text(encoded.into())).await.expect("client should send frame");
}

async fn recv(socket: &mut ClientSocket) -> ServerMessage {
    loop {
        let next = timeout(Duration::from_secs(2), socket.next())
            .await
            .expect("timed out waiting for websocket frame");
        let message =
            next.expect("websocket should remain open").expect("websocket read should succeed");

        match message {
            WsMessage::Text(payload) => {
                return serde_json::from_str(payload.as_str())
                    .expect("server message should decode");
            }
            WsMessage::Ping(payload) => {
                socket.send(WsMessage::Pong(payload)).await.expect("websocket should reply to ping");
            }
            WsMessage::Close(_) => panic!("websocket closed unexpectedly"),
            WsMessage::Binary(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => {}
        }
    }
}

/// Apply a catch-up or broadcast message onto a client's local copy.
fn apply(local: &mut Option<WorkspaceState>, local_version: &mut u64, message: ServerMessage) {
    match message {
        ServerMessage::Snapshot { version, state } => {
            *local = Some(state);
            *local_version = version;
        }
        ServerMessage::Delta { version, since_version, deltas } => {
            assert_eq!(since_version, Some(*local_version), "delta must continue local version");
            for (offset, mutation) in deltas.iter().enumerate() {
                let at = *local_version + offset as u64 + 1;
                apply_versioned(local, mutation, at).expect("delta should replay");
            }
            *local_version = version;
        }
        ServerMessage::Error { code, message } => panic!("unexpected error {code}: {message}"),
    }
}

fn create(workspace_id: &str) -> StateMutation {
    StateMutation::WorkspaceCreate { workspace_id: workspace_id.into(), path: "/p".into() }
}

fn watch(index: u64) -> StateMutation {
    StateMutation::WatchedDirectoryAdd { workspace_id: "ws-1".into(), path: format!("/p/{index}") }
}

#[tokio::test]
async fn fresh_client_gets_snapshot_and_returning_client_gets_deltas() {
    let tmp = TempDir::new().expect("temp dir should be created");
    let daemon = start_daemon(&tmp).await;
    let store = daemon.store();

    assert_eq!(store.mutate("ws-1", create("ws-1")).expect("create"), 1);

    // A second client syncs at version 1 and then goes away.
    let mut returning = connect(daemon.local_addr(), "ws-1", Some("returning")).await;
    send(&mut returning, &ClientMessage::Sync { since_version: None }).await;
    let (mut returning_state, mut returning_version) = (None, 0);
    apply(&mut returning_state, &mut returning_version, recv(&mut returning).await);
    assert_eq!(returning_version, 1);
    send(&mut returning, &ClientMessage::Ack { version: 1 }).await;
    let _ = returning.close(None).await;

    let message = ChatMessage {
        id: "m1".into(),
        role: "user".into(),
        content: json!("hello"),
        timestamp: Some(1_700_000_000_000),
    };
    assert_eq!(
        store
            .mutate(
                "ws-1",
                StateMutation::SlotCreate { workspace_id: "ws-1".into(), slot_id: "s1".into() },
            )
            .expect("slot create"),
        2
    );
    assert_eq!(
        store
            .mutate(
                "ws-1",
                StateMutation::MessagesAppend {
                    workspace_id: "ws-1".into(),
                    slot_id: "s1".into(),
                    messages: vec![message.clone()],
                },
            )
            .expect("append"),
        3
    );

    let mut fresh = connect(daemon.local_addr(), "ws-1", None).await;
    send(&mut fresh, &ClientMessage::Sync { since_version: None }).await;
    let snapshot = match recv(&mut fresh).await {
        ServerMessage::Snapshot { version, state } => {
            assert_eq!(version, 3);
            state
        }
        other => panic!("expected snapshot, got {other:?}"),
    };
    assert_eq!(snapshot.slots.len(), 1);
    assert_eq!(snapshot.slot("s1").expect("slot s1").messages, vec![message]);

    let mut returning = connect(daemon.local_addr(), "ws-1", Some("returning")).await;
    send(&mut returning, &ClientMessage::Sync { since_version: Some(1) }).await;
    match recv(&mut returning).await {
        ServerMessage::Delta { version, since_version, deltas } => {
            assert_eq!((version, since_version, deltas.len()), (3, Some(1), 2));
            apply(
                &mut returning_state,
                &mut returning_version,
                ServerMessage::Delta { version, since_version, deltas },
            );
        }
        other => panic!("expected delta, got {other:?}"),
    }
    assert_eq!(returning_state, Some(snapshot));

    let _ = fresh.close(None).await;
    let _ = returning.close(None).await;
    daemon.wait().await.expect("daemon should stop cleanly");
}

#[tokio::test]
async fn client_mutations_are_broadcast_to_all_synced_clients() {
    let tmp = TempDir::new().expect("temp dir should be created");
    let daemon = start_daemon(&tmp).await;
    daemon.store().mutate("ws-1", create("ws-1")).expect("create");

    let mut clients = Vec::new();
    for id in ["a", "b"] {
        let mut socket = connect(daemon.local_addr(), "ws-1", Some(id)).await;
        send(&mut socket, &ClientMessage::Sync { since_version: None }).await;
        let (mut state, mut version) = (None, 0);
        apply(&mut state, &mut version, recv(&mut socket).await);
        clients.push((socket, state, version));
    }

    let mutation =
        StateMutation::SlotCreate { workspace_id: "ws-1".into(), slot_id: "from-a".into() };
    send(&mut clients[0].0, &ClientMessage::Mutate { mutation: mutation.clone() }).await;

    for (socket, state, version) in &mut clients {
        match recv(socket).await {
            ServerMessage::Delta { version: 2, since_version: Some(1), deltas } => {
                assert_eq!(deltas, vec![mutation.clone()]);
                apply(state, version, ServerMessage::Delta {
                    version: 2,
                    since_version: Some(1),
                    deltas,
                });
            }
            other => panic!("expected single delta, got {other:?}"),
        }
    }
    let expected = daemon.store().get_workspace_state("ws-1").expect("state");
    for (_, state, _) in &clients {
        assert_eq!(state.as_ref(), Some(expected.as_ref()));
    }

    // A mutation that fails validation is answered only to its sender.
    send(
        &mut clients[1].0,
        &ClientMessage::Mutate {
            mutation: StateMutation::SlotCreate {
                workspace_id: "ws-1".into(),
                slot_id: "from-a".into(),
            },
        },
    )
    .await;
    match recv(&mut clients[1].0).await {
        ServerMessage::Error { code, .. } => assert_eq!(code, "rejected"),
        other => panic!("expected error, got {other:?}"),
    }
    assert_eq!(daemon.store().current_version("ws-1"), 2);

    for (mut socket, _, _) in clients {
        let _ = socket.close(None).await;
    }
    daemon.wait().await.expect("daemon should stop cleanly");
}

#[tokio::test]
async fn malformed_frames_are_dropped_without_closing_the_session() {
    let tmp = TempDir::new().expect("temp dir should be created");
    let daemon = start_daemon(&tmp).await;
    daemon.store().mutate("ws-1", create("ws-1")).expect("create");

    let mut socket = connect(daemon.local_addr(), "ws-1", None).await;
    for frame in ["not json", r#"{"type":"teleport"}"#, r#"{"type":"ack"}"#] {
        socket.send(WsMessage::Text(frame.into())).await.expect("client should send frame");
    }
    send(&mut socket, &ClientMessage::Sync { since_version: None }).await;

    assert!(matches!(recv(&mut socket).await, ServerMessage::Snapshot { version: 1, .. }));

    let _ = socket.close(None).await;
    daemon.wait().await.expect("daemon should stop cleanly");
}

#[tokio::test]
async fn reconnect_beyond_gap_threshold_gets_snapshot() {
    let tmp = TempDir::new().expect("temp dir should be created");
    let daemon = start_daemon(&tmp).await;
    let store = daemon.store();
    store.mutate("ws-1", create("ws-1")).expect("create");
    for index in 2..=60 {
        store.mutate("ws-1", watch(index)).expect("mutate");
    }

    let mut socket = connect(daemon.local_addr(), "ws-1", None).await;
    send(&mut socket, &ClientMessage::Sync { since_version: Some(5) }).await;
    assert!(matches!(recv(&mut socket).await, ServerMessage::Snapshot { version: 60, .. }));

    send(&mut socket, &ClientMessage::Sync { since_version: Some(10) }).await;
    match recv(&mut socket).await {
        ServerMessage::Delta { version, since_version, deltas } => {
            assert_eq!((version, since_version, deltas.len()), (60, Some(10), 50));
        }
        other => panic!("expected delta, got {other:?}"),
    }

    let _ = socket.close(None).await;
    daemon.wait().await.expect("daemon should stop cleanly");
}

#[tokio::test]
async fn state_and_client_acks_survive_restart() {
    let tmp = TempDir::new().expect("temp dir should be created");
    let expected = {
        let daemon = start_daemon(&tmp).await;
        let store = daemon.store();
        store.mutate("ws-1", create("ws-1")).expect("create");
        for index in 2..=7 {
            store.mutate("ws-1", watch(index)).expect("mutate");
        }

        let mut socket = connect(daemon.local_addr(), "ws-1", Some("keeper")).await;
        send(&mut socket, &ClientMessage::Sync { since_version: None }).await;
        assert!(matches!(recv(&mut socket).await, ServerMessage::Snapshot { version: 7, .. }));
        let _ = socket.close(None).await;

        let state = store.get_workspace_state("ws-1").expect("state");
        daemon.wait().await.expect("daemon should stop cleanly");
        state
    };

    let daemon = start_daemon(&tmp).await;
    assert_eq!(daemon.recovery_report().recovered_workspaces, 1);
    assert_eq!(daemon.store().current_version("ws-1"), 7);
    assert_eq!(daemon.store().get_workspace_state("ws-1").expect("state"), expected);

    let record = daemon.store().client_record("keeper").expect("query").expect("client kept");
    assert_eq!(record.last_ack_version, 7);

    assert_eq!(daemon.store().mutate("ws-1", watch(8)).expect("mutate"), 8);
    let mut socket = connect(daemon.local_addr(), "ws-1", Some("keeper")).await;
    send(&mut socket, &ClientMessage::Sync { since_version: Some(7) }).await;
    match recv(&mut socket).await {
        ServerMessage::Delta { version, since_version, deltas } => {
            assert_eq!((version, since_version), (8, Some(7)));
            assert_eq!(deltas, vec![watch(8)]);
        }
        other => panic!("expected delta, got {other:?}"),
    }

    let _ = socket.close(None).await;
    daemon.wait().await.expect("daemon should stop cleanly");
}

#[tokio::test]
async fn health_endpoint_reports_open_workspaces() {
    let tmp = TempDir::new().expect("temp dir should be created");
    let daemon = start_daemon(&tmp).await;
    daemon.store().mutate("ws-1", create("ws-1")).expect("create");

    // Plain HTTP/1.1 over a raw socket keeps the dev-dependency set small.
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    let mut stream =
        tokio::net::TcpStream::connect(daemon.local_addr()).await.expect("tcp should connect");
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .expect("request should send");
    let mut response = String::new();
    timeout(Duration::from_secs(2), stream.read_to_string(&mut response))
        .await
        .expect("health should answer")
        .expect("response should read");

    assert!(response.starts_with("HTTP/1.1 200"), "unexpected response: {response}");
    assert!(response.contains(r#""status":"ok""#));
    assert!(response.contains(r#""workspaces":1"#));

    daemon.wait().await.expect("daemon should stop cleanly");
}
