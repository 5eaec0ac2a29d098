use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use slotsync_common::protocol::ws::{ClientMessage, ServerMessage, CURRENT_PROTOCOL_VERSION};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info_span, warn, Instrument};

use crate::sync::coordinator::ERROR_PERSISTENCE;
use crate::sync::{ClientSession, SyncCoordinator};

#[derive(Clone)]
pub struct SyncWsState {
    coordinator: Arc<SyncCoordinator>,
    shutdown: watch::Receiver<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectParams {
    client_id: Option<String>,
}

/// Open sessions close themselves once `shutdown` flips to `true`.
pub fn router(coordinator: Arc<SyncCoordinator>, shutdown: watch::Receiver<bool>) -> Router {
    Router::new()
        .route("/sync/{workspace_id}", get(sync_ws_route))
        .route("/health", get(health_route))
        .with_state(SyncWsState { coordinator, shutdown })
}

pub async fn serve(
    listener: TcpListener,
    coordinator: Arc<SyncCoordinator>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let signal = wait_for_shutdown(shutdown.clone());
    axum::serve(listener, router(coordinator, shutdown))
        .with_graceful_shutdown(signal)
        .await
        .context("slotsync websocket server failed")
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn health_route(State(state): State<SyncWsState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "protocol": CURRENT_PROTOCOL_VERSION,
        "workspaces": state.coordinator.store().workspace_ids().len(),
    }))
}

async fn sync_ws_route(
    ws: WebSocketUpgrade,
    Path(workspace_id): Path<String>,
    Query(params): Query<ConnectParams>,
    State(state): State<SyncWsState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, workspace_id, params.client_id))
}

async fn handle_socket(
    mut socket: WebSocket,
    state: SyncWsState,
    workspace_id: String,
    requested_client_id: Option<String>,
) {
    let session =
        match state.coordinator.register_client(&workspace_id, requested_client_id.as_deref()) {
            Ok(session) => session,
            Err(error) => {
                warn!(workspace_id = %workspace_id, error = %error, "failed to register sync client");
                let reply = ServerMessage::error(ERROR_PERSISTENCE, error.to_string());
                if let Ok(encoded) = reply.to_json() {
                    let _ = socket.send(WsMessage::Text(encoded.into())).await;
                }
                return;
            }
        };

    let span = info_span!(
        "slotsync.ws.session",
        workspace_id = %session.workspace_id,
        client_id = %session.client_id,
    );
    run_session(socket, &state.coordinator, session, state.shutdown.clone()).instrument(span).await;
}

async fn run_session(
    mut socket: WebSocket,
    coordinator: &SyncCoordinator,
    mut session: ClientSession,
    shutdown: watch::Receiver<bool>,
) {
    debug!("sync session opened");
    loop {
        tokio::select! {
            incoming = socket.recv() => {
                let Some(Ok(message)) = incoming else {
                    break;
                };

                match message {
                    WsMessage::Text(payload) => {
                        process_incoming_text(coordinator, &session, payload.as_str());
                    }
                    WsMessage::Binary(_) => {
                        warn!("dropping binary frame; sync protocol is JSON text");
                    }
                    WsMessage::Ping(payload) => {
                        if socket.send(WsMessage::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    WsMessage::Pong(_) => {}
                    WsMessage::Close(_) => break,
                }
            }
            outbound = session.outbound.recv() => {
                // Closed when a resumed connection took over this client id.
                let Some(message) = outbound else {
                    break;
                };
                match message.to_json() {
                    Ok(encoded) => {
                        if socket.send(WsMessage::Text(encoded.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(error) => warn!(error = %error, "failed to encode sync message"),
                }
            }
            _ = wait_for_shutdown(shutdown.clone()) => {
                let _ = socket.send(WsMessage::Close(None)).await;
                break;
            }
        }
    }

    coordinator.unregister_client(&session);
    debug!("sync session closed");
}

fn process_incoming_text(coordinator: &SyncCoordinator, session: &ClientSession, payload: &str) {
    let message = match ClientMessage::parse(payload) {
        Ok(message) => message,
        Err(error) => {
            warn!(error = %error, "dropping malformed sync frame");
            return;
        }
    };

    if let Err(error) = coordinator.handle_message(&session.client_id, message) {
        warn!(error = %error, "failed to handle sync message");
    }
}
