//! The WebSocket attach endpoint: one socket, one binding, one relay loop.

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use log::{info, warn};
use serde::Deserialize;
use tokio::sync::broadcast;

use tether_db::{sessions, SessionPatch};
use tether_gateway::{AttachError, Attachment, DetachReason};
use tether_proto::frame::{
    ClientFrame, ServerFrame, CLOSE_BACKEND_NOT_FOUND, CLOSE_BIND_CONFLICT, CLOSE_TAKEOVER,
};

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub session_id: String,
    /// Absent for a brand-new session; the gateway spawns and assigns one.
    pub backend_id: Option<String>,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
    pub title: Option<String>,
}

fn default_cols() -> u16 {
    80
}

fn default_rows() -> u16 {
    24
}

pub async fn upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle(state, query, socket))
}

async fn handle(state: AppState, query: WsQuery, mut socket: WebSocket) {
    let attached = match &query.backend_id {
        Some(backend_id) => state.gateway.attach(backend_id),
        None => state.gateway.attach_new(
            &query.session_id,
            query.title.as_deref(),
            query.cols,
            query.rows,
        ),
    };

    let mut att = match attached {
        Ok(att) => att,
        Err(err) => {
            warn!("attach failed for session {}: {err}", query.session_id);
            let (code, reason) = close_for(&err);
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code,
                    reason: reason.into(),
                })))
                .await;
            return;
        }
    };

    info!(
        "session {} bound to {} (conn {})",
        query.session_id, att.backend_id, att.conn_id
    );

    // A takeover tears the binding down mid-relay; only the non-takeover
    // exits still own a binding to detach.
    if let Some(reason) = relay(&state, &query.session_id, &mut socket, &mut att).await {
        state.gateway.detach(&att.backend_id, att.conn_id, reason);
    }
}

fn close_for(err: &AttachError) -> (u16, &'static str) {
    match err {
        AttachError::NotFound => (CLOSE_BACKEND_NOT_FOUND, "no such backend"),
        AttachError::BindConflict => (CLOSE_BIND_CONFLICT, "backend already bound"),
        AttachError::Spawn(_) | AttachError::Storage(_) => (close_code::ERROR, "internal error"),
    }
}

async fn relay(
    state: &AppState,
    session_id: &str,
    socket: &mut WebSocket,
    att: &mut Attachment,
) -> Option<DetachReason> {
    // The process may have exited before this connection subscribed; it is
    // still owed the exit envelope.
    let exited = *att.exit.borrow();
    if let Some(code) = exited {
        finish_with_exit(socket, code).await;
        return Some(DetachReason::Exited);
    }

    let mut output_open = true;
    let mut force_open = true;
    loop {
        tokio::select! {
            chunk = att.output.recv(), if output_open => match chunk {
                Ok(bytes) => {
                    let frame = ServerFrame::Data {
                        data: String::from_utf8_lossy(&bytes).into_owned(),
                    };
                    if send_frame(socket, &frame).await.is_err() {
                        return Some(DetachReason::Lost);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("{}: dropped {n} output chunks for a slow client", att.backend_id);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    // Output ends at exit; the exit watch below delivers the code.
                    output_open = false;
                }
            },

            _ = att.exit.changed() => {
                let code = (*att.exit.borrow_and_update()).unwrap_or(-1);
                // Flush whatever output raced the exit notification.
                while let Ok(bytes) = att.output.try_recv() {
                    let frame = ServerFrame::Data {
                        data: String::from_utf8_lossy(&bytes).into_owned(),
                    };
                    if send_frame(socket, &frame).await.is_err() {
                        return Some(DetachReason::Lost);
                    }
                }
                finish_with_exit(socket, code).await;
                return Some(DetachReason::Exited);
            }

            signal = att.force.recv(), if force_open => match signal {
                Some(()) => {
                    info!("{}: displaced by takeover", att.backend_id);
                    let _ = socket
                        .send(Message::Close(Some(CloseFrame {
                            code: CLOSE_TAKEOVER,
                            reason: "session taken over by another connection".into(),
                        })))
                        .await;
                    return None;
                }
                // The binding was dropped without a signal: a kill, not a
                // takeover. The exit watch delivers the envelope.
                None => force_open = false,
            },

            msg = socket.recv() => match msg {
                Some(Ok(Message::Text(text))) => {
                    handle_client_frame(state, session_id, att, &text);
                }
                Some(Ok(Message::Close(frame))) => {
                    // Normal closure is the explicit goodbye; anything else
                    // is treated as transient loss and the process survives.
                    let explicit = frame.map_or(false, |f| f.code == close_code::NORMAL);
                    return Some(if explicit {
                        DetachReason::Closed
                    } else {
                        DetachReason::Lost
                    });
                }
                Some(Ok(_)) => {} // ping/pong are answered by the layer below
                Some(Err(err)) => {
                    warn!("{}: socket error: {err}", att.backend_id);
                    return Some(DetachReason::Lost);
                }
                None => return Some(DetachReason::Lost),
            },
        }
    }
}

/// One inbound control envelope. Malformed input is logged and dropped;
/// the connection survives.
fn handle_client_frame(state: &AppState, session_id: &str, att: &Attachment, text: &str) {
    match serde_json::from_str::<ClientFrame>(text) {
        Ok(ClientFrame::Data { data }) => {
            if let Err(err) = att.host.write(data.as_bytes()) {
                warn!("{}: write failed: {err}", att.backend_id);
            }
        }
        Ok(ClientFrame::Resize { cols, rows }) => {
            if cols == 0 || rows == 0 {
                warn!("{}: ignoring zero-sized resize", att.backend_id);
                return;
            }
            if let Err(err) = att.host.resize(cols, rows) {
                warn!("{}: resize failed: {err}", att.backend_id);
                return;
            }
            // Persist the size so the next resume starts from it.
            let patch = SessionPatch {
                cols: Some(cols),
                rows: Some(rows),
                ..SessionPatch::default()
            };
            let mut db = state.lock_db();
            if let Err(err) = sessions::update(&mut db, session_id, &patch) {
                warn!("{session_id}: size not persisted: {err}");
            }
        }
        Err(err) => warn!("{}: malformed frame: {err}", att.backend_id),
    }
}

async fn send_frame(socket: &mut WebSocket, frame: &ServerFrame) -> Result<(), axum::Error> {
    let text = serde_json::to_string(frame).unwrap_or_default();
    socket.send(Message::Text(text)).await
}

async fn finish_with_exit(socket: &mut WebSocket, code: i32) {
    let _ = send_frame(socket, &ServerFrame::Exit { code }).await;
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: "process exited".into(),
        })))
        .await;
}
