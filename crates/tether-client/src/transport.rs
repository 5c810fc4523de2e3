use std::future::Future;

use futures_util::{SinkExt, StreamExt};
use log::warn;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use tether_proto::frame::{ClientFrame, ServerFrame, CLOSE_TAKEOVER};

/// How a finished transport went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Clean close from the remote side.
    Normal,
    /// The gateway displaced this connection for a takeover.
    Takeover,
    /// Transport-level error or abrupt drop.
    Error(String),
}

impl CloseReason {
    pub fn describe(&self) -> Option<String> {
        match self {
            CloseReason::Normal => None,
            CloseReason::Takeover => Some("displaced by takeover".to_string()),
            CloseReason::Error(err) => Some(err.clone()),
        }
    }
}

/// One message from a live connection.
#[derive(Debug)]
pub enum ConnEvent {
    Frame(ServerFrame),
    Closed(CloseReason),
}

/// A live, open connection to the gateway. `recv` must be cancel-safe: the
/// controller polls it inside a select loop.
pub trait Connection: Send {
    fn send(&mut self, frame: ClientFrame) -> impl Future<Output = Result<(), String>> + Send;
    fn recv(&mut self) -> impl Future<Output = ConnEvent> + Send;
    /// Abrupt close, no status code. The gateway reads it as transient
    /// loss and keeps the process running.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
    /// Clean close with the normal status code (1000). The gateway reads
    /// it as the explicit goodbye and kills the process.
    fn close_explicit(&mut self) -> impl Future<Output = ()> + Send;
}

/// Opens connections to the gateway, naming an existing backend process or
/// requesting a fresh one.
pub trait Connector: Send + 'static {
    type Conn: Connection + 'static;

    fn connect(
        &mut self,
        backend_id: Option<&str>,
    ) -> impl Future<Output = Result<Self::Conn, String>> + Send;
}

/// WebSocket connector for a gateway at `base_url` (e.g. `ws://host:7070`).
pub struct WsConnector {
    base_url: String,
    session_id: String,
}

impl WsConnector {
    pub fn new(base_url: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            session_id: session_id.into(),
        }
    }
}

impl Connector for WsConnector {
    type Conn = WsConnection;

    async fn connect(&mut self, backend_id: Option<&str>) -> Result<WsConnection, String> {
        let mut url = format!("{}/ws?session_id={}", self.base_url, self.session_id);
        if let Some(backend_id) = backend_id {
            url.push_str("&backend_id=");
            url.push_str(backend_id);
        }
        let (stream, _response) = connect_async(&url).await.map_err(|e| e.to_string())?;
        Ok(WsConnection { stream })
    }
}

pub struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Connection for WsConnection {
    async fn send(&mut self, frame: ClientFrame) -> Result<(), String> {
        let text = serde_json::to_string(&frame).map_err(|e| e.to_string())?;
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| e.to_string())
    }

    async fn recv(&mut self) -> ConnEvent {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ServerFrame>(&text) {
                        Ok(frame) => return ConnEvent::Frame(frame),
                        Err(err) => {
                            // Malformed envelope: drop it, keep the
                            // connection alive.
                            warn!("dropping malformed control envelope: {err}");
                        }
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    return ConnEvent::Closed(close_reason(frame));
                }
                Some(Ok(_)) => {} // ping/pong/binary
                Some(Err(err)) => return ConnEvent::Closed(CloseReason::Error(err.to_string())),
                None => return ConnEvent::Closed(CloseReason::Normal),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }

    async fn close_explicit(&mut self) {
        let _ = self
            .stream
            .close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            }))
            .await;
    }
}

fn close_reason(frame: Option<CloseFrame<'_>>) -> CloseReason {
    match frame {
        Some(frame) if u16::from(frame.code) == CLOSE_TAKEOVER => CloseReason::Takeover,
        Some(frame) => {
            let code = u16::from(frame.code);
            if code >= 4000 {
                CloseReason::Error(format!("closed by gateway: {} ({code})", frame.reason))
            } else {
                CloseReason::Normal
            }
        }
        None => CloseReason::Normal,
    }
}
