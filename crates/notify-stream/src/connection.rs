//! Streaming client for the notification channel.
//!
//! Every socket is tagged with a generation id when it is opened. The socket
//! task reports open/message/error/close through a single channel as
//! [`SocketEvent`]s carrying that generation, so the session can discard
//! anything coming from a connection it has already replaced.

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message, frame::coding::CloseCode};
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::reconnect::{CLOSE_ABNORMAL, CLOSE_NO_STATUS, CLOSE_NORMAL};

/// Connection state reported to consumers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Error,
}

/// Inputs of the connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionSignal {
    /// A socket was opened and is handshaking
    Connect,
    /// Handshake completed
    Opened,
    /// Transport reported an error
    TransportError,
    /// Socket closed, for any reason
    Closed,
    /// Reconnection was abandoned
    GaveUp,
    /// The connection was torn down on purpose (backgrounded)
    Stopped,
    /// No identity is in scope any more
    Reset,
}

impl ConnectionState {
    /// The single transition function of the connection state machine.
    pub fn on_signal(self, signal: ConnectionSignal) -> Self {
        match (self, signal) {
            (_, ConnectionSignal::Connect) => Self::Connecting,
            (_, ConnectionSignal::Opened) => Self::Connected,
            (_, ConnectionSignal::TransportError) => Self::Error,
            (_, ConnectionSignal::GaveUp) => Self::Error,
            (Self::Idle, ConnectionSignal::Closed | ConnectionSignal::Stopped) => Self::Idle,
            (_, ConnectionSignal::Closed | ConnectionSignal::Stopped) => Self::Disconnected,
            (_, ConnectionSignal::Reset) => Self::Idle,
        }
    }
}

/// Event reported by a socket task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketEvent {
    /// Generation of the socket that produced the event
    pub generation: u64,
    pub kind: SocketEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEventKind {
    Opened,
    Message(String),
    Error(String),
    Closed { code: u16, reason: String },
}

impl SocketEvent {
    pub fn new(generation: u64, kind: SocketEventKind) -> Self {
        Self { generation, kind }
    }
}

/// Close requested by the owner of a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseRequest {
    pub code: u16,
    pub reason: String,
}

/// Owner's handle on an open socket.
///
/// Closing is idempotent; dropping the handle closes the socket with a
/// normal close code.
#[derive(Debug)]
pub struct SocketHandle {
    generation: u64,
    close_tx: Option<oneshot::Sender<CloseRequest>>,
    task: Option<JoinHandle<()>>,
}

impl SocketHandle {
    pub fn new(generation: u64, close_tx: oneshot::Sender<CloseRequest>) -> Self {
        Self {
            generation,
            close_tx: Some(close_tx),
            task: None,
        }
    }

    /// Handle whose socket runs on `task`; [`SocketHandle::take_task`] lets the
    /// owner wait for the close handshake.
    pub fn with_task(
        generation: u64,
        close_tx: oneshot::Sender<CloseRequest>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            generation,
            close_tx: Some(close_tx),
            task: Some(task),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_closed(&self) -> bool {
        self.close_tx.is_none()
    }

    /// Ask the socket to close. Does nothing if it was already asked or is gone.
    pub fn close(&mut self, code: u16, reason: &str) {
        if let Some(tx) = self.close_tx.take() {
            let _ = tx.send(CloseRequest {
                code,
                reason: reason.to_string(),
            });
        }
    }

    pub fn take_task(&mut self) -> Option<JoinHandle<()>> {
        self.task.take()
    }
}

/// Opens sockets for the session.
pub trait Connector: Send + Sync {
    /// Open a socket to `url`. Events go to `events` tagged with `generation`.
    fn open(&self, url: Url, generation: u64, events: mpsc::Sender<SocketEvent>) -> SocketHandle;
}

/// `tokio-tungstenite` backed [`Connector`].
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn open(&self, url: Url, generation: u64, events: mpsc::Sender<SocketEvent>) -> SocketHandle {
        let (close_tx, close_rx) = oneshot::channel();
        let task = tokio::spawn(run_socket(url, generation, events, close_rx));
        SocketHandle::with_task(generation, close_tx, task)
    }
}

async fn emit(events: &mpsc::Sender<SocketEvent>, generation: u64, kind: SocketEventKind) {
    // Receiver gone means the service stopped; nothing left to notify.
    let _ = events.send(SocketEvent::new(generation, kind)).await;
}

async fn run_socket(
    url: Url,
    generation: u64,
    events: mpsc::Sender<SocketEvent>,
    mut close_rx: oneshot::Receiver<CloseRequest>,
) {
    debug!(generation, host = url.host_str().unwrap_or_default(), "Opening notification socket");

    let mut stream = tokio::select! {
        result = connect_async(url.as_str()) => match result {
            Ok((stream, _)) => stream,
            Err(e) => {
                warn!(generation, error = %e, "Notification socket failed to connect");
                emit(&events, generation, SocketEventKind::Error(e.to_string())).await;
                emit(
                    &events,
                    generation,
                    SocketEventKind::Closed { code: CLOSE_ABNORMAL, reason: e.to_string() },
                )
                .await;
                return;
            }
        },
        _ = &mut close_rx => {
            debug!(generation, "Socket closed before the handshake completed");
            return;
        }
    };

    info!(generation, "Notification socket connected");
    emit(&events, generation, SocketEventKind::Opened).await;

    loop {
        tokio::select! {
            request = &mut close_rx => {
                let request = request.unwrap_or(CloseRequest {
                    code: CLOSE_NORMAL,
                    reason: "handle dropped".to_string(),
                });
                let frame = CloseFrame {
                    code: CloseCode::from(request.code),
                    reason: request.reason.clone().into(),
                };
                if let Err(e) = stream.close(Some(frame)).await {
                    trace!(generation, error = %e, "Close frame not delivered");
                }
                emit(
                    &events,
                    generation,
                    SocketEventKind::Closed { code: request.code, reason: request.reason },
                )
                .await;
                return;
            }

            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    emit(&events, generation, SocketEventKind::Message(text.as_str().to_owned())).await;
                }
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => emit(&events, generation, SocketEventKind::Message(text)).await,
                    Err(_) => warn!(generation, len = bytes.len(), "Dropping non UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.as_str().to_owned()))
                        .unwrap_or((CLOSE_NO_STATUS, String::new()));
                    info!(generation, code, %reason, "Notification socket closed by server");
                    emit(&events, generation, SocketEventKind::Closed { code, reason }).await;
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(generation, error = %e, "Notification socket error");
                    emit(&events, generation, SocketEventKind::Error(e.to_string())).await;
                    emit(
                        &events,
                        generation,
                        SocketEventKind::Closed { code: CLOSE_ABNORMAL, reason: e.to_string() },
                    )
                    .await;
                    return;
                }
                None => {
                    warn!(generation, "Notification socket ended without a close frame");
                    emit(
                        &events,
                        generation,
                        SocketEventKind::Closed { code: CLOSE_ABNORMAL, reason: "stream ended".to_string() },
                    )
                    .await;
                    return;
                }
            }
        }
    }
}
