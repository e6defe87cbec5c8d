//! WebSocket connection management
//!
//! One socket to the agent server per session, with a fixed-delay reconnect
//! loop that runs for the life of the process. The query parameters are
//! frozen at the first connect; later settings changes only apply to the
//! next session.

use crate::protocol::{InboundEnvelope, OutboundEnvelope};
use futures_util::{SinkExt, StreamExt};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::fmt;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, trace, warn};

/// Delay between reconnect attempts. Fixed, no backoff.
pub const RECONNECT_DELAY: Duration = Duration::from_millis(1500);

const OUTBOUND_QUEUE: usize = 256;
const EVENT_QUEUE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    Connecting,
    Connected,
    #[default]
    Disconnected,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "Connecting..."),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Error => write!(f, "Connection error"),
        }
    }
}

/// Session parameters captured at the first connect and reused verbatim by
/// every reconnect attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    pub session_id: String,
    pub is_audio: bool,
    pub language: String,
    pub dev_mode: bool,
}

/// Random alphanumeric session identifier, one per process run.
pub fn session_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}

/// Builds the session endpoint URL from the configured server base.
pub fn build_ws_url(base: &str, params: &ConnectParams) -> Result<String, ConnectionError> {
    let base = base.trim_end_matches('/');
    let mut url = format!(
        "{}/ws/{}?is_audio={}&lang={}",
        base, params.session_id, params.is_audio, params.language
    );
    if params.dev_mode {
        url.push_str("&dev_mode=true");
    }
    url::Url::parse(&url).map_err(|e| ConnectionError::InvalidUrl(url.clone(), e))?;
    Ok(url)
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Invalid server URL {0}: {1}")]
    InvalidUrl(String, url::ParseError),
}

/// Socket lifecycle notifications for the rest of the app
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Socket opened (first connect or a reconnect)
    Open,
    /// A parsed server message
    Message(InboundEnvelope),
    /// Socket closed; `clean` distinguishes a server-initiated normal close
    /// from an error or abnormal drop
    Closed { clean: bool },
}

/// A managed connection to the agent server.
///
/// `connect` spawns the background task that owns the socket; `send` hands
/// envelopes to it. Messages sent while the socket is down are dropped, not
/// queued, so stale media never arrives after a reconnect.
pub struct Connection {
    server_url: String,
    frozen: Option<ConnectParams>,
    state_tx: watch::Sender<ConnectionState>,
    event_tx: broadcast::Sender<ConnectionEvent>,
    outbound_tx: mpsc::Sender<OutboundEnvelope>,
    outbound_rx: Option<mpsc::Receiver<OutboundEnvelope>>,
    task: Option<JoinHandle<()>>,
}

impl Connection {
    pub fn new(server_url: String) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (event_tx, _) = broadcast::channel(EVENT_QUEUE);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        Self {
            server_url,
            frozen: None,
            state_tx,
            event_tx,
            outbound_tx,
            outbound_rx: Some(outbound_rx),
            task: None,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.event_tx.subscribe()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Parameters in effect for this session, once connected.
    pub fn params(&self) -> Option<&ConnectParams> {
        self.frozen.as_ref()
    }

    /// Starts the connect/reconnect loop. The first call freezes `params`
    /// for the life of the process; later calls are no-ops.
    pub fn connect(&mut self, params: ConnectParams) -> Result<(), ConnectionError> {
        if self.frozen.is_some() {
            debug!("connect ignored, session parameters already frozen");
            return Ok(());
        }
        let url = build_ws_url(&self.server_url, &params)?;
        self.frozen = Some(params);

        // outbound_rx is only None once the task holds it
        if let Some(outbound_rx) = self.outbound_rx.take() {
            let state_tx = self.state_tx.clone();
            let event_tx = self.event_tx.clone();
            self.task = Some(tokio::spawn(run_connection(
                url,
                state_tx,
                event_tx,
                outbound_rx,
            )));
        }
        Ok(())
    }

    /// Hands an envelope to the socket task. Dropped with a log entry when
    /// the connection is not up.
    pub fn send(&self, envelope: OutboundEnvelope) {
        if self.state() != ConnectionState::Connected {
            debug!(mime_type = %envelope.mime_type, "dropping outbound message, not connected");
            return;
        }
        if let Err(e) = self.outbound_tx.try_send(envelope) {
            warn!("outbound queue full, dropping message: {e}");
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// The connect/reconnect loop. Runs until the process exits; every session
/// close, clean or not, is followed by a fixed delay and a fresh attempt
/// against the same URL.
async fn run_connection(
    url: String,
    state_tx: watch::Sender<ConnectionState>,
    event_tx: broadcast::Sender<ConnectionEvent>,
    mut outbound_rx: mpsc::Receiver<OutboundEnvelope>,
) {
    loop {
        let _ = state_tx.send(ConnectionState::Connecting);
        info!(%url, "connecting to agent server");

        match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((socket, _response)) => {
                info!("websocket open");
                let _ = state_tx.send(ConnectionState::Connected);
                let _ = event_tx.send(ConnectionEvent::Open);

                let clean = drive_socket(socket, &event_tx, &mut outbound_rx).await;
                if clean {
                    info!("websocket closed");
                    let _ = state_tx.send(ConnectionState::Disconnected);
                } else {
                    warn!("websocket dropped");
                    let _ = state_tx.send(ConnectionState::Error);
                }
                let _ = event_tx.send(ConnectionEvent::Closed { clean });
            }
            Err(e) => {
                error!("websocket connect failed: {e}");
                let _ = state_tx.send(ConnectionState::Error);
                let _ = event_tx.send(ConnectionEvent::Closed { clean: false });
            }
        }

        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

/// Pumps one open socket until it closes. Returns whether the close was
/// clean (normal close frame, or a close without a status).
async fn drive_socket<S>(
    socket: S,
    event_tx: &broadcast::Sender<ConnectionEvent>,
    outbound_rx: &mut mpsc::Receiver<OutboundEnvelope>,
) -> bool
where
    S: futures_util::Stream<
            Item = Result<Message, tokio_tungstenite::tungstenite::Error>,
        > + futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>,
{
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            outbound = outbound_rx.recv() => {
                // The sender half lives in Connection, so recv only fails
                // if it was dropped while the task is still running
                let Some(envelope) = outbound else { return false };
                let text = match serde_json::to_string(&envelope) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("failed to serialize outbound message: {e}");
                        continue;
                    }
                };
                trace!(mime_type = %envelope.mime_type, "sending message");
                if let Err(e) = sink.send(Message::Text(text)).await {
                    warn!("websocket send failed: {e}");
                    return false;
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<InboundEnvelope>(&text) {
                            Ok(envelope) => {
                                trace!(mime_type = ?envelope.mime_type, "received message");
                                let _ = event_tx.send(ConnectionEvent::Message(envelope));
                            }
                            Err(e) => warn!("dropping unparseable message: {e}"),
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return frame.map(|f| f.code == CloseCode::Normal).unwrap_or(true);
                    }
                    Some(Ok(_)) => {} // ping/pong/binary, nothing to do
                    Some(Err(e)) => {
                        warn!("websocket read failed: {e}");
                        return false;
                    }
                    None => return true,
                }
            }
        }
    }
}
