//! Link to the host: a WebSocket client (admitted on its query string, then one
//! envelope per message) with automatic reconnect, or an in-memory pair for a
//! terminal living inside the host.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use termnet_core::envelope::MAX_ENVELOPE_LEN;
use termnet_core::protocol::HOST_ID_HEADER;
use termnet_core::{ConnectParams, Keypair};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::TerminalConfig;

/// Connect + upgrade must finish within this.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

pub type HostSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Admitted by the host.
    Up { host_id: String },
    /// One raw envelope.
    Frame(Vec<u8>),
    /// Connection lost. An `Up` follows once reconnected.
    Down,
}

/// Terminal side of a link: raw envelopes out, events in.
pub struct Link {
    pub outbound: mpsc::UnboundedSender<Vec<u8>>,
    pub events: mpsc::UnboundedReceiver<LinkEvent>,
}

/// Far side of an in-memory link.
pub struct MemoryPeer {
    pub events: mpsc::UnboundedSender<LinkEvent>,
    pub outbound: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// In-memory link, already up.
pub fn memory(host_id: &str) -> (Link, MemoryPeer) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (ev_tx, ev_rx) = mpsc::unbounded_channel();
    let _ = ev_tx.send(LinkEvent::Up {
        host_id: host_id.to_string(),
    });
    (
        Link {
            outbound: out_tx,
            events: ev_rx,
        },
        MemoryPeer {
            events: ev_tx,
            outbound: out_rx,
        },
    )
}

/// Socket limits shared by both ends: one message carries one envelope.
pub fn socket_config() -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(MAX_ENVELOPE_LEN);
    config.max_frame_size = Some(MAX_ENVELOPE_LEN);
    config
}

/// Envelopes are JSON, so they go out as text.
pub fn to_message(bytes: Vec<u8>) -> Message {
    match String::from_utf8(bytes) {
        Ok(text) => Message::Text(text),
        Err(e) => Message::Binary(e.into_bytes()),
    }
}

/// Payload of a data message; control messages carry none.
pub fn from_message(msg: Message) -> Option<Vec<u8>> {
    match msg {
        Message::Text(text) => Some(text.into_bytes()),
        Message::Binary(bytes) => Some(bytes),
        _ => None,
    }
}

/// `host_addr` with the admission parameters. A bare `host:port` means `ws://`.
pub fn connect_url(host_addr: &str, params: &ConnectParams) -> Result<Url, TransportError> {
    let base = if host_addr.contains("://") {
        host_addr.to_string()
    } else {
        format!("ws://{host_addr}")
    };
    let mut url = Url::parse(&base)?;
    url.set_query(Some(&params.to_query()));
    Ok(url)
}

/// Open the socket and get admitted. Returns the socket and the host id.
pub async fn connect(
    host_addr: &str,
    keypair: &Keypair,
    terminal_id: &str,
) -> Result<(HostSocket, String), TransportError> {
    let url = connect_url(host_addr, &ConnectParams::sign(keypair, terminal_id))?;
    let fut = tokio_tungstenite::connect_async_with_config(url.as_str(), Some(socket_config()), true);
    let (socket, res) = match tokio::time::timeout(HANDSHAKE_TIMEOUT, fut).await {
        Err(_) => return Err(TransportError::Timeout),
        Ok(Err(tungstenite::Error::Http(res))) => {
            let reason = res
                .body()
                .as_deref()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default();
            return Err(TransportError::Rejected {
                code: res.status().as_u16(),
                reason,
            });
        }
        Ok(Err(e)) => return Err(e.into()),
        Ok(Ok(pair)) => pair,
    };
    let host_id = res
        .headers()
        .get(HOST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    Ok((socket, host_id))
}

/// Spawn the reconnecting link. Envelopes written while disconnected are dropped.
pub fn spawn_socket(config: TerminalConfig, shutdown: CancellationToken) -> Link {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (ev_tx, ev_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_socket(config, out_rx, ev_tx, shutdown));
    Link {
        outbound: out_tx,
        events: ev_rx,
    }
}

async fn run_socket(
    config: TerminalConfig,
    mut out_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    events: mpsc::UnboundedSender<LinkEvent>,
    shutdown: CancellationToken,
) {
    loop {
        if shutdown.is_cancelled() {
            return;
        }
        match connect(&config.host_addr, &config.keypair, &config.terminal_id).await {
            Ok((socket, host_id)) => {
                tracing::info!(terminal_id = %config.terminal_id, %host_id, "connected to host");
                if events.send(LinkEvent::Up { host_id }).is_err() {
                    return;
                }
                let stop = pump(socket, &mut out_rx, &events, &shutdown).await;
                let _ = events.send(LinkEvent::Down);
                if stop {
                    return;
                }
                tracing::warn!(terminal_id = %config.terminal_id, "connection to host lost");
            }
            Err(e) => {
                tracing::warn!(terminal_id = %config.terminal_id, error = %e, "connect failed");
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(config.reconnect_delay) => {}
            _ = shutdown.cancelled() => return,
        }
        let mut dropped = 0usize;
        while out_rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            tracing::debug!(dropped, "discarded envelopes queued while disconnected");
        }
    }
}

/// Move envelopes until the socket closes. Returns true when the link should stop for good.
async fn pump(
    socket: HostSocket,
    out_rx: &mut mpsc::UnboundedReceiver<Vec<u8>>,
    events: &mpsc::UnboundedSender<LinkEvent>,
    shutdown: &CancellationToken,
) -> bool {
    let (mut sink, mut stream) = socket.split();
    let stop = loop {
        tokio::select! {
            out = out_rx.recv() => match out {
                Some(bytes) => {
                    if let Err(e) = sink.send(to_message(bytes)).await {
                        tracing::debug!(error = %e, "write failed");
                        break false;
                    }
                }
                None => break true,
            },
            msg = stream.next() => match msg {
                Some(Ok(Message::Close(_))) | None => break false,
                Some(Ok(msg)) => {
                    if let Some(bytes) = from_message(msg) {
                        if events.send(LinkEvent::Frame(bytes)).is_err() {
                            break true;
                        }
                    }
                }
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "read failed");
                    break false;
                }
            },
            _ = shutdown.cancelled() => break true,
        }
    };
    let _ = sink.close().await;
    stop
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("websocket: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("host address: {0}")]
    Url(#[from] url::ParseError),
    #[error("rejected by host ({code}): {reason}")]
    Rejected { code: u16, reason: String },
    #[error("connect timed out")]
    Timeout,
}
