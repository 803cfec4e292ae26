//! WebSocket relay: query-string admission, per-realm socket registry, raw forwarding.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use termnet_core::envelope::peek_target;
use termnet_core::protocol::{admit_query, AdmissionError, HOST_ID_HEADER};
use termnet_core::realm::Realms;
use termnet_core::{PublicKey, HOST_TERMINAL_ID};
use termnet_terminal::transport::{from_message, socket_config, to_message};
use termnet_terminal::LinkEvent;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use crate::bootstrap::Bootstrap;
use crate::config::HostConfig;

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },
    #[error("websocket: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("admission refused: {0}")]
    Refused(String),
}

/// Where the relay writes frames for one terminal id.
#[derive(Clone)]
pub(crate) enum Peer {
    /// A connected socket; cancelling `closed` shuts it down.
    Remote {
        tx: mpsc::UnboundedSender<Vec<u8>>,
        closed: CancellationToken,
    },
    /// The realm's in-process host terminal.
    Local(mpsc::UnboundedSender<LinkEvent>),
}

impl Peer {
    pub(crate) fn deliver(&self, bytes: Vec<u8>) -> bool {
        match self {
            Peer::Remote { tx, .. } => tx.send(bytes).is_ok(),
            Peer::Local(events) => events.send(LinkEvent::Frame(bytes)).is_ok(),
        }
    }

    pub(crate) fn close(&self) {
        match self {
            Peer::Remote { closed, .. } => closed.cancel(),
            Peer::Local(events) => {
                let _ = events.send(LinkEvent::Down);
            }
        }
    }
}

pub(crate) type Registry = Arc<Mutex<Realms<Peer>>>;

/// Send one raw envelope to its target in `key`'s realm. Unknown targets are dropped.
pub(crate) fn forward(registry: &Registry, key: &PublicKey, source: &str, bytes: Vec<u8>) {
    let target = match peek_target(&bytes) {
        Ok(t) => t,
        Err(e) => {
            tracing::debug!(%source, error = %e, "unparseable envelope dropped");
            return;
        }
    };
    let peer = lock(registry)
        .get(key)
        .and_then(|realm| realm.lookup(&target).cloned());
    match peer {
        Some(peer) => {
            if !peer.deliver(bytes) {
                tracing::trace!(%source, %target, "peer closing, envelope dropped");
            }
        }
        None => tracing::trace!(%source, %target, "no live target, envelope dropped"),
    }
}

struct Shared {
    config: HostConfig,
    registry: Registry,
    hosts: Mutex<HashMap<PublicKey, Bootstrap>>,
    shutdown: CancellationToken,
}

impl Shared {
    /// Register `terminal_id`, creating the realm and its host terminal on first use.
    /// Returns the connection id and the realm's bootstrap.
    fn admit(&self, key: &PublicKey, terminal_id: &str, peer: Peer) -> (u64, Option<Bootstrap>) {
        let mut realms = lock(&self.registry);
        let (realm, created) = realms.get_or_create(key);
        if created {
            let (bootstrap, local) = Bootstrap::start(*key, self.registry.clone(), &self.config);
            realm.admit(HOST_TERMINAL_ID, local);
            realm.pin_info(bootstrap.terminal.info());
            tracing::info!(realm = %key, "realm created");
            lock(&self.hosts).insert(*key, bootstrap);
        }
        let admitted = realm.admit(terminal_id, peer);
        drop(realms);
        if let Some(old) = admitted.replaced {
            tracing::info!(realm = %key, %terminal_id, "replacing live connection");
            old.close();
        }
        (admitted.conn, lock(&self.hosts).get(key).cloned())
    }
}

/// A bound relay. [`Relay::run`] accepts until [`RelayHandle::shutdown`].
pub struct Relay {
    listener: TcpListener,
    shared: Arc<Shared>,
}

/// Control side of a running relay.
#[derive(Clone)]
pub struct RelayHandle {
    shared: Arc<Shared>,
}

impl Relay {
    pub async fn bind(config: HostConfig) -> Result<Self, HostError> {
        let addr = config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| HostError::Bind { addr, source })?;
        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                config,
                registry: Arc::new(Mutex::new(Realms::new())),
                hosts: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> RelayHandle {
        RelayHandle {
            shared: self.shared.clone(),
        }
    }

    pub async fn run(self) {
        tracing::info!(addr = ?self.listener.local_addr().ok(), host_id = %self.shared.config.host_id, "relay listening");
        loop {
            let accepted = tokio::select! {
                r = self.listener.accept() => r,
                _ = self.shared.shutdown.cancelled() => break,
            };
            match accepted {
                Ok((stream, peer)) => {
                    let shared = self.shared.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve(shared, stream).await {
                            tracing::debug!(%peer, error = %e, "connection closed");
                        }
                    });
                }
                Err(e) => tracing::warn!(error = %e, "accept failed"),
            }
        }
        tracing::info!("relay stopped accepting");
    }
}

impl RelayHandle {
    /// Close every live socket of every realm, then stop accepting.
    pub fn shutdown(&self) {
        let peers = lock(&self.shared.registry).drain_all();
        tracing::info!(sockets = peers.len(), "closing live connections");
        for peer in peers {
            peer.close();
        }
        for (_, bootstrap) in lock(&self.shared.hosts).drain() {
            bootstrap.terminal.shutdown();
        }
        self.shared.shutdown.cancel();
    }

    /// Terminal ids connected in `key`'s realm, host terminal excluded.
    pub fn live_terminals(&self, key: &PublicKey) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.shared.registry)
            .get(key)
            .map(|r| r.terminal_ids())
            .unwrap_or_default()
            .into_iter()
            .filter(|id| id != HOST_TERMINAL_ID)
            .collect();
        ids.sort();
        ids
    }
}

/// Refusal sent instead of the upgrade.
fn refusal(e: &AdmissionError) -> ErrorResponse {
    let mut res = ErrorResponse::new(Some(e.to_string()));
    *res.status_mut() = StatusCode::from_u16(e.code()).unwrap_or(StatusCode::UNAUTHORIZED);
    res
}

async fn serve(shared: Arc<Shared>, stream: TcpStream) -> Result<(), HostError> {
    let _ = stream.set_nodelay(true);

    let mut admission = None;
    let host_id = shared.config.host_id.clone();
    let check = |req: &Request, mut res: Response| -> Result<Response, ErrorResponse> {
        let verdict = admit_query(req.uri().query());
        let out = match &verdict {
            Ok(_) => {
                if let Ok(v) = HeaderValue::from_str(&host_id) {
                    res.headers_mut().insert(HOST_ID_HEADER, v);
                }
                Ok(res)
            }
            Err(e) => Err(refusal(e)),
        };
        admission = Some(verdict);
        out
    };
    let accepted = tokio::time::timeout(
        shared.config.handshake_timeout(),
        tokio_tungstenite::accept_hdr_async_with_config(stream, check, Some(socket_config())),
    )
    .await
    .map_err(|_| HostError::HandshakeTimeout)?;
    let (socket, (key, terminal_id)) = match (accepted, admission) {
        (Ok(socket), Some(Ok(admitted))) => (socket, admitted),
        (_, Some(Err(e))) => {
            tracing::info!(error = %e, "admission refused");
            return Err(HostError::Refused(e.to_string()));
        }
        (Err(e), _) => return Err(e.into()),
        (Ok(_), None) => return Err(HostError::Refused("upgrade without admission".into())),
    };

    let closed = shared.shutdown.child_token();
    let (tx, rx) = mpsc::unbounded_channel();
    let peer = Peer::Remote {
        tx,
        closed: closed.clone(),
    };
    let (conn, bootstrap) = shared.admit(&key, &terminal_id, peer);
    tracing::info!(realm = %key, %terminal_id, conn, "terminal admitted");
    let (sink, mut stream) = socket.split();
    tokio::spawn(write_loop(sink, rx, closed.clone()));

    loop {
        let msg = tokio::select! {
            m = stream.next() => m,
            _ = closed.cancelled() => break,
        };
        match msg {
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(msg)) => {
                if let Some(bytes) = from_message(msg) {
                    forward(&shared.registry, &key, &terminal_id, bytes);
                }
            }
            Some(Err(e)) => {
                tracing::debug!(%terminal_id, error = %e, "read failed");
                break;
            }
        }
    }
    closed.cancel();

    let evicted = lock(&shared.registry)
        .get_mut(&key)
        .and_then(|realm| realm.evict(&terminal_id, conn))
        .is_some();
    if evicted {
        tracing::info!(realm = %key, %terminal_id, "terminal disconnected");
        if let Some(b) = bootstrap {
            b.refresh();
        }
    }
    Ok(())
}

async fn write_loop(
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    closed: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = closed.cancelled() => None,
            bytes = rx.recv() => bytes,
        };
        let Some(bytes) = next else { break };
        if let Err(e) = sink.send(to_message(bytes)).await {
            tracing::debug!(error = %e, "write failed");
            closed.cancel();
            break;
        }
    }
    let _ = sink.close().await;
}
