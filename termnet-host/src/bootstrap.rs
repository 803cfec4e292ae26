//! The host terminal of one realm and its bootstrap services:
//! `ListTerminals`, `UpdateTerminalInfo`, `Terminate` and the `TerminalInfo` channel.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{stream, StreamExt};
use serde_json::Value;
use termnet_core::envelope::{CODE_BAD_REQUEST, CODE_FORBIDDEN, CODE_OK, MSG_FORBIDDEN, MSG_OK};
use termnet_core::info::{
    METHOD_LIST_TERMINALS, METHOD_PING, METHOD_TERMINATE, METHOD_UPDATE_TERMINAL_INFO,
    TERMINAL_INFO_CHANNEL,
};
use termnet_core::schema::JsonType;
use termnet_core::{PublicKey, Response, Schema, TerminalInfo, HOST_TERMINAL_ID};
use termnet_terminal::transport;
use termnet_terminal::{unary, Feed, HandlerError, ServiceOptions, Terminal, TerminalOptions};
use tokio::sync::broadcast;

use crate::config::HostConfig;
use crate::server::{forward, lock, Peer, Registry};

const UPDATES_CAPACITY: usize = 256;

struct State {
    key: PublicKey,
    registry: Registry,
    cache: Mutex<Vec<TerminalInfo>>,
    updates: broadcast::Sender<TerminalInfo>,
}

impl State {
    fn refresh(&self) {
        let infos = lock(&self.registry)
            .get(&self.key)
            .map(|realm| realm.infos())
            .unwrap_or_default();
        *lock(&self.cache) = infos;
    }

    fn list(&self) -> Result<Response, serde_json::Error> {
        let cache = lock(&self.cache);
        Ok(Response::ok(serde_json::to_value(&*cache)?))
    }

    fn update(&self, source: &str, req: Value) -> Response {
        let info: TerminalInfo = match serde_json::from_value(req) {
            Ok(info) => info,
            Err(e) => return Response::new(CODE_BAD_REQUEST, e.to_string()),
        };
        // A terminal may only describe itself.
        if info.terminal_id != source {
            tracing::warn!(realm = %self.key, %source, claimed = %info.terminal_id, "foreign terminal info refused");
            return Response::new(CODE_FORBIDDEN, MSG_FORBIDDEN);
        }
        let stored = lock(&self.registry)
            .get_mut(&self.key)
            .map(|realm| realm.update_info(info.clone()))
            .unwrap_or(false);
        if !stored {
            return Response::new(CODE_FORBIDDEN, MSG_FORBIDDEN);
        }
        tracing::debug!(realm = %self.key, terminal_id = %info.terminal_id, services = info.services.len(), "terminal info updated");
        self.refresh();
        let _ = self.updates.send(info);
        Response::new(CODE_OK, MSG_OK)
    }

    fn feed(&self) -> Feed {
        stream::unfold(self.updates.subscribe(), |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(info) => match serde_json::to_value(&info) {
                        Ok(v) => return Some((v, rx)),
                        Err(e) => tracing::error!(error = %e, "terminal info encode failed"),
                    },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::debug!(skipped = n, "terminal info subscriber lagged")
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}

/// Host-local terminal of one realm. Addressed as `@host`.
#[derive(Clone)]
pub(crate) struct Bootstrap {
    pub(crate) terminal: Terminal,
    state: Arc<State>,
}

impl Bootstrap {
    /// Create the realm's host terminal and its background loops.
    /// Returns it with the peer the relay routes `@host` frames to.
    pub(crate) fn start(key: PublicKey, registry: Registry, config: &HostConfig) -> (Self, Peer) {
        let (link, mem) = transport::memory(&config.host_id);
        let options = TerminalOptions {
            name: Some(config.host_id.clone()),
            public_key: Some(key),
            announce: false,
            ..Default::default()
        };
        let terminal = Terminal::new(HOST_TERMINAL_ID, link, options);
        let (updates, _) = broadcast::channel(UPDATES_CAPACITY);
        let state = Arc::new(State {
            key,
            registry: registry.clone(),
            cache: Mutex::new(Vec::new()),
            updates,
        });
        let bootstrap = Self { terminal, state };
        bootstrap.provide();

        let mut outbound = mem.outbound;
        let closing = bootstrap.terminal.clone();
        tokio::spawn(async move {
            loop {
                let bytes = tokio::select! {
                    b = outbound.recv() => b,
                    _ = closing.closed() => None,
                };
                let Some(bytes) = bytes else { break };
                forward(&registry, &key, HOST_TERMINAL_ID, bytes);
            }
        });
        tokio::spawn(refresh_loop(bootstrap.clone(), config.directory_refresh()));
        tokio::spawn(sweep_loop(
            bootstrap.clone(),
            config.phantom_sweep(),
            config.ping_timeout(),
        ));
        (bootstrap, Peer::Local(mem.events))
    }

    /// Rebuild the `ListTerminals` snapshot now.
    pub(crate) fn refresh(&self) {
        self.state.refresh();
    }

    fn provide(&self) {
        let object = Schema::Type(JsonType::Object);

        let state = self.state.clone();
        let list = unary(move |_req, _abort| {
            let res = state.list().map_err(HandlerError::from);
            async move { res }
        });
        let state = self.state.clone();
        let update = unary(move |req, _abort| {
            let res = state.update(&req.source_terminal_id, req.req);
            async move { Ok(res) }
        });
        let terminate = unary(|req, _abort| {
            tracing::warn!(source = %req.source_terminal_id, "remote terminate refused");
            async { Ok(Response::new(CODE_FORBIDDEN, MSG_FORBIDDEN)) }
        });

        let fixed = |method: &str| ServiceOptions::default().with_id(method);
        let services = [
            (
                METHOD_LIST_TERMINALS,
                self.terminal
                    .provide_service(METHOD_LIST_TERMINALS, Schema::Any, list, fixed(METHOD_LIST_TERMINALS)),
            ),
            (
                METHOD_UPDATE_TERMINAL_INFO,
                self.terminal
                    .provide_service(METHOD_UPDATE_TERMINAL_INFO, object, update, fixed(METHOD_UPDATE_TERMINAL_INFO)),
            ),
            (
                METHOD_TERMINATE,
                self.terminal
                    .provide_service(METHOD_TERMINATE, Schema::Any, terminate, fixed(METHOD_TERMINATE)),
            ),
        ];
        for (method, registered) in services {
            if let Err(e) = registered {
                tracing::error!(%method, error = %e, "bootstrap service not registered");
            }
        }

        let state = self.state.clone();
        let channel = self.terminal.provide_channel(
            TERMINAL_INFO_CHANNEL,
            Schema::Const(Value::String(String::new())),
            move |_id| state.feed(),
        );
        if let Err(e) = channel {
            tracing::error!(error = %e, "TerminalInfo channel not registered");
        }
    }
}

async fn refresh_loop(bootstrap: Bootstrap, every: Duration) {
    loop {
        bootstrap.refresh();
        tokio::select! {
            _ = tokio::time::sleep(every) => {}
            _ = bootstrap.terminal.closed() => return,
        }
    }
}

/// Ping every connected terminal; drop the ones that do not answer.
async fn sweep_loop(bootstrap: Bootstrap, every: Duration, ping_timeout: Duration) {
    let state = &bootstrap.state;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(every) => {}
            _ = bootstrap.terminal.closed() => return,
        }
        let ids: Vec<String> = lock(&state.registry)
            .get(&state.key)
            .map(|realm| realm.terminal_ids())
            .unwrap_or_default()
            .into_iter()
            .filter(|id| id != HOST_TERMINAL_ID)
            .collect();
        let pings = ids.into_iter().map(|id| {
            let terminal = bootstrap.terminal.clone();
            async move {
                let call = terminal.call(METHOD_PING, &id, Value::Object(Default::default()));
                let alive = matches!(tokio::time::timeout(ping_timeout, call).await, Ok(Ok(res)) if res.is_ok());
                (id, alive)
            }
        });
        let results = futures::future::join_all(pings).await;
        let mut removed = 0;
        for (id, alive) in results {
            if alive {
                continue;
            }
            let peer = lock(&state.registry)
                .get_mut(&state.key)
                .and_then(|realm| realm.remove(&id));
            if let Some(peer) = peer {
                tracing::info!(realm = %state.key, terminal_id = %id, "phantom terminal removed");
                peer.close();
                removed += 1;
            }
        }
        if removed > 0 {
            bootstrap.refresh();
        }
    }
}
