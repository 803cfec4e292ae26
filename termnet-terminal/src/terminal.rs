//! The terminal engine: one dispatcher per link, the call table, the service
//! runtime and the background loops that keep the directory in sync.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::seq::SliceRandom;
use serde::de::DeserializeOwned;
use serde_json::Value;
use termnet_core::call::{CallTable, Delivery, EACH_TIMEOUT, FIRST_TIMEOUT};
use termnet_core::info::{
    METHOD_LIST_TERMINALS, METHOD_METRICS, METHOD_PING, METHOD_UPDATE_TERMINAL_INFO,
    TERMINAL_INFO_CHANNEL,
};
use termnet_core::router::OverlapPolicy;
use termnet_core::{
    Debounce, Envelope, JsonSchemaValidator, Kind, PublicKey, Response, RouteError, Schema,
    TerminalInfo, Validator, HOST_TERMINAL_ID,
};
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::channel::Channels;
use crate::client::{response_data, CallError, RequestStream};
use crate::config::TerminalConfig;
use crate::directory::Directory;
use crate::metrics::Metrics;
use crate::server::{self, unary, Admission, Handler, Server, ServiceOptions};
use crate::transport::{self, Link, LinkEvent};

/// Pending requests get an empty envelope this often.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Clone)]
pub struct TerminalOptions {
    pub name: Option<String>,
    pub public_key: Option<PublicKey>,
    /// Push our own info to the host and follow its directory.
    pub announce: bool,
    pub validator: Arc<dyn Validator>,
    pub overlap: OverlapPolicy,
    pub info_debounce: Duration,
    pub directory_refresh: Duration,
    pub retry_delay: Duration,
    pub first_timeout: Duration,
    pub each_timeout: Duration,
}

impl Default for TerminalOptions {
    fn default() -> Self {
        Self {
            name: None,
            public_key: None,
            announce: true,
            validator: Arc::new(JsonSchemaValidator::default()),
            overlap: OverlapPolicy::default(),
            info_debounce: Duration::from_millis(10),
            directory_refresh: Duration::from_secs(10),
            retry_delay: Duration::from_secs(1),
            first_timeout: FIRST_TIMEOUT,
            each_timeout: EACH_TIMEOUT,
        }
    }
}

pub(crate) type CallSink = mpsc::UnboundedSender<Envelope>;

pub(crate) struct Inner {
    pub(crate) terminal_id: String,
    pub(crate) options: TerminalOptions,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    pub(crate) calls: Mutex<CallTable<CallSink>>,
    pub(crate) server: Mutex<Server>,
    pub(crate) channels: Channels,
    info: Mutex<TerminalInfo>,
    info_changed: Notify,
    pub(crate) directory: Directory,
    connected: watch::Sender<bool>,
    pub(crate) metrics: Metrics,
    pub(crate) shutdown: CancellationToken,
}

impl Inner {
    pub(crate) fn send(&self, env: &Envelope) {
        match env.to_bytes() {
            Ok(bytes) => {
                if self.outbound.send(bytes).is_err() {
                    tracing::trace!(trace_id = %env.trace_id, "link closed, envelope dropped");
                }
            }
            Err(e) => tracing::error!(trace_id = %env.trace_id, error = %e, "envelope encode failed"),
        }
    }

    fn on_envelope(self: &Arc<Self>, env: Envelope) {
        match env.kind() {
            kind @ (Kind::Response | Kind::Frame | Kind::Keepalive) => {
                let now = Instant::now().into_std();
                let mut calls = lock(&self.calls);
                let trace_id = env.trace_id.clone();
                match calls.deliver(&trace_id, kind, now) {
                    Some(Delivery::More(sink)) => {
                        let _ = sink.send(env);
                    }
                    Some(Delivery::Last(sink)) => {
                        let _ = sink.send(env);
                    }
                    None => tracing::trace!(%trace_id, ?kind, "envelope for unknown call dropped"),
                }
            }
            Kind::Request => {
                self.metrics.request_received();
                let admission = lock(&self.server).admit(env);
                match admission {
                    Admission::Run(job) => {
                        tokio::spawn(server::run_job(self.clone(), job));
                    }
                    Admission::Queued => {}
                    Admission::Reject(head, res) => {
                        self.metrics.response_sent(res.code);
                        self.send(&head.reply(&self.terminal_id).with_response(res));
                    }
                }
            }
            Kind::Cancel => {
                let cancelled = lock(&self.server).cancel(&env.source_terminal_id, &env.trace_id);
                if cancelled {
                    tracing::debug!(trace_id = %env.trace_id, source = %env.source_terminal_id, "request cancelled by caller");
                }
            }
        }
    }

    fn on_up(&self, host_id: &str) {
        tracing::info!(terminal_id = %self.terminal_id, %host_id, "link up");
        self.connected.send_replace(true);
    }

    fn on_down(&self) {
        self.connected.send_replace(false);
        // Dropping the sinks ends every open RequestStream with `Aborted`.
        let aborted = lock(&self.calls).abort_all();
        lock(&self.server).abort_all();
        if !aborted.is_empty() {
            tracing::debug!(terminal_id = %self.terminal_id, calls = aborted.len(), "calls aborted by disconnect");
        }
    }

    fn touch_info(&self, f: impl FnOnce(&mut TerminalInfo)) {
        f(&mut lock(&self.info));
        self.info_changed.notify_one();
    }
}

/// Handle to a running terminal. Cheap to clone. Background tasks run until
/// [`Terminal::shutdown`].
#[derive(Clone)]
pub struct Terminal {
    pub(crate) inner: Arc<Inner>,
}

impl Terminal {
    /// Connect to a host over WebSocket, reconnecting as needed.
    pub fn connect(config: TerminalConfig, mut options: TerminalOptions) -> Self {
        let shutdown = CancellationToken::new();
        options.name.get_or_insert_with(|| config.name.clone());
        options
            .public_key
            .get_or_insert_with(|| *config.keypair.public_key());
        let terminal_id = config.terminal_id.clone();
        let link = transport::spawn_socket(config, shutdown.clone());
        Self::start(terminal_id, link, options, shutdown)
    }

    /// Run over an already established link (e.g. [`transport::memory`]).
    pub fn new(terminal_id: impl Into<String>, link: Link, options: TerminalOptions) -> Self {
        Self::start(terminal_id.into(), link, options, CancellationToken::new())
    }

    fn start(terminal_id: String, link: Link, options: TerminalOptions, shutdown: CancellationToken) -> Self {
        let mut info = TerminalInfo::new(
            terminal_id.clone(),
            options.name.clone().unwrap_or_else(|| terminal_id.clone()),
        );
        info.public_key = options.public_key;
        info.created_at = now_ms();
        info.updated_at = info.created_at;

        let inner = Arc::new(Inner {
            calls: Mutex::new(CallTable::new(options.first_timeout, options.each_timeout)),
            server: Mutex::new(Server::new(options.overlap, options.validator.clone())),
            channels: Channels::default(),
            info: Mutex::new(info),
            info_changed: Notify::new(),
            directory: Directory::new(),
            connected: watch::Sender::new(false),
            metrics: Metrics::default(),
            outbound: link.outbound,
            shutdown,
            terminal_id,
            options,
        });
        let terminal = Terminal { inner };

        tokio::spawn(dispatch(terminal.inner.clone(), link.events));
        tokio::spawn(keepalive(terminal.inner.clone()));
        terminal.provide_builtins();
        if terminal.inner.options.announce {
            tokio::spawn(announce(terminal.inner.clone()));
            tokio::spawn(follow_directory(terminal.clone()));
            tokio::spawn(follow_info_channel(terminal.clone()));
        }
        terminal
    }

    fn provide_builtins(&self) {
        let ping = unary(|_req, _abort| async { Ok(Response::new(0, "Pong")) });
        let weak = Arc::downgrade(&self.inner);
        let metrics = unary(move |_req, _abort| {
            let text = weak.upgrade().map(|inner| inner.metrics.render());
            async move {
                match text {
                    Some(Ok(text)) => Ok(Response::ok(serde_json::json!({ "metrics": text }))),
                    Some(Err(e)) => Err(e.into()),
                    None => Ok(Response::new(0, "OK")),
                }
            }
        });
        let builtins: [(&str, Box<dyn Handler>); 2] =
            [(METHOD_PING, Box::new(ping)), (METHOD_METRICS, Box::new(metrics))];
        for (method, handler) in builtins {
            let options = ServiceOptions::default().with_id(method);
            if let Err(e) = self.register(method, Schema::Any, Arc::from(handler), options) {
                tracing::warn!(%method, error = %e, "built-in service not registered");
            }
        }
    }

    pub fn terminal_id(&self) -> &str {
        &self.inner.terminal_id
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    /// Resolves once the link is up.
    pub async fn connected(&self) {
        let mut rx = self.inner.connected.subscribe();
        let _ = rx.wait_for(|c| *c).await;
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Resolves after [`shutdown`](Self::shutdown).
    pub async fn closed(&self) {
        self.inner.shutdown.cancelled().await
    }

    /// Stop every background task, abort open calls and running handlers.
    pub fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        tracing::info!(terminal_id = %self.inner.terminal_id, "terminal shutting down");
        self.inner.shutdown.cancel();
        self.inner.on_down();
        self.inner.channels.close();
    }

    pub fn directory(&self) -> &Directory {
        &self.inner.directory
    }

    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    /// Current descriptor, as pushed to the host.
    pub fn info(&self) -> TerminalInfo {
        let mut info = lock(&self.inner.info).clone();
        info.services = lock(&self.inner.server).services();
        info.services.sort_by(|a, b| a.service_id.cmp(&b.service_id));
        info
    }

    pub fn set_status(&self, status: impl Into<String>) {
        let status = status.into();
        self.inner.touch_info(|info| info.status = status);
    }

    pub fn set_tag(&self, key: impl Into<String>, value: impl Into<String>) {
        let (key, value) = (key.into(), value.into());
        self.inner.touch_info(|info| {
            info.tags.insert(key, value);
        });
    }

    /// Register a service. Returns its `service_id`.
    pub fn provide_service(
        &self,
        method: &str,
        schema: Schema,
        handler: impl Handler,
        options: ServiceOptions,
    ) -> Result<String, RouteError> {
        self.register(method, schema, Arc::new(handler), options)
    }

    pub(crate) fn register(
        &self,
        method: &str,
        schema: Schema,
        handler: Arc<dyn Handler>,
        options: ServiceOptions,
    ) -> Result<String, RouteError> {
        let info = lock(&self.inner.server).register(method, schema, handler, options)?;
        tracing::debug!(terminal_id = %self.inner.terminal_id, %method, service_id = %info.service_id, "service registered");
        self.inner.info_changed.notify_one();
        Ok(info.service_id)
    }

    pub fn remove_service(&self, service_id: &str) -> bool {
        let removed = lock(&self.inner.server).unregister(service_id);
        let Some(rejected) = removed else {
            return false;
        };
        for (head, res) in rejected {
            self.inner.metrics.response_sent(res.code);
            self.inner
                .send(&head.reply(&self.inner.terminal_id).with_response(res));
        }
        self.inner.info_changed.notify_one();
        true
    }

    pub(crate) fn add_channel_schema(&self, schema: Schema) {
        self.inner.touch_info(|info| info.channel_schemas.push(schema));
    }

    /// Call `method` on a specific terminal.
    pub fn request(&self, method: &str, target: &str, req: Value) -> RequestStream {
        RequestStream::open(self.inner.clone(), method, target, req)
    }

    /// Call `method` on any terminal whose advertised schema accepts `req`,
    /// this one first when it serves the request itself.
    pub fn request_service(&self, method: &str, req: Value) -> Result<RequestStream, CallError> {
        if lock(&self.inner.server).serves(method, &req) {
            let target = self.inner.terminal_id.clone();
            return Ok(self.request(method, &target, req));
        }
        let candidates = self
            .inner
            .directory
            .providers(method, &req, self.inner.options.validator.as_ref());
        let target = candidates
            .choose(&mut rand::thread_rng())
            .ok_or_else(|| CallError::NoProvider {
                method: method.to_string(),
            })?;
        Ok(self.request(method, target, req))
    }

    pub async fn request_for_response(&self, method: &str, req: Value) -> Result<Response, CallError> {
        self.request_service(method, req)?.response().await
    }

    /// Like [`request_for_response`](Self::request_for_response), failing on a non-zero code.
    pub async fn request_for_data<T: DeserializeOwned>(&self, method: &str, req: Value) -> Result<T, CallError> {
        response_data(self.request_for_response(method, req).await?)
    }

    /// Unary call to a specific terminal.
    pub async fn call(&self, method: &str, target: &str, req: Value) -> Result<Response, CallError> {
        self.request(method, target, req).response().await
    }
}

async fn dispatch(inner: Arc<Inner>, mut events: mpsc::UnboundedReceiver<LinkEvent>) {
    loop {
        let event = tokio::select! {
            ev = events.recv() => ev,
            _ = inner.shutdown.cancelled() => None,
        };
        match event {
            Some(LinkEvent::Up { host_id }) => inner.on_up(&host_id),
            Some(LinkEvent::Frame(bytes)) => match Envelope::from_bytes(&bytes) {
                Ok(env) => inner.on_envelope(env),
                Err(e) => tracing::debug!(terminal_id = %inner.terminal_id, error = %e, "malformed envelope dropped"),
            },
            Some(LinkEvent::Down) => inner.on_down(),
            None => break,
        }
    }
    inner.on_down();
}

async fn keepalive(inner: Arc<Inner>) {
    let mut tick = tokio::time::interval(KEEPALIVE_INTERVAL);
    tick.tick().await;
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = inner.shutdown.cancelled() => return,
        }
        let heads = lock(&inner.server).pending_heads();
        for head in heads {
            inner.send(&head.reply(&inner.terminal_id));
        }
    }
}

/// Push our info after every (debounced) change and after every reconnect.
async fn announce(inner: Arc<Inner>) {
    let mut debounce = Debounce::new(inner.options.info_debounce);
    let mut connected = inner.connected.subscribe();
    let mut push: Option<tokio::task::JoinHandle<()>> = None;
    debounce.touch(Instant::now().into_std());
    loop {
        let deadline = debounce.deadline().map(Instant::from_std);
        tokio::select! {
            _ = inner.info_changed.notified() => {
                debounce.touch(Instant::now().into_std());
            }
            changed = connected.changed() => {
                if changed.is_err() {
                    break;
                }
                if *connected.borrow_and_update() {
                    debounce.touch(Instant::now().into_std());
                }
            }
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                if debounce.poll(Instant::now().into_std()).is_some() {
                    // A newer push supersedes one still retrying.
                    if let Some(old) = push.take() {
                        old.abort();
                    }
                    push = Some(tokio::spawn(push_info(Terminal { inner: inner.clone() })));
                }
            }
            _ = inner.shutdown.cancelled() => break,
        }
    }
    if let Some(p) = push {
        p.abort();
    }
}

async fn push_info(terminal: Terminal) {
    let retry = terminal.inner.options.retry_delay;
    loop {
        terminal.connected().await;
        let mut info = terminal.info();
        info.updated_at = now_ms();
        lock(&terminal.inner.info).updated_at = info.updated_at;
        let req = match serde_json::to_value(&info) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, "terminal info encode failed");
                return;
            }
        };
        match terminal.call(METHOD_UPDATE_TERMINAL_INFO, HOST_TERMINAL_ID, req).await {
            Ok(res) if res.is_ok() => {
                tracing::debug!(terminal_id = %terminal.terminal_id(), "terminal info pushed");
                return;
            }
            Ok(res) => tracing::warn!(code = res.code, message = %res.message, "terminal info rejected"),
            Err(e) => tracing::warn!(error = %e, "terminal info push failed"),
        }
        tokio::time::sleep(retry).await;
    }
}

/// Periodic `ListTerminals` snapshot.
async fn follow_directory(terminal: Terminal) {
    let opts = terminal.inner.options.clone();
    loop {
        tokio::select! {
            _ = terminal.connected() => {}
            _ = terminal.closed() => return,
        }
        let pause = match terminal
            .call(METHOD_LIST_TERMINALS, HOST_TERMINAL_ID, Value::Object(Default::default()))
            .await
            .and_then(response_data::<Vec<TerminalInfo>>)
        {
            Ok(list) => {
                tracing::trace!(terminals = list.len(), "directory refreshed");
                terminal.inner.directory.replace(list);
                opts.directory_refresh
            }
            Err(e) => {
                tracing::debug!(error = %e, "directory refresh failed");
                opts.retry_delay
            }
        };
        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            _ = terminal.closed() => return,
        }
    }
}

/// Individual updates between snapshots.
async fn follow_info_channel(terminal: Terminal) {
    use futures::StreamExt;

    let mut feed = terminal.consume_channel(TERMINAL_INFO_CHANNEL, "");
    loop {
        let item = tokio::select! {
            item = feed.next() => item,
            _ = terminal.closed() => return,
        };
        let Some(value) = item else { return };
        match serde_json::from_value::<TerminalInfo>(value) {
            Ok(info) => terminal.inner.directory.merge(info),
            Err(e) => tracing::debug!(error = %e, "bad TerminalInfo payload"),
        }
    }
}

/// Terminal-level helper for tests inside this crate: an in-memory relay that
/// forwards frames by target id, the way the host does.
#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;

    use termnet_core::envelope::peek_target;

    use super::*;

    #[derive(Clone, Default)]
    pub(crate) struct Mesh {
        routes: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<LinkEvent>>>>,
    }

    pub(crate) fn quiet() -> TerminalOptions {
        TerminalOptions {
            announce: false,
            ..Default::default()
        }
    }

    impl Mesh {
        pub(crate) fn join(&self, id: &str) -> Terminal {
            self.join_with(id, quiet())
        }

        pub(crate) fn join_with(&self, id: &str, options: TerminalOptions) -> Terminal {
            let (link, peer) = transport::memory("mesh");
            lock(&self.routes).insert(id.to_string(), peer.events);
            let routes = self.routes.clone();
            let mut outbound = peer.outbound;
            tokio::spawn(async move {
                while let Some(bytes) = outbound.recv().await {
                    let Ok(target) = peek_target(&bytes) else { continue };
                    if let Some(tx) = lock(&routes).get(&target) {
                        let _ = tx.send(LinkEvent::Frame(bytes));
                    }
                }
            });
            Terminal::new(id, link, options)
        }

        /// Make `of` visible to `to`'s directory.
        pub(crate) fn introduce(&self, to: &Terminal, of: &Terminal) {
            to.directory().merge(of.info());
        }

        pub(crate) fn drop_link(&self, id: &str) {
            if let Some(tx) = lock(&self.routes).remove(id) {
                let _ = tx.send(LinkEvent::Down);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::Mesh;
    use super::*;
    use crate::client::Reply;
    use crate::server::{streaming, Output};
    use futures::StreamExt;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn echo_between_two_terminals() {
        let mesh = Mesh::default();
        let t1 = mesh.join("T1");
        let t2 = mesh.join("T2");
        t1.provide_service(
            "Echo",
            Schema::object(&["x"], []),
            unary(|req, _abort| async move { Ok(Response::ok(req.req)) }),
            ServiceOptions::default(),
        )
        .unwrap();
        mesh.introduce(&t2, &t1);

        let res = tokio::time::timeout(
            Duration::from_secs(5),
            t2.request_for_response("Echo", json!({"x": 5})),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(res, Response::ok(json!({"x": 5})));
        assert_eq!(res.message, "OK");
    }

    #[tokio::test]
    async fn local_provider_is_preferred() {
        let mesh = Mesh::default();
        let t1 = mesh.join("T1");
        let t2 = mesh.join("T2");
        for t in [&t1, &t2] {
            let me = t.terminal_id().to_string();
            t.provide_service(
                "Whoami",
                Schema::Any,
                unary(move |_req, _abort| {
                    let me = me.clone();
                    async move { Ok(Response::ok(json!(me))) }
                }),
                ServiceOptions::default(),
            )
            .unwrap();
        }
        mesh.introduce(&t1, &t2);
        mesh.introduce(&t1, &t1);

        for _ in 0..20 {
            let res = t1.request_for_response("Whoami", json!({})).await.unwrap();
            assert_eq!(res.data, Some(json!("T1")));
        }
    }

    #[tokio::test]
    async fn unrouted_request_has_no_provider() {
        let mesh = Mesh::default();
        let t1 = mesh.join("T1");
        let err = t1.request_service("Echo", json!({"x": 1})).err().unwrap();
        assert!(matches!(err, CallError::NoProvider { .. }));
    }

    #[tokio::test]
    async fn same_method_routes_by_schema() {
        let mesh = Mesh::default();
        let server = mesh.join("S");
        let client = mesh.join("C");
        let hits = Arc::new([AtomicUsize::new(0), AtomicUsize::new(0)]);
        for (i, account) in ["A", "B"].into_iter().enumerate() {
            let hits = hits.clone();
            server
                .provide_service(
                    "TransferApply",
                    Schema::pinned([("current_tx_account_id", json!(account))]),
                    unary(move |_req, _abort| {
                        hits[i].fetch_add(1, Ordering::SeqCst);
                        async move { Ok(Response::ok(json!(i))) }
                    }),
                    ServiceOptions::default(),
                )
                .unwrap();
        }
        let res = client
            .call("TransferApply", "S", json!({"current_tx_account_id": "B"}))
            .await
            .unwrap();
        assert_eq!(res.data, Some(json!(1)));
        assert_eq!(hits[0].load(Ordering::SeqCst), 0);
        assert_eq!(hits[1].load(Ordering::SeqCst), 1);

        let res = client
            .call("TransferApply", "S", json!({"current_tx_account_id": "Z"}))
            .await
            .unwrap();
        assert_eq!((res.code, res.message.as_str()), (400, "Unknown Routing"));
    }

    #[tokio::test]
    async fn frames_arrive_in_order_before_response() {
        let mesh = Mesh::default();
        let server = mesh.join("S");
        let client = mesh.join("C");
        server
            .provide_service(
                "Count",
                Schema::Any,
                streaming(|_req, _abort| {
                    futures::stream::iter(vec![
                        Ok(Output::Frame(json!("f1"))),
                        Ok(Output::Frame(json!("f2"))),
                        Ok(Output::Frame(json!("f3"))),
                        Ok(Output::Response(Response::ok(json!("done")))),
                    ])
                }),
                ServiceOptions::default(),
            )
            .unwrap();

        let first = client.request("Count", "S", json!({}));
        let second = client.request("Count", "S", json!({}));
        let (a, b) = tokio::join!(first.collect::<Vec<_>>(), second.collect::<Vec<_>>());
        for replies in [a, b] {
            let replies: Vec<Reply> = replies.into_iter().map(Result::unwrap).collect();
            assert_eq!(
                replies,
                vec![
                    Reply::Frame(json!("f1")),
                    Reply::Frame(json!("f2")),
                    Reply::Frame(json!("f3")),
                    Reply::Response(Response::ok(json!("done"))),
                ]
            );
        }
    }

    #[tokio::test]
    async fn handler_error_and_panic_become_500() {
        let mesh = Mesh::default();
        let server = mesh.join("S");
        let client = mesh.join("C");
        server
            .provide_service(
                "Fail",
                Schema::Any,
                unary(|_req, _abort| async { Err::<Response, _>("vendor down".into()) }),
                ServiceOptions::default(),
            )
            .unwrap();
        server
            .provide_service(
                "Panic",
                Schema::Any,
                unary(|_req, _abort| async {
                    if true {
                        panic!("boom");
                    }
                    Ok(Response::new(0, "OK"))
                }),
                ServiceOptions::default(),
            )
            .unwrap();

        let res = client.call("Fail", "S", json!({})).await.unwrap();
        assert_eq!(res.code, 500);
        assert_eq!(res.message, "Internal Server Error: vendor down");
        let res = client.call("Panic", "S", json!({})).await.unwrap();
        assert_eq!(res.code, 500);
        // Still serving.
        let res = client.call(METHOD_PING, "S", json!({})).await.unwrap();
        assert_eq!(res.message, "Pong");
    }

    #[tokio::test(start_paused = true)]
    async fn silent_handler_times_out_with_504() {
        let mesh = Mesh::default();
        let server = mesh.join("S");
        let client = mesh.join_with(
            "C",
            TerminalOptions {
                announce: false,
                first_timeout: Duration::from_secs(120),
                ..Default::default()
            },
        );
        server
            .provide_service(
                "Hang",
                Schema::Any,
                unary(|_req, _abort| std::future::pending()),
                ServiceOptions::default(),
            )
            .unwrap();
        let res = client.call("Hang", "S", json!({})).await.unwrap();
        assert_eq!(res.code, 504);
    }

    #[tokio::test(start_paused = true)]
    async fn caller_times_out_when_nobody_answers() {
        let mesh = Mesh::default();
        let client = mesh.join("C");
        let err = client.call("Echo", "nobody", json!({})).await.unwrap_err();
        assert!(matches!(err, CallError::Timeout));
        assert!(lock(&client.inner.calls).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn queued_request_gets_keepalives_and_cancel_dequeues() {
        let mesh = Mesh::default();
        let server = mesh.join("S");
        let client = mesh.join("C");
        let gate = Arc::new(Notify::new());
        let g = gate.clone();
        let mut options = ServiceOptions::default().concurrent(1);
        options.first_timeout = Duration::from_secs(600);
        server
            .provide_service(
                "Slow",
                Schema::Any,
                unary(move |_req, _abort| {
                    let g = g.clone();
                    async move {
                        g.notified().await;
                        Ok(Response::new(0, "OK"))
                    }
                }),
                options,
            )
            .unwrap();

        let running = client.request("Slow", "S", json!({}));
        let mut queued = client.request("Slow", "S", json!({}));
        // Past the caller's first deadline: only keepalives keep it alive.
        let waited = tokio::time::timeout(Duration::from_secs(45), queued.next()).await;
        assert!(waited.is_err(), "queued call must not resolve or time out");
        assert_eq!(lock(&server.inner.server).pending_heads().len(), 1);

        queued.cancel();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(lock(&server.inner.server).pending_heads().is_empty());

        gate.notify_one();
        // Let the response land before polling the long-expired call.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let res = running.response().await.unwrap();
        assert!(res.is_ok());
    }

    #[tokio::test]
    async fn cancel_fires_abort_once() {
        let mesh = Mesh::default();
        let server = mesh.join("S");
        let client = mesh.join("C");
        let seen: Arc<Mutex<Option<CancellationToken>>> = Arc::default();
        let s = seen.clone();
        server
            .provide_service(
                "Wait",
                Schema::Any,
                unary(move |_req, abort| {
                    *lock(&s) = Some(abort);
                    std::future::pending()
                }),
                ServiceOptions::default(),
            )
            .unwrap();

        let call = client.request("Wait", "S", json!({}));
        let trace = call.trace_id().to_string();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let abort = lock(&seen).clone().unwrap();
        assert!(!abort.is_cancelled());
        call.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(abort.is_cancelled());
        // A second cancel for the same trace finds nothing to do.
        client.inner.send(&Envelope::cancel(&trace, "C", "S"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!lock(&server.inner.server).cancel("C", &trace));
        assert_eq!(server.metrics().responses_sent(0), 0);

        let done = client.request(METHOD_PING, "S", json!({}));
        let trace = done.trace_id().to_string();
        let mut done = done;
        assert!(matches!(done.next().await, Some(Ok(Reply::Response(_)))));
        done.cancel();
        assert!(!lock(&client.inner.calls).contains(&trace));
    }

    #[tokio::test]
    async fn disconnect_aborts_open_calls() {
        let mesh = Mesh::default();
        let client = mesh.join("C");
        let call = client.request("Echo", "nobody", json!({}));
        mesh.drop_link("C");
        assert!(matches!(call.response().await, Err(CallError::Aborted)));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn info_lists_services() {
        let mesh = Mesh::default();
        let t = mesh.join("T");
        t.set_status("RUNNING");
        let info = t.info();
        assert_eq!(info.status, "RUNNING");
        let methods: Vec<_> = info.services.iter().map(|s| s.method.as_str()).collect();
        assert!(methods.contains(&METHOD_PING));
        assert!(methods.contains(&METHOD_METRICS));
        let metrics = t.call(METHOD_METRICS, "T", json!({})).await.unwrap();
        let data = metrics.data.unwrap();
        let text = data["metrics"].as_str().unwrap();
        assert!(text.contains("# TYPE termnet_requests_received_total counter"));
        assert!(t.metrics().requests_received() >= 1);
    }
}
