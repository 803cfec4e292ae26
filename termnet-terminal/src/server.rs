//! Service side of the engine: registrations, schema routing, concurrency
//! slots with a bounded pending queue, and the per-request driver.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, BoxStream, Stream};
use futures::{FutureExt, StreamExt};
use serde_json::Value;
use termnet_core::call::{EACH_TIMEOUT, FIRST_TIMEOUT};
use termnet_core::envelope::{
    CODE_BAD_REQUEST, CODE_INTERNAL, CODE_OK, CODE_TIMEOUT, CODE_UNAVAILABLE, MSG_OK, MSG_UNAVAILABLE,
};
use termnet_core::router::OverlapPolicy;
use termnet_core::{Envelope, Response, RouteError, Schema, SchemaRouter, ServiceInfo, Validator};
use tokio_util::sync::CancellationToken;

use crate::terminal::{lock, Inner};

pub const MSG_TIMEOUT: &str = "Gateway Timeout";

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// One thing a handler produces.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    Frame(Value),
    /// Empty envelope that only resets the caller's deadline.
    Keepalive,
    /// Final response; nothing after it is read.
    Response(Response),
}

pub type OutputStream = BoxStream<'static, Result<Output, HandlerError>>;

/// Incoming request as a handler sees it.
#[derive(Debug, Clone)]
pub struct Request {
    pub trace_id: String,
    pub method: String,
    pub source_terminal_id: String,
    pub req: Value,
}

/// A service implementation. `abort` fires when the caller cancels, times out
/// or disconnects; stop producing and release resources when it does.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, request: Request, abort: CancellationToken) -> OutputStream;
}

impl<F> Handler for F
where
    F: Fn(Request, CancellationToken) -> OutputStream + Send + Sync + 'static,
{
    fn call(&self, request: Request, abort: CancellationToken) -> OutputStream {
        self(request, abort)
    }
}

/// Handler answering with exactly one response.
pub fn unary<F, Fut>(f: F) -> impl Handler
where
    F: Fn(Request, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, HandlerError>> + Send + 'static,
{
    move |request: Request, abort: CancellationToken| -> OutputStream {
        let fut = f(request, abort);
        stream::once(async move { fut.await.map(Output::Response) }).boxed()
    }
}

/// Handler producing frames. Ending without a `Response` answers `OK`.
pub fn streaming<F, S>(f: F) -> impl Handler
where
    F: Fn(Request, CancellationToken) -> S + Send + Sync + 'static,
    S: Stream<Item = Result<Output, HandlerError>> + Send + 'static,
{
    move |request: Request, abort: CancellationToken| -> OutputStream { f(request, abort).boxed() }
}

#[derive(Debug, Clone)]
pub struct ServiceOptions {
    /// Defaults to a fresh uuid.
    pub service_id: Option<String>,
    /// Handler invocations allowed in flight. `None` is unbounded.
    pub concurrent: Option<usize>,
    /// Queue length beyond which requests get `503`. `None` is unbounded.
    pub max_pending: Option<usize>,
    pub first_timeout: Duration,
    pub each_timeout: Duration,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            service_id: None,
            concurrent: None,
            max_pending: None,
            first_timeout: FIRST_TIMEOUT,
            each_timeout: EACH_TIMEOUT,
        }
    }
}

impl ServiceOptions {
    pub fn with_id(mut self, service_id: impl Into<String>) -> Self {
        self.service_id = Some(service_id.into());
        self
    }

    pub fn concurrent(mut self, n: usize) -> Self {
        self.concurrent = Some(n);
        self
    }

    pub fn max_pending(mut self, n: usize) -> Self {
        self.max_pending = Some(n);
        self
    }
}

/// `(source_terminal_id, trace_id)`: trace ids are only unique per caller.
type RequestKey = (String, String);

struct Service {
    info: ServiceInfo,
    handler: Arc<dyn Handler>,
    options: ServiceOptions,
    /// Distinguishes a re-registration under the same id from its predecessor.
    generation: u64,
    running: usize,
    pending: VecDeque<Queued>,
}

struct Queued {
    key: RequestKey,
    head: Envelope,
    request: Request,
}

enum Slot {
    Pending { service_id: String },
    Running { abort: CancellationToken },
}

/// Everything a spawned request driver needs.
pub(crate) struct Job {
    key: RequestKey,
    service_id: String,
    generation: u64,
    /// The request envelope without its payload, used to address replies.
    head: Envelope,
    request: Request,
    handler: Arc<dyn Handler>,
    abort: CancellationToken,
    first_timeout: Duration,
    each_timeout: Duration,
}

pub(crate) enum Admission {
    Run(Job),
    Queued,
    Reject(Envelope, Response),
}

pub(crate) struct Server {
    routers: HashMap<String, SchemaRouter<String>>,
    services: HashMap<String, Service>,
    requests: HashMap<RequestKey, Slot>,
    next_generation: u64,
    policy: OverlapPolicy,
    validator: Arc<dyn Validator>,
}

impl Server {
    pub(crate) fn new(policy: OverlapPolicy, validator: Arc<dyn Validator>) -> Self {
        Self {
            routers: HashMap::new(),
            services: HashMap::new(),
            requests: HashMap::new(),
            next_generation: 0,
            policy,
            validator,
        }
    }

    pub(crate) fn register(
        &mut self,
        method: &str,
        schema: Schema,
        handler: Arc<dyn Handler>,
        options: ServiceOptions,
    ) -> Result<ServiceInfo, RouteError> {
        let service_id = options
            .service_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if let Some(dropped) = self.unregister(&service_id) {
            tracing::debug!(%service_id, queued = dropped.len(), "service re-registered");
        }
        let policy = self.policy;
        let validator = self.validator.clone();
        let router = self
            .routers
            .entry(method.to_string())
            .or_insert_with(|| {
                SchemaRouter::new(method)
                    .with_policy(policy)
                    .with_validator(validator)
            });
        router.register(schema.clone(), service_id.clone())?;
        let info = ServiceInfo {
            service_id: service_id.clone(),
            method: method.to_string(),
            schema,
        };
        self.next_generation += 1;
        self.services.insert(
            service_id,
            Service {
                info: info.clone(),
                handler,
                options,
                generation: self.next_generation,
                running: 0,
                pending: VecDeque::new(),
            },
        );
        Ok(info)
    }

    /// Drop a registration. Requests still queued for it are returned so the
    /// caller can answer them.
    pub(crate) fn unregister(&mut self, service_id: &str) -> Option<Vec<(Envelope, Response)>> {
        let service = self.services.remove(service_id)?;
        if let Some(router) = self.routers.get_mut(&service.info.method) {
            router.retain(|h| h != service_id);
            if router.is_empty() {
                self.routers.remove(&service.info.method);
            }
        }
        let mut rejected = Vec::new();
        for q in service.pending {
            self.requests.remove(&q.key);
            rejected.push((q.head, Response::new(CODE_UNAVAILABLE, MSG_UNAVAILABLE)));
        }
        Some(rejected)
    }

    /// Whether a local registration would accept `req`.
    pub(crate) fn serves(&self, method: &str, req: &Value) -> bool {
        self.routers
            .get(method)
            .is_some_and(|router| router.route(req).is_ok())
    }

    pub(crate) fn services(&self) -> Vec<ServiceInfo> {
        self.services.values().map(|s| s.info.clone()).collect()
    }

    /// Route a request and either start it, queue it, or reject it.
    pub(crate) fn admit(&mut self, mut env: Envelope) -> Admission {
        let method = env.method.clone().unwrap_or_default();
        let req = env.req.take().unwrap_or(Value::Null);
        let key = (env.source_terminal_id.clone(), env.trace_id.clone());
        let request = Request {
            trace_id: env.trace_id.clone(),
            method: method.clone(),
            source_terminal_id: env.source_terminal_id.clone(),
            req,
        };

        let routed = match self.routers.get(&method) {
            None => Err(RouteError::MethodNotFound),
            Some(router) => router.route(&request.req).cloned(),
        };
        let service_id = match routed {
            Ok(id) => id,
            Err(e) => {
                tracing::debug!(%method, trace_id = %request.trace_id, error = %e, "request not routed");
                return Admission::Reject(env, Response::new(CODE_BAD_REQUEST, e.to_string()));
            }
        };
        if self.requests.contains_key(&key) {
            tracing::debug!(%method, trace_id = %request.trace_id, "duplicate trace id ignored");
            return Admission::Queued;
        }
        let Some(service) = self.services.get_mut(&service_id) else {
            return Admission::Reject(env, Response::new(CODE_BAD_REQUEST, RouteError::NoMatch.to_string()));
        };

        let free = service.options.concurrent.map_or(true, |n| service.running < n);
        if free {
            service.running += 1;
            let job = Self::job(service, key.clone(), env, request);
            self.requests.insert(
                key,
                Slot::Running {
                    abort: job.abort.clone(),
                },
            );
            return Admission::Run(job);
        }
        if service
            .options
            .max_pending
            .is_some_and(|max| service.pending.len() >= max)
        {
            return Admission::Reject(env, Response::new(CODE_UNAVAILABLE, MSG_UNAVAILABLE));
        }
        service.pending.push_back(Queued {
            key: key.clone(),
            head: env,
            request,
        });
        self.requests.insert(key, Slot::Pending { service_id });
        Admission::Queued
    }

    fn job(service: &Service, key: RequestKey, head: Envelope, request: Request) -> Job {
        Job {
            key,
            service_id: service.info.service_id.clone(),
            generation: service.generation,
            head,
            request,
            handler: service.handler.clone(),
            abort: CancellationToken::new(),
            first_timeout: service.options.first_timeout,
            each_timeout: service.options.each_timeout,
        }
    }

    /// A running request ended. Frees its slot and hands back the next queued one.
    /// A job admitted by an earlier registration of `service_id` holds no slot
    /// in the current one.
    pub(crate) fn finish(&mut self, key: &RequestKey, service_id: &str, generation: u64) -> Option<Job> {
        if matches!(self.requests.get(key), Some(Slot::Running { .. })) {
            self.requests.remove(key);
        }
        let service = self
            .services
            .get_mut(service_id)
            .filter(|s| s.generation == generation)?;
        service.running = service.running.saturating_sub(1);
        let next = service.pending.pop_front()?;
        service.running += 1;
        let job = Self::job(service, next.key, next.head, next.request);
        self.requests.insert(
            job.key.clone(),
            Slot::Running {
                abort: job.abort.clone(),
            },
        );
        Some(job)
    }

    /// Caller gave up. Pending requests leave the queue, running ones get aborted.
    pub(crate) fn cancel(&mut self, source: &str, trace_id: &str) -> bool {
        let key = (source.to_string(), trace_id.to_string());
        match self.requests.remove(&key) {
            Some(Slot::Pending { service_id }) => {
                if let Some(service) = self.services.get_mut(&service_id) {
                    service.pending.retain(|q| q.key != key);
                }
                true
            }
            Some(Slot::Running { abort }) => {
                abort.cancel();
                true
            }
            None => false,
        }
    }

    /// Heads of every queued request, for keepalives.
    pub(crate) fn pending_heads(&self) -> Vec<Envelope> {
        self.services
            .values()
            .flat_map(|s| s.pending.iter().map(|q| q.head.clone()))
            .collect()
    }

    /// Connection lost: nobody is waiting for any of these anymore.
    pub(crate) fn abort_all(&mut self) {
        for (_, slot) in self.requests.drain() {
            if let Slot::Running { abort } = slot {
                abort.cancel();
            }
        }
        for service in self.services.values_mut() {
            service.pending.clear();
        }
    }
}

/// Drive one request to its final response.
pub(crate) async fn run_job(inner: Arc<Inner>, job: Job) {
    let Job {
        key,
        service_id,
        generation,
        head,
        request,
        handler,
        abort,
        first_timeout,
        each_timeout,
    } = job;
    let method = request.method.clone();
    let trace_id = request.trace_id.clone();

    let mut outputs = match std::panic::catch_unwind(AssertUnwindSafe(|| handler.call(request, abort.clone()))) {
        Ok(s) => s,
        Err(_) => stream::once(async { Err::<Output, HandlerError>("handler panicked".into()) }).boxed(),
    };

    let mut deadline = tokio::time::Instant::now() + first_timeout;
    let result = loop {
        let next = tokio::select! {
            biased;
            _ = abort.cancelled() => break None,
            next = tokio::time::timeout_at(deadline, AssertUnwindSafe(outputs.next()).catch_unwind()) => next,
        };
        match next {
            Err(_) => {
                tracing::warn!(%method, %trace_id, "handler timed out");
                abort.cancel();
                break Some(Response::new(CODE_TIMEOUT, MSG_TIMEOUT));
            }
            Ok(Err(_)) => {
                tracing::error!(%method, %trace_id, "handler panicked");
                abort.cancel();
                break Some(internal_error("handler panicked"));
            }
            Ok(Ok(None)) => break Some(Response::new(CODE_OK, MSG_OK)),
            Ok(Ok(Some(Ok(Output::Frame(frame))))) => {
                inner.send(&head.reply(&inner.terminal_id).with_frame(frame));
                inner.metrics.frame_sent();
                deadline = tokio::time::Instant::now() + each_timeout;
            }
            Ok(Ok(Some(Ok(Output::Keepalive)))) => {
                inner.send(&head.reply(&inner.terminal_id));
                deadline = tokio::time::Instant::now() + each_timeout;
            }
            Ok(Ok(Some(Ok(Output::Response(res))))) => break Some(res),
            Ok(Ok(Some(Err(e)))) => {
                tracing::warn!(%method, %trace_id, error = %e, "handler failed");
                break Some(internal_error(e));
            }
        }
    };
    drop(outputs);

    match result {
        Some(res) => {
            inner.metrics.response_sent(res.code);
            inner.send(&head.reply(&inner.terminal_id).with_response(res));
        }
        None => tracing::debug!(%method, %trace_id, "request aborted by caller"),
    }

    let next = lock(&inner.server).finish(&key, &service_id, generation);
    if let Some(next) = next {
        spawn_job(inner, next);
    }
}

// Spawning from a separate non-async fn breaks the auto-trait cycle of the
// recursive `run_job` future so its `Send`-ness can be inferred.
fn spawn_job(inner: Arc<Inner>, job: Job) {
    tokio::spawn(run_job(inner, job));
}

fn internal_error(e: impl std::fmt::Display) -> Response {
    Response::new(CODE_INTERNAL, format!("Internal Server Error: {e}"))
}
