//! Pub/sub on top of streaming services.
//!
//! A channel type `T` is served as `SubscribeChannel/T`. Each `(T, channel_id)`
//! has at most one producer per terminal, shared by every subscriber through a
//! [`Hub`]; the producer stops when the last subscriber leaves.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use serde_json::{Map, Value};
use termnet_core::schema::JsonType;
use termnet_core::{encode_path, RouteError, Schema};
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

use crate::client::{Reply, RequestStream};
use crate::server::{streaming, Output, OutputStream, Request, ServiceOptions};
use crate::terminal::{lock, Terminal};

pub const SUBSCRIBE_CHANNEL: &str = "SubscribeChannel";
/// Publishers emit a keepalive after this much silence.
pub const CHANNEL_KEEPALIVE: Duration = Duration::from_secs(30);
const HUB_CAPACITY: usize = 1024;

pub type Feed = BoxStream<'static, Value>;
type Factory = Arc<dyn Fn(String) -> Feed + Send + Sync>;

pub fn subscribe_method(channel_type: &str) -> String {
    encode_path(&[SUBSCRIBE_CHANNEL, channel_type])
}

/// Request schema of `SubscribeChannel/T`: `channel_id` must be a string accepted by `id_schema`.
pub fn subscribe_schema(id_schema: Schema) -> Schema {
    let channel_id = Schema::AllOf(vec![Schema::Type(JsonType::String), id_schema]);
    Schema::AllOf(vec![
        Schema::Type(JsonType::Object),
        Schema::object(&["channel_id"], [("channel_id".to_string(), channel_id)]),
    ])
}

fn channel_key(channel_type: &str, channel_id: &str) -> String {
    encode_path(&[channel_type, channel_id])
}

struct Shared {
    id: u64,
    tx: broadcast::Sender<Value>,
    refs: usize,
    task: AbortHandle,
}

/// Refcounted fan-out of one source stream per key.
#[derive(Clone, Default)]
pub(crate) struct Hub {
    entries: Arc<Mutex<HashMap<String, Shared>>>,
    next_id: Arc<AtomicU64>,
}

impl Hub {
    /// Subscribe to `key`, starting `source` only if nobody else is subscribed.
    pub(crate) fn join(&self, key: &str, source: impl FnOnce() -> Feed) -> Feed {
        if let Some(feed) = self.attach(key) {
            return feed;
        }
        let upstream = source();
        let mut entries = lock(&self.entries);
        if let Some(shared) = entries.get_mut(key) {
            // Somebody started it meanwhile; ours is never polled.
            shared.refs += 1;
            return self.feed(key, shared.id, shared.tx.subscribe());
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = broadcast::channel(HUB_CAPACITY);
        let hub = self.clone();
        let owned_key = key.to_string();
        let sender = tx.clone();
        let task = tokio::spawn(async move {
            let mut upstream = upstream;
            while let Some(value) = upstream.next().await {
                let _ = sender.send(value);
            }
            hub.retire(&owned_key, id);
        });
        entries.insert(
            key.to_string(),
            Shared {
                id,
                tx,
                refs: 1,
                task: task.abort_handle(),
            },
        );
        drop(entries);
        self.feed(key, id, rx)
    }

    fn attach(&self, key: &str) -> Option<Feed> {
        let mut entries = lock(&self.entries);
        let shared = entries.get_mut(key)?;
        shared.refs += 1;
        Some(self.feed(key, shared.id, shared.tx.subscribe()))
    }

    fn feed(&self, key: &str, id: u64, rx: broadcast::Receiver<Value>) -> Feed {
        let guard = Leave {
            hub: self.clone(),
            key: key.to_string(),
            id,
        };
        stream::unfold((rx, guard), |(mut rx, guard)| async move {
            loop {
                match rx.recv().await {
                    Ok(value) => return Some((value, (rx, guard))),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(key = %guard.key, skipped = n, "slow channel subscriber");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }

    /// Source ended on its own.
    fn retire(&self, key: &str, id: u64) {
        let mut entries = lock(&self.entries);
        if entries.get(key).is_some_and(|s| s.id == id) {
            entries.remove(key);
        }
    }

    fn leave(&self, key: &str, id: u64) {
        let mut entries = lock(&self.entries);
        let Some(shared) = entries.get_mut(key) else { return };
        if shared.id != id {
            return;
        }
        shared.refs -= 1;
        if shared.refs == 0 {
            if let Some(shared) = entries.remove(key) {
                shared.task.abort();
                tracing::debug!(%key, "last subscriber left, source stopped");
            }
        }
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        lock(&self.entries).contains_key(key)
    }

    fn close(&self) {
        for (_, shared) in lock(&self.entries).drain() {
            shared.task.abort();
        }
    }
}

struct Leave {
    hub: Hub,
    key: String,
    id: u64,
}

impl Drop for Leave {
    fn drop(&mut self) {
        self.hub.leave(&self.key, self.id);
    }
}

struct LocalChannel {
    id_schema: Schema,
    factory: Factory,
}

/// Per-terminal channel state.
#[derive(Default)]
pub(crate) struct Channels {
    local: Mutex<HashMap<String, LocalChannel>>,
    /// Producers run here, fed to local consumers and remote subscribers alike.
    pub(crate) published: Hub,
    /// One remote subscription per key, shared by local consumers.
    pub(crate) subscribed: Hub,
}

impl Channels {
    pub(crate) fn close(&self) {
        self.published.close();
        self.subscribed.close();
    }
}

impl Terminal {
    /// Serve channel type `channel_type`. `factory` is called once per channel id
    /// while it has subscribers.
    pub fn provide_channel<F, S>(&self, channel_type: &str, id_schema: Schema, factory: F) -> Result<String, RouteError>
    where
        F: Fn(String) -> S + Send + Sync + 'static,
        S: Stream<Item = Value> + Send + 'static,
    {
        let factory: Factory = Arc::new(move |id| factory(id).boxed());
        let schema = subscribe_schema(id_schema.clone());
        lock(&self.inner.channels.local).insert(
            channel_type.to_string(),
            LocalChannel {
                id_schema,
                factory: factory.clone(),
            },
        );

        let hub = self.inner.channels.published.clone();
        let inner = Arc::downgrade(&self.inner);
        let ty = channel_type.to_string();
        let handler = streaming(move |req: Request, _abort: CancellationToken| -> OutputStream {
            let channel_id = req
                .req
                .get("channel_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let key = channel_key(&ty, &channel_id);
            let f = factory.clone();
            let feed = hub.join(&key, move || f(channel_id));
            let inner = inner.clone();
            let frames = feed.map(move |value| {
                if let Some(inner) = inner.upgrade() {
                    inner.metrics.channel_payload();
                }
                let mut frame = Map::new();
                frame.insert("value".into(), value);
                Value::Object(frame)
            });
            with_keepalive(frames.boxed(), CHANNEL_KEEPALIVE)
        });
        let service_id = self.provide_service(
            &subscribe_method(channel_type),
            schema.clone(),
            handler,
            ServiceOptions::default(),
        )?;
        self.add_channel_schema(schema);
        Ok(service_id)
    }

    /// Values of channel `(channel_type, channel_id)`, from a local producer if
    /// there is one, otherwise from a shared remote subscription that
    /// re-subscribes after failures.
    pub fn consume_channel(&self, channel_type: &str, channel_id: &str) -> Feed {
        let key = channel_key(channel_type, channel_id);
        let local = {
            let channels = lock(&self.inner.channels.local);
            channels.get(channel_type).and_then(|c| {
                let candidate = Value::String(channel_id.to_string());
                self.inner
                    .options
                    .validator
                    .validate(&c.id_schema, &candidate)
                    .then(|| c.factory.clone())
            })
        };
        if let Some(factory) = local {
            let id = channel_id.to_string();
            return self.inner.channels.published.join(&key, move || factory(id));
        }
        let terminal = self.clone();
        let method = subscribe_method(channel_type);
        let mut req = Map::new();
        req.insert("channel_id".into(), Value::String(channel_id.to_string()));
        self.inner
            .channels
            .subscribed
            .join(&key, move || remote_feed(terminal, method, Value::Object(req)))
    }
}

fn with_keepalive(frames: BoxStream<'static, Value>, every: Duration) -> OutputStream {
    stream::unfold(frames, move |mut frames| async move {
        tokio::select! {
            next = frames.next() => next.map(|frame| (Ok(Output::Frame(frame)), frames)),
            _ = tokio::time::sleep(every) => Some((Ok(Output::Keepalive), frames)),
        }
    })
    .boxed()
}

struct Remote {
    terminal: Terminal,
    method: String,
    req: Value,
    current: Option<RequestStream>,
}

fn remote_feed(terminal: Terminal, method: String, req: Value) -> Feed {
    let state = Remote {
        terminal,
        method,
        req,
        current: None,
    };
    stream::unfold(state, |mut st| async move {
        let retry = st.terminal.inner.options.retry_delay;
        loop {
            if st.terminal.is_shut_down() {
                return None;
            }
            if st.current.is_none() {
                match st.terminal.request_service(&st.method, st.req.clone()) {
                    Ok(s) => st.current = Some(s),
                    Err(e) => {
                        tracing::debug!(method = %st.method, error = %e, "channel subscribe failed");
                        tokio::time::sleep(retry).await;
                        continue;
                    }
                }
            }
            let item = match st.current.as_mut() {
                Some(s) => s.next().await,
                None => continue,
            };
            match item {
                Some(Ok(Reply::Frame(frame))) => {
                    if let Some(value) = frame.get("value") {
                        return Some((value.clone(), st));
                    }
                }
                Some(Ok(Reply::Response(res))) => {
                    tracing::debug!(method = %st.method, code = res.code, "channel closed by publisher");
                    st.current = None;
                    tokio::time::sleep(retry).await;
                }
                Some(Err(e)) => {
                    tracing::debug!(method = %st.method, error = %e, "channel subscription lost");
                    st.current = None;
                    tokio::time::sleep(retry).await;
                }
                None => {
                    st.current = None;
                    tokio::time::sleep(retry).await;
                }
            }
        }
    })
    .boxed()
}
