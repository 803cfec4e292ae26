//! Transfer saga over the wire: the address book that serves `TransferApply` /
//! `TransferEval` for a terminal's accounts, and the driver that walks orders
//! through them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use termnet_core::envelope::{CODE_BAD_REQUEST, MSG_UNKNOWN_ROUTING, MSG_UNKNOWN_STATE};
use termnet_core::transfer::{
    apply_schema, eval_schema, ApplyOutcome, EvalOutcome, Step, TransferAddress, TransferOrder,
    METHOD_APPLY, METHOD_EVAL, STATE_ERROR, STATE_INIT,
};
use termnet_core::{Debounce, Response, RouteError, RouteTable, Schema};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::client::CallError;
use crate::server::{unary, Handler, HandlerError, ServiceOptions};
use crate::terminal::{lock, now_ms, Terminal};

/// Window over which address registrations are coalesced into one rebuild.
pub const REGISTRATION_DEBOUNCE: Duration = Duration::from_secs(1);

/// Pushes funds out of an account for one `current_tx_state`.
/// Must be idempotent for a given `current_tx_context`.
#[async_trait]
pub trait ApplyHandler: Send + Sync + 'static {
    async fn apply(&self, order: &TransferOrder) -> Result<ApplyOutcome, HandlerError>;
}

/// Looks for the incoming funds. Must not have side effects.
#[async_trait]
pub trait EvalHandler: Send + Sync + 'static {
    async fn eval(&self, order: &TransferOrder) -> Result<EvalOutcome, HandlerError>;
}

/// One account address and the handlers serving it.
#[derive(Clone)]
pub struct AddressEntry {
    pub address: TransferAddress,
    apply: HashMap<String, Arc<dyn ApplyHandler>>,
    eval: Option<Arc<dyn EvalHandler>>,
}

impl AddressEntry {
    pub fn new(address: TransferAddress) -> Self {
        Self {
            address,
            apply: HashMap::new(),
            eval: None,
        }
    }

    pub fn on_apply(mut self, state: &str, handler: impl ApplyHandler) -> Self {
        self.apply.insert(state.to_string(), Arc::new(handler));
        self
    }

    pub fn on_eval(mut self, handler: impl EvalHandler) -> Self {
        self.eval = Some(Arc::new(handler));
        self
    }
}

struct Book {
    terminal: Terminal,
    entries: Mutex<Vec<Arc<AddressEntry>>>,
    debounce: Mutex<Debounce>,
    changed: Notify,
    services: Mutex<HashMap<&'static str, Registered>>,
}

struct Registered {
    service_id: String,
    schema: Schema,
}

/// Addresses served by one terminal. Additions are coalesced over
/// [`REGISTRATION_DEBOUNCE`], then each service whose address set changed is
/// replaced by one with a `oneOf` branch per address.
#[derive(Clone)]
pub struct TransferAddressBook {
    book: Arc<Book>,
}

impl TransferAddressBook {
    pub fn new(terminal: Terminal) -> Self {
        Self::with_window(terminal, REGISTRATION_DEBOUNCE)
    }

    pub fn with_window(terminal: Terminal, window: Duration) -> Self {
        let book = Arc::new(Book {
            terminal,
            entries: Mutex::new(Vec::new()),
            debounce: Mutex::new(Debounce::new(window)),
            changed: Notify::new(),
            services: Mutex::new(HashMap::new()),
        });
        tokio::spawn(flush_loop(book.clone()));
        Self { book }
    }

    pub fn add(&self, entry: AddressEntry) {
        lock(&self.book.entries).push(Arc::new(entry));
        lock(&self.book.debounce).touch(Instant::now().into_std());
        self.book.changed.notify_one();
    }

    pub fn addresses(&self) -> Vec<TransferAddress> {
        lock(&self.book.entries)
            .iter()
            .map(|e| e.address.clone())
            .collect()
    }

    /// Bring both services in line with the current entries right away.
    pub fn flush(&self) -> Result<(), RouteError> {
        self.book.flush()
    }

    /// Service id currently answering `method`, if any address serves it.
    pub fn service_id(&self, method: &str) -> Option<String> {
        lock(&self.book.services)
            .get(method)
            .map(|r| r.service_id.clone())
    }
}

impl Book {
    fn entries(&self) -> Vec<Arc<AddressEntry>> {
        lock(&self.entries).clone()
    }

    fn flush(self: &Arc<Self>) -> Result<(), RouteError> {
        let entries = self.entries();
        let tx: Vec<TransferAddress> = entries
            .iter()
            .filter(|e| !e.apply.is_empty())
            .map(|e| e.address.clone())
            .collect();
        let rx: Vec<TransferAddress> = entries
            .iter()
            .filter(|e| e.eval.is_some())
            .map(|e| e.address.clone())
            .collect();

        let book = Arc::downgrade(self);
        self.sync(METHOD_APPLY, (!tx.is_empty()).then(|| apply_schema(&tx)), || {
            let book = book.clone();
            unary(move |req, _abort| serve_apply(book.upgrade(), req.req))
        })?;
        self.sync(METHOD_EVAL, (!rx.is_empty()).then(|| eval_schema(&rx)), || {
            let book = book.clone();
            unary(move |req, _abort| serve_eval(book.upgrade(), req.req))
        })?;

        tracing::info!(
            terminal_id = %self.terminal.terminal_id(),
            apply = tx.len(),
            eval = rx.len(),
            "transfer addresses registered"
        );
        Ok(())
    }

    /// Swap the registration for `method` only when its schema changed. The
    /// replacement goes live before the old one leaves, so requests in between
    /// still find a provider.
    fn sync<H: Handler>(
        &self,
        method: &'static str,
        schema: Option<Schema>,
        handler: impl Fn() -> H,
    ) -> Result<(), RouteError> {
        let mut services = lock(&self.services);
        if services.get(method).map(|r| &r.schema) == schema.as_ref() {
            return Ok(());
        }
        let mut stale = services.remove(method);
        let Some(schema) = schema else {
            if let Some(old) = stale {
                self.terminal.remove_service(&old.service_id);
            }
            return Ok(());
        };

        let provide = || {
            self.terminal
                .provide_service(method, schema.clone(), handler(), ServiceOptions::default())
        };
        let service_id = match provide() {
            Ok(id) => id,
            Err(RouteError::Overlap { .. }) if stale.is_some() => {
                // Refused next to its predecessor: retire that one first.
                if let Some(old) = stale.take() {
                    self.terminal.remove_service(&old.service_id);
                }
                provide()?
            }
            Err(e) => {
                if let Some(old) = stale {
                    services.insert(method, old);
                }
                return Err(e);
            }
        };
        if let Some(old) = stale {
            self.terminal.remove_service(&old.service_id);
        }
        tracing::debug!(%method, %service_id, "transfer service replaced");
        services.insert(method, Registered { service_id, schema });
        Ok(())
    }
}

async fn flush_loop(book: Arc<Book>) {
    loop {
        let deadline = lock(&book.debounce).deadline().map(Instant::from_std);
        tokio::select! {
            _ = book.changed.notified() => continue,
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {}
            _ = book.terminal.closed() => return,
        }
        let due = lock(&book.debounce).poll(Instant::now().into_std());
        if let Some(generation) = due {
            tracing::debug!(generation, "rebuilding transfer services");
            if let Err(e) = book.flush() {
                tracing::error!(error = %e, "transfer service registration failed");
            }
        }
    }
}

fn refusal(message: &str) -> Response {
    let mut data = Map::new();
    data.insert("state".into(), Value::String(STATE_ERROR.into()));
    Response::new(CODE_BAD_REQUEST, message).with_data(Value::Object(data))
}

async fn serve_apply(book: Option<Arc<Book>>, req: Value) -> Result<Response, HandlerError> {
    let order: TransferOrder = serde_json::from_value(req)?;
    let entries = book.map(|b| b.entries()).unwrap_or_default();
    let Some(entry) = entries.iter().find(|e| e.address.is_tx_of(&order)) else {
        return Ok(refusal(MSG_UNKNOWN_ROUTING));
    };
    let state = order.current_tx_state.as_deref().unwrap_or(STATE_INIT);
    let Some(handler) = entry.apply.get(state) else {
        tracing::warn!(order_id = %order.order_id, %state, "no apply handler for state");
        return Ok(refusal(MSG_UNKNOWN_STATE));
    };
    let outcome = handler.apply(&order).await?;
    tracing::info!(order_id = %order.order_id, %state, next = %outcome.state, "transfer applied");
    Ok(Response::ok(serde_json::to_value(outcome)?))
}

async fn serve_eval(book: Option<Arc<Book>>, req: Value) -> Result<Response, HandlerError> {
    let order: TransferOrder = serde_json::from_value(req)?;
    let entries = book.map(|b| b.entries()).unwrap_or_default();
    let handler = entries
        .iter()
        .find(|e| e.address.is_rx_of(&order))
        .and_then(|e| e.eval.clone());
    let Some(handler) = handler else {
        return Ok(refusal(MSG_UNKNOWN_ROUTING));
    };
    let outcome = handler.eval(&order).await?;
    Ok(Response::ok(serde_json::to_value(outcome)?))
}

#[derive(Debug, thiserror::Error)]
#[error("order store: {0}")]
pub struct StoreError(pub String);

/// Durable home of transfer orders. The driver saves after every transition.
#[async_trait]
pub trait OrderStore: Send + Sync + 'static {
    async fn load(&self, order_id: &str) -> Result<Option<TransferOrder>, StoreError>;
    async fn save(&self, order: &TransferOrder) -> Result<(), StoreError>;
    /// Orders not yet `COMPLETE` or `ERROR`.
    async fn list_active(&self) -> Result<Vec<TransferOrder>, StoreError>;
}

#[derive(Default)]
pub struct MemoryOrderStore {
    orders: Mutex<HashMap<String, TransferOrder>>,
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn load(&self, order_id: &str) -> Result<Option<TransferOrder>, StoreError> {
        Ok(lock(&self.orders).get(order_id).cloned())
    }

    async fn save(&self, order: &TransferOrder) -> Result<(), StoreError> {
        lock(&self.orders).insert(order.order_id.clone(), order.clone());
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<TransferOrder>, StoreError> {
        Ok(lock(&self.orders)
            .values()
            .filter(|o| !o.status.is_terminal())
            .cloned()
            .collect())
    }
}

/// Walks orders through apply/eval until they complete, fail or expire.
pub struct TransferDriver<S> {
    terminal: Terminal,
    store: Arc<S>,
    routes: Mutex<RouteTable>,
    retry_delay: Duration,
    poll_interval: Duration,
}

impl<S: OrderStore> TransferDriver<S> {
    pub fn new(terminal: Terminal, store: Arc<S>) -> Self {
        Self {
            terminal,
            store,
            routes: Mutex::new(RouteTable::default()),
            retry_delay: Duration::from_secs(1),
            poll_interval: Duration::from_secs(5),
        }
    }

    /// Addresses and networks used to route orders submitted without a path.
    pub fn with_routes(mut self, routes: RouteTable) -> Self {
        self.routes = Mutex::new(routes);
        self
    }

    pub fn routes(&self) -> std::sync::MutexGuard<'_, RouteTable> {
        lock(&self.routes)
    }

    pub fn with_delays(mut self, retry_delay: Duration, poll_interval: Duration) -> Self {
        self.retry_delay = retry_delay;
        self.poll_interval = poll_interval;
        self
    }

    /// Persist a new order and drive it to the end. An order without a
    /// routing path gets the cheapest one from the route table.
    pub async fn submit(&self, mut order: TransferOrder) -> Result<TransferOrder, StoreError> {
        if order.routing_path.is_none() {
            order.routing_path =
                self.routes()
                    .route(&order.currency, &order.credit_account_id, &order.debit_account_id);
            tracing::debug!(
                order_id = %order.order_id,
                routing_path = order.routing_path.as_deref().unwrap_or(""),
                "routing path resolved"
            );
        }
        self.store.save(&order).await?;
        self.drive(order).await
    }

    /// Continue a stored order from wherever it stopped.
    pub async fn resume(&self, order_id: &str) -> Result<TransferOrder, StoreError> {
        let order = self
            .store
            .load(order_id)
            .await?
            .ok_or_else(|| StoreError(format!("order {order_id} not found")))?;
        self.drive(order).await
    }

    /// Resume every unfinished order, e.g. after a restart.
    pub async fn resume_all(&self) -> Result<Vec<TransferOrder>, StoreError> {
        let active = self.store.list_active().await?;
        let runs = active.into_iter().map(|o| self.drive(o));
        futures::future::join_all(runs).await.into_iter().collect()
    }

    async fn drive(&self, mut order: TransferOrder) -> Result<TransferOrder, StoreError> {
        self.terminal.directory().ready().await;
        if order.current_tx_account_id.is_none() && !order.status.is_terminal() {
            if let Err(e) = order.advance(now_ms()) {
                order.fail(e.to_string());
            }
            self.store.save(&order).await?;
        }
        loop {
            if order.expire(now_ms()) {
                self.store.save(&order).await?;
                break;
            }
            match order.next_step() {
                Step::Done => break,
                Step::Apply => {
                    let res = self.call(METHOD_APPLY, &order).await;
                    let next = order.on_apply(&res, now_ms());
                    self.store.save(&order).await?;
                    if next == Step::Apply {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
                Step::Eval => {
                    let res = self.call(METHOD_EVAL, &order).await;
                    let next = match order.on_eval(&res, now_ms()) {
                        Ok(step) => step,
                        Err(e) => order.fail(e.to_string()),
                    };
                    self.store.save(&order).await?;
                    if next == Step::Eval {
                        tokio::time::sleep(self.poll_interval).await;
                    }
                }
            }
        }
        tracing::info!(
            order_id = %order.order_id,
            status = ?order.status,
            error = order.error_message.as_deref().unwrap_or(""),
            "transfer finished"
        );
        Ok(order)
    }

    async fn call(&self, method: &str, order: &TransferOrder) -> Response {
        let outcome = match self.terminal.request_service(method, order.to_request()) {
            Ok(call) => call.response().await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(res) => res,
            Err(CallError::NoProvider { .. }) => refusal(MSG_UNKNOWN_ROUTING),
            Err(e) => {
                tracing::debug!(order_id = %order.order_id, %method, error = %e, "transfer call failed");
                Response::new(termnet_core::envelope::CODE_TIMEOUT, e.to_string())
            }
        }
    }
}
