//! Transfer Order saga: the record both sides update and the pure transitions
//! the orchestrator applies to it.
//!
//! A transfer walks a routing path of hops
//! `tx_account / tx_address / network / rx_address / rx_account` (encoded with
//! [`encode_path`](crate::path::encode_path), consecutive hops share the account).
//! Per hop: `AWAIT_DEBIT` while `TransferApply` pushes funds out of the tx side,
//! `AWAIT_CREDIT` while `TransferEval` polls the rx side for receipt.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::Response;
use crate::path::{decode_path, encode_path};
use crate::schema::{JsonType, Schema};

pub const METHOD_APPLY: &str = "TransferApply";
pub const METHOD_EVAL: &str = "TransferEval";

pub const STATE_INIT: &str = "INIT";
pub const STATE_PENDING: &str = "PENDING";
pub const STATE_COMPLETE: &str = "COMPLETE";
pub const STATE_ERROR: &str = "ERROR";

const APPLY_KEYS: [&str; 4] = [
    "current_tx_account_id",
    "currency",
    "current_network_id",
    "current_tx_address",
];
const EVAL_KEYS: [&str; 4] = [
    "current_rx_account_id",
    "currency",
    "current_network_id",
    "current_rx_address",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    AwaitDebit,
    AwaitCredit,
    Complete,
    Error,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Complete | OrderStatus::Error)
    }
}

/// Durable saga record. Everything the orchestrator needs to resume lives here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferOrder {
    pub order_id: String,
    /// Unix millis.
    pub created_at: u64,
    pub updated_at: u64,
    pub credit_account_id: String,
    pub debit_account_id: String,
    pub currency: String,
    pub expected_amount: f64,
    pub status: OrderStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_at: Option<u64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub debit_methods: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credit_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transferred_amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_amount: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_tx_account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_rx_account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_tx_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_rx_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_network_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_tx_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_tx_context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_transaction_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_rx_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_rx_context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_started_at: Option<u64>,
}

/// One leg of the routing path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hop {
    pub tx_account_id: String,
    pub tx_address: String,
    pub network_id: String,
    pub rx_address: String,
    pub rx_account_id: String,
}

impl Hop {
    pub fn new(
        tx_account_id: &str,
        tx_address: &str,
        network_id: &str,
        rx_address: &str,
        rx_account_id: &str,
    ) -> Self {
        Self {
            tx_account_id: tx_account_id.into(),
            tx_address: tx_address.into(),
            network_id: network_id.into(),
            rx_address: rx_address.into(),
            rx_account_id: rx_account_id.into(),
        }
    }
}

/// Encode consecutive hops as `acc/addr/net/addr/acc/addr/net/addr/acc...`.
pub fn routing_path(hops: &[Hop]) -> Option<String> {
    let first = hops.first()?;
    let mut segments = vec![first.tx_account_id.as_str()];
    for hop in hops {
        segments.extend([
            hop.tx_address.as_str(),
            hop.network_id.as_str(),
            hop.rx_address.as_str(),
            hop.rx_account_id.as_str(),
        ]);
    }
    Some(encode_path(&segments))
}

/// What the orchestrator should do next with an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Apply,
    Eval,
    Done,
}

/// Payload of a successful `TransferApply` response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplyOutcome {
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ApplyOutcome {
    pub fn complete(transaction_id: impl Into<String>) -> Self {
        Self {
            state: STATE_COMPLETE.into(),
            transaction_id: Some(transaction_id.into()),
            ..Default::default()
        }
    }

    pub fn pending(context: impl Into<String>) -> Self {
        Self {
            state: STATE_PENDING.into(),
            context: Some(context.into()),
            ..Default::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            state: STATE_ERROR.into(),
            message: Some(message.into()),
            ..Default::default()
        }
    }
}

/// Payload of a successful `TransferEval` response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalOutcome {
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_amount: Option<f64>,
}

impl EvalOutcome {
    pub fn complete(received_amount: f64) -> Self {
        Self {
            state: STATE_COMPLETE.into(),
            received_amount: Some(received_amount),
            ..Default::default()
        }
    }

    pub fn pending() -> Self {
        Self {
            state: STATE_PENDING.into(),
            ..Default::default()
        }
    }
}

impl TransferOrder {
    pub fn new(
        order_id: impl Into<String>,
        credit_account_id: impl Into<String>,
        debit_account_id: impl Into<String>,
        currency: impl Into<String>,
        expected_amount: f64,
        now: u64,
    ) -> Self {
        Self {
            order_id: order_id.into(),
            created_at: now,
            updated_at: now,
            credit_account_id: credit_account_id.into(),
            debit_account_id: debit_account_id.into(),
            currency: currency.into(),
            expected_amount,
            status: OrderStatus::AwaitDebit,
            error_message: None,
            timeout_at: None,
            debit_methods: Vec::new(),
            credit_method: None,
            transferred_amount: None,
            transaction_id: None,
            received_amount: None,
            routing_path: None,
            current_tx_account_id: None,
            current_rx_account_id: None,
            current_tx_address: None,
            current_rx_address: None,
            current_network_id: None,
            current_tx_state: None,
            current_tx_context: None,
            current_transaction_id: None,
            current_rx_state: None,
            current_rx_context: None,
            current_amount: None,
            current_step_started_at: None,
        }
    }

    pub fn with_route(mut self, hops: &[Hop]) -> Self {
        self.routing_path = routing_path(hops);
        self
    }

    /// Next action for a stored order, used when a driver resumes it.
    pub fn next_step(&self) -> Step {
        match self.status {
            OrderStatus::Complete | OrderStatus::Error => Step::Done,
            OrderStatus::AwaitCredit => Step::Eval,
            OrderStatus::AwaitDebit => Step::Apply,
        }
    }

    /// Point the `current_*` fields at the hop starting at `current_rx_account_id`
    /// (or the first hop). Completes the order when the debit account is reached.
    pub fn advance(&mut self, now: u64) -> Result<Step, TransferError> {
        let path = self
            .routing_path
            .as_deref()
            .ok_or(TransferError::NoRoute)?;
        let route = decode_path(path);
        if route.len() < 5 || (route.len() - 1) % 4 != 0 {
            return Err(TransferError::BadRoute(path.to_string()));
        }
        if route.last().map(String::as_str) != Some(self.debit_account_id.as_str()) {
            return Err(TransferError::BadRoute(path.to_string()));
        }

        let start = match &self.current_rx_account_id {
            None => 0,
            Some(rx) if *rx == self.debit_account_id => {
                self.status = OrderStatus::Complete;
                self.updated_at = now;
                return Ok(Step::Done);
            }
            Some(rx) => route
                .iter()
                .step_by(4)
                .position(|acc| acc == rx)
                .map(|i| i * 4)
                .ok_or_else(|| TransferError::BadRoute(path.to_string()))?,
        };
        if start + 4 >= route.len() {
            return Err(TransferError::BadRoute(path.to_string()));
        }

        self.current_tx_account_id = Some(route[start].clone());
        self.current_tx_address = Some(route[start + 1].clone());
        self.current_network_id = Some(route[start + 2].clone());
        self.current_rx_address = Some(route[start + 3].clone());
        self.current_rx_account_id = Some(route[start + 4].clone());
        self.current_tx_state = None;
        self.current_tx_context = None;
        self.current_transaction_id = None;
        self.current_rx_state = None;
        self.current_rx_context = None;
        self.current_amount = Some(self.current_amount.unwrap_or(self.expected_amount));
        self.current_step_started_at = Some(now);
        self.status = OrderStatus::AwaitDebit;
        self.updated_at = now;
        Ok(Step::Apply)
    }

    /// Fold a `TransferApply` response into the order.
    pub fn on_apply(&mut self, res: &Response, now: u64) -> Step {
        if self.status != OrderStatus::AwaitDebit {
            // Funds already left the tx side for this hop; never apply twice.
            return self.next_step();
        }
        self.updated_at = now;
        let outcome: Option<ApplyOutcome> = res
            .data
            .clone()
            .and_then(|d| serde_json::from_value(d).ok());
        if !res.is_ok() {
            // Only an explicit ERROR state is final; timeouts and 5xx are retried.
            let fatal = outcome.as_ref().is_some_and(|o| o.state == STATE_ERROR);
            if fatal {
                self.current_tx_state = Some(STATE_ERROR.into());
                return self.fail(format!("{}: {}", METHOD_APPLY, res.message));
            }
            return Step::Apply;
        }
        let Some(outcome) = outcome else {
            return self.fail(format!("{}: malformed response", METHOD_APPLY));
        };
        match outcome.state.as_str() {
            STATE_COMPLETE => {
                self.current_tx_state = Some(STATE_COMPLETE.into());
                self.current_transaction_id = outcome.transaction_id.clone();
                self.transaction_id = outcome.transaction_id;
                self.transferred_amount = self.current_amount;
                self.status = OrderStatus::AwaitCredit;
                Step::Eval
            }
            STATE_ERROR => {
                let msg = outcome.message.unwrap_or_else(|| "vendor error".into());
                self.current_tx_state = Some(STATE_ERROR.into());
                self.fail(msg)
            }
            _ => {
                self.current_tx_state = Some(outcome.state);
                if outcome.context.is_some() {
                    self.current_tx_context = outcome.context;
                }
                Step::Apply
            }
        }
    }

    /// Fold a `TransferEval` response into the order. Non-zero codes are retried.
    pub fn on_eval(&mut self, res: &Response, now: u64) -> Result<Step, TransferError> {
        if self.status != OrderStatus::AwaitCredit {
            return Ok(self.next_step());
        }
        self.updated_at = now;
        if !res.is_ok() {
            return Ok(Step::Eval);
        }
        let outcome: EvalOutcome = match res.data.clone().map(serde_json::from_value) {
            Some(Ok(o)) => o,
            _ => return Ok(Step::Eval),
        };
        match outcome.state.as_str() {
            STATE_COMPLETE => {
                self.current_rx_state = Some(STATE_COMPLETE.into());
                self.received_amount = outcome.received_amount;
                if let Some(amount) = outcome.received_amount {
                    self.current_amount = Some(amount);
                }
                self.advance(now)
            }
            STATE_ERROR => {
                self.current_rx_state = Some(STATE_ERROR.into());
                Ok(self.fail(format!("{}: receipt failed", METHOD_EVAL)))
            }
            _ => {
                self.current_rx_state = Some(outcome.state);
                if outcome.context.is_some() {
                    self.current_rx_context = outcome.context;
                }
                Ok(Step::Eval)
            }
        }
    }

    /// Fail the order if its deadline has passed.
    pub fn expire(&mut self, now: u64) -> bool {
        match self.timeout_at {
            Some(t) if now >= t && !self.status.is_terminal() => {
                self.fail("Timeout".to_string());
                true
            }
            _ => false,
        }
    }

    pub fn fail(&mut self, message: String) -> Step {
        self.status = OrderStatus::Error;
        self.error_message = Some(message);
        Step::Done
    }

    pub fn to_request(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Account address served by one terminal for both saga services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferAddress {
    pub account_id: String,
    pub currency: String,
    pub network_id: String,
    pub address: String,
}

impl TransferAddress {
    pub fn new(account_id: &str, currency: &str, network_id: &str, address: &str) -> Self {
        Self {
            account_id: account_id.into(),
            currency: currency.into(),
            network_id: network_id.into(),
            address: address.into(),
        }
    }

    pub fn is_tx_of(&self, order: &TransferOrder) -> bool {
        order.current_tx_account_id.as_deref() == Some(self.account_id.as_str())
            && order.currency == self.currency
            && order.current_network_id.as_deref() == Some(self.network_id.as_str())
            && order.current_tx_address.as_deref() == Some(self.address.as_str())
    }

    pub fn is_rx_of(&self, order: &TransferOrder) -> bool {
        order.current_rx_account_id.as_deref() == Some(self.account_id.as_str())
            && order.currency == self.currency
            && order.current_network_id.as_deref() == Some(self.network_id.as_str())
            && order.current_rx_address.as_deref() == Some(self.address.as_str())
    }

    fn pins(&self, keys: &[&'static str; 4]) -> Schema {
        Schema::Object {
            required: Vec::new(),
            properties: [
                (keys[0].to_string(), Schema::Const(Value::String(self.account_id.clone()))),
                (keys[1].to_string(), Schema::Const(Value::String(self.currency.clone()))),
                (keys[2].to_string(), Schema::Const(Value::String(self.network_id.clone()))),
                (keys[3].to_string(), Schema::Const(Value::String(self.address.clone()))),
            ]
            .into_iter()
            .collect(),
        }
    }
}

fn routing_schema(keys: &[&'static str; 4], addresses: &[TransferAddress]) -> Schema {
    Schema::AllOf(vec![
        Schema::Type(JsonType::Object),
        Schema::object(keys, []),
        Schema::OneOf(addresses.iter().map(|a| a.pins(keys)).collect()),
    ])
}

/// `TransferApply` request schema for a set of addresses: one `const` branch each.
pub fn apply_schema(addresses: &[TransferAddress]) -> Schema {
    routing_schema(&APPLY_KEYS, addresses)
}

pub fn eval_schema(addresses: &[TransferAddress]) -> Schema {
    routing_schema(&EVAL_KEYS, addresses)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("order has no routing path")]
    NoRoute,
    #[error("routing path `{0}` is malformed")]
    BadRoute(String),
    #[error("order {0} not found")]
    NotFound(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn order() -> TransferOrder {
        TransferOrder::new("o1", "A", "B", "USDT", 100.0, 1_000)
            .with_route(&[Hop::new("A", "addr-a", "TRC20", "addr-b", "B")])
    }

    fn ok(data: Value) -> Response {
        Response::ok(data)
    }

    #[test]
    fn single_hop_happy_path() {
        let mut o = order();
        assert_eq!(o.advance(1_000).unwrap(), Step::Apply);
        assert_eq!(o.current_tx_account_id.as_deref(), Some("A"));
        assert_eq!(o.current_rx_address.as_deref(), Some("addr-b"));

        let pending = serde_json::to_value(ApplyOutcome::pending("wd-1")).unwrap();
        assert_eq!(o.on_apply(&ok(pending), 1_100), Step::Apply);
        assert_eq!(o.current_tx_context.as_deref(), Some("wd-1"));
        assert_eq!(o.status, OrderStatus::AwaitDebit);

        let done = serde_json::to_value(ApplyOutcome::complete("tx-9")).unwrap();
        assert_eq!(o.on_apply(&ok(done), 1_200), Step::Eval);
        assert_eq!(o.status, OrderStatus::AwaitCredit);
        assert_eq!(o.transaction_id.as_deref(), Some("tx-9"));

        let wait = serde_json::to_value(EvalOutcome::pending()).unwrap();
        assert_eq!(o.on_eval(&ok(wait), 1_300).unwrap(), Step::Eval);
        let got = serde_json::to_value(EvalOutcome::complete(99.5)).unwrap();
        assert_eq!(o.on_eval(&ok(got), 1_400).unwrap(), Step::Done);
        assert_eq!(o.status, OrderStatus::Complete);
        assert_eq!(o.received_amount, Some(99.5));
    }

    #[test]
    fn apply_after_complete_is_ignored() {
        let mut o = order();
        o.advance(0).unwrap();
        let done = serde_json::to_value(ApplyOutcome::complete("tx-1")).unwrap();
        o.on_apply(&ok(done), 1);
        let again = serde_json::to_value(ApplyOutcome::complete("tx-2")).unwrap();
        assert_eq!(o.on_apply(&ok(again), 2), Step::Eval);
        assert_eq!(o.transaction_id.as_deref(), Some("tx-1"));
    }

    #[test]
    fn unknown_routing_fails_order() {
        let mut o = order();
        o.advance(0).unwrap();
        let res = Response::new(400, "Unknown Routing").with_data(json!({"state": "ERROR"}));
        assert_eq!(o.on_apply(&res, 1), Step::Done);
        assert_eq!(o.status, OrderStatus::Error);
        assert!(o.error_message.unwrap().contains("Unknown Routing"));
    }

    #[test]
    fn apply_timeout_is_retried() {
        let mut o = order();
        o.advance(0).unwrap();
        assert_eq!(o.on_apply(&Response::new(504, "Gateway Timeout"), 1), Step::Apply);
        assert_eq!(o.status, OrderStatus::AwaitDebit);
        assert!(o.error_message.is_none());
    }

    #[test]
    fn eval_errors_are_retried() {
        let mut o = order();
        o.advance(0).unwrap();
        o.on_apply(&ok(serde_json::to_value(ApplyOutcome::complete("t")).unwrap()), 1);
        assert_eq!(o.on_eval(&Response::new(504, "Gateway Timeout"), 2).unwrap(), Step::Eval);
        assert_eq!(o.status, OrderStatus::AwaitCredit);
    }

    #[test]
    fn two_hops_walk_the_path() {
        let mut o = TransferOrder::new("o2", "A", "C", "USDT", 10.0, 0).with_route(&[
            Hop::new("A", "a1", "SPOT", "b1", "B"),
            Hop::new("B", "b2", "TRC20", "c1", "C"),
        ]);
        o.advance(0).unwrap();
        o.on_apply(&ok(serde_json::to_value(ApplyOutcome::complete("t1")).unwrap()), 1);
        let step = o
            .on_eval(&ok(serde_json::to_value(EvalOutcome::complete(10.0)).unwrap()), 2)
            .unwrap();
        assert_eq!(step, Step::Apply);
        assert_eq!(o.current_tx_account_id.as_deref(), Some("B"));
        assert_eq!(o.current_tx_address.as_deref(), Some("b2"));
        assert_eq!(o.current_rx_account_id.as_deref(), Some("C"));
        assert_eq!(o.current_tx_state, None);
        assert_eq!(o.status, OrderStatus::AwaitDebit);
    }

    #[test]
    fn missing_route_is_an_error() {
        let mut o = TransferOrder::new("o3", "A", "B", "USDT", 1.0, 0);
        assert_eq!(o.advance(0), Err(TransferError::NoRoute));
        o.routing_path = Some("A/x/y".into());
        assert!(matches!(o.advance(0), Err(TransferError::BadRoute(_))));
    }

    #[test]
    fn expire_only_live_orders() {
        let mut o = order();
        o.timeout_at = Some(500);
        assert!(!o.expire(499));
        assert!(o.expire(500));
        assert_eq!(o.status, OrderStatus::Error);
        assert!(!o.expire(600));
    }

    #[test]
    fn apply_schema_routes_by_address() {
        let addrs = [
            TransferAddress::new("A", "USDT", "TRC20", "addr-a"),
            TransferAddress::new("B", "USDT", "TRC20", "addr-b"),
        ];
        let schema = apply_schema(&addrs);
        let mut o = order();
        o.advance(0).unwrap();
        assert!(schema.matches(&o.to_request()));
        assert!(addrs[0].is_tx_of(&o));
        assert!(!addrs[1].is_tx_of(&o));
        o.current_tx_address = Some("elsewhere".into());
        assert!(!schema.matches(&o.to_request()));
        assert!(eval_schema(&addrs).matches(&{
            let mut o = order();
            o.advance(0).unwrap();
            o.to_request()
        }));
    }
}
