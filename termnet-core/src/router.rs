//! Schema router: picks one of several same-named handlers by structural match,
//! plus the debounce counter used when routes are rebuilt at runtime.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::envelope::{MSG_UNKNOWN_ROUTING, MSG_UNKNOWN_STATE, MSG_METHOD_NOT_FOUND};
use crate::schema::{self, JsonSchemaValidator, Schema, Validator};

/// What `register` does with a schema that cannot be proven disjoint from an earlier one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverlapPolicy {
    /// Accept it and log a warning; the earlier registration keeps winning.
    #[default]
    Warn,
    /// Refuse the registration.
    Reject,
}

struct Route<H> {
    schema: Schema,
    handler: H,
}

/// Ordered `(schema, handler)` list for one method. First schema that validates wins.
pub struct SchemaRouter<H> {
    method: String,
    routes: Vec<Route<H>>,
    validator: Arc<dyn Validator>,
    policy: OverlapPolicy,
}

impl<H> SchemaRouter<H> {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            routes: Vec::new(),
            validator: Arc::new(JsonSchemaValidator::default()),
            policy: OverlapPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: OverlapPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Append a route. Returns its position in match order.
    pub fn register(&mut self, schema: Schema, handler: H) -> Result<usize, RouteError> {
        if let Some(existing) = self
            .routes
            .iter()
            .position(|r| !schema::disjoint(&r.schema, &schema))
        {
            match self.policy {
                OverlapPolicy::Reject => {
                    return Err(RouteError::Overlap {
                        method: self.method.clone(),
                        existing,
                    });
                }
                OverlapPolicy::Warn => {
                    tracing::warn!(
                        method = %self.method,
                        existing,
                        "schema may overlap an earlier registration; earlier one wins"
                    );
                }
            }
        }
        self.routes.push(Route { schema, handler });
        Ok(self.routes.len() - 1)
    }

    pub fn route(&self, req: &Value) -> Result<&H, RouteError> {
        self.routes
            .iter()
            .find(|r| self.validator.validate(&r.schema, req))
            .map(|r| &r.handler)
            .ok_or(RouteError::NoMatch)
    }

    /// Drop every route whose handler fails `keep`.
    pub fn retain(&mut self, mut keep: impl FnMut(&H) -> bool) {
        self.routes.retain(|r| keep(&r.handler));
    }

    pub fn schemas(&self) -> impl Iterator<Item = &Schema> {
        self.routes.iter().map(|r| &r.schema)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("{}", MSG_METHOD_NOT_FOUND)]
    MethodNotFound,
    #[error("{}", MSG_UNKNOWN_ROUTING)]
    NoMatch,
    #[error("{}", MSG_UNKNOWN_STATE)]
    UnknownState(String),
    #[error("schema for {method} overlaps registration #{existing}")]
    Overlap { method: String, existing: usize },
}

/// Coalesces bursts of changes into one flush.
///
/// Every `touch` bumps the generation and pushes the deadline to `now + window`.
/// `poll` yields the generation once the deadline has passed with no newer touch.
/// Time is passed in, never read, so callers can drive it from a paused clock.
#[derive(Debug, Clone)]
pub struct Debounce {
    window: Duration,
    generation: u64,
    deadline: Option<Instant>,
}

impl Debounce {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            generation: 0,
            deadline: None,
        }
    }

    pub fn touch(&mut self, now: Instant) -> u64 {
        self.generation += 1;
        self.deadline = Some(now + self.window);
        self.generation
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn poll(&mut self, now: Instant) -> Option<u64> {
        match self.deadline {
            Some(d) if now >= d => {
                self.deadline = None;
                Some(self.generation)
            }
            _ => None,
        }
    }
}
