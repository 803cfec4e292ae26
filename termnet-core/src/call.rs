//! In-flight call bookkeeping on the caller side.
//!
//! `SENT -> FRAME* -> RESOLVED | TIMED_OUT | ABORTED`. Every terminal state
//! frees the trace id; a second terminal transition is a no-op.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::envelope::Kind;

/// Time allowed for the first envelope of a call.
pub const FIRST_TIMEOUT: Duration = Duration::from_secs(30);
/// Time allowed between subsequent envelopes.
pub const EACH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Sent,
    Streaming,
    Resolved,
    TimedOut,
    Aborted,
}

impl CallState {
    pub fn is_finished(self) -> bool {
        matches!(self, CallState::Resolved | CallState::TimedOut | CallState::Aborted)
    }
}

#[derive(Debug)]
pub struct InFlightCall<T> {
    pub target_terminal_id: String,
    pub method: String,
    pub started_at: Instant,
    pub deadline: Instant,
    pub frames: u64,
    pub state: CallState,
    /// Where envelopes for this trace are handed to the caller.
    pub sink: T,
}

/// Calls keyed by trace id. `T` is the per-call delivery handle.
pub struct CallTable<T> {
    calls: HashMap<String, InFlightCall<T>>,
    first_timeout: Duration,
    each_timeout: Duration,
}

impl<T> Default for CallTable<T> {
    fn default() -> Self {
        Self::new(FIRST_TIMEOUT, EACH_TIMEOUT)
    }
}

impl<T> CallTable<T> {
    pub fn new(first_timeout: Duration, each_timeout: Duration) -> Self {
        Self {
            calls: HashMap::new(),
            first_timeout,
            each_timeout,
        }
    }

    pub fn open(&mut self, trace_id: &str, target: &str, method: &str, sink: T, now: Instant) {
        self.calls.insert(
            trace_id.to_string(),
            InFlightCall {
                target_terminal_id: target.to_string(),
                method: method.to_string(),
                started_at: now,
                deadline: now + self.first_timeout,
                frames: 0,
                state: CallState::Sent,
                sink,
            },
        );
    }

    /// Record an incoming envelope for `trace_id`. Returns the sink to deliver it to,
    /// or `None` for unknown (already finished) traces. A response finishes the call,
    /// so its sink is handed back by value.
    pub fn deliver(&mut self, trace_id: &str, kind: Kind, now: Instant) -> Option<Delivery<'_, T>> {
        match kind {
            Kind::Response => {
                let mut call = self.calls.remove(trace_id)?;
                call.state = CallState::Resolved;
                Some(Delivery::Last(call.sink))
            }
            Kind::Frame | Kind::Keepalive => {
                let call = self.calls.get_mut(trace_id)?;
                if kind == Kind::Frame {
                    call.frames += 1;
                    call.state = CallState::Streaming;
                }
                call.deadline = now + self.each_timeout;
                Some(Delivery::More(&call.sink))
            }
            Kind::Request | Kind::Cancel => None,
        }
    }

    pub fn deadline(&self, trace_id: &str) -> Option<Instant> {
        self.calls.get(trace_id).map(|c| c.deadline)
    }

    pub fn state(&self, trace_id: &str) -> Option<CallState> {
        self.calls.get(trace_id).map(|c| c.state)
    }

    /// Abandon a live call. Returns it the first time only.
    pub fn cancel(&mut self, trace_id: &str) -> Option<InFlightCall<T>> {
        self.finish(trace_id, CallState::Aborted)
    }

    /// The caller's deadline for `trace_id` fired.
    pub fn time_out(&mut self, trace_id: &str) -> Option<InFlightCall<T>> {
        self.finish(trace_id, CallState::TimedOut)
    }

    /// Remove every call whose deadline has passed.
    pub fn expire(&mut self, now: Instant) -> Vec<(String, InFlightCall<T>)> {
        let expired: Vec<String> = self
            .calls
            .iter()
            .filter(|(_, c)| c.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|id| {
                let call = self.finish(&id, CallState::TimedOut)?;
                Some((id, call))
            })
            .collect()
    }

    /// Fail every call routed to `target` (its connection was replaced or lost).
    pub fn abort_target(&mut self, target: &str) -> Vec<InFlightCall<T>> {
        let ids: Vec<String> = self
            .calls
            .iter()
            .filter(|(_, c)| c.target_terminal_id == target)
            .map(|(id, _)| id.clone())
            .collect();
        ids.iter()
            .filter_map(|id| self.finish(id, CallState::Aborted))
            .collect()
    }

    /// Every live call, e.g. when the local connection drops.
    pub fn abort_all(&mut self) -> Vec<InFlightCall<T>> {
        self.calls
            .drain()
            .map(|(_, mut c)| {
                c.state = CallState::Aborted;
                c
            })
            .collect()
    }

    fn finish(&mut self, trace_id: &str, state: CallState) -> Option<InFlightCall<T>> {
        let mut call = self.calls.remove(trace_id)?;
        call.state = state;
        Some(call)
    }

    pub fn contains(&self, trace_id: &str) -> bool {
        self.calls.contains_key(trace_id)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

pub enum Delivery<'a, T> {
    More(&'a T),
    Last(T),
}
