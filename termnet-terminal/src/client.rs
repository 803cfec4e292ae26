//! Caller side: one [`RequestStream`] per outbound call.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use serde_json::Value;
use termnet_core::{Envelope, Kind, Response};
use tokio::sync::mpsc;
use tokio::time::{Instant, Sleep};

use crate::terminal::{lock, Inner};

/// What a caller observes: zero or more frames, then exactly one response.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Frame(Value),
    Response(Response),
}

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("no terminal provides {method} for this request")]
    NoProvider { method: String },
    #[error("call timed out")]
    Timeout,
    #[error("call aborted")]
    Aborted,
    #[error("remote error {code}: {message}")]
    Remote { code: u16, message: String },
    #[error("response data: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Envelopes for one trace. Dropping it before the response cancels the call.
pub struct RequestStream {
    inner: Arc<Inner>,
    trace_id: String,
    target: String,
    rx: mpsc::UnboundedReceiver<Envelope>,
    sleep: Pin<Box<Sleep>>,
    finished: bool,
}

impl RequestStream {
    pub(crate) fn open(inner: Arc<Inner>, method: &str, target: &str, req: Value) -> Self {
        let trace_id = termnet_core::envelope::new_trace_id();
        let (tx, rx) = mpsc::unbounded_channel();
        let now = Instant::now();
        let deadline = {
            let mut calls = lock(&inner.calls);
            calls.open(&trace_id, target, method, tx, now.into_std());
            calls.deadline(&trace_id).map(Instant::from_std).unwrap_or(now)
        };
        tracing::trace!(%trace_id, %method, %target, "request sent");
        inner.send(&Envelope::request(
            trace_id.clone(),
            inner.terminal_id.clone(),
            target,
            method,
            req,
        ));
        Self {
            inner,
            trace_id,
            target: target.to_string(),
            rx,
            sleep: Box::pin(tokio::time::sleep_until(deadline)),
            finished: false,
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Skip frames and wait for the response.
    pub async fn response(mut self) -> Result<Response, CallError> {
        while let Some(reply) = self.next().await {
            if let Reply::Response(res) = reply? {
                return Ok(res);
            }
        }
        Err(CallError::Aborted)
    }

    /// Give up on the call. Does nothing once it has finished.
    pub fn cancel(mut self) {
        self.abandon();
    }

    fn abandon(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        let live = lock(&self.inner.calls).cancel(&self.trace_id).is_some();
        if live {
            tracing::debug!(trace_id = %self.trace_id, "call cancelled");
            self.send_cancel();
        }
    }

    fn send_cancel(&self) {
        self.inner.send(&Envelope::cancel(
            &self.trace_id,
            &self.inner.terminal_id,
            &self.target,
        ));
    }
}

impl Stream for RequestStream {
    type Item = Result<Reply, CallError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.finished {
            return Poll::Ready(None);
        }
        loop {
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(env)) => match env.kind() {
                    Kind::Response => {
                        this.finished = true;
                        let res = env.res.unwrap_or_else(|| Response::new(0, ""));
                        return Poll::Ready(Some(Ok(Reply::Response(res))));
                    }
                    Kind::Frame => {
                        let frame = env.frame.unwrap_or(Value::Null);
                        return Poll::Ready(Some(Ok(Reply::Frame(frame))));
                    }
                    _ => continue,
                },
                Poll::Ready(None) => {
                    // The engine dropped our sink: disconnect or shutdown.
                    this.finished = true;
                    return Poll::Ready(Some(Err(CallError::Aborted)));
                }
                Poll::Pending => break,
            }
        }
        loop {
            if this.sleep.as_mut().poll(cx).is_pending() {
                return Poll::Pending;
            }
            // Frames and keepalives move the deadline; re-arm if it did.
            let deadline = lock(&this.inner.calls)
                .deadline(&this.trace_id)
                .map(Instant::from_std);
            match deadline {
                Some(d) if d > Instant::now() => this.sleep.as_mut().reset(d),
                _ => {
                    this.finished = true;
                    if lock(&this.inner.calls).time_out(&this.trace_id).is_some() {
                        tracing::debug!(trace_id = %this.trace_id, "call timed out");
                        this.send_cancel();
                    }
                    return Poll::Ready(Some(Err(CallError::Timeout)));
                }
            }
        }
    }
}

impl Drop for RequestStream {
    fn drop(&mut self) {
        self.abandon();
    }
}

/// Decode a successful response's `data`.
pub fn response_data<T: serde::de::DeserializeOwned>(res: Response) -> Result<T, CallError> {
    if !res.is_ok() {
        return Err(CallError::Remote {
            code: res.code,
            message: res.message,
        });
    }
    Ok(serde_json::from_value(res.data.unwrap_or(Value::Null))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_of_error_response_is_remote_error() {
        let err = response_data::<Value>(Response::new(503, "Service Unavailable")).unwrap_err();
        assert!(matches!(err, CallError::Remote { code: 503, .. }));
        let n: u32 = response_data(Response::ok(serde_json::json!(7))).unwrap();
        assert_eq!(n, 7);
    }
}
