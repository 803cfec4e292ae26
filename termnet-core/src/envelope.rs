//! Envelope: one JSON object per frame after admission.
//! The host only ever reads `target_terminal_id` (see [`peek_target`]).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Largest envelope either side accepts in one message (16 MiB).
pub const MAX_ENVELOPE_LEN: usize = 16 * 1024 * 1024;

/// Address of the realm-local terminal that serves the bootstrap services.
pub const HOST_TERMINAL_ID: &str = "@host";

pub const CODE_OK: u16 = 0;
pub const CODE_BAD_REQUEST: u16 = 400;
pub const CODE_FORBIDDEN: u16 = 403;
pub const CODE_TOO_MANY_REQUESTS: u16 = 429;
pub const CODE_INTERNAL: u16 = 500;
pub const CODE_UNAVAILABLE: u16 = 503;
pub const CODE_TIMEOUT: u16 = 504;

pub const MSG_OK: &str = "OK";
pub const MSG_UNKNOWN_ROUTING: &str = "Unknown Routing";
pub const MSG_UNKNOWN_STATE: &str = "Unknown State";
pub const MSG_METHOD_NOT_FOUND: &str = "Method Not Found";
pub const MSG_UNAVAILABLE: &str = "Service Unavailable";
pub const MSG_FORBIDDEN: &str = "Forbidden";

/// Final response carried in `res`. `code == 0` is success; anything else is an application error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub code: u16,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Response {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn ok(data: Value) -> Self {
        Self::new(CODE_OK, MSG_OK).with_data(data)
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn is_ok(&self) -> bool {
        self.code == CODE_OK
    }
}

/// Wire message. Exactly which optional fields are set decides its [`Kind`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub trace_id: String,
    #[serde(default)]
    pub source_terminal_id: String,
    #[serde(default)]
    pub target_terminal_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub req: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub res: Option<Response>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub done: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Carries `res`; ends the call.
    Response,
    /// Intermediate streaming payload.
    Frame,
    /// Caller gave up on the call.
    Cancel,
    Request,
    /// Nothing but a trace id; resets the caller's per-frame deadline.
    Keepalive,
}

impl Envelope {
    pub fn request(
        trace_id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
        method: impl Into<String>,
        req: Value,
    ) -> Self {
        Self {
            trace_id: trace_id.into(),
            source_terminal_id: source.into(),
            target_terminal_id: target.into(),
            method: Some(method.into()),
            req: Some(req),
            ..Default::default()
        }
    }

    /// Empty envelope travelling back to this envelope's sender on the same trace.
    pub fn reply(&self, from_terminal_id: &str) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            source_terminal_id: from_terminal_id.to_string(),
            target_terminal_id: self.source_terminal_id.clone(),
            method: self.method.clone(),
            ..Default::default()
        }
    }

    pub fn with_frame(mut self, frame: Value) -> Self {
        self.frame = Some(frame);
        self
    }

    pub fn with_response(mut self, res: Response) -> Self {
        self.res = Some(res);
        self.done = true;
        self
    }

    /// Cancel notice sent by a caller for one of its own calls.
    pub fn cancel(trace_id: &str, source: &str, target: &str) -> Self {
        Self {
            trace_id: trace_id.to_string(),
            source_terminal_id: source.to_string(),
            target_terminal_id: target.to_string(),
            done: true,
            ..Default::default()
        }
    }

    pub fn kind(&self) -> Kind {
        if self.res.is_some() {
            Kind::Response
        } else if self.frame.is_some() {
            Kind::Frame
        } else if self.done {
            Kind::Cancel
        } else if self.method.is_some() && self.req.is_some() {
            Kind::Request
        } else {
            Kind::Keepalive
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Fresh correlation id for a new call.
pub fn new_trace_id() -> String {
    Uuid::new_v4().to_string()
}

/// Minimal view the relay parses; every other field is skipped unread.
#[derive(Debug, Deserialize)]
pub struct EnvelopeHeader {
    #[serde(default)]
    pub target_terminal_id: String,
}

/// Destination of a raw envelope frame. Empty target means the host terminal.
pub fn peek_target(bytes: &[u8]) -> Result<String, serde_json::Error> {
    let header: EnvelopeHeader = serde_json::from_slice(bytes)?;
    if header.target_terminal_id.is_empty() {
        return Ok(HOST_TERMINAL_ID.to_string());
    }
    Ok(header.target_terminal_id)
}
