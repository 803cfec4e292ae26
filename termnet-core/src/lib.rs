//! Terminal Network protocol core.
//! No I/O: identities, admission, envelopes, schema routing, transfer routes and the
//! state machines the terminal and host runtimes drive.

pub mod call;
pub mod envelope;
pub mod identity;
pub mod info;
pub mod path;
pub mod protocol;
pub mod realm;
pub mod rotation;
pub mod route;
pub mod router;
pub mod schema;
pub mod transfer;

pub use envelope::{Envelope, Kind, Response, HOST_TERMINAL_ID};
pub use identity::{derive_terminal_id, Keypair, PublicKey, Signature};
pub use info::{ServiceInfo, TerminalInfo};
pub use path::{decode_path, encode_path};
pub use protocol::{ConnectParams, PROTOCOL_VERSION};
pub use route::{RouteTable, TransferNetwork};
pub use router::{Debounce, RouteError, SchemaRouter};
pub use schema::{JsonSchemaValidator, Schema, Validator};
