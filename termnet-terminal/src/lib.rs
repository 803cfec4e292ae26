//! Terminal Network client runtime on tokio.
//! One [`Terminal`] per process identity: it serves methods, calls others
//! through the host, shares channels and drives transfer orders.

pub mod channel;
pub mod client;
pub mod config;
pub mod directory;
pub mod failover;
pub mod metrics;
pub mod server;
pub mod terminal;
pub mod transfer;
pub mod transport;

pub use channel::Feed;
pub use client::{response_data, CallError, Reply, RequestStream};
pub use config::{ConfigError, TerminalConfig};
pub use directory::Directory;
pub use failover::{FailoverError, RotateOutcome, Standby, Supervisor};
pub use metrics::{Metrics, MetricsError};
pub use server::{streaming, unary, Handler, HandlerError, Output, Request, ServiceOptions};
pub use terminal::{Terminal, TerminalOptions};
pub use transfer::{
    AddressEntry, ApplyHandler, EvalHandler, MemoryOrderStore, OrderStore, StoreError,
    TransferAddressBook, TransferDriver,
};
pub use transport::{Link, LinkEvent, MemoryPeer, TransportError};
