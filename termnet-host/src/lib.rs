//! Terminal Network host: admits terminals into realms and relays envelopes
//! between them, serving the bootstrap services from a host-local terminal.

mod bootstrap;
pub mod config;
pub mod server;

pub use config::HostConfig;
pub use server::{HostError, Relay, RelayHandle};
