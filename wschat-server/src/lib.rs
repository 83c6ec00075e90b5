//! wschat relay server library
//!
//! Exposes the relay's components so the binary and the integration
//! tests drive the same code.

mod config;
mod connection;
mod registry;
mod server;
mod tls;

pub use config::ServerConfig;
pub use connection::{
    handle_connection, handle_message, ConnectionSettings, DEFAULT_HANDSHAKE_TIMEOUT,
    DEFAULT_LIVENESS_WINDOW,
};
pub use registry::{
    ConnectionHandle, ConnectionId, RelayRegistry, RouteOutcome, DEFAULT_MAX_PENDING,
};
pub use server::RelayServer;
pub use tls::load_acceptor;
