//! A non-blocking RFC 6455 WebSocket server connection engine for Tokio.
//!
//! This crate owns the parts of running a WebSocket server that sit below the
//! application: accepting TCP (optionally TLS) connections, performing the HTTP Upgrade
//! handshake, parsing and reassembling frames into messages (including inbound
//! `permessage-deflate`), validating UTF-8, and managing the send queue and the
//! two-phase close handshake. It does not parse arbitrary HTTP (just the Upgrade
//! request), and it never masks outbound frames — servers don't.
//!
//! [`server::start_server`] is the easiest way in: it returns a channel of
//! [`server::Event`]s (new clients, messages, disconnects, errors) plus a shared
//! [`server::ClientRegistry`] for sending to or broadcasting across connections.

pub mod assembler;
pub mod config;
pub mod connection;
pub mod error;
pub mod extensions;
pub mod frame;
pub mod handshake;
pub mod inflate;
pub mod parser;
pub mod send;
pub mod server;
pub mod transport;
pub mod utf8;
mod utils;

pub use assembler::Message;
pub use config::{ServerConfig, WebSocketConfig};
pub use connection::{Connection, ConnectionEvent, ConnectionState};
pub use error::Error;
pub use server::{start_server, start_server_with_config, ClientRegistry, ConnectionId, Event, ServerHandle};
