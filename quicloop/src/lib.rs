//! quicloop: connection orchestration for a QUIC engine
//!
//! Drives a [`ProtocolEngine`](quicloop_engine::ProtocolEngine) over UDP:
//! connection-ID demultiplexing, stateless Retry, Version Negotiation,
//! timeout scheduling and the stream read loop, for one client connection or
//! a server with many.
//!
//! # Module Organization
//!
//! - `connection`: engine handle plus routing identity
//! - `token`: address validation tokens for Retry
//! - `routing`: connection IDs, registry and packet dispatcher
//! - `timeout`: next-deadline computation and timer delivery
//! - `stream_io`: non-blocking stream drain
//! - `apps`: the HTTP/0.9 request/response both sides speak
//! - `session`: client and server event loops
//! - `config`, `telemetry`, `netio`: configuration, logging and sockets

pub mod apps;
pub mod config;
pub mod connection;
pub mod error;
pub mod netio;
pub mod routing;
pub mod session;
pub mod stream_io;
pub mod telemetry;
pub mod timeout;
pub mod token;

pub use connection::{Connection, ConnectionState};
pub use error::{Error, Result};
pub use session::{ClientReport, ClientSession, ClientState, ServerSession};

/// Engine the binary runs with.
#[cfg(feature = "quiche")]
pub type DefaultEngine = quicloop_engine::QuicheEngine;

/// Engine the binary runs with.
#[cfg(not(feature = "quiche"))]
pub type DefaultEngine = quicloop_engine::SimEngine;
