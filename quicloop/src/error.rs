//! Error type for the orchestration layer.

use std::net::AddrParseError;

use thiserror::Error;

/// Errors that end a client or server session.
///
/// Per-connection engine failures are handled inside the sessions by closing
/// the affected connection; only what surfaces here is fatal.
#[derive(Debug, Error)]
pub enum Error {
    /// Socket failure other than a receive timeout.
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    /// Engine failure that could not be confined to one connection.
    #[error("engine error: {0}")]
    Engine(#[from] quicloop_engine::Error),

    /// The OS random source failed while minting IDs or secrets.
    #[error("random source failed: {0}")]
    Random(#[from] getrandom::Error),

    /// Malformed HTTP/0.9 request line.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid address {addr:?}: {source}")]
    Address {
        addr: String,
        #[source]
        source: AddrParseError,
    },
}

impl Error {
    pub fn address(addr: &str, source: AddrParseError) -> Self {
        Error::Address {
            addr: addr.to_string(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
