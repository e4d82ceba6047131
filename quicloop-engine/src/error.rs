//! Engine Error Types
//!
//! One taxonomy covers every primitive of the protocol engine. `Done` is not a
//! failure: it means "no more work for this call" and callers short-circuit on
//! it. Everything else is a transport, stream or handshake failure that the
//! orchestration layer answers by closing the affected connection.

#![forbid(unsafe_code)]

use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Transport error code sent when the orchestration layer aborts a connection.
pub const INTERNAL_ERROR: u64 = 0x01;

/// Transport error code for a generic protocol violation.
pub const PROTOCOL_VIOLATION: u64 = 0x0a;

/// Unified error type for protocol-engine operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// There is no more work to do.
    #[error("nothing else to do")]
    Done,

    /// The provided buffer is too short.
    #[error("buffer is too short")]
    BufferTooShort,

    /// The packet cannot be parsed because its version is unknown.
    #[error("version is unknown")]
    UnknownVersion,

    /// The packet contains an invalid frame.
    #[error("frame is invalid")]
    InvalidFrame,

    /// The packet cannot be parsed.
    #[error("packet is invalid")]
    InvalidPacket,

    /// The connection is in a state that does not allow the operation.
    #[error("connection state is invalid")]
    InvalidState,

    /// The stream is in a state that does not allow the operation.
    #[error("stream {0} state is invalid")]
    InvalidStreamState(u64),

    /// The peer's transport parameters cannot be parsed.
    #[error("transport parameter is invalid")]
    InvalidTransportParam,

    /// A cryptographic operation failed.
    #[error("crypto operation failed")]
    CryptoFail,

    /// The TLS handshake failed.
    #[error("TLS failed")]
    TlsFail,

    /// The peer violated the local flow control limits.
    #[error("flow control limit was violated")]
    FlowControl,

    /// The peer violated the local stream limits.
    #[error("stream limit was violated")]
    StreamLimit,

    /// The received data exceeds the stream's final size.
    #[error("data exceeded stream's final size")]
    FinalSize,

    /// The engine rejected its configuration.
    #[error("engine configuration is invalid")]
    InvalidConfig,
}

impl Error {
    /// Returns true for the `Done` sentinel.
    pub fn is_done(&self) -> bool {
        matches!(self, Error::Done)
    }

    /// Transport error code carried in a CONNECTION_CLOSE frame for this error
    /// (RFC 9000 Section 20.1).
    pub fn to_wire(self) -> u64 {
        match self {
            Error::Done => 0x00,
            Error::InvalidFrame => 0x07,
            Error::InvalidStreamState(..) => 0x05,
            Error::InvalidTransportParam => 0x08,
            Error::FlowControl => 0x03,
            Error::StreamLimit => 0x04,
            Error::FinalSize => 0x06,
            Error::InvalidConfig => INTERNAL_ERROR,
            _ => PROTOCOL_VIOLATION,
        }
    }
}
