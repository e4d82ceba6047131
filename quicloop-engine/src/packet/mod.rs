//! # Packet Layer (RFC 9000 Section 17)
//!
//! Version-independent header parsing, variable-length integers and the
//! stateless packets (Version Negotiation, Retry) a server sends before any
//! connection exists.

pub mod encode;
pub mod header;
pub mod varint;

pub use encode::{negotiate_version, retry, verify_retry_integrity};
pub use header::{Header, PacketType};
