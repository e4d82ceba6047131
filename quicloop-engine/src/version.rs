//! # QUIC Versions (RFC 8999, RFC 9000 Section 6)
//!
//! Version constants and the selection policy a client applies when it
//! receives a Version Negotiation packet.

#![forbid(unsafe_code)]

/// QUIC Version 1 (RFC 9000)
pub const VERSION_1: u32 = 0x0000_0001;

/// Version field value that marks a Version Negotiation packet.
pub const VERSION_NEGOTIATION: u32 = 0x0000_0000;

/// The wire version spoken by default.
pub const PROTOCOL_VERSION: u32 = VERSION_1;

/// Versions the simulated engine accepts, in preference order.
pub const SUPPORTED_VERSIONS: &[u32] = &[VERSION_1];

/// Reserved versions have the form 0x?a?a?a?a and are used to exercise
/// version negotiation (RFC 9000 Section 6.3).
pub fn is_reserved_version(version: u32) -> bool {
    (version & 0x0f0f_0f0f) == 0x0a0a_0a0a
}

/// Pick the version a client retries with after a Version Negotiation packet.
///
/// `offered` is the server's list, `current` the version the client tried.
/// A list that contains `current` is bogus (RFC 9000 Section 6.2) and yields
/// `None`, as does a list with no version from `supported`.
pub fn select_version(offered: &[u32], current: u32, supported: &[u32]) -> Option<u32> {
    if offered.contains(&current) {
        return None;
    }
    supported.iter().copied().find(|v| offered.contains(v))
}
