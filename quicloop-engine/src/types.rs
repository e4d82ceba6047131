//! Core engine types: connection IDs, datagram metadata and statistics.

#![forbid(unsafe_code)]

use bytes::Bytes;
use core::fmt;
use core::time::Duration;
use std::borrow::Borrow;
use std::net::SocketAddr;

/// Maximum Connection ID length (RFC 9000 Section 17.2).
pub const MAX_CONN_ID_LEN: usize = 20;

/// Connection ID (RFC 9000 Section 5.1)
///
/// Opaque identifier of at most [`MAX_CONN_ID_LEN`] bytes. Hashes and
/// compares like the raw byte slice, so registries keyed by `ConnectionId`
/// can be probed with a borrowed `&[u8]`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId {
    bytes: Bytes,
}

impl ConnectionId {
    /// Create a new ConnectionId from bytes
    ///
    /// Returns None if length exceeds MAX_CONN_ID_LEN
    pub fn new(bytes: Bytes) -> Option<Self> {
        if bytes.len() > MAX_CONN_ID_LEN {
            return None;
        }
        Some(Self { bytes })
    }

    /// Create from a borrowed slice (copies data)
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() > MAX_CONN_ID_LEN {
            return None;
        }
        Some(Self {
            bytes: Bytes::copy_from_slice(slice),
        })
    }

    /// Access the underlying bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Zero-length connection ID
    pub fn empty() -> Self {
        Self {
            bytes: Bytes::new(),
        }
    }
}

impl AsRef<[u8]> for ConnectionId {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl Borrow<[u8]> for ConnectionId {
    fn borrow(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", self)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.bytes[..] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Ancillary information about an incoming datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvInfo {
    /// Remote address the datagram was received from.
    pub from: SocketAddr,
    /// Local address the datagram was received on.
    pub to: SocketAddr,
}

/// Ancillary information about an outgoing datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendInfo {
    /// Remote address the datagram must be sent to.
    pub to: SocketAddr,
}

/// Connection statistics reported by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// QUIC packets received.
    pub recv: usize,
    /// QUIC packets sent.
    pub sent: usize,
    /// QUIC packets declared lost.
    pub lost: usize,
    /// Estimated round-trip time.
    pub rtt: Duration,
    /// Congestion window in bytes.
    pub cwnd: usize,
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "recv={} sent={} lost={} rtt={:?} cwnd={}",
            self.recv, self.sent, self.lost, self.rtt, self.cwnd
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_connection_id_length_bound() {
        assert!(ConnectionId::from_slice(&[0u8; MAX_CONN_ID_LEN]).is_some());
        assert!(ConnectionId::from_slice(&[0u8; MAX_CONN_ID_LEN + 1]).is_none());
        assert!(ConnectionId::empty().is_empty());
    }

    #[test]
    fn test_connection_id_borrowed_lookup() {
        let cid = ConnectionId::from_slice(&[1, 2, 3, 4]).unwrap();
        let mut map = HashMap::new();
        map.insert(cid.clone(), "conn");
        assert_eq!(map.get(&[1u8, 2, 3, 4][..]), Some(&"conn"));
        assert_eq!(map.get(&[1u8, 2, 3][..]), None);
    }

    #[test]
    fn test_connection_id_display_is_hex() {
        let cid = ConnectionId::from_slice(&[0xde, 0xad, 0x01]).unwrap();
        assert_eq!(cid.to_string(), "dead01");
        assert_eq!(format!("{:?}", cid), "ConnectionId(dead01)");
    }

    #[test]
    fn test_stats_display() {
        let stats = Stats {
            recv: 3,
            sent: 4,
            lost: 1,
            rtt: Duration::from_millis(12),
            cwnd: 12000,
        };
        assert_eq!(stats.to_string(), "recv=3 sent=4 lost=1 rtt=12ms cwnd=12000");
    }
}
