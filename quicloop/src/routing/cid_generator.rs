//! Server connection ID generation.
//!
//! New connections are registered under a server-chosen 20-byte ID. With
//! Retry enabled the ID is random and travels to the client inside the Retry
//! packet. Without Retry the server has no round trip to announce an ID, so
//! it derives one from the client's original destination ID under a
//! per-process key: retransmitted Initials then land on the same connection.

use quicloop_engine::{ConnectionId, MAX_CONN_ID_LEN};
use siphasher::sip::SipHasher13;
use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::Result;

/// Length of every server-chosen connection ID.
pub const CID_LENGTH: usize = MAX_CONN_ID_LEN;

/// Source of fresh server connection IDs.
pub trait ConnectionIdGenerator {
    fn generate(&self) -> Result<ConnectionId>;
}

/// Uniformly random 20-byte IDs from the OS.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomConnectionIdGenerator;

impl ConnectionIdGenerator for RandomConnectionIdGenerator {
    fn generate(&self) -> Result<ConnectionId> {
        let mut bytes = [0u8; CID_LENGTH];
        getrandom::getrandom(&mut bytes)?;
        Ok(cid_from_array(bytes))
    }
}

/// Predictable IDs: an 8-byte big-endian counter followed by zeros.
#[derive(Debug, Default)]
pub struct SequentialConnectionIdGenerator {
    next: AtomicU64,
}

impl SequentialConnectionIdGenerator {
    pub fn new(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
        }
    }
}

impl ConnectionIdGenerator for SequentialConnectionIdGenerator {
    fn generate(&self) -> Result<ConnectionId> {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        let mut bytes = [0u8; CID_LENGTH];
        bytes[..8].copy_from_slice(&n.to_be_bytes());
        Ok(cid_from_array(bytes))
    }
}

/// Keyed mapping from a client's original destination ID to a server ID.
#[derive(Debug, Clone)]
pub struct DerivedConnectionIds {
    key: (u64, u64),
}

impl DerivedConnectionIds {
    /// A deriver with a fresh random key.
    pub fn new() -> Result<Self> {
        let mut k0 = [0u8; 8];
        let mut k1 = [0u8; 8];
        getrandom::getrandom(&mut k0)?;
        getrandom::getrandom(&mut k1)?;
        Ok(Self::with_key(u64::from_le_bytes(k0), u64::from_le_bytes(k1)))
    }

    pub fn with_key(k0: u64, k1: u64) -> Self {
        Self { key: (k0, k1) }
    }

    /// Derive the 20-byte server ID for `odcid`.
    pub fn derive(&self, odcid: &[u8]) -> ConnectionId {
        let mut bytes = [0u8; CID_LENGTH];
        for (lane, chunk) in bytes.chunks_mut(8).enumerate() {
            let mut hasher = SipHasher13::new_with_keys(self.key.0, self.key.1);
            hasher.write_u8(lane as u8);
            hasher.write(odcid);
            let hash = hasher.finish().to_be_bytes();
            chunk.copy_from_slice(&hash[..chunk.len()]);
        }
        cid_from_array(bytes)
    }
}

fn cid_from_array(bytes: [u8; CID_LENGTH]) -> ConnectionId {
    ConnectionId::from_slice(&bytes).unwrap_or_else(ConnectionId::empty)
}
