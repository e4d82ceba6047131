//! # Address Validation Tokens (RFC 9000 Section 8.1)
//!
//! Stateless Retry hands the client a token that it must echo on its next
//! Initial. The token proves the client can receive at the address it claims
//! and carries the original destination connection ID back to the server, so
//! no per-connection state exists before the echo arrives.
//!
//! ## Layout
//!
//! ```text
//! +--------+-----------+------+------+-------+-------+------+------+---------+
//! | "quic" | issued ms | addr | addr | odcid | odcid | scid | scid | tag (16)|
//! |        | (u64 BE)  | len  | text | len   |       | len  |      |         |
//! +--------+-----------+------+------+-------+-------+------+------+---------+
//! ```
//!
//! `scid` is the connection ID the Retry told the client to use, so a token
//! is only good on an Initial addressed to that ID. The tag is SipHash-2-4
//! (128-bit output) over everything before it, keyed with a secret drawn once
//! per [`TokenService`].

use quicloop_engine::{ConnectionId, MAX_CONN_ID_LEN};
use siphasher::sip128::{Hasher128, SipHasher24};
use std::hash::Hasher;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::Result;

const TOKEN_PREFIX: &[u8] = b"quic";
const TAG_LEN: usize = 16;
const ISSUED_LEN: usize = 8;

/// Tokens older than this are rejected unless configured otherwise.
pub const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(10);

/// Mints and validates retry tokens under a per-instance secret.
pub struct TokenService {
    key: (u64, u64),
    lifetime: Duration,
}

impl TokenService {
    /// A service with a fresh random secret.
    pub fn new() -> Result<Self> {
        let mut k0 = [0u8; 8];
        let mut k1 = [0u8; 8];
        getrandom::getrandom(&mut k0)?;
        getrandom::getrandom(&mut k1)?;
        Ok(Self::with_key(u64::from_le_bytes(k0), u64::from_le_bytes(k1)))
    }

    pub fn with_key(k0: u64, k1: u64) -> Self {
        Self {
            key: (k0, k1),
            lifetime: DEFAULT_TOKEN_LIFETIME,
        }
    }

    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    /// Bind `odcid` to `peer` and to the Retry's new connection ID `scid`.
    pub fn mint(&self, peer: &SocketAddr, odcid: &ConnectionId, scid: &ConnectionId) -> Vec<u8> {
        self.mint_at(peer, odcid, scid, SystemTime::now())
    }

    pub fn mint_at(
        &self,
        peer: &SocketAddr,
        odcid: &ConnectionId,
        scid: &ConnectionId,
        now: SystemTime,
    ) -> Vec<u8> {
        let addr = peer.to_string();
        let mut token = Vec::with_capacity(
            TOKEN_PREFIX.len() + ISSUED_LEN + 3 + addr.len() + odcid.len() + scid.len() + TAG_LEN,
        );

        token.extend_from_slice(TOKEN_PREFIX);
        token.extend_from_slice(&unix_millis(now).to_be_bytes());
        // Socket address text never exceeds 255 bytes
        token.push(addr.len() as u8);
        token.extend_from_slice(addr.as_bytes());
        token.push(odcid.len() as u8);
        token.extend_from_slice(odcid.as_bytes());
        token.push(scid.len() as u8);
        token.extend_from_slice(scid.as_bytes());

        let tag = self.tag(&token);
        token.extend_from_slice(&tag);
        token
    }

    /// Recover the original destination ID from a token that `peer` sent on
    /// an Initial addressed to `dcid`.
    ///
    /// `None` for anything [`mint`](Self::mint) did not produce for this
    /// exact address and connection ID under this service's secret, and for
    /// tokens past their lifetime.
    pub fn validate(&self, peer: &SocketAddr, dcid: &ConnectionId, token: &[u8]) -> Option<ConnectionId> {
        self.validate_at(peer, dcid, token, SystemTime::now())
    }

    pub fn validate_at(
        &self,
        peer: &SocketAddr,
        dcid: &ConnectionId,
        token: &[u8],
        now: SystemTime,
    ) -> Option<ConnectionId> {
        if token.len() < TOKEN_PREFIX.len() + ISSUED_LEN + 3 + TAG_LEN {
            return None;
        }
        let (body, tag) = token.split_at(token.len() - TAG_LEN);

        if !constant_time_eq(&self.tag(body), tag) {
            return None;
        }

        let rest = body.strip_prefix(TOKEN_PREFIX)?;
        let (issued, rest) = rest.split_at(ISSUED_LEN);
        let issued = u64::from_be_bytes(issued.try_into().ok()?);
        let age = unix_millis(now).checked_sub(issued)?;
        if u128::from(age) > self.lifetime.as_millis() {
            return None;
        }

        let (addr, rest) = split_prefixed(rest)?;
        if addr != peer.to_string().as_bytes() {
            return None;
        }

        let (odcid, rest) = split_prefixed(rest)?;
        let (scid, rest) = split_prefixed(rest)?;
        if !rest.is_empty() || odcid.len() > MAX_CONN_ID_LEN || scid != dcid.as_bytes() {
            return None;
        }
        ConnectionId::from_slice(odcid)
    }

    fn tag(&self, body: &[u8]) -> [u8; TAG_LEN] {
        let mut hasher = SipHasher24::new_with_keys(self.key.0, self.key.1);
        hasher.write(body);
        hasher.finish128().as_bytes()
    }
}

impl std::fmt::Debug for TokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenService")
            .field("lifetime", &self.lifetime)
            .finish_non_exhaustive()
    }
}

/// Split a one-byte length prefix and the field it covers off `buf`.
fn split_prefixed(buf: &[u8]) -> Option<(&[u8], &[u8])> {
    let (&len, rest) = buf.split_first()?;
    let len = len as usize;
    if rest.len() < len {
        return None;
    }
    Some(rest.split_at(len))
}

fn unix_millis(t: SystemTime) -> u64 {
    let since = t.duration_since(UNIX_EPOCH).unwrap_or_default();
    u64::try_from(since.as_millis()).unwrap_or(u64::MAX)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn odcid() -> ConnectionId {
        ConnectionId::from_slice(&[0xab; 16]).unwrap()
    }

    fn scid() -> ConnectionId {
        ConnectionId::from_slice(&[0x5c; 20]).unwrap()
    }

    #[test]
    fn test_mint_then_validate() {
        let service = TokenService::with_key(1, 2);
        let peer = addr("192.0.2.1:5555");
        let token = service.mint(&peer, &odcid(), &scid());
        assert!(token.starts_with(b"quic"));
        assert_eq!(service.validate(&peer, &scid(), &token), Some(odcid()));
    }

    #[test]
    fn test_other_address_is_rejected() {
        let service = TokenService::with_key(1, 2);
        let token = service.mint(&addr("192.0.2.1:5555"), &odcid(), &scid());
        assert_eq!(service.validate(&addr("192.0.2.1:5556"), &scid(), &token), None);
        assert_eq!(service.validate(&addr("192.0.2.2:5555"), &scid(), &token), None);
    }

    #[test]
    fn test_other_destination_id_is_rejected() {
        let service = TokenService::with_key(1, 2);
        let peer = addr("127.0.0.1:6001");
        let token = service.mint(&peer, &odcid(), &scid());

        let short = ConnectionId::from_slice(&[1, 2, 3, 4]).unwrap();
        assert_eq!(service.validate(&peer, &short, &token), None);
        assert_eq!(service.validate(&peer, &odcid(), &token), None);
        assert_eq!(service.validate(&peer, &ConnectionId::empty(), &token), None);
    }

    #[test]
    fn test_ipv6_peer() {
        let service = TokenService::with_key(1, 2);
        let peer = addr("[2001:db8::1]:443");
        let token = service.mint(&peer, &odcid(), &scid());
        assert_eq!(service.validate(&peer, &scid(), &token), Some(odcid()));
    }

    #[test]
    fn test_empty_odcid() {
        let service = TokenService::with_key(1, 2);
        let peer = addr("127.0.0.1:1");
        let token = service.mint(&peer, &ConnectionId::empty(), &scid());
        assert_eq!(service.validate(&peer, &scid(), &token), Some(ConnectionId::empty()));
    }

    #[test]
    fn test_other_secret_is_rejected() {
        let peer = addr("192.0.2.1:5555");
        let token = TokenService::with_key(1, 2).mint(&peer, &odcid(), &scid());
        assert_eq!(TokenService::with_key(1, 3).validate(&peer, &scid(), &token), None);
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let service = TokenService::with_key(1, 2).with_lifetime(Duration::from_secs(5));
        let peer = addr("192.0.2.1:5555");
        let issued = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let token = service.mint_at(&peer, &odcid(), &scid(), issued);

        let within = issued + Duration::from_secs(5);
        assert_eq!(service.validate_at(&peer, &scid(), &token, within), Some(odcid()));

        let late = issued + Duration::from_millis(5_001);
        assert_eq!(service.validate_at(&peer, &scid(), &token, late), None);

        let before = issued - Duration::from_secs(1);
        assert_eq!(service.validate_at(&peer, &scid(), &token, before), None);
    }

    #[test]
    fn test_tampering_is_rejected() {
        let service = TokenService::with_key(9, 9);
        let peer = addr("10.0.0.1:4433");
        let token = service.mint(&peer, &odcid(), &scid());

        for i in 0..token.len() {
            let mut forged = token.clone();
            forged[i] ^= 0x01;
            assert_eq!(service.validate(&peer, &scid(), &forged), None, "byte {}", i);
        }

        assert_eq!(service.validate(&peer, &scid(), &token[..token.len() - 1]), None);
        let mut extended = token.clone();
        extended.push(0);
        assert_eq!(service.validate(&peer, &scid(), &extended), None);
    }

    #[test]
    fn test_unauthenticated_placeholder_shape_is_rejected() {
        let service = TokenService::with_key(1, 2);
        let peer = addr("127.0.0.1:9000");
        let mut forged = b"quiche".to_vec();
        forged.extend_from_slice(peer.to_string().as_bytes());
        forged.extend_from_slice(odcid().as_bytes());
        assert_eq!(service.validate(&peer, &scid(), &forged), None);
        assert_eq!(service.validate(&peer, &scid(), b""), None);
    }

    #[test]
    fn test_tokens_bind_to_issuing_address() {
        proptest!(|(
            issued_ip in any::<[u8; 4]>(),
            issued_port in any::<u16>(),
            presented_ip in any::<[u8; 4]>(),
            presented_port in any::<u16>(),
            odcid in proptest::collection::vec(any::<u8>(), 0..=MAX_CONN_ID_LEN),
        )| {
            let service = TokenService::with_key(5, 6);
            let issued = SocketAddr::from((issued_ip, issued_port));
            let presented = SocketAddr::from((presented_ip, presented_port));
            let odcid = ConnectionId::from_slice(&odcid).unwrap();

            let token = service.mint(&issued, &odcid, &scid());
            prop_assert_eq!(service.validate(&issued, &scid(), &token), Some(odcid));
            if presented != issued {
                prop_assert_eq!(service.validate(&presented, &scid(), &token), None);
            }
        });
    }
}
