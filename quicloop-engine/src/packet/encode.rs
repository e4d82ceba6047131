//! # Stateless Packet Construction (RFC 9000 Sections 17.2.1 and 17.2.5)
//!
//! Version Negotiation and Retry packets are written without any connection
//! state, so the dispatcher can answer unknown peers before a connection is
//! allocated.

#![forbid(unsafe_code)]

use bytes::BufMut;

use crate::error::{Error, Result};
use crate::packet::header::{
    FIXED_BIT, HEADER_FORM_BIT, LONG_PACKET_TYPE_RETRY, RETRY_INTEGRITY_TAG_LEN,
};
use crate::types::ConnectionId;
use crate::version::{SUPPORTED_VERSIONS, VERSION_NEGOTIATION};

/// Write a Version Negotiation packet answering a client whose header carried
/// `scid` and `dcid`.
///
/// The reply swaps the IDs: its destination is the client's source ID and its
/// source echoes the client's destination ID.
pub fn negotiate_version(scid: &ConnectionId, dcid: &ConnectionId, out: &mut [u8]) -> Result<usize> {
    let mut pkt = Vec::with_capacity(7 + scid.len() + dcid.len() + 4 * SUPPORTED_VERSIONS.len());
    pkt.put_u8(HEADER_FORM_BIT | FIXED_BIT);
    pkt.put_u32(VERSION_NEGOTIATION);
    put_cid(&mut pkt, scid);
    put_cid(&mut pkt, dcid);
    for version in SUPPORTED_VERSIONS {
        pkt.put_u32(*version);
    }
    copy_out(&pkt, out)
}

/// Write a Retry packet.
///
/// `scid` and `dcid` are the IDs from the client's Initial; `new_scid` is the
/// ID the client must use as destination from now on. The integrity tag binds
/// the packet to the client's original destination ID.
pub fn retry(
    scid: &ConnectionId,
    dcid: &ConnectionId,
    new_scid: &ConnectionId,
    token: &[u8],
    version: u32,
    out: &mut [u8],
) -> Result<usize> {
    let mut pkt = Vec::with_capacity(7 + scid.len() + new_scid.len() + token.len() + RETRY_INTEGRITY_TAG_LEN);
    pkt.put_u8(HEADER_FORM_BIT | FIXED_BIT | LONG_PACKET_TYPE_RETRY);
    pkt.put_u32(version);
    put_cid(&mut pkt, scid);
    put_cid(&mut pkt, new_scid);
    pkt.put_slice(token);
    let tag = retry_integrity_tag(dcid.as_bytes(), &pkt);
    pkt.put_slice(&tag);
    copy_out(&pkt, out)
}

/// Check the integrity tag of a received Retry packet against the
/// destination ID the client originally chose.
pub fn verify_retry_integrity(odcid: &[u8], packet: &[u8]) -> bool {
    if packet.len() < RETRY_INTEGRITY_TAG_LEN {
        return false;
    }
    let (body, tag) = packet.split_at(packet.len() - RETRY_INTEGRITY_TAG_LEN);
    retry_integrity_tag(odcid, body) == tag
}

/// Keyed digest standing in for the AEAD tag of RFC 9001 Section 5.8.
///
/// Two FNV-1a lanes run over the Retry pseudo-packet (ODCID length, ODCID,
/// packet body). Detects corruption and ODCID mismatch; it is not a MAC.
fn retry_integrity_tag(odcid: &[u8], body: &[u8]) -> [u8; RETRY_INTEGRITY_TAG_LEN] {
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut lanes = [0xcbf2_9ce4_8422_2325u64, 0x6c62_272e_07bb_0142u64];

    let input = core::iter::once(odcid.len() as u8)
        .chain(odcid.iter().copied())
        .chain(body.iter().copied());
    for byte in input {
        for (i, lane) in lanes.iter_mut().enumerate() {
            *lane ^= u64::from(byte) ^ (i as u64) << 8;
            *lane = lane.wrapping_mul(PRIME);
        }
    }

    let mut tag = [0u8; RETRY_INTEGRITY_TAG_LEN];
    tag[..8].copy_from_slice(&lanes[0].to_be_bytes());
    tag[8..].copy_from_slice(&lanes[1].to_be_bytes());
    tag
}

fn put_cid(pkt: &mut Vec<u8>, cid: &ConnectionId) {
    pkt.put_u8(cid.len() as u8);
    pkt.put_slice(cid.as_bytes());
}

fn copy_out(pkt: &[u8], out: &mut [u8]) -> Result<usize> {
    if out.len() < pkt.len() {
        return Err(Error::BufferTooShort);
    }
    out[..pkt.len()].copy_from_slice(pkt);
    Ok(pkt.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::header::{Header, PacketType};
    use crate::version::VERSION_1;

    fn cid(b: &[u8]) -> ConnectionId {
        ConnectionId::from_slice(b).unwrap()
    }

    #[test]
    fn test_version_negotiation_swaps_ids() {
        let mut out = [0u8; 64];
        let len = negotiate_version(&cid(&[1, 1]), &cid(&[2, 2, 2]), &mut out).unwrap();
        let hdr = Header::from_slice(&out[..len], 20).unwrap();
        assert_eq!(hdr.ty, PacketType::VersionNegotiation);
        assert_eq!(hdr.dcid.as_bytes(), &[1, 1]);
        assert_eq!(hdr.scid.as_bytes(), &[2, 2, 2]);
        assert_eq!(hdr.versions.as_deref(), Some(SUPPORTED_VERSIONS));
    }

    #[test]
    fn test_retry_roundtrip_and_integrity() {
        let mut out = [0u8; 128];
        let odcid = cid(&[7; 8]);
        let len = retry(&cid(&[1; 8]), &odcid, &cid(&[3; 16]), b"token", VERSION_1, &mut out).unwrap();
        let pkt = &out[..len];

        let hdr = Header::from_slice(pkt, 20).unwrap();
        assert_eq!(hdr.ty, PacketType::Retry);
        assert_eq!(hdr.version, VERSION_1);
        assert_eq!(hdr.dcid.as_bytes(), &[1; 8]);
        assert_eq!(hdr.scid.as_bytes(), &[3; 16]);
        assert_eq!(hdr.token.as_deref(), Some(&b"token"[..]));

        assert!(verify_retry_integrity(odcid.as_bytes(), pkt));
        assert!(!verify_retry_integrity(&[8; 8], pkt));

        let mut tampered = pkt.to_vec();
        tampered[len - 20] ^= 0x01;
        assert!(!verify_retry_integrity(odcid.as_bytes(), &tampered));
    }

    #[test]
    fn test_short_output_buffer() {
        let mut out = [0u8; 8];
        assert_eq!(
            negotiate_version(&cid(&[1; 8]), &cid(&[2; 8]), &mut out),
            Err(Error::BufferTooShort)
        );
        assert_eq!(
            retry(&cid(&[1; 8]), &cid(&[2; 8]), &cid(&[3; 8]), b"t", VERSION_1, &mut out),
            Err(Error::BufferTooShort)
        );
    }
}
