//! # QUIC Packet Header Parsing (RFC 9000 Section 17, RFC 8999)
//!
//! Only the version-independent part of a header is decoded here: header
//! form, version, connection IDs, the Initial token and, for Version
//! Negotiation, the offered version list. Packet protection and payloads are
//! the engine's business.

#![forbid(unsafe_code)]

use crate::error::{Error, Result};
use crate::packet::varint;
use crate::types::{ConnectionId, MAX_CONN_ID_LEN};
use crate::version::{SUPPORTED_VERSIONS, VERSION_NEGOTIATION};

/// Header Form Bit (most significant bit)
/// 1 = Long Header, 0 = Short Header
pub const HEADER_FORM_BIT: u8 = 0x80;

/// Fixed Bit, MUST be set to 1 in all QUIC packets except Version Negotiation
pub const FIXED_BIT: u8 = 0x40;

/// Long Packet Type Mask (bits 4-5)
pub const LONG_PACKET_TYPE_MASK: u8 = 0x30;

pub const LONG_PACKET_TYPE_INITIAL: u8 = 0x00;
pub const LONG_PACKET_TYPE_0RTT: u8 = 0x10;
pub const LONG_PACKET_TYPE_HANDSHAKE: u8 = 0x20;
pub const LONG_PACKET_TYPE_RETRY: u8 = 0x30;

/// Length of the Retry Integrity Tag (RFC 9001 Section 5.8)
pub const RETRY_INTEGRITY_TAG_LEN: usize = 16;

/// Packet Type (RFC 9000 Section 17)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Initial,
    ZeroRtt,
    Handshake,
    Retry,
    VersionNegotiation,
    /// 1-RTT packet (Short Header)
    Short,
}

impl PacketType {
    pub fn is_long_header(&self) -> bool {
        !matches!(self, PacketType::Short)
    }
}

/// Parsed view of an inbound datagram's first packet header.
///
/// Owned and transient: rebuilt for every datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub ty: PacketType,

    /// Wire version; zero for Version Negotiation and short headers.
    ///
    /// When this is not a supported version, only `version` and the
    /// connection IDs are meaningful.
    pub version: u32,

    pub dcid: ConnectionId,

    /// Empty for short headers.
    pub scid: ConnectionId,

    /// Address validation token: present (possibly empty) on Initial and
    /// Retry packets only.
    pub token: Option<Vec<u8>>,

    /// Versions offered by a Version Negotiation packet.
    pub versions: Option<Vec<u32>>,
}

impl Header {
    /// Parse the header at the front of `buf`.
    ///
    /// `dcid_len` is the destination connection ID length to assume for short
    /// headers, which do not encode it.
    pub fn from_slice(buf: &[u8], dcid_len: usize) -> Result<Header> {
        parse(buf, dcid_len).map(|(hdr, _)| hdr)
    }

    /// Returns true if the packet carries a non-empty token.
    pub fn has_token(&self) -> bool {
        self.token.as_ref().map_or(false, |t| !t.is_empty())
    }
}

/// Parse a header, returning it along with the offset at which the rest of
/// the packet (length field for long headers, packet number for short ones)
/// begins.
pub fn parse(buf: &[u8], dcid_len: usize) -> Result<(Header, usize)> {
    let first = *buf.first().ok_or(Error::BufferTooShort)?;

    if first & HEADER_FORM_BIT == 0 {
        return parse_short(buf, dcid_len);
    }

    if buf.len() < 6 {
        return Err(Error::BufferTooShort);
    }
    let version = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
    let mut offset = 5;

    let dcid = read_cid(buf, &mut offset)?;
    let scid = read_cid(buf, &mut offset)?;

    if version == VERSION_NEGOTIATION {
        let rest = &buf[offset..];
        if rest.is_empty() || rest.len() % 4 != 0 {
            return Err(Error::InvalidPacket);
        }
        let versions = rest
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let hdr = Header {
            ty: PacketType::VersionNegotiation,
            version,
            dcid,
            scid,
            token: None,
            versions: Some(versions),
        };
        return Ok((hdr, buf.len()));
    }

    let ty = match first & LONG_PACKET_TYPE_MASK {
        LONG_PACKET_TYPE_INITIAL => PacketType::Initial,
        LONG_PACKET_TYPE_0RTT => PacketType::ZeroRtt,
        LONG_PACKET_TYPE_HANDSHAKE => PacketType::Handshake,
        _ => PacketType::Retry,
    };

    // RFC 8999: only form, version and connection IDs are invariant. For an
    // unknown version `ty` is read from bits that version may not define.
    if !SUPPORTED_VERSIONS.contains(&version) {
        let hdr = Header {
            ty,
            version,
            dcid,
            scid,
            token: None,
            versions: None,
        };
        return Ok((hdr, offset));
    }

    if first & FIXED_BIT == 0 {
        return Err(Error::InvalidPacket);
    }

    let token = match ty {
        PacketType::Initial => {
            let (len, consumed) = varint::decode(&buf[offset..])?;
            offset += consumed;
            let len = len as usize;
            if buf.len() - offset < len {
                return Err(Error::BufferTooShort);
            }
            let token = buf[offset..offset + len].to_vec();
            offset += len;
            Some(token)
        }
        PacketType::Retry => {
            if buf.len() < offset + RETRY_INTEGRITY_TAG_LEN {
                return Err(Error::BufferTooShort);
            }
            let token = buf[offset..buf.len() - RETRY_INTEGRITY_TAG_LEN].to_vec();
            offset = buf.len() - RETRY_INTEGRITY_TAG_LEN;
            Some(token)
        }
        _ => None,
    };

    let hdr = Header {
        ty,
        version,
        dcid,
        scid,
        token,
        versions: None,
    };
    Ok((hdr, offset))
}

fn parse_short(buf: &[u8], dcid_len: usize) -> Result<(Header, usize)> {
    if buf[0] & FIXED_BIT == 0 {
        return Err(Error::InvalidPacket);
    }
    if dcid_len > MAX_CONN_ID_LEN {
        return Err(Error::InvalidPacket);
    }
    if buf.len() < 1 + dcid_len {
        return Err(Error::BufferTooShort);
    }
    let dcid = ConnectionId::from_slice(&buf[1..1 + dcid_len]).ok_or(Error::InvalidPacket)?;
    let hdr = Header {
        ty: PacketType::Short,
        version: 0,
        dcid,
        scid: ConnectionId::empty(),
        token: None,
        versions: None,
    };
    Ok((hdr, 1 + dcid_len))
}

fn read_cid(buf: &[u8], offset: &mut usize) -> Result<ConnectionId> {
    let len = *buf.get(*offset).ok_or(Error::BufferTooShort)? as usize;
    *offset += 1;
    if len > MAX_CONN_ID_LEN {
        return Err(Error::InvalidPacket);
    }
    if buf.len() < *offset + len {
        return Err(Error::BufferTooShort);
    }
    let cid = ConnectionId::from_slice(&buf[*offset..*offset + len]).ok_or(Error::InvalidPacket)?;
    *offset += len;
    Ok(cid)
}
