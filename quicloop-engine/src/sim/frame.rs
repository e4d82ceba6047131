//! # Simulated Engine Frames
//!
//! A reduced frame set modelled on RFC 9000 Section 19. The handshake is
//! collapsed into three frames carrying nothing but ALPN negotiation; STREAM
//! and CONNECTION_CLOSE keep their RFC meaning with a simplified layout.
//!
//! Parsing is zero-copy: frame data borrows from the packet payload.

#![forbid(unsafe_code)]

use bytes::BufMut;

use crate::error::{Error, Result};
use crate::packet::varint;

pub const FRAME_PADDING: u8 = 0x00;
pub const FRAME_PING: u8 = 0x01;
/// STREAM without / with the FIN bit.
pub const FRAME_STREAM: u8 = 0x0a;
pub const FRAME_STREAM_FIN: u8 = 0x0b;
/// CONNECTION_CLOSE, transport / application variants.
pub const FRAME_CLOSE_TRANSPORT: u8 = 0x1c;
pub const FRAME_CLOSE_APPLICATION: u8 = 0x1d;
pub const FRAME_HANDSHAKE_DONE: u8 = 0x1e;
pub const FRAME_CLIENT_HELLO: u8 = 0x30;
pub const FRAME_SERVER_HELLO: u8 = 0x31;
pub const FRAME_FINISHED: u8 = 0x32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame<'a> {
    Padding,
    Ping,
    /// Client's offered ALPN list, in wire form.
    ClientHello { alpns: &'a [u8] },
    /// ALPN selected by the server.
    ServerHello { alpn: &'a [u8] },
    /// Client's last handshake flight.
    Finished,
    /// Server's confirmation of the handshake.
    HandshakeDone,
    Stream { id: u64, data: &'a [u8], fin: bool },
    ConnectionClose { app: bool, code: u64, reason: &'a [u8] },
}

impl<'a> Frame<'a> {
    /// Frames that oblige the peer to respond or retransmit.
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(self, Frame::Padding | Frame::ConnectionClose { .. })
    }

    /// Bytes this frame occupies on the wire.
    pub fn wire_len(&self) -> usize {
        match self {
            Frame::Padding | Frame::Ping | Frame::Finished | Frame::HandshakeDone => 1,
            Frame::ClientHello { alpns: b } | Frame::ServerHello { alpn: b } => {
                1 + varint::encoded_len(b.len() as u64) + b.len()
            }
            Frame::Stream { id, data, .. } => {
                1 + varint::encoded_len(*id)
                    + varint::encoded_len(data.len() as u64)
                    + data.len()
            }
            Frame::ConnectionClose { code, reason, .. } => {
                1 + varint::encoded_len(*code)
                    + varint::encoded_len(reason.len() as u64)
                    + reason.len()
            }
        }
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) -> Result<usize> {
        if buf.remaining_mut() < self.wire_len() {
            return Err(Error::BufferTooShort);
        }
        match self {
            Frame::Padding => buf.put_u8(FRAME_PADDING),
            Frame::Ping => buf.put_u8(FRAME_PING),
            Frame::Finished => buf.put_u8(FRAME_FINISHED),
            Frame::HandshakeDone => buf.put_u8(FRAME_HANDSHAKE_DONE),
            Frame::ClientHello { alpns } => put_bytes(buf, FRAME_CLIENT_HELLO, alpns)?,
            Frame::ServerHello { alpn } => put_bytes(buf, FRAME_SERVER_HELLO, alpn)?,
            Frame::Stream { id, data, fin } => {
                buf.put_u8(if *fin { FRAME_STREAM_FIN } else { FRAME_STREAM });
                varint::encode(*id, buf)?;
                varint::encode(data.len() as u64, buf)?;
                buf.put_slice(data);
            }
            Frame::ConnectionClose { app, code, reason } => {
                buf.put_u8(if *app {
                    FRAME_CLOSE_APPLICATION
                } else {
                    FRAME_CLOSE_TRANSPORT
                });
                varint::encode(*code, buf)?;
                varint::encode(reason.len() as u64, buf)?;
                buf.put_slice(reason);
            }
        }
        Ok(self.wire_len())
    }

    /// Parse one frame from the front of `buf`, returning it and the bytes
    /// consumed.
    pub fn parse(buf: &'a [u8]) -> Result<(Frame<'a>, usize)> {
        let ty = *buf.first().ok_or(Error::BufferTooShort)?;
        let mut off = 1;
        let frame = match ty {
            FRAME_PADDING => Frame::Padding,
            FRAME_PING => Frame::Ping,
            FRAME_FINISHED => Frame::Finished,
            FRAME_HANDSHAKE_DONE => Frame::HandshakeDone,
            FRAME_CLIENT_HELLO => Frame::ClientHello {
                alpns: take_bytes(buf, &mut off)?,
            },
            FRAME_SERVER_HELLO => Frame::ServerHello {
                alpn: take_bytes(buf, &mut off)?,
            },
            FRAME_STREAM | FRAME_STREAM_FIN => {
                let id = take_varint(buf, &mut off)?;
                let data = take_bytes(buf, &mut off)?;
                Frame::Stream {
                    id,
                    data,
                    fin: ty == FRAME_STREAM_FIN,
                }
            }
            FRAME_CLOSE_TRANSPORT | FRAME_CLOSE_APPLICATION => {
                let code = take_varint(buf, &mut off)?;
                let reason = take_bytes(buf, &mut off)?;
                Frame::ConnectionClose {
                    app: ty == FRAME_CLOSE_APPLICATION,
                    code,
                    reason,
                }
            }
            _ => return Err(Error::InvalidFrame),
        };
        Ok((frame, off))
    }
}

/// Iterator over the frames of a packet payload. Stops after the first error.
pub struct FrameIter<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> FrameIter<'a> {
    pub fn new(payload: &'a [u8]) -> Self {
        Self {
            buf: payload,
            offset: 0,
        }
    }
}

impl<'a> Iterator for FrameIter<'a> {
    type Item = Result<Frame<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.buf.len() {
            return None;
        }
        match Frame::parse(&self.buf[self.offset..]) {
            Ok((frame, consumed)) => {
                self.offset += consumed;
                Some(Ok(frame))
            }
            Err(e) => {
                self.offset = self.buf.len();
                Some(Err(e))
            }
        }
    }
}

/// Split a wire-form ALPN list (length-prefixed identifiers) into its entries.
pub fn split_alpns(mut wire: &[u8]) -> Result<Vec<&[u8]>> {
    let mut out = Vec::new();
    while let Some((&len, rest)) = wire.split_first() {
        let len = len as usize;
        if len == 0 || rest.len() < len {
            return Err(Error::InvalidFrame);
        }
        out.push(&rest[..len]);
        wire = &rest[len..];
    }
    Ok(out)
}

fn put_bytes<B: BufMut>(buf: &mut B, ty: u8, bytes: &[u8]) -> Result<()> {
    buf.put_u8(ty);
    varint::encode(bytes.len() as u64, buf)?;
    buf.put_slice(bytes);
    Ok(())
}

fn take_varint(buf: &[u8], off: &mut usize) -> Result<u64> {
    let (v, n) = varint::decode(&buf[*off..]).map_err(|_| Error::InvalidFrame)?;
    *off += n;
    Ok(v)
}

fn take_bytes<'a>(buf: &'a [u8], off: &mut usize) -> Result<&'a [u8]> {
    let len = take_varint(buf, off)? as usize;
    if buf.len() - *off < len {
        return Err(Error::InvalidFrame);
    }
    let bytes = &buf[*off..*off + len];
    *off += len;
    Ok(bytes)
}
