//! # Protocol Engine Boundary
//!
//! The orchestration layer drives QUIC connections through this trait and
//! never looks inside them: packet protection, TLS, loss recovery and stream
//! state all live behind it. Two engines implement it, the deterministic
//! [`SimEngine`](crate::sim::SimEngine) and, with the `quiche` feature, an
//! adapter over cloudflare's quiche.
//!
//! ## Contract
//!
//! - `recv` consumes one datagram, `send` emits at most one.
//! - `Err(Error::Done)` from `send`, `stream_recv` or `close` means there is
//!   nothing (more) to do and is never a failure.
//! - `timeout` is relative to now; `None` means no timer is armed.
//! - After `is_closed` returns true no other call has an effect.

#![forbid(unsafe_code)]

use core::time::Duration;
use std::net::SocketAddr;

use crate::error::Result;
use crate::packet::{self, Header};
use crate::settings::TransportSettings;
use crate::types::{ConnectionId, RecvInfo, SendInfo, Stats};
use crate::version::SUPPORTED_VERSIONS;

/// A single QUIC connection as seen by the orchestration layer.
pub trait ProtocolEngine: Sized {
    /// Engine-specific configuration, built once and shared by every
    /// connection an endpoint creates.
    type Config;

    /// Translate transport settings into the engine's configuration.
    fn configure(settings: &TransportSettings) -> Result<Self::Config>;

    /// Open a client connection. The first flight is produced by `send`.
    fn connect(
        config: &mut Self::Config,
        server_name: Option<&str>,
        scid: &ConnectionId,
        local: SocketAddr,
        peer: SocketAddr,
    ) -> Result<Self>;

    /// Create the server side of a connection.
    ///
    /// `odcid` is the client's original destination ID, known only after a
    /// validated Retry round trip.
    fn accept(
        config: &mut Self::Config,
        scid: &ConnectionId,
        odcid: Option<&ConnectionId>,
        local: SocketAddr,
        peer: SocketAddr,
    ) -> Result<Self>;

    /// Process one inbound datagram. `buf` may be modified in place.
    fn recv(&mut self, buf: &mut [u8], info: RecvInfo) -> Result<usize>;

    /// Write the next outbound datagram into `out`.
    fn send(&mut self, out: &mut [u8]) -> Result<(usize, SendInfo)>;

    /// Queue application data on a stream.
    fn stream_send(&mut self, stream_id: u64, data: &[u8], fin: bool) -> Result<usize>;

    /// Read application data from a stream. The flag reports the end of the
    /// stream.
    fn stream_recv(&mut self, stream_id: u64, out: &mut [u8]) -> Result<(usize, bool)>;

    /// Pop the next stream with unread data or an unreported fin.
    fn next_readable_stream(&mut self) -> Option<u64>;

    fn timeout(&self) -> Option<Duration>;

    /// Fire whatever timer has expired.
    fn on_timeout(&mut self);

    fn is_established(&self) -> bool;

    fn is_draining(&self) -> bool;

    fn is_closed(&self) -> bool;

    /// Start closing. `app` selects an application close over a transport
    /// close.
    fn close(&mut self, app: bool, err: u64, reason: &[u8]) -> Result<()>;

    /// Negotiated ALPN; empty until the handshake has picked one.
    fn application_proto(&self) -> &[u8];

    fn stats(&self) -> Stats;

    /// Identifier used in logs.
    fn trace_id(&self) -> &str;

    /// Parse the version-independent header of an inbound datagram.
    fn parse_header(buf: &mut [u8], dcid_len: usize) -> Result<Header> {
        Header::from_slice(buf, dcid_len)
    }

    /// Write a Version Negotiation packet for the client IDs `scid`/`dcid`.
    fn negotiate_version(scid: &ConnectionId, dcid: &ConnectionId, out: &mut [u8]) -> Result<usize> {
        packet::negotiate_version(scid, dcid, out)
    }

    /// Write a Retry packet carrying `token`.
    fn retry(
        scid: &ConnectionId,
        dcid: &ConnectionId,
        new_scid: &ConnectionId,
        token: &[u8],
        version: u32,
        out: &mut [u8],
    ) -> Result<usize> {
        packet::retry(scid, dcid, new_scid, token, version, out)
    }

    fn version_is_supported(version: u32) -> bool {
        SUPPORTED_VERSIONS.contains(&version)
    }
}
