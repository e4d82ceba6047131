//! # Simulated Protocol Engine
//!
//! A deterministic, unencrypted stand-in for a real QUIC stack. It speaks
//! RFC 9000 packet headers (so Retry, Version Negotiation and CID routing
//! behave as on the real wire) but replaces TLS with a three-message ALPN
//! exchange and assumes a loss-free path for 1-RTT data.
//!
//! ## Handshake
//!
//! ```text
//! client                                   server
//!   Initial[ClientHello(alpns)]      --->
//!                                    <---  Handshake[ServerHello(alpn)]
//!   (established)
//!   Handshake[Finished]              --->
//!                                          (established)
//!                                    <---  1-RTT[HANDSHAKE_DONE]
//! ```
//!
//! Client Initials and server hellos are retransmitted on PTO until the
//! peer answers; every retransmission counts as a lost packet.
//!
//! ## Packet layout
//!
//! Long: `0xc0|type|0x03, version, dcid, scid, [token], length, pn(4), frames`
//! Short: `0x43, dcid, pn(4), frames`

#![forbid(unsafe_code)]

mod frame;


pub use frame::{Frame, FrameIter};

use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::BufMut;
use tracing::{debug, trace};

use crate::engine::ProtocolEngine;
use crate::error::{Error, Result};
use crate::packet::header::{
    self, PacketType, FIXED_BIT, HEADER_FORM_BIT, LONG_PACKET_TYPE_HANDSHAKE,
    LONG_PACKET_TYPE_INITIAL,
};
use crate::packet::{varint, verify_retry_integrity};
use crate::settings::TransportSettings;
use crate::types::{ConnectionId, RecvInfo, SendInfo, Stats};
use crate::version::{select_version, SUPPORTED_VERSIONS};

/// Client Initials are padded to this size (RFC 9000 Section 14.1).
pub const MIN_INITIAL_SIZE: usize = 1200;

/// RTT assumed before the first sample (RFC 9002 Section 6.2.2).
pub const INITIAL_RTT: Duration = Duration::from_millis(333);

const MIN_PTO: Duration = Duration::from_millis(10);
const MAX_PTO_BACKOFF: u32 = 6;
const PN_LEN: usize = 4;
const CLIENT_DCID_LEN: usize = 16;

/// TLS alert 120 (no_application_protocol) as a CRYPTO_ERROR code.
const NO_APPLICATION_PROTOCOL: u64 = 0x0178;

/// APPLICATION_ERROR, used when an application close happens before the
/// handshake completes (RFC 9000 Section 10.2.3).
const APPLICATION_ERROR: u64 = 0x0c;

/// Shared configuration for every [`SimEngine`] an endpoint creates.
#[derive(Debug, Clone)]
pub struct SimConfig {
    settings: TransportSettings,
    alpns: Vec<Vec<u8>>,
}

impl SimConfig {
    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Client,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CloseState {
    Open,
    /// Close requested locally, frame not sent yet.
    Pending { app: bool, code: u64, reason: Vec<u8> },
    /// Close frame sent, waiting out the drain period.
    Closing,
    /// Peer's close received.
    Draining,
    Closed,
}

#[derive(Debug, Default)]
struct StreamState {
    recv_buf: VecDeque<u8>,
    recv_off: u64,
    recv_fin: bool,
    fin_delivered: bool,

    send_buf: VecDeque<u8>,
    send_fin: bool,
    fin_sent: bool,
}

impl StreamState {
    fn is_readable(&self) -> bool {
        !self.recv_buf.is_empty() || (self.recv_fin && !self.fin_delivered)
    }

    fn has_pending_send(&self) -> bool {
        !self.send_buf.is_empty() || (self.send_fin && !self.fin_sent)
    }

    fn is_complete(&self) -> bool {
        self.fin_delivered && self.fin_sent
    }
}

/// Deterministic [`ProtocolEngine`] implementation.
#[derive(Debug)]
pub struct SimEngine {
    side: Side,
    version: u32,
    scid: ConnectionId,
    dcid: ConnectionId,
    odcid: Option<ConnectionId>,
    token: Vec<u8>,
    local: SocketAddr,
    peer: SocketAddr,
    trace_id: String,

    alpns: Vec<Vec<u8>>,
    alpn: Vec<u8>,
    idle_timeout: Option<Duration>,
    max_payload: usize,
    max_data: u64,
    max_stream_data_local: u64,
    max_stream_data_remote: u64,
    max_streams_bidi: u64,
    max_streams_uni: u64,

    // Handshake progress
    peer_seen: bool,
    retry_seen: bool,
    vn_seen: bool,
    hello_pending: bool,
    finished_pending: bool,
    handshake_done_pending: bool,
    established: bool,
    confirmed: bool,

    streams: BTreeMap<u64, StreamState>,
    readable: VecDeque<u64>,
    data_received: u64,

    close: CloseState,
    peer_error: Option<(bool, u64)>,

    next_pn: u32,
    last_activity: Option<Instant>,
    hello_sent_at: Option<Instant>,
    pto_deadline: Option<Instant>,
    pto_count: u32,
    drain_deadline: Option<Instant>,
    rtt: Duration,

    recv_count: usize,
    sent_count: usize,
    lost_count: usize,
}

impl SimEngine {
    fn new(
        side: Side,
        config: &SimConfig,
        scid: &ConnectionId,
        dcid: ConnectionId,
        local: SocketAddr,
        peer: SocketAddr,
    ) -> Self {
        let s = &config.settings;
        Self {
            side,
            version: s.version,
            scid: scid.clone(),
            dcid,
            odcid: None,
            token: Vec::new(),
            local,
            peer,
            trace_id: scid.to_string(),
            alpns: config.alpns.clone(),
            alpn: Vec::new(),
            idle_timeout: s.idle_timeout(),
            max_payload: s.max_udp_payload,
            max_data: s.initial_max_data,
            max_stream_data_local: s.initial_max_stream_data_bidi_local,
            max_stream_data_remote: s.initial_max_stream_data_bidi_remote,
            max_streams_bidi: s.initial_max_streams_bidi,
            max_streams_uni: s.initial_max_streams_uni,
            peer_seen: false,
            retry_seen: false,
            vn_seen: false,
            hello_pending: false,
            finished_pending: false,
            handshake_done_pending: false,
            established: false,
            confirmed: false,
            streams: BTreeMap::new(),
            readable: VecDeque::new(),
            data_received: 0,
            close: CloseState::Open,
            peer_error: None,
            next_pn: 0,
            last_activity: None,
            hello_sent_at: None,
            pto_deadline: None,
            pto_count: 0,
            drain_deadline: None,
            rtt: INITIAL_RTT,
            recv_count: 0,
            sent_count: 0,
            lost_count: 0,
        }
    }

    /// Original destination ID, when a Retry round trip happened.
    pub fn odcid(&self) -> Option<&ConnectionId> {
        self.odcid.as_ref()
    }

    /// Current destination ID.
    pub fn dcid(&self) -> &ConnectionId {
        &self.dcid
    }

    /// Address validation token the client echoes in its Initials.
    pub fn token(&self) -> &[u8] {
        &self.token
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Close frame received from the peer: (application, error code).
    pub fn peer_error(&self) -> Option<(bool, u64)> {
        self.peer_error
    }

    /// True once the server acknowledged the handshake (client) or the
    /// client's Finished arrived (server).
    pub fn is_confirmed(&self) -> bool {
        self.confirmed
    }

    fn pto(&self) -> Duration {
        let base = (self.rtt * 2).max(MIN_PTO);
        base * 2u32.pow(self.pto_count.min(MAX_PTO_BACKOFF))
    }

    fn idle_deadline(&self) -> Option<Instant> {
        let idle = self.idle_timeout?;
        self.last_activity.map(|t| t + idle)
    }

    fn sample_rtt(&mut self, now: Instant) {
        if let Some(sent) = self.hello_sent_at.take() {
            self.rtt = now.saturating_duration_since(sent);
        }
        self.pto_deadline = None;
        self.pto_count = 0;
    }

    /// Queue a transport close for a protocol error and hand the error back.
    fn fail(&mut self, err: Error) -> Error {
        if self.close == CloseState::Open {
            self.close = CloseState::Pending {
                app: false,
                code: err.to_wire(),
                reason: Vec::new(),
            };
        }
        err
    }

    fn enter_draining(&mut self, app: bool, code: u64, now: Instant) {
        debug!(
            trace_id = %self.trace_id,
            app,
            code,
            "peer closed connection"
        );
        self.peer_error = Some((app, code));
        if self.close != CloseState::Closed {
            self.close = CloseState::Draining;
            self.drain_deadline = Some(now + self.pto() * 3);
            self.pto_deadline = None;
        }
    }

    // ========================================================================
    // Receive path
    // ========================================================================

    fn recv_long(&mut self, buf: &[u8], hdr: &header::Header, offset: usize, now: Instant) -> Result<()> {
        if hdr.ty == PacketType::VersionNegotiation {
            return self.on_version_negotiation(hdr);
        }

        if hdr.version != self.version {
            return Err(Error::UnknownVersion);
        }

        if hdr.ty == PacketType::Retry {
            return self.on_retry(buf, hdr);
        }

        let (len, n) = varint::decode(&buf[offset..])?;
        let start = offset + n;
        let len = len as usize;
        if len < PN_LEN || buf.len() - start < len {
            return Err(Error::InvalidPacket);
        }
        let payload = &buf[start + PN_LEN..start + len];

        match (self.side, hdr.ty) {
            (Side::Server, PacketType::Initial) => {
                if self.dcid.is_empty() {
                    self.dcid = hdr.scid.clone();
                }
            }
            (Side::Client, PacketType::Handshake) => {
                if hdr.dcid != self.scid {
                    trace!(trace_id = %self.trace_id, "handshake packet for another connection");
                    return Ok(());
                }
                if !self.peer_seen {
                    self.peer_seen = true;
                    self.dcid = hdr.scid.clone();
                }
            }
            (Side::Server, PacketType::Handshake) => {}
            _ => return Ok(()),
        }

        self.recv_count += 1;
        self.process_frames(payload, now)
    }

    fn on_version_negotiation(&mut self, hdr: &header::Header) -> Result<()> {
        if self.side == Side::Server || self.peer_seen || self.vn_seen {
            return Ok(());
        }
        if hdr.dcid != self.scid || hdr.scid != self.dcid {
            return Ok(());
        }
        self.recv_count += 1;
        let offered = hdr.versions.as_deref().unwrap_or(&[]);
        match select_version(offered, self.version, SUPPORTED_VERSIONS) {
            Some(version) => {
                debug!(
                    trace_id = %self.trace_id,
                    from = self.version,
                    to = version,
                    "switching version after negotiation"
                );
                self.version = version;
                self.vn_seen = true;
                self.hello_pending = true;
                self.pto_deadline = None;
                Ok(())
            }
            None => {
                self.close = CloseState::Closed;
                Err(Error::UnknownVersion)
            }
        }
    }

    fn on_retry(&mut self, buf: &[u8], hdr: &header::Header) -> Result<()> {
        if self.side == Side::Server || self.peer_seen || self.retry_seen {
            return Ok(());
        }
        if hdr.dcid != self.scid || !verify_retry_integrity(self.dcid.as_bytes(), buf) {
            trace!(trace_id = %self.trace_id, "discarding invalid retry");
            return Ok(());
        }
        self.recv_count += 1;
        self.odcid = Some(std::mem::replace(&mut self.dcid, hdr.scid.clone()));
        self.token = hdr.token.clone().unwrap_or_default();
        self.retry_seen = true;
        self.hello_pending = true;
        self.pto_deadline = None;
        debug!(trace_id = %self.trace_id, new_dcid = %self.dcid, "retry accepted");
        Ok(())
    }

    fn recv_short(&mut self, buf: &[u8], hdr: &header::Header, offset: usize, now: Instant) -> Result<()> {
        if hdr.dcid != self.scid {
            trace!(trace_id = %self.trace_id, "short packet for another connection");
            return Ok(());
        }
        if buf.len() < offset + PN_LEN {
            return Err(Error::InvalidPacket);
        }
        self.recv_count += 1;
        self.process_frames(&buf[offset + PN_LEN..], now)
    }

    fn process_frames(&mut self, payload: &[u8], now: Instant) -> Result<()> {
        self.last_activity = Some(now);
        for frame in FrameIter::new(payload) {
            let frame = frame.map_err(|e| self.fail(e))?;
            match frame {
                Frame::Padding | Frame::Ping => {}
                Frame::ClientHello { alpns } => self.on_client_hello(alpns)?,
                Frame::ServerHello { alpn } => self.on_server_hello(alpn, now)?,
                Frame::Finished if self.side == Side::Server && !self.established => {
                    self.sample_rtt(now);
                    self.established = true;
                    self.confirmed = true;
                    self.handshake_done_pending = true;
                    debug!(trace_id = %self.trace_id, rtt = ?self.rtt, "handshake confirmed");
                }
                Frame::HandshakeDone if self.side == Side::Client => self.confirmed = true,
                Frame::Finished | Frame::HandshakeDone => {}
                Frame::Stream { id, data, fin } => {
                    self.on_stream(id, data, fin).map_err(|e| self.fail(e))?
                }
                Frame::ConnectionClose { app, code, .. } => {
                    self.enter_draining(app, code, now);
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn on_client_hello(&mut self, offered: &[u8]) -> Result<()> {
        if self.side == Side::Client {
            return Err(self.fail(Error::InvalidFrame));
        }
        if self.alpn.is_empty() {
            let offered = frame::split_alpns(offered).map_err(|e| self.fail(e))?;
            let selected = self
                .alpns
                .iter()
                .find(|ours| offered.iter().any(|theirs| theirs == &ours.as_slice()))
                .cloned();
            match selected {
                Some(alpn) => self.alpn = alpn,
                None => {
                    self.close = CloseState::Pending {
                        app: false,
                        code: NO_APPLICATION_PROTOCOL,
                        reason: Vec::new(),
                    };
                    return Err(Error::TlsFail);
                }
            }
        }
        // Duplicate hellos are answered again
        self.hello_pending = true;
        Ok(())
    }

    fn on_server_hello(&mut self, alpn: &[u8], now: Instant) -> Result<()> {
        if self.side == Side::Server {
            return Err(self.fail(Error::InvalidFrame));
        }
        if !self.established {
            if !self.alpns.iter().any(|ours| ours.as_slice() == alpn) {
                self.close = CloseState::Pending {
                    app: false,
                    code: NO_APPLICATION_PROTOCOL,
                    reason: Vec::new(),
                };
                return Err(Error::TlsFail);
            }
            self.alpn = alpn.to_vec();
            self.sample_rtt(now);
            self.established = true;
            self.hello_pending = false;
            debug!(
                trace_id = %self.trace_id,
                alpn = %String::from_utf8_lossy(alpn),
                rtt = ?self.rtt,
                "handshake completed"
            );
        }
        self.finished_pending = true;
        Ok(())
    }

    fn is_local_stream(&self, id: u64) -> bool {
        let server_initiated = id & 0x1 == 1;
        server_initiated == (self.side == Side::Server)
    }

    fn on_stream(&mut self, id: u64, data: &[u8], fin: bool) -> Result<()> {
        let local = self.is_local_stream(id);
        if !self.streams.contains_key(&id) {
            if local {
                return Err(Error::InvalidStreamState(id));
            }
            let limit = if id & 0x2 == 0 {
                self.max_streams_bidi
            } else {
                self.max_streams_uni
            };
            if id >> 2 >= limit {
                return Err(Error::StreamLimit);
            }
        }

        let window = if local {
            self.max_stream_data_local
        } else {
            self.max_stream_data_remote
        };
        let max_data = self.max_data;
        let received = self.data_received;
        let stream = self.streams.entry(id).or_default();

        if stream.recv_fin && !data.is_empty() {
            return Err(Error::FinalSize);
        }
        let end = stream.recv_off + data.len() as u64;
        if end > window || received + data.len() as u64 > max_data {
            return Err(Error::FlowControl);
        }

        stream.recv_buf.extend(data);
        stream.recv_off = end;
        stream.recv_fin |= fin;
        let readable = stream.is_readable();
        self.data_received += data.len() as u64;

        if readable && !self.readable.contains(&id) {
            self.readable.push_back(id);
        }
        Ok(())
    }

    // ========================================================================
    // Send path
    // ========================================================================

    fn write_long(&mut self, ty: u8, frames: &[Frame<'_>], pad_to: usize, out: &mut [u8]) -> Result<usize> {
        let mut payload = Vec::new();
        for frame in frames {
            frame.encode(&mut payload)?;
        }

        let mut hdr = Vec::with_capacity(64);
        hdr.put_u8(HEADER_FORM_BIT | FIXED_BIT | ty | 0x03);
        hdr.put_u32(self.version);
        hdr.put_u8(self.dcid.len() as u8);
        hdr.put_slice(self.dcid.as_bytes());
        hdr.put_u8(self.scid.len() as u8);
        hdr.put_slice(self.scid.as_bytes());
        if ty == LONG_PACKET_TYPE_INITIAL {
            varint::encode(self.token.len() as u64, &mut hdr)?;
            hdr.put_slice(&self.token);
        }

        let total = |p: usize| hdr.len() + varint::encoded_len((PN_LEN + p) as u64) + PN_LEN + p;
        while total(payload.len()) < pad_to {
            payload.put_u8(frame::FRAME_PADDING);
        }

        let len = total(payload.len());
        if len > out.len().min(self.max_payload) {
            return Err(Error::BufferTooShort);
        }

        let mut w = &mut out[..len];
        w.put_slice(&hdr);
        varint::encode((PN_LEN + payload.len()) as u64, &mut w)?;
        w.put_u32(self.next_pn);
        w.put_slice(&payload);
        self.next_pn = self.next_pn.wrapping_add(1);
        Ok(len)
    }

    fn write_short(&mut self, frames: &[Frame<'_>], out: &mut [u8]) -> Result<usize> {
        let len = 1 + self.dcid.len() + PN_LEN + frames.iter().map(|f| f.wire_len()).sum::<usize>();
        if len > out.len().min(self.max_payload) {
            return Err(Error::BufferTooShort);
        }
        let mut w = &mut out[..len];
        w.put_u8(FIXED_BIT | 0x03);
        w.put_slice(self.dcid.as_bytes());
        w.put_u32(self.next_pn);
        for frame in frames {
            frame.encode(&mut w)?;
        }
        self.next_pn = self.next_pn.wrapping_add(1);
        Ok(len)
    }

    fn send_close(&mut self, app: bool, code: u64, reason: Vec<u8>, out: &mut [u8], now: Instant) -> Result<usize> {
        let (app, code) = if !self.established && app {
            (false, APPLICATION_ERROR)
        } else {
            (app, code)
        };
        let frame = Frame::ConnectionClose {
            app,
            code,
            reason: &reason,
        };
        let written = if self.established {
            self.write_short(&[frame], out)?
        } else if self.side == Side::Client {
            self.write_long(LONG_PACKET_TYPE_INITIAL, &[frame], MIN_INITIAL_SIZE, out)?
        } else {
            self.write_long(LONG_PACKET_TYPE_HANDSHAKE, &[frame], 0, out)?
        };
        self.close = CloseState::Closing;
        self.drain_deadline = Some(now + self.pto() * 3);
        self.pto_deadline = None;
        debug!(trace_id = %self.trace_id, app, code, "sent connection close");
        Ok(written)
    }

    fn send_hello(&mut self, out: &mut [u8], now: Instant) -> Result<usize> {
        let written = match self.side {
            Side::Client => {
                let alpns = wire_alpns(&self.alpns);
                self.write_long(
                    LONG_PACKET_TYPE_INITIAL,
                    &[Frame::ClientHello { alpns: &alpns }],
                    MIN_INITIAL_SIZE,
                    out,
                )?
            }
            Side::Server => {
                let alpn = self.alpn.clone();
                self.write_long(
                    LONG_PACKET_TYPE_HANDSHAKE,
                    &[Frame::ServerHello { alpn: &alpn }],
                    0,
                    out,
                )?
            }
        };
        self.hello_pending = false;
        self.hello_sent_at = Some(now);
        self.pto_deadline = Some(now + self.pto());
        Ok(written)
    }

    /// Fill one short packet with HANDSHAKE_DONE and pending stream data.
    fn send_application(&mut self, out: &mut [u8]) -> Result<usize> {
        let budget = out.len().min(self.max_payload);
        let mut space = budget.saturating_sub(1 + self.dcid.len() + PN_LEN);

        // (id, bytes, fin) chunks taken from the send buffers
        let mut chunks: Vec<(u64, Vec<u8>, bool)> = Vec::new();
        let handshake_done = self.handshake_done_pending && space >= 1;
        if handshake_done {
            space -= 1;
        }

        for (&id, stream) in self.streams.iter_mut() {
            if !stream.has_pending_send() {
                continue;
            }
            let overhead = 1 + varint::encoded_len(id) + varint::encoded_len(space as u64);
            if space < overhead || (space == overhead && !stream.send_buf.is_empty()) {
                break;
            }
            let take = stream.send_buf.len().min(space - overhead);
            let data: Vec<u8> = stream.send_buf.drain(..take).collect();
            let fin = stream.send_fin && stream.send_buf.is_empty();
            if fin {
                stream.fin_sent = true;
            }
            space -= 1 + varint::encoded_len(id) + varint::encoded_len(data.len() as u64) + data.len();
            chunks.push((id, data, fin));
        }

        if !handshake_done && chunks.is_empty() {
            return Err(Error::Done);
        }

        let mut frames = Vec::with_capacity(chunks.len() + 1);
        if handshake_done {
            frames.push(Frame::HandshakeDone);
        }
        for (id, data, fin) in &chunks {
            frames.push(Frame::Stream {
                id: *id,
                data,
                fin: *fin,
            });
        }
        let written = self.write_short(&frames, out)?;
        self.handshake_done_pending &= !handshake_done;
        self.reap_streams();
        Ok(written)
    }

    fn reap_streams(&mut self) {
        let readable = &self.readable;
        self.streams
            .retain(|id, s| !s.is_complete() || readable.contains(id));
    }
}

fn wire_alpns(alpns: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    for proto in alpns {
        out.push(proto.len() as u8);
        out.extend_from_slice(proto);
    }
    out
}

impl ProtocolEngine for SimEngine {
    type Config = SimConfig;

    fn configure(settings: &TransportSettings) -> Result<SimConfig> {
        settings.validate().map_err(|errors| {
            debug!(?errors, "rejected transport settings");
            Error::InvalidConfig
        })?;
        Ok(SimConfig {
            settings: settings.clone(),
            alpns: settings
                .application_protos
                .iter()
                .map(|p| p.as_bytes().to_vec())
                .collect(),
        })
    }

    fn connect(
        config: &mut SimConfig,
        _server_name: Option<&str>,
        scid: &ConnectionId,
        local: SocketAddr,
        peer: SocketAddr,
    ) -> Result<Self> {
        let mut dcid = [0u8; CLIENT_DCID_LEN];
        getrandom::getrandom(&mut dcid).map_err(|_| Error::CryptoFail)?;
        let dcid = ConnectionId::from_slice(&dcid).ok_or(Error::InvalidState)?;

        let mut conn = SimEngine::new(Side::Client, config, scid, dcid, local, peer);
        conn.hello_pending = true;
        Ok(conn)
    }

    fn accept(
        config: &mut SimConfig,
        scid: &ConnectionId,
        odcid: Option<&ConnectionId>,
        local: SocketAddr,
        peer: SocketAddr,
    ) -> Result<Self> {
        if !Self::version_is_supported(config.settings.version) {
            return Err(Error::UnknownVersion);
        }
        let mut conn = SimEngine::new(Side::Server, config, scid, ConnectionId::empty(), local, peer);
        conn.odcid = odcid.cloned();
        Ok(conn)
    }

    fn recv(&mut self, buf: &mut [u8], info: RecvInfo) -> Result<usize> {
        if matches!(self.close, CloseState::Closed) {
            return Err(Error::Done);
        }
        if info.from != self.peer {
            trace!(trace_id = %self.trace_id, from = %info.from, "datagram from unexpected peer");
        }

        let now = Instant::now();
        let len = buf.len();
        let (hdr, offset) = header::parse(buf, self.scid.len())?;

        if self.close != CloseState::Open && !matches!(self.close, CloseState::Pending { .. }) {
            // Closing or draining: nothing but the timer matters now
            return Ok(len);
        }

        if hdr.ty.is_long_header() {
            self.recv_long(buf, &hdr, offset, now)?;
        } else {
            self.recv_short(buf, &hdr, offset, now)?;
        }
        Ok(len)
    }

    fn send(&mut self, out: &mut [u8]) -> Result<(usize, SendInfo)> {
        let now = Instant::now();
        let info = SendInfo { to: self.peer };

        let written = match &self.close {
            CloseState::Pending { app, code, reason } => {
                let (app, code, reason) = (*app, *code, reason.clone());
                self.send_close(app, code, reason, out, now)?
            }
            CloseState::Open => {
                if self.hello_pending && (self.side == Side::Client || !self.alpn.is_empty()) {
                    self.send_hello(out, now)?
                } else if self.finished_pending {
                    self.finished_pending = false;
                    self.write_long(LONG_PACKET_TYPE_HANDSHAKE, &[Frame::Finished], 0, out)?
                } else if self.established {
                    self.send_application(out)?
                } else {
                    return Err(Error::Done);
                }
            }
            _ => return Err(Error::Done),
        };

        self.sent_count += 1;
        self.last_activity = Some(now);
        Ok((written, info))
    }

    fn stream_send(&mut self, stream_id: u64, data: &[u8], fin: bool) -> Result<usize> {
        if self.close != CloseState::Open {
            return Err(Error::InvalidState);
        }
        if !self.established {
            return Err(Error::InvalidState);
        }
        if !self.streams.contains_key(&stream_id) && !self.is_local_stream(stream_id) {
            return Err(Error::InvalidStreamState(stream_id));
        }
        let stream = self.streams.entry(stream_id).or_default();
        if stream.send_fin {
            return Err(Error::FinalSize);
        }
        stream.send_buf.extend(data);
        stream.send_fin = fin;
        Ok(data.len())
    }

    fn stream_recv(&mut self, stream_id: u64, out: &mut [u8]) -> Result<(usize, bool)> {
        let stream = self
            .streams
            .get_mut(&stream_id)
            .ok_or(Error::InvalidStreamState(stream_id))?;
        if !stream.is_readable() {
            return Err(Error::Done);
        }

        let n = stream.recv_buf.len().min(out.len());
        for (dst, src) in out.iter_mut().zip(stream.recv_buf.drain(..n)) {
            *dst = src;
        }
        let fin = stream.recv_fin && stream.recv_buf.is_empty();
        if fin {
            stream.fin_delivered = true;
        }
        if stream.is_complete() && !stream.is_readable() {
            self.streams.remove(&stream_id);
        }
        Ok((n, fin))
    }

    fn next_readable_stream(&mut self) -> Option<u64> {
        while let Some(id) = self.readable.pop_front() {
            if self.streams.get(&id).map_or(false, StreamState::is_readable) {
                return Some(id);
            }
        }
        None
    }

    fn timeout(&self) -> Option<Duration> {
        if self.close == CloseState::Closed {
            return None;
        }
        let deadline = if matches!(self.close, CloseState::Closing | CloseState::Draining) {
            self.drain_deadline
        } else {
            [self.pto_deadline, self.idle_deadline()]
                .into_iter()
                .flatten()
                .min()
        };
        deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    fn on_timeout(&mut self) {
        let now = Instant::now();
        if self.close == CloseState::Closed {
            return;
        }

        if self.drain_deadline.map_or(false, |d| now >= d) {
            trace!(trace_id = %self.trace_id, "drain period over");
            self.close = CloseState::Closed;
            return;
        }

        if self.idle_deadline().map_or(false, |d| now >= d) {
            debug!(trace_id = %self.trace_id, "idle timeout");
            self.close = CloseState::Closed;
            return;
        }

        if self.pto_deadline.map_or(false, |d| now >= d) {
            self.pto_deadline = None;
            if !self.established || self.side == Side::Server {
                self.pto_count += 1;
                self.lost_count += 1;
                self.hello_pending = true;
                trace!(trace_id = %self.trace_id, pto_count = self.pto_count, "probe timeout");
            }
        }
    }

    fn is_established(&self) -> bool {
        self.established
    }

    fn is_draining(&self) -> bool {
        matches!(self.close, CloseState::Closing | CloseState::Draining)
    }

    fn is_closed(&self) -> bool {
        self.close == CloseState::Closed
    }

    fn close(&mut self, app: bool, err: u64, reason: &[u8]) -> Result<()> {
        if self.close != CloseState::Open {
            return Err(Error::Done);
        }
        self.close = CloseState::Pending {
            app,
            code: err,
            reason: reason.to_vec(),
        };
        Ok(())
    }

    fn application_proto(&self) -> &[u8] {
        &self.alpn
    }

    fn stats(&self) -> Stats {
        Stats {
            recv: self.recv_count,
            sent: self.sent_count,
            lost: self.lost_count,
            rtt: self.rtt,
            cwnd: 10 * self.max_payload,
        }
    }

    fn trace_id(&self) -> &str {
        &self.trace_id
    }
}
