//! # quiche Adapter
//!
//! [`ProtocolEngine`] over cloudflare's quiche. Real TLS 1.3, real packet
//! protection; stateless packets use quiche's own Retry integrity tag so
//! interop clients accept them.

#![forbid(unsafe_code)]

use core::time::Duration;
use std::net::SocketAddr;

use tracing::trace;

use crate::engine::ProtocolEngine;
use crate::error::{Error, Result};
use crate::packet::header::HEADER_FORM_BIT;
use crate::packet::{Header, PacketType};
use crate::settings::TransportSettings;
use crate::types::{ConnectionId, RecvInfo, SendInfo, Stats};
use crate::version::VERSION_NEGOTIATION;

pub struct QuicheConfig {
    inner: quiche::Config,
}

pub struct QuicheEngine {
    conn: quiche::Connection,
}

impl QuicheEngine {
    pub fn inner(&self) -> &quiche::Connection {
        &self.conn
    }
}

fn map_err(e: quiche::Error) -> Error {
    match e {
        quiche::Error::Done => Error::Done,
        quiche::Error::BufferTooShort => Error::BufferTooShort,
        quiche::Error::UnknownVersion => Error::UnknownVersion,
        quiche::Error::InvalidFrame => Error::InvalidFrame,
        quiche::Error::InvalidPacket => Error::InvalidPacket,
        quiche::Error::InvalidState => Error::InvalidState,
        quiche::Error::InvalidStreamState(id) => Error::InvalidStreamState(id),
        quiche::Error::InvalidTransportParam => Error::InvalidTransportParam,
        quiche::Error::CryptoFail => Error::CryptoFail,
        quiche::Error::TlsFail => Error::TlsFail,
        quiche::Error::FlowControl => Error::FlowControl,
        quiche::Error::StreamLimit => Error::StreamLimit,
        quiche::Error::FinalSize => Error::FinalSize,
        other => {
            trace!(error = %other, "unmapped quiche error");
            Error::InvalidState
        }
    }
}

fn quiche_cid(cid: &ConnectionId) -> quiche::ConnectionId<'_> {
    quiche::ConnectionId::from_ref(cid.as_bytes())
}

impl ProtocolEngine for QuicheEngine {
    type Config = QuicheConfig;

    fn configure(s: &TransportSettings) -> Result<QuicheConfig> {
        let mut config = quiche::Config::new(s.version).map_err(map_err)?;

        let protos: Vec<&[u8]> = s.application_protos.iter().map(|p| p.as_bytes()).collect();
        config.set_application_protos(&protos).map_err(map_err)?;

        config.set_max_idle_timeout(s.idle_timeout_ms);
        config.set_max_recv_udp_payload_size(s.max_udp_payload);
        config.set_max_send_udp_payload_size(s.max_udp_payload);
        config.set_initial_max_data(s.initial_max_data);
        config.set_initial_max_stream_data_bidi_local(s.initial_max_stream_data_bidi_local);
        config.set_initial_max_stream_data_bidi_remote(s.initial_max_stream_data_bidi_remote);
        config.set_initial_max_stream_data_uni(s.initial_max_stream_data_uni);
        config.set_initial_max_streams_bidi(s.initial_max_streams_bidi);
        config.set_initial_max_streams_uni(s.initial_max_streams_uni);
        config.set_disable_active_migration(s.disable_active_migration);
        config.verify_peer(s.verify_peer);
        config.grease(s.grease);

        if let (Some(cert), Some(key)) = (&s.cert_path, &s.key_path) {
            config.load_cert_chain_from_pem_file(cert).map_err(map_err)?;
            config.load_priv_key_from_pem_file(key).map_err(map_err)?;
        }
        if let Some(ca) = &s.ca_path {
            config
                .load_verify_locations_from_directory(ca)
                .map_err(map_err)?;
        }

        Ok(QuicheConfig { inner: config })
    }

    fn connect(
        config: &mut QuicheConfig,
        server_name: Option<&str>,
        scid: &ConnectionId,
        local: SocketAddr,
        peer: SocketAddr,
    ) -> Result<Self> {
        let conn = quiche::connect(server_name, &quiche_cid(scid), local, peer, &mut config.inner)
            .map_err(map_err)?;
        Ok(QuicheEngine { conn })
    }

    fn accept(
        config: &mut QuicheConfig,
        scid: &ConnectionId,
        odcid: Option<&ConnectionId>,
        local: SocketAddr,
        peer: SocketAddr,
    ) -> Result<Self> {
        let odcid = odcid.map(quiche_cid);
        let conn = quiche::accept(&quiche_cid(scid), odcid.as_ref(), local, peer, &mut config.inner)
            .map_err(map_err)?;
        Ok(QuicheEngine { conn })
    }

    fn recv(&mut self, buf: &mut [u8], info: RecvInfo) -> Result<usize> {
        let info = quiche::RecvInfo {
            from: info.from,
            to: info.to,
        };
        self.conn.recv(buf, info).map_err(map_err)
    }

    fn send(&mut self, out: &mut [u8]) -> Result<(usize, SendInfo)> {
        let (len, info) = self.conn.send(out).map_err(map_err)?;
        Ok((len, SendInfo { to: info.to }))
    }

    fn stream_send(&mut self, stream_id: u64, data: &[u8], fin: bool) -> Result<usize> {
        self.conn.stream_send(stream_id, data, fin).map_err(map_err)
    }

    fn stream_recv(&mut self, stream_id: u64, out: &mut [u8]) -> Result<(usize, bool)> {
        self.conn.stream_recv(stream_id, out).map_err(map_err)
    }

    fn next_readable_stream(&mut self) -> Option<u64> {
        self.conn.stream_readable_next()
    }

    fn timeout(&self) -> Option<Duration> {
        self.conn.timeout()
    }

    fn on_timeout(&mut self) {
        self.conn.on_timeout();
    }

    fn is_established(&self) -> bool {
        self.conn.is_established()
    }

    fn is_draining(&self) -> bool {
        self.conn.is_draining()
    }

    fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }

    fn close(&mut self, app: bool, err: u64, reason: &[u8]) -> Result<()> {
        self.conn.close(app, err, reason).map_err(map_err)
    }

    fn application_proto(&self) -> &[u8] {
        self.conn.application_proto()
    }

    fn stats(&self) -> Stats {
        let s = self.conn.stats();
        let mut stats = Stats {
            recv: s.recv,
            sent: s.sent,
            lost: s.lost,
            ..Default::default()
        };
        if let Some(path) = self.conn.path_stats().next() {
            stats.rtt = path.rtt;
            stats.cwnd = path.cwnd;
        }
        stats
    }

    fn trace_id(&self) -> &str {
        self.conn.trace_id()
    }

    fn parse_header(buf: &mut [u8], dcid_len: usize) -> Result<Header> {
        if let Some(version) = long_header_version(buf) {
            if version != VERSION_NEGOTIATION && !quiche::version_is_supported(version) {
                return Header::from_slice(buf, dcid_len);
            }
        }
        let hdr = quiche::Header::from_slice(buf, dcid_len).map_err(map_err)?;
        let ty = match hdr.ty {
            quiche::Type::Initial => PacketType::Initial,
            quiche::Type::ZeroRTT => PacketType::ZeroRtt,
            quiche::Type::Handshake => PacketType::Handshake,
            quiche::Type::Retry => PacketType::Retry,
            quiche::Type::VersionNegotiation => PacketType::VersionNegotiation,
            quiche::Type::Short => PacketType::Short,
        };
        Ok(Header {
            ty,
            version: hdr.version,
            dcid: ConnectionId::from_slice(&hdr.dcid).ok_or(Error::InvalidPacket)?,
            scid: ConnectionId::from_slice(&hdr.scid).ok_or(Error::InvalidPacket)?,
            token: hdr.token,
            versions: hdr.versions,
        })
    }

    fn negotiate_version(scid: &ConnectionId, dcid: &ConnectionId, out: &mut [u8]) -> Result<usize> {
        quiche::negotiate_version(&quiche_cid(scid), &quiche_cid(dcid), out).map_err(map_err)
    }

    fn retry(
        scid: &ConnectionId,
        dcid: &ConnectionId,
        new_scid: &ConnectionId,
        token: &[u8],
        version: u32,
        out: &mut [u8],
    ) -> Result<usize> {
        quiche::retry(
            &quiche_cid(scid),
            &quiche_cid(dcid),
            &quiche_cid(new_scid),
            token,
            version,
            out,
        )
        .map_err(map_err)
    }

    fn version_is_supported(version: u32) -> bool {
        quiche::version_is_supported(version)
    }
}

fn long_header_version(buf: &[u8]) -> Option<u32> {
    match buf {
        [first, a, b, c, d, ..] if first & HEADER_FORM_BIT != 0 => Some(u32::from_be_bytes([*a, *b, *c, *d])),
        _ => None,
    }
}
