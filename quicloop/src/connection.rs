//! # Connection
//!
//! Owns one protocol-engine handle together with the identity the
//! orchestration layer routes by: the connection's own source ID and the
//! address its last datagram came from. The handle is not `Clone`; it is
//! released when the `Connection` is dropped, which the server does only
//! after the engine reports closed.

use quicloop_engine::{ConnectionId, ProtocolEngine, RecvInfo, Stats};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

/// A timer that is already due is reported with this delay.
pub const MIN_TIMER_DELAY: Duration = Duration::from_millis(1);

/// Lifecycle as observed from outside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, nothing exchanged yet.
    Initial,
    Handshaking,
    Established,
    /// A close was requested or the engine is draining.
    Closing,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Initial => "initial",
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Established => "established",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// One QUIC connection driven by the session loops.
pub struct Connection<E: ProtocolEngine> {
    engine: E,
    scid: ConnectionId,
    local: SocketAddr,
    peer: SocketAddr,
    active: bool,
    close_requested: bool,
}

impl<E: ProtocolEngine> Connection<E> {
    /// Open a client connection towards `peer`.
    pub fn connect(
        config: &mut E::Config,
        server_name: Option<&str>,
        scid: ConnectionId,
        local: SocketAddr,
        peer: SocketAddr,
    ) -> quicloop_engine::Result<Self> {
        let engine = E::connect(config, server_name, &scid, local, peer)?;
        Ok(Self::from_engine(engine, scid, local, peer))
    }

    /// Create the server side of a connection under `scid`.
    pub fn accept(
        config: &mut E::Config,
        scid: ConnectionId,
        odcid: Option<&ConnectionId>,
        local: SocketAddr,
        peer: SocketAddr,
    ) -> quicloop_engine::Result<Self> {
        let engine = E::accept(config, &scid, odcid, local, peer)?;
        Ok(Self::from_engine(engine, scid, local, peer))
    }

    pub fn from_engine(engine: E, scid: ConnectionId, local: SocketAddr, peer: SocketAddr) -> Self {
        Self {
            engine,
            scid,
            local,
            peer,
            active: false,
            close_requested: false,
        }
    }

    /// Feed one datagram received from `from`.
    ///
    /// `Err(Done)` means the engine had nothing to do with it.
    pub fn recv(&mut self, buf: &mut [u8], from: SocketAddr) -> quicloop_engine::Result<usize> {
        self.peer = from;
        let info = RecvInfo {
            from,
            to: self.local,
        };
        let read = self.engine.recv(buf, info)?;
        self.active = true;
        Ok(read)
    }

    /// Write the next outbound datagram and return where it goes.
    pub fn send(&mut self, out: &mut [u8]) -> quicloop_engine::Result<(usize, SocketAddr)> {
        let (written, info) = self.engine.send(out)?;
        self.active = true;
        Ok((written, info.to))
    }

    pub fn stream_send(&mut self, stream_id: u64, data: &[u8], fin: bool) -> quicloop_engine::Result<usize> {
        self.engine.stream_send(stream_id, data, fin)
    }

    pub fn stream_recv(&mut self, stream_id: u64, out: &mut [u8]) -> quicloop_engine::Result<(usize, bool)> {
        self.engine.stream_recv(stream_id, out)
    }

    pub fn next_readable_stream(&mut self) -> Option<u64> {
        self.engine.next_readable_stream()
    }

    /// Delay until the engine's next timer, `None` when none is armed.
    ///
    /// Never zero: a timer that is already due reports [`MIN_TIMER_DELAY`].
    pub fn time_remaining(&self) -> Option<Duration> {
        if self.engine.is_closed() {
            return None;
        }
        self.engine.timeout().map(|d| d.max(MIN_TIMER_DELAY))
    }

    pub fn on_timeout(&mut self) {
        self.engine.on_timeout();
    }

    pub fn is_established(&self) -> bool {
        self.engine.is_established()
    }

    pub fn is_closed(&self) -> bool {
        self.engine.is_closed()
    }

    /// Start closing. `Err(Done)` when a close is already under way.
    pub fn close(&mut self, app: bool, err: u64, reason: &[u8]) -> quicloop_engine::Result<()> {
        let result = self.engine.close(app, err, reason);
        if result.is_ok() {
            self.close_requested = true;
        }
        result
    }

    pub fn state(&self) -> ConnectionState {
        if self.engine.is_closed() {
            ConnectionState::Closed
        } else if self.close_requested || self.engine.is_draining() {
            ConnectionState::Closing
        } else if self.engine.is_established() {
            ConnectionState::Established
        } else if self.active {
            ConnectionState::Handshaking
        } else {
            ConnectionState::Initial
        }
    }

    pub fn stats(&self) -> Stats {
        self.engine.stats()
    }

    /// The ID this connection is registered under.
    pub fn source_id(&self) -> &ConnectionId {
        &self.scid
    }

    /// Address of the most recent datagram from the peer.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn local(&self) -> SocketAddr {
        self.local
    }

    pub fn application_proto(&self) -> &[u8] {
        self.engine.application_proto()
    }

    pub fn trace_id(&self) -> &str {
        self.engine.trace_id()
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }
}

impl<E: ProtocolEngine> fmt::Debug for Connection<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("scid", &self.scid)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}
