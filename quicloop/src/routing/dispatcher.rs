//! # Packet Dispatcher (RFC 9000 Sections 5.2, 6 and 8.1)
//!
//! Decides what happens to every datagram the server receives:
//!
//! 1. Destination ID is registered: the owning connection gets it.
//! 2. Unsupported version: a Version Negotiation reply, no state.
//! 3. No token: a Retry reply with a fresh ID and token, no state.
//! 4. Token: validated; a bad one is dropped without a reply, a good one
//!    creates and registers a connection which then gets the datagram. A
//!    token only validates on an Initial addressed to the ID its Retry
//!    handed out, so clients never choose the registered ID.
//!
//! Registry membership is checked first so established connections are
//! never revalidated. The version is checked before the packet type, which
//! is only defined for supported versions. With Retry disabled, steps 3 and 4 become "accept
//! under an ID derived from the client's destination ID".

use quicloop_engine::error::INTERNAL_ERROR;
use quicloop_engine::{ConnectionId, Header, PacketType, ProtocolEngine, MAX_CONN_ID_LEN};
use std::fmt;
use std::net::SocketAddr;
use tracing::{debug, info, trace, warn};

use crate::connection::Connection;
use crate::netio::MAX_DATAGRAM_SIZE;
use crate::routing::cid_generator::{ConnectionIdGenerator, DerivedConnectionIds};
use crate::routing::registry::ConnectionRegistry;
use crate::token::TokenService;
use crate::Result;

/// What the dispatcher did with a datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Delivered to the registered connection with this ID.
    Routed(ConnectionId),
    /// A new connection was registered under this ID and fed the datagram.
    Accepted(ConnectionId),
    /// Version Negotiation datagram to send back to the source.
    Negotiate(Vec<u8>),
    /// Retry datagram to send back to the source.
    Retry(Vec<u8>),
    Dropped(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Header could not be parsed.
    Malformed,
    /// Not a registered ID and not something that can open a connection.
    UnknownConnection,
    /// Connection-opening datagram below the configured minimum size.
    TooSmall,
    /// Token failed validation.
    InvalidToken,
    /// The engine refused the new connection or a reply could not be encoded.
    Refused,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DropReason::Malformed => "malformed header",
            DropReason::UnknownConnection => "unknown connection",
            DropReason::TooSmall => "datagram too small",
            DropReason::InvalidToken => "invalid token",
            DropReason::Refused => "refused",
        };
        f.write_str(s)
    }
}

/// Address validation policy for new connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOptions {
    /// Require a Retry round trip before accepting.
    pub retry: bool,
    /// Drop connection-opening datagrams smaller than this. Zero disables.
    pub min_initial_size: usize,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            retry: true,
            min_initial_size: 0,
        }
    }
}

/// Server-side demultiplexer.
pub struct PacketDispatcher<E: ProtocolEngine> {
    config: E::Config,
    local: SocketAddr,
    tokens: TokenService,
    cids: Box<dyn ConnectionIdGenerator>,
    derived: DerivedConnectionIds,
    options: DispatchOptions,
}

impl<E: ProtocolEngine> PacketDispatcher<E> {
    pub fn new(
        config: E::Config,
        local: SocketAddr,
        tokens: TokenService,
        cids: Box<dyn ConnectionIdGenerator>,
        derived: DerivedConnectionIds,
        options: DispatchOptions,
    ) -> Self {
        Self {
            config,
            local,
            tokens,
            cids,
            derived,
            options,
        }
    }

    pub fn options(&self) -> DispatchOptions {
        self.options
    }

    /// Route one datagram received from `from`.
    ///
    /// Errors only when a fresh connection ID cannot be generated.
    pub fn dispatch(
        &mut self,
        registry: &mut ConnectionRegistry<E>,
        buf: &mut [u8],
        from: SocketAddr,
    ) -> Result<Dispatch> {
        let hdr = match E::parse_header(buf, MAX_CONN_ID_LEN) {
            Ok(hdr) => hdr,
            Err(e) => {
                debug!(peer = %from, error = %e, len = buf.len(), "dropping unparseable datagram");
                return Ok(Dispatch::Dropped(DropReason::Malformed));
            }
        };
        trace!(peer = %from, ty = ?hdr.ty, dcid = %hdr.dcid, scid = %hdr.scid, "datagram");

        if let Some(conn) = registry.get_mut(hdr.dcid.as_bytes()) {
            deliver(conn, buf, from);
            return Ok(Dispatch::Routed(hdr.dcid));
        }

        if matches!(hdr.ty, PacketType::Short | PacketType::VersionNegotiation) {
            trace!(peer = %from, ty = ?hdr.ty, "dropping packet for unknown connection");
            return Ok(Dispatch::Dropped(DropReason::UnknownConnection));
        }

        // Type bits mean nothing under a version this server does not speak
        let supported = E::version_is_supported(hdr.version);
        if supported && hdr.ty == PacketType::Retry {
            trace!(peer = %from, "dropping retry sent to a server");
            return Ok(Dispatch::Dropped(DropReason::UnknownConnection));
        }

        if buf.len() < self.options.min_initial_size {
            debug!(peer = %from, len = buf.len(), "dropping undersized datagram");
            return Ok(Dispatch::Dropped(DropReason::TooSmall));
        }

        if !supported {
            return Ok(self.negotiate(&hdr, from));
        }

        if hdr.ty != PacketType::Initial {
            trace!(peer = %from, ty = ?hdr.ty, "dropping packet for unknown connection");
            return Ok(Dispatch::Dropped(DropReason::UnknownConnection));
        }

        if !self.options.retry {
            return Ok(self.accept_without_retry(registry, &hdr, buf, from));
        }

        if !hdr.has_token() {
            return self.retry(&hdr, from);
        }

        let token = hdr.token.as_deref().unwrap_or_default();
        let Some(odcid) = self.tokens.validate(&from, &hdr.dcid, token) else {
            trace!(peer = %from, "dropping initial with invalid token");
            return Ok(Dispatch::Dropped(DropReason::InvalidToken));
        };

        Ok(self.accept(registry, hdr.dcid.clone(), Some(&odcid), buf, from))
    }

    fn negotiate(&self, hdr: &Header, from: SocketAddr) -> Dispatch {
        let mut out = [0u8; MAX_DATAGRAM_SIZE];
        match E::negotiate_version(&hdr.scid, &hdr.dcid, &mut out) {
            Ok(written) => {
                debug!(peer = %from, version = hdr.version, "version negotiation");
                Dispatch::Negotiate(out[..written].to_vec())
            }
            Err(e) => {
                warn!(peer = %from, error = %e, "failed to encode version negotiation");
                Dispatch::Dropped(DropReason::Refused)
            }
        }
    }

    fn retry(&self, hdr: &Header, from: SocketAddr) -> Result<Dispatch> {
        let new_scid = self.cids.generate()?;
        let token = self.tokens.mint(&from, &hdr.dcid, &new_scid);

        let mut out = [0u8; MAX_DATAGRAM_SIZE];
        match E::retry(&hdr.scid, &hdr.dcid, &new_scid, &token, hdr.version, &mut out) {
            Ok(written) => {
                debug!(peer = %from, odcid = %hdr.dcid, new_scid = %new_scid, "stateless retry");
                Ok(Dispatch::Retry(out[..written].to_vec()))
            }
            Err(e) => {
                warn!(peer = %from, error = %e, "failed to encode retry");
                Ok(Dispatch::Dropped(DropReason::Refused))
            }
        }
    }

    fn accept_without_retry(
        &mut self,
        registry: &mut ConnectionRegistry<E>,
        hdr: &Header,
        buf: &mut [u8],
        from: SocketAddr,
    ) -> Dispatch {
        let scid = self.derived.derive(hdr.dcid.as_bytes());
        // Retransmitted Initials still carry the client's first destination ID
        if let Some(conn) = registry.get_mut(scid.as_bytes()) {
            deliver(conn, buf, from);
            return Dispatch::Routed(scid);
        }
        self.accept(registry, scid, None, buf, from)
    }

    fn accept(
        &mut self,
        registry: &mut ConnectionRegistry<E>,
        scid: ConnectionId,
        odcid: Option<&ConnectionId>,
        buf: &mut [u8],
        from: SocketAddr,
    ) -> Dispatch {
        let conn = match Connection::accept(&mut self.config, scid.clone(), odcid, self.local, from) {
            Ok(conn) => conn,
            Err(e) => {
                warn!(peer = %from, scid = %scid, error = %e, "engine refused connection");
                return Dispatch::Dropped(DropReason::Refused);
            }
        };

        match registry.insert(conn) {
            Ok(conn) => {
                info!(peer = %from, scid = %scid, trace_id = %conn.trace_id(), "new connection");
                deliver(conn, buf, from);
                Dispatch::Accepted(scid)
            }
            Err(_) => {
                warn!(peer = %from, scid = %scid, "connection ID already registered");
                Dispatch::Dropped(DropReason::Refused)
            }
        }
    }
}

/// Feed a datagram to a connection, closing it on a fatal receive error.
fn deliver<E: ProtocolEngine>(conn: &mut Connection<E>, buf: &mut [u8], from: SocketAddr) {
    match conn.recv(buf, from) {
        Ok(read) => trace!(trace_id = %conn.trace_id(), bytes = read, "processed datagram"),
        Err(quicloop_engine::Error::Done) => {}
        Err(e) => {
            warn!(trace_id = %conn.trace_id(), peer = %from, error = %e, "recv failed");
            let _ = conn.close(false, INTERNAL_ERROR, b"fail");
        }
    }
}
