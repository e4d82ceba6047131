//! Client session: one connection, one request.
//!
//! ```text
//! NotStarted ──first flush──▶ AwaitingEstablishment ──request sent──▶ RequestSent
//!      │                              │                                    │
//!      └──────────────────────────────┴──────── engine closed ────────────▶ Closed
//! ```

use quicloop_engine::error::INTERNAL_ERROR;
use quicloop_engine::{ProtocolEngine, Stats, TransportSettings};
use std::fmt;
use std::net::{SocketAddr, UdpSocket};
use tracing::{debug, info, trace, warn};

use crate::apps::{request_line, HqClient, REQUEST_STREAM_ID};
use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::netio::{recv_with_deadline, MAX_DATAGRAM_SIZE, RECV_BUFFER_SIZE};
use crate::routing::{ConnectionIdGenerator, RandomConnectionIdGenerator};
use crate::stream_io::drain_readable;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    NotStarted,
    AwaitingEstablishment,
    RequestSent,
    Closed,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClientState::NotStarted => "not-started",
            ClientState::AwaitingEstablishment => "awaiting-establishment",
            ClientState::RequestSent => "request-sent",
            ClientState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Outcome of [`ClientSession::run`].
#[derive(Debug, Clone)]
pub struct ClientReport {
    pub state: ClientState,
    /// Bytes received on the request stream.
    pub response: Vec<u8>,
    /// The server finished the response stream.
    pub response_complete: bool,
    pub application_proto: Vec<u8>,
    pub stats: Stats,
    pub iterations: u64,
    /// First engine failure seen, if any. The connection was closed for it.
    pub error: Option<quicloop_engine::Error>,
}

/// Drives one client connection over a connected UDP socket.
pub struct ClientSession<E: ProtocolEngine> {
    socket: UdpSocket,
    conn: Connection<E>,
    state: ClientState,
    app: HqClient,
    request: Vec<u8>,
    max_iterations: Option<u64>,
    iterations: u64,
    error: Option<quicloop_engine::Error>,
}

impl<E: ProtocolEngine> ClientSession<E> {
    /// Open a connection to `peer` on `socket`, which must be connected to it.
    pub fn new(
        socket: UdpSocket,
        peer: SocketAddr,
        settings: &TransportSettings,
        client: &ClientConfig,
    ) -> Result<Self> {
        let mut config = E::configure(settings)?;
        let scid = RandomConnectionIdGenerator.generate()?;
        let local = socket.local_addr()?;

        let conn = Connection::connect(&mut config, Some(client.host()), scid, local, peer)?;
        info!(
            local = %local,
            peer = %peer,
            scid = %conn.source_id(),
            version = settings.version,
            "connecting"
        );

        Ok(Self {
            socket,
            conn,
            state: ClientState::NotStarted,
            app: HqClient::new(REQUEST_STREAM_ID),
            request: request_line(&client.request_path),
            max_iterations: client.max_iterations,
            iterations: 0,
            error: None,
        })
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn connection(&self) -> &Connection<E> {
        &self.conn
    }

    /// Run until the connection closes or the iteration bound is hit.
    ///
    /// Engine failures close the connection and are reported, not returned.
    /// Socket failures end the session with an error.
    pub fn run(mut self) -> Result<ClientReport> {
        self.flush()?;

        let mut buf = [0u8; RECV_BUFFER_SIZE];
        while self.state != ClientState::Closed {
            if self.max_iterations.map_or(false, |max| self.iterations >= max) {
                debug!(iterations = self.iterations, "iteration bound reached");
                break;
            }
            self.iterations += 1;

            let wait = self.conn.time_remaining();
            match recv_with_deadline(&self.socket, &mut buf, wait)? {
                Some((len, from)) => {
                    trace!(peer = %from, bytes = len, "datagram");
                    if let Err(e) = self.conn.recv(&mut buf[..len], from) {
                        if !e.is_done() {
                            self.fail(e);
                        }
                    }
                }
                None => {
                    trace!("timeout");
                    self.conn.on_timeout();
                }
            }

            if self.conn.is_closed() {
                self.state = ClientState::Closed;
                break;
            }

            if self.conn.is_established() {
                self.send_request();
                drain_readable(&mut self.conn, &mut self.app);
            }

            self.flush()?;
        }

        let stats = self.conn.stats();
        info!(
            state = %self.state,
            recv = stats.recv,
            sent = stats.sent,
            lost = stats.lost,
            rtt = ?stats.rtt,
            cwnd = stats.cwnd,
            "client finished"
        );

        Ok(ClientReport {
            state: self.state,
            response_complete: self.app.is_complete(),
            application_proto: self.conn.application_proto().to_vec(),
            response: self.app.into_response(),
            stats,
            iterations: self.iterations,
            error: self.error,
        })
    }

    fn send_request(&mut self) {
        if self.state != ClientState::AwaitingEstablishment {
            return;
        }
        info!(
            alpn = %String::from_utf8_lossy(self.conn.application_proto()),
            "connection established"
        );
        match self.conn.stream_send(REQUEST_STREAM_ID, &self.request, true) {
            Ok(_) => {
                debug!(stream_id = REQUEST_STREAM_ID, "request sent");
                self.state = ClientState::RequestSent;
            }
            Err(e) => self.fail(e),
        }
    }

    /// Send every datagram the engine has ready.
    fn flush(&mut self) -> Result<()> {
        let mut out = [0u8; MAX_DATAGRAM_SIZE];
        loop {
            match self.conn.send(&mut out) {
                Ok((written, to)) => {
                    self.socket.send(&out[..written]).map_err(Error::Io)?;
                    trace!(peer = %to, bytes = written, "sent");
                    if self.state == ClientState::NotStarted {
                        self.state = ClientState::AwaitingEstablishment;
                    }
                }
                Err(quicloop_engine::Error::Done) => return Ok(()),
                Err(e) => {
                    self.fail(e);
                    return Ok(());
                }
            }
        }
    }

    fn fail(&mut self, e: quicloop_engine::Error) {
        warn!(trace_id = %self.conn.trace_id(), error = %e, "connection failed");
        self.error.get_or_insert(e);
        let _ = self.conn.close(false, INTERNAL_ERROR, b"fail");
    }
}
