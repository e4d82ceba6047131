//! Server session: the registry, the dispatcher and the event loop.

use quicloop_engine::error::INTERNAL_ERROR;
use quicloop_engine::{ProtocolEngine, TransportSettings};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::apps::HqServer;
use crate::config::ServerConfig;
use crate::netio::{recv_with_deadline, MAX_DATAGRAM_SIZE, RECV_BUFFER_SIZE};
use crate::routing::{
    ConnectionIdGenerator, ConnectionRegistry, DerivedConnectionIds, Dispatch, DispatchOptions,
    PacketDispatcher, RandomConnectionIdGenerator,
};
use crate::stream_io::drain_readable;
use crate::timeout::{fire_all, next_timeout};
use crate::token::TokenService;
use crate::{Error, Result};

/// Accepts connections on one socket and answers HTTP/0.9 requests.
pub struct ServerSession<E: ProtocolEngine> {
    socket: UdpSocket,
    local: SocketAddr,
    registry: ConnectionRegistry<E>,
    dispatcher: PacketDispatcher<E>,
    app: HqServer,
    shutdown: Option<Arc<AtomicBool>>,
    poll_interval: Duration,
    buf: Box<[u8]>,
}

impl<E: ProtocolEngine> ServerSession<E> {
    pub fn new(socket: UdpSocket, settings: &TransportSettings, server: &ServerConfig) -> Result<Self> {
        Self::with_generator(socket, settings, server, Box::new(RandomConnectionIdGenerator))
    }

    /// Like [`new`](Self::new) with a caller-chosen connection ID source.
    pub fn with_generator(
        socket: UdpSocket,
        settings: &TransportSettings,
        server: &ServerConfig,
        cids: Box<dyn ConnectionIdGenerator>,
    ) -> Result<Self> {
        let config = E::configure(settings)?;
        let local = socket.local_addr()?;
        let options = DispatchOptions {
            retry: server.retry,
            min_initial_size: server.min_initial_size,
        };
        let dispatcher = PacketDispatcher::new(
            config,
            local,
            TokenService::new()?.with_lifetime(server.retry_token_lifetime()),
            cids,
            DerivedConnectionIds::new()?,
            options,
        );

        info!(
            local = %local,
            retry = options.retry,
            alpn = ?settings.application_protos,
            "server listening"
        );

        Ok(Self {
            socket,
            local,
            registry: ConnectionRegistry::new(),
            dispatcher,
            app: HqServer::new(server.response_body.as_bytes()),
            shutdown: None,
            poll_interval: server.shutdown_poll_interval(),
            buf: vec![0u8; RECV_BUFFER_SIZE].into_boxed_slice(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn registry(&self) -> &ConnectionRegistry<E> {
        &self.registry
    }

    /// Responses sent since the session started.
    pub fn responses(&self) -> u64 {
        self.app.responses()
    }

    /// Stop [`run`](Self::run) once `flag` is raised. Waits are capped at
    /// the configured poll interval so the flag is noticed.
    pub fn set_shutdown(&mut self, flag: Arc<AtomicBool>) {
        self.shutdown = Some(flag);
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown
            .as_ref()
            .map_or(false, |flag| flag.load(Ordering::Relaxed))
    }

    /// Loop until the shutdown flag is raised or the socket fails.
    pub fn run(&mut self) -> Result<()> {
        while !self.shutdown_requested() {
            self.run_once()?;
        }
        info!(live = self.registry.len(), "server stopped");
        Ok(())
    }

    /// One iteration: wait, dispatch or fire timers, flush, reap.
    ///
    /// Returns what happened to the received datagram, `None` on timeout.
    pub fn run_once(&mut self) -> Result<Option<Dispatch>> {
        let mut wait = next_timeout(self.registry.iter());
        if self.shutdown.is_some() {
            wait = Some(wait.map_or(self.poll_interval, |w| w.min(self.poll_interval)));
        }

        let outcome = match recv_with_deadline(&self.socket, &mut self.buf, wait)? {
            Some((len, from)) => Some(self.on_datagram(len, from)?),
            None => {
                let fired = fire_all(self.registry.iter_mut());
                trace!(connections = fired, "timeout");
                None
            }
        };

        self.flush_all()?;
        self.reap();
        Ok(outcome)
    }

    fn on_datagram(&mut self, len: usize, from: SocketAddr) -> Result<Dispatch> {
        let outcome = self
            .dispatcher
            .dispatch(&mut self.registry, &mut self.buf[..len], from)?;

        match &outcome {
            Dispatch::Negotiate(reply) | Dispatch::Retry(reply) => {
                self.socket.send_to(reply, from).map_err(Error::Io)?;
            }
            Dispatch::Routed(scid) | Dispatch::Accepted(scid) => {
                if let Some(conn) = self.registry.get_mut(scid.as_bytes()) {
                    if conn.is_established() {
                        drain_readable(conn, &mut self.app);
                    }
                }
            }
            Dispatch::Dropped(reason) => {
                trace!(peer = %from, reason = %reason, "datagram dropped");
            }
        }
        Ok(outcome)
    }

    /// Send everything every connection has ready.
    fn flush_all(&mut self) -> Result<()> {
        let mut out = [0u8; MAX_DATAGRAM_SIZE];
        for conn in self.registry.iter_mut() {
            loop {
                match conn.send(&mut out) {
                    Ok((written, to)) => {
                        self.socket.send_to(&out[..written], to).map_err(Error::Io)?;
                        trace!(trace_id = %conn.trace_id(), peer = %to, bytes = written, "sent");
                    }
                    Err(quicloop_engine::Error::Done) => break,
                    Err(e) => {
                        warn!(trace_id = %conn.trace_id(), error = %e, "send failed, closing");
                        let _ = conn.close(false, INTERNAL_ERROR, b"fail");
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Release closed connections.
    fn reap(&mut self) -> usize {
        let reaped = self.registry.sweep_closed();
        for conn in &reaped {
            self.app.forget(&conn.scid);
            info!(
                trace_id = %conn.trace_id,
                peer = %conn.peer,
                recv = conn.stats.recv,
                sent = conn.stats.sent,
                lost = conn.stats.lost,
                rtt = ?conn.stats.rtt,
                cwnd = conn.stats.cwnd,
                "connection closed"
            );
        }
        if !reaped.is_empty() {
            debug!(live = self.registry.len(), "registry swept");
        }
        reaped.len()
    }
}
