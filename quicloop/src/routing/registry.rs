//! Connection registry: the server's map from connection ID to connection.

use quicloop_engine::{ConnectionId, ProtocolEngine, Stats};
use std::collections::hash_map::{Entry, HashMap};
use std::net::SocketAddr;

use crate::connection::Connection;

/// Final record of a connection removed by [`ConnectionRegistry::sweep_closed`].
#[derive(Debug, Clone, PartialEq)]
pub struct Reaped {
    pub scid: ConnectionId,
    pub peer: SocketAddr,
    pub trace_id: String,
    pub stats: Stats,
}

/// Live server connections keyed by their own source ID.
///
/// Every key equals the stored connection's [`Connection::source_id`], so a
/// datagram's destination ID finds exactly the connection that issued it.
pub struct ConnectionRegistry<E: ProtocolEngine> {
    conns: HashMap<ConnectionId, Connection<E>>,
}

impl<E: ProtocolEngine> Default for ConnectionRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: ProtocolEngine> ConnectionRegistry<E> {
    pub fn new() -> Self {
        Self {
            conns: HashMap::new(),
        }
    }

    /// Register `conn` under its source ID.
    ///
    /// Hands the connection back if that ID is already live.
    pub fn insert(&mut self, conn: Connection<E>) -> Result<&mut Connection<E>, Connection<E>> {
        match self.conns.entry(conn.source_id().clone()) {
            Entry::Occupied(_) => Err(conn),
            Entry::Vacant(slot) => Ok(slot.insert(conn)),
        }
    }

    pub fn get(&self, dcid: &[u8]) -> Option<&Connection<E>> {
        self.conns.get(dcid)
    }

    pub fn get_mut(&mut self, dcid: &[u8]) -> Option<&mut Connection<E>> {
        self.conns.get_mut(dcid)
    }

    pub fn contains(&self, dcid: &[u8]) -> bool {
        self.conns.contains_key(dcid)
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection<E>> {
        self.conns.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection<E>> {
        self.conns.values_mut()
    }

    /// Remove and release every connection whose engine reports closed.
    pub fn sweep_closed(&mut self) -> Vec<Reaped> {
        let closed: Vec<ConnectionId> = self
            .conns
            .iter()
            .filter(|(_, conn)| conn.is_closed())
            .map(|(cid, _)| cid.clone())
            .collect();

        closed
            .into_iter()
            .filter_map(|cid| self.conns.remove(&cid))
            .map(|conn| Reaped {
                scid: conn.source_id().clone(),
                peer: conn.peer(),
                trace_id: conn.trace_id().to_string(),
                stats: conn.stats(),
            })
            .collect()
    }
}
