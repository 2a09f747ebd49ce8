//! Connection registry for the cooperative event loop.
//!
//! Each connection pairs a non-blocking socket with its [`Session`] and the
//! response currently being written, if any.

use crate::session::Session;
use bytes::Bytes;
use mio::net::TcpStream;
use slab::Slab;

/// A response partially written to the socket.
#[derive(Debug)]
pub struct PendingWrite {
    pub data: Bytes,
    pub written: usize,
}

impl PendingWrite {
    pub fn new(data: Bytes) -> Self {
        Self { data, written: 0 }
    }

    /// Bytes still to be written.
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.written..]
    }

    /// Record `n` more bytes written. Returns `true` when complete.
    pub fn advance(&mut self, n: usize) -> bool {
        self.written += n;
        self.written >= self.data.len()
    }
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection {
    pub stream: TcpStream,
    pub session: Session,
    /// Distinguishes this connection from earlier ones that held the same
    /// slab slot.
    pub serial: u64,
    pub pending: Option<PendingWrite>,
}

/// Registry of active connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations.
pub struct ConnectionRegistry {
    connections: Slab<Connection>,
    next_serial: u64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: Slab::new(),
            next_serial: 0,
        }
    }

    /// Insert a new connection, returning its id.
    pub fn insert(&mut self, stream: TcpStream, session: Session) -> usize {
        let serial = self.next_serial;
        self.next_serial += 1;
        self.connections.insert(Connection {
            stream,
            session,
            serial,
            pending: None,
        })
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection> {
        self.connections.get_mut(id)
    }

    /// Get a connection only if it is still the one tagged with `serial`.
    pub fn get_current(&mut self, id: usize, serial: u64) -> Option<&mut Connection> {
        self.connections
            .get_mut(id)
            .filter(|conn| conn.serial == serial)
    }

    pub fn remove(&mut self, id: usize) -> Option<Connection> {
        self.connections.try_remove(id)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
