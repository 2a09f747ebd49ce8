//! Per-connection session logic.
//!
//! A [`Session`] is the request/response state machine for one accepted
//! connection, independent of how its socket is driven:
//!
//! ```text
//! AwaitingRequest -> Decoding -> Computing -> Responding -> AwaitingRequest
//!                        |                       ^
//!                        +--- (decode error) ----+
//! AwaitingRequest -> Closed   (empty read)
//! ```
//!
//! Blocking strategies drive it with [`serve_blocking`]; the cooperative
//! event loop drives it with non-blocking reads and writes.

use crate::compute::ComputeEngine;
use crate::protocol::{decode_request, encode_error, encode_integer};
use bytes::Bytes;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::num::NonZeroU64;
use tracing::{error, info, warn};

/// Current position in the request/response cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingRequest,
    Decoding,
    Computing,
    Responding,
    Closed,
}

/// What the driver must do after a read.
#[derive(Debug, PartialEq, Eq)]
pub enum Step {
    /// Peer closed; release the connection.
    Close,
    /// Compute the Nth prime, then call [`Session::on_computed`].
    Compute(NonZeroU64),
    /// Write this response, then call [`Session::on_written`].
    Respond(Bytes),
}

/// Request/response state for one connection.
#[derive(Debug)]
pub struct Session {
    peer: SocketAddr,
    state: SessionState,
    engine: ComputeEngine,
    max_read: usize,
    requests: u64,
}

impl Session {
    pub fn new(peer: SocketAddr, engine: ComputeEngine, max_read: usize) -> Self {
        Self {
            peer,
            state: SessionState::AwaitingRequest,
            engine,
            max_read,
            requests: 0,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn engine(&self) -> &ComputeEngine {
        &self.engine
    }

    /// Maximum bytes to read per request.
    pub fn max_read(&self) -> usize {
        self.max_read
    }

    /// Requests answered so far.
    pub fn requests(&self) -> u64 {
        self.requests
    }

    /// Handle one chunk read from the peer. The chunk is one whole request.
    pub fn on_read(&mut self, chunk: &[u8]) -> Step {
        debug_assert_eq!(self.state, SessionState::AwaitingRequest);

        if chunk.is_empty() {
            self.close();
            return Step::Close;
        }

        self.state = SessionState::Decoding;
        match decode_request(chunk) {
            Ok(n) => {
                self.state = SessionState::Computing;
                Step::Compute(n)
            }
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "Invalid number");
                self.state = SessionState::Responding;
                Step::Respond(encode_error(&e))
            }
        }
    }

    /// Turn a computed prime into the response to write.
    pub fn on_computed(&mut self, prime: u64) -> Bytes {
        debug_assert_eq!(self.state, SessionState::Computing);
        self.state = SessionState::Responding;
        encode_integer(prime)
    }

    /// The response was fully written.
    pub fn on_written(&mut self) {
        self.requests += 1;
        self.state = SessionState::AwaitingRequest;
    }

    /// The peer reset the connection mid-cycle. Nothing is sent for this
    /// cycle; the session goes back to reading.
    pub fn on_reset(&mut self, err: &io::Error) {
        error!(peer = %self.peer, error = %err, "Connection reset");
        self.state = SessionState::AwaitingRequest;
    }

    /// Transition to `Closed`. Returns `true` only the first time, so the
    /// caller releases the connection exactly once.
    pub fn close(&mut self) -> bool {
        if self.state == SessionState::Closed {
            return false;
        }
        self.state = SessionState::Closed;
        true
    }
}

/// Whether an I/O error means the peer reset the connection.
pub fn is_reset(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted | io::ErrorKind::BrokenPipe
    )
}

/// Produces a fresh [`Session`] for every accepted connection.
#[derive(Debug, Clone)]
pub struct SessionFactory {
    engine: ComputeEngine,
    max_read: usize,
}

impl SessionFactory {
    /// Returns `None` when `max_read` is zero.
    pub fn new(engine: ComputeEngine, max_read: usize) -> Option<Self> {
        (max_read > 0).then_some(Self { engine, max_read })
    }

    pub fn engine(&self) -> &ComputeEngine {
        &self.engine
    }

    pub fn max_read(&self) -> usize {
        self.max_read
    }

    pub fn new_session(&self, peer: SocketAddr) -> Session {
        Session::new(peer, self.engine.clone(), self.max_read)
    }
}

/// Run a session to completion on a blocking stream.
///
/// Returns once the peer closes the connection or an unrecoverable error
/// occurs. The stream is shut down and dropped exactly once on return.
pub fn serve_blocking(mut stream: TcpStream, mut session: Session) -> io::Result<()> {
    let mut buf = vec![0u8; session.max_read()];

    let result = loop {
        let n = match stream.read(&mut buf) {
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if is_reset(&e) => {
                session.on_reset(&e);
                continue;
            }
            Err(e) => break Err(e),
        };

        let response = match session.on_read(&buf[..n]) {
            Step::Close => break Ok(()),
            Step::Respond(response) => response,
            Step::Compute(n) => match session.engine().nth_prime(n) {
                Ok(prime) => session.on_computed(prime),
                Err(e) => break Err(io::Error::new(io::ErrorKind::Other, e)),
            },
        };

        match stream.write_all(&response) {
            Ok(()) => session.on_written(),
            Err(e) if is_reset(&e) => session.on_reset(&e),
            Err(e) => break Err(e),
        }
    };

    if session.close() {
        let _ = stream.shutdown(Shutdown::Both);
    }
    info!(
        peer = %session.peer(),
        requests = session.requests(),
        thread = thread_name(),
        "Connection closed"
    );
    result
}

fn thread_name() -> String {
    std::thread::current()
        .name()
        .unwrap_or("unnamed")
        .to_string()
}
