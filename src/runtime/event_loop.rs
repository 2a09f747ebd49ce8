//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! Everything here runs on one thread. Accept, read and write are the only
//! points where a session yields; prime computation is handed to the worker
//! pool and its result comes back through a channel plus a poll wakeup.

use super::connection::{ConnectionRegistry, PendingWrite};
use crate::compute::ComputeError;
use crate::pool::WorkerPool;
use crate::server::{
    is_resource_exhaustion, is_transient_accept_error, ServerError, ShutdownHandle,
    ACCEPT_RETRY_DELAY,
};
use crate::session::{is_reset, SessionFactory, SessionState, Step};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::num::NonZeroU64;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const WAKER_TOKEN: Token = Token(usize::MAX - 1);

const EVENT_CAPACITY: usize = 1024;

/// A finished computation, addressed to the connection that asked for it.
struct Completion {
    conn_id: usize,
    serial: u64,
    prime: u64,
}

/// Hands computations to the pool and routes results back to the loop.
struct Offload {
    pool: Arc<WorkerPool>,
    tx: mpsc::Sender<Completion>,
    waker: Arc<Waker>,
}

impl Offload {
    fn submit(&self, conn_id: usize, serial: u64, n: NonZeroU64) -> Result<(), ComputeError> {
        let tx = self.tx.clone();
        let waker = Arc::clone(&self.waker);
        self.pool.submit_with(n, move |prime| {
            let done = Completion {
                conn_id,
                serial,
                prime,
            };
            // A closed channel means the loop is gone.
            if tx.send(done).is_ok() {
                let _ = waker.wake();
            }
        })
    }
}

/// Whether a connection stays registered after being driven.
enum Flow {
    Open,
    Closed,
}

/// Run the cooperative loop until stopped and every open session has closed.
pub fn run(
    listener: std::net::TcpListener,
    factory: Arc<SessionFactory>,
    pool: Arc<WorkerPool>,
    shutdown: &ShutdownHandle,
) -> Result<(), ServerError> {
    run_with_accept(listener, TcpListener::accept, factory, pool, shutdown)
}

fn run_with_accept<A>(
    listener: std::net::TcpListener,
    mut accept: A,
    factory: Arc<SessionFactory>,
    pool: Arc<WorkerPool>,
    shutdown: &ShutdownHandle,
) -> Result<(), ServerError>
where
    A: FnMut(&TcpListener) -> io::Result<(TcpStream, SocketAddr)>,
{
    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(EVENT_CAPACITY);
    let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

    listener.set_nonblocking(true)?;
    let mut listener = TcpListener::from_std(listener);
    poll.registry()
        .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
    let mut listener = Some(listener);

    let (tx, completions) = mpsc::channel();
    let offload = Offload {
        pool,
        tx,
        waker: Arc::clone(&waker),
    };

    let mut connections = ConnectionRegistry::new();
    let mut scratch = vec![0u8; factory.max_read()];

    if !shutdown.begin(waker) {
        return Ok(());
    }

    info!(workers = offload.pool.size(), "Cooperative event loop started");

    // Set on a readiness edge, cleared once accept reports WouldBlock.
    let mut queued = false;
    let mut retry_after = None;

    loop {
        if !shutdown.is_running() {
            if let Some(mut closing) = listener.take() {
                let _ = poll.registry().deregister(&mut closing);
                queued = false;
                retry_after = None;
                info!(open = connections.len(), "Listener closed");
            }
        }
        if listener.is_none() && connections.is_empty() {
            break;
        }

        let timeout = retry_after.take();
        if let Err(e) = poll.poll(&mut events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                retry_after = timeout;
                continue;
            }
            return Err(e.into());
        }
        if timeout.is_some() {
            queued = true;
        }

        for event in events.iter() {
            match event.token() {
                LISTENER_TOKEN => queued = true,
                // Completions are drained below; stop requests are seen at the top.
                WAKER_TOKEN => {}
                Token(conn_id) => {
                    drive_or_close(conn_id, &mut poll, &mut connections, &mut scratch, &offload);
                }
            }
        }

        if queued {
            if let Some(ref listener) = listener {
                queued = false;
                retry_after =
                    accept_connections(listener, &mut accept, &mut poll, &mut connections, &factory)?;
            }
        }

        while let Ok(done) = completions.try_recv() {
            let Some(conn) = connections.get_current(done.conn_id, done.serial) else {
                continue;
            };
            if conn.session.state() != SessionState::Computing {
                continue;
            }
            let response = conn.session.on_computed(done.prime);
            conn.pending = Some(PendingWrite::new(response));
            drive_or_close(done.conn_id, &mut poll, &mut connections, &mut scratch, &offload);
        }
    }

    info!("Cooperative event loop stopped");
    Ok(())
}

/// Accept until the backlog is drained. Returns a retry delay when accepting
/// stopped for lack of resources with connections possibly still queued.
fn accept_connections<A>(
    listener: &TcpListener,
    accept: &mut A,
    poll: &mut Poll,
    connections: &mut ConnectionRegistry,
    factory: &SessionFactory,
) -> Result<Option<Duration>, ServerError>
where
    A: FnMut(&TcpListener) -> io::Result<(TcpStream, SocketAddr)>,
{
    loop {
        match accept(listener) {
            Ok((stream, peer_addr)) => {
                info!(peer = %peer_addr, "Received connection");

                let conn_id = connections.insert(stream, factory.new_session(peer_addr));

                // Re-borrow after insert
                let Some(conn) = connections.get_mut(conn_id) else {
                    continue;
                };
                if let Err(e) = poll.registry().register(
                    &mut conn.stream,
                    Token(conn_id),
                    Interest::READABLE | Interest::WRITABLE,
                ) {
                    warn!(peer = %peer_addr, error = %e, "Failed to register connection");
                    connections.remove(conn_id);
                    continue;
                }

                debug!(conn_id, open = connections.len(), "Accepted connection");
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) if is_resource_exhaustion(&e) => {
                warn!(error = %e, retry_in = ?ACCEPT_RETRY_DELAY, "Accept failed");
                return Ok(Some(ACCEPT_RETRY_DELAY));
            }
            Err(e) if is_transient_accept_error(&e) => {
                warn!(error = %e, "Accept failed");
            }
            Err(e) => return Err(ServerError::Accept(e)),
        }
    }
}

fn drive_or_close(
    conn_id: usize,
    poll: &mut Poll,
    connections: &mut ConnectionRegistry,
    scratch: &mut [u8],
    offload: &Offload,
) {
    let Some(conn) = connections.get_mut(conn_id) else {
        return;
    };

    match drive(conn_id, conn, scratch, offload) {
        Ok(Flow::Open) => {}
        Ok(Flow::Closed) => close_connection(poll, connections, conn_id),
        Err(e) => {
            debug!(conn_id, error = %e, "Connection error");
            close_connection(poll, connections, conn_id);
        }
    }
}

/// Advance a session as far as its socket allows without blocking.
fn drive(
    conn_id: usize,
    conn: &mut super::connection::Connection,
    scratch: &mut [u8],
    offload: &Offload,
) -> io::Result<Flow> {
    loop {
        match conn.session.state() {
            SessionState::AwaitingRequest => {
                let buf = &mut scratch[..conn.session.max_read()];
                let n = match conn.stream.read(buf) {
                    Ok(n) => n,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Flow::Open),
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) if is_reset(&e) => {
                        conn.session.on_reset(&e);
                        continue;
                    }
                    Err(e) => return Err(e),
                };

                match conn.session.on_read(&buf[..n]) {
                    Step::Close => return Ok(Flow::Closed),
                    Step::Respond(response) => conn.pending = Some(PendingWrite::new(response)),
                    Step::Compute(n) => {
                        offload
                            .submit(conn_id, conn.serial, n)
                            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
                        return Ok(Flow::Open);
                    }
                }
            }
            SessionState::Responding => {
                let Some(pending) = conn.pending.as_mut() else {
                    conn.session.on_written();
                    continue;
                };

                match conn.stream.write(pending.remaining()) {
                    Ok(0) => {
                        return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                    }
                    Ok(n) => {
                        if pending.advance(n) {
                            conn.pending = None;
                            conn.session.on_written();
                        }
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Flow::Open),
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) if is_reset(&e) => {
                        conn.pending = None;
                        conn.session.on_reset(&e);
                    }
                    Err(e) => return Err(e),
                }
            }
            // Waiting on the pool; the completion re-drives this connection.
            SessionState::Computing | SessionState::Decoding => return Ok(Flow::Open),
            SessionState::Closed => return Ok(Flow::Closed),
        }
    }
}

fn close_connection(poll: &mut Poll, connections: &mut ConnectionRegistry, conn_id: usize) {
    if let Some(mut conn) = connections.remove(conn_id) {
        let _ = poll.registry().deregister(&mut conn.stream);
        if conn.session.close() {
            let _ = conn.stream.shutdown(std::net::Shutdown::Both);
        }

        info!(
            conn_id,
            peer = %conn.session.peer(),
            requests = conn.session.requests(),
            "Connection closed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::ComputeEngine;
    use socket2::SockRef;
    use std::io::{BufRead, BufReader};
    use std::thread;

    type LoopThread = thread::JoinHandle<Result<(), ServerError>>;

    fn spawn_loop<A>(listener: std::net::TcpListener, accept: A) -> (ShutdownHandle, LoopThread)
    where
        A: FnMut(&TcpListener) -> io::Result<(TcpStream, SocketAddr)> + Send + 'static,
    {
        let pool = Arc::new(WorkerPool::new(2));
        let engine = ComputeEngine::new(Some(Arc::clone(&pool)));
        let factory = Arc::new(SessionFactory::new(engine, 1024).unwrap());

        let shutdown = ShutdownHandle::default();
        let handle = shutdown.clone();
        let thread = thread::spawn(move || run_with_accept(listener, accept, factory, pool, &handle));
        (shutdown, thread)
    }

    fn bind() -> (std::net::TcpListener, SocketAddr) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    fn connect(addr: SocketAddr) -> std::net::TcpStream {
        let stream = std::net::TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        stream
    }

    fn request(stream: &mut std::net::TcpStream, payload: &str) -> String {
        stream.write_all(payload.as_bytes()).unwrap();
        let mut line = String::new();
        BufReader::new(&*stream).read_line(&mut line).unwrap();
        line
    }

    #[test]
    fn test_queued_connections_accepted_after_exhaustion() {
        let (listener, addr) = bind();

        // Both are queued before the loop first polls, so the listener
        // signals readiness only once.
        let mut first = connect(addr);
        let mut second = connect(addr);

        let mut failures = 1;
        let (shutdown, thread) = spawn_loop(listener, move |listener: &TcpListener| {
            if failures > 0 {
                failures -= 1;
                return Err(io::Error::from_raw_os_error(libc::EMFILE));
            }
            listener.accept()
        });

        assert_eq!(request(&mut first, "5"), "11\n");
        assert_eq!(request(&mut second, "6"), "13\n");
        drop(first);
        drop(second);

        shutdown.stop();
        thread.join().unwrap().unwrap();
    }

    #[test]
    fn test_reset_peer_does_not_disturb_loop() {
        let (listener, addr) = bind();
        let (shutdown, thread) = spawn_loop(listener, TcpListener::accept);

        let mut aborted = connect(addr);
        assert_eq!(request(&mut aborted, "2"), "3\n");
        // Linger of zero turns close into a reset.
        aborted.write_all(b"7").unwrap();
        SockRef::from(&aborted)
            .set_linger(Some(Duration::ZERO))
            .unwrap();
        drop(aborted);

        let mut other = connect(addr);
        assert_eq!(request(&mut other, "6"), "13\n");
        drop(other);

        shutdown.stop();
        thread.join().unwrap().unwrap();
    }
}
