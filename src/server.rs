//! TCP server for Nth prime requests.
//!
//! Owns the listening socket and its lifecycle, and hands every accepted
//! connection to a [`Session`](crate::session::Session) under one of three
//! strategies:
//!
//! - `Serial`: one session at a time; the next connection is accepted only
//!   once the current session has ended.
//! - `Threaded`: each session gets its own detached OS thread.
//! - `Cooperative`: every session runs on one mio event loop (see
//!   [`runtime`](crate::runtime)).
//!
//! Stopping closes the listener right away. Sessions already running are
//! never cancelled.

use crate::config::{Config, Strategy};
use crate::runtime;
use crate::session::{serve_blocking, SessionFactory};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);

/// Listening parameters. Construction is pure; nothing is bound until
/// [`Server::listen`].
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub host: String,
    pub port: u16,
    pub backlog: u32,
    pub strategy: Strategy,
}

impl ServerOptions {
    pub fn new(host: impl Into<String>, port: u16, backlog: u32) -> Self {
        Self {
            host: host.into(),
            port,
            backlog,
            strategy: Strategy::Serial,
        }
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }
}

impl From<&Config> for ServerOptions {
    fn from(config: &Config) -> Self {
        ServerOptions::new(config.host.clone(), config.port, config.backlog)
            .with_strategy(config.strategy)
    }
}

/// Server lifecycle errors
#[derive(Debug)]
pub enum ServerError {
    /// Raised before any I/O: missing handler, bad backlog, wrong state.
    Configuration(&'static str),
    /// Could not resolve or bind the listen address.
    Bind(String, io::Error),
    /// The listener failed in a way that cannot be retried.
    Accept(io::Error),
    Io(io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Configuration(reason) => write!(f, "Configuration error: {reason}"),
            ServerError::Bind(addr, e) => write!(f, "Failed to bind '{addr}': {e}"),
            ServerError::Accept(e) => write!(f, "Failed to accept connection: {e}"),
            ServerError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Configuration(_) => None,
            ServerError::Bind(_, e) | ServerError::Accept(e) | ServerError::Io(e) => Some(e),
        }
    }
}

impl From<io::Error> for ServerError {
    fn from(e: io::Error) -> Self {
        ServerError::Io(e)
    }
}

/// Stops a server from any thread.
///
/// A stop issued before the server starts serving is remembered, and
/// serving then returns immediately.
#[derive(Clone, Default)]
pub struct ShutdownHandle {
    inner: Arc<ShutdownState>,
}

#[derive(Default)]
struct ShutdownState {
    running: AtomicBool,
    stopped: AtomicBool,
    waker: Mutex<Option<Arc<Waker>>>,
}

impl ShutdownHandle {
    /// Stop accepting connections. Idempotent.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.running.store(false, Ordering::SeqCst);

        let waker = self.inner.waker.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(waker) = waker.as_ref() {
            if let Err(e) = waker.wake() {
                warn!(error = %e, "Failed to wake accept loop");
            }
        }
        info!("Stopping the server");
    }

    /// Whether the server is between start and stop.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Install the accept loop's waker and mark the server running.
    /// Returns `false` if a stop was already requested.
    pub(crate) fn begin(&self, waker: Arc<Waker>) -> bool {
        *self.inner.waker.lock().unwrap_or_else(PoisonError::into_inner) = Some(waker);
        if self.inner.stopped.load(Ordering::SeqCst) {
            return false;
        }
        self.inner.running.store(true, Ordering::SeqCst);
        true
    }

    fn finish(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner
            .waker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// Server instance
pub struct Server {
    options: ServerOptions,
    factory: Option<Arc<SessionFactory>>,
    listener: Option<TcpListener>,
    started: bool,
    shutdown: ShutdownHandle,
}

impl Server {
    pub fn new(options: ServerOptions) -> Self {
        Self {
            options,
            factory: None,
            listener: None,
            started: false,
            shutdown: ShutdownHandle::default(),
        }
    }

    /// Set the factory that creates a session per connection.
    pub fn set_handler_factory(&mut self, factory: SessionFactory) -> Result<(), ServerError> {
        if self.started {
            return Err(ServerError::Configuration(
                "handler factory cannot change after start",
            ));
        }
        self.factory = Some(Arc::new(factory));
        Ok(())
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Bind and listen, then serve until stopped.
    pub fn start(&mut self) -> Result<(), ServerError> {
        self.listen()?;
        self.serve()
    }

    /// Validate the configuration, then bind and listen. Returns the bound
    /// address.
    pub fn listen(&mut self) -> Result<SocketAddr, ServerError> {
        if self.started {
            return Err(ServerError::Configuration("server already started"));
        }
        let factory = self
            .factory
            .as_ref()
            .ok_or(ServerError::Configuration("request handler not set"))?;
        if self.options.strategy == Strategy::Cooperative && factory.engine().pool().is_none() {
            return Err(ServerError::Configuration(
                "cooperative strategy requires a worker pool",
            ));
        }
        let backlog = i32::try_from(self.options.backlog)
            .map_err(|_| ServerError::Configuration("backlog out of range"))?;

        let endpoint = format!("{}:{}", self.options.host, self.options.port);
        let addrs = (self.options.host.as_str(), self.options.port)
            .to_socket_addrs()
            .map_err(|e| ServerError::Bind(endpoint.clone(), e))?;

        let mut last_err = None;
        for addr in addrs {
            match bind_listener(addr, backlog) {
                Ok(listener) => {
                    let local = listener.local_addr()?;
                    info!(
                        address = %local,
                        backlog,
                        strategy = ?self.options.strategy,
                        "Server listening"
                    );
                    self.listener = Some(listener);
                    self.started = true;
                    return Ok(local);
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(ServerError::Bind(
            endpoint,
            last_err.unwrap_or_else(|| {
                io::Error::new(io::ErrorKind::AddrNotAvailable, "no addresses resolved")
            }),
        ))
    }

    /// Accept and dispatch connections until stopped.
    pub fn serve(&mut self) -> Result<(), ServerError> {
        let listener = self
            .listener
            .take()
            .ok_or(ServerError::Configuration("listen must be called before serve"))?;
        let factory = self
            .factory
            .clone()
            .ok_or(ServerError::Configuration("request handler not set"))?;

        let result = match self.options.strategy {
            strategy @ (Strategy::Serial | Strategy::Threaded) => accept_loop(
                listener,
                TcpListener::accept,
                &self.shutdown,
                &factory,
                strategy,
            ),
            Strategy::Cooperative => match factory.engine().pool() {
                Some(pool) => {
                    runtime::run(listener, Arc::clone(&factory), Arc::clone(pool), &self.shutdown)
                }
                None => Err(ServerError::Configuration(
                    "cooperative strategy requires a worker pool",
                )),
            },
        };

        self.shutdown.finish();
        if let Err(ref e) = result {
            error!(error = %e, "Server terminated");
        }
        result
    }
}

/// How long to wait before accepting again after running out of descriptors
/// or buffers. Connections left in the backlog raise no new readiness event.
pub(crate) const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Outcome of a single accept attempt.
enum Accepted {
    Connection(TcpStream, SocketAddr),
    /// Nothing is queued until the next readiness event.
    Drained,
    /// This attempt failed, but more connections may be queued.
    Retry,
    /// Out of resources; queued connections wait for [`ACCEPT_RETRY_DELAY`].
    Exhausted,
}

/// Run a session on its own thread.
///
/// The active count drops before `waker` fires, so a woken accept loop
/// always sees the session as finished.
fn spawn_session(
    stream: TcpStream,
    peer: SocketAddr,
    factory: &SessionFactory,
    active: &Arc<AtomicUsize>,
    waker: Option<Arc<Waker>>,
) -> Option<JoinHandle<()>> {
    let session = factory.new_session(peer);
    let active_sessions = Arc::clone(active);
    let count = active.fetch_add(1, Ordering::SeqCst) + 1;

    let spawned = thread::Builder::new()
        .name(format!("session-{peer}"))
        .spawn(move || {
            if let Err(e) = serve_blocking(stream, session) {
                debug!(peer = %peer, error = %e, "Session error");
            }
            active_sessions.fetch_sub(1, Ordering::SeqCst);
            if let Some(waker) = waker {
                let _ = waker.wake();
            }
        });

    match spawned {
        Ok(handle) => {
            debug!(peer = %peer, active = count, "Session thread started");
            Some(handle)
        }
        Err(e) => {
            active.fetch_sub(1, Ordering::SeqCst);
            error!(peer = %peer, error = %e, "Failed to spawn session thread");
            None
        }
    }
}

/// Accept loop shared by the serial and threaded strategies.
///
/// The listener is polled rather than blocked on so that a stop request can
/// interrupt the wait, and every session runs on its own thread so the loop
/// stays responsive. Under `Serial` nothing is accepted while a session is
/// running; that session wakes the loop when it ends.
///
/// The listener is closed as soon as the loop exits. A serial session still
/// running at that point is waited for before returning.
fn accept_loop<A>(
    listener: TcpListener,
    mut accept: A,
    shutdown: &ShutdownHandle,
    factory: &SessionFactory,
    strategy: Strategy,
) -> Result<(), ServerError>
where
    A: FnMut(&TcpListener) -> io::Result<(TcpStream, SocketAddr)>,
{
    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(16);
    let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

    listener.set_nonblocking(true)?;
    let fd = listener.as_raw_fd();
    poll.registry()
        .register(&mut SourceFd(&fd), LISTENER_TOKEN, Interest::READABLE)?;

    if !shutdown.begin(Arc::clone(&waker)) {
        return Ok(());
    }

    let serial = strategy == Strategy::Serial;
    let active = Arc::new(AtomicUsize::new(0));
    let mut current: Option<JoinHandle<()>> = None;
    // Set on a readiness edge, cleared once accept reports WouldBlock.
    let mut queued = false;
    let mut retry_after = None;

    let result = 'serve: loop {
        if !shutdown.is_running() {
            break Ok(());
        }

        while queued
            && shutdown.is_running()
            && !(serial && active.load(Ordering::SeqCst) > 0)
        {
            match accept_next(&listener, &mut accept) {
                Ok(Accepted::Connection(stream, peer)) => {
                    let waker = serial.then(|| Arc::clone(&waker));
                    let handle = spawn_session(stream, peer, factory, &active, waker);
                    if serial {
                        current = handle;
                    }
                }
                Ok(Accepted::Retry) => {}
                Ok(Accepted::Drained) => queued = false,
                Ok(Accepted::Exhausted) => {
                    queued = false;
                    retry_after = Some(ACCEPT_RETRY_DELAY);
                }
                Err(e) => break 'serve Err(e),
            }
        }

        let timeout = retry_after.take();
        if let Err(e) = poll.poll(&mut events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                retry_after = timeout;
                continue;
            }
            break Err(e.into());
        }

        if timeout.is_some() || events.iter().any(|event| event.token() == LISTENER_TOKEN) {
            queued = true;
        }
    };

    let _ = poll.registry().deregister(&mut SourceFd(&fd));
    drop(listener);
    info!("Listener closed");

    if let Some(handle) = current {
        if active.load(Ordering::SeqCst) > 0 {
            info!("Waiting for the current session to finish");
        }
        if handle.join().is_err() {
            error!("Session thread panicked");
        }
    }
    result
}

fn accept_next<A>(listener: &TcpListener, accept: &mut A) -> Result<Accepted, ServerError>
where
    A: FnMut(&TcpListener) -> io::Result<(TcpStream, SocketAddr)>,
{
    match accept(listener) {
        Ok((stream, peer)) => {
            info!(peer = %peer, "Received connection");
            // Accepted sockets inherit non-blocking mode on some platforms.
            if let Err(e) = stream.set_nonblocking(false) {
                warn!(peer = %peer, error = %e, "Failed to configure connection");
                return Ok(Accepted::Retry);
            }
            Ok(Accepted::Connection(stream, peer))
        }
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Accepted::Drained),
        Err(e) if is_resource_exhaustion(&e) => {
            warn!(error = %e, retry_in = ?ACCEPT_RETRY_DELAY, "Accept failed");
            Ok(Accepted::Exhausted)
        }
        Err(e) if is_transient_accept_error(&e) => {
            warn!(error = %e, "Accept failed");
            Ok(Accepted::Retry)
        }
        Err(e) => Err(ServerError::Accept(e)),
    }
}

/// Accept failures caused by running out of descriptors or memory. The
/// connection that hit them is still queued.
pub(crate) fn is_resource_exhaustion(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}

/// Accept failures that leave the listener usable.
pub(crate) fn is_transient_accept_error(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted | io::ErrorKind::Interrupted
    ) {
        return true;
    }
    is_resource_exhaustion(err) || matches!(err.raw_os_error(), Some(libc::EPROTO | libc::EPERM))
}

/// Create a TCP listener with an explicit backlog.
fn bind_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}
