//! Single-threaded cooperative runtime.
//!
//! All sessions share one mio event loop (epoll on Linux, kqueue on macOS).
//! Sockets are non-blocking and CPU-bound work always goes to the
//! [`WorkerPool`](crate::pool::WorkerPool), so no session can stall the loop.
//!
//! - `connection`: per-connection state and the slab-backed registry
//! - `event_loop`: accept/read/write dispatch and pool completions

mod connection;
mod event_loop;

pub use event_loop::run;
