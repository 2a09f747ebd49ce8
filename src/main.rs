//! prime-server: answers TCP requests with the Nth prime
//!
//! Clients send the decimal digits of N and read back the Nth prime
//! followed by a newline. Connections stay open for repeated requests.
//!
//! Features:
//! - Serial, thread-per-connection, or single-threaded cooperative serving
//! - Optional offload of prime computation to a worker pool
//! - Configuration via CLI arguments or TOML file

mod compute;
mod config;
mod logging;
mod pool;
mod protocol;
mod runtime;
mod server;
mod session;

use compute::ComputeEngine;
use config::{Config, ConfigError, Strategy};
use pool::WorkerPool;
use server::{Server, ServerOptions, ShutdownHandle};
use session::SessionFactory;
use std::sync::Arc;
use std::thread;
use tracing::{error, info};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    logging::init(&config.log_level, config.log_file.as_deref())?;

    info!(
        host = %config.host,
        port = config.port,
        backlog = config.backlog,
        strategy = ?config.strategy,
        use_process_pool = config.use_process_pool,
        workers = config.workers,
        "Starting prime server"
    );
    if config.strategy == Strategy::Cooperative {
        info!("Cooperative strategy always offloads compute to the worker pool");
    }

    let pool = config
        .use_process_pool
        .then(|| Arc::new(WorkerPool::new(config.workers)));
    let factory = SessionFactory::new(ComputeEngine::new(pool), config.max_read)
        .ok_or(ConfigError::Invalid("max_read", "must be greater than 0"))?;

    let mut server = Server::new(ServerOptions::from(&config));
    server.set_handler_factory(factory)?;

    spawn_signal_listener(server.shutdown_handle())?;

    server.start()?;
    info!("Server stopped");
    Ok(())
}

/// Stop the server on Ctrl-C or SIGTERM.
fn spawn_signal_listener(shutdown: ShutdownHandle) -> std::io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    thread::Builder::new()
        .name("signal".to_string())
        .spawn(move || {
            runtime.block_on(async {
                if let Err(e) = shutdown_signal().await {
                    error!(error = %e, "Failed to install signal handler");
                    return;
                }
                shutdown.stop();

                // Open sessions may keep the server alive; a second signal exits.
                if shutdown_signal().await.is_ok() {
                    info!("Second interrupt, exiting");
                    std::process::exit(130);
                }
            });
        })?;

    Ok(())
}

async fn shutdown_signal() -> std::io::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Keyboard interrupt");
        }
        _ = terminate.recv() => {
            info!("Received SIGTERM");
        }
    }
    Ok(())
}
