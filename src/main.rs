//! nbsock-echo: an echo server on the nbsock connection framework.
//!
//! Features:
//! - Line echo or length-prefixed echo
//! - Optional TLS, eager or activated on request
//! - Optional write throttling
//! - Configuration via CLI arguments or TOML file

use std::sync::Arc;
use std::time::Duration;

use nbsock::config::Config;
use nbsock::protocols::echo::EchoHandler;
use nbsock::{IoContext, Server, ServerTls, Shared};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const STATS_INTERVAL: Duration = Duration::from_secs(60);

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        mode = ?config.mode,
        dispatchers = config.runtime.dispatchers,
        workers = config.runtime.worker_threads,
        tls = config.tls.is_some(),
        write_rate = ?config.write_rate,
        "Starting nbsock-echo server"
    );

    let context = IoContext::new(config.runtime.clone())?;
    let mut builder = Server::builder(Arc::clone(&context), Shared::new(EchoHandler::new(config.mode)))
        .name("echo")
        .backlog(config.backlog);
    if let Some(tls) = &config.tls {
        let factory = ServerTls::from_pem_files(&tls.cert, &tls.key)?;
        builder = builder.tls(Arc::new(factory), tls.activation);
    }
    if config.write_rate.is_some() {
        builder = builder.throttled(config.write_rate);
    }
    let server = builder.bind(config.listen)?;

    info!(addr = %server.local_addr(), "Accepting connections");

    loop {
        std::thread::sleep(STATS_INTERVAL);
        for (id, stats) in context.pool().stats() {
            debug!(
                dispatcher = id,
                active = stats.active,
                registered = stats.registered,
                refused = stats.refused,
                "Dispatcher stats"
            );
        }
        debug!(accepted = server.accepted(), "Server stats");
    }
}
