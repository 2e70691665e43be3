//! TCP server.
//!
//! A server binds a listener, runs an accept loop on its own thread and
//! turns every accepted socket into a [`NonBlockingConnection`] on the next
//! dispatcher of its [`IoContext`], with a handler from the server's
//! [`HandlerFactory`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::connection::{HandlerFactory, Transport};
use crate::context::IoContext;
use crate::error::Result;
use crate::io::{SocketOptions, TlsActivation};
use crate::runtime::acceptor::{bind_listener, Acceptor};
use crate::tls::TlsEngineFactory;

const DEFAULT_BACKLOG: i32 = 1024;

pub struct ServerBuilder {
    context: Arc<IoContext>,
    factory: Arc<dyn HandlerFactory>,
    transport: Transport,
    backlog: i32,
    name: String,
}

impl ServerBuilder {
    pub fn tls(mut self, factory: Arc<dyn TlsEngineFactory>, activation: TlsActivation) -> Self {
        self.transport.tls = Some((factory, activation));
        self
    }

    /// Give every connection write throttling, starting at `bytes_per_sec`
    /// (`None` = unlimited until set per connection).
    pub fn throttled(mut self, bytes_per_sec: Option<u64>) -> Self {
        self.transport.throttle = Some(bytes_per_sec);
        self
    }

    /// Options for the listener and accepted sockets. Defaults to the
    /// context's connection defaults.
    pub fn socket_options(mut self, options: SocketOptions) -> Self {
        self.transport.options = Some(options);
        self
    }

    pub fn backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    /// Name used for the acceptor thread and in logs.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Bind `addr` and start accepting.
    pub fn bind(self, addr: SocketAddr) -> Result<Server> {
        let options = self
            .transport
            .options
            .clone()
            .unwrap_or_else(|| self.context.defaults().socket.clone());
        let listener = bind_listener(addr, &options, self.backlog)?;

        let accepted = Arc::new(AtomicU64::new(0));
        let context = Arc::clone(&self.context);
        let factory = Arc::clone(&self.factory);
        let transport = self.transport.clone();
        let counter = Arc::clone(&accepted);
        let acceptor = Acceptor::spawn(listener, &self.name, move |stream, peer| {
            counter.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = transport.establish(&context, stream, None, Some(factory.create())) {
                warn!(peer = %peer, error = %e, "Failed to set up connection");
            }
        })?;

        info!(
            name = %self.name,
            addr = %acceptor.local_addr(),
            tls = ?self.transport.tls.as_ref().map(|(_, activation)| *activation),
            "Server listening"
        );

        Ok(Server {
            context: self.context,
            acceptor,
            accepted,
        })
    }
}

/// A running server. Dropping it stops accepting; established connections
/// live on until they close or their context shuts down.
pub struct Server {
    context: Arc<IoContext>,
    acceptor: Acceptor,
    accepted: Arc<AtomicU64>,
}

impl Server {
    pub fn builder(context: Arc<IoContext>, factory: impl HandlerFactory + 'static) -> ServerBuilder {
        ServerBuilder {
            context,
            factory: Arc::new(factory),
            transport: Transport::default(),
            backlog: DEFAULT_BACKLOG,
            name: "server".to_string(),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.acceptor.local_addr()
    }

    /// Sockets accepted since start.
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn context(&self) -> &Arc<IoContext> {
        &self.context
    }

    /// Stop accepting. The listener is closed.
    pub fn stop(&mut self) {
        self.acceptor.shutdown();
    }
}
