//! Client connections.

use mio::net::TcpStream;
use parking_lot::{Condvar, Mutex};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::connection::{BlockingConnection, Handler, NonBlockingConnection, Transport};
use crate::context::IoContext;
use crate::error::{Error, Result};
use crate::io::{SocketOptions, TlsActivation};
use crate::tls::TlsEngineFactory;

/// Opens client connections on an [`IoContext`].
///
/// ```no_run
/// # use nbsock::{Connector, IoContext, RuntimeConfig};
/// let context = IoContext::new(RuntimeConfig::default())?;
/// let conn = Connector::new(context).connect_blocking("127.0.0.1:7000".parse()?)?;
/// conn.write_str("ping\r\n")?;
/// let reply = conn.read_string_by_delimiter("\r\n", 1024)?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Clone)]
pub struct Connector {
    context: Arc<IoContext>,
    transport: Transport,
    connect_timeout: Duration,
}

impl Connector {
    pub fn new(context: Arc<IoContext>) -> Self {
        Self {
            context,
            transport: Transport::default(),
            connect_timeout: Duration::from_secs(30),
        }
    }

    pub fn tls(mut self, factory: Arc<dyn TlsEngineFactory>, activation: TlsActivation) -> Self {
        self.transport.tls = Some((factory, activation));
        self
    }

    /// Add write throttling, starting at `bytes_per_sec` (`None` = unlimited).
    pub fn throttled(mut self, bytes_per_sec: Option<u64>) -> Self {
        self.transport.throttle = Some(bytes_per_sec);
        self
    }

    pub fn socket_options(mut self, options: SocketOptions) -> Self {
        self.transport.options = Some(options);
        self
    }

    /// How long [`connect_blocking`](Self::connect_blocking) waits.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Start connecting and return at once. The handler's `on_connect` runs
    /// when the connection is established (after the handshake with eager
    /// TLS); a failed connect only produces `on_disconnect`.
    pub fn connect<H: Handler + 'static>(&self, addr: SocketAddr, handler: H) -> Result<NonBlockingConnection> {
        self.connect_with(addr, Arc::new(handler))
    }

    pub fn connect_with(&self, addr: SocketAddr, handler: Arc<dyn Handler>) -> Result<NonBlockingConnection> {
        let stream = start_connect(addr)?;
        debug!(peer = %addr, "Connecting");
        self.transport
            .establish(&self.context, stream, Some(addr), Some(handler))
    }

    /// Connect and wait until the connection is established.
    pub fn connect_blocking(&self, addr: SocketAddr) -> Result<BlockingConnection> {
        let waiter = Arc::new(ConnectWaiter::default());
        let stream = start_connect(addr)?;
        let conn = self.transport.establish(
            &self.context,
            stream,
            Some(addr),
            Some(Arc::clone(&waiter) as Arc<dyn Handler>),
        )?;

        match waiter.wait(self.connect_timeout) {
            Some(true) => Ok(BlockingConnection::new(
                conn,
                self.context.defaults().read_timeout,
            )),
            Some(false) => Err(Error::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("could not connect to {addr}"),
            ))),
            None => {
                let _ = conn.close_immediately();
                Err(Error::Timeout(self.connect_timeout))
            }
        }
    }
}

/// Issue a non-blocking connect.
fn start_connect(addr: SocketAddr) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }
    Ok(TcpStream::from_std(socket.into()))
}

/// Records the outcome of a connect. Leaves inbound data alone.
#[derive(Default)]
struct ConnectWaiter {
    outcome: Mutex<Option<bool>>,
    settled: Condvar,
}

impl ConnectWaiter {
    fn settle(&self, connected: bool) {
        let mut outcome = self.outcome.lock();
        if outcome.is_none() {
            *outcome = Some(connected);
            self.settled.notify_all();
        }
    }

    fn wait(&self, timeout: Duration) -> Option<bool> {
        let deadline = Instant::now() + timeout;
        let mut outcome = self.outcome.lock();
        while outcome.is_none() {
            if self.settled.wait_until(&mut outcome, deadline).timed_out() {
                break;
            }
        }
        *outcome
    }
}

impl Handler for ConnectWaiter {
    fn on_connect(&self, _conn: &NonBlockingConnection) -> Result<bool> {
        self.settle(true);
        Ok(true)
    }

    fn on_disconnect(&self, _conn: &NonBlockingConnection) -> Result<bool> {
        self.settle(false);
        Ok(true)
    }
}
