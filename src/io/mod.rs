//! Chainable I/O handlers.
//!
//! A connection's transport is a singly linked chain of [`IoHandler`]s built
//! bottom-up: the [`SocketIoHandler`] owning the OS socket is always the
//! terminal node, optionally wrapped by TLS, write throttling and callback
//! dispatch, in that order:
//!
//! ```text
//! DispatchHandler -> ThrottledWriteHandler -> TlsIoHandler -> SocketIoHandler
//! ```
//!
//! Every trait method has a default that delegates to the successor, so a
//! handler only implements what it specializes and the whole chain looks like
//! a single handler to the connection. Events travel the other way through
//! [`IoHandlerCallback`]; a handler that needs to see them hands its
//! successor an [`EventQueue`] and processes the recorded events itself.
//!
//! ## Threading
//!
//! A chain is owned by one dispatcher and only ever driven from that
//! dispatcher's thread. Callbacks may cross to worker threads through a
//! [`DispatchHandler`].

pub mod activatable;
pub mod dispatch;
pub mod options;
pub mod socket;
pub mod throttle;
pub mod tls;

#[cfg(test)]
pub(crate) mod testing;

pub use activatable::ActivatableTlsIoHandler;
pub use dispatch::DispatchHandler;
pub use options::{OptionKind, SocketOption, SocketOptions};
pub use socket::SocketIoHandler;
pub use throttle::ThrottledWriteHandler;
pub use tls::TlsIoHandler;

use mio::{Registry, Token};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::runtime::buffer::{MemoryManager, SharedMemoryManager};
use crate::runtime::queue::Segments;
use crate::runtime::worker::WorkerPool;
use crate::tls::TlsEngineFactory;

/// Upward notifications from a handler chain.
pub trait IoHandlerCallback: Send + Sync {
    /// The connection is established (after the handshake for eager TLS).
    fn on_connect(&self);

    /// Bytes arrived, in wire order.
    fn on_data_read(&self, data: Segments);

    /// `bytes` reached the OS send buffer.
    fn on_written(&self, bytes: usize);

    fn on_write_exception(&self, err: &io::Error);

    /// Fired exactly once when the chain closes, for any reason.
    fn on_disconnect(&self);

    /// The socket failed without an explicit close (reset, OS error).
    fn on_connection_abnormal_terminated(&self);

    fn on_idle_timeout(&self);

    fn on_connection_timeout(&self);

    /// A TLS handshake completed.
    fn on_handshake_finished(&self) {}

    /// Plaintext delivery stopped ahead of a TLS upgrade. Nothing read
    /// after this point is reported until the upgrade happens.
    fn on_tls_prepared(&self) {}
}

/// A node in a connection's handler chain.
pub trait IoHandler: Send {
    fn successor(&self) -> Option<&dyn IoHandler>;

    fn successor_mut(&mut self) -> Option<&mut dyn IoHandler>;

    /// Bind the chain to its dispatcher. Called before [`init`](Self::init).
    fn attach(&mut self, registry: Arc<Registry>, token: Token) -> io::Result<()> {
        next(self)?.attach(registry, token)
    }

    /// Start the handler. No callback is invoked before this.
    fn init(&mut self, callback: Arc<dyn IoHandlerCallback>) -> io::Result<()> {
        next(self)?.init(callback)
    }

    /// Queue outgoing data and try to deliver it.
    fn write_outgoing(&mut self, data: Segments) -> io::Result<()> {
        next(self)?.write_outgoing(data)
    }

    /// Release everything held back (throttled data) right now.
    fn flush_outgoing(&mut self) -> io::Result<()> {
        next(self)?.flush_outgoing()
    }

    /// Take incoming data that was buffered instead of delivered.
    fn drain_incoming(&mut self) -> Segments {
        self.successor_mut()
            .map(|s| s.drain_incoming())
            .unwrap_or_default()
    }

    /// Close the chain. A non-immediate close delivers pending data first.
    fn close(&mut self, immediate: bool) -> io::Result<()> {
        next(self)?.close(immediate)
    }

    fn is_open(&self) -> bool {
        self.successor().is_some_and(|s| s.is_open())
    }

    fn on_readable(&mut self, memory: &mut dyn MemoryManager) -> io::Result<()> {
        next(self)?.on_readable(memory)
    }

    fn on_writable(&mut self) -> io::Result<()> {
        next(self)?.on_writable()
    }

    /// Periodic tick from the dispatcher.
    fn on_timer(&mut self, now: Instant) -> io::Result<()> {
        next(self)?.on_timer(now)
    }

    /// Idle and connection timeout check.
    fn check_timeouts(&mut self, now: Instant) -> io::Result<()> {
        next(self)?.check_timeouts(now)
    }

    /// Bytes accepted by the chain but not yet in the OS send buffer.
    fn pending_write_size(&self) -> usize {
        self.successor().map_or(0, |s| s.pending_write_size())
    }

    fn suspend_read(&mut self) -> io::Result<()> {
        next(self)?.suspend_read()
    }

    fn resume_read(&mut self) -> io::Result<()> {
        next(self)?.resume_read()
    }

    fn is_read_suspended(&self) -> bool {
        self.successor().is_some_and(|s| s.is_read_suspended())
    }

    fn set_option(&mut self, option: SocketOption) -> io::Result<()> {
        next(self)?.set_option(option)
    }

    fn option(&self, kind: OptionKind) -> io::Result<SocketOption> {
        self.successor().ok_or_else(unsupported)?.option(kind)
    }

    fn set_idle_timeout(&mut self, timeout: Option<Duration>) {
        if let Some(s) = self.successor_mut() {
            s.set_idle_timeout(timeout);
        }
    }

    fn set_connection_timeout(&mut self, timeout: Option<Duration>) {
        if let Some(s) = self.successor_mut() {
            s.set_connection_timeout(timeout);
        }
    }

    /// Limit outgoing bytes per second; `None` is unlimited.
    fn set_write_rate(&mut self, bytes_per_sec: Option<u64>) -> io::Result<()> {
        next(self)?.set_write_rate(bytes_per_sec)
    }

    /// Stop passing inbound plaintext up and hold reads and writes until
    /// [`IoHandler::activate_tls`].
    fn prepare_tls(&mut self) -> io::Result<()> {
        next(self)?.prepare_tls()
    }

    /// Upgrade a plaintext chain to TLS. `buffered` holds bytes the
    /// connection received but did not consume; they are fed to the engine
    /// first.
    fn activate_tls(&mut self, buffered: Segments) -> io::Result<()> {
        next(self)?.activate_tls(buffered)
    }

    fn is_secure(&self) -> bool {
        self.successor().is_some_and(|s| s.is_secure())
    }

    /// Drop per-use state before the connection is reused.
    fn reset(&mut self) -> io::Result<()> {
        next(self)?.reset()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.successor().and_then(|s| s.local_addr())
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.successor().and_then(|s| s.peer_addr())
    }

    fn bytes_received(&self) -> u64 {
        self.successor().map_or(0, |s| s.bytes_received())
    }

    fn bytes_sent(&self) -> u64 {
        self.successor().map_or(0, |s| s.bytes_sent())
    }
}

fn unsupported() -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        "operation not supported by this handler chain",
    )
}

fn next<H: IoHandler + ?Sized>(handler: &mut H) -> io::Result<&mut dyn IoHandler> {
    handler.successor_mut().ok_or_else(unsupported)
}

/// A recorded upward notification.
#[derive(Debug)]
pub enum IoEvent {
    Connect,
    DataRead(Segments),
    Written(usize),
    WriteException(io::Error),
    Disconnect,
    AbnormalTermination,
    IdleTimeout,
    ConnectionTimeout,
    HandshakeFinished,
    TlsPrepared,
}

impl IoEvent {
    /// Replay this event on `callback`.
    pub fn deliver(self, callback: &dyn IoHandlerCallback) {
        match self {
            IoEvent::Connect => callback.on_connect(),
            IoEvent::DataRead(data) => callback.on_data_read(data),
            IoEvent::Written(bytes) => callback.on_written(bytes),
            IoEvent::WriteException(err) => callback.on_write_exception(&err),
            IoEvent::Disconnect => callback.on_disconnect(),
            IoEvent::AbnormalTermination => callback.on_connection_abnormal_terminated(),
            IoEvent::IdleTimeout => callback.on_idle_timeout(),
            IoEvent::ConnectionTimeout => callback.on_connection_timeout(),
            IoEvent::HandshakeFinished => callback.on_handshake_finished(),
            IoEvent::TlsPrepared => callback.on_tls_prepared(),
        }
    }
}

/// Callback that records events for the handler above to process.
#[derive(Debug, Default)]
pub struct EventQueue {
    events: Mutex<VecDeque<IoEvent>>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every recorded event, oldest first.
    pub fn take(&self) -> VecDeque<IoEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    fn push(&self, event: IoEvent) {
        self.events.lock().push_back(event);
    }
}

impl IoHandlerCallback for EventQueue {
    fn on_connect(&self) {
        self.push(IoEvent::Connect);
    }

    fn on_data_read(&self, data: Segments) {
        self.push(IoEvent::DataRead(data));
    }

    fn on_written(&self, bytes: usize) {
        self.push(IoEvent::Written(bytes));
    }

    fn on_write_exception(&self, err: &io::Error) {
        self.push(IoEvent::WriteException(io::Error::new(
            err.kind(),
            err.to_string(),
        )));
    }

    fn on_disconnect(&self) {
        self.push(IoEvent::Disconnect);
    }

    fn on_connection_abnormal_terminated(&self) {
        self.push(IoEvent::AbnormalTermination);
    }

    fn on_idle_timeout(&self) {
        self.push(IoEvent::IdleTimeout);
    }

    fn on_connection_timeout(&self) {
        self.push(IoEvent::ConnectionTimeout);
    }

    fn on_handshake_finished(&self) {
        self.push(IoEvent::HandshakeFinished);
    }

    fn on_tls_prepared(&self) {
        self.push(IoEvent::TlsPrepared);
    }
}

/// When a TLS chain starts encrypting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsActivation {
    /// TLS from the first byte.
    Eager,
    /// Plaintext until [`IoHandler::activate_tls`].
    Deferred,
}

/// Assembles a handler chain on top of a socket handler.
#[derive(Clone, Default)]
pub struct ChainBuilder {
    tls: Option<(Arc<dyn TlsEngineFactory>, TlsActivation)>,
    throttle: Option<Option<u64>>,
    workers: Option<WorkerPool>,
    tls_memory: SharedMemoryManager,
}

impl ChainBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tls(mut self, factory: Arc<dyn TlsEngineFactory>, activation: TlsActivation) -> Self {
        self.tls = Some((factory, activation));
        self
    }

    /// Add a throttling handler with an initial rate (`None` = unlimited).
    pub fn throttled(mut self, bytes_per_sec: Option<u64>) -> Self {
        self.throttle = Some(bytes_per_sec);
        self
    }

    /// Run callbacks on `pool` instead of the dispatcher thread.
    pub fn workers(mut self, pool: Option<WorkerPool>) -> Self {
        self.workers = pool;
        self
    }

    /// Buffer pool for TLS record processing.
    pub fn tls_memory(mut self, memory: SharedMemoryManager) -> Self {
        self.tls_memory = memory;
        self
    }

    pub fn build(self, socket: SocketIoHandler) -> io::Result<Box<dyn IoHandler>> {
        let mut chain: Box<dyn IoHandler> = Box::new(socket);

        if let Some((factory, activation)) = self.tls {
            chain = match activation {
                TlsActivation::Eager => {
                    let engine = factory.new_engine().map_err(io::Error::other)?;
                    Box::new(TlsIoHandler::new(chain, engine, self.tls_memory))
                }
                TlsActivation::Deferred => {
                    Box::new(ActivatableTlsIoHandler::new(chain, factory, self.tls_memory))
                }
            };
        }

        if let Some(rate) = self.throttle {
            let mut throttled = ThrottledWriteHandler::new(chain);
            throttled.set_write_rate(rate)?;
            chain = Box::new(throttled);
        }

        Ok(Box::new(DispatchHandler::new(chain, self.workers)))
    }
}
