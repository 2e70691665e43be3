//! Application-facing connections.
//!
//! A [`NonBlockingConnection`] is a cheap handle over state shared by the
//! application and the connection's dispatcher. Inbound data is queued by
//! the dispatcher (or a worker) and read with length or delimiter framing;
//! reads that cannot be satisfied yet return [`Error::Underflow`] and are
//! retried on the next data notification.
//!
//! Writes collect in a local queue and go to the dispatcher on flush. In
//! [`FlushMode::Sync`] the flush waits until the handler chain reports the
//! bytes handed to the OS; a sync flush issued on the connection's own
//! dispatcher thread cannot wait for itself and returns right away.

mod blocking;
mod connector;
mod encoding;
mod handler;
mod state;

pub use blocking::BlockingConnection;
pub use connector::Connector;
pub use encoding::Encoding;
pub use handler::{Handler, HandlerChain, HandlerFactory, PerConnection, Shared};

use bytes::Bytes;
use mio::net::TcpStream;
use parking_lot::{Condvar, Mutex};
use serde::Deserialize;
use socket2::{SockRef, Socket};
use std::any::Any;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::context::{ConnectionDefaults, IoContext};
use crate::error::{Error, Result};
use crate::io::{
    IoHandler, IoHandlerCallback, OptionKind, SocketIoHandler, SocketOption, SocketOptions,
    TlsActivation,
};
use crate::runtime::dispatcher::{Command, Control, DispatcherHandle};
use crate::runtime::flush::FlushTracker;
use crate::runtime::queue::{concat, Segments};
use crate::runtime::registry::{Registration, TokenCell};
use crate::tls::TlsEngineFactory;
use state::{ReadState, WriteState};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushMode {
    /// Wait until the data reached the OS send buffer.
    #[default]
    Sync,
    /// Hand the data to the dispatcher and return.
    Async,
}

/// Transport layers and socket options for new connections.
#[derive(Clone, Default)]
pub(crate) struct Transport {
    pub tls: Option<(Arc<dyn TlsEngineFactory>, TlsActivation)>,
    /// `Some` adds write throttling with the given initial rate.
    pub throttle: Option<Option<u64>>,
    /// Overrides the context's default socket options.
    pub options: Option<SocketOptions>,
}

impl Transport {
    /// Wrap `stream` in a handler chain and register it with the next
    /// dispatcher of `context`.
    pub fn establish(
        &self,
        context: &IoContext,
        stream: TcpStream,
        connecting: Option<SocketAddr>,
        handler: Option<Arc<dyn Handler>>,
    ) -> Result<NonBlockingConnection> {
        let defaults = context.defaults();
        let options = self.options.as_ref().unwrap_or(&defaults.socket);
        options.apply(&SockRef::from(&stream))?;

        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed).to_string();
        let parts = Endpoint {
            local_addr: stream.local_addr().ok(),
            peer_addr: connecting.or_else(|| stream.peer_addr().ok()),
            socket: SockRef::from(&stream).try_clone().ok(),
            tls: self.tls.as_ref().map(|(_, activation)| *activation),
            throttled: self.throttle.is_some(),
            id,
        };

        let socket = match connecting {
            Some(_) => SocketIoHandler::connecting(parts.id.clone(), stream),
            None => SocketIoHandler::accepted(parts.id.clone(), stream),
        }
        .with_read_chunk(context.config().read_chunk)
        .with_timeouts(defaults.idle_timeout, defaults.connection_timeout);

        let mut builder = context.chain_builder();
        if let Some((factory, activation)) = &self.tls {
            builder = builder.tls(Arc::clone(factory), *activation);
        }
        if let Some(rate) = self.throttle {
            builder = builder.throttled(rate);
        }
        let chain = builder.build(socket)?;

        let dispatcher = context.pool().next_dispatcher()?;
        NonBlockingConnection::register(chain, parts, dispatcher, defaults, handler)
    }
}

/// Identity and capabilities of a connection, fixed at creation.
pub(crate) struct Endpoint {
    pub id: String,
    pub local_addr: Option<SocketAddr>,
    pub peer_addr: Option<SocketAddr>,
    /// Duplicate of the socket for option access from any thread.
    pub socket: Option<Socket>,
    pub tls: Option<TlsActivation>,
    pub throttled: bool,
}

#[derive(Debug, Clone, Copy)]
struct Options {
    flush_mode: FlushMode,
    flush_timeout: Duration,
    encoding: Encoding,
}

type Attachment = Arc<dyn Any + Send + Sync>;

struct ConnectionInner {
    endpoint: Endpoint,
    dispatcher: DispatcherHandle,
    token: TokenCell,
    flush: Arc<FlushTracker>,
    handler: Option<Arc<dyn Handler>>,
    read: Mutex<ReadState>,
    readable: Condvar,
    write: Mutex<WriteState>,
    options: Mutex<Options>,
    attachment: Mutex<Option<Attachment>>,
    open: AtomicBool,
    tls_active: AtomicBool,
    /// Handshake input collected while a TLS upgrade is under way.
    tls_pending: Mutex<Option<Segments>>,
    read_suspended: AtomicBool,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
}

/// Handle to a connection. Clones refer to the same connection.
#[derive(Clone)]
pub struct NonBlockingConnection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for NonBlockingConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonBlockingConnection")
            .field("id", &self.inner.endpoint.id)
            .field("peer_addr", &self.inner.endpoint.peer_addr)
            .field("open", &self.is_open())
            .finish()
    }
}

impl NonBlockingConnection {
    pub(crate) fn register(
        chain: Box<dyn IoHandler>,
        endpoint: Endpoint,
        dispatcher: DispatcherHandle,
        defaults: &ConnectionDefaults,
        handler: Option<Arc<dyn Handler>>,
    ) -> Result<Self> {
        let conn = Self {
            inner: Arc::new(ConnectionInner {
                tls_active: AtomicBool::new(endpoint.tls == Some(TlsActivation::Eager)),
                endpoint,
                dispatcher,
                token: Arc::new(OnceLock::new()),
                flush: Arc::new(FlushTracker::new()),
                handler,
                read: Mutex::new(ReadState::default()),
                readable: Condvar::new(),
                write: Mutex::new(WriteState::new(defaults.autoflush)),
                options: Mutex::new(Options {
                    flush_mode: defaults.flush_mode,
                    flush_timeout: defaults.flush_timeout,
                    encoding: defaults.encoding,
                }),
                attachment: Mutex::new(None),
                tls_pending: Mutex::new(None),
                open: AtomicBool::new(true),
                read_suspended: AtomicBool::new(false),
                bytes_received: AtomicU64::new(0),
                bytes_sent: AtomicU64::new(0),
            }),
        };

        let callback: Arc<dyn IoHandlerCallback> = Arc::new(ConnectionCallback { conn: conn.clone() });
        conn.inner
            .dispatcher
            .register(Registration::new(
                chain,
                callback,
                Arc::clone(&conn.inner.token),
                Arc::clone(&conn.inner.flush),
            ))
            .map_err(|_| Error::Closed)?;
        debug!(conn = %conn.id(), dispatcher = conn.inner.dispatcher.id(), "Connection created");
        Ok(conn)
    }

    pub fn id(&self) -> &str {
        &self.inner.endpoint.id
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.endpoint.local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.endpoint.peer_addr
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    /// Whether traffic is encrypted: eager TLS, or deferred TLS after
    /// [`activate_tls`](Self::activate_tls).
    pub fn is_secure(&self) -> bool {
        self.inner.tls_active.load(Ordering::Acquire)
    }

    /// Id of the dispatcher serving this connection.
    pub fn dispatcher_id(&self) -> usize {
        self.inner.dispatcher.id()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::Closed)
        }
    }

    /// A recorded write failure takes precedence over `Closed`.
    fn ensure_writable(&self) -> Result<()> {
        match self.inner.flush.failure() {
            Some(err) => Err(err),
            None => self.ensure_open(),
        }
    }

    fn send(&self, command: Command) -> Result<()> {
        self.inner.dispatcher.send(command).map_err(|_| Error::Closed)
    }

    fn control(&self, op: Control) -> Result<()> {
        self.ensure_open()?;
        self.send(Command::Control {
            token: Arc::clone(&self.inner.token),
            op,
        })
    }

    // Reading

    /// Bytes queued for reading.
    pub fn available(&self) -> usize {
        self.inner.read.lock().queue.len()
    }

    pub fn read_segments_by_length(&self, len: usize) -> Result<Segments> {
        self.inner.read.lock().read_by_length(len)
    }

    pub fn read_bytes_by_length(&self, len: usize) -> Result<Bytes> {
        Ok(concat(&self.read_segments_by_length(len)?))
    }

    /// Read up to the next `delimiter`, which is consumed but not returned.
    /// Fails with [`Error::MaxLengthExceeded`] when more than `max_len` bytes
    /// precede it.
    pub fn read_segments_by_delimiter(&self, delimiter: &[u8], max_len: usize) -> Result<Segments> {
        self.inner.read.lock().read_by_delimiter(delimiter, max_len)
    }

    pub fn read_bytes_by_delimiter(&self, delimiter: &[u8], max_len: usize) -> Result<Bytes> {
        Ok(concat(&self.read_segments_by_delimiter(delimiter, max_len)?))
    }

    pub fn read_string_by_length(&self, len: usize) -> Result<String> {
        self.read_string_by_length_with(len, self.encoding())
    }

    pub fn read_string_by_length_with(&self, len: usize, encoding: Encoding) -> Result<String> {
        encoding.decode(&self.read_bytes_by_length(len)?)
    }

    pub fn read_string_by_delimiter(&self, delimiter: &str, max_len: usize) -> Result<String> {
        self.read_string_by_delimiter_with(delimiter, max_len, self.encoding())
    }

    pub fn read_string_by_delimiter_with(
        &self,
        delimiter: &str,
        max_len: usize,
        encoding: Encoding,
    ) -> Result<String> {
        let delimiter = encoding.encode(delimiter)?;
        encoding.decode(&self.read_bytes_by_delimiter(&delimiter, max_len)?)
    }

    fn read_array<const N: usize>(&self) -> Result<[u8; N]> {
        let bytes = self.read_bytes_by_length(N)?;
        let mut out = [0; N];
        out.copy_from_slice(&bytes);
        Ok(out)
    }

    pub fn read_u8(&self) -> Result<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_i32(&self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.read_array()?))
    }

    pub fn read_i64(&self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.read_array()?))
    }

    pub fn read_f64(&self) -> Result<f64> {
        Ok(f64::from_be_bytes(self.read_array()?))
    }

    /// Record everything read from now on so it can be put back.
    pub fn mark_read_position(&self) {
        self.inner.read.lock().mark();
    }

    pub fn reset_to_read_mark(&self) -> Result<()> {
        self.inner.read.lock().reset_to_mark()
    }

    pub fn remove_read_mark(&self) {
        self.inner.read.lock().remove_mark();
    }

    // Writing

    pub fn write(&self, data: impl Into<Bytes>) -> Result<usize> {
        let data = data.into();
        let len = data.len();
        self.ensure_writable()?;
        let autoflush = {
            let mut write = self.inner.write.lock();
            write.write(data);
            write.autoflush
        };
        if autoflush {
            self.flush()?;
        }
        Ok(len)
    }

    pub fn write_segments(&self, segments: Segments) -> Result<usize> {
        self.ensure_writable()?;
        let mut len = 0;
        let autoflush = {
            let mut write = self.inner.write.lock();
            for segment in segments {
                len += segment.len();
                write.write(segment);
            }
            write.autoflush
        };
        if autoflush {
            self.flush()?;
        }
        Ok(len)
    }

    pub fn write_str(&self, text: &str) -> Result<usize> {
        self.write_str_with(text, self.encoding())
    }

    pub fn write_str_with(&self, text: &str, encoding: Encoding) -> Result<usize> {
        self.write(encoding.encode(text)?)
    }

    pub fn write_u8(&self, value: u8) -> Result<usize> {
        self.write(Bytes::copy_from_slice(&[value]))
    }

    pub fn write_i32(&self, value: i32) -> Result<usize> {
        self.write(Bytes::copy_from_slice(&value.to_be_bytes()))
    }

    pub fn write_i64(&self, value: i64) -> Result<usize> {
        self.write(Bytes::copy_from_slice(&value.to_be_bytes()))
    }

    pub fn write_f64(&self, value: f64) -> Result<usize> {
        self.write(Bytes::copy_from_slice(&value.to_be_bytes()))
    }

    /// Send written data to the dispatcher. Data behind an active write
    /// mark is held back until the mark is removed.
    pub fn flush(&self) -> Result<()> {
        self.flush_with(self.flush_mode())
    }

    pub(crate) fn flush_with(&self, mode: FlushMode) -> Result<()> {
        let seq = self.hand_off()?;
        if mode == FlushMode::Async {
            return Ok(());
        }
        if self.inner.dispatcher.is_current() {
            trace!(conn = %self.id(), "Sync flush on dispatcher thread, not waiting");
            return Ok(());
        }
        let timeout = self.inner.options.lock().flush_timeout;
        self.inner.flush.wait(seq, timeout)
    }

    /// Pass flushable data to the dispatcher, returning the flush sequence.
    fn hand_off(&self) -> Result<u64> {
        self.ensure_writable()?;
        let mut write = self.inner.write.lock();
        let data = write.take_flushable();
        let len: usize = data.iter().map(Bytes::len).sum();
        let seq = self.inner.flush.submit();
        // Sent under the lock so concurrent flushes keep their order.
        self.send(Command::Write {
            token: Arc::clone(&self.inner.token),
            data,
            seq,
        })?;
        self.inner.bytes_sent.fetch_add(len as u64, Ordering::Relaxed);
        trace!(conn = %self.id(), bytes = len, seq, "Flush handed to dispatcher");
        Ok(seq)
    }

    /// Bytes written but not yet flushed.
    pub fn pending_write_size(&self) -> usize {
        self.inner.write.lock().pending()
    }

    pub fn set_autoflush(&self, autoflush: bool) {
        self.inner.write.lock().autoflush = autoflush;
    }

    pub fn is_autoflush(&self) -> bool {
        self.inner.write.lock().autoflush
    }

    pub fn set_flush_mode(&self, mode: FlushMode) {
        self.inner.options.lock().flush_mode = mode;
    }

    pub fn flush_mode(&self) -> FlushMode {
        self.inner.options.lock().flush_mode
    }

    pub fn set_flush_timeout(&self, timeout: Duration) {
        self.inner.options.lock().flush_timeout = timeout;
    }

    pub fn set_encoding(&self, encoding: Encoding) {
        self.inner.options.lock().encoding = encoding;
    }

    pub fn encoding(&self) -> Encoding {
        self.inner.options.lock().encoding
    }

    /// Start a write mark. Requires autoflush to be off.
    pub fn mark_write_position(&self) -> Result<()> {
        self.inner.write.lock().mark()
    }

    /// Make the following writes overwrite the bytes written since the mark.
    pub fn reset_to_write_mark(&self) -> Result<()> {
        self.inner.write.lock().reset_to_mark()
    }

    pub fn remove_write_mark(&self) {
        self.inner.write.lock().remove_mark();
    }

    // Connection control

    pub fn suspend_read(&self) -> Result<()> {
        self.control(Control::SuspendRead)?;
        self.inner.read_suspended.store(true, Ordering::Release);
        Ok(())
    }

    pub fn resume_read(&self) -> Result<()> {
        self.control(Control::ResumeRead)?;
        self.inner.read_suspended.store(false, Ordering::Release);
        Ok(())
    }

    pub fn is_read_suspended(&self) -> bool {
        self.inner.read_suspended.load(Ordering::Acquire)
    }

    /// `None` disables the idle timeout.
    pub fn set_idle_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.control(Control::IdleTimeout(timeout))
    }

    pub fn set_connection_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.control(Control::ConnectionTimeout(timeout))
    }

    pub fn set_option(&self, option: SocketOption) -> Result<()> {
        option.apply(&SockRef::from(self.socket()?))?;
        Ok(())
    }

    pub fn option(&self, kind: OptionKind) -> Result<SocketOption> {
        Ok(SocketOption::read(kind, &SockRef::from(self.socket()?))?)
    }

    fn socket(&self) -> Result<&Socket> {
        self.ensure_open()?;
        self.inner
            .endpoint
            .socket
            .as_ref()
            .ok_or(Error::Unsupported("connection has no socket"))
    }

    /// Limit outgoing bytes per second. `None` lifts the limit and releases
    /// everything queued.
    pub fn set_write_rate(&self, bytes_per_sec: Option<u64>) -> Result<()> {
        if !self.inner.endpoint.throttled {
            return Err(Error::Unsupported("connection has no write throttling"));
        }
        self.control(Control::WriteRate(bytes_per_sec))
    }

    /// Switch a connection created with deferred TLS to TLS.
    ///
    /// Data received but not yet read, and everything received from now on,
    /// is handshake input. The chain first stops delivering plaintext; once
    /// that is confirmed the collected bytes are handed back and the
    /// handshake starts. Writes issued meanwhile go out encrypted.
    pub fn activate_tls(&self) -> Result<()> {
        if self.inner.endpoint.tls != Some(TlsActivation::Deferred) {
            return Err(Error::Unsupported("connection was not created with deferred TLS"));
        }
        if self.is_secure() {
            return Err(Error::Unsupported("TLS is already active"));
        }
        // Plaintext written so far leaves before the switch.
        self.hand_off()?;
        {
            let mut pending = self.inner.tls_pending.lock();
            let mut read = self.inner.read.lock();
            let buffered = read.queue.drain();
            read.clear();
            *pending = Some(buffered);
        }
        if let Err(e) = self.control(Control::PrepareTls) {
            self.inner.tls_pending.lock().take();
            return Err(e);
        }
        self.inner.tls_active.store(true, Ordering::Release);
        debug!(conn = %self.id(), "TLS activation requested");
        Ok(())
    }

    /// The chain stopped delivering plaintext; hand the collected bytes
    /// back so the handshake can start.
    fn finish_tls_activation(&self) {
        let Some(buffered) = self.inner.tls_pending.lock().take() else {
            debug!(conn = %self.id(), "No TLS activation pending");
            return;
        };
        trace!(
            conn = %self.id(),
            bytes = buffered.iter().map(Bytes::len).sum::<usize>(),
            "Returning handshake input"
        );
        if let Err(e) = self.control(Control::ActivateTls(buffered)) {
            warn!(conn = %self.id(), error = %e, "TLS activation failed, closing connection");
            let _ = self.close_immediately();
        }
    }

    /// Clear marks, queued data and recorded flush failures so the
    /// connection can be reused.
    pub fn reset(&self) -> Result<()> {
        self.inner.read.lock().clear();
        self.inner.write.lock().clear();
        self.inner.tls_pending.lock().take();
        self.inner.flush.clear_failure();
        self.control(Control::Reset)?;
        self.inner.read_suspended.store(false, Ordering::Release);
        Ok(())
    }

    /// Replace the attachment, returning the previous one.
    pub fn attach<T: Any + Send + Sync>(&self, value: T) -> Option<Attachment> {
        self.inner.attachment.lock().replace(Arc::new(value))
    }

    pub fn attachment<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.inner.attachment.lock().clone()?.downcast::<T>().ok()
    }

    /// Application bytes received.
    pub fn bytes_received(&self) -> u64 {
        self.inner.bytes_received.load(Ordering::Relaxed)
    }

    /// Application bytes handed to the dispatcher.
    pub fn bytes_sent(&self) -> u64 {
        self.inner.bytes_sent.load(Ordering::Relaxed)
    }

    /// Flush what has been written and close once it is sent.
    pub fn close(&self) -> Result<()> {
        if !self.is_open() {
            return Ok(());
        }
        if let Err(e) = self.hand_off() {
            debug!(conn = %self.id(), error = %e, "Flush before close failed");
        }
        self.send_close(false)
    }

    /// Close without sending pending data.
    pub fn close_immediately(&self) -> Result<()> {
        if !self.is_open() {
            return Ok(());
        }
        self.send_close(true)
    }

    fn send_close(&self, immediate: bool) -> Result<()> {
        match self.send(Command::Close {
            token: Arc::clone(&self.inner.token),
            immediate,
        }) {
            // The dispatcher is gone and took the connection with it.
            Err(Error::Closed) => Ok(()),
            other => other,
        }
    }

    // Blocking support

    pub(crate) fn read_version(&self) -> u64 {
        self.inner.read.lock().version
    }

    /// Wait until data arrives after `version`. Fails once the connection
    /// has closed with nothing new to read.
    pub(crate) fn wait_for_data(&self, version: u64, deadline: Instant, timeout: Duration) -> Result<()> {
        let mut read = self.inner.read.lock();
        while read.version == version {
            if read.closed {
                return Err(Error::Closed);
            }
            if self.inner.readable.wait_until(&mut read, deadline).timed_out() {
                return Err(Error::Timeout(timeout));
            }
        }
        Ok(())
    }

    /// Run the handler while it keeps consuming data.
    fn dispatch_data(&self) {
        let Some(handler) = &self.inner.handler else {
            return;
        };
        loop {
            let before = self.available();
            if before == 0 || !self.is_open() {
                return;
            }
            match handler.on_data(self) {
                Ok(_) if self.available() < before => {}
                Ok(_) => return,
                Err(Error::Underflow) => return,
                Err(e) => {
                    warn!(conn = %self.id(), error = %e, "Handler failed, closing connection");
                    let _ = self.close();
                    return;
                }
            }
        }
    }

    fn run_timeout_handler(&self, kind: &str, f: impl FnOnce(&dyn Handler) -> Result<bool>) {
        let handled = match &self.inner.handler {
            Some(handler) => f(handler.as_ref()),
            None => Ok(false),
        };
        match handled {
            Ok(true) => trace!(conn = %self.id(), kind, "Timeout handled"),
            Ok(false) => {
                debug!(conn = %self.id(), kind, "Unhandled timeout, closing connection");
                let _ = self.close();
            }
            Err(e) => {
                warn!(conn = %self.id(), kind, error = %e, "Timeout handler failed, closing connection");
                let _ = self.close();
            }
        }
    }
}

/// Receives chain events for one connection.
struct ConnectionCallback {
    conn: NonBlockingConnection,
}

impl IoHandlerCallback for ConnectionCallback {
    fn on_connect(&self) {
        debug!(conn = %self.conn.id(), peer = ?self.conn.peer_addr(), "Connected");
        if let Some(handler) = &self.conn.inner.handler {
            if let Err(e) = handler.on_connect(&self.conn) {
                warn!(conn = %self.conn.id(), error = %e, "Connect handler failed, closing connection");
                let _ = self.conn.close();
            }
        }
    }

    fn on_data_read(&self, data: Segments) {
        let len: usize = data.iter().map(Bytes::len).sum();
        self.conn
            .inner
            .bytes_received
            .fetch_add(len as u64, Ordering::Relaxed);
        {
            let mut pending = self.conn.inner.tls_pending.lock();
            if let Some(handshake) = pending.as_mut() {
                trace!(conn = %self.conn.id(), bytes = len, "Holding data for TLS activation");
                handshake.extend(data);
                return;
            }
            let mut read = self.conn.inner.read.lock();
            read.deliver(data);
            self.conn.inner.readable.notify_all();
        }
        trace!(conn = %self.conn.id(), bytes = len, "Data received");
        self.conn.dispatch_data();
    }

    fn on_written(&self, bytes: usize) {
        trace!(conn = %self.conn.id(), bytes, "Data written");
    }

    fn on_write_exception(&self, err: &io::Error) {
        debug!(conn = %self.conn.id(), error = %err, "Write failed");
        self.conn.inner.flush.fail(err);
        if let Some(handler) = &self.conn.inner.handler {
            if let Err(e) = handler.on_write_exception(&self.conn, err) {
                warn!(conn = %self.conn.id(), error = %e, "Write exception handler failed");
            }
        }
    }

    fn on_disconnect(&self) {
        if !self.conn.inner.open.swap(false, Ordering::AcqRel) {
            return;
        }
        {
            let mut read = self.conn.inner.read.lock();
            read.close();
            self.conn.inner.readable.notify_all();
        }
        self.conn.inner.flush.close();
        debug!(conn = %self.conn.id(), "Disconnected");
        if let Some(handler) = &self.conn.inner.handler {
            if let Err(e) = handler.on_disconnect(&self.conn) {
                warn!(conn = %self.conn.id(), error = %e, "Disconnect handler failed");
            }
        }
    }

    fn on_connection_abnormal_terminated(&self) {
        debug!(conn = %self.conn.id(), "Connection terminated abnormally");
    }

    fn on_idle_timeout(&self) {
        self.conn
            .run_timeout_handler("idle", |handler| handler.on_idle_timeout(&self.conn));
    }

    fn on_connection_timeout(&self) {
        self.conn.run_timeout_handler("connection", |handler| {
            handler.on_connection_timeout(&self.conn)
        });
    }

    fn on_handshake_finished(&self) {
        debug!(conn = %self.conn.id(), "TLS handshake finished");
    }

    fn on_tls_prepared(&self) {
        self.conn.finish_tls_activation();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::testing::{MockHandle, MockIoHandler};
    use crate::runtime::dispatcher::{Dispatcher, DispatcherConfig};
    use std::sync::atomic::AtomicUsize;

    fn wait_for(cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    struct Harness {
        dispatcher: DispatcherHandle,
        conn: NonBlockingConnection,
        socket: MockHandle,
        callback: ConnectionCallback,
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.dispatcher.shutdown();
        }
    }

    fn open(handler: Option<Arc<dyn Handler>>, endpoint: Endpoint) -> Harness {
        let dispatcher = Dispatcher::spawn(DispatcherConfig {
            name: "conn-test".to_string(),
            tick: Duration::from_millis(5),
            ..DispatcherConfig::default()
        })
        .unwrap();
        let (chain, socket) = MockIoHandler::boxed();
        let conn = NonBlockingConnection::register(
            chain,
            endpoint,
            dispatcher.clone(),
            &ConnectionDefaults::default(),
            handler,
        )
        .unwrap();
        wait_for(|| conn.inner.token.get().is_some());
        let callback = ConnectionCallback { conn: conn.clone() };
        Harness {
            dispatcher,
            conn,
            socket,
            callback,
        }
    }

    fn plain() -> Endpoint {
        Endpoint {
            id: "test".to_string(),
            local_addr: None,
            peer_addr: None,
            socket: None,
            tls: None,
            throttled: false,
        }
    }

    fn data(bytes: &'static [u8]) -> Segments {
        vec![Bytes::from_static(bytes)]
    }

    /// Echoes every line back.
    struct LineEcho {
        lines: AtomicUsize,
    }

    impl Handler for LineEcho {
        fn on_data(&self, conn: &NonBlockingConnection) -> Result<bool> {
            let line = conn.read_bytes_by_delimiter(b"\n", 8)?;
            self.lines.fetch_add(1, Ordering::SeqCst);
            conn.write(line)?;
            conn.write_u8(b'\n')?;
            Ok(true)
        }
    }

    #[test]
    fn test_sync_write_reaches_chain() {
        let h = open(None, plain());
        h.conn.write_str("hello").unwrap();
        assert_eq!(h.socket.written(), b"hello");
        assert_eq!(h.conn.bytes_sent(), 5);
    }

    #[test]
    fn test_handler_consumes_every_complete_line() {
        let echo = Arc::new(LineEcho {
            lines: AtomicUsize::new(0),
        });
        let h = open(Some(echo.clone()), plain());
        h.callback.on_data_read(data(b"a\nb\nc"));

        assert_eq!(echo.lines.load(Ordering::SeqCst), 2);
        assert_eq!(h.conn.available(), 1);
        wait_for(|| h.socket.written() == b"a\nb\n");
        assert_eq!(h.conn.bytes_received(), 5);
    }

    #[test]
    fn test_max_length_violation_closes() {
        let echo = Arc::new(LineEcho {
            lines: AtomicUsize::new(0),
        });
        let h = open(Some(echo), plain());
        h.callback.on_data_read(data(b"0123456789"));
        wait_for(|| !h.conn.is_open());
        assert_eq!(h.socket.state().close_calls, vec![false]);
        assert!(matches!(h.conn.write_str("late"), Err(Error::Closed)));
    }

    #[test]
    fn test_idle_timeout_closes_unless_handled() {
        struct KeepAlive;
        impl Handler for KeepAlive {
            fn on_idle_timeout(&self, _conn: &NonBlockingConnection) -> Result<bool> {
                Ok(true)
            }
        }

        let kept = open(Some(Arc::new(KeepAlive)), plain());
        kept.callback.on_idle_timeout();
        assert!(kept.conn.is_open());

        let dropped = open(None, plain());
        dropped.callback.on_idle_timeout();
        wait_for(|| !dropped.conn.is_open());
    }

    #[test]
    fn test_handler_chain_stops_at_first_handled() {
        struct Claims(Arc<AtomicUsize>);
        impl Handler for Claims {
            fn on_connection_timeout(&self, _conn: &NonBlockingConnection) -> Result<bool> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }
        }
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let chain = HandlerChain::new()
            .with(Claims(Arc::clone(&first)))
            .with(Claims(Arc::clone(&second)));

        let h = open(Some(Arc::new(chain)), plain());
        h.callback.on_connection_timeout();
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
        assert!(h.conn.is_open());
    }

    #[test]
    fn test_sync_flush_on_dispatcher_thread_does_not_wait() {
        struct Greeter;
        impl Handler for Greeter {
            fn on_connect(&self, conn: &NonBlockingConnection) -> Result<bool> {
                conn.write_str("220 ready\r\n")?;
                Ok(true)
            }
        }
        // MockIoHandler connects during registration, on the dispatcher.
        let h = open(Some(Arc::new(Greeter)), plain());
        wait_for(|| h.socket.written() == b"220 ready\r\n");
    }

    #[test]
    fn test_scalars_and_strings() {
        let h = open(None, plain());
        h.callback.on_data_read(vec![
            Bytes::from_static(&[0x07, 0, 0, 1]),
            Bytes::from_static(&[0, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xfe]),
            Bytes::copy_from_slice(&2.5f64.to_be_bytes()),
            Bytes::from_static(b"caf\xe9;;"),
        ]);
        assert_eq!(h.conn.read_u8().unwrap(), 7);
        assert_eq!(h.conn.read_i32().unwrap(), 256);
        assert_eq!(h.conn.read_i64().unwrap(), -2);
        assert_eq!(h.conn.read_f64().unwrap(), 2.5);
        assert_eq!(
            h.conn
                .read_string_by_delimiter_with(";;", 16, Encoding::Latin1)
                .unwrap(),
            "café"
        );
        assert!(matches!(h.conn.read_u8(), Err(Error::Underflow)));
    }

    #[test]
    fn test_read_mark_round_trip() {
        let h = open(None, plain());
        h.callback.on_data_read(data(b"\x00\x00\x00\x05abc"));
        h.conn.mark_read_position();
        let len = h.conn.read_i32().unwrap() as usize;
        assert!(matches!(h.conn.read_bytes_by_length(len), Err(Error::Underflow)));
        h.conn.reset_to_read_mark().unwrap();
        assert_eq!(h.conn.available(), 7);

        h.callback.on_data_read(data(b"de"));
        h.conn.mark_read_position();
        let len = h.conn.read_i32().unwrap() as usize;
        assert_eq!(&h.conn.read_bytes_by_length(len).unwrap()[..], b"abcde");
        h.conn.remove_read_mark();
    }

    #[test]
    fn test_length_prefix_with_write_mark() {
        let h = open(None, plain());
        h.conn.set_autoflush(false);
        h.conn.mark_write_position().unwrap();
        h.conn.write_i32(0).unwrap();
        let body = h.conn.write_str("payload").unwrap();
        h.conn.reset_to_write_mark().unwrap();
        h.conn.write_i32(body as i32).unwrap();
        h.conn.remove_write_mark();
        h.conn.flush().unwrap();
        assert_eq!(h.socket.written(), b"\x00\x00\x00\x07payload");
    }

    #[test]
    fn test_write_mark_rejected_with_autoflush() {
        let h = open(None, plain());
        assert!(matches!(
            h.conn.mark_write_position(),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn test_capability_checks() {
        let h = open(None, plain());
        assert!(matches!(
            h.conn.set_write_rate(Some(100)),
            Err(Error::Unsupported(_))
        ));
        assert!(matches!(h.conn.activate_tls(), Err(Error::Unsupported(_))));
        assert!(matches!(
            h.conn.option(OptionKind::NoDelay),
            Err(Error::Unsupported(_))
        ));

        let throttled = open(
            None,
            Endpoint {
                throttled: true,
                ..plain()
            },
        );
        throttled.conn.set_write_rate(Some(100)).unwrap();
        wait_for(|| throttled.socket.state().write_rate == Some(100));
    }

    #[test]
    fn test_suspend_and_reset() {
        let h = open(None, plain());
        h.conn.suspend_read().unwrap();
        assert!(h.conn.is_read_suspended());
        wait_for(|| h.socket.state().read_suspended);

        h.callback.on_data_read(data(b"leftover"));
        h.conn.mark_read_position();
        h.conn.reset().unwrap();
        assert_eq!(h.conn.available(), 0);
        assert!(!h.conn.is_read_suspended());
        assert!(h.conn.reset_to_read_mark().is_err());
    }

    #[test]
    fn test_typed_attachment() {
        let h = open(None, plain());
        assert!(h.conn.attachment::<String>().is_none());
        h.conn.attach("session".to_string());
        assert_eq!(h.conn.attachment::<String>().unwrap().as_str(), "session");
        assert!(h.conn.attachment::<u32>().is_none());
    }

    #[test]
    fn test_write_failure_reaches_handler_and_next_write() {
        struct Watch(Mutex<Option<io::ErrorKind>>);
        impl Handler for Watch {
            fn on_write_exception(
                &self,
                _conn: &NonBlockingConnection,
                err: &io::Error,
            ) -> Result<bool> {
                *self.0.lock() = Some(err.kind());
                Ok(true)
            }
        }

        let watch = Arc::new(Watch(Mutex::new(None)));
        let h = open(Some(watch.clone()), plain());
        h.conn.set_flush_mode(FlushMode::Async);
        h.socket.state().write_error = Some(io::ErrorKind::BrokenPipe);

        h.conn.write_str("lost").unwrap();
        wait_for(|| *watch.0.lock() == Some(io::ErrorKind::BrokenPipe));
        assert!(matches!(
            h.conn.write_str("again"),
            Err(Error::Io(e)) if e.kind() == io::ErrorKind::BrokenPipe
        ));
        assert!(matches!(h.conn.flush(), Err(Error::Io(_))));
        wait_for(|| !h.conn.is_open());
    }

    #[test]
    fn test_tls_activation_collects_in_flight_data() {
        struct Upgrade;
        impl Handler for Upgrade {
            fn on_data(&self, conn: &NonBlockingConnection) -> Result<bool> {
                let line = conn.read_bytes_by_delimiter(b"\n", 16)?;
                if &line[..] == b"STARTTLS" {
                    conn.activate_tls()?;
                }
                Ok(true)
            }
        }

        let h = open(
            Some(Arc::new(Upgrade)),
            Endpoint {
                tls: Some(TlsActivation::Deferred),
                ..plain()
            },
        );
        h.callback.on_data_read(data(b"STARTTLS\nhello"));
        assert!(h.conn.is_secure());
        assert_eq!(h.conn.available(), 0);
        wait_for(|| h.socket.state().tls_prepared);

        // Read by the chain before it stopped delivering plaintext.
        h.callback.on_data_read(data(b" again"));
        assert_eq!(h.conn.available(), 0);
        assert!(h.socket.state().tls_input.is_none());

        h.callback.on_tls_prepared();
        wait_for(|| h.socket.state().tls_input.is_some());
        assert_eq!(
            h.socket.state().tls_input.as_deref(),
            Some(&b"hello again"[..])
        );
        assert!(h.conn.activate_tls().is_err());
    }

    #[test]
    fn test_disconnect_fires_once() {
        struct Counter(Arc<AtomicUsize>);
        impl Handler for Counter {
            fn on_disconnect(&self, _conn: &NonBlockingConnection) -> Result<bool> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }
        }
        let count = Arc::new(AtomicUsize::new(0));
        let h = open(Some(Arc::new(Counter(Arc::clone(&count)))), plain());
        h.conn.close().unwrap();
        wait_for(|| !h.conn.is_open());
        h.callback.on_disconnect();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(h.conn.close().is_ok());
    }
}
