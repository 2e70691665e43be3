//! Terminal handler owning the non-blocking TCP socket.
//!
//! Writes are attempted immediately; whatever the OS does not accept stays
//! queued and the socket is registered for writability until it drains.
//! Reads pull buffers from the dispatcher's memory manager and read until
//! the socket would block, as mio readiness is edge-triggered.

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use socket2::SockRef;
use std::io::{self, IoSlice, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::io::{IoHandler, IoHandlerCallback, OptionKind, SocketOption};
use crate::runtime::buffer::MemoryManager;
use crate::runtime::queue::{ByteBufferQueue, Segments};

/// Default minimum size of a read buffer.
pub const DEFAULT_READ_CHUNK: usize = 8 * 1024;

/// Maximum segments handed to one vectored write.
const MAX_IOVECS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocketState {
    /// Client socket waiting for the connect to complete.
    Connecting,
    Connected,
    /// Graceful close requested; draining the send queue.
    Closing,
    Closed,
}

pub struct SocketIoHandler {
    id: String,
    stream: TcpStream,
    registry: Option<Arc<Registry>>,
    token: Token,
    interest: Option<Interest>,
    callback: Option<Arc<dyn IoHandlerCallback>>,
    send_queue: ByteBufferQueue,
    state: SocketState,
    read_suspended: bool,
    read_chunk: usize,
    bytes_received: u64,
    bytes_sent: u64,
    connected_at: Instant,
    last_received: Instant,
    idle_timeout: Option<Duration>,
    connection_timeout: Option<Duration>,
    connection_timeout_fired: bool,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    disconnect_notified: bool,
}

impl SocketIoHandler {
    /// Wrap a socket returned by accept.
    pub fn accepted(id: impl Into<String>, stream: TcpStream) -> Self {
        let mut handler = Self::with_state(id.into(), stream, SocketState::Connected);
        handler.peer_addr = handler.stream.peer_addr().ok();
        handler
    }

    /// Wrap a socket whose non-blocking connect is still in progress.
    pub fn connecting(id: impl Into<String>, stream: TcpStream) -> Self {
        Self::with_state(id.into(), stream, SocketState::Connecting)
    }

    fn with_state(id: String, stream: TcpStream, state: SocketState) -> Self {
        let now = Instant::now();
        let local_addr = stream.local_addr().ok();
        Self {
            id,
            stream,
            registry: None,
            token: Token(0),
            interest: None,
            callback: None,
            send_queue: ByteBufferQueue::new(),
            state,
            read_suspended: false,
            read_chunk: DEFAULT_READ_CHUNK,
            bytes_received: 0,
            bytes_sent: 0,
            connected_at: now,
            last_received: now,
            idle_timeout: None,
            connection_timeout: None,
            connection_timeout_fired: false,
            local_addr,
            peer_addr: None,
            disconnect_notified: false,
        }
    }

    pub fn with_read_chunk(mut self, read_chunk: usize) -> Self {
        self.read_chunk = read_chunk.max(1);
        self
    }

    pub fn with_timeouts(mut self, idle: Option<Duration>, connection: Option<Duration>) -> Self {
        self.idle_timeout = idle;
        self.connection_timeout = connection;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn notify(&self, f: impl FnOnce(&dyn IoHandlerCallback)) {
        if let Some(callback) = &self.callback {
            f(callback.as_ref());
        }
    }

    fn finish_connect(&mut self) -> io::Result<()> {
        match self.stream.take_error() {
            Ok(Some(e)) | Err(e) => {
                debug!(conn = %self.id, error = %e, "Connect failed");
                self.terminate_abnormally();
                return Ok(());
            }
            Ok(None) => {}
        }

        match self.stream.peer_addr() {
            Ok(addr) => {
                let now = Instant::now();
                self.peer_addr = Some(addr);
                self.local_addr = self.stream.local_addr().ok();
                self.state = SocketState::Connected;
                self.connected_at = now;
                self.last_received = now;
                debug!(conn = %self.id, peer = %addr, "Connected");
                self.notify(|cb| cb.on_connect());
                self.write_pending()?;
                self.update_interest()
            }
            // Spurious wakeup, still connecting.
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => {
                debug!(conn = %self.id, error = %e, "Connect failed");
                self.terminate_abnormally();
                Ok(())
            }
        }
    }

    /// Write as much of the send queue as the OS accepts.
    fn write_pending(&mut self) -> io::Result<()> {
        let mut written = 0;
        while !self.send_queue.is_empty() {
            let slices: Vec<IoSlice<'_>> = self
                .send_queue
                .segments()
                .take(MAX_IOVECS)
                .map(|segment| IoSlice::new(segment))
                .collect();

            match self.stream.write_vectored(&slices) {
                Ok(0) => {
                    let err = io::Error::new(io::ErrorKind::WriteZero, "socket accepted no data");
                    self.notify(|cb| cb.on_write_exception(&err));
                    return Err(err);
                }
                Ok(n) => {
                    self.send_queue
                        .discard(n)
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                    written += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(conn = %self.id, error = %e, "Write failed");
                    self.notify(|cb| cb.on_write_exception(&e));
                    return Err(e);
                }
            }
        }

        if written > 0 {
            self.bytes_sent += written as u64;
            trace!(conn = %self.id, bytes = written, pending = self.send_queue.len(), "Wrote");
            self.notify(|cb| cb.on_written(written));
        }
        Ok(())
    }

    fn desired_interest(&self) -> Option<Interest> {
        match self.state {
            SocketState::Connecting => Some(Interest::WRITABLE),
            SocketState::Closed => None,
            SocketState::Connected | SocketState::Closing => {
                let read = self.state == SocketState::Connected && !self.read_suspended;
                let write = !self.send_queue.is_empty();
                match (read, write) {
                    (true, true) => Some(Interest::READABLE.add(Interest::WRITABLE)),
                    (true, false) => Some(Interest::READABLE),
                    (false, true) => Some(Interest::WRITABLE),
                    (false, false) => None,
                }
            }
        }
    }

    fn update_interest(&mut self) -> io::Result<()> {
        let desired = self.desired_interest();
        if desired == self.interest {
            return Ok(());
        }
        let Some(registry) = self.registry.clone() else {
            return Ok(());
        };

        match (self.interest, desired) {
            (None, Some(interest)) => registry.register(&mut self.stream, self.token, interest)?,
            (Some(_), Some(interest)) => {
                registry.reregister(&mut self.stream, self.token, interest)?
            }
            (Some(_), None) => registry.deregister(&mut self.stream)?,
            (None, None) => {}
        }
        self.interest = desired;
        Ok(())
    }

    fn shutdown_socket(&mut self) {
        if self.interest.take().is_some() {
            if let Some(registry) = &self.registry {
                let _ = registry.deregister(&mut self.stream);
            }
        }
        let _ = self.stream.shutdown(Shutdown::Both);
        self.state = SocketState::Closed;
        self.send_queue.clear();
    }

    fn finish_close(&mut self) {
        self.shutdown_socket();
        debug!(
            conn = %self.id,
            received = self.bytes_received,
            sent = self.bytes_sent,
            "Connection closed"
        );
        self.notify_disconnect();
    }

    fn terminate_abnormally(&mut self) {
        self.notify(|cb| cb.on_connection_abnormal_terminated());
        self.shutdown_socket();
        self.notify_disconnect();
    }

    fn notify_disconnect(&mut self) {
        if !self.disconnect_notified {
            self.disconnect_notified = true;
            self.notify(|cb| cb.on_disconnect());
        }
    }
}

impl IoHandler for SocketIoHandler {
    fn successor(&self) -> Option<&dyn IoHandler> {
        None
    }

    fn successor_mut(&mut self) -> Option<&mut dyn IoHandler> {
        None
    }

    fn attach(&mut self, registry: Arc<Registry>, token: Token) -> io::Result<()> {
        self.registry = Some(registry);
        self.token = token;
        self.update_interest()
    }

    fn init(&mut self, callback: Arc<dyn IoHandlerCallback>) -> io::Result<()> {
        self.callback = Some(callback);
        if self.state == SocketState::Connected {
            let now = Instant::now();
            self.connected_at = now;
            self.last_received = now;
            self.notify(|cb| cb.on_connect());
        }
        Ok(())
    }

    fn write_outgoing(&mut self, data: Segments) -> io::Result<()> {
        match self.state {
            SocketState::Closing | SocketState::Closed => {
                return Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "socket is closed",
                ));
            }
            SocketState::Connecting => {
                self.send_queue.append_all(data);
                return Ok(());
            }
            SocketState::Connected => {}
        }
        self.send_queue.append_all(data);
        self.write_pending()?;
        self.update_interest()
    }

    fn flush_outgoing(&mut self) -> io::Result<()> {
        if self.state != SocketState::Connected {
            return Ok(());
        }
        self.write_pending()?;
        self.update_interest()
    }

    fn drain_incoming(&mut self) -> Segments {
        Segments::new()
    }

    fn close(&mut self, immediate: bool) -> io::Result<()> {
        match self.state {
            SocketState::Closed => Ok(()),
            SocketState::Connecting => {
                self.finish_close();
                Ok(())
            }
            SocketState::Connected | SocketState::Closing => {
                if !immediate {
                    // Best effort; a failure here just means closing now.
                    let _ = self.write_pending();
                }
                if immediate || self.send_queue.is_empty() {
                    self.finish_close();
                    Ok(())
                } else {
                    self.state = SocketState::Closing;
                    self.update_interest()
                }
            }
        }
    }

    fn is_open(&self) -> bool {
        self.state != SocketState::Closed
    }

    fn on_readable(&mut self, memory: &mut dyn MemoryManager) -> io::Result<()> {
        if self.state == SocketState::Connecting {
            return self.finish_connect();
        }
        if self.state != SocketState::Connected || self.read_suspended {
            return Ok(());
        }

        let mut received = Segments::new();
        let mut eof = false;
        let mut failure = None;
        loop {
            let mut buf = memory.acquire(self.read_chunk);
            match self.stream.read(&mut buf[..]) {
                Ok(0) => {
                    memory.recycle(buf);
                    eof = true;
                    break;
                }
                Ok(n) => {
                    self.bytes_received += n as u64;
                    received.push(memory.extract_and_recycle(buf, n));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    memory.recycle(buf);
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    memory.recycle(buf);
                }
                Err(e) => {
                    memory.recycle(buf);
                    failure = Some(e);
                    break;
                }
            }
        }

        if !received.is_empty() {
            self.last_received = Instant::now();
            trace!(
                conn = %self.id,
                bytes = received.iter().map(|s| s.len()).sum::<usize>(),
                "Read"
            );
            self.notify(|cb| cb.on_data_read(received));
        }

        if let Some(e) = failure {
            debug!(conn = %self.id, error = %e, "Connection terminated abnormally");
            self.terminate_abnormally();
        } else if eof {
            debug!(conn = %self.id, "Peer closed connection");
            self.finish_close();
        }
        Ok(())
    }

    fn on_writable(&mut self) -> io::Result<()> {
        match self.state {
            SocketState::Connecting => self.finish_connect(),
            SocketState::Connected => {
                self.write_pending()?;
                self.update_interest()
            }
            SocketState::Closing => {
                self.write_pending()?;
                if self.send_queue.is_empty() {
                    self.finish_close();
                    Ok(())
                } else {
                    self.update_interest()
                }
            }
            SocketState::Closed => Ok(()),
        }
    }

    fn on_timer(&mut self, _now: Instant) -> io::Result<()> {
        Ok(())
    }

    fn check_timeouts(&mut self, now: Instant) -> io::Result<()> {
        if self.state != SocketState::Connected {
            return Ok(());
        }

        if let Some(timeout) = self.connection_timeout {
            if !self.connection_timeout_fired && now.duration_since(self.connected_at) >= timeout {
                self.connection_timeout_fired = true;
                debug!(conn = %self.id, ?timeout, "Connection timeout");
                self.notify(|cb| cb.on_connection_timeout());
            }
        }

        if let Some(timeout) = self.idle_timeout {
            if self.state == SocketState::Connected
                && now.duration_since(self.last_received) >= timeout
            {
                // Re-arm so a handled timeout fires again after another idle period.
                self.last_received = now;
                debug!(conn = %self.id, ?timeout, "Idle timeout");
                self.notify(|cb| cb.on_idle_timeout());
            }
        }
        Ok(())
    }

    fn pending_write_size(&self) -> usize {
        self.send_queue.len()
    }

    fn suspend_read(&mut self) -> io::Result<()> {
        self.read_suspended = true;
        self.update_interest()
    }

    fn resume_read(&mut self) -> io::Result<()> {
        self.read_suspended = false;
        self.update_interest()
    }

    fn is_read_suspended(&self) -> bool {
        self.read_suspended
    }

    fn set_option(&mut self, option: SocketOption) -> io::Result<()> {
        option.apply(&SockRef::from(&self.stream))
    }

    fn option(&self, kind: OptionKind) -> io::Result<SocketOption> {
        SocketOption::read(kind, &SockRef::from(&self.stream))
    }

    fn set_idle_timeout(&mut self, timeout: Option<Duration>) {
        self.idle_timeout = timeout;
        self.last_received = Instant::now();
    }

    fn set_connection_timeout(&mut self, timeout: Option<Duration>) {
        self.connection_timeout = timeout;
        self.connection_timeout_fired = false;
    }

    fn is_secure(&self) -> bool {
        false
    }

    fn reset(&mut self) -> io::Result<()> {
        self.resume_read()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }
}
