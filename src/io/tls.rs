//! TLS record layer in a handler chain.
//!
//! The handler sits above the socket and sees the socket's events through an
//! [`EventQueue`]. Ciphertext goes down, plaintext goes up; `on_connect` is
//! held back until the handshake finishes and is preceded by
//! `on_handshake_finished`. Writes issued before that are buffered.

use std::io;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::io::{EventQueue, IoEvent, IoHandler, IoHandlerCallback};
use crate::runtime::buffer::{MemoryManager, SharedMemoryManager};
use crate::runtime::queue::Segments;
use crate::tls::{TlsEngine, TlsError, TlsOutput, TlsProcessor};

pub(crate) fn deliver(upstream: Option<&dyn IoHandlerCallback>, event: IoEvent) {
    if let Some(callback) = upstream {
        event.deliver(callback);
    }
}

/// One TLS session over a successor chain.
pub(crate) struct TlsSession {
    processor: TlsProcessor,
    /// Plaintext written before the handshake finished.
    pending_plain: Segments,
    /// Deliver `on_connect` once the handshake finishes.
    pub(crate) connect_pending: bool,
    closing: bool,
}

impl TlsSession {
    pub(crate) fn new(engine: Box<dyn TlsEngine>, memory: SharedMemoryManager) -> Self {
        Self {
            processor: TlsProcessor::new(engine, memory),
            pending_plain: Segments::new(),
            connect_pending: false,
            closing: false,
        }
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing || self.processor.is_closed()
    }

    pub(crate) fn pending_size(&self) -> usize {
        self.pending_plain.iter().map(|b| b.len()).sum()
    }

    pub(crate) fn start(
        &mut self,
        successor: &mut dyn IoHandler,
        upstream: Option<&dyn IoHandlerCallback>,
    ) -> io::Result<()> {
        let mut out = TlsOutput::default();
        let result = self.processor.start(&mut out);
        self.apply(result, out, successor, upstream)
    }

    pub(crate) fn decrypt(
        &mut self,
        ciphertext: Segments,
        successor: &mut dyn IoHandler,
        upstream: Option<&dyn IoHandlerCallback>,
    ) -> io::Result<()> {
        if self.processor.is_closed() {
            return Ok(());
        }
        let mut out = TlsOutput::default();
        let result = self.processor.decrypt(ciphertext, &mut out);
        self.apply(result, out, successor, upstream)
    }

    pub(crate) fn write(
        &mut self,
        plaintext: Segments,
        successor: &mut dyn IoHandler,
        upstream: Option<&dyn IoHandlerCallback>,
    ) -> io::Result<()> {
        if self.is_closing() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "TLS session is closing",
            ));
        }
        if !self.processor.is_handshake_finished() {
            self.pending_plain.extend(plaintext);
            return Ok(());
        }
        let mut out = TlsOutput::default();
        let result = self.processor.encrypt(plaintext, &mut out);
        self.apply(result, out, successor, upstream)
    }

    /// Send close_notify (graceful) and close the successor.
    pub(crate) fn close(
        &mut self,
        immediate: bool,
        successor: &mut dyn IoHandler,
    ) -> io::Result<()> {
        if !immediate && !self.closing && self.processor.is_handshake_finished() {
            let mut out = TlsOutput::default();
            if let Err(e) = self.processor.close(&mut out) {
                debug!(error = %e, "close_notify not sent");
            }
            let ciphertext = out.take_ciphertext();
            if !ciphertext.is_empty() && successor.is_open() {
                successor.write_outgoing(ciphertext)?;
            }
        }
        self.closing = true;
        successor.close(immediate)
    }

    fn apply(
        &mut self,
        result: Result<(), TlsError>,
        mut out: TlsOutput,
        successor: &mut dyn IoHandler,
        upstream: Option<&dyn IoHandlerCallback>,
    ) -> io::Result<()> {
        let ciphertext = out.take_ciphertext();
        if let Err(e) = result {
            warn!(error = %e, "TLS failure, closing connection");
            if !ciphertext.is_empty() && successor.is_open() {
                // Best effort: the engine may have produced an alert.
                let _ = successor.write_outgoing(ciphertext);
            }
            self.closing = true;
            return successor.close(true);
        }
        if !ciphertext.is_empty() && successor.is_open() {
            successor.write_outgoing(ciphertext)?;
        }

        if out.handshake_finished {
            deliver(upstream, IoEvent::HandshakeFinished);
            if std::mem::take(&mut self.connect_pending) {
                deliver(upstream, IoEvent::Connect);
            }
            let pending = std::mem::take(&mut self.pending_plain);
            if !pending.is_empty() {
                self.write(pending, successor, upstream)?;
            }
        }

        let plaintext = out.take_plaintext();
        if !plaintext.is_empty() {
            deliver(upstream, IoEvent::DataRead(plaintext));
        }

        if out.closed && !self.closing {
            debug!("TLS session closed by peer");
            self.close(false, successor)?;
        }
        Ok(())
    }
}

/// Eager TLS: the handshake starts as soon as the socket connects.
pub struct TlsIoHandler {
    successor: Box<dyn IoHandler>,
    inbox: Arc<EventQueue>,
    upstream: Option<Arc<dyn IoHandlerCallback>>,
    session: TlsSession,
}

impl TlsIoHandler {
    pub fn new(
        successor: Box<dyn IoHandler>,
        engine: Box<dyn TlsEngine>,
        memory: SharedMemoryManager,
    ) -> Self {
        Self {
            successor,
            inbox: Arc::new(EventQueue::new()),
            upstream: None,
            session: TlsSession::new(engine, memory),
        }
    }

    /// Process everything the successor reported.
    fn pump(&mut self) -> io::Result<()> {
        let mut first_error = None;
        loop {
            let events = self.inbox.take();
            if events.is_empty() {
                break;
            }
            let upstream = self.upstream.as_deref();
            for event in events {
                let step = match event {
                    IoEvent::Connect => {
                        self.session.connect_pending = true;
                        self.session.start(self.successor.as_mut(), upstream)
                    }
                    IoEvent::DataRead(data) => {
                        self.session.decrypt(data, self.successor.as_mut(), upstream)
                    }
                    other => {
                        deliver(upstream, other);
                        Ok(())
                    }
                };
                if let Err(e) = step {
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn relay<T>(
        &mut self,
        op: impl FnOnce(&mut dyn IoHandler) -> io::Result<T>,
    ) -> io::Result<T> {
        let result = op(self.successor.as_mut());
        let pumped = self.pump();
        let value = result?;
        pumped?;
        Ok(value)
    }
}

impl IoHandler for TlsIoHandler {
    fn successor(&self) -> Option<&dyn IoHandler> {
        Some(self.successor.as_ref())
    }

    fn successor_mut(&mut self) -> Option<&mut dyn IoHandler> {
        Some(self.successor.as_mut())
    }

    fn init(&mut self, callback: Arc<dyn IoHandlerCallback>) -> io::Result<()> {
        self.upstream = Some(callback);
        let inbox: Arc<dyn IoHandlerCallback> = self.inbox.clone();
        self.relay(|s| s.init(inbox))
    }

    fn write_outgoing(&mut self, data: Segments) -> io::Result<()> {
        let upstream = self.upstream.as_deref();
        let result = self.session.write(data, self.successor.as_mut(), upstream);
        let pumped = self.pump();
        result?;
        pumped
    }

    fn flush_outgoing(&mut self) -> io::Result<()> {
        self.relay(|s| s.flush_outgoing())
    }

    fn close(&mut self, immediate: bool) -> io::Result<()> {
        let result = self.session.close(immediate, self.successor.as_mut());
        let pumped = self.pump();
        result?;
        pumped
    }

    fn on_readable(&mut self, memory: &mut dyn MemoryManager) -> io::Result<()> {
        self.relay(|s| s.on_readable(memory))
    }

    fn on_writable(&mut self) -> io::Result<()> {
        self.relay(|s| s.on_writable())
    }

    fn on_timer(&mut self, now: Instant) -> io::Result<()> {
        self.relay(|s| s.on_timer(now))
    }

    fn check_timeouts(&mut self, now: Instant) -> io::Result<()> {
        self.relay(|s| s.check_timeouts(now))
    }

    fn pending_write_size(&self) -> usize {
        self.successor.pending_write_size() + self.session.pending_size()
    }

    fn prepare_tls(&mut self) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "TLS is already active",
        ))
    }

    fn activate_tls(&mut self, _buffered: Segments) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "TLS is already active",
        ))
    }

    fn is_secure(&self) -> bool {
        true
    }

    fn reset(&mut self) -> io::Result<()> {
        self.relay(|s| s.reset())
    }
}
