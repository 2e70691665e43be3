//! Deferred TLS: plaintext until the application asks for an upgrade.
//!
//! Typical for STARTTLS-style protocols. Until [`IoHandler::prepare_tls`]
//! the handler is a passthrough. Once prepared it holds everything read and
//! written, so no handshake bytes reach the application as plaintext.
//! Activation creates an engine, starts the handshake and feeds the bytes
//! the application had received but not consumed, followed by the held
//! reads; held writes go out encrypted. Afterwards it behaves like [`TlsIoHandler`](super::TlsIoHandler)
//! except that `on_connect` is not repeated; only `on_handshake_finished`
//! marks the upgrade.

use std::io;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::io::tls::{deliver, TlsSession};
use crate::io::{EventQueue, IoEvent, IoHandler, IoHandlerCallback};
use crate::runtime::buffer::{MemoryManager, SharedMemoryManager};
use crate::runtime::queue::Segments;
use crate::tls::TlsEngineFactory;

pub struct ActivatableTlsIoHandler {
    successor: Box<dyn IoHandler>,
    inbox: Arc<EventQueue>,
    upstream: Option<Arc<dyn IoHandlerCallback>>,
    factory: Arc<dyn TlsEngineFactory>,
    memory: SharedMemoryManager,
    session: Option<TlsSession>,
    preparing: bool,
    held_in: Segments,
    held_out: Segments,
}

impl ActivatableTlsIoHandler {
    pub fn new(
        successor: Box<dyn IoHandler>,
        factory: Arc<dyn TlsEngineFactory>,
        memory: SharedMemoryManager,
    ) -> Self {
        Self {
            successor,
            inbox: Arc::new(EventQueue::new()),
            upstream: None,
            factory,
            memory,
            session: None,
            preparing: false,
            held_in: Segments::new(),
            held_out: Segments::new(),
        }
    }

    fn pump(&mut self) -> io::Result<()> {
        let mut first_error = None;
        loop {
            let events = self.inbox.take();
            if events.is_empty() {
                break;
            }
            let upstream = self.upstream.as_deref();
            for event in events {
                let step = match (&mut self.session, event) {
                    (Some(session), IoEvent::DataRead(data)) => {
                        session.decrypt(data, self.successor.as_mut(), upstream)
                    }
                    (None, IoEvent::DataRead(data)) if self.preparing => {
                        self.held_in.extend(data);
                        Ok(())
                    }
                    (_, other) => {
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

impl IoHandler for ActivatableTlsIoHandler {
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
        let result = match &mut self.session {
            Some(session) => {
                session.write(data, self.successor.as_mut(), self.upstream.as_deref())
            }
            None if self.preparing => {
                self.held_out.extend(data);
                Ok(())
            }
            None => self.successor.write_outgoing(data),
        };
        let pumped = self.pump();
        result?;
        pumped
    }

    fn flush_outgoing(&mut self) -> io::Result<()> {
        self.relay(|s| s.flush_outgoing())
    }

    fn close(&mut self, immediate: bool) -> io::Result<()> {
        let result = match &mut self.session {
            Some(session) => session.close(immediate, self.successor.as_mut()),
            None => self.successor.close(immediate),
        };
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
        self.successor.pending_write_size()
            + self.session.as_ref().map_or(0, TlsSession::pending_size)
            + self.held_out.iter().map(|b| b.len()).sum::<usize>()
    }

    fn prepare_tls(&mut self) -> io::Result<()> {
        if self.session.is_some() || self.preparing {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "TLS is already active",
            ));
        }
        // Plaintext read so far still goes up; the marker follows it.
        self.pump()?;
        self.preparing = true;
        if let Some(upstream) = &self.upstream {
            upstream.on_tls_prepared();
        }
        Ok(())
    }

    fn activate_tls(&mut self, buffered: Segments) -> io::Result<()> {
        if self.session.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "TLS is already active",
            ));
        }
        // Anything already read from the socket belongs to the handshake.
        self.pump()?;
        let mut ciphertext = buffered;
        ciphertext.append(&mut self.held_in);
        ciphertext.extend(self.successor.drain_incoming());

        let engine = self.factory.new_engine().map_err(io::Error::other)?;
        let mut session = TlsSession::new(engine, self.memory.clone());
        debug!(
            buffered = ciphertext.iter().map(|b| b.len()).sum::<usize>(),
            "activating TLS"
        );

        let upstream = self.upstream.as_deref();
        session.start(self.successor.as_mut(), upstream)?;
        if !ciphertext.is_empty() {
            session.decrypt(ciphertext, self.successor.as_mut(), upstream)?;
        }
        self.preparing = false;
        let held = std::mem::take(&mut self.held_out);
        if !held.is_empty() {
            session.write(held, self.successor.as_mut(), upstream)?;
        }
        self.session = Some(session);
        self.pump()
    }

    fn is_secure(&self) -> bool {
        self.session.is_some()
    }

    fn reset(&mut self) -> io::Result<()> {
        self.preparing = false;
        self.held_in.clear();
        self.held_out.clear();
        self.relay(|s| s.reset())
    }
}
