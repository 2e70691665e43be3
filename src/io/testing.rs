//! Test doubles for exercising handlers without sockets.

use bytes::Bytes;
use mio::{Registry, Token};
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use crate::io::{IoEvent, IoHandler, IoHandlerCallback};
use crate::runtime::buffer::MemoryManager;
use crate::runtime::queue::Segments;

/// Callback that records every event.
#[derive(Default)]
pub struct RecordingCallback {
    events: Mutex<Vec<IoEvent>>,
}

impl RecordingCallback {
    pub fn events(&self) -> MutexGuard<'_, Vec<IoEvent>> {
        self.events.lock()
    }

    pub fn count(&self, predicate: impl Fn(&IoEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| predicate(e)).count()
    }

    /// All data delivered so far, concatenated.
    pub fn data(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for event in self.events.lock().iter() {
            if let IoEvent::DataRead(segments) = event {
                for segment in segments {
                    out.extend_from_slice(segment);
                }
            }
        }
        out
    }

    fn push(&self, event: IoEvent) {
        self.events.lock().push(event);
    }
}

impl IoHandlerCallback for RecordingCallback {
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

#[derive(Default)]
pub struct MockState {
    pub written: Vec<Bytes>,
    pub incoming: VecDeque<Bytes>,
    pub close_calls: Vec<bool>,
    pub read_suspended: bool,
    pub timer_ticks: usize,
    pub attached: bool,
    pub write_rate: Option<u64>,
    /// Fail every write with this kind, reporting it upward first.
    pub write_error: Option<io::ErrorKind>,
    pub tls_prepared: bool,
    /// Bytes handed over on TLS activation.
    pub tls_input: Option<Vec<u8>>,
}

/// Terminal handler standing in for a socket.
pub struct MockIoHandler {
    state: Arc<Mutex<MockState>>,
    callback: Option<Arc<dyn IoHandlerCallback>>,
    open: bool,
    connect_on_init: bool,
}

/// Test-side view of a [`MockIoHandler`] after it has been boxed into a chain.
#[derive(Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockIoHandler {
    pub fn new() -> (Self, MockHandle) {
        let state = Arc::new(Mutex::new(MockState::default()));
        (
            Self {
                state: Arc::clone(&state),
                callback: None,
                open: true,
                connect_on_init: true,
            },
            MockHandle { state },
        )
    }

    pub fn boxed() -> (Box<dyn IoHandler>, MockHandle) {
        let (handler, handle) = Self::new();
        (Box::new(handler), handle)
    }
}

impl MockHandle {
    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock()
    }

    /// Everything written so far, concatenated.
    pub fn written(&self) -> Vec<u8> {
        self.state
            .lock()
            .written
            .iter()
            .flat_map(|b| b.iter().copied())
            .collect()
    }

    pub fn take_written(&self) -> Vec<Bytes> {
        std::mem::take(&mut self.state.lock().written)
    }

    pub fn push_incoming(&self, data: &[u8]) {
        self.state
            .lock()
            .incoming
            .push_back(Bytes::copy_from_slice(data));
    }

    /// Move everything written on `self` into `peer`'s incoming queue.
    pub fn transfer_to(&self, peer: &MockHandle) -> usize {
        let written = self.take_written();
        let total = written.iter().map(Bytes::len).sum();
        peer.state.lock().incoming.extend(written);
        total
    }
}

impl IoHandler for MockIoHandler {
    fn successor(&self) -> Option<&dyn IoHandler> {
        None
    }

    fn successor_mut(&mut self) -> Option<&mut dyn IoHandler> {
        None
    }

    fn attach(&mut self, _registry: Arc<Registry>, _token: Token) -> io::Result<()> {
        self.state.lock().attached = true;
        Ok(())
    }

    fn init(&mut self, callback: Arc<dyn IoHandlerCallback>) -> io::Result<()> {
        if self.connect_on_init {
            callback.on_connect();
        }
        self.callback = Some(callback);
        Ok(())
    }

    fn write_outgoing(&mut self, data: Segments) -> io::Result<()> {
        if !self.open {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "mock closed"));
        }
        let write_error = self.state.lock().write_error;
        if let Some(kind) = write_error {
            let err = io::Error::new(kind, "mock write failed");
            if let Some(callback) = &self.callback {
                callback.on_write_exception(&err);
            }
            return Err(err);
        }
        self.state
            .lock()
            .written
            .extend(data.into_iter().filter(|b| !b.is_empty()));
        Ok(())
    }

    fn flush_outgoing(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn drain_incoming(&mut self) -> Segments {
        Segments::new()
    }

    fn close(&mut self, immediate: bool) -> io::Result<()> {
        self.state.lock().close_calls.push(immediate);
        if self.open {
            self.open = false;
            if let Some(callback) = &self.callback {
                callback.on_disconnect();
            }
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn on_readable(&mut self, _memory: &mut dyn MemoryManager) -> io::Result<()> {
        let incoming: Segments = self.state.lock().incoming.drain(..).collect();
        if !incoming.is_empty() {
            if let Some(callback) = &self.callback {
                callback.on_data_read(incoming);
            }
        }
        Ok(())
    }

    fn on_writable(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn on_timer(&mut self, _now: Instant) -> io::Result<()> {
        self.state.lock().timer_ticks += 1;
        Ok(())
    }

    fn check_timeouts(&mut self, _now: Instant) -> io::Result<()> {
        Ok(())
    }

    fn suspend_read(&mut self) -> io::Result<()> {
        self.state.lock().read_suspended = true;
        Ok(())
    }

    fn resume_read(&mut self) -> io::Result<()> {
        self.state.lock().read_suspended = false;
        Ok(())
    }

    fn is_read_suspended(&self) -> bool {
        self.state.lock().read_suspended
    }

    fn set_write_rate(&mut self, bytes_per_sec: Option<u64>) -> io::Result<()> {
        self.state.lock().write_rate = bytes_per_sec;
        Ok(())
    }

    fn prepare_tls(&mut self) -> io::Result<()> {
        self.state.lock().tls_prepared = true;
        Ok(())
    }

    fn activate_tls(&mut self, buffered: Segments) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.tls_input.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "TLS is already active",
            ));
        }
        state.tls_input = Some(buffered.iter().flat_map(|b| b.iter().copied()).collect());
        Ok(())
    }

    fn reset(&mut self) -> io::Result<()> {
        Ok(())
    }
}
