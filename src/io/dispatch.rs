//! Callback dispatch to worker threads.
//!
//! The outermost handler of every chain. Without a worker pool callbacks run
//! on the dispatcher thread. With one, each connection gets a
//! [`SerialQueue`] so its callbacks keep their order and never overlap.

use std::io;
use std::sync::Arc;

use crate::io::{IoEvent, IoHandler, IoHandlerCallback};
use crate::runtime::queue::Segments;
use crate::runtime::worker::{SerialQueue, WorkerPool};

pub struct DispatchHandler {
    successor: Box<dyn IoHandler>,
    workers: Option<WorkerPool>,
}

impl DispatchHandler {
    pub fn new(successor: Box<dyn IoHandler>, workers: Option<WorkerPool>) -> Self {
        Self { successor, workers }
    }
}

impl IoHandler for DispatchHandler {
    fn successor(&self) -> Option<&dyn IoHandler> {
        Some(self.successor.as_ref())
    }

    fn successor_mut(&mut self) -> Option<&mut dyn IoHandler> {
        Some(self.successor.as_mut())
    }

    fn init(&mut self, callback: Arc<dyn IoHandlerCallback>) -> io::Result<()> {
        let callback: Arc<dyn IoHandlerCallback> = match &self.workers {
            Some(pool) => Arc::new(SerialCallback {
                inner: callback,
                queue: SerialQueue::new(pool.clone()),
            }),
            None => callback,
        };
        self.successor.init(callback)
    }
}

/// Forwards every callback through a [`SerialQueue`].
struct SerialCallback {
    inner: Arc<dyn IoHandlerCallback>,
    queue: SerialQueue,
}

impl SerialCallback {
    fn post(&self, event: IoEvent) {
        let inner = Arc::clone(&self.inner);
        self.queue
            .submit(Box::new(move || event.deliver(inner.as_ref())));
    }
}

impl IoHandlerCallback for SerialCallback {
    fn on_connect(&self) {
        self.post(IoEvent::Connect);
    }

    fn on_data_read(&self, data: Segments) {
        self.post(IoEvent::DataRead(data));
    }

    fn on_written(&self, bytes: usize) {
        self.post(IoEvent::Written(bytes));
    }

    fn on_write_exception(&self, err: &io::Error) {
        self.post(IoEvent::WriteException(io::Error::new(
            err.kind(),
            err.to_string(),
        )));
    }

    fn on_disconnect(&self) {
        self.post(IoEvent::Disconnect);
    }

    fn on_connection_abnormal_terminated(&self) {
        self.post(IoEvent::AbnormalTermination);
    }

    fn on_idle_timeout(&self) {
        self.post(IoEvent::IdleTimeout);
    }

    fn on_connection_timeout(&self) {
        self.post(IoEvent::ConnectionTimeout);
    }

    fn on_handshake_finished(&self) {
        self.post(IoEvent::HandshakeFinished);
    }

    fn on_tls_prepared(&self) {
        self.post(IoEvent::TlsPrepared);
    }
}
