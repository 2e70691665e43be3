//! Flush confirmation shared between a connection and its dispatcher.
//!
//! The application side numbers each flush; the dispatcher confirms a number
//! once the chain reports no pending outbound bytes after handling the
//! matching write. This is the only lock the write path shares with the
//! dispatcher thread.

use parking_lot::{Condvar, Mutex};
use std::io;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct FlushState {
    submitted: u64,
    confirmed: u64,
    failure: Option<(io::ErrorKind, String)>,
    closed: bool,
}

#[derive(Debug, Default)]
pub struct FlushTracker {
    state: Mutex<FlushState>,
    changed: Condvar,
}

impl FlushTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the sequence number for the next flush.
    pub fn submit(&self) -> u64 {
        let mut state = self.state.lock();
        state.submitted += 1;
        state.submitted
    }

    /// Confirm every flush up to and including `seq`.
    pub fn confirm(&self, seq: u64) {
        let mut state = self.state.lock();
        if seq > state.confirmed {
            state.confirmed = seq;
            self.changed.notify_all();
        }
    }

    /// Record a write failure. Pending and later waiters see it.
    pub fn fail(&self, err: &io::Error) {
        let mut state = self.state.lock();
        if state.failure.is_none() {
            state.failure = Some((err.kind(), err.to_string()));
        }
        self.changed.notify_all();
    }

    /// The connection is gone; wake everyone.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.changed.notify_all();
    }

    /// The recorded write failure, if any.
    pub fn failure(&self) -> Option<Error> {
        self.state
            .lock()
            .failure
            .as_ref()
            .map(|(kind, message)| Error::Io(io::Error::new(*kind, message.clone())))
    }

    /// Clear a recorded failure.
    pub fn clear_failure(&self) {
        self.state.lock().failure = None;
    }

    pub fn is_confirmed(&self, seq: u64) -> bool {
        self.state.lock().confirmed >= seq
    }

    /// Block until `seq` is confirmed, a failure is recorded, the connection
    /// closes or `timeout` elapses.
    pub fn wait(&self, seq: u64, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.confirmed >= seq {
                return Ok(());
            }
            if let Some((kind, message)) = &state.failure {
                return Err(Error::Io(io::Error::new(*kind, message.clone())));
            }
            if state.closed {
                return Err(Error::Closed);
            }
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return Err(Error::Timeout(timeout));
            }
        }
    }
}
