//! TLS engine contract and record processing.
//!
//! The crate does not implement TLS. It drives a [`TlsEngine`], a
//! wrap/unwrap state machine over caller-provided buffers, the way a
//! handshake-capable record layer is usually exposed:
//!
//! - `wrap` turns plaintext into records (or produces handshake records
//!   from nothing),
//! - `unwrap` turns records into plaintext (or consumes handshake records),
//! - the handshake status says what the engine needs next.
//!
//! [`TlsProcessor`] runs the loops around an engine; [`RustlsEngine`] adapts
//! rustls to the contract.

pub mod engine;
pub mod processor;

#[cfg(test)]
pub(crate) mod testing;

pub use engine::{ClientTls, RustlsEngine, ServerTls};
pub use processor::{TlsOutput, TlsProcessor};

use std::io;
use thiserror::Error;

/// Result status of a single wrap or unwrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    /// Not enough input to make progress; supply more.
    BufferUnderflow,
    /// The destination was too small. Bytes reported as produced are
    /// valid; retry with a larger buffer.
    BufferOverflow,
    /// This direction of the engine is closed.
    Closed,
}

/// What the engine needs to advance a handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    NotHandshaking,
    NeedWrap,
    NeedUnwrap,
    /// A delegated task must run before the handshake can continue.
    NeedTask,
    /// Reported once, by the operation that completed the handshake.
    Finished,
}

/// Outcome of one engine operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineResult {
    pub status: Status,
    pub handshake_status: HandshakeStatus,
    pub bytes_consumed: usize,
    pub bytes_produced: usize,
}

/// A delegated, possibly CPU-heavy, handshake step.
pub type DelegatedTask = Box<dyn FnOnce() + Send>;

/// A handshake-capable record engine.
pub trait TlsEngine: Send {
    fn begin_handshake(&mut self) -> Result<(), TlsError>;

    /// Encrypt from `src` into `dst`.
    fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, TlsError>;

    /// Decrypt from `src` into `dst`.
    fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, TlsError>;

    fn handshake_status(&self) -> HandshakeStatus;

    fn delegated_task(&mut self) -> Option<DelegatedTask>;

    /// Largest record the engine produces.
    fn packet_buffer_size(&self) -> usize;

    /// Largest plaintext a single record carries.
    fn application_buffer_size(&self) -> usize;

    /// Queue a close notification; the next wrap emits it.
    fn close_outbound(&mut self);

    fn is_client_mode(&self) -> bool;
}

/// Creates one engine per connection.
pub trait TlsEngineFactory: Send + Sync {
    fn new_engine(&self) -> Result<Box<dyn TlsEngine>, TlsError>;
}

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("TLS protocol error: {0}")]
    Protocol(#[from] rustls::Error),

    #[error("TLS I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("TLS engine closed")]
    Closed,

    #[error("TLS buffer limit of {0} bytes exceeded")]
    BufferLimit(usize),

    #[error("invalid server name: {0}")]
    InvalidServerName(String),

    #[error("PEM error: {0}")]
    Pem(String),
}
