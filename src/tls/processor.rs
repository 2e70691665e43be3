//! Handshake and record loops around a [`TlsEngine`].
//!
//! ## Unwrap
//!
//! Ciphertext is fed to the engine until it is used up. Plaintext is
//! collected; a partial record (underflow) is stashed and merged with the
//! next input; an overflow with nothing produced doubles the output buffer.
//! Delegated tasks run inline. If the handshake then needs a wrap, one is
//! driven immediately.
//!
//! ## Wrap
//!
//! Plaintext (possibly none, to advance a handshake) is fed until consumed
//! and the engine wants no further wrap.
//!
//! ## Gating
//!
//! Plaintext is never released before the handshake has finished. The
//! finish is reported exactly once, after which held plaintext is released
//! and pending handshake output is flushed.

use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, trace};

use crate::runtime::buffer::{MemoryManager, SharedMemoryManager};
use crate::runtime::queue::Segments;
use crate::tls::{EngineResult, HandshakeStatus, Status, TlsEngine, TlsError};

/// Output buffers never grow beyond this multiple of the engine's size.
const MAX_GROWTH: usize = 16;

/// Loops allowed without the engine consuming or producing anything.
const MAX_IDLE_ROUNDS: usize = 2;

/// Everything one processor call produced.
#[derive(Debug, Default)]
pub struct TlsOutput {
    /// Records to send to the peer.
    pub ciphertext: Segments,
    /// Decrypted application data, only ever after `handshake_finished`.
    pub plaintext: Segments,
    /// The handshake finished during this call.
    pub handshake_finished: bool,
    /// The engine reported `Closed`.
    pub closed: bool,
}

impl TlsOutput {
    pub fn take_ciphertext(&mut self) -> Segments {
        std::mem::take(&mut self.ciphertext)
    }

    pub fn take_plaintext(&mut self) -> Segments {
        std::mem::take(&mut self.plaintext)
    }
}

pub struct TlsProcessor {
    engine: Box<dyn TlsEngine>,
    memory: SharedMemoryManager,
    /// Partial record left over from the last unwrap.
    unprocessed: Option<Bytes>,
    /// Plaintext the engine produced before the handshake finished.
    held_plaintext: Segments,
    handshake_finished: bool,
    closed: bool,
}

impl TlsProcessor {
    pub fn new(engine: Box<dyn TlsEngine>, memory: SharedMemoryManager) -> Self {
        Self {
            engine,
            memory,
            unprocessed: None,
            held_plaintext: Segments::new(),
            handshake_finished: false,
            closed: false,
        }
    }

    /// Begin the handshake. A client emits its first flight.
    pub fn start(&mut self, out: &mut TlsOutput) -> Result<(), TlsError> {
        self.engine.begin_handshake()?;
        if self.engine.is_client_mode() {
            self.wrap(&[], out)?;
        }
        Ok(())
    }

    pub fn is_handshake_finished(&self) -> bool {
        self.handshake_finished
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_client_mode(&self) -> bool {
        self.engine.is_client_mode()
    }

    /// Feed received records.
    pub fn decrypt(&mut self, ciphertext: Segments, out: &mut TlsOutput) -> Result<(), TlsError> {
        for segment in ciphertext {
            if self.closed {
                break;
            }
            self.unwrap(segment, out)?;
        }
        if !self.closed && self.engine.handshake_status() == HandshakeStatus::NeedWrap {
            self.wrap(&[], out)?;
        }
        Ok(())
    }

    /// Encrypt application data.
    pub fn encrypt(&mut self, plaintext: Segments, out: &mut TlsOutput) -> Result<(), TlsError> {
        if self.closed {
            return Err(TlsError::Closed);
        }
        for segment in plaintext {
            self.wrap(&segment, out)?;
        }
        Ok(())
    }

    /// Emit the close notification.
    pub fn close(&mut self, out: &mut TlsOutput) -> Result<(), TlsError> {
        if self.closed {
            return Ok(());
        }
        self.engine.close_outbound();
        self.wrap(&[], out)
    }

    fn unwrap(&mut self, segment: Bytes, out: &mut TlsOutput) -> Result<(), TlsError> {
        let mut input = match self.unprocessed.take() {
            Some(pending) => {
                let mut merged = BytesMut::with_capacity(pending.len() + segment.len());
                merged.extend_from_slice(&pending);
                merged.extend_from_slice(&segment);
                merged.freeze()
            }
            None => segment,
        };
        if input.is_empty() {
            return Ok(());
        }

        let base = self.engine.application_buffer_size().max(1);
        let mut size = base;
        let mut idle_rounds = 0;
        loop {
            let mut dst = self.memory.acquire(size);
            let result = match self.engine.unwrap(&input, &mut dst[..]) {
                Ok(result) => result,
                Err(e) => {
                    self.memory.recycle(dst);
                    self.closed = true;
                    return Err(e);
                }
            };
            input.advance(result.bytes_consumed.min(input.len()));
            let plaintext = self.memory.extract_and_recycle(dst, result.bytes_produced);
            if !plaintext.is_empty() {
                self.release(plaintext, out);
            }
            trace!(?result, remaining = input.len(), "unwrap");

            match result.status {
                Status::Ok => {}
                Status::BufferUnderflow => {
                    self.stash(input);
                    return Ok(());
                }
                Status::BufferOverflow => {
                    if result.bytes_produced == 0 {
                        size = grow(size, base)?;
                    }
                    continue;
                }
                Status::Closed => {
                    debug!("TLS peer closed");
                    self.closed = true;
                    out.closed = true;
                    return Ok(());
                }
            }

            self.after_operation(&result, out)?;

            if input.is_empty() {
                return Ok(());
            }
            if progressed(&result) {
                idle_rounds = 0;
            } else {
                idle_rounds += 1;
                if idle_rounds >= MAX_IDLE_ROUNDS {
                    self.stash(input);
                    return Ok(());
                }
                // The engine may refuse input until its own flight is out.
                if self.engine.handshake_status() == HandshakeStatus::NeedWrap {
                    self.wrap(&[], out)?;
                }
            }
        }
    }

    fn wrap(&mut self, src: &[u8], out: &mut TlsOutput) -> Result<(), TlsError> {
        let base = self.engine.packet_buffer_size().max(1);
        let mut size = base;
        let mut offset = 0;
        let mut idle_rounds = 0;
        loop {
            let mut dst = self.memory.acquire(size);
            let result = match self.engine.wrap(&src[offset..], &mut dst[..]) {
                Ok(result) => result,
                Err(e) => {
                    self.memory.recycle(dst);
                    self.closed = true;
                    return Err(e);
                }
            };
            offset = (offset + result.bytes_consumed).min(src.len());
            let ciphertext = self.memory.extract_and_recycle(dst, result.bytes_produced);
            if !ciphertext.is_empty() {
                out.ciphertext.push(ciphertext);
            }
            trace!(?result, remaining = src.len() - offset, "wrap");

            match result.status {
                Status::Ok | Status::BufferUnderflow => {}
                Status::BufferOverflow => {
                    if result.bytes_produced == 0 {
                        size = grow(size, base)?;
                    }
                    continue;
                }
                Status::Closed => {
                    self.closed = true;
                    out.closed = true;
                    if offset < src.len() {
                        return Err(TlsError::Closed);
                    }
                    return Ok(());
                }
            }

            self.after_operation(&result, out)?;

            let more = offset < src.len()
                || self.engine.handshake_status() == HandshakeStatus::NeedWrap;
            if !more {
                return Ok(());
            }
            if progressed(&result) {
                idle_rounds = 0;
            } else {
                idle_rounds += 1;
                if idle_rounds >= MAX_IDLE_ROUNDS {
                    return Ok(());
                }
            }
        }
    }

    fn after_operation(&mut self, result: &EngineResult, out: &mut TlsOutput) -> Result<(), TlsError> {
        while let Some(task) = self.engine.delegated_task() {
            task();
        }
        if result.handshake_status == HandshakeStatus::Finished {
            self.notify_handshake_finished(out)?;
        }
        Ok(())
    }

    fn notify_handshake_finished(&mut self, out: &mut TlsOutput) -> Result<(), TlsError> {
        if self.handshake_finished {
            return Ok(());
        }
        self.handshake_finished = true;
        out.handshake_finished = true;
        debug!(client = self.engine.is_client_mode(), "TLS handshake finished");

        out.plaintext.append(&mut self.held_plaintext);
        self.wrap(&[], out)
    }

    fn release(&mut self, plaintext: Bytes, out: &mut TlsOutput) {
        if self.handshake_finished {
            out.plaintext.push(plaintext);
        } else {
            self.held_plaintext.push(plaintext);
        }
    }

    fn stash(&mut self, input: Bytes) {
        if !input.is_empty() {
            self.unprocessed = Some(input);
        }
    }
}

fn progressed(result: &EngineResult) -> bool {
    result.bytes_consumed > 0 || result.bytes_produced > 0
}

fn grow(size: usize, base: usize) -> Result<usize, TlsError> {
    let grown = size * 2;
    if grown > base * MAX_GROWTH {
        return Err(TlsError::BufferLimit(grown));
    }
    Ok(grown)
}
