//! Ordered queue of immutable byte segments.
//!
//! Used for both the receive and the send path. Segments are `Bytes`, so
//! slicing a segment shares the backing storage instead of copying it. The
//! only copy happens when a single contiguous read straddles two or more
//! segments; that read gets one compacted segment of its own.

use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;
use thiserror::Error;

/// A drained or extracted run of segments, in wire order.
pub type Segments = Vec<Bytes>;

/// Not enough bytes are queued to satisfy a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("buffer underflow: {needed} bytes requested, {available} available")]
pub struct Underflow {
    pub needed: usize,
    pub available: usize,
}

/// Ordered sequence of byte segments.
///
/// The total size always equals the sum of the queued segment lengths.
/// Empty segments are never stored.
#[derive(Debug, Default, Clone)]
pub struct ByteBufferQueue {
    segments: VecDeque<Bytes>,
    size: usize,
}

impl ByteBufferQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one segment at the tail.
    pub fn append(&mut self, segment: Bytes) {
        if segment.is_empty() {
            return;
        }
        self.size += segment.len();
        self.segments.push_back(segment);
    }

    /// Append a list of segments at the tail, keeping their order.
    pub fn append_all<I>(&mut self, segments: I)
    where
        I: IntoIterator<Item = Bytes>,
    {
        for segment in segments {
            self.append(segment);
        }
    }

    /// Re-prepend segments previously removed from the front, undoing a
    /// speculative read.
    pub fn add_first(&mut self, segments: Segments) {
        for segment in segments.into_iter().rev() {
            if segment.is_empty() {
                continue;
            }
            self.size += segment.len();
            self.segments.push_front(segment);
        }
    }

    /// Remove and return every queued segment.
    pub fn drain(&mut self) -> Segments {
        self.size = 0;
        self.segments.drain(..).collect()
    }

    /// Number of queued bytes.
    pub fn peek_size(&self) -> usize {
        self.size
    }

    /// Alias for [`peek_size`](Self::peek_size).
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Number of queued segments.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Iterate the queued segments front to back without removing them.
    pub fn segments(&self) -> impl Iterator<Item = &Bytes> {
        self.segments.iter()
    }

    pub fn clear(&mut self) {
        self.segments.clear();
        self.size = 0;
    }

    /// Remove the first `n` bytes as one contiguous segment.
    ///
    /// Zero-copy when the bytes lie within the front segment; otherwise the
    /// straddling bytes are compacted into a fresh segment.
    pub fn read(&mut self, n: usize) -> Result<Bytes, Underflow> {
        self.check(n)?;
        if n == 0 {
            return Ok(Bytes::new());
        }

        if let Some(front) = self.segments.front_mut() {
            if n < front.len() {
                self.size -= n;
                return Ok(front.split_to(n));
            }
            if n == front.len() {
                self.size -= n;
                return Ok(self.segments.pop_front().unwrap_or_default());
            }
        }

        let mut compacted = BytesMut::with_capacity(n);
        for segment in self.read_segments(n)? {
            compacted.extend_from_slice(&segment);
        }
        Ok(compacted.freeze())
    }

    /// Remove the first `n` bytes as a list of segments, slicing the last
    /// one if it is only partly consumed. Never copies.
    pub fn read_segments(&mut self, n: usize) -> Result<Segments, Underflow> {
        self.check(n)?;

        let mut result = Segments::new();
        let mut remaining = n;
        while remaining > 0 {
            let Some(mut segment) = self.segments.pop_front() else {
                break;
            };
            if segment.len() <= remaining {
                remaining -= segment.len();
                result.push(segment);
            } else {
                result.push(segment.split_to(remaining));
                remaining = 0;
                self.segments.push_front(segment);
            }
        }
        self.size -= n;
        Ok(result)
    }

    /// Drop the first `n` bytes.
    pub fn discard(&mut self, n: usize) -> Result<(), Underflow> {
        self.check(n)?;

        let mut remaining = n;
        while remaining > 0 {
            let Some(front) = self.segments.front_mut() else {
                break;
            };
            if front.len() <= remaining {
                remaining -= front.len();
                self.segments.pop_front();
            } else {
                front.advance(remaining);
                remaining = 0;
            }
        }
        self.size -= n;
        Ok(())
    }

    /// Copy the first `n` bytes without removing them.
    pub fn peek(&self, n: usize) -> Result<Vec<u8>, Underflow> {
        self.check(n)?;

        let mut out = Vec::with_capacity(n);
        for segment in &self.segments {
            let take = (n - out.len()).min(segment.len());
            out.extend_from_slice(&segment[..take]);
            if out.len() == n {
                break;
            }
        }
        Ok(out)
    }

    fn check(&self, n: usize) -> Result<(), Underflow> {
        if n > self.size {
            return Err(Underflow {
                needed: n,
                available: self.size,
            });
        }
        Ok(())
    }
}

/// Concatenate segments into one contiguous buffer.
pub fn concat(segments: &[Bytes]) -> Bytes {
    match segments {
        [] => Bytes::new(),
        [single] => single.clone(),
        _ => {
            let total = segments.iter().map(Bytes::len).sum();
            let mut out = BytesMut::with_capacity(total);
            for segment in segments {
                out.extend_from_slice(segment);
            }
            out.freeze()
        }
    }
}
