//! Outgoing rate limiting.
//!
//! Writes are cut into chunks of at most a tenth of a second's worth of
//! bytes. A chunk is released one transmission time (`len / rate`) after the
//! previous chunk's release, or after its submission if the queue was idle,
//! so a record of `S` bytes reaches the successor no earlier than `S / R`
//! seconds after it was written. Due chunks are released on the
//! dispatcher's timer tick.

use bytes::Bytes;
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

use crate::io::{IoHandler, IoHandlerCallback};
use crate::runtime::queue::Segments;

/// Chunks carry at most this fraction of a second's worth of bytes.
const CHUNKS_PER_SEC: u64 = 10;

pub struct ThrottledWriteHandler {
    successor: Box<dyn IoHandler>,
    /// Bytes per second; `None` is unlimited.
    rate: Option<u64>,
    queue: VecDeque<(Instant, Bytes)>,
    queued_bytes: usize,
    /// Release time of the last scheduled chunk.
    next_slot: Option<Instant>,
}

impl ThrottledWriteHandler {
    pub fn new(successor: Box<dyn IoHandler>) -> Self {
        Self {
            successor,
            rate: None,
            queue: VecDeque::new(),
            queued_bytes: 0,
            next_slot: None,
        }
    }

    pub fn write_rate(&self) -> Option<u64> {
        self.rate
    }

    fn transmission_time(rate: u64, len: usize) -> Duration {
        Duration::from_micros((len as u64).saturating_mul(1_000_000) / rate.max(1))
    }

    fn schedule(&mut self, mut segment: Bytes, rate: u64, now: Instant) {
        let chunk = ((rate / CHUNKS_PER_SEC).max(1)) as usize;
        while !segment.is_empty() {
            let piece = segment.split_to(chunk.min(segment.len()));
            let start = self.next_slot.map_or(now, |slot| slot.max(now));
            let at = start + Self::transmission_time(rate, piece.len());
            self.next_slot = Some(at);
            self.queued_bytes += piece.len();
            self.queue.push_back((at, piece));
        }
    }

    fn write_at(&mut self, data: Segments, now: Instant) -> io::Result<()> {
        match self.rate {
            Some(rate) => {
                for segment in data {
                    self.schedule(segment, rate, now);
                }
                self.release_due(now)
            }
            None if self.queue.is_empty() => self.successor.write_outgoing(data),
            None => {
                self.release_all()?;
                self.successor.write_outgoing(data)
            }
        }
    }

    fn release_due(&mut self, now: Instant) -> io::Result<()> {
        let mut due = Segments::new();
        while let Some((at, _)) = self.queue.front() {
            if *at > now {
                break;
            }
            if let Some((_, chunk)) = self.queue.pop_front() {
                self.queued_bytes -= chunk.len();
                due.push(chunk);
            }
        }
        if due.is_empty() {
            return Ok(());
        }
        trace!(chunks = due.len(), queued = self.queued_bytes, "releasing throttled data");
        self.successor.write_outgoing(due)
    }

    fn release_all(&mut self) -> io::Result<()> {
        let all: Segments = self.queue.drain(..).map(|(_, chunk)| chunk).collect();
        self.queued_bytes = 0;
        self.next_slot = None;
        if all.is_empty() {
            return Ok(());
        }
        self.successor.write_outgoing(all)
    }

    /// Recompute release times of queued chunks under the current rate.
    fn reschedule(&mut self, now: Instant) {
        let Some(rate) = self.rate else {
            return;
        };
        let queued: Vec<Bytes> = self.queue.drain(..).map(|(_, chunk)| chunk).collect();
        self.queued_bytes = 0;
        self.next_slot = None;
        for chunk in queued {
            self.schedule(chunk, rate, now);
        }
    }
}

impl IoHandler for ThrottledWriteHandler {
    fn successor(&self) -> Option<&dyn IoHandler> {
        Some(self.successor.as_ref())
    }

    fn successor_mut(&mut self) -> Option<&mut dyn IoHandler> {
        Some(self.successor.as_mut())
    }

    fn init(&mut self, callback: Arc<dyn IoHandlerCallback>) -> io::Result<()> {
        self.successor.init(callback)
    }

    fn write_outgoing(&mut self, data: Segments) -> io::Result<()> {
        self.write_at(data, Instant::now())
    }

    fn flush_outgoing(&mut self) -> io::Result<()> {
        self.release_all()?;
        self.successor.flush_outgoing()
    }

    fn close(&mut self, immediate: bool) -> io::Result<()> {
        if immediate {
            self.queue.clear();
            self.queued_bytes = 0;
            self.next_slot = None;
        } else if self.successor.is_open() {
            self.release_all()?;
        }
        self.successor.close(immediate)
    }

    fn on_timer(&mut self, now: Instant) -> io::Result<()> {
        self.release_due(now)?;
        self.successor.on_timer(now)
    }

    fn pending_write_size(&self) -> usize {
        self.queued_bytes + self.successor.pending_write_size()
    }

    fn set_write_rate(&mut self, bytes_per_sec: Option<u64>) -> io::Result<()> {
        self.rate = bytes_per_sec.filter(|rate| *rate > 0);
        match self.rate {
            None => self.release_all(),
            Some(_) => {
                let now = Instant::now();
                self.reschedule(now);
                self.release_due(now)
            }
        }
    }

    fn prepare_tls(&mut self) -> io::Result<()> {
        // Queued data was written as plaintext and leaves as plaintext.
        self.release_all()?;
        self.successor.prepare_tls()
    }

    fn activate_tls(&mut self, buffered: Segments) -> io::Result<()> {
        self.release_all()?;
        self.successor.activate_tls(buffered)
    }

    fn reset(&mut self) -> io::Result<()> {
        self.queue.clear();
        self.queued_bytes = 0;
        self.next_slot = None;
        self.successor.reset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::testing::{MockHandle, MockIoHandler};

    fn throttled(rate: Option<u64>) -> (ThrottledWriteHandler, MockHandle) {
        let (mock, handle) = MockIoHandler::boxed();
        let mut handler = ThrottledWriteHandler::new(mock);
        handler.set_write_rate(rate).unwrap();
        (handler, handle)
    }

    fn segment(len: usize) -> Segments {
        vec![Bytes::from(vec![b'a'; len])]
    }

    #[test]
    fn test_unlimited_passes_through() {
        let (mut handler, socket) = throttled(None);
        handler.write_outgoing(segment(5000)).unwrap();
        assert_eq!(socket.written().len(), 5000);
        assert_eq!(handler.pending_write_size(), 0);
    }

    #[test]
    fn test_paces_writes() {
        let (mut handler, socket) = throttled(Some(1000));
        let start = Instant::now();

        handler.write_at(segment(300), start).unwrap();
        assert_eq!(socket.written().len(), 0);
        assert_eq!(handler.pending_write_size(), 300);

        handler.on_timer(start + Duration::from_millis(50)).unwrap();
        assert_eq!(socket.written().len(), 0);

        handler.on_timer(start + Duration::from_millis(100)).unwrap();
        assert_eq!(socket.written().len(), 100);

        handler.on_timer(start + Duration::from_millis(250)).unwrap();
        assert_eq!(socket.written().len(), 200);

        handler.on_timer(start + Duration::from_millis(300)).unwrap();
        assert_eq!(socket.written().len(), 300);
        assert_eq!(handler.pending_write_size(), 0);
    }

    #[test]
    fn test_idle_gap_does_not_bank_credit() {
        let (mut handler, socket) = throttled(Some(1000));
        let start = Instant::now();
        handler.write_at(segment(100), start).unwrap();

        // After a long idle period a burst is still paced from its submission.
        let later = start + Duration::from_secs(10);
        handler.write_at(segment(300), later).unwrap();
        assert_eq!(socket.written().len(), 100);
        assert_eq!(handler.pending_write_size(), 300);

        handler.on_timer(later + Duration::from_millis(299)).unwrap();
        assert_eq!(socket.written().len(), 300);
        handler.on_timer(later + Duration::from_millis(300)).unwrap();
        assert_eq!(socket.written().len(), 400);
    }

    #[test]
    fn test_flush_releases_everything() {
        let (mut handler, socket) = throttled(Some(10));
        handler.write_outgoing(segment(50)).unwrap();
        assert!(handler.pending_write_size() > 0);

        handler.flush_outgoing().unwrap();
        assert_eq!(socket.written().len(), 50);
        assert_eq!(handler.pending_write_size(), 0);
    }

    #[test]
    fn test_graceful_close_flushes_immediate_discards() {
        let (mut handler, socket) = throttled(Some(10));
        handler.write_outgoing(segment(50)).unwrap();
        handler.close(false).unwrap();
        assert_eq!(socket.written().len(), 50);

        let (mut handler, socket) = throttled(Some(10));
        handler.write_outgoing(segment(50)).unwrap();
        let released = socket.written().len();
        handler.close(true).unwrap();
        assert_eq!(socket.written().len(), released);
        assert_eq!(handler.pending_write_size(), 0);
        assert_eq!(socket.state().close_calls, vec![true]);
    }

    #[test]
    fn test_lifting_the_limit_flushes() {
        let (mut handler, socket) = throttled(Some(10));
        handler.write_outgoing(segment(50)).unwrap();
        handler.set_write_rate(None).unwrap();
        assert_eq!(socket.written().len(), 50);
        assert_eq!(handler.write_rate(), None);
    }
}
