//! Queue state behind a connection: inbound data with the read mark and the
//! cached delimiter scan, outbound data with the write mark.

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::runtime::framer::{extract, extract_delimited, find_delimiter, Scan, ScanIndex};
use crate::runtime::queue::{ByteBufferQueue, Segments};

/// Inbound side.
#[derive(Debug, Default)]
pub(crate) struct ReadState {
    pub queue: ByteBufferQueue,
    /// Segments extracted since the read mark, in order.
    mark: Option<Segments>,
    index: Option<ScanIndex>,
    pub closed: bool,
    /// Bumped on every delivery and on close. Blocking readers wait on it.
    pub version: u64,
}

impl ReadState {
    pub fn deliver(&mut self, data: Segments) {
        self.queue.append_all(data);
        self.version += 1;
    }

    pub fn close(&mut self) {
        self.closed = true;
        self.version += 1;
    }

    pub fn read_by_length(&mut self, len: usize) -> Result<Segments> {
        let segments = extract(&mut self.queue, len)?;
        // The front moved; a cached scan no longer lines up.
        if let Some(index) = &mut self.index {
            index.reset();
        }
        self.record(&segments);
        Ok(segments)
    }

    pub fn read_by_delimiter(&mut self, delimiter: &[u8], max_len: usize) -> Result<Segments> {
        let index = match &mut self.index {
            Some(index) if index.delimiter() == delimiter => index,
            slot => slot.insert(ScanIndex::new(delimiter)),
        };
        match find_delimiter(&self.queue, index, max_len) {
            Scan::Found { payload_len } => {
                let (payload, delimiter) = extract_delimited(&mut self.queue, index, payload_len)?;
                self.record(&payload);
                self.record(&delimiter);
                Ok(payload)
            }
            Scan::NotFound { .. } => Err(Error::Underflow),
            Scan::SizeExceeded { max } => Err(Error::MaxLengthExceeded { max }),
        }
    }

    fn record(&mut self, segments: &[Bytes]) {
        if let Some(mark) = &mut self.mark {
            mark.extend(segments.iter().cloned());
        }
    }

    /// Start recording extracted bytes. Replaces an earlier mark.
    pub fn mark(&mut self) {
        self.mark = Some(Segments::new());
    }

    /// Put everything read since the mark back in front of the queue.
    pub fn reset_to_mark(&mut self) -> Result<()> {
        let recorded = self
            .mark
            .take()
            .ok_or(Error::Unsupported("no read mark set"))?;
        self.queue.add_first(recorded);
        self.index = None;
        Ok(())
    }

    pub fn remove_mark(&mut self) {
        self.mark = None;
    }

    pub fn is_marked(&self) -> bool {
        self.mark.is_some()
    }

    /// Drop queued data, the mark and the cached scan.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.mark = None;
        self.index = None;
    }
}

/// Write mark expressed as absolute stream offsets.
#[derive(Debug, Clone, Copy)]
struct WriteMark {
    position: u64,
    /// Where the next write lands after a reset; `None` appends.
    cursor: Option<u64>,
}

/// Outbound side: data written but not yet flushed.
#[derive(Debug)]
pub(crate) struct WriteState {
    queue: ByteBufferQueue,
    /// Bytes ever appended to the queue.
    appended: u64,
    /// Bytes ever handed to the dispatcher.
    flushed: u64,
    mark: Option<WriteMark>,
    pub autoflush: bool,
}

impl WriteState {
    pub fn new(autoflush: bool) -> Self {
        Self {
            queue: ByteBufferQueue::new(),
            appended: 0,
            flushed: 0,
            mark: None,
            autoflush,
        }
    }

    pub fn write(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        let cursor = self.mark.and_then(|mark| mark.cursor);
        match cursor {
            Some(cursor) => self.overwrite(cursor, data),
            None => {
                self.appended += data.len() as u64;
                self.queue.append(data);
            }
        }
    }

    /// Replace bytes starting at stream offset `cursor`, appending whatever
    /// runs past the current end.
    fn overwrite(&mut self, cursor: u64, data: Bytes) {
        let offset = (cursor - self.flushed) as usize;
        let available = self.queue.len() - offset;
        let replaced = data.len().min(available);
        let len = data.len();

        let mut rest = std::mem::take(&mut self.queue);
        // Lengths were checked above, these cannot underflow.
        let prefix = rest.read_segments(offset).unwrap_or_default();
        let _ = rest.discard(replaced);
        self.queue.append_all(prefix);
        self.queue.append(data);
        self.queue.append_all(rest.drain());
        self.appended += (len - replaced) as u64;

        let end = cursor + len as u64;
        if let Some(mark) = &mut self.mark {
            mark.cursor = (end < self.appended).then_some(end);
        }
    }

    /// Take everything that may go out now. Bytes behind an active write
    /// mark stay until the mark is removed.
    pub fn take_flushable(&mut self) -> Segments {
        let limit = match self.mark {
            Some(mark) => (mark.position - self.flushed) as usize,
            None => self.queue.len(),
        };
        let segments = self.queue.read_segments(limit).unwrap_or_default();
        self.flushed += limit as u64;
        segments
    }

    pub fn mark(&mut self) -> Result<()> {
        if self.autoflush {
            return Err(Error::Unsupported("write mark requires autoflush to be off"));
        }
        self.mark = Some(WriteMark {
            position: self.appended,
            cursor: None,
        });
        Ok(())
    }

    /// Later writes overwrite the bytes following the mark.
    pub fn reset_to_mark(&mut self) -> Result<()> {
        let mark = self
            .mark
            .as_mut()
            .ok_or(Error::Unsupported("no write mark set"))?;
        mark.cursor = (mark.position < self.appended).then_some(mark.position);
        Ok(())
    }

    /// Release the marked bytes for flushing.
    pub fn remove_mark(&mut self) {
        self.mark = None;
    }

    pub fn is_marked(&self) -> bool {
        self.mark.is_some()
    }

    /// Bytes written but not yet flushed.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn clear(&mut self) {
        self.flushed = self.appended;
        self.queue.clear();
        self.mark = None;
    }
}
