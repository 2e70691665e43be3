//! Delimiter and length framing over a [`ByteBufferQueue`].
//!
//! Delimiter search is incremental: a [`ScanIndex`] remembers how many queued
//! bytes were already examined and how long a delimiter prefix is matched at
//! that point. Feeding N fragments therefore costs O(total bytes) overall,
//! not O(N * total).
//!
//! Matching uses the Knuth-Morris-Pratt failure table, so a mismatch after a
//! partial match never rescans confirmed bytes and never loses an
//! overlapping match (for example `"\r\r\n\r"` against `"\r\n\r"`).
//!
//! The index is only valid while the front of the queue is untouched.
//! Appending at the tail is fine; any other read must reset it.

use crate::runtime::queue::{ByteBufferQueue, Segments, Underflow};

/// Cached progress of a delimiter scan.
#[derive(Debug, Clone)]
pub struct ScanIndex {
    delimiter: Vec<u8>,
    /// `failure[i]`: length of the longest proper prefix of
    /// `delimiter[..=i]` that is also its suffix.
    failure: Vec<usize>,
    /// Queue bytes already examined.
    scanned: usize,
    /// Delimiter bytes matched at `scanned`.
    matched: usize,
}

impl ScanIndex {
    pub fn new(delimiter: &[u8]) -> Self {
        Self {
            failure: failure_table(delimiter),
            delimiter: delimiter.to_vec(),
            scanned: 0,
            matched: 0,
        }
    }

    pub fn delimiter(&self) -> &[u8] {
        &self.delimiter
    }

    /// Length of the delimiter prefix matched at the end of the scanned bytes.
    pub fn progress(&self) -> usize {
        self.matched
    }

    /// Queue bytes already examined.
    pub fn scanned(&self) -> usize {
        self.scanned
    }

    /// Forget all progress, keeping the delimiter.
    pub fn reset(&mut self) {
        self.scanned = 0;
        self.matched = 0;
    }
}

fn failure_table(pattern: &[u8]) -> Vec<usize> {
    let mut table = vec![0; pattern.len()];
    let mut k = 0;
    for i in 1..pattern.len() {
        while k > 0 && pattern[i] != pattern[k] {
            k = table[k - 1];
        }
        if pattern[i] == pattern[k] {
            k += 1;
        }
        table[i] = k;
    }
    table
}

/// Outcome of [`find_delimiter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scan {
    /// The delimiter ends `payload_len + delimiter.len()` bytes into the queue.
    Found { payload_len: usize },
    /// Not yet; `progress` delimiter bytes are matched at the queue tail.
    NotFound { progress: usize },
    /// More than `max` payload bytes precede any delimiter. Fatal for the
    /// caller; the queue is left untouched.
    SizeExceeded { max: usize },
}

/// Scan `queue` for the first full match of the index's delimiter, resuming
/// where the previous call on the same index stopped.
///
/// Never modifies the queue.
pub fn find_delimiter(queue: &ByteBufferQueue, index: &mut ScanIndex, max_len: usize) -> Scan {
    let delimiter_len = index.delimiter.len();
    if delimiter_len == 0 {
        return Scan::Found { payload_len: 0 };
    }
    // A violation found earlier stays a violation until the index is reset.
    if index.scanned - index.matched > max_len {
        return Scan::SizeExceeded { max: max_len };
    }

    let mut skip = index.scanned;
    let mut pos = index.scanned;
    for segment in queue.segments() {
        if skip >= segment.len() {
            skip -= segment.len();
            continue;
        }
        for &byte in &segment[skip..] {
            while index.matched > 0 && byte != index.delimiter[index.matched] {
                index.matched = index.failure[index.matched - 1];
            }
            if byte == index.delimiter[index.matched] {
                index.matched += 1;
            }
            pos += 1;

            if index.matched == delimiter_len {
                let payload_len = pos - delimiter_len;
                index.scanned = pos;
                if payload_len > max_len {
                    return Scan::SizeExceeded { max: max_len };
                }
                return Scan::Found { payload_len };
            }
            if pos - index.matched > max_len {
                index.scanned = pos;
                return Scan::SizeExceeded { max: max_len };
            }
        }
        skip = 0;
    }

    index.scanned = pos;
    Scan::NotFound {
        progress: index.matched,
    }
}

/// Remove exactly `len` bytes from the queue.
pub fn extract(queue: &mut ByteBufferQueue, len: usize) -> Result<Segments, Underflow> {
    queue.read_segments(len)
}

/// Remove a payload found by [`find_delimiter`] and drop the delimiter
/// behind it. Resets the index.
///
/// Returns `(payload, delimiter)` so callers that record extracted bytes
/// (read marks) can keep the delimiter too.
pub fn extract_delimited(
    queue: &mut ByteBufferQueue,
    index: &mut ScanIndex,
    payload_len: usize,
) -> Result<(Segments, Segments), Underflow> {
    let payload = queue.read_segments(payload_len)?;
    let delimiter = queue.read_segments(index.delimiter.len())?;
    index.reset();
    Ok((payload, delimiter))
}
