//! Blocking facade over a [`NonBlockingConnection`].

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::connection::{Encoding, FlushMode, NonBlockingConnection};
use crate::error::{Error, Result};
use crate::runtime::queue::Segments;

/// Reads wait for data up to the read timeout; flushes always wait for the
/// dispatcher.
#[derive(Debug, Clone)]
pub struct BlockingConnection {
    conn: NonBlockingConnection,
    read_timeout: Duration,
}

impl BlockingConnection {
    /// The connection must have been created without a handler, otherwise
    /// the handler competes for inbound data.
    pub fn new(conn: NonBlockingConnection, read_timeout: Duration) -> Self {
        conn.set_flush_mode(FlushMode::Sync);
        Self { conn, read_timeout }
    }

    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.read_timeout = timeout;
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// The non-blocking connection underneath.
    pub fn inner(&self) -> &NonBlockingConnection {
        &self.conn
    }

    /// Retry `op` whenever new data arrives until it stops underflowing.
    fn wait<T>(&self, mut op: impl FnMut(&NonBlockingConnection) -> Result<T>) -> Result<T> {
        let deadline = Instant::now() + self.read_timeout;
        loop {
            let version = self.conn.read_version();
            match op(&self.conn) {
                Err(Error::Underflow) => {
                    self.conn
                        .wait_for_data(version, deadline, self.read_timeout)?;
                }
                other => return other,
            }
        }
    }

    pub fn read_bytes_by_length(&self, len: usize) -> Result<Bytes> {
        self.wait(|conn| conn.read_bytes_by_length(len))
    }

    pub fn read_segments_by_length(&self, len: usize) -> Result<Segments> {
        self.wait(|conn| conn.read_segments_by_length(len))
    }

    pub fn read_bytes_by_delimiter(&self, delimiter: &[u8], max_len: usize) -> Result<Bytes> {
        self.wait(|conn| conn.read_bytes_by_delimiter(delimiter, max_len))
    }

    pub fn read_segments_by_delimiter(&self, delimiter: &[u8], max_len: usize) -> Result<Segments> {
        self.wait(|conn| conn.read_segments_by_delimiter(delimiter, max_len))
    }

    pub fn read_string_by_length(&self, len: usize) -> Result<String> {
        self.wait(|conn| conn.read_string_by_length(len))
    }

    pub fn read_string_by_delimiter(&self, delimiter: &str, max_len: usize) -> Result<String> {
        self.wait(|conn| conn.read_string_by_delimiter(delimiter, max_len))
    }

    pub fn read_string_by_delimiter_with(
        &self,
        delimiter: &str,
        max_len: usize,
        encoding: Encoding,
    ) -> Result<String> {
        self.wait(|conn| conn.read_string_by_delimiter_with(delimiter, max_len, encoding))
    }

    pub fn read_u8(&self) -> Result<u8> {
        self.wait(NonBlockingConnection::read_u8)
    }

    pub fn read_i32(&self) -> Result<i32> {
        self.wait(NonBlockingConnection::read_i32)
    }

    pub fn read_i64(&self) -> Result<i64> {
        self.wait(NonBlockingConnection::read_i64)
    }

    pub fn read_f64(&self) -> Result<f64> {
        self.wait(NonBlockingConnection::read_f64)
    }

    pub fn write(&self, data: impl Into<Bytes>) -> Result<usize> {
        self.conn.write(data)
    }

    pub fn write_str(&self, text: &str) -> Result<usize> {
        self.conn.write_str(text)
    }

    pub fn write_u8(&self, value: u8) -> Result<usize> {
        self.conn.write_u8(value)
    }

    pub fn write_i32(&self, value: i32) -> Result<usize> {
        self.conn.write_i32(value)
    }

    pub fn write_i64(&self, value: i64) -> Result<usize> {
        self.conn.write_i64(value)
    }

    pub fn write_f64(&self, value: f64) -> Result<usize> {
        self.conn.write_f64(value)
    }

    pub fn flush(&self) -> Result<()> {
        self.conn.flush_with(FlushMode::Sync)
    }

    pub fn set_autoflush(&self, autoflush: bool) {
        self.conn.set_autoflush(autoflush);
    }

    pub fn mark_read_position(&self) {
        self.conn.mark_read_position();
    }

    pub fn reset_to_read_mark(&self) -> Result<()> {
        self.conn.reset_to_read_mark()
    }

    pub fn remove_read_mark(&self) {
        self.conn.remove_read_mark();
    }

    pub fn mark_write_position(&self) -> Result<()> {
        self.conn.mark_write_position()
    }

    pub fn reset_to_write_mark(&self) -> Result<()> {
        self.conn.reset_to_write_mark()
    }

    pub fn remove_write_mark(&self) {
        self.conn.remove_write_mark();
    }

    pub fn attach<T: std::any::Any + Send + Sync>(&self, value: T) {
        self.conn.attach(value);
    }

    pub fn attachment<T: std::any::Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.conn.attachment()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.conn.local_addr()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.conn.peer_addr()
    }

    pub fn is_open(&self) -> bool {
        self.conn.is_open()
    }

    pub fn close(&self) -> Result<()> {
        self.conn.close()
    }
}
