//! Echo protocol handler.

use bytes::Bytes;
use serde::Deserialize;
use tracing::{debug, trace};

use crate::connection::{Encoding, Handler, NonBlockingConnection};
use crate::error::{Error, Result};

/// Largest payload accepted in length-prefixed mode.
pub const MAX_ECHO_SIZE: usize = 16 * 1024 * 1024;

/// Longest length header, `\r\n` excluded.
const MAX_HEADER_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EchoMode {
    #[default]
    Line,
    LengthPrefixed,
}

#[derive(Debug, Clone)]
pub struct EchoHandler {
    mode: EchoMode,
    max_line: usize,
}

impl EchoHandler {
    pub fn new(mode: EchoMode) -> Self {
        Self {
            mode,
            max_line: 64 * 1024,
        }
    }

    /// Longest line accepted in line mode. Longer lines close the
    /// connection.
    pub fn with_max_line(mut self, max_line: usize) -> Self {
        self.max_line = max_line;
        self
    }

    fn echo_line(&self, conn: &NonBlockingConnection) -> Result<bool> {
        let line = conn.read_bytes_by_delimiter(b"\n", self.max_line)?;
        if is_quit(&line) {
            return quit(conn);
        }
        trace!(conn = %conn.id(), bytes = line.len(), "Echo line");
        conn.write_segments(vec![line, Bytes::from_static(b"\n")])?;
        Ok(true)
    }

    fn echo_framed(&self, conn: &NonBlockingConnection) -> Result<bool> {
        conn.mark_read_position();
        let header = conn.read_bytes_by_delimiter(b"\r\n", MAX_HEADER_LEN)?;
        if is_quit(&header) {
            conn.remove_read_mark();
            return quit(conn);
        }

        let length = match Encoding::Ascii
            .decode(&header)
            .ok()
            .and_then(|text| text.trim().parse::<usize>().ok())
        {
            Some(length) if length <= MAX_ECHO_SIZE => length,
            Some(_) => return reject(conn, "payload too large"),
            None => return reject(conn, "invalid length"),
        };

        let payload = match conn.read_segments_by_length(length) {
            Ok(payload) => payload,
            Err(Error::Underflow) => {
                conn.reset_to_read_mark()?;
                return Err(Error::Underflow);
            }
            Err(e) => return Err(e),
        };
        conn.remove_read_mark();

        trace!(conn = %conn.id(), bytes = length, "Echo payload");
        let mut response = Vec::with_capacity(payload.len() + 1);
        response.push(Bytes::from(format!("{length}\r\n")));
        response.extend(payload);
        conn.write_segments(response)?;
        Ok(true)
    }
}

impl Default for EchoHandler {
    fn default() -> Self {
        Self::new(EchoMode::default())
    }
}

impl Handler for EchoHandler {
    fn on_connect(&self, conn: &NonBlockingConnection) -> Result<bool> {
        debug!(conn = %conn.id(), peer = ?conn.peer_addr(), mode = ?self.mode, "Echo session started");
        Ok(true)
    }

    fn on_data(&self, conn: &NonBlockingConnection) -> Result<bool> {
        match self.mode {
            EchoMode::Line => self.echo_line(conn),
            EchoMode::LengthPrefixed => self.echo_framed(conn),
        }
    }

    fn on_disconnect(&self, conn: &NonBlockingConnection) -> Result<bool> {
        debug!(
            conn = %conn.id(),
            received = conn.bytes_received(),
            sent = conn.bytes_sent(),
            "Echo session ended"
        );
        Ok(true)
    }
}

fn is_quit(line: &[u8]) -> bool {
    line.trim_ascii().eq_ignore_ascii_case(b"QUIT")
}

fn quit(conn: &NonBlockingConnection) -> Result<bool> {
    conn.write(Bytes::from_static(b"OK\r\n"))?;
    conn.close()?;
    Ok(true)
}

fn reject(conn: &NonBlockingConnection, reason: &str) -> Result<bool> {
    conn.remove_read_mark();
    conn.write(Bytes::from(format!("ERROR {reason}\r\n")))?;
    Ok(true)
}
