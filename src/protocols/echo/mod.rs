//! Echo service built on [`Handler`](crate::connection::Handler).
//!
//! Used for throughput testing and as a worked example of framing on a
//! non-blocking connection.
//!
//! ## Line mode
//!
//! Every `\n`-terminated line is sent back as is. `QUIT` closes the
//! connection after replying `OK`.
//!
//! ## Length-prefixed mode
//!
//! ```text
//! Request:  <length>\r\n<data of exactly length bytes>
//! Response: <length>\r\n<data of exactly length bytes>
//!
//! Example:
//! Request:  5\r\nhello
//! Response: 5\r\nhello
//! ```
//!
//! The header is read under a read mark; when the payload is still
//! incomplete the mark puts the header back and the handler waits for more
//! data. `QUIT\r\n` closes the connection gracefully.

pub mod handler;

pub use handler::{EchoHandler, EchoMode, MAX_ECHO_SIZE};
