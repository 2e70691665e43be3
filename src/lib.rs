//! nbsock: a reactor-based, non-blocking TCP/TLS connection framework.
//!
//! Connections are driven by a pool of mio dispatchers. Each connection's
//! transport is a chain of I/O handlers (socket, optional TLS, optional
//! write throttling, callback dispatch) owned by one dispatcher thread.
//! Applications see a [`NonBlockingConnection`] with framed reads, buffered
//! writes and flush control, and react to events through a [`Handler`].
//!
//! ```no_run
//! use nbsock::{Handler, IoContext, NonBlockingConnection, RuntimeConfig, Server, Shared};
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     fn on_data(&self, conn: &NonBlockingConnection) -> nbsock::Result<bool> {
//!         let line = conn.read_bytes_by_delimiter(b"\n", 1024)?;
//!         conn.write(line)?;
//!         conn.write_str("\n")?;
//!         Ok(true)
//!     }
//! }
//!
//! let context = IoContext::new(RuntimeConfig::default())?;
//! let server = Server::builder(context, Shared::new(Echo)).bind("127.0.0.1:7000".parse()?)?;
//! println!("listening on {}", server.local_addr());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod io;
pub mod protocols;
pub mod runtime;
pub mod server;
pub mod tls;

pub use connection::{
    BlockingConnection, Connector, Encoding, FlushMode, Handler, HandlerChain, HandlerFactory,
    NonBlockingConnection, PerConnection, Shared,
};
pub use context::{ConnectionDefaults, IoContext, RuntimeConfig};
pub use error::{Error, Result};
pub use io::{OptionKind, SocketOption, SocketOptions, TlsActivation};
pub use server::{Server, ServerBuilder};
pub use tls::{ClientTls, ServerTls, TlsError};
