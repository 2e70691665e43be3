//! Application handlers.
//!
//! Every method returns `Ok(true)` when it handled the event. For
//! [`Handler::on_data`], `Err(Error::Underflow)` means "wait for more data"
//! and any other error closes the connection. An idle or connection timeout
//! that no handler handles closes the connection too.

use std::io;
use std::sync::Arc;

use crate::connection::NonBlockingConnection;
use crate::error::Result;

pub trait Handler: Send + Sync {
    fn on_connect(&self, _conn: &NonBlockingConnection) -> Result<bool> {
        Ok(false)
    }

    /// Data is available. Called again as long as the handler consumes some.
    fn on_data(&self, _conn: &NonBlockingConnection) -> Result<bool> {
        Ok(false)
    }

    fn on_disconnect(&self, _conn: &NonBlockingConnection) -> Result<bool> {
        Ok(false)
    }

    fn on_idle_timeout(&self, _conn: &NonBlockingConnection) -> Result<bool> {
        Ok(false)
    }

    fn on_connection_timeout(&self, _conn: &NonBlockingConnection) -> Result<bool> {
        Ok(false)
    }

    /// Writing to the peer failed. The connection closes afterwards and the
    /// next write or flush returns the same error.
    fn on_write_exception(&self, _conn: &NonBlockingConnection, _err: &io::Error) -> Result<bool> {
        Ok(false)
    }
}

/// Ordered handler list. Each event goes to the handlers in order until one
/// handles it; an error stops the walk.
#[derive(Clone, Default)]
pub struct HandlerChain {
    handlers: Vec<Arc<dyn Handler>>,
}

impl HandlerChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, handler: impl Handler + 'static) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    pub fn add(&mut self, handler: Arc<dyn Handler>) {
        self.handlers.push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    fn walk(&self, f: impl Fn(&dyn Handler) -> Result<bool>) -> Result<bool> {
        for handler in &self.handlers {
            if f(handler.as_ref())? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl Handler for HandlerChain {
    fn on_connect(&self, conn: &NonBlockingConnection) -> Result<bool> {
        self.walk(|h| h.on_connect(conn))
    }

    fn on_data(&self, conn: &NonBlockingConnection) -> Result<bool> {
        self.walk(|h| h.on_data(conn))
    }

    fn on_disconnect(&self, conn: &NonBlockingConnection) -> Result<bool> {
        self.walk(|h| h.on_disconnect(conn))
    }

    fn on_idle_timeout(&self, conn: &NonBlockingConnection) -> Result<bool> {
        self.walk(|h| h.on_idle_timeout(conn))
    }

    fn on_connection_timeout(&self, conn: &NonBlockingConnection) -> Result<bool> {
        self.walk(|h| h.on_connection_timeout(conn))
    }

    fn on_write_exception(&self, conn: &NonBlockingConnection, err: &io::Error) -> Result<bool> {
        self.walk(|h| h.on_write_exception(conn, err))
    }
}

/// Source of the handler for each new connection.
pub trait HandlerFactory: Send + Sync {
    fn create(&self) -> Arc<dyn Handler>;
}

/// One handler instance serves every connection. It must keep its own
/// state thread-safe; per-connection state belongs in the attachment.
pub struct Shared(Arc<dyn Handler>);

impl Shared {
    pub fn new(handler: impl Handler + 'static) -> Self {
        Self(Arc::new(handler))
    }
}

impl HandlerFactory for Shared {
    fn create(&self) -> Arc<dyn Handler> {
        Arc::clone(&self.0)
    }
}

/// A fresh handler per connection.
pub struct PerConnection<F>(F);

impl<F, H> PerConnection<F>
where
    F: Fn() -> H + Send + Sync,
    H: Handler + 'static,
{
    pub fn new(make: F) -> Self {
        Self(make)
    }
}

impl<F, H> HandlerFactory for PerConnection<F>
where
    F: Fn() -> H + Send + Sync,
    H: Handler + 'static,
{
    fn create(&self) -> Arc<dyn Handler> {
        Arc::new((self.0)())
    }
}
