//! Listener creation and the accept loop.
//!
//! Accepted sockets are handed to a callback on the acceptor thread, which
//! builds the connection and registers it with a dispatcher.

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::io::SocketOptions;

const LISTENER_TOKEN: Token = Token(0);
const WAKE_TOKEN: Token = Token(1);

/// Pause after an accept error such as descriptor exhaustion.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Create a non-blocking listener with `options` applied before bind.
pub fn bind_listener(
    addr: SocketAddr,
    options: &SocketOptions,
    backlog: i32,
) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(options.reuse_address.unwrap_or(true))?;
    // Accepted sockets inherit buffer sizes from the listener.
    if let Some(size) = options.receive_buffer_size {
        socket.set_recv_buffer_size(size)?;
    }
    if let Some(size) = options.send_buffer_size {
        socket.set_send_buffer_size(size)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    Ok(socket.into())
}

/// Running accept loop.
pub struct Acceptor {
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
    thread: Option<JoinHandle<()>>,
}

impl Acceptor {
    /// Accept on `listener` until shut down, passing every socket to
    /// `on_accept`.
    pub fn spawn<F>(listener: std::net::TcpListener, name: &str, mut on_accept: F) -> io::Result<Self>
    where
        F: FnMut(TcpStream, SocketAddr) + Send + 'static,
    {
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let mut listener = TcpListener::from_std(listener);

        let mut poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let stop = Arc::new(AtomicBool::new(false));

        let stopped = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name(format!("{name}-acceptor"))
            .spawn(move || {
                info!(addr = %local_addr, "Accepting connections");
                if let Err(e) = accept_loop(&mut poll, &listener, &stopped, &mut on_accept) {
                    error!(addr = %local_addr, error = %e, "Acceptor failed");
                }
                debug!(addr = %local_addr, "Acceptor stopped");
            })?;

        Ok(Self {
            local_addr,
            stop,
            waker,
            thread: Some(thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and join the thread. The listener is closed.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.waker.wake();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(addr = %self.local_addr, "Acceptor thread panicked");
            }
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop<F>(
    poll: &mut Poll,
    listener: &TcpListener,
    stop: &AtomicBool,
    on_accept: &mut F,
) -> io::Result<()>
where
    F: FnMut(TcpStream, SocketAddr),
{
    let mut events = Events::with_capacity(16);
    while !stop.load(Ordering::SeqCst) {
        match poll.poll(&mut events, None) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
        if stop.load(Ordering::SeqCst) {
            break;
        }
        if events.iter().any(|event| event.token() == LISTENER_TOKEN) {
            accept_pending(listener, on_accept);
        }
    }
    Ok(())
}

fn accept_pending<F>(listener: &TcpListener, on_accept: &mut F)
where
    F: FnMut(TcpStream, SocketAddr),
{
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!(peer = %peer, "Accepted connection");
                on_accept(stream, peer);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "Accept error");
                thread::sleep(ACCEPT_BACKOFF);
                break;
            }
        }
    }
}

/// Apply per-connection options to an accepted or connecting socket.
pub fn apply_options(stream: &TcpStream, options: &SocketOptions) -> io::Result<()> {
    options.apply(&SockRef::from(stream))
}
