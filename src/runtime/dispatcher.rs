//! Single-threaded mio event loop owning a set of handler chains.
//!
//! Each dispatcher thread polls its own [`Poll`]. Readiness is routed to the
//! chain registered under the event's token. Everything else reaches the
//! dispatcher as a [`Command`] over a crossbeam channel followed by a
//! [`Waker`] nudge, so chains are only ever touched from this thread.
//!
//! Per loop iteration:
//! 1. poll with the timer resolution as timeout
//! 2. dispatch readiness (writable before readable)
//! 3. drain the command queue
//! 4. tick every chain's timer (throttled writes)
//! 5. every check interval, run idle and connection timeout checks
//!
//! After each step touching a chain, the chain is settled: a failure closes
//! it immediately, a drained send path confirms pending flushes, and a
//! closed chain is deregistered.

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use mio::{Events, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use std::cell::Cell;
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::io::IoHandler;
use crate::runtime::buffer::{
    BufferArena, DEFAULT_MIN_PREALLOCATED_SIZE, DEFAULT_PREALLOCATION_SIZE,
};
use crate::runtime::queue::Segments;
use crate::runtime::registry::{ConnectionRegistry, Registration, TokenCell};

const WAKE_TOKEN: Token = Token(usize::MAX);

static NEXT_DISPATCHER_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static CURRENT_DISPATCHER: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Id of the dispatcher running on this thread, if any.
pub fn current_dispatcher_id() -> Option<usize> {
    CURRENT_DISPATCHER.with(Cell::get)
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Thread name prefix; threads are named `{name}-{id}`.
    pub name: String,
    pub max_connections: usize,
    pub preallocation_size: usize,
    pub min_preallocated_size: usize,
    /// Poll timeout and throttle timer resolution.
    pub tick: Duration,
    pub timeout_check_interval: Duration,
    pub event_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            name: "dispatcher".to_string(),
            max_connections: 10_000,
            preallocation_size: DEFAULT_PREALLOCATION_SIZE,
            min_preallocated_size: DEFAULT_MIN_PREALLOCATED_SIZE,
            tick: Duration::from_millis(50),
            timeout_check_interval: Duration::from_secs(1),
            event_capacity: 1024,
        }
    }
}

/// Chain operations requested from outside the dispatcher thread.
#[derive(Debug)]
pub enum Control {
    SuspendRead,
    ResumeRead,
    IdleTimeout(Option<Duration>),
    ConnectionTimeout(Option<Duration>),
    WriteRate(Option<u64>),
    /// First half of a TLS upgrade; see [`IoHandler::prepare_tls`].
    PrepareTls,
    ActivateTls(Segments),
    Reset,
}

pub enum Command {
    Register(Registration),
    /// Hand data to the chain; `seq` is the flush it belongs to.
    Write {
        token: TokenCell,
        data: Segments,
        seq: u64,
    },
    Close {
        token: TokenCell,
        immediate: bool,
    },
    Control {
        token: TokenCell,
        op: Control,
    },
    /// Stop accepting registrations and exit once every chain has closed.
    Retire,
    /// Close every chain and exit.
    Shutdown,
}

#[derive(Debug, Default)]
struct DispatcherStats {
    registered: AtomicU64,
    refused: AtomicU64,
    active: AtomicUsize,
    read_events: AtomicU64,
    write_events: AtomicU64,
}

/// Point-in-time dispatcher statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherSnapshot {
    /// Registrations accepted since start.
    pub registered: u64,
    /// Registrations refused at the connection limit.
    pub refused: u64,
    /// Chains currently registered.
    pub active: usize,
    pub read_events: u64,
    pub write_events: u64,
}

/// Cloneable sender side of a dispatcher.
#[derive(Clone)]
pub struct DispatcherHandle {
    id: usize,
    name: Arc<str>,
    tx: Sender<Command>,
    waker: Arc<Waker>,
    stats: Arc<DispatcherStats>,
    thread: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl std::fmt::Debug for DispatcherHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

impl DispatcherHandle {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the caller runs on this dispatcher's thread.
    pub fn is_current(&self) -> bool {
        current_dispatcher_id() == Some(self.id)
    }

    pub fn send(&self, command: Command) -> io::Result<()> {
        self.tx
            .send(command)
            .map_err(|_| io::Error::new(io::ErrorKind::NotConnected, "dispatcher has stopped"))?;
        self.waker.wake()
    }

    pub fn register(&self, registration: Registration) -> io::Result<()> {
        self.send(Command::Register(registration))
    }

    pub fn stats(&self) -> DispatcherSnapshot {
        DispatcherSnapshot {
            registered: self.stats.registered.load(Ordering::Relaxed),
            refused: self.stats.refused.load(Ordering::Relaxed),
            active: self.stats.active.load(Ordering::Relaxed),
            read_events: self.stats.read_events.load(Ordering::Relaxed),
            write_events: self.stats.write_events.load(Ordering::Relaxed),
        }
    }

    /// Let the dispatcher exit once its last chain closes.
    pub fn retire(&self) {
        let _ = self.send(Command::Retire);
    }

    /// Whether the dispatcher thread has exited.
    pub fn is_finished(&self) -> bool {
        self.thread
            .lock()
            .as_ref()
            .map_or(true, |handle| handle.is_finished())
    }

    /// Close every chain, stop the thread and join it.
    pub fn shutdown(&self) {
        let _ = self.send(Command::Shutdown);
        if self.is_current() {
            return;
        }
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                error!(dispatcher = self.id, "Dispatcher thread panicked");
            }
        }
    }
}

pub struct Dispatcher {
    id: usize,
    poll: Poll,
    registry: Arc<Registry>,
    rx: Receiver<Command>,
    connections: ConnectionRegistry,
    memory: BufferArena,
    config: DispatcherConfig,
    stats: Arc<DispatcherStats>,
    retiring: bool,
}

enum Flow {
    Continue,
    Stop,
}

impl Dispatcher {
    /// Start a dispatcher thread.
    pub fn spawn(config: DispatcherConfig) -> io::Result<DispatcherHandle> {
        let id = NEXT_DISPATCHER_ID.fetch_add(1, Ordering::Relaxed);
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let registry = Arc::new(poll.registry().try_clone()?);
        let (tx, rx) = unbounded();
        let stats = Arc::new(DispatcherStats::default());
        let name = format!("{}-{id}", config.name);

        let mut dispatcher = Dispatcher {
            id,
            poll,
            registry,
            rx,
            connections: ConnectionRegistry::new(config.max_connections),
            memory: BufferArena::new(config.preallocation_size, config.min_preallocated_size),
            config,
            stats: Arc::clone(&stats),
            retiring: false,
        };

        let thread = thread::Builder::new().name(name.clone()).spawn(move || {
            CURRENT_DISPATCHER.with(|current| current.set(Some(id)));
            if let Err(e) = dispatcher.run() {
                error!(dispatcher = id, error = %e, "Dispatcher failed");
            }
            dispatcher.close_all();
        })?;

        Ok(DispatcherHandle {
            id,
            name: name.into(),
            tx,
            waker,
            stats,
            thread: Arc::new(Mutex::new(Some(thread))),
        })
    }

    fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(self.config.event_capacity);
        let mut next_timeout_check = Instant::now() + self.config.timeout_check_interval;

        info!(
            dispatcher = self.id,
            max_connections = self.connections.capacity(),
            "Dispatcher started"
        );

        loop {
            match self.poll.poll(&mut events, Some(self.config.tick)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            for event in events.iter() {
                match event.token() {
                    WAKE_TOKEN => {}
                    Token(key) => {
                        let readable =
                            event.is_readable() || event.is_read_closed() || event.is_error();
                        self.handle_event(key, readable, event.is_writable());
                    }
                }
            }

            if let Flow::Stop = self.process_commands() {
                info!(dispatcher = self.id, "Dispatcher stopping");
                return Ok(());
            }

            let now = Instant::now();
            self.tick(now);
            if now >= next_timeout_check {
                self.check_timeouts(now);
                next_timeout_check = now + self.config.timeout_check_interval;
            }

            if self.retiring && self.connections.is_empty() {
                info!(dispatcher = self.id, "Dispatcher retired");
                return Ok(());
            }
        }
    }

    fn handle_event(&mut self, key: usize, readable: bool, writable: bool) {
        let Some(registration) = self.connections.get_mut(key) else {
            return;
        };

        let mut result = Ok(());
        if writable {
            self.stats.write_events.fetch_add(1, Ordering::Relaxed);
            result = registration.chain.on_writable();
        }
        if readable && result.is_ok() {
            self.stats.read_events.fetch_add(1, Ordering::Relaxed);
            result = registration.chain.on_readable(&mut self.memory);
        }
        self.settle(key, result);
    }

    fn process_commands(&mut self) -> Flow {
        loop {
            let command = match self.rx.try_recv() {
                Ok(command) => command,
                Err(TryRecvError::Empty) => return Flow::Continue,
                // Every handle is gone; nobody can reach this dispatcher again.
                Err(TryRecvError::Disconnected) => return Flow::Stop,
            };

            match command {
                Command::Register(registration) => self.register(registration),
                Command::Write { token, data, seq } => {
                    self.with_connection(&token, |registration| {
                        let result = if data.is_empty() {
                            Ok(())
                        } else {
                            registration.chain.write_outgoing(data)
                        };
                        registration.last_flush_seq = registration.last_flush_seq.max(seq);
                        result
                    });
                }
                Command::Close { token, immediate } => {
                    self.with_connection(&token, |registration| {
                        registration.chain.close(immediate)
                    });
                }
                Command::Control { token, op } => {
                    self.with_connection(&token, |registration| {
                        apply_control(registration.chain.as_mut(), op)
                    });
                }
                Command::Retire => {
                    info!(
                        dispatcher = self.id,
                        remaining = self.connections.len(),
                        "Dispatcher retiring"
                    );
                    self.retiring = true;
                }
                Command::Shutdown => return Flow::Stop,
            }
        }
    }

    fn register(&mut self, registration: Registration) {
        let token_cell = Arc::clone(&registration.token);
        let key = match self.connections.insert(registration) {
            Ok(key) => key,
            Err(mut registration) => {
                self.stats.refused.fetch_add(1, Ordering::Relaxed);
                warn!(
                    dispatcher = self.id,
                    max_connections = self.connections.capacity(),
                    "Connection limit reached, refusing registration"
                );
                let _ = registration.chain.close(true);
                registration.flush.close();
                registration.callback.on_disconnect();
                return;
            }
        };

        let token = Token(key);
        let _ = token_cell.set(token);
        self.stats.registered.fetch_add(1, Ordering::Relaxed);
        self.stats.active.fetch_add(1, Ordering::Relaxed);

        let registry = Arc::clone(&self.registry);
        let result = match self.connections.get_mut(key) {
            Some(registration) => {
                let callback = Arc::clone(&registration.callback);
                registration
                    .chain
                    .attach(registry, token)
                    .and_then(|()| registration.chain.init(callback))
            }
            None => Ok(()),
        };
        debug!(dispatcher = self.id, conn = key, "Connection registered");
        self.settle(key, result);
    }

    /// Run `op` on the chain registered under `token`, then settle it.
    fn with_connection(
        &mut self,
        token: &TokenCell,
        op: impl FnOnce(&mut Registration) -> io::Result<()>,
    ) {
        let Some(Token(key)) = token.get().copied() else {
            trace!(dispatcher = self.id, "Command for unregistered connection dropped");
            return;
        };
        let result = match self.connections.get_mut(key) {
            // Slab keys are reused; make sure this is still the same connection.
            Some(registration) if Arc::ptr_eq(&registration.token, token) => op(registration),
            _ => return,
        };
        self.settle(key, result);
    }

    fn settle(&mut self, key: usize, result: io::Result<()>) {
        let Some(registration) = self.connections.get_mut(key) else {
            return;
        };

        if let Err(e) = result {
            if is_fatal(&e) {
                debug!(dispatcher = self.id, conn = key, error = %e, "Handler chain failed, closing");
                registration.flush.fail(&e);
                let _ = registration.chain.close(true);
            } else {
                warn!(dispatcher = self.id, conn = key, error = %e, "Operation rejected by handler chain");
            }
        }

        if registration.last_flush_seq > 0 && registration.chain.pending_write_size() == 0 {
            registration.flush.confirm(registration.last_flush_seq);
        }

        if !registration.chain.is_open() {
            if let Some(registration) = self.connections.remove(key) {
                registration.flush.close();
                self.stats.active.fetch_sub(1, Ordering::Relaxed);
                debug!(dispatcher = self.id, conn = key, "Connection deregistered");
            }
        }
    }

    fn tick(&mut self, now: Instant) {
        for key in self.connections.keys() {
            let result = match self.connections.get_mut(key) {
                Some(registration) => registration.chain.on_timer(now),
                None => continue,
            };
            self.settle(key, result);
        }
    }

    fn check_timeouts(&mut self, now: Instant) {
        for key in self.connections.keys() {
            let result = match self.connections.get_mut(key) {
                Some(registration) => registration.chain.check_timeouts(now),
                None => continue,
            };
            self.settle(key, result);
        }
    }

    fn close_all(&mut self) {
        let remaining = self.connections.drain();
        if !remaining.is_empty() {
            debug!(dispatcher = self.id, count = remaining.len(), "Closing remaining connections");
        }
        for mut registration in remaining {
            let _ = registration.chain.close(true);
            registration.flush.close();
        }
        self.stats.active.store(0, Ordering::Relaxed);
    }
}

fn apply_control(chain: &mut dyn IoHandler, op: Control) -> io::Result<()> {
    match op {
        Control::SuspendRead => chain.suspend_read(),
        Control::ResumeRead => chain.resume_read(),
        Control::IdleTimeout(timeout) => {
            chain.set_idle_timeout(timeout);
            Ok(())
        }
        Control::ConnectionTimeout(timeout) => {
            chain.set_connection_timeout(timeout);
            Ok(())
        }
        Control::WriteRate(rate) => chain.set_write_rate(rate),
        Control::PrepareTls => {
            chain.flush_outgoing()?;
            chain.prepare_tls()
        }
        Control::ActivateTls(buffered) => chain.activate_tls(buffered),
        Control::Reset => chain.reset(),
    }
}

/// Rejected requests leave the connection usable.
fn is_fatal(err: &io::Error) -> bool {
    !matches!(
        err.kind(),
        io::ErrorKind::Unsupported | io::ErrorKind::InvalidInput
    )
}
