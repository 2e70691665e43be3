//! Worker pool for application callbacks.
//!
//! Jobs arrive over an unbounded crossbeam channel shared by all workers.
//! A [`SerialQueue`] sits in front of the pool per connection: it submits at
//! most one drain job at a time, so a connection's tasks run in submission
//! order and never concurrently, even when consecutive drains land on
//! different worker threads.

use crossbeam_channel::{unbounded, Receiver, SendError, Sender};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

/// A unit of work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Job),
    Stop,
}

struct PoolShared {
    tx: Sender<Message>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

/// Fixed-size pool of worker threads.
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<PoolShared>,
}

impl WorkerPool {
    /// Spawn `size` worker threads named `{name}-{i}`.
    pub fn new(size: usize, name: &str) -> io::Result<Self> {
        let size = size.max(1);
        let (tx, rx) = unbounded();
        let mut threads = Vec::with_capacity(size);

        for id in 0..size {
            let rx: Receiver<Message> = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("{name}-{id}"))
                .spawn(move || worker_loop(rx))?;
            threads.push(handle);
        }

        debug!(workers = size, "Worker pool started");
        Ok(Self {
            shared: Arc::new(PoolShared {
                tx,
                threads: Mutex::new(threads),
                size,
            }),
        })
    }

    pub fn size(&self) -> usize {
        self.shared.size
    }

    /// Run `job` on some worker. After shutdown the job runs inline.
    pub fn execute(&self, job: Job) {
        if let Err(SendError(Message::Run(job))) = self.shared.tx.send(Message::Run(job)) {
            run_job(job);
        }
    }

    /// Stop all workers after the jobs already queued, and join them.
    pub fn shutdown(&self) {
        let threads: Vec<_> = self.shared.threads.lock().drain(..).collect();
        for _ in 0..threads.len() {
            let _ = self.shared.tx.send(Message::Stop);
        }
        let current = thread::current().id();
        for handle in threads {
            // A worker shutting down its own pool cannot join itself.
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}

fn worker_loop(rx: Receiver<Message>) {
    while let Ok(message) = rx.recv() {
        match message {
            Message::Run(job) => run_job(job),
            Message::Stop => break,
        }
    }
}

fn run_job(job: Job) {
    if catch_unwind(AssertUnwindSafe(job)).is_err() {
        error!("Worker task panicked");
    }
}

#[derive(Default)]
struct SerialState {
    tasks: VecDeque<Job>,
    running: bool,
}

/// Per-connection FIFO in front of a [`WorkerPool`].
pub struct SerialQueue {
    pool: WorkerPool,
    state: Arc<Mutex<SerialState>>,
}

impl SerialQueue {
    pub fn new(pool: WorkerPool) -> Self {
        Self {
            pool,
            state: Arc::new(Mutex::new(SerialState::default())),
        }
    }

    /// Queue `task` behind every task submitted before it.
    pub fn submit(&self, task: Job) {
        let mut state = self.state.lock();
        state.tasks.push_back(task);
        if state.running {
            return;
        }
        state.running = true;
        drop(state);

        let state = Arc::clone(&self.state);
        self.pool.execute(Box::new(move || drain(&state)));
    }
}

fn drain(state: &Mutex<SerialState>) {
    loop {
        let task = {
            let mut state = state.lock();
            match state.tasks.pop_front() {
                Some(task) => task,
                None => {
                    state.running = false;
                    return;
                }
            }
        };
        run_job(task);
    }
}
