//! Round-robin pool of dispatchers.
//!
//! New connections are assigned to dispatchers in turn. The pool can be
//! resized while running: growing spawns dispatcher threads, shrinking
//! retires the most recently added ones. A retired dispatcher takes no new
//! connections but keeps serving the ones it has until they close; they are
//! not migrated.

use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::info;

use crate::runtime::dispatcher::{Dispatcher, DispatcherConfig, DispatcherHandle, DispatcherSnapshot};

/// Number of CPUs, used when a dispatcher count of 0 is requested.
pub fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[derive(Default)]
struct PoolState {
    active: Vec<DispatcherHandle>,
    /// Retired dispatchers still draining; joined on shutdown.
    retired: Vec<DispatcherHandle>,
}

pub struct DispatcherPool {
    config: DispatcherConfig,
    state: Mutex<PoolState>,
    next: AtomicUsize,
}

impl DispatcherPool {
    /// Start `size` dispatchers, or one per CPU when `size` is 0.
    pub fn new(size: usize, config: DispatcherConfig) -> io::Result<Self> {
        let pool = Self {
            config,
            state: Mutex::new(PoolState::default()),
            next: AtomicUsize::new(0),
        };
        pool.resize(size)?;
        Ok(pool)
    }

    /// Dispatcher for the next new connection.
    pub fn next_dispatcher(&self) -> io::Result<DispatcherHandle> {
        let state = self.state.lock();
        if state.active.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "dispatcher pool is shut down",
            ));
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % state.active.len();
        Ok(state.active[index].clone())
    }

    pub fn size(&self) -> usize {
        self.state.lock().active.len()
    }

    /// Grow or shrink to `size` dispatchers (0 means one per CPU).
    pub fn resize(&self, size: usize) -> io::Result<()> {
        let target = if size == 0 { num_cpus() } else { size };
        let mut state = self.state.lock();
        state.retired.retain(|handle| !handle.is_finished());

        while state.active.len() < target {
            state.active.push(Dispatcher::spawn(self.config.clone())?);
        }
        while state.active.len() > target {
            if let Some(handle) = state.active.pop() {
                handle.retire();
                state.retired.push(handle);
            }
        }
        info!(dispatchers = target, draining = state.retired.len(), "Dispatcher pool resized");
        Ok(())
    }

    /// Statistics per active dispatcher, keyed by dispatcher id.
    pub fn stats(&self) -> Vec<(usize, DispatcherSnapshot)> {
        self.state
            .lock()
            .active
            .iter()
            .map(|handle| (handle.id(), handle.stats()))
            .collect()
    }

    /// Stop every dispatcher, retired ones included.
    pub fn shutdown(&self) {
        let handles: Vec<DispatcherHandle> = {
            let mut state = self.state.lock();
            let mut handles: Vec<_> = state.active.drain(..).collect();
            handles.append(&mut state.retired);
            handles
        };
        for handle in handles {
            handle.shutdown();
        }
    }
}

impl Drop for DispatcherPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
