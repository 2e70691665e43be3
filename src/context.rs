//! Shared runtime context.
//!
//! An [`IoContext`] owns the dispatcher pool, the optional callback worker
//! pool and the memory manager used by TLS handlers. Servers and connectors
//! take one explicitly; separate contexts never share threads.

use serde::Deserialize;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::connection::{Encoding, FlushMode};
use crate::io::socket::DEFAULT_READ_CHUNK;
use crate::io::{ChainBuilder, SocketOptions};
use crate::runtime::buffer::{
    BufferArena, SharedMemoryManager, DEFAULT_MIN_PREALLOCATED_SIZE, DEFAULT_PREALLOCATION_SIZE,
};
use crate::runtime::dispatcher::DispatcherConfig;
use crate::runtime::pool::DispatcherPool;
use crate::runtime::worker::WorkerPool;

/// Settings every new connection starts with.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConnectionDefaults {
    pub autoflush: bool,
    pub flush_mode: FlushMode,
    pub encoding: Encoding,
    /// How long a sync flush waits for the dispatcher.
    #[serde(with = "millis")]
    pub flush_timeout: Duration,
    /// How long a blocking read waits for data.
    #[serde(with = "millis")]
    pub read_timeout: Duration,
    #[serde(with = "optional_millis")]
    pub idle_timeout: Option<Duration>,
    #[serde(with = "optional_millis")]
    pub connection_timeout: Option<Duration>,
    pub socket: SocketOptions,
}

impl Default for ConnectionDefaults {
    fn default() -> Self {
        Self {
            autoflush: true,
            flush_mode: FlushMode::Sync,
            encoding: Encoding::Utf8,
            flush_timeout: Duration::from_secs(60),
            read_timeout: Duration::from_secs(60),
            idle_timeout: None,
            connection_timeout: None,
            socket: SocketOptions::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    /// Thread name prefix.
    pub name: String,
    /// Dispatcher threads; 0 means one per CPU.
    pub dispatchers: usize,
    /// Callback worker threads; 0 runs callbacks on the dispatcher thread.
    pub worker_threads: usize,
    /// Connections per dispatcher.
    pub max_connections: usize,
    pub preallocation_size: usize,
    pub min_preallocated_size: usize,
    /// Minimum read buffer per socket read.
    pub read_chunk: usize,
    /// Timer resolution of the dispatchers.
    pub tick: Duration,
    pub timeout_check_interval: Duration,
    pub defaults: ConnectionDefaults,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let dispatcher = DispatcherConfig::default();
        Self {
            name: "nbsock".to_string(),
            dispatchers: 0,
            worker_threads: 0,
            max_connections: dispatcher.max_connections,
            preallocation_size: DEFAULT_PREALLOCATION_SIZE,
            min_preallocated_size: DEFAULT_MIN_PREALLOCATED_SIZE,
            read_chunk: DEFAULT_READ_CHUNK,
            tick: dispatcher.tick,
            timeout_check_interval: dispatcher.timeout_check_interval,
            defaults: ConnectionDefaults::default(),
        }
    }
}

impl RuntimeConfig {
    fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            name: format!("{}-dispatcher", self.name),
            max_connections: self.max_connections,
            preallocation_size: self.preallocation_size,
            min_preallocated_size: self.min_preallocated_size,
            tick: self.tick,
            timeout_check_interval: self.timeout_check_interval,
            ..DispatcherConfig::default()
        }
    }
}

pub struct IoContext {
    pool: DispatcherPool,
    workers: Option<WorkerPool>,
    tls_memory: SharedMemoryManager,
    config: RuntimeConfig,
}

impl IoContext {
    /// Start the dispatcher and worker threads.
    pub fn new(config: RuntimeConfig) -> io::Result<Arc<Self>> {
        let pool = DispatcherPool::new(config.dispatchers, config.dispatcher_config())?;
        let workers = match config.worker_threads {
            0 => None,
            n => Some(WorkerPool::new(n, &format!("{}-worker", config.name))?),
        };
        let tls_memory = SharedMemoryManager::new(BufferArena::new(
            config.preallocation_size,
            config.min_preallocated_size,
        ));
        info!(
            dispatchers = pool.size(),
            workers = workers.as_ref().map_or(0, WorkerPool::size),
            max_connections = config.max_connections,
            "I/O context started"
        );
        Ok(Arc::new(Self {
            pool,
            workers,
            tls_memory,
            config,
        }))
    }

    pub fn pool(&self) -> &DispatcherPool {
        &self.pool
    }

    pub fn workers(&self) -> Option<&WorkerPool> {
        self.workers.as_ref()
    }

    pub fn tls_memory(&self) -> &SharedMemoryManager {
        &self.tls_memory
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn defaults(&self) -> &ConnectionDefaults {
        &self.config.defaults
    }

    /// Chain builder wired to this context's workers and TLS memory.
    pub(crate) fn chain_builder(&self) -> ChainBuilder {
        ChainBuilder::new()
            .workers(self.workers.clone())
            .tls_memory(self.tls_memory.clone())
    }

    /// Close every connection and stop all threads.
    pub fn shutdown(&self) {
        // Dispatchers first: closing connections still posts callbacks.
        self.pool.shutdown();
        if let Some(workers) = &self.workers {
            workers.shutdown();
        }
    }
}

impl Drop for IoContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod optional_millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
