//! Reactor runtime.
//!
//! - `queue`, `framer`: segment queues and delimiter scanning
//! - `buffer`: scratch buffer arenas behind `MemoryManager`
//! - `dispatcher`, `pool`: mio event loops and round-robin assignment
//! - `registry`: per-dispatcher slab of handler chains
//! - `flush`: flush confirmation shared with application threads
//! - `worker`: callback worker pool
//! - `acceptor`: listeners and the accept loop

pub mod acceptor;
pub mod buffer;
pub mod dispatcher;
pub mod flush;
pub mod framer;
pub mod pool;
pub mod queue;
pub mod registry;
pub mod worker;

pub use buffer::{BufferArena, MemoryManager, SharedMemoryManager};
pub use dispatcher::{current_dispatcher_id, DispatcherConfig, DispatcherHandle, DispatcherSnapshot};
pub use pool::DispatcherPool;
pub use queue::{ByteBufferQueue, Segments, Underflow};
pub use worker::WorkerPool;
