//! # evhttp-core
//!
//! The systems half of evhttp: everything that talks to the kernel or
//! coordinates threads, with no knowledge of HTTP.
//!
//! ## Modules
//!
//! - `buffer` - Growable byte buffer with read/write cursors and vectored socket fill
//! - `reactor` - epoll readiness multiplexer with one-shot interest + eventfd waker
//! - `timer` - Indexed min-heap of per-connection idle deadlines
//! - `pool` - Fixed worker pool draining a shared FIFO task queue
//! - `config` - Server configuration (defaults, env overrides, validation)
//! - `env` - Environment variable utilities
//! - `error` - Error types
//!
//! ## Control flow
//!
//! ```text
//!   control thread                         worker threads
//!   ──────────────                         ──────────────
//!   TimerHeap::next_deadline() ─┐
//!                               ▼
//!   Reactor::poll(timeout) ──► event ──► WorkerPool::submit(task) ──► read / process / write
//!        ▲                                                                │
//!        └──────────── Reactor::modify(fd, ONESHOT | IN/OUT) ◄────────────┘
//! ```

pub mod buffer;
pub mod config;
pub mod env;
pub mod error;
pub mod pool;
pub mod reactor;
pub mod timer;

// Re-exports for convenience
pub use buffer::ByteBuffer;
pub use config::{ServerConfig, TrigMode};
pub use env::{env_get, env_get_bool, env_get_opt};
pub use error::{BufferError, ConfigError, PoolError};
pub use pool::WorkerPool;
pub use reactor::{Event, Events, Interest, Reactor, Token, Waker};
pub use timer::TimerHeap;
