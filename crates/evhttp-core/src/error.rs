//! Error types for evhttp-core

use thiserror::Error;

/// Errors raised by [`ByteBuffer`](crate::ByteBuffer) cursor operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BufferError {
    /// Tried to consume more bytes than are readable.
    #[error("cannot consume {requested} bytes, only {readable} readable")]
    ConsumeOverrun { requested: usize, readable: usize },
}

/// Errors raised by the [`WorkerPool`](crate::WorkerPool).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolError {
    /// The pool has been shut down and accepts no new tasks.
    #[error("worker pool is closed")]
    Closed,
}

/// Invalid configuration values, reported by `ServerConfig::validate`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("port {0} is privileged (use 0 for ephemeral or >= 1024)")]
    PrivilegedPort(u16),

    #[error("thread_num must be at least 1")]
    NoWorkers,

    #[error("max_conns must be at least 1")]
    NoConnections,

    #[error("invalid log level {0:?}")]
    LogLevel(String),
}
