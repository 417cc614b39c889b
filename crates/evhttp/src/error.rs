//! Error types for the HTTP layer and the server loop.

use std::io;

use evhttp_core::{BufferError, ConfigError};
use thiserror::Error;

/// Hard request-parse failures. Each one is answered with a 400.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("malformed request line: {line:?}")]
    BadRequestLine { line: String },

    #[error("request head exceeds {limit} bytes without a line break")]
    HeadTooLarge { limit: usize },

    #[error("request body of {length} bytes exceeds the limit {limit}")]
    BodyTooLarge { length: usize, limit: usize },

    #[error("buffer: {0}")]
    Buffer(#[from] BufferError),
}

/// Failures that stop the server from starting or keep it from running.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("bind port {port}: {source}")]
    Bind { port: u16, source: io::Error },

    #[error("{what}: {source}")]
    Setup { what: &'static str, source: io::Error },

    #[error("reactor poll failed: {0}")]
    Poll(io::Error),
}

impl ServerError {
    pub(crate) fn setup(what: &'static str) -> impl FnOnce(io::Error) -> ServerError {
        move |source| ServerError::Setup { what, source }
    }
}
