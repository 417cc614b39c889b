//! # evhttp
//!
//! HTTP/1.1 static file serving on top of `evhttp-core`.
//!
//! ## Modules
//!
//! - `request` - Incremental request parser (request line, headers, form body)
//! - `response` - Status resolution, response head, memory-mapped file body
//! - `conn` - One client: read, process, vectored write, close
//! - `server` - Accept loop, connection table, dispatch to workers, idle eviction
//! - `auth` - Credential verification for the login/register forms
//! - `form` - `application/x-www-form-urlencoded` decoding
//! - `mime` - Extension to content-type table
//! - `error` - Error types
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use evhttp::{MemoryUserStore, ServerConfig, WebServer};
//!
//! let config = ServerConfig::from_env();
//! let mut server = WebServer::new(config, Arc::new(MemoryUserStore::new()))?;
//! server.run()?;
//! # Ok::<(), evhttp::ServerError>(())
//! ```

pub mod auth;
pub mod conn;
pub mod error;
pub mod form;
pub mod mime;
pub mod request;
pub mod response;
pub mod server;
mod slab;

// Re-exports for convenience
pub use auth::{MemoryUserStore, UserVerifier};
pub use conn::{ConnContext, HttpConn};
pub use error::{ParseError, ServerError};
pub use evhttp_core::{ServerConfig, TrigMode};
pub use request::{HttpRequest, ParseState, ParseStatus};
pub use response::{HttpResponse, MappedFile, ResponseBuilder};
pub use server::{ServerHandle, WebServer};
