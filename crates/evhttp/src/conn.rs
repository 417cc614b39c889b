//! Per-client connection state.
//!
//! A connection is only ever driven by one thread at a time: the reactor
//! arms its descriptor one-shot, and the owning task holds the connection's
//! mutex for the whole read/process/write step.

use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use evhttp_core::ByteBuffer;
use tracing::{debug, info, warn};

use crate::auth::UserVerifier;
use crate::request::{HttpRequest, ParseState, ParseStatus};
use crate::response::{HttpResponse, ResponseBuilder, BAD_REQUEST};

/// Keep writing in level-triggered mode while more than this is pending.
pub const WRITE_BACKLOG: usize = 10 * 1024;

/// State shared by every connection of one server.
pub struct ConnContext {
    /// Connection sockets are edge-triggered: drain until would-block.
    pub is_et: bool,
    pub responder: ResponseBuilder,
    pub verifier: Arc<dyn UserVerifier>,
    user_count: AtomicUsize,
}

impl ConnContext {
    pub fn new(is_et: bool, responder: ResponseBuilder, verifier: Arc<dyn UserVerifier>) -> Self {
        Self {
            is_et,
            responder,
            verifier,
            user_count: AtomicUsize::new(0),
        }
    }

    /// Live (accepted and not yet closed) connections.
    pub fn user_count(&self) -> usize {
        self.user_count.load(Ordering::Acquire)
    }
}

pub struct HttpConn {
    stream: Option<TcpStream>,
    fd: RawFd,
    addr: SocketAddr,
    read_buf: ByteBuffer,
    write_buf: ByteBuffer,
    request: HttpRequest,
    response: HttpResponse,
    /// Bytes of the mapped file already written.
    body_offset: usize,
    ctx: Arc<ConnContext>,
}

impl HttpConn {
    pub fn new(stream: TcpStream, addr: SocketAddr, ctx: Arc<ConnContext>) -> Self {
        let fd = stream.as_raw_fd();
        let count = ctx.user_count.fetch_add(1, Ordering::AcqRel) + 1;
        info!(fd, peer = %addr, count, "client in");
        Self {
            stream: Some(stream),
            fd,
            addr,
            read_buf: ByteBuffer::new(),
            write_buf: ByteBuffer::new(),
            request: HttpRequest::new(),
            response: HttpResponse::default(),
            body_offset: 0,
            ctx,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    pub fn is_keep_alive(&self) -> bool {
        self.response.keep_alive()
    }

    pub fn response(&self) -> &HttpResponse {
        &self.response
    }

    /// Header bytes plus the unsent part of the mapped file.
    pub fn to_write_bytes(&self) -> usize {
        self.write_buf.readable() + self.response.file_len().saturating_sub(self.body_offset)
    }

    /// Drain the socket into the inbound buffer.
    ///
    /// `Ok(0)` means the peer closed. `Err(WouldBlock)` means nothing was
    /// available. Edge-triggered connections read until would-block.
    pub fn read(&mut self) -> io::Result<usize> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(io::ErrorKind::NotConnected.into());
        };
        let mut total = 0;
        loop {
            match self.read_buf.fill_from(stream) {
                Ok(0) => return Ok(0),
                Ok(n) => {
                    total += n;
                    if !self.ctx.is_et {
                        return Ok(total);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock && total > 0 => return Ok(total),
                Err(e) => return Err(e),
            }
        }
    }

    /// Parse buffered input and, once a request is complete or malformed,
    /// prepare its response. Returns `true` when a response is ready to write.
    pub fn process(&mut self) -> bool {
        if self.read_buf.is_empty() && self.request.state() == ParseState::RequestLine {
            return false;
        }
        let (keep_alive, hint) =
            match self.request.parse(&mut self.read_buf, self.ctx.verifier.as_ref()) {
                Ok(ParseStatus::Incomplete) => return false,
                Ok(ParseStatus::Complete) => {
                    debug!(fd = self.fd, method = self.request.method(), path = self.request.path(), "request");
                    (self.request.is_keep_alive(), None)
                }
                Err(e) => {
                    warn!(fd = self.fd, peer = %self.addr, error = %e, "bad request");
                    self.read_buf.consume_all();
                    (false, Some(BAD_REQUEST))
                }
            };

        // Drop the previous mapping before building the next response.
        self.response.unmap();
        self.write_buf.consume_all();
        self.body_offset = 0;
        self.response =
            self.ctx.responder.prepare(self.request.path(), keep_alive, hint, &mut self.write_buf);
        self.request.reset();
        true
    }

    /// Vectored write of the response head and mapped body.
    ///
    /// Loops while edge-triggered or while more than [`WRITE_BACKLOG`] bytes
    /// remain. `Err(WouldBlock)` leaves the cursors where the kernel stopped.
    pub fn write(&mut self) -> io::Result<usize> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(io::ErrorKind::NotConnected.into());
        };
        let mut total = 0;
        loop {
            let body = self.response.file().map_or(&[][..], |f| &f[self.body_offset..]);
            let head = self.write_buf.readable();
            if head + body.len() == 0 {
                return Ok(total);
            }
            let n = match self.write_buf.drain_to(stream, body) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            let remaining = head + body.len() - n;
            total += n;
            if n >= head {
                self.write_buf.consume_all();
                self.body_offset += n - head;
            } else {
                self.write_buf.consume(n).map_err(io::Error::other)?;
            }
            if !(self.ctx.is_et || remaining > WRITE_BACKLOG) {
                return Ok(total);
            }
        }
    }

    /// Unmap any file and close the socket. Idempotent.
    pub fn close(&mut self) {
        self.response.unmap();
        if let Some(stream) = self.stream.take() {
            drop(stream);
            let count = self.ctx.user_count.fetch_sub(1, Ordering::AcqRel) - 1;
            info!(fd = self.fd, peer = %self.addr, count, "client quit");
        }
    }
}

impl Drop for HttpConn {
    fn drop(&mut self) {
        self.close();
    }
}
