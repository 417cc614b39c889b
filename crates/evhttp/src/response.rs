//! Response head construction and zero-copy file bodies.
//!
//! [`ResponseBuilder::prepare`] resolves a request path under the static
//! root, picks the status code, writes the status line and headers into the
//! connection's outbound buffer and maps the file read-only. The mapping is
//! handed to the connection as the second I/O vector.

use std::fs::{self, File, Metadata};
use std::num::NonZeroUsize;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::time::Duration;

use evhttp_core::ByteBuffer;
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use tracing::{debug, warn};

use crate::mime;

pub const OK: u16 = 200;
pub const BAD_REQUEST: u16 = 400;
pub const FORBIDDEN: u16 = 403;
pub const NOT_FOUND: u16 = 404;
pub const INTERNAL_ERROR: u16 = 500;

/// Keep-alive responses advertise this many requests per connection.
const KEEP_ALIVE_MAX: u32 = 6;

/// Reason phrase for the supported status codes.
pub fn reason(code: u16) -> Option<&'static str> {
    match code {
        OK => Some("OK"),
        BAD_REQUEST => Some("Bad Request"),
        FORBIDDEN => Some("Forbidden"),
        NOT_FOUND => Some("Not Found"),
        INTERNAL_ERROR => Some("Internal Error"),
        _ => None,
    }
}

/// Static page served in place of the requested file for error codes.
pub fn error_page(code: u16) -> Option<&'static str> {
    match code {
        BAD_REQUEST => Some("/400.html"),
        FORBIDDEN => Some("/403.html"),
        NOT_FOUND => Some("/404.html"),
        INTERNAL_ERROR => Some("/500.html"),
        _ => None,
    }
}

/// Read-only private mapping of a whole file, unmapped on drop.
pub struct MappedFile {
    ptr: NonNull<libc::c_void>,
    len: NonZeroUsize,
}

// The mapping is read-only and owned by exactly one value.
unsafe impl Send for MappedFile {}
unsafe impl Sync for MappedFile {}

impl MappedFile {
    pub fn map(file: &File, len: NonZeroUsize) -> nix::Result<Self> {
        // Safety: `len` is non-zero and no larger than the file; a private
        // read-only mapping never aliases a Rust-owned allocation.
        let ptr = unsafe { mmap(None, len, ProtFlags::PROT_READ, MapFlags::MAP_PRIVATE, file, 0)? };
        Ok(Self { ptr, len })
    }

    pub fn len(&self) -> usize {
        self.len.get()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn as_slice(&self) -> &[u8] {
        // Safety: `ptr` maps `len` readable bytes that live until `drop`, and
        // the mapping is never written through.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr() as *const u8, self.len.get()) }
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        if let Err(e) = unsafe { munmap(self.ptr, self.len.get()) } {
            warn!(error = %e, len = self.len.get(), "munmap failed");
        }
    }
}

impl std::fmt::Debug for MappedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedFile").field("len", &self.len).finish()
    }
}

/// Outcome of [`ResponseBuilder::prepare`], owned by the connection until the
/// next request or close.
#[derive(Debug, Default)]
pub struct HttpResponse {
    code: u16,
    keep_alive: bool,
    path: String,
    file: Option<MappedFile>,
}

impl HttpResponse {
    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Path actually served, after error-page substitution.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Mapped file body, if any.
    pub fn file(&self) -> Option<&[u8]> {
        self.file.as_ref().map(MappedFile::as_slice)
    }

    pub fn file_len(&self) -> usize {
        self.file.as_ref().map_or(0, MappedFile::len)
    }

    pub fn unmap(&mut self) {
        self.file = None;
    }
}

/// Builds responses for files under one static root.
#[derive(Debug, Clone)]
pub struct ResponseBuilder {
    root: PathBuf,
    keep_alive_timeout: Duration,
}

impl ResponseBuilder {
    /// `keep_alive_timeout` is advertised in the `Keep-Alive` header; below
    /// one second it is left out.
    pub fn new(root: impl Into<PathBuf>, keep_alive_timeout: Duration) -> Self {
        Self { root: root.into(), keep_alive_timeout }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `path`, append the response head (and an inline error body if
    /// the file cannot be served) to `out`, and map the file.
    ///
    /// A `status_hint` that is already an error code is kept as-is.
    pub fn prepare(
        &self,
        path: &str,
        keep_alive: bool,
        status_hint: Option<u16>,
        out: &mut ByteBuffer,
    ) -> HttpResponse {
        let mut code = status_hint.unwrap_or(OK);
        if code == OK {
            code = match self.stat(path) {
                None => NOT_FOUND,
                Some(meta) if meta.permissions().mode() & 0o004 == 0 => FORBIDDEN,
                Some(_) => OK,
            };
        }
        if reason(code).is_none() {
            code = BAD_REQUEST;
        }
        let served = error_page(code).unwrap_or(path);

        let mut resp = HttpResponse {
            code,
            keep_alive,
            path: served.to_string(),
            file: None,
        };
        self.add_state_line(&resp, out);
        self.add_headers(&resp, out);
        self.add_content(&mut resp, out);
        debug!(code, path = %resp.path, len = resp.file_len(), keep_alive, "response prepared");
        resp
    }

    /// `None` for missing files, directories and paths that climb out of the root.
    fn stat(&self, path: &str) -> Option<Metadata> {
        if path.split('/').any(|seg| seg == "..") {
            return None;
        }
        fs::metadata(self.resolve(path)).ok().filter(|m| !m.is_dir())
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    fn add_state_line(&self, resp: &HttpResponse, out: &mut ByteBuffer) {
        let status = reason(resp.code).unwrap_or("Bad Request");
        out.append_str(&format!("HTTP/1.1 {} {}\r\n", resp.code, status));
    }

    fn add_headers(&self, resp: &HttpResponse, out: &mut ByteBuffer) {
        if resp.keep_alive {
            out.append_str("Connection: keep-alive\r\n");
            match self.keep_alive_timeout.as_secs() {
                // Idle eviction disabled: no timeout to advertise.
                0 => out.append_str(&format!("Keep-Alive: max={}\r\n", KEEP_ALIVE_MAX)),
                secs => out.append_str(&format!(
                    "Keep-Alive: max={}, timeout={}\r\n",
                    KEEP_ALIVE_MAX, secs
                )),
            }
        } else {
            out.append_str("Connection: close\r\n");
        }
        out.append_str(&format!("Content-type: {}\r\n", mime::content_type(&resp.path)));
    }

    fn add_content(&self, resp: &mut HttpResponse, out: &mut ByteBuffer) {
        let file = match File::open(self.resolve(&resp.path)) {
            Ok(f) => f,
            Err(e) => {
                debug!(path = %resp.path, error = %e, "open failed");
                return error_content(resp.code, "File NotFound!", out);
            }
        };
        let len = match file.metadata() {
            Ok(m) if m.is_file() => m.len() as usize,
            _ => return error_content(resp.code, "File NotFound!", out),
        };
        let Some(len) = NonZeroUsize::new(len) else {
            out.append_str("Content-length: 0\r\n\r\n");
            return;
        };
        match MappedFile::map(&file, len) {
            Ok(mapped) => {
                out.append_str(&format!("Content-length: {}\r\n\r\n", len));
                resp.file = Some(mapped);
            }
            Err(e) => {
                warn!(path = %resp.path, error = %e, "mmap failed");
                error_content(resp.code, "File NotFound!", out);
            }
        }
    }
}

/// Inline HTML body used when the file cannot be mapped.
pub fn error_content(code: u16, message: &str, out: &mut ByteBuffer) {
    let status = reason(code).unwrap_or("Bad Request");
    let body = format!(
        "<html><title>Error</title><body bgcolor=\"ffffff\">{} : {}\n<p>{}</p><hr><em>evhttp</em></body></html>",
        code, status, message
    );
    out.append_str(&format!("Content-length: {}\r\n\r\n", body.len()));
    out.append_str(&body);
}
