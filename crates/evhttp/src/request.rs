//! Incremental HTTP/1.1 request parser.
//!
//! One `CRLF`-terminated line is consumed per step:
//!
//! ```text
//!   RequestLine ──► Headers ──(blank line)──► Body ──► Finished
//!                      │                                  ▲
//!                      └──────(no body expected)──────────┘
//! ```
//!
//! When the inbound buffer holds no complete line the parser returns
//! [`ParseStatus::Incomplete`] and keeps its state, so the next readiness
//! event on the same connection resumes where this one stopped.

use std::collections::HashMap;

use evhttp_core::ByteBuffer;
use tracing::{debug, warn};

use crate::auth::UserVerifier;
use crate::error::ParseError;
use crate::form;

/// Longest request line or header line accepted, and the most bytes buffered
/// while waiting for one.
pub const MAX_LINE: usize = 8 * 1024;

/// Largest `Content-Length` body accepted.
pub const MAX_BODY: usize = 1024 * 1024;

const CRLF: &[u8] = b"\r\n";

/// Paths that are served as `<path>.html`.
const DEFAULT_HTML: [&str; 6] = ["/index", "/register", "/login", "/welcome", "/video", "/picture"];

const REGISTER_FORM: &str = "/register.html";
const LOGIN_FORM: &str = "/login.html";
const WELCOME_PAGE: &str = "/welcome.html";
const ERROR_PAGE: &str = "/error.html";

const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    RequestLine,
    Headers,
    Body,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// A full request has been parsed.
    Complete,
    /// More bytes are needed.
    Incomplete,
}

/// A request being parsed, and the parsed result once `Finished`.
#[derive(Debug)]
pub struct HttpRequest {
    state: ParseState,
    method: String,
    path: String,
    version: String,
    headers: HashMap<String, String>,
    body: String,
    post: HashMap<String, String>,
}

impl Default for HttpRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpRequest {
    pub fn new() -> Self {
        Self {
            state: ParseState::RequestLine,
            method: String::new(),
            path: String::new(),
            version: String::new(),
            headers: HashMap::new(),
            body: String::new(),
            post: HashMap::new(),
        }
    }

    /// Forget the previous request so the next one starts fresh.
    pub fn reset(&mut self) {
        self.state = ParseState::RequestLine;
        self.method.clear();
        self.path.clear();
        self.version.clear();
        self.headers.clear();
        self.body.clear();
        self.post.clear();
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    /// Consume as much of `buf` as forms lines of this request.
    ///
    /// Form posts to the login and register pages are checked with `verifier`
    /// and the path is rewritten to the welcome or error page.
    pub fn parse(
        &mut self,
        buf: &mut ByteBuffer,
        verifier: &dyn UserVerifier,
    ) -> Result<ParseStatus, ParseError> {
        loop {
            match self.state {
                ParseState::Finished => return Ok(ParseStatus::Complete),
                ParseState::Body => {
                    if !self.parse_body(buf, verifier)? {
                        return Ok(ParseStatus::Incomplete);
                    }
                }
                ParseState::RequestLine | ParseState::Headers => {
                    let Some(line) = take_line(buf)? else {
                        return Ok(ParseStatus::Incomplete);
                    };
                    if self.state == ParseState::RequestLine {
                        self.parse_request_line(&line)?;
                        self.normalize_path();
                        self.state = ParseState::Headers;
                    } else {
                        self.parse_header(&line, buf.readable())?;
                    }
                }
            }
        }
    }

    fn parse_request_line(&mut self, line: &str) -> Result<(), ParseError> {
        let mut parts = line.split(' ');
        let parsed = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(method), Some(path), Some(proto), None) => proto
                .strip_prefix("HTTP/")
                .filter(|v| !v.is_empty() && !method.is_empty() && !path.is_empty())
                .map(|version| (method, path, version)),
            _ => None,
        };
        let Some((method, path, version)) = parsed else {
            warn!(line, "malformed request line");
            return Err(ParseError::BadRequestLine { line: line.to_string() });
        };
        self.method = method.to_string();
        self.path = path.to_string();
        self.version = version.to_string();
        Ok(())
    }

    fn normalize_path(&mut self) {
        if let Some(q) = self.path.find('?') {
            self.path.truncate(q);
        }
        if self.path == "/" {
            self.path = "/index.html".to_string();
        } else if DEFAULT_HTML.contains(&self.path.as_str()) {
            self.path.push_str(".html");
        }
    }

    /// A line without a colon ends the header block.
    fn parse_header(&mut self, line: &str, remaining: usize) -> Result<(), ParseError> {
        if let Some((name, value)) = line.split_once(':') {
            let value = value.strip_prefix(' ').unwrap_or(value);
            self.headers.insert(name.to_string(), value.trim_end().to_string());
            return Ok(());
        }

        self.state = match self.content_length() {
            Some(len) if len > MAX_BODY => {
                return Err(ParseError::BodyTooLarge { length: len, limit: MAX_BODY });
            }
            Some(len) if len > 0 => ParseState::Body,
            Some(_) => ParseState::Finished,
            None if self.method == "POST" && remaining > 0 => ParseState::Body,
            None => ParseState::Finished,
        };
        Ok(())
    }

    /// Returns `false` while a declared body is still arriving.
    fn parse_body(
        &mut self,
        buf: &mut ByteBuffer,
        verifier: &dyn UserVerifier,
    ) -> Result<bool, ParseError> {
        let data = buf.peek();
        let (body_len, consumed) = match self.content_length() {
            Some(len) if data.len() < len => return Ok(false),
            Some(len) => (len, len),
            None => match find_crlf(data) {
                Some(pos) => (pos, pos + CRLF.len()),
                None => (data.len(), data.len()),
            },
        };
        self.body = String::from_utf8_lossy(&data[..body_len]).into_owned();
        buf.consume(consumed)?;
        self.parse_post(verifier);
        self.state = ParseState::Finished;
        debug!(method = %self.method, path = %self.path, body_len, "request body");
        Ok(true)
    }

    fn parse_post(&mut self, verifier: &dyn UserVerifier) {
        let is_form = self
            .header("Content-Type")
            .is_some_and(|ct| ct.split(';').next().is_some_and(|t| t.trim().eq_ignore_ascii_case(FORM_URLENCODED)));
        if self.method != "POST" || !is_form {
            return;
        }
        self.post = form::parse_urlencoded(&self.body);

        let is_login = match self.path.as_str() {
            LOGIN_FORM => true,
            REGISTER_FORM => false,
            _ => return,
        };
        let user = self.post("username").unwrap_or_default();
        let password = self.post("password").unwrap_or_default();
        let verified = verifier.verify(user, password, is_login);
        debug!(user, is_login, verified, "form verification");
        self.path = if verified { WELCOME_PAGE } else { ERROR_PAGE }.to_string();
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// Header lookup, ASCII case-insensitive on the name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .or_else(|| {
                self.headers
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(name))
                    .map(|(_, v)| v)
            })
            .map(String::as_str)
    }

    pub fn post(&self, key: &str) -> Option<&str> {
        self.post.get(key).map(String::as_str)
    }

    fn content_length(&self) -> Option<usize> {
        self.header("Content-Length").and_then(|v| v.trim().parse().ok())
    }

    /// `Connection: keep-alive` on an HTTP/1.1 request.
    pub fn is_keep_alive(&self) -> bool {
        self.version == "1.1"
            && self
                .header("Connection")
                .is_some_and(|v| v.trim().eq_ignore_ascii_case("keep-alive"))
    }
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(CRLF.len()).position(|w| w == CRLF)
}

/// Pop one line without its terminator, or `None` if no full line is buffered.
fn take_line(buf: &mut ByteBuffer) -> Result<Option<String>, ParseError> {
    let data = buf.peek();
    match find_crlf(data) {
        Some(pos) if pos > MAX_LINE => Err(ParseError::HeadTooLarge { limit: MAX_LINE }),
        Some(pos) => {
            let line = String::from_utf8_lossy(&data[..pos]).into_owned();
            buf.consume(pos + CRLF.len())?;
            Ok(Some(line))
        }
        None if data.len() > MAX_LINE => Err(ParseError::HeadTooLarge { limit: MAX_LINE }),
        None => Ok(None),
    }
}
