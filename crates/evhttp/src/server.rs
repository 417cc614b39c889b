//! The control plane: one thread blocked in [`Reactor::poll`].
//!
//! The control thread alone accepts sockets, owns the connection table and
//! drives the idle [`TimerHeap`]. Ready connections are handed to the
//! [`WorkerPool`]; the worker re-arms the descriptor (one-shot) when done.
//!
//! Closing is split by who notices first:
//!
//! - A worker that hits EOF, an I/O error or a finished non-keep-alive
//!   response deregisters and closes under the connection lock, then queues
//!   the token on `closed` and wakes the poller. The control thread erases
//!   the table entry and timer.
//! - The control thread (hangup event, idle timeout, shutdown) removes the
//!   entry first and submits a close task, which waits on the connection
//!   lock for any in-flight task to finish.
//!
//! Connections are `Arc`-shared and tokens carry a slot generation, so
//! neither side ever touches a freed or recycled connection.

use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crossbeam_queue::SegQueue;
use evhttp_core::{Event, Events, Interest, Reactor, ServerConfig, TimerHeap, Token, Waker, WorkerPool};
use nix::sys::socket::{setsockopt, sockopt};
use tracing::{debug, error, info, trace, warn};

use crate::auth::UserVerifier;
use crate::conn::{ConnContext, HttpConn};
use crate::error::ServerError;
use crate::response::ResponseBuilder;
use crate::slab::ConnSlab;

const LISTEN_TOKEN: Token = Token(u64::MAX);
const WAKE_TOKEN: Token = Token(u64::MAX - 1);

/// Sent to clients rejected at capacity.
const BUSY_MESSAGE: &[u8] = b"Server busy!";

type SharedConn = Arc<Mutex<HttpConn>>;
type EvictFn = Box<dyn FnOnce() + Send>;

/// Reactor plumbing shared with worker tasks.
struct Dispatch {
    reactor: Reactor,
    waker: Waker,
    /// ONESHOT | RDHUP, plus EDGE for edge-triggered connections.
    conn_event: Interest,
    /// Tokens closed by workers, erased by the control thread.
    closed: SegQueue<Token>,
    /// Tokens whose idle timer fired.
    expired: SegQueue<Token>,
}

impl Dispatch {
    fn rearm(&self, token: Token, conn: &mut HttpConn, interest: Interest) {
        if let Err(e) = self.reactor.modify(conn.fd(), token, interest | self.conn_event) {
            warn!(fd = conn.fd(), error = %e, "re-arm failed");
            self.finish_close(token, conn);
        }
    }

    /// Worker-side close: tear down and tell the control thread.
    fn finish_close(&self, token: Token, conn: &mut HttpConn) {
        close_now(self, conn);
        self.closed.push(token);
        if let Err(e) = self.waker.wake() {
            error!(error = %e, "waker failed");
        }
    }
}

fn close_now(dispatch: &Dispatch, conn: &mut HttpConn) {
    if conn.is_closed() {
        return;
    }
    if let Err(e) = dispatch.reactor.deregister(conn.fd()) {
        debug!(fd = conn.fd(), error = %e, "deregister failed");
    }
    conn.close();
}

fn lock(conn: &SharedConn) -> MutexGuard<'_, HttpConn> {
    conn.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Stops a running [`WebServer`] from any thread.
#[derive(Clone)]
pub struct ServerHandle {
    running: Arc<AtomicBool>,
    dispatch: Arc<Dispatch>,
    ctx: Arc<ConnContext>,
}

impl ServerHandle {
    /// Ask the loop to exit. Returns immediately.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        if let Err(e) = self.dispatch.waker.wake() {
            error!(error = %e, "waker failed");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Live connection count.
    pub fn live_connections(&self) -> usize {
        self.ctx.user_count()
    }
}

pub struct WebServer {
    config: ServerConfig,
    listener: TcpListener,
    listen_event: Interest,
    dispatch: Arc<Dispatch>,
    ctx: Arc<ConnContext>,
    timer: TimerHeap<Token, EvictFn>,
    pool: WorkerPool,
    conns: ConnSlab<SharedConn>,
    running: Arc<AtomicBool>,
    events: Events,
    ready: Vec<Event>,
}

impl WebServer {
    /// Bind the listen socket, create the reactor and start the workers.
    pub fn new(config: ServerConfig, verifier: Arc<dyn UserVerifier>) -> Result<Self, ServerError> {
        config.validate()?;

        let listener = TcpListener::bind(("0.0.0.0", config.port))
            .map_err(|source| ServerError::Bind { port: config.port, source })?;
        if config.opt_linger {
            // Graceful close: linger up to one second for unsent data.
            let linger = libc::linger { l_onoff: 1, l_linger: 1 };
            setsockopt(&listener, sockopt::Linger, &linger)
                .map_err(io::Error::from)
                .map_err(ServerError::setup("set SO_LINGER"))?;
        }
        listener
            .set_nonblocking(true)
            .map_err(ServerError::setup("set listener non-blocking"))?;

        let trig = config.trig_mode;
        let mut listen_event = Interest::PEER_HUP;
        let mut conn_event = Interest::ONESHOT | Interest::PEER_HUP;
        if trig.listen_et {
            listen_event |= Interest::EDGE;
        }
        if trig.conn_et {
            conn_event |= Interest::EDGE;
        }

        let dispatch = Arc::new(Dispatch {
            reactor: Reactor::new().map_err(ServerError::setup("create reactor"))?,
            waker: Waker::new().map_err(ServerError::setup("create waker"))?,
            conn_event,
            closed: SegQueue::new(),
            expired: SegQueue::new(),
        });
        dispatch
            .reactor
            .register(listener.as_raw_fd(), LISTEN_TOKEN, Interest::READABLE | listen_event)
            .map_err(ServerError::setup("register listener"))?;
        dispatch
            .reactor
            .register(dispatch.waker.as_raw_fd(), WAKE_TOKEN, Interest::READABLE)
            .map_err(ServerError::setup("register waker"))?;

        let responder =
            ResponseBuilder::new(&config.src_dir, Duration::from_millis(config.timeout_ms));
        let ctx = Arc::new(ConnContext::new(trig.conn_et, responder, verifier));
        let pool = WorkerPool::new(config.thread_num).map_err(ServerError::setup("start workers"))?;

        let port = listener.local_addr().map(|a| a.port()).unwrap_or(config.port);
        info!("========== Server init ==========");
        info!(port, linger = config.opt_linger, "listen");
        info!(
            listen = if trig.listen_et { "ET" } else { "LT" },
            conn = if trig.conn_et { "ET" } else { "LT" },
            "trigger mode"
        );
        info!(src_dir = %config.src_dir.display(), "static root");
        info!(threads = pool.total_workers(), max_conns = config.max_conns, timeout_ms = config.timeout_ms, "pool");
        if !config.src_dir.is_dir() {
            warn!(src_dir = %config.src_dir.display(), "static root is not a directory");
        }

        Ok(Self {
            config,
            listener,
            listen_event,
            dispatch,
            ctx,
            timer: TimerHeap::new(),
            pool,
            conns: ConnSlab::new(),
            running: Arc::new(AtomicBool::new(true)),
            events: Events::default(),
            ready: Vec::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            running: self.running.clone(),
            dispatch: self.dispatch.clone(),
            ctx: self.ctx.clone(),
        }
    }

    /// Run the event loop until [`ServerHandle::shutdown`].
    pub fn run(&mut self) -> Result<(), ServerError> {
        info!("========== Server start ==========");
        while self.running.load(Ordering::Acquire) {
            let timeout = if self.config.idle_timeout_enabled() {
                self.timer.next_deadline()
            } else {
                None
            };
            self.evict_expired();

            match self.dispatch.reactor.poll(&mut self.events, timeout) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "poll failed");
                    self.shutdown();
                    return Err(ServerError::Poll(e));
                }
            }

            let mut ready = std::mem::take(&mut self.ready);
            ready.clear();
            ready.extend(self.events.iter());
            for event in &ready {
                self.dispatch_event(*event);
            }
            self.ready = ready;

            self.reap_closed();
        }
        self.shutdown();
        Ok(())
    }

    fn dispatch_event(&mut self, event: Event) {
        match event.token {
            LISTEN_TOKEN => self.deal_listen(),
            WAKE_TOKEN => self.dispatch.waker.drain(),
            token => {
                let Some(conn) = self.conns.get(token).cloned() else {
                    trace!(token = token.0, "event for stale token");
                    return;
                };
                if event.is_hangup_or_error() {
                    self.close_conn(token);
                } else if event.is_readable() {
                    self.deal_read(token, conn);
                } else if event.is_writable() {
                    self.deal_write(token, conn);
                } else {
                    error!(token = token.0, readiness = ?event.readiness, "unexpected event");
                }
            }
        }
    }

    fn deal_listen(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    if self.ctx.user_count() >= self.config.max_conns {
                        send_busy(stream, addr);
                    } else {
                        self.add_client(stream, addr);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return;
                }
            }
            if !self.listen_event.is_edge() {
                return;
            }
        }
    }

    fn add_client(&mut self, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = stream.set_nonblocking(true) {
            warn!(peer = %addr, error = %e, "set non-blocking failed");
            return;
        }
        let fd: RawFd = stream.as_raw_fd();
        let conn = Arc::new(Mutex::new(HttpConn::new(stream, addr, self.ctx.clone())));
        let token = self.conns.insert(conn);

        if self.config.idle_timeout_enabled() {
            let dispatch = self.dispatch.clone();
            self.timer.add(
                token,
                Duration::from_millis(self.config.timeout_ms),
                Box::new(move || dispatch.expired.push(token)),
            );
        }
        let interest = Interest::READABLE | self.dispatch.conn_event;
        if let Err(e) = self.dispatch.reactor.register(fd, token, interest) {
            error!(fd, error = %e, "register connection failed");
            self.timer.remove(token);
            // Dropping the last reference closes the socket.
            self.conns.remove(token);
        }
    }

    fn extend_time(&mut self, token: Token) {
        if self.config.idle_timeout_enabled() {
            self.timer.adjust(token, Duration::from_millis(self.config.timeout_ms));
        }
    }

    fn deal_read(&mut self, token: Token, conn: SharedConn) {
        self.extend_time(token);
        let dispatch = self.dispatch.clone();
        if self.pool.submit(move || on_read(&dispatch, token, &conn)).is_err() {
            warn!(token = token.0, "pool closed, dropping read");
        }
    }

    fn deal_write(&mut self, token: Token, conn: SharedConn) {
        self.extend_time(token);
        let dispatch = self.dispatch.clone();
        if self.pool.submit(move || on_write(&dispatch, token, &conn)).is_err() {
            warn!(token = token.0, "pool closed, dropping write");
        }
    }

    /// Control-side close. The socket itself is closed by a pool task once
    /// no other task holds the connection.
    fn close_conn(&mut self, token: Token) {
        let Some(conn) = self.conns.remove(token) else {
            return;
        };
        self.timer.remove(token);
        let dispatch = self.dispatch.clone();
        let task_conn = conn.clone();
        let submitted = self.pool.submit(move || close_now(&dispatch, &mut lock(&task_conn)));
        if submitted.is_err() {
            close_now(&self.dispatch, &mut lock(&conn));
        }
    }

    fn evict_expired(&mut self) {
        while let Some(token) = self.dispatch.expired.pop() {
            if self.conns.get(token).is_some() {
                info!(token = token.0, "idle timeout, closing");
                self.close_conn(token);
            }
        }
    }

    fn reap_closed(&mut self) {
        while let Some(token) = self.dispatch.closed.pop() {
            if self.conns.remove(token).is_some() {
                self.timer.remove(token);
            }
        }
    }

    fn shutdown(&mut self) {
        info!(
            live = self.conns.len(),
            queued = self.pool.queued(),
            workers = self.pool.total_workers(),
            "========== Server stop =========="
        );
        self.running.store(false, Ordering::Release);
        self.pool.shutdown();
        for conn in self.conns.drain() {
            close_now(&self.dispatch, &mut lock(&conn));
        }
        self.timer.clear();
        while self.dispatch.closed.pop().is_some() {}
        while self.dispatch.expired.pop().is_some() {}
    }
}

fn send_busy(mut stream: TcpStream, addr: SocketAddr) {
    warn!(peer = %addr, "clients are full");
    if let Err(e) = stream.write_all(BUSY_MESSAGE) {
        debug!(peer = %addr, error = %e, "busy reply failed");
    }
}

// ── Worker tasks ──

fn on_read(dispatch: &Dispatch, token: Token, conn: &SharedConn) {
    let mut conn = lock(conn);
    if conn.is_closed() {
        return;
    }
    match conn.read() {
        Ok(0) => {
            debug!(fd = conn.fd(), "peer closed");
            return dispatch.finish_close(token, &mut conn);
        }
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => {
            debug!(fd = conn.fd(), error = %e, "read failed");
            return dispatch.finish_close(token, &mut conn);
        }
    }
    on_process(dispatch, token, &mut conn);
}

fn on_process(dispatch: &Dispatch, token: Token, conn: &mut HttpConn) {
    let interest = if conn.process() { Interest::WRITABLE } else { Interest::READABLE };
    dispatch.rearm(token, conn, interest);
}

fn on_write(dispatch: &Dispatch, token: Token, conn: &SharedConn) {
    let mut conn = lock(conn);
    if conn.is_closed() {
        return;
    }
    let result = conn.write();
    if conn.to_write_bytes() == 0 {
        if conn.is_keep_alive() {
            return on_process(dispatch, token, &mut conn);
        }
    } else {
        match result {
            Ok(_) => return dispatch.rearm(token, &mut conn, Interest::WRITABLE),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return dispatch.rearm(token, &mut conn, Interest::WRITABLE);
            }
            Err(e) => debug!(fd = conn.fd(), error = %e, "write failed"),
        }
    }
    dispatch.finish_close(token, &mut conn);
}
