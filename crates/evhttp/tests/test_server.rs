//! End-to-end tests: a real server on an ephemeral port, driven by blocking
//! std clients.

use std::fs;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use evhttp::{MemoryUserStore, ServerConfig, ServerHandle, TrigMode, WebServer};

static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

struct TestServer {
    root: PathBuf,
    addr: SocketAddr,
    handle: ServerHandle,
    thread: Option<JoinHandle<()>>,
}

impl TestServer {
    fn start(tag: &str, configure: impl FnOnce(ServerConfig) -> ServerConfig) -> Self {
        Self::start_with(tag, configure, |_| {})
    }

    fn start_with(
        tag: &str,
        configure: impl FnOnce(ServerConfig) -> ServerConfig,
        populate: impl FnOnce(&PathBuf),
    ) -> Self {
        let root = std::env::temp_dir().join(format!(
            "evhttp-it-{}-{}-{}",
            tag,
            std::process::id(),
            NEXT_ID.fetch_add(1, Ordering::Relaxed)
        ));
        let _ = fs::remove_dir_all(&root);
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("index.html"), "<h1>index</h1>").unwrap();
        fs::write(root.join("404.html"), "<h1>not found</h1>").unwrap();
        fs::write(root.join("400.html"), "<h1>bad request</h1>").unwrap();
        fs::write(root.join("welcome.html"), "<h1>welcome</h1>").unwrap();
        fs::write(root.join("error.html"), "<h1>error</h1>").unwrap();
        populate(&root);

        let config = configure(
            ServerConfig::default()
                .port(0)
                .thread_num(4)
                .src_dir(&root)
                .log_enabled(false),
        );
        let users = Arc::new(MemoryUserStore::with_users([("alice", "wonderland")]));
        let mut server = WebServer::new(config, users).unwrap();
        let port = server.local_addr().unwrap().port();
        let handle = server.handle();
        let thread = thread::spawn(move || server.run().unwrap());

        Self {
            root,
            addr: SocketAddr::from(([127, 0, 0, 1], port)),
            handle,
            thread: Some(thread),
        }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        stream
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.shutdown();
        if let Some(t) = self.thread.take() {
            t.join().unwrap();
        }
        let _ = fs::remove_dir_all(&self.root);
    }
}

struct Reply {
    status: String,
    head: String,
    body: Vec<u8>,
}

impl Reply {
    fn header(&self, name: &str) -> Option<&str> {
        self.head.lines().skip(1).find_map(|line| {
            let (k, v) = line.split_once(':')?;
            k.eq_ignore_ascii_case(name).then(|| v.trim())
        })
    }

    fn body_str(&self) -> &str {
        std::str::from_utf8(&self.body).unwrap()
    }
}

/// Read exactly one response, using its Content-length.
fn read_reply(stream: &mut TcpStream) -> Reply {
    let mut data = Vec::new();
    let mut chunk = [0u8; 8192];
    let head_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        let n = stream.read(&mut chunk).unwrap();
        assert!(n > 0, "connection closed before response head");
        data.extend_from_slice(&chunk[..n]);
    };
    let head = String::from_utf8(data[..head_end].to_vec()).unwrap();
    let mut reply = Reply {
        status: head.lines().next().unwrap().to_string(),
        head,
        body: data[head_end + 4..].to_vec(),
    };
    let len: usize = reply.header("Content-length").unwrap().parse().unwrap();
    while reply.body.len() < len {
        let n = stream.read(&mut chunk).unwrap();
        assert!(n > 0, "connection closed mid-body");
        reply.body.extend_from_slice(&chunk[..n]);
    }
    assert_eq!(reply.body.len(), len);
    reply
}

fn get(stream: &mut TcpStream, path: &str, keep_alive: bool) -> Reply {
    let conn = if keep_alive { "keep-alive" } else { "close" };
    let req = format!("GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: {}\r\n\r\n", path, conn);
    stream.write_all(req.as_bytes()).unwrap();
    read_reply(stream)
}

fn post_form(stream: &mut TcpStream, path: &str, body: &str) -> Reply {
    let req = format!(
        "POST {} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n{}",
        path,
        body.len(),
        body
    );
    stream.write_all(req.as_bytes()).unwrap();
    read_reply(stream)
}

fn assert_closed(stream: &mut TcpStream) {
    let mut buf = [0u8; 64];
    match stream.read(&mut buf) {
        Ok(0) => {}
        Ok(n) => panic!("expected EOF, got {} bytes", n),
        Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => {}
        Err(e) => panic!("expected EOF, got {}", e),
    }
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    cond()
}

#[test]
fn test_keep_alive_serves_several_requests() {
    let server = TestServer::start("keepalive", |c| c);
    let mut stream = server.connect();

    let first = get(&mut stream, "/", true);
    assert_eq!(first.status, "HTTP/1.1 200 OK");
    assert_eq!(first.header("Connection"), Some("keep-alive"));
    assert_eq!(first.header("Keep-Alive"), Some("max=6, timeout=60"));
    assert_eq!(first.header("Content-type"), Some("text/html"));
    assert_eq!(first.body_str(), "<h1>index</h1>");

    let second = get(&mut stream, "/index", true);
    assert_eq!(second.status, "HTTP/1.1 200 OK");
    assert_eq!(second.body_str(), "<h1>index</h1>");

    let last = get(&mut stream, "/index.html", false);
    assert_eq!(last.header("Connection"), Some("close"));
    assert_closed(&mut stream);
}

#[test]
fn test_missing_file_is_404_page() {
    let server = TestServer::start("404", |c| c);
    let mut stream = server.connect();

    let reply = get(&mut stream, "/does/not/exist.html", true);
    assert_eq!(reply.status, "HTTP/1.1 404 Not Found");
    assert_eq!(reply.header("Content-length"), Some("18"));
    assert_eq!(reply.body_str(), "<h1>not found</h1>");

    // Resource errors keep the connection usable.
    let again = get(&mut stream, "/", false);
    assert_eq!(again.status, "HTTP/1.1 200 OK");
}

#[test]
fn test_traversal_is_404() {
    let server = TestServer::start("traversal", |c| c);
    let mut stream = server.connect();
    let reply = get(&mut stream, "/../../etc/passwd", false);
    assert_eq!(reply.status, "HTTP/1.1 404 Not Found");
}

#[test]
fn test_malformed_request_is_400_and_closed() {
    let server = TestServer::start("400", |c| c);
    let mut stream = server.connect();
    stream.write_all(b"BADLINE\r\nConnection: keep-alive\r\n\r\n").unwrap();

    let reply = read_reply(&mut stream);
    assert_eq!(reply.status, "HTTP/1.1 400 Bad Request");
    assert_eq!(reply.header("Connection"), Some("close"));
    assert_eq!(reply.body_str(), "<h1>bad request</h1>");
    assert_closed(&mut stream);
}

#[test]
fn test_register_then_login() {
    let server = TestServer::start("auth", |c| c);

    let mut stream = server.connect();
    let reply = post_form(&mut stream, "/register", "username=bob&password=b%40b+1");
    assert_eq!(reply.body_str(), "<h1>welcome</h1>");

    let mut stream = server.connect();
    let reply = post_form(&mut stream, "/register", "username=bob&password=other");
    assert_eq!(reply.body_str(), "<h1>error</h1>");

    let mut stream = server.connect();
    let reply = post_form(&mut stream, "/login", "username=bob&password=b%40b+1");
    assert_eq!(reply.body_str(), "<h1>welcome</h1>");

    let mut stream = server.connect();
    let reply = post_form(&mut stream, "/login", "username=alice&password=wrong");
    assert_eq!(reply.body_str(), "<h1>error</h1>");
}

#[test]
fn test_idle_connection_is_evicted() {
    let server = TestServer::start("idle", |c| c.timeout_ms(200));
    let mut stream = server.connect();
    let reply = get(&mut stream, "/", true);
    assert_eq!(reply.status, "HTTP/1.1 200 OK");
    assert_eq!(server.handle.live_connections(), 1);

    // No further traffic: the server hangs up.
    assert_closed(&mut stream);
    assert!(wait_until(Duration::from_secs(2), || server.handle.live_connections() == 0));
}

#[test]
fn test_activity_defers_eviction() {
    let server = TestServer::start("defer", |c| c.timeout_ms(400));
    let mut stream = server.connect();
    for _ in 0..4 {
        thread::sleep(Duration::from_millis(200));
        assert_eq!(get(&mut stream, "/", true).status, "HTTP/1.1 200 OK");
    }
}

#[test]
fn test_capacity_rejects_with_busy() {
    let server = TestServer::start("busy", |c| c.max_conns(1));
    let mut first = server.connect();
    assert_eq!(get(&mut first, "/", true).status, "HTTP/1.1 200 OK");

    let mut second = server.connect();
    let mut reply = Vec::new();
    second.read_to_end(&mut reply).unwrap();
    assert_eq!(reply, b"Server busy!");

    // The first connection is unaffected.
    assert_eq!(get(&mut first, "/", false).status, "HTTP/1.1 200 OK");
}

#[test]
fn test_concurrent_clients_get_their_own_response() {
    const CLIENTS: usize = 16;
    let server = TestServer::start_with("concurrent", |c| c, |root| {
        for i in 0..CLIENTS {
            fs::write(root.join(format!("file{}.txt", i)), format!("payload-{}", i).repeat(i + 1)).unwrap();
        }
    });

    let addr = server.addr;
    let workers: Vec<_> = (0..CLIENTS)
        .map(|i| {
            thread::spawn(move || {
                let mut stream = TcpStream::connect(addr).unwrap();
                stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
                let expected = format!("payload-{}", i).repeat(i + 1);
                for _ in 0..3 {
                    let reply = get(&mut stream, &format!("/file{}.txt", i), true);
                    assert_eq!(reply.status, "HTTP/1.1 200 OK");
                    assert_eq!(reply.header("Content-type"), Some("text/plain"));
                    assert_eq!(reply.body_str(), expected);
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }
}

fn large_file_roundtrip(mode: u8) {
    let size = 512 * 1024 + 17;
    let content: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    let expected = content.clone();
    let server = TestServer::start_with(
        &format!("large{}", mode),
        |c| c.trig_mode(TrigMode::from_mode(mode)),
        move |root| fs::write(root.join("big.gz"), &content).unwrap(),
    );

    let mut stream = server.connect();
    for _ in 0..2 {
        let reply = get(&mut stream, "/big.gz", true);
        assert_eq!(reply.status, "HTTP/1.1 200 OK");
        assert_eq!(reply.header("Content-type"), Some("application/x-gzip"));
        assert!(reply.body == expected);
    }
}

#[test]
fn test_large_file_level_triggered() {
    large_file_roundtrip(0);
}

#[test]
fn test_large_file_edge_triggered() {
    large_file_roundtrip(3);
}

/// One-shot GET that tolerates the server hanging up; `None` unless the
/// full reply arrived.
fn try_status(addr: SocketAddr, path: &str) -> Option<String> {
    let mut stream = TcpStream::connect(addr).ok()?;
    stream.set_read_timeout(Some(Duration::from_secs(5))).ok()?;
    let req = format!("GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n", path);
    stream.write_all(req.as_bytes()).ok()?;
    let mut data = Vec::new();
    stream.read_to_end(&mut data).ok()?;
    let text = String::from_utf8_lossy(&data);
    text.lines().next().filter(|l| !l.is_empty()).map(str::to_string)
}

/// Readers drain a large file a few KiB at a time while a short idle timeout
/// keeps firing, so evictions land while workers are mid-write.
fn eviction_during_slow_transfer(mode: u8) {
    const READERS: usize = 4;
    let size = 4 * 1024 * 1024;
    let content: Vec<u8> = (0..size).map(|i| (i % 253) as u8).collect();
    let server = TestServer::start_with(
        &format!("evictrace{}", mode),
        |c| c.trig_mode(TrigMode::from_mode(mode)).timeout_ms(20),
        move |root| fs::write(root.join("huge.bin"), &content).unwrap(),
    );

    let addr = server.addr;
    let readers: Vec<_> = (0..READERS)
        .map(|_| {
            thread::spawn(move || {
                let mut stream = TcpStream::connect(addr).unwrap();
                stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
                let req = "GET /huge.bin HTTP/1.1\r\nHost: localhost\r\nConnection: keep-alive\r\n\r\n";
                if stream.write_all(req.as_bytes()).is_err() {
                    return 0;
                }
                let deadline = Instant::now() + Duration::from_secs(3);
                let mut chunk = [0u8; 4096];
                let mut received = 0;
                while received < size && Instant::now() < deadline {
                    match stream.read(&mut chunk) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => received += n,
                    }
                    thread::sleep(Duration::from_millis(2));
                }
                received
            })
        })
        .collect();
    for r in readers {
        // Either the transfer was cut short or it made progress; never a panic.
        r.join().unwrap();
    }

    assert!(wait_until(Duration::from_secs(3), || server.handle.live_connections() == 0));
    assert!(server.handle.is_running());

    let status = (0..5).find_map(|_| try_status(addr, "/index.html"));
    assert_eq!(status.as_deref(), Some("HTTP/1.1 200 OK"));
}

#[test]
fn test_eviction_during_slow_transfer_level_triggered() {
    eviction_during_slow_transfer(0);
}

#[test]
fn test_eviction_during_slow_transfer_edge_triggered() {
    eviction_during_slow_transfer(3);
}

#[test]
fn test_half_closed_request_is_released() {
    let server = TestServer::start("halfclose", |c| c);
    let mut stream = server.connect();
    stream.write_all(b"GET /index.html HTTP/1.1\r\nHost: local").unwrap();
    assert!(wait_until(Duration::from_secs(2), || server.handle.live_connections() == 1));

    stream.shutdown(Shutdown::Write).unwrap();
    assert!(wait_until(Duration::from_secs(2), || server.handle.live_connections() == 0));
    assert_closed(&mut stream);

    let mut fresh = server.connect();
    assert_eq!(get(&mut fresh, "/", false).status, "HTTP/1.1 200 OK");
}

#[test]
fn test_no_timeout_omits_keep_alive_timeout() {
    let server = TestServer::start("notimeout", |c| c.timeout_ms(0));
    let mut stream = server.connect();
    let reply = get(&mut stream, "/", true);
    assert_eq!(reply.status, "HTTP/1.1 200 OK");
    assert_eq!(reply.header("Keep-Alive"), Some("max=6"));
}

#[test]
fn test_split_request_is_reassembled() {
    let server = TestServer::start("split", |c| c.trig_mode(TrigMode::from_mode(1)));
    let mut stream = server.connect();
    stream.write_all(b"GET /ind").unwrap();
    stream.flush().unwrap();
    thread::sleep(Duration::from_millis(100));
    stream.write_all(b"ex HTTP/1.1\r\nConnection: close\r\n\r\n").unwrap();
    let reply = read_reply(&mut stream);
    assert_eq!(reply.status, "HTTP/1.1 200 OK");
    assert_eq!(reply.body_str(), "<h1>index</h1>");
}

#[test]
fn test_shutdown_closes_live_connections() {
    let mut server = TestServer::start("shutdown", |c| c);
    let mut stream = server.connect();
    assert_eq!(get(&mut stream, "/", true).status, "HTTP/1.1 200 OK");

    server.handle.shutdown();
    server.thread.take().unwrap().join().unwrap();
    assert!(!server.handle.is_running());
    assert_closed(&mut stream);
    assert_eq!(server.handle.live_connections(), 0);
}
