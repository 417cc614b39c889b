//! evhttpd - static file server on the evhttp epoll reactor.
//!
//! Configuration comes from `EVHTTP_*` environment variables, overridden by
//! command-line flags:
//!
//! ```text
//! evhttpd --port 8088 --trig-mode 3 --threads 8 --root ./resources
//! EVHTTP_TIMEOUT_MS=0 evhttpd          # disable idle eviction
//! ```
//!
//! SIGINT / SIGTERM stop the server gracefully: queued tasks finish, workers
//! are joined and live connections are closed.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;

use clap::Parser;
use evhttp::{MemoryUserStore, ServerConfig, TrigMode, UserVerifier, WebServer};
use nix::sys::signal::{signal, SigHandler, SigSet, Signal};
use tracing::{error, info};
use tracing_subscriber::FmtSubscriber;

/// Event-driven HTTP/1.1 static file server
#[derive(Parser, Debug)]
#[command(name = "evhttpd")]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Listen port (0 = ephemeral)
    #[arg(short, long)]
    port: Option<u16>,

    /// 0: LT/LT, 1: conn ET, 2: listen ET, 3: both ET
    #[arg(short = 'm', long)]
    trig_mode: Option<u8>,

    /// Idle-connection timeout in milliseconds (0 disables)
    #[arg(short, long)]
    timeout_ms: Option<u64>,

    /// Linger up to 1s on close to flush unsent data
    #[arg(long)]
    linger: bool,

    /// Worker pool size
    #[arg(short = 'n', long)]
    threads: Option<usize>,

    /// Maximum live connections
    #[arg(long)]
    max_conns: Option<usize>,

    /// Static file root
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Disable logging
    #[arg(long)]
    no_log: bool,

    /// off|error|warn|info|debug|trace or 0..5
    #[arg(short, long)]
    log_level: Option<String>,

    /// `user:password` file seeding the credential store
    #[arg(short, long)]
    users: Option<PathBuf>,
}

impl CliArgs {
    /// Flags override whatever the environment set.
    fn apply(self, mut config: ServerConfig) -> Result<ServerConfig, String> {
        if let Some(port) = self.port {
            config = config.port(port);
        }
        if let Some(mode) = self.trig_mode {
            config = config.trig_mode(TrigMode::from_mode(mode));
        }
        if let Some(ms) = self.timeout_ms {
            config = config.timeout_ms(ms);
        }
        if self.linger {
            config = config.opt_linger(true);
        }
        if let Some(n) = self.threads {
            config = config.thread_num(n);
        }
        if let Some(n) = self.max_conns {
            config = config.max_conns(n);
        }
        if let Some(root) = self.root {
            config = config.src_dir(root);
        }
        if self.no_log {
            config = config.log_enabled(false);
        }
        if let Some(level) = self.log_level {
            config = config.log_level(&level).map_err(|e| e.to_string())?;
        }
        if self.users.is_some() {
            config = config.users_file(self.users);
        }
        Ok(config)
    }
}

fn init_logging(config: &ServerConfig) {
    if !config.log_enabled {
        return;
    }
    let subscriber = FmtSubscriber::builder()
        .with_max_level(config.log_level)
        .with_thread_names(true)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("evhttpd: logging disabled: {}", e);
    }
}

fn load_users(config: &ServerConfig) -> Result<Arc<dyn UserVerifier>, String> {
    let store = match &config.users_file {
        Some(path) => MemoryUserStore::load(path)
            .map_err(|e| format!("read users file {}: {}", path.display(), e))?,
        None => MemoryUserStore::new(),
    };
    info!(users = store.len(), "credential store ready");
    Ok(Arc::new(store))
}

fn main() -> ExitCode {
    let args = CliArgs::parse();
    let config = match args.apply(ServerConfig::from_env()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("evhttpd: {}", e);
            return ExitCode::FAILURE;
        }
    };
    init_logging(&config);

    // Writes to a reset peer must surface as EPIPE, not kill the process.
    if let Err(e) = unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) } {
        error!(error = %e, "ignore SIGPIPE failed");
    }

    // Block the stop signals before any thread exists so every thread
    // inherits the mask and only the waiter below receives them.
    let mut stop_signals = SigSet::empty();
    stop_signals.add(Signal::SIGINT);
    stop_signals.add(Signal::SIGTERM);
    if let Err(e) = stop_signals.thread_block() {
        error!(error = %e, "block stop signals failed");
        return ExitCode::FAILURE;
    }

    let verifier = match load_users(&config) {
        Ok(v) => v,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut server = match WebServer::new(config, verifier) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "server init failed");
            return ExitCode::FAILURE;
        }
    };

    let handle = server.handle();
    let spawned = thread::Builder::new()
        .name("evhttp-signal".into())
        .spawn(move || match stop_signals.wait() {
            Ok(sig) => {
                info!(signal = %sig, "stop requested");
                handle.shutdown();
            }
            Err(e) => error!(error = %e, "sigwait failed"),
        });
    if let Err(e) = spawned {
        error!(error = %e, "spawn signal thread failed");
        return ExitCode::FAILURE;
    }

    match server.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "server stopped");
            ExitCode::FAILURE
        }
    }
}
