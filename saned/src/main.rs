//! `saned` — the SANE network daemon.
//!
//! Publishes local scanner backends to the network. Three ways to run:
//! inetd/systemd mode (the default: the connection arrives on an
//! inherited file descriptor), standalone mode (`-a`: bind, detach,
//! optionally drop privileges), and debug mode (`-d`/`-s`: foreground,
//! one connection).

mod privdrop;

use std::os::fd::FromRawFd;
use std::sync::Arc;

use clap::Parser;
use sane_net::backend::testdev::TestBackend;
use sane_net::server::{self, ServerConfig};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const PIDFILE: &str = "/var/run/saned.pid";

#[derive(Parser, Debug)]
#[command(name = "saned", version, about = "SANE network daemon")]
struct Cli {
    /// Run standalone: bind, detach into the background, and optionally
    /// drop privileges to USER.
    #[arg(short = 'a', long = "alone", value_name = "USER", num_args = 0..=1, default_missing_value = "")]
    alone: Option<String>,

    /// Debug mode: stay in the foreground and serve one connection.
    #[arg(short = 'd', long = "debug", value_name = "LEVEL", num_args = 0..=1, default_missing_value = "2")]
    debug: Option<u8>,

    /// Like -d, but with timestamps and no colors in the log output.
    #[arg(short = 's', long = "log-plain", value_name = "LEVEL", num_args = 0..=1, default_missing_value = "2")]
    log_plain: Option<u8>,

    /// Listen on PORT instead of the sane-port default.
    #[arg(short = 'p', long = "port", env = "SANED_PORT")]
    port: Option<u16>,
}

fn main() {
    let cli = Cli::parse();

    let level = cli
        .debug
        .or(cli.log_plain)
        .or_else(|| sane_net::config::debug_level("saned"));
    init_tracing(level, cli.log_plain.is_some());

    let code = if let Some(user) = cli.alone.clone() {
        run_standalone(&cli, user)
    } else if cli.debug.is_some() || cli.log_plain.is_some() {
        run_debug(&cli)
    } else {
        run_inherited(&cli)
    };
    std::process::exit(code);
}

fn init_tracing(level: Option<u8>, plain: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(match level.unwrap_or(2) {
            0 => "error",
            1 => "warn",
            2 => "info",
            3 | 4 => "debug",
            _ => "trace",
        })
    });
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if plain {
        builder.with_ansi(false).init();
    } else {
        builder.init();
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("tokio runtime")
}

fn backend_factory() -> impl Fn(sane_net::AuthSender) -> TestBackend + Send + Sync + Clone + 'static
{
    |_auth| TestBackend::new()
}

/// Flip the shutdown channel on SIGINT or SIGTERM.
async fn watch_signals(tx: watch::Sender<bool>) {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            warn!(error = %err, "cannot listen for SIGTERM");
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
    info!("termination signal received");
    let _ = tx.send(true);
}

fn run_standalone(cli: &Cli, user: String) -> i32 {
    // Detach before the runtime exists; forking afterwards would lose
    // its worker threads.
    if let Err(err) = privdrop::daemonize() {
        error!(error = %err, "could not detach");
        return 1;
    }
    if let Err(err) = std::fs::write(PIDFILE, format!("{}\n", std::process::id())) {
        warn!(error = %err, path = PIDFILE, "could not write pidfile");
    }

    let rt = runtime();
    rt.block_on(async {
        let mut config = ServerConfig::load().await;
        if let Some(port) = cli.port {
            config.port = port;
        }
        let listeners = match server::bind_listeners(config.port).await {
            Ok(listeners) => listeners,
            Err(err) => {
                error!(error = %err, "cannot listen");
                return 1;
            }
        };
        // Sockets are bound; root is no longer needed.
        if !user.is_empty() {
            if let Err(err) = privdrop::drop_to_user(&user) {
                error!(%user, error = %err, "privilege drop failed");
                return 1;
            }
            info!(%user, "privileges dropped");
        }

        #[cfg(feature = "mdns")]
        let _advertisement = match server::mdns::publish(config.port) {
            Ok(ad) => Some(ad),
            Err(err) => {
                warn!(error = %err, "mdns publication failed");
                None
            }
        };

        let (tx, mut rx) = watch::channel(false);
        tokio::spawn(watch_signals(tx));
        match server::run_with_listeners(listeners, Arc::new(config), backend_factory(), &mut rx)
            .await
        {
            Ok(()) => 0,
            Err(err) => {
                error!(error = %err, "server failed");
                1
            }
        }
    })
}

fn run_debug(cli: &Cli) -> i32 {
    let rt = runtime();
    rt.block_on(async {
        let mut config = ServerConfig::load().await;
        if let Some(port) = cli.port {
            config.port = port;
        }
        let listeners = match server::bind_listeners(config.port).await {
            Ok(listeners) => listeners,
            Err(err) => {
                error!(error = %err, "cannot listen");
                return 1;
            }
        };
        info!("debug mode: waiting for one connection");
        let (stream, peer) = match server::accept_any(&listeners).await {
            Ok(pair) => pair,
            Err(err) => {
                error!(error = %err, "accept failed");
                return 1;
            }
        };
        info!(%peer, "connection accepted");
        drop(listeners);
        server::serve_connection(stream, Arc::new(config), backend_factory()).await;
        0
    })
}

/// inetd/systemd mode: serve the socket the parent handed us. With
/// systemd socket activation (`LISTEN_FDS`) fd 3 is a listening socket;
/// classic inetd passes the connected socket on stdin.
fn run_inherited(cli: &Cli) -> i32 {
    let rt = runtime();
    rt.block_on(async {
        let mut config = ServerConfig::load().await;
        if let Some(port) = cli.port {
            config.port = port;
        }
        let config = Arc::new(config);

        if std::env::var("LISTEN_FDS").map(|v| v.parse::<u32>().unwrap_or(0) >= 1) == Ok(true) {
            // SAFETY: fd 3 is the socket systemd promised via LISTEN_FDS;
            // nothing else in this process owns it.
            let std_listener = unsafe { std::net::TcpListener::from_raw_fd(3) };
            if let Err(err) = std_listener.set_nonblocking(true) {
                error!(error = %err, "inherited listener unusable");
                return 1;
            }
            let listener = match TcpListener::from_std(std_listener) {
                Ok(listener) => listener,
                Err(err) => {
                    error!(error = %err, "inherited listener unusable");
                    return 1;
                }
            };
            let (tx, mut rx) = watch::channel(false);
            tokio::spawn(watch_signals(tx));
            return match server::run_with_listeners(
                vec![listener],
                config,
                backend_factory(),
                &mut rx,
            )
            .await
            {
                Ok(()) => 0,
                Err(err) => {
                    error!(error = %err, "server failed");
                    1
                }
            };
        }

        // SAFETY: in inetd mode stdin is the accepted client socket and
        // is not used as a terminal by anything else here.
        let std_stream = unsafe { std::net::TcpStream::from_raw_fd(0) };
        if let Err(err) = std_stream.set_nonblocking(true) {
            error!(error = %err, "stdin is not a usable socket");
            return 1;
        }
        let stream = match TcpStream::from_std(std_stream) {
            Ok(stream) => stream,
            Err(err) => {
                error!(error = %err, "stdin is not a usable socket");
                return 1;
            }
        };
        server::serve_connection(stream, config, backend_factory()).await;
        0
    })
}
