#![forbid(unsafe_code)]

//! The daemon side: listening sockets, one session task per control
//! connection, host access control and INIT negotiation.

mod handle;
#[cfg(feature = "mdns")]
pub mod mdns;
mod session;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::access;
use crate::backend::{auth_channel, AuthSender, Backend};
use crate::config::SanedConfig;
use crate::proto::{
    version_build, version_code, version_major, InitReply, InitRequest, Procedure, Status,
    PROTOCOL_VERSION, PROTOCOL_VERSION_MIN, SANE_PORT, VERSION_MAJOR, VERSION_MINOR,
};
use crate::wire::{WireError, WireReader, WireWriter};

use session::Session;

/// Idle watchdog: a session with no request boundary for this long is
/// terminated.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(3600);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("bind failed: {0}")]
    Bind(std::io::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
    #[error("connection idle for too long")]
    Watchdog,
}

/// Everything a session needs to know about the daemon's setup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Control port to listen on.
    pub port: u16,
    /// Inclusive range data ports must come from; `None` lets the OS
    /// pick.
    pub data_port_range: Option<(u16, u16)>,
    /// Host access rules.
    pub rules: Vec<access::HostRule>,
    /// Watchdog interval.
    pub idle_timeout: Duration,
    /// Addresses counted as the daemon's own (always admitted).
    pub local_addrs: Vec<IpAddr>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            port: SANE_PORT,
            data_port_range: None,
            rules: Vec::new(),
            idle_timeout: IDLE_TIMEOUT,
            local_addrs: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Build from `saned.conf` (plus `/etc/hosts.equiv`), resolving the
    /// daemon's own addresses once.
    pub async fn load() -> Self {
        let saned = SanedConfig::load();
        ServerConfig {
            port: SANE_PORT,
            data_port_range: saned.data_port_range,
            rules: saned.rules,
            idle_timeout: IDLE_TIMEOUT,
            local_addrs: crate::config::local_addresses().await,
        }
    }
}

/// Bind the control listeners: IPv6 first, then IPv4, tolerating the
/// second family failing when the first is already reachable (dual-stack
/// sockets).
pub async fn bind_listeners(port: u16) -> Result<Vec<TcpListener>, ServerError> {
    let mut listeners = Vec::new();
    let candidates: [SocketAddr; 2] = [
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
    ];
    let mut first_err = None;
    for addr in candidates {
        let bound = (|| {
            let socket = if addr.is_ipv6() { TcpSocket::new_v6()? } else { TcpSocket::new_v4()? };
            socket.set_reuseaddr(true)?;
            socket.bind(addr)?;
            socket.listen(1)
        })();
        match bound {
            Ok(listener) => {
                info!(%addr, "listening");
                listeners.push(listener);
            }
            Err(err) => {
                // Expected for IPv4 when the IPv6 socket already accepts
                // mapped addresses.
                debug!(%addr, error = %err, "could not bind");
                first_err.get_or_insert(err);
            }
        }
    }
    if listeners.is_empty() {
        return Err(ServerError::Bind(first_err.expect("no listeners and no error")));
    }
    Ok(listeners)
}

/// Wait for a connection on whichever listener is ready first.
pub async fn accept_any(
    listeners: &[TcpListener],
) -> std::io::Result<(TcpStream, SocketAddr)> {
    std::future::poll_fn(|cx| {
        for listener in listeners {
            if let std::task::Poll::Ready(result) = listener.poll_accept(cx) {
                return std::task::Poll::Ready(result);
            }
        }
        std::task::Poll::Pending
    })
    .await
}

/// Bind the control sockets and serve until shutdown.
pub async fn run<B, F>(
    config: Arc<ServerConfig>,
    factory: F,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), ServerError>
where
    B: Backend + Sync + 'static,
    B::Device: Sync,
    F: Fn(AuthSender) -> B + Send + Sync + Clone + 'static,
{
    let listeners = bind_listeners(config.port).await?;
    run_with_listeners(listeners, config, factory, shutdown).await
}

/// Accept loop: one session task per control connection, until the
/// shutdown channel flips.
pub async fn run_with_listeners<B, F>(
    listeners: Vec<TcpListener>,
    config: Arc<ServerConfig>,
    factory: F,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), ServerError>
where
    B: Backend + Sync + 'static,
    B::Device: Sync,
    F: Fn(AuthSender) -> B + Send + Sync + Clone + 'static,
{
    let mut sessions: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            accepted = accept_any(&listeners) => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        continue;
                    }
                };
                info!(%peer, "connection accepted");
                let config = config.clone();
                let factory = factory.clone();
                sessions.spawn(async move {
                    serve_connection(stream, config, factory).await;
                });
            }
            changed = shutdown.changed() => {
                if changed.is_ok() && *shutdown.borrow() {
                    info!("shutdown requested, no longer accepting");
                    break;
                }
                if changed.is_err() {
                    break;
                }
            }
        }
        // Reap finished sessions without blocking the accept loop.
        while sessions.try_join_next().is_some() {}
    }

    drop(listeners);
    info!(active = sessions.len(), "waiting for running sessions");
    while sessions.join_next().await.is_some() {}
    Ok(())
}

/// Serve one accepted control connection to completion.
pub async fn serve_connection<B, F>(stream: TcpStream, config: Arc<ServerConfig>, factory: F)
where
    B: Backend,
    F: Fn(AuthSender) -> B,
{
    let peer = match stream.peer_addr() {
        Ok(peer) => peer,
        Err(err) => {
            warn!(error = %err, "no peer address, dropping connection");
            return;
        }
    };
    match drive_session(stream, peer, config, factory).await {
        Ok(()) => info!(%peer, "session finished"),
        Err(err) => warn!(%peer, error = %err, "session aborted"),
    }
}

async fn drive_session<B, F>(
    stream: TcpStream,
    peer: SocketAddr,
    config: Arc<ServerConfig>,
    factory: F,
) -> Result<(), ServerError>
where
    B: Backend,
    F: Fn(AuthSender) -> B,
{
    if let Err(err) = stream.set_nodelay(true) {
        debug!(error = %err, "could not enable TCP_NODELAY");
    }
    let local = stream.local_addr()?;
    let (read_half, write_half) = stream.into_split();
    let mut reader = WireReader::new(read_half);
    let mut writer = WireWriter::new(write_half);

    // Host check precedes everything; the verdict is delivered in the
    // INIT reply.
    let allowed = access::check_host(peer.ip(), &config.local_addrs, &config.rules).await;

    let request = timeout(config.idle_timeout, async {
        let word = reader.read_word().await?;
        if Procedure::from_word(word)? != Procedure::Init {
            return Err(WireError::bad("first procedure", word as i64));
        }
        InitRequest::read(&mut reader).await
    })
    .await
    .map_err(|_| ServerError::Watchdog)??;

    let refuse = |status: Status| InitReply { status, version_code: 0 };

    if !allowed {
        warn!(%peer, "access denied by host check");
        refuse(Status::AccessDenied).write(&mut writer);
        writer.flush().await?;
        return Ok(());
    }

    let build = version_build(request.version_code);
    if version_major(request.version_code) != VERSION_MAJOR
        || build < PROTOCOL_VERSION_MIN
        || build > PROTOCOL_VERSION
    {
        warn!(
            %peer,
            version = format_args!("{:#010x}", request.version_code),
            "client protocol version not supported"
        );
        refuse(Status::Inval).write(&mut writer);
        writer.flush().await?;
        return Ok(());
    }

    let username = request.username.unwrap_or_default();
    let (auth_tx, auth_rx) = auth_channel();
    let backend = factory(auth_tx.clone());
    if version_major(backend.version()) != VERSION_MAJOR {
        warn!(version = backend.version(), "backend major version mismatch");
        refuse(Status::Inval).write(&mut writer);
        writer.flush().await?;
        return Ok(());
    }

    info!(%peer, user = %username, "access granted");
    let reply = InitReply {
        status: Status::Good,
        version_code: version_code(VERSION_MAJOR, VERSION_MINOR, PROTOCOL_VERSION),
    };
    reply.write(&mut writer);
    writer.flush().await?;

    Session::new(reader, writer, peer, local, backend, auth_tx, auth_rx, config).run().await
}
