#![forbid(unsafe_code)]

//! Network client backend: proxies a remote daemon's scanners as local
//! devices.
//!
//! Each configured host gets one lazily-established control connection
//! shared by all of its open devices; every backend operation is one RPC
//! on that connection. A scan additionally opens a per-frame data
//! connection to the port announced in the START reply.

mod connection;
mod data;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::backend::{request_credentials, AuthSender, Backend, Device};
use crate::config::NetConfig;
use crate::proto::{
    version_code, Action, AuthorizeRequest, ControlOptionReply, ControlOptionRequest, DeviceInfo,
    GetDevicesReply, GetParametersReply, Info, OpenReply, OptionDescriptor,
    OptionDescriptorsReply, OptionValue, Parameters, Procedure, StartReply, Status, ValueType,
    LITTLE_ENDIAN_MAGIC, PROTOCOL_VERSION, VERSION_MAJOR, VERSION_MINOR,
};
use crate::wire::WireError;

use connection::Connection;
use data::{swap_chunk, DataStream, SwapState};

#[derive(Debug, Error)]
pub enum NetError {
    #[error("wire protocol error: {0}")]
    Wire(#[from] WireError),
    #[error("could not resolve {host}: {source}")]
    Resolve { host: String, source: std::io::Error },
    #[error("could not connect to {host}: {source}")]
    Connect { host: String, source: std::io::Error },
    #[error("connecting to {host} timed out")]
    ConnectTimeout { host: String },
    #[error("{host} rejected the handshake: {status}")]
    InitFailed { host: String, status: Status },
    #[error("{host} speaks an incompatible protocol version {code:#010x}")]
    VersionMismatch { host: String, code: i32 },
}

/// Degrade a wire failure to the status the backend interface reports.
fn io_status(err: WireError) -> Status {
    warn!(error = %err, "rpc failed");
    Status::IoError
}

struct HostEntry {
    name: String,
    conn: Option<Arc<Mutex<Connection>>>,
}

/// The net backend: implements the backend contract by talking to remote
/// daemons.
pub struct NetBackend {
    hosts: Vec<HostEntry>,
    username: Option<String>,
    connect_timeout: Option<Duration>,
    port: u16,
    auth: AuthSender,
}

impl NetBackend {
    /// Build from `net.conf` and the environment.
    pub fn new(auth: AuthSender) -> Self {
        Self::with_config(NetConfig::load(), auth)
    }

    /// Build from an explicit configuration.
    pub fn with_config(config: NetConfig, auth: AuthSender) -> Self {
        NetBackend {
            hosts: config
                .hosts
                .into_iter()
                .map(|name| HostEntry { name, conn: None })
                .collect(),
            username: std::env::var("USER").ok().filter(|u| !u.is_empty()),
            connect_timeout: config.connect_timeout,
            port: config.port,
            auth,
        }
    }

    /// Register another remote host (mDNS discovery and user-supplied
    /// names land here). Duplicates are ignored.
    pub fn add_host(&mut self, name: &str) {
        if self.hosts.iter().any(|h| h.name == name) {
            return;
        }
        debug!(host = name, "registering remote host");
        self.hosts.push(HostEntry { name: name.to_owned(), conn: None });
    }

    async fn ensure_connected(&mut self, host: &str) -> Result<Arc<Mutex<Connection>>, NetError> {
        if !self.hosts.iter().any(|h| h.name == host) {
            self.add_host(host);
        }
        let entry = self
            .hosts
            .iter_mut()
            .find(|h| h.name == host)
            .expect("host registered above");
        if let Some(conn) = &entry.conn {
            return Ok(conn.clone());
        }
        let conn = Connection::establish(
            host,
            self.port,
            self.username.as_deref(),
            self.connect_timeout,
        )
        .await?;
        let conn = Arc::new(Mutex::new(conn));
        entry.conn = Some(conn.clone());
        Ok(conn)
    }

    /// Tear down all control connections, telling each peer to exit.
    pub async fn shutdown(self) {
        for entry in self.hosts {
            if let Some(conn) = entry.conn {
                let mut conn = conn.lock().await;
                let _ = conn.send_request(Procedure::Exit, |_| {}).await;
            }
        }
    }
}

/// Split `host:device`, `[ipv6]:device` or a bare host name. The device
/// part may itself contain colons.
fn split_device_name(full: &str) -> Option<(&str, &str)> {
    if let Some(stripped) = full.strip_prefix('[') {
        let (host, rest) = stripped.split_once(']')?;
        return Some((host, rest.strip_prefix(':').unwrap_or("")));
    }
    match full.split_once(':') {
        Some((host, device)) => Some((host, device)),
        None => Some((full, "")),
    }
}

impl Backend for NetBackend {
    type Device = NetDevice;

    fn version(&self) -> i32 {
        version_code(VERSION_MAJOR, VERSION_MINOR, PROTOCOL_VERSION)
    }

    async fn devices(&mut self, _local_only: bool) -> Result<Vec<DeviceInfo>, Status> {
        let names: Vec<String> = self.hosts.iter().map(|h| h.name.clone()).collect();
        let mut devices = Vec::new();
        for host in names {
            let conn = match self.ensure_connected(&host).await {
                Ok(conn) => conn,
                Err(err) => {
                    warn!(%host, error = %err, "skipping unreachable host");
                    continue;
                }
            };
            let mut conn = conn.lock().await;
            let reply: Result<GetDevicesReply, WireError> = async {
                conn.send_request(Procedure::GetDevices, |_| {}).await?;
                GetDevicesReply::read(&mut conn.reader).await
            }
            .await;
            match reply {
                Ok(reply) if reply.status == Status::Good => {
                    for mut device in reply.devices {
                        device.name = format!("{host}:{}", device.name);
                        devices.push(device);
                    }
                }
                Ok(reply) => {
                    warn!(%host, status = %reply.status, "device enumeration failed")
                }
                Err(err) => warn!(%host, error = %err, "device enumeration failed"),
            }
        }
        Ok(devices)
    }

    async fn open(&mut self, name: &str) -> Result<NetDevice, Status> {
        let full;
        let name = if name.is_empty() {
            // An empty name opens the first device of the first host.
            let first = self.hosts.first().ok_or(Status::Inval)?;
            full = first.name.clone();
            full.as_str()
        } else {
            name
        };
        let (host, device) = split_device_name(name).ok_or(Status::Inval)?;
        let (host, device) = (host.to_owned(), device.to_owned());

        let conn_arc = self.ensure_connected(&host).await.map_err(|err| {
            warn!(%host, error = %err, "could not reach host");
            match err {
                NetError::InitFailed { status, .. } => status,
                _ => Status::IoError,
            }
        })?;

        let auth = self.auth.clone();
        let handle = {
            let mut conn = conn_arc.lock().await;
            conn.send_request(Procedure::Open, |w| w.put_string(Some(&device)))
                .await
                .map_err(io_status)?;
            let reply = loop {
                let reply = OpenReply::read(&mut conn.reader).await.map_err(io_status)?;
                match reply.resource_to_authorize {
                    Some(resource) => {
                        answer_challenge(&mut conn, &host, &auth, &resource)
                            .await
                            .map_err(io_status)?;
                    }
                    None => break reply,
                }
            };
            if reply.status != Status::Good {
                debug!(%host, %device, status = %reply.status, "remote open failed");
                return Err(reply.status);
            }
            reply.handle
        };
        info!(%host, %device, handle, "remote device opened");

        let mut dev = NetDevice {
            conn: conn_arc,
            host,
            auth,
            handle,
            options: None,
            data: None,
            depth: 0,
            server_big_endian: false,
            swap: SwapState::default(),
        };
        // Prime the descriptor cache, closing the remote handle again if
        // that fails.
        if let Err(status) = dev.ensure_options().await {
            let mut conn = dev.conn.lock().await;
            let _ = conn.call_word_ack(Procedure::Close, dev.handle).await;
            return Err(status);
        }
        Ok(dev)
    }
}

/// Answer one authorization challenge: ask the frontend, relay the
/// credentials, and consume the ack. The AUTHORIZE RPC is sent even when
/// the frontend refused, keeping the reply stream in lockstep.
async fn answer_challenge(
    conn: &mut Connection,
    host: &str,
    auth: &AuthSender,
    resource: &str,
) -> Result<(), WireError> {
    debug!(host, resource, "authorization required");
    let net_resource = format!("net:{host}:{resource}");
    let creds = request_credentials(auth, &net_resource).await.unwrap_or_default();
    let request = AuthorizeRequest {
        resource: Some(resource.to_owned()),
        username: Some(creds.username),
        password: Some(creds.password),
    };
    conn.send_request(Procedure::Authorize, |w| request.write(w)).await?;
    conn.reader.read_word().await?;
    // The original reply is re-read next; give it a fresh budget.
    conn.reader.begin_message();
    Ok(())
}

/// One open remote device.
pub struct NetDevice {
    conn: Arc<Mutex<Connection>>,
    host: String,
    auth: AuthSender,
    handle: i32,
    /// Cached option descriptors; `None` after a RELOAD_OPTIONS reply.
    options: Option<Vec<OptionDescriptor>>,
    data: Option<DataStream>,
    /// Depth of the most recently fetched parameters; drives the 16-bit
    /// swap.
    depth: i32,
    server_big_endian: bool,
    swap: SwapState,
}

impl NetDevice {
    /// Refetch the descriptor table when the cache is invalid.
    async fn ensure_options(&mut self) -> Result<(), Status> {
        if self.options.is_some() {
            return Ok(());
        }
        let mut conn = self.conn.lock().await;
        conn.send_request(Procedure::GetOptionDescriptors, |w| w.put_word(self.handle))
            .await
            .map_err(io_status)?;
        let reply = OptionDescriptorsReply::read(&mut conn.reader)
            .await
            .map_err(io_status)?;
        debug!(host = %self.host, count = reply.descriptors.len(), "descriptors fetched");
        self.options = Some(reply.descriptors);
        Ok(())
    }

    /// Close the remote handle. Dropping without closing leaves it to
    /// the connection teardown.
    pub async fn close(self) {
        let mut conn = self.conn.lock().await;
        if let Err(err) = conn.call_word_ack(Procedure::Close, self.handle).await {
            debug!(error = %err, "close rpc failed");
        }
    }

    fn swap_active(&self) -> bool {
        self.depth == 16 && self.server_big_endian != cfg!(target_endian = "big")
    }
}

impl Device for NetDevice {
    async fn descriptors(&mut self) -> Result<Vec<OptionDescriptor>, Status> {
        self.ensure_options().await?;
        Ok(self.options.clone().expect("cache primed above"))
    }

    async fn control(
        &mut self,
        option: usize,
        action: Action,
        value: OptionValue,
    ) -> Result<(Info, OptionValue), Status> {
        self.ensure_options().await?;
        let descriptors = self.options.as_ref().expect("cache primed above");
        let desc = descriptors.get(option).ok_or(Status::Inval)?;
        let (ty, size) = (desc.ty, desc.size);

        let (value_size, outgoing) = match ty {
            ValueType::Button | ValueType::Group => (0, OptionValue::Empty),
            ValueType::String => match action {
                Action::Set => {
                    let OptionValue::Text(Some(text)) = &value else {
                        return Err(Status::Inval);
                    };
                    // Strings may be shorter than the option's storage.
                    let sent = size.min(text.len() as i32 + 1);
                    (sent, value)
                }
                Action::Get => (size, OptionValue::Text(Some(String::new()))),
                Action::SetAuto => (0, OptionValue::Text(None)),
            },
            _ => match action {
                Action::Set => {
                    let OptionValue::Words(words) = &value else {
                        return Err(Status::Inval);
                    };
                    let sent = words.len() as i32 * 4;
                    (sent, value)
                }
                Action::Get => {
                    let slots = (size / 4).max(0) as usize;
                    (size, OptionValue::Words(vec![0; slots]))
                }
                Action::SetAuto => (0, OptionValue::Words(Vec::new())),
            },
        };

        let request = ControlOptionRequest {
            handle: self.handle,
            option: option as i32,
            action,
            value_type: ty,
            value_size,
            value: outgoing,
        };

        let mut conn = self.conn.lock().await;
        conn.send_request(Procedure::ControlOption, |w| request.write(w))
            .await
            .map_err(io_status)?;
        let reply = loop {
            let reply = ControlOptionReply::read(&mut conn.reader).await.map_err(io_status)?;
            match reply.resource_to_authorize {
                Some(resource) => {
                    answer_challenge(&mut conn, &self.host, &self.auth, &resource)
                        .await
                        .map_err(io_status)?;
                }
                None => break reply,
            }
        };
        drop(conn);

        if reply.status != Status::Good {
            return Err(reply.status);
        }
        if reply.info.contains(Info::RELOAD_OPTIONS) {
            debug!(host = %self.host, "descriptor cache invalidated");
            self.options = None;
        }
        Ok((reply.info, reply.value))
    }

    async fn parameters(&mut self) -> Result<Parameters, Status> {
        let mut conn = self.conn.lock().await;
        conn.send_request(Procedure::GetParameters, |w| w.put_word(self.handle))
            .await
            .map_err(io_status)?;
        let reply = GetParametersReply::read(&mut conn.reader).await.map_err(io_status)?;
        drop(conn);
        if reply.status != Status::Good {
            return Err(reply.status);
        }
        self.depth = reply.params.depth;
        Ok(reply.params)
    }

    async fn start(&mut self) -> Result<(), Status> {
        if self.data.is_some() {
            debug!("scan already in progress");
            return Err(Status::Inval);
        }
        self.swap.reset();

        let mut conn = self.conn.lock().await;
        conn.send_request(Procedure::Start, |w| w.put_word(self.handle))
            .await
            .map_err(io_status)?;
        let reply = loop {
            let reply = StartReply::read(&mut conn.reader).await.map_err(io_status)?;
            match reply.resource_to_authorize {
                Some(resource) => {
                    answer_challenge(&mut conn, &self.host, &self.auth, &resource)
                        .await
                        .map_err(io_status)?;
                }
                None => break reply,
            }
        };
        let peer = conn.peer();
        drop(conn);

        if reply.status != Status::Good {
            return Err(reply.status);
        }
        self.server_big_endian = reply.byte_order != LITTLE_ENDIAN_MAGIC;
        let port = u16::try_from(reply.port).map_err(|_| Status::IoError)?;
        let addr = SocketAddr::new(peer.ip(), port);
        debug!(%addr, big_endian = self.server_big_endian, "connecting data channel");

        let stream = TcpStream::connect(addr).await.map_err(|err| {
            warn!(%addr, error = %err, "data connection failed");
            Status::IoError
        })?;
        let (read_half, write_half) = stream.into_split();
        // We only read; dropping the write half half-closes the socket.
        drop(write_half);
        self.data = Some(DataStream::new(read_half));
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Status> {
        if buf.is_empty() {
            return Ok(0);
        }
        let swap_active = self.swap_active();
        if swap_active {
            // A byte already in the right order is delivered before any
            // further socket traffic, so the frame's last byte cannot get
            // stuck behind an EOF.
            if let Some(left) = self.swap.left.take() {
                buf[0] = left;
                return Ok(1);
            }
        }
        loop {
            let result = match self.data.as_mut() {
                Some(data) => data.read(buf).await,
                None => {
                    debug!("no data connection, scan cancelled?");
                    return Err(Status::Cancelled);
                }
            };
            let n = match result {
                Ok(n) => n,
                Err(status) => {
                    self.data = None;
                    return Err(status);
                }
            };
            if !swap_active {
                return Ok(n);
            }
            let delivered = swap_chunk(&mut self.swap, buf, n);
            if delivered > 0 {
                return Ok(delivered);
            }
            // The whole chunk became a hang-over; read on.
        }
    }

    async fn cancel(&mut self) {
        let mut conn = self.conn.lock().await;
        if let Err(err) = conn.call_word_ack(Procedure::Cancel, self.handle).await {
            warn!(error = %err, "cancel rpc failed");
        }
        drop(conn);
        self.data = None;
        self.swap.reset();
    }

    async fn set_io_mode(&mut self, _non_blocking: bool) -> Result<(), Status> {
        // Reads are always multiplexed by the runtime; just mirror the
        // handle state checks.
        if self.data.is_some() {
            Ok(())
        } else {
            Err(Status::Inval)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_names_split_into_host_and_device() {
        assert_eq!(split_device_name("remote:test:0"), Some(("remote", "test:0")));
        assert_eq!(split_device_name("remote"), Some(("remote", "")));
        assert_eq!(split_device_name("[::1]:test:0"), Some(("::1", "test:0")));
        assert_eq!(split_device_name("[::1]"), Some(("::1", "")));
        assert_eq!(split_device_name("[::1"), None);
    }
}
