//! Per-connection request loop, authorization relay and scan pump.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::access;
use crate::auth;
use crate::backend::{AuthReceiver, AuthSender, Backend, Credentials, Device};
use crate::proto::{
    AuthorizeRequest, ControlOptionReply, ControlOptionRequest, GetDevicesReply,
    GetParametersReply, Info, OpenReply, OptionDescriptorsReply, Parameters, Procedure,
    StartReply, Status, BIG_ENDIAN_MAGIC, LITTLE_ENDIAN_MAGIC, RECORD_TERMINATOR,
};
use crate::server::handle::HandleTable;
use crate::server::{ServerConfig, ServerError};
use crate::wire::{WireError, WireReader, WireWriter};

/// Payload bytes read from the driver per data record.
const DATA_CHUNK: usize = 8192 - 4;

/// The resource namespace of the daemon's own credentials file.
const SANED_BACKEND: &str = "saned";

fn native_byte_order() -> i32 {
    if cfg!(target_endian = "little") {
        LITTLE_ENDIAN_MAGIC
    } else {
        BIG_ENDIAN_MAGIC
    }
}

/// What the request loop does after a dispatched request.
enum Flow {
    Continue,
    Quit,
}

/// How the pump loop ended.
enum PumpOutcome {
    /// Scan over; `close_after` when a CLOSE arrived mid-scan.
    Finished { close_after: bool },
    /// EXIT arrived mid-scan.
    Quit,
}

/// Verdict of a mid-scan control RPC.
enum MidScan {
    Continue,
    /// The scan was cancelled; drain the driver without further control
    /// traffic.
    Cancelled,
    CloseAfter,
    Quit,
}

/// State of one control connection after a successful INIT.
pub(crate) struct Session<B: Backend> {
    reader: WireReader<OwnedReadHalf>,
    writer: WireWriter<OwnedWriteHalf>,
    peer: SocketAddr,
    local: SocketAddr,
    backend: B,
    handles: HandleTable<B::Device>,
    auth_tx: AuthSender,
    auth_rx: AuthReceiver,
    config: std::sync::Arc<ServerConfig>,
}

impl<B: Backend> Session<B> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        reader: WireReader<OwnedReadHalf>,
        writer: WireWriter<OwnedWriteHalf>,
        peer: SocketAddr,
        local: SocketAddr,
        backend: B,
        auth_tx: AuthSender,
        auth_rx: AuthReceiver,
        config: std::sync::Arc<ServerConfig>,
    ) -> Self {
        Session {
            reader,
            writer,
            peer,
            local,
            backend,
            handles: HandleTable::new(),
            auth_tx,
            auth_rx,
            config,
        }
    }

    /// Drive the request loop until the client exits, the connection
    /// drops, or the watchdog fires.
    pub(crate) async fn run(&mut self) -> Result<(), ServerError> {
        loop {
            self.reader.begin_message();
            let word = match timeout(self.config.idle_timeout, self.reader.read_word()).await {
                Err(_) => return Err(ServerError::Watchdog),
                Ok(Err(WireError::Eof)) => {
                    debug!(peer = %self.peer, "client disconnected");
                    return Ok(());
                }
                Ok(word) => word?,
            };
            let proc = Procedure::from_word(word)?;
            debug!(peer = %self.peer, ?proc, "request");
            match self.dispatch(proc).await? {
                Flow::Continue => {}
                Flow::Quit => return Ok(()),
            }
        }
    }

    async fn dispatch(&mut self, proc: Procedure) -> Result<Flow, ServerError> {
        match proc {
            Procedure::GetDevices => self.handle_get_devices().await.map(|_| Flow::Continue),
            Procedure::Open => self.handle_open().await.map(|_| Flow::Continue),
            Procedure::Close => {
                let handle = self.reader.read_word().await?;
                // Dropping the device cancels any active scan.
                if self.handles.take(handle).is_none() {
                    debug!(handle, "close on unknown handle");
                }
                self.send_ack().await.map(|_| Flow::Continue)
            }
            Procedure::GetOptionDescriptors => {
                self.handle_get_option_descriptors().await.map(|_| Flow::Continue)
            }
            Procedure::ControlOption => self.handle_control_option().await.map(|_| Flow::Continue),
            Procedure::GetParameters => self.handle_get_parameters().await.map(|_| Flow::Continue),
            Procedure::Start => self.handle_start().await,
            Procedure::Cancel => {
                let handle = self.reader.read_word().await?;
                if let Some(device) = self.handles.get_mut(handle) {
                    device.cancel().await;
                }
                self.send_ack().await.map(|_| Flow::Continue)
            }
            Procedure::Exit => {
                self.handles.clear();
                Ok(Flow::Quit)
            }
            Procedure::Init | Procedure::Authorize => {
                Err(ServerError::Protocol("unexpected procedure in request loop"))
            }
        }
    }

    async fn send(
        &mut self,
        encode: impl FnOnce(&mut WireWriter<OwnedWriteHalf>),
    ) -> Result<(), ServerError> {
        encode(&mut self.writer);
        self.writer.flush().await?;
        Ok(())
    }

    async fn send_ack(&mut self) -> Result<(), ServerError> {
        self.send(|w| w.put_word(0)).await
    }

    async fn handle_get_devices(&mut self) -> Result<(), ServerError> {
        let result = {
            let Session { backend, auth_rx, .. } = self;
            drive_denying(auth_rx, backend.devices(true)).await
        };
        let reply = match result {
            Ok(devices) => GetDevicesReply { status: Status::Good, devices },
            Err(status) => GetDevicesReply { status, devices: Vec::new() },
        };
        self.send(|w| reply.write(w)).await
    }

    async fn handle_open(&mut self) -> Result<(), ServerError> {
        let Some(name) = self.reader.read_string().await? else {
            warn!("open without a device name");
            let reply = OpenReply { status: Status::Inval, ..OpenReply::default() };
            return self.send(|w| reply.write(w)).await;
        };

        // The daemon's own gate names the backend, not the full device.
        let resource = if name.is_empty() {
            let devices = {
                let Session { backend, auth_rx, .. } = self;
                drive_denying(auth_rx, backend.devices(true)).await
            };
            match devices {
                Ok(devices) if !devices.is_empty() => devices[0].name.clone(),
                _ => {
                    debug!("open of default device with nothing to open");
                    let reply = OpenReply { status: Status::Inval, ..OpenReply::default() };
                    return self.send(|w| reply.write(w)).await;
                }
            }
        } else {
            name.clone()
        };
        let resource = resource.split(':').next().unwrap_or(&resource).to_owned();

        let idle = self.config.idle_timeout;
        let partial = |w: &mut WireWriter<OwnedWriteHalf>, challenge: &str| {
            OpenReply {
                status: Status::Good,
                handle: 0,
                resource_to_authorize: Some(challenge.to_owned()),
            }
            .write(w)
        };

        let gate = {
            let Session { reader, writer, auth_rx, auth_tx, .. } = self;
            let check = auth::authorize(&resource, SANED_BACKEND, auth_tx);
            drive_authorized(reader, writer, auth_rx, idle, partial, check).await?
        };
        if gate != Status::Good {
            warn!(peer = %self.peer, resource, "access to resource denied");
            let reply = OpenReply { status: Status::AccessDenied, ..OpenReply::default() };
            return self.send(|w| reply.write(w)).await;
        }

        let opened = {
            let Session { reader, writer, auth_rx, backend, .. } = self;
            drive_authorized(reader, writer, auth_rx, idle, partial, backend.open(&name)).await?
        };
        let reply = match opened {
            Ok(device) => {
                let handle = self.handles.insert(device) as i32;
                info!(peer = %self.peer, device = %name, handle, "device opened");
                OpenReply { status: Status::Good, handle, resource_to_authorize: None }
            }
            Err(status) => {
                debug!(device = %name, %status, "open failed");
                OpenReply { status, ..OpenReply::default() }
            }
        };
        self.send(|w| reply.write(w)).await
    }

    async fn handle_get_option_descriptors(&mut self) -> Result<(), ServerError> {
        let handle = self.reader.read_word().await?;
        let result = {
            let Session { handles, auth_rx, .. } = self;
            let device = handles
                .get_mut(handle)
                .ok_or(ServerError::Protocol("unknown handle"))?;
            drive_denying(auth_rx, device.descriptors()).await
        };
        let reply = OptionDescriptorsReply { descriptors: result.unwrap_or_default() };
        self.send(|w| reply.write(w)).await
    }

    async fn handle_control_option(&mut self) -> Result<(), ServerError> {
        let req = ControlOptionRequest::read(&mut self.reader).await?;
        let idle = self.config.idle_timeout;
        let partial = |w: &mut WireWriter<OwnedWriteHalf>, challenge: &str| {
            ControlOptionReply::challenge(challenge).write(w)
        };
        let result = {
            let Session { reader, writer, auth_rx, handles, .. } = self;
            let device = handles
                .get_mut(req.handle)
                .ok_or(ServerError::Protocol("unknown handle"))?;
            let option = usize::try_from(req.option).unwrap_or(usize::MAX);
            let call = device.control(option, req.action, req.value.clone());
            drive_authorized(reader, writer, auth_rx, idle, partial, call).await?
        };
        let reply = match result {
            Ok((info, value)) => ControlOptionReply {
                status: Status::Good,
                info,
                value_type: req.value_type,
                value_size: req.value_size,
                value,
                resource_to_authorize: None,
            },
            Err(status) => ControlOptionReply {
                status,
                info: Info::empty(),
                value_type: req.value_type,
                value_size: req.value_size,
                value: req.value,
                resource_to_authorize: None,
            },
        };
        self.send(|w| reply.write(w)).await
    }

    async fn handle_get_parameters(&mut self) -> Result<(), ServerError> {
        let handle = self.reader.read_word().await?;
        let result = {
            let Session { handles, auth_rx, .. } = self;
            let device = handles
                .get_mut(handle)
                .ok_or(ServerError::Protocol("unknown handle"))?;
            drive_denying(auth_rx, device.parameters()).await
        };
        let reply = match result {
            Ok(params) => GetParametersReply { status: Status::Good, params },
            Err(status) => GetParametersReply { status, params: Parameters::default() },
        };
        self.send(|w| reply.write(w)).await
    }

    async fn handle_start(&mut self) -> Result<Flow, ServerError> {
        let handle = self.reader.read_word().await?;
        let byte_order = native_byte_order();
        let Some(mut device) = self.handles.take(handle) else {
            return Err(ServerError::Protocol("start on unknown handle"));
        };
        let handle_idx = handle as usize;

        eprintln!("DEBUG: binding data listener");
        let listener = match self.bind_data_listener().await {
            Ok(listener) => listener,
            Err(err) => {
                warn!(error = %err, "could not bind a data port");
                self.handles.put_back(handle_idx, device);
                let reply = StartReply {
                    status: Status::IoError,
                    port: 0,
                    byte_order,
                    resource_to_authorize: None,
                };
                return self.send(|w| reply.write(w)).await.map(|_| Flow::Continue);
            }
        };
        let port = match listener.local_addr() {
            Ok(addr) => addr.port(),
            Err(err) => return Err(err.into()),
        };
        debug!(port, "data listener bound");
        eprintln!("DEBUG: listener bound on port {}", port);

        let idle = self.config.idle_timeout;
        let partial = |w: &mut WireWriter<OwnedWriteHalf>, challenge: &str| {
            StartReply {
                status: Status::Good,
                port: 0,
                byte_order: 0,
                resource_to_authorize: Some(challenge.to_owned()),
            }
            .write(w)
        };
        eprintln!("DEBUG: calling device.start()");
        let started = {
            let Session { reader, writer, auth_rx, .. } = self;
            drive_authorized(reader, writer, auth_rx, idle, partial, device.start()).await
        };
        eprintln!("DEBUG: device.start() returned {:?}", started.is_ok());
        let started = match started {
            Ok(result) => result,
            Err(err) => {
                self.handles.put_back(handle_idx, device);
                return Err(err);
            }
        };

        let reply = StartReply {
            status: match started {
                Ok(()) => Status::Good,
                Err(status) => status,
            },
            port: port as i32,
            byte_order,
            resource_to_authorize: None,
        };
        eprintln!("DEBUG: sending start reply, port={}", port);
        self.send(|w| reply.write(w)).await?;
        eprintln!("DEBUG: start reply sent");
        if let Err(status) = started {
            debug!(%status, "driver refused to start");
            self.handles.put_back(handle_idx, device);
            return Ok(Flow::Continue);
        }

        // Exactly one data connection, and only from the control peer.
        eprintln!("DEBUG: waiting for data connection accept");
        let accepted = timeout(idle, listener.accept()).await;
        eprintln!("DEBUG: accept result ok={}", accepted.is_ok());
        drop(listener);
        let data = match accepted {
            Err(_) => {
                device.cancel().await;
                self.handles.put_back(handle_idx, device);
                return Err(ServerError::Watchdog);
            }
            Ok(Err(err)) => {
                device.cancel().await;
                self.handles.put_back(handle_idx, device);
                return Err(err.into());
            }
            Ok(Ok((data, data_peer))) => {
                if !access::same_peer(self.peer.ip(), data_peer.ip()) {
                    warn!(
                        control = %self.peer.ip(),
                        data = %data_peer.ip(),
                        "data connection from a different host, dropping; \
                         configuration problem or attack?"
                    );
                    drop(data);
                    device.cancel().await;
                    self.handles.put_back(handle_idx, device);
                    return Err(ServerError::Protocol("data connection from foreign address"));
                }
                data
            }
        };
        info!(peer = %self.peer, port, "data connection established");

        let outcome = self.pump(handle_idx, &mut device, data).await;
        match outcome {
            Ok(PumpOutcome::Finished { close_after }) => {
                if !close_after {
                    self.handles.put_back(handle_idx, device);
                }
                Ok(Flow::Continue)
            }
            Ok(PumpOutcome::Quit) => Ok(Flow::Quit),
            Err(err) => Err(err),
        }
    }

    async fn bind_data_listener(&self) -> std::io::Result<TcpListener> {
        let ip = self.local.ip();
        let make_socket = || -> std::io::Result<TcpSocket> {
            if ip.is_ipv4() {
                TcpSocket::new_v4()
            } else {
                TcpSocket::new_v6()
            }
        };
        match self.config.data_port_range {
            None => {
                let socket = make_socket()?;
                socket.bind(SocketAddr::new(ip, 0))?;
                socket.listen(1)
            }
            Some((lo, hi)) => {
                for port in lo..=hi {
                    let socket = make_socket()?;
                    if socket.bind(SocketAddr::new(ip, port)).is_ok() {
                        return socket.listen(1);
                    }
                }
                Err(std::io::Error::new(
                    std::io::ErrorKind::AddrInUse,
                    "no free port in the configured data port range",
                ))
            }
        }
    }

    /// Stream the scan to the data connection while staying responsive
    /// to control traffic.
    async fn pump(
        &mut self,
        handle: usize,
        device: &mut B::Device,
        data: TcpStream,
    ) -> Result<PumpOutcome, ServerError> {
        let idle = self.config.idle_timeout;
        // The server never reads from the data socket.
        let (_data_read, mut data_write) = data.into_split();
        let mut chunk = vec![0u8; DATA_CHUNK];
        let mut quit = false;
        let mut close_after = false;
        // After a cancel the control channel is left alone until the
        // driver's read reports the terminal status.
        let mut draining = false;

        enum Event {
            Control(Result<i32, WireError>),
            Device(Result<usize, Status>),
        }

        let terminal = loop {
            let reader = &mut self.reader;
            let event = timeout(idle, async {
                if draining {
                    Event::Device(device.read(&mut chunk).await)
                } else {
                    tokio::select! {
                        word = reader.read_word() => Event::Control(word),
                        result = device.read(&mut chunk) => Event::Device(result),
                    }
                }
            })
            .await
            .map_err(|_| ServerError::Watchdog)?;

            match event {
                Event::Control(word) => {
                    self.reader.begin_message();
                    let proc = Procedure::from_word(word?)?;
                    debug!(?proc, "mid-scan request");
                    match self.pump_request(proc, handle, device).await? {
                        MidScan::Continue => {}
                        MidScan::Cancelled => draining = true,
                        MidScan::CloseAfter => {
                            close_after = true;
                            draining = true;
                        }
                        MidScan::Quit => {
                            quit = true;
                            draining = true;
                        }
                    }
                }
                Event::Device(Ok(0)) => {}
                Event::Device(Ok(n)) => {
                    let write = async {
                        data_write.write_u32(n as u32).await?;
                        data_write.write_all(&chunk[..n]).await
                    };
                    match timeout(idle, write).await {
                        Err(_) => return Err(ServerError::Watchdog),
                        Ok(Err(err)) => {
                            debug!(error = %err, "data connection lost, cancelling scan");
                            device.cancel().await;
                            break Status::Cancelled;
                        }
                        Ok(Ok(())) => {}
                    }
                }
                Event::Device(Err(status)) => break status,
            }
        };

        debug!(%terminal, "scan finished, sending terminator");
        let finish = async {
            data_write.write_u32(RECORD_TERMINATOR).await?;
            data_write.write_u8(terminal.to_word() as u8).await?;
            data_write.shutdown().await
        };
        if let Ok(Err(err)) = timeout(idle, finish).await {
            debug!(error = %err, "terminator not delivered");
        }

        if quit {
            Ok(PumpOutcome::Quit)
        } else {
            Ok(PumpOutcome::Finished { close_after })
        }
    }

    /// Handle an RPC that arrived while a scan is running. Only CANCEL
    /// does real work; device-bound requests answer busy so the control
    /// channel stays in lockstep.
    async fn pump_request(
        &mut self,
        proc: Procedure,
        handle: usize,
        device: &mut B::Device,
    ) -> Result<MidScan, ServerError> {
        match proc {
            Procedure::Cancel => {
                let target = self.reader.read_word().await?;
                let scanning = target as usize == handle;
                if scanning {
                    device.cancel().await;
                } else if let Some(other) = self.handles.get_mut(target) {
                    other.cancel().await;
                }
                self.send_ack().await?;
                Ok(if scanning { MidScan::Cancelled } else { MidScan::Continue })
            }
            Procedure::Close => {
                let target = self.reader.read_word().await?;
                let scanning = target as usize == handle;
                if scanning {
                    device.cancel().await;
                } else {
                    self.handles.take(target);
                }
                self.send_ack().await?;
                Ok(if scanning { MidScan::CloseAfter } else { MidScan::Continue })
            }
            Procedure::Exit => {
                device.cancel().await;
                self.handles.clear();
                Ok(MidScan::Quit)
            }
            Procedure::GetDevices => {
                self.handle_get_devices().await?;
                Ok(MidScan::Continue)
            }
            Procedure::GetOptionDescriptors => {
                let target = self.reader.read_word().await?;
                let reply = if target as usize == handle {
                    let Session { auth_rx, .. } = self;
                    OptionDescriptorsReply {
                        descriptors: drive_denying(auth_rx, device.descriptors())
                            .await
                            .unwrap_or_default(),
                    }
                } else {
                    OptionDescriptorsReply { descriptors: Vec::new() }
                };
                self.send(|w| reply.write(w)).await?;
                Ok(MidScan::Continue)
            }
            Procedure::GetParameters => {
                let target = self.reader.read_word().await?;
                let reply = if target as usize == handle {
                    let Session { auth_rx, .. } = self;
                    match drive_denying(auth_rx, device.parameters()).await {
                        Ok(params) => GetParametersReply { status: Status::Good, params },
                        Err(status) => {
                            GetParametersReply { status, params: Parameters::default() }
                        }
                    }
                } else {
                    GetParametersReply {
                        status: Status::DeviceBusy,
                        params: Parameters::default(),
                    }
                };
                self.send(|w| reply.write(w)).await?;
                Ok(MidScan::Continue)
            }
            Procedure::ControlOption => {
                // One scan per session; no option traffic while it runs.
                let req = ControlOptionRequest::read(&mut self.reader).await?;
                let reply = ControlOptionReply {
                    status: Status::DeviceBusy,
                    info: Info::empty(),
                    value_type: req.value_type,
                    value_size: req.value_size,
                    value: req.value,
                    resource_to_authorize: None,
                };
                self.send(|w| reply.write(w)).await?;
                Ok(MidScan::Continue)
            }
            Procedure::Open => {
                let _name = self.reader.read_string().await?;
                let reply = OpenReply { status: Status::DeviceBusy, ..OpenReply::default() };
                self.send(|w| reply.write(w)).await?;
                Ok(MidScan::Continue)
            }
            Procedure::Start => {
                let _target = self.reader.read_word().await?;
                let reply = StartReply {
                    status: Status::DeviceBusy,
                    port: 0,
                    byte_order: native_byte_order(),
                    resource_to_authorize: None,
                };
                self.send(|w| reply.write(w)).await?;
                Ok(MidScan::Continue)
            }
            Procedure::Init | Procedure::Authorize => {
                Err(ServerError::Protocol("unexpected procedure during scan"))
            }
        }
    }
}

/// Await a driver operation while relaying authorization challenges.
///
/// A challenge produces a partial reply carrying `resource_to_authorize`;
/// the next incoming RPC must be AUTHORIZE, whose credentials flow back
/// to the driver through the request's oneshot channel, followed by the
/// word ack. The driver then resumes and the caller sends the final
/// reply.
async fn drive_authorized<T>(
    reader: &mut WireReader<OwnedReadHalf>,
    writer: &mut WireWriter<OwnedWriteHalf>,
    auth_rx: &mut AuthReceiver,
    idle: Duration,
    partial: impl Fn(&mut WireWriter<OwnedWriteHalf>, &str),
    fut: impl Future<Output = T>,
) -> Result<T, ServerError> {
    tokio::pin!(fut);
    let mut auth_open = true;
    loop {
        tokio::select! {
            result = &mut fut => return Ok(result),
            request = auth_rx.recv(), if auth_open => {
                let Some(request) = request else {
                    auth_open = false;
                    continue;
                };
                debug!(resource = %request.resource, "relaying authorization challenge");
                partial(writer, &request.resource);
                writer.flush().await?;

                reader.begin_message();
                let word = timeout(idle, reader.read_word())
                    .await
                    .map_err(|_| ServerError::Watchdog)??;
                if Procedure::from_word(word)? != Procedure::Authorize {
                    return Err(ServerError::Protocol(
                        "expected AUTHORIZE after a challenge",
                    ));
                }
                let answer = AuthorizeRequest::read(reader).await?;
                if answer.resource.as_deref() != Some(request.resource.as_str()) {
                    debug!(
                        got = answer.resource.as_deref().unwrap_or(""),
                        expected = %request.resource,
                        "authorization names a different resource"
                    );
                }
                let creds = Credentials {
                    username: answer.username.unwrap_or_default(),
                    password: answer.password.unwrap_or_default(),
                };
                let _ = request.reply.send(creds);
                writer.put_word(0);
                writer.flush().await?;
            }
        }
    }
}

/// Await a driver operation during which authorization is not allowed;
/// challenges are refused without touching the wire.
async fn drive_denying<T>(auth_rx: &mut AuthReceiver, fut: impl Future<Output = T>) -> T {
    tokio::pin!(fut);
    let mut auth_open = true;
    loop {
        tokio::select! {
            result = &mut fut => return result,
            request = auth_rx.recv(), if auth_open => {
                match request {
                    Some(request) => {
                        warn!(
                            resource = %request.resource,
                            "authorization requested during a non-authorizable call"
                        );
                        // Dropping the reply channel denies the request.
                    }
                    None => auth_open = false,
                }
            }
        }
    }
}
