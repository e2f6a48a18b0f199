//! E2E test helpers: loopback daemons, raw wire clients and canned
//! backends.

use std::net::SocketAddr;
use std::sync::Arc;

use sane_net::backend::testdev::TestBackend;
use sane_net::backend::{AuthReceiver, AuthSender, Backend, Credentials};
use sane_net::proto::{
    version_code, DeviceInfo, InitReply, InitRequest, Procedure, Status, PROTOCOL_VERSION,
    VERSION_MAJOR, VERSION_MINOR,
};
use sane_net::wire::{WireReader, WireWriter};
use sane_net::{NetBackend, NetConfig, ServerConfig};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// A daemon serving the synthetic test device on an ephemeral loopback
/// port.
pub struct TestServer {
    pub addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl TestServer {
    pub async fn spawn(config: ServerConfig) -> Self {
        Self::spawn_with(config, |_| TestBackend::new()).await
    }

    pub async fn spawn_with<B, F>(config: ServerConfig, factory: F) -> Self
    where
        B: Backend + Sync + 'static,
        B::Device: Sync,
        F: Fn(AuthSender) -> B + Send + Sync + Clone + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind loopback");
        let addr = listener.local_addr().expect("local addr");
        let (shutdown, mut rx) = watch::channel(false);
        let config = Arc::new(config);
        let task = tokio::spawn(async move {
            sane_net::run_with_listeners(vec![listener], config, factory, &mut rx)
                .await
                .expect("server run");
        });
        TestServer { addr, shutdown, task }
    }

    /// Net backend configured to reach this server.
    pub fn client(&self, auth: AuthSender) -> NetBackend {
        let config = NetConfig {
            hosts: vec![self.addr.ip().to_string()],
            connect_timeout: None,
            port: self.addr.port(),
        };
        NetBackend::with_config(config, auth)
    }

    /// Device name of the synthetic scanner as seen through the client.
    pub fn device_name(&self) -> String {
        format!("{}:test:0", self.addr.ip())
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

/// Raw wire-level client for byte-exact protocol checks.
pub struct RawClient {
    pub reader: WireReader<OwnedReadHalf>,
    pub writer: WireWriter<OwnedWriteHalf>,
    pub addr: SocketAddr,
}

impl RawClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (read_half, write_half) = stream.into_split();
        RawClient {
            reader: WireReader::new(read_half),
            writer: WireWriter::new(write_half),
            addr,
        }
    }

    /// Perform the INIT exchange with the current protocol version.
    pub async fn init(&mut self, username: &str) -> InitReply {
        self.writer.put_word(Procedure::Init.to_word());
        InitRequest {
            version_code: version_code(VERSION_MAJOR, VERSION_MINOR, PROTOCOL_VERSION),
            username: Some(username.to_owned()),
        }
        .write(&mut self.writer);
        self.writer.flush().await.expect("flush init");
        self.reader.begin_message();
        InitReply::read(&mut self.reader).await.expect("init reply")
    }

    pub async fn request(&mut self, proc: Procedure, encode: impl FnOnce(&mut WireWriter<OwnedWriteHalf>)) {
        self.writer.put_word(proc.to_word());
        encode(&mut self.writer);
        self.writer.flush().await.expect("flush request");
        self.reader.begin_message();
    }
}

/// Backend advertising no devices at all.
#[derive(Clone, Default)]
pub struct EmptyBackend;

impl Backend for EmptyBackend {
    type Device = sane_net::backend::testdev::TestDevice;

    fn version(&self) -> i32 {
        version_code(VERSION_MAJOR, VERSION_MINOR, 1)
    }

    async fn devices(&mut self, _local_only: bool) -> Result<Vec<DeviceInfo>, Status> {
        Ok(Vec::new())
    }

    async fn open(&mut self, _name: &str) -> Result<Self::Device, Status> {
        Err(Status::Inval)
    }
}

/// Answer every incoming credential request with the same credentials.
pub fn answer_auth_with(mut rx: AuthReceiver, username: &str, password: &str) -> JoinHandle<()> {
    let creds = Credentials { username: username.to_owned(), password: password.to_owned() };
    tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            let _ = request.reply.send(creds.clone());
        }
    })
}

/// Collect a whole frame from a device, returning the bytes read.
pub async fn read_to_eof<D: sane_net::Device>(device: &mut D) -> (Vec<u8>, Status) {
    let mut out = Vec::new();
    let mut buf = [0u8; 997];
    loop {
        match device.read(&mut buf).await {
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(status) => return (out, status),
        }
    }
}
