//! Control connection to one remote daemon.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::client::NetError;
use crate::proto::{
    version_build, version_major, InitReply, InitRequest, Procedure, Status, PROTOCOL_VERSION,
    PROTOCOL_VERSION_MIN, VERSION_MAJOR, VERSION_MINOR,
};
use crate::proto::version_code;
use crate::wire::{WireError, WireReader, WireWriter};

/// An established control connection with a completed INIT exchange.
pub(crate) struct Connection {
    pub(crate) reader: WireReader<OwnedReadHalf>,
    pub(crate) writer: WireWriter<OwnedWriteHalf>,
    peer: SocketAddr,
    remote_version: i32,
}

impl Connection {
    /// Resolve `host`, connect (IPv6 candidates first), and negotiate
    /// INIT.
    pub(crate) async fn establish(
        host: &str,
        port: u16,
        username: Option<&str>,
        connect_timeout: Option<Duration>,
    ) -> Result<Self, NetError> {
        let mut addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|source| NetError::Resolve { host: host.to_owned(), source })?
            .collect();
        addrs.sort_by_key(|addr| !addr.is_ipv6());

        let mut last: Option<NetError> = None;
        for addr in addrs {
            debug!(host, %addr, "attempting connection");
            let attempt = TcpStream::connect(addr);
            let result = match connect_timeout {
                Some(limit) => match tokio::time::timeout(limit, attempt).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(host, %addr, "connect timed out");
                        last = Some(NetError::ConnectTimeout { host: host.to_owned() });
                        continue;
                    }
                },
                None => attempt.await,
            };
            match result {
                Ok(stream) => return Self::negotiate(host, stream, username).await,
                Err(source) => {
                    warn!(host, %addr, error = %source, "connect failed");
                    last = Some(NetError::Connect { host: host.to_owned(), source });
                }
            }
        }
        Err(last.unwrap_or_else(|| NetError::Resolve {
            host: host.to_owned(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses"),
        }))
    }

    async fn negotiate(
        host: &str,
        stream: TcpStream,
        username: Option<&str>,
    ) -> Result<Self, NetError> {
        if let Err(err) = stream.set_nodelay(true) {
            warn!(host, error = %err, "could not enable TCP_NODELAY");
        }
        let peer = stream.peer_addr().map_err(WireError::Io)?;
        let (read_half, write_half) = stream.into_split();
        let mut conn = Connection {
            reader: WireReader::new(read_half),
            writer: WireWriter::new(write_half),
            peer,
            remote_version: 0,
        };

        let request = InitRequest {
            version_code: version_code(VERSION_MAJOR, VERSION_MINOR, PROTOCOL_VERSION),
            username: username.map(str::to_owned),
        };
        conn.send_request(Procedure::Init, |w| request.write(w)).await?;
        let reply = InitReply::read(&mut conn.reader).await?;

        if reply.status != Status::Good {
            return Err(NetError::InitFailed { host: host.to_owned(), status: reply.status });
        }
        let build = version_build(reply.version_code);
        if version_major(reply.version_code) != VERSION_MAJOR
            || build < PROTOCOL_VERSION_MIN
            || build > PROTOCOL_VERSION
        {
            return Err(NetError::VersionMismatch {
                host: host.to_owned(),
                code: reply.version_code,
            });
        }
        conn.remote_version = reply.version_code;
        info!(host, %peer, version = format_args!("{:#010x}", reply.version_code), "connected");
        Ok(conn)
    }

    /// Encode one request (procedure word plus body) and flush it; resets
    /// the reply decode budget.
    pub(crate) async fn send_request(
        &mut self,
        proc: Procedure,
        encode: impl FnOnce(&mut WireWriter<OwnedWriteHalf>),
    ) -> Result<(), WireError> {
        self.writer.put_word(proc.to_word());
        encode(&mut self.writer);
        self.writer.flush().await?;
        self.reader.begin_message();
        Ok(())
    }

    /// RPC whose reply is a bare word ack (CLOSE, CANCEL, AUTHORIZE).
    pub(crate) async fn call_word_ack(
        &mut self,
        proc: Procedure,
        word: i32,
    ) -> Result<i32, WireError> {
        self.send_request(proc, |w| w.put_word(word)).await?;
        self.reader.read_word().await
    }

    pub(crate) fn peer(&self) -> SocketAddr {
        self.peer
    }

    #[allow(dead_code)]
    pub(crate) fn remote_version(&self) -> i32 {
        self.remote_version
    }
}
