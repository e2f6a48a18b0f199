//! Wire-level protocol conformance against a live daemon.

use sane_net::proto::{OpenReply, Procedure, StartReply, Status};
use sane_net::ServerConfig;
use tests_e2e::common::{EmptyBackend, RawClient, TestServer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// The INIT exchange, byte for byte.
#[tokio::test]
async fn handshake_bytes_are_exact() {
    let server = TestServer::spawn(ServerConfig::default()).await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    #[rustfmt::skip]
    let request: [u8; 14] = [
        0x00, 0x00, 0x00, 0x00,             // proc INIT
        0x01, 0x00, 0x00, 0x03,             // version code 1.0, build 3
        0x00, 0x00, 0x00, 0x06,             // string length including NUL
        b'a', b'l',
    ];
    stream.write_all(&request).await.unwrap();
    stream.write_all(b"ice\0").await.unwrap();

    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x03]);
}

/// An empty device list is a GOOD status and a zero count.
#[tokio::test]
async fn empty_device_list_bytes() {
    let server = TestServer::spawn_with(ServerConfig::default(), |_| EmptyBackend).await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    let mut init = Vec::new();
    init.extend_from_slice(&[0, 0, 0, 0]);
    init.extend_from_slice(&0x0100_0003i32.to_be_bytes());
    init.extend_from_slice(&[0, 0, 0, 0]); // null username
    stream.write_all(&init).await.unwrap();
    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply).await.unwrap();

    stream.write_all(&[0, 0, 0, 1]).await.unwrap(); // proc GET_DEVICES
    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0, 0, 0, 0, 0, 0, 0, 0]);
}

/// A second INIT on the same connection is a protocol error; the server
/// hangs up.
#[tokio::test]
async fn second_init_terminates_the_connection() {
    let server = TestServer::spawn(ServerConfig::default()).await;
    let mut client = RawClient::connect(server.addr).await;
    let reply = client.init("alice").await;
    assert_eq!(reply.status, Status::Good);

    client
        .request(Procedure::Init, |w| {
            w.put_word(0x0100_0003);
            w.put_string(Some("alice"));
        })
        .await;
    assert!(client.reader.read_word().await.is_err());
}

/// Clients with a foreign major version are refused.
#[tokio::test]
async fn wrong_major_version_is_refused() {
    let server = TestServer::spawn(ServerConfig::default()).await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    let mut init = Vec::new();
    init.extend_from_slice(&[0, 0, 0, 0]);
    init.extend_from_slice(&0x0200_0003i32.to_be_bytes()); // major 2
    init.extend_from_slice(&[0, 0, 0, 0]);
    stream.write_all(&init).await.unwrap();

    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply).await.unwrap();
    // INVAL, version code zeroed.
    assert_eq!(reply, [0, 0, 0, 4, 0, 0, 0, 0]);
}

/// Two opens yield distinct handles; a close frees the first.
#[tokio::test]
async fn open_handles_are_unique() {
    let server = TestServer::spawn(ServerConfig::default()).await;
    let mut client = RawClient::connect(server.addr).await;
    client.init("alice").await;

    client.request(Procedure::Open, |w| w.put_string(Some("test:0"))).await;
    let first = OpenReply::read(&mut client.reader).await.unwrap();
    assert_eq!(first.status, Status::Good);

    client.request(Procedure::Open, |w| w.put_string(Some("test:0"))).await;
    let second = OpenReply::read(&mut client.reader).await.unwrap();
    assert_eq!(second.status, Status::Good);
    assert_ne!(first.handle, second.handle);

    client.request(Procedure::Close, |w| w.put_word(first.handle)).await;
    assert_eq!(client.reader.read_word().await.unwrap(), 0);
}

/// Unknown device names surface the driver's INVAL.
#[tokio::test]
async fn open_of_unknown_device_fails() {
    let server = TestServer::spawn(ServerConfig::default()).await;
    let mut client = RawClient::connect(server.addr).await;
    client.init("alice").await;

    client.request(Procedure::Open, |w| w.put_string(Some("frobnicator:9"))).await;
    let reply = OpenReply::read(&mut client.reader).await.unwrap();
    assert_eq!(reply.status, Status::Inval);
}

/// With a configured data port range, every advertised data port falls
/// inside it.
#[tokio::test]
async fn data_port_honors_the_configured_range() {
    let range = (10910u16, 10919u16);
    let config = ServerConfig { data_port_range: Some(range), ..ServerConfig::default() };
    let server = TestServer::spawn(config).await;
    let mut client = RawClient::connect(server.addr).await;
    client.init("alice").await;

    client.request(Procedure::Open, |w| w.put_string(Some("test:0"))).await;
    let open = OpenReply::read(&mut client.reader).await.unwrap();
    assert_eq!(open.status, Status::Good);

    client.request(Procedure::Start, |w| w.put_word(open.handle)).await;
    let start = StartReply::read(&mut client.reader).await.unwrap();
    assert_eq!(start.status, Status::Good);
    let port = start.port as u16;
    assert!(
        (range.0..=range.1).contains(&port),
        "port {port} outside {range:?}"
    );

    // Drain the scan so the session does not linger on the accept.
    let mut data = TcpStream::connect((server.addr.ip(), port)).await.unwrap();
    let mut sink = Vec::new();
    let _ = data.read_to_end(&mut sink).await;

    client.request(Procedure::Exit, |_| {}).await;
    server.stop().await;
}
