//! Authorization round trips between the net backend and the daemon.

use std::io::Write;

use md5::{Digest, Md5};
use sane_net::backend::{auth_channel, AuthReceiver, Credentials};
use sane_net::{Backend, ServerConfig, Status};
use tests_e2e::common::TestServer;

fn md5_response(salt: &str, password: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("$MD5${hex}")
}

/// Answer challenges with an MD5 digest computed from the embedded salt.
fn answer_with_digest(mut rx: AuthReceiver, username: &str, password: &str) {
    let (username, password) = (username.to_owned(), password.to_owned());
    tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            let Some((_, salt)) = request.resource.split_once("$MD5$") else {
                continue;
            };
            let _ = request.reply.send(Credentials {
                username: username.clone(),
                password: md5_response(salt, &password),
            });
        }
    });
}

fn write_users_file(dir: &std::path::Path, line: &str) {
    let mut f = std::fs::File::create(dir.join("saned.users")).unwrap();
    writeln!(f, "{line}").unwrap();
}

/// The daemon gates the `test` resource; a client with the right digest
/// gets through, one with the wrong password does not, and the session
/// survives both outcomes.
#[tokio::test]
#[serial_test::serial]
async fn md5_challenge_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    write_users_file(dir.path(), "bob:secret:test");
    std::env::set_var("SANE_CONFIG_DIR", dir.path());

    let server = TestServer::spawn(ServerConfig::default()).await;

    // Correct digest: the open succeeds.
    let (auth_tx, auth_rx) = auth_channel();
    answer_with_digest(auth_rx, "bob", "secret");
    let mut backend = server.client(auth_tx);
    let dev = backend.open(&server.device_name()).await.unwrap();
    dev.close().await;

    // Wrong password: ACCESS_DENIED, connection still usable.
    let (auth_tx, auth_rx) = auth_channel();
    answer_with_digest(auth_rx, "bob", "wrong");
    let mut backend = server.client(auth_tx);
    let err = backend.open(&server.device_name()).await.err();
    assert_eq!(err, Some(Status::AccessDenied));
    let devices = backend.devices(true).await.unwrap();
    assert_eq!(devices.len(), 1);

    std::env::remove_var("SANE_CONFIG_DIR");
}

/// Plaintext replies are accepted too.
#[tokio::test]
#[serial_test::serial]
async fn plaintext_credentials_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    write_users_file(dir.path(), "alice:hunter2:test");
    std::env::set_var("SANE_CONFIG_DIR", dir.path());

    let server = TestServer::spawn(ServerConfig::default()).await;
    let (auth_tx, auth_rx) = auth_channel();
    let creds = Credentials { username: "alice".into(), password: "hunter2".into() };
    let mut rx: AuthReceiver = auth_rx;
    tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            let _ = request.reply.send(creds.clone());
        }
    });
    let mut backend = server.client(auth_tx);
    let dev = backend.open(&server.device_name()).await.unwrap();
    dev.close().await;

    std::env::remove_var("SANE_CONFIG_DIR");
}

/// A refused challenge (frontend gone) surfaces as ACCESS_DENIED rather
/// than a protocol wedge.
#[tokio::test]
#[serial_test::serial]
async fn refused_challenge_is_denied_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    write_users_file(dir.path(), "bob:secret:test");
    std::env::set_var("SANE_CONFIG_DIR", dir.path());

    let server = TestServer::spawn(ServerConfig::default()).await;
    let (auth_tx, auth_rx) = auth_channel();
    // Drop every request without answering.
    let mut rx: AuthReceiver = auth_rx;
    tokio::spawn(async move { while rx.recv().await.is_some() {} });
    let mut backend = server.client(auth_tx);
    let err = backend.open(&server.device_name()).await.err();
    assert_eq!(err, Some(Status::AccessDenied));

    std::env::remove_var("SANE_CONFIG_DIR");
}
