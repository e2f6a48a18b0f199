#![forbid(unsafe_code)]

//! Per-resource authorization against a `<backend>.users` credentials
//! file.
//!
//! Each line of the file is `user:password:resource`. A missing file or
//! an unlisted resource grants access. A listed resource produces the
//! challenge `<resource>$MD5$<salt>`; the peer answers either with the
//! plaintext password or with `$MD5$` followed by the hex digest of
//! `md5(salt || password)`. Credentials are read from the file on every
//! check and never cached.

use md5::{Digest, Md5};
use rand::distr::Alphanumeric;
use rand::Rng;
use tracing::{debug, warn};

use crate::backend::{request_credentials, AuthSender, Credentials, MAX_CREDENTIAL_LEN};
use crate::config::{find_config_file, read_config_lines};
use crate::proto::Status;

/// Marker introducing a salt in a challenge and a digest in a reply.
pub const MD5_MARKER: &str = "$MD5$";

const SALT_NOISE_LEN: usize = 8;

/// One `user:password:resource` line.
#[derive(Debug, Clone, PartialEq, Eq)]
struct UserLine {
    username: String,
    password: String,
    resource: String,
}

fn parse_line(line: &str) -> Option<UserLine> {
    let (username, rest) = line.split_once(':')?;
    let (password, resource) = rest.split_once(':')?;
    Some(UserLine {
        username: username.to_owned(),
        password: password.to_owned(),
        resource: resource.to_owned(),
    })
}

fn load_users(backend: &str) -> Option<Vec<UserLine>> {
    let path = find_config_file(&format!("{backend}.users"))?;
    match read_config_lines(&path) {
        Ok(lines) => Some(lines.iter().filter_map(|l| parse_line(l)).collect()),
        Err(err) => {
            warn!(backend, error = %err, "could not read credentials file");
            None
        }
    }
}

/// Printable salt derived from the PID, the wall clock and random noise.
fn make_salt() -> String {
    let pid = std::process::id();
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let noise: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(SALT_NOISE_LEN)
        .map(char::from)
        .collect();
    format!("{pid:x}{now:x}{noise}")
}

fn md5_hex(salt: &str, password: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(32);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn verify(users: &[UserLine], resource: &str, salt: &str, reply: &Credentials) -> bool {
    if reply.username.len() > MAX_CREDENTIAL_LEN || reply.password.len() > MAX_CREDENTIAL_LEN {
        return false;
    }
    users.iter().any(|line| {
        if line.resource != resource || line.username != reply.username {
            return false;
        }
        match reply.password.strip_prefix(MD5_MARKER) {
            Some(digest) => digest.eq_ignore_ascii_case(&md5_hex(salt, &line.password)),
            None => line.password == reply.password,
        }
    })
}

/// Check authorization for `resource` on behalf of `backend`.
///
/// The challenge is relayed to the frontend through `auth`; the reply is
/// matched against the credentials file as described in the module
/// documentation.
pub async fn authorize(resource: &str, backend: &str, auth: &AuthSender) -> Status {
    let Some(users) = load_users(backend) else {
        debug!(backend, resource, "no credentials file, access granted");
        return Status::Good;
    };
    if !users.iter().any(|line| line.resource == resource) {
        debug!(backend, resource, "resource not gated, access granted");
        return Status::Good;
    }

    let salt = make_salt();
    let challenge = format!("{resource}{MD5_MARKER}{salt}");
    let Some(reply) = request_credentials(auth, &challenge).await else {
        debug!(backend, resource, "frontend refused the challenge");
        return Status::AccessDenied;
    };

    if verify(&users, resource, &salt, &reply) {
        debug!(backend, resource, user = %reply.username, "access granted");
        Status::Good
    } else {
        warn!(backend, resource, user = %reply.username, "access denied");
        Status::AccessDenied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{auth_channel, AuthRequest};
    use std::io::Write;

    fn users(content: &str) -> Vec<UserLine> {
        content.lines().filter_map(parse_line).collect()
    }

    fn creds(username: &str, password: &str) -> Credentials {
        Credentials { username: username.into(), password: password.into() }
    }

    #[test]
    fn plaintext_reply_matches_its_line() {
        let users = users("bob:secret:test:0\nalice:hunter2:test:1\n");
        assert!(verify(&users, "test:0", "salt", &creds("bob", "secret")));
        assert!(!verify(&users, "test:0", "salt", &creds("bob", "wrong")));
        assert!(!verify(&users, "test:0", "salt", &creds("alice", "hunter2")));
    }

    #[test]
    fn resource_field_may_contain_colons() {
        let users = users("bob:secret:net:remote:test:0\n");
        assert!(verify(&users, "net:remote:test:0", "s", &creds("bob", "secret")));
    }

    #[test]
    fn digest_reply_matches_md5_of_salt_and_password() {
        let users = users("bob:secret:test:0\n");
        let digest = md5_hex("abcdefgh", "secret");
        let reply = creds("bob", &format!("$MD5${digest}"));
        assert!(verify(&users, "test:0", "abcdefgh", &reply));
        let wrong = creds("bob", "$MD5$00000000000000000000000000000000");
        assert!(!verify(&users, "test:0", "abcdefgh", &wrong));
    }

    #[test]
    fn md5_digest_is_the_reference_value() {
        // md5("abcdefgh" || "secret")
        assert_eq!(md5_hex("abcdefgh", "secret"), "e235c2acc44241490044ae62cb34b79f");
    }

    #[test]
    fn oversized_credentials_are_rejected() {
        let users = users("bob:secret:test:0\n");
        let long = "x".repeat(MAX_CREDENTIAL_LEN + 1);
        assert!(!verify(&users, "test:0", "s", &creds(&long, "secret")));
    }

    #[test]
    fn salts_are_printable_and_unique() {
        let a = make_salt();
        let b = make_salt();
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    async fn answer_with(mut rx: crate::backend::AuthReceiver, creds: Credentials) {
        if let Some(AuthRequest { reply, .. }) = rx.recv().await {
            let _ = reply.send(creds);
        }
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn missing_users_file_grants() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("SANE_CONFIG_DIR", dir.path());
        let (tx, _rx) = auth_channel();
        assert_eq!(authorize("test:0", "missing-backend", &tx).await, Status::Good);
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn gated_resource_requires_matching_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = std::fs::File::create(dir.path().join("gated.users")).unwrap();
        writeln!(f, "bob:secret:test:0").unwrap();
        std::env::set_var("SANE_CONFIG_DIR", dir.path());

        let (tx, rx) = auth_channel();
        let answer = tokio::spawn(answer_with(rx, creds("bob", "secret")));
        assert_eq!(authorize("test:0", "gated", &tx).await, Status::Good);
        answer.await.unwrap();

        let (tx, rx) = auth_channel();
        let answer = tokio::spawn(answer_with(rx, creds("bob", "nope")));
        assert_eq!(authorize("test:0", "gated", &tx).await, Status::AccessDenied);
        answer.await.unwrap();

        // Unlisted resources stay open.
        let (tx, _rx) = auth_channel();
        assert_eq!(authorize("test:9", "gated", &tx).await, Status::Good);
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn challenge_carries_resource_and_salt() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = std::fs::File::create(dir.path().join("probe.users")).unwrap();
        writeln!(f, "bob:secret:test:0").unwrap();
        std::env::set_var("SANE_CONFIG_DIR", dir.path());

        let (tx, mut rx) = auth_channel();
        let check = tokio::spawn(async move { authorize("test:0", "probe", &tx).await });
        let request = rx.recv().await.unwrap();
        let (resource, salt) = request.resource.split_once(MD5_MARKER).unwrap();
        assert_eq!(resource, "test:0");
        assert!(!salt.is_empty());

        let digest = md5_hex(salt, "secret");
        let _ = request
            .reply
            .send(creds("bob", &format!("{MD5_MARKER}{digest}")));
        assert_eq!(check.await.unwrap(), Status::Good);
    }
}
