//! mDNS publication of the daemon (feature `mdns`).

use thiserror::Error;
use tracing::info;

use crate::proto::{version_code, PROTOCOL_VERSION, VERSION_MAJOR, VERSION_MINOR};

const SERVICE_TYPE: &str = "_sane-port._tcp";
const SERVICE_NAME: &str = "saned";

#[derive(Debug, Error)]
pub enum MdnsError {
    #[error("mdns responder failed: {0}")]
    Responder(std::io::Error),
}

/// Keeps the `_sane-port._tcp` advertisement alive; dropping it
/// withdraws the record.
pub struct Advertisement {
    _service: libmdns::Service,
    _responder: libmdns::Responder,
}

/// Publish the daemon on `port` with a `protovers` TXT record. Name
/// collisions are renamed by the responder.
pub fn publish(port: u16) -> Result<Advertisement, MdnsError> {
    let responder = libmdns::Responder::new().map_err(MdnsError::Responder)?;
    let protovers = format!(
        "protovers={:x}",
        version_code(VERSION_MAJOR, VERSION_MINOR, PROTOCOL_VERSION)
    );
    let service = responder.register(
        SERVICE_TYPE.to_owned(),
        SERVICE_NAME.to_owned(),
        port,
        &[&protovers],
    );
    info!(port, txt = %protovers, "mdns service registered");
    Ok(Advertisement { _service: service, _responder: responder })
}
