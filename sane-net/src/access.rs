#![forbid(unsafe_code)]

//! Host-based access control for incoming control connections.
//!
//! Rules come from `saned.conf` and `/etc/hosts.equiv`, one per line:
//! `+` admits any host, a literal address admits that address, a
//! `base/cidr` pair admits a subnet, and anything else is treated as a
//! hostname whose resolved addresses are compared against the peer.
//! IPv6 literals are bracketed to keep them apart from `host:port`
//! notation. Loopback peers and the machine's own addresses are always
//! admitted before any rule is consulted.

use std::net::{IpAddr, Ipv6Addr};
use std::str::FromStr;

use ipnet::IpNet;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum RuleParseError {
    #[error("malformed ipv6 literal")]
    UnterminatedBracket,
    #[error("invalid cidr prefix: {0}")]
    BadPrefix(String),
    #[error("empty rule")]
    Empty,
}

/// One parsed access rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostRule {
    /// `+` — any host.
    Any,
    /// A literal peer address.
    Addr(IpAddr),
    /// A `base/cidr` subnet.
    Subnet(IpNet),
    /// A hostname resolved at check time.
    Host(String),
}

impl FromStr for HostRule {
    type Err = RuleParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        if line.is_empty() {
            return Err(RuleParseError::Empty);
        }
        if line == "+" {
            return Ok(HostRule::Any);
        }

        let (host_part, prefix) = match line.rsplit_once('/') {
            Some((host, prefix)) => (host, Some(prefix)),
            None => (line, None),
        };

        // IPv6 literals are enclosed in [].
        let host_part = if let Some(stripped) = host_part.strip_prefix('[') {
            stripped.strip_suffix(']').ok_or(RuleParseError::UnterminatedBracket)?
        } else {
            host_part
        };

        match prefix {
            Some(prefix) => {
                let addr: IpAddr = host_part
                    .parse()
                    .map_err(|_| RuleParseError::BadPrefix(line.to_owned()))?;
                let prefix: u8 = prefix
                    .trim()
                    .parse()
                    .map_err(|_| RuleParseError::BadPrefix(line.to_owned()))?;
                let net = IpNet::new(addr, prefix)
                    .map_err(|_| RuleParseError::BadPrefix(line.to_owned()))?;
                Ok(HostRule::Subnet(net))
            }
            None => match host_part.parse::<IpAddr>() {
                Ok(addr) => Ok(HostRule::Addr(addr)),
                Err(_) => Ok(HostRule::Host(host_part.to_owned())),
            },
        }
    }
}

/// The peer address plus, for v4-mapped v6 peers, the unmapped form.
/// Both are tested against every rule.
fn candidate_addrs(peer: IpAddr) -> Vec<IpAddr> {
    match peer {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => vec![peer, IpAddr::V4(v4)],
            None => vec![peer],
        },
        IpAddr::V4(_) => vec![peer],
    }
}

fn is_loopback(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => v6 == Ipv6Addr::LOCALHOST,
    }
}

fn addrs_equal(a: IpAddr, b: IpAddr) -> bool {
    if a == b {
        return true;
    }
    // Compare across families through the v4-mapped form.
    match (a, b) {
        (IpAddr::V6(v6), IpAddr::V4(v4)) | (IpAddr::V4(v4), IpAddr::V6(v6)) => {
            v6.to_ipv4_mapped() == Some(v4)
        }
        _ => false,
    }
}

/// Check whether `peer` may talk to the daemon.
///
/// `local_addrs` are the machine's own resolved addresses; loopback and
/// those are always admitted. Hostname rules resolve via DNS at call
/// time.
pub async fn check_host(peer: IpAddr, local_addrs: &[IpAddr], rules: &[HostRule]) -> bool {
    let candidates = candidate_addrs(peer);

    if candidates.iter().any(|addr| is_loopback(*addr)) {
        debug!(%peer, "loopback peer admitted");
        return true;
    }
    if local_addrs
        .iter()
        .any(|local| candidates.iter().any(|addr| addrs_equal(*addr, *local)))
    {
        debug!(%peer, "peer matches a local address, admitted");
        return true;
    }

    for rule in rules {
        match rule {
            HostRule::Any => {
                debug!(%peer, "admitted by wildcard rule");
                return true;
            }
            HostRule::Addr(addr) => {
                if candidates.iter().any(|c| addrs_equal(*c, *addr)) {
                    debug!(%peer, rule = %addr, "admitted by address rule");
                    return true;
                }
            }
            HostRule::Subnet(net) => {
                if candidates.iter().any(|c| net.contains(c)) {
                    debug!(%peer, rule = %net, "admitted by subnet rule");
                    return true;
                }
            }
            HostRule::Host(name) => match tokio::net::lookup_host((name.as_str(), 0)).await {
                Ok(resolved) => {
                    for sockaddr in resolved {
                        if candidates.iter().any(|c| addrs_equal(*c, sockaddr.ip())) {
                            debug!(%peer, rule = %name, "admitted by hostname rule");
                            return true;
                        }
                    }
                }
                Err(err) => {
                    warn!(rule = %name, error = %err, "hostname rule did not resolve");
                }
            },
        }
    }

    false
}

/// Convenience used by the data-channel identity check: are the control
/// and data peers the same machine?
pub fn same_peer(control: IpAddr, data: IpAddr) -> bool {
    addrs_equal(control, data)
}
