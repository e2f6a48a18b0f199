#![forbid(unsafe_code)]

//! Configuration file discovery and parsing.
//!
//! Files are plain text, one entry per line; blank lines and lines
//! starting with `#` are ignored. They are looked up along the
//! `SANE_CONFIG_DIR` search path (colon-separated; the current directory
//! and `/etc/sane.d` when unset).

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::access::HostRule;

/// Environment variable overriding the configuration search path.
pub const CONFIG_DIR_VAR: &str = "SANE_CONFIG_DIR";
/// Environment variable listing additional remote hosts for the client.
pub const NET_HOSTS_VAR: &str = "SANE_NET_HOSTS";
/// Environment variable overriding the client connect timeout.
pub const NET_TIMEOUT_VAR: &str = "SANE_NET_TIMEOUT";

const DEFAULT_CONFIG_DIRS: [&str; 2] = [".", "/etc/sane.d"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid {option} value: {value}")]
    BadOption { option: &'static str, value: String },
}

/// Directories searched for configuration files, in order.
pub fn search_dirs() -> Vec<PathBuf> {
    match std::env::var(CONFIG_DIR_VAR) {
        Ok(dirs) if !dirs.is_empty() => dirs.split(':').map(PathBuf::from).collect(),
        _ => DEFAULT_CONFIG_DIRS.iter().map(PathBuf::from).collect(),
    }
}

/// Locate `name` along the search path. Absolute names bypass the search.
pub fn find_config_file(name: &str) -> Option<PathBuf> {
    let name = Path::new(name);
    if name.is_absolute() {
        return name.exists().then(|| name.to_path_buf());
    }
    search_dirs()
        .into_iter()
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.exists())
}

/// Read the meaningful lines of a config file: trimmed, comments and
/// blanks dropped.
pub fn read_config_lines(path: &Path) -> Result<Vec<String>, ConfigError> {
    let text = std::fs::read_to_string(path)
        .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_owned)
        .collect())
}

/// Client-side configuration from `net.conf` and the environment.
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// Remote hosts, in configuration order, without duplicates.
    pub hosts: Vec<String>,
    /// Connect timeout; `None` leaves the OS default in place.
    pub connect_timeout: Option<Duration>,
    /// Control port daemons are expected on.
    pub port: u16,
}

impl Default for NetConfig {
    fn default() -> Self {
        NetConfig {
            hosts: Vec::new(),
            connect_timeout: None,
            port: crate::proto::SANE_PORT,
        }
    }
}

impl NetConfig {
    /// Load `net.conf` (if present) and apply `SANE_NET_HOSTS` /
    /// `SANE_NET_TIMEOUT` overrides.
    pub fn load() -> Self {
        let mut config = NetConfig::default();
        if let Some(path) = find_config_file("net.conf") {
            debug!(path = %path.display(), "reading net configuration");
            match read_config_lines(&path) {
                Ok(lines) => {
                    for line in lines {
                        config.apply_line(&line);
                    }
                }
                Err(err) => warn!(error = %err, "could not read net.conf"),
            }
        }
        if let Ok(hosts) = std::env::var(NET_HOSTS_VAR) {
            for host in split_host_list(&hosts) {
                config.add_host(&host);
            }
        }
        if let Ok(value) = std::env::var(NET_TIMEOUT_VAR) {
            match value.trim().parse::<u64>() {
                Ok(secs) => config.connect_timeout = Some(Duration::from_secs(secs)),
                Err(_) => warn!(%value, "ignoring unparsable timeout override"),
            }
        }
        config
    }

    fn apply_line(&mut self, line: &str) {
        if let Some(rest) = line.strip_prefix("connect_timeout") {
            let Some(value) = rest.trim_start().strip_prefix('=') else {
                warn!(line, "malformed connect_timeout line");
                return;
            };
            match value.trim().parse::<u64>() {
                Ok(secs) => self.connect_timeout = Some(Duration::from_secs(secs)),
                Err(_) => warn!(line, "invalid connect_timeout value"),
            }
            return;
        }
        self.add_host(line);
    }

    /// Register a host, stripping `[ipv6]` brackets and skipping
    /// duplicates.
    pub fn add_host(&mut self, host: &str) {
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host)
            .to_owned();
        if host.is_empty() || self.hosts.contains(&host) {
            return;
        }
        self.hosts.push(host);
    }
}

/// Split a colon-separated host list, keeping bracketed IPv6 literals
/// whole.
pub fn split_host_list(list: &str) -> Vec<String> {
    let mut hosts = Vec::new();
    let mut rest = list;
    while !rest.is_empty() {
        if let Some(stripped) = rest.strip_prefix('[') {
            let Some(end) = stripped.find(']') else {
                warn!(list, "unterminated ipv6 literal in host list");
                break;
            };
            hosts.push(stripped[..end].to_owned());
            rest = &stripped[end + 1..];
            rest = rest.strip_prefix(':').unwrap_or(rest);
        } else {
            let (head, tail) = match rest.find(':') {
                Some(pos) => (&rest[..pos], &rest[pos + 1..]),
                None => (rest, ""),
            };
            if !head.is_empty() {
                hosts.push(head.to_owned());
            }
            rest = tail;
        }
    }
    hosts
}

/// Server-side configuration from `saned.conf`.
#[derive(Debug, Clone, Default)]
pub struct SanedConfig {
    /// Inclusive port range for data connections; `None` lets the OS
    /// pick.
    pub data_port_range: Option<(u16, u16)>,
    /// Host access rules, in file order.
    pub rules: Vec<HostRule>,
}

impl SanedConfig {
    /// Load `saned.conf` plus the access rules of `/etc/hosts.equiv`.
    pub fn load() -> Self {
        let mut config = SanedConfig::default();
        if let Some(path) = find_config_file("saned.conf") {
            debug!(path = %path.display(), "reading saned configuration");
            config.read_file(&path);
        }
        let equiv = Path::new("/etc/hosts.equiv");
        if equiv.exists() {
            config.read_file(equiv);
        }
        config
    }

    fn read_file(&mut self, path: &Path) {
        match read_config_lines(path) {
            Ok(lines) => {
                for line in lines {
                    self.apply_line(&line);
                }
            }
            Err(err) => warn!(error = %err, "could not read server configuration"),
        }
    }

    /// Apply one configuration line: either an `option = value` setting
    /// or a host rule.
    pub fn apply_line(&mut self, line: &str) {
        if line.contains('=') {
            if let Some(rest) = line.strip_prefix("data_portrange") {
                match parse_port_range(rest) {
                    Ok(range) => {
                        debug!(lo = range.0, hi = range.1, "data port range configured");
                        self.data_port_range = Some(range);
                    }
                    Err(err) => warn!(line, error = %err, "ignoring data_portrange"),
                }
            }
            // Any other line with an `=` sign is an (unknown) option, never
            // a host rule.
            return;
        }
        match line.parse::<HostRule>() {
            Ok(rule) => self.rules.push(rule),
            Err(err) => warn!(line, error = %err, "ignoring access rule"),
        }
    }
}

fn parse_port_range(rest: &str) -> Result<(u16, u16), ConfigError> {
    let bad = |value: &str| ConfigError::BadOption {
        option: "data_portrange",
        value: value.to_owned(),
    };
    let value = rest.trim_start().strip_prefix('=').ok_or_else(|| bad(rest))?.trim();
    let (lo, hi) = value.split_once('-').ok_or_else(|| bad(value))?;
    let lo: u16 = lo.trim().parse().map_err(|_| bad(value))?;
    let hi: u16 = hi.trim().parse().map_err(|_| bad(value))?;
    if lo > hi {
        return Err(bad(value));
    }
    Ok((lo, hi))
}

/// Numeric debug level of `SANE_DEBUG_<BACKEND>`, when set.
pub fn debug_level(backend: &str) -> Option<u8> {
    let var = format!("SANE_DEBUG_{}", backend.to_uppercase());
    std::env::var(var).ok()?.trim().parse().ok()
}

/// Name of this machine, from the kernel or the environment.
pub fn local_hostname() -> Option<String> {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .map(|s| s.trim().to_owned())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .filter(|s| !s.is_empty())
}

/// Addresses the local hostname resolves to, used to always grant the
/// server's own addresses.
pub async fn local_addresses() -> Vec<IpAddr> {
    let mut addrs = Vec::new();
    if let Some(hostname) = local_hostname() {
        if let Ok(resolved) = tokio::net::lookup_host((hostname.as_str(), 0)).await {
            addrs.extend(resolved.map(|sa| sa.ip()));
        }
    }
    addrs
}
