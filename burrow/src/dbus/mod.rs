//! D-Bus proxy policy finalisation and bus address handling.

pub(crate) mod proxy;

use std::path::PathBuf;

use burrow_proto::{Absolute, BusConfig};

/// Errors produced while finalising a bus proxy policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum BusError {
    /// An interface name in the policy is not well-formed.
    #[error("invalid interface name {0:?}")]
    Interface(String),
    /// A bus address string could not be parsed.
    #[error("invalid bus address {0:?}")]
    Address(String),
}

/// One finalised upstream/downstream bus pairing.
#[derive(Debug, Clone)]
pub struct BusFinal {
    /// Upstream bus address the proxy connects to.
    pub upstream: String,
    /// Per-instance socket the proxy listens on.
    pub socket: Absolute,
    /// Filter policy.
    pub config: BusConfig,
}

/// Full xdg-dbus-proxy invocation, session bus plus optional system bus.
#[derive(Debug, Clone)]
pub struct ProxySpec {
    /// Session bus pairing; always present.
    pub session: BusFinal,
    /// System bus pairing; the system bus is only proxied when set.
    pub system: Option<BusFinal>,
}

impl ProxySpec {
    /// Produces the full proxy argv, session fragment first.
    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::new();
        self.session
            .config
            .append_args(&self.session.upstream, &self.session.socket, &mut args);
        if let Some(system) = &self.system {
            system
                .config
                .append_args(&system.upstream, &system.socket, &mut args);
        }
        args
    }

    /// Listener socket pathnames, for dangling-socket cleanup.
    pub fn sockets(&self) -> Vec<PathBuf> {
        let mut s = vec![self.session.socket.as_path().to_path_buf()];
        if let Some(system) = &self.system {
            s.push(system.socket.as_path().to_path_buf());
        }
        s
    }
}

/// Checks every interface name referenced by `config`.
///
/// A name may end in `.*`; the remainder must contain at least one dot
/// separating non-empty elements.
pub(crate) fn validate_interfaces(config: &BusConfig) -> Result<(), BusError> {
    for name in config.interfaces() {
        let trimmed = name.strip_suffix(".*").unwrap_or(name);
        if trimmed.is_empty()
            || !trimmed.contains('.')
            || trimmed.starts_with('.')
            || trimmed.ends_with('.')
        {
            return Err(BusError::Interface(name.to_owned()));
        }
    }
    Ok(())
}

/// One entry of a D-Bus server address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AddressEntry {
    /// Transport name before the colon.
    pub transport: String,
    /// Decoded key/value pairs.
    pub pairs: Vec<(String, String)>,
}

/// Parses a D-Bus server address per the specification's
/// semicolon/comma syntax with %XX escapes.
pub(crate) fn parse_address(addr: &str) -> Result<Vec<AddressEntry>, BusError> {
    let malformed = || BusError::Address(addr.to_owned());
    let mut entries = Vec::new();
    for part in addr.split(';') {
        if part.is_empty() {
            continue;
        }
        let (transport, rest) = part.split_once(':').ok_or_else(malformed)?;
        let mut pairs = Vec::new();
        for pair in rest.split(',') {
            if pair.is_empty() {
                continue;
            }
            let (key, value) = pair.split_once('=').ok_or_else(malformed)?;
            if key.is_empty() {
                return Err(malformed());
            }
            pairs.push((key.to_owned(), unescape(value).ok_or_else(malformed)?));
        }
        entries.push(AddressEntry {
            transport: transport.to_owned(),
            pairs,
        });
    }
    if entries.is_empty() {
        return Err(malformed());
    }
    Ok(entries)
}

/// Decodes %XX escapes in an address value.
fn unescape(value: &str) -> Option<String> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = std::str::from_utf8(bytes.get(i + 1..i + 3)?).ok()?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// Host socket pathnames referenced by a bus address, used for path
/// hiding.
pub(crate) fn socket_paths(addr: &str) -> Vec<PathBuf> {
    let Ok(entries) = parse_address(addr) else {
        return Vec::new();
    };
    entries
        .iter()
        .filter(|e| e.transport == "unix")
        .flat_map(|e| e.pairs.iter())
        .filter(|(k, _)| k == "path")
        .map(|(_, v)| PathBuf::from(v))
        .collect()
}
