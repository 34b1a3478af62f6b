//! Declarative sandbox configuration.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::enablement::Enablement;
use crate::path::Absolute;

/// Upper bound on username length, one above the longest accepted name.
pub const LOGIN_NAME_MAX: usize = 256;

/// Default interval between interrupting the initial container process
/// and killing the container.
pub const WAIT_DELAY_DEFAULT: Duration = Duration::from_secs(5);

/// Hard cap on the configured wait delay.
pub const WAIT_DELAY_MAX: Duration = Duration::from_secs(30);

/// Username given to the sandbox account when the caller does not set one.
pub const USERNAME_FALLBACK: &str = "chronos";

/// Errors produced by [`Config::validate`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// Identity out of the 0..=9999 range.
    #[error("identity {0} out of range")]
    IdentityRange(i32),
    /// Username failed the POSIX adduser pattern or length check.
    #[error("invalid user name {0:?}")]
    Username(String),
    /// Home directory not set.
    #[error("invalid path to home directory")]
    Home,
    /// Shell not set.
    #[error("invalid shell path")]
    Shell,
    /// Program path not set.
    #[error("invalid program path")]
    Path,
}

/// A declarative request to launch one sandboxed program.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Reverse-DNS application id, used for D-Bus ownership and the
    /// Wayland security context. May be empty.
    pub id: String,

    /// Pathname of the program to run inside the container.
    pub path: Option<Absolute>,
    /// Program arguments; defaults to `[path]` when empty.
    pub args: Vec<String>,

    /// Subsystems to integrate into the sandbox.
    pub enablements: Enablement,

    /// Bind the outer Wayland socket directly instead of brokering
    /// through security-context-v1. Insecure.
    pub direct_wayland: bool,

    /// Session bus proxy policy; defaulted when the D-Bus enablement is
    /// set and this is `None`.
    pub session_bus: Option<BusConfig>,
    /// System bus proxy policy; the system bus is only proxied when set.
    pub system_bus: Option<BusConfig>,

    /// Username of the sandbox account; falls back to `chronos`.
    pub username: Option<String>,
    /// Home directory inside the container.
    pub home: Option<Absolute>,
    /// Login shell inside the container.
    pub shell: Option<Absolute>,

    /// Selects one of the per-user sandbox accounts, 0 to 9999.
    pub identity: i32,
    /// Names of supplementary groups attached to the shim.
    pub groups: Vec<String>,

    /// Additional host paths to grant the sandbox account access to.
    pub extra_perms: Vec<ExtraPerm>,

    /// Filesystem and isolation parameters; permissive defaults are
    /// synthesised when absent.
    pub container: Option<ContainerSpec>,
}

impl Config {
    /// Checks identity bounds, the effective username, and the presence
    /// of home, shell and program path.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.identity < 0 || self.identity > 9999 {
            return Err(ConfigError::IdentityRange(self.identity));
        }
        let username = self.username.as_deref().unwrap_or(USERNAME_FALLBACK);
        if !valid_username(username) {
            return Err(ConfigError::Username(username.to_owned()));
        }
        if self.home.is_none() {
            return Err(ConfigError::Home);
        }
        if self.shell.is_none() {
            return Err(ConfigError::Shell);
        }
        if self.path.is_none() {
            return Err(ConfigError::Path);
        }
        Ok(())
    }
}

/// Checks `name` against the POSIX adduser pattern
/// `^[a-z_][a-z0-9_-]*$?$` bounded by [`LOGIN_NAME_MAX`].
pub(crate) fn valid_username(name: &str) -> bool {
    if name.is_empty() || name.len() >= LOGIN_NAME_MAX {
        return false;
    }
    let bytes = name.as_bytes();
    if !matches!(bytes[0], b'a'..=b'z' | b'_') {
        return false;
    }
    let tail = if bytes[bytes.len() - 1] == b'$' {
        &bytes[1..bytes.len() - 1]
    } else {
        &bytes[1..]
    };
    tail.iter()
        .all(|b| matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'_' | b'-'))
}

/// Filesystem and isolation parameters of the container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Hostname inside the container.
    pub hostname: Option<String>,

    /// Keep the userns capability inside the container.
    pub userns: bool,
    /// Share the host network namespace.
    pub host_net: bool,
    /// Share the host abstract unix socket namespace.
    pub host_abstract: bool,
    /// Retain the controlling terminal.
    pub tty: bool,
    /// Allow non-native syscall ABIs.
    pub multiarch: bool,
    /// Relax the seccomp filter for development tooling.
    pub devel: bool,
    /// Pass host devices through instead of a private devtmpfs.
    pub device: bool,
    /// Map the caller's real uid/gid into the container instead of the
    /// overflow ids.
    pub map_real_uid: bool,
    /// Omit the extended seccomp preset for compatibility.
    pub seccomp_compat: bool,

    /// Interval between interrupt and kill at shutdown; clamped to
    /// [`WAIT_DELAY_MAX`], defaulted to [`WAIT_DELAY_DEFAULT`].
    pub wait_delay: Option<Duration>,

    /// Declarative mounts applied in order. A first entry targeting `/`
    /// is the root special case.
    pub filesystem: Vec<FilesystemEntry>,

    /// Environment inside the container; prep ops add to this set.
    pub env: BTreeMap<String, String>,
}

impl ContainerSpec {
    /// Wait delay with bounds and default enforced.
    pub fn effective_wait_delay(&self) -> Duration {
        match self.wait_delay {
            None => WAIT_DELAY_DEFAULT,
            Some(d) if d.is_zero() => WAIT_DELAY_DEFAULT,
            Some(d) if d > WAIT_DELAY_MAX => WAIT_DELAY_MAX,
            Some(d) => d,
        }
    }
}

/// One declarative filesystem mutation inside the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilesystemEntry {
    /// Bind a host path.
    Bind {
        /// Host path.
        source: Absolute,
        /// Container path; same as `source` when absent.
        target: Option<Absolute>,
        /// Bind read-write.
        write: bool,
        /// Allow device nodes.
        device: bool,
        /// Skip silently when `source` does not exist.
        optional: bool,
        /// Special handling: auto-root when targeting `/`, auto-etc
        /// when targeting `/etc`.
        special: bool,
    },
    /// Mount a tmpfs.
    Ephemeral {
        /// Container path.
        target: Absolute,
        /// Size limit in bytes, kernel default when zero.
        size: u32,
        /// Directory mode.
        perm: u32,
    },
    /// Create a symlink.
    Link {
        /// Container path of the new link.
        target: Absolute,
        /// Link content.
        link_name: String,
        /// Resolve `link_name` on the host first.
        dereference: bool,
    },
}

impl FilesystemEntry {
    /// Host paths contributed by this entry, used for path hiding.
    pub fn host_paths(&self) -> Vec<&Absolute> {
        match self {
            Self::Bind { source, .. } => vec![source],
            Self::Ephemeral { .. } | Self::Link { .. } => Vec::new(),
        }
    }

    /// Container path this entry targets.
    pub fn target(&self) -> Option<&Absolute> {
        match self {
            Self::Bind { target, source, .. } => Some(target.as_ref().unwrap_or(source)),
            Self::Ephemeral { target, .. } | Self::Link { target, .. } => Some(target),
        }
    }
}

/// An additional ACL grant on a host path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraPerm {
    /// Create the directory at mode 0700 first.
    pub ensure: bool,
    /// Host path to grant access to.
    pub path: Absolute,
    /// Grant read.
    pub read: bool,
    /// Grant write.
    pub write: bool,
    /// Grant execute.
    pub execute: bool,
}

/// xdg-dbus-proxy policy for one bus.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Names visible to the sandbox (`--see`).
    pub see: Vec<String>,
    /// Names the sandbox may talk to (`--talk`).
    pub talk: Vec<String>,
    /// Names the sandbox may own (`--own`).
    pub own: Vec<String>,
    /// Call rules keyed by name (`--call=NAME=RULE`).
    pub call: BTreeMap<String, String>,
    /// Broadcast rules keyed by name (`--broadcast=NAME=RULE`).
    pub broadcast: BTreeMap<String, String>,
    /// Enable proxy logging (`--log`).
    pub log: bool,
    /// Enable filtering (`--filter`).
    pub filter: bool,
}

impl BusConfig {
    /// Default session bus policy: filtering on, D-Bus and notification
    /// talk, portal call/broadcast rules, and id-derived ownership when
    /// `id` is not empty.
    pub fn default_session(id: &str) -> Self {
        let mut c = Self {
            talk: vec![
                "org.freedesktop.DBus".to_owned(),
                "org.freedesktop.Notifications".to_owned(),
            ],
            filter: true,
            ..Self::default()
        };
        c.call
            .insert("org.freedesktop.portal.*".to_owned(), "*".to_owned());
        c.broadcast.insert(
            "org.freedesktop.portal.*".to_owned(),
            "@/org/freedesktop/portal/*".to_owned(),
        );
        if !id.is_empty() {
            c.own.push(format!("{id}.*"));
            c.own.push(format!("org.mpris.MediaPlayer2.{id}.*"));
        }
        c
    }

    /// Appends the xdg-dbus-proxy argv fragment for this bus in fixed
    /// order: address, socket path, `--filter`, `--see`, `--talk`,
    /// `--own`, `--call`, `--broadcast`, `--log`.
    pub fn append_args(&self, upstream: &str, socket: &Absolute, args: &mut Vec<String>) {
        args.push(upstream.to_owned());
        args.push(socket.to_string());
        if self.filter {
            args.push("--filter".to_owned());
        }
        for name in &self.see {
            args.push(format!("--see={name}"));
        }
        for name in &self.talk {
            args.push(format!("--talk={name}"));
        }
        for name in &self.own {
            args.push(format!("--own={name}"));
        }
        for (name, rule) in &self.call {
            args.push(format!("--call={name}={rule}"));
        }
        for (name, rule) in &self.broadcast {
            args.push(format!("--broadcast={name}={rule}"));
        }
        if self.log {
            args.push("--log".to_owned());
        }
    }

    /// Iterates every interface name referenced by this policy.
    pub fn interfaces(&self) -> impl Iterator<Item = &str> {
        self.see
            .iter()
            .chain(&self.talk)
            .chain(&self.own)
            .map(String::as_str)
            .chain(self.call.keys().map(String::as_str))
            .chain(self.broadcast.keys().map(String::as_str))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Config {
        Config {
            home: Some(Absolute::new("/home/chronos").unwrap()),
            shell: Some(Absolute::new("/bin/sh").unwrap()),
            path: Some(Absolute::new("/bin/sh").unwrap()),
            ..Config::default()
        }
    }

    #[test]
    fn identity_bounds() {
        let mut c = minimal();
        c.identity = 0;
        c.validate().unwrap();
        c.identity = 9999;
        c.validate().unwrap();
        c.identity = -1;
        assert_eq!(c.validate(), Err(ConfigError::IdentityRange(-1)));
        c.identity = 10000;
        assert_eq!(c.validate(), Err(ConfigError::IdentityRange(10000)));
    }

    #[test]
    fn username_pattern() {
        assert!(valid_username("chronos"));
        assert!(valid_username("_svc-01"));
        assert!(valid_username("machine$"));
        assert!(!valid_username(""));
        assert!(!valid_username("0day"));
        assert!(!valid_username("Chronos"));
        assert!(!valid_username("has space"));
    }

    #[test]
    fn username_length_boundary() {
        let longest = "a".repeat(LOGIN_NAME_MAX - 1);
        assert!(valid_username(&longest));
        let too_long = "a".repeat(LOGIN_NAME_MAX);
        assert!(!valid_username(&too_long));

        let mut c = minimal();
        c.username = Some(too_long);
        assert!(matches!(c.validate(), Err(ConfigError::Username(_))));
    }

    #[test]
    fn wait_delay_bounds() {
        let mut s = ContainerSpec::default();
        assert_eq!(s.effective_wait_delay(), WAIT_DELAY_DEFAULT);
        s.wait_delay = Some(Duration::from_secs(60));
        assert_eq!(s.effective_wait_delay(), WAIT_DELAY_MAX);
        s.wait_delay = Some(Duration::from_secs(2));
        assert_eq!(s.effective_wait_delay(), Duration::from_secs(2));
    }

    #[test]
    fn session_args_fixed_order() {
        let c = BusConfig::default_session("org.example.App");
        let mut args = Vec::new();
        c.append_args(
            "unix:path=/run/user/1000/bus",
            &Absolute::new("/tmp/burrow.0/i/bus").unwrap(),
            &mut args,
        );
        assert_eq!(
            args,
            vec![
                "unix:path=/run/user/1000/bus",
                "/tmp/burrow.0/i/bus",
                "--filter",
                "--talk=org.freedesktop.DBus",
                "--talk=org.freedesktop.Notifications",
                "--own=org.example.App.*",
                "--own=org.mpris.MediaPlayer2.org.example.App.*",
                "--call=org.freedesktop.portal.*=*",
                "--broadcast=org.freedesktop.portal.*=@/org/freedesktop/portal/*",
            ]
        );
    }
}
