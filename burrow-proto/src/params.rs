//! Low-level container parameters consumed by the shim.

use std::collections::BTreeMap;
use std::ops::{BitOr, BitOrAssign};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::path::Absolute;

/// Flags modifying a [`MountOp::Bind`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindFlags(u8);

impl BindFlags {
    /// Bind read-write instead of read-only.
    pub const WRITE: Self = Self(1 << 0);
    /// Do not mask device nodes.
    pub const DEVICE: Self = Self(1 << 1);
    /// Succeed silently when the source does not exist.
    pub const OPTIONAL: Self = Self(1 << 2);
    /// Create the source directory before binding.
    pub const ENSURE: Self = Self(1 << 3);

    /// Whether every bit of `other` is set in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for BindFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for BindFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Syscall filter preset groups selected for the container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeccompPresets(u8);

impl SeccompPresets {
    /// Extended denials beyond the baseline filter.
    pub const EXT: Self = Self(1 << 0);
    /// Deny namespace creation.
    pub const DENY_NS: Self = Self(1 << 1);
    /// Deny TIOCSTI and other terminal injection.
    pub const DENY_TTY: Self = Self(1 << 2);
    /// Deny ptrace and perf.
    pub const DENY_DEVEL: Self = Self(1 << 3);

    /// Every preset group.
    pub const STRICT: Self = Self(0b1111);

    /// Whether every bit of `other` is set in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns `self` with every bit of `other` removed.
    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl BitOr for SeccompPresets {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for SeccompPresets {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Flags modifying syscall filter behaviour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeccompFlags(u8);

impl SeccompFlags {
    /// Allow non-native syscall ABIs.
    pub const ALLOW_MULTIARCH: Self = Self(1 << 0);

    /// Whether every bit of `other` is set in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for SeccompFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// One mount-table mutation applied inside the container, in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MountOp {
    /// Mount procfs at the target.
    Proc {
        /// Container mount point.
        target: Absolute,
    },
    /// Set up a private devtmpfs with the standard device nodes.
    Dev {
        /// Container mount point.
        target: Absolute,
        /// Bind /dev/mqueue inside.
        mqueue: bool,
        /// Leave the filesystem writable after setup.
        write: bool,
    },
    /// Mount a size- and mode-constrained tmpfs.
    Tmpfs {
        /// Container mount point.
        target: Absolute,
        /// Size limit in bytes, kernel default when zero.
        size: u32,
        /// Directory mode.
        perm: u32,
    },
    /// Bind a host path into the container.
    Bind {
        /// Host path.
        source: Absolute,
        /// Container path.
        target: Absolute,
        /// Behaviour flags.
        flags: BindFlags,
    },
    /// Remount an existing mount point with new flags.
    Remount {
        /// Container mount point.
        target: Absolute,
        /// MS_* flags to apply.
        flags: u64,
    },
    /// Create a symlink.
    Link {
        /// Container path of the new link.
        target: Absolute,
        /// Link content.
        link_name: String,
        /// Resolve `link_name` on the host before entering the container.
        dereference: bool,
    },
    /// Write a byte buffer to a file at the target.
    Place {
        /// Container path.
        target: Absolute,
        /// File content.
        data: Vec<u8>,
    },
    /// Bind the host root, skipping paths shadowed by later ops.
    Root {
        /// Host directory to use as the container root.
        source: Absolute,
        /// Behaviour flags.
        flags: BindFlags,
    },
    /// Replicate /etc with mutable overrides.
    Etc {
        /// Host /etc.
        source: Absolute,
        /// Intermediate directory name under the private tmpfs.
        prefix: String,
    },
    /// Create a directory.
    Mkdir {
        /// Container path.
        target: Absolute,
        /// Directory mode.
        perm: u32,
    },
}

/// Everything the shim needs to start the container, delivered through
/// the setup pipe.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerParams {
    /// Initial working directory.
    pub dir: Option<Absolute>,
    /// Pathname of the initial process.
    pub path: Option<Absolute>,
    /// Arguments of the initial process.
    pub args: Vec<String>,
    /// Flattened `KEY=VALUE` environment, sorted by key.
    pub env: Vec<String>,

    /// Uid inside the container.
    pub uid: u32,
    /// Gid inside the container.
    pub gid: u32,
    /// Hostname, host value retained when `None`.
    pub hostname: Option<String>,

    /// Keep the controlling terminal.
    pub retain_session: bool,
    /// Share the host network namespace.
    pub host_net: bool,
    /// Share the host abstract unix socket namespace.
    pub host_abstract: bool,
    /// Replay cancellation to the initial process as SIGTERM.
    pub forward_cancel: bool,

    /// Interval between interrupt and kill at shutdown.
    pub wait_delay: Duration,

    /// Syscall filter preset groups.
    pub seccomp_presets: SeccompPresets,
    /// Syscall filter flags.
    pub seccomp_flags: SeccompFlags,

    /// Mount-table mutations applied in order.
    pub ops: Vec<MountOp>,
}

impl ContainerParams {
    /// Appends a bind op.
    pub fn bind(&mut self, source: Absolute, target: Absolute, flags: BindFlags) -> &mut Self {
        self.ops.push(MountOp::Bind {
            source,
            target,
            flags,
        });
        self
    }

    /// Appends a tmpfs op.
    pub fn tmpfs(&mut self, target: Absolute, size: u32, perm: u32) -> &mut Self {
        self.ops.push(MountOp::Tmpfs { target, size, perm });
        self
    }

    /// Appends a procfs op.
    pub fn proc(&mut self, target: Absolute) -> &mut Self {
        self.ops.push(MountOp::Proc { target });
        self
    }

    /// Appends a symlink op.
    pub fn link(&mut self, target: Absolute, link_name: impl Into<String>) -> &mut Self {
        self.ops.push(MountOp::Link {
            target,
            link_name: link_name.into(),
            dereference: false,
        });
        self
    }

    /// Appends a file placement op.
    pub fn place(&mut self, target: Absolute, data: Vec<u8>) -> &mut Self {
        self.ops.push(MountOp::Place { target, data });
        self
    }

    /// Appends a remount op.
    pub fn remount(&mut self, target: Absolute, flags: u64) -> &mut Self {
        self.ops.push(MountOp::Remount { target, flags });
        self
    }

    /// Appends a mkdir op.
    pub fn mkdir(&mut self, target: Absolute, perm: u32) -> &mut Self {
        self.ops.push(MountOp::Mkdir { target, perm });
        self
    }

    /// Flattens `env` into sorted `KEY=VALUE` strings, rejecting keys
    /// containing `=`.
    pub fn set_env(&mut self, env: &BTreeMap<String, String>) -> Result<(), String> {
        let mut flat = Vec::with_capacity(env.len());
        for (k, v) in env {
            if k.contains('=') {
                return Err(k.clone());
            }
            flat.push(format!("{k}={v}"));
        }
        // BTreeMap iteration is already key-sorted.
        self.env = flat;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_flatten_sorted() {
        let mut p = ContainerParams::default();
        let mut env = BTreeMap::new();
        env.insert("TERM".to_owned(), "xterm".to_owned());
        env.insert("HOME".to_owned(), "/home/chronos".to_owned());
        p.set_env(&env).unwrap();
        assert_eq!(p.env, vec!["HOME=/home/chronos", "TERM=xterm"]);
    }

    #[test]
    fn env_rejects_equals_in_key() {
        let mut p = ContainerParams::default();
        let mut env = BTreeMap::new();
        env.insert("BAD=KEY".to_owned(), "v".to_owned());
        assert_eq!(p.set_env(&env), Err("BAD=KEY".to_owned()));
    }

    #[test]
    fn preset_composition() {
        let strict = SeccompPresets::STRICT;
        assert!(strict.contains(SeccompPresets::EXT));
        assert!(strict.contains(SeccompPresets::DENY_DEVEL));
        let compat = strict.difference(SeccompPresets::EXT);
        assert!(!compat.contains(SeccompPresets::EXT));
        assert!(compat.contains(SeccompPresets::DENY_NS));
    }

    #[test]
    fn bind_flags() {
        let f = BindFlags::WRITE | BindFlags::DEVICE;
        assert!(f.contains(BindFlags::WRITE));
        assert!(!f.contains(BindFlags::OPTIONAL));
    }
}
