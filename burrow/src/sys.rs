//! Syscall dispatcher mediating every host mutation.
//!
//! The reversible op library and the preparation ops never touch the
//! host directly; everything goes through [`Syscalls`] so the whole
//! setup sequence can be exercised against [`StubSyscalls`] in tests.

use std::fmt;
use std::io;
use std::path::Path;

use crate::acl::AclPerms;
use crate::dbus::ProxySpec;

/// Subset of stat output the op library consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStatus {
    /// Full `st_mode`, type and permission bits.
    pub mode: u32,
    /// Whether the file is a directory.
    pub is_dir: bool,
}

/// Handle on an established Wayland security context.
///
/// Dropping or closing the handle closes the close-fd pipe, which makes
/// the compositor remove the brokered listener.
pub trait WaylandSession: fmt::Debug {
    /// Detaches the security context from the compositor.
    fn close(&mut self) -> io::Result<()>;
}

/// Handle on a running xdg-dbus-proxy instance.
pub trait BusProxy: fmt::Debug {
    /// Blocks until the proxy signals readiness on its status pipe.
    fn wait_ready(&mut self) -> io::Result<()>;
    /// Asks the proxy to shut down by closing the status pipe.
    fn stop(&mut self);
    /// Reaps the proxy and removes its dangling listener sockets.
    fn wait(&mut self) -> io::Result<()>;
    /// Buffered proxy output for fault diagnosis.
    fn output(&self) -> String;
}

/// Request to broker one Wayland socket through security-context-v1.
#[derive(Debug, Clone)]
pub struct WaylandRequest {
    /// Compositor socket to connect to.
    pub display: std::path::PathBuf,
    /// Pathname the brokered listener is bound at.
    pub bind: std::path::PathBuf,
    /// Sandbox engine name passed to the compositor.
    pub engine: String,
    /// Application id of the confined client.
    pub app_id: String,
    /// Per-instance id of the confined client.
    pub instance_id: String,
}

/// Host syscall surface used by the op library and preparation ops.
pub trait Syscalls {
    /// Real uid of the calling process.
    fn getuid(&self) -> u32;
    /// Effective uid of the calling process.
    fn geteuid(&self) -> u32;
    /// Real gid of the calling process.
    fn getgid(&self) -> u32;
    /// Looks up an environment variable.
    fn lookup_env(&self, key: &str) -> Option<String>;
    /// Resolves a group name to its gid.
    fn lookup_group_id(&self, name: &str) -> io::Result<Option<u32>>;
    /// Kernel overflow uid, 65534 on standard systems.
    fn overflow_uid(&self) -> u32;
    /// Kernel overflow gid.
    fn overflow_gid(&self) -> u32;
    /// 128 bits of entropy for instance ids.
    fn random_id(&self) -> io::Result<[u8; 16]>;

    /// Creates a directory with an exact mode, unaffected by umask.
    fn mkdir(&self, path: &Path, perm: u32) -> io::Result<()>;
    /// Changes file permission bits.
    fn chmod(&self, path: &Path, perm: u32) -> io::Result<()>;
    /// Stats a pathname.
    fn stat(&self, path: &Path) -> io::Result<FileStatus>;
    /// Removes a file, symlink, or empty directory.
    fn remove(&self, path: &Path) -> io::Result<()>;
    /// Creates a hard link at `link` pointing to `target`.
    fn hard_link(&self, target: &Path, link: &Path) -> io::Result<()>;
    /// Reads a file, failing with EISDIR on directories and ENOMEM when
    /// the size exceeds `limit`.
    fn read_file_bounded(&self, path: &Path, limit: usize) -> io::Result<Vec<u8>>;
    /// Resolves every symlink component of a pathname.
    fn eval_symlinks(&self, path: &Path) -> io::Result<std::path::PathBuf>;

    /// Updates or strips the ACL_USER entry for `uid` on `path`.
    fn acl_update(&self, path: &Path, uid: u32, perms: AclPerms) -> io::Result<()>;
    /// Inserts or deletes a ServerInterpreted localuser host entry on
    /// the X server at `display`.
    fn change_hosts(&self, display: &str, insert: bool, name: &str) -> io::Result<()>;
    /// Establishes a Wayland security context and brokered listener.
    fn wayland_attach(&self, req: &WaylandRequest) -> io::Result<Box<dyn WaylandSession>>;
    /// Spawns xdg-dbus-proxy for the given policy.
    fn dbus_spawn(&self, spec: &ProxySpec) -> io::Result<Box<dyn BusProxy>>;
}

/// Dispatcher performing real host mutations.
#[derive(Debug, Clone, Copy, Default)]
pub struct Direct;

impl Syscalls for Direct {
    fn getuid(&self) -> u32 {
        nix::unistd::getuid().as_raw()
    }

    fn geteuid(&self) -> u32 {
        nix::unistd::geteuid().as_raw()
    }

    fn getgid(&self) -> u32 {
        nix::unistd::getgid().as_raw()
    }

    fn lookup_env(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }

    fn lookup_group_id(&self, name: &str) -> io::Result<Option<u32>> {
        match nix::unistd::Group::from_name(name) {
            Ok(g) => Ok(g.map(|g| g.gid.as_raw())),
            Err(errno) => Err(io::Error::from_raw_os_error(errno as i32)),
        }
    }

    fn overflow_uid(&self) -> u32 {
        proc_overflow("/proc/sys/kernel/overflowuid")
    }

    fn overflow_gid(&self) -> u32 {
        proc_overflow("/proc/sys/kernel/overflowgid")
    }

    fn random_id(&self) -> io::Result<[u8; 16]> {
        use std::io::Read;
        let mut id = [0u8; 16];
        std::fs::File::open("/dev/urandom")?.read_exact(&mut id)?;
        Ok(id)
    }

    fn mkdir(&self, path: &Path, perm: u32) -> io::Result<()> {
        std::fs::create_dir(path)?;
        self.chmod(path, perm)
    }

    fn chmod(&self, path: &Path, perm: u32) -> io::Result<()> {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(perm))
    }

    fn stat(&self, path: &Path) -> io::Result<FileStatus> {
        use std::os::unix::fs::MetadataExt;
        let meta = std::fs::metadata(path)?;
        Ok(FileStatus {
            mode: meta.mode(),
            is_dir: meta.is_dir(),
        })
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        let meta = std::fs::symlink_metadata(path)?;
        if meta.is_dir() {
            std::fs::remove_dir(path)
        } else {
            std::fs::remove_file(path)
        }
    }

    fn hard_link(&self, target: &Path, link: &Path) -> io::Result<()> {
        std::fs::hard_link(target, link)
    }

    fn read_file_bounded(&self, path: &Path, limit: usize) -> io::Result<Vec<u8>> {
        use std::io::Read;
        let f = std::fs::File::open(path)?;
        if f.metadata()?.is_dir() {
            return Err(io::Error::from_raw_os_error(libc::EISDIR));
        }
        let mut data = Vec::new();
        f.take(limit as u64 + 1).read_to_end(&mut data)?;
        if data.len() > limit {
            return Err(io::Error::from_raw_os_error(libc::ENOMEM));
        }
        Ok(data)
    }

    fn eval_symlinks(&self, path: &Path) -> io::Result<std::path::PathBuf> {
        std::fs::canonicalize(path)
    }

    fn acl_update(&self, path: &Path, uid: u32, perms: AclPerms) -> io::Result<()> {
        crate::acl::update_file(path, uid, perms)
    }

    fn change_hosts(&self, display: &str, insert: bool, name: &str) -> io::Result<()> {
        crate::x11::change_hosts(display, insert, name)
    }

    fn wayland_attach(&self, req: &WaylandRequest) -> io::Result<Box<dyn WaylandSession>> {
        Ok(Box::new(crate::wl::Session::attach(req)?))
    }

    fn dbus_spawn(&self, spec: &ProxySpec) -> io::Result<Box<dyn BusProxy>> {
        Ok(Box::new(crate::dbus::proxy::Proxy::spawn(spec)?))
    }
}

/// Reads a kernel overflow id, falling back to the standard value.
fn proc_overflow(path: &str) -> u32 {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(65534)
}

#[cfg(test)]
pub(crate) use stub::StubSyscalls;
