//! Declarative filesystem entries and path hiding.

use std::path::Path;

use burrow_proto::{Absolute, BindFlags, FilesystemEntry, MountOp};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ContainerContext, SysContext, params::abs};
use crate::error::Result;

/// Tmpfs parameters covering a hidden path.
const HIDE_SIZE: u32 = 1 << 13;

/// Applies the configured filesystem and covers burrow's own host
/// directories wherever a bind would leak them into the container.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct FilesystemOp {
    entries: Vec<FilesystemEntry>,
    hide: Vec<Absolute>,
    device: bool,
}

impl FilesystemOp {
    pub(super) fn to_system(&mut self, ctx: &mut SysContext<'_>) -> Result<()> {
        self.entries = ctx
            .config
            .container
            .as_ref()
            .map(|spec| spec.filesystem.clone())
            .unwrap_or_default();
        self.device = ctx
            .config
            .container
            .as_ref()
            .is_some_and(|spec| spec.device);

        let mut candidates: Vec<Absolute> = vec![ctx.paths.share.clone()];
        if let Some(runtime) = &ctx.paths.runtime {
            candidates.push(runtime.clone());
        }
        if let Some(run_dir) = &ctx.paths.run_dir {
            candidates.push(run_dir.clone());
        }
        candidates.push(abs("/var/run/nscd")?);
        for key in ["DBUS_SESSION_BUS_ADDRESS", "DBUS_SYSTEM_BUS_ADDRESS"] {
            if let Some(addr) = ctx.sys.lookup_env(key) {
                for socket in crate::dbus::socket_paths(&addr) {
                    if let Some(parent) = socket.parent() {
                        if let Ok(dir) = Absolute::new(parent) {
                            candidates.push(dir);
                        }
                    }
                }
            }
        }

        // a bind of /var/run must still hide /run/user/<uid> on hosts
        // where one is a symlink to the other
        let sources: Vec<Absolute> = self
            .entries
            .iter()
            .flat_map(FilesystemEntry::host_paths)
            .map(|source| canonical(ctx.sys, source))
            .collect();
        for candidate in candidates {
            let resolved = canonical(ctx.sys, &candidate);
            let exposed = sources
                .iter()
                .any(|source| deep_contains(source.as_path(), resolved.as_path()));
            if exposed {
                debug!(path = %resolved, "hiding");
                self.hide.push(resolved);
            }
        }
        Ok(())
    }

    pub(super) fn to_container(&self, ctx: &mut ContainerContext<'_>) -> Result<()> {
        let params = &mut ctx.params;
        for entry in &self.entries {
            match entry {
                FilesystemEntry::Bind {
                    source,
                    target,
                    write,
                    device,
                    optional,
                    special,
                } => {
                    let target = target.as_ref().unwrap_or(source);
                    let mut flags = BindFlags::default();
                    if *write {
                        flags |= BindFlags::WRITE;
                    }
                    if *device {
                        flags |= BindFlags::DEVICE;
                    }
                    if *optional {
                        flags |= BindFlags::OPTIONAL;
                    }
                    if *special && target.is_root() {
                        params.ops.push(MountOp::Root {
                            source: source.clone(),
                            flags,
                        });
                    } else if *special && target.as_path() == Path::new("/etc") {
                        params.ops.push(MountOp::Etc {
                            source: source.clone(),
                            prefix: ctx.state.id.to_string(),
                        });
                    } else {
                        params.bind(source.clone(), target.clone(), flags);
                    }
                }
                FilesystemEntry::Ephemeral { target, size, perm } => {
                    params.tmpfs(target.clone(), *size, *perm);
                }
                FilesystemEntry::Link {
                    target,
                    link_name,
                    dereference,
                } => {
                    params.ops.push(MountOp::Link {
                        target: target.clone(),
                        link_name: link_name.clone(),
                        dereference: *dereference,
                    });
                }
            }
        }

        for path in &self.hide {
            params.tmpfs(path.clone(), HIDE_SIZE, 0o755);
        }

        if !self.device {
            params.remount(abs("/dev")?, u64::from(libc::MS_RDONLY));
        }
        Ok(())
    }
}

/// Whether `path` equals `base` or sits below it, by components.
pub(crate) fn deep_contains(base: &Path, path: &Path) -> bool {
    path.strip_prefix(base).is_ok()
}

/// Resolves symlinks through the dispatcher, keeping the pathname
/// as-is when it cannot be resolved.
fn canonical(sys: &dyn crate::sys::Syscalls, path: &Absolute) -> Absolute {
    match sys.eval_symlinks(path.as_path()) {
        Ok(resolved) => Absolute::new(resolved).unwrap_or_else(|_| path.clone()),
        Err(_) => path.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::{InstanceId, test_state};
    use crate::paths::Paths;
    use crate::sys::StubSyscalls;
    use crate::system::System;
    use burrow_proto::{Config, ContainerSpec};

    #[test]
    fn deep_contains_by_component() {
        let base = Path::new("/run/user/1000");
        assert!(deep_contains(base, Path::new("/run/user/1000")));
        assert!(deep_contains(base, Path::new("/run/user/1000/burrow")));
        assert!(!deep_contains(base, Path::new("/run/user/10000")));
        assert!(!deep_contains(base, Path::new("/run/user")));
        assert!(deep_contains(Path::new("/"), Path::new("/etc")));
    }

    #[test]
    fn root_bind_hides_everything_relevant() {
        let mut sys = StubSyscalls::new(1000, 1000);
        sys.set_env("XDG_RUNTIME_DIR", "/run/user/1000");
        sys.set_env("DBUS_SESSION_BUS_ADDRESS", "unix:path=/run/user/1000/bus");
        let config = Config {
            container: Some(ContainerSpec {
                filesystem: vec![FilesystemEntry::Bind {
                    source: "/".parse().unwrap(),
                    target: None,
                    write: true,
                    device: false,
                    optional: false,
                    special: true,
                }],
                ..ContainerSpec::default()
            }),
            ..Config::default()
        };
        let paths = Paths::new(&sys);
        let mut ctx = SysContext::new(&sys, &config, &paths, System::new(0), InstanceId([1; 16]));
        let mut op = FilesystemOp::default();
        op.to_system(&mut ctx).unwrap();

        let hidden: Vec<String> = op.hide.iter().map(ToString::to_string).collect();
        assert!(hidden.contains(&"/tmp/burrow.1000".to_owned()));
        assert!(hidden.contains(&"/run/user/1000".to_owned()));
        assert!(hidden.contains(&"/run/user/1000/burrow".to_owned()));
        assert!(hidden.contains(&"/var/run/nscd".to_owned()));
    }

    #[test]
    fn symlinked_bind_source_still_hides() {
        let mut sys = StubSyscalls::new(1000, 1000);
        sys.set_env("XDG_RUNTIME_DIR", "/run/user/1000");
        sys.add_symlink("/var/run", "/run");
        let config = Config {
            container: Some(ContainerSpec {
                filesystem: vec![FilesystemEntry::Bind {
                    source: "/var/run".parse().unwrap(),
                    target: None,
                    write: false,
                    device: false,
                    optional: false,
                    special: false,
                }],
                ..ContainerSpec::default()
            }),
            ..Config::default()
        };
        let paths = Paths::new(&sys);
        let mut ctx = SysContext::new(&sys, &config, &paths, System::new(0), InstanceId([1; 16]));
        let mut op = FilesystemOp::default();
        op.to_system(&mut ctx).unwrap();

        let hidden: Vec<String> = op.hide.iter().map(ToString::to_string).collect();
        assert!(hidden.contains(&"/run/user/1000".to_owned()));
        assert!(hidden.contains(&"/run/user/1000/burrow".to_owned()));
        // the nscd candidate resolves through the same link
        assert!(hidden.contains(&"/run/nscd".to_owned()));
        assert!(!hidden.iter().any(|p| p.starts_with("/tmp")));
    }

    #[test]
    fn narrow_bind_hides_nothing() {
        let mut sys = StubSyscalls::new(1000, 1000);
        sys.set_env("XDG_RUNTIME_DIR", "/run/user/1000");
        let config = Config {
            container: Some(ContainerSpec {
                filesystem: vec![FilesystemEntry::Bind {
                    source: "/nix/store".parse().unwrap(),
                    target: None,
                    write: false,
                    device: false,
                    optional: false,
                    special: false,
                }],
                ..ContainerSpec::default()
            }),
            ..Config::default()
        };
        let paths = Paths::new(&sys);
        let mut ctx = SysContext::new(&sys, &config, &paths, System::new(0), InstanceId([1; 16]));
        let mut op = FilesystemOp::default();
        op.to_system(&mut ctx).unwrap();
        assert!(op.hide.is_empty());
    }

    #[test]
    fn container_ops_cover_hidden_paths() {
        let state = test_state(ContainerSpec::default());
        let op = FilesystemOp {
            entries: vec![FilesystemEntry::Bind {
                source: "/".parse().unwrap(),
                target: None,
                write: true,
                device: false,
                optional: false,
                special: true,
            }],
            hide: vec!["/run/user/1000".parse().unwrap()],
            device: false,
        };
        let mut ctx = ContainerContext::new(&state);
        op.to_container(&mut ctx).unwrap();
        assert!(matches!(ctx.params.ops[0], MountOp::Root { .. }));
        assert!(matches!(ctx.params.ops[1], MountOp::Tmpfs { ref target, size, .. }
            if target.as_path() == Path::new("/run/user/1000") && size == HIDE_SIZE));
        assert!(matches!(ctx.params.ops[2], MountOp::Remount { flags, .. }
            if flags == u64::from(libc::MS_RDONLY)));
    }
}
