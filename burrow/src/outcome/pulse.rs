//! PulseAudio server access.

use burrow_proto::{Absolute, BindFlags, Enablement};
use serde::{Deserialize, Serialize};

use super::{ContainerContext, SysContext, params::abs};
use crate::error::{Error, Result};
use crate::sys::Syscalls;
use crate::system::{SharedBuf, shared_buf};

/// Upper bound on authentication cookie size.
const COOKIE_LIMIT: usize = 256;

/// Pathname of the staged cookie inside the container.
const COOKIE_PATH: &str = "/.burrow/pulse-cookie";

/// Shares the host PulseAudio socket and authentication cookie.
///
/// The socket is hard linked into the per-instance runtime share so the
/// sandbox account can reach it without a grant on the real runtime
/// directory. The cookie is read host-side during commit and placed into
/// the container's private tmpfs.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct PulseOp {
    socket: Option<Absolute>,
    cookie: Option<Vec<u8>>,
    #[serde(skip)]
    staged: Option<SharedBuf>,
}

impl PulseOp {
    pub(super) fn to_system(&mut self, ctx: &mut SysContext<'_>) -> Result<()> {
        let runtime = match &ctx.paths.runtime {
            Some(runtime) => runtime.clone(),
            None => return Err(Error::RuntimeDir),
        };

        let pulse_dir = runtime.append("pulse");
        if ctx.sys.stat(pulse_dir.as_path()).is_err() {
            return Err(Error::Pulse {
                msg: "no pulseaudio directory at",
                path: pulse_dir.as_path().to_path_buf(),
            });
        }
        let socket = pulse_dir.append("native");
        let status = ctx.sys.stat(socket.as_path()).map_err(|_| Error::Pulse {
            msg: "no pulseaudio socket at",
            path: socket.as_path().to_path_buf(),
        })?;
        if status.mode & 0o006 != 0o006 {
            return Err(Error::Pulse {
                msg: "unexpected permissions on",
                path: socket.as_path().to_path_buf(),
            });
        }

        let link = ctx.runtime_share()?.append("pulse");
        ctx.system
            .link(Enablement::PULSE | Enablement::PROCESS, &socket, &link);
        self.socket = Some(link);

        if let Some(cookie) = discover_cookie(ctx.sys)? {
            let staged = shared_buf();
            ctx.system
                .copy_file(Enablement::PULSE, &staged, &cookie, COOKIE_LIMIT);
            self.staged = Some(staged);
        }
        Ok(())
    }

    /// Moves the cookie read during commit into the serialised state.
    pub(crate) fn seal(&mut self) {
        if let Some(staged) = self.staged.take() {
            self.cookie = Some(staged.borrow().clone());
        }
    }

    pub(super) fn to_container(&self, ctx: &mut ContainerContext<'_>) -> Result<()> {
        if let Some(socket) = &self.socket {
            let target = ctx.runtime_dir().append("pulse").append("native");
            ctx.params
                .bind(socket.clone(), target.clone(), BindFlags::WRITE);
            ctx.env.insert("PULSE_SERVER".into(), format!("unix:{target}"));
        }
        if let Some(cookie) = &self.cookie {
            ctx.params.place(abs(COOKIE_PATH)?, cookie.clone());
            ctx.env.insert("PULSE_COOKIE".into(), COOKIE_PATH.into());
        }
        Ok(())
    }
}

/// Locates the host authentication cookie, skipping directories.
///
/// An explicit `PULSE_COOKIE` value must be absolute; the fallback
/// locations are merely skipped when their base variables are unusable.
fn discover_cookie(sys: &dyn Syscalls) -> Result<Option<Absolute>> {
    let mut candidates = Vec::new();
    if let Some(path) = sys.lookup_env("PULSE_COOKIE") {
        match Absolute::new(path.as_str()) {
            Ok(path) => candidates.push(path),
            Err(_) => {
                return Err(Error::Pulse {
                    msg: "relative cookie pathname",
                    path: path.into(),
                });
            }
        }
    }
    if let Some(home) = sys.lookup_env("HOME").and_then(|h| Absolute::new(h).ok()) {
        candidates.push(home.append(".pulse-cookie"));
    }
    if let Some(config) = sys
        .lookup_env("XDG_CONFIG_HOME")
        .and_then(|c| Absolute::new(c).ok())
    {
        candidates.push(config.append("pulse/cookie"));
    }
    Ok(candidates.into_iter().find(|path| {
        sys.stat(path.as_path())
            .is_ok_and(|status| !status.is_dir)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::{InstanceId, test_state};
    use crate::paths::Paths;
    use crate::sys::StubSyscalls;
    use crate::system::System;
    use burrow_proto::{Config, ContainerSpec, MountOp};

    fn pulse_sys() -> StubSyscalls {
        let mut sys = StubSyscalls::new(1000, 1000);
        sys.set_env("XDG_RUNTIME_DIR", "/run/user/1000");
        sys.add_stat("/run/user/1000/pulse", 0o40700, true);
        sys.add_stat("/run/user/1000/pulse/native", 0o140666, false);
        sys
    }

    #[test]
    fn links_socket_and_stages_cookie() {
        let mut sys = pulse_sys();
        sys.set_env("HOME", "/home/alice");
        sys.add_file("/home/alice/.pulse-cookie", b"secret");
        let config = Config::default();
        let paths = Paths::new(&sys);
        let mut ctx = SysContext::new(
            &sys,
            &config,
            &paths,
            System::new(1050005),
            InstanceId([1; 16]),
        );
        let mut op = PulseOp::default();
        op.to_system(&mut ctx).unwrap();

        let hex = "01".repeat(16);
        let descriptions = ctx.system.op_descriptions();
        assert!(descriptions.contains(&format!(
            "hard link \"/run/user/1000/burrow/{hex}/pulse\" to \"/run/user/1000/pulse/native\""
        )));
        assert!(descriptions.contains(
            &"copy file \"/home/alice/.pulse-cookie\" (limit 256)".to_owned()
        ));

        ctx.system.commit(&sys).unwrap();
        op.seal();
        assert_eq!(op.cookie.as_deref(), Some(b"secret".as_slice()));
    }

    #[test]
    fn refuses_inaccessible_socket() {
        let mut sys = StubSyscalls::new(1000, 1000);
        sys.set_env("XDG_RUNTIME_DIR", "/run/user/1000");
        sys.add_stat("/run/user/1000/pulse", 0o40700, true);
        sys.add_stat("/run/user/1000/pulse/native", 0o140660, false);
        let config = Config::default();
        let paths = Paths::new(&sys);
        let mut ctx = SysContext::new(&sys, &config, &paths, System::new(0), InstanceId([1; 16]));
        assert!(matches!(
            PulseOp::default().to_system(&mut ctx),
            Err(Error::Pulse {
                msg: "unexpected permissions on",
                ..
            })
        ));
    }

    #[test]
    fn missing_directory_is_an_error() {
        let mut sys = StubSyscalls::new(1000, 1000);
        sys.set_env("XDG_RUNTIME_DIR", "/run/user/1000");
        let config = Config::default();
        let paths = Paths::new(&sys);
        let mut ctx = SysContext::new(&sys, &config, &paths, System::new(0), InstanceId([1; 16]));
        assert!(matches!(
            PulseOp::default().to_system(&mut ctx),
            Err(Error::Pulse {
                msg: "no pulseaudio directory at",
                ..
            })
        ));
    }

    #[test]
    fn cookie_discovery_skips_directories() {
        let mut sys = pulse_sys();
        sys.set_env("HOME", "/home/alice");
        sys.add_stat("/home/alice/.pulse-cookie", 0o40700, true);
        sys.set_env("XDG_CONFIG_HOME", "/home/alice/.config");
        sys.add_file("/home/alice/.config/pulse/cookie", b"xdg");
        assert_eq!(
            discover_cookie(&sys).unwrap().unwrap().to_string(),
            "/home/alice/.config/pulse/cookie"
        );
    }

    #[test]
    fn relative_cookie_pathname_rejected() {
        let mut sys = pulse_sys();
        sys.set_env("PULSE_COOKIE", "state/pulse-cookie");
        assert!(matches!(
            discover_cookie(&sys),
            Err(Error::Pulse {
                msg: "relative cookie pathname",
                ..
            })
        ));
    }

    #[test]
    fn container_side_binds_socket_and_places_cookie() {
        let state = test_state(ContainerSpec::default());
        let op = PulseOp {
            socket: Some("/run/user/1000/burrow/x/pulse".parse().unwrap()),
            cookie: Some(b"secret".to_vec()),
            staged: None,
        };
        let mut ctx = ContainerContext::new(&state);
        op.to_container(&mut ctx).unwrap();

        assert!(matches!(ctx.params.ops[0], MountOp::Bind { ref target, .. }
            if target.as_path() == std::path::Path::new("/run/user/65534/pulse/native")));
        assert_eq!(
            ctx.env["PULSE_SERVER"],
            "unix:/run/user/65534/pulse/native"
        );
        assert!(matches!(ctx.params.ops[1], MountOp::Place { ref target, .. }
            if target.as_path() == std::path::Path::new(COOKIE_PATH)));
        assert_eq!(ctx.env["PULSE_COOKIE"], COOKIE_PATH);
    }
}
