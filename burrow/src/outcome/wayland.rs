//! Wayland display server access.

use std::path::Path;

use burrow_proto::{Absolute, BindFlags, Enablement};
use serde::{Deserialize, Serialize};

use super::{ContainerContext, SysContext};
use crate::acl::AclPerms;
use crate::error::{Error, Result};

/// Socket name presented inside the container.
const CONTAINER_DISPLAY: &str = "wayland-0";

/// Display name assumed when WAYLAND_DISPLAY is unset.
const FALLBACK_DISPLAY: &str = "wayland-0";

/// Shares the host compositor, either through a security-context-v1
/// brokered listener or by granting the upstream socket directly.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct WaylandOp {
    direct: bool,
    host_socket: Option<Absolute>,
}

impl WaylandOp {
    pub(super) fn to_system(&mut self, ctx: &mut SysContext<'_>) -> Result<()> {
        let name = ctx
            .sys
            .lookup_env("WAYLAND_DISPLAY")
            .unwrap_or_else(|| FALLBACK_DISPLAY.to_owned());
        let display = if Path::new(&name).is_absolute() {
            Absolute::new(name.as_str())?
        } else {
            match &ctx.paths.runtime {
                Some(runtime) => runtime.append(&name),
                None => return Err(Error::RuntimeDir),
            }
        };

        self.direct = ctx.config.direct_wayland;
        if self.direct {
            // no mediation; the container talks to the upstream socket
            ctx.ensure_runtime_dir()?;
            ctx.system.update_perm(
                Enablement::WAYLAND,
                &display,
                AclPerms::READ | AclPerms::WRITE | AclPerms::EXECUTE,
            );
            self.host_socket = Some(display);
        } else {
            ctx.runtime_share()?;
            let bind = ctx.instance().append("wayland");
            let app_id = if ctx.config.id.is_empty() {
                format!("app.burrow.{}", ctx.id)
            } else {
                ctx.config.id.clone()
            };
            let instance_id = ctx.id.to_string();
            ctx.system
                .wayland(Enablement::WAYLAND, &display, &bind, &app_id, &instance_id);
            self.host_socket = Some(bind);
        }
        Ok(())
    }

    pub(super) fn to_container(&self, ctx: &mut ContainerContext<'_>) -> Result<()> {
        if let Some(host_socket) = &self.host_socket {
            let target = ctx.runtime_dir().append(CONTAINER_DISPLAY);
            ctx.params
                .bind(host_socket.clone(), target, BindFlags::WRITE);
            ctx.env
                .insert("WAYLAND_DISPLAY".into(), CONTAINER_DISPLAY.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::{InstanceId, test_state};
    use crate::paths::Paths;
    use crate::sys::StubSyscalls;
    use crate::system::System;
    use burrow_proto::{Config, ContainerSpec, MountOp};

    fn ctx_with<'a>(
        sys: &'a StubSyscalls,
        config: &'a Config,
        paths: &'a Paths,
    ) -> SysContext<'a> {
        SysContext::new(sys, config, paths, System::new(1050005), InstanceId([1; 16]))
    }

    #[test]
    fn brokered_listener_in_instance_dir() {
        let mut sys = StubSyscalls::new(1000, 1000);
        sys.set_env("XDG_RUNTIME_DIR", "/run/user/1000");
        sys.set_env("WAYLAND_DISPLAY", "wayland-1");
        let config = Config {
            id: "org.example.App".into(),
            ..Config::default()
        };
        let paths = Paths::new(&sys);
        let mut ctx = ctx_with(&sys, &config, &paths);
        let mut op = WaylandOp::default();
        op.to_system(&mut ctx).unwrap();

        assert!(!op.direct);
        let hex = "01".repeat(16);
        assert_eq!(
            op.host_socket.as_ref().unwrap().to_string(),
            format!("/tmp/burrow.1000/{hex}/wayland")
        );
        let descriptions = ctx.system.op_descriptions();
        assert!(descriptions.last().unwrap().starts_with(&format!(
            "wayland proxy \"/run/user/1000/wayland-1\" at \"/tmp/burrow.1000/{hex}/wayland\""
        )));
    }

    #[test]
    fn direct_access_grants_upstream_socket() {
        let mut sys = StubSyscalls::new(1000, 1000);
        sys.set_env("XDG_RUNTIME_DIR", "/run/user/1000");
        let config = Config {
            direct_wayland: true,
            ..Config::default()
        };
        let paths = Paths::new(&sys);
        let mut ctx = ctx_with(&sys, &config, &paths);
        let mut op = WaylandOp::default();
        op.to_system(&mut ctx).unwrap();

        assert!(op.direct);
        assert_eq!(
            op.host_socket.as_ref().unwrap().to_string(),
            "/run/user/1000/wayland-0"
        );
        assert!(ctx.system.op_descriptions().contains(
            &"acl rwx on \"/run/user/1000/wayland-0\" for uid 1050005".to_owned()
        ));
    }

    #[test]
    fn missing_runtime_dir_is_an_error() {
        let sys = StubSyscalls::new(1000, 1000);
        let config = Config::default();
        let paths = Paths::new(&sys);
        let mut ctx = ctx_with(&sys, &config, &paths);
        assert!(matches!(
            WaylandOp::default().to_system(&mut ctx),
            Err(Error::RuntimeDir)
        ));
    }

    #[test]
    fn container_side_binds_and_sets_display() {
        let state = test_state(ContainerSpec::default());
        let op = WaylandOp {
            direct: false,
            host_socket: Some("/tmp/burrow.1000/x/wayland".parse().unwrap()),
        };
        let mut ctx = ContainerContext::new(&state);
        op.to_container(&mut ctx).unwrap();
        assert!(matches!(ctx.params.ops[0], MountOp::Bind { ref target, .. }
            if target.as_path() == Path::new("/run/user/65534/wayland-0")));
        assert_eq!(ctx.env["WAYLAND_DISPLAY"], "wayland-0");
    }
}
