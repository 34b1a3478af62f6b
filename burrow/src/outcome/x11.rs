//! X11 display server access.

use std::io;

use burrow_proto::{Absolute, BindFlags, Enablement};
use serde::{Deserialize, Serialize};

use super::{ContainerContext, SysContext, params::abs};
use crate::acl::AclPerms;
use crate::error::{Error, Result};

const SOCKET_DIR: &str = "/tmp/.X11-unix";

/// Grants the sandbox account access to the host X server via a
/// ServerInterpreted localuser entry, plus the display socket when it
/// lives on the filesystem.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct X11Op {
    display: Option<String>,
    socket: Option<Absolute>,
}

impl X11Op {
    pub(super) fn to_system(&mut self, ctx: &mut SysContext<'_>) -> Result<()> {
        let display = ctx
            .sys
            .lookup_env("DISPLAY")
            .filter(|d| !d.is_empty())
            .ok_or_else(|| Error::Display(String::new()))?;

        if let Some(socket) = crate::x11::display_socket(&display) {
            let socket = Absolute::new(socket)?;
            match ctx.sys.stat(socket.as_path()) {
                Ok(_) => {
                    ctx.system.update_perm(
                        Enablement::X11,
                        &socket,
                        AclPerms::READ | AclPerms::WRITE | AclPerms::EXECUTE,
                    );
                    self.socket = Some(socket);
                }
                // abstract-only server, nothing to grant on disk
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }

        ctx.system.change_hosts(
            Enablement::X11,
            &display,
            &format!("#{}", ctx.host_uid()),
        );
        self.display = Some(display);
        Ok(())
    }

    pub(super) fn to_container(&self, ctx: &mut ContainerContext<'_>) -> Result<()> {
        let Some(display) = &self.display else {
            return Ok(());
        };
        ctx.params.bind(
            abs(SOCKET_DIR)?,
            abs(SOCKET_DIR)?,
            BindFlags::default(),
        );
        let value = match &self.socket {
            Some(socket) if !ctx.state.spec.host_abstract => {
                format!("unix:{socket}")
            }
            _ => display.clone(),
        };
        ctx.env.insert("DISPLAY".into(), value);
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

    #[test]
    fn unset_display_is_an_error() {
        let sys = StubSyscalls::new(1000, 1000);
        let config = Config::default();
        let paths = Paths::new(&sys);
        let mut ctx = SysContext::new(&sys, &config, &paths, System::new(0), InstanceId([1; 16]));
        assert!(matches!(
            X11Op::default().to_system(&mut ctx),
            Err(Error::Display(_))
        ));
    }

    #[test]
    fn socket_acl_then_host_entry() {
        let mut sys = StubSyscalls::new(1000, 1000);
        sys.set_env("DISPLAY", ":0");
        sys.add_stat("/tmp/.X11-unix/X0", 0o140777, false);
        let config = Config::default();
        let paths = Paths::new(&sys);
        let mut ctx = SysContext::new(
            &sys,
            &config,
            &paths,
            System::new(1050005),
            InstanceId([1; 16]),
        );
        let mut op = X11Op::default();
        op.to_system(&mut ctx).unwrap();

        assert_eq!(
            ctx.system.op_descriptions(),
            vec![
                "acl rwx on \"/tmp/.X11-unix/X0\" for uid 1050005",
                "x11 host \"#1050005\" on :0",
            ]
        );
        assert_eq!(op.display.as_deref(), Some(":0"));
    }

    #[test]
    fn missing_socket_skips_acl() {
        let mut sys = StubSyscalls::new(1000, 1000);
        sys.set_env("DISPLAY", ":1");
        let config = Config::default();
        let paths = Paths::new(&sys);
        let mut ctx = SysContext::new(&sys, &config, &paths, System::new(0), InstanceId([1; 16]));
        let mut op = X11Op::default();
        op.to_system(&mut ctx).unwrap();
        assert!(op.socket.is_none());
        assert_eq!(ctx.system.op_descriptions().len(), 1);
    }

    #[test]
    fn container_display_rewritten_to_socket() {
        let state = test_state(ContainerSpec::default());
        let op = X11Op {
            display: Some(":0".into()),
            socket: Some("/tmp/.X11-unix/X0".parse().unwrap()),
        };
        let mut ctx = ContainerContext::new(&state);
        op.to_container(&mut ctx).unwrap();
        assert!(matches!(ctx.params.ops[0], MountOp::Bind { ref target, .. }
            if target.as_path() == std::path::Path::new(SOCKET_DIR)));
        assert_eq!(ctx.env["DISPLAY"], "unix:/tmp/.X11-unix/X0");
    }

    #[test]
    fn abstract_passthrough_keeps_display() {
        let state = test_state(ContainerSpec {
            host_abstract: true,
            ..ContainerSpec::default()
        });
        let op = X11Op {
            display: Some(":0".into()),
            socket: Some("/tmp/.X11-unix/X0".parse().unwrap()),
        };
        let mut ctx = ContainerContext::new(&state);
        op.to_container(&mut ctx).unwrap();
        assert_eq!(ctx.env["DISPLAY"], ":0");
    }
}
