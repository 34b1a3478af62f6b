//! Per-identity XDG runtime directory.

use burrow_proto::{Absolute, BindFlags, Enablement};
use serde::{Deserialize, Serialize};

use super::{ContainerContext, SysContext, params::abs};
use crate::acl::AclPerms;
use crate::error::Result;

/// Shares a persistent per-identity directory as the container's XDG
/// runtime directory.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct RuntimeOp {
    host_path: Option<Absolute>,
}

impl RuntimeOp {
    pub(super) fn to_system(&mut self, ctx: &mut SysContext<'_>) -> Result<()> {
        ctx.ensure_share();
        let runtime = ctx.paths.share.append("runtime");
        let identity_dir = runtime.append(ctx.config.identity.to_string());
        ctx.system
            .ensure(Enablement::USER, &runtime, 0o700)
            .update_perm(Enablement::USER, &runtime, AclPerms::EXECUTE)
            .ensure(Enablement::USER, &identity_dir, 0o700)
            .update_perm(
                Enablement::USER,
                &identity_dir,
                AclPerms::READ | AclPerms::WRITE | AclPerms::EXECUTE,
            );
        self.host_path = Some(identity_dir);
        Ok(())
    }

    pub(super) fn to_container(&self, ctx: &mut ContainerContext<'_>) -> Result<()> {
        let runtime_dir = ctx.runtime_dir();
        ctx.params.tmpfs(abs("/run/user")?, 1 << 12, 0o755);
        if let Some(host_path) = &self.host_path {
            ctx.params
                .bind(host_path.clone(), runtime_dir.clone(), BindFlags::WRITE);
        }
        ctx.env
            .insert("XDG_RUNTIME_DIR".into(), runtime_dir.to_string());
        ctx.env.insert("XDG_SESSION_CLASS".into(), "user".into());
        ctx.env.insert("XDG_SESSION_TYPE".into(), "tty".into());
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
    fn host_side_grants_identity_dir() {
        let mut sys = StubSyscalls::new(1000, 1000);
        sys.set_env("XDG_RUNTIME_DIR", "/run/user/1000");
        let config = Config {
            identity: 5,
            ..Config::default()
        };
        let paths = Paths::new(&sys);
        let mut ctx = SysContext::new(
            &sys,
            &config,
            &paths,
            System::new(1050005),
            InstanceId([1; 16]),
        );
        let mut op = RuntimeOp::default();
        op.to_system(&mut ctx).unwrap();

        assert_eq!(
            ctx.system.op_descriptions(),
            vec![
                "ensure directory \"/tmp/burrow.1000\" mode 711",
                "ensure directory \"/tmp/burrow.1000/runtime\" mode 700",
                "acl --x on \"/tmp/burrow.1000/runtime\" for uid 1050005",
                "ensure directory \"/tmp/burrow.1000/runtime/5\" mode 700",
                "acl rwx on \"/tmp/burrow.1000/runtime/5\" for uid 1050005",
            ]
        );
        assert_eq!(
            op.host_path.unwrap().to_string(),
            "/tmp/burrow.1000/runtime/5"
        );
    }

    #[test]
    fn container_side_sets_session_env() {
        let state = test_state(ContainerSpec::default());
        let op = RuntimeOp {
            host_path: Some("/tmp/burrow.1000/runtime/5".parse().unwrap()),
        };
        let mut ctx = ContainerContext::new(&state);
        op.to_container(&mut ctx).unwrap();

        assert!(matches!(ctx.params.ops[0], MountOp::Tmpfs { ref target, .. }
            if target.as_path() == std::path::Path::new("/run/user")));
        assert!(matches!(ctx.params.ops[1], MountOp::Bind { ref target, ref flags, .. }
            if target.as_path() == std::path::Path::new("/run/user/65534")
                && flags.contains(BindFlags::WRITE)));
        assert_eq!(ctx.env["XDG_RUNTIME_DIR"], "/run/user/65534");
        assert_eq!(ctx.env["XDG_SESSION_TYPE"], "tty");
    }
}
