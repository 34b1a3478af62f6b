//! Per-identity /tmp.

use burrow_proto::{Absolute, BindFlags, Enablement};
use serde::{Deserialize, Serialize};

use super::{ContainerContext, SysContext, params::abs};
use crate::acl::AclPerms;
use crate::error::Result;

/// Shares a persistent per-identity directory as the container's /tmp.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct TmpdirOp {
    host_path: Option<Absolute>,
}

impl TmpdirOp {
    pub(super) fn to_system(&mut self, ctx: &mut SysContext<'_>) -> Result<()> {
        ctx.ensure_share();
        let tmpdir = ctx.paths.share.append("tmpdir");
        let identity_dir = tmpdir.append(ctx.config.identity.to_string());
        ctx.system
            .ensure(Enablement::USER, &tmpdir, 0o700)
            .update_perm(Enablement::USER, &tmpdir, AclPerms::EXECUTE)
            // sticky, mirroring a real /tmp
            .ensure(Enablement::USER, &identity_dir, 0o1700)
            .update_perm(
                Enablement::USER,
                &identity_dir,
                AclPerms::READ | AclPerms::WRITE | AclPerms::EXECUTE,
            );
        self.host_path = Some(identity_dir);
        Ok(())
    }

    pub(super) fn to_container(&self, ctx: &mut ContainerContext<'_>) -> Result<()> {
        if let Some(host_path) = &self.host_path {
            ctx.params
                .bind(host_path.clone(), abs("/tmp")?, BindFlags::WRITE);
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

    #[test]
    fn host_side_creates_sticky_dir() {
        let sys = StubSyscalls::new(1000, 1000);
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
        let mut op = TmpdirOp::default();
        op.to_system(&mut ctx).unwrap();

        assert_eq!(
            ctx.system.op_descriptions(),
            vec![
                "ensure directory \"/tmp/burrow.1000\" mode 711",
                "ensure directory \"/tmp/burrow.1000/tmpdir\" mode 700",
                "acl --x on \"/tmp/burrow.1000/tmpdir\" for uid 1050005",
                "ensure directory \"/tmp/burrow.1000/tmpdir/5\" mode 1700",
                "acl rwx on \"/tmp/burrow.1000/tmpdir/5\" for uid 1050005",
            ]
        );
    }

    #[test]
    fn container_side_binds_tmp() {
        let state = test_state(ContainerSpec::default());
        let op = TmpdirOp {
            host_path: Some("/tmp/burrow.1000/tmpdir/5".parse().unwrap()),
        };
        let mut ctx = ContainerContext::new(&state);
        op.to_container(&mut ctx).unwrap();
        assert!(matches!(ctx.params.ops[0], MountOp::Bind { ref target, .. }
            if target.as_path() == std::path::Path::new("/tmp")));
    }
}
