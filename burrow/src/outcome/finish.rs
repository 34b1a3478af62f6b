//! Final op sealing the container.

use std::io;

use burrow_proto::Enablement;
use serde::{Deserialize, Serialize};

use super::{ContainerContext, SysContext, params::abs};
use crate::acl::AclPerms;
use crate::error::Result;

/// Applies configured extra ACL grants, remounts the container root
/// read-only and flattens the accumulated environment.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct FinishOp;

impl FinishOp {
    pub(super) fn to_system(&mut self, ctx: &mut SysContext<'_>) -> Result<()> {
        for extra in &ctx.config.extra_perms {
            if extra.ensure {
                ctx.system.ensure(Enablement::USER, &extra.path, 0o700);
            }
            let mut perms = AclPerms::empty();
            if extra.read {
                perms = perms | AclPerms::READ;
            }
            if extra.write {
                perms = perms | AclPerms::WRITE;
            }
            if extra.execute {
                perms = perms | AclPerms::EXECUTE;
            }
            ctx.system.update_perm(Enablement::USER, &extra.path, perms);
        }
        Ok(())
    }

    pub(super) fn to_container(&self, ctx: &mut ContainerContext<'_>) -> Result<()> {
        ctx.params.remount(abs("/")?, u64::from(libc::MS_RDONLY));
        ctx.params
            .set_env(&ctx.env)
            .map_err(|msg| io::Error::new(io::ErrorKind::InvalidInput, msg))?;
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
    use burrow_proto::{Config, ContainerSpec, ExtraPerm, MountOp};

    #[test]
    fn extra_perms_are_user_scoped() {
        let sys = StubSyscalls::new(1000, 1000);
        let config = Config {
            extra_perms: vec![ExtraPerm {
                ensure: true,
                path: "/var/lib/app".parse().unwrap(),
                read: true,
                write: true,
                execute: true,
            }],
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
        FinishOp.to_system(&mut ctx).unwrap();
        assert_eq!(
            ctx.system.op_descriptions(),
            vec![
                "ensure directory \"/var/lib/app\" mode 700",
                "acl rwx on \"/var/lib/app\" for uid 1050005",
            ]
        );
    }

    #[test]
    fn seals_root_and_flattens_env() {
        let state = test_state(ContainerSpec::default());
        let mut ctx = ContainerContext::new(&state);
        ctx.env.insert("TERM".into(), "xterm".into());
        ctx.env.insert("HOME".into(), "/home/chronos".into());
        FinishOp.to_container(&mut ctx).unwrap();

        assert!(matches!(ctx.params.ops[0], MountOp::Remount { ref target, flags }
            if target.is_root() && flags == u64::from(libc::MS_RDONLY)));
        // flattened sorted by key
        assert_eq!(
            ctx.params.env,
            vec!["HOME=/home/chronos".to_owned(), "TERM=xterm".to_owned()]
        );
    }
}
