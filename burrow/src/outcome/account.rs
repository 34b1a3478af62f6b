//! Sandbox account identity inside the container.

use serde::{Deserialize, Serialize};

use super::{ContainerContext, SysContext, params::abs};
use crate::error::Result;

/// Places passwd and group files naming the sandbox account.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct AccountOp;

impl AccountOp {
    pub(super) fn to_system(&mut self, _ctx: &mut SysContext<'_>) -> Result<()> {
        Ok(())
    }

    pub(super) fn to_container(&self, ctx: &mut ContainerContext<'_>) -> Result<()> {
        let state = ctx.state;
        let passwd = format!(
            "{}:x:{}:{}:Burrow:{}:{}\n",
            state.username, state.uid, state.gid, state.home, state.shell
        );
        let group = format!("burrow:x:{}:\n", state.gid);
        ctx.params
            .place(abs("/etc/passwd")?, passwd.into_bytes())
            .place(abs("/etc/group")?, group.into_bytes());

        ctx.env.insert("USER".into(), state.username.clone());
        ctx.env.insert("HOME".into(), state.home.to_string());
        ctx.env.insert("SHELL".into(), state.shell.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::test_state;
    use burrow_proto::{ContainerSpec, MountOp};

    #[test]
    fn places_identity_files() {
        let state = test_state(ContainerSpec::default());
        let mut ctx = ContainerContext::new(&state);
        AccountOp.to_container(&mut ctx).unwrap();

        let MountOp::Place { target, data } = &ctx.params.ops[0] else {
            panic!("expected Place");
        };
        assert_eq!(target.as_path(), std::path::Path::new("/etc/passwd"));
        assert_eq!(
            String::from_utf8_lossy(data),
            "chronos:x:65534:65534:Burrow:/home/chronos:/bin/sh\n"
        );
        let MountOp::Place { data, .. } = &ctx.params.ops[1] else {
            panic!("expected Place");
        };
        assert_eq!(String::from_utf8_lossy(data), "burrow:x:65534:\n");
        assert_eq!(ctx.env["USER"], "chronos");
        assert_eq!(ctx.env["HOME"], "/home/chronos");
    }
}
