//! Baseline container parameters.

use burrow_proto::{Absolute, BindFlags, MountOp, SeccompFlags, SeccompPresets};
use serde::{Deserialize, Serialize};

use super::{ContainerContext, PRIV_TMP, SysContext};
use crate::error::Result;

/// Mount-table skeleton and isolation flags; always first in sequence.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct ParamsOp {
    term: Option<String>,
}

impl ParamsOp {
    pub(super) fn to_system(&mut self, ctx: &mut SysContext<'_>) -> Result<()> {
        // the shim has no terminal of its own to consult
        self.term = ctx.sys.lookup_env("TERM");
        Ok(())
    }

    pub(super) fn to_container(&self, ctx: &mut ContainerContext<'_>) -> Result<()> {
        let state = ctx.state;
        let spec = &state.spec;
        let params = &mut ctx.params;

        params.path = Some(state.path.clone());
        params.args = state.args.clone();
        params.dir = Some(state.home.clone());
        params.uid = state.uid;
        params.gid = state.gid;
        params.hostname = spec.hostname.clone();
        params.retain_session = spec.tty;
        params.host_net = spec.host_net;
        params.host_abstract = spec.host_abstract;
        params.forward_cancel = true;
        params.wait_delay = spec.effective_wait_delay();

        let mut presets = SeccompPresets::STRICT;
        if spec.seccomp_compat {
            presets = presets.difference(SeccompPresets::EXT);
        }
        if spec.userns {
            presets = presets.difference(SeccompPresets::DENY_NS);
        }
        if spec.tty {
            presets = presets.difference(SeccompPresets::DENY_TTY);
        }
        if spec.devel {
            presets = presets.difference(SeccompPresets::DENY_DEVEL);
        }
        params.seccomp_presets = presets;
        if spec.multiarch {
            params.seccomp_flags = params.seccomp_flags | SeccompFlags::ALLOW_MULTIARCH;
        }

        params.proc(abs("/proc")?);
        params.tmpfs(abs(PRIV_TMP)?, 1 << 12, 0o755);
        if spec.device {
            params.bind(
                abs("/dev")?,
                abs("/dev")?,
                BindFlags::WRITE | BindFlags::DEVICE,
            );
        } else {
            params.ops.push(MountOp::Dev {
                target: abs("/dev")?,
                mqueue: true,
                write: false,
            });
        }
        params.tmpfs(abs("/dev/shm")?, 0, 0o1777);

        if let Some(term) = &self.term {
            ctx.env.insert("TERM".into(), term.clone());
        }
        Ok(())
    }
}

pub(super) fn abs(s: impl Into<std::path::PathBuf>) -> Result<Absolute> {
    Ok(Absolute::new(s)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::test_state;
    use burrow_proto::ContainerSpec;

    #[test]
    fn baseline_mounts_in_order() {
        let state = test_state(ContainerSpec::default());
        let mut ctx = ContainerContext::new(&state);
        ParamsOp::default().to_container(&mut ctx).unwrap();
        assert!(matches!(ctx.params.ops[0], MountOp::Proc { .. }));
        assert!(matches!(ctx.params.ops[1], MountOp::Tmpfs { ref target, .. }
            if target.as_path() == std::path::Path::new(PRIV_TMP)));
        assert!(matches!(ctx.params.ops[2], MountOp::Dev { mqueue: true, .. }));
        assert!(matches!(ctx.params.ops[3], MountOp::Tmpfs { perm: 0o1777, .. }));
        assert_eq!(ctx.params.seccomp_presets, SeccompPresets::STRICT);
    }

    #[test]
    fn term_travels_from_host_to_container() {
        let mut sys = crate::sys::StubSyscalls::new(1000, 1000);
        sys.set_env("TERM", "xterm-256color");
        let config = burrow_proto::Config::default();
        let paths = crate::paths::Paths::new(&sys);
        let mut sys_ctx = crate::outcome::SysContext::new(
            &sys,
            &config,
            &paths,
            crate::system::System::new(0),
            crate::outcome::InstanceId([1; 16]),
        );
        let mut op = ParamsOp::default();
        op.to_system(&mut sys_ctx).unwrap();

        let state = test_state(ContainerSpec::default());
        let mut ctx = ContainerContext::new(&state);
        op.to_container(&mut ctx).unwrap();
        assert_eq!(ctx.env["TERM"], "xterm-256color");
    }

    #[test]
    fn device_passthrough_binds_dev() {
        let state = test_state(ContainerSpec {
            device: true,
            ..ContainerSpec::default()
        });
        let mut ctx = ContainerContext::new(&state);
        ParamsOp::default().to_container(&mut ctx).unwrap();
        assert!(matches!(ctx.params.ops[2], MountOp::Bind { ref flags, .. }
            if flags.contains(BindFlags::DEVICE)));
    }

    #[test]
    fn flags_relax_presets() {
        let state = test_state(ContainerSpec {
            tty: true,
            devel: true,
            ..ContainerSpec::default()
        });
        let mut ctx = ContainerContext::new(&state);
        ParamsOp::default().to_container(&mut ctx).unwrap();
        let presets = ctx.params.seccomp_presets;
        assert!(presets.contains(SeccompPresets::EXT));
        assert!(presets.contains(SeccompPresets::DENY_NS));
        assert!(!presets.contains(SeccompPresets::DENY_TTY));
        assert!(!presets.contains(SeccompPresets::DENY_DEVEL));
        assert!(ctx.params.retain_session);
    }
}
