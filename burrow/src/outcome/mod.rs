//! Preparation ops bridging the privilege boundary.
//!
//! Each op contributes host-side reversible ops (`to_system`, run by
//! the privileged parent) and container-side parameters
//! (`to_container`, replayed by the shim from the serialised outcome).
//! The op sequence is fixed: params, filesystem, account, runtime,
//! tmpdir, then one op per enabled subsystem, then finish.

pub(crate) mod account;
pub(crate) mod dbus;
pub(crate) mod filesystem;
pub(crate) mod finish;
pub(crate) mod params;
pub(crate) mod pulse;
pub(crate) mod runtime;
pub(crate) mod tmpdir;
pub(crate) mod wayland;
pub(crate) mod x11;

use std::collections::BTreeMap;
use std::fmt;

use burrow_proto::{Absolute, Config, ContainerParams, ContainerSpec, Enablement};
use serde::{Deserialize, Serialize};

use crate::acl::AclPerms;
use crate::error::{Error, Result};
use crate::paths::Paths;
use crate::sys::Syscalls;
use crate::system::System;

/// Private tmpfs inside every container, holding placed files.
pub(crate) const PRIV_TMP: &str = "/.burrow";

/// 128-bit instance identifier, printed as 32 lowercase hex digits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub(crate) struct InstanceId(pub [u8; 16]);

impl InstanceId {
    /// Draws a fresh id from the dispatcher's entropy source.
    pub(crate) fn generate(sys: &dyn Syscalls) -> std::io::Result<Self> {
        sys.random_id().map(Self)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Everything the shim needs, serialised across the setup pipe.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct OutcomeState {
    /// Instance identifier.
    pub id: InstanceId,
    /// Identity number selecting the sandbox account.
    pub identity: i32,
    /// Id assigned to the calling user by the setuid helper.
    pub bsu_id: u32,
    /// Uid inside the container.
    pub uid: u32,
    /// Gid inside the container.
    pub gid: u32,
    /// Sandbox account name.
    pub username: String,
    /// Home directory inside the container.
    pub home: Absolute,
    /// Login shell inside the container.
    pub shell: Absolute,
    /// Initial program.
    pub path: Absolute,
    /// Initial program arguments.
    pub args: Vec<String>,
    /// Enabled subsystems.
    pub enablements: Enablement,
    /// Container spec with permissive defaults already applied.
    pub spec: ContainerSpec,
    /// Pid of the privileged parent, for the SIGCONT handshake.
    pub priv_pid: i32,
    /// Whether verbose narration is enabled in the shim.
    pub verbose: bool,
    /// Preparation ops in replay order.
    pub ops: Vec<PrepOp>,
}

/// Host-side preparation context.
pub(crate) struct SysContext<'a> {
    /// Syscall dispatcher.
    pub sys: &'a dyn Syscalls,
    /// Sandbox configuration.
    pub config: &'a Config,
    /// Environment-derived host paths.
    pub paths: &'a Paths,
    /// Reversible op collection being assembled.
    pub system: System,
    /// Instance id.
    pub id: InstanceId,
    instance_dir: Option<Absolute>,
    runtime_share_dir: Option<Absolute>,
    runtime_ensured: bool,
    share_ensured: bool,
}

impl fmt::Debug for SysContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SysContext")
            .field("id", &self.id)
            .field("instance_dir", &self.instance_dir)
            .field("runtime_share_dir", &self.runtime_share_dir)
            .finish_non_exhaustive()
    }
}

impl<'a> SysContext<'a> {
    pub(crate) fn new(
        sys: &'a dyn Syscalls,
        config: &'a Config,
        paths: &'a Paths,
        system: System,
        id: InstanceId,
    ) -> Self {
        Self {
            sys,
            config,
            paths,
            system,
            id,
            instance_dir: None,
            runtime_share_dir: None,
            runtime_ensured: false,
            share_ensured: false,
        }
    }

    /// Ensures the per-user tmp share directory exists, once.
    pub(crate) fn ensure_share(&mut self) {
        if !self.share_ensured {
            self.share_ensured = true;
            self.system
                .ensure(Enablement::USER, &self.paths.share, 0o711);
        }
    }

    /// Per-instance directory under the tmp share, created on first use.
    pub(crate) fn instance(&mut self) -> Absolute {
        if let Some(dir) = &self.instance_dir {
            return dir.clone();
        }
        self.ensure_share();
        let dir = self.paths.share.append(self.id.to_string());
        self.system.ephemeral(Enablement::PROCESS, &dir, 0o711);
        self.instance_dir = Some(dir.clone());
        dir
    }

    /// Ensures XDG_RUNTIME_DIR and the run directory are traversable by
    /// the sandbox account. Returns the run directory.
    pub(crate) fn ensure_runtime_dir(&mut self) -> Result<Absolute> {
        let (runtime, run_dir) = match (&self.paths.runtime, &self.paths.run_dir) {
            (Some(runtime), Some(run_dir)) => (runtime.clone(), run_dir.clone()),
            _ => return Err(Error::RuntimeDir),
        };
        if !self.runtime_ensured {
            self.runtime_ensured = true;
            self.system
                .ensure(Enablement::USER, &runtime, 0o700)
                .update_perm(Enablement::USER, &runtime, AclPerms::EXECUTE)
                .ensure(Enablement::USER, &run_dir, 0o700)
                .update_perm(Enablement::USER, &run_dir, AclPerms::EXECUTE);
        }
        Ok(run_dir)
    }

    /// Per-instance directory under the run directory, created on first
    /// use and traversable by the sandbox account.
    pub(crate) fn runtime_share(&mut self) -> Result<Absolute> {
        if let Some(dir) = &self.runtime_share_dir {
            return Ok(dir.clone());
        }
        let run_dir = self.ensure_runtime_dir()?;
        let dir = run_dir.append(self.id.to_string());
        self.system
            .ephemeral(Enablement::PROCESS, &dir, 0o700)
            .update_perm(Enablement::PROCESS, &dir, AclPerms::EXECUTE);
        self.runtime_share_dir = Some(dir.clone());
        Ok(dir)
    }

    /// Uid of the sandbox account on the host.
    pub(crate) fn host_uid(&self) -> u32 {
        self.system.uid()
    }
}

/// Shim-side replay context.
#[derive(Debug)]
pub(crate) struct ContainerContext<'a> {
    /// Serialised outcome received from the privileged parent.
    pub state: &'a OutcomeState,
    /// Container parameters being assembled.
    pub params: ContainerParams,
    /// Container environment; flattened into `params` by the finish op.
    pub env: BTreeMap<String, String>,
}

impl<'a> ContainerContext<'a> {
    pub(crate) fn new(state: &'a OutcomeState) -> Self {
        Self {
            state,
            params: ContainerParams::default(),
            env: state.spec.env.clone(),
        }
    }

    /// XDG runtime directory pathname inside the container.
    pub(crate) fn runtime_dir(&self) -> Absolute {
        Absolute::new(format!("/run/user/{}", self.state.uid))
            .unwrap_or_else(|_| unreachable!())
    }
}

/// One preparation op; variants replay in registration order.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum PrepOp {
    Params(params::ParamsOp),
    Filesystem(filesystem::FilesystemOp),
    Account(account::AccountOp),
    Runtime(runtime::RuntimeOp),
    Tmpdir(tmpdir::TmpdirOp),
    Wayland(wayland::WaylandOp),
    X11(x11::X11Op),
    Pulse(pulse::PulseOp),
    Dbus(dbus::DbusOp),
    Finish(finish::FinishOp),
}

impl PrepOp {
    /// Contributes reversible host ops.
    pub(crate) fn to_system(&mut self, ctx: &mut SysContext<'_>) -> Result<()> {
        match self {
            Self::Params(op) => op.to_system(ctx),
            Self::Filesystem(op) => op.to_system(ctx),
            Self::Account(op) => op.to_system(ctx),
            Self::Runtime(op) => op.to_system(ctx),
            Self::Tmpdir(op) => op.to_system(ctx),
            Self::Wayland(op) => op.to_system(ctx),
            Self::X11(op) => op.to_system(ctx),
            Self::Pulse(op) => op.to_system(ctx),
            Self::Dbus(op) => op.to_system(ctx),
            Self::Finish(op) => op.to_system(ctx),
        }
    }

    /// Moves data produced by committed host ops into serialised fields.
    pub(crate) fn seal(&mut self) {
        if let Self::Pulse(op) = self {
            op.seal();
        }
    }

    /// Contributes container parameters.
    pub(crate) fn to_container(&self, ctx: &mut ContainerContext<'_>) -> Result<()> {
        match self {
            Self::Params(op) => op.to_container(ctx),
            Self::Filesystem(op) => op.to_container(ctx),
            Self::Account(op) => op.to_container(ctx),
            Self::Runtime(op) => op.to_container(ctx),
            Self::Tmpdir(op) => op.to_container(ctx),
            Self::Wayland(op) => op.to_container(ctx),
            Self::X11(op) => op.to_container(ctx),
            Self::Pulse(op) => op.to_container(ctx),
            Self::Dbus(op) => op.to_container(ctx),
            Self::Finish(op) => op.to_container(ctx),
        }
    }
}

/// Builds the op sequence for `config` in the fixed order.
pub(crate) fn op_sequence(config: &Config) -> Vec<PrepOp> {
    let mut ops = vec![
        PrepOp::Params(params::ParamsOp::default()),
        PrepOp::Filesystem(filesystem::FilesystemOp::default()),
        PrepOp::Account(account::AccountOp::default()),
        PrepOp::Runtime(runtime::RuntimeOp::default()),
        PrepOp::Tmpdir(tmpdir::TmpdirOp::default()),
    ];
    if config.enablements.contains(Enablement::WAYLAND) {
        ops.push(PrepOp::Wayland(wayland::WaylandOp::default()));
    }
    if config.enablements.contains(Enablement::X11) {
        ops.push(PrepOp::X11(x11::X11Op::default()));
    }
    if config.enablements.contains(Enablement::PULSE) {
        ops.push(PrepOp::Pulse(pulse::PulseOp::default()));
    }
    if config.enablements.contains(Enablement::DBUS) {
        ops.push(PrepOp::Dbus(dbus::DbusOp::default()));
    }
    ops.push(PrepOp::Finish(finish::FinishOp::default()));
    ops
}

#[cfg(test)]
pub(crate) fn test_state(spec: ContainerSpec) -> OutcomeState {
    OutcomeState {
        id: InstanceId([7; 16]),
        identity: 5,
        bsu_id: 0,
        uid: 65534,
        gid: 65534,
        username: "chronos".into(),
        home: "/home/chronos".parse().unwrap_or_else(|_| unreachable!()),
        shell: "/bin/sh".parse().unwrap_or_else(|_| unreachable!()),
        path: "/bin/app".parse().unwrap_or_else(|_| unreachable!()),
        args: vec!["app".into()],
        enablements: Enablement::empty(),
        spec,
        priv_pid: 100,
        verbose: false,
        ops: Vec::new(),
    }
}
