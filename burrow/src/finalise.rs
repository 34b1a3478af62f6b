//! Turns a sandbox configuration into a committed-ready outcome.

use burrow_proto::{
    Absolute, Config, ConfigError, ContainerSpec, Enablement, FilesystemEntry, USERNAME_FALLBACK,
};
use tracing::debug;

use crate::error::{Error, Result};
use crate::outcome::{InstanceId, OutcomeState, SysContext, op_sequence};
use crate::paths::Paths;
use crate::sys::Syscalls;
use crate::system::System;

/// First uid of the first assigned user's account block.
const UID_BASE: u32 = 1_000_000;
/// Accounts per assigned user.
const UID_BLOCK: u32 = 10_000;

/// Host uid of the sandbox account selected by `identity` within the
/// block assigned to `bsu_id`.
pub(crate) fn sandbox_uid(bsu_id: u32, identity: i32) -> u32 {
    UID_BASE + bsu_id * UID_BLOCK + identity as u32
}

/// A finalised instance.
///
/// The host ops in `system` have not been committed yet; `state.ops`
/// must be sealed after commit and before serialisation.
pub(crate) struct Outcome {
    /// State destined for the shim.
    pub state: OutcomeState,
    /// Reversible host ops backing the instance.
    pub system: System,
    /// Resolved supplementary gids for the shim.
    pub gids: Vec<u32>,
}

/// Validates `config`, applies defaults, and runs the host side of the
/// full op sequence.
pub(crate) fn finalise(
    sys: &dyn Syscalls,
    config: &Config,
    bsu_id: u32,
    priv_pid: i32,
    verbose: bool,
) -> Result<Outcome> {
    config.validate()?;
    let path = config.path.clone().ok_or(ConfigError::Path)?;
    let home = config.home.clone().ok_or(ConfigError::Home)?;
    let shell = config.shell.clone().ok_or(ConfigError::Shell)?;

    let mut gids = Vec::with_capacity(config.groups.len());
    for name in &config.groups {
        match sys.lookup_group_id(name)? {
            Some(gid) => gids.push(gid),
            None => return Err(Error::UnknownGroup(name.clone())),
        }
    }

    let username = config
        .username
        .clone()
        .unwrap_or_else(|| USERNAME_FALLBACK.to_owned());
    let args = if config.args.is_empty() {
        vec![path.to_string()]
    } else {
        config.args.clone()
    };
    let spec = match config.container.clone() {
        Some(mut spec) => {
            if spec.filesystem.is_empty() {
                spec.filesystem = default_filesystem(config.enablements);
            }
            spec
        }
        None => permissive_spec(config.enablements),
    };

    let (uid, gid) = if spec.map_real_uid {
        (sys.getuid(), sys.getgid())
    } else {
        (sys.overflow_uid(), sys.overflow_gid())
    };

    let id = InstanceId::generate(sys)?;
    debug!(%id, identity = config.identity, "finalising instance");

    let mut state = OutcomeState {
        id,
        identity: config.identity,
        bsu_id,
        uid,
        gid,
        username,
        home,
        shell,
        path,
        args,
        enablements: config.enablements,
        spec,
        priv_pid,
        verbose,
        ops: Vec::new(),
    };

    // ops see the resolved spec, not the raw optional one
    let mut resolved = config.clone();
    resolved.container = Some(state.spec.clone());

    let paths = Paths::new(sys);
    let mut ops = op_sequence(&resolved);
    let mut ctx = SysContext::new(
        sys,
        &resolved,
        &paths,
        System::new(sandbox_uid(bsu_id, config.identity)),
        id,
    );
    for op in &mut ops {
        op.to_system(&mut ctx)?;
    }
    state.ops = ops;

    Ok(Outcome {
        state,
        system: ctx.system,
        gids,
    })
}

/// Container parameters assumed when the config names none: share the
/// host filesystem read-write with an instance-masked `/etc`, keep the
/// host network and controlling terminal.
fn permissive_spec(enablements: Enablement) -> ContainerSpec {
    ContainerSpec {
        tty: true,
        host_net: true,
        filesystem: default_filesystem(enablements),
        ..ContainerSpec::default()
    }
}

/// Filesystem entries assumed when a config names none: the host root
/// bound writable, `/etc` masked per-instance, and the render/virt
/// device nodes when a display protocol is enabled.
fn default_filesystem(enablements: Enablement) -> Vec<FilesystemEntry> {
    let source_root = Absolute::new("/").unwrap_or_else(|_| unreachable!());
    let source_etc = Absolute::new("/etc").unwrap_or_else(|_| unreachable!());
    let mut filesystem = vec![
        FilesystemEntry::Bind {
            source: source_root,
            target: None,
            write: true,
            device: false,
            optional: false,
            special: true,
        },
        FilesystemEntry::Bind {
            source: source_etc.clone(),
            target: Some(source_etc),
            write: false,
            device: false,
            optional: false,
            special: true,
        },
    ];
    if !enablements
        .intersection(Enablement::WAYLAND | Enablement::X11)
        .is_empty()
    {
        for dev in ["/dev/dri", "/dev/kvm"] {
            filesystem.push(FilesystemEntry::Bind {
                source: Absolute::new(dev).unwrap_or_else(|_| unreachable!()),
                target: None,
                write: true,
                device: true,
                optional: true,
                special: false,
            });
        }
    }
    filesystem
}
