//! Syscall filter assembly from preset bits.
//!
//! The filter is a deny list: everything is allowed except the syscalls
//! named by the selected preset groups, which fail with EPERM. The shim
//! loads the full strict set on itself right after container start.

use std::collections::BTreeMap;
use std::io;

use burrow_proto::{SeccompFlags, SeccompPresets};
use seccompiler::{
    BpfProgram, SeccompAction, SeccompCmpArgLen, SeccompCmpOp, SeccompCondition, SeccompFilter,
    SeccompRule, TargetArch,
};
use tracing::debug;

/// Denied regardless of container flags once the extended group is on.
const EXT_SYSCALLS: &[libc::c_long] = &[
    libc::SYS_acct,
    libc::SYS_add_key,
    libc::SYS_delete_module,
    libc::SYS_finit_module,
    libc::SYS_get_mempolicy,
    libc::SYS_init_module,
    libc::SYS_keyctl,
    libc::SYS_mbind,
    libc::SYS_migrate_pages,
    libc::SYS_move_pages,
    libc::SYS_quotactl,
    libc::SYS_reboot,
    libc::SYS_request_key,
    libc::SYS_set_mempolicy,
    libc::SYS_swapoff,
    libc::SYS_swapon,
    libc::SYS_syslog,
];

/// Denied unless the container keeps userns capability.
const NS_SYSCALLS: &[libc::c_long] = &[
    libc::SYS_chroot,
    libc::SYS_mount,
    libc::SYS_pivot_root,
    libc::SYS_setns,
    libc::SYS_umount2,
    libc::SYS_unshare,
];

/// Denied unless the container is a development sandbox.
const DEVEL_SYSCALLS: &[libc::c_long] = &[
    libc::SYS_perf_event_open,
    libc::SYS_personality,
    libc::SYS_process_vm_readv,
    libc::SYS_process_vm_writev,
    libc::SYS_ptrace,
];

fn native_arch() -> io::Result<TargetArch> {
    TargetArch::try_from(std::env::consts::ARCH)
        .map_err(|_| io::Error::new(io::ErrorKind::Unsupported, "unsupported seccomp arch"))
}

/// Builds the BPF program for the selected preset groups.
///
/// Returns `None` when no group is selected; the kernel arch check alone
/// is not worth a filter. `flags` only records intent here, the
/// non-native ABI check is part of the generated prologue either way.
pub(crate) fn build(
    presets: SeccompPresets,
    flags: SeccompFlags,
) -> io::Result<Option<BpfProgram>> {
    let mut rules: BTreeMap<i64, Vec<SeccompRule>> = BTreeMap::new();
    let mut deny_all = |list: &[libc::c_long]| {
        for &nr in list {
            rules.insert(nr as i64, Vec::new());
        }
    };

    if presets.contains(SeccompPresets::EXT) {
        deny_all(EXT_SYSCALLS);
    }
    if presets.contains(SeccompPresets::DENY_NS) {
        deny_all(NS_SYSCALLS);
    }
    if presets.contains(SeccompPresets::DENY_DEVEL) {
        deny_all(DEVEL_SYSCALLS);
    }
    if presets.contains(SeccompPresets::DENY_TTY) {
        let cond = SeccompCondition::new(
            1,
            SeccompCmpArgLen::Qword,
            SeccompCmpOp::Eq,
            libc::TIOCSTI as u64,
        )
        .map_err(io::Error::other)?;
        let rule = SeccompRule::new(vec![cond]).map_err(io::Error::other)?;
        rules.insert(libc::SYS_ioctl as i64, vec![rule]);
        rules.insert(libc::SYS_vhangup as i64, Vec::new());
    }

    if rules.is_empty() {
        return Ok(None);
    }

    debug!(
        syscalls = rules.len(),
        multiarch = flags.contains(SeccompFlags::ALLOW_MULTIARCH),
        "assembling seccomp filter"
    );
    let filter = SeccompFilter::new(
        rules,
        SeccompAction::Allow,
        SeccompAction::Errno(libc::EPERM as u32),
        native_arch()?,
    )
    .map_err(io::Error::other)?;
    let program: BpfProgram = filter.try_into().map_err(io::Error::other)?;
    Ok(Some(program))
}

/// Assembles and installs the filter on the calling thread.
pub(crate) fn load(presets: SeccompPresets, flags: SeccompFlags) -> io::Result<()> {
    if let Some(program) = build(presets, flags)? {
        seccompiler::apply_filter(&program).map_err(io::Error::other)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_filter_assembles() {
        let program = build(SeccompPresets::STRICT, SeccompFlags::default())
            .unwrap()
            .unwrap();
        assert!(!program.is_empty());
    }

    #[test]
    fn empty_presets_build_nothing() {
        assert!(
            build(SeccompPresets::default(), SeccompFlags::default())
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn tty_group_adds_ioctl_rule() {
        let with_tty = build(SeccompPresets::DENY_TTY, SeccompFlags::default())
            .unwrap()
            .unwrap();
        let without = build(SeccompPresets::EXT, SeccompFlags::default())
            .unwrap()
            .unwrap();
        assert_ne!(with_tty.len(), without.len());
    }
}
