//! Privileged driver process.
//!
//! Finalises the instance, spawns the shim through the setuid helper,
//! commits host state, serves the outcome over the setup pipe, then
//! waits for the shim and reverts whatever no surviving instance still
//! needs.

use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Child;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use burrow_proto::{Config, ENV_SETUP_FD, Enablement};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{debug, error, info};

use crate::bsu;
use crate::error::{Error, Result};
use crate::finalise::finalise;
use crate::paths::Paths;
use crate::store::{Entry, FileStore, StateStore};
use crate::sys::Direct;
use crate::system::Criteria;

/// Setup failed or the container exited unsuccessfully.
pub const EXIT_FAILURE: i32 = 1;
/// The instance was cancelled.
pub const EXIT_CANCEL: i32 = 2;
/// The shim outlived its driver.
pub const EXIT_ORPHAN: i32 = 3;
/// The driver asked the shim to exit.
pub const EXIT_REQUEST: i32 = 254;

/// Fd index the setup pipe is installed at in the spawned process.
pub(crate) const SETUP_FD: i32 = 3;
/// Write timeout while serving the outcome to the shim.
const SERVE_TIMEOUT: Duration = Duration::from_secs(5);
/// Extra time granted past the container wait delay before SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);

const SHIM_ENV: &str = "BURROW_SHIM_PATH";
const IDENTITY_ENV: &str = "BURROW_IDENTITY";
const GROUPS_ENV: &str = "BURROW_GROUPS";

/// Runs one sandbox instance to completion and returns its exit code.
pub fn run(config: &Config) -> Result<i32> {
    let sys = Direct;
    let bsu_id = bsu::query_id()?;
    let verbose = tracing::enabled!(tracing::Level::DEBUG);
    let priv_pid = i32::try_from(std::process::id())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "pid out of range"))?;
    let mut outcome = finalise(&sys, config, bsu_id, priv_pid, verbose)?;

    let paths = Paths::new(&sys);
    let store = FileStore::new(
        paths
            .share
            .append("state")
            .append(config.identity.to_string())
            .as_path()
            .to_path_buf(),
    );

    let (parent, child_end) = UnixStream::pair()?;
    parent.set_write_timeout(Some(SERVE_TIMEOUT))?;

    let mut cmd = bsu::command();
    cmd.arg(shim_path()?);
    cmd.env(ENV_SETUP_FD, SETUP_FD.to_string());
    cmd.env(IDENTITY_ENV, config.identity.to_string());
    if !outcome.gids.is_empty() {
        let groups: Vec<String> = outcome.gids.iter().map(ToString::to_string).collect();
        cmd.env(GROUPS_ENV, groups.join(","));
    }
    let setup_fd = child_end.as_raw_fd();
    // SAFETY: dup2 is async-signal-safe and the closure touches nothing
    // else between fork and exec.
    #[allow(unsafe_code)]
    unsafe {
        cmd.pre_exec(move || {
            if libc::dup2(setup_fd, SETUP_FD) < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let entry = Entry {
        id: outcome.state.id.to_string(),
        pid: std::process::id(),
        enablements: outcome.state.enablements,
    };
    store.insert(&entry)?;

    if let Err(err) = outcome.system.commit(&sys) {
        if let Err(evict_err) = store.evict(&entry.id) {
            error!(err = %evict_err, "cannot evict entry");
        }
        return Err(err.into());
    }
    for op in &mut outcome.state.ops {
        op.seal();
    }

    let result = spawn_and_wait(cmd, child_end, parent, &outcome.state);

    if let Err(err) = store.evict(&entry.id) {
        error!(%err, "cannot evict entry");
    }
    let (survivor_count, aggregate) = match store.survivors() {
        Ok(s) => s,
        Err(err) => {
            error!(%err, "cannot read surviving entries");
            (0, Enablement::empty())
        }
    };
    let mask = revert_mask(outcome.state.enablements, survivor_count, aggregate);
    debug!(%mask, "reverting");
    for err in outcome.system.revert(&sys, Criteria(Some(mask))) {
        error!(%err, "revert failure");
    }

    result
}

/// Spawns the shim, serves the outcome, forwards cancellation signals
/// and reaps the shim.
fn spawn_and_wait(
    mut cmd: std::process::Command,
    child_end: UnixStream,
    mut parent: UnixStream,
    state: &crate::outcome::OutcomeState,
) -> Result<i32> {
    let mut child = cmd.spawn()?;
    drop(child_end);

    if let Err(err) = burrow_proto::encode(&mut parent, state) {
        error!(%err, "cannot serve outcome");
        let _ = child.wait();
        return Err(Error::ShimGone);
    }

    let shim_pid = i32::try_from(child.id())
        .map(Pid::from_raw)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "pid out of range"))?;
    let cancelled = Arc::new(AtomicBool::new(false));
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let handle = signals.handle();
    let flag = Arc::clone(&cancelled);
    let forwarder = std::thread::spawn(move || {
        for sig in signals.forever() {
            info!(sig, "cancelling instance");
            flag.store(true, Ordering::Relaxed);
            if kill(shim_pid, Signal::SIGCONT).is_err() {
                break;
            }
        }
    });

    let grace = state.spec.effective_wait_delay() + KILL_GRACE;
    let status = wait_with_grace(&mut child, shim_pid, &cancelled, grace);
    handle.close();
    if forwarder.join().is_err() {
        error!("signal forwarder panicked");
    }

    let status = status?;
    let code = status.code().unwrap_or(EXIT_FAILURE);
    debug!(code, "shim exited");
    Ok(code)
}

/// Reaps the shim, escalating to SIGKILL when it stays alive past
/// `grace` after cancellation.
fn wait_with_grace(
    child: &mut Child,
    shim_pid: Pid,
    cancelled: &AtomicBool,
    grace: Duration,
) -> Result<std::process::ExitStatus> {
    let mut deadline: Option<Instant> = None;
    let mut killed = false;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if cancelled.load(Ordering::Relaxed) && deadline.is_none() {
            deadline = Some(Instant::now() + grace);
        }
        if !killed && deadline.is_some_and(|d| Instant::now() >= d) {
            error!("shim unresponsive, killing");
            let _ = kill(shim_pid, Signal::SIGKILL);
            killed = true;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

/// Scopes to revert at instance exit: always per-process state, user
/// state when no other instance survives, and every feature grant no
/// survivor still holds.
fn revert_mask(own: Enablement, survivor_count: usize, aggregate: Enablement) -> Enablement {
    let mut mask = Enablement::PROCESS;
    if survivor_count == 0 {
        mask |= Enablement::USER;
    }
    mask | own.intersection(Enablement::FEATURES).difference(aggregate)
}

/// Pathname of the shim binary, next to the current executable unless
/// overridden.
fn shim_path() -> io::Result<PathBuf> {
    if let Some(path) = std::env::var_os(SHIM_ENV) {
        return Ok(PathBuf::from(path));
    }
    Ok(std::env::current_exe()?.with_file_name("burrow-shim"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revert_mask_for_last_instance() {
        let mask = revert_mask(
            Enablement::WAYLAND | Enablement::DBUS,
            0,
            Enablement::empty(),
        );
        assert!(mask.contains(Enablement::PROCESS));
        assert!(mask.contains(Enablement::USER));
        assert!(mask.contains(Enablement::WAYLAND | Enablement::DBUS));
    }

    #[test]
    fn revert_mask_spares_survivor_grants() {
        let mask = revert_mask(Enablement::WAYLAND | Enablement::PULSE, 2, Enablement::WAYLAND);
        assert!(mask.contains(Enablement::PROCESS));
        assert!(!mask.contains(Enablement::USER));
        assert!(mask.contains(Enablement::PULSE));
        assert!(!mask.contains(Enablement::WAYLAND));
    }
}
