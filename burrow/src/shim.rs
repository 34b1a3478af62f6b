//! Shim process, running as the sandbox account.
//!
//! The shim receives the serialised outcome over the setup pipe,
//! replays the container side of every preparation op, hands the
//! resulting parameters to the container runtime, then supervises the
//! container while listening for SIGCONT from the driver.

#![allow(unsafe_code)]

use std::io;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};

use burrow_proto::{ContainerParams, ENV_SETUP_FD, SeccompPresets};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{debug, error};

use crate::error::Result;
use crate::outcome::{ContainerContext, OutcomeState};
use crate::process::{EXIT_CANCEL, EXIT_FAILURE, EXIT_ORPHAN, EXIT_REQUEST, SETUP_FD};
use crate::seccomp;

const RUNTIME_ENV: &str = "BURROW_CONTAINER";
const RUNTIME_DEFAULT: &str = "burrow-container";

const CODE_REQUEST: u8 = 0;
const CODE_ORPHAN: u8 = 1;

// SUID_DUMP_DISABLE from linux/prctl.h, not exposed by the libc crate
const SUID_DUMP_DISABLE: libc::c_int = 0;

static PRIV_PID: AtomicI32 = AtomicI32::new(0);
static NOTIFY_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_sigcont(_: libc::c_int, info: *mut libc::siginfo_t, _: *mut libc::c_void) {
    // SAFETY: everything here is async-signal-safe; si_pid is valid for
    // a SIGCONT delivered with SA_SIGINFO.
    unsafe {
        let si_pid = (*info).si_pid();
        let priv_pid = PRIV_PID.load(Ordering::Relaxed);
        let code: u8 = if si_pid == priv_pid {
            CODE_REQUEST
        } else if libc::getppid() != priv_pid {
            CODE_ORPHAN
        } else {
            2
        };
        let fd = NOTIFY_FD.load(Ordering::Relaxed);
        libc::write(fd, std::ptr::from_ref(&code).cast(), 1);
    }
}

/// Installs the SIGCONT handler and returns the notification pipe.
fn install_cancel_handler(priv_pid: i32) -> io::Result<OwnedFd> {
    let (read_end, write_end) = nix::unistd::pipe()?;
    PRIV_PID.store(priv_pid, Ordering::Relaxed);
    NOTIFY_FD.store(write_end.into_raw_fd(), Ordering::Relaxed);

    // SAFETY: handler and mask are fully initialised before the call.
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = on_sigcont as usize;
        sa.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
        libc::sigemptyset(&mut sa.sa_mask);
        if libc::sigaction(libc::SIGCONT, &sa, std::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(read_end)
}

/// Starts and supervises the container on behalf of the shim.
pub(crate) trait ContainerRuntime {
    /// Spawns the container and delivers its parameters.
    fn start(&mut self, params: &ContainerParams) -> io::Result<()>;
    /// Polls for container exit, returning its exit code when done.
    fn try_wait(&mut self) -> io::Result<Option<i32>>;
    /// Forwards cancellation into the container.
    fn cancel(&mut self) -> io::Result<()>;
    /// Terminates the container immediately.
    fn kill(&mut self) -> io::Result<()>;
}

/// Production runtime execing the container helper binary with the
/// parameters served over a setup pipe.
#[derive(Debug, Default)]
struct HelperRuntime {
    child: Option<Child>,
    // held open for the lifetime of the helper
    pipe: Option<UnixStream>,
}

impl HelperRuntime {
    fn pid(&self) -> Option<Pid> {
        self.child
            .as_ref()
            .and_then(|c| i32::try_from(c.id()).ok())
            .map(Pid::from_raw)
    }
}

impl ContainerRuntime for HelperRuntime {
    fn start(&mut self, params: &ContainerParams) -> io::Result<()> {
        let (mut parent, child_end) = UnixStream::pair()?;
        let program = std::env::var_os(RUNTIME_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(RUNTIME_DEFAULT));
        let mut cmd = Command::new(program);
        cmd.env_clear();
        cmd.env(ENV_SETUP_FD, SETUP_FD.to_string());
        let setup_fd = child_end.as_raw_fd();
        // SAFETY: dup2 is async-signal-safe and nothing else runs
        // between fork and exec.
        unsafe {
            cmd.pre_exec(move || {
                if libc::dup2(setup_fd, SETUP_FD) < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
        let child = cmd.spawn()?;
        drop(child_end);
        burrow_proto::encode(&mut parent, params)?;
        self.pipe = Some(parent);
        self.child = Some(child);
        Ok(())
    }

    fn try_wait(&mut self) -> io::Result<Option<i32>> {
        match &mut self.child {
            Some(child) => Ok(child
                .try_wait()?
                .map(|status| status.code().unwrap_or(EXIT_FAILURE))),
            None => Ok(Some(EXIT_FAILURE)),
        }
    }

    fn cancel(&mut self) -> io::Result<()> {
        match self.pid() {
            Some(pid) => kill(pid, Signal::SIGTERM).map_err(io::Error::from),
            None => Ok(()),
        }
    }

    fn kill(&mut self) -> io::Result<()> {
        match self.pid() {
            Some(pid) => kill(pid, Signal::SIGKILL).map_err(io::Error::from),
            None => Ok(()),
        }
    }
}

/// Entry point of the `burrow-shim` binary; returns its exit code.
pub fn shim_main() -> Result<i32> {
    // SAFETY: plain prctl calls with immediate arguments.
    unsafe {
        libc::prctl(libc::PR_SET_DUMPABLE, SUID_DUMP_DISABLE, 0, 0, 0);
    }

    let fd: RawFd = std::env::var(ENV_SETUP_FD)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "setup fd not advertised"))?;
    // SAFETY: the driver installed this fd for our exclusive use.
    let mut setup = unsafe { UnixStream::from_raw_fd(fd) };
    let state: OutcomeState = burrow_proto::decode(&mut setup)?;
    debug!(id = %state.id, "received outcome");

    let notify = install_cancel_handler(state.priv_pid)?;
    // SAFETY: plain prctl call.
    unsafe {
        libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGCONT, 0, 0, 0);
    }
    // the driver may have died between fork and here
    if nix::unistd::getppid().as_raw() != state.priv_pid {
        return Ok(EXIT_ORPHAN);
    }

    let mut ctx = ContainerContext::new(&state);
    for op in &state.ops {
        op.to_container(&mut ctx)?;
    }
    let params = ctx.params;

    // a pending request at this point aborts before the container runs
    match poll_notification(&notify, PollTimeout::ZERO)? {
        Some(CODE_ORPHAN) => return Ok(EXIT_ORPHAN),
        Some(CODE_REQUEST) => return Ok(EXIT_REQUEST),
        _ => {}
    }

    let mut runtime = HelperRuntime::default();
    if let Err(err) = runtime.start(&params) {
        error!(%err, "cannot start container");
        return Ok(EXIT_FAILURE);
    }

    // the shim itself needs none of the denied interfaces anymore
    seccomp::load(SeccompPresets::STRICT, params.seccomp_flags)?;

    monitor(
        &notify,
        &mut runtime,
        params.wait_delay,
        params.forward_cancel,
    )
}

/// Reads one notification byte, or `None` when the pipe is silent for
/// the duration of `timeout`.
fn poll_notification(notify: &OwnedFd, timeout: PollTimeout) -> io::Result<Option<u8>> {
    let mut fds = [PollFd::new(notify.as_fd(), PollFlags::POLLIN)];
    if poll(&mut fds, timeout)? == 0 {
        return Ok(None);
    }
    let mut buf = [0u8; 1];
    if nix::unistd::read(notify, &mut buf)? == 0 {
        return Ok(None);
    }
    Ok(Some(buf[0]))
}

/// Supervises the container until it exits or cancellation runs out of
/// patience.
fn monitor(
    notify: &OwnedFd,
    runtime: &mut dyn ContainerRuntime,
    wait_delay: Duration,
    forward_cancel: bool,
) -> Result<i32> {
    let mut deadline: Option<Instant> = None;
    let mut killed = false;
    let mut cancel_code = EXIT_CANCEL;
    loop {
        if let Some(code) = runtime.try_wait()? {
            return Ok(if deadline.is_some() { cancel_code } else { code });
        }

        match poll_notification(notify, PollTimeout::from(100u16))? {
            Some(CODE_ORPHAN) => {
                error!("orphaned, giving up");
                let _ = runtime.kill();
                return Ok(EXIT_ORPHAN);
            }
            Some(CODE_REQUEST) if deadline.is_none() => {
                debug!("cancelling container");
                if forward_cancel {
                    runtime.cancel()?;
                } else {
                    // nothing was forwarded, so this exit is the
                    // driver's request rather than a cancellation
                    runtime.kill()?;
                    killed = true;
                    cancel_code = EXIT_REQUEST;
                }
                deadline = Some(Instant::now() + wait_delay);
            }
            _ => {}
        }

        if !killed && deadline.is_some_and(|d| Instant::now() >= d) {
            error!("container unresponsive, killing");
            runtime.kill()?;
            killed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct ScriptedRuntime {
        exits_after_cancel: bool,
        cancelled: Cell<bool>,
        killed: Cell<bool>,
        code: i32,
        exits: Cell<bool>,
    }

    impl ScriptedRuntime {
        fn running(code: i32, exits_after_cancel: bool) -> Self {
            Self {
                exits_after_cancel,
                cancelled: Cell::new(false),
                killed: Cell::new(false),
                code,
                exits: Cell::new(false),
            }
        }
    }

    impl ContainerRuntime for ScriptedRuntime {
        fn start(&mut self, _params: &ContainerParams) -> io::Result<()> {
            Ok(())
        }

        fn try_wait(&mut self) -> io::Result<Option<i32>> {
            if self.exits.get() || self.killed.get() {
                return Ok(Some(self.code));
            }
            if self.cancelled.get() && self.exits_after_cancel {
                return Ok(Some(self.code));
            }
            Ok(None)
        }

        fn cancel(&mut self) -> io::Result<()> {
            self.cancelled.set(true);
            Ok(())
        }

        fn kill(&mut self) -> io::Result<()> {
            self.killed.set(true);
            Ok(())
        }
    }

    fn notification_pipe(bytes: &[u8]) -> OwnedFd {
        let (read_end, write_end) = nix::unistd::pipe().unwrap();
        nix::unistd::write(&write_end, bytes).unwrap();
        drop(write_end);
        read_end
    }

    #[test]
    fn natural_exit_passes_code_through() {
        let mut runtime = ScriptedRuntime::running(7, false);
        runtime.exits.set(true);
        let notify = notification_pipe(b"");
        let code = monitor(&notify, &mut runtime, Duration::from_secs(5), true).unwrap();
        assert_eq!(code, 7);
    }

    #[test]
    fn orphan_notification_exits_immediately() {
        let mut runtime = ScriptedRuntime::running(0, false);
        let notify = notification_pipe(&[CODE_ORPHAN]);
        let code = monitor(&notify, &mut runtime, Duration::from_secs(5), true).unwrap();
        assert_eq!(code, EXIT_ORPHAN);
    }

    #[test]
    fn cancellation_forwards_and_reports_cancel() {
        let mut runtime = ScriptedRuntime::running(0, true);
        let notify = notification_pipe(&[CODE_REQUEST]);
        let code = monitor(&notify, &mut runtime, Duration::from_secs(5), true).unwrap();
        assert_eq!(code, EXIT_CANCEL);
        assert!(runtime.cancelled.get());
        assert!(!runtime.killed.get());
    }

    #[test]
    fn unforwarded_cancel_reports_request() {
        let mut runtime = ScriptedRuntime::running(0, false);
        let notify = notification_pipe(&[CODE_REQUEST]);
        let code = monitor(&notify, &mut runtime, Duration::from_secs(5), false).unwrap();
        assert_eq!(code, EXIT_REQUEST);
        assert!(runtime.killed.get());
        assert!(!runtime.cancelled.get());
    }

    #[test]
    fn unresponsive_container_is_killed() {
        let mut runtime = ScriptedRuntime::running(0, false);
        let notify = notification_pipe(&[CODE_REQUEST]);
        let code = monitor(&notify, &mut runtime, Duration::from_millis(50), true).unwrap();
        assert_eq!(code, EXIT_CANCEL);
        assert!(runtime.killed.get());
    }
}
