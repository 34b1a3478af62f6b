//! xdg-dbus-proxy supervision.
//!
//! The proxy receives its NUL-terminated argument list through one pipe
//! (`--args=<fd>`) and signals readiness with a single byte on another
//! (`--fd=<fd>`). Closing our end of the status pipe asks the proxy to
//! exit. Proxy output is demultiplexed into a bounded line buffer.

#![allow(unsafe_code)]

use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{debug, info};

use super::ProxySpec;
use crate::sys::BusProxy;

/// Pathname of the proxy binary, overridable for packaging.
const PROXY_ENV: &str = "BURROW_DBUS_PROXY";
const PROXY_DEFAULT: &str = "xdg-dbus-proxy";

/// Fd indices the child receives the pipes on.
const ARGS_FD: i32 = 3;
const STATUS_FD: i32 = 4;

/// Hard cap on buffered proxy output.
const MAX_BUFFER: usize = 16 * 1024 * 1024;

/// Lines with this prefix are surfaced immediately instead of buffered.
const PASSTHROUGH: &[u8] = b"init: ";

/// Bounded line demultiplexer for proxy output.
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    buf: Vec<u8>,
    partial: Vec<u8>,
    dropped: usize,
}

impl LineBuffer {
    /// Buffered lines prefixed for display, plus a dropped-bytes notice.
    pub(crate) fn dump(&self) -> String {
        let mut out = String::new();
        for line in self.buf.split(|&b| b == b'\n') {
            if line.is_empty() {
                continue;
            }
            out.push_str("(dbus) ");
            out.push_str(&String::from_utf8_lossy(line));
            out.push('\n');
        }
        if !self.partial.is_empty() {
            out.push_str("(dbus) ");
            out.push_str(&String::from_utf8_lossy(&self.partial));
            out.push('\n');
        }
        if self.dropped != 0 {
            out.push_str(&format!("(dbus) ... {} bytes dropped\n", self.dropped));
        }
        out
    }

    fn take_line(&mut self) -> Option<Vec<u8>> {
        let pos = self.partial.iter().position(|&b| b == b'\n')?;
        let rest = self.partial.split_off(pos + 1);
        let mut line = std::mem::replace(&mut self.partial, rest);
        line.pop();
        Some(line)
    }
}

impl Write for LineBuffer {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.buf.len() + self.partial.len() >= MAX_BUFFER {
            self.dropped += data.len();
            return Err(io::Error::from_raw_os_error(libc::ENOMEM));
        }
        self.partial.extend_from_slice(data);
        while let Some(line) = self.take_line() {
            if line.starts_with(PASSTHROUGH) {
                info!(target: "dbus", "{}", String::from_utf8_lossy(&line));
            } else {
                self.buf.extend_from_slice(&line);
                self.buf.push(b'\n');
            }
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A running xdg-dbus-proxy instance.
#[derive(Debug)]
pub(crate) struct Proxy {
    child: Child,
    status: Option<OwnedFd>,
    sockets: Vec<std::path::PathBuf>,
    output: Arc<Mutex<LineBuffer>>,
    pumps: Vec<thread::JoinHandle<()>>,
}

impl Proxy {
    /// Spawns the proxy for `spec` and hands it its argument list.
    pub(crate) fn spawn(spec: &ProxySpec) -> io::Result<Self> {
        let (args_r, args_w) = nix::unistd::pipe()?;
        let (status_r, status_w) = nix::unistd::pipe()?;

        let path =
            std::env::var(PROXY_ENV).unwrap_or_else(|_| PROXY_DEFAULT.to_owned());
        let mut command = Command::new(path);
        command
            .arg(format!("--args={ARGS_FD}"))
            .arg(format!("--fd={STATUS_FD}"))
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let args_raw = args_r.as_raw_fd();
        let status_raw = status_w.as_raw_fd();
        // SAFETY: only async-signal-safe calls between fork and exec.
        unsafe {
            command.pre_exec(move || {
                if libc::dup2(args_raw, ARGS_FD) < 0 || libc::dup2(status_raw, STATUS_FD) < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = command.spawn()?;
        drop(args_r);
        drop(status_w);

        let output = Arc::new(Mutex::new(LineBuffer::default()));
        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            pumps.push(pump(stdout, Arc::clone(&output)));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(pump(stderr, Arc::clone(&output)));
        }

        // NUL-terminated argument list through the args pipe
        let mut args_pipe = std::fs::File::from(args_w);
        for arg in spec.args() {
            args_pipe.write_all(arg.as_bytes())?;
            args_pipe.write_all(&[0])?;
        }
        drop(args_pipe);

        debug!(pid = child.id(), "proxy spawned");
        Ok(Self {
            child,
            status: Some(status_r),
            sockets: spec.sockets(),
            output,
            pumps,
        })
    }
}

fn pump(mut src: impl Read + Send + 'static, dst: Arc<Mutex<LineBuffer>>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut chunk = [0u8; 4096];
        loop {
            match src.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let Ok(mut buffer) = dst.lock() else { break };
                    if buffer.write(&chunk[..n]).is_err() {
                        break;
                    }
                }
            }
        }
    })
}

impl BusProxy for Proxy {
    fn wait_ready(&mut self) -> io::Result<()> {
        let Some(status) = &self.status else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "proxy stopped"));
        };
        let mut byte = [0u8; 1];
        let mut pipe = std::fs::File::from(status.try_clone()?);
        if pipe.read(&mut byte)? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "proxy exited before signalling readiness",
            ));
        }
        debug!("proxy ready");
        Ok(())
    }

    fn stop(&mut self) {
        // the proxy exits when its status fd peer goes away
        self.status = None;
    }

    fn wait(&mut self) -> io::Result<()> {
        let status = self.child.wait()?;
        for pump in self.pumps.drain(..) {
            let _ = pump.join();
        }
        for socket in &self.sockets {
            match std::fs::remove_file(socket) {
                Ok(()) => debug!(?socket, "removed dangling socket"),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            }
        }
        if !status.success() {
            return Err(io::Error::other(format!("proxy exited with {status}")));
        }
        Ok(())
    }

    fn output(&self) -> String {
        self.output
            .lock()
            .map(|buffer| buffer.dump())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_and_buffering() {
        let mut buffer = LineBuffer::default();
        buffer.write_all(b"init: starting\n").unwrap();
        buffer.write_all(b"C: watch org.freedesktop.DBus\n").unwrap();
        buffer.write_all(b"half").unwrap();
        let dump = buffer.dump();
        assert!(!dump.contains("init: starting"));
        assert!(dump.contains("(dbus) C: watch org.freedesktop.DBus\n"));
        assert!(dump.contains("(dbus) half\n"));
    }

    #[test]
    fn split_writes_reassemble_lines() {
        let mut buffer = LineBuffer::default();
        buffer.write_all(b"one ").unwrap();
        buffer.write_all(b"line\ntwo\n").unwrap();
        let dump = buffer.dump();
        assert!(dump.contains("(dbus) one line\n"));
        assert!(dump.contains("(dbus) two\n"));
    }

    #[test]
    fn overflow_fails_with_enomem() {
        let mut buffer = LineBuffer::default();
        let chunk = vec![b'x'; 1024 * 1024];
        // one byte short of the threshold still goes through
        for _ in 0..15 {
            buffer.write_all(&chunk).unwrap();
        }
        buffer.write_all(&vec![b'x'; 1024 * 1024 - 1]).unwrap();
        buffer.write_all(b"x").unwrap();

        // at the threshold the very next byte is refused
        let err = buffer.write(b"x").unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOMEM));
        assert!(buffer.dump().contains("1 bytes dropped"));
    }
}
