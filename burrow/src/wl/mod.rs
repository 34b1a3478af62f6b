//! Wayland security-context-v1 client.
//!
//! Instead of handing the compositor socket to the sandbox directly,
//! burrow binds a fresh listener socket, attaches it to the compositor
//! as a security context tagged with the instance's application id, and
//! bind-mounts the listener into the container. The compositor closes
//! the listener when the close-fd pipe is dropped at revert.

mod wire;

use std::io::{self, IoSlice, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::thread;

use nix::sys::socket::{
    AddressFamily, Backlog, ControlMessage, MsgFlags, SockFlag, SockType, UnixAddr, bind, listen,
    sendmsg, socket,
};
use tracing::debug;

use crate::sys::{WaylandRequest, WaylandSession};
use wire::{Arg, Header, Reader};

const MANAGER_INTERFACE: &str = "wp_security_context_manager_v1";

// fixed object ids of the short-lived setup connection
const DISPLAY: u32 = 1;
const REGISTRY: u32 = 2;
const CALLBACK_GLOBALS: u32 = 3;
const MANAGER: u32 = 4;
const CONTEXT: u32 = 5;
const CALLBACK_COMMIT: u32 = 6;

// wl_display requests
const DISPLAY_SYNC: u16 = 0;
const DISPLAY_GET_REGISTRY: u16 = 1;
// wl_display events
const EVENT_ERROR: u16 = 0;
// wl_registry requests and events
const REGISTRY_BIND: u16 = 0;
const EVENT_GLOBAL: u16 = 0;
// wp_security_context_manager_v1 requests
const MANAGER_CREATE_LISTENER: u16 = 1;
// wp_security_context_v1 requests
const CONTEXT_SET_SANDBOX_ENGINE: u16 = 1;
const CONTEXT_SET_APP_ID: u16 = 2;
const CONTEXT_SET_INSTANCE_ID: u16 = 3;
const CONTEXT_COMMIT: u16 = 4;

/// An established security context.
///
/// The connection is held open for the instance lifetime; dropping the
/// close-fd write end detaches the brokered listener.
#[derive(Debug)]
pub(crate) struct Session {
    stream: UnixStream,
    close_fd: Option<OwnedFd>,
    reader: Option<thread::JoinHandle<()>>,
}

impl Session {
    /// Connects to the compositor and brokers a listener per `req`.
    pub(crate) fn attach(req: &WaylandRequest) -> io::Result<Self> {
        let mut stream = UnixStream::connect(&req.display)?;

        stream.write_all(&wire::message(
            DISPLAY,
            DISPLAY_GET_REGISTRY,
            &[Arg::Uint(REGISTRY)],
        )?)?;
        stream.write_all(&wire::message(
            DISPLAY,
            DISPLAY_SYNC,
            &[Arg::Uint(CALLBACK_GLOBALS)],
        )?)?;

        let mut manager = None;
        dispatch_until_done(&mut stream, CALLBACK_GLOBALS, |name, interface, version| {
            if interface == MANAGER_INTERFACE {
                manager = Some((name, version));
            }
        })?;
        let Some((name, version)) = manager else {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "compositor does not support security-context-v1",
            ));
        };
        stream.write_all(&wire::message(
            REGISTRY,
            REGISTRY_BIND,
            &[
                Arg::Uint(name),
                Arg::Str(MANAGER_INTERFACE),
                Arg::Uint(version.min(1)),
                Arg::Uint(MANAGER),
            ],
        )?)?;

        let listen_fd = bind_listener(&req.bind)?;
        let (close_r, close_w) = nix::unistd::pipe()?;

        // create_listener carries both fds in one control message
        let msg = wire::message(MANAGER, MANAGER_CREATE_LISTENER, &[Arg::Uint(CONTEXT)])?;
        let fds = [listen_fd.as_raw_fd(), close_r.as_raw_fd()];
        sendmsg::<UnixAddr>(
            stream.as_raw_fd(),
            &[IoSlice::new(&msg)],
            &[ControlMessage::ScmRights(&fds)],
            MsgFlags::empty(),
            None,
        )?;
        drop(listen_fd);
        drop(close_r);

        stream.write_all(&wire::message(
            CONTEXT,
            CONTEXT_SET_SANDBOX_ENGINE,
            &[Arg::Str(&req.engine)],
        )?)?;
        stream.write_all(&wire::message(
            CONTEXT,
            CONTEXT_SET_APP_ID,
            &[Arg::Str(&req.app_id)],
        )?)?;
        stream.write_all(&wire::message(
            CONTEXT,
            CONTEXT_SET_INSTANCE_ID,
            &[Arg::Str(&req.instance_id)],
        )?)?;
        stream.write_all(&wire::message(CONTEXT, CONTEXT_COMMIT, &[])?)?;

        // roundtrip so a protocol error surfaces here, not at app launch
        stream.write_all(&wire::message(
            DISPLAY,
            DISPLAY_SYNC,
            &[Arg::Uint(CALLBACK_COMMIT)],
        )?)?;
        dispatch_until_done(&mut stream, CALLBACK_COMMIT, |_, _, _| {})?;

        debug!(app_id = %req.app_id, "security context committed");

        // drain further events so the compositor never blocks on us
        let keep_alive = stream.try_clone()?;
        let reader = thread::spawn(move || {
            let mut sink = keep_alive;
            let mut chunk = [0u8; 4096];
            while matches!(sink.read(&mut chunk), Ok(n) if n > 0) {}
        });

        Ok(Self {
            stream,
            close_fd: Some(close_w),
            reader: Some(reader),
        })
    }
}

impl WaylandSession for Session {
    fn close(&mut self) -> io::Result<()> {
        self.close_fd = None;
        self.stream.shutdown(std::net::Shutdown::Both)?;
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        Ok(())
    }
}

/// Binds and listens on a fresh unix socket at `path`.
fn bind_listener(path: &std::path::Path) -> io::Result<OwnedFd> {
    let fd = socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        None,
    )?;
    let addr = UnixAddr::new(path)?;
    bind(fd.as_raw_fd(), &addr)?;
    listen(&fd, Backlog::MAXCONN)?;
    Ok(fd)
}

/// Reads events until the sync callback `done` fires, feeding registry
/// globals to `on_global` and failing on `wl_display.error`.
fn dispatch_until_done(
    stream: &mut UnixStream,
    done_object: u32,
    mut on_global: impl FnMut(u32, &str, u32),
) -> io::Result<()> {
    loop {
        let mut head = [0u8; 8];
        stream.read_exact(&mut head)?;
        let header = Header::parse(head)?;
        let mut body = vec![0u8; header.size as usize - 8];
        stream.read_exact(&mut body)?;

        if header.object == done_object {
            return Ok(());
        }
        match (header.object, header.opcode) {
            (DISPLAY, EVENT_ERROR) => {
                let mut reader = Reader::new(&body);
                let object = reader.uint()?;
                let code = reader.uint()?;
                let text = reader.string()?;
                return Err(io::Error::other(format!(
                    "wayland error {code} on object {object}: {text}"
                )));
            }
            (REGISTRY, EVENT_GLOBAL) => {
                let mut reader = Reader::new(&body);
                let name = reader.uint()?;
                let interface = reader.string()?;
                let version = reader.uint()?;
                on_global(name, &interface, version);
            }
            _ => {}
        }
    }
}
