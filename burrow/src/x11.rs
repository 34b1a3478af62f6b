//! X11 host list manipulation.

use std::io;

use tracing::debug;
use x11rb::connection::Connection;
use x11rb::protocol::xproto::{ConnectionExt, Family, HostMode};

/// Inserts or deletes a ServerInterpreted `localuser` entry on the X
/// server at `display`, the xhost `SI:localuser:<name>` form.
pub(crate) fn change_hosts(display: &str, insert: bool, name: &str) -> io::Result<()> {
    let (conn, _screen) = x11rb::connect(Some(display)).map_err(io::Error::other)?;

    let mode = if insert {
        HostMode::INSERT
    } else {
        HostMode::DELETE
    };
    let mut address = Vec::with_capacity(10 + name.len());
    address.extend_from_slice(b"localuser");
    address.push(0);
    address.extend_from_slice(name.as_bytes());

    conn.change_hosts(mode, Family::SERVER_INTERPRETED, &address)
        .map_err(io::Error::other)?
        .check()
        .map_err(io::Error::other)?;
    conn.flush().map_err(io::Error::other)?;
    // `display` would be shadowed by `use tracing::field::display` inside
    // the macro expansion, so rebind it first.
    let dpy = display;
    debug!(on = dpy, ?mode, name, "changed X11 host list");
    Ok(())
}

/// Resolves a DISPLAY string to the pathname of the server socket.
///
/// `:n` and `unix:n` select `/tmp/.X11-unix/Xn`; `unix:/path` selects
/// the path itself. Screen suffixes are stripped. Hostname forms have
/// no socket to grant access to and resolve to `None`.
pub(crate) fn display_socket(display: &str) -> Option<std::path::PathBuf> {
    let rest = display
        .strip_prefix(':')
        .or_else(|| display.strip_prefix("unix:"))?;
    let rest = rest.rsplit_once('.').map_or(rest, |(head, screen)| {
        if screen.chars().all(|c| c.is_ascii_digit()) && !head.is_empty() {
            head
        } else {
            rest
        }
    });
    if rest.starts_with('/') {
        return Some(rest.into());
    }
    if rest.chars().all(|c| c.is_ascii_digit()) && !rest.is_empty() {
        return Some(format!("/tmp/.X11-unix/X{rest}").into());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn resolves_display_numbers() {
        assert_eq!(
            display_socket(":0"),
            Some(PathBuf::from("/tmp/.X11-unix/X0"))
        );
        assert_eq!(
            display_socket(":1.0"),
            Some(PathBuf::from("/tmp/.X11-unix/X1"))
        );
        assert_eq!(
            display_socket("unix:10"),
            Some(PathBuf::from("/tmp/.X11-unix/X10"))
        );
    }

    #[test]
    fn resolves_socket_paths() {
        assert_eq!(
            display_socket("unix:/run/x11/sock"),
            Some(PathBuf::from("/run/x11/sock"))
        );
    }

    #[test]
    fn hostname_displays_unsupported() {
        assert_eq!(display_socket("remote:0"), None);
        assert_eq!(display_socket(""), None);
        assert_eq!(display_socket(":abc"), None);
    }
}
