//! Framing for the setup pipes.
//!
//! The driver hands serialised state to the shim, and the shim hands
//! container parameters to the helper, each over an inherited pipe. A
//! message travels as a 4-byte big-endian payload length followed by
//! the postcard payload, and both directions refuse payloads above
//! [`SETUP_FRAME_LIMIT`] so a corrupt header cannot trigger an
//! arbitrary allocation.

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};

/// Environment variable holding the setup pipe fd in the shim process.
pub const ENV_SETUP_FD: &str = "BURROW_SHIM";

/// Upper bound on a setup payload. Real setup messages are a few
/// kilobytes; anything near this is a framing error.
const SETUP_FRAME_LIMIT: usize = 16 * 1024 * 1024;

/// Writes `msg` to the setup pipe as one framed postcard payload.
pub fn encode<W: Write>(w: &mut W, msg: &impl Serialize) -> io::Result<()> {
    let payload =
        postcard::to_allocvec(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > SETUP_FRAME_LIMIT {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "setup frame too large",
        ));
    }
    let len = u32::try_from(payload.len())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    w.write_all(&len.to_be_bytes())?;
    w.write_all(&payload)?;
    w.flush()
}

/// Reads one framed postcard payload from the setup pipe.
pub fn decode<T: for<'de> Deserialize<'de>>(r: &mut impl Read) -> io::Result<T> {
    let mut header = [0u8; 4];
    r.read_exact(&mut header)?;
    let len = u32::from_be_bytes(header) as usize;
    if len > SETUP_FRAME_LIMIT {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "setup frame too large",
        ));
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)?;
    postcard::from_bytes(&payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
