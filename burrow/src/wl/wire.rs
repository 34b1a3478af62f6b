//! Minimal Wayland wire format helpers.
//!
//! Messages are a 64-bit header (object id, then size and opcode packed
//! into one word) followed by 32-bit aligned arguments, all in host
//! byte order. Only the argument kinds the security-context handshake
//! needs are implemented.

use std::io;

/// Upper bound accepted for any length field before arithmetic.
pub(super) const MAX_MESSAGE_SIZE: usize = 0x00ff_ffff;

/// Rejects sizes that could overflow header arithmetic.
pub(super) fn check_size(size: usize) -> io::Result<()> {
    if size > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "wayland message size out of bounds",
        ));
    }
    Ok(())
}

/// One request argument.
#[derive(Debug, Clone, Copy)]
pub(super) enum Arg<'a> {
    /// `uint` and `new_id` share the wire form.
    Uint(u32),
    /// Length-prefixed NUL-terminated string, padded to 32 bits.
    Str(&'a str),
}

/// Parsed message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct Header {
    pub object: u32,
    pub opcode: u16,
    pub size: u16,
}

impl Header {
    /// Decodes the 8-byte header.
    pub(super) fn parse(data: [u8; 8]) -> io::Result<Self> {
        let object = u32::from_ne_bytes([data[0], data[1], data[2], data[3]]);
        let word = u32::from_ne_bytes([data[4], data[5], data[6], data[7]]);
        let size = (word >> 16) as u16;
        if (size as usize) < 8 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "wayland message shorter than its header",
            ));
        }
        Ok(Self {
            object,
            opcode: (word & 0xffff) as u16,
            size,
        })
    }
}

/// Serialises one request.
pub(super) fn message(object: u32, opcode: u16, args: &[Arg<'_>]) -> io::Result<Vec<u8>> {
    let mut body = Vec::new();
    for arg in args {
        match arg {
            Arg::Uint(v) => body.extend_from_slice(&v.to_ne_bytes()),
            Arg::Str(s) => {
                check_size(s.len())?;
                let len = s.len() as u32 + 1;
                body.extend_from_slice(&len.to_ne_bytes());
                body.extend_from_slice(s.as_bytes());
                body.push(0);
                while body.len() % 4 != 0 {
                    body.push(0);
                }
            }
        }
    }
    let size = 8 + body.len();
    check_size(size)?;
    let size = u16::try_from(size)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "wayland message too long"))?;

    let mut out = Vec::with_capacity(size as usize);
    out.extend_from_slice(&object.to_ne_bytes());
    out.extend_from_slice(&(((size as u32) << 16) | (opcode as u32)).to_ne_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Cursor over a received message body.
#[derive(Debug)]
pub(super) struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    pub(super) fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn truncated() -> io::Error {
        io::Error::new(io::ErrorKind::InvalidData, "truncated wayland argument")
    }

    /// Reads a `uint` argument.
    pub(super) fn uint(&mut self) -> io::Result<u32> {
        let (head, rest) = self
            .data
            .split_at_checked(4)
            .ok_or_else(Self::truncated)?;
        self.data = rest;
        Ok(u32::from_ne_bytes([head[0], head[1], head[2], head[3]]))
    }

    /// Reads a `string` argument.
    pub(super) fn string(&mut self) -> io::Result<String> {
        let len = self.uint()? as usize;
        check_size(len)?;
        if len == 0 {
            return Ok(String::new());
        }
        let padded = len.div_ceil(4) * 4;
        let (head, rest) = self
            .data
            .split_at_checked(padded)
            .ok_or_else(Self::truncated)?;
        self.data = rest;
        // len includes the terminating NUL
        String::from_utf8(head[..len - 1].to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "non-UTF-8 wayland string"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_bound_is_exact() {
        check_size(MAX_MESSAGE_SIZE).unwrap();
        assert!(check_size(MAX_MESSAGE_SIZE + 1).is_err());
        assert!(check_size(0x0100_0000).is_err());
    }

    #[test]
    fn builds_get_registry() {
        let msg = message(1, 1, &[Arg::Uint(2)]).unwrap();
        assert_eq!(msg.len(), 12);
        let header = Header::parse(msg[..8].try_into().unwrap()).unwrap();
        assert_eq!(
            header,
            Header {
                object: 1,
                opcode: 1,
                size: 12
            }
        );
        let mut reader = Reader::new(&msg[8..]);
        assert_eq!(reader.uint().unwrap(), 2);
    }

    #[test]
    fn string_args_roundtrip_with_padding() {
        let msg = message(5, 1, &[Arg::Str("moe.burrow")]).unwrap();
        // 8 header + 4 length + 11 bytes padded to 12
        assert_eq!(msg.len(), 24);
        let mut reader = Reader::new(&msg[8..]);
        assert_eq!(reader.string().unwrap(), "moe.burrow");
    }

    #[test]
    fn rejects_short_header() {
        assert!(Header::parse([1, 0, 0, 0, 0, 0, 4, 0]).is_err());
    }

    #[test]
    fn reader_rejects_truncated_args() {
        let msg = message(2, 0, &[Arg::Uint(7), Arg::Str("wl_shm")]).unwrap();
        let mut reader = Reader::new(&msg[8..msg.len() - 2]);
        assert_eq!(reader.uint().unwrap(), 7);
        assert!(reader.string().is_err());
    }
}
