//! POSIX ACL editing through the `system.posix_acl_access` xattr.
//!
//! The access ACL of a file is stored in a small fixed-layout xattr:
//! a 4-byte little-endian version header followed by 8-byte entries of
//! `{u16 tag, u16 perm, u32 id}`. Editing that buffer directly avoids a
//! libacl dependency; the layout is part of the kernel ABI.

#![allow(unsafe_code)]

use std::ffi::{CStr, CString};
use std::fmt;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

const ACL_EA_ACCESS: &CStr = c"system.posix_acl_access";
const ACL_EA_VERSION: u32 = 0x0002;

const TAG_USER_OBJ: u16 = 0x01;
const TAG_USER: u16 = 0x02;
const TAG_GROUP_OBJ: u16 = 0x04;
const TAG_GROUP: u16 = 0x08;
const TAG_MASK: u16 = 0x10;
const TAG_OTHER: u16 = 0x20;

const UNDEFINED_ID: u32 = u32::MAX;

/// Permission bits of one ACL entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AclPerms(u16);

impl AclPerms {
    /// Read permission.
    pub const READ: Self = Self(0x04);
    /// Write permission.
    pub const WRITE: Self = Self(0x02);
    /// Execute (search) permission.
    pub const EXECUTE: Self = Self(0x01);

    /// No permissions; an update with this value strips the entry.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Whether no bit is set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether every bit of `other` is set in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of the two sets.
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl std::ops::BitOr for AclPerms {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl fmt::Display for AclPerms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = ['-'; 3];
        if self.contains(Self::READ) {
            s[0] = 'r';
        }
        if self.contains(Self::WRITE) {
            s[1] = 'w';
        }
        if self.contains(Self::EXECUTE) {
            s[2] = 'x';
        }
        write!(f, "{}{}{}", s[0], s[1], s[2])
    }
}

/// One decoded ACL entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    tag: u16,
    perm: u16,
    id: u32,
}

/// Decodes an `system.posix_acl_access` xattr value.
fn parse(data: &[u8]) -> io::Result<Vec<Entry>> {
    if data.len() < 4 || (data.len() - 4) % 8 != 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "short ACL xattr"));
    }
    let version = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    if version != ACL_EA_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unsupported ACL version",
        ));
    }
    let mut entries = Vec::with_capacity((data.len() - 4) / 8);
    for chunk in data[4..].chunks_exact(8) {
        entries.push(Entry {
            tag: u16::from_le_bytes([chunk[0], chunk[1]]),
            perm: u16::from_le_bytes([chunk[2], chunk[3]]),
            id: u32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]),
        });
    }
    Ok(entries)
}

/// Encodes entries back into xattr form.
fn encode(entries: &[Entry]) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + entries.len() * 8);
    data.extend_from_slice(&ACL_EA_VERSION.to_le_bytes());
    for e in entries {
        data.extend_from_slice(&e.tag.to_le_bytes());
        data.extend_from_slice(&e.perm.to_le_bytes());
        data.extend_from_slice(&e.id.to_le_bytes());
    }
    data
}

/// Synthesises the minimal ACL equivalent to a plain file mode.
fn from_mode(mode: u32) -> Vec<Entry> {
    vec![
        Entry {
            tag: TAG_USER_OBJ,
            perm: ((mode >> 6) & 7) as u16,
            id: UNDEFINED_ID,
        },
        Entry {
            tag: TAG_GROUP_OBJ,
            perm: ((mode >> 3) & 7) as u16,
            id: UNDEFINED_ID,
        },
        Entry {
            tag: TAG_OTHER,
            perm: (mode & 7) as u16,
            id: UNDEFINED_ID,
        },
    ]
}

/// Replaces the `ACL_USER` entry for `uid`, recomputes the mask, and
/// returns the new entry list in canonical order. Empty `perms` removes
/// the entry.
fn update(entries: &[Entry], uid: u32, perms: AclPerms) -> Vec<Entry> {
    let mut out: Vec<Entry> = entries
        .iter()
        .copied()
        .filter(|e| !(e.tag == TAG_USER && e.id == uid) && e.tag != TAG_MASK)
        .collect();
    if !perms.is_empty() {
        out.push(Entry {
            tag: TAG_USER,
            perm: perms.0,
            id: uid,
        });
    }

    // Canonical order: USER_OBJ, USER (by id), GROUP_OBJ, GROUP (by id),
    // MASK, OTHER.
    out.sort_by_key(|e| (e.tag, e.id));

    let extended = out
        .iter()
        .any(|e| e.tag == TAG_USER || e.tag == TAG_GROUP);
    if extended {
        let mask = out
            .iter()
            .filter(|e| matches!(e.tag, TAG_USER | TAG_GROUP | TAG_GROUP_OBJ))
            .fold(0u16, |m, e| m | e.perm);
        let pos = out
            .iter()
            .position(|e| e.tag == TAG_OTHER)
            .unwrap_or(out.len());
        out.insert(
            pos,
            Entry {
                tag: TAG_MASK,
                perm: mask,
                id: UNDEFINED_ID,
            },
        );
    }
    out
}

/// Whether the list carries nothing beyond the plain file mode.
fn is_minimal(entries: &[Entry]) -> bool {
    entries
        .iter()
        .all(|e| matches!(e.tag, TAG_USER_OBJ | TAG_GROUP_OBJ | TAG_OTHER))
}

fn cpath(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NUL in pathname"))
}

fn getxattr(path: &Path) -> io::Result<Option<Vec<u8>>> {
    let p = cpath(path)?;
    let mut buf = vec![0u8; 4 + 64 * 8];
    loop {
        // SAFETY: p and buf outlive the call; length matches the buffer.
        let n = unsafe {
            libc::getxattr(
                p.as_ptr(),
                ACL_EA_ACCESS.as_ptr(),
                buf.as_mut_ptr().cast(),
                buf.len(),
            )
        };
        if n >= 0 {
            buf.truncate(n as usize);
            return Ok(Some(buf));
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ENODATA) => return Ok(None),
            Some(libc::ERANGE) => buf.resize(buf.len() * 2, 0),
            _ => return Err(err),
        }
    }
}

fn setxattr(path: &Path, data: &[u8]) -> io::Result<()> {
    let p = cpath(path)?;
    // SAFETY: p and data outlive the call; length matches the buffer.
    let r = unsafe {
        libc::setxattr(
            p.as_ptr(),
            ACL_EA_ACCESS.as_ptr(),
            data.as_ptr().cast(),
            data.len(),
            0,
        )
    };
    if r < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn removexattr(path: &Path) -> io::Result<()> {
    let p = cpath(path)?;
    // SAFETY: p outlives the call.
    let r = unsafe { libc::removexattr(p.as_ptr(), ACL_EA_ACCESS.as_ptr()) };
    if r < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENODATA) {
            return Ok(());
        }
        return Err(err);
    }
    Ok(())
}

/// Updates the `ACL_USER` entry for `uid` on `path`.
///
/// Empty `perms` strips the entry; when that leaves only the base
/// entries the xattr is removed entirely.
pub fn update_file(path: &Path, uid: u32, perms: AclPerms) -> io::Result<()> {
    let entries = match getxattr(path)? {
        Some(data) => parse(&data)?,
        None => {
            if perms.is_empty() {
                return Ok(());
            }
            let meta = std::fs::metadata(path)?;
            use std::os::unix::fs::MetadataExt;
            from_mode(meta.mode())
        }
    };
    let updated = update(&entries, uid, perms);
    if is_minimal(&updated) {
        removexattr(path)
    } else {
        setxattr(path, &encode(&updated))
    }
}
