//! Interaction with the setuid helper.
//!
//! The helper maps calling users to small consecutive ids via its own
//! configuration file and re-executes its argument with privileges. It
//! is the only privileged component burrow relies on.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;

use tracing::debug;

use crate::error::{Error, Result};

const BSU_ENV: &str = "BURROW_BSU";
const BSU_DEFAULT: &str = "/usr/bin/bsu";

/// Pathname of the setuid helper binary.
pub(crate) fn path() -> PathBuf {
    std::env::var_os(BSU_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(BSU_DEFAULT))
}

/// Command invoking the helper with a scrubbed environment.
///
/// The helper refuses unexpected environment variables, so the caller
/// adds back exactly what the invocation needs.
pub(crate) fn command() -> Command {
    let mut cmd = Command::new(path());
    cmd.env_clear().current_dir("/");
    cmd
}

/// Queries the helper for the id it assigns to the calling user.
///
/// The id decides the uid range the sandbox accounts live in; it is
/// stable for the lifetime of the process and cached after the first
/// successful probe.
pub(crate) fn query_id() -> Result<u32> {
    static CACHE: OnceLock<u32> = OnceLock::new();
    if let Some(id) = CACHE.get() {
        return Ok(*id);
    }
    let id = probe(&path())?;
    let _ = CACHE.set(id);
    Ok(id)
}

fn probe(path: &Path) -> Result<u32> {
    let mut cmd = Command::new(path);
    cmd.env_clear().current_dir("/");
    let output = cmd.output()?;
    if !output.status.success() {
        return Err(match output.status.code() {
            Some(1) => Error::BsuDenied,
            _ => Error::BsuProto,
        });
    }
    let id = std::str::from_utf8(&output.stdout)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .ok_or(Error::BsuProto)?;
    debug!(id, "setuid helper assigned id");
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn fake_helper(script: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bsu");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        (dir, path)
    }

    #[test]
    fn parses_decimal_id() {
        let (_dir, path) = fake_helper("#!/bin/sh\necho 5\n");
        assert_eq!(probe(&path).unwrap(), 5);
    }

    #[test]
    fn exit_one_means_denied() {
        let (_dir, path) = fake_helper("#!/bin/sh\nexit 1\n");
        assert!(matches!(probe(&path), Err(Error::BsuDenied)));
    }

    #[test]
    fn garbage_output_rejected() {
        let (_dir, path) = fake_helper("#!/bin/sh\necho not-a-number\n");
        assert!(matches!(probe(&path), Err(Error::BsuProto)));
    }
}
