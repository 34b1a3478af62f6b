use std::fmt;
use std::io;

use burrow_proto::{Absolute, Enablement};
use tracing::debug;

use super::{Op, OpError};
use crate::sys::Syscalls;

/// Creates a directory, either tolerating an existing one (ensure) or
/// owning it for the instance lifetime (ephemeral).
#[derive(Debug)]
pub(super) struct MkdirOp {
    scope: Enablement,
    path: Absolute,
    perm: u32,
    ephemeral: bool,
}

impl MkdirOp {
    pub(super) fn ensure(scope: Enablement, path: Absolute, perm: u32) -> Self {
        Self {
            scope,
            path,
            perm,
            ephemeral: false,
        }
    }

    pub(super) fn ephemeral(scope: Enablement, path: Absolute, perm: u32) -> Self {
        Self {
            scope,
            path,
            perm,
            ephemeral: true,
        }
    }
}

impl Op for MkdirOp {
    fn scope(&self) -> Enablement {
        self.scope
    }

    fn commit(&mut self, sys: &dyn Syscalls) -> Result<(), OpError> {
        match sys.mkdir(self.path.as_path(), self.perm) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists && !self.ephemeral => {
                // the mode still has to hold on a pre-existing directory
                debug!(path = %self.path, "directory already present");
                sys.chmod(self.path.as_path(), self.perm)
                    .map_err(|chmod_err| OpError::apply(self, chmod_err))
            }
            Err(err) => Err(OpError::apply(self, err)),
        }
    }

    fn revert(&mut self, sys: &dyn Syscalls) -> Result<(), OpError> {
        if !self.ephemeral {
            debug!(path = %self.path, "keeping ensured directory");
            return Ok(());
        }
        match sys.remove(self.path.as_path()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path, "already removed");
                Ok(())
            }
            Err(err) => Err(OpError::undo(self, err)),
        }
    }
}

impl fmt::Display for MkdirOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ephemeral {
            write!(f, "ephemeral directory {:?} mode {:o}", self.path, self.perm)
        } else {
            write!(f, "ensure directory {:?} mode {:o}", self.path, self.perm)
        }
    }
}
