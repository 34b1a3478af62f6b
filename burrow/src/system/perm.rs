use std::fmt;
use std::io;

use burrow_proto::{Absolute, Enablement};
use tracing::debug;

use super::{Op, OpError};
use crate::acl::AclPerms;
use crate::sys::Syscalls;

/// Grants the sandbox account access to a host path through its ACL.
#[derive(Debug)]
pub(super) struct PermOp {
    scope: Enablement,
    path: Absolute,
    uid: u32,
    perms: AclPerms,
}

impl PermOp {
    pub(super) fn new(scope: Enablement, path: Absolute, uid: u32, perms: AclPerms) -> Self {
        Self {
            scope,
            path,
            uid,
            perms,
        }
    }
}

impl Op for PermOp {
    fn scope(&self) -> Enablement {
        self.scope
    }

    fn commit(&mut self, sys: &dyn Syscalls) -> Result<(), OpError> {
        sys.acl_update(self.path.as_path(), self.uid, self.perms)
            .map_err(|err| OpError::apply(self, err))
    }

    fn revert(&mut self, sys: &dyn Syscalls) -> Result<(), OpError> {
        match sys.acl_update(self.path.as_path(), self.uid, AclPerms::empty()) {
            Ok(()) => Ok(()),
            // the path may be gone already, the grant died with it
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path, "skipping ACL strip");
                Ok(())
            }
            Err(err) => Err(OpError::undo(self, err)),
        }
    }
}

impl fmt::Display for PermOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "acl {} on {:?} for uid {}",
            self.perms, self.path, self.uid
        )
    }
}
