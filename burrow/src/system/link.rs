use std::fmt;

use burrow_proto::{Absolute, Enablement};

use super::{Op, OpError};
use crate::sys::Syscalls;

/// Hard links a host file into an instance directory.
#[derive(Debug)]
pub(super) struct LinkOp {
    scope: Enablement,
    target: Absolute,
    link: Absolute,
}

impl LinkOp {
    pub(super) fn new(scope: Enablement, target: Absolute, link: Absolute) -> Self {
        Self {
            scope,
            target,
            link,
        }
    }
}

impl Op for LinkOp {
    fn scope(&self) -> Enablement {
        self.scope
    }

    fn commit(&mut self, sys: &dyn Syscalls) -> Result<(), OpError> {
        sys.hard_link(self.target.as_path(), self.link.as_path())
            .map_err(|err| OpError::apply(self, err))
    }

    fn revert(&mut self, sys: &dyn Syscalls) -> Result<(), OpError> {
        sys.remove(self.link.as_path())
            .map_err(|err| OpError::undo(self, err))
    }
}

impl fmt::Display for LinkOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hard link {:?} to {:?}", self.link, self.target)
    }
}
