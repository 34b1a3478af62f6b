use std::fmt;

use burrow_proto::Enablement;

use super::{Op, OpError};
use crate::sys::Syscalls;

/// Inserts a ServerInterpreted localuser entry into the X server host
/// list, granting the sandbox account access to the display.
#[derive(Debug)]
pub(super) struct XHostOp {
    scope: Enablement,
    display: String,
    name: String,
}

impl XHostOp {
    pub(super) fn new(scope: Enablement, display: String, name: String) -> Self {
        Self {
            scope,
            display,
            name,
        }
    }
}

impl Op for XHostOp {
    fn scope(&self) -> Enablement {
        self.scope
    }

    fn commit(&mut self, sys: &dyn Syscalls) -> Result<(), OpError> {
        sys.change_hosts(&self.display, true, &self.name)
            .map_err(|err| OpError::apply(self, err))
    }

    fn revert(&mut self, sys: &dyn Syscalls) -> Result<(), OpError> {
        sys.change_hosts(&self.display, false, &self.name)
            .map_err(|err| OpError::undo(self, err))
    }
}

impl fmt::Display for XHostOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "x11 host {:?} on {}", self.name, self.display)
    }
}
