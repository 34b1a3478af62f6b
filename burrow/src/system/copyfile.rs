use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use burrow_proto::{Absolute, Enablement};

use super::{Op, OpError};
use crate::sys::Syscalls;

/// Buffer shared between a [`CopyFileOp`] and the preparation op that
/// seals its content after commit.
pub(crate) type SharedBuf = Rc<RefCell<Vec<u8>>>;

/// Reads a bounded host file into memory at commit time.
///
/// Oversized files fail with ENOMEM and directories with EISDIR, both
/// surfaced by the dispatcher.
#[derive(Debug)]
pub(super) struct CopyFileOp {
    scope: Enablement,
    buf: SharedBuf,
    src: Absolute,
    limit: usize,
}

impl CopyFileOp {
    pub(super) fn new(scope: Enablement, buf: SharedBuf, src: Absolute, limit: usize) -> Self {
        Self {
            scope,
            buf,
            src,
            limit,
        }
    }
}

impl Op for CopyFileOp {
    fn scope(&self) -> Enablement {
        self.scope
    }

    fn commit(&mut self, sys: &dyn Syscalls) -> Result<(), OpError> {
        let data = sys
            .read_file_bounded(self.src.as_path(), self.limit)
            .map_err(|err| OpError::apply(self, err))?;
        *self.buf.borrow_mut() = data;
        Ok(())
    }

    fn revert(&mut self, _sys: &dyn Syscalls) -> Result<(), OpError> {
        self.buf.borrow_mut().clear();
        Ok(())
    }
}

impl fmt::Display for CopyFileOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "copy file {:?} (limit {})", self.src, self.limit)
    }
}
