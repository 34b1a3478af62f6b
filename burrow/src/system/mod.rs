//! Reversible host operations.
//!
//! Every change made to the host on behalf of a sandbox instance is
//! appended to a [`System`], committed in order before the container
//! starts, and reverted in reverse order when the instance exits. Each
//! op carries an [`Enablement`] scope deciding whether a given revert
//! criteria applies to it.

mod copyfile;
mod dbus;
mod link;
mod mkdir;
mod perm;
mod wayland;
mod xhost;

use std::cell::RefCell;
use std::fmt;
use std::io;
use std::rc::Rc;

use burrow_proto::{Absolute, Enablement};
use tracing::{debug, error};

use crate::acl::AclPerms;
use crate::dbus::ProxySpec;
use crate::sys::Syscalls;

pub(crate) use copyfile::SharedBuf;

/// A host op failed to commit or revert.
#[derive(Debug, thiserror::Error)]
pub struct OpError {
    /// Description of the failed operation.
    pub op: String,
    /// Whether the failure occurred while reverting.
    pub revert: bool,
    /// The underlying error.
    #[source]
    pub err: io::Error,
}

impl OpError {
    fn apply(op: &(impl fmt::Display + ?Sized), err: io::Error) -> Self {
        Self {
            op: op.to_string(),
            revert: false,
            err,
        }
    }

    fn undo(op: &(impl fmt::Display + ?Sized), err: io::Error) -> Self {
        Self {
            op: op.to_string(),
            revert: true,
            err,
        }
    }
}

impl fmt::Display for OpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.revert {
            write!(f, "cannot revert {}: {}", self.op, self.err)
        } else {
            write!(f, "cannot {}: {}", self.op, self.err)
        }
    }
}

/// Revert filter.
///
/// `None` reverts everything except User-scoped ops; `Some` reverts ops
/// whose scope intersects the mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Criteria(pub Option<Enablement>);

impl Criteria {
    /// Whether an op with `scope` is covered.
    pub(crate) fn includes(self, scope: Enablement) -> bool {
        match self.0 {
            None => !scope.contains(Enablement::USER),
            Some(mask) => !mask.intersection(scope).is_empty(),
        }
    }
}

/// One reversible host operation.
pub(crate) trait Op: fmt::Debug + fmt::Display {
    /// Scope bits consulted by the revert criteria.
    fn scope(&self) -> Enablement;
    /// Applies the op to the host.
    fn commit(&mut self, sys: &dyn Syscalls) -> Result<(), OpError>;
    /// Undoes the op.
    fn revert(&mut self, sys: &dyn Syscalls) -> Result<(), OpError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Fresh,
    Committed,
    Reverted,
}

/// Ordered collection of reversible host ops for one instance.
#[derive(Debug)]
pub(crate) struct System {
    uid: u32,
    ops: Vec<Box<dyn Op>>,
    phase: Phase,
}

impl System {
    /// Creates an empty op collection targeting the sandbox account `uid`.
    pub(crate) fn new(uid: u32) -> Self {
        Self {
            uid,
            ops: Vec::new(),
            phase: Phase::Fresh,
        }
    }

    /// The sandbox account uid ACL ops are granted to.
    pub(crate) fn uid(&self) -> u32 {
        self.uid
    }

    /// Appends a directory creation tolerating an existing directory,
    /// never removed on revert.
    pub(crate) fn ensure(&mut self, scope: Enablement, path: &Absolute, perm: u32) -> &mut Self {
        self.ops.push(Box::new(mkdir::MkdirOp::ensure(
            scope,
            path.clone(),
            perm,
        )));
        self
    }

    /// Appends a directory creation failing on an existing directory and
    /// removed on revert.
    pub(crate) fn ephemeral(&mut self, scope: Enablement, path: &Absolute, perm: u32) -> &mut Self {
        self.ops.push(Box::new(mkdir::MkdirOp::ephemeral(
            scope,
            path.clone(),
            perm,
        )));
        self
    }

    /// Appends a hard link creation, removed on revert.
    pub(crate) fn link(
        &mut self,
        scope: Enablement,
        target: &Absolute,
        link: &Absolute,
    ) -> &mut Self {
        self.ops.push(Box::new(link::LinkOp::new(
            scope,
            target.clone(),
            link.clone(),
        )));
        self
    }

    /// Appends a bounded file read into a shared buffer.
    pub(crate) fn copy_file(
        &mut self,
        scope: Enablement,
        buf: &SharedBuf,
        src: &Absolute,
        limit: usize,
    ) -> &mut Self {
        self.ops.push(Box::new(copyfile::CopyFileOp::new(
            scope,
            Rc::clone(buf),
            src.clone(),
            limit,
        )));
        self
    }

    /// Appends an ACL grant for the sandbox account, stripped on revert.
    pub(crate) fn update_perm(
        &mut self,
        scope: Enablement,
        path: &Absolute,
        perms: AclPerms,
    ) -> &mut Self {
        self.ops.push(Box::new(perm::PermOp::new(
            scope,
            path.clone(),
            self.uid,
            perms,
        )));
        self
    }

    /// Appends an X11 host list insertion, deleted on revert.
    pub(crate) fn change_hosts(
        &mut self,
        scope: Enablement,
        display: &str,
        name: &str,
    ) -> &mut Self {
        self.ops.push(Box::new(xhost::XHostOp::new(
            scope,
            display.to_owned(),
            name.to_owned(),
        )));
        self
    }

    /// Appends a brokered Wayland listener, detached on revert.
    pub(crate) fn wayland(
        &mut self,
        scope: Enablement,
        display: &Absolute,
        bind: &Absolute,
        app_id: &str,
        instance_id: &str,
    ) -> &mut Self {
        self.ops.push(Box::new(wayland::WaylandOp::new(
            scope,
            display.clone(),
            bind.clone(),
            app_id.to_owned(),
            instance_id.to_owned(),
            self.uid,
        )));
        self
    }

    /// Appends an xdg-dbus-proxy instance, stopped and reaped on revert.
    pub(crate) fn proxy_dbus(&mut self, scope: Enablement, spec: ProxySpec) -> &mut Self {
        self.ops.push(Box::new(dbus::DbusProxyOp::new(scope, spec)));
        self
    }

    /// Formatted descriptions of every appended op, in order.
    pub(crate) fn op_descriptions(&self) -> Vec<String> {
        self.ops.iter().map(|op| op.to_string()).collect()
    }

    /// Applies every op in order.
    ///
    /// On failure the already-applied prefix is rolled back in reverse
    /// order (everything except User-scoped ops) and the original error
    /// is returned. Panics when called more than once.
    pub(crate) fn commit(&mut self, sys: &dyn Syscalls) -> Result<(), OpError> {
        assert!(
            self.phase == Phase::Fresh,
            "attempted to commit system state twice"
        );
        self.phase = Phase::Committed;

        for i in 0..self.ops.len() {
            debug!(op = %self.ops[i], "committing");
            if let Err(err) = self.ops[i].commit(sys) {
                error!(%err, "rolling back partial commit");
                let criteria = Criteria(None);
                for op in self.ops[..i].iter_mut().rev() {
                    if !criteria.includes(op.scope()) {
                        continue;
                    }
                    if let Err(revert_err) = op.revert(sys) {
                        error!(err = %revert_err, "rollback failure");
                    }
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Undoes every committed op covered by `criteria`, in reverse order.
    ///
    /// Failures do not stop the walk; all errors are returned. Panics
    /// when called more than once or before commit.
    pub(crate) fn revert(&mut self, sys: &dyn Syscalls, criteria: Criteria) -> Vec<OpError> {
        assert!(
            self.phase == Phase::Committed,
            "attempted to revert system state twice"
        );
        self.phase = Phase::Reverted;

        let mut errs = Vec::new();
        for op in self.ops.iter_mut().rev() {
            if !criteria.includes(op.scope()) {
                debug!(op = %op, "skipping revert");
                continue;
            }
            debug!(op = %op, "reverting");
            if let Err(err) = op.revert(sys) {
                errs.push(err);
            }
        }
        errs
    }
}

/// Shared buffer constructor for [`System::copy_file`].
pub(crate) fn shared_buf() -> SharedBuf {
    Rc::new(RefCell::new(Vec::new()))
}
