use std::fmt;
use std::io;

use burrow_proto::{Absolute, Enablement};
use tracing::{debug, error};

use super::{Op, OpError};
use crate::acl::AclPerms;
use crate::sys::{Syscalls, WaylandRequest, WaylandSession};

/// Sandbox engine name reported to the compositor.
const ENGINE: &str = "moe.burrow";

/// Brokers a Wayland socket through security-context-v1.
///
/// Commit binds a listener at `bind`, attaches it to the compositor with
/// the instance's app id, then locks the listener down with mode 0 plus
/// an rwx ACL for the sandbox account. Revert detaches the context and
/// removes the listener socket; the op is always Process-scoped so the
/// per-instance socket never outlives the instance.
#[derive(Debug)]
pub(super) struct WaylandOp {
    scope: Enablement,
    display: Absolute,
    bind: Absolute,
    app_id: String,
    instance_id: String,
    uid: u32,
    session: Option<Box<dyn WaylandSession>>,
}

impl WaylandOp {
    pub(super) fn new(
        scope: Enablement,
        display: Absolute,
        bind: Absolute,
        app_id: String,
        instance_id: String,
        uid: u32,
    ) -> Self {
        Self {
            scope: scope | Enablement::PROCESS,
            display,
            bind,
            app_id,
            instance_id,
            uid,
            session: None,
        }
    }
}

impl Op for WaylandOp {
    fn scope(&self) -> Enablement {
        self.scope
    }

    fn commit(&mut self, sys: &dyn Syscalls) -> Result<(), OpError> {
        let req = WaylandRequest {
            display: self.display.as_path().to_path_buf(),
            bind: self.bind.as_path().to_path_buf(),
            engine: ENGINE.to_owned(),
            app_id: self.app_id.clone(),
            instance_id: self.instance_id.clone(),
        };
        let mut session = sys
            .wayland_attach(&req)
            .map_err(|err| OpError::apply(self, err))?;

        // lock the listener to the sandbox account only
        let locked = sys
            .chmod(self.bind.as_path(), 0)
            .and_then(|()| {
                sys.acl_update(
                    self.bind.as_path(),
                    self.uid,
                    AclPerms::READ | AclPerms::WRITE | AclPerms::EXECUTE,
                )
            });
        if let Err(err) = locked {
            if let Err(close_err) = session.close() {
                error!(err = %close_err, "cannot detach wayland context");
            }
            if let Err(remove_err) = sys.remove(self.bind.as_path()) {
                error!(err = %remove_err, "cannot remove listener socket");
            }
            return Err(OpError::apply(self, err));
        }

        self.session = Some(session);
        Ok(())
    }

    fn revert(&mut self, sys: &dyn Syscalls) -> Result<(), OpError> {
        if let Some(mut session) = self.session.take() {
            session.close().map_err(|err| OpError::undo(self, err))?;
        }
        match sys.remove(self.bind.as_path()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.bind, "listener socket already gone");
                Ok(())
            }
            Err(err) => Err(OpError::undo(self, err)),
        }
    }
}

impl fmt::Display for WaylandOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wayland proxy {:?} at {:?}", self.display, self.bind)
    }
}
