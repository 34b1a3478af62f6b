use std::fmt;

use burrow_proto::Enablement;
use tracing::error;

use super::{Op, OpError};
use crate::dbus::ProxySpec;
use crate::sys::{BusProxy, Syscalls};

/// Runs xdg-dbus-proxy between the host buses and per-instance sockets.
///
/// Commit blocks until the proxy signals readiness; revert closes the
/// status pipe and reaps the process.
#[derive(Debug)]
pub(super) struct DbusProxyOp {
    scope: Enablement,
    spec: ProxySpec,
    proxy: Option<Box<dyn BusProxy>>,
}

impl DbusProxyOp {
    pub(super) fn new(scope: Enablement, spec: ProxySpec) -> Self {
        Self {
            scope: scope | Enablement::PROCESS,
            spec,
            proxy: None,
        }
    }
}

impl Op for DbusProxyOp {
    fn scope(&self) -> Enablement {
        self.scope
    }

    fn commit(&mut self, sys: &dyn Syscalls) -> Result<(), OpError> {
        let mut proxy = sys
            .dbus_spawn(&self.spec)
            .map_err(|err| OpError::apply(self, err))?;
        if let Err(err) = proxy.wait_ready() {
            proxy.stop();
            if let Err(wait_err) = proxy.wait() {
                error!(err = %wait_err, output = %proxy.output(), "proxy died during startup");
            }
            return Err(OpError::apply(self, err));
        }
        self.proxy = Some(proxy);
        Ok(())
    }

    fn revert(&mut self, _sys: &dyn Syscalls) -> Result<(), OpError> {
        let Some(mut proxy) = self.proxy.take() else {
            return Ok(());
        };
        proxy.stop();
        proxy.wait().map_err(|err| {
            error!(output = %proxy.output(), "proxy shutdown failure");
            OpError::undo(self, err)
        })
    }
}

impl fmt::Display for DbusProxyOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dbus proxy on {:?}", self.spec.session.socket)?;
        if let Some(system) = &self.spec.system {
            write!(f, " and {:?}", system.socket)?;
        }
        Ok(())
    }
}
