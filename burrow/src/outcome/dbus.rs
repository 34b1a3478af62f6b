//! D-Bus access through xdg-dbus-proxy.

use burrow_proto::{Absolute, BindFlags, BusConfig, Enablement};
use serde::{Deserialize, Serialize};

use super::{ContainerContext, SysContext, params::abs};
use crate::acl::AclPerms;
use crate::dbus::{BusFinal, ProxySpec, validate_interfaces};
use crate::error::{Error, Result};

const SYSTEM_BUS_SOCKET: &str = "/run/dbus/system_bus_socket";

/// Proxies the session bus, and optionally the system bus, through a
/// filtering xdg-dbus-proxy instance.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct DbusOp {
    session_socket: Option<Absolute>,
    system_socket: Option<Absolute>,
}

impl DbusOp {
    pub(super) fn to_system(&mut self, ctx: &mut SysContext<'_>) -> Result<()> {
        let session_config = ctx
            .config
            .session_bus
            .clone()
            .unwrap_or_else(|| BusConfig::default_session(&ctx.config.id));
        validate_interfaces(&session_config).map_err(Error::Bus)?;

        let session_upstream = match ctx.sys.lookup_env("DBUS_SESSION_BUS_ADDRESS") {
            Some(addr) => addr,
            None => {
                let runtime = ctx.paths.runtime.clone().ok_or(Error::RuntimeDir)?;
                format!("unix:path={}", runtime.append("bus"))
            }
        };
        let session_socket = ctx.instance().append("bus");
        let session = BusFinal {
            upstream: session_upstream,
            socket: session_socket.clone(),
            config: session_config,
        };

        let system = match &ctx.config.system_bus {
            Some(config) => {
                validate_interfaces(config).map_err(Error::Bus)?;
                let upstream = ctx
                    .sys
                    .lookup_env("DBUS_SYSTEM_BUS_ADDRESS")
                    .unwrap_or_else(|| format!("unix:path=/var{SYSTEM_BUS_SOCKET}"));
                Some(BusFinal {
                    upstream,
                    socket: ctx.instance().append("system_bus_socket"),
                    config: config.clone(),
                })
            }
            None => None,
        };
        self.system_socket = system.as_ref().map(|s| s.socket.clone());
        self.session_socket = Some(session_socket);

        let spec = ProxySpec { session, system };
        let sockets = spec.sockets();
        ctx.system.proxy_dbus(Enablement::DBUS, spec);
        // the proxy creates the listeners; grant them after it is up
        for socket in sockets {
            let socket = Absolute::new(socket)?;
            ctx.system.update_perm(
                Enablement::PROCESS,
                &socket,
                AclPerms::READ | AclPerms::WRITE,
            );
        }
        Ok(())
    }

    pub(super) fn to_container(&self, ctx: &mut ContainerContext<'_>) -> Result<()> {
        if let Some(session_socket) = &self.session_socket {
            let target = ctx.runtime_dir().append("bus");
            ctx.params
                .bind(session_socket.clone(), target.clone(), BindFlags::WRITE);
            ctx.env.insert(
                "DBUS_SESSION_BUS_ADDRESS".into(),
                format!("unix:path={target}"),
            );
        }
        if let Some(system_socket) = &self.system_socket {
            ctx.params.bind(
                system_socket.clone(),
                abs(SYSTEM_BUS_SOCKET)?,
                BindFlags::WRITE,
            );
            ctx.env.insert(
                "DBUS_SYSTEM_BUS_ADDRESS".into(),
                format!("unix:path={SYSTEM_BUS_SOCKET}"),
            );
        }
        Ok(())
    }
}
