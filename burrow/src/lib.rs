//! Sandboxed launcher for untrusted desktop applications.
//!
//! `burrow` confines a program under a dedicated unprivileged account
//! selected by a small identity number, while granting it mediated access
//! to the session's Wayland, X11, D-Bus and PulseAudio services. Every
//! change made to the host to set a sandbox up is recorded as a reversible
//! operation and undone when the instance exits.
//!
//! # Quick start
//!
//! ```no_run
//! use burrow::{Config, Enablement};
//!
//! let mut config = Config::default();
//! config.id = "org.example.App".into();
//! config.path = Some("/usr/bin/app".parse().unwrap());
//! config.home = Some("/var/lib/burrow/app".parse().unwrap());
//! config.shell = Some("/run/current-system/sw/bin/bash".parse().unwrap());
//! config.identity = 9;
//! config.enablements.set(Enablement::WAYLAND).unwrap();
//!
//! let code = burrow::run(&config).expect("failed to start sandbox");
//! std::process::exit(code);
//! ```

mod acl;
mod bsu;
mod dbus;
mod error;
mod finalise;
mod outcome;
mod paths;
mod process;
mod seccomp;
mod shim;
mod store;
mod sys;
mod system;
mod wl;
mod x11;

pub use burrow_proto::{
    Absolute, BusConfig, Config, ConfigError, ContainerSpec, Enablement, ExtraPerm,
    FilesystemEntry, PathError,
};
pub use error::{Error, Result};
pub use process::{EXIT_CANCEL, EXIT_FAILURE, EXIT_ORPHAN, EXIT_REQUEST, run};
pub use shim::shim_main;
