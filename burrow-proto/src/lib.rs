//! Boundary types and wire codec for burrow priv↔shim communication.
//!
//! The privileged process serialises a setup bundle with [`postcard`] and
//! transmits it through a pre-connected pipe whose fd index is advertised
//! in the [`ENV_SETUP_FD`] environment variable. Everything crossing that
//! boundary is defined here: validated absolute paths, enablement bits,
//! the declarative sandbox configuration, and the low-level container
//! parameters consumed by the container runtime.

mod codec;
mod config;
mod enablement;
mod params;
mod path;

pub use codec::{ENV_SETUP_FD, decode, encode};
pub use config::{
    BusConfig, Config, ConfigError, ContainerSpec, ExtraPerm, FilesystemEntry, LOGIN_NAME_MAX,
    USERNAME_FALLBACK, WAIT_DELAY_DEFAULT, WAIT_DELAY_MAX,
};
pub use enablement::{Enablement, EnablementError};
pub use params::{BindFlags, ContainerParams, MountOp, SeccompFlags, SeccompPresets};
pub use path::{Absolute, PathError};
