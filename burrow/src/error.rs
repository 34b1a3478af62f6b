//! Error types for burrow operations.

use std::path::PathBuf;

/// Alias for `Result<T, burrow::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by burrow sandbox operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The sandbox configuration failed validation.
    #[error(transparent)]
    Config(#[from] burrow_proto::ConfigError),

    /// A pathname failed validation.
    #[error(transparent)]
    Path(#[from] burrow_proto::PathError),

    /// A reversible host operation failed.
    #[error(transparent)]
    Op(#[from] crate::system::OpError),

    /// A D-Bus proxy policy or address was malformed.
    #[error(transparent)]
    Bus(#[from] crate::dbus::BusError),

    /// A supplementary group name did not resolve.
    #[error("unknown group {0:?}")]
    UnknownGroup(String),

    /// X11 was enabled but DISPLAY is unset or unsupported.
    #[error("invalid DISPLAY {0:?}")]
    Display(String),

    /// A subsystem needing XDG_RUNTIME_DIR was enabled without one.
    #[error("XDG_RUNTIME_DIR is not set or not absolute")]
    RuntimeDir,

    /// The PulseAudio runtime directory or socket is missing or has
    /// unexpected permissions.
    #[error("pulseaudio: {msg} {path:?}")]
    Pulse {
        /// Condition that failed.
        msg: &'static str,
        /// Path the condition was checked on.
        path: PathBuf,
    },

    /// The setuid helper denied the calling user.
    #[error("the calling user is not in bsurc")]
    BsuDenied,

    /// The setuid helper produced unusable output.
    #[error("setuid helper returned invalid output")]
    BsuProto,

    /// The shim terminated before setup completed.
    #[error("shim exited during setup")]
    ShimGone,

    /// An I/O error from driver, store, or boundary operations.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A state-store snapshot failed to encode or decode.
    #[error("state entry: {0}")]
    State(#[from] serde_json::Error),
}
