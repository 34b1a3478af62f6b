//! Host pathnames derived from the caller's environment.

use burrow_proto::Absolute;

use crate::sys::Syscalls;

/// Directory name under XDG_RUNTIME_DIR holding per-instance runtime
/// shares and the state store.
const RUN_DIR_NAME: &str = "burrow";

/// Host paths the preparation ops build on.
#[derive(Debug, Clone)]
pub struct Paths {
    /// `TMPDIR` or `/tmp`.
    pub temp: Absolute,
    /// `<temp>/burrow.<euid>`, the per-user share directory.
    pub share: Absolute,
    /// `XDG_RUNTIME_DIR`, when set and absolute.
    pub runtime: Option<Absolute>,
    /// `<runtime>/burrow`.
    pub run_dir: Option<Absolute>,
}

impl Paths {
    /// Derives all paths from the dispatcher's view of the environment.
    pub fn new(sys: &dyn Syscalls) -> Self {
        let temp = sys
            .lookup_env("TMPDIR")
            .and_then(|v| Absolute::new(v).ok())
            .unwrap_or_else(|| Absolute::new("/tmp").unwrap_or_else(|_| unreachable!()));
        let share = temp.append(format!("burrow.{}", sys.geteuid()));
        let runtime = sys
            .lookup_env("XDG_RUNTIME_DIR")
            .and_then(|v| Absolute::new(v).ok());
        let run_dir = runtime.as_ref().map(|r| r.append(RUN_DIR_NAME));
        Self {
            temp,
            share,
            runtime,
            run_dir,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::StubSyscalls;

    #[test]
    fn derives_share_from_euid() {
        let mut sys = StubSyscalls::new(1000, 1000);
        sys.set_env("XDG_RUNTIME_DIR", "/run/user/1000");
        let paths = Paths::new(&sys);
        assert_eq!(paths.temp.as_path(), std::path::Path::new("/tmp"));
        assert_eq!(
            paths.share.as_path(),
            std::path::Path::new("/tmp/burrow.1000")
        );
        assert_eq!(
            paths.run_dir.as_ref().unwrap().as_path(),
            std::path::Path::new("/run/user/1000/burrow")
        );
    }

    #[test]
    fn relative_runtime_dir_ignored() {
        let mut sys = StubSyscalls::new(1000, 1000);
        sys.set_env("XDG_RUNTIME_DIR", "run/user/1000");
        sys.set_env("TMPDIR", "/var/tmp");
        let paths = Paths::new(&sys);
        assert!(paths.runtime.is_none());
        assert!(paths.run_dir.is_none());
        assert_eq!(
            paths.share.as_path(),
            std::path::Path::new("/var/tmp/burrow.1000")
        );
    }
}
