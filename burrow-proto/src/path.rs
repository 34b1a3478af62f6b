//! Validated absolute pathnames.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Errors returned when constructing an [`Absolute`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum PathError {
    /// The pathname does not begin at `/`.
    #[error("pathname {0:?} is not absolute")]
    NotAbsolute(String),
    /// The pathname contains an interior NUL byte.
    #[error("pathname contains NUL byte")]
    Nul,
}

/// A pathname validated to be absolute and free of NUL bytes at construction.
///
/// Every pathname exposed to container ops goes through this type, so the
/// shim never has to re-validate paths received across the setup pipe.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "PathBuf", into = "PathBuf")]
pub struct Absolute(PathBuf);

impl fmt::Debug for Absolute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Absolute {
    /// Validates `path` and wraps it.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, PathError> {
        let path = path.into();
        if !path.is_absolute() {
            return Err(PathError::NotAbsolute(path.to_string_lossy().into_owned()));
        }
        if path.as_os_str().as_encoded_bytes().contains(&0) {
            return Err(PathError::Nul);
        }
        Ok(Self(path))
    }

    /// Borrows the inner path.
    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Returns the pathname as a string, replacing invalid UTF-8.
    pub fn display(&self) -> std::path::Display<'_> {
        self.0.display()
    }

    /// Appends one or more relative components.
    ///
    /// Leading separators in `tail` are stripped so the result always
    /// stays below `self`.
    pub fn append(&self, tail: impl AsRef<Path>) -> Self {
        let mut p = self.0.clone();
        for c in tail.as_ref().components() {
            if let std::path::Component::Normal(c) = c {
                p.push(c);
            }
        }
        Self(p)
    }

    /// Returns the parent directory, or `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        self.0.parent().map(|p| Self(p.to_path_buf()))
    }

    /// Whether this is the filesystem root `/`.
    pub fn is_root(&self) -> bool {
        self.0.as_os_str() == "/"
    }
}

impl fmt::Display for Absolute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.display().fmt(f)
    }
}

impl AsRef<Path> for Absolute {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl TryFrom<PathBuf> for Absolute {
    type Error = PathError;

    fn try_from(path: PathBuf) -> Result<Self, PathError> {
        Self::new(path)
    }
}

impl From<Absolute> for PathBuf {
    fn from(a: Absolute) -> Self {
        a.0
    }
}

impl std::str::FromStr for Absolute {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, PathError> {
        Self::new(s)
    }
}
