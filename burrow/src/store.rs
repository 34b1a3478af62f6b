//! On-disk record of live instances.
//!
//! Each committed instance leaves a JSON snapshot behind; at exit the
//! driver consults the surviving entries to decide which host grants
//! are still needed by other instances of the same identity.

use std::fs;
use std::io;
use std::path::PathBuf;

use burrow_proto::Enablement;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;

/// One live instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Entry {
    /// Instance id, 32 hex digits.
    pub id: String,
    /// Pid of the driver process holding the instance.
    pub pid: u32,
    /// Subsystems the instance holds host grants for.
    pub enablements: Enablement,
}

/// Store of instance entries for one identity.
pub(crate) trait StateStore {
    /// Records a new entry.
    fn insert(&self, entry: &Entry) -> Result<()>;
    /// Removes the entry for `id`. A missing entry is not an error.
    fn evict(&self, id: &str) -> Result<()>;
    /// Number of surviving entries and the union of their enablements.
    fn survivors(&self) -> Result<(usize, Enablement)>;
}

/// Directory of JSON snapshots, one file per instance.
#[derive(Debug)]
pub(crate) struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub(crate) fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn entry_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

impl StateStore for FileStore {
    fn insert(&self, entry: &Entry) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let data = serde_json::to_vec(entry)?;
        fs::write(self.entry_path(&entry.id), data)?;
        Ok(())
    }

    fn evict(&self, id: &str) -> Result<()> {
        match fs::remove_file(self.entry_path(id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn survivors(&self) -> Result<(usize, Enablement)> {
        let mut count = 0;
        let mut aggregate = Enablement::empty();
        let dir = match fs::read_dir(&self.dir) {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok((0, aggregate)),
            Err(err) => return Err(err.into()),
        };
        for entry in dir {
            let path = entry?.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            match serde_json::from_slice::<Entry>(&fs::read(&path)?) {
                Ok(parsed) => {
                    count += 1;
                    aggregate |= parsed.enablements;
                }
                Err(err) => debug!(?path, %err, "skipping unreadable entry"),
            }
        }
        Ok((count, aggregate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, enablements: Enablement) -> Entry {
        Entry {
            id: id.to_owned(),
            pid: 1234,
            enablements,
        }
    }

    #[test]
    fn insert_then_evict_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("state"));

        store.insert(&entry("a", Enablement::WAYLAND)).unwrap();
        store
            .insert(&entry("b", Enablement::DBUS | Enablement::PULSE))
            .unwrap();

        let (count, aggregate) = store.survivors().unwrap();
        assert_eq!(count, 2);
        assert_eq!(
            aggregate,
            Enablement::WAYLAND | Enablement::DBUS | Enablement::PULSE
        );

        store.evict("a").unwrap();
        let (count, aggregate) = store.survivors().unwrap();
        assert_eq!(count, 1);
        assert_eq!(aggregate, Enablement::DBUS | Enablement::PULSE);
    }

    #[test]
    fn evict_missing_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("state"));
        store.evict("nope").unwrap();
        assert_eq!(store.survivors().unwrap(), (0, Enablement::empty()));
    }

    #[test]
    fn corrupt_entries_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().to_path_buf());
        store.insert(&entry("good", Enablement::X11)).unwrap();
        fs::write(dir.path().join("bad.json"), b"{").unwrap();

        let (count, aggregate) = store.survivors().unwrap();
        assert_eq!(count, 1);
        assert_eq!(aggregate, Enablement::X11);
    }
}
