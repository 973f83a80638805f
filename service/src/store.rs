//! File-backed durable store for card fields.
//!
//! ## Layout
//!
//! ```text
//! {storage.dir}/card/
//!   fn    first name bytes incl. terminator
//!   ln    last name
//!   e     email
//!   a     address
//!   pn    phone number
//! ```
//!
//! Each save replaces one file atomically via a `.tmp` sibling.

use std::path::{Path, PathBuf};

use bizcard_core::field::STORAGE_NAMESPACE;
use bizcard_core::{DurableStore, PersistedEntry, PersistenceError};

const TMP_SUFFIX: &str = ".tmp";

/// One file per key under a base directory.
pub struct FileStore {
    base_dir: PathBuf,
}

impl FileStore {
    /// Create a store rooted at `base_dir`, creating it if needed.
    pub fn with_base_dir(base_dir: PathBuf) -> Result<Self, PersistenceError> {
        std::fs::create_dir_all(base_dir.join(STORAGE_NAMESPACE))?;
        Ok(Self { base_dir })
    }

    /// Base directory accessor.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn namespace_dir(&self) -> PathBuf {
        self.base_dir.join(STORAGE_NAMESPACE)
    }

    /// Path for `card/<name>`; anything else is not ours.
    fn key_path(&self, key: &str) -> Result<PathBuf, PersistenceError> {
        let name = key
            .strip_prefix(STORAGE_NAMESPACE)
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|name| {
                !name.is_empty()
                    && !name.contains('/')
                    && !name.starts_with('.')
                    && !name.ends_with(TMP_SUFFIX)
            })
            .ok_or_else(|| PersistenceError::UnknownKey {
                key: key.to_string(),
            })?;
        Ok(self.namespace_dir().join(name))
    }

    /// Atomically write `data` to `path` via a `.tmp` sibling.
    fn atomic_write(&self, path: &Path, data: &[u8]) -> Result<(), PersistenceError> {
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(TMP_SUFFIX);
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl DurableStore for FileStore {
    fn save(&mut self, key: &str, value: &[u8]) -> Result<(), PersistenceError> {
        let path = self.key_path(key)?;
        std::fs::create_dir_all(self.namespace_dir())?;
        self.atomic_write(&path, value)
    }

    fn load_all(&mut self) -> Result<Vec<PersistedEntry>, PersistenceError> {
        let dir = self.namespace_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        for dirent in std::fs::read_dir(&dir)? {
            let dirent = dirent?;
            if !dirent.file_type()?.is_file() {
                continue;
            }
            let Some(name) = dirent.file_name().to_str().map(str::to_string) else {
                tracing::debug!(path = %dirent.path().display(), "skipping non UTF-8 file name");
                continue;
            };
            if name.ends_with(TMP_SUFFIX) {
                tracing::debug!(%name, "skipping interrupted write");
                continue;
            }
            let value = std::fs::read(dirent.path())?;
            entries.push(PersistedEntry {
                key: format!("{STORAGE_NAMESPACE}/{name}"),
                value,
            });
        }
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }
}
