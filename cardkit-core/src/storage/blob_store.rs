//! File system-based atomic blob store.
//!
//! Writes follow the write-to-temp-then-rename sequence:
//!
//! 1. Write data to a temporary file in the same directory
//! 2. `fsync` the temporary file
//! 3. Atomically rename the temporary file to the target name
//! 4. `fsync` the parent directory
//!
//! Readers always see either the old content or the new content.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{CardKitError, CardKitResult};

use super::traits::AtomicBlobStore;

fn io_error(context: impl Into<String>, err: &std::io::Error) -> CardKitError {
    CardKitError::Storage(format!("{}: {err}", context.into()))
}

/// Directory-backed implementation of [`AtomicBlobStore`].
///
/// ```ignore
/// let store = FsBlobStore::new("/var/lib/cardkit")?;
/// store.write_atomic("counter.bin", &7u64.to_le_bytes())?;
/// ```
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    directory: PathBuf,
}

impl FsBlobStore {
    /// Creates a blob store rooted at `directory`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new<P: AsRef<Path>>(directory: P) -> CardKitResult<Self> {
        let directory = directory.as_ref().to_path_buf();
        fs::create_dir_all(&directory).map_err(|e| {
            io_error(
                format!("failed to create blob directory '{}'", directory.display()),
                &e,
            )
        })?;
        Ok(Self { directory })
    }

    /// Root directory of the store.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn blob_path(&self, name: &str) -> CardKitResult<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(CardKitError::InvalidInput(format!(
                "invalid blob name '{name}'"
            )));
        }
        Ok(self.directory.join(name))
    }

    fn temp_path(&self, name: &str) -> PathBuf {
        self.directory.join(format!(".{name}.tmp"))
    }

    #[cfg(unix)]
    fn sync_directory(&self) -> CardKitResult<()> {
        let dir = File::open(&self.directory).map_err(|e| {
            io_error(
                format!("failed to open directory '{}'", self.directory.display()),
                &e,
            )
        })?;
        dir.sync_all()
            .map_err(|e| io_error("failed to fsync directory", &e))
    }

    #[cfg(not(unix))]
    #[allow(clippy::unnecessary_wraps, clippy::unused_self)]
    fn sync_directory(&self) -> CardKitResult<()> {
        Ok(())
    }
}

impl AtomicBlobStore for FsBlobStore {
    fn read(&self, name: &str) -> CardKitResult<Option<Vec<u8>>> {
        let path = self.blob_path(name)?;
        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(
                format!("failed to read blob '{}'", path.display()),
                &e,
            )),
        }
    }

    fn write_atomic(&self, name: &str, bytes: &[u8]) -> CardKitResult<()> {
        let final_path = self.blob_path(name)?;
        let temp_path = self.temp_path(name);

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(|e| {
                io_error(
                    format!("failed to create temporary file '{}'", temp_path.display()),
                    &e,
                )
            })?;
        file.write_all(bytes).map_err(|e| {
            io_error(
                format!("failed to write temporary file '{}'", temp_path.display()),
                &e,
            )
        })?;
        file.sync_all()
            .map_err(|e| io_error("failed to fsync temporary file", &e))?;
        drop(file);

        fs::rename(&temp_path, &final_path).map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            io_error(
                format!(
                    "failed to rename '{}' to '{}'",
                    temp_path.display(),
                    final_path.display()
                ),
                &e,
            )
        })?;

        self.sync_directory()
    }

    fn delete(&self, name: &str) -> CardKitResult<()> {
        let path = self.blob_path(name)?;
        match fs::remove_file(&path) {
            Ok(()) => self.sync_directory(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(
                format!("failed to delete blob '{}'", path.display()),
                &e,
            )),
        }
    }

    fn exists(&self, name: &str) -> CardKitResult<bool> {
        Ok(self.blob_path(name)?.exists())
    }
}
