//! The single component allowed to mutate generated sources on disk.

use crate::error::{Error, Result};
use crate::util::resolve_relative;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

const LOCK_FILE_NAME: &str = ".testloom.lock";

#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute location of `relative` without touching the filesystem.
    pub fn resolve(&self, relative: impl AsRef<Path>) -> Result<PathBuf> {
        let relative = relative.as_ref();
        resolve_relative(&self.root, relative).map_err(|reason| {
            debug!(path = %relative.display(), %reason, "rejected workspace path");
            Error::InvalidPath(relative.to_path_buf())
        })
    }

    /// Write `content` to `relative`, creating parent directories.
    ///
    /// With `overwrite == false` an existing file is left untouched and
    /// [`Error::AlreadyExists`] is returned.
    pub fn write(
        &self,
        relative: impl AsRef<Path>,
        content: &str,
        overwrite: bool,
    ) -> Result<PathBuf> {
        let target = self.resolve(relative)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        if !overwrite && target.exists() {
            return Err(Error::AlreadyExists(target));
        }

        // Staged through a sibling temp file, then renamed into place.
        let mut tmp_name = target.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(".tmp");
        let tmp = target.with_file_name(tmp_name);
        {
            let mut file = File::create(&tmp)?;
            file.write_all(content.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &target)?;
        debug!(path = %target.display(), bytes = content.len(), "wrote artifact");
        Ok(target)
    }

    /// Contents of `relative`, or `None` when it does not exist yet.
    pub fn read(&self, relative: impl AsRef<Path>) -> Result<Option<String>> {
        let target = self.resolve(relative)?;
        match fs::read_to_string(&target) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Take the exclusive workspace lock for the lifetime of the guard.
    pub fn lock(&self) -> Result<WorkspaceLock> {
        fs::create_dir_all(&self.root)?;
        let path = self.root.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;
        FileExt::try_lock_exclusive(&file).map_err(|_| {
            Error::Configuration(format!(
                "workspace {} is locked by another run",
                self.root.display()
            ))
        })?;
        Ok(WorkspaceLock { file })
    }
}

/// Releases the workspace lock on drop.
#[derive(Debug)]
pub struct WorkspaceLock {
    file: File,
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
