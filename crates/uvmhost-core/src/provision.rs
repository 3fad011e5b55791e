//! Host filesystem provisioning for scratch layers.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Creates and removes scratch directories on the host.
///
/// Paths handed out are opaque to the rest of the crate.
pub trait ScratchProvisioner: Send + Sync {
    /// Create a fresh, empty scratch directory.
    fn create_scratch_directory(&self) -> io::Result<PathBuf>;

    /// Remove a directory and its contents. Missing directories are fine.
    fn remove_directory(&self, path: &Path) -> io::Result<()>;
}

/// Provisions scratch directories below a root directory.
#[derive(Debug, Clone)]
pub struct DirProvisioner {
    root: PathBuf,
}

impl DirProvisioner {
    /// Create a provisioner rooted at `root`; the root is created on demand.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Get the root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ScratchProvisioner for DirProvisioner {
    fn create_scratch_directory(&self) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.root)?;
        let path = self.root.join(format!("scratch-{}", Uuid::new_v4()));
        fs::create_dir(&path)?;
        tracing::debug!(path = %path.display(), "Scratch directory created");
        Ok(path)
    }

    fn remove_directory(&self, path: &Path) -> io::Result<()> {
        if !path.starts_with(&self.root) || path == self.root {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a scratch directory under {}", path.display(), self.root.display()),
            ));
        }
        match fs::remove_dir_all(path) {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "Scratch directory removed");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}
