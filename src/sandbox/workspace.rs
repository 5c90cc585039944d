use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::{PlaypenError, Result};
use crate::project::{relative_path, validate_path};

/// Host directory holding a sandbox's project files.
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Create (or reuse) the directory at `root`.
    pub async fn create(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root).await.map_err(|e| {
            PlaypenError::BootFailure(format!(
                "cannot create workspace {}: {}",
                root.display(),
                e
            ))
        })?;
        debug!(root = %root.display(), "Workspace ready");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> std::result::Result<PathBuf, String> {
        validate_path(path)?;
        Ok(self.root.join(relative_path(path)))
    }

    pub async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let full = self.resolve(path).map_err(|e| PlaypenError::write(path, e))?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| PlaypenError::write(path, e))?;
        }
        fs::write(&full, content)
            .await
            .map_err(|e| PlaypenError::write(path, e))?;
        debug!(path = %path, bytes = content.len(), "Wrote file");
        Ok(())
    }

    pub async fn read_file(&self, path: &str) -> Result<String> {
        let full = self.resolve(path).map_err(|e| PlaypenError::write(path, e))?;
        Ok(fs::read_to_string(&full).await?)
    }

    /// Delete the workspace directory and everything in it.
    pub async fn remove(&self) -> Result<()> {
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => {
                info!(root = %self.root.display(), "Removed workspace");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!(root = %self.root.display(), error = %e, "Failed to remove workspace");
                Err(e.into())
            }
        }
    }
}
