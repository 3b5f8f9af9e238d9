//! Read-only access to the directory the server publishes.

use std::path::{Component, Path, PathBuf};

use bytes::Bytes;
use thiserror::Error;
use tokio::fs;

const INDEX_FILE: &str = "index.html";

#[derive(Debug, Error)]
pub enum SiteError {
    #[error("invalid request path")]
    InvalidPath,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A file read from the site root.
#[derive(Debug, Clone)]
pub struct SiteFile {
    pub path: PathBuf,
    pub bytes: Bytes,
}

/// Filesystem-backed site root.
#[derive(Debug)]
pub struct SiteRoot {
    root: PathBuf,
}

impl SiteRoot {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Read the file addressed by a request path. Directories resolve to
    /// their `index.html`.
    pub async fn read(&self, request_path: &str) -> Result<SiteFile, SiteError> {
        let mut absolute = self.resolve(request_path)?;
        if fs::metadata(&absolute)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false)
        {
            absolute.push(INDEX_FILE);
        }

        let bytes = fs::read(&absolute).await?;
        Ok(SiteFile {
            path: absolute,
            bytes: Bytes::from(bytes),
        })
    }

    fn resolve(&self, request_path: &str) -> Result<PathBuf, SiteError> {
        let relative = Path::new(request_path.trim_start_matches('/'));
        if relative.is_absolute()
            || relative
                .components()
                .any(|component| matches!(component, Component::ParentDir | Component::Prefix(_)))
        {
            return Err(SiteError::InvalidPath);
        }

        Ok(self.root.join(relative))
    }
}
