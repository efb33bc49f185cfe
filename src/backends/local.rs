//! Local filesystem backend rooted at the box's `location` option.

use async_trait::async_trait;
use std::{
    collections::HashMap,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

use super::{BackendConfigError, BackendKind, BoxedReader, StorageBackend, ensure_uri_safe};
use crate::models::storage_box::OPT_LOCATION;

#[derive(Debug, Clone)]
pub struct LocalFilesystemBackend {
    root: PathBuf,
}

impl LocalFilesystemBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_options(options: &HashMap<String, String>) -> Result<Self, BackendConfigError> {
        let location = options
            .get(OPT_LOCATION)
            .filter(|v| !v.trim().is_empty())
            .ok_or(BackendConfigError::MissingOption(OPT_LOCATION))?;
        Ok(Self::new(location))
    }

    pub(crate) fn path_for(&self, uri: &str) -> io::Result<PathBuf> {
        ensure_uri_safe(uri)?;
        Ok(self.root.join(uri))
    }

    /// Stream `reader` into a temp file next to the target, fsync, then
    /// rename into place so readers never observe a partial file.
    pub(crate) async fn write_file(&self, uri: &str, mut reader: BoxedReader) -> io::Result<u64> {
        let target = self.path_for(uri)?;
        let parent = target
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| io::Error::other("target path missing parent directory"))?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        let result = async {
            let mut file = File::create(&tmp_path).await?;
            let written = tokio::io::copy(&mut reader, &mut file).await?;
            file.flush().await?;
            file.sync_all().await?;
            Ok::<_, io::Error>(written)
        }
        .await;

        let written = match result {
            Ok(written) => written,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err);
            }
        };

        if let Err(err) = fs::rename(&tmp_path, &target).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(&target).await?;
                fs::rename(&tmp_path, &target).await?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err);
            }
        }
        Ok(written)
    }

    pub(crate) async fn delete_file(&self, uri: &str) -> io::Result<()> {
        let path = self.path_for(uri)?;
        match fs::remove_file(&path).await {
            Ok(_) => debug!("removed {}", path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", path.display());
            }
            Err(err) => return Err(err),
        }
        if let Some(parent) = path.parent() {
            prune_empty_dirs(parent, &self.root).await;
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for LocalFilesystemBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::LocalFilesystem
    }

    async fn open_read(&self, uri: &str) -> io::Result<BoxedReader> {
        let file = File::open(self.path_for(uri)?).await?;
        Ok(Box::pin(file))
    }

    async fn write(&self, uri: &str, reader: BoxedReader) -> io::Result<u64> {
        self.write_file(uri, reader).await
    }

    async fn size(&self, uri: &str) -> io::Result<u64> {
        Ok(fs::metadata(self.path_for(uri)?).await?.len())
    }

    async fn delete(&self, uri: &str) -> io::Result<()> {
        self.delete_file(uri).await
    }

    fn local_path(&self, uri: &str) -> Option<PathBuf> {
        self.path_for(uri).ok()
    }
}

/// Remove empty directories from `start` upwards, stopping at `stop`.
async fn prune_empty_dirs(start: &Path, stop: &Path) {
    let mut current = start.to_path_buf();
    while current.starts_with(stop) && current != stop {
        match fs::remove_dir(&current).await {
            Ok(_) => match current.parent() {
                Some(parent) => current = parent.to_path_buf(),
                None => break,
            },
            Err(err) if err.kind() == ErrorKind::NotFound => break,
            Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
            Err(err) => {
                debug!("failed to prune directory {}: {}", current.display(), err);
                break;
            }
        }
    }
}
