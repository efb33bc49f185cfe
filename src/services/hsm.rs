//! HSM residency checks and recall for replicas on tape-aware boxes.

use serde::Serialize;
use std::{collections::HashSet, io, sync::Arc};
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Actor, Job, Priority, StorageError, StorageResult, StorageService};
use crate::backends::{
    BackendKind, StorageBackend,
    hsm::{
        DOS_ATTRIB_XATTR, FILE_ATTRIBUTE_OFFLINE, looks_offline, parse_dos_attrib, read_xattr,
        stat_blocks,
    },
};
use crate::services::replicas::ReplicaHandle;

/// Rough count of resident files in a dataset. Informational only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct OnlineCount {
    pub online_files: usize,
    pub total_files: usize,
}

impl StorageService {
    /// Replica must be verified and live on a tape-aware backend.
    async fn tape_backend(&self, handle: &ReplicaHandle) -> StorageResult<Arc<dyn StorageBackend>> {
        if !handle.record.verified {
            return Err(StorageError::ReplicaNotVerified(handle.id()));
        }
        let unsupported = || StorageError::UnsupportedBackend {
            storage_box: handle.storage_box.name.clone(),
            backend: handle.storage_box.backend_class.clone(),
        };
        if BackendKind::from_identifier(&handle.storage_box.backend_class)
            != Some(BackendKind::TapeAware)
        {
            return Err(unsupported());
        }
        let backend = handle.backend(self).await?;
        if backend.kind() != BackendKind::TapeAware {
            return Err(unsupported());
        }
        Ok(backend)
    }

    /// Whether the replica's bytes are resident on disk.
    ///
    /// Reads the DOS attribute xattr and tests the offline bit. When the
    /// attribute is missing or the filesystem does not support it, falls back
    /// to comparing allocated blocks with the file size.
    pub async fn replica_online(&self, handle: &ReplicaHandle) -> StorageResult<bool> {
        let backend = self.tape_backend(handle).await?;
        let uri = handle
            .record
            .uri
            .as_deref()
            .ok_or(StorageError::ReplicaNotWritten(handle.id()))?;
        let path = backend
            .local_path(uri)
            .ok_or_else(|| StorageError::InvalidUri(uri.to_string()))?;

        match read_xattr(&path, DOS_ATTRIB_XATTR).await {
            Ok(Some(raw)) => match parse_dos_attrib(&raw) {
                Some(attrs) => return Ok(attrs & FILE_ATTRIBUTE_OFFLINE == 0),
                None => warn!(replica_id = %handle.id(), "unparseable {}", DOS_ATTRIB_XATTR),
            },
            Ok(None) => debug!(replica_id = %handle.id(), "no {} attribute", DOS_ATTRIB_XATTR),
            Err(err) if err.kind() == io::ErrorKind::Unsupported => {
                warn!(replica_id = %handle.id(), error = %err, "xattrs unsupported, using block count")
            }
            Err(err) => return Err(err.into()),
        }

        let (size, blocks) = stat_blocks(&path).await?;
        Ok(!looks_offline(
            size,
            blocks,
            self.settings.max_inode_file_size,
        ))
    }

    /// Count files in a dataset, minus those whose tape replicas look like
    /// stubs. Files are stat'ed one by one; the result is a heuristic and
    /// must not be used for access decisions.
    pub async fn count_online_in_dataset(&self, dataset_id: Uuid) -> StorageResult<OnlineCount> {
        self.find_dataset(dataset_id).await?;
        let datafiles = self.datafiles_in_dataset(dataset_id).await?;
        let total_files = datafiles.len();
        let mut offline: HashSet<Uuid> = HashSet::new();

        for datafile in &datafiles {
            for handle in self.replicas_for(datafile.id, true).await? {
                if BackendKind::from_identifier(&handle.storage_box.backend_class)
                    != Some(BackendKind::TapeAware)
                {
                    continue;
                }
                let Some(uri) = handle.record.uri.as_deref() else {
                    continue;
                };
                let backend = match handle.backend(self).await {
                    Ok(backend) => backend,
                    Err(err) => {
                        warn!(storage_box = %handle.storage_box.name, error = %err, "skipping box");
                        continue;
                    }
                };
                let Some(path) = backend.local_path(uri) else {
                    continue;
                };
                match stat_blocks(&path).await {
                    Ok((size, blocks))
                        if looks_offline(size, blocks, self.settings.max_inode_file_size) =>
                    {
                        offline.insert(datafile.id);
                    }
                    Ok(_) => {}
                    Err(err) => debug!(path = %path.display(), error = %err, "stat failed"),
                }
            }
        }

        Ok(OnlineCount {
            online_files: total_files - offline.len(),
            total_files,
        })
    }

    /// Queue a recall of a tape replica on behalf of `requester`.
    pub async fn request_recall(&self, handle: &ReplicaHandle, requester: &Actor) -> StorageResult<()> {
        self.tape_backend(handle).await?;
        self.dispatch(
            Job::Recall {
                replica_id: handle.id(),
                requester: requester.clone(),
            },
            Priority::High,
        );
        info!(replica_id = %handle.id(), requester = %requester.id, "recall requested");
        Ok(())
    }

    /// Read the first bytes of a replica so the HSM stages it, then tell the
    /// requester how it went.
    pub async fn perform_recall(&self, replica_id: Uuid, requester: &Actor) -> StorageResult<()> {
        let outcome = self.read_recall_prefix(replica_id).await;
        let (subject, body) = match &outcome {
            Ok(read) => (
                "Recall complete".to_string(),
                format!("Replica {} has been recalled ({} bytes read).", replica_id, read),
            ),
            Err(err) => (
                "Recall failed".to_string(),
                format!("Replica {} could not be recalled: {}", replica_id, err),
            ),
        };
        if let Err(err) = self.notifier().notify(requester, &subject, &body).await {
            warn!(%replica_id, requester = %requester.id, error = %err, "failed to send recall notice");
        }
        outcome.map(|_| ())
    }

    async fn read_recall_prefix(&self, replica_id: Uuid) -> StorageResult<usize> {
        let handle = self.replica(replica_id).await?;
        self.tape_backend(&handle).await?;
        let reader = self.open_replica(&handle).await?;
        let mut buf = Vec::with_capacity(self.settings.recall_read_bytes);
        let read = reader
            .take(self.settings.recall_read_bytes as u64)
            .read_to_end(&mut buf)
            .await?;
        info!(%replica_id, bytes = read, "recall read finished");
        Ok(read)
    }
}
