//! DataFileObject (replica) operations.
//!
//! A replica moves through `unwritten -> written (unverified) -> verified`,
//! or back to unverified after a failed check. Every write clears
//! `verified`; only [`StorageService::verify_replica`] sets it, and each
//! verification starts from scratch.

use chrono::Utc;
use serde::Serialize;
use std::{fmt, sync::Arc};
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    Job, Priority, StorageError, StorageResult, StorageService,
    checksum::{self, Algorithm, Checksums},
    error::is_unique_violation,
};
use crate::backends::{self, BoxedReader, StorageBackend, UriParts, ensure_uri_safe};
use crate::models::{
    datafile::{DataFile, guess_mimetype, non_empty},
    datafile_object::DataFileObject,
    storage_box::StorageBox,
};

const REPLICA_COLUMNS: &str =
    "id, datafile_id, storage_box_id, uri, created_time, verified, last_verified_time";

/// A replica record together with its box and a lazily built backend.
///
/// Handles are cheap to create and are not meant to be shared across
/// workers: each task loads its own.
#[derive(Clone)]
pub struct ReplicaHandle {
    pub record: DataFileObject,
    pub storage_box: StorageBox,
    backend: OnceCell<Arc<dyn StorageBackend>>,
}

impl fmt::Debug for ReplicaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicaHandle")
            .field("record", &self.record)
            .field("storage_box", &self.storage_box.name)
            .field("backend_ready", &self.backend.initialized())
            .finish()
    }
}

impl ReplicaHandle {
    pub fn new(record: DataFileObject, storage_box: StorageBox) -> Self {
        Self {
            record,
            storage_box,
            backend: OnceCell::new(),
        }
    }

    fn with_backend(
        record: DataFileObject,
        storage_box: StorageBox,
        backend: Arc<dyn StorageBackend>,
    ) -> Self {
        Self {
            record,
            storage_box,
            backend: OnceCell::new_with(Some(backend)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.record.id
    }

    /// Backend for this replica's box, built on first use.
    pub async fn backend(&self, service: &StorageService) -> StorageResult<Arc<dyn StorageBackend>> {
        self.backend
            .get_or_try_init(|| service.resolve_backend(&self.storage_box))
            .await
            .map(Arc::clone)
    }

    /// Change the URI and drop the cached backend.
    pub fn set_uri(&mut self, uri: Option<String>) {
        self.record.uri = uri;
        self.backend = OnceCell::new();
    }

    fn uri(&self) -> StorageResult<&str> {
        self.record
            .uri
            .as_deref()
            .ok_or(StorageError::ReplicaNotWritten(self.record.id))
    }
}

/// Result of [`StorageService::copy_replica`].
#[derive(Debug)]
pub enum CopyOutcome {
    /// A new replica was written into the destination box.
    Created(ReplicaHandle),
    /// The destination box already held a replica; nothing was copied.
    Existing(ReplicaHandle),
}

impl CopyOutcome {
    pub fn replica(&self) -> &ReplicaHandle {
        match self {
            Self::Created(h) | Self::Existing(h) => h,
        }
    }

    pub fn into_replica(self) -> ReplicaHandle {
        match self {
            Self::Created(h) | Self::Existing(h) => h,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

#[derive(Debug)]
pub struct MoveOutcome {
    pub replica: ReplicaHandle,
    /// False when source and destination were the same record.
    pub source_deleted: bool,
}

/// One field that did not match during verification.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Mismatch {
    pub field: &'static str,
    /// Value recorded on the DataFile, `None` when it was required but unset.
    pub expected: Option<String>,
    pub actual: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    pub replica_id: Uuid,
    pub verified: bool,
    pub mismatches: Vec<Mismatch>,
    /// DataFile fields that were empty and have been filled from this replica.
    pub backfilled: Vec<&'static str>,
}

/// DataFile column updates collected during a verification pass.
#[derive(Default)]
struct Backfill {
    size: Option<i64>,
    md5sum: Option<String>,
    sha512sum: Option<String>,
}

impl Backfill {
    fn fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.size.is_some() {
            fields.push("size");
        }
        if self.md5sum.is_some() {
            fields.push("md5sum");
        }
        if self.sha512sum.is_some() {
            fields.push("sha512sum");
        }
        fields
    }
}

impl StorageService {
    /// Load a replica and its box.
    pub async fn replica(&self, id: Uuid) -> StorageResult<ReplicaHandle> {
        let record = sqlx::query_as::<_, DataFileObject>(&format!(
            "SELECT {} FROM datafile_objects WHERE id = ?",
            REPLICA_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or(StorageError::ReplicaNotFound(id))?;
        let storage_box = self.find_storage_box(record.storage_box_id).await?;
        Ok(ReplicaHandle::new(record, storage_box))
    }

    /// Replicas of a DataFile, oldest first.
    pub async fn replicas_for(
        &self,
        datafile_id: Uuid,
        verified_only: bool,
    ) -> StorageResult<Vec<ReplicaHandle>> {
        let sql = if verified_only {
            format!(
                "SELECT {} FROM datafile_objects WHERE datafile_id = ? AND verified = 1 ORDER BY created_time",
                REPLICA_COLUMNS
            )
        } else {
            format!(
                "SELECT {} FROM datafile_objects WHERE datafile_id = ? ORDER BY created_time",
                REPLICA_COLUMNS
            )
        };
        let records = sqlx::query_as::<_, DataFileObject>(&sql)
            .bind(datafile_id)
            .fetch_all(&*self.db)
            .await?;

        let mut handles = Vec::with_capacity(records.len());
        for record in records {
            let storage_box = self.find_storage_box(record.storage_box_id).await?;
            handles.push(ReplicaHandle::new(record, storage_box));
        }
        Ok(handles)
    }

    pub(crate) async fn replica_in_box(
        &self,
        datafile_id: Uuid,
        box_id: Uuid,
    ) -> StorageResult<Option<DataFileObject>> {
        Ok(sqlx::query_as::<_, DataFileObject>(&format!(
            "SELECT {} FROM datafile_objects WHERE datafile_id = ? AND storage_box_id = ?",
            REPLICA_COLUMNS
        ))
        .bind(datafile_id)
        .bind(box_id)
        .fetch_optional(&*self.db)
        .await?)
    }

    /// Register an empty replica. A second replica in the same box is refused.
    pub async fn create_replica(
        &self,
        datafile_id: Uuid,
        storage_box: &StorageBox,
    ) -> StorageResult<ReplicaHandle> {
        self.find_datafile(datafile_id).await?;
        let record = DataFileObject::new(datafile_id, storage_box.id);
        match insert_replica(&*self.db, &record).await {
            Ok(()) => {}
            Err(err) if is_unique_violation(&err) => {
                return Err(StorageError::DuplicateReplica {
                    datafile: datafile_id,
                    storage_box: storage_box.id,
                });
            }
            Err(err) => return Err(err.into()),
        }
        debug!(replica_id = %record.id, storage_box = %storage_box.name, "created replica");
        Ok(ReplicaHandle::new(record, storage_box.clone()))
    }

    /// URI for a DataFile in a given backend: the backend's own naming when
    /// it has one, else `{dataset dir}/{directory}/{filename}`.
    async fn derive_uri(
        &self,
        datafile: &DataFile,
        backend: &dyn StorageBackend,
    ) -> StorageResult<String> {
        let dataset = self.find_dataset(datafile.dataset_id).await?;
        let dataset_dir = dataset.dir_name();
        let parts = UriParts {
            dataset_dir: &dataset_dir,
            directory: datafile.directory.as_deref(),
            filename: &datafile.filename,
        };
        let uri = backend
            .build_uri(&parts)
            .unwrap_or_else(|| parts.default_uri());
        ensure_uri_safe(&uri).map_err(|_| StorageError::InvalidUri(uri.clone()))?;
        Ok(uri)
    }

    /// Stream `reader` into the replica, assigning a URI first if needed.
    ///
    /// The replica is left unverified and a verification job is queued.
    pub async fn write_replica(
        &self,
        handle: &mut ReplicaHandle,
        reader: BoxedReader,
    ) -> StorageResult<u64> {
        let backend = handle.backend(self).await?;
        let uri = match handle.record.uri.clone() {
            Some(uri) => uri,
            None => {
                let datafile = self.find_datafile(handle.record.datafile_id).await?;
                self.derive_uri(&datafile, backend.as_ref()).await?
            }
        };

        let written = backend.write(&uri, reader).await?;

        sqlx::query("UPDATE datafile_objects SET uri = ?, verified = 0 WHERE id = ?")
            .bind(&uri)
            .bind(handle.record.id)
            .execute(&*self.db)
            .await?;
        if handle.record.uri.as_deref() != Some(uri.as_str()) {
            handle.set_uri(Some(uri));
        }
        handle.record.verified = false;

        info!(replica_id = %handle.record.id, bytes = written, "wrote replica");
        self.dispatch(
            Job::VerifyReplica {
                replica_id: handle.record.id,
            },
            Priority::Normal,
        );
        Ok(written)
    }

    /// Open the replica's bytes for reading.
    pub async fn open_replica(&self, handle: &ReplicaHandle) -> StorageResult<BoxedReader> {
        let uri = handle.uri()?;
        let backend = handle.backend(self).await?;
        Ok(backend.open_read(uri).await?)
    }

    /// Compare the bytes in the backend with the DataFile's recorded size and
    /// checksums.
    ///
    /// Checksums are only computed once the size matches. Empty DataFile
    /// fields are filled from the replica when the matching `add_*` flag is
    /// set, but only if verification succeeds. A mismatch is reported in the
    /// returned value; an unreadable backend is an error and leaves the
    /// replica unverified.
    pub async fn verify_replica(
        &self,
        handle: &mut ReplicaHandle,
        add_checksums: bool,
        add_size: bool,
    ) -> StorageResult<VerificationReport> {
        let datafile = self.find_datafile(handle.record.datafile_id).await?;
        let (mismatches, backfill) = match self
            .compare_replica(handle, &datafile, add_checksums, add_size)
            .await
        {
            Ok(result) => result,
            Err(err) => {
                error!(
                    replica_id = %handle.record.id,
                    datafile_id = %datafile.id,
                    error = %err,
                    "replica could not be read for verification"
                );
                self.set_replica_verified(handle, false).await?;
                return Err(err);
            }
        };

        for m in &mismatches {
            warn!(
                replica_id = %handle.record.id,
                datafile_id = %datafile.id,
                field = m.field,
                expected = m.expected.as_deref().unwrap_or("<unset>"),
                actual = %m.actual,
                "verification mismatch"
            );
        }

        let verified = mismatches.is_empty();
        let mut backfilled = Vec::new();
        if verified {
            let now = Utc::now();
            let mimetype = datafile
                .mimetype
                .as_deref()
                .filter(|m| !m.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| guess_mimetype(&datafile.filename).to_string());

            let mut tx = self.db.begin().await?;
            sqlx::query(
                "UPDATE datafiles SET
                    size = COALESCE(?, size),
                    md5sum = COALESCE(?, md5sum),
                    sha512sum = COALESCE(?, sha512sum),
                    mimetype = ?
                 WHERE id = ?",
            )
            .bind(backfill.size)
            .bind(&backfill.md5sum)
            .bind(&backfill.sha512sum)
            .bind(&mimetype)
            .bind(datafile.id)
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                "UPDATE datafile_objects SET verified = 1, last_verified_time = ? WHERE id = ?",
            )
            .bind(now)
            .bind(handle.record.id)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;

            handle.record.verified = true;
            handle.record.last_verified_time = Some(now);
            backfilled = backfill.fields();
            info!(replica_id = %handle.record.id, "replica verified");
        } else {
            self.set_replica_verified(handle, false).await?;
        }

        Ok(VerificationReport {
            replica_id: handle.record.id,
            verified,
            mismatches,
            backfilled,
        })
    }

    async fn set_replica_verified(
        &self,
        handle: &mut ReplicaHandle,
        verified: bool,
    ) -> StorageResult<()> {
        sqlx::query("UPDATE datafile_objects SET verified = ? WHERE id = ?")
            .bind(verified)
            .bind(handle.record.id)
            .execute(&*self.db)
            .await?;
        handle.record.verified = verified;
        Ok(())
    }

    async fn compare_replica(
        &self,
        handle: &ReplicaHandle,
        datafile: &DataFile,
        add_checksums: bool,
        add_size: bool,
    ) -> StorageResult<(Vec<Mismatch>, Backfill)> {
        let settings = &self.settings;
        let uri = handle.uri()?;
        let backend = handle.backend(self).await?;

        let mut mismatches = Vec::new();
        let mut backfill = Backfill::default();

        let actual_size = backend.size(uri).await?;
        match datafile.size {
            Some(expected) if expected >= 0 && expected as u64 == actual_size => {}
            Some(expected) => mismatches.push(Mismatch {
                field: "size",
                expected: Some(expected.to_string()),
                actual: actual_size.to_string(),
            }),
            None if add_size => backfill.size = Some(actual_size as i64),
            None if settings.require_sizes => mismatches.push(Mismatch {
                field: "size",
                expected: None,
                actual: actual_size.to_string(),
            }),
            None => {}
        }
        if !mismatches.is_empty() {
            return Ok((mismatches, backfill));
        }

        let has_md5 = non_empty(&datafile.md5sum);
        let has_sha512 = non_empty(&datafile.sha512sum);
        let mut algorithms = Vec::new();
        if has_md5 || (add_checksums && settings.compute_md5) {
            algorithms.push(Algorithm::Md5);
        }
        if has_sha512 || (add_checksums && settings.compute_sha512) {
            algorithms.push(Algorithm::Sha512);
        }

        if !algorithms.is_empty() {
            let actual = self
                .replica_checksums(backend.as_ref(), uri, &algorithms)
                .await?;
            check_digest(
                "md5sum",
                datafile.md5sum.as_deref(),
                actual.md5,
                add_checksums,
                &mut mismatches,
                &mut backfill.md5sum,
            );
            check_digest(
                "sha512sum",
                datafile.sha512sum.as_deref(),
                actual.sha512,
                add_checksums,
                &mut mismatches,
                &mut backfill.sha512sum,
            );
        }

        let any_checksum = has_md5
            || has_sha512
            || backfill.md5sum.is_some()
            || backfill.sha512sum.is_some();
        if settings.require_checksums && !any_checksum {
            mismatches.push(Mismatch {
                field: "checksum",
                expected: None,
                actual: "no checksum recorded".into(),
            });
        }

        Ok((mismatches, backfill))
    }

    /// Digests for `uri`, preferring the backend's own when it is configured
    /// to supply them and covers every requested algorithm.
    async fn replica_checksums(
        &self,
        backend: &dyn StorageBackend,
        uri: &str,
        algorithms: &[Algorithm],
    ) -> StorageResult<Checksums> {
        if self.settings.backend_checksums.contains(&backend.kind()) {
            if let Some(native) = backend.native_checksums(uri).await? {
                let covers = algorithms.iter().all(|alg| match alg {
                    Algorithm::Md5 => native.md5.is_some(),
                    Algorithm::Sha512 => native.sha512.is_some(),
                });
                if covers {
                    debug!(uri, backend = %backend.kind(), "using backend checksums");
                    return Ok(native);
                }
            }
        }
        let mut reader = backend.open_read(uri).await?;
        Ok(checksum::compute_checksums(
            &mut reader,
            algorithms,
            self.settings.checksum_chunk_blocks,
        )
        .await?)
    }

    /// Copy a verified replica into `dest`.
    ///
    /// Returns the existing replica when `dest` already holds one, queueing
    /// its re-verification if needed. Otherwise the bytes are written first
    /// and the row is recorded afterwards, so a failed write leaves no row
    /// and a failed insert removes the bytes it would have described. No
    /// database lock is held while bytes are in flight.
    pub async fn copy_replica(
        &self,
        source: &ReplicaHandle,
        dest: &StorageBox,
        verify: bool,
    ) -> StorageResult<CopyOutcome> {
        if !source.record.verified {
            warn!(replica_id = %source.record.id, "refusing to copy unverified replica");
            return Err(StorageError::ReplicaNotVerified(source.record.id));
        }

        if let Some(existing) = self.replica_in_box(source.record.datafile_id, dest.id).await? {
            return Ok(self.existing_copy(existing, dest, verify));
        }

        let datafile = self.find_datafile(source.record.datafile_id).await?;
        let dest_backend = self.resolve_backend(dest).await?;
        let uri = self.derive_uri(&datafile, dest_backend.as_ref()).await?;
        let reader = self.open_replica(source).await?;

        let written = match dest_backend.write(&uri, reader).await {
            Ok(written) => written,
            Err(err) => {
                error!(
                    datafile_id = %datafile.id,
                    storage_box = %dest.name,
                    error = %err,
                    "copy failed, no replica recorded"
                );
                return Err(err.into());
            }
        };

        let mut record = DataFileObject::new(datafile.id, dest.id);
        record.uri = Some(uri.clone());
        if let Err(err) = insert_replica(&*self.db, &record).await {
            if is_unique_violation(&err) {
                // another copy into the same box won; its row names these bytes
                if let Some(existing) = self.replica_in_box(datafile.id, dest.id).await? {
                    return Ok(self.existing_copy(existing, dest, verify));
                }
                return Err(StorageError::DuplicateReplica {
                    datafile: datafile.id,
                    storage_box: dest.id,
                });
            }
            let source_backend = source.backend(self).await?;
            let shared = match source.record.uri.as_deref() {
                Some(source_uri) => {
                    backends::same_location(
                        source_backend.as_ref(),
                        source_uri,
                        dest_backend.as_ref(),
                        &uri,
                    )
                    .await
                }
                None => false,
            };
            if !shared {
                if let Err(cleanup) = dest_backend.delete(&uri).await {
                    warn!(uri = %uri, error = %cleanup, "could not remove bytes of unrecorded copy");
                }
            }
            return Err(err.into());
        }

        info!(
            datafile_id = %datafile.id,
            from = %source.storage_box.name,
            to = %dest.name,
            bytes = written,
            "copied replica"
        );
        if verify {
            self.dispatch(
                Job::VerifyReplica {
                    replica_id: record.id,
                },
                Priority::Normal,
            );
        }
        Ok(CopyOutcome::Created(ReplicaHandle::with_backend(
            record,
            dest.clone(),
            dest_backend,
        )))
    }

    fn existing_copy(&self, existing: DataFileObject, dest: &StorageBox, verify: bool) -> CopyOutcome {
        if verify && !existing.verified {
            self.dispatch(
                Job::VerifyReplica {
                    replica_id: existing.id,
                },
                Priority::Normal,
            );
        }
        debug!(replica_id = %existing.id, storage_box = %dest.name, "replica already present");
        CopyOutcome::Existing(ReplicaHandle::new(existing, dest.clone()))
    }

    /// Copy into `dest`, verify the copy, then delete the source.
    ///
    /// The source is only deleted when the destination is a different record
    /// and is verified. A copy that fails verification is an error and the
    /// source is kept. When both boxes resolve to the same stored bytes only
    /// the source row goes.
    pub async fn move_replica(
        &self,
        source: ReplicaHandle,
        dest: &StorageBox,
    ) -> StorageResult<MoveOutcome> {
        let mut replica = self.copy_replica(&source, dest, false).await?.into_replica();
        if replica.record.id == source.record.id {
            return Ok(MoveOutcome {
                replica,
                source_deleted: false,
            });
        }

        if !replica.record.verified {
            let report = self.verify_replica(&mut replica, true, true).await?;
            if !report.verified {
                warn!(
                    replica_id = %replica.record.id,
                    source_id = %source.record.id,
                    "destination failed verification, keeping source"
                );
                return Err(StorageError::ReplicaNotVerified(replica.record.id));
            }
        }

        let source_id = source.record.id;
        self.delete_replica(source).await?;
        info!(%source_id, replica_id = %replica.record.id, storage_box = %dest.name, "moved replica");
        Ok(MoveOutcome {
            replica,
            source_deleted: true,
        })
    }

    /// Delete the replica's bytes, then its row.
    ///
    /// Bytes are kept when the box is marked `can_delete=false`, when nothing
    /// was ever written, or when another replica of the same DataFile
    /// resolves to the same stored bytes. A backend that cannot delete is
    /// logged and the row is still removed; any other failure keeps the row.
    pub async fn delete_replica(&self, handle: ReplicaHandle) -> StorageResult<()> {
        if let Some(uri) = handle.record.uri.as_deref() {
            let backend = handle.backend(self).await?;
            if self.bytes_shared(&handle, backend.as_ref(), uri).await? {
                warn!(
                    replica_id = %handle.record.id,
                    storage_box = %handle.storage_box.name,
                    uri,
                    "bytes shared with another replica, leaving them"
                );
            } else if self.can_delete(&handle.storage_box).await? {
                match backend.delete(uri).await {
                    Ok(()) => debug!(replica_id = %handle.record.id, uri, "deleted replica bytes"),
                    Err(err) if err.kind() == std::io::ErrorKind::Unsupported => warn!(
                        replica_id = %handle.record.id,
                        storage_box = %handle.storage_box.name,
                        "backend does not support deletion, leaving bytes"
                    ),
                    Err(err) => return Err(err.into()),
                }
            } else {
                info!(
                    replica_id = %handle.record.id,
                    storage_box = %handle.storage_box.name,
                    "storage box forbids deletion, leaving bytes"
                );
            }
        }

        sqlx::query("DELETE FROM datafile_objects WHERE id = ?")
            .bind(handle.record.id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }
}

impl StorageService {
    /// Whether another replica of the same DataFile points at the bytes
    /// stored at `uri`. A sibling whose backend cannot be built counts as
    /// sharing, so its bytes are never put at risk.
    async fn bytes_shared(
        &self,
        handle: &ReplicaHandle,
        backend: &dyn StorageBackend,
        uri: &str,
    ) -> StorageResult<bool> {
        for other in self.replicas_for(handle.record.datafile_id, false).await? {
            if other.record.id == handle.record.id {
                continue;
            }
            let Some(other_uri) = other.record.uri.as_deref() else {
                continue;
            };
            let other_backend = match other.backend(self).await {
                Ok(b) => b,
                Err(err) => {
                    warn!(replica_id = %other.record.id, error = %err, "cannot resolve sibling replica");
                    return Ok(true);
                }
            };
            if backends::same_location(backend, uri, other_backend.as_ref(), other_uri).await {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

fn check_digest(
    field: &'static str,
    recorded: Option<&str>,
    actual: Option<String>,
    add: bool,
    mismatches: &mut Vec<Mismatch>,
    backfill: &mut Option<String>,
) {
    let Some(actual) = actual else { return };
    match recorded.filter(|v| !v.is_empty()) {
        Some(expected) if expected.eq_ignore_ascii_case(&actual) => {}
        Some(expected) => mismatches.push(Mismatch {
            field,
            expected: Some(expected.to_string()),
            actual,
        }),
        None if add => *backfill = Some(actual),
        None => {}
    }
}

async fn insert_replica<'e, E>(executor: E, record: &DataFileObject) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        "INSERT INTO datafile_objects (id, datafile_id, storage_box_id, uri, created_time, verified, last_verified_time)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(record.id)
    .bind(record.datafile_id)
    .bind(record.storage_box_id)
    .bind(&record.uri)
    .bind(record.created_time)
    .bind(record.verified)
    .bind(record.last_verified_time)
    .execute(executor)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{datafile::NewDataFile, storage_box::OPT_LOCATION};
    use crate::test_support::{local_box, service};
    use tokio::io::AsyncReadExt;

    const CONTENT: &[u8] = b"123test\n";
    const CONTENT_MD5: &str = "930e419034038dfad994f0d2e602146c";

    async fn file_with(svc: &StorageService, size: Option<i64>, md5: Option<&str>) -> DataFile {
        let dataset = svc.create_dataset("Run 1", None, None).await.unwrap();
        svc.create_datafile(NewDataFile {
            dataset_id: dataset.id,
            filename: "a.txt".into(),
            size,
            md5sum: md5.map(str::to_string),
            ..Default::default()
        })
        .await
        .unwrap()
    }

    // a record registered before sizes and checksums were required
    async fn clear_recorded(svc: &StorageService, id: Uuid) {
        sqlx::query("UPDATE datafiles SET size = NULL, md5sum = NULL, mimetype = NULL WHERE id = ?")
            .bind(id)
            .execute(&*svc.db)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn write_assigns_uri_and_queues_verification() {
        let (svc, queue, dir) = service().await;
        let disk = local_box(&svc, "disk", "disk", dir.path()).await;
        let df = file_with(&svc, Some(8), Some(CONTENT_MD5)).await;

        let mut handle = svc.create_replica(df.id, &disk).await.unwrap();
        svc.write_replica(&mut handle, Box::pin(CONTENT)).await.unwrap();

        let uri = handle.record.uri.clone().unwrap();
        assert!(uri.starts_with("Run_1-"));
        assert!(uri.ends_with("/a.txt"));
        assert!(!handle.record.verified);
        assert_eq!(
            queue.jobs(),
            vec![(
                Job::VerifyReplica {
                    replica_id: handle.id()
                },
                Priority::Normal
            )]
        );

        let mut out = Vec::new();
        svc.open_replica(&handle)
            .await
            .unwrap()
            .read_to_end(&mut out)
            .await
            .unwrap();
        assert_eq!(out, CONTENT);
    }

    #[tokio::test]
    async fn second_replica_in_same_box_rejected() {
        let (svc, _queue, dir) = service().await;
        let disk = local_box(&svc, "disk", "disk", dir.path()).await;
        let df = file_with(&svc, Some(8), Some(CONTENT_MD5)).await;
        svc.create_replica(df.id, &disk).await.unwrap();
        let err = svc.create_replica(df.id, &disk).await.unwrap_err();
        assert!(matches!(err, StorageError::DuplicateReplica { .. }));
    }

    #[tokio::test]
    async fn verify_detects_size_mismatch_without_checksumming() {
        let (svc, _queue, dir) = service().await;
        let disk = local_box(&svc, "disk", "disk", dir.path()).await;
        let df = file_with(&svc, Some(9), Some(CONTENT_MD5)).await;
        let mut handle = svc.create_replica(df.id, &disk).await.unwrap();
        svc.write_replica(&mut handle, Box::pin(CONTENT)).await.unwrap();

        let report = svc.verify_replica(&mut handle, true, true).await.unwrap();
        assert!(!report.verified);
        assert_eq!(report.mismatches.len(), 1);
        assert_eq!(report.mismatches[0].field, "size");
        assert_eq!(report.mismatches[0].expected.as_deref(), Some("9"));
        assert_eq!(report.mismatches[0].actual, "8");
        assert!(!svc.datafile_verified(df.id).await.unwrap());
    }

    #[tokio::test]
    async fn verify_detects_checksum_mismatch() {
        let (svc, _queue, dir) = service().await;
        let disk = local_box(&svc, "disk", "disk", dir.path()).await;
        let df = file_with(&svc, Some(8), Some("00000000000000000000000000000000")).await;
        let mut handle = svc.create_replica(df.id, &disk).await.unwrap();
        svc.write_replica(&mut handle, Box::pin(CONTENT)).await.unwrap();

        let report = svc.verify_replica(&mut handle, true, true).await.unwrap();
        assert!(!report.verified);
        assert_eq!(report.mismatches[0].field, "md5sum");
        assert_eq!(report.mismatches[0].actual, CONTENT_MD5);
    }

    #[tokio::test]
    async fn verify_backfills_missing_fields() {
        let (svc, _queue, dir) = service().await;
        let disk = local_box(&svc, "disk", "disk", dir.path()).await;
        let df = file_with(&svc, Some(8), Some(CONTENT_MD5)).await;
        clear_recorded(&svc, df.id).await;
        let mut handle = svc.create_replica(df.id, &disk).await.unwrap();
        svc.write_replica(&mut handle, Box::pin(CONTENT)).await.unwrap();

        let report = svc.verify_replica(&mut handle, true, true).await.unwrap();
        assert!(report.verified);
        assert_eq!(report.backfilled, vec!["size", "md5sum"]);

        let df = svc.find_datafile(df.id).await.unwrap();
        assert_eq!(df.size, Some(8));
        assert_eq!(df.md5sum.as_deref(), Some(CONTENT_MD5));
        assert_eq!(df.mimetype.as_deref(), Some("text/plain"));
    }

    #[tokio::test]
    async fn verify_without_backfill_fails_required_fields() {
        let (svc, _queue, dir) = service().await;
        let disk = local_box(&svc, "disk", "disk", dir.path()).await;
        let df = file_with(&svc, Some(8), Some(CONTENT_MD5)).await;
        clear_recorded(&svc, df.id).await;
        let mut handle = svc.create_replica(df.id, &disk).await.unwrap();
        svc.write_replica(&mut handle, Box::pin(CONTENT)).await.unwrap();

        let report = svc.verify_replica(&mut handle, false, false).await.unwrap();
        assert!(!report.verified);
        assert_eq!(report.mismatches[0].field, "size");
        assert!(report.backfilled.is_empty());
        assert_eq!(svc.find_datafile(df.id).await.unwrap().size, None);
    }

    #[tokio::test]
    async fn verify_of_missing_bytes_is_an_error() {
        let (svc, _queue, dir) = service().await;
        let disk = local_box(&svc, "disk", "disk", dir.path()).await;
        let df = file_with(&svc, Some(8), Some(CONTENT_MD5)).await;
        let mut handle = svc.create_replica(df.id, &disk).await.unwrap();
        svc.write_replica(&mut handle, Box::pin(CONTENT)).await.unwrap();
        svc.verify_replica(&mut handle, true, true).await.unwrap();
        assert!(handle.record.verified);

        let path = dir.path().join(handle.record.uri.as_deref().unwrap());
        std::fs::remove_file(path).unwrap();
        let err = svc.verify_replica(&mut handle, true, true).await.unwrap_err();
        assert!(matches!(err, StorageError::Io(_)));
        assert!(!svc.replica(handle.id()).await.unwrap().record.verified);
    }

    #[tokio::test]
    async fn unwritten_replica_cannot_be_read() {
        let (svc, _queue, dir) = service().await;
        let disk = local_box(&svc, "disk", "disk", dir.path()).await;
        let df = file_with(&svc, Some(8), Some(CONTENT_MD5)).await;
        let handle = svc.create_replica(df.id, &disk).await.unwrap();
        let err = svc.open_replica(&handle).await.err().unwrap();
        assert!(matches!(err, StorageError::ReplicaNotWritten(_)));
    }

    #[tokio::test]
    async fn delete_respects_can_delete() {
        let (svc, _queue, dir) = service().await;
        let keep = local_box(&svc, "keep", "disk", &dir.path().join("keep")).await;
        svc.set_box_attribute(keep.id, "can_delete", "false")
            .await
            .unwrap();
        let df = file_with(&svc, Some(8), Some(CONTENT_MD5)).await;
        let mut handle = svc.create_replica(df.id, &keep).await.unwrap();
        svc.write_replica(&mut handle, Box::pin(CONTENT)).await.unwrap();
        let path = dir
            .path()
            .join("keep")
            .join(handle.record.uri.as_deref().unwrap());

        svc.delete_replica(handle).await.unwrap();
        assert!(path.exists());
        assert!(svc.replicas_for(df.id, false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_copy_leaves_no_row() {
        let (svc, _queue, dir) = service().await;
        let disk = local_box(&svc, "disk", "disk", &dir.path().join("disk")).await;
        let df = file_with(&svc, Some(8), Some(CONTENT_MD5)).await;
        let mut source = svc.create_replica(df.id, &disk).await.unwrap();
        svc.write_replica(&mut source, Box::pin(CONTENT)).await.unwrap();
        svc.verify_replica(&mut source, true, true).await.unwrap();

        // a regular file where the destination root should be a directory
        let blocked = dir.path().join("blocked");
        std::fs::write(&blocked, b"").unwrap();
        let dest = local_box(&svc, "dest", "disk", &blocked).await;

        assert!(svc.copy_replica(&source, &dest, true).await.is_err());
        assert!(svc.replica_in_box(df.id, dest.id).await.unwrap().is_none());
        assert_eq!(svc.replicas_for(df.id, false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn move_between_boxes_sharing_bytes_keeps_them() {
        let (svc, _queue, dir) = service().await;
        let shared = dir.path().join("shared");
        let a = local_box(&svc, "a", "disk", &shared).await;
        let b = local_box(&svc, "b", "disk", &dir.path().join("b")).await;
        // a box registered before overlapping locations were refused
        sqlx::query("UPDATE storage_box_options SET value = ? WHERE storage_box_id = ? AND key = ?")
            .bind(shared.display().to_string())
            .bind(b.id)
            .bind(OPT_LOCATION)
            .execute(&*svc.db)
            .await
            .unwrap();

        let df = file_with(&svc, Some(8), Some(CONTENT_MD5)).await;
        let mut source = svc.create_replica(df.id, &a).await.unwrap();
        svc.write_replica(&mut source, Box::pin(CONTENT)).await.unwrap();
        svc.verify_replica(&mut source, true, true).await.unwrap();

        let moved = svc.move_replica(source, &b).await.unwrap();
        assert!(moved.source_deleted);
        let mut dest = moved.replica;
        let path = shared.join(dest.record.uri.as_deref().unwrap());
        assert_eq!(std::fs::read(&path).unwrap(), CONTENT);
        assert!(svc.verify_replica(&mut dest, true, true).await.unwrap().verified);

        let left = svc.replicas_for(df.id, false).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].storage_box.id, b.id);
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn copy_streams_without_holding_the_database() {
        use crate::{config::StorageSettings, db, services::ManualQueue};
        use std::{ffi::CString, io::Write, os::unix::ffi::OsStrExt, sync::mpsc, time::Duration};

        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("meta.db").display());
        let pool = db::connect(&url, 4).await.unwrap();
        db::run_migrations(&pool).await.unwrap();
        let svc = StorageService::new(
            Arc::new(pool),
            StorageSettings::default(),
            Arc::new(ManualQueue::new()),
        );

        let src = local_box(&svc, "src", "disk", &dir.path().join("src")).await;
        let dest = local_box(&svc, "dest", "disk", &dir.path().join("dest")).await;
        let df = file_with(&svc, Some(8), Some(CONTENT_MD5)).await;
        let mut source = svc.create_replica(df.id, &src).await.unwrap();
        svc.write_replica(&mut source, Box::pin(CONTENT)).await.unwrap();
        svc.verify_replica(&mut source, true, true).await.unwrap();

        // swap the stored file for a pipe fed by hand, so the copy stalls midway
        let path = dir
            .path()
            .join("src")
            .join(source.record.uri.as_deref().unwrap());
        std::fs::remove_file(&path).unwrap();
        let c_path = CString::new(path.as_os_str().as_bytes()).unwrap();
        assert_eq!(unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) }, 0);

        let (half_tx, half_rx) = tokio::sync::oneshot::channel::<()>();
        let (rest_tx, rest_rx) = mpsc::channel::<()>();
        let feeder = std::thread::spawn(move || {
            let mut pipe = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
            pipe.write_all(&CONTENT[..4]).unwrap();
            half_tx.send(()).unwrap();
            rest_rx.recv().unwrap();
            pipe.write_all(&CONTENT[4..]).unwrap();
        });

        let copier = {
            let svc = svc.clone();
            let source = source.clone();
            tokio::spawn(async move { svc.copy_replica(&source, &dest, true).await })
        };
        half_rx.await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let other_write = tokio::time::timeout(
            Duration::from_secs(2),
            svc.create_dataset("concurrent", None, None),
        )
        .await;
        rest_tx.send(()).unwrap();
        let outcome = copier.await.unwrap().unwrap();
        feeder.join().unwrap();

        assert!(other_write.expect("metadata write waited on the copy").is_ok());
        assert!(outcome.is_new());
        let copied = dir
            .path()
            .join("dest")
            .join(outcome.replica().record.uri.as_deref().unwrap());
        assert_eq!(std::fs::read(copied).unwrap(), CONTENT);
    }
}
