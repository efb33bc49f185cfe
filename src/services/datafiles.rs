//! Datasets and logical DataFiles: registration, replica selection, reads
//! and lifecycle.

use chrono::Utc;
use std::path::PathBuf;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    Job, Priority, StorageError, StorageResult, StorageService,
    error::is_unique_violation,
    replicas::{CopyOutcome, ReplicaHandle, VerificationReport},
};
use crate::backends::{BackendKind, BoxedReader};
use crate::models::{
    datafile::{DataFile, NewDataFile, guess_mimetype, non_empty},
    dataset::Dataset,
    storage_box::StorageType,
};

const DATAFILE_COLUMNS: &str = "id, dataset_id, filename, directory, size, created_time, \
     modification_time, mimetype, md5sum, sha512sum, deleted, deleted_time, version";

impl StorageService {
    pub async fn create_dataset(
        &self,
        description: &str,
        experiment_id: Option<Uuid>,
        project_id: Option<Uuid>,
    ) -> StorageResult<Dataset> {
        let dataset = Dataset {
            id: Uuid::new_v4(),
            description: description.to_string(),
            experiment_id,
            project_id,
            created_time: Utc::now(),
        };
        sqlx::query(
            "INSERT INTO datasets (id, description, experiment_id, project_id, created_time)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(dataset.id)
        .bind(&dataset.description)
        .bind(dataset.experiment_id)
        .bind(dataset.project_id)
        .bind(dataset.created_time)
        .execute(&*self.db)
        .await?;
        Ok(dataset)
    }

    pub async fn find_dataset(&self, id: Uuid) -> StorageResult<Dataset> {
        sqlx::query_as::<_, Dataset>(
            "SELECT id, description, experiment_id, project_id, created_time FROM datasets WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or(StorageError::DatasetNotFound(id))
    }

    /// Register a DataFile after ingest validation.
    ///
    /// Negative sizes are refused, as are records missing a checksum or a
    /// size when the settings require them. Nothing is stored on failure.
    pub async fn create_datafile(&self, new: NewDataFile) -> StorageResult<DataFile> {
        if let Some(size) = new.size.filter(|s| *s < 0) {
            return Err(StorageError::NegativeSize {
                filename: new.filename,
                size,
            });
        }
        if self.settings.require_checksums && !non_empty(&new.md5sum) && !non_empty(&new.sha512sum)
        {
            return Err(StorageError::MissingChecksum(new.filename));
        }
        if self.settings.require_sizes && new.size.is_none() {
            return Err(StorageError::MissingSize(new.filename));
        }
        self.find_dataset(new.dataset_id).await?;

        let mimetype = new
            .mimetype
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| guess_mimetype(&new.filename).to_string());
        let datafile = DataFile {
            id: Uuid::new_v4(),
            dataset_id: new.dataset_id,
            filename: new.filename,
            directory: new.directory.filter(|d| !d.trim_matches('/').is_empty()),
            size: new.size,
            created_time: Utc::now(),
            modification_time: new.modification_time,
            mimetype: Some(mimetype),
            md5sum: new.md5sum.filter(|v| !v.is_empty()),
            sha512sum: new.sha512sum.filter(|v| !v.is_empty()),
            deleted: false,
            deleted_time: None,
            version: new.version.unwrap_or(1),
        };

        let inserted = sqlx::query(
            "INSERT INTO datafiles (id, dataset_id, filename, directory, size, created_time,
                modification_time, mimetype, md5sum, sha512sum, deleted, deleted_time, version)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(datafile.id)
        .bind(datafile.dataset_id)
        .bind(&datafile.filename)
        .bind(&datafile.directory)
        .bind(datafile.size)
        .bind(datafile.created_time)
        .bind(datafile.modification_time)
        .bind(&datafile.mimetype)
        .bind(&datafile.md5sum)
        .bind(&datafile.sha512sum)
        .bind(datafile.deleted)
        .bind(datafile.deleted_time)
        .bind(datafile.version)
        .execute(&*self.db)
        .await;

        match inserted {
            Ok(_) => {
                info!(datafile_id = %datafile.id, filename = %datafile.filename, "registered datafile");
                Ok(datafile)
            }
            Err(err) if is_unique_violation(&err) => {
                Err(StorageError::DuplicateDataFile(datafile.relative_path()))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn find_datafile(&self, id: Uuid) -> StorageResult<DataFile> {
        sqlx::query_as::<_, DataFile>(&format!(
            "SELECT {} FROM datafiles WHERE id = ?",
            DATAFILE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or(StorageError::DataFileNotFound(id))
    }

    /// Live (not soft-deleted) DataFiles of a dataset.
    pub async fn datafiles_in_dataset(&self, dataset_id: Uuid) -> StorageResult<Vec<DataFile>> {
        Ok(sqlx::query_as::<_, DataFile>(&format!(
            "SELECT {} FROM datafiles WHERE dataset_id = ? AND deleted = 0 ORDER BY filename",
            DATAFILE_COLUMNS
        ))
        .bind(dataset_id)
        .fetch_all(&*self.db)
        .await?)
    }

    /// A DataFile is verified when any of its replicas is.
    pub async fn datafile_verified(&self, datafile_id: Uuid) -> StorageResult<bool> {
        let verified: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM datafile_objects WHERE datafile_id = ? AND verified = 1)",
        )
        .bind(datafile_id)
        .fetch_one(&*self.db)
        .await?;
        Ok(verified)
    }

    /// The replica reads should use: the one whose box type comes first in
    /// read-preference order, oldest first on ties.
    pub async fn preferred_replica(
        &self,
        datafile_id: Uuid,
        verified_only: bool,
    ) -> StorageResult<Option<ReplicaHandle>> {
        let mut best: Option<(StorageType, ReplicaHandle)> = None;
        for handle in self.replicas_for(datafile_id, verified_only).await? {
            let kind = self.storage_type(&handle.storage_box).await?;
            let better = match &best {
                None => true,
                Some((best_kind, best_handle)) => {
                    (kind.read_rank(), handle.record.created_time)
                        < (best_kind.read_rank(), best_handle.record.created_time)
                }
            };
            if better {
                best = Some((kind, handle));
            }
        }
        Ok(best.map(|(_, handle)| handle))
    }

    /// Whether the DataFile can be read without waiting on tape.
    ///
    /// True when nothing is verified yet, when a verified replica sits in a
    /// storage type that is never offline, or when the HSM reports a tape
    /// replica as resident. A tape replica whose file cannot be inspected
    /// counts as offline; a box that cannot be resolved is an error.
    pub async fn is_online(&self, datafile_id: Uuid) -> StorageResult<bool> {
        self.find_datafile(datafile_id).await?;
        let replicas = self.replicas_for(datafile_id, true).await?;
        if replicas.is_empty() {
            return Ok(true);
        }

        let mut tape = Vec::new();
        for handle in replicas {
            if !self.storage_type(&handle.storage_box).await?.is_offline() {
                return Ok(true);
            }
            tape.push(handle);
        }

        for handle in &tape {
            if BackendKind::from_identifier(&handle.storage_box.backend_class)
                != Some(BackendKind::TapeAware)
            {
                continue;
            }
            match self.replica_online(handle).await {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(StorageError::Io(err)) => warn!(
                    replica_id = %handle.id(),
                    error = %err,
                    "online check failed, assuming offline"
                ),
                Err(err) => return Err(err),
            }
        }
        Ok(false)
    }

    /// Open the preferred verified replica.
    ///
    /// Reading from tape also queues a low-priority job to put a copy in the
    /// box's cache tier.
    pub async fn read_datafile(&self, datafile_id: Uuid) -> StorageResult<BoxedReader> {
        let handle = self
            .preferred_replica(datafile_id, true)
            .await?
            .ok_or(StorageError::NoVerifiedReplica(datafile_id))?;
        if self.storage_type(&handle.storage_box).await? == StorageType::Tape {
            self.dispatch(Job::EnsureCached { datafile_id }, Priority::Low);
        }
        self.open_replica(&handle).await
    }

    /// Verify every replica. Replicas that cannot be read are logged and
    /// left out of the result.
    pub async fn verify_datafile(&self, datafile_id: Uuid) -> StorageResult<Vec<VerificationReport>> {
        let mut reports = Vec::new();
        for mut handle in self.replicas_for(datafile_id, false).await? {
            match self.verify_replica(&mut handle, true, true).await {
                Ok(report) => reports.push(report),
                Err(err) => warn!(
                    replica_id = %handle.id(),
                    error = %err,
                    "skipping unreadable replica"
                ),
            }
        }
        Ok(reports)
    }

    /// Copy the preferred replica into its box's cache child when that
    /// replica lives on tape. Returns the cache replica, if any.
    pub async fn cache_datafile(&self, datafile_id: Uuid) -> StorageResult<Option<ReplicaHandle>> {
        let Some(source) = self.preferred_replica(datafile_id, true).await? else {
            debug!(%datafile_id, "nothing verified to cache");
            return Ok(None);
        };
        if self.storage_type(&source.storage_box).await? != StorageType::Tape {
            return Ok(None);
        }
        let Some(cache) = self.cache_child(&source.storage_box).await? else {
            debug!(%datafile_id, storage_box = %source.storage_box.name, "no cache box");
            return Ok(None);
        };
        let outcome = self.copy_replica(&source, &cache, true).await?;
        if let CopyOutcome::Created(created) = &outcome {
            info!(%datafile_id, replica_id = %created.id(), cache = %cache.name, "cached datafile");
        }
        Ok(Some(outcome.into_replica()))
    }

    /// Store bytes for a new DataFile in the default box.
    pub async fn ingest_datafile(
        &self,
        new: NewDataFile,
        reader: BoxedReader,
    ) -> StorageResult<(DataFile, ReplicaHandle)> {
        let datafile = self.create_datafile(new).await?;
        let storage_box = self.get_default_storage_box().await?;
        let mut handle = self.create_replica(datafile.id, &storage_box).await?;
        if let Err(err) = self.write_replica(&mut handle, reader).await {
            warn!(datafile_id = %datafile.id, error = %err, "ingest failed, removing record");
            self.delete_datafile(datafile.id).await?;
            return Err(err);
        }
        Ok((datafile, handle))
    }

    /// Delete every replica (bytes first), then the DataFile row.
    pub async fn delete_datafile(&self, datafile_id: Uuid) -> StorageResult<()> {
        for handle in self.replicas_for(datafile_id, false).await? {
            self.delete_replica(handle).await?;
        }
        sqlx::query("DELETE FROM datafiles WHERE id = ?")
            .bind(datafile_id)
            .execute(&*self.db)
            .await?;
        info!(%datafile_id, "deleted datafile");
        Ok(())
    }

    pub async fn soft_delete_datafile(&self, datafile_id: Uuid) -> StorageResult<()> {
        let result = sqlx::query(
            "UPDATE datafiles SET deleted = 1, deleted_time = ? WHERE id = ? AND deleted = 0",
        )
        .bind(Utc::now())
        .bind(datafile_id)
        .execute(&*self.db)
        .await?;
        if result.rows_affected() == 0 {
            // already deleted, or missing
            self.find_datafile(datafile_id).await?;
        }
        Ok(())
    }

    /// Filesystem path of the preferred verified replica, when its backend
    /// is file based.
    pub async fn absolute_path(&self, datafile_id: Uuid) -> StorageResult<Option<PathBuf>> {
        let Some(handle) = self.preferred_replica(datafile_id, true).await? else {
            return Ok(None);
        };
        let Some(uri) = handle.record.uri.as_deref() else {
            return Ok(None);
        };
        Ok(handle.backend(self).await?.local_path(uri))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::storage_box::{ATTR_TYPE, OPT_LOCATION};
    use crate::services::storage_boxes::NewStorageBox;
    use crate::test_support::{local_box, service};
    use tokio::io::AsyncReadExt;

    fn new_file(dataset_id: Uuid, name: &str) -> NewDataFile {
        NewDataFile {
            dataset_id,
            filename: name.into(),
            size: Some(8),
            md5sum: Some("930e419034038dfad994f0d2e602146c".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn ingest_validation() {
        let (svc, _queue, _dir) = service().await;
        let ds = svc.create_dataset("ds", None, None).await.unwrap();

        let mut negative = new_file(ds.id, "neg");
        negative.size = Some(-1);
        assert!(matches!(
            svc.create_datafile(negative).await.unwrap_err(),
            StorageError::NegativeSize { size: -1, .. }
        ));

        let mut no_checksum = new_file(ds.id, "nosum");
        no_checksum.md5sum = None;
        assert!(matches!(
            svc.create_datafile(no_checksum).await.unwrap_err(),
            StorageError::MissingChecksum(_)
        ));

        let mut no_size = new_file(ds.id, "nosize");
        no_size.size = None;
        assert!(matches!(
            svc.create_datafile(no_size).await.unwrap_err(),
            StorageError::MissingSize(_)
        ));

        assert!(svc.datafiles_in_dataset(ds.id).await.unwrap().is_empty());

        assert!(matches!(
            svc.create_datafile(new_file(Uuid::new_v4(), "orphan"))
                .await
                .unwrap_err(),
            StorageError::DatasetNotFound(_)
        ));
    }

    #[tokio::test]
    async fn duplicate_name_and_version_rejected() {
        let (svc, _queue, _dir) = service().await;
        let ds = svc.create_dataset("ds", None, None).await.unwrap();
        let first = svc.create_datafile(new_file(ds.id, "a.csv")).await.unwrap();
        assert_eq!(first.mimetype.as_deref(), Some("text/csv"));

        let err = svc.create_datafile(new_file(ds.id, "a.csv")).await.unwrap_err();
        assert!(matches!(err, StorageError::DuplicateDataFile(_)));

        let mut v2 = new_file(ds.id, "a.csv");
        v2.version = Some(2);
        svc.create_datafile(v2).await.unwrap();

        let mut nested = new_file(ds.id, "a.csv");
        nested.directory = Some("sub".into());
        svc.create_datafile(nested).await.unwrap();
        assert_eq!(svc.datafiles_in_dataset(ds.id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn online_without_verified_replicas() {
        let (svc, _queue, _dir) = service().await;
        let ds = svc.create_dataset("ds", None, None).await.unwrap();
        let df = svc.create_datafile(new_file(ds.id, "a")).await.unwrap();
        assert!(svc.is_online(df.id).await.unwrap());
        assert!(svc.preferred_replica(df.id, true).await.unwrap().is_none());
        assert!(matches!(
            svc.read_datafile(df.id).await.err().unwrap(),
            StorageError::NoVerifiedReplica(_)
        ));
    }

    #[tokio::test]
    async fn tape_read_queues_cache_warming_and_cache_copies() {
        let (svc, queue, dir) = service().await;
        let tape = local_box(&svc, "tape", "tape", &dir.path().join("tape")).await;
        let cache = local_box(&svc, "cache", "cache", &dir.path().join("cache")).await;
        sqlx::query("UPDATE storage_boxes SET master_box_id = ? WHERE id = ?")
            .bind(tape.id)
            .bind(cache.id)
            .execute(&*svc.db)
            .await
            .unwrap();

        let ds = svc.create_dataset("ds", None, None).await.unwrap();
        let df = svc.create_datafile(new_file(ds.id, "a.txt")).await.unwrap();
        let mut handle = svc.create_replica(df.id, &tape).await.unwrap();
        svc.write_replica(&mut handle, Box::pin(&b"123test\n"[..]))
            .await
            .unwrap();
        svc.verify_replica(&mut handle, true, true).await.unwrap();
        queue.drain();

        // plain filesystem backend on a tape-typed box counts as offline
        assert!(!svc.is_online(df.id).await.unwrap());

        let mut out = Vec::new();
        svc.read_datafile(df.id)
            .await
            .unwrap()
            .read_to_end(&mut out)
            .await
            .unwrap();
        assert_eq!(out, b"123test\n");
        assert_eq!(
            queue.jobs(),
            vec![(Job::EnsureCached { datafile_id: df.id }, Priority::Low)]
        );

        queue.run_pending(&svc).await;
        let cached = svc.replica_in_box(df.id, cache.id).await.unwrap().unwrap();
        assert!(cached.verified);
        assert!(svc.is_online(df.id).await.unwrap());
        assert_eq!(
            svc.preferred_replica(df.id, true)
                .await
                .unwrap()
                .unwrap()
                .storage_box
                .id,
            cache.id
        );
    }

    #[tokio::test]
    async fn online_check_fails_on_broken_box() {
        let (svc, queue, dir) = service().await;
        let hsm = svc
            .create_storage_box(
                NewStorageBox::new("hsm", BackendKind::TapeAware)
                    .option(OPT_LOCATION, dir.path().join("hsm").display().to_string())
                    .attribute(ATTR_TYPE, "tape"),
            )
            .await
            .unwrap();
        let ds = svc.create_dataset("ds", None, None).await.unwrap();
        let df = svc.create_datafile(new_file(ds.id, "a.txt")).await.unwrap();
        let mut handle = svc.create_replica(df.id, &hsm).await.unwrap();
        svc.write_replica(&mut handle, Box::pin(&b"123test\n"[..]))
            .await
            .unwrap();
        svc.verify_replica(&mut handle, true, true).await.unwrap();
        queue.drain();
        assert!(svc.is_online(df.id).await.unwrap());

        // file gone from the HSM mount: offline, not an error
        let backend = handle.backend(&svc).await.unwrap();
        let path = backend.local_path(handle.record.uri.as_deref().unwrap()).unwrap();
        std::fs::remove_file(path).unwrap();
        assert!(!svc.is_online(df.id).await.unwrap());

        sqlx::query("DELETE FROM storage_box_options WHERE storage_box_id = ? AND key = ?")
            .bind(hsm.id)
            .bind(OPT_LOCATION)
            .execute(&*svc.db)
            .await
            .unwrap();
        assert!(matches!(
            svc.is_online(df.id).await.unwrap_err(),
            StorageError::BackendMisconfigured { .. }
        ));
    }

    #[tokio::test]
    async fn ingest_and_delete() {
        let (svc, _queue, _dir) = service().await;
        let ds = svc.create_dataset("ds", None, None).await.unwrap();
        let (df, handle) = svc
            .ingest_datafile(new_file(ds.id, "a.txt"), Box::pin(&b"123test\n"[..]))
            .await
            .unwrap();
        let reports = svc.verify_datafile(df.id).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].verified);

        let path = svc.absolute_path(df.id).await.unwrap().unwrap();
        assert!(path.exists());
        assert!(path.ends_with(handle.record.uri.as_deref().unwrap()));

        svc.delete_datafile(df.id).await.unwrap();
        assert!(!path.exists());
        assert!(matches!(
            svc.find_datafile(df.id).await.unwrap_err(),
            StorageError::DataFileNotFound(_)
        ));
    }

    #[tokio::test]
    async fn soft_delete_hides_from_dataset_listing() {
        let (svc, _queue, _dir) = service().await;
        let ds = svc.create_dataset("ds", None, None).await.unwrap();
        let df = svc.create_datafile(new_file(ds.id, "a")).await.unwrap();
        svc.soft_delete_datafile(df.id).await.unwrap();
        svc.soft_delete_datafile(df.id).await.unwrap();
        let reloaded = svc.find_datafile(df.id).await.unwrap();
        assert!(reloaded.deleted);
        assert!(reloaded.deleted_time.is_some());
        assert!(svc.datafiles_in_dataset(ds.id).await.unwrap().is_empty());
        assert!(svc.soft_delete_datafile(Uuid::new_v4()).await.is_err());
    }
}
