//! Auto-archive policy: copy DataFiles into every archive box once their
//! offset has passed, prune other replicas, and expire them later.
//!
//! Archive boxes are the boxes with attribute `archive=true`. Pruning only
//! happens once every archive box holds a replica, so a partially archived
//! file keeps all of its copies.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use tracing::{info, warn};
use uuid::Uuid;

use super::{StorageError, StorageResult, StorageService};
use crate::models::{
    auto_archive::{AutoArchiveOffset, DataFileAutoArchive, EffectiveOffsets, OffsetScope},
    storage_box::ATTR_ARCHIVE,
};

const POLICY_COLUMNS: &str = "id, datafile_id, offset_days, delete_offset_days, archived, \
     archived_time, deleted, deleted_time";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ArchiveOutcome {
    /// No box is marked as an archive; nothing was done.
    NoArchiveBoxes,
    /// The DataFile has no verified replica to copy from; nothing was done.
    NoSourceReplica,
    /// Copies were started but not every archive box holds a verified replica yet.
    Pending { created: Vec<Uuid>, missing: usize },
    /// Every archive box holds a verified replica and the others were removed.
    Archived { pruned: usize },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub archived: usize,
    pub pending: usize,
    pub expired: usize,
    pub failed: usize,
}

impl StorageService {
    /// Attach an auto-archive record to a DataFile, replacing its offsets if
    /// one exists. `None` offsets are inherited from the experiment, then
    /// the project.
    pub async fn enable_auto_archive(
        &self,
        datafile_id: Uuid,
        offset_days: Option<i64>,
        delete_offset_days: Option<i64>,
    ) -> StorageResult<DataFileAutoArchive> {
        self.find_datafile(datafile_id).await?;
        sqlx::query(
            "INSERT INTO datafile_auto_archives (id, datafile_id, offset_days, delete_offset_days)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(datafile_id) DO UPDATE SET
                offset_days = excluded.offset_days,
                delete_offset_days = excluded.delete_offset_days",
        )
        .bind(Uuid::new_v4())
        .bind(datafile_id)
        .bind(offset_days)
        .bind(delete_offset_days)
        .execute(&*self.db)
        .await?;
        self.auto_archive_policy(datafile_id)
            .await?
            .ok_or(StorageError::DataFileNotFound(datafile_id))
    }

    pub async fn auto_archive_policy(
        &self,
        datafile_id: Uuid,
    ) -> StorageResult<Option<DataFileAutoArchive>> {
        Ok(sqlx::query_as::<_, DataFileAutoArchive>(&format!(
            "SELECT {} FROM datafile_auto_archives WHERE datafile_id = ?",
            POLICY_COLUMNS
        ))
        .bind(datafile_id)
        .fetch_optional(&*self.db)
        .await?)
    }

    /// Default offsets for every DataFile under an experiment or project.
    pub async fn set_archive_offset(
        &self,
        scope: OffsetScope,
        scope_id: Uuid,
        offset_days: i64,
        delete_offset_days: Option<i64>,
    ) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO auto_archive_offsets (id, scope, scope_id, offset_days, delete_offset_days)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(scope, scope_id) DO UPDATE SET
                offset_days = excluded.offset_days,
                delete_offset_days = excluded.delete_offset_days",
        )
        .bind(Uuid::new_v4())
        .bind(scope.as_str())
        .bind(scope_id)
        .bind(offset_days)
        .bind(delete_offset_days)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    async fn archive_offset(
        &self,
        scope: OffsetScope,
        scope_id: Option<Uuid>,
    ) -> StorageResult<Option<AutoArchiveOffset>> {
        let Some(scope_id) = scope_id else {
            return Ok(None);
        };
        Ok(sqlx::query_as::<_, AutoArchiveOffset>(
            "SELECT id, scope, scope_id, offset_days, delete_offset_days
             FROM auto_archive_offsets WHERE scope = ? AND scope_id = ?",
        )
        .bind(scope.as_str())
        .bind(scope_id)
        .fetch_optional(&*self.db)
        .await?)
    }

    /// Offsets after inheritance: DataFile, then experiment, then project,
    /// resolved per field.
    pub async fn effective_offsets(
        &self,
        policy: &DataFileAutoArchive,
    ) -> StorageResult<EffectiveOffsets> {
        let datafile = self.find_datafile(policy.datafile_id).await?;
        let dataset = self.find_dataset(datafile.dataset_id).await?;
        let experiment = self
            .archive_offset(OffsetScope::Experiment, dataset.experiment_id)
            .await?;
        let project = self
            .archive_offset(OffsetScope::Project, dataset.project_id)
            .await?;
        let inherited = [experiment, project];

        Ok(EffectiveOffsets {
            offset_days: policy
                .offset_days
                .or_else(|| inherited.iter().flatten().map(|o| o.offset_days).next()),
            delete_offset_days: policy.delete_offset_days.or_else(|| {
                inherited
                    .iter()
                    .flatten()
                    .find_map(|o| o.delete_offset_days)
            }),
        })
    }

    /// Copy the DataFile into every archive box that lacks it. Once all of
    /// them hold a verified replica, mark it archived and delete the
    /// replicas outside the archive boxes.
    ///
    /// `verified_only=false` lets an unverified replica stand as the source
    /// when no verified one exists. Nothing is copied from it and it never
    /// counts towards an archive box being held.
    pub async fn archive_datafile(
        &self,
        datafile_id: Uuid,
        verified_only: bool,
    ) -> StorageResult<ArchiveOutcome> {
        let archive_boxes = self.boxes_flagged(ATTR_ARCHIVE).await?;
        if archive_boxes.is_empty() {
            info!(%datafile_id, "no archive storage boxes configured");
            return Ok(ArchiveOutcome::NoArchiveBoxes);
        }
        let mut source = self.preferred_replica(datafile_id, true).await?;
        if source.is_none() && !verified_only {
            source = self.preferred_replica(datafile_id, false).await?;
        }
        let Some(source) = source else {
            info!(%datafile_id, "no verified replica to archive from");
            return Ok(ArchiveOutcome::NoSourceReplica);
        };

        let mut created = Vec::new();
        if source.record.verified {
            // existing unverified copies get their verification queued again
            for archive in &archive_boxes {
                let outcome = self.copy_replica(&source, archive, true).await?;
                if outcome.is_new() {
                    created.push(outcome.replica().id());
                }
            }
        } else {
            info!(
                %datafile_id,
                replica_id = %source.id(),
                "source replica unverified, no archive copies made"
            );
        }

        let mut missing = 0;
        for archive in &archive_boxes {
            let held = self
                .replica_in_box(datafile_id, archive.id)
                .await?
                .is_some_and(|r| r.verified);
            if !held {
                missing += 1;
            }
        }
        if missing > 0 {
            info!(%datafile_id, missing, "archive copies incomplete");
            return Ok(ArchiveOutcome::Pending { created, missing });
        }

        self.mark_archived(datafile_id).await?;

        let archive_ids: HashSet<Uuid> = archive_boxes.iter().map(|b| b.id).collect();
        let mut pruned = 0;
        for handle in self.replicas_for(datafile_id, false).await? {
            if !archive_ids.contains(&handle.storage_box.id) {
                self.delete_replica(handle).await?;
                pruned += 1;
            }
        }
        info!(%datafile_id, pruned, "datafile archived");
        Ok(ArchiveOutcome::Archived { pruned })
    }

    async fn mark_archived(&self, datafile_id: Uuid) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO datafile_auto_archives (id, datafile_id, archived, archived_time)
             VALUES (?, ?, 1, ?)
             ON CONFLICT(datafile_id) DO UPDATE SET
                archived = 1,
                archived_time = excluded.archived_time",
        )
        .bind(Uuid::new_v4())
        .bind(datafile_id)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    /// Remove an archived DataFile: delete every replica, soft-delete the
    /// record and close its policy. Files not yet archived are left alone
    /// and `false` is returned.
    pub async fn expire_datafile(&self, datafile_id: Uuid) -> StorageResult<bool> {
        let archived = self
            .auto_archive_policy(datafile_id)
            .await?
            .is_some_and(|p| p.archived);
        if !archived {
            warn!(%datafile_id, "refusing to expire datafile that is not archived");
            return Ok(false);
        }

        for handle in self.replicas_for(datafile_id, false).await? {
            self.delete_replica(handle).await?;
        }
        self.soft_delete_datafile(datafile_id).await?;
        sqlx::query(
            "UPDATE datafile_auto_archives SET deleted = 1, deleted_time = ? WHERE datafile_id = ?",
        )
        .bind(Utc::now())
        .bind(datafile_id)
        .execute(&*self.db)
        .await?;
        info!(%datafile_id, "datafile expired");
        Ok(true)
    }

    /// Archive or expire every DataFile whose offset has passed at `now`.
    /// Failures are counted and logged; the sweep carries on.
    pub async fn run_due_auto_archives(&self, now: DateTime<Utc>) -> StorageResult<SweepSummary> {
        let policies = sqlx::query_as::<_, DataFileAutoArchive>(&format!(
            "SELECT {} FROM datafile_auto_archives WHERE deleted = 0",
            POLICY_COLUMNS
        ))
        .fetch_all(&*self.db)
        .await?;

        let mut summary = SweepSummary::default();
        for policy in policies {
            let datafile_id = policy.datafile_id;
            let result = async {
                let datafile = self.find_datafile(datafile_id).await?;
                let offsets = self.effective_offsets(&policy).await?;
                if !policy.archived && offsets.archive_due(datafile.created_time, now) {
                    return self.archive_datafile(datafile_id, true).await.map(Some);
                }
                if policy.archived
                    && offsets.delete_due(datafile.created_time, now)
                    && self.expire_datafile(datafile_id).await?
                {
                    summary.expired += 1;
                }
                Ok::<_, StorageError>(None)
            }
            .await;

            match result {
                Ok(Some(ArchiveOutcome::Archived { .. })) => summary.archived += 1,
                Ok(Some(_)) => summary.pending += 1,
                Ok(None) => {}
                Err(err) => {
                    warn!(%datafile_id, error = %err, "auto-archive failed");
                    summary.failed += 1;
                }
            }
        }
        info!(?summary, "auto-archive sweep finished");
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::datafile::{DataFile, NewDataFile};
    use crate::models::storage_box::StorageBox;
    use crate::services::{Job, Priority, ReplicaHandle};
    use crate::test_support::{local_box, service};
    use chrono::Duration;

    #[tokio::test]
    async fn offsets_inherit_from_experiment_then_project() {
        let (svc, _queue, _dir) = service().await;
        let experiment = Uuid::new_v4();
        let project = Uuid::new_v4();
        let ds = svc
            .create_dataset("ds", Some(experiment), Some(project))
            .await
            .unwrap();
        let df = svc
            .create_datafile(NewDataFile {
                dataset_id: ds.id,
                filename: "a".into(),
                size: Some(1),
                md5sum: Some("x".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        svc.set_archive_offset(OffsetScope::Project, project, 30, Some(365))
            .await
            .unwrap();
        let policy = svc.enable_auto_archive(df.id, None, None).await.unwrap();
        assert_eq!(
            svc.effective_offsets(&policy).await.unwrap(),
            EffectiveOffsets {
                offset_days: Some(30),
                delete_offset_days: Some(365)
            }
        );

        svc.set_archive_offset(OffsetScope::Experiment, experiment, 7, None)
            .await
            .unwrap();
        assert_eq!(
            svc.effective_offsets(&policy).await.unwrap(),
            EffectiveOffsets {
                offset_days: Some(7),
                delete_offset_days: Some(365)
            }
        );

        let policy = svc.enable_auto_archive(df.id, Some(1), None).await.unwrap();
        assert_eq!(
            svc.effective_offsets(&policy).await.unwrap().offset_days,
            Some(1)
        );
    }

    #[tokio::test]
    async fn sweep_archives_then_expires() {
        let (svc, queue, dir) = service().await;
        let disk = local_box(&svc, "disk", "disk", &dir.path().join("disk")).await;
        let vault = local_box(&svc, "vault", "tape", &dir.path().join("vault")).await;
        svc.set_box_attribute(vault.id, ATTR_ARCHIVE, "true")
            .await
            .unwrap();

        let ds = svc.create_dataset("ds", None, None).await.unwrap();
        let df = svc
            .create_datafile(NewDataFile {
                dataset_id: ds.id,
                filename: "a.txt".into(),
                size: Some(8),
                md5sum: Some("930e419034038dfad994f0d2e602146c".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        let mut handle = svc.create_replica(df.id, &disk).await.unwrap();
        svc.write_replica(&mut handle, Box::pin(&b"123test\n"[..]))
            .await
            .unwrap();
        svc.verify_replica(&mut handle, true, true).await.unwrap();
        queue.drain();
        svc.enable_auto_archive(df.id, Some(10), Some(20))
            .await
            .unwrap();

        let now = Utc::now();
        assert_eq!(svc.run_due_auto_archives(now).await.unwrap(), SweepSummary::default());

        let later = now + Duration::days(11);
        let summary = svc.run_due_auto_archives(later).await.unwrap();
        assert_eq!(summary.pending, 1);
        queue.run_pending(&svc).await;

        let summary = svc.run_due_auto_archives(later).await.unwrap();
        assert_eq!(summary.archived, 1);
        let remaining = svc.replicas_for(df.id, false).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].storage_box.id, vault.id);

        let summary = svc
            .run_due_auto_archives(now + Duration::days(21))
            .await
            .unwrap();
        assert_eq!(summary.expired, 1);
        assert!(svc.find_datafile(df.id).await.unwrap().deleted);
        assert!(svc.replicas_for(df.id, false).await.unwrap().is_empty());
    }

    async fn disk_and_vault(
        svc: &StorageService,
        dir: &std::path::Path,
    ) -> (DataFile, ReplicaHandle, StorageBox) {
        let disk = local_box(svc, "disk", "disk", &dir.join("disk")).await;
        let vault = local_box(svc, "vault", "tape", &dir.join("vault")).await;
        svc.set_box_attribute(vault.id, ATTR_ARCHIVE, "true")
            .await
            .unwrap();
        let ds = svc.create_dataset("ds", None, None).await.unwrap();
        let df = svc
            .create_datafile(NewDataFile {
                dataset_id: ds.id,
                filename: "a.txt".into(),
                size: Some(8),
                md5sum: Some("930e419034038dfad994f0d2e602146c".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        let mut handle = svc.create_replica(df.id, &disk).await.unwrap();
        svc.write_replica(&mut handle, Box::pin(&b"123test\n"[..]))
            .await
            .unwrap();
        (df, handle, vault)
    }

    #[tokio::test]
    async fn lost_verification_is_queued_again() {
        let (svc, queue, dir) = service().await;
        let (df, mut handle, vault) = disk_and_vault(&svc, dir.path()).await;
        svc.verify_replica(&mut handle, true, true).await.unwrap();
        queue.drain();

        let ArchiveOutcome::Pending { created, missing } =
            svc.archive_datafile(df.id, true).await.unwrap()
        else {
            panic!("expected pending archive");
        };
        assert_eq!(created.len(), 1);
        assert_eq!(missing, 1);

        // the worker dies before verifying the new copy
        assert_eq!(queue.drain().len(), 1);

        assert_eq!(
            svc.archive_datafile(df.id, true).await.unwrap(),
            ArchiveOutcome::Pending {
                created: vec![],
                missing: 1
            }
        );
        assert_eq!(
            queue.jobs(),
            vec![(
                Job::VerifyReplica {
                    replica_id: created[0]
                },
                Priority::Normal
            )]
        );

        queue.run_pending(&svc).await;
        assert_eq!(
            svc.archive_datafile(df.id, true).await.unwrap(),
            ArchiveOutcome::Archived { pruned: 1 }
        );
        let remaining = svc.replicas_for(df.id, false).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].storage_box.id, vault.id);
    }

    #[tokio::test]
    async fn unverified_archive_copy_never_allows_pruning() {
        let (svc, queue, dir) = service().await;
        let (df, mut handle, vault) = disk_and_vault(&svc, dir.path()).await;
        svc.verify_replica(&mut handle, true, true).await.unwrap();
        let copy = svc
            .copy_replica(&handle, &vault, false)
            .await
            .unwrap()
            .into_replica();
        assert!(!copy.record.verified);
        queue.drain();

        let outcome = svc.archive_datafile(df.id, false).await.unwrap();
        assert_eq!(
            outcome,
            ArchiveOutcome::Pending {
                created: vec![],
                missing: 1
            }
        );
        assert_eq!(svc.replicas_for(df.id, false).await.unwrap().len(), 2);
        assert!(
            !svc.auto_archive_policy(df.id)
                .await
                .unwrap()
                .is_some_and(|p| p.archived)
        );
    }

    #[tokio::test]
    async fn unverified_source_is_not_copied() {
        let (svc, queue, dir) = service().await;
        let (df, _handle, vault) = disk_and_vault(&svc, dir.path()).await;
        queue.drain();

        assert_eq!(
            svc.archive_datafile(df.id, true).await.unwrap(),
            ArchiveOutcome::NoSourceReplica
        );
        assert_eq!(
            svc.archive_datafile(df.id, false).await.unwrap(),
            ArchiveOutcome::Pending {
                created: vec![],
                missing: 1
            }
        );
        assert!(svc.replica_in_box(df.id, vault.id).await.unwrap().is_none());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn expire_requires_archive() {
        let (svc, _queue, _dir) = service().await;
        let ds = svc.create_dataset("ds", None, None).await.unwrap();
        let df = svc
            .create_datafile(NewDataFile {
                dataset_id: ds.id,
                filename: "a".into(),
                size: Some(1),
                md5sum: Some("x".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        svc.enable_auto_archive(df.id, Some(0), Some(0)).await.unwrap();
        assert!(!svc.expire_datafile(df.id).await.unwrap());
        assert!(!svc.find_datafile(df.id).await.unwrap().deleted);
    }

    #[tokio::test]
    async fn nothing_to_do_without_archive_boxes() {
        let (svc, _queue, _dir) = service().await;
        let ds = svc.create_dataset("ds", None, None).await.unwrap();
        let df = svc
            .create_datafile(NewDataFile {
                dataset_id: ds.id,
                filename: "a".into(),
                size: Some(1),
                md5sum: Some("x".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(
            svc.archive_datafile(df.id, true).await.unwrap(),
            ArchiveOutcome::NoArchiveBoxes
        );
    }
}
