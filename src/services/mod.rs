//! The storage core: StorageBox registry, replica and DataFile management,
//! HSM residency checks, auto-archive policy and background jobs.
//!
//! All operations hang off [`StorageService`], split by concern across the
//! submodules. Metadata lives in SQLite; bytes live in whatever backend each
//! StorageBox names.

use sqlx::SqlitePool;
use std::sync::Arc;

use crate::config::StorageSettings;

pub mod access;
pub mod auto_archive;
pub mod checksum;
pub mod datafiles;
pub mod error;
pub mod hsm;
pub mod notify;
pub mod replicas;
pub mod storage_boxes;
pub mod tasks;

pub use access::{Action, Actor, AllowAll, AllowList, Authorizer, Target};
pub use error::{StorageError, StorageResult};
pub use notify::{LogNotifier, Notifier};
pub use replicas::{CopyOutcome, MoveOutcome, ReplicaHandle, VerificationReport};
pub use tasks::{Job, ManualQueue, Priority, TaskQueue, WorkerPool};

/// Shared handle to the storage core.
///
/// Cloning is cheap; every clone talks to the same pool, queue and settings.
/// Replica handles obtained from it are per-caller and must not be shared
/// between workers.
#[derive(Clone)]
pub struct StorageService {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    pub settings: Arc<StorageSettings>,

    queue: Arc<dyn TaskQueue>,
    notifier: Arc<dyn Notifier>,
    authorizer: Arc<dyn Authorizer>,
}

impl StorageService {
    /// Build the service with a log-only notifier and an authorizer that
    /// denies every actor until one is configured.
    pub fn new(
        db: Arc<SqlitePool>,
        settings: StorageSettings,
        queue: Arc<dyn TaskQueue>,
    ) -> Self {
        Self {
            db,
            settings: Arc::new(settings),
            queue,
            notifier: Arc::new(LogNotifier),
            authorizer: Arc::new(AllowList::default()),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub(crate) fn notifier(&self) -> &dyn Notifier {
        self.notifier.as_ref()
    }

    /// Hand a job to the queue without waiting for it.
    ///
    /// A failure to enqueue is logged, not returned: callers have already
    /// completed their own work and the job can be re-requested.
    pub(crate) fn dispatch(&self, job: Job, priority: Priority) {
        if let Err(err) = self.queue.enqueue(job.clone(), priority) {
            tracing::error!(?job, error = %err, "failed to enqueue job");
        }
    }
}
