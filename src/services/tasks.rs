//! Background jobs.
//!
//! The core never runs verification, cache warming or recall inline; it
//! hands a [`Job`] to whatever [`TaskQueue`] the service was built with and
//! returns. [`execute_job`] is the single place jobs are carried out.

use serde::Serialize;
use std::{
    cmp::Ordering,
    collections::BinaryHeap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering},
    },
};
use tokio::{sync::Notify, task::JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Actor, StorageError, StorageResult, StorageService};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum Job {
    /// Re-derive `verified` for one replica.
    VerifyReplica { replica_id: Uuid },
    /// Make sure a DataFile kept on tape has a copy in the cache tier.
    EnsureCached { datafile_id: Uuid },
    /// Prompt the HSM to stage a replica back to disk and tell the requester.
    Recall { replica_id: Uuid, requester: Actor },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
}

pub trait TaskQueue: Send + Sync {
    /// Queue a job without waiting for it to run.
    fn enqueue(&self, job: Job, priority: Priority) -> StorageResult<()>;
}

/// Run one job against the service.
pub async fn execute_job(service: &StorageService, job: Job) -> StorageResult<()> {
    match job {
        Job::VerifyReplica { replica_id } => {
            let mut handle = service.replica(replica_id).await?;
            let report = service.verify_replica(&mut handle, true, true).await?;
            debug!(%replica_id, verified = report.verified, "verification job finished");
            Ok(())
        }
        Job::EnsureCached { datafile_id } => {
            if let Some(cached) = service.cache_datafile(datafile_id).await? {
                debug!(%datafile_id, replica_id = %cached.id(), "cache copy present");
            }
            Ok(())
        }
        Job::Recall {
            replica_id,
            requester,
        } => service.perform_recall(replica_id, &requester).await,
    }
}

struct Queued {
    priority: Priority,
    seq: u64,
    job: Job,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    // max-heap: higher priority first, then lower sequence number
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct PoolInner {
    heap: Mutex<BinaryHeap<Queued>>,
    notify: Notify,
    seq: AtomicU64,
    closed: AtomicBool,
}

impl PoolInner {
    fn pop(&self) -> Option<Job> {
        self.heap
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .map(|q| q.job)
    }
}

/// In-process queue served by a fixed set of tokio worker tasks.
///
/// Jobs run highest priority first and in submission order within a
/// priority.
#[derive(Clone, Default)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> usize {
        self.inner
            .heap
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Start `workers` tasks pulling jobs for `service`.
    pub fn spawn_workers(&self, service: StorageService, workers: usize) -> Vec<JoinHandle<()>> {
        (0..workers.max(1))
            .map(|worker| {
                let inner = Arc::clone(&self.inner);
                let service = service.clone();
                tokio::spawn(async move {
                    worker_loop(worker, inner, service).await;
                })
            })
            .collect()
    }

    /// Stop accepting jobs and let workers exit once the queue is empty.
    pub fn close(&self) {
        self.inner.closed.store(true, AtomicOrdering::SeqCst);
        self.inner.notify.notify_waiters();
    }
}

impl TaskQueue for WorkerPool {
    fn enqueue(&self, job: Job, priority: Priority) -> StorageResult<()> {
        if self.inner.closed.load(AtomicOrdering::SeqCst) {
            return Err(StorageError::QueueClosed);
        }
        let seq = self.inner.seq.fetch_add(1, AtomicOrdering::SeqCst);
        debug!(?job, ?priority, "queued job");
        self.inner
            .heap
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Queued { priority, seq, job });
        self.inner.notify.notify_one();
        Ok(())
    }
}

async fn worker_loop(worker: usize, inner: Arc<PoolInner>, service: StorageService) {
    debug!(worker, "worker started");
    loop {
        let notified = inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if let Some(job) = inner.pop() {
            let description = format!("{:?}", job);
            if let Err(err) = execute_job(&service, job).await {
                warn!(worker, job = %description, error = %err, "job failed");
            }
            continue;
        }
        if inner.closed.load(AtomicOrdering::SeqCst) {
            break;
        }
        notified.await;
    }
    info!(worker, "worker stopped");
}

/// Queue that only records jobs. The owner runs them explicitly.
#[derive(Default)]
pub struct ManualQueue {
    jobs: Mutex<Vec<(Job, Priority)>>,
}

impl ManualQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the queued jobs in submission order.
    pub fn jobs(&self) -> Vec<(Job, Priority)> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take every queued job, highest priority first.
    pub fn drain(&self) -> Vec<(Job, Priority)> {
        let mut jobs =
            std::mem::take(&mut *self.jobs.lock().unwrap_or_else(PoisonError::into_inner));
        // stable sort keeps submission order within a priority
        jobs.sort_by(|a, b| b.1.cmp(&a.1));
        jobs
    }

    /// Execute queued jobs, including any they queue in turn, until none
    /// are left. Returns how many ran; failures are logged.
    pub async fn run_pending(&self, service: &StorageService) -> usize {
        let mut ran = 0;
        loop {
            let batch = self.drain();
            if batch.is_empty() {
                return ran;
            }
            for (job, _) in batch {
                ran += 1;
                let description = format!("{:?}", job);
                if let Err(err) = execute_job(service, job).await {
                    warn!(job = %description, error = %err, "job failed");
                }
            }
        }
    }
}

impl TaskQueue for ManualQueue {
    fn enqueue(&self, job: Job, priority: Priority) -> StorageResult<()> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((job, priority));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verify(n: u128) -> Job {
        Job::VerifyReplica {
            replica_id: Uuid::from_u128(n),
        }
    }

    #[test]
    fn heap_orders_by_priority_then_fifo() {
        let pool = WorkerPool::new();
        pool.enqueue(verify(1), Priority::Low).unwrap();
        pool.enqueue(verify(2), Priority::Normal).unwrap();
        pool.enqueue(verify(3), Priority::High).unwrap();
        pool.enqueue(verify(4), Priority::Normal).unwrap();
        assert_eq!(pool.pending(), 4);

        let order: Vec<Job> = std::iter::from_fn(|| pool.inner.pop()).collect();
        assert_eq!(order, vec![verify(3), verify(2), verify(4), verify(1)]);
    }

    #[test]
    fn closed_pool_rejects_jobs() {
        let pool = WorkerPool::new();
        pool.close();
        assert!(matches!(
            pool.enqueue(verify(1), Priority::High),
            Err(StorageError::QueueClosed)
        ));
    }

    #[test]
    fn manual_queue_drains_in_priority_order() {
        let queue = ManualQueue::new();
        queue.enqueue(verify(1), Priority::Low).unwrap();
        queue.enqueue(verify(2), Priority::High).unwrap();
        queue.enqueue(verify(3), Priority::Low).unwrap();
        assert_eq!(queue.len(), 3);

        let drained: Vec<Job> = queue.drain().into_iter().map(|(job, _)| job).collect();
        assert_eq!(drained, vec![verify(2), verify(1), verify(3)]);
        assert!(queue.is_empty());
    }

    #[test]
    fn jobs_serialize_with_tag() {
        let json = serde_json::to_value(Job::EnsureCached {
            datafile_id: Uuid::nil(),
        })
        .unwrap();
        assert_eq!(json["job"], "ensure_cached");
    }

    #[tokio::test]
    async fn workers_run_queued_verification() {
        use crate::models::datafile::NewDataFile;
        use crate::test_support::{local_box, service};

        let (svc, _manual, dir) = service().await;
        let pool = WorkerPool::new();
        let svc = StorageService::new(
            svc.db.clone(),
            (*svc.settings).clone(),
            Arc::new(pool.clone()),
        );
        let disk = local_box(&svc, "disk", "disk", dir.path()).await;
        let dataset = svc.create_dataset("d", None, None).await.unwrap();
        let df = svc
            .create_datafile(NewDataFile {
                dataset_id: dataset.id,
                filename: "x.txt".into(),
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

        let workers = pool.spawn_workers(svc.clone(), 1);
        for _ in 0..200 {
            if svc.datafile_verified(df.id).await.unwrap() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(svc.datafile_verified(df.id).await.unwrap());

        pool.close();
        for worker in workers {
            worker.await.unwrap();
        }
    }
}
