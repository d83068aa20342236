//! The worker pool writing validated points to the row store.
//!
//! ```text
//!        submit / try_submit
//!                │
//!       max_concurrent_points
//!                │
//!      ┌─────────┼─────────┐
//!      ▼         ▼         ▼
//!   worker    worker    worker   ── RowPersister
//!      │         │         │
//!      └─────────┴─────────┴──────── MetaHandle::notify
//! ```
//!
//! The queue is shared by every worker, so a slow write only holds up the
//! worker executing it. [`Dispatcher::submit`] waits for a free slot, which is
//! how synchronous callers observe backpressure.
use std::{num::NonZeroUsize, sync::Arc};

use observability_deps::tracing::{error, info};
use thiserror::Error;
use tokio::{sync::oneshot, time::Instant};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tsdb_types::{Source, ValidatedPoint};

use crate::{
    meta::MetaHandle,
    metrics::IngestMetrics,
    persister::{PersistError, RowPersister, persist_point},
};

/// Receives the outcome of the row write of one [`WorkerJob`].
pub type Completion = oneshot::Receiver<Result<(), PersistError>>;

/// One point to write, and where it came from.
#[derive(Debug)]
pub struct WorkerJob {
    point: ValidatedPoint,
    source: Source,
    completion: Option<oneshot::Sender<Result<(), PersistError>>>,
}

impl WorkerJob {
    pub fn new(point: ValidatedPoint, source: Source) -> Self {
        Self {
            point,
            source,
            completion: None,
        }
    }

    /// A job whose caller waits for the row write.
    ///
    /// The completion resolves after the metadata notification was offered.
    pub fn with_completion(point: ValidatedPoint, source: Source) -> (Self, Completion) {
        let (tx, rx) = oneshot::channel();
        let job = Self {
            point,
            source,
            completion: Some(tx),
        };
        (job, rx)
    }

    pub fn point(&self) -> &ValidatedPoint {
        &self.point
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("ingest queue is shutting down")]
    ShuttingDown,
}

/// The job is handed back to the caller.
#[derive(Debug, Error)]
pub enum TrySubmitError {
    #[error("ingest queue is full")]
    Full(WorkerJob),

    #[error("ingest queue is shutting down")]
    ShuttingDown(WorkerJob),
}

impl TrySubmitError {
    pub fn into_job(self) -> WorkerJob {
        match self {
            Self::Full(job) | Self::ShuttingDown(job) => job,
        }
    }
}

#[derive(Debug)]
struct WorkerContext {
    persister: Arc<dyn RowPersister>,
    meta: MetaHandle,
    metrics: Arc<IngestMetrics>,
}

/// Handle to the worker pool.
#[derive(Debug)]
pub struct Dispatcher {
    tx: async_channel::Sender<WorkerJob>,
    cancel: CancellationToken,
    workers: TaskTracker,
}

impl Dispatcher {
    /// Start `n_workers` workers sharing a queue of `queue_depth` jobs.
    ///
    /// Workers stop once `cancel` fires and every queued job was processed.
    pub fn start(
        n_workers: NonZeroUsize,
        queue_depth: NonZeroUsize,
        persister: Arc<dyn RowPersister>,
        meta: MetaHandle,
        metrics: Arc<IngestMetrics>,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = async_channel::bounded(queue_depth.get());
        let ctx = Arc::new(WorkerContext {
            persister,
            meta,
            metrics,
        });

        let workers = TaskTracker::new();
        for worker_id in 0..n_workers.get() {
            workers.spawn(run_worker(
                worker_id,
                rx.clone(),
                Arc::clone(&ctx),
                cancel.clone(),
            ));
        }
        workers.close();

        info!(
            n_workers = n_workers.get(),
            queue_depth = queue_depth.get(),
            "started ingest workers"
        );

        Self {
            tx,
            cancel,
            workers,
        }
    }

    /// Enqueue `job`, waiting for a free slot if the queue is full.
    pub async fn submit(&self, job: WorkerJob) -> Result<(), SubmitError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SubmitError::ShuttingDown),
            res = self.tx.send(job) => res.map_err(|_| SubmitError::ShuttingDown),
        }
    }

    /// Enqueue `job` only if there is a free slot.
    pub fn try_submit(&self, job: WorkerJob) -> Result<(), TrySubmitError> {
        if self.cancel.is_cancelled() {
            return Err(TrySubmitError::ShuttingDown(job));
        }
        self.tx.try_send(job).map_err(|e| match e {
            async_channel::TrySendError::Full(job) => TrySubmitError::Full(job),
            async_channel::TrySendError::Closed(job) => TrySubmitError::ShuttingDown(job),
        })
    }

    /// Number of jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        self.tx.len()
    }

    pub fn capacity(&self) -> usize {
        self.tx.capacity().unwrap_or(usize::MAX)
    }

    /// Stop accepting jobs and wait for the workers to finish the queued ones.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.workers.wait().await;
        info!("ingest workers stopped");
    }
}

async fn run_worker(
    worker_id: usize,
    rx: async_channel::Receiver<WorkerJob>,
    ctx: Arc<WorkerContext>,
    cancel: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            biased;
            job = rx.recv() => match job {
                Ok(job) => job,
                // Closed and drained.
                Err(_) => break,
            },
            _ = cancel.cancelled() => {
                // Reject new jobs, keep draining the queued ones.
                rx.close();
                continue;
            }
        };

        process(&ctx, job).await;
    }

    info!(worker_id, "ingest worker stopped");
}

async fn process(ctx: &WorkerContext, job: WorkerJob) {
    let WorkerJob {
        point,
        source,
        completion,
    } = job;

    let started = Instant::now();
    let result = persist_point(ctx.persister.as_ref(), &point).await;
    match &result {
        Ok(()) => {
            ctx.metrics.point_written(&point, source, started.elapsed());
            ctx.meta.notify(point, source);
        }
        Err(e) => {
            error!(
                keyspace = %point.keyspace,
                keyset = %point.keyset,
                id = %point.id,
                metric = %point.metric(),
                timestamp = point.timestamp,
                %source,
                error = %e,
                "failed to write point"
            );
            ctx.metrics.point_write_failed(&point, source);
        }
    }

    if let Some(completion) = completion {
        // The caller may have gone away.
        let _ = completion.send(result);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use metric::{Attributes, Metric, Registry, U64Counter};
    use pretty_assertions::assert_eq;
    use tsdb_types::{PointKind, RawPoint};

    use super::*;
    use crate::{
        memory::{MemMetaIndex, MemRowStore, StoredValue},
        meta::{MetaConfig, MetaCoordinator},
        metrics::{POINTS_WRITE_FAILED_METRIC_NAME, POINTS_WRITTEN_METRIC_NAME},
        validator::series_id,
    };

    fn point(host: &str, keyspace: &str) -> ValidatedPoint {
        let raw = RawPoint::number("os.cpu", 2.5)
            .with_tag("ksid", "ks1")
            .with_tag("host", host);
        ValidatedPoint {
            keyset: "ks1".to_string(),
            keyspace: keyspace.to_string(),
            ttl: 90,
            timestamp: 1_700_000_000,
            id: series_id(&raw.metric, &raw.tags, PointKind::Number),
            kind: PointKind::Number,
            raw,
        }
    }

    struct TestPool {
        registry: Arc<Registry>,
        store: Arc<MemRowStore>,
        index: Arc<MemMetaIndex>,
        coordinator: MetaCoordinator,
        dispatcher: Dispatcher,
    }

    fn start(workers: usize, queue_depth: usize) -> TestPool {
        let registry = Arc::new(Registry::new());
        let metrics = Arc::new(IngestMetrics::new(&registry));
        let store = Arc::new(MemRowStore::new());
        let index = Arc::new(MemMetaIndex::new());
        let coordinator = MetaCoordinator::start(
            MetaConfig::default(),
            Arc::clone(&index) as _,
            Arc::clone(&metrics),
            CancellationToken::new(),
        );
        let dispatcher = Dispatcher::start(
            NonZeroUsize::new(workers).unwrap(),
            NonZeroUsize::new(queue_depth).unwrap(),
            Arc::clone(&store) as _,
            coordinator.handle(),
            metrics,
            CancellationToken::new(),
        );
        TestPool {
            registry,
            store,
            index,
            coordinator,
            dispatcher,
        }
    }

    fn written(registry: &Registry, name: &'static str) -> u64 {
        let mut attributes = Attributes::from(&[("type", "number"), ("source", "http")]);
        attributes.insert("keyspace", "ninety_day_ks");
        attributes.insert("ttl", "90");
        registry
            .get_instrument::<Metric<U64Counter>>(name)
            .unwrap()
            .get_observer(&attributes)
            .map(|c| c.fetch())
            .unwrap_or_default()
    }

    #[test_log::test(tokio::test)]
    async fn writes_row_and_notifies() {
        let pool = start(2, 10);

        let (job, done) = WorkerJob::with_completion(point("h1", "ninety_day_ks"), Source::Http);
        pool.dispatcher.submit(job).await.unwrap();
        done.await.unwrap().unwrap();

        let rows = pool.store.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].keyspace, "ninety_day_ks");
        assert_eq!(rows[0].timestamp, 1_700_000_000);
        assert_eq!(rows[0].value, StoredValue::Number(2.5));
        assert_eq!(written(&pool.registry, POINTS_WRITTEN_METRIC_NAME), 1);

        pool.dispatcher.shutdown().await;
        pool.coordinator.shutdown().await;
        assert_eq!(pool.index.indexed_count("ks1"), 1);
    }

    #[test_log::test(tokio::test)]
    async fn failed_write_is_reported_and_not_indexed() {
        let pool = start(1, 10);
        pool.store.fail_keyspace("ninety_day_ks");

        let (job, done) = WorkerJob::with_completion(point("h1", "ninety_day_ks"), Source::Http);
        pool.dispatcher.submit(job).await.unwrap();
        let err = done.await.unwrap().unwrap_err();
        assert!(matches!(err, PersistError::Storage { .. }), "{err}");
        assert_eq!(written(&pool.registry, POINTS_WRITE_FAILED_METRIC_NAME), 1);

        pool.dispatcher.shutdown().await;
        pool.coordinator.shutdown().await;
        assert_eq!(pool.index.bulk_count(), 0);
        assert!(pool.store.rows().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn try_submit_rejects_when_full() {
        let pool = start(1, 2);
        pool.store.hold_writes();

        // The first job is taken by the worker, the next two fill the queue.
        pool.dispatcher
            .try_submit(WorkerJob::new(point("h0", "ninety_day_ks"), Source::Udp))
            .unwrap();
        pool.store.wait_for_blocked_writes(1).await;
        for host in ["h1", "h2"] {
            pool.dispatcher
                .try_submit(WorkerJob::new(point(host, "ninety_day_ks"), Source::Udp))
                .unwrap();
        }
        assert_eq!(pool.dispatcher.queued(), 2);
        assert_eq!(pool.dispatcher.capacity(), 2);

        let err = pool
            .dispatcher
            .try_submit(WorkerJob::new(point("h3", "ninety_day_ks"), Source::Udp))
            .unwrap_err();
        assert!(matches!(err, TrySubmitError::Full(_)));
        assert_eq!(err.into_job().point().raw.tags["host"], "h3");

        pool.store.release_writes();
        pool.dispatcher.shutdown().await;
        assert_eq!(pool.store.rows().len(), 3);
        pool.coordinator.shutdown().await;
    }

    #[test_log::test(tokio::test)]
    async fn submit_waits_for_free_slot() {
        let pool = start(1, 1);
        pool.store.hold_writes();

        pool.dispatcher
            .submit(WorkerJob::new(point("h0", "ninety_day_ks"), Source::Http))
            .await
            .unwrap();
        pool.store.wait_for_blocked_writes(1).await;
        pool.dispatcher
            .submit(WorkerJob::new(point("h1", "ninety_day_ks"), Source::Http))
            .await
            .unwrap();

        let blocked = pool
            .dispatcher
            .submit(WorkerJob::new(point("h2", "ninety_day_ks"), Source::Http));
        tokio::pin!(blocked);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), &mut blocked)
                .await
                .is_err(),
            "submit must wait while the queue is full"
        );

        pool.store.release_writes();
        blocked.await.unwrap();

        pool.dispatcher.shutdown().await;
        assert_eq!(pool.store.rows().len(), 3);
        pool.coordinator.shutdown().await;
    }

    #[test_log::test(tokio::test)]
    async fn shutdown_drains_queue_and_rejects_new_jobs() {
        let pool = start(2, 100);
        pool.store.hold_writes();

        for i in 0..50 {
            pool.dispatcher
                .try_submit(WorkerJob::new(
                    point(&format!("h{i}"), "ninety_day_ks"),
                    Source::Telnet,
                ))
                .unwrap();
        }

        let shutdown = pool.dispatcher.shutdown();
        tokio::pin!(shutdown);
        assert!(
            tokio::time::timeout(Duration::from_millis(20), &mut shutdown)
                .await
                .is_err()
        );

        let err = pool
            .dispatcher
            .try_submit(WorkerJob::new(point("late", "ninety_day_ks"), Source::Telnet))
            .unwrap_err();
        assert!(matches!(err, TrySubmitError::ShuttingDown(_)));
        assert!(matches!(
            pool.dispatcher
                .submit(WorkerJob::new(point("late", "ninety_day_ks"), Source::Http))
                .await,
            Err(SubmitError::ShuttingDown)
        ));

        pool.store.release_writes();
        shutdown.await;
        assert_eq!(pool.store.rows().len(), 50);

        pool.coordinator.shutdown().await;
        assert_eq!(pool.index.indexed_count("ks1"), 50);
    }
}
