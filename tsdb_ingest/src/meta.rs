//! The metadata coordinator.
//!
//! Workers hand every successfully written point to the coordinator through a
//! bounded channel. A single task owns the pending documents: it drops series
//! that are already indexed or already pending, accumulates the rest per
//! keyset, and hands snapshots of the accumulator to bulk save tasks on a
//! timer or when the accumulator grows past the configured bulk size.
//!
//! ```text
//!    worker ─┐
//!    worker ─┼── try_send ──► [ channel ] ──► Reactor ──► save task ─► MetadataIndex
//!    worker ─┘    (lossy)                   (owns the      (bounded by
//!                                            accumulator)   semaphore)
//! ```
//!
//! Indexing is best effort. A notification that finds the channel full is
//! counted and discarded; the row is already written.
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    num::NonZeroUsize,
    sync::Arc,
    time::Duration,
};

use observability_deps::tracing::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore, mpsc, mpsc::error::TrySendError},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tsdb_types::{MetadataDocument, Source, ValidatedPoint};

use crate::{
    index::MetadataIndex,
    metrics::{FlushTrigger, IngestMetrics},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaConfig {
    /// Period of the interval flush. Must not be zero.
    pub save_interval: Duration,
    /// A flush starts as soon as more documents than this are pending.
    pub max_bulk_size: NonZeroUsize,
    /// Maximum number of bulk saves in flight.
    pub max_concurrent_bulks: NonZeroUsize,
    /// Capacity of the notification channel.
    pub channel_size: NonZeroUsize,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            save_interval: Duration::from_secs(1),
            max_bulk_size: NonZeroUsize::new(5000).expect("non-zero"),
            max_concurrent_bulks: NonZeroUsize::MIN,
            channel_size: NonZeroUsize::new(10_000).expect("non-zero"),
        }
    }
}

/// Sending half of the notification channel, held by the workers.
#[derive(Debug, Clone)]
pub struct MetaHandle {
    tx: mpsc::Sender<ValidatedPoint>,
    metrics: Arc<IngestMetrics>,
}

impl MetaHandle {
    /// Offer a written point for indexing without waiting.
    ///
    /// Returns false, and counts the point as lost, if the channel is full or
    /// the coordinator stopped.
    pub fn notify(&self, point: ValidatedPoint, source: Source) -> bool {
        match self.tx.try_send(point) {
            Ok(()) => true,
            Err(TrySendError::Full(point) | TrySendError::Closed(point)) => {
                debug!(
                    keyset = %point.keyset,
                    id = %point.id,
                    %source,
                    "metadata queue full, series not indexed"
                );
                self.metrics.meta_lost(point.kind, source);
                false
            }
        }
    }
}

/// Owner of the coordinator task.
#[derive(Debug)]
pub struct MetaCoordinator {
    handle: MetaHandle,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MetaCoordinator {
    /// Start the coordinator task. It runs until `cancel` fires and
    /// [`shutdown`](Self::shutdown) is awaited.
    pub fn start(
        config: MetaConfig,
        index: Arc<dyn MetadataIndex>,
        metrics: Arc<IngestMetrics>,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.channel_size.get());

        info!(
            save_interval = ?config.save_interval,
            max_bulk_size = config.max_bulk_size.get(),
            max_concurrent_bulks = config.max_concurrent_bulks.get(),
            channel_size = config.channel_size.get(),
            "started metadata coordinator"
        );

        let reactor = Reactor {
            rx,
            index,
            metrics: Arc::clone(&metrics),
            config,
            accumulator: Accumulator::default(),
            limiter: Arc::new(Semaphore::new(config.max_concurrent_bulks.get())),
            flushes: TaskTracker::new(),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(reactor.run());

        Self {
            handle: MetaHandle { tx, metrics },
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn handle(&self) -> MetaHandle {
        self.handle.clone()
    }

    /// Stop the coordinator.
    ///
    /// Notifications already queued are processed, everything pending is
    /// flushed, and the call returns once every bulk save finished.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "metadata coordinator task failed");
            }
        }
    }
}

/// Documents waiting for the next flush, grouped by keyset.
#[derive(Debug, Default)]
struct Accumulator {
    documents: BTreeMap<String, Vec<MetadataDocument>>,
    /// Series ids of `documents`, per keyset.
    pending: HashMap<String, HashSet<String>>,
    len: usize,
}

impl Accumulator {
    fn contains(&self, point: &ValidatedPoint) -> bool {
        self.pending
            .get(&point.keyset)
            .is_some_and(|ids| ids.contains(&point.id))
    }

    fn push(&mut self, point: &ValidatedPoint) {
        let inserted = self
            .pending
            .entry(point.keyset.clone())
            .or_default()
            .insert(point.id.clone());
        if !inserted {
            return;
        }
        self.documents
            .entry(point.keyset.clone())
            .or_default()
            .push(MetadataDocument::from(point));
        self.len += 1;
    }

    fn len(&self) -> usize {
        self.len
    }

    fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn take(&mut self) -> BTreeMap<String, Vec<MetadataDocument>> {
        self.pending.clear();
        self.len = 0;
        std::mem::take(&mut self.documents)
    }
}

#[derive(Debug)]
struct Reactor {
    rx: mpsc::Receiver<ValidatedPoint>,
    index: Arc<dyn MetadataIndex>,
    metrics: Arc<IngestMetrics>,
    config: MetaConfig,
    accumulator: Accumulator,
    limiter: Arc<Semaphore>,
    flushes: TaskTracker,
    cancel: CancellationToken,
}

impl Reactor {
    async fn run(mut self) {
        let period = self.config.save_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => self.flush(FlushTrigger::Interval).await,
                point = self.rx.recv() => match point {
                    Some(point) => self.observe(point).await,
                    None => break,
                },
            }
        }

        self.rx.close();
        let mut drained = 0_usize;
        while let Some(point) = self.rx.recv().await {
            self.observe(point).await;
            drained += 1;
        }
        self.flush(FlushTrigger::Shutdown).await;

        self.flushes.close();
        self.flushes.wait().await;
        info!(drained, "metadata coordinator stopped");
    }

    async fn observe(&mut self, point: ValidatedPoint) {
        let meta_type = point.meta_type();
        if self.accumulator.contains(&point) {
            self.metrics.meta_known(&point.keyset, meta_type);
            return;
        }

        match self
            .index
            .check_metadata(&point.keyset, meta_type, &point.id)
            .await
        {
            Ok(true) => {
                self.metrics.meta_known(&point.keyset, meta_type);
                return;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(
                    keyset = %point.keyset,
                    id = %point.id,
                    %meta_type,
                    error = %e,
                    "metadata check failed, indexing series anyway"
                );
                self.metrics.meta_check_failed(&point.keyset, meta_type);
            }
        }

        self.accumulator.push(&point);
        self.metrics.meta_pending(&point.keyset, meta_type);

        if self.accumulator.len() > self.config.max_bulk_size.get() {
            self.flush(FlushTrigger::Size).await;
        }
    }

    /// Hand the accumulator to a bulk save task.
    ///
    /// Waits for a limiter permit before taking the snapshot. While every
    /// permit is held the reactor stops reading notifications, so the channel
    /// fills up and further series are counted as lost instead of queueing
    /// snapshots.
    async fn flush(&mut self, trigger: FlushTrigger) {
        if self.accumulator.is_empty() {
            return;
        }

        if self.limiter.available_permits() == 0 {
            debug!(
                documents = self.accumulator.len(),
                trigger = trigger.as_str(),
                "bulk saves saturated, waiting for a slot"
            );
        }
        let Ok(permit) = Arc::clone(&self.limiter).acquire_owned().await else {
            error!("bulk save limiter closed, metadata kept pending");
            return;
        };

        let documents = self.accumulator.len();
        let snapshot = self.accumulator.take();
        debug!(
            documents,
            keysets = snapshot.len(),
            trigger = trigger.as_str(),
            "flushing metadata"
        );
        self.metrics.meta_flushed(trigger);

        self.flushes.spawn(save_snapshot(
            permit,
            Arc::clone(&self.index),
            Arc::clone(&self.metrics),
            snapshot,
        ));
    }
}

/// Write every keyset of `snapshot` to the index. The limiter slot is released
/// when the last keyset was saved.
async fn save_snapshot(
    _permit: OwnedSemaphorePermit,
    index: Arc<dyn MetadataIndex>,
    metrics: Arc<IngestMetrics>,
    snapshot: BTreeMap<String, Vec<MetadataDocument>>,
) {
    for (keyset, documents) in snapshot {
        let n = documents.len();
        let started = Instant::now();
        match index.add_documents(&keyset, documents).await {
            Ok(()) => {
                debug!(%keyset, documents = n, "saved metadata bulk");
                metrics.meta_bulk_saved(&keyset, n, started.elapsed());
            }
            Err(e) => {
                error!(%keyset, documents = n, error = %e, "failed to save metadata bulk");
                metrics.meta_bulk_failed(&keyset, n, started.elapsed());
            }
        }
    }
}
