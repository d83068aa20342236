//! Entry points of the transports into the ingestion pipeline.
use std::sync::Arc;

use iox_time::TimeProvider;
use metric::Registry;
use observability_deps::tracing::{debug, info, warn};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tsdb_shutdown::ShutdownToken;
use tsdb_types::{
    FailureKind, PointFailure, PointKind, RawPoint, Source, ValidatedPoint, WriteResponse,
};

use crate::{
    config::PipelineConfig,
    dispatcher::{Dispatcher, SubmitError, TrySubmitError, WorkerJob},
    index::{KeysetCatalog, MetadataIndex},
    meta::MetaCoordinator,
    metrics::IngestMetrics,
    persister::RowPersister,
    telnet::{TelnetDialect, TelnetError},
    validator::{PointValidator, ValidationError},
};

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("invalid JSON body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("request contains no points")]
    Empty,

    #[error("{} of {} points failed", .0.failed, .0.failed + .0.success)]
    Rejected(WriteResponse),

    #[error("point {index} aborted the write: {source}")]
    Aborted {
        index: usize,
        source: ValidationError,
    },

    #[error("invalid point: {0}")]
    Invalid(#[source] ValidationError),

    #[error(transparent)]
    Telnet(#[from] TelnetError),

    #[error("ingest queue is full, point dropped")]
    Dropped,

    #[error("ingest pipeline is shutting down")]
    ShuttingDown,
}

impl WriteError {
    /// True if the request itself is at fault (HTTP 400 rather than 500).
    pub fn is_client_error(&self) -> bool {
        match self {
            Self::Decode(_)
            | Self::Empty
            | Self::Aborted { .. }
            | Self::Invalid(_)
            | Self::Telnet(_) => true,
            Self::Rejected(response) => response.has_invalid_points(),
            Self::Dropped | Self::ShuttingDown => false,
        }
    }
}

impl From<SubmitError> for WriteError {
    fn from(e: SubmitError) -> Self {
        match e {
            SubmitError::ShuttingDown => Self::ShuttingDown,
        }
    }
}

pub type Result<T, E = WriteError> = std::result::Result<T, E>;

/// The external services the pipeline reads from and writes to.
#[derive(Debug, Clone)]
pub struct Collaborators {
    pub keysets: Arc<dyn KeysetCatalog>,
    pub persister: Arc<dyn RowPersister>,
    pub index: Arc<dyn MetadataIndex>,
}

/// Validator, worker pool and metadata coordinator wired together.
#[derive(Debug)]
pub struct IngestPipeline {
    validator: PointValidator,
    dispatcher: Dispatcher,
    coordinator: MetaCoordinator,
    metrics: Arc<IngestMetrics>,
}

impl IngestPipeline {
    /// Start the workers and the metadata coordinator.
    pub fn new(
        config: PipelineConfig,
        collaborators: Collaborators,
        metric_registry: &Arc<Registry>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        let metrics = Arc::new(IngestMetrics::new(metric_registry));
        let Collaborators {
            keysets,
            persister,
            index,
        } = collaborators;

        let coordinator = MetaCoordinator::start(
            config.meta,
            index,
            Arc::clone(&metrics),
            CancellationToken::new(),
        );
        let dispatcher = Dispatcher::start(
            config.workers,
            config.max_concurrent_points,
            persister,
            coordinator.handle(),
            Arc::clone(&metrics),
            CancellationToken::new(),
        );
        let validator = PointValidator::new(
            config.rules,
            Arc::new(config.keyspaces),
            keysets,
            time_provider,
        );

        Self {
            validator,
            dispatcher,
            coordinator,
            metrics,
        }
    }

    /// Decode a JSON point or array of points and write them.
    ///
    /// Every point is validated before any is submitted, so a systemic
    /// validation error means nothing of the request was written. Synchronous
    /// sources wait for every row write and get per point storage errors. If
    /// shutdown starts halfway through, points that were queued are still
    /// written and the rest are reported as dropped.
    /// Other sources never wait: points that find the queue full are dropped.
    ///
    /// Returns the number of accepted points.
    pub async fn handle_bytes(
        &self,
        data: &[u8],
        source: Source,
        kind: PointKind,
    ) -> Result<usize> {
        let raws = decode_points(data)?;
        if raws.is_empty() {
            return Err(WriteError::Empty);
        }

        let mut failures = Vec::new();
        let mut valid = Vec::with_capacity(raws.len());
        for (index, raw) in raws.iter().enumerate() {
            match self.validator.validate(raw, kind).await {
                Ok(point) => valid.push((index, point)),
                Err(e) => {
                    self.metrics.point_invalid(kind, source, &e);
                    if e.is_systemic() {
                        warn!(index, %source, error = %e, "aborting write");
                        return Err(WriteError::Aborted { index, source: e });
                    }
                    if source.is_synchronous() {
                        debug!(index, %source, error = %e, "rejected point");
                    } else {
                        warn!(index, %source, metric = %raw.metric, error = %e, "rejected point");
                    }
                    failures.push(failure(index, raw, FailureKind::Invalid, &e));
                }
            }
        }

        let accepted = if source.is_synchronous() {
            self.write_and_wait(valid, &raws, source, &mut failures)
                .await?
        } else {
            self.write_without_waiting(valid, &raws, source, kind, &mut failures)?
        };

        if failures.is_empty() {
            Ok(accepted)
        } else {
            failures.sort_unstable_by_key(|f| f.index);
            Err(WriteError::Rejected(WriteResponse::new(accepted, failures)))
        }
    }

    async fn write_and_wait(
        &self,
        valid: Vec<(usize, ValidatedPoint)>,
        raws: &[RawPoint],
        source: Source,
        failures: &mut Vec<PointFailure>,
    ) -> Result<usize> {
        let mut completions = Vec::with_capacity(valid.len());
        let mut pending = valid.into_iter();
        let mut refused = None;
        for (index, point) in pending.by_ref() {
            let (job, done) = WorkerJob::with_completion(point, source);
            if let Err(e) = self.dispatcher.submit(job).await {
                refused = Some((index, e));
                break;
            }
            completions.push((index, done));
        }

        // Points already queued are still written, so their outcome is
        // reported along with the points the shutdown refused.
        if let Some((first, e)) = refused {
            if completions.is_empty() {
                return Err(e.into());
            }
            warn!(%source, queued = completions.len(), error = %e, "write interrupted");
            let rest = std::iter::once(first).chain(pending.map(|(index, _)| index));
            for index in rest {
                failures.push(failure(index, &raws[index], FailureKind::Dropped, e));
            }
        }

        let mut accepted = 0;
        for (index, done) in completions {
            match done.await {
                Ok(Ok(())) => accepted += 1,
                Ok(Err(e)) => {
                    failures.push(failure(index, &raws[index], FailureKind::Storage, e));
                }
                Err(_) => failures.push(failure(
                    index,
                    &raws[index],
                    FailureKind::Storage,
                    "point was not written",
                )),
            }
        }
        Ok(accepted)
    }

    fn write_without_waiting(
        &self,
        valid: Vec<(usize, ValidatedPoint)>,
        raws: &[RawPoint],
        source: Source,
        kind: PointKind,
        failures: &mut Vec<PointFailure>,
    ) -> Result<usize> {
        let mut accepted = 0;
        for (index, point) in valid {
            match self.dispatcher.try_submit(WorkerJob::new(point, source)) {
                Ok(()) => accepted += 1,
                Err(TrySubmitError::Full(job)) => {
                    warn!(
                        index,
                        %source,
                        id = %job.point().id,
                        "ingest queue full, dropping point"
                    );
                    self.metrics.point_dropped(kind, source);
                    failures.push(failure(
                        index,
                        &raws[index],
                        FailureKind::Dropped,
                        "ingest queue is full",
                    ));
                }
                Err(TrySubmitError::ShuttingDown(_)) => return Err(WriteError::ShuttingDown),
            }
        }
        Ok(accepted)
    }

    /// A UDP datagram: one JSON number point, or an array of them. Nobody
    /// waits for the write.
    pub async fn handle_datagram(&self, data: &[u8]) -> Result<usize> {
        self.handle_bytes(data, Source::Udp, PointKind::Number)
            .await
    }

    /// One telnet line. Returns false for blank lines.
    pub async fn handle_telnet_line(&self, line: &str, dialect: TelnetDialect) -> Result<bool> {
        let source = dialect.source();
        let raw = match dialect.parse_line(line) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Ok(false),
            Err(e) => {
                warn!(%source, error = %e, "malformed line");
                return Err(e.into());
            }
        };

        let point = match self.validator.validate(&raw, PointKind::Number).await {
            Ok(point) => point,
            Err(e) => {
                self.metrics.point_invalid(PointKind::Number, source, &e);
                warn!(%source, metric = %raw.metric, error = %e, "rejected point");
                return Err(WriteError::Invalid(e));
            }
        };

        match self.try_submit(point, source) {
            Ok(()) => Ok(true),
            Err(TrySubmitError::Full(job)) => {
                warn!(%source, id = %job.point().id, "ingest queue full, dropping point");
                self.metrics.point_dropped(PointKind::Number, source);
                Err(WriteError::Dropped)
            }
            Err(TrySubmitError::ShuttingDown(_)) => Err(WriteError::ShuttingDown),
        }
    }

    /// Validate a point without writing it.
    pub async fn validate(
        &self,
        raw: &RawPoint,
        kind: PointKind,
    ) -> Result<ValidatedPoint, ValidationError> {
        self.validator.validate(raw, kind).await
    }

    /// Queue a validated point, waiting for a free slot.
    pub async fn submit(&self, point: ValidatedPoint, source: Source) -> Result<(), SubmitError> {
        self.dispatcher.submit(WorkerJob::new(point, source)).await
    }

    /// Queue a validated point if there is a free slot.
    pub fn try_submit(&self, point: ValidatedPoint, source: Source) -> Result<(), TrySubmitError> {
        self.dispatcher.try_submit(WorkerJob::new(point, source))
    }

    /// Stop accepting points, write everything queued, then flush the pending
    /// metadata and wait for the bulk saves.
    pub async fn shutdown(&self) {
        info!("shutting down ingest pipeline");
        self.dispatcher.shutdown().await;
        self.coordinator.shutdown().await;
        info!("ingest pipeline stopped");
    }

    /// Run until `token` is cancelled, then drain and report completion.
    pub async fn run_until_shutdown(&self, token: ShutdownToken) {
        token.wait_for_shutdown().await;
        self.shutdown().await;
        token.complete();
    }
}

fn decode_points(data: &[u8]) -> Result<Vec<RawPoint>> {
    let is_array = data
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|b| *b == b'[');
    if is_array {
        Ok(serde_json::from_slice(data)?)
    } else {
        Ok(vec![serde_json::from_slice(data)?])
    }
}

fn failure(
    index: usize,
    raw: &RawPoint,
    kind: FailureKind,
    error: impl std::fmt::Display,
) -> PointFailure {
    PointFailure {
        index,
        point: raw.clone(),
        kind,
        error_message: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_object_or_array() {
        assert_eq!(decode_points(br#"{"metric":"a"}"#).unwrap().len(), 1);
        assert_eq!(
            decode_points(b" \n[{\"metric\":\"a\"},{\"metric\":\"b\"}]")
                .unwrap()
                .len(),
            2
        );
        assert!(decode_points(b"[]").unwrap().is_empty());
        assert!(decode_points(b"\"a\"").is_err());
        assert!(decode_points(b"").is_err());
    }

    #[test]
    fn client_errors() {
        assert!(WriteError::Empty.is_client_error());
        assert!(
            WriteError::Aborted {
                index: 0,
                source: ValidationError::UnknownKeyset("ks".into())
            }
            .is_client_error()
        );
        assert!(!WriteError::ShuttingDown.is_client_error());

        let storage_only = WriteResponse::new(
            0,
            vec![failure(
                0,
                &RawPoint::default(),
                FailureKind::Storage,
                "down",
            )],
        );
        assert!(!WriteError::Rejected(storage_only).is_client_error());
    }
}
