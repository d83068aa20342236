//! Counters and timers emitted by the pipeline.
//!
//! Point level instruments are tagged by keyspace, series type, source and
//! TTL. Metadata instruments are tagged by keyset.
use std::{borrow::Cow, sync::Arc, time::Duration};

use metric::{Attributes, DurationHistogram, Metric, Registry, U64Counter};
use tsdb_types::{MetaType, PointKind, Source, ValidatedPoint};

use crate::validator::ValidationError;

pub const POINTS_WRITTEN_METRIC_NAME: &str = "tsdb_points_written";
pub const POINTS_WRITE_FAILED_METRIC_NAME: &str = "tsdb_points_write_failed";
pub const POINT_WRITE_DURATION_METRIC_NAME: &str = "tsdb_point_write_duration";
pub const POINTS_INVALID_METRIC_NAME: &str = "tsdb_points_invalid";
pub const POINTS_DROPPED_METRIC_NAME: &str = "tsdb_points_dropped";
pub const META_LOST_METRIC_NAME: &str = "tsdb_meta_lost";
pub const META_KNOWN_METRIC_NAME: &str = "tsdb_meta_known";
pub const META_CHECK_FAILED_METRIC_NAME: &str = "tsdb_meta_check_failed";
pub const META_PENDING_METRIC_NAME: &str = "tsdb_meta_pending";
pub const META_FLUSHES_METRIC_NAME: &str = "tsdb_meta_flushes";
pub const META_BULK_SAVED_METRIC_NAME: &str = "tsdb_meta_bulk_saved";
pub const META_BULK_FAILED_METRIC_NAME: &str = "tsdb_meta_bulk_failed";
pub const META_BULK_DURATION_METRIC_NAME: &str = "tsdb_meta_bulk_duration";

/// What started a metadata flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Interval,
    Size,
    Shutdown,
}

impl FlushTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interval => "interval",
            Self::Size => "size",
            Self::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug)]
pub struct IngestMetrics {
    points_written: Metric<U64Counter>,
    points_write_failed: Metric<U64Counter>,
    point_write_duration: Metric<DurationHistogram>,
    points_invalid: Metric<U64Counter>,
    points_dropped: Metric<U64Counter>,
    meta_lost: Metric<U64Counter>,
    meta_known: Metric<U64Counter>,
    meta_check_failed: Metric<U64Counter>,
    meta_pending: Metric<U64Counter>,
    meta_flushes: Metric<U64Counter>,
    meta_bulk_saved: Metric<U64Counter>,
    meta_bulk_failed: Metric<U64Counter>,
    meta_bulk_duration: Metric<DurationHistogram>,
}

impl IngestMetrics {
    pub fn new(metric_registry: &Arc<Registry>) -> Self {
        Self {
            points_written: metric_registry.register_metric(
                POINTS_WRITTEN_METRIC_NAME,
                "points written to the row store",
            ),
            points_write_failed: metric_registry.register_metric(
                POINTS_WRITE_FAILED_METRIC_NAME,
                "points the row store failed to write",
            ),
            point_write_duration: metric_registry.register_metric(
                POINT_WRITE_DURATION_METRIC_NAME,
                "time spent writing a single point to the row store",
            ),
            points_invalid: metric_registry.register_metric(
                POINTS_INVALID_METRIC_NAME,
                "points rejected by validation",
            ),
            points_dropped: metric_registry.register_metric(
                POINTS_DROPPED_METRIC_NAME,
                "points from asynchronous sources dropped because the ingest queue was full",
            ),
            meta_lost: metric_registry.register_metric(
                META_LOST_METRIC_NAME,
                "written points whose metadata was not indexed because the metadata queue was full",
            ),
            meta_known: metric_registry.register_metric(
                META_KNOWN_METRIC_NAME,
                "points whose series was already indexed or pending",
            ),
            meta_check_failed: metric_registry.register_metric(
                META_CHECK_FAILED_METRIC_NAME,
                "metadata existence checks that failed",
            ),
            meta_pending: metric_registry.register_metric(
                META_PENDING_METRIC_NAME,
                "metadata documents added to the pending bulk",
            ),
            meta_flushes: metric_registry.register_metric(
                META_FLUSHES_METRIC_NAME,
                "pending metadata snapshots handed to a bulk save",
            ),
            meta_bulk_saved: metric_registry.register_metric(
                META_BULK_SAVED_METRIC_NAME,
                "metadata documents written to the search index",
            ),
            meta_bulk_failed: metric_registry.register_metric(
                META_BULK_FAILED_METRIC_NAME,
                "metadata documents the search index failed to write",
            ),
            meta_bulk_duration: metric_registry.register_metric(
                META_BULK_DURATION_METRIC_NAME,
                "duration of a bulk save of one keyset",
            ),
        }
    }

    pub(crate) fn point_written(&self, point: &ValidatedPoint, source: Source, elapsed: Duration) {
        let attributes = point_attributes(point, source);
        self.point_write_duration
            .recorder(attributes.clone())
            .record(elapsed);
        self.points_written.recorder(attributes).inc(1);
    }

    pub(crate) fn point_write_failed(&self, point: &ValidatedPoint, source: Source) {
        self.points_write_failed
            .recorder(point_attributes(point, source))
            .inc(1);
    }

    pub(crate) fn point_invalid(&self, kind: PointKind, source: Source, error: &ValidationError) {
        self.points_invalid
            .recorder(&[
                ("type", kind.as_str()),
                ("source", source.as_str()),
                ("reason", error.reason()),
            ])
            .inc(1);
    }

    pub(crate) fn point_dropped(&self, kind: PointKind, source: Source) {
        self.points_dropped
            .recorder(&[("type", kind.as_str()), ("source", source.as_str())])
            .inc(1);
    }

    pub(crate) fn meta_lost(&self, kind: PointKind, source: Source) {
        self.meta_lost
            .recorder(&[("type", kind.as_str()), ("source", source.as_str())])
            .inc(1);
    }

    pub(crate) fn meta_known(&self, keyset: &str, meta_type: MetaType) {
        self.meta_known
            .recorder(meta_attributes(keyset, meta_type))
            .inc(1);
    }

    pub(crate) fn meta_check_failed(&self, keyset: &str, meta_type: MetaType) {
        self.meta_check_failed
            .recorder(meta_attributes(keyset, meta_type))
            .inc(1);
    }

    pub(crate) fn meta_pending(&self, keyset: &str, meta_type: MetaType) {
        self.meta_pending
            .recorder(meta_attributes(keyset, meta_type))
            .inc(1);
    }

    pub(crate) fn meta_flushed(&self, trigger: FlushTrigger) {
        self.meta_flushes
            .recorder(&[("trigger", trigger.as_str())])
            .inc(1);
    }

    pub(crate) fn meta_bulk_saved(&self, keyset: &str, documents: usize, elapsed: Duration) {
        let attributes = keyset_attributes(keyset);
        self.meta_bulk_duration
            .recorder(attributes.clone())
            .record(elapsed);
        self.meta_bulk_saved
            .recorder(attributes)
            .inc(documents as u64);
    }

    pub(crate) fn meta_bulk_failed(&self, keyset: &str, documents: usize, elapsed: Duration) {
        let attributes = keyset_attributes(keyset);
        self.meta_bulk_duration
            .recorder(attributes.clone())
            .record(elapsed);
        self.meta_bulk_failed
            .recorder(attributes)
            .inc(documents as u64);
    }
}

fn point_attributes(point: &ValidatedPoint, source: Source) -> Attributes {
    let mut attributes =
        Attributes::from(&[("type", point.kind.as_str()), ("source", source.as_str())]);
    attributes.insert("keyspace", point.keyspace.clone());
    attributes.insert("ttl", point.ttl.to_string());
    attributes
}

fn keyset_attributes(keyset: &str) -> Attributes {
    Attributes::from([("keyset", Cow::Owned(keyset.to_string()))])
}

fn meta_attributes(keyset: &str, meta_type: MetaType) -> Attributes {
    let mut attributes = keyset_attributes(keyset);
    attributes.insert("type", meta_type.as_str());
    attributes
}
