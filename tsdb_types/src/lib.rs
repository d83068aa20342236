//! Types shared by the ingestion pipeline, its configuration and its
//! transports.
//!
//! A point enters the system as a [`RawPoint`], decoded from one of the
//! supported wire formats. The validator turns it into a [`ValidatedPoint`],
//! which carries everything a worker needs to write the row and everything
//! the metadata coordinator needs to build a [`MetadataDocument`].
pub mod keyspace;
pub mod meta;
pub mod point;
pub mod write;

pub use keyspace::KeyspaceTtlMap;
pub use meta::{MetaType, MetadataDocument};
pub use point::{PointKind, RawPoint, Source, TagSet, ValidatedPoint};
pub use write::{FailureKind, PointFailure, WriteResponse};

/// Reserved tag naming the keyset (tenant) a point belongs to.
pub const KEYSET_TAG: &str = "ksid";

/// Reserved tag carrying the retention period of a point, in days.
pub const TTL_TAG: &str = "ttl";

/// Returns true for the tag keys that are interpreted by the pipeline rather
/// than describing the series.
pub fn is_reserved_tag(key: &str) -> bool {
    key == KEYSET_TAG || key == TTL_TAG
}
