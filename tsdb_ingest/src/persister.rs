//! Contract of the column store the rows of validated points are written to.
use std::fmt::Debug;

use async_trait::async_trait;
use thiserror::Error;
use tsdb_types::{PointKind, ValidatedPoint};

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("row store write to keyspace {keyspace} failed: {source}")]
    Storage {
        keyspace: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("point {id} has no {kind} value to write")]
    MissingValue { id: String, kind: PointKind },
}

impl PersistError {
    pub fn storage(
        keyspace: impl Into<String>,
        error: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Storage {
            keyspace: keyspace.into(),
            source: error.into(),
        }
    }
}

/// Writes single rows to the physical keyspace of a point.
///
/// Each call is one unbatched write. Implementations must not retry; a failed
/// write is reported to the caller of the pipeline (or counted and dropped).
#[async_trait]
pub trait RowPersister: Debug + Send + Sync + 'static {
    async fn insert_number(
        &self,
        keyspace: &str,
        id: &str,
        timestamp: i64,
        value: f64,
    ) -> Result<(), PersistError>;

    async fn insert_text(
        &self,
        keyspace: &str,
        id: &str,
        timestamp: i64,
        text: &str,
    ) -> Result<(), PersistError>;
}

/// Write the row for `point` to its resolved keyspace.
pub(crate) async fn persist_point(
    persister: &dyn RowPersister,
    point: &ValidatedPoint,
) -> Result<(), PersistError> {
    match (point.kind, point.raw.value, point.raw.text.as_deref()) {
        (PointKind::Number, Some(value), _) => {
            persister
                .insert_number(&point.keyspace, &point.id, point.timestamp, value)
                .await
        }
        (PointKind::Text, _, Some(text)) => {
            persister
                .insert_text(&point.keyspace, &point.id, point.timestamp, text)
                .await
        }
        (kind, _, _) => Err(PersistError::MissingValue {
            id: point.id.clone(),
            kind,
        }),
    }
}
