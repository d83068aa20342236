//! Contracts of the collaborators the pipeline reads tenant and series
//! metadata from.
use std::fmt::Debug;

use async_trait::async_trait;
use thiserror::Error;
use tsdb_types::{MetaType, MetadataDocument};

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("search index request failed: {0}")]
    Request(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("search index rejected {rejected} of {total} documents")]
    Rejected { rejected: usize, total: usize },
}

impl IndexError {
    pub fn request(error: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Request(error.into())
    }
}

/// Lookup of the keysets (tenants) that accept writes.
///
/// Keysets are created through the administration API; the ingestion path
/// never creates one.
#[async_trait]
pub trait KeysetCatalog: Debug + Send + Sync + 'static {
    async fn keyset_exists(&self, keyset: &str) -> bool;
}

/// The document search index holding one [`MetadataDocument`] per series.
#[async_trait]
pub trait MetadataIndex: Debug + Send + Sync + 'static {
    /// Whether a document for series `id` of `meta_type` is already indexed in
    /// `keyset`.
    async fn check_metadata(
        &self,
        keyset: &str,
        meta_type: MetaType,
        id: &str,
    ) -> Result<bool, IndexError>;

    /// Upsert `documents` into the index of `keyset`.
    async fn add_documents(
        &self,
        keyset: &str,
        documents: Vec<MetadataDocument>,
    ) -> Result<(), IndexError>;
}
