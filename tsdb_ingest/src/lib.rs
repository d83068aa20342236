//! Point ingestion and metadata indexing.
//!
//! Points reach the [`IngestPipeline`] from the HTTP, UDP and telnet
//! transports. Each point is validated, queued for one of a fixed number of
//! workers which writes its row through the [`RowPersister`], and then offered
//! to the [`MetaCoordinator`], which batches metadata documents of new series
//! into bulk saves against the [`MetadataIndex`].
//!
//! Row writes are on the critical path and bounded by the job queue. Metadata
//! indexing is best effort: it never slows down or fails a row write.
pub mod config;
pub mod dispatcher;
pub mod index;
pub mod memory;
pub mod meta;
pub mod metrics;
pub mod persister;
pub mod pipeline;
pub mod telnet;
pub mod validator;

pub use config::{ConfigError, PipelineConfig};
pub use dispatcher::{Dispatcher, SubmitError, TrySubmitError, WorkerJob};
pub use index::{IndexError, KeysetCatalog, MetadataIndex};
pub use meta::{MetaConfig, MetaCoordinator, MetaHandle};
pub use metrics::IngestMetrics;
pub use persister::{PersistError, RowPersister};
pub use pipeline::{Collaborators, IngestPipeline, WriteError};
pub use telnet::{TelnetDialect, TelnetError};
pub use validator::{PointValidator, ValidationError, ValidationRules, series_id};
