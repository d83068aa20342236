//! Runtime configuration of the [`IngestPipeline`](crate::IngestPipeline).
use std::{num::NonZeroUsize, time::Duration};

use thiserror::Error;
use tsdb_clap_blocks::ingest::IngestConfig;
use tsdb_types::{KeyspaceTtlMap, keyspace};

use crate::{meta::MetaConfig, validator::ValidationRules};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid keyspace ttl mapping: {0}")]
    Keyspace(#[from] keyspace::Error),

    #[error("meta save interval must be greater than zero")]
    ZeroSaveInterval,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub workers: NonZeroUsize,
    /// Capacity of the job queue.
    pub max_concurrent_points: NonZeroUsize,
    pub meta: MetaConfig,
    pub rules: ValidationRules,
    pub keyspaces: KeyspaceTtlMap,
}

impl PipelineConfig {
    /// Default sizing for the given keyspaces.
    pub fn new(keyspaces: KeyspaceTtlMap) -> Self {
        Self {
            workers: NonZeroUsize::new(16).expect("non-zero"),
            max_concurrent_points: NonZeroUsize::new(1000).expect("non-zero"),
            meta: MetaConfig::default(),
            rules: ValidationRules::default(),
            keyspaces,
        }
    }
}

impl TryFrom<&IngestConfig> for PipelineConfig {
    type Error = ConfigError;

    fn try_from(config: &IngestConfig) -> Result<Self, Self::Error> {
        let keyspaces = KeyspaceTtlMap::try_new(
            config
                .keyspace_ttl
                .iter()
                .map(|(ttl, keyspace)| (*ttl, keyspace.as_str())),
            config.default_ttl,
        )?;

        let save_interval: Duration = config.meta_save_interval.into();
        if save_interval.is_zero() {
            return Err(ConfigError::ZeroSaveInterval);
        }

        Ok(Self {
            workers: config.workers,
            max_concurrent_points: config.max_concurrent_points,
            meta: MetaConfig {
                save_interval,
                max_bulk_size: config.max_meta_bulk_size,
                max_concurrent_bulks: config.max_concurrent_bulks,
                channel_size: config.meta_channel_size,
            },
            rules: ValidationRules {
                metric_charset: config.metric_charset.clone(),
                keyset_pattern: config.keyset_pattern.clone(),
                max_text_size: config.max_text_size,
                generic_errors: config.generic_validation_errors,
            },
            keyspaces,
        })
    }
}
