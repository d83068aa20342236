//! Config for the point ingestion pipeline.
use std::{collections::BTreeMap, num::NonZeroUsize};

use regex::Regex;

/// Default pattern for metric names, tag keys and tag values.
pub const DEFAULT_METRIC_CHARSET: &str = r"^[0-9A-Za-z-._%&#;/]+$";

/// Default pattern for keyset names.
pub const DEFAULT_KEYSET_PATTERN: &str = r"^[a-z_]{1}[a-z0-9_-]+[a-z0-9]{1}$";

/// CLI config for point ingestion and metadata indexing.
#[derive(Debug, Clone, clap::Parser)]
pub struct IngestConfig {
    /// Number of workers writing points to the row store.
    #[clap(
        long = "ingest-workers",
        env = "TSDB_INGEST_WORKERS",
        default_value = "16",
        action
    )]
    pub workers: NonZeroUsize,

    /// Maximum number of points waiting for a worker. Synchronous writers wait
    /// for a free slot once this is reached, other sources drop the point.
    #[clap(
        long = "max-concurrent-points",
        env = "TSDB_MAX_CONCURRENT_POINTS",
        default_value = "1000",
        action
    )]
    pub max_concurrent_points: NonZeroUsize,

    /// Interval at which pending metadata documents are sent to the search index.
    #[clap(
        long = "meta-save-interval",
        env = "TSDB_META_SAVE_INTERVAL",
        default_value = "1s",
        action
    )]
    pub meta_save_interval: humantime::Duration,

    /// Number of pending metadata documents, across all keysets, above which a
    /// bulk save starts without waiting for the interval.
    #[clap(
        long = "max-meta-bulk-size",
        env = "TSDB_MAX_META_BULK_SIZE",
        default_value = "5000",
        action
    )]
    pub max_meta_bulk_size: NonZeroUsize,

    /// Maximum number of bulk saves running against the search index at once.
    #[clap(
        long = "max-concurrent-bulks",
        env = "TSDB_MAX_CONCURRENT_BULKS",
        default_value = "1",
        action
    )]
    pub max_concurrent_bulks: NonZeroUsize,

    /// Capacity of the queue between the workers and the metadata coordinator.
    /// Metadata for points arriving while the queue is full is not indexed.
    #[clap(
        long = "meta-channel-size",
        env = "TSDB_META_CHANNEL_SIZE",
        default_value = "10000",
        action
    )]
    pub meta_channel_size: NonZeroUsize,

    /// Maximum number of characters of a text point.
    #[clap(
        long = "max-text-size",
        env = "TSDB_MAX_TEXT_SIZE",
        default_value = "10000",
        action
    )]
    pub max_text_size: usize,

    /// Retention, in days, used for points without a valid `ttl` tag. Must be
    /// one of the TTLs given in `--keyspace-ttl`.
    #[clap(
        long = "default-ttl",
        env = "TSDB_DEFAULT_TTL",
        default_value = "90",
        action
    )]
    pub default_ttl: u32,

    /// Physical keyspace for each supported TTL, as a comma-separated list of
    /// `days=keyspace` pairs.
    ///
    /// # Example
    /// ```text
    /// --keyspace-ttl "1=one_day_ks, 90=ninety_day_ks"
    /// ```
    #[clap(
        long = "keyspace-ttl",
        env = "TSDB_KEYSPACE_TTL",
        default_value = "1=one_day_ks,7=seven_day_ks,30=thirty_day_ks,90=ninety_day_ks",
        value_parser = parse_keyspace_ttl,
        action
    )]
    pub keyspace_ttl: BTreeMap<u32, String>,

    /// Pattern every metric name, tag key and tag value must match.
    #[clap(
        long = "metric-charset",
        env = "TSDB_METRIC_CHARSET",
        default_value = DEFAULT_METRIC_CHARSET,
        value_parser = parse_pattern,
        action
    )]
    pub metric_charset: Regex,

    /// Pattern every keyset name must match.
    #[clap(
        long = "keyset-pattern",
        env = "TSDB_KEYSET_PATTERN",
        default_value = DEFAULT_KEYSET_PATTERN,
        value_parser = parse_pattern,
        action
    )]
    pub keyset_pattern: Regex,

    /// Report every rejected point with the same generic error instead of a
    /// description of the failed rule.
    #[clap(
        long = "generic-validation-errors",
        env = "TSDB_GENERIC_VALIDATION_ERRORS",
        default_value_t = false,
        action
    )]
    pub generic_validation_errors: bool,
}

fn parse_pattern(s: &str) -> Result<Regex, regex::Error> {
    Regex::new(s)
}

fn parse_keyspace_ttl(
    s: &str,
) -> Result<BTreeMap<u32, String>, Box<dyn std::error::Error + Send + Sync + 'static>> {
    let s = s.trim();
    if s.is_empty() {
        return Err("at least one ttl=keyspace pair is required".into());
    }

    let mut out = BTreeMap::new();
    for part in s.split(',') {
        let Some((ttl, keyspace)) = part.trim().split_once('=') else {
            return Err(format!("invalid pair - expected 'DAYS=KEYSPACE' got '{part}'").into());
        };
        let ttl: u32 = ttl
            .trim()
            .parse()
            .map_err(|e| format!("invalid ttl '{ttl}': {e}"))?;
        let keyspace = keyspace.trim();
        if keyspace.is_empty() {
            return Err(format!("empty keyspace for ttl {ttl}").into());
        }
        if out.insert(ttl, keyspace.to_owned()).is_some() {
            return Err(format!("ttl '{ttl}' passed multiple times").into());
        }
    }

    Ok(out)
}
