//! Validation of raw points and series identifier generation.
//!
//! Rules are applied in a fixed order and the first violation is reported:
//!
//! 1. the point has a value matching its kind (and text is not too long)
//! 2. the point has at least one tag besides `ksid` and `ttl`
//! 3. the metric and every tag key and value match the charset
//! 4. `ksid` is present, well-formed and names an existing keyset
//! 5. `ttl` resolves to a keyspace (unmapped TTLs fall back to the default)
//! 6. the timestamp is in range (absent or zero means now)
//!
//! The identifier is generated last, over the tag set that includes the
//! resolved `ttl`.
use std::sync::Arc;

use iox_time::TimeProvider;
use regex::Regex;
use thiserror::Error;
use tsdb_clap_blocks::ingest::{DEFAULT_KEYSET_PATTERN, DEFAULT_METRIC_CHARSET};
use tsdb_types::{
    KEYSET_TAG, KeyspaceTtlMap, PointKind, RawPoint, TTL_TAG, TagSet, ValidatedPoint,
    is_reserved_tag,
};

use crate::index::KeysetCatalog;

/// Largest timestamp interpreted as seconds. Larger values are milliseconds.
const MAX_SECONDS: i64 = 9_999_999_999;

const NANOS_PER_SECOND: i64 = 1_000_000_000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("a number point must have a value and no text")]
    MissingValue,

    #[error("a text point must have a text and no value")]
    MissingText,

    #[error("text has {len} characters, the maximum is {max}")]
    TextTooLong { len: usize, max: usize },

    #[error("point has no tags")]
    NoTags,

    #[error("point has no tags besides ksid and ttl")]
    NoUserTags,

    #[error("invalid metric name {0:?}")]
    InvalidMetric(String),

    #[error("invalid tag key {0:?}")]
    InvalidTagKey(String),

    #[error("invalid value {value:?} for tag {key:?}")]
    InvalidTagValue { key: String, value: String },

    #[error("tag ksid is required")]
    MissingKeyset,

    #[error("invalid keyset name {0:?}")]
    InvalidKeysetName(String),

    #[error("keyset {0:?} does not exist")]
    UnknownKeyset(String),

    #[error("invalid ttl {0:?}, expected a positive number of days")]
    InvalidTtl(String),

    #[error("timestamp {0} is out of range")]
    InvalidTimestamp(i64),

    /// Any of the above, when detailed errors are disabled.
    #[error("invalid point")]
    Generic { systemic: bool },
}

impl ValidationError {
    /// Errors that indicate the whole request is misconfigured rather than one
    /// bad record. A batch stops at the first systemic error.
    pub fn is_systemic(&self) -> bool {
        match self {
            Self::UnknownKeyset(_) | Self::InvalidTtl(_) => true,
            Self::Generic { systemic } => *systemic,
            Self::MissingValue
            | Self::MissingText
            | Self::TextTooLong { .. }
            | Self::NoTags
            | Self::NoUserTags
            | Self::InvalidMetric(_)
            | Self::InvalidTagKey(_)
            | Self::InvalidTagValue { .. }
            | Self::MissingKeyset
            | Self::InvalidKeysetName(_)
            | Self::InvalidTimestamp(_) => false,
        }
    }

    /// Short, low-cardinality label of the violated rule.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::MissingValue | Self::MissingText => "value",
            Self::TextTooLong { .. } => "text_size",
            Self::NoTags | Self::NoUserTags => "tags",
            Self::InvalidMetric(_) => "metric",
            Self::InvalidTagKey(_) | Self::InvalidTagValue { .. } => "charset",
            Self::MissingKeyset | Self::InvalidKeysetName(_) => "keyset",
            Self::UnknownKeyset(_) => "unknown_keyset",
            Self::InvalidTtl(_) => "ttl",
            Self::InvalidTimestamp(_) => "timestamp",
            Self::Generic { .. } => "generic",
        }
    }

    fn into_generic(self) -> Self {
        Self::Generic {
            systemic: self.is_systemic(),
        }
    }
}

pub type Result<T, E = ValidationError> = std::result::Result<T, E>;

/// Configurable parts of the validation rules.
#[derive(Debug, Clone)]
pub struct ValidationRules {
    /// Pattern for the metric and every tag key and value.
    pub metric_charset: Regex,
    pub keyset_pattern: Regex,
    /// Maximum number of characters of a text point.
    pub max_text_size: usize,
    /// Collapse every validation error into [`ValidationError::Generic`].
    pub generic_errors: bool,
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self {
            metric_charset: Regex::new(DEFAULT_METRIC_CHARSET).expect("valid default charset"),
            keyset_pattern: Regex::new(DEFAULT_KEYSET_PATTERN).expect("valid default pattern"),
            max_text_size: 10_000,
            generic_errors: false,
        }
    }
}

/// Turns [`RawPoint`]s into [`ValidatedPoint`]s.
#[derive(Debug)]
pub struct PointValidator {
    rules: ValidationRules,
    keyspaces: Arc<KeyspaceTtlMap>,
    keysets: Arc<dyn KeysetCatalog>,
    time_provider: Arc<dyn TimeProvider>,
}

impl PointValidator {
    pub fn new(
        rules: ValidationRules,
        keyspaces: Arc<KeyspaceTtlMap>,
        keysets: Arc<dyn KeysetCatalog>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            rules,
            keyspaces,
            keysets,
            time_provider,
        }
    }

    /// Validate `raw` as a point of `kind`.
    ///
    /// The returned point's tags contain the resolved `ttl`.
    pub async fn validate(&self, raw: &RawPoint, kind: PointKind) -> Result<ValidatedPoint> {
        self.validate_inner(raw, kind).await.map_err(|e| {
            if self.rules.generic_errors {
                e.into_generic()
            } else {
                e
            }
        })
    }

    async fn validate_inner(&self, raw: &RawPoint, kind: PointKind) -> Result<ValidatedPoint> {
        self.check_value(raw, kind)?;
        check_tag_count(&raw.tags)?;
        self.check_charset(raw)?;

        let keyset = self.check_keyset(&raw.tags).await?;

        let requested_ttl = raw.tags.get(TTL_TAG).map(|t| parse_ttl(t)).transpose()?;
        let (ttl, keyspace) = self.keyspaces.resolve(requested_ttl);

        let timestamp = self.normalize_timestamp(raw.timestamp)?;

        let mut raw = raw.clone();
        raw.tags.insert(TTL_TAG.to_string(), ttl.to_string());
        let id = series_id(&raw.metric, &raw.tags, kind);

        Ok(ValidatedPoint {
            keyset,
            keyspace: keyspace.to_string(),
            ttl,
            timestamp,
            id,
            kind,
            raw,
        })
    }

    fn check_value(&self, raw: &RawPoint, kind: PointKind) -> Result<()> {
        match (kind, raw.value, raw.text.as_deref()) {
            (PointKind::Number, Some(_), None) => Ok(()),
            (PointKind::Number, _, _) => Err(ValidationError::MissingValue),
            (PointKind::Text, None, Some(text)) => {
                let len = text.chars().count();
                if len > self.rules.max_text_size {
                    return Err(ValidationError::TextTooLong {
                        len,
                        max: self.rules.max_text_size,
                    });
                }
                Ok(())
            }
            (PointKind::Text, _, _) => Err(ValidationError::MissingText),
        }
    }

    fn check_charset(&self, raw: &RawPoint) -> Result<()> {
        let charset = &self.rules.metric_charset;
        if !charset.is_match(&raw.metric) {
            return Err(ValidationError::InvalidMetric(raw.metric.clone()));
        }

        let mut tags: Vec<_> = raw.tags.iter().collect();
        tags.sort_unstable();
        for (key, value) in tags {
            if !charset.is_match(key) {
                return Err(ValidationError::InvalidTagKey(key.clone()));
            }
            if !charset.is_match(value) {
                return Err(ValidationError::InvalidTagValue {
                    key: key.clone(),
                    value: value.clone(),
                });
            }
        }
        Ok(())
    }

    async fn check_keyset(&self, tags: &TagSet) -> Result<String> {
        let keyset = tags
            .get(KEYSET_TAG)
            .ok_or(ValidationError::MissingKeyset)?;
        if !self.rules.keyset_pattern.is_match(keyset) {
            return Err(ValidationError::InvalidKeysetName(keyset.clone()));
        }
        if !self.keysets.keyset_exists(keyset).await {
            return Err(ValidationError::UnknownKeyset(keyset.clone()));
        }
        Ok(keyset.clone())
    }

    fn normalize_timestamp(&self, timestamp: Option<i64>) -> Result<i64> {
        match timestamp.unwrap_or(0) {
            0 => Ok(self.time_provider.now().timestamp_nanos() / NANOS_PER_SECOND),
            t if t < 0 => Err(ValidationError::InvalidTimestamp(t)),
            t if t <= MAX_SECONDS => Ok(t),
            t if t / 1000 <= MAX_SECONDS => Ok(t / 1000),
            t => Err(ValidationError::InvalidTimestamp(t)),
        }
    }
}

fn check_tag_count(tags: &TagSet) -> Result<()> {
    if tags.is_empty() {
        return Err(ValidationError::NoTags);
    }
    if tags.keys().all(|k| is_reserved_tag(k)) {
        return Err(ValidationError::NoUserTags);
    }
    Ok(())
}

fn parse_ttl(ttl: &str) -> Result<u32> {
    match ttl.parse::<u32>() {
        Ok(days) if days > 0 => Ok(days),
        _ => Err(ValidationError::InvalidTtl(ttl.to_string())),
    }
}

/// Deterministic identifier of the series `metric` + `tags`.
///
/// A CRC-32 (IEEE) over the metric, then every tag key followed by its value
/// in key order, formatted in decimal. Text series are prefixed with `T` so
/// they never share an identifier with a number series. Being 32 bits,
/// distinct series can collide.
pub fn series_id(metric: &str, tags: &TagSet, kind: PointKind) -> String {
    let mut sorted: Vec<_> = tags.iter().collect();
    sorted.sort_unstable_by(|a, b| a.0.cmp(b.0));

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(metric.as_bytes());
    for (key, value) in sorted {
        hasher.update(key.as_bytes());
        hasher.update(value.as_bytes());
    }
    let checksum = hasher.finalize();

    match kind {
        PointKind::Number => checksum.to_string(),
        PointKind::Text => format!("T{checksum}"),
    }
}

#[cfg(test)]
mod tests {
    use iox_time::{MockProvider, Time};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use super::*;
    use crate::memory::MemKeysetCatalog;

    const NOW_SECONDS: i64 = 1_700_000_000;

    fn validator_with(rules: ValidationRules) -> PointValidator {
        let keyspaces =
            KeyspaceTtlMap::try_new([(1, "one_day_ks"), (90, "ninety_day_ks")], 90).unwrap();
        PointValidator::new(
            rules,
            Arc::new(keyspaces),
            Arc::new(MemKeysetCatalog::new(["ks1"])),
            Arc::new(MockProvider::new(Time::from_timestamp_nanos(
                NOW_SECONDS * NANOS_PER_SECOND,
            ))),
        )
    }

    fn validator() -> PointValidator {
        validator_with(ValidationRules::default())
    }

    fn cpu() -> RawPoint {
        RawPoint::number("os.cpu", 1.0)
            .with_tag("ksid", "ks1")
            .with_tag("host", "h1")
    }

    async fn reject(raw: RawPoint, kind: PointKind) -> ValidationError {
        validator().validate(&raw, kind).await.unwrap_err()
    }

    #[tokio::test]
    async fn valid_number_point() {
        let point = validator()
            .validate(&cpu().with_timestamp(1_600_000_000), PointKind::Number)
            .await
            .unwrap();

        assert_eq!(point.keyset, "ks1");
        assert_eq!(point.keyspace, "ninety_day_ks");
        assert_eq!(point.ttl, 90);
        assert_eq!(point.timestamp, 1_600_000_000);
        assert_eq!(point.raw.tags.get("ttl").map(String::as_str), Some("90"));
        assert_eq!(point.id, series_id("os.cpu", &point.raw.tags, PointKind::Number));
        assert!(point.is_number());
    }

    #[tokio::test]
    async fn configured_ttl_selects_keyspace() {
        let point = validator()
            .validate(&cpu().with_tag("ttl", "1"), PointKind::Number)
            .await
            .unwrap();
        assert_eq!((point.ttl, point.keyspace.as_str()), (1, "one_day_ks"));
    }

    #[tokio::test]
    async fn unmapped_ttl_falls_back_to_default() {
        let point = validator()
            .validate(&cpu().with_tag("ttl", "999"), PointKind::Number)
            .await
            .unwrap();
        assert_eq!(point.ttl, 90);
        assert_eq!(point.keyspace, "ninety_day_ks");
        assert_eq!(point.raw.tags.get("ttl").map(String::as_str), Some("90"));
    }

    #[tokio::test]
    async fn malformed_ttl_is_systemic() {
        for ttl in ["abc", "0", "-3"] {
            let err = reject(cpu().with_tag("ttl", ttl), PointKind::Number).await;
            assert_eq!(err, ValidationError::InvalidTtl(ttl.to_string()));
            assert!(err.is_systemic());
        }
    }

    #[tokio::test]
    async fn value_must_match_kind() {
        let mut both = cpu();
        both.text = Some("x".into());
        assert_eq!(reject(both, PointKind::Number).await, ValidationError::MissingValue);

        let mut none = cpu();
        none.value = None;
        assert_eq!(reject(none, PointKind::Number).await, ValidationError::MissingValue);

        assert_eq!(reject(cpu(), PointKind::Text).await, ValidationError::MissingText);
    }

    #[tokio::test]
    async fn text_length_is_limited() {
        let rules = ValidationRules {
            max_text_size: 4,
            ..Default::default()
        };
        let raw = RawPoint::text("app.log", "héllo")
            .with_tag("ksid", "ks1")
            .with_tag("host", "h1");
        let err = validator_with(rules)
            .validate(&raw, PointKind::Text)
            .await
            .unwrap_err();
        assert_eq!(err, ValidationError::TextTooLong { len: 5, max: 4 });
    }

    #[tokio::test]
    async fn text_at_the_limit_is_accepted() {
        let rules = ValidationRules {
            max_text_size: 5,
            ..Default::default()
        };
        // Five characters, six bytes.
        let raw = RawPoint::text("app.log", "héllo")
            .with_tag("ksid", "ks1")
            .with_tag("host", "h1");
        let point = validator_with(rules)
            .validate(&raw, PointKind::Text)
            .await
            .unwrap();
        assert_eq!(point.raw.text.as_deref(), Some("héllo"));
    }

    #[tokio::test]
    async fn text_point_id_is_prefixed() {
        let raw = RawPoint::text("app.log", "started")
            .with_tag("ksid", "ks1")
            .with_tag("host", "h1");
        let point = validator().validate(&raw, PointKind::Text).await.unwrap();
        assert!(point.id.starts_with('T'));
        assert_eq!(
            &point.id[1..],
            series_id("app.log", &point.raw.tags, PointKind::Number)
        );
    }

    #[tokio::test]
    async fn user_tag_required() {
        let no_tags = RawPoint::number("os.cpu", 1.0);
        assert_eq!(reject(no_tags, PointKind::Number).await, ValidationError::NoTags);

        let only_keyset = RawPoint::number("os.cpu", 1.0).with_tag("ksid", "ks1");
        assert_eq!(
            reject(only_keyset, PointKind::Number).await,
            ValidationError::NoUserTags
        );

        let reserved_only = RawPoint::number("os.cpu", 1.0)
            .with_tag("ksid", "ks1")
            .with_tag("ttl", "1");
        assert_eq!(
            reject(reserved_only, PointKind::Number).await,
            ValidationError::NoUserTags
        );
    }

    #[tokio::test]
    async fn charset_is_enforced() {
        let mut bad_metric = cpu();
        bad_metric.metric = "os cpu".into();
        assert_eq!(
            reject(bad_metric, PointKind::Number).await,
            ValidationError::InvalidMetric("os cpu".into())
        );

        let mut empty_metric = cpu();
        empty_metric.metric.clear();
        assert_eq!(
            reject(empty_metric, PointKind::Number).await,
            ValidationError::InvalidMetric(String::new())
        );

        assert_eq!(
            reject(cpu().with_tag("bad key", "v"), PointKind::Number).await,
            ValidationError::InvalidTagKey("bad key".into())
        );
        assert_eq!(
            reject(cpu().with_tag("region", "us east"), PointKind::Number).await,
            ValidationError::InvalidTagValue {
                key: "region".into(),
                value: "us east".into()
            }
        );
    }

    #[tokio::test]
    async fn keyset_rules() {
        let missing = RawPoint::number("os.cpu", 1.0).with_tag("host", "h1");
        assert_eq!(
            reject(missing, PointKind::Number).await,
            ValidationError::MissingKeyset
        );

        let malformed = cpu().with_tag("ksid", "KS1");
        assert_eq!(
            reject(malformed, PointKind::Number).await,
            ValidationError::InvalidKeysetName("KS1".into())
        );

        let unknown = cpu().with_tag("ksid", "ks2");
        let err = reject(unknown, PointKind::Number).await;
        assert_eq!(err, ValidationError::UnknownKeyset("ks2".into()));
        assert!(err.is_systemic());
    }

    #[tokio::test]
    async fn timestamps() {
        let v = validator();
        let now = v.validate(&cpu(), PointKind::Number).await.unwrap();
        assert_eq!(now.timestamp, NOW_SECONDS);

        let zero = v
            .validate(&cpu().with_timestamp(0), PointKind::Number)
            .await
            .unwrap();
        assert_eq!(zero.timestamp, NOW_SECONDS);

        let millis = v
            .validate(&cpu().with_timestamp(1_600_000_000_123), PointKind::Number)
            .await
            .unwrap();
        assert_eq!(millis.timestamp, 1_600_000_000);

        for bad in [-1, 99_999_999_999_999] {
            assert_eq!(
                v.validate(&cpu().with_timestamp(bad), PointKind::Number)
                    .await
                    .unwrap_err(),
                ValidationError::InvalidTimestamp(bad)
            );
        }
    }

    #[tokio::test]
    async fn generic_errors_keep_classification() {
        let rules = ValidationRules {
            generic_errors: true,
            ..Default::default()
        };
        let v = validator_with(rules);

        let err = v
            .validate(&cpu().with_tag("ksid", "ks2"), PointKind::Number)
            .await
            .unwrap_err();
        assert_eq!(err, ValidationError::Generic { systemic: true });
        assert_eq!(err.to_string(), "invalid point");

        let err = v
            .validate(&RawPoint::number("os.cpu", 1.0), PointKind::Number)
            .await
            .unwrap_err();
        assert_eq!(err, ValidationError::Generic { systemic: false });
    }

    #[test]
    fn id_changes_with_any_tag_value() {
        let tags: TagSet = [("ksid", "ks1"), ("host", "h1"), ("ttl", "90")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let base = series_id("os.cpu", &tags, PointKind::Number);

        for key in ["ksid", "host", "ttl"] {
            let mut changed = tags.clone();
            changed.insert(key.to_string(), "other".to_string());
            assert_ne!(series_id("os.cpu", &changed, PointKind::Number), base);
        }
        assert_ne!(series_id("os.mem", &tags, PointKind::Number), base);
        assert_eq!(
            series_id("os.cpu", &tags, PointKind::Text),
            format!("T{base}")
        );
    }

    #[test]
    fn id_matches_reference_checksum() {
        let tags: TagSet = [("b", "2"), ("a", "1")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let expected = crc32fast::hash(b"ma1b2");
        assert_eq!(series_id("m", &tags, PointKind::Number), expected.to_string());
    }

    proptest! {
        #[test]
        fn id_is_independent_of_tag_order(
            metric in "[a-z.]{1,12}",
            tags in proptest::collection::vec(("[a-z]{1,6}", "[a-z0-9]{1,6}"), 1..8),
        ) {
            let forward: TagSet = tags.iter().cloned().collect();
            let mut reversed = TagSet::with_capacity(forward.len());
            let mut entries: Vec<_> = forward.iter().collect();
            entries.reverse();
            for (k, v) in entries {
                reversed.insert(k.clone(), v.clone());
            }

            prop_assert_eq!(
                series_id(&metric, &forward, PointKind::Number),
                series_id(&metric, &reversed, PointKind::Number)
            );
        }
    }
}
