use std::{collections::HashMap, fmt::Display};

use serde::{Deserialize, Serialize};

use crate::{MetaType, is_reserved_tag};

/// Tags of a point, keyed by tag name.
pub type TagSet = HashMap<String, String>;

/// A point as received on the wire, before any validation.
///
/// The same shape is used by the HTTP and UDP JSON bodies; the telnet
/// dialects are parsed into it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawPoint {
    #[serde(default)]
    pub metric: String,
    #[serde(default)]
    pub tags: TagSet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Epoch timestamp in seconds or milliseconds. Absent or zero means "now".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl RawPoint {
    /// Create a numeric point
    pub fn number(metric: impl Into<String>, value: f64) -> Self {
        Self {
            metric: metric.into(),
            value: Some(value),
            ..Default::default()
        }
    }

    /// Create a text point
    pub fn text(metric: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            metric: metric.into(),
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// Whether a point carries a number or a text value.
///
/// The two kinds are stored in different tables and indexed under different
/// metadata types, and their identifiers never overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointKind {
    Number,
    Text,
}

impl PointKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Number => "number",
            Self::Text => "text",
        }
    }

    pub fn meta_type(&self) -> MetaType {
        match self {
            Self::Number => MetaType::Meta,
            Self::Text => MetaType::MetaText,
        }
    }
}

impl Display for PointKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The protocol a point arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    Http,
    Udp,
    /// OpenTSDB `put` lines
    Telnet,
    /// Netdata JSON lines
    Netdata,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Udp => "udp",
            Self::Telnet => "telnet",
            Self::Netdata => "netdata",
        }
    }

    /// Sources whose caller waits for the outcome of every point.
    ///
    /// Only HTTP has a back-channel; the other sources must never block their
    /// read loop on the pipeline.
    pub fn is_synchronous(&self) -> bool {
        matches!(self, Self::Http)
    }
}

impl Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A point that passed validation.
///
/// The `raw` tags contain the resolved `ttl` tag, so callers observe the TTL
/// the point was stored with. A validated point is never modified.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedPoint {
    /// The keyset (tenant) named by the `ksid` tag.
    pub keyset: String,
    /// The physical keyspace selected by `ttl`.
    pub keyspace: String,
    /// Retention in days.
    pub ttl: u32,
    /// Epoch seconds.
    pub timestamp: i64,
    /// Series identifier, see [`PointKind`] for the text prefix.
    pub id: String,
    pub kind: PointKind,
    pub raw: RawPoint,
}

impl ValidatedPoint {
    pub fn is_number(&self) -> bool {
        self.kind == PointKind::Number
    }

    pub fn metric(&self) -> &str {
        &self.raw.metric
    }

    pub fn meta_type(&self) -> MetaType {
        self.kind.meta_type()
    }

    /// Tags describing the series, without `ksid` and `ttl`.
    pub fn user_tags(&self) -> impl Iterator<Item = (&str, &str)> {
        self.raw
            .tags
            .iter()
            .filter(|(k, _)| !is_reserved_tag(k))
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }
}
