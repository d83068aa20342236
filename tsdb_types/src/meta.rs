use serde::{Deserialize, Serialize};

use crate::ValidatedPoint;

/// The document type a series is indexed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetaType {
    Meta,
    MetaText,
}

impl MetaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Meta => "meta",
            Self::MetaText => "metatext",
        }
    }
}

impl std::fmt::Display for MetaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Search index document describing one series.
///
/// `tag_keys` and `tag_values` are parallel and ordered by key. Reserved tags
/// are never part of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataDocument {
    pub id: String,
    pub metric: String,
    pub meta_type: MetaType,
    pub tag_keys: Vec<String>,
    pub tag_values: Vec<String>,
}

impl From<&ValidatedPoint> for MetadataDocument {
    fn from(point: &ValidatedPoint) -> Self {
        let mut tags: Vec<_> = point.user_tags().collect();
        tags.sort_unstable();
        let (tag_keys, tag_values) = tags
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .unzip();

        Self {
            id: point.id.clone(),
            metric: point.metric().to_string(),
            meta_type: point.meta_type(),
            tag_keys,
            tag_values,
        }
    }
}
