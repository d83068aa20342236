//! Parsers for the line based telnet dialects.
//!
//! Both dialects only carry numbers. Parsing checks the line structure; the
//! resulting [`RawPoint`] goes through the validator like any other point.
use serde::Deserialize;
use thiserror::Error;
use tsdb_types::{RawPoint, Source, TagSet};

/// Netdata pseudo tag naming the field used as metric.
const SET_METRIC_TAG: &str = "%set_metric%";

const DEFAULT_METRIC_FIELD: &str = "chart_context";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TelnetError {
    #[error("unsupported command {0:?}")]
    UnsupportedCommand(String),

    #[error("put expects a metric, a timestamp and a value, got {0} arguments")]
    Arity(usize),

    #[error("invalid timestamp {0:?}")]
    InvalidTimestamp(String),

    #[error("invalid value {0:?}")]
    InvalidValue(String),

    #[error("malformed tag {0:?}, expected key=value")]
    MalformedTag(String),

    #[error("invalid netdata line: {0}")]
    Json(String),

    #[error("netdata host_tags carry no ksid")]
    MissingKeyset,

    #[error("unknown %set_metric% field {0:?}")]
    UnknownMetricField(String),

    #[error("netdata field {0} selected as metric is empty")]
    EmptyMetric(String),
}

pub type Result<T, E = TelnetError> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelnetDialect {
    /// `put <metric> <timestamp> <value> <key>=<value> ...`
    OpenTsdb,
    /// One JSON object per line, as sent by the Netdata exporter.
    Netdata,
}

impl TelnetDialect {
    pub fn source(&self) -> Source {
        match self {
            Self::OpenTsdb => Source::Telnet,
            Self::Netdata => Source::Netdata,
        }
    }

    /// Parse one line. Blank lines yield `None`.
    pub fn parse_line(&self, line: &str) -> Result<Option<RawPoint>> {
        match self {
            Self::OpenTsdb => Ok(OpenTsdbLine::parse(line)?.map(RawPoint::from)),
            Self::Netdata => NetdataLine::parse(line)?
                .map(NetdataLine::into_raw_point)
                .transpose(),
        }
    }
}

/// An OpenTSDB `put` line.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenTsdbLine {
    pub metric: String,
    pub timestamp: i64,
    pub value: f64,
    pub tags: TagSet,
}

impl OpenTsdbLine {
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let mut fields = line.split_whitespace();
        let Some(command) = fields.next() else {
            return Ok(None);
        };
        if command != "put" {
            return Err(TelnetError::UnsupportedCommand(command.to_string()));
        }

        let args: Vec<_> = fields.collect();
        let [metric, timestamp, value, tags @ ..] = args.as_slice() else {
            return Err(TelnetError::Arity(args.len()));
        };

        let timestamp = timestamp
            .parse()
            .map_err(|_| TelnetError::InvalidTimestamp(timestamp.to_string()))?;
        let value = value
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| TelnetError::InvalidValue(value.to_string()))?;

        Ok(Some(Self {
            metric: metric.to_string(),
            timestamp,
            value,
            tags: parse_tags(tags.iter().copied())?,
        }))
    }
}

impl From<OpenTsdbLine> for RawPoint {
    fn from(line: OpenTsdbLine) -> Self {
        Self {
            metric: line.metric,
            tags: line.tags,
            value: Some(line.value),
            text: None,
            timestamp: Some(line.timestamp),
        }
    }
}

/// A line of the Netdata JSON exporter.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct NetdataLine {
    pub prefix: String,
    pub hostname: String,
    pub host_tags: String,
    pub chart_id: String,
    pub chart_name: String,
    pub chart_family: String,
    pub chart_context: String,
    pub chart_type: String,
    pub units: String,
    pub id: String,
    pub name: String,
    pub value: Option<f64>,
    pub timestamp: Option<i64>,
}

impl NetdataLine {
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        serde_json::from_str(line)
            .map(Some)
            .map_err(|e| TelnetError::Json(e.to_string()))
    }

    /// The named field, if it can be selected as metric.
    fn field(&self, name: &str) -> Option<&str> {
        let value = match name {
            "chart_id" => &self.chart_id,
            "chart_name" => &self.chart_name,
            "chart_family" => &self.chart_family,
            "chart_context" => &self.chart_context,
            "chart_type" => &self.chart_type,
            "id" => &self.id,
            "name" => &self.name,
            _ => return None,
        };
        Some(value)
    }

    /// Build the point: `host_tags` and the descriptive fields become tags,
    /// the field chosen by `%set_metric%` becomes the metric.
    pub fn into_raw_point(self) -> Result<RawPoint> {
        let mut tags = parse_tags(self.host_tags.split_whitespace())?;
        if !tags.contains_key(tsdb_types::KEYSET_TAG) {
            return Err(TelnetError::MissingKeyset);
        }

        let metric_field = tags
            .remove(SET_METRIC_TAG)
            .unwrap_or_else(|| DEFAULT_METRIC_FIELD.to_string());
        let metric = match self.field(&metric_field) {
            None => return Err(TelnetError::UnknownMetricField(metric_field)),
            Some("") => return Err(TelnetError::EmptyMetric(metric_field)),
            Some(metric) => metric.to_string(),
        };

        let value = self
            .value
            .filter(|v| v.is_finite())
            .ok_or_else(|| TelnetError::InvalidValue(format!("{:?}", self.value)))?;

        if !self.hostname.is_empty() {
            tags.insert("host".to_string(), self.hostname.clone());
        }
        for (key, field) in [
            ("prefix", &self.prefix),
            ("chart_id", &self.chart_id),
            ("chart_name", &self.chart_name),
            ("chart_family", &self.chart_family),
            ("chart_context", &self.chart_context),
            ("chart_type", &self.chart_type),
            ("units", &self.units),
            ("id", &self.id),
            ("name", &self.name),
        ] {
            if key != metric_field && !field.is_empty() {
                tags.insert(key.to_string(), field.clone());
            }
        }

        Ok(RawPoint {
            metric,
            tags,
            value: Some(value),
            text: None,
            timestamp: self.timestamp,
        })
    }
}

/// Parse `key=value` tokens. Surrounding double quotes of a value are removed.
fn parse_tags<'a>(tokens: impl Iterator<Item = &'a str>) -> Result<TagSet> {
    let mut tags = TagSet::new();
    for token in tokens {
        let Some((key, value)) = token.split_once('=') else {
            return Err(TelnetError::MalformedTag(token.to_string()));
        };
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(value);
        if key.is_empty() || value.is_empty() {
            return Err(TelnetError::MalformedTag(token.to_string()));
        }
        tags.insert(key.to_string(), value.to_string());
    }
    Ok(tags)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> TagSet {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn opentsdb_put() {
        let point = TelnetDialect::OpenTsdb
            .parse_line("put os.cpu 1700000000 0.75 ksid=ks1 host=h1\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(
            point,
            RawPoint {
                metric: "os.cpu".into(),
                tags: tags(&[("ksid", "ks1"), ("host", "h1")]),
                value: Some(0.75),
                text: None,
                timestamp: Some(1_700_000_000),
            }
        );
    }

    #[test]
    fn opentsdb_without_tags_parses() {
        let line = OpenTsdbLine::parse("put os.cpu 1 2").unwrap().unwrap();
        assert!(line.tags.is_empty());
    }

    #[test]
    fn opentsdb_errors() {
        let cases = [
            ("version", TelnetError::UnsupportedCommand("version".into())),
            ("get os.cpu", TelnetError::UnsupportedCommand("get".into())),
            ("put os.cpu 1", TelnetError::Arity(2)),
            ("put", TelnetError::Arity(0)),
            ("put os.cpu soon 1 a=b", TelnetError::InvalidTimestamp("soon".into())),
            ("put os.cpu 1 abc a=b", TelnetError::InvalidValue("abc".into())),
            ("put os.cpu 1 NaN a=b", TelnetError::InvalidValue("NaN".into())),
            ("put os.cpu 1 2 host", TelnetError::MalformedTag("host".into())),
            ("put os.cpu 1 2 =h1", TelnetError::MalformedTag("=h1".into())),
        ];
        for (line, expected) in cases {
            assert_eq!(OpenTsdbLine::parse(line).unwrap_err(), expected, "{line}");
        }
    }

    #[test]
    fn blank_lines_are_skipped() {
        assert_eq!(TelnetDialect::OpenTsdb.parse_line("   \n").unwrap(), None);
        assert_eq!(TelnetDialect::Netdata.parse_line("").unwrap(), None);
    }

    const NETDATA_LINE: &str = r#"{"prefix":"netdata","hostname":"web1","host_tags":"ksid=ks1 env=\"prod\"","chart_id":"system.cpu","chart_name":"system.cpu","chart_family":"cpu","chart_context":"system.cpu","chart_type":"system","units":"percentage","id":"user","name":"user","value":12.5,"timestamp":1700000000}"#;

    #[test]
    fn netdata_default_metric_is_context() {
        let point = TelnetDialect::Netdata
            .parse_line(NETDATA_LINE)
            .unwrap()
            .unwrap();
        assert_eq!(point.metric, "system.cpu");
        assert_eq!(point.value, Some(12.5));
        assert_eq!(point.timestamp, Some(1_700_000_000));
        assert_eq!(
            point.tags,
            tags(&[
                ("ksid", "ks1"),
                ("env", "prod"),
                ("host", "web1"),
                ("prefix", "netdata"),
                ("chart_id", "system.cpu"),
                ("chart_name", "system.cpu"),
                ("chart_family", "cpu"),
                ("chart_type", "system"),
                ("units", "percentage"),
                ("id", "user"),
                ("name", "user"),
            ])
        );
    }

    #[test]
    fn netdata_set_metric() {
        let line = NETDATA_LINE.replace("env=\\\"prod\\\"", "%set_metric%=chart_family");
        let point = TelnetDialect::Netdata.parse_line(&line).unwrap().unwrap();
        assert_eq!(point.metric, "cpu");
        assert!(!point.tags.contains_key("chart_family"));
        assert!(!point.tags.contains_key(SET_METRIC_TAG));
        assert_eq!(point.tags["chart_context"], "system.cpu");
    }

    #[test]
    fn netdata_errors() {
        let missing_ksid = NETDATA_LINE.replace("ksid=ks1 ", "");
        assert_eq!(
            TelnetDialect::Netdata.parse_line(&missing_ksid).unwrap_err(),
            TelnetError::MissingKeyset
        );

        let unknown = NETDATA_LINE.replace("env=\\\"prod\\\"", "%set_metric%=units");
        assert_eq!(
            TelnetDialect::Netdata.parse_line(&unknown).unwrap_err(),
            TelnetError::UnknownMetricField("units".into())
        );

        let empty = NETDATA_LINE.replace(
            "\"chart_context\":\"system.cpu\"",
            "\"chart_context\":\"\"",
        );
        assert_eq!(
            TelnetDialect::Netdata.parse_line(&empty).unwrap_err(),
            TelnetError::EmptyMetric("chart_context".into())
        );

        let no_value = NETDATA_LINE.replace("\"value\":12.5,", "");
        assert!(matches!(
            TelnetDialect::Netdata.parse_line(&no_value).unwrap_err(),
            TelnetError::InvalidValue(_)
        ));

        assert!(matches!(
            TelnetDialect::Netdata.parse_line("{not json").unwrap_err(),
            TelnetError::Json(_)
        ));
    }

    #[test]
    fn dialect_sources() {
        assert_eq!(TelnetDialect::OpenTsdb.source(), Source::Telnet);
        assert_eq!(TelnetDialect::Netdata.source(), Source::Netdata);
    }
}
