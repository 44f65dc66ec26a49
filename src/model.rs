use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Open field map of a log message, keyed by field name.
pub type FieldMap = serde_json::Map<String, Value>;

pub const ID_FIELD: &str = "_id";
pub const TIMESTAMP_FIELD: &str = "timestamp";
pub const SOURCE_FIELD: &str = "source";
pub const MESSAGE_FIELD: &str = "message";

/// Graylog stores fields cut by an extractor with this placeholder value.
const CUT_BY_EXTRACTOR: &str = "fullyCutByExtractor";

/// A single log message. Identity fields are typed, everything else passes
/// through untouched in `extra`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "FieldMap")]
pub struct LogMessage {
    #[serde(rename = "_id")]
    pub id: String,
    pub timestamp: String,
    pub source: String,
    #[serde(rename = "message")]
    pub body: String,
    #[serde(flatten)]
    pub extra: FieldMap,
}

impl LogMessage {
    /// Flat view of the message: identity fields, body and extension fields.
    pub fn to_field_map(&self) -> FieldMap {
        let mut map = FieldMap::new();
        map.insert(ID_FIELD.into(), Value::String(self.id.clone()));
        map.insert(TIMESTAMP_FIELD.into(), Value::String(self.timestamp.clone()));
        map.insert(SOURCE_FIELD.into(), Value::String(self.source.clone()));
        map.insert(MESSAGE_FIELD.into(), Value::String(self.body.clone()));
        for (k, v) in &self.extra {
            map.insert(k.clone(), v.clone());
        }
        map
    }
}

impl From<FieldMap> for LogMessage {
    fn from(mut raw: FieldMap) -> Self {
        let mut take = |key: &str| match raw.remove(key) {
            Some(Value::String(s)) => s,
            _ => String::new(),
        };
        let id = take(ID_FIELD);
        let timestamp = take(TIMESTAMP_FIELD);
        let source = take(SOURCE_FIELD);
        let body = take(MESSAGE_FIELD);
        let extra = raw
            .into_iter()
            .filter(|(k, v)| !is_hidden_field(k) && !is_hidden_value(v))
            .collect();
        Self {
            id,
            timestamp,
            source,
            body,
            extra,
        }
    }
}

/// Internal Graylog bookkeeping fields never reach tool output.
fn is_hidden_field(key: &str) -> bool {
    key.starts_with("gl2_")
}

fn is_hidden_value(v: &Value) -> bool {
    matches!(v, Value::String(s) if s == CUT_BY_EXTRACTOR)
}

/// A message together with the index it was read from.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MessageWrapper {
    pub message: LogMessage,
    #[serde(default)]
    pub index: String,
}

/// One page of messages from a single upstream query.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub messages: Vec<MessageWrapper>,
    /// Total matches upstream; may exceed `messages.len()`.
    pub total_results: usize,
}

/// A projected message as it appears in tool output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEntry {
    pub message: FieldMap,
    pub index: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeRange {
    /// Seconds before now.
    Relative(u64),
    Absolute { from: String, to: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sort {
    pub field: String,
    pub order: SortOrder,
}

impl Sort {
    pub fn asc(field: &str) -> Self {
        Self {
            field: field.to_string(),
            order: SortOrder::Asc,
        }
    }

    pub fn desc(field: &str) -> Self {
        Self {
            field: field.to_string(),
            order: SortOrder::Desc,
        }
    }

    /// Parses `field:asc` / `field:desc`.
    pub fn parse(raw: &str) -> Option<Self> {
        let (field, order) = raw.split_once(':')?;
        let field = field.trim();
        if field.is_empty() {
            return None;
        }
        match order.trim().to_ascii_lowercase().as_str() {
            "asc" => Some(Self::asc(field)),
            "desc" => Some(Self::desc(field)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchParams {
    pub query: String,
    pub time_range: TimeRange,
    pub limit: usize,
    pub offset: usize,
    pub fields: Vec<String>,
    pub sort: Option<Sort>,
    pub stream_ids: Vec<String>,
}

impl SearchParams {
    pub fn new(query: impl Into<String>, time_range: TimeRange) -> Self {
        Self {
            query: query.into(),
            time_range,
            limit: 50,
            offset: 0,
            fields: Vec::new(),
            sort: None,
            stream_ids: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamInfo {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub index_set_id: String,
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateTimeRange {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
}

impl From<&TimeRange> for AggregateTimeRange {
    fn from(tr: &TimeRange) -> Self {
        match tr {
            TimeRange::Relative(secs) => Self {
                kind: "relative".into(),
                range: Some(*secs),
                from: None,
                to: None,
            },
            TimeRange::Absolute { from, to } => Self {
                kind: "absolute".into(),
                range: None,
                from: Some(from.clone()),
                to: Some(to.clone()),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Grouping {
    pub field: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricConfiguration {
    pub percentile: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metric {
    pub function: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configuration: Option<MetricConfiguration>,
}

/// Body of `POST /api/search/aggregate`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateRequest {
    pub query: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub streams: Vec<String>,
    pub timerange: AggregateTimeRange,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub group_by: Vec<Grouping>,
    pub metrics: Vec<Metric>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaEntry {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub function: Option<String>,
    #[serde(default)]
    pub column_type: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: String,
}

/// Tabular response of the aggregate endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregateTable {
    #[serde(default)]
    pub schema: Vec<SchemaEntry>,
    #[serde(default)]
    pub datarows: Vec<Vec<Value>>,
    #[serde(default)]
    pub metadata: Value,
}
