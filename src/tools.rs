//! Tool registry: argument parsing, validation and dispatch.

use std::sync::Arc;

use chrono::DateTime;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::error;

use crate::aggregate::{aggregate_logs, parse_group_by, parse_metrics, AggregateQuery};
use crate::backend::LogBackend;
use crate::config::LimitsConfig;
use crate::context::{ContextAssembler, ContextRequest, ContextResult, Overfetch};
use crate::error::{GraylogMcpError, Result};
use crate::fit::{fit_result, Fitted};
use crate::model::{FieldMap, SearchParams, Sort, TimeRange};
use crate::projection::FieldSelection;
use crate::search::{SearchEngine, SearchMode, SearchRequest};

/// Result of one `tools/call`, rendered as a single text content item.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub text: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn success(text: String) -> Self {
        Self {
            text,
            is_error: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: true,
        }
    }

    fn from_json<T: Serialize>(value: &T) -> Self {
        match serde_json::to_string(value) {
            Ok(text) => Self::success(text),
            Err(e) => Self::error(GraylogMcpError::from(e).to_string()),
        }
    }

    fn from_fitted(res: Result<Fitted>, action: &str) -> Self {
        match res {
            Ok(fitted) => Self::success(fitted.body),
            Err(e) => Self::failure(action, e),
        }
    }

    /// Validation and API errors are already descriptive; anything else is
    /// prefixed with the failed action.
    fn failure(action: &str, e: GraylogMcpError) -> Self {
        match e {
            GraylogMcpError::InvalidRequest(_) => Self::error(e.to_string()),
            GraylogMcpError::Api { .. } => {
                error!("{action} failed: {e}");
                Self::error(e.to_string())
            }
            _ => {
                error!("{action} failed: {e}");
                Self::error(format!("{action} failed: {e}"))
            }
        }
    }

    /// MCP `CallToolResult` shape.
    pub fn to_value(&self) -> Value {
        json!({
            "content": [{ "type": "text", "text": self.text }],
            "isError": self.is_error,
        })
    }
}

pub struct ToolRegistry {
    backend: Arc<dyn LogBackend>,
    limits: LimitsConfig,
    search: SearchEngine,
}

impl ToolRegistry {
    pub fn new(backend: Arc<dyn LogBackend>, limits: LimitsConfig) -> Self {
        Self {
            search: SearchEngine::new(backend.clone(), limits.clone()),
            backend,
            limits,
        }
    }

    /// Runs a tool. `Err` only for an unknown tool or a malformed argument
    /// container; everything else becomes an error result.
    pub async fn call(&self, name: &str, arguments: &Value) -> Result<ToolOutput> {
        let args = Args::new(arguments)?;
        let output = match name {
            "search_logs" => self.search_logs(&args).await,
            "get_log_context" => self.get_log_context(&args).await,
            "aggregate_logs" => self.aggregate_logs(&args).await,
            "list_streams" => self.list_streams(&args).await,
            "list_fields" => self.list_fields(&args).await,
            _ => {
                return Err(GraylogMcpError::InvalidRequest(format!(
                    "unknown tool: {name}"
                )))
            }
        };
        Ok(output)
    }

    async fn search_logs(&self, args: &Args<'_>) -> ToolOutput {
        let request = match self.search_request(args) {
            Ok(r) => r,
            Err(e) => return ToolOutput::failure("Search", e),
        };
        ToolOutput::from_fitted(self.search.search(request).await, "Search")
    }

    fn search_request(&self, args: &Args<'_>) -> Result<SearchRequest> {
        let query = args.required_str("query")?;
        let time_range = args.time_range(self.limits.default_range_secs)?;

        let mut limit = args.uint("limit", self.limits.default_search_limit)?;
        if limit == 0 {
            limit = self.limits.default_search_limit;
        }
        let limit = limit.min(self.limits.max_search_limit);
        let offset = args.uint("offset", 0)?;

        let sort = match args.str("sort")? {
            Some(raw) => Some(Sort::parse(raw).ok_or_else(|| {
                GraylogMcpError::InvalidRequest(format!(
                    "'sort' must be 'field:asc' or 'field:desc', got '{raw}'"
                ))
            })?),
            None => None,
        };

        let mode = match (args.bool("deduplicate")?, args.bool("templateize")?) {
            (true, true) => {
                return Err(GraylogMcpError::InvalidRequest(
                    "'deduplicate' and 'templateize' are mutually exclusive".into(),
                ))
            }
            (true, false) => SearchMode::Deduplicate,
            (false, true) => SearchMode::Templateize,
            (false, false) => SearchMode::Plain,
        };

        let fields = args.fields()?;
        let mut params = SearchParams::new(query, time_range);
        params.limit = limit;
        params.offset = offset;
        params.sort = sort;
        params.fields = fields.names().to_vec();
        params.stream_ids = args.stream_ids()?;

        Ok(SearchRequest {
            params,
            fields,
            mode,
            truncate_message: args.uint("truncate_message", 0)?,
            max_result_size: args.uint("max_result_size", self.limits.max_result_size)?,
        })
    }

    async fn get_log_context(&self, args: &Args<'_>) -> ToolOutput {
        let parsed = (|| -> Result<_> {
            let message_id = args.required_str("message_id")?;
            let index = args.required_str("index")?;
            let request = ContextRequest {
                before: args.uint("before", 5)?.min(self.limits.context_max_side),
                after: args.uint("after", 5)?.min(self.limits.context_max_side),
                stream_ids: args.stream_ids()?,
                fields: args.fields()?,
            };
            Ok((message_id, index, request))
        })();
        let (message_id, index, request) = match parsed {
            Ok(p) => p,
            Err(e) => return ToolOutput::failure("Get message", e),
        };

        let assembler = ContextAssembler::new(
            self.backend.as_ref(),
            Overfetch {
                multiplier: self.limits.context_overfetch_multiplier,
                ceiling: self.limits.context_fetch_ceiling,
            },
        );
        let window = match assembler.assemble(message_id, index, &request).await {
            Ok(w) => w,
            Err(e) => return ToolOutput::failure("Get message", e),
        };
        let mut result = ContextResult::from_window(&window, &request.fields);
        ToolOutput::from_fitted(
            fit_result(&mut result, self.limits.context_result_size),
            "Get context",
        )
    }

    async fn aggregate_logs(&self, args: &Args<'_>) -> ToolOutput {
        let parsed = (|| -> Result<AggregateQuery> {
            let query = args.required_str("query")?;
            let metrics = parse_metrics(args.required_str("metrics")?, args.str("sort")?)?;
            let time_range = args.time_range(self.limits.default_range_secs)?;
            let group_limit = args.uint("group_limit", self.limits.default_group_limit)?;
            let group_by = parse_group_by(args.required_str("group_by")?, group_limit)?;
            Ok(AggregateQuery {
                query: query.to_string(),
                time_range,
                stream_ids: args.stream_ids()?,
                group_by,
                metrics,
                max_result_size: self.limits.max_result_size,
            })
        })();
        match parsed {
            Ok(query) => ToolOutput::from_fitted(
                aggregate_logs(self.backend.as_ref(), query).await,
                "Aggregate",
            ),
            Err(e) => ToolOutput::failure("Aggregate", e),
        }
    }

    async fn list_streams(&self, args: &Args<'_>) -> ToolOutput {
        let filter = match args.str("title_filter") {
            Ok(f) => f.map(str::to_lowercase),
            Err(e) => return ToolOutput::failure("Get streams", e),
        };
        let streams = match self.backend.streams().await {
            Ok(s) => s,
            Err(e) => return ToolOutput::failure("Get streams", e),
        };

        let streams: Vec<StreamSummary> = streams
            .into_iter()
            .filter(|s| !s.disabled)
            .filter(|s| {
                filter
                    .as_deref()
                    .map_or(true, |f| s.title.to_lowercase().contains(f))
            })
            .map(|s| StreamSummary {
                id: s.id,
                title: s.title,
                description: s.description,
                index_set_id: s.index_set_id,
            })
            .collect();
        ToolOutput::from_json(&StreamList {
            total: streams.len(),
            streams,
        })
    }

    async fn list_fields(&self, args: &Args<'_>) -> ToolOutput {
        let filter = match args.str("name_filter") {
            Ok(f) => f.map(str::to_lowercase),
            Err(e) => return ToolOutput::failure("Get fields", e),
        };
        let mut fields = match self.backend.fields().await {
            Ok(f) => f,
            Err(e) => return ToolOutput::failure("Get fields", e),
        };
        if let Some(f) = &filter {
            fields.retain(|name| name.to_lowercase().contains(f.as_str()));
        }
        fields.sort();
        fields.dedup();
        ToolOutput::from_json(&FieldList {
            total: fields.len(),
            fields,
        })
    }

    /// `tools/list` payload.
    pub fn definitions(&self) -> Vec<Value> {
        vec![
            json!({
                "name": "search_logs",
                "description": "Search Graylog logs using Lucene query syntax. Returns matching messages, optionally deduplicated or grouped into templates.",
                "inputSchema": {
                    "type": "object",
                    "required": ["query"],
                    "properties": {
                        "query": { "type": "string", "description": "Lucene query string (e.g. 'level:ERROR AND service:auth')" },
                        "stream_id": { "type": "string", "description": "Graylog stream ID to search within" },
                        "range": { "type": "integer", "description": "Relative time range in seconds (default: 300). Ignored if from/to are set." },
                        "from": { "type": "string", "description": "Start time, RFC 3339 (e.g. '2024-01-15T10:00:00.000Z'). Must be used with 'to'." },
                        "to": { "type": "string", "description": "End time, RFC 3339. Must be used with 'from'." },
                        "limit": { "type": "integer", "description": "Maximum number of messages (default: 50, max: 10000)" },
                        "offset": { "type": "integer", "description": "Messages to skip for pagination (default: 0)" },
                        "fields": { "type": "string", "description": "Comma-separated fields to return (e.g. 'timestamp,source,message,level')" },
                        "sort": { "type": "string", "description": "'field:asc' or 'field:desc' (e.g. 'timestamp:desc')" },
                        "deduplicate": { "type": "boolean", "description": "Collapse identical messages and report counts" },
                        "templateize": { "type": "boolean", "description": "Group messages into log templates with counts. Cannot be combined with deduplicate." },
                        "truncate_message": { "type": "integer", "description": "Truncate message bodies to N bytes (0 = off)" },
                        "max_result_size": { "type": "integer", "description": "Maximum response size in bytes (default: 50000, 0 = no limit)" }
                    }
                }
            }),
            json!({
                "name": "get_log_context",
                "description": "Get the log messages surrounding a specific message.",
                "inputSchema": {
                    "type": "object",
                    "required": ["message_id", "index"],
                    "properties": {
                        "message_id": { "type": "string", "description": "The _id of the target message" },
                        "index": { "type": "string", "description": "The index holding the target message" },
                        "before": { "type": "integer", "description": "Messages before the target (default: 5, max: 500)" },
                        "after": { "type": "integer", "description": "Messages after the target (default: 5, max: 500)" },
                        "fields": { "type": "string", "description": "Comma-separated fields to return" },
                        "stream_id": { "type": "string", "description": "Restrict context to a stream" }
                    }
                }
            }),
            json!({
                "name": "aggregate_logs",
                "description": "Aggregate Graylog logs with statistical functions grouped by fields.",
                "inputSchema": {
                    "type": "object",
                    "required": ["query", "metrics", "group_by"],
                    "properties": {
                        "query": { "type": "string", "description": "Lucene query string" },
                        "metrics": { "type": "string", "description": "Comma-separated metrics: 'count', 'avg:field', 'min:field', 'max:field', 'sum:field', 'percentile:field:value', 'card:field', 'stddev:field', 'variance:field', 'latest:field', 'sumofsquares:field'" },
                        "group_by": { "type": "string", "description": "Comma-separated fields to group by (e.g. 'source,level')" },
                        "group_limit": { "type": "integer", "description": "Maximum groups per field (default: 10)" },
                        "stream_id": { "type": "string", "description": "Graylog stream ID to search within" },
                        "range": { "type": "integer", "description": "Relative time range in seconds (default: 300)" },
                        "from": { "type": "string", "description": "Start time, RFC 3339. Must be used with 'to'." },
                        "to": { "type": "string", "description": "End time, RFC 3339. Must be used with 'from'." },
                        "sort": { "type": "string", "description": "Sort direction for the first metric: 'asc' or 'desc'" }
                    }
                }
            }),
            json!({
                "name": "list_streams",
                "description": "List enabled Graylog streams.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "title_filter": { "type": "string", "description": "Case-insensitive substring filter on stream titles" }
                    }
                }
            }),
            json!({
                "name": "list_fields",
                "description": "List log field names known to Graylog.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "name_filter": { "type": "string", "description": "Case-insensitive substring filter on field names" }
                    }
                }
            }),
        ]
    }
}

#[derive(Debug, Serialize)]
struct StreamList {
    streams: Vec<StreamSummary>,
    total: usize,
}

#[derive(Debug, Serialize)]
struct FieldList {
    fields: Vec<String>,
    total: usize,
}

#[derive(Debug, Serialize)]
struct StreamSummary {
    id: String,
    title: String,
    description: String,
    index_set_id: String,
}

/// Integer arguments above this are rejected as out of range.
const MAX_INT_ARG: u64 = i32::MAX as u64;

/// Typed view over a tool's argument object. Absent and `null` values
/// mean "use the default".
struct Args<'a> {
    map: Option<&'a FieldMap>,
}

impl<'a> Args<'a> {
    fn new(value: &'a Value) -> Result<Self> {
        match value {
            Value::Null => Ok(Self { map: None }),
            Value::Object(map) => Ok(Self { map: Some(map) }),
            _ => Err(GraylogMcpError::InvalidRequest(
                "tool arguments must be an object".into(),
            )),
        }
    }

    fn get(&self, key: &str) -> Option<&'a Value> {
        self.map?.get(key).filter(|v| !v.is_null())
    }

    /// Empty strings count as absent.
    fn str(&self, key: &str) -> Result<Option<&'a str>> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.as_str())),
            Some(_) => Err(GraylogMcpError::InvalidRequest(format!(
                "'{key}' must be a string"
            ))),
        }
    }

    fn required_str(&self, key: &str) -> Result<&'a str> {
        self.str(key)?.ok_or_else(|| {
            GraylogMcpError::InvalidRequest(format!("'{key}' parameter is required"))
        })
    }

    fn bool(&self, key: &str) -> Result<bool> {
        match self.get(key) {
            None => Ok(false),
            Some(Value::Bool(b)) => Ok(*b),
            Some(_) => Err(GraylogMcpError::InvalidRequest(format!(
                "'{key}' must be a boolean"
            ))),
        }
    }

    /// Strict non-negative integer: fractional, negative, out-of-range
    /// and non-numeric values are all rejected.
    fn uint(&self, key: &str, default: usize) -> Result<usize> {
        let Some(value) = self.get(key) else {
            return Ok(default);
        };
        let invalid = |what: &str| GraylogMcpError::InvalidRequest(format!("'{key}' {what}"));
        let Value::Number(n) = value else {
            return Err(invalid("must be an integer"));
        };

        let n = if let Some(u) = n.as_u64() {
            u
        } else if n.as_i64().is_some() {
            return Err(invalid("must be >= 0"));
        } else {
            let f = n.as_f64().ok_or_else(|| invalid("must be an integer"))?;
            if !f.is_finite() || f.fract() != 0.0 {
                return Err(invalid("must be an integer"));
            }
            if f < 0.0 {
                return Err(invalid("must be >= 0"));
            }
            if f > MAX_INT_ARG as f64 {
                return Err(invalid("is out of range"));
            }
            f as u64
        };
        if n > MAX_INT_ARG {
            return Err(invalid("is out of range"));
        }
        usize::try_from(n).map_err(|_| invalid("is out of range"))
    }

    fn fields(&self) -> Result<FieldSelection> {
        Ok(self
            .str("fields")?
            .map(FieldSelection::parse)
            .unwrap_or_default())
    }

    fn stream_ids(&self) -> Result<Vec<String>> {
        Ok(self
            .str("stream_id")?
            .map(|s| vec![s.trim().to_string()])
            .unwrap_or_default())
    }

    /// `from`/`to` (both RFC 3339, `from <= to`) or a relative `range`.
    fn time_range(&self, default_secs: u64) -> Result<TimeRange> {
        match (self.str("from")?, self.str("to")?) {
            (Some(from), Some(to)) => {
                let start = parse_instant("from", from)?;
                let end = parse_instant("to", to)?;
                if start > end {
                    return Err(GraylogMcpError::InvalidRequest(
                        "'from' must not be after 'to'".into(),
                    ));
                }
                Ok(TimeRange::Absolute {
                    from: from.to_string(),
                    to: to.to_string(),
                })
            }
            (None, None) => {
                let range = self.uint("range", 0)? as u64;
                Ok(TimeRange::Relative(if range == 0 { default_secs } else { range }))
            }
            _ => Err(GraylogMcpError::InvalidRequest(
                "'from' and 'to' must be used together".into(),
            )),
        }
    }
}

fn parse_instant(key: &str, raw: &str) -> Result<DateTime<chrono::FixedOffset>> {
    DateTime::parse_from_rfc3339(raw).map_err(|e| {
        GraylogMcpError::InvalidRequest(format!(
            "'{key}' must be an RFC 3339 timestamp (e.g. '2024-01-15T10:00:00.000Z'): {e}"
        ))
    })
}
