//! `aggregate_logs`: metric/grouping parsing and tabular result shaping.

use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::backend::LogBackend;
use crate::error::{GraylogMcpError, Result};
use crate::fit::{fit_result, halved, Fitted, Shrinkable};
use crate::model::{
    AggregateRequest, AggregateTable, AggregateTimeRange, FieldMap, Grouping, Metric,
    MetricConfiguration, TimeRange,
};

const FUNCTIONS: [&str; 11] = [
    "count",
    "avg",
    "min",
    "max",
    "sum",
    "stddev",
    "variance",
    "card",
    "percentile",
    "latest",
    "sumofsquares",
];

/// Analyzed full-text fields have no keyword form to bucket on.
const NON_AGGREGATABLE: [&str; 2] = ["message", "full_message"];

const SCRIPT_EXCEPTION_HINT: &str = "Aggregation failed: Elasticsearch cannot group by one or more of the requested fields. Analyzed text fields (e.g. 'message', 'full_message') are not supported in group_by - use keyword fields like 'source', 'level', 'facility' instead.";

#[derive(Debug, Clone)]
pub struct AggregateQuery {
    pub query: String,
    pub time_range: TimeRange,
    pub stream_ids: Vec<String>,
    pub group_by: Vec<Grouping>,
    pub metrics: Vec<Metric>,
    pub max_result_size: usize,
}

/// Parses `count`, `count:field`, `fn:field` and `percentile:field:value`
/// entries. `sort` (`asc`/`desc`) applies to the first metric only.
pub fn parse_metrics(raw: &str, sort: Option<&str>) -> Result<Vec<Metric>> {
    let sort = match sort.map(|s| s.trim().to_ascii_lowercase()) {
        None => None,
        Some(s) if s.is_empty() => None,
        Some(s) if s == "asc" || s == "desc" => Some(s),
        Some(s) => {
            return Err(GraylogMcpError::InvalidRequest(format!(
                "'sort' must be 'asc' or 'desc', got '{s}'"
            )))
        }
    };

    let mut metrics = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let mut segments = part.splitn(3, ':').map(str::trim);
        let function = segments.next().unwrap_or_default().to_ascii_lowercase();
        let field = segments.next().filter(|f| !f.is_empty()).map(str::to_string);
        let extra = segments.next();

        if !FUNCTIONS.contains(&function.as_str()) {
            return Err(GraylogMcpError::InvalidRequest(format!(
                "unknown aggregation function '{function}'. Valid functions: {}",
                FUNCTIONS.join(", ")
            )));
        }

        let mut metric = Metric {
            function: function.clone(),
            field,
            sort: None,
            configuration: None,
        };
        match function.as_str() {
            "count" => {}
            "percentile" => {
                let (Some(_), Some(value)) = (&metric.field, extra) else {
                    return Err(GraylogMcpError::InvalidRequest(
                        "percentile requires format 'percentile:field:value' (e.g. 'percentile:took_ms:95')".into(),
                    ));
                };
                let percentile = value
                    .parse::<f64>()
                    .ok()
                    .filter(|p| *p > 0.0 && *p <= 100.0)
                    .ok_or_else(|| {
                        GraylogMcpError::InvalidRequest(format!(
                            "percentile value must be a number between 0 and 100, got '{value}'"
                        ))
                    })?;
                metric.configuration = Some(MetricConfiguration { percentile });
            }
            _ if metric.field.is_none() => {
                return Err(GraylogMcpError::InvalidRequest(format!(
                    "'{function}' requires a field (e.g. '{function}:field_name')"
                )));
            }
            _ => {}
        }
        if metrics.is_empty() {
            metric.sort = sort.clone();
        }
        metrics.push(metric);
    }

    if metrics.is_empty() {
        return Err(GraylogMcpError::InvalidRequest(
            "at least one metric is required".into(),
        ));
    }
    Ok(metrics)
}

/// Parses a comma separated grouping list; `limit == 0` leaves the
/// per-field bucket count to the server.
pub fn parse_group_by(raw: &str, limit: usize) -> Result<Vec<Grouping>> {
    let groups: Vec<Grouping> = raw
        .split(',')
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(|field| Grouping {
            field: field.to_string(),
            limit: (limit > 0).then_some(limit),
        })
        .collect();

    if groups.is_empty() {
        return Err(GraylogMcpError::InvalidRequest(
            "'group_by' must contain at least one non-empty field name".into(),
        ));
    }
    if let Some(g) = groups
        .iter()
        .find(|g| NON_AGGREGATABLE.contains(&g.field.as_str()))
    {
        return Err(GraylogMcpError::InvalidRequest(format!(
            "field '{}' is a full-text analyzed field and cannot be used for group_by aggregation. Use keyword fields like 'source', 'level', 'facility', or your own indexed keyword fields instead.",
            g.field
        )));
    }
    Ok(groups)
}

/// Zips each data row with the schema column names. Short rows just
/// lack the trailing columns.
pub fn rows_from_table(table: &AggregateTable) -> Vec<FieldMap> {
    table
        .datarows
        .iter()
        .map(|row| {
            table
                .schema
                .iter()
                .zip(row)
                .map(|(col, value)| (col.name.clone(), value.clone()))
                .collect()
        })
        .collect()
}

pub async fn aggregate_logs(backend: &dyn LogBackend, query: AggregateQuery) -> Result<Fitted> {
    let request = AggregateRequest {
        query: query.query,
        streams: query.stream_ids,
        timerange: AggregateTimeRange::from(&query.time_range),
        group_by: query.group_by,
        metrics: query.metrics,
    };

    let table = backend.aggregate(&request).await.map_err(|e| match e {
        GraylogMcpError::Api { status: 400, ref body, .. } if body.contains("script_exception") => {
            GraylogMcpError::InvalidRequest(SCRIPT_EXCEPTION_HINT.into())
        }
        other => other,
    })?;

    let rows = rows_from_table(&table);
    debug!(rows = rows.len(), "aggregation returned");
    let mut result = AggregateResult {
        total_rows: rows.len(),
        rows,
        metadata: table.metadata,
        rows_truncated: false,
        response_truncated: false,
    };
    fit_result(&mut result, query.max_result_size)
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregateResult {
    pub rows: Vec<FieldMap>,
    pub total_rows: usize,
    pub metadata: Value,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub rows_truncated: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub response_truncated: bool,
}

impl Shrinkable for AggregateResult {
    /// Rows hold scalars only.
    fn truncate_content(&mut self, _max_len: usize) {}

    fn reduce_count(&mut self) -> bool {
        let Some(n) = halved(self.rows.len()) else {
            return false;
        };
        self.rows.truncate(n);
        self.rows_truncated = true;
        true
    }

    fn mark_truncated(&mut self) {
        self.response_truncated = true;
    }

    fn fallback(&self) -> Option<Value> {
        Some(json!({
            "total_rows": self.total_rows,
            "metadata": self.metadata,
            "response_truncated": true,
            "error": "Aggregation response too large even after truncation. Try reducing group_limit or using fewer group_by fields.",
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Batch, MessageWrapper, SchemaEntry, SearchParams, StreamInfo};
    use async_trait::async_trait;

    #[test]
    fn metrics_parse_with_fields_and_sort_on_first() {
        let m = parse_metrics("count, avg:took_ms ,percentile:took_ms:95", Some("DESC")).unwrap();
        assert_eq!(m.len(), 3);
        assert_eq!(m[0].function, "count");
        assert_eq!(m[0].field, None);
        assert_eq!(m[0].sort.as_deref(), Some("desc"));
        assert_eq!(m[1].field.as_deref(), Some("took_ms"));
        assert_eq!(m[1].sort, None);
        assert_eq!(m[2].configuration, Some(MetricConfiguration { percentile: 95.0 }));
    }

    #[test]
    fn metric_errors() {
        for bad in ["median:x", "avg", "avg:", "percentile:x", "percentile:x:0", "percentile:x:101", "percentile:x:abc", " , "] {
            let err = parse_metrics(bad, None).unwrap_err();
            assert!(err.is_validation(), "{bad}");
        }
        assert!(parse_metrics("count", Some("sideways")).is_err());
    }

    #[test]
    fn group_by_rejects_full_text_fields() {
        let err = parse_group_by("source, message", 10).unwrap_err();
        assert!(err.to_string().contains("'message'"));
        assert!(parse_group_by(" , ", 10).is_err());

        let g = parse_group_by("source,level", 0).unwrap();
        assert_eq!(g.len(), 2);
        assert_eq!(g[0].limit, None);
        assert_eq!(parse_group_by("source", 3).unwrap()[0].limit, Some(3));
    }

    fn table(rows: usize) -> AggregateTable {
        let col = |name: &str| SchemaEntry {
            name: name.into(),
            field: None,
            function: None,
            column_type: None,
            kind: String::new(),
        };
        AggregateTable {
            schema: vec![col("grouping: source"), col("metric: count()")],
            datarows: (0..rows)
                .map(|i| vec![json!(format!("host-{i}")), json!(i)])
                .collect(),
            metadata: json!({"effective_timerange": {"type": "relative"}}),
        }
    }

    #[test]
    fn rows_are_keyed_by_schema_name() {
        let mut t = table(2);
        t.datarows.push(vec![json!("short")]);
        let rows = rows_from_table(&t);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1]["grouping: source"], "host-1");
        assert_eq!(rows[1]["metric: count()"], 1);
        assert_eq!(rows[2].len(), 1);
    }

    struct TableBackend(Result<AggregateTable>);

    #[async_trait]
    impl LogBackend for TableBackend {
        async fn search(&self, _params: &SearchParams) -> Result<Batch> {
            Ok(Batch::default())
        }
        async fn get_message(&self, _index: &str, _id: &str) -> Result<MessageWrapper> {
            Err(GraylogMcpError::Upstream("unused".into()))
        }
        async fn streams(&self) -> Result<Vec<StreamInfo>> {
            Ok(Vec::new())
        }
        async fn fields(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        async fn aggregate(&self, _request: &AggregateRequest) -> Result<AggregateTable> {
            match &self.0 {
                Ok(t) => Ok(t.clone()),
                Err(GraylogMcpError::Api { status, path, body }) => Err(GraylogMcpError::Api {
                    status: *status,
                    path: path.clone(),
                    body: body.clone(),
                }),
                Err(e) => Err(GraylogMcpError::Upstream(e.to_string())),
            }
        }
    }

    fn query(budget: usize) -> AggregateQuery {
        AggregateQuery {
            query: "*".into(),
            time_range: TimeRange::Relative(300),
            stream_ids: Vec::new(),
            group_by: parse_group_by("source", 10).unwrap(),
            metrics: parse_metrics("count", None).unwrap(),
            max_result_size: budget,
        }
    }

    #[tokio::test]
    async fn oversized_tables_lose_rows() {
        let backend = TableBackend(Ok(table(200)));
        let fitted = aggregate_logs(&backend, query(2_000)).await.unwrap();
        let v: Value = serde_json::from_str(&fitted.body).unwrap();
        assert_eq!(v["total_rows"], 200);
        assert_eq!(v["rows_truncated"], true);
        assert!(v["rows"].as_array().unwrap().len() < 200);
        assert!(fitted.body.len() <= 2_000);
    }

    #[tokio::test]
    async fn script_exception_is_explained() {
        let backend = TableBackend(Err(GraylogMcpError::Api {
            status: 400,
            path: "/api/search/aggregate".into(),
            body: r#"{"type":"script_exception"}"#.into(),
        }));
        let err = aggregate_logs(&backend, query(50_000)).await.unwrap_err();
        assert!(err.to_string().starts_with("Aggregation failed: Elasticsearch cannot group"));
    }
}
