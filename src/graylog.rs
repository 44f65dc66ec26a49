//! Graylog REST client implementing [`LogBackend`].

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, error};

use crate::backend::LogBackend;
use crate::config::GraylogConfig;
use crate::error::{GraylogMcpError, Result};
use crate::model::{
    AggregateRequest, AggregateTable, Batch, FieldMap, LogMessage, MessageWrapper, SearchParams,
    Sort, StreamInfo, TimeRange,
};

/// Responses larger than this are rejected.
const MAX_RESPONSE_BYTES: usize = 10 * 1024 * 1024;

const QUERY_ID: &str = "q1";
const SEARCH_TYPE_ID: &str = "msgs";

#[derive(Clone)]
pub struct GraylogClient {
    base_url: String,
    username: String,
    password: String,
    http: Client,
}

impl GraylogClient {
    pub fn new(cfg: &GraylogConfig) -> Result<Self> {
        let base_url = cfg
            .url
            .as_deref()
            .ok_or_else(|| GraylogMcpError::Config("GRAYLOG_URL is required".into()))?
            .trim_end_matches('/')
            .to_string();
        let (username, password) = cfg.credentials().ok_or_else(|| {
            GraylogMcpError::Config("Graylog credentials are required".into())
        })?;
        let http = Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .danger_accept_invalid_certs(cfg.tls_skip_verify)
            .build()
            .map_err(|e| GraylogMcpError::Config(format!("http client: {e}")))?;
        Ok(Self {
            base_url,
            username,
            password,
            http,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .basic_auth(&self.username, Some(&self.password))
            .header("Accept", "application/json")
            .header("X-Requested-By", "XMLHttpRequest")
    }

    async fn send<T: DeserializeOwned>(&self, path: &str, req: RequestBuilder) -> Result<T> {
        let resp = req.send().await.map_err(|e| {
            error!(path, "upstream request failed: {e}");
            GraylogMcpError::from(e)
        })?;
        let status = resp.status();
        if resp.content_length().is_some_and(|len| len > MAX_RESPONSE_BYTES as u64) {
            return Err(GraylogMcpError::Upstream(format!(
                "response from {path} exceeds {MAX_RESPONSE_BYTES} bytes"
            )));
        }
        let bytes = resp.bytes().await?;
        if bytes.len() > MAX_RESPONSE_BYTES {
            return Err(GraylogMcpError::Upstream(format!(
                "response from {path} exceeds {MAX_RESPONSE_BYTES} bytes"
            )));
        }
        if !status.is_success() {
            return Err(GraylogMcpError::Api {
                status: status.as_u16(),
                path: path.to_string(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| GraylogMcpError::Upstream(format!("parsing {path} response: {e}")))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send(path, self.request(Method::GET, path)).await
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        self.send(path, self.request(Method::POST, path).json(body)).await
    }
}

// Views search wire types (POST /api/views/search/sync).

#[derive(Debug, Serialize)]
struct ViewsSearchRequest {
    queries: Vec<ViewsQuery>,
}

#[derive(Debug, Serialize)]
struct ViewsQuery {
    id: &'static str,
    timerange: ViewsTimeRange,
    query: ViewsBackendQuery,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<ViewsFilter>,
    search_types: Vec<ViewsSearchType>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ViewsTimeRange {
    Relative { range: u64 },
    Absolute { from: String, to: String },
}

#[derive(Debug, Serialize)]
struct ViewsBackendQuery {
    #[serde(rename = "type")]
    kind: &'static str,
    query_string: String,
}

#[derive(Debug, Serialize)]
struct ViewsFilter {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    filters: Vec<ViewsFilter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ViewsSearchType {
    id: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    limit: usize,
    offset: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    sort: Vec<Sort>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    fields: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ViewsSearchResponse {
    #[serde(default)]
    results: HashMap<String, ViewsQueryResult>,
}

#[derive(Debug, Deserialize)]
struct ViewsQueryResult {
    #[serde(default)]
    search_types: HashMap<String, ViewsSearchTypeResult>,
}

#[derive(Debug, Deserialize)]
struct ViewsSearchTypeResult {
    #[serde(default)]
    total_results: usize,
    #[serde(default)]
    messages: Vec<MessageWrapper>,
}

#[derive(Debug, Deserialize)]
struct MessageEnvelope {
    message: MessageFields,
    #[serde(default)]
    index: String,
}

#[derive(Debug, Deserialize)]
struct MessageFields {
    #[serde(default)]
    fields: FieldMap,
}

#[derive(Debug, Deserialize)]
struct StreamsResponse {
    #[serde(default)]
    streams: Vec<StreamInfo>,
}

#[derive(Debug, Deserialize)]
struct FieldsResponse {
    #[serde(default)]
    fields: Vec<String>,
}

fn build_views_request(params: &SearchParams) -> ViewsSearchRequest {
    let timerange = match &params.time_range {
        TimeRange::Relative(range) => ViewsTimeRange::Relative { range: *range },
        TimeRange::Absolute { from, to } => ViewsTimeRange::Absolute {
            from: from.clone(),
            to: to.clone(),
        },
    };
    let filter = (!params.stream_ids.is_empty()).then(|| ViewsFilter {
        kind: "or",
        filters: params
            .stream_ids
            .iter()
            .map(|id| ViewsFilter {
                kind: "stream",
                filters: Vec::new(),
                id: Some(id.clone()),
            })
            .collect(),
        id: None,
    });

    ViewsSearchRequest {
        queries: vec![ViewsQuery {
            id: QUERY_ID,
            timerange,
            query: ViewsBackendQuery {
                kind: "elasticsearch",
                query_string: params.query.clone(),
            },
            filter,
            search_types: vec![ViewsSearchType {
                id: SEARCH_TYPE_ID,
                kind: "messages",
                limit: params.limit,
                offset: params.offset,
                sort: params.sort.iter().cloned().collect(),
                fields: params.fields.clone(),
            }],
        }],
    }
}

#[async_trait]
impl LogBackend for GraylogClient {
    async fn search(&self, params: &SearchParams) -> Result<Batch> {
        debug!(query = %params.query, limit = params.limit, offset = params.offset, "views search");
        let mut resp: ViewsSearchResponse = self
            .post("/api/views/search/sync", &build_views_request(params))
            .await?;
        let result = resp
            .results
            .remove(QUERY_ID)
            .and_then(|mut q| q.search_types.remove(SEARCH_TYPE_ID));
        Ok(match result {
            Some(st) => Batch {
                messages: st.messages,
                total_results: st.total_results,
            },
            None => Batch::default(),
        })
    }

    async fn get_message(&self, index: &str, id: &str) -> Result<MessageWrapper> {
        let path = format!(
            "/api/messages/{}/{}",
            urlencoding::encode(index),
            urlencoding::encode(id)
        );
        let env: MessageEnvelope = self.get(&path).await?;
        Ok(MessageWrapper {
            message: LogMessage::from(env.message.fields),
            index: if env.index.is_empty() {
                index.to_string()
            } else {
                env.index
            },
        })
    }

    async fn streams(&self) -> Result<Vec<StreamInfo>> {
        let resp: StreamsResponse = self.get("/api/streams").await?;
        Ok(resp.streams)
    }

    async fn fields(&self) -> Result<Vec<String>> {
        let resp: FieldsResponse = self.get("/api/system/fields").await?;
        Ok(resp.fields)
    }

    async fn aggregate(&self, request: &AggregateRequest) -> Result<AggregateTable> {
        self.post("/api/search/aggregate", request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn views_request_for_absolute_range_with_streams_and_sort() {
        let mut params = SearchParams::new(
            "level:ERROR",
            TimeRange::Absolute {
                from: "2024-01-01T00:00:00.000Z".into(),
                to: "2024-01-02T00:00:00.000Z".into(),
            },
        );
        params.limit = 10;
        params.offset = 20;
        params.sort = Some(Sort::desc("timestamp"));
        params.stream_ids = vec!["s1".into()];
        params.fields = vec!["source".into(), "level".into()];

        let v = serde_json::to_value(build_views_request(&params)).unwrap();
        let q = &v["queries"][0];
        assert_eq!(q["id"], "q1");
        assert_eq!(q["timerange"], json!({"type": "absolute", "from": "2024-01-01T00:00:00.000Z", "to": "2024-01-02T00:00:00.000Z"}));
        assert_eq!(q["query"], json!({"type": "elasticsearch", "query_string": "level:ERROR"}));
        assert_eq!(q["filter"], json!({"type": "or", "filters": [{"type": "stream", "id": "s1"}]}));
        let st = &q["search_types"][0];
        assert_eq!(st["limit"], 10);
        assert_eq!(st["offset"], 20);
        assert_eq!(st["sort"], json!([{"field": "timestamp", "order": "DESC"}]));
        assert_eq!(st["fields"], json!(["source", "level"]));
    }

    #[test]
    fn views_request_for_relative_range_omits_optional_parts() {
        let params = SearchParams::new("*", TimeRange::Relative(300));
        let v = serde_json::to_value(build_views_request(&params)).unwrap();
        let q = &v["queries"][0];
        assert_eq!(q["timerange"], json!({"type": "relative", "range": 300}));
        assert!(q.get("filter").is_none());
        assert!(q["search_types"][0].get("sort").is_none());
    }

    #[test]
    fn views_response_decodes_messages() {
        let raw = json!({
            "results": {"q1": {"search_types": {"msgs": {
                "total_results": 42,
                "messages": [{"message": {"_id": "a", "message": "m", "gl2_x": 1}, "index": "graylog_3"}]
            }}}}
        });
        let resp: ViewsSearchResponse = serde_json::from_value(raw).unwrap();
        let st = &resp.results["q1"].search_types["msgs"];
        assert_eq!(st.total_results, 42);
        assert_eq!(st.messages[0].message.id, "a");
        assert_eq!(st.messages[0].index, "graylog_3");
        assert!(st.messages[0].message.extra.is_empty());
    }

    #[test]
    fn client_requires_url_and_credentials() {
        let mut cfg = GraylogConfig::default();
        assert!(GraylogClient::new(&cfg).is_err());
        cfg.url = Some("http://localhost:9000/".into());
        assert!(GraylogClient::new(&cfg).is_err());
        cfg.token = Some("t".into());
        let client = GraylogClient::new(&cfg).unwrap();
        assert_eq!(client.base_url, "http://localhost:9000");
        assert_eq!(client.password, "token");
    }
}
