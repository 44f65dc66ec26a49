use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info};

use crate::error::Result;
use crate::tools::ToolRegistry;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;

#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    /// Absent for notifications.
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl RpcRequest {
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl RpcResponse {
    fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(RpcError { code, message }),
        }
    }
}

/// Decodes one frame and handles it. `None` means nothing is sent back.
pub async fn handle_frame(tools: &ToolRegistry, frame: &str) -> Option<RpcResponse> {
    match serde_json::from_str::<RpcRequest>(frame) {
        Ok(req) => handle_request(tools, req).await,
        Err(e) => Some(RpcResponse::error(
            Value::Null,
            PARSE_ERROR,
            format!("parse error: {e}"),
        )),
    }
}

pub async fn handle_request(tools: &ToolRegistry, req: RpcRequest) -> Option<RpcResponse> {
    if req.is_notification() {
        debug!(method = %req.method, "notification");
        return None;
    }
    let id = req.id.clone().unwrap_or(Value::Null);

    let resp = match req.method.as_str() {
        "initialize" => RpcResponse::ok(id, initialize_result()),
        "ping" => RpcResponse::ok(id, json!({})),
        "tools/list" => RpcResponse::ok(id, json!({ "tools": tools.definitions() })),
        "tools/call" => handle_tool_call(tools, id, &req.params).await,
        "" => RpcResponse::error(id, INVALID_REQUEST, "missing method".into()),
        other => RpcResponse::error(id, METHOD_NOT_FOUND, format!("method not found: {other}")),
    };
    Some(resp)
}

async fn handle_tool_call(tools: &ToolRegistry, id: Value, params: &Value) -> RpcResponse {
    let Some(name) = params.get("name").and_then(Value::as_str) else {
        return RpcResponse::error(id, INVALID_PARAMS, "invalid params: missing tool name".into());
    };
    let arguments = params.get("arguments").unwrap_or(&Value::Null);
    debug!(tool = name, "tools/call");

    match tools.call(name, arguments).await {
        Ok(output) => RpcResponse::ok(id, output.to_value()),
        Err(e) => RpcResponse::error(id, INVALID_PARAMS, e.to_string()),
    }
}

fn initialize_result() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {
            "tools": {}
        },
        "serverInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION")
        }
    })
}

/// Newline-delimited JSON-RPC over stdin/stdout until stdin closes.
pub async fn run_stdio(tools: Arc<ToolRegistry>) -> Result<()> {
    info!("serving MCP over stdio");
    serve_lines(&tools, BufReader::new(tokio::io::stdin()), tokio::io::stdout()).await
}

pub async fn serve_lines<R, W>(tools: &ToolRegistry, input: R, mut output: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        if let Some(resp) = handle_frame(tools, &line).await {
            write_response(&mut output, &resp).await?;
        }
    }
    Ok(())
}

async fn write_response<W: AsyncWrite + Unpin>(out: &mut W, resp: &RpcResponse) -> Result<()> {
    let line = serde_json::to_string(resp)?;
    out.write_all(line.as_bytes()).await?;
    out.write_all(b"\n").await?;
    out.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LogBackend;
    use crate::config::LimitsConfig;
    use crate::error::GraylogMcpError;
    use crate::model::{
        AggregateRequest, AggregateTable, Batch, MessageWrapper, SearchParams, StreamInfo,
    };
    use async_trait::async_trait;

    struct Offline;

    #[async_trait]
    impl LogBackend for Offline {
        async fn search(&self, _params: &SearchParams) -> Result<Batch> {
            Err(GraylogMcpError::Upstream("connection refused".into()))
        }
        async fn get_message(&self, _index: &str, _id: &str) -> Result<MessageWrapper> {
            Err(GraylogMcpError::Upstream("connection refused".into()))
        }
        async fn streams(&self) -> Result<Vec<StreamInfo>> {
            Ok(Vec::new())
        }
        async fn fields(&self) -> Result<Vec<String>> {
            Ok(vec!["source".into(), "level".into()])
        }
        async fn aggregate(&self, _request: &AggregateRequest) -> Result<AggregateTable> {
            Ok(AggregateTable::default())
        }
    }

    fn registry() -> ToolRegistry {
        ToolRegistry::new(Arc::new(Offline), LimitsConfig::default())
    }

    async fn roundtrip(frame: &str) -> Value {
        let resp = handle_frame(&registry(), frame).await.unwrap();
        serde_json::to_value(resp).unwrap()
    }

    #[tokio::test]
    async fn initialize_reports_tools_capability() {
        let v = roundtrip(r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#).await;
        assert_eq!(v["id"], 1);
        assert_eq!(v["result"]["protocolVersion"], PROTOCOL_VERSION);
        assert!(v["result"]["capabilities"]["tools"].is_object());
    }

    #[tokio::test]
    async fn notifications_get_no_response() {
        let resp = handle_frame(
            &registry(),
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
        )
        .await;
        assert!(resp.is_none());
    }

    #[tokio::test]
    async fn tools_list_names_every_tool() {
        let v = roundtrip(r#"{"jsonrpc":"2.0","id":"a","method":"tools/list"}"#).await;
        let names: Vec<&str> = v["result"]["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(
            names,
            vec!["search_logs", "get_log_context", "aggregate_logs", "list_streams", "list_fields"]
        );
    }

    #[tokio::test]
    async fn tool_failures_are_tool_results() {
        let v = roundtrip(
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"search_logs","arguments":{"query":"*"}}}"#,
        )
        .await;
        assert_eq!(v["result"]["isError"], true);
        assert_eq!(
            v["result"]["content"][0]["text"],
            "Search failed: upstream request failed: connection refused"
        );
    }

    #[tokio::test]
    async fn list_fields_is_sorted() {
        let v = roundtrip(
            r#"{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{"name":"list_fields"}}"#,
        )
        .await;
        let text = v["result"]["content"][0]["text"].as_str().unwrap();
        let body: Value = serde_json::from_str(text).unwrap();
        assert_eq!(body, json!({"fields": ["level", "source"], "total": 2}));
    }

    #[tokio::test]
    async fn protocol_errors_use_rpc_codes() {
        let v = roundtrip("{not json").await;
        assert_eq!(v["error"]["code"], PARSE_ERROR);
        assert!(v["id"].is_null());

        let v = roundtrip(r#"{"jsonrpc":"2.0","id":4,"method":"resources/list"}"#).await;
        assert_eq!(v["error"]["code"], METHOD_NOT_FOUND);

        let v = roundtrip(
            r#"{"jsonrpc":"2.0","id":5,"method":"tools/call","params":{"name":"drop_tables"}}"#,
        )
        .await;
        assert_eq!(v["error"]["code"], INVALID_PARAMS);
        assert!(v["error"]["message"].as_str().unwrap().contains("unknown tool"));
    }

    #[tokio::test]
    async fn serve_lines_writes_one_frame_per_request() {
        let input = concat!(
            r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#,
            "\n\n",
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
            "\n",
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#,
            "\n"
        );
        let mut out = Vec::new();
        serve_lines(&registry(), input.as_bytes(), &mut out).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        let frames: Vec<Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0]["id"], 1);
        assert_eq!(frames[1]["id"], 2);
    }
}
