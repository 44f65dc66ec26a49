#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use graylog_mcp::backend::LogBackend;
use graylog_mcp::config::LimitsConfig;
use graylog_mcp::error::{GraylogMcpError, Result};
use graylog_mcp::model::{
    AggregateRequest, AggregateTable, Batch, FieldMap, LogMessage, MessageWrapper, SearchParams,
    SortOrder, StreamInfo, TimeRange,
};
use graylog_mcp::tools::{ToolOutput, ToolRegistry};

/// In-memory log store. Timestamps share one RFC 3339 layout, so string
/// order is time order; ties keep insertion order.
#[derive(Default)]
pub struct ScriptedBackend {
    pub messages: Vec<MessageWrapper>,
    pub streams: Vec<StreamInfo>,
    pub fields: Vec<String>,
    pub fail_sort: Option<SortOrder>,
    pub searches: Mutex<Vec<SearchParams>>,
    pub aggregates: Mutex<Vec<AggregateRequest>>,
}

impl ScriptedBackend {
    pub fn with_messages(messages: Vec<MessageWrapper>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn searches(&self) -> Vec<SearchParams> {
        self.searches.lock().unwrap().clone()
    }
}

#[async_trait]
impl LogBackend for ScriptedBackend {
    async fn search(&self, params: &SearchParams) -> Result<Batch> {
        self.searches.lock().unwrap().push(params.clone());
        let order = params.sort.as_ref().map(|s| s.order);
        if order.is_some() && order == self.fail_sort {
            return Err(GraylogMcpError::Api {
                status: 500,
                path: "/api/views/search/sync".into(),
                body: "search exploded".into(),
            });
        }

        let mut hits: Vec<MessageWrapper> = self
            .messages
            .iter()
            .filter(|mw| match &params.time_range {
                TimeRange::Relative(_) => true,
                TimeRange::Absolute { from, to } => {
                    let ts = mw.message.timestamp.as_str();
                    ts >= from.as_str() && ts <= to.as_str()
                }
            })
            .cloned()
            .collect();
        match order {
            Some(SortOrder::Asc) => hits.sort_by(|a, b| a.message.timestamp.cmp(&b.message.timestamp)),
            Some(SortOrder::Desc) => hits.sort_by(|a, b| b.message.timestamp.cmp(&a.message.timestamp)),
            None => {}
        }

        let total_results = hits.len();
        Ok(Batch {
            messages: hits.into_iter().skip(params.offset).take(params.limit).collect(),
            total_results,
        })
    }

    async fn get_message(&self, index: &str, id: &str) -> Result<MessageWrapper> {
        self.messages
            .iter()
            .find(|mw| mw.message.id == id && mw.index == index)
            .cloned()
            .ok_or_else(|| GraylogMcpError::Api {
                status: 404,
                path: format!("/api/messages/{index}/{id}"),
                body: "Message not found".into(),
            })
    }

    async fn streams(&self) -> Result<Vec<StreamInfo>> {
        Ok(self.streams.clone())
    }

    async fn fields(&self) -> Result<Vec<String>> {
        Ok(self.fields.clone())
    }

    async fn aggregate(&self, request: &AggregateRequest) -> Result<AggregateTable> {
        self.aggregates.lock().unwrap().push(request.clone());
        Ok(AggregateTable::default())
    }
}

pub fn message(id: &str, timestamp: &str, body: &str) -> MessageWrapper {
    let mut extra = FieldMap::new();
    extra.insert("level".into(), json!("ERROR"));
    extra.insert("facility".into(), json!("payments"));
    MessageWrapper {
        message: LogMessage {
            id: id.into(),
            timestamp: timestamp.into(),
            source: "api-1".into(),
            body: body.into(),
            extra,
        },
        index: "graylog_0".into(),
    }
}

/// `2024-01-01T00:00:SS.000Z`
pub fn at(second: u32) -> String {
    format!("2024-01-01T00:00:{second:02}.000Z")
}

pub fn registry(backend: Arc<ScriptedBackend>) -> ToolRegistry {
    ToolRegistry::new(backend, LimitsConfig::default())
}

pub async fn call(tools: &ToolRegistry, name: &str, args: Value) -> ToolOutput {
    tools.call(name, &args).await.unwrap()
}

/// Parses a successful tool result body.
pub async fn call_json(tools: &ToolRegistry, name: &str, args: Value) -> Value {
    let out = call(tools, name, args).await;
    assert!(!out.is_error, "tool failed: {}", out.text);
    serde_json::from_str(&out.text).unwrap()
}

pub fn ids(entries: &Value) -> Vec<String> {
    entries
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["message"]["_id"].as_str().unwrap().to_string())
        .collect()
}
