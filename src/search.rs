use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::backend::LogBackend;
use crate::config::LimitsConfig;
use crate::dedup::{cap_sample_ids, deduplicate, DedupEntry};
use crate::error::{GraylogMcpError, Result};
use crate::fit::{fit_result, halved, truncate_body, truncate_in_place, Fitted, Shrinkable};
use crate::model::{MessageEntry, MessageWrapper, SearchParams};
use crate::projection::FieldSelection;
use crate::template::{templateize, DrainMiner, TemplateGroup};

/// How matching messages are presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchMode {
    #[default]
    Plain,
    Deduplicate,
    Templateize,
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub params: SearchParams,
    pub fields: FieldSelection,
    pub mode: SearchMode,
    /// Cut every message body to this many bytes before grouping; `0` is off.
    pub truncate_message: usize,
    /// Byte budget for the serialized result; `0` disables fitting.
    pub max_result_size: usize,
}

/// Runs `search_logs` requests against a backend.
pub struct SearchEngine {
    backend: Arc<dyn LogBackend>,
    limits: LimitsConfig,
    miner: DrainMiner,
}

impl SearchEngine {
    pub fn new(backend: Arc<dyn LogBackend>, limits: LimitsConfig) -> Self {
        Self::with_miner(backend, limits, DrainMiner::default())
    }

    pub fn with_miner(backend: Arc<dyn LogBackend>, limits: LimitsConfig, miner: DrainMiner) -> Self {
        Self {
            backend,
            limits,
            miner,
        }
    }

    pub async fn search(&self, request: SearchRequest) -> Result<Fitted> {
        self.validate_request(&request)?;
        match request.mode {
            SearchMode::Plain => self.search_plain(request).await,
            SearchMode::Deduplicate => self.search_deduplicated(request).await,
            SearchMode::Templateize => self.search_templated(request).await,
        }
    }

    async fn search_plain(&self, request: SearchRequest) -> Result<Fitted> {
        let SearchParams { limit, offset, .. } = request.params;
        let mut batch = self.backend.search(&request.params).await?;
        truncate_bodies(&mut batch.messages, request.truncate_message);

        let mut result = SearchResult {
            messages: batch
                .messages
                .iter()
                .map(|mw| request.fields.project_entry(mw))
                .collect(),
            total_results: batch.total_results,
            limit,
            offset,
            has_more: offset.saturating_add(limit) < batch.total_results,
            response_truncated: false,
        };
        fit_result(&mut result, request.max_result_size)
    }

    /// Fetches from the start of the result set so grouping sees every
    /// duplicate up to the requested page, then pages over the groups.
    async fn search_deduplicated(&self, request: SearchRequest) -> Result<Fitted> {
        let SearchParams { limit, offset, .. } = request.params;
        let mut params = request.params.clone();
        params.offset = 0;
        params.limit = offset
            .saturating_add(limit)
            .saturating_mul(self.limits.dedup_fetch_multiplier.max(1))
            .min(self.limits.max_search_limit);
        debug!(fetch_limit = params.limit, offset, limit, "deduplicated search");

        let mut batch = self.backend.search(&params).await?;
        truncate_bodies(&mut batch.messages, request.truncate_message);

        // Content identity spans every field; `fields` only shapes the output.
        let mut groups = deduplicate(&batch.messages, &[]);
        let unique_in_batch = groups.len();
        cap_sample_ids(&mut groups, self.limits.sample_id_cap);

        let page: Vec<DedupEntry> = groups
            .iter()
            .skip(offset)
            .take(limit)
            .map(|g| g.to_entry(&request.fields))
            .collect();
        let has_more = offset.saturating_add(limit) < batch.total_results
            || unique_in_batch > offset + page.len();

        let mut result = DedupSearchResult {
            deduplicated: page,
            total_raw_results: batch.total_results,
            unique_in_batch,
            limit,
            offset,
            has_more,
            response_truncated: false,
        };
        fit_result(&mut result, request.max_result_size)
    }

    async fn search_templated(&self, request: SearchRequest) -> Result<Fitted> {
        let mut batch = self.backend.search(&request.params).await?;
        truncate_bodies(&mut batch.messages, request.truncate_message);

        let mut miner = self.miner;
        let templates = templateize(&batch.messages, &mut miner, self.limits.sample_id_cap)?;
        debug!(
            messages = batch.messages.len(),
            templates = templates.len(),
            "templated search"
        );

        let mut result = TemplateSearchResult {
            template_count: templates.len(),
            templates,
            total_results: batch.total_results,
            response_truncated: false,
        };
        fit_result(&mut result, request.max_result_size)
    }

    fn validate_request(&self, request: &SearchRequest) -> Result<()> {
        if request.params.query.trim().is_empty() {
            return Err(GraylogMcpError::InvalidRequest(
                "'query' parameter is required".into(),
            ));
        }
        if request.params.limit == 0 {
            return Err(GraylogMcpError::InvalidRequest("'limit' must be >= 1".into()));
        }
        Ok(())
    }
}

fn truncate_bodies(messages: &mut [MessageWrapper], max_bytes: usize) {
    if max_bytes == 0 {
        return;
    }
    for mw in messages {
        truncate_in_place(&mut mw.message.body, max_bytes);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub messages: Vec<MessageEntry>,
    pub total_results: usize,
    pub limit: usize,
    pub offset: usize,
    pub has_more: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub response_truncated: bool,
}

impl Shrinkable for SearchResult {
    fn truncate_content(&mut self, max_len: usize) {
        for entry in &mut self.messages {
            truncate_body(&mut entry.message, max_len);
        }
    }

    fn reduce_count(&mut self) -> bool {
        let Some(n) = halved(self.messages.len()) else {
            return false;
        };
        self.messages.truncate(n);
        self.has_more = true;
        true
    }

    fn mark_truncated(&mut self) {
        self.response_truncated = true;
    }

    fn fallback(&self) -> Option<Value> {
        Some(json!({
            "total_results": self.total_results,
            "limit": self.limit,
            "offset": self.offset,
            "has_more": true,
            "response_truncated": true,
            "error": OVERSIZED_SEARCH,
        }))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DedupSearchResult {
    pub deduplicated: Vec<DedupEntry>,
    pub total_raw_results: usize,
    pub unique_in_batch: usize,
    pub limit: usize,
    pub offset: usize,
    pub has_more: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub response_truncated: bool,
}

impl Shrinkable for DedupSearchResult {
    fn truncate_content(&mut self, max_len: usize) {
        for entry in &mut self.deduplicated {
            truncate_body(&mut entry.message, max_len);
        }
    }

    fn reduce_count(&mut self) -> bool {
        let Some(n) = halved(self.deduplicated.len()) else {
            return false;
        };
        self.deduplicated.truncate(n);
        self.has_more = true;
        true
    }

    fn mark_truncated(&mut self) {
        self.response_truncated = true;
    }

    fn fallback(&self) -> Option<Value> {
        Some(json!({
            "total_raw_results": self.total_raw_results,
            "unique_in_batch": self.unique_in_batch,
            "limit": self.limit,
            "offset": self.offset,
            "has_more": true,
            "response_truncated": true,
            "error": OVERSIZED_SEARCH,
        }))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TemplateSearchResult {
    pub templates: Vec<TemplateGroup>,
    pub total_results: usize,
    pub template_count: usize,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub response_truncated: bool,
}

impl Shrinkable for TemplateSearchResult {
    fn truncate_content(&mut self, max_len: usize) {
        for group in &mut self.templates {
            truncate_in_place(&mut group.pattern, max_len);
        }
    }

    fn reduce_count(&mut self) -> bool {
        let Some(n) = halved(self.templates.len()) else {
            return false;
        };
        self.templates.truncate(n);
        true
    }

    fn mark_truncated(&mut self) {
        self.response_truncated = true;
    }

    fn fallback(&self) -> Option<Value> {
        Some(json!({
            "total_results": self.total_results,
            "template_count": self.template_count,
            "has_more": true,
            "response_truncated": true,
            "error": "Response too large even after truncation. Use 'fields' parameter or reduce the search scope.",
        }))
    }
}

const OVERSIZED_SEARCH: &str = "Response too large even after truncation. Use 'fields' parameter to select specific fields or 'truncate_message' to limit message size.";
