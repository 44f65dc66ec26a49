//! Context windows around a single target message.

use std::collections::HashSet;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::backend::LogBackend;
use crate::error::Result;
use crate::fit::{halved, truncate_body, Shrinkable};
use crate::model::{MessageEntry, MessageWrapper, SearchParams, Sort, TimeRange};
use crate::projection::FieldSelection;

/// Open lower bound for the backwards query.
const EPOCH_START: &str = "1970-01-01T00:00:00.000Z";
/// Open upper bound for the forwards query.
const FAR_FUTURE: &str = "2099-12-31T23:59:59.999Z";

/// How far each directional query overfetches.
#[derive(Debug, Clone, Copy)]
pub struct Overfetch {
    pub multiplier: usize,
    pub ceiling: usize,
}

impl Default for Overfetch {
    fn default() -> Self {
        Self {
            multiplier: 3,
            ceiling: 1501,
        }
    }
}

impl Overfetch {
    /// Upstream limit for one side; the `+ 1` leaves room for the target.
    pub fn limit(&self, requested: usize) -> usize {
        requested
            .saturating_mul(self.multiplier)
            .saturating_add(1)
            .min(self.ceiling)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ContextRequest {
    pub before: usize,
    pub after: usize,
    pub stream_ids: Vec<String>,
    pub fields: FieldSelection,
}

/// Messages around a target, each side in ascending time order.
#[derive(Debug, Clone)]
pub struct ContextWindow {
    pub target: MessageWrapper,
    pub before: Vec<MessageWrapper>,
    pub after: Vec<MessageWrapper>,
    pub incomplete: bool,
    pub before_error: Option<String>,
    pub after_error: Option<String>,
}

pub struct ContextAssembler<'a> {
    backend: &'a dyn LogBackend,
    overfetch: Overfetch,
}

impl<'a> ContextAssembler<'a> {
    pub fn new(backend: &'a dyn LogBackend, overfetch: Overfetch) -> Self {
        Self { backend, overfetch }
    }

    /// Fetches the target and both sides of its window.
    ///
    /// Failing to fetch the target is an error; a failing side is recorded
    /// on the window and the other side is still returned.
    pub async fn assemble(
        &self,
        target_id: &str,
        target_index: &str,
        request: &ContextRequest,
    ) -> Result<ContextWindow> {
        let target = self.backend.get_message(target_index, target_id).await?;
        Ok(self.around(target, request).await)
    }

    pub async fn around(&self, target: MessageWrapper, request: &ContextRequest) -> ContextWindow {
        let ts = target.message.timestamp.clone();
        let before_params = self.side_params(
            request,
            TimeRange::Absolute {
                from: EPOCH_START.into(),
                to: ts.clone(),
            },
            Sort::desc("timestamp"),
            request.before,
        );
        let after_params = self.side_params(
            request,
            TimeRange::Absolute {
                from: ts,
                to: FAR_FUTURE.into(),
            },
            Sort::asc("timestamp"),
            request.after,
        );
        debug!(
            before_limit = before_params.limit,
            after_limit = after_params.limit,
            "fetching context"
        );

        let (before_res, after_res) = futures::join!(
            self.fetch_side(before_params, request.before),
            self.fetch_side(after_params, request.after)
        );

        let (descending, before_error) = split_side(before_res, "before");
        let (ascending, after_error) = split_side(after_res, "after");
        let (before, after) = merge_window(
            &target.message.id,
            descending,
            ascending,
            request.before,
            request.after,
        );
        let incomplete = before.len() < request.before || after.len() < request.after;

        ContextWindow {
            target,
            before,
            after,
            incomplete,
            before_error,
            after_error,
        }
    }

    fn side_params(
        &self,
        request: &ContextRequest,
        time_range: TimeRange,
        sort: Sort,
        requested: usize,
    ) -> SearchParams {
        let mut params = SearchParams::new("*", time_range);
        params.limit = self.overfetch.limit(requested);
        params.sort = Some(sort);
        params.fields = request.fields.names().to_vec();
        params.stream_ids = request.stream_ids.clone();
        params
    }

    async fn fetch_side(&self, params: SearchParams, requested: usize) -> Result<Vec<MessageWrapper>> {
        if requested == 0 {
            return Ok(Vec::new());
        }
        Ok(self.backend.search(&params).await?.messages)
    }
}

fn split_side(
    res: Result<Vec<MessageWrapper>>,
    side: &str,
) -> (Vec<MessageWrapper>, Option<String>) {
    match res {
        Ok(msgs) => (msgs, None),
        Err(e) => {
            warn!(side, "context fetch failed: {e}");
            (Vec::new(), Some(e.to_string()))
        }
    }
}

/// Builds the two sides of a window from raw directional batches.
///
/// `descending` is newest-first up to the target time, `ascending` is
/// oldest-first from the target time. The target is removed from both,
/// each side is deduplicated by id, and ids already placed before the
/// target are dropped from after it. Each side keeps the entries nearest
/// to the target.
pub fn merge_window(
    target_id: &str,
    descending: Vec<MessageWrapper>,
    ascending: Vec<MessageWrapper>,
    before: usize,
    after: usize,
) -> (Vec<MessageWrapper>, Vec<MessageWrapper>) {
    let mut older = without_id(descending, target_id);
    older.reverse();
    let mut older = unique_by_id(older);
    if older.len() > before {
        older.drain(..older.len() - before);
    }

    let claimed: HashSet<&str> = older
        .iter()
        .map(|mw| mw.message.id.as_str())
        .filter(|id| !id.is_empty())
        .collect();
    let mut newer: Vec<MessageWrapper> = unique_by_id(without_id(ascending, target_id))
        .into_iter()
        .filter(|mw| mw.message.id.is_empty() || !claimed.contains(mw.message.id.as_str()))
        .collect();
    newer.truncate(after);

    (older, newer)
}

fn without_id(messages: Vec<MessageWrapper>, id: &str) -> Vec<MessageWrapper> {
    messages.into_iter().filter(|mw| mw.message.id != id).collect()
}

/// First occurrence wins; messages without an id are always kept.
fn unique_by_id(messages: Vec<MessageWrapper>) -> Vec<MessageWrapper> {
    let mut seen = HashSet::with_capacity(messages.len());
    messages
        .into_iter()
        .filter(|mw| mw.message.id.is_empty() || seen.insert(mw.message.id.clone()))
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextResult {
    pub target_message: MessageEntry,
    pub messages_before: Vec<MessageEntry>,
    pub messages_after: Vec<MessageEntry>,
    pub context_incomplete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after_error: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub response_truncated: bool,
}

impl ContextResult {
    pub fn from_window(window: &ContextWindow, fields: &FieldSelection) -> Self {
        Self {
            target_message: fields.project_entry(&window.target),
            messages_before: window.before.iter().map(|mw| fields.project_entry(mw)).collect(),
            messages_after: window.after.iter().map(|mw| fields.project_entry(mw)).collect(),
            context_incomplete: window.incomplete,
            before_error: window.before_error.clone(),
            after_error: window.after_error.clone(),
            response_truncated: false,
        }
    }
}

impl Shrinkable for ContextResult {
    fn truncate_content(&mut self, max_len: usize) {
        truncate_body(&mut self.target_message.message, max_len);
        for entry in self.messages_before.iter_mut().chain(self.messages_after.iter_mut()) {
            truncate_body(&mut entry.message, max_len);
        }
    }

    fn reduce_count(&mut self) -> bool {
        let before = halved(self.messages_before.len());
        let after = halved(self.messages_after.len());
        if before.is_none() && after.is_none() {
            return false;
        }
        // The before side ends at the target; shed its oldest entries.
        if let Some(n) = before {
            let len = self.messages_before.len();
            self.messages_before.drain(..len - n);
        }
        if let Some(n) = after {
            self.messages_after.truncate(n);
        }
        self.context_incomplete = true;
        true
    }

    fn mark_truncated(&mut self) {
        self.response_truncated = true;
    }

    fn fallback(&self) -> Option<Value> {
        let target = &self.target_message;
        let field = |name: &str| target.message.get(name).cloned().unwrap_or(Value::Null);
        let mut meta = json!({
            "target_message_id": field("_id"),
            "target_timestamp": field("timestamp"),
            "target_index": target.index,
            "context_incomplete": self.context_incomplete,
            "has_more": true,
            "response_truncated": true,
            "error": "Context response too large even after truncation. Reduce 'before'/'after' or use 'fields' to limit payload size.",
        });
        if let Value::Object(map) = &mut meta {
            if let Some(e) = &self.before_error {
                map.insert("before_error".into(), json!(e));
            }
            if let Some(e) = &self.after_error {
                map.insert("after_error".into(), json!(e));
            }
        }
        Some(meta)
    }
}
