use async_trait::async_trait;

use crate::error::Result;
use crate::model::{AggregateRequest, AggregateTable, Batch, MessageWrapper, SearchParams, StreamInfo};

/// The upstream log store. Every call is a single attempt; callers decide
/// what a failure means for their result.
#[async_trait]
pub trait LogBackend: Send + Sync {
    async fn search(&self, params: &SearchParams) -> Result<Batch>;

    async fn get_message(&self, index: &str, id: &str) -> Result<MessageWrapper>;

    async fn streams(&self) -> Result<Vec<StreamInfo>>;

    async fn fields(&self) -> Result<Vec<String>>;

    async fn aggregate(&self, request: &AggregateRequest) -> Result<AggregateTable>;
}
