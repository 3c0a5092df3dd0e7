use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

#[derive(Debug, Clone)]
pub struct SourceInfo {
    pub content_length: u64,
    pub content_type: String,
    pub supports_range: bool,
}

/// A remote resource that can be sized and read in byte ranges.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn probe(&self) -> Result<SourceInfo>;
    /// Fetch the inclusive interval `[start, end]`.
    async fn fetch_range(&self, start: u64, end: u64) -> Result<Bytes>;
}
