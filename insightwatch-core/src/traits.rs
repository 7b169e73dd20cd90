use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{CoreError, Insight, Post};

/// Source of posts for one community.
#[async_trait]
pub trait FeedClient: Send + Sync {
    /// Fetch up to `limit` of the newest posts from `source`.
    async fn fetch_recent_posts(&self, source: &str, limit: u32) -> Result<Vec<Post>, CoreError>;
}

/// Durable record of processed post ids and accepted insights.
///
/// Single writer: only the monitoring pipeline mutates a store, and only one
/// pipeline run executes at a time.
#[async_trait]
pub trait InsightStore: Send + Sync {
    async fn has_processed(&self, post_id: &str) -> Result<bool, CoreError>;

    /// Idempotent; recording an id twice is not an error.
    async fn record_processed(&self, post_id: &str) -> Result<(), CoreError>;

    /// Fails with `DatabaseError::DuplicateInsight` if the post already has an insight.
    async fn add_insight(&self, insight: &Insight) -> Result<(), CoreError>;

    /// Insights ordered by discovery time, oldest first.
    async fn list_insights(&self, since: Option<DateTime<Utc>>)
        -> Result<Vec<Insight>, CoreError>;

    /// Newest first.
    async fn recent_insights(&self, limit: usize) -> Result<Vec<Insight>, CoreError>;

    async fn insight_count(&self) -> Result<u64, CoreError>;
}
