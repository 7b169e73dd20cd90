use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Characters of post body kept on an [`Insight`].
pub const EXCERPT_LIMIT: usize = 500;

const PERMALINK_BASE: &str = "https://reddit.com";

/// A post as delivered by the feed client. Read-only input to the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub title: String,
    pub body: String,
    pub author: Option<String>,
    pub upvotes: i64,
    pub upvote_ratio: Option<f64>,
    pub num_comments: u32,
    pub permalink: String,
    pub created_utc: i64,
}

/// A post that cleared the relevance threshold. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub post_id: String,
    pub title: String,
    pub author: String,
    pub upvotes: i64,
    pub num_comments: u32,
    pub url: String,
    pub excerpt: String,
    pub relevance_score: f64,
    pub created_utc: i64,
    pub discovered_at: DateTime<Utc>,
}

impl Insight {
    pub fn from_post(post: &Post, relevance_score: f64, discovered_at: DateTime<Utc>) -> Self {
        let url = if post.permalink.starts_with("http") {
            post.permalink.clone()
        } else {
            format!("{PERMALINK_BASE}{}", post.permalink)
        };

        Self {
            post_id: post.id.clone(),
            title: post.title.clone(),
            author: post
                .author
                .clone()
                .filter(|a| !a.is_empty())
                .unwrap_or_else(|| "[deleted]".to_string()),
            upvotes: post.upvotes,
            num_comments: post.num_comments,
            url,
            excerpt: post.body.chars().take(EXCERPT_LIMIT).collect(),
            relevance_score,
            created_utc: post.created_utc,
            discovered_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Starting,
    Running,
    Error,
    Stopped,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            HealthStatus::Starting => "starting",
            HealthStatus::Running => "running",
            HealthStatus::Error => "error",
            HealthStatus::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

/// Operational snapshot of the daemon, written by the supervisor and read by operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub status: HealthStatus,
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub total_insights: u64,
    pub insights_today: u64,
    pub error_count: u64,
    /// Posts whose insight or processed mark could not be written.
    #[serde(default)]
    pub storage_errors: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_evaluated: usize,
    pub last_accepted: usize,
}

impl HealthRecord {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            status: HealthStatus::Starting,
            started_at,
            uptime_seconds: 0,
            total_insights: 0,
            insights_today: 0,
            error_count: 0,
            storage_errors: 0,
            last_run: None,
            last_success: None,
            last_error: None,
            last_evaluated: 0,
            last_accepted: 0,
        }
    }

    /// The day `insights_today` was counted on.
    pub fn counted_day(&self) -> NaiveDate {
        self.last_run.unwrap_or(self.started_at).date_naive()
    }

    /// The record as seen at `now`; today's count drops to zero once the day changes.
    pub fn as_of(mut self, now: DateTime<Utc>) -> Self {
        if now.date_naive() != self.counted_day() {
            self.insights_today = 0;
        }
        self
    }
}

/// Result of one pipeline pass.
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    pub evaluated_count: usize,
    pub accepted_count: usize,
    /// Per-post storage failures; counted but never abort the run.
    pub storage_errors: usize,
    pub accepted: Vec<Insight>,
    /// Set when the batch fetch failed and the run was abandoned.
    pub error: Option<String>,
}

impl RunOutcome {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}
