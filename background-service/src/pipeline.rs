use std::sync::Arc;

use chrono::Utc;
use insightwatch_core::{
    CoreError, ErrorExt, ErrorReporter, FeedClient, Insight, InsightStore, RelevanceScorer,
    RunOutcome,
};
use tracing::{debug, info, warn};

/// One pass of fetch, score, store against a single community.
pub struct MonitoringPipeline {
    feed: Arc<dyn FeedClient>,
    store: Arc<dyn InsightStore>,
    scorer: RelevanceScorer,
    source: String,
    post_limit: u32,
    threshold: f64,
}

impl MonitoringPipeline {
    pub fn new(
        feed: Arc<dyn FeedClient>,
        store: Arc<dyn InsightStore>,
        scorer: RelevanceScorer,
        source: impl Into<String>,
        post_limit: u32,
        threshold: f64,
    ) -> Self {
        Self {
            feed,
            store,
            scorer,
            source: source.into(),
            post_limit,
            threshold,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Fetch the newest posts and evaluate every one not seen before.
    ///
    /// A feed failure abandons the run without marking anything processed.
    /// Storage failures on individual posts are counted and skipped.
    pub async fn run_once(&self) -> RunOutcome {
        info!(source = %self.source, limit = self.post_limit, "Checking for new posts");

        let posts = match self
            .feed
            .fetch_recent_posts(&self.source, self.post_limit)
            .await
        {
            Ok(posts) => posts,
            Err(e) => {
                ErrorReporter::default().report_error(&e);
                if !e.is_transient_feed_error() {
                    warn!("Feed failure is unlikely to clear by itself: {}", e.user_friendly_message());
                }
                return RunOutcome::failed(e.to_string());
            }
        };

        let mut outcome = RunOutcome::default();
        for post in &posts {
            match self.store.has_processed(&post.id).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    warn!(post_id = %post.id, "Could not check processed state: {}", e);
                    outcome.storage_errors += 1;
                    continue;
                }
            }

            outcome.evaluated_count += 1;
            let score = self.scorer.score(post);
            debug!(post_id = %post.id, score, "Scored post");

            if score >= self.threshold {
                let insight = Insight::from_post(post, score, Utc::now());
                match self.store.add_insight(&insight).await {
                    Ok(()) => {
                        info!(post_id = %post.id, score, "Found insight: {}", post.title);
                        outcome.accepted_count += 1;
                        outcome.accepted.push(insight);
                    }
                    Err(e) if e.is_duplicate_insight() => {
                        debug!(post_id = %post.id, "Insight already stored");
                    }
                    Err(e) => record_storage_error(&mut outcome, &post.id, &e),
                }
            }

            if let Err(e) = self.store.record_processed(&post.id).await {
                record_storage_error(&mut outcome, &post.id, &e);
            }
        }

        info!(
            evaluated = outcome.evaluated_count,
            accepted = outcome.accepted_count,
            storage_errors = outcome.storage_errors,
            "Check complete"
        );
        outcome
    }
}

fn record_storage_error(outcome: &mut RunOutcome, post_id: &str, error: &CoreError) {
    warn!(post_id = %post_id, "Storage error: {}", error);
    outcome.storage_errors += 1;
}
