use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{DateTime, Utc};
use insightwatch_core::{
    CoreError, DatabaseError, FeedClient, HealthStatus, Insight, InsightStore, Post,
    RedditApiError, RelevanceScorer,
};
use tokio::sync::{Notify, RwLock};
use tower::ServiceExt;

use crate::{
    build_router, digest, ApiState, HealthReporter, HealthResponse, InsightsResponse,
    MonitoringPipeline, NoopNotifier, Supervisor, SupervisorState,
};

fn valuable_post(id: &str) -> Post {
    Post {
        id: id.to_string(),
        title: format!("My workflow for long refactors ({id})"),
        body: "Split the task into steps and review each diff.".to_string(),
        author: Some("alice".to_string()),
        upvotes: 120,
        upvote_ratio: Some(0.95),
        num_comments: 12,
        permalink: format!("/r/claude/comments/{id}/"),
        created_utc: 1_700_000_000,
    }
}

fn noise_post(id: &str) -> Post {
    Post {
        id: id.to_string(),
        title: format!("Look at this ({id})"),
        body: String::new(),
        author: None,
        upvotes: 2,
        upvote_ratio: Some(0.5),
        num_comments: 0,
        permalink: format!("/r/claude/comments/{id}/"),
        created_utc: 1_700_000_000,
    }
}

fn mixed_batch() -> Vec<Post> {
    let mut posts: Vec<Post> = (0..8).map(|i| noise_post(&format!("n{i}"))).collect();
    posts.insert(3, valuable_post("v1"));
    posts.push(valuable_post("v2"));
    posts
}

struct FakeFeed {
    posts: Mutex<Vec<Post>>,
    fail: Mutex<bool>,
    calls: AtomicUsize,
}

impl FakeFeed {
    fn new(posts: Vec<Post>) -> Self {
        Self {
            posts: Mutex::new(posts),
            fail: Mutex::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    fn set_failing(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }
}

#[async_trait]
impl FeedClient for FakeFeed {
    async fn fetch_recent_posts(&self, _source: &str, limit: u32) -> Result<Vec<Post>, CoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if *self.fail.lock().unwrap() {
            return Err(RedditApiError::AuthenticationFailed {
                reason: "bad credentials".to_string(),
            }
            .into());
        }
        let posts = self.posts.lock().unwrap();
        Ok(posts.iter().take(limit as usize).cloned().collect())
    }
}

#[derive(Default)]
struct MemoryStore {
    processed: Mutex<HashSet<String>>,
    insights: Mutex<Vec<Insight>>,
    fail_insight_for: Mutex<Option<String>>,
}

#[async_trait]
impl InsightStore for MemoryStore {
    async fn has_processed(&self, post_id: &str) -> Result<bool, CoreError> {
        Ok(self.processed.lock().unwrap().contains(post_id))
    }

    async fn record_processed(&self, post_id: &str) -> Result<(), CoreError> {
        self.processed.lock().unwrap().insert(post_id.to_string());
        Ok(())
    }

    async fn add_insight(&self, insight: &Insight) -> Result<(), CoreError> {
        if self.fail_insight_for.lock().unwrap().as_deref() == Some(insight.post_id.as_str()) {
            return Err(DatabaseError::DatabaseLocked.into());
        }
        let mut insights = self.insights.lock().unwrap();
        if insights.iter().any(|i| i.post_id == insight.post_id) {
            return Err(DatabaseError::DuplicateInsight {
                post_id: insight.post_id.clone(),
            }
            .into());
        }
        insights.push(insight.clone());
        Ok(())
    }

    async fn list_insights(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Insight>, CoreError> {
        Ok(self
            .insights
            .lock()
            .unwrap()
            .iter()
            .filter(|i| since.map_or(true, |s| i.discovered_at >= s))
            .cloned()
            .collect())
    }

    async fn recent_insights(&self, limit: usize) -> Result<Vec<Insight>, CoreError> {
        Ok(self
            .insights
            .lock()
            .unwrap()
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn insight_count(&self) -> Result<u64, CoreError> {
        Ok(self.insights.lock().unwrap().len() as u64)
    }
}

fn pipeline(feed: Arc<dyn FeedClient>, store: Arc<dyn InsightStore>) -> MonitoringPipeline {
    MonitoringPipeline::new(feed, store, RelevanceScorer::default(), "claude", 50, 0.7)
}

#[tokio::test]
async fn test_end_to_end_run_and_rerun() {
    let feed = Arc::new(FakeFeed::new(mixed_batch()));
    let store = Arc::new(MemoryStore::default());
    let pipeline = pipeline(feed.clone(), store.clone());

    let first = pipeline.run_once().await;
    assert!(first.is_success());
    assert_eq!(first.evaluated_count, 10);
    assert_eq!(first.accepted_count, 2);
    assert_eq!(store.processed.lock().unwrap().len(), 10);

    let text = digest::render("claude", &first.accepted, Utc::now());
    assert!(text.contains("Found 2 valuable posts"));
    assert!(text.contains("(v1)"));
    assert!(text.contains("(v2)"));
    assert!(!text.contains("3. "));
    assert!(!text.contains("Look at this"));

    let second = pipeline.run_once().await;
    assert!(second.is_success());
    assert_eq!(second.evaluated_count, 0);
    assert_eq!(second.accepted_count, 0);
    assert_eq!(store.insight_count().await.unwrap(), 2);
}

#[tokio::test]
async fn test_feed_failure_leaves_posts_unprocessed() {
    let feed = Arc::new(FakeFeed::new(mixed_batch()));
    feed.set_failing(true);
    let store = Arc::new(MemoryStore::default());
    let pipeline = pipeline(feed.clone(), store.clone());

    let outcome = pipeline.run_once().await;
    assert!(!outcome.is_success());
    assert_eq!(outcome.evaluated_count, 0);
    assert!(store.processed.lock().unwrap().is_empty());

    feed.set_failing(false);
    let outcome = pipeline.run_once().await;
    assert_eq!(outcome.evaluated_count, 10);
    assert_eq!(outcome.accepted_count, 2);
}

#[tokio::test]
async fn test_storage_error_is_not_fatal() {
    let feed = Arc::new(FakeFeed::new(mixed_batch()));
    let store = Arc::new(MemoryStore::default());
    *store.fail_insight_for.lock().unwrap() = Some("v1".to_string());
    let pipeline = pipeline(feed, store.clone());

    let outcome = pipeline.run_once().await;
    assert!(outcome.is_success());
    assert_eq!(outcome.evaluated_count, 10);
    assert_eq!(outcome.accepted_count, 1);
    assert_eq!(outcome.storage_errors, 1);
    assert!(store.processed.lock().unwrap().contains("v1"));
}

#[tokio::test]
async fn test_duplicate_insight_is_benign() {
    let feed = Arc::new(FakeFeed::new(vec![valuable_post("v1")]));
    let store = Arc::new(MemoryStore::default());
    store
        .add_insight(&Insight::from_post(&valuable_post("v1"), 0.9, Utc::now()))
        .await
        .unwrap();
    let pipeline = pipeline(feed, store.clone());

    let outcome = pipeline.run_once().await;
    assert_eq!(outcome.evaluated_count, 1);
    assert_eq!(outcome.accepted_count, 0);
    assert_eq!(outcome.storage_errors, 0);
    assert_eq!(store.insight_count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_score_equal_to_threshold_is_accepted() {
    let post = valuable_post("edge");
    let exact = RelevanceScorer::default().score(&post);
    assert!(exact > 0.0);

    let at_threshold = MonitoringPipeline::new(
        Arc::new(FakeFeed::new(vec![post.clone()])),
        Arc::new(MemoryStore::default()),
        RelevanceScorer::default(),
        "claude",
        50,
        exact,
    );
    let outcome = at_threshold.run_once().await;
    assert_eq!(outcome.accepted_count, 1);
    assert_eq!(outcome.accepted[0].relevance_score, exact);

    let just_above = f64::from_bits(exact.to_bits() + 1);
    let above_threshold = MonitoringPipeline::new(
        Arc::new(FakeFeed::new(vec![post])),
        Arc::new(MemoryStore::default()),
        RelevanceScorer::default(),
        "claude",
        50,
        just_above,
    );
    let outcome = above_threshold.run_once().await;
    assert_eq!(outcome.evaluated_count, 1);
    assert_eq!(outcome.accepted_count, 0);
}

struct BlockingFeed {
    entered: Notify,
    release: Notify,
    calls: AtomicUsize,
}

#[async_trait]
impl FeedClient for BlockingFeed {
    async fn fetch_recent_posts(&self, _source: &str, _limit: u32) -> Result<Vec<Post>, CoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        self.release.notified().await;
        Ok(mixed_batch())
    }
}

fn reporter() -> Arc<RwLock<HealthReporter>> {
    Arc::new(RwLock::new(HealthReporter::new(Utc::now())))
}

#[tokio::test]
async fn test_stop_mid_run_lets_run_finish() {
    let feed = Arc::new(BlockingFeed {
        entered: Notify::new(),
        release: Notify::new(),
        calls: AtomicUsize::new(0),
    });
    let store = Arc::new(MemoryStore::default());
    let health = reporter();
    let (supervisor, handle) = Supervisor::new(
        pipeline(feed.clone(), store.clone()),
        health.clone(),
        Arc::new(NoopNotifier),
        Duration::from_secs(3600),
    );
    assert_eq!(handle.state(), SupervisorState::Starting);

    let task = tokio::spawn(supervisor.run());
    feed.entered.notified().await;

    handle.request_stop();
    assert_eq!(handle.state(), SupervisorState::Stopping);

    feed.release.notify_one();
    tokio::time::timeout(Duration::from_secs(5), handle.wait_stopped())
        .await
        .unwrap();
    task.await.unwrap();

    assert_eq!(handle.state(), SupervisorState::Stopped);
    assert_eq!(feed.calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.processed.lock().unwrap().len(), 10);
    assert_eq!(store.insight_count().await.unwrap(), 2);

    let record = health.read().await.current(Utc::now());
    assert_eq!(record.status, HealthStatus::Stopped);
    assert_eq!(record.last_accepted, 2);
}

#[tokio::test]
async fn test_supervisor_runs_on_interval_until_stopped() {
    let feed = Arc::new(FakeFeed::new(mixed_batch()));
    let (supervisor, handle) = Supervisor::new(
        pipeline(feed.clone(), Arc::new(MemoryStore::default())),
        reporter(),
        Arc::new(NoopNotifier),
        Duration::from_millis(10),
    );

    let task = tokio::spawn(supervisor.run());
    let mut rx = handle.subscribe();
    rx.wait_for(|state| *state == SupervisorState::Running)
        .await
        .map(|_| ())
        .unwrap();

    while feed.calls.load(Ordering::SeqCst) < 3 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    handle.request_stop();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();

    let calls = feed.calls.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(feed.calls.load(Ordering::SeqCst), calls);
    assert_eq!(handle.state(), SupervisorState::Stopped);
}

#[tokio::test]
async fn test_failed_first_run_still_reaches_running() {
    let feed = Arc::new(FakeFeed::new(Vec::new()));
    feed.set_failing(true);
    let health = reporter();
    let (supervisor, handle) = Supervisor::new(
        pipeline(feed, Arc::new(MemoryStore::default())),
        health.clone(),
        Arc::new(NoopNotifier),
        Duration::from_secs(3600),
    );

    let task = tokio::spawn(supervisor.run());
    let mut rx = handle.subscribe();
    rx.wait_for(|state| *state == SupervisorState::Running)
        .await
        .map(|_| ())
        .unwrap();
    assert_eq!(health.read().await.current(Utc::now()).status, HealthStatus::Error);

    handle.request_stop();
    task.await.unwrap();
    assert_eq!(handle.state(), SupervisorState::Stopped);
}

#[tokio::test]
async fn test_digest_written_for_accepted_run() {
    let dir = tempfile::tempdir().unwrap();
    let feed = Arc::new(FakeFeed::new(mixed_batch()));
    let (supervisor, handle) = Supervisor::new(
        pipeline(feed, Arc::new(MemoryStore::default())),
        reporter(),
        Arc::new(NoopNotifier),
        Duration::from_secs(3600),
    );
    let supervisor = supervisor.with_digest_dir(dir.path().join("digests"));

    let task = tokio::spawn(supervisor.run());
    let mut rx = handle.subscribe();
    rx.wait_for(|state| *state == SupervisorState::Running)
        .await
        .map(|_| ())
        .unwrap();
    handle.request_stop();
    task.await.unwrap();

    let files: Vec<_> = std::fs::read_dir(dir.path().join("digests"))
        .unwrap()
        .collect();
    assert_eq!(files.len(), 1);
}

fn api_state(store: Arc<MemoryStore>) -> (ApiState, Arc<RwLock<HealthReporter>>) {
    let health = reporter();
    let (_supervisor, handle) = Supervisor::new(
        pipeline(Arc::new(FakeFeed::new(Vec::new())), store.clone()),
        health.clone(),
        Arc::new(NoopNotifier),
        Duration::from_secs(3600),
    );
    let state = ApiState {
        health: health.clone(),
        supervisor: handle,
        store,
        port: 8080,
    };
    (state, health)
}

async fn get(router: axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = router
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn test_health_endpoint() {
    let (state, health) = api_state(Arc::new(MemoryStore::default()));
    health.write().await.update(
        &insightwatch_core::RunOutcome {
            evaluated_count: 4,
            accepted_count: 1,
            ..Default::default()
        },
        Utc::now(),
    );

    for uri in ["/health", "/api/health"] {
        let (status, body) = get(build_router(state.clone()), uri).await;
        assert_eq!(status, StatusCode::OK);
        let parsed: HealthResponse = serde_json::from_value(body).unwrap();
        assert_eq!(parsed.record.status, HealthStatus::Running);
        assert_eq!(parsed.record.total_insights, 1);
        assert_eq!(parsed.supervisor, SupervisorState::Starting);
        assert_eq!(parsed.port, 8080);
    }
}

#[tokio::test]
async fn test_recent_insights_endpoint() {
    let store = Arc::new(MemoryStore::default());
    for id in ["a", "b", "c"] {
        store
            .add_insight(&Insight::from_post(&valuable_post(id), 0.8, Utc::now()))
            .await
            .unwrap();
    }
    let (state, _) = api_state(store);

    let (status, body) = get(build_router(state.clone()), "/api/insights/recent?limit=2").await;
    assert_eq!(status, StatusCode::OK);
    let parsed: InsightsResponse = serde_json::from_value(body).unwrap();
    assert_eq!(parsed.count, 2);
    assert_eq!(parsed.total, 3);
    assert_eq!(parsed.insights[0].post_id, "c");

    let (_, body) = get(build_router(state), "/insights").await;
    let parsed: InsightsResponse = serde_json::from_value(body).unwrap();
    assert_eq!(parsed.count, 3);
}

#[tokio::test]
async fn test_unknown_path_returns_json_404() {
    let (state, _) = api_state(Arc::new(MemoryStore::default()));
    let (status, body) = get(build_router(state), "/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Endpoint not found");
}
