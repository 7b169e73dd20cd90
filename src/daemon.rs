//! Commands that run the monitor in this process.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Result};
use background_service::{
    digest, server, shutdown_signal, ApiState, DesktopNotifier, HealthReporter,
    MonitoringPipeline, NoopNotifier, Notifier, Supervisor,
};
use chrono::{NaiveDate, Utc};
use database::Database;
use insightwatch_core::{AppConfig, ErrorExt, InsightStore, RelevanceScorer};
use reddit_client::RedditClient;
use tokio::sync::RwLock;
use tracing::{info, warn};

fn build_pipeline(config: &AppConfig, store: Arc<dyn InsightStore>) -> Result<MonitoringPipeline> {
    let feed = Arc::new(RedditClient::from_config(config)?);
    Ok(MonitoringPipeline::new(
        feed,
        store,
        RelevanceScorer::new(config.keywords.clone()),
        config.subreddit.clone(),
        config.post_limit,
        config.min_relevance_score,
    ))
}

pub async fn run(config: AppConfig) -> Result<ExitCode> {
    let paths = config.paths();
    info!(
        subreddit = %config.subreddit,
        port = config.api_port,
        data_dir = %paths.root.display(),
        "Starting InsightWatch daemon"
    );

    let db = Arc::new(Database::open(&paths.database).await?);
    let store: Arc<dyn InsightStore> = db.clone();
    let pipeline = build_pipeline(&config, store.clone())?;

    let mut reporter = HealthReporter::new(Utc::now()).with_persistence(paths.health.clone());
    match store.insight_count().await {
        Ok(total) => reporter.seed_total(total),
        Err(e) => {
            e.log_warn();
        }
    }
    let health = Arc::new(RwLock::new(reporter));

    let notifier: Arc<dyn Notifier> = if config.notifications {
        Arc::new(DesktopNotifier)
    } else {
        Arc::new(NoopNotifier)
    };

    let (supervisor, handle) =
        Supervisor::new(pipeline, health.clone(), notifier, config.check_interval());
    let supervisor = supervisor.with_digest_dir(paths.digests.clone());

    let listener = server::bind(config.api_port).await?;
    let api_state = ApiState {
        health,
        supervisor: handle.clone(),
        store,
        port: config.api_port,
    };
    let server_stop = handle.clone();
    let server = tokio::spawn(server::serve(listener, api_state, async move {
        server_stop.wait_stopped().await
    }));

    let signal_handle = handle.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_handle.request_stop();
    });

    supervisor.run().await;

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            e.log_error();
        }
        Err(e) => warn!("Health API task failed: {}", e),
    }
    db.close().await;
    info!("InsightWatch daemon exited");
    Ok(ExitCode::SUCCESS)
}

pub async fn check(config: AppConfig) -> Result<ExitCode> {
    let paths = config.paths();
    let db = Database::open(&paths.database).await?;
    let pipeline = build_pipeline(&config, Arc::new(db))?;

    let outcome = pipeline.run_once().await;
    if let Some(error) = outcome.error {
        bail!("Check failed: {error}");
    }

    let now = Utc::now();
    let text = digest::render(&config.subreddit, &outcome.accepted, now);
    println!("{text}");
    let path = digest::write_digest(&paths.digests, &digest::daily_file_name(now), &text)?;
    println!(
        "Evaluated {} new posts, {} accepted. Digest saved to {}",
        outcome.evaluated_count,
        outcome.accepted_count,
        path.display()
    );
    if outcome.storage_errors > 0 {
        eprintln!("{} posts could not be stored; see the log.", outcome.storage_errors);
    }
    Ok(ExitCode::SUCCESS)
}

pub async fn digest(config: AppConfig, since: Option<NaiveDate>) -> Result<ExitCode> {
    let paths = config.paths();
    let day = since.unwrap_or_else(|| Utc::now().date_naive());
    let Some(start) = day.and_hms_opt(0, 0, 0) else {
        bail!("Invalid date {day}");
    };

    let db = Database::open(&paths.database).await?;
    let insights = db.list_insights(Some(start.and_utc())).await?;
    println!("{}", digest::render(&config.subreddit, &insights, Utc::now()));
    db.close().await;
    Ok(ExitCode::SUCCESS)
}
