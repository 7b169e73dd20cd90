use async_trait::async_trait;
use insightwatch_core::{CoreError, Insight};
use notify_rust::Notification;
use tracing::debug;

/// Pluggable alert sink for newly accepted insights.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, source: &str, insights: &[Insight]) -> Result<(), CoreError>;
}

/// Desktop notification through the platform notification daemon.
pub struct DesktopNotifier;

#[async_trait]
impl Notifier for DesktopNotifier {
    async fn notify(&self, source: &str, insights: &[Insight]) -> Result<(), CoreError> {
        let Some(best) = insights
            .iter()
            .max_by(|a, b| a.relevance_score.total_cmp(&b.relevance_score))
        else {
            return Ok(());
        };

        let summary = format!("{} new insights from r/{}", insights.len(), source);
        let body = best.title.chars().take(120).collect::<String>();

        // The D-Bus / platform call blocks.
        tokio::task::spawn_blocking(move || {
            Notification::new()
                .summary(&summary)
                .body(&body)
                .appname("insightwatch")
                .show()
                .map(|_| ())
                .map_err(|e| CoreError::Internal {
                    message: format!("desktop notification failed: {e}"),
                })
        })
        .await
        .map_err(|e| CoreError::Internal {
            message: format!("notification task failed: {e}"),
        })??;

        debug!("Desktop notification sent");
        Ok(())
    }
}

/// Notifier used when notifications are disabled, and in tests.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _source: &str, _insights: &[Insight]) -> Result<(), CoreError> {
        Ok(())
    }
}
