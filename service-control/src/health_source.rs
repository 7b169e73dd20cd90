use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use insightwatch_core::state_file::read_json;
use insightwatch_core::HealthRecord;
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthOrigin {
    /// Answered by the running daemon.
    Live,
    /// Read from the last persisted snapshot.
    Snapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReading {
    pub record: HealthRecord,
    pub origin: HealthOrigin,
}

#[async_trait]
pub trait HealthSource: Send + Sync {
    async fn fetch(&self) -> Option<HealthReading>;
}

/// Queries the daemon's `/api/health`, falling back to `health.json`.
pub struct HttpHealthSource {
    client: reqwest::Client,
    url: String,
    snapshot: PathBuf,
}

impl HttpHealthSource {
    pub fn new(port: u16, snapshot: PathBuf) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .unwrap_or_default();
        Self {
            client,
            url: format!("http://127.0.0.1:{port}/api/health"),
            snapshot,
        }
    }

    async fn fetch_live(&self) -> Result<HealthRecord, reqwest::Error> {
        self.client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }
}

#[async_trait]
impl HealthSource for HttpHealthSource {
    async fn fetch(&self) -> Option<HealthReading> {
        match self.fetch_live().await {
            Ok(record) => {
                return Some(HealthReading {
                    record,
                    origin: HealthOrigin::Live,
                })
            }
            Err(e) => debug!("Health endpoint unavailable ({}), reading snapshot", e),
        }

        match read_json::<HealthRecord>(&self.snapshot) {
            Ok(record) => record.map(|record| HealthReading {
                record: record.as_of(Utc::now()),
                origin: HealthOrigin::Snapshot,
            }),
            Err(e) => {
                debug!("Health snapshot unreadable: {}", e);
                None
            }
        }
    }
}
