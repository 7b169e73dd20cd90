use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use insightwatch_core::{CoreError, DatabaseError, Insight, InsightStore};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};


const INSIGHT_COLUMNS: &str = "post_id, title, author, upvotes, num_comments, url, excerpt, \
                               relevance_score, created_utc, discovered_at";

/// SQLite-backed insight store. Every statement commits before returning.
pub struct Database {
    connection_string: String,
    pool: Option<SqlitePool>,
}

impl Database {
    pub fn new(connection_string: String) -> Self {
        Self {
            connection_string,
            pool: None,
        }
    }

    /// Connect and migrate the database file at `path`, creating it if needed.
    pub async fn open(path: &Path) -> Result<Self, CoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut db = Self::new(format!("sqlite://{}", path.display()));
        db.connect().await?;
        db.run_migrations().await?;
        Ok(db)
    }

    pub async fn connect(&mut self) -> Result<(), CoreError> {
        let options = SqliteConnectOptions::from_str(&self.connection_string)
            .map_err(|e| DatabaseError::ConnectionFailed {
                reason: e.to_string(),
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(Duration::from_secs(5));

        // One connection: the pipeline is the only writer.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| DatabaseError::ConnectionFailed {
                reason: e.to_string(),
            })?;

        debug!("Connected to {}", self.connection_string);
        self.pool = Some(pool);
        Ok(())
    }

    pub async fn run_migrations(&self) -> Result<(), CoreError> {
        sqlx::migrate!("./migrations")
            .run(self.pool()?)
            .await
            .map_err(|e| DatabaseError::MigrationFailed {
                migration: e.to_string(),
            })?;
        info!("Insight store migrations applied");
        Ok(())
    }

    pub async fn close(&self) {
        if let Some(pool) = &self.pool {
            pool.close().await;
        }
    }

    pub async fn processed_count(&self) -> Result<u64, CoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM processed_posts")
            .fetch_one(self.pool()?)
            .await
            .map_err(|e| sql_error(e, "count processed"))?;
        Ok(count.max(0) as u64)
    }

    fn pool(&self) -> Result<&SqlitePool, CoreError> {
        self.pool.as_ref().ok_or_else(|| {
            DatabaseError::ConnectionFailed {
                reason: "database not connected".to_string(),
            }
            .into()
        })
    }
}

#[async_trait]
impl InsightStore for Database {
    async fn has_processed(&self, post_id: &str) -> Result<bool, CoreError> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM processed_posts WHERE post_id = ?")
                .bind(post_id)
                .fetch_optional(self.pool()?)
                .await
                .map_err(|e| sql_error(e, "has_processed"))?;
        Ok(found.is_some())
    }

    async fn record_processed(&self, post_id: &str) -> Result<(), CoreError> {
        sqlx::query("INSERT OR IGNORE INTO processed_posts (post_id, processed_at) VALUES (?, ?)")
            .bind(post_id)
            .bind(format_timestamp(&Utc::now()))
            .execute(self.pool()?)
            .await
            .map_err(|e| sql_error(e, "record_processed"))?;
        Ok(())
    }

    async fn add_insight(&self, insight: &Insight) -> Result<(), CoreError> {
        let statement = format!(
            "INSERT INTO insights ({INSIGHT_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        );

        let result = sqlx::query(&statement)
            .bind(&insight.post_id)
            .bind(&insight.title)
            .bind(&insight.author)
            .bind(insight.upvotes)
            .bind(i64::from(insight.num_comments))
            .bind(&insight.url)
            .bind(&insight.excerpt)
            .bind(insight.relevance_score)
            .bind(insight.created_utc)
            .bind(format_timestamp(&insight.discovered_at))
            .execute(self.pool()?)
            .await;

        match result {
            Ok(_) => {
                debug!(post_id = %insight.post_id, "Stored insight");
                Ok(())
            }
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(DatabaseError::DuplicateInsight {
                    post_id: insight.post_id.clone(),
                }
                .into())
            }
            Err(e) => Err(sql_error(e, "add_insight")),
        }
    }

    async fn list_insights(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Insight>, CoreError> {
        let pool = self.pool()?;
        let rows = match since {
            Some(since) => {
                let statement = format!(
                    "SELECT {INSIGHT_COLUMNS} FROM insights WHERE discovered_at >= ? \
                     ORDER BY discovered_at ASC, id ASC"
                );
                sqlx::query(&statement)
                    .bind(format_timestamp(&since))
                    .fetch_all(pool)
                    .await
            }
            None => {
                let statement = format!(
                    "SELECT {INSIGHT_COLUMNS} FROM insights ORDER BY discovered_at ASC, id ASC"
                );
                sqlx::query(&statement).fetch_all(pool).await
            }
        }
        .map_err(|e| sql_error(e, "list_insights"))?;

        rows.iter().map(insight_from_row).collect()
    }

    async fn recent_insights(&self, limit: usize) -> Result<Vec<Insight>, CoreError> {
        let statement = format!(
            "SELECT {INSIGHT_COLUMNS} FROM insights ORDER BY discovered_at DESC, id DESC LIMIT ?"
        );
        let rows = sqlx::query(&statement)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(self.pool()?)
            .await
            .map_err(|e| sql_error(e, "recent_insights"))?;

        rows.iter().map(insight_from_row).collect()
    }

    async fn insight_count(&self) -> Result<u64, CoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM insights")
            .fetch_one(self.pool()?)
            .await
            .map_err(|e| sql_error(e, "insight_count"))?;
        Ok(count.max(0) as u64)
    }
}

/// Fixed-width UTC timestamps so text ordering matches time ordering.
fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, CoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| {
            DatabaseError::CorruptRecord {
                details: format!("bad timestamp '{raw}': {e}"),
            }
            .into()
        })
}

fn insight_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Insight, CoreError> {
    let num_comments: i64 = row.try_get("num_comments").map_err(DatabaseError::from)?;
    let discovered_at: String = row.try_get("discovered_at").map_err(DatabaseError::from)?;

    Ok(Insight {
        post_id: row.try_get("post_id").map_err(DatabaseError::from)?,
        title: row.try_get("title").map_err(DatabaseError::from)?,
        author: row.try_get("author").map_err(DatabaseError::from)?,
        upvotes: row.try_get("upvotes").map_err(DatabaseError::from)?,
        num_comments: u32::try_from(num_comments).unwrap_or(0),
        url: row.try_get("url").map_err(DatabaseError::from)?,
        excerpt: row.try_get("excerpt").map_err(DatabaseError::from)?,
        relevance_score: row.try_get("relevance_score").map_err(DatabaseError::from)?,
        created_utc: row.try_get("created_utc").map_err(DatabaseError::from)?,
        discovered_at: parse_timestamp(&discovered_at)?,
    })
}

fn sql_error(error: sqlx::Error, query: &str) -> CoreError {
    let locked = matches!(
        &error,
        sqlx::Error::Database(db_err) if db_err.message().contains("locked")
    );
    if locked {
        return DatabaseError::DatabaseLocked.into();
    }
    if matches!(error, sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut) {
        return DatabaseError::QueryFailed {
            query: format!("{query}: {error}"),
        }
        .into();
    }
    DatabaseError::Sql(error).into()
}
