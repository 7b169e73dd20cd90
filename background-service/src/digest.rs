//! Human-readable digests of accepted insights.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use insightwatch_core::{CoreError, Insight};
use tracing::info;

/// Characters of excerpt shown per digest entry.
pub const DIGEST_EXCERPT_CHARS: usize = 100;

/// Render `insights` as a numbered report, highest relevance first.
pub fn render(source: &str, insights: &[Insight], generated_at: DateTime<Utc>) -> String {
    if insights.is_empty() {
        return format!("No new valuable insights found in r/{source} today.\n");
    }

    let mut sorted: Vec<&Insight> = insights.iter().collect();
    sorted.sort_by(|a, b| b.relevance_score.total_cmp(&a.relevance_score));

    let mut out = String::new();
    let _ = writeln!(
        out,
        "r/{} INSIGHT DIGEST - {}",
        source,
        generated_at.format("%Y-%m-%d %H:%M UTC")
    );
    let _ = writeln!(out, "Found {} valuable posts:\n", sorted.len());

    for (index, insight) in sorted.iter().enumerate() {
        let _ = writeln!(out, "{}. {}", index + 1, insight.title);
        let _ = writeln!(
            out,
            "   by u/{} | {} upvotes | {} comments",
            insight.author, insight.upvotes, insight.num_comments
        );
        let _ = writeln!(out, "   {}", insight.url);
        if !insight.excerpt.trim().is_empty() {
            let excerpt: String = insight.excerpt.chars().take(DIGEST_EXCERPT_CHARS).collect();
            let _ = writeln!(out, "   > {}...", excerpt.replace('\n', " "));
        }
        let _ = writeln!(out, "   Relevance: {:.2}\n", insight.relevance_score);
    }

    out
}

/// `digest_YYYYMMDD_HHMM.txt`, one per daemon run.
pub fn run_file_name(at: DateTime<Utc>) -> String {
    format!("digest_{}.txt", at.format("%Y%m%d_%H%M"))
}

/// `digest_YYYYMMDD.txt`, one per day for manual checks.
pub fn daily_file_name(at: DateTime<Utc>) -> String {
    format!("digest_{}.txt", at.format("%Y%m%d"))
}

pub fn write_digest(dir: &Path, file_name: &str, text: &str) -> Result<PathBuf, CoreError> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(file_name);
    std::fs::write(&path, text)?;
    info!("Digest written to {}", path.display());
    Ok(path)
}
