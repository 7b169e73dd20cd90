//! Heuristic usefulness score for a post.
//!
//! Three independent signals, each normalized to `[0, 1]`, are combined with
//! fixed weights. No single signal can reach the default acceptance threshold
//! on its own.

use crate::Post;

pub const DEFAULT_MIN_RELEVANCE: f64 = 0.7;

pub const DEFAULT_KEYWORDS: &[&str] = &[
    "tip",
    "trick",
    "technique",
    "prompt",
    "workflow",
    "automation",
    "api",
    "integration",
    "coding",
    "development",
    "productivity",
    "best practice",
    "lesson learned",
    "tutorial",
    "guide",
    "method",
];

const KEYWORD_WEIGHT: f64 = 0.4;
const ENGAGEMENT_WEIGHT: f64 = 0.3;
const DISCUSSION_WEIGHT: f64 = 0.3;

/// Comment count at which a post earns the full discussion signal.
pub const DISCUSSION_THRESHOLD: u32 = 5;

#[derive(Debug, Clone)]
pub struct RelevanceScorer {
    keywords: Vec<String>,
}

impl Default for RelevanceScorer {
    fn default() -> Self {
        Self::new(DEFAULT_KEYWORDS.iter().map(|k| k.to_string()))
    }
}

impl RelevanceScorer {
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keywords = keywords
            .into_iter()
            .map(|k| k.into().trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        Self { keywords }
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    /// Score in `[0, 1]`. Total: malformed inputs contribute nothing.
    pub fn score(&self, post: &Post) -> f64 {
        let score = KEYWORD_WEIGHT * self.keyword_signal(post)
            + ENGAGEMENT_WEIGHT * engagement_signal(post.upvote_ratio)
            + DISCUSSION_WEIGHT * discussion_signal(post.num_comments);

        if score.is_nan() {
            return 0.0;
        }
        score.clamp(0.0, 1.0)
    }

    pub fn keyword_matches(&self, post: &Post) -> usize {
        let content = format!("{} {}", post.title, post.body).to_lowercase();
        self.keywords
            .iter()
            .filter(|keyword| contains_term(&content, keyword))
            .count()
    }

    fn keyword_signal(&self, post: &Post) -> f64 {
        match self.keyword_matches(post) {
            0 => 0.0,
            // First hit is worth 0.6, each further hit halves the remaining gap.
            n => 1.0 - 0.4 * 0.5_f64.powi(n as i32 - 1),
        }
    }
}

fn engagement_signal(upvote_ratio: Option<f64>) -> f64 {
    match upvote_ratio {
        Some(ratio) if ratio.is_finite() => ratio.clamp(0.0, 1.0),
        _ => 0.0,
    }
}

fn discussion_signal(num_comments: u32) -> f64 {
    if num_comments >= DISCUSSION_THRESHOLD {
        1.0
    } else {
        0.5 * f64::from(num_comments) / f64::from(DISCUSSION_THRESHOLD)
    }
}

/// Word-bounded match; a trailing plural `s` still counts.
fn contains_term(haystack: &str, term: &str) -> bool {
    let is_word = |c: char| c.is_alphanumeric();

    haystack.match_indices(term).any(|(start, _)| {
        let before_ok = haystack[..start].chars().next_back().map_or(true, |c| !is_word(c));
        let rest = &haystack[start + term.len()..];
        let rest = rest.strip_prefix('s').unwrap_or(rest);
        let after_ok = rest.chars().next().map_or(true, |c| !is_word(c));
        before_ok && after_ok
    })
}
