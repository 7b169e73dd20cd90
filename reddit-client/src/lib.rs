pub mod api;
pub mod auth;


use async_trait::async_trait;
use insightwatch_core::{AppConfig, CoreError, FeedClient, Post, RedditApiError};
use oauth2::basic::BasicClient;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub use api::{RedditApiClient, RedditPostData};
pub use auth::{RedditOAuth2Config, RedditToken};

/// Reddit feed client using an application-only token.
pub struct RedditClient {
    oauth: BasicClient,
    api: RedditApiClient,
    token: Mutex<Option<RedditToken>>,
}

impl RedditClient {
    pub fn new(config: RedditOAuth2Config) -> Result<Self, CoreError> {
        let oauth = auth::build_oauth_client(&config)?;
        let api = RedditApiClient::new(config.user_agent)?;

        Ok(Self {
            oauth,
            api,
            token: Mutex::new(None),
        })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, CoreError> {
        let (client_id, client_secret) = config.credentials()?;
        Self::new(RedditOAuth2Config::new(
            client_id,
            client_secret,
            config.user_agent.clone(),
        ))
    }

    pub async fn is_authenticated(&self) -> bool {
        self.token
            .lock()
            .await
            .as_ref()
            .is_some_and(|token| !token.is_expired())
    }

    pub async fn set_token(&self, token: RedditToken) {
        *self.token.lock().await = Some(token);
    }

    /// Return a valid access token, requesting a new one when absent or expired.
    pub async fn ensure_authenticated(&self) -> Result<String, CoreError> {
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref().filter(|t| !t.is_expired()) {
            return Ok(token.access_token.clone());
        }

        debug!("No valid Reddit token, authenticating");
        let token = auth::request_token(&self.oauth, self.api.http_client()).await?;
        let access_token = token.access_token.clone();
        *guard = Some(token);
        Ok(access_token)
    }

    async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }

    async fn fetch_once(&self, subreddit: &str, limit: u32) -> Result<Vec<Post>, CoreError> {
        let access_token = self.ensure_authenticated().await?;
        let listing = self
            .api
            .get_subreddit_posts(&access_token, subreddit, Some(limit))
            .await?;

        Ok(listing
            .data
            .children
            .into_iter()
            .map(|child| Post::from(child.data))
            .collect())
    }
}

#[async_trait]
impl FeedClient for RedditClient {
    async fn fetch_recent_posts(&self, source: &str, limit: u32) -> Result<Vec<Post>, CoreError> {
        match self.fetch_once(source, limit).await {
            Err(CoreError::RedditApi(RedditApiError::InvalidToken)) => {
                warn!("Reddit rejected the cached token, re-authenticating once");
                self.invalidate_token().await;
                self.fetch_once(source, limit).await
            }
            other => other,
        }
    }
}
