//! Application-only OAuth2 (client credentials) against Reddit.

use insightwatch_core::{CoreError, RedditApiError};
use oauth2::basic::{BasicClient, BasicErrorResponse};
use oauth2::{
    AuthUrl, ClientId, ClientSecret, HttpRequest, HttpResponse, RequestTokenError, Scope,
    TokenResponse, TokenUrl,
};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};
use tracing::{debug, info};

const REDDIT_AUTH_URL: &str = "https://www.reddit.com/api/v1/authorize";
const REDDIT_TOKEN_URL: &str = "https://www.reddit.com/api/v1/access_token";

/// Refresh this long before the token actually expires.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct RedditOAuth2Config {
    pub client_id: String,
    pub client_secret: String,
    pub user_agent: String,
}

impl RedditOAuth2Config {
    pub fn new(client_id: String, client_secret: String, user_agent: String) -> Self {
        Self {
            client_id,
            client_secret,
            user_agent,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedditToken {
    pub access_token: String,
    pub expires_at: SystemTime,
    pub scope: Vec<String>,
}

impl RedditToken {
    pub fn is_expired(&self) -> bool {
        SystemTime::now() + EXPIRY_MARGIN >= self.expires_at
    }
}

pub(crate) fn build_oauth_client(config: &RedditOAuth2Config) -> Result<BasicClient, CoreError> {
    let auth_url = AuthUrl::new(REDDIT_AUTH_URL.to_string()).map_err(|e| {
        RedditApiError::AuthenticationFailed {
            reason: format!("invalid auth url: {e}"),
        }
    })?;
    let token_url = TokenUrl::new(REDDIT_TOKEN_URL.to_string()).map_err(|e| {
        RedditApiError::AuthenticationFailed {
            reason: format!("invalid token url: {e}"),
        }
    })?;

    Ok(BasicClient::new(
        ClientId::new(config.client_id.clone()),
        Some(ClientSecret::new(config.client_secret.clone())),
        auth_url,
        Some(token_url),
    ))
}

pub(crate) async fn request_token(
    oauth: &BasicClient,
    http_client: &reqwest::Client,
) -> Result<RedditToken, CoreError> {
    debug!("Requesting application-only Reddit token");

    let response = oauth
        .exchange_client_credentials()
        .add_scope(Scope::new("read".to_string()))
        .request_async(|request| send_token_request(http_client.clone(), request))
        .await
        .map_err(token_error)?;

    let lifetime = response
        .expires_in()
        .unwrap_or_else(|| Duration::from_secs(3600));
    let scope = response
        .scopes()
        .map(|scopes| scopes.iter().map(|s| s.as_str().to_string()).collect())
        .unwrap_or_else(|| vec!["read".to_string()]);

    info!("Obtained Reddit access token, valid for {:?}", lifetime);
    Ok(RedditToken {
        access_token: response.access_token().secret().clone(),
        expires_at: SystemTime::now() + lifetime,
        scope,
    })
}

/// Token requests go through the same client as API calls so Reddit sees our user agent.
async fn send_token_request(
    client: reqwest::Client,
    request: HttpRequest,
) -> Result<HttpResponse, reqwest::Error> {
    let mut builder = client
        .request(request.method, request.url.as_str())
        .body(request.body);
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_bytes());
    }

    let response = builder.send().await?;
    let status_code = response.status();
    let headers = response.headers().to_owned();
    let body = response.bytes().await?.to_vec();

    Ok(HttpResponse {
        status_code,
        headers,
        body,
    })
}

fn token_error(error: RequestTokenError<reqwest::Error, BasicErrorResponse>) -> CoreError {
    match error {
        RequestTokenError::ServerResponse(response) => {
            RedditApiError::AuthenticationFailed {
                reason: response.error().to_string(),
            }
            .into()
        }
        RequestTokenError::Request(e) if e.is_timeout() => RedditApiError::RequestTimeout.into(),
        RequestTokenError::Request(e) => CoreError::Network(e),
        RequestTokenError::Parse(e, _) => RedditApiError::InvalidResponse {
            details: format!("token response: {e}"),
        }
        .into(),
        RequestTokenError::Other(reason) => RedditApiError::AuthenticationFailed { reason }.into(),
    }
}
