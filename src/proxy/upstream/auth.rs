use crate::models::Account;
use crate::proxy::google::endpoints::OAUTH_TOKEN_ENDPOINT;
use crate::proxy::mappers::error_classifier::is_permanent_auth_failure;
use dashmap::DashMap;
use serde::Deserialize;
use tracing::{debug, info, warn};

// Refresh slack: a token within this window of expiry is refreshed early.
const EXPIRY_SLACK_SECS: i64 = 120;

const OAUTH_CLIENT_ID: &str =
    "681255809395-oo8ft2oprdrnp9e3aqf6av3hmdib135j.apps.googleusercontent.com";
const OAUTH_CLIENT_SECRET: &str = "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";

#[derive(Debug)]
pub enum AuthError {
    // The credential is dead; the account must be invalidated.
    Permanent(String),
    Transient(String),
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::Permanent(msg) => write!(f, "permanent auth failure: {}", msg),
            AuthError::Transient(msg) => write!(f, "transient auth failure: {}", msg),
        }
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: i64,
}

// Exchanges long-lived credentials for short-lived bearer tokens, cached per
// account until shortly before expiry.
pub struct AuthManager {
    http: reqwest::Client,
    tokens: DashMap<String, CachedToken>,
}

impl AuthManager {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            tokens: DashMap::new(),
        }
    }

    pub async fn get_token(&self, account: &Account) -> Result<String, AuthError> {
        // API-key identities skip the refresh dance entirely.
        if let Some(api_key) = &account.api_key {
            return Ok(api_key.clone());
        }

        let now = chrono::Utc::now().timestamp();
        if let Some(cached) = self.tokens.get(&account.email) {
            if cached.expires_at - EXPIRY_SLACK_SECS > now {
                return Ok(cached.access_token.clone());
            }
        }

        let refresh_token = account
            .refresh_token
            .as_deref()
            .ok_or_else(|| AuthError::Permanent("account has no credential".to_string()))?;

        debug!("Refreshing access token for {}", account.email);
        let response = self
            .http
            .post(OAUTH_TOKEN_ENDPOINT)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", OAUTH_CLIENT_ID),
                ("client_secret", OAUTH_CLIENT_SECRET),
            ])
            .send()
            .await
            .map_err(|e| AuthError::Transient(format!("token endpoint unreachable: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AuthError::Transient(format!("token response unreadable: {}", e)))?;

        if !status.is_success() {
            if is_permanent_auth_failure(&body) {
                warn!(
                    "Refresh for {} failed permanently: {}",
                    account.email,
                    body.chars().take(200).collect::<String>()
                );
                return Err(AuthError::Permanent(body));
            }
            return Err(AuthError::Transient(format!(
                "token refresh returned {}: {}",
                status, body
            )));
        }

        let parsed: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| AuthError::Transient(format!("token response malformed: {}", e)))?;
        let expires_at = now + parsed.expires_in.max(60);
        self.tokens.insert(
            account.email.clone(),
            CachedToken {
                access_token: parsed.access_token.clone(),
                expires_at,
            },
        );
        info!(
            "Access token refreshed for {} (valid {}s)",
            account.email, parsed.expires_in
        );
        Ok(parsed.access_token)
    }

    // Drop the cached token so the next call refreshes. Used after an
    // upstream 401 on a token that looked valid.
    pub fn invalidate(&self, email: &str) {
        if self.tokens.remove(email).is_some() {
            debug!("Dropped cached token for {}", email);
        }
    }
}
