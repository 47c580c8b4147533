use crate::models::{QuotaSnapshot, SubscriptionTier};
use crate::proxy::config::HeaderMode;
use crate::proxy::google::endpoints;
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use std::collections::HashMap;
use tokio::time::Duration;
use tracing::{debug, info, warn};

// HTTP face of the G-format service: ordered host fallback, `:method` URL
// building, and the per-profile header set.
pub struct UpstreamClient {
    http: Client,
    base_hosts: Vec<String>,
    header_mode: HeaderMode,
}

impl UpstreamClient {
    pub fn new(header_mode: HeaderMode) -> Self {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(20))
            .pool_max_idle_per_host(16)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .timeout(Duration::from_secs(600))
            .user_agent(crate::constants::USER_AGENT.as_str())
            .build()
            .expect("Failed to create upstream HTTP client");
        Self {
            http,
            base_hosts: endpoints::cloudcode_hosts()
                .into_iter()
                .map(String::from)
                .collect(),
            header_mode,
        }
    }

    #[cfg(test)]
    pub fn new_for_test(base_url: &str) -> Self {
        let mut client = Self::new(HeaderMode::Antigravity);
        client.base_hosts = vec![base_url.to_string()];
        client
    }

    pub fn http(&self) -> Client {
        self.http.clone()
    }

    pub fn hosts(&self) -> &[String] {
        &self.base_hosts
    }

    fn profile_headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![(
            "x-goog-api-client",
            format!("gl-rust/{} cloudcode", env!("CARGO_PKG_VERSION")),
        )];
        match self.header_mode {
            HeaderMode::Cli => {
                headers.push(("x-client-profile", "gemini-cli".to_string()));
            }
            HeaderMode::Antigravity => {
                headers.push(("x-client-profile", "antigravity".to_string()));
            }
        }
        headers
    }

    fn should_try_next_host(status: StatusCode) -> bool {
        status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::NOT_FOUND
            || status.is_server_error()
    }

    // POST one `:method` call against a single host.
    pub async fn call_host(
        &self,
        host: &str,
        method: &str,
        access_token: &str,
        body: &Value,
        query: Option<&str>,
    ) -> Result<Response, reqwest::Error> {
        let url = endpoints::colon_method_url(host, method, query);
        let mut request = self
            .http
            .post(&url)
            .bearer_auth(access_token)
            .header("Content-Type", "application/json");
        for (name, value) in self.profile_headers() {
            request = request.header(name, value);
        }
        request.json(body).send().await
    }

    // POST a `:method` call, falling down the host list on transient
    // failures. Non-retryable statuses return immediately.
    pub async fn call_with_fallback(
        &self,
        method: &str,
        access_token: &str,
        body: &Value,
        query: Option<&str>,
    ) -> Result<Response, String> {
        let mut last_err: Option<String> = None;
        let host_count = self.base_hosts.len();
        for (idx, host) in self.base_hosts.iter().enumerate() {
            let has_next = idx + 1 < host_count;
            match self.call_host(host, method, access_token, body, query).await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        if idx > 0 {
                            info!(
                                "✓ Upstream fallback succeeded | Host: {} | Status: {}",
                                host, status
                            );
                        } else {
                            debug!("✓ Upstream request succeeded | Host: {} | Status: {}", host, status);
                        }
                        return Ok(resp);
                    }
                    if has_next && Self::should_try_next_host(status) {
                        warn!(
                            "Upstream host {} returned {} (method={}), trying next host",
                            host, status, method
                        );
                        last_err = Some(format!("Upstream {} returned {}", host, status));
                        continue;
                    }
                    return Ok(resp);
                }
                Err(e) => {
                    let msg = format!("HTTP request failed at {}: {}", host, e);
                    debug!("{}", msg);
                    last_err = Some(msg);
                    if !has_next {
                        break;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| "All upstream hosts failed".to_string()))
    }

    // Quota discovery. Returns per-model snapshots from the metadata
    // endpoint; absent or malformed payloads yield an empty map.
    pub async fn fetch_quota_snapshot(
        &self,
        access_token: &str,
        project_id: &str,
    ) -> Result<HashMap<String, QuotaSnapshot>, String> {
        let body = serde_json::json!({"project": project_id});
        let response = self
            .call_with_fallback("fetchAvailableModels", access_token, &body, None)
            .await?;
        let status = response.status();
        let payload: Value = response
            .json()
            .await
            .map_err(|e| format!("fetchAvailableModels unreadable: {}", e))?;
        if !status.is_success() {
            return Err(format!("fetchAvailableModels returned {}", status));
        }
        Ok(parse_quota_snapshot(&payload))
    }

    // Subscription-tier and project discovery.
    pub async fn load_code_assist(
        &self,
        access_token: &str,
    ) -> Result<(Option<String>, SubscriptionTier), String> {
        let body = serde_json::json!({
            "metadata": {"pluginType": "GEMINI"}
        });
        let response = self
            .call_with_fallback("loadCodeAssist", access_token, &body, None)
            .await?;
        let status = response.status();
        let payload: Value = response
            .json()
            .await
            .map_err(|e| format!("loadCodeAssist unreadable: {}", e))?;
        if !status.is_success() {
            return Err(format!("loadCodeAssist returned {}", status));
        }
        Ok(parse_code_assist(&payload))
    }
}

pub fn parse_quota_snapshot(payload: &Value) -> HashMap<String, QuotaSnapshot> {
    let mut snapshot = HashMap::new();
    let Some(models) = payload.get("models").and_then(|m| m.as_array()) else {
        return snapshot;
    };
    for model in models {
        let Some(id) = model
            .get("model")
            .or_else(|| model.get("modelId"))
            .and_then(|v| v.as_str())
        else {
            continue;
        };
        let quota = model.get("quotaInfo").unwrap_or(model);
        let remaining_fraction = quota
            .get("remainingFraction")
            .and_then(|v| v.as_f64())
            .unwrap_or(1.0);
        let reset_time = quota
            .get("resetTime")
            .and_then(|v| v.as_str())
            .map(String::from);
        snapshot.insert(
            id.to_string(),
            QuotaSnapshot {
                remaining_fraction,
                reset_time,
            },
        );
    }
    snapshot
}

pub fn parse_code_assist(payload: &Value) -> (Option<String>, SubscriptionTier) {
    let project = payload
        .get("cloudaicompanionProject")
        .and_then(|v| v.as_str())
        .map(String::from);
    let tier = payload
        .get("currentTier")
        .and_then(|t| t.get("id"))
        .and_then(|v| v.as_str())
        .map(SubscriptionTier::parse)
        .unwrap_or(SubscriptionTier::Unknown);
    (project, tier)
}
