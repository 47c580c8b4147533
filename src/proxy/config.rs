use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, warn};

// Upstream header profile. Each profile is enforced as an independent
// rate-limit bucket upstream, so it doubles as the quota class qualifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderMode {
    Cli,
    Antigravity,
}

impl Default for HeaderMode {
    fn default() -> Self {
        Self::Antigravity
    }
}

impl HeaderMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "cli" => Some(Self::Cli),
            "antigravity" => Some(Self::Antigravity),
            _ => None,
        }
    }

    pub fn quota_class(self) -> &'static str {
        match self {
            Self::Cli => "cli",
            Self::Antigravity => "antigravity",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingLevel {
    Minimal,
    Low,
    Medium,
    High,
}

impl ThinkingLevel {
    pub fn as_upstream(self) -> &'static str {
        match self {
            Self::Minimal => "MINIMAL",
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionStrategy {
    Sticky,
    RoundRobin,
    Hybrid,
}

impl Default for SelectionStrategy {
    fn default() -> Self {
        Self::Hybrid
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthScoreConfig {
    pub initial: i32,
    pub min: i32,
    pub max: i32,
    pub success_delta: i32,
    pub rate_limit_penalty: i32,
    pub failure_penalty: i32,
    pub recovery_per_hour: i32,
}

impl Default for HealthScoreConfig {
    fn default() -> Self {
        Self {
            initial: 70,
            min: 50,
            max: 100,
            success_delta: 1,
            rate_limit_penalty: 10,
            failure_penalty: 20,
            recovery_per_hour: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TokenBucketConfig {
    pub capacity: f64,
    pub refill_per_minute: f64,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            capacity: 50.0,
            refill_per_minute: 6.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QuotaSelectionConfig {
    pub low_threshold: f64,
    pub critical_threshold: f64,
    pub rotation_threshold: f64,
    pub stale_ms: i64,
}

impl Default for QuotaSelectionConfig {
    fn default() -> Self {
        Self {
            low_threshold: 0.1,
            critical_threshold: 0.05,
            rotation_threshold: 0.3,
            stale_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionRotationConfig {
    pub max_messages: usize,
    pub max_tokens: u64,
}

impl Default for SessionRotationConfig {
    fn default() -> Self {
        Self {
            max_messages: 120,
            max_tokens: 2_000_000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AccountSelectionConfig {
    pub strategy: SelectionStrategy,
    pub health_score: HealthScoreConfig,
    pub token_bucket: TokenBucketConfig,
    pub quota: QuotaSelectionConfig,
    pub session: SessionRotationConfig,
}

// Per-requested-model routing rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelRule {
    pub hidden: bool,
    pub pinned: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mapping: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyConfig {
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub default_cooldown_ms: u64,
    pub max_cooldown_ms: u64,
    pub max_wait_before_error_ms: u64,
    pub max_context_tokens: u32,
    pub max_concurrent_requests: u32,
    pub infinite_retry_mode: bool,
    pub auto_fallback: bool,
    pub wait_progress_updates: bool,
    #[serde(rename = "geminiHeaderMode")]
    pub header_mode: HeaderMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_thinking_level: Option<ThinkingLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_thinking_budget: Option<u32>,
    pub account_selection: AccountSelectionConfig,
    pub model_mapping: HashMap<String, ModelRule>,
    pub fallback_chain: HashMap<String, String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: crate::constants::DEFAULT_PORT,
            api_key: None,
            max_retries: 3,
            retry_base_ms: 1_000,
            retry_max_ms: 30_000,
            default_cooldown_ms: 60_000,
            max_cooldown_ms: 1_800_000,
            max_wait_before_error_ms: 600_000,
            max_context_tokens: 0,
            max_concurrent_requests: crate::constants::MAX_CONCURRENT_REQUESTS,
            infinite_retry_mode: false,
            auto_fallback: false,
            wait_progress_updates: true,
            header_mode: HeaderMode::default(),
            default_thinking_level: None,
            default_thinking_budget: None,
            account_selection: AccountSelectionConfig::default(),
            model_mapping: HashMap::new(),
            fallback_chain: default_fallback_chain(),
        }
    }
}

fn default_fallback_chain() -> HashMap<String, String> {
    let mut chain = HashMap::new();
    chain.insert(
        "gemini-3-pro-high".to_string(),
        "gemini-3-pro-low".to_string(),
    );
    chain.insert(
        "gemini-3-pro-low".to_string(),
        "gemini-3-flash".to_string(),
    );
    chain
}

pub fn config_path() -> std::path::PathBuf {
    if let Ok(path) = std::env::var("TRESTLE_CONFIG") {
        if !path.trim().is_empty() {
            return std::path::PathBuf::from(path);
        }
    }
    crate::constants::data_dir().join("trestle.json")
}

pub fn load_config() -> crate::error::AppResult<ProxyConfig> {
    let path = config_path();
    if !path.exists() {
        info!("No config file at {:?}, using defaults", path);
        return Ok(ProxyConfig::default());
    }

    let content = std::fs::read_to_string(&path)?;
    serde_json::from_str(&content).map_err(crate::error::AppError::from)
}

// Walk the fallback chain from `start`; returns the visited models or an
// error when a cycle closes.
fn walk_fallback_chain(
    chain: &HashMap<String, String>,
    start: &str,
) -> Result<Vec<String>, String> {
    let mut seen = vec![start.to_string()];
    let mut cursor = start.to_string();
    while let Some(next) = chain.get(&cursor) {
        if seen.iter().any(|m| m == next) {
            return Err(format!(
                "fallback chain contains a cycle: {} -> {}",
                seen.join(" -> "),
                next
            ));
        }
        seen.push(next.clone());
        cursor = next.clone();
    }
    Ok(seen)
}

pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if !(1..=20).contains(&config.max_retries) {
        errors.push(format!(
            "maxRetries must be in [1, 20], got {}",
            config.max_retries
        ));
    }
    if config.retry_base_ms == 0 || config.retry_base_ms > config.retry_max_ms {
        errors.push(format!(
            "retryBaseMs/retryMaxMs band is invalid: [{}, {}]",
            config.retry_base_ms, config.retry_max_ms
        ));
    }
    if config.max_concurrent_requests == 0 {
        errors.push("maxConcurrentRequests must be at least 1".to_string());
    }
    if config.account_selection.quota.critical_threshold
        > config.account_selection.quota.low_threshold
    {
        errors.push("quota.criticalThreshold must not exceed quota.lowThreshold".to_string());
    }

    for start in config.fallback_chain.keys() {
        if let Err(e) = walk_fallback_chain(&config.fallback_chain, start) {
            errors.push(e);
            break;
        }
    }

    if config.api_key.is_none() {
        warn!("[W-NO-API-KEY] client_authentication_disabled_no_api_key_configured");
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

// The ordered list of models to try for a request: the resolved model first,
// then the configured fallback chain behind it. Pinned models never descend.
pub fn fallback_models(config: &ProxyConfig, model: &str) -> Vec<String> {
    if !config.auto_fallback {
        return vec![model.to_string()];
    }
    if config
        .model_mapping
        .get(model)
        .map(|rule| rule.pinned)
        .unwrap_or(false)
    {
        return vec![model.to_string()];
    }
    walk_fallback_chain(&config.fallback_chain, model).unwrap_or_else(|_| vec![model.to_string()])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ProxyConfig::default();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn retries_out_of_range_rejected() {
        let mut config = ProxyConfig::default();
        config.max_retries = 0;
        assert!(validate_config(&config).is_err());
        config.max_retries = 21;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn fallback_cycle_is_rejected() {
        let mut config = ProxyConfig::default();
        config.fallback_chain.clear();
        config
            .fallback_chain
            .insert("a".to_string(), "b".to_string());
        config
            .fallback_chain
            .insert("b".to_string(), "a".to_string());

        let errors = validate_config(&config).expect_err("cycle should fail validation");
        assert!(errors.iter().any(|e| e.contains("cycle")));
    }

    #[test]
    fn fallback_models_walks_the_chain() {
        let mut config = ProxyConfig::default();
        config.auto_fallback = true;
        let chain = fallback_models(&config, "gemini-3-pro-high");
        assert_eq!(
            chain,
            vec!["gemini-3-pro-high", "gemini-3-pro-low", "gemini-3-flash"]
        );
    }

    #[test]
    fn pinned_models_never_descend_the_chain() {
        let mut config = ProxyConfig::default();
        config.auto_fallback = true;
        config.model_mapping.insert(
            "gemini-3-pro-high".to_string(),
            ModelRule {
                pinned: true,
                ..Default::default()
            },
        );
        assert_eq!(
            fallback_models(&config, "gemini-3-pro-high"),
            vec!["gemini-3-pro-high"]
        );
    }

    #[test]
    fn fallback_disabled_returns_single_model() {
        let mut config = ProxyConfig::default();
        config.auto_fallback = false;
        assert_eq!(
            fallback_models(&config, "gemini-3-pro-high"),
            vec!["gemini-3-pro-high"]
        );
    }

    #[test]
    fn header_mode_maps_to_quota_class() {
        assert_eq!(HeaderMode::Cli.quota_class(), "cli");
        assert_eq!(HeaderMode::Antigravity.quota_class(), "antigravity");
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = ProxyConfig::default();
        let json = serde_json::to_string(&config).expect("serialize");
        assert!(json.contains("geminiHeaderMode"));
        assert!(json.contains("maxWaitBeforeErrorMs"));
        let restored: ProxyConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(restored.port, config.port);
        assert_eq!(restored.max_retries, config.max_retries);
    }
}
