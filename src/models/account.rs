use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    Free,
    Pro,
    Ultra,
    Unknown,
}

impl Default for SubscriptionTier {
    fn default() -> Self {
        Self::Unknown
    }
}

impl SubscriptionTier {
    pub fn parse(raw: &str) -> Self {
        let lowered = raw.to_ascii_lowercase();
        if lowered.contains("ultra") {
            Self::Ultra
        } else if lowered.contains("pro") {
            Self::Pro
        } else if lowered.contains("free") {
            Self::Free
        } else {
            Self::Unknown
        }
    }
}

// Per-quota-key rate-limit state. Key format: "modelId" or "modelId:quotaClass".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRateLimit {
    pub limited: bool,
    pub reset_at: i64,
}

impl ModelRateLimit {
    pub fn is_active(&self, now_ms: i64) -> bool {
        self.limited && self.reset_at > now_ms
    }
}

// Snapshot of remaining quota for one model, harvested from the upstream
// model-discovery endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub remaining_fraction: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_time: Option<String>,
}

impl QuotaSnapshot {
    pub fn reset_passed(&self, now_ms: i64) -> bool {
        self.reset_time
            .as_deref()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.timestamp_millis() <= now_ms)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub invalid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid_reason: Option<String>,
    pub added_at: i64,
    pub last_used: i64,
    #[serde(skip)]
    pub active_requests: u32,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub model_rate_limits: HashMap<String, ModelRateLimit>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub quota_snapshot: HashMap<String, QuotaSnapshot>,
    #[serde(default)]
    pub subscription_tier: SubscriptionTier,
    #[serde(default, skip_serializing_if = "HashSet::is_empty")]
    pub disabled_models: HashSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota_updated_at: Option<i64>,
}

fn default_true() -> bool {
    true
}

impl Account {
    pub fn new(email: String) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            email,
            refresh_token: None,
            api_key: None,
            project_id: None,
            enabled: true,
            invalid: false,
            invalid_reason: None,
            added_at: now,
            last_used: now,
            active_requests: 0,
            model_rate_limits: HashMap::new(),
            quota_snapshot: HashMap::new(),
            subscription_tier: SubscriptionTier::Unknown,
            disabled_models: HashSet::new(),
            quota_updated_at: None,
        }
    }

    pub fn update_last_used(&mut self) {
        self.last_used = chrono::Utc::now().timestamp_millis();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_parsing_matches_substrings() {
        assert_eq!(SubscriptionTier::parse("g1-ultra"), SubscriptionTier::Ultra);
        assert_eq!(SubscriptionTier::parse("PRO_TIER"), SubscriptionTier::Pro);
        assert_eq!(SubscriptionTier::parse("free-tier"), SubscriptionTier::Free);
        assert_eq!(SubscriptionTier::parse("legacy"), SubscriptionTier::Unknown);
    }

    #[test]
    fn active_requests_is_not_persisted() {
        let mut account = Account::new("a@example.com".to_string());
        account.active_requests = 3;

        let json = serde_json::to_string(&account).expect("serialize");
        assert!(!json.contains("active_requests"));

        let restored: Account = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(restored.active_requests, 0);
    }

    #[test]
    fn rate_limit_activity_respects_reset() {
        let limit = ModelRateLimit {
            limited: true,
            reset_at: 1_000,
        };
        assert!(limit.is_active(500));
        assert!(!limit.is_active(1_001));
    }
}
