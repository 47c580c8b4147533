use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

// Refresh failures carrying these fragments mean the credential itself is
// dead; the account is invalidated rather than retried.
pub const PERMANENT_AUTH_FAILURES: &[&str] = &[
    "invalid_grant",
    "token revoked",
    "invalid_client",
    "credentials are invalid",
    "refresh token has expired",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    AuthExpired,
    AuthPermanentlyInvalid,
    RateLimitedUserQuota,
    RateLimitedDaily,
    RateLimitedCapacity,
    ServerTransient,
    BadRequest,
    NetworkTransient,
    ContentFiltered,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub status: u16,
    pub message: String,
    pub retry_after_ms: Option<u64>,
}

pub fn is_permanent_auth_failure(reason: &str) -> bool {
    let lowered = reason.to_ascii_lowercase();
    PERMANENT_AUTH_FAILURES
        .iter()
        .any(|fragment| lowered.contains(fragment))
}

static DURATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:(\d+)h)?(?:(\d+)m)?(?:(\d+(?:\.\d+)?)s)?(?:(\d+(?:\.\d+)?)ms)?")
        .expect("duration regex")
});

// Parse compound duration strings such as "2h1m1s", "42s" or "510.7ms".
fn parse_duration_string(s: &str) -> Option<u64> {
    let caps = DURATION_RE.captures(s)?;
    let hours = caps
        .get(1)
        .and_then(|m| m.as_str().parse::<u64>().ok())
        .unwrap_or(0);
    let minutes = caps
        .get(2)
        .and_then(|m| m.as_str().parse::<u64>().ok())
        .unwrap_or(0);
    let seconds = caps
        .get(3)
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .unwrap_or(0.0);
    let millis = caps
        .get(4)
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .unwrap_or(0.0);

    let total_ms = hours * 3_600_000
        + minutes * 60_000
        + (seconds * 1000.0).ceil() as u64
        + millis.ceil() as u64;
    if total_ms == 0 {
        None
    } else {
        Some(total_ms)
    }
}

// Extract a reset hint from the error body: structured reset-delay metadata
// first, then a handful of prose patterns.
pub fn parse_retry_delay_ms(body: &str) -> Option<u64> {
    let trimmed = body.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Ok(json) = serde_json::from_str::<Value>(trimmed) {
            if let Some(delay_str) = json
                .get("error")
                .and_then(|e| e.get("details"))
                .and_then(|d| d.as_array())
                .and_then(|a| a.first())
                .and_then(|o| o.get("metadata"))
                .and_then(|m| m.get("quotaResetDelay"))
                .and_then(|v| v.as_str())
            {
                debug!("[Classifier] Found quotaResetDelay: '{}'", delay_str);
                if let Some(ms) = parse_duration_string(delay_str) {
                    return Some(ms);
                }
            }
            if let Some(retry) = json
                .get("error")
                .and_then(|e| e.get("retry_after"))
                .and_then(|v| v.as_u64())
            {
                return Some(retry * 1000);
            }
        }
    }

    static PROSE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
        vec![
            Regex::new(r"(?i)try again in (\d+)m\s*(\d+)s").unwrap(),
            Regex::new(r"(?i)(?:try again in|backoff for|wait)\s*(\d+)s").unwrap(),
            Regex::new(r"(?i)quota will reset in (\d+) second").unwrap(),
            Regex::new(r"(?i)retry after (\d+) second").unwrap(),
        ]
    });

    if let Some(caps) = PROSE_PATTERNS[0].captures(body) {
        if let (Ok(m), Ok(s)) = (caps[1].parse::<u64>(), caps[2].parse::<u64>()) {
            return Some((m * 60 + s) * 1000);
        }
    }
    for pattern in PROSE_PATTERNS.iter().skip(1) {
        if let Some(caps) = pattern.captures(body) {
            if let Ok(s) = caps[1].parse::<u64>() {
                return Some(s * 1000);
            }
        }
    }
    None
}

fn rate_limit_kind(body: &str) -> ErrorKind {
    let trimmed = body.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Ok(json) = serde_json::from_str::<Value>(trimmed) {
            if let Some(reason) = json
                .get("error")
                .and_then(|e| e.get("details"))
                .and_then(|d| d.as_array())
                .and_then(|a| a.first())
                .and_then(|o| o.get("reason"))
                .and_then(|v| v.as_str())
            {
                return match reason {
                    "QUOTA_EXHAUSTED" => ErrorKind::RateLimitedUserQuota,
                    "DAILY_LIMIT_EXCEEDED" => ErrorKind::RateLimitedDaily,
                    "RATE_LIMIT_EXCEEDED" | "MODEL_CAPACITY_EXHAUSTED" => {
                        ErrorKind::RateLimitedCapacity
                    }
                    _ => ErrorKind::RateLimitedUserQuota,
                };
            }
        }
    }

    let lowered = body.to_lowercase();
    // Minute-scoped limits are capacity pressure, not quota consumption.
    if lowered.contains("per minute") || lowered.contains("capacity") {
        ErrorKind::RateLimitedCapacity
    } else if lowered.contains("daily") || lowered.contains("per day") {
        ErrorKind::RateLimitedDaily
    } else {
        ErrorKind::RateLimitedUserQuota
    }
}

// Map an upstream HTTP outcome to its handling class.
pub fn classify_status(status: u16, body: &str, retry_after_header: Option<&str>) -> ClassifiedError {
    let retry_after_ms = retry_after_header
        .and_then(|h| h.trim().parse::<u64>().ok().map(|s| s * 1000))
        .or_else(|| parse_retry_delay_ms(body));

    let kind = match status {
        401 => {
            if is_permanent_auth_failure(body) {
                ErrorKind::AuthPermanentlyInvalid
            } else {
                ErrorKind::AuthExpired
            }
        }
        403 => {
            if is_permanent_auth_failure(body) {
                ErrorKind::AuthPermanentlyInvalid
            } else {
                ErrorKind::BadRequest
            }
        }
        429 => {
            warn!("Upstream 429 body: {}", body);
            rate_limit_kind(body)
        }
        400..=499 => ErrorKind::BadRequest,
        500 | 502 | 503 | 504 | 529 => ErrorKind::ServerTransient,
        _ => ErrorKind::Unknown,
    };

    ClassifiedError {
        kind,
        status,
        message: extract_error_message(body),
        retry_after_ms,
    }
}

pub fn classify_network_error(error: &reqwest::Error) -> ClassifiedError {
    let kind = if error.is_timeout() || error.is_connect() || error.is_body() || error.is_decode() {
        ErrorKind::NetworkTransient
    } else {
        ErrorKind::Unknown
    };
    ClassifiedError {
        kind,
        status: 0,
        message: error.to_string(),
        retry_after_ms: None,
    }
}

// Pull the human-readable message out of an upstream error payload.
pub fn extract_error_message(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.starts_with('{') {
        if let Ok(json) = serde_json::from_str::<Value>(trimmed) {
            if let Some(message) = json
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|v| v.as_str())
            {
                return message.to_string();
            }
        }
    }
    if trimmed.len() > 500 {
        format!("{}...", &trimmed[..500])
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_reset_delay_is_parsed_from_json() {
        let body = r#"{"error":{"details":[{"metadata":{"quotaResetDelay":"42s"}}]}}"#;
        assert_eq!(parse_retry_delay_ms(body), Some(42_000));
    }

    #[test]
    fn compound_durations_are_supported() {
        assert_eq!(parse_duration_string("2h1m1s"), Some(7_261_000));
        assert_eq!(parse_duration_string("510.7ms"), Some(511));
        assert_eq!(parse_duration_string("garbage"), None);
    }

    #[test]
    fn prose_retry_hints_are_parsed() {
        assert_eq!(
            parse_retry_delay_ms("Rate limit exceeded. Try again in 2m 30s"),
            Some(150_000)
        );
        assert_eq!(
            parse_retry_delay_ms("Quota limit hit. Retry After 99 Seconds"),
            Some(99_000)
        );
    }

    #[test]
    fn quota_exhausted_is_user_quota() {
        let body = r#"{"error":{"details":[{"reason":"QUOTA_EXHAUSTED"}]}}"#;
        let classified = classify_status(429, body, None);
        assert_eq!(classified.kind, ErrorKind::RateLimitedUserQuota);
    }

    #[test]
    fn per_minute_limits_are_capacity() {
        let body = "Quota limit 'Tokens per minute' exceeded.";
        let classified = classify_status(429, body, None);
        assert_eq!(classified.kind, ErrorKind::RateLimitedCapacity);
    }

    #[test]
    fn daily_limits_are_detected() {
        let classified = classify_status(429, "Daily quota exceeded for model", None);
        assert_eq!(classified.kind, ErrorKind::RateLimitedDaily);
    }

    #[test]
    fn retry_after_header_takes_precedence() {
        let classified = classify_status(429, "", Some("30"));
        assert_eq!(classified.retry_after_ms, Some(30_000));
    }

    #[test]
    fn auth_statuses_split_on_permanence() {
        let expired = classify_status(401, "token expired", None);
        assert_eq!(expired.kind, ErrorKind::AuthExpired);

        let dead = classify_status(401, "invalid_grant: Token has been revoked", None);
        assert_eq!(dead.kind, ErrorKind::AuthPermanentlyInvalid);
    }

    #[test]
    fn client_errors_are_fatal() {
        let classified = classify_status(400, r#"{"error":{"message":"bad schema"}}"#, None);
        assert_eq!(classified.kind, ErrorKind::BadRequest);
        assert_eq!(classified.message, "bad schema");
    }

    #[test]
    fn server_errors_are_transient() {
        for status in [500, 503, 529] {
            assert_eq!(
                classify_status(status, "", None).kind,
                ErrorKind::ServerTransient
            );
        }
    }

    #[test]
    fn permanent_failure_fragments_match() {
        assert!(is_permanent_auth_failure("oauth: invalid_grant"));
        assert!(is_permanent_auth_failure("Refresh Token Has Expired"));
        assert!(!is_permanent_auth_failure("temporary glitch"));
    }
}
