// Upstream host catalogue. The daily host is preferred; the public host is
// the fallback when it degrades.
pub const CLOUDCODE_HOST_DAILY: &str = "daily-cloudcode-pa.googleapis.com";
pub const CLOUDCODE_HOST_PUBLIC: &str = "cloudcode-pa.googleapis.com";

pub const OAUTH_TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";

pub fn cloudcode_hosts() -> Vec<&'static str> {
    vec![CLOUDCODE_HOST_DAILY, CLOUDCODE_HOST_PUBLIC]
}

// Build a `:method` URL on a host. Production hosts are bare names; test
// hosts arrive as full http URLs and keep their scheme.
pub fn colon_method_url(host: &str, method: &str, query: Option<&str>) -> String {
    let base = if host.starts_with("http") {
        format!("{}/v1internal", host)
    } else {
        format!("https://{}/v1internal", host)
    };
    match query {
        Some(qs) if !qs.trim().is_empty() => format!("{}:{}?{}", base, method, qs),
        _ => format!("{}:{}", base, method),
    }
}
