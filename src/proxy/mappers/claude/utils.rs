use super::models::Usage;
use crate::proxy::mappers::gemini::UsageMetadata;

// Cached prompt tokens are billed separately; the client-facing input count
// excludes them.
pub fn to_claude_usage(metadata: &UsageMetadata) -> Usage {
    let prompt = metadata.prompt_token_count.unwrap_or(0);
    let cached = metadata.cached_content_token_count.unwrap_or(0);
    Usage {
        input_tokens: prompt.saturating_sub(cached),
        output_tokens: metadata.candidates_token_count.unwrap_or(0),
        cache_read_input_tokens: Some(cached),
    }
}

pub fn decode_signature(raw: &str) -> String {
    use base64::Engine;
    match base64::engine::general_purpose::STANDARD.decode(raw) {
        Ok(decoded_bytes) => match String::from_utf8(decoded_bytes) {
            Ok(decoded) => decoded,
            Err(_) => raw.to_string(),
        },
        Err(_) => raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_subtracts_cached_tokens() {
        let metadata = UsageMetadata {
            prompt_token_count: Some(100),
            candidates_token_count: Some(20),
            total_token_count: Some(120),
            cached_content_token_count: Some(60),
        };
        let usage = to_claude_usage(&metadata);
        assert_eq!(usage.input_tokens, 40);
        assert_eq!(usage.output_tokens, 20);
        assert_eq!(usage.cache_read_input_tokens, Some(60));
    }

    #[test]
    fn missing_usage_fields_default_to_zero() {
        let usage = to_claude_usage(&UsageMetadata::default());
        assert_eq!(usage.input_tokens, 0);
        assert_eq!(usage.output_tokens, 0);
    }

    #[test]
    fn base64_signatures_are_decoded() {
        use base64::Engine;
        let encoded = base64::engine::general_purpose::STANDARD.encode("plain-signature");
        assert_eq!(decode_signature(&encoded), "plain-signature");
    }

    #[test]
    fn non_base64_signatures_pass_through() {
        assert_eq!(decode_signature("!!not-base64!!"), "!!not-base64!!");
    }
}
