use super::models::{ClaudeResponse, ContentBlock, MediaSource, Usage};
use super::utils::{decode_signature, to_claude_usage};
use crate::constants::MIN_SIGNATURE_LENGTH;
use crate::proxy::mappers::gemini::{Candidate, GeminiPart, GeminiResponse, GroundingMetadata};
use crate::proxy::signature_cache::SignatureCache;
use tracing::{debug, warn};

// Accumulates translated blocks for one unary response.
pub struct ResponseBuilder<'a> {
    content_blocks: Vec<ContentBlock>,
    text_builder: String,
    thinking_builder: String,
    thinking_signature: Option<String>,
    trailing_signature: Option<String>,
    has_tool_call: bool,
    session_id: Option<&'a str>,
    model_name: &'a str,
    cache: &'a SignatureCache,
}

impl<'a> ResponseBuilder<'a> {
    pub fn new(session_id: Option<&'a str>, model_name: &'a str, cache: &'a SignatureCache) -> Self {
        Self {
            content_blocks: Vec::new(),
            text_builder: String::new(),
            thinking_builder: String::new(),
            thinking_signature: None,
            trailing_signature: None,
            has_tool_call: false,
            session_id,
            model_name,
            cache,
        }
    }

    pub fn process(mut self, response: &GeminiResponse) -> ClaudeResponse {
        if response.candidate_count() > 1 {
            warn!(
                "Upstream returned {} candidates, using the first",
                response.candidate_count()
            );
        }

        let candidate = response.first_candidate();

        if let Some(candidate) = candidate {
            if matches!(
                candidate.finish_reason.as_deref(),
                Some("SAFETY") | Some("RECITATION")
            ) {
                return self.blocked_response(response, candidate);
            }
        }

        if let Some(candidate) = candidate {
            if let Some(content) = &candidate.content {
                for part in &content.parts {
                    self.process_part(part);
                }
            }
            if let Some(grounding) = &candidate.grounding_metadata {
                self.process_grounding(grounding);
            }
        }

        self.flush_thinking();
        self.flush_text();
        if let Some(signature) = self.trailing_signature.take() {
            self.content_blocks.push(ContentBlock::Thinking {
                thinking: String::new(),
                signature: Some(signature),
            });
        }

        self.build(response)
    }

    fn blocked_response(&self, response: &GeminiResponse, candidate: &Candidate) -> ClaudeResponse {
        let categories: Vec<String> = candidate
            .safety_ratings
            .as_ref()
            .map(|ratings| ratings.iter().map(|r| r.category.clone()).collect())
            .unwrap_or_default();
        let label = if categories.is_empty() {
            candidate.finish_reason.clone().unwrap_or_default()
        } else {
            categories.join(", ")
        };
        warn!("Upstream blocked the response: {}", label);

        ClaudeResponse {
            id: response
                .response_id
                .clone()
                .unwrap_or_else(|| format!("msg_{}", crate::proxy::common::utils::generate_random_id())),
            type_: "message".to_string(),
            role: "assistant".to_string(),
            model: response.model_version.clone().unwrap_or_default(),
            content: vec![ContentBlock::Text {
                text: format!("[Content blocked by safety filter: {}]", label),
            }],
            stop_reason: "end_turn".to_string(),
            stop_sequence: None,
            usage: response
                .usage_metadata
                .as_ref()
                .map(to_claude_usage)
                .unwrap_or_default(),
        }
    }

    fn remember_signature(&self, signature: &str) {
        if signature.len() < MIN_SIGNATURE_LENGTH {
            return;
        }
        self.cache
            .cache_thinking_family(signature.to_string(), self.model_name.to_string());
        if let Some(session_id) = self.session_id {
            self.cache
                .cache_session_signature(session_id, signature.to_string());
        }
    }

    fn process_part(&mut self, part: &GeminiPart) {
        let signature = part.thought_signature.as_deref().map(decode_signature);
        if let Some(sig) = &signature {
            self.remember_signature(sig);
        }

        if let Some(fc) = &part.function_call {
            self.flush_thinking();
            self.flush_text();
            if let Some(trailing) = self.trailing_signature.take() {
                self.content_blocks.push(ContentBlock::Thinking {
                    thinking: String::new(),
                    signature: Some(trailing),
                });
            }

            self.has_tool_call = true;
            let tool_id = fc.id.clone().unwrap_or_else(|| {
                format!(
                    "{}-{}",
                    fc.name,
                    crate::proxy::common::utils::generate_random_id()
                )
            });
            if let Some(sig) = &signature {
                self.cache.cache_tool_signature(&tool_id, sig.clone());
            }
            self.content_blocks.push(ContentBlock::ToolUse {
                id: tool_id,
                name: fc.name.clone(),
                input: fc.args.clone().unwrap_or(serde_json::json!({})),
                signature: signature.clone(),
            });
            return;
        }

        if let Some(text) = &part.text {
            if part.thought.unwrap_or(false) {
                self.flush_text();
                if text.is_empty() {
                    // Signature-only reasoning: surface as redacted.
                    if let Some(sig) = signature {
                        self.flush_thinking();
                        self.content_blocks
                            .push(ContentBlock::RedactedThinking { data: sig });
                    }
                    return;
                }
                self.thinking_builder.push_str(text);
                if signature.is_some() {
                    self.thinking_signature = signature;
                }
            } else {
                if text.is_empty() {
                    if signature.is_some() {
                        self.trailing_signature = signature;
                    }
                    return;
                }
                self.flush_thinking();
                if let Some(trailing) = self.trailing_signature.take() {
                    self.flush_text();
                    self.content_blocks.push(ContentBlock::Thinking {
                        thinking: String::new(),
                        signature: Some(trailing),
                    });
                }
                self.text_builder.push_str(text);
                if let Some(sig) = signature {
                    self.flush_text();
                    self.content_blocks.push(ContentBlock::Thinking {
                        thinking: String::new(),
                        signature: Some(sig),
                    });
                }
            }
            return;
        }

        if let Some(img) = &part.inline_data {
            self.flush_thinking();
            self.flush_text();
            if !img.data.is_empty() {
                self.content_blocks.push(ContentBlock::Image {
                    source: MediaSource {
                        source_type: "base64".to_string(),
                        media_type: img.mime_type.clone(),
                        data: img.data.clone(),
                    },
                });
            }
            return;
        }

        if let Some(file) = &part.file_data {
            self.flush_thinking();
            self.flush_text();
            let source = MediaSource {
                source_type: "url".to_string(),
                media_type: file.mime_type.clone(),
                data: file.file_uri.clone(),
            };
            if file.mime_type.starts_with("image/") {
                self.content_blocks.push(ContentBlock::Image { source });
            } else {
                self.content_blocks.push(ContentBlock::Document { source });
            }
        }
    }

    fn process_grounding(&mut self, grounding: &GroundingMetadata) {
        let mut grounding_text = String::new();
        if let Some(queries) = &grounding.web_search_queries {
            if !queries.is_empty() {
                grounding_text.push_str("\n\nSearched: ");
                grounding_text.push_str(&queries.join(", "));
            }
        }
        if let Some(chunks) = &grounding.grounding_chunks {
            let mut links = Vec::new();
            for (i, chunk) in chunks.iter().enumerate() {
                if let Some(web) = &chunk.web {
                    let title = web.title.as_deref().unwrap_or("Web Source");
                    let uri = web.uri.as_deref().unwrap_or("#");
                    links.push(format!("[{}] [{}]({})", i + 1, title, uri));
                }
            }
            if !links.is_empty() {
                grounding_text.push_str("\n\nSources:\n");
                grounding_text.push_str(&links.join("\n"));
            }
        }
        if !grounding_text.is_empty() {
            debug!("Attaching grounding metadata to response");
            self.flush_thinking();
            self.text_builder.push_str(&grounding_text);
            self.flush_text();
        }
    }

    fn flush_text(&mut self) {
        if self.text_builder.is_empty() {
            return;
        }
        self.content_blocks.push(ContentBlock::Text {
            text: std::mem::take(&mut self.text_builder),
        });
    }

    fn flush_thinking(&mut self) {
        if self.thinking_builder.is_empty() && self.thinking_signature.is_none() {
            return;
        }
        self.content_blocks.push(ContentBlock::Thinking {
            thinking: std::mem::take(&mut self.thinking_builder),
            signature: self.thinking_signature.take(),
        });
    }

    fn build(self, response: &GeminiResponse) -> ClaudeResponse {
        let finish_reason = response
            .first_candidate()
            .and_then(|c| c.finish_reason.as_deref());
        let stop_reason = if self.has_tool_call || finish_reason == Some("TOOL_USE") {
            "tool_use"
        } else if finish_reason == Some("MAX_TOKENS") {
            "max_tokens"
        } else {
            "end_turn"
        };

        ClaudeResponse {
            id: response
                .response_id
                .clone()
                .unwrap_or_else(|| format!("msg_{}", crate::proxy::common::utils::generate_random_id())),
            type_: "message".to_string(),
            role: "assistant".to_string(),
            model: response.model_version.clone().unwrap_or_default(),
            content: self.content_blocks,
            stop_reason: stop_reason.to_string(),
            stop_sequence: None,
            usage: response
                .usage_metadata
                .as_ref()
                .map(to_claude_usage)
                .unwrap_or(Usage::default()),
        }
    }
}

pub fn transform_response(
    response: &GeminiResponse,
    session_id: Option<&str>,
    model_name: &str,
    cache: &SignatureCache,
) -> ClaudeResponse {
    ResponseBuilder::new(session_id, model_name, cache).process(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: serde_json::Value) -> GeminiResponse {
        serde_json::from_value(value).expect("response")
    }

    #[test]
    fn simple_text_response_maps_to_end_turn() {
        let cache = SignatureCache::new();
        let response = parse(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "hello"}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 5, "candidatesTokenCount": 1, "cachedContentTokenCount": 0},
            "modelVersion": "gemini-3-flash",
            "responseId": "resp_1"
        }));

        let claude = transform_response(&response, None, "gemini-3-flash", &cache);
        assert_eq!(claude.stop_reason, "end_turn");
        assert_eq!(claude.usage.input_tokens, 5);
        assert_eq!(claude.usage.output_tokens, 1);
        assert_eq!(claude.usage.cache_read_input_tokens, Some(0));
        assert_eq!(claude.content.len(), 1);
        match &claude.content[0] {
            ContentBlock::Text { text } => assert_eq!(text, "hello"),
            _ => panic!("expected text block"),
        }
    }

    #[test]
    fn thinking_with_signature_is_cached_and_preserved() {
        let cache = SignatureCache::new();
        let sig = "s".repeat(64);
        let response = parse(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"text": "pondering", "thought": true, "thoughtSignature": sig},
                    {"text": "the answer"}
                ]},
                "finishReason": "STOP"
            }],
            "modelVersion": "gemini-3-pro-high"
        }));

        let claude = transform_response(&response, Some("sid-1"), "gemini-3-pro-high", &cache);
        match &claude.content[0] {
            ContentBlock::Thinking {
                thinking,
                signature,
            } => {
                assert_eq!(thinking, "pondering");
                assert_eq!(signature.as_deref().map(|s| s.len()), Some(64));
            }
            _ => panic!("expected thinking block"),
        }
        assert_eq!(cache.get_session_signature("sid-1"), Some(sig.clone()));
        assert!(cache.get_signature_family(&sig).is_some());
    }

    #[test]
    fn signature_only_thought_becomes_redacted_thinking() {
        let cache = SignatureCache::new();
        let sig = "r".repeat(64);
        let response = parse(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"text": "", "thought": true, "thoughtSignature": sig}
                ]},
                "finishReason": "STOP"
            }]
        }));

        let claude = transform_response(&response, None, "gemini-3-pro-high", &cache);
        match &claude.content[0] {
            ContentBlock::RedactedThinking { data } => assert_eq!(data.len(), 64),
            other => panic!("expected redacted thinking, got {:?}", other),
        }
    }

    #[test]
    fn function_call_sets_tool_use_stop_reason_and_caches_signature() {
        let cache = SignatureCache::new();
        let sig = "t".repeat(64);
        let response = parse(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"functionCall": {"name": "t", "args": {"q": "x"}, "id": "call_9"}, "thoughtSignature": sig}
                ]},
                "finishReason": "STOP"
            }]
        }));

        let claude = transform_response(&response, None, "gemini-3-pro-high", &cache);
        assert_eq!(claude.stop_reason, "tool_use");
        match &claude.content[0] {
            ContentBlock::ToolUse { id, name, input, .. } => {
                assert_eq!(id, "call_9");
                assert_eq!(name, "t");
                assert_eq!(input["q"], "x");
            }
            _ => panic!("expected tool use"),
        }
        assert_eq!(cache.get_tool_signature("call_9"), Some(sig));
    }

    #[test]
    fn safety_block_becomes_explanatory_text() {
        let cache = SignatureCache::new();
        let response = parse(json!({
            "candidates": [{
                "finishReason": "SAFETY",
                "safetyRatings": [{"category": "HARM_CATEGORY_DANGEROUS_CONTENT"}]
            }]
        }));

        let claude = transform_response(&response, None, "gemini-3-flash", &cache);
        assert_eq!(claude.stop_reason, "end_turn");
        match &claude.content[0] {
            ContentBlock::Text { text } => {
                assert!(text.starts_with("[Content blocked by safety filter:"));
                assert!(text.contains("HARM_CATEGORY_DANGEROUS_CONTENT"));
            }
            _ => panic!("expected text block"),
        }
    }

    #[test]
    fn max_tokens_finish_reason_maps_through() {
        let cache = SignatureCache::new();
        let response = parse(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "cut off"}]},
                "finishReason": "MAX_TOKENS"
            }]
        }));
        let claude = transform_response(&response, None, "gemini-3-flash", &cache);
        assert_eq!(claude.stop_reason, "max_tokens");
    }

    #[test]
    fn inline_and_file_data_become_media_blocks() {
        let cache = SignatureCache::new();
        let response = parse(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"inlineData": {"mimeType": "image/png", "data": "AAAA"}},
                    {"fileData": {"mimeType": "application/pdf", "fileUri": "https://x/doc.pdf"}}
                ]},
                "finishReason": "STOP"
            }]
        }));

        let claude = transform_response(&response, None, "gemini-3-flash", &cache);
        assert!(matches!(claude.content[0], ContentBlock::Image { .. }));
        assert!(matches!(claude.content[1], ContentBlock::Document { .. }));
    }
}
