use super::models::Usage;
use super::utils::{decode_signature, to_claude_usage};
use crate::constants::MIN_SIGNATURE_LENGTH;
use crate::proxy::mappers::gemini::{FunctionCall, GeminiPart, UsageMetadata};
use crate::proxy::signature_cache::SignatureCache;
use bytes::Bytes;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    None,
    Text,
    Thinking,
    ToolCall,
}

// Per-connection relay state: the open block, its index, the signature
// pending for the open reasoning block, and message lifecycle flags.
// Single-reader single-writer; events leave in production order.
pub struct StreamingState {
    block_type: BlockType,
    block_index: usize,
    pub message_start_sent: bool,
    pub message_stop_sent: bool,
    used_tool: bool,
    pending_signature: Option<String>,
    last_usage: Option<UsageMetadata>,
    pub session_id: Option<String>,
    pub model_name: Option<String>,
    cache: Arc<SignatureCache>,
}

impl StreamingState {
    pub fn new(cache: Arc<SignatureCache>) -> Self {
        Self {
            block_type: BlockType::None,
            block_index: 0,
            message_start_sent: false,
            message_stop_sent: false,
            used_tool: false,
            pending_signature: None,
            last_usage: None,
            session_id: None,
            model_name: None,
            cache,
        }
    }

    pub fn emit(&self, event_type: &str, data: Value) -> Bytes {
        let sse = format!(
            "event: {}\ndata: {}\n\n",
            event_type,
            serde_json::to_string(&data).unwrap_or_default()
        );
        Bytes::from(sse)
    }

    pub fn emit_message_start(&mut self, raw_json: &Value) -> Bytes {
        if self.message_start_sent {
            return Bytes::new();
        }
        if let Some(model) = raw_json.get("modelVersion").and_then(|v| v.as_str()) {
            self.model_name = Some(model.to_string());
        }

        let usage = raw_json
            .get("usageMetadata")
            .and_then(|u| serde_json::from_value::<UsageMetadata>(u.clone()).ok())
            .map(|u| to_claude_usage(&u));

        let mut message = json!({
            "id": raw_json.get("responseId").and_then(|v| v.as_str()).unwrap_or("msg_unknown"),
            "type": "message",
            "role": "assistant",
            "content": [],
            "model": raw_json.get("modelVersion").and_then(|v| v.as_str()).unwrap_or(""),
            "stop_reason": null,
            "stop_sequence": null,
        });
        if let Some(u) = usage {
            message["usage"] = json!(u);
        }

        self.message_start_sent = true;
        self.emit(
            "message_start",
            json!({"type": "message_start", "message": message}),
        )
    }

    pub fn start_block(&mut self, block_type: BlockType, content_block: Value) -> Vec<Bytes> {
        let mut chunks = Vec::new();
        if self.block_type != BlockType::None {
            chunks.extend(self.end_block());
        }
        chunks.push(self.emit(
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": self.block_index,
                "content_block": content_block
            }),
        ));
        self.block_type = block_type;
        chunks
    }

    pub fn end_block(&mut self) -> Vec<Bytes> {
        if self.block_type == BlockType::None {
            return vec![];
        }
        let mut chunks = Vec::new();
        if self.block_type == BlockType::Thinking {
            if let Some(signature) = self.pending_signature.take() {
                chunks.push(self.emit_delta("signature_delta", json!({"signature": signature})));
            }
        }
        chunks.push(self.emit(
            "content_block_stop",
            json!({"type": "content_block_stop", "index": self.block_index}),
        ));
        self.block_index += 1;
        self.block_type = BlockType::None;
        chunks
    }

    pub fn emit_delta(&self, delta_type: &str, delta_content: Value) -> Bytes {
        let mut delta = json!({"type": delta_type});
        if let Value::Object(map) = delta_content {
            for (k, v) in map {
                delta[k] = v;
            }
        }
        self.emit(
            "content_block_delta",
            json!({
                "type": "content_block_delta",
                "index": self.block_index,
                "delta": delta
            }),
        )
    }

    pub fn record_usage(&mut self, usage: UsageMetadata) {
        self.last_usage = Some(usage);
    }

    pub fn emit_finish(&mut self, finish_reason: Option<&str>) -> Vec<Bytes> {
        let mut chunks = self.end_block();

        let stop_reason = if self.used_tool || finish_reason == Some("TOOL_USE") {
            "tool_use"
        } else if finish_reason == Some("MAX_TOKENS") {
            "max_tokens"
        } else {
            "end_turn"
        };
        let usage = self
            .last_usage
            .as_ref()
            .map(to_claude_usage)
            .unwrap_or(Usage::default());

        chunks.push(self.emit(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": {"stop_reason": stop_reason, "stop_sequence": null},
                "usage": usage
            }),
        ));
        if !self.message_stop_sent {
            chunks.push(Bytes::from(
                "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
            ));
            self.message_stop_sent = true;
        }
        chunks
    }

    pub fn emit_error(&mut self, kind: &str, message: &str) -> Bytes {
        self.emit(
            "error",
            json!({
                "type": "error",
                "error": {"type": kind, "message": message}
            }),
        )
    }

    pub fn mark_tool_used(&mut self) {
        self.used_tool = true;
    }

    pub fn current_block_type(&self) -> BlockType {
        self.block_type
    }

    pub fn store_signature(&mut self, signature: Option<String>) {
        if signature.is_some() {
            self.pending_signature = signature;
        }
    }

    fn remember_signature(&self, signature: &str) {
        if signature.len() < MIN_SIGNATURE_LENGTH {
            return;
        }
        if let Some(model) = &self.model_name {
            self.cache
                .cache_thinking_family(signature.to_string(), model.clone());
        }
        if let Some(session_id) = &self.session_id {
            self.cache
                .cache_session_signature(session_id, signature.to_string());
        }
    }
}

pub struct PartProcessor<'a> {
    state: &'a mut StreamingState,
}

impl<'a> PartProcessor<'a> {
    pub fn new(state: &'a mut StreamingState) -> Self {
        Self { state }
    }

    pub fn process(&mut self, part: &GeminiPart) -> Vec<Bytes> {
        let signature = part.thought_signature.as_deref().map(decode_signature);
        if let Some(sig) = &signature {
            self.state.remember_signature(sig);
        }

        if let Some(fc) = &part.function_call {
            return self.process_function_call(fc, signature);
        }
        if let Some(text) = &part.text {
            if part.thought.unwrap_or(false) {
                return self.process_thinking(text, signature);
            }
            return self.process_text(text, signature);
        }
        if let Some(img) = &part.inline_data {
            if !img.data.is_empty() {
                let markdown = format!("![image](data:{};base64,{})", img.mime_type, img.data);
                return self.process_text(&markdown, None);
            }
        }
        vec![]
    }

    fn process_thinking(&mut self, text: &str, signature: Option<String>) -> Vec<Bytes> {
        let mut chunks = Vec::new();
        if self.state.current_block_type() != BlockType::Thinking {
            chunks.extend(self.state.start_block(
                BlockType::Thinking,
                json!({"type": "thinking", "thinking": ""}),
            ));
        }
        if !text.is_empty() {
            chunks.push(
                self.state
                    .emit_delta("thinking_delta", json!({"thinking": text})),
            );
        }
        self.state.store_signature(signature);
        chunks
    }

    fn process_text(&mut self, text: &str, signature: Option<String>) -> Vec<Bytes> {
        let mut chunks = Vec::new();
        if text.is_empty() {
            // A bare signature rides on an empty text part; hold it for the
            // open reasoning block.
            self.state.store_signature(signature);
            return chunks;
        }
        if self.state.current_block_type() != BlockType::Text {
            chunks.extend(
                self.state
                    .start_block(BlockType::Text, json!({"type": "text", "text": ""})),
            );
        }
        chunks.push(self.state.emit_delta("text_delta", json!({"text": text})));
        self.state.store_signature(signature);
        chunks
    }

    fn process_function_call(&mut self, fc: &FunctionCall, signature: Option<String>) -> Vec<Bytes> {
        let mut chunks = Vec::new();
        self.state.mark_tool_used();

        let tool_id = fc.id.clone().unwrap_or_else(|| {
            format!(
                "{}-{}",
                fc.name,
                crate::proxy::common::utils::generate_random_id()
            )
        });

        let mut tool_use = json!({
            "type": "tool_use",
            "id": tool_id,
            "name": fc.name,
            "input": {}
        });
        if let Some(sig) = &signature {
            tool_use["signature"] = json!(sig);
            self.state.cache.cache_tool_signature(&tool_id, sig.clone());
            if let Some(session_id) = &self.state.session_id {
                self.state.cache.cache_session_signature(session_id, sig.clone());
            }
            debug!(
                "[SSE] Cached signature for tool call {} (len: {})",
                tool_id,
                sig.len()
            );
        }

        chunks.extend(self.state.start_block(BlockType::ToolCall, tool_use));
        if let Some(args) = &fc.args {
            let json_str = serde_json::to_string(args).unwrap_or_else(|_| "{}".to_string());
            for fragment in split_input_json(&json_str) {
                chunks.push(
                    self.state
                        .emit_delta("input_json_delta", json!({"partial_json": fragment})),
                );
            }
        }
        chunks.extend(self.state.end_block());
        chunks
    }
}

// Tool arguments arrive whole from upstream but leave as accumulated JSON
// fragments; split at the midpoint so clients exercise their accumulation
// path.
fn split_input_json(json_str: &str) -> Vec<String> {
    if json_str.len() < 2 {
        return vec![json_str.to_string()];
    }
    let mut mid = json_str.len().div_ceil(2);
    while mid < json_str.len() && !json_str.is_char_boundary(mid) {
        mid += 1;
    }
    if mid >= json_str.len() {
        return vec![json_str.to_string()];
    }
    vec![json_str[..mid].to_string(), json_str[mid..].to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> StreamingState {
        StreamingState::new(Arc::new(SignatureCache::new()))
    }

    fn as_text(chunks: &[Bytes]) -> String {
        chunks
            .iter()
            .map(|b| String::from_utf8_lossy(b).to_string())
            .collect()
    }

    #[test]
    fn emits_well_formed_sse_frames() {
        let state = state();
        let chunk = state.emit("ping_event", json!({"foo": "bar"}));
        let text = String::from_utf8(chunk.to_vec()).unwrap();
        assert!(text.starts_with("event: ping_event\ndata: "));
        assert!(text.ends_with("\n\n"));
        assert!(text.contains("\"foo\":\"bar\""));
    }

    #[test]
    fn block_indices_increase_and_stops_precede_starts() {
        let mut state = state();
        let mut processor = PartProcessor::new(&mut state);

        let mut chunks = processor.process(&GeminiPart {
            text: Some("thinking hard".to_string()),
            thought: Some(true),
            ..Default::default()
        });
        chunks.extend(processor.process(&GeminiPart {
            text: Some("the answer".to_string()),
            ..Default::default()
        }));

        let text = as_text(&chunks);
        let stop_pos = text.find("content_block_stop").unwrap();
        let second_start = text.rfind("content_block_start").unwrap();
        assert!(stop_pos < second_start);
        assert!(text.contains("\"index\":0"));
        assert!(text.contains("\"index\":1"));
    }

    #[test]
    fn signature_delta_precedes_thinking_block_stop() {
        let mut state = state();
        let sig = "s".repeat(64);
        let mut processor = PartProcessor::new(&mut state);
        let mut chunks = processor.process(&GeminiPart {
            text: Some("mulling".to_string()),
            thought: Some(true),
            thought_signature: Some(sig),
            ..Default::default()
        });
        chunks.extend(state.end_block());

        let text = as_text(&chunks);
        let sig_pos = text.find("signature_delta").expect("signature delta");
        let stop_pos = text.find("content_block_stop").expect("stop");
        assert!(sig_pos < stop_pos);
    }

    #[test]
    fn function_call_emits_split_input_json() {
        let mut state = state();
        let mut processor = PartProcessor::new(&mut state);
        let chunks = processor.process(&GeminiPart {
            function_call: Some(FunctionCall {
                name: "t".to_string(),
                args: Some(json!({"q": "x"})),
                id: Some("call_1".to_string()),
            }),
            ..Default::default()
        });

        let text = as_text(&chunks);
        assert!(text.contains(r#""name":"t""#));
        assert!(text.contains(r#"{\"q\":"#));
        assert!(text.contains(r#"\"x\"}"#));
        assert_eq!(text.matches("input_json_delta").count(), 2);
        assert!(text.contains("content_block_stop"));
    }

    #[test]
    fn split_input_json_halves_the_payload() {
        let parts = split_input_json(r#"{"q":"x"}"#);
        assert_eq!(parts, vec![r#"{"q":"#.to_string(), r#""x"}"#.to_string()]);
        assert_eq!(split_input_json("{}"), vec!["{".to_string(), "}".to_string()]);
    }

    #[test]
    fn finish_emits_message_delta_then_stop() {
        let mut state = state();
        state.record_usage(UsageMetadata {
            prompt_token_count: Some(5),
            candidates_token_count: Some(1),
            total_token_count: Some(6),
            cached_content_token_count: Some(0),
        });
        let chunks = state.emit_finish(Some("STOP"));
        let text = as_text(&chunks);
        assert!(text.contains("\"stop_reason\":\"end_turn\""));
        assert!(text.contains("\"input_tokens\":5"));
        let delta_pos = text.find("message_delta").unwrap();
        let stop_pos = text.find("message_stop").unwrap();
        assert!(delta_pos < stop_pos);
    }

    #[test]
    fn tool_use_wins_stop_reason() {
        let mut state = state();
        state.mark_tool_used();
        let text = as_text(&state.emit_finish(Some("STOP")));
        assert!(text.contains("\"stop_reason\":\"tool_use\""));
    }

    #[test]
    fn tool_signature_is_cached_under_call_id() {
        let cache = Arc::new(SignatureCache::new());
        let mut state = StreamingState::new(cache.clone());
        state.session_id = Some("sid-9".to_string());
        state.model_name = Some("gemini-3-pro-high".to_string());

        let sig = "g".repeat(64);
        use base64::Engine;
        let encoded = base64::engine::general_purpose::STANDARD.encode(&sig);
        let mut processor = PartProcessor::new(&mut state);
        processor.process(&GeminiPart {
            function_call: Some(FunctionCall {
                name: "t".to_string(),
                args: Some(json!({})),
                id: Some("call_7".to_string()),
            }),
            thought_signature: Some(encoded),
            ..Default::default()
        });

        assert_eq!(cache.get_tool_signature("call_7"), Some(sig.clone()));
        assert_eq!(cache.get_session_signature("sid-9"), Some(sig));
    }
}
