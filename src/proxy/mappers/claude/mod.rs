pub mod models;
pub mod request;
mod request_content;
mod request_generation;
pub mod response;
pub mod streaming;
pub mod thinking;
pub mod utils;

pub use request::{transform_request, TransformOptions};
pub use response::transform_response;
pub use streaming::{BlockType, PartProcessor, StreamingState};

use crate::proxy::mappers::gemini::{GeminiPart, GeminiResponse, UsageMetadata};
use crate::proxy::signature_cache::SignatureCache;
use bytes::{Bytes, BytesMut};
use futures::Stream;
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{info, warn};

pub type UpstreamByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

pub struct ClaudeSseStreamInput {
    pub upstream: UpstreamByteStream,
    pub trace_id: String,
    pub email: String,
    pub session_id: Option<String>,
    pub cache: Arc<SignatureCache>,
    // Dropped with the stream: releases the account's concurrency slot when
    // the client disconnects mid-stream.
    pub slot: Option<crate::proxy::token::SlotGuard>,
}

// Relay upstream SSE into A-format SSE. One JSON envelope per `data:` line,
// terminated by `[DONE]` or channel close; the relay owns the borrowed slot
// for the lifetime of the stream.
pub fn create_claude_sse_stream(
    input: ClaudeSseStreamInput,
) -> Pin<Box<dyn Stream<Item = Result<Bytes, String>> + Send>> {
    use async_stream::stream;
    use futures::StreamExt;

    let ClaudeSseStreamInput {
        mut upstream,
        trace_id,
        email,
        session_id,
        cache,
        slot,
    } = input;

    Box::pin(stream! {
        let _slot = slot;
        let mut state = StreamingState::new(cache);
        state.session_id = session_id;
        let mut buffer = BytesMut::new();

        loop {
            let next_chunk = tokio::time::timeout(
                std::time::Duration::from_secs(30),
                upstream.next()
            ).await;

            match next_chunk {
                Ok(Some(Ok(chunk))) => {
                    buffer.extend_from_slice(&chunk);
                    while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                        let line_raw = buffer.split_to(pos + 1);
                        if let Ok(line_str) = std::str::from_utf8(&line_raw) {
                            let line = line_str.trim();
                            if line.is_empty() { continue; }
                            if let Some(sse_chunks) = process_sse_line(line, &mut state, &trace_id, &email) {
                                for sse_chunk in sse_chunks {
                                    yield Ok(sse_chunk);
                                }
                            }
                        }
                    }
                }
                Ok(Some(Err(e))) => {
                    let classified = crate::proxy::mappers::error_classifier::classify_network_error(&e);
                    warn!("[{}] Upstream stream error: {}", trace_id, e);
                    yield Ok(state.emit_error("overloaded_error", &classified.message));
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    // Keep the client connection alive while upstream stalls.
                    yield Ok(Bytes::from(": ping\n\n"));
                }
            }
        }

        if !state.message_stop_sent {
            for chunk in state.emit_finish(None) {
                yield Ok(chunk);
            }
        }
    })
}

pub(crate) fn process_sse_line(
    line: &str,
    state: &mut StreamingState,
    trace_id: &str,
    email: &str,
) -> Option<Vec<Bytes>> {
    let data_str = line.strip_prefix("data: ")?.trim();
    if data_str.is_empty() {
        return None;
    }
    if data_str == "[DONE]" {
        if state.message_stop_sent {
            return None;
        }
        return Some(state.emit_finish(None));
    }

    let json_value: Value = serde_json::from_str(data_str).ok()?;
    let raw_json = json_value.get("response").unwrap_or(&json_value);

    let mut chunks = Vec::new();
    if !state.message_start_sent {
        chunks.push(state.emit_message_start(raw_json));
    }

    if let Some(usage) = raw_json
        .get("usageMetadata")
        .and_then(|u| serde_json::from_value::<UsageMetadata>(u.clone()).ok())
    {
        state.record_usage(usage);
    }

    if let Some(parts) = raw_json
        .get("candidates")
        .and_then(|c| c.get(0))
        .and_then(|cand| cand.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(|p| p.as_array())
    {
        for part_value in parts {
            if let Ok(part) = serde_json::from_value::<GeminiPart>(part_value.clone()) {
                let mut processor = PartProcessor::new(state);
                chunks.extend(processor.process(&part));
            }
        }
    }

    if let Some(finish_reason) = raw_json
        .get("candidates")
        .and_then(|c| c.get(0))
        .and_then(|cand| cand.get("finishReason"))
        .and_then(|f| f.as_str())
    {
        info!(
            "[{}] ✓ Stream completed | Account: {} | Finish: {}",
            trace_id, email, finish_reason
        );
        chunks.extend(state.emit_finish(Some(finish_reason)));
    }

    if chunks.is_empty() {
        None
    } else {
        Some(chunks)
    }
}

// Collapse an upstream SSE stream into one aggregate response, for clients
// that asked for a unary answer while the call went over the SSE endpoint.
pub async fn collect_stream_to_response(
    mut upstream: UpstreamByteStream,
) -> Result<GeminiResponse, String> {
    use futures::StreamExt;

    let mut buffer = BytesMut::new();
    let mut parts: Vec<GeminiPart> = Vec::new();
    let mut usage: Option<UsageMetadata> = None;
    let mut finish_reason: Option<String> = None;
    let mut model_version: Option<String> = None;
    let mut response_id: Option<String> = None;

    let mut handle_line = |line: &str,
                           parts: &mut Vec<GeminiPart>,
                           usage: &mut Option<UsageMetadata>,
                           finish_reason: &mut Option<String>,
                           model_version: &mut Option<String>,
                           response_id: &mut Option<String>| {
        let Some(data_str) = line.strip_prefix("data: ") else {
            return;
        };
        let data_str = data_str.trim();
        if data_str.is_empty() || data_str == "[DONE]" {
            return;
        }
        let Ok(json_value) = serde_json::from_str::<Value>(data_str) else {
            return;
        };
        let raw = json_value.get("response").unwrap_or(&json_value);

        if model_version.is_none() {
            *model_version = raw
                .get("modelVersion")
                .and_then(|v| v.as_str())
                .map(String::from);
        }
        if response_id.is_none() {
            *response_id = raw
                .get("responseId")
                .and_then(|v| v.as_str())
                .map(String::from);
        }
        if let Some(u) = raw
            .get("usageMetadata")
            .and_then(|u| serde_json::from_value::<UsageMetadata>(u.clone()).ok())
        {
            *usage = Some(u);
        }
        if let Some(candidate) = raw.get("candidates").and_then(|c| c.get(0)) {
            if let Some(reason) = candidate.get("finishReason").and_then(|f| f.as_str()) {
                *finish_reason = Some(reason.to_string());
            }
            if let Some(chunk_parts) = candidate
                .get("content")
                .and_then(|content| content.get("parts"))
                .and_then(|p| p.as_array())
            {
                for part_value in chunk_parts {
                    let Ok(part) = serde_json::from_value::<GeminiPart>(part_value.clone()) else {
                        continue;
                    };
                    // Merge text continuations of the same kind; everything
                    // else starts a new part.
                    let merged = match (parts.last_mut(), &part) {
                        (Some(last), incoming)
                            if last.text.is_some()
                                && incoming.text.is_some()
                                && last.thought == incoming.thought
                                && last.thought_signature.is_none()
                                && incoming.function_call.is_none() =>
                        {
                            if let (Some(last_text), Some(new_text)) =
                                (last.text.as_mut(), incoming.text.as_ref())
                            {
                                last_text.push_str(new_text);
                            }
                            if incoming.thought_signature.is_some() {
                                last.thought_signature = incoming.thought_signature.clone();
                            }
                            true
                        }
                        _ => false,
                    };
                    if !merged {
                        parts.push(part);
                    }
                }
            }
        }
    };

    while let Some(chunk_result) = upstream.next().await {
        let chunk = chunk_result.map_err(|e| format!("Stream error: {}", e))?;
        buffer.extend_from_slice(&chunk);
        while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
            let line_raw = buffer.split_to(pos + 1);
            if let Ok(line_str) = std::str::from_utf8(&line_raw) {
                handle_line(
                    line_str.trim(),
                    &mut parts,
                    &mut usage,
                    &mut finish_reason,
                    &mut model_version,
                    &mut response_id,
                );
            }
        }
    }

    Ok(GeminiResponse {
        candidates: Some(vec![crate::proxy::mappers::gemini::Candidate {
            content: Some(crate::proxy::mappers::gemini::GeminiContent {
                role: "model".to_string(),
                parts,
            }),
            finish_reason,
            index: Some(0),
            safety_ratings: None,
            grounding_metadata: None,
        }]),
        usage_metadata: usage,
        model_version,
        response_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn state() -> StreamingState {
        StreamingState::new(Arc::new(SignatureCache::new()))
    }

    #[test]
    fn done_marker_forces_message_stop() {
        let mut state = state();
        let result = process_sse_line("data: [DONE]", &mut state, "trace", "a@x");
        let chunks = result.expect("chunks");
        let text: String = chunks
            .iter()
            .map(|b| String::from_utf8_lossy(b).to_string())
            .collect();
        assert!(text.contains("message_stop"));
    }

    #[test]
    fn text_line_emits_start_and_delta() {
        let mut state = state();
        let line = r#"data: {"candidates":[{"content":{"parts":[{"text":"Hello"}]}}],"modelVersion":"gemini-3-flash","responseId":"r1"}"#;
        let chunks = process_sse_line(line, &mut state, "trace", "a@x").expect("chunks");
        let text: String = chunks
            .iter()
            .map(|b| String::from_utf8_lossy(b).to_string())
            .collect();
        assert!(text.contains("message_start"));
        assert!(text.contains("content_block_start"));
        assert!(text.contains("Hello"));
    }

    #[test]
    fn response_envelope_wrapper_is_unwrapped() {
        let mut state = state();
        let line = r#"data: {"response":{"candidates":[{"content":{"parts":[{"text":"wrapped"}]}}]}}"#;
        let chunks = process_sse_line(line, &mut state, "trace", "a@x").expect("chunks");
        let text: String = chunks
            .iter()
            .map(|b| String::from_utf8_lossy(b).to_string())
            .collect();
        assert!(text.contains("wrapped"));
    }

    fn mock_stream(frames: Vec<String>) -> UpstreamByteStream {
        Box::pin(async_stream::stream! {
            for frame in frames {
                yield Ok(Bytes::from(frame));
            }
        })
    }

    #[tokio::test]
    async fn relay_orders_reasoning_then_tool_call() {
        let sig = "s".repeat(64);
        use base64::Engine;
        let encoded_sig = base64::engine::general_purpose::STANDARD.encode(&sig);

        let frames = vec![
            format!(
                "data: {}\n",
                serde_json::json!({
                    "candidates": [{"content": {"parts": [
                        {"text": "thinking a", "thought": true}
                    ]}}],
                    "responseId": "r1",
                    "modelVersion": "gemini-3-pro-high"
                })
            ),
            format!(
                "data: {}\n",
                serde_json::json!({
                    "candidates": [{"content": {"parts": [
                        {"text": "thinking b", "thought": true, "thoughtSignature": encoded_sig}
                    ]}}]
                })
            ),
            format!(
                "data: {}\n",
                serde_json::json!({
                    "candidates": [{
                        "content": {"parts": [
                            {"functionCall": {"name": "t", "args": {"q": "x"}, "id": "call_1"}}
                        ]},
                        "finishReason": "STOP"
                    }],
                    "usageMetadata": {"promptTokenCount": 10, "candidatesTokenCount": 4}
                })
            ),
        ];

        let cache = Arc::new(SignatureCache::new());
        let mut stream = create_claude_sse_stream(ClaudeSseStreamInput {
            upstream: mock_stream(frames),
            trace_id: "trace".to_string(),
            email: "a@x".to_string(),
            session_id: Some("sid-relay".to_string()),
            cache: cache.clone(),
            slot: None,
        });

        let mut output = String::new();
        while let Some(result) = stream.next().await {
            output.push_str(&String::from_utf8_lossy(&result.expect("chunk")));
        }

        let order = [
            "message_start",
            "content_block_start",
            "thinking_delta",
            "signature_delta",
            "content_block_stop",
            "input_json_delta",
            "message_delta",
            "message_stop",
        ];
        let mut cursor = 0;
        for marker in order {
            let pos = output[cursor..]
                .find(marker)
                .unwrap_or_else(|| panic!("marker {} not found in order", marker));
            cursor += pos;
        }
        assert!(output.contains("\"stop_reason\":\"tool_use\""));
        assert_eq!(output.matches("input_json_delta").count(), 2);
        assert_eq!(cache.get_tool_signature("call_1"), Some(sig));
    }

    #[tokio::test]
    async fn dropping_the_relay_releases_the_concurrency_slot() {
        let pool = Arc::new(crate::proxy::token::AccountPool::new(5, 0.1));
        let mut account = crate::models::Account::new("stream@x".to_string());
        account.refresh_token = Some("refresh".to_string());
        pool.add(account);
        let slot = pool.borrow("stream@x").expect("slot");
        assert_eq!(pool.get("stream@x").unwrap().active_requests, 1);

        // An endless upstream: the client disconnect (stream drop) must be
        // what frees the slot.
        let endless: UpstreamByteStream = Box::pin(async_stream::stream! {
            loop {
                yield Ok(Bytes::from(
                    "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"x\"}]}}]}\n",
                ));
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        });

        let mut stream = create_claude_sse_stream(ClaudeSseStreamInput {
            upstream: endless,
            trace_id: "trace".to_string(),
            email: "stream@x".to_string(),
            session_id: None,
            cache: Arc::new(SignatureCache::new()),
            slot: Some(slot),
        });

        // Read a couple of frames, then hang up.
        let _ = stream.next().await;
        let _ = stream.next().await;
        drop(stream);

        assert_eq!(pool.get("stream@x").unwrap().active_requests, 0);
    }

    #[tokio::test]
    async fn collector_aggregates_text_and_usage() {
        let frames = vec![
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"hel\"}]}}],\"responseId\":\"r9\",\"modelVersion\":\"gemini-3-flash\"}\n".to_string(),
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"lo\"}]},\"finishReason\":\"STOP\"}],\"usageMetadata\":{\"promptTokenCount\":5,\"candidatesTokenCount\":1}}\n".to_string(),
            "data: [DONE]\n".to_string(),
        ];
        let response = collect_stream_to_response(mock_stream(frames))
            .await
            .expect("aggregate");

        let candidate = response.first_candidate().expect("candidate");
        let parts = &candidate.content.as_ref().unwrap().parts;
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].text.as_deref(), Some("hello"));
        assert_eq!(candidate.finish_reason.as_deref(), Some("STOP"));
        assert_eq!(
            response.usage_metadata.unwrap().prompt_token_count,
            Some(5)
        );
    }
}
