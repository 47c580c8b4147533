use crate::proxy::mappers::claude::UpstreamByteStream;
use crate::proxy::mappers::gemini::{GeminiPart, UsageMetadata};
use bytes::{Bytes, BytesMut};
use serde_json::{json, Value};
use std::pin::Pin;
use futures::Stream;
use tracing::info;

// Relay state for the compat surface: reasoning and text deltas both map to
// `choices[0].delta.content`; the terminal frame carries `finish_reason`.
struct OpenAIStreamState {
    id: String,
    model: String,
    created: i64,
    role_sent: bool,
    used_tool: bool,
    finished: bool,
    last_usage: Option<UsageMetadata>,
}

impl OpenAIStreamState {
    fn new() -> Self {
        Self {
            id: format!(
                "chatcmpl-{}",
                crate::proxy::common::utils::generate_random_id()
            ),
            model: String::new(),
            created: chrono::Utc::now().timestamp(),
            role_sent: false,
            used_tool: false,
            finished: false,
            last_usage: None,
        }
    }

    fn chunk(&self, delta: Value, finish_reason: Option<&str>) -> Bytes {
        let payload = json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason
            }]
        });
        Bytes::from(format!("data: {}\n\n", payload))
    }

    fn content_chunks(&mut self, text: &str) -> Vec<Bytes> {
        let mut chunks = Vec::new();
        if !self.role_sent {
            self.role_sent = true;
            chunks.push(self.chunk(json!({"role": "assistant"}), None));
        }
        chunks.push(self.chunk(json!({"content": text}), None));
        chunks
    }

    fn finish_chunks(&mut self, finish_reason: Option<&str>) -> Vec<Bytes> {
        if self.finished {
            return vec![];
        }
        self.finished = true;
        let reason = if self.used_tool || finish_reason == Some("TOOL_USE") {
            "tool_calls"
        } else if finish_reason == Some("MAX_TOKENS") {
            "length"
        } else {
            "stop"
        };

        let mut payload = json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": {},
                "finish_reason": reason
            }]
        });
        if let Some(usage) = &self.last_usage {
            let prompt = usage.prompt_token_count.unwrap_or(0);
            let completion = usage.candidates_token_count.unwrap_or(0);
            payload["usage"] = json!({
                "prompt_tokens": prompt,
                "completion_tokens": completion,
                "total_tokens": prompt + completion
            });
        }
        vec![
            Bytes::from(format!("data: {}\n\n", payload)),
            Bytes::from("data: [DONE]\n\n"),
        ]
    }

    fn process_line(&mut self, line: &str) -> Vec<Bytes> {
        let Some(data_str) = line.strip_prefix("data: ") else {
            return vec![];
        };
        let data_str = data_str.trim();
        if data_str.is_empty() {
            return vec![];
        }
        if data_str == "[DONE]" {
            return self.finish_chunks(None);
        }
        let Ok(value) = serde_json::from_str::<Value>(data_str) else {
            return vec![];
        };
        let raw = value.get("response").unwrap_or(&value);

        if self.model.is_empty() {
            if let Some(model) = raw.get("modelVersion").and_then(|v| v.as_str()) {
                self.model = model.to_string();
            }
        }
        if let Some(usage) = raw
            .get("usageMetadata")
            .and_then(|u| serde_json::from_value::<UsageMetadata>(u.clone()).ok())
        {
            self.last_usage = Some(usage);
        }

        let mut chunks = Vec::new();
        if let Some(parts) = raw
            .get("candidates")
            .and_then(|c| c.get(0))
            .and_then(|cand| cand.get("content"))
            .and_then(|content| content.get("parts"))
            .and_then(|p| p.as_array())
        {
            for part_value in parts {
                let Ok(part) = serde_json::from_value::<GeminiPart>(part_value.clone()) else {
                    continue;
                };
                if part.function_call.is_some() {
                    self.used_tool = true;
                    continue;
                }
                if let Some(text) = &part.text {
                    if !text.is_empty() {
                        chunks.extend(self.content_chunks(text));
                    }
                }
            }
        }

        if let Some(finish_reason) = raw
            .get("candidates")
            .and_then(|c| c.get(0))
            .and_then(|cand| cand.get("finishReason"))
            .and_then(|f| f.as_str())
        {
            chunks.extend(self.finish_chunks(Some(finish_reason)));
        }
        chunks
    }
}

pub struct OpenAISseStreamInput {
    pub upstream: UpstreamByteStream,
    pub trace_id: String,
    pub slot: Option<crate::proxy::token::SlotGuard>,
}

pub fn create_openai_sse_stream(
    input: OpenAISseStreamInput,
) -> Pin<Box<dyn Stream<Item = Result<Bytes, String>> + Send>> {
    use async_stream::stream;
    use futures::StreamExt;

    let OpenAISseStreamInput {
        mut upstream,
        trace_id,
        slot,
    } = input;

    Box::pin(stream! {
        let _slot = slot;
        let mut state = OpenAIStreamState::new();
        let mut buffer = BytesMut::new();

        while let Some(chunk_result) = upstream.next().await {
            match chunk_result {
                Ok(chunk) => {
                    buffer.extend_from_slice(&chunk);
                    while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                        let line_raw = buffer.split_to(pos + 1);
                        if let Ok(line_str) = std::str::from_utf8(&line_raw) {
                            for out in state.process_line(line_str.trim()) {
                                yield Ok(out);
                            }
                        }
                    }
                }
                Err(e) => {
                    info!("[{}] Compat stream error: {}", trace_id, e);
                    break;
                }
            }
        }
        for out in state.finish_chunks(None) {
            yield Ok(out);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn mock_stream(frames: Vec<String>) -> UpstreamByteStream {
        Box::pin(async_stream::stream! {
            for frame in frames {
                yield Ok(Bytes::from(frame));
            }
        })
    }

    #[tokio::test]
    async fn text_and_reasoning_both_map_to_content() {
        let frames = vec![
            format!(
                "data: {}\n",
                json!({
                    "candidates": [{"content": {"parts": [{"text": "think ", "thought": true}]}}],
                    "modelVersion": "gemini-3-pro-high"
                })
            ),
            format!(
                "data: {}\n",
                json!({
                    "candidates": [{
                        "content": {"parts": [{"text": "answer"}]},
                        "finishReason": "STOP"
                    }]
                })
            ),
        ];

        let mut stream = create_openai_sse_stream(OpenAISseStreamInput {
            upstream: mock_stream(frames),
            trace_id: "trace".to_string(),
            slot: None,
        });

        let mut output = String::new();
        while let Some(result) = stream.next().await {
            output.push_str(&String::from_utf8_lossy(&result.expect("chunk")));
        }

        assert!(output.contains("chat.completion.chunk"));
        assert!(output.contains("\"role\":\"assistant\""));
        assert!(output.contains("think "));
        assert!(output.contains("answer"));
        assert!(output.contains("\"finish_reason\":\"stop\""));
        assert!(output.trim_end().ends_with("data: [DONE]"));
    }

    #[tokio::test]
    async fn max_tokens_maps_to_length() {
        let frames = vec![format!(
            "data: {}\n",
            json!({
                "candidates": [{
                    "content": {"parts": [{"text": "cut"}]},
                    "finishReason": "MAX_TOKENS"
                }]
            })
        )];
        let mut stream = create_openai_sse_stream(OpenAISseStreamInput {
            upstream: mock_stream(frames),
            trace_id: "trace".to_string(),
            slot: None,
        });

        let mut output = String::new();
        while let Some(result) = stream.next().await {
            output.push_str(&String::from_utf8_lossy(&result.expect("chunk")));
        }
        assert!(output.contains("\"finish_reason\":\"length\""));
    }
}
