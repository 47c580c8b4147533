use super::models::{OpenAIRequest, OpenAIResponse, OpenAIChoice, OpenAIResponseMessage, OpenAIUsage};
use crate::proxy::mappers::claude::models::{ClaudeRequest, ClaudeResponse, ContentBlock};
use serde_json::json;

// The compat surface translates to the richer A-format internally, then the
// normal dispatch path runs.
pub fn openai_to_claude_request(request: &OpenAIRequest) -> ClaudeRequest {
    let mut system_parts: Vec<String> = Vec::new();
    let mut messages = Vec::new();

    for msg in &request.messages {
        let text = msg
            .content
            .as_ref()
            .map(|c| c.flattened_text())
            .unwrap_or_default();
        match msg.role.as_str() {
            "system" | "developer" => {
                if !text.is_empty() {
                    system_parts.push(text);
                }
            }
            "assistant" => messages.push(json!({
                "role": "assistant",
                "content": [{"type": "text", "text": text}]
            })),
            // Tool-role and any unknown roles degrade to user turns.
            _ => messages.push(json!({
                "role": "user",
                "content": text
            })),
        }
    }

    let mut value = json!({
        "model": request.model,
        "messages": messages,
        "stream": request.stream,
    });
    if !system_parts.is_empty() {
        value["system"] = json!(system_parts.join("\n"));
    }
    if let Some(max_tokens) = request.max_tokens {
        value["max_tokens"] = json!(max_tokens);
    }
    if let Some(temperature) = request.temperature {
        value["temperature"] = json!(temperature);
    }
    if let Some(top_p) = request.top_p {
        value["top_p"] = json!(top_p);
    }

    serde_json::from_value(value).expect("constructed request is valid")
}

fn map_finish_reason(stop_reason: &str) -> &'static str {
    match stop_reason {
        "max_tokens" => "length",
        "tool_use" => "tool_calls",
        _ => "stop",
    }
}

pub fn claude_to_openai_response(response: &ClaudeResponse, requested_model: &str) -> OpenAIResponse {
    let content = response
        .content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("");

    OpenAIResponse {
        id: format!("chatcmpl-{}", response.id.trim_start_matches("msg_")),
        object: "chat.completion".to_string(),
        created: chrono::Utc::now().timestamp(),
        model: requested_model.to_string(),
        choices: vec![OpenAIChoice {
            index: 0,
            message: OpenAIResponseMessage {
                role: "assistant".to_string(),
                content,
            },
            finish_reason: map_finish_reason(&response.stop_reason).to_string(),
        }],
        usage: OpenAIUsage {
            prompt_tokens: response.usage.input_tokens,
            completion_tokens: response.usage.output_tokens,
            total_tokens: response.usage.input_tokens + response.usage.output_tokens,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::mappers::claude::models::Usage;
    use serde_json::json;

    #[test]
    fn system_messages_collapse_into_system_prompt() {
        let request: OpenAIRequest = serde_json::from_value(json!({
            "model": "m",
            "messages": [
                {"role": "system", "content": "be kind"},
                {"role": "user", "content": "hello"},
                {"role": "assistant", "content": "hi"},
                {"role": "user", "content": "bye"}
            ]
        }))
        .unwrap();

        let claude = openai_to_claude_request(&request);
        assert_eq!(claude.messages.len(), 3);
        assert!(claude.system.is_some());
        assert_eq!(claude.messages[0].role, "user");
        assert_eq!(claude.messages[1].role, "assistant");
    }

    #[test]
    fn response_concatenates_text_blocks_only() {
        let claude = ClaudeResponse {
            id: "msg_abc".to_string(),
            type_: "message".to_string(),
            role: "assistant".to_string(),
            model: "gemini-3-flash".to_string(),
            content: vec![
                ContentBlock::Thinking {
                    thinking: "hidden".to_string(),
                    signature: None,
                },
                ContentBlock::Text {
                    text: "visible".to_string(),
                },
            ],
            stop_reason: "end_turn".to_string(),
            stop_sequence: None,
            usage: Usage {
                input_tokens: 5,
                output_tokens: 2,
                cache_read_input_tokens: None,
            },
        };

        let openai = claude_to_openai_response(&claude, "my-model");
        assert_eq!(openai.choices[0].message.content, "visible");
        assert_eq!(openai.choices[0].finish_reason, "stop");
        assert_eq!(openai.usage.total_tokens, 7);
        assert_eq!(openai.model, "my-model");
        assert!(openai.id.starts_with("chatcmpl-"));
    }

    #[test]
    fn finish_reason_mapping() {
        assert_eq!(map_finish_reason("end_turn"), "stop");
        assert_eq!(map_finish_reason("max_tokens"), "length");
        assert_eq!(map_finish_reason("tool_use"), "tool_calls");
    }
}
