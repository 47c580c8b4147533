use crate::proxy::mappers::claude::models::{
    ClaudeRequest, ContentBlock, Message, MessageContent, SystemPrompt,
};
use tracing::{debug, info};

// Rough token estimate: ~4 ASCII chars or ~1.5 CJK chars per token. This is
// an estimate, not tokenizer output; budgets derived from it are approximate.
fn estimate_tokens_from_str(s: &str) -> u32 {
    if s.is_empty() {
        return 0;
    }
    let mut ascii_chars = 0u32;
    let mut unicode_chars = 0u32;
    for c in s.chars() {
        if c.is_ascii() {
            ascii_chars += 1;
        } else {
            unicode_chars += 1;
        }
    }
    let ascii_tokens = (ascii_chars as f32 / 4.0).ceil() as u32;
    let unicode_tokens = (unicode_chars as f32 / 1.5).ceil() as u32;
    ascii_tokens + unicode_tokens
}

const PER_MESSAGE_OVERHEAD: u32 = 4;

pub fn estimate_message_tokens(msg: &Message) -> u32 {
    let mut total = PER_MESSAGE_OVERHEAD;
    match &msg.content {
        MessageContent::String(s) => total += estimate_tokens_from_str(s),
        MessageContent::Array(blocks) => {
            for block in blocks {
                match block {
                    ContentBlock::Text { text } => total += estimate_tokens_from_str(text),
                    ContentBlock::Thinking { thinking, .. } => {
                        total += estimate_tokens_from_str(thinking) + 100;
                    }
                    ContentBlock::RedactedThinking { data } => {
                        total += estimate_tokens_from_str(data);
                    }
                    ContentBlock::ToolUse { name, input, .. } => {
                        total += 20 + estimate_tokens_from_str(name);
                        if let Ok(json_str) = serde_json::to_string(input) {
                            total += estimate_tokens_from_str(&json_str);
                        }
                    }
                    ContentBlock::ToolResult { content, .. } => {
                        total += 10;
                        if let Some(s) = content.as_str() {
                            total += estimate_tokens_from_str(s);
                        } else if let Ok(s) = serde_json::to_string(content) {
                            total += estimate_tokens_from_str(&s);
                        }
                    }
                    ContentBlock::Image { .. } | ContentBlock::Document { .. } => {
                        total += 768;
                    }
                }
            }
        }
    }
    total
}

pub fn estimate_request_tokens(request: &ClaudeRequest) -> u32 {
    let mut total = 0;
    if let Some(system) = &request.system {
        match system {
            SystemPrompt::String(s) => total += estimate_tokens_from_str(s),
            SystemPrompt::Array(blocks) => {
                for block in blocks {
                    total += estimate_tokens_from_str(&block.text);
                }
            }
        }
    }
    for msg in &request.messages {
        total += estimate_message_tokens(msg);
    }
    if let Some(tools) = &request.tools {
        for tool in tools {
            if let Ok(json_str) = serde_json::to_string(tool) {
                total += estimate_tokens_from_str(&json_str);
            }
        }
    }
    total
}

fn message_has_tool_result(msg: &Message) -> bool {
    msg.has_tool_result()
}

fn message_has_tool_use(msg: &Message) -> bool {
    msg.has_tool_use()
}

// Trim the history to the token budget, newest first. A budget of zero
// disables truncation. Two rescues override the budget:
//  - a kept tool-result keeps the tool-call message immediately before it,
//  - a surviving assistant-first history gets its preceding user message back.
pub fn truncate_history(messages: &mut Vec<Message>, max_tokens: u32) {
    if max_tokens == 0 || messages.is_empty() {
        return;
    }

    let mut budget = max_tokens as i64;
    let mut cut = messages.len();
    for (i, msg) in messages.iter().enumerate().rev() {
        let cost = estimate_message_tokens(msg) as i64;
        if budget - cost < 0 && cut < messages.len() {
            break;
        }
        budget -= cost;
        cut = i;
        if budget <= 0 {
            break;
        }
    }

    if cut == 0 {
        return;
    }

    // Tool-call/tool-result pairing must survive the cut.
    while cut > 0
        && message_has_tool_result(&messages[cut])
        && message_has_tool_use(&messages[cut - 1])
    {
        debug!("[Truncation] Keeping tool-call message at {} over budget", cut - 1);
        cut -= 1;
    }

    let mut rescued_user: Option<Message> = None;
    if messages[cut].role == "assistant" {
        rescued_user = messages[..cut]
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .cloned();
    }

    let dropped = cut;
    messages.drain(..cut);
    if let Some(user_msg) = rescued_user {
        messages.insert(0, user_msg);
    }
    info!(
        "[Truncation] Dropped {} message(s) to fit ~{} token budget",
        dropped, max_tokens
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user(text: &str) -> Message {
        Message::user_text(text.to_string())
    }

    fn assistant(text: &str) -> Message {
        Message::assistant_blocks(vec![ContentBlock::Text {
            text: text.to_string(),
        }])
    }

    fn tool_call(id: &str) -> Message {
        Message::assistant_blocks(vec![ContentBlock::ToolUse {
            id: id.to_string(),
            name: "t".to_string(),
            input: json!({}),
            signature: None,
        }])
    }

    fn tool_result(id: &str) -> Message {
        Message {
            role: "user".to_string(),
            content: MessageContent::Array(vec![ContentBlock::ToolResult {
                tool_use_id: id.to_string(),
                content: json!("done"),
                is_error: None,
            }]),
        }
    }

    #[test]
    fn zero_budget_disables_truncation() {
        let mut messages = vec![user(&"x".repeat(10_000)), assistant("ok")];
        truncate_history(&mut messages, 0);
        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn oldest_messages_are_dropped_first() {
        let mut messages = vec![
            user(&"old ".repeat(400)),
            assistant(&"older answer ".repeat(400)),
            user("recent question"),
        ];
        truncate_history(&mut messages, 50);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, "user");
    }

    #[test]
    fn kept_tool_result_rescues_preceding_tool_call() {
        let mut messages = vec![
            user(&"pad ".repeat(500)),
            tool_call("T1"),
            tool_result("T1"),
            assistant("final"),
        ];
        // Budget roughly fits the last two messages only.
        truncate_history(&mut messages, 40);
        assert!(messages.iter().any(message_has_tool_use));
        let first_result = messages.iter().position(message_has_tool_result).unwrap();
        assert!(message_has_tool_use(&messages[first_result - 1]));
    }

    #[test]
    fn assistant_first_history_gets_user_prefix_back() {
        let mut messages = vec![
            user("the original task"),
            assistant(&"long answer ".repeat(300)),
            assistant("short follow-up"),
        ];
        truncate_history(&mut messages, 30);
        assert_eq!(messages[0].role, "user");
    }

    #[test]
    fn truncation_is_monotone_in_budget() {
        let build = || {
            vec![
                user(&"a ".repeat(100)),
                assistant(&"b ".repeat(100)),
                user(&"c ".repeat(100)),
                assistant(&"d ".repeat(100)),
                user("tail"),
            ]
        };

        let mut small = build();
        truncate_history(&mut small, 80);
        let mut large = build();
        truncate_history(&mut large, 200);

        assert!(large.len() >= small.len());
        // The smaller-budget result is a suffix of the larger one.
        let offset = large.len() - small.len();
        for (i, msg) in small.iter().enumerate() {
            let expected = &large[offset + i];
            assert_eq!(msg.role, expected.role);
        }
    }

    #[test]
    fn estimator_counts_tool_payloads() {
        let msg = tool_call("T1");
        assert!(estimate_message_tokens(&msg) > PER_MESSAGE_OVERHEAD);
    }
}
