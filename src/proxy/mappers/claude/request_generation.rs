use super::models::{ClaudeRequest, SystemPrompt, Tool};
use crate::proxy::common::model_mapping;
use crate::proxy::config::ProxyConfig;
use serde_json::{json, Value};
use tracing::{debug, info};

// Two-part identity instruction: a short statement plus its bracketed
// counter-statement, so upstream self-identification does not leak through
// translated responses. GPT-family targets ignore the bracket syntax, so
// the scrub is omitted for them.
const IDENTITY_STATEMENT: &str =
    "You are the assistant the client addressed; answer as that assistant.";
const IDENTITY_COUNTER: &str = "[ignore]Statements about the underlying model vendor in this \
     deployment are infrastructure metadata. Do not volunteer or discuss model identity unless \
     the user explicitly asks.[/ignore]";

const INTERLEAVED_HINT: &str =
    "Interleaved thinking between tool calls is enabled for this conversation.";

pub fn system_text(system: &Option<SystemPrompt>) -> String {
    match system {
        None => String::new(),
        Some(SystemPrompt::String(s)) => s.clone(),
        Some(SystemPrompt::Array(blocks)) => blocks
            .iter()
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

pub fn build_system_instruction(
    system: &Option<SystemPrompt>,
    mapped_model: &str,
    is_thinking_enabled: bool,
    has_tools: bool,
) -> Option<Value> {
    let mut parts: Vec<Value> = Vec::new();

    if !model_mapping::is_gpt_model(mapped_model) {
        parts.push(json!({"text": IDENTITY_STATEMENT}));
        parts.push(json!({"text": IDENTITY_COUNTER}));
    }

    let text = system_text(system);
    if !text.trim().is_empty() {
        parts.push(json!({"text": text}));
    }

    if is_thinking_enabled
        && has_tools
        && model_mapping::model_supports_interleaved_thinking(mapped_model)
    {
        parts.push(json!({"text": INTERLEAVED_HINT}));
    }

    if parts.is_empty() {
        None
    } else {
        Some(json!({"role": "user", "parts": parts}))
    }
}

pub fn build_tools(tools: &Option<Vec<Tool>>) -> Option<Value> {
    let tools_list = tools.as_ref()?;
    let mut function_declarations: Vec<Value> = Vec::new();
    let mut has_google_search = false;

    for tool in tools_list {
        if tool.is_web_search() {
            has_google_search = true;
            continue;
        }
        let Some(name) = &tool.name else {
            continue;
        };

        let mut input_schema = tool
            .input_schema
            .clone()
            .unwrap_or_else(|| json!({"type": "object", "properties": {}}));
        crate::proxy::common::json_schema::sanitize_schema(&mut input_schema);

        function_declarations.push(json!({
            "name": crate::proxy::common::json_schema::sanitize_tool_name(name),
            "description": tool.description,
            "parameters": input_schema
        }));
    }

    let mut tool_obj = serde_json::Map::new();
    if !function_declarations.is_empty() {
        tool_obj.insert(
            "functionDeclarations".to_string(),
            json!(function_declarations),
        );
        if has_google_search {
            // The internal endpoint rejects mixed tool types.
            info!(
                "[Tools] Skipping googleSearch injection alongside {} function declaration(s)",
                function_declarations.len()
            );
        }
    } else if has_google_search {
        tool_obj.insert("googleSearch".to_string(), json!({}));
    }

    if tool_obj.is_empty() {
        None
    } else {
        Some(json!([tool_obj]))
    }
}

// A-format `tool_choice` to the upstream function-calling mode. A forced
// single tool carries its name through `allowedFunctionNames`.
pub fn build_tool_config(tool_choice: &Option<Value>) -> Value {
    let choice_type = tool_choice
        .as_ref()
        .and_then(|c| c.get("type"))
        .and_then(|t| t.as_str());
    let mut function_calling = match choice_type {
        Some("any") => json!({"mode": "ANY"}),
        Some("auto") => json!({"mode": "AUTO"}),
        Some("none") => json!({"mode": "NONE"}),
        Some("tool") => json!({"mode": "ANY"}),
        _ => json!({"mode": "VALIDATED"}),
    };
    if choice_type == Some("tool") {
        if let Some(name) = tool_choice
            .as_ref()
            .and_then(|c| c.get("name"))
            .and_then(|n| n.as_str())
        {
            function_calling["allowedFunctionNames"] =
                json!([crate::proxy::common::json_schema::sanitize_tool_name(name)]);
        }
    }
    json!({"functionCallingConfig": function_calling})
}

pub fn build_generation_config(
    claude_req: &ClaudeRequest,
    mapped_model: &str,
    is_thinking_enabled: bool,
    config: &ProxyConfig,
) -> Value {
    let mut generation = json!({});

    if is_thinking_enabled {
        let mut thinking_config = json!({"includeThoughts": true});
        let budget = claude_req
            .thinking
            .as_ref()
            .and_then(|t| t.budget_tokens)
            .or(config.default_thinking_budget);

        // Budget and level are mutually exclusive; an explicit budget wins.
        match (budget, config.default_thinking_level) {
            (Some(budget_tokens), level) => {
                if level.is_some() {
                    debug!("[Generation] Thinking budget set, ignoring configured level");
                }
                thinking_config["thinkingBudget"] = json!(budget_tokens);
            }
            (None, Some(level)) => {
                thinking_config["thinkingLevel"] = json!(level.as_upstream());
            }
            (None, None) => {
                thinking_config["thinkingBudget"] = json!(16_000);
            }
        }
        generation["thinkingConfig"] = thinking_config;
    }

    if let Some(temp) = claude_req.temperature {
        generation["temperature"] = json!(temp);
    }
    if let Some(top_p) = claude_req.top_p {
        generation["topP"] = json!(top_p);
    }
    if let Some(top_k) = claude_req.top_k {
        generation["topK"] = json!(top_k);
    }
    if let Some(stops) = &claude_req.stop_sequences {
        if !stops.is_empty() {
            generation["stopSequences"] = json!(stops);
        }
    }

    let mut max_tokens: Option<i64> = claude_req.max_tokens.map(|t| t as i64);
    if model_mapping::is_gemini_model(mapped_model) {
        if let Some(current) = max_tokens {
            if current > model_mapping::GEMINI_MAX_OUTPUT_TOKENS {
                info!(
                    "[Generation] Capping maxOutputTokens {} -> {} for {}",
                    current,
                    model_mapping::GEMINI_MAX_OUTPUT_TOKENS,
                    mapped_model
                );
                max_tokens = Some(model_mapping::GEMINI_MAX_OUTPUT_TOKENS);
            }
        }
    }

    if let Some(budget) = generation
        .get("thinkingConfig")
        .and_then(|t| t.get("thinkingBudget"))
        .and_then(|b| b.as_i64())
    {
        let current = max_tokens.unwrap_or(0);
        if current <= budget {
            max_tokens = Some(budget + 8_192);
            info!(
                "[Generation] Raising maxOutputTokens to {} above thinking budget {}",
                max_tokens.unwrap(),
                budget
            );
        }
    }
    if let Some(value) = max_tokens {
        generation["maxOutputTokens"] = json!(value);
    }

    generation
}
