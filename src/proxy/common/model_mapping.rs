use crate::proxy::config::{ModelRule, ProxyConfig};
use std::collections::HashMap;

// Default routes from client-facing model ids to upstream model ids.
// Entries are overridden per deployment by the `modelMapping` config table.
static DEFAULT_ROUTES: &[(&str, &str)] = &[
    ("claude-opus-4-1", "gemini-3-pro-high"),
    ("claude-opus-4-5", "gemini-3-pro-high"),
    ("claude-sonnet-4-5", "gemini-3-pro-low"),
    ("claude-sonnet-4-5-thinking", "gemini-3-pro-high"),
    ("claude-haiku-4-5", "gemini-3-flash"),
    ("claude-3-5-haiku", "gemini-3-flash"),
];

pub fn default_route_for(model: &str) -> Option<&'static str> {
    let lowered = model.to_ascii_lowercase();
    DEFAULT_ROUTES
        .iter()
        .find(|(from, _)| lowered.starts_with(from))
        .map(|(_, to)| *to)
}

// Resolve the requested model to the upstream model id: explicit mapping
// first, alias lookup second, prefix defaults third, pass-through last.
pub fn resolve_model_route(requested: &str, rules: &HashMap<String, ModelRule>) -> String {
    if let Some(rule) = rules.get(requested) {
        if let Some(mapping) = &rule.mapping {
            return mapping.clone();
        }
    }
    for (id, rule) in rules {
        if rule.alias.as_deref() == Some(requested) {
            if let Some(mapping) = &rule.mapping {
                return mapping.clone();
            }
            return id.clone();
        }
    }
    if let Some(route) = default_route_for(requested) {
        return route.to_string();
    }
    requested.to_string()
}

pub fn is_claude_model(model: &str) -> bool {
    model.to_ascii_lowercase().starts_with("claude")
}

pub fn is_gemini_model(model: &str) -> bool {
    model.to_ascii_lowercase().contains("gemini")
}

pub fn is_gpt_model(model: &str) -> bool {
    model.to_ascii_lowercase().starts_with("gpt-")
}

// Signature family of a model id. Signatures minted by one family are
// rejected by the other, so cross-family replay must be filtered.
pub fn signature_family(model: &str) -> &'static str {
    if is_claude_model(model) {
        "claude"
    } else {
        "gemini"
    }
}

pub fn is_signature_family_compatible(origin_model: &str, target_model: &str) -> bool {
    signature_family(origin_model) == signature_family(target_model)
}

pub fn model_supports_thinking(model: &str) -> bool {
    let lowered = model.to_ascii_lowercase();
    lowered.contains("thinking")
        || lowered.contains("pro")
        || lowered.ends_with("-high")
        || lowered.ends_with("-low")
}

// Interleaved reasoning between tool calls is only honoured by the pro line.
pub fn model_supports_interleaved_thinking(model: &str) -> bool {
    let lowered = model.to_ascii_lowercase();
    lowered.contains("gemini-3") && lowered.contains("pro")
}

// Hard output ceiling for gemini-family targets; requests above it are capped.
pub const GEMINI_MAX_OUTPUT_TOKENS: i64 = 65_536;

pub fn context_limit_for_model(model: &str) -> u32 {
    if model.to_ascii_lowercase().contains("flash") {
        1_048_576
    } else {
        2_097_152
    }
}

// Models exposed by GET /v1/models when upstream discovery is unavailable.
pub fn listed_models(config: &ProxyConfig) -> Vec<String> {
    let mut models: Vec<String> = DEFAULT_ROUTES
        .iter()
        .map(|(from, _)| (*from).to_string())
        .collect();
    for (id, rule) in &config.model_mapping {
        if rule.hidden {
            models.retain(|m| m != id);
            continue;
        }
        if !models.contains(id) {
            models.push(id.clone());
        }
        if let Some(alias) = &rule.alias {
            if !models.contains(alias) {
                models.push(alias.clone());
            }
        }
    }
    models.sort();
    models
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_routes_match_by_prefix() {
        assert_eq!(
            default_route_for("claude-sonnet-4-5-20250929"),
            Some("gemini-3-pro-low")
        );
        assert_eq!(default_route_for("unknown-model"), None);
    }

    #[test]
    fn explicit_mapping_wins_over_defaults() {
        let mut rules = HashMap::new();
        rules.insert(
            "claude-haiku-4-5".to_string(),
            ModelRule {
                mapping: Some("gemini-3-pro-low".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(
            resolve_model_route("claude-haiku-4-5", &rules),
            "gemini-3-pro-low"
        );
    }

    #[test]
    fn alias_resolves_to_target() {
        let mut rules = HashMap::new();
        rules.insert(
            "gemini-3-flash".to_string(),
            ModelRule {
                alias: Some("fast".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(resolve_model_route("fast", &rules), "gemini-3-flash");
    }

    #[test]
    fn signature_families_split_on_model_prefix() {
        assert!(is_signature_family_compatible(
            "gemini-3-pro-high",
            "gemini-3-flash"
        ));
        assert!(!is_signature_family_compatible(
            "claude-sonnet-4-5",
            "gemini-3-pro-high"
        ));
    }

    #[test]
    fn hidden_models_are_not_listed() {
        let mut config = ProxyConfig::default();
        config.model_mapping.insert(
            "claude-haiku-4-5".to_string(),
            ModelRule {
                hidden: true,
                ..Default::default()
            },
        );
        let models = listed_models(&config);
        assert!(!models.contains(&"claude-haiku-4-5".to_string()));
        assert!(models.contains(&"claude-opus-4-5".to_string()));
    }
}
