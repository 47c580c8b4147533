use serde_json::{json, Map, Value};

// Keys with no upstream equivalent; dropped outright.
const STRIP_KEYS: &[&str] = &[
    "$schema",
    "$id",
    "title",
    "additionalProperties",
    "definitions",
    "$defs",
    "deprecated",
    "readOnly",
    "writeOnly",
];

// Constraint keys the upstream schema dialect rejects; their values are
// preserved as a hint inside `description` before removal.
const HOISTED_CONSTRAINTS: &[&str] = &[
    "minLength",
    "maxLength",
    "pattern",
    "format",
    "examples",
    "minimum",
    "maximum",
    "exclusiveMinimum",
    "exclusiveMaximum",
    "multipleOf",
    "minItems",
    "maxItems",
    "uniqueItems",
    "default",
];

// Normalize a declared tool name to the accepted charset `[A-Za-z0-9_-]`,
// capped at 64 chars.
pub fn sanitize_tool_name(name: &str) -> String {
    let mut cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(64)
        .collect();
    if cleaned.is_empty() {
        cleaned.push_str("tool");
    }
    cleaned
}

fn upper_type_name(raw: &str) -> String {
    match raw.to_ascii_lowercase().as_str() {
        "string" => "STRING".to_string(),
        "number" => "NUMBER".to_string(),
        "integer" => "INTEGER".to_string(),
        "boolean" => "BOOLEAN".to_string(),
        "object" => "OBJECT".to_string(),
        "array" => "ARRAY".to_string(),
        "null" => "NULL".to_string(),
        other => other.to_ascii_uppercase(),
    }
}

fn lower_type_name(raw: &str) -> String {
    raw.to_ascii_lowercase()
}

// Coarse type of a schema alternative, for ranking and for hints.
fn alternative_type(schema: &Value) -> String {
    if let Some(t) = schema.get("type").and_then(Value::as_str) {
        return lower_type_name(t);
    }
    if schema.get("properties").is_some() {
        return "object".to_string();
    }
    if schema.get("items").is_some() {
        return "array".to_string();
    }
    "value".to_string()
}

fn alternative_rank(type_name: &str) -> u8 {
    match type_name {
        "object" => 3,
        "array" => 2,
        _ => 1,
    }
}

fn append_description(map: &mut Map<String, Value>, addition: &str) {
    let existing = map
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let merged = if existing.is_empty() {
        addition.to_string()
    } else {
        format!("{} {}", existing, addition)
    };
    map.insert("description".to_string(), json!(merged));
}

fn inline_reference(map: &mut Map<String, Value>) {
    if let Some(reference) = map.remove("$ref") {
        let hint = format!(
            "[Reference: {}]",
            reference.as_str().unwrap_or("unresolved")
        );
        let description = map.get("description").and_then(Value::as_str).map(|d| {
            if d.is_empty() {
                hint.clone()
            } else {
                format!("{} {}", d, hint)
            }
        });
        map.clear();
        map.insert("type".to_string(), json!("OBJECT"));
        map.insert(
            "description".to_string(),
            json!(description.unwrap_or(hint)),
        );
    }
}

// Merge every `allOf` member into one object: union of properties, union of
// required, first declared type wins.
fn merge_all_of(map: &mut Map<String, Value>) {
    let Some(Value::Array(members)) = map.remove("allOf") else {
        return;
    };

    let mut properties = map
        .remove("properties")
        .and_then(|v| match v {
            Value::Object(o) => Some(o),
            _ => None,
        })
        .unwrap_or_default();
    let mut required: Vec<Value> = map
        .remove("required")
        .and_then(|v| match v {
            Value::Array(a) => Some(a),
            _ => None,
        })
        .unwrap_or_default();

    for member in members {
        let Value::Object(member_map) = member else {
            continue;
        };
        if !map.contains_key("type") {
            if let Some(t) = member_map.get("type") {
                map.insert("type".to_string(), t.clone());
            }
        }
        if let Some(Value::Object(member_props)) = member_map.get("properties") {
            for (k, v) in member_props {
                properties.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }
        if let Some(Value::Array(member_required)) = member_map.get("required") {
            for item in member_required {
                if !required.contains(item) {
                    required.push(item.clone());
                }
            }
        }
    }

    if !properties.is_empty() {
        map.insert("properties".to_string(), Value::Object(properties));
        map.entry("type".to_string()).or_insert_with(|| json!("object"));
    }
    if !required.is_empty() {
        map.insert("required".to_string(), Value::Array(required));
    }
}

// Flatten `anyOf`/`oneOf` by keeping the highest-ranked alternative
// (object > array > primitive, ties to the first) and recording the full
// alternative list in the description.
fn flatten_alternatives(map: &mut Map<String, Value>) {
    let members = match map.remove("anyOf").or_else(|| map.remove("oneOf")) {
        Some(Value::Array(members)) if !members.is_empty() => members,
        Some(other) => {
            map.insert("anyOf".to_string(), other);
            return;
        }
        None => return,
    };

    let type_names: Vec<String> = members.iter().map(alternative_type).collect();
    let mut best_idx = 0;
    for (i, name) in type_names.iter().enumerate() {
        if alternative_rank(name) > alternative_rank(&type_names[best_idx]) {
            best_idx = i;
        }
    }

    let chosen = members.into_iter().nth(best_idx).unwrap_or(json!({}));
    if let Value::Object(chosen_map) = chosen {
        for (k, v) in chosen_map {
            if k == "description" {
                continue;
            }
            map.entry(k).or_insert(v);
        }
    }
    append_description(map, &format!("Accepts: {}", type_names.join(" | ")));
}

fn flatten_type_array(map: &mut Map<String, Value>) {
    let Some(Value::Array(types)) = map.get("type") else {
        return;
    };
    let first_non_null = types
        .iter()
        .filter_map(Value::as_str)
        .find(|t| !t.eq_ignore_ascii_case("null"))
        .unwrap_or("string")
        .to_string();
    map.insert("type".to_string(), json!(first_non_null));
}

fn hoist_constraints(map: &mut Map<String, Value>) {
    let mut hints = Vec::new();
    for key in HOISTED_CONSTRAINTS {
        if let Some(value) = map.remove(*key) {
            hints.push(format!("[{}: {}]", key, value));
        }
    }
    if !hints.is_empty() {
        append_description(map, &hints.join(" "));
    }
}

fn sanitize_node(value: &mut Value) {
    let Value::Object(map) = value else {
        return;
    };

    inline_reference(map);
    merge_all_of(map);
    flatten_alternatives(map);
    flatten_type_array(map);

    if let Some(constant) = map.remove("const") {
        map.insert("enum".to_string(), json!([constant]));
    }

    hoist_constraints(map);
    for key in STRIP_KEYS {
        map.remove(*key);
    }

    if let Some(t) = map.get("type").and_then(Value::as_str) {
        let upper = upper_type_name(t);
        map.insert("type".to_string(), json!(upper));
    }

    if let Some(Value::Object(properties)) = map.get_mut("properties") {
        for (_, child) in properties.iter_mut() {
            sanitize_node(child);
        }
    }
    if let Some(items) = map.get_mut("items") {
        sanitize_node(items);
    }
}

// Rewrite a tool input schema into the dialect the upstream accepts.
// Idempotent: a second pass leaves the schema unchanged.
pub fn sanitize_schema(schema: &mut Value) {
    sanitize_node(schema);
}
