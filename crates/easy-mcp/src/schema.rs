//! Schema Normalizer
//!
//! Sanitizes JSON-Schema-like trees coming from route metadata and from
//! bridged providers. After [`normalize`]:
//!
//! - every node typed `object` has a `properties` map (possibly empty)
//! - every node typed `array` has an `items` node (default `{"type": "string"}`)
//!
//! for any nesting depth.

use easy_core::ParameterSpec;
use serde_json::{json, Map, Value};

/// Keywords kept by [`parameter_schema`]
const PARAMETER_KEYWORDS: &[&str] = &[
    "type",
    "description",
    "enum",
    "default",
    "format",
    "minimum",
    "maximum",
    "exclusiveMinimum",
    "exclusiveMaximum",
    "minLength",
    "maxLength",
    "pattern",
    "items",
    "properties",
    "required",
    "minItems",
    "maxItems",
];

/// Sub-schema lists normalized element-wise
const COMPOSITION_KEYWORDS: &[&str] = &["anyOf", "oneOf", "allOf"];

/// Keywords holding a map of name to sub-schema
const SCHEMA_MAP_KEYWORDS: &[&str] = &["$defs", "definitions", "patternProperties", "dependentSchemas"];

/// Keywords holding a list of sub-schemas
const SCHEMA_LIST_KEYWORDS: &[&str] = &["prefixItems"];

/// Keywords holding one sub-schema. Boolean schemas are left as they are.
const SCHEMA_KEYWORDS: &[&str] = &[
    "if",
    "then",
    "else",
    "contains",
    "propertyNames",
    "additionalItems",
    "unevaluatedItems",
    "unevaluatedProperties",
];

/// Map a type name (including common aliases) to a JSON Schema type
fn canonical_type(name: &str) -> &'static str {
    match name.trim().to_ascii_lowercase().as_str() {
        "object" | "dict" | "map" | "record" | "hash" => "object",
        "array" | "list" | "tuple" | "set" | "vec" => "array",
        "integer" | "int" | "long" | "i32" | "i64" | "u32" | "u64" => "integer",
        "number" | "float" | "double" | "decimal" | "f32" | "f64" => "number",
        "boolean" | "bool" => "boolean",
        "null" | "none" => "null",
        _ => "string",
    }
}

/// Resolve the `type` keyword, collapsing unions to their first non-null member
fn resolve_type(node: &Map<String, Value>) -> Option<&'static str> {
    match node.get("type")? {
        Value::String(name) => Some(canonical_type(name)),
        Value::Array(members) => {
            let names: Vec<&str> = members.iter().filter_map(Value::as_str).collect();
            names
                .iter()
                .map(|n| canonical_type(n))
                .find(|t| *t != "null")
                .or_else(|| names.first().map(|_| "null"))
        }
        _ => None,
    }
}

/// Type of a node that has no usable `type` keyword
fn infer_type(node: &Map<String, Value>) -> Option<&'static str> {
    if node.contains_key("properties")
        || node.contains_key("required")
        || node.contains_key("additionalProperties")
    {
        return Some("object");
    }
    if node.contains_key("items") {
        return Some("array");
    }
    if let Some(first) = node.get("enum").and_then(Value::as_array).and_then(|e| e.first()) {
        return Some(match first {
            Value::Bool(_) => "boolean",
            Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
            Value::Number(_) => "number",
            _ => "string",
        });
    }
    // Pure compositions carry their types in the branches
    if COMPOSITION_KEYWORDS.iter().any(|k| node.contains_key(*k)) {
        return None;
    }
    Some("string")
}

/// Normalize a schema tree. Never fails: anything unrecognizable becomes a
/// plain string schema.
pub fn normalize(schema: &Value) -> Value {
    match schema {
        Value::Object(node) => Value::Object(normalize_node(node)),
        // Shorthand: "int", "list", ...
        Value::String(name) => normalize(&json!({ "type": name })),
        // Shorthand tuple/list schema: [itemSchema]
        Value::Array(items) => json!({
            "type": "array",
            "items": items.first().map(normalize).unwrap_or_else(|| json!({"type": "string"})),
        }),
        _ => json!({ "type": "string" }),
    }
}

fn normalize_node(node: &Map<String, Value>) -> Map<String, Value> {
    let mut out = node.clone();
    let ty = resolve_type(node).or_else(|| infer_type(node));
    match ty {
        Some(ty) => {
            out.insert("type".into(), Value::String(ty.into()));
        }
        None => {
            out.remove("type");
        }
    }

    // Arrays first so `items` survives the descent below
    if ty == Some("array") {
        let items = match node.get("items") {
            Some(Value::Array(tuple)) => tuple
                .first()
                .map(normalize)
                .unwrap_or_else(|| json!({"type": "string"})),
            Some(items) => normalize(items),
            None => json!({"type": "string"}),
        };
        out.insert("items".into(), items);
    } else if let Some(items) = node.get("items") {
        out.insert("items".into(), normalize(items));
    }

    if ty == Some("object") || node.contains_key("properties") {
        let properties: Map<String, Value> = node
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| {
                props
                    .iter()
                    .map(|(name, prop)| (name.clone(), normalize(prop)))
                    .collect()
            })
            .unwrap_or_default();
        out.insert("properties".into(), Value::Object(properties));
    }

    match node.get("required") {
        Some(Value::Array(required)) => {
            let mut names: Vec<Value> = Vec::new();
            for name in required.iter().filter(|v| v.is_string()) {
                if !names.contains(name) {
                    names.push(name.clone());
                }
            }
            out.insert("required".into(), Value::Array(names));
        }
        Some(_) => {
            out.remove("required");
        }
        None => {}
    }

    if let Some(additional) = node.get("additionalProperties") {
        if additional.is_object() {
            out.insert("additionalProperties".into(), normalize(additional));
        }
    }

    for keyword in COMPOSITION_KEYWORDS {
        if let Some(branches) = node.get(*keyword) {
            let branches = branches
                .as_array()
                .map(|b| b.iter().map(normalize).collect())
                .unwrap_or_default();
            out.insert((*keyword).into(), Value::Array(branches));
        }
    }

    if let Some(not) = node.get("not") {
        out.insert("not".into(), normalize(not));
    }

    for keyword in SCHEMA_MAP_KEYWORDS {
        if let Some(Value::Object(entries)) = node.get(*keyword) {
            let entries: Map<String, Value> = entries
                .iter()
                .map(|(name, sub)| (name.clone(), normalize(sub)))
                .collect();
            out.insert((*keyword).into(), Value::Object(entries));
        }
    }

    for keyword in SCHEMA_LIST_KEYWORDS {
        if let Some(Value::Array(list)) = node.get(*keyword) {
            out.insert((*keyword).into(), Value::Array(list.iter().map(normalize).collect()));
        }
    }

    for keyword in SCHEMA_KEYWORDS {
        if let Some(sub) = node.get(*keyword).filter(|v| v.is_object()) {
            out.insert((*keyword).into(), normalize(sub));
        }
    }

    out
}

/// Input-schema entry for a declared query/header/path parameter.
///
/// Only plain validation keywords survive; references and vendor extensions
/// are dropped.
pub fn parameter_schema(param: &ParameterSpec) -> Value {
    let base = param
        .schema
        .as_ref()
        .map(normalize)
        .unwrap_or_else(|| json!({"type": "string"}));

    let mut out: Map<String, Value> = base
        .as_object()
        .map(|node| {
            node.iter()
                .filter(|(k, _)| PARAMETER_KEYWORDS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
        .unwrap_or_default();

    if !out.contains_key("type") {
        out.insert("type".into(), json!("string"));
    }
    if let Some(description) = &param.description {
        out.entry("description")
            .or_insert_with(|| Value::String(description.clone()));
    }
    Value::Object(out)
}

/// Request body properties promoted to top-level tool arguments
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlattenedBody {
    pub properties: Map<String, Value>,
    pub required: Vec<String>,
}

/// Flatten one level of nested object properties into dotted keys
/// (`address.city`), promoting nested `required` entries to the same form.
pub fn flatten_body(body: &Value) -> FlattenedBody {
    let body = normalize(body);
    let mut flat = FlattenedBody::default();

    let Some(properties) = body.get("properties").and_then(Value::as_object) else {
        return flat;
    };
    let required = required_names(&body);

    for (name, prop) in properties {
        let nested = prop
            .get("properties")
            .and_then(Value::as_object)
            .filter(|p| prop["type"] == "object" && !p.is_empty());

        match nested {
            Some(nested) => {
                let nested_required = required_names(prop);
                for (child, schema) in nested {
                    let key = format!("{}.{}", name, child);
                    if nested_required.iter().any(|r| r == child) {
                        flat.required.push(key.clone());
                    }
                    flat.properties.insert(key, schema.clone());
                }
            }
            None => {
                if required.iter().any(|r| r == name) {
                    flat.required.push(name.clone());
                }
                flat.properties.insert(name.clone(), prop.clone());
            }
        }
    }
    flat
}

fn required_names(schema: &Value) -> Vec<String> {
    schema
        .get("required")
        .and_then(Value::as_array)
        .map(|r| r.iter().filter_map(Value::as_str).map(String::from).collect())
        .unwrap_or_default()
}

/// Rebuild nested objects from dotted argument keys.
///
/// A dotted key whose parent already holds a non-object value is kept
/// verbatim.
pub fn unflatten_arguments(arguments: Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    let mut dotted = Vec::new();

    for (key, value) in arguments {
        if key.contains('.') {
            dotted.push((key, value));
        } else {
            out.insert(key, value);
        }
    }

    for (key, value) in dotted {
        if !insert_path(&mut out, &key, value.clone()) {
            out.insert(key, value);
        }
    }
    out
}

fn insert_path(target: &mut Map<String, Value>, key: &str, value: Value) -> bool {
    let mut segments = key.split('.').filter(|s| !s.is_empty()).peekable();
    let mut current = target;
    while let Some(segment) = segments.next() {
        if segments.peek().is_none() {
            current.insert(segment.to_string(), value);
            return true;
        }
        let slot = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        match slot {
            Value::Object(next) => current = next,
            _ => return false,
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use easy_core::ParameterLocation;

    /// Walk the tree and check the object/array invariants on every node
    fn assert_invariants(schema: &Value) {
        let Some(node) = schema.as_object() else {
            return;
        };
        match node.get("type").and_then(Value::as_str) {
            Some("object") => assert!(
                node.get("properties").map(Value::is_object).unwrap_or(false),
                "object without properties: {}",
                schema
            ),
            Some("array") => assert!(node.contains_key("items"), "array without items: {}", schema),
            _ => {}
        }
        for value in node.values() {
            match value {
                Value::Object(_) => assert_invariants(value),
                Value::Array(list) => list.iter().for_each(assert_invariants),
                _ => {}
            }
        }
    }

    #[test]
    fn test_object_and_array_defaults() {
        let schema = normalize(&json!({"type": "object"}));
        assert_eq!(schema, json!({"type": "object", "properties": {}}));

        let schema = normalize(&json!({"type": "array"}));
        assert_eq!(schema, json!({"type": "array", "items": {"type": "string"}}));
    }

    #[test]
    fn test_deeply_nested_invariants() {
        let input = json!({
            "type": "object",
            "properties": {
                "matrix": {"type": "array", "items": {"type": "array"}},
                "owner": {
                    "type": "object",
                    "properties": {
                        "tags": {"type": "list"},
                        "meta": {"type": "dict"},
                        "history": {
                            "items": {"properties": {"at": {"type": "string"}}}
                        }
                    }
                },
                "choice": {"anyOf": [{"type": "object"}, {"type": "array"}]},
                "extra": {"additionalProperties": {"type": "array"}},
                "negated": {"not": {"type": "object"}}
            }
        });
        let schema = normalize(&input);
        assert_invariants(&schema);
        assert_eq!(schema["properties"]["matrix"]["items"]["items"]["type"], "string");
        assert_eq!(schema["properties"]["owner"]["properties"]["history"]["type"], "array");
        assert_eq!(schema["properties"]["extra"]["type"], "object");
    }

    #[test]
    fn test_definitions_and_conditional_subschemas() {
        let input = json!({
            "type": "object",
            "$defs": {"x": {"type": "object"}, "list": {"type": "array"}},
            "definitions": {"legacy": {"properties": {"a": {"type": "dict"}}}},
            "patternProperties": {"^a": {"type": "object"}},
            "dependentSchemas": {"b": {"type": "object"}},
            "if": {"type": "object"},
            "then": {"type": "array"},
            "else": {"type": "object"},
            "propertyNames": {"type": "str"},
            "unevaluatedProperties": false,
            "properties": {
                "pair": {"type": "array", "prefixItems": [{"type": "object"}, {"type": "array"}]},
                "some": {"type": "array", "contains": {"type": "object"}}
            }
        });
        let schema = normalize(&input);
        assert_invariants(&schema);
        assert_eq!(schema["$defs"]["x"]["properties"], json!({}));
        assert_eq!(schema["patternProperties"]["^a"]["properties"], json!({}));
        assert_eq!(schema["definitions"]["legacy"]["properties"]["a"]["type"], "object");
        assert_eq!(schema["then"]["items"], json!({"type": "string"}));
        assert_eq!(schema["propertyNames"]["type"], "string");
        assert_eq!(schema["unevaluatedProperties"], false);
        assert_eq!(schema["properties"]["pair"]["prefixItems"][1]["items"]["type"], "string");
        assert_eq!(schema["properties"]["some"]["contains"]["properties"], json!({}));
    }

    #[test]
    fn test_missing_type_inference() {
        assert_eq!(normalize(&json!({"properties": {}}))["type"], "object");
        assert_eq!(normalize(&json!({"items": {}}))["type"], "array");
        assert_eq!(normalize(&json!({"description": "free text"}))["type"], "string");
        assert_eq!(normalize(&json!({"enum": [1, 2]}))["type"], "integer");
        assert_eq!(normalize(&json!(42)), json!({"type": "string"}));
        assert_eq!(normalize(&json!("int")), json!({"type": "integer"}));
        assert!(normalize(&json!({"oneOf": [{"type": "string"}]})).get("type").is_none());
    }

    #[test]
    fn test_union_and_alias_types() {
        assert_eq!(normalize(&json!({"type": ["null", "string"]}))["type"], "string");
        assert_eq!(normalize(&json!({"type": ["null"]}))["type"], "null");
        assert_eq!(normalize(&json!({"type": "float"}))["type"], "number");
        assert_eq!(normalize(&json!({"type": "bool"}))["type"], "boolean");
        assert_eq!(normalize(&json!({"type": "mystery"}))["type"], "string");
    }

    #[test]
    fn test_required_is_sanitized() {
        let schema = normalize(&json!({
            "type": "object",
            "properties": {"a": {"type": "string"}},
            "required": ["a", 3, "a"]
        }));
        assert_eq!(schema["required"], json!(["a"]));
        assert!(normalize(&json!({"type": "object", "required": "a"})).get("required").is_none());
    }

    #[test]
    fn test_parameter_schema_drops_unsafe_keywords() {
        let param = ParameterSpec::new("limit", ParameterLocation::Query)
            .with_description("Page size")
            .with_schema(json!({"type": "int", "$ref": "#/x", "x-internal": true, "maximum": 100}));
        assert_eq!(
            parameter_schema(&param),
            json!({"type": "integer", "maximum": 100, "description": "Page size"})
        );

        let bare = ParameterSpec::new("id", ParameterLocation::Path);
        assert_eq!(parameter_schema(&bare), json!({"type": "string"}));
    }

    #[test]
    fn test_flatten_body_promotes_nested_required() {
        let flat = flatten_body(&json!({
            "type": "object",
            "properties": {
                "name": {"type": "string"},
                "address": {
                    "type": "object",
                    "properties": {"city": {"type": "string"}, "zip": {"type": "string"}},
                    "required": ["city"]
                },
                "labels": {"type": "object"}
            },
            "required": ["name"]
        }));
        let keys: Vec<&str> = flat.properties.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["address.city", "address.zip", "labels", "name"]);
        assert_eq!(flat.required, vec!["address.city".to_string(), "name".to_string()]);
        assert_eq!(flat.properties["labels"], json!({"type": "object", "properties": {}}));
    }

    #[test]
    fn test_flatten_non_object_body() {
        assert_eq!(flatten_body(&json!({"type": "string"})), FlattenedBody::default());
    }

    #[test]
    fn test_unflatten_arguments() {
        let args = json!({"name": "Ada", "address.city": "London", "address.zip": "N1"});
        let out = unflatten_arguments(args.as_object().unwrap().clone());
        assert_eq!(
            Value::Object(out),
            json!({"name": "Ada", "address": {"city": "London", "zip": "N1"}})
        );

        let clash = json!({"address": "flat", "address.city": "London"});
        let out = unflatten_arguments(clash.as_object().unwrap().clone());
        assert_eq!(out["address"], "flat");
        assert_eq!(out["address.city"], "London");
    }
}
