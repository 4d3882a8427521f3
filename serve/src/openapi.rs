//! OpenAPI generation for the proxy surface.
//!
//! Deliberately thin and flat: one `components.schemas.<name>Request` per
//! tool mirroring its input schema (properties at the root, no nested
//! `allOf`), one path entry with `operationId: tool_<name>_post`. serde_json
//! keeps object keys sorted, so regeneration from the same catalog is
//! byte-identical.

use serde_json::{json, Map, Value};

use crate::catalog::ToolCatalog;

/// Builds the full OpenAPI 3.0 document for the catalog.
pub fn generate(catalog: &ToolCatalog, title: &str, version: &str, base_path: &str) -> Value {
    let mut paths = Map::new();
    let mut schemas = Map::new();

    for tool in catalog.tools() {
        let schema_name = format!("{}Request", tool.name);
        schemas.insert(schema_name.clone(), flatten_schema(&tool.input_schema));

        paths.insert(
            format!("{base_path}/{}", tool.name),
            json!({
                "post": {
                    "operationId": format!("tool_{}_post", tool.name),
                    "summary": tool.description,
                    "requestBody": {
                        "required": true,
                        "content": {
                            "application/json": {
                                "schema": { "$ref": format!("#/components/schemas/{schema_name}") }
                            }
                        }
                    },
                    "responses": {
                        "200": {
                            "description": "Tool result",
                            "content": {
                                "application/json": {
                                    "schema": { "$ref": "#/components/schemas/ToolResponse" }
                                }
                            }
                        },
                        "401": { "description": "Unauthorized" }
                    }
                }
            }),
        );
    }

    schemas.insert(
        "ToolResponse".to_string(),
        json!({
            "type": "object",
            "properties": {
                "success": { "type": "boolean" },
                "tool": { "type": "string" },
                "result": {},
                "error": { "type": "string" }
            }
        }),
    );

    paths.insert(
        format!("{base_path}/health"),
        json!({
            "get": {
                "operationId": "health_get",
                "summary": "Health check",
                "responses": { "200": { "description": "Service is healthy" } }
            }
        }),
    );

    json!({
        "openapi": "3.0.3",
        "info": { "title": title, "version": version },
        "paths": Value::Object(paths),
        "components": { "schemas": Value::Object(schemas) }
    })
}

/// Keeps request schemas flat: the tool's properties land at the root of the
/// request schema; anything non-object degrades to a permissive object.
fn flatten_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => {
            let mut flat = Map::new();
            flat.insert("type".to_string(), json!("object"));
            if let Some(properties) = map.get("properties") {
                flat.insert("properties".to_string(), properties.clone());
            } else {
                flat.insert("properties".to_string(), json!({}));
            }
            if let Some(required) = map.get("required") {
                flat.insert("required".to_string(), required.clone());
            }
            Value::Object(flat)
        }
        _ => json!({ "type": "object", "properties": {} }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flatten_keeps_properties_at_root() {
        let flat = flatten_schema(&json!({
            "type": "object",
            "properties": { "q": { "type": "string" } },
            "required": ["q"],
            "additionalProperties": false
        }));
        assert_eq!(flat["type"], "object");
        assert_eq!(flat["properties"]["q"]["type"], "string");
        assert_eq!(flat["required"], json!(["q"]));
        // Extraneous keywords that break downstream aggregators are dropped.
        assert!(flat.get("additionalProperties").is_none());
        assert!(flat.get("allOf").is_none());
    }

    #[test]
    fn flatten_degrades_non_objects() {
        let flat = flatten_schema(&json!(42));
        assert_eq!(flat["type"], "object");
        assert_eq!(flat["properties"], json!({}));
    }
}
