mod access;
mod primitives;

pub use access::{AgentKind, ToolAccessStore};
pub use primitives::{ExecContext, PrimitiveRuntime, MAX_BASH_OUTPUT};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::llm::ToolDefinition;

/// Uniform result shape for every tool, extension and worker observation.
/// `ok:false` is an observation for the model, not a loop-terminating error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ToolResponse {
    pub fn ok(data: Value, summary: impl Into<String>) -> Self {
        Self {
            ok: true,
            data: Some(data),
            summary: Some(summary.into()),
            error_code: None,
            message: None,
        }
    }

    pub fn err(error_code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            summary: None,
            error_code: Some(error_code.into()),
            message: Some(message.into()),
        }
    }

    pub fn unauthorized(detail: impl Into<String>) -> Self {
        Self::err("unauthorized", detail)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({"ok": false}))
    }
}

/// Names of the four baseline tools.
pub const PRIMITIVE_TOOLS: &[&str] = &["read", "write", "edit", "bash"];

pub const MEMORY_TOOLS: &[&str] = &[
    "open_nodes",
    "create_entities",
    "create_relations",
    "add_observations",
    "read_graph",
];

/// Declarations for the four primitives. Always part of every profile.
pub fn primitive_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "read".into(),
            description: "Read a file from the workspace, optionally a line range.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "start_line": {"type": "integer", "minimum": 1},
                    "max_lines": {"type": "integer", "minimum": 1},
                    "encoding": {"type": "string"}
                },
                "required": ["path"]
            }),
        },
        ToolDefinition {
            name: "write".into(),
            description: "Write a file atomically. mode=create fails if the file exists.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "content": {"type": "string"},
                    "mode": {"type": "string", "enum": ["create", "overwrite"]},
                    "create_parents": {"type": "boolean"}
                },
                "required": ["path", "content"]
            }),
        },
        ToolDefinition {
            name: "edit".into(),
            description:
                "Apply match/replace edits to a file in order. Ambiguous matches fail unless count is given."
                    .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "edits": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "match": {"type": "string"},
                                "replace": {"type": "string"},
                                "count": {"type": "integer", "minimum": 1}
                            },
                            "required": ["match", "replace"]
                        }
                    },
                    "dry_run": {"type": "boolean"}
                },
                "required": ["path", "edits"]
            }),
        },
        ToolDefinition {
            name: "bash".into(),
            description: "Run a shell command under /bin/sh -c. Output is truncated at 64 KB.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string"},
                    "cwd": {"type": "string"},
                    "timeout_sec": {"type": "integer", "minimum": 1, "maximum": 300}
                },
                "required": ["command"]
            }),
        },
    ]
}

pub fn extension_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "run_extension".into(),
            description: "Invoke an installed skill by name with structured arguments.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "skill_name": {"type": "string"},
                    "args": {"type": "object"}
                },
                "required": ["skill_name"]
            }),
        },
        ToolDefinition {
            name: "list_extensions".into(),
            description: "List installed skills with their descriptions and triggers.".into(),
            parameters: json!({"type": "object", "properties": {}}),
        },
    ]
}

pub fn dispatch_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "list_workers".into(),
            description: "List workers in the fleet with status and capabilities.".into(),
            parameters: json!({"type": "object", "properties": {}}),
        },
        ToolDefinition {
            name: "dispatch_worker".into(),
            description: "Hand a sub-task to a worker; blocks until its structured result returns."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "worker_id": {"type": "string"},
                    "instruction": {"type": "string"},
                    "metadata": {"type": "object"}
                },
                "required": ["worker_id", "instruction"]
            }),
        },
    ]
}

pub fn memory_definitions() -> Vec<ToolDefinition> {
    MEMORY_TOOLS
        .iter()
        .map(|name| ToolDefinition {
            name: name.to_string(),
            description: format!("Memory graph operation `{name}` (Manager only)."),
            parameters: json!({"type": "object", "properties": {"payload": {"type": "object"}}}),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn responses_serialize_with_expected_fields() {
        let ok = ToolResponse::ok(json!({"x": 1}), "did x");
        let value = ok.to_value();
        assert_eq!(value["ok"], true);
        assert_eq!(value["data"]["x"], 1);
        assert!(value.get("error_code").is_none());

        let err = ToolResponse::err("timeout", "too slow");
        let value = err.to_value();
        assert_eq!(value["ok"], false);
        assert_eq!(value["error_code"], "timeout");
    }

    #[test]
    fn primitive_definitions_cover_all_four() {
        let names: Vec<String> = primitive_definitions()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, PRIMITIVE_TOOLS);
    }
}
