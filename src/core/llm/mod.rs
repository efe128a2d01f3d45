pub mod mock;
pub mod openai;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One part of a conversation turn, mirroring the function-calling wire
/// shape: plain text, a model-issued call, or a tool observation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MessagePart {
    Text { text: String },
    FunctionCall { name: String, args: Value },
    FunctionResponse { name: String, content: Value },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatTurn {
    /// `user`, `model`, or `tool`.
    pub role: String,
    pub parts: Vec<MessagePart>,
}

impl ChatTurn {
    pub fn user_text(text: &str) -> Self {
        Self {
            role: "user".to_string(),
            parts: vec![MessagePart::Text {
                text: text.to_string(),
            }],
        }
    }

    pub fn model_text(text: &str) -> Self {
        Self {
            role: "model".to_string(),
            parts: vec![MessagePart::Text {
                text: text.to_string(),
            }],
        }
    }

    pub fn model_call(name: &str, args: Value) -> Self {
        Self {
            role: "model".to_string(),
            parts: vec![MessagePart::FunctionCall {
                name: name.to_string(),
                args,
            }],
        }
    }

    pub fn tool_response(name: &str, content: Value) -> Self {
        Self {
            role: "tool".to_string(),
            parts: vec![MessagePart::FunctionResponse {
                name: name.to_string(),
                content,
            }],
        }
    }

    /// Rough char weight of a turn, used for the history window budget.
    pub fn char_len(&self) -> usize {
        self.parts
            .iter()
            .map(|part| match part {
                MessagePart::Text { text } => text.len(),
                MessagePart::FunctionCall { name, args } => name.len() + args.to_string().len(),
                MessagePart::FunctionResponse { name, content } => {
                    name.len() + content.to_string().len()
                }
            })
            .sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON-Schema object describing the parameters.
    pub parameters: Value,
}

/// What one model invocation produced: terminal text, or a function call the
/// orchestrator must dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum LlmReply {
    Text(String),
    FunctionCall { name: String, args: Value },
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate(
        &self,
        system_prompt: &str,
        history: &[ChatTurn],
        tools: &[ToolDefinition],
    ) -> Result<LlmReply>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn char_len_counts_all_part_kinds() {
        let turn = ChatTurn {
            role: "model".into(),
            parts: vec![
                MessagePart::Text { text: "abcd".into() },
                MessagePart::FunctionCall {
                    name: "bash".into(),
                    args: json!({"command": "ls"}),
                },
            ],
        };
        assert!(turn.char_len() > 4);
    }

    #[test]
    fn turn_constructors_set_roles() {
        assert_eq!(ChatTurn::user_text("hi").role, "user");
        assert_eq!(ChatTurn::model_text("yo").role, "model");
        assert_eq!(ChatTurn::model_call("read", json!({})).role, "model");
        assert_eq!(ChatTurn::tool_response("read", json!({})).role, "tool");
    }
}
