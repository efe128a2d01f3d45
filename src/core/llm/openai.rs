//! OpenAI-compatible chat-completions client with tool calling. Any endpoint
//! speaking this dialect works; base URL, key and model come from config.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{ChatTurn, LlmClient, LlmReply, MessagePart, ToolDefinition};

pub struct OpenAiClient {
    client: Client,
    api_base: String,
    api_key: String,
    model: String,
}

impl OpenAiClient {
    pub fn new(api_base: &str, api_key: &str, model: &str) -> Self {
        Self {
            client: Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
}

#[derive(Serialize, Deserialize, Default)]
struct WireMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    function: WireFunction,
}

#[derive(Serialize, Deserialize)]
struct WireFunction {
    name: String,
    /// JSON-encoded arguments, per the chat-completions wire format.
    arguments: String,
}

#[derive(Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireMessage,
}

fn to_wire_messages(system_prompt: &str, history: &[ChatTurn]) -> Vec<WireMessage> {
    let mut messages = vec![WireMessage {
        role: "system".to_string(),
        content: Some(system_prompt.to_string()),
        ..Default::default()
    }];

    let mut call_seq = 0usize;
    for turn in history {
        for part in &turn.parts {
            match part {
                MessagePart::Text { text } => messages.push(WireMessage {
                    role: if turn.role == "model" {
                        "assistant".to_string()
                    } else {
                        "user".to_string()
                    },
                    content: Some(text.clone()),
                    ..Default::default()
                }),
                MessagePart::FunctionCall { name, args } => {
                    call_seq += 1;
                    messages.push(WireMessage {
                        role: "assistant".to_string(),
                        content: None,
                        tool_calls: Some(vec![WireToolCall {
                            id: format!("call_{call_seq}"),
                            kind: "function".to_string(),
                            function: WireFunction {
                                name: name.clone(),
                                arguments: args.to_string(),
                            },
                        }]),
                        tool_call_id: None,
                    });
                }
                MessagePart::FunctionResponse { content, .. } => messages.push(WireMessage {
                    role: "tool".to_string(),
                    content: Some(content.to_string()),
                    tool_calls: None,
                    tool_call_id: Some(format!("call_{call_seq}")),
                }),
            }
        }
    }
    messages
}

fn to_wire_tools(tools: &[ToolDefinition]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            json!({
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.parameters,
                }
            })
        })
        .collect()
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn generate(
        &self,
        system_prompt: &str,
        history: &[ChatTurn],
        tools: &[ToolDefinition],
    ) -> Result<LlmReply> {
        let request = WireRequest {
            model: &self.model,
            messages: to_wire_messages(system_prompt, history),
            tools: to_wire_tools(tools),
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?
            .error_for_status()?;

        let body: WireResponse = response.json().await?;
        let message = body
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| anyhow!("LLM response contained no choices"))?;

        if let Some(call) = message.tool_calls.and_then(|mut calls| {
            if calls.is_empty() {
                None
            } else {
                Some(calls.remove(0))
            }
        }) {
            let args = serde_json::from_str(&call.function.arguments).unwrap_or(json!({}));
            return Ok(LlmReply::FunctionCall {
                name: call.function.name,
                args,
            });
        }

        Ok(LlmReply::Text(message.content.unwrap_or_default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_maps_to_wire_roles() {
        let history = vec![
            ChatTurn::user_text("run ls"),
            ChatTurn::model_call("bash", json!({"command": "ls"})),
            ChatTurn::tool_response("bash", json!({"ok": true, "data": "a b"})),
            ChatTurn::model_text("there are two files"),
        ];
        let wire = to_wire_messages("policy", &history);

        assert_eq!(wire[0].role, "system");
        assert_eq!(wire[1].role, "user");
        assert_eq!(wire[2].role, "assistant");
        assert!(wire[2].tool_calls.is_some());
        assert_eq!(wire[3].role, "tool");
        assert_eq!(wire[3].tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(wire[4].role, "assistant");
        assert_eq!(wire[4].content.as_deref(), Some("there are two files"));
    }

    #[test]
    fn tool_definitions_wrap_as_functions() {
        let tools = vec![ToolDefinition {
            name: "read".into(),
            description: "Read a file".into(),
            parameters: json!({"type": "object", "properties": {}}),
        }];
        let wire = to_wire_tools(&tools);
        assert_eq!(wire[0]["type"], "function");
        assert_eq!(wire[0]["function"]["name"], "read");
    }
}
