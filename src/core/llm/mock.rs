//! Scripted LLM double for orchestrator tests: pops one reply per call and
//! records what it was asked, so tests can assert on prompts and tool lists.

use std::collections::VecDeque;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use super::{ChatTurn, LlmClient, LlmReply, ToolDefinition};

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub system_prompt: String,
    pub history: Vec<ChatTurn>,
    pub tool_names: Vec<String>,
}

#[derive(Default)]
pub struct MockLlm {
    script: Mutex<VecDeque<LlmReply>>,
    pub calls: Mutex<Vec<RecordedCall>>,
}

impl MockLlm {
    pub fn scripted(replies: Vec<LlmReply>) -> Self {
        Self {
            script: Mutex::new(replies.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn generate(
        &self,
        system_prompt: &str,
        history: &[ChatTurn],
        tools: &[ToolDefinition],
    ) -> Result<LlmReply> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(RecordedCall {
                system_prompt: system_prompt.to_string(),
                history: history.to_vec(),
                tool_names: tools.iter().map(|t| t.name.clone()).collect(),
            });
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .ok_or_else(|| anyhow!("mock LLM script exhausted"))
    }
}
