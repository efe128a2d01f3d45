//! Adapter boundary: the core consumes `UnifiedMessage`s and replies through
//! a `PlatformAdapter`. Concrete chat platform adapters live outside the
//! core; headless runs (heartbeat, worker) use the silent adapter.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Voice,
    Photo,
    Document,
    Callback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub full_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiButton {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// The single UI primitive the core knows about.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Ui {
    #[serde(default)]
    pub buttons: Vec<UiButton>,
    /// When set by an extension, emitted files are auto-delivered.
    #[serde(default)]
    pub send_files: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedMessage {
    pub id: String,
    pub platform: String,
    pub user: User,
    pub chat: Chat,
    pub kind: MessageKind,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_data: Option<String>,
    pub date: DateTime<Local>,
}

impl UnifiedMessage {
    pub fn text_message(platform: &str, user_id: &str, chat_id: &str, text: &str) -> Self {
        Self {
            id: format!("msg-{}", uuid::Uuid::new_v4()),
            platform: platform.to_string(),
            user: User {
                id: user_id.to_string(),
                full_name: String::new(),
            },
            chat: Chat {
                id: chat_id.to_string(),
            },
            kind: MessageKind::Text,
            text: text.to_string(),
            callback_data: None,
            date: Local::now(),
        }
    }
}

/// What an adapter must offer the core for one conversation.
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    /// Send a reply; returns the platform message id for later edits.
    async fn reply(&self, ctx: &UnifiedContext, text: &str, ui: Option<&Ui>) -> Result<String>;

    async fn edit_message(
        &self,
        ctx: &UnifiedContext,
        message_id: &str,
        text: &str,
        ui: Option<&Ui>,
    ) -> Result<()>;

    async fn reply_photo(
        &self,
        ctx: &UnifiedContext,
        path: &Path,
        caption: Option<&str>,
    ) -> Result<String>;

    async fn reply_document(
        &self,
        ctx: &UnifiedContext,
        path: &Path,
        caption: Option<&str>,
    ) -> Result<String>;

    async fn answer_callback(&self, ctx: &UnifiedContext) -> Result<()>;
}

#[derive(Clone)]
pub struct UnifiedContext {
    pub message: UnifiedMessage,
    pub session_id: String,
    /// Execution policy tag consulted by the primitive runtime
    /// (e.g. heartbeat runs are read-only).
    pub execution_policy: String,
    adapter: Arc<dyn PlatformAdapter>,
}

pub const WORKER_EXECUTION_POLICY: &str = "worker_execution_policy";
pub const HEARTBEAT_READONLY_POLICY: &str = "heartbeat_readonly_policy";

impl UnifiedContext {
    pub fn new(message: UnifiedMessage, session_id: &str, adapter: Arc<dyn PlatformAdapter>) -> Self {
        Self {
            message,
            session_id: session_id.to_string(),
            execution_policy: WORKER_EXECUTION_POLICY.to_string(),
            adapter,
        }
    }

    pub fn with_policy(mut self, policy: &str) -> Self {
        self.execution_policy = policy.to_string();
        self
    }

    pub fn user_id(&self) -> &str {
        &self.message.user.id
    }

    pub fn adapter(&self) -> &Arc<dyn PlatformAdapter> {
        &self.adapter
    }

    pub async fn reply(&self, text: &str, ui: Option<&Ui>) -> Result<String> {
        self.adapter.reply(self, text, ui).await
    }

    pub async fn edit_message(&self, message_id: &str, text: &str, ui: Option<&Ui>) -> Result<()> {
        self.adapter.edit_message(self, message_id, text, ui).await
    }

    pub async fn reply_photo(&self, path: &Path, caption: Option<&str>) -> Result<String> {
        self.adapter.reply_photo(self, path, caption).await
    }

    pub async fn reply_document(&self, path: &Path, caption: Option<&str>) -> Result<String> {
        self.adapter.reply_document(self, path, caption).await
    }

    pub async fn answer_callback(&self) -> Result<()> {
        self.adapter.answer_callback(self).await
    }
}

/// Swallows every reply. Used for heartbeat and worker headless contexts so
/// intermediate output never reaches a user channel.
pub struct SilentAdapter;

#[async_trait]
impl PlatformAdapter for SilentAdapter {
    async fn reply(&self, _ctx: &UnifiedContext, _text: &str, _ui: Option<&Ui>) -> Result<String> {
        Ok(format!("silent-{}", Local::now().timestamp()))
    }

    async fn edit_message(
        &self,
        _ctx: &UnifiedContext,
        _message_id: &str,
        _text: &str,
        _ui: Option<&Ui>,
    ) -> Result<()> {
        Ok(())
    }

    async fn reply_photo(
        &self,
        _ctx: &UnifiedContext,
        _path: &Path,
        _caption: Option<&str>,
    ) -> Result<String> {
        Ok("silent-photo".to_string())
    }

    async fn reply_document(
        &self,
        _ctx: &UnifiedContext,
        _path: &Path,
        _caption: Option<&str>,
    ) -> Result<String> {
        Ok("silent-doc".to_string())
    }

    async fn answer_callback(&self, _ctx: &UnifiedContext) -> Result<()> {
        Ok(())
    }
}

/// Records replies in memory. Test double shared by unit and integration
/// tests that assert on user-visible output.
#[derive(Default)]
pub struct RecordingAdapter {
    pub replies: std::sync::Mutex<Vec<String>>,
    pub documents: std::sync::Mutex<Vec<std::path::PathBuf>>,
}

#[async_trait]
impl PlatformAdapter for RecordingAdapter {
    async fn reply(&self, _ctx: &UnifiedContext, text: &str, _ui: Option<&Ui>) -> Result<String> {
        let mut replies = self.replies.lock().unwrap_or_else(|e| e.into_inner());
        replies.push(text.to_string());
        Ok(format!("rec-{}", replies.len()))
    }

    async fn edit_message(
        &self,
        _ctx: &UnifiedContext,
        _message_id: &str,
        text: &str,
        _ui: Option<&Ui>,
    ) -> Result<()> {
        self.replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(text.to_string());
        Ok(())
    }

    async fn reply_photo(
        &self,
        _ctx: &UnifiedContext,
        path: &Path,
        _caption: Option<&str>,
    ) -> Result<String> {
        self.documents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(path.to_path_buf());
        Ok("rec-photo".to_string())
    }

    async fn reply_document(
        &self,
        _ctx: &UnifiedContext,
        path: &Path,
        _caption: Option<&str>,
    ) -> Result<String> {
        self.documents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(path.to_path_buf());
        Ok("rec-doc".to_string())
    }

    async fn answer_callback(&self, _ctx: &UnifiedContext) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recording_adapter_captures_replies() {
        let adapter = Arc::new(RecordingAdapter::default());
        let msg = UnifiedMessage::text_message("telegram", "1", "1", "hi");
        let ctx = UnifiedContext::new(msg, "s1", adapter.clone());

        ctx.reply("hello", None).await.unwrap();
        ctx.reply("world", None).await.unwrap();

        let replies = adapter.replies.lock().unwrap();
        assert_eq!(replies.as_slice(), ["hello", "world"]);
    }

    #[tokio::test]
    async fn silent_adapter_swallows_everything() {
        let msg = UnifiedMessage::text_message("heartbeat_daemon", "1", "1", "tick");
        let ctx = UnifiedContext::new(msg, "hb", Arc::new(SilentAdapter))
            .with_policy(HEARTBEAT_READONLY_POLICY);
        assert!(ctx.reply("noise", None).await.is_ok());
        assert_eq!(ctx.execution_policy, HEARTBEAT_READONLY_POLICY);
    }
}
