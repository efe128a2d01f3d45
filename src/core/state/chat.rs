//! Append-only chat transcripts under `users/<uid>/chat/YYYY-MM-DD/`.
//! Transcripts are plain markdown and deliberately outside the strict
//! state-file protocol.

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::Local;
use tokio::io::AsyncWriteExt;

pub struct ChatLog {
    data_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatEntry {
    pub role: String,
    pub content: String,
}

impl ChatLog {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    fn day_dir(&self, user_id: &str, day: &str) -> PathBuf {
        self.data_dir
            .join("users")
            .join(user_id.trim())
            .join("chat")
            .join(day)
    }

    fn session_path(&self, user_id: &str, session_id: &str) -> PathBuf {
        let day = Local::now().format("%Y-%m-%d").to_string();
        self.day_dir(user_id, &day).join(format!("{session_id}.md"))
    }

    pub async fn save_message(
        &self,
        user_id: &str,
        session_id: &str,
        role: &str,
        content: &str,
    ) -> Result<()> {
        let path = self.session_path(user_id, session_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let line = format!("**{}**: {}\n\n", role.trim(), content.trim());
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }

    /// Last `limit` entries of a session transcript, oldest first.
    pub async fn session_messages(
        &self,
        user_id: &str,
        session_id: &str,
        limit: usize,
    ) -> Vec<ChatEntry> {
        let path = self.session_path(user_id, session_id);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(_) => return Vec::new(),
        };
        let entries = Self::parse_transcript(&raw);
        let skip = entries.len().saturating_sub(limit);
        entries.into_iter().skip(skip).collect()
    }

    /// Most recently modified session id for today, if any.
    pub async fn latest_session_id(&self, user_id: &str) -> Option<String> {
        let day = Local::now().format("%Y-%m-%d").to_string();
        let dir = self.day_dir(user_id, &day);
        let mut latest: Option<(std::time::SystemTime, String)> = None;
        let mut entries = tokio::fs::read_dir(&dir).await.ok()?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let Some(modified) = entry.metadata().await.ok().and_then(|m| m.modified().ok())
            else {
                continue;
            };
            let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().to_string()) else {
                continue;
            };
            if latest.as_ref().map(|(t, _)| modified > *t).unwrap_or(true) {
                latest = Some((modified, stem));
            }
        }
        latest.map(|(_, id)| id)
    }

    fn parse_transcript(raw: &str) -> Vec<ChatEntry> {
        let mut entries = Vec::new();
        for block in raw.split("\n\n") {
            let block = block.trim();
            let Some(rest) = block.strip_prefix("**") else {
                continue;
            };
            let Some((role, content)) = rest.split_once("**: ") else {
                continue;
            };
            entries.push(ChatEntry {
                role: role.to_string(),
                content: content.to_string(),
            });
        }
        entries
    }

    pub fn root(&self) -> &Path {
        &self.data_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transcript_appends_and_reads_back_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let log = ChatLog::new(tmp.path());

        log.save_message("1", "s1", "user", "hello").await.unwrap();
        log.save_message("1", "s1", "model", "hi there").await.unwrap();
        log.save_message("1", "s1", "user", "bye").await.unwrap();

        let entries = log.session_messages("1", "s1", 10).await;
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].role, "user");
        assert_eq!(entries[1].content, "hi there");

        let tail = log.session_messages("1", "s1", 1).await;
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].content, "bye");
    }

    #[tokio::test]
    async fn missing_session_reads_as_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let log = ChatLog::new(tmp.path());
        assert!(log.session_messages("1", "nope", 10).await.is_empty());
        assert!(log.latest_session_id("1").await.is_none());
    }

    #[tokio::test]
    async fn latest_session_id_tracks_most_recent_write() {
        let tmp = tempfile::tempdir().unwrap();
        let log = ChatLog::new(tmp.path());
        log.save_message("1", "a", "user", "x").await.unwrap();
        log.save_message("1", "b", "user", "y").await.unwrap();
        let latest = log.latest_session_id("1").await;
        assert!(latest.is_some());
    }
}
