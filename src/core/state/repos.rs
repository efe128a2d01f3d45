//! Typed repositories over the state store. Each domain lives in one
//! canonical state file and tolerates missing or corrupt files by falling
//! back to defaults.

use chrono::{DateTime, Local, SecondsFormat};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use super::store::{StateError, StateStore};

fn now_iso() -> String {
    Local::now().to_rfc3339_opts(SecondsFormat::Secs, false)
}

fn list_from(payload: &Mapping, key: &str) -> Vec<Value> {
    payload
        .get(key)
        .and_then(Value::as_sequence)
        .cloned()
        .unwrap_or_default()
}

fn decode_list<T: for<'de> Deserialize<'de>>(items: Vec<Value>) -> Vec<T> {
    items
        .into_iter()
        .filter_map(|v| serde_yaml::from_value(v).ok())
        .collect()
}

fn encode_list<T: Serialize>(items: &[T]) -> Value {
    Value::Sequence(
        items
            .iter()
            .filter_map(|item| serde_yaml::to_value(item).ok())
            .collect(),
    )
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserSettings {
    #[serde(default)]
    pub auto_translate: bool,
    #[serde(default = "UserSettings::default_lang")]
    pub target_lang: String,
}

impl UserSettings {
    fn default_lang() -> String {
        "zh-CN".to_string()
    }
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            auto_translate: false,
            target_lang: Self::default_lang(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: u64,
    pub feed_url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchlistEntry {
    pub code: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reminder {
    pub id: u64,
    pub message: String,
    pub trigger_at: String,
    #[serde(default)]
    pub created_at: String,
}

impl StateStore {
    fn settings_path(&self, user_id: &str) -> std::path::PathBuf {
        self.user_path(user_id, &["settings.md"])
    }

    /// Defaults when the file is missing or corrupt; the next write repairs
    /// the file (with a backup if the old bytes were unparseable).
    pub async fn get_user_settings(&self, user_id: &str) -> UserSettings {
        let payload = self.read_or_default(&self.settings_path(user_id)).await;
        serde_yaml::from_value(Value::Mapping(payload)).unwrap_or_default()
    }

    pub async fn set_translation_mode(
        &self,
        user_id: &str,
        enabled: bool,
    ) -> Result<UserSettings, StateError> {
        let mut settings = self.get_user_settings(user_id).await;
        settings.auto_translate = enabled;
        let mut payload = Mapping::new();
        payload.insert("auto_translate".into(), Value::Bool(settings.auto_translate));
        payload.insert(
            "target_lang".into(),
            Value::String(settings.target_lang.clone()),
        );
        payload.insert("updated_at".into(), Value::String(now_iso()));
        self.write_state(&self.settings_path(user_id), &payload).await?;
        Ok(settings)
    }

    fn subscriptions_path(&self, user_id: &str) -> std::path::PathBuf {
        self.user_path(user_id, &["rss", "subscriptions.md"])
    }

    pub async fn list_subscriptions(&self, user_id: &str) -> Vec<Subscription> {
        let payload = self.read_or_default(&self.subscriptions_path(user_id)).await;
        decode_list(list_from(&payload, "feeds"))
    }

    pub async fn add_subscription(
        &self,
        user_id: &str,
        feed_url: &str,
        title: &str,
    ) -> Result<Subscription, StateError> {
        let mut feeds = self.list_subscriptions(user_id).await;
        if let Some(existing) = feeds.iter().find(|s| s.feed_url == feed_url) {
            return Ok(existing.clone());
        }
        let entry = Subscription {
            id: self.next_id("subscription").await?,
            feed_url: feed_url.trim().to_string(),
            title: title.trim().to_string(),
            created_at: now_iso(),
        };
        feeds.push(entry.clone());
        self.write_subscriptions(user_id, &feeds).await?;
        Ok(entry)
    }

    pub async fn delete_subscription(&self, user_id: &str, id: u64) -> Result<bool, StateError> {
        let mut feeds = self.list_subscriptions(user_id).await;
        let before = feeds.len();
        feeds.retain(|s| s.id != id);
        if feeds.len() == before {
            return Ok(false);
        }
        self.write_subscriptions(user_id, &feeds).await?;
        Ok(true)
    }

    async fn write_subscriptions(
        &self,
        user_id: &str,
        feeds: &[Subscription],
    ) -> Result<(), StateError> {
        let mut payload = Mapping::new();
        payload.insert("feeds".into(), encode_list(feeds));
        self.write_state(&self.subscriptions_path(user_id), &payload).await
    }

    fn watchlist_path(&self, user_id: &str) -> std::path::PathBuf {
        self.user_path(user_id, &["stock", "watchlist.md"])
    }

    pub async fn list_watchlist(&self, user_id: &str) -> Vec<WatchlistEntry> {
        let payload = self.read_or_default(&self.watchlist_path(user_id)).await;
        decode_list(list_from(&payload, "stocks"))
    }

    pub async fn add_watchlist_stock(
        &self,
        user_id: &str,
        code: &str,
        name: &str,
    ) -> Result<(), StateError> {
        let mut stocks = self.list_watchlist(user_id).await;
        if stocks.iter().any(|s| s.code == code) {
            return Ok(());
        }
        stocks.push(WatchlistEntry {
            code: code.trim().to_string(),
            name: name.trim().to_string(),
            created_at: now_iso(),
        });
        let mut payload = Mapping::new();
        payload.insert("stocks".into(), encode_list(&stocks));
        self.write_state(&self.watchlist_path(user_id), &payload).await
    }

    pub async fn remove_watchlist_stock(
        &self,
        user_id: &str,
        code: &str,
    ) -> Result<bool, StateError> {
        let mut stocks = self.list_watchlist(user_id).await;
        let before = stocks.len();
        stocks.retain(|s| s.code != code);
        if stocks.len() == before {
            return Ok(false);
        }
        let mut payload = Mapping::new();
        payload.insert("stocks".into(), encode_list(&stocks));
        self.write_state(&self.watchlist_path(user_id), &payload).await?;
        Ok(true)
    }

    fn reminders_path(&self, user_id: &str) -> std::path::PathBuf {
        self.user_path(user_id, &["automation", "reminders.md"])
    }

    pub async fn list_reminders(&self, user_id: &str) -> Vec<Reminder> {
        let payload = self.read_or_default(&self.reminders_path(user_id)).await;
        decode_list(list_from(&payload, "reminders"))
    }

    pub async fn add_reminder(
        &self,
        user_id: &str,
        message: &str,
        trigger_at: &str,
    ) -> Result<Reminder, StateError> {
        let mut reminders = self.list_reminders(user_id).await;
        let entry = Reminder {
            id: self.next_id("reminder").await?,
            message: message.trim().to_string(),
            trigger_at: trigger_at.trim().to_string(),
            created_at: now_iso(),
        };
        reminders.push(entry.clone());
        self.write_reminders(user_id, &reminders).await?;
        Ok(entry)
    }

    /// Reminders whose trigger time is at or before `now`.
    pub async fn pending_reminders(&self, user_id: &str, now: DateTime<Local>) -> Vec<Reminder> {
        self.list_reminders(user_id)
            .await
            .into_iter()
            .filter(|r| {
                DateTime::parse_from_rfc3339(&r.trigger_at)
                    .map(|t| t <= now)
                    .unwrap_or(false)
            })
            .collect()
    }

    pub async fn delete_reminder(&self, user_id: &str, id: u64) -> Result<bool, StateError> {
        let mut reminders = self.list_reminders(user_id).await;
        let before = reminders.len();
        reminders.retain(|r| r.id != id);
        if reminders.len() == before {
            return Ok(false);
        }
        self.write_reminders(user_id, &reminders).await?;
        Ok(true)
    }

    async fn write_reminders(
        &self,
        user_id: &str,
        reminders: &[Reminder],
    ) -> Result<(), StateError> {
        let mut payload = Mapping::new();
        payload.insert("reminders".into(), encode_list(reminders));
        self.write_state(&self.reminders_path(user_id), &payload).await
    }

    fn allowed_users_path(&self) -> std::path::PathBuf {
        self.system_path("allowed_users.md")
    }

    pub async fn list_allowed_users(&self) -> Vec<String> {
        let payload = self.read_or_default(&self.allowed_users_path()).await;
        list_from(&payload, "users")
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect()
    }

    pub async fn is_user_allowed(&self, user_id: &str) -> bool {
        self.list_allowed_users().await.iter().any(|u| u == user_id)
    }

    pub async fn add_allowed_user(&self, user_id: &str) -> Result<(), StateError> {
        let mut users = self.list_allowed_users().await;
        if users.iter().any(|u| u == user_id) {
            return Ok(());
        }
        users.push(user_id.trim().to_string());
        self.write_allowed_users(&users).await
    }

    pub async fn remove_allowed_user(&self, user_id: &str) -> Result<bool, StateError> {
        let mut users = self.list_allowed_users().await;
        let before = users.len();
        users.retain(|u| u != user_id);
        if users.len() == before {
            return Ok(false);
        }
        self.write_allowed_users(&users).await?;
        Ok(true)
    }

    async fn write_allowed_users(&self, users: &[String]) -> Result<(), StateError> {
        let mut payload = Mapping::new();
        payload.insert(
            "users".into(),
            Value::Sequence(users.iter().map(|u| Value::String(u.clone())).collect()),
        );
        self.write_state(&self.allowed_users_path(), &payload).await
    }

    fn video_cache_path(&self) -> std::path::PathBuf {
        self.system_path("video_cache.md")
    }

    pub async fn get_cached_video(&self, file_id: &str) -> Option<String> {
        let payload = self.read_or_default(&self.video_cache_path()).await;
        payload
            .get("entries")
            .and_then(Value::as_mapping)
            .and_then(|m| m.get(file_id))
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    pub async fn save_cached_video(&self, file_id: &str, path: &str) -> Result<(), StateError> {
        let mut payload = self.read_or_default(&self.video_cache_path()).await;
        let mut entries = payload
            .get("entries")
            .and_then(Value::as_mapping)
            .cloned()
            .unwrap_or_default();
        entries.insert(
            Value::String(file_id.to_string()),
            Value::String(path.to_string()),
        );
        payload.insert("entries".into(), Value::Mapping(entries));
        self.write_state(&self.video_cache_path(), &payload).await
    }
}
