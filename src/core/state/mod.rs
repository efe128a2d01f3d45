mod chat;
mod file;
mod repos;
mod store;

pub use chat::{ChatEntry, ChatLog};
pub use file::{
    extract_state_yaml_payload, parse_state_payload, render_state_markdown, SourceKind,
    STATE_BEGIN_MARKER, STATE_END_MARKER,
};
pub use repos::{Reminder, Subscription, UserSettings, WatchlistEntry};
pub use store::{StateError, StateStore};
