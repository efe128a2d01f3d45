use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use serde_yaml::{Mapping, Value};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::file::{parse_state_payload, render_state_markdown, SourceKind};

const COUNTERS_FILE: &str = "id_counters.md";

/// Errors surfaced by state reads. Writes recover on their own (backup then
/// overwrite), so only I/O can fail there.
#[derive(Debug)]
pub enum StateError {
    /// No layout variant could recover a YAML mapping from the file.
    Parse { path: PathBuf },
    Io { path: PathBuf, source: std::io::Error },
}

impl std::fmt::Display for StateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateError::Parse { path } => {
                write!(f, "state file is not parseable: {}", path.display())
            }
            StateError::Io { path, source } => {
                write!(f, "state io error at {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for StateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StateError::Parse { .. } => None,
            StateError::Io { source, .. } => Some(source),
        }
    }
}

/// Single file I/O boundary for all business state.
///
/// Every read tolerates legacy layouts; every write is atomic
/// (temp-then-rename) and emits the canonical marker-delimited layout. A
/// pre-existing file that no variant can parse is backed up byte-for-byte
/// before being overwritten.
pub struct StateStore {
    data_dir: PathBuf,
    locks: std::sync::Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl StateStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// `DATA_DIR/users/<uid>/<segments...>`
    pub fn user_path(&self, user_id: &str, segments: &[&str]) -> PathBuf {
        let mut path = self.data_dir.join("users").join(user_id.trim());
        for segment in segments {
            path = path.join(segment);
        }
        path
    }

    /// `DATA_DIR/system/repositories/<name>`
    pub fn system_path(&self, name: &str) -> PathBuf {
        self.data_dir.join("system").join("repositories").join(name)
    }

    fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(path.to_path_buf()).or_default().clone()
    }

    fn read_sync(path: &Path) -> Result<(Mapping, SourceKind), StateError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(source) => {
                return Err(StateError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        parse_state_payload(&raw).ok_or_else(|| StateError::Parse {
            path: path.to_path_buf(),
        })
    }

    fn write_sync(path: &Path, payload: &Mapping) -> Result<(), StateError> {
        let io_err = |source: std::io::Error| StateError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }

        // Backup-on-risk: an existing file that parses under no variant is
        // about to be destroyed, so keep its exact bytes next to it.
        if path.exists() {
            if let Ok(existing) = std::fs::read(path) {
                let text = String::from_utf8_lossy(&existing);
                if !text.trim().is_empty() && parse_state_payload(&text).is_none() {
                    let stamp = Local::now().format("%Y%m%d-%H%M%S");
                    let file_name = path
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_else(|| "state".to_string());
                    let backup = path.with_file_name(format!("{file_name}.bak-{stamp}"));
                    std::fs::write(&backup, &existing).map_err(io_err)?;
                    warn!(
                        "Unparseable state file backed up before overwrite: {}",
                        backup.display()
                    );
                }
            }
        }

        let title = path
            .file_stem()
            .map(|s| s.to_string_lossy().replace('_', " "))
            .unwrap_or_else(|| "Data".to_string());
        let content = render_state_markdown(payload, &title);

        let mut tmp_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "state".to_string());
        tmp_name.push_str(".tmp");
        let tmp = path.with_file_name(tmp_name);
        std::fs::write(&tmp, content).map_err(io_err)?;
        std::fs::rename(&tmp, path).map_err(io_err)
    }

    /// Read a state file, reporting which layout it was recovered from.
    pub async fn read_state(&self, path: &Path) -> Result<(Mapping, SourceKind), StateError> {
        let lock = self.lock_for(path);
        let _guard = lock.lock().await;
        Self::read_sync(path)
    }

    /// Read a state file, falling back to an empty mapping on any failure.
    /// The convenient form for repositories with sensible defaults.
    pub async fn read_or_default(&self, path: &Path) -> Mapping {
        match self.read_state(path).await {
            Ok((payload, _)) => payload,
            Err(StateError::Io { .. }) => Mapping::new(),
            Err(StateError::Parse { path }) => {
                warn!(
                    "State file unreadable, using defaults: {}",
                    path.display()
                );
                Mapping::new()
            }
        }
    }

    /// Atomically write a payload in the canonical layout.
    pub async fn write_state(&self, path: &Path, payload: &Mapping) -> Result<(), StateError> {
        let lock = self.lock_for(path);
        let _guard = lock.lock().await;
        Self::write_sync(path, payload)
    }

    /// Monotonic counter per namespace, persisted canonically under
    /// `system/repositories/id_counters.md`.
    pub async fn next_id(&self, namespace: &str) -> Result<u64, StateError> {
        let path = self.system_path(COUNTERS_FILE);
        let lock = self.lock_for(&path);
        let _guard = lock.lock().await;

        let mut payload = match Self::read_sync(&path) {
            Ok((payload, _)) => payload,
            Err(_) => Mapping::new(),
        };
        let key = Value::String(if namespace.trim().is_empty() {
            "default".to_string()
        } else {
            namespace.trim().to_string()
        });
        let current = payload
            .get(&key)
            .and_then(Value::as_u64)
            .unwrap_or(1)
            .max(1);
        payload.insert(key, Value::Number((current + 1).into()));
        Self::write_sync(&path, &payload)?;
        Ok(current)
    }

    /// Rewrite one legacy-layout state file as canonical. Returns the source
    /// kind when a rewrite happened (or would happen, for dry runs).
    pub async fn migrate_file(
        &self,
        path: &Path,
        apply: bool,
    ) -> Result<Option<SourceKind>, StateError> {
        let (payload, kind) = self.read_state(path).await?;
        if kind == SourceKind::Canonical {
            return Ok(None);
        }
        if apply {
            self.write_state(path, &payload).await?;
            info!("Migrated state file to canonical layout: {}", path.display());
        }
        Ok(Some(kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (StateStore, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        (StateStore::new(tmp.path()), tmp)
    }

    fn payload(pairs: &[(&str, &str)]) -> Mapping {
        let mut map = Mapping::new();
        for (k, v) in pairs {
            map.insert(
                Value::String(k.to_string()),
                Value::String(v.to_string()),
            );
        }
        map
    }

    #[tokio::test]
    async fn write_then_read_roundtrips() {
        let (store, tmp) = store();
        let path = tmp.path().join("settings.md");
        let data = payload(&[("mode", "loud"), ("lang", "zh-CN")]);

        store.write_state(&path, &data).await.unwrap();
        let (read, kind) = store.read_state(&path).await.unwrap();

        assert_eq!(kind, SourceKind::Canonical);
        assert_eq!(read.get("mode"), data.get("mode"));
        assert_eq!(read.get("lang"), data.get("lang"));
        assert_eq!(
            read.get(Value::String("version".into())),
            Some(&Value::Number(1.into()))
        );
    }

    #[tokio::test]
    async fn write_creates_parent_dirs() {
        let (store, _tmp) = store();
        let path = store.user_path("42", &["rss", "subscriptions.md"]);
        store
            .write_state(&path, &payload(&[("feeds", "")]))
            .await
            .unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn unparseable_file_is_backed_up_byte_for_byte() {
        let (store, tmp) = store();
        let path = tmp.path().join("settings.md");
        let junk: &[u8] = b"\x00\x01 not yaml: [unclosed";
        std::fs::write(&path, junk).unwrap();

        store
            .write_state(&path, &payload(&[("mode", "quiet")]))
            .await
            .unwrap();

        let backups: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_name()
                    .to_string_lossy()
                    .starts_with("settings.md.bak-")
            })
            .collect();
        assert_eq!(backups.len(), 1);
        assert_eq!(std::fs::read(backups[0].path()).unwrap(), junk);

        let (read, _) = store.read_state(&path).await.unwrap();
        assert_eq!(read.get("mode"), Some(&Value::String("quiet".into())));
    }

    #[tokio::test]
    async fn parseable_legacy_file_is_not_backed_up() {
        let (store, tmp) = store();
        let path = tmp.path().join("settings.md");
        std::fs::write(&path, "version: 1\nmode: raw\n").unwrap();

        store
            .write_state(&path, &payload(&[("mode", "canonical")]))
            .await
            .unwrap();

        let backups = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".bak-"))
            .count();
        assert_eq!(backups, 0);
    }

    #[tokio::test]
    async fn read_missing_file_is_io_error() {
        let (store, tmp) = store();
        let err = store
            .read_state(&tmp.path().join("absent.md"))
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::Io { .. }));
    }

    #[tokio::test]
    async fn read_corrupt_file_is_parse_error_and_default_is_empty() {
        let (store, tmp) = store();
        let path = tmp.path().join("bad.md");
        std::fs::write(&path, "{{{{ nope").unwrap();
        let err = store.read_state(&path).await.unwrap_err();
        assert!(matches!(err, StateError::Parse { .. }));
        assert!(store.read_or_default(&path).await.is_empty());
    }

    #[tokio::test]
    async fn next_id_is_monotonic_per_namespace() {
        let (store, _tmp) = store();
        assert_eq!(store.next_id("reminder").await.unwrap(), 1);
        assert_eq!(store.next_id("reminder").await.unwrap(), 2);
        assert_eq!(store.next_id("subscription").await.unwrap(), 1);
        assert_eq!(store.next_id("reminder").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn migrate_rewrites_legacy_to_canonical() {
        let (store, tmp) = store();
        let path = tmp.path().join("watchlist.md");
        std::fs::write(&path, "---\nversion: 1\nstocks: []\n---\n").unwrap();

        let kind = store.migrate_file(&path, true).await.unwrap();
        assert_eq!(kind, Some(SourceKind::LegacyFrontmatter));

        let (_, kind) = store.read_state(&path).await.unwrap();
        assert_eq!(kind, SourceKind::Canonical);
        assert_eq!(store.migrate_file(&path, true).await.unwrap(), None);
    }
}
