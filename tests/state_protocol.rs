//! End-to-end properties of the canonical state file protocol: roundtrip,
//! legacy tolerance, backup safety, and corrupt-settings recovery.

use serde_yaml::{Mapping, Value};
use xbot::core::state::{SourceKind, StateError, StateStore};

fn payload(pairs: &[(&str, &str)]) -> Mapping {
    let mut map = Mapping::new();
    for (k, v) in pairs {
        map.insert(Value::String(k.to_string()), Value::String(v.to_string()));
    }
    map
}

#[tokio::test]
async fn roundtrip_preserves_payload_and_key_order() {
    let tmp = tempfile::tempdir().unwrap();
    let store = StateStore::new(tmp.path());
    let path = tmp.path().join("subscriptions.md");

    let data = payload(&[("zeta", "1"), ("alpha", "2"), ("mid", "3")]);
    store.write_state(&path, &data).await.unwrap();
    let (read, kind) = store.read_state(&path).await.unwrap();

    assert_eq!(kind, SourceKind::Canonical);
    let keys: Vec<&str> = read.keys().filter_map(Value::as_str).collect();
    // version is forced first; the rest keep insertion order.
    assert_eq!(keys, vec!["version", "zeta", "alpha", "mid"]);
    for (k, v) in &data {
        assert_eq!(read.get(k), Some(v));
    }
}

#[tokio::test]
async fn every_legacy_layout_reads_like_the_canonical_form() {
    let tmp = tempfile::tempdir().unwrap();
    let store = StateStore::new(tmp.path());

    let canonical_path = tmp.path().join("canonical.md");
    store
        .write_state(&canonical_path, &payload(&[("mode", "loud"), ("lang", "en")]))
        .await
        .unwrap();
    let (expected, _) = store.read_state(&canonical_path).await.unwrap();

    let fixtures = [
        (
            "frontmatter.md",
            "---\nversion: 1\nmode: loud\nlang: en\n---\n# notes\n",
            SourceKind::LegacyFrontmatter,
        ),
        (
            "bare.md",
            "Header text\n\n```yaml\nversion: 1\nmode: loud\nlang: en\n```\n",
            SourceKind::LegacyBareYaml,
        ),
        (
            "whole.md",
            "version: 1\nmode: loud\nlang: en\n",
            SourceKind::LegacyWholeYaml,
        ),
    ];
    for (name, content, expected_kind) in fixtures {
        let path = tmp.path().join(name);
        std::fs::write(&path, content).unwrap();
        let (read, kind) = store.read_state(&path).await.unwrap();
        assert_eq!(kind, expected_kind, "{name}");
        assert_eq!(read, expected, "{name}");
    }
}

#[tokio::test]
async fn unparseable_file_gets_a_byte_identical_backup_on_write() {
    let tmp = tempfile::tempdir().unwrap();
    let store = StateStore::new(tmp.path());
    let path = tmp.path().join("watchlist.md");
    let original: &[u8] = b"\x00\xff{{{ not any yaml variant";
    std::fs::write(&path, original).unwrap();

    assert!(matches!(
        store.read_state(&path).await,
        Err(StateError::Parse { .. })
    ));

    store
        .write_state(&path, &payload(&[("stocks", "none")]))
        .await
        .unwrap();

    let backup = std::fs::read_dir(tmp.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .find(|e| {
            e.file_name()
                .to_string_lossy()
                .starts_with("watchlist.md.bak-")
        })
        .expect("backup file should exist");
    assert_eq!(std::fs::read(backup.path()).unwrap(), original);

    let (read, kind) = store.read_state(&path).await.unwrap();
    assert_eq!(kind, SourceKind::Canonical);
    assert_eq!(read.get("stocks"), Some(&Value::String("none".into())));
}

#[tokio::test]
async fn corrupt_settings_recover_with_defaults_then_backup() {
    let tmp = tempfile::tempdir().unwrap();
    let store = StateStore::new(tmp.path());
    let settings_path = store.user_path("1", &["settings.md"]);
    std::fs::create_dir_all(settings_path.parent().unwrap()).unwrap();
    std::fs::write(&settings_path, b"\x01\x02 random bytes \xfe").unwrap();

    // Reads fall back to empty defaults.
    let settings = store.get_user_settings("1").await;
    assert!(!settings.auto_translate);
    assert_eq!(settings.target_lang, "zh-CN");

    // The next write repairs the file and keeps the original bytes around.
    store.set_translation_mode("1", true).await.unwrap();
    let dir = settings_path.parent().unwrap();
    let backups = std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().contains("settings.md.bak-"))
        .count();
    assert_eq!(backups, 1);
    assert!(store.get_user_settings("1").await.auto_translate);
}

#[tokio::test]
async fn id_counters_are_monotonic_across_store_instances() {
    let tmp = tempfile::tempdir().unwrap();
    let first = StateStore::new(tmp.path());
    assert_eq!(first.next_id("task").await.unwrap(), 1);
    assert_eq!(first.next_id("task").await.unwrap(), 2);
    drop(first);

    let second = StateStore::new(tmp.path());
    assert_eq!(second.next_id("task").await.unwrap(), 3);
}
