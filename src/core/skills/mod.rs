mod executor;
mod schema;

pub use executor::{EmittedFile, ExtensionExecutor, ExtensionResult};
pub use schema::validate_args;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

pub const SKILL_API_VERSION: &str = "v3";
const DEFAULT_TIMEOUT_SEC: u64 = 120;
const MAX_TIMEOUT_SEC: u64 = 600;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FilesystemScope {
    #[default]
    Workspace,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum NetworkScope {
    Limited,
    #[default]
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SkillPermissions {
    #[serde(default)]
    pub filesystem: FilesystemScope,
    #[serde(default)]
    pub shell: bool,
    #[serde(default)]
    pub network: NetworkScope,
}

/// A skill as discovered from `SKILL.md` frontmatter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillDescriptor {
    pub name: String,
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub triggers: Vec<String>,
    #[serde(default = "default_input_schema")]
    pub input_schema: Value,
    #[serde(default)]
    pub permissions: SkillPermissions,
    #[serde(default = "default_entrypoint")]
    pub entrypoint: String,
    #[serde(default)]
    pub version: String,
    #[serde(default = "default_timeout")]
    pub timeout_sec: u64,

    /// Where the skill lives; injected at load time, never from frontmatter.
    #[serde(skip)]
    pub skill_dir: PathBuf,
    /// `builtin` or `learned`. Only learned skills are mutable at runtime.
    #[serde(skip)]
    pub kind: String,
}

fn default_input_schema() -> Value {
    json!({"type": "object", "properties": {}})
}

fn default_entrypoint() -> String {
    "scripts/execute.sh".to_string()
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SEC
}

impl SkillDescriptor {
    pub fn effective_timeout_sec(&self) -> u64 {
        self.timeout_sec.clamp(1, MAX_TIMEOUT_SEC)
    }

    pub fn is_builtin(&self) -> bool {
        self.kind == "builtin"
    }
}

fn parse_frontmatter(content: &str) -> Result<(SkillDescriptor, String)> {
    let trimmed = content.trim_start();
    let rest = trimmed
        .strip_prefix("---")
        .ok_or_else(|| anyhow!("SKILL.md has no YAML frontmatter"))?;
    let end = rest
        .find("\n---")
        .ok_or_else(|| anyhow!("unterminated YAML frontmatter"))?;
    let yaml = &rest[..end];
    let body = rest[end + 4..].trim().to_string();
    let descriptor: SkillDescriptor = serde_yaml::from_str(yaml)?;
    Ok((descriptor, body))
}

/// Scans `skills/{builtin,learned}/<name>/SKILL.md` into a descriptor cache
/// and rebuilds it when any SKILL.md mtime moves.
pub struct SkillLoader {
    skills_root: PathBuf,
    index: HashMap<String, SkillDescriptor>,
    last_scan_stamp: Option<SystemTime>,
}

impl SkillLoader {
    pub fn new(skills_root: impl Into<PathBuf>) -> Self {
        let mut loader = Self {
            skills_root: skills_root.into(),
            index: HashMap::new(),
            last_scan_stamp: None,
        };
        loader.scan();
        loader
    }

    pub fn skills_root(&self) -> &Path {
        &self.skills_root
    }

    fn newest_manifest_mtime(&self) -> Option<SystemTime> {
        let mut newest = None;
        for kind in ["builtin", "learned"] {
            let dir = self.skills_root.join(kind);
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let manifest = entry.path().join("SKILL.md");
                if let Ok(meta) = std::fs::metadata(&manifest) {
                    if let Ok(mtime) = meta.modified() {
                        if newest.map(|n| mtime > n).unwrap_or(true) {
                            newest = Some(mtime);
                        }
                    }
                }
            }
        }
        newest
    }

    pub fn scan(&mut self) {
        let mut index = HashMap::new();
        for kind in ["builtin", "learned"] {
            let dir = self.skills_root.join(kind);
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let skill_dir = entry.path();
                if !skill_dir.is_dir() {
                    continue;
                }
                let manifest = skill_dir.join("SKILL.md");
                let Ok(content) = std::fs::read_to_string(&manifest) else {
                    continue;
                };
                match parse_frontmatter(&content) {
                    Ok((mut descriptor, _body)) => {
                        if descriptor.api_version.is_empty() {
                            descriptor.api_version = SKILL_API_VERSION.to_string();
                        }
                        if descriptor.api_version != SKILL_API_VERSION {
                            warn!(
                                "Skipping skill `{}`: unsupported api_version {}",
                                descriptor.name, descriptor.api_version
                            );
                            continue;
                        }
                        descriptor.skill_dir = skill_dir.clone();
                        descriptor.kind = kind.to_string();
                        // Builtins win name collisions with learned skills.
                        if kind == "learned" && index.contains_key(&descriptor.name) {
                            warn!(
                                "Skipping learned skill `{}`: name collides with a builtin",
                                descriptor.name
                            );
                            continue;
                        }
                        info!("Indexed {} skill: {}", kind, descriptor.name);
                        index.insert(descriptor.name.clone(), descriptor);
                    }
                    Err(e) => warn!("Failed to parse {}: {}", manifest.display(), e),
                }
            }
        }
        self.index = index;
        self.last_scan_stamp = self.newest_manifest_mtime();
    }

    /// Rescan when any SKILL.md changed since the last scan.
    pub fn reload_if_changed(&mut self) -> bool {
        let newest = self.newest_manifest_mtime();
        if newest != self.last_scan_stamp {
            self.scan();
            return true;
        }
        false
    }

    pub fn get(&self, name: &str) -> Option<&SkillDescriptor> {
        self.index.get(name)
    }

    pub fn list(&self) -> Vec<&SkillDescriptor> {
        let mut skills: Vec<&SkillDescriptor> = self.index.values().collect();
        skills.sort_by(|a, b| a.name.cmp(&b.name));
        skills
    }

    /// One-line-per-skill catalog for the prompt composer and
    /// `list_extensions`.
    pub fn catalog(&self) -> String {
        let mut lines = Vec::new();
        for skill in self.list() {
            let mut line = format!("- `{}`: {}", skill.name, skill.description);
            if !skill.triggers.is_empty() {
                line.push_str(&format!(" (triggers: {})", skill.triggers.join(", ")));
            }
            lines.push(line);
        }
        if lines.is_empty() {
            "No skills installed.".to_string()
        } else {
            lines.join("\n")
        }
    }
}

#[cfg(test)]
pub(crate) fn write_test_skill(root: &Path, kind: &str, name: &str, script: &str) {
    let dir = root.join(kind).join(name);
    std::fs::create_dir_all(dir.join("scripts")).unwrap();
    let manifest = format!(
        "---\nname: {name}\napi_version: v3\ndescription: test skill {name}\ntriggers:\n  - {name}\ninput_schema:\n  type: object\n  properties:\n    url:\n      type: string\n  required: []\npermissions:\n  filesystem: workspace\n  shell: false\n  network: none\nentrypoint: scripts/execute.sh\n---\n\n# {name}\n"
    );
    std::fs::write(dir.join("SKILL.md"), manifest).unwrap();
    std::fs::write(dir.join("scripts/execute.sh"), script).unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_indexes_builtin_and_learned_skills() {
        let tmp = tempfile::tempdir().unwrap();
        write_test_skill(tmp.path(), "builtin", "download_video", "echo ok\n");
        write_test_skill(tmp.path(), "learned", "summarize", "echo ok\n");

        let loader = SkillLoader::new(tmp.path());
        assert_eq!(loader.list().len(), 2);
        assert!(loader.get("download_video").unwrap().is_builtin());
        assert_eq!(loader.get("summarize").unwrap().kind, "learned");
        assert!(loader.catalog().contains("download_video"));
    }

    #[test]
    fn frontmatter_defaults_apply() {
        let content = "---\nname: minimal\ndescription: tiny\n---\nbody";
        let (descriptor, body) = parse_frontmatter(content).unwrap();
        assert_eq!(descriptor.name, "minimal");
        assert_eq!(descriptor.entrypoint, "scripts/execute.sh");
        assert_eq!(descriptor.effective_timeout_sec(), 120);
        assert_eq!(body, "body");
    }

    #[test]
    fn unsupported_api_version_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("builtin").join("old");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("SKILL.md"),
            "---\nname: old\napi_version: v1\ndescription: legacy\n---\n",
        )
        .unwrap();
        let loader = SkillLoader::new(tmp.path());
        assert!(loader.get("old").is_none());
    }

    #[test]
    fn timeout_is_clamped_to_the_cap() {
        let content = "---\nname: slow\ntimeout_sec: 9000\n---\n";
        let (descriptor, _) = parse_frontmatter(content).unwrap();
        assert_eq!(descriptor.effective_timeout_sec(), 600);
    }

    #[test]
    fn reload_detects_manifest_changes() {
        let tmp = tempfile::tempdir().unwrap();
        write_test_skill(tmp.path(), "learned", "alpha", "echo a\n");
        let mut loader = SkillLoader::new(tmp.path());
        assert!(!loader.reload_if_changed());

        // Touch the manifest with new content and a newer mtime.
        let manifest = tmp.path().join("learned/alpha/SKILL.md");
        let bumped = std::fs::read_to_string(&manifest)
            .unwrap()
            .replace("test skill alpha", "updated alpha");
        std::fs::write(&manifest, bumped).unwrap();
        let newer = std::time::SystemTime::now() + std::time::Duration::from_secs(2);
        let file = std::fs::File::open(&manifest).unwrap();
        file.set_modified(newer).ok();

        assert!(loader.reload_if_changed());
        assert_eq!(loader.get("alpha").unwrap().description, "updated alpha");
    }
}
