use regex::Regex;
use serde_yaml::{Mapping, Value};

pub const STATE_BEGIN_MARKER: &str = "<!-- XBOT_STATE_BEGIN -->";
pub const STATE_END_MARKER: &str = "<!-- XBOT_STATE_END -->";

/// Which layout a state payload was recovered from. Writers always emit
/// `Canonical`; the other variants exist so old files keep reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Canonical,
    LegacyFrontmatter,
    LegacyBareYaml,
    LegacyWholeYaml,
}

fn strip_yaml_fence(text: &str) -> String {
    let mut section = text.trim();
    if let Some(rest) = section.strip_prefix("```yaml") {
        section = rest.trim_start_matches(['\r', '\n']);
    }
    if let Some(rest) = section.strip_suffix("```") {
        section = rest.trim_end();
    }
    section.trim().to_string()
}

/// Pull the raw YAML text out of a state file, trying the canonical
/// marker-delimited layout first and falling back to legacy layouts.
///
/// Returns `None` when a marker is present but the block is unusable
/// (half-open markers must not fall through to the legacy readers).
pub fn extract_state_yaml_payload(raw: &str) -> Option<(String, SourceKind)> {
    let marker_start = raw.find(STATE_BEGIN_MARKER);
    let marker_end = raw.find(STATE_END_MARKER);

    if let (Some(start), Some(end)) = (marker_start, marker_end) {
        if end > start {
            let section = &raw[start + STATE_BEGIN_MARKER.len()..end];
            return Some((strip_yaml_fence(section), SourceKind::Canonical));
        }
    }
    if marker_start.is_some() || marker_end.is_some() {
        return None;
    }

    let fence =
        Regex::new(r"(?si)```yaml\s*(.*?)\s*```").expect("static fence regex must compile");
    if let Some(caps) = fence.captures(raw) {
        return Some((
            caps.get(1).map(|m| m.as_str()).unwrap_or("").to_string(),
            SourceKind::LegacyBareYaml,
        ));
    }

    let front = raw.trim();
    if front.starts_with("---") {
        let lines: Vec<&str> = front.lines().collect();
        if lines.first().map(|l| l.trim()) == Some("---") {
            for (idx, line) in lines.iter().enumerate().skip(1) {
                if line.trim() == "---" {
                    return Some((
                        lines[1..idx].join("\n").trim().to_string(),
                        SourceKind::LegacyFrontmatter,
                    ));
                }
            }
        }
    }

    Some((raw.to_string(), SourceKind::LegacyWholeYaml))
}

/// Parse a state file's contents into a YAML mapping. Returns `None` when no
/// layout variant yields a non-empty mapping.
pub fn parse_state_payload(raw: &str) -> Option<(Mapping, SourceKind)> {
    let (payload_text, kind) = extract_state_yaml_payload(raw)?;
    if payload_text.trim().is_empty() {
        return None;
    }
    match serde_yaml::from_str::<Value>(&payload_text) {
        Ok(Value::Mapping(map)) => Some((map, kind)),
        _ => None,
    }
}

/// Force `version: 1` to be the first key without disturbing the order of
/// the rest of the payload.
pub fn normalize_payload_for_write(payload: &Mapping) -> Mapping {
    let version_key = Value::String("version".to_string());
    let mut normalized = Mapping::new();
    normalized.insert(
        version_key.clone(),
        payload
            .get(&version_key)
            .cloned()
            .unwrap_or(Value::Number(1.into())),
    );
    for (key, value) in payload {
        if *key != version_key {
            normalized.insert(key.clone(), value.clone());
        }
    }
    normalized
}

/// Render the canonical marker-delimited markdown document for a payload.
pub fn render_state_markdown(payload: &Mapping, title: &str) -> String {
    let normalized = normalize_payload_for_write(payload);
    let body = serde_yaml::to_string(&Value::Mapping(normalized))
        .unwrap_or_else(|_| "version: 1\n".to_string());
    let title = title.trim();
    let title = if title.is_empty() { "Data" } else { title };
    format!(
        "# {title}\n\n\
         <!-- x-bot-state-file: edit via read/write/edit when needed -->\n\
         <!-- payload format: fenced YAML block below -->\n\n\
         {STATE_BEGIN_MARKER}\n\
         ```yaml\n\
         {}\n\
         ```\n\
         {STATE_END_MARKER}\n",
        body.trim_end(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payload() -> Mapping {
        let raw = "version: 1\nname: alpha\ncount: 3\n";
        let (map, _) = parse_state_payload(raw).unwrap();
        map
    }

    #[test]
    fn canonical_roundtrip_preserves_payload_and_key_order() {
        let payload = sample_payload();
        let rendered = render_state_markdown(&payload, "Sample");
        let (parsed, kind) = parse_state_payload(&rendered).unwrap();
        assert_eq!(kind, SourceKind::Canonical);
        assert_eq!(parsed, payload);

        let keys: Vec<String> = parsed
            .keys()
            .map(|k| k.as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(keys, vec!["version", "name", "count"]);
    }

    #[test]
    fn version_key_is_injected_first_when_missing() {
        let mut payload = Mapping::new();
        payload.insert("feeds".into(), Value::Sequence(vec![]));
        let rendered = render_state_markdown(&payload, "Subscriptions");
        let (parsed, _) = parse_state_payload(&rendered).unwrap();
        let keys: Vec<&str> = parsed.keys().filter_map(|k| k.as_str()).collect();
        assert_eq!(keys[0], "version");
        assert_eq!(parsed.get("version"), Some(&Value::Number(1.into())));
    }

    #[test]
    fn legacy_frontmatter_is_accepted() {
        let raw = "---\nversion: 1\nmode: quiet\n---\n\n# Notes\n";
        let (parsed, kind) = parse_state_payload(raw).unwrap();
        assert_eq!(kind, SourceKind::LegacyFrontmatter);
        assert_eq!(parsed.get("mode"), Some(&Value::String("quiet".into())));
    }

    #[test]
    fn legacy_bare_fenced_yaml_is_accepted() {
        let raw = "Notes above\n\n```yaml\nversion: 1\nmode: loud\n```\n";
        let (parsed, kind) = parse_state_payload(raw).unwrap();
        assert_eq!(kind, SourceKind::LegacyBareYaml);
        assert_eq!(parsed.get("mode"), Some(&Value::String("loud".into())));
    }

    #[test]
    fn legacy_whole_file_yaml_is_accepted() {
        let raw = "version: 1\nmode: raw\n";
        let (parsed, kind) = parse_state_payload(raw).unwrap();
        assert_eq!(kind, SourceKind::LegacyWholeYaml);
        assert_eq!(parsed.get("mode"), Some(&Value::String("raw".into())));
    }

    #[test]
    fn legacy_variants_agree_with_canonical() {
        let payload = sample_payload();
        let canonical = render_state_markdown(&payload, "Sample");
        let (from_canonical, _) = parse_state_payload(&canonical).unwrap();

        let frontmatter = "---\nversion: 1\nname: alpha\ncount: 3\n---\n";
        let bare = "```yaml\nversion: 1\nname: alpha\ncount: 3\n```\n";
        let whole = "version: 1\nname: alpha\ncount: 3\n";
        for raw in [frontmatter, bare, whole] {
            let (parsed, _) = parse_state_payload(raw).unwrap();
            assert_eq!(parsed, from_canonical);
        }
    }

    #[test]
    fn half_open_marker_block_is_rejected() {
        let raw = format!("{STATE_BEGIN_MARKER}\n```yaml\nversion: 1\n```\n");
        assert!(parse_state_payload(&raw).is_none());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_state_payload("\u{1}\u{2}binary junk: [").is_none());
        assert!(parse_state_payload("").is_none());
        assert!(parse_state_payload("   \n").is_none());
    }

    #[test]
    fn non_mapping_yaml_is_rejected() {
        assert!(parse_state_payload("- a\n- b\n").is_none());
        assert!(parse_state_payload("just a string").is_none());
    }
}
