use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::{
    collections::BTreeMap,
    path::{Component, Path, PathBuf},
};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FolderType {
    Category,
    Package,
    #[default]
    Auto,
}

impl FolderType {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "category" => Some(FolderType::Category),
            "package" => Some(FolderType::Package),
            "auto" => Some(FolderType::Auto),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            FolderType::Category => "category",
            FolderType::Package => "package",
            FolderType::Auto => "auto",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeployRule {
    #[default]
    Folder,
    #[serde(alias = "flatten")]
    Files,
    Tree,
    Custom,
}

impl DeployRule {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "folder" => Some(DeployRule::Folder),
            "files" | "flatten" => Some(DeployRule::Files),
            "tree" => Some(DeployRule::Tree),
            "custom" => Some(DeployRule::Custom),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            DeployRule::Folder => "folder",
            DeployRule::Files => "files",
            DeployRule::Tree => "tree",
            DeployRule::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransferMode {
    #[default]
    Symlink,
    Copy,
}

impl TransferMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "symlink" | "link" => Some(TransferMode::Symlink),
            "copy" => Some(TransferMode::Copy),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            TransferMode::Symlink => "symlink",
            TransferMode::Copy => "copy",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    #[default]
    Backup,
    Overwrite,
    Skip,
}

impl ConflictPolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "backup" => Some(ConflictPolicy::Backup),
            "overwrite" => Some(ConflictPolicy::Overwrite),
            "skip" => Some(ConflictPolicy::Skip),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ConflictPolicy::Backup => "backup",
            ConflictPolicy::Overwrite => "overwrite",
            ConflictPolicy::Skip => "skip",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictScope {
    #[default]
    Disabled,
    Category,
    Global,
}

impl ConflictScope {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "disabled" | "none" | "" => Some(ConflictScope::Disabled),
            "category" => Some(ConflictScope::Category),
            "global" => Some(ConflictScope::Global),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ConflictScope::Disabled => "disabled",
            ConflictScope::Category => "category",
            ConflictScope::Global => "global",
        }
    }
}

/// One of the app's three target roots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TargetKey {
    #[default]
    Primary,
    Secondary,
    Tertiary,
}

impl TargetKey {
    pub const ALL: [TargetKey; 3] = [TargetKey::Primary, TargetKey::Secondary, TargetKey::Tertiary];

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "primary" | "a" => Some(TargetKey::Primary),
            "secondary" | "b" => Some(TargetKey::Secondary),
            "tertiary" | "c" => Some(TargetKey::Tertiary),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            TargetKey::Primary => "primary",
            TargetKey::Secondary => "secondary",
            TargetKey::Tertiary => "tertiary",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetSelection {
    Primary,
    Secondary,
    Tertiary,
    Custom,
}

impl TargetSelection {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "primary" | "a" => Some(TargetSelection::Primary),
            "secondary" | "b" => Some(TargetSelection::Secondary),
            "tertiary" | "c" => Some(TargetSelection::Tertiary),
            "custom" => Some(TargetSelection::Custom),
            _ => None,
        }
    }

    pub fn target_key(self) -> Option<TargetKey> {
        match self {
            TargetSelection::Primary => Some(TargetKey::Primary),
            TargetSelection::Secondary => Some(TargetKey::Secondary),
            TargetSelection::Tertiary => Some(TargetKey::Tertiary),
            TargetSelection::Custom => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            TargetSelection::Primary => "primary",
            TargetSelection::Secondary => "secondary",
            TargetSelection::Tertiary => "tertiary",
            TargetSelection::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    #[default]
    #[serde(alias = "unlinked")]
    None,
    Linked,
    Partial,
    Conflict,
    Misplaced,
}

impl LinkStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" | "unlinked" | "" => Some(LinkStatus::None),
            "linked" => Some(LinkStatus::Linked),
            "partial" => Some(LinkStatus::Partial),
            "conflict" => Some(LinkStatus::Conflict),
            "misplaced" => Some(LinkStatus::Misplaced),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            LinkStatus::None => "none",
            LinkStatus::Linked => "linked",
            LinkStatus::Partial => "partial",
            LinkStatus::Conflict => "conflict",
            LinkStatus::Misplaced => "misplaced",
        }
    }

    /// Linked or partial: something of ours is live at the target.
    pub fn is_active(self) -> bool {
        matches!(self, LinkStatus::Linked | LinkStatus::Partial)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VersionMode {
    Latest,
    #[default]
    Priority,
    Specific,
}

impl VersionMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "latest" => Some(VersionMode::Latest),
            "priority" | "" => Some(VersionMode::Priority),
            "specific" => Some(VersionMode::Specific),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibDependency {
    pub name: String,
    #[serde(default, deserialize_with = "lenient_version_mode")]
    pub version_mode: VersionMode,
    #[serde(default)]
    pub version: Option<String>,
}

impl LibDependency {
    /// Parses a stored `lib_deps` value. Accepts a JSON array, a JSON string
    /// holding an array, or bare dependency names. Malformed input is logged
    /// and treated as "no dependencies".
    pub fn parse_list(value: Option<&Value>) -> Vec<LibDependency> {
        let value = match value {
            None | Some(Value::Null) => return Vec::new(),
            Some(Value::String(raw)) if raw.trim().is_empty() => return Vec::new(),
            Some(Value::String(raw)) => match serde_json::from_str::<Value>(raw) {
                Ok(inner) => inner,
                Err(err) => {
                    warn!("malformed lib_deps ignored: {err}");
                    return Vec::new();
                }
            },
            Some(other) => other.clone(),
        };
        let Value::Array(items) = value else {
            warn!("lib_deps is not a list; ignoring");
            return Vec::new();
        };

        let mut out = Vec::new();
        for item in items {
            match item {
                Value::String(name) if !name.trim().is_empty() => out.push(LibDependency {
                    name: name.trim().to_string(),
                    version_mode: VersionMode::Priority,
                    version: None,
                }),
                Value::Object(_) => match serde_json::from_value::<LibDependency>(item) {
                    Ok(dep) if !dep.name.trim().is_empty() => out.push(dep),
                    Ok(_) => warn!("lib_deps entry without a name ignored"),
                    Err(err) => warn!("malformed lib_deps entry ignored: {err}"),
                },
                other => warn!("unexpected lib_deps entry ignored: {other}"),
            }
        }
        out
    }
}

fn lenient_version_mode<'de, D>(deserializer: D) -> Result<VersionMode, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw
        .as_deref()
        .and_then(VersionMode::parse)
        .unwrap_or_default())
}

/// Per-folder `deployment_rules` payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRules {
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub rename: BTreeMap<String, String>,
    #[serde(default)]
    pub overrides: BTreeMap<String, PathBuf>,
    #[serde(default)]
    pub skip_levels: usize,
}

/// Where a single source file lands under a mirror deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    Excluded,
    Relative(PathBuf),
    Absolute(PathBuf),
}

impl DeploymentRules {
    /// Malformed rules are logged and treated as empty.
    pub fn from_value(value: Option<&Value>) -> Self {
        match value {
            None | Some(Value::Null) => DeploymentRules::default(),
            Some(Value::String(raw)) if raw.trim().is_empty() => DeploymentRules::default(),
            Some(Value::String(raw)) => match serde_json::from_str(raw) {
                Ok(rules) => rules,
                Err(err) => {
                    warn!("malformed deployment_rules ignored: {err}");
                    DeploymentRules::default()
                }
            },
            Some(other) => match serde_json::from_value(other.clone()) {
                Ok(rules) => rules,
                Err(err) => {
                    warn!("malformed deployment_rules ignored: {err}");
                    DeploymentRules::default()
                }
            },
        }
    }

    /// Any exclude/rename/override entry means the deployment deliberately
    /// omits or moves content.
    pub fn has_filters(&self) -> bool {
        !self.exclude.is_empty() || !self.rename.is_empty() || !self.overrides.is_empty()
    }

    pub fn compile(&self) -> CompiledRules<'_> {
        let mut patterns = Vec::new();
        for pattern in &self.exclude {
            let trimmed = pattern.trim().trim_matches('/');
            if trimmed.is_empty() {
                continue;
            }
            match Regex::new(&glob_to_regex(trimmed)) {
                Ok(regex) => patterns.push(regex),
                Err(err) => warn!("exclude pattern {pattern:?} ignored: {err}"),
            }
        }
        CompiledRules {
            rules: self,
            patterns,
        }
    }
}

pub struct CompiledRules<'a> {
    rules: &'a DeploymentRules,
    patterns: Vec<Regex>,
}

impl CompiledRules<'_> {
    pub fn is_excluded(&self, rel: &Path) -> bool {
        if self.patterns.is_empty() {
            return false;
        }
        let parts = path_parts(rel);
        let mut prefix = String::new();
        for part in &parts {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(part);
            if self
                .patterns
                .iter()
                .any(|regex| regex.is_match(&prefix) || regex.is_match(part))
            {
                return true;
            }
        }
        false
    }

    pub fn placement(&self, rel: &Path) -> Placement {
        if self.is_excluded(rel) {
            return Placement::Excluded;
        }
        let key = path_parts(rel).join("/");
        if let Some(dest) = self.rules.overrides.get(&key) {
            if dest.is_absolute() {
                return Placement::Absolute(dest.clone());
            }
            return Placement::Relative(dest.clone());
        }

        let mut best: Option<(&String, &String)> = None;
        for (from, to) in &self.rules.rename {
            let from_trim = from.trim_matches('/');
            if from_trim.is_empty() {
                continue;
            }
            let matches = key == from_trim || key.starts_with(&format!("{from_trim}/"));
            if matches && best.map_or(true, |(prev, _)| prev.len() < from.len()) {
                best = Some((from, to));
            }
        }
        match best {
            Some((from, to)) => {
                let rest = key[from.trim_matches('/').len()..].trim_start_matches('/');
                let mut dest = PathBuf::from(to.trim_matches('/'));
                if !rest.is_empty() {
                    dest.push(rest);
                }
                Placement::Relative(dest)
            }
            None => Placement::Relative(rel.to_path_buf()),
        }
    }
}

fn path_parts(path: &Path) -> Vec<String> {
    path.components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().to_string()),
            _ => None,
        })
        .collect()
}

fn glob_to_regex(pattern: &str) -> String {
    let mut out = String::from("(?i)^");
    let mut chars = pattern.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    out.push_str(".*");
                } else {
                    out.push_str("[^/]*");
                }
            }
            '?' => out.push_str("[^/]"),
            '\\' => out.push('/'),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flatten_is_files() {
        assert_eq!(DeployRule::parse("flatten"), Some(DeployRule::Files));
        let parsed: DeployRule = serde_json::from_value(json!("flatten")).unwrap();
        assert_eq!(parsed, DeployRule::Files);
    }

    #[test]
    fn malformed_rules_fall_back_to_empty() {
        let rules = DeploymentRules::from_value(Some(&json!("{not json")));
        assert_eq!(rules, DeploymentRules::default());
        let rules = DeploymentRules::from_value(Some(&json!({"exclude": 5})));
        assert_eq!(rules, DeploymentRules::default());
    }

    #[test]
    fn rules_accept_string_payload() {
        let rules = DeploymentRules::from_value(Some(&json!(
            r#"{"exclude": ["*.txt"], "skip_levels": 2}"#
        )));
        assert_eq!(rules.exclude, vec!["*.txt".to_string()]);
        assert_eq!(rules.skip_levels, 2);
        assert!(rules.has_filters());
    }

    #[test]
    fn exclude_matches_names_and_directories() {
        let rules = DeploymentRules {
            exclude: vec!["*.txt".into(), "docs".into(), "textures/**/raw_?.png".into()],
            ..Default::default()
        };
        let compiled = rules.compile();
        assert!(compiled.is_excluded(Path::new("readme.TXT")));
        assert!(compiled.is_excluded(Path::new("sub/notes.txt")));
        assert!(compiled.is_excluded(Path::new("docs/guide.md")));
        assert!(compiled.is_excluded(Path::new("textures/a/b/raw_1.png")));
        assert!(!compiled.is_excluded(Path::new("textures/a/raw_10.png")));
        assert!(!compiled.is_excluded(Path::new("data/main.pak")));
    }

    #[test]
    fn rename_prefers_longest_prefix() {
        let mut rename = BTreeMap::new();
        rename.insert("Data".to_string(), "data".to_string());
        rename.insert("Data/Textures".to_string(), "tex".to_string());
        let mut overrides = BTreeMap::new();
        overrides.insert("bin/tool.dll".to_string(), PathBuf::from("/opt/game/bin/tool.dll"));
        let rules = DeploymentRules {
            rename,
            overrides,
            ..Default::default()
        };
        let compiled = rules.compile();
        assert_eq!(
            compiled.placement(Path::new("Data/Textures/a.dds")),
            Placement::Relative(PathBuf::from("tex/a.dds"))
        );
        assert_eq!(
            compiled.placement(Path::new("Data/Meshes/b.nif")),
            Placement::Relative(PathBuf::from("data/Meshes/b.nif"))
        );
        assert_eq!(
            compiled.placement(Path::new("DataExtra/c.txt")),
            Placement::Relative(PathBuf::from("DataExtra/c.txt"))
        );
        assert_eq!(
            compiled.placement(Path::new("bin/tool.dll")),
            Placement::Absolute(PathBuf::from("/opt/game/bin/tool.dll"))
        );
    }

    #[test]
    fn lib_deps_parse_mixed_entries() {
        let deps = LibDependency::parse_list(Some(&json!([
            "CoreLib",
            {"name": "UiLib", "version_mode": "specific", "version": "1.2"},
            {"name": "Other", "version_mode": "bogus"},
            42
        ])));
        assert_eq!(deps.len(), 3);
        assert_eq!(deps[0].name, "CoreLib");
        assert_eq!(deps[0].version_mode, VersionMode::Priority);
        assert_eq!(deps[1].version_mode, VersionMode::Specific);
        assert_eq!(deps[1].version.as_deref(), Some("1.2"));
        assert_eq!(deps[2].version_mode, VersionMode::Priority);
        assert!(LibDependency::parse_list(Some(&json!("oops"))).is_empty());
    }
}
