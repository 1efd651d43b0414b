use crate::rules::{
    ConflictPolicy, ConflictScope, DeployRule, DeploymentRules, FolderType, LibDependency,
    LinkStatus, TargetSelection, TransferMode,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::{
    collections::BTreeMap,
    fs,
    path::{Component, Path, PathBuf},
};
use tracing::warn;

pub const STORE_VERSION: u32 = 1;

/// Stored configuration for one folder under the storage root, keyed by its
/// storage-relative path. `None` fields inherit from the app defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FolderConfig {
    #[serde(default, deserialize_with = "lenient_folder_type")]
    pub folder_type: FolderType,
    #[serde(default, deserialize_with = "lenient_rule")]
    pub deploy_rule: Option<DeployRule>,
    /// Legacy field, consulted only when it names something other than `folder`.
    #[serde(default, deserialize_with = "lenient_rule")]
    pub deploy_type: Option<DeployRule>,
    #[serde(default, deserialize_with = "lenient_transfer")]
    pub transfer_mode: Option<TransferMode>,
    #[serde(default, deserialize_with = "lenient_policy")]
    pub conflict_policy: Option<ConflictPolicy>,
    #[serde(default)]
    pub deployment_rules: Option<Value>,
    #[serde(default)]
    pub target_override: Option<PathBuf>,
    #[serde(default, deserialize_with = "lenient_selection")]
    pub target_selection: Option<TargetSelection>,
    #[serde(default)]
    pub conflict_tag: Option<String>,
    #[serde(default, deserialize_with = "lenient_scope")]
    pub conflict_scope: ConflictScope,
    #[serde(default)]
    pub is_library: bool,
    #[serde(default)]
    pub lib_name: Option<String>,
    #[serde(default)]
    pub lib_version: Option<String>,
    #[serde(default)]
    pub lib_priority: i64,
    #[serde(default)]
    pub lib_deps: Option<Value>,
    #[serde(default, deserialize_with = "lenient_status")]
    pub last_known_status: Option<LinkStatus>,
}

impl FolderConfig {
    pub fn rules(&self) -> DeploymentRules {
        DeploymentRules::from_value(self.deployment_rules.as_ref())
    }

    pub fn dependencies(&self) -> Vec<LibDependency> {
        LibDependency::parse_list(self.lib_deps.as_ref())
    }

    pub fn tag(&self) -> Option<&str> {
        self.conflict_tag
            .as_deref()
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
    }

    pub fn library_name(&self) -> Option<&str> {
        if !self.is_library {
            return None;
        }
        self.lib_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    folders: BTreeMap<String, FolderConfig>,
}

/// Folder configuration store. File-backed stores persist after every
/// mutation; in-memory stores never touch disk.
#[derive(Debug, Clone, Default)]
pub struct FolderStore {
    path: Option<PathBuf>,
    folders: BTreeMap<String, FolderConfig>,
}

impl FolderStore {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let raw = fs::read_to_string(path).context("read folder store")?;
            let file: StoreFile = serde_json::from_str(&raw).context("parse folder store")?;
            if file.version != STORE_VERSION {
                warn!(
                    "folder store version {} differs from {}; loading anyway",
                    file.version, STORE_VERSION
                );
            }
            return Ok(Self {
                path: Some(path.to_path_buf()),
                folders: file.folders,
            });
        }

        let store = Self {
            path: Some(path.to_path_buf()),
            folders: BTreeMap::new(),
        };
        store.save()?;
        Ok(store)
    }

    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let parent = path.parent().context("folder store parent")?;
        fs::create_dir_all(parent).context("create folder store dir")?;
        let file = StoreFile {
            version: STORE_VERSION,
            folders: self.folders.clone(),
        };
        let raw = serde_json::to_string_pretty(&file).context("serialize folder store")?;
        let temp = path.with_extension("json.tmp");
        fs::write(&temp, raw).context("write folder store temp")?;
        fs::rename(&temp, path).context("finalize folder store")?;
        Ok(())
    }

    pub fn get(&self, rel: &str) -> Option<&FolderConfig> {
        self.folders.get(&normalize_key(rel))
    }

    /// Missing entries read as an all-inherit config.
    pub fn get_or_default(&self, rel: &str) -> FolderConfig {
        self.get(rel).cloned().unwrap_or_default()
    }

    pub fn update<F>(&mut self, rel: &str, edit: F) -> Result<()>
    where
        F: FnOnce(&mut FolderConfig),
    {
        let entry = self.folders.entry(normalize_key(rel)).or_default();
        edit(entry);
        self.save()
    }

    pub fn set_status(&mut self, rel: &str, status: LinkStatus) -> Result<()> {
        self.update(rel, |config| config.last_known_status = Some(status))
    }

    /// Drops the cached status so the next read re-probes.
    pub fn invalidate_status(&mut self, rel: &str) -> Result<()> {
        let key = normalize_key(rel);
        let Some(entry) = self.folders.get_mut(&key) else {
            return Ok(());
        };
        entry.last_known_status = None;
        self.save()
    }

    pub fn delete(&mut self, rel: &str) -> Result<bool> {
        let removed = self.folders.remove(&normalize_key(rel)).is_some();
        if removed {
            self.save()?;
        }
        Ok(removed)
    }

    pub fn all(&self) -> impl Iterator<Item = (&String, &FolderConfig)> {
        self.folders.iter()
    }

    pub fn snapshot(&self) -> BTreeMap<String, FolderConfig> {
        self.folders.clone()
    }

    pub fn len(&self) -> usize {
        self.folders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.folders.is_empty()
    }
}

/// Store keys use `/` separators with no leading, trailing, or `.` segments.
pub fn normalize_key(rel: &str) -> String {
    Path::new(&rel.replace('\\', "/"))
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().to_string()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Parent key of a store key; the storage root's children share `""`.
pub fn parent_key(rel: &str) -> String {
    let key = normalize_key(rel);
    match key.rfind('/') {
        Some(index) => key[..index].to_string(),
        None => String::new(),
    }
}

fn lenient<'de, D, T>(
    deserializer: D,
    field: &str,
    parse: fn(&str) -> Option<T>,
) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    let Some(raw) = raw else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("inherit") {
        return Ok(None);
    }
    let parsed = parse(trimmed);
    if parsed.is_none() {
        warn!("unknown {field} value {raw:?}; inheriting");
    }
    Ok(parsed)
}

fn lenient_rule<'de, D: Deserializer<'de>>(d: D) -> Result<Option<DeployRule>, D::Error> {
    lenient(d, "deploy_rule", DeployRule::parse)
}

fn lenient_transfer<'de, D: Deserializer<'de>>(d: D) -> Result<Option<TransferMode>, D::Error> {
    lenient(d, "transfer_mode", TransferMode::parse)
}

fn lenient_policy<'de, D: Deserializer<'de>>(d: D) -> Result<Option<ConflictPolicy>, D::Error> {
    lenient(d, "conflict_policy", ConflictPolicy::parse)
}

fn lenient_selection<'de, D: Deserializer<'de>>(
    d: D,
) -> Result<Option<TargetSelection>, D::Error> {
    lenient(d, "target_selection", TargetSelection::parse)
}

fn lenient_status<'de, D: Deserializer<'de>>(d: D) -> Result<Option<LinkStatus>, D::Error> {
    lenient(d, "last_known_status", LinkStatus::parse)
}

fn lenient_folder_type<'de, D: Deserializer<'de>>(d: D) -> Result<FolderType, D::Error> {
    Ok(lenient(d, "folder_type", FolderType::parse)?.unwrap_or_default())
}

fn lenient_scope<'de, D: Deserializer<'de>>(d: D) -> Result<ConflictScope, D::Error> {
    Ok(lenient(d, "conflict_scope", ConflictScope::parse)?.unwrap_or_default())
}
