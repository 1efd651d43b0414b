use crate::rules::{ConflictPolicy, DeployRule, TargetKey, TransferMode};
use anyhow::{bail, Context, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

pub const DATA_DIR_ENV: &str = "LINKMASTER_DATA_DIR";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub active_app: Option<String>,
    #[serde(default)]
    pub active_target: TargetKey,
    #[serde(default)]
    pub apps: Vec<AppProfile>,
    #[serde(default = "default_true")]
    pub confirm_decisions: bool,
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl AppConfig {
    pub fn load_or_create() -> Result<Self> {
        let base_dir = base_data_dir()?;
        Self::load_or_create_in(&base_dir)
    }

    pub fn load_or_create_in(base_dir: &Path) -> Result<Self> {
        fs::create_dir_all(base_dir).context("create app data dir")?;
        let path = base_dir.join("config.json");
        if path.exists() {
            let raw = fs::read_to_string(&path).context("read app config")?;
            let mut config: AppConfig = serde_json::from_str(&raw).context("parse app config")?;
            config.base_dir = base_dir.to_path_buf();
            let active_missing = config
                .active_app
                .as_deref()
                .map(|name| config.app(name).is_none())
                .unwrap_or(true);
            if active_missing {
                config.active_app = config.apps.first().map(|app| app.name.clone());
            }
            return Ok(config);
        }

        let config = AppConfig {
            active_app: None,
            active_target: TargetKey::Primary,
            apps: Vec::new(),
            confirm_decisions: true,
            base_dir: base_dir.to_path_buf(),
        };
        config.save()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        fs::create_dir_all(&self.base_dir).context("create app data dir")?;
        let path = self.base_dir.join("config.json");
        let raw = serde_json::to_string_pretty(self).context("serialize app config")?;
        fs::write(path, raw).context("write app config")?;
        Ok(())
    }

    pub fn app(&self, name: &str) -> Option<&AppProfile> {
        self.apps
            .iter()
            .find(|app| app.name.eq_ignore_ascii_case(name))
    }

    pub fn active_app(&self) -> Option<&AppProfile> {
        self.active_app.as_deref().and_then(|name| self.app(name))
    }

    pub fn add_app(&mut self, app: AppProfile) -> Result<()> {
        if self.app(&app.name).is_some() {
            bail!("app already exists: {}", app.name);
        }
        if self.active_app.is_none() {
            self.active_app = Some(app.name.clone());
        }
        self.apps.push(app);
        self.save()
    }

    /// Per-app directory holding the folder store and deploy manifest.
    pub fn app_data_dir(&self, app: &AppProfile) -> PathBuf {
        self.base_dir.join("apps").join(app.slug())
    }

    pub fn log_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }
}

/// Deployment defaults attached to one target root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDefaults {
    #[serde(default)]
    pub deploy_rule: Option<DeployRule>,
    #[serde(default)]
    pub transfer_mode: Option<TransferMode>,
    #[serde(default)]
    pub conflict_policy: Option<ConflictPolicy>,
}

/// One managed app: a storage root of mod folders and up to three targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppProfile {
    pub name: String,
    pub storage_root: PathBuf,
    #[serde(default)]
    pub target_root_a: Option<PathBuf>,
    #[serde(default)]
    pub target_root_b: Option<PathBuf>,
    #[serde(default)]
    pub target_root_c: Option<PathBuf>,
    #[serde(default)]
    pub target_defaults_a: TargetDefaults,
    #[serde(default)]
    pub target_defaults_b: TargetDefaults,
    #[serde(default)]
    pub target_defaults_c: TargetDefaults,
    #[serde(default)]
    pub default_deploy_rule: DeployRule,
    #[serde(default)]
    pub default_transfer_mode: TransferMode,
    #[serde(default)]
    pub default_conflict_policy: ConflictPolicy,
}

impl AppProfile {
    pub fn new(name: impl Into<String>, storage_root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            storage_root: storage_root.into(),
            target_root_a: None,
            target_root_b: None,
            target_root_c: None,
            target_defaults_a: TargetDefaults::default(),
            target_defaults_b: TargetDefaults::default(),
            target_defaults_c: TargetDefaults::default(),
            default_deploy_rule: DeployRule::Folder,
            default_transfer_mode: TransferMode::Symlink,
            default_conflict_policy: ConflictPolicy::Backup,
        }
    }

    pub fn with_target(mut self, key: TargetKey, root: impl Into<PathBuf>) -> Self {
        let root = Some(root.into());
        match key {
            TargetKey::Primary => self.target_root_a = root,
            TargetKey::Secondary => self.target_root_b = root,
            TargetKey::Tertiary => self.target_root_c = root,
        }
        self
    }

    pub fn target_root(&self, key: TargetKey) -> Option<&Path> {
        let root = match key {
            TargetKey::Primary => &self.target_root_a,
            TargetKey::Secondary => &self.target_root_b,
            TargetKey::Tertiary => &self.target_root_c,
        };
        root.as_deref().filter(|path| !path.as_os_str().is_empty())
    }

    pub fn target_defaults(&self, key: TargetKey) -> &TargetDefaults {
        match key {
            TargetKey::Primary => &self.target_defaults_a,
            TargetKey::Secondary => &self.target_defaults_b,
            TargetKey::Tertiary => &self.target_defaults_c,
        }
    }

    pub fn target_defaults_mut(&mut self, key: TargetKey) -> &mut TargetDefaults {
        match key {
            TargetKey::Primary => &mut self.target_defaults_a,
            TargetKey::Secondary => &mut self.target_defaults_b,
            TargetKey::Tertiary => &mut self.target_defaults_c,
        }
    }

    /// Every configured target root, in A/B/C order.
    pub fn target_roots(&self) -> Vec<PathBuf> {
        TargetKey::ALL
            .iter()
            .filter_map(|key| self.target_root(*key).map(Path::to_path_buf))
            .collect()
    }

    pub fn source_path(&self, rel: &str) -> PathBuf {
        let key = crate::store::normalize_key(rel);
        if key.is_empty() {
            return self.storage_root.clone();
        }
        self.storage_root.join(key)
    }

    pub fn slug(&self) -> String {
        let mut out = String::new();
        for ch in self.name.chars() {
            if ch.is_ascii_alphanumeric() {
                out.push(ch.to_ascii_lowercase());
            } else if !out.ends_with('-') {
                out.push('-');
            }
        }
        let trimmed = out.trim_matches('-');
        if trimmed.is_empty() {
            "app".to_string()
        } else {
            trimmed.to_string()
        }
    }
}

fn default_true() -> bool {
    true
}

fn base_data_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        if !dir.trim().is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }
    let base = BaseDirs::new().context("resolve home dir")?;
    Ok(base.data_local_dir().join("linkmaster"))
}
