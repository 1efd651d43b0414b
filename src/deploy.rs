use crate::{
    backup,
    config::{AppConfig, AppProfile},
    error::{DeployError, DeployResult, IoContext},
    library::{linked_dependents, linked_versions, resolve_dependencies},
    plan::{artifact_shape, plan_mirror, points_into, same_content, ArtifactShape, PlannedFile},
    resolver::{
        candidate_paths, resolve_settings, resolve_target_path, target_base, ResolvedSettings,
    },
    rules::{ConflictPolicy, ConflictScope, LinkStatus, TargetKey, TransferMode},
    status::{get_link_status, LinkState},
    store::{normalize_key, parent_key, FolderConfig, FolderStore},
};
use anyhow::Context;
use filetime::FileTime;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    fs, io,
    path::{Path, PathBuf},
};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

pub const MANIFEST_VERSION: u32 = 1;

/// A choice the engine will not make on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Deploying `rel` replaces other live versions of the same library.
    VersionSwitch {
        rel: String,
        lib_name: String,
        linked: Vec<String>,
    },
    /// Deploying `rel` requires unlinking packages sharing its conflict tag.
    TagSwap {
        rel: String,
        tag: String,
        scope: ConflictScope,
        linked: Vec<String>,
    },
    /// Unlinking library `rel` leaves these live packages without it.
    CascadeUnlink {
        rel: String,
        lib_name: String,
        dependents: Vec<String>,
    },
}

impl Decision {
    pub fn prompt(&self) -> String {
        match self {
            Decision::VersionSwitch {
                rel,
                lib_name,
                linked,
            } => format!(
                "Library {lib_name} is already linked from {}. Switch to {rel}?",
                linked.join(", ")
            ),
            Decision::TagSwap {
                rel,
                tag,
                scope,
                linked,
            } => format!(
                "{} already holds conflict tag '{tag}' ({} scope). Unlink it and deploy {rel}?",
                linked.join(", "),
                scope.label()
            ),
            Decision::CascadeUnlink {
                lib_name,
                dependents,
                ..
            } => format!(
                "{} depend on library {lib_name}. Unlink them too?",
                dependents.join(", ")
            ),
        }
    }

    /// Folders this decision would unlink if accepted.
    pub fn affected(&self) -> &[String] {
        match self {
            Decision::VersionSwitch { linked, .. } | Decision::TagSwap { linked, .. } => linked,
            Decision::CascadeUnlink { dependents, .. } => dependents,
        }
    }
}

pub trait Confirm {
    fn confirm(&mut self, decision: &Decision) -> bool;
}

impl<F> Confirm for F
where
    F: FnMut(&Decision) -> bool,
{
    fn confirm(&mut self, decision: &Decision) -> bool {
        self(decision)
    }
}

/// Answers every decision the same way.
#[derive(Debug, Clone, Copy)]
pub struct AutoAnswer(pub bool);

impl Confirm for AutoAnswer {
    fn confirm(&mut self, _decision: &Decision) -> bool {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployOutcome {
    Deployed {
        target: PathBuf,
        state: LinkState,
        dependencies: Vec<String>,
        backups: Vec<PathBuf>,
    },
    Declined(Decision),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnlinkOutcome {
    pub removed: usize,
    pub cascaded: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Symlink,
    Copy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployedArtifact {
    pub path: PathBuf,
    pub source: PathBuf,
    pub kind: ArtifactKind,
}

/// Every artifact the engine created, keyed by folder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployManifest {
    version: u32,
    #[serde(default)]
    entries: BTreeMap<String, Vec<DeployedArtifact>>,
    #[serde(skip)]
    path: Option<PathBuf>,
}

impl Default for DeployManifest {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION,
            entries: BTreeMap::new(),
            path: None,
        }
    }
}

impl DeployManifest {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self {
                path: Some(path.to_path_buf()),
                ..Self::default()
            });
        }
        let raw = fs::read_to_string(path).context("read manifest")?;
        let mut manifest: DeployManifest = serde_json::from_str(&raw).context("parse manifest")?;
        manifest.path = Some(path.to_path_buf());
        Ok(manifest)
    }

    pub fn save(&self) -> DeployResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).at("create manifest dir", parent)?;
        }
        let raw = serde_json::to_string_pretty(self)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
            .at("serialize manifest", path)?;
        let temp = path.with_extension("json.tmp");
        fs::write(&temp, raw).at("write manifest", &temp)?;
        fs::rename(&temp, path).at("finalize manifest", path)?;
        Ok(())
    }

    pub fn artifacts(&self, key: &str) -> &[DeployedArtifact] {
        self.entries.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    fn take(&mut self, key: &str) -> Vec<DeployedArtifact> {
        self.entries.remove(key).unwrap_or_default()
    }

    fn record(&mut self, key: &str, artifacts: Vec<DeployedArtifact>) {
        if artifacts.is_empty() {
            self.entries.remove(key);
        } else {
            self.entries.insert(key.to_string(), artifacts);
        }
    }
}

/// Creates and removes a throwaway file and symlink inside `dir`.
pub fn probe_symlink_support(dir: &Path) -> bool {
    let stamp = std::process::id();
    let file = dir.join(format!(".linkmaster_probe_{stamp}"));
    let link = dir.join(format!(".linkmaster_probe_{stamp}.lnk"));
    if fs::write(&file, b"probe").is_err() {
        return false;
    }
    // A crashed run with a recycled pid can leave the link behind.
    if fs::symlink_metadata(&link).is_ok() && fs::remove_file(&link).is_err() {
        let _ = fs::remove_file(&file);
        return false;
    }
    let supported = create_symlink(&file, &link, false).is_ok();
    let _ = fs::remove_file(&link);
    let _ = fs::remove_file(&file);
    supported
}

/// Symlink capability per target root, probed once.
#[derive(Debug, Default)]
struct LinkModeCache {
    symlink_ok: HashMap<PathBuf, bool>,
    used: HashSet<TransferMode>,
}

impl LinkModeCache {
    fn mode_for(&mut self, root: &Path, requested: TransferMode) -> TransferMode {
        let mode = match requested {
            TransferMode::Copy => TransferMode::Copy,
            TransferMode::Symlink => {
                let supported = *self
                    .symlink_ok
                    .entry(root.to_path_buf())
                    .or_insert_with(|| probe_symlink_support(root));
                if supported {
                    TransferMode::Symlink
                } else {
                    warn!("symlinks unavailable in {:?}; copying instead", root);
                    TransferMode::Copy
                }
            }
        };
        self.used.insert(mode);
        mode
    }

    fn known(&self, root: &Path, requested: TransferMode) -> TransferMode {
        match (requested, self.symlink_ok.get(root)) {
            (TransferMode::Symlink, Some(false)) => TransferMode::Copy,
            _ => requested,
        }
    }

    fn summary(&self) -> &'static str {
        match (
            self.used.contains(&TransferMode::Symlink),
            self.used.contains(&TransferMode::Copy),
        ) {
            (false, false) => "none",
            (true, false) => "symlink",
            (false, true) => "copy",
            (true, true) => "mixed",
        }
    }
}

#[cfg(unix)]
fn create_symlink(source: &Path, dest: &Path, _is_dir: bool) -> io::Result<()> {
    std::os::unix::fs::symlink(source, dest)
}

#[cfg(windows)]
fn create_symlink(source: &Path, dest: &Path, is_dir: bool) -> io::Result<()> {
    if is_dir {
        std::os::windows::fs::symlink_dir(source, dest)
    } else {
        std::os::windows::fs::symlink_file(source, dest)
    }
}

#[cfg(not(any(unix, windows)))]
fn create_symlink(_source: &Path, _dest: &Path, _is_dir: bool) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "symlink unavailable on this platform",
    ))
}

/// Removes a file, symlink (file or directory), or directory tree.
fn remove_entry(path: &Path) -> DeployResult<()> {
    let meta = fs::symlink_metadata(path).at("stat", path)?;
    if meta.file_type().is_symlink() {
        fs::remove_file(path)
            .or_else(|_| fs::remove_dir(path))
            .at("remove link", path)
    } else if meta.is_dir() {
        fs::remove_dir_all(path).at("remove directory", path)
    } else {
        fs::remove_file(path).at("remove file", path)
    }
}

fn copy_preserving_mtime(source: &Path, dest: &Path) -> DeployResult<()> {
    fs::copy(source, dest).at("copy", dest)?;
    let meta = fs::metadata(source).at("stat", source)?;
    filetime::set_file_mtime(dest, FileTime::from_last_modification_time(&meta))
        .at("set mtime", dest)?;
    Ok(())
}

/// Deployment, unlink and status engine for one app and active target.
pub struct LinkEngine {
    app: AppProfile,
    active: TargetKey,
    store: FolderStore,
    manifest: DeployManifest,
    link_modes: LinkModeCache,
}

impl LinkEngine {
    /// Engine over an in-memory manifest; the store keeps its own backing.
    pub fn new(app: AppProfile, active: TargetKey, store: FolderStore) -> Self {
        Self {
            app,
            active,
            store,
            manifest: DeployManifest::default(),
            link_modes: LinkModeCache::default(),
        }
    }

    /// Engine backed by the app's `folders.json` and `deploy_manifest.json`.
    pub fn open(config: &AppConfig, app: AppProfile, active: TargetKey) -> anyhow::Result<Self> {
        let data_dir = config.app_data_dir(&app);
        let store = FolderStore::load_or_create(&data_dir.join("folders.json"))?;
        let manifest = DeployManifest::load(&data_dir.join("deploy_manifest.json"))?;
        Ok(Self {
            app,
            active,
            store,
            manifest,
            link_modes: LinkModeCache::default(),
        })
    }

    pub fn app(&self) -> &AppProfile {
        &self.app
    }

    pub fn active_target(&self) -> TargetKey {
        self.active
    }

    pub fn set_active_target(&mut self, active: TargetKey) {
        self.active = active;
    }

    pub fn store(&self) -> &FolderStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut FolderStore {
        &mut self.store
    }

    pub fn manifest(&self) -> &DeployManifest {
        &self.manifest
    }

    pub fn link_mode_summary(&self) -> &'static str {
        self.link_modes.summary()
    }

    pub fn settings(&self, rel: &str) -> ResolvedSettings {
        resolve_settings(&self.store.get_or_default(rel), &self.app, self.active)
    }

    pub fn target_path(&self, rel: &str) -> Option<PathBuf> {
        let key = normalize_key(rel);
        let config = self.store.get_or_default(&key);
        let settings = resolve_settings(&config, &self.app, self.active);
        resolve_target_path(
            &self.app,
            self.active,
            &key,
            &config,
            settings.deploy_rule,
            &config.rules(),
        )
    }

    /// Probes the filesystem for `rel`. Reports `misplaced` when nothing sits
    /// at the resolved target but an artifact of this source lives elsewhere.
    pub fn check_status(&self, rel: &str) -> LinkState {
        let key = normalize_key(rel);
        let config = self.store.get_or_default(&key);
        let settings = resolve_settings(&config, &self.app, self.active);
        let rules = config.rules();
        let source = self.app.source_path(&key);
        let Some(target) = resolve_target_path(
            &self.app,
            self.active,
            &key,
            &config,
            settings.deploy_rule,
            &rules,
        ) else {
            return LinkState::NONE;
        };
        let mode = self
            .root_for(&config, &target)
            .map(|root| self.link_modes.known(&root, settings.transfer_mode))
            .unwrap_or(settings.transfer_mode);

        let state = get_link_status(&target, &source, mode, settings.deploy_rule, &rules);
        if state.status == LinkStatus::None && self.has_stray_artifacts(&key, &config, &target) {
            return LinkState {
                status: LinkStatus::Misplaced,
                kind: state.kind,
            };
        }
        state
    }

    /// Cached status when present, otherwise a probe written through.
    pub fn cached_status(&mut self, rel: &str) -> LinkStatus {
        let key = normalize_key(rel);
        if let Some(status) = self
            .store
            .get(&key)
            .and_then(|config| config.last_known_status)
        {
            return status;
        }
        self.refresh_status(&key)
    }

    pub fn refresh_status(&mut self, rel: &str) -> LinkStatus {
        let key = normalize_key(rel);
        let status = self.check_status(&key).status;
        self.write_status(&key, status);
        status
    }

    /// Decisions a deploy of `rel` would raise, without side effects.
    pub fn precheck_deploy(&self, rel: &str) -> Vec<Decision> {
        let key = normalize_key(rel);
        let config = self.store.get_or_default(&key);
        let mut decisions = Vec::new();

        if let Some(lib_name) = config.library_name() {
            let linked = linked_versions(&self.store, &key, lib_name);
            if !linked.is_empty() {
                decisions.push(Decision::VersionSwitch {
                    rel: key.clone(),
                    lib_name: lib_name.to_string(),
                    linked,
                });
            }
        }

        if let Some(tag) = config.tag() {
            if config.conflict_scope != ConflictScope::Disabled {
                let parent = parent_key(&key);
                let linked: Vec<String> = self
                    .store
                    .all()
                    .filter(|(other, _)| **other != key)
                    .filter(|(_, other)| {
                        other
                            .tag()
                            .map(|other_tag| other_tag == tag)
                            .unwrap_or(false)
                    })
                    .filter(|(other, _)| {
                        config.conflict_scope == ConflictScope::Global || parent_key(other) == parent
                    })
                    .filter(|(_, other)| {
                        other
                            .last_known_status
                            .map(|status| status.is_active())
                            .unwrap_or(false)
                    })
                    .map(|(other, _)| other.clone())
                    .collect();
                if !linked.is_empty() {
                    decisions.push(Decision::TagSwap {
                        rel: key.clone(),
                        tag: tag.to_string(),
                        scope: config.conflict_scope,
                        linked,
                    });
                }
            }
        }

        decisions
    }

    /// Deploys `rel` after its library dependencies. Errors are logged.
    pub fn deploy(&mut self, rel: &str, confirm: &mut dyn Confirm) -> bool {
        match self.try_deploy(rel, confirm) {
            Ok(DeployOutcome::Deployed { .. }) => true,
            Ok(DeployOutcome::Declined(decision)) => {
                info!("deploy of {rel} declined: {}", decision.prompt());
                false
            }
            Err(err) => {
                if err.is_permission_denied() {
                    error!("permission denied while deploying {rel}: {err}");
                } else {
                    error!("deploy of {rel} failed: {err}");
                }
                false
            }
        }
    }

    pub fn try_deploy(
        &mut self,
        rel: &str,
        confirm: &mut dyn Confirm,
    ) -> DeployResult<DeployOutcome> {
        let key = normalize_key(rel);
        let source = self.app.source_path(&key);
        if !source.is_dir() {
            return Err(DeployError::MissingSource(source));
        }

        if let Some(decision) = self.resolve_decisions(&key, confirm)? {
            return Ok(DeployOutcome::Declined(decision));
        }

        let plan = resolve_dependencies(&self.store, &key);
        let mut dependencies = Vec::new();
        for dep in &plan.order {
            if self.cached_status(dep).is_active() {
                debug!("dependency {dep} already linked");
                continue;
            }
            match self.deploy_single(dep, confirm) {
                Ok(DeployOutcome::Deployed { .. }) => dependencies.push(dep.clone()),
                Ok(DeployOutcome::Declined(decision)) => {
                    warn!("dependency {dep} not deployed: {}", decision.prompt());
                }
                Err(err) => warn!("dependency {dep} failed: {err}"),
            }
        }

        match self.place(&key)? {
            DeployOutcome::Deployed {
                target,
                state,
                backups,
                ..
            } => Ok(DeployOutcome::Deployed {
                target,
                state,
                dependencies,
                backups,
            }),
            declined => Ok(declined),
        }
    }

    fn deploy_single(
        &mut self,
        key: &str,
        confirm: &mut dyn Confirm,
    ) -> DeployResult<DeployOutcome> {
        let source = self.app.source_path(key);
        if !source.is_dir() {
            return Err(DeployError::MissingSource(source));
        }
        if let Some(decision) = self.resolve_decisions(key, confirm)? {
            return Ok(DeployOutcome::Declined(decision));
        }
        self.place(key)
    }

    /// Asks about every precheck decision; returns the first one declined.
    /// Accepted decisions unlink the folders they name.
    fn resolve_decisions(
        &mut self,
        key: &str,
        confirm: &mut dyn Confirm,
    ) -> DeployResult<Option<Decision>> {
        for decision in self.precheck_deploy(key) {
            if !confirm.confirm(&decision) {
                return Ok(Some(decision));
            }
            for other in decision.affected() {
                info!("unlinking {other} to make room for {key}");
                self.remove_deployment(other)?;
            }
        }
        Ok(None)
    }

    fn root_for(&self, config: &FolderConfig, target: &Path) -> Option<PathBuf> {
        match target_base(config, &self.app, self.active) {
            Some(base) if target.starts_with(&base) => Some(base),
            _ => target.parent().map(Path::to_path_buf),
        }
    }

    fn place(&mut self, key: &str) -> DeployResult<DeployOutcome> {
        let config = self.store.get_or_default(key);
        let settings = resolve_settings(&config, &self.app, self.active);
        let rules = config.rules();
        let source = self.app.source_path(key);

        let target = resolve_target_path(
            &self.app,
            self.active,
            key,
            &config,
            settings.deploy_rule,
            &rules,
        )
        .ok_or_else(|| {
            DeployError::MissingTargetRoot(
                self.app
                    .target_root(self.active)
                    .map(Path::to_path_buf)
                    .unwrap_or_default(),
            )
        })?;
        let root = self
            .root_for(&config, &target)
            .ok_or_else(|| DeployError::MissingTargetRoot(target.clone()))?;
        if !root.is_dir() {
            return Err(DeployError::MissingTargetRoot(root));
        }

        let mode = self.link_modes.mode_for(&root, settings.transfer_mode);
        if mode != settings.transfer_mode {
            self.persist_mode(key, mode);
        }
        let shape = artifact_shape(settings.deploy_rule, mode, &rules);
        let plans = match shape {
            ArtifactShape::SingleLink => Vec::new(),
            ArtifactShape::Mirror => {
                let plans = match plan_mirror(&source, &target, &rules) {
                    Ok(plans) => plans,
                    Err(err) => {
                        self.invalidate(key);
                        return Err(err);
                    }
                };
                if plans.is_empty() {
                    warn!("{key} has no files left to deploy after filtering");
                    self.invalidate(key);
                    return Err(DeployError::NothingToDeploy(source));
                }
                plans
            }
        };

        let removed = self.sweep(key, &config, &source)?;
        if removed > 0 {
            debug!("swept {removed} stale artifact(s) of {key}");
        }

        let result = match shape {
            ArtifactShape::SingleLink => {
                self.place_single_link(&source, &target, settings.conflict_policy)
            }
            ArtifactShape::Mirror => {
                self.place_mirror(&target, &plans, mode, settings.conflict_policy)
            }
        };

        let (artifacts, backups) = match result {
            Ok(placed) => placed,
            Err(err) => {
                self.invalidate(key);
                return Err(err);
            }
        };
        info!(
            "deployed {key} -> {:?} ({} artifact(s), {})",
            target,
            artifacts.len(),
            mode.label()
        );
        self.manifest.record(key, artifacts);
        self.manifest.save()?;
        self.write_status(key, LinkStatus::Linked);

        let state = get_link_status(&target, &source, mode, settings.deploy_rule, &rules);
        Ok(DeployOutcome::Deployed {
            target,
            state,
            dependencies: Vec::new(),
            backups,
        })
    }

    /// Clears `dest` according to `policy`. Returns the backup location, if any.
    fn clear_blocker(&self, dest: &Path, policy: ConflictPolicy) -> DeployResult<Option<PathBuf>> {
        if fs::symlink_metadata(dest).is_err() {
            return Ok(None);
        }
        match policy {
            ConflictPolicy::Backup => backup::move_aside(dest).map(Some),
            ConflictPolicy::Overwrite => {
                warn!("overwriting {:?}", dest);
                remove_entry(dest)?;
                Ok(None)
            }
            ConflictPolicy::Skip => Err(DeployError::ConflictSkipped(dest.to_path_buf())),
        }
    }

    fn place_single_link(
        &self,
        source: &Path,
        target: &Path,
        policy: ConflictPolicy,
    ) -> DeployResult<(Vec<DeployedArtifact>, Vec<PathBuf>)> {
        let backups: Vec<PathBuf> = self.clear_blocker(target, policy)?.into_iter().collect();
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).at("create target parent", parent)?;
        }
        create_symlink(source, target, true).map_err(|err| DeployError::SymlinkUnsupported {
            source_path: source.to_path_buf(),
            dest: target.to_path_buf(),
            err,
        })?;
        Ok((
            vec![DeployedArtifact {
                path: target.to_path_buf(),
                source: source.to_path_buf(),
                kind: ArtifactKind::Symlink,
            }],
            backups,
        ))
    }

    fn place_mirror(
        &self,
        target: &Path,
        plans: &[PlannedFile],
        mode: TransferMode,
        policy: ConflictPolicy,
    ) -> DeployResult<(Vec<DeployedArtifact>, Vec<PathBuf>)> {
        let mut backups = Vec::new();
        if let Ok(meta) = fs::symlink_metadata(target) {
            if !meta.is_dir() {
                backups.extend(self.clear_blocker(target, policy)?);
            }
        }

        let mut created: Vec<DeployedArtifact> = Vec::with_capacity(plans.len());
        for plan in plans {
            if let Err(err) = self.place_file(plan, mode, policy, &mut backups) {
                for artifact in created.iter().rev() {
                    let _ = fs::remove_file(&artifact.path);
                }
                prune_empty_dirs(
                    created.iter().filter_map(|artifact| artifact.path.parent()),
                    &self.protected_roots(),
                );
                return Err(err);
            }
            created.push(DeployedArtifact {
                path: plan.dest.clone(),
                source: plan.source.clone(),
                kind: match mode {
                    TransferMode::Symlink => ArtifactKind::Symlink,
                    TransferMode::Copy => ArtifactKind::Copy,
                },
            });
        }
        Ok((created, backups))
    }

    fn place_file(
        &self,
        plan: &PlannedFile,
        mode: TransferMode,
        policy: ConflictPolicy,
        backups: &mut Vec<PathBuf>,
    ) -> DeployResult<()> {
        if let Some(parent) = plan.dest.parent() {
            fs::create_dir_all(parent).at("create directory", parent)?;
        }
        backups.extend(self.clear_blocker(&plan.dest, policy)?);
        match mode {
            TransferMode::Symlink => create_symlink(&plan.source, &plan.dest, false).map_err(
                |err| DeployError::SymlinkUnsupported {
                    source_path: plan.source.clone(),
                    dest: plan.dest.clone(),
                    err,
                },
            ),
            TransferMode::Copy => copy_preserving_mtime(&plan.source, &plan.dest),
        }
    }

    /// Unlinks `rel` everywhere. Errors are logged.
    pub fn unlink(&mut self, rel: &str, confirm: &mut dyn Confirm) -> bool {
        match self.try_unlink(rel, confirm) {
            Ok(_) => true,
            Err(err) => {
                if err.is_permission_denied() {
                    error!("permission denied while unlinking {rel}: {err}");
                } else {
                    error!("unlink of {rel} failed: {err}");
                }
                false
            }
        }
    }

    pub fn try_unlink(
        &mut self,
        rel: &str,
        confirm: &mut dyn Confirm,
    ) -> DeployResult<UnlinkOutcome> {
        let key = normalize_key(rel);
        if self.store.get(&key).is_none()
            && self.manifest.artifacts(&key).is_empty()
            && !self.app.source_path(&key).is_dir()
        {
            return Err(DeployError::UnknownFolder(key));
        }
        let config = self.store.get_or_default(&key);
        let removed = self.remove_deployment(&key)?;
        let mut outcome = UnlinkOutcome {
            removed,
            cascaded: Vec::new(),
        };

        if let Some(lib_name) = config.library_name() {
            let still_provided = !linked_versions(&self.store, &key, lib_name).is_empty();
            let dependents: Vec<String> = linked_dependents(&self.store, lib_name)
                .into_iter()
                .filter(|dependent| *dependent != key)
                .collect();
            if !dependents.is_empty() && !still_provided {
                let decision = Decision::CascadeUnlink {
                    rel: key.clone(),
                    lib_name: lib_name.to_string(),
                    dependents,
                };
                if confirm.confirm(&decision) {
                    for dependent in decision.affected() {
                        info!("cascade unlink of {dependent}");
                        outcome.removed += self.remove_deployment(dependent)?;
                        outcome.cascaded.push(dependent.clone());
                    }
                } else {
                    info!("{}: dependents left linked", decision.prompt());
                }
            }
        }

        Ok(outcome)
    }

    fn remove_deployment(&mut self, key: &str) -> DeployResult<usize> {
        let config = self.store.get_or_default(key);
        let source = self.app.source_path(key);
        let removed = self.sweep(key, &config, &source)?;
        if removed > 0 {
            info!("unlinked {key} ({removed} artifact(s))");
        }
        self.write_status(key, LinkStatus::None);
        Ok(removed)
    }

    /// Removes every artifact of `source` the engine can prove it owns: the
    /// manifest's records plus any symlink back into `source` at the paths a
    /// deployment could have used under any target root.
    fn sweep(&mut self, key: &str, config: &FolderConfig, source: &Path) -> DeployResult<usize> {
        let settings = resolve_settings(config, &self.app, self.active);
        let rules = config.rules();
        let mut removed = 0usize;
        let mut touched: BTreeSet<PathBuf> = BTreeSet::new();

        let recorded = self.manifest.take(key);
        let mut kept = Vec::new();
        for artifact in recorded {
            match owned_artifact(&artifact, source) {
                Ownership::Owned => {
                    remove_entry(&artifact.path)?;
                    removed += 1;
                    if let Some(parent) = artifact.path.parent() {
                        touched.insert(parent.to_path_buf());
                    }
                }
                Ownership::Gone => {}
                Ownership::Foreign => {
                    warn!(
                        "{:?} changed since it was deployed; leaving it in place",
                        artifact.path
                    );
                    kept.push(artifact);
                }
            }
        }
        self.manifest.record(key, kept);

        for candidate in candidate_paths(&self.app, key, config, settings.deploy_rule, &rules) {
            let Ok(meta) = fs::symlink_metadata(&candidate) else {
                continue;
            };
            if meta.file_type().is_symlink() {
                if points_into(&candidate, source) && !self.claimed_elsewhere(key, &candidate) {
                    remove_entry(&candidate)?;
                    removed += 1;
                    if let Some(parent) = candidate.parent() {
                        touched.insert(parent.to_path_buf());
                    }
                }
                continue;
            }
            if !meta.is_dir() {
                continue;
            }
            for entry in WalkDir::new(&candidate).min_depth(1).follow_links(false) {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(err) => {
                        debug!("sweep skipped an entry under {:?}: {err}", candidate);
                        continue;
                    }
                };
                if entry.path_is_symlink()
                    && points_into(entry.path(), source)
                    && !self.claimed_elsewhere(key, entry.path())
                {
                    remove_entry(entry.path())?;
                    removed += 1;
                    if let Some(parent) = entry.path().parent() {
                        touched.insert(parent.to_path_buf());
                    }
                }
            }
        }

        prune_empty_dirs(touched.iter().map(PathBuf::as_path), &self.protected_roots());
        self.manifest.save()?;
        Ok(removed)
    }

    fn has_stray_artifacts(&self, key: &str, config: &FolderConfig, target: &Path) -> bool {
        let source = self.app.source_path(key);
        let recorded = self.manifest.artifacts(key).iter().any(|artifact| {
            !artifact.path.starts_with(target) && fs::symlink_metadata(&artifact.path).is_ok()
        });
        if recorded {
            return true;
        }
        let settings = resolve_settings(config, &self.app, self.active);
        candidate_paths(&self.app, key, config, settings.deploy_rule, &config.rules())
            .into_iter()
            .filter(|candidate| candidate != target)
            .any(|candidate| {
                fs::symlink_metadata(&candidate)
                    .map(|meta| meta.file_type().is_symlink())
                    .unwrap_or(false)
                    && points_into(&candidate, &source)
                    && !self.claimed_elsewhere(key, &candidate)
            })
    }

    fn protected_roots(&self) -> Vec<PathBuf> {
        let mut roots = self.app.target_roots();
        roots.push(self.app.storage_root.clone());
        for (_, config) in self.store.all() {
            if let Some(path) = &config.target_override {
                roots.push(path.clone());
            }
        }
        roots
    }

    /// Records a symlink-to-copy downgrade so later sessions and the scanner
    /// judge the copies against the mode they were made with.
    fn persist_mode(&mut self, key: &str, mode: TransferMode) {
        info!("{key} now deploys by {}", mode.label());
        if let Err(err) = self
            .store
            .update(key, |config| config.transfer_mode = Some(mode))
        {
            warn!("could not record transfer mode of {key}: {err:#}");
        }
    }

    /// True when `link` belongs to a folder other than `key`: recorded under
    /// another manifest entry, or pointing into a deployed folder nested in `key`.
    fn claimed_elsewhere(&self, key: &str, link: &Path) -> bool {
        let recorded = self.manifest.entries.iter().any(|(other, artifacts)| {
            other != key && artifacts.iter().any(|artifact| artifact.path == link)
        });
        if recorded {
            return true;
        }
        let live = self
            .store
            .all()
            .filter(|(_, config)| {
                config
                    .last_known_status
                    .map(|status| status.is_active())
                    .unwrap_or(false)
            })
            .map(|(other, _)| other.as_str());
        self.manifest
            .entries
            .keys()
            .map(String::as_str)
            .chain(live)
            .filter(|other| is_nested_key(key, other))
            .any(|other| points_into(link, &self.app.source_path(other)))
    }

    fn write_status(&mut self, key: &str, status: LinkStatus) {
        if let Err(err) = self.store.set_status(key, status) {
            warn!("could not cache status of {key}: {err:#}");
        }
    }

    fn invalidate(&mut self, key: &str) {
        if let Err(err) = self.store.invalidate_status(key) {
            warn!("could not invalidate status of {key}: {err:#}");
        }
    }
}

/// True when `child` names a folder strictly inside `parent`.
fn is_nested_key(parent: &str, child: &str) -> bool {
    if parent.is_empty() {
        return !child.is_empty();
    }
    child
        .strip_prefix(parent)
        .map(|rest| rest.starts_with('/'))
        .unwrap_or(false)
}

enum Ownership {
    Owned,
    Gone,
    Foreign,
}

fn owned_artifact(artifact: &DeployedArtifact, source: &Path) -> Ownership {
    let Ok(meta) = fs::symlink_metadata(&artifact.path) else {
        return Ownership::Gone;
    };
    let owned = match artifact.kind {
        ArtifactKind::Symlink => {
            meta.file_type().is_symlink() && points_into(&artifact.path, source)
        }
        ArtifactKind::Copy => {
            meta.is_file() && same_content(&artifact.source, &artifact.path).unwrap_or(false)
        }
    };
    if owned {
        Ownership::Owned
    } else {
        Ownership::Foreign
    }
}

/// Removes directories left empty, walking upward until a protected root or
/// a non-empty directory.
fn prune_empty_dirs<'a>(dirs: impl Iterator<Item = &'a Path>, protected: &[PathBuf]) {
    let mut ordered: Vec<&Path> = dirs.collect();
    ordered.sort_by_key(|dir| std::cmp::Reverse(dir.components().count()));
    for dir in ordered {
        let mut current = Some(dir);
        while let Some(path) = current {
            let inside_root = protected
                .iter()
                .any(|root| path.starts_with(root) && path != root.as_path());
            if !inside_root {
                break;
            }
            if fs::remove_dir(path).is_err() {
                break;
            }
            debug!("pruned empty directory {:?}", path);
            current = path.parent();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::probe_folder;
    use tempfile::TempDir;

    #[test]
    fn manifest_round_trips_through_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("deploy_manifest.json");
        let mut manifest = DeployManifest::load(&path).unwrap();
        manifest.record(
            "Weapons/Sword",
            vec![DeployedArtifact {
                path: PathBuf::from("/game/Mods/Sword"),
                source: PathBuf::from("/mods/Weapons/Sword"),
                kind: ArtifactKind::Symlink,
            }],
        );
        manifest.save().unwrap();

        let loaded = DeployManifest::load(&path).unwrap();
        assert_eq!(loaded.artifacts("Weapons/Sword").len(), 1);
        assert!(loaded.artifacts("Weapons/Axe").is_empty());
    }

    #[test]
    fn link_mode_summary_tracks_usage() {
        let mut cache = LinkModeCache::default();
        assert_eq!(cache.summary(), "none");
        cache.mode_for(Path::new("/nowhere"), TransferMode::Copy);
        assert_eq!(cache.summary(), "copy");
        cache.symlink_ok.insert(PathBuf::from("/game"), true);
        cache.mode_for(Path::new("/game"), TransferMode::Symlink);
        assert_eq!(cache.summary(), "mixed");
        cache.symlink_ok.insert(PathBuf::from("/fat32"), false);
        assert_eq!(
            cache.mode_for(Path::new("/fat32"), TransferMode::Symlink),
            TransferMode::Copy
        );
        assert_eq!(
            cache.known(Path::new("/fat32"), TransferMode::Symlink),
            TransferMode::Copy
        );
    }

    #[test]
    fn prune_stops_at_roots_and_non_empty_dirs() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("game");
        let deep = root.join("a").join("b").join("c");
        fs::create_dir_all(&deep).unwrap();
        fs::write(root.join("a").join("keep.txt"), b"x").unwrap();

        prune_empty_dirs(std::iter::once(deep.as_path()), &[root.clone()]);
        assert!(!root.join("a").join("b").exists());
        assert!(root.join("a").exists());

        let empty = root.join("empty");
        fs::create_dir_all(&empty).unwrap();
        fs::remove_file(root.join("a").join("keep.txt")).unwrap();
        prune_empty_dirs(
            [empty.as_path(), root.join("a").as_path()].into_iter(),
            &[root.clone()],
        );
        assert!(root.exists());
        assert!(!empty.exists());
        assert!(!root.join("a").exists());
    }

    #[cfg(unix)]
    #[test]
    fn symlink_support_check_cleans_up() {
        let dir = TempDir::new().unwrap();
        assert!(probe_symlink_support(dir.path()));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
        assert!(!probe_symlink_support(&dir.path().join("missing")));
    }

    #[cfg(unix)]
    #[test]
    fn leftover_capability_link_is_replaced() {
        let dir = TempDir::new().unwrap();
        let stale = dir
            .path()
            .join(format!(".linkmaster_probe_{}.lnk", std::process::id()));
        std::os::unix::fs::symlink(dir.path().join("gone"), &stale).unwrap();
        assert!(probe_symlink_support(dir.path()));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn copy_fallback_is_remembered_across_sessions() {
        let dir = TempDir::new().unwrap();
        let mods = dir.path().join("mods");
        let game = dir.path().join("game");
        fs::create_dir_all(mods.join("Weapons").join("Sword")).unwrap();
        fs::write(mods.join("Weapons").join("Sword").join("sword.pak"), b"blade").unwrap();
        fs::create_dir_all(&game).unwrap();
        let app = AppProfile::new("Game", &mods).with_target(TargetKey::Primary, &game);

        let mut engine = LinkEngine::new(app.clone(), TargetKey::Primary, FolderStore::in_memory());
        engine.link_modes.symlink_ok.insert(game.clone(), false);
        assert!(engine.deploy("Weapons/Sword", &mut AutoAnswer(false)));
        assert!(game.join("Sword").join("sword.pak").is_file());
        assert_eq!(engine.link_mode_summary(), "copy");
        assert_eq!(engine.check_status("Weapons/Sword").status, LinkStatus::Linked);

        let config = engine.store().get_or_default("Weapons/Sword");
        assert_eq!(config.transfer_mode, Some(TransferMode::Copy));
        let fresh = LinkEngine::new(app.clone(), TargetKey::Primary, engine.store().clone());
        assert_eq!(fresh.check_status("Weapons/Sword").status, LinkStatus::Linked);
        assert_eq!(
            probe_folder(&app, TargetKey::Primary, "Weapons/Sword", &config).status,
            LinkStatus::Linked
        );
    }

    #[test]
    fn nested_keys() {
        assert!(is_nested_key("", "Weapons"));
        assert!(is_nested_key("Weapons", "Weapons/Sword"));
        assert!(!is_nested_key("Weapons", "Weapons"));
        assert!(!is_nested_key("Weapons", "WeaponsExtra/Axe"));
        assert!(!is_nested_key("", ""));
    }

    #[test]
    fn decision_prompts_name_folders() {
        let decision = Decision::TagSwap {
            rel: "Weapons/Axe".into(),
            tag: "blade".into(),
            scope: ConflictScope::Global,
            linked: vec!["Weapons/Sword".into()],
        };
        assert!(decision.prompt().contains("Weapons/Sword"));
        assert_eq!(decision.affected(), ["Weapons/Sword".to_string()]);
        let mut always = AutoAnswer(true);
        assert!(always.confirm(&decision));
        let mut seen = Vec::new();
        let mut recorder = |decision: &Decision| {
            seen.push(decision.clone());
            false
        };
        assert!(!recorder.confirm(&decision));
        assert_eq!(seen.len(), 1);
    }
}
