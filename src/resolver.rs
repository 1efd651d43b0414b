//! Target path resolution and the per-folder settings fallback chain.
//!
//! Settings resolve independently for rule, transfer mode and conflict
//! policy: explicit folder value, then the legacy `deploy_type` (rule only,
//! and only when it is not `folder`), then the app's per-target default,
//! then the app-wide default.

use crate::{
    config::AppProfile,
    rules::{ConflictPolicy, DeployRule, DeploymentRules, TargetKey, TargetSelection, TransferMode},
    store::{normalize_key, FolderConfig},
};
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedSettings {
    pub deploy_rule: DeployRule,
    pub transfer_mode: TransferMode,
    pub conflict_policy: ConflictPolicy,
}

/// Which target key a folder deploys to: its own selection, else the active one.
pub fn effective_target(config: &FolderConfig, active: TargetKey) -> TargetKey {
    config
        .target_selection
        .and_then(TargetSelection::target_key)
        .unwrap_or(active)
}

pub fn resolve_settings(
    config: &FolderConfig,
    app: &AppProfile,
    active: TargetKey,
) -> ResolvedSettings {
    let defaults = app.target_defaults(effective_target(config, active));

    let deploy_rule = config
        .deploy_rule
        .or(config.deploy_type.filter(|rule| *rule != DeployRule::Folder))
        .or(defaults.deploy_rule)
        .unwrap_or(app.default_deploy_rule);
    let transfer_mode = config
        .transfer_mode
        .or(defaults.transfer_mode)
        .unwrap_or(app.default_transfer_mode);
    let conflict_policy = config
        .conflict_policy
        .or(defaults.conflict_policy)
        .unwrap_or(app.default_conflict_policy);

    ResolvedSettings {
        deploy_rule,
        transfer_mode,
        conflict_policy,
    }
}

/// The base directory a folder deploys under, before the rule's join logic.
/// `None` when neither an override nor the selected target root is set.
pub fn target_base(config: &FolderConfig, app: &AppProfile, active: TargetKey) -> Option<PathBuf> {
    if config.target_selection == Some(TargetSelection::Custom) {
        if let Some(custom) = non_empty(config.target_override.as_deref()) {
            return Some(custom.to_path_buf());
        }
        warn!("custom target selected without a target override; using the active target");
    }
    app.target_root(effective_target(config, active))
        .map(Path::to_path_buf)
}

/// The single path deploy, unlink and status checks act on for `rel`.
pub fn resolve_target_path(
    app: &AppProfile,
    active: TargetKey,
    rel: &str,
    config: &FolderConfig,
    rule: DeployRule,
    rules: &DeploymentRules,
) -> Option<PathBuf> {
    if config.target_selection != Some(TargetSelection::Custom) {
        if let Some(pinned) = non_empty(config.target_override.as_deref()) {
            return Some(pinned.to_path_buf());
        }
    }
    let base = target_base(config, app, active)?;
    Some(join_under(&base, app, rel, rule, rules.skip_levels))
}

/// Applies the rule's join logic beneath `base`.
pub fn join_under(
    base: &Path,
    app: &AppProfile,
    rel: &str,
    rule: DeployRule,
    skip_levels: usize,
) -> PathBuf {
    let key = normalize_key(rel);
    match rule {
        DeployRule::Files => base.to_path_buf(),
        DeployRule::Tree => {
            let rest: Vec<&str> = key
                .split('/')
                .filter(|part| !part.is_empty())
                .skip(skip_levels)
                .collect();
            if rest.is_empty() {
                return base.to_path_buf();
            }
            let mut path = base.to_path_buf();
            for part in rest {
                path.push(part);
            }
            path
        }
        DeployRule::Folder | DeployRule::Custom => {
            let name = match key.rsplit('/').next().filter(|name| !name.is_empty()) {
                Some(name) => Some(name.to_string()),
                None => app
                    .storage_root
                    .file_name()
                    .map(|name| name.to_string_lossy().to_string()),
            };
            match name {
                Some(name) => base.join(name),
                None => base.to_path_buf(),
            }
        }
    }
}

/// Every path a previous deployment of `rel` could occupy across all of the
/// app's target roots and the folder's override, deduplicated.
pub fn candidate_paths(
    app: &AppProfile,
    rel: &str,
    config: &FolderConfig,
    rule: DeployRule,
    rules: &DeploymentRules,
) -> Vec<PathBuf> {
    let mut bases = app.target_roots();
    let override_path = non_empty(config.target_override.as_deref()).map(Path::to_path_buf);
    if let Some(path) = &override_path {
        bases.push(path.clone());
    }

    let mut out: Vec<PathBuf> = Vec::new();
    let mut push = |path: PathBuf| {
        if !out.contains(&path) {
            out.push(path);
        }
    };

    if let Some(path) = override_path {
        push(path);
    }
    for base in &bases {
        push(join_under(base, app, rel, rule, rules.skip_levels));
        push(join_under(base, app, rel, DeployRule::Folder, 0));
        push(join_under(base, app, rel, DeployRule::Tree, rules.skip_levels));
    }
    out
}

fn non_empty(path: Option<&Path>) -> Option<&Path> {
    path.filter(|path| !path.as_os_str().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TargetDefaults;

    fn app() -> AppProfile {
        AppProfile::new("Game", "/mods")
            .with_target(TargetKey::Primary, "/game/Mods")
            .with_target(TargetKey::Secondary, "/game/Alt")
    }

    #[test]
    fn folder_rule_joins_basename() {
        let path = resolve_target_path(
            &app(),
            TargetKey::Primary,
            "Weapons/Sword",
            &FolderConfig::default(),
            DeployRule::Folder,
            &DeploymentRules::default(),
        );
        assert_eq!(path, Some(PathBuf::from("/game/Mods/Sword")));
    }

    #[test]
    fn tree_rule_strips_leading_segments() {
        let rules = DeploymentRules {
            skip_levels: 1,
            ..Default::default()
        };
        let config = FolderConfig::default();
        let path = resolve_target_path(
            &app(),
            TargetKey::Primary,
            "CategoryA/Sub/Item",
            &config,
            DeployRule::Tree,
            &rules,
        );
        assert_eq!(path, Some(PathBuf::from("/game/Mods/Sub/Item")));

        let rules = DeploymentRules {
            skip_levels: 5,
            ..Default::default()
        };
        let path = resolve_target_path(
            &app(),
            TargetKey::Primary,
            "CategoryA/Sub/Item",
            &config,
            DeployRule::Tree,
            &rules,
        );
        assert_eq!(path, Some(PathBuf::from("/game/Mods")));
    }

    #[test]
    fn files_rule_targets_root() {
        let path = resolve_target_path(
            &app(),
            TargetKey::Secondary,
            "Weapons/Sword",
            &FolderConfig::default(),
            DeployRule::Files,
            &DeploymentRules::default(),
        );
        assert_eq!(path, Some(PathBuf::from("/game/Alt")));
    }

    #[test]
    fn override_pins_path_and_custom_uses_it_as_base() {
        let pinned = FolderConfig {
            target_override: Some(PathBuf::from("/elsewhere/Blade")),
            ..Default::default()
        };
        let path = resolve_target_path(
            &app(),
            TargetKey::Primary,
            "Weapons/Sword",
            &pinned,
            DeployRule::Tree,
            &DeploymentRules::default(),
        );
        assert_eq!(path, Some(PathBuf::from("/elsewhere/Blade")));

        let custom = FolderConfig {
            target_override: Some(PathBuf::from("/custom")),
            target_selection: Some(TargetSelection::Custom),
            ..Default::default()
        };
        let path = resolve_target_path(
            &app(),
            TargetKey::Primary,
            "Weapons/Sword",
            &custom,
            DeployRule::Folder,
            &DeploymentRules::default(),
        );
        assert_eq!(path, Some(PathBuf::from("/custom/Sword")));
    }

    #[test]
    fn selection_redirects_root() {
        let config = FolderConfig {
            target_selection: Some(TargetSelection::Secondary),
            ..Default::default()
        };
        let path = resolve_target_path(
            &app(),
            TargetKey::Primary,
            "Weapons/Sword",
            &config,
            DeployRule::Folder,
            &DeploymentRules::default(),
        );
        assert_eq!(path, Some(PathBuf::from("/game/Alt/Sword")));

        let missing = FolderConfig {
            target_selection: Some(TargetSelection::Tertiary),
            ..Default::default()
        };
        assert!(resolve_target_path(
            &app(),
            TargetKey::Primary,
            "Weapons/Sword",
            &missing,
            DeployRule::Folder,
            &DeploymentRules::default(),
        )
        .is_none());
    }

    #[test]
    fn empty_rel_uses_storage_root_name() {
        let path = join_under(Path::new("/game/Mods"), &app(), "", DeployRule::Folder, 0);
        assert_eq!(path, PathBuf::from("/game/Mods/mods"));
        let path = join_under(Path::new("/game/Mods"), &app(), "", DeployRule::Tree, 0);
        assert_eq!(path, PathBuf::from("/game/Mods"));
    }

    #[test]
    fn fallback_chain_levels() {
        let mut app = app();
        app.target_defaults_a = TargetDefaults {
            deploy_rule: Some(DeployRule::Tree),
            transfer_mode: Some(TransferMode::Copy),
            conflict_policy: None,
        };
        app.default_conflict_policy = ConflictPolicy::Skip;

        let inherit = FolderConfig::default();
        let resolved = resolve_settings(&inherit, &app, TargetKey::Primary);
        assert_eq!(resolved.deploy_rule, DeployRule::Tree);
        assert_eq!(resolved.transfer_mode, TransferMode::Copy);
        assert_eq!(resolved.conflict_policy, ConflictPolicy::Skip);

        let legacy = FolderConfig {
            deploy_type: Some(DeployRule::Files),
            ..Default::default()
        };
        assert_eq!(
            resolve_settings(&legacy, &app, TargetKey::Primary).deploy_rule,
            DeployRule::Files
        );

        let legacy_default = FolderConfig {
            deploy_type: Some(DeployRule::Folder),
            ..Default::default()
        };
        assert_eq!(
            resolve_settings(&legacy_default, &app, TargetKey::Primary).deploy_rule,
            DeployRule::Tree
        );

        let explicit = FolderConfig {
            deploy_rule: Some(DeployRule::Custom),
            deploy_type: Some(DeployRule::Files),
            ..Default::default()
        };
        assert_eq!(
            resolve_settings(&explicit, &app, TargetKey::Primary).deploy_rule,
            DeployRule::Custom
        );

        let resolved = resolve_settings(&inherit, &app, TargetKey::Secondary);
        assert_eq!(resolved.deploy_rule, DeployRule::Folder);
        assert_eq!(resolved.transfer_mode, TransferMode::Symlink);
    }

    #[test]
    fn candidates_cover_every_root() {
        let config = FolderConfig {
            target_override: Some(PathBuf::from("/pinned")),
            ..Default::default()
        };
        let paths = candidate_paths(
            &app(),
            "Weapons/Sword",
            &config,
            DeployRule::Folder,
            &DeploymentRules::default(),
        );
        assert!(paths.contains(&PathBuf::from("/pinned")));
        assert!(paths.contains(&PathBuf::from("/game/Mods/Sword")));
        assert!(paths.contains(&PathBuf::from("/game/Alt/Sword")));
        assert!(paths.contains(&PathBuf::from("/game/Mods/Weapons/Sword")));
    }
}
