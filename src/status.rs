//! Link status probing.
//!
//! Everything here only reads the filesystem, so it is safe to call from
//! scanner threads while the engine owns the store.

use crate::{
    config::AppProfile,
    plan::{artifact_shape, plan_mirror, points_to, same_content, ArtifactShape},
    resolver::{resolve_settings, resolve_target_path},
    rules::{DeployRule, DeploymentRules, LinkStatus, TargetKey, TransferMode},
    store::FolderConfig,
};
use serde::Serialize;
use std::{fs, path::Path};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    None,
    Symlink,
    Mirror,
    Foreign,
}

impl LinkKind {
    pub fn label(self) -> &'static str {
        match self {
            LinkKind::None => "none",
            LinkKind::Symlink => "symlink",
            LinkKind::Mirror => "mirror",
            LinkKind::Foreign => "foreign",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LinkState {
    pub status: LinkStatus,
    #[serde(rename = "type")]
    pub kind: LinkKind,
}

impl LinkState {
    pub const NONE: LinkState = LinkState {
        status: LinkStatus::None,
        kind: LinkKind::None,
    };

    fn new(status: LinkStatus, kind: LinkKind) -> Self {
        Self { status, kind }
    }
}

/// Classifies what currently sits at `target` against what a deployment of
/// `expected_source` under `rule`/`rules` would have produced there.
pub fn get_link_status(
    target: &Path,
    expected_source: &Path,
    expected_mode: TransferMode,
    rule: DeployRule,
    rules: &DeploymentRules,
) -> LinkState {
    let Ok(meta) = fs::symlink_metadata(target) else {
        return LinkState::NONE;
    };

    match artifact_shape(rule, expected_mode, rules) {
        ArtifactShape::SingleLink => {
            if meta.file_type().is_symlink() && points_to(target, expected_source) {
                LinkState::new(LinkStatus::Linked, LinkKind::Symlink)
            } else {
                LinkState::new(LinkStatus::Conflict, LinkKind::Foreign)
            }
        }
        ArtifactShape::Mirror => {
            if meta.file_type().is_symlink() {
                return if points_to(target, expected_source) {
                    LinkState::new(LinkStatus::Partial, LinkKind::Symlink)
                } else {
                    LinkState::new(LinkStatus::Conflict, LinkKind::Foreign)
                };
            }
            probe_mirror(target, expected_source, expected_mode, rules)
        }
    }
}

/// Resolves settings and target for one folder and probes it.
pub fn probe_folder(
    app: &AppProfile,
    active: TargetKey,
    rel: &str,
    config: &FolderConfig,
) -> LinkState {
    let settings = resolve_settings(config, app, active);
    let rules = config.rules();
    let Some(target) =
        resolve_target_path(app, active, rel, config, settings.deploy_rule, &rules)
    else {
        return LinkState::NONE;
    };
    get_link_status(
        &target,
        &app.source_path(rel),
        settings.transfer_mode,
        settings.deploy_rule,
        &rules,
    )
}

fn probe_mirror(
    target: &Path,
    source: &Path,
    mode: TransferMode,
    rules: &DeploymentRules,
) -> LinkState {
    let plans = match plan_mirror(source, target, rules) {
        Ok(plans) => plans,
        Err(err) => {
            debug!("status probe could not plan {:?}: {err}", source);
            return LinkState::NONE;
        }
    };
    if plans.is_empty() {
        return LinkState::NONE;
    }

    let mut matched = 0usize;
    let mut foreign = 0usize;
    for plan in &plans {
        let Ok(meta) = fs::symlink_metadata(&plan.dest) else {
            continue;
        };
        let ours = match mode {
            TransferMode::Symlink => {
                meta.file_type().is_symlink() && points_to(&plan.dest, &plan.source)
            }
            TransferMode::Copy => {
                meta.file_type().is_file()
                    && same_content(&plan.source, &plan.dest).unwrap_or(false)
            }
        };
        if ours {
            matched += 1;
        } else {
            foreign += 1;
        }
    }

    if matched == plans.len() {
        let status = if rules.has_filters() {
            LinkStatus::Partial
        } else {
            LinkStatus::Linked
        };
        return LinkState::new(status, LinkKind::Mirror);
    }
    if matched > 0 {
        return LinkState::new(LinkStatus::Partial, LinkKind::Mirror);
    }
    if foreign > 0 {
        return LinkState::new(LinkStatus::Conflict, LinkKind::Foreign);
    }
    LinkState::NONE
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn source_with_files(dir: &Path) -> std::path::PathBuf {
        let source = dir.join("mods").join("Sword");
        fs::create_dir_all(source.join("Data")).unwrap();
        fs::write(source.join("Data").join("a.pak"), b"aaa").unwrap();
        fs::write(source.join("b.esp"), b"bbb").unwrap();
        source
    }

    #[test]
    fn missing_target_is_none() {
        let dir = TempDir::new().unwrap();
        let source = source_with_files(dir.path());
        let state = get_link_status(
            &dir.path().join("game").join("Sword"),
            &source,
            TransferMode::Symlink,
            DeployRule::Folder,
            &DeploymentRules::default(),
        );
        assert_eq!(state, LinkState::NONE);
    }

    #[test]
    fn copies_classify_by_content() {
        let dir = TempDir::new().unwrap();
        let source = source_with_files(dir.path());
        let target = dir.path().join("game").join("Sword");
        fs::create_dir_all(target.join("Data")).unwrap();
        fs::write(target.join("Data").join("a.pak"), b"aaa").unwrap();

        let probe = || {
            get_link_status(
                &target,
                &source,
                TransferMode::Copy,
                DeployRule::Folder,
                &DeploymentRules::default(),
            )
        };
        assert_eq!(probe().status, LinkStatus::Partial);

        fs::write(target.join("b.esp"), b"bbb").unwrap();
        assert_eq!(probe(), LinkState::new(LinkStatus::Linked, LinkKind::Mirror));

        fs::write(target.join("Data").join("a.pak"), b"zzz").unwrap();
        fs::write(target.join("b.esp"), b"zzz").unwrap();
        assert_eq!(probe(), LinkState::new(LinkStatus::Conflict, LinkKind::Foreign));
    }

    #[test]
    fn filters_downgrade_full_match_to_partial() {
        let dir = TempDir::new().unwrap();
        let source = source_with_files(dir.path());
        let target = dir.path().join("game").join("Sword");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("b.esp"), b"bbb").unwrap();
        let rules = DeploymentRules {
            exclude: vec!["Data".into()],
            ..Default::default()
        };
        let state = get_link_status(&target, &source, TransferMode::Copy, DeployRule::Folder, &rules);
        assert_eq!(state.status, LinkStatus::Partial);
    }

    #[cfg(unix)]
    #[test]
    fn single_link_ownership() {
        let dir = TempDir::new().unwrap();
        let source = source_with_files(dir.path());
        let other = dir.path().join("mods").join("Axe");
        fs::create_dir_all(&other).unwrap();
        let game = dir.path().join("game");
        fs::create_dir_all(&game).unwrap();

        let target = game.join("Sword");
        std::os::unix::fs::symlink(&source, &target).unwrap();
        let state = get_link_status(
            &target,
            &source,
            TransferMode::Symlink,
            DeployRule::Folder,
            &DeploymentRules::default(),
        );
        assert_eq!(state, LinkState::new(LinkStatus::Linked, LinkKind::Symlink));

        let state = get_link_status(
            &target,
            &other,
            TransferMode::Symlink,
            DeployRule::Folder,
            &DeploymentRules::default(),
        );
        assert_eq!(state, LinkState::new(LinkStatus::Conflict, LinkKind::Foreign));

        let blocker = game.join("Axe");
        fs::create_dir_all(&blocker).unwrap();
        let state = get_link_status(
            &blocker,
            &other,
            TransferMode::Symlink,
            DeployRule::Folder,
            &DeploymentRules::default(),
        );
        assert_eq!(state.status, LinkStatus::Conflict);
    }
}
