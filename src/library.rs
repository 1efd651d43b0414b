use crate::{
    rules::{LibDependency, VersionMode},
    store::{normalize_key, FolderConfig, FolderStore},
};
use std::{
    cmp::Ordering,
    collections::HashSet,
};
use tracing::{debug, warn};

/// Segment-wise version ordering: numeric segments compare numerically,
/// anything else lexically, and a longer version wins a shared prefix.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let split = |value: &str| -> Vec<String> {
        value
            .trim()
            .trim_start_matches(['v', 'V'])
            .split(['.', '-', '_', '+'])
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect()
    };
    let left = split(a);
    let right = split(b);
    for (l, r) in left.iter().zip(right.iter()) {
        let ordering = match (l.parse::<u64>(), r.parse::<u64>()) {
            (Ok(l), Ok(r)) => l.cmp(&r),
            (Ok(_), Err(_)) => Ordering::Greater,
            (Err(_), Ok(_)) => Ordering::Less,
            (Err(_), Err(_)) => l.to_ascii_lowercase().cmp(&r.to_ascii_lowercase()),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    left.len().cmp(&right.len())
}

fn same_name(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

/// Every library folder publishing `name`, keyed by storage-relative path.
pub fn library_candidates<'a>(store: &'a FolderStore, name: &str) -> Vec<(&'a str, &'a FolderConfig)> {
    store
        .all()
        .filter(|(_, config)| {
            config
                .library_name()
                .map(|lib| same_name(lib, name))
                .unwrap_or(false)
        })
        .map(|(rel, config)| (rel.as_str(), config))
        .collect()
}

fn version_of(config: &FolderConfig) -> &str {
    config.lib_version.as_deref().unwrap_or("")
}

fn sort_by_priority(candidates: &mut [(&str, &FolderConfig)]) {
    candidates.sort_by(|(rel_a, a), (rel_b, b)| {
        b.lib_priority
            .cmp(&a.lib_priority)
            .then_with(|| compare_versions(version_of(b), version_of(a)))
            .then_with(|| rel_a.cmp(rel_b))
    });
}

/// Picks the folder that satisfies `dep`, or `None` when nothing publishes it.
pub fn select_version(store: &FolderStore, dep: &LibDependency) -> Option<String> {
    let mut candidates = library_candidates(store, &dep.name);
    if candidates.is_empty() {
        return None;
    }

    match dep.version_mode {
        VersionMode::Specific => {
            let wanted = dep.version.as_deref().map(str::trim).unwrap_or("");
            if let Some((rel, _)) = candidates
                .iter()
                .find(|(_, config)| version_of(config).trim() == wanted)
            {
                return Some(rel.to_string());
            }
            warn!(
                "library {} has no version {:?}; falling back to priority order",
                dep.name, wanted
            );
            sort_by_priority(&mut candidates);
        }
        VersionMode::Latest => {
            candidates.sort_by(|(rel_a, a), (rel_b, b)| {
                compare_versions(version_of(b), version_of(a)).then_with(|| rel_a.cmp(rel_b))
            });
        }
        VersionMode::Priority => sort_by_priority(&mut candidates),
    }
    candidates.first().map(|(rel, _)| rel.to_string())
}

/// Dependencies of one package in deploy order: each entry's own
/// dependencies precede it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyPlan {
    pub order: Vec<String>,
    pub missing: Vec<String>,
}

pub fn resolve_dependencies(store: &FolderStore, rel: &str) -> DependencyPlan {
    let mut plan = DependencyPlan::default();
    let mut seen_names = HashSet::new();
    let mut visiting = HashSet::new();
    let root = normalize_key(rel);
    visiting.insert(root.clone());
    resolve_into(store, &root, &mut seen_names, &mut visiting, &mut plan);
    plan
}

fn resolve_into(
    store: &FolderStore,
    rel: &str,
    seen_names: &mut HashSet<String>,
    visiting: &mut HashSet<String>,
    plan: &mut DependencyPlan,
) {
    let Some(config) = store.get(rel) else {
        return;
    };
    for dep in config.dependencies() {
        let key = dep.name.trim().to_ascii_lowercase();
        if !seen_names.insert(key) {
            debug!("dependency {} already resolved in this batch", dep.name);
            continue;
        }
        let Some(dep_rel) = select_version(store, &dep) else {
            warn!("dependency {} of {} is not installed", dep.name, rel);
            plan.missing.push(dep.name.clone());
            continue;
        };
        if !visiting.insert(dep_rel.clone()) {
            warn!("dependency cycle through {dep_rel}; skipping");
            continue;
        }
        resolve_into(store, &dep_rel, seen_names, visiting, plan);
        if !plan.order.contains(&dep_rel) {
            plan.order.push(dep_rel);
        }
    }
}

/// Other folders of the same library whose cached status is live.
pub fn linked_versions(store: &FolderStore, rel: &str, lib_name: &str) -> Vec<String> {
    let key = normalize_key(rel);
    library_candidates(store, lib_name)
        .into_iter()
        .filter(|(other, config)| {
            *other != key
                && config
                    .last_known_status
                    .map(|status| status.is_active())
                    .unwrap_or(false)
        })
        .map(|(other, _)| other.to_string())
        .collect()
}

/// Live packages that declare a dependency on `lib_name`.
pub fn linked_dependents(store: &FolderStore, lib_name: &str) -> Vec<String> {
    store
        .all()
        .filter(|(_, config)| {
            config
                .last_known_status
                .map(|status| status.is_active())
                .unwrap_or(false)
        })
        .filter(|(_, config)| {
            config
                .dependencies()
                .iter()
                .any(|dep| same_name(&dep.name, lib_name))
        })
        .map(|(rel, _)| rel.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::LinkStatus;
    use serde_json::json;

    fn add_lib(store: &mut FolderStore, rel: &str, version: &str, priority: i64) {
        store
            .update(rel, |config| {
                config.is_library = true;
                config.lib_name = Some("CoreLib".into());
                config.lib_version = Some(version.into());
                config.lib_priority = priority;
            })
            .unwrap();
    }

    fn dep(mode: VersionMode, version: Option<&str>) -> LibDependency {
        LibDependency {
            name: "corelib".into(),
            version_mode: mode,
            version: version.map(str::to_string),
        }
    }

    #[test]
    fn versions_compare_segmentwise() {
        assert_eq!(compare_versions("10.0", "9.2"), Ordering::Greater);
        assert_eq!(compare_versions("v1.2", "1.2.0"), Ordering::Less);
        assert_eq!(compare_versions("1.0-beta", "1.0-alpha"), Ordering::Greater);
        assert_eq!(compare_versions("2.0", "2.0"), Ordering::Equal);
    }

    #[test]
    fn priority_and_latest_modes() {
        let mut store = FolderStore::in_memory();
        add_lib(&mut store, "Libs/Core-1.0", "1.0", 10);
        add_lib(&mut store, "Libs/Core-2.0", "2.0", 0);

        assert_eq!(
            select_version(&store, &dep(VersionMode::Priority, None)).as_deref(),
            Some("Libs/Core-1.0")
        );
        assert_eq!(
            select_version(&store, &dep(VersionMode::Latest, None)).as_deref(),
            Some("Libs/Core-2.0")
        );
        assert_eq!(
            select_version(&store, &dep(VersionMode::Specific, Some("2.0"))).as_deref(),
            Some("Libs/Core-2.0")
        );
        assert_eq!(
            select_version(&store, &dep(VersionMode::Specific, Some("3.0"))).as_deref(),
            Some("Libs/Core-1.0")
        );
    }

    #[test]
    fn equal_priority_prefers_newer_version() {
        let mut store = FolderStore::in_memory();
        add_lib(&mut store, "Libs/A", "1.5", 1);
        add_lib(&mut store, "Libs/B", "1.10", 1);
        assert_eq!(
            select_version(&store, &dep(VersionMode::Priority, None)).as_deref(),
            Some("Libs/B")
        );
    }

    #[test]
    fn dependency_plan_orders_transitively_and_dedupes() {
        let mut store = FolderStore::in_memory();
        add_lib(&mut store, "Libs/Core", "1.0", 0);
        store
            .update("Libs/Ui", |config| {
                config.is_library = true;
                config.lib_name = Some("UiLib".into());
                config.lib_deps = Some(json!(["CoreLib"]));
            })
            .unwrap();
        store
            .update("Mods/Hud", |config| {
                config.lib_deps = Some(json!(["UiLib", "CoreLib", "Missing", "corelib"]));
            })
            .unwrap();

        let plan = resolve_dependencies(&store, "Mods/Hud");
        assert_eq!(plan.order, vec!["Libs/Core".to_string(), "Libs/Ui".to_string()]);
        assert_eq!(plan.missing, vec!["Missing".to_string()]);
    }

    #[test]
    fn cycles_terminate() {
        let mut store = FolderStore::in_memory();
        store
            .update("Libs/A", |config| {
                config.is_library = true;
                config.lib_name = Some("A".into());
                config.lib_deps = Some(json!(["B"]));
            })
            .unwrap();
        store
            .update("Libs/B", |config| {
                config.is_library = true;
                config.lib_name = Some("B".into());
                config.lib_deps = Some(json!(["A"]));
            })
            .unwrap();
        let plan = resolve_dependencies(&store, "Libs/A");
        assert_eq!(plan.order, vec!["Libs/B".to_string()]);
    }

    #[test]
    fn live_versions_and_dependents() {
        let mut store = FolderStore::in_memory();
        add_lib(&mut store, "Libs/Core-1.0", "1.0", 0);
        add_lib(&mut store, "Libs/Core-2.0", "2.0", 0);
        store.set_status("Libs/Core-1.0", LinkStatus::Linked).unwrap();
        store
            .update("Mods/Hud", |config| {
                config.lib_deps = Some(json!([{"name": "CoreLib"}]));
                config.last_known_status = Some(LinkStatus::Partial);
            })
            .unwrap();
        store
            .update("Mods/Off", |config| {
                config.lib_deps = Some(json!(["CoreLib"]));
            })
            .unwrap();

        assert_eq!(
            linked_versions(&store, "Libs/Core-2.0", "CoreLib"),
            vec!["Libs/Core-1.0".to_string()]
        );
        assert!(linked_versions(&store, "Libs/Core-1.0", "CoreLib").is_empty());
        assert_eq!(linked_dependents(&store, "corelib"), vec!["Mods/Hud".to_string()]);
    }
}
