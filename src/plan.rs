use crate::{
    error::{DeployResult, IoContext},
    rules::{DeployRule, DeploymentRules, Placement, TransferMode},
};
use std::{
    fs, io,
    path::{Component, Path, PathBuf},
};
use walkdir::WalkDir;

/// What a deployment of one folder puts on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactShape {
    /// One directory symlink at the target path.
    SingleLink,
    /// Per-file links or copies beneath the target path.
    Mirror,
}

pub fn artifact_shape(rule: DeployRule, mode: TransferMode, rules: &DeploymentRules) -> ArtifactShape {
    if rule == DeployRule::Folder && mode == TransferMode::Symlink && !rules.has_filters() {
        ArtifactShape::SingleLink
    } else {
        ArtifactShape::Mirror
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedFile {
    pub source: PathBuf,
    pub dest: PathBuf,
}

/// Expands `source` into the files a mirror deployment places under `target`,
/// applying exclude/rename/override rules. Sorted by destination.
pub fn plan_mirror(
    source: &Path,
    target: &Path,
    rules: &DeploymentRules,
) -> DeployResult<Vec<PlannedFile>> {
    let compiled = rules.compile();
    let mut plans = Vec::new();
    for entry in WalkDir::new(source)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            entry
                .path()
                .strip_prefix(source)
                .map(|rel| !is_ignored_deploy_path(rel))
                .unwrap_or(true)
        })
    {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(source)
            .map_err(|_| {
                crate::error::DeployError::io(
                    "strip source prefix",
                    entry.path(),
                    io::Error::new(io::ErrorKind::Other, "entry outside source"),
                )
            })?;
        let dest = match compiled.placement(rel) {
            Placement::Excluded => continue,
            Placement::Relative(path) => target.join(path),
            Placement::Absolute(path) => path,
        };
        plans.push(PlannedFile {
            source: entry.path().to_path_buf(),
            dest,
        });
    }
    plans.sort_by(|a, b| a.dest.cmp(&b.dest));
    Ok(plans)
}

pub fn is_ignored_deploy_path(path: &Path) -> bool {
    path.components().any(|component| {
        let part = component.as_os_str().to_string_lossy();
        part.eq_ignore_ascii_case("__MACOSX")
            || part.eq_ignore_ascii_case(".ds_store")
            || part.eq_ignore_ascii_case("thumbs.db")
            || part.eq_ignore_ascii_case("desktop.ini")
            || part == ".git"
            || part == ".svn"
    })
}

/// Where a symlink points, made absolute against its parent directory.
pub fn link_destination(link: &Path) -> Option<PathBuf> {
    let raw = fs::read_link(link).ok()?;
    if raw.is_absolute() {
        return Some(raw);
    }
    let parent = link.parent()?;
    Some(parent.join(raw))
}

/// True when `link` is a symlink resolving exactly to `expected`.
pub fn points_to(link: &Path, expected: &Path) -> bool {
    let Some(dest) = link_destination(link) else {
        return false;
    };
    same_location(&dest, expected)
}

/// True when `link` is a symlink resolving to `root` or anything inside it.
pub fn points_into(link: &Path, root: &Path) -> bool {
    let Some(dest) = link_destination(link) else {
        return false;
    };
    let dest = canonical_or_lexical(&dest);
    let root = canonical_or_lexical(root);
    dest == root || dest.starts_with(&root)
}

pub fn same_location(a: &Path, b: &Path) -> bool {
    canonical_or_lexical(a) == canonical_or_lexical(b)
}

fn canonical_or_lexical(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| lexical_normalize(path))
}

pub fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Size check first, then a blake3 digest of both files.
pub fn same_content(a: &Path, b: &Path) -> DeployResult<bool> {
    let meta_a = fs::metadata(a).at("stat", a)?;
    let meta_b = fs::metadata(b).at("stat", b)?;
    if !meta_a.is_file() || !meta_b.is_file() || meta_a.len() != meta_b.len() {
        return Ok(false);
    }
    Ok(file_digest(a)? == file_digest(b)?)
}

pub fn file_digest(path: &Path) -> DeployResult<blake3::Hash> {
    let mut file = fs::File::open(path).at("open", path)?;
    let mut hasher = blake3::Hasher::new();
    io::copy(&mut file, &mut hasher).at("hash", path)?;
    Ok(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    #[test]
    fn shape_follows_rule_mode_and_filters() {
        let empty = DeploymentRules::default();
        assert_eq!(
            artifact_shape(DeployRule::Folder, TransferMode::Symlink, &empty),
            ArtifactShape::SingleLink
        );
        assert_eq!(
            artifact_shape(DeployRule::Folder, TransferMode::Copy, &empty),
            ArtifactShape::Mirror
        );
        assert_eq!(
            artifact_shape(DeployRule::Tree, TransferMode::Symlink, &empty),
            ArtifactShape::Mirror
        );
        let filtered = DeploymentRules {
            exclude: vec!["*.txt".into()],
            ..Default::default()
        };
        assert_eq!(
            artifact_shape(DeployRule::Folder, TransferMode::Symlink, &filtered),
            ArtifactShape::Mirror
        );
    }

    #[test]
    fn mirror_plan_applies_rules() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("Sword");
        fs::create_dir_all(source.join("Data")).unwrap();
        fs::create_dir_all(source.join(".git")).unwrap();
        fs::write(source.join("Data").join("sword.pak"), b"pak").unwrap();
        fs::write(source.join("readme.txt"), b"hi").unwrap();
        fs::write(source.join(".git").join("HEAD"), b"ref").unwrap();

        let mut rename = BTreeMap::new();
        rename.insert("Data".to_string(), "Paks".to_string());
        let rules = DeploymentRules {
            exclude: vec!["*.txt".into()],
            rename,
            ..Default::default()
        };
        let target = dir.path().join("target");
        let plans = plan_mirror(&source, &target, &rules).unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].dest, target.join("Paks").join("sword.pak"));
        assert_eq!(plans[0].source, source.join("Data").join("sword.pak"));
    }

    #[test]
    fn content_comparison_uses_size_and_digest() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let c = dir.path().join("c");
        fs::write(&a, b"same bytes").unwrap();
        fs::write(&b, b"same bytes").unwrap();
        fs::write(&c, b"diff bytes").unwrap();
        assert!(same_content(&a, &b).unwrap());
        assert!(!same_content(&a, &c).unwrap());
    }

    #[test]
    fn lexical_normalize_collapses_dots() {
        assert_eq!(
            lexical_normalize(Path::new("/game/Mods/../mods/./Sword")),
            PathBuf::from("/game/mods/Sword")
        );
    }

    #[cfg(unix)]
    #[test]
    fn symlink_ownership_checks() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("Sword");
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join("a.pak"), b"pak").unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&source, &link).unwrap();
        let file_link = dir.path().join("file_link");
        std::os::unix::fs::symlink(Path::new("Sword").join("a.pak"), &file_link).unwrap();

        assert!(points_to(&link, &source));
        assert!(points_into(&file_link, &source));
        assert!(!points_to(&file_link, &source));
        assert!(!points_into(&link, &dir.path().join("Other")));
    }
}
