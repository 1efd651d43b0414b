use crate::{plan::is_ignored_deploy_path, rules::FolderType, store::FolderConfig};
use std::{fs, path::Path};

/// Files whose presence marks a folder as a deployable package.
pub const MANIFEST_MARKERS: &[&str] = &[
    "manifest.json",
    "package.json",
    "mod.json",
    "modinfo.json",
    "modinfo.xml",
    "info.json",
    "meta.ini",
    "meta.lsx",
];

pub const PACKAGE_EXTENSIONS: &[&str] = &[
    "pak", "esp", "esm", "esl", "bsa", "ba2", "dll", "asi", "jar", "lua", "ucas", "utoc",
    "vpk", "zip", "7z", "rar",
];

/// Category or package for a folder with no explicit type. Rules run in
/// order and the first match wins: manifest marker, package extension,
/// any top-level file, else category.
pub fn detect_folder_type(dir: &Path) -> FolderType {
    let Ok(entries) = fs::read_dir(dir) else {
        return FolderType::Category;
    };
    let mut files = Vec::new();
    for entry in entries.flatten() {
        if is_ignored_deploy_path(Path::new(&entry.file_name())) {
            continue;
        }
        let is_file = entry.file_type().map(|kind| kind.is_file()).unwrap_or(false);
        if is_file {
            files.push(entry.file_name().to_string_lossy().to_ascii_lowercase());
        }
    }

    if files
        .iter()
        .any(|name| MANIFEST_MARKERS.contains(&name.as_str()))
    {
        return FolderType::Package;
    }
    if files.iter().any(|name| {
        Path::new(name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| PACKAGE_EXTENSIONS.contains(&ext))
            .unwrap_or(false)
    }) {
        return FolderType::Package;
    }
    if !files.is_empty() {
        return FolderType::Package;
    }
    FolderType::Category
}

/// Explicit `category`/`package` wins; `auto` or no config falls back to
/// [`detect_folder_type`].
pub fn effective_folder_type(config: Option<&FolderConfig>, dir: &Path) -> FolderType {
    match config.map(|config| config.folder_type) {
        Some(FolderType::Category) => FolderType::Category,
        Some(FolderType::Package) => FolderType::Package,
        _ => detect_folder_type(dir),
    }
}
