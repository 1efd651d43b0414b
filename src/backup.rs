use crate::error::{DeployResult, IoContext};
use std::{
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
};
use time::{macros::format_description, OffsetDateTime};
use tracing::info;

/// Suffix appended to entries moved aside by the `backup` conflict policy.
pub fn backup_stamp(now: OffsetDateTime) -> String {
    let format = format_description!("[year][month][day]_[hour][minute][second]");
    now.format(&format)
        .unwrap_or_else(|_| now.unix_timestamp().to_string())
}

/// First free `<name>.bak_<stamp>` (then `.bak_<stamp>_N`) beside `path`.
pub fn backup_path_for(path: &Path, stamp: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_else(|| OsString::from("target"));
    let parent = path.parent().unwrap_or_else(|| Path::new(""));

    let mut candidate_name = name.clone();
    candidate_name.push(format!(".bak_{stamp}"));
    let mut candidate = parent.join(&candidate_name);
    let mut counter = 1u32;
    while fs::symlink_metadata(&candidate).is_ok() {
        let mut numbered = name.clone();
        numbered.push(format!(".bak_{stamp}_{counter}"));
        candidate = parent.join(numbered);
        counter += 1;
    }
    candidate
}

/// Moves whatever sits at `path` aside and returns where it went.
pub fn move_aside(path: &Path) -> DeployResult<PathBuf> {
    let dest = backup_path_for(path, &backup_stamp(OffsetDateTime::now_utc()));
    fs::rename(path, &dest).at("back up", path)?;
    info!("backed up {:?} -> {:?}", path, dest);
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use time::macros::datetime;

    #[test]
    fn stamp_format() {
        let stamp = backup_stamp(datetime!(2024-03-05 07:08:09 UTC));
        assert_eq!(stamp, "20240305_070809");
    }

    #[test]
    fn backup_names_do_not_collide() {
        let dir = TempDir::new().unwrap();
        let original = dir.path().join("Sword");
        fs::create_dir_all(&original).unwrap();
        fs::create_dir_all(dir.path().join("Sword.bak_20240305_070809")).unwrap();

        let path = backup_path_for(&original, "20240305_070809");
        assert_eq!(path, dir.path().join("Sword.bak_20240305_070809_1"));
    }

    #[test]
    fn move_aside_frees_the_path() {
        let dir = TempDir::new().unwrap();
        let original = dir.path().join("readme.txt");
        fs::write(&original, b"keep me").unwrap();

        let moved = move_aside(&original).unwrap();
        assert!(!original.exists());
        assert_eq!(fs::read(&moved).unwrap(), b"keep me");
        assert!(moved
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("readme.txt.bak_"));
    }
}
