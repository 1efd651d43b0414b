//! Drives the `linkmaster` binary against a throwaway data directory.

use serde_json::Value;
use std::{fs, path::Path, process::Command};
use tempfile::TempDir;

fn linkmaster(data: &Path, args: &[&str]) -> (bool, String, String) {
    let output = Command::new(env!("CARGO_BIN_EXE_linkmaster"))
        .args(args)
        .env("LINKMASTER_DATA_DIR", data)
        .env_remove("RUST_LOG")
        .output()
        .expect("run linkmaster");
    (
        output.status.success(),
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
    )
}

fn json(data: &Path, args: &[&str]) -> Value {
    let mut full = vec!["--format", "json"];
    full.extend_from_slice(args);
    let (ok, stdout, stderr) = linkmaster(data, &full);
    assert!(ok, "linkmaster {args:?} failed: {stderr}");
    serde_json::from_str(&stdout).unwrap_or_else(|err| panic!("bad json {stdout:?}: {err}"))
}

struct Setup {
    dir: TempDir,
}

impl Setup {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let sword = dir.path().join("mods").join("Weapons").join("Sword");
        fs::create_dir_all(&sword).unwrap();
        fs::write(sword.join("sword.pak"), b"blade").unwrap();
        fs::create_dir_all(dir.path().join("game")).unwrap();
        let setup = Self { dir };
        let mods = setup.path("mods");
        let game = setup.path("game");
        let (ok, _, stderr) = linkmaster(&setup.data(), &["app", "add", "Game", &mods, &game]);
        assert!(ok, "app add failed: {stderr}");
        setup
    }

    fn path(&self, name: &str) -> String {
        self.dir.path().join(name).display().to_string()
    }

    fn data(&self) -> std::path::PathBuf {
        self.dir.path().join("data")
    }
}

#[test]
fn help_and_version_need_no_data_dir() {
    let dir = TempDir::new().unwrap();
    let (ok, stdout, _) = linkmaster(dir.path(), &["--help"]);
    assert!(ok);
    assert!(stdout.contains("deploy <folder>"));
    let (ok, stdout, _) = linkmaster(dir.path(), &["--version"]);
    assert!(ok);
    assert!(stdout.starts_with("linkmaster v"));
    let (ok, _, _) = linkmaster(dir.path(), &["frobnicate"]);
    assert!(!ok);
}

#[test]
fn apps_lists_the_active_app() {
    let setup = Setup::new();
    let apps = json(&setup.data(), &["apps"]);
    assert_eq!(apps[0]["name"], "Game");
    assert_eq!(apps[0]["active"], true);
    assert!(setup.data().join("config.json").is_file());
    assert!(setup.data().join("logs").is_dir());
}

#[test]
fn deploy_status_and_unlink_round_trip() {
    let setup = Setup::new();
    let data = setup.data();
    json(&data, &["set", "Weapons/Sword", "transfer_mode", "copy"]);

    let report = json(&data, &["--yes", "deploy", "Weapons/Sword"]);
    assert_eq!(report["deployed"], true);
    assert_eq!(report["status"], "linked");
    assert!(setup.dir.path().join("game").join("Sword").join("sword.pak").is_file());

    let status = json(&data, &["status", "Weapons/Sword"]);
    assert_eq!(status["status"], "linked");
    assert_eq!(status["type"], "mirror");

    let unlinked = json(&data, &["unlink", "Weapons/Sword"]);
    assert_eq!(unlinked["removed"], 1);
    let status = json(&data, &["status", "Weapons/Sword"]);
    assert_eq!(status["status"], "none");
}

#[test]
fn resolve_show_and_scan() {
    let setup = Setup::new();
    let data = setup.data();

    let resolved = json(&data, &["resolve", "Weapons/Sword"]);
    assert_eq!(resolved["deploy_rule"], "folder");
    assert!(resolved["target"].as_str().unwrap().ends_with("Sword"));

    json(&data, &["set", "Weapons/Sword", "conflict_tag", "blade"]);
    let shown = json(&data, &["show", "Weapons/Sword"]);
    assert_eq!(shown["config"]["conflict_tag"], "blade");

    let panes = json(&data, &["scan", "Weapons"]);
    assert_eq!(panes["categories"][0]["name"], "Weapons");
    assert_eq!(panes["categories"][0]["folder_type"], "category");
    assert_eq!(panes["packages"][0]["rel"], "Weapons/Sword");
    assert_eq!(panes["packages"][0]["folder_type"], "package");

    let (ok, _, _) = linkmaster(&data, &["set", "Weapons/Sword", "transfer_mode", "teleport"]);
    assert!(!ok);
}

#[test]
fn probe_reports_a_verdict() {
    let setup = Setup::new();
    let game = setup.path("game");
    let report = json(&setup.data(), &["probe", &game]);
    assert!(report["symlinks"].is_boolean());
}
