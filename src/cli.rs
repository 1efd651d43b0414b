use crate::{
    config::{AppConfig, AppProfile},
    deploy::{probe_symlink_support, AutoAnswer, Confirm, Decision, DeployOutcome, LinkEngine},
    logging,
    rules::{
        ConflictPolicy, ConflictScope, DeployRule, DeploymentRules, FolderType, TargetKey,
        TargetSelection, TransferMode,
    },
    scan::{collect_panes, spawn_scan_pair, ScanEntry, ScanFence, ScanRequest},
    store::{normalize_key, FolderConfig},
};
use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::{
    io::{self, BufRead, Write},
    path::{Path, PathBuf},
    sync::mpsc,
    time::Duration,
};
use tracing::debug;

const SCAN_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "json" => Some(OutputFormat::Json),
            "text" => Some(OutputFormat::Text),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct GlobalOptions {
    format: OutputFormat,
    app: Option<String>,
    target: Option<TargetKey>,
    answer: Option<bool>,
    verbosity: i8,
}

impl Default for GlobalOptions {
    fn default() -> Self {
        Self {
            format: OutputFormat::Text,
            app: None,
            target: None,
            answer: None,
            verbosity: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliCommand {
    AppsList,
    AppAdd {
        name: String,
        storage: PathBuf,
        targets: Vec<PathBuf>,
    },
    AppUse(String),
    Deploy(String),
    Unlink(String),
    Status(String),
    Resolve(String),
    Scan(Option<String>),
    Set {
        rel: String,
        field: String,
        value: String,
    },
    Show(String),
    Probe(PathBuf),
    Help,
    Version,
}

pub fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (global, command) = parse_args(&args)?;
    match command {
        CliCommand::Help => {
            print_help();
            Ok(())
        }
        CliCommand::Version => {
            println!("linkmaster v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        command => {
            let mut config = AppConfig::load_or_create()?;
            let _guard = match logging::init(&config.log_dir(), global.verbosity) {
                Ok(guard) => Some(guard),
                Err(err) => {
                    eprintln!("Warning: logging disabled: {err:#}");
                    None
                }
            };
            run_command(&mut config, command, &global)
        }
    }
}

fn parse_args(args: &[String]) -> Result<(GlobalOptions, CliCommand)> {
    let (global, tokens) = parse_global_options(args)?;
    let command = parse_subcommand(&tokens)?;
    Ok((global, command))
}

fn parse_global_options(args: &[String]) -> Result<(GlobalOptions, Vec<String>)> {
    let mut global = GlobalOptions::default();
    let mut tokens = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let (flag, inline) = match arg.split_once('=') {
            Some((flag, value)) if flag.starts_with("--") => (flag, Some(value.to_string())),
            _ => (arg.as_str(), None),
        };
        let mut value_for = |name: &str| -> Result<String> {
            inline
                .clone()
                .or_else(|| iter.next().cloned())
                .ok_or_else(|| anyhow!("{name} requires a value"))
        };
        match flag {
            "--format" => {
                let value = value_for("--format")?;
                global.format = OutputFormat::parse(&value)
                    .ok_or_else(|| anyhow!("Unknown format: {value} (use text or json)"))?;
            }
            "--app" => global.app = Some(value_for("--app")?),
            "--target" => {
                let value = value_for("--target")?;
                global.target = Some(
                    TargetKey::parse(&value).ok_or_else(|| anyhow!("Unknown target: {value}"))?,
                );
            }
            "--yes" | "-y" => global.answer = Some(true),
            "--no" => global.answer = Some(false),
            "-q" | "--quiet" => global.verbosity = -1,
            "--verbose" => global.verbosity = global.verbosity.max(1),
            _ if flag.starts_with("-v") && flag[1..].chars().all(|ch| ch == 'v') => {
                global.verbosity = (flag.len() - 1).min(3) as i8;
            }
            "--help" | "-h" => tokens.insert(0, "help".to_string()),
            "--version" | "-V" => tokens.insert(0, "version".to_string()),
            _ => tokens.push(arg.to_string()),
        }
    }
    Ok((global, tokens))
}

fn parse_subcommand(tokens: &[String]) -> Result<CliCommand> {
    let Some(head) = tokens.first() else {
        return Ok(CliCommand::Help);
    };
    let arg = |index: usize, what: &str| -> Result<String> {
        tokens
            .get(index)
            .cloned()
            .ok_or_else(|| anyhow!("{head} requires {what}"))
    };
    let command = match head.as_str() {
        "help" => CliCommand::Help,
        "version" => CliCommand::Version,
        "apps" => CliCommand::AppsList,
        "app" => match tokens.get(1).map(String::as_str) {
            Some("add") => {
                let name = arg(2, "a name")?;
                let storage = PathBuf::from(arg(3, "a storage root")?);
                let targets: Vec<PathBuf> = tokens.iter().skip(4).map(PathBuf::from).collect();
                if targets.is_empty() {
                    bail!("app add requires at least one target root");
                }
                if targets.len() > TargetKey::ALL.len() {
                    bail!("app add takes at most {} target roots", TargetKey::ALL.len());
                }
                CliCommand::AppAdd {
                    name,
                    storage,
                    targets,
                }
            }
            Some("use") => CliCommand::AppUse(arg(2, "an app name")?),
            Some(other) => bail!("Unknown app command: {other} (use 'add' or 'use')"),
            None => CliCommand::AppsList,
        },
        "deploy" => CliCommand::Deploy(arg(1, "a folder path")?),
        "unlink" => CliCommand::Unlink(arg(1, "a folder path")?),
        "status" => CliCommand::Status(arg(1, "a folder path")?),
        "resolve" => CliCommand::Resolve(arg(1, "a folder path")?),
        "scan" => CliCommand::Scan(tokens.get(1).cloned()),
        "set" => CliCommand::Set {
            rel: arg(1, "a folder path")?,
            field: arg(2, "a field name")?,
            value: tokens.get(3).cloned().unwrap_or_default(),
        },
        "show" => CliCommand::Show(arg(1, "a folder path")?),
        "probe" => CliCommand::Probe(PathBuf::from(arg(1, "a directory")?)),
        other => bail!("Unknown command: {other} (see --help)"),
    };
    Ok(command)
}

fn run_command(config: &mut AppConfig, command: CliCommand, global: &GlobalOptions) -> Result<()> {
    if let Some(target) = global.target {
        config.active_target = target;
    }
    match command {
        CliCommand::AppsList => list_apps(config, global.format),
        CliCommand::AppAdd {
            name,
            storage,
            targets,
        } => {
            let mut profile = AppProfile::new(name.clone(), storage);
            for (key, root) in TargetKey::ALL.iter().zip(targets) {
                profile = profile.with_target(*key, root);
            }
            config.add_app(profile)?;
            println!("Added app {name}");
            Ok(())
        }
        CliCommand::AppUse(name) => {
            let found = config
                .app(&name)
                .map(|app| app.name.clone())
                .ok_or_else(|| anyhow!("Unknown app: {name}"))?;
            config.active_app = Some(found.clone());
            if let Some(target) = global.target {
                config.active_target = target;
            }
            config.save()?;
            println!("Active app: {found} ({})", config.active_target.label());
            Ok(())
        }
        CliCommand::Probe(dir) => probe_dir(&dir, global.format),
        CliCommand::Help | CliCommand::Version => Ok(()),
        command => {
            let app = resolve_app(config, global.app.as_deref())?.clone();
            let mut engine = LinkEngine::open(config, app, config.active_target)?;
            let mut confirm = confirmer(config, global);
            match command {
                CliCommand::Deploy(rel) => deploy_folder(&mut engine, &rel, confirm.as_mut(), global.format),
                CliCommand::Unlink(rel) => unlink_folder(&mut engine, &rel, confirm.as_mut(), global.format),
                CliCommand::Status(rel) => show_status(&mut engine, &rel, global.format),
                CliCommand::Resolve(rel) => show_resolution(&engine, &rel, global.format),
                CliCommand::Scan(category) => scan_panes(&engine, category, global.format),
                CliCommand::Set { rel, field, value } => {
                    let rel = existing_folder(&engine, &rel)?;
                    let mut result = Ok(());
                    engine
                        .store_mut()
                        .update(&rel, |folder| result = apply_field(folder, &field, &value))?;
                    result?;
                    engine.store_mut().invalidate_status(&rel)?;
                    match global.format {
                        OutputFormat::Json => println!(
                            "{}",
                            serde_json::json!({ "rel": rel, "field": field, "value": value })
                        ),
                        OutputFormat::Text => println!("{rel}: {field} updated"),
                    }
                    Ok(())
                }
                CliCommand::Show(rel) => show_folder(&engine, &rel, global.format),
                _ => Ok(()),
            }
        }
    }
}

fn resolve_app<'a>(config: &'a AppConfig, override_name: Option<&str>) -> Result<&'a AppProfile> {
    if let Some(name) = override_name {
        return config
            .app(name)
            .ok_or_else(|| anyhow!("Unknown app: {name}"));
    }
    config
        .active_app()
        .ok_or_else(|| anyhow!("No active app (add one with 'app add')"))
}

fn existing_folder(engine: &LinkEngine, rel: &str) -> Result<String> {
    let key = normalize_key(rel);
    if key.is_empty() || !engine.app().source_path(&key).is_dir() {
        bail!("No folder named {rel:?} under {}", engine.app().storage_root.display());
    }
    Ok(key)
}

/// Asks on stderr and reads a `y`/`n` answer from stdin.
struct StdinConfirm;

impl Confirm for StdinConfirm {
    fn confirm(&mut self, decision: &Decision) -> bool {
        eprint!("{} [y/N] ", decision.prompt());
        let _ = io::stderr().flush();
        let mut line = String::new();
        if io::stdin().lock().read_line(&mut line).is_err() {
            return false;
        }
        matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes")
    }
}

fn confirmer(config: &AppConfig, global: &GlobalOptions) -> Box<dyn Confirm> {
    match global.answer {
        Some(answer) => Box::new(AutoAnswer(answer)),
        None if !config.confirm_decisions => Box::new(AutoAnswer(true)),
        None => Box::new(StdinConfirm),
    }
}

#[derive(Serialize)]
struct AppListItem {
    name: String,
    storage_root: String,
    targets: Vec<(String, String)>,
    active: bool,
}

fn list_apps(config: &AppConfig, format: OutputFormat) -> Result<()> {
    let active = config.active_app().map(|app| app.name.clone());
    let items: Vec<AppListItem> = config
        .apps
        .iter()
        .map(|app| AppListItem {
            name: app.name.clone(),
            storage_root: app.storage_root.display().to_string(),
            targets: TargetKey::ALL
                .iter()
                .filter_map(|key| {
                    app.target_root(*key)
                        .map(|root| (key.label().to_string(), root.display().to_string()))
                })
                .collect(),
            active: active.as_deref() == Some(app.name.as_str()),
        })
        .collect();

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&items)?),
        OutputFormat::Text => {
            if items.is_empty() {
                println!("No apps configured.");
            }
            for item in items {
                let marker = if item.active { "*" } else { " " };
                println!("{marker} {} ({})", item.name, item.storage_root);
                for (key, root) in item.targets {
                    println!("    {key:<9} {root}");
                }
            }
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct DeployReport {
    rel: String,
    deployed: bool,
    target: Option<String>,
    status: Option<String>,
    dependencies: Vec<String>,
    backups: Vec<String>,
    declined: Option<String>,
    link_mode: &'static str,
}

fn deploy_folder(
    engine: &mut LinkEngine,
    rel: &str,
    confirm: &mut dyn Confirm,
    format: OutputFormat,
) -> Result<()> {
    let rel = existing_folder(engine, rel)?;
    let outcome = engine
        .try_deploy(&rel, confirm)
        .with_context(|| format!("deploy {rel}"))?;
    let report = match outcome {
        DeployOutcome::Deployed {
            target,
            state,
            dependencies,
            backups,
        } => DeployReport {
            rel,
            deployed: true,
            target: Some(target.display().to_string()),
            status: Some(state.status.label().to_string()),
            dependencies,
            backups: backups.iter().map(|path| path.display().to_string()).collect(),
            declined: None,
            link_mode: engine.link_mode_summary(),
        },
        DeployOutcome::Declined(decision) => DeployReport {
            rel,
            deployed: false,
            target: None,
            status: None,
            dependencies: Vec::new(),
            backups: Vec::new(),
            declined: Some(decision.prompt()),
            link_mode: engine.link_mode_summary(),
        },
    };

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => {
            if let Some(reason) = &report.declined {
                println!("Not deployed: {reason}");
                return Ok(());
            }
            for dep in &report.dependencies {
                println!("Deployed dependency {dep}");
            }
            for backup in &report.backups {
                println!("Backed up {backup}");
            }
            println!(
                "Deployed {} -> {} [{}, {}]",
                report.rel,
                report.target.as_deref().unwrap_or("-"),
                report.status.as_deref().unwrap_or("-"),
                report.link_mode
            );
        }
    }
    Ok(())
}

fn unlink_folder(
    engine: &mut LinkEngine,
    rel: &str,
    confirm: &mut dyn Confirm,
    format: OutputFormat,
) -> Result<()> {
    let rel = normalize_key(rel);
    let outcome = engine
        .try_unlink(&rel, confirm)
        .with_context(|| format!("unlink {rel}"))?;
    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::json!({
                "rel": rel,
                "removed": outcome.removed,
                "cascaded": outcome.cascaded,
            })
        ),
        OutputFormat::Text => {
            println!("Unlinked {rel} ({} artifact(s) removed)", outcome.removed);
            for dependent in outcome.cascaded {
                println!("Also unlinked {dependent}");
            }
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct StatusReport {
    rel: String,
    status: String,
    #[serde(rename = "type")]
    kind: String,
    target: Option<String>,
}

fn show_status(engine: &mut LinkEngine, rel: &str, format: OutputFormat) -> Result<()> {
    let rel = normalize_key(rel);
    let state = engine.check_status(&rel);
    if let Err(err) = engine.store_mut().set_status(&rel, state.status) {
        debug!("status of {rel} not cached: {err:#}");
    }
    let report = StatusReport {
        status: state.status.label().to_string(),
        kind: state.kind.label().to_string(),
        target: engine
            .target_path(&rel)
            .map(|path| path.display().to_string()),
        rel,
    };
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => println!(
            "{}: {} ({}) at {}",
            report.rel,
            report.status,
            report.kind,
            report.target.as_deref().unwrap_or("<no target>")
        ),
    }
    Ok(())
}

#[derive(Serialize)]
struct ResolutionReport {
    rel: String,
    source: String,
    target: Option<String>,
    deploy_rule: &'static str,
    transfer_mode: &'static str,
    conflict_policy: &'static str,
    active_target: &'static str,
}

fn show_resolution(engine: &LinkEngine, rel: &str, format: OutputFormat) -> Result<()> {
    let rel = normalize_key(rel);
    let settings = engine.settings(&rel);
    let report = ResolutionReport {
        source: engine.app().source_path(&rel).display().to_string(),
        target: engine
            .target_path(&rel)
            .map(|path| path.display().to_string()),
        deploy_rule: settings.deploy_rule.label(),
        transfer_mode: settings.transfer_mode.label(),
        conflict_policy: settings.conflict_policy.label(),
        active_target: engine.active_target().label(),
        rel,
    };
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => {
            println!("Folder:   {}", report.rel);
            println!("Source:   {}", report.source);
            println!(
                "Target:   {} ({})",
                report.target.as_deref().unwrap_or("<unresolved>"),
                report.active_target
            );
            println!("Rule:     {}", report.deploy_rule);
            println!("Transfer: {}", report.transfer_mode);
            println!("Conflict: {}", report.conflict_policy);
        }
    }
    Ok(())
}

fn scan_panes(engine: &LinkEngine, category: Option<String>, format: OutputFormat) -> Result<()> {
    let (tx, rx) = mpsc::channel();
    let mut fence = ScanFence::default();
    let stamp = fence.begin(&engine.app().slug());
    let expected = if category.is_some() { 2 } else { 1 };
    let request = ScanRequest {
        app: engine.app().clone(),
        active: engine.active_target(),
        folders: engine.store().snapshot(),
        category,
        probe: true,
    };
    let handles = spawn_scan_pair(request, stamp, tx);
    let results = collect_panes(&rx, &fence, expected, SCAN_TIMEOUT);
    for handle in handles {
        let _ = handle.join();
    }

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&results)?),
        OutputFormat::Text => {
            print_pane("Categories", results.categories.as_deref());
            if expected > 1 {
                print_pane("Packages", results.packages.as_deref());
            }
            for error in &results.errors {
                println!("Warning: {error}");
            }
        }
    }
    Ok(())
}

fn print_pane(title: &str, entries: Option<&[ScanEntry]>) {
    println!("{title}:");
    let Some(entries) = entries else {
        println!("  <unavailable>");
        return;
    };
    if entries.is_empty() {
        println!("  <empty>");
    }
    for entry in entries {
        println!(
            "  {:<8} {:<9} {}",
            entry.status().label(),
            entry.folder_type.label(),
            entry.name
        );
    }
}

fn show_folder(engine: &LinkEngine, rel: &str, format: OutputFormat) -> Result<()> {
    let rel = normalize_key(rel);
    let folder = engine.store().get_or_default(&rel);
    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({ "rel": rel, "config": folder }))?
        ),
        OutputFormat::Text => {
            let value = serde_json::to_value(&folder)?;
            println!("{rel}:");
            if let Value::Object(fields) = value {
                for (field, value) in fields {
                    if value.is_null() {
                        continue;
                    }
                    println!("  {field:<18} {value}");
                }
            }
            for artifact in engine.manifest().artifacts(&rel) {
                println!("  deployed           {}", artifact.path.display());
            }
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct ProbeReport {
    dir: String,
    symlinks: bool,
}

fn probe_dir(dir: &Path, format: OutputFormat) -> Result<()> {
    if !dir.is_dir() {
        bail!("Not a directory: {}", dir.display());
    }
    let report = ProbeReport {
        dir: dir.display().to_string(),
        symlinks: probe_symlink_support(dir),
    };
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => {
            let verdict = if report.symlinks {
                "supported"
            } else {
                "unavailable (deploys fall back to copy)"
            };
            println!("Symlinks in {}: {verdict}", report.dir);
        }
    }
    Ok(())
}

fn is_inherit(value: &str) -> bool {
    let value = value.trim();
    value.is_empty() || value.eq_ignore_ascii_case("inherit")
}

fn parse_choice<T>(field: &str, value: &str, parse: fn(&str) -> Option<T>) -> Result<Option<T>> {
    if is_inherit(value) {
        return Ok(None);
    }
    parse(value.trim())
        .map(Some)
        .ok_or_else(|| anyhow!("Invalid {field}: {value}"))
}

fn optional_text(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Applies one `set <rel> <field> <value>` edit. An empty value or
/// `inherit` clears optional fields.
fn apply_field(folder: &mut FolderConfig, field: &str, value: &str) -> Result<()> {
    match field {
        "folder_type" => {
            folder.folder_type =
                parse_choice(field, value, FolderType::parse)?.unwrap_or_default();
        }
        "deploy_rule" => folder.deploy_rule = parse_choice(field, value, DeployRule::parse)?,
        "deploy_type" => folder.deploy_type = parse_choice(field, value, DeployRule::parse)?,
        "transfer_mode" => {
            folder.transfer_mode = parse_choice(field, value, TransferMode::parse)?;
        }
        "conflict_policy" => {
            folder.conflict_policy = parse_choice(field, value, ConflictPolicy::parse)?;
        }
        "target_selection" => {
            folder.target_selection = parse_choice(field, value, TargetSelection::parse)?;
        }
        "target_override" => folder.target_override = optional_text(value).map(PathBuf::from),
        "conflict_tag" => folder.conflict_tag = optional_text(value),
        "conflict_scope" => {
            folder.conflict_scope =
                parse_choice(field, value, ConflictScope::parse)?.unwrap_or_default();
        }
        "is_library" => {
            folder.is_library = match value.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => true,
                "false" | "no" | "0" | "" => false,
                _ => bail!("Invalid is_library: {value} (use true or false)"),
            };
        }
        "lib_name" => folder.lib_name = optional_text(value),
        "lib_version" => folder.lib_version = optional_text(value),
        "lib_priority" => {
            folder.lib_priority = if value.trim().is_empty() {
                0
            } else {
                value
                    .trim()
                    .parse()
                    .with_context(|| format!("Invalid lib_priority: {value}"))?
            };
        }
        "lib_deps" => {
            folder.lib_deps = match optional_text(value) {
                None => None,
                Some(text) => Some(
                    serde_json::from_str(&text)
                        .unwrap_or_else(|_| Value::String(text)),
                ),
            };
        }
        "deployment_rules" => {
            folder.deployment_rules = match optional_text(value) {
                None => None,
                Some(text) => {
                    let parsed: Value = serde_json::from_str(&text)
                        .with_context(|| format!("Invalid deployment_rules JSON: {text}"))?;
                    serde_json::from_value::<DeploymentRules>(parsed.clone())
                        .with_context(|| format!("Invalid deployment_rules: {text}"))?;
                    Some(parsed)
                }
            };
        }
        _ => bail!("Unknown field: {field}"),
    }
    Ok(())
}

fn print_help() {
    println!("linkmaster v{}", env!("CARGO_PKG_VERSION"));
    println!("Usage:");
    println!("  linkmaster apps                              List apps");
    println!("  linkmaster app add <name> <storage> <a> [b] [c]");
    println!("                                               Add an app with up to three targets");
    println!("  linkmaster app use <name>                    Make an app active");
    println!("  linkmaster deploy <folder>                   Deploy a folder and its libraries");
    println!("  linkmaster unlink <folder>                   Remove a folder's deployment");
    println!("  linkmaster status <folder>                   Probe a folder's link status");
    println!("  linkmaster resolve <folder>                  Show target path and settings");
    println!("  linkmaster scan [category]                   List categories and packages");
    println!("  linkmaster set <folder> <field> <value>      Edit a folder setting");
    println!("  linkmaster show <folder>                     Show a folder's settings");
    println!("  linkmaster probe <dir>                       Check symlink support in a directory");
    println!();
    println!("Global options:");
    println!("  --app <name>                                 App to act on (default: active)");
    println!("  --target <a|b|c>                             Active target root");
    println!("  --format <json|text>                         Output format");
    println!("  -y, --yes / --no                             Answer confirmations without asking");
    println!("  -q, -v, -vv                                  Log verbosity (RUST_LOG overrides)");
    println!("  -h, --help                                   Show help");
    println!("  -V, --version                                Show version");
}
