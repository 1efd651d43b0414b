//! Background folder scans for the two browsing panes.
//!
//! Workers read a snapshot of the folder store and report over a channel.
//! Every request carries a [`ScanStamp`]; the receiving side keeps a
//! [`ScanFence`] and drops any batch whose stamp is no longer current, so a
//! slow scan of a previous app can never overwrite a newer view.

use crate::{
    config::AppProfile,
    heuristic::effective_folder_type,
    rules::{FolderType, LinkStatus, TargetKey},
    status::{probe_folder, LinkState},
    store::{normalize_key, FolderConfig},
};
use anyhow::{Context, Result};
use serde::Serialize;
use std::{
    collections::BTreeMap,
    fs,
    sync::mpsc::{Receiver, RecvTimeoutError, Sender},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanStamp {
    pub app_id: String,
    pub generation: u64,
}

#[derive(Debug, Default)]
pub struct ScanFence {
    generation: u64,
    current: Option<ScanStamp>,
}

impl ScanFence {
    /// Starts a new scan generation for `app_id`, invalidating older stamps.
    pub fn begin(&mut self, app_id: &str) -> ScanStamp {
        self.generation = self.generation.wrapping_add(1);
        let stamp = ScanStamp {
            app_id: app_id.to_string(),
            generation: self.generation,
        };
        self.current = Some(stamp.clone());
        stamp
    }

    pub fn accepts(&self, stamp: &ScanStamp) -> bool {
        self.current.as_ref() == Some(stamp)
    }

    pub fn cancel(&mut self) {
        self.current = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanPane {
    Categories,
    Packages,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanEntry {
    pub name: String,
    pub rel: String,
    pub folder_type: FolderType,
    pub cached_status: Option<LinkStatus>,
    pub probed: Option<LinkState>,
}

impl ScanEntry {
    /// Probed status when available, else the cached one.
    pub fn status(&self) -> LinkStatus {
        self.probed
            .map(|state| state.status)
            .or(self.cached_status)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanBatch {
    pub stamp: ScanStamp,
    pub pane: ScanPane,
    pub parent: String,
    pub entries: Vec<ScanEntry>,
}

#[derive(Debug, Clone)]
pub enum ScanMessage {
    Finished(ScanBatch),
    Failed {
        stamp: ScanStamp,
        pane: ScanPane,
        error: String,
    },
}

impl ScanMessage {
    pub fn stamp(&self) -> &ScanStamp {
        match self {
            ScanMessage::Finished(batch) => &batch.stamp,
            ScanMessage::Failed { stamp, .. } => stamp,
        }
    }
}

/// Everything a worker needs; owned so it can move into the thread.
#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub app: AppProfile,
    pub active: TargetKey,
    pub folders: BTreeMap<String, FolderConfig>,
    pub category: Option<String>,
    pub probe: bool,
}

/// Lists the direct subfolders of `parent` (storage-relative, `""` for the
/// storage root), sorted case-insensitively.
pub fn scan_folder(
    app: &AppProfile,
    active: TargetKey,
    folders: &BTreeMap<String, FolderConfig>,
    parent: &str,
    probe: bool,
) -> Result<Vec<ScanEntry>> {
    let parent = normalize_key(parent);
    let dir = app.source_path(&parent);
    let read = fs::read_dir(&dir).with_context(|| format!("read {}", dir.display()))?;

    let mut entries = Vec::new();
    for entry in read {
        let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
        let is_dir = entry.file_type().map(|kind| kind.is_dir()).unwrap_or(false);
        if !is_dir {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        let rel = if parent.is_empty() {
            name.clone()
        } else {
            format!("{parent}/{name}")
        };
        let config = folders.get(&rel);
        let folder_type = effective_folder_type(config, &entry.path());
        let probed = probe.then(|| {
            let fallback = FolderConfig::default();
            probe_folder(app, active, &rel, config.unwrap_or(&fallback))
        });
        entries.push(ScanEntry {
            name,
            rel,
            folder_type,
            cached_status: config.and_then(|config| config.last_known_status),
            probed,
        });
    }
    entries.sort_by(|a, b| {
        a.name
            .to_ascii_lowercase()
            .cmp(&b.name.to_ascii_lowercase())
            .then_with(|| a.name.cmp(&b.name))
    });
    Ok(entries)
}

fn spawn_pane(
    request: ScanRequest,
    stamp: ScanStamp,
    pane: ScanPane,
    parent: String,
    tx: Sender<ScanMessage>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        debug!("scan {:?} of {:?} started", pane, parent);
        let message = match scan_folder(
            &request.app,
            request.active,
            &request.folders,
            &parent,
            request.probe,
        ) {
            Ok(entries) => ScanMessage::Finished(ScanBatch {
                stamp,
                pane,
                parent,
                entries,
            }),
            Err(err) => ScanMessage::Failed {
                stamp,
                pane,
                error: format!("{err:#}"),
            },
        };
        let _ = tx.send(message);
    })
}

/// Starts the categories and packages scans in parallel. The packages pane
/// is only scanned when `request.category` names a folder.
pub fn spawn_scan_pair(
    request: ScanRequest,
    stamp: ScanStamp,
    tx: Sender<ScanMessage>,
) -> Vec<JoinHandle<()>> {
    let mut handles = vec![spawn_pane(
        request.clone(),
        stamp.clone(),
        ScanPane::Categories,
        String::new(),
        tx.clone(),
    )];
    if let Some(category) = request.category.clone() {
        handles.push(spawn_pane(
            request,
            stamp,
            ScanPane::Packages,
            normalize_key(&category),
            tx,
        ));
    }
    handles
}

#[derive(Debug, Default, Serialize)]
pub struct PaneResults {
    pub categories: Option<Vec<ScanEntry>>,
    pub packages: Option<Vec<ScanEntry>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// Drains `rx` until `expected` current batches arrived or `timeout` ran out.
/// Stale messages are dropped.
pub fn collect_panes(
    rx: &Receiver<ScanMessage>,
    fence: &ScanFence,
    expected: usize,
    timeout: Duration,
) -> PaneResults {
    let deadline = Instant::now() + timeout;
    let mut results = PaneResults::default();
    let mut received = 0usize;
    while received < expected {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let message = match rx.recv_timeout(remaining) {
            Ok(message) => message,
            Err(RecvTimeoutError::Timeout) => {
                warn!("scan timed out with {received}/{expected} pane(s)");
                break;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };
        if !fence.accepts(message.stamp()) {
            debug!("dropping stale scan result {:?}", message.stamp());
            continue;
        }
        received += 1;
        match message {
            ScanMessage::Finished(batch) => match batch.pane {
                ScanPane::Categories => results.categories = Some(batch.entries),
                ScanPane::Packages => results.packages = Some(batch.entries),
            },
            ScanMessage::Failed { pane, error, .. } => {
                warn!("scan of {:?} failed: {error}", pane);
                results.errors.push(error);
            }
        }
    }
    results
}
