use crate::core::{DownloadConfig, OsScripting};
use crate::types::DownloadedFile;
use crate::utils::Poller;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::debug;

/// Partial-download suffixes written by Safari and other browsers.
pub const TEMP_SUFFIXES: [&str; 4] = [".download", ".crdownload", ".part", ".tmp"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    pub size: u64,
    pub modified: Option<SystemTime>,
}

pub type DownloadSnapshot = HashMap<PathBuf, FileStamp>;

/// Watches the download folders for completed files.
///
/// The first refresh only records a baseline. Later refreshes report paths
/// that were not in the previous snapshot; each path is handed out once for
/// the lifetime of the tracker.
#[derive(Debug)]
pub struct DownloadTracker {
    configured: Option<PathBuf>,
    include_system_folders: bool,
    poll_interval: Duration,
    recent_limit: usize,
    os_folder: Option<PathBuf>,
    os_folder_checked: bool,
    snapshot: Option<DownloadSnapshot>,
    downloaded: Vec<PathBuf>,
}

impl DownloadTracker {
    pub fn new(config: &DownloadConfig) -> Self {
        Self {
            configured: config.downloads_path.clone(),
            include_system_folders: config.include_system_folders,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            recent_limit: config.recent_downloads_limit,
            os_folder: None,
            os_folder_checked: false,
            snapshot: None,
            downloaded: Vec::new(),
        }
    }

    pub fn downloaded_files(&self) -> &[PathBuf] {
        &self.downloaded
    }

    pub fn has_baseline(&self) -> bool {
        self.snapshot.is_some()
    }

    /// Asks Safari for its configured downloads folder, once per session.
    pub async fn discover_os_folder(&mut self, os: &dyn OsScripting) {
        if self.os_folder_checked || !self.include_system_folders {
            return;
        }
        self.os_folder_checked = true;
        self.os_folder = match os.downloads_folder().await {
            Ok(folder) => folder.filter(|path| !path.as_os_str().is_empty()),
            Err(err) => {
                debug!(error = %err, "AppleScript downloads folder unavailable");
                None
            }
        };
    }

    /// Candidate folders, deduplicated by resolved path.
    pub fn directories(&self) -> Vec<PathBuf> {
        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Some(path) = &self.configured {
            candidates.push(expand_home(path));
        }
        if self.include_system_folders {
            if let Some(path) = &self.os_folder {
                candidates.push(expand_home(path));
            }
            if let Some(home) = dirs::home_dir() {
                candidates.push(home.join("Downloads"));
            }
        }

        let mut result: Vec<PathBuf> = Vec::new();
        for candidate in candidates {
            let resolved = std::fs::canonicalize(&candidate).unwrap_or(candidate);
            if !result.contains(&resolved) {
                result.push(resolved);
            }
        }
        result
    }

    pub async fn take_baseline(&mut self) {
        self.snapshot = Some(snapshot_directories(&self.directories()).await);
    }

    /// Diffs the folders against the last snapshot and returns new paths,
    /// sorted. With `wait_for_new`, keeps polling until something appears
    /// or `timeout` passes, consulting Safari's recent-download list on
    /// every empty poll.
    pub async fn refresh(
        &mut self,
        os: &dyn OsScripting,
        wait_for_new: bool,
        timeout: Duration,
    ) -> Vec<PathBuf> {
        let Some(previous) = self.snapshot.take() else {
            self.take_baseline().await;
            return Vec::new();
        };

        let directories = self.directories();
        let mut poller = Poller::new(timeout, self.poll_interval);
        let (current, mut new_paths) = loop {
            let mut current = snapshot_directories(&directories).await;
            let mut new_paths: Vec<PathBuf> = current
                .keys()
                .filter(|path| !previous.contains_key(*path))
                .cloned()
                .collect();
            if new_paths.is_empty() && wait_for_new {
                if let Err(err) = os.show_downloads_ui().await {
                    debug!(error = %err, "could not open the downloads list");
                }
                new_paths.extend(self.fold_recent_downloads(os, &mut current).await);
            }
            if !new_paths.is_empty() || !wait_for_new {
                break (current, new_paths);
            }
            if !poller.tick().await {
                break (current, new_paths);
            }
        };

        self.snapshot = Some(current);
        new_paths.sort();
        new_paths
    }

    async fn fold_recent_downloads(
        &self,
        os: &dyn OsScripting,
        snapshot: &mut DownloadSnapshot,
    ) -> Vec<PathBuf> {
        let entries = match os.recent_downloads(self.recent_limit).await {
            Ok(entries) => entries,
            Err(err) => {
                debug!(error = %err, "AppleScript recent-download sync unavailable");
                return Vec::new();
            }
        };

        let mut found = Vec::new();
        for entry in entries {
            let normalized = normalize_path(&entry).await;
            if snapshot.contains_key(&normalized) {
                continue;
            }
            let Ok(metadata) = tokio::fs::metadata(&normalized).await else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            snapshot.insert(normalized.clone(), stamp(&metadata));
            found.push(normalized);
        }
        found
    }

    /// Adds `path` to the lifetime list; `false` when it was already there.
    pub async fn remember(&mut self, path: &Path) -> bool {
        let normalized = normalize_path(path).await;
        if self.downloaded.contains(&normalized) {
            return false;
        }
        self.downloaded.push(normalized);
        true
    }

    /// Records a completed download and describes it, once per path.
    /// The source URL is left for the caller to fill in.
    pub async fn record(&mut self, path: &Path) -> Option<DownloadedFile> {
        let normalized = normalize_path(path).await;
        if self.downloaded.contains(&normalized) {
            return None;
        }
        self.downloaded.push(normalized.clone());

        let size = tokio::fs::metadata(&normalized)
            .await
            .map(|metadata| metadata.len())
            .unwrap_or(0);
        Some(DownloadedFile {
            url: String::new(),
            file_name: file_name(&normalized),
            file_type: file_type(&normalized),
            size,
            path: normalized,
            completed_at: chrono::Utc::now(),
        })
    }

    pub fn reset(&mut self) {
        self.snapshot = None;
        self.os_folder = None;
        self.os_folder_checked = false;
    }
}

async fn snapshot_directories(directories: &[PathBuf]) -> DownloadSnapshot {
    let mut snapshot = DownloadSnapshot::new();
    for directory in directories {
        let Ok(mut entries) = tokio::fs::read_dir(directory).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_lowercase();
            if name == ".ds_store" || TEMP_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)) {
                continue;
            }
            let Ok(metadata) = tokio::fs::metadata(&path).await else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            let resolved = tokio::fs::canonicalize(&path).await.unwrap_or(path);
            snapshot.insert(resolved, stamp(&metadata));
        }
    }
    snapshot
}

fn stamp(metadata: &std::fs::Metadata) -> FileStamp {
    FileStamp {
        size: metadata.len(),
        modified: metadata.modified().ok(),
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

/// Absolute, symlink-resolved form used as the dedup key.
pub async fn normalize_path(path: &Path) -> PathBuf {
    let expanded = expand_home(path);
    if let Ok(resolved) = tokio::fs::canonicalize(&expanded).await {
        return resolved;
    }
    if expanded.is_absolute() {
        expanded
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(&expanded))
            .unwrap_or(expanded)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Lowercase extension without the dot.
pub fn file_type(path: &Path) -> Option<String> {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .filter(|ext| !ext.is_empty())
}
