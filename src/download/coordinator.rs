// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::join_all;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use url::Url;

use crate::catalog::Catalog;
use crate::error::DownloadError;
use crate::store::{Episode, EpisodeId};

use super::filename::storage_filename;
use super::probe::DurationProbe;
use super::state::{DownloadState, StateCells};
use super::transfer::{TaskId, TransferBackend, TransferEvent, TransferRequest};

const STAGING_DIR: &str = ".staging";
const PARTIAL_SUFFIX: &str = "partial";

/// Result of [`DownloadCoordinator::start_download`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started(TaskId),
    AlreadyDownloaded,
    AlreadyActive,
    /// The enclosure URL is malformed; logged and dropped
    InvalidUrl,
}

/// Result of [`DownloadCoordinator::delete_all_downloads`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteSummary {
    pub removed: usize,
    pub failed: usize,
}

#[derive(Clone)]
struct ActiveTransfer {
    episode: EpisodeId,
    destination: PathBuf,
}

#[derive(Default)]
struct ActiveTransfers {
    by_task: HashMap<TaskId, ActiveTransfer>,
    by_episode: HashMap<EpisodeId, TaskId>,
}

impl ActiveTransfers {
    fn finish(&mut self, task: TaskId) -> Option<ActiveTransfer> {
        let transfer = self.by_task.remove(&task)?;
        self.by_episode.remove(&transfer.episode);
        Some(transfer)
    }
}

/// Drives episode transfers and owns their derived download state.
///
/// The presence of an episode's file in the downloads directory is the only
/// durable record of it being downloaded; everything else lives in memory.
pub struct DownloadCoordinator {
    dir: PathBuf,
    staging: PathBuf,
    extension: String,
    catalog: Arc<Catalog>,
    backend: Arc<dyn TransferBackend>,
    probe: Arc<dyn DurationProbe>,
    states: StateCells,
    active: Mutex<ActiveTransfers>,
    next_task: AtomicU64,
}

impl DownloadCoordinator {
    /// Create the coordinator, preparing the downloads directory.
    ///
    /// Failing to create the directory is fatal. Leftovers of transfers
    /// interrupted by a previous run are removed.
    pub fn new(
        dir: impl Into<PathBuf>,
        extension: &str,
        catalog: Arc<Catalog>,
        backend: Arc<dyn TransferBackend>,
        probe: Arc<dyn DurationProbe>,
    ) -> Result<Self, DownloadError> {
        let dir = dir.into();
        let staging = dir.join(STAGING_DIR);

        for path in [&dir, &staging] {
            std::fs::create_dir_all(path).map_err(|e| DownloadError::DirectoryInit {
                path: path.clone(),
                source: e,
            })?;
        }

        let cleaned = remove_stale_files(&dir, &staging);
        if cleaned > 0 {
            info!(count = cleaned, "removed leftovers of interrupted downloads");
        }

        Ok(Self {
            dir,
            staging,
            extension: extension.to_string(),
            catalog,
            backend,
            probe,
            states: StateCells::new(),
            active: Mutex::new(ActiveTransfers::default()),
            next_task: AtomicU64::new(1),
        })
    }

    pub fn downloads_dir(&self) -> &Path {
        &self.dir
    }

    /// Deterministic location of an episode's file
    pub fn download_path(&self, episode: &Episode) -> PathBuf {
        self.dir
            .join(storage_filename(&episode.storage_key(), &self.extension))
    }

    pub fn download_file_exists(&self, episode: &Episode) -> bool {
        self.download_path(episode).is_file()
    }

    /// The episode's file, if it is downloaded
    pub fn local_file(&self, episode: &Episode) -> Option<PathBuf> {
        let path = self.download_path(episode);
        path.is_file().then_some(path)
    }

    /// Observe one episode's download state.
    ///
    /// The hint seeds the state if nobody has observed the episode yet; pass
    /// the result of [`download_file_exists`](Self::download_file_exists)
    /// when it is at hand.
    pub fn watch_state(
        &self,
        episode: EpisodeId,
        file_exists_hint: bool,
    ) -> watch::Receiver<DownloadState> {
        self.states.subscribe(episode, file_exists_hint)
    }

    /// Episodes with a transfer in flight
    pub fn active_transfers(&self) -> Vec<EpisodeId> {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        let mut episodes: Vec<_> = active.by_episode.keys().copied().collect();
        episodes.sort();
        episodes
    }

    /// Start downloading an episode unless it is already present or in flight
    pub fn start_download(&self, episode: &Episode) -> StartOutcome {
        let destination = self.download_path(episode);

        let request = {
            let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);

            if active.by_episode.contains_key(&episode.id) {
                debug!(episode = %episode.id, "transfer already active");
                return StartOutcome::AlreadyActive;
            }
            if destination.is_file() {
                return StartOutcome::AlreadyDownloaded;
            }

            let url = match Url::parse(&episode.enclosure_url) {
                Ok(url) => url,
                Err(e) => {
                    warn!(
                        episode = %episode.id,
                        url = %episode.enclosure_url,
                        error = %e,
                        "not downloading episode with malformed enclosure URL"
                    );
                    return StartOutcome::InvalidUrl;
                }
            };

            let task = TaskId(self.next_task.fetch_add(1, Ordering::Relaxed));
            active.by_task.insert(
                task,
                ActiveTransfer {
                    episode: episode.id,
                    destination,
                },
            );
            active.by_episode.insert(episode.id, task);

            TransferRequest {
                task,
                url,
                staging_path: self
                    .staging
                    .join(format!("{}.{PARTIAL_SUFFIX}", task.0)),
                label: episode.title.clone(),
            }
        };

        let task = request.task;
        self.states.set(episode.id, DownloadState::Downloading);
        info!(episode = %episode.id, task = %task, title = %episode.title, "download started");
        self.backend.begin(request);

        StartOutcome::Started(task)
    }

    /// Process transfer outcomes until the backend goes away
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<TransferEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
        }
        debug!("transfer event channel closed");
    }

    /// Apply one transfer outcome.
    ///
    /// The transfer stays registered as active until its terminal state is
    /// published, so removals skip it while its file is being finalized.
    pub async fn handle_event(&self, event: TransferEvent) {
        let task = event.task();
        let transfer = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .by_task
            .get(&task)
            .cloned();

        let Some(transfer) = transfer else {
            warn!(task = %task, "event for unknown transfer");
            if let TransferEvent::Completed { location, .. } = event {
                let _ = tokio::fs::remove_file(location).await;
            }
            return;
        };

        match event {
            TransferEvent::Completed { location, .. } => {
                let state = self.complete(&transfer, &location).await;
                self.settle(task, state);
            }
            TransferEvent::Failed { error, .. } => {
                warn!(episode = %transfer.episode, task = %task, error = %error, "download failed");
                self.settle(task, DownloadState::Failed);
            }
        }
    }

    /// Publish a terminal state and retire the transfer in one step
    fn settle(&self, task: TaskId, state: DownloadState) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(transfer) = active.finish(task) {
            self.states.set(transfer.episode, state);
        }
    }

    async fn complete(&self, transfer: &ActiveTransfer, location: &Path) -> DownloadState {
        let episode = transfer.episode;

        if let Err(e) = move_into_place(location, &transfer.destination).await {
            warn!(episode = %episode, error = %e, "could not finalize download");
            let _ = tokio::fs::remove_file(location).await;
            return DownloadState::Failed;
        }

        // The file is in place, so the episode is downloaded whatever the
        // probe says. A failed probe keeps the feed-declared duration.
        let probe = self.probe.clone();
        let path = transfer.destination.clone();
        match tokio::task::spawn_blocking(move || probe.probe(&path)).await {
            Ok(Ok(seconds)) if seconds > 0 => {
                if let Err(e) = self.catalog.update_duration(episode, seconds) {
                    warn!(episode = %episode, error = %e, "could not store probed duration");
                }
            }
            Ok(Ok(_)) => debug!(episode = %episode, "probe reported zero duration"),
            Ok(Err(e)) => warn!(episode = %episode, error = %e, "duration probe failed"),
            Err(e) => warn!(episode = %episode, error = %e, "duration probe panicked"),
        }

        info!(episode = %episode, path = %transfer.destination.display(), "download finished");
        DownloadState::Downloaded
    }

    /// Delete an episode's file.
    ///
    /// Returns whether a file was removed. Nothing happens while the episode
    /// is still downloading.
    pub async fn remove_download(&self, episode: &Episode) -> bool {
        let in_flight = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .by_episode
            .contains_key(&episode.id);
        if in_flight {
            debug!(episode = %episode.id, "not removing an episode that is downloading");
            return false;
        }

        let path = self.download_path(episode);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!(episode = %episode.id, "download removed");
                self.states.set(episode.id, DownloadState::NotDownloaded);
                true
            }
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => {
                warn!(episode = %episode.id, path = %path.display(), error = %e, "could not remove download");
                false
            }
        }
    }

    /// Delete every downloaded file concurrently.
    ///
    /// Individual failures are counted, not fatal. Files of transfers still
    /// in flight are left alone. Afterwards every other tracked episode's
    /// state follows its file.
    pub async fn delete_all_downloads(&self) -> DeleteSummary {
        let files = match self.downloaded_files().await {
            Ok(files) => files,
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "could not list downloads");
                Vec::new()
            }
        };
        let files: Vec<PathBuf> = {
            let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
            files
                .into_iter()
                .filter(|path| !active.by_task.values().any(|t| &t.destination == path))
                .collect()
        };

        let results = join_all(files.into_iter().map(|path| async move {
            let result = tokio::fs::remove_file(&path).await;
            if let Err(e) = &result {
                warn!(path = %path.display(), error = %e, "could not delete download");
            }
            result.is_ok()
        }))
        .await;

        let removed = results.iter().filter(|ok| **ok).count();
        let summary = DeleteSummary {
            removed,
            failed: results.len() - removed,
        };

        {
            let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
            for id in self.states.tracked() {
                if active.by_episode.contains_key(&id) {
                    continue;
                }
                let present = self
                    .catalog
                    .episode(id)
                    .is_some_and(|episode| self.download_file_exists(&episode));
                self.states.set(id, DownloadState::from_presence(present));
            }
        }

        info!(removed = summary.removed, failed = summary.failed, "deleted all downloads");
        summary
    }

    async fn downloaded_files(&self) -> std::io::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let hidden = entry.file_name().to_string_lossy().starts_with('.');
            if !hidden && entry.file_type().await?.is_file() {
                files.push(path);
            }
        }
        Ok(files)
    }
}

/// Move a finished transfer to its destination without ever exposing a
/// half-written destination file.
///
/// A rename within one filesystem is atomic. Across filesystems the data is
/// copied next to the destination first and then renamed over it.
async fn move_into_place(from: &Path, to: &Path) -> Result<(), DownloadError> {
    let finalize_failed = |source| DownloadError::FinalizeFailed {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        source,
    };

    match tokio::fs::remove_file(to).await {
        Ok(()) => debug!(path = %to.display(), "replacing stale download"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(finalize_failed(e)),
    }

    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }

    let mut partial = to.as_os_str().to_os_string();
    partial.push(format!(".{PARTIAL_SUFFIX}"));
    let partial = PathBuf::from(partial);

    tokio::fs::copy(from, &partial).await.map_err(finalize_failed)?;
    if let Err(e) = tokio::fs::rename(&partial, to).await {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(finalize_failed(e));
    }
    let _ = tokio::fs::remove_file(from).await;
    Ok(())
}

/// Remove `*.partial` files from the downloads directory and everything
/// from the staging directory. Returns how many files were removed.
fn remove_stale_files(dir: &Path, staging: &Path) -> usize {
    let mut cleaned = 0;

    let candidates = |path: &Path| -> Vec<PathBuf> {
        std::fs::read_dir(path)
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .map(|entry| entry.path())
                    .filter(|path| path.is_file())
                    .collect()
            })
            .unwrap_or_default()
    };

    let partials = candidates(dir)
        .into_iter()
        .filter(|path| path.extension().is_some_and(|ext| ext == PARTIAL_SUFFIX));

    for path in partials.chain(candidates(staging)) {
        match std::fs::remove_file(&path) {
            Ok(()) => cleaned += 1,
            Err(e) => warn!(path = %path.display(), error = %e, "could not remove stale file"),
        }
    }
    cleaned
}
