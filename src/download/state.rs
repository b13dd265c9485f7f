// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use tokio::sync::watch;

use crate::store::EpisodeId;

/// Derived download state of one episode
///
/// Never persisted. After a restart every episode starts from what the
/// filesystem says: `Downloaded` if its file exists, `NotDownloaded` otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DownloadState {
    NotDownloaded,
    Downloading,
    Downloaded,
    Failed,
}

impl DownloadState {
    pub fn from_presence(file_exists: bool) -> Self {
        if file_exists {
            Self::Downloaded
        } else {
            Self::NotDownloaded
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Downloaded | Self::Failed)
    }
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::NotDownloaded => "not downloaded",
            Self::Downloading => "downloading",
            Self::Downloaded => "downloaded",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Per-episode last-value state cells
///
/// Every subscriber of one episode shares the same cell, and a new
/// subscriber immediately sees the most recent state.
#[derive(Debug, Default)]
pub struct StateCells {
    cells: Mutex<HashMap<EpisodeId, watch::Sender<DownloadState>>>,
}

impl StateCells {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one episode's state.
    ///
    /// The hint seeds a cell that does not exist yet; an existing cell keeps
    /// its value, because it already reflects every transition seen so far.
    pub fn subscribe(&self, episode: EpisodeId, file_exists_hint: bool) -> watch::Receiver<DownloadState> {
        let mut cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
        cells
            .entry(episode)
            .or_insert_with(|| watch::channel(DownloadState::from_presence(file_exists_hint)).0)
            .subscribe()
    }

    pub fn set(&self, episode: EpisodeId, state: DownloadState) {
        let mut cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
        match cells.get(&episode) {
            Some(cell) => {
                cell.send_if_modified(|current| {
                    let changed = *current != state;
                    *current = state;
                    changed
                });
            }
            None => {
                cells.insert(episode, watch::channel(state).0);
            }
        }
    }

    /// Last known state, if the episode has been observed or touched
    pub fn get(&self, episode: EpisodeId) -> Option<DownloadState> {
        let cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
        cells.get(&episode).map(|cell| *cell.borrow())
    }

    pub fn tracked(&self) -> Vec<EpisodeId> {
        let cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
        cells.keys().copied().collect()
    }
}
