// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;
use thiserror::Error;

use crate::store::{EpisodeId, PodcastId};

/// Errors that can occur when fetching or parsing feeds and chapter documents
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Failed to fetch {url}: {source}")]
    FetchFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Failed to read feed file {path}: {source}")]
    FileReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse RSS feed: {0}")]
    ParseFailed(#[from] rss::Error),

    #[error("Failed to parse chapters document from {url}: {source}")]
    ChaptersParseFailed {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Episode '{title}' has no enclosure (audio file)")]
    MissingEnclosure { title: String },
}

/// Errors raised by the persistent store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to read library file {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write library file {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse library JSON in {path}: {source}")]
    JsonParseFailed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize library: {0}")]
    JsonSerializeFailed(#[from] serde_json::Error),

    #[error("Commit rejected: {0}")]
    CommitRejected(String),

    #[error("Podcast {0} not found")]
    PodcastNotFound(PodcastId),

    #[error("Episode {0} not found")]
    EpisodeNotFound(EpisodeId),

    #[error("Podcast {podcast} already has an episode with guid '{guid}'")]
    DuplicateEpisode { podcast: PodcastId, guid: String },
}

/// Errors that can occur around episode downloads
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("Failed to create download directory {path}: {source}")]
    DirectoryInit {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP request failed for {url}: {source}")]
    HttpFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP error {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Failed to create file {path}: {source}")]
    FileCreateFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write to file {path}: {source}")]
    FileWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Stream error while downloading {url}: {source}")]
    StreamFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Failed to move {from} into place at {to}: {source}")]
    FinalizeFailed {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to probe media duration of {path}: {reason}")]
    ProbeFailed { path: PathBuf, reason: String },
}

/// Errors surfaced by the playback engine
#[derive(Error, Debug)]
pub enum PlaybackError {
    #[error("Episode {0} not found")]
    EpisodeNotFound(EpisodeId),

    #[error("No playable source for episode {0}")]
    NoPlayableSource(EpisodeId),

    #[error("Failed to open media source {source_uri}: {reason}")]
    OpenFailed { source_uri: String, reason: String },

    #[error("No active playback session")]
    NoSession,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors that can occur when loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Could not determine the user configuration directory")]
    NoConfigDir,

    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Errors from the subscribe/refresh cycle
#[derive(Error, Debug)]
pub enum RefreshError {
    #[error("Feed error: {0}")]
    Feed(#[from] FeedError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}
