// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

pub mod catalog;
pub mod config;
pub mod download;
pub mod error;
pub mod feed;
pub mod http;
pub mod orchestrator;
pub mod playback;
pub mod presentation;
pub mod progress;
pub mod store;

// Re-export main types for convenience
pub use catalog::{Catalog, CatalogSnapshot};
pub use config::{Config, DownloadConfig, PlaybackConfig, StorageConfig};
pub use download::{
    DeleteSummary, DownloadCoordinator, DownloadState, DurationProbe, HttpTransfer, StartOutcome,
    SymphoniaProbe, TaskId, TransferBackend, TransferEvent, TransferRequest,
};
pub use error::{ConfigError, DownloadError, FeedError, PlaybackError, RefreshError, StoreError};
pub use feed::{ChannelRecord, ChapterRecord, EpisodeRecord, FeedService, FeedSource};
pub use http::{HttpClient, HttpResponse, ReqwestClient};
pub use orchestrator::{Orchestrator, RefreshSummary, RefreshTrigger};
pub use playback::{
    MediaBackend, MediaHandle, PlayableSource, PlaybackEngine, PlaybackSnapshot, PlayerState,
    SilentBackend,
};
pub use presentation::{EpisodeSource, EpisodeSummary, PodcastSource, PodcastSummary};
pub use progress::{NoopReporter, ProgressEvent, ProgressReporter, SharedProgressReporter};
pub use store::{
    Bookmark, BookmarkId, Chapter, Episode, EpisodeId, EpisodeQuery, JsonFileBackend, Podcast,
    PodcastId, Store,
};
