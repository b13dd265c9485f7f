// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Refresh policy.
//!
//! Decides which feeds to fetch, which episodes to download and which
//! downloads to evict. Scheduling lives outside the crate and reaches the
//! orchestrator through [`RefreshTrigger`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::config::DownloadConfig;
use crate::download::{DownloadCoordinator, StartOutcome};
use crate::error::RefreshError;
use crate::feed::FeedSource;
use crate::playback::{PlaybackEngine, fetch_chapters};
use crate::progress::{ProgressEvent, SharedProgressReporter};
use crate::store::{EpisodeId, EpisodeQuery, Podcast, PodcastId};

/// Outcome of one refresh cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    /// Feeds fetched successfully
    pub podcasts: usize,
    /// Feeds that could not be fetched or merged
    pub failed_feeds: Vec<(String, String)>,
    pub new_episodes: usize,
    pub chapters_updated: usize,
    pub downloads_started: usize,
    pub evicted: usize,
}

/// External scheduling hooks.
///
/// Whatever runs the process calls these; the core never schedules itself.
#[async_trait]
pub trait RefreshTrigger: Send + Sync {
    /// The application came to the foreground
    async fn on_foreground(&self) -> RefreshSummary;

    /// A background scheduler granted time for a refresh
    async fn on_background_refresh(&self) -> RefreshSummary;
}

pub struct Orchestrator {
    catalog: Arc<Catalog>,
    downloads: Arc<DownloadCoordinator>,
    feeds: Arc<dyn FeedSource>,
    reporter: SharedProgressReporter,
    max_concurrent: usize,
    default_rate: f32,
    player: Option<PlaybackEngine>,
}

impl Orchestrator {
    pub fn new(
        catalog: Arc<Catalog>,
        downloads: Arc<DownloadCoordinator>,
        feeds: Arc<dyn FeedSource>,
        reporter: SharedProgressReporter,
        config: &DownloadConfig,
        default_rate: f32,
    ) -> Self {
        Self {
            catalog,
            downloads,
            feeds,
            reporter,
            max_concurrent: config.max_concurrent_refreshes.max(1),
            default_rate,
            player: None,
        }
    }

    /// Never evict the file of the episode this player is on
    pub fn with_player(mut self, player: PlaybackEngine) -> Self {
        self.player = Some(player);
        self
    }

    /// Subscribe to a feed and start downloading its newest episode
    pub async fn subscribe(&self, feed_url: &str) -> Result<PodcastId, RefreshError> {
        self.reporter.report(ProgressEvent::FetchingFeed {
            url: feed_url.to_string(),
        });
        let channel = self.feeds.fetch_channel(feed_url).await?;
        let known = self
            .catalog
            .podcasts()
            .iter()
            .any(|p| p.feed_url == channel.feed_url);
        let podcast = self.catalog.subscribe(&channel, self.default_rate)?;
        let inserted = if known {
            0
        } else {
            self.catalog.episodes_for(podcast).len()
        };

        self.reporter.report(ProgressEvent::FeedMerged {
            podcast_title: channel.title.clone(),
            total_episodes: channel.episodes.len(),
            new_episodes: inserted,
        });

        if let Some(image_url) = &channel.image_url {
            match self.feeds.fetch_artwork(image_url).await {
                Ok(bytes) => {
                    if let Err(e) = self.catalog.set_podcast_artwork(podcast, bytes) {
                        warn!(podcast = %podcast, error = %e, "could not store podcast artwork");
                    }
                }
                Err(e) => debug!(url = %image_url, error = %e, "could not fetch podcast artwork"),
            }
        }

        let newest = self.catalog.query(&EpisodeQuery {
            podcast: Some(podcast),
            listened: Some(false),
            limit: Some(1),
            ..Default::default()
        });
        for episode in &newest {
            self.downloads.start_download(episode);
        }

        Ok(podcast)
    }

    /// One full refresh cycle: fetch feeds, merge new episodes, load missing
    /// chapters, download the most recent unlistened episodes and evict
    /// downloads that have been listened to.
    pub async fn refresh(&self) -> RefreshSummary {
        let mut summary = RefreshSummary::default();
        let podcasts = self.catalog.podcasts();
        info!(podcasts = podcasts.len(), "refresh started");

        let results: Vec<(Podcast, Result<Vec<EpisodeId>, RefreshError>)> =
            stream::iter(podcasts)
                .map(|podcast| async move {
                    let result = self.refresh_podcast(&podcast).await;
                    (podcast, result)
                })
                .buffer_unordered(self.max_concurrent)
                .collect()
                .await;

        for (podcast, result) in results {
            match result {
                Ok(new) => {
                    summary.podcasts += 1;
                    summary.new_episodes += new.len();
                }
                Err(e) => {
                    warn!(podcast = %podcast.id, url = %podcast.feed_url, error = %e, "feed refresh failed");
                    summary.failed_feeds.push((podcast.title, e.to_string()));
                }
            }
        }

        summary.chapters_updated = self.refresh_chapters().await;
        summary.downloads_started = self.download_recent();
        summary.evicted = self.evict_listened().await;

        if let Err(e) = self.catalog.record_refresh(Utc::now()) {
            warn!(error = %e, "could not record refresh time");
        }

        self.reporter.report(ProgressEvent::RefreshCompleted {
            podcasts: summary.podcasts,
            new_episodes: summary.new_episodes,
            downloads_started: summary.downloads_started,
            evicted: summary.evicted,
        });
        info!(
            podcasts = summary.podcasts,
            failed = summary.failed_feeds.len(),
            new_episodes = summary.new_episodes,
            downloads = summary.downloads_started,
            evicted = summary.evicted,
            "refresh finished"
        );
        summary
    }

    async fn refresh_podcast(&self, podcast: &Podcast) -> Result<Vec<EpisodeId>, RefreshError> {
        self.reporter.report(ProgressEvent::FetchingFeed {
            url: podcast.feed_url.clone(),
        });
        let channel = self.feeds.fetch_channel(&podcast.feed_url).await?;
        let new = self.catalog.add_new_episodes(podcast.id, &channel.episodes)?;

        self.reporter.report(ProgressEvent::FeedMerged {
            podcast_title: podcast.title.clone(),
            total_episodes: channel.episodes.len(),
            new_episodes: new.len(),
        });
        Ok(new)
    }

    /// Fetch chapters for unlistened episodes that declare them but have
    /// none stored. Returns how many episodes got chapters.
    pub async fn refresh_chapters(&self) -> usize {
        let candidates: Vec<_> = self
            .catalog
            .unlistened_episodes()
            .into_iter()
            .filter_map(|episode| Some((episode.id, episode.chapters_url?)))
            .filter(|(id, _)| self.catalog.chapters(*id).is_empty())
            .collect();

        let updated: Vec<bool> = stream::iter(candidates)
            .map(|(episode, url)| async move {
                let feeds = self.feeds.clone();
                let result = self
                    .catalog
                    .update_chapters(episode, |existing| async move {
                        if !existing.is_empty() {
                            return None;
                        }
                        fetch_chapters(feeds.as_ref(), &url).await
                    })
                    .await;
                result.unwrap_or_else(|e| {
                    warn!(episode = %episode, error = %e, "could not store chapters");
                    false
                })
            })
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await;

        updated.into_iter().filter(|replaced| *replaced).count()
    }

    /// Start downloads for the `download_count` most recent unlistened
    /// episodes of every podcast. Returns how many transfers were started.
    pub fn download_recent(&self) -> usize {
        let keep = usize::from(self.catalog.settings().download_count);
        let mut started = 0;

        for podcast in self.catalog.podcasts() {
            let recent = self.catalog.query(&EpisodeQuery {
                podcast: Some(podcast.id),
                listened: Some(false),
                limit: Some(keep),
                ..Default::default()
            });
            for episode in &recent {
                if let StartOutcome::Started(_) = self.downloads.start_download(episode) {
                    started += 1;
                }
            }
        }
        started
    }

    /// Delete the files of listened episodes, except the one being played.
    /// Returns how many were removed.
    pub async fn evict_listened(&self) -> usize {
        let listened = self.catalog.query(&EpisodeQuery {
            listened: Some(true),
            ..Default::default()
        });
        let playing = self.player.as_ref().and_then(|p| p.snapshot().episode);

        let mut evicted = 0;
        for episode in listened.iter().filter(|episode| {
            Some(episode.id) != playing && self.downloads.download_file_exists(episode)
        }) {
            if self.downloads.remove_download(episode).await {
                evicted += 1;
            }
        }
        if evicted > 0 {
            debug!(count = evicted, "evicted listened downloads");
        }
        evicted
    }
}

#[async_trait]
impl RefreshTrigger for Orchestrator {
    async fn on_foreground(&self) -> RefreshSummary {
        self.refresh().await
    }

    async fn on_background_refresh(&self) -> RefreshSummary {
        self.refresh().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::{DurationProbe, TransferBackend, TransferRequest};
    use crate::error::{DownloadError, FeedError};
    use crate::feed::{ChannelRecord, ChapterRecord, EpisodeRecord};
    use crate::config::PlaybackConfig;
    use crate::playback::SilentBackend;
    use crate::progress::{NoopReporter, ProgressReporter};
    use crate::store::Store;
    use bytes::Bytes;
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::{TempDir, tempdir};

    #[derive(Default)]
    struct RecordingTransfer {
        begun: Mutex<Vec<TransferRequest>>,
    }

    impl TransferBackend for RecordingTransfer {
        fn begin(&self, request: TransferRequest) {
            self.begun.lock().unwrap().push(request);
        }
    }

    struct NoProbe;

    impl DurationProbe for NoProbe {
        fn probe(&self, path: &Path) -> Result<u32, DownloadError> {
            Err(DownloadError::ProbeFailed {
                path: path.to_path_buf(),
                reason: "unused".to_string(),
            })
        }
    }

    #[derive(Default)]
    struct MockFeeds {
        channels: Mutex<HashMap<String, ChannelRecord>>,
        chapters: HashMap<String, Vec<ChapterRecord>>,
    }

    impl MockFeeds {
        fn set_channel(&self, channel: ChannelRecord) {
            self.channels
                .lock()
                .unwrap()
                .insert(channel.feed_url.clone(), channel);
        }
    }

    #[async_trait]
    impl FeedSource for MockFeeds {
        async fn fetch_channel(&self, source: &str) -> Result<ChannelRecord, FeedError> {
            self.channels
                .lock()
                .unwrap()
                .get(source)
                .cloned()
                .ok_or(FeedError::InvalidUrl(url::ParseError::EmptyHost))
        }

        async fn fetch_chapters(&self, url: &str) -> Result<Vec<ChapterRecord>, FeedError> {
            self.chapters
                .get(url)
                .cloned()
                .ok_or(FeedError::InvalidUrl(url::ParseError::EmptyHost))
        }

        async fn fetch_artwork(&self, _url: &str) -> Result<Bytes, FeedError> {
            Ok(Bytes::from_static(b"cover"))
        }
    }

    fn episode(feed: &str, n: u32) -> EpisodeRecord {
        EpisodeRecord {
            guid: format!("{feed}-{n}"),
            title: format!("{feed} #{n}"),
            description: None,
            published_at: Some(Utc.with_ymd_and_hms(2024, 3, n, 8, 0, 0).unwrap()),
            enclosure_url: format!("https://cdn.example.com/{feed}/{n}.mp3"),
            enclosure_length: None,
            mime_type: Some("audio/mpeg".to_string()),
            duration: None,
            image_url: None,
            chapters_url: None,
        }
    }

    fn channel(feed: &str, numbers: &[u32]) -> ChannelRecord {
        let mut episodes: Vec<_> = numbers.iter().map(|n| episode(feed, *n)).collect();
        episodes.sort_by(|a, b| b.published_at.cmp(&a.published_at));
        ChannelRecord {
            title: feed.to_string(),
            description: None,
            link: None,
            author: None,
            image_url: Some(format!("https://example.com/{feed}.jpg")),
            feed_url: format!("https://example.com/{feed}.xml"),
            episodes,
        }
    }

    struct Harness {
        _dir: TempDir,
        catalog: Arc<Catalog>,
        downloads: Arc<DownloadCoordinator>,
        transfers: Arc<RecordingTransfer>,
        feeds: Arc<MockFeeds>,
        orchestrator: Orchestrator,
    }

    #[derive(Default)]
    struct RecordingReporter {
        events: Mutex<Vec<ProgressEvent>>,
    }

    impl ProgressReporter for RecordingReporter {
        fn report(&self, event: ProgressEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn harness(feeds: MockFeeds) -> Harness {
        harness_reporting(feeds, NoopReporter::shared())
    }

    fn harness_reporting(feeds: MockFeeds, reporter: SharedProgressReporter) -> Harness {
        let dir = tempdir().unwrap();
        let catalog = Arc::new(Catalog::new(Store::in_memory()));
        let transfers = Arc::new(RecordingTransfer::default());
        let downloads = Arc::new(
            DownloadCoordinator::new(
                dir.path().join("downloads"),
                "mp3",
                catalog.clone(),
                transfers.clone(),
                Arc::new(NoProbe),
            )
            .unwrap(),
        );
        let feeds = Arc::new(feeds);
        let orchestrator = Orchestrator::new(
            catalog.clone(),
            downloads.clone(),
            feeds.clone(),
            reporter,
            &DownloadConfig::default(),
            1.0,
        );
        Harness {
            _dir: dir,
            catalog,
            downloads,
            transfers,
            feeds,
            orchestrator,
        }
    }

    #[tokio::test]
    async fn subscribe_downloads_newest_and_stores_artwork() {
        let h = harness(MockFeeds::default());
        h.feeds.set_channel(channel("show", &[1, 2, 3, 4, 5]));

        let podcast = h
            .orchestrator
            .subscribe("https://example.com/show.xml")
            .await
            .unwrap();

        let unlistened = h.catalog.unlistened_episodes();
        assert_eq!(unlistened.len(), 1);
        assert_eq!(unlistened[0].guid, "show-5");
        assert_eq!(h.downloads.active_transfers(), vec![unlistened[0].id]);
        assert_eq!(
            h.catalog.podcast(podcast).unwrap().artwork,
            Some(Bytes::from_static(b"cover"))
        );
    }

    #[tokio::test]
    async fn subscribe_surfaces_fetch_errors() {
        let h = harness(MockFeeds::default());
        let result = h.orchestrator.subscribe("https://example.com/missing.xml").await;
        assert!(matches!(result, Err(RefreshError::Feed(_))));
        assert!(h.catalog.podcasts().is_empty());
    }

    #[tokio::test]
    async fn refresh_merges_new_episodes_and_downloads_recent() {
        let h = harness(MockFeeds::default());
        h.feeds.set_channel(channel("a", &[1, 2]));
        h.feeds.set_channel(channel("b", &[1]));
        h.orchestrator.subscribe("https://example.com/a.xml").await.unwrap();
        h.orchestrator.subscribe("https://example.com/b.xml").await.unwrap();

        h.feeds.set_channel(channel("a", &[1, 2, 3, 4, 5, 6]));
        let summary = h.orchestrator.refresh().await;

        assert_eq!(summary.podcasts, 2);
        assert_eq!(summary.new_episodes, 4);
        assert!(summary.failed_feeds.is_empty());
        // a: three most recent unlistened (6, 5, 4); a-2 and b-1 were already in flight
        assert_eq!(summary.downloads_started, 3);
        assert_eq!(h.transfers.begun.lock().unwrap().len(), 5);
        assert!(h.catalog.settings().last_refresh.is_some());
    }

    #[tokio::test]
    async fn refresh_reports_failed_feeds_and_continues() {
        let h = harness(MockFeeds::default());
        h.feeds.set_channel(channel("a", &[1]));
        h.feeds.set_channel(channel("b", &[1]));
        h.orchestrator.subscribe("https://example.com/a.xml").await.unwrap();
        h.orchestrator.subscribe("https://example.com/b.xml").await.unwrap();
        h.feeds
            .channels
            .lock()
            .unwrap()
            .remove("https://example.com/b.xml");

        let summary = h.orchestrator.refresh().await;

        assert_eq!(summary.podcasts, 1);
        assert_eq!(summary.failed_feeds.len(), 1);
        assert_eq!(summary.failed_feeds[0].0, "b");
    }

    #[tokio::test]
    async fn refresh_loads_missing_chapters_for_unlistened() {
        let mut with_chapters = channel("c", &[1, 2]);
        with_chapters.episodes[0].chapters_url = Some("https://example.com/c2.json".to_string());
        with_chapters.episodes[1].chapters_url = Some("https://example.com/c1.json".to_string());

        let mut feeds = MockFeeds::default();
        let chapter = |start_time, title: &str| ChapterRecord {
            start_time,
            title: title.to_string(),
            image_url: None,
        };
        feeds.chapters.insert(
            "https://example.com/c2.json".to_string(),
            vec![chapter(0, "Intro"), chapter(60, "Talk")],
        );
        feeds.chapters.insert(
            "https://example.com/c1.json".to_string(),
            vec![chapter(0, "Old")],
        );
        let h = harness(feeds);
        h.feeds.set_channel(with_chapters);
        h.orchestrator.subscribe("https://example.com/c.xml").await.unwrap();

        let updated = h.orchestrator.refresh_chapters().await;

        // Only the unlistened (newest) episode is considered
        assert_eq!(updated, 1);
        let newest = &h.catalog.unlistened_episodes()[0];
        assert_eq!(h.catalog.chapters(newest.id).len(), 2);

        // Already stored chapters are not fetched again
        assert_eq!(h.orchestrator.refresh_chapters().await, 0);
    }

    #[tokio::test]
    async fn eviction_removes_only_listened_downloads() {
        let h = harness(MockFeeds::default());
        h.feeds.set_channel(channel("e", &[1, 2]));
        let podcast = h.orchestrator.subscribe("https://example.com/e.xml").await.unwrap();

        let episodes = h.catalog.episodes_for(podcast);
        for episode in &episodes {
            std::fs::write(h.downloads.download_path(episode), b"audio").unwrap();
        }
        let (newest, older) = (&episodes[0], &episodes[1]);
        assert!(!newest.listened);
        assert!(older.listened);

        assert_eq!(h.orchestrator.evict_listened().await, 1);
        assert!(h.downloads.download_file_exists(newest));
        assert!(!h.downloads.download_file_exists(older));
    }

    #[tokio::test]
    async fn triggers_run_a_refresh() {
        let h = harness(MockFeeds::default());
        h.feeds.set_channel(channel("t", &[1]));
        h.orchestrator.subscribe("https://example.com/t.xml").await.unwrap();

        let trigger: &dyn RefreshTrigger = &h.orchestrator;
        assert_eq!(trigger.on_foreground().await.podcasts, 1);
        assert_eq!(trigger.on_background_refresh().await.podcasts, 1);
    }

    #[tokio::test]
    async fn resubscribe_reports_no_new_episodes() {
        let reporter = Arc::new(RecordingReporter::default());
        let h = harness_reporting(MockFeeds::default(), reporter.clone());
        h.feeds.set_channel(channel("r", &[1, 2, 3]));

        let first = h.orchestrator.subscribe("https://example.com/r.xml").await.unwrap();
        let second = h.orchestrator.subscribe("https://example.com/r.xml").await.unwrap();
        assert_eq!(first, second);

        let merged: Vec<usize> = reporter
            .events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                ProgressEvent::FeedMerged { new_episodes, .. } => Some(*new_episodes),
                _ => None,
            })
            .collect();
        assert_eq!(merged, vec![3, 0]);
    }

    #[tokio::test]
    async fn eviction_spares_the_episode_being_played() {
        let h = harness(MockFeeds::default());
        h.feeds.set_channel(channel("p", &[1, 2]));
        let podcast = h.orchestrator.subscribe("https://example.com/p.xml").await.unwrap();

        let episodes = h.catalog.episodes_for(podcast);
        let older = &episodes[1];
        assert!(older.listened);
        std::fs::write(h.downloads.download_path(older), b"audio").unwrap();

        let player = PlaybackEngine::new(
            h.catalog.clone(),
            h.downloads.clone(),
            h.feeds.clone(),
            Arc::new(SilentBackend::new(Some(600.0))),
            PlaybackConfig::default(),
        );
        player.start_playing_episode(older.id).await.unwrap();
        let orchestrator = h.orchestrator.with_player(player.clone());

        assert_eq!(orchestrator.evict_listened().await, 0);
        assert!(h.downloads.download_file_exists(older));

        player.stop();
        assert_eq!(orchestrator.evict_listened().await, 1);
        assert!(!h.downloads.download_file_exists(older));
    }
}
