// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Episode catalog.
//!
//! The catalog mediates every read and write against the [`Store`] and
//! publishes a [`CatalogSnapshot`] after each change. A failed write is
//! logged and rolled back by the store, so the republished snapshot always
//! mirrors what is actually persisted.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::feed::{ChannelRecord, EpisodeRecord};
use crate::store::{
    Bookmark, BookmarkId, Chapter, Episode, EpisodeId, EpisodeQuery, NewChapter, NewEpisode,
    NewPodcast, Podcast, PodcastId, Settings, Store, Tables,
};

/// What observers of the catalog see
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatalogSnapshot {
    /// Sorted by title
    pub podcasts: Vec<Podcast>,
    /// Newest first
    pub unlistened: Vec<Episode>,
}

pub struct Catalog {
    store: Store,
    snapshot: watch::Sender<CatalogSnapshot>,
    chapter_locks: Mutex<HashMap<EpisodeId, Arc<tokio::sync::Mutex<()>>>>,
}

impl Catalog {
    pub fn new(store: Store) -> Self {
        let initial = build_snapshot(&store);
        let (snapshot, _) = watch::channel(initial);
        Self {
            store,
            snapshot,
            chapter_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to catalog changes. The receiver starts at the current state.
    pub fn watch(&self) -> watch::Receiver<CatalogSnapshot> {
        self.snapshot.subscribe()
    }

    fn publish(&self) {
        self.snapshot.send_replace(build_snapshot(&self.store));
    }

    fn mutate<T>(
        &self,
        action: &'static str,
        f: impl FnOnce(&mut Tables) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let result = self.store.transaction(f);
        if let Err(e) = &result {
            warn!(action, error = %e, "catalog update failed");
        }
        self.publish();
        result
    }

    // --- subscriptions ---

    /// Subscribe to a channel.
    ///
    /// Only the newest episode stays unlistened; everything older is marked
    /// listened so a new subscription starts with "new episodes from now on".
    /// Subscribing to a feed URL that is already known returns the existing
    /// podcast unchanged.
    pub fn subscribe(
        &self,
        channel: &ChannelRecord,
        playback_rate: f32,
    ) -> Result<PodcastId, StoreError> {
        if let Some(existing) = self
            .store
            .read(|t| t.podcast_by_feed_url(&channel.feed_url).map(|p| p.id))
        {
            debug!(podcast = %existing, url = %channel.feed_url, "already subscribed");
            return Ok(existing);
        }

        let podcast = self.mutate("subscribe", |tables| {
            let podcast = tables.insert_podcast(NewPodcast {
                title: channel.title.clone(),
                author: channel.author.clone(),
                description: channel.description.clone(),
                feed_url: channel.feed_url.clone(),
                image_url: channel.image_url.clone(),
                playback_rate,
            });

            let mut inserted = 0usize;
            for record in &channel.episodes {
                if tables.episode_by_guid(podcast, &record.guid).is_some() {
                    continue;
                }
                tables.insert_episode(podcast, new_episode(record, inserted > 0))?;
                inserted += 1;
            }
            Ok(podcast)
        })?;

        info!(
            podcast = %podcast,
            title = %channel.title,
            episodes = channel.episodes.len(),
            "subscribed"
        );
        Ok(podcast)
    }

    /// Insert records not yet known for this podcast, unlistened
    pub fn add_new_episodes(
        &self,
        podcast: PodcastId,
        records: &[EpisodeRecord],
    ) -> Result<Vec<EpisodeId>, StoreError> {
        let added = self.mutate("add new episodes", |tables| {
            let mut added = Vec::new();
            for record in records {
                if tables.episode_by_guid(podcast, &record.guid).is_some() {
                    continue;
                }
                added.push(tables.insert_episode(podcast, new_episode(record, false))?);
            }
            Ok(added)
        })?;

        if !added.is_empty() {
            info!(podcast = %podcast, count = added.len(), "added new episodes");
        }
        Ok(added)
    }

    pub fn unsubscribe(&self, podcast: PodcastId) -> Result<Podcast, StoreError> {
        let removed = self.mutate("unsubscribe", |tables| tables.remove_podcast(podcast))?;
        info!(podcast = %podcast, title = %removed.title, "unsubscribed");
        Ok(removed)
    }

    // --- episode state ---

    pub fn mark_all_listened(&self, podcast: PodcastId) -> Result<(), StoreError> {
        self.mutate("mark all listened", |tables| {
            let ids: Vec<EpisodeId> = tables
                .episodes(&EpisodeQuery {
                    podcast: Some(podcast),
                    listened: Some(false),
                    ..Default::default()
                })
                .into_iter()
                .map(|e| e.id)
                .collect();
            for id in ids {
                tables.episode_mut(id)?.listened = true;
            }
            Ok(())
        })
    }

    pub fn mark_listened(&self, episode: EpisodeId) -> Result<(), StoreError> {
        self.mutate("mark listened", |tables| {
            tables.episode_mut(episode)?.listened = true;
            Ok(())
        })
    }

    /// Make a listened episode new again, restarting it from the beginning
    pub fn reset_listened(&self, episode: EpisodeId) -> Result<(), StoreError> {
        self.mutate("reset listened", |tables| {
            let episode = tables.episode_mut(episode)?;
            episode.listened = false;
            episode.last_listened_position = 0.0;
            Ok(())
        })
    }

    pub fn save_position(&self, episode: EpisodeId, seconds: f64) -> Result<(), StoreError> {
        self.mutate("save position", |tables| {
            tables.episode_mut(episode)?.last_listened_position = seconds.max(0.0);
            Ok(())
        })
    }

    pub fn update_duration(&self, episode: EpisodeId, seconds: u32) -> Result<(), StoreError> {
        self.mutate("update duration", |tables| {
            tables.episode_mut(episode)?.duration = seconds;
            Ok(())
        })
    }

    pub fn set_playback_rate(&self, podcast: PodcastId, rate: f32) -> Result<(), StoreError> {
        self.mutate("set playback rate", |tables| {
            tables.podcast_mut(podcast)?.playback_rate = rate;
            Ok(())
        })
    }

    pub fn set_podcast_artwork(&self, podcast: PodcastId, artwork: Bytes) -> Result<(), StoreError> {
        self.mutate("set podcast artwork", |tables| {
            tables.podcast_mut(podcast)?.artwork = Some(artwork);
            Ok(())
        })
    }

    // --- chapters ---

    fn chapter_lock(&self, episode: EpisodeId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .chapter_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        locks.entry(episode).or_default().clone()
    }

    /// Serialized read-modify-write of an episode's chapter list.
    ///
    /// `update` receives the stored chapters and returns the replacement, or
    /// `None` to leave them alone. Only one update per episode runs at a
    /// time, including any fetching `update` does. Returns whether the
    /// chapters were replaced.
    pub async fn update_chapters<F, Fut>(
        &self,
        episode: EpisodeId,
        update: F,
    ) -> Result<bool, StoreError>
    where
        F: FnOnce(Vec<Chapter>) -> Fut,
        Fut: Future<Output = Option<Vec<NewChapter>>>,
    {
        let lock = self.chapter_lock(episode);
        let _guard = lock.lock().await;

        let current = self.chapters(episode);
        let Some(replacement) = update(current).await else {
            return Ok(false);
        };

        self.mutate("replace chapters", |tables| {
            tables.replace_chapters(episode, replacement)
        })?;
        Ok(true)
    }

    pub async fn replace_chapters(
        &self,
        episode: EpisodeId,
        chapters: Vec<NewChapter>,
    ) -> Result<(), StoreError> {
        self.update_chapters(episode, |_| async move { Some(chapters) })
            .await
            .map(|_| ())
    }

    /// Chapters of an episode, sorted by start time
    pub fn chapters(&self, episode: EpisodeId) -> Vec<Chapter> {
        self.store.read(|t| t.chapters(episode).to_vec())
    }

    // --- bookmarks ---

    pub fn add_bookmark(&self, episode: EpisodeId, position: u64) -> Result<BookmarkId, StoreError> {
        self.mutate("add bookmark", |tables| {
            tables.insert_bookmark(episode, position)
        })
    }

    pub fn remove_bookmark(&self, bookmark: BookmarkId) -> Result<Option<Bookmark>, StoreError> {
        self.mutate("remove bookmark", |tables| Ok(tables.remove_bookmark(bookmark)))
    }

    /// All bookmarks, newest first
    pub fn bookmarks(&self) -> Vec<Bookmark> {
        self.store
            .read(|t| t.bookmarks().into_iter().cloned().collect())
    }

    // --- settings ---

    pub fn settings(&self) -> Settings {
        self.store.read(|t| t.settings().clone())
    }

    pub fn set_download_count(&self, count: u16) -> Result<(), StoreError> {
        self.mutate("set download count", |tables| {
            tables.settings_mut().download_count = count;
            Ok(())
        })
    }

    pub fn record_refresh(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.mutate("record refresh", |tables| {
            tables.settings_mut().last_refresh = Some(at);
            Ok(())
        })
    }

    // --- queries ---

    pub fn podcasts(&self) -> Vec<Podcast> {
        self.store
            .read(|t| t.podcasts().into_iter().cloned().collect())
    }

    pub fn podcast(&self, id: PodcastId) -> Option<Podcast> {
        self.store.read(|t| t.podcast(id).cloned())
    }

    pub fn episode(&self, id: EpisodeId) -> Option<Episode> {
        self.store.read(|t| t.episode(id).cloned())
    }

    pub fn unlistened_episodes(&self) -> Vec<Episode> {
        self.query(&EpisodeQuery::unlistened())
    }

    /// All episodes of a podcast, newest first
    pub fn episodes_for(&self, podcast: PodcastId) -> Vec<Episode> {
        self.query(&EpisodeQuery::for_podcast(podcast))
    }

    pub fn query(&self, query: &EpisodeQuery) -> Vec<Episode> {
        self.store
            .read(|t| t.episodes(query).into_iter().cloned().collect())
    }

    /// The episode published right before `current`, across all podcasts
    pub fn next_episode(&self, current: EpisodeId) -> Option<Episode> {
        let published = self.episode(current)?.published_at?;
        self.query(&EpisodeQuery {
            published_before: Some(published),
            limit: Some(1),
            ..Default::default()
        })
        .into_iter()
        .next()
    }
}

fn build_snapshot(store: &Store) -> CatalogSnapshot {
    store.read(|t| CatalogSnapshot {
        podcasts: t.podcasts().into_iter().cloned().collect(),
        unlistened: t
            .episodes(&EpisodeQuery::unlistened())
            .into_iter()
            .cloned()
            .collect(),
    })
}

fn new_episode(record: &EpisodeRecord, listened: bool) -> NewEpisode {
    NewEpisode {
        guid: record.guid.clone(),
        title: record.title.clone(),
        description: record.description.clone(),
        published_at: record.published_at,
        enclosure_url: record.enclosure_url.clone(),
        mime_type: record.mime_type.clone(),
        duration: record.duration.unwrap_or(0),
        listened,
        chapters_url: record.chapters_url.clone(),
        image_url: record.image_url.clone(),
    }
}
