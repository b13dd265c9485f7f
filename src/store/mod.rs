// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Persistent entity store.
//!
//! Records live in arena tables keyed by stable identifiers. Everything
//! outside this module refers to podcasts and episodes by id and receives
//! owned copies; nothing holds a live reference into the tables.

mod backend;
mod model;

pub use backend::{Backend, JsonFileBackend, MemoryBackend};
pub use model::{
    Bookmark, BookmarkId, Chapter, Episode, EpisodeId, NewChapter, NewEpisode, NewPodcast,
    Podcast, PodcastId, Settings,
};

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::StoreError;

/// Sort order for episode queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EpisodeOrder {
    /// Newest first; undated episodes last
    #[default]
    PublishedDesc,
    /// Oldest first; undated episodes last
    PublishedAsc,
}

/// Filter and sort criteria for episode fetches
#[derive(Debug, Clone, Default)]
pub struct EpisodeQuery {
    pub podcast: Option<PodcastId>,
    pub listened: Option<bool>,
    pub published_before: Option<DateTime<Utc>>,
    pub order: EpisodeOrder,
    pub limit: Option<usize>,
}

impl EpisodeQuery {
    /// All episodes where `listened == false`, newest first
    pub fn unlistened() -> Self {
        Self {
            listened: Some(false),
            ..Default::default()
        }
    }

    /// All episodes of one podcast, newest first
    pub fn for_podcast(podcast: PodcastId) -> Self {
        Self {
            podcast: Some(podcast),
            ..Default::default()
        }
    }

    fn matches(&self, episode: &Episode) -> bool {
        self.podcast.is_none_or(|p| episode.podcast_id == p)
            && self.listened.is_none_or(|l| episode.listened == l)
            && self
                .published_before
                .is_none_or(|cutoff| episode.published_at.is_some_and(|at| at < cutoff))
    }
}

/// The complete set of persisted records
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tables {
    next_id: u64,
    podcasts: BTreeMap<PodcastId, Podcast>,
    episodes: BTreeMap<EpisodeId, Episode>,
    chapters: BTreeMap<EpisodeId, Vec<Chapter>>,
    bookmarks: BTreeMap<BookmarkId, Bookmark>,
    settings: Settings,
}

impl Tables {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn insert_podcast(&mut self, new: NewPodcast) -> PodcastId {
        let id = PodcastId(self.allocate_id());
        self.podcasts.insert(
            id,
            Podcast {
                id,
                title: new.title,
                author: new.author,
                description: new.description,
                feed_url: new.feed_url,
                image_url: new.image_url,
                artwork: None,
                playback_rate: new.playback_rate,
                subscribed_at: Utc::now(),
            },
        );
        id
    }

    pub fn podcast(&self, id: PodcastId) -> Option<&Podcast> {
        self.podcasts.get(&id)
    }

    pub fn podcast_mut(&mut self, id: PodcastId) -> Result<&mut Podcast, StoreError> {
        self.podcasts
            .get_mut(&id)
            .ok_or(StoreError::PodcastNotFound(id))
    }

    pub fn podcast_by_feed_url(&self, feed_url: &str) -> Option<&Podcast> {
        self.podcasts.values().find(|p| p.feed_url == feed_url)
    }

    /// All podcasts sorted by title
    pub fn podcasts(&self) -> Vec<&Podcast> {
        let mut podcasts: Vec<_> = self.podcasts.values().collect();
        podcasts.sort_by_cached_key(|p| p.title.to_lowercase());
        podcasts
    }

    /// Remove a podcast together with its episodes, chapters and bookmarks
    pub fn remove_podcast(&mut self, id: PodcastId) -> Result<Podcast, StoreError> {
        let podcast = self
            .podcasts
            .remove(&id)
            .ok_or(StoreError::PodcastNotFound(id))?;

        let orphaned: Vec<EpisodeId> = self
            .episodes
            .values()
            .filter(|e| e.podcast_id == id)
            .map(|e| e.id)
            .collect();

        for episode_id in &orphaned {
            self.episodes.remove(episode_id);
            self.chapters.remove(episode_id);
        }
        self.bookmarks
            .retain(|_, bookmark| !orphaned.contains(&bookmark.episode_id));

        Ok(podcast)
    }

    /// Insert an episode; guids are unique per podcast
    pub fn insert_episode(
        &mut self,
        podcast: PodcastId,
        new: NewEpisode,
    ) -> Result<EpisodeId, StoreError> {
        if !self.podcasts.contains_key(&podcast) {
            return Err(StoreError::PodcastNotFound(podcast));
        }
        if self.episode_by_guid(podcast, &new.guid).is_some() {
            return Err(StoreError::DuplicateEpisode {
                podcast,
                guid: new.guid,
            });
        }

        let id = EpisodeId(self.allocate_id());
        self.episodes.insert(
            id,
            Episode {
                id,
                podcast_id: podcast,
                guid: new.guid,
                title: new.title,
                description: new.description,
                published_at: new.published_at,
                enclosure_url: new.enclosure_url,
                mime_type: new.mime_type,
                duration: new.duration,
                last_listened_position: 0.0,
                listened: new.listened,
                chapters_url: new.chapters_url,
                image_url: new.image_url,
                artwork: None,
            },
        );
        Ok(id)
    }

    pub fn episode(&self, id: EpisodeId) -> Option<&Episode> {
        self.episodes.get(&id)
    }

    pub fn episode_mut(&mut self, id: EpisodeId) -> Result<&mut Episode, StoreError> {
        self.episodes
            .get_mut(&id)
            .ok_or(StoreError::EpisodeNotFound(id))
    }

    pub fn episode_by_guid(&self, podcast: PodcastId, guid: &str) -> Option<&Episode> {
        self.episodes
            .values()
            .find(|e| e.podcast_id == podcast && e.guid == guid)
    }

    pub fn episodes(&self, query: &EpisodeQuery) -> Vec<&Episode> {
        let mut episodes: Vec<_> = self
            .episodes
            .values()
            .filter(|e| query.matches(e))
            .collect();

        episodes.sort_by(|a, b| compare_published(a, b, query.order));

        if let Some(limit) = query.limit {
            episodes.truncate(limit);
        }
        episodes
    }

    /// Chapters of an episode, ordered by start time
    pub fn chapters(&self, episode: EpisodeId) -> &[Chapter] {
        self.chapters.get(&episode).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Replace the chapter list of an episode
    ///
    /// Chapters are stored sorted by start time. When two chapters declare
    /// the same start time the one declared first in the source wins.
    pub fn replace_chapters(
        &mut self,
        episode: EpisodeId,
        chapters: Vec<NewChapter>,
    ) -> Result<(), StoreError> {
        if !self.episodes.contains_key(&episode) {
            return Err(StoreError::EpisodeNotFound(episode));
        }

        let mut chapters: Vec<Chapter> = chapters
            .into_iter()
            .map(|c| Chapter {
                episode_id: episode,
                start_time: c.start_time,
                title: c.title,
                image_url: c.image_url,
                artwork: c.artwork,
            })
            .collect();
        // Stable sort keeps declared order among equal start times
        chapters.sort_by_key(|c| c.start_time);
        chapters.dedup_by_key(|c| c.start_time);

        if chapters.is_empty() {
            self.chapters.remove(&episode);
        } else {
            self.chapters.insert(episode, chapters);
        }
        Ok(())
    }

    pub fn insert_bookmark(
        &mut self,
        episode: EpisodeId,
        position: u64,
    ) -> Result<BookmarkId, StoreError> {
        if !self.episodes.contains_key(&episode) {
            return Err(StoreError::EpisodeNotFound(episode));
        }
        let id = BookmarkId(self.allocate_id());
        self.bookmarks.insert(
            id,
            Bookmark {
                id,
                episode_id: episode,
                position,
                created_at: Utc::now(),
            },
        );
        Ok(id)
    }

    pub fn remove_bookmark(&mut self, id: BookmarkId) -> Option<Bookmark> {
        self.bookmarks.remove(&id)
    }

    /// All bookmarks, newest first
    pub fn bookmarks(&self) -> Vec<&Bookmark> {
        let mut bookmarks: Vec<_> = self.bookmarks.values().collect();
        bookmarks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        bookmarks
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }
}

fn compare_published(a: &Episode, b: &Episode, order: EpisodeOrder) -> Ordering {
    let by_date = match (a.published_at, b.published_at) {
        (Some(x), Some(y)) => match order {
            EpisodeOrder::PublishedDesc => y.cmp(&x),
            EpisodeOrder::PublishedAsc => x.cmp(&y),
        },
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_date.then(a.id.cmp(&b.id))
}

/// Transactional access to the record tables
///
/// Reads see the last committed state. A transaction works on a copy of the
/// tables and only replaces the committed state once the backend accepted
/// the new snapshot; on any error the copy is dropped.
pub struct Store {
    tables: Mutex<Tables>,
    backend: Box<dyn Backend>,
}

impl Store {
    /// Open a store, loading the last committed snapshot from the backend
    pub fn open(backend: impl Backend + 'static) -> Result<Self, StoreError> {
        let tables = backend.load()?;
        Ok(Self {
            tables: Mutex::new(tables),
            backend: Box::new(backend),
        })
    }

    /// An empty, non-durable store
    pub fn in_memory() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            backend: Box::new(MemoryBackend),
        }
    }

    /// Run a read-only closure against the committed tables
    pub fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> T {
        let tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        f(&tables)
    }

    /// Run a mutating closure and commit its result atomically
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&mut Tables) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        let mut working = tables.clone();

        let value = f(&mut working)?;

        if let Err(e) = self.backend.commit(&working) {
            warn!(error = %e, "store commit failed, rolling back");
            return Err(e);
        }

        *tables = working;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
    use std::sync::Arc;

    struct FlakyBackend {
        fail: Arc<AtomicBool>,
    }

    impl Backend for FlakyBackend {
        fn load(&self) -> Result<Tables, StoreError> {
            Ok(Tables::default())
        }

        fn commit(&self, _tables: &Tables) -> Result<(), StoreError> {
            if self.fail.load(AtomicOrdering::SeqCst) {
                Err(StoreError::CommitRejected("disk full".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn new_podcast(title: &str) -> NewPodcast {
        NewPodcast {
            title: title.to_string(),
            author: None,
            description: None,
            feed_url: format!("https://example.com/{title}.xml"),
            image_url: None,
            playback_rate: 1.0,
        }
    }

    fn new_episode(guid: &str, day: Option<u32>, listened: bool) -> NewEpisode {
        NewEpisode {
            guid: guid.to_string(),
            title: format!("Episode {guid}"),
            description: None,
            published_at: day.map(|d| Utc.with_ymd_and_hms(2024, 1, d, 12, 0, 0).unwrap()),
            enclosure_url: format!("https://example.com/{guid}.mp3"),
            mime_type: Some("audio/mpeg".to_string()),
            duration: 1800,
            listened,
            chapters_url: None,
            image_url: None,
        }
    }

    fn chapter(start_time: u32, title: &str) -> NewChapter {
        NewChapter {
            start_time,
            title: title.to_string(),
            image_url: None,
            artwork: None,
        }
    }

    #[test]
    fn failed_commit_rolls_back() {
        let fail = Arc::new(AtomicBool::new(false));
        let store = Store::open(FlakyBackend { fail: fail.clone() }).unwrap();
        let podcast = store
            .transaction(|t| Ok(t.insert_podcast(new_podcast("show"))))
            .unwrap();

        fail.store(true, AtomicOrdering::SeqCst);
        let result = store.transaction(|t| t.insert_episode(podcast, new_episode("a", None, false)));
        assert!(matches!(result, Err(StoreError::CommitRejected(_))));

        let count = store.read(|t| t.episodes(&EpisodeQuery::default()).len());
        assert_eq!(count, 0);
    }

    #[test]
    fn closure_error_discards_partial_changes() {
        let store = Store::in_memory();
        let podcast = store
            .transaction(|t| Ok(t.insert_podcast(new_podcast("show"))))
            .unwrap();

        let result: Result<(), StoreError> = store.transaction(|t| {
            t.insert_episode(podcast, new_episode("a", None, false))?;
            t.insert_episode(podcast, new_episode("a", None, false))?;
            Ok(())
        });

        assert!(matches!(result, Err(StoreError::DuplicateEpisode { .. })));
        assert_eq!(store.read(|t| t.episodes(&EpisodeQuery::default()).len()), 0);
    }

    #[test]
    fn unlistened_query_sorts_newest_first() {
        let store = Store::in_memory();
        store
            .transaction(|t| {
                let p = t.insert_podcast(new_podcast("show"));
                t.insert_episode(p, new_episode("old", Some(1), false))?;
                t.insert_episode(p, new_episode("done", Some(5), true))?;
                t.insert_episode(p, new_episode("new", Some(9), false))?;
                t.insert_episode(p, new_episode("undated", None, false))?;
                Ok(())
            })
            .unwrap();

        let guids: Vec<String> = store.read(|t| {
            t.episodes(&EpisodeQuery::unlistened())
                .into_iter()
                .map(|e| e.guid.clone())
                .collect()
        });
        assert_eq!(guids, vec!["new", "old", "undated"]);
    }

    #[test]
    fn query_limit_and_podcast_filter() {
        let store = Store::in_memory();
        let (a, _b) = store
            .transaction(|t| {
                let a = t.insert_podcast(new_podcast("a"));
                let b = t.insert_podcast(new_podcast("b"));
                t.insert_episode(a, new_episode("a1", Some(1), false))?;
                t.insert_episode(a, new_episode("a2", Some(2), false))?;
                t.insert_episode(b, new_episode("b1", Some(3), false))?;
                Ok((a, b))
            })
            .unwrap();

        let query = EpisodeQuery {
            podcast: Some(a),
            limit: Some(1),
            ..Default::default()
        };
        let guids: Vec<String> =
            store.read(|t| t.episodes(&query).into_iter().map(|e| e.guid.clone()).collect());
        assert_eq!(guids, vec!["a2"]);
    }

    #[test]
    fn same_guid_allowed_in_different_podcasts() {
        let store = Store::in_memory();
        let result = store.transaction(|t| {
            let a = t.insert_podcast(new_podcast("a"));
            let b = t.insert_podcast(new_podcast("b"));
            t.insert_episode(a, new_episode("shared", None, false))?;
            t.insert_episode(b, new_episode("shared", None, false))
        });
        assert!(result.is_ok());
    }

    #[test]
    fn podcasts_sorted_by_title_case_insensitive() {
        let store = Store::in_memory();
        store
            .transaction(|t| {
                t.insert_podcast(new_podcast("zeta"));
                t.insert_podcast(new_podcast("Alpha"));
                t.insert_podcast(new_podcast("beta"));
                Ok(())
            })
            .unwrap();

        let titles: Vec<String> =
            store.read(|t| t.podcasts().into_iter().map(|p| p.title.clone()).collect());
        assert_eq!(titles, vec!["Alpha", "beta", "zeta"]);
    }

    #[test]
    fn remove_podcast_cascades() {
        let store = Store::in_memory();
        let (podcast, episode) = store
            .transaction(|t| {
                let p = t.insert_podcast(new_podcast("show"));
                let e = t.insert_episode(p, new_episode("a", None, false))?;
                t.replace_chapters(e, vec![chapter(0, "Intro")])?;
                t.insert_bookmark(e, 42)?;
                Ok((p, e))
            })
            .unwrap();

        store.transaction(|t| t.remove_podcast(podcast)).unwrap();

        store.read(|t| {
            assert!(t.episode(episode).is_none());
            assert!(t.chapters(episode).is_empty());
            assert!(t.bookmarks().is_empty());
        });
    }

    #[test]
    fn replace_chapters_sorts_and_drops_duplicate_starts() {
        let store = Store::in_memory();
        let episode = store
            .transaction(|t| {
                let p = t.insert_podcast(new_podcast("show"));
                t.insert_episode(p, new_episode("a", None, false))
            })
            .unwrap();

        store
            .transaction(|t| {
                t.replace_chapters(
                    episode,
                    vec![
                        chapter(400, "Outro"),
                        chapter(0, "Intro"),
                        chapter(120, "Main"),
                        chapter(120, "Main again"),
                    ],
                )
            })
            .unwrap();

        let titles: Vec<String> = store.read(|t| {
            t.chapters(episode)
                .iter()
                .map(|c| c.title.clone())
                .collect()
        });
        assert_eq!(titles, vec!["Intro", "Main", "Outro"]);
    }

    #[test]
    fn replace_chapters_for_unknown_episode_fails() {
        let store = Store::in_memory();
        let result = store.transaction(|t| t.replace_chapters(EpisodeId(99), vec![]));
        assert!(matches!(result, Err(StoreError::EpisodeNotFound(EpisodeId(99)))));
    }

    #[test]
    fn published_before_excludes_undated() {
        let store = Store::in_memory();
        store
            .transaction(|t| {
                let p = t.insert_podcast(new_podcast("show"));
                t.insert_episode(p, new_episode("early", Some(1), false))?;
                t.insert_episode(p, new_episode("late", Some(20), false))?;
                t.insert_episode(p, new_episode("undated", None, false))?;
                Ok(())
            })
            .unwrap();

        let query = EpisodeQuery {
            published_before: Some(Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap()),
            ..Default::default()
        };
        let guids: Vec<String> =
            store.read(|t| t.episodes(&query).into_iter().map(|e| e.guid.clone()).collect());
        assert_eq!(guids, vec!["early"]);
    }
}
