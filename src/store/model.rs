// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! record_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

record_id!(
    /// Stable identifier of a subscribed podcast
    PodcastId
);
record_id!(
    /// Stable identifier of an episode, never reused within a library
    EpisodeId
);
record_id!(
    /// Stable identifier of a bookmark
    BookmarkId
);

/// A subscribed podcast
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Podcast {
    pub id: PodcastId,
    pub title: String,
    pub author: Option<String>,
    pub description: Option<String>,
    pub feed_url: String,
    pub image_url: Option<String>,
    /// Stored beside the library, see [`JsonFileBackend`](super::JsonFileBackend)
    #[serde(skip)]
    pub artwork: Option<Bytes>,
    /// Sticky per-podcast playback rate
    pub playback_rate: f32,
    pub subscribed_at: DateTime<Utc>,
}

/// A single episode of a subscribed podcast
///
/// Download status is not recorded here: the presence of its file in the
/// downloads directory is the only truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub id: EpisodeId,
    pub podcast_id: PodcastId,
    /// Stable across refetches; unique within the owning podcast
    pub guid: String,
    pub title: String,
    pub description: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub enclosure_url: String,
    pub mime_type: Option<String>,
    /// Seconds. Feed-declared until a download corrects it.
    pub duration: u32,
    /// Seconds into the episode at the last checkpoint
    pub last_listened_position: f64,
    pub listened: bool,
    pub chapters_url: Option<String>,
    pub image_url: Option<String>,
    #[serde(skip)]
    pub artwork: Option<Bytes>,
}

impl Episode {
    /// Identity string used to derive the on-disk download location.
    ///
    /// Built only from immutable identity (owning podcast and guid), never
    /// from the title or any other metadata a feed refresh could change.
    pub fn storage_key(&self) -> String {
        format!("{}-{}", self.podcast_id, self.guid)
    }
}

/// A chapter marker within an episode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    pub episode_id: EpisodeId,
    /// Whole seconds from the start of the episode
    pub start_time: u32,
    pub title: String,
    pub image_url: Option<String>,
    #[serde(skip)]
    pub artwork: Option<Bytes>,
}

/// A saved position within an episode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bookmark {
    pub id: BookmarkId,
    pub episode_id: EpisodeId,
    /// Whole seconds from the start of the episode
    pub position: u64,
    pub created_at: DateTime<Utc>,
}

/// User-level settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// How many of the most recent unlistened episodes per podcast to keep downloaded
    pub download_count: u16,
    pub last_refresh: Option<DateTime<Utc>>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            download_count: 3,
            last_refresh: None,
        }
    }
}

/// Podcast fields supplied when subscribing
#[derive(Debug, Clone)]
pub struct NewPodcast {
    pub title: String,
    pub author: Option<String>,
    pub description: Option<String>,
    pub feed_url: String,
    pub image_url: Option<String>,
    pub playback_rate: f32,
}

/// Episode fields supplied when inserting
#[derive(Debug, Clone)]
pub struct NewEpisode {
    pub guid: String,
    pub title: String,
    pub description: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub enclosure_url: String,
    pub mime_type: Option<String>,
    pub duration: u32,
    pub listened: bool,
    pub chapters_url: Option<String>,
    pub image_url: Option<String>,
}

/// Chapter fields supplied when replacing an episode's chapter list
#[derive(Debug, Clone, PartialEq)]
pub struct NewChapter {
    pub start_time: u32,
    pub title: String,
    pub image_url: Option<String>,
    pub artwork: Option<Bytes>,
}
