// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Display projections over catalog records and freshly fetched feed records.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use html_escape::decode_html_entities;

use crate::feed::{ChannelRecord, EpisodeRecord};
use crate::store::{Episode, EpisodeId, Podcast, PodcastId};

/// A podcast as shown in a list: either subscribed or a remote result
#[derive(Debug, Clone)]
pub enum PodcastSource {
    Catalog(Podcast),
    Remote(ChannelRecord),
}

/// An episode as shown in a list
#[derive(Debug, Clone)]
pub enum EpisodeSource {
    Catalog {
        episode: Episode,
        podcast: Option<Podcast>,
    },
    Remote {
        record: EpisodeRecord,
        channel_title: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PodcastSummary {
    pub id: Option<PodcastId>,
    pub title: String,
    pub author: Option<String>,
    /// Plain text
    pub description: String,
    pub feed_url: String,
    pub image_url: Option<String>,
    pub artwork: Option<Bytes>,
    pub subscribed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EpisodeSummary {
    pub id: Option<EpisodeId>,
    pub title: String,
    pub podcast_title: String,
    /// Plain text
    pub description: String,
    pub published_at: Option<DateTime<Utc>>,
    /// Seconds; `None` when unknown
    pub duration: Option<u32>,
    /// Seconds
    pub position: f64,
    pub listened: bool,
    pub image_url: Option<String>,
    pub artwork: Option<Bytes>,
}

impl EpisodeSummary {
    /// Fraction listened, in `0.0..=1.0`
    pub fn progress(&self) -> f64 {
        match self.duration {
            Some(duration) if duration > 0 => (self.position / f64::from(duration)).clamp(0.0, 1.0),
            _ => 0.0,
        }
    }
}

impl PodcastSource {
    pub fn summary(&self) -> PodcastSummary {
        match self {
            Self::Catalog(podcast) => PodcastSummary {
                id: Some(podcast.id),
                title: podcast.title.clone(),
                author: podcast.author.clone(),
                description: plain_text(podcast.description.as_deref().unwrap_or_default()),
                feed_url: podcast.feed_url.clone(),
                image_url: podcast.image_url.clone(),
                artwork: podcast.artwork.clone(),
                subscribed: true,
            },
            Self::Remote(channel) => PodcastSummary {
                id: None,
                title: channel.title.clone(),
                author: channel.author.clone(),
                description: plain_text(channel.description.as_deref().unwrap_or_default()),
                feed_url: channel.feed_url.clone(),
                image_url: channel.image_url.clone(),
                artwork: None,
                subscribed: false,
            },
        }
    }
}

impl EpisodeSource {
    pub fn summary(&self) -> EpisodeSummary {
        match self {
            Self::Catalog { episode, podcast } => EpisodeSummary {
                id: Some(episode.id),
                title: episode.title.clone(),
                podcast_title: podcast.as_ref().map(|p| p.title.clone()).unwrap_or_default(),
                description: plain_text(episode.description.as_deref().unwrap_or_default()),
                published_at: episode.published_at,
                duration: (episode.duration > 0).then_some(episode.duration),
                position: episode.last_listened_position,
                listened: episode.listened,
                image_url: episode.image_url.clone(),
                artwork: episode
                    .artwork
                    .clone()
                    .or_else(|| podcast.as_ref().and_then(|p| p.artwork.clone())),
            },
            Self::Remote {
                record,
                channel_title,
            } => EpisodeSummary {
                id: None,
                title: record.title.clone(),
                podcast_title: channel_title.clone(),
                description: plain_text(record.description.as_deref().unwrap_or_default()),
                published_at: record.published_at,
                duration: record.duration,
                position: 0.0,
                listened: false,
                image_url: record.image_url.clone(),
                artwork: None,
            },
        }
    }
}

/// Player clock: `MM:SS`, or `H:MM:SS` from one hour on
pub fn format_time(seconds: f64) -> String {
    let total = if seconds.is_finite() && seconds > 0.0 {
        seconds as u64
    } else {
        0
    };
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{h}:{m:02}:{s:02}")
    } else {
        format!("{m:02}:{s:02}")
    }
}

/// Compact length: `1h 5m`, or `42m` under an hour
pub fn short_duration(seconds: u32) -> String {
    let (h, m) = (seconds / 3600, (seconds % 3600) / 60);
    if h > 0 {
        format!("{h}h {m}m")
    } else {
        format!("{m}m")
    }
}

/// Publication date relative to `now`
pub fn relative_date(date: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let days = (now.date_naive() - date.date_naive()).num_days();
    match days {
        0 => "Today".to_string(),
        1 => "Yesterday".to_string(),
        2..=6 => format!("{days} days ago"),
        7 => "1 week ago".to_string(),
        _ => date.format("%b %-d").to_string(),
    }
}

/// Reduce show notes to plain text: tags dropped, entities decoded,
/// whitespace collapsed
pub fn plain_text(html: &str) -> String {
    let mut stripped = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => {
                in_tag = true;
                stripped.push(' ');
            }
            '>' if in_tag => in_tag = false,
            _ if !in_tag => stripped.push(c),
            _ => {}
        }
    }

    decode_html_entities(&stripped)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
