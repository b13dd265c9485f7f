// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use chrono::{DateTime, FixedOffset, Utc};

use crate::error::FeedError;

/// A parsed podcast channel, as delivered by a feed
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelRecord {
    pub title: String,
    pub description: Option<String>,
    pub link: Option<String>,
    pub author: Option<String>,
    pub image_url: Option<String>,
    pub feed_url: String,
    /// Sorted by publication date, newest first
    pub episodes: Vec<EpisodeRecord>,
}

/// A single episode entry of a feed
#[derive(Debug, Clone, PartialEq)]
pub struct EpisodeRecord {
    /// Falls back to the enclosure URL when the item has no guid
    pub guid: String,
    pub title: String,
    pub description: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub enclosure_url: String,
    pub enclosure_length: Option<u64>,
    pub mime_type: Option<String>,
    /// Declared duration in seconds
    pub duration: Option<u32>,
    pub image_url: Option<String>,
    /// Podcasting 2.0 `podcast:chapters` document
    pub chapters_url: Option<String>,
}

/// Parse RSS feed XML bytes into a channel record
pub fn parse_feed(xml_bytes: &[u8], feed_url: &str) -> Result<ChannelRecord, FeedError> {
    let channel = rss::Channel::read_from(xml_bytes)?;

    let mut episodes: Vec<EpisodeRecord> = channel
        .items()
        .iter()
        .filter_map(|item| parse_episode(item).ok())
        .collect();
    // Undated items sort after dated ones; the stable sort keeps feed order otherwise
    episodes.sort_by(|a, b| match (a.published_at, b.published_at) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });

    let image_url = channel
        .image()
        .map(|img| img.url().to_string())
        .or_else(|| {
            channel
                .itunes_ext()
                .and_then(|ext| ext.image())
                .map(String::from)
        });

    let author = channel
        .itunes_ext()
        .and_then(|ext| ext.author().map(String::from))
        .or_else(|| channel.managing_editor().map(String::from));

    Ok(ChannelRecord {
        title: channel.title().to_string(),
        description: Some(channel.description().to_string()).filter(|s| !s.is_empty()),
        link: Some(channel.link().to_string()).filter(|s| !s.is_empty()),
        author,
        image_url,
        feed_url: feed_url.to_string(),
        episodes,
    })
}

fn parse_episode(item: &rss::Item) -> Result<EpisodeRecord, FeedError> {
    let title = item
        .title()
        .map(String::from)
        .unwrap_or_else(|| "Untitled Episode".to_string());

    let enclosure = item
        .enclosure()
        .ok_or_else(|| FeedError::MissingEnclosure {
            title: title.clone(),
        })?;

    let published_at = item.pub_date().and_then(|date_str| {
        DateTime::parse_from_rfc2822(date_str)
            .ok()
            .or_else(|| parse_relaxed_date(date_str))
            .map(|dt| dt.with_timezone(&Utc))
    });

    let guid = item
        .guid()
        .map(|g| g.value().to_string())
        .filter(|g| !g.is_empty())
        .unwrap_or_else(|| enclosure.url().to_string());

    let itunes = item.itunes_ext();

    Ok(EpisodeRecord {
        guid,
        title,
        description: item.description().map(String::from),
        published_at,
        enclosure_url: enclosure.url().to_string(),
        enclosure_length: enclosure.length().parse().ok(),
        mime_type: Some(enclosure.mime_type().to_string()).filter(|s| !s.is_empty()),
        duration: itunes
            .and_then(|ext| ext.duration())
            .and_then(parse_duration),
        image_url: itunes.and_then(|ext| ext.image()).map(String::from),
        chapters_url: chapters_url(item),
    })
}

fn chapters_url(item: &rss::Item) -> Option<String> {
    item.extensions()
        .get("podcast")?
        .get("chapters")?
        .first()?
        .attrs()
        .get("url")
        .cloned()
}

/// Parse an itunes duration: `HH:MM:SS`, `MM:SS` or plain seconds
pub fn parse_duration(value: &str) -> Option<u32> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    let mut total: u32 = 0;
    let parts: Vec<&str> = value.split(':').collect();
    if parts.len() > 3 {
        return None;
    }
    for part in parts {
        // Some feeds use fractional seconds
        let seconds = part.trim().parse::<f64>().ok()?;
        if seconds < 0.0 {
            return None;
        }
        total = total.checked_mul(60)?.checked_add(seconds.floor() as u32)?;
    }
    Some(total)
}

/// Try to parse dates that don't strictly conform to RFC 2822
fn parse_relaxed_date(date_str: &str) -> Option<DateTime<FixedOffset>> {
    let formats = [
        "%a, %d %b %Y %H:%M:%S %z",
        "%Y-%m-%dT%H:%M:%S%:z",
        "%Y-%m-%d %H:%M:%S %z",
    ];

    formats
        .iter()
        .find_map(|format| DateTime::parse_from_str(date_str.trim(), format).ok())
}
