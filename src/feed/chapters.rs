// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use serde::Deserialize;

use crate::error::FeedError;

/// A chapter entry from a chapters document, in declared order
#[derive(Debug, Clone, PartialEq)]
pub struct ChapterRecord {
    /// Whole seconds; fractional start times are floored
    pub start_time: u32,
    pub title: String,
    pub image_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChaptersDocument {
    #[allow(dead_code)]
    version: Option<String>,
    chapters: Vec<ChapterEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChapterEntry {
    start_time: f64,
    title: Option<String>,
    img: Option<String>,
}

/// Decode a Podcasting 2.0 JSON chapters document
pub fn parse_chapters(json: &[u8], url: &str) -> Result<Vec<ChapterRecord>, FeedError> {
    let document: ChaptersDocument =
        serde_json::from_slice(json).map_err(|e| FeedError::ChaptersParseFailed {
            url: url.to_string(),
            source: e,
        })?;

    Ok(document
        .chapters
        .into_iter()
        .map(|entry| ChapterRecord {
            start_time: entry.start_time.max(0.0).floor() as u32,
            title: entry.title.unwrap_or_default(),
            image_url: entry.img.filter(|s| !s.is_empty()),
        })
        .collect())
}
