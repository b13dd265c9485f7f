// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use futures::future::join_all;
use tracing::{debug, warn};

use crate::feed::FeedSource;
use crate::store::{Chapter, NewChapter};

/// Index of the chapter playing at `time`.
///
/// `chapters` must be sorted by start time. The current chapter is the last
/// one starting at or before `time`; before the first chapter there is none.
pub fn chapter_index_at(chapters: &[Chapter], time: f64) -> Option<usize> {
    if time.is_nan() {
        return None;
    }
    chapters
        .partition_point(|chapter| f64::from(chapter.start_time) <= time)
        .checked_sub(1)
}

pub fn chapter_at(chapters: &[Chapter], time: f64) -> Option<&Chapter> {
    chapter_index_at(chapters, time).map(|index| &chapters[index])
}

/// Fetch a chapters document together with chapter artwork.
///
/// Chapters are optional enrichment: any failure is logged and yields
/// `None`. Artwork that cannot be fetched is left out.
pub async fn fetch_chapters(feeds: &dyn FeedSource, url: &str) -> Option<Vec<NewChapter>> {
    let records = match feeds.fetch_chapters(url).await {
        Ok(records) => records,
        Err(e) => {
            warn!(url = %url, error = %e, "could not fetch chapters");
            return None;
        }
    };

    let artwork = join_all(records.iter().map(|record| async move {
        let image_url = record.image_url.as_deref()?;
        match feeds.fetch_artwork(image_url).await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                debug!(url = %image_url, error = %e, "could not fetch chapter artwork");
                None
            }
        }
    }))
    .await;

    Some(
        records
            .into_iter()
            .zip(artwork)
            .map(|(record, artwork)| NewChapter {
                start_time: record.start_time,
                title: record.title,
                image_url: record.image_url,
                artwork,
            })
            .collect(),
    )
}
