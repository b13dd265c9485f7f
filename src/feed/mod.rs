// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

mod chapters;
mod fetch;
mod parse;

pub use chapters::{ChapterRecord, parse_chapters};
pub use fetch::{
    FeedService, FeedSource, fetch_bytes, fetch_feed, is_url, parse_feed_file, upgrade_to_https,
};
pub use parse::{ChannelRecord, EpisodeRecord, parse_duration, parse_feed};
