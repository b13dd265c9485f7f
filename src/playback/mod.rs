// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The single playback session: transport, timers, chapters and queue.

mod chapters;
mod engine;
mod media;

pub use chapters::{chapter_at, chapter_index_at, fetch_chapters};
pub use engine::{PlaybackEngine, PlaybackSnapshot, PlayerState};
pub use media::{MediaBackend, MediaHandle, PlayableSource, SeekCompletion, SilentBackend};
