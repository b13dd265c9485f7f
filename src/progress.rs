// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::Arc;

use crate::download::TaskId;

/// Events emitted by transfers and refresh cycles for progress reporting
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// A feed is being fetched
    FetchingFeed { url: String },

    /// A feed has been parsed and merged into the catalog
    FeedMerged {
        podcast_title: String,
        total_episodes: usize,
        new_episodes: usize,
    },

    /// A transfer received its response and is about to stream
    TransferStarting {
        task: TaskId,
        label: String,
        /// Expected content length in bytes, if known
        content_length: Option<u64>,
    },

    /// Transfer progress update
    TransferProgress {
        task: TaskId,
        label: String,
        bytes_downloaded: u64,
        total_bytes: Option<u64>,
    },

    /// A transfer wrote its last byte to the staging file
    TransferCompleted {
        task: TaskId,
        label: String,
        bytes_downloaded: u64,
    },

    /// A transfer failed
    TransferFailed {
        task: TaskId,
        label: String,
        error: String,
    },

    /// A refresh cycle finished
    RefreshCompleted {
        podcasts: usize,
        new_episodes: usize,
        downloads_started: usize,
        evicted: usize,
    },
}

/// Trait for reporting progress events.
///
/// Implementations can use this to display progress bars, log messages,
/// or collect statistics.
pub trait ProgressReporter: Send + Sync {
    /// Report a progress event
    fn report(&self, event: ProgressEvent);
}

/// A shared reference to a progress reporter
pub type SharedProgressReporter = Arc<dyn ProgressReporter>;

/// A no-op progress reporter that silently ignores all events.
/// Useful for tests or quiet mode.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {
    fn report(&self, _event: ProgressEvent) {}
}

impl NoopReporter {
    /// Create a new NoopReporter wrapped in an Arc
    pub fn shared() -> SharedProgressReporter {
        Arc::new(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CollectingReporter {
        events: Mutex<Vec<ProgressEvent>>,
    }

    impl ProgressReporter for CollectingReporter {
        fn report(&self, event: ProgressEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[test]
    fn noop_reporter_accepts_events() {
        let reporter = NoopReporter::shared();
        reporter.report(ProgressEvent::FetchingFeed {
            url: "https://example.com/feed.xml".to_string(),
        });
        reporter.report(ProgressEvent::RefreshCompleted {
            podcasts: 1,
            new_episodes: 0,
            downloads_started: 0,
            evicted: 0,
        });
    }

    #[test]
    fn shared_reporter_can_be_used_as_trait_object() {
        let collector = Arc::new(CollectingReporter::default());
        let shared: SharedProgressReporter = collector.clone();

        shared.report(ProgressEvent::TransferProgress {
            task: TaskId(1),
            label: "Episode 1".to_string(),
            bytes_downloaded: 512,
            total_bytes: Some(1024),
        });
        shared.report(ProgressEvent::TransferCompleted {
            task: TaskId(1),
            label: "Episode 1".to_string(),
            bytes_downloaded: 1024,
        });

        let events = collector.events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[1],
            ProgressEvent::TransferCompleted {
                bytes_downloaded: 1024,
                ..
            }
        ));
    }
}
