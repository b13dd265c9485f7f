// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use url::Url;

use crate::error::PlaybackError;

/// Where an episode is played from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayableSource {
    Local(PathBuf),
    Remote(Url),
}

impl PlayableSource {
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }
}

impl fmt::Display for PlayableSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(path) => write!(f, "{}", path.display()),
            Self::Remote(url) => write!(f, "{url}"),
        }
    }
}

/// Resolves to `true` when the seek landed, `false` if it was interrupted
pub type SeekCompletion = Pin<Box<dyn Future<Output = bool> + Send>>;

/// One opened media item on the platform transport
///
/// Dropping the handle releases it.
pub trait MediaHandle: Send {
    fn play(&mut self, rate: f32);
    fn pause(&mut self);
    /// Current transport position in seconds
    fn position(&self) -> f64;
    /// Real duration in seconds, once the transport knows it
    fn duration(&self) -> Option<f64>;
    fn set_rate(&mut self, rate: f32);
    fn seek(&mut self, to: f64) -> SeekCompletion;
}

/// Platform media transport
pub trait MediaBackend: Send + Sync {
    fn open(&self, source: &PlayableSource) -> Result<Box<dyn MediaHandle>, PlaybackError>;
}

/// A transport that keeps time like a real player but produces no sound.
///
/// Position advances with the tokio clock, scaled by the rate, so it can be
/// driven deterministically with a paused clock. Useful for headless runs.
#[derive(Debug, Default)]
pub struct SilentBackend {
    durations: Mutex<HashMap<String, f64>>,
    default_duration: Option<f64>,
    seek_latency: Duration,
    live: Arc<AtomicUsize>,
    opened: Mutex<Vec<PlayableSource>>,
}

impl SilentBackend {
    /// Every opened source reports `default_duration` seconds
    pub fn new(default_duration: Option<f64>) -> Self {
        Self {
            default_duration,
            ..Default::default()
        }
    }

    /// Seeks complete only after `latency`
    pub fn with_seek_latency(mut self, latency: Duration) -> Self {
        self.seek_latency = latency;
        self
    }

    /// Override the duration reported for one source
    pub fn set_duration(&self, source: &PlayableSource, seconds: f64) {
        self.durations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(source.to_string(), seconds);
    }

    /// Number of handles that have not been dropped yet
    pub fn live_handles(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Sources in the order they were opened
    pub fn opened(&self) -> Vec<PlayableSource> {
        self.opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl MediaBackend for SilentBackend {
    fn open(&self, source: &PlayableSource) -> Result<Box<dyn MediaHandle>, PlaybackError> {
        let duration = self
            .durations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&source.to_string())
            .copied()
            .or(self.default_duration);

        self.opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(source.clone());
        self.live.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(SilentHandle {
            duration,
            anchor_position: 0.0,
            playing_since: None,
            rate: 1.0,
            seek_latency: self.seek_latency,
            live: self.live.clone(),
        }))
    }
}

struct SilentHandle {
    duration: Option<f64>,
    anchor_position: f64,
    playing_since: Option<Instant>,
    rate: f32,
    seek_latency: Duration,
    live: Arc<AtomicUsize>,
}

impl SilentHandle {
    fn clamp(&self, position: f64) -> f64 {
        let position = position.max(0.0);
        match self.duration {
            Some(duration) => position.min(duration),
            None => position,
        }
    }

    /// Fold elapsed playing time into the anchor
    fn settle(&mut self) {
        self.anchor_position = self.position();
        if self.playing_since.is_some() {
            self.playing_since = Some(Instant::now());
        }
    }
}

impl MediaHandle for SilentHandle {
    fn play(&mut self, rate: f32) {
        self.settle();
        self.rate = rate;
        self.playing_since.get_or_insert_with(Instant::now);
    }

    fn pause(&mut self) {
        self.settle();
        self.playing_since = None;
    }

    fn position(&self) -> f64 {
        let elapsed = self
            .playing_since
            .map(|since| since.elapsed().as_secs_f64() * f64::from(self.rate))
            .unwrap_or(0.0);
        self.clamp(self.anchor_position + elapsed)
    }

    fn duration(&self) -> Option<f64> {
        self.duration
    }

    fn set_rate(&mut self, rate: f32) {
        self.settle();
        self.rate = rate;
    }

    fn seek(&mut self, to: f64) -> SeekCompletion {
        self.anchor_position = self.clamp(to);
        if self.playing_since.is_some() {
            self.playing_since = Some(Instant::now());
        }
        let latency = self.seek_latency;
        Box::pin(async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            true
        })
    }
}

impl Drop for SilentHandle {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}
