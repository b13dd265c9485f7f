// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use url::Url;

use crate::catalog::Catalog;
use crate::config::PlaybackConfig;
use crate::download::DownloadCoordinator;
use crate::error::PlaybackError;
use crate::feed::FeedSource;
use crate::store::{BookmarkId, Chapter, Episode, EpisodeId, Podcast};

use super::chapters::{chapter_index_at, fetch_chapters};
use super::media::{MediaBackend, MediaHandle, PlayableSource};

/// Player state machine: `Stopped -> Loading -> Playing <-> Paused -> Stopped`.
/// `Failed` is entered from `Loading` when nothing could be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlayerState {
    #[default]
    Stopped,
    Loading,
    Playing,
    Paused,
    Failed,
}

/// Everything observers need to render the player
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaybackSnapshot {
    pub state: PlayerState,
    pub episode: Option<EpisodeId>,
    pub title: Option<String>,
    /// Seconds
    pub time: f64,
    /// Seconds
    pub duration: f64,
    pub rate: f32,
    pub is_playing: bool,
    /// A scrub is in progress; `time` is the scrub target
    pub seeking: bool,
    pub chapter: Option<Chapter>,
    pub artwork: Option<Bytes>,
    /// Bumped whenever `artwork` was recomputed
    pub artwork_revision: u64,
    pub pending: Vec<EpisodeId>,
}

struct Current {
    episode: Episode,
    podcast: Option<Podcast>,
    handle: Box<dyn MediaHandle>,
    chapters: Vec<Chapter>,
    chapter: Option<usize>,
    rate: f32,
    time: f64,
    duration: f64,
    artwork: Option<Bytes>,
}

impl Current {
    /// Chapter artwork, else episode artwork, else podcast artwork
    fn resolve_artwork(&self) -> Option<Bytes> {
        self.chapter
            .and_then(|index| self.chapters[index].artwork.clone())
            .or_else(|| self.episode.artwork.clone())
            .or_else(|| self.podcast.as_ref().and_then(|p| p.artwork.clone()))
    }
}

#[derive(Default)]
struct Session {
    /// Bumped for every new session; stale timers and callbacks compare it
    generation: u64,
    state: PlayerState,
    current: Option<Current>,
    pending: VecDeque<EpisodeId>,
    seeking: bool,
    seek_serial: u64,
    resume_after_interruption: bool,
    last_checkpoint: Option<Instant>,
    ticker: Option<JoinHandle<()>>,
    artwork_revision: u64,
}

/// A position to persist once the session lock is released
struct Checkpoint {
    episode: EpisodeId,
    time: f64,
}

enum Tick {
    Continue,
    Ended,
    Stop,
}

struct Shared {
    catalog: Arc<Catalog>,
    downloads: Arc<DownloadCoordinator>,
    feeds: Arc<dyn FeedSource>,
    media: Arc<dyn MediaBackend>,
    config: PlaybackConfig,
    session: Mutex<Session>,
    snapshot: watch::Sender<PlaybackSnapshot>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot_of(&self, session: &Session) -> PlaybackSnapshot {
        let current = session.current.as_ref();
        PlaybackSnapshot {
            state: session.state,
            episode: current.map(|c| c.episode.id),
            title: current.map(|c| c.episode.title.clone()),
            time: current.map_or(0.0, |c| c.time),
            duration: current.map_or(0.0, |c| c.duration),
            rate: current.map_or(self.config.default_rate, |c| c.rate),
            is_playing: session.state == PlayerState::Playing,
            seeking: session.seeking,
            chapter: current.and_then(|c| c.chapter.map(|index| c.chapters[index].clone())),
            artwork: current.and_then(|c| c.artwork.clone()),
            artwork_revision: session.artwork_revision,
            pending: session.pending.iter().copied().collect(),
        }
    }

    fn publish(&self, session: &Session) {
        self.snapshot.send_replace(self.snapshot_of(session));
    }

    /// Take a checkpoint; the caller writes it with [`Self::save`] after
    /// unlocking the session
    fn checkpoint(&self, session: &mut Session) -> Option<Checkpoint> {
        session.last_checkpoint = Some(Instant::now());
        session.current.as_ref().map(|current| Checkpoint {
            episode: current.episode.id,
            time: current.time,
        })
    }

    fn save(&self, checkpoint: Option<Checkpoint>) {
        if let Some(Checkpoint { episode, time }) = checkpoint
            && let Err(e) = self.catalog.save_position(episode, time)
        {
            warn!(episode = %episode, error = %e, "could not save position");
        }
    }

    /// Stop timers, checkpoint the position and release the media handle
    #[must_use]
    fn teardown(&self, session: &mut Session) -> Option<Checkpoint> {
        if let Some(ticker) = session.ticker.take() {
            ticker.abort();
        }
        if let Some(current) = session.current.as_mut()
            && !session.seeking
        {
            current.time = current.handle.position();
        }
        let checkpoint = self.checkpoint(session);
        if let Some(mut current) = session.current.take() {
            current.handle.pause();
            debug!(episode = %current.episode.id, "session torn down");
        }
        session.seeking = false;
        session.resume_after_interruption = false;
        checkpoint
    }

    /// Recompute the current chapter; artwork only follows a chapter change
    fn refresh_chapter(&self, session: &mut Session, force: bool) {
        let Some(current) = session.current.as_mut() else {
            return;
        };
        let index = chapter_index_at(&current.chapters, current.time);
        if force || index != current.chapter {
            current.chapter = index;
            current.artwork = current.resolve_artwork();
            session.artwork_revision += 1;
        }
    }

    fn tick(&self, generation: u64) -> Tick {
        let mut session = self.lock();
        if session.generation != generation {
            return Tick::Stop;
        }
        if session.state != PlayerState::Playing {
            return Tick::Continue;
        }

        let seeking = session.seeking;
        let Some(current) = session.current.as_mut() else {
            return Tick::Stop;
        };
        if !seeking {
            current.time = current.handle.position();
        }
        if let Some(duration) = current.handle.duration().filter(|d| *d > 0.0) {
            current.duration = duration;
        }
        let ended = !seeking
            && current.duration > 0.0
            && current.duration - current.time < self.config.end_epsilon_secs;

        self.refresh_chapter(&mut session, false);

        let due = session
            .last_checkpoint
            .is_none_or(|at| at.elapsed() > self.config.save_frequency());
        let checkpoint = if due && !ended {
            self.checkpoint(&mut session)
        } else {
            None
        };

        self.publish(&session);
        drop(session);
        self.save(checkpoint);
        if ended { Tick::Ended } else { Tick::Continue }
    }
}

async fn run_ticker(shared: Weak<Shared>, generation: u64, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    interval.tick().await;

    loop {
        interval.tick().await;
        let Some(shared) = shared.upgrade() else {
            break;
        };
        match shared.tick(generation) {
            Tick::Continue => {}
            Tick::Stop => break,
            Tick::Ended => {
                let engine = PlaybackEngine { shared };
                tokio::spawn(async move { engine.finish(generation).await });
                break;
            }
        }
    }
}

struct Opened {
    episode: Episode,
    podcast: Option<Podcast>,
    handle: Box<dyn MediaHandle>,
    duration: f64,
    start_at: f64,
}

/// Owns the single playback session of the process.
///
/// Cloning is cheap; all clones drive the same session.
#[derive(Clone)]
pub struct PlaybackEngine {
    shared: Arc<Shared>,
}

impl PlaybackEngine {
    pub fn new(
        catalog: Arc<Catalog>,
        downloads: Arc<DownloadCoordinator>,
        feeds: Arc<dyn FeedSource>,
        media: Arc<dyn MediaBackend>,
        config: PlaybackConfig,
    ) -> Self {
        let (snapshot, _) = watch::channel(PlaybackSnapshot {
            rate: config.default_rate,
            ..Default::default()
        });
        Self {
            shared: Arc::new(Shared {
                catalog,
                downloads,
                feeds,
                media,
                config,
                session: Mutex::new(Session::default()),
                snapshot,
            }),
        }
    }

    pub fn watch(&self) -> watch::Receiver<PlaybackSnapshot> {
        self.shared.snapshot.subscribe()
    }

    pub fn snapshot(&self) -> PlaybackSnapshot {
        let session = self.shared.lock();
        self.shared.snapshot_of(&session)
    }

    pub fn current_chapter(&self) -> Option<Chapter> {
        self.snapshot().chapter
    }

    /// Local file if downloaded, otherwise the remote enclosure
    pub fn resolve_source(&self, episode: &Episode) -> Option<PlayableSource> {
        if let Some(path) = self.shared.downloads.local_file(episode) {
            return Some(PlayableSource::Local(path));
        }
        let url = Url::parse(&episode.enclosure_url).ok()?;
        matches!(url.scheme(), "http" | "https").then_some(PlayableSource::Remote(url))
    }

    /// Play an episode, replacing the current session and clearing the queue.
    ///
    /// If the episode cannot be opened the current session stays untouched.
    pub async fn start_playing_episode(&self, episode: EpisodeId) -> Result<(), PlaybackError> {
        self.start(episode, Some(VecDeque::new())).await
    }

    /// Play `episode` and queue everything after it in `list`
    pub async fn load_episode_and_playlist(
        &self,
        episode: EpisodeId,
        list: &[EpisodeId],
    ) -> Result<(), PlaybackError> {
        let pending = list
            .iter()
            .position(|id| *id == episode)
            .map(|index| list[index + 1..].iter().copied().collect())
            .unwrap_or_default();
        self.start(episode, Some(pending)).await
    }

    async fn start(
        &self,
        episode: EpisodeId,
        pending: Option<VecDeque<EpisodeId>>,
    ) -> Result<(), PlaybackError> {
        let shared = &self.shared;

        let (record, source) = match self.resolve(episode) {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(episode = %episode, error = %e, "could not start playback");
                let mut session = shared.lock();
                if session.current.is_none() {
                    session.state = PlayerState::Failed;
                    shared.publish(&session);
                }
                return Err(e);
            }
        };

        // The new media is only opened once the old session is gone
        let checkpoint = {
            let mut session = shared.lock();
            let checkpoint = shared.teardown(&mut session);
            session.state = PlayerState::Loading;
            shared.publish(&session);
            checkpoint
        };
        shared.save(checkpoint);

        let opened = match self.open(record, &source).await {
            Ok(opened) => opened,
            Err(e) => {
                warn!(episode = %episode, source = %source, error = %e, "could not open media");
                let mut session = shared.lock();
                if session.current.is_none() {
                    session.state = PlayerState::Failed;
                    shared.publish(&session);
                }
                return Err(e);
            }
        };

        let rate = opened
            .podcast
            .as_ref()
            .map(|p| p.playback_rate)
            .filter(|rate| *rate > 0.0)
            .unwrap_or(shared.config.default_rate);
        let chapters = shared.catalog.chapters(episode);
        let chapters_url = opened
            .episode
            .chapters_url
            .clone()
            .filter(|_| chapters.is_empty());

        let (generation, checkpoint) = {
            let mut session = shared.lock();
            // Another start may have installed a session while this one loaded
            let checkpoint = shared.teardown(&mut session);

            let mut handle = opened.handle;
            handle.play(rate);

            session.generation += 1;
            let generation = session.generation;
            session.current = Some(Current {
                episode: opened.episode,
                podcast: opened.podcast,
                handle,
                chapters,
                chapter: None,
                rate,
                time: opened.start_at,
                duration: opened.duration,
                artwork: None,
            });
            if let Some(pending) = pending {
                session.pending = pending;
            }
            session.state = PlayerState::Playing;
            session.last_checkpoint = Some(Instant::now());
            shared.refresh_chapter(&mut session, true);
            session.ticker = Some(tokio::spawn(run_ticker(
                Arc::downgrade(shared),
                generation,
                shared.config.tick_interval(),
            )));
            shared.publish(&session);
            (generation, checkpoint)
        };
        shared.save(checkpoint);

        info!(episode = %episode, rate, "playback started");
        if let Some(url) = chapters_url {
            self.spawn_chapter_load(generation, episode, url);
        }
        Ok(())
    }

    /// Look up an episode and pick its source without touching the session
    fn resolve(&self, episode: EpisodeId) -> Result<(Episode, PlayableSource), PlaybackError> {
        let record = self
            .shared
            .catalog
            .episode(episode)
            .ok_or(PlaybackError::EpisodeNotFound(episode))?;
        let source = self
            .resolve_source(&record)
            .ok_or(PlaybackError::NoPlayableSource(episode))?;
        Ok((record, source))
    }

    /// Open the media and seek to the resume position
    async fn open(&self, record: Episode, source: &PlayableSource) -> Result<Opened, PlaybackError> {
        let shared = &self.shared;
        let episode = record.id;

        debug!(episode = %episode, source = %source, "opening media");
        let mut handle = shared.media.open(source)?;

        let duration = handle
            .duration()
            .filter(|d| *d > 0.0)
            .unwrap_or(f64::from(record.duration));
        let resume = record.last_listened_position;
        let start_at = if resume > 0.0
            && (duration <= 0.0 || resume < duration - shared.config.end_epsilon_secs)
        {
            resume
        } else {
            0.0
        };
        if start_at > 0.0 && !handle.seek(start_at).await {
            debug!(episode = %episode, "resume seek interrupted");
        }

        let podcast = shared.catalog.podcast(record.podcast_id);
        Ok(Opened {
            episode: record,
            podcast,
            handle,
            duration,
            start_at,
        })
    }

    /// Load chapters the catalog does not have yet, in the background
    fn spawn_chapter_load(&self, generation: u64, episode: EpisodeId, url: String) {
        let engine = self.clone();
        tokio::spawn(async move {
            let feeds = engine.shared.feeds.clone();
            let loaded = engine
                .shared
                .catalog
                .update_chapters(episode, |existing| async move {
                    if !existing.is_empty() {
                        return None;
                    }
                    fetch_chapters(feeds.as_ref(), &url).await
                })
                .await;

            match loaded {
                Ok(_) => engine.reload_chapters(generation, episode),
                Err(e) => warn!(episode = %episode, error = %e, "could not store chapters"),
            }
        });
    }

    fn reload_chapters(&self, generation: u64, episode: EpisodeId) {
        let shared = &self.shared;
        let mut session = shared.lock();
        if session.generation != generation {
            return;
        }
        let Some(current) = session.current.as_mut() else {
            return;
        };
        current.chapters = shared.catalog.chapters(episode);
        debug!(episode = %episode, count = current.chapters.len(), "chapters loaded");
        shared.refresh_chapter(&mut session, true);
        shared.publish(&session);
    }

    pub fn play(&self) -> Result<(), PlaybackError> {
        let shared = &self.shared;
        let mut session = shared.lock();
        let state = session.state;
        let current = session.current.as_mut().ok_or(PlaybackError::NoSession)?;
        if state != PlayerState::Playing {
            current.handle.play(current.rate);
            session.state = PlayerState::Playing;
            shared.publish(&session);
        }
        Ok(())
    }

    /// Pause and checkpoint the position
    pub fn pause(&self) -> Result<(), PlaybackError> {
        let shared = &self.shared;
        let mut session = shared.lock();
        let state = session.state;
        let seeking = session.seeking;
        let current = session.current.as_mut().ok_or(PlaybackError::NoSession)?;
        if state == PlayerState::Playing {
            current.handle.pause();
            if !seeking {
                current.time = current.handle.position();
            }
            session.state = PlayerState::Paused;
            let checkpoint = shared.checkpoint(&mut session);
            shared.publish(&session);
            drop(session);
            shared.save(checkpoint);
        }
        Ok(())
    }

    pub fn play_pause(&self) -> Result<(), PlaybackError> {
        if self.snapshot().is_playing {
            self.pause()
        } else {
            self.play()
        }
    }

    /// End the session and drop the queue
    pub fn stop(&self) {
        let shared = &self.shared;
        let mut session = shared.lock();
        let checkpoint = shared.teardown(&mut session);
        session.pending.clear();
        session.state = PlayerState::Stopped;
        shared.publish(&session);
        drop(session);
        shared.save(checkpoint);
    }

    /// Seek to an absolute position.
    ///
    /// Until the transport confirms the seek, timer ticks leave the reported
    /// time at the target.
    pub async fn seek(&self, to: f64) -> Result<(), PlaybackError> {
        let shared = &self.shared;
        let (generation, serial, completion) = {
            let mut session = shared.lock();
            let current = session.current.as_mut().ok_or(PlaybackError::NoSession)?;
            let upper = if current.duration > 0.0 {
                current.duration
            } else {
                f64::MAX
            };
            let target = to.clamp(0.0, upper);
            current.time = target;
            let completion = current.handle.seek(target);

            session.seeking = true;
            session.seek_serial += 1;
            shared.refresh_chapter(&mut session, false);
            shared.publish(&session);
            (session.generation, session.seek_serial, completion)
        };

        let landed = completion.await;

        let mut session = shared.lock();
        // A newer seek or session owns the flag now
        if session.generation == generation && session.seek_serial == serial {
            session.seeking = false;
            if landed && let Some(current) = session.current.as_mut() {
                current.time = current.handle.position();
            }
            shared.refresh_chapter(&mut session, false);
            shared.publish(&session);
        }
        Ok(())
    }

    /// Seek relative to the current time
    pub async fn skip_by(&self, delta: f64) -> Result<(), PlaybackError> {
        let time = {
            let session = self.shared.lock();
            session
                .current
                .as_ref()
                .map(|c| c.time)
                .ok_or(PlaybackError::NoSession)?
        };
        self.seek(time + delta).await
    }

    pub async fn skip_forward(&self) -> Result<(), PlaybackError> {
        self.skip_by(self.shared.config.skip_forward_secs).await
    }

    pub async fn skip_backward(&self) -> Result<(), PlaybackError> {
        self.skip_by(-self.shared.config.skip_backward_secs).await
    }

    /// Change the rate of the live transport and remember it for the podcast
    pub fn set_rate(&self, rate: f32) -> Result<(), PlaybackError> {
        if !rate.is_finite() || rate <= 0.0 {
            warn!(rate, "ignoring invalid playback rate");
            return Ok(());
        }

        let shared = &self.shared;
        let podcast_id = {
            let mut session = shared.lock();
            let state = session.state;
            let current = session.current.as_mut().ok_or(PlaybackError::NoSession)?;

            current.rate = rate;
            if state == PlayerState::Playing {
                current.handle.set_rate(rate);
            }
            if let Some(podcast) = current.podcast.as_mut() {
                podcast.playback_rate = rate;
            }
            let podcast_id = current.episode.podcast_id;
            shared.publish(&session);
            podcast_id
        };

        if let Err(e) = shared.catalog.set_playback_rate(podcast_id, rate) {
            warn!(podcast = %podcast_id, error = %e, "could not persist playback rate");
        }
        Ok(())
    }

    /// Another audio session took over; pause without giving up the session
    pub fn interruption_began(&self) {
        let shared = &self.shared;
        let mut session = shared.lock();
        if session.state != PlayerState::Playing {
            return;
        }
        if let Some(current) = session.current.as_mut() {
            current.handle.pause();
            current.time = current.handle.position();
        }
        session.state = PlayerState::Paused;
        session.resume_after_interruption = true;
        let checkpoint = shared.checkpoint(&mut session);
        shared.publish(&session);
        drop(session);
        shared.save(checkpoint);
        info!("playback interrupted");
    }

    /// The interruption is over; resume only when asked to and when the
    /// interruption was what paused us
    pub fn interruption_ended(&self, should_resume: bool) {
        let shared = &self.shared;
        let mut session = shared.lock();
        let was_interrupted = std::mem::take(&mut session.resume_after_interruption);
        if !should_resume || !was_interrupted || session.state != PlayerState::Paused {
            return;
        }
        if let Some(current) = session.current.as_mut() {
            current.handle.play(current.rate);
            session.state = PlayerState::Playing;
            shared.publish(&session);
        }
    }

    /// Bookmark the current position of the current episode
    pub fn save_bookmark(&self) -> Result<BookmarkId, PlaybackError> {
        let (episode, position) = {
            let session = self.shared.lock();
            let current = session.current.as_ref().ok_or(PlaybackError::NoSession)?;
            (current.episode.id, current.time.max(0.0).floor() as u64)
        };
        Ok(self.shared.catalog.add_bookmark(episode, position)?)
    }

    /// Treat the current episode as finished: mark it listened and move on to
    /// the next queued episode, or stop when the queue is empty
    pub async fn finish_current_episode(&self) {
        let generation = self.shared.lock().generation;
        self.finish(generation).await;
    }

    /// Boxed because the ticker spawns it and `start` spawns the ticker
    fn finish(&self, generation: u64) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let shared = &self.shared;
            let (finished, mut next) = {
                let mut session = shared.lock();
                if session.generation != generation {
                    return;
                }
                let Some(current) = session.current.as_ref() else {
                    return;
                };
                let finished = current.episode.id;
                (finished, session.pending.pop_front())
            };

            if let Err(e) = shared.catalog.mark_listened(finished) {
                warn!(episode = %finished, error = %e, "could not mark episode listened");
            }
            info!(episode = %finished, "episode finished");

            while let Some(episode) = next {
                match self.start(episode, None).await {
                    Ok(()) => return,
                    Err(e) => {
                        warn!(episode = %episode, error = %e, "skipping unplayable queued episode");
                        next = shared.lock().pending.pop_front();
                    }
                }
            }

            let checkpoint = {
                let mut session = shared.lock();
                if session.generation != generation {
                    return;
                }
                let checkpoint = shared.teardown(&mut session);
                session.pending.clear();
                session.state = PlayerState::Stopped;
                shared.publish(&session);
                checkpoint
            };
            shared.save(checkpoint);
        })
    }
}
