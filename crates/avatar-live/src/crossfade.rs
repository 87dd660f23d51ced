//! **Audio Crossfade Manager**: Plays synthesized segments back-to-back.
//!
//! While a segment is playing, the next one fades in over `crossfade_ms`
//! (default 50ms) in `crossfade_steps` lockstep increments: outgoing `1 → 0`,
//! incoming `0 → 1`, so the two volumes always sum to one. Afterwards the
//! outgoing segment is stopped, rewound and released exactly once.
//!
//! Crossfades never overlap: a second `play_segment` waits for the running
//! crossfade to finish. `stop()` cancels everything and releases whatever is
//! playing.
//!
//! [`CrossfadeManager::enqueue`] feeds a FIFO queue drained by a single runner
//! that starts each segment when the current one has at most the crossfade
//! length left.

use crate::clock::sleep_or_cancel;
use crate::config::{AudioConfig, MAX_CROSSFADE_MS};
use crate::error::{LiveError, LiveResult};
use crate::playback::{AudioBlob, PlaybackSource, SourceFactory};
use crate::sync::lock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Playback commands the interruption pipeline issues.
pub trait PlaybackControl: Send + Sync {
    /// Halt and release whatever is playing; drop pending segments.
    fn stop(&self);
    fn pause(&self);
    fn resume(&self);
    fn is_playing(&self) -> bool;
}

/// A segment owned by the manager. Its source is released exactly once.
struct Segment {
    id: u64,
    label: String,
    source: Arc<dyn PlaybackSource>,
    released: AtomicBool,
}

impl Segment {
    fn release_once(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.source.stop();
        self.source.release();
        debug!(id = self.id, label = %self.label, "Segment released");
        true
    }

    fn is_finished(&self) -> bool {
        self.released.load(Ordering::Acquire) || self.source.is_finished()
    }
}

/// Result of [`CrossfadeManager::play_segment`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHandle {
    pub id: u64,
    pub label: String,
    /// False when the segment started from silence at full volume.
    pub crossfaded: bool,
}

/// Counters for the queue runner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackStats {
    pub played: u64,
    pub skipped: u64,
}

struct ManagerInner {
    config: AudioConfig,
    crossfade_ms: AtomicU64,
    factory: Arc<dyn SourceFactory>,
    current: Mutex<Option<Arc<Segment>>>,
    fading_out: Mutex<Option<Arc<Segment>>>,
    crossfading: AtomicBool,
    /// Serializes crossfades.
    fade_lock: tokio::sync::Mutex<()>,
    stop_token: Mutex<CancellationToken>,
    stop_epoch: AtomicU64,
    queue: Mutex<VecDeque<AudioBlob>>,
    running: AtomicBool,
    idle_tx: watch::Sender<bool>,
    paused: AtomicBool,
    next_id: AtomicU64,
    played: AtomicU64,
    skipped: AtomicU64,
}

#[derive(Clone)]
pub struct CrossfadeManager {
    inner: Arc<ManagerInner>,
}

impl CrossfadeManager {
    pub fn new(config: AudioConfig, factory: Arc<dyn SourceFactory>) -> Self {
        let (idle_tx, _) = watch::channel(true);
        let crossfade_ms = config.crossfade().as_millis() as u64;
        info!(crossfade_ms, steps = config.crossfade_steps, "🎧 Crossfade manager ready");
        Self {
            inner: Arc::new(ManagerInner {
                crossfade_ms: AtomicU64::new(crossfade_ms),
                config,
                factory,
                current: Mutex::new(None),
                fading_out: Mutex::new(None),
                crossfading: AtomicBool::new(false),
                fade_lock: tokio::sync::Mutex::new(()),
                stop_token: Mutex::new(CancellationToken::new()),
                stop_epoch: AtomicU64::new(0),
                queue: Mutex::new(VecDeque::new()),
                running: AtomicBool::new(false),
                idle_tx,
                paused: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                played: AtomicU64::new(0),
                skipped: AtomicU64::new(0),
            }),
        }
    }

    pub fn crossfade_duration(&self) -> Duration {
        Duration::from_millis(self.inner.crossfade_ms.load(Ordering::Acquire))
    }

    /// Set the crossfade length, clamped to `[0, 1000]` ms.
    pub fn set_crossfade_duration(&self, duration: Duration) {
        let ms = (duration.as_millis() as u64).min(MAX_CROSSFADE_MS);
        self.inner.crossfade_ms.store(ms, Ordering::Release);
    }

    pub fn is_crossfading(&self) -> bool {
        self.inner.crossfading.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::Acquire)
    }

    /// Incremented by every `stop()`; lets callers notice they were cut off.
    pub fn stop_epoch(&self) -> u64 {
        self.inner.stop_epoch.load(Ordering::Acquire)
    }

    pub fn pending(&self) -> usize {
        lock(&self.inner.queue).len()
    }

    pub fn stats(&self) -> PlaybackStats {
        PlaybackStats {
            played: self.inner.played.load(Ordering::Acquire),
            skipped: self.inner.skipped.load(Ordering::Acquire),
        }
    }

    fn stop_token(&self) -> CancellationToken {
        lock(&self.inner.stop_token).clone()
    }

    /// Preload `blob` and start it, crossfading from the current segment if one is playing.
    ///
    /// Preload failure or a timeout (default 5s) is returned to the caller.
    pub async fn play_segment(&self, blob: AudioBlob) -> LiveResult<SegmentHandle> {
        let token = self.stop_token();
        self.play_with(blob, &token).await
    }

    async fn play_with(&self, blob: AudioBlob, token: &CancellationToken) -> LiveResult<SegmentHandle> {
        let source = self.inner.factory.create(&blob)?;
        let segment = Arc::new(Segment {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            label: blob.label,
            source,
            released: AtomicBool::new(false),
        });

        if let Err(e) = self.preload(&segment, token).await {
            segment.release_once();
            return Err(e);
        }

        let _fade = self.inner.fade_lock.lock().await;
        if token.is_cancelled() {
            segment.release_once();
            return Err(LiveError::Cancelled(format!("segment {}", segment.id)));
        }

        let outgoing = {
            let mut current = lock(&self.inner.current);
            match current.take() {
                Some(prev) if !prev.is_finished() => Some(prev),
                Some(prev) => {
                    prev.release_once();
                    None
                }
                None => None,
            }
        };

        let Some(outgoing) = outgoing else {
            segment.source.set_volume(1.0);
            if let Err(e) = segment.source.play() {
                segment.release_once();
                return Err(e);
            }
            *lock(&self.inner.current) = Some(Arc::clone(&segment));
            debug!(id = segment.id, label = %segment.label, "Segment started at full volume");
            return Ok(SegmentHandle {
                id: segment.id,
                label: segment.label.clone(),
                crossfaded: false,
            });
        };

        self.crossfade(outgoing, Arc::clone(&segment), token).await?;
        Ok(SegmentHandle {
            id: segment.id,
            label: segment.label.clone(),
            crossfaded: true,
        })
    }

    async fn preload(&self, segment: &Segment, token: &CancellationToken) -> LiveResult<()> {
        let budget = self.inner.config.preload_timeout();
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(LiveError::Cancelled(format!("preload of segment {}", segment.id))),
            ready = tokio::time::timeout(budget, segment.source.ready()) => match ready {
                Ok(result) => result,
                Err(_) => Err(LiveError::Timeout {
                    what: format!("preload of segment {}", segment.id),
                    millis: budget.as_millis() as u64,
                }),
            },
        }
    }

    async fn crossfade(
        &self,
        outgoing: Arc<Segment>,
        incoming: Arc<Segment>,
        token: &CancellationToken,
    ) -> LiveResult<()> {
        let duration = self.crossfade_duration();
        let steps = self.inner.config.crossfade_steps.max(1);
        let step = duration / steps;

        incoming.source.set_volume(0.0);
        if let Err(e) = incoming.source.play() {
            // Keep the outgoing segment playing; only the new one is skipped.
            *lock(&self.inner.current) = Some(outgoing);
            incoming.release_once();
            return Err(e);
        }
        *lock(&self.inner.fading_out) = Some(Arc::clone(&outgoing));
        *lock(&self.inner.current) = Some(Arc::clone(&incoming));
        self.inner.crossfading.store(true, Ordering::Release);
        debug!(from = outgoing.id, to = incoming.id, duration_ms = duration.as_millis() as u64, "Crossfade started");

        if !duration.is_zero() {
            for i in 1..=steps {
                let t = i as f32 / steps as f32;
                outgoing.source.set_volume(1.0 - t);
                incoming.source.set_volume(t);
                if let Err(e) = sleep_or_cancel(step, token, "crossfade step").await {
                    // stop() already released both segments.
                    self.inner.crossfading.store(false, Ordering::Release);
                    return Err(e);
                }
            }
        }

        outgoing.source.set_volume(0.0);
        incoming.source.set_volume(1.0);
        outgoing.release_once();
        lock(&self.inner.fading_out).take();
        self.inner.crossfading.store(false, Ordering::Release);
        debug!(from = outgoing.id, to = incoming.id, "Crossfade complete");
        Ok(())
    }

    /// Halt and release the current segment, drop the pending queue and
    /// clear the crossfade flag. Safe to call at any time, repeatedly.
    pub fn stop(&self) {
        self.inner.stop_epoch.fetch_add(1, Ordering::AcqRel);
        let old = std::mem::replace(&mut *lock(&self.inner.stop_token), CancellationToken::new());
        old.cancel();

        let dropped = {
            let mut queue = lock(&self.inner.queue);
            let n = queue.len();
            queue.clear();
            self.inner.running.store(false, Ordering::Release);
            self.inner.idle_tx.send_replace(true);
            n
        };

        let mut released = 0;
        for slot in [&self.inner.current, &self.inner.fading_out] {
            if let Some(segment) = lock(slot).take() {
                if segment.release_once() {
                    released += 1;
                }
            }
        }
        self.inner.crossfading.store(false, Ordering::Release);
        self.inner.paused.store(false, Ordering::Release);
        if released > 0 || dropped > 0 {
            info!(released, dropped, "🔇 Playback stopped");
        }
    }

    pub fn pause(&self) {
        for slot in [&self.inner.current, &self.inner.fading_out] {
            if let Some(segment) = lock(slot).as_ref() {
                segment.source.pause();
            }
        }
        self.inner.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        if !self.inner.paused.swap(false, Ordering::AcqRel) {
            return;
        }
        for slot in [&self.inner.current, &self.inner.fading_out] {
            if let Some(segment) = lock(slot).as_ref() {
                segment.source.resume();
            }
        }
    }

    /// True while a segment is audible (or paused mid-playback).
    pub fn is_playing(&self) -> bool {
        lock(&self.inner.current)
            .as_ref()
            .is_some_and(|s| !s.is_finished())
    }

    /// Append to the playback queue; the runner plays segments in order.
    pub fn enqueue(&self, blob: AudioBlob) {
        {
            let mut queue = lock(&self.inner.queue);
            queue.push_back(blob);
            self.inner.idle_tx.send_replace(false);
        }
        self.spawn_runner();
    }

    /// Wait until the queue is drained and the last segment has finished (or `stop()` was called).
    pub async fn idle(&self) {
        let mut rx = self.inner.idle_tx.subscribe();
        let _ = rx.wait_for(|idle| *idle).await;
    }

    fn spawn_runner(&self) {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let epoch = self.stop_epoch();
        let token = self.stop_token();
        let manager = self.clone();
        tokio::spawn(async move {
            manager.run_queue(epoch, token).await;
        });
    }

    async fn run_queue(&self, epoch: u64, token: CancellationToken) {
        loop {
            if self.stop_epoch() != epoch {
                return;
            }
            let next = lock(&self.inner.queue).pop_front();
            match next {
                Some(blob) => {
                    if self.wait_for_tail(&token).await.is_err() {
                        return;
                    }
                    let label = blob.label.clone();
                    match self.play_with(blob, &token).await {
                        Ok(_) => {
                            self.inner.played.fetch_add(1, Ordering::AcqRel);
                        }
                        Err(e) if e.is_cancelled() => return,
                        Err(e) => {
                            self.inner.skipped.fetch_add(1, Ordering::AcqRel);
                            warn!(%label, error = %e, "Skipping segment");
                        }
                    }
                }
                None => {
                    if self.wait_until_finished(&token).await.is_err() {
                        return;
                    }
                    // Cleared under the queue lock so a concurrent enqueue either
                    // lands before this check or spawns a fresh runner.
                    let queue = lock(&self.inner.queue);
                    if !queue.is_empty() {
                        continue;
                    }
                    if self.stop_epoch() == epoch {
                        if let Some(last) = lock(&self.inner.current).take() {
                            last.release_once();
                        }
                        self.inner.running.store(false, Ordering::Release);
                        self.inner.idle_tx.send_replace(true);
                    }
                    return;
                }
            }
        }
    }

    /// Wait until the current segment has at most the crossfade length left.
    async fn wait_for_tail(&self, token: &CancellationToken) -> LiveResult<()> {
        let poll = Duration::from_millis(self.inner.config.poll_ms);
        loop {
            let ready = match lock(&self.inner.current).as_ref() {
                None => true,
                Some(s) if s.is_finished() => true,
                Some(s) => s
                    .source
                    .remaining()
                    .is_some_and(|left| left <= self.crossfade_duration()),
            };
            if ready {
                return Ok(());
            }
            sleep_or_cancel(poll, token, "playback tail").await?;
        }
    }

    async fn wait_until_finished(&self, token: &CancellationToken) -> LiveResult<()> {
        let poll = Duration::from_millis(self.inner.config.poll_ms);
        while self.is_playing() {
            sleep_or_cancel(poll, token, "playback end").await?;
        }
        Ok(())
    }
}

impl PlaybackControl for CrossfadeManager {
    fn stop(&self) {
        CrossfadeManager::stop(self);
    }

    fn pause(&self) {
        CrossfadeManager::pause(self);
    }

    fn resume(&self) {
        CrossfadeManager::resume(self);
    }

    fn is_playing(&self) -> bool {
        CrossfadeManager::is_playing(self)
    }
}
