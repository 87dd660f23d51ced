//! **Playback sources**: The seam between the crossfade manager and an audio backend.
//!
//! A [`SourceFactory`] turns a synthesized [`AudioBlob`] into a [`PlaybackSource`]
//! with its own volume. The crossfade manager owns each source for its whole
//! life and releases it exactly once.
//!
//! Backends:
//! - [`PlaceholderFactory`]: virtual playback timed from the payload size on the
//!   tokio clock. Used by tests and the demo.
//! - `RodioFactory` (feature `rodio`): one `rodio::Sink` per segment on the default device.

use crate::error::{LiveError, LiveResult};
use crate::sync::lock;
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Opaque synthesized audio (WAV/MP3/PCM bytes) plus the text it speaks.
#[derive(Clone)]
pub struct AudioBlob {
    pub data: Arc<[u8]>,
    /// Sentence the audio was synthesized from (for logs).
    pub label: String,
}

impl AudioBlob {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        let data: Vec<u8> = data.into();
        Self {
            data: Arc::from(data),
            label: String::new(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Debug for AudioBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioBlob")
            .field("bytes", &self.data.len())
            .field("label", &self.label)
            .finish()
    }
}

/// One playable segment with independent volume.
#[async_trait]
pub trait PlaybackSource: Send + Sync {
    /// Resolve once the source can start without stalling (decoded/buffered).
    async fn ready(&self) -> LiveResult<()>;

    fn play(&self) -> LiveResult<()>;

    /// Volume in `[0, 1]`.
    fn set_volume(&self, volume: f32);

    fn volume(&self) -> f32;

    fn pause(&self);

    fn resume(&self);

    /// Halt and rewind to the start.
    fn stop(&self);

    /// Free the backing resource. The manager calls this once per source.
    fn release(&self);

    fn is_finished(&self) -> bool;

    /// Time left until the end, when the backend knows it.
    fn remaining(&self) -> Option<Duration>;
}

/// Builds playback sources for synthesized audio.
pub trait SourceFactory: Send + Sync {
    fn create(&self, blob: &AudioBlob) -> LiveResult<Arc<dyn PlaybackSource>>;
}

/// Play-position tracker that survives pause/resume.
#[derive(Debug, Default)]
pub(crate) struct Clock {
    pub(crate) started_at: Option<Instant>,
    /// Time played before the last pause.
    pub(crate) banked: Duration,
    pub(crate) paused: bool,
}

impl Clock {
    pub(crate) fn start() -> Self {
        Self {
            started_at: Some(Instant::now()),
            ..Self::default()
        }
    }

    pub(crate) fn pause(&mut self) {
        if self.started_at.is_some() && !self.paused {
            self.banked = self.elapsed();
            self.paused = true;
        }
    }

    pub(crate) fn resume(&mut self) {
        if self.paused {
            self.paused = false;
            self.started_at = Some(Instant::now());
        }
    }

    pub(crate) fn elapsed(&self) -> Duration {
        match (self.started_at, self.paused) {
            (Some(at), false) => self.banked + at.elapsed(),
            _ => self.banked,
        }
    }
}

#[derive(Debug)]
struct PlaceholderState {
    volume: f32,
    volume_log: Vec<f32>,
    clock: Clock,
    stopped: bool,
    releases: u32,
}

/// Silent source that "plays" for a duration derived from its payload size.
#[derive(Debug)]
pub struct PlaceholderSource {
    id: u64,
    label: String,
    duration: Duration,
    ready_delay: Duration,
    state: Mutex<PlaceholderState>,
}

impl PlaceholderSource {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Every volume set on this source, in order.
    pub fn volume_log(&self) -> Vec<f32> {
        lock(&self.state).volume_log.clone()
    }

    pub fn release_count(&self) -> u32 {
        lock(&self.state).releases
    }

    pub fn was_started(&self) -> bool {
        lock(&self.state).clock.started_at.is_some()
    }

    pub fn is_paused(&self) -> bool {
        lock(&self.state).clock.paused
    }
}

#[async_trait]
impl PlaybackSource for PlaceholderSource {
    async fn ready(&self) -> LiveResult<()> {
        if !self.ready_delay.is_zero() {
            tokio::time::sleep(self.ready_delay).await;
        }
        if self.duration.is_zero() {
            return Err(LiveError::Playback(format!("segment {} has no audio", self.id)));
        }
        Ok(())
    }

    fn play(&self) -> LiveResult<()> {
        let mut state = lock(&self.state);
        if state.releases > 0 {
            return Err(LiveError::Playback(format!("segment {} already released", self.id)));
        }
        state.stopped = false;
        state.clock = Clock::start();
        trace!(id = self.id, label = %self.label, "placeholder playing");
        Ok(())
    }

    fn set_volume(&self, volume: f32) {
        let mut state = lock(&self.state);
        state.volume = volume.clamp(0.0, 1.0);
        let v = state.volume;
        state.volume_log.push(v);
    }

    fn volume(&self) -> f32 {
        lock(&self.state).volume
    }

    fn pause(&self) {
        lock(&self.state).clock.pause();
    }

    fn resume(&self) {
        lock(&self.state).clock.resume();
    }

    fn stop(&self) {
        let mut state = lock(&self.state);
        state.stopped = true;
        state.clock = Clock::default();
    }

    fn release(&self) {
        lock(&self.state).releases += 1;
    }

    fn is_finished(&self) -> bool {
        let state = lock(&self.state);
        state.stopped || (state.clock.started_at.is_some() && state.clock.elapsed() >= self.duration)
    }

    fn remaining(&self) -> Option<Duration> {
        let state = lock(&self.state);
        if state.stopped {
            return Some(Duration::ZERO);
        }
        Some(self.duration.saturating_sub(state.clock.elapsed()))
    }
}

/// Factory for [`PlaceholderSource`]s. Keeps every source it built so tests can inspect them.
#[derive(Debug, Clone)]
pub struct PlaceholderFactory {
    bytes_per_second: u64,
    ready_delay: Duration,
    next_id: Arc<AtomicU64>,
    created: Arc<Mutex<Vec<Arc<PlaceholderSource>>>>,
}

impl Default for PlaceholderFactory {
    fn default() -> Self {
        // 24 kHz mono 16-bit PCM.
        Self::new(48_000)
    }
}

impl PlaceholderFactory {
    pub fn new(bytes_per_second: u64) -> Self {
        Self {
            bytes_per_second: bytes_per_second.max(1),
            ready_delay: Duration::ZERO,
            next_id: Arc::new(AtomicU64::new(1)),
            created: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Delay every source's ready signal (simulates slow decoding).
    pub fn with_ready_delay(mut self, delay: Duration) -> Self {
        self.ready_delay = delay;
        self
    }

    /// Payload size that plays for `duration`.
    pub fn bytes_for(&self, duration: Duration) -> usize {
        (self.bytes_per_second as u128 * duration.as_millis() / 1000) as usize
    }

    pub fn created(&self) -> Vec<Arc<PlaceholderSource>> {
        lock(&self.created).clone()
    }
}

impl SourceFactory for PlaceholderFactory {
    fn create(&self, blob: &AudioBlob) -> LiveResult<Arc<dyn PlaybackSource>> {
        let millis = blob.len() as u64 * 1000 / self.bytes_per_second;
        let source = Arc::new(PlaceholderSource {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            label: blob.label.clone(),
            duration: Duration::from_millis(millis),
            ready_delay: self.ready_delay,
            state: Mutex::new(PlaceholderState {
                volume: 1.0,
                volume_log: Vec::new(),
                clock: Clock::default(),
                stopped: false,
                releases: 0,
            }),
        });
        lock(&self.created).push(Arc::clone(&source));
        Ok(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn placeholder_plays_for_payload_duration() {
        let factory = PlaceholderFactory::default();
        let blob = AudioBlob::new(vec![0u8; factory.bytes_for(Duration::from_millis(400))]);
        let source = factory.create(&blob).unwrap();
        source.ready().await.unwrap();
        source.play().unwrap();
        assert!(!source.is_finished());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(source.remaining(), Some(Duration::from_millis(300)));

        source.pause();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!source.is_finished());
        source.resume();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(source.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_payload_is_not_ready() {
        let factory = PlaceholderFactory::default();
        let source = factory.create(&AudioBlob::new(Vec::new())).unwrap();
        assert!(matches!(source.ready().await, Err(LiveError::Playback(_))));
    }

    #[test]
    fn volume_is_clamped_and_logged() {
        let factory = PlaceholderFactory::default();
        let source = factory.create(&AudioBlob::new(vec![0u8; 480])).unwrap();
        source.set_volume(1.5);
        source.set_volume(-0.2);
        assert_eq!(factory.created()[0].volume_log(), vec![1.0, 0.0]);
    }
}
