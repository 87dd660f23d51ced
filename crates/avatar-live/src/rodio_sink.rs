//! rodio output backend: one paused `Sink` per segment, all mixed on the default device.

use crate::error::{LiveError, LiveResult};
use crate::playback::{AudioBlob, Clock, PlaybackSource, SourceFactory};
use crate::sync::lock;
use async_trait::async_trait;
use rodio::{Decoder, OutputStream, OutputStreamHandle, Sink, Source};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

/// Opens the default output device. `OutputStream` is not `Send`, so it lives
/// on a dedicated thread until the factory is dropped.
pub struct RodioFactory {
    handle: OutputStreamHandle,
    next_id: AtomicU64,
    _keepalive: mpsc::Sender<()>,
}

impl RodioFactory {
    pub fn new() -> LiveResult<Self> {
        let (handle_tx, handle_rx) = mpsc::channel();
        let (keepalive, shutdown) = mpsc::channel::<()>();
        std::thread::Builder::new()
            .name("avatar-live-audio".to_string())
            .spawn(move || match OutputStream::try_default() {
                Ok((stream, handle)) => {
                    let _ = handle_tx.send(Ok(handle));
                    // Returns once the factory (and its sender) is dropped.
                    let _ = shutdown.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = handle_tx.send(Err(e.to_string()));
                }
            })?;

        let handle = handle_rx
            .recv()
            .map_err(|_| LiveError::Playback("audio thread exited before opening a stream".to_string()))?
            .map_err(|e| LiveError::Playback(format!("No audio output device available: {}", e)))?;
        info!("🔊 rodio output stream ready");
        Ok(Self {
            handle,
            next_id: AtomicU64::new(1),
            _keepalive: keepalive,
        })
    }
}

impl SourceFactory for RodioFactory {
    fn create(&self, blob: &AudioBlob) -> LiveResult<Arc<dyn PlaybackSource>> {
        let sink = Sink::try_new(&self.handle).map_err(|e| LiveError::Playback(e.to_string()))?;
        sink.pause();
        Ok(Arc::new(RodioSource {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            data: Arc::clone(&blob.data),
            sink: Mutex::new(Some(sink)),
            duration: Mutex::new(None),
            clock: Mutex::new(Clock::default()),
            loaded: AtomicBool::new(false),
        }))
    }
}

pub struct RodioSource {
    id: u64,
    data: Arc<[u8]>,
    sink: Mutex<Option<Sink>>,
    duration: Mutex<Option<Duration>>,
    clock: Mutex<Clock>,
    loaded: AtomicBool,
}

impl RodioSource {
    fn with_sink(&self, f: impl FnOnce(&Sink)) {
        if let Some(sink) = lock(&self.sink).as_ref() {
            f(sink);
        }
    }
}

#[async_trait]
impl PlaybackSource for RodioSource {
    async fn ready(&self) -> LiveResult<()> {
        if self.loaded.load(Ordering::Acquire) {
            return Ok(());
        }
        let bytes = self.data.to_vec();
        let decoder = tokio::task::spawn_blocking(move || Decoder::new(Cursor::new(bytes)))
            .await
            .map_err(|e| LiveError::Playback(format!("decode task failed: {}", e)))?
            .map_err(|e| LiveError::Playback(format!("Decode failed: {}", e)))?;

        *lock(&self.duration) = decoder.total_duration();
        let guard = lock(&self.sink);
        let sink = guard
            .as_ref()
            .ok_or_else(|| LiveError::Playback(format!("segment {} already released", self.id)))?;
        sink.append(decoder.convert_samples::<f32>());
        self.loaded.store(true, Ordering::Release);
        Ok(())
    }

    fn play(&self) -> LiveResult<()> {
        let guard = lock(&self.sink);
        let sink = guard
            .as_ref()
            .ok_or_else(|| LiveError::Playback(format!("segment {} already released", self.id)))?;
        sink.play();
        *lock(&self.clock) = Clock::start();
        Ok(())
    }

    fn set_volume(&self, volume: f32) {
        self.with_sink(|s| s.set_volume(volume.clamp(0.0, 1.0)));
    }

    fn volume(&self) -> f32 {
        lock(&self.sink).as_ref().map(|s| s.volume()).unwrap_or(0.0)
    }

    fn pause(&self) {
        self.with_sink(|s| s.pause());
        lock(&self.clock).pause();
    }

    fn resume(&self) {
        self.with_sink(|s| s.play());
        lock(&self.clock).resume();
    }

    /// rodio drops the queued source on stop; a stopped segment cannot restart.
    fn stop(&self) {
        self.with_sink(|s| s.stop());
        *lock(&self.clock) = Clock::default();
    }

    fn release(&self) {
        if lock(&self.sink).take().is_none() {
            warn!(id = self.id, "rodio segment released twice");
        }
    }

    fn is_finished(&self) -> bool {
        match lock(&self.sink).as_ref() {
            Some(sink) => self.loaded.load(Ordering::Acquire) && sink.empty(),
            None => true,
        }
    }

    fn remaining(&self) -> Option<Duration> {
        let total = (*lock(&self.duration))?;
        Some(total.saturating_sub(lock(&self.clock).elapsed()))
    }
}
