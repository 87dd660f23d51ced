//! **Interruption Event Pipeline**: Decides whether user speech during playback
//! is a real interruption and drives the avatar and playback in response.
//!
//! ```text
//!  VAD sample ─→ validate ─→ admit ─→ bounded FIFO ─→ drain (one at a time)
//!               (finite,     (cooldown,   (drop oldest      │
//!                min conf,    assistant    when full)       ├─ classify
//!                voice mode)  speaking)                     ├─ build response
//!                                                           ├─ run actions in order
//!                                                           ├─ notify handlers
//!                                                           └─ record history
//! ```

use crate::avatar::{AvatarMode, Priority, StateUpdate};
use crate::clock::sleep_or_cancel;
use crate::config::{InterruptionConfig, InterruptionConfigUpdate};
use crate::conversation::{ConversationSnapshot, ConversationState};
use crate::crossfade::PlaybackControl;
use crate::error::{guard_callback, LiveError, LiveResult};
use crate::interrupt::{
    build_response, classify, Action, ActionOutcome, InterruptionContext, InterruptionEvent,
    InterruptionRecord, InterruptionResponse, RawInterruptionEvent,
};
use crate::sync::lock;
use crate::transition::{AvatarEngine, TransitionOptions, TransitionOutcome};
use chrono::Utc;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Observer notified after every processed interruption.
pub type InterruptionHandler =
    Arc<dyn Fn(&InterruptionResponse, &InterruptionContext) -> anyhow::Result<()> + Send + Sync>;

/// Token returned by [`InterruptionPipeline::register_handler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Why an event did not enter the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    Invalid(String),
    LowConfidence,
    VoiceModeInactive,
    CoolingDown,
    NotSpeaking,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid(reason) => write!(f, "invalid: {}", reason),
            Self::LowConfidence => write!(f, "confidence below threshold"),
            Self::VoiceModeInactive => write!(f, "voice mode inactive"),
            Self::CoolingDown => write!(f, "within cooldown"),
            Self::NotSpeaking => write!(f, "assistant not speaking"),
        }
    }
}

/// Result of [`InterruptionPipeline::handle`].
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Queued,
    Rejected(RejectReason),
}

impl Admission {
    pub fn is_queued(&self) -> bool {
        matches!(self, Admission::Queued)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub received: u64,
    pub rejected: u64,
    /// Queued events evicted by a full queue.
    pub overflowed: u64,
    pub processed: u64,
}

struct PipelineInner {
    config: Mutex<InterruptionConfig>,
    avatar: AvatarEngine,
    playback: Arc<dyn PlaybackControl>,
    conversation: Arc<dyn ConversationState>,
    queue: Mutex<VecDeque<InterruptionEvent>>,
    draining: AtomicBool,
    idle_tx: watch::Sender<bool>,
    last_accepted: Mutex<Option<Instant>>,
    handlers: Mutex<Vec<(HandlerId, InterruptionHandler)>>,
    next_handler: AtomicU64,
    history: Mutex<VecDeque<InterruptionRecord>>,
    token: Mutex<CancellationToken>,
    generation: AtomicU64,
    received: AtomicU64,
    rejected: AtomicU64,
    overflowed: AtomicU64,
    processed: AtomicU64,
}

#[derive(Clone)]
pub struct InterruptionPipeline {
    inner: Arc<PipelineInner>,
}

impl InterruptionPipeline {
    pub fn new(
        config: InterruptionConfig,
        avatar: AvatarEngine,
        playback: Arc<dyn PlaybackControl>,
        conversation: Arc<dyn ConversationState>,
    ) -> Self {
        let (idle_tx, _) = watch::channel(true);
        info!(
            min_confidence = config.min_confidence,
            cooldown_ms = config.cooldown_ms,
            max_queue_size = config.max_queue_size,
            "⚡ Interruption pipeline ready"
        );
        Self {
            inner: Arc::new(PipelineInner {
                config: Mutex::new(config),
                avatar,
                playback,
                conversation,
                queue: Mutex::new(VecDeque::new()),
                draining: AtomicBool::new(false),
                idle_tx,
                last_accepted: Mutex::new(None),
                handlers: Mutex::new(Vec::new()),
                next_handler: AtomicU64::new(1),
                history: Mutex::new(VecDeque::new()),
                token: Mutex::new(CancellationToken::new()),
                generation: AtomicU64::new(0),
                received: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
                overflowed: AtomicU64::new(0),
                processed: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> InterruptionConfig {
        lock(&self.inner.config).clone()
    }

    /// Merge `update` into the live configuration. A smaller queue cap trims the oldest events.
    pub fn update_config(&self, update: &InterruptionConfigUpdate) {
        let cap = {
            let mut config = lock(&self.inner.config);
            config.merge(update);
            config.max_queue_size
        };
        let trimmed = {
            let mut queue = lock(&self.inner.queue);
            let mut n = 0;
            while queue.len() > cap {
                queue.pop_front();
                n += 1;
            }
            n
        };
        self.inner.overflowed.fetch_add(trimmed, Ordering::AcqRel);
        debug!(?update, trimmed, "Interruption config updated");
    }

    /// Validate, admit and queue an event. Processing happens on a background drain.
    pub fn handle(&self, event: InterruptionEvent) -> Admission {
        self.inner.received.fetch_add(1, Ordering::AcqRel);
        match self.admit(&event) {
            Ok(()) => {
                self.push(event);
                self.spawn_drain();
                Admission::Queued
            }
            Err(reason) => {
                self.inner.rejected.fetch_add(1, Ordering::AcqRel);
                debug!(%reason, confidence = event.confidence, energy = event.energy, "Interruption rejected");
                Admission::Rejected(reason)
            }
        }
    }

    /// Like [`handle`](Self::handle) for untyped input; missing fields are a rejection.
    pub fn handle_raw(&self, raw: RawInterruptionEvent) -> Admission {
        match InterruptionEvent::try_from(raw) {
            Ok(event) => self.handle(event),
            Err(e) => {
                self.inner.received.fetch_add(1, Ordering::AcqRel);
                self.inner.rejected.fetch_add(1, Ordering::AcqRel);
                warn!(error = %e, "Dropping malformed interruption event");
                Admission::Rejected(RejectReason::Invalid(e.to_string()))
            }
        }
    }

    fn admit(&self, event: &InterruptionEvent) -> Result<(), RejectReason> {
        event
            .validate()
            .map_err(|e| RejectReason::Invalid(e.to_string()))?;
        let config = self.config();
        if event.confidence < config.min_confidence {
            return Err(RejectReason::LowConfidence);
        }
        if !self.inner.conversation.voice_mode_active() {
            return Err(RejectReason::VoiceModeInactive);
        }

        let mut last = lock(&self.inner.last_accepted);
        let now = Instant::now();
        if last.is_some_and(|at| now.duration_since(at) < config.cooldown()) {
            return Err(RejectReason::CoolingDown);
        }
        if !self.inner.conversation.assistant_speaking() {
            return Err(RejectReason::NotSpeaking);
        }
        *last = Some(now);
        Ok(())
    }

    fn push(&self, event: InterruptionEvent) {
        let cap = lock(&self.inner.config).max_queue_size;
        let mut queue = lock(&self.inner.queue);
        while queue.len() >= cap {
            if let Some(dropped) = queue.pop_front() {
                self.inner.overflowed.fetch_add(1, Ordering::AcqRel);
                debug!(timestamp = %dropped.timestamp, "Interruption queue full, dropped oldest");
            }
        }
        queue.push_back(event);
        self.inner.idle_tx.send_replace(false);
    }

    pub fn queued(&self) -> usize {
        lock(&self.inner.queue).len()
    }

    pub fn is_processing(&self) -> bool {
        self.inner.draining.load(Ordering::Acquire)
    }

    /// Wait until every queued event has been processed.
    pub async fn idle(&self) {
        let mut rx = self.inner.idle_tx.subscribe();
        let _ = rx.wait_for(|idle| *idle).await;
    }

    /// Processed events, oldest first.
    pub fn history(&self) -> Vec<InterruptionRecord> {
        lock(&self.inner.history).iter().cloned().collect()
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            received: self.inner.received.load(Ordering::Acquire),
            rejected: self.inner.rejected.load(Ordering::Acquire),
            overflowed: self.inner.overflowed.load(Ordering::Acquire),
            processed: self.inner.processed.load(Ordering::Acquire),
        }
    }

    /// Add an observer. Handlers run in registration order.
    pub fn register_handler<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&InterruptionResponse, &InterruptionContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = HandlerId(self.inner.next_handler.fetch_add(1, Ordering::Relaxed));
        lock(&self.inner.handlers).push((id, Arc::new(handler)));
        id
    }

    /// Remove an observer. Returns false if it was not registered.
    pub fn unregister_handler(&self, id: HandlerId) -> bool {
        let mut handlers = lock(&self.inner.handlers);
        let before = handlers.len();
        handlers.retain(|(h, _)| *h != id);
        handlers.len() != before
    }

    pub fn handler_count(&self) -> usize {
        lock(&self.inner.handlers).len()
    }

    /// Cancel pending timers, drop queued events and forget history and cooldown.
    /// Registered handlers stay registered.
    pub fn reset(&self) {
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
        let old = std::mem::replace(&mut *lock(&self.inner.token), CancellationToken::new());
        old.cancel();
        let dropped = {
            let mut queue = lock(&self.inner.queue);
            let n = queue.len();
            queue.clear();
            n
        };
        lock(&self.inner.history).clear();
        *lock(&self.inner.last_accepted) = None;
        self.inner.draining.store(false, Ordering::Release);
        self.inner.idle_tx.send_replace(true);
        info!(dropped, "Interruption pipeline reset");
    }

    fn spawn_drain(&self) {
        if self.inner.draining.swap(true, Ordering::AcqRel) {
            return;
        }
        let generation = self.inner.generation.load(Ordering::Acquire);
        let token = lock(&self.inner.token).clone();
        let pipeline = self.clone();
        tokio::spawn(async move {
            pipeline.drain(generation, token).await;
        });
    }

    async fn drain(&self, generation: u64, token: CancellationToken) {
        loop {
            if self.inner.generation.load(Ordering::Acquire) != generation {
                return;
            }
            let event = {
                let mut queue = lock(&self.inner.queue);
                match queue.pop_front() {
                    Some(event) => event,
                    None => {
                        // Cleared under the queue lock so a concurrent push either
                        // lands before this check or spawns a fresh drain.
                        if self.inner.generation.load(Ordering::Acquire) == generation {
                            self.inner.draining.store(false, Ordering::Release);
                            self.inner.idle_tx.send_replace(true);
                        }
                        return;
                    }
                }
            };

            match self.process(event, &token).await {
                Ok(record) => {
                    self.inner.processed.fetch_add(1, Ordering::AcqRel);
                    self.push_history(record);
                }
                Err(e) if e.is_cancelled() => return,
                Err(e) => error!(error = %e, "Interruption processing failed, continuing"),
            }
        }
    }

    async fn process(&self, event: InterruptionEvent, token: &CancellationToken) -> LiveResult<InterruptionRecord> {
        let ctx = InterruptionContext {
            kind: classify(event.confidence, event.energy),
            playback_active: self.inner.playback.is_playing(),
            avatar: self.inner.avatar.current_state(),
            conversation: ConversationSnapshot::capture(self.inner.conversation.as_ref()),
            event,
        };
        let response = build_response(ctx.kind, ctx.language(), ctx.event.confidence);
        info!(
            kind = %response.kind,
            confidence = ctx.event.confidence,
            energy = ctx.event.energy,
            language = %response.language,
            "⚡ Interruption detected"
        );

        let mut outcomes = Vec::with_capacity(response.actions.len());
        for action in &response.actions {
            let outcome = match self.execute(action, token).await {
                Ok(outcome) => outcome,
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(action = action.name(), error = %e, "Interruption action failed");
                    ActionOutcome::Failed(e.to_string())
                }
            };
            debug!(action = action.name(), ?outcome, "Action finished");
            outcomes.push((action.clone(), outcome));
        }

        self.notify(&response, &ctx);
        Ok(InterruptionRecord {
            event: ctx.event,
            response,
            outcomes,
            processed_at: Utc::now(),
        })
    }

    fn notify(&self, response: &InterruptionResponse, ctx: &InterruptionContext) {
        // Snapshot so handlers may (un)register without deadlocking.
        let handlers: Vec<(HandlerId, InterruptionHandler)> = lock(&self.inner.handlers).clone();
        for (id, handler) in handlers {
            if let Err(e) = guard_callback("interruption handler", || handler(response, ctx)) {
                error!(handler = id.0, error = %e, "Interruption handler failed");
            }
        }
    }

    fn push_history(&self, record: InterruptionRecord) {
        let limit = lock(&self.inner.config).history_limit;
        let mut history = lock(&self.inner.history);
        history.push_back(record);
        while history.len() > limit {
            history.pop_front();
        }
    }

    fn has_newer_events(&self) -> bool {
        !lock(&self.inner.queue).is_empty()
    }

    async fn execute(&self, action: &Action, token: &CancellationToken) -> LiveResult<ActionOutcome> {
        let listening = || StateUpdate::new().mode(AvatarMode::Listening).speaking(false);
        let speaking = || StateUpdate::new().mode(AvatarMode::Speaking).speaking(true);
        match action {
            Action::StopSpeech { immediate } => {
                self.inner.playback.stop();
                let priority = if *immediate { Priority::Immediate } else { Priority::High };
                self.transition(listening(), priority, token).await
            }
            Action::PauseSpeech { duration } => {
                self.inner.playback.pause();
                let outcome = self.transition(listening(), Priority::High, token).await?;
                sleep_or_cancel(*duration, token, "pause_speech").await?;
                self.inner.playback.resume();
                if outcome != ActionOutcome::Completed {
                    return Ok(outcome);
                }
                self.transition(speaking(), Priority::High, token).await
            }
            Action::Acknowledge { priority } => {
                self.transition(StateUpdate::new().mode(AvatarMode::Thinking), *priority, token)
                    .await
            }
            Action::OfferContinuation { priority } => self.transition(listening(), *priority, token).await,
            Action::BriefPause { duration } => {
                self.inner.playback.pause();
                sleep_or_cancel(*duration, token, "brief_pause").await?;
                Ok(ActionOutcome::Completed)
            }
            Action::ContinueIfQuiet { timeout } => {
                sleep_or_cancel(*timeout, token, "continue_if_quiet").await?;
                if self.has_newer_events() {
                    return Ok(ActionOutcome::Abandoned);
                }
                self.inner.playback.resume();
                if self.inner.conversation.assistant_speaking() {
                    return self.transition(speaking(), Priority::Normal, token).await;
                }
                Ok(ActionOutcome::Completed)
            }
            Action::Monitor { timeout } => {
                sleep_or_cancel(*timeout, token, "monitor").await?;
                if self.has_newer_events() {
                    return Ok(ActionOutcome::Abandoned);
                }
                self.inner.playback.resume();
                Ok(ActionOutcome::Completed)
            }
        }
    }

    /// Request an avatar transition tied to `token`: if the pipeline is reset
    /// mid-wait, the request is withdrawn from the engine too.
    async fn transition(
        &self,
        update: StateUpdate,
        priority: Priority,
        token: &CancellationToken,
    ) -> LiveResult<ActionOutcome> {
        let ticket = self
            .inner
            .avatar
            .submit(update, TransitionOptions::default().with_priority(priority));
        let id = ticket.id();
        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => {
                self.inner.avatar.cancel(id);
                return Err(LiveError::Cancelled("interruption transition".to_string()));
            }
            outcome = ticket => outcome,
        };
        Ok(match outcome {
            TransitionOutcome::Completed => ActionOutcome::Completed,
            TransitionOutcome::Dropped => ActionOutcome::Superseded,
        })
    }
}
