//! **Avatar State Transition Engine**: Owns the live [`AvatarState`] and animates
//! transitions between states.
//!
//! Requests are either executed directly (`Priority::Immediate` or `force`) or
//! queued and drained one at a time, ordered by `(priority rank, enqueue time)`.
//! A `High` request evicts every queued request that is not itself `High`.
//! Each transition is split into ~50ms steps; categorical fields snap to the
//! target once eased progress crosses 0.5. Readers observe the state through a
//! `watch` channel and never mutate it.

use crate::avatar::{plan_steps, AvatarState, Easing, Priority, RawStateUpdate, StateUpdate};
use crate::clock::sleep_or_cancel;
use crate::config::AvatarConfig;
use crate::error::{guard_callback, LiveError, LiveResult};
use crate::sync::lock;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Invoked with the final state once a transition completes.
pub type CompletionCallback = Box<dyn FnOnce(&AvatarState) -> anyhow::Result<()> + Send + 'static>;

/// Options for [`AvatarEngine::request_transition`].
#[derive(Default)]
pub struct TransitionOptions {
    /// Explicit duration; derived from the changed fields when `None`.
    pub duration: Option<Duration>,
    pub easing: Easing,
    pub priority: Priority,
    /// Clear the queue and execute directly.
    pub force: bool,
    pub on_complete: Option<CompletionCallback>,
}

impl TransitionOptions {
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_easing(mut self, easing: Easing) -> Self {
        self.easing = easing;
        self
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&AvatarState) -> anyhow::Result<()> + Send + 'static,
    {
        self.on_complete = Some(Box::new(callback));
        self
    }
}

impl fmt::Debug for TransitionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransitionOptions")
            .field("duration", &self.duration)
            .field("easing", &self.easing)
            .field("priority", &self.priority)
            .field("force", &self.force)
            .field("on_complete", &self.on_complete.is_some())
            .finish()
    }
}

/// A transition waiting for, or undergoing, execution.
pub struct TransitionRequest {
    pub id: Uuid,
    pub update: StateUpdate,
    pub duration: Option<Duration>,
    pub easing: Easing,
    pub priority: Priority,
    pub force: bool,
    pub enqueued_at: Instant,
    seq: u64,
    on_complete: Option<CompletionCallback>,
}

impl TransitionRequest {
    fn order_key(&self) -> (u8, Instant, u64) {
        (self.priority.rank(), self.enqueued_at, self.seq)
    }
}

/// How a transition request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// Animated to its target state.
    Completed,
    /// Evicted, cleared by `force`/`reset`, or failed inside the queue drain.
    Dropped,
}

/// Read-only view of a queued request.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedTransition {
    pub id: Uuid,
    pub priority: Priority,
    pub update: StateUpdate,
}

/// Snapshot of a state that was replaced by a transition.
#[derive(Debug, Clone, PartialEq)]
pub struct StateHistoryEntry {
    pub state: AvatarState,
    pub recorded_at: DateTime<Utc>,
}

/// Resolves when a submitted transition finishes or is dropped.
pub struct TransitionTicket {
    id: Uuid,
    rx: oneshot::Receiver<TransitionOutcome>,
}

impl TransitionTicket {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Future for TransitionTicket {
    type Output = TransitionOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(TransitionOutcome::Dropped))
    }
}

struct Queued {
    request: TransitionRequest,
    done: oneshot::Sender<TransitionOutcome>,
}

struct EngineInner {
    config: AvatarConfig,
    state_tx: watch::Sender<AvatarState>,
    queue: Mutex<Vec<Queued>>,
    history: Mutex<VecDeque<StateHistoryEntry>>,
    /// Busy flag for the queue drain.
    draining: AtomicBool,
    /// Serializes execution: at most one transition animates at a time.
    exec_lock: tokio::sync::Mutex<()>,
    /// Id and token of the transition currently animating.
    in_flight: Mutex<Option<(Uuid, CancellationToken)>>,
    /// Tokens of requests that left the queue (or never entered it) and have not finished.
    active: Mutex<HashMap<Uuid, CancellationToken>>,
    /// Parent of every execution token; replaced on reset.
    root: Mutex<CancellationToken>,
    seq: AtomicU64,
    /// Bumped by reset so stale drains exit.
    generation: AtomicU64,
}

/// Handle to the transition engine. Cheap to clone; all clones share one state.
#[derive(Clone)]
pub struct AvatarEngine {
    inner: Arc<EngineInner>,
}

impl AvatarEngine {
    pub fn new(config: AvatarConfig) -> Self {
        let (state_tx, _) = watch::channel(AvatarState::default());
        info!(
            step_ms = config.step_ms,
            history_limit = config.history_limit,
            "🎭 Avatar transition engine ready"
        );
        Self {
            inner: Arc::new(EngineInner {
                config,
                state_tx,
                queue: Mutex::new(Vec::new()),
                history: Mutex::new(VecDeque::new()),
                draining: AtomicBool::new(false),
                exec_lock: tokio::sync::Mutex::new(()),
                in_flight: Mutex::new(None),
                active: Mutex::new(HashMap::new()),
                root: Mutex::new(CancellationToken::new()),
                seq: AtomicU64::new(0),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Snapshot of the live state.
    pub fn current_state(&self) -> AvatarState {
        self.inner.state_tx.borrow().clone()
    }

    /// Subscribe to every published state (intermediate steps included).
    pub fn subscribe(&self) -> watch::Receiver<AvatarState> {
        self.inner.state_tx.subscribe()
    }

    /// Replaced states, oldest first.
    pub fn state_history(&self) -> Vec<StateHistoryEntry> {
        lock(&self.inner.history).iter().cloned().collect()
    }

    /// Queued requests in execution order.
    pub fn queued(&self) -> Vec<QueuedTransition> {
        lock(&self.inner.queue)
            .iter()
            .map(|q| QueuedTransition {
                id: q.request.id,
                priority: q.request.priority,
                update: q.request.update.clone(),
            })
            .collect()
    }

    pub fn is_transitioning(&self) -> bool {
        self.inner.state_tx.borrow().transitioning
    }

    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::Acquire)
    }

    /// Request a transition and wait for it.
    ///
    /// Immediate and forced requests run directly and return their failure;
    /// queued requests resolve with the outcome reported by the drain loop.
    pub async fn request_transition(
        &self,
        update: StateUpdate,
        options: TransitionOptions,
    ) -> LiveResult<TransitionOutcome> {
        let request = self.build_request(update, options);
        if request.priority == Priority::Immediate || request.force {
            // Runs on its own task, so dropping this future never strands the animation.
            let id = request.id;
            match self.spawn_direct(request).await {
                Ok(result) => result.map(|()| TransitionOutcome::Completed),
                Err(_) => Err(LiveError::Execution(format!("transition {} ended without a result", id))),
            }
        } else {
            Ok(self.enqueue(request).await)
        }
    }

    /// Validate an untyped update, then request it. Unknown values are
    /// dropped with a warning and reported as `LiveError::Validation`.
    pub async fn request_raw_transition(
        &self,
        raw: RawStateUpdate,
        options: TransitionOptions,
    ) -> LiveResult<TransitionOutcome> {
        let update = match StateUpdate::try_from(raw) {
            Ok(u) => u,
            Err(e) => {
                warn!(error = %e, "Dropping invalid avatar transition request");
                return Err(e);
            }
        };
        self.request_transition(update, options).await
    }

    /// Submit without waiting. The returned ticket resolves with the outcome;
    /// failures of direct requests are logged and reported as `Dropped`.
    pub fn submit(&self, update: StateUpdate, options: TransitionOptions) -> TransitionTicket {
        let request = self.build_request(update, options);
        if request.priority == Priority::Immediate || request.force {
            let (tx, rx) = oneshot::channel();
            let id = request.id;
            let result = self.spawn_direct(request);
            tokio::spawn(async move {
                let outcome = match result.await {
                    Ok(Ok(())) => TransitionOutcome::Completed,
                    Ok(Err(e)) => {
                        warn!(%id, error = %e, "Direct transition failed");
                        TransitionOutcome::Dropped
                    }
                    Err(_) => TransitionOutcome::Dropped,
                };
                let _ = tx.send(outcome);
            });
            TransitionTicket { id, rx }
        } else {
            self.enqueue(request)
        }
    }

    /// Withdraw a request: queued ones are removed (their ticket resolves
    /// `Dropped`), running or waiting ones are cancelled. Returns false if the
    /// request already finished.
    pub fn cancel(&self, id: Uuid) -> bool {
        let queued = {
            let mut queue = lock(&self.inner.queue);
            queue
                .iter()
                .position(|q| q.request.id == id)
                .map(|i| queue.remove(i))
        };
        if let Some(q) = queued {
            debug!(%id, "Queued transition withdrawn");
            let _ = q.done.send(TransitionOutcome::Dropped);
            return true;
        }
        match lock(&self.inner.active).get(&id) {
            Some(token) => {
                debug!(%id, "Running transition cancelled");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel all queued and in-flight work and return to the idle/neutral default.
    pub fn reset(&self) {
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
        let old_root = std::mem::replace(&mut *lock(&self.inner.root), CancellationToken::new());
        old_root.cancel();
        if let Some((_, token)) = lock(&self.inner.in_flight).take() {
            token.cancel();
        }
        let dropped = self.clear_queue();
        lock(&self.inner.history).clear();
        self.inner.draining.store(false, Ordering::Release);
        self.inner.state_tx.send_replace(AvatarState::default());
        info!(dropped, "Avatar engine reset");
    }

    fn build_request(&self, update: StateUpdate, options: TransitionOptions) -> TransitionRequest {
        TransitionRequest {
            id: Uuid::new_v4(),
            update,
            duration: options.duration,
            easing: options.easing,
            priority: options.priority,
            force: options.force,
            enqueued_at: Instant::now(),
            seq: self.inner.seq.fetch_add(1, Ordering::Relaxed),
            on_complete: options.on_complete,
        }
    }

    fn enqueue(&self, request: TransitionRequest) -> TransitionTicket {
        let (done, rx) = oneshot::channel();
        let id = request.id;
        {
            let mut queue = lock(&self.inner.queue);
            if request.priority == Priority::High {
                let (keep, evicted): (Vec<_>, Vec<_>) = queue
                    .drain(..)
                    .partition(|q| q.request.priority == Priority::High);
                *queue = keep;
                for q in evicted {
                    debug!(id = %q.request.id, priority = %q.request.priority, "Evicted by high-priority transition");
                    let _ = q.done.send(TransitionOutcome::Dropped);
                }
            }
            debug!(%id, priority = %request.priority, queued = queue.len() + 1, "Transition queued");
            queue.push(Queued { request, done });
            queue.sort_by_key(|q| q.request.order_key());
        }
        self.spawn_drain();
        TransitionTicket { id, rx }
    }

    fn clear_queue(&self) -> usize {
        let drained: Vec<Queued> = lock(&self.inner.queue).drain(..).collect();
        let count = drained.len();
        for q in drained {
            let _ = q.done.send(TransitionOutcome::Dropped);
        }
        count
    }

    fn root_token(&self) -> CancellationToken {
        lock(&self.inner.root).clone()
    }

    fn spawn_drain(&self) {
        if self.inner.draining.swap(true, Ordering::AcqRel) {
            return;
        }
        let generation = self.inner.generation.load(Ordering::Acquire);
        let engine = self.clone();
        tokio::spawn(async move {
            engine.drain(generation).await;
        });
    }

    async fn drain(&self, generation: u64) {
        loop {
            if self.inner.generation.load(Ordering::Acquire) != generation {
                return;
            }
            let token = self.root_token().child_token();
            let next = {
                let mut queue = lock(&self.inner.queue);
                if queue.is_empty() {
                    None
                } else {
                    let next = queue.remove(0);
                    // Registered before the queue lock is released so `cancel` always finds it.
                    lock(&self.inner.active).insert(next.request.id, token.clone());
                    Some(next)
                }
            };
            let Some(Queued { request, done }) = next else {
                break;
            };

            let id = request.id;
            let outcome = {
                let _exec = self.inner.exec_lock.lock().await;
                match self.execute(request, token).await {
                    Ok(()) => TransitionOutcome::Completed,
                    Err(e) => {
                        warn!(%id, error = %e, "Queued transition failed, continuing with next");
                        TransitionOutcome::Dropped
                    }
                }
            };
            lock(&self.inner.active).remove(&id);
            let _ = done.send(outcome);
        }

        if self.inner.generation.load(Ordering::Acquire) == generation {
            self.inner.draining.store(false, Ordering::Release);
            // A request may have landed between the empty check and clearing the flag.
            if !lock(&self.inner.queue).is_empty() {
                self.spawn_drain();
            }
        }
    }

    /// Run `request` on its own task, preempting whatever is animating.
    fn spawn_direct(&self, request: TransitionRequest) -> oneshot::Receiver<LiveResult<()>> {
        let (tx, rx) = oneshot::channel();
        let id = request.id;
        let token = self.root_token().child_token();
        lock(&self.inner.active).insert(id, token.clone());
        let engine = self.clone();
        tokio::spawn(async move {
            let result = engine.execute_direct(request, token).await;
            lock(&engine.inner.active).remove(&id);
            let _ = tx.send(result);
        });
        rx
    }

    async fn execute_direct(&self, request: TransitionRequest, token: CancellationToken) -> LiveResult<()> {
        if request.force {
            let dropped = self.clear_queue();
            if dropped > 0 {
                debug!(dropped, "Forced transition cleared the queue");
            }
        }
        if let Some((_, running)) = lock(&self.inner.in_flight).take() {
            running.cancel();
        }
        let _exec = self.inner.exec_lock.lock().await;
        self.execute(request, token).await
    }

    async fn execute(&self, request: TransitionRequest, token: CancellationToken) -> LiveResult<()> {
        if token.is_cancelled() {
            return Err(LiveError::Cancelled(format!("transition {}", request.id)));
        }
        let from = self.current_state();
        let target = from.apply(&request.update);
        let duration = request
            .duration
            .unwrap_or_else(|| request.update.default_duration(&from));
        let step = Duration::from_millis(self.inner.config.step_ms);

        self.push_history(from.clone());
        *lock(&self.inner.in_flight) = Some((request.id, token.clone()));
        self.inner.state_tx.send_modify(|s| s.transitioning = true);
        let _animating = Animating {
            inner: &self.inner,
            id: request.id,
        };

        debug!(
            id = %request.id,
            from = %from.current,
            to = %target.current,
            duration_ms = duration.as_millis() as u64,
            easing = ?request.easing,
            "Transition started"
        );

        for planned in plan_steps(&from, &target, duration, request.easing, step) {
            self.inner.state_tx.send_replace(planned.state);
            sleep_or_cancel(planned.step_duration, &token, "avatar transition step").await?;
        }

        let mut final_state = target;
        final_state.transitioning = false;
        final_state.last_transition = Utc::now();
        self.inner.state_tx.send_replace(final_state.clone());

        debug!(id = %request.id, state = %final_state.current, emotion = %final_state.emotion, "Transition complete");

        if let Some(callback) = request.on_complete {
            if let Err(e) = guard_callback("transition completion callback", || callback(&final_state)) {
                error!(id = %request.id, error = %e, "Completion callback failed");
            }
        }
        Ok(())
    }

    fn push_history(&self, state: AvatarState) {
        let mut history = lock(&self.inner.history);
        history.push_back(StateHistoryEntry {
            state,
            recorded_at: Utc::now(),
        });
        while history.len() > self.inner.config.history_limit {
            history.pop_front();
        }
    }
}

/// Clears the animating marks when `execute` returns, fails or is dropped mid-step.
struct Animating<'a> {
    inner: &'a EngineInner,
    id: Uuid,
}

impl Drop for Animating<'_> {
    fn drop(&mut self) {
        {
            let mut in_flight = lock(&self.inner.in_flight);
            if in_flight.as_ref().is_some_and(|(id, _)| *id == self.id) {
                in_flight.take();
            }
        }
        self.inner
            .state_tx
            .send_if_modified(|s| std::mem::replace(&mut s.transitioning, false));
    }
}

impl Default for AvatarEngine {
    fn default() -> Self {
        Self::new(AvatarConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::avatar::{AvatarMode, Emotion};

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> CompletionCallback) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let make = move |name: &'static str| -> CompletionCallback {
            let sink = Arc::clone(&sink);
            Box::new(move |_state: &AvatarState| {
                sink.lock().unwrap().push(name);
                Ok(())
            })
        };
        (log, make)
    }

    fn opts(priority: Priority, callback: CompletionCallback) -> TransitionOptions {
        TransitionOptions {
            priority,
            on_complete: Some(callback),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transition_reaches_target_and_clears_flag() {
        let engine = AvatarEngine::default();
        let outcome = engine
            .request_transition(
                StateUpdate::new().mode(AvatarMode::Speaking).speaking(true),
                TransitionOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(outcome, TransitionOutcome::Completed);

        let state = engine.current_state();
        assert_eq!(state.current, AvatarMode::Speaking);
        assert!(state.speaking);
        assert!(!state.transitioning);
        assert_eq!(engine.state_history().len(), 1);
        assert_eq!(engine.state_history()[0].state.current, AvatarMode::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn transitioning_flag_is_set_while_animating() {
        let engine = AvatarEngine::default();
        let ticket = engine.submit(
            StateUpdate::new().emotion(Emotion::Happy),
            TransitionOptions::default(),
        );
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(engine.is_transitioning());
        assert_eq!(ticket.await, TransitionOutcome::Completed);
        assert!(!engine.is_transitioning());
        assert_eq!(engine.current_state().emotion, Emotion::Happy);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_runs_in_priority_then_enqueue_order() {
        let engine = AvatarEngine::default();
        let (log, cb) = recorder();

        // Occupies the drain so the rest queue up behind it.
        let first = engine.submit(
            StateUpdate::new().emotion(Emotion::Happy),
            opts(Priority::Normal, cb("blocker")),
        );
        let a = engine.submit(StateUpdate::new().emotion(Emotion::Sad), opts(Priority::Low, cb("low-a")));
        let b = engine.submit(StateUpdate::new().mode(AvatarMode::Thinking), opts(Priority::Normal, cb("normal-b")));
        let c = engine.submit(StateUpdate::new().emotion(Emotion::Resting), opts(Priority::Low, cb("low-c")));
        let d = engine.submit(StateUpdate::new().speaking(true), opts(Priority::Normal, cb("normal-d")));

        for t in [first, a, b, c, d] {
            assert_eq!(t.await, TransitionOutcome::Completed);
        }
        assert_eq!(
            *log.lock().unwrap(),
            vec!["blocker", "normal-b", "normal-d", "low-a", "low-c"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn high_priority_evicts_queued_non_high() {
        let engine = AvatarEngine::default();
        let (log, cb) = recorder();

        let blocker = engine.submit(StateUpdate::new().emotion(Emotion::Happy), opts(Priority::Normal, cb("blocker")));
        // Let the drain pick up the blocker before queueing the rest.
        tokio::task::yield_now().await;
        let low = engine.submit(StateUpdate::new().emotion(Emotion::Sad), opts(Priority::Low, cb("low")));
        let high_a = engine.submit(StateUpdate::new().mode(AvatarMode::Listening), opts(Priority::High, cb("high-a")));
        let normal = engine.submit(StateUpdate::new().mode(AvatarMode::Idle), opts(Priority::Normal, cb("normal")));
        let high_b = engine.submit(StateUpdate::new().mode(AvatarMode::Thinking), opts(Priority::High, cb("high-b")));

        let queued: Vec<Priority> = engine.queued().iter().map(|q| q.priority).collect();
        assert_eq!(queued, vec![Priority::High, Priority::High]);

        assert_eq!(low.await, TransitionOutcome::Dropped);
        assert_eq!(normal.await, TransitionOutcome::Dropped);
        assert_eq!(blocker.await, TransitionOutcome::Completed);
        assert_eq!(high_a.await, TransitionOutcome::Completed);
        assert_eq!(high_b.await, TransitionOutcome::Completed);
        assert_eq!(*log.lock().unwrap(), vec!["blocker", "high-a", "high-b"]);
        assert_eq!(engine.current_state().current, AvatarMode::Thinking);
    }

    #[tokio::test(start_paused = true)]
    async fn force_clears_queue_and_runs_directly() {
        let engine = AvatarEngine::default();
        let blocker = engine.submit(StateUpdate::new().emotion(Emotion::Happy), TransitionOptions::default());
        tokio::task::yield_now().await;
        let queued = engine.submit(StateUpdate::new().emotion(Emotion::Sad), TransitionOptions::default());

        engine
            .request_transition(
                StateUpdate::new().mode(AvatarMode::Listening),
                TransitionOptions::default().forced(),
            )
            .await
            .unwrap();

        assert_eq!(queued.await, TransitionOutcome::Dropped);
        // The animating blocker was preempted.
        assert_eq!(blocker.await, TransitionOutcome::Dropped);
        let state = engine.current_state();
        assert_eq!(state.current, AvatarMode::Listening);
        assert!(!state.transitioning);
        assert!(engine.queued().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_keeps_queue_and_runs_first() {
        let engine = AvatarEngine::default();
        let (log, cb) = recorder();
        let blocker = engine.submit(StateUpdate::new().emotion(Emotion::Happy), opts(Priority::Normal, cb("blocker")));
        tokio::task::yield_now().await;
        let later = engine.submit(StateUpdate::new().emotion(Emotion::Sad), opts(Priority::Low, cb("later")));

        engine
            .request_transition(
                StateUpdate::new().mode(AvatarMode::Listening),
                opts(Priority::Immediate, cb("immediate")),
            )
            .await
            .unwrap();

        assert_eq!(blocker.await, TransitionOutcome::Dropped);
        assert_eq!(later.await, TransitionOutcome::Completed);
        assert_eq!(*log.lock().unwrap(), vec!["immediate", "later"]);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_callback_does_not_break_engine() {
        let engine = AvatarEngine::default();
        let outcome = engine
            .request_transition(
                StateUpdate::new().mode(AvatarMode::Thinking),
                TransitionOptions::default().on_complete(|_| anyhow::bail!("renderer went away")),
            )
            .await
            .unwrap();
        assert_eq!(outcome, TransitionOutcome::Completed);

        let outcome = engine
            .request_transition(
                StateUpdate::new().mode(AvatarMode::Idle),
                TransitionOptions::default().on_complete(|_| panic!("callback panic")),
            )
            .await
            .unwrap();
        assert_eq!(outcome, TransitionOutcome::Completed);
        assert_eq!(engine.current_state().current, AvatarMode::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_raw_update_is_rejected() {
        let engine = AvatarEngine::default();
        let raw = RawStateUpdate {
            emotion: Some("ecstatic".into()),
            ..Default::default()
        };
        let err = engine
            .request_raw_transition(raw, TransitionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LiveError::Validation(_)));
        assert!(engine.state_history().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn history_is_bounded_to_limit() {
        let engine = AvatarEngine::default();
        for i in 0..12 {
            let emotion = if i % 2 == 0 { Emotion::Happy } else { Emotion::Sad };
            engine
                .request_transition(
                    StateUpdate::new().emotion(emotion),
                    TransitionOptions::default().with_duration(Duration::from_millis(50)),
                )
                .await
                .unwrap();
        }
        let history = engine.state_history();
        assert_eq!(history.len(), 10);
        // Oldest two (neutral, happy) were evicted; entry 0 is the state before transition #3.
        assert_eq!(history[0].state.emotion, Emotion::Sad);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_cancels_and_is_idempotent() {
        let engine = AvatarEngine::default();
        let running = engine.submit(StateUpdate::new().emotion(Emotion::Angry), TransitionOptions::default());
        tokio::task::yield_now().await;
        let queued = engine.submit(StateUpdate::new().mode(AvatarMode::Speaking), TransitionOptions::default());
        tokio::time::sleep(Duration::from_millis(60)).await;

        engine.reset();
        let once = engine.current_state();
        engine.reset();
        let twice = engine.current_state();

        assert_eq!(running.await, TransitionOutcome::Dropped);
        assert_eq!(queued.await, TransitionOutcome::Dropped);
        assert!(once.same_pose(&twice));
        assert!(once.same_pose(&AvatarState::default()));
        assert!(engine.queued().is_empty());
        assert!(engine.state_history().is_empty());
        assert!(!engine.is_draining());

        // Still usable after reset.
        let outcome = engine
            .request_transition(StateUpdate::new().emotion(Emotion::Happy), TransitionOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome, TransitionOutcome::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_direct_caller_does_not_strand_animation() {
        let engine = AvatarEngine::default();
        let attempt = tokio::time::timeout(
            Duration::from_millis(100),
            engine.request_transition(
                StateUpdate::new().mode(AvatarMode::Listening),
                TransitionOptions::default().with_priority(Priority::Immediate),
            ),
        )
        .await;
        assert!(attempt.is_err());
        assert!(engine.is_transitioning());

        tokio::time::sleep(Duration::from_secs(1)).await;
        let state = engine.current_state();
        assert!(!state.transitioning);
        assert_eq!(state.current, AvatarMode::Listening);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_withdraws_queued_and_running_requests() {
        let engine = AvatarEngine::default();
        let running = engine.submit(StateUpdate::new().emotion(Emotion::Angry), TransitionOptions::default());
        tokio::task::yield_now().await;
        let queued = engine.submit(StateUpdate::new().mode(AvatarMode::Thinking), TransitionOptions::default());
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(engine.cancel(queued.id()));
        assert!(engine.queued().is_empty());
        assert_eq!(queued.await, TransitionOutcome::Dropped);

        let running_id = running.id();
        assert!(engine.cancel(running_id));
        assert_eq!(running.await, TransitionOutcome::Dropped);
        assert!(!engine.is_transitioning());
        assert!(!engine.cancel(running_id));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_ne!(engine.current_state().current, AvatarMode::Thinking);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_ticket_waits_for_running_transition() {
        let engine = AvatarEngine::default();
        let first = engine.submit(StateUpdate::new().emotion(Emotion::Happy), TransitionOptions::default());
        let mut second = tokio_test::task::spawn(
            engine.submit(StateUpdate::new().mode(AvatarMode::Thinking), TransitionOptions::default()),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        tokio_test::assert_pending!(second.poll());

        assert_eq!(first.await, TransitionOutcome::Completed);
        assert_eq!(second.await, TransitionOutcome::Completed);
        assert_eq!(engine.current_state().current, AvatarMode::Thinking);
    }

    #[tokio::test(start_paused = true)]
    async fn subscribers_see_intermediate_steps() {
        let engine = AvatarEngine::default();
        let mut rx = engine.subscribe();
        let ticket = engine.submit(
            StateUpdate::new().mode(AvatarMode::Listening),
            TransitionOptions::default()
                .with_duration(Duration::from_millis(200))
                .with_easing(Easing::Linear),
        );
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().transitioning);
        assert_eq!(ticket.await, TransitionOutcome::Completed);
        assert!(!rx.borrow().transitioning);
        assert_eq!(rx.borrow().current, AvatarMode::Listening);
    }
}
