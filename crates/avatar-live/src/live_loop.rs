//! **LiveLoop**: One context object owning the four engines of a voice session.
//!
//! Built once at startup and shared by reference. `speak_stream` runs the
//! speaking path (segmenter → synthesizer → crossfade queue, with the avatar
//! following along); `handle_interruption` feeds the interruption pipeline,
//! which preempts that path through the avatar engine and playback control.

use crate::avatar::{AvatarMode, AvatarState, Priority, StateUpdate};
use crate::config::LiveConfig;
use crate::conversation::SharedConversation;
use crate::crossfade::CrossfadeManager;
use crate::error::LiveResult;
use crate::interrupt::InterruptionEvent;
use crate::pipeline::{Admission, InterruptionPipeline};
use crate::playback::{PlaceholderFactory, SourceFactory};
use crate::segmenter::SentenceSegmenter;
use crate::speech::{PlaceholderSynthesizer, SpeechSynthesizer};
use crate::transition::{AvatarEngine, TransitionOptions, TransitionOutcome};
use futures::{Stream, StreamExt};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// What happened during one `speak_stream` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpeechSummary {
    /// Sentences emitted by the segmenter and sent to synthesis.
    pub sentences: usize,
    /// Segments that reached the speaker.
    pub played: u64,
    /// Sentences lost to synthesis or playback failures.
    pub skipped: u64,
    /// Playback was stopped before the stream finished.
    pub interrupted: bool,
}

pub struct LiveLoop {
    config: LiveConfig,
    avatar: AvatarEngine,
    audio: CrossfadeManager,
    interruptions: InterruptionPipeline,
    conversation: SharedConversation,
    synthesizer: Arc<dyn SpeechSynthesizer>,
}

impl LiveLoop {
    pub fn new(
        config: LiveConfig,
        sources: Arc<dyn SourceFactory>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
    ) -> Self {
        let config = config.validated();
        let avatar = AvatarEngine::new(config.avatar.clone());
        let audio = CrossfadeManager::new(config.audio.clone(), sources);
        let conversation = SharedConversation::new();
        let interruptions = InterruptionPipeline::new(
            config.interruption.clone(),
            avatar.clone(),
            Arc::new(audio.clone()),
            Arc::new(conversation.clone()),
        );
        info!("🎙️ Live loop assembled");
        Self {
            config,
            avatar,
            audio,
            interruptions,
            conversation,
            synthesizer,
        }
    }

    /// Silent playback and placeholder synthesis; for tests and demos.
    pub fn with_placeholders(config: LiveConfig) -> Self {
        Self::new(
            config,
            Arc::new(PlaceholderFactory::default()),
            Arc::new(PlaceholderSynthesizer::default()),
        )
    }

    pub fn config(&self) -> &LiveConfig {
        &self.config
    }

    pub fn avatar(&self) -> &AvatarEngine {
        &self.avatar
    }

    pub fn audio(&self) -> &CrossfadeManager {
        &self.audio
    }

    pub fn interruptions(&self) -> &InterruptionPipeline {
        &self.interruptions
    }

    pub fn conversation(&self) -> &SharedConversation {
        &self.conversation
    }

    /// Avatar state updates for UI layers.
    pub fn subscribe(&self) -> watch::Receiver<AvatarState> {
        self.avatar.subscribe()
    }

    pub fn handle_interruption(&self, event: InterruptionEvent) -> Admission {
        self.interruptions.handle(event)
    }

    /// Speak a streamed reply sentence by sentence.
    ///
    /// Synthesis failures skip the sentence. If playback is stopped mid-stream
    /// (an interruption), the remaining text is abandoned and the avatar is
    /// left to the interruption response.
    pub async fn speak_stream<S>(&self, chunks: S, language: &str) -> LiveResult<SpeechSummary>
    where
        S: Stream<Item = String>,
    {
        let epoch = self.audio.stop_epoch();
        let before = self.audio.stats();
        let mut segmenter = SentenceSegmenter::collecting(&self.config.segmenter);
        let mut summary = SpeechSummary::default();

        self.conversation.set_assistant_speaking(true);
        let speaking = self.avatar.submit(
            StateUpdate::new().mode(AvatarMode::Speaking).speaking(true),
            TransitionOptions::default().with_priority(Priority::High),
        );
        // Speech does not wait for the pose; a superseded one is only logged.
        tokio::spawn(async move {
            let id = speaking.id();
            if speaking.await == TransitionOutcome::Dropped {
                debug!(%id, "Speaking transition superseded");
            }
        });

        let mut chunks = std::pin::pin!(chunks);
        while let Some(chunk) = chunks.next().await {
            if self.audio.stop_epoch() != epoch {
                break;
            }
            for sentence in segmenter.ingest(&chunk) {
                self.speak_sentence(&sentence, language, epoch, &mut summary).await;
            }
        }
        if self.audio.stop_epoch() == epoch {
            for sentence in segmenter.finalize() {
                self.speak_sentence(&sentence, language, epoch, &mut summary).await;
            }
            self.audio.idle().await;
        }

        let after = self.audio.stats();
        summary.played = after.played - before.played;
        summary.skipped += after.skipped - before.skipped;
        summary.interrupted = self.audio.stop_epoch() != epoch;
        self.conversation.set_assistant_speaking(false);

        if summary.interrupted {
            info!(sentences = summary.sentences, played = summary.played, "Speech interrupted");
        } else {
            self.avatar
                .request_transition(
                    StateUpdate::new().mode(AvatarMode::Idle).speaking(false),
                    TransitionOptions::default(),
                )
                .await?;
            debug!(?summary, "Speech finished");
        }
        Ok(summary)
    }

    async fn speak_sentence(&self, sentence: &str, language: &str, epoch: u64, summary: &mut SpeechSummary) {
        if self.audio.stop_epoch() != epoch {
            return;
        }
        summary.sentences += 1;
        match self.synthesizer.synthesize(sentence, language).await {
            // Stopped while synthesizing: the audio is stale.
            Ok(_) if self.audio.stop_epoch() != epoch => {}
            Ok(blob) => self.audio.enqueue(blob),
            Err(e) => {
                summary.skipped += 1;
                warn!(sentence, error = %e, "Synthesis failed, skipping sentence");
            }
        }
    }

    /// Stop playback and return every engine to its initial state.
    pub fn reset(&self) {
        self.audio.stop();
        self.interruptions.reset();
        self.avatar.reset();
        self.conversation.set_assistant_speaking(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::ConversationState;
    use crate::error::LiveError;
    use crate::playback::AudioBlob;
    use async_trait::async_trait;

    struct FlakySynthesizer;

    #[async_trait]
    impl SpeechSynthesizer for FlakySynthesizer {
        async fn synthesize(&self, text: &str, language: &str) -> LiveResult<AudioBlob> {
            if text.contains("fail") {
                return Err(LiveError::Synthesis("upstream 503".to_string()));
            }
            PlaceholderSynthesizer::default().synthesize(text, language).await
        }
    }

    fn chunks(parts: &[&str]) -> impl Stream<Item = String> {
        futures::stream::iter(parts.iter().map(|s| s.to_string()).collect::<Vec<_>>())
    }

    #[tokio::test(start_paused = true)]
    async fn speaks_every_sentence_and_returns_to_idle() {
        let live = LiveLoop::with_placeholders(LiveConfig::default());
        let summary = live
            .speak_stream(chunks(&["Hello there. ", "How are you? ", "I am fine."]), "en")
            .await
            .unwrap();
        assert_eq!(
            summary,
            SpeechSummary {
                sentences: 3,
                played: 3,
                skipped: 0,
                interrupted: false
            }
        );
        let state = live.avatar().current_state();
        assert_eq!(state.current, AvatarMode::Idle);
        assert!(!state.speaking);
        assert!(!live.conversation().assistant_speaking());
    }

    #[tokio::test(start_paused = true)]
    async fn synthesis_failures_are_skipped() {
        let live = LiveLoop::new(
            LiveConfig::default(),
            Arc::new(PlaceholderFactory::default()),
            Arc::new(FlakySynthesizer),
        );
        let summary = live
            .speak_stream(chunks(&["This will fail. ", "This one works."]), "en")
            .await
            .unwrap();
        assert_eq!(summary.sentences, 2);
        assert_eq!(summary.played, 1);
        assert_eq!(summary.skipped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn avatar_speaks_while_the_reply_plays() {
        let live = LiveLoop::with_placeholders(LiveConfig::default());
        let summary = live
            .speak_stream(chunks(&["One sentence to say."]), "en")
            .await
            .unwrap();
        assert_eq!(summary.played, 1);

        let history = live.avatar().state_history();
        assert!(history
            .iter()
            .any(|entry| entry.state.current == AvatarMode::Speaking && entry.state.speaking));
        assert_eq!(live.avatar().current_state().current, AvatarMode::Idle);
        assert!(live.avatar().queued().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reset_returns_everything_to_idle() {
        let live = LiveLoop::with_placeholders(LiveConfig::default());
        live.audio().enqueue(AudioBlob::new(vec![0u8; 48_000]));
        live.conversation().set_assistant_speaking(true);
        live.reset();
        live.reset();
        assert!(!live.audio().is_playing());
        assert!(live.avatar().current_state().same_pose(&AvatarState::default()));
        assert!(!live.conversation().assistant_speaking());
    }
}
