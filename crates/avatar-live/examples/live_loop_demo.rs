//! Live Loop Demo: stream a reply, then talk over it.
//!
//! Streams a canned LLM reply through the sentence segmenter and crossfade
//! queue while printing avatar state changes, then injects a strong
//! interruption halfway through.
//!
//! - **TTS**: `HttpSpeechSynthesizer` if `TTS_API_KEY` (or `OPENAI_API_KEY`) is set, else silent placeholders.
//! - **Playback**: the default output device with `--features rodio`, else silent placeholders.
//!
//! ```sh
//! RUST_LOG=avatar_live=debug cargo run --example live_loop_demo --features rodio
//! ```

use avatar_live::{
    init_tracing, HttpSpeechSynthesizer, InterruptionEvent, LiveConfig, LiveLoop,
    PlaceholderFactory, PlaceholderSynthesizer, SourceFactory, SpeechSynthesizer,
};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const REPLY: &[&str] = &[
    "Sure, let me expl",
    "ain. The avatar moves ",
    "between modes as it speaks. ",
    "Each sentence is synthesized on its own! ",
    "Segments overlap by a short crossfade. ",
    "If you talk over me, I stop and listen.",
];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = LiveConfig::load()?;

    let synthesizer: Arc<dyn SpeechSynthesizer> = match HttpSpeechSynthesizer::from_env() {
        Ok(tts) => {
            info!("Using HttpSpeechSynthesizer for synthesis.");
            Arc::new(tts)
        }
        Err(e) => {
            info!("Using PlaceholderSynthesizer ({}).", e);
            Arc::new(PlaceholderSynthesizer::default())
        }
    };
    let live = LiveLoop::new(config, output(), synthesizer);
    live.conversation().set_voice_mode(true);

    let mut states = live.subscribe();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = states.borrow_and_update().clone();
            if !state.transitioning {
                info!(mode = %state.current, emotion = %state.emotion, speaking = state.speaking, "Avatar");
            }
        }
    });

    // Simulated LLM token stream.
    let chunks = futures::stream::iter(REPLY.iter().map(|s| s.to_string())).then(|chunk| async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        chunk
    });

    let interrupter = async {
        tokio::time::sleep(Duration::from_secs(4)).await;
        info!("🗣️ User starts talking");
        live.handle_interruption(InterruptionEvent::new(0.6, 0.9))
    };

    let (summary, admission) = tokio::join!(live.speak_stream(chunks, "en"), interrupter);
    let summary = summary?;
    info!(?admission, "Interruption admission");
    info!(
        sentences = summary.sentences,
        played = summary.played,
        skipped = summary.skipped,
        interrupted = summary.interrupted,
        "Reply finished"
    );

    live.interruptions().idle().await;
    for record in live.interruptions().history() {
        info!(kind = %record.response.kind, actions = record.outcomes.len(), "Handled interruption");
    }
    info!(state = ?live.avatar().current_state(), "Final avatar state");

    live.reset();
    Ok(())
}

#[cfg(feature = "rodio")]
fn output() -> Arc<dyn SourceFactory> {
    match avatar_live::RodioFactory::new() {
        Ok(factory) => Arc::new(factory),
        Err(e) => {
            info!("No audio output ({}), playing silently.", e);
            Arc::new(PlaceholderFactory::default())
        }
    }
}

#[cfg(not(feature = "rodio"))]
fn output() -> Arc<dyn SourceFactory> {
    Arc::new(PlaceholderFactory::default())
}
