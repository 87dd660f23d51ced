//! Integration tests for the live loop: speech, interruptions and the avatar together.
//!
//! Runs against placeholder playback on a paused tokio clock, so no audio device is needed.

use avatar_live::{
    ActionOutcome, Admission, AvatarMode, InterruptionEvent, InterruptionKind, LiveConfig,
    LiveLoop, RejectReason,
};
use std::time::Duration;

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn reply() -> impl futures::Stream<Item = String> {
    tokio_stream::iter(
        ["Hello there. ", "Let me walk you through it. ", "First, open the panel."]
            .into_iter()
            .map(String::from),
    )
}

fn voice_session() -> LiveLoop {
    let live = LiveLoop::with_placeholders(LiveConfig::default());
    live.conversation().set_voice_mode(true);
    live
}

#[tokio::test(start_paused = true)]
async fn strong_interruption_cuts_speech_and_listens() {
    init_logging();
    let live = voice_session();

    let interrupt = async {
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(live.audio().is_playing());
        live.handle_interruption(InterruptionEvent::new(0.7, 0.95))
    };
    let (summary, admission) = tokio::join!(live.speak_stream(reply(), "en"), interrupt);
    let summary = summary.expect("speech should not error");

    assert_eq!(admission, Admission::Queued);
    assert!(summary.interrupted);
    assert!(summary.played < 3);

    live.interruptions().idle().await;
    let history = live.interruptions().history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].response.kind, InterruptionKind::Strong);
    assert_eq!(history[0].failed_actions(), 0);

    let state = live.avatar().current_state();
    assert_eq!(state.current, AvatarMode::Listening);
    assert!(!live.audio().is_playing());
}

#[tokio::test(start_paused = true)]
async fn moderate_interruption_pauses_then_finishes_reply() {
    init_logging();
    let live = voice_session();

    let interrupt = async {
        tokio::time::sleep(Duration::from_millis(400)).await;
        live.handle_interruption(InterruptionEvent::new(0.25, 0.7))
    };
    let (summary, admission) = tokio::join!(live.speak_stream(reply(), "en"), interrupt);
    let summary = summary.expect("speech should not error");

    assert!(admission.is_queued());
    assert!(!summary.interrupted);
    assert_eq!(summary.sentences, 3);
    assert_eq!(summary.played, 3);

    live.interruptions().idle().await;
    let record = &live.interruptions().history()[0];
    assert_eq!(record.response.kind, InterruptionKind::Moderate);
    assert_eq!(record.outcomes[0].1, ActionOutcome::Completed);
}

#[tokio::test(start_paused = true)]
async fn interruptions_outside_speech_are_rejected() {
    init_logging();
    let live = voice_session();

    let admission = live.handle_interruption(InterruptionEvent::new(0.7, 0.95));
    assert_eq!(admission, Admission::Rejected(RejectReason::NotSpeaking));

    live.conversation().set_voice_mode(false);
    let admission = live.handle_interruption(InterruptionEvent::new(0.7, 0.95));
    assert_eq!(admission, Admission::Rejected(RejectReason::VoiceModeInactive));
    assert_eq!(live.interruptions().stats().rejected, 2);
}

#[tokio::test(start_paused = true)]
async fn subscribers_follow_speech_back_to_idle() {
    init_logging();
    let live = voice_session();
    let mut rx = live.subscribe();

    let watcher = async {
        let mut saw_speaking = false;
        while rx.changed().await.is_ok() {
            let state = rx.borrow_and_update().clone();
            saw_speaking |= state.current == AvatarMode::Speaking && state.speaking;
            if saw_speaking && state.current == AvatarMode::Idle && !state.transitioning {
                break;
            }
        }
        saw_speaking
    };
    let (summary, saw_speaking) = tokio::join!(live.speak_stream(reply(), "en"), watcher);

    assert!(!summary.unwrap().interrupted);
    assert!(saw_speaking);
}
