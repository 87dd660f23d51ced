//! # Avatar Live - Real-time coordination for a speaking avatar
//!
//! This crate keeps an on-screen avatar in step with streamed speech: it
//! animates avatar state transitions, cuts LLM output into sentences for
//! incremental synthesis, crossfades the synthesized segments, and reacts when
//! the user talks over the assistant.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            LiveLoop                              │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────────┐     │
//! │  │  LLM chunks  │ → │  Sentence    │ → │ SpeechSynthesizer│     │
//! │  │   (Stream)   │   │  Segmenter   │   │  (HTTP / local)  │     │
//! │  └──────────────┘   └──────────────┘   └──────────────────┘     │
//! │                                                 ↓                │
//! │  ┌──────────────┐    priority         ┌──────────────────┐      │
//! │  │ AvatarEngine │ ←── transitions ──  │ CrossfadeManager │      │
//! │  │ (watch state)│                     │ (50ms crossfade) │      │
//! │  └──────────────┘                     └──────────────────┘      │
//! │         ↑                                       ↑                │
//! │         └────────── InterruptionPipeline ───────┘                │
//! │                  (VAD samples → stop / pause)                    │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod avatar;
pub mod clock;
pub mod config;
pub mod conversation;
pub mod crossfade;
pub mod error;
pub mod interrupt;
pub mod live_loop;
pub mod logging;
pub mod pipeline;
pub mod playback;
#[cfg(feature = "rodio")]
pub mod rodio_sink;
pub mod segmenter;
pub mod speech;
mod sync;
pub mod transition;

pub use avatar::{AvatarMode, AvatarState, Easing, Emotion, Priority, RawStateUpdate, StateUpdate};
pub use config::{
    AudioConfig, AvatarConfig, InterruptionConfig, InterruptionConfigUpdate, LiveConfig,
    SegmenterConfig, SpeechConfig,
};
pub use conversation::{ConversationState, SharedConversation};
pub use crossfade::{CrossfadeManager, PlaybackControl, PlaybackStats, SegmentHandle};
pub use error::{LiveError, LiveResult};
pub use interrupt::{
    Action, ActionOutcome, InterruptionEvent, InterruptionKind, InterruptionRecord,
    InterruptionResponse, RawInterruptionEvent,
};
pub use live_loop::{LiveLoop, SpeechSummary};
pub use logging::init_tracing;
pub use pipeline::{Admission, HandlerId, InterruptionPipeline, RejectReason};
pub use playback::{AudioBlob, PlaceholderFactory, PlaybackSource, SourceFactory};
#[cfg(feature = "rodio")]
pub use rodio_sink::RodioFactory;
pub use segmenter::SentenceSegmenter;
pub use speech::{HttpSpeechSynthesizer, PlaceholderSynthesizer, SpeechSynthesizer};
pub use transition::{AvatarEngine, TransitionOptions, TransitionOutcome, TransitionTicket};
