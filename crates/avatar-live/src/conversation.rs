//! Read-only view of the conversation/session the live loop runs in.
//!
//! The interruption pipeline only admits events while voice mode is active
//! and the assistant is speaking; it never writes these flags itself.

use crate::sync::lock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Session flags consumed by the interruption pipeline.
pub trait ConversationState: Send + Sync {
    fn assistant_speaking(&self) -> bool;
    fn voice_mode_active(&self) -> bool;
    /// Language of the current conversation (BCP-47 tag), if known.
    fn language(&self) -> Option<String>;
}

/// Snapshot copied into each interruption context.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConversationSnapshot {
    pub assistant_speaking: bool,
    pub voice_mode_active: bool,
    pub language: Option<String>,
}

impl ConversationSnapshot {
    pub fn capture(state: &dyn ConversationState) -> Self {
        Self {
            assistant_speaking: state.assistant_speaking(),
            voice_mode_active: state.voice_mode_active(),
            language: state.language(),
        }
    }
}

/// Thread-safe flags shared between the live loop and the UI glue.
#[derive(Debug, Clone, Default)]
pub struct SharedConversation {
    speaking: Arc<AtomicBool>,
    voice_mode: Arc<AtomicBool>,
    language: Arc<Mutex<Option<String>>>,
}

impl SharedConversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_assistant_speaking(&self, speaking: bool) {
        self.speaking.store(speaking, Ordering::Release);
    }

    pub fn set_voice_mode(&self, active: bool) {
        self.voice_mode.store(active, Ordering::Release);
    }

    pub fn set_language(&self, language: Option<String>) {
        *lock(&self.language) = language;
    }
}

impl ConversationState for SharedConversation {
    fn assistant_speaking(&self) -> bool {
        self.speaking.load(Ordering::Acquire)
    }

    fn voice_mode_active(&self) -> bool {
        self.voice_mode.load(Ordering::Acquire)
    }

    fn language(&self) -> Option<String> {
        lock(&self.language).clone()
    }
}
