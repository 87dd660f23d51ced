//! Interruption events, their classification and the response each class triggers.

use crate::avatar::{AvatarState, Priority};
use crate::conversation::ConversationSnapshot;
use crate::error::{LiveError, LiveResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Language assumed when neither the event nor the conversation names one.
pub const DEFAULT_LANGUAGE: &str = "en";

/// A voice-activity sample reported while the assistant is speaking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterruptionEvent {
    pub timestamp: DateTime<Utc>,
    pub energy: f32,
    /// VAD confidence in `[0, 1]`.
    pub confidence: f32,
    #[serde(default)]
    pub detected_language: Option<String>,
}

impl InterruptionEvent {
    pub fn new(energy: f32, confidence: f32) -> Self {
        Self {
            timestamp: Utc::now(),
            energy,
            confidence,
            detected_language: None,
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.detected_language = Some(language.into());
        self
    }

    /// Structural checks: finite readings, confidence inside `[0, 1]`.
    pub fn validate(&self) -> LiveResult<()> {
        if !self.energy.is_finite() {
            return Err(LiveError::Validation(format!("energy is not finite: {}", self.energy)));
        }
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(LiveError::Validation(format!(
                "confidence out of range: {}",
                self.confidence
            )));
        }
        Ok(())
    }
}

/// Event as it arrives from JSON glue, with every field optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawInterruptionEvent {
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub energy: Option<f32>,
    #[serde(default)]
    pub confidence: Option<f32>,
    #[serde(default)]
    pub detected_language: Option<String>,
}

impl TryFrom<RawInterruptionEvent> for InterruptionEvent {
    type Error = LiveError;

    fn try_from(raw: RawInterruptionEvent) -> LiveResult<Self> {
        let missing = |field: &str| LiveError::Validation(format!("interruption event missing '{}'", field));
        let event = InterruptionEvent {
            timestamp: raw.timestamp.ok_or_else(|| missing("timestamp"))?,
            energy: raw.energy.ok_or_else(|| missing("energy"))?,
            confidence: raw.confidence.ok_or_else(|| missing("confidence"))?,
            detected_language: raw.detected_language,
        };
        event.validate()?;
        Ok(event)
    }
}

/// Strength of an interruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptionKind {
    Strong,
    Moderate,
    Weak,
    Unclear,
}

impl fmt::Display for InterruptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Strong => write!(f, "strong"),
            Self::Moderate => write!(f, "moderate"),
            Self::Weak => write!(f, "weak"),
            Self::Unclear => write!(f, "unclear"),
        }
    }
}

/// First matching rule wins; all bounds are exclusive.
pub fn classify(confidence: f32, energy: f32) -> InterruptionKind {
    if confidence > 0.8 && energy > 0.3 {
        InterruptionKind::Strong
    } else if confidence > 0.6 && energy > 0.2 {
        InterruptionKind::Moderate
    } else if confidence > 0.4 {
        InterruptionKind::Weak
    } else {
        InterruptionKind::Unclear
    }
}

/// One step of an interruption response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// Stop playback and go to listening.
    StopSpeech { immediate: bool },
    /// Pause playback in listening, then return to speaking.
    PauseSpeech { duration: Duration },
    /// Show the avatar thinking.
    Acknowledge { priority: Priority },
    /// Hand the turn to the user.
    OfferContinuation { priority: Priority },
    /// Hold playback briefly.
    BriefPause { duration: Duration },
    /// Resume speaking unless more interruptions arrive within `timeout`.
    ContinueIfQuiet { timeout: Duration },
    /// Watch for `timeout`, resuming held playback if nothing else arrives.
    Monitor { timeout: Duration },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::StopSpeech { .. } => "stop_speech",
            Action::PauseSpeech { .. } => "pause_speech",
            Action::Acknowledge { .. } => "acknowledge",
            Action::OfferContinuation { .. } => "offer_continuation",
            Action::BriefPause { .. } => "brief_pause",
            Action::ContinueIfQuiet { .. } => "continue_if_quiet",
            Action::Monitor { .. } => "monitor",
        }
    }
}

/// What the pipeline decided to do about one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterruptionResponse {
    pub kind: InterruptionKind,
    pub language: String,
    pub confidence: f32,
    pub actions: Vec<Action>,
}

/// Deterministic action list per interruption kind.
pub fn build_response(kind: InterruptionKind, language: impl Into<String>, confidence: f32) -> InterruptionResponse {
    let ms = Duration::from_millis;
    let actions = match kind {
        InterruptionKind::Strong => vec![
            Action::StopSpeech { immediate: true },
            Action::Acknowledge { priority: Priority::High },
            Action::OfferContinuation { priority: Priority::Normal },
        ],
        InterruptionKind::Moderate => vec![
            Action::PauseSpeech { duration: ms(500) },
            Action::Acknowledge { priority: Priority::Normal },
            Action::OfferContinuation { priority: Priority::Low },
        ],
        InterruptionKind::Weak => vec![
            Action::BriefPause { duration: ms(200) },
            Action::ContinueIfQuiet { timeout: ms(1000) },
        ],
        InterruptionKind::Unclear => vec![Action::Monitor { timeout: ms(500) }],
    };
    InterruptionResponse {
        kind,
        language: language.into(),
        confidence,
        actions,
    }
}

/// Everything known about one event while it is processed.
#[derive(Debug, Clone)]
pub struct InterruptionContext {
    pub event: InterruptionEvent,
    pub kind: InterruptionKind,
    /// Whether audio was audible when processing started.
    pub playback_active: bool,
    pub avatar: AvatarState,
    pub conversation: ConversationSnapshot,
}

impl InterruptionContext {
    /// Detected language, else the conversation's, else [`DEFAULT_LANGUAGE`].
    pub fn language(&self) -> String {
        self.event
            .detected_language
            .clone()
            .or_else(|| self.conversation.language.clone())
            .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string())
    }
}

/// How a single action ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum ActionOutcome {
    Completed,
    /// The "continue" branch was skipped because newer events are queued.
    Abandoned,
    /// The avatar transition was dropped by a higher-priority request.
    Superseded,
    Failed(String),
}

/// History entry for a processed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterruptionRecord {
    pub event: InterruptionEvent,
    pub response: InterruptionResponse,
    pub outcomes: Vec<(Action, ActionOutcome)>,
    pub processed_at: DateTime<Utc>,
}

impl InterruptionRecord {
    pub fn failed_actions(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, ActionOutcome::Failed(_)))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_boundaries_are_exclusive() {
        assert_eq!(classify(0.81, 0.31), InterruptionKind::Strong);
        assert_eq!(classify(0.8, 0.31), InterruptionKind::Moderate);
        assert_eq!(classify(0.9, 0.3), InterruptionKind::Moderate);
        assert_eq!(classify(0.61, 0.21), InterruptionKind::Moderate);
        assert_eq!(classify(0.6, 0.9), InterruptionKind::Weak);
        assert_eq!(classify(0.95, 0.1), InterruptionKind::Weak);
        assert_eq!(classify(0.4, 0.9), InterruptionKind::Unclear);
    }

    #[test]
    fn responses_follow_kind() {
        let strong = build_response(InterruptionKind::Strong, "en", 0.9);
        assert_eq!(
            strong.actions,
            vec![
                Action::StopSpeech { immediate: true },
                Action::Acknowledge { priority: Priority::High },
                Action::OfferContinuation { priority: Priority::Normal },
            ]
        );

        let moderate = build_response(InterruptionKind::Moderate, "en", 0.7);
        assert_eq!(moderate.actions[0], Action::PauseSpeech { duration: Duration::from_millis(500) });
        assert_eq!(moderate.actions[2], Action::OfferContinuation { priority: Priority::Low });

        let weak = build_response(InterruptionKind::Weak, "en", 0.5);
        assert_eq!(weak.actions.len(), 2);

        let unclear = build_response(InterruptionKind::Unclear, "fr", 0.35);
        assert_eq!(unclear.actions, vec![Action::Monitor { timeout: Duration::from_millis(500) }]);
        assert_eq!(unclear.language, "fr");
    }

    #[test]
    fn raw_events_require_every_reading() {
        let raw: RawInterruptionEvent =
            serde_json::from_str(r#"{"timestamp":"2024-05-01T10:00:00Z","energy":0.4}"#).unwrap();
        let err = InterruptionEvent::try_from(raw).unwrap_err();
        assert!(matches!(err, LiveError::Validation(ref m) if m.contains("confidence")));

        let raw: RawInterruptionEvent = serde_json::from_str(
            r#"{"timestamp":"2024-05-01T10:00:00Z","energy":0.4,"confidence":0.9,"detectedLanguage":"de"}"#,
        )
        .unwrap();
        let event = InterruptionEvent::try_from(raw).unwrap();
        assert_eq!(event.detected_language.as_deref(), Some("de"));
    }

    #[test]
    fn non_finite_readings_fail_validation() {
        assert!(InterruptionEvent::new(f32::NAN, 0.9).validate().is_err());
        assert!(InterruptionEvent::new(0.5, 1.2).validate().is_err());
        assert!(InterruptionEvent::new(0.5, 0.9).validate().is_ok());
    }

    #[test]
    fn context_language_falls_back() {
        let ctx = InterruptionContext {
            event: InterruptionEvent::new(0.5, 0.9),
            kind: InterruptionKind::Strong,
            playback_active: true,
            avatar: AvatarState::default(),
            conversation: ConversationSnapshot {
                language: Some("ja".into()),
                ..Default::default()
            },
        };
        assert_eq!(ctx.language(), "ja");

        let ctx = InterruptionContext {
            conversation: ConversationSnapshot::default(),
            ..ctx
        };
        assert_eq!(ctx.language(), DEFAULT_LANGUAGE);
    }
}
