//! **Avatar state model**: The single displayed state, typed partial updates,
//! easing curves and the discrete step interpolation used by the transition engine.

use crate::error::{LiveError, LiveResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// What the avatar is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AvatarMode {
    Idle,
    Speaking,
    Listening,
    Thinking,
    Transitioning,
}

impl fmt::Display for AvatarMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Speaking => write!(f, "speaking"),
            Self::Listening => write!(f, "listening"),
            Self::Thinking => write!(f, "thinking"),
            Self::Transitioning => write!(f, "transitioning"),
        }
    }
}

impl FromStr for AvatarMode {
    type Err = LiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "idle" => Ok(Self::Idle),
            "speaking" => Ok(Self::Speaking),
            "listening" => Ok(Self::Listening),
            "thinking" => Ok(Self::Thinking),
            "transitioning" => Ok(Self::Transitioning),
            other => Err(LiveError::Validation(format!("unknown avatar state '{}'", other))),
        }
    }
}

/// Facial emotion shown by the avatar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Emotion {
    Neutral,
    Happy,
    Sad,
    Surprised,
    Angry,
    Resting,
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Neutral => write!(f, "neutral"),
            Self::Happy => write!(f, "happy"),
            Self::Sad => write!(f, "sad"),
            Self::Surprised => write!(f, "surprised"),
            Self::Angry => write!(f, "angry"),
            Self::Resting => write!(f, "resting"),
        }
    }
}

impl FromStr for Emotion {
    type Err = LiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "neutral" => Ok(Self::Neutral),
            "happy" => Ok(Self::Happy),
            "sad" => Ok(Self::Sad),
            "surprised" => Ok(Self::Surprised),
            "angry" => Ok(Self::Angry),
            "resting" => Ok(Self::Resting),
            other => Err(LiveError::Validation(format!("unknown emotion '{}'", other))),
        }
    }
}

/// The live avatar state. Exactly one instance is published by the transition engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvatarState {
    pub current: AvatarMode,
    pub emotion: Emotion,
    pub speaking: bool,
    /// True iff a transition is being animated.
    pub transitioning: bool,
    /// Opaque viseme token owned by the renderer.
    pub mouth_position: Option<String>,
    pub last_transition: DateTime<Utc>,
}

impl Default for AvatarState {
    fn default() -> Self {
        Self {
            current: AvatarMode::Idle,
            emotion: Emotion::Neutral,
            speaking: false,
            transitioning: false,
            mouth_position: None,
            last_transition: Utc::now(),
        }
    }
}

impl AvatarState {
    /// Target state reached by applying `update` to `self`.
    pub fn apply(&self, update: &StateUpdate) -> AvatarState {
        AvatarState {
            current: update.current.unwrap_or(self.current),
            emotion: update.emotion.unwrap_or(self.emotion),
            speaking: update.speaking.unwrap_or(self.speaking),
            transitioning: false,
            mouth_position: match &update.mouth_position {
                Some(m) => m.clone(),
                None => self.mouth_position.clone(),
            },
            last_transition: self.last_transition,
        }
    }

    /// Compare everything except timestamps.
    pub fn same_pose(&self, other: &AvatarState) -> bool {
        self.current == other.current
            && self.emotion == other.emotion
            && self.speaking == other.speaking
            && self.transitioning == other.transitioning
            && self.mouth_position == other.mouth_position
    }
}

/// Typed partial update. Unset fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateUpdate {
    pub current: Option<AvatarMode>,
    pub emotion: Option<Emotion>,
    pub speaking: Option<bool>,
    /// `Some(None)` clears the mouth position.
    pub mouth_position: Option<Option<String>>,
}

impl StateUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(mut self, mode: AvatarMode) -> Self {
        self.current = Some(mode);
        self
    }

    pub fn emotion(mut self, emotion: Emotion) -> Self {
        self.emotion = Some(emotion);
        self
    }

    pub fn speaking(mut self, speaking: bool) -> Self {
        self.speaking = Some(speaking);
        self
    }

    pub fn mouth(mut self, position: Option<String>) -> Self {
        self.mouth_position = Some(position);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_none()
            && self.emotion.is_none()
            && self.speaking.is_none()
            && self.mouth_position.is_none()
    }

    /// Duration policy: the most expensive changed field wins; 300ms when nothing changes.
    pub fn default_duration(&self, from: &AvatarState) -> Duration {
        let mut cost = 0u64;
        if self.emotion.is_some_and(|e| e != from.emotion) {
            cost = cost.max(500);
        }
        if self.current.is_some_and(|c| c != from.current) {
            cost = cost.max(300);
        }
        if self.speaking.is_some_and(|s| s != from.speaking) {
            cost = cost.max(200);
        }
        if self
            .mouth_position
            .as_ref()
            .is_some_and(|m| *m != from.mouth_position)
        {
            cost = cost.max(100);
        }
        if cost == 0 {
            cost = 300;
        }
        Duration::from_millis(cost)
    }
}

/// Untyped update as it arrives from JSON/UI glue. Converted with `StateUpdate::try_from`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawStateUpdate {
    #[serde(default)]
    pub current_state: Option<String>,
    #[serde(default)]
    pub emotion: Option<String>,
    #[serde(default)]
    pub speaking: Option<bool>,
    #[serde(default)]
    pub mouth_position: Option<String>,
}

impl TryFrom<RawStateUpdate> for StateUpdate {
    type Error = LiveError;

    fn try_from(raw: RawStateUpdate) -> LiveResult<Self> {
        Ok(StateUpdate {
            current: raw.current_state.as_deref().map(AvatarMode::from_str).transpose()?,
            emotion: raw.emotion.as_deref().map(Emotion::from_str).transpose()?,
            speaking: raw.speaking,
            mouth_position: raw.mouth_position.map(Some),
        })
    }
}

/// Progress-remapping curve for a timed transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Easing {
    Linear,
    EaseIn,
    #[default]
    EaseOut,
    EaseInOut,
}

impl Easing {
    /// Map linear progress `t` in `[0, 1]` onto the curve.
    pub fn apply(self, t: f64) -> f64 {
        let t = t.clamp(0.0, 1.0);
        match self {
            Easing::Linear => t,
            Easing::EaseIn => t * t,
            Easing::EaseOut => 1.0 - (1.0 - t) * (1.0 - t),
            Easing::EaseInOut => {
                if t < 0.5 {
                    2.0 * t * t
                } else {
                    1.0 - (-2.0 * t + 2.0).powi(2) / 2.0
                }
            }
        }
    }
}

/// Scheduling tier for a transition request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Immediate,
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Lower rank runs first.
    pub fn rank(self) -> u8 {
        match self {
            Priority::Immediate => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Immediate => write!(f, "immediate"),
            Self::High => write!(f, "high"),
            Self::Normal => write!(f, "normal"),
            Self::Low => write!(f, "low"),
        }
    }
}

/// One increment of an animated transition.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionStep {
    pub state: AvatarState,
    pub step_duration: Duration,
    pub eased_progress: f64,
}

/// Discrete interpolation: every changed field snaps to the target once `eased >= 0.5`.
pub fn interpolate(from: &AvatarState, target: &AvatarState, eased: f64) -> AvatarState {
    // Unchanged fields are equal on both sides, so snapping the whole pose is equivalent.
    let source = if eased >= 0.5 { target } else { from };
    AvatarState {
        current: source.current,
        emotion: source.emotion,
        speaking: source.speaking,
        transitioning: true,
        mouth_position: source.mouth_position.clone(),
        last_transition: from.last_transition,
    }
}

/// Split a transition into `max(1, duration / step)` eased steps, produced lazily.
///
/// The count saturates at `u32::MAX`, so huge durations never divide by zero.
pub fn plan_steps(
    from: &AvatarState,
    target: &AvatarState,
    duration: Duration,
    easing: Easing,
    step: Duration,
) -> impl Iterator<Item = TransitionStep> {
    let step_ms = step.as_millis().max(1);
    let count = u32::try_from((duration.as_millis() / step_ms).max(1)).unwrap_or(u32::MAX);
    let step_duration = duration / count;
    let (from, target) = (from.clone(), target.clone());
    (1..=count).map(move |i| {
        let eased = easing.apply(f64::from(i) / f64::from(count));
        TransitionStep {
            state: interpolate(&from, &target, eased),
            step_duration,
            eased_progress: eased,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn easing_curves() {
        assert!(approx(Easing::Linear.apply(0.3), 0.3));
        assert!(approx(Easing::EaseIn.apply(0.5), 0.25));
        assert!(approx(Easing::EaseOut.apply(0.5), 0.75));
        assert!(approx(Easing::EaseInOut.apply(0.25), 0.125));
        assert!(approx(Easing::EaseInOut.apply(0.75), 0.875));
        for e in [Easing::Linear, Easing::EaseIn, Easing::EaseOut, Easing::EaseInOut] {
            assert!(approx(e.apply(0.0), 0.0));
            assert!(approx(e.apply(1.0), 1.0));
        }
    }

    #[test]
    fn duration_policy_takes_max_cost() {
        let from = AvatarState::default();
        let both = StateUpdate::new().emotion(Emotion::Happy).mode(AvatarMode::Speaking);
        assert_eq!(both.default_duration(&from), Duration::from_millis(500));

        let speaking = StateUpdate::new().speaking(true).mouth(Some("aa".into()));
        assert_eq!(speaking.default_duration(&from), Duration::from_millis(200));

        let mouth = StateUpdate::new().mouth(Some("oh".into()));
        assert_eq!(mouth.default_duration(&from), Duration::from_millis(100));

        let unchanged = StateUpdate::new().mode(AvatarMode::Idle);
        assert_eq!(unchanged.default_duration(&from), Duration::from_millis(300));
        assert_eq!(StateUpdate::new().default_duration(&from), Duration::from_millis(300));
    }

    #[test]
    fn raw_update_rejects_unknown_values() {
        let raw = RawStateUpdate {
            current_state: Some("dancing".into()),
            ..Default::default()
        };
        assert!(matches!(StateUpdate::try_from(raw), Err(LiveError::Validation(_))));

        let raw: RawStateUpdate =
            serde_json::from_str(r#"{"currentState":"Listening","emotion":"happy"}"#).unwrap();
        let update = StateUpdate::try_from(raw).unwrap();
        assert_eq!(update.current, Some(AvatarMode::Listening));
        assert_eq!(update.emotion, Some(Emotion::Happy));
    }

    #[test]
    fn interpolation_switches_at_half() {
        let from = AvatarState::default();
        let target = from.apply(&StateUpdate::new().mode(AvatarMode::Speaking).speaking(true));

        let early = interpolate(&from, &target, 0.49);
        assert_eq!(early.current, AvatarMode::Idle);
        assert!(!early.speaking);
        assert!(early.transitioning);

        let late = interpolate(&from, &target, 0.5);
        assert_eq!(late.current, AvatarMode::Speaking);
        assert!(late.speaking);
    }

    #[test]
    fn step_plan_uses_fifty_ms_increments() {
        let from = AvatarState::default();
        let target = from.apply(&StateUpdate::new().emotion(Emotion::Sad));
        let steps: Vec<_> =
            plan_steps(&from, &target, Duration::from_millis(500), Easing::Linear, Duration::from_millis(50)).collect();
        assert_eq!(steps.len(), 10);
        assert!(steps.iter().all(|s| s.step_duration == Duration::from_millis(50)));
        assert!(approx(steps.last().unwrap().eased_progress, 1.0));
        assert_eq!(steps[3].state.emotion, Emotion::Neutral);
        assert_eq!(steps[4].state.emotion, Emotion::Sad);

        let short: Vec<_> =
            plan_steps(&from, &target, Duration::from_millis(20), Easing::EaseOut, Duration::from_millis(50)).collect();
        assert_eq!(short.len(), 1);
        assert_eq!(short[0].step_duration, Duration::from_millis(20));
    }

    #[test]
    fn huge_durations_saturate_the_step_count() {
        let from = AvatarState::default();
        let target = from.apply(&StateUpdate::new().emotion(Emotion::Happy));
        let huge = Duration::from_millis(50 * (u64::from(u32::MAX) + 1));
        let mut steps = plan_steps(&from, &target, huge, Easing::Linear, Duration::from_millis(50));
        let first = steps.next().unwrap();
        assert!(first.step_duration >= Duration::from_millis(50));
        assert!(first.eased_progress > 0.0);
        assert_eq!(first.state.emotion, Emotion::Neutral);
    }

    #[test]
    fn priority_ranks() {
        assert!(Priority::Immediate.rank() < Priority::High.rank());
        assert!(Priority::High.rank() < Priority::Normal.rank());
        assert!(Priority::Normal.rank() < Priority::Low.rank());
        assert_eq!(Priority::default(), Priority::Normal);
        assert_eq!(Easing::default(), Easing::EaseOut);
    }
}
