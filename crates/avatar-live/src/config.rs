//! Live-loop configuration loaded from TOML and environment.
//!
//! | Env | Default | Description |
//! |-----|---------|-------------|
//! | LIVE_CONFIG | config/live | Path (without extension) of the TOML config file. |
//! | LIVE__INTERRUPTION__MIN_CONFIDENCE | 0.3 | Minimum VAD confidence for an interruption. |
//! | LIVE__INTERRUPTION__COOLDOWN_MS | 1000 | Quiet period after an accepted interruption. |
//! | LIVE__AUDIO__CROSSFADE_MS | 50 | Crossfade length between segments (clamped to 0..=1000). |
//! | LIVE__SPEECH__API_KEY | unset | Bearer key for the HTTP speech synthesizer. |

use crate::error::LiveResult;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Upper bound for the crossfade length.
pub const MAX_CROSSFADE_MS: u64 = 1000;

/// Avatar transition engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AvatarConfig {
    /// Length of one interpolation step (default 50ms).
    pub step_ms: u64,
    /// State snapshots kept for diagnostics (default 10).
    pub history_limit: usize,
}

impl Default for AvatarConfig {
    fn default() -> Self {
        Self {
            step_ms: 50,
            history_limit: 10,
        }
    }
}

/// Interruption pipeline settings. Mutable at runtime via `update_config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterruptionConfig {
    pub min_confidence: f32,
    pub cooldown_ms: u64,
    pub max_queue_size: usize,
    pub history_limit: usize,
}

impl Default for InterruptionConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.3,
            cooldown_ms: 1000,
            max_queue_size: 5,
            history_limit: 20,
        }
    }
}

impl InterruptionConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Partial update merged into a live [`InterruptionConfig`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterruptionConfigUpdate {
    #[serde(default)]
    pub min_confidence: Option<f32>,
    #[serde(default)]
    pub cooldown_ms: Option<u64>,
    #[serde(default)]
    pub max_queue_size: Option<usize>,
}

impl InterruptionConfig {
    /// Merge `update` into this config; unset fields keep their value.
    pub fn merge(&mut self, update: &InterruptionConfigUpdate) {
        if let Some(c) = update.min_confidence {
            self.min_confidence = c.clamp(0.0, 1.0);
        }
        if let Some(ms) = update.cooldown_ms {
            self.cooldown_ms = ms;
        }
        if let Some(n) = update.max_queue_size {
            self.max_queue_size = n.max(1);
        }
    }
}

/// Crossfade manager settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub crossfade_ms: u64,
    pub crossfade_steps: u32,
    /// Budget for a segment's ready-to-play signal (default 5s).
    pub preload_timeout_ms: u64,
    /// How often the queue runner checks the playing segment's remaining time.
    pub poll_ms: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            crossfade_ms: 50,
            crossfade_steps: 10,
            preload_timeout_ms: 5000,
            poll_ms: 10,
        }
    }
}

impl AudioConfig {
    pub fn crossfade(&self) -> Duration {
        Duration::from_millis(self.crossfade_ms.min(MAX_CROSSFADE_MS))
    }

    pub fn preload_timeout(&self) -> Duration {
        Duration::from_millis(self.preload_timeout_ms)
    }
}

/// Sentence segmenter settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmenterConfig {
    /// Minimum trimmed length (in chars) for a sentence to be emitted.
    pub min_sentence_chars: usize,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            min_sentence_chars: 4,
        }
    }
}

/// HTTP speech synthesizer settings (OpenAI-compatible `/audio/speech`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    /// Base URL without trailing slash.
    pub base_url: String,
    pub api_key: Option<String>,
    /// tts-1 (fast) or tts-1-hd.
    pub model: String,
    pub voice: String,
    pub timeout_secs: u64,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "tts-1".to_string(),
            voice: "nova".to_string(),
            timeout_secs: 60,
        }
    }
}

/// Top-level configuration for a [`crate::LiveLoop`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    pub avatar: AvatarConfig,
    pub interruption: InterruptionConfig,
    pub audio: AudioConfig,
    pub segmenter: SegmenterConfig,
    pub speech: SpeechConfig,
}

impl LiveConfig {
    /// Load config from file and environment. Precedence: env `LIVE__*` > `$LIVE_CONFIG` (or `config/live`) > defaults.
    pub fn load() -> LiveResult<Self> {
        let config_path = std::env::var("LIVE_CONFIG").unwrap_or_else(|_| "config/live".to_string());
        let builder = config::Config::builder().add_source(config::Config::try_from(&Self::default())?);

        let toml_path = Path::new(&config_path).with_extension("toml");
        let builder = if toml_path.exists() {
            builder.add_source(config::File::from(toml_path))
        } else {
            builder
        };

        let built = builder
            .add_source(
                config::Environment::with_prefix("LIVE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = built.try_deserialize()?;
        Ok(config.validated())
    }

    /// Parse a TOML document layered over the defaults.
    pub fn from_toml_str(toml: &str) -> LiveResult<Self> {
        let built = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?)
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?;
        let config: Self = built.try_deserialize()?;
        Ok(config.validated())
    }

    /// Clamp values into their supported ranges.
    pub fn validated(mut self) -> Self {
        self.audio.crossfade_ms = self.audio.crossfade_ms.min(MAX_CROSSFADE_MS);
        self.audio.crossfade_steps = self.audio.crossfade_steps.max(1);
        self.audio.poll_ms = self.audio.poll_ms.max(1);
        self.avatar.step_ms = self.avatar.step_ms.max(1);
        self.avatar.history_limit = self.avatar.history_limit.max(1);
        self.interruption.min_confidence = self.interruption.min_confidence.clamp(0.0, 1.0);
        self.interruption.max_queue_size = self.interruption.max_queue_size.max(1);
        self.interruption.history_limit = self.interruption.history_limit.max(1);
        self
    }
}
