//! Speech synthesis backends: sentence + language in, opaque audio out.

use crate::config::SpeechConfig;
use crate::error::{LiveError, LiveResult};
use crate::playback::AudioBlob;
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Turns one sentence into playable audio. Implement for OpenAI/ElevenLabs or local TTS.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, language: &str) -> LiveResult<AudioBlob>;
}

/// Silent PCM sized to the text, so placeholder playback takes realistic time.
#[derive(Debug, Clone)]
pub struct PlaceholderSynthesizer {
    /// Bytes of audio per character of text.
    pub bytes_per_char: usize,
}

impl Default for PlaceholderSynthesizer {
    fn default() -> Self {
        // ~60ms per character at 24 kHz 16-bit mono.
        Self { bytes_per_char: 2880 }
    }
}

#[async_trait]
impl SpeechSynthesizer for PlaceholderSynthesizer {
    async fn synthesize(&self, text: &str, _language: &str) -> LiveResult<AudioBlob> {
        let text = text.trim();
        Ok(AudioBlob::new(vec![0u8; text.chars().count() * self.bytes_per_char]).with_label(text))
    }
}

/// OpenAI-compatible `/audio/speech` client (OpenAI, OpenRouter, local gateways).
#[derive(Debug, Clone)]
pub struct HttpSpeechSynthesizer {
    base_url: String,
    api_key: String,
    model: String,
    voice: String,
    client: reqwest::Client,
}

impl HttpSpeechSynthesizer {
    pub fn from_config(config: &SpeechConfig) -> LiveResult<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| LiveError::Config("speech synthesis requires speech.api_key".to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            voice: config.voice.clone(),
            client,
        })
    }

    /// Build from `TTS_API_URL`, `TTS_API_KEY` (or `OPENAI_API_KEY`), `TTS_MODEL` and `TTS_VOICE`.
    pub fn from_env() -> LiveResult<Self> {
        let defaults = SpeechConfig::default();
        let config = SpeechConfig {
            base_url: std::env::var("TTS_API_URL").unwrap_or(defaults.base_url),
            api_key: std::env::var("TTS_API_KEY")
                .or_else(|_| std::env::var("OPENAI_API_KEY"))
                .ok(),
            model: std::env::var("TTS_MODEL").unwrap_or(defaults.model),
            voice: std::env::var("TTS_VOICE").unwrap_or(defaults.voice),
            timeout_secs: defaults.timeout_secs,
        };
        Self::from_config(&config)
    }

    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = voice.into();
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/audio/speech", self.base_url)
    }
}

#[async_trait]
impl SpeechSynthesizer for HttpSpeechSynthesizer {
    async fn synthesize(&self, text: &str, language: &str) -> LiveResult<AudioBlob> {
        let text = text.trim();
        if text.is_empty() {
            return Err(LiveError::Synthesis("nothing to synthesize".to_string()));
        }
        debug!(chars = text.len(), language, voice = %self.voice, "Requesting speech");
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
            "voice": self.voice,
        });
        let res = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(LiveError::Synthesis(format!("TTS API error {}: {}", status, body)));
        }
        let bytes = res.bytes().await?;
        Ok(AudioBlob::new(bytes.to_vec()).with_label(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn placeholder_sizes_audio_by_text() {
        let tts = PlaceholderSynthesizer { bytes_per_char: 10 };
        let blob = tts.synthesize("  Hello. ", "en").await.unwrap();
        assert_eq!(blob.len(), 60);
        assert_eq!(blob.label, "Hello.");
    }

    #[test]
    fn http_requires_api_key() {
        let err = HttpSpeechSynthesizer::from_config(&SpeechConfig::default()).unwrap_err();
        assert!(matches!(err, LiveError::Config(_)));

        let config = SpeechConfig {
            base_url: "http://localhost:8880/v1/".to_string(),
            api_key: Some("sk-test".to_string()),
            ..Default::default()
        };
        let tts = HttpSpeechSynthesizer::from_config(&config).unwrap();
        assert_eq!(tts.endpoint(), "http://localhost:8880/v1/audio/speech");
    }
}
