//! Streaming sentence segmentation for incremental speech synthesis.
//!
//! LLM text arrives in arbitrary fragments. [`SentenceSegmenter`] buffers
//! them, cuts on terminal punctuation followed by whitespace (or the end of
//! the buffer) and emits each sentence once, in stream order.

use crate::config::SegmenterConfig;
use crate::error::guard_callback;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use tracing::{debug, error, trace};

/// Called with each emitted sentence (trimmed).
pub type SentenceCallback = Box<dyn FnMut(&str) -> anyhow::Result<()> + Send>;
/// Called once when the stream is finalized.
pub type CompleteCallback = Box<dyn FnMut() -> anyhow::Result<()> + Send>;

/// Terminal punctuation run followed by whitespace or the end of the buffer.
static BOUNDARY: Lazy<Regex> = Lazy::new(|| Regex::new(r"[.!?]+(?:\s+|$)").unwrap());

/// Normalized form used for duplicate detection: lower-cased, whitespace collapsed, trimmed.
pub fn signature(sentence: &str) -> String {
    sentence
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub struct SentenceSegmenter {
    buffer: String,
    seen: HashSet<String>,
    min_chars: usize,
    finalized: bool,
    on_sentence: SentenceCallback,
    on_complete: CompleteCallback,
}

impl SentenceSegmenter {
    pub fn new(config: &SegmenterConfig, on_sentence: SentenceCallback, on_complete: CompleteCallback) -> Self {
        Self {
            buffer: String::new(),
            seen: HashSet::new(),
            min_chars: config.min_sentence_chars,
            finalized: false,
            on_sentence,
            on_complete,
        }
    }

    /// Segmenter without callbacks; use the returned sentences instead.
    pub fn collecting(config: &SegmenterConfig) -> Self {
        Self::new(config, Box::new(|_: &str| Ok(())), Box::new(|| Ok(())))
    }

    /// Append a fragment and emit every sentence it completes.
    pub fn ingest(&mut self, chunk: &str) -> Vec<String> {
        if chunk.is_empty() {
            debug!("Ignoring empty text chunk");
            return Vec::new();
        }
        self.buffer.push_str(chunk);

        let mut cut = 0;
        let mut candidates = Vec::new();
        for m in BOUNDARY.find_iter(&self.buffer) {
            candidates.push(self.buffer[cut..m.end()].to_string());
            cut = m.end();
        }
        self.buffer.drain(..cut);

        candidates
            .into_iter()
            .filter_map(|c| self.emit(&c))
            .collect()
    }

    /// Flush buffered text as a final sentence and signal completion.
    ///
    /// `on_complete` fires once per session; a second call before `reset()`
    /// only flushes.
    pub fn finalize(&mut self) -> Vec<String> {
        let rest = std::mem::take(&mut self.buffer);
        let emitted: Vec<String> = self.emit(&rest).into_iter().collect();
        if !self.finalized {
            self.finalized = true;
            if let Err(e) = guard_callback("segmenter completion callback", || (self.on_complete)()) {
                error!(error = %e, "Completion callback failed");
            }
        }
        emitted
    }

    /// Clear the buffer and the set of emitted sentences.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.seen.clear();
        self.finalized = false;
    }

    /// Text waiting for a boundary.
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    pub fn emitted_count(&self) -> usize {
        self.seen.len()
    }

    fn emit(&mut self, candidate: &str) -> Option<String> {
        let sentence = candidate.trim();
        if sentence.chars().count() < self.min_chars {
            if !sentence.is_empty() {
                trace!(sentence, "Dropping short fragment");
            }
            return None;
        }
        if !self.seen.insert(signature(sentence)) {
            debug!(sentence, "Dropping duplicate sentence");
            return None;
        }
        if let Err(e) = guard_callback("sentence callback", || (self.on_sentence)(sentence)) {
            error!(error = %e, "Sentence callback failed");
        }
        Some(sentence.to_string())
    }
}
