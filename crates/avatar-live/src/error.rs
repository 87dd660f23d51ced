//! Error types for the live interaction loop

use thiserror::Error;

/// Result type alias for live-loop operations
pub type LiveResult<T> = Result<T, LiveError>;

/// Errors that can occur in the live interaction loop
#[derive(Error, Debug)]
pub enum LiveError {
    /// Malformed transition or interruption input. Dropped at validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// An awaited readiness signal exceeded its budget (audio preload).
    #[error("Timed out after {millis}ms: {what}")]
    Timeout { what: String, millis: u64 },

    /// Failure while running a transition step, crossfade or action.
    #[error("Execution error: {0}")]
    Execution(String),

    /// A user-supplied callback or handler failed or panicked.
    #[error("Callback error: {0}")]
    Callback(String),

    /// Work was cancelled by `reset()`, `stop()` or a preempting request.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Speech synthesis error: {0}")]
    Synthesis(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LiveError {
    /// True for errors produced by cancellation rather than a real fault.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, LiveError::Cancelled(_))
    }
}

/// Run a user-supplied callback, converting both `Err` and panics into
/// `LiveError::Callback` so they can never unwind into engine state.
pub(crate) fn guard_callback<F>(what: &str, callback: F) -> LiveResult<()>
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(callback)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(LiveError::Callback(format!("{}: {:#}", what, e))),
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            Err(LiveError::Callback(format!("{} panicked: {}", what, msg)))
        }
    }
}

impl From<config::ConfigError> for LiveError {
    fn from(err: config::ConfigError) -> Self {
        LiveError::Config(err.to_string())
    }
}

impl From<reqwest::Error> for LiveError {
    fn from(err: reqwest::Error) -> Self {
        LiveError::Synthesis(err.to_string())
    }
}
