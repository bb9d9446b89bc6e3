//! Error types for the voice gateway.

/// Classification used by the propagation policy: it decides whether an
/// error is retried locally, surfaced as a spoken apology, or swallowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retryable with backoff (STT reconnect, LLM transport error before
    /// the first chunk, TTS HTTP failure).
    TransientNetwork,
    /// Retries exhausted; surfaced to the user as a brief spoken apology.
    TerminalNetwork,
    /// Empty or filter-rejected input; short-circuits the turn silently.
    BadInput,
    /// Malformed message from an external service; terminal for the turn.
    Protocol,
    /// Capacity could not be acquired; the turn is shed.
    Resource,
    /// A caught panic or invariant violation; terminal for the session.
    Programmer,
}

/// Top-level error type for the gateway.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Audio decode error (Opus frame or container).
    #[error("codec error: {0}")]
    Codec(String),

    /// STT stream error (transport or engine).
    #[error("STT error: {0}")]
    Stt(String),

    /// STT connection could not be established.
    #[error("STT connect failed: {0}")]
    SttConnect(String),

    /// LLM provider error.
    #[error("LLM error: {0}")]
    Llm(String),

    /// TTS synthesis error.
    #[error("TTS error: {0}")]
    Tts(String),

    /// Conversation store error.
    #[error("store error: {0}")]
    Store(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Malformed message from an external service.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A deadline elapsed before the operation completed.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Empty or filtered input; the turn is dropped without user-visible error.
    #[error("empty input: {0}")]
    EmptyInput(String),

    /// STT/TTS capacity could not be acquired.
    #[error("capacity exhausted: {0}")]
    Capacity(String),

    /// The operation was cancelled (disconnect or interruption).
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Session routing error (unknown session, closed channel).
    #[error("session error: {0}")]
    Session(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A panic caught at the supervisor boundary.
    #[error("session panicked: {0}")]
    Panicked(String),
}

impl GatewayError {
    /// The propagation class of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Codec(_) | Self::Protocol(_) => ErrorClass::Protocol,
            Self::SttConnect(_) | Self::Timeout(_) | Self::Io(_) => ErrorClass::TransientNetwork,
            Self::Stt(_) | Self::Llm(_) | Self::Tts(_) | Self::Store(_) => {
                ErrorClass::TerminalNetwork
            }
            Self::EmptyInput(_) | Self::Cancelled(_) => ErrorClass::BadInput,
            Self::Capacity(_) => ErrorClass::Resource,
            Self::Config(_) | Self::Session(_) | Self::Panicked(_) => ErrorClass::Programmer,
        }
    }

    /// Whether the error is worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::TransientNetwork
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, GatewayError>;
