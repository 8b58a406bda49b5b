//! Top-level error types for Hearthbot.

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    ImageJob(#[from] ImageJobError),

    #[error("discord error: {0}")]
    Discord(#[from] serenity::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading and validation errors.
///
/// Also covers malformed time and operating-hours strings entered during the
/// interactive setup dialog.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required config key: {0}")]
    MissingKey(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Chat-completion dispatch errors.
///
/// All variants are non-fatal: callers convert them into a user-visible
/// "could not generate a response" message and carry on.
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("could not reach the chat endpoint: {0}")]
    Network(String),

    #[error("chat endpoint returned status {status}")]
    Protocol { status: u16 },

    #[error("chat endpoint returned an empty response")]
    EmptyResponse,

    #[error("could not parse chat endpoint response: {0}")]
    Parse(String),
}

/// Image-generation job errors.
#[derive(Debug, thiserror::Error)]
pub enum ImageJobError {
    #[error("image queue rejected the job: {0}")]
    QueueRejected(String),

    #[error("image generation timed out")]
    JobTimedOut,

    #[error("notification channel dropped before the job finished")]
    ConnectionLost,

    #[error("job completed but produced no artifacts")]
    NoArtifactsProduced,

    #[error("could not reach the image service: {0}")]
    Network(String),

    #[error("image service returned status {status}")]
    Protocol { status: u16 },

    #[error("could not parse image service response: {0}")]
    Parse(String),

    #[error("could not decode generated artifact: {0}")]
    Decode(String),
}
