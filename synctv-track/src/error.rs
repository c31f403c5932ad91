use thiserror::Error;

/// Failure reported by a native collaborator (forwarding link or its factory)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("Rejected by forwarding engine: {0}")]
    Rejected(String),

    #[error("Forwarding link already closed")]
    Closed,
}

#[derive(Error, Debug)]
pub enum TrackError {
    #[error("Failed to create forwarding link: {0}")]
    LinkCreation(#[source] LinkError),

    #[error("Failed to apply mute to forwarding link: {0}")]
    Mute(#[source] LinkError),

    #[error("Failed to bind incoming source: {0}")]
    Bind(#[source] LinkError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Logging error: {0}")]
    Logging(String),
}

pub type Result<T> = std::result::Result<T, TrackError>;
