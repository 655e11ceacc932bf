use thiserror::Error;

/// Tracking store errors.
#[derive(Debug, Error)]
pub enum TrackingError {
    #[error("tracking store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed tracking metadata: {0}")]
    Metadata(#[from] serde_yaml::Error),

    #[error("tracking server unreachable: {0}")]
    Http(#[from] reqwest::Error),

    #[error("malformed tracking server response: {0}")]
    Decode(String),

    #[error("tracking server returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid key {0:?}")]
    InvalidKey(String),

    #[error("cannot upload artifacts to {0}")]
    UnsupportedArtifactUri(String),
}
