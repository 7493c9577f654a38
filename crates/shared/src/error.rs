use thiserror::Error;

/// Reasons an inbound channel frame could not be classified.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("frame has no string `type` field")]
    MissingType,
    #[error("unrecognized frame kind `{0}`")]
    UnknownKind(String),
    #[error("malformed `{kind}` frame: {source}")]
    Malformed {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FrameError {
    pub fn kind(&self) -> Option<&str> {
        match self {
            FrameError::UnknownKind(kind) | FrameError::Malformed { kind, .. } => Some(kind),
            FrameError::InvalidJson(_) | FrameError::MissingType => None,
        }
    }
}
