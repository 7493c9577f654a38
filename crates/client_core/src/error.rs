use thiserror::Error;

/// Failures surfaced by the chat core. None of them is fatal to the process.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Handshake or connection failure on the live channel.
    #[error("transport error: {0}")]
    Transport(String),
    /// Outbound frame attempted while the channel is not open.
    #[error("send rejected: channel is not open")]
    SendRejected,
    #[error("message content must not be empty")]
    EmptyMessage,
    #[error("no conversation is open")]
    NoConversation,
    /// REST collaborator failure (history page or conversation close).
    #[error("conversation api request failed: {0}")]
    History(String),
    #[error("server_url must start with http:// or https://, got `{0}`")]
    InvalidServerUrl(String),
}

impl ChatError {
    pub(crate) fn history(err: anyhow::Error) -> Self {
        ChatError::History(format!("{err:#}"))
    }
}
