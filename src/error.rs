use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// No response was received from the game server.
    #[error("network error: {0}")]
    Network(String),

    /// The server answered but rejected the request.
    #[error("server rejected request ({status}): {detail}")]
    Server { status: u16, detail: String },

    /// Malformed import payload; raised before anything is sent.
    #[error("{0}")]
    Validation(String),

    #[error("local storage error: {0}")]
    LocalStorage(String),

    #[error("could not decode server response: {0}")]
    Decode(String),
}

impl SyncError {
    pub fn server(status: u16, detail: impl Into<String>) -> Self {
        Self::Server {
            status,
            detail: detail.into(),
        }
    }

    /// Text suitable for a transient user-facing notification.
    pub fn user_message(&self) -> String {
        match self {
            SyncError::Network(_) => "Connection lost, try again".to_string(),
            SyncError::Server { detail, .. } => detail.clone(),
            SyncError::Validation(detail) => detail.clone(),
            SyncError::LocalStorage(detail) => detail.clone(),
            SyncError::Decode(_) => "Unexpected response from server".to_string(),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Decode(err.to_string())
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
