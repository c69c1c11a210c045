use thiserror::Error;
use tokio_tungstenite::tungstenite;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("network error: {0}")]
    Transport(String),
    #[error("not authorized: {0}")]
    Unauthorized(String),
    #[error("server returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("malformed payload: {0}")]
    Decode(String),
    #[error("disconnected after {attempts} reconnect attempts")]
    Disconnected { attempts: u32 },
    #[error("not connected to chat server")]
    NotConnected,
    #[error("not permitted: {0}")]
    Forbidden(&'static str),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ClientError {
    /// Only transport failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Transport(_))
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ClientError::Unauthorized(_))
    }

    /// Maps a non-success HTTP status to an error, `None` for success codes.
    pub fn from_status(status: u16, message: impl Into<String>) -> Option<Self> {
        match status {
            200..=299 => None,
            401 | 403 => Some(ClientError::Unauthorized(message.into())),
            _ => Some(ClientError::Api {
                status,
                message: message.into(),
            }),
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Decode(err.to_string())
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return ClientError::Decode(err.to_string());
        }
        if let Some(status) = err.status() {
            if let Some(mapped) = ClientError::from_status(status.as_u16(), err.to_string()) {
                return mapped;
            }
        }
        ClientError::Transport(err.to_string())
    }
}

impl From<tungstenite::Error> for ClientError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Http(response) => {
                let status = response.status().as_u16();
                ClientError::from_status(status, "handshake rejected")
                    .unwrap_or_else(|| {
                        ClientError::Transport(format!("unexpected handshake status {}", status))
                    })
            }
            tungstenite::Error::Url(e) => ClientError::Config(e.to_string()),
            other => ClientError::Transport(other.to_string()),
        }
    }
}
