use reqwest::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GateError {
    #[error("request to gate.io failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("gate.io responded {status} ({label}): {message}")]
    Status {
        status: StatusCode,
        label: String,
        message: String,
    },

    #[error("failed to decode gate.io response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("failed to encode request parameters: {0}")]
    Encode(#[from] serde_urlencoded::ser::Error),

    #[error("authentication required: {0}")]
    Auth(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl GateError {
    /// Whether repeating the same request can succeed. Client errors such as
    /// `BALANCE_NOT_ENOUGH` or `INVALID_CURRENCY_PAIR` never are.
    pub fn is_retryable(&self) -> bool {
        match self {
            GateError::Transport(err) => {
                err.is_timeout() || err.is_connect() || err.is_request() || err.is_body()
            }
            GateError::Status { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            GateError::Decode(_)
            | GateError::Encode(_)
            | GateError::Auth(_)
            | GateError::InvalidInput(_) => false,
        }
    }

    pub fn label(&self) -> Option<&str> {
        match self {
            GateError::Status { label, .. } => Some(label.as_str()),
            _ => None,
        }
    }
}

pub type GateResult<T> = Result<T, GateError>;
