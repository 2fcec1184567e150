use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("HTTP status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("invalid API URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("API URL cannot be a base URL")]
    UrlNotABase,
    #[error("empty token response")]
    EmptyToken,
    #[error("empty watch folder response")]
    EmptyFolder,
    #[error("POST failed and there is no PUT")]
    PostFailed,
    #[error("unknown media type: {0}")]
    UnknownMediaType(String),
    #[error("token is not a valid header value")]
    InvalidToken,
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("credential attender is gone")]
    AuthChannelClosed,
    #[error("operation cancelled")]
    Cancelled,
}

impl BackendError {
    /// Cancellation is terminal at every layer and is never reported as a
    /// failure by callers.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Builds a [`BackendError::Status`] from a response, reading at most 4096
/// bytes of the body as the error message.
pub(crate) async fn body_to_error(resp: reqwest::Response) -> BackendError {
    let status = resp.status();
    let body = match resp.text().await {
        Ok(mut text) => {
            if text.len() > 4096 {
                let mut end = 4096;
                while !text.is_char_boundary(end) {
                    end -= 1;
                }
                text.truncate(end);
            }
            text
        }
        Err(err) => format!("failed to read error body: {err}"),
    };
    BackendError::Status { status, body }
}
