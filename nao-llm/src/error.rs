use thiserror::Error;

pub type Result<T> = std::result::Result<T, LlmError>;

/// Failures talking to a model provider.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    /// Transport failure before or while reading a response.
    #[error("http error: {0}")]
    Http(String),

    /// The provider answered with a non-success status.
    #[error("{provider} returned status {status}: {body}")]
    Status {
        provider: &'static str,
        status: u16,
        body: String,
    },

    /// An `error` event inside an otherwise healthy stream.
    #[error("{provider} stream error: {message}")]
    Stream {
        provider: &'static str,
        message: String,
    },

    #[error("unexpected response format: {0}")]
    ResponseFormat(String),

    #[error("stream parse error: {0}")]
    StreamParse(String),
}

impl LlmError {
    pub(crate) fn status(provider: &'static str, status: reqwest::StatusCode, body: String) -> Self {
        Self::Status {
            provider,
            status: status.as_u16(),
            body,
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}

impl From<serde_json::Error> for LlmError {
    fn from(e: serde_json::Error) -> Self {
        Self::ResponseFormat(e.to_string())
    }
}
