use reqwest::StatusCode;

/// Errors surfaced by the bridge. Stream-internal failures never reach the
/// caller; they feed the reconnect loop instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("authentication rejected by {url}")]
    Auth { url: String },

    #[error("HTTP status {status} from {url}")]
    Http { status: StatusCode, url: String },

    #[error("decode failure: {0}")]
    Decode(String),

    #[error("missing configuration: {0}")]
    Config(String),

    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for decode failures built from another error.
    pub(crate) fn decode(context: &str, err: impl std::fmt::Display) -> Self {
        Error::Decode(format!("{context}: {err}"))
    }
}
