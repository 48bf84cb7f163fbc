/// Core error type for the bot.
///
/// Adapter crates should map their specific errors into this type so the sync
/// loop can tell retryable connection problems apart from everything else.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid user id: {0}")]
    InvalidUserId(String),

    #[error("logging error: {0}")]
    Logging(String),

    /// The homeserver could not be reached (connect, timeout, disconnect).
    #[error("transport error: {0}")]
    Transport(String),

    /// The homeserver answered with a Matrix error body.
    #[error("matrix error {status} {errcode}: {message}")]
    Matrix {
        status: u16,
        errcode: String,
        message: String,
    },

    #[error("external error: {0}")]
    External(String),
}

impl Error {
    /// Whether the failure is a connectivity problem worth reconnecting for.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
