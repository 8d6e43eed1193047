use thiserror::Error;

/// Failure to locate or open a tmux session
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttachError {
    #[error("no session named '{0}'")]
    NotFound(String),

    #[error("session name '{name}' is ambiguous: matches {}", candidates.join(", "))]
    Ambiguous {
        name: String,
        candidates: Vec<String>,
    },

    #[error("timed out attaching to '{0}'")]
    Timeout(String),

    /// The multiplexer itself could not be driven (missing binary, I/O failure)
    #[error("session transport unavailable: {0}")]
    Unavailable(String),
}

/// Failure to write a command into an open channel
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteError {
    /// The session or the process behind it is gone
    #[error("channel closed")]
    ChannelClosed,

    /// The write failed but the channel is still alive; worth one retry
    #[error("transient write failure: {0}")]
    Transient(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("not attached to a session")]
    NotAttached,

    #[error("command rejected: {0}")]
    Rejected(#[source] WriteError),
}

impl CommandError {
    /// Whether the operator has to reattach before submitting again
    pub fn requires_reattach(&self) -> bool {
        match self {
            CommandError::NotAttached => true,
            CommandError::Rejected(WriteError::ChannelClosed) => true,
            CommandError::Rejected(WriteError::Transient(_)) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    #[error("process {0} is gone")]
    ProcessGone(u32),

    #[error("permission denied reading process {0}")]
    PermissionDenied(u32),

    #[error("process metrics are not supported on this platform")]
    Unsupported,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("session name must not be empty")]
    EmptySessionName,

    #[error("rule {index} has an invalid pattern: {source}")]
    InvalidPattern {
        index: usize,
        #[source]
        source: regex::Error,
    },

    #[error("rule {index} ({kind}) must be a regex with a capture group for the player name")]
    MissingNameCapture { index: usize, kind: String },

    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}
