/// Result alias that carries the custom [`WtopError`] type.
pub type Result<T> = std::result::Result<T, WtopError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum WtopError {
    /// The process-table query failed with a status other than
    /// "buffer too small". Fatal to one sampling cycle only.
    #[error("process table query failed with status 0x{status:08X}")]
    KernelQuery { status: u32 },
    /// The process table outgrew the configured buffer ceiling.
    #[error("process table needs {requested} bytes, limit is {limit}")]
    SnapshotTooLarge { requested: usize, limit: usize },
    /// The kernel buffer does not decode as a chain of process records.
    #[error("malformed process snapshot: {0}")]
    MalformedSnapshot(String),
    /// Audio enumeration or stream setup failure.
    #[error("audio: {0}")]
    Audio(String),
    /// Invalid configuration value.
    #[error("config: {0}")]
    Config(String),
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
}

impl WtopError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    /// Creates a decoder error.
    pub fn malformed<T: Into<String>>(msg: T) -> Self {
        Self::MalformedSnapshot(msg.into())
    }
}

impl From<&str> for WtopError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for WtopError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
