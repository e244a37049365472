use std::os::unix::io::RawFd;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SMTP protocol error: {0}")]
    SmtpProtocol(String),

    /// Upstream answered with a reply code the dialogue did not expect
    #[error("Unexpected reply during {stage}: expected {expected}, got {reply:?}")]
    UnexpectedReply {
        stage: &'static str,
        expected: &'static str,
        reply: String,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    /// Spool file without usable envelope lines
    #[error("Envelope error: {0}")]
    Envelope(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Descriptor {0} is already registered")]
    AlreadyRegistered(RawFd),

    #[error("Descriptor {0} is not registered")]
    NotRegistered(RawFd),

    #[error("Buffer full")]
    BufferFull,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RelayError {
    pub fn invalid_config(field: &str, reason: impl Into<String>) -> Self {
        RelayError::InvalidConfig {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    /// Permanent errors are never retried by the relay pipeline
    pub fn is_permanent(&self) -> bool {
        matches!(self, RelayError::Envelope(_))
    }
}

impl From<config::ConfigError> for RelayError {
    fn from(err: config::ConfigError) -> Self {
        RelayError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for RelayError {
    fn from(err: toml::ser::Error) -> Self {
        RelayError::Config(err.to_string())
    }
}

impl From<rustls::Error> for RelayError {
    fn from(err: rustls::Error) -> Self {
        RelayError::Tls(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
