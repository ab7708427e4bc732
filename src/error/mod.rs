use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ArbError {
    /// Network/connectivity issues talking to the exchange
    #[error("Network Error: {0}")]
    NetworkError(String),

    /// WebSocket connection/data issues (collector channels, user data stream)
    #[error("WebSocket Error: {0}")]
    WebSocketError(String),

    /// The exchange answered with an error payload
    #[error("Exchange Error: {0}")]
    ExchangeError(String),

    /// Parsing errors for exchange payloads and wire frames
    #[error("Parse Error: {0}")]
    ParseError(String),

    /// Unexpected command or malformed message on the collector protocol
    #[error("Protocol Error: {0}")]
    ProtocolError(String),

    /// Configuration errors
    #[error("Config Error: {0}")]
    ConfigError(String),

    /// The market model is corrupted; nothing downstream can be trusted
    #[error("Invariant Violation: {0}")]
    InvariantViolation(String),

    /// No trading filters are known for a symbol
    #[error("Missing Filter: {0}")]
    MissingFilter(String),

    /// Order submission errors
    #[error("Execution Error: {0}")]
    ExecutionError(String),

    /// Local I/O (sockets, event log file)
    #[error("IO Error: {0}")]
    IoError(String),

    /// An internal channel was closed while still in use
    #[error("Channel Closed: {0}")]
    ChannelClosed(String),
}

impl From<serde_json::Error> for ArbError {
    fn from(err: serde_json::Error) -> Self {
        ArbError::ParseError(format!("JSON serialization/deserialization error: {}", err))
    }
}

impl From<reqwest::Error> for ArbError {
    fn from(err: reqwest::Error) -> Self {
        ArbError::NetworkError(format!("HTTP client error: {}", err))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ArbError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ArbError::WebSocketError(err.to_string())
    }
}

impl From<std::io::Error> for ArbError {
    fn from(err: std::io::Error) -> Self {
        ArbError::IoError(err.to_string())
    }
}

impl From<std::num::ParseFloatError> for ArbError {
    fn from(err: std::num::ParseFloatError) -> Self {
        ArbError::ParseError(format!("invalid float: {}", err))
    }
}

impl From<std::num::ParseIntError> for ArbError {
    fn from(err: std::num::ParseIntError) -> Self {
        ArbError::ParseError(format!("invalid integer: {}", err))
    }
}

impl From<url::ParseError> for ArbError {
    fn from(err: url::ParseError) -> Self {
        ArbError::ConfigError(format!("invalid url: {}", err))
    }
}

impl ArbError {
    /// Determines if the next cycle can be expected to succeed where this one failed
    pub fn is_recoverable(&self) -> bool {
        match self {
            ArbError::NetworkError(_) => true,
            ArbError::WebSocketError(_) => true,
            ArbError::ExchangeError(msg) => {
                // Rejections for bad parameters will not go away by themselves
                !msg.contains("-1013") && !msg.contains("-1100") && !msg.contains("-2010")
            }
            ArbError::ParseError(_) => false,
            ArbError::ProtocolError(_) => true, // the offending frame is dropped
            ArbError::ConfigError(_) => false,
            ArbError::InvariantViolation(_) => false,
            ArbError::MissingFilter(_) => true, // may appear on next exchange info refresh
            ArbError::ExecutionError(_) => false,
            ArbError::IoError(_) => true,
            ArbError::ChannelClosed(_) => false,
        }
    }

    /// Categorizes error for logging and monitoring
    pub fn categorize(&self) -> ErrorCategory {
        match self {
            ArbError::NetworkError(_) | ArbError::ExchangeError(_) => ErrorCategory::Network,
            ArbError::WebSocketError(_) | ArbError::ProtocolError(_) => ErrorCategory::DataFeed,
            ArbError::ParseError(_) => ErrorCategory::Data,
            ArbError::ConfigError(_) => ErrorCategory::Configuration,
            ArbError::InvariantViolation(_) => ErrorCategory::Critical,
            ArbError::MissingFilter(_) => ErrorCategory::Data,
            ArbError::ExecutionError(_) => ErrorCategory::Trading,
            ArbError::IoError(_) | ArbError::ChannelClosed(_) => ErrorCategory::Infrastructure,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.categorize() == ErrorCategory::Critical
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ErrorCategory {
    Network,
    DataFeed,
    Trading,
    Data,
    Configuration,
    Infrastructure,
    Critical,
}

pub type Result<T> = std::result::Result<T, ArbError>;
