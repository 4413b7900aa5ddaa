//! Error types for the Lumi gateway bridge

use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Comprehensive error types for gateway operations
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Control channel errors (handshake or command failure)
    #[error("Control channel error: {0}")]
    Control(String),

    /// Remote shell session errors
    #[error("Shell session error: {0}")]
    Shell(String),

    /// Message bus errors (connect failure or disconnect)
    #[error("Bus error: {0}")]
    Bus(String),

    /// Malformed or unexpected wire message shape
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Outbound write referenced a property with no wire mapping
    #[error("Unknown parameter: {0}")]
    UnknownParameter(String),

    /// Discovery errors
    #[error("Discovery failed: {0}")]
    Discovery(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON parsing errors
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors
    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),

    /// Timeout errors
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Not found errors (devices, properties, etc.)
    #[error("Not found: {0}")]
    NotFound(String),
}

impl GatewayError {
    /// Create a control channel error
    pub fn control<S: Into<String>>(msg: S) -> Self {
        Self::Control(msg.into())
    }

    /// Create a shell session error
    pub fn shell<S: Into<String>>(msg: S) -> Self {
        Self::Shell(msg.into())
    }

    /// Create a bus error
    pub fn bus<S: Into<String>>(msg: S) -> Self {
        Self::Bus(msg.into())
    }

    /// Create a protocol violation error
    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create an unknown parameter error
    pub fn unknown_parameter<S: Into<String>>(msg: S) -> Self {
        Self::UnknownParameter(msg.into())
    }

    /// Create a discovery error
    pub fn discovery<S: Into<String>>(msg: S) -> Self {
        Self::Discovery(msg.into())
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a not found error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Check if error is recoverable via the outer reconciliation loop
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::Control(_)
                | GatewayError::Shell(_)
                | GatewayError::Bus(_)
                | GatewayError::Discovery(_)
                | GatewayError::Timeout(_)
                | GatewayError::Io(_)
        )
    }

    /// Check if error indicates a single bad message rather than a channel
    /// failure; such messages are logged and dropped
    pub fn is_message_local(&self) -> bool {
        matches!(self, GatewayError::Protocol(_) | GatewayError::Json(_))
    }
}

impl From<rumqttc::ClientError> for GatewayError {
    fn from(err: rumqttc::ClientError) -> Self {
        GatewayError::Bus(err.to_string())
    }
}

impl From<rumqttc::ConnectionError> for GatewayError {
    fn from(err: rumqttc::ConnectionError) -> Self {
        GatewayError::Bus(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for GatewayError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        GatewayError::Timeout(err.to_string())
    }
}
