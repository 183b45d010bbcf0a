use thiserror::Error;

/// Errors that can occur when working with Jebao pumps
#[derive(Error, Debug)]
pub enum JebaoError {
    /// IO error on the discovery or control socket
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No matching device answered discovery
    #[error("Jebao device not found")]
    DeviceNotFound,

    /// Device connection failed
    #[error("Failed to connect to device: {0}")]
    ConnectionFailed(String),

    /// Command issued on a handle that is not connected
    #[error("Device not connected")]
    NotConnected,

    /// Device closed the connection
    #[error("Device disconnected")]
    Disconnected,

    /// Passcode or login rejected
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Command timeout
    #[error("Command timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// Invalid command parameters
    #[error("Invalid command parameters: {0}")]
    InvalidParameters(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Message parsing failed
    #[error("Failed to parse message: {0}")]
    ParseError(String),
}

/// Result type for Jebao operations
pub type Result<T> = std::result::Result<T, JebaoError>;

impl JebaoError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::ConnectionFailed(_)
                | Self::NotConnected
                | Self::Disconnected
                | Self::DeviceNotFound
        )
    }

    /// Check if this error is recoverable by retrying the same command
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Protocol(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let connection_error = JebaoError::ConnectionFailed("refused".to_string());
        assert!(connection_error.is_connection_error());
        assert!(!connection_error.is_recoverable());

        let timeout_error = JebaoError::Timeout { timeout_ms: 3000 };
        assert!(!timeout_error.is_connection_error());
        assert!(timeout_error.is_recoverable());

        let invalid = JebaoError::InvalidParameters("speed".to_string());
        assert!(!invalid.is_connection_error());
        assert!(!invalid.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let error = JebaoError::InvalidParameters("speed 120 out of range".to_string());
        let error_string = format!("{error}");
        assert!(error_string.contains("Invalid command parameters"));
        assert!(error_string.contains("speed 120 out of range"));

        let timeout = JebaoError::Timeout { timeout_ms: 250 };
        assert_eq!(timeout.to_string(), "Command timed out after 250ms");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let error: JebaoError = io.into();
        assert!(error.is_connection_error());
    }
}
