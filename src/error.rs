//! Error types for transkribo.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TranskriboError {
    // Configuration errors (exit code 2)
    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Missing required configuration key {key} ({hint})")]
    ConfigMissingKey { key: String, hint: String },

    #[error("Configuration file not found at {path}")]
    ConfigFileNotFound { path: String },

    // Audio capture errors
    #[error("Audio device not found: {device}")]
    AudioDeviceNotFound { device: String },

    #[error("Audio capture failed: {message}")]
    AudioCapture { message: String },

    // Recognizer errors
    #[error("Recognizer model not found at {path}")]
    ModelNotFound { path: String },

    #[error("Recognizer backend error: {message}")]
    Backend { message: String },

    /// Unrecoverable backend failure (exit code 3). Carries an actionable
    /// message naming the failing parameter.
    #[error("Fatal backend error: {message}")]
    BackendFatal { message: String },

    // Web caption board
    #[error("Caption board port {port} is already in use: {message}")]
    PortInUse { port: u16, message: String },

    #[error("Caption board server error: {message}")]
    WebServer { message: String },

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Generic error for cases not covered above
    #[error("{0}")]
    Other(String),
}

impl TranskriboError {
    /// Whether this error should terminate the process with the
    /// configuration exit code rather than the backend one.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            TranskriboError::ConfigInvalidValue { .. }
                | TranskriboError::ConfigMissingKey { .. }
                | TranskriboError::ConfigFileNotFound { .. }
                | TranskriboError::ModelNotFound { .. }
        )
    }
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, TranskriboError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_invalid_value_display() {
        let error = TranskriboError::ConfigInvalidValue {
            key: "AUDIO_SAMPLE_RATE".to_string(),
            message: "expected an integer".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Invalid configuration value for AUDIO_SAMPLE_RATE: expected an integer"
        );
    }

    #[test]
    fn test_missing_key_display_names_key_and_hint() {
        let error = TranskriboError::ConfigMissingKey {
            key: "CLOUD_API_KEY".to_string(),
            hint: "required by the cloud backend".to_string(),
        };
        let rendered = error.to_string();
        assert!(rendered.contains("CLOUD_API_KEY"));
        assert!(rendered.contains("required by the cloud backend"));
    }

    #[test]
    fn test_port_in_use_display() {
        let error = TranskriboError::PortInUse {
            port: 8765,
            message: "Address already in use".to_string(),
        };
        assert!(error.to_string().contains("8765"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let error: TranskriboError = io_error.into();
        assert!(matches!(error, TranskriboError::Io(_)));
    }

    #[test]
    fn test_is_config_error_classification() {
        let config = TranskriboError::ModelNotFound {
            path: "/models/eo".to_string(),
        };
        assert!(config.is_config_error());

        let fatal = TranskriboError::BackendFatal {
            message: "authentication rejected".to_string(),
        };
        assert!(!fatal.is_config_error());
    }
}
