//! # Error Types
//!
//! Custom error types for the controller engine using `thiserror`.

use thiserror::Error;

/// Main error type for the controller engine
#[derive(Debug, Error)]
pub enum TswControllerError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON document (profile, calibration or mapping)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Profile failed validation
    #[error("Invalid profile: {0}")]
    Profile(String),

    /// Profile id not registered
    #[error("Profile not found: {0}")]
    ProfileNotFound(String),

    /// Calibration or mapping failed validation
    #[error("Invalid calibration: {0}")]
    Calibration(String),

    /// Input device errors
    #[error("Device error: {0}")]
    Device(String),

    /// No usable input device was found
    #[error("No joystick device found")]
    DeviceNotFound,

    /// Virtual keyboard errors
    #[error("Keyboard error: {0}")]
    Keyboard(String),

    /// Key name not present in the key table
    #[error("Unknown key: {0}")]
    UnknownKey(String),

    /// A bounded queue stayed full past its enqueue timeout
    #[error("Queue is full, enqueue timed out")]
    QueueTimeout,

    /// The consumer of a queue has shut down
    #[error("Queue is closed")]
    QueueClosed,

    /// Transport errors
    #[error("Transport error: {0}")]
    Transport(String),

    /// Remote API errors
    #[error("Remote API error: {0}")]
    RemoteApi(String),
}

/// Result type alias for the controller engine
pub type Result<T> = std::result::Result<T, TswControllerError>;
