//! Error types for treeway
//!
//! Provides structured error handling with:
//! - Numeric error codes for machine parsing
//! - User-friendly messages with suggestions
//! - Exit codes for the CLI
//!
//! Per-operation transport failures never surface here: they reach the
//! submitter's callback as `ok = false`. This type covers setup, config and
//! submission-time failures.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::topology::Rank;

/// Result type alias for treeway operations
pub type Result<T> = std::result::Result<T, Error>;

/// Numeric error codes for machine parsing and documentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    // Configuration errors (1xx)
    ConfigNotFound = 100,
    ConfigParseError = 101,
    ConfigValidation = 102,

    // IO errors (2xx)
    IoRead = 200,
    IoWrite = 201,
    IoPermission = 202,
    IoNotFound = 203,

    // Transport errors (3xx)
    TransportUnavailable = 300,
    TransportBind = 301,
    PeerUnreachable = 302,
    InvalidRank = 303,

    // Wire errors (4xx)
    FrameTooLarge = 400,
    HandshakeFailed = 401,

    // Waypoint errors (5xx)
    WaypointShutdown = 500,

    // Internal errors (9xx)
    InternalError = 900,
}

impl ErrorCode {
    /// Get the string code (e.g., "E100")
    pub fn as_str(&self) -> String {
        format!("E{}", *self as u16)
    }

    /// Get the exit code for CLI (maps to 1-125 range)
    pub fn exit_code(&self) -> i32 {
        match *self as u16 {
            100..=199 => 10,
            200..=299 => 20,
            300..=399 => 30,
            400..=499 => 40,
            500..=599 => 50,
            900..=999 => 90,
            _ => 1,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Main error type
#[derive(Error, Debug)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    /// Configuration parse error
    #[error("Failed to parse configuration: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<toml::de::Error>,
    },

    /// Configuration validation error
    #[error("Configuration validation failed: {message}")]
    ConfigValidation { message: String, field: Option<String> },

    // ─────────────────────────────────────────────────────────────
    // IO Errors
    // ─────────────────────────────────────────────────────────────

    /// File read error
    #[error("Failed to read file: {path}")]
    IoRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File write error
    #[error("Failed to write file: {path}")]
    IoWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    Toml(#[from] toml::ser::Error),

    // ─────────────────────────────────────────────────────────────
    // Transport Errors
    // ─────────────────────────────────────────────────────────────

    /// The configured transport could not be brought up
    #[error("Transport '{kind}' unavailable: {message}")]
    TransportUnavailable { kind: String, message: String },

    /// Listener could not be bound
    #[error("Failed to bind {addr}: {source}")]
    TransportBind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Destination could not be reached
    #[error("Rank {rank} unreachable: {message}")]
    PeerUnreachable { rank: Rank, message: String },

    /// Rank outside [0, world_size)
    #[error("Rank {rank} out of range for {world_size} participants")]
    InvalidRank { rank: Rank, world_size: usize },

    // ─────────────────────────────────────────────────────────────
    // Wire Errors
    // ─────────────────────────────────────────────────────────────

    /// Frame exceeds the wire limit
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Peer sent something other than a handshake first
    #[error("Handshake failed: {0}")]
    Handshake(String),

    // ─────────────────────────────────────────────────────────────
    // Waypoint Errors
    // ─────────────────────────────────────────────────────────────

    /// Submission after shutdown
    #[error("Waypoint has been shut down")]
    Shutdown,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    // ─────────────────────────────────────────────────────────────
    // Error Classification
    // ─────────────────────────────────────────────────────────────

    /// Get the numeric error code
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ConfigNotFound { .. } => ErrorCode::ConfigNotFound,
            Error::ConfigParse { .. } => ErrorCode::ConfigParseError,
            Error::ConfigValidation { .. } => ErrorCode::ConfigValidation,

            Error::IoRead { .. } => ErrorCode::IoRead,
            Error::IoWrite { .. } => ErrorCode::IoWrite,
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => ErrorCode::IoNotFound,
                std::io::ErrorKind::PermissionDenied => ErrorCode::IoPermission,
                _ => ErrorCode::IoRead,
            },
            Error::Toml(_) => ErrorCode::ConfigParseError,

            Error::TransportUnavailable { .. } => ErrorCode::TransportUnavailable,
            Error::TransportBind { .. } => ErrorCode::TransportBind,
            Error::PeerUnreachable { .. } => ErrorCode::PeerUnreachable,
            Error::InvalidRank { .. } => ErrorCode::InvalidRank,

            Error::FrameTooLarge { .. } => ErrorCode::FrameTooLarge,
            Error::Handshake(_) => ErrorCode::HandshakeFailed,

            Error::Shutdown => ErrorCode::WaypointShutdown,
            Error::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Check if the error is fatal (process should not continue)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConfigNotFound { .. }
                | Error::ConfigParse { .. }
                | Error::ConfigValidation { .. }
                | Error::TransportUnavailable { .. }
                | Error::TransportBind { .. }
                | Error::Internal(_)
        )
    }

    /// Get the exit code for CLI
    pub fn exit_code(&self) -> i32 {
        self.code().exit_code()
    }

    // ─────────────────────────────────────────────────────────────
    // User-Friendly Messages
    // ─────────────────────────────────────────────────────────────

    /// Get a user-friendly suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::ConfigNotFound { .. } => Some(
                "Run 'treeway config init' to create a default configuration file."
            ),
            Error::ConfigParse { .. } => Some(
                "Check your configuration file syntax. Run 'treeway config validate' to see details."
            ),
            Error::ConfigValidation { .. } => Some(
                "Review [node] and [transport]: rank must be below world_size and peers must list one address per rank."
            ),
            Error::TransportUnavailable { .. } => Some(
                "Use transport kind 'tcp' for multi-process clusters; 'local' only works inside one process."
            ),
            Error::TransportBind { .. } => Some(
                "Another process may hold the listen address. Check peers[rank] in the configuration."
            ),
            Error::PeerUnreachable { .. } => Some(
                "Make sure every rank is started and reachable at its configured address."
            ),
            _ => None,
        }
    }

    /// Format the error for terminal display with colors
    pub fn format_for_terminal(&self) -> String {
        let mut output = format!(
            "\x1b[31mError [{}]\x1b[0m: {}\n",
            self.code().as_str(),
            self
        );

        if let Some(hint) = self.suggestion() {
            output.push_str(&format!("\n\x1b[33mHint\x1b[0m: {}\n", hint));
        }

        output
    }

    /// Format the error for logging (no colors)
    pub fn format_for_log(&self) -> String {
        format!("[{}] {}", self.code().as_str(), self)
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    /// Create a config not found error
    pub fn config_not_found(path: impl Into<PathBuf>) -> Self {
        Error::ConfigNotFound { path: path.into() }
    }

    /// Create a config parse error
    pub fn config_parse(message: impl Into<String>) -> Self {
        Error::ConfigParse {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config validation error
    pub fn config_validation(message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: None,
        }
    }

    /// Create a config validation error with field name
    pub fn config_field_invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a transport unavailable error
    pub fn transport_unavailable(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Error::TransportUnavailable {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_format() {
        assert_eq!(ErrorCode::ConfigNotFound.as_str(), "E100");
        assert_eq!(ErrorCode::TransportUnavailable.as_str(), "E300");
        assert_eq!(ErrorCode::InternalError.as_str(), "E900");
    }

    #[test]
    fn test_error_exit_codes() {
        assert_eq!(ErrorCode::ConfigNotFound.exit_code(), 10);
        assert_eq!(ErrorCode::IoRead.exit_code(), 20);
        assert_eq!(ErrorCode::TransportUnavailable.exit_code(), 30);
        assert_eq!(ErrorCode::FrameTooLarge.exit_code(), 40);
        assert_eq!(ErrorCode::WaypointShutdown.exit_code(), 50);
        assert_eq!(ErrorCode::InternalError.exit_code(), 90);
    }

    #[test]
    fn test_transport_unavailable_is_fatal() {
        let err = Error::transport_unavailable("tcp", "no peers");
        assert_eq!(err.code(), ErrorCode::TransportUnavailable);
        assert!(err.is_fatal());
        assert!(err.to_string().contains("tcp"));
        assert!(err.suggestion().is_some());
    }

    #[test]
    fn test_runtime_errors_not_fatal() {
        assert!(!Error::Shutdown.is_fatal());
        assert!(!Error::InvalidRank { rank: 9, world_size: 3 }.is_fatal());
        assert!(!Error::FrameTooLarge { size: 10, max: 5 }.is_fatal());
    }

    #[test]
    fn test_invalid_rank_display() {
        let err = Error::InvalidRank { rank: 9, world_size: 3 };
        assert_eq!(err.to_string(), "Rank 9 out of range for 3 participants");
    }

    #[test]
    fn test_format_for_terminal() {
        let err = Error::config_not_found("/test/config.toml");
        let formatted = err.format_for_terminal();

        assert!(formatted.contains("E100"));
        assert!(formatted.contains("\x1b[31m"));
        assert!(formatted.contains("Hint"));
    }

    #[test]
    fn test_format_for_log() {
        let err = Error::config_not_found("/test/config.toml");
        let formatted = err.format_for_log();

        assert!(formatted.contains("[E100]"));
        assert!(!formatted.contains("\x1b["));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();

        assert_eq!(err.code(), ErrorCode::IoNotFound);
    }
}
