//! # Error Types Module
//!
//! This module defines the error types used throughout WideCapture.
//!
//! ## Plain English Explanation
//!
//! Most "failures" in this crate are not errors at all: a constant buffer
//! that doesn't hold a camera is the normal case, and is reported as `None`.
//! The types here cover the things that genuinely go wrong:
//!
//! - "DeviceError: the GPU refused to give us a texture"
//! - "EncoderError: the frame sink couldn't be opened"
//! - "ConfigError: someone asked for a 0 FPS recording"
//!
//! None of them is ever allowed to reach the host application. The
//! interception layer turns every one of them into "pass the call through
//! unmodified".

use std::fmt;
use std::io;

use crate::config::ConfigError;
use crate::gpu::DeviceError;

// ============================================
// MAIN APPLICATION ERROR
// ============================================

/// The main error type for WideCapture
///
/// ## Plain English
///
/// This is the "parent" error that can contain any type of error
/// from any part of the crate.
#[derive(Debug)]
pub enum WideCaptureError {
    /// The GPU device (or its adapter) failed
    ///
    /// ## Examples
    /// - Texture creation ran out of memory
    /// - The projection kernel was never compiled
    Device(DeviceError),

    /// Something went wrong with the frame encoder
    Encoder(EncoderErrorKind),

    /// Something went wrong with configuration
    Config(ConfigError),

    /// Generic I/O error
    Io(io::Error),

    /// Something unexpected happened
    Internal(String),
}

impl From<io::Error> for WideCaptureError {
    fn from(err: io::Error) -> Self {
        WideCaptureError::Io(err)
    }
}

impl From<DeviceError> for WideCaptureError {
    fn from(err: DeviceError) -> Self {
        WideCaptureError::Device(err)
    }
}

impl From<ConfigError> for WideCaptureError {
    fn from(err: ConfigError) -> Self {
        WideCaptureError::Config(err)
    }
}

impl fmt::Display for WideCaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device(e) => write!(f, "Device error: {}", e),
            Self::Encoder(e) => write!(f, "Encoder error: {}", e),
            Self::Config(e) => write!(f, "Configuration error: {}", e),
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for WideCaptureError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Device(e) => Some(e),
            Self::Io(e) => Some(e),
            Self::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl WideCaptureError {
    /// Returns true if this error means the session can no longer record.
    ///
    /// Resource exhaustion and encoder initialization failures are fatal to
    /// recording (never to the host). Everything else is per-frame.
    pub fn disables_recording(&self) -> bool {
        match self {
            Self::Device(e) => e.is_resource_exhaustion(),
            Self::Encoder(EncoderErrorKind::InitializationFailed(_)) => true,
            Self::Config(_) => true,
            _ => false,
        }
    }
}

// ============================================
// ENCODER ERRORS
// ============================================

/// Errors that can occur while handing frames to the encoder
///
/// ## Plain English
///
/// These are problems with turning finished panoramas into a file.
#[derive(Debug)]
pub enum EncoderErrorKind {
    /// Encoder initialization failed
    ///
    /// ## What This Means
    /// The output couldn't be opened, so no frame can ever be written.
    InitializationFailed(String),

    /// A frame was handed over before `initialize` (or after `finish`)
    NotInitialized,

    /// Frame encoding failed
    FrameEncodeFailed(String),

    /// The frame we received doesn't match the negotiated size
    InvalidFrameData { expected: usize, got: usize },

    /// Finalization failed
    FinalizationFailed(String),
}

impl fmt::Display for EncoderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InitializationFailed(reason) => {
                write!(f, "Encoder initialization failed: {}", reason)
            }
            Self::NotInitialized => write!(f, "Encoder is not initialized"),
            Self::FrameEncodeFailed(reason) => {
                write!(f, "Failed to encode frame: {}", reason)
            }
            Self::InvalidFrameData { expected, got } => {
                write!(
                    f,
                    "Invalid frame data: expected {} bytes, got {}",
                    expected, got
                )
            }
            Self::FinalizationFailed(reason) => {
                write!(f, "Failed to finalize output: {}", reason)
            }
        }
    }
}

// ============================================
// RESULT TYPE ALIAS
// ============================================

/// A Result type that uses WideCaptureError
pub type WideCaptureResult<T> = Result<T, WideCaptureError>;

// ============================================
// TESTS
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = WideCaptureError::Encoder(EncoderErrorKind::NotInitialized);
        let message = format!("{}", err);
        assert!(message.contains("Encoder"));
        assert!(message.contains("not initialized"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let app_err: WideCaptureError = io_err.into();

        match app_err {
            WideCaptureError::Io(_) => {} // Expected
            _ => panic!("Expected Io error variant"),
        }
    }

    #[test]
    fn test_disables_recording() {
        let oom = WideCaptureError::Device(DeviceError::ResourceCreation {
            what: "face texture",
            reason: "out of memory".to_string(),
        });
        assert!(oom.disables_recording());

        let init = WideCaptureError::Encoder(EncoderErrorKind::InitializationFailed(
            "no such directory".to_string(),
        ));
        assert!(init.disables_recording());

        let frame = WideCaptureError::Encoder(EncoderErrorKind::FrameEncodeFailed(
            "disk hiccup".to_string(),
        ));
        assert!(!frame.disables_recording());
    }
}
