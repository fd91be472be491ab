//! # WideCapture
//!
//! Records 360° equirectangular video from a game that renders only a
//! normal flat view.
//!
//! ## How It Works
//!
//! The game is made to render a cube map over seven consecutive frames.
//! On six of them the camera matrices in its constant buffers are swapped
//! for a 90° camera facing one cube face; those frames are copied out and
//! never shown. The seventh frame is the player's own and is presented
//! normally. Once per cycle the six faces are projected to an
//! equirectangular image and handed to an encoder.
//!
//! ## Architecture Overview
//!
//! - `camera`: Finds camera matrices in constant buffers and rewrites them
//! - `capture`: The seven-phase cycle and the textures it fills
//! - `gpu`: The device seam, with a software implementation (and D3D11 on Windows)
//! - `encoder`: Frame sinks for finished panoramas
//! - `interception`: Entry points a platform adapter calls
//! - `storage`: Output naming and folders
//! - `config`: Session configuration
//! - `error`: Error types

// ============================================
// MODULE DECLARATIONS
// ============================================

pub mod camera;
pub mod capture;
pub mod config;
pub mod encoder;
pub mod error;
pub mod gpu;
pub mod interception;
pub mod storage;

// ============================================
// RE-EXPORTS
// ============================================

pub use camera::tracker::BufferWrite;
pub use camera::{CameraController, CubeFace};
pub use capture::{CaptureStats, PresentFrame, PresentOutcome};
pub use config::Config;
pub use encoder::{FrameEncoder, ImageSequenceEncoder};
pub use error::{WideCaptureError, WideCaptureResult};
pub use gpu::{BufferId, GpuDevice, SoftwareDevice, TextureId};
pub use interception::{CallOrigin, SessionStats, WideCapture};

/// Initialize logging for the host process.
///
/// Safe to call more than once; later calls are ignored. `RUST_LOG`
/// overrides the default `info` level.
pub fn init_logging() {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .try_init();
}

// ============================================
// TESTS
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_creation() {
        init_logging();
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            output_directory: dir.path().to_string_lossy().to_string(),
            ..Config::default()
        };
        let capture = WideCapture::new(SoftwareDevice::new(), config);
        assert!(capture.is_ok());
    }

    #[test]
    fn test_stats_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            output_directory: dir.path().to_string_lossy().to_string(),
            record_on_attach: false,
            ..Config::default()
        };
        let capture = WideCapture::new(SoftwareDevice::new(), config).unwrap();
        let stats = capture.stats();
        assert_eq!(stats.capture.faces_captured, 0);
        assert_eq!(stats.tracked_buffers, 0);
        assert!(!stats.recording);
    }
}
