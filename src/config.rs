//! # Configuration Module
//!
//! This module handles all configurable settings for WideCapture.
//!
//! ## Plain English Explanation
//!
//! The capture tool has a handful of knobs: how fast the output video runs,
//! where it goes, how forgiving the camera-matrix detector is, and how large
//! a constant buffer may be before we stop looking inside it.
//!
//! There is no config file. Settings are built in code (usually
//! `Config::default()`) and checked with `validate()` before a session starts.

// ============================================
// MAIN CONFIGURATION
// ============================================

/// All configuration options for WideCapture
#[derive(Clone, Debug)]
pub struct Config {
    // ----------------------------------------
    // OUTPUT SETTINGS
    // "Where and how to save"
    // ----------------------------------------
    /// Frame rate written into the output
    ///
    /// ## Plain English
    /// One output frame costs seven game frames (six faces plus one player
    /// frame), so a game running at 420 FPS produces a 60 FPS panorama.
    /// This is a container setting, not a negotiated one.
    pub target_fps: u32,

    /// Video encoding bitrate in bits per second
    pub video_bitrate: u32,

    /// Directory where recordings are written
    pub output_directory: String,

    /// File name prefix for recordings (`widecapture_YYYYMMDD_HHMMSS`)
    pub output_stem: String,

    /// JPEG quality used by the image-sequence encoder (1-100)
    pub jpeg_quality: u8,

    // ----------------------------------------
    // DETECTION SETTINGS
    // "How to find the camera"
    // ----------------------------------------
    /// Tolerance used when matching the `(0, 0, 0, 1)` and `±1` patterns
    pub matrix_epsilon: f32,

    /// Constant buffers larger than this many bytes are never tracked
    ///
    /// ## Plain English
    /// Camera buffers are small. Big buffers are skinning palettes,
    /// instance data, and the like, and scanning them is wasted work.
    pub max_tracked_buffer_size: usize,

    // ----------------------------------------
    // SUBSTITUTION SETTINGS
    // ----------------------------------------
    /// Near plane of the substituted 90° projection
    ///
    /// The real near/far can't be recovered from the matrix alone.
    pub near_plane: f32,

    /// Far plane of the substituted 90° projection
    pub far_plane: f32,

    /// Start recording as soon as the session attaches to a device
    pub record_on_attach: bool,
}

/// Default ceiling for tracked constant buffers, in bytes.
pub const DEFAULT_MAX_TRACKED_BUFFER_SIZE: usize = 4096;

/// Default matrix-pattern tolerance.
pub const DEFAULT_MATRIX_EPSILON: f32 = 0.1;

impl Config {
    /// Creates a configuration with all default values
    pub fn default() -> Self {
        Self {
            // Output: 60 FPS, 50 Mbps, current directory
            target_fps: 60,
            video_bitrate: 50_000_000,
            output_directory: ".".to_string(),
            output_stem: "widecapture".to_string(),
            jpeg_quality: 90,

            // Detection
            matrix_epsilon: DEFAULT_MATRIX_EPSILON,
            max_tracked_buffer_size: DEFAULT_MAX_TRACKED_BUFFER_SIZE,

            // Substitution
            near_plane: 0.1,
            far_plane: 1000.0,

            record_on_attach: true,
        }
    }

    /// Creates a configuration for short test recordings
    ///
    /// ## When to Use
    /// Demos and smoke tests where the output is thrown away.
    pub fn preview() -> Self {
        Self {
            target_fps: 30,
            video_bitrate: 8_000_000,
            jpeg_quality: 75,
            ..Self::default()
        }
    }

    /// Validates the configuration and returns errors if invalid
    ///
    /// ## Plain English
    /// Makes sure all settings are within reasonable bounds.
    /// Returns a list of problems, or empty if all is well.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        if self.target_fps == 0 || self.target_fps > 240 {
            errors.push(ConfigError::InvalidFps(self.target_fps));
        }

        if self.video_bitrate < 1_000_000 {
            errors.push(ConfigError::BitrateTooLow(self.video_bitrate));
        }
        if self.video_bitrate > 200_000_000 {
            errors.push(ConfigError::BitrateTooHigh(self.video_bitrate));
        }

        if self.jpeg_quality == 0 || self.jpeg_quality > 100 {
            errors.push(ConfigError::InvalidJpegQuality(self.jpeg_quality));
        }

        if !(self.matrix_epsilon > 0.0 && self.matrix_epsilon <= 0.5) {
            errors.push(ConfigError::InvalidEpsilon(self.matrix_epsilon));
        }

        // Must at least fit one 4x4 float matrix
        if self.max_tracked_buffer_size < 64 || self.max_tracked_buffer_size > 65_536 {
            errors.push(ConfigError::InvalidBufferCeiling(
                self.max_tracked_buffer_size,
            ));
        }

        if !(self.near_plane > 0.0 && self.far_plane > self.near_plane) {
            errors.push(ConfigError::InvalidClipPlanes {
                near: self.near_plane,
                far: self.far_plane,
            });
        }

        if self.output_directory.trim().is_empty() || self.output_stem.trim().is_empty() {
            errors.push(ConfigError::InvalidOutputDirectory(format!(
                "{}/{}",
                self.output_directory, self.output_stem
            )));
        }

        errors
    }

    /// Number of game frames consumed per output frame.
    pub fn game_frames_per_output_frame(&self) -> u32 {
        crate::capture::CYCLE_LENGTH as u32
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default()
    }
}

// ============================================
// CONFIGURATION ERRORS
// ============================================

/// Errors that can occur with configuration values
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// FPS value is outside valid range
    InvalidFps(u32),

    /// Video bitrate is too low for acceptable quality
    BitrateTooLow(u32),

    /// Video bitrate is unreasonably high
    BitrateTooHigh(u32),

    /// JPEG quality outside 1-100
    InvalidJpegQuality(u8),

    /// Matrix tolerance is zero, negative or so loose everything matches
    InvalidEpsilon(f32),

    /// Tracked-buffer ceiling can't hold a matrix, or is absurdly large
    InvalidBufferCeiling(usize),

    /// Near/far planes are not `0 < near < far`
    InvalidClipPlanes { near: f32, far: f32 },

    /// Output location is unusable
    InvalidOutputDirectory(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidFps(val) => {
                write!(f, "FPS {} is outside valid range (1-240)", val)
            }
            Self::BitrateTooLow(val) => {
                write!(f, "Bitrate {} bps is too low for acceptable quality", val)
            }
            Self::BitrateTooHigh(val) => {
                write!(f, "Bitrate {} bps is unreasonably high", val)
            }
            Self::InvalidJpegQuality(val) => {
                write!(f, "JPEG quality {} is outside valid range (1-100)", val)
            }
            Self::InvalidEpsilon(val) => {
                write!(f, "Matrix epsilon {} must be in (0, 0.5]", val)
            }
            Self::InvalidBufferCeiling(val) => {
                write!(f, "Tracked buffer ceiling {} bytes is outside 64-65536", val)
            }
            Self::InvalidClipPlanes { near, far } => {
                write!(f, "Clip planes near={} far={} must satisfy 0 < near < far", near, far)
            }
            Self::InvalidOutputDirectory(path) => {
                write!(f, "Output location '{}' is invalid", path)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

// ============================================
// TESTS
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.target_fps, 60);
        assert_eq!(config.max_tracked_buffer_size, 4096);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_preview_config_is_valid() {
        assert!(Config::preview().validate().is_empty());
    }

    #[test]
    fn test_validation_errors() {
        let mut config = Config::default();

        config.target_fps = 0;
        assert_eq!(config.validate(), vec![ConfigError::InvalidFps(0)]);
        config.target_fps = 60;

        config.matrix_epsilon = 0.0;
        assert!(!config.validate().is_empty());
        config.matrix_epsilon = 0.1;

        config.near_plane = 10.0;
        config.far_plane = 1.0;
        assert!(matches!(
            config.validate()[0],
            ConfigError::InvalidClipPlanes { .. }
        ));
    }

    #[test]
    fn test_buffer_ceiling_must_fit_a_matrix() {
        let config = Config {
            max_tracked_buffer_size: 32,
            ..Config::default()
        };
        assert_eq!(
            config.validate(),
            vec![ConfigError::InvalidBufferCeiling(32)]
        );
    }
}
