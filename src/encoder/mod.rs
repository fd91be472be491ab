//! # Encoder Module
//!
//! Turns finished panoramas into output.
//!
//! ## Plain English Explanation
//!
//! Every seven game frames the scheduler produces one equirectangular
//! panorama, already converted to NV12 (the layout hardware video encoders
//! eat). Something has to write those frames somewhere. That "something" is
//! a [`FrameEncoder`]:
//!
//! ```text
//!   NV12 surface          FrameEncoder                output
//!   ┌──────────┐        ┌──────────────┐       ┌──────────────────┐
//!   │ Y  Y  Y  │ ─────▶ │ H.264 (ext.) │ ────▶ │ capture.mp4      │
//!   │ UV UV UV │        │ JPEG frames  │ ────▶ │ capture/*.jpg    │
//!   └──────────┘        └──────────────┘       └──────────────────┘
//! ```
//!
//! The hardware H.264/MP4 backend lives with the platform adapter and
//! implements the same trait. This crate ships [`ImageSequenceEncoder`],
//! which writes each panorama as a numbered JPEG.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::ColorType;

use crate::config::Config;
use crate::error::{EncoderErrorKind, WideCaptureError, WideCaptureResult};
use crate::gpu::{GpuDevice, TextureFormat, TextureId, ToolCall};
use crate::storage;

// ============================================
// ENCODER INTERFACE
// ============================================

/// Everything an encoder needs to open an output.
#[derive(Clone, Debug, PartialEq)]
pub struct EncoderSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Bits per second (ignored by image backends)
    pub bitrate: u32,
    pub output_path: PathBuf,
    pub jpeg_quality: u8,
}

impl EncoderSettings {
    pub fn from_config(config: &Config, width: u32, height: u32, output_path: PathBuf) -> Self {
        Self {
            width,
            height,
            fps: config.target_fps,
            bitrate: config.video_bitrate,
            output_path,
            jpeg_quality: config.jpeg_quality,
        }
    }
}

/// One finished panorama, ready to encode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FinishedFrame {
    /// NV12 surface holding the frame
    pub surface: TextureId,
    pub width: u32,
    pub height: u32,
    /// Zero-based frame number within the current output
    pub index: u64,
}

impl FinishedFrame {
    /// Presentation timestamp in microseconds.
    pub fn pts_us(&self, fps: u32) -> u64 {
        self.index * 1_000_000 / fps.max(1) as u64
    }
}

/// Statistics about the current (or last) output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncoderStats {
    pub frames_encoded: u64,
    pub bytes_written: u64,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// A sink for finished frames.
///
/// Frames are handed over synchronously, in order. `finish` must be safe to
/// call more than once.
pub trait FrameEncoder: Send {
    /// Opens a new output.
    fn initialize(&mut self, settings: &EncoderSettings) -> WideCaptureResult<()>;

    /// Encodes one frame; the surface is only valid for the duration of
    /// the call.
    fn encode_frame(
        &mut self,
        device: &mut dyn GpuDevice,
        frame: &FinishedFrame,
    ) -> WideCaptureResult<()>;

    /// Flushes and closes the current output.
    fn finish(&mut self) -> WideCaptureResult<()>;

    /// Extension of the output file, or `None` if the output is a directory.
    fn extension(&self) -> Option<&'static str>;

    fn stats(&self) -> EncoderStats;
}

// ============================================
// IMAGE SEQUENCE ENCODER
// ============================================

/// Writes each frame as a JPEG into the output directory.
///
/// ## Plain English
///
/// The output `captures/widecapture_20260101_120000/` ends up holding
/// `frame_000000.jpg`, `frame_000001.jpg`, ... which any tool can stitch
/// into a video later.
pub struct ImageSequenceEncoder {
    settings: Option<EncoderSettings>,
    directory: Option<PathBuf>,
    frames_encoded: u64,
    bytes_written: u64,
    /// Readback scratch, reused across frames
    scratch: Vec<u8>,
}

impl ImageSequenceEncoder {
    pub fn new() -> Self {
        Self {
            settings: None,
            directory: None,
            frames_encoded: 0,
            bytes_written: 0,
            scratch: Vec::new(),
        }
    }

    /// Directory frames are written to, while an output is open.
    pub fn directory(&self) -> Option<&Path> {
        self.directory.as_deref()
    }

    fn write_jpeg(path: &Path, rgb: &[u8], width: u32, height: u32, quality: u8) -> WideCaptureResult<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        JpegEncoder::new_with_quality(&mut writer, quality)
            .encode(rgb, width, height, ColorType::Rgb8)
            .map_err(|e| WideCaptureError::Encoder(EncoderErrorKind::FrameEncodeFailed(e.to_string())))
    }
}

impl Default for ImageSequenceEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameEncoder for ImageSequenceEncoder {
    fn initialize(&mut self, settings: &EncoderSettings) -> WideCaptureResult<()> {
        if self.settings.is_some() {
            self.finish()?;
        }

        let directory = settings.output_path.clone();
        storage::ensure_directory(&directory).map_err(|e| {
            WideCaptureError::Encoder(EncoderErrorKind::InitializationFailed(format!(
                "{}: {}",
                directory.display(),
                e
            )))
        })?;

        log::info!(
            "Writing {}x{} frames @ {} FPS to {}",
            settings.width,
            settings.height,
            settings.fps,
            directory.display()
        );

        self.settings = Some(settings.clone());
        self.directory = Some(directory);
        self.frames_encoded = 0;
        self.bytes_written = 0;
        Ok(())
    }

    fn encode_frame(
        &mut self,
        device: &mut dyn GpuDevice,
        frame: &FinishedFrame,
    ) -> WideCaptureResult<()> {
        let (Some(settings), Some(directory)) = (&self.settings, &self.directory) else {
            return Err(WideCaptureError::Encoder(EncoderErrorKind::NotInitialized));
        };

        let call = ToolCall::issue();
        device.read_texture(&call, frame.surface, &mut self.scratch)?;

        let expected = TextureFormat::Nv12.layer_size(frame.width, frame.height);
        if self.scratch.len() != expected {
            return Err(WideCaptureError::Encoder(EncoderErrorKind::InvalidFrameData {
                expected,
                got: self.scratch.len(),
            }));
        }

        let rgb = nv12_to_rgb(&self.scratch, frame.width, frame.height);
        let path = directory.join(format!("frame_{:06}.jpg", frame.index));
        Self::write_jpeg(&path, &rgb, frame.width, frame.height, settings.jpeg_quality)?;

        self.bytes_written += std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        self.frames_encoded += 1;

        if self.frames_encoded % 300 == 0 {
            log::debug!(
                "Encoded {} frames ({} µs)",
                self.frames_encoded,
                frame.pts_us(settings.fps)
            );
        }
        Ok(())
    }

    fn finish(&mut self) -> WideCaptureResult<()> {
        let Some(directory) = self.directory.take() else {
            return Ok(());
        };
        self.settings = None;

        log::info!(
            "Recording finished: {} frames, {} in {}",
            self.frames_encoded,
            storage::human_size(self.bytes_written),
            directory.display()
        );
        Ok(())
    }

    fn extension(&self) -> Option<&'static str> {
        None
    }

    fn stats(&self) -> EncoderStats {
        let (width, height, fps) = self
            .settings
            .as_ref()
            .map(|s| (s.width, s.height, s.fps))
            .unwrap_or_default();
        EncoderStats {
            frames_encoded: self.frames_encoded,
            bytes_written: self.bytes_written,
            width,
            height,
            fps,
        }
    }
}

// ============================================
// COLOR CONVERSION
// ============================================

/// Converts RGBA pixels to NV12.
///
/// ## Plain English
///
/// Video encoders don't use RGB. They want brightness (Y) at full resolution
/// and colour (U, V) at quarter resolution, since our eyes barely notice
/// blurry colour. NV12 stores the Y plane first, then U and V interleaved
/// as pairs.
///
/// Uses BT.601 coefficients. The output is always
/// `TextureFormat::Nv12.layer_size(width, height)` bytes.
pub fn rgba_to_nv12(rgba: &[u8], width: u32, height: u32) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let pixel_count = w * h;
    let mut nv12 = vec![0u8; TextureFormat::Nv12.layer_size(width, height)];

    // Y plane (full resolution brightness)
    for (i, pixel) in rgba.chunks_exact(4).take(pixel_count).enumerate() {
        let (r, g, b) = (pixel[0] as f32, pixel[1] as f32, pixel[2] as f32);
        nv12[i] = (0.299 * r + 0.587 * g + 0.114 * b).round().clamp(0.0, 255.0) as u8;
    }

    // Interleaved UV plane (average of each 2x2 block)
    let (uv_width, uv_height) = (w / 2, h / 2);
    for y in 0..uv_height {
        for x in 0..uv_width {
            let mut sum = [0u32; 3];
            for dy in 0..2 {
                for dx in 0..2 {
                    let idx = ((y * 2 + dy) * w + x * 2 + dx) * 4;
                    for (channel, total) in sum.iter_mut().enumerate() {
                        *total += rgba[idx + channel] as u32;
                    }
                }
            }
            let [r, g, b] = sum.map(|s| s as f32 / 4.0);

            let u = -0.169 * r - 0.331 * g + 0.500 * b + 128.0;
            let v = 0.500 * r - 0.419 * g - 0.081 * b + 128.0;

            let uv_idx = pixel_count + (y * uv_width + x) * 2;
            nv12[uv_idx] = u.round().clamp(0.0, 255.0) as u8;
            nv12[uv_idx + 1] = v.round().clamp(0.0, 255.0) as u8;
        }
    }

    nv12
}

/// Converts NV12 back to packed RGB (3 bytes per pixel).
pub fn nv12_to_rgb(nv12: &[u8], width: u32, height: u32) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let pixel_count = w * h;
    let uv_width = w / 2;
    let mut rgb = Vec::with_capacity(pixel_count * 3);

    for y in 0..h {
        for x in 0..w {
            let luma = nv12[y * w + x] as f32;
            let uv_idx = pixel_count + ((y / 2) * uv_width + x / 2) * 2;
            let (u, v) = match nv12.get(uv_idx..uv_idx + 2) {
                Some(pair) if x / 2 < uv_width => (pair[0] as f32 - 128.0, pair[1] as f32 - 128.0),
                _ => (0.0, 0.0),
            };

            let r = luma + 1.402 * v;
            let g = luma - 0.344 * u - 0.714 * v;
            let b = luma + 1.772 * u;
            rgb.extend([r, g, b].map(|c| c.round().clamp(0.0, 255.0) as u8));
        }
    }

    rgb
}

// ============================================
// TESTS
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{SoftwareDevice, TextureDesc, TextureUsage};
    use tempfile::tempdir;

    #[test]
    fn test_nv12_size() {
        let rgba = vec![128u8; 100 * 100 * 4];
        let nv12 = rgba_to_nv12(&rgba, 100, 100);
        assert_eq!(nv12.len(), 100 * 100 + 100 * 100 / 2);
    }

    #[test]
    fn test_nv12_primary_colours() {
        let mut rgba = Vec::new();
        for _ in 0..4 {
            rgba.extend_from_slice(&[255, 0, 0, 255]);
        }
        let nv12 = rgba_to_nv12(&rgba, 2, 2);
        assert_eq!(nv12[0], 76); // Y of pure red
        assert!(nv12[4] < 100); // U below neutral
        assert_eq!(nv12[5], 255); // V saturated

        let rgb = nv12_to_rgb(&nv12, 2, 2);
        assert!(rgb[0] > 240 && rgb[1] < 15 && rgb[2] < 15);
    }

    #[test]
    fn test_grey_round_trip() {
        let rgba = vec![90u8; 8 * 4 * 4];
        let rgb = nv12_to_rgb(&rgba_to_nv12(&rgba, 8, 4), 8, 4);
        assert!(rgb.iter().all(|&c| c.abs_diff(90) <= 1));
    }

    #[test]
    fn test_pts() {
        let frame = FinishedFrame {
            surface: TextureId(1),
            width: 16,
            height: 16,
            index: 30,
        };
        assert_eq!(frame.pts_us(60), 500_000);
    }

    #[test]
    fn test_encode_before_initialize() {
        let mut device = SoftwareDevice::new();
        let mut encoder = ImageSequenceEncoder::new();
        let frame = FinishedFrame {
            surface: TextureId(1),
            width: 16,
            height: 16,
            index: 0,
        };
        assert!(matches!(
            encoder.encode_frame(&mut device, &frame),
            Err(WideCaptureError::Encoder(EncoderErrorKind::NotInitialized))
        ));
        assert!(encoder.finish().is_ok());
    }

    #[test]
    fn test_image_sequence_writes_frames() {
        let dir = tempdir().unwrap();
        let output_path = dir.path().join("capture");
        let settings = EncoderSettings::from_config(&Config::default(), 32, 16, output_path);

        let mut device = SoftwareDevice::new();
        let source = device.create_back_buffer(32, 16);
        device.fill_texture(source, [200, 40, 40, 255]).unwrap();
        let surface = device
            .create_texture(&TextureDesc {
                format: TextureFormat::Nv12,
                ..TextureDesc::rgba(32, 16, TextureUsage::VideoSurface)
            })
            .unwrap();
        device.convert_to_nv12(source, surface).unwrap();

        let mut encoder = ImageSequenceEncoder::new();
        encoder.initialize(&settings).unwrap();
        for index in 0..2 {
            let frame = FinishedFrame {
                surface,
                width: 32,
                height: 16,
                index,
            };
            encoder.encode_frame(&mut device, &frame).unwrap();
        }

        let frames = dir.path().join("capture");
        assert!(frames.join("frame_000000.jpg").exists());
        assert!(frames.join("frame_000001.jpg").exists());

        let stats = encoder.stats();
        assert_eq!(stats.frames_encoded, 2);
        assert!(stats.bytes_written > 0);
        assert_eq!((stats.width, stats.height), (32, 16));

        let decoded = image::open(frames.join("frame_000000.jpg")).unwrap().to_rgb8();
        assert_eq!(decoded.dimensions(), (32, 16));
        assert!(decoded.get_pixel(16, 8)[0] > 150);

        encoder.finish().unwrap();
        assert!(encoder.directory().is_none());
    }

    #[test]
    fn test_wrong_surface_size_is_rejected() {
        let dir = tempdir().unwrap();
        let settings =
            EncoderSettings::from_config(&Config::default(), 32, 16, dir.path().join("x"));

        let mut device = SoftwareDevice::new();
        let wrong = device.create_back_buffer(32, 16);

        let mut encoder = ImageSequenceEncoder::new();
        encoder.initialize(&settings).unwrap();
        let frame = FinishedFrame {
            surface: wrong,
            width: 32,
            height: 16,
            index: 0,
        };
        assert!(matches!(
            encoder.encode_frame(&mut device, &frame),
            Err(WideCaptureError::Encoder(EncoderErrorKind::InvalidFrameData { .. }))
        ));
    }
}
