//! # Interception Boundary
//!
//! The calls a platform adapter makes when the target touches the GPU.
//!
//! ## Plain English
//!
//! The adapter hooks the game's graphics calls and forwards four kinds of
//! event here: "a buffer was written", "a buffer is being bound", "a frame
//! is about to be shown", "the window changed size". For binds we may hand
//! back a different buffer; for Presents we say whether to show the frame.
//!
//! Two promises hold for every entry point:
//!
//! 1. **Never break the game.** Errors and panics are caught here and turn
//!    into "do what you would have done without us".
//! 2. **Never observe ourselves.** Calls the tool makes on its own behalf
//!    are marked `CallOrigin::Tool` (or carry a `ToolCall` token) and are
//!    ignored.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;

use crate::camera::tracker::BufferWrite;
use crate::camera::{CameraController, CameraStats};
use crate::capture::{CaptureCounters, CaptureScheduler, CaptureStats, PresentFrame, PresentOutcome};
use crate::config::Config;
use crate::encoder::{FrameEncoder, ImageSequenceEncoder};
use crate::error::{WideCaptureError, WideCaptureResult};
use crate::gpu::{BufferId, GpuDevice};

// ============================================
// CALL ORIGIN
// ============================================

/// Who issued an intercepted call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallOrigin {
    /// The host application
    Target,
    /// This crate, through the adapter's original entry points
    Tool,
}

// ============================================
// SESSION STATE
// ============================================

/// Everything the render thread mutates, behind one lock.
struct Session<D> {
    device: D,
    camera: CameraController,
    scheduler: CaptureScheduler,
}

/// Snapshot of a session's state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub capture: CaptureStats,
    pub camera: CameraStats,
    pub tracked_buffers: usize,
    pub camera_buffers: usize,
    pub recording: bool,
    pub failed: bool,
    pub stopped: bool,
}

// ============================================
// WIDE CAPTURE
// ============================================

/// One capture session attached to one device.
///
/// ## Plain English
///
/// This is the "control center": it owns the camera controller, the
/// capture scheduler and the device, and serializes every intercepted call
/// through a single lock so a face can never be attributed to the wrong
/// frame.
pub struct WideCapture<D: GpuDevice> {
    session: Mutex<Session<D>>,

    /// Set once; from then on every call passes through
    stopped: AtomicBool,

    counters: Arc<CaptureCounters>,

    config: Config,
}

impl<D: GpuDevice> WideCapture<D> {
    /// Creates a session with the image-sequence encoder.
    pub fn new(device: D, config: Config) -> WideCaptureResult<Self> {
        Self::with_encoder(device, config, Box::new(ImageSequenceEncoder::new()))
    }

    /// Creates a session with a custom encoder backend.
    pub fn with_encoder(
        device: D,
        config: Config,
        encoder: Box<dyn FrameEncoder>,
    ) -> WideCaptureResult<Self> {
        let errors = config.validate();
        if let Some(first) = errors.first() {
            for e in &errors {
                warn!("Invalid configuration: {}", e);
            }
            return Err(WideCaptureError::Config(first.clone()));
        }

        info!(
            "Initializing WideCapture: {} FPS output ({} game frames each), buffers up to {} bytes",
            config.target_fps,
            config.game_frames_per_output_frame(),
            config.max_tracked_buffer_size
        );

        let counters = Arc::new(CaptureCounters::default());
        let mut camera = CameraController::new(&config);
        let mut scheduler = CaptureScheduler::new(&config, encoder, Arc::clone(&counters));
        if config.record_on_attach {
            scheduler.start_recording(&mut camera);
        }

        Ok(Self {
            session: Mutex::new(Session {
                device,
                camera,
                scheduler,
            }),
            stopped: AtomicBool::new(false),
            counters,
            config,
        })
    }

    /// Runs `f`, converting a panic into `fallback` and stopping the session.
    fn guarded<R>(&self, what: &str, fallback: R, f: impl FnOnce() -> R) -> R {
        match catch_unwind(AssertUnwindSafe(f)) {
            Ok(result) => result,
            Err(_) => {
                error!("Panic in {}; passing through from now on", what);
                self.stopped.store(true, Ordering::SeqCst);
                fallback
            }
        }
    }

    // ----------------------------------------
    // Interception entry points
    // ----------------------------------------

    /// The target wrote (part of) a constant buffer.
    pub fn on_buffer_write(
        &self,
        origin: CallOrigin,
        id: BufferId,
        declared_size: usize,
        write: BufferWrite<'_>,
    ) {
        if origin == CallOrigin::Tool || self.is_stopped() {
            return;
        }
        self.guarded("buffer write", (), || {
            let mut session = self.session.lock();
            session.camera.observe(id, declared_size, write);
        });
    }

    /// The target is binding a constant buffer. Returns the buffer to bind
    /// instead, or `None` to bind the original.
    pub fn on_buffer_bind(&self, origin: CallOrigin, slot: u32, id: BufferId) -> Option<BufferId> {
        if origin == CallOrigin::Tool || self.is_stopped() {
            return None;
        }
        self.guarded("buffer bind", None, || {
            let mut guard = self.session.lock();
            let Session {
                device,
                camera,
                scheduler,
            } = &mut *guard;

            match camera.try_substitute(device, id) {
                Ok(Some(replacement)) => {
                    trace!("slot {}: {:#x} -> {:#x}", slot, id.0, replacement.0);
                    Some(replacement)
                }
                Ok(None) => None,
                Err(e) => {
                    let e = WideCaptureError::from(e);
                    if e.disables_recording() {
                        scheduler.disable(camera, e);
                    } else {
                        warn!("Substitution failed for buffer {:#x}: {}", id.0, e);
                    }
                    None
                }
            }
        })
    }

    /// The target is about to present a frame.
    pub fn on_present_attempt(&self, frame: &PresentFrame) -> PresentOutcome {
        if self.is_stopped() {
            return PresentOutcome::SHOW;
        }
        self.guarded("present", PresentOutcome::SHOW, || {
            let mut guard = self.session.lock();
            let Session {
                device,
                camera,
                scheduler,
            } = &mut *guard;
            scheduler.on_present(device, camera, frame)
        })
    }

    /// The swap chain was resized.
    pub fn on_resize(&self, width: u32, height: u32) {
        if self.is_stopped() {
            return;
        }
        self.guarded("resize", (), || {
            let mut guard = self.session.lock();
            let Session {
                device,
                camera,
                scheduler,
            } = &mut *guard;
            scheduler.on_resize(device, camera, width, height);
        });
    }

    /// A buffer object was destroyed.
    pub fn on_buffer_destroyed(&self, id: BufferId) {
        self.guarded("buffer destroy", (), || {
            let mut guard = self.session.lock();
            let Session { device, camera, .. } = &mut *guard;
            camera.forget(device, id);
        });
    }

    // ----------------------------------------
    // Control
    // ----------------------------------------

    /// Starts recording. Returns false if the session can't record.
    pub fn start_recording(&self) -> bool {
        if self.is_stopped() {
            return false;
        }
        self.guarded("start recording", false, || {
            let mut guard = self.session.lock();
            let Session {
                camera, scheduler, ..
            } = &mut *guard;
            scheduler.start_recording(camera)
        })
    }

    /// Stops recording and closes the output; the session stays attached.
    pub fn stop_recording(&self) {
        self.guarded("stop recording", (), || {
            let mut guard = self.session.lock();
            let Session {
                device,
                camera,
                scheduler,
            } = &mut *guard;
            scheduler.stop_recording(device, camera);
        });
    }

    /// Ends the session: no further substitution, output finished, every
    /// later call passes through.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Stopping WideCapture session");
        self.guarded("stop", (), || {
            let mut guard = self.session.lock();
            let Session {
                device,
                camera,
                scheduler,
            } = &mut *guard;
            scheduler.stop_recording(device, camera);
            camera.set_bypass(true);
            camera.reset(device);
        });
        debug!("Session stopped: {:?}", self.counters.snapshot());
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Capture counters without taking the session lock.
    pub fn capture_stats(&self) -> CaptureStats {
        self.counters.snapshot()
    }

    /// Full snapshot, including state behind the session lock.
    pub fn stats(&self) -> SessionStats {
        let session = self.session.lock();
        SessionStats {
            capture: self.counters.snapshot(),
            camera: session.camera.stats(),
            tracked_buffers: session.camera.tracker().len(),
            camera_buffers: session.camera.tracker().camera_count(),
            recording: session.scheduler.is_recording(),
            failed: session.scheduler.has_failed(),
            stopped: self.is_stopped(),
        }
    }

    /// Returns a reference to the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Runs `f` with the device, under the session lock.
    ///
    /// Adapters use this to register native objects; tests use it to
    /// inspect the software device.
    pub fn with_device<R>(&self, f: impl FnOnce(&mut D) -> R) -> R {
        f(&mut self.session.lock().device)
    }
}

impl<D: GpuDevice> Drop for WideCapture<D> {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================
// TESTS
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::SoftwareDevice;
    use glam::{Mat4, Vec3};

    fn config(dir: &tempfile::TempDir) -> Config {
        Config {
            output_directory: dir.path().to_string_lossy().to_string(),
            record_on_attach: false,
            ..Config::default()
        }
    }

    fn camera_bytes() -> Vec<u8> {
        let mut floats = vec![0.5f32; 32];
        let eye = Vec3::new(1.0, 2.0, 3.0);
        floats[..16].copy_from_slice(&Mat4::look_at_lh(eye, eye + Vec3::Z, Vec3::Y).to_cols_array());
        floats[16..]
            .copy_from_slice(&Mat4::perspective_lh(1.0, 1.5, 0.1, 100.0).to_cols_array());
        bytemuck::cast_slice::<f32, u8>(&floats).to_vec()
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let bad = Config {
            target_fps: 0,
            ..Config::default()
        };
        assert!(matches!(
            WideCapture::new(SoftwareDevice::new(), bad),
            Err(WideCaptureError::Config(_))
        ));
    }

    #[test]
    fn test_record_on_attach() {
        let dir = tempfile::tempdir().unwrap();
        let capture = WideCapture::new(
            SoftwareDevice::new(),
            Config {
                record_on_attach: true,
                ..config(&dir)
            },
        )
        .unwrap();
        assert!(capture.stats().recording);
    }

    #[test]
    fn test_tool_origin_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let capture = WideCapture::new(SoftwareDevice::new(), config(&dir)).unwrap();
        capture.start_recording();

        let bytes = camera_bytes();
        capture.on_buffer_write(CallOrigin::Tool, BufferId(7), bytes.len(), BufferWrite::full(&bytes));
        assert_eq!(capture.stats().tracked_buffers, 0);

        capture.on_buffer_write(CallOrigin::Target, BufferId(7), bytes.len(), BufferWrite::full(&bytes));
        assert_eq!(capture.stats().camera_buffers, 1);
        assert!(capture.on_buffer_bind(CallOrigin::Tool, 0, BufferId(7)).is_none());
        assert!(capture.on_buffer_bind(CallOrigin::Target, 0, BufferId(7)).is_some());
    }

    #[test]
    fn test_stop_halts_substitution() {
        let dir = tempfile::tempdir().unwrap();
        let capture = WideCapture::new(SoftwareDevice::new(), config(&dir)).unwrap();
        capture.start_recording();

        let bytes = camera_bytes();
        capture.on_buffer_write(CallOrigin::Target, BufferId(7), bytes.len(), BufferWrite::full(&bytes));
        assert!(capture.on_buffer_bind(CallOrigin::Target, 0, BufferId(7)).is_some());

        capture.stop();
        assert!(capture.on_buffer_bind(CallOrigin::Target, 0, BufferId(7)).is_none());
        assert!(!capture.start_recording());

        let frame = PresentFrame {
            back_buffer: crate::gpu::TextureId(1),
            width: 64,
            height: 64,
        };
        assert!(capture.on_present_attempt(&frame).present);
        assert!(capture.stats().stopped);
    }

    #[test]
    fn test_replacement_failure_disables_recording() {
        let dir = tempfile::tempdir().unwrap();
        let capture = WideCapture::new(SoftwareDevice::new(), config(&dir)).unwrap();
        capture.start_recording();
        capture.with_device(|device| device.fail_allocations_after(0));

        let bytes = camera_bytes();
        capture.on_buffer_write(CallOrigin::Target, BufferId(7), bytes.len(), BufferWrite::full(&bytes));
        assert!(capture.on_buffer_bind(CallOrigin::Target, 0, BufferId(7)).is_none());

        let stats = capture.stats();
        assert!(stats.failed);
        assert!(!stats.recording);
        // Bypassed from now on
        assert!(capture.on_buffer_bind(CallOrigin::Target, 0, BufferId(7)).is_none());
    }

    #[test]
    fn test_destroyed_buffer_is_forgotten() {
        let dir = tempfile::tempdir().unwrap();
        let capture = WideCapture::new(SoftwareDevice::new(), config(&dir)).unwrap();
        capture.start_recording();

        let bytes = camera_bytes();
        capture.on_buffer_write(CallOrigin::Target, BufferId(7), bytes.len(), BufferWrite::full(&bytes));
        capture.on_buffer_bind(CallOrigin::Target, 0, BufferId(7));
        assert_eq!(capture.with_device(|d| d.live_resources()), 1);

        capture.on_buffer_destroyed(BufferId(7));
        assert_eq!(capture.stats().tracked_buffers, 0);
        assert_eq!(capture.with_device(|d| d.live_resources()), 0);
    }
}
