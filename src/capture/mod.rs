//! # Capture Module
//!
//! Drives the seven-frame capture cycle.
//!
//! ## Plain English
//!
//! We can't render six views in one frame, so we borrow six consecutive game
//! frames, one per cube face, and let the seventh through to the screen so
//! the player still sees the game:
//!
//! ```text
//!  Present #   1      2      3      4      5      6      7      8 ...
//!  phase     Right  Left   Up    Down  Front  Back  Player  Right ...
//!  screen      -      -      -      -      -      -    ✔       -
//!  work      copy   copy   copy   copy   copy   copy+        copy
//!                                              stitch+encode
//! ```
//!
//! A frame reaching Present was rendered with the face requested at the end
//! of the *previous* Present, so every Present asks for the next phase's face
//! before returning.

mod resources;

pub use resources::{align16, CaptureResources, CaptureSize};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{error, info, warn};

use crate::camera::{CameraController, CubeFace};
use crate::config::Config;
use crate::encoder::{EncoderSettings, FinishedFrame, FrameEncoder};
use crate::error::{WideCaptureError, WideCaptureResult};
use crate::gpu::{dispatch_groups, GpuDevice, PipelineStateGuard, Region, TextureId};
use crate::storage::StorageManager;

// ============================================
// CYCLE PHASES
// ============================================

/// Presents per output frame: six faces plus one player frame.
pub const CYCLE_LENGTH: u8 = 7;

/// Where a Present falls in the cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CyclePhase {
    Face(CubeFace),
    Player,
}

impl CyclePhase {
    /// Phase number, 0-5 for faces and 6 for the player frame.
    pub fn index(self) -> u8 {
        match self {
            Self::Face(face) => face.index() as u8,
            Self::Player => CYCLE_LENGTH - 1,
        }
    }

    pub fn from_index(index: u8) -> Self {
        match CubeFace::from_index((index % CYCLE_LENGTH) as usize) {
            Some(face) => Self::Face(face),
            None => Self::Player,
        }
    }

    pub fn next(self) -> Self {
        Self::from_index((self.index() + 1) % CYCLE_LENGTH)
    }
}

// ============================================
// PRESENT INTERFACE
// ============================================

/// A Present the target is about to make.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PresentFrame {
    pub back_buffer: TextureId,
    pub width: u32,
    pub height: u32,
}

/// What the adapter should do with the Present.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PresentOutcome {
    /// Forward to the real Present; otherwise drop it
    pub present: bool,
}

impl PresentOutcome {
    pub const SHOW: Self = Self { present: true };
    pub const SUPPRESS: Self = Self { present: false };
}

// ============================================
// STATISTICS
// ============================================

/// Lock-free counters, readable while the render thread holds the session.
#[derive(Debug, Default)]
pub struct CaptureCounters {
    faces_captured: AtomicU64,
    cycles_completed: AtomicU64,
    frames_encoded: AtomicU64,
    presents_suppressed: AtomicU64,
    presents_shown: AtomicU64,
    encode_failures: AtomicU64,
}

impl CaptureCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CaptureStats {
        CaptureStats {
            faces_captured: self.faces_captured.load(Ordering::Relaxed),
            cycles_completed: self.cycles_completed.load(Ordering::Relaxed),
            frames_encoded: self.frames_encoded.load(Ordering::Relaxed),
            presents_suppressed: self.presents_suppressed.load(Ordering::Relaxed),
            presents_shown: self.presents_shown.load(Ordering::Relaxed),
            encode_failures: self.encode_failures.load(Ordering::Relaxed),
        }
    }
}

/// Statistics about the capture process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub faces_captured: u64,
    pub cycles_completed: u64,
    pub frames_encoded: u64,
    pub presents_suppressed: u64,
    pub presents_shown: u64,
    pub encode_failures: u64,
}

// ============================================
// CAPTURE SCHEDULER
// ============================================

/// The capture cycle state machine.
pub struct CaptureScheduler {
    config: Config,
    encoder: Box<dyn FrameEncoder>,
    storage: Option<StorageManager>,
    resources: Option<CaptureResources>,

    /// Phase of the last processed Present
    phase: CyclePhase,
    recording: bool,
    encoder_open: bool,
    /// Sticky: set once, recording stays off for the session
    failed: bool,
    /// Frame number within the current output
    frame_index: u64,

    counters: Arc<CaptureCounters>,
}

impl CaptureScheduler {
    pub fn new(config: &Config, encoder: Box<dyn FrameEncoder>, counters: Arc<CaptureCounters>) -> Self {
        Self {
            config: config.clone(),
            encoder,
            storage: None,
            resources: None,
            phase: CyclePhase::Player,
            recording: false,
            encoder_open: false,
            failed: false,
            frame_index: 0,
            counters,
        }
    }

    pub fn phase(&self) -> CyclePhase {
        self.phase
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    pub fn has_failed(&self) -> bool {
        self.failed
    }

    pub fn resources(&self) -> Option<&CaptureResources> {
        self.resources.as_ref()
    }

    /// Arms the cycle. Returns false if recording has been disabled.
    pub fn start_recording(&mut self, camera: &mut CameraController) -> bool {
        if self.failed {
            warn!("Recording is disabled for this session");
            return false;
        }
        if self.recording {
            return true;
        }

        info!("Recording started");
        self.recording = true;
        self.phase = CyclePhase::Player;
        self.request_next_face(camera);
        true
    }

    /// Stops the cycle, closes the output and frees the capture textures.
    pub fn stop_recording<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        camera: &mut CameraController,
    ) {
        if !self.recording {
            return;
        }
        info!("Recording stopped");
        self.recording = false;
        self.phase = CyclePhase::Player;
        camera.set_bypass(true);
        self.close_output();
        self.release_resources(device);
    }

    /// Back buffer changed size: new output, new cycle, new camera state.
    pub fn on_resize<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        camera: &mut CameraController,
        width: u32,
        height: u32,
    ) {
        info!("Back buffer resized to {}x{}", width, height);
        self.close_output();
        self.release_resources(device);
        camera.reset(device);
        self.phase = CyclePhase::Player;

        if self.recording && !self.failed {
            self.request_next_face(camera);
        } else {
            camera.set_bypass(true);
        }
    }

    /// Handles one Present attempt.
    pub fn on_present<D: GpuDevice>(
        &mut self,
        device: &mut D,
        camera: &mut CameraController,
        frame: &PresentFrame,
    ) -> PresentOutcome {
        if !self.recording || self.failed {
            camera.set_bypass(true);
            return self.shown();
        }

        let Some(size) = CaptureSize::for_back_buffer(frame.width, frame.height) else {
            // Nothing to capture from; the cycle restarts on the next real frame
            self.phase = CyclePhase::Player;
            camera.set_bypass(true);
            return self.shown();
        };
        if camera.bypass() && self.phase.next() != CyclePhase::Player {
            // No face was requested for this frame, so it holds the target's own view
            self.phase = CyclePhase::Player;
            self.request_next_face(camera);
            return self.shown();
        }
        if let Err(e) = self.ensure_resources(device, camera, size) {
            self.disable(camera, e);
            self.release_resources(device);
            return self.shown();
        }

        self.phase = self.phase.next();
        let outcome = match self.phase {
            CyclePhase::Face(face) => {
                if let Err(e) = self.capture_face(device, frame, face) {
                    self.report(camera, e);
                }
                if face == CubeFace::Back && !self.failed {
                    match self.process_cycle(device) {
                        Ok(()) => CaptureCounters::bump(&self.counters.cycles_completed),
                        Err(e) => self.report(camera, e),
                    }
                }
                if self.failed {
                    self.release_resources(device);
                    self.shown()
                } else {
                    CaptureCounters::bump(&self.counters.presents_suppressed);
                    PresentOutcome::SUPPRESS
                }
            }
            CyclePhase::Player => self.shown(),
        };

        if !self.failed {
            self.request_next_face(camera);
        }
        outcome
    }

    fn shown(&self) -> PresentOutcome {
        CaptureCounters::bump(&self.counters.presents_shown);
        PresentOutcome::SHOW
    }

    /// Points the camera at the phase after the current one.
    fn request_next_face(&self, camera: &mut CameraController) {
        match self.phase.next() {
            CyclePhase::Face(face) => {
                camera.set_target_face(face);
                camera.set_bypass(false);
            }
            CyclePhase::Player => camera.set_bypass(true),
        }
    }

    // ----------------------------------------
    // Resources and output
    // ----------------------------------------

    fn ensure_resources<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        camera: &mut CameraController,
        size: CaptureSize,
    ) -> WideCaptureResult<()> {
        if self.resources.as_ref().is_some_and(|r| r.size == size) && self.encoder_open {
            return Ok(());
        }

        if let Some(old) = &self.resources {
            if old.size != size {
                // Resolution changed without a resize notification
                let (width, height) = (size.back_width, size.back_height);
                self.on_resize(device, camera, width, height);
            }
        }

        if self.resources.is_none() {
            let resources = CaptureResources::allocate(device, size)?;
            info!(
                "Capture resources: {} faces of {}px, equirect {}x{}",
                resources.faces.len(),
                size.face_side,
                size.equirect_width,
                size.equirect_height
            );
            self.resources = Some(resources);
        }

        if !self.encoder_open {
            let storage = match self.storage.take() {
                Some(storage) => storage,
                None => StorageManager::new(&self.config.output_directory, &self.config.output_stem)?,
            };
            let path = storage.next_output_path(self.encoder.extension());
            self.storage = Some(storage);

            let settings = EncoderSettings::from_config(
                &self.config,
                size.equirect_width,
                size.equirect_height,
                path,
            );
            self.encoder.initialize(&settings)?;
            self.encoder_open = true;
            self.frame_index = 0;
        }
        Ok(())
    }

    fn release_resources<D: GpuDevice + ?Sized>(&mut self, device: &mut D) {
        if let Some(resources) = self.resources.take() {
            resources.release(device);
        }
    }

    fn close_output(&mut self) {
        if !self.encoder_open {
            return;
        }
        self.encoder_open = false;
        if let Err(e) = self.encoder.finish() {
            warn!("Failed to finish output: {}", e);
        }
    }

    // ----------------------------------------
    // GPU work
    // ----------------------------------------

    fn capture_face<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        frame: &PresentFrame,
        face: CubeFace,
    ) -> WideCaptureResult<()> {
        let Some(resources) = &self.resources else {
            return Err(WideCaptureError::Internal("no capture resources".to_string()));
        };

        let mut device = PipelineStateGuard::new(device);
        device.copy_texture_region(
            frame.back_buffer,
            resources.size.face_region(),
            resources.faces[face.index()],
            0,
        )?;
        CaptureCounters::bump(&self.counters.faces_captured);
        Ok(())
    }

    /// Cube assembly, projection, colour conversion, encode.
    fn process_cycle<D: GpuDevice>(&mut self, device: &mut D) -> WideCaptureResult<()> {
        let Some(resources) = &self.resources else {
            return Err(WideCaptureError::Internal("no capture resources".to_string()));
        };
        let size = resources.size;

        let mut device = PipelineStateGuard::new(device);
        let face_region = Region {
            x: 0,
            y: 0,
            width: size.face_side,
            height: size.face_side,
        };
        for face in CubeFace::ALL {
            device.copy_texture_region(
                resources.faces[face.index()],
                face_region,
                resources.cube,
                face.index() as u32,
            )?;
        }

        device.dispatch_projection(
            resources.cube,
            resources.equirect,
            dispatch_groups(size.equirect_width, size.equirect_height),
        )?;
        device.convert_to_nv12(resources.equirect, resources.surface)?;

        let finished = FinishedFrame {
            surface: resources.surface,
            width: size.equirect_width,
            height: size.equirect_height,
            index: self.frame_index,
        };
        self.frame_index += 1;

        match self.encoder.encode_frame(&mut *device, &finished) {
            Ok(()) => {
                CaptureCounters::bump(&self.counters.frames_encoded);
                Ok(())
            }
            Err(e) => {
                CaptureCounters::bump(&self.counters.encode_failures);
                Err(e)
            }
        }
    }

    // ----------------------------------------
    // Failures
    // ----------------------------------------

    /// Per-frame failures are logged; the rest disable recording.
    fn report(&mut self, camera: &mut CameraController, e: WideCaptureError) {
        if e.disables_recording() {
            self.disable(camera, e);
        } else {
            warn!("Capture frame failed: {}", e);
        }
    }

    /// Turns recording off for the rest of the session, logging once.
    pub fn disable(&mut self, camera: &mut CameraController, e: WideCaptureError) {
        if self.failed {
            return;
        }
        error!("Recording disabled for this session: {}", e);
        self.failed = true;
        self.recording = false;
        camera.set_bypass(true);
        self.close_output();
    }
}

// ============================================
// TESTS
// ============================================
