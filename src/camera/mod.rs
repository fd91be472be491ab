//! # Camera Module
//!
//! Finds the game's camera in its constant buffers and swaps in one that
//! looks along a cube face.
//!
//! ## Plain English
//!
//! ```text
//!   target write ──▶ observe() ──▶ shadow copy ──▶ scan for matrices
//!                                                        │
//!   target bind ──▶ try_substitute() ◀── cached offsets ─┘
//!                        │
//!                        ▼
//!           copy of the buffer, view + projection rewritten
//!           for the current face, uploaded to a tool-owned buffer
//! ```
//!
//! The eye position is kept, only the look direction and field of view
//! change. Everything else in the buffer is left bit-identical.

pub mod classifier;
pub mod orientation;
pub mod tracker;

use glam::{Mat4, Vec3};
use log::debug;

use crate::config::Config;
use crate::gpu::{BufferId, DeviceError, GpuDevice, ToolCall};
use classifier::{read_matrix, write_matrix, Handedness, MatrixLayout};
use orientation::{invert, WorldOrientation};
use tracker::{
    BufferTracker, BufferWrite, CameraLayout, Detection, Replacement, TrackedBuffer, UploadStamp,
};

// ============================================
// CUBE FACES
// ============================================

/// One of the six 90° views that tile the sphere.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CubeFace {
    Right,
    Left,
    Up,
    Down,
    Front,
    Back,
}

impl CubeFace {
    /// Capture order, which is also the cube layer order.
    pub const ALL: [CubeFace; 6] = [
        CubeFace::Right,
        CubeFace::Left,
        CubeFace::Up,
        CubeFace::Down,
        CubeFace::Front,
        CubeFace::Back,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }
}

// ============================================
// SUBSTITUTION PARAMETERS
// ============================================

/// 90° vertical field of view, so six square faces meet exactly.
pub const FACE_FOV_Y: f32 = std::f32::consts::FRAC_PI_2;

/// Clip planes of the substituted projection.
///
/// The game's own near/far can't be recovered from its matrix, so these are
/// fixed approximations.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClipPlanes {
    pub near: f32,
    pub far: f32,
}

impl Default for ClipPlanes {
    fn default() -> Self {
        Self {
            near: 0.1,
            far: 1000.0,
        }
    }
}

fn load_view(bytes: &[u8], offset: usize, layout: MatrixLayout) -> Option<Mat4> {
    let m = Mat4::from_cols_array(&read_matrix(bytes, offset)?);
    Some(match layout {
        MatrixLayout::RowMajor => m,
        MatrixLayout::Transposed => m.transpose(),
    })
}

fn look_at(handedness: Handedness, eye: Vec3, dir: Vec3, up: Vec3) -> Mat4 {
    match handedness {
        Handedness::Left => Mat4::look_at_lh(eye, eye + dir, up),
        Handedness::Right => Mat4::look_at_rh(eye, eye + dir, up),
    }
}

fn face_projection(handedness: Handedness, clip: ClipPlanes) -> Mat4 {
    match handedness {
        Handedness::Left => Mat4::perspective_lh(FACE_FOV_Y, 1.0, clip.near, clip.far),
        Handedness::Right => Mat4::perspective_rh(FACE_FOV_Y, 1.0, clip.near, clip.far),
    }
}

/// Rewrites the camera matrices in a copy of `bytes` to look along `face`.
///
/// Returns `None` (pass through) if the view is singular or a slot doesn't
/// fit the buffer.
pub fn substitute(
    bytes: &[u8],
    layout: &CameraLayout,
    face: CubeFace,
    orientation: &WorldOrientation,
    clip: ClipPlanes,
) -> Option<Vec<u8>> {
    let mut out = bytes.to_vec();
    // The view has to agree with the projection it is paired with
    let handedness = layout
        .projection
        .map_or(orientation.handedness(), |slot| slot.handedness);

    if let Some(slot) = layout.view {
        let view = load_view(bytes, slot.offset, slot.layout)?;
        let eye = invert(&view)?.w_axis.truncate();
        let (dir, up) = orientation.face_basis(face);

        let mut face_view = look_at(handedness, eye, dir, up);
        if slot.layout == MatrixLayout::Transposed {
            face_view = face_view.transpose();
        }
        if !write_matrix(&mut out, slot.offset, &face_view.to_cols_array()) {
            return None;
        }
    }

    if let Some(slot) = layout.projection {
        let projection = face_projection(slot.handedness, clip);
        if !write_matrix(&mut out, slot.offset, &projection.to_cols_array()) {
            return None;
        }
    }

    Some(out)
}

// ============================================
// CAMERA CONTROLLER
// ============================================

/// Counters for the camera path.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CameraStats {
    pub substitutions: u64,
    pub uploads: u64,
    pub uploads_skipped: u64,
}

/// Owns the tracker, the detected orientation and the current face request.
pub struct CameraController {
    tracker: BufferTracker,
    orientation: WorldOrientation,
    epsilon: f32,
    clip: ClipPlanes,

    target_face: CubeFace,
    bypass: bool,

    stats: CameraStats,
}

impl CameraController {
    pub fn new(config: &Config) -> Self {
        Self {
            tracker: BufferTracker::new(config.max_tracked_buffer_size),
            orientation: WorldOrientation::default(),
            epsilon: config.matrix_epsilon,
            clip: ClipPlanes {
                near: config.near_plane,
                far: config.far_plane,
            },
            target_face: CubeFace::Right,
            // Nothing is substituted until the scheduler asks for a face
            bypass: true,
            stats: CameraStats::default(),
        }
    }

    /// Records a target write and scans the buffer if it isn't a camera yet.
    pub fn observe(&mut self, id: BufferId, declared_size: usize, write: BufferWrite<'_>) {
        if let Some(buffer) = self.tracker.record_write(id, declared_size, write) {
            evaluate(buffer, self.epsilon, &mut self.orientation);
        }
    }

    /// Returns the replacement to bind instead of `id`, if it is a camera.
    pub fn try_substitute<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        id: BufferId,
    ) -> Result<Option<BufferId>, DeviceError> {
        if self.bypass {
            return Ok(None);
        }
        self.tracker.release_retired(device);

        let call = ToolCall::issue();
        let needs_readback = self.tracker.get(id).map_or(true, |b| b.bytes().is_empty());
        if needs_readback {
            match self.tracker.read_back(device, &call, id)? {
                Some(buffer) => evaluate(buffer, self.epsilon, &mut self.orientation),
                None => return Ok(None),
            }
        }

        let Some(buffer) = self.tracker.get_mut(id) else {
            return Ok(None);
        };
        let Detection::Camera(layout) = buffer.detection else {
            return Ok(None);
        };

        let face = self.target_face;
        let stamp = UploadStamp {
            generation: buffer.generation(),
            face,
            world_up: self.orientation.world_up(),
            handedness: self.orientation.handedness(),
        };
        if let Some(replacement) = &buffer.replacement {
            if replacement.uploaded == Some(stamp) {
                self.stats.uploads_skipped += 1;
                self.stats.substitutions += 1;
                return Ok(Some(replacement.buffer));
            }
        }

        let Some(bytes) = substitute(buffer.bytes(), &layout, face, &self.orientation, self.clip)
        else {
            return Ok(None);
        };

        let mut replacement = match buffer.replacement.take() {
            Some(existing) if existing.capacity >= bytes.len() => existing,
            stale => {
                if let Some(old) = stale {
                    device.release_buffer(old.buffer);
                }
                Replacement {
                    buffer: device.create_upload_buffer(bytes.len())?,
                    capacity: bytes.len(),
                    uploaded: None,
                }
            }
        };

        if let Err(e) = device.write_buffer(&call, replacement.buffer, &bytes) {
            replacement.uploaded = None;
            buffer.replacement = Some(replacement);
            return Err(e);
        }
        replacement.uploaded = Some(stamp);
        buffer.replacement = Some(replacement);

        self.stats.uploads += 1;
        self.stats.substitutions += 1;
        Ok(Some(replacement.buffer))
    }

    /// The pure substitution algorithm with this controller's orientation.
    pub fn substitute_bytes(
        &self,
        bytes: &[u8],
        layout: &CameraLayout,
        face: CubeFace,
    ) -> Option<Vec<u8>> {
        substitute(bytes, layout, face, &self.orientation, self.clip)
    }

    pub fn set_target_face(&mut self, face: CubeFace) {
        self.target_face = face;
    }

    pub fn target_face(&self) -> CubeFace {
        self.target_face
    }

    pub fn set_bypass(&mut self, bypass: bool) {
        self.bypass = bypass;
    }

    pub fn bypass(&self) -> bool {
        self.bypass
    }

    /// Forgets every buffer and the detected orientation.
    pub fn reset<D: GpuDevice + ?Sized>(&mut self, device: &mut D) {
        self.tracker.clear(device);
        self.orientation = WorldOrientation::default();
        debug!("camera state reset");
    }

    /// Drops one destroyed buffer.
    pub fn forget<D: GpuDevice + ?Sized>(&mut self, device: &mut D, id: BufferId) {
        self.tracker.forget(device, id);
    }

    pub fn tracker(&self) -> &BufferTracker {
        &self.tracker
    }

    pub fn orientation(&self) -> &WorldOrientation {
        &self.orientation
    }

    pub fn stats(&self) -> CameraStats {
        self.stats
    }
}

/// Scans a buffer that isn't known to be a camera yet.
fn evaluate(buffer: &mut TrackedBuffer, eps: f32, orientation: &mut WorldOrientation) {
    if buffer.is_camera() {
        return;
    }

    let Some(layout) = CameraLayout::detect(buffer.bytes(), eps) else {
        buffer.detection = Detection::NotCamera;
        return;
    };

    if let Some(slot) = layout.view {
        if let Some(view) = load_view(buffer.bytes(), slot.offset, slot.layout) {
            orientation.observe_view(&view);
        }
    }
    if let Some(slot) = layout.projection {
        orientation.observe_projection(slot.handedness);
    }

    debug!(
        "camera buffer {:#x}: view {:?}, projection {:?}",
        buffer.id().0,
        layout.view,
        layout.projection
    );
    buffer.detection = Detection::Camera(layout);
}

// ============================================
// TESTS
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::SoftwareDevice;

    fn camera_bytes(view: Mat4, projection: Mat4) -> Vec<u8> {
        let mut floats = [0.25f32; 64];
        floats[..16].copy_from_slice(&view.to_cols_array());
        floats[16..32].copy_from_slice(&projection.to_cols_array());
        bytemuck::cast_slice::<f32, u8>(&floats).to_vec()
    }

    fn lh_camera() -> Vec<u8> {
        let eye = Vec3::new(0.0, 5.0, 0.0);
        camera_bytes(
            Mat4::look_at_lh(eye, eye + Vec3::Z, Vec3::Y),
            Mat4::perspective_lh(1.0, 16.0 / 9.0, 0.5, 300.0),
        )
    }

    fn armed(face: CubeFace) -> CameraController {
        let mut controller = CameraController::new(&Config::default());
        controller.set_bypass(false);
        controller.set_target_face(face);
        controller
    }

    #[test]
    fn test_cube_face_indices() {
        for (i, face) in CubeFace::ALL.iter().enumerate() {
            assert_eq!(face.index(), i);
            assert_eq!(CubeFace::from_index(i), Some(*face));
        }
        assert_eq!(CubeFace::from_index(6), None);
    }

    #[test]
    fn test_observe_detects_camera() {
        let mut controller = armed(CubeFace::Front);
        let bytes = lh_camera();
        controller.observe(BufferId(1), bytes.len(), BufferWrite::full(&bytes));

        let buffer = controller.tracker().get(BufferId(1)).unwrap();
        let layout = buffer.layout().unwrap();
        assert_eq!(layout.view.unwrap().offset, 0);
        assert_eq!(layout.projection.unwrap().offset, 16);
        assert!(controller.orientation().up_detected());
        assert_eq!(controller.orientation().handedness(), Handedness::Left);
    }

    #[test]
    fn test_detection_is_sticky() {
        let mut controller = armed(CubeFace::Front);
        let bytes = lh_camera();
        controller.observe(BufferId(1), bytes.len(), BufferWrite::full(&bytes));
        let first = controller.tracker().get(BufferId(1)).unwrap().detection();

        // Garbage written over the matrices doesn't trigger a rescan
        controller.observe(BufferId(1), bytes.len(), BufferWrite::range(0, &[0xff; 32]));
        controller.observe(BufferId(1), bytes.len(), BufferWrite::full(&bytes));
        assert_eq!(controller.tracker().get(BufferId(1)).unwrap().detection(), first);
    }

    #[test]
    fn test_not_camera_is_rescanned() {
        let mut controller = armed(CubeFace::Front);
        let zeros = vec![0u8; 256];
        controller.observe(BufferId(1), 256, BufferWrite::full(&zeros));
        assert_eq!(
            controller.tracker().get(BufferId(1)).unwrap().detection(),
            Detection::NotCamera
        );

        let bytes = lh_camera();
        controller.observe(BufferId(1), 256, BufferWrite::full(&bytes));
        assert!(controller.tracker().get(BufferId(1)).unwrap().is_camera());
    }

    #[test]
    fn test_bypass_passes_through() {
        let mut device = SoftwareDevice::new();
        let mut controller = armed(CubeFace::Front);
        let bytes = lh_camera();
        controller.observe(BufferId(1), bytes.len(), BufferWrite::full(&bytes));

        controller.set_bypass(true);
        assert_eq!(controller.try_substitute(&mut device, BufferId(1)).unwrap(), None);
    }

    #[test]
    fn test_upload_skipped_when_nothing_changed() {
        let mut device = SoftwareDevice::new();
        let mut controller = armed(CubeFace::Left);
        let bytes = lh_camera();
        controller.observe(BufferId(1), bytes.len(), BufferWrite::full(&bytes));

        let first = controller.try_substitute(&mut device, BufferId(1)).unwrap();
        let second = controller.try_substitute(&mut device, BufferId(1)).unwrap();
        assert!(first.is_some());
        assert_eq!(first, second);
        assert_eq!(device.stats().tool_writes, 1);

        // New face: same buffer, fresh upload
        controller.set_target_face(CubeFace::Right);
        assert_eq!(controller.try_substitute(&mut device, BufferId(1)).unwrap(), first);
        assert_eq!(device.stats().tool_writes, 2);

        // New write: fresh upload
        controller.observe(BufferId(1), bytes.len(), BufferWrite::full(&bytes));
        controller.try_substitute(&mut device, BufferId(1)).unwrap();
        assert_eq!(device.stats().tool_writes, 3);
        assert_eq!(controller.stats().uploads_skipped, 1);
    }

    #[test]
    fn test_late_handedness_forces_fresh_upload() {
        let mut device = SoftwareDevice::new();
        let mut controller = armed(CubeFace::Front);
        let eye = Vec3::new(2.0, 1.0, -4.0);

        // View only: handedness is still the left-handed default
        let mut floats = [0.25f32; 32];
        floats[..16].copy_from_slice(&Mat4::look_at_rh(eye, eye + Vec3::NEG_Z, Vec3::Y).to_cols_array());
        let view_only = bytemuck::cast_slice::<f32, u8>(&floats).to_vec();
        controller.observe(BufferId(1), view_only.len(), BufferWrite::full(&view_only));

        let replacement = controller.try_substitute(&mut device, BufferId(1)).unwrap().unwrap();
        let first = read_matrix(device.buffer_contents(replacement).unwrap(), 0).unwrap();
        let lh_front = Mat4::look_at_lh(eye, eye + Vec3::Z, Vec3::Y);
        assert!(Mat4::from_cols_array(&first).abs_diff_eq(lh_front, 1e-5));

        // Another buffer reveals a right-handed projection
        let rh = camera_bytes(
            Mat4::look_at_rh(Vec3::ZERO, Vec3::NEG_Z, Vec3::Y),
            Mat4::perspective_rh(1.0, 1.0, 0.1, 10.0),
        );
        controller.observe(BufferId(2), rh.len(), BufferWrite::full(&rh));
        assert_eq!(controller.orientation().handedness(), Handedness::Right);

        // Same generation, same face, but the orientation moved on
        let again = controller.try_substitute(&mut device, BufferId(1)).unwrap().unwrap();
        assert_eq!(again, replacement);
        assert_eq!(device.stats().tool_writes, 2);
        assert_eq!(controller.stats().uploads_skipped, 0);

        let second = read_matrix(device.buffer_contents(again).unwrap(), 0).unwrap();
        let rh_front = Mat4::look_at_rh(eye, eye + Vec3::NEG_Z, Vec3::Y);
        assert!(Mat4::from_cols_array(&second).abs_diff_eq(rh_front, 1e-5));
    }

    #[test]
    fn test_view_follows_its_own_projection() {
        let mut controller = armed(CubeFace::Right);
        let lh = lh_camera();
        controller.observe(BufferId(1), lh.len(), BufferWrite::full(&lh));
        assert_eq!(controller.orientation().handedness(), Handedness::Left);

        let eye = Vec3::new(-1.0, 3.0, 2.0);
        let rh = camera_bytes(
            Mat4::look_at_rh(eye, eye + Vec3::NEG_Z, Vec3::Y),
            Mat4::perspective_rh(1.0, 1.0, 0.1, 10.0),
        );
        let layout = CameraLayout::detect(&rh, 0.1).unwrap();
        assert_eq!(layout.projection.unwrap().handedness, Handedness::Right);

        let out = controller.substitute_bytes(&rh, &layout, CubeFace::Right).unwrap();
        let view = Mat4::from_cols_array(&read_matrix(&out, 0).unwrap());
        assert!(view.abs_diff_eq(Mat4::look_at_rh(eye, eye + Vec3::X, Vec3::Y), 1e-5));
        let projection = Mat4::from_cols_array(&read_matrix(&out, 16).unwrap());
        let expected = face_projection(Handedness::Right, ClipPlanes::default());
        assert!(projection.abs_diff_eq(expected, 1e-5));
    }

    #[test]
    fn test_unwritten_buffer_is_read_back() {
        let mut device = SoftwareDevice::new();
        let id = device.create_target_buffer(&lh_camera());
        let mut controller = armed(CubeFace::Back);

        let replacement = controller.try_substitute(&mut device, id).unwrap().unwrap();
        assert_ne!(replacement, id);
        assert_eq!(device.stats().readbacks, 1);

        // Second bind uses the shadow copy
        controller.try_substitute(&mut device, id).unwrap();
        assert_eq!(device.stats().readbacks, 1);
    }

    #[test]
    fn test_singular_view_passes_through() {
        let mut controller = armed(CubeFace::Front);
        // Row-major fingerprint with a zero rotation block
        let mut floats = [0.0f32; 16];
        floats[15] = 1.0;
        let bytes = bytemuck::cast_slice::<f32, u8>(&floats).to_vec();
        let layout = CameraLayout::detect(&bytes, 0.1).unwrap();
        assert_eq!(controller.substitute_bytes(&bytes, &layout, CubeFace::Front), None);

        let mut device = SoftwareDevice::new();
        controller.observe(BufferId(1), bytes.len(), BufferWrite::full(&bytes));
        assert_eq!(controller.try_substitute(&mut device, BufferId(1)).unwrap(), None);
    }

    #[test]
    fn test_transposed_view_stays_transposed() {
        let eye = Vec3::new(1.0, 2.0, 3.0);
        let view = Mat4::look_at_rh(eye, eye + Vec3::NEG_Z, Vec3::Y);
        let bytes = camera_bytes(view.transpose(), Mat4::perspective_rh(1.0, 1.0, 0.1, 10.0));

        let mut controller = armed(CubeFace::Right);
        controller.observe(BufferId(1), bytes.len(), BufferWrite::full(&bytes));
        let layout = *controller.tracker().get(BufferId(1)).unwrap().layout().unwrap();
        assert_eq!(layout.view.unwrap().layout, MatrixLayout::Transposed);

        let out = controller.substitute_bytes(&bytes, &layout, CubeFace::Right).unwrap();
        let written = Mat4::from_cols_array(&read_matrix(&out, 0).unwrap()).transpose();
        let expected = Mat4::look_at_rh(eye, eye + Vec3::X, Vec3::Y);
        assert!(written.abs_diff_eq(expected, 1e-5));
    }

    #[test]
    fn test_reset_releases_replacements() {
        let mut device = SoftwareDevice::new();
        let mut controller = armed(CubeFace::Up);
        let bytes = lh_camera();
        controller.observe(BufferId(1), bytes.len(), BufferWrite::full(&bytes));
        controller.try_substitute(&mut device, BufferId(1)).unwrap();
        assert_eq!(device.live_resources(), 1);

        controller.reset(&mut device);
        assert_eq!(device.live_resources(), 0);
        assert!(controller.tracker().is_empty());
        assert!(!controller.orientation().up_detected());
    }
}
