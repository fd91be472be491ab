//! # Buffer Tracker
//!
//! Keeps a private shadow copy of every small constant buffer the target
//! writes, plus what we've learned about it.
//!
//! ## Plain English
//!
//! GPU memory can't be peeked at cheaply, so we remember what the game put
//! into each buffer as it writes it (the passive path). If the game binds a
//! buffer we've never seen written, we copy it to a staging buffer and read
//! it back once (the active path).
//!
//! ## Positional stability
//!
//! Once a buffer is flagged as a camera, its matrix offsets are cached and
//! never rescanned. If a game repacks a buffer's layout without creating a
//! new buffer, the cached offsets are silently wrong. Nothing here detects
//! that; a size change is the only thing that forces a rescan.

use std::collections::HashMap;

use log::{debug, trace};

use super::classifier::{
    find_projection_matrix_outside, find_view_matrix, floats_from_bytes, Handedness,
    MatrixLayout,
};
use super::orientation::WorldUp;
use super::CubeFace;
use crate::gpu::{BufferId, DeviceError, GpuDevice, ToolCall};

// ============================================
// WRITES
// ============================================

/// Bytes the target wrote into a buffer, starting at `offset`.
///
/// A full update is simply a write at offset 0.
#[derive(Clone, Copy, Debug)]
pub struct BufferWrite<'a> {
    pub offset: usize,
    pub data: &'a [u8],
}

impl<'a> BufferWrite<'a> {
    pub fn full(data: &'a [u8]) -> Self {
        Self { offset: 0, data }
    }

    pub fn range(offset: usize, data: &'a [u8]) -> Self {
        Self { offset, data }
    }
}

// ============================================
// DETECTION STATE
// ============================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ViewSlot {
    /// Float offset of the first element
    pub offset: usize,
    pub layout: MatrixLayout,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProjectionSlot {
    /// Float offset of the first element
    pub offset: usize,
    pub handedness: Handedness,
}

/// Where the camera matrices live inside a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CameraLayout {
    pub view: Option<ViewSlot>,
    pub projection: Option<ProjectionSlot>,
}

impl CameraLayout {
    /// Scans buffer bytes for a view and a projection.
    ///
    /// Both scans go in increasing offset order and the first match wins.
    /// The projection scan ignores windows overlapping the detected view.
    pub fn detect(bytes: &[u8], eps: f32) -> Option<Self> {
        let floats = floats_from_bytes(bytes);

        let view = find_view_matrix(&floats, eps).map(|(offset, layout)| ViewSlot { offset, layout });
        let projection =
            find_projection_matrix_outside(&floats, eps, view.map(|v| v.offset))
                .map(|(offset, handedness)| ProjectionSlot { offset, handedness });

        if view.is_none() && projection.is_none() {
            return None;
        }
        Some(Self { view, projection })
    }
}

/// What we know about a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Detection {
    /// Never scanned
    Unevaluated,
    /// Scanned, nothing found; rescanned on the next write
    NotCamera,
    /// Sticky
    Camera(CameraLayout),
}

/// How the current shadow bytes were obtained.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShadowSource {
    /// Captured from a target write
    Write,
    /// Copied back from the GPU
    Readback,
}

/// Everything a replacement's contents were derived from.
///
/// A replacement is reused only while all of it is unchanged.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UploadStamp {
    pub generation: u64,
    pub face: CubeFace,
    pub world_up: WorldUp,
    pub handedness: Handedness,
}

/// The tool-owned buffer handed to the target instead of the original.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Replacement {
    pub buffer: BufferId,
    pub capacity: usize,
    /// Stamp of the last upload
    pub uploaded: Option<UploadStamp>,
}

// ============================================
// TRACKED BUFFER
// ============================================

/// Per-buffer record.
#[derive(Debug)]
pub struct TrackedBuffer {
    id: BufferId,
    bytes: Vec<u8>,
    pub(crate) detection: Detection,
    generation: u64,
    source: ShadowSource,
    pub(crate) replacement: Option<Replacement>,
}

impl TrackedBuffer {
    fn new(id: BufferId, size: usize, source: ShadowSource) -> Self {
        Self {
            id,
            bytes: vec![0; size],
            detection: Detection::Unevaluated,
            generation: 0,
            source,
            replacement: None,
        }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Shadow copy; its length is always the declared size.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn detection(&self) -> Detection {
        self.detection
    }

    pub fn layout(&self) -> Option<&CameraLayout> {
        match &self.detection {
            Detection::Camera(layout) => Some(layout),
            _ => None,
        }
    }

    pub fn is_camera(&self) -> bool {
        self.layout().is_some()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn source(&self) -> ShadowSource {
        self.source
    }

    pub fn replacement(&self) -> Option<&Replacement> {
        self.replacement.as_ref()
    }

    /// Copies `data` in at `offset`, clipped to the declared size.
    fn patch(&mut self, offset: usize, data: &[u8], source: ShadowSource) {
        if offset < self.bytes.len() {
            let len = data.len().min(self.bytes.len() - offset);
            self.bytes[offset..offset + len].copy_from_slice(&data[..len]);
        }
        self.generation += 1;
        self.source = source;
    }
}

// ============================================
// BUFFER TRACKER
// ============================================

/// Owned map of tracked buffers.
pub struct BufferTracker {
    buffers: HashMap<BufferId, TrackedBuffer>,

    /// Buffers larger than this are never tracked
    ceiling: usize,

    /// Reusable readback buffer, `ceiling` bytes
    staging: Option<BufferId>,

    /// Replacement buffers outgrown by their originals, released on the next
    /// device access
    retired: Vec<BufferId>,
}

impl BufferTracker {
    pub fn new(ceiling: usize) -> Self {
        Self {
            buffers: HashMap::new(),
            ceiling,
            staging: None,
            retired: Vec::new(),
        }
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Passive path: records a target write.
    ///
    /// Returns `None` when the buffer is not tracked (empty or above the
    /// ceiling).
    pub fn record_write(
        &mut self,
        id: BufferId,
        declared_size: usize,
        write: BufferWrite<'_>,
    ) -> Option<&mut TrackedBuffer> {
        if declared_size == 0 || declared_size > self.ceiling {
            // A buffer that grew past the ceiling stops being tracked
            if let Some(old) = self.buffers.remove(&id) {
                self.retired.extend(old.replacement.map(|r| r.buffer));
            }
            return None;
        }

        let buffer = self
            .buffers
            .entry(id)
            .or_insert_with(|| TrackedBuffer::new(id, declared_size, ShadowSource::Write));

        if buffer.bytes.len() != declared_size {
            debug!(
                "buffer {:#x} resized {} -> {} bytes, forgetting detection",
                id.0,
                buffer.bytes.len(),
                declared_size
            );
            buffer.bytes.resize(declared_size, 0);
            buffer.detection = Detection::Unevaluated;

            if let Some(replacement) = buffer.replacement.take() {
                if replacement.capacity >= declared_size {
                    buffer.replacement = Some(Replacement {
                        uploaded: None,
                        ..replacement
                    });
                } else {
                    self.retired.push(replacement.buffer);
                }
            }
        }

        buffer.patch(write.offset, write.data, ShadowSource::Write);
        trace!(
            "buffer {:#x}: {} bytes at {} (gen {})",
            id.0,
            write.data.len(),
            write.offset,
            buffer.generation
        );
        Some(buffer)
    }

    /// Active path: copies a buffer back from the GPU.
    ///
    /// Returns `Ok(None)` when the device doesn't know the buffer or it is
    /// above the ceiling.
    pub fn read_back<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        call: &ToolCall,
        id: BufferId,
    ) -> Result<Option<&mut TrackedBuffer>, DeviceError> {
        let size = match device.buffer_size(id) {
            Some(size) if size > 0 && size <= self.ceiling => size,
            _ => return Ok(None),
        };

        let staging = match self.staging {
            Some(staging) => staging,
            None => {
                let staging = device.create_staging_buffer(self.ceiling)?;
                self.staging = Some(staging);
                staging
            }
        };

        let mut bytes = vec![0u8; size];
        device.copy_buffer(call, id, staging, size)?;
        device.read_buffer(call, staging, &mut bytes)?;
        debug!("read back {} bytes from buffer {:#x}", size, id.0);

        let buffer = self
            .buffers
            .entry(id)
            .or_insert_with(|| TrackedBuffer::new(id, size, ShadowSource::Readback));
        if buffer.bytes.len() != size {
            buffer.bytes.resize(size, 0);
            buffer.detection = Detection::Unevaluated;
        }
        buffer.patch(0, &bytes, ShadowSource::Readback);
        Ok(Some(buffer))
    }

    pub fn get(&self, id: BufferId) -> Option<&TrackedBuffer> {
        self.buffers.get(&id)
    }

    pub fn get_mut(&mut self, id: BufferId) -> Option<&mut TrackedBuffer> {
        self.buffers.get_mut(&id)
    }

    /// Drops a destroyed buffer and its replacement.
    pub fn forget<D: GpuDevice + ?Sized>(&mut self, device: &mut D, id: BufferId) {
        if let Some(old) = self.buffers.remove(&id) {
            if let Some(replacement) = old.replacement {
                device.release_buffer(replacement.buffer);
            }
        }
    }

    /// Releases replacements outgrown since the last call.
    pub fn release_retired<D: GpuDevice + ?Sized>(&mut self, device: &mut D) {
        for buffer in self.retired.drain(..) {
            device.release_buffer(buffer);
        }
    }

    /// Forgets every buffer and releases every tool-owned buffer.
    pub fn clear<D: GpuDevice + ?Sized>(&mut self, device: &mut D) {
        self.release_retired(device);
        for (_, old) in self.buffers.drain() {
            if let Some(replacement) = old.replacement {
                device.release_buffer(replacement.buffer);
            }
        }
        if let Some(staging) = self.staging.take() {
            device.release_buffer(staging);
        }
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Number of buffers currently flagged as cameras.
    pub fn camera_count(&self) -> usize {
        self.buffers.values().filter(|b| b.is_camera()).count()
    }
}

// ============================================
// TESTS
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::SoftwareDevice;

    #[test]
    fn test_full_write_allocates_shadow() {
        let mut tracker = BufferTracker::new(4096);
        let buffer = tracker
            .record_write(BufferId(1), 8, BufferWrite::full(&[1, 2, 3, 4, 5, 6, 7, 8]))
            .unwrap();
        assert_eq!(buffer.bytes(), &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(buffer.generation(), 1);
        assert_eq!(buffer.detection(), Detection::Unevaluated);
    }

    #[test]
    fn test_partial_write_patches_only_its_range() {
        let mut tracker = BufferTracker::new(4096);
        tracker.record_write(BufferId(1), 8, BufferWrite::full(&[1; 8]));
        let buffer = tracker
            .record_write(BufferId(1), 8, BufferWrite::range(2, &[9, 9]))
            .unwrap();
        assert_eq!(buffer.bytes(), &[1, 1, 9, 9, 1, 1, 1, 1]);
        assert_eq!(buffer.generation(), 2);
    }

    #[test]
    fn test_write_is_clipped_to_declared_size() {
        let mut tracker = BufferTracker::new(4096);
        let buffer = tracker
            .record_write(BufferId(1), 4, BufferWrite::range(2, &[7, 7, 7, 7]))
            .unwrap();
        assert_eq!(buffer.bytes(), &[0, 0, 7, 7]);

        let buffer = tracker
            .record_write(BufferId(1), 4, BufferWrite::range(10, &[5]))
            .unwrap();
        assert_eq!(buffer.bytes(), &[0, 0, 7, 7]);
    }

    #[test]
    fn test_buffer_above_ceiling_is_ignored() {
        let mut tracker = BufferTracker::new(4096);
        let big = vec![0u8; 4100];
        assert!(tracker
            .record_write(BufferId(1), big.len(), BufferWrite::full(&big))
            .is_none());
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_resize_forgets_detection() {
        let mut tracker = BufferTracker::new(4096);
        let buffer = tracker
            .record_write(BufferId(1), 64, BufferWrite::full(&[0; 64]))
            .unwrap();
        buffer.detection = Detection::NotCamera;

        let buffer = tracker
            .record_write(BufferId(1), 128, BufferWrite::full(&[0; 128]))
            .unwrap();
        assert_eq!(buffer.bytes().len(), 128);
        assert_eq!(buffer.detection(), Detection::Unevaluated);
    }

    #[test]
    fn test_read_back_uses_one_staging_buffer() {
        let mut device = SoftwareDevice::new();
        let a = device.create_target_buffer(&[3; 32]);
        let b = device.create_target_buffer(&[4; 16]);
        let call = ToolCall::issue();

        let mut tracker = BufferTracker::new(4096);
        let buffer = tracker.read_back(&mut device, &call, a).unwrap().unwrap();
        assert_eq!(buffer.bytes(), &[3; 32]);
        assert_eq!(buffer.source(), ShadowSource::Readback);

        let live = device.live_resources();
        tracker.read_back(&mut device, &call, b).unwrap().unwrap();
        assert_eq!(device.live_resources(), live);
        assert_eq!(device.stats().readbacks, 2);
    }

    #[test]
    fn test_read_back_refuses_large_and_unknown() {
        let mut device = SoftwareDevice::new();
        let big = device.create_target_buffer(&vec![0; 8192]);
        let call = ToolCall::issue();

        let mut tracker = BufferTracker::new(4096);
        assert!(tracker.read_back(&mut device, &call, big).unwrap().is_none());
        assert!(tracker
            .read_back(&mut device, &call, BufferId(0xdead))
            .unwrap()
            .is_none());
        assert_eq!(device.stats().readbacks, 0);
    }

    #[test]
    fn test_camera_layout_detection() {
        use glam::{Mat4, Vec3};

        let mut floats = [2.0f32; 48];
        let eye = Vec3::new(1.0, 2.0, 3.0);
        let view = Mat4::look_at_rh(eye, eye + Vec3::NEG_Z, Vec3::Y).transpose();
        floats[16..32].copy_from_slice(&view.to_cols_array());
        let bytes = bytemuck::cast_slice::<f32, u8>(&floats);

        let layout = CameraLayout::detect(bytes, 0.1).unwrap();
        assert_eq!(
            layout.view,
            Some(ViewSlot {
                offset: 16,
                layout: MatrixLayout::Transposed
            })
        );
        assert_eq!(layout.projection, None);

        assert_eq!(CameraLayout::detect(&[0u8; 192], 0.1), None);
    }
}
