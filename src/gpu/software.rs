//! # Software Device
//!
//! A CPU implementation of [`GpuDevice`].
//!
//! ## Plain English
//!
//! This is a pretend graphics card that keeps every buffer and texture in
//! ordinary memory. It does three jobs:
//!
//! 1. Stands in for the platform adapter in tests and demos, so synthetic
//!    "game" buffers can be fed through the real capture core.
//! 2. Provides a reference projection kernel (cube → equirectangular) that
//!    follows the same contract as the GPU compute shader.
//! 3. Lets tests inject failures (out of memory, missing kernels) and count
//!    what the core did (readbacks, uploads, state saves).

use std::collections::HashMap;
use std::f32::consts::PI;

use rayon::prelude::*;

use super::{
    BufferId, DeviceError, GpuDevice, Region, TextureDesc, TextureFormat, TextureId, ToolCall,
};
use crate::encoder::rgba_to_nv12;

// ============================================
// RESOURCES
// ============================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BufferKind {
    /// Created by the (simulated) target application
    Target,
    /// CPU-writable replacement buffer
    Upload,
    /// CPU-readable staging buffer
    Staging,
}

enum Resource {
    Buffer { bytes: Vec<u8>, kind: BufferKind },
    Texture { desc: TextureDesc, data: Vec<u8> },
}

/// Counters describing what the core asked the device to do.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SoftwareDeviceStats {
    pub tool_writes: u64,
    pub buffer_copies: u64,
    pub readbacks: u64,
    pub texture_copies: u64,
    pub dispatches: u64,
    pub conversions: u64,
    pub state_saves: u64,
    pub state_restores: u64,
}

// ============================================
// SOFTWARE DEVICE
// ============================================

/// In-memory graphics device.
pub struct SoftwareDevice {
    resources: HashMap<u64, Resource>,
    next_id: u64,

    /// Tool allocations still allowed before creation starts failing
    allocation_budget: Option<usize>,
    kernels_available: bool,

    state_depth: u32,
    stats: SoftwareDeviceStats,
}

impl SoftwareDevice {
    pub fn new() -> Self {
        Self {
            resources: HashMap::new(),
            // Start away from zero so a zeroed id never names anything
            next_id: 0x1000,
            allocation_budget: None,
            kernels_available: true,
            state_depth: 0,
            stats: SoftwareDeviceStats::default(),
        }
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn charge_allocation(&mut self, what: &'static str) -> Result<(), DeviceError> {
        match self.allocation_budget {
            Some(0) => Err(DeviceError::ResourceCreation {
                what,
                reason: "out of memory".to_string(),
            }),
            Some(ref mut left) => {
                *left -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }

    // ----------------------------------------
    // Simulated target-application side
    // ----------------------------------------

    /// Creates a buffer owned by the simulated game.
    pub fn create_target_buffer(&mut self, bytes: &[u8]) -> BufferId {
        let id = self.allocate_id();
        self.resources.insert(
            id,
            Resource::Buffer {
                bytes: bytes.to_vec(),
                kind: BufferKind::Target,
            },
        );
        BufferId(id)
    }

    /// Overwrites a buffer behind the core's back (a write the hooks never see).
    pub fn set_buffer_contents(&mut self, buffer: BufferId, bytes: &[u8]) -> Result<(), DeviceError> {
        match self.resources.get_mut(&buffer.0) {
            Some(Resource::Buffer { bytes: stored, .. }) => {
                if bytes.len() != stored.len() {
                    return Err(DeviceError::OutOfBounds(format!(
                        "buffer is {} bytes, got {}",
                        stored.len(),
                        bytes.len()
                    )));
                }
                stored.copy_from_slice(bytes);
                Ok(())
            }
            _ => Err(DeviceError::UnknownResource(buffer.0)),
        }
    }

    /// Current contents of any buffer.
    pub fn buffer_contents(&self, buffer: BufferId) -> Option<&[u8]> {
        match self.resources.get(&buffer.0) {
            Some(Resource::Buffer { bytes, .. }) => Some(bytes),
            _ => None,
        }
    }

    /// Creates a render target the simulated game draws into.
    pub fn create_back_buffer(&mut self, width: u32, height: u32) -> TextureId {
        let desc = TextureDesc::rgba(width, height, super::TextureUsage::Face);
        let id = self.allocate_id();
        self.resources.insert(
            id,
            Resource::Texture {
                desc,
                data: vec![0; desc.format.layer_size(width, height)],
            },
        );
        TextureId(id)
    }

    /// Fills every pixel of layer 0 with one colour.
    pub fn fill_texture(&mut self, texture: TextureId, rgba: [u8; 4]) -> Result<(), DeviceError> {
        let (desc, data) = self.texture_mut(texture)?;
        if desc.format != TextureFormat::Rgba8Unorm {
            return Err(DeviceError::Backend("fill needs an RGBA texture".to_string()));
        }
        let layer = desc.format.layer_size(desc.width, desc.height);
        for pixel in data[..layer].chunks_exact_mut(4) {
            pixel.copy_from_slice(&rgba);
        }
        Ok(())
    }

    /// Current contents of any texture.
    pub fn texture_contents(&self, texture: TextureId) -> Option<&[u8]> {
        match self.resources.get(&texture.0) {
            Some(Resource::Texture { data, .. }) => Some(data),
            _ => None,
        }
    }

    pub fn texture_desc(&self, texture: TextureId) -> Option<TextureDesc> {
        match self.resources.get(&texture.0) {
            Some(Resource::Texture { desc, .. }) => Some(*desc),
            _ => None,
        }
    }

    // ----------------------------------------
    // Failure injection and inspection
    // ----------------------------------------

    /// Lets `count` more tool allocations succeed, then fails every one after.
    pub fn fail_allocations_after(&mut self, count: usize) {
        self.allocation_budget = Some(count);
    }

    /// Simulates a shader compile failure (or recovery).
    pub fn set_kernels_available(&mut self, available: bool) {
        self.kernels_available = available;
    }

    /// Number of live buffers and textures, including target-owned ones.
    pub fn live_resources(&self) -> usize {
        self.resources.len()
    }

    pub fn stats(&self) -> &SoftwareDeviceStats {
        &self.stats
    }

    pub fn state_saves(&self) -> u64 {
        self.stats.state_saves
    }

    pub fn state_restores(&self) -> u64 {
        self.stats.state_restores
    }

    fn texture(&self, texture: TextureId) -> Result<(&TextureDesc, &Vec<u8>), DeviceError> {
        match self.resources.get(&texture.0) {
            Some(Resource::Texture { desc, data }) => Ok((desc, data)),
            _ => Err(DeviceError::UnknownResource(texture.0)),
        }
    }

    fn texture_mut(
        &mut self,
        texture: TextureId,
    ) -> Result<(&TextureDesc, &mut Vec<u8>), DeviceError> {
        match self.resources.get_mut(&texture.0) {
            Some(Resource::Texture { desc, data }) => Ok((desc, data)),
            _ => Err(DeviceError::UnknownResource(texture.0)),
        }
    }

    fn buffer_bytes(&self, buffer: BufferId) -> Result<&Vec<u8>, DeviceError> {
        match self.resources.get(&buffer.0) {
            Some(Resource::Buffer { bytes, .. }) => Ok(bytes),
            _ => Err(DeviceError::UnknownResource(buffer.0)),
        }
    }

    fn buffer_bytes_mut(
        &mut self,
        buffer: BufferId,
        expected: BufferKind,
    ) -> Result<&mut Vec<u8>, DeviceError> {
        match self.resources.get_mut(&buffer.0) {
            Some(Resource::Buffer { bytes, kind }) if *kind == expected => Ok(bytes),
            Some(Resource::Buffer { kind, .. }) => Err(DeviceError::Backend(format!(
                "buffer {:#x} is {:?}, expected {:?}",
                buffer.0, kind, expected
            ))),
            _ => Err(DeviceError::UnknownResource(buffer.0)),
        }
    }

    fn create_buffer(&mut self, size: usize, kind: BufferKind) -> Result<BufferId, DeviceError> {
        let what = match kind {
            BufferKind::Staging => "staging buffer",
            _ => "upload buffer",
        };
        if size == 0 {
            return Err(DeviceError::ResourceCreation {
                what,
                reason: "zero-sized buffer".to_string(),
            });
        }
        self.charge_allocation(what)?;
        let id = self.allocate_id();
        self.resources.insert(
            id,
            Resource::Buffer {
                bytes: vec![0; size],
                kind,
            },
        );
        Ok(BufferId(id))
    }
}

impl Default for SoftwareDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuDevice for SoftwareDevice {
    fn buffer_size(&self, buffer: BufferId) -> Option<usize> {
        self.buffer_contents(buffer).map(<[u8]>::len)
    }

    fn create_upload_buffer(&mut self, size: usize) -> Result<BufferId, DeviceError> {
        self.create_buffer(size, BufferKind::Upload)
    }

    fn create_staging_buffer(&mut self, size: usize) -> Result<BufferId, DeviceError> {
        self.create_buffer(size, BufferKind::Staging)
    }

    fn write_buffer(
        &mut self,
        _call: &ToolCall,
        buffer: BufferId,
        bytes: &[u8],
    ) -> Result<(), DeviceError> {
        let stored = self.buffer_bytes_mut(buffer, BufferKind::Upload)?;
        if bytes.len() > stored.len() {
            return Err(DeviceError::OutOfBounds(format!(
                "write of {} bytes into {}-byte buffer",
                bytes.len(),
                stored.len()
            )));
        }
        stored[..bytes.len()].copy_from_slice(bytes);
        self.stats.tool_writes += 1;
        Ok(())
    }

    fn copy_buffer(
        &mut self,
        _call: &ToolCall,
        src: BufferId,
        dst: BufferId,
        len: usize,
    ) -> Result<(), DeviceError> {
        let source = self.buffer_bytes(src)?;
        if len > source.len() {
            return Err(DeviceError::OutOfBounds(format!(
                "copy of {} bytes from {}-byte buffer",
                len,
                source.len()
            )));
        }
        let chunk = source[..len].to_vec();
        let target = self.buffer_bytes_mut(dst, BufferKind::Staging)?;
        if len > target.len() {
            return Err(DeviceError::OutOfBounds(format!(
                "copy of {} bytes into {}-byte staging buffer",
                len,
                target.len()
            )));
        }
        target[..len].copy_from_slice(&chunk);
        self.stats.buffer_copies += 1;
        Ok(())
    }

    fn read_buffer(
        &mut self,
        _call: &ToolCall,
        buffer: BufferId,
        out: &mut [u8],
    ) -> Result<(), DeviceError> {
        let stored = self.buffer_bytes_mut(buffer, BufferKind::Staging)?;
        if out.len() > stored.len() {
            return Err(DeviceError::OutOfBounds(format!(
                "read of {} bytes from {}-byte staging buffer",
                out.len(),
                stored.len()
            )));
        }
        out.copy_from_slice(&stored[..out.len()]);
        self.stats.readbacks += 1;
        Ok(())
    }

    fn release_buffer(&mut self, buffer: BufferId) {
        if let Some(Resource::Buffer { kind, .. }) = self.resources.get(&buffer.0) {
            if *kind != BufferKind::Target {
                self.resources.remove(&buffer.0);
            }
        }
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureId, DeviceError> {
        if desc.width == 0 || desc.height == 0 || desc.layers == 0 {
            return Err(DeviceError::ResourceCreation {
                what: "texture",
                reason: format!("degenerate size {}x{}x{}", desc.width, desc.height, desc.layers),
            });
        }
        self.charge_allocation("texture")?;
        let id = self.allocate_id();
        let size = desc.format.layer_size(desc.width, desc.height) * desc.layers as usize;
        self.resources.insert(
            id,
            Resource::Texture {
                desc: *desc,
                data: vec![0; size],
            },
        );
        Ok(TextureId(id))
    }

    fn copy_texture_region(
        &mut self,
        src: TextureId,
        region: Region,
        dst: TextureId,
        dst_layer: u32,
    ) -> Result<(), DeviceError> {
        let (src_desc, src_data) = self.texture(src)?;
        if src_desc.format != TextureFormat::Rgba8Unorm
            || region.x + region.width > src_desc.width
            || region.y + region.height > src_desc.height
        {
            return Err(DeviceError::OutOfBounds(format!(
                "region {:?} outside {}x{} source",
                region, src_desc.width, src_desc.height
            )));
        }

        let src_pitch = src_desc.width as usize * 4;
        let row_len = region.width as usize * 4;
        let rows: Vec<u8> = (0..region.height as usize)
            .flat_map(|row| {
                let start = (region.y as usize + row) * src_pitch + region.x as usize * 4;
                src_data[start..start + row_len].iter().copied()
            })
            .collect();

        let (dst_desc, dst_data) = self.texture_mut(dst)?;
        if dst_desc.format != TextureFormat::Rgba8Unorm
            || dst_layer >= dst_desc.layers
            || region.width > dst_desc.width
            || region.height > dst_desc.height
        {
            return Err(DeviceError::OutOfBounds(format!(
                "region {:?} doesn't fit layer {} of {}x{}x{} destination",
                region, dst_layer, dst_desc.width, dst_desc.height, dst_desc.layers
            )));
        }

        let dst_pitch = dst_desc.width as usize * 4;
        let layer_offset = dst_desc.format.layer_size(dst_desc.width, dst_desc.height)
            * dst_layer as usize;
        for (row, chunk) in rows.chunks_exact(row_len).enumerate() {
            let start = layer_offset + row * dst_pitch;
            dst_data[start..start + row_len].copy_from_slice(chunk);
        }

        self.stats.texture_copies += 1;
        Ok(())
    }

    fn dispatch_projection(
        &mut self,
        cube: TextureId,
        output: TextureId,
        groups: [u32; 2],
    ) -> Result<(), DeviceError> {
        if !self.kernels_available {
            return Err(DeviceError::KernelUnavailable("projection".to_string()));
        }

        let (cube_desc, cube_data) = self.texture(cube)?;
        if cube_desc.layers != 6 || cube_desc.width != cube_desc.height {
            return Err(DeviceError::Backend(format!(
                "projection input must be a square 6-layer cube, got {}x{}x{}",
                cube_desc.width, cube_desc.height, cube_desc.layers
            )));
        }
        let face_size = cube_desc.width;
        let cube_data = cube_data.clone();

        let (out_desc, out_data) = self.texture_mut(output)?;
        if groups[0] * 16 < out_desc.width || groups[1] * 16 < out_desc.height {
            return Err(DeviceError::OutOfBounds(format!(
                "{}x{} groups don't cover {}x{} output",
                groups[0], groups[1], out_desc.width, out_desc.height
            )));
        }
        let (width, height) = (out_desc.width, out_desc.height);
        project_equirectangular(&cube_data, face_size, out_data, width, height);

        self.stats.dispatches += 1;
        Ok(())
    }

    fn convert_to_nv12(&mut self, src: TextureId, dst: TextureId) -> Result<(), DeviceError> {
        if !self.kernels_available {
            return Err(DeviceError::KernelUnavailable("nv12 conversion".to_string()));
        }

        let (src_desc, src_data) = self.texture(src)?;
        let (width, height) = (src_desc.width, src_desc.height);
        let nv12 = rgba_to_nv12(src_data, width, height);

        let (dst_desc, dst_data) = self.texture_mut(dst)?;
        if dst_desc.format != TextureFormat::Nv12
            || dst_desc.width != width
            || dst_desc.height != height
            || dst_data.len() != nv12.len()
        {
            return Err(DeviceError::Backend(format!(
                "NV12 target is {}x{} {:?}, source is {}x{}",
                dst_desc.width, dst_desc.height, dst_desc.format, width, height
            )));
        }
        dst_data.copy_from_slice(&nv12);

        self.stats.conversions += 1;
        Ok(())
    }

    fn read_texture(
        &mut self,
        _call: &ToolCall,
        texture: TextureId,
        out: &mut Vec<u8>,
    ) -> Result<(), DeviceError> {
        let (_, data) = self.texture(texture)?;
        out.clear();
        out.extend_from_slice(data);
        Ok(())
    }

    fn release_texture(&mut self, texture: TextureId) {
        if let Some(Resource::Texture { .. }) = self.resources.get(&texture.0) {
            self.resources.remove(&texture.0);
        }
    }

    fn save_pipeline_state(&mut self) {
        self.state_depth += 1;
        self.stats.state_saves += 1;
    }

    fn restore_pipeline_state(&mut self) {
        debug_assert!(self.state_depth > 0, "restore without matching save");
        self.state_depth = self.state_depth.saturating_sub(1);
        self.stats.state_restores += 1;
    }
}

// ============================================
// REFERENCE PROJECTION KERNEL
// ============================================

/// Cube face index and face-local UV for a world direction.
///
/// Face order and orientation follow the Direct3D cube map convention:
/// +X, −X, +Y, −Y, +Z, −Z.
pub fn cube_face_uv(dir: [f32; 3]) -> (usize, f32, f32) {
    let [x, y, z] = dir;
    let (ax, ay, az) = (x.abs(), y.abs(), z.abs());

    let (face, sc, tc, ma) = if ax >= ay && ax >= az {
        if x >= 0.0 {
            (0, -z, -y, ax)
        } else {
            (1, z, -y, ax)
        }
    } else if ay >= az {
        if y >= 0.0 {
            (2, x, z, ay)
        } else {
            (3, x, -z, ay)
        }
    } else if z >= 0.0 {
        (4, x, -y, az)
    } else {
        (5, -x, -y, az)
    };

    let u = 0.5 * (sc / ma + 1.0);
    let v = 0.5 * (tc / ma + 1.0);
    (face, u, v)
}

/// Unit direction for the centre of equirectangular pixel `(px, py)`.
///
/// Longitude 0 (the image centre) looks down +Z; the top row looks up +Y.
pub fn equirect_direction(px: u32, py: u32, width: u32, height: u32) -> [f32; 3] {
    let lon = ((px as f32 + 0.5) / width as f32 - 0.5) * 2.0 * PI;
    let lat = (0.5 - (py as f32 + 0.5) / height as f32) * PI;
    [lat.cos() * lon.sin(), lat.sin(), lat.cos() * lon.cos()]
}

/// Nearest-sample cube → equirectangular projection, one rayon task per row.
fn project_equirectangular(cube: &[u8], face_size: u32, out: &mut [u8], width: u32, height: u32) {
    let face_bytes = face_size as usize * face_size as usize * 4;
    let max = face_size - 1;

    out.par_chunks_mut(width as usize * 4)
        .enumerate()
        .for_each(|(py, row)| {
            for px in 0..width {
                let dir = equirect_direction(px, py as u32, width, height);
                let (face, u, v) = cube_face_uv(dir);
                let sx = ((u * face_size as f32) as u32).min(max) as usize;
                let sy = ((v * face_size as f32) as u32).min(max) as usize;
                let src = face * face_bytes + (sy * face_size as usize + sx) * 4;
                let dst = px as usize * 4;
                row[dst..dst + 4].copy_from_slice(&cube[src..src + 4]);
            }
        });
}

// ============================================
// TESTS
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{dispatch_groups, TextureUsage};

    #[test]
    fn test_cube_face_selection() {
        assert_eq!(cube_face_uv([1.0, 0.0, 0.0]).0, 0);
        assert_eq!(cube_face_uv([-1.0, 0.0, 0.0]).0, 1);
        assert_eq!(cube_face_uv([0.0, 1.0, 0.0]).0, 2);
        assert_eq!(cube_face_uv([0.0, -1.0, 0.0]).0, 3);
        assert_eq!(cube_face_uv([0.0, 0.0, 1.0]).0, 4);
        assert_eq!(cube_face_uv([0.0, 0.0, -1.0]).0, 5);

        let (_, u, v) = cube_face_uv([0.0, 0.0, 1.0]);
        assert!((u - 0.5).abs() < 1e-6 && (v - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_equirect_centre_looks_forward() {
        let dir = equirect_direction(500, 250, 1000, 500);
        assert!(dir[2] > 0.99);
    }

    #[test]
    fn test_projection_samples_each_face() {
        let mut device = SoftwareDevice::new();
        let cube = device
            .create_texture(&TextureDesc {
                layers: 6,
                ..TextureDesc::rgba(8, 8, TextureUsage::Cube)
            })
            .unwrap();

        // Paint each face a distinct colour
        if let Ok((_, data)) = device.texture_mut(cube) {
            for (face, chunk) in data.chunks_exact_mut(8 * 8 * 4).enumerate() {
                for pixel in chunk.chunks_exact_mut(4) {
                    pixel.copy_from_slice(&[face as u8 * 40, 0, 0, 255]);
                }
            }
        }

        let out = device
            .create_texture(&TextureDesc::rgba(64, 32, TextureUsage::Storage))
            .unwrap();
        device
            .dispatch_projection(cube, out, dispatch_groups(64, 32))
            .unwrap();

        let data = device.texture_contents(out).unwrap();
        let at = |x: usize, y: usize| data[(y * 64 + x) * 4];
        assert_eq!(at(32, 16), 4 * 40); // centre: front (+Z)
        assert_eq!(at(48, 16), 0); // quarter turn right: +X
        assert_eq!(at(16, 16), 40); // quarter turn left: -X
        assert_eq!(at(32, 0), 2 * 40); // top row: up
        assert_eq!(at(32, 31), 3 * 40); // bottom row: down
        assert_eq!(at(0, 16), 5 * 40); // seam: back
    }

    #[test]
    fn test_dispatch_rejects_short_grid() {
        let mut device = SoftwareDevice::new();
        let cube = device
            .create_texture(&TextureDesc {
                layers: 6,
                ..TextureDesc::rgba(4, 4, TextureUsage::Cube)
            })
            .unwrap();
        let out = device
            .create_texture(&TextureDesc::rgba(64, 32, TextureUsage::Storage))
            .unwrap();
        assert!(device.dispatch_projection(cube, out, [1, 1]).is_err());
    }

    #[test]
    fn test_allocation_budget() {
        let mut device = SoftwareDevice::new();
        device.fail_allocations_after(1);
        assert!(device.create_upload_buffer(64).is_ok());
        let err = device.create_upload_buffer(64).unwrap_err();
        assert!(err.is_resource_exhaustion());
    }

    #[test]
    fn test_copy_region_into_layer() {
        let mut device = SoftwareDevice::new();
        let back = device.create_back_buffer(6, 4);
        device.fill_texture(back, [9, 9, 9, 255]).unwrap();
        let cube = device
            .create_texture(&TextureDesc {
                layers: 6,
                ..TextureDesc::rgba(4, 4, TextureUsage::Cube)
            })
            .unwrap();

        device
            .copy_texture_region(back, Region::centered_square(6, 4), cube, 3)
            .unwrap();

        let data = device.texture_contents(cube).unwrap();
        let layer = 4 * 4 * 4;
        assert!(data[..3 * layer].iter().all(|&b| b == 0));
        assert!(data[3 * layer..4 * layer].iter().all(|&b| b == 9 || b == 255));
        assert!(data[4 * layer..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_target_buffers_survive_release() {
        let mut device = SoftwareDevice::new();
        let target = device.create_target_buffer(&[1, 2, 3, 4]);
        device.release_buffer(target);
        assert_eq!(device.buffer_contents(target), Some(&[1u8, 2, 3, 4][..]));
    }
}
