//! # Capture Resources
//!
//! The GPU textures one capture cycle needs, sized from the back buffer.
//!
//! ```text
//!   back buffer 1920x1080
//!        │ centre crop
//!        ▼
//!   6 × face 1080x1080 ──▶ cube 1080x1080x6 ──▶ equirect 4320x2160 ──▶ NV12 4320x2160
//! ```

use crate::gpu::{
    DeviceError, GpuDevice, Region, TextureDesc, TextureFormat, TextureId, TextureUsage,
};

/// Rounds up to the next multiple of 16.
pub fn align16(value: u32) -> u32 {
    value.div_ceil(16) * 16
}

// ============================================
// CAPTURE SIZE
// ============================================

/// Sizes derived from one back-buffer resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptureSize {
    pub back_width: u32,
    pub back_height: u32,
    /// Side of each square face, `min(width, height)`
    pub face_side: u32,
    pub equirect_width: u32,
    pub equirect_height: u32,
}

impl CaptureSize {
    /// Returns `None` for a zero-sized back buffer.
    pub fn for_back_buffer(width: u32, height: u32) -> Option<Self> {
        let face_side = width.min(height);
        if face_side == 0 {
            return None;
        }

        let equirect_width = align16(face_side.checked_mul(4)?);
        let equirect_height = align16(equirect_width / 2);
        Some(Self {
            back_width: width,
            back_height: height,
            face_side,
            equirect_width,
            equirect_height,
        })
    }

    /// The centred square copied out of the back buffer.
    pub fn face_region(&self) -> Region {
        Region::centered_square(self.back_width, self.back_height)
    }
}

// ============================================
// CAPTURE RESOURCES
// ============================================

/// Textures owned by the scheduler for one resolution.
#[derive(Debug)]
pub struct CaptureResources {
    pub size: CaptureSize,
    pub faces: [TextureId; 6],
    pub cube: TextureId,
    pub equirect: TextureId,
    pub surface: TextureId,
}

impl CaptureResources {
    /// Creates every texture, releasing the ones already made if any fails.
    pub fn allocate<D: GpuDevice + ?Sized>(
        device: &mut D,
        size: CaptureSize,
    ) -> Result<Self, DeviceError> {
        let mut created = Vec::with_capacity(9);
        let result = Self::create_all(device, size, &mut created);
        if result.is_err() {
            for texture in created {
                device.release_texture(texture);
            }
        }
        result
    }

    fn create_all<D: GpuDevice + ?Sized>(
        device: &mut D,
        size: CaptureSize,
        created: &mut Vec<TextureId>,
    ) -> Result<Self, DeviceError> {
        let side = size.face_side;

        let mut faces = [TextureId(0); 6];
        for face in faces.iter_mut() {
            *face = device.create_texture(&TextureDesc::rgba(side, side, TextureUsage::Face))?;
            created.push(*face);
        }

        let cube = device.create_texture(&TextureDesc {
            layers: 6,
            ..TextureDesc::rgba(side, side, TextureUsage::Cube)
        })?;
        created.push(cube);

        let equirect = device.create_texture(&TextureDesc::rgba(
            size.equirect_width,
            size.equirect_height,
            TextureUsage::Storage,
        ))?;
        created.push(equirect);

        let surface = device.create_texture(&TextureDesc {
            format: TextureFormat::Nv12,
            ..TextureDesc::rgba(
                size.equirect_width,
                size.equirect_height,
                TextureUsage::VideoSurface,
            )
        })?;
        created.push(surface);

        Ok(Self {
            size,
            faces,
            cube,
            equirect,
            surface,
        })
    }

    pub fn release<D: GpuDevice + ?Sized>(self, device: &mut D) {
        for texture in self
            .faces
            .into_iter()
            .chain([self.cube, self.equirect, self.surface])
        {
            device.release_texture(texture);
        }
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
    fn test_sizes_for_1080p() {
        let size = CaptureSize::for_back_buffer(1920, 1080).unwrap();
        assert_eq!(size.face_side, 1080);
        assert_eq!((size.equirect_width, size.equirect_height), (4320, 2160));
        assert_eq!(size.face_region(), Region::centered_square(1920, 1080));
    }

    #[test]
    fn test_sizes_are_aligned() {
        let size = CaptureSize::for_back_buffer(803, 601).unwrap();
        assert_eq!(size.face_side, 601);
        assert_eq!(size.equirect_width, 2416); // align16(2404)
        assert_eq!(size.equirect_height, 1216); // align16(1208)
        assert_eq!(size.equirect_width % 16, 0);
        assert_eq!(size.equirect_height % 16, 0);
    }

    #[test]
    fn test_zero_size() {
        assert!(CaptureSize::for_back_buffer(0, 1080).is_none());
    }

    #[test]
    fn test_allocate_and_release() {
        let mut device = SoftwareDevice::new();
        let size = CaptureSize::for_back_buffer(64, 32).unwrap();
        let resources = CaptureResources::allocate(&mut device, size).unwrap();
        assert_eq!(device.live_resources(), 9);
        assert_eq!(device.texture_desc(resources.cube).unwrap().layers, 6);

        resources.release(&mut device);
        assert_eq!(device.live_resources(), 0);
    }

    #[test]
    fn test_partial_allocation_is_rolled_back() {
        let mut device = SoftwareDevice::new();
        device.fail_allocations_after(7);
        let size = CaptureSize::for_back_buffer(64, 32).unwrap();
        let err = CaptureResources::allocate(&mut device, size).unwrap_err();
        assert!(err.is_resource_exhaustion());
        assert_eq!(device.live_resources(), 0);
    }
}
