//! # GPU Device Interface
//!
//! The capability interface the capture core depends on.
//!
//! ## Plain English
//!
//! The core never talks to Direct3D (or anything else) directly. It asks a
//! `GpuDevice` for a handful of things: "how big is this buffer", "give me a
//! writable buffer", "copy this part of the back buffer over there", "run the
//! projection kernel". A platform adapter answers those questions for a real
//! graphics API; the software device answers them on the CPU so the whole
//! pipeline can be driven by tests with synthetic buffers.
//!
//! ```text
//!   target app ──▶ hooks (adapter) ──▶ WideCapture core
//!                        ▲                   │
//!                        └──── GpuDevice ◀───┘
//!                         (ToolCall-marked calls go to the
//!                          original, unhooked entry points)
//! ```

pub mod software;

#[cfg(windows)]
pub mod d3d11;

pub use software::SoftwareDevice;

use thiserror::Error;

// ============================================
// RESOURCE IDENTITIES
// ============================================

/// Opaque identity of a GPU buffer.
///
/// Adapters usually derive it from the native object pointer. The core only
/// ever uses it as a map key and never assumes ownership through it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

/// Opaque identity of a GPU texture.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(pub u64);

// ============================================
// TOOL CALL TOKEN
// ============================================

/// Proof that a device call is issued by the capture tool itself.
///
/// ## Plain English
///
/// When we read a buffer back or upload a replacement, the graphics API sees
/// a Map/Copy just like the ones the game makes. If the adapter's hooks
/// treated our own calls as game writes, we'd observe ourselves forever.
/// Every call the core makes on its own behalf carries this token, and
/// adapters must send token-bearing calls to the original (unhooked)
/// functions.
///
/// Only this crate can create one.
#[derive(Debug)]
pub struct ToolCall {
    _private: (),
}

impl ToolCall {
    pub(crate) fn issue() -> Self {
        Self { _private: () }
    }
}

// ============================================
// TEXTURE DESCRIPTIONS
// ============================================

/// Pixel formats the core asks for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextureFormat {
    /// 8-bit RGBA, 4 bytes per pixel
    Rgba8Unorm,
    /// 4:2:0 luma plane followed by interleaved chroma, 1.5 bytes per pixel
    Nv12,
}

impl TextureFormat {
    /// Bytes needed for one `width × height` layer in this format.
    pub fn layer_size(self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            Self::Rgba8Unorm => pixels * 4,
            Self::Nv12 => pixels + pixels / 2,
        }
    }
}

/// What a texture is going to be used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextureUsage {
    /// One captured cube face (copy destination and source)
    Face,
    /// Six-layer cube read by the projection kernel
    Cube,
    /// Kernel output (unordered access + shader resource)
    Storage,
    /// Encoder-ready surface
    VideoSurface,
}

/// Description of a texture the core wants created.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub layers: u32,
    pub format: TextureFormat,
    pub usage: TextureUsage,
}

impl TextureDesc {
    /// A single-layer RGBA texture.
    pub fn rgba(width: u32, height: u32, usage: TextureUsage) -> Self {
        Self {
            width,
            height,
            layers: 1,
            format: TextureFormat::Rgba8Unorm,
            usage,
        }
    }
}

/// A rectangle inside a texture, in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    /// The largest square centred in a `width × height` image.
    ///
    /// ## Example
    /// ```
    /// # use widecapture::gpu::Region;
    /// let r = Region::centered_square(1920, 1080);
    /// assert_eq!((r.x, r.y, r.width, r.height), (420, 0, 1080, 1080));
    /// ```
    pub fn centered_square(width: u32, height: u32) -> Self {
        let side = width.min(height);
        Self {
            x: (width - side) / 2,
            y: (height - side) / 2,
            width: side,
            height: side,
        }
    }
}

// ============================================
// DEVICE ERRORS
// ============================================

/// Errors reported by a `GpuDevice`.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// A buffer, texture or view couldn't be created
    #[error("failed to create {what}: {reason}")]
    ResourceCreation { what: &'static str, reason: String },

    /// The identity doesn't name anything this device knows about
    #[error("unknown resource {0:#x}")]
    UnknownResource(u64),

    /// A copy or write would run past the end of a resource
    #[error("access out of bounds: {0}")]
    OutOfBounds(String),

    /// The projection or colour-conversion kernel isn't available
    #[error("kernel unavailable: {0}")]
    KernelUnavailable(String),

    /// Anything else the native API reported
    #[error("backend error: {0}")]
    Backend(String),
}

impl DeviceError {
    /// Returns true for failures that disable recording for the session.
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(
            self,
            Self::ResourceCreation { .. } | Self::KernelUnavailable(_)
        )
    }
}

// ============================================
// DEVICE TRAIT
// ============================================

/// Everything the capture core needs from a graphics device.
///
/// All methods are synchronous and may block briefly on GPU
/// synchronization. Methods taking a [`ToolCall`] are issued by the tool on
/// its own behalf and must not be reported back as target writes.
pub trait GpuDevice: Send {
    /// Declared byte size of a buffer, if the device knows it.
    fn buffer_size(&self, buffer: BufferId) -> Option<usize>;

    /// Creates a CPU-writable constant buffer of `size` bytes.
    fn create_upload_buffer(&mut self, size: usize) -> Result<BufferId, DeviceError>;

    /// Creates a CPU-readable staging buffer of `size` bytes.
    fn create_staging_buffer(&mut self, size: usize) -> Result<BufferId, DeviceError>;

    /// Replaces the start of `buffer` with `bytes` (map, write-discard).
    fn write_buffer(
        &mut self,
        call: &ToolCall,
        buffer: BufferId,
        bytes: &[u8],
    ) -> Result<(), DeviceError>;

    /// Copies the first `len` bytes of `src` into `dst`.
    fn copy_buffer(
        &mut self,
        call: &ToolCall,
        src: BufferId,
        dst: BufferId,
        len: usize,
    ) -> Result<(), DeviceError>;

    /// Reads the first `out.len()` bytes of a staging buffer.
    fn read_buffer(
        &mut self,
        call: &ToolCall,
        buffer: BufferId,
        out: &mut [u8],
    ) -> Result<(), DeviceError>;

    fn release_buffer(&mut self, buffer: BufferId);

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureId, DeviceError>;

    /// Copies `region` of layer 0 of `src` to the origin of layer `dst_layer` of `dst`.
    fn copy_texture_region(
        &mut self,
        src: TextureId,
        region: Region,
        dst: TextureId,
        dst_layer: u32,
    ) -> Result<(), DeviceError>;

    /// Runs the cube → equirectangular kernel over a `groups[0] × groups[1]` grid
    /// of 16×16 thread groups.
    fn dispatch_projection(
        &mut self,
        cube: TextureId,
        output: TextureId,
        groups: [u32; 2],
    ) -> Result<(), DeviceError>;

    /// Converts an RGBA texture into an NV12 texture of the same size.
    fn convert_to_nv12(&mut self, src: TextureId, dst: TextureId) -> Result<(), DeviceError>;

    /// Reads back the full contents of a texture (all layers, tightly packed).
    fn read_texture(
        &mut self,
        call: &ToolCall,
        texture: TextureId,
        out: &mut Vec<u8>,
    ) -> Result<(), DeviceError>;

    fn release_texture(&mut self, texture: TextureId);

    /// Snapshots the pipeline state the tool is about to perturb.
    fn save_pipeline_state(&mut self);

    /// Restores the state saved by the matching `save_pipeline_state`.
    fn restore_pipeline_state(&mut self);
}

/// Number of 16×16 thread groups needed to cover `width × height`.
pub fn dispatch_groups(width: u32, height: u32) -> [u32; 2] {
    [width.div_ceil(16), height.div_ceil(16)]
}

// ============================================
// STATE GUARD
// ============================================

/// Saves pipeline state on creation and restores it when dropped.
///
/// ## Plain English
///
/// The game doesn't know we borrowed its device context. Whatever shaders,
/// targets and viewports it had bound must be back in place before it
/// continues, even if our work bails out halfway.
pub struct PipelineStateGuard<'a, D: GpuDevice + ?Sized> {
    device: &'a mut D,
}

impl<'a, D: GpuDevice + ?Sized> PipelineStateGuard<'a, D> {
    pub fn new(device: &'a mut D) -> Self {
        device.save_pipeline_state();
        Self { device }
    }
}

impl<D: GpuDevice + ?Sized> std::ops::Deref for PipelineStateGuard<'_, D> {
    type Target = D;

    fn deref(&self) -> &D {
        self.device
    }
}

impl<D: GpuDevice + ?Sized> std::ops::DerefMut for PipelineStateGuard<'_, D> {
    fn deref_mut(&mut self) -> &mut D {
        self.device
    }
}

impl<D: GpuDevice + ?Sized> Drop for PipelineStateGuard<'_, D> {
    fn drop(&mut self) {
        self.device.restore_pipeline_state();
    }
}

// ============================================
// TESTS
// ============================================
