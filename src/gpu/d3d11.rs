//! # Direct3D 11 Device
//!
//! `GpuDevice` over a real `ID3D11Device` / immediate context.
//!
//! ## Plain English
//!
//! The hooking adapter owns the game's device and context. It hands them to
//! this type once, then registers the game's constant buffers and back
//! buffer as it sees them. Everything we create ourselves (replacement
//! constant buffers, staging copies, face and cube textures) lives here and
//! is released here.
//!
//! ## Kernel contract
//!
//! The projection compute shader is supplied as compiled bytecode:
//!
//! ```text
//!   Texture2DArray<float4> faces  : register(t0);   // 6 slices, +X -X +Y -Y +Z -Z
//!   RWTexture2D<float4>    output : register(u0);
//!   [numthreads(16, 16, 1)]
//! ```
//!
//! NV12 surfaces are host-side: the equirect is read back and converted on
//! the CPU, which is all the image-sequence encoder needs.

use std::collections::HashMap;
use std::ptr;

use log::{debug, warn};
use windows::core::Interface;
use windows::Win32::Graphics::Direct3D11::{
    ID3D11Buffer, ID3D11ComputeShader, ID3D11Device, ID3D11DeviceContext,
    ID3D11ShaderResourceView, ID3D11Texture2D, ID3D11UnorderedAccessView, D3D11_BIND_CONSTANT_BUFFER,
    D3D11_BIND_SHADER_RESOURCE, D3D11_BIND_UNORDERED_ACCESS, D3D11_BOX, D3D11_BUFFER_DESC,
    D3D11_CPU_ACCESS_READ, D3D11_CPU_ACCESS_WRITE, D3D11_MAPPED_SUBRESOURCE, D3D11_MAP_READ,
    D3D11_MAP_WRITE_DISCARD, D3D11_TEXTURE2D_DESC, D3D11_USAGE_DEFAULT, D3D11_USAGE_DYNAMIC,
    D3D11_USAGE_STAGING,
};
use windows::Win32::Graphics::Dxgi::Common::{
    DXGI_FORMAT, DXGI_FORMAT_R8G8B8A8_UNORM, DXGI_SAMPLE_DESC,
};

use super::{
    BufferId, DeviceError, GpuDevice, Region, TextureDesc, TextureFormat, TextureId, TextureUsage,
    ToolCall,
};
use crate::encoder::rgba_to_nv12;

/// Constant buffers must be a multiple of 16 bytes.
fn constant_buffer_size(size: usize) -> usize {
    size.max(16).div_ceil(16) * 16
}

fn backend(e: windows::core::Error) -> DeviceError {
    DeviceError::Backend(e.to_string())
}

fn creation(what: &'static str) -> impl Fn(windows::core::Error) -> DeviceError {
    move |e| DeviceError::ResourceCreation {
        what,
        reason: e.to_string(),
    }
}

fn created<T>(what: &'static str, object: Option<T>) -> Result<T, DeviceError> {
    object.ok_or_else(|| DeviceError::ResourceCreation {
        what,
        reason: "device returned no object".to_string(),
    })
}

fn native_id<T: Interface>(object: &T) -> u64 {
    object.as_raw() as u64
}

// ============================================
// RESOURCES
// ============================================

enum Resource {
    /// Owned by the game; never released here
    TargetBuffer(ID3D11Buffer),
    /// Dynamic constant buffer (replacement) or staging buffer
    Buffer { buffer: ID3D11Buffer, size: usize },
    /// Owned by the swap chain; never released here
    BackBuffer(ID3D11Texture2D),
    Texture {
        texture: ID3D11Texture2D,
        desc: TextureDesc,
    },
    /// CPU-resident NV12 surface
    HostSurface { desc: TextureDesc, data: Vec<u8> },
}

/// Compute-stage bindings the tool overwrites.
#[derive(Default)]
struct SavedComputeState {
    shader: Option<ID3D11ComputeShader>,
    srvs: [Option<ID3D11ShaderResourceView>; 1],
    uavs: [Option<ID3D11UnorderedAccessView>; 1],
}

// ============================================
// D3D11 DEVICE
// ============================================

pub struct D3d11Device {
    device: ID3D11Device,
    context: ID3D11DeviceContext,
    projection: Option<ID3D11ComputeShader>,

    resources: HashMap<u64, Resource>,

    /// Format of the registered back buffer; face copies must match it
    surface_format: DXGI_FORMAT,

    saved: Vec<SavedComputeState>,

    /// Host surfaces have no native pointer; small ids never alias one
    next_host_id: u64,
}

// SAFETY: the device and immediate context are only touched while the
// owning session's mutex is held, so no two threads use them at once.
unsafe impl Send for D3d11Device {}

impl D3d11Device {
    /// Wraps the game's device. `projection_cs` is compiled `cs_5_0`
    /// bytecode for the cube → equirectangular kernel.
    pub fn new(
        device: ID3D11Device,
        context: ID3D11DeviceContext,
        projection_cs: Option<&[u8]>,
    ) -> Self {
        let projection = projection_cs.and_then(|bytecode| {
            let mut shader: Option<ID3D11ComputeShader> = None;
            // SAFETY: bytecode is a complete shader blob provided by the caller.
            match unsafe { device.CreateComputeShader(bytecode, None, Some(&mut shader)) } {
                Ok(()) => shader,
                Err(e) => {
                    warn!("Projection kernel rejected by the driver: {}", e);
                    None
                }
            }
        });

        Self {
            device,
            context,
            projection,
            resources: HashMap::new(),
            surface_format: DXGI_FORMAT_R8G8B8A8_UNORM,
            saved: Vec::new(),
            next_host_id: 1,
        }
    }

    /// Registers a game constant buffer and returns its identity.
    pub fn register_buffer(&mut self, buffer: &ID3D11Buffer) -> BufferId {
        let id = native_id(buffer);
        self.resources
            .entry(id)
            .or_insert_with(|| Resource::TargetBuffer(buffer.clone()));
        BufferId(id)
    }

    /// Forgets a game buffer that has been destroyed.
    pub fn unregister_buffer(&mut self, id: BufferId) {
        if matches!(self.resources.get(&id.0), Some(Resource::TargetBuffer(_))) {
            self.resources.remove(&id.0);
        }
    }

    /// Registers the swap chain's back buffer; face textures follow its format.
    pub fn register_back_buffer(&mut self, texture: &ID3D11Texture2D) -> TextureId {
        let mut desc = D3D11_TEXTURE2D_DESC::default();
        // SAFETY: texture is a live swap-chain buffer.
        unsafe { texture.GetDesc(&mut desc) };
        self.surface_format = desc.Format;

        let id = native_id(texture);
        self.resources
            .insert(id, Resource::BackBuffer(texture.clone()));
        TextureId(id)
    }

    /// The replacement buffer to hand to the real `*SetConstantBuffers`.
    pub fn native_buffer(&self, id: BufferId) -> Option<&ID3D11Buffer> {
        match self.resources.get(&id.0)? {
            Resource::TargetBuffer(buffer) | Resource::Buffer { buffer, .. } => Some(buffer),
            _ => None,
        }
    }

    fn buffer(&self, id: BufferId) -> Result<&ID3D11Buffer, DeviceError> {
        self.native_buffer(id)
            .ok_or(DeviceError::UnknownResource(id.0))
    }

    fn texture(&self, id: TextureId) -> Result<&ID3D11Texture2D, DeviceError> {
        match self.resources.get(&id.0) {
            Some(Resource::BackBuffer(texture)) | Some(Resource::Texture { texture, .. }) => {
                Ok(texture)
            }
            _ => Err(DeviceError::UnknownResource(id.0)),
        }
    }

    fn insert_buffer(&mut self, buffer: ID3D11Buffer, size: usize) -> BufferId {
        let id = native_id(&buffer);
        self.resources.insert(id, Resource::Buffer { buffer, size });
        BufferId(id)
    }

    /// Copies every slice of a GPU texture into `out`, tightly packed.
    fn read_gpu_texture(
        &self,
        texture: &ID3D11Texture2D,
        out: &mut Vec<u8>,
    ) -> Result<(u32, u32), DeviceError> {
        let mut desc = D3D11_TEXTURE2D_DESC::default();
        // SAFETY: texture is alive for the duration of this call.
        unsafe { texture.GetDesc(&mut desc) };

        let staging_desc = D3D11_TEXTURE2D_DESC {
            MipLevels: 1,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Usage: D3D11_USAGE_STAGING,
            BindFlags: 0,
            CPUAccessFlags: D3D11_CPU_ACCESS_READ.0 as u32,
            MiscFlags: 0,
            ..desc
        };

        let mut staging: Option<ID3D11Texture2D> = None;
        // SAFETY: staging_desc is fully initialized.
        unsafe {
            self.device
                .CreateTexture2D(&staging_desc, None, Some(&mut staging))
                .map_err(creation("staging texture"))?;
        }
        let staging = created("staging texture", staging)?;

        // SAFETY: same dimensions and format; staging is CPU-readable.
        unsafe { self.context.CopyResource(&staging, texture) };

        let row_bytes = desc.Width as usize * 4;
        out.clear();
        out.reserve(row_bytes * desc.Height as usize * desc.ArraySize as usize);

        for slice in 0..desc.ArraySize {
            let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
            // SAFETY: staging is a live staging texture with one mip per slice.
            unsafe {
                self.context
                    .Map(&staging, slice, D3D11_MAP_READ, 0, Some(&mut mapped))
                    .map_err(backend)?;

                let base = mapped.pData as *const u8;
                for row in 0..desc.Height as usize {
                    let line = std::slice::from_raw_parts(
                        base.add(row * mapped.RowPitch as usize),
                        row_bytes,
                    );
                    out.extend_from_slice(line);
                }
                self.context.Unmap(&staging, slice);
            }
        }
        Ok((desc.Width, desc.Height))
    }
}

impl GpuDevice for D3d11Device {
    fn buffer_size(&self, buffer: BufferId) -> Option<usize> {
        match self.resources.get(&buffer.0)? {
            Resource::TargetBuffer(native) => {
                let mut desc = D3D11_BUFFER_DESC::default();
                // SAFETY: native is a registered, live buffer.
                unsafe { native.GetDesc(&mut desc) };
                Some(desc.ByteWidth as usize)
            }
            Resource::Buffer { size, .. } => Some(*size),
            _ => None,
        }
    }

    fn create_upload_buffer(&mut self, size: usize) -> Result<BufferId, DeviceError> {
        let size = constant_buffer_size(size);
        let desc = D3D11_BUFFER_DESC {
            ByteWidth: size as u32,
            Usage: D3D11_USAGE_DYNAMIC,
            BindFlags: D3D11_BIND_CONSTANT_BUFFER.0 as u32,
            CPUAccessFlags: D3D11_CPU_ACCESS_WRITE.0 as u32,
            MiscFlags: 0,
            StructureByteStride: 0,
        };

        let mut buffer: Option<ID3D11Buffer> = None;
        // SAFETY: desc is fully initialized.
        unsafe {
            self.device
                .CreateBuffer(&desc, None, Some(&mut buffer))
                .map_err(creation("replacement constant buffer"))?;
        }
        let buffer = created("replacement constant buffer", buffer)?;
        Ok(self.insert_buffer(buffer, size))
    }

    fn create_staging_buffer(&mut self, size: usize) -> Result<BufferId, DeviceError> {
        let desc = D3D11_BUFFER_DESC {
            ByteWidth: size as u32,
            Usage: D3D11_USAGE_STAGING,
            BindFlags: 0,
            CPUAccessFlags: D3D11_CPU_ACCESS_READ.0 as u32,
            MiscFlags: 0,
            StructureByteStride: 0,
        };

        let mut buffer: Option<ID3D11Buffer> = None;
        // SAFETY: desc is fully initialized.
        unsafe {
            self.device
                .CreateBuffer(&desc, None, Some(&mut buffer))
                .map_err(creation("staging buffer"))?;
        }
        let buffer = created("staging buffer", buffer)?;
        Ok(self.insert_buffer(buffer, size))
    }

    fn write_buffer(
        &mut self,
        _call: &ToolCall,
        buffer: BufferId,
        bytes: &[u8],
    ) -> Result<(), DeviceError> {
        let Some(Resource::Buffer { buffer: native, size }) = self.resources.get(&buffer.0) else {
            return Err(DeviceError::UnknownResource(buffer.0));
        };
        if bytes.len() > *size {
            return Err(DeviceError::OutOfBounds(format!(
                "{} bytes into a {}-byte buffer",
                bytes.len(),
                size
            )));
        }

        let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
        // SAFETY: native is a dynamic buffer of at least bytes.len() bytes.
        unsafe {
            self.context
                .Map(native, 0, D3D11_MAP_WRITE_DISCARD, 0, Some(&mut mapped))
                .map_err(backend)?;
            ptr::copy_nonoverlapping(bytes.as_ptr(), mapped.pData as *mut u8, bytes.len());
            self.context.Unmap(native, 0);
        }
        Ok(())
    }

    fn copy_buffer(
        &mut self,
        _call: &ToolCall,
        src: BufferId,
        dst: BufferId,
        len: usize,
    ) -> Result<(), DeviceError> {
        let src = self.buffer(src)?;
        let dst = self.buffer(dst)?;
        let region = D3D11_BOX {
            left: 0,
            top: 0,
            front: 0,
            right: len as u32,
            bottom: 1,
            back: 1,
        };
        // SAFETY: both buffers are live and at least len bytes long.
        unsafe {
            self.context
                .CopySubresourceRegion(dst, 0, 0, 0, 0, src, 0, Some(&region));
        }
        Ok(())
    }

    fn read_buffer(
        &mut self,
        _call: &ToolCall,
        buffer: BufferId,
        out: &mut [u8],
    ) -> Result<(), DeviceError> {
        let Some(Resource::Buffer { buffer: native, size }) = self.resources.get(&buffer.0) else {
            return Err(DeviceError::UnknownResource(buffer.0));
        };
        if out.len() > *size {
            return Err(DeviceError::OutOfBounds(format!(
                "{} bytes from a {}-byte buffer",
                out.len(),
                size
            )));
        }

        let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
        // SAFETY: native is a staging buffer of at least out.len() bytes.
        unsafe {
            self.context
                .Map(native, 0, D3D11_MAP_READ, 0, Some(&mut mapped))
                .map_err(backend)?;
            ptr::copy_nonoverlapping(mapped.pData as *const u8, out.as_mut_ptr(), out.len());
            self.context.Unmap(native, 0);
        }
        Ok(())
    }

    fn release_buffer(&mut self, buffer: BufferId) {
        if matches!(self.resources.get(&buffer.0), Some(Resource::Buffer { .. })) {
            self.resources.remove(&buffer.0);
        }
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureId, DeviceError> {
        if desc.format == TextureFormat::Nv12 {
            let data = vec![0; desc.format.layer_size(desc.width, desc.height)];
            let id = self.next_host_id;
            self.next_host_id += 1;
            self.resources
                .insert(id, Resource::HostSurface { desc: *desc, data });
            return Ok(TextureId(id));
        }

        let (format, bind) = match desc.usage {
            TextureUsage::Face | TextureUsage::Cube => {
                (self.surface_format, D3D11_BIND_SHADER_RESOURCE.0 as u32)
            }
            TextureUsage::Storage | TextureUsage::VideoSurface => (
                DXGI_FORMAT_R8G8B8A8_UNORM,
                (D3D11_BIND_SHADER_RESOURCE.0 | D3D11_BIND_UNORDERED_ACCESS.0) as u32,
            ),
        };

        let native_desc = D3D11_TEXTURE2D_DESC {
            Width: desc.width,
            Height: desc.height,
            MipLevels: 1,
            ArraySize: desc.layers,
            Format: format,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Usage: D3D11_USAGE_DEFAULT,
            BindFlags: bind,
            CPUAccessFlags: 0,
            MiscFlags: 0,
        };

        let mut texture: Option<ID3D11Texture2D> = None;
        // SAFETY: native_desc is fully initialized.
        unsafe {
            self.device
                .CreateTexture2D(&native_desc, None, Some(&mut texture))
                .map_err(creation("capture texture"))?;
        }
        let texture = created("capture texture", texture)?;

        let id = native_id(&texture);
        debug!(
            "created {:?} texture {}x{}x{}",
            desc.usage, desc.width, desc.height, desc.layers
        );
        self.resources.insert(
            id,
            Resource::Texture {
                texture,
                desc: *desc,
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
        let src = self.texture(src)?;
        let dst = self.texture(dst)?;
        let source_box = D3D11_BOX {
            left: region.x,
            top: region.y,
            front: 0,
            right: region.x + region.width,
            bottom: region.y + region.height,
            back: 1,
        };
        // SAFETY: both textures are live, format-compatible and single-mip,
        // so subresource `dst_layer` is array slice `dst_layer`.
        unsafe {
            self.context
                .CopySubresourceRegion(dst, dst_layer, 0, 0, 0, src, 0, Some(&source_box));
        }
        Ok(())
    }

    fn dispatch_projection(
        &mut self,
        cube: TextureId,
        output: TextureId,
        groups: [u32; 2],
    ) -> Result<(), DeviceError> {
        let Some(shader) = self.projection.clone() else {
            return Err(DeviceError::KernelUnavailable(
                "projection compute shader was not provided".to_string(),
            ));
        };
        let cube = self.texture(cube)?.clone();
        let output = self.texture(output)?.clone();

        let mut srv: Option<ID3D11ShaderResourceView> = None;
        let mut uav: Option<ID3D11UnorderedAccessView> = None;
        // SAFETY: both textures are live; default views cover every slice.
        unsafe {
            self.device
                .CreateShaderResourceView(&cube, None, Some(&mut srv))
                .map_err(creation("cube view"))?;
            self.device
                .CreateUnorderedAccessView(&output, None, Some(&mut uav))
                .map_err(creation("equirect view"))?;

            self.context.CSSetShader(&shader, None);
            self.context.CSSetShaderResources(0, Some(&[srv]));
            self.context
                .CSSetUnorderedAccessViews(0, 1, Some(&uav as *const _), None);
            self.context.Dispatch(groups[0], groups[1], 1);

            // Unbind so the equirect can be read as a resource afterwards
            self.context.CSSetShaderResources(0, Some(&[None]));
            let none: Option<ID3D11UnorderedAccessView> = None;
            self.context
                .CSSetUnorderedAccessViews(0, 1, Some(&none as *const _), None);
        }
        Ok(())
    }

    fn convert_to_nv12(&mut self, src: TextureId, dst: TextureId) -> Result<(), DeviceError> {
        let source = self.texture(src)?.clone();
        let mut rgba = Vec::new();
        let (width, height) = self.read_gpu_texture(&source, &mut rgba)?;

        let Some(Resource::HostSurface { desc, data }) = self.resources.get_mut(&dst.0) else {
            return Err(DeviceError::UnknownResource(dst.0));
        };
        if (desc.width, desc.height) != (width, height) {
            return Err(DeviceError::OutOfBounds(format!(
                "{}x{} into a {}x{} surface",
                width, height, desc.width, desc.height
            )));
        }
        *data = rgba_to_nv12(&rgba, width, height);
        Ok(())
    }

    fn read_texture(
        &mut self,
        _call: &ToolCall,
        texture: TextureId,
        out: &mut Vec<u8>,
    ) -> Result<(), DeviceError> {
        if let Some(Resource::HostSurface { data, .. }) = self.resources.get(&texture.0) {
            out.clear();
            out.extend_from_slice(data);
            return Ok(());
        }
        let native = self.texture(texture)?.clone();
        self.read_gpu_texture(&native, out).map(|_| ())
    }

    fn release_texture(&mut self, texture: TextureId) {
        if matches!(
            self.resources.get(&texture.0),
            Some(Resource::Texture { .. }) | Some(Resource::HostSurface { .. })
        ) {
            self.resources.remove(&texture.0);
        }
    }

    fn save_pipeline_state(&mut self) {
        let mut saved = SavedComputeState::default();
        // SAFETY: plain state queries on the immediate context.
        unsafe {
            self.context.CSGetShader(Some(&mut saved.shader), None, None);
            self.context.CSGetShaderResources(0, Some(&mut saved.srvs));
            self.context.CSGetUnorderedAccessViews(0, Some(&mut saved.uavs));
        }
        self.saved.push(saved);
    }

    fn restore_pipeline_state(&mut self) {
        let Some(saved) = self.saved.pop() else {
            warn!("pipeline restore without a matching save");
            return;
        };
        // SAFETY: restores the bindings captured by save_pipeline_state.
        unsafe {
            self.context.CSSetShader(saved.shader.as_ref(), None);
            self.context.CSSetShaderResources(0, Some(&saved.srvs));
            self.context
                .CSSetUnorderedAccessViews(0, 1, Some(saved.uavs.as_ptr()), None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_buffer_size() {
        assert_eq!(constant_buffer_size(0), 16);
        assert_eq!(constant_buffer_size(64), 64);
        assert_eq!(constant_buffer_size(200), 208);
    }
}
