//! Accelerator runtime abstraction
//!
//! Everything the device camera layer needs from the accelerator goes through
//! [`GpuRuntime`]: pitched and pinned allocations, transfers, the constant
//! camera parameter table, texture objects and the two preprocessing kernels.
//! [`CpuRuntime`] emulates the device on the host and is always available;
//! `CudaRuntime` drives a real device through the CUDA driver API.

pub mod cpu_runtime;
#[cfg(cuda_backend)]
pub mod cuda_runtime;

pub use cpu_runtime::{CpuRuntime, RuntimeEvent};
#[cfg(cuda_backend)]
pub use cuda_runtime::CudaRuntime;

use crate::depth_map::common::error::Result;
use crate::depth_map::types::{ExecutionContext, HostFrame, Size2, StreamHandle};

/// Raw device address of a pitched allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePtr(pub u64);

/// Raw address of a pinned host allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostPtr(pub u64);

/// Raw texture object handle, as consumed by the matching kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub u64);

/// A pitched 2-D allocation of [`Rgba`](crate::depth_map::types::Rgba) elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PitchedAllocation {
    pub ptr: DevicePtr,
    pub size: Size2,
    /// Row stride in bytes, at least `size.width * ELEMENT_SIZE`.
    pub pitch: usize,
}

impl PitchedAllocation {
    pub const ELEMENT_SIZE: usize = std::mem::size_of::<crate::depth_map::types::Rgba>();

    /// Padded byte size of the allocation.
    pub fn bytes_padded(&self) -> usize {
        self.pitch * self.size.height
    }

    /// Unpadded byte size of the pixel payload.
    pub fn bytes_unpadded(&self) -> usize {
        self.size.area() * Self::ELEMENT_SIZE
    }
}

/// Channel layout of the texels behind a texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelFormat {
    /// Four 32-bit float channels.
    Float4,
}

/// Describes the memory a texture reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceDesc {
    pub ptr: DevicePtr,
    pub width: usize,
    pub height: usize,
    pub pitch_in_bytes: usize,
    pub format: ChannelFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressMode {
    Clamp,
    Wrap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterMode {
    /// Nearest texel.
    #[default]
    Point,
    /// Bilinear interpolation between texel centers.
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadMode {
    /// Texels are returned as stored.
    #[default]
    ElementType,
    /// Integer texels are rescaled to `[0, 1]`; no effect on float channels.
    NormalizedFloat,
}

/// Describes how a texture samples its resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureDesc {
    pub address_mode: [AddressMode; 3],
    pub filter_mode: FilterMode,
    pub read_mode: ReadMode,
    pub normalized_coords: bool,
}

/// Device operations used by the camera layer.
///
/// Every fallible call maps runtime failures onto the matching
/// [`DeviceError`](crate::depth_map::common::error::DeviceError) kind.
/// Calls taking an [`ExecutionContext`] block when it is synchronous and
/// only enqueue otherwise.
pub trait GpuRuntime: Send + Sync {
    fn name(&self) -> &'static str;

    /// Number of slots in the constant camera parameter table.
    fn camera_params_capacity(&self) -> usize;

    fn create_stream(&self) -> Result<StreamHandle>;
    fn destroy_stream(&self, stream: StreamHandle) -> Result<()>;
    /// Blocks until all work enqueued on `ctx` has completed.
    fn synchronize(&self, ctx: ExecutionContext) -> Result<()>;

    fn alloc_pitched(&self, size: Size2) -> Result<PitchedAllocation>;
    fn free_pitched(&self, ptr: DevicePtr) -> Result<()>;

    fn alloc_pinned(&self, bytes: usize) -> Result<HostPtr>;
    fn free_pinned(&self, ptr: HostPtr) -> Result<()>;
    /// Writes `bytes` at the start of a pinned allocation.
    fn write_pinned(&self, ptr: HostPtr, bytes: &[u8]) -> Result<()>;

    fn copy_frame_to_device(
        &self,
        dst: &PitchedAllocation,
        frame: &HostFrame,
        ctx: ExecutionContext,
    ) -> Result<()>;
    /// Reads a pitched allocation back into a packed host frame.
    fn copy_frame_to_host(&self, src: &PitchedAllocation, ctx: ExecutionContext) -> Result<HostFrame>;

    /// Copies one parameter record from pinned memory into table slot `slot`.
    fn write_camera_params(&self, slot: usize, src: HostPtr, ctx: ExecutionContext) -> Result<()>;
    /// Reads table slot `slot` back as raw bytes.
    fn read_camera_params(&self, slot: usize) -> Result<Vec<u8>>;

    fn create_texture(&self, resource: &ResourceDesc, sampling: &TextureDesc) -> Result<TextureHandle>;
    fn destroy_texture(&self, texture: TextureHandle) -> Result<()>;

    /// Gaussian-weighted decimation of `src` into `dst`.
    ///
    /// Output texel `(x, y)` gathers source texels in a `(2 * radius + 1)^2`
    /// window centered on `(x * downscale + downscale / 2, y * downscale + downscale / 2)`.
    fn downscale_with_gaussian_blur(
        &self,
        dst: &PitchedAllocation,
        src: TextureHandle,
        downscale: u32,
        out_size: Size2,
        radius: u32,
        ctx: ExecutionContext,
    ) -> Result<()>;

    /// Converts the `size` region of `buffer` from RGB in `[0, 255]` to CIELAB in place.
    fn rgb_to_lab_in_place(&self, buffer: &PitchedAllocation, size: Size2, ctx: ExecutionContext) -> Result<()>;
}
