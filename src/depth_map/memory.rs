//! Owning wrappers around runtime allocations.
//!
//! Each wrapper releases its allocation on drop. A release failure at that
//! point has nowhere to propagate, so it is logged.

use std::marker::PhantomData;
use std::sync::Arc;

use bytemuck::Pod;
use tracing::{debug, warn};

use crate::depth_map::common::error::Result;
use crate::depth_map::runtime::{GpuRuntime, HostPtr, PitchedAllocation, TextureHandle};
use crate::depth_map::types::{ExecutionContext, HostFrame, Size2};

/// Pitched 2-D device buffer of RGBA texels.
pub struct DeviceFrameBuffer<R: GpuRuntime> {
    runtime: Arc<R>,
    allocation: PitchedAllocation,
}

impl<R: GpuRuntime> DeviceFrameBuffer<R> {
    pub fn new(runtime: &Arc<R>, size: Size2) -> Result<Self> {
        let allocation = runtime.alloc_pitched(size)?;
        debug!(%size, pitch = allocation.pitch, bytes = allocation.bytes_padded(), "Allocated device frame");
        Ok(Self {
            runtime: Arc::clone(runtime),
            allocation,
        })
    }

    pub fn size(&self) -> Size2 {
        self.allocation.size
    }

    /// Row stride in bytes, as reported by the allocator.
    pub fn pitch(&self) -> usize {
        self.allocation.pitch
    }

    pub fn bytes_padded(&self) -> usize {
        self.allocation.bytes_padded()
    }

    pub fn allocation(&self) -> &PitchedAllocation {
        &self.allocation
    }

    pub fn copy_from_host(&self, frame: &HostFrame, ctx: ExecutionContext) -> Result<()> {
        self.runtime.copy_frame_to_device(&self.allocation, frame, ctx)
    }

    pub fn copy_to_host(&self, ctx: ExecutionContext) -> Result<HostFrame> {
        self.runtime.copy_frame_to_host(&self.allocation, ctx)
    }
}

impl<R: GpuRuntime> Drop for DeviceFrameBuffer<R> {
    fn drop(&mut self) {
        if let Err(e) = self.runtime.free_pitched(self.allocation.ptr) {
            warn!("Failed to release device frame {}: {}", self.allocation.size, e);
        }
    }
}

/// Texture object; destroyed on drop.
pub struct TextureObject<R: GpuRuntime> {
    runtime: Arc<R>,
    handle: TextureHandle,
}

impl<R: GpuRuntime> TextureObject<R> {
    /// Takes ownership of an already created texture.
    pub fn from_handle(runtime: &Arc<R>, handle: TextureHandle) -> Self {
        Self {
            runtime: Arc::clone(runtime),
            handle,
        }
    }

    pub fn handle(&self) -> TextureHandle {
        self.handle
    }
}

impl<R: GpuRuntime> Drop for TextureObject<R> {
    fn drop(&mut self) {
        if let Err(e) = self.runtime.destroy_texture(self.handle) {
            warn!("Failed to destroy texture object {}: {}", self.handle.0, e);
        }
    }
}

/// A single `T` in pinned (page-locked) host memory.
pub struct PinnedHostBox<R: GpuRuntime, T: Pod> {
    runtime: Arc<R>,
    ptr: HostPtr,
    _marker: PhantomData<T>,
}

impl<R: GpuRuntime, T: Pod> PinnedHostBox<R, T> {
    /// Allocates pinned memory for one `T` and copies `value` into it.
    pub fn new(runtime: &Arc<R>, value: &T) -> Result<Self> {
        let ptr = runtime.alloc_pinned(std::mem::size_of::<T>())?;
        let boxed = Self {
            runtime: Arc::clone(runtime),
            ptr,
            _marker: PhantomData,
        };
        boxed.write(value)?;
        Ok(boxed)
    }

    pub fn write(&self, value: &T) -> Result<()> {
        self.runtime.write_pinned(self.ptr, bytemuck::bytes_of(value))
    }

    pub fn ptr(&self) -> HostPtr {
        self.ptr
    }
}

impl<R: GpuRuntime, T: Pod> Drop for PinnedHostBox<R, T> {
    fn drop(&mut self) {
        if let Err(e) = self.runtime.free_pinned(self.ptr) {
            warn!("Failed to release pinned host memory: {}", e);
        }
    }
}
