//! Per-slot device camera.
//!
//! A [`DeviceCamera`] owns everything one slot needs on the device: the
//! scaled frame buffer, the texture bound to it and the pinned staging
//! record for the constant parameter table. Slots are reused across a
//! sliding window of cameras, so the same instance is filled many times.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::depth_map::common::error::{DeviceError, Result};
use crate::depth_map::memory::{DeviceFrameBuffer, PinnedHostBox, TextureObject};
use crate::depth_map::parameter_table::CameraParamsTable;
use crate::depth_map::preprocess::{FrameGeometry, fill_device_frame_from_host_frame, wait_before_release};
use crate::depth_map::runtime::{GpuRuntime, TextureHandle};
use crate::depth_map::texture::{TextureBuilder, TextureConfig};
use crate::depth_map::types::{DeviceCameraParams, ExecutionContext, HostFrame, Size2};

/// Frame buffer together with the texture reading it.
///
/// Kept as one value so the texture can never outlive or mismatch its buffer.
struct BoundFrame<R: GpuRuntime> {
    // Field order is drop order: texture first.
    texture: TextureObject<R>,
    buffer: DeviceFrameBuffer<R>,
}

pub struct DeviceCamera<R: GpuRuntime> {
    runtime: Arc<R>,
    device_cam_id: usize,
    global_cam_id: Option<usize>,
    original_size: Size2,
    size: Size2,
    downscale: u32,
    mem_bytes: usize,
    texture_builder: TextureBuilder,
    params_table: CameraParamsTable<R>,
    params_staging: Option<PinnedHostBox<R, DeviceCameraParams>>,
    frame: Option<BoundFrame<R>>,
}

impl<R: GpuRuntime> DeviceCamera<R> {
    /// Creates the camera for slot `device_cam_id`. Nothing is allocated until the first fill.
    pub fn new(runtime: &Arc<R>, device_cam_id: usize, texture_config: TextureConfig) -> Result<Self> {
        let params_table = CameraParamsTable::new(runtime);
        params_table.check_slot(device_cam_id)?;

        Ok(Self {
            runtime: Arc::clone(runtime),
            device_cam_id,
            global_cam_id: None,
            original_size: Size2::default(),
            size: Size2::default(),
            downscale: 0,
            mem_bytes: 0,
            texture_builder: TextureBuilder::new(texture_config),
            params_table,
            params_staging: None,
            frame: None,
        })
    }

    /// Uploads `frame` for camera `global_cam_id` into this slot.
    ///
    /// The device buffer and texture are only reallocated when the scaled size
    /// changes. With a stream context the texture is usable once the caller
    /// has synchronized the stream. A replaced frame is released only after
    /// that stream has drained. On error the slot is left empty, with no
    /// camera and no texture, until it is filled successfully again.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip(self, frame, camera_params, ctx), fields(slot = self.device_cam_id))]
    pub fn fill(
        &mut self,
        global_cam_id: usize,
        downscale: u32,
        original_width: usize,
        original_height: usize,
        frame: &HostFrame,
        camera_params: &DeviceCameraParams,
        ctx: ExecutionContext,
    ) -> Result<()> {
        let geometry = FrameGeometry::checked(Size2::new(original_width, original_height), downscale)?;

        let result = self.fill_resources(global_cam_id, &geometry, frame, camera_params, ctx);
        if result.is_err() {
            self.clear(ctx);
        }
        result
    }

    fn fill_resources(
        &mut self,
        global_cam_id: usize,
        geometry: &FrameGeometry,
        frame: &HostFrame,
        camera_params: &DeviceCameraParams,
        ctx: ExecutionContext,
    ) -> Result<()> {
        // update members
        self.global_cam_id = Some(global_cam_id);
        self.original_size = geometry.original;
        self.size = geometry.scaled;
        self.downscale = geometry.downscale;

        // The staging record is reallocated on every fill even though its size never changes.
        self.params_staging = None;
        let staging = self.params_staging.insert(PinnedHostBox::new(&self.runtime, camera_params)?);

        self.params_table.set_slot(self.device_cam_id, staging, ctx)?;

        let needs_realloc = self
            .frame
            .as_ref()
            .is_none_or(|bound| bound.buffer.size() != self.size);

        if needs_realloc {
            // release the previous texture and buffer before allocating the new ones
            if self.frame.is_some() {
                wait_before_release(self.runtime.as_ref(), ctx)?;
            }
            self.frame = None;
            self.mem_bytes = 0;

            let buffer = DeviceFrameBuffer::new(&self.runtime, self.size)?;
            self.mem_bytes = buffer.bytes_padded();
            let texture = self.texture_builder.build(&self.runtime, &buffer)?;
            debug!(
                size = %self.size,
                bytes = self.mem_bytes,
                texture = texture.handle().0,
                "Reallocated device frame"
            );
            self.frame = Some(BoundFrame { texture, buffer });
        }

        let bound = self
            .frame
            .as_ref()
            .ok_or_else(|| DeviceError::InvariantViolation("device frame missing after allocation".to_string()))?;

        fill_device_frame_from_host_frame(&self.runtime, &bound.buffer, geometry, &self.texture_builder, frame, ctx)
    }

    /// Empties the slot after a failed fill.
    fn clear(&mut self, ctx: ExecutionContext) {
        self.global_cam_id = None;
        self.mem_bytes = 0;
        if self.frame.is_some() {
            if let Err(e) = wait_before_release(self.runtime.as_ref(), ctx) {
                warn!("Releasing slot {} without draining its stream: {}", self.device_cam_id, e);
            }
            self.frame = None;
        }
    }

    /// Slot index in the constant parameter table.
    pub fn device_cam_id(&self) -> usize {
        self.device_cam_id
    }

    /// Camera currently held by this slot, `None` before the first fill.
    pub fn global_cam_id(&self) -> Option<usize> {
        self.global_cam_id
    }

    pub fn original_width(&self) -> usize {
        self.original_size.width
    }

    pub fn original_height(&self) -> usize {
        self.original_size.height
    }

    pub fn width(&self) -> usize {
        self.size.width
    }

    pub fn height(&self) -> usize {
        self.size.height
    }

    pub fn downscale(&self) -> u32 {
        self.downscale
    }

    /// Padded size of the device frame, in bytes.
    pub fn memory_footprint(&self) -> usize {
        self.mem_bytes
    }

    /// Texture consumed by the matching kernels.
    pub fn texture_object(&self) -> Option<TextureHandle> {
        self.frame.as_ref().map(|bound| bound.texture.handle())
    }

    pub fn device_frame(&self) -> Option<&DeviceFrameBuffer<R>> {
        self.frame.as_ref().map(|bound| &bound.buffer)
    }

    pub fn camera_params(&self) -> Result<DeviceCameraParams> {
        self.params_table.get_slot(self.device_cam_id)
    }
}

impl<R: GpuRuntime> std::fmt::Debug for DeviceCamera<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceCamera")
            .field("device_cam_id", &self.device_cam_id)
            .field("global_cam_id", &self.global_cam_id)
            .field("original_size", &self.original_size)
            .field("size", &self.size)
            .field("downscale", &self.downscale)
            .field("mem_bytes", &self.mem_bytes)
            .field("texture", &self.texture_object())
            .finish()
    }
}
