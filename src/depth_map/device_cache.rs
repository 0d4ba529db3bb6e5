//! Sliding window of device cameras.
//!
//! The cache owns a fixed set of [`DeviceCamera`] slots and maps
//! `(global camera id, downscale)` keys onto them, evicting the least
//! recently used camera when every slot is taken.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::depth_map::common::error::{DeviceError, Result};
use crate::depth_map::device_camera::DeviceCamera;
use crate::depth_map::preprocess::FrameGeometry;
use crate::depth_map::runtime::GpuRuntime;
use crate::depth_map::texture::TextureConfig;
use crate::depth_map::types::{DeviceCameraParams, ExecutionContext, HostFrame};

/// Configuration for the device camera cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Number of device camera slots, at most the constant table capacity
    pub max_cameras: usize,
    /// Sampling of the frame textures
    pub texture: TextureConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_cameras: 8,
            texture: TextureConfig::from_build_features(),
        }
    }
}

impl CacheConfig {
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }
}

/// Builder for CacheConfig
#[derive(Default)]
pub struct CacheConfigBuilder {
    max_cameras: Option<usize>,
    texture: Option<TextureConfig>,
}

impl CacheConfigBuilder {
    pub fn max_cameras(mut self, max_cameras: usize) -> Self {
        self.max_cameras = Some(max_cameras);
        self
    }

    pub fn texture(mut self, texture: TextureConfig) -> Self {
        self.texture = Some(texture);
        self
    }

    pub fn build(self) -> CacheConfig {
        let default = CacheConfig::default();
        CacheConfig {
            max_cameras: self.max_cameras.unwrap_or(default.max_cameras),
            texture: self.texture.unwrap_or(default.texture),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CameraKey {
    global_cam_id: usize,
    downscale: u32,
}

pub struct DeviceCameraCache<R: GpuRuntime> {
    cameras: Vec<DeviceCamera<R>>,
    keys: Vec<Option<CameraKey>>,
    /// Slot indices, least recently used first.
    lru: VecDeque<usize>,
    config: CacheConfig,
}

impl<R: GpuRuntime> DeviceCameraCache<R> {
    pub fn new(runtime: &Arc<R>, config: CacheConfig) -> Result<Self> {
        let capacity = runtime.camera_params_capacity();
        if config.max_cameras == 0 || config.max_cameras > capacity {
            return Err(DeviceError::InvalidConfiguration(format!(
                "max_cameras must be in 1..={capacity}, got {}",
                config.max_cameras
            )));
        }

        let cameras = (0..config.max_cameras)
            .map(|slot| DeviceCamera::new(runtime, slot, config.texture))
            .collect::<Result<Vec<_>>>()?;

        info!(
            runtime = runtime.name(),
            slots = config.max_cameras,
            "Device camera cache initialized"
        );

        Ok(Self {
            cameras,
            keys: vec![None; config.max_cameras],
            lru: VecDeque::with_capacity(config.max_cameras),
            config,
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Makes camera `global_cam_id` at `downscale` resident and returns its slot.
    ///
    /// A camera already resident with the same downscale is not uploaded again.
    #[instrument(skip(self, frame, camera_params, ctx))]
    pub fn add_camera(
        &mut self,
        global_cam_id: usize,
        downscale: u32,
        frame: &HostFrame,
        camera_params: &DeviceCameraParams,
        ctx: ExecutionContext,
    ) -> Result<usize> {
        // a rejected request must not evict anything
        FrameGeometry::checked(frame.size(), downscale)?;

        let key = CameraKey { global_cam_id, downscale };

        if let Some(slot) = self.find(key) {
            debug!(slot, "Camera already resident");
            self.touch(slot);
            return Ok(slot);
        }

        let slot = match self.keys.iter().position(Option::is_none) {
            Some(free) => free,
            None => self
                .lru
                .front()
                .copied()
                .ok_or_else(|| DeviceError::InvariantViolation("no device camera slot available".to_string()))?,
        };
        if let Some(evicted) = self.keys[slot] {
            debug!(slot, evicted = evicted.global_cam_id, "Evicting camera");
        }

        // a failed fill leaves the slot unusable until it is filled again
        self.keys[slot] = None;
        self.lru.retain(|&s| s != slot);

        self.cameras[slot].fill(
            global_cam_id,
            downscale,
            frame.width(),
            frame.height(),
            frame,
            camera_params,
            ctx,
        )?;

        self.keys[slot] = Some(key);
        self.lru.push_back(slot);
        Ok(slot)
    }

    /// Resident camera for `global_cam_id` at `downscale`, marked as most recently used.
    pub fn request_camera(&mut self, global_cam_id: usize, downscale: u32) -> Option<&DeviceCamera<R>> {
        let slot = self.find(CameraKey { global_cam_id, downscale })?;
        self.touch(slot);
        Some(&self.cameras[slot])
    }

    pub fn contains(&self, global_cam_id: usize, downscale: u32) -> bool {
        self.find(CameraKey { global_cam_id, downscale }).is_some()
    }

    pub fn camera(&self, slot: usize) -> Option<&DeviceCamera<R>> {
        self.cameras.get(slot)
    }

    pub fn cameras(&self) -> &[DeviceCamera<R>] {
        &self.cameras
    }

    pub fn resident_count(&self) -> usize {
        self.keys.iter().flatten().count()
    }

    /// Total padded device frame memory held by all slots.
    pub fn memory_footprint(&self) -> usize {
        self.cameras.iter().map(DeviceCamera::memory_footprint).sum()
    }

    fn find(&self, key: CameraKey) -> Option<usize> {
        self.keys.iter().position(|k| *k == Some(key))
    }

    fn touch(&mut self, slot: usize) {
        self.lru.retain(|&s| s != slot);
        self.lru.push_back(slot);
    }
}
