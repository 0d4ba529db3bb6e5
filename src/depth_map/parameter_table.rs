//! Constant-memory camera parameter table.
//!
//! The table lives in device constant memory and holds one
//! [`DeviceCameraParams`] record per device camera slot. Slots are
//! independent; each slot has a single writer, the [`DeviceCamera`] that owns
//! it. Nothing here serializes concurrent writers of the same slot.
//!
//! [`DeviceCamera`]: crate::depth_map::DeviceCamera

use std::sync::Arc;

use tracing::trace;

use crate::depth_map::common::error::{DeviceError, Result};
use crate::depth_map::memory::PinnedHostBox;
use crate::depth_map::runtime::GpuRuntime;
use crate::depth_map::types::{DeviceCameraParams, ExecutionContext};

/// Number of camera parameter records in device constant memory.
pub const MAX_CONSTANT_CAMERA_PARAM_SETS: usize = 100;

pub struct CameraParamsTable<R: GpuRuntime> {
    runtime: Arc<R>,
}

impl<R: GpuRuntime> Clone for CameraParamsTable<R> {
    fn clone(&self) -> Self {
        Self {
            runtime: Arc::clone(&self.runtime),
        }
    }
}

impl<R: GpuRuntime> CameraParamsTable<R> {
    pub fn new(runtime: &Arc<R>) -> Self {
        Self {
            runtime: Arc::clone(runtime),
        }
    }

    pub fn capacity(&self) -> usize {
        self.runtime.camera_params_capacity()
    }

    pub fn check_slot(&self, slot: usize) -> Result<()> {
        let capacity = self.capacity();
        if slot >= capacity {
            return Err(DeviceError::InvalidSlot { slot, capacity });
        }
        Ok(())
    }

    /// Copies the staged record into `slot`.
    ///
    /// Blocks for a synchronous context; otherwise the write is ordered only
    /// with later work on the same stream.
    pub fn set_slot(
        &self,
        slot: usize,
        staging: &PinnedHostBox<R, DeviceCameraParams>,
        ctx: ExecutionContext,
    ) -> Result<()> {
        self.check_slot(slot)?;
        trace!(slot, ?ctx, "Writing camera parameters");
        self.runtime.write_camera_params(slot, staging.ptr(), ctx)
    }

    pub fn get_slot(&self, slot: usize) -> Result<DeviceCameraParams> {
        self.check_slot(slot)?;
        let bytes = self.runtime.read_camera_params(slot)?;
        bytemuck::try_pod_read_unaligned(&bytes)
            .map_err(|e| DeviceError::transfer("read_camera_params", format!("{e:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::depth_map::runtime::CpuRuntime;

    fn params_with(value: f32) -> DeviceCameraParams {
        DeviceCameraParams {
            p: [value; 12],
            c: [value, -value, 2.0 * value],
            ..DeviceCameraParams::default()
        }
    }

    #[test]
    fn test_slots_are_independent() {
        let runtime = Arc::new(CpuRuntime::new());
        let table = CameraParamsTable::new(&runtime);

        for slot in 0..table.capacity() {
            let staging = PinnedHostBox::new(&runtime, &params_with(slot as f32)).unwrap();
            table.set_slot(slot, &staging, ExecutionContext::Synchronous).unwrap();
        }

        let staging = PinnedHostBox::new(&runtime, &params_with(-1.0)).unwrap();
        table.set_slot(7, &staging, ExecutionContext::Synchronous).unwrap();

        for slot in 0..table.capacity() {
            let expected = if slot == 7 { params_with(-1.0) } else { params_with(slot as f32) };
            assert_eq!(table.get_slot(slot).unwrap(), expected);
        }
    }

    #[test]
    fn test_out_of_range_slot_is_rejected() {
        let runtime = Arc::new(CpuRuntime::new());
        let table = CameraParamsTable::new(&runtime);
        let staging = PinnedHostBox::new(&runtime, &params_with(1.0)).unwrap();

        let err = table
            .set_slot(MAX_CONSTANT_CAMERA_PARAM_SETS, &staging, ExecutionContext::Synchronous)
            .unwrap_err();
        assert!(matches!(
            err,
            DeviceError::InvalidSlot { slot: MAX_CONSTANT_CAMERA_PARAM_SETS, capacity: MAX_CONSTANT_CAMERA_PARAM_SETS }
        ));
    }

    #[test]
    fn test_stream_write_is_visible_after_synchronize() {
        let runtime = Arc::new(CpuRuntime::new());
        let table = CameraParamsTable::new(&runtime);
        let stream = ExecutionContext::Stream(runtime.create_stream().unwrap());

        let staging = PinnedHostBox::new(&runtime, &params_with(3.0)).unwrap();
        table.set_slot(3, &staging, stream).unwrap();
        runtime.synchronize(stream).unwrap();

        assert_eq!(table.get_slot(3).unwrap(), params_with(3.0));
    }
}
