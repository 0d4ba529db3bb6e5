//! Host frame upload, optional downscale and CIELAB conversion.

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::depth_map::common::error::{DeviceError, Result};
use crate::depth_map::memory::DeviceFrameBuffer;
use crate::depth_map::runtime::GpuRuntime;
use crate::depth_map::texture::TextureBuilder;
use crate::depth_map::types::{ExecutionContext, HostFrame, Size2};

/// Source and target resolution of one upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGeometry {
    pub original: Size2,
    pub scaled: Size2,
    pub downscale: u32,
}

impl FrameGeometry {
    pub fn new(original: Size2, downscale: u32) -> Self {
        Self {
            original,
            scaled: original.downscaled(downscale),
            downscale,
        }
    }

    /// Geometry for a fill, rejecting a zero downscale or an empty scaled frame.
    pub fn checked(original: Size2, downscale: u32) -> Result<Self> {
        if downscale == 0 {
            return Err(DeviceError::InvariantViolation("downscale must be at least 1".to_string()));
        }
        let geometry = Self::new(original, downscale);
        if geometry.scaled.is_empty() {
            return Err(DeviceError::InvariantViolation(format!(
                "downscale {downscale} reduces {original} to an empty frame"
            )));
        }
        Ok(geometry)
    }

    /// The Gaussian support grows with the decimation ratio.
    pub fn blur_radius(&self) -> u32 {
        self.downscale
    }
}

/// Fills `target` from `frame`, downscaling when needed, then converts it to CIELAB.
///
/// The color conversion always runs exactly once, after the copy or downscale.
/// When downscaling, a full resolution buffer and texture are created for the
/// duration of the call only.
#[instrument(skip_all, fields(original = %geometry.original, scaled = %geometry.scaled, downscale = geometry.downscale))]
pub fn fill_device_frame_from_host_frame<R: GpuRuntime>(
    runtime: &Arc<R>,
    target: &DeviceFrameBuffer<R>,
    geometry: &FrameGeometry,
    texture_builder: &TextureBuilder,
    frame: &HostFrame,
    ctx: ExecutionContext,
) -> Result<()> {
    if frame.size() != geometry.original {
        return Err(DeviceError::InvariantViolation(format!(
            "host frame is {} but camera expects {}",
            frame.size(),
            geometry.original
        )));
    }
    if target.size() != geometry.scaled {
        return Err(DeviceError::InvariantViolation(format!(
            "device frame is {} but scaled size is {}",
            target.size(),
            geometry.scaled
        )));
    }

    if geometry.downscale <= 1 {
        // no need to downscale
        if geometry.original != geometry.scaled {
            return Err(DeviceError::InvariantViolation(format!(
                "downscale {} leaves {} unchanged but scaled size is {}",
                geometry.downscale, geometry.original, geometry.scaled
            )));
        }
        target.copy_from_host(frame, ctx)?;
    } else {
        downscale_into(runtime, target, geometry, texture_builder, frame, ctx)?;
    }

    runtime.rgb_to_lab_in_place(target.allocation(), geometry.scaled, ctx)
}

fn downscale_into<R: GpuRuntime>(
    runtime: &Arc<R>,
    target: &DeviceFrameBuffer<R>,
    geometry: &FrameGeometry,
    texture_builder: &TextureBuilder,
    frame: &HostFrame,
    ctx: ExecutionContext,
) -> Result<()> {
    let full = DeviceFrameBuffer::new(runtime, frame.size())?;
    let full_texture = texture_builder.build(runtime, &full)?;
    debug!(size = %full.size(), "Allocated full resolution frame for downscale");

    let queued = full.copy_from_host(frame, ctx).and_then(|()| {
        runtime.downscale_with_gaussian_blur(
            target.allocation(),
            full_texture.handle(),
            geometry.downscale,
            geometry.scaled,
            geometry.blur_radius(),
            ctx,
        )
    });

    // the kernel samples the temporaries until the stream drains
    let drained = wait_before_release(runtime.as_ref(), ctx);

    drop(full_texture);
    drop(full);
    queued.and(drained)
}

/// Blocks until work queued on a stream is done, so memory it reads can be released.
///
/// Synchronous contexts have already completed their work.
pub(crate) fn wait_before_release<R: GpuRuntime>(runtime: &R, ctx: ExecutionContext) -> Result<()> {
    match ctx {
        ExecutionContext::Synchronous => Ok(()),
        ExecutionContext::Stream(_) => runtime.synchronize(ctx),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::depth_map::runtime::{CpuRuntime, RuntimeEvent};
    use crate::depth_map::runtime::cpu_runtime::rgb_to_lab;
    use crate::depth_map::texture::TextureConfig;
    use crate::depth_map::types::Rgba;

    fn gradient(width: usize, height: usize) -> HostFrame {
        HostFrame::from_fn(width, height, |x, y| {
            Rgba::new((x * 7 % 256) as f32, (y * 5 % 256) as f32, ((x + y) % 256) as f32, 1.0)
        })
        .unwrap()
    }

    #[test]
    fn test_geometry_uses_floor_division() {
        let geometry = FrameGeometry::new(Size2::new(800, 600), 3);
        assert_eq!(geometry.scaled, Size2::new(266, 200));
        assert_eq!(geometry.blur_radius(), 3);
    }

    #[test]
    fn test_full_resolution_path_copies_then_converts() {
        let runtime = Arc::new(CpuRuntime::new());
        let frame = gradient(12, 9);
        let geometry = FrameGeometry::new(frame.size(), 1);
        let target = DeviceFrameBuffer::new(&runtime, geometry.scaled).unwrap();
        let builder = TextureBuilder::new(TextureConfig::default());
        runtime.clear_journal();

        fill_device_frame_from_host_frame(&runtime, &target, &geometry, &builder, &frame, ExecutionContext::Synchronous)
            .unwrap();

        let journal = runtime.journal();
        assert!(matches!(journal[0], RuntimeEvent::CopyFrameToDevice { .. }));
        assert!(matches!(journal[1], RuntimeEvent::RgbToLab { .. }));
        assert_eq!(journal.len(), 2);

        let result = target.copy_to_host(ExecutionContext::Synchronous).unwrap();
        for (got, input) in result.data().iter().zip(frame.data()) {
            assert!(got.max_abs_diff(rgb_to_lab(*input)) < 1e-4);
        }
    }

    #[test]
    fn test_downscale_path_releases_temporaries() {
        let runtime = Arc::new(CpuRuntime::new());
        let frame = gradient(16, 12);
        let geometry = FrameGeometry::new(frame.size(), 2);
        let target = DeviceFrameBuffer::new(&runtime, geometry.scaled).unwrap();
        let builder = TextureBuilder::new(TextureConfig::default());
        runtime.clear_journal();

        fill_device_frame_from_host_frame(&runtime, &target, &geometry, &builder, &frame, ExecutionContext::Synchronous)
            .unwrap();

        let journal = runtime.journal();
        let order: Vec<&str> = journal
            .iter()
            .map(|event| match event {
                RuntimeEvent::AllocPitched { .. } => "alloc",
                RuntimeEvent::CreateTexture { .. } => "texture",
                RuntimeEvent::CopyFrameToDevice { .. } => "copy",
                RuntimeEvent::DownscaleWithGaussianBlur { .. } => "downscale",
                RuntimeEvent::DestroyTexture { .. } => "destroy_texture",
                RuntimeEvent::FreePitched { .. } => "free",
                RuntimeEvent::RgbToLab { .. } => "lab",
                _ => "other",
            })
            .collect();
        assert_eq!(
            order,
            ["alloc", "texture", "copy", "downscale", "destroy_texture", "free", "lab"]
        );

        assert!(journal.iter().any(|event| matches!(
            event,
            RuntimeEvent::DownscaleWithGaussianBlur { downscale: 2, radius: 2, out_size, .. } if *out_size == Size2::new(8, 6)
        )));
        assert_eq!(runtime.live_buffers(), 1);
        assert_eq!(runtime.live_textures(), 0);
    }

    #[test]
    fn test_frame_size_mismatch_is_rejected() {
        let runtime = Arc::new(CpuRuntime::new());
        let frame = gradient(16, 12);
        let geometry = FrameGeometry::new(Size2::new(20, 12), 2);
        let target = DeviceFrameBuffer::new(&runtime, geometry.scaled).unwrap();
        let builder = TextureBuilder::new(TextureConfig::default());

        let err = fill_device_frame_from_host_frame(
            &runtime,
            &target,
            &geometry,
            &builder,
            &frame,
            ExecutionContext::Synchronous,
        )
        .unwrap_err();
        assert!(matches!(err, DeviceError::InvariantViolation(_)));
    }

    #[test]
    fn test_temporaries_released_when_downscale_fails() {
        let runtime = Arc::new(CpuRuntime::new());
        let frame = gradient(16, 12);
        let geometry = FrameGeometry::new(frame.size(), 2);
        let target = DeviceFrameBuffer::new(&runtime, geometry.scaled).unwrap();
        let builder = TextureBuilder::new(TextureConfig::default());
        let stream = runtime.create_stream().unwrap();
        runtime.destroy_stream(stream).unwrap();

        let err = fill_device_frame_from_host_frame(
            &runtime,
            &target,
            &geometry,
            &builder,
            &frame,
            ExecutionContext::Stream(stream),
        )
        .unwrap_err();

        assert!(matches!(err, DeviceError::TransferFailure { .. }));
        assert_eq!(runtime.live_buffers(), 1);
        assert_eq!(runtime.live_textures(), 0);
    }

    #[test]
    fn test_stream_downscale_drains_before_releasing_temporaries() {
        let runtime = Arc::new(CpuRuntime::new());
        let frame = gradient(16, 12);
        let geometry = FrameGeometry::new(frame.size(), 2);
        let target = DeviceFrameBuffer::new(&runtime, geometry.scaled).unwrap();
        let builder = TextureBuilder::new(TextureConfig::default());
        let ctx = ExecutionContext::Stream(runtime.create_stream().unwrap());
        runtime.clear_journal();

        fill_device_frame_from_host_frame(&runtime, &target, &geometry, &builder, &frame, ctx).unwrap();

        let order: Vec<&str> = runtime
            .journal()
            .iter()
            .filter_map(|event| match event {
                RuntimeEvent::DownscaleWithGaussianBlur { .. } => Some("downscale"),
                RuntimeEvent::Synchronize { ctx: synced } if *synced == ctx => Some("sync"),
                RuntimeEvent::DestroyTexture { .. } => Some("destroy_texture"),
                RuntimeEvent::FreePitched { .. } => Some("free"),
                _ => None,
            })
            .collect();
        assert_eq!(order, ["downscale", "sync", "destroy_texture", "free"]);
    }

    #[test]
    fn test_checked_geometry_rejects_degenerate_downscale() {
        let err = FrameGeometry::checked(Size2::new(8, 8), 0).unwrap_err();
        assert!(matches!(err, DeviceError::InvariantViolation(_)));

        let err = FrameGeometry::checked(Size2::new(8, 8), 9).unwrap_err();
        assert!(matches!(err, DeviceError::InvariantViolation(_)));

        let geometry = FrameGeometry::checked(Size2::new(8, 6), 2).unwrap();
        assert_eq!(geometry.scaled, Size2::new(4, 3));
    }
}
