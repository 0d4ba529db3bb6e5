use std::sync::Arc;

use depthmap_device_camera::depth_map::{
    CacheConfig, DeviceCameraCache, DeviceCameraParams, ExecutionContext, GpuRuntime, HostFrame, Rgba,
};
use depthmap_device_camera::logger;

use tracing::{error, info};

const FRAME_WIDTH: usize = 800;
const FRAME_HEIGHT: usize = 600;
const DOWNSCALE: u32 = 2;
const CAMERA_COUNT: usize = 6;
const WINDOW: usize = 3;

fn synthetic_frame(cam: usize) -> anyhow::Result<HostFrame> {
    let frame = HostFrame::from_fn(FRAME_WIDTH, FRAME_HEIGHT, |x, y| {
        let r = (x * 255 / FRAME_WIDTH) as f32;
        let g = (y * 255 / FRAME_HEIGHT) as f32;
        let b = ((cam * 40) % 256) as f32;
        Rgba::new(r, g, b, 1.0)
    })?;
    Ok(frame)
}

fn synthetic_params(cam: usize) -> DeviceCameraParams {
    let mut params = DeviceCameraParams::default();
    params.c = [cam as f32, 0.0, 0.0];
    params.z_vect = [0.0, 0.0, 1.0];
    params
}

fn run<R: GpuRuntime>(runtime: Arc<R>) -> anyhow::Result<()> {
    let config = CacheConfig::builder().max_cameras(WINDOW).build();
    let mut cache = DeviceCameraCache::new(&runtime, config)?;

    info!("Texture read mode: {:?}", cache.config().texture.read_mode);
    info!("Texture filter mode: {:?}", cache.config().texture.filter_mode);

    let stream = runtime.create_stream()?;
    let ctx = ExecutionContext::Stream(stream);

    for cam in 0..CAMERA_COUNT {
        let frame = synthetic_frame(cam)?;
        match cache.add_camera(cam, DOWNSCALE, &frame, &synthetic_params(cam), ctx) {
            Ok(slot) => {
                let camera = cache.camera(slot).map(|c| (c.width(), c.height()));
                info!(cam, slot, ?camera, "Camera resident");
            }
            Err(e) => error!("Failed to upload camera {cam}: {e}"),
        }
    }

    runtime.synchronize(ctx)?;
    runtime.destroy_stream(stream)?;

    info!(
        "Resident cameras: {}/{}, device memory: {} bytes",
        cache.resident_count(),
        WINDOW,
        cache.memory_footprint()
    );

    Ok(())
}

fn main() -> anyhow::Result<()> {
    logger::init();

    info!("Starting device camera upload...");

    #[cfg(cuda_backend)]
    {
        use depthmap_device_camera::depth_map::CudaRuntime;
        match CudaRuntime::new(0) {
            Ok(runtime) => return run(Arc::new(runtime)),
            Err(e) => error!("CUDA runtime unavailable, falling back to host emulation: {e}"),
        }
    }

    run(Arc::new(depthmap_device_camera::depth_map::CpuRuntime::new()))
}
