use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use depthmap_device_camera::depth_map::{
    CpuRuntime, DeviceCamera, DeviceCameraParams, ExecutionContext, HostFrame, Rgba, TextureConfig,
};
use std::sync::Arc;

fn generate_mock_frame(width: usize, height: usize) -> HostFrame {
    HostFrame::from_fn(width, height, |x, y| {
        let value = ((x + y) % 256) as f32;
        Rgba::new(value, 255.0 - value, (x % 256) as f32, 1.0)
    })
    .expect("mock frame dimensions are consistent")
}

fn benchmark_fill_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("fill_by_size");

    let sizes = vec![
        (100, 100, "100x100"),
        (320, 240, "320x240"),
        (640, 480, "640x480"),
    ];

    for (width, height, label) in sizes {
        let frame = generate_mock_frame(width, height);

        group.bench_with_input(BenchmarkId::from_parameter(label), &frame, |b, frame| {
            let runtime = Arc::new(CpuRuntime::new());
            let mut camera = DeviceCamera::new(&runtime, 0, TextureConfig::default()).expect("slot 0 is valid");
            let params = DeviceCameraParams::default();

            b.iter(|| {
                camera.fill(
                    0,
                    1,
                    frame.width(),
                    frame.height(),
                    black_box(frame),
                    &params,
                    ExecutionContext::Synchronous,
                )
                .expect("fill succeeds");
            });
        });
    }

    group.finish();
}

fn benchmark_downscale_factors(c: &mut Criterion) {
    let mut group = c.benchmark_group("fill_by_downscale");
    let frame = generate_mock_frame(320, 240);

    for downscale in [1u32, 2, 4] {
        group.bench_with_input(BenchmarkId::from_parameter(downscale), &downscale, |b, &downscale| {
            let runtime = Arc::new(CpuRuntime::new());
            let mut camera = DeviceCamera::new(&runtime, 0, TextureConfig::default()).expect("slot 0 is valid");
            let params = DeviceCameraParams::default();

            b.iter(|| {
                camera.fill(
                    0,
                    downscale,
                    frame.width(),
                    frame.height(),
                    black_box(&frame),
                    &params,
                    ExecutionContext::Synchronous,
                )
                .expect("fill succeeds");
            });
        });
    }

    group.finish();
}

fn benchmark_frame_reuse(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_reuse");
    let small = generate_mock_frame(200, 150);
    let large = generate_mock_frame(400, 300);
    let params = DeviceCameraParams::default();

    group.bench_function("same_size", |b| {
        let runtime = Arc::new(CpuRuntime::new());
        let mut camera = DeviceCamera::new(&runtime, 0, TextureConfig::default()).expect("slot 0 is valid");

        b.iter(|| {
            camera.fill(0, 1, 200, 150, black_box(&small), &params, ExecutionContext::Synchronous).expect("fill succeeds");
        });
    });

    group.bench_function("alternating_size", |b| {
        let runtime = Arc::new(CpuRuntime::new());
        let mut camera = DeviceCamera::new(&runtime, 0, TextureConfig::default()).expect("slot 0 is valid");

        b.iter(|| {
            camera.fill(0, 1, 200, 150, black_box(&small), &params, ExecutionContext::Synchronous).expect("fill succeeds");
            camera.fill(1, 1, 400, 300, black_box(&large), &params, ExecutionContext::Synchronous).expect("fill succeeds");
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_fill_sizes,
    benchmark_downscale_factors,
    benchmark_frame_reuse
);
criterion_main!(benches);
