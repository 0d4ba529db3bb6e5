//! Device camera frames for depth map estimation
//!
//! Uploads camera frames to the accelerator, downscales and converts them to
//! CIELAB, and exposes them as textures for the matching kernels. Camera
//! parameters go to a constant-memory table indexed by device camera slot.

pub mod common;
pub mod device_cache;
pub mod device_camera;
pub mod memory;
pub mod parameter_table;
pub mod preprocess;
pub mod runtime;
pub mod texture;
pub mod types;


pub use common::{
    DeviceError,
    ErrorKind,
    Result,
};

pub use types::{
    DeviceCameraParams,
    ExecutionContext,
    HostFrame,
    Rgba,
    Size2,
    StreamHandle,
};

pub use runtime::{
    CpuRuntime,
    FilterMode,
    GpuRuntime,
    ReadMode,
    TextureHandle,
};

#[cfg(cuda_backend)]
pub use runtime::CudaRuntime;

pub use texture::{
    TextureBuilder,
    TextureConfig,
    TextureConfigBuilder,
};

pub use parameter_table::{
    CameraParamsTable,
    MAX_CONSTANT_CAMERA_PARAM_SETS,
};

pub use device_camera::DeviceCamera;

pub use device_cache::{
    CacheConfig,
    CacheConfigBuilder,
    DeviceCameraCache,
};
