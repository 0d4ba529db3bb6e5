//! Types shared by the device camera layer

use bytemuck::{Pod, Zeroable};

use crate::depth_map::common::error::{DeviceError, Result};

/// Four-channel float pixel, laid out like the device `float4`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct Rgba {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Rgba {
    pub const fn new(x: f32, y: f32, z: f32, w: f32) -> Self {
        Self { x, y, z, w }
    }

    pub fn scale(self, factor: f32) -> Self {
        Self::new(self.x * factor, self.y * factor, self.z * factor, self.w * factor)
    }

    pub fn add(self, other: Self) -> Self {
        Self::new(self.x + other.x, self.y + other.y, self.z + other.z, self.w + other.w)
    }

    pub fn max_abs_diff(self, other: Self) -> f32 {
        (self.x - other.x)
            .abs()
            .max((self.y - other.y).abs())
            .max((self.z - other.z).abs())
            .max((self.w - other.w).abs())
    }
}

/// Width/height pair in pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Size2 {
    pub width: usize,
    pub height: usize,
}

impl Size2 {
    pub const fn new(width: usize, height: usize) -> Self {
        Self { width, height }
    }

    pub fn area(&self) -> usize {
        self.width * self.height
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Integer floor division of both axes.
    pub fn downscaled(&self, downscale: u32) -> Self {
        let downscale = downscale.max(1) as usize;
        Self::new(self.width / downscale, self.height / downscale)
    }
}

impl std::fmt::Display for Size2 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Per-camera projection data stored in the device constant table.
///
/// The layout matches the device-side struct field for field; the
/// device layer copies it byte-wise and never reads the values.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct DeviceCameraParams {
    /// Projection matrix (3x4, row-major)
    pub p: [f32; 12],
    /// Inverse of the left 3x3 block of `p`
    pub i_p: [f32; 9],
    /// Rotation
    pub r: [f32; 9],
    pub i_r: [f32; 9],
    /// Intrinsics
    pub k: [f32; 9],
    pub i_k: [f32; 9],
    /// Camera center
    pub c: [f32; 3],
    pub x_vect: [f32; 3],
    pub y_vect: [f32; 3],
    pub z_vect: [f32; 3],
}

impl Default for DeviceCameraParams {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl DeviceCameraParams {
    pub const SIZE_BYTES: usize = std::mem::size_of::<Self>();
}

/// Host-resident RGBA frame, tightly packed row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct HostFrame {
    size: Size2,
    data: Vec<Rgba>,
}

impl HostFrame {
    pub fn new(width: usize, height: usize, data: Vec<Rgba>) -> Result<Self> {
        let size = Size2::new(width, height);
        if size.is_empty() {
            return Err(DeviceError::InvariantViolation(format!(
                "host frame must not be empty, got {size}"
            )));
        }
        if data.len() != size.area() {
            return Err(DeviceError::InvariantViolation(format!(
                "host frame {size} expects {} pixels, got {}",
                size.area(),
                data.len()
            )));
        }
        Ok(Self { size, data })
    }

    /// Builds a frame by evaluating `f(x, y)` for every pixel.
    pub fn from_fn(width: usize, height: usize, f: impl Fn(usize, usize) -> Rgba) -> Result<Self> {
        let data = (0..height)
            .flat_map(|y| (0..width).map(move |x| (x, y)))
            .map(|(x, y)| f(x, y))
            .collect();
        Self::new(width, height, data)
    }

    pub fn filled(width: usize, height: usize, value: Rgba) -> Result<Self> {
        Self::new(width, height, vec![value; width * height])
    }

    pub fn size(&self) -> Size2 {
        self.size
    }

    pub fn width(&self) -> usize {
        self.size.width
    }

    pub fn height(&self) -> usize {
        self.size.height
    }

    pub fn data(&self) -> &[Rgba] {
        &self.data
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.data)
    }

    pub fn pixel(&self, x: usize, y: usize) -> Rgba {
        self.data[y * self.size.width + x]
    }
}

/// Opaque stream identifier handed out by a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle(pub u64);

/// Where device work is enqueued.
///
/// `Synchronous` blocks the caller on every operation. `Stream` enqueues
/// without blocking; work on one stream runs in enqueue order, with no
/// ordering across streams.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExecutionContext {
    #[default]
    Synchronous,
    Stream(StreamHandle),
}

impl ExecutionContext {
    pub fn is_synchronous(&self) -> bool {
        matches!(self, Self::Synchronous)
    }
}
