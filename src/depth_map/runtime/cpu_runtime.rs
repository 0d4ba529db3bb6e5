//! Host emulation of the accelerator runtime.
//!
//! Allocations are real pitched layouts with rows padded to
//! [`PITCH_ALIGNMENT`] bytes, textures sample through their resource
//! descriptor exactly as written (a wrong pitch reads the wrong texels), and
//! every call is appended to a journal that tests and tooling can inspect.
//! Enqueued work runs eagerly, so stream ordering holds trivially.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::trace;

use super::{
    AddressMode, ChannelFormat, DevicePtr, FilterMode, GpuRuntime, HostPtr, PitchedAllocation,
    ResourceDesc, TextureDesc, TextureHandle,
};
use crate::depth_map::common::error::{DeviceError, Result};
use crate::depth_map::parameter_table::MAX_CONSTANT_CAMERA_PARAM_SETS;
use crate::depth_map::types::{DeviceCameraParams, ExecutionContext, HostFrame, Rgba, Size2, StreamHandle};

/// Row alignment of pitched allocations, in bytes.
pub const PITCH_ALIGNMENT: usize = 512;

/// Required alignment of a texture's row pitch, in bytes.
pub const TEXTURE_PITCH_ALIGNMENT: usize = 32;

const ELEMENT_SIZE: usize = PitchedAllocation::ELEMENT_SIZE;

/// One recorded runtime call.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeEvent {
    CreateStream { stream: StreamHandle },
    DestroyStream { stream: StreamHandle },
    Synchronize { ctx: ExecutionContext },
    AllocPitched { ptr: DevicePtr, size: Size2, pitch: usize },
    FreePitched { ptr: DevicePtr },
    AllocPinned { ptr: HostPtr, bytes: usize },
    FreePinned { ptr: HostPtr },
    CopyFrameToDevice { dst: DevicePtr, size: Size2, ctx: ExecutionContext },
    CopyFrameToHost { src: DevicePtr, ctx: ExecutionContext },
    WriteCameraParams { slot: usize, ctx: ExecutionContext },
    CreateTexture { texture: TextureHandle, resource: ResourceDesc, sampling: TextureDesc },
    DestroyTexture { texture: TextureHandle },
    DownscaleWithGaussianBlur {
        dst: DevicePtr,
        src: TextureHandle,
        downscale: u32,
        out_size: Size2,
        radius: u32,
        ctx: ExecutionContext,
    },
    RgbToLab { buffer: DevicePtr, size: Size2, ctx: ExecutionContext },
}

struct PitchedStorage {
    size: Size2,
    pitch: usize,
    texels: Vec<Rgba>,
}

impl PitchedStorage {
    fn row_elements(&self) -> usize {
        self.pitch / ELEMENT_SIZE
    }
}

#[derive(Debug, Clone, Copy)]
struct TextureRecord {
    resource: ResourceDesc,
    sampling: TextureDesc,
}

#[derive(Default)]
struct CpuState {
    next_id: u64,
    buffers: HashMap<u64, PitchedStorage>,
    pinned: HashMap<u64, Vec<u8>>,
    textures: HashMap<u64, TextureRecord>,
    streams: HashSet<u64>,
    camera_params: Vec<u8>,
    device_bytes_in_use: usize,
    journal: Vec<RuntimeEvent>,
}

impl CpuState {
    /// Handles are never reused, so a stale handle never aliases a live one.
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn stream_is_valid(&self, ctx: ExecutionContext) -> bool {
        match ctx {
            ExecutionContext::Synchronous => true,
            ExecutionContext::Stream(stream) => self.streams.contains(&stream.0),
        }
    }
}

/// Device emulation running entirely on the host.
pub struct CpuRuntime {
    state: Mutex<CpuState>,
    camera_params_capacity: usize,
    memory_limit: Option<usize>,
}

impl Default for CpuRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuRuntime {
    pub fn new() -> Self {
        Self::with_capacity(MAX_CONSTANT_CAMERA_PARAM_SETS)
    }

    /// Runtime whose constant camera table holds `capacity` records.
    pub fn with_capacity(capacity: usize) -> Self {
        let state = CpuState {
            camera_params: vec![0u8; capacity * DeviceCameraParams::SIZE_BYTES],
            ..CpuState::default()
        };
        Self {
            state: Mutex::new(state),
            camera_params_capacity: capacity,
            memory_limit: None,
        }
    }

    /// Fails pitched allocations that would push device usage past `bytes`.
    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    fn state(&self) -> MutexGuard<'_, CpuState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn journal(&self) -> Vec<RuntimeEvent> {
        self.state().journal.clone()
    }

    pub fn clear_journal(&self) {
        self.state().journal.clear();
    }

    pub fn live_buffers(&self) -> usize {
        self.state().buffers.len()
    }

    pub fn live_textures(&self) -> usize {
        self.state().textures.len()
    }

    pub fn live_pinned(&self) -> usize {
        self.state().pinned.len()
    }

    pub fn is_texture_live(&self, texture: TextureHandle) -> bool {
        self.state().textures.contains_key(&texture.0)
    }

    pub fn device_bytes_in_use(&self) -> usize {
        self.state().device_bytes_in_use
    }

    /// Descriptors a live texture was created with.
    pub fn texture_descriptors(&self, texture: TextureHandle) -> Option<(ResourceDesc, TextureDesc)> {
        self.state()
            .textures
            .get(&texture.0)
            .map(|record| (record.resource, record.sampling))
    }

    /// Samples a live texture at unnormalized coordinates `(u, v)`.
    pub fn sample_texture(&self, texture: TextureHandle, u: f32, v: f32) -> Result<Rgba> {
        let state = self.state();
        let record = state
            .textures
            .get(&texture.0)
            .ok_or_else(|| DeviceError::kernel("tex2D", format!("invalid texture object {}", texture.0)))?;
        let storage = state
            .buffers
            .get(&record.resource.ptr.0)
            .ok_or_else(|| DeviceError::kernel("tex2D", "texture references freed device memory"))?;
        Ok(sample(storage, record, u, v))
    }
}

/// Gaussian weight of a tap `offset` texels from the center, for a filter of `radius`.
pub fn gaussian_weight(offset: i32, radius: u32) -> f32 {
    let sigma = (radius as f32 * 0.5).max(0.5);
    let d = offset as f32;
    (-(d * d) / (2.0 * sigma * sigma)).exp()
}

/// sRGB (channels in `[0, 255]`, D65) to CIELAB; `w` passes through.
pub fn rgb_to_lab(pixel: Rgba) -> Rgba {
    fn linearize(c: f32) -> f32 {
        let c = c / 255.0;
        if c > 0.04045 {
            ((c + 0.055) / 1.055).powf(2.4)
        } else {
            c / 12.92
        }
    }

    fn f(t: f32) -> f32 {
        const DELTA: f32 = 6.0 / 29.0;
        if t > DELTA * DELTA * DELTA {
            t.cbrt()
        } else {
            t / (3.0 * DELTA * DELTA) + 4.0 / 29.0
        }
    }

    let r = linearize(pixel.x);
    let g = linearize(pixel.y);
    let b = linearize(pixel.z);

    // D65 reference white
    let x = (0.412_456_4 * r + 0.357_576_1 * g + 0.180_437_5 * b) / 0.950_47;
    let y = 0.212_672_9 * r + 0.715_152_2 * g + 0.072_175 * b;
    let z = (0.019_333_9 * r + 0.119_192 * g + 0.950_304_1 * b) / 1.088_83;

    let (fx, fy, fz) = (f(x), f(y), f(z));
    Rgba::new(116.0 * fy - 16.0, 500.0 * (fx - fy), 200.0 * (fy - fz), pixel.w)
}

fn address(coord: i64, extent: usize, mode: AddressMode) -> usize {
    let extent = extent as i64;
    match mode {
        AddressMode::Clamp => coord.clamp(0, extent - 1) as usize,
        AddressMode::Wrap => coord.rem_euclid(extent) as usize,
    }
}

fn fetch(storage: &PitchedStorage, record: &TextureRecord, i: i64, j: i64) -> Rgba {
    let resource = &record.resource;
    let x = address(i, resource.width, record.sampling.address_mode[0]);
    let y = address(j, resource.height, record.sampling.address_mode[1]);
    // The descriptor's pitch is trusted, like the hardware does.
    let row = resource.pitch_in_bytes / ELEMENT_SIZE;
    storage.texels[y * row + x]
}

fn sample(storage: &PitchedStorage, record: &TextureRecord, u: f32, v: f32) -> Rgba {
    let (u, v) = if record.sampling.normalized_coords {
        (u * record.resource.width as f32, v * record.resource.height as f32)
    } else {
        (u, v)
    };

    match record.sampling.filter_mode {
        FilterMode::Point => fetch(storage, record, u.floor() as i64, v.floor() as i64),
        FilterMode::Linear => {
            let xb = u - 0.5;
            let yb = v - 0.5;
            let i0 = xb.floor();
            let j0 = yb.floor();
            let a = xb - i0;
            let b = yb - j0;
            let (i0, j0) = (i0 as i64, j0 as i64);

            let t00 = fetch(storage, record, i0, j0);
            let t10 = fetch(storage, record, i0 + 1, j0);
            let t01 = fetch(storage, record, i0, j0 + 1);
            let t11 = fetch(storage, record, i0 + 1, j0 + 1);

            t00.scale((1.0 - a) * (1.0 - b))
                .add(t10.scale(a * (1.0 - b)))
                .add(t01.scale((1.0 - a) * b))
                .add(t11.scale(a * b))
        }
    }
}

fn check_allocation<'a>(
    state: &'a mut CpuState,
    alloc: &PitchedAllocation,
) -> std::result::Result<&'a mut PitchedStorage, String> {
    let storage = state
        .buffers
        .get_mut(&alloc.ptr.0)
        .ok_or_else(|| format!("invalid device pointer {:#x}", alloc.ptr.0))?;
    if storage.size != alloc.size || storage.pitch != alloc.pitch {
        return Err(format!(
            "allocation descriptor {} (pitch {}) does not match device memory {} (pitch {})",
            alloc.size, alloc.pitch, storage.size, storage.pitch
        ));
    }
    Ok(storage)
}

impl GpuRuntime for CpuRuntime {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn camera_params_capacity(&self) -> usize {
        self.camera_params_capacity
    }

    fn create_stream(&self) -> Result<StreamHandle> {
        let mut state = self.state();
        let stream = StreamHandle(state.next_id());
        state.streams.insert(stream.0);
        state.journal.push(RuntimeEvent::CreateStream { stream });
        Ok(stream)
    }

    fn destroy_stream(&self, stream: StreamHandle) -> Result<()> {
        let mut state = self.state();
        if !state.streams.remove(&stream.0) {
            return Err(DeviceError::transfer(
                "destroy_stream",
                format!("invalid stream handle {}", stream.0),
            ));
        }
        state.journal.push(RuntimeEvent::DestroyStream { stream });
        Ok(())
    }

    fn synchronize(&self, ctx: ExecutionContext) -> Result<()> {
        let mut state = self.state();
        if !state.stream_is_valid(ctx) {
            return Err(DeviceError::transfer("synchronize", "invalid stream handle"));
        }
        state.journal.push(RuntimeEvent::Synchronize { ctx });
        Ok(())
    }

    fn alloc_pitched(&self, size: Size2) -> Result<PitchedAllocation> {
        if size.is_empty() {
            return Err(DeviceError::allocation(
                "alloc_pitched",
                format!("invalid pitched allocation size {size}"),
            ));
        }

        let pitch = (size.width * ELEMENT_SIZE).div_ceil(PITCH_ALIGNMENT) * PITCH_ALIGNMENT;
        let bytes = pitch * size.height;

        let mut state = self.state();
        if let Some(limit) = self.memory_limit {
            if state.device_bytes_in_use + bytes > limit {
                return Err(DeviceError::allocation(
                    "alloc_pitched",
                    format!(
                        "out of memory: requested {bytes} bytes, {} of {limit} in use",
                        state.device_bytes_in_use
                    ),
                ));
            }
        }

        let ptr = DevicePtr(state.next_id());
        state.buffers.insert(
            ptr.0,
            PitchedStorage {
                size,
                pitch,
                texels: vec![Rgba::default(); bytes / ELEMENT_SIZE],
            },
        );
        state.device_bytes_in_use += bytes;
        state.journal.push(RuntimeEvent::AllocPitched { ptr, size, pitch });
        trace!(ptr = ptr.0, %size, pitch, "pitched allocation");

        Ok(PitchedAllocation { ptr, size, pitch })
    }

    fn free_pitched(&self, ptr: DevicePtr) -> Result<()> {
        let mut state = self.state();
        let storage = state
            .buffers
            .remove(&ptr.0)
            .ok_or_else(|| DeviceError::allocation("free_pitched", format!("invalid device pointer {:#x}", ptr.0)))?;
        state.device_bytes_in_use -= storage.pitch * storage.size.height;
        state.journal.push(RuntimeEvent::FreePitched { ptr });
        Ok(())
    }

    fn alloc_pinned(&self, bytes: usize) -> Result<HostPtr> {
        if bytes == 0 {
            return Err(DeviceError::allocation("alloc_pinned", "zero-sized pinned allocation"));
        }
        let mut state = self.state();
        let ptr = HostPtr(state.next_id());
        state.pinned.insert(ptr.0, vec![0u8; bytes]);
        state.journal.push(RuntimeEvent::AllocPinned { ptr, bytes });
        Ok(ptr)
    }

    fn free_pinned(&self, ptr: HostPtr) -> Result<()> {
        let mut state = self.state();
        if state.pinned.remove(&ptr.0).is_none() {
            return Err(DeviceError::allocation(
                "free_pinned",
                format!("invalid pinned host pointer {:#x}", ptr.0),
            ));
        }
        state.journal.push(RuntimeEvent::FreePinned { ptr });
        Ok(())
    }

    fn write_pinned(&self, ptr: HostPtr, bytes: &[u8]) -> Result<()> {
        let mut state = self.state();
        let memory = state
            .pinned
            .get_mut(&ptr.0)
            .ok_or_else(|| DeviceError::transfer("write_pinned", format!("invalid pinned host pointer {:#x}", ptr.0)))?;
        if bytes.len() > memory.len() {
            return Err(DeviceError::transfer(
                "write_pinned",
                format!("{} bytes do not fit in a {} byte pinned allocation", bytes.len(), memory.len()),
            ));
        }
        memory[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn copy_frame_to_device(&self, dst: &PitchedAllocation, frame: &HostFrame, ctx: ExecutionContext) -> Result<()> {
        let mut state = self.state();
        if !state.stream_is_valid(ctx) {
            return Err(DeviceError::transfer("copy_frame_to_device", "invalid stream handle"));
        }
        let storage = check_allocation(&mut state, dst).map_err(|e| DeviceError::transfer("copy_frame_to_device", e))?;
        if storage.size != frame.size() {
            return Err(DeviceError::transfer(
                "copy_frame_to_device",
                format!("host frame {} does not match device frame {}", frame.size(), storage.size),
            ));
        }

        let row = storage.row_elements();
        for (y, src_row) in frame.data().chunks_exact(frame.width()).enumerate() {
            storage.texels[y * row..y * row + frame.width()].copy_from_slice(src_row);
        }
        state.journal.push(RuntimeEvent::CopyFrameToDevice { dst: dst.ptr, size: dst.size, ctx });
        Ok(())
    }

    fn copy_frame_to_host(&self, src: &PitchedAllocation, ctx: ExecutionContext) -> Result<HostFrame> {
        let mut state = self.state();
        if !state.stream_is_valid(ctx) {
            return Err(DeviceError::transfer("copy_frame_to_host", "invalid stream handle"));
        }
        let storage = check_allocation(&mut state, src).map_err(|e| DeviceError::transfer("copy_frame_to_host", e))?;

        let row = storage.row_elements();
        let size = storage.size;
        let texels = &storage.texels;
        let data = (0..size.height)
            .flat_map(move |y| texels[y * row..y * row + size.width].iter().copied())
            .collect();
        state.journal.push(RuntimeEvent::CopyFrameToHost { src: src.ptr, ctx });
        HostFrame::new(size.width, size.height, data)
    }

    fn write_camera_params(&self, slot: usize, src: HostPtr, ctx: ExecutionContext) -> Result<()> {
        const RECORD: usize = DeviceCameraParams::SIZE_BYTES;

        let mut state = self.state();
        if !state.stream_is_valid(ctx) {
            return Err(DeviceError::transfer("write_camera_params", "invalid stream handle"));
        }
        if slot >= self.camera_params_capacity {
            return Err(DeviceError::transfer(
                "write_camera_params",
                format!("offset {} is outside the constant table", slot * RECORD),
            ));
        }

        let state = &mut *state;
        let record = state
            .pinned
            .get(&src.0)
            .ok_or_else(|| DeviceError::transfer("write_camera_params", format!("invalid pinned host pointer {:#x}", src.0)))?;
        if record.len() < RECORD {
            return Err(DeviceError::transfer(
                "write_camera_params",
                format!("pinned source holds {} bytes, record needs {RECORD}", record.len()),
            ));
        }
        state.camera_params[slot * RECORD..(slot + 1) * RECORD].copy_from_slice(&record[..RECORD]);
        state.journal.push(RuntimeEvent::WriteCameraParams { slot, ctx });
        Ok(())
    }

    fn read_camera_params(&self, slot: usize) -> Result<Vec<u8>> {
        const RECORD: usize = DeviceCameraParams::SIZE_BYTES;

        if slot >= self.camera_params_capacity {
            return Err(DeviceError::transfer(
                "read_camera_params",
                format!("offset {} is outside the constant table", slot * RECORD),
            ));
        }
        Ok(self.state().camera_params[slot * RECORD..(slot + 1) * RECORD].to_vec())
    }

    fn create_texture(&self, resource: &ResourceDesc, sampling: &TextureDesc) -> Result<TextureHandle> {
        let mut state = self.state();
        let storage = state.buffers.get(&resource.ptr.0).ok_or_else(|| {
            DeviceError::binding("create_texture", format!("invalid device pointer {:#x}", resource.ptr.0))
        })?;

        let ChannelFormat::Float4 = resource.format;
        if resource.width == 0 || resource.height == 0 {
            return Err(DeviceError::binding(
                "create_texture",
                format!("invalid texture extent {}x{}", resource.width, resource.height),
            ));
        }
        if resource.pitch_in_bytes % TEXTURE_PITCH_ALIGNMENT != 0 {
            return Err(DeviceError::binding(
                "create_texture",
                format!("pitch {} is not a multiple of {TEXTURE_PITCH_ALIGNMENT}", resource.pitch_in_bytes),
            ));
        }
        if resource.pitch_in_bytes < resource.width * ELEMENT_SIZE {
            return Err(DeviceError::binding(
                "create_texture",
                format!("pitch {} is smaller than a {} texel row", resource.pitch_in_bytes, resource.width),
            ));
        }
        if resource.pitch_in_bytes * resource.height > storage.texels.len() * ELEMENT_SIZE {
            return Err(DeviceError::binding(
                "create_texture",
                "resource descriptor exceeds the bound device allocation",
            ));
        }

        let texture = TextureHandle(state.next_id());
        state.textures.insert(
            texture.0,
            TextureRecord {
                resource: *resource,
                sampling: *sampling,
            },
        );
        state.journal.push(RuntimeEvent::CreateTexture {
            texture,
            resource: *resource,
            sampling: *sampling,
        });
        Ok(texture)
    }

    fn destroy_texture(&self, texture: TextureHandle) -> Result<()> {
        let mut state = self.state();
        if state.textures.remove(&texture.0).is_none() {
            return Err(DeviceError::binding(
                "destroy_texture",
                format!("invalid texture object {}", texture.0),
            ));
        }
        state.journal.push(RuntimeEvent::DestroyTexture { texture });
        Ok(())
    }

    fn downscale_with_gaussian_blur(
        &self,
        dst: &PitchedAllocation,
        src: TextureHandle,
        downscale: u32,
        out_size: Size2,
        radius: u32,
        ctx: ExecutionContext,
    ) -> Result<()> {
        const OP: &str = "downscale_with_gaussian_blur";

        let mut state = self.state();
        if !state.stream_is_valid(ctx) {
            return Err(DeviceError::kernel(OP, "invalid stream handle"));
        }
        if downscale == 0 {
            return Err(DeviceError::kernel(OP, "downscale must be at least 1"));
        }
        if out_size.width > dst.size.width || out_size.height > dst.size.height {
            return Err(DeviceError::kernel(
                OP,
                format!("output {out_size} exceeds destination {}", dst.size),
            ));
        }

        let record = *state
            .textures
            .get(&src.0)
            .ok_or_else(|| DeviceError::kernel(OP, format!("invalid texture object {}", src.0)))?;
        let source = state
            .buffers
            .get(&record.resource.ptr.0)
            .ok_or_else(|| DeviceError::kernel(OP, "source texture references freed device memory"))?;

        let r = radius as i32;
        let half = downscale as f32 * 0.5;
        let mut output = Vec::with_capacity(out_size.area());
        for y in 0..out_size.height {
            for x in 0..out_size.width {
                let mut acc = Rgba::default();
                let mut weight_sum = 0.0f32;
                for i in -r..=r {
                    for j in -r..=r {
                        let u = (x as i64 * downscale as i64 + j as i64) as f32 + half;
                        let v = (y as i64 * downscale as i64 + i as i64) as f32 + half;
                        let weight = gaussian_weight(i, radius) * gaussian_weight(j, radius);
                        acc = acc.add(sample(source, &record, u, v).scale(weight));
                        weight_sum += weight;
                    }
                }
                output.push(acc.scale(1.0 / weight_sum));
            }
        }

        let storage = check_allocation(&mut state, dst).map_err(|e| DeviceError::kernel(OP, e))?;
        let row = storage.row_elements();
        for (y, out_row) in output.chunks_exact(out_size.width.max(1)).enumerate() {
            storage.texels[y * row..y * row + out_size.width].copy_from_slice(out_row);
        }

        state.journal.push(RuntimeEvent::DownscaleWithGaussianBlur {
            dst: dst.ptr,
            src,
            downscale,
            out_size,
            radius,
            ctx,
        });
        Ok(())
    }

    fn rgb_to_lab_in_place(&self, buffer: &PitchedAllocation, size: Size2, ctx: ExecutionContext) -> Result<()> {
        const OP: &str = "rgb_to_lab_in_place";

        let mut state = self.state();
        if !state.stream_is_valid(ctx) {
            return Err(DeviceError::kernel(OP, "invalid stream handle"));
        }
        let storage = check_allocation(&mut state, buffer).map_err(|e| DeviceError::kernel(OP, e))?;
        if size.width > storage.size.width || size.height > storage.size.height {
            return Err(DeviceError::kernel(OP, format!("region {size} exceeds buffer {}", storage.size)));
        }

        let row = storage.row_elements();
        for y in 0..size.height {
            for texel in &mut storage.texels[y * row..y * row + size.width] {
                *texel = rgb_to_lab(*texel);
            }
        }
        state.journal.push(RuntimeEvent::RgbToLab { buffer: buffer.ptr, size, ctx });
        Ok(())
    }
}
