//! Camera frame texture objects

use std::sync::Arc;

use tracing::trace;

use crate::depth_map::common::error::Result;
use crate::depth_map::memory::{DeviceFrameBuffer, TextureObject};
use crate::depth_map::runtime::{
    AddressMode, ChannelFormat, FilterMode, GpuRuntime, ReadMode, ResourceDesc, TextureDesc,
};

/// Sampling configuration of camera frame textures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TextureConfig {
    /// Whether texels are rescaled to `[0, 1]` on read
    pub read_mode: ReadMode,
    /// Nearest texel or bilinear interpolation
    /// Note: linear filtering costs more per fetch but matters at small resolutions
    pub filter_mode: FilterMode,
}

impl TextureConfig {
    pub fn builder() -> TextureConfigBuilder {
        TextureConfigBuilder::default()
    }

    /// Configuration selected by the `texture-interpolation` and
    /// `texture-normalized-read` cargo features.
    pub fn from_build_features() -> Self {
        Self {
            read_mode: if cfg!(feature = "texture-normalized-read") {
                ReadMode::NormalizedFloat
            } else {
                ReadMode::ElementType
            },
            filter_mode: if cfg!(feature = "texture-interpolation") {
                FilterMode::Linear
            } else {
                FilterMode::Point
            },
        }
    }
}

/// Builder for TextureConfig
#[derive(Default)]
pub struct TextureConfigBuilder {
    read_mode: Option<ReadMode>,
    filter_mode: Option<FilterMode>,
}

impl TextureConfigBuilder {
    pub fn read_mode(mut self, read_mode: ReadMode) -> Self {
        self.read_mode = Some(read_mode);
        self
    }

    pub fn filter_mode(mut self, filter_mode: FilterMode) -> Self {
        self.filter_mode = Some(filter_mode);
        self
    }

    pub fn interpolation(self, enable: bool) -> Self {
        self.filter_mode(if enable { FilterMode::Linear } else { FilterMode::Point })
    }

    pub fn build(self) -> TextureConfig {
        let default = TextureConfig::default();
        TextureConfig {
            read_mode: self.read_mode.unwrap_or(default.read_mode),
            filter_mode: self.filter_mode.unwrap_or(default.filter_mode),
        }
    }
}

/// Builds read-only textures over device frame buffers.
#[derive(Debug, Clone, Copy)]
pub struct TextureBuilder {
    config: TextureConfig,
}

impl TextureBuilder {
    pub fn new(config: TextureConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TextureConfig {
        &self.config
    }

    /// Resource and sampling descriptors for a texture over `buffer`.
    ///
    /// The pitch comes from the buffer every time; a stale pitch makes the
    /// hardware read the wrong rows without reporting anything.
    pub fn descriptors<R: GpuRuntime>(&self, buffer: &DeviceFrameBuffer<R>) -> (ResourceDesc, TextureDesc) {
        let allocation = buffer.allocation();
        let resource = ResourceDesc {
            ptr: allocation.ptr,
            width: allocation.size.width,
            height: allocation.size.height,
            pitch_in_bytes: allocation.pitch,
            format: ChannelFormat::Float4,
        };
        let sampling = TextureDesc {
            address_mode: [AddressMode::Clamp; 3],
            filter_mode: self.config.filter_mode,
            read_mode: self.config.read_mode,
            // addressed (x, y) in [width, height]
            normalized_coords: false,
        };
        (resource, sampling)
    }

    pub fn build<R: GpuRuntime>(&self, runtime: &Arc<R>, buffer: &DeviceFrameBuffer<R>) -> Result<TextureObject<R>> {
        let (resource, sampling) = self.descriptors(buffer);
        let handle = runtime.create_texture(&resource, &sampling)?;
        trace!(texture = handle.0, size = %buffer.size(), pitch = resource.pitch_in_bytes, "Bound frame texture");
        Ok(TextureObject::from_handle(runtime, handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::depth_map::common::error::DeviceError;
    use crate::depth_map::runtime::CpuRuntime;
    use crate::depth_map::types::Size2;

    #[test]
    fn test_config_builder() {
        let config = TextureConfig::builder()
            .read_mode(ReadMode::NormalizedFloat)
            .interpolation(true)
            .build();

        assert_eq!(config.read_mode, ReadMode::NormalizedFloat);
        assert_eq!(config.filter_mode, FilterMode::Linear);

        let default = TextureConfig::builder().build();
        assert_eq!(default, TextureConfig::default());
        assert_eq!(default.filter_mode, FilterMode::Point);
    }

    #[test]
    fn test_descriptors_mirror_buffer_under_both_configs() {
        let runtime = Arc::new(CpuRuntime::new());
        let buffer = DeviceFrameBuffer::new(&runtime, Size2::new(37, 11)).unwrap();

        for config in [
            TextureConfig::default(),
            TextureConfig::builder()
                .read_mode(ReadMode::NormalizedFloat)
                .filter_mode(FilterMode::Linear)
                .build(),
        ] {
            let (resource, sampling) = TextureBuilder::new(config).descriptors(&buffer);

            assert_eq!(resource.ptr, buffer.allocation().ptr);
            assert_eq!(resource.width, 37);
            assert_eq!(resource.height, 11);
            assert_eq!(resource.pitch_in_bytes, buffer.pitch());
            assert_ne!(resource.pitch_in_bytes, 37 * 16);
            assert_eq!(resource.format, ChannelFormat::Float4);

            assert_eq!(sampling.address_mode, [AddressMode::Clamp; 3]);
            assert_eq!(sampling.filter_mode, config.filter_mode);
            assert_eq!(sampling.read_mode, config.read_mode);
            assert!(!sampling.normalized_coords);
        }
    }

    #[test]
    fn test_build_and_drop_texture() {
        let runtime = Arc::new(CpuRuntime::new());
        let buffer = DeviceFrameBuffer::new(&runtime, Size2::new(8, 8)).unwrap();

        let texture = TextureBuilder::new(TextureConfig::default()).build(&runtime, &buffer).unwrap();
        let handle = texture.handle();
        assert!(runtime.is_texture_live(handle));
        assert_eq!(runtime.texture_descriptors(handle).unwrap().0.pitch_in_bytes, buffer.pitch());

        drop(texture);
        assert!(!runtime.is_texture_live(handle));
    }

    #[test]
    fn test_build_over_released_buffer_fails() {
        let runtime = Arc::new(CpuRuntime::new());
        let builder = TextureBuilder::new(TextureConfig::default());
        let buffer = DeviceFrameBuffer::new(&runtime, Size2::new(8, 8)).unwrap();
        let (resource, sampling) = builder.descriptors(&buffer);
        drop(buffer);

        let err = runtime.create_texture(&resource, &sampling).unwrap_err();
        assert!(matches!(err, DeviceError::BindingFailure { .. }));
    }
}
