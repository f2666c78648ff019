//! Command processor configuration.

use std::time::Duration;

use ash::vk;

use crate::error::GraphicsError;

/// Tunables for the command processor and its transient allocators.
///
/// Built with the `with_*` methods:
///
/// ```
/// use xegpu_graphics::ProcessorConfig;
///
/// let config = ProcessorConfig::new()
///     .with_resolution_scale(2, 2)
///     .with_max_uniform_pages(8);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Horizontal draw resolution scale.
    pub resolution_scale_x: u32,
    /// Vertical draw resolution scale.
    pub resolution_scale_y: u32,
    /// Whether the device supports different stencil reference and masks
    /// for front and back faces.
    pub separate_stencil_mask_ref: bool,
    /// Whether guest vertex shaders may run as tessellation evaluation shaders.
    pub tessellation: bool,
    /// Size of one uniform upload page in bytes.
    pub uniform_page_size: u64,
    /// Offset alignment for uniform buffer bindings.
    pub uniform_alignment: u64,
    /// Upper bound on uniform upload pages alive at once.
    pub max_uniform_pages: usize,
    /// Descriptor sets per uniform buffer descriptor pool page.
    pub uniform_descriptor_page_sets: u32,
    /// Descriptor sets per texture descriptor pool page.
    pub texture_descriptor_page_sets: u32,
    /// Combined image sampler descriptors per texture descriptor pool page.
    pub texture_descriptor_page_descriptors: u32,
    /// Upper bound on descriptor pool pages per transient pool.
    pub max_descriptor_pages: usize,
    /// Reject sparse binds overlapping a pending or in-flight bind.
    pub validate_sparse_binds: bool,
    /// Timeout for one fence wait before a warning is logged and the wait retried.
    pub fence_wait_timeout: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            resolution_scale_x: 1,
            resolution_scale_y: 1,
            separate_stencil_mask_ref: true,
            tessellation: false,
            uniform_page_size: 2 * 1024 * 1024,
            uniform_alignment: 256,
            max_uniform_pages: 64,
            uniform_descriptor_page_sets: 4096,
            texture_descriptor_page_sets: 1024,
            texture_descriptor_page_descriptors: 8192,
            max_descriptor_pages: 64,
            validate_sparse_binds: cfg!(debug_assertions),
            fence_wait_timeout: Duration::from_secs(10),
        }
    }
}

impl ProcessorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resolution_scale(mut self, x: u32, y: u32) -> Self {
        self.resolution_scale_x = x;
        self.resolution_scale_y = y;
        self
    }

    pub fn with_separate_stencil_mask_ref(mut self, supported: bool) -> Self {
        self.separate_stencil_mask_ref = supported;
        self
    }

    pub fn with_tessellation(mut self, enabled: bool) -> Self {
        self.tessellation = enabled;
        self
    }

    pub fn with_uniform_page_size(mut self, size: u64) -> Self {
        self.uniform_page_size = size;
        self
    }

    pub fn with_uniform_alignment(mut self, alignment: u64) -> Self {
        self.uniform_alignment = alignment;
        self
    }

    pub fn with_max_uniform_pages(mut self, pages: usize) -> Self {
        self.max_uniform_pages = pages;
        self
    }

    pub fn with_uniform_descriptor_page_sets(mut self, sets: u32) -> Self {
        self.uniform_descriptor_page_sets = sets;
        self
    }

    pub fn with_texture_descriptor_pages(mut self, sets: u32, descriptors: u32) -> Self {
        self.texture_descriptor_page_sets = sets;
        self.texture_descriptor_page_descriptors = descriptors;
        self
    }

    pub fn with_max_descriptor_pages(mut self, pages: usize) -> Self {
        self.max_descriptor_pages = pages;
        self
    }

    pub fn with_sparse_bind_validation(mut self, enabled: bool) -> Self {
        self.validate_sparse_binds = enabled;
        self
    }

    pub fn with_fence_wait_timeout(mut self, timeout: Duration) -> Self {
        self.fence_wait_timeout = timeout;
        self
    }

    /// Shader stages guest vertex shaders may be translated to.
    pub fn guest_vertex_stages(&self) -> vk::ShaderStageFlags {
        if self.tessellation {
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::TESSELLATION_EVALUATION
        } else {
            vk::ShaderStageFlags::VERTEX
        }
    }

    /// Check the configuration for values the allocators cannot work with.
    pub fn validate(&self) -> Result<(), GraphicsError> {
        if self.resolution_scale_x == 0 || self.resolution_scale_y == 0 {
            return Err(GraphicsError::InvalidParameter(
                "resolution scale must be at least 1".to_string(),
            ));
        }
        if !self.uniform_alignment.is_power_of_two() {
            return Err(GraphicsError::InvalidParameter(format!(
                "uniform alignment {} is not a power of two",
                self.uniform_alignment
            )));
        }
        if self.uniform_page_size < self.uniform_alignment {
            return Err(GraphicsError::InvalidParameter(format!(
                "uniform page size {} is smaller than the alignment {}",
                self.uniform_page_size, self.uniform_alignment
            )));
        }
        if self.max_uniform_pages == 0 || self.max_descriptor_pages == 0 {
            return Err(GraphicsError::InvalidParameter(
                "page limits must allow at least one page".to_string(),
            ));
        }
        if self.uniform_descriptor_page_sets == 0
            || self.texture_descriptor_page_sets == 0
            || self.texture_descriptor_page_descriptors == 0
        {
            return Err(GraphicsError::InvalidParameter(
                "descriptor pool pages must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ProcessorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.uniform_page_size, 2 * 1024 * 1024);
        assert_eq!(config.fence_wait_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_invalid_alignment_rejected() {
        let config = ProcessorConfig::new().with_uniform_alignment(48);
        assert!(matches!(
            config.validate(),
            Err(GraphicsError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_zero_resolution_scale_rejected() {
        let config = ProcessorConfig::new().with_resolution_scale(0, 1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tessellation_extends_vertex_stages() {
        let config = ProcessorConfig::new().with_tessellation(true);
        assert!(
            config
                .guest_vertex_stages()
                .contains(vk::ShaderStageFlags::TESSELLATION_EVALUATION)
        );
        assert_eq!(
            ProcessorConfig::new().guest_vertex_stages(),
            vk::ShaderStageFlags::VERTEX
        );
    }
}
