//! Stereo scene renderer core
//!
//! Culls, sorts and draws a scene-object tree for head-mounted displays on top of
//! three interchangeable backends:
//! - **wgpu**: completes every submission before returning, like an immediate-mode API
//! - **Vulkan**: records into command buffers and hands back a fence (native only)
//! - **Dummy**: records commands in host memory, used by the tests
//!
//! # Features
//! - Frustum culling with a fully-inside short-circuit and occlusion queries that span frames
//! - Light list with dense per-class indices and one shared light uniform block
//! - Shadow maps as layers of one shared texture array
//! - Render targets with multiview delegates that share one culled draw list
//! - Deferred GPU deletion drained only by the context thread

pub mod backend;
pub mod error;
pub mod light;
pub mod render;
pub mod resources;
pub mod scene;

// Re-export Bevy ECS prelude for users
pub use bevy_ecs::prelude::{Component, Entity, World};

pub use backend::{Backend, DummyBackend, GraphicsBackend, SubmissionStatus};
pub use error::{RenderError, RenderResult};
pub use light::{Light, LightDirty, LightList, ShadowAtlas, ShadowMap};
pub use render::{
    DeleteQueue, RenderState, RenderStats, RenderTarget, RenderTexture, Renderer, ShaderManager,
    ShaderType,
};
pub use resources::{Material, Mesh, SharedMaterial, Texture, UniformBlock};
pub use scene::{BoundingVolume, Camera, Collider, RenderData, Scene, Transform};

/// Number of layers in the shared shadow texture array
pub const MAX_SHADOW_MAPS: u32 = 4;

/// Environment variable read by [`RendererConfig::from_env`]
pub const BACKEND_ENV_VAR: &str = "VR_RENDER_BACKEND";

/// Backend selection for the renderer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendType {
    /// wgpu backend - cross-platform, completes work synchronously
    #[default]
    Wgpu,
    /// Vulkan backend via ash - fence based completion (native only)
    Vulkan,
    /// Host-memory backend that only records commands
    Dummy,
}

impl std::str::FromStr for BackendType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wgpu" => Ok(BackendType::Wgpu),
            "vulkan" | "vk" => Ok(BackendType::Vulkan),
            "dummy" => Ok(BackendType::Dummy),
            other => Err(format!("unknown backend '{}'", other)),
        }
    }
}

/// Configuration for creating the renderer
#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// Which backend to use
    pub backend: BackendType,
    /// Test scene objects against the camera frustum
    pub frustum_culling: bool,
    /// Hide objects whose last occlusion query passed no samples.
    /// Ignored when the backend has no occlusion queries.
    pub occlusion_culling: bool,
    /// Layers in the shared shadow texture array
    pub max_shadow_maps: u32,
    /// Width and height of every shadow map layer
    pub shadow_map_size: u32,
    /// Bind lights through one shared uniform buffer instead of per shader copies
    pub use_light_uniform_block: bool,
    /// Only pick colliders that survived the last cull
    pub pick_visible_only: bool,
    /// Give render textures a stencil aspect
    pub use_stencil: bool,
    /// Per-draw transform slots before the transform buffer grows
    pub transform_ring_capacity: u32,
    /// Enable Vulkan validation layers
    pub validation: bool,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            backend: BackendType::Wgpu,
            frustum_culling: true,
            occlusion_culling: false,
            max_shadow_maps: MAX_SHADOW_MAPS,
            shadow_map_size: 1024,
            use_light_uniform_block: true,
            pick_visible_only: false,
            use_stencil: false,
            transform_ring_capacity: 4096,
            validation: false,
        }
    }
}

impl RendererConfig {
    /// Default configuration with the backend taken from `VR_RENDER_BACKEND` when set
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(value) = std::env::var(BACKEND_ENV_VAR) {
            match value.parse() {
                Ok(backend) => config.backend = backend,
                Err(e) => log::warn!("{}: {}, keeping {:?}", BACKEND_ENV_VAR, e, config.backend),
            }
        }
        config
    }

    pub fn with_backend(mut self, backend: BackendType) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_frustum_culling(mut self, enabled: bool) -> Self {
        self.frustum_culling = enabled;
        self
    }

    pub fn with_occlusion_culling(mut self, enabled: bool) -> Self {
        self.occlusion_culling = enabled;
        self
    }

    pub fn with_shadow_maps(mut self, max: u32, size: u32) -> Self {
        self.max_shadow_maps = max;
        self.shadow_map_size = size;
        self
    }

    pub fn with_light_uniform_block(mut self, enabled: bool) -> Self {
        self.use_light_uniform_block = enabled;
        self
    }

    pub fn with_pick_visible_only(mut self, enabled: bool) -> Self {
        self.pick_visible_only = enabled;
        self
    }

    pub fn with_stencil(mut self, enabled: bool) -> Self {
        self.use_stencil = enabled;
        self
    }

    pub fn with_transform_ring_capacity(mut self, slots: u32) -> Self {
        self.transform_ring_capacity = slots;
        self
    }

    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.validation = enabled;
        self
    }
}

/// Install `env_logger` with an `info` default. Safe to call more than once.
#[cfg(not(target_arch = "wasm32"))]
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_names_parse() {
        assert_eq!("wgpu".parse::<BackendType>(), Ok(BackendType::Wgpu));
        assert_eq!(" Vulkan ".parse::<BackendType>(), Ok(BackendType::Vulkan));
        assert_eq!("dummy".parse::<BackendType>(), Ok(BackendType::Dummy));
        assert!("gles".parse::<BackendType>().is_err());
    }

    #[test]
    fn config_defaults() {
        let config = RendererConfig::default();
        assert_eq!(config.max_shadow_maps, MAX_SHADOW_MAPS);
        assert!(config.frustum_culling);
        assert!(!config.occlusion_culling);
        assert!(config.use_light_uniform_block);
    }
}
