//! Materials: a shader selection plus uniforms and named textures

use crate::backend::traits::*;
use crate::error::{RenderError, RenderResult};
use crate::render::{DeleteQueue, GpuHandle, ShaderType};
use crate::resources::{Texture, UniformBlock};
use glam::Vec4;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Material shared between render passes
pub type SharedMaterial = Arc<RwLock<Material>>;

/// Name of the texture the built-in shaders sample
pub const MAIN_TEXTURE: &str = "u_texture";

/// Name of the color uniform the built-in shaders read
pub const MAIN_COLOR: &str = "u_color";

/// GPU side of a material: uniform buffer and bind group for one shader
#[derive(Debug)]
pub struct MaterialGpu {
    pub buffer: BufferHandle,
    pub bind_group: BindGroupHandle,
    /// View bound at `bind_group` creation, the group is rebuilt when it changes
    pub texture_view: TextureViewHandle,
    /// Shader whose uniform layout `buffer` holds
    pub shader: ShaderType,
    pub size: u64,
    queue: DeleteQueue,
}

impl MaterialGpu {
    pub fn new(
        buffer: BufferHandle,
        bind_group: BindGroupHandle,
        texture_view: TextureViewHandle,
        shader: ShaderType,
        size: u64,
        queue: DeleteQueue,
    ) -> Self {
        Self {
            buffer,
            bind_group,
            texture_view,
            shader,
            size,
            queue,
        }
    }

    /// Still usable for `shader` sampling `view` with `size` bytes of uniforms
    pub fn matches(&self, shader: ShaderType, view: TextureViewHandle, size: u64) -> bool {
        self.shader == shader && self.texture_view == view && self.size >= size
    }
}

impl Drop for MaterialGpu {
    fn drop(&mut self) {
        self.queue.push(GpuHandle::BindGroup(self.bind_group));
        self.queue.push(GpuHandle::Buffer(self.buffer));
    }
}

#[derive(Debug)]
pub struct Material {
    name: String,
    shader: ShaderType,
    uniforms: UniformBlock,
    textures: BTreeMap<String, Arc<Texture>>,
    gpu: Option<MaterialGpu>,
}

impl Material {
    /// Material whose uniforms are declared by `descriptor`
    pub fn new(name: &str, shader: ShaderType, descriptor: &str) -> RenderResult<Self> {
        Ok(Self {
            name: name.to_string(),
            shader,
            uniforms: UniformBlock::new(descriptor)?,
            textures: BTreeMap::new(),
            gpu: None,
        })
    }

    /// Solid color, no lighting
    pub fn unlit_color(color: Vec4) -> RenderResult<Self> {
        let mut material = Self::new("unlit", ShaderType::UnlitColor, "float4 u_color")?;
        material.uniforms.set_vec4(MAIN_COLOR, color)?;
        Ok(material)
    }

    /// `u_texture` modulated by `u_color`
    pub fn textured(texture: Arc<Texture>) -> RenderResult<Self> {
        let mut material = Self::new("textured", ShaderType::Texture, "float4 u_color")?;
        material.uniforms.set_vec4(MAIN_COLOR, Vec4::ONE)?;
        material.set_texture(MAIN_TEXTURE, texture);
        Ok(material)
    }

    /// Depth-only material used for shadow passes
    pub fn depth() -> Self {
        Self {
            name: "depth".to_string(),
            shader: ShaderType::Depth,
            uniforms: UniformBlock::from_layout(Default::default()),
            textures: BTreeMap::new(),
            gpu: None,
        }
    }

    pub fn into_shared(self) -> SharedMaterial {
        Arc::new(RwLock::new(self))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shader_type(&self) -> ShaderType {
        self.shader
    }

    pub fn set_shader_type(&mut self, shader: ShaderType) {
        self.shader = shader;
    }

    pub fn uniforms(&self) -> &UniformBlock {
        &self.uniforms
    }

    pub fn uniforms_mut(&mut self) -> &mut UniformBlock {
        &mut self.uniforms
    }

    pub fn has_uniform(&self, name: &str) -> bool {
        self.uniforms.has_uniform(name)
    }

    pub fn has_texture(&self, name: &str) -> bool {
        self.textures.contains_key(name)
    }

    pub fn set_texture(&mut self, name: &str, texture: Arc<Texture>) {
        self.textures.insert(name.to_string(), texture);
    }

    pub fn texture(&self, name: &str) -> RenderResult<&Arc<Texture>> {
        self.textures
            .get(name)
            .ok_or_else(|| RenderError::TextureNotFound(format!("{} in material '{}'", name, self.name)))
    }

    pub fn textures(&self) -> impl Iterator<Item = (&str, &Arc<Texture>)> {
        self.textures.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Every texture has its pixels
    pub fn textures_ready(&self) -> bool {
        self.textures.values().all(|t| t.is_ready())
    }

    pub(crate) fn gpu(&self) -> Option<&MaterialGpu> {
        self.gpu.as_ref()
    }

    pub(crate) fn set_gpu(&mut self, gpu: MaterialGpu) {
        self.gpu = Some(gpu);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_declare_color() {
        let material = Material::unlit_color(Vec4::new(1.0, 0.0, 0.0, 1.0)).unwrap();
        assert_eq!(material.shader_type(), ShaderType::UnlitColor);
        assert_eq!(
            material.uniforms().get_vec4(MAIN_COLOR).unwrap(),
            Vec4::new(1.0, 0.0, 0.0, 1.0)
        );
        assert!(!material.has_texture(MAIN_TEXTURE));
        assert!(matches!(
            material.texture(MAIN_TEXTURE),
            Err(RenderError::TextureNotFound(_))
        ));
    }

    #[test]
    fn readiness_follows_textures() {
        let pending = Arc::new(Texture::pending("late", 1, 1));
        let material = Material::textured(pending.clone()).unwrap();
        assert!(!material.textures_ready());
        pending.set_pixels(vec![1, 2, 3, 4]).unwrap();
        assert!(material.textures_ready());
    }
}
