//! Shader registry and pipeline cache
//!
//! Materials pick a shader through the closed [`ShaderType`] enum. The manager
//! assembles the WGSL module of a shader (prelude, material block, light block,
//! body) and caches one pipeline per shader and fixed-function state.

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::error::{RenderError, RenderResult};
use crate::render::shaders;
use crate::render::{DeleteQueue, GpuHandle};
use crate::resources::{Material, UniformLayout, MAIN_TEXTURE};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

/// Identifier of a shader registered with [`ShaderManager::add_shader`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShaderId(u32);

/// Shader selection of a material or render pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShaderType {
    /// `u_color` only
    UnlitColor,
    /// `u_texture` modulated by `u_color`
    Texture,
    /// Packed depth, used for shadow maps
    Depth,
    /// Occlusion query proxy
    BoundingBox,
    /// Substituted for objects whose own shader failed
    Error,
    Custom(ShaderId),
    /// Drawn by the host through [`crate::render::Renderer::set_external_renderer`]
    ExternalRenderer,
}

/// User shader: a WGSL body plus what it expects from materials and lights
#[derive(Debug, Clone)]
pub struct ShaderSource {
    pub name: String,
    /// Defines `vs_main` and `fs_main`; the prelude's `transform_vertex` is in scope
    pub wgsl: String,
    /// Material uniforms visible as `material.<name>`
    pub uniform_descriptor: String,
    /// Material texture bound to `@group(1) @binding(1)` under this name
    pub texture: Option<String>,
    /// Declare the light block and shadow maps in group 2
    pub uses_lights: bool,
}

impl ShaderSource {
    pub fn new(name: &str, wgsl: &str) -> Self {
        Self {
            name: name.to_string(),
            wgsl: wgsl.to_string(),
            uniform_descriptor: String::new(),
            texture: None,
            uses_lights: false,
        }
    }

    pub fn with_uniforms(mut self, descriptor: &str) -> Self {
        self.uniform_descriptor = descriptor.to_string();
        self
    }

    pub fn with_texture(mut self, name: &str) -> Self {
        self.texture = Some(name.to_string());
        self
    }

    pub fn with_lights(mut self) -> Self {
        self.uses_lights = true;
        self
    }
}

/// A registered shader
#[derive(Debug)]
pub struct Shader {
    name: String,
    body: String,
    layout: Arc<UniformLayout>,
    texture: Option<String>,
    uses_lights: bool,
}

impl Shader {
    fn from_source(source: &ShaderSource) -> RenderResult<Self> {
        Ok(Self {
            name: source.name.clone(),
            body: source.wgsl.clone(),
            layout: Arc::new(UniformLayout::parse(&source.uniform_descriptor)?),
            texture: source.texture.clone(),
            uses_lights: source.uses_lights,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Uniform layout of the material block
    pub fn layout(&self) -> &Arc<UniformLayout> {
        &self.layout
    }

    pub fn texture(&self) -> Option<&str> {
        self.texture.as_deref()
    }

    pub fn uses_lights(&self) -> bool {
        self.uses_lights
    }

    /// Complete WGSL module. `light_block` comes from `LightList::make_shader_block`.
    pub fn module_source(&self, light_block: &str) -> String {
        let mut out = String::from(shaders::PRELUDE);
        out.push_str(&self.layout.wgsl_struct("Material"));
        let texture = self.texture.as_deref().unwrap_or(MAIN_TEXTURE);
        let _ = writeln!(out, "@group(1) @binding(0) var<uniform> material: Material;");
        let _ = writeln!(out, "@group(1) @binding(1) var {}: texture_2d<f32>;", texture);
        let _ = writeln!(out, "@group(1) @binding(2) var u_sampler: sampler;");
        if self.uses_lights {
            out.push_str(light_block);
            out.push_str(shaders::SHADOW_BINDINGS);
        }
        out.push_str(&self.body);
        out
    }

    /// Check that `material` supplies every uniform and texture this shader reads
    pub fn check_material(&self, material: &Material) -> RenderResult<()> {
        let own = material.uniforms().layout();
        for entry in self.layout.entries() {
            match own.entry(&entry.name) {
                None => return Err(RenderError::UniformNotFound(entry.name.clone())),
                Some(e) if e.ty != entry.ty || e.count != entry.count => {
                    return Err(RenderError::UniformTypeMismatch {
                        name: entry.name.clone(),
                        expected: entry.ty.name(),
                        actual: e.ty.name(),
                    })
                }
                Some(_) => {}
            }
        }
        if let Some(texture) = &self.texture {
            material.texture(texture)?;
        }
        Ok(())
    }
}

/// Fixed-function state that selects a pipeline variant
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PipelineState {
    pub topology: PrimitiveTopology,
    pub cull_mode: CullMode,
    pub depth_test: bool,
    pub depth_write: bool,
    /// Constant bias and the bits of the slope scale
    pub depth_bias: (i32, u32),
    pub blend: Option<BlendState>,
    pub alpha_to_coverage: bool,
    pub color_writes: ColorWrites,
    pub stencil: Option<StencilFaceState>,
    pub color_format: TextureFormat,
    pub depth_format: Option<TextureFormat>,
    pub sample_count: u32,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self {
            topology: PrimitiveTopology::TriangleList,
            cull_mode: CullMode::Back,
            depth_test: true,
            depth_write: true,
            depth_bias: (0, 0),
            blend: None,
            alpha_to_coverage: false,
            color_writes: ColorWrites::ALL,
            stencil: None,
            color_format: TextureFormat::Rgba8Unorm,
            depth_format: Some(TextureFormat::Depth32Float),
            sample_count: 1,
        }
    }
}

impl PipelineState {
    fn depth_stencil(&self) -> Option<DepthStencilState> {
        let format = self.depth_format?;
        Some(DepthStencilState {
            format,
            depth_write_enabled: self.depth_write,
            depth_compare: if self.depth_test {
                CompareFunction::LessEqual
            } else {
                CompareFunction::Always
            },
            stencil: self.stencil.filter(|_| format.has_stencil()),
            bias: DepthBias {
                constant: self.depth_bias.0,
                slope_scale: f32::from_bits(self.depth_bias.1),
            },
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PipelineKey {
    shader: ShaderType,
    /// Light block generation, 0 for shaders without lights
    lights: u64,
    state: PipelineState,
}

/// Bind group layouts shared by every pipeline
#[derive(Debug, Clone, Copy)]
pub struct BindLayouts {
    pub transform: BindGroupLayoutHandle,
    pub material: BindGroupLayoutHandle,
    pub lights: BindGroupLayoutHandle,
}

impl BindLayouts {
    fn create<B: GraphicsBackend + ?Sized>(backend: &mut B) -> BackendResult<Self> {
        let transform = backend.create_bind_group_layout(&[BindGroupLayoutEntry {
            binding: 0,
            visibility: ShaderStageFlags::VERTEX_FRAGMENT,
            ty: BindingType::UniformBuffer { dynamic_offset: true },
        }])?;
        let material = backend.create_bind_group_layout(&Self::block_entries(TextureViewDimension::D2))?;
        let lights = backend.create_bind_group_layout(&Self::block_entries(TextureViewDimension::D2Array))?;
        Ok(Self {
            transform,
            material,
            lights,
        })
    }

    // uniform block, texture, sampler
    fn block_entries(view_dimension: TextureViewDimension) -> [BindGroupLayoutEntry; 3] {
        [
            BindGroupLayoutEntry {
                binding: 0,
                visibility: ShaderStageFlags::VERTEX_FRAGMENT,
                ty: BindingType::UniformBuffer { dynamic_offset: false },
            },
            BindGroupLayoutEntry {
                binding: 1,
                visibility: ShaderStageFlags::FRAGMENT,
                ty: BindingType::Texture { view_dimension },
            },
            BindGroupLayoutEntry {
                binding: 2,
                visibility: ShaderStageFlags::FRAGMENT,
                ty: BindingType::Sampler,
            },
        ]
    }
}

/// Registry of shaders and cache of their pipelines
pub struct ShaderManager {
    shaders: HashMap<ShaderType, Arc<Shader>>,
    next_custom: u32,
    light_block: String,
    light_generation: u64,
    layouts: Option<BindLayouts>,
    /// Failed compilations are cached too so a broken shader is reported once
    pipelines: HashMap<PipelineKey, Result<RenderPipelineHandle, String>>,
    queue: DeleteQueue,
}

impl ShaderManager {
    pub fn new(queue: DeleteQueue) -> Self {
        let builtins = [
            (
                ShaderType::UnlitColor,
                ShaderSource::new("unlit_color", shaders::UNLIT_COLOR).with_uniforms("float4 u_color"),
            ),
            (
                ShaderType::Texture,
                ShaderSource::new("texture", shaders::TEXTURE)
                    .with_uniforms("float4 u_color")
                    .with_texture(MAIN_TEXTURE),
            ),
            (ShaderType::Depth, ShaderSource::new("depth", shaders::DEPTH)),
            (
                ShaderType::BoundingBox,
                ShaderSource::new("bounding_box", shaders::BOUNDING_BOX),
            ),
            (ShaderType::Error, ShaderSource::new("error", shaders::ERROR)),
        ];

        let mut shaders = HashMap::new();
        for (ty, source) in builtins {
            match Shader::from_source(&source) {
                Ok(shader) => {
                    shaders.insert(ty, Arc::new(shader));
                }
                Err(e) => log::error!("Built-in shader '{}' rejected: {}", source.name, e),
            }
        }

        Self {
            shaders,
            next_custom: 0,
            light_block: String::new(),
            light_generation: 1,
            layouts: None,
            pipelines: HashMap::new(),
            queue,
        }
    }

    /// Register a user shader
    pub fn add_shader(&mut self, source: ShaderSource) -> RenderResult<ShaderType> {
        let shader = Shader::from_source(&source)?;
        let ty = ShaderType::Custom(ShaderId(self.next_custom));
        self.next_custom += 1;
        log::debug!("Registered shader '{}' as {:?}", source.name, ty);
        self.shaders.insert(ty, Arc::new(shader));
        Ok(ty)
    }

    pub fn shader(&self, ty: ShaderType) -> RenderResult<Arc<Shader>> {
        self.shaders
            .get(&ty)
            .cloned()
            .ok_or_else(|| RenderError::ShaderNotFound(format!("{:?}", ty)))
    }

    /// Install the light block declaration. Pipelines of light-using shaders are
    /// rebuilt on next use when it changed.
    pub fn set_light_block(&mut self, block: String) -> bool {
        if block == self.light_block {
            return false;
        }
        self.light_block = block;
        self.light_generation += 1;

        let stale: Vec<PipelineKey> = self.pipelines.keys().filter(|k| k.lights != 0).cloned().collect();
        for key in stale {
            if let Some(Ok(pipeline)) = self.pipelines.remove(&key) {
                self.queue.push(GpuHandle::Pipeline(pipeline));
            }
        }
        log::debug!("Light block changed, generation {}", self.light_generation);
        true
    }

    pub fn light_block(&self) -> &str {
        &self.light_block
    }

    /// Bind group layouts, created on first use
    pub fn layouts<B: GraphicsBackend + ?Sized>(&mut self, backend: &mut B) -> RenderResult<BindLayouts> {
        if let Some(layouts) = self.layouts {
            return Ok(layouts);
        }
        let layouts = BindLayouts::create(backend)?;
        self.layouts = Some(layouts);
        Ok(layouts)
    }

    /// Pipeline for `shader` with `state`, compiled on first use
    pub fn pipeline<B: GraphicsBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        shader: ShaderType,
        state: &PipelineState,
    ) -> RenderResult<RenderPipelineHandle> {
        let definition = self.shader(shader)?;
        let key = PipelineKey {
            shader,
            lights: if definition.uses_lights() { self.light_generation } else { 0 },
            state: state.clone(),
        };
        if let Some(cached) = self.pipelines.get(&key) {
            return cached
                .clone()
                .map_err(|reason| BackendError::PipelineCreationFailed(reason).into());
        }

        let layouts = self.layouts(backend)?;
        let color_targets = vec![ColorTargetState {
            format: state.color_format,
            blend: state.blend,
            write_mask: state.color_writes,
        }];
        let desc = RenderPipelineDescriptor {
            label: Some(definition.name().to_string()),
            shader: definition.module_source(&self.light_block),
            vertex_layouts: vec![Vertex::layout()],
            bind_group_layouts: vec![layouts.transform, layouts.material, layouts.lights],
            primitive_topology: state.topology,
            front_face: FrontFace::Ccw,
            cull_mode: state.cull_mode,
            depth_stencil: state.depth_stencil(),
            color_targets,
            sample_count: state.sample_count,
            alpha_to_coverage: state.alpha_to_coverage,
        };

        match backend.create_render_pipeline(&desc) {
            Ok(pipeline) => {
                log::debug!("Compiled pipeline '{}' ({:?})", definition.name(), state.topology);
                self.pipelines.insert(key, Ok(pipeline));
                Ok(pipeline)
            }
            Err(BackendError::PipelineCreationFailed(reason))
            | Err(BackendError::ShaderCreationFailed(reason)) => {
                log::error!("Shader '{}' failed to compile: {}", definition.name(), reason);
                self.pipelines.insert(key, Err(reason.clone()));
                Err(BackendError::PipelineCreationFailed(reason).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Compiled pipelines currently cached
    pub fn pipeline_count(&self) -> usize {
        self.pipelines.values().filter(|p| p.is_ok()).count()
    }
}

impl Drop for ShaderManager {
    fn drop(&mut self) {
        for pipeline in self.pipelines.values().flatten() {
            self.queue.push(GpuHandle::Pipeline(*pipeline));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DummyBackend;
    use glam::Vec4;

    #[test]
    fn builtin_modules_declare_material_block() {
        let manager = ShaderManager::new(DeleteQueue::new());
        let texture = manager.shader(ShaderType::Texture).unwrap();
        let source = texture.module_source("");
        assert!(source.contains("u_color: vec4<f32>"));
        assert!(source.contains("var u_texture: texture_2d<f32>"));
        assert!(source.contains("fn fs_main"));
        assert!(matches!(
            manager.shader(ShaderType::ExternalRenderer),
            Err(RenderError::ShaderNotFound(_))
        ));
    }

    #[test]
    fn material_check_reports_missing_texture() {
        let manager = ShaderManager::new(DeleteQueue::new());
        let texture = manager.shader(ShaderType::Texture).unwrap();
        let unlit = Material::unlit_color(Vec4::ONE).unwrap();
        assert!(matches!(
            texture.check_material(&unlit),
            Err(RenderError::TextureNotFound(_))
        ));
        let color = manager.shader(ShaderType::UnlitColor).unwrap();
        color.check_material(&unlit).unwrap();
    }

    #[test]
    fn pipelines_are_cached_per_state() {
        let mut backend = DummyBackend::new();
        let mut manager = ShaderManager::new(DeleteQueue::new());
        let state = PipelineState::default();
        let a = manager.pipeline(&mut backend, ShaderType::UnlitColor, &state).unwrap();
        let b = manager.pipeline(&mut backend, ShaderType::UnlitColor, &state).unwrap();
        assert_eq!(a, b);

        let culled_front = PipelineState {
            cull_mode: CullMode::Front,
            ..state
        };
        let c = manager.pipeline(&mut backend, ShaderType::UnlitColor, &culled_front).unwrap();
        assert_ne!(a, c);
        assert_eq!(manager.pipeline_count(), 2);
    }

    #[test]
    fn broken_custom_shader_fails_once() {
        let mut backend = DummyBackend::new();
        let queue = DeleteQueue::new();
        let mut manager = ShaderManager::new(queue);
        let broken = manager
            .add_shader(ShaderSource::new("broken", "fn vs_main( {"))
            .unwrap();
        let state = PipelineState::default();
        let first = manager.pipeline(&mut backend, broken, &state).unwrap_err();
        assert!(first.is_per_object());
        let again = manager.pipeline(&mut backend, broken, &state).unwrap_err();
        assert!(again.is_per_object());
        assert_eq!(manager.pipeline_count(), 0);
    }

    #[test]
    fn light_block_change_drops_light_pipelines() {
        let mut backend = DummyBackend::new();
        let queue = DeleteQueue::new();
        let mut manager = ShaderManager::new(queue.clone());
        let lit = manager
            .add_shader(
                ShaderSource::new(
                    "lit",
                    "@vertex fn vs_main(input: VertexInput) -> VertexOutput { return transform_vertex(input); }\n\
                     @fragment fn fs_main(input: VertexOutput) -> @location(0) vec4<f32> { return vec4<f32>(1.0); }",
                )
                .with_lights(),
            )
            .unwrap();
        manager.set_light_block(
            "struct Lights_ubo {\n    _pad: vec4<f32>,\n}\n@group(2) @binding(0) var<uniform> lights: Lights_ubo;\n"
                .to_string(),
        );
        let state = PipelineState::default();
        manager.pipeline(&mut backend, lit, &state).unwrap();
        manager.pipeline(&mut backend, ShaderType::UnlitColor, &state).unwrap();

        assert!(manager.set_light_block(
            "struct Lights_ubo {\n    _pad: array<vec4<f32>, 2>,\n}\n@group(2) @binding(0) var<uniform> lights: Lights_ubo;\n"
                .to_string()
        ));
        assert_eq!(manager.pipeline_count(), 1);
        assert_eq!(queue.pending_count(), 1);
    }
}
