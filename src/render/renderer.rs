//! Frame orchestration
//!
//! The [`Renderer`] owns the backend and everything bound while drawing: the
//! shader registry, the per-draw transform ring, the default texture and sampler,
//! the shadow atlas and the light bind groups. One frame is
//! cull → shadow passes → camera pass, driven by [`Renderer::render_frame`].

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::backend::Backend;
use crate::error::{RenderError, RenderResult};
use crate::light::{LightCamera, LightList, ShadowAtlas, ShadowMap, SHADOW_FORMAT};
use crate::render::cull::{
    build_items, collect_visible, sort_draw_items, Candidate, DrawItem, OcclusionRequest, RenderDataList,
    ViewParams,
};
use crate::render::{
    DeleteQueue, GpuHandle, PipelineState, RenderState, RenderStats, RenderTarget, Shader, ShaderManager,
    ShaderType,
};
use crate::resources::{Material, MaterialGpu, Mesh, SharedMaterial, Texture};
use crate::scene::{
    Camera, CullFace, Frustum, ObjectInfo, OcclusionQuery, OcclusionState, RenderData, RenderMask,
    RenderPass, RenderingOrder, Scene, TransformUniform,
};
use crate::RendererConfig;
use glam::Mat4;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Callback drawing render data whose shader is [`ShaderType::ExternalRenderer`].
/// Receives the render data and its model-view-projection matrix.
pub type ExternalRenderFn = Box<dyn FnMut(&RenderData, &Mat4) -> RenderResult<()>>;

const FENCE_TIMEOUT: Duration = Duration::from_secs(1);

/// Dynamic uniform buffer holding one [`TransformUniform`] per draw
struct TransformRing {
    buffer: BufferHandle,
    bind_group: BindGroupHandle,
    capacity: u32,
    stride: u32,
    next: u32,
}

impl TransformRing {
    fn create<B: GraphicsBackend + ?Sized>(
        backend: &mut B,
        layout: BindGroupLayoutHandle,
        capacity: u32,
        stride: u32,
    ) -> BackendResult<Self> {
        let buffer = backend.create_buffer(&BufferDescriptor {
            label: Some("transform ring".into()),
            size: u64::from(capacity) * u64::from(stride),
            usage: BufferUsage::UNIFORM | BufferUsage::COPY_DST,
        })?;
        let bind_group = backend.create_bind_group(
            layout,
            &[(
                0,
                BindGroupEntry::Buffer {
                    buffer,
                    offset: 0,
                    size: Some(std::mem::size_of::<TransformUniform>() as u64),
                },
            )],
        );
        match bind_group {
            Ok(bind_group) => Ok(Self {
                buffer,
                bind_group,
                capacity,
                stride,
                next: 0,
            }),
            Err(e) => {
                backend.destroy_buffer(buffer);
                Err(e)
            }
        }
    }

    fn release(&self, queue: &DeleteQueue) {
        queue.push(GpuHandle::BindGroup(self.bind_group));
        queue.push(GpuHandle::Buffer(self.buffer));
    }
}

/// Objects bound when a draw has nothing of its own for a slot
struct Defaults {
    _white: Arc<Texture>,
    white_view: TextureViewHandle,
    sampler: SamplerHandle,
    shadow_texture: TextureHandle,
    shadow_view: TextureViewHandle,
    empty_block: BufferHandle,
    empty_material: BindGroupHandle,
    empty_lights: BindGroupHandle,
}

impl Defaults {
    fn create(backend: &mut Backend, shaders: &mut ShaderManager, queue: &DeleteQueue) -> RenderResult<Self> {
        let layouts = shaders.layouts(backend)?;
        let white = Arc::new(Texture::white());
        let white_view = white.upload(backend, queue)?;
        let sampler = backend.create_sampler(&SamplerDescriptor {
            label: Some("default sampler".into()),
            ..Default::default()
        })?;

        // lit shaders always sample a texture array, even before the atlas exists
        let shadow_texture = backend.create_texture(&TextureDescriptor {
            label: Some("no shadows".into()),
            format: SHADOW_FORMAT,
            usage: TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_DST,
            ..Default::default()
        })?;
        backend.write_texture(shadow_texture, 0, &[0xff; 4], 1, 1)?;
        let shadow_view = backend.create_texture_view(shadow_texture, &TextureViewDescriptor::array(1))?;

        let empty_block = backend.create_buffer_init(
            &BufferDescriptor {
                label: Some("empty block".into()),
                size: 16,
                usage: BufferUsage::UNIFORM | BufferUsage::COPY_DST,
            },
            &[0; 16],
        )?;
        let empty_material = backend.create_bind_group(
            layouts.material,
            &block_entries(empty_block, None, white_view, sampler),
        )?;
        let empty_lights = backend.create_bind_group(
            layouts.lights,
            &block_entries(empty_block, None, shadow_view, sampler),
        )?;

        Ok(Self {
            _white: white,
            white_view,
            sampler,
            shadow_texture,
            shadow_view,
            empty_block,
            empty_material,
            empty_lights,
        })
    }

    fn release(&self, queue: &DeleteQueue) {
        queue.push(GpuHandle::BindGroup(self.empty_lights));
        queue.push(GpuHandle::BindGroup(self.empty_material));
        queue.push(GpuHandle::Buffer(self.empty_block));
        queue.push(GpuHandle::TextureView(self.shadow_view));
        queue.push(GpuHandle::Texture(self.shadow_texture));
        queue.push(GpuHandle::Sampler(self.sampler));
    }
}

// uniform block, texture, sampler
fn block_entries(
    buffer: BufferHandle,
    size: Option<u64>,
    view: TextureViewHandle,
    sampler: SamplerHandle,
) -> [(u32, BindGroupEntry); 3] {
    [
        (
            0,
            BindGroupEntry::Buffer {
                buffer,
                offset: 0,
                size,
            },
        ),
        (1, BindGroupEntry::Texture(view)),
        (2, BindGroupEntry::Sampler(sampler)),
    ]
}

/// Fixed-function state of one pass of `data` drawn into a target with `state`
pub fn pipeline_state(data: &RenderData, cull_face: CullFace, state: &RenderState) -> PipelineState {
    // the stencil queue only writes stencil
    let stencil_queue = data.rendering_order == RenderingOrder::STENCIL;
    PipelineState {
        topology: data.draw_mode,
        cull_mode: cull_face.into(),
        depth_test: data.depth_test,
        depth_write: data.depth_mask && !stencil_queue,
        depth_bias: data
            .offset
            .map(|o| (o.units as i32, o.factor.to_bits()))
            .unwrap_or((0, 0)),
        blend: data.alpha_blend.then(BlendState::alpha_blending),
        alpha_to_coverage: data.alpha_to_coverage && state.sample_count > 1,
        color_writes: if stencil_queue { ColorWrites::NONE } else { ColorWrites::ALL },
        stencil: data.stencil.filter(|_| state.use_stencil).map(|s| StencilFaceState {
            compare: s.compare,
            fail_op: s.fail_op,
            depth_fail_op: s.depth_fail_op,
            pass_op: s.pass_op,
            read_mask: s.read_mask,
            write_mask: s.write_mask,
        }),
        color_format: state.color_format,
        depth_format: state.depth_format,
        sample_count: state.sample_count,
    }
}

/// Draws scenes through one backend. Lives on the render thread.
pub struct Renderer {
    backend: Backend,
    config: RendererConfig,
    capabilities: BackendCapabilities,
    shaders: ShaderManager,
    delete_queue: DeleteQueue,
    stats: Arc<RenderStats>,
    defaults: Defaults,
    ring: TransformRing,
    shadow_atlas: Option<Arc<ShadowAtlas>>,
    light_groups: HashMap<(BufferHandle, TextureViewHandle), BindGroupHandle>,
    pending: Vec<FenceHandle>,
    external: Option<ExternalRenderFn>,
    occlusion_live: bool,
    warned_occlusion: bool,
}

impl Renderer {
    /// Create the backend selected by `config` and the renderer over it
    pub fn new(config: RendererConfig) -> RenderResult<Self> {
        let backend = Backend::new(&config)?;
        Self::with_backend(backend, config)
    }

    pub fn with_backend(mut backend: Backend, config: RendererConfig) -> RenderResult<Self> {
        let capabilities = backend.capabilities();
        log::info!(
            "Renderer on {} (occlusion queries: {}, deferred submission: {})",
            backend.name(),
            capabilities.occlusion_queries,
            capabilities.deferred_submission
        );

        let delete_queue = DeleteQueue::new();
        let mut shaders = ShaderManager::new(delete_queue.clone());
        let defaults = Defaults::create(&mut backend, &mut shaders, &delete_queue)?;
        let layouts = shaders.layouts(&mut backend)?;
        let ring = TransformRing::create(
            &mut backend,
            layouts.transform,
            config.transform_ring_capacity.max(1),
            transform_stride(&capabilities),
        )?;

        Ok(Self {
            backend,
            config,
            capabilities,
            shaders,
            delete_queue,
            stats: Arc::new(RenderStats::new()),
            defaults,
            ring,
            shadow_atlas: None,
            light_groups: HashMap::new(),
            pending: Vec::new(),
            external: None,
            occlusion_live: false,
            warned_occlusion: false,
        })
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn capabilities(&self) -> BackendCapabilities {
        self.capabilities
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut Backend {
        &mut self.backend
    }

    pub fn delete_queue(&self) -> &DeleteQueue {
        &self.delete_queue
    }

    pub fn stats(&self) -> &Arc<RenderStats> {
        &self.stats
    }

    pub fn shaders(&self) -> &ShaderManager {
        &self.shaders
    }

    pub fn shaders_mut(&mut self) -> &mut ShaderManager {
        &mut self.shaders
    }

    /// Install the callback for [`ShaderType::ExternalRenderer`] render data
    pub fn set_external_renderer(&mut self, callback: Option<ExternalRenderFn>) {
        self.external = callback;
    }

    /// The shared shadow texture array, created on first use
    pub fn shadow_atlas(&mut self) -> RenderResult<Arc<ShadowAtlas>> {
        if let Some(atlas) = &self.shadow_atlas {
            return Ok(atlas.clone());
        }
        let atlas = Arc::new(ShadowAtlas::create(
            &mut self.backend,
            &self.delete_queue,
            self.config.shadow_map_size,
            self.config.max_shadow_maps,
        )?);
        self.shadow_atlas = Some(atlas.clone());
        Ok(atlas)
    }

    /// Submit recorded work, remembering the fence of deferred submissions
    pub fn submit(&mut self) -> RenderResult<SubmissionStatus> {
        let status = self.backend.submit()?;
        if let Some(fence) = status.fence() {
            self.pending.push(fence);
        }
        Ok(status)
    }

    /// Wait until every submission made so far has finished
    pub fn wait_idle(&mut self) -> RenderResult<()> {
        for fence in std::mem::take(&mut self.pending) {
            if !self.backend.wait_fence(fence, FENCE_TIMEOUT)? {
                log::warn!("Fence {:?} did not signal within {:?}", fence, FENCE_TIMEOUT);
            }
        }
        Ok(())
    }

    /// Destroy GPU objects released since the last call. Context thread only.
    pub fn process_queues(&mut self) -> RenderResult<usize> {
        self.delete_queue.process_queues(&mut self.backend)
    }

    /// Drop every object's occlusion query
    pub fn release_occlusion_queries(&mut self, scene: &Scene) {
        let mut world = scene.world_mut();
        let mut query = world.query::<&mut OcclusionState>();
        let mut released = 0;
        for mut state in query.iter_mut(&mut world) {
            if state.query.take().is_some() {
                released += 1;
            }
            state.query_issued = false;
        }
        self.occlusion_live = false;
        log::debug!("Released {} occlusion queries", released);
    }

    /// Cull `scene` for `camera` into `list`, sorted for drawing. Returns the number of items.
    pub fn cull(&mut self, scene: &Scene, camera: &Camera, list: &mut RenderDataList) -> RenderResult<usize> {
        let view = ViewParams::from_camera(&scene.world(), camera);
        let Some(view) = view else {
            log::debug!("Camera has no owner in the scene, nothing to draw");
            list.clear();
            list.mark_culled();
            return Ok(0);
        };

        let occlusion = scene.occlusion_culling();
        if occlusion && !self.capabilities.occlusion_queries && !self.warned_occlusion {
            log::warn!("{} has no occlusion queries, drawing everything", self.backend.name());
            self.warned_occlusion = true;
        }
        if !occlusion && self.occlusion_live {
            self.release_occlusion_queries(scene);
        }
        let occlusion = occlusion && self.capabilities.occlusion_queries;

        self.cull_view(scene, &view, camera.render_mask, occlusion, false, list)?;

        if scene.pick_visible_only() {
            scene.lock_colliders().set_visible(list.entities());
        }
        Ok(list.len())
    }

    fn cull_view(
        &mut self,
        scene: &Scene,
        view: &ViewParams,
        mask: RenderMask,
        occlusion: bool,
        casters_only: bool,
        list: &mut RenderDataList,
    ) -> RenderResult<()> {
        list.clear();
        let frustum = scene
            .frustum_culling()
            .then(|| Frustum::from_matrix(&view.view_projection()));
        let candidates = collect_visible(&scene.world(), scene.root(), frustum.as_ref(), view.position);
        let candidates = if occlusion {
            self.update_occlusion(scene, candidates, list)?
        } else {
            candidates
        };

        let mut items = build_items(&scene.world(), &candidates);
        items.retain(|item| {
            item.render_data.render_mask.intersects(mask) && (!casters_only || item.render_data.cast_shadows)
        });
        sort_draw_items(&mut items);
        log::debug!("Cull: {} candidates, {} drawn", candidates.len(), items.len());
        list.items = items;
        list.mark_culled();
        Ok(())
    }

    /// Read finished queries, request new ones, and keep only visible candidates
    fn update_occlusion(
        &mut self,
        scene: &Scene,
        candidates: Vec<Candidate>,
        list: &mut RenderDataList,
    ) -> RenderResult<Vec<Candidate>> {
        let mut world = scene.world_mut();
        let mut visible = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let entity = candidate.entity;
            let Some(mesh) = world.get::<RenderData>(entity).and_then(|d| d.mesh.clone()) else {
                continue;
            };
            if world.get::<OcclusionState>(entity).is_none() {
                if let Ok(mut entity_mut) = world.get_entity_mut(entity) {
                    entity_mut.insert(OcclusionState::default());
                }
            }
            let Some(mut state) = world.get_mut::<OcclusionState>(entity) else {
                visible.push(candidate);
                continue;
            };

            let mut result = None;
            if state.query_issued {
                if let Some(query) = &state.query {
                    result = self.backend.poll_occlusion_query(query.handle());
                }
                if result.is_some() {
                    state.query_issued = false;
                }
            }

            let request = if state.query_issued {
                None
            } else {
                let handle = match &state.query {
                    Some(query) => query.handle(),
                    None => {
                        let handle = self.backend.create_occlusion_query()?;
                        state.query = Some(OcclusionQuery::new(handle, self.delete_queue.clone()));
                        self.occlusion_live = true;
                        handle
                    }
                };
                Some(handle)
            };
            drop(state);

            if let Some(samples) = result {
                if let Some(mut info) = world.get_mut::<ObjectInfo>(entity) {
                    if info.visible != (samples > 0) {
                        log::trace!("{:?} occlusion: {} samples", entity, samples);
                    }
                    info.visible = samples > 0;
                }
            }
            if let Some(query) = request {
                list.occlusion_requests.push(OcclusionRequest {
                    entity,
                    query,
                    model: candidate.model,
                    proxy: mesh.bounding_box(),
                });
            }
            let is_visible = world.get::<ObjectInfo>(entity).map(|i| i.visible).unwrap_or(true);
            if is_visible {
                visible.push(candidate);
            }
        }
        Ok(visible)
    }

    /// Draw the culled list of `target` for `camera`, then issue its occlusion queries
    pub fn render_camera(
        &mut self,
        scene: &Scene,
        camera: &Camera,
        target: &mut RenderTarget,
    ) -> RenderResult<SubmissionStatus> {
        self.stats.reset();
        target.set_camera(camera.clone());
        let view = ViewParams::from_camera(&scene.world(), camera);
        self.begin_pass();

        target.begin_rendering(self)?;
        let state = target.state().clone();
        let handle = target.render_data_handle();
        let requests = {
            let mut list = handle.lock();
            // a delegate sharing the list must not issue the queries again
            std::mem::take(&mut list.occlusion_requests)
        };

        let result = match &view {
            Some(view) => {
                let list = handle.lock();
                self.draw_items(scene.lights(), &list.items, view, &state)
                    .and_then(|_| self.issue_occlusion_queries(&requests, view, &state))
            }
            None => Ok(()),
        };
        let status = target.end_rendering(self);
        result?;

        if view.is_some() && !requests.is_empty() {
            let mut world = scene.world_mut();
            for request in &requests {
                if let Some(mut state) = world.get_mut::<OcclusionState>(request.entity) {
                    state.query_issued = true;
                }
            }
        }
        status
    }

    /// Render the casters seen from `camera` into the layer of `map`
    pub fn render_shadow_map(
        &mut self,
        scene: &Scene,
        camera: &LightCamera,
        map: &mut ShadowMap,
    ) -> RenderResult<()> {
        let layer = map.layer();
        let view = camera.view_params();
        let handle = map.target().render_data_handle();
        {
            let mut list = handle.lock();
            self.cull_view(scene, &view, RenderMask::LEFT, false, true, &mut list)?;
        }
        self.begin_pass();

        let target = map.target_mut();
        target.state_mut().render_mask = RenderMask::LEFT;
        match target.begin_rendering(self) {
            Ok(()) => {}
            Err(RenderError::Backend(BackendError::FramebufferIncomplete(reason))) => {
                return Err(RenderError::ShadowTargetIncomplete { layer, reason });
            }
            Err(e) => return Err(e),
        }
        let state = target.state().clone();
        let result = {
            let list = handle.lock();
            self.draw_items(scene.lights(), &list.items, &view, &state)
        };
        let status = target.end_rendering(self);
        result?;
        status?;
        Ok(())
    }

    /// Render one frame: lights, shadow maps, then every target in the chain of `target`
    pub fn render_frame(
        &mut self,
        scene: &Scene,
        camera: &Camera,
        target: &mut RenderTarget,
    ) -> RenderResult<SubmissionStatus> {
        self.wait_idle()?;
        self.process_queues()?;
        scene.attach_stats(self.stats.clone());

        let lights = scene.lights().clone();
        lights.update_transforms(scene)?;
        if lights.needs_shader_rebuild() || self.shaders.light_block().is_empty() {
            self.shaders.set_light_block(lights.make_shader_block());
            lights.shaders_rebuilt();
        }
        lights.make_shadow_maps(scene, self)?;
        lights.update_light_block(&mut self.backend, &self.delete_queue)?;
        self.prune_light_groups(&lights);

        let culled = target.render_data_handle();
        target.cull_from_camera(scene, camera, self)?;
        let mut status = SubmissionStatus::Complete;
        let mut current = Some(target);
        while let Some(target) = current {
            if !Arc::ptr_eq(&target.render_data_handle(), &culled) {
                target.cull_from_camera(scene, camera, self)?;
            }
            status = self.render_camera(scene, camera, target)?;
            current = target.next_mut();
        }
        Ok(status)
    }

    /// Slots of the transform ring can be reused once nothing in flight reads them
    fn begin_pass(&mut self) {
        let backend = &mut self.backend;
        self.pending.retain(|fence| !backend.is_fence_signaled(*fence));
        if self.pending.is_empty() {
            self.ring.next = 0;
        }
    }

    fn prune_light_groups(&mut self, lights: &LightList) {
        let alive = lights.buffers();
        let queue = &self.delete_queue;
        self.light_groups.retain(|(buffer, _), group| {
            let keep = alive.contains(buffer);
            if !keep {
                queue.push(GpuHandle::BindGroup(*group));
            }
            keep
        });
    }

    fn draw_items(
        &mut self,
        lights: &LightList,
        items: &[DrawItem],
        view: &ViewParams,
        state: &RenderState,
    ) -> RenderResult<()> {
        let viewport = state.viewport;
        self.backend.set_viewport(
            viewport.x as f32,
            viewport.y as f32,
            viewport.width as f32,
            viewport.height as f32,
            0.0,
            1.0,
        );
        for item in items {
            if item.render_data.render_mask.intersects(state.render_mask) {
                self.draw_item(lights, item, view, state)?;
            }
        }
        Ok(())
    }

    /// Draw every pass of `item`. A pass that cannot be drawn is logged and the
    /// item is drawn once with the error shader instead.
    fn draw_item(
        &mut self,
        lights: &LightList,
        item: &DrawItem,
        view: &ViewParams,
        state: &RenderState,
    ) -> RenderResult<()> {
        let Some(mesh) = item.render_data.mesh.clone() else {
            return Ok(());
        };
        for pass in &item.render_data.passes {
            let material = match (&state.material_override, &pass.material) {
                (Some(material), _) | (None, Some(material)) => material.clone(),
                (None, None) => continue,
            };
            let (shader, ready) = {
                let m = material.read();
                let shader = match (&state.material_override, pass.shader) {
                    (None, Some(shader)) => shader,
                    _ => m.shader_type(),
                };
                (shader, m.textures_ready())
            };
            if !ready {
                log::trace!("'{}' waits for its textures", item.name);
                continue;
            }

            let result = match shader {
                ShaderType::ExternalRenderer => self.draw_external(item, view),
                _ => self.draw_pass(lights, item, &mesh, pass, Some(&material), shader, view, state),
            };
            match result {
                Ok(()) => {}
                Err(e) if e.is_per_object() => {
                    log::error!("Cannot draw '{}': {}", item.name, e);
                    self.draw_pass(lights, item, &mesh, pass, None, ShaderType::Error, view, state)?;
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn draw_external(&mut self, item: &DrawItem, view: &ViewParams) -> RenderResult<()> {
        let Some(callback) = self.external.as_mut() else {
            return Err(RenderError::ShaderDispatch {
                object: item.name.clone(),
                reason: "no external renderer installed".into(),
            });
        };
        let mvp = view.view_projection() * item.model;
        callback(&item.render_data, &mvp)
    }

    #[allow(clippy::too_many_arguments)]
    fn draw_pass(
        &mut self,
        lights: &LightList,
        item: &DrawItem,
        mesh: &Mesh,
        pass: &RenderPass,
        material: Option<&SharedMaterial>,
        shader_type: ShaderType,
        view: &ViewParams,
        state: &RenderState,
    ) -> RenderResult<()> {
        let shader = self.shaders.shader(shader_type)?;
        let material_group = match material {
            Some(material) => self.material_group(&mut material.write(), shader_type, &shader)?,
            None => self.defaults.empty_material,
        };
        let light_group = if shader.uses_lights() && !state.shadow_pass {
            self.light_group(lights, &shader)?
        } else {
            // the atlas is the attachment of a shadow pass and cannot be sampled there
            self.defaults.empty_lights
        };
        let gpu = mesh.upload(&mut self.backend, &self.delete_queue)?;
        let pipeline = self.shaders.pipeline(
            &mut self.backend,
            shader_type,
            &pipeline_state(&item.render_data, pass.cull_face, state),
        )?;
        let transform = TransformUniform::new(item.model, view.view, view.projection, state.right_eye);
        let offset = self.push_transform(&transform)?;

        let backend = &mut self.backend;
        backend.set_render_pipeline(pipeline);
        backend.set_bind_group(0, self.ring.bind_group, &[offset]);
        backend.set_bind_group(1, material_group, &[]);
        backend.set_bind_group(2, light_group, &[]);
        if let (Some(stencil), true) = (item.render_data.stencil, state.use_stencil) {
            backend.set_stencil_reference(stencil.reference);
        }
        backend.set_vertex_buffer(0, gpu.vertex_buffer, 0);
        backend.set_index_buffer(gpu.index_buffer, 0, IndexFormat::Uint32);
        backend.draw_indexed(0..gpu.index_count, 0, 0..1);
        self.stats.record_draw(gpu.index_count / 3);
        Ok(())
    }

    /// Material bind group for `shader`, rebuilt when the shader, texture or
    /// layout changed and rewritten when the uniforms are dirty
    fn material_group(
        &mut self,
        material: &mut Material,
        shader_type: ShaderType,
        shader: &Shader,
    ) -> RenderResult<BindGroupHandle> {
        shader.check_material(material)?;
        let bytes = material.uniforms().pack_for(shader.layout())?;
        let view = match shader.texture() {
            Some(name) => {
                let texture = material.texture(name)?.clone();
                texture.upload(&mut self.backend, &self.delete_queue)?
            }
            None => self.defaults.white_view,
        };
        let size = bytes.len().max(16) as u64;

        let cached = material
            .gpu()
            .filter(|gpu| gpu.matches(shader_type, view, size))
            .map(|gpu| (gpu.buffer, gpu.bind_group));
        if let Some((buffer, bind_group)) = cached {
            if material.uniforms().is_dirty() {
                self.backend.write_buffer(buffer, 0, &bytes)?;
                material.uniforms_mut().clear_dirty();
            }
            return Ok(bind_group);
        }

        log::trace!("Creating GPU material '{}' for {}", material.name(), shader.name());
        let layouts = self.shaders.layouts(&mut self.backend)?;
        let mut data = bytes;
        data.resize(size as usize, 0);
        let buffer = self.backend.create_buffer_init(
            &BufferDescriptor {
                label: Some(format!("{} uniforms", material.name())),
                size,
                usage: BufferUsage::UNIFORM | BufferUsage::COPY_DST,
            },
            &data,
        )?;
        let bind_group = match self.backend.create_bind_group(
            layouts.material,
            &block_entries(buffer, Some(size), view, self.defaults.sampler),
        ) {
            Ok(group) => group,
            Err(e) => {
                self.backend.destroy_buffer(buffer);
                return Err(e.into());
            }
        };
        material.set_gpu(MaterialGpu::new(
            buffer,
            bind_group,
            view,
            shader_type,
            size,
            self.delete_queue.clone(),
        ));
        material.uniforms_mut().clear_dirty();
        Ok(bind_group)
    }

    fn light_group(&mut self, lights: &LightList, shader: &Shader) -> RenderResult<BindGroupHandle> {
        let buffer = lights.use_lights(&mut self.backend, &self.delete_queue, shader.name())?;
        let (view, sampler) = match &self.shadow_atlas {
            Some(atlas) => (atlas.array_view(), atlas.sampler()),
            None => (self.defaults.shadow_view, self.defaults.sampler),
        };
        if let Some(group) = self.light_groups.get(&(buffer, view)) {
            return Ok(*group);
        }
        let layouts = self.shaders.layouts(&mut self.backend)?;
        let group = self
            .backend
            .create_bind_group(layouts.lights, &block_entries(buffer, None, view, sampler))?;
        self.light_groups.insert((buffer, view), group);
        Ok(group)
    }

    /// Write `transform` into the next ring slot and return its dynamic offset.
    /// A full ring is replaced by one twice as large.
    fn push_transform(&mut self, transform: &TransformUniform) -> RenderResult<u32> {
        if self.ring.next >= self.ring.capacity {
            let layouts = self.shaders.layouts(&mut self.backend)?;
            let capacity = self.ring.capacity * 2;
            log::debug!("Transform ring full, growing to {} slots", capacity);
            let ring = TransformRing::create(&mut self.backend, layouts.transform, capacity, self.ring.stride)?;
            let old = std::mem::replace(&mut self.ring, ring);
            old.release(&self.delete_queue);
        }
        let offset = self.ring.next * self.ring.stride;
        self.backend
            .write_buffer(self.ring.buffer, u64::from(offset), bytemuck::bytes_of(transform))?;
        self.ring.next += 1;
        Ok(offset)
    }

    fn issue_occlusion_queries(
        &mut self,
        requests: &[OcclusionRequest],
        view: &ViewParams,
        state: &RenderState,
    ) -> RenderResult<()> {
        if requests.is_empty() {
            return Ok(());
        }
        let pipeline_state = PipelineState {
            cull_mode: CullMode::None,
            depth_write: false,
            color_writes: ColorWrites::NONE,
            color_format: state.color_format,
            depth_format: state.depth_format,
            sample_count: state.sample_count,
            ..Default::default()
        };
        let pipeline = self
            .shaders
            .pipeline(&mut self.backend, ShaderType::BoundingBox, &pipeline_state)?;

        for request in requests {
            let gpu = request.proxy.upload(&mut self.backend, &self.delete_queue)?;
            let transform = TransformUniform::new(request.model, view.view, view.projection, state.right_eye);
            let offset = self.push_transform(&transform)?;
            let backend = &mut self.backend;
            backend.set_render_pipeline(pipeline);
            backend.set_bind_group(0, self.ring.bind_group, &[offset]);
            backend.set_bind_group(1, self.defaults.empty_material, &[]);
            backend.set_bind_group(2, self.defaults.empty_lights, &[]);
            backend.set_vertex_buffer(0, gpu.vertex_buffer, 0);
            backend.set_index_buffer(gpu.index_buffer, 0, IndexFormat::Uint32);
            backend.begin_occlusion_query(request.query);
            backend.draw_indexed(0..gpu.index_count, 0, 0..1);
            backend.end_occlusion_query();
        }
        log::trace!("Issued {} occlusion queries", requests.len());
        Ok(())
    }
}

fn transform_stride(capabilities: &BackendCapabilities) -> u32 {
    let size = std::mem::size_of::<TransformUniform>() as u32;
    let align = capabilities.min_uniform_offset_alignment.max(16);
    size.div_ceil(align) * align
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Err(e) = self.wait_idle() {
            log::warn!("Renderer dropped with work in flight: {}", e);
        }
        self.ring.release(&self.delete_queue);
        for group in self.light_groups.values() {
            self.delete_queue.push(GpuHandle::BindGroup(*group));
        }
        self.defaults.release(&self.delete_queue);
        self.shadow_atlas = None;
        if let Err(e) = self.delete_queue.process_queues(&mut self.backend) {
            log::warn!("GPU objects leaked on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DummyBackend, RecordedCommand};
    use crate::resources::Material;
    use crate::scene::{Projection, Transform};
    use crate::BackendType;
    use bevy_ecs::prelude::Entity;
    use glam::{Vec3, Vec4};

    fn renderer() -> Renderer {
        Renderer::with_backend(
            DummyBackend::new().into(),
            RendererConfig::default().with_backend(BackendType::Dummy),
        )
        .unwrap()
    }

    fn dummy(renderer: &Renderer) -> &DummyBackend {
        renderer.backend().as_dummy().unwrap()
    }

    fn scene_with_cube() -> (Scene, Camera, Entity) {
        let scene = Scene::new();
        let eye = scene.add_object("eye");
        scene
            .set_transform(eye, Transform::from_position(Vec3::new(0.0, 0.0, 5.0)))
            .unwrap();
        let cube = scene.add_object("cube");
        let material = Material::unlit_color(Vec4::new(1.0, 0.0, 0.0, 1.0)).unwrap().into_shared();
        scene
            .set_render_data(cube, RenderData::new(Arc::new(Mesh::cube()), material))
            .unwrap();
        let camera = Camera::new(eye, Projection::default());
        (scene, camera, cube)
    }

    #[test]
    fn transform_slots_respect_uniform_alignment() {
        let caps = BackendCapabilities::default();
        let stride = transform_stride(&caps);
        assert_eq!(stride % caps.min_uniform_offset_alignment, 0);
        assert!(stride as usize >= std::mem::size_of::<TransformUniform>());
    }

    #[test]
    fn stencil_queue_writes_no_color() {
        let data = RenderData {
            rendering_order: RenderingOrder::STENCIL,
            ..Default::default()
        };
        let state = pipeline_state(&data, CullFace::Back, &RenderState::default());
        assert_eq!(state.color_writes, ColorWrites::NONE);
        assert!(!state.depth_write);

        let state = pipeline_state(&RenderData::default(), CullFace::None, &RenderState::default());
        assert_eq!(state.color_writes, ColorWrites::ALL);
        assert_eq!(state.cull_mode, CullMode::None);
        // alpha to coverage needs a multisampled target
        let data = RenderData {
            alpha_to_coverage: true,
            ..Default::default()
        };
        assert!(!pipeline_state(&data, CullFace::Back, &RenderState::default()).alpha_to_coverage);
    }

    #[test]
    fn detached_camera_culls_nothing() {
        let mut renderer = renderer();
        let (scene, _, _) = scene_with_cube();
        let mut list = RenderDataList::default();
        let camera = Camera::detached(Projection::default());
        assert_eq!(renderer.cull(&scene, &camera, &mut list).unwrap(), 0);
        assert_eq!(list.cull_count(), 1);
    }

    #[test]
    fn missing_external_renderer_falls_back_to_error_shader() {
        let mut renderer = renderer();
        let (scene, camera, cube) = scene_with_cube();
        let mut material = Material::unlit_color(Vec4::ONE).unwrap();
        material.set_shader_type(ShaderType::ExternalRenderer);
        scene
            .set_render_data(cube, RenderData::new(Arc::new(Mesh::cube()), material.into_shared()))
            .unwrap();

        let mut target = RenderTarget::new();
        let queue = renderer.delete_queue().clone();
        let texture = crate::render::RenderTexture::create(
            renderer.backend_mut(),
            &queue,
            &crate::render::RenderTextureDescriptor::new(8, 8),
        )
        .unwrap();
        target.set_texture(texture).unwrap();
        renderer.render_frame(&scene, &camera, &mut target).unwrap();

        let pipelines: Vec<_> = dummy(&renderer)
            .commands()
            .iter()
            .filter_map(|c| match c {
                RecordedCommand::SetPipeline(p) => dummy(&renderer).pipeline_label(*p).map(String::from),
                _ => None,
            })
            .collect();
        assert_eq!(pipelines, vec!["error".to_string()]);
        assert_eq!(renderer.stats().draw_calls(), 1);
    }

    #[test]
    fn external_renderer_receives_mvp() {
        let mut renderer = renderer();
        let (scene, camera, cube) = scene_with_cube();
        let mut material = Material::unlit_color(Vec4::ONE).unwrap();
        material.set_shader_type(ShaderType::ExternalRenderer);
        scene
            .set_render_data(cube, RenderData::new(Arc::new(Mesh::cube()), material.into_shared()))
            .unwrap();

        let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let seen = calls.clone();
        renderer.set_external_renderer(Some(Box::new(move |data, mvp| {
            assert!(data.mesh.is_some());
            assert_ne!(*mvp, Mat4::IDENTITY);
            seen.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            Ok(())
        })));

        let queue = renderer.delete_queue().clone();
        let texture = crate::render::RenderTexture::create(
            renderer.backend_mut(),
            &queue,
            &crate::render::RenderTextureDescriptor::new(8, 8),
        )
        .unwrap();
        let mut target = RenderTarget::with_texture(texture);
        renderer.render_frame(&scene, &camera, &mut target).unwrap();
        assert_eq!(calls.load(std::sync::atomic::Ordering::Relaxed), 1);
        assert_eq!(dummy(&renderer).draw_count(), 0);
    }

    #[test]
    fn full_ring_grows_instead_of_overwriting() {
        let mut renderer = Renderer::with_backend(
            DummyBackend::new().into(),
            RendererConfig::default()
                .with_backend(BackendType::Dummy)
                .with_transform_ring_capacity(2),
        )
        .unwrap();
        let transform = TransformUniform::new(Mat4::IDENTITY, Mat4::IDENTITY, Mat4::IDENTITY, false);
        let offsets: Vec<u32> = (0..3).map(|_| renderer.push_transform(&transform).unwrap()).collect();
        let stride = renderer.ring.stride;
        assert_eq!(offsets, vec![0, stride, 0]);
        assert_eq!(renderer.ring.capacity, 4);
        assert_eq!(renderer.delete_queue().pending_count(), 2);
    }
}
