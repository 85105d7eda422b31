//! Dummy GPU backend for testing and development.
//!
//! This backend doesn't touch any GPU but keeps textures and buffers in host
//! memory, records every command it is given and resolves occlusion queries
//! from a script. Tests inspect the recorded stream to check draw order,
//! render state and pass structure.

use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::time::Duration;

use crate::backend::traits::*;
use crate::backend::types::*;

/// One call recorded by the dummy backend.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    BeginRenderPass {
        label: Option<String>,
        color_views: Vec<TextureViewHandle>,
        depth_view: Option<TextureViewHandle>,
        clear_color: Option<[f32; 4]>,
        clear_depth: bool,
        clear_stencil: Option<u32>,
    },
    EndRenderPass,
    SetPipeline(RenderPipelineHandle),
    SetBindGroup {
        index: u32,
        bind_group: BindGroupHandle,
        offsets: Vec<u32>,
    },
    SetVertexBuffer(BufferHandle),
    SetIndexBuffer(BufferHandle),
    SetViewport([f32; 4]),
    SetScissor([u32; 4]),
    SetStencilReference(u32),
    Draw {
        vertices: Range<u32>,
        instances: Range<u32>,
    },
    DrawIndexed {
        indices: Range<u32>,
        instances: Range<u32>,
    },
    BeginOcclusionQuery(QueryHandle),
    EndOcclusionQuery,
    Submit,
}

#[derive(Debug)]
struct DummyTexture {
    desc: TextureDescriptor,
    layers: Vec<Vec<u8>>,
}

#[derive(Debug, Clone)]
struct DummyView {
    texture: u64,
    desc: TextureViewDescriptor,
}

#[derive(Debug, Default)]
struct DummyQuery {
    /// Samples counted since the last begin, not yet submitted
    recorded: Option<u64>,
    /// Submitted, waiting for a fence
    in_flight: Option<(u64, u64)>,
    result: Option<u64>,
}

/// Host-memory backend that records commands instead of executing them.
#[derive(Debug)]
pub struct DummyBackend {
    next_id: u64,
    buffers: HashMap<u64, Vec<u8>>,
    textures: HashMap<u64, DummyTexture>,
    views: HashMap<u64, DummyView>,
    samplers: HashSet<u64>,
    bind_group_layouts: HashSet<u64>,
    bind_groups: HashSet<u64>,
    pipelines: HashMap<u64, Option<String>>,
    queries: HashMap<u64, DummyQuery>,
    fences: HashMap<u64, bool>,

    commands: Vec<RecordedCommand>,
    in_pass: bool,
    active_query: Option<(u64, u32)>,
    draws_in_pass: u32,

    scripted_samples: HashMap<u64, u64>,
    default_samples: u64,
    incomplete_layers: HashSet<u32>,
    deferred: bool,
    submit_count: u32,
}

impl DummyBackend {
    /// Create a new dummy backend.
    pub fn new() -> Self {
        Self {
            next_id: 1,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            views: HashMap::new(),
            samplers: HashSet::new(),
            bind_group_layouts: HashSet::new(),
            bind_groups: HashSet::new(),
            pipelines: HashMap::new(),
            queries: HashMap::new(),
            fences: HashMap::new(),
            commands: Vec::new(),
            in_pass: false,
            active_query: None,
            draws_in_pass: 0,
            scripted_samples: HashMap::new(),
            default_samples: 1,
            incomplete_layers: HashSet::new(),
            deferred: false,
            submit_count: 0,
        }
    }

    /// Behave like a fence-based API: `submit` returns a pending fence that only
    /// signals on [`DummyBackend::signal_fences`] or `wait_fence`.
    pub fn with_deferred_submission(mut self) -> Self {
        self.deferred = true;
        self
    }

    /// Render passes attaching this layer of an array texture fail with
    /// `FramebufferIncomplete`.
    pub fn fail_attachment_layer(&mut self, layer: u32) {
        self.incomplete_layers.insert(layer);
    }

    /// Result reported for `query` whenever it completes.
    pub fn script_occlusion_result(&mut self, query: QueryHandle, samples: u64) {
        self.scripted_samples.insert(query.0, samples);
    }

    /// Samples reported per draw call for queries without a scripted result.
    pub fn set_default_occlusion_samples(&mut self, samples: u64) {
        self.default_samples = samples;
    }

    fn rejected_layer(&self, view: TextureViewHandle) -> Option<u32> {
        let view = self.views.get(&view.0)?;
        let texture = self.textures.get(&view.texture)?;
        let layer = view.desc.base_array_layer;
        (texture.desc.array_layers > 1 && self.incomplete_layers.contains(&layer)).then_some(layer)
    }

    /// Signal every outstanding fence.
    pub fn signal_fences(&mut self) {
        let pending: Vec<u64> = self
            .fences
            .iter()
            .filter(|(_, signaled)| !**signaled)
            .map(|(id, _)| *id)
            .collect();
        for id in pending {
            self.signal(id);
        }
    }

    pub fn commands(&self) -> &[RecordedCommand] {
        &self.commands
    }

    pub fn take_commands(&mut self) -> Vec<RecordedCommand> {
        std::mem::take(&mut self.commands)
    }

    /// Number of draw calls recorded so far.
    pub fn draw_count(&self) -> usize {
        self.commands
            .iter()
            .filter(|c| matches!(c, RecordedCommand::Draw { .. } | RecordedCommand::DrawIndexed { .. }))
            .count()
    }

    pub fn submit_count(&self) -> u32 {
        self.submit_count
    }

    pub fn live_texture_count(&self) -> usize {
        self.textures.len()
    }

    pub fn live_buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn live_query_count(&self) -> usize {
        self.queries.len()
    }

    pub fn pipeline_label(&self, pipeline: RenderPipelineHandle) -> Option<&str> {
        self.pipelines.get(&pipeline.0).and_then(|l| l.as_deref())
    }

    pub fn buffer_data(&self, buffer: BufferHandle) -> Option<&[u8]> {
        self.buffers.get(&buffer.0).map(|b| b.as_slice())
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn signal(&mut self, fence: u64) {
        self.fences.insert(fence, true);
        for query in self.queries.values_mut() {
            if let Some((f, samples)) = query.in_flight {
                if f == fence {
                    query.result = Some(samples);
                    query.in_flight = None;
                }
            }
        }
    }

    fn view_size(&self, view: TextureViewHandle) -> BackendResult<(u32, u32)> {
        let v = self.views.get(&view.0).ok_or(BackendError::InvalidHandle {
            kind: "texture view",
            id: view.0,
        })?;
        let tex = self
            .textures
            .get(&v.texture)
            .ok_or(BackendError::FramebufferIncomplete(format!(
                "view {} outlived its texture",
                view.0
            )))?;
        Ok((tex.desc.width, tex.desc.height))
    }

    fn clear_view(&mut self, view: TextureViewHandle, color: [f32; 4]) {
        let Some(v) = self.views.get(&view.0).cloned() else {
            return;
        };
        let Some(tex) = self.textures.get_mut(&v.texture) else {
            return;
        };
        let pixel = encode_color(tex.desc.format, color);
        let first = v.desc.base_array_layer as usize;
        let last = first + v.desc.array_layer_count as usize;
        for layer in tex.layers.iter_mut().take(last).skip(first) {
            for chunk in layer.chunks_exact_mut(pixel.len()) {
                chunk.copy_from_slice(&pixel);
            }
        }
    }
}

impl Default for DummyBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Pack a clear color the way the texture format stores it.
fn encode_color(format: TextureFormat, color: [f32; 4]) -> Vec<u8> {
    let unorm = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u8;
    match format {
        TextureFormat::Rgba8Unorm | TextureFormat::Rgba8UnormSrgb => {
            color.iter().map(|c| unorm(*c)).collect()
        }
        TextureFormat::Bgra8Unorm => vec![
            unorm(color[2]),
            unorm(color[1]),
            unorm(color[0]),
            unorm(color[3]),
        ],
        _ => vec![0; format.bytes_per_pixel() as usize],
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn validate_wgsl(source: &str) -> BackendResult<()> {
    naga::front::wgsl::parse_str(source)
        .map(|_| ())
        .map_err(|e| BackendError::ShaderCreationFailed(e.emit_to_string(source)))
}

#[cfg(target_arch = "wasm32")]
fn validate_wgsl(source: &str) -> BackendResult<()> {
    if source.contains("vs_main") {
        Ok(())
    } else {
        Err(BackendError::ShaderCreationFailed("missing vs_main".into()))
    }
}

impl GraphicsBackend for DummyBackend {
    fn name(&self) -> &'static str {
        "Dummy Backend"
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            occlusion_queries: true,
            deferred_submission: self.deferred,
            ..Default::default()
        }
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        log::trace!("DummyBackend: creating buffer {:?} (size: {})", desc.label, desc.size);
        let id = self.alloc_id();
        self.buffers.insert(id, vec![0; desc.size as usize]);
        Ok(BufferHandle(id))
    }

    fn create_buffer_init(&mut self, desc: &BufferDescriptor, data: &[u8]) -> BackendResult<BufferHandle> {
        let handle = self.create_buffer(&BufferDescriptor {
            size: desc.size.max(data.len() as u64),
            ..desc.clone()
        })?;
        self.write_buffer(handle, 0, data)?;
        Ok(handle)
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> BackendResult<()> {
        let storage = self.buffers.get_mut(&buffer.0).ok_or(BackendError::InvalidHandle {
            kind: "buffer",
            id: buffer.0,
        })?;
        let start = offset as usize;
        let end = start + data.len();
        if end > storage.len() {
            return Err(BackendError::BufferCreationFailed(format!(
                "write of {} bytes at {} overflows buffer of {} bytes",
                data.len(),
                offset,
                storage.len()
            )));
        }
        storage[start..end].copy_from_slice(data);
        Ok(())
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        log::trace!(
            "DummyBackend: creating texture {:?} ({}x{}x{})",
            desc.label,
            desc.width,
            desc.height,
            desc.array_layers
        );
        if desc.width == 0 || desc.height == 0 || desc.array_layers == 0 {
            return Err(BackendError::TextureCreationFailed(format!(
                "zero sized texture {:?}",
                desc.label
            )));
        }
        let layer_size = (desc.width * desc.height * desc.format.bytes_per_pixel()) as usize;
        let id = self.alloc_id();
        self.textures.insert(
            id,
            DummyTexture {
                desc: desc.clone(),
                layers: vec![vec![0; layer_size]; desc.array_layers as usize],
            },
        );
        Ok(TextureHandle(id))
    }

    fn create_texture_view(
        &mut self,
        texture: TextureHandle,
        desc: &TextureViewDescriptor,
    ) -> BackendResult<TextureViewHandle> {
        let tex = self.textures.get(&texture.0).ok_or(BackendError::InvalidHandle {
            kind: "texture",
            id: texture.0,
        })?;
        if desc.base_array_layer + desc.array_layer_count > tex.desc.array_layers {
            return Err(BackendError::TextureCreationFailed(format!(
                "view layers {}..{} out of range for {} layers",
                desc.base_array_layer,
                desc.base_array_layer + desc.array_layer_count,
                tex.desc.array_layers
            )));
        }
        let id = self.alloc_id();
        self.views.insert(
            id,
            DummyView {
                texture: texture.0,
                desc: desc.clone(),
            },
        );
        Ok(TextureViewHandle(id))
    }

    fn write_texture(
        &mut self,
        texture: TextureHandle,
        layer: u32,
        data: &[u8],
        width: u32,
        height: u32,
    ) -> BackendResult<()> {
        let tex = self.textures.get_mut(&texture.0).ok_or(BackendError::InvalidHandle {
            kind: "texture",
            id: texture.0,
        })?;
        let expected = (width * height * tex.desc.format.bytes_per_pixel()) as usize;
        let storage = tex
            .layers
            .get_mut(layer as usize)
            .ok_or_else(|| BackendError::TextureCreationFailed(format!("no layer {}", layer)))?;
        if data.len() < expected || storage.len() < expected {
            return Err(BackendError::TextureCreationFailed(format!(
                "texture upload of {} bytes, expected {}",
                data.len(),
                expected
            )));
        }
        storage[..expected].copy_from_slice(&data[..expected]);
        Ok(())
    }

    fn read_texture(&mut self, texture: TextureHandle, layer: u32, out: &mut [u8]) -> BackendResult<()> {
        let tex = self.textures.get(&texture.0).ok_or(BackendError::InvalidHandle {
            kind: "texture",
            id: texture.0,
        })?;
        let storage = tex
            .layers
            .get(layer as usize)
            .ok_or_else(|| BackendError::ReadbackFailed(format!("no layer {}", layer)))?;
        if out.len() < storage.len() {
            return Err(BackendError::ReadbackFailed(format!(
                "destination holds {} bytes, need {}",
                out.len(),
                storage.len()
            )));
        }
        out[..storage.len()].copy_from_slice(storage);
        Ok(())
    }

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle> {
        log::trace!("DummyBackend: creating sampler {:?}", desc.label);
        let id = self.alloc_id();
        self.samplers.insert(id);
        Ok(SamplerHandle(id))
    }

    fn create_bind_group_layout(
        &mut self,
        _entries: &[BindGroupLayoutEntry],
    ) -> BackendResult<BindGroupLayoutHandle> {
        let id = self.alloc_id();
        self.bind_group_layouts.insert(id);
        Ok(BindGroupLayoutHandle(id))
    }

    fn create_bind_group(
        &mut self,
        layout: BindGroupLayoutHandle,
        entries: &[(u32, BindGroupEntry)],
    ) -> BackendResult<BindGroupHandle> {
        if !self.bind_group_layouts.contains(&layout.0) {
            return Err(BackendError::InvalidHandle {
                kind: "bind group layout",
                id: layout.0,
            });
        }
        for (_, entry) in entries {
            let valid = match entry {
                BindGroupEntry::Buffer { buffer, .. } => self.buffers.contains_key(&buffer.0),
                BindGroupEntry::Texture(view) => self.views.contains_key(&view.0),
                BindGroupEntry::Sampler(sampler) => self.samplers.contains(&sampler.0),
            };
            if !valid {
                return Err(BackendError::InvalidHandle {
                    kind: "bind group entry",
                    id: 0,
                });
            }
        }
        let id = self.alloc_id();
        self.bind_groups.insert(id);
        Ok(BindGroupHandle(id))
    }

    fn create_render_pipeline(
        &mut self,
        desc: &RenderPipelineDescriptor,
    ) -> BackendResult<RenderPipelineHandle> {
        log::trace!("DummyBackend: creating pipeline {:?}", desc.label);
        validate_wgsl(&desc.shader)?;
        let id = self.alloc_id();
        self.pipelines.insert(id, desc.label.clone());
        Ok(RenderPipelineHandle(id))
    }

    fn create_occlusion_query(&mut self) -> BackendResult<QueryHandle> {
        let id = self.alloc_id();
        self.queries.insert(id, DummyQuery::default());
        Ok(QueryHandle(id))
    }

    fn begin_occlusion_query(&mut self, query: QueryHandle) {
        if let Some(q) = self.queries.get_mut(&query.0) {
            q.result = None;
            q.recorded = None;
        }
        self.active_query = Some((query.0, self.draws_in_pass));
        self.commands.push(RecordedCommand::BeginOcclusionQuery(query));
    }

    fn end_occlusion_query(&mut self) {
        if let Some((id, draws_at_begin)) = self.active_query.take() {
            let draws = (self.draws_in_pass - draws_at_begin) as u64;
            let samples = match self.scripted_samples.get(&id) {
                Some(samples) => *samples,
                None => draws * self.default_samples,
            };
            if let Some(q) = self.queries.get_mut(&id) {
                q.recorded = Some(samples);
            }
        }
        self.commands.push(RecordedCommand::EndOcclusionQuery);
    }

    fn poll_occlusion_query(&mut self, query: QueryHandle) -> Option<u64> {
        self.queries.get(&query.0).and_then(|q| q.result)
    }

    fn begin_render_pass(&mut self, desc: &RenderPassDescriptor) -> BackendResult<()> {
        if self.in_pass {
            return Err(BackendError::FramebufferIncomplete(
                "render pass already open".into(),
            ));
        }

        let mut size = None;
        for attachment in &desc.color_attachments {
            let s = self.view_size(attachment.view)?;
            if *size.get_or_insert(s) != s {
                return Err(BackendError::FramebufferIncomplete(
                    "attachment sizes differ".into(),
                ));
            }
        }
        if let Some(depth) = &desc.depth_stencil_attachment {
            let s = self.view_size(depth.view)?;
            if *size.get_or_insert(s) != s {
                return Err(BackendError::FramebufferIncomplete(
                    "depth attachment size differs".into(),
                ));
            }
        }
        if size.is_none() {
            return Err(BackendError::FramebufferIncomplete("no attachments".into()));
        }

        let attached = desc
            .color_attachments
            .iter()
            .map(|a| a.view)
            .chain(desc.depth_stencil_attachment.as_ref().map(|d| d.view));
        for view in attached {
            if let Some(layer) = self.rejected_layer(view) {
                return Err(BackendError::FramebufferIncomplete(format!("layer {} rejected", layer)));
            }
        }
        let mut clear_color = None;
        for attachment in &desc.color_attachments {
            if let LoadOp::Clear(color) = attachment.load_op {
                self.clear_view(attachment.view, color);
                clear_color = Some(color);
            }
        }

        self.commands.push(RecordedCommand::BeginRenderPass {
            label: desc.label.clone(),
            color_views: desc.color_attachments.iter().map(|a| a.view).collect(),
            depth_view: desc.depth_stencil_attachment.as_ref().map(|d| d.view),
            clear_color,
            clear_depth: desc
                .depth_stencil_attachment
                .as_ref()
                .map(|d| matches!(d.depth_load_op, LoadOp::Clear(_)))
                .unwrap_or(false),
            clear_stencil: desc
                .depth_stencil_attachment
                .as_ref()
                .and_then(|d| d.stencil_clear_value),
        });
        self.in_pass = true;
        self.draws_in_pass = 0;
        Ok(())
    }

    fn end_render_pass(&mut self) -> BackendResult<()> {
        if !self.in_pass {
            return Err(BackendError::SubmitFailed("no render pass is open".into()));
        }
        self.in_pass = false;
        self.commands.push(RecordedCommand::EndRenderPass);
        Ok(())
    }

    fn set_render_pipeline(&mut self, pipeline: RenderPipelineHandle) {
        self.commands.push(RecordedCommand::SetPipeline(pipeline));
    }

    fn set_bind_group(&mut self, index: u32, bind_group: BindGroupHandle, dynamic_offsets: &[u32]) {
        self.commands.push(RecordedCommand::SetBindGroup {
            index,
            bind_group,
            offsets: dynamic_offsets.to_vec(),
        });
    }

    fn set_vertex_buffer(&mut self, _slot: u32, buffer: BufferHandle, _offset: u64) {
        self.commands.push(RecordedCommand::SetVertexBuffer(buffer));
    }

    fn set_index_buffer(&mut self, buffer: BufferHandle, _offset: u64, _format: IndexFormat) {
        self.commands.push(RecordedCommand::SetIndexBuffer(buffer));
    }

    fn set_viewport(&mut self, x: f32, y: f32, width: f32, height: f32, _min_depth: f32, _max_depth: f32) {
        self.commands.push(RecordedCommand::SetViewport([x, y, width, height]));
    }

    fn set_scissor_rect(&mut self, x: u32, y: u32, width: u32, height: u32) {
        self.commands.push(RecordedCommand::SetScissor([x, y, width, height]));
    }

    fn set_stencil_reference(&mut self, reference: u32) {
        self.commands.push(RecordedCommand::SetStencilReference(reference));
    }

    fn draw(&mut self, vertices: Range<u32>, instances: Range<u32>) {
        self.draws_in_pass += 1;
        self.commands.push(RecordedCommand::Draw { vertices, instances });
    }

    fn draw_indexed(&mut self, indices: Range<u32>, _base_vertex: i32, instances: Range<u32>) {
        self.draws_in_pass += 1;
        self.commands.push(RecordedCommand::DrawIndexed { indices, instances });
    }

    fn submit(&mut self) -> BackendResult<SubmissionStatus> {
        if self.in_pass {
            return Err(BackendError::SubmitFailed(
                "submit while a render pass is open".into(),
            ));
        }
        self.submit_count += 1;
        self.commands.push(RecordedCommand::Submit);

        let fence = self.alloc_id();
        for query in self.queries.values_mut() {
            if let Some(samples) = query.recorded.take() {
                query.in_flight = Some((fence, samples));
            }
        }
        self.fences.insert(fence, false);

        if self.deferred {
            Ok(SubmissionStatus::Pending(FenceHandle(fence)))
        } else {
            self.signal(fence);
            self.fences.remove(&fence);
            Ok(SubmissionStatus::Complete)
        }
    }

    fn is_fence_signaled(&mut self, fence: FenceHandle) -> bool {
        self.fences.get(&fence.0).copied().unwrap_or(true)
    }

    fn wait_fence(&mut self, fence: FenceHandle, _timeout: Duration) -> BackendResult<bool> {
        if self.fences.contains_key(&fence.0) {
            self.signal(fence.0);
        }
        Ok(true)
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        self.buffers.remove(&buffer.0);
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        self.textures.remove(&texture.0);
    }

    fn destroy_texture_view(&mut self, view: TextureViewHandle) {
        self.views.remove(&view.0);
    }

    fn destroy_sampler(&mut self, sampler: SamplerHandle) {
        self.samplers.remove(&sampler.0);
    }

    fn destroy_bind_group(&mut self, bind_group: BindGroupHandle) {
        self.bind_groups.remove(&bind_group.0);
    }

    fn destroy_render_pipeline(&mut self, pipeline: RenderPipelineHandle) {
        self.pipelines.remove(&pipeline.0);
    }

    fn destroy_occlusion_query(&mut self, query: QueryHandle) {
        self.queries.remove(&query.0);
        self.scripted_samples.remove(&query.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn color_target(backend: &mut DummyBackend, w: u32, h: u32) -> (TextureHandle, TextureViewHandle) {
        let tex = backend
            .create_texture(&TextureDescriptor {
                width: w,
                height: h,
                usage: TextureUsage::RENDER_ATTACHMENT | TextureUsage::COPY_SRC,
                ..Default::default()
            })
            .unwrap();
        let view = backend
            .create_texture_view(tex, &TextureViewDescriptor::default())
            .unwrap();
        (tex, view)
    }

    #[test]
    fn clear_is_visible_in_readback() {
        let mut backend = DummyBackend::new();
        let (tex, view) = color_target(&mut backend, 2, 2);
        backend
            .begin_render_pass(&RenderPassDescriptor {
                label: None,
                color_attachments: vec![ColorAttachment {
                    view,
                    resolve_target: None,
                    load_op: LoadOp::Clear([1.0, 0.0, 0.0, 1.0]),
                    store_op: StoreOp::Store,
                }],
                depth_stencil_attachment: None,
            })
            .unwrap();
        backend.end_render_pass().unwrap();
        assert_eq!(backend.submit().unwrap(), SubmissionStatus::Complete);

        let mut out = vec![0u8; 16];
        backend.read_texture(tex, 0, &mut out).unwrap();
        assert_eq!(&out[..4], &[255, 0, 0, 255]);

        let mut short = vec![0u8; 15];
        assert!(backend.read_texture(tex, 0, &mut short).is_err());
    }

    #[test]
    fn mismatched_attachments_are_incomplete() {
        let mut backend = DummyBackend::new();
        let (_, color) = color_target(&mut backend, 4, 4);
        let depth_tex = backend
            .create_texture(&TextureDescriptor {
                width: 8,
                height: 8,
                format: TextureFormat::Depth32Float,
                usage: TextureUsage::RENDER_ATTACHMENT,
                ..Default::default()
            })
            .unwrap();
        let depth = backend
            .create_texture_view(depth_tex, &TextureViewDescriptor::default())
            .unwrap();
        let result = backend.begin_render_pass(&RenderPassDescriptor {
            label: None,
            color_attachments: vec![ColorAttachment {
                view: color,
                resolve_target: None,
                load_op: LoadOp::Load,
                store_op: StoreOp::Store,
            }],
            depth_stencil_attachment: Some(DepthStencilAttachment {
                view: depth,
                depth_load_op: LoadOp::Clear([1.0; 4]),
                depth_store_op: StoreOp::Store,
                depth_clear_value: 1.0,
                stencil_clear_value: None,
            }),
        });
        assert!(matches!(result, Err(BackendError::FramebufferIncomplete(_))));
    }

    #[test]
    fn deferred_queries_resolve_on_fence() {
        let mut backend = DummyBackend::new().with_deferred_submission();
        let (_, view) = color_target(&mut backend, 1, 1);
        let query = backend.create_occlusion_query().unwrap();
        backend
            .begin_render_pass(&RenderPassDescriptor {
                label: None,
                color_attachments: vec![ColorAttachment {
                    view,
                    resolve_target: None,
                    load_op: LoadOp::Load,
                    store_op: StoreOp::Store,
                }],
                depth_stencil_attachment: None,
            })
            .unwrap();
        backend.begin_occlusion_query(query);
        backend.draw(0..3, 0..1);
        backend.end_occlusion_query();
        backend.end_render_pass().unwrap();

        let status = backend.submit().unwrap();
        let fence = status.fence().unwrap();
        assert!(!backend.is_fence_signaled(fence));
        assert_eq!(backend.poll_occlusion_query(query), None);

        backend.signal_fences();
        assert!(backend.is_fence_signaled(fence));
        assert_eq!(backend.poll_occlusion_query(query), Some(1));
    }

    #[test]
    fn broken_shader_fails_pipeline_creation() {
        let mut backend = DummyBackend::new();
        let result = backend.create_render_pipeline(&RenderPipelineDescriptor {
            label: Some("broken".into()),
            shader: "fn vs_main( {".into(),
            vertex_layouts: vec![],
            bind_group_layouts: vec![],
            primitive_topology: PrimitiveTopology::TriangleList,
            front_face: FrontFace::Ccw,
            cull_mode: CullMode::None,
            depth_stencil: None,
            color_targets: vec![],
            sample_count: 1,
            alpha_to_coverage: false,
        });
        assert!(matches!(result, Err(BackendError::ShaderCreationFailed(_))));
    }
}
