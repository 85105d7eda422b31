//! Backend abstraction layer
//!
//! Provides common traits and types that the dummy, wgpu and Vulkan backends implement,
//! plus the closed [`Backend`] enum the renderer is built over.

pub mod dummy;
pub mod traits;
pub mod types;
pub mod wgpu_backend;

// Vulkan backend is only available on native platforms
#[cfg(not(target_arch = "wasm32"))]
pub mod vulkan;

pub use dummy::{DummyBackend, RecordedCommand};
pub use traits::*;
pub use types::*;

#[cfg(not(target_arch = "wasm32"))]
use crate::backend::vulkan::VulkanBackend;
use crate::backend::wgpu_backend::WgpuBackend;
use crate::{BackendType, RendererConfig};
use std::ops::Range;
use std::time::Duration;

/// Backend wrapper to abstract over the different backends
pub enum Backend {
    Dummy(DummyBackend),
    Wgpu(WgpuBackend),
    #[cfg(not(target_arch = "wasm32"))]
    Vulkan(VulkanBackend),
}

impl Backend {
    /// Create the backend selected by `config`
    pub fn new(config: &RendererConfig) -> BackendResult<Self> {
        log::info!("Creating {:?} backend", config.backend);
        match config.backend {
            BackendType::Dummy => Ok(Backend::Dummy(DummyBackend::new())),
            BackendType::Wgpu => Ok(Backend::Wgpu(WgpuBackend::new(config)?)),
            #[cfg(not(target_arch = "wasm32"))]
            BackendType::Vulkan => Ok(Backend::Vulkan(VulkanBackend::new(config)?)),
            #[cfg(target_arch = "wasm32")]
            BackendType::Vulkan => Err(BackendError::InitializationFailed(
                "Vulkan backend not available".into(),
            )),
        }
    }

    pub fn backend_type(&self) -> BackendType {
        match self {
            Backend::Dummy(_) => BackendType::Dummy,
            Backend::Wgpu(_) => BackendType::Wgpu,
            #[cfg(not(target_arch = "wasm32"))]
            Backend::Vulkan(_) => BackendType::Vulkan,
        }
    }

    /// Get the dummy backend (if using it)
    pub fn as_dummy(&self) -> Option<&DummyBackend> {
        match self {
            Backend::Dummy(b) => Some(b),
            _ => None,
        }
    }

    /// Get mutable dummy backend (if using it)
    pub fn as_dummy_mut(&mut self) -> Option<&mut DummyBackend> {
        match self {
            Backend::Dummy(b) => Some(b),
            _ => None,
        }
    }

    /// Get the wgpu backend (if using wgpu)
    pub fn as_wgpu(&self) -> Option<&WgpuBackend> {
        match self {
            Backend::Wgpu(b) => Some(b),
            _ => None,
        }
    }

    /// Get the Vulkan backend (if using Vulkan)
    #[cfg(not(target_arch = "wasm32"))]
    pub fn as_vulkan(&self) -> Option<&VulkanBackend> {
        match self {
            Backend::Vulkan(b) => Some(b),
            _ => None,
        }
    }
}

impl From<DummyBackend> for Backend {
    fn from(backend: DummyBackend) -> Self {
        Backend::Dummy(backend)
    }
}

macro_rules! dispatch {
    ($self:ident, $b:ident => $body:expr) => {
        match $self {
            Backend::Dummy($b) => $body,
            Backend::Wgpu($b) => $body,
            #[cfg(not(target_arch = "wasm32"))]
            Backend::Vulkan($b) => $body,
        }
    };
}

impl GraphicsBackend for Backend {
    fn name(&self) -> &'static str {
        dispatch!(self, b => b.name())
    }

    fn capabilities(&self) -> BackendCapabilities {
        dispatch!(self, b => b.capabilities())
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        dispatch!(self, b => b.create_buffer(desc))
    }

    fn create_buffer_init(&mut self, desc: &BufferDescriptor, data: &[u8]) -> BackendResult<BufferHandle> {
        dispatch!(self, b => b.create_buffer_init(desc, data))
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> BackendResult<()> {
        dispatch!(self, b => b.write_buffer(buffer, offset, data))
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        dispatch!(self, b => b.create_texture(desc))
    }

    fn create_texture_view(
        &mut self,
        texture: TextureHandle,
        desc: &TextureViewDescriptor,
    ) -> BackendResult<TextureViewHandle> {
        dispatch!(self, b => b.create_texture_view(texture, desc))
    }

    fn write_texture(
        &mut self,
        texture: TextureHandle,
        layer: u32,
        data: &[u8],
        width: u32,
        height: u32,
    ) -> BackendResult<()> {
        dispatch!(self, b => b.write_texture(texture, layer, data, width, height))
    }

    fn read_texture(&mut self, texture: TextureHandle, layer: u32, out: &mut [u8]) -> BackendResult<()> {
        dispatch!(self, b => b.read_texture(texture, layer, out))
    }

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle> {
        dispatch!(self, b => b.create_sampler(desc))
    }

    fn create_bind_group_layout(
        &mut self,
        entries: &[BindGroupLayoutEntry],
    ) -> BackendResult<BindGroupLayoutHandle> {
        dispatch!(self, b => b.create_bind_group_layout(entries))
    }

    fn create_bind_group(
        &mut self,
        layout: BindGroupLayoutHandle,
        entries: &[(u32, BindGroupEntry)],
    ) -> BackendResult<BindGroupHandle> {
        dispatch!(self, b => b.create_bind_group(layout, entries))
    }

    fn create_render_pipeline(
        &mut self,
        desc: &RenderPipelineDescriptor,
    ) -> BackendResult<RenderPipelineHandle> {
        dispatch!(self, b => b.create_render_pipeline(desc))
    }

    fn create_occlusion_query(&mut self) -> BackendResult<QueryHandle> {
        dispatch!(self, b => b.create_occlusion_query())
    }

    fn begin_occlusion_query(&mut self, query: QueryHandle) {
        dispatch!(self, b => b.begin_occlusion_query(query))
    }

    fn end_occlusion_query(&mut self) {
        dispatch!(self, b => b.end_occlusion_query())
    }

    fn poll_occlusion_query(&mut self, query: QueryHandle) -> Option<u64> {
        dispatch!(self, b => b.poll_occlusion_query(query))
    }

    fn begin_render_pass(&mut self, desc: &RenderPassDescriptor) -> BackendResult<()> {
        dispatch!(self, b => b.begin_render_pass(desc))
    }

    fn end_render_pass(&mut self) -> BackendResult<()> {
        dispatch!(self, b => b.end_render_pass())
    }

    fn set_render_pipeline(&mut self, pipeline: RenderPipelineHandle) {
        dispatch!(self, b => b.set_render_pipeline(pipeline))
    }

    fn set_bind_group(&mut self, index: u32, bind_group: BindGroupHandle, dynamic_offsets: &[u32]) {
        dispatch!(self, b => b.set_bind_group(index, bind_group, dynamic_offsets))
    }

    fn set_vertex_buffer(&mut self, slot: u32, buffer: BufferHandle, offset: u64) {
        dispatch!(self, b => b.set_vertex_buffer(slot, buffer, offset))
    }

    fn set_index_buffer(&mut self, buffer: BufferHandle, offset: u64, format: IndexFormat) {
        dispatch!(self, b => b.set_index_buffer(buffer, offset, format))
    }

    fn set_viewport(&mut self, x: f32, y: f32, width: f32, height: f32, min_depth: f32, max_depth: f32) {
        dispatch!(self, b => b.set_viewport(x, y, width, height, min_depth, max_depth))
    }

    fn set_scissor_rect(&mut self, x: u32, y: u32, width: u32, height: u32) {
        dispatch!(self, b => b.set_scissor_rect(x, y, width, height))
    }

    fn set_stencil_reference(&mut self, reference: u32) {
        dispatch!(self, b => b.set_stencil_reference(reference))
    }

    fn draw(&mut self, vertices: Range<u32>, instances: Range<u32>) {
        dispatch!(self, b => b.draw(vertices, instances))
    }

    fn draw_indexed(&mut self, indices: Range<u32>, base_vertex: i32, instances: Range<u32>) {
        dispatch!(self, b => b.draw_indexed(indices, base_vertex, instances))
    }

    fn submit(&mut self) -> BackendResult<SubmissionStatus> {
        dispatch!(self, b => b.submit())
    }

    fn is_fence_signaled(&mut self, fence: FenceHandle) -> bool {
        dispatch!(self, b => b.is_fence_signaled(fence))
    }

    fn wait_fence(&mut self, fence: FenceHandle, timeout: Duration) -> BackendResult<bool> {
        dispatch!(self, b => b.wait_fence(fence, timeout))
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        dispatch!(self, b => b.destroy_buffer(buffer))
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        dispatch!(self, b => b.destroy_texture(texture))
    }

    fn destroy_texture_view(&mut self, view: TextureViewHandle) {
        dispatch!(self, b => b.destroy_texture_view(view))
    }

    fn destroy_sampler(&mut self, sampler: SamplerHandle) {
        dispatch!(self, b => b.destroy_sampler(sampler))
    }

    fn destroy_bind_group(&mut self, bind_group: BindGroupHandle) {
        dispatch!(self, b => b.destroy_bind_group(bind_group))
    }

    fn destroy_render_pipeline(&mut self, pipeline: RenderPipelineHandle) {
        dispatch!(self, b => b.destroy_render_pipeline(pipeline))
    }

    fn destroy_occlusion_query(&mut self, query: QueryHandle) {
        dispatch!(self, b => b.destroy_occlusion_query(query))
    }
}
