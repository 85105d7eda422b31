//! Vulkan backend implementation using ash
//!
//! Headless Vulkan 1.3 with dynamic rendering. Render pass commands are buffered
//! and recorded into the frame command buffer on `end_render_pass`, once the
//! layout transitions and query resets they need are known. `submit` hands the
//! command buffer to the queue with a fence and returns without waiting.

mod conversion;
mod deferred;
mod device;
mod pipeline;

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::RendererConfig;
use ash::vk;
use deferred::DeferredQueue;
use device::DeviceContext;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use gpu_allocator::{AllocationError, MemoryLocation};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

const MAX_OCCLUSION_QUERIES: u32 = 1024;
const MAX_DESCRIPTOR_SETS: u32 = 4096;
const READBACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Buffered render pass command
enum RenderCommand {
    SetPipeline(RenderPipelineHandle),
    SetBindGroup { index: u32, bind_group: BindGroupHandle, offsets: Vec<u32> },
    SetVertexBuffer { slot: u32, buffer: BufferHandle, offset: u64 },
    SetIndexBuffer { buffer: BufferHandle, offset: u64, format: IndexFormat },
    SetViewport { x: f32, y: f32, width: f32, height: f32, min_depth: f32, max_depth: f32 },
    SetScissorRect { x: u32, y: u32, width: u32, height: u32 },
    SetStencilReference(u32),
    Draw { vertices: std::ops::Range<u32>, instances: std::ops::Range<u32> },
    DrawIndexed { indices: std::ops::Range<u32>, base_vertex: i32, instances: std::ops::Range<u32> },
    BeginOcclusionQuery(u32),
    EndOcclusionQuery(u32),
}

struct PendingRenderPass {
    descriptor: RenderPassDescriptor,
    commands: Vec<RenderCommand>,
}

struct VkBuffer {
    buffer: vk::Buffer,
    allocation: Allocation,
    size: u64,
}

struct VkTexture {
    image: vk::Image,
    allocation: Allocation,
    desc: TextureDescriptor,
    /// Current layout of every array layer, as recorded so far
    layouts: Vec<vk::ImageLayout>,
}

struct VkView {
    view: vk::ImageView,
    texture: u64,
    base_layer: u32,
    layer_count: u32,
}

struct VkLayout {
    layout: vk::DescriptorSetLayout,
    types: HashMap<u32, vk::DescriptorType>,
}

struct VkBindGroup {
    set: vk::DescriptorSet,
    /// Sampled views, moved to shader-read layout before a pass uses them
    views: Vec<u64>,
}

struct VkRenderPipeline {
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
}

struct QuerySlot {
    index: u32,
    result: Option<u64>,
}

struct Submission {
    id: u64,
    fence: vk::Fence,
    command_buffer: vk::CommandBuffer,
    queries: Vec<u64>,
}

/// Objects waiting for the GPU to stop using them
enum Retired {
    Buffer(vk::Buffer, Allocation),
    Image(vk::Image, Allocation),
    ImageView(vk::ImageView),
    Sampler(vk::Sampler),
    DescriptorSet(vk::DescriptorSet),
    Pipeline(vk::Pipeline, vk::PipelineLayout),
    /// Query pool slot, reusable once no submission writes it
    QueryIndex(u32),
}

/// Vulkan backend implementation
pub struct VulkanBackend {
    ctx: DeviceContext,
    allocator: Option<Allocator>,
    capabilities: BackendCapabilities,
    command_pool: vk::CommandPool,
    descriptor_pool: vk::DescriptorPool,
    query_pool: vk::QueryPool,

    // Recording
    recording: Option<vk::CommandBuffer>,
    recorded_queries: Vec<u64>,
    pending_render_pass: Option<PendingRenderPass>,
    active_query: Option<u32>,

    // Submissions
    free_command_buffers: Vec<vk::CommandBuffer>,
    free_fences: Vec<vk::Fence>,
    in_flight: VecDeque<Submission>,
    next_fence_id: u64,
    completed_fence: u64,
    retired: DeferredQueue<Retired>,

    // Resource storage
    buffers: HashMap<u64, VkBuffer>,
    textures: HashMap<u64, VkTexture>,
    texture_views: HashMap<u64, VkView>,
    samplers: HashMap<u64, vk::Sampler>,
    descriptor_set_layouts: HashMap<u64, VkLayout>,
    bind_groups: HashMap<u64, VkBindGroup>,
    render_pipelines: HashMap<u64, VkRenderPipeline>,
    queries: HashMap<u64, QuerySlot>,
    free_query_indices: Vec<u32>,
    next_query_index: u32,

    // Handle counters
    next_buffer_id: u64,
    next_texture_id: u64,
    next_view_id: u64,
    next_sampler_id: u64,
    next_layout_id: u64,
    next_bind_group_id: u64,
    next_render_pipeline_id: u64,
    next_query_id: u64,
}

fn allocation_error(error: AllocationError) -> BackendError {
    match error {
        AllocationError::OutOfMemory => BackendError::OutOfMemory,
        other => BackendError::BufferCreationFailed(other.to_string()),
    }
}

fn submit_error(error: vk::Result) -> BackendError {
    match error {
        vk::Result::ERROR_DEVICE_LOST => BackendError::DeviceLost,
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => BackendError::OutOfMemory,
        other => BackendError::SubmitFailed(other.to_string()),
    }
}

/// Record barriers moving `layers` of `texture` into `new_layout`
fn transition(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    texture: &mut VkTexture,
    layers: std::ops::Range<u32>,
    new_layout: vk::ImageLayout,
) {
    let aspect_mask = conversion::aspect(texture.desc.format);
    let barriers: Vec<vk::ImageMemoryBarrier> = layers
        .clone()
        .filter(|layer| texture.layouts[*layer as usize] != new_layout)
        .map(|layer| vk::ImageMemoryBarrier {
            src_access_mask: vk::AccessFlags::MEMORY_WRITE,
            dst_access_mask: vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            old_layout: texture.layouts[layer as usize],
            new_layout,
            src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            image: texture.image,
            subresource_range: vk::ImageSubresourceRange {
                aspect_mask,
                base_mip_level: 0,
                level_count: vk::REMAINING_MIP_LEVELS,
                base_array_layer: layer,
                layer_count: 1,
            },
            ..Default::default()
        })
        .collect();
    if barriers.is_empty() {
        return;
    }
    for layer in layers {
        texture.layouts[layer as usize] = new_layout;
    }
    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &barriers,
        );
    }
}

impl VulkanBackend {
    /// Create a headless Vulkan backend
    pub fn new(config: &RendererConfig) -> BackendResult<Self> {
        let ctx = device::create(config)?;
        match Self::create_pools(&ctx) {
            Ok((allocator, command_pool, descriptor_pool, query_pool)) => {
                let capabilities = BackendCapabilities {
                    occlusion_queries: true,
                    deferred_submission: true,
                    multiview: false,
                    min_uniform_offset_alignment: ctx.limits.min_uniform_buffer_offset_alignment as u32,
                    max_texture_array_layers: ctx.limits.max_image_array_layers,
                };
                Ok(Self {
                    ctx,
                    allocator: Some(allocator),
                    capabilities,
                    command_pool,
                    descriptor_pool,
                    query_pool,
                    recording: None,
                    recorded_queries: Vec::new(),
                    pending_render_pass: None,
                    active_query: None,
                    free_command_buffers: Vec::new(),
                    free_fences: Vec::new(),
                    in_flight: VecDeque::new(),
                    next_fence_id: 1,
                    completed_fence: 0,
                    retired: DeferredQueue::new(),
                    buffers: HashMap::new(),
                    textures: HashMap::new(),
                    texture_views: HashMap::new(),
                    samplers: HashMap::new(),
                    descriptor_set_layouts: HashMap::new(),
                    bind_groups: HashMap::new(),
                    render_pipelines: HashMap::new(),
                    queries: HashMap::new(),
                    free_query_indices: Vec::new(),
                    next_query_index: 0,
                    next_buffer_id: 1,
                    next_texture_id: 1,
                    next_view_id: 1,
                    next_sampler_id: 1,
                    next_layout_id: 1,
                    next_bind_group_id: 1,
                    next_render_pipeline_id: 1,
                    next_query_id: 1,
                })
            }
            Err(e) => {
                unsafe {
                    ctx.device.destroy_device(None);
                    ctx.instance.destroy_instance(None);
                }
                Err(e)
            }
        }
    }

    fn create_pools(
        ctx: &DeviceContext,
    ) -> BackendResult<(Allocator, vk::CommandPool, vk::DescriptorPool, vk::QueryPool)> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: ctx.instance.clone(),
            device: ctx.device.clone(),
            physical_device: ctx.physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

        unsafe {
            let pool_info = vk::CommandPoolCreateInfo {
                queue_family_index: ctx.queue_family,
                flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
                ..Default::default()
            };
            let command_pool = ctx
                .device
                .create_command_pool(&pool_info, None)
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let pool_sizes = [
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::UNIFORM_BUFFER,
                    descriptor_count: MAX_DESCRIPTOR_SETS,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
                    descriptor_count: MAX_DESCRIPTOR_SETS / 4,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::SAMPLED_IMAGE,
                    descriptor_count: MAX_DESCRIPTOR_SETS,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::SAMPLER,
                    descriptor_count: MAX_DESCRIPTOR_SETS,
                },
            ];
            let descriptor_pool_info = vk::DescriptorPoolCreateInfo::default()
                .pool_sizes(&pool_sizes)
                .max_sets(MAX_DESCRIPTOR_SETS)
                .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET);
            let descriptor_pool = ctx
                .device
                .create_descriptor_pool(&descriptor_pool_info, None)
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let query_info = vk::QueryPoolCreateInfo {
                query_type: vk::QueryType::OCCLUSION,
                query_count: MAX_OCCLUSION_QUERIES,
                ..Default::default()
            };
            let query_pool = ctx
                .device
                .create_query_pool(&query_info, None)
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            Ok((allocator, command_pool, descriptor_pool, query_pool))
        }
    }

    /// Get the Vulkan device
    pub fn device(&self) -> &ash::Device {
        &self.ctx.device
    }

    /// Submissions whose fence has not been seen signaled yet
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Destroyed objects still waiting on a fence
    pub fn retired_count(&self) -> usize {
        self.retired.len()
    }

    /// The frame command buffer, begun on first use
    fn recording(&mut self) -> BackendResult<vk::CommandBuffer> {
        if let Some(cmd) = self.recording {
            return Ok(cmd);
        }
        unsafe {
            let cmd = match self.free_command_buffers.pop() {
                Some(cmd) => cmd,
                None => {
                    let alloc_info = vk::CommandBufferAllocateInfo {
                        command_pool: self.command_pool,
                        level: vk::CommandBufferLevel::PRIMARY,
                        command_buffer_count: 1,
                        ..Default::default()
                    };
                    self.ctx
                        .device
                        .allocate_command_buffers(&alloc_info)
                        .map_err(submit_error)?[0]
                }
            };
            let begin_info = vk::CommandBufferBeginInfo {
                flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
                ..Default::default()
            };
            self.ctx
                .device
                .begin_command_buffer(cmd, &begin_info)
                .map_err(submit_error)?;
            self.recording = Some(cmd);
            Ok(cmd)
        }
    }

    fn record(&mut self, command: RenderCommand) {
        match self.pending_render_pass.as_mut() {
            Some(pass) => pass.commands.push(command),
            None => log::warn!("VulkanBackend: render command outside of a render pass"),
        }
    }

    fn allocate_buffer(
        &mut self,
        name: &str,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> BackendResult<(vk::Buffer, Allocation)> {
        let device = &self.ctx.device;
        let allocator = self
            .allocator
            .as_mut()
            .ok_or_else(|| BackendError::BufferCreationFailed("Allocator not available".into()))?;
        unsafe {
            let buffer_info = vk::BufferCreateInfo {
                size: size.max(4),
                usage,
                sharing_mode: vk::SharingMode::EXCLUSIVE,
                ..Default::default()
            };
            let buffer = device
                .create_buffer(&buffer_info, None)
                .map_err(|e| BackendError::BufferCreationFailed(e.to_string()))?;
            let requirements = device.get_buffer_memory_requirements(buffer);
            let allocation = match allocator.allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            }) {
                Ok(allocation) => allocation,
                Err(e) => {
                    device.destroy_buffer(buffer, None);
                    return Err(allocation_error(e));
                }
            };
            if let Err(e) = device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset()) {
                device.destroy_buffer(buffer, None);
                let _ = allocator.free(allocation);
                return Err(BackendError::BufferCreationFailed(e.to_string()));
            }
            Ok((buffer, allocation))
        }
    }

    /// Fence the object must wait for: the open command buffer, else the last submission
    fn retire(&mut self, item: Retired) {
        if self.recording.is_none() && self.in_flight.is_empty() {
            self.destroy_now(item);
        } else if self.recording.is_some() {
            self.retired.push(self.next_fence_id, item);
        } else {
            self.retired.push(self.next_fence_id - 1, item);
        }
    }

    fn destroy_now(&mut self, item: Retired) {
        let device = &self.ctx.device;
        unsafe {
            match item {
                Retired::Buffer(buffer, allocation) => {
                    device.destroy_buffer(buffer, None);
                    if let Some(allocator) = self.allocator.as_mut() {
                        let _ = allocator.free(allocation);
                    }
                }
                Retired::Image(image, allocation) => {
                    device.destroy_image(image, None);
                    if let Some(allocator) = self.allocator.as_mut() {
                        let _ = allocator.free(allocation);
                    }
                }
                Retired::ImageView(view) => device.destroy_image_view(view, None),
                Retired::Sampler(sampler) => device.destroy_sampler(sampler, None),
                Retired::DescriptorSet(set) => {
                    let _ = device.free_descriptor_sets(self.descriptor_pool, &[set]);
                }
                Retired::Pipeline(pipeline, layout) => {
                    device.destroy_pipeline(pipeline, None);
                    device.destroy_pipeline_layout(layout, None);
                }
                Retired::QueryIndex(index) => self.free_query_indices.push(index),
            }
        }
    }

    /// Recycle every submission up to and including `id`, read their queries
    /// and free what was waiting on them
    fn complete_through(&mut self, id: u64) {
        while self.in_flight.front().map(|s| s.id <= id).unwrap_or(false) {
            let Some(submission) = self.in_flight.pop_front() else {
                break;
            };
            unsafe {
                match self.ctx.device.reset_fences(&[submission.fence]) {
                    Ok(()) => self.free_fences.push(submission.fence),
                    Err(e) => {
                        log::warn!("VulkanBackend: failed to reset fence: {}", e);
                        self.ctx.device.destroy_fence(submission.fence, None);
                    }
                }
                match self
                    .ctx
                    .device
                    .reset_command_buffer(submission.command_buffer, vk::CommandBufferResetFlags::empty())
                {
                    Ok(()) => self.free_command_buffers.push(submission.command_buffer),
                    Err(e) => log::warn!("VulkanBackend: failed to reset command buffer: {}", e),
                }
            }
            self.read_queries(&submission.queries);
            self.completed_fence = submission.id;
        }
        for item in self.retired.drain_completed(self.completed_fence) {
            self.destroy_now(item);
        }
    }

    /// Non-blocking: retire the prefix of submissions that have finished
    fn poll_submissions(&mut self) {
        let mut done = None;
        for submission in &self.in_flight {
            match unsafe { self.ctx.device.get_fence_status(submission.fence) } {
                Ok(true) => done = Some(submission.id),
                _ => break,
            }
        }
        if let Some(id) = done {
            self.complete_through(id);
        }
    }

    fn read_queries(&mut self, ids: &[u64]) {
        for id in ids {
            let Some(slot) = self.queries.get_mut(id) else {
                continue;
            };
            let mut samples = [0u64; 1];
            let result = unsafe {
                self.ctx.device.get_query_pool_results(
                    self.query_pool,
                    slot.index,
                    &mut samples,
                    vk::QueryResultFlags::TYPE_64,
                )
            };
            match result {
                Ok(()) => slot.result = Some(samples[0]),
                Err(e) => log::warn!("VulkanBackend: occlusion query {} unavailable: {}", id, e),
            }
        }
    }

    fn view_size(&self, view: TextureViewHandle) -> BackendResult<(u32, u32)> {
        let v = self.texture_views.get(&view.0).ok_or(BackendError::InvalidHandle {
            kind: "texture view",
            id: view.0,
        })?;
        let texture = self.textures.get(&v.texture).ok_or_else(|| {
            BackendError::FramebufferIncomplete(format!("view {} outlived its texture", view.0))
        })?;
        Ok((texture.desc.width, texture.desc.height))
    }

    fn view_format(&self, view: TextureViewHandle) -> Option<TextureFormat> {
        let v = self.texture_views.get(&view.0)?;
        self.textures.get(&v.texture).map(|t| t.desc.format)
    }

    fn transition_view(&mut self, cmd: vk::CommandBuffer, view: u64, layout: vk::ImageLayout) {
        let Some(v) = self.texture_views.get(&view) else {
            return;
        };
        let (texture, layers) = (v.texture, v.base_layer..v.base_layer + v.layer_count);
        if let Some(tex) = self.textures.get_mut(&texture) {
            transition(&self.ctx.device, cmd, tex, layers, layout);
        }
    }

    fn image_view(&self, view: TextureViewHandle) -> BackendResult<vk::ImageView> {
        self.texture_views
            .get(&view.0)
            .map(|v| v.view)
            .ok_or(BackendError::InvalidHandle {
                kind: "texture view",
                id: view.0,
            })
    }

    fn record_pass(&mut self, pending: PendingRenderPass) -> BackendResult<()> {
        let cmd = self.recording()?;
        let desc = &pending.descriptor;

        for attachment in &desc.color_attachments {
            self.transition_view(cmd, attachment.view.0, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
            if let Some(resolve) = attachment.resolve_target {
                self.transition_view(cmd, resolve.0, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
            }
        }
        if let Some(depth) = &desc.depth_stencil_attachment {
            self.transition_view(cmd, depth.view.0, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
        }
        let sampled: Vec<u64> = pending
            .commands
            .iter()
            .filter_map(|command| match command {
                RenderCommand::SetBindGroup { bind_group, .. } => self.bind_groups.get(&bind_group.0),
                _ => None,
            })
            .flat_map(|group| group.views.iter().copied())
            .collect();
        for view in sampled {
            self.transition_view(cmd, view, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        }

        let device = &self.ctx.device;
        unsafe {
            for command in &pending.commands {
                if let RenderCommand::BeginOcclusionQuery(index) = command {
                    device.cmd_reset_query_pool(cmd, self.query_pool, *index, 1);
                }
            }
        }

        let first = desc
            .color_attachments
            .first()
            .map(|a| a.view)
            .or(desc.depth_stencil_attachment.as_ref().map(|d| d.view))
            .ok_or_else(|| BackendError::FramebufferIncomplete("no attachments".into()))?;
        let (width, height) = self.view_size(first)?;

        let mut color_infos = Vec::with_capacity(desc.color_attachments.len());
        for attachment in &desc.color_attachments {
            let clear = match attachment.load_op {
                LoadOp::Clear(color) => color,
                LoadOp::Load => [0.0; 4],
            };
            let mut info = vk::RenderingAttachmentInfo::default()
                .image_view(self.image_view(attachment.view)?)
                .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .load_op(conversion::load_op(&attachment.load_op))
                .store_op(conversion::store_op(attachment.store_op))
                .clear_value(vk::ClearValue {
                    color: vk::ClearColorValue { float32: clear },
                });
            if let Some(resolve) = attachment.resolve_target {
                info = info
                    .resolve_mode(vk::ResolveModeFlags::AVERAGE)
                    .resolve_image_view(self.image_view(resolve)?)
                    .resolve_image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
            }
            color_infos.push(info);
        }

        let mut depth_info = None;
        let mut stencil_info = None;
        if let Some(depth) = &desc.depth_stencil_attachment {
            let view = self.image_view(depth.view)?;
            let clear = vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: depth.depth_clear_value,
                    stencil: depth.stencil_clear_value.unwrap_or(0),
                },
            };
            depth_info = Some(
                vk::RenderingAttachmentInfo::default()
                    .image_view(view)
                    .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                    .load_op(conversion::load_op(&depth.depth_load_op))
                    .store_op(conversion::store_op(depth.depth_store_op))
                    .clear_value(clear),
            );
            if self.view_format(depth.view).map(|f| f.has_stencil()).unwrap_or(false) {
                stencil_info = Some(
                    vk::RenderingAttachmentInfo::default()
                        .image_view(view)
                        .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                        .load_op(match depth.stencil_clear_value {
                            Some(_) => vk::AttachmentLoadOp::CLEAR,
                            None => vk::AttachmentLoadOp::LOAD,
                        })
                        .store_op(vk::AttachmentStoreOp::STORE)
                        .clear_value(clear),
                );
            }
        }

        let area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: vk::Extent2D { width, height },
        };
        let mut rendering = vk::RenderingInfo::default()
            .render_area(area)
            .layer_count(1)
            .color_attachments(&color_infos);
        if let Some(info) = depth_info.as_ref() {
            rendering = rendering.depth_attachment(info);
        }
        if let Some(info) = stencil_info.as_ref() {
            rendering = rendering.stencil_attachment(info);
        }

        let query_flags = if self.ctx.precise_occlusion {
            vk::QueryControlFlags::PRECISE
        } else {
            vk::QueryControlFlags::empty()
        };

        unsafe {
            device.cmd_begin_rendering(cmd, &rendering);
            device.cmd_set_viewport(
                cmd,
                0,
                &[vk::Viewport {
                    x: 0.0,
                    y: 0.0,
                    width: width as f32,
                    height: height as f32,
                    min_depth: 0.0,
                    max_depth: 1.0,
                }],
            );
            device.cmd_set_scissor(cmd, 0, &[area]);

            let mut layout = None;
            for command in &pending.commands {
                match command {
                    RenderCommand::SetPipeline(handle) => {
                        if let Some(pipeline) = self.render_pipelines.get(&handle.0) {
                            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline.pipeline);
                            layout = Some(pipeline.layout);
                        }
                    }
                    RenderCommand::SetBindGroup { index, bind_group, offsets } => {
                        match (layout, self.bind_groups.get(&bind_group.0)) {
                            (Some(layout), Some(group)) => device.cmd_bind_descriptor_sets(
                                cmd,
                                vk::PipelineBindPoint::GRAPHICS,
                                layout,
                                *index,
                                &[group.set],
                                offsets,
                            ),
                            _ => log::warn!("VulkanBackend: bind group {} set without a pipeline", index),
                        }
                    }
                    RenderCommand::SetVertexBuffer { slot, buffer, offset } => {
                        if let Some(buf) = self.buffers.get(&buffer.0) {
                            device.cmd_bind_vertex_buffers(cmd, *slot, &[buf.buffer], &[*offset]);
                        }
                    }
                    RenderCommand::SetIndexBuffer { buffer, offset, format } => {
                        if let Some(buf) = self.buffers.get(&buffer.0) {
                            device.cmd_bind_index_buffer(cmd, buf.buffer, *offset, conversion::index_type(*format));
                        }
                    }
                    RenderCommand::SetViewport { x, y, width, height, min_depth, max_depth } => {
                        device.cmd_set_viewport(
                            cmd,
                            0,
                            &[vk::Viewport {
                                x: *x,
                                y: *y,
                                width: *width,
                                height: *height,
                                min_depth: *min_depth,
                                max_depth: *max_depth,
                            }],
                        );
                    }
                    RenderCommand::SetScissorRect { x, y, width, height } => {
                        device.cmd_set_scissor(
                            cmd,
                            0,
                            &[vk::Rect2D {
                                offset: vk::Offset2D {
                                    x: *x as i32,
                                    y: *y as i32,
                                },
                                extent: vk::Extent2D {
                                    width: *width,
                                    height: *height,
                                },
                            }],
                        );
                    }
                    RenderCommand::SetStencilReference(reference) => {
                        device.cmd_set_stencil_reference(cmd, vk::StencilFaceFlags::FRONT_AND_BACK, *reference);
                    }
                    RenderCommand::Draw { vertices, instances } => {
                        device.cmd_draw(
                            cmd,
                            vertices.end - vertices.start,
                            instances.end - instances.start,
                            vertices.start,
                            instances.start,
                        );
                    }
                    RenderCommand::DrawIndexed { indices, base_vertex, instances } => {
                        device.cmd_draw_indexed(
                            cmd,
                            indices.end - indices.start,
                            instances.end - instances.start,
                            indices.start,
                            *base_vertex,
                            instances.start,
                        );
                    }
                    RenderCommand::BeginOcclusionQuery(index) => {
                        device.cmd_begin_query(cmd, self.query_pool, *index, query_flags);
                    }
                    RenderCommand::EndOcclusionQuery(index) => {
                        device.cmd_end_query(cmd, self.query_pool, *index);
                    }
                }
            }

            device.cmd_end_rendering(cmd);
        }
        Ok(())
    }
}

impl GraphicsBackend for VulkanBackend {
    fn name(&self) -> &'static str {
        "Vulkan Backend"
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.capabilities
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        // Host visible memory so uniform and mesh writes are plain copies
        let location = if desc.usage.contains(BufferUsage::MAP_READ) {
            MemoryLocation::GpuToCpu
        } else {
            MemoryLocation::CpuToGpu
        };
        let (buffer, allocation) = self.allocate_buffer(
            desc.label.as_deref().unwrap_or("buffer"),
            desc.size,
            conversion::buffer_usage(desc.usage),
            location,
        )?;

        let id = self.next_buffer_id;
        self.next_buffer_id += 1;
        self.buffers.insert(
            id,
            VkBuffer {
                buffer,
                allocation,
                size: desc.size,
            },
        );
        Ok(BufferHandle(id))
    }

    fn create_buffer_init(&mut self, desc: &BufferDescriptor, data: &[u8]) -> BackendResult<BufferHandle> {
        let handle = self.create_buffer(desc)?;
        if let Err(e) = self.write_buffer(handle, 0, data) {
            self.destroy_buffer(handle);
            return Err(e);
        }
        Ok(handle)
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> BackendResult<()> {
        let vk_buffer = self.buffers.get_mut(&buffer.0).ok_or(BackendError::InvalidHandle {
            kind: "buffer",
            id: buffer.0,
        })?;
        if offset + data.len() as u64 > vk_buffer.size {
            return Err(BackendError::BufferCreationFailed(format!(
                "write of {} bytes at {} overflows buffer of {}",
                data.len(),
                offset,
                vk_buffer.size
            )));
        }
        let mapped = vk_buffer
            .allocation
            .mapped_slice_mut()
            .ok_or_else(|| BackendError::BufferCreationFailed("buffer is not host visible".into()))?;
        let start = offset as usize;
        mapped[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        if desc.array_layers > self.capabilities.max_texture_array_layers {
            return Err(BackendError::TextureCreationFailed(format!(
                "{} layers exceeds the limit of {}",
                desc.array_layers, self.capabilities.max_texture_array_layers
            )));
        }
        let device = &self.ctx.device;
        let allocator = self
            .allocator
            .as_mut()
            .ok_or_else(|| BackendError::TextureCreationFailed("Allocator not available".into()))?;

        unsafe {
            let image_info = vk::ImageCreateInfo {
                image_type: vk::ImageType::TYPE_2D,
                format: conversion::format(desc.format, self.ctx.depth_stencil_format),
                extent: vk::Extent3D {
                    width: desc.width,
                    height: desc.height,
                    depth: 1,
                },
                mip_levels: desc.mip_levels.max(1),
                array_layers: desc.array_layers.max(1),
                samples: conversion::sample_count(desc.sample_count),
                tiling: vk::ImageTiling::OPTIMAL,
                usage: conversion::image_usage(desc.usage, desc.format),
                sharing_mode: vk::SharingMode::EXCLUSIVE,
                initial_layout: vk::ImageLayout::UNDEFINED,
                ..Default::default()
            };
            let image = device
                .create_image(&image_info, None)
                .map_err(|e| BackendError::TextureCreationFailed(e.to_string()))?;

            let requirements = device.get_image_memory_requirements(image);
            let allocation = match allocator.allocate(&AllocationCreateDesc {
                name: desc.label.as_deref().unwrap_or("texture"),
                requirements,
                location: MemoryLocation::GpuOnly,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            }) {
                Ok(allocation) => allocation,
                Err(e) => {
                    device.destroy_image(image, None);
                    return Err(match e {
                        AllocationError::OutOfMemory => BackendError::OutOfMemory,
                        other => BackendError::TextureCreationFailed(other.to_string()),
                    });
                }
            };
            if let Err(e) = device.bind_image_memory(image, allocation.memory(), allocation.offset()) {
                device.destroy_image(image, None);
                let _ = allocator.free(allocation);
                return Err(BackendError::TextureCreationFailed(e.to_string()));
            }

            let id = self.next_texture_id;
            self.next_texture_id += 1;
            self.textures.insert(
                id,
                VkTexture {
                    image,
                    allocation,
                    desc: desc.clone(),
                    layouts: vec![vk::ImageLayout::UNDEFINED; desc.array_layers.max(1) as usize],
                },
            );
            Ok(TextureHandle(id))
        }
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

        let view_info = vk::ImageViewCreateInfo {
            image: tex.image,
            view_type: conversion::view_type(desc.dimension),
            format: conversion::format(tex.desc.format, self.ctx.depth_stencil_format),
            subresource_range: vk::ImageSubresourceRange {
                aspect_mask: conversion::aspect(tex.desc.format),
                base_mip_level: 0,
                level_count: vk::REMAINING_MIP_LEVELS,
                base_array_layer: desc.base_array_layer,
                layer_count: desc.array_layer_count,
            },
            ..Default::default()
        };
        let view = unsafe {
            self.ctx
                .device
                .create_image_view(&view_info, None)
                .map_err(|e| BackendError::TextureCreationFailed(e.to_string()))?
        };

        let id = self.next_view_id;
        self.next_view_id += 1;
        self.texture_views.insert(
            id,
            VkView {
                view,
                texture: texture.0,
                base_layer: desc.base_array_layer,
                layer_count: desc.array_layer_count,
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
        let (format, layers) = self
            .textures
            .get(&texture.0)
            .map(|t| (t.desc.format, t.desc.array_layers))
            .ok_or(BackendError::InvalidHandle {
                kind: "texture",
                id: texture.0,
            })?;
        let expected = (width * height * format.bytes_per_pixel()) as usize;
        if data.len() < expected || layer >= layers {
            return Err(BackendError::TextureCreationFailed(format!(
                "texture upload of {} bytes to layer {}, expected {} bytes",
                data.len(),
                layer,
                expected
            )));
        }

        let (staging, mut allocation) = self.allocate_buffer(
            "texture staging",
            expected as u64,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
        )?;
        if let Some(mapped) = allocation.mapped_slice_mut() {
            mapped[..expected].copy_from_slice(&data[..expected]);
        }

        let cmd = match self.recording() {
            Ok(cmd) => cmd,
            Err(e) => {
                self.destroy_now(Retired::Buffer(staging, allocation));
                return Err(e);
            }
        };
        if let Some(tex) = self.textures.get_mut(&texture.0) {
            let device = &self.ctx.device;
            transition(device, cmd, tex, layer..layer + 1, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
            let region = vk::BufferImageCopy {
                buffer_offset: 0,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: conversion::aspect(tex.desc.format),
                    mip_level: 0,
                    base_array_layer: layer,
                    layer_count: 1,
                },
                image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
                image_extent: vk::Extent3D {
                    width,
                    height,
                    depth: 1,
                },
            };
            unsafe {
                device.cmd_copy_buffer_to_image(
                    cmd,
                    staging,
                    tex.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
            }
            transition(device, cmd, tex, layer..layer + 1, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        }
        self.retire(Retired::Buffer(staging, allocation));
        Ok(())
    }

    fn read_texture(&mut self, texture: TextureHandle, layer: u32, out: &mut [u8]) -> BackendResult<()> {
        if self.pending_render_pass.is_some() {
            return Err(BackendError::ReadbackFailed("render pass still open".into()));
        }
        let desc = self
            .textures
            .get(&texture.0)
            .map(|t| t.desc.clone())
            .ok_or(BackendError::InvalidHandle {
                kind: "texture",
                id: texture.0,
            })?;
        if desc.format.is_depth() || desc.sample_count > 1 {
            return Err(BackendError::ReadbackFailed(format!(
                "cannot copy from {:?} x{} texture",
                desc.format, desc.sample_count
            )));
        }
        if layer >= desc.array_layers {
            return Err(BackendError::ReadbackFailed(format!("no layer {}", layer)));
        }
        let needed = (desc.width * desc.height * desc.format.bytes_per_pixel()) as usize;
        if out.len() < needed {
            return Err(BackendError::ReadbackFailed(format!(
                "destination holds {} bytes, need {}",
                out.len(),
                needed
            )));
        }

        let (staging, allocation) = self.allocate_buffer(
            "readback staging",
            needed as u64,
            vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuToCpu,
        )?;
        let cmd = match self.recording() {
            Ok(cmd) => cmd,
            Err(e) => {
                self.destroy_now(Retired::Buffer(staging, allocation));
                return Err(e);
            }
        };
        if let Some(tex) = self.textures.get_mut(&texture.0) {
            let device = &self.ctx.device;
            transition(device, cmd, tex, layer..layer + 1, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
            let region = vk::BufferImageCopy {
                buffer_offset: 0,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: layer,
                    layer_count: 1,
                },
                image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
                image_extent: vk::Extent3D {
                    width: desc.width,
                    height: desc.height,
                    depth: 1,
                },
            };
            let host_read = vk::MemoryBarrier {
                src_access_mask: vk::AccessFlags::TRANSFER_WRITE,
                dst_access_mask: vk::AccessFlags::HOST_READ,
                ..Default::default()
            };
            unsafe {
                device.cmd_copy_image_to_buffer(cmd, tex.image, vk::ImageLayout::TRANSFER_SRC_OPTIMAL, staging, &[region]);
                device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::HOST,
                    vk::DependencyFlags::empty(),
                    &[host_read],
                    &[],
                    &[],
                );
            }
        }

        let status = self.submit()?;
        if let Some(fence) = status.fence() {
            if !self.wait_fence(fence, READBACK_TIMEOUT)? {
                self.retire(Retired::Buffer(staging, allocation));
                return Err(BackendError::ReadbackFailed("timed out waiting for the GPU".into()));
            }
        }
        if let Some(mapped) = allocation.mapped_slice() {
            out[..needed].copy_from_slice(&mapped[..needed]);
        }
        self.destroy_now(Retired::Buffer(staging, allocation));
        Ok(())
    }

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle> {
        let sampler_info = vk::SamplerCreateInfo {
            mag_filter: conversion::filter(desc.mag_filter),
            min_filter: conversion::filter(desc.min_filter),
            mipmap_mode: vk::SamplerMipmapMode::NEAREST,
            address_mode_u: conversion::address_mode(desc.address_mode_u),
            address_mode_v: conversion::address_mode(desc.address_mode_v),
            address_mode_w: conversion::address_mode(desc.address_mode_w),
            min_lod: 0.0,
            max_lod: vk::LOD_CLAMP_NONE,
            border_color: vk::BorderColor::FLOAT_OPAQUE_BLACK,
            ..Default::default()
        };
        let sampler = unsafe {
            self.ctx
                .device
                .create_sampler(&sampler_info, None)
                .map_err(|e| BackendError::TextureCreationFailed(e.to_string()))?
        };

        let id = self.next_sampler_id;
        self.next_sampler_id += 1;
        self.samplers.insert(id, sampler);
        Ok(SamplerHandle(id))
    }

    fn create_bind_group_layout(
        &mut self,
        entries: &[BindGroupLayoutEntry],
    ) -> BackendResult<BindGroupLayoutHandle> {
        let bindings: Vec<vk::DescriptorSetLayoutBinding> = entries
            .iter()
            .map(|e| vk::DescriptorSetLayoutBinding {
                binding: e.binding,
                descriptor_type: conversion::descriptor_type(&e.ty),
                descriptor_count: 1,
                stage_flags: conversion::shader_stages(e.visibility),
                ..Default::default()
            })
            .collect();
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        let layout = unsafe {
            self.ctx
                .device
                .create_descriptor_set_layout(&layout_info, None)
                .map_err(|e| BackendError::PipelineCreationFailed(e.to_string()))?
        };

        let id = self.next_layout_id;
        self.next_layout_id += 1;
        self.descriptor_set_layouts.insert(
            id,
            VkLayout {
                layout,
                types: bindings.iter().map(|b| (b.binding, b.descriptor_type)).collect(),
            },
        );
        Ok(BindGroupLayoutHandle(id))
    }

    fn create_bind_group(
        &mut self,
        layout: BindGroupLayoutHandle,
        entries: &[(u32, BindGroupEntry)],
    ) -> BackendResult<BindGroupHandle> {
        let vk_layout = self.descriptor_set_layouts.get(&layout.0).ok_or(BackendError::InvalidHandle {
            kind: "bind group layout",
            id: layout.0,
        })?;

        // Infos are collected first so the writes can point into stable storage
        let mut buffer_infos = Vec::new();
        let mut image_infos = Vec::new();
        let mut slots = Vec::with_capacity(entries.len());
        let mut views = Vec::new();
        for (binding, entry) in entries {
            let ty = *vk_layout.types.get(binding).ok_or_else(|| {
                BackendError::PipelineCreationFailed(format!("binding {} is not in the layout", binding))
            })?;
            match entry {
                BindGroupEntry::Buffer { buffer, offset, size } => {
                    let buf = self.buffers.get(&buffer.0).ok_or(BackendError::InvalidHandle {
                        kind: "buffer",
                        id: buffer.0,
                    })?;
                    slots.push((*binding, ty, true, buffer_infos.len()));
                    buffer_infos.push(vk::DescriptorBufferInfo {
                        buffer: buf.buffer,
                        offset: *offset,
                        range: size.unwrap_or(vk::WHOLE_SIZE),
                    });
                }
                BindGroupEntry::Texture(view) => {
                    slots.push((*binding, ty, false, image_infos.len()));
                    image_infos.push(vk::DescriptorImageInfo {
                        sampler: vk::Sampler::null(),
                        image_view: self.image_view(*view)?,
                        image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    });
                    views.push(view.0);
                }
                BindGroupEntry::Sampler(sampler) => {
                    let s = self.samplers.get(&sampler.0).ok_or(BackendError::InvalidHandle {
                        kind: "sampler",
                        id: sampler.0,
                    })?;
                    slots.push((*binding, ty, false, image_infos.len()));
                    image_infos.push(vk::DescriptorImageInfo {
                        sampler: *s,
                        image_view: vk::ImageView::null(),
                        image_layout: vk::ImageLayout::UNDEFINED,
                    });
                }
            }
        }

        let set = unsafe {
            let alloc_info = vk::DescriptorSetAllocateInfo::default()
                .descriptor_pool(self.descriptor_pool)
                .set_layouts(std::slice::from_ref(&vk_layout.layout));
            self.ctx
                .device
                .allocate_descriptor_sets(&alloc_info)
                .map_err(|e| match e {
                    vk::Result::ERROR_OUT_OF_POOL_MEMORY => BackendError::OutOfMemory,
                    other => BackendError::PipelineCreationFailed(other.to_string()),
                })?[0]
        };

        let writes: Vec<vk::WriteDescriptorSet> = slots
            .iter()
            .map(|(binding, ty, is_buffer, index)| {
                let write = vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(*binding)
                    .descriptor_type(*ty);
                if *is_buffer {
                    write.buffer_info(std::slice::from_ref(&buffer_infos[*index]))
                } else {
                    write.image_info(std::slice::from_ref(&image_infos[*index]))
                }
            })
            .collect();
        unsafe {
            self.ctx.device.update_descriptor_sets(&writes, &[]);
        }

        let id = self.next_bind_group_id;
        self.next_bind_group_id += 1;
        self.bind_groups.insert(id, VkBindGroup { set, views });
        Ok(BindGroupHandle(id))
    }

    fn create_render_pipeline(
        &mut self,
        desc: &RenderPipelineDescriptor,
    ) -> BackendResult<RenderPipelineHandle> {
        let mut set_layouts = Vec::with_capacity(desc.bind_group_layouts.len());
        for handle in &desc.bind_group_layouts {
            let layout = self.descriptor_set_layouts.get(&handle.0).ok_or(BackendError::InvalidHandle {
                kind: "bind group layout",
                id: handle.0,
            })?;
            set_layouts.push(layout.layout);
        }

        let (pipeline, layout) =
            pipeline::create_graphics_pipeline(&self.ctx.device, desc, &set_layouts, self.ctx.depth_stencil_format)?;

        let id = self.next_render_pipeline_id;
        self.next_render_pipeline_id += 1;
        self.render_pipelines.insert(id, VkRenderPipeline { pipeline, layout });
        Ok(RenderPipelineHandle(id))
    }

    fn create_occlusion_query(&mut self) -> BackendResult<QueryHandle> {
        let index = match self.free_query_indices.pop() {
            Some(index) => index,
            None if self.next_query_index < MAX_OCCLUSION_QUERIES => {
                self.next_query_index += 1;
                self.next_query_index - 1
            }
            None => {
                return Err(BackendError::QueryFailed(format!(
                    "all {} occlusion slots in use",
                    MAX_OCCLUSION_QUERIES
                )))
            }
        };
        let id = self.next_query_id;
        self.next_query_id += 1;
        self.queries.insert(id, QuerySlot { index, result: None });
        Ok(QueryHandle(id))
    }

    fn begin_occlusion_query(&mut self, query: QueryHandle) {
        let Some(slot) = self.queries.get_mut(&query.0) else {
            log::warn!("VulkanBackend: unknown occlusion query {}", query.0);
            return;
        };
        slot.result = None;
        let index = slot.index;
        self.active_query = Some(index);
        self.recorded_queries.push(query.0);
        self.record(RenderCommand::BeginOcclusionQuery(index));
    }

    fn end_occlusion_query(&mut self) {
        if let Some(index) = self.active_query.take() {
            self.record(RenderCommand::EndOcclusionQuery(index));
        }
    }

    fn poll_occlusion_query(&mut self, query: QueryHandle) -> Option<u64> {
        self.poll_submissions();
        self.queries.get(&query.0).and_then(|slot| slot.result)
    }

    fn begin_render_pass(&mut self, desc: &RenderPassDescriptor) -> BackendResult<()> {
        if self.pending_render_pass.is_some() {
            return Err(BackendError::FramebufferIncomplete("render pass already open".into()));
        }

        let mut size = None;
        for attachment in &desc.color_attachments {
            let s = self.view_size(attachment.view)?;
            if *size.get_or_insert(s) != s {
                return Err(BackendError::FramebufferIncomplete("attachment sizes differ".into()));
            }
            if let Some(resolve) = attachment.resolve_target {
                if self.view_size(resolve)? != s {
                    return Err(BackendError::FramebufferIncomplete("resolve target size differs".into()));
                }
            }
        }
        if let Some(depth) = &desc.depth_stencil_attachment {
            let s = self.view_size(depth.view)?;
            if *size.get_or_insert(s) != s {
                return Err(BackendError::FramebufferIncomplete("depth attachment size differs".into()));
            }
            if !self.view_format(depth.view).map(|f| f.is_depth()).unwrap_or(false) {
                return Err(BackendError::FramebufferIncomplete("depth attachment has a color format".into()));
            }
        }
        if size.is_none() {
            return Err(BackendError::FramebufferIncomplete("no attachments".into()));
        }

        self.pending_render_pass = Some(PendingRenderPass {
            descriptor: desc.clone(),
            commands: Vec::new(),
        });
        Ok(())
    }

    fn end_render_pass(&mut self) -> BackendResult<()> {
        match self.pending_render_pass.take() {
            Some(pending) => self.record_pass(pending),
            None => Ok(()),
        }
    }

    fn set_render_pipeline(&mut self, pipeline: RenderPipelineHandle) {
        self.record(RenderCommand::SetPipeline(pipeline));
    }

    fn set_bind_group(&mut self, index: u32, bind_group: BindGroupHandle, dynamic_offsets: &[u32]) {
        self.record(RenderCommand::SetBindGroup {
            index,
            bind_group,
            offsets: dynamic_offsets.to_vec(),
        });
    }

    fn set_vertex_buffer(&mut self, slot: u32, buffer: BufferHandle, offset: u64) {
        self.record(RenderCommand::SetVertexBuffer { slot, buffer, offset });
    }

    fn set_index_buffer(&mut self, buffer: BufferHandle, offset: u64, format: IndexFormat) {
        self.record(RenderCommand::SetIndexBuffer { buffer, offset, format });
    }

    fn set_viewport(&mut self, x: f32, y: f32, width: f32, height: f32, min_depth: f32, max_depth: f32) {
        self.record(RenderCommand::SetViewport { x, y, width, height, min_depth, max_depth });
    }

    fn set_scissor_rect(&mut self, x: u32, y: u32, width: u32, height: u32) {
        self.record(RenderCommand::SetScissorRect { x, y, width, height });
    }

    fn set_stencil_reference(&mut self, reference: u32) {
        self.record(RenderCommand::SetStencilReference(reference));
    }

    fn draw(&mut self, vertices: std::ops::Range<u32>, instances: std::ops::Range<u32>) {
        self.record(RenderCommand::Draw { vertices, instances });
    }

    fn draw_indexed(&mut self, indices: std::ops::Range<u32>, base_vertex: i32, instances: std::ops::Range<u32>) {
        self.record(RenderCommand::DrawIndexed { indices, base_vertex, instances });
    }

    fn submit(&mut self) -> BackendResult<SubmissionStatus> {
        if self.pending_render_pass.is_some() {
            return Err(BackendError::SubmitFailed("submit while a render pass is open".into()));
        }
        let Some(cmd) = self.recording.take() else {
            self.poll_submissions();
            return Ok(SubmissionStatus::Complete);
        };

        let fence = unsafe {
            self.ctx.device.end_command_buffer(cmd).map_err(submit_error)?;
            let fence = match self.free_fences.pop() {
                Some(fence) => fence,
                None => self
                    .ctx
                    .device
                    .create_fence(&vk::FenceCreateInfo::default(), None)
                    .map_err(submit_error)?,
            };
            let submit_info = vk::SubmitInfo::default().command_buffers(std::slice::from_ref(&cmd));
            if let Err(e) = self.ctx.device.queue_submit(self.ctx.queue, &[submit_info], fence) {
                self.free_fences.push(fence);
                return Err(submit_error(e));
            }
            fence
        };

        let id = self.next_fence_id;
        self.next_fence_id += 1;
        self.in_flight.push_back(Submission {
            id,
            fence,
            command_buffer: cmd,
            queries: std::mem::take(&mut self.recorded_queries),
        });
        log::trace!("VulkanBackend: submitted command buffer under fence {}", id);
        Ok(SubmissionStatus::Pending(FenceHandle(id)))
    }

    fn is_fence_signaled(&mut self, fence: FenceHandle) -> bool {
        if fence.0 <= self.completed_fence {
            return true;
        }
        let Some(vk_fence) = self.in_flight.iter().find(|s| s.id == fence.0).map(|s| s.fence) else {
            return true;
        };
        match unsafe { self.ctx.device.get_fence_status(vk_fence) } {
            Ok(true) => {
                self.complete_through(fence.0);
                true
            }
            _ => false,
        }
    }

    fn wait_fence(&mut self, fence: FenceHandle, timeout: Duration) -> BackendResult<bool> {
        if fence.0 <= self.completed_fence {
            return Ok(true);
        }
        let Some(vk_fence) = self.in_flight.iter().find(|s| s.id == fence.0).map(|s| s.fence) else {
            return Ok(true);
        };
        let nanos = timeout.as_nanos().min(u64::MAX as u128) as u64;
        match unsafe { self.ctx.device.wait_for_fences(&[vk_fence], true, nanos) } {
            Ok(()) => {
                self.complete_through(fence.0);
                Ok(true)
            }
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(submit_error(e)),
        }
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if let Some(vk_buffer) = self.buffers.remove(&buffer.0) {
            self.retire(Retired::Buffer(vk_buffer.buffer, vk_buffer.allocation));
        }
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        if let Some(vk_texture) = self.textures.remove(&texture.0) {
            self.retire(Retired::Image(vk_texture.image, vk_texture.allocation));
        }
    }

    fn destroy_texture_view(&mut self, view: TextureViewHandle) {
        if let Some(vk_view) = self.texture_views.remove(&view.0) {
            self.retire(Retired::ImageView(vk_view.view));
        }
    }

    fn destroy_sampler(&mut self, sampler: SamplerHandle) {
        if let Some(vk_sampler) = self.samplers.remove(&sampler.0) {
            self.retire(Retired::Sampler(vk_sampler));
        }
    }

    fn destroy_bind_group(&mut self, bind_group: BindGroupHandle) {
        if let Some(group) = self.bind_groups.remove(&bind_group.0) {
            self.retire(Retired::DescriptorSet(group.set));
        }
    }

    fn destroy_render_pipeline(&mut self, pipeline: RenderPipelineHandle) {
        if let Some(p) = self.render_pipelines.remove(&pipeline.0) {
            self.retire(Retired::Pipeline(p.pipeline, p.layout));
        }
    }

    fn destroy_occlusion_query(&mut self, query: QueryHandle) {
        self.recorded_queries.retain(|id| *id != query.0);
        if let Some(slot) = self.queries.remove(&query.0) {
            self.retire(Retired::QueryIndex(slot.index));
        }
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        unsafe {
            let _ = self.ctx.device.device_wait_idle();

            for submission in self.in_flight.drain(..) {
                self.ctx.device.destroy_fence(submission.fence, None);
            }
            for fence in self.free_fences.drain(..) {
                self.ctx.device.destroy_fence(fence, None);
            }
            for item in self.retired.drain_all() {
                self.destroy_now(item);
            }

            if let Some(allocator) = self.allocator.as_mut() {
                for (_, buffer) in self.buffers.drain() {
                    self.ctx.device.destroy_buffer(buffer.buffer, None);
                    let _ = allocator.free(buffer.allocation);
                }
                for (_, texture) in self.textures.drain() {
                    self.ctx.device.destroy_image(texture.image, None);
                    let _ = allocator.free(texture.allocation);
                }
            }
            // The allocator must go before the device
            drop(self.allocator.take());

            for (_, view) in self.texture_views.drain() {
                self.ctx.device.destroy_image_view(view.view, None);
            }
            for (_, sampler) in self.samplers.drain() {
                self.ctx.device.destroy_sampler(sampler, None);
            }
            for (_, layout) in self.descriptor_set_layouts.drain() {
                self.ctx.device.destroy_descriptor_set_layout(layout.layout, None);
            }
            for (_, pipeline) in self.render_pipelines.drain() {
                self.ctx.device.destroy_pipeline(pipeline.pipeline, None);
                self.ctx.device.destroy_pipeline_layout(pipeline.layout, None);
            }

            self.ctx.device.destroy_query_pool(self.query_pool, None);
            self.ctx.device.destroy_descriptor_pool(self.descriptor_pool, None);
            self.ctx.device.destroy_command_pool(self.command_pool, None);

            self.ctx.device.destroy_device(None);
            self.ctx.instance.destroy_instance(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> Option<VulkanBackend> {
        match VulkanBackend::new(&RendererConfig::default()) {
            Ok(backend) => Some(backend),
            Err(e) => {
                eprintln!("Vulkan not available ({}), skipping", e);
                None
            }
        }
    }

    fn slot(backend: &VulkanBackend, query: QueryHandle) -> u32 {
        backend.queries[&query.0].index
    }

    #[test]
    fn idle_query_slot_is_reused_at_once() {
        let Some(mut backend) = backend() else {
            return;
        };
        let first = backend.create_occlusion_query().unwrap();
        let index = slot(&backend, first);
        backend.destroy_occlusion_query(first);
        let second = backend.create_occlusion_query().unwrap();
        assert_eq!(slot(&backend, second), index);
    }

    #[test]
    fn query_slot_waits_for_the_open_submission() {
        let Some(mut backend) = backend() else {
            return;
        };
        let first = backend.create_occlusion_query().unwrap();
        let index = slot(&backend, first);
        backend.recording().unwrap();
        backend.destroy_occlusion_query(first);
        assert_eq!(backend.retired_count(), 1);

        let second = backend.create_occlusion_query().unwrap();
        assert_ne!(slot(&backend, second), index);

        let SubmissionStatus::Pending(fence) = backend.submit().unwrap() else {
            panic!("recorded work is submitted behind a fence");
        };
        assert!(backend.wait_fence(fence, Duration::from_secs(5)).unwrap());
        assert_eq!(backend.retired_count(), 0);
        let third = backend.create_occlusion_query().unwrap();
        assert_eq!(slot(&backend, third), index);
    }
}
