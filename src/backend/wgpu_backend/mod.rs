//! wgpu backend implementation
//!
//! Headless: every frame renders into textures the renderer owns. Submission
//! is synchronous, `submit` waits for the queue before it returns, so
//! occlusion results are readable right after the frame that issued them.

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::RendererConfig;
use std::collections::HashMap;
use std::sync::mpsc;
use wgpu::util::DeviceExt;

/// Occlusion slots in the single query set
const MAX_OCCLUSION_QUERIES: u32 = 1024;

/// Buffered render pass command
#[derive(Clone)]
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
    EndOcclusionQuery,
}

/// Pending render pass with buffered commands
struct PendingRenderPass {
    descriptor: RenderPassDescriptor,
    commands: Vec<RenderCommand>,
    uses_queries: bool,
}

struct TextureEntry {
    texture: wgpu::Texture,
    desc: TextureDescriptor,
}

struct ViewEntry {
    view: wgpu::TextureView,
    texture: u64,
    format: TextureFormat,
}

struct QuerySlot {
    index: u32,
    result: Option<u64>,
}

/// The query set plus buffers its results are resolved and read back through
struct OcclusionPool {
    set: wgpu::QuerySet,
    resolve: wgpu::Buffer,
    readback: wgpu::Buffer,
    slots: HashMap<u64, QuerySlot>,
    free: Vec<u32>,
    next_index: u32,
    active: Option<u64>,
    /// Queries recorded since the last submit
    in_flight: Vec<u64>,
}

impl OcclusionPool {
    fn new(device: &wgpu::Device) -> Self {
        let size = MAX_OCCLUSION_QUERIES as u64 * 8;
        Self {
            set: device.create_query_set(&wgpu::QuerySetDescriptor {
                label: Some("occlusion queries"),
                ty: wgpu::QueryType::Occlusion,
                count: MAX_OCCLUSION_QUERIES,
            }),
            resolve: device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("occlusion resolve"),
                size,
                usage: wgpu::BufferUsages::QUERY_RESOLVE | wgpu::BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            }),
            readback: device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("occlusion readback"),
                size,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            }),
            slots: HashMap::new(),
            free: Vec::new(),
            next_index: 0,
            active: None,
            in_flight: Vec::new(),
        }
    }

    fn allocate(&mut self) -> Option<u32> {
        if let Some(index) = self.free.pop() {
            return Some(index);
        }
        if self.next_index < MAX_OCCLUSION_QUERIES {
            self.next_index += 1;
            Some(self.next_index - 1)
        } else {
            None
        }
    }
}

/// wgpu backend implementation
pub struct WgpuBackend {
    #[allow(dead_code)]
    instance: wgpu::Instance,
    adapter: wgpu::Adapter,
    device: wgpu::Device,
    queue: wgpu::Queue,
    capabilities: BackendCapabilities,

    // Resource storage
    buffers: HashMap<u64, wgpu::Buffer>,
    textures: HashMap<u64, TextureEntry>,
    texture_views: HashMap<u64, ViewEntry>,
    samplers: HashMap<u64, wgpu::Sampler>,
    bind_group_layouts: HashMap<u64, wgpu::BindGroupLayout>,
    bind_groups: HashMap<u64, wgpu::BindGroup>,
    render_pipelines: HashMap<u64, wgpu::RenderPipeline>,
    occlusion: OcclusionPool,

    // Handle counters
    next_buffer_id: u64,
    next_texture_id: u64,
    next_view_id: u64,
    next_sampler_id: u64,
    next_layout_id: u64,
    next_bind_group_id: u64,
    next_render_pipeline_id: u64,
    next_query_id: u64,

    // Command encoding
    encoder: Option<wgpu::CommandEncoder>,

    // Commands are buffered here and executed on end_render_pass
    pending_render_pass: Option<PendingRenderPass>,
}

impl WgpuBackend {
    fn convert_texture_format(format: TextureFormat) -> wgpu::TextureFormat {
        match format {
            TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
            TextureFormat::Rgba8UnormSrgb => wgpu::TextureFormat::Rgba8UnormSrgb,
            TextureFormat::Bgra8Unorm => wgpu::TextureFormat::Bgra8Unorm,
            TextureFormat::Rgb10a2Unorm => wgpu::TextureFormat::Rgb10a2Unorm,
            TextureFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
            TextureFormat::Depth32Float => wgpu::TextureFormat::Depth32Float,
            TextureFormat::Depth24PlusStencil8 => wgpu::TextureFormat::Depth24PlusStencil8,
        }
    }

    fn convert_buffer_usage(usage: BufferUsage) -> wgpu::BufferUsages {
        let mut result = wgpu::BufferUsages::empty();
        if usage.contains(BufferUsage::MAP_READ) {
            result |= wgpu::BufferUsages::MAP_READ;
        }
        if usage.contains(BufferUsage::COPY_SRC) {
            result |= wgpu::BufferUsages::COPY_SRC;
        }
        if usage.contains(BufferUsage::COPY_DST) {
            result |= wgpu::BufferUsages::COPY_DST;
        }
        if usage.contains(BufferUsage::INDEX) {
            result |= wgpu::BufferUsages::INDEX;
        }
        if usage.contains(BufferUsage::VERTEX) {
            result |= wgpu::BufferUsages::VERTEX;
        }
        if usage.contains(BufferUsage::UNIFORM) {
            result |= wgpu::BufferUsages::UNIFORM;
        }
        result
    }

    fn convert_texture_usage(usage: TextureUsage) -> wgpu::TextureUsages {
        let mut result = wgpu::TextureUsages::empty();
        if usage.contains(TextureUsage::COPY_SRC) {
            result |= wgpu::TextureUsages::COPY_SRC;
        }
        if usage.contains(TextureUsage::COPY_DST) {
            result |= wgpu::TextureUsages::COPY_DST;
        }
        if usage.contains(TextureUsage::TEXTURE_BINDING) {
            result |= wgpu::TextureUsages::TEXTURE_BINDING;
        }
        if usage.contains(TextureUsage::RENDER_ATTACHMENT) {
            result |= wgpu::TextureUsages::RENDER_ATTACHMENT;
        }
        result
    }

    fn convert_filter_mode(mode: FilterMode) -> wgpu::FilterMode {
        match mode {
            FilterMode::Nearest => wgpu::FilterMode::Nearest,
            FilterMode::Linear => wgpu::FilterMode::Linear,
        }
    }

    fn convert_address_mode(mode: AddressMode) -> wgpu::AddressMode {
        match mode {
            AddressMode::ClampToEdge => wgpu::AddressMode::ClampToEdge,
            AddressMode::Repeat => wgpu::AddressMode::Repeat,
            AddressMode::MirrorRepeat => wgpu::AddressMode::MirrorRepeat,
        }
    }

    fn convert_compare_function(func: CompareFunction) -> wgpu::CompareFunction {
        match func {
            CompareFunction::Never => wgpu::CompareFunction::Never,
            CompareFunction::Less => wgpu::CompareFunction::Less,
            CompareFunction::Equal => wgpu::CompareFunction::Equal,
            CompareFunction::LessEqual => wgpu::CompareFunction::LessEqual,
            CompareFunction::Greater => wgpu::CompareFunction::Greater,
            CompareFunction::NotEqual => wgpu::CompareFunction::NotEqual,
            CompareFunction::GreaterEqual => wgpu::CompareFunction::GreaterEqual,
            CompareFunction::Always => wgpu::CompareFunction::Always,
        }
    }

    fn convert_stencil_operation(op: StencilOperation) -> wgpu::StencilOperation {
        match op {
            StencilOperation::Keep => wgpu::StencilOperation::Keep,
            StencilOperation::Zero => wgpu::StencilOperation::Zero,
            StencilOperation::Replace => wgpu::StencilOperation::Replace,
            StencilOperation::Invert => wgpu::StencilOperation::Invert,
            StencilOperation::IncrementClamp => wgpu::StencilOperation::IncrementClamp,
            StencilOperation::DecrementClamp => wgpu::StencilOperation::DecrementClamp,
        }
    }

    fn convert_vertex_format(format: VertexFormat) -> wgpu::VertexFormat {
        match format {
            VertexFormat::Float32 => wgpu::VertexFormat::Float32,
            VertexFormat::Float32x2 => wgpu::VertexFormat::Float32x2,
            VertexFormat::Float32x3 => wgpu::VertexFormat::Float32x3,
            VertexFormat::Float32x4 => wgpu::VertexFormat::Float32x4,
        }
    }

    fn convert_topology(topology: PrimitiveTopology) -> wgpu::PrimitiveTopology {
        match topology {
            PrimitiveTopology::PointList => wgpu::PrimitiveTopology::PointList,
            PrimitiveTopology::LineList => wgpu::PrimitiveTopology::LineList,
            PrimitiveTopology::LineStrip => wgpu::PrimitiveTopology::LineStrip,
            PrimitiveTopology::TriangleList => wgpu::PrimitiveTopology::TriangleList,
            PrimitiveTopology::TriangleStrip => wgpu::PrimitiveTopology::TriangleStrip,
        }
    }

    fn convert_blend_factor(factor: BlendFactor) -> wgpu::BlendFactor {
        match factor {
            BlendFactor::Zero => wgpu::BlendFactor::Zero,
            BlendFactor::One => wgpu::BlendFactor::One,
            BlendFactor::Src => wgpu::BlendFactor::Src,
            BlendFactor::OneMinusSrc => wgpu::BlendFactor::OneMinusSrc,
            BlendFactor::SrcAlpha => wgpu::BlendFactor::SrcAlpha,
            BlendFactor::OneMinusSrcAlpha => wgpu::BlendFactor::OneMinusSrcAlpha,
            BlendFactor::Dst => wgpu::BlendFactor::Dst,
            BlendFactor::OneMinusDst => wgpu::BlendFactor::OneMinusDst,
            BlendFactor::DstAlpha => wgpu::BlendFactor::DstAlpha,
            BlendFactor::OneMinusDstAlpha => wgpu::BlendFactor::OneMinusDstAlpha,
        }
    }

    fn convert_blend_operation(op: BlendOperation) -> wgpu::BlendOperation {
        match op {
            BlendOperation::Add => wgpu::BlendOperation::Add,
            BlendOperation::Subtract => wgpu::BlendOperation::Subtract,
            BlendOperation::ReverseSubtract => wgpu::BlendOperation::ReverseSubtract,
            BlendOperation::Min => wgpu::BlendOperation::Min,
            BlendOperation::Max => wgpu::BlendOperation::Max,
        }
    }

    fn convert_blend_component(component: BlendComponent) -> wgpu::BlendComponent {
        wgpu::BlendComponent {
            src_factor: Self::convert_blend_factor(component.src_factor),
            dst_factor: Self::convert_blend_factor(component.dst_factor),
            operation: Self::convert_blend_operation(component.operation),
        }
    }

    fn convert_view_dimension(dimension: TextureViewDimension) -> wgpu::TextureViewDimension {
        match dimension {
            TextureViewDimension::D2 => wgpu::TextureViewDimension::D2,
            TextureViewDimension::D2Array => wgpu::TextureViewDimension::D2Array,
        }
    }

    fn convert_shader_stages(stages: ShaderStageFlags) -> wgpu::ShaderStages {
        let mut result = wgpu::ShaderStages::empty();
        if stages.contains(ShaderStageFlags::VERTEX) {
            result |= wgpu::ShaderStages::VERTEX;
        }
        if stages.contains(ShaderStageFlags::FRAGMENT) {
            result |= wgpu::ShaderStages::FRAGMENT;
        }
        result
    }

    fn convert_load_op<T>(op: &LoadOp, clear: impl FnOnce([f32; 4]) -> T) -> wgpu::LoadOp<T> {
        match op {
            LoadOp::Clear(color) => wgpu::LoadOp::Clear(clear(*color)),
            LoadOp::Load => wgpu::LoadOp::Load,
        }
    }

    fn convert_store_op(op: StoreOp) -> wgpu::StoreOp {
        match op {
            StoreOp::Store => wgpu::StoreOp::Store,
            StoreOp::Discard => wgpu::StoreOp::Discard,
        }
    }

    fn convert_index_format(format: IndexFormat) -> wgpu::IndexFormat {
        match format {
            IndexFormat::Uint16 => wgpu::IndexFormat::Uint16,
            IndexFormat::Uint32 => wgpu::IndexFormat::Uint32,
        }
    }
}

impl WgpuBackend {
    /// Create a headless wgpu backend
    pub fn new(config: &RendererConfig) -> BackendResult<Self> {
        pollster::block_on(Self::new_async(config))
    }

    pub async fn new_async(config: &RendererConfig) -> BackendResult<Self> {
        let backends = wgpu::util::backend_bits_from_env().unwrap_or(wgpu::Backends::PRIMARY);
        let flags = if config.validation {
            wgpu::InstanceFlags::debugging()
        } else {
            wgpu::InstanceFlags::empty()
        };
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends,
            flags,
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| BackendError::InitializationFailed("No suitable GPU adapter found".into()))?;

        let info = adapter.get_info();
        log::info!("wgpu adapter: {} ({:?})", info.name, info.backend);

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("vr-render-core device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::downlevel_defaults().using_resolution(adapter.limits()),
                },
                None,
            )
            .await
            .map_err(|e| BackendError::DeviceCreationFailed(e.to_string()))?;

        // Validation errors outside an error scope are logged instead of aborting
        device.on_uncaptured_error(Box::new(|error| {
            log::error!("wgpu: {}", error);
        }));

        let limits = device.limits();
        let capabilities = BackendCapabilities {
            occlusion_queries: true,
            deferred_submission: false,
            multiview: false,
            min_uniform_offset_alignment: limits.min_uniform_buffer_offset_alignment,
            max_texture_array_layers: limits.max_texture_array_layers,
        };
        let occlusion = OcclusionPool::new(&device);

        Ok(Self {
            instance,
            adapter,
            device,
            queue,
            capabilities,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            texture_views: HashMap::new(),
            samplers: HashMap::new(),
            bind_group_layouts: HashMap::new(),
            bind_groups: HashMap::new(),
            render_pipelines: HashMap::new(),
            occlusion,
            next_buffer_id: 1,
            next_texture_id: 1,
            next_view_id: 1,
            next_sampler_id: 1,
            next_layout_id: 1,
            next_bind_group_id: 1,
            next_render_pipeline_id: 1,
            next_query_id: 1,
            encoder: None,
            pending_render_pass: None,
        })
    }

    pub fn adapter_info(&self) -> wgpu::AdapterInfo {
        self.adapter.get_info()
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    fn take_encoder(&mut self) -> wgpu::CommandEncoder {
        match self.encoder.take() {
            Some(encoder) => encoder,
            None => self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("frame encoder"),
            }),
        }
    }

    fn record(&mut self, command: RenderCommand) {
        match self.pending_render_pass.as_mut() {
            Some(pass) => pass.commands.push(command),
            None => log::warn!("WgpuBackend: render command outside of a render pass"),
        }
    }

    fn view_entry(&self, view: TextureViewHandle) -> BackendResult<&ViewEntry> {
        self.texture_views.get(&view.0).ok_or(BackendError::InvalidHandle {
            kind: "texture view",
            id: view.0,
        })
    }

    fn view_size(&self, view: TextureViewHandle) -> BackendResult<(u32, u32)> {
        let entry = self.view_entry(view)?;
        let texture = self.textures.get(&entry.texture).ok_or_else(|| {
            BackendError::FramebufferIncomplete(format!("view {} outlived its texture", view.0))
        })?;
        Ok((texture.desc.width, texture.desc.height))
    }

    /// Map `buffer` and copy its first `size` bytes out, blocking on the device
    fn map_read(&self, buffer: &wgpu::Buffer, size: u64) -> BackendResult<Vec<u8>> {
        let slice = buffer.slice(..size);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = self.device.poll(wgpu::Maintain::Wait);
        match rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(BackendError::ReadbackFailed(e.to_string())),
            Err(_) => return Err(BackendError::DeviceLost),
        }
        let data = slice.get_mapped_range().to_vec();
        buffer.unmap();
        Ok(data)
    }

    /// Resolve queries recorded since the last submit and store their sample counts
    fn read_occlusion_results(&mut self) -> BackendResult<()> {
        if self.occlusion.in_flight.is_empty() {
            return Ok(());
        }
        let used = self.occlusion.next_index;
        let size = used as u64 * 8;
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("occlusion resolve"),
        });
        encoder.resolve_query_set(&self.occlusion.set, 0..used, &self.occlusion.resolve, 0);
        encoder.copy_buffer_to_buffer(&self.occlusion.resolve, 0, &self.occlusion.readback, 0, size);
        self.queue.submit(Some(encoder.finish()));

        let data = self.map_read(&self.occlusion.readback, size)?;
        for id in std::mem::take(&mut self.occlusion.in_flight) {
            let Some(slot) = self.occlusion.slots.get_mut(&id) else {
                continue;
            };
            let at = slot.index as usize * 8;
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&data[at..at + 8]);
            slot.result = Some(u64::from_le_bytes(bytes));
        }
        Ok(())
    }
}

impl GraphicsBackend for WgpuBackend {
    fn name(&self) -> &'static str {
        "wgpu Backend"
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.capabilities
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: desc.label.as_deref(),
            size: desc.size,
            usage: Self::convert_buffer_usage(desc.usage),
            mapped_at_creation: false,
        });

        let id = self.next_buffer_id;
        self.next_buffer_id += 1;
        self.buffers.insert(id, buffer);
        Ok(BufferHandle(id))
    }

    fn create_buffer_init(&mut self, desc: &BufferDescriptor, data: &[u8]) -> BackendResult<BufferHandle> {
        if (data.len() as u64) > desc.size {
            return Err(BackendError::BufferCreationFailed(format!(
                "initial data of {} bytes exceeds buffer size {}",
                data.len(),
                desc.size
            )));
        }
        // Pad to the requested size and to the 4 byte copy alignment
        let mut contents = data.to_vec();
        let padded = wgpu::util::align_to(desc.size, wgpu::COPY_BUFFER_ALIGNMENT) as usize;
        contents.resize(padded, 0);

        let buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: desc.label.as_deref(),
            contents: &contents,
            usage: Self::convert_buffer_usage(desc.usage),
        });

        let id = self.next_buffer_id;
        self.next_buffer_id += 1;
        self.buffers.insert(id, buffer);
        Ok(BufferHandle(id))
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> BackendResult<()> {
        let buf = self.buffers.get(&buffer.0).ok_or(BackendError::InvalidHandle {
            kind: "buffer",
            id: buffer.0,
        })?;
        if offset + data.len() as u64 > buf.size() {
            return Err(BackendError::BufferCreationFailed(format!(
                "write of {} bytes at {} overflows buffer of {}",
                data.len(),
                offset,
                buf.size()
            )));
        }
        if data.len() as u64 % wgpu::COPY_BUFFER_ALIGNMENT == 0 {
            self.queue.write_buffer(buf, offset, data);
        } else {
            let mut padded = data.to_vec();
            padded.resize(wgpu::util::align_to(data.len(), wgpu::COPY_BUFFER_ALIGNMENT as usize), 0);
            self.queue.write_buffer(buf, offset, &padded);
        }
        Ok(())
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        if desc.array_layers > self.capabilities.max_texture_array_layers {
            return Err(BackendError::TextureCreationFailed(format!(
                "{} layers exceeds the limit of {}",
                desc.array_layers, self.capabilities.max_texture_array_layers
            )));
        }
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: desc.label.as_deref(),
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: desc.array_layers.max(1),
            },
            mip_level_count: desc.mip_levels.max(1),
            sample_count: desc.sample_count.max(1),
            dimension: wgpu::TextureDimension::D2,
            format: Self::convert_texture_format(desc.format),
            usage: Self::convert_texture_usage(desc.usage),
            view_formats: &[],
        });

        let id = self.next_texture_id;
        self.next_texture_id += 1;
        self.textures.insert(
            id,
            TextureEntry {
                texture,
                desc: desc.clone(),
            },
        );
        Ok(TextureHandle(id))
    }

    fn create_texture_view(
        &mut self,
        texture: TextureHandle,
        desc: &TextureViewDescriptor,
    ) -> BackendResult<TextureViewHandle> {
        let entry = self.textures.get(&texture.0).ok_or(BackendError::InvalidHandle {
            kind: "texture",
            id: texture.0,
        })?;
        if desc.base_array_layer + desc.array_layer_count > entry.desc.array_layers {
            return Err(BackendError::TextureCreationFailed(format!(
                "view layers {}..{} out of range for {} layers",
                desc.base_array_layer,
                desc.base_array_layer + desc.array_layer_count,
                entry.desc.array_layers
            )));
        }

        let view = entry.texture.create_view(&wgpu::TextureViewDescriptor {
            label: None,
            format: None,
            dimension: Some(Self::convert_view_dimension(desc.dimension)),
            aspect: wgpu::TextureAspect::All,
            base_mip_level: 0,
            mip_level_count: None,
            base_array_layer: desc.base_array_layer,
            array_layer_count: Some(desc.array_layer_count),
        });
        let format = entry.desc.format;

        let id = self.next_view_id;
        self.next_view_id += 1;
        self.texture_views.insert(
            id,
            ViewEntry {
                view,
                texture: texture.0,
                format,
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
        let entry = self.textures.get(&texture.0).ok_or(BackendError::InvalidHandle {
            kind: "texture",
            id: texture.0,
        })?;
        let bytes_per_row = width * entry.desc.format.bytes_per_pixel();
        let expected = (bytes_per_row * height) as usize;
        if data.len() < expected || layer >= entry.desc.array_layers {
            return Err(BackendError::TextureCreationFailed(format!(
                "texture upload of {} bytes to layer {}, expected {} bytes",
                data.len(),
                layer,
                expected
            )));
        }

        self.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: &entry.texture,
                mip_level: 0,
                origin: wgpu::Origin3d { x: 0, y: 0, z: layer },
                aspect: wgpu::TextureAspect::All,
            },
            &data[..expected],
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(bytes_per_row),
                rows_per_image: Some(height),
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    fn read_texture(&mut self, texture: TextureHandle, layer: u32, out: &mut [u8]) -> BackendResult<()> {
        if self.pending_render_pass.is_some() {
            return Err(BackendError::ReadbackFailed("render pass still open".into()));
        }
        let entry = self.textures.get(&texture.0).ok_or(BackendError::InvalidHandle {
            kind: "texture",
            id: texture.0,
        })?;
        let desc = &entry.desc;
        if desc.format.is_depth() || desc.sample_count > 1 {
            return Err(BackendError::ReadbackFailed(format!(
                "cannot copy from {:?} x{} texture",
                desc.format, desc.sample_count
            )));
        }
        if layer >= desc.array_layers {
            return Err(BackendError::ReadbackFailed(format!("no layer {}", layer)));
        }
        let row = desc.width * desc.format.bytes_per_pixel();
        let needed = (row * desc.height) as usize;
        if out.len() < needed {
            return Err(BackendError::ReadbackFailed(format!(
                "destination holds {} bytes, need {}",
                out.len(),
                needed
            )));
        }

        // Rows of a texture to buffer copy are padded to 256 bytes
        let padded_row = wgpu::util::align_to(row, wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);
        let size = padded_row as u64 * desc.height as u64;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        // Whatever is recorded goes first so the copy sees it
        let mut encoder = self.encoder.take().unwrap_or_else(|| {
            self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("readback encoder"),
            })
        });
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture: &entry.texture,
                mip_level: 0,
                origin: wgpu::Origin3d { x: 0, y: 0, z: layer },
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &staging,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row),
                    rows_per_image: Some(desc.height),
                },
            },
            wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(Some(encoder.finish()));

        let data = self.map_read(&staging, size)?;
        for (dst, src) in out[..needed]
            .chunks_exact_mut(row as usize)
            .zip(data.chunks_exact(padded_row as usize))
        {
            dst.copy_from_slice(&src[..row as usize]);
        }
        Ok(())
    }

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle> {
        let sampler = self.device.create_sampler(&wgpu::SamplerDescriptor {
            label: desc.label.as_deref(),
            address_mode_u: Self::convert_address_mode(desc.address_mode_u),
            address_mode_v: Self::convert_address_mode(desc.address_mode_v),
            address_mode_w: Self::convert_address_mode(desc.address_mode_w),
            mag_filter: Self::convert_filter_mode(desc.mag_filter),
            min_filter: Self::convert_filter_mode(desc.min_filter),
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let id = self.next_sampler_id;
        self.next_sampler_id += 1;
        self.samplers.insert(id, sampler);
        Ok(SamplerHandle(id))
    }

    fn create_bind_group_layout(
        &mut self,
        entries: &[BindGroupLayoutEntry],
    ) -> BackendResult<BindGroupLayoutHandle> {
        let wgpu_entries: Vec<wgpu::BindGroupLayoutEntry> = entries
            .iter()
            .map(|entry| wgpu::BindGroupLayoutEntry {
                binding: entry.binding,
                visibility: Self::convert_shader_stages(entry.visibility),
                ty: match &entry.ty {
                    BindingType::UniformBuffer { dynamic_offset } => wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: *dynamic_offset,
                        min_binding_size: None,
                    },
                    BindingType::Texture { view_dimension } => wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: Self::convert_view_dimension(*view_dimension),
                        multisampled: false,
                    },
                    BindingType::Sampler => wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                },
                count: None,
            })
            .collect();

        let layout = self.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: None,
            entries: &wgpu_entries,
        });

        let id = self.next_layout_id;
        self.next_layout_id += 1;
        self.bind_group_layouts.insert(id, layout);
        Ok(BindGroupLayoutHandle(id))
    }

    fn create_bind_group(
        &mut self,
        layout: BindGroupLayoutHandle,
        entries: &[(u32, BindGroupEntry)],
    ) -> BackendResult<BindGroupHandle> {
        let wgpu_layout = self.bind_group_layouts.get(&layout.0).ok_or(BackendError::InvalidHandle {
            kind: "bind group layout",
            id: layout.0,
        })?;

        let mut wgpu_entries = Vec::with_capacity(entries.len());
        for (binding, entry) in entries {
            let resource = match entry {
                BindGroupEntry::Buffer { buffer, offset, size } => {
                    let buf = self.buffers.get(&buffer.0).ok_or(BackendError::InvalidHandle {
                        kind: "buffer",
                        id: buffer.0,
                    })?;
                    wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer: buf,
                        offset: *offset,
                        size: size.and_then(wgpu::BufferSize::new),
                    })
                }
                BindGroupEntry::Texture(view) => {
                    wgpu::BindingResource::TextureView(&self.view_entry(*view)?.view)
                }
                BindGroupEntry::Sampler(sampler) => {
                    let s = self.samplers.get(&sampler.0).ok_or(BackendError::InvalidHandle {
                        kind: "sampler",
                        id: sampler.0,
                    })?;
                    wgpu::BindingResource::Sampler(s)
                }
            };
            wgpu_entries.push(wgpu::BindGroupEntry {
                binding: *binding,
                resource,
            });
        }

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: None,
            layout: wgpu_layout,
            entries: &wgpu_entries,
        });

        let id = self.next_bind_group_id;
        self.next_bind_group_id += 1;
        self.bind_groups.insert(id, bind_group);
        Ok(BindGroupHandle(id))
    }

    fn create_render_pipeline(
        &mut self,
        desc: &RenderPipelineDescriptor,
    ) -> BackendResult<RenderPipelineHandle> {
        let mut layouts = Vec::with_capacity(desc.bind_group_layouts.len());
        for handle in &desc.bind_group_layouts {
            layouts.push(self.bind_group_layouts.get(&handle.0).ok_or(BackendError::InvalidHandle {
                kind: "bind group layout",
                id: handle.0,
            })?);
        }

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);

        let shader = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: desc.label.as_deref(),
            source: wgpu::ShaderSource::Wgsl(desc.shader.as_str().into()),
        });

        let pipeline_layout = self.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: desc.label.as_deref(),
            bind_group_layouts: &layouts,
            push_constant_ranges: &[],
        });

        let attributes: Vec<Vec<wgpu::VertexAttribute>> = desc
            .vertex_layouts
            .iter()
            .map(|layout| {
                layout
                    .attributes
                    .iter()
                    .map(|attr| wgpu::VertexAttribute {
                        format: Self::convert_vertex_format(attr.format),
                        offset: attr.offset,
                        shader_location: attr.location,
                    })
                    .collect()
            })
            .collect();
        let vertex_buffers: Vec<wgpu::VertexBufferLayout> = desc
            .vertex_layouts
            .iter()
            .zip(&attributes)
            .map(|(layout, attrs)| wgpu::VertexBufferLayout {
                array_stride: layout.array_stride,
                step_mode: wgpu::VertexStepMode::Vertex,
                attributes: attrs,
            })
            .collect();

        let color_targets: Vec<Option<wgpu::ColorTargetState>> = desc
            .color_targets
            .iter()
            .map(|target| {
                Some(wgpu::ColorTargetState {
                    format: Self::convert_texture_format(target.format),
                    blend: target.blend.map(|b| wgpu::BlendState {
                        color: Self::convert_blend_component(b.color),
                        alpha: Self::convert_blend_component(b.alpha),
                    }),
                    write_mask: wgpu::ColorWrites::from_bits_truncate(target.write_mask.bits()),
                })
            })
            .collect();

        let depth_stencil = desc.depth_stencil.as_ref().map(|ds| {
            let stencil = match ds.stencil {
                Some(face) => {
                    let state = wgpu::StencilFaceState {
                        compare: Self::convert_compare_function(face.compare),
                        fail_op: Self::convert_stencil_operation(face.fail_op),
                        depth_fail_op: Self::convert_stencil_operation(face.depth_fail_op),
                        pass_op: Self::convert_stencil_operation(face.pass_op),
                    };
                    wgpu::StencilState {
                        front: state,
                        back: state,
                        read_mask: face.read_mask,
                        write_mask: face.write_mask,
                    }
                }
                None => wgpu::StencilState::default(),
            };
            wgpu::DepthStencilState {
                format: Self::convert_texture_format(ds.format),
                depth_write_enabled: ds.depth_write_enabled,
                depth_compare: Self::convert_compare_function(ds.depth_compare),
                stencil,
                bias: wgpu::DepthBiasState {
                    constant: ds.bias.constant,
                    slope_scale: ds.bias.slope_scale,
                    clamp: 0.0,
                },
            }
        });

        let strip_index_format = match desc.primitive_topology {
            PrimitiveTopology::LineStrip | PrimitiveTopology::TriangleStrip => Some(wgpu::IndexFormat::Uint32),
            _ => None,
        };

        let pipeline = self.device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: desc.label.as_deref(),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: "vs_main",
                buffers: &vertex_buffers,
                compilation_options: Default::default(),
            },
            fragment: if color_targets.is_empty() {
                None
            } else {
                Some(wgpu::FragmentState {
                    module: &shader,
                    entry_point: "fs_main",
                    targets: &color_targets,
                    compilation_options: Default::default(),
                })
            },
            primitive: wgpu::PrimitiveState {
                topology: Self::convert_topology(desc.primitive_topology),
                strip_index_format,
                front_face: match desc.front_face {
                    FrontFace::Ccw => wgpu::FrontFace::Ccw,
                    FrontFace::Cw => wgpu::FrontFace::Cw,
                },
                cull_mode: match desc.cull_mode {
                    CullMode::None => None,
                    CullMode::Front => Some(wgpu::Face::Front),
                    CullMode::Back => Some(wgpu::Face::Back),
                },
                ..Default::default()
            },
            depth_stencil,
            multisample: wgpu::MultisampleState {
                count: desc.sample_count.max(1),
                mask: !0,
                alpha_to_coverage_enabled: desc.alpha_to_coverage,
            },
            multiview: None,
        });

        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(BackendError::PipelineCreationFailed(format!(
                "{}: {}",
                desc.label.as_deref().unwrap_or("pipeline"),
                error
            )));
        }

        let id = self.next_render_pipeline_id;
        self.next_render_pipeline_id += 1;
        self.render_pipelines.insert(id, pipeline);
        Ok(RenderPipelineHandle(id))
    }

    fn create_occlusion_query(&mut self) -> BackendResult<QueryHandle> {
        let index = self.occlusion.allocate().ok_or_else(|| {
            BackendError::QueryFailed(format!("all {} occlusion slots in use", MAX_OCCLUSION_QUERIES))
        })?;
        let id = self.next_query_id;
        self.next_query_id += 1;
        self.occlusion.slots.insert(id, QuerySlot { index, result: None });
        Ok(QueryHandle(id))
    }

    fn begin_occlusion_query(&mut self, query: QueryHandle) {
        let Some(slot) = self.occlusion.slots.get_mut(&query.0) else {
            log::warn!("WgpuBackend: unknown occlusion query {}", query.0);
            return;
        };
        slot.result = None;
        let index = slot.index;
        self.occlusion.active = Some(query.0);
        if let Some(pass) = self.pending_render_pass.as_mut() {
            pass.uses_queries = true;
        }
        self.record(RenderCommand::BeginOcclusionQuery(index));
    }

    fn end_occlusion_query(&mut self) {
        if let Some(id) = self.occlusion.active.take() {
            self.occlusion.in_flight.push(id);
            self.record(RenderCommand::EndOcclusionQuery);
        }
    }

    fn poll_occlusion_query(&mut self, query: QueryHandle) -> Option<u64> {
        self.occlusion.slots.get(&query.0).and_then(|slot| slot.result)
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
            if !self.view_entry(depth.view)?.format.is_depth() {
                return Err(BackendError::FramebufferIncomplete("depth attachment has a color format".into()));
            }
        }
        if size.is_none() {
            return Err(BackendError::FramebufferIncomplete("no attachments".into()));
        }

        self.pending_render_pass = Some(PendingRenderPass {
            descriptor: desc.clone(),
            commands: Vec::new(),
            uses_queries: false,
        });
        Ok(())
    }

    fn end_render_pass(&mut self) -> BackendResult<()> {
        let Some(pending) = self.pending_render_pass.take() else {
            return Ok(());
        };
        let mut encoder = self.take_encoder();

        let mut color_attachments = Vec::with_capacity(pending.descriptor.color_attachments.len());
        for att in &pending.descriptor.color_attachments {
            let resolve_target = match att.resolve_target {
                Some(view) => Some(&self.view_entry(view)?.view),
                None => None,
            };
            color_attachments.push(Some(wgpu::RenderPassColorAttachment {
                view: &self.view_entry(att.view)?.view,
                resolve_target,
                ops: wgpu::Operations {
                    load: Self::convert_load_op(&att.load_op, |c| wgpu::Color {
                        r: c[0] as f64,
                        g: c[1] as f64,
                        b: c[2] as f64,
                        a: c[3] as f64,
                    }),
                    store: Self::convert_store_op(att.store_op),
                },
            }));
        }

        let depth_attachment = match &pending.descriptor.depth_stencil_attachment {
            Some(att) => {
                let entry = self.view_entry(att.view)?;
                let stencil_ops = if entry.format.has_stencil() {
                    Some(wgpu::Operations {
                        load: match att.stencil_clear_value {
                            Some(value) => wgpu::LoadOp::Clear(value),
                            None => wgpu::LoadOp::Load,
                        },
                        store: wgpu::StoreOp::Store,
                    })
                } else {
                    None
                };
                Some(wgpu::RenderPassDepthStencilAttachment {
                    view: &entry.view,
                    depth_ops: Some(wgpu::Operations {
                        load: Self::convert_load_op(&att.depth_load_op, |_| att.depth_clear_value),
                        store: Self::convert_store_op(att.depth_store_op),
                    }),
                    stencil_ops,
                })
            }
            None => None,
        };

        {
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: pending.descriptor.label.as_deref(),
                color_attachments: &color_attachments,
                depth_stencil_attachment: depth_attachment,
                timestamp_writes: None,
                occlusion_query_set: pending.uses_queries.then_some(&self.occlusion.set),
            });

            for cmd in &pending.commands {
                match cmd {
                    RenderCommand::SetPipeline(handle) => {
                        if let Some(pipeline) = self.render_pipelines.get(&handle.0) {
                            render_pass.set_pipeline(pipeline);
                        }
                    }
                    RenderCommand::SetBindGroup { index, bind_group, offsets } => {
                        if let Some(bg) = self.bind_groups.get(&bind_group.0) {
                            render_pass.set_bind_group(*index, bg, offsets);
                        }
                    }
                    RenderCommand::SetVertexBuffer { slot, buffer, offset } => {
                        if let Some(buf) = self.buffers.get(&buffer.0) {
                            render_pass.set_vertex_buffer(*slot, buf.slice(*offset..));
                        }
                    }
                    RenderCommand::SetIndexBuffer { buffer, offset, format } => {
                        if let Some(buf) = self.buffers.get(&buffer.0) {
                            render_pass.set_index_buffer(buf.slice(*offset..), Self::convert_index_format(*format));
                        }
                    }
                    RenderCommand::SetViewport { x, y, width, height, min_depth, max_depth } => {
                        render_pass.set_viewport(*x, *y, *width, *height, *min_depth, *max_depth);
                    }
                    RenderCommand::SetScissorRect { x, y, width, height } => {
                        render_pass.set_scissor_rect(*x, *y, *width, *height);
                    }
                    RenderCommand::SetStencilReference(reference) => {
                        render_pass.set_stencil_reference(*reference);
                    }
                    RenderCommand::Draw { vertices, instances } => {
                        render_pass.draw(vertices.clone(), instances.clone());
                    }
                    RenderCommand::DrawIndexed { indices, base_vertex, instances } => {
                        render_pass.draw_indexed(indices.clone(), *base_vertex, instances.clone());
                    }
                    RenderCommand::BeginOcclusionQuery(index) => {
                        render_pass.begin_occlusion_query(*index);
                    }
                    RenderCommand::EndOcclusionQuery => {
                        render_pass.end_occlusion_query();
                    }
                }
            }
        }

        self.encoder = Some(encoder);
        Ok(())
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
        let encoder = self.take_encoder();
        self.queue.submit(Some(encoder.finish()));
        let _ = self.device.poll(wgpu::Maintain::Wait);
        self.read_occlusion_results()?;
        Ok(SubmissionStatus::Complete)
    }

    fn is_fence_signaled(&mut self, _fence: FenceHandle) -> bool {
        true
    }

    fn wait_fence(&mut self, _fence: FenceHandle, _timeout: std::time::Duration) -> BackendResult<bool> {
        Ok(true)
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if let Some(buf) = self.buffers.remove(&buffer.0) {
            buf.destroy();
        }
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        if let Some(entry) = self.textures.remove(&texture.0) {
            entry.texture.destroy();
        }
    }

    fn destroy_texture_view(&mut self, view: TextureViewHandle) {
        self.texture_views.remove(&view.0);
    }

    fn destroy_sampler(&mut self, sampler: SamplerHandle) {
        self.samplers.remove(&sampler.0);
    }

    fn destroy_bind_group(&mut self, bind_group: BindGroupHandle) {
        self.bind_groups.remove(&bind_group.0);
    }

    fn destroy_render_pipeline(&mut self, pipeline: RenderPipelineHandle) {
        self.render_pipelines.remove(&pipeline.0);
    }

    fn destroy_occlusion_query(&mut self, query: QueryHandle) {
        if let Some(slot) = self.occlusion.slots.remove(&query.0) {
            self.occlusion.free.push(slot.index);
        }
        self.occlusion.in_flight.retain(|id| *id != query.0);
    }
}
