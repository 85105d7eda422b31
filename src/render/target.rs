//! Render destinations
//!
//! A [`RenderTexture`] owns (or borrows) the attachments of a destination. A
//! [`RenderTarget`] binds one, carries the per-pass [`RenderState`] and the draw
//! list produced by culling, and walks the Unbound, Bound, Rendering states.

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::error::{RenderError, RenderResult};
use crate::render::cull::RenderDataList;
use crate::render::{DeleteQueue, GpuHandle, RenderState, Renderer, Viewport};
use crate::scene::{Camera, Scene};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

/// A texture plus the view used to attach it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attachment {
    pub texture: TextureHandle,
    pub view: TextureViewHandle,
}

/// Options of an owned render texture
#[derive(Debug, Clone)]
pub struct RenderTextureDescriptor {
    pub label: Option<String>,
    pub width: u32,
    pub height: u32,
    pub sample_count: u32,
    pub color_format: TextureFormat,
    pub depth: bool,
    pub stencil: bool,
}

impl RenderTextureDescriptor {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            label: None,
            width,
            height,
            sample_count: 1,
            color_format: TextureFormat::Rgba8Unorm,
            depth: true,
            stencil: false,
        }
    }

    pub fn with_samples(mut self, sample_count: u32) -> Self {
        self.sample_count = sample_count.max(1);
        self
    }

    pub fn with_stencil(mut self, stencil: bool) -> Self {
        self.stencil = stencil;
        self
    }
}

/// Color (and optional depth) destination of a render pass
#[derive(Debug)]
pub struct RenderTexture {
    width: u32,
    height: u32,
    sample_count: u32,
    color_format: TextureFormat,
    color: Attachment,
    /// Single sample copy of a multisampled color attachment
    resolve: Option<Attachment>,
    depth: Option<Attachment>,
    depth_format: Option<TextureFormat>,
    /// Array layer the views point at, read back by `read_render_result`
    layer: u32,
    background: Option<[f32; 4]>,
    /// Handles released on drop. Empty for textures borrowed from an atlas.
    owned: Vec<GpuHandle>,
    queue: Option<DeleteQueue>,
}

impl RenderTexture {
    /// Create a texture owning its attachments
    pub fn create<B: GraphicsBackend + ?Sized>(
        backend: &mut B,
        queue: &DeleteQueue,
        desc: &RenderTextureDescriptor,
    ) -> RenderResult<Self> {
        let mut owned = Vec::new();
        match Self::create_attachments(backend, desc, &mut owned) {
            Ok((color, resolve, depth, depth_format)) => Ok(Self {
                width: desc.width,
                height: desc.height,
                sample_count: desc.sample_count,
                color_format: desc.color_format,
                color,
                resolve,
                depth,
                depth_format,
                layer: 0,
                background: None,
                owned,
                queue: Some(queue.clone()),
            }),
            Err(e) => {
                for handle in owned.into_iter().rev() {
                    queue.push(handle);
                }
                Err(e)
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn create_attachments<B: GraphicsBackend + ?Sized>(
        backend: &mut B,
        desc: &RenderTextureDescriptor,
        owned: &mut Vec<GpuHandle>,
    ) -> RenderResult<(Attachment, Option<Attachment>, Option<Attachment>, Option<TextureFormat>)> {
        let readable =
            TextureUsage::RENDER_ATTACHMENT | TextureUsage::COPY_SRC | TextureUsage::TEXTURE_BINDING;
        let multisampled = desc.sample_count > 1;

        let color = if multisampled {
            attachment(backend, desc, owned, "msaa", desc.color_format, desc.sample_count, TextureUsage::RENDER_ATTACHMENT)?
        } else {
            attachment(backend, desc, owned, "color", desc.color_format, 1, readable)?
        };
        let resolve = if multisampled {
            Some(attachment(backend, desc, owned, "resolve", desc.color_format, 1, readable)?)
        } else {
            None
        };
        let depth_format = match (desc.depth, desc.stencil) {
            (_, true) => Some(TextureFormat::Depth24PlusStencil8),
            (true, false) => Some(TextureFormat::Depth32Float),
            (false, false) => None,
        };
        let depth = match depth_format {
            Some(format) => Some(attachment(
                backend,
                desc,
                owned,
                "depth",
                format,
                desc.sample_count,
                TextureUsage::RENDER_ATTACHMENT,
            )?),
            None => None,
        };
        Ok((color, resolve, depth, depth_format))
    }

    /// Texture over attachments owned elsewhere, e.g. one layer of the shadow atlas
    pub fn borrowed(
        color: Attachment,
        color_format: TextureFormat,
        depth: Option<(Attachment, TextureFormat)>,
        width: u32,
        height: u32,
        layer: u32,
    ) -> Self {
        Self {
            width,
            height,
            sample_count: 1,
            color_format,
            color,
            resolve: None,
            depth: depth.map(|(a, _)| a),
            depth_format: depth.map(|(_, f)| f),
            layer,
            background: None,
            owned: Vec::new(),
            queue: None,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }

    pub fn color_format(&self) -> TextureFormat {
        self.color_format
    }

    pub fn depth_format(&self) -> Option<TextureFormat> {
        self.depth_format
    }

    pub fn has_stencil(&self) -> bool {
        self.depth_format.map(|f| f.has_stencil()).unwrap_or(false)
    }

    pub fn layer(&self) -> u32 {
        self.layer
    }

    /// View drawn into
    pub fn color_view(&self) -> TextureViewHandle {
        self.color.view
    }

    /// Single sample texture holding the final pixels
    pub fn texture(&self) -> TextureHandle {
        self.resolve.unwrap_or(self.color).texture
    }

    pub fn background_color(&self) -> Option<[f32; 4]> {
        self.background
    }

    pub fn set_background_color(&mut self, color: Option<[f32; 4]>) {
        self.background = color;
    }

    /// Pass over this texture: clear to the background color when there is
    /// one, always clear depth, clear stencil when `clear_stencil`.
    pub fn pass_descriptor(&self, label: &str, clear_stencil: bool) -> RenderPassDescriptor {
        RenderPassDescriptor {
            label: Some(label.to_string()),
            color_attachments: vec![ColorAttachment {
                view: self.color.view,
                resolve_target: self.resolve.map(|r| r.view),
                load_op: match self.background {
                    Some(color) => LoadOp::Clear(color),
                    None => LoadOp::Load,
                },
                store_op: StoreOp::Store,
            }],
            depth_stencil_attachment: self.depth.map(|depth| DepthStencilAttachment {
                view: depth.view,
                depth_load_op: LoadOp::Clear([1.0; 4]),
                depth_store_op: StoreOp::Store,
                depth_clear_value: 1.0,
                stencil_clear_value: (clear_stencil && self.has_stencil()).then_some(0),
            }),
        }
    }

    /// Copy the rendered pixels into `buffer`, which must hold `width * height * 4` bytes
    pub fn read_render_result<B: GraphicsBackend + ?Sized>(
        &self,
        backend: &mut B,
        buffer: &mut [u8],
    ) -> RenderResult<()> {
        let required = self.width as usize * self.height as usize * 4;
        if buffer.len() < required {
            return Err(RenderError::ReadbackBufferTooSmall {
                required,
                provided: buffer.len(),
            });
        }
        backend.read_texture(self.texture(), self.layer, &mut buffer[..required])?;
        Ok(())
    }
}

impl Drop for RenderTexture {
    fn drop(&mut self) {
        if let Some(queue) = &self.queue {
            // views before the textures they point into
            for handle in self.owned.iter().rev() {
                queue.push(*handle);
            }
        }
    }
}

fn attachment<B: GraphicsBackend + ?Sized>(
    backend: &mut B,
    desc: &RenderTextureDescriptor,
    owned: &mut Vec<GpuHandle>,
    suffix: &str,
    format: TextureFormat,
    sample_count: u32,
    usage: TextureUsage,
) -> RenderResult<Attachment> {
    let label = desc.label.as_deref().unwrap_or("render texture");
    let texture = backend.create_texture(&TextureDescriptor {
        label: Some(format!("{} {}", label, suffix)),
        width: desc.width,
        height: desc.height,
        array_layers: 1,
        mip_levels: 1,
        sample_count,
        format,
        usage,
    })?;
    owned.push(GpuHandle::Texture(texture));
    let view = backend.create_texture_view(texture, &TextureViewDescriptor::layer(0))?;
    owned.push(GpuHandle::TextureView(view));
    Ok(Attachment { texture, view })
}

/// Lifecycle of a render target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetPhase {
    Unbound,
    Bound,
    Rendering,
}

impl TargetPhase {
    fn name(&self) -> &'static str {
        match self {
            TargetPhase::Unbound => "unbound",
            TargetPhase::Bound => "bound",
            TargetPhase::Rendering => "rendering",
        }
    }
}

/// A destination plus the state and draw list of rendering into it
#[derive(Debug)]
pub struct RenderTarget {
    texture: Option<RenderTexture>,
    state: RenderState,
    rendering: bool,
    render_data: Arc<Mutex<RenderDataList>>,
    next: Option<Box<RenderTarget>>,
}

impl Default for RenderTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderTarget {
    /// Target without a destination
    pub fn new() -> Self {
        Self {
            texture: None,
            state: RenderState::default(),
            rendering: false,
            render_data: Arc::new(Mutex::new(RenderDataList::default())),
            next: None,
        }
    }

    pub fn with_texture(texture: RenderTexture) -> Self {
        let mut target = Self::new();
        target.texture = Some(texture);
        target
    }

    /// Target for another multiview layer of `source`: renders into `texture`
    /// but shares the draw list, so one cull serves both.
    pub fn multiview_delegate(texture: RenderTexture, source: &RenderTarget) -> Self {
        let mut state = source.state.clone();
        state.is_multiview = true;
        Self {
            texture: Some(texture),
            state,
            rendering: false,
            render_data: source.render_data.clone(),
            next: None,
        }
    }

    pub fn phase(&self) -> TargetPhase {
        match (&self.texture, self.rendering) {
            (None, _) => TargetPhase::Unbound,
            (Some(_), false) => TargetPhase::Bound,
            (Some(_), true) => TargetPhase::Rendering,
        }
    }

    /// Bind a destination. Not allowed while rendering.
    pub fn set_texture(&mut self, texture: RenderTexture) -> RenderResult<()> {
        if self.rendering {
            return Err(RenderError::InvalidTargetState {
                expected: TargetPhase::Bound.name(),
                actual: TargetPhase::Rendering.name(),
            });
        }
        self.texture = Some(texture);
        Ok(())
    }

    pub fn texture(&self) -> Option<&RenderTexture> {
        self.texture.as_ref()
    }

    pub fn texture_mut(&mut self) -> Option<&mut RenderTexture> {
        self.texture.as_mut()
    }

    pub fn state(&self) -> &RenderState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut RenderState {
        &mut self.state
    }

    pub fn set_camera(&mut self, camera: Camera) {
        self.state.render_mask = camera.render_mask;
        self.state.camera = Some(camera);
    }

    /// Draw list filled by culling
    pub fn render_data(&self) -> MutexGuard<'_, RenderDataList> {
        self.render_data.lock()
    }

    pub(crate) fn render_data_handle(&self) -> Arc<Mutex<RenderDataList>> {
        self.render_data.clone()
    }

    /// Both targets read the same draw list
    pub fn shares_render_data(&self, other: &RenderTarget) -> bool {
        Arc::ptr_eq(&self.render_data, &other.render_data)
    }

    /// Append `target` at the end of the chain
    pub fn attach_render_target(&mut self, target: RenderTarget) {
        match &mut self.next {
            Some(next) => next.attach_render_target(target),
            None => self.next = Some(Box::new(target)),
        }
    }

    pub fn next(&self) -> Option<&RenderTarget> {
        self.next.as_deref()
    }

    pub fn next_mut(&mut self) -> Option<&mut RenderTarget> {
        self.next.as_deref_mut()
    }

    /// Targets in the chain, this one included
    pub fn chain_len(&self) -> usize {
        1 + self.next.as_ref().map(|n| n.chain_len()).unwrap_or(0)
    }

    /// Cull `scene` for `camera` into this target's draw list and sort it
    pub fn cull_from_camera(&mut self, scene: &Scene, camera: &Camera, renderer: &mut Renderer) -> RenderResult<usize> {
        self.set_camera(camera.clone());
        let mut list = self.render_data.lock();
        renderer.cull(scene, camera, &mut list)
    }

    /// View the backend draws into
    pub fn frame_buffer_handle(&self) -> Option<TextureViewHandle> {
        self.texture.as_ref().map(|t| t.color_view())
    }

    /// Start a pass over the bound texture
    pub fn begin_rendering(&mut self, renderer: &mut Renderer) -> RenderResult<()> {
        if self.rendering {
            return Err(RenderError::InvalidTargetState {
                expected: TargetPhase::Bound.name(),
                actual: TargetPhase::Rendering.name(),
            });
        }
        let Some(texture) = self.texture.as_mut() else {
            return Err(RenderError::InvalidTargetState {
                expected: TargetPhase::Bound.name(),
                actual: TargetPhase::Unbound.name(),
            });
        };

        let full = Viewport::new(texture.width(), texture.height());
        let viewport = self.state.viewport;
        if viewport.width == 0
            || viewport.height == 0
            || viewport.x + viewport.width > full.width
            || viewport.y + viewport.height > full.height
        {
            self.state.viewport = full;
        }
        self.state.sample_count = texture.sample_count();
        self.state.color_format = texture.color_format();
        self.state.depth_format = texture.depth_format();
        self.state.use_stencil = texture.has_stencil();
        if let Some(color) = self.state.background_color() {
            texture.set_background_color(Some(color));
        }

        let label = if self.state.shadow_pass { "shadow" } else { "camera" };
        let desc = texture.pass_descriptor(label, self.state.use_stencil);
        renderer.backend_mut().begin_render_pass(&desc)?;
        self.rendering = true;
        Ok(())
    }

    /// Close the pass and submit it. On deferred backends the returned fence
    /// signals once the texture is written.
    pub fn end_rendering(&mut self, renderer: &mut Renderer) -> RenderResult<SubmissionStatus> {
        if !self.rendering {
            return Err(RenderError::InvalidTargetState {
                expected: TargetPhase::Rendering.name(),
                actual: self.phase().name(),
            });
        }
        self.rendering = false;
        renderer.backend_mut().end_render_pass()?;
        renderer.submit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DummyBackend;

    fn texture(backend: &mut DummyBackend, queue: &DeleteQueue) -> RenderTexture {
        RenderTexture::create(backend, queue, &RenderTextureDescriptor::new(4, 4)).unwrap()
    }

    #[test]
    fn readback_needs_full_buffer() {
        let mut backend = DummyBackend::new();
        let queue = DeleteQueue::new();
        let mut rt = texture(&mut backend, &queue);
        rt.set_background_color(Some([1.0, 0.0, 0.0, 1.0]));

        let mut small = vec![0u8; 4 * 4 * 4 - 1];
        assert!(matches!(
            rt.read_render_result(&mut backend, &mut small),
            Err(RenderError::ReadbackBufferTooSmall { required: 64, provided: 63 })
        ));

        backend.begin_render_pass(&rt.pass_descriptor("clear", false)).unwrap();
        backend.end_render_pass().unwrap();
        let mut pixels = vec![0u8; 64];
        rt.read_render_result(&mut backend, &mut pixels).unwrap();
        assert_eq!(&pixels[..4], &[255, 0, 0, 255]);
    }

    #[test]
    fn owned_attachments_release_through_queue() {
        let mut backend = DummyBackend::new();
        let queue = DeleteQueue::new();
        let rt = texture(&mut backend, &queue);
        assert_eq!(backend.live_texture_count(), 2);
        drop(rt);
        assert_eq!(queue.process_queues(&mut backend).unwrap(), 4);
        assert_eq!(backend.live_texture_count(), 0);
    }

    #[test]
    fn unbound_target_rejects_state_changes() {
        let target = RenderTarget::new();
        assert_eq!(target.phase(), TargetPhase::Unbound);
        assert!(target.frame_buffer_handle().is_none());
    }

    #[test]
    fn delegates_share_the_draw_list() {
        let mut backend = DummyBackend::new();
        let queue = DeleteQueue::new();
        let source = RenderTarget::with_texture(texture(&mut backend, &queue));
        let left = RenderTarget::multiview_delegate(texture(&mut backend, &queue), &source);
        let right = RenderTarget::multiview_delegate(texture(&mut backend, &queue), &source);
        assert!(left.shares_render_data(&right));
        assert!(left.state().is_multiview);
        assert_eq!(left.phase(), TargetPhase::Bound);
        assert!(!RenderTarget::new().shares_render_data(&left));
    }

    #[test]
    fn chain_appends_at_the_end() {
        let mut first = RenderTarget::new();
        first.attach_render_target(RenderTarget::new());
        first.attach_render_target(RenderTarget::new());
        assert_eq!(first.chain_len(), 3);
        assert!(first.next().and_then(|n| n.next()).is_some());
    }
}
