//! Shadow maps
//!
//! Every shadow casting light renders into one layer of a shared texture array,
//! the [`ShadowAtlas`]. A [`ShadowMap`] is a render target over one layer plus
//! the material every caster is drawn with.

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::error::RenderResult;
use crate::light::Light;
use crate::render::cull::ViewParams;
use crate::render::target::Attachment;
use crate::render::{DeleteQueue, GpuHandle, RenderState, RenderTarget, RenderTexture, Viewport};
use crate::resources::SharedMaterial;
use crate::scene::Projection;
use glam::{Mat4, Vec3};
use parking_lot::Mutex;
use std::sync::Arc;

/// Shadow maps are shared between the light that owns them and the render thread
pub type SharedShadowMap = Arc<Mutex<ShadowMap>>;

/// Color format of the atlas. Depth is packed into the three 10 bit channels.
pub const SHADOW_FORMAT: TextureFormat = TextureFormat::Rgb10a2Unorm;

/// Layered texture holding every shadow map of a frame
#[derive(Debug)]
pub struct ShadowAtlas {
    color: TextureHandle,
    array_view: TextureViewHandle,
    layer_views: Vec<TextureViewHandle>,
    depth: Attachment,
    sampler: SamplerHandle,
    size: u32,
    queue: DeleteQueue,
}

impl ShadowAtlas {
    /// Allocate `layers` square layers of `size` pixels plus one shared depth buffer
    pub fn create<B: GraphicsBackend + ?Sized>(
        backend: &mut B,
        queue: &DeleteQueue,
        size: u32,
        layers: u32,
    ) -> RenderResult<Self> {
        let layers = layers.clamp(1, backend.capabilities().max_texture_array_layers.max(1));
        log::debug!("Creating shadow atlas: {} layers of {}x{}", layers, size, size);

        let mut owned = Vec::new();
        let result = Self::create_handles(backend, size, layers, &mut owned);
        match result {
            Ok((color, array_view, layer_views, depth, sampler)) => Ok(Self {
                color,
                array_view,
                layer_views,
                depth,
                sampler,
                size,
                queue: queue.clone(),
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
    fn create_handles<B: GraphicsBackend + ?Sized>(
        backend: &mut B,
        size: u32,
        layers: u32,
        owned: &mut Vec<GpuHandle>,
    ) -> RenderResult<(TextureHandle, TextureViewHandle, Vec<TextureViewHandle>, Attachment, SamplerHandle)> {
        let color = backend.create_texture(&TextureDescriptor {
            label: Some("shadow atlas".into()),
            width: size,
            height: size,
            array_layers: layers,
            mip_levels: 1,
            sample_count: 1,
            format: SHADOW_FORMAT,
            usage: TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_SRC,
        })?;
        owned.push(GpuHandle::Texture(color));

        let array_view = backend.create_texture_view(color, &TextureViewDescriptor::array(layers))?;
        owned.push(GpuHandle::TextureView(array_view));

        let mut layer_views = Vec::with_capacity(layers as usize);
        for layer in 0..layers {
            let view = backend.create_texture_view(color, &TextureViewDescriptor::layer(layer))?;
            owned.push(GpuHandle::TextureView(view));
            layer_views.push(view);
        }

        let depth_texture = backend.create_texture(&TextureDescriptor {
            label: Some("shadow depth".into()),
            width: size,
            height: size,
            format: TextureFormat::Depth32Float,
            usage: TextureUsage::RENDER_ATTACHMENT,
            ..Default::default()
        })?;
        owned.push(GpuHandle::Texture(depth_texture));
        let depth_view = backend.create_texture_view(depth_texture, &TextureViewDescriptor::layer(0))?;
        owned.push(GpuHandle::TextureView(depth_view));

        let sampler = backend.create_sampler(&SamplerDescriptor {
            label: Some("shadow sampler".into()),
            mag_filter: FilterMode::Nearest,
            min_filter: FilterMode::Nearest,
            ..Default::default()
        })?;
        owned.push(GpuHandle::Sampler(sampler));

        Ok((
            color,
            array_view,
            layer_views,
            Attachment {
                texture: depth_texture,
                view: depth_view,
            },
            sampler,
        ))
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn layers(&self) -> u32 {
        self.layer_views.len() as u32
    }

    pub fn texture(&self) -> TextureHandle {
        self.color
    }

    /// View over every layer, bound for sampling in lit shaders
    pub fn array_view(&self) -> TextureViewHandle {
        self.array_view
    }

    pub fn sampler(&self) -> SamplerHandle {
        self.sampler
    }

    pub fn layer_view(&self, layer: u32) -> Option<TextureViewHandle> {
        self.layer_views.get(layer as usize).copied()
    }

    /// Render texture over one layer. Cleared to white so unwritten texels read as far away.
    pub fn layer_texture(&self, layer: u32) -> Option<RenderTexture> {
        let view = self.layer_view(layer)?;
        let mut texture = RenderTexture::borrowed(
            Attachment {
                texture: self.color,
                view,
            },
            SHADOW_FORMAT,
            Some((self.depth, TextureFormat::Depth32Float)),
            self.size,
            self.size,
            layer,
        );
        texture.set_background_color(Some([1.0, 1.0, 1.0, 1.0]));
        Some(texture)
    }
}

impl Drop for ShadowAtlas {
    fn drop(&mut self) {
        self.queue.push(GpuHandle::Sampler(self.sampler));
        self.queue.push(GpuHandle::TextureView(self.depth.view));
        self.queue.push(GpuHandle::Texture(self.depth.texture));
        for view in &self.layer_views {
            self.queue.push(GpuHandle::TextureView(*view));
        }
        self.queue.push(GpuHandle::TextureView(self.array_view));
        self.queue.push(GpuHandle::Texture(self.color));
    }
}

/// Render target over one atlas layer
#[derive(Debug)]
pub struct ShadowMap {
    atlas: Arc<ShadowAtlas>,
    layer: u32,
    material: SharedMaterial,
    target: RenderTarget,
}

impl ShadowMap {
    pub fn new(atlas: Arc<ShadowAtlas>, layer: u32, material: SharedMaterial) -> RenderResult<Self> {
        let mut target = RenderTarget::with_texture(layer_texture(&atlas, layer)?);
        *target.state_mut() = RenderState::shadow(material.clone());
        Ok(Self {
            atlas,
            layer,
            material,
            target,
        })
    }

    pub fn layer(&self) -> u32 {
        self.layer
    }

    pub fn atlas(&self) -> &Arc<ShadowAtlas> {
        &self.atlas
    }

    pub fn material(&self) -> &SharedMaterial {
        &self.material
    }

    pub fn set_material(&mut self, material: SharedMaterial) {
        self.target.state_mut().material_override = Some(material.clone());
        self.material = material;
    }

    /// Point this map at another layer, or at a new atlas
    pub fn bind_layer(&mut self, atlas: Arc<ShadowAtlas>, layer: u32) -> RenderResult<()> {
        let texture = layer_texture(&atlas, layer)?;
        self.target.set_texture(texture)?;
        self.atlas = atlas;
        self.layer = layer;
        Ok(())
    }

    pub fn set_viewport(&mut self, width: u32, height: u32) {
        self.target.state_mut().viewport = Viewport::new(width, height);
    }

    pub fn target(&self) -> &RenderTarget {
        &self.target
    }

    pub fn target_mut(&mut self) -> &mut RenderTarget {
        &mut self.target
    }

    /// Copy this layer's packed depth into `buffer`
    pub fn read_render_result<B: GraphicsBackend + ?Sized>(&self, backend: &mut B, buffer: &mut [u8]) -> RenderResult<()> {
        match self.target.texture() {
            Some(texture) => texture.read_render_result(backend, buffer),
            None => Ok(()),
        }
    }
}

fn layer_texture(atlas: &ShadowAtlas, layer: u32) -> RenderResult<RenderTexture> {
    atlas
        .layer_texture(layer)
        .ok_or(crate::error::RenderError::ShadowAtlasFull { max: atlas.layers() })
}

/// View and projection a shadow pass renders with
#[derive(Debug, Clone, Copy)]
pub struct LightCamera {
    view: Mat4,
    projection: Mat4,
    position: Vec3,
}

impl LightCamera {
    /// Camera at the light's world transform. Lights declaring `projMatrix`
    /// use it, the rest get the default perspective.
    pub fn new(light: &Light) -> Self {
        let world = light.world_matrix();
        let projection = light
            .projection_override()
            .unwrap_or_else(|| Projection::default().matrix());
        Self {
            view: world.inverse(),
            projection,
            position: world.w_axis.truncate(),
        }
    }

    pub fn view(&self) -> Mat4 {
        self.view
    }

    pub fn projection(&self) -> Mat4 {
        self.projection
    }

    pub fn view_projection(&self) -> Mat4 {
        self.projection * self.view
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn view_params(&self) -> ViewParams {
        ViewParams::new(self.view, self.projection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DummyBackend;
    use crate::resources::Material;

    #[test]
    fn atlas_layers_have_own_views() {
        let mut backend = DummyBackend::new();
        let queue = DeleteQueue::new();
        let atlas = ShadowAtlas::create(&mut backend, &queue, 64, 4).unwrap();
        assert_eq!(atlas.layers(), 4);
        let views: Vec<_> = (0..4).filter_map(|l| atlas.layer_view(l)).collect();
        assert_eq!(views.len(), 4);
        assert!(views.iter().all(|v| *v != atlas.array_view()));
        assert!(atlas.layer_texture(4).is_none());

        drop(atlas);
        queue.process_queues(&mut backend).unwrap();
        assert_eq!(backend.live_texture_count(), 0);
    }

    #[test]
    fn rebinding_moves_the_target_layer() {
        let mut backend = DummyBackend::new();
        let queue = DeleteQueue::new();
        let atlas = Arc::new(ShadowAtlas::create(&mut backend, &queue, 32, 2).unwrap());
        let material = Material::depth().into_shared();

        let mut map = ShadowMap::new(atlas.clone(), 0, material).unwrap();
        assert!(map.target().state().shadow_pass);
        assert_eq!(map.target().frame_buffer_handle(), atlas.layer_view(0));

        map.bind_layer(atlas.clone(), 1).unwrap();
        assert_eq!(map.layer(), 1);
        assert_eq!(map.target().frame_buffer_handle(), atlas.layer_view(1));
        assert!(map.bind_layer(atlas, 2).is_err());
    }

    #[test]
    fn light_camera_looks_down_negative_z() {
        let light = Light::directional(Vec3::ONE, 1.0, 20.0).unwrap();
        light
            .update_transform(&Mat4::from_translation(Vec3::new(0.0, 0.0, 10.0)))
            .unwrap();
        let camera = LightCamera::new(&light);
        assert_eq!(camera.position(), Vec3::new(0.0, 0.0, 10.0));
        let in_view = camera.view().transform_point3(Vec3::ZERO);
        assert!((in_view.z + 10.0).abs() < 1e-5);
        let clip = camera.view_projection() * Vec3::ZERO.extend(1.0);
        assert!(clip.x.abs() < 1e-5 && clip.y.abs() < 1e-5);
    }
}
