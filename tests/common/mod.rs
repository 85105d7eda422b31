//! Shared fixtures for the integration tests.
//!
//! Scenes are built through the public scene API; renderers are created per
//! backend and skipped when the host has no matching GPU.

use std::sync::Arc;

use glam::{Vec3, Vec4};
use vr_render_core::backend::{Backend, DummyBackend};
use vr_render_core::render::{RenderTexture, RenderTextureDescriptor};
use vr_render_core::scene::{Projection, Transform};
use vr_render_core::{
    BackendType, Camera, Entity, Light, Material, Mesh, RenderData, RenderTarget, Renderer,
    RendererConfig, Scene,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Renderer over the dummy backend with the given configuration
pub fn dummy_renderer(config: RendererConfig) -> Renderer {
    init_logging();
    Renderer::with_backend(
        Backend::from(DummyBackend::new()),
        config.with_backend(BackendType::Dummy),
    )
    .expect("dummy renderer")
}

/// Renderer over `backend`, or `None` when it cannot be created on this host
pub fn renderer_for(backend: BackendType) -> Option<Renderer> {
    init_logging();
    let config = RendererConfig::default().with_backend(backend);
    if backend == BackendType::Dummy {
        return Some(dummy_renderer(config));
    }
    match Renderer::new(config) {
        Ok(renderer) => Some(renderer),
        Err(e) => {
            eprintln!("{:?} backend not available ({}), skipping", backend, e);
            None
        }
    }
}

pub fn render_texture(renderer: &mut Renderer, width: u32, height: u32) -> RenderTexture {
    let queue = renderer.delete_queue().clone();
    RenderTexture::create(renderer.backend_mut(), &queue, &RenderTextureDescriptor::new(width, height))
        .expect("render texture")
}

pub fn target(renderer: &mut Renderer, width: u32, height: u32) -> RenderTarget {
    RenderTarget::with_texture(render_texture(renderer, width, height))
}

/// Scene with an eye at `(0, 0, 5)` looking down -Z
pub fn scene_with_eye(config: &RendererConfig) -> (Scene, Camera) {
    let scene = Scene::with_config(config);
    let eye = scene.add_object("eye");
    scene
        .set_transform(eye, Transform::from_position(Vec3::new(0.0, 0.0, 5.0)))
        .expect("eye transform");
    let camera = Camera::new(eye, Projection::perspective(60.0, 1.0, 0.1, 100.0));
    (scene, camera)
}

/// Unit cube with a solid color material at `position`
pub fn add_cube(scene: &Scene, name: &str, position: Vec3, color: Vec4) -> Entity {
    let entity = scene.add_object(name);
    scene
        .set_transform(entity, Transform::from_position(position))
        .expect("cube transform");
    let material = Material::unlit_color(color).expect("material").into_shared();
    scene
        .set_render_data(entity, RenderData::new(Arc::new(Mesh::cube()), material))
        .expect("render data");
    entity
}

/// Shadow casting directional light above the origin, looking down
pub fn add_sun(scene: &Scene) -> Arc<Light> {
    let owner = scene.add_object("sun");
    scene
        .set_transform(
            owner,
            Transform::looking_at(Vec3::new(0.0, 10.0, 0.1), Vec3::ZERO, Vec3::Y),
        )
        .expect("sun transform");
    let light = Arc::new(Light::directional(Vec3::ONE, 1.0, 20.0).expect("light"));
    light.set_shadow_material(Some(Material::depth().into_shared()));
    assert!(scene.add_light(owner, light.clone()).expect("add light"));
    light
}
