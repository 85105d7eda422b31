//! # Offscreen Demo
//!
//! Renders a small scene into a stereo pair of offscreen targets and writes
//! the left eye to a PNG.
//!
//! ```text
//! cargo run --example offscreen -- --backend vulkan --size 512 --output frame.png
//! ```

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use glam::{Vec3, Vec4};
use vr_render_core::render::RenderTextureDescriptor;
use vr_render_core::scene::{Projection, Transform};
use vr_render_core::{
    BackendType, Camera, GraphicsBackend, Light, Material, Mesh, RenderData, RenderTarget,
    RenderTexture, Renderer, RendererConfig, Scene,
};

/// Graphics backend selection for CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
enum CliBackend {
    #[default]
    Wgpu,
    Vulkan,
    /// Records commands only, the image stays at the background color
    Dummy,
}

impl From<CliBackend> for BackendType {
    fn from(backend: CliBackend) -> Self {
        match backend {
            CliBackend::Wgpu => BackendType::Wgpu,
            CliBackend::Vulkan => BackendType::Vulkan,
            CliBackend::Dummy => BackendType::Dummy,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "offscreen", about = "Render one stereo frame to a PNG")]
struct Args {
    /// Graphics backend.
    #[arg(long, default_value = "wgpu", value_enum)]
    backend: CliBackend,

    /// Width and height of each eye in pixels.
    #[arg(long, default_value = "256")]
    size: u32,

    /// Distance between the eyes.
    #[arg(long, default_value = "0.064")]
    ipd: f32,

    /// Enable occlusion culling.
    #[arg(long)]
    occlusion: bool,

    /// Where the left eye is written.
    #[arg(long, short, default_value = "offscreen.png")]
    output: PathBuf,
}

fn build_scene(config: &RendererConfig) -> Result<Scene, Box<dyn Error>> {
    let scene = Scene::with_config(config);
    let cube = Arc::new(Mesh::cube());

    let ground = scene.add_object("ground");
    scene.set_transform(ground, Transform::from_position(Vec3::new(0.0, -1.0, 0.0)))?;
    scene.set_render_data(
        ground,
        RenderData::new(
            Arc::new(Mesh::plane(20.0, 20.0, 1)),
            Material::unlit_color(Vec4::new(0.3, 0.3, 0.3, 1.0))?.into_shared(),
        ),
    )?;

    let colors = [
        Vec4::new(0.9, 0.2, 0.2, 1.0),
        Vec4::new(0.2, 0.9, 0.2, 1.0),
        Vec4::new(0.2, 0.2, 0.9, 1.0),
    ];
    for (i, color) in colors.iter().enumerate() {
        let entity = scene.add_object(&format!("cube {}", i));
        let x = (i as f32 - 1.0) * 2.0;
        scene.set_transform(entity, Transform::from_position(Vec3::new(x, 0.0, -(i as f32))))?;
        scene.set_render_data(
            entity,
            RenderData::new(cube.clone(), Material::unlit_color(*color)?.into_shared()),
        )?;
    }

    let sun_owner = scene.add_object("sun");
    scene.set_transform(
        sun_owner,
        Transform::looking_at(Vec3::new(4.0, 10.0, 2.0), Vec3::ZERO, Vec3::Y),
    )?;
    let sun = Arc::new(Light::directional(Vec3::ONE, 1.0, 15.0)?);
    sun.set_shadow_material(Some(Material::depth().into_shared()));
    scene.add_light(sun_owner, sun)?;

    let lamp_owner = scene.add_object("lamp");
    scene.set_transform(lamp_owner, Transform::from_position(Vec3::new(0.0, 2.0, 2.0)))?;
    scene.add_light(lamp_owner, Arc::new(Light::point(Vec3::new(1.0, 0.8, 0.6), 2.0, 6.0)?))?;

    Ok(scene)
}

fn eye(scene: &Scene, name: &str, offset: f32) -> Result<Camera, Box<dyn Error>> {
    let head = Vec3::new(offset, 1.5, 6.0);
    let owner = scene.add_object(name);
    scene.set_transform(owner, Transform::looking_at(head, Vec3::new(offset, 0.0, 0.0), Vec3::Y))?;
    Ok(Camera::new(owner, Projection::perspective(70.0, 1.0, 0.1, 100.0)).with_background([0.1, 0.1, 0.15, 1.0]))
}

fn main() -> Result<(), Box<dyn Error>> {
    vr_render_core::init_logging();
    let args = Args::parse();

    let config = RendererConfig::from_env()
        .with_backend(args.backend.into())
        .with_occlusion_culling(args.occlusion);
    let mut renderer = Renderer::new(config.clone())?;
    log::info!("Rendering with {}", renderer.backend().name());

    let scene = build_scene(&config)?;
    let left_camera = eye(&scene, "left eye", -args.ipd / 2.0)?;
    let right_camera = eye(&scene, "right eye", args.ipd / 2.0)?;

    let descriptor = RenderTextureDescriptor::new(args.size, args.size);
    let queue = renderer.delete_queue().clone();
    let mut left = RenderTarget::with_texture(RenderTexture::create(renderer.backend_mut(), &queue, &descriptor)?);
    let mut right = RenderTarget::with_texture(RenderTexture::create(renderer.backend_mut(), &queue, &descriptor)?);

    renderer.render_frame(&scene, &left_camera, &mut left)?;
    renderer.render_frame(&scene, &right_camera, &mut right)?;
    renderer.wait_idle()?;
    log::info!(
        "{} draw calls, {} triangles, {} shadow maps",
        scene.number_draw_calls(),
        scene.number_triangles(),
        renderer.stats().shadow_maps()
    );

    let mut pixels = vec![0u8; (args.size * args.size * 4) as usize];
    let texture = left.texture().ok_or("left target has no texture")?;
    texture.read_render_result(renderer.backend_mut(), &mut pixels)?;

    let image = image::RgbaImage::from_raw(args.size, args.size, pixels).ok_or("readback size mismatch")?;
    image.save(&args.output)?;
    log::info!("Wrote {}", args.output.display());
    Ok(())
}
