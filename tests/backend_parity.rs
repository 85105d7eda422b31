//! The same frame on every backend available on this host

mod common;

use common::*;
use glam::{Vec3, Vec4};
use rstest::rstest;
use vr_render_core::{BackendType, Camera, Renderer, RendererConfig, Scene, SubmissionStatus};

const BACKGROUND: [f32; 4] = [0.0, 0.0, 1.0, 1.0];

fn render_and_read(renderer: &mut Renderer, scene: &Scene, camera: &Camera, size: u32) -> (SubmissionStatus, Vec<u8>) {
    let mut target = target(renderer, size, size);
    let status = renderer.render_frame(scene, camera, &mut target).unwrap();

    let mut pixels = vec![0u8; (size * size * 4) as usize];
    let texture = target.texture().unwrap();
    texture.read_render_result(renderer.backend_mut(), &mut pixels).unwrap();
    (status, pixels)
}

fn pixel(pixels: &[u8], size: u32, x: u32, y: u32) -> [u8; 4] {
    let offset = ((y * size + x) * 4) as usize;
    [pixels[offset], pixels[offset + 1], pixels[offset + 2], pixels[offset + 3]]
}

// ============================================================================
// Clear
// ============================================================================

#[rstest]
#[case::dummy(BackendType::Dummy)]
#[case::wgpu(BackendType::Wgpu)]
#[case::vulkan(BackendType::Vulkan)]
fn test_clear_only_frame_reads_back_background(#[case] backend: BackendType) {
    let Some(mut renderer) = renderer_for(backend) else {
        return;
    };
    let (scene, camera) = scene_with_eye(renderer.config());
    let camera = camera.with_background(BACKGROUND);
    let size = 16;
    let (_, pixels) = render_and_read(&mut renderer, &scene, &camera, size);

    for y in 0..size {
        for x in 0..size {
            assert_eq!(pixel(&pixels, size, x, y), [0, 0, 255, 255], "{:?} at ({}, {})", backend, x, y);
        }
    }
}

// ============================================================================
// Drawing
// ============================================================================

#[rstest]
#[case::wgpu(BackendType::Wgpu)]
#[case::vulkan(BackendType::Vulkan)]
fn test_red_cube_covers_the_center(#[case] backend: BackendType) {
    let Some(mut renderer) = renderer_for(backend) else {
        return;
    };
    let (scene, camera) = scene_with_eye(renderer.config());
    let camera = camera.with_background(BACKGROUND);
    add_cube(&scene, "cube", Vec3::ZERO, Vec4::new(1.0, 0.0, 0.0, 1.0));
    let size = 64;
    let (_, pixels) = render_and_read(&mut renderer, &scene, &camera, size);

    assert_eq!(pixel(&pixels, size, size / 2, size / 2), [255, 0, 0, 255]);
    assert_eq!(pixel(&pixels, size, 0, 0), [0, 0, 255, 255]);
    assert_eq!(scene.number_draw_calls(), 1);
}

// ============================================================================
// Submission
// ============================================================================

#[rstest]
#[case::dummy(BackendType::Dummy, false)]
#[case::wgpu(BackendType::Wgpu, false)]
#[case::vulkan(BackendType::Vulkan, true)]
fn test_submission_completion(#[case] backend: BackendType, #[case] deferred: bool) {
    let Some(mut renderer) = renderer_for(backend) else {
        return;
    };
    assert_eq!(renderer.capabilities().deferred_submission, deferred);
    let (scene, camera) = scene_with_eye(renderer.config());
    let camera = camera.with_background(BACKGROUND);
    add_cube(&scene, "cube", Vec3::ZERO, Vec4::ONE);

    let (status, _) = render_and_read(&mut renderer, &scene, &camera, 8);
    assert_eq!(matches!(status, SubmissionStatus::Pending(_)), deferred);
    renderer.wait_idle().unwrap();
}

#[rstest]
#[case::dummy(BackendType::Dummy)]
#[case::wgpu(BackendType::Wgpu)]
#[case::vulkan(BackendType::Vulkan)]
fn test_frames_with_shadows_complete(#[case] backend: BackendType) {
    let Some(mut renderer) = renderer_for(backend) else {
        return;
    };
    let config: RendererConfig = renderer.config().clone();
    let (scene, camera) = scene_with_eye(&config);
    let camera = camera.with_background(BACKGROUND);
    add_cube(&scene, "cube", Vec3::ZERO, Vec4::ONE);
    add_sun(&scene);

    for _ in 0..3 {
        render_and_read(&mut renderer, &scene, &camera, 16);
    }
    assert_eq!(renderer.stats().shadow_maps(), 1);
    renderer.wait_idle().unwrap();
    renderer.process_queues().unwrap();
}
