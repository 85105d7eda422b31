//! End-to-end frames on the dummy backend

mod common;

use std::sync::Arc;

use common::*;
use glam::{Vec3, Vec4};
use vr_render_core::backend::{DummyBackend, RecordedCommand};
use vr_render_core::render::cull::{frustum_cull, hierarchical_bounds};
use vr_render_core::render::{CullResult, RenderDataList, ShaderSource, TargetPhase, ViewParams};
use vr_render_core::scene::{Frustum, OcclusionState, Transform};
use vr_render_core::light::SHADOW_MAP_INDEX;
use vr_render_core::{
    Backend, Light, Material, Mesh, RenderData, RenderError, RenderTarget, Renderer, RendererConfig,
    ShaderType, SubmissionStatus, MAX_SHADOW_MAPS,
};

// ============================================================================
// Shadows
// ============================================================================

#[test]
fn test_sun_over_cube_renders_one_shadow_map() {
    let config = RendererConfig::default();
    let mut renderer = dummy_renderer(config.clone());
    let (scene, camera) = scene_with_eye(&config);
    let cube = add_cube(&scene, "cube", Vec3::ZERO, Vec4::new(1.0, 0.0, 0.0, 1.0));
    let sun = add_sun(&scene);

    let mut target = target(&mut renderer, 64, 64);
    assert_eq!(target.cull_from_camera(&scene, &camera, &mut renderer).unwrap(), 1);
    assert_eq!(target.render_data().entities(), vec![cube]);

    let lights = scene.lights().clone();
    lights.update_transforms(&scene).unwrap();
    assert!(lights.needs_shader_rebuild());
    renderer.shaders_mut().set_light_block(lights.make_shader_block());
    lights.shaders_rebuilt();

    assert_eq!(lights.make_shadow_maps(&scene, &mut renderer).unwrap(), 1);
    assert_eq!(lights.shadow_map_count(), 1);

    let queue = renderer.delete_queue().clone();
    let active = lights
        .update_light_block(renderer.backend_mut(), &queue)
        .unwrap()
        .expect("active shadow map");
    assert_eq!(active.lock().layer(), 0);
    assert!(Arc::ptr_eq(&active, &sun.shadow_map().unwrap()));

    let (_, size) = lights.block_buffer().expect("light block");
    assert!(lights.required_size() <= size);
}

#[test]
fn test_render_frame_reports_shadow_maps() {
    let config = RendererConfig::default();
    let mut renderer = dummy_renderer(config.clone());
    let (scene, camera) = scene_with_eye(&config);
    add_cube(&scene, "cube", Vec3::ZERO, Vec4::ONE);
    add_sun(&scene);

    let mut target = target(&mut renderer, 64, 64);
    renderer.render_frame(&scene, &camera, &mut target).unwrap();

    assert_eq!(renderer.stats().shadow_maps(), 1);
    assert_eq!(renderer.stats().draw_calls(), 1);
    assert_eq!(scene.number_draw_calls(), 1);
    assert_eq!(scene.number_triangles(), Mesh::cube().triangle_count());

    let backend = renderer.backend().as_dummy().unwrap();
    let labels: Vec<Option<String>> = backend
        .commands()
        .iter()
        .filter_map(|c| match c {
            RecordedCommand::BeginRenderPass { label, .. } => Some(label.clone()),
            _ => None,
        })
        .collect();
    // the shadow pass comes before the camera pass
    assert_eq!(labels.len(), 2);
}

#[test]
fn test_incomplete_shadow_layer_is_fatal() {
    let config = RendererConfig::default();
    let mut renderer = dummy_renderer(config.clone());
    renderer.backend_mut().as_dummy_mut().unwrap().fail_attachment_layer(0);
    let (scene, camera) = scene_with_eye(&config);
    add_cube(&scene, "cube", Vec3::ZERO, Vec4::ONE);
    add_sun(&scene);

    let mut target = target(&mut renderer, 16, 16);
    let err = renderer.render_frame(&scene, &camera, &mut target).unwrap_err();
    assert!(matches!(err, RenderError::ShadowTargetIncomplete { layer: 0, .. }), "{}", err);
}

fn advertised_layer(light: &Light) -> f32 {
    light.get_float(SHADOW_MAP_INDEX).unwrap()
}

#[test]
fn test_light_without_shadow_material_gives_up_its_layer() {
    let config = RendererConfig::default();
    let mut renderer = dummy_renderer(config.clone());
    let (scene, camera) = scene_with_eye(&config);
    add_cube(&scene, "cube", Vec3::ZERO, Vec4::ONE);
    let first = add_sun(&scene);
    let second = add_sun(&scene);

    let mut target = target(&mut renderer, 16, 16);
    renderer.render_frame(&scene, &camera, &mut target).unwrap();
    assert_eq!(advertised_layer(&first), 0.0);
    assert_eq!(advertised_layer(&second), 1.0);

    first.set_shadow_material(None);
    renderer.render_frame(&scene, &camera, &mut target).unwrap();
    assert_eq!(advertised_layer(&first), -1.0);
    assert!(first.shadow_map().is_none());
    assert_eq!(advertised_layer(&second), 0.0);

    second.set_enabled(false).unwrap();
    renderer.render_frame(&scene, &camera, &mut target).unwrap();
    assert_eq!(advertised_layer(&second), -1.0);
    assert!(second.shadow_map().is_none());
    assert_eq!(scene.lights().shadow_map_count(), 0);
}

#[test]
fn test_casters_past_the_atlas_advertise_no_layer() {
    let config = RendererConfig::default();
    let mut renderer = dummy_renderer(config.clone());
    let (scene, camera) = scene_with_eye(&config);
    add_cube(&scene, "cube", Vec3::ZERO, Vec4::ONE);
    let suns: Vec<Arc<Light>> = (0..MAX_SHADOW_MAPS + 2).map(|_| add_sun(&scene)).collect();

    let mut target = target(&mut renderer, 16, 16);
    renderer.render_frame(&scene, &camera, &mut target).unwrap();
    // the first frame renders every caster in order, later ones are skipped
    for sun in &suns[MAX_SHADOW_MAPS as usize..] {
        assert_eq!(advertised_layer(sun), -1.0);
        assert!(sun.shadow_map().is_none());
    }

    // freeing a layer hands it to a skipped caster, never to two lights
    suns[0].set_shadow_material(None);
    renderer.render_frame(&scene, &camera, &mut target).unwrap();
    let mut layers: Vec<f32> = suns
        .iter()
        .map(|s| advertised_layer(s))
        .filter(|l| *l >= 0.0)
        .collect();
    layers.sort_by(f32::total_cmp);
    assert_eq!(layers, vec![0.0, 1.0, 2.0, 3.0]);
}

// ============================================================================
// Lit shaders
// ============================================================================

const LIT_SHADER: &str = r#"
@vertex
fn vs_main(input: VertexInput) -> VertexOutput {
    return transform_vertex(input);
}

@fragment
fn fs_main(input: VertexOutput) -> @location(0) vec4<f32> {
    let depth = unpack_depth(textureSample(u_shadow_maps, u_shadow_sampler, input.uv, 0));
    return material.u_color * depth;
}
"#;

fn lit_cube_frame(config: RendererConfig) -> (Renderer, vr_render_core::Scene) {
    let mut renderer = dummy_renderer(config.clone());
    let lit = renderer
        .shaders_mut()
        .add_shader(ShaderSource::new("lit", LIT_SHADER).with_uniforms("float4 u_color").with_lights())
        .unwrap();
    let (scene, camera) = scene_with_eye(&config);
    let cube = scene.add_object("lit cube");
    let mut material = Material::unlit_color(Vec4::ONE).unwrap();
    material.set_shader_type(lit);
    scene
        .set_render_data(cube, RenderData::new(Arc::new(Mesh::cube()), material.into_shared()))
        .unwrap();
    add_sun(&scene);
    let lamp = scene.add_object("lamp");
    scene
        .add_light(lamp, Arc::new(Light::point(Vec3::ONE, 1.0, 5.0).unwrap()))
        .unwrap();

    let mut target = target(&mut renderer, 16, 16);
    renderer.render_frame(&scene, &camera, &mut target).unwrap();
    (renderer, scene)
}

#[test]
fn test_lit_shader_reads_the_shared_light_block() {
    let (renderer, scene) = lit_cube_frame(RendererConfig::default());
    let backend = renderer.backend().as_dummy().unwrap();
    let labels: Vec<&str> = backend
        .commands()
        .iter()
        .filter_map(|c| match c {
            RecordedCommand::SetPipeline(pipeline) => backend.pipeline_label(*pipeline),
            _ => None,
        })
        .collect();
    assert!(labels.contains(&"lit"));
    assert!(!labels.contains(&"error"));

    let lights = scene.lights();
    assert!(lights.uses_block());
    let (block, size) = lights.block_buffer().unwrap();
    assert_eq!(lights.buffers(), vec![block]);
    let data = backend.buffer_data(block).unwrap();
    assert_eq!(data.len() as u64, size);
    assert!(data.iter().any(|b| *b != 0));
}

#[test]
fn test_lights_bind_per_shader_without_block() {
    let (_, scene) = lit_cube_frame(RendererConfig::default().with_light_uniform_block(false));
    let lights = scene.lights();
    assert!(!lights.uses_block());
    assert!(lights.block_buffer().is_none());
    assert_eq!(lights.buffers().len(), 1);
}

// ============================================================================
// Culling
// ============================================================================

#[test]
fn test_subtree_beyond_far_plane_is_outside() {
    let config = RendererConfig::default();
    let mut renderer = dummy_renderer(config.clone());
    let (scene, camera) = scene_with_eye(&config);
    let near = add_cube(&scene, "near", Vec3::ZERO, Vec4::ONE);
    let far = add_cube(&scene, "far", Vec3::new(0.0, 0.0, -200.0), Vec4::ONE);
    let child = scene.add_child(far, "far child").unwrap();
    scene
        .set_transform(child, Transform::from_position(Vec3::new(1.0, 0.0, 0.0)))
        .unwrap();
    scene
        .set_render_data(
            child,
            RenderData::new(Arc::new(Mesh::cube()), Material::unlit_color(Vec4::ONE).unwrap().into_shared()),
        )
        .unwrap();

    {
        let world = scene.world();
        let bounds = hierarchical_bounds(&world, scene.root());
        let view = ViewParams::from_camera(&world, &camera).unwrap();
        let frustum = Frustum::from_matrix(&view.view_projection());
        let mut plane_mask = 0u8;
        let result = frustum_cull(&world, far, &bounds[&far], &frustum, view.position, &mut plane_mask);
        assert_eq!(result, CullResult::Outside);
    }

    let mut list = RenderDataList::default();
    renderer.cull(&scene, &camera, &mut list).unwrap();
    let entities = list.entities();
    assert_eq!(entities, vec![near]);
    assert!(!entities.contains(&far));
    assert!(!entities.contains(&child));
}

#[test]
fn test_disabled_subtree_is_skipped() {
    let config = RendererConfig::default();
    let mut renderer = dummy_renderer(config.clone());
    let (scene, camera) = scene_with_eye(&config);
    let parent = add_cube(&scene, "parent", Vec3::ZERO, Vec4::ONE);
    let child = scene.add_child(parent, "child").unwrap();
    scene
        .set_render_data(
            child,
            RenderData::new(Arc::new(Mesh::cube()), Material::unlit_color(Vec4::ONE).unwrap().into_shared()),
        )
        .unwrap();

    let mut list = RenderDataList::default();
    assert_eq!(renderer.cull(&scene, &camera, &mut list).unwrap(), 2);

    scene.set_enabled(parent, false).unwrap();
    assert_eq!(renderer.cull(&scene, &camera, &mut list).unwrap(), 0);
}

// ============================================================================
// Lights
// ============================================================================

#[test]
fn test_removing_middle_light_keeps_indices_dense() {
    let scene = vr_render_core::Scene::new();
    let lights: Vec<Arc<Light>> = (0..3)
        .map(|i| {
            let owner = scene.add_object(&format!("lamp {}", i));
            let light = Arc::new(Light::point(Vec3::ONE, 1.0, 5.0).unwrap());
            assert!(scene.add_light(owner, light.clone()).unwrap());
            light
        })
        .collect();

    let removed = lights.iter().find(|l| l.index() == Some(1)).unwrap().clone();
    assert!(scene.remove_light(&removed));
    assert_eq!(removed.index(), None);

    let remaining = scene.lights().class_lights("point");
    let mut indices: Vec<usize> = remaining.iter().filter_map(|l| l.index()).collect();
    indices.sort_unstable();
    assert_eq!(indices, vec![0, 1]);

    let mut names: Vec<String> = remaining.iter().map(|l| l.light_name()).collect();
    names.sort();
    assert_eq!(names, vec!["points[0]".to_string(), "points[1]".to_string()]);
}

// ============================================================================
// Error shader
// ============================================================================

#[test]
fn test_broken_material_falls_back_to_error_shader() {
    let config = RendererConfig::default();
    let mut renderer = dummy_renderer(config.clone());
    let (scene, camera) = scene_with_eye(&config);
    let count = 4;
    for i in 0..count {
        add_cube(&scene, &format!("cube {}", i), Vec3::new(i as f32 - 1.5, 0.0, 0.0), Vec4::ONE);
    }
    let broken = scene.add_object("broken");
    let mut material = Material::unlit_color(Vec4::ONE).unwrap();
    // needs a u_texture the material does not have
    material.set_shader_type(ShaderType::Texture);
    scene
        .set_render_data(broken, RenderData::new(Arc::new(Mesh::cube()), material.into_shared()))
        .unwrap();

    let mut target = target(&mut renderer, 32, 32);
    renderer.render_frame(&scene, &camera, &mut target).unwrap();

    let backend = renderer.backend().as_dummy().unwrap();
    assert_eq!(backend.draw_count(), count + 1);
    let labels: Vec<&str> = backend
        .commands()
        .iter()
        .filter_map(|c| match c {
            RecordedCommand::SetPipeline(pipeline) => backend.pipeline_label(*pipeline),
            _ => None,
        })
        .collect();
    assert_eq!(labels.iter().filter(|l| **l == "error").count(), 1);
    assert_eq!(labels.iter().filter(|l| **l == "unlit_color").count(), count);
    assert_eq!(renderer.stats().draw_calls() as usize, count + 1);
}

// ============================================================================
// Multiview
// ============================================================================

#[test]
fn test_multiview_delegates_share_one_cull() {
    let config = RendererConfig::default();
    let mut renderer = dummy_renderer(config.clone());
    let (scene, camera) = scene_with_eye(&config);
    add_cube(&scene, "cube", Vec3::ZERO, Vec4::ONE);

    let source = RenderTarget::new();
    let mut left = RenderTarget::multiview_delegate(render_texture(&mut renderer, 32, 32), &source);
    let right = RenderTarget::multiview_delegate(render_texture(&mut renderer, 32, 32), &source);
    assert!(left.shares_render_data(&right));

    left.cull_from_camera(&scene, &camera, &mut renderer).unwrap();

    let seen = right.render_data();
    assert!(!seen.is_empty());
    assert_eq!(seen.len(), 1);
    assert_eq!(seen.cull_count(), 1);
}

#[test]
fn test_chained_delegate_is_not_culled_again() {
    let config = RendererConfig::default();
    let mut renderer = dummy_renderer(config.clone());
    let (scene, camera) = scene_with_eye(&config);
    add_cube(&scene, "cube", Vec3::ZERO, Vec4::ONE);

    let mut left = target(&mut renderer, 32, 32);
    let right = RenderTarget::multiview_delegate(render_texture(&mut renderer, 32, 32), &left);
    left.attach_render_target(right);
    assert_eq!(left.chain_len(), 2);

    renderer.render_frame(&scene, &camera, &mut left).unwrap();

    assert_eq!(left.render_data().cull_count(), 1);
    let backend = renderer.backend().as_dummy().unwrap();
    let passes = backend
        .commands()
        .iter()
        .filter(|c| matches!(c, RecordedCommand::BeginRenderPass { .. }))
        .count();
    assert_eq!(passes, 2);
    assert_eq!(backend.draw_count(), 2);
}

// ============================================================================
// Render target phases
// ============================================================================

#[test]
fn test_target_phases() {
    let mut renderer = dummy_renderer(RendererConfig::default());
    let mut unbound = RenderTarget::new();
    assert_eq!(unbound.phase(), TargetPhase::Unbound);
    assert!(matches!(
        unbound.begin_rendering(&mut renderer),
        Err(RenderError::InvalidTargetState { .. })
    ));

    let mut target = target(&mut renderer, 16, 16);
    assert_eq!(target.phase(), TargetPhase::Bound);
    assert!(target.end_rendering(&mut renderer).is_err());

    target.begin_rendering(&mut renderer).unwrap();
    assert_eq!(target.phase(), TargetPhase::Rendering);
    assert!(target.begin_rendering(&mut renderer).is_err());

    target.end_rendering(&mut renderer).unwrap();
    assert_eq!(target.phase(), TargetPhase::Bound);
}

// ============================================================================
// Occlusion
// ============================================================================

fn occlusion_renderer() -> Renderer {
    init_logging();
    let config = RendererConfig::default().with_occlusion_culling(true);
    Renderer::with_backend(Backend::from(DummyBackend::new().with_deferred_submission()), config).unwrap()
}

#[test]
fn test_occlusion_results_arrive_a_frame_later() {
    let mut renderer = occlusion_renderer();
    let config = renderer.config().clone();
    let (scene, camera) = scene_with_eye(&config);
    add_cube(&scene, "cube", Vec3::ZERO, Vec4::ONE);
    renderer
        .backend_mut()
        .as_dummy_mut()
        .unwrap()
        .set_default_occlusion_samples(0);

    let mut target = target(&mut renderer, 32, 32);
    let status = renderer.render_frame(&scene, &camera, &mut target).unwrap();
    assert!(matches!(status, SubmissionStatus::Pending(_)));
    assert_eq!(target.render_data().len(), 1);
    assert_eq!(renderer.backend().as_dummy().unwrap().live_query_count(), 1);

    // result still in flight: keep the last visibility and issue nothing new
    let mut list = RenderDataList::default();
    renderer.cull(&scene, &camera, &mut list).unwrap();
    assert_eq!(list.len(), 1);
    assert!(list.occlusion_requests.is_empty());

    // the next frame waits for the fence and sees zero samples
    renderer.render_frame(&scene, &camera, &mut target).unwrap();
    assert_eq!(target.render_data().len(), 0);

    renderer
        .backend_mut()
        .as_dummy_mut()
        .unwrap()
        .set_default_occlusion_samples(1);
    renderer.render_frame(&scene, &camera, &mut target).unwrap();
    assert_eq!(target.render_data().len(), 0);
    renderer.render_frame(&scene, &camera, &mut target).unwrap();
    assert_eq!(target.render_data().len(), 1);
    assert_eq!(renderer.backend().as_dummy().unwrap().live_query_count(), 1);
}

#[test]
fn test_disabling_occlusion_releases_queries() {
    let mut renderer = occlusion_renderer();
    let config = renderer.config().clone();
    let (scene, camera) = scene_with_eye(&config);
    add_cube(&scene, "a", Vec3::new(-1.0, 0.0, 0.0), Vec4::ONE);
    add_cube(&scene, "b", Vec3::new(1.0, 0.0, 0.0), Vec4::ONE);

    let mut target = target(&mut renderer, 32, 32);
    renderer.render_frame(&scene, &camera, &mut target).unwrap();
    assert_eq!(renderer.backend().as_dummy().unwrap().live_query_count(), 2);

    scene.set_occlusion_culling(false);
    renderer.render_frame(&scene, &camera, &mut target).unwrap();
    // released handles are destroyed when the queue is next drained
    assert!(!renderer.delete_queue().is_empty());
    assert_eq!(renderer.backend().as_dummy().unwrap().live_query_count(), 2);
    renderer.render_frame(&scene, &camera, &mut target).unwrap();
    assert_eq!(renderer.backend().as_dummy().unwrap().live_query_count(), 0);
    assert_eq!(target.render_data().len(), 2);
}

#[test]
fn test_scripted_occlusion_hides_one_object() {
    init_logging();
    let config = RendererConfig::default().with_occlusion_culling(true);
    let mut renderer = dummy_renderer(config.clone());
    let (scene, camera) = scene_with_eye(&config);
    let hidden = add_cube(&scene, "hidden", Vec3::new(-1.0, 0.0, 0.0), Vec4::ONE);
    let shown = add_cube(&scene, "shown", Vec3::new(1.0, 0.0, 0.0), Vec4::ONE);

    let mut target = target(&mut renderer, 32, 32);
    renderer.render_frame(&scene, &camera, &mut target).unwrap();
    let query = scene
        .world()
        .get::<OcclusionState>(hidden)
        .and_then(|state| state.query.as_ref().map(|q| q.handle()))
        .expect("query created on first cull");
    renderer
        .backend_mut()
        .as_dummy_mut()
        .unwrap()
        .script_occlusion_result(query, 0);

    // the query issued by this frame is the first to report zero samples
    renderer.render_frame(&scene, &camera, &mut target).unwrap();
    assert_eq!(target.render_data().len(), 2);
    renderer.render_frame(&scene, &camera, &mut target).unwrap();
    assert_eq!(target.render_data().entities(), vec![shown]);
    assert!(!scene.object_info(hidden).unwrap().visible);
}
