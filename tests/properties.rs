//! Invariants that must hold for any scene, light list or target

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use common::*;
use glam::{Vec3, Vec4};
use rstest::rstest;
use vr_render_core::backend::DummyBackend;
use vr_render_core::render::cull::{collect_visible, frustum_cull, hierarchical_bounds};
use vr_render_core::render::{CullResult, RenderDataList, RenderTextureDescriptor, ViewParams};
use vr_render_core::scene::{Frustum, Transform, ALL_PLANES};
use vr_render_core::{
    Collider, DeleteQueue, Light, LightList, Material, Mesh, RenderData, RenderError, RenderTexture,
    RendererConfig, Scene,
};

// ============================================================================
// Culling
// ============================================================================

#[test]
fn test_inside_parent_keeps_every_descendant() {
    let config = RendererConfig::default();
    let (scene, camera) = scene_with_eye(&config);
    let parent = add_cube(&scene, "parent", Vec3::ZERO, Vec4::ONE);
    let mut expected = vec![parent];
    let mut attach_to = parent;
    for depth in 0..3 {
        let child = scene.add_child(attach_to, &format!("child {}", depth)).unwrap();
        scene
            .set_transform(child, Transform::from_position(Vec3::new(0.2, 0.1, 0.0)))
            .unwrap();
        scene
            .set_render_data(
                child,
                RenderData::new(Arc::new(Mesh::cube()), Material::unlit_color(Vec4::ONE).unwrap().into_shared()),
            )
            .unwrap();
        expected.push(child);
        attach_to = child;
    }

    let world = scene.world();
    let bounds = hierarchical_bounds(&world, scene.root());
    let view = ViewParams::from_camera(&world, &camera).unwrap();
    let frustum = Frustum::from_matrix(&view.view_projection());

    let mut plane_mask = 0u8;
    let result = frustum_cull(&world, parent, &bounds[&parent], &frustum, view.position, &mut plane_mask);
    assert_eq!(result, CullResult::Inside);
    assert_eq!(plane_mask, ALL_PLANES);

    let drawn: HashSet<_> = collect_visible(&world, scene.root(), Some(&frustum), view.position)
        .into_iter()
        .map(|c| c.entity)
        .collect();
    for entity in expected {
        assert!(drawn.contains(&entity), "{:?} was culled under an inside parent", entity);
    }
}

#[rstest]
#[case::single(1)]
#[case::row(5)]
#[case::crowd(24)]
fn test_cull_is_idempotent(#[case] count: usize) {
    let config = RendererConfig::default();
    let mut renderer = dummy_renderer(config.clone());
    let (scene, camera) = scene_with_eye(&config);
    for i in 0..count {
        let x = (i % 6) as f32 - 2.5;
        let z = -((i / 6) as f32) * 3.0;
        add_cube(&scene, &format!("cube {}", i), Vec3::new(x, 0.0, z), Vec4::ONE);
    }

    let mut first = RenderDataList::default();
    let mut second = RenderDataList::default();
    renderer.cull(&scene, &camera, &mut first).unwrap();
    renderer.cull(&scene, &camera, &mut second).unwrap();

    assert!(!first.is_empty());
    assert_eq!(first.entities(), second.entities());
}

#[test]
fn test_draw_list_is_sorted_front_to_back() {
    let config = RendererConfig::default();
    let mut renderer = dummy_renderer(config.clone());
    let (scene, camera) = scene_with_eye(&config);
    let far = add_cube(&scene, "far", Vec3::new(0.0, 0.0, -10.0), Vec4::ONE);
    let near = add_cube(&scene, "near", Vec3::new(0.0, 0.0, 2.0), Vec4::ONE);
    let middle = add_cube(&scene, "middle", Vec3::new(0.0, 0.0, -3.0), Vec4::ONE);

    let mut list = RenderDataList::default();
    renderer.cull(&scene, &camera, &mut list).unwrap();
    assert_eq!(list.entities(), vec![near, middle, far]);
}

// ============================================================================
// Lights
// ============================================================================

fn assert_dense(list: &LightList) {
    for class in ["point", "spot"] {
        let mut indices: Vec<usize> = list
            .class_lights(class)
            .iter()
            .map(|l| l.index().expect("listed light has an index"))
            .collect();
        indices.sort_unstable();
        let expected: Vec<usize> = (0..indices.len()).collect();
        assert_eq!(indices, expected, "{} indices", class);
    }
}

/// `+p` adds a point light, `+s` a spot light, `-N` removes the N-th light added
#[rstest]
#[case::append_only("+p +p +s +p +s")]
#[case::remove_first("+p +p +p -0")]
#[case::remove_last("+p +p +p -2")]
#[case::interleaved("+p +s +p -1 +s -0 +p -4 +s")]
#[case::empty_class("+s -0 +s +s -2")]
fn test_light_indices_stay_dense(#[case] ops: &str) {
    let list = LightList::new(true);
    let mut added: Vec<Arc<Light>> = Vec::new();
    for op in ops.split_whitespace() {
        match op {
            "+p" => {
                let light = Arc::new(Light::point(Vec3::ONE, 1.0, 4.0).unwrap());
                assert!(list.add_light(light.clone()));
                added.push(light);
            }
            "+s" => {
                let light = Arc::new(Light::spot(Vec3::ONE, 1.0, 0.3, 0.5).unwrap());
                assert!(list.add_light(light.clone()));
                added.push(light);
            }
            remove => {
                let index: usize = remove.trim_start_matches('-').parse().unwrap();
                assert!(list.remove_light(&added[index]));
                assert_eq!(added[index].index(), None);
            }
        }
        assert_dense(&list);
    }
}

#[test]
fn test_light_block_only_grows() {
    let mut backend = DummyBackend::new();
    let queue = DeleteQueue::new();
    let list = LightList::new(true);
    let mut lights = Vec::new();
    let mut last_size = 0;

    for round in 0..6 {
        let light = Arc::new(if round % 2 == 0 {
            Light::point(Vec3::ONE, 1.0, 4.0).unwrap()
        } else {
            Light::spot(Vec3::ONE, 1.0, 0.3, 0.5).unwrap()
        });
        list.add_light(light.clone());
        lights.push(light);
        list.shaders_rebuilt();
        list.update_light_block(&mut backend, &queue).unwrap();

        let (_, size) = list.block_buffer().unwrap();
        assert!(list.required_size() <= size);
        assert!(size >= last_size);
        last_size = size;
    }

    for light in lights.iter().take(4) {
        list.remove_light(light);
        list.shaders_rebuilt();
        list.update_light_block(&mut backend, &queue).unwrap();
        let (_, size) = list.block_buffer().unwrap();
        assert!(list.required_size() <= size);
        assert_eq!(size, last_size);
    }
}

#[test]
fn test_shadow_layers_are_exclusive() {
    let config = RendererConfig::default();
    let mut renderer = dummy_renderer(config.clone());
    let (scene, camera) = scene_with_eye(&config);
    add_cube(&scene, "cube", Vec3::ZERO, Vec4::ONE);
    let suns: Vec<Arc<Light>> = (0..6).map(|_| add_sun(&scene)).collect();

    let mut target = target(&mut renderer, 32, 32);
    renderer.render_frame(&scene, &camera, &mut target).unwrap();

    let count = scene.lights().shadow_map_count();
    assert_eq!(count, vr_render_core::MAX_SHADOW_MAPS);
    let layers: Vec<u32> = suns
        .iter()
        .filter_map(|l| l.shadow_map())
        .map(|m| m.lock().layer())
        .collect();
    assert_eq!(layers.len(), count as usize);
    let distinct: HashSet<u32> = layers.iter().copied().collect();
    assert_eq!(distinct.len(), layers.len());
    assert!(layers.iter().all(|l| *l < vr_render_core::MAX_SHADOW_MAPS));
}

// ============================================================================
// Colliders and stats
// ============================================================================

#[test]
fn test_visible_colliders_are_a_subset() {
    let config = RendererConfig::default().with_pick_visible_only(true);
    let mut renderer = dummy_renderer(config.clone());
    let (scene, camera) = scene_with_eye(&config);
    let seen = add_cube(&scene, "seen", Vec3::ZERO, Vec4::ONE);
    let hidden = add_cube(&scene, "hidden", Vec3::new(0.0, 0.0, 50.0), Vec4::ONE);
    let unpickable = add_cube(&scene, "unpickable", Vec3::new(1.0, 0.0, 0.0), Vec4::ONE);
    assert!(scene.add_collider(seen, Collider::sphere(1.0)).unwrap());
    assert!(scene.add_collider(hidden, Collider::sphere(1.0)).unwrap());

    let mut list = RenderDataList::default();
    renderer.cull(&scene, &camera, &mut list).unwrap();
    assert!(list.entities().contains(&unpickable));
    {
        let colliders = scene.lock_colliders();
        assert!(colliders.visible_is_subset());
        assert_eq!(colliders.visible(), &[seen]);
        assert_eq!(colliders.all().len(), 2);
    }

    let hits = scene.pick_objects(Vec3::new(0.0, 0.0, 5.0), Vec3::NEG_Z);
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].entity, seen);

    assert!(scene.remove_collider(seen));
    let colliders = scene.lock_colliders();
    assert!(colliders.visible_is_subset());
    assert!(colliders.visible().is_empty());
    assert_eq!(colliders.all(), &[hidden]);
}

#[test]
fn test_counters_are_zero_without_stats() {
    let scene = Scene::new();
    add_cube(&scene, "cube", Vec3::ZERO, Vec4::ONE);
    assert_eq!(scene.number_draw_calls(), 0);
    assert_eq!(scene.number_triangles(), 0);
}

// ============================================================================
// Readback
// ============================================================================

#[rstest]
#[case::empty(4, 4, 0)]
#[case::one_row(4, 4, 16)]
#[case::one_short(8, 2, 63)]
fn test_readback_rejects_short_buffers(#[case] width: u32, #[case] height: u32, #[case] len: usize) {
    let mut backend = DummyBackend::new();
    let queue = DeleteQueue::new();
    let texture = RenderTexture::create(&mut backend, &queue, &RenderTextureDescriptor::new(width, height)).unwrap();

    let mut buffer = vec![0u8; len];
    let err = texture.read_render_result(&mut backend, &mut buffer).unwrap_err();
    match err {
        RenderError::ReadbackBufferTooSmall { required, provided } => {
            assert_eq!(required, (width * height * 4) as usize);
            assert_eq!(provided, len);
        }
        other => panic!("unexpected error: {}", other),
    }

    let mut exact = vec![0u8; (width * height * 4) as usize];
    texture.read_render_result(&mut backend, &mut exact).unwrap();
}
