//! Frustum culling and draw list ordering
//!
//! Culling walks the object tree with a four way result per node, carrying the
//! mask of frustum planes the parent is already inside of. Once a subtree is
//! fully inside, its descendants are collected without further plane tests.

use crate::backend::QueryHandle;
use crate::render::ShaderType;
use crate::resources::Mesh;
use crate::scene::{
    children, world_matrix, BoundingVolume, Camera, Containment, Frustum, Hierarchy, ObjectInfo,
    RenderData, Transform, ALL_PLANES,
};
use bevy_ecs::prelude::*;
use glam::{Mat4, Vec3};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

/// Frustum classification of one node
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum CullResult {
    /// Node and subtree are culled
    Outside = 0,
    /// The subtree may be visible but this node's mesh is not
    ChildrenOnly = 1,
    /// Mesh intersects the frustum, children are tested individually
    Visible = 2,
    /// Subtree fully inside, children skip the frustum test
    Inside = 3,
}

/// Placement of the eye used for one cull and draw
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewParams {
    pub view: Mat4,
    pub projection: Mat4,
    pub position: Vec3,
}

impl ViewParams {
    pub fn new(view: Mat4, projection: Mat4) -> Self {
        Self {
            view,
            projection,
            position: view.inverse().w_axis.truncate(),
        }
    }

    /// View of a camera attached to a scene object. `None` for a detached camera.
    pub fn from_camera(world: &World, camera: &Camera) -> Option<Self> {
        let owner = camera.owner?;
        let eye = world_matrix(world, owner)?;
        Some(Self {
            view: eye.inverse(),
            projection: camera.projection_matrix(),
            position: eye.w_axis.truncate(),
        })
    }

    pub fn view_projection(&self) -> Mat4 {
        self.projection * self.view
    }
}

/// World matrix and hierarchical bounds of one node
#[derive(Debug, Clone, Copy)]
pub struct NodeBounds {
    pub model: Mat4,
    /// World space mesh bounds expanded by every enabled child's bounds
    pub hbv: BoundingVolume,
}

/// One render data that survived culling
#[derive(Debug, Clone)]
pub struct DrawItem {
    pub entity: Entity,
    pub name: String,
    /// Snapshot taken during the cull, `camera_distance` filled in
    pub render_data: RenderData,
    pub model: Mat4,
    /// Shader of the first pass, part of the sort key
    pub shader: Option<ShaderType>,
}

impl DrawItem {
    fn is_back_to_front(&self) -> bool {
        self.render_data.is_transparent() || self.render_data.alpha_blend
    }
}

/// Occlusion query to issue for an object while drawing this frame
#[derive(Debug, Clone)]
pub struct OcclusionRequest {
    pub entity: Entity,
    pub query: QueryHandle,
    pub model: Mat4,
    /// Bounding box mesh drawn for the query
    pub proxy: Arc<Mesh>,
}

/// Result of culling for one camera. Shared between multiview targets.
#[derive(Debug, Default)]
pub struct RenderDataList {
    pub items: Vec<DrawItem>,
    pub occlusion_requests: Vec<OcclusionRequest>,
    culls: u64,
}

impl RenderDataList {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.occlusion_requests.clear();
    }

    /// Number of culls that filled this list
    pub fn cull_count(&self) -> u64 {
        self.culls
    }

    pub(crate) fn mark_culled(&mut self) {
        self.culls += 1;
    }

    pub fn entities(&self) -> Vec<Entity> {
        self.items.iter().map(|i| i.entity).collect()
    }
}

/// Surviving node before the render data snapshot is taken
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub entity: Entity,
    pub model: Mat4,
    /// Squared distance from the eye to the center of the node's bounds
    pub distance: f32,
}

fn is_enabled(world: &World, entity: Entity) -> bool {
    world.get::<ObjectInfo>(entity).map(|i| i.enabled).unwrap_or(true)
}

/// World matrices and hierarchical bounds of every enabled node under `root`
pub fn hierarchical_bounds(world: &World, root: Entity) -> HashMap<Entity, NodeBounds> {
    let mut out = HashMap::new();
    let parent = world
        .get::<Hierarchy>(root)
        .and_then(|h| h.parent)
        .and_then(|p| world_matrix(world, p))
        .unwrap_or(Mat4::IDENTITY);
    visit_bounds(world, root, &parent, &mut out);
    out
}

fn visit_bounds(
    world: &World,
    entity: Entity,
    parent: &Mat4,
    out: &mut HashMap<Entity, NodeBounds>,
) -> BoundingVolume {
    let local = world.get::<Transform>(entity).map(|t| t.matrix()).unwrap_or(Mat4::IDENTITY);
    let model = *parent * local;
    let mut hbv = world
        .get::<RenderData>(entity)
        .and_then(|rd| rd.mesh.as_ref())
        .map(|mesh| mesh.bounds().transform(&model))
        .unwrap_or_else(BoundingVolume::empty);

    for child in children(world, entity) {
        if is_enabled(world, child) {
            let child_hbv = visit_bounds(world, child, &model, out);
            hbv.expand(&child_hbv);
        }
    }
    out.insert(entity, NodeBounds { model, hbv });
    hbv
}

/// Classify one node. `plane_mask` carries the planes the parent is inside of
/// and gains the planes this node's bounds are inside of.
pub fn frustum_cull(
    world: &World,
    entity: Entity,
    bounds: &NodeBounds,
    frustum: &Frustum,
    eye: Vec3,
    plane_mask: &mut u8,
) -> CullResult {
    let Some(info) = world.get::<ObjectInfo>(entity) else {
        return CullResult::Outside;
    };
    if !info.enabled {
        return CullResult::Outside;
    }
    if bounds.hbv.is_degenerate() {
        return CullResult::ChildrenOnly;
    }

    let containment = frustum.test_aabb(&bounds.hbv, plane_mask);
    if containment == Containment::Outside {
        return CullResult::Outside;
    }
    if containment == Containment::Inside && info.lod_range.is_none() {
        return CullResult::Inside;
    }

    let Some(render_data) = world.get::<RenderData>(entity).filter(|rd| rd.is_drawable()) else {
        return CullResult::ChildrenOnly;
    };
    if !info.in_lod_range(bounds.hbv.center().distance_squared(eye)) {
        return CullResult::Outside;
    }

    let Some(mesh) = render_data.mesh.as_ref() else {
        return CullResult::ChildrenOnly;
    };
    let mut mesh_mask = *plane_mask;
    match frustum.test_aabb(&mesh.bounds().transform(&bounds.model), &mut mesh_mask) {
        Containment::Outside => CullResult::ChildrenOnly,
        _ => CullResult::Visible,
    }
}

fn drawable_candidate(
    world: &World,
    entity: Entity,
    bounds: &NodeBounds,
    eye: Vec3,
) -> Option<Candidate> {
    let info = world.get::<ObjectInfo>(entity)?;
    let render_data = world.get::<RenderData>(entity)?;
    if !render_data.is_drawable() {
        return None;
    }
    let distance = bounds.hbv.center().distance_squared(eye);
    if !info.in_lod_range(distance) {
        return None;
    }
    Some(Candidate {
        entity,
        model: bounds.model,
        distance,
    })
}

/// Nodes under `root` (root excluded) to draw. Without a frustum every enabled
/// drawable node is returned.
pub fn collect_visible(world: &World, root: Entity, frustum: Option<&Frustum>, eye: Vec3) -> Vec<Candidate> {
    let bounds = hierarchical_bounds(world, root);
    let mut out = Vec::new();
    for child in children(world, root) {
        match frustum {
            Some(frustum) => visit_culled(world, child, &bounds, frustum, eye, 0, &mut out),
            None => visit_inside(world, child, &bounds, eye, &mut out),
        }
    }
    out
}

fn visit_culled(
    world: &World,
    entity: Entity,
    bounds: &HashMap<Entity, NodeBounds>,
    frustum: &Frustum,
    eye: Vec3,
    parent_mask: u8,
    out: &mut Vec<Candidate>,
) {
    let Some(node) = bounds.get(&entity) else {
        return;
    };
    let mut mask = parent_mask;
    let result = frustum_cull(world, entity, node, frustum, eye, &mut mask);
    log::trace!("cull {:?}: {:?}", entity, result);
    match result {
        CullResult::Outside => {}
        CullResult::ChildrenOnly => {
            for child in children(world, entity) {
                visit_culled(world, child, bounds, frustum, eye, mask, out);
            }
        }
        CullResult::Visible => {
            out.extend(drawable_candidate(world, entity, node, eye));
            for child in children(world, entity) {
                visit_culled(world, child, bounds, frustum, eye, mask, out);
            }
        }
        CullResult::Inside => {
            debug_assert_eq!(mask, ALL_PLANES);
            visit_inside(world, entity, bounds, eye, out);
        }
    }
}

fn visit_inside(
    world: &World,
    entity: Entity,
    bounds: &HashMap<Entity, NodeBounds>,
    eye: Vec3,
    out: &mut Vec<Candidate>,
) {
    if !is_enabled(world, entity) {
        return;
    }
    let Some(node) = bounds.get(&entity) else {
        return;
    };
    out.extend(drawable_candidate(world, entity, node, eye));
    for child in children(world, entity) {
        visit_inside(world, child, bounds, eye, out);
    }
}

/// Snapshot the render data of the candidates
pub fn build_items(world: &World, candidates: &[Candidate]) -> Vec<DrawItem> {
    candidates
        .iter()
        .filter_map(|c| {
            let mut render_data = world.get::<RenderData>(c.entity)?.clone();
            render_data.camera_distance = c.distance;
            let name = world
                .get::<ObjectInfo>(c.entity)
                .map(|i| i.name.clone())
                .unwrap_or_default();
            let shader = render_data.passes.first().and_then(|p| p.shader_type());
            Some(DrawItem {
                entity: c.entity,
                name,
                render_data,
                model: c.model,
                shader,
            })
        })
        .collect()
}

/// Order by rendering order, then shader, then distance. Opaque queues draw
/// front to back, transparent ones back to front. The sort is stable.
pub fn sort_draw_items(items: &mut [DrawItem]) {
    items.sort_by(|a, b| {
        a.render_data
            .rendering_order
            .cmp(&b.render_data.rendering_order)
            .then_with(|| a.shader.cmp(&b.shader))
            .then_with(|| {
                let (da, db) = (a.render_data.camera_distance, b.render_data.camera_distance);
                if a.is_back_to_front() && b.is_back_to_front() {
                    db.partial_cmp(&da).unwrap_or(Ordering::Equal)
                } else {
                    da.partial_cmp(&db).unwrap_or(Ordering::Equal)
                }
            })
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::Material;
    use crate::scene::{Projection, RenderingOrder, Scene};
    use glam::Vec4;

    fn drawable(scene: &Scene, parent: Option<Entity>, name: &str, position: Vec3) -> Entity {
        let entity = match parent {
            Some(p) => scene.add_child(p, name).unwrap(),
            None => scene.add_object(name),
        };
        scene.set_transform(entity, Transform::from_position(position)).unwrap();
        let material = Material::unlit_color(Vec4::ONE).unwrap().into_shared();
        scene
            .set_render_data(entity, RenderData::new(Arc::new(Mesh::cube()), material))
            .unwrap();
        entity
    }

    fn camera_frustum() -> (Frustum, Vec3) {
        let view = ViewParams::new(Mat4::IDENTITY, Projection::perspective(90.0, 1.0, 0.1, 100.0).matrix());
        (Frustum::from_matrix(&view.view_projection()), view.position)
    }

    #[test]
    fn node_fully_inside_includes_descendants() {
        let scene = Scene::new();
        let parent = drawable(&scene, None, "parent", Vec3::new(0.0, 0.0, -10.0));
        let child = drawable(&scene, Some(parent), "child", Vec3::new(0.5, 0.0, 0.0));
        let world = scene.world();
        let bounds = hierarchical_bounds(&world, scene.root());
        let (frustum, eye) = camera_frustum();

        let mut mask = 0;
        let result = frustum_cull(&world, parent, &bounds[&parent], &frustum, eye, &mut mask);
        assert_eq!(result, CullResult::Inside);

        let visible: Vec<Entity> = collect_visible(&world, scene.root(), Some(&frustum), eye)
            .iter()
            .map(|c| c.entity)
            .collect();
        assert_eq!(visible, vec![parent, child]);
    }

    #[test]
    fn behind_far_plane_culls_subtree() {
        let scene = Scene::new();
        let far = drawable(&scene, None, "far", Vec3::new(0.0, 0.0, -500.0));
        drawable(&scene, Some(far), "child", Vec3::new(0.0, 1.0, 0.0));
        let world = scene.world();
        let bounds = hierarchical_bounds(&world, scene.root());
        let (frustum, eye) = camera_frustum();

        let mut mask = 0;
        assert_eq!(
            frustum_cull(&world, far, &bounds[&far], &frustum, eye, &mut mask),
            CullResult::Outside
        );
        assert!(collect_visible(&world, scene.root(), Some(&frustum), eye).is_empty());
    }

    #[test]
    fn empty_group_tests_children_individually() {
        let scene = Scene::new();
        let group = scene.add_object("group");
        let inside = drawable(&scene, Some(group), "inside", Vec3::new(0.0, 0.0, -5.0));
        drawable(&scene, Some(group), "behind", Vec3::new(0.0, 0.0, 5.0));
        let world = scene.world();
        let (frustum, eye) = camera_frustum();

        let visible: Vec<Entity> = collect_visible(&world, scene.root(), Some(&frustum), eye)
            .iter()
            .map(|c| c.entity)
            .collect();
        assert_eq!(visible, vec![inside]);
    }

    #[test]
    fn degenerate_bounds_never_auto_include() {
        let scene = Scene::new();
        let empty = scene.add_object("marker");
        let world = scene.world();
        let bounds = hierarchical_bounds(&world, scene.root());
        let (frustum, eye) = camera_frustum();
        let mut mask = 0;
        assert_eq!(
            frustum_cull(&world, empty, &bounds[&empty], &frustum, eye, &mut mask),
            CullResult::ChildrenOnly
        );
    }

    #[test]
    fn parent_partially_visible_mesh_outside() {
        let scene = Scene::new();
        // parent mesh behind the camera, child in front: parent HBV straddles the near plane
        let parent = drawable(&scene, None, "parent", Vec3::new(0.0, 0.0, 5.0));
        let child = drawable(&scene, Some(parent), "child", Vec3::new(0.0, 0.0, -10.0));
        let world = scene.world();
        let bounds = hierarchical_bounds(&world, scene.root());
        let (frustum, eye) = camera_frustum();

        let mut mask = 0;
        assert_eq!(
            frustum_cull(&world, parent, &bounds[&parent], &frustum, eye, &mut mask),
            CullResult::ChildrenOnly
        );
        let visible: Vec<Entity> = collect_visible(&world, scene.root(), Some(&frustum), eye)
            .iter()
            .map(|c| c.entity)
            .collect();
        assert_eq!(visible, vec![child]);
    }

    #[test]
    fn lod_range_culls_out_of_range_nodes() {
        let scene = Scene::new();
        let near = drawable(&scene, None, "near", Vec3::new(0.0, 0.0, -5.0));
        let far = drawable(&scene, None, "far", Vec3::new(0.0, 0.0, -50.0));
        for e in [near, far] {
            scene
                .update_object_info(e, |info| *info = info.clone().with_lod(0.0, 20.0))
                .unwrap();
        }
        let world = scene.world();
        let (frustum, eye) = camera_frustum();
        let visible: Vec<Entity> = collect_visible(&world, scene.root(), Some(&frustum), eye)
            .iter()
            .map(|c| c.entity)
            .collect();
        assert_eq!(visible, vec![near]);
    }

    #[test]
    fn disabled_objects_are_skipped_without_frustum() {
        let scene = Scene::new();
        let a = drawable(&scene, None, "a", Vec3::new(0.0, 0.0, 50.0));
        let b = drawable(&scene, None, "b", Vec3::ZERO);
        scene.set_enabled(b, false).unwrap();
        let world = scene.world();
        let visible: Vec<Entity> = collect_visible(&world, scene.root(), None, Vec3::ZERO)
            .iter()
            .map(|c| c.entity)
            .collect();
        assert_eq!(visible, vec![a]);
    }

    #[test]
    fn sort_orders_queues_and_distances() {
        let scene = Scene::new();
        let far_opaque = drawable(&scene, None, "far_opaque", Vec3::new(0.0, 0.0, -20.0));
        let near_opaque = drawable(&scene, None, "near_opaque", Vec3::new(0.0, 0.0, -5.0));
        let far_glass = drawable(&scene, None, "far_glass", Vec3::new(0.0, 0.0, -30.0));
        let near_glass = drawable(&scene, None, "near_glass", Vec3::new(0.0, 0.0, -10.0));
        for e in [far_glass, near_glass] {
            let rd = scene.render_data(e).unwrap().with_order(RenderingOrder::TRANSPARENT);
            scene.set_render_data(e, rd).unwrap();
        }

        let world = scene.world();
        let candidates = collect_visible(&world, scene.root(), None, Vec3::ZERO);
        let mut items = build_items(&world, &candidates);
        sort_draw_items(&mut items);
        let order: Vec<Entity> = items.iter().map(|i| i.entity).collect();
        assert_eq!(order, vec![near_opaque, far_opaque, far_glass, near_glass]);
        assert!(items[0].render_data.camera_distance < items[1].render_data.camera_distance);
    }
}
