//! Scene management
//!
//! Scene objects are `bevy_ecs` entities under one root. The scene also owns the
//! light list and the collider lists used for picking. The logic thread mutates
//! the world through the write lock while the render thread reads it during culling.

mod bounds;
mod camera;
mod collider;
mod object;
mod transform;

pub use bounds::*;
pub use camera::*;
pub use collider::*;
pub use object::*;
pub use transform::*;

use crate::error::{RenderError, RenderResult};
use crate::light::{Light, LightList};
use crate::render::RenderStats;
use crate::RendererConfig;
use bevy_ecs::prelude::*;
use glam::{Mat4, Vec3};
use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// World matrix of `entity`, composed by walking its parents
pub fn world_matrix(world: &World, entity: Entity) -> Option<Mat4> {
    let mut matrix = world.get::<Transform>(entity)?.matrix();
    let mut current = world.get::<Hierarchy>(entity).and_then(|h| h.parent);
    while let Some(parent) = current {
        if let Some(t) = world.get::<Transform>(parent) {
            matrix = t.matrix() * matrix;
        }
        current = world.get::<Hierarchy>(parent).and_then(|h| h.parent);
    }
    Some(matrix)
}

/// Children of `entity` in insertion order
pub fn children(world: &World, entity: Entity) -> Vec<Entity> {
    world
        .get::<Hierarchy>(entity)
        .map(|h| h.children.clone())
        .unwrap_or_default()
}

/// Every descendant of `entity`, parents before children
pub fn descendants(world: &World, entity: Entity) -> Vec<Entity> {
    let mut out = Vec::new();
    let mut stack: Vec<Entity> = children(world, entity).into_iter().rev().collect();
    while let Some(e) = stack.pop() {
        out.push(e);
        stack.extend(children(world, e).into_iter().rev());
    }
    out
}

/// The scene: object tree, lights and colliders
pub struct Scene {
    world: RwLock<World>,
    root: Entity,
    lights: Arc<LightList>,
    colliders: Mutex<ColliderLists>,
    stats: RwLock<Option<Arc<RenderStats>>>,
    frustum_culling: AtomicBool,
    occlusion_culling: AtomicBool,
    pick_visible_only: AtomicBool,
}

impl Scene {
    pub fn new() -> Self {
        Self::with_config(&RendererConfig::default())
    }

    /// Scene whose culling and picking flags start from `config`
    pub fn with_config(config: &RendererConfig) -> Self {
        let mut world = World::new();
        let root = world
            .spawn((Transform::default(), Hierarchy::default(), ObjectInfo::new("root")))
            .id();
        Self {
            world: RwLock::new(world),
            root,
            lights: Arc::new(LightList::new(config.use_light_uniform_block)),
            colliders: Mutex::new(ColliderLists::default()),
            stats: RwLock::new(None),
            frustum_culling: AtomicBool::new(config.frustum_culling),
            occlusion_culling: AtomicBool::new(config.occlusion_culling),
            pick_visible_only: AtomicBool::new(config.pick_visible_only),
        }
    }

    pub fn root(&self) -> Entity {
        self.root
    }

    pub fn world(&self) -> RwLockReadGuard<'_, World> {
        self.world.read()
    }

    pub fn world_mut(&self) -> RwLockWriteGuard<'_, World> {
        self.world.write()
    }

    /// Add an object under the root
    pub fn add_object(&self, name: &str) -> Entity {
        let mut world = self.world.write();
        Self::spawn_child(&mut world, self.root, name)
    }

    /// Add an object under `parent`
    pub fn add_child(&self, parent: Entity, name: &str) -> RenderResult<Entity> {
        let mut world = self.world.write();
        if world.get::<Hierarchy>(parent).is_none() {
            return Err(RenderError::UnknownObject);
        }
        Ok(Self::spawn_child(&mut world, parent, name))
    }

    fn spawn_child(world: &mut World, parent: Entity, name: &str) -> Entity {
        let entity = world
            .spawn((
                Transform::default(),
                Hierarchy {
                    parent: Some(parent),
                    children: Vec::new(),
                },
                ObjectInfo::new(name),
            ))
            .id();
        if let Some(mut h) = world.get_mut::<Hierarchy>(parent) {
            h.children.push(entity);
        }
        entity
    }

    /// Remove an object and its subtree, with their colliders and lights
    pub fn remove_object(&self, entity: Entity) -> bool {
        if entity == self.root {
            return false;
        }
        let mut world = self.world.write();
        if world.get::<Hierarchy>(entity).is_none() {
            return false;
        }

        let mut doomed = descendants(&world, entity);
        doomed.push(entity);

        if let Some(parent) = world.get::<Hierarchy>(entity).and_then(|h| h.parent) {
            if let Some(mut h) = world.get_mut::<Hierarchy>(parent) {
                h.children.retain(|c| *c != entity);
            }
        }

        let mut colliders = self.colliders.lock();
        for e in doomed {
            colliders.remove(e);
            if let Some(attachment) = world.get::<LightAttachment>(e) {
                self.lights.remove_light(&attachment.light);
            }
            world.despawn(e);
        }
        true
    }

    pub fn set_transform(&self, entity: Entity, transform: Transform) -> RenderResult<()> {
        let mut world = self.world.write();
        let mut t = world.get_mut::<Transform>(entity).ok_or(RenderError::UnknownObject)?;
        *t = transform;
        Ok(())
    }

    pub fn transform(&self, entity: Entity) -> Option<Transform> {
        self.world.read().get::<Transform>(entity).copied()
    }

    pub fn world_matrix(&self, entity: Entity) -> Option<Mat4> {
        world_matrix(&self.world.read(), entity)
    }

    pub fn set_render_data(&self, entity: Entity, data: RenderData) -> RenderResult<()> {
        let mut world = self.world.write();
        let mut e = world.get_entity_mut(entity).map_err(|_| RenderError::UnknownObject)?;
        e.insert(data);
        Ok(())
    }

    pub fn render_data(&self, entity: Entity) -> Option<RenderData> {
        self.world.read().get::<RenderData>(entity).cloned()
    }

    pub fn set_enabled(&self, entity: Entity, enabled: bool) -> RenderResult<()> {
        let mut world = self.world.write();
        let mut info = world.get_mut::<ObjectInfo>(entity).ok_or(RenderError::UnknownObject)?;
        info.enabled = enabled;
        Ok(())
    }

    pub fn object_info(&self, entity: Entity) -> Option<ObjectInfo> {
        self.world.read().get::<ObjectInfo>(entity).cloned()
    }

    pub fn update_object_info<F: FnOnce(&mut ObjectInfo)>(&self, entity: Entity, f: F) -> RenderResult<()> {
        let mut world = self.world.write();
        let mut info = world.get_mut::<ObjectInfo>(entity).ok_or(RenderError::UnknownObject)?;
        f(&mut info);
        Ok(())
    }

    pub fn children(&self, entity: Entity) -> Vec<Entity> {
        children(&self.world.read(), entity)
    }

    pub fn descendants(&self, entity: Entity) -> Vec<Entity> {
        descendants(&self.world.read(), entity)
    }

    // Culling and picking flags

    pub fn frustum_culling(&self) -> bool {
        self.frustum_culling.load(Ordering::Relaxed)
    }

    pub fn set_frustum_culling(&self, enabled: bool) {
        self.frustum_culling.store(enabled, Ordering::Relaxed);
    }

    pub fn occlusion_culling(&self) -> bool {
        self.occlusion_culling.load(Ordering::Relaxed)
    }

    pub fn set_occlusion_culling(&self, enabled: bool) {
        self.occlusion_culling.store(enabled, Ordering::Relaxed);
    }

    pub fn pick_visible_only(&self) -> bool {
        self.pick_visible_only.load(Ordering::Relaxed)
    }

    pub fn set_pick_visible_only(&self, enabled: bool) {
        self.pick_visible_only.store(enabled, Ordering::Relaxed);
    }

    // Lights

    pub fn lights(&self) -> &Arc<LightList> {
        &self.lights
    }

    /// Attach `light` to `owner` and add it to the light list
    pub fn add_light(&self, owner: Entity, light: Arc<Light>) -> RenderResult<bool> {
        {
            let mut world = self.world.write();
            let mut e = world.get_entity_mut(owner).map_err(|_| RenderError::UnknownObject)?;
            e.insert(LightAttachment { light: light.clone() });
        }
        light.set_owner(Some(owner));
        Ok(self.lights.add_light(light))
    }

    /// Detach `light` from its owner and remove it from the light list
    pub fn remove_light(&self, light: &Arc<Light>) -> bool {
        if let Some(owner) = light.owner() {
            let mut world = self.world.write();
            if let Ok(mut e) = world.get_entity_mut(owner) {
                e.remove::<LightAttachment>();
            }
        }
        light.set_owner(None);
        self.lights.remove_light(light)
    }

    // Colliders

    pub fn add_collider(&self, entity: Entity, collider: Collider) -> RenderResult<bool> {
        {
            let mut world = self.world.write();
            let mut e = world.get_entity_mut(entity).map_err(|_| RenderError::UnknownObject)?;
            e.insert(collider);
        }
        Ok(self.colliders.lock().add(entity))
    }

    pub fn remove_collider(&self, entity: Entity) -> bool {
        {
            let mut world = self.world.write();
            if let Ok(mut e) = world.get_entity_mut(entity) {
                e.remove::<Collider>();
            }
        }
        self.colliders.lock().remove(entity)
    }

    /// Hold the collider lists for the lifetime of the guard
    pub fn lock_colliders(&self) -> MutexGuard<'_, ColliderLists> {
        self.colliders.lock()
    }

    /// Ray test the pickable colliders, nearest hit first
    pub fn pick_objects(&self, origin: Vec3, direction: Vec3) -> Vec<PickHit> {
        let world = self.world.read();
        let candidates: Vec<Entity> = {
            let colliders = self.colliders.lock();
            if self.pick_visible_only() {
                colliders.visible().to_vec()
            } else {
                colliders.all().to_vec()
            }
        };

        let mut hits: Vec<PickHit> = candidates
            .into_iter()
            .filter_map(|entity| {
                let collider = world.get::<Collider>(entity)?;
                let matrix = world_matrix(&world, entity)?;
                let distance = collider.intersect(&matrix, origin, direction)?;
                Some(PickHit {
                    entity,
                    distance,
                    point: origin + direction * distance,
                })
            })
            .collect();
        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        hits
    }

    // Stats

    pub fn attach_stats(&self, stats: Arc<RenderStats>) {
        *self.stats.write() = Some(stats);
    }

    /// Draw calls of the last camera render, 0 when no renderer is attached
    pub fn number_draw_calls(&self) -> u32 {
        self.stats.read().as_ref().map(|s| s.draw_calls()).unwrap_or(0)
    }

    /// Triangles of the last camera render, 0 when no renderer is attached
    pub fn number_triangles(&self) -> u32 {
        self.stats.read().as_ref().map(|s| s.triangles()).unwrap_or(0)
    }
}

impl Default for Scene {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hierarchy_and_world_matrix() {
        let scene = Scene::new();
        let parent = scene.add_object("parent");
        let child = scene.add_child(parent, "child").unwrap();
        scene
            .set_transform(parent, Transform::from_position(Vec3::new(1.0, 0.0, 0.0)))
            .unwrap();
        scene
            .set_transform(child, Transform::from_position(Vec3::new(0.0, 2.0, 0.0)))
            .unwrap();

        let m = scene.world_matrix(child).unwrap();
        assert!((m.transform_point3(Vec3::ZERO) - Vec3::new(1.0, 2.0, 0.0)).length() < 1e-6);
        assert_eq!(scene.descendants(scene.root()), vec![parent, child]);
    }

    #[test]
    fn removing_subtree_drops_colliders() {
        let scene = Scene::new();
        let parent = scene.add_object("parent");
        let child = scene.add_child(parent, "child").unwrap();
        scene.add_collider(child, Collider::sphere(1.0)).unwrap();
        assert_eq!(scene.lock_colliders().all().len(), 1);

        assert!(scene.remove_object(parent));
        assert!(scene.lock_colliders().all().is_empty());
        assert!(scene.children(scene.root()).is_empty());
        assert!(!scene.remove_object(parent));
    }

    #[test]
    fn picking_sorts_by_distance() {
        let scene = Scene::new();
        let near = scene.add_object("near");
        let far = scene.add_object("far");
        scene
            .set_transform(near, Transform::from_position(Vec3::new(0.0, 0.0, -5.0)))
            .unwrap();
        scene
            .set_transform(far, Transform::from_position(Vec3::new(0.0, 0.0, -10.0)))
            .unwrap();
        scene.add_collider(far, Collider::sphere(1.0)).unwrap();
        scene
            .add_collider(near, Collider::Box(BoundingVolume::new(Vec3::splat(-1.0), Vec3::splat(1.0))))
            .unwrap();

        let hits = scene.pick_objects(Vec3::ZERO, -Vec3::Z);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].entity, near);
        assert!((hits[0].distance - 4.0).abs() < 1e-5);

        scene.set_pick_visible_only(true);
        assert!(scene.pick_objects(Vec3::ZERO, -Vec3::Z).is_empty());
    }

    #[test]
    fn stats_default_to_zero() {
        let scene = Scene::new();
        assert_eq!(scene.number_draw_calls(), 0);
        assert_eq!(scene.number_triangles(), 0);
    }
}
