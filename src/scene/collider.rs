//! Colliders and ray picking

use crate::scene::bounds::BoundingVolume;
use bevy_ecs::prelude::*;
use glam::{Mat4, Vec3};

/// Pick shape in the owner's local space
#[derive(Component, Debug, Clone, Copy, PartialEq)]
pub enum Collider {
    Sphere { center: Vec3, radius: f32 },
    Box(BoundingVolume),
}

impl Collider {
    pub fn sphere(radius: f32) -> Self {
        Collider::Sphere {
            center: Vec3::ZERO,
            radius,
        }
    }

    /// Distance along a world space ray to the collider placed by `world`
    pub fn intersect(&self, world: &Mat4, origin: Vec3, direction: Vec3) -> Option<f32> {
        match self {
            Collider::Sphere { center, radius } => {
                let (scale, _, _) = world.to_scale_rotation_translation();
                let c = world.transform_point3(*center);
                let r = radius * scale.abs().max_element();
                intersect_sphere(c, r, origin, direction)
            }
            Collider::Box(bv) => bv.transform(world).intersect_ray(origin, direction),
        }
    }
}

fn intersect_sphere(center: Vec3, radius: f32, origin: Vec3, direction: Vec3) -> Option<f32> {
    let oc = origin - center;
    let a = direction.length_squared();
    let b = oc.dot(direction);
    let c = oc.length_squared() - radius * radius;
    let disc = b * b - a * c;
    if a == 0.0 || disc < 0.0 {
        return None;
    }
    let sqrt = disc.sqrt();
    let t0 = (-b - sqrt) / a;
    let t1 = (-b + sqrt) / a;
    if t1 < 0.0 {
        None
    } else {
        Some(t0.max(0.0))
    }
}

/// One pick result
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PickHit {
    pub entity: Entity,
    pub distance: f32,
    pub point: Vec3,
}

/// All registered colliders and the subset that survived the last cull
#[derive(Debug, Default)]
pub struct ColliderLists {
    all: Vec<Entity>,
    visible: Vec<Entity>,
}

impl ColliderLists {
    pub fn all(&self) -> &[Entity] {
        &self.all
    }

    pub fn visible(&self) -> &[Entity] {
        &self.visible
    }

    pub fn add(&mut self, entity: Entity) -> bool {
        if self.all.contains(&entity) {
            return false;
        }
        self.all.push(entity);
        true
    }

    pub fn remove(&mut self, entity: Entity) -> bool {
        let before = self.all.len();
        self.all.retain(|e| *e != entity);
        self.visible.retain(|e| *e != entity);
        self.all.len() != before
    }

    /// Replace the visible list, keeping only registered colliders
    pub fn set_visible<I: IntoIterator<Item = Entity>>(&mut self, drawn: I) {
        self.visible.clear();
        for entity in drawn {
            if self.all.contains(&entity) && !self.visible.contains(&entity) {
                self.visible.push(entity);
            }
        }
    }

    pub fn visible_is_subset(&self) -> bool {
        self.visible.iter().all(|e| self.all.contains(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sphere_hit_distance() {
        let world = Mat4::from_translation(Vec3::new(0.0, 0.0, -10.0));
        let t = Collider::sphere(1.0)
            .intersect(&world, Vec3::ZERO, -Vec3::Z)
            .unwrap();
        assert!((t - 9.0).abs() < 1e-5);

        let scaled = Mat4::from_scale(Vec3::splat(3.0));
        let t = Collider::sphere(1.0)
            .intersect(&scaled, Vec3::new(0.0, 0.0, 10.0), -Vec3::Z)
            .unwrap();
        assert!((t - 7.0).abs() < 1e-5);
    }

    #[test]
    fn visible_stays_subset() {
        let mut world = World::new();
        let a = world.spawn_empty().id();
        let b = world.spawn_empty().id();
        let mut lists = ColliderLists::default();
        lists.add(a);
        assert!(!lists.add(a));
        lists.set_visible([a, b]);
        assert_eq!(lists.visible(), &[a]);
        lists.remove(a);
        assert!(lists.visible().is_empty());
        assert!(lists.visible_is_subset());
    }
}
