//! Bounding volumes and frustum tests

use glam::{Mat4, Vec3, Vec4};

/// Axis aligned bounding box
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingVolume {
    pub min: Vec3,
    pub max: Vec3,
}

impl Default for BoundingVolume {
    fn default() -> Self {
        Self::empty()
    }
}

impl BoundingVolume {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Inverted box that any `expand` replaces
    pub fn empty() -> Self {
        Self {
            min: Vec3::splat(f32::MAX),
            max: Vec3::splat(f32::MIN),
        }
    }

    pub fn from_points<I: IntoIterator<Item = Vec3>>(points: I) -> Self {
        let mut bv = Self::empty();
        for p in points {
            bv.expand_point(p);
        }
        bv
    }

    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
    }

    /// Empty or zero extent along every axis
    pub fn is_degenerate(&self) -> bool {
        self.is_empty() || (self.max - self.min).max_element() <= f32::EPSILON
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn extent(&self) -> Vec3 {
        self.max - self.min
    }

    pub fn radius(&self) -> f32 {
        if self.is_empty() {
            0.0
        } else {
            self.extent().length() * 0.5
        }
    }

    pub fn expand_point(&mut self, p: Vec3) {
        self.min = self.min.min(p);
        self.max = self.max.max(p);
    }

    pub fn expand(&mut self, other: &BoundingVolume) {
        if other.is_empty() {
            return;
        }
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn corners(&self) -> [Vec3; 8] {
        let (a, b) = (self.min, self.max);
        [
            Vec3::new(a.x, a.y, a.z),
            Vec3::new(b.x, a.y, a.z),
            Vec3::new(a.x, b.y, a.z),
            Vec3::new(b.x, b.y, a.z),
            Vec3::new(a.x, a.y, b.z),
            Vec3::new(b.x, a.y, b.z),
            Vec3::new(a.x, b.y, b.z),
            Vec3::new(b.x, b.y, b.z),
        ]
    }

    /// Box around the transformed corners
    pub fn transform(&self, matrix: &Mat4) -> BoundingVolume {
        if self.is_empty() {
            return *self;
        }
        BoundingVolume::from_points(self.corners().iter().map(|c| matrix.transform_point3(*c)))
    }

    pub fn contains_point(&self, p: Vec3) -> bool {
        p.cmpge(self.min).all() && p.cmple(self.max).all()
    }

    /// Distance along the ray to the first hit, slab method
    pub fn intersect_ray(&self, origin: Vec3, direction: Vec3) -> Option<f32> {
        if self.is_empty() {
            return None;
        }
        let inv = direction.recip();
        let t0 = (self.min - origin) * inv;
        let t1 = (self.max - origin) * inv;
        let near = t0.min(t1).max_element();
        let far = t0.max(t1).min_element();
        if far < near.max(0.0) {
            None
        } else {
            Some(near.max(0.0))
        }
    }
}

/// Outcome of a box against frustum test
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Containment {
    Outside,
    Intersecting,
    Inside,
}

/// Plane bits set once a box is known to be inside every plane
pub const ALL_PLANES: u8 = 0b11_1111;

/// Six planes `(a, b, c, d)` with normals pointing inward:
/// left, right, bottom, top, near, far
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frustum {
    pub planes: [Vec4; 6],
}

impl Frustum {
    /// Extract planes from a view-projection matrix with a `[0, 1]` depth range
    pub fn from_matrix(view_proj: &Mat4) -> Self {
        let r0 = view_proj.row(0);
        let r1 = view_proj.row(1);
        let r2 = view_proj.row(2);
        let r3 = view_proj.row(3);

        let mut planes = [r3 + r0, r3 - r0, r3 + r1, r3 - r1, r2, r3 - r2];
        for plane in &mut planes {
            let len = plane.truncate().length();
            if len > 0.0 {
                *plane /= len;
            }
        }
        Self { planes }
    }

    pub fn distance(&self, plane: usize, p: Vec3) -> f32 {
        self.planes[plane].dot(p.extend(1.0))
    }

    /// Test a box against the planes not yet set in `plane_mask`.
    ///
    /// A plane with all eight corners in front sets its bit in `plane_mask` so
    /// children can skip it. `Inside` means every plane bit is set.
    pub fn test_aabb(&self, bv: &BoundingVolume, plane_mask: &mut u8) -> Containment {
        if bv.is_empty() {
            return Containment::Outside;
        }
        let corners = bv.corners();
        for i in 0..6 {
            let bit = 1u8 << i;
            if *plane_mask & bit != 0 {
                continue;
            }
            let in_front = corners.iter().filter(|c| self.distance(i, **c) > 0.0).count();
            if in_front == 0 {
                return Containment::Outside;
            }
            if in_front == 8 {
                *plane_mask |= bit;
            }
        }
        if *plane_mask == ALL_PLANES {
            Containment::Inside
        } else {
            Containment::Intersecting
        }
    }

    /// Test without carrying a mask
    pub fn classify(&self, bv: &BoundingVolume) -> Containment {
        let mut mask = 0;
        self.test_aabb(bv, &mut mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera_frustum() -> Frustum {
        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, Vec3::Y);
        let proj = Mat4::perspective_rh(60f32.to_radians(), 1.0, 0.1, 50.0);
        Frustum::from_matrix(&(proj * view))
    }

    #[test]
    fn box_classification() {
        let frustum = camera_frustum();
        let inside = BoundingVolume::new(Vec3::splat(-0.5), Vec3::splat(0.5));
        assert_eq!(frustum.classify(&inside), Containment::Inside);

        let behind_far = BoundingVolume::new(Vec3::new(-1.0, -1.0, -100.0), Vec3::new(1.0, 1.0, -90.0));
        assert_eq!(frustum.classify(&behind_far), Containment::Outside);

        let straddling = BoundingVolume::new(Vec3::new(-100.0, -0.5, -0.5), Vec3::new(0.0, 0.5, 0.5));
        assert_eq!(frustum.classify(&straddling), Containment::Intersecting);
    }

    #[test]
    fn plane_mask_accumulates() {
        let frustum = camera_frustum();
        let straddling = BoundingVolume::new(Vec3::new(-100.0, -0.5, -0.5), Vec3::new(0.0, 0.5, 0.5));
        let mut mask = 0;
        frustum.test_aabb(&straddling, &mut mask);
        // only the left plane is crossed
        assert_eq!(mask, ALL_PLANES & !1);
    }

    #[test]
    fn transform_and_degenerate() {
        let bv = BoundingVolume::new(Vec3::splat(-1.0), Vec3::splat(1.0));
        let moved = bv.transform(&Mat4::from_translation(Vec3::X * 10.0));
        assert_eq!(moved.center(), Vec3::new(10.0, 0.0, 0.0));
        assert!(BoundingVolume::new(Vec3::ONE, Vec3::ONE).is_degenerate());
        assert!(BoundingVolume::empty().is_degenerate());
        assert!(!bv.is_degenerate());
    }

    #[test]
    fn ray_hits() {
        let bv = BoundingVolume::new(Vec3::splat(-1.0), Vec3::splat(1.0));
        let t = bv.intersect_ray(Vec3::new(0.0, 0.0, 5.0), -Vec3::Z).unwrap();
        assert!((t - 4.0).abs() < 1e-5);
        assert!(bv.intersect_ray(Vec3::new(0.0, 5.0, 5.0), -Vec3::Z).is_none());
    }
}
