//! Camera system

use crate::scene::object::RenderMask;
use bevy_ecs::prelude::Entity;
use bytemuck::{Pod, Zeroable};
use glam::Mat4;

/// Camera projection type
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Projection {
    Perspective {
        fov_y: f32,
        aspect: f32,
        near: f32,
        far: f32,
    },
    Orthographic {
        left: f32,
        right: f32,
        bottom: f32,
        top: f32,
        near: f32,
        far: f32,
    },
    /// Matrix supplied by the owner, e.g. a light's `projMatrix` uniform
    Custom(Mat4),
}

impl Default for Projection {
    fn default() -> Self {
        Projection::Perspective {
            fov_y: 90f32.to_radians(),
            aspect: 1.0,
            near: 0.1,
            far: 1000.0,
        }
    }
}

impl Projection {
    pub fn perspective(fov_y_degrees: f32, aspect: f32, near: f32, far: f32) -> Self {
        Projection::Perspective {
            fov_y: fov_y_degrees.to_radians(),
            aspect,
            near,
            far,
        }
    }

    pub fn orthographic(width: f32, height: f32, near: f32, far: f32) -> Self {
        let half_w = width / 2.0;
        let half_h = height / 2.0;
        Projection::Orthographic {
            left: -half_w,
            right: half_w,
            bottom: -half_h,
            top: half_h,
            near,
            far,
        }
    }

    pub fn matrix(&self) -> Mat4 {
        match self {
            Projection::Perspective {
                fov_y,
                aspect,
                near,
                far,
            } => Mat4::perspective_rh(*fov_y, *aspect, *near, *far),
            Projection::Orthographic {
                left,
                right,
                bottom,
                top,
                near,
                far,
            } => Mat4::orthographic_rh(*left, *right, *bottom, *top, *near, *far),
            Projection::Custom(m) => *m,
        }
    }

    pub fn set_aspect(&mut self, aspect: f32) {
        if let Projection::Perspective { aspect: a, .. } = self {
            *a = aspect;
        }
    }
}

/// Camera attached to a scene object.
///
/// The view matrix is the inverse of the owner's world matrix. A camera without
/// an owner, or whose owner was removed, renders nothing.
#[derive(Debug, Clone)]
pub struct Camera {
    pub owner: Option<Entity>,
    pub projection: Projection,
    pub background_color: Option<[f32; 4]>,
    pub render_mask: RenderMask,
}

impl Camera {
    pub fn new(owner: Entity, projection: Projection) -> Self {
        Self {
            owner: Some(owner),
            projection,
            background_color: None,
            render_mask: RenderMask::LEFT,
        }
    }

    /// Camera that is not attached to any object
    pub fn detached(projection: Projection) -> Self {
        Self {
            owner: None,
            projection,
            background_color: None,
            render_mask: RenderMask::LEFT,
        }
    }

    pub fn with_background(mut self, color: [f32; 4]) -> Self {
        self.background_color = Some(color);
        self
    }

    pub fn with_render_mask(mut self, mask: RenderMask) -> Self {
        self.render_mask = mask;
        self
    }

    /// Get the projection matrix
    pub fn projection_matrix(&self) -> Mat4 {
        self.projection.matrix()
    }
}

/// Per draw transform data, one slot of the dynamic transform buffer
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct TransformUniform {
    pub model: Mat4,
    pub view: Mat4,
    pub proj: Mat4,
    pub model_view: Mat4,
    pub mvp: Mat4,
    /// Inverse transpose of `model_view`
    pub normal_matrix: Mat4,
    pub view_inverse: Mat4,
    /// x: 0 left eye, 1 right eye
    pub eye: [f32; 4],
}

impl TransformUniform {
    pub fn new(model: Mat4, view: Mat4, proj: Mat4, right_eye: bool) -> Self {
        let model_view = view * model;
        Self {
            model,
            view,
            proj,
            model_view,
            mvp: proj * model_view,
            normal_matrix: model_view.inverse().transpose(),
            view_inverse: view.inverse(),
            eye: [if right_eye { 1.0 } else { 0.0 }, 0.0, 0.0, 0.0],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Vec3, Vec4};

    #[test]
    fn transform_uniform_composes_mvp() {
        let model = Mat4::from_translation(Vec3::new(0.0, 0.0, -2.0));
        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 3.0), Vec3::ZERO, Vec3::Y);
        let proj = Projection::default().matrix();
        let u = TransformUniform::new(model, view, proj, false);
        let p = u.mvp * Vec4::new(0.0, 0.0, 0.0, 1.0);
        let expected = proj * view * model * Vec4::new(0.0, 0.0, 0.0, 1.0);
        assert!((p - expected).length() < 1e-5);
        assert_eq!(std::mem::size_of::<TransformUniform>(), 7 * 64 + 16);
    }
}
