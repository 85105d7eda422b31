//! Scene object components

use crate::backend::types::{CompareFunction, CullMode, PrimitiveTopology, StencilOperation};
use crate::backend::QueryHandle;
use crate::render::{DeleteQueue, GpuHandle, ShaderType};
use crate::resources::{Mesh, SharedMaterial};
use bevy_ecs::prelude::*;
use bitflags::bitflags;
use std::sync::Arc;

/// Parent and child links of a scene object
#[derive(Component, Debug, Clone, Default)]
pub struct Hierarchy {
    pub parent: Option<Entity>,
    pub children: Vec<Entity>,
}

/// Identity and visibility flags of a scene object
#[derive(Component, Debug, Clone)]
pub struct ObjectInfo {
    pub name: String,
    /// Disabled objects and their subtrees are never drawn
    pub enabled: bool,
    /// Cleared by occlusion culling when the last query passed no samples
    pub visible: bool,
    /// Squared camera distance range in which the object is drawn
    pub lod_range: Option<(f32, f32)>,
}

impl ObjectInfo {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            enabled: true,
            visible: true,
            lod_range: None,
        }
    }

    /// Set a LOD range in camera distance units (not squared)
    pub fn with_lod(mut self, min: f32, max: f32) -> Self {
        self.lod_range = Some((min * min, max * max));
        self
    }

    pub fn in_lod_range(&self, distance_sq: f32) -> bool {
        match self.lod_range {
            Some((min, max)) => distance_sq >= min && distance_sq < max,
            None => true,
        }
    }
}

bitflags! {
    /// Which eyes draw an object
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RenderMask: u32 {
        const LEFT = 1;
        const RIGHT = 2;
        const BOTH = Self::LEFT.bits() | Self::RIGHT.bits();
    }
}

/// Draw queue constants. Lower values draw first.
pub struct RenderingOrder;

impl RenderingOrder {
    pub const STENCIL: i32 = 500;
    pub const BACKGROUND: i32 = 1000;
    pub const GEOMETRY: i32 = 2000;
    pub const TRANSPARENT: i32 = 3000;
    pub const OVERLAY: i32 = 4000;
}

/// Face culling of one pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CullFace {
    #[default]
    Back,
    Front,
    None,
}

impl From<CullFace> for CullMode {
    fn from(face: CullFace) -> Self {
        match face {
            CullFace::Back => CullMode::Back,
            CullFace::Front => CullMode::Front,
            CullFace::None => CullMode::None,
        }
    }
}

/// One material pass of a render data
#[derive(Debug, Clone)]
pub struct RenderPass {
    pub material: Option<SharedMaterial>,
    pub cull_face: CullFace,
    /// Shader used instead of the material's own
    pub shader: Option<ShaderType>,
}

impl RenderPass {
    pub fn new(material: SharedMaterial) -> Self {
        Self {
            material: Some(material),
            cull_face: CullFace::Back,
            shader: None,
        }
    }

    pub fn with_cull_face(mut self, cull_face: CullFace) -> Self {
        self.cull_face = cull_face;
        self
    }

    /// Shader this pass renders with, if it has a material
    pub fn shader_type(&self) -> Option<ShaderType> {
        self.shader
            .or_else(|| self.material.as_ref().map(|m| m.read().shader_type()))
    }
}

/// Polygon offset applied while drawing
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PolygonOffset {
    pub factor: f32,
    pub units: f32,
}

/// Stencil test of a render data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StencilTest {
    pub compare: CompareFunction,
    pub reference: u32,
    pub read_mask: u32,
    pub write_mask: u32,
    pub fail_op: StencilOperation,
    pub depth_fail_op: StencilOperation,
    pub pass_op: StencilOperation,
}

impl Default for StencilTest {
    fn default() -> Self {
        Self {
            compare: CompareFunction::Always,
            reference: 0,
            read_mask: 0xff,
            write_mask: 0xff,
            fail_op: StencilOperation::Keep,
            depth_fail_op: StencilOperation::Keep,
            pass_op: StencilOperation::Keep,
        }
    }
}

/// Drawable unit of a scene object
#[derive(Component, Debug, Clone)]
pub struct RenderData {
    pub mesh: Option<Arc<Mesh>>,
    pub passes: Vec<RenderPass>,
    pub render_mask: RenderMask,
    pub rendering_order: i32,
    pub offset: Option<PolygonOffset>,
    pub depth_test: bool,
    pub depth_mask: bool,
    pub alpha_blend: bool,
    pub alpha_to_coverage: bool,
    pub cast_shadows: bool,
    pub draw_mode: PrimitiveTopology,
    pub stencil: Option<StencilTest>,
    /// Squared distance from the camera, written by culling
    pub camera_distance: f32,
}

impl Default for RenderData {
    fn default() -> Self {
        Self {
            mesh: None,
            passes: Vec::new(),
            render_mask: RenderMask::BOTH,
            rendering_order: RenderingOrder::GEOMETRY,
            offset: None,
            depth_test: true,
            depth_mask: true,
            alpha_blend: false,
            alpha_to_coverage: false,
            cast_shadows: true,
            draw_mode: PrimitiveTopology::TriangleList,
            stencil: None,
            camera_distance: 0.0,
        }
    }
}

impl RenderData {
    pub fn new(mesh: Arc<Mesh>, material: SharedMaterial) -> Self {
        Self {
            mesh: Some(mesh),
            passes: vec![RenderPass::new(material)],
            ..Default::default()
        }
    }

    pub fn with_order(mut self, order: i32) -> Self {
        self.rendering_order = order;
        self
    }

    pub fn with_pass(mut self, pass: RenderPass) -> Self {
        self.passes.push(pass);
        self
    }

    pub fn with_alpha_blend(mut self, enabled: bool) -> Self {
        self.alpha_blend = enabled;
        self
    }

    pub fn with_cast_shadows(mut self, enabled: bool) -> Self {
        self.cast_shadows = enabled;
        self
    }

    /// First pass material
    pub fn material(&self) -> Option<&SharedMaterial> {
        self.passes.first().and_then(|p| p.material.as_ref())
    }

    /// Mesh, at least one pass with a material, and a non-empty render mask
    pub fn is_drawable(&self) -> bool {
        self.mesh.is_some()
            && !self.render_mask.is_empty()
            && self.passes.iter().any(|p| p.material.is_some())
    }

    /// Transparent queue, drawn back to front
    pub fn is_transparent(&self) -> bool {
        self.rendering_order >= RenderingOrder::TRANSPARENT
            && self.rendering_order < RenderingOrder::OVERLAY
    }
}

/// Backend occlusion query owned by one object, released through the delete queue
#[derive(Debug)]
pub struct OcclusionQuery {
    handle: QueryHandle,
    queue: DeleteQueue,
}

impl OcclusionQuery {
    pub fn new(handle: QueryHandle, queue: DeleteQueue) -> Self {
        Self { handle, queue }
    }

    pub fn handle(&self) -> QueryHandle {
        self.handle
    }
}

impl Drop for OcclusionQuery {
    fn drop(&mut self) {
        self.queue.push(GpuHandle::Query(self.handle));
    }
}

/// Occlusion query bookkeeping of one object. The query lives across frames.
#[derive(Component, Debug, Default)]
pub struct OcclusionState {
    pub query: Option<OcclusionQuery>,
    /// A query was issued and its result has not been read yet
    pub query_issued: bool,
}

/// Links a scene object to a light so the light follows the object
#[derive(Component, Debug, Clone)]
pub struct LightAttachment {
    pub light: Arc<crate::light::Light>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lod_range_uses_squared_distance() {
        let info = ObjectInfo::new("tree").with_lod(10.0, 20.0);
        assert!(!info.in_lod_range(9.0 * 9.0));
        assert!(info.in_lod_range(15.0 * 15.0));
        assert!(!info.in_lod_range(20.0 * 20.0));
    }

    #[test]
    fn empty_render_data_is_not_drawable() {
        let data = RenderData::default();
        assert!(!data.is_drawable());
        assert_eq!(data.render_mask, RenderMask::BOTH);
    }
}
