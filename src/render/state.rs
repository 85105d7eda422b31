//! Per pass render state

use crate::backend::types::TextureFormat;
use crate::resources::SharedMaterial;
use crate::scene::{Camera, RenderMask};

/// Viewport rectangle in pixels
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Viewport {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }
}

/// State shared by every draw of one render target activation
#[derive(Debug, Clone)]
pub struct RenderState {
    pub camera: Option<Camera>,
    pub viewport: Viewport,
    /// Rendering a shadow map: casters only, depth material
    pub shadow_pass: bool,
    /// Replaces every pass material when set
    pub material_override: Option<SharedMaterial>,
    pub is_multiview: bool,
    pub sample_count: u32,
    /// Formats of the bound destination, captured by `begin_rendering`
    pub color_format: TextureFormat,
    pub depth_format: Option<TextureFormat>,
    /// Only render data sharing a bit with this mask is drawn
    pub render_mask: RenderMask,
    pub use_stencil: bool,
    pub right_eye: bool,
}

impl Default for RenderState {
    fn default() -> Self {
        Self {
            camera: None,
            viewport: Viewport::default(),
            shadow_pass: false,
            material_override: None,
            is_multiview: false,
            sample_count: 1,
            color_format: TextureFormat::Rgba8Unorm,
            depth_format: None,
            render_mask: RenderMask::LEFT,
            use_stencil: false,
            right_eye: false,
        }
    }
}

impl RenderState {
    /// State of a shadow pass: first eye mask and the shadow material everywhere
    pub fn shadow(material: SharedMaterial) -> Self {
        Self {
            shadow_pass: true,
            material_override: Some(material),
            render_mask: RenderMask::LEFT,
            ..Default::default()
        }
    }

    /// Background color of the camera, if it clears to one
    pub fn background_color(&self) -> Option<[f32; 4]> {
        self.camera.as_ref().and_then(|c| c.background_color)
    }
}
