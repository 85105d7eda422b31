//! Scene lights: a class name plus a descriptor driven uniform bag

use crate::error::{RenderError, RenderResult};
use crate::light::{LightCamera, ShadowMap, SharedShadowMap};
use crate::render::Renderer;
use crate::resources::{SharedMaterial, Texture, UniformBlock, UniformLayout, UniformType};
use crate::scene::Scene;
use bevy_ecs::prelude::Entity;
use glam::{Mat4, Vec3, Vec4};
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;

/// Uniform written with the layer index of the light's shadow map
pub const SHADOW_MAP_INDEX: &str = "shadow_map_index";
/// Uniform written with the light's view projection matrix
pub const SHADOW_MATRIX: &str = "shadow_matrix";
/// Uniform read as the shadow camera projection
pub const PROJECTION_MATRIX: &str = "projMatrix";
pub const WORLD_POSITION: &str = "world_position";
pub const WORLD_DIRECTION: &str = "world_direction";
/// 1.0 while the light is on, 0.0 once disabled
pub const ENABLED: &str = "enabled";

#[derive(Debug)]
struct LightState {
    uniforms: UniformBlock,
    textures: BTreeMap<String, Arc<Texture>>,
    enabled: bool,
    shadow_material: Option<SharedMaterial>,
    shadow_map: Option<SharedShadowMap>,
    owner: Option<Entity>,
    world_matrix: Mat4,
}

/// A light of one class ("point", "spot", "directional", ...).
///
/// The light list assigns the index within the class. Shaders see the light
/// as `<class>s[<index>]` inside the light block.
#[derive(Debug)]
pub struct Light {
    class: String,
    /// -1 while the light is not in a list
    index: AtomicI32,
    /// Byte offset inside the shared light block
    block_offset: AtomicU32,
    state: Mutex<LightState>,
}

impl Light {
    pub fn new(class: &str, descriptor: &str) -> RenderResult<Self> {
        if class.is_empty() || !class.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(RenderError::InvalidDescriptor(format!("bad light class '{}'", class)));
        }
        let mut uniforms = UniformBlock::new(descriptor)?;
        write_enabled(&mut uniforms, true)?;
        Ok(Self {
            class: class.to_string(),
            index: AtomicI32::new(-1),
            block_offset: AtomicU32::new(0),
            state: Mutex::new(LightState {
                uniforms,
                textures: BTreeMap::new(),
                enabled: true,
                shadow_material: None,
                shadow_map: None,
                owner: None,
                world_matrix: Mat4::IDENTITY,
            }),
        })
    }

    pub fn point(color: Vec3, intensity: f32, radius: f32) -> RenderResult<Self> {
        let light = Self::new(
            "point",
            "float4 world_position; float4 color; float enabled; float intensity; float radius",
        )?;
        {
            let mut state = light.state.lock();
            state.uniforms.set_vec4("color", color.extend(1.0))?;
            state.uniforms.set_float("intensity", intensity)?;
            state.uniforms.set_float("radius", radius)?;
        }
        Ok(light)
    }

    pub fn spot(color: Vec3, intensity: f32, inner_angle: f32, outer_angle: f32) -> RenderResult<Self> {
        let light = Self::new(
            "spot",
            "float4 world_position; float4 world_direction; float4 color; float enabled; \
             float intensity; float inner_cone; float outer_cone; float shadow_map_index; mat4 shadow_matrix",
        )?;
        {
            let mut state = light.state.lock();
            state.uniforms.set_vec4("color", color.extend(1.0))?;
            state.uniforms.set_float("intensity", intensity)?;
            state.uniforms.set_float("inner_cone", inner_angle.cos())?;
            state.uniforms.set_float("outer_cone", outer_angle.cos())?;
            state.uniforms.set_float(SHADOW_MAP_INDEX, -1.0)?;
        }
        Ok(light)
    }

    /// Directional light with an orthographic shadow projection covering `extent`
    pub fn directional(color: Vec3, intensity: f32, extent: f32) -> RenderResult<Self> {
        let light = Self::new(
            "directional",
            "float4 world_direction; float4 color; float enabled; float intensity; \
             float shadow_map_index; mat4 projMatrix; mat4 shadow_matrix",
        )?;
        {
            let mut state = light.state.lock();
            state.uniforms.set_vec4("color", color.extend(1.0))?;
            state.uniforms.set_float("intensity", intensity)?;
            state.uniforms.set_float(SHADOW_MAP_INDEX, -1.0)?;
            let half = extent / 2.0;
            let proj = Mat4::orthographic_rh(-half, half, -half, half, 0.1, extent * 2.0);
            state.uniforms.set_mat4(PROJECTION_MATRIX, &proj)?;
        }
        Ok(light)
    }

    pub fn class_name(&self) -> &str {
        &self.class
    }

    /// Index within the class, `None` when not in a light list
    pub fn index(&self) -> Option<usize> {
        usize::try_from(self.index.load(Ordering::Acquire)).ok()
    }

    pub(crate) fn set_index(&self, index: Option<usize>) {
        let value = index.map(|i| i as i32).unwrap_or(-1);
        self.index.store(value, Ordering::Release);
    }

    /// Name of the light in shader code, `"<class>s[<index>]"`
    pub fn light_name(&self) -> String {
        match self.index() {
            Some(index) => format!("{}s[{}]", self.class, index),
            None => format!("{}s[?]", self.class),
        }
    }

    pub(crate) fn block_offset(&self) -> u32 {
        self.block_offset.load(Ordering::Acquire)
    }

    pub(crate) fn set_block_offset(&self, offset: u32) {
        self.block_offset.store(offset, Ordering::Release);
    }

    pub fn layout(&self) -> Arc<UniformLayout> {
        self.state.lock().uniforms.layout().clone()
    }

    /// Bytes this light occupies in the light block
    pub fn block_size(&self) -> u32 {
        self.state.lock().uniforms.size()
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    /// Switches the light on or off, writing `enabled` when the descriptor declares it
    pub fn set_enabled(&self, enabled: bool) -> RenderResult<()> {
        let mut state = self.state.lock();
        state.enabled = enabled;
        write_enabled(&mut state.uniforms, enabled)?;
        state.uniforms.mark_dirty();
        Ok(())
    }

    pub fn owner(&self) -> Option<Entity> {
        self.state.lock().owner
    }

    pub(crate) fn set_owner(&self, owner: Option<Entity>) {
        self.state.lock().owner = owner;
    }

    /// Direct access to the uniform bag
    pub fn uniforms(&self) -> MappedMutexGuard<'_, UniformBlock> {
        MutexGuard::map(self.state.lock(), |s| &mut s.uniforms)
    }

    pub fn has_uniform(&self, name: &str) -> bool {
        self.state.lock().uniforms.has_uniform(name)
    }

    pub fn set_float(&self, name: &str, value: f32) -> RenderResult<()> {
        self.uniforms().set_float(name, value)
    }

    pub fn set_vec3(&self, name: &str, value: Vec3) -> RenderResult<()> {
        self.uniforms().set_vec3(name, value)
    }

    pub fn set_vec4(&self, name: &str, value: Vec4) -> RenderResult<()> {
        self.uniforms().set_vec4(name, value)
    }

    pub fn set_int(&self, name: &str, value: i32) -> RenderResult<()> {
        self.uniforms().set_int(name, value)
    }

    pub fn set_mat4(&self, name: &str, value: &Mat4) -> RenderResult<()> {
        self.uniforms().set_mat4(name, value)
    }

    pub fn get_float(&self, name: &str) -> RenderResult<f32> {
        self.uniforms().get_float(name)
    }

    pub fn get_vec4(&self, name: &str) -> RenderResult<Vec4> {
        self.uniforms().get_vec4(name)
    }

    pub fn get_mat4(&self, name: &str) -> RenderResult<Mat4> {
        self.uniforms().get_mat4(name)
    }

    pub fn has_texture(&self, name: &str) -> bool {
        self.state.lock().textures.contains_key(name)
    }

    pub fn set_texture(&self, name: &str, texture: Arc<Texture>) {
        self.state.lock().textures.insert(name.to_string(), texture);
    }

    pub fn texture(&self, name: &str) -> RenderResult<Arc<Texture>> {
        self.state
            .lock()
            .textures
            .get(name)
            .cloned()
            .ok_or_else(|| RenderError::TextureNotFound(format!("{} on light {}", name, self.light_name())))
    }

    pub fn is_dirty(&self) -> bool {
        self.state.lock().uniforms.is_dirty()
    }

    /// Uniform bytes laid out as `layout`, clearing the dirty flag
    pub(crate) fn take_bytes(&self, layout: &UniformLayout) -> RenderResult<Vec<u8>> {
        let mut state = self.state.lock();
        let bytes = state.uniforms.pack_for(layout)?;
        state.uniforms.clear_dirty();
        Ok(bytes)
    }

    /// Material every object is drawn with in this light's shadow pass.
    /// Without one the light casts no shadow.
    pub fn set_shadow_material(&self, material: Option<SharedMaterial>) {
        let mut state = self.state.lock();
        state.shadow_material = material;
        if state.shadow_material.is_none() {
            release_shadow_map(&mut state);
        }
    }

    /// Forget the shadow layer so shaders stop sampling it
    pub(crate) fn clear_shadow_map(&self) {
        release_shadow_map(&mut self.state.lock());
    }

    pub fn casts_shadows(&self) -> bool {
        self.state.lock().shadow_material.is_some()
    }

    pub fn shadow_map(&self) -> Option<SharedShadowMap> {
        self.state.lock().shadow_map.clone()
    }

    pub fn world_matrix(&self) -> Mat4 {
        self.state.lock().world_matrix
    }

    /// Follow the owner's world matrix: writes `world_position` and
    /// `world_direction` (-Z of the matrix) when the descriptor declares them.
    pub fn update_transform(&self, world: &Mat4) -> RenderResult<()> {
        let mut state = self.state.lock();
        state.world_matrix = *world;
        let position = world.w_axis.truncate();
        let direction = (-world.z_axis.truncate()).normalize_or_zero();
        write_vector(&mut state.uniforms, WORLD_POSITION, position, 1.0)?;
        write_vector(&mut state.uniforms, WORLD_DIRECTION, direction, 0.0)?;
        Ok(())
    }

    /// Render the shadow map of this light into `layer` of the shadow atlas.
    /// Returns false when the light has no shadow material.
    pub fn make_shadow_map(
        &self,
        scene: &Scene,
        renderer: &mut Renderer,
        layer: u32,
        viewport_width: u32,
        viewport_height: u32,
    ) -> RenderResult<bool> {
        let (material, existing) = {
            let state = self.state.lock();
            match &state.shadow_material {
                Some(material) => (material.clone(), state.shadow_map.clone()),
                None => return Ok(false),
            }
        };

        let atlas = renderer.shadow_atlas()?;
        if layer >= atlas.layers() {
            return Err(RenderError::ShadowAtlasFull { max: atlas.layers() });
        }

        let shadow_map = match existing {
            Some(shadow_map) => {
                {
                    let mut map = shadow_map.lock();
                    map.set_material(material);
                    if map.layer() != layer || !Arc::ptr_eq(map.atlas(), &atlas) {
                        map.bind_layer(atlas.clone(), layer)?;
                    }
                }
                shadow_map
            }
            None => {
                let map = Arc::new(Mutex::new(ShadowMap::new(atlas.clone(), layer, material)?));
                self.state.lock().shadow_map = Some(map.clone());
                map
            }
        };

        let camera = LightCamera::new(self);
        {
            let mut state = self.state.lock();
            if state.uniforms.has_uniform(SHADOW_MAP_INDEX) {
                state.uniforms.set_float(SHADOW_MAP_INDEX, layer as f32)?;
            }
            if state.uniforms.has_uniform(SHADOW_MATRIX) {
                state.uniforms.set_mat4(SHADOW_MATRIX, &camera.view_projection())?;
            }
        }

        let mut map = shadow_map.lock();
        map.set_viewport(viewport_width, viewport_height);
        renderer.render_shadow_map(scene, &camera, &mut map)?;
        Ok(true)
    }

    pub(crate) fn projection_override(&self) -> Option<Mat4> {
        let state = self.state.lock();
        match state.uniforms.layout().entry(PROJECTION_MATRIX) {
            Some(entry) if entry.ty == UniformType::Mat4 && entry.count == 0 => {
                state.uniforms.get_mat4(PROJECTION_MATRIX).ok()
            }
            _ => None,
        }
    }
}

fn release_shadow_map(state: &mut LightState) {
    state.shadow_map = None;
    // only a layer change dirties the block
    if matches!(state.uniforms.get_float(SHADOW_MAP_INDEX), Ok(index) if index >= 0.0) {
        if let Err(e) = state.uniforms.set_float(SHADOW_MAP_INDEX, -1.0) {
            log::warn!("Failed to reset shadow map index: {}", e);
        }
    }
}

fn write_enabled(uniforms: &mut UniformBlock, enabled: bool) -> RenderResult<()> {
    match uniforms.layout().entry(ENABLED).map(|e| (e.ty, e.count)) {
        Some((UniformType::Float, 0)) => uniforms.set_float(ENABLED, if enabled { 1.0 } else { 0.0 }),
        _ => Ok(()),
    }
}

fn write_vector(uniforms: &mut UniformBlock, name: &str, value: Vec3, w: f32) -> RenderResult<()> {
    match uniforms.layout().entry(name).map(|e| (e.ty, e.count)) {
        Some((UniformType::Float4, 0)) => uniforms.set_vec4(name, value.extend(w)),
        Some((UniformType::Float3, 0)) => uniforms.set_vec3(name, value),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_follows_index() {
        let light = Light::point(Vec3::ONE, 1.0, 10.0).unwrap();
        assert_eq!(light.index(), None);
        light.set_index(Some(2));
        assert_eq!(light.light_name(), "points[2]");
    }

    #[test]
    fn rejects_class_names_unusable_in_shaders() {
        assert!(Light::new("spot light", "float4 color").is_err());
        assert!(Light::new("", "float4 color").is_err());
    }

    #[test]
    fn transform_writes_declared_vectors() {
        let light = Light::spot(Vec3::ONE, 2.0, 0.3, 0.5).unwrap();
        let world = Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0));
        light.update_transform(&world).unwrap();
        assert_eq!(light.get_vec4(WORLD_POSITION).unwrap(), Vec4::new(1.0, 2.0, 3.0, 1.0));
        assert_eq!(light.get_vec4(WORLD_DIRECTION).unwrap(), Vec4::new(0.0, 0.0, -1.0, 0.0));

        // point lights have no direction, nothing to write
        let point = Light::point(Vec3::ONE, 1.0, 5.0).unwrap();
        point.update_transform(&world).unwrap();
        assert!(!point.has_uniform(WORLD_DIRECTION));
    }

    #[test]
    fn missing_keys_are_errors() {
        let light = Light::point(Vec3::ONE, 1.0, 5.0).unwrap();
        assert!(matches!(light.set_float("nope", 1.0), Err(RenderError::UniformNotFound(_))));
        assert!(matches!(light.texture("cookie"), Err(RenderError::TextureNotFound(_))));
        assert!(!light.has_texture("cookie"));
    }

    #[test]
    fn dirty_flag_clears_on_take() {
        let light = Light::point(Vec3::ONE, 1.0, 5.0).unwrap();
        assert!(light.is_dirty());
        let bytes = light.take_bytes(&light.layout()).unwrap();
        assert_eq!(bytes.len() as u32, light.block_size());
        assert!(!light.is_dirty());
        light.set_float("intensity", 3.0).unwrap();
        assert!(light.is_dirty());
    }

    #[test]
    fn enabled_flag_reaches_the_uniforms() {
        for light in [
            Light::point(Vec3::ONE, 1.0, 5.0).unwrap(),
            Light::spot(Vec3::ONE, 1.0, 0.3, 0.5).unwrap(),
            Light::directional(Vec3::ONE, 1.0, 20.0).unwrap(),
        ] {
            assert_eq!(light.get_float(ENABLED).unwrap(), 1.0, "{}", light.class_name());
            light.take_bytes(&light.layout()).unwrap();
            light.set_enabled(false).unwrap();
            assert!(!light.is_enabled());
            assert!(light.is_dirty());
            assert_eq!(light.get_float(ENABLED).unwrap(), 0.0);
            light.set_enabled(true).unwrap();
            assert_eq!(light.get_float(ENABLED).unwrap(), 1.0);
        }

        // custom descriptors without the field only track the flag
        let bare = Light::new("area", "float4 color").unwrap();
        bare.set_enabled(false).unwrap();
        assert!(!bare.is_enabled());
    }

    #[test]
    fn removing_shadow_material_resets_the_layer() {
        let sun = Light::directional(Vec3::ONE, 1.0, 20.0).unwrap();
        sun.set_float(SHADOW_MAP_INDEX, 2.0).unwrap();
        sun.set_shadow_material(None);
        assert!(!sun.casts_shadows());
        assert!(sun.shadow_map().is_none());
        assert_eq!(sun.get_float(SHADOW_MAP_INDEX).unwrap(), -1.0);
    }

    #[test]
    fn projection_override_reads_proj_matrix() {
        let directional = Light::directional(Vec3::ONE, 1.0, 20.0).unwrap();
        assert!(directional.projection_override().is_some());
        let point = Light::point(Vec3::ONE, 1.0, 5.0).unwrap();
        assert!(point.projection_override().is_none());
    }
}
