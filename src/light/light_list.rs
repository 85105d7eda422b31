//! Light list
//!
//! Lights are grouped by class and indexed densely within the class. All light
//! uniforms live in one shared buffer, laid out class by class in the same order
//! as the `Lights_ubo` declaration handed to the shader generator.

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::error::RenderResult;
use crate::light::{Light, SharedShadowMap};
use crate::render::{DeleteQueue, GpuHandle, Renderer};
use crate::resources::UniformLayout;
use crate::scene::Scene;
use bitflags::bitflags;
use parking_lot::ReentrantMutex;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::Arc;

bitflags! {
    /// What changed since the light block was last written
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct LightDirty: u8 {
        const LIGHT_ADDED = 1 << 0;
        const LIGHT_REMOVED = 1 << 1;
        const SHADOW_CHANGED = 1 << 2;
        /// The light block declaration changed, shaders using it must be rebuilt
        const REBUILD_SHADERS = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LightBuffer {
    buffer: BufferHandle,
    size: u64,
}

#[derive(Debug, Default)]
struct State {
    classes: BTreeMap<String, Vec<Arc<Light>>>,
    dirty: LightDirty,
    /// Bytes the current offsets need
    required: u64,
    block: Option<LightBuffer>,
    /// Per shader copies when the shared block is disabled
    shader_buffers: HashMap<String, LightBuffer>,
    shadow_maps: u32,
    queue: Option<DeleteQueue>,
}

impl State {
    fn snapshot(&self) -> Vec<Arc<Light>> {
        self.classes.values().flatten().cloned().collect()
    }

    /// Layout every light of `lights` is packed as: the first light's
    fn class_layout(lights: &[Arc<Light>]) -> Arc<UniformLayout> {
        lights.first().map(|l| l.layout()).unwrap_or_default()
    }

    fn stride(layout: &UniformLayout) -> u32 {
        layout.size().max(16)
    }

    /// Walk classes then indices and pack offsets back to back
    fn compute_offsets(&mut self) {
        let mut offset = 0u32;
        for lights in self.classes.values() {
            let stride = Self::stride(&Self::class_layout(lights));
            for light in lights {
                light.set_block_offset(offset);
                offset += stride;
            }
        }
        self.required = u64::from(offset.max(16));
    }

    /// Bytes of every light at its block offset
    fn pack_all(&self) -> RenderResult<Vec<u8>> {
        let mut bytes = vec![0u8; self.required as usize];
        for lights in self.classes.values() {
            let layout = Self::class_layout(lights);
            for light in lights {
                let data = light.take_bytes(&layout)?;
                let offset = light.block_offset() as usize;
                bytes[offset..offset + data.len()].copy_from_slice(&data);
            }
        }
        Ok(bytes)
    }

    fn ensure_buffer<B: GraphicsBackend + ?Sized>(
        backend: &mut B,
        queue: &DeleteQueue,
        slot: Option<LightBuffer>,
        required: u64,
        label: &str,
    ) -> RenderResult<(LightBuffer, bool)> {
        if let Some(existing) = slot {
            if existing.size >= required {
                return Ok((existing, false));
            }
            queue.push(GpuHandle::Buffer(existing.buffer));
        }
        let buffer = backend.create_buffer(&BufferDescriptor {
            label: Some(label.to_string()),
            size: required,
            usage: BufferUsage::UNIFORM | BufferUsage::COPY_DST,
        })?;
        log::debug!("{}: allocated {} bytes", label, required);
        Ok((
            LightBuffer {
                buffer,
                size: required,
            },
            true,
        ))
    }
}

/// Every light of a scene, guarded by a recursive lock
#[derive(Debug)]
pub struct LightList {
    use_block: bool,
    inner: ReentrantMutex<RefCell<State>>,
}

impl LightList {
    /// `use_block` selects one shared light buffer over per shader copies
    pub fn new(use_block: bool) -> Self {
        Self {
            use_block,
            inner: ReentrantMutex::new(RefCell::new(State::default())),
        }
    }

    pub fn uses_block(&self) -> bool {
        self.use_block
    }

    /// Add `light` at the end of its class. False when it is already listed.
    pub fn add_light(&self, light: Arc<Light>) -> bool {
        let guard = self.inner.lock();
        let mut state = guard.borrow_mut();
        let lights = state.classes.entry(light.class_name().to_string()).or_default();
        if lights.iter().any(|l| Arc::ptr_eq(l, &light)) {
            return false;
        }
        light.set_index(Some(lights.len()));
        log::debug!("Added light {}", light.light_name());
        let casts_shadows = light.casts_shadows();
        lights.push(light);

        state.dirty |= LightDirty::LIGHT_ADDED | LightDirty::REBUILD_SHADERS;
        if casts_shadows {
            state.dirty |= LightDirty::SHADOW_CHANGED;
        }
        true
    }

    /// Remove `light` and close the gap in its class. False when it is not listed.
    pub fn remove_light(&self, light: &Arc<Light>) -> bool {
        let guard = self.inner.lock();
        let mut state = guard.borrow_mut();
        let class = light.class_name();
        let Some(lights) = state.classes.get_mut(class) else {
            return false;
        };
        let Some(position) = lights.iter().position(|l| Arc::ptr_eq(l, light)) else {
            return false;
        };

        lights.remove(position);
        for (index, l) in lights.iter().enumerate().skip(position) {
            l.set_index(Some(index));
        }
        if lights.is_empty() {
            state.classes.remove(class);
        }
        light.set_index(None);
        log::debug!("Removed {} light, {} left in class", class, state.classes.get(class).map_or(0, Vec::len));

        state.dirty |= LightDirty::LIGHT_REMOVED | LightDirty::REBUILD_SHADERS;
        if light.casts_shadows() {
            state.dirty |= LightDirty::SHADOW_CHANGED;
        }
        true
    }

    pub fn light_count(&self) -> usize {
        let guard = self.inner.lock();
        let count = guard.borrow().classes.values().map(Vec::len).sum();
        count
    }

    pub fn class_count(&self) -> usize {
        let guard = self.inner.lock();
        let count = guard.borrow().classes.len();
        count
    }

    /// Lights of one class in index order
    pub fn class_lights(&self, class: &str) -> Vec<Arc<Light>> {
        let guard = self.inner.lock();
        let lights = guard.borrow().classes.get(class).cloned().unwrap_or_default();
        lights
    }

    /// Every light, class by class in index order
    pub fn lights(&self) -> Vec<Arc<Light>> {
        let guard = self.inner.lock();
        let lights = guard.borrow().snapshot();
        lights
    }

    /// Call `f` for every light while holding the list lock. `f` may call back
    /// into the list; lights it adds or removes are not visited in this pass.
    pub fn for_each_light<F: FnMut(&Arc<Light>)>(&self, mut f: F) {
        let guard = self.inner.lock();
        let lights = guard.borrow().snapshot();
        for light in &lights {
            f(light);
        }
    }

    pub fn dirty(&self) -> LightDirty {
        let guard = self.inner.lock();
        let dirty = guard.borrow().dirty;
        dirty
    }

    pub fn needs_shader_rebuild(&self) -> bool {
        self.dirty().contains(LightDirty::REBUILD_SHADERS)
    }

    /// Called once shaders were regenerated from `make_shader_block`
    pub fn shaders_rebuilt(&self) {
        let guard = self.inner.lock();
        guard.borrow_mut().dirty.remove(LightDirty::REBUILD_SHADERS);
    }

    /// Shared buffer and its size, once allocated
    pub fn block_buffer(&self) -> Option<(BufferHandle, u64)> {
        let guard = self.inner.lock();
        let block = guard.borrow().block.map(|b| (b.buffer, b.size));
        block
    }

    /// Bytes the light block currently needs
    pub fn required_size(&self) -> u64 {
        let guard = self.inner.lock();
        let required = guard.borrow().required;
        required
    }

    /// Shadow maps rendered by the last `make_shadow_maps`
    pub fn shadow_map_count(&self) -> u32 {
        let guard = self.inner.lock();
        let count = guard.borrow().shadow_maps;
        count
    }

    /// First enabled light holding a shadow map
    pub fn scan_lights(&self) -> Option<SharedShadowMap> {
        self.lights()
            .iter()
            .filter(|l| l.is_enabled())
            .find_map(|l| l.shadow_map())
    }

    /// Bring the shared light buffer up to date and return the active shadow map.
    ///
    /// While shaders still have to be rebuilt nothing is written; the caller
    /// regenerates them from [`LightList::make_shader_block`] first.
    pub fn update_light_block<B: GraphicsBackend + ?Sized>(
        &self,
        backend: &mut B,
        queue: &DeleteQueue,
    ) -> RenderResult<Option<SharedShadowMap>> {
        let guard = self.inner.lock();
        {
            let mut state = guard.borrow_mut();
            if state.dirty.contains(LightDirty::REBUILD_SHADERS) {
                drop(state);
                return Ok(self.scan_lights());
            }
            if state.queue.is_none() {
                state.queue = Some(queue.clone());
            }

            let membership = LightDirty::LIGHT_ADDED | LightDirty::LIGHT_REMOVED;
            let relayout = state.dirty.intersects(membership) || state.required == 0;
            if relayout {
                state.compute_offsets();
            }

            if self.use_block {
                let (block, created) =
                    State::ensure_buffer(backend, queue, state.block, state.required, "light block")?;
                state.block = Some(block);
                let write_all = created || relayout || !state.dirty.is_empty();
                for lights in state.classes.values() {
                    let layout = State::class_layout(lights);
                    for light in lights {
                        if write_all || light.is_dirty() {
                            let data = light.take_bytes(&layout)?;
                            backend.write_buffer(block.buffer, u64::from(light.block_offset()), &data)?;
                        }
                    }
                }
            }
            state.dirty = LightDirty::empty();
        }
        Ok(self.scan_lights())
    }

    /// Buffer a shader's light bind group points at: the shared block, or
    /// when the block is disabled a copy owned by `shader` refreshed on every call.
    pub fn use_lights<B: GraphicsBackend + ?Sized>(
        &self,
        backend: &mut B,
        queue: &DeleteQueue,
        shader: &str,
    ) -> RenderResult<BufferHandle> {
        let guard = self.inner.lock();
        let mut state = guard.borrow_mut();
        if state.queue.is_none() {
            state.queue = Some(queue.clone());
        }
        if state.required == 0 {
            state.compute_offsets();
        }

        if self.use_block {
            if let Some(block) = state.block.filter(|b| b.size >= state.required) {
                return Ok(block.buffer);
            }
            let (block, _) = State::ensure_buffer(backend, queue, state.block, state.required, "light block")?;
            state.block = Some(block);
            let bytes = state.pack_all()?;
            backend.write_buffer(block.buffer, 0, &bytes)?;
            return Ok(block.buffer);
        }

        let existing = state.shader_buffers.get(shader).copied();
        let label = format!("{} lights", shader);
        let (buffer, _) = State::ensure_buffer(backend, queue, existing, state.required, &label)?;
        state.shader_buffers.insert(shader.to_string(), buffer);
        let bytes = state.pack_all()?;
        backend.write_buffer(buffer.buffer, 0, &bytes)?;
        Ok(buffer.buffer)
    }

    /// Every light buffer currently alive
    pub fn buffers(&self) -> Vec<BufferHandle> {
        let guard = self.inner.lock();
        let state = guard.borrow();
        state
            .block
            .iter()
            .chain(state.shader_buffers.values())
            .map(|b| b.buffer)
            .collect()
    }

    /// WGSL declaration of the light block: one `U<class>` struct per class and
    /// a `<class>s` array of it inside `Lights_ubo`, bound at group 2.
    pub fn make_shader_block(&self) -> String {
        let guard = self.inner.lock();
        let state = guard.borrow();
        let mut out = String::new();
        for (class, lights) in &state.classes {
            out.push_str(&State::class_layout(lights).wgsl_struct(&format!("U{}", class)));
        }
        out.push_str("struct Lights_ubo {\n");
        if state.classes.is_empty() {
            out.push_str("    _pad: vec4<f32>,\n");
        }
        for (class, lights) in &state.classes {
            let _ = writeln!(out, "    {}s: array<U{}, {}>,", class, class, lights.len());
        }
        out.push_str("};\n");
        out.push_str("@group(2) @binding(0) var<uniform> lights: Lights_ubo;\n");
        out
    }

    /// Copy every owner's world matrix into its light
    pub fn update_transforms(&self, scene: &Scene) -> RenderResult<()> {
        let lights = self.lights();
        let world = scene.world();
        for light in lights {
            if let Some(owner) = light.owner() {
                if let Some(matrix) = crate::scene::world_matrix(&world, owner) {
                    light.update_transform(&matrix)?;
                }
            }
        }
        Ok(())
    }

    /// Render the shadow map of every enabled caster, one atlas layer each.
    /// Casters beyond the atlas capacity are skipped for the frame. Every light
    /// left without a layer loses its shadow map and reports index -1.
    pub fn make_shadow_maps(&self, scene: &Scene, renderer: &mut Renderer) -> RenderResult<u32> {
        // rendering takes the world lock, so the list lock is not held across it
        let lights = self.lights();
        let casters: Vec<Arc<Light>> = lights
            .iter()
            .filter(|l| l.is_enabled() && l.casts_shadows())
            .cloned()
            .collect();

        let mut assigned: Vec<&Arc<Light>> = Vec::new();
        let mut layer = 0u32;
        if !casters.is_empty() {
            let max = renderer.shadow_atlas()?.layers();
            let size = renderer.config().shadow_map_size;
            for light in &casters {
                if layer >= max {
                    log::warn!(
                        "{} shadow casting lights but only {} shadow map layers, skipping {}",
                        casters.len(),
                        max,
                        light.light_name()
                    );
                    continue;
                }
                if light.make_shadow_map(scene, renderer, layer, size, size)? {
                    assigned.push(light);
                    layer += 1;
                }
            }
        }
        for light in &lights {
            if !assigned.iter().any(|a| Arc::ptr_eq(a, light)) {
                light.clear_shadow_map();
            }
        }

        let guard = self.inner.lock();
        let mut state = guard.borrow_mut();
        if state.shadow_maps != layer {
            log::debug!("Shadow maps: {} -> {}", state.shadow_maps, layer);
            state.dirty |= LightDirty::SHADOW_CHANGED;
            state.shadow_maps = layer;
        }
        renderer.stats().set_shadow_maps(layer);
        Ok(layer)
    }
}

impl Drop for LightList {
    fn drop(&mut self) {
        let state = self.inner.get_mut().get_mut();
        if let Some(queue) = &state.queue {
            for buffer in state.block.iter().chain(state.shader_buffers.values()) {
                queue.push(GpuHandle::Buffer(buffer.buffer));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DummyBackend;
    use glam::Vec3;

    fn point() -> Arc<Light> {
        Arc::new(Light::point(Vec3::ONE, 1.0, 5.0).unwrap())
    }

    fn spot() -> Arc<Light> {
        Arc::new(Light::spot(Vec3::ONE, 1.0, 0.2, 0.4).unwrap())
    }

    fn assert_dense(list: &LightList) {
        for class in ["point", "spot"] {
            let indices: Vec<_> = list.class_lights(class).iter().map(|l| l.index()).collect();
            let expected: Vec<_> = (0..indices.len()).map(Some).collect();
            assert_eq!(indices, expected, "{} indices", class);
        }
    }

    #[test]
    fn indices_stay_dense() {
        let list = LightList::new(true);
        let lights: Vec<_> = (0..5).map(|i| if i % 2 == 0 { point() } else { spot() }).collect();
        for l in &lights {
            assert!(list.add_light(l.clone()));
        }
        assert_dense(&list);

        assert!(list.remove_light(&lights[2]));
        assert!(list.remove_light(&lights[1]));
        assert_dense(&list);
        assert_eq!(lights[2].index(), None);
        assert_eq!(lights[4].light_name(), "points[1]");

        assert!(list.add_light(lights[2].clone()));
        assert_dense(&list);
        assert_eq!(list.light_count(), 4);
    }

    #[test]
    fn duplicate_add_and_absent_remove_fail() {
        let list = LightList::new(true);
        let light = point();
        assert!(list.add_light(light.clone()));
        assert!(!list.add_light(light.clone()));
        assert!(list.remove_light(&light));
        assert!(!list.remove_light(&light));
        assert_eq!(list.class_count(), 0);
    }

    #[test]
    fn rebuild_pending_leaves_buffers_alone() {
        let mut backend = DummyBackend::new();
        let queue = DeleteQueue::new();
        let list = LightList::new(true);
        list.add_light(point());

        assert!(list.needs_shader_rebuild());
        assert!(list.update_light_block(&mut backend, &queue).unwrap().is_none());
        assert!(list.block_buffer().is_none());
        assert_eq!(backend.live_buffer_count(), 0);

        list.shaders_rebuilt();
        list.update_light_block(&mut backend, &queue).unwrap();
        let (_, size) = list.block_buffer().unwrap();
        assert!(size >= list.required_size());
        assert!(list.dirty().is_empty());
    }

    #[test]
    fn block_holds_each_light_at_its_offset() {
        let mut backend = DummyBackend::new();
        let queue = DeleteQueue::new();
        let list = LightList::new(true);
        let (a, b) = (point(), point());
        list.add_light(a.clone());
        list.add_light(b.clone());
        b.set_float("intensity", 7.0).unwrap();
        list.shaders_rebuilt();
        list.update_light_block(&mut backend, &queue).unwrap();

        let (buffer, _) = list.block_buffer().unwrap();
        let offset = b.block_offset() as usize;
        let field = b.layout().entry("intensity").unwrap().offset as usize;
        let data = backend.buffer_data(buffer).unwrap();
        let value: f32 = bytemuck::pod_read_unaligned(&data[offset + field..offset + field + 4]);
        assert_eq!(value, 7.0);
        assert_eq!(b.block_offset(), a.block_offset() + a.block_size());
    }

    #[test]
    fn new_list_starts_clean() {
        assert!(LightDirty::default().is_empty());
        let list = LightList::new(true);
        assert!(list.dirty().is_empty());
        assert_eq!(list.required_size(), 0);
    }

    #[test]
    fn disabling_a_light_rewrites_its_block_bytes() {
        let mut backend = DummyBackend::new();
        let queue = DeleteQueue::new();
        let list = LightList::new(true);
        let light = point();
        list.add_light(light.clone());
        list.shaders_rebuilt();
        list.update_light_block(&mut backend, &queue).unwrap();
        let (buffer, _) = list.block_buffer().unwrap();
        let before = backend.buffer_data(buffer).unwrap().to_vec();

        light.set_enabled(false).unwrap();
        list.update_light_block(&mut backend, &queue).unwrap();
        let after = backend.buffer_data(buffer).unwrap().to_vec();
        assert_ne!(before, after);

        let at = (light.block_offset() + light.layout().entry(crate::light::ENABLED).unwrap().offset) as usize;
        let enabled: f32 = bytemuck::pod_read_unaligned(&after[at..at + 4]);
        assert_eq!(enabled, 0.0);
    }

    #[test]
    fn block_only_grows() {
        let mut backend = DummyBackend::new();
        let queue = DeleteQueue::new();
        let list = LightList::new(true);
        let lights: Vec<_> = (0..3).map(|_| spot()).collect();
        list.add_light(lights[0].clone());
        list.shaders_rebuilt();
        list.update_light_block(&mut backend, &queue).unwrap();
        let (first, small) = list.block_buffer().unwrap();

        list.add_light(lights[1].clone());
        list.add_light(lights[2].clone());
        list.shaders_rebuilt();
        list.update_light_block(&mut backend, &queue).unwrap();
        let (second, large) = list.block_buffer().unwrap();
        assert_ne!(first, second);
        assert!(large > small);
        assert_eq!(queue.pending_count(), 1);

        list.remove_light(&lights[0]);
        list.shaders_rebuilt();
        list.update_light_block(&mut backend, &queue).unwrap();
        assert_eq!(list.block_buffer(), Some((second, large)));
        assert!(list.required_size() <= large);
    }

    #[test]
    fn shader_block_declares_class_arrays() {
        let list = LightList::new(true);
        let empty = list.make_shader_block();
        assert!(empty.contains("_pad: vec4<f32>"));

        list.add_light(point());
        list.add_light(point());
        list.add_light(spot());
        let block = list.make_shader_block();
        assert!(block.contains("struct Upoint {"));
        assert!(block.contains("points: array<Upoint, 2>,"));
        assert!(block.contains("spots: array<Uspot, 1>,"));
        assert!(block.contains("var<uniform> lights: Lights_ubo;"));
        naga::front::wgsl::parse_str(&block).unwrap();
    }

    #[test]
    fn callbacks_may_reenter() {
        let list = LightList::new(true);
        list.add_light(point());
        let extra = spot();
        let mut seen = 0;
        list.for_each_light(|_| {
            seen += 1;
            assert_eq!(list.light_count(), 1);
            assert!(list.add_light(extra.clone()));
        });
        assert_eq!(seen, 1);
        assert_eq!(list.light_count(), 2);
    }

    #[test]
    fn per_shader_copies_without_block() {
        let mut backend = DummyBackend::new();
        let queue = DeleteQueue::new();
        let list = LightList::new(false);
        list.add_light(point());
        list.shaders_rebuilt();
        list.update_light_block(&mut backend, &queue).unwrap();
        assert!(list.block_buffer().is_none());

        let lit = list.use_lights(&mut backend, &queue, "lit").unwrap();
        let other = list.use_lights(&mut backend, &queue, "other").unwrap();
        assert_ne!(lit, other);
        assert_eq!(list.use_lights(&mut backend, &queue, "lit").unwrap(), lit);
        assert_eq!(list.buffers().len(), 2);
    }
}
