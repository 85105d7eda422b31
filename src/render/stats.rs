//! Per frame render counters

use std::sync::atomic::{AtomicU32, Ordering};

/// Draw statistics of the last camera render.
///
/// Shared with the scene so the logic thread can read them while the render
/// thread updates them.
#[derive(Debug, Default)]
pub struct RenderStats {
    draw_calls: AtomicU32,
    triangles: AtomicU32,
    shadow_maps: AtomicU32,
}

impl RenderStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called at the start of every camera render
    pub fn reset(&self) {
        self.draw_calls.store(0, Ordering::Relaxed);
        self.triangles.store(0, Ordering::Relaxed);
    }

    pub fn record_draw(&self, triangles: u32) {
        self.draw_calls.fetch_add(1, Ordering::Relaxed);
        self.triangles.fetch_add(triangles, Ordering::Relaxed);
    }

    pub fn draw_calls(&self) -> u32 {
        self.draw_calls.load(Ordering::Relaxed)
    }

    pub fn triangles(&self) -> u32 {
        self.triangles.load(Ordering::Relaxed)
    }

    /// Shadow maps produced by the last light scan
    pub fn shadow_maps(&self) -> u32 {
        self.shadow_maps.load(Ordering::Relaxed)
    }

    pub fn set_shadow_maps(&self, count: u32) {
        self.shadow_maps.store(count, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_keeps_shadow_count() {
        let stats = RenderStats::new();
        stats.record_draw(12);
        stats.record_draw(2);
        stats.set_shadow_maps(1);
        assert_eq!(stats.draw_calls(), 2);
        assert_eq!(stats.triangles(), 14);

        stats.reset();
        assert_eq!(stats.draw_calls(), 0);
        assert_eq!(stats.triangles(), 0);
        assert_eq!(stats.shadow_maps(), 1);
    }
}
