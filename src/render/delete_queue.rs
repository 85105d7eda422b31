//! Deferred GPU object deletion
//!
//! Any thread may push a handle. Only the thread that created the queue (the one
//! driving the backend) drains it, at the start of every frame.

use crate::backend::traits::*;
use crate::error::{RenderError, RenderResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

/// A GPU object waiting to be destroyed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuHandle {
    Buffer(BufferHandle),
    Texture(TextureHandle),
    TextureView(TextureViewHandle),
    Sampler(SamplerHandle),
    BindGroup(BindGroupHandle),
    Pipeline(RenderPipelineHandle),
    Query(QueryHandle),
}

#[derive(Debug)]
struct Inner {
    /// Set on push, cleared on drain. Checked without the lock.
    dirty: AtomicBool,
    pending: Mutex<Vec<GpuHandle>>,
    owner: ThreadId,
}

/// Cloneable handle to one shared queue
#[derive(Debug, Clone)]
pub struct DeleteQueue {
    inner: Arc<Inner>,
}

impl DeleteQueue {
    /// Create a queue drained by the calling thread
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                dirty: AtomicBool::new(false),
                pending: Mutex::new(Vec::new()),
                owner: std::thread::current().id(),
            }),
        }
    }

    pub fn push(&self, handle: GpuHandle) {
        self.inner.pending.lock().push(handle);
        self.inner.dirty.store(true, Ordering::Release);
    }

    pub fn is_empty(&self) -> bool {
        !self.inner.dirty.load(Ordering::Acquire)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Destroy everything queued so far. Returns the number of objects released.
    pub fn process_queues<B: GraphicsBackend + ?Sized>(&self, backend: &mut B) -> RenderResult<usize> {
        if std::thread::current().id() != self.inner.owner {
            return Err(RenderError::NotContextThread);
        }
        if !self.inner.dirty.load(Ordering::Acquire) {
            return Ok(0);
        }

        let handles = {
            let mut pending = self.inner.pending.lock();
            self.inner.dirty.store(false, Ordering::Release);
            std::mem::take(&mut *pending)
        };

        for handle in &handles {
            match *handle {
                GpuHandle::Buffer(h) => backend.destroy_buffer(h),
                GpuHandle::Texture(h) => backend.destroy_texture(h),
                GpuHandle::TextureView(h) => backend.destroy_texture_view(h),
                GpuHandle::Sampler(h) => backend.destroy_sampler(h),
                GpuHandle::BindGroup(h) => backend.destroy_bind_group(h),
                GpuHandle::Pipeline(h) => backend.destroy_render_pipeline(h),
                GpuHandle::Query(h) => backend.destroy_occlusion_query(h),
            }
        }
        if !handles.is_empty() {
            log::debug!("Released {} GPU objects", handles.len());
        }
        Ok(handles.len())
    }
}

impl Default for DeleteQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::types::*;
    use crate::backend::DummyBackend;

    fn buffer(backend: &mut DummyBackend) -> BufferHandle {
        backend
            .create_buffer(&BufferDescriptor {
                label: None,
                size: 16,
                usage: BufferUsage::UNIFORM,
            })
            .unwrap()
    }

    #[test]
    fn enqueue_from_other_thread_drain_on_owner() {
        let mut backend = DummyBackend::new();
        let queue = DeleteQueue::new();
        let handles: Vec<_> = (0..4).map(|_| buffer(&mut backend)).collect();

        let remote = queue.clone();
        std::thread::spawn(move || {
            for h in handles {
                remote.push(GpuHandle::Buffer(h));
            }
        })
        .join()
        .unwrap();

        assert!(!queue.is_empty());
        assert_eq!(queue.process_queues(&mut backend).unwrap(), 4);
        assert_eq!(backend.live_buffer_count(), 0);
        assert!(queue.is_empty());
        assert_eq!(queue.process_queues(&mut backend).unwrap(), 0);
    }

    #[test]
    fn drain_off_thread_is_rejected() {
        let queue = DeleteQueue::new();
        let mut backend = DummyBackend::new();
        queue.push(GpuHandle::Buffer(buffer(&mut backend)));

        let remote = queue.clone();
        let result = std::thread::spawn(move || {
            let mut other = DummyBackend::new();
            remote.process_queues(&mut other).is_err()
        })
        .join()
        .unwrap();
        assert!(result);
        assert_eq!(queue.pending_count(), 1);
    }
}
