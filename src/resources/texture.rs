//! Sampled textures with lazy upload and a readiness flag

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::error::{RenderError, RenderResult};
use crate::render::{DeleteQueue, GpuHandle};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// GPU texture with its default view. Released through the delete queue on drop.
#[derive(Debug)]
pub struct GpuTexture {
    pub handle: TextureHandle,
    pub view: TextureViewHandle,
    queue: DeleteQueue,
}

impl GpuTexture {
    pub fn new(handle: TextureHandle, view: TextureViewHandle, queue: DeleteQueue) -> Self {
        Self { handle, view, queue }
    }
}

impl Drop for GpuTexture {
    fn drop(&mut self) {
        self.queue.push(GpuHandle::TextureView(self.view));
        self.queue.push(GpuHandle::Texture(self.handle));
    }
}

/// A 2D RGBA texture.
///
/// A texture created with [`Texture::pending`] is not ready until its pixels arrive;
/// materials that reference it are skipped for the frame.
#[derive(Debug)]
pub struct Texture {
    name: String,
    width: u32,
    height: u32,
    format: TextureFormat,
    pixels: Mutex<Option<Vec<u8>>>,
    ready: AtomicBool,
    gpu: Mutex<Option<GpuTexture>>,
}

impl Texture {
    /// Texture from tightly packed RGBA8 pixels
    pub fn from_rgba8(name: &str, width: u32, height: u32, data: Vec<u8>) -> RenderResult<Self> {
        let expected = (width * height * 4) as usize;
        if data.len() != expected {
            return Err(RenderError::Backend(BackendError::TextureCreationFailed(format!(
                "'{}' has {} bytes, expected {}",
                name,
                data.len(),
                expected
            ))));
        }
        Ok(Self {
            name: name.to_string(),
            width,
            height,
            format: TextureFormat::Rgba8UnormSrgb,
            pixels: Mutex::new(Some(data)),
            ready: AtomicBool::new(true),
            gpu: Mutex::new(None),
        })
    }

    /// Texture whose pixels are still loading
    pub fn pending(name: &str, width: u32, height: u32) -> Self {
        Self {
            name: name.to_string(),
            width,
            height,
            format: TextureFormat::Rgba8UnormSrgb,
            pixels: Mutex::new(None),
            ready: AtomicBool::new(false),
            gpu: Mutex::new(None),
        }
    }

    /// Create a solid color texture
    pub fn solid_color(color: [u8; 4], name: &str) -> Self {
        Self {
            name: name.to_string(),
            width: 1,
            height: 1,
            format: TextureFormat::Rgba8UnormSrgb,
            pixels: Mutex::new(Some(color.to_vec())),
            ready: AtomicBool::new(true),
            gpu: Mutex::new(None),
        }
    }

    /// Create a default white texture
    pub fn white() -> Self {
        Self::solid_color([255, 255, 255, 255], "white")
    }

    /// Create a checkerboard texture
    pub fn checkerboard(size: u32, color1: [u8; 4], color2: [u8; 4]) -> Self {
        let mut data = Vec::with_capacity((size * size * 4) as usize);

        for y in 0..size {
            for x in 0..size {
                let is_even = ((x / 8) + (y / 8)) % 2 == 0;
                let color = if is_even { color1 } else { color2 };
                data.extend_from_slice(&color);
            }
        }

        Self {
            name: "checkerboard".to_string(),
            width: size,
            height: size,
            format: TextureFormat::Rgba8UnormSrgb,
            pixels: Mutex::new(Some(data)),
            ready: AtomicBool::new(true),
            gpu: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Provide (or replace) the pixels. Marks the texture ready.
    pub fn set_pixels(&self, data: Vec<u8>) -> RenderResult<()> {
        let expected = (self.width * self.height * self.format.bytes_per_pixel()) as usize;
        if data.len() != expected {
            return Err(RenderError::Backend(BackendError::TextureCreationFailed(format!(
                "'{}' has {} bytes, expected {}",
                self.name,
                data.len(),
                expected
            ))));
        }
        *self.pixels.lock() = Some(data);
        self.ready.store(true, Ordering::Release);
        Ok(())
    }

    /// Upload pending pixels and return the sampling view
    pub fn upload<B: GraphicsBackend + ?Sized>(
        &self,
        backend: &mut B,
        queue: &DeleteQueue,
    ) -> RenderResult<TextureViewHandle> {
        if !self.is_ready() {
            return Err(RenderError::TextureNotFound(format!("{} (not loaded)", self.name)));
        }

        let mut gpu = self.gpu.lock();
        if gpu.is_none() {
            let handle = backend.create_texture(&TextureDescriptor {
                label: Some(self.name.clone()),
                width: self.width,
                height: self.height,
                format: self.format,
                usage: TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_DST,
                ..Default::default()
            })?;
            let view = backend.create_texture_view(handle, &TextureViewDescriptor::default())?;
            *gpu = Some(GpuTexture::new(handle, view, queue.clone()));
        }

        let Some(gpu) = gpu.as_ref() else {
            return Err(RenderError::TextureNotFound(self.name.clone()));
        };
        if let Some(pixels) = self.pixels.lock().take() {
            log::trace!("Uploading texture '{}' ({}x{})", self.name, self.width, self.height);
            backend.write_texture(gpu.handle, 0, &pixels, self.width, self.height)?;
        }
        Ok(gpu.view)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DummyBackend;

    #[test]
    fn pending_texture_becomes_ready() {
        let texture = Texture::pending("albedo", 2, 2);
        assert!(!texture.is_ready());
        assert!(texture.set_pixels(vec![0; 15]).is_err());
        texture.set_pixels(vec![255; 16]).unwrap();
        assert!(texture.is_ready());
    }

    #[test]
    fn upload_once_and_release_through_queue() {
        let mut backend = DummyBackend::new();
        let queue = DeleteQueue::new();
        let texture = Texture::checkerboard(16, [0, 0, 0, 255], [255, 255, 255, 255]);

        let first = texture.upload(&mut backend, &queue).unwrap();
        let second = texture.upload(&mut backend, &queue).unwrap();
        assert_eq!(first, second);
        assert_eq!(backend.live_texture_count(), 1);

        drop(texture);
        assert_eq!(queue.process_queues(&mut backend).unwrap(), 2);
        assert_eq!(backend.live_texture_count(), 0);
    }
}
