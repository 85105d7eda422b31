//! Mesh data structures and generation

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::error::RenderResult;
use crate::render::{DeleteQueue, GpuHandle};
use crate::scene::BoundingVolume;
use glam::{Vec2, Vec3, Vec4};
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};

/// Vertex and index buffers of an uploaded mesh. Released through the delete queue on drop.
#[derive(Debug)]
pub struct GpuMesh {
    pub vertex_buffer: BufferHandle,
    pub index_buffer: BufferHandle,
    pub index_count: u32,
    queue: DeleteQueue,
}

impl Drop for GpuMesh {
    fn drop(&mut self) {
        self.queue.push(GpuHandle::Buffer(self.vertex_buffer));
        self.queue.push(GpuHandle::Buffer(self.index_buffer));
    }
}

/// Triangle mesh shared between render datas
#[derive(Debug)]
pub struct Mesh {
    name: String,
    vertices: Vec<Vertex>,
    indices: Vec<u32>,
    bounds: BoundingVolume,
    gpu: Mutex<Option<Arc<GpuMesh>>>,
    bounding_box: OnceLock<Arc<Mesh>>,
}

impl Mesh {
    pub fn new(name: &str, vertices: Vec<Vertex>, indices: Vec<u32>) -> Self {
        let bounds = BoundingVolume::from_points(vertices.iter().map(|v| v.position));
        Self {
            name: name.to_string(),
            vertices,
            indices,
            bounds,
            gpu: Mutex::new(None),
            bounding_box: OnceLock::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    /// Local space bounds
    pub fn bounds(&self) -> &BoundingVolume {
        &self.bounds
    }

    pub fn index_count(&self) -> u32 {
        self.indices.len() as u32
    }

    pub fn triangle_count(&self) -> u32 {
        self.index_count() / 3
    }

    /// Twelve triangle box over the bounds
    pub fn create_bounding_box(&self) -> Mesh {
        let bv = if self.bounds.is_empty() {
            BoundingVolume::new(Vec3::ZERO, Vec3::ZERO)
        } else {
            self.bounds
        };
        let (a, b) = (bv.min, bv.max);
        let vertices = [
            Vec3::new(a.x, a.y, a.z),
            Vec3::new(b.x, a.y, a.z),
            Vec3::new(b.x, b.y, a.z),
            Vec3::new(a.x, b.y, a.z),
            Vec3::new(a.x, a.y, b.z),
            Vec3::new(b.x, a.y, b.z),
            Vec3::new(b.x, b.y, b.z),
            Vec3::new(a.x, b.y, b.z),
        ]
        .into_iter()
        .map(|p| Vertex::new(p, Vec3::ZERO, Vec2::ZERO))
        .collect();
        #[rustfmt::skip]
        let indices = vec![
            0, 2, 1, 0, 3, 2, // -z
            4, 5, 6, 4, 6, 7, // +z
            0, 4, 7, 0, 7, 3, // -x
            1, 2, 6, 1, 6, 5, // +x
            0, 1, 5, 0, 5, 4, // -y
            3, 7, 6, 3, 6, 2, // +y
        ];
        Mesh::new(&format!("{} bounds", self.name), vertices, indices)
    }

    /// Cached [`Mesh::create_bounding_box`], used for occlusion queries
    pub fn bounding_box(&self) -> Arc<Mesh> {
        self.bounding_box
            .get_or_init(|| Arc::new(self.create_bounding_box()))
            .clone()
    }

    /// Upload on first use and return the GPU buffers
    pub fn upload<B: GraphicsBackend + ?Sized>(
        &self,
        backend: &mut B,
        queue: &DeleteQueue,
    ) -> RenderResult<Arc<GpuMesh>> {
        let mut gpu = self.gpu.lock();
        if let Some(existing) = gpu.as_ref() {
            return Ok(existing.clone());
        }

        log::trace!(
            "Uploading mesh '{}' ({} vertices, {} indices)",
            self.name,
            self.vertices.len(),
            self.indices.len()
        );
        let vertex_bytes: &[u8] = bytemuck::cast_slice(&self.vertices);
        let index_bytes: &[u8] = bytemuck::cast_slice(&self.indices);
        let vertex_buffer = backend.create_buffer_init(
            &BufferDescriptor {
                label: Some(format!("{} vertices", self.name)),
                size: vertex_bytes.len().max(4) as u64,
                usage: BufferUsage::VERTEX | BufferUsage::COPY_DST,
            },
            vertex_bytes,
        )?;
        let index_buffer = match backend.create_buffer_init(
            &BufferDescriptor {
                label: Some(format!("{} indices", self.name)),
                size: index_bytes.len().max(4) as u64,
                usage: BufferUsage::INDEX | BufferUsage::COPY_DST,
            },
            index_bytes,
        ) {
            Ok(buffer) => buffer,
            Err(e) => {
                backend.destroy_buffer(vertex_buffer);
                return Err(e.into());
            }
        };

        let uploaded = Arc::new(GpuMesh {
            vertex_buffer,
            index_buffer,
            index_count: self.index_count(),
            queue: queue.clone(),
        });
        *gpu = Some(uploaded.clone());
        Ok(uploaded)
    }

    /// Create a unit cube centered at origin
    pub fn cube() -> Self {
        let faces = [
            (Vec3::Z, Vec3::X),
            (-Vec3::Z, -Vec3::X),
            (Vec3::X, -Vec3::Z),
            (-Vec3::X, Vec3::Z),
            (Vec3::Y, Vec3::X),
            (-Vec3::Y, Vec3::X),
        ];

        let mut vertices = Vec::with_capacity(24);
        let mut indices = Vec::with_capacity(36);
        for (normal, right) in faces {
            let up = normal.cross(right);
            let base = vertices.len() as u32;
            let corners = [(-0.5, -0.5), (0.5, -0.5), (0.5, 0.5), (-0.5, 0.5)];
            for (u, v) in corners {
                let position = normal * 0.5 + right * u + up * v;
                vertices.push(Vertex {
                    position,
                    normal,
                    uv: Vec2::new(u + 0.5, 0.5 - v),
                    tangent: right.extend(1.0),
                });
            }
            indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }

        Mesh::new("cube", vertices, indices)
    }

    /// Create a quad on the XY plane facing +Z
    pub fn quad(width: f32, height: f32) -> Self {
        let (hw, hh) = (width / 2.0, height / 2.0);
        let vertices = vec![
            Vertex::new(Vec3::new(-hw, -hh, 0.0), Vec3::Z, Vec2::new(0.0, 1.0)),
            Vertex::new(Vec3::new(hw, -hh, 0.0), Vec3::Z, Vec2::new(1.0, 1.0)),
            Vertex::new(Vec3::new(hw, hh, 0.0), Vec3::Z, Vec2::new(1.0, 0.0)),
            Vertex::new(Vec3::new(-hw, hh, 0.0), Vec3::Z, Vec2::new(0.0, 0.0)),
        ];
        Mesh::new("quad", vertices, vec![0, 1, 2, 0, 2, 3])
    }

    /// Create a UV sphere of diameter 1
    pub fn sphere(segments: u32, rings: u32) -> Self {
        let segments = segments.max(3);
        let rings = rings.max(2);
        let segment_angle = 2.0 * std::f32::consts::PI / segments as f32;
        let ring_angle = std::f32::consts::PI / rings as f32;

        let mut vertices = Vec::new();
        for ring in 0..=rings {
            let phi = ring as f32 * ring_angle;
            let y = phi.cos();
            let ring_radius = phi.sin();

            for segment in 0..=segments {
                let theta = segment as f32 * segment_angle;
                let normal = Vec3::new(ring_radius * theta.cos(), y, ring_radius * theta.sin());
                vertices.push(Vertex {
                    position: normal * 0.5,
                    normal,
                    uv: Vec2::new(segment as f32 / segments as f32, ring as f32 / rings as f32),
                    tangent: Vec4::new(-theta.sin(), 0.0, theta.cos(), 1.0),
                });
            }
        }

        let mut indices = Vec::new();
        for ring in 0..rings {
            for segment in 0..segments {
                let current = ring * (segments + 1) + segment;
                let next = current + segments + 1;
                indices.extend_from_slice(&[current, current + 1, next, current + 1, next + 1, next]);
            }
        }

        Mesh::new("sphere", vertices, indices)
    }

    /// Create a plane on the XZ axis facing +Y
    pub fn plane(width: f32, depth: f32, subdivisions: u32) -> Self {
        let subdivisions = subdivisions.max(1);
        let half_width = width / 2.0;
        let half_depth = depth / 2.0;
        let step_x = width / subdivisions as f32;
        let step_z = depth / subdivisions as f32;

        let mut vertices = Vec::new();
        for z in 0..=subdivisions {
            for x in 0..=subdivisions {
                let px = -half_width + x as f32 * step_x;
                let pz = -half_depth + z as f32 * step_z;
                vertices.push(Vertex::new(
                    Vec3::new(px, 0.0, pz),
                    Vec3::Y,
                    Vec2::new(x as f32 / subdivisions as f32, z as f32 / subdivisions as f32),
                ));
            }
        }

        let mut indices = Vec::new();
        for z in 0..subdivisions {
            for x in 0..subdivisions {
                let current = z * (subdivisions + 1) + x;
                let next = current + subdivisions + 1;
                indices.extend_from_slice(&[current, next, current + 1, current + 1, next, next + 1]);
            }
        }

        Mesh::new("plane", vertices, indices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DummyBackend;

    #[test]
    fn generated_bounds() {
        let cube = Mesh::cube();
        assert_eq!(cube.triangle_count(), 12);
        assert_eq!(*cube.bounds(), BoundingVolume::new(Vec3::splat(-0.5), Vec3::splat(0.5)));

        let plane = Mesh::plane(4.0, 2.0, 2);
        assert_eq!(plane.bounds().extent(), Vec3::new(4.0, 0.0, 2.0));
    }

    #[test]
    fn cube_faces_point_outward() {
        let cube = Mesh::cube();
        for tri in cube.indices().chunks(3) {
            let [a, b, c] = [tri[0], tri[1], tri[2]].map(|i| cube.vertices()[i as usize]);
            let n = (b.position - a.position).cross(c.position - a.position);
            assert!(n.dot(a.normal) > 0.0);
        }
    }

    #[test]
    fn bounding_box_mesh_matches_bounds() {
        let sphere = Mesh::sphere(8, 6);
        let bbox = sphere.bounding_box();
        assert_eq!(bbox.triangle_count(), 12);
        assert_eq!(bbox.bounds(), sphere.bounds());
        assert!(Arc::ptr_eq(&bbox, &sphere.bounding_box()));
    }

    #[test]
    fn upload_is_lazy_and_shared() {
        let mut backend = DummyBackend::new();
        let queue = DeleteQueue::new();
        let mesh = Mesh::quad(1.0, 1.0);
        let a = mesh.upload(&mut backend, &queue).unwrap();
        let b = mesh.upload(&mut backend, &queue).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.index_count, 6);
        assert_eq!(backend.live_buffer_count(), 2);
    }
}
