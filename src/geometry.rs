//! Shared vertex and index buffers for every mesh in the scene.

use crate::bounds::Aabb;
use crate::device::{RenderDevice, TriangleGeometry};
use crate::error::{RenderError, Result};
use crate::memory::GpuBuffer;
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use std::mem::size_of;
use std::sync::Arc;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub pos: [f32; 3],
    pub nrm: [f32; 3],
}

pub const VERTEX_STRIDE: vk::DeviceSize = size_of::<Vertex>() as vk::DeviceSize;
pub const INDEX_SIZE: vk::DeviceSize = size_of::<u32>() as vk::DeviceSize;

#[derive(Clone, Debug, Default)]
pub struct Mesh {
    pub vertices: Vec<Vertex>,
    /// Triangle list; indices are local to this mesh.
    pub indices: Vec<u32>,
}

impl Mesh {
    pub fn vertex_count(&self) -> u32 {
        self.vertices.len() as u32
    }

    pub fn triangle_count(&self) -> u32 {
        (self.indices.len() / 3) as u32
    }

    pub fn vertex_bytes(&self) -> vk::DeviceSize {
        self.vertices.len() as vk::DeviceSize * VERTEX_STRIDE
    }

    pub fn index_bytes(&self) -> vk::DeviceSize {
        self.indices.len() as vk::DeviceSize * INDEX_SIZE
    }

    /// The mesh must be a non-empty triangle list whose indices all address
    /// a vertex of this mesh.
    pub fn validate(&self, object: usize) -> Result<()> {
        if self.vertices.is_empty() || self.indices.is_empty() || self.indices.len() % 3 != 0 {
            return Err(RenderError::MalformedMesh {
                object,
                vertex_count: self.vertices.len(),
                index_count: self.indices.len(),
            });
        }

        let vertex_count = self.vertex_count();
        match self.indices.iter().find(|&&index| index >= vertex_count) {
            Some(&index) => Err(RenderError::IndexOutOfRange {
                object,
                index,
                vertex_count,
            }),
            None => Ok(()),
        }
    }

    pub fn bounds(&self) -> Aabb {
        Aabb::from_points(self.vertices.iter().map(|v| Vec3::from(v.pos)))
    }
}

/// Where one mesh lives inside the shared buffers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjectGeometry {
    pub vertex_offset: vk::DeviceSize,
    pub index_offset: vk::DeviceSize,
    pub vertex_address: vk::DeviceAddress,
    pub index_address: vk::DeviceAddress,
    pub vertex_count: u32,
    pub triangle_count: u32,
}

impl ObjectGeometry {
    pub fn triangles(&self) -> TriangleGeometry {
        TriangleGeometry {
            vertex_address: self.vertex_address,
            index_address: self.index_address,
            vertex_stride: VERTEX_STRIDE,
            max_vertex: self.vertex_count.saturating_sub(1),
            primitive_count: self.triangle_count,
        }
    }
}

/// One vertex buffer and one index buffer holding every mesh back to back.
pub struct GeometryBuffers<D: RenderDevice> {
    vertices: GpuBuffer<D>,
    indices: GpuBuffer<D>,
    objects: Vec<ObjectGeometry>,
}

impl<D: RenderDevice> GeometryBuffers<D> {
    pub fn upload(device: &Arc<D>, meshes: &[Mesh]) -> Result<Self> {
        if meshes.is_empty() {
            return Err(RenderError::NoGeometry);
        }
        for (object, mesh) in meshes.iter().enumerate() {
            mesh.validate(object)?;
        }

        let vertex_total: vk::DeviceSize = meshes.iter().map(Mesh::vertex_bytes).sum();
        let index_total: vk::DeviceSize = meshes.iter().map(Mesh::index_bytes).sum();
        log::info!(
            "Uploading {} meshes ({} vertex bytes, {} index bytes)",
            meshes.len(),
            vertex_total,
            index_total
        );

        let usage = vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
            | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR;
        let vertices = GpuBuffer::host_visible(device, vertex_total, usage)?;
        let indices = GpuBuffer::host_visible(device, index_total, usage)?;

        let mut objects = Vec::with_capacity(meshes.len());
        let mut vertex_offset = 0;
        let mut index_offset = 0;
        for mesh in meshes {
            vertices.write_at(vertex_offset, bytemuck::cast_slice(&mesh.vertices))?;
            indices.write_at(index_offset, bytemuck::cast_slice(&mesh.indices))?;

            objects.push(ObjectGeometry {
                vertex_offset,
                index_offset,
                vertex_address: vertices.address() + vertex_offset,
                index_address: indices.address() + index_offset,
                vertex_count: mesh.vertex_count(),
                triangle_count: mesh.triangle_count(),
            });

            vertex_offset += mesh.vertex_bytes();
            index_offset += mesh.index_bytes();
        }

        Ok(Self {
            vertices,
            indices,
            objects,
        })
    }

    pub fn objects(&self) -> &[ObjectGeometry] {
        &self.objects
    }

    pub fn vertex_buffer(&self) -> &GpuBuffer<D> {
        &self.vertices
    }

    pub fn index_buffer(&self) -> &GpuBuffer<D> {
        &self.indices
    }
}
