//! Mesh and model upload.

use crate::buffer::{BufferAllocator, BufferHandle};
use crate::command::Recording;
use crate::device::GpuDevice;
use crate::error::{GpuError, Result};
use crate::loader::TextureKind;
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3};
use std::collections::HashMap;
use std::mem::{offset_of, size_of};
use std::path::{Path, PathBuf};

/// Vertex layout produced by model loaders.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct ModelVertex {
    pub position: Vec3,
    pub normal: Vec3,
    pub tex_coord: Vec2,
    pub tangent: Vec3,
    pub bitangent: Vec3,
}

impl ModelVertex {
    /// Per-vertex binding at `binding`.
    pub fn binding_description(binding: u32) -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding,
            stride: size_of::<Self>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }

    /// One attribute per field, at locations 0 to 4.
    pub fn attribute_descriptions(binding: u32) -> [vk::VertexInputAttributeDescription; 5] {
        let attribute = |location, format, offset: usize| vk::VertexInputAttributeDescription {
            location,
            binding,
            format,
            offset: offset as u32,
        };
        [
            attribute(0, vk::Format::R32G32B32_SFLOAT, offset_of!(Self, position)),
            attribute(1, vk::Format::R32G32B32_SFLOAT, offset_of!(Self, normal)),
            attribute(2, vk::Format::R32G32_SFLOAT, offset_of!(Self, tex_coord)),
            attribute(3, vk::Format::R32G32B32_SFLOAT, offset_of!(Self, tangent)),
            attribute(4, vk::Format::R32G32B32_SFLOAT, offset_of!(Self, bitangent)),
        ]
    }
}

/// CPU-side mesh ready for upload.
#[derive(Debug, Clone, Copy)]
pub struct MeshData<'a, V: Pod = ModelVertex> {
    pub vertices: &'a [V],
    pub indices: &'a [u32],
    pub material_index: u32,
}

/// A mesh resident in device-local buffers.
///
/// The buffers belong to the [`BufferAllocator`] that uploaded them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuMesh {
    pub vertex_buffer: BufferHandle,
    pub index_buffer: BufferHandle,
    pub index_count: u32,
    pub material_index: u32,
}

/// Every mesh of one model.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GpuModel {
    pub meshes: Vec<GpuMesh>,
}

impl GpuModel {
    /// Total index count across meshes.
    pub fn index_count(&self) -> u64 {
        self.meshes.iter().map(|m| u64::from(m.index_count)).sum()
    }
}

/// Stage a mesh's vertices and indices into device-local buffers.
///
/// `VERTEX_BUFFER` and `INDEX_BUFFER` are added to the extra usage flags.
pub fn upload_mesh<D: GpuDevice, V: Pod>(
    buffers: &mut BufferAllocator<D>,
    mesh: &MeshData<'_, V>,
    extra_vertex_usage: vk::BufferUsageFlags,
    extra_index_usage: vk::BufferUsageFlags,
    recording: Recording,
) -> Result<GpuMesh> {
    if mesh.vertices.is_empty() || mesh.indices.is_empty() {
        return Err(GpuError::Precondition(format!(
            "mesh has {} vertices and {} indices; both must be non-zero",
            mesh.vertices.len(),
            mesh.indices.len()
        )));
    }
    let index_count = u32::try_from(mesh.indices.len())
        .map_err(|_| GpuError::Precondition("mesh index count exceeds u32".into()))?;

    let vertex_buffer = buffers.upload(
        bytemuck::cast_slice(mesh.vertices),
        vk::BufferUsageFlags::VERTEX_BUFFER | extra_vertex_usage,
        recording,
    )?;

    let index_buffer = match buffers.upload(
        bytemuck::cast_slice(mesh.indices),
        vk::BufferUsageFlags::INDEX_BUFFER | extra_index_usage,
        recording,
    ) {
        Ok(handle) => handle,
        Err(e) => {
            match recording {
                Recording::Immediate => buffers.free(vertex_buffer)?,
                Recording::Into(_) => buffers.retire(vertex_buffer)?,
            }
            return Err(e);
        }
    };

    tracing::debug!(
        vertices = mesh.vertices.len(),
        indices = index_count,
        material = mesh.material_index,
        "Uploaded mesh"
    );

    Ok(GpuMesh {
        vertex_buffer,
        index_buffer,
        index_count,
        material_index: mesh.material_index,
    })
}

/// Upload every mesh of a model. Meshes uploaded before a failure are released.
pub fn upload_model<D: GpuDevice, V: Pod>(
    buffers: &mut BufferAllocator<D>,
    meshes: &[MeshData<'_, V>],
    extra_vertex_usage: vk::BufferUsageFlags,
    extra_index_usage: vk::BufferUsageFlags,
    recording: Recording,
) -> Result<GpuModel> {
    let mut model = GpuModel {
        meshes: Vec::with_capacity(meshes.len()),
    };
    for mesh in meshes {
        match upload_mesh(buffers, mesh, extra_vertex_usage, extra_index_usage, recording) {
            Ok(gpu_mesh) => model.meshes.push(gpu_mesh),
            Err(e) => {
                release_model(buffers, &model, recording);
                return Err(e);
            }
        }
    }
    tracing::info!(meshes = model.meshes.len(), "Uploaded model");
    Ok(model)
}

/// Return a model's buffers to the allocator.
pub fn free_model<D: GpuDevice>(buffers: &mut BufferAllocator<D>, model: GpuModel) -> Result<()> {
    for mesh in model.meshes {
        buffers.free(mesh.vertex_buffer)?;
        buffers.free(mesh.index_buffer)?;
    }
    Ok(())
}

fn release_model<D: GpuDevice>(buffers: &mut BufferAllocator<D>, model: &GpuModel, recording: Recording) {
    for mesh in &model.meshes {
        for handle in [mesh.vertex_buffer, mesh.index_buffer] {
            let released = match recording {
                Recording::Immediate => buffers.free(handle),
                Recording::Into(_) => buffers.retire(handle),
            };
            if let Err(e) = released {
                tracing::warn!("Failed to release partially uploaded mesh: {e}");
            }
        }
    }
}

/// Texture paths of one material, with a fallback for missing kinds.
#[derive(Debug, Clone)]
pub struct MaterialTextures {
    textures: HashMap<TextureKind, PathBuf>,
    fallback: PathBuf,
}

impl MaterialTextures {
    /// Create a material whose every kind resolves to `fallback` until set.
    pub fn new(fallback: impl Into<PathBuf>) -> Self {
        Self {
            textures: HashMap::new(),
            fallback: fallback.into(),
        }
    }

    /// Set the texture for `kind`.
    pub fn with(mut self, kind: TextureKind, path: impl Into<PathBuf>) -> Self {
        self.set(kind, path);
        self
    }

    /// Set the texture for `kind`.
    pub fn set(&mut self, kind: TextureKind, path: impl Into<PathBuf>) {
        self.textures.insert(kind, path.into());
    }

    /// Whether `kind` has its own texture.
    pub fn has(&self, kind: TextureKind) -> bool {
        self.textures.contains_key(&kind)
    }

    /// Path for `kind`, or the fallback.
    pub fn resolve(&self, kind: TextureKind) -> &Path {
        match self.textures.get(&kind) {
            Some(path) => path,
            None => {
                tracing::debug!(?kind, fallback = %self.fallback.display(), "Material texture missing, using fallback");
                &self.fallback
            }
        }
    }

    /// Paths for every kind in [`TextureKind::ALL`] order.
    pub fn resolve_all(&self) -> [&Path; 6] {
        TextureKind::ALL.map(|kind| self.resolve(kind))
    }
}
