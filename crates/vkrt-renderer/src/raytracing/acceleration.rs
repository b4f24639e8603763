//! Acceleration structure management for ray tracing.
//!
//! One bottom-level structure (BLAS) is built per mesh over its slice of the
//! shared vertex and index buffers. A single top-level structure (TLAS)
//! references them through per-instance records. Every build is one
//! synchronous `run_once` round-trip; scratch memory is freed right after.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::Mat4;
use gpu_allocator::MemoryLocation;

use crate::device::{
    align_up, AccelerationBuild, AccelerationGeometry, AccelerationStructureDevice, CommandRecorder,
    DeviceProvider, GpuBuffer, MemoryBarrier, TriangleGeometry,
};
use crate::error::{Result, RtError};
use crate::scene::{GpuScene, MeshData, MeshRange, SceneInstance, Vertex};

/// Visibility mask written into every instance record.
pub const INSTANCE_MASK: u32 = 0xFF;

/// Instance record in the layout the device reads (`VkAccelerationStructureInstanceKHR`).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct InstanceEntry {
    /// Row-major 3x4 object-to-world transform
    pub transform: [f32; 12],
    pub custom_index_and_mask: u32,
    pub sbt_offset_and_flags: u32,
    pub acceleration_structure_reference: u64,
}

impl InstanceEntry {
    /// Hit group 0, back-face culling disabled.
    pub fn new(transform: &Mat4, custom_index: u32, blas_address: vk::DeviceAddress) -> Self {
        let flags = vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw();
        Self {
            transform: to_row_major_3x4(transform),
            custom_index_and_mask: (INSTANCE_MASK << 24) | (custom_index & 0xFF_FFFF),
            sbt_offset_and_flags: (flags & 0xFF) << 24,
            acceleration_structure_reference: blas_address,
        }
    }

    pub fn custom_index(&self) -> u32 {
        self.custom_index_and_mask & 0xFF_FFFF
    }

    pub fn mask(&self) -> u32 {
        self.custom_index_and_mask >> 24
    }
}

/// Drop the projective row of a column-major matrix and lay the rest out row by row.
pub fn to_row_major_3x4(m: &Mat4) -> [f32; 12] {
    let mut out = [0.0; 12];
    for r in 0..3 {
        out[r * 4..r * 4 + 4].copy_from_slice(&m.row(r).to_array());
    }
    out
}

/// Scratch allocation size: the query result rounded up to the scratch
/// alignment, plus one alignment unit so the start address can be aligned.
pub fn scratch_allocation_size(scratch_size: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::DeviceSize {
    align_up(scratch_size, alignment) + alignment
}

/// Acceleration structure handle with its backing storage.
#[derive(Debug, Default)]
pub struct AccelerationStructure {
    pub handle: vk::AccelerationStructureKHR,
    pub buffer: GpuBuffer,
    pub device_address: vk::DeviceAddress,
}

impl AccelerationStructure {
    /// Destroy the structure and free its storage. Safe on partial or empty state.
    pub unsafe fn destroy<D>(&mut self, device: &D)
    where
        D: DeviceProvider + AccelerationStructureDevice + ?Sized,
    {
        if self.handle != vk::AccelerationStructureKHR::null() {
            device.destroy_acceleration_structure(self.handle);
            self.handle = vk::AccelerationStructureKHR::null();
        }
        device.free_buffer(&mut self.buffer);
        self.device_address = 0;
    }
}

/// Bottom-level acceleration structure (BLAS) over one mesh.
#[derive(Debug, Default)]
pub struct BottomLevel {
    pub structure: AccelerationStructure,
    pub triangle_count: u32,
}

/// Top-level acceleration structure (TLAS) over all instances.
#[derive(Debug, Default)]
pub struct TopLevel {
    pub structure: AccelerationStructure,
    pub instance_count: u32,
}

/// Query sizes, allocate storage and scratch, then build in one round-trip.
///
/// `prelude` records commands that must run before the build in the same
/// command sequence.
unsafe fn build_structure<D>(
    device: &D,
    geometry: AccelerationGeometry,
    primitive_count: u32,
    name: &str,
    prelude: &mut dyn FnMut(&mut dyn CommandRecorder),
) -> Result<AccelerationStructure>
where
    D: DeviceProvider + AccelerationStructureDevice + ?Sized,
{
    let sizes = device.build_sizes(&geometry, primitive_count)?;
    let alignment = device.limits().scratch_alignment;

    let buffer = device.allocate_buffer(
        sizes.structure_size,
        vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        MemoryLocation::GpuOnly,
        name,
    )?;
    let mut structure = AccelerationStructure {
        buffer,
        ..Default::default()
    };

    match device.create_acceleration_structure(geometry.level(), structure.buffer.handle, sizes.structure_size) {
        Ok(handle) => structure.handle = handle,
        Err(e) => {
            structure.destroy(device);
            return Err(e);
        }
    }

    let mut scratch = match device.allocate_buffer(
        scratch_allocation_size(sizes.scratch_size, alignment),
        vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        MemoryLocation::GpuOnly,
        "as_scratch",
    ) {
        Ok(s) => s,
        Err(e) => {
            structure.destroy(device);
            return Err(e);
        }
    };

    let built = scratch.address("as_scratch").and_then(|scratch_address| {
        let build = AccelerationBuild {
            geometry,
            primitive_count,
            destination: structure.handle,
            scratch_address: align_up(scratch_address, alignment),
        };
        device.run_once(&mut |rec| {
            prelude(rec);
            rec.build_acceleration_structure(&build);
        })
    });

    // Scratch is only needed while the build executes
    device.free_buffer(&mut scratch);

    if let Err(e) = built {
        structure.destroy(device);
        return Err(e);
    }

    structure.device_address = device.acceleration_structure_address(structure.handle);
    tracing::debug!(
        structure = name,
        storage = sizes.structure_size,
        scratch = sizes.scratch_size,
        "Acceleration structure built"
    );
    Ok(structure)
}

/// Build a BLAS over one mesh's slice of the shared vertex and index buffers.
///
/// # Safety
/// The vertex and index buffers behind the base addresses must hold the
/// uploaded scene and stay alive until the build completes.
pub unsafe fn build_bottom_level<D>(
    device: &D,
    mesh: &MeshData,
    vertex_base: vk::DeviceAddress,
    index_base: vk::DeviceAddress,
    range: MeshRange,
) -> Result<BottomLevel>
where
    D: DeviceProvider + AccelerationStructureDevice + ?Sized,
{
    let stride = std::mem::size_of::<Vertex>() as vk::DeviceSize;
    let triangle_count = mesh.triangle_count();

    let geometry = AccelerationGeometry::Triangles(TriangleGeometry {
        vertex_address: vertex_base + range.vertex_offset as u64 * stride,
        vertex_stride: stride,
        max_vertex: (mesh.vertices.len() as u32).saturating_sub(1),
        index_address: index_base + range.index_offset as u64 * std::mem::size_of::<u32>() as u64,
    });

    let structure = build_structure(device, geometry, triangle_count, "blas", &mut |_| {})?;
    Ok(BottomLevel {
        structure,
        triangle_count,
    })
}

/// Build one BLAS per mesh, in mesh order. On failure everything built so far is destroyed.
pub unsafe fn build_bottom_levels<D>(device: &D, meshes: &[MeshData], scene: &GpuScene) -> Result<Vec<BottomLevel>>
where
    D: DeviceProvider + AccelerationStructureDevice + ?Sized,
{
    let vertex_base = scene.vertices.address("scene_vertices")?;
    let index_base = scene.indices.address("scene_indices")?;

    let mut built: Vec<BottomLevel> = Vec::with_capacity(meshes.len());
    for (mesh, range) in meshes.iter().zip(&scene.ranges) {
        match build_bottom_level(device, mesh, vertex_base, index_base, *range) {
            Ok(blas) => built.push(blas),
            Err(e) => {
                for blas in &mut built {
                    blas.structure.destroy(device);
                }
                return Err(e);
            }
        }
    }

    let triangles: u64 = built.iter().map(|b| b.triangle_count as u64).sum();
    tracing::info!(count = built.len(), triangles, "Bottom-level structures built");
    Ok(built)
}

/// Instance records for the TLAS. The custom index carries the mesh index so
/// hit programs can look up the mesh's row in the per-mesh metadata table.
pub fn instance_entries(instances: &[SceneInstance], bottom: &[BottomLevel]) -> Result<Vec<InstanceEntry>> {
    instances
        .iter()
        .enumerate()
        .map(|(i, inst)| {
            let blas = bottom.get(inst.mesh_index as usize).ok_or(RtError::MissingBottomLevel {
                instance: i,
                mesh: inst.mesh_index,
                mesh_count: bottom.len(),
            })?;
            Ok(InstanceEntry::new(&inst.transform, inst.mesh_index, blas.structure.device_address))
        })
        .collect()
}

/// Build the TLAS over `instances`. Every referenced BLAS must already be built.
///
/// The instance records are staged on the host, copied to a device buffer,
/// and a barrier orders the copy before the build, all in one command sequence.
pub unsafe fn build_top_level<D>(device: &D, instances: &[SceneInstance], bottom: &[BottomLevel]) -> Result<TopLevel>
where
    D: DeviceProvider + AccelerationStructureDevice + ?Sized,
{
    let entries = instance_entries(instances, bottom)?;
    let instance_count = entries.len() as u32;
    let bytes: &[u8] = bytemuck::cast_slice(&entries);
    // Zero-sized buffers are not allowed; an empty TLAS still gets one record's worth
    let size = (bytes.len() as vk::DeviceSize).max(std::mem::size_of::<InstanceEntry>() as vk::DeviceSize);

    let mut staging = device.allocate_buffer(
        size,
        vk::BufferUsageFlags::TRANSFER_SRC,
        MemoryLocation::CpuToGpu,
        "tlas_instances_staging",
    )?;
    let mut instance_buffer = match device.allocate_buffer(
        size,
        vk::BufferUsageFlags::TRANSFER_DST
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
            | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
        MemoryLocation::GpuOnly,
        "tlas_instances",
    ) {
        Ok(b) => b,
        Err(e) => {
            device.free_buffer(&mut staging);
            return Err(e);
        }
    };

    let result = device
        .write_buffer(&staging, 0, bytes)
        .and_then(|()| instance_buffer.address("tlas_instances"))
        .and_then(|data_address| {
            let (src, dst) = (staging.handle, instance_buffer.handle);
            build_structure(
                device,
                AccelerationGeometry::Instances { data_address },
                instance_count,
                "tlas",
                &mut |rec| {
                    rec.copy_buffer(src, dst, size);
                    rec.memory_barrier(MemoryBarrier::transfer_to_build());
                },
            )
        });

    device.free_buffer(&mut staging);
    device.free_buffer(&mut instance_buffer);

    let structure = result?;
    tracing::info!(instances = instance_count, "Top-level structure built");
    Ok(TopLevel {
        structure,
        instance_count,
    })
}

/// All acceleration structures of one scene.
#[derive(Debug, Default)]
pub struct SceneAccelerationStructures {
    pub bottom: Vec<BottomLevel>,
    pub top: TopLevel,
}

impl SceneAccelerationStructures {
    /// Build every BLAS, then the TLAS over the scene's instances.
    pub unsafe fn build<D>(device: &D, meshes: &[MeshData], instances: &[SceneInstance], scene: &GpuScene) -> Result<Self>
    where
        D: DeviceProvider + AccelerationStructureDevice + ?Sized,
    {
        let mut structures = Self {
            bottom: build_bottom_levels(device, meshes, scene)?,
            top: TopLevel::default(),
        };

        match build_top_level(device, instances, &structures.bottom) {
            Ok(top) => structures.top = top,
            Err(e) => {
                structures.destroy(device);
                return Err(e);
            }
        }
        Ok(structures)
    }

    /// Destroy the TLAS, then every BLAS. Idempotent.
    pub unsafe fn destroy<D>(&mut self, device: &D)
    where
        D: DeviceProvider + AccelerationStructureDevice + ?Sized,
    {
        self.top.structure.destroy(device);
        for blas in &mut self.bottom {
            blas.structure.destroy(device);
        }
        self.bottom.clear();
    }
}
