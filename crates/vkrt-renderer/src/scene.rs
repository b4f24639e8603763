//! Scene content: meshes, materials, instances and their GPU upload.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2, Vec3};
use gpu_allocator::MemoryLocation;
use std::f32::consts::PI;

use crate::device::{DeviceProvider, GpuBuffer};
use crate::error::Result;

/// Vertex layout shared with the hit program (scalar block layout, 32 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: Vec3,
    pub normal: Vec3,
    pub uv: Vec2,
}

/// Surface response model of a [`Material`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum MaterialKind {
    Diffuse = 0,
    Metal = 1,
    Glass = 2,
}

/// Material table row (48 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Material {
    pub base_color: Vec3,
    pub metallic: f32,
    pub emissive: Vec3,
    pub roughness: f32,
    pub ior: f32,
    pub kind: i32,
    pub _pad: [f32; 2],
}

impl Material {
    pub fn new(kind: MaterialKind, base_color: Vec3, roughness: f32) -> Self {
        Self {
            base_color,
            metallic: if kind == MaterialKind::Metal { 1.0 } else { 0.0 },
            emissive: Vec3::ZERO,
            roughness,
            ior: 1.5,
            kind: kind as i32,
            _pad: [0.0; 2],
        }
    }

    pub fn with_emission(mut self, emissive: Vec3) -> Self {
        self.emissive = emissive;
        self
    }
}

/// Per-mesh lookup row for the hit program, indexed by the instance custom index.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct InstanceData {
    pub vertex_offset: u32,
    pub index_offset: u32,
    pub material_index: u32,
    pub _pad: u32,
}

/// Indexed triangle mesh. Indices are local to the mesh.
#[derive(Debug, Clone, Default)]
pub struct MeshData {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    pub material_index: u32,
}

impl MeshData {
    pub fn triangle_count(&self) -> u32 {
        (self.indices.len() / 3) as u32
    }
}

/// Placement of one mesh in world space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SceneInstance {
    pub mesh_index: u32,
    /// Column-major object-to-world transform
    pub transform: Mat4,
    pub material_index: u32,
}

/// Where a mesh landed in the flattened vertex and index arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MeshRange {
    pub vertex_offset: u32,
    pub index_offset: u32,
}

/// All meshes concatenated, ready for upload.
#[derive(Debug, Clone, Default)]
pub struct FlattenedScene {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    pub ranges: Vec<MeshRange>,
    pub instance_data: Vec<InstanceData>,
}

/// CPU-side scene description.
#[derive(Debug, Clone, Default)]
pub struct Scene {
    pub meshes: Vec<MeshData>,
    pub instances: Vec<SceneInstance>,
    pub materials: Vec<Material>,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a mesh and return its index.
    pub fn add_mesh(&mut self, mesh: MeshData) -> u32 {
        self.meshes.push(mesh);
        (self.meshes.len() - 1) as u32
    }

    pub fn add_instance(&mut self, mesh_index: u32, transform: Mat4, material_index: u32) {
        self.instances.push(SceneInstance {
            mesh_index,
            transform,
            material_index,
        });
    }

    /// UV sphere with `(stacks + 1) * (slices + 1)` vertices, placed once at identity.
    pub fn add_sphere(&mut self, center: Vec3, radius: f32, material_index: u32, stacks: u32, slices: u32) {
        let mut mesh = MeshData {
            material_index,
            ..Default::default()
        };

        for i in 0..=stacks {
            let phi = PI * i as f32 / stacks as f32;
            for j in 0..=slices {
                let theta = 2.0 * PI * j as f32 / slices as f32;
                let normal = Vec3::new(phi.sin() * theta.cos(), phi.cos(), phi.sin() * theta.sin());
                mesh.vertices.push(Vertex {
                    position: center + normal * radius,
                    normal,
                    uv: Vec2::new(j as f32 / slices as f32, i as f32 / stacks as f32),
                });
            }
        }

        for i in 0..stacks {
            for j in 0..slices {
                let a = i * (slices + 1) + j;
                let b = a + slices + 1;
                mesh.indices.extend_from_slice(&[a, b, a + 1, b, b + 1, a + 1]);
            }
        }

        let mesh_index = self.add_mesh(mesh);
        self.add_instance(mesh_index, Mat4::IDENTITY, material_index);
    }

    /// Upward-facing quad in the XZ plane, placed once at identity.
    pub fn add_plane(&mut self, center: Vec3, half_width: f32, half_depth: f32, material_index: u32) {
        let n = Vec3::Y;
        let corner = |x: f32, z: f32, u: f32, v: f32| Vertex {
            position: center + Vec3::new(x, 0.0, z),
            normal: n,
            uv: Vec2::new(u, v),
        };
        let mesh = MeshData {
            vertices: vec![
                corner(-half_width, -half_depth, 0.0, 0.0),
                corner(half_width, -half_depth, 1.0, 0.0),
                corner(half_width, half_depth, 1.0, 1.0),
                corner(-half_width, half_depth, 0.0, 1.0),
            ],
            indices: vec![0, 1, 2, 0, 2, 3],
            material_index,
        };

        let mesh_index = self.add_mesh(mesh);
        self.add_instance(mesh_index, Mat4::IDENTITY, material_index);
    }

    /// Floor, four spheres of different materials and a spherical area light.
    pub fn demo() -> Self {
        let mut scene = Self::new();

        scene.materials = vec![
            Material::new(MaterialKind::Diffuse, Vec3::new(0.8, 0.8, 0.8), 0.95),
            Material::new(MaterialKind::Diffuse, Vec3::new(0.8, 0.15, 0.1), 0.9),
            Material::new(MaterialKind::Metal, Vec3::new(1.0, 0.78, 0.2), 0.1),
            Material::new(MaterialKind::Glass, Vec3::new(0.95, 0.98, 1.0), 0.0),
            Material::new(MaterialKind::Diffuse, Vec3::new(1.0, 0.9, 0.8), 0.9)
                .with_emission(Vec3::new(6.0, 5.0, 4.5)),
            Material::new(MaterialKind::Diffuse, Vec3::new(0.2, 0.3, 0.9), 0.85),
        ];

        scene.add_plane(Vec3::new(0.0, -1.0, 0.0), 6.0, 6.0, 0);
        scene.add_sphere(Vec3::new(-2.0, 0.0, 0.0), 1.0, 1, 16, 32);
        scene.add_sphere(Vec3::new(0.0, 0.0, 0.0), 1.0, 2, 16, 32);
        scene.add_sphere(Vec3::new(2.0, 0.0, 0.0), 1.0, 3, 16, 32);
        scene.add_sphere(Vec3::new(-2.0, 0.0, -3.0), 1.0, 5, 16, 32);
        scene.add_sphere(Vec3::new(0.0, 4.5, 0.0), 0.6, 4, 16, 32);

        scene
    }

    /// Concatenate all meshes. Indices stay mesh-local; offsets select each slice.
    pub fn flatten(&self) -> FlattenedScene {
        let mut flat = FlattenedScene::default();

        for mesh in &self.meshes {
            let range = MeshRange {
                vertex_offset: flat.vertices.len() as u32,
                index_offset: flat.indices.len() as u32,
            };
            flat.instance_data.push(InstanceData {
                vertex_offset: range.vertex_offset,
                index_offset: range.index_offset,
                material_index: mesh.material_index,
                _pad: 0,
            });
            flat.ranges.push(range);
            flat.vertices.extend_from_slice(&mesh.vertices);
            flat.indices.extend_from_slice(&mesh.indices);
        }

        flat
    }
}

/// Device-resident scene tables.
#[derive(Debug, Default)]
pub struct GpuScene {
    pub vertices: GpuBuffer,
    pub indices: GpuBuffer,
    pub materials: GpuBuffer,
    pub instance_data: GpuBuffer,
    pub ranges: Vec<MeshRange>,
}

impl GpuScene {
    /// Upload the flattened scene through staging buffers.
    ///
    /// # Safety
    /// `device` must outlive the returned buffers, which are released by [`GpuScene::destroy`].
    pub unsafe fn upload<D: DeviceProvider + ?Sized>(device: &D, scene: &Scene) -> Result<Self> {
        let flat = scene.flatten();
        let geometry_usage = vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
            | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR;
        let table_usage = vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;

        let mut gpu = GpuScene {
            ranges: flat.ranges.clone(),
            ..Default::default()
        };

        let uploads: [(&mut GpuBuffer, &[u8], vk::BufferUsageFlags, &str); 4] = [
            (&mut gpu.vertices, bytemuck::cast_slice(&flat.vertices), geometry_usage, "scene_vertices"),
            (&mut gpu.indices, bytemuck::cast_slice(&flat.indices), geometry_usage, "scene_indices"),
            (&mut gpu.materials, bytemuck::cast_slice(&scene.materials), table_usage, "scene_materials"),
            (&mut gpu.instance_data, bytemuck::cast_slice(&flat.instance_data), table_usage, "scene_instance_data"),
        ];

        let mut result = Ok(());
        for (slot, bytes, usage, name) in uploads {
            match upload_buffer(device, bytes, usage, name) {
                Ok(buffer) => *slot = buffer,
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }

        if let Err(e) = result {
            gpu.destroy(device);
            return Err(e);
        }

        tracing::info!(
            vertices = flat.vertices.len(),
            indices = flat.indices.len(),
            materials = scene.materials.len(),
            meshes = flat.ranges.len(),
            "Scene uploaded"
        );
        Ok(gpu)
    }

    /// Release the four scene buffers. Safe to call more than once.
    pub unsafe fn destroy<D: DeviceProvider + ?Sized>(&mut self, device: &D) {
        device.free_buffer(&mut self.vertices);
        device.free_buffer(&mut self.indices);
        device.free_buffer(&mut self.materials);
        device.free_buffer(&mut self.instance_data);
    }
}

/// Copy `bytes` into a new device-local buffer via a host-visible staging buffer.
///
/// Empty input still yields a minimal allocation so descriptor bindings stay valid.
pub(crate) unsafe fn upload_buffer<D: DeviceProvider + ?Sized>(
    device: &D,
    bytes: &[u8],
    usage: vk::BufferUsageFlags,
    name: &str,
) -> Result<GpuBuffer> {
    let size = (bytes.len() as vk::DeviceSize).max(4);

    let mut staging = device.allocate_buffer(
        size,
        vk::BufferUsageFlags::TRANSFER_SRC,
        MemoryLocation::CpuToGpu,
        "staging",
    )?;

    let mut buffer = match device.allocate_buffer(
        size,
        usage | vk::BufferUsageFlags::TRANSFER_DST,
        MemoryLocation::GpuOnly,
        name,
    ) {
        Ok(b) => b,
        Err(e) => {
            device.free_buffer(&mut staging);
            return Err(e);
        }
    };

    let copied = device.write_buffer(&staging, 0, bytes).and_then(|()| {
        let (src, dst) = (staging.handle, buffer.handle);
        device.run_once(&mut |rec| rec.copy_buffer(src, dst, size))
    });

    device.free_buffer(&mut staging);
    match copied {
        Ok(()) => Ok(buffer),
        Err(e) => {
            device.free_buffer(&mut buffer);
            Err(e)
        }
    }
}
