//! Shader Binding Table (SBT) layout and upload.
//!
//! The table is one buffer with three populated regions: ray generation (one
//! record), miss (primary then shadow) and hit (one triangles hit group). The
//! callable region is empty. Records are padded to the handle alignment and
//! every region starts on the base alignment.

use ash::vk;
use gpu_allocator::MemoryLocation;

use crate::device::{align_up, DeviceLimits, DeviceProvider, GpuBuffer, PipelineDevice, SbtRegions};
use crate::error::{Result, RtError};

/// Shader groups in pipeline order: raygen, primary miss, shadow miss, hit.
pub const GROUP_COUNT: u32 = 4;
pub const MISS_RECORD_COUNT: u64 = 2;

/// Byte layout of the table for a given set of device limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbtLayout {
    pub handle_size: u64,
    /// Handle size rounded up to the handle alignment
    pub handle_stride: u64,
    pub base_alignment: u64,
    pub raygen_size: u64,
    pub miss_size: u64,
    pub hit_size: u64,
}

impl SbtLayout {
    pub fn compute(limits: &DeviceLimits) -> Self {
        let handle_size = limits.handle_size as u64;
        let base_alignment = limits.base_alignment as u64;
        let handle_stride = align_up(handle_size, limits.handle_alignment as u64);

        Self {
            handle_size,
            handle_stride,
            base_alignment,
            raygen_size: align_up(handle_stride, base_alignment),
            miss_size: align_up(MISS_RECORD_COUNT * handle_stride, base_alignment),
            hit_size: align_up(handle_stride, base_alignment),
        }
    }

    pub fn miss_offset(&self) -> u64 {
        self.raygen_size
    }

    pub fn hit_offset(&self) -> u64 {
        self.raygen_size + self.miss_size
    }

    pub fn total_size(&self) -> u64 {
        self.raygen_size + self.miss_size + self.hit_size
    }

    /// Start offset of each group's record, in group order.
    pub fn record_offsets(&self) -> [u64; GROUP_COUNT as usize] {
        [
            0,
            self.miss_offset(),
            self.miss_offset() + self.handle_stride,
            self.hit_offset(),
        ]
    }

    /// Scatter tightly packed group handles into their padded record slots.
    pub fn pack(&self, handles: &[u8]) -> Result<Vec<u8>> {
        let h = self.handle_size as usize;
        let expected = h * GROUP_COUNT as usize;
        if handles.len() < expected {
            return Err(RtError::HandleData {
                expected,
                actual: handles.len(),
            });
        }

        let mut table = vec![0u8; self.total_size() as usize];
        for (group, offset) in self.record_offsets().iter().enumerate() {
            let offset = *offset as usize;
            table[offset..offset + h].copy_from_slice(&handles[group * h..(group + 1) * h]);
        }
        Ok(table)
    }

    /// Regions for the trace-rays command, given the table's base address.
    pub fn regions(&self, base: vk::DeviceAddress) -> SbtRegions {
        SbtRegions {
            // Ray generation stride must equal its size
            raygen: vk::StridedDeviceAddressRegionKHR {
                device_address: base,
                stride: self.raygen_size,
                size: self.raygen_size,
            },
            miss: vk::StridedDeviceAddressRegionKHR {
                device_address: base + self.miss_offset(),
                stride: self.handle_stride,
                size: self.miss_size,
            },
            hit: vk::StridedDeviceAddressRegionKHR {
                device_address: base + self.hit_offset(),
                stride: self.handle_stride,
                size: self.hit_size,
            },
            callable: vk::StridedDeviceAddressRegionKHR::default(),
        }
    }
}

/// Shader binding table buffer and the regions describing it.
#[derive(Debug, Default)]
pub struct ShaderBindingTable {
    pub buffer: GpuBuffer,
    pub regions: SbtRegions,
}

impl ShaderBindingTable {
    /// Fetch the pipeline's group handles and write the packed table.
    ///
    /// The buffer is over-allocated by one base alignment so the table can
    /// start on an aligned address whatever the allocator returns.
    pub unsafe fn build<D>(device: &D, pipeline: vk::Pipeline) -> Result<Self>
    where
        D: DeviceProvider + PipelineDevice + ?Sized,
    {
        let layout = SbtLayout::compute(&device.limits());
        let handles = device.shader_group_handles(
            pipeline,
            GROUP_COUNT,
            layout.handle_size as usize * GROUP_COUNT as usize,
        )?;
        let table = layout.pack(&handles)?;

        let mut sbt = ShaderBindingTable {
            buffer: device.allocate_buffer(
                layout.total_size() + layout.base_alignment,
                vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                MemoryLocation::CpuToGpu,
                "shader_binding_table",
            )?,
            regions: SbtRegions::default(),
        };

        let written = sbt.buffer.address("shader_binding_table").and_then(|address| {
            let base = align_up(address, layout.base_alignment);
            device.write_buffer(&sbt.buffer, base - address, &table)?;
            Ok(base)
        });

        match written {
            Ok(base) => {
                sbt.regions = layout.regions(base);
                tracing::debug!(
                    raygen = layout.raygen_size,
                    miss = layout.miss_size,
                    hit = layout.hit_size,
                    stride = layout.handle_stride,
                    "Shader binding table packed"
                );
                Ok(sbt)
            }
            Err(e) => {
                sbt.destroy(device);
                Err(e)
            }
        }
    }

    /// Free the table buffer. Safe to call more than once.
    pub unsafe fn destroy<D: DeviceProvider + ?Sized>(&mut self, device: &D) {
        device.free_buffer(&mut self.buffer);
        self.regions = SbtRegions::default();
    }
}
