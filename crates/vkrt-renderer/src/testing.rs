//! In-memory device for unit tests.
//!
//! Hands out fake handles and device addresses, logs every device call and
//! recorded command in order, and simulates fences: waiting on a pending
//! fence completes it.

use ash::vk;
use ash::vk::Handle;
use gpu_allocator::MemoryLocation;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

use crate::device::*;
use crate::error::{Result, RtError};

/// Device call or recorded command, in submission order.
#[derive(Debug, Clone)]
pub enum Event {
    AllocateBuffer { handle: vk::Buffer, size: vk::DeviceSize, usage: vk::BufferUsageFlags, location: MemoryLocation, name: String },
    WriteBuffer { handle: vk::Buffer, offset: vk::DeviceSize, len: usize },
    FreeBuffer(vk::Buffer),
    AllocateImage { handle: vk::Image, format: vk::Format, usage: vk::ImageUsageFlags },
    FreeImage(vk::Image),
    RunOnce,
    RunOnceComplete,
    WaitIdle,

    CreateAccelerationStructure { handle: vk::AccelerationStructureKHR, level: vk::AccelerationStructureTypeKHR, size: vk::DeviceSize },
    DestroyAccelerationStructure(vk::AccelerationStructureKHR),

    CreateShaderModule(vk::ShaderModule),
    DestroyShaderModule(vk::ShaderModule),
    CreateDescriptorSetLayout { bindings: Vec<(u32, vk::DescriptorType, vk::ShaderStageFlags)> },
    DestroyDescriptorSetLayout(vk::DescriptorSetLayout),
    CreatePipelineLayout { push_constants: vk::PushConstantRange },
    DestroyPipelineLayout(vk::PipelineLayout),
    CreateRayTracingPipeline { stages: Vec<vk::ShaderStageFlags>, groups: Vec<ShaderGroup>, max_recursion_depth: u32 },
    DestroyPipeline(vk::Pipeline),

    CreateFence(vk::Fence),
    DestroyFence(vk::Fence),
    WaitFence(vk::Fence),
    ResetFence(vk::Fence),
    CreateSemaphore(vk::Semaphore),
    DestroySemaphore(vk::Semaphore),
    FreeCommandBuffers(usize),
    BeginRecording(vk::CommandBuffer),
    EndRecording(vk::CommandBuffer),
    Submit(FrameSubmission),
    CreateDescriptorPool { sizes: Vec<(vk::DescriptorType, u32)>, max_sets: u32 },
    DestroyDescriptorPool(vk::DescriptorPool),
    WriteFrameBindings { set: vk::DescriptorSet, bindings: FrameBindings },

    // Recorded commands
    CopyBuffer { src: vk::Buffer, dst: vk::Buffer, size: vk::DeviceSize },
    MemoryBarrier(MemoryBarrier),
    ImageBarrier(ImageTransition),
    BuildAccelerationStructure(AccelerationBuild),
    BindPipeline { pipeline: vk::Pipeline, layout: vk::PipelineLayout, set: vk::DescriptorSet },
    PushConstants { stages: vk::ShaderStageFlags, data: Vec<u8> },
    TraceRays { regions: SbtRegions, extent: vk::Extent2D },
    BlitImage { src: vk::Image, dst: vk::Image },

    // Presentation
    Acquire { signal: vk::Semaphore, outcome: AcquireOutcome },
    Present { index: u32, wait: vk::Semaphore },
}

type Log = Rc<RefCell<Vec<Event>>>;

struct MockRecorder<'a> {
    log: &'a Log,
}

impl CommandRecorder for MockRecorder<'_> {
    fn copy_buffer(&mut self, src: vk::Buffer, dst: vk::Buffer, size: vk::DeviceSize) {
        self.log.borrow_mut().push(Event::CopyBuffer { src, dst, size });
    }

    fn memory_barrier(&mut self, barrier: MemoryBarrier) {
        self.log.borrow_mut().push(Event::MemoryBarrier(barrier));
    }

    fn image_barrier(&mut self, transition: ImageTransition) {
        self.log.borrow_mut().push(Event::ImageBarrier(transition));
    }

    fn build_acceleration_structure(&mut self, build: &AccelerationBuild) {
        self.log.borrow_mut().push(Event::BuildAccelerationStructure(*build));
    }

    fn bind_ray_tracing_pipeline(&mut self, pipeline: vk::Pipeline, layout: vk::PipelineLayout, set: vk::DescriptorSet) {
        self.log.borrow_mut().push(Event::BindPipeline { pipeline, layout, set });
    }

    fn push_constants(&mut self, _layout: vk::PipelineLayout, stages: vk::ShaderStageFlags, data: &[u8]) {
        self.log.borrow_mut().push(Event::PushConstants { stages, data: data.to_vec() });
    }

    fn trace_rays(&mut self, regions: &SbtRegions, extent: vk::Extent2D) {
        self.log.borrow_mut().push(Event::TraceRays { regions: *regions, extent });
    }

    fn blit_image(&mut self, src: vk::Image, dst: vk::Image, _extent: vk::Extent2D) {
        self.log.borrow_mut().push(Event::BlitImage { src, dst });
    }
}

pub const DEFAULT_LIMITS: DeviceLimits = DeviceLimits {
    scratch_alignment: 128,
    handle_size: 32,
    handle_alignment: 32,
    base_alignment: 64,
    max_ray_recursion_depth: 31,
};

pub struct MockDevice {
    log: Log,
    limits: DeviceLimits,
    next_handle: Cell<u64>,
    live_buffers: RefCell<HashSet<vk::Buffer>>,
    live_images: RefCell<HashSet<vk::Image>>,
    live_structures: RefCell<HashSet<vk::AccelerationStructureKHR>>,
    structure_addresses: RefCell<HashMap<vk::AccelerationStructureKHR, vk::DeviceAddress>>,
    contents: RefCell<HashMap<vk::Buffer, Vec<u8>>>,
    fences: RefCell<HashMap<vk::Fence, bool>>,
    allocations_until_failure: Cell<Option<u32>>,
    run_once_count: Cell<usize>,
    fail_pipeline: Cell<bool>,
    short_handles: Cell<bool>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_LIMITS)
    }

    pub fn with_limits(limits: DeviceLimits) -> Self {
        Self {
            log: Rc::new(RefCell::new(Vec::new())),
            limits,
            next_handle: Cell::new(1),
            live_buffers: RefCell::default(),
            live_images: RefCell::default(),
            live_structures: RefCell::default(),
            structure_addresses: RefCell::default(),
            contents: RefCell::default(),
            fences: RefCell::default(),
            allocations_until_failure: Cell::new(None),
            run_once_count: Cell::new(0),
            fail_pipeline: Cell::new(false),
            short_handles: Cell::new(false),
        }
    }

    fn next(&self) -> u64 {
        let n = self.next_handle.get();
        self.next_handle.set(n + 1);
        n
    }

    fn push(&self, event: Event) {
        self.log.borrow_mut().push(event);
    }

    fn check_allocation(&self) -> Result<()> {
        match self.allocations_until_failure.get() {
            Some(1) => {
                self.allocations_until_failure.set(None);
                Err(RtError::Vulkan {
                    context: "mock allocation",
                    result: vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
                })
            }
            Some(n) => {
                self.allocations_until_failure.set(Some(n - 1));
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Make the `n`-th buffer or image allocation from now fail (1-based).
    pub fn fail_allocation_at(&self, n: u32) {
        self.allocations_until_failure.set(Some(n));
    }

    pub fn fail_pipeline_creation(&self) {
        self.fail_pipeline.set(true);
    }

    pub fn return_short_handles(&self) {
        self.short_handles.set(true);
    }

    pub fn events(&self) -> Vec<Event> {
        self.log.borrow().clone()
    }

    pub fn clear_events(&self) {
        self.log.borrow_mut().clear();
    }

    pub fn run_once_count(&self) -> usize {
        self.run_once_count.get()
    }

    pub fn live_buffer_count(&self) -> usize {
        self.live_buffers.borrow().len()
    }

    pub fn live_image_count(&self) -> usize {
        self.live_images.borrow().len()
    }

    pub fn live_structure_count(&self) -> usize {
        self.live_structures.borrow().len()
    }

    /// Bytes written to a buffer, kept after the buffer is freed.
    pub fn contents(&self, buffer: vk::Buffer) -> Vec<u8> {
        self.contents.borrow().get(&buffer).cloned().unwrap_or_default()
    }

    pub fn fence_signaled(&self, fence: vk::Fence) -> bool {
        self.fences.borrow().get(&fence).copied().unwrap_or(false)
    }

    pub fn fence_states(&self) -> Vec<(vk::Fence, bool)> {
        let mut states: Vec<_> = self.fences.borrow().iter().map(|(f, s)| (*f, *s)).collect();
        states.sort_by_key(|(f, _)| f.as_raw());
        states
    }

    /// Presentation engine sharing this device's event log.
    pub fn presenter(&self, image_count: usize, extent: vk::Extent2D) -> MockPresenter {
        MockPresenter {
            log: Rc::clone(&self.log),
            images: (0..image_count).map(|i| vk::Image::from_raw(0xF000 + i as u64)).collect(),
            extent,
            script: VecDeque::new(),
            present_script: VecDeque::new(),
            next: 0,
        }
    }
}

impl DeviceProvider for MockDevice {
    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    unsafe fn allocate_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<GpuBuffer> {
        self.check_allocation()?;
        let n = self.next();
        let handle = vk::Buffer::from_raw(n);
        // Only 32-byte aligned so callers have to align scratch and table bases themselves
        let device_address = usage
            .contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
            .then_some(n * 0x1_0000 + 0x20);
        self.live_buffers.borrow_mut().insert(handle);
        self.push(Event::AllocateBuffer { handle, size, usage, location, name: name.to_string() });
        Ok(GpuBuffer { handle, size, device_address })
    }

    unsafe fn write_buffer(&self, buffer: &GpuBuffer, offset: vk::DeviceSize, data: &[u8]) -> Result<()> {
        let mut contents = self.contents.borrow_mut();
        let bytes = contents.entry(buffer.handle).or_default();
        let end = offset as usize + data.len();
        if bytes.len() < end {
            bytes.resize(end, 0);
        }
        bytes[offset as usize..end].copy_from_slice(data);
        self.push(Event::WriteBuffer { handle: buffer.handle, offset, len: data.len() });
        Ok(())
    }

    unsafe fn free_buffer(&self, buffer: &mut GpuBuffer) {
        if buffer.is_null() {
            return;
        }
        assert!(self.live_buffers.borrow_mut().remove(&buffer.handle), "double free of {:?}", buffer.handle);
        self.push(Event::FreeBuffer(buffer.handle));
        *buffer = GpuBuffer::default();
    }

    unsafe fn allocate_image(
        &self,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        _name: &str,
    ) -> Result<GpuImage> {
        self.check_allocation()?;
        let n = self.next();
        let handle = vk::Image::from_raw(n);
        self.live_images.borrow_mut().insert(handle);
        self.push(Event::AllocateImage { handle, format, usage });
        Ok(GpuImage {
            handle,
            view: vk::ImageView::from_raw(n),
            format,
            extent,
        })
    }

    unsafe fn free_image(&self, image: &mut GpuImage) {
        if image.is_null() {
            return;
        }
        assert!(self.live_images.borrow_mut().remove(&image.handle));
        self.push(Event::FreeImage(image.handle));
        *image = GpuImage::default();
    }

    unsafe fn run_once(&self, record: &mut dyn FnMut(&mut dyn CommandRecorder)) -> Result<()> {
        self.run_once_count.set(self.run_once_count.get() + 1);
        self.push(Event::RunOnce);
        record(&mut MockRecorder { log: &self.log });
        self.push(Event::RunOnceComplete);
        Ok(())
    }

    unsafe fn wait_idle(&self) -> Result<()> {
        self.push(Event::WaitIdle);
        Ok(())
    }
}

impl AccelerationStructureDevice for MockDevice {
    unsafe fn build_sizes(&self, geometry: &AccelerationGeometry, primitive_count: u32) -> Result<BuildSizes> {
        let count = primitive_count as u64;
        Ok(match geometry {
            AccelerationGeometry::Triangles(_) => BuildSizes {
                structure_size: 256 + 64 * count,
                scratch_size: 100 + 32 * count,
            },
            AccelerationGeometry::Instances { .. } => BuildSizes {
                structure_size: 256 + 128 * count,
                scratch_size: 100 + 16 * count,
            },
        })
    }

    unsafe fn create_acceleration_structure(
        &self,
        level: vk::AccelerationStructureTypeKHR,
        _storage: vk::Buffer,
        size: vk::DeviceSize,
    ) -> Result<vk::AccelerationStructureKHR> {
        let n = self.next();
        let handle = vk::AccelerationStructureKHR::from_raw(n);
        self.live_structures.borrow_mut().insert(handle);
        self.structure_addresses.borrow_mut().insert(handle, 0xA000_0000 + n * 0x1000);
        self.push(Event::CreateAccelerationStructure { handle, level, size });
        Ok(handle)
    }

    unsafe fn acceleration_structure_address(&self, handle: vk::AccelerationStructureKHR) -> vk::DeviceAddress {
        self.structure_addresses.borrow().get(&handle).copied().unwrap_or(0)
    }

    unsafe fn destroy_acceleration_structure(&self, handle: vk::AccelerationStructureKHR) {
        assert!(self.live_structures.borrow_mut().remove(&handle), "double destroy of {:?}", handle);
        self.push(Event::DestroyAccelerationStructure(handle));
    }
}

impl PipelineDevice for MockDevice {
    unsafe fn create_shader_module(&self, _code: &[u32]) -> Result<vk::ShaderModule> {
        let module = vk::ShaderModule::from_raw(self.next());
        self.push(Event::CreateShaderModule(module));
        Ok(module)
    }

    unsafe fn destroy_shader_module(&self, module: vk::ShaderModule) {
        self.push(Event::DestroyShaderModule(module));
    }

    unsafe fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> Result<vk::DescriptorSetLayout> {
        let bindings = bindings
            .iter()
            .map(|b| (b.binding, b.descriptor_type, b.stage_flags))
            .collect();
        self.push(Event::CreateDescriptorSetLayout { bindings });
        Ok(vk::DescriptorSetLayout::from_raw(self.next()))
    }

    unsafe fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.push(Event::DestroyDescriptorSetLayout(layout));
    }

    unsafe fn create_pipeline_layout(
        &self,
        _set_layout: vk::DescriptorSetLayout,
        push_constants: vk::PushConstantRange,
    ) -> Result<vk::PipelineLayout> {
        self.push(Event::CreatePipelineLayout { push_constants });
        Ok(vk::PipelineLayout::from_raw(self.next()))
    }

    unsafe fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        self.push(Event::DestroyPipelineLayout(layout));
    }

    unsafe fn create_ray_tracing_pipeline(&self, desc: &RayTracingPipelineDesc<'_>) -> Result<vk::Pipeline> {
        if self.fail_pipeline.get() {
            return Err(RtError::Vulkan {
                context: "vkCreateRayTracingPipelinesKHR",
                result: vk::Result::ERROR_UNKNOWN,
            });
        }
        self.push(Event::CreateRayTracingPipeline {
            stages: desc.stages.iter().map(|(stage, _)| *stage).collect(),
            groups: desc.groups.to_vec(),
            max_recursion_depth: desc.max_recursion_depth,
        });
        Ok(vk::Pipeline::from_raw(self.next()))
    }

    unsafe fn shader_group_handles(&self, _pipeline: vk::Pipeline, group_count: u32, data_size: usize) -> Result<Vec<u8>> {
        let handle_size = self.limits.handle_size as usize;
        // Group g's handle is filled with the byte g + 1
        let mut data: Vec<u8> = (0..group_count as usize)
            .flat_map(|g| std::iter::repeat((g + 1) as u8).take(handle_size))
            .collect();
        data.truncate(data_size);
        if self.short_handles.get() {
            data.truncate(data_size / 2);
        }
        Ok(data)
    }

    unsafe fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.push(Event::DestroyPipeline(pipeline));
    }
}

impl FrameDevice for MockDevice {
    unsafe fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let fence = vk::Fence::from_raw(self.next());
        self.fences.borrow_mut().insert(fence, signaled);
        self.push(Event::CreateFence(fence));
        Ok(fence)
    }

    unsafe fn destroy_fence(&self, fence: vk::Fence) {
        self.fences.borrow_mut().remove(&fence);
        self.push(Event::DestroyFence(fence));
    }

    unsafe fn wait_for_fence(&self, fence: vk::Fence) -> Result<()> {
        self.push(Event::WaitFence(fence));
        self.fences.borrow_mut().insert(fence, true);
        Ok(())
    }

    unsafe fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        self.push(Event::ResetFence(fence));
        self.fences.borrow_mut().insert(fence, false);
        Ok(())
    }

    unsafe fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let semaphore = vk::Semaphore::from_raw(self.next());
        self.push(Event::CreateSemaphore(semaphore));
        Ok(semaphore)
    }

    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.push(Event::DestroySemaphore(semaphore));
    }

    unsafe fn allocate_command_buffers(&self, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        Ok((0..count).map(|_| vk::CommandBuffer::from_raw(self.next())).collect())
    }

    unsafe fn free_command_buffers(&self, buffers: &[vk::CommandBuffer]) {
        self.push(Event::FreeCommandBuffers(buffers.len()));
    }

    unsafe fn record(
        &self,
        command_buffer: vk::CommandBuffer,
        record: &mut dyn FnMut(&mut dyn CommandRecorder),
    ) -> Result<()> {
        self.push(Event::BeginRecording(command_buffer));
        record(&mut MockRecorder { log: &self.log });
        self.push(Event::EndRecording(command_buffer));
        Ok(())
    }

    unsafe fn submit(&self, submission: &FrameSubmission) -> Result<()> {
        self.push(Event::Submit(*submission));
        Ok(())
    }

    unsafe fn create_descriptor_pool(&self, sizes: &[vk::DescriptorPoolSize], max_sets: u32) -> Result<vk::DescriptorPool> {
        self.push(Event::CreateDescriptorPool {
            sizes: sizes.iter().map(|s| (s.ty, s.descriptor_count)).collect(),
            max_sets,
        });
        Ok(vk::DescriptorPool::from_raw(self.next()))
    }

    unsafe fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        self.push(Event::DestroyDescriptorPool(pool));
    }

    unsafe fn allocate_descriptor_sets(
        &self,
        _pool: vk::DescriptorPool,
        _layout: vk::DescriptorSetLayout,
        count: u32,
    ) -> Result<Vec<vk::DescriptorSet>> {
        Ok((0..count).map(|_| vk::DescriptorSet::from_raw(self.next())).collect())
    }

    unsafe fn write_frame_bindings(&self, set: vk::DescriptorSet, bindings: &FrameBindings) {
        self.push(Event::WriteFrameBindings { set, bindings: *bindings });
    }
}

/// Presentation engine with scripted acquire results.
pub struct MockPresenter {
    log: Log,
    images: Vec<vk::Image>,
    extent: vk::Extent2D,
    script: VecDeque<AcquireOutcome>,
    present_script: VecDeque<PresentOutcome>,
    next: u32,
}

impl MockPresenter {
    /// Queue acquire results; once exhausted, images are handed out round-robin.
    pub fn script_acquires(&mut self, outcomes: impl IntoIterator<Item = AcquireOutcome>) {
        self.script.extend(outcomes);
    }

    pub fn script_presents(&mut self, outcomes: impl IntoIterator<Item = PresentOutcome>) {
        self.present_script.extend(outcomes);
    }
}

impl PresentationEngine for MockPresenter {
    fn image_count(&self) -> usize {
        self.images.len()
    }

    fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn image(&self, index: u32) -> vk::Image {
        self.images[index as usize]
    }

    unsafe fn acquire_next_image(&mut self, signal: vk::Semaphore) -> Result<AcquireOutcome> {
        let outcome = self.script.pop_front().unwrap_or_else(|| {
            let index = self.next;
            self.next = (self.next + 1) % self.images.len() as u32;
            AcquireOutcome::Acquired(index)
        });
        self.log.borrow_mut().push(Event::Acquire { signal, outcome });
        Ok(outcome)
    }

    unsafe fn present(&mut self, index: u32, wait: vk::Semaphore) -> Result<PresentOutcome> {
        self.log.borrow_mut().push(Event::Present { index, wait });
        Ok(self.present_script.pop_front().unwrap_or(PresentOutcome::Presented))
    }
}
