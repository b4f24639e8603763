//! Double-buffered frame loop.
//!
//! Two frame slots cycle round-robin, each with its own command buffer,
//! "image acquired" semaphore, in-flight fence, camera uniform buffer and
//! descriptor set. "Render complete" semaphores are sized to the swapchain
//! image count instead, and `images_in_flight` remembers which slot fence
//! last used each swapchain image.

use ash::vk;
use gpu_allocator::MemoryLocation;

use crate::camera::{CameraUniform, FrameInput};
use crate::device::{
    AcquireOutcome, DeviceProvider, FrameBindings, FrameDevice, FrameSubmission, GpuBuffer, GpuImage,
    ImageTransition, PresentOutcome, PresentationEngine, SbtRegions,
};
use crate::error::Result;
use crate::raytracing::pipeline::PushConstants;
use crate::raytracing::RayTracingPipeline;
use crate::scene::GpuScene;

/// Number of frame slots.
pub const FRAMES_IN_FLIGHT: usize = 2;

pub const ACCUMULATION_FORMAT: vk::Format = vk::Format::R32G32B32A32_SFLOAT;

/// Progressive sample counter. Reset by camera motion, otherwise +1 per frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct SampleAccumulator {
    count: u32,
    started: bool,
}

impl SampleAccumulator {
    /// Count for the frame about to be recorded.
    pub fn advance(&mut self, moved: bool) -> u32 {
        if moved || !self.started {
            self.count = 0;
            self.started = true;
        } else {
            self.count = self.count.saturating_add(1);
        }
        self.count
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}

/// Per-slot resources.
#[derive(Debug, Default)]
pub struct FrameSlot {
    pub command_buffer: vk::CommandBuffer,
    pub image_acquired: vk::Semaphore,
    pub in_flight: vk::Fence,
    pub uniform: GpuBuffer,
    pub descriptor_set: vk::DescriptorSet,
}

/// What happened to one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented { image_index: u32, sample_count: u32 },
    /// Surface went stale during acquire; nothing was recorded or submitted
    Skipped,
}

/// Resources the frame loop binds but does not own.
#[derive(Debug, Clone, Copy)]
pub struct FrameSetup<'a> {
    pub pipeline: &'a RayTracingPipeline,
    pub sbt_regions: SbtRegions,
    pub top_level: vk::AccelerationStructureKHR,
    pub scene: &'a GpuScene,
    pub push_constants: PushConstants,
}

/// Descriptor pool sizes for `sets` copies of the frame binding layout.
pub fn descriptor_pool_sizes(sets: u32) -> [vk::DescriptorPoolSize; 4] {
    let size = |ty, descriptor_count| vk::DescriptorPoolSize { ty, descriptor_count };
    [
        size(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR, sets),
        size(vk::DescriptorType::STORAGE_IMAGE, sets),
        size(vk::DescriptorType::UNIFORM_BUFFER, sets),
        size(vk::DescriptorType::STORAGE_BUFFER, 4 * sets),
    ]
}

#[derive(Debug, Default)]
pub struct FrameOrchestrator {
    slots: [FrameSlot; FRAMES_IN_FLIGHT],
    /// One per swapchain image
    render_complete: Vec<vk::Semaphore>,
    /// Fence of the slot that last rendered into each swapchain image
    images_in_flight: Vec<vk::Fence>,
    accumulation: GpuImage,
    descriptor_pool: vk::DescriptorPool,
    pipeline: vk::Pipeline,
    pipeline_layout: vk::PipelineLayout,
    sbt_regions: SbtRegions,
    push_constants: PushConstants,
    extent: vk::Extent2D,
    current: usize,
    accumulator: SampleAccumulator,
    /// Camera motion seen on a skipped cycle, applied on the next recorded one
    motion_pending: bool,
}

impl FrameOrchestrator {
    /// Create per-frame resources and move the accumulation image to `GENERAL`.
    pub unsafe fn new<D, P>(device: &D, presenter: &P, setup: &FrameSetup<'_>) -> Result<Self>
    where
        D: DeviceProvider + FrameDevice + ?Sized,
        P: PresentationEngine + ?Sized,
    {
        let mut frames = Self {
            pipeline: setup.pipeline.pipeline,
            pipeline_layout: setup.pipeline.layout,
            sbt_regions: setup.sbt_regions,
            push_constants: setup.push_constants,
            extent: presenter.extent(),
            ..Default::default()
        };

        match frames.create_resources(device, presenter.image_count(), setup) {
            Ok(()) => {
                tracing::info!(
                    slots = FRAMES_IN_FLIGHT,
                    swapchain_images = presenter.image_count(),
                    width = frames.extent.width,
                    height = frames.extent.height,
                    "Frame resources created"
                );
                Ok(frames)
            }
            Err(e) => {
                frames.destroy(device);
                Err(e)
            }
        }
    }

    unsafe fn create_resources<D>(&mut self, device: &D, image_count: usize, setup: &FrameSetup<'_>) -> Result<()>
    where
        D: DeviceProvider + FrameDevice + ?Sized,
    {
        self.accumulation = device.allocate_image(
            self.extent,
            ACCUMULATION_FORMAT,
            vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_SRC,
            "accumulation",
        )?;
        let image = self.accumulation.handle;
        device.run_once(&mut |rec| {
            rec.image_barrier(ImageTransition::new(image, vk::ImageLayout::UNDEFINED, vk::ImageLayout::GENERAL))
        })?;

        let uniform_size = std::mem::size_of::<CameraUniform>() as vk::DeviceSize;
        for slot in &mut self.slots {
            slot.uniform = device.allocate_buffer(
                uniform_size,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                MemoryLocation::CpuToGpu,
                "camera_uniform",
            )?;
            slot.in_flight = device.create_fence(true)?;
            slot.image_acquired = device.create_semaphore()?;
        }

        for _ in 0..image_count {
            let semaphore = device.create_semaphore()?;
            self.render_complete.push(semaphore);
        }
        self.images_in_flight = vec![vk::Fence::null(); image_count];

        let buffers = device.allocate_command_buffers(FRAMES_IN_FLIGHT as u32)?;
        for (slot, cmd) in self.slots.iter_mut().zip(buffers) {
            slot.command_buffer = cmd;
        }

        let set_count = FRAMES_IN_FLIGHT as u32;
        self.descriptor_pool = device.create_descriptor_pool(&descriptor_pool_sizes(set_count), set_count)?;
        let sets = device.allocate_descriptor_sets(
            self.descriptor_pool,
            setup.pipeline.descriptor_set_layout,
            set_count,
        )?;

        for (slot, set) in self.slots.iter_mut().zip(sets) {
            slot.descriptor_set = set;
            device.write_frame_bindings(
                set,
                &FrameBindings {
                    top_level: setup.top_level,
                    accumulation_view: self.accumulation.view,
                    uniform: slot.uniform.handle,
                    uniform_size,
                    vertices: setup.scene.vertices.handle,
                    indices: setup.scene.indices.handle,
                    materials: setup.scene.materials.handle,
                    instances: setup.scene.instance_data.handle,
                },
            );
        }

        Ok(())
    }

    pub fn current_slot(&self) -> usize {
        self.current
    }

    pub fn images_in_flight(&self) -> &[vk::Fence] {
        &self.images_in_flight
    }

    pub fn slot_fence(&self, slot: usize) -> vk::Fence {
        self.slots[slot].in_flight
    }

    pub fn render_complete(&self) -> &[vk::Semaphore] {
        &self.render_complete
    }

    pub fn accumulation_image(&self) -> vk::Image {
        self.accumulation.handle
    }

    /// Run one acquire, record, submit, present cycle on the current slot.
    pub unsafe fn draw_frame<D, P>(&mut self, device: &D, presenter: &mut P, input: &FrameInput) -> Result<FrameOutcome>
    where
        D: DeviceProvider + FrameDevice + ?Sized,
        P: PresentationEngine + ?Sized,
    {
        let f = self.current;
        let fence = self.slots[f].in_flight;
        self.motion_pending |= input.moved;

        device.wait_for_fence(fence)?;

        let image_index = match presenter.acquire_next_image(self.slots[f].image_acquired)? {
            AcquireOutcome::Acquired(index) => index,
            AcquireOutcome::Stale => {
                tracing::warn!(slot = f, "Swapchain out of date, skipping frame");
                return Ok(FrameOutcome::Skipped);
            }
        };
        let k = image_index as usize;

        let previous = self.images_in_flight[k];
        if previous != vk::Fence::null() && previous != fence {
            device.wait_for_fence(previous)?;
        }
        self.images_in_flight[k] = fence;

        device.reset_fence(fence)?;

        let sample_count = self.accumulator.advance(self.motion_pending);
        self.motion_pending = false;
        let uniform = CameraUniform {
            inverse_view: input.inverse_view,
            inverse_projection: input.inverse_projection,
            sample_count,
            frame_index: f as u32,
            _pad: [0; 2],
        };
        device.write_buffer(&self.slots[f].uniform, 0, bytemuck::bytes_of(&uniform))?;

        let swap_image = presenter.image(image_index);
        self.record(device, f, swap_image)?;

        let render_complete = self.render_complete[k];
        device.submit(&FrameSubmission {
            command_buffer: self.slots[f].command_buffer,
            wait_semaphore: self.slots[f].image_acquired,
            wait_stage: vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
            signal_semaphore: render_complete,
            fence,
        })?;

        if presenter.present(image_index, render_complete)? == PresentOutcome::Stale {
            tracing::warn!(image = image_index, "Swapchain out of date at present");
        }

        self.current = (f + 1) % FRAMES_IN_FLIGHT;
        Ok(FrameOutcome::Presented { image_index, sample_count })
    }

    unsafe fn record<D>(&self, device: &D, f: usize, swap_image: vk::Image) -> Result<()>
    where
        D: FrameDevice + ?Sized,
    {
        let slot = &self.slots[f];
        let accumulation = self.accumulation.handle;
        let (pipeline, layout, set) = (self.pipeline, self.pipeline_layout, slot.descriptor_set);
        let (regions, extent) = (self.sbt_regions, self.extent);
        let push = self.push_constants;

        device.record(slot.command_buffer, &mut |rec| {
            rec.bind_ray_tracing_pipeline(pipeline, layout, set);
            rec.push_constants(layout, PushConstants::STAGES, bytemuck::bytes_of(&push));
            rec.trace_rays(&regions, extent);

            rec.image_barrier(ImageTransition::new(
                accumulation,
                vk::ImageLayout::GENERAL,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            ));
            rec.image_barrier(ImageTransition::new(
                swap_image,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            ));
            rec.blit_image(accumulation, swap_image, extent);
            rec.image_barrier(ImageTransition::new(
                accumulation,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::ImageLayout::GENERAL,
            ));
            rec.image_barrier(ImageTransition::new(
                swap_image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::PRESENT_SRC_KHR,
            ));
        })
    }

    /// Release everything created by [`FrameOrchestrator::new`]. Null handles
    /// are skipped, so this is safe after a partial construction or a second call.
    pub unsafe fn destroy<D>(&mut self, device: &D)
    where
        D: DeviceProvider + FrameDevice + ?Sized,
    {
        if self.descriptor_pool != vk::DescriptorPool::null() {
            device.destroy_descriptor_pool(self.descriptor_pool);
            self.descriptor_pool = vk::DescriptorPool::null();
        }

        let buffers: Vec<vk::CommandBuffer> = self
            .slots
            .iter()
            .map(|s| s.command_buffer)
            .filter(|&cmd| cmd != vk::CommandBuffer::null())
            .collect();
        if !buffers.is_empty() {
            device.free_command_buffers(&buffers);
        }

        for semaphore in self.render_complete.drain(..) {
            device.destroy_semaphore(semaphore);
        }
        self.images_in_flight.clear();

        for slot in &mut self.slots {
            if slot.image_acquired != vk::Semaphore::null() {
                device.destroy_semaphore(slot.image_acquired);
            }
            if slot.in_flight != vk::Fence::null() {
                device.destroy_fence(slot.in_flight);
            }
            device.free_buffer(&mut slot.uniform);
            *slot = FrameSlot::default();
        }

        device.free_image(&mut self.accumulation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Event, MockDevice, MockPresenter};
    use ash::vk::Handle;
    use glam::Mat4;
    use std::collections::HashMap;

    const EXTENT: vk::Extent2D = vk::Extent2D { width: 64, height: 32 };

    fn input(moved: bool) -> FrameInput {
        FrameInput {
            inverse_view: Mat4::IDENTITY,
            inverse_projection: Mat4::IDENTITY,
            moved,
        }
    }

    struct Fixture {
        device: MockDevice,
        presenter: MockPresenter,
        frames: FrameOrchestrator,
    }

    fn fixture(image_count: usize) -> Fixture {
        let device = MockDevice::new();
        let presenter = device.presenter(image_count, EXTENT);
        let pipeline = RayTracingPipeline {
            descriptor_set_layout: vk::DescriptorSetLayout::from_raw(0xD0),
            layout: vk::PipelineLayout::from_raw(0xD1),
            pipeline: vk::Pipeline::from_raw(0xD2),
        };
        let scene = GpuScene::default();
        let setup = FrameSetup {
            pipeline: &pipeline,
            sbt_regions: SbtRegions::default(),
            top_level: vk::AccelerationStructureKHR::from_raw(0xA5),
            scene: &scene,
            push_constants: PushConstants::default(),
        };
        let frames = unsafe { FrameOrchestrator::new(&device, &presenter, &setup) }.unwrap();
        device.clear_events();
        Fixture { device, presenter, frames }
    }

    impl Fixture {
        fn draw(&mut self, moved: bool) -> FrameOutcome {
            unsafe { self.frames.draw_frame(&self.device, &mut self.presenter, &input(moved)) }.unwrap()
        }
    }

    // ============================================================
    // Sample accumulation
    // ============================================================

    #[test]
    fn test_accumulator_starts_at_zero() {
        let mut acc = SampleAccumulator::default();
        assert_eq!(acc.advance(false), 0);
        assert_eq!(acc.advance(false), 1);
        assert_eq!(acc.advance(false), 2);
    }

    #[test]
    fn test_accumulator_resets_on_motion() {
        let mut acc = SampleAccumulator::default();
        let counts: Vec<u32> = [true, false, false, true, false, true, true, false]
            .iter()
            .map(|&moved| acc.advance(moved))
            .collect();
        assert_eq!(counts, vec![0, 1, 2, 0, 1, 0, 0, 1]);
    }

    // ============================================================
    // Setup
    // ============================================================

    #[test]
    fn test_descriptor_pool_sizes() {
        let sizes = descriptor_pool_sizes(2);
        let storage = sizes.iter().find(|s| s.ty == vk::DescriptorType::STORAGE_BUFFER).unwrap();
        assert_eq!(storage.descriptor_count, 8);
        assert!(sizes.iter().filter(|s| s.ty != vk::DescriptorType::STORAGE_BUFFER).all(|s| s.descriptor_count == 2));
    }

    #[test]
    fn test_new_sizes_collections_separately() {
        let f = fixture(3);
        assert_eq!(f.frames.render_complete().len(), 3);
        assert_eq!(f.frames.images_in_flight().len(), 3);
        assert!(f.frames.images_in_flight().iter().all(|&fence| fence == vk::Fence::null()));
        assert_ne!(f.frames.slot_fence(0), f.frames.slot_fence(1));
        assert!(f.device.fence_signaled(f.frames.slot_fence(0)));
        assert!(f.device.fence_signaled(f.frames.slot_fence(1)));
    }

    #[test]
    fn test_new_transitions_accumulation_and_writes_bindings() {
        let device = MockDevice::new();
        let presenter = device.presenter(2, EXTENT);
        let pipeline = RayTracingPipeline::default();
        let scene = GpuScene::default();
        let setup = FrameSetup {
            pipeline: &pipeline,
            sbt_regions: SbtRegions::default(),
            top_level: vk::AccelerationStructureKHR::from_raw(0xA5),
            scene: &scene,
            push_constants: PushConstants::default(),
        };
        let mut frames = unsafe { FrameOrchestrator::new(&device, &presenter, &setup) }.unwrap();

        let events = device.events();
        let transition = events.iter().find_map(|e| match e {
            Event::ImageBarrier(t) => Some(*t),
            _ => None,
        });
        let transition = transition.unwrap();
        assert_eq!(transition.image, frames.accumulation_image());
        assert_eq!(transition.new_layout, vk::ImageLayout::GENERAL);
        assert!(events.iter().any(|e| matches!(
            e,
            Event::AllocateImage { format, .. } if *format == ACCUMULATION_FORMAT
        )));

        let writes: Vec<FrameBindings> = events
            .iter()
            .filter_map(|e| match e {
                Event::WriteFrameBindings { bindings, .. } => Some(*bindings),
                _ => None,
            })
            .collect();
        assert_eq!(writes.len(), 2);
        assert_ne!(writes[0].uniform, writes[1].uniform);
        assert!(writes.iter().all(|b| b.uniform_size == 144));

        unsafe { frames.destroy(&device) };
    }

    #[test]
    fn test_new_failure_releases_partial_state() {
        let device = MockDevice::new();
        let presenter = device.presenter(2, EXTENT);
        let pipeline = RayTracingPipeline::default();
        let scene = GpuScene::default();
        let setup = FrameSetup {
            pipeline: &pipeline,
            sbt_regions: SbtRegions::default(),
            top_level: vk::AccelerationStructureKHR::null(),
            scene: &scene,
            push_constants: PushConstants::default(),
        };
        // Accumulation image, first uniform, then the second uniform fails
        device.fail_allocation_at(3);
        let result = unsafe { FrameOrchestrator::new(&device, &presenter, &setup) };
        assert!(result.is_err());
        assert_eq!(device.live_buffer_count(), 0);
        assert_eq!(device.live_image_count(), 0);
        assert!(device.fence_states().is_empty());
    }

    // ============================================================
    // Frame cycle
    // ============================================================

    #[test]
    fn test_cycle_records_in_order() {
        let mut f = fixture(2);
        let outcome = f.draw(true);
        assert_eq!(outcome, FrameOutcome::Presented { image_index: 0, sample_count: 0 });

        let events = f.device.events();
        let begin = events.iter().position(|e| matches!(e, Event::BeginRecording(_))).unwrap();
        let end = events.iter().position(|e| matches!(e, Event::EndRecording(_))).unwrap();
        let recorded = &events[begin + 1..end];
        assert_eq!(recorded.len(), 8);

        assert!(matches!(recorded[0], Event::BindPipeline { .. }));
        assert!(matches!(&recorded[1], Event::PushConstants { data, .. } if data.len() == 8));
        assert!(matches!(recorded[2], Event::TraceRays { extent, .. } if extent == EXTENT));

        let accum = f.frames.accumulation_image();
        let swap = f.presenter.image(0);
        let layouts: Vec<(vk::Image, vk::ImageLayout, vk::ImageLayout)> = recorded
            .iter()
            .filter_map(|e| match e {
                Event::ImageBarrier(t) => Some((t.image, t.old_layout, t.new_layout)),
                _ => None,
            })
            .collect();
        assert_eq!(
            layouts,
            vec![
                (accum, vk::ImageLayout::GENERAL, vk::ImageLayout::TRANSFER_SRC_OPTIMAL),
                (swap, vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL),
                (accum, vk::ImageLayout::TRANSFER_SRC_OPTIMAL, vk::ImageLayout::GENERAL),
                (swap, vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::PRESENT_SRC_KHR),
            ]
        );
        assert!(matches!(recorded[5], Event::BlitImage { src, dst } if src == accum && dst == swap));
    }

    #[test]
    fn test_cycle_sequence() {
        let mut f = fixture(2);
        f.draw(false);
        let fence = f.frames.slot_fence(0);

        let events = f.device.events();
        let wait = events.iter().position(|e| matches!(e, Event::WaitFence(x) if *x == fence)).unwrap();
        let acquire = events.iter().position(|e| matches!(e, Event::Acquire { .. })).unwrap();
        let reset = events.iter().position(|e| matches!(e, Event::ResetFence(x) if *x == fence)).unwrap();
        let write = events.iter().position(|e| matches!(e, Event::WriteBuffer { .. })).unwrap();
        let begin = events.iter().position(|e| matches!(e, Event::BeginRecording(_))).unwrap();
        let submit = events.iter().position(|e| matches!(e, Event::Submit(_))).unwrap();
        let present = events.iter().position(|e| matches!(e, Event::Present { .. })).unwrap();
        assert!(wait < acquire && acquire < reset && reset < write && write < begin);
        assert!(begin < submit && submit < present);
    }

    #[test]
    fn test_submit_and_present_semaphores() {
        let mut f = fixture(3);
        f.presenter.script_acquires([AcquireOutcome::Acquired(2)]);
        f.draw(false);

        let events = f.device.events();
        let submission = events
            .iter()
            .find_map(|e| match e {
                Event::Submit(s) => Some(*s),
                _ => None,
            })
            .unwrap();
        let acquire_signal = events
            .iter()
            .find_map(|e| match e {
                Event::Acquire { signal, .. } => Some(*signal),
                _ => None,
            })
            .unwrap();

        assert_eq!(submission.wait_semaphore, acquire_signal);
        assert_eq!(submission.wait_stage, vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR);
        assert_eq!(submission.signal_semaphore, f.frames.render_complete()[2]);
        assert_eq!(submission.fence, f.frames.slot_fence(0));
        assert!(events.iter().any(|e| matches!(
            e,
            Event::Present { index: 2, wait } if *wait == f.frames.render_complete()[2]
        )));
    }

    #[test]
    fn test_slot_advances_round_robin() {
        let mut f = fixture(3);
        let mut slots = Vec::new();
        for _ in 0..5 {
            slots.push(f.frames.current_slot());
            f.draw(false);
        }
        assert_eq!(slots, vec![0, 1, 0, 1, 0]);
    }

    #[test]
    fn test_uniform_contents() {
        let mut f = fixture(2);
        f.draw(true);
        f.draw(false);
        f.draw(false);

        // Third cycle reuses slot 0
        let handle = f.frames.slots[0].uniform.handle;
        let bytes = f.device.contents(handle);
        let uniform: CameraUniform = bytemuck::pod_read_unaligned(&bytes[..144]);
        assert_eq!(uniform.sample_count, 2);
        assert_eq!(uniform.frame_index, 0);

        let handle = f.frames.slots[1].uniform.handle;
        let uniform: CameraUniform = bytemuck::pod_read_unaligned(&f.device.contents(handle)[..144]);
        assert_eq!(uniform.sample_count, 1);
        assert_eq!(uniform.frame_index, 1);
    }

    // ============================================================
    // Swapchain image reuse
    // ============================================================

    #[test]
    fn test_image_reuse_waits_for_previous_owner() {
        let mut f = fixture(3);
        // Cycles: slot0/img0, slot1/img1, slot0/img2, slot1/img0
        for _ in 0..3 {
            f.draw(false);
        }
        let slot0 = f.frames.slot_fence(0);
        let slot1 = f.frames.slot_fence(1);
        assert!(!f.device.fence_signaled(slot0));

        f.device.clear_events();
        f.draw(false);
        let waits: Vec<vk::Fence> = f
            .device
            .events()
            .iter()
            .filter_map(|e| match e {
                Event::WaitFence(fence) => Some(*fence),
                _ => None,
            })
            .collect();
        assert_eq!(waits, vec![slot1, slot0]);
        assert_eq!(f.frames.images_in_flight()[0], slot1);
    }

    #[test]
    fn test_no_image_rebound_before_owner_signaled() {
        let mut f = fixture(3);
        for i in 0..11 {
            f.draw(i % 4 == 0);
        }

        // Replay the log and check every reassignment of a swapchain image
        let mut signaled: HashMap<vk::Fence, bool> =
            [(f.frames.slot_fence(0), true), (f.frames.slot_fence(1), true)].into_iter().collect();
        let mut owner: HashMap<u32, vk::Fence> = HashMap::new();
        let mut acquired = None;
        let mut cycles = 0;

        for event in f.device.events() {
            match event {
                Event::WaitFence(fence) => {
                    signaled.insert(fence, true);
                }
                Event::Acquire { outcome: AcquireOutcome::Acquired(k), .. } => acquired = Some(k),
                Event::ResetFence(fence) => {
                    let k = acquired.take().unwrap();
                    if let Some(previous) = owner.get(&k) {
                        assert!(signaled[previous], "image {} rebound while {:?} pending", k, previous);
                    }
                    owner.insert(k, fence);
                    signaled.insert(fence, false);
                    cycles += 1;
                }
                _ => {}
            }
        }
        assert_eq!(cycles, 11);
    }

    // ============================================================
    // Stale surface
    // ============================================================

    #[test]
    fn test_stale_acquire_skips_cycle() {
        let mut f = fixture(2);
        f.draw(false);
        let fences_before = f.device.fence_states();
        let in_flight_before = f.frames.images_in_flight().to_vec();

        f.presenter.script_acquires([AcquireOutcome::Stale]);
        f.device.clear_events();
        assert_eq!(f.draw(false), FrameOutcome::Skipped);

        let events = f.device.events();
        assert!(events.iter().any(|e| matches!(e, Event::Acquire { outcome: AcquireOutcome::Stale, .. })));
        assert!(!events.iter().any(|e| matches!(
            e,
            Event::ResetFence(_) | Event::BeginRecording(_) | Event::Submit(_) | Event::Present { .. } | Event::WriteBuffer { .. }
        )));
        assert_eq!(f.device.fence_states(), fences_before);
        assert_eq!(f.frames.images_in_flight(), in_flight_before.as_slice());
        // The slot is retried on the next cycle
        assert_eq!(f.frames.current_slot(), 1);
    }

    #[test]
    fn test_motion_survives_skipped_cycle() {
        let mut f = fixture(2);
        assert!(matches!(f.draw(true), FrameOutcome::Presented { sample_count: 0, .. }));
        assert!(matches!(f.draw(false), FrameOutcome::Presented { sample_count: 1, .. }));

        f.presenter.script_acquires([AcquireOutcome::Stale]);
        assert_eq!(f.draw(true), FrameOutcome::Skipped);

        assert!(matches!(f.draw(false), FrameOutcome::Presented { sample_count: 0, .. }));
        assert!(matches!(f.draw(false), FrameOutcome::Presented { sample_count: 1, .. }));
    }

    #[test]
    fn test_stale_present_still_advances() {
        let mut f = fixture(2);
        f.presenter.script_presents([PresentOutcome::Stale]);
        assert!(matches!(f.draw(false), FrameOutcome::Presented { .. }));
        assert_eq!(f.frames.current_slot(), 1);
    }

    // ============================================================
    // Teardown
    // ============================================================

    #[test]
    fn test_destroy_releases_everything_once() {
        let mut f = fixture(3);
        f.draw(false);
        unsafe {
            f.frames.destroy(&f.device);
            f.frames.destroy(&f.device);
        }

        let events = f.device.events();
        let count = |pred: fn(&Event) -> bool| events.iter().filter(|e| pred(e)).count();
        assert_eq!(count(|e| matches!(e, Event::DestroyDescriptorPool(_))), 1);
        assert_eq!(count(|e| matches!(e, Event::FreeCommandBuffers(2))), 1);
        // Two image-acquired plus three render-complete
        assert_eq!(count(|e| matches!(e, Event::DestroySemaphore(_))), 5);
        assert_eq!(count(|e| matches!(e, Event::DestroyFence(_))), 2);
        assert_eq!(f.device.live_buffer_count(), 0);
        assert_eq!(f.device.live_image_count(), 0);
    }
}
