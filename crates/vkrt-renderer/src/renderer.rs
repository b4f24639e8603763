//! Renderer lifecycle: setup in dependency order, per-frame drawing and
//! teardown in reverse.

use crate::camera::Camera;
use crate::config::RenderConfig;
use crate::device::{PresentationEngine, RayTracingDevice};
use crate::error::Result;
use crate::frame::{FrameOrchestrator, FrameOutcome, FrameSetup};
use crate::raytracing::{build_pipeline, RayTracingPipeline, SceneAccelerationStructures, ShaderBinaries, ShaderBindingTable};
use crate::scene::{GpuScene, Scene};

/// Everything built for one scene on one device.
///
/// The renderer does not own the device or the swapchain; both are passed to
/// every call and must outlive it. Call [`Renderer::destroy`] before dropping
/// the device.
#[derive(Debug, Default)]
pub struct Renderer {
    pub scene: GpuScene,
    pub structures: SceneAccelerationStructures,
    pub pipeline: RayTracingPipeline,
    pub sbt: ShaderBindingTable,
    pub frames: FrameOrchestrator,
}

impl Renderer {
    /// Upload the scene, build BLASes then the TLAS, the pipeline and its
    /// binding table, and finally the frame resources. On failure whatever
    /// was created is released before the error is returned.
    pub unsafe fn new<D, P>(
        device: &D,
        presenter: &P,
        scene: &Scene,
        config: &RenderConfig,
        binaries: &ShaderBinaries,
    ) -> Result<Self>
    where
        D: RayTracingDevice + ?Sized,
        P: PresentationEngine + ?Sized,
    {
        let mut renderer = Self::default();
        if let Err(e) = renderer.build(device, presenter, scene, config, binaries) {
            tracing::error!("Renderer setup failed: {}", e);
            renderer.release(device);
            return Err(e);
        }
        tracing::info!(
            meshes = scene.meshes.len(),
            instances = scene.instances.len(),
            "Renderer ready"
        );
        Ok(renderer)
    }

    unsafe fn build<D, P>(
        &mut self,
        device: &D,
        presenter: &P,
        scene: &Scene,
        config: &RenderConfig,
        binaries: &ShaderBinaries,
    ) -> Result<()>
    where
        D: RayTracingDevice + ?Sized,
        P: PresentationEngine + ?Sized,
    {
        self.scene = GpuScene::upload(device, scene)?;
        self.structures = SceneAccelerationStructures::build(device, &scene.meshes, &scene.instances, &self.scene)?;

        let (pipeline, sbt) = build_pipeline(device, binaries)?;
        self.pipeline = pipeline;
        self.sbt = sbt;

        self.frames = FrameOrchestrator::new(
            device,
            presenter,
            &FrameSetup {
                pipeline: &self.pipeline,
                sbt_regions: self.sbt.regions,
                top_level: self.structures.top.structure.handle,
                scene: &self.scene,
                push_constants: config.push_constants(),
            },
        )?;
        Ok(())
    }

    /// Trace, accumulate and present one frame from the camera's point of view.
    pub unsafe fn draw_frame<D, P>(
        &mut self,
        device: &D,
        presenter: &mut P,
        camera: &Camera,
        aspect: f32,
    ) -> Result<FrameOutcome>
    where
        D: RayTracingDevice + ?Sized,
        P: PresentationEngine + ?Sized,
    {
        self.frames.draw_frame(device, presenter, &camera.frame_input(aspect))
    }

    /// Wait for the device to go idle, then release everything. Idempotent.
    pub unsafe fn destroy<D: RayTracingDevice + ?Sized>(&mut self, device: &D) {
        if let Err(e) = device.wait_idle() {
            tracing::warn!("Device wait before teardown failed: {}", e);
        }
        self.release(device);
    }

    unsafe fn release<D: RayTracingDevice + ?Sized>(&mut self, device: &D) {
        self.frames.destroy(device);
        self.sbt.destroy(device);
        self.pipeline.destroy(device);
        self.structures.destroy(device);
        self.scene.destroy(device);
    }
}
