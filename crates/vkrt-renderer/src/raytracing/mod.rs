//! Ray tracing via Vulkan KHR extensions.
//!
//! Acceleration structure builds (one BLAS per mesh, one TLAS over all
//! instances), the ray tracing pipeline and its shader binding table.

pub mod acceleration;
pub mod pipeline;
pub mod sbt;

pub use acceleration::{BottomLevel, InstanceEntry, SceneAccelerationStructures, TopLevel};
pub use pipeline::{build_pipeline, PushConstants, RayTracingPipeline, ShaderBinaries};
pub use sbt::{SbtLayout, ShaderBindingTable};
