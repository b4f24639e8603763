//! Real-time hardware ray tracing on Vulkan.
//!
//! Builds a two-level acceleration structure over a static scene, a ray
//! tracing pipeline with its shader binding table, and drives a
//! double-buffered trace, accumulate and present loop.

pub mod camera;
pub mod config;
pub mod device;
pub mod error;
pub mod frame;
pub mod raytracing;
pub mod renderer;
pub mod scene;
pub mod vulkan;

#[cfg(test)]
mod testing;

pub use camera::{Camera, InputState};
pub use config::RenderConfig;
pub use error::{Result, RtError};
pub use frame::FrameOutcome;
pub use raytracing::ShaderBinaries;
pub use renderer::Renderer;
pub use scene::Scene;
