//! Run-time render configuration.
//!
//! Parsed from command-line flags; anything not given keeps its default.

use std::path::PathBuf;

use crate::error::{Result, RtError};
use crate::raytracing::pipeline::PushConstants;

/// Render configuration settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderConfig {
    /// Window and accumulation image width
    pub width: u32,
    /// Window and accumulation image height
    pub height: u32,
    /// Directory holding the precompiled SPIR-V programs
    pub shader_dir: PathBuf,
    pub max_bounces: u32,
    pub samples_per_frame: u32,
    /// Enable the Khronos validation layer and route its messages to `tracing`
    pub validation: bool,
    pub vsync: bool,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            shader_dir: PathBuf::from("shaders"),
            max_bounces: 4,
            samples_per_frame: 1,
            validation: cfg!(debug_assertions),
            vsync: true,
        }
    }
}

impl RenderConfig {
    /// Parse flags (program name already stripped).
    ///
    /// `--width N --height N --shaders DIR --bounces N --spp N
    /// --validation --no-validation --no-vsync`
    pub fn from_args<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut config = Self::default();
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            let flag = arg.as_ref();
            let mut value = || {
                args.next()
                    .map(|v| v.as_ref().to_string())
                    .ok_or_else(|| RtError::InvalidConfig(format!("{} needs a value", flag)))
            };

            match flag {
                "--width" => config.width = parse_number(flag, &value()?)?,
                "--height" => config.height = parse_number(flag, &value()?)?,
                "--shaders" => config.shader_dir = PathBuf::from(value()?),
                "--bounces" => config.max_bounces = parse_number(flag, &value()?)?,
                "--spp" => config.samples_per_frame = parse_number(flag, &value()?)?,
                "--validation" => config.validation = true,
                "--no-validation" => config.validation = false,
                "--no-vsync" => config.vsync = false,
                other => return Err(RtError::InvalidConfig(format!("unknown flag '{}'", other))),
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(RtError::InvalidConfig(format!(
                "resolution {}x{} must be non-zero",
                self.width, self.height
            )));
        }
        if self.max_bounces == 0 {
            return Err(RtError::InvalidConfig("--bounces must be at least 1".into()));
        }
        if self.samples_per_frame == 0 {
            return Err(RtError::InvalidConfig("--spp must be at least 1".into()));
        }
        Ok(())
    }

    pub fn aspect(&self) -> f32 {
        self.width as f32 / self.height as f32
    }

    pub fn push_constants(&self) -> PushConstants {
        PushConstants {
            max_bounces: self.max_bounces,
            samples_per_frame: self.samples_per_frame,
        }
    }
}

fn parse_number(flag: &str, value: &str) -> Result<u32> {
    value
        .parse()
        .map_err(|_| RtError::InvalidConfig(format!("{} expects a number, got '{}'", flag, value)))
}
