//! Fly camera and the per-frame uniform record derived from it.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

/// Per-frame uniform record (144 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct CameraUniform {
    pub inverse_view: Mat4,
    pub inverse_projection: Mat4,
    /// Samples already accumulated before this frame
    pub sample_count: u32,
    pub frame_index: u32,
    pub _pad: [u32; 2],
}

/// Camera matrices and motion flag handed to the frame loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameInput {
    pub inverse_view: Mat4,
    pub inverse_projection: Mat4,
    pub moved: bool,
}

/// Keys and mouse state the controller reacts to.
#[derive(Debug, Clone, Copy, Default)]
pub struct InputState {
    pub forward: bool,
    pub back: bool,
    pub left: bool,
    pub right: bool,
    pub up: bool,
    pub down: bool,
    /// Right mouse button held
    pub looking: bool,
    /// Accumulated cursor motion in pixels since the last update
    pub mouse_delta: (f64, f64),
}

/// Look-at camera with WASD/QE movement and right-drag mouse look.
#[derive(Debug, Clone)]
pub struct Camera {
    pub position: Vec3,
    pub target: Vec3,
    pub up: Vec3,
    /// Vertical field of view in degrees
    pub fov: f32,
    /// Set whenever position or orientation changed; resets accumulation
    pub moved: bool,
    speed: f32,
    sensitivity: f32,
    yaw: f32,
    pitch: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 1.5, 5.0),
            target: Vec3::ZERO,
            up: Vec3::Y,
            fov: 60.0,
            moved: true,
            speed: 3.0,
            sensitivity: 0.15,
            yaw: -90.0,
            pitch: 0.0,
        }
    }
}

impl Camera {
    pub fn view(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.target, self.up)
    }

    /// Right-handed projection, Y not flipped. The generation program flips NDC-y.
    pub fn projection(&self, aspect: f32) -> Mat4 {
        Mat4::perspective_rh(self.fov.to_radians(), aspect, 0.01, 1000.0)
    }

    pub fn frame_input(&self, aspect: f32) -> FrameInput {
        FrameInput {
            inverse_view: self.view().inverse(),
            inverse_projection: self.projection(aspect).inverse(),
            moved: self.moved,
        }
    }

    /// Apply one tick of input. Clears `moved` first, then sets it on any change.
    pub fn update(&mut self, input: &InputState, dt: f32) {
        self.moved = false;

        let forward = (self.target - self.position).normalize();
        let right = forward.cross(self.up).normalize();
        let step = self.speed * dt;

        let moves = [
            (input.forward, forward),
            (input.back, -forward),
            (input.left, -right),
            (input.right, right),
            (input.up, self.up),
            (input.down, -self.up),
        ];
        for (pressed, dir) in moves {
            if pressed {
                self.position += dir * step;
                self.moved = true;
            }
        }

        if input.looking {
            let (dx, dy) = input.mouse_delta;
            if dx != 0.0 || dy != 0.0 {
                self.yaw += (dx * self.sensitivity as f64) as f32;
                self.pitch = (self.pitch - (dy * self.sensitivity as f64) as f32).clamp(-89.0, 89.0);
                let (yaw, pitch) = (self.yaw.to_radians(), self.pitch.to_radians());
                let dir = Vec3::new(yaw.cos() * pitch.cos(), pitch.sin(), yaw.sin() * pitch.cos());
                self.target = self.position + dir.normalize();
                self.moved = true;
            }
        }

        if self.moved {
            self.target = self.position + (self.target - self.position).normalize();
        }
    }
}
