//! Interactive viewer: opens a window, builds the demo scene and runs the
//! progressive ray tracing loop until the window closes.

use std::time::Instant;

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::{DeviceEvent, DeviceId, ElementState, MouseButton, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::{KeyCode, PhysicalKey};
use winit::window::{Window, WindowId};

use vkrt_renderer::device::PresentationEngine;
use vkrt_renderer::vulkan::{Swapchain, VulkanDevice};
use vkrt_renderer::{Camera, FrameOutcome, InputState, RenderConfig, Renderer, Scene, ShaderBinaries};

/// Everything that exists only while the window is open.
///
/// Fields drop in declaration order after `Drop` has released the GPU
/// objects, so the device goes before the window it presents to.
struct Running {
    renderer: Renderer,
    swapchain: Swapchain,
    device: VulkanDevice,
    window: Window,
}

impl Running {
    fn start(event_loop: &ActiveEventLoop, app: &App) -> anyhow::Result<Self> {
        let attributes = Window::default_attributes()
            .with_title("vkrt")
            .with_inner_size(PhysicalSize::new(app.config.width, app.config.height))
            .with_resizable(false);
        let window = event_loop.create_window(attributes).context("creating window")?;

        // SAFETY: the window outlives the device and swapchain (see field order)
        unsafe {
            let device = VulkanDevice::new(&window, &app.config).context("initializing Vulkan")?;
            let mut swapchain = device
                .create_swapchain(app.config.width, app.config.height)
                .context("creating swapchain")?;

            let renderer = match Renderer::new(&device, &swapchain, &app.scene, &app.config, &app.binaries) {
                Ok(renderer) => renderer,
                Err(e) => {
                    swapchain.destroy();
                    return Err(e).context("building renderer");
                }
            };

            tracing::info!(gpu = device.device_name(), "Ready");
            Ok(Self {
                renderer,
                swapchain,
                device,
                window,
            })
        }
    }

    fn aspect(&self) -> f32 {
        let extent = self.swapchain.extent();
        extent.width as f32 / extent.height.max(1) as f32
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        unsafe {
            self.renderer.destroy(&self.device);
            self.swapchain.destroy();
        }
    }
}

/// Application state for the winit event loop.
struct App {
    config: RenderConfig,
    scene: Scene,
    binaries: ShaderBinaries,
    camera: Camera,
    input: InputState,
    last_frame: Instant,
    running: Option<Running>,
    error: Option<anyhow::Error>,
}

impl App {
    fn new(config: RenderConfig, scene: Scene, binaries: ShaderBinaries) -> Self {
        Self {
            config,
            scene,
            binaries,
            camera: Camera::default(),
            input: InputState::default(),
            last_frame: Instant::now(),
            running: None,
            error: None,
        }
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        tracing::error!("{:#}", error);
        self.error = Some(error);
        self.running = None;
        event_loop.exit();
    }

    fn draw(&mut self, event_loop: &ActiveEventLoop) {
        let Some(running) = self.running.as_mut() else {
            return;
        };

        let now = Instant::now();
        let dt = now.duration_since(self.last_frame).as_secs_f32();
        self.last_frame = now;

        self.camera.update(&self.input, dt);
        self.input.mouse_delta = (0.0, 0.0);

        let aspect = running.aspect();
        // SAFETY: device and swapchain belong to the same running state
        let result = unsafe {
            running
                .renderer
                .draw_frame(&running.device, &mut running.swapchain, &self.camera, aspect)
        };

        match result {
            Ok(FrameOutcome::Presented { sample_count, .. }) => {
                tracing::trace!(sample_count, "Frame presented");
            }
            Ok(FrameOutcome::Skipped) => tracing::debug!("Frame skipped"),
            Err(e) => self.fail(event_loop, anyhow::Error::new(e).context("drawing frame")),
        }
    }

    fn handle_key(&mut self, event_loop: &ActiveEventLoop, code: KeyCode, pressed: bool) {
        match code {
            KeyCode::KeyW => self.input.forward = pressed,
            KeyCode::KeyS => self.input.back = pressed,
            KeyCode::KeyA => self.input.left = pressed,
            KeyCode::KeyD => self.input.right = pressed,
            KeyCode::KeyE => self.input.up = pressed,
            KeyCode::KeyQ => self.input.down = pressed,
            KeyCode::Escape if pressed => event_loop.exit(),
            _ => {}
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.running.is_some() {
            return;
        }
        match Running::start(event_loop, self) {
            Ok(running) => {
                self.running = Some(running);
                self.last_frame = Instant::now();
            }
            Err(e) => self.fail(event_loop, e),
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _window_id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => event_loop.exit(),

            WindowEvent::KeyboardInput { event, .. } => {
                if let PhysicalKey::Code(code) = event.physical_key {
                    self.handle_key(event_loop, code, event.state == ElementState::Pressed);
                }
            }

            WindowEvent::MouseInput {
                button: MouseButton::Right,
                state,
                ..
            } => {
                self.input.looking = state == ElementState::Pressed;
            }

            WindowEvent::Focused(false) => {
                self.input = InputState::default();
            }

            WindowEvent::RedrawRequested => self.draw(event_loop),

            _ => {}
        }
    }

    fn device_event(&mut self, _event_loop: &ActiveEventLoop, _device_id: DeviceId, event: DeviceEvent) {
        // Raw motion keeps working when the cursor leaves the window
        if let DeviceEvent::MouseMotion { delta } = event {
            if self.input.looking {
                self.input.mouse_delta.0 += delta.0;
                self.input.mouse_delta.1 += delta.1;
            }
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(running) = &self.running {
            running.window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        self.running = None;
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = RenderConfig::from_args(std::env::args().skip(1))?;
    let binaries = ShaderBinaries::load(&config.shader_dir)?;
    let scene = Scene::demo();
    tracing::info!(
        width = config.width,
        height = config.height,
        bounces = config.max_bounces,
        spp = config.samples_per_frame,
        "Starting"
    );

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = App::new(config, scene, binaries);
    event_loop.run_app(&mut app)?;

    match app.error.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
