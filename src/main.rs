// =============================================================================
// RENDER CORE DEMO
// =============================================================================
//
// Opens one window and drives the frame loop through the core:
//
// ┌─────────────────────────────────────────────────────────────────┐
// │  DeviceManager (instance, device, queue pool)                   │
// │    └── SurfaceContext (swapchain, frame slots, frame packet)    │
// │          └── FramePacket (BeginPass .. DrawIndexed .. EndPass)  │
// │  ShaderCache + PipelineSpec (bytecode cache, pipeline build)    │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. Rebuild the pipeline if the shader changed on disk
// 2. begin_frame (wait slot fence, acquire image)
// 3. Record the frame packet
// 4. end_frame (replay, submit, present)
//
// =============================================================================

use anyhow::{Context, Result};
use ash::vk;
use glam::Mat4;
use raw_window_handle::HasDisplayHandle;
use render_core::backend::buffer::GpuBuffer;
use render_core::backend::frame_packet::{
    FrameGlobals, GlobalsSource, PassTarget, VertexArray, VertexBufferBinding,
};
use render_core::backend::pipeline::{PipelineObject, PipelineSpec, RenderTargetKind};
use render_core::backend::shader::{ShaderCache, ShaderWatcher};
use render_core::backend::{DeviceManager, SurfaceContext};
use render_core::config::Config;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Window, WindowAttributes},
};

const SHADER_DIR: &str = "assets/shaders";
const TRIANGLE_SHADER: &str = "assets/shaders/triangle.glsl";

// Interleaved position (xy) + colour (rgb)
#[rustfmt::skip]
const VERTICES: [f32; 15] = [
     0.0, -0.6,   1.0, 0.3, 0.2,
     0.6,  0.5,   0.2, 1.0, 0.3,
    -0.6,  0.5,   0.2, 0.4, 1.0,
];
const INDICES: [u16; 3] = [0, 1, 2];

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml
    let config = Config::load();

    init_logging(&config);
    log::info!("Starting render-core demo");
    log::info!(
        "Window: {}x{}, vsync {}, {} frames in flight",
        config.window.width,
        config.window.height,
        config.graphics.vsync,
        config.graphics.frames_in_flight
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

/// Initialize logging with optional file output for validation errors
fn init_logging(config: &Config) {
    use env_logger::Builder;
    use log::LevelFilter;

    // RUST_LOG overrides the Info default
    let mut builder = Builder::new();
    builder.filter_level(LevelFilter::Info);
    builder.parse_default_env();
    builder.init();

    // Create/clear log file if enabled
    if config.debug.log_to_file {
        if let Ok(mut file) = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
        {
            let _ = writeln!(file, "=== Render Core Log ===");
            let _ = writeln!(file, "Started: {:?}", std::time::SystemTime::now());
            let _ = writeln!(file);
        }
    }
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Geometry and the pipeline drawing it
struct Scene {
    pipeline: PipelineObject,
    /// Surface format the pipeline's render pass was built for
    format: vk::Format,
    vertices: GpuBuffer,
    indices: GpuBuffer,
}

/// Field order matters for Drop: the surface goes before the device manager.
struct App {
    config: Config,
    window: Option<Arc<Window>>,

    scene: Option<Scene>,
    surface: Option<SurfaceContext>,
    manager: Option<DeviceManager>,

    shaders: ShaderCache,
    watcher: Option<ShaderWatcher>,

    start: Instant,
    frame_count: u32,
    draw_count: u32,
    last_fps_update: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let shaders = ShaderCache::new(config.cache.shader_dir());
        let now = Instant::now();
        Self {
            config,
            window: None,
            scene: None,
            surface: None,
            manager: None,
            shaders,
            watcher: None,
            start: now,
            frame_count: 0,
            draw_count: 0,
            last_fps_update: now,
        }
    }

    // =========================================================================
    // INITIALIZATION
    // =========================================================================

    fn init_renderer(&mut self, window: &Window) -> Result<()> {
        let display = window
            .display_handle()
            .context("Failed to get display handle")?
            .as_raw();
        let mut manager = DeviceManager::init(&self.config, display)?;

        let size = window.inner_size();
        let surface = SurfaceContext::init(
            &mut manager,
            window,
            size.width,
            size.height,
            &self.config.graphics,
        )?;

        let device = surface.device().clone();
        let vertices = GpuBuffer::upload(
            &device,
            "triangle vertices",
            vk::BufferUsageFlags::VERTEX_BUFFER,
            bytemuck::cast_slice(&VERTICES),
        )?;
        let indices = GpuBuffer::upload(
            &device,
            "triangle indices",
            vk::BufferUsageFlags::INDEX_BUFFER,
            bytemuck::cast_slice(&INDICES),
        )?;

        let pipeline = match build_pipeline(&mut self.shaders, &self.config, &surface) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                vertices.destroy(&device);
                indices.destroy(&device);
                return Err(e);
            }
        };

        // Hot reload is optional; a missing directory only disables it
        self.watcher = match ShaderWatcher::new(Path::new(SHADER_DIR)) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                log::warn!("Shader hot reload disabled: {:?}", e);
                None
            }
        };

        self.scene = Some(Scene {
            pipeline,
            format: surface.format(),
            vertices,
            indices,
        });
        self.surface = Some(surface);
        self.manager = Some(manager);
        Ok(())
    }

    /// Rebuild the pipeline after a shader edit or a surface format change.
    /// A failed rebuild keeps the previous pipeline.
    fn refresh_pipeline(&mut self) {
        let (Some(scene), Some(surface)) = (self.scene.as_mut(), self.surface.as_ref()) else {
            return;
        };

        let edited = self
            .watcher
            .as_ref()
            .map(|w| !w.poll_changed().is_empty())
            .unwrap_or(false);
        let format_changed = scene.format != surface.format();
        if !edited && !format_changed {
            return;
        }

        match build_pipeline(&mut self.shaders, &self.config, surface) {
            Ok(pipeline) => {
                let device = surface.device();
                if let Err(e) = device.wait_idle() {
                    log::error!("wait_idle before pipeline swap failed: {:?}", e);
                }
                scene.pipeline.destroy(&device.logical);
                scene.pipeline = pipeline;
                scene.format = surface.format();
                log::info!("Rebuilt pipeline for {}", TRIANGLE_SHADER);
            }
            Err(e) => log::error!("Pipeline rebuild failed, keeping previous: {:?}", e),
        }
    }

    // =========================================================================
    // RENDERING
    // =========================================================================

    /// Returns `false` when no frame was produced (minimised or swapchain rebuilt)
    fn render_frame(&mut self) -> Result<bool> {
        self.refresh_pipeline();

        let (Some(surface), Some(scene)) = (self.surface.as_mut(), self.scene.as_ref()) else {
            return Ok(false);
        };

        if !surface.begin_frame()? {
            return Ok(false);
        }

        let extent = surface.extent();
        let aspect = extent.width as f32 / extent.height.max(1) as f32;
        let view_projection = Mat4::orthographic_rh(-aspect, aspect, -1.0, 1.0, -1.0, 1.0);
        let model = Mat4::from_rotation_z(self.start.elapsed().as_secs_f32() * 0.8);

        let clear_color = self.config.graphics.clear_color;
        let packet = surface.frame_packet();
        packet.begin_pass(PassTarget::Swapchain, clear_color);
        packet.bind_pipeline(scene.pipeline.pipeline);
        packet.bind_globals(FrameGlobals::camera(view_projection, GlobalsSource::Renderer2D));
        packet.push_matrix(model);
        packet.draw_indexed(
            VertexArray {
                index_buffer: scene.indices.buffer,
                index_offset: 0,
                index_type: vk::IndexType::UINT16,
            },
            &[VertexBufferBinding {
                buffer: scene.vertices.buffer,
                offset: 0,
            }],
            INDICES.len() as u32,
            1,
        );
        packet.end_pass();

        let stats = surface.end_frame()?;
        self.draw_count += stats.draws;
        Ok(true)
    }

    fn update_fps(&mut self) {
        self.frame_count += 1;

        let now = Instant::now();
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;
            if let Some(ref window) = self.window {
                window.set_title(&format!("{} - {:.0} FPS", self.config.window.title, fps));
            }
            log::debug!("{:.0} FPS, {} draws", fps, self.draw_count);

            self.frame_count = 0;
            self.draw_count = 0;
            self.last_fps_update = now;
        }
    }

    // =========================================================================
    // CLEANUP
    // =========================================================================

    /// Scene resources, then the surface, then the device (saves the pipeline cache)
    fn shutdown(&mut self) {
        if let (Some(scene), Some(surface)) = (self.scene.take(), self.surface.as_ref()) {
            let device = surface.device().clone();
            let _ = device.wait_idle();
            scene.pipeline.destroy(&device.logical);
            scene.vertices.destroy(&device);
            scene.indices.destroy(&device);
        }
        self.surface = None;
        if let Some(mut manager) = self.manager.take() {
            manager.shutdown();
        }
    }
}

fn build_pipeline(shaders: &mut ShaderCache, config: &Config, surface: &SurfaceContext) -> Result<PipelineObject> {
    let spec = PipelineSpec::from_shader(
        Path::new(TRIANGLE_SHADER),
        shaders,
        &config.graphics,
        RenderTargetKind::Swapchain,
    )?;
    PipelineObject::build(surface.device(), &spec, surface.render_pass())
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_renderer(&window) {
            log::error!("Failed to initialize renderer: {:?}", e);
            event_loop.exit();
            return;
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                if let Some(surface) = self.surface.as_mut() {
                    surface.notify_resized(size.width, size.height);
                }
            }

            WindowEvent::RedrawRequested => match self.render_frame() {
                Ok(true) => self.update_fps(),
                Ok(false) => {}
                Err(e) => {
                    // Anything that is not swapchain staleness is fatal
                    log::error!("Render error: {:?}", e);
                    event_loop.exit();
                }
            },

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() && event.physical_key == PhysicalKey::Code(KeyCode::Escape) {
                    log::info!("ESC pressed, exiting...");
                    event_loop.exit();
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        self.shutdown();
    }
}

impl Drop for App {
    fn drop(&mut self) {
        self.shutdown();
        log::info!("Cleanup complete");
    }
}
