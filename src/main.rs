//! voxmesh - streams GPU-meshed voxel regions into a fly-through view

use std::sync::Arc;
use winit::{
    application::ApplicationHandler,
    dpi::PhysicalSize,
    event::{DeviceEvent, DeviceId, WindowEvent},
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{Window, WindowId},
};

use voxmesh::config::RendererConfig;
use voxmesh::core::{
    camera::Camera,
    camera_controller::FlyCameraController,
    input::InputState,
    logging,
    time::FrameTimer,
    Error, Result,
};
use voxmesh::gpu::{ShaderSet, WgpuBackend};
use voxmesh::render::{
    buffer::CameraBuffer,
    context::GpuContext,
    pipeline::RegionRenderPipeline,
    texture::DepthTexture,
};
use voxmesh::streaming::{RegionDraw, RegionStreamer};

struct RenderResources {
    backend: WgpuBackend,
    streamer: RegionStreamer,
    camera_buffer: CameraBuffer,
    depth: DepthTexture,
    region_pipeline: RegionRenderPipeline,
}

impl RenderResources {
    fn new(gpu: &GpuContext, config: &RendererConfig) -> Result<Self> {
        let shaders = ShaderSet::from_dir(config.shader_dir.as_deref())?;
        let mut backend = WgpuBackend::new(gpu.device.clone(), gpu.queue.clone(), &shaders);

        let mut streamer = RegionStreamer::new(&mut backend, &config.world, &config.streaming)?;
        streamer.generate(&mut backend)?;

        let camera_buffer = CameraBuffer::new(&gpu.device);
        let (width, height) = gpu.size();
        let depth = DepthTexture::new(&gpu.device, width, height);
        let region_pipeline = RegionRenderPipeline::new(
            &gpu.device,
            gpu.format(),
            &shaders.render,
            camera_buffer.bind_group_layout(),
        );

        Ok(Self {
            backend,
            streamer,
            camera_buffer,
            depth,
            region_pipeline,
        })
    }
}

struct App {
    config: RendererConfig,
    window: Option<Arc<Window>>,
    gpu: Option<GpuContext>,
    resources: Option<RenderResources>,
    camera: Camera,
    controller: FlyCameraController,
    input: InputState,
    timer: FrameTimer,
    /// First fatal error; the process exits non-zero once the loop ends
    fatal: Option<Error>,
}

impl App {
    fn new(config: RendererConfig) -> Self {
        let mut camera = Camera::new(
            glam::Vec3::from_array(config.camera.position),
            config.window.width as f32 / config.window.height as f32,
        );
        camera.look_at(glam::Vec3::from_array(config.camera.look_at));
        let controller = FlyCameraController::new(config.camera.speed, config.camera.sensitivity);

        Self {
            config,
            window: None,
            gpu: None,
            resources: None,
            camera,
            controller,
            input: InputState::new(),
            timer: FrameTimer::new(),
            fatal: None,
        }
    }

    /// Log a fatal error once and keep it for the exit status
    fn record_fatal(&mut self, error: Error) {
        if self.fatal.is_some() {
            return;
        }
        if error.is_streaming_failure() {
            log::error!("Fatal streaming error: {}", error);
        } else {
            log::error!("Startup failed: {}", error);
        }
        self.fatal = Some(error);
    }

    fn exit_code(&self) -> i32 {
        if self.fatal.is_some() { 1 } else { 0 }
    }

    fn init(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let window_attrs = Window::default_attributes()
            .with_title(self.config.window.title.clone())
            .with_inner_size(PhysicalSize::new(self.config.window.width, self.config.window.height));

        let window = Arc::new(
            event_loop
                .create_window(window_attrs)
                .map_err(|e| Error::Window(e.to_string()))?,
        );

        let gpu = pollster::block_on(GpuContext::new(window.clone()))?;

        let size = window.inner_size();
        self.camera.set_aspect(size.width as f32, size.height as f32);
        log::info!("Window created: {}x{}", size.width, size.height);

        let resources = RenderResources::new(&gpu, &self.config)?;

        self.window = Some(window);
        self.resources = Some(resources);
        self.gpu = Some(gpu);
        Ok(())
    }

    /// Advance streaming by one batch, then draw every completed region
    fn render(&mut self) -> Result<()> {
        let (Some(gpu), Some(resources)) = (&self.gpu, &mut self.resources) else {
            return Ok(());
        };

        if !resources.streamer.is_drained() {
            resources.streamer.step(&mut resources.backend)?;
            if resources.streamer.is_drained() {
                let stats = resources.streamer.stats();
                log::info!(
                    "All {} regions meshed: {} vertices in {} batches",
                    stats.regions_completed,
                    stats.total_vertices,
                    stats.batches
                );
            }
        }

        let draws: Vec<RegionDraw> = resources.streamer.draw_list().collect();
        resources.region_pipeline.prepare(&resources.backend, &draws)?;
        resources.camera_buffer.update(&gpu.queue, &self.camera);

        let frame = match gpu.get_current_texture() {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Skipping frame: {}", e);
                let (width, height) = gpu.size();
                gpu.surface.configure(&gpu.device, &gpu.config);
                resources.depth.resize(&gpu.device, width, height);
                return Ok(());
            }
        };
        let view = frame.texture.create_view(&wgpu::TextureViewDescriptor::default());

        let mut encoder = gpu.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("frame_encoder"),
        });
        resources.region_pipeline.render(
            &mut encoder,
            &view,
            &resources.depth,
            resources.camera_buffer.bind_group(),
            &resources.backend,
            &draws,
        )?;
        gpu.queue.submit([encoder.finish()]);
        frame.present();
        Ok(())
    }

    fn update_title(&self) {
        let (Some(window), Some(resources)) = (&self.window, &self.resources) else {
            return;
        };
        let table = resources.streamer.table();
        let completed = table.count_in(voxmesh::streaming::MeshState::Completed);
        window.set_title(&format!(
            "{} - {:.1} FPS | {}/{} regions | RMB=look, WASD=move, Space/Shift=up/down",
            self.config.window.title,
            self.timer.fps(),
            completed,
            table.len()
        ));
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        if let Err(e) = self.init(event_loop) {
            self.record_fatal(e);
            event_loop.exit();
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        self.input.process_event(&event);

        match event {
            WindowEvent::CloseRequested => {
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                if size.width > 0 && size.height > 0 {
                    if let (Some(gpu), Some(resources)) = (&mut self.gpu, &mut self.resources) {
                        gpu.resize(size.width, size.height);
                        resources.depth.resize(&gpu.device, size.width, size.height);
                        self.camera.set_aspect(size.width as f32, size.height as f32);
                    }
                }
            }
            WindowEvent::KeyboardInput { event, .. } => {
                if event.state.is_pressed() && event.physical_key == PhysicalKey::Code(KeyCode::Escape) {
                    event_loop.exit();
                }
            }
            WindowEvent::RedrawRequested => {
                self.timer.tick();
                let dt = self.timer.delta_secs();

                self.controller.update(&mut self.camera, &self.input, dt);

                if let Err(e) = self.render() {
                    self.record_fatal(e);
                    event_loop.exit();
                    return;
                }

                self.update_title();
                self.input.end_frame();
            }
            _ => {}
        }
    }

    fn device_event(&mut self, _event_loop: &ActiveEventLoop, _device_id: DeviceId, event: DeviceEvent) {
        if let DeviceEvent::MouseMotion { delta } = event {
            self.input.process_mouse_motion(delta);
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = &self.window {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(mut resources) = self.resources.take() {
            if let Err(e) = resources.streamer.release(&mut resources.backend) {
                log::warn!("Releasing region resources: {}", e);
            }
        }
    }
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let config = match RendererConfig::from_args(&args) {
        Ok(config) => config,
        Err(e) => {
            logging::init();
            log::error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };
    logging::init_with_filter(config.log_filter.as_deref().unwrap_or("info"));
    log::info!(
        "voxmesh starting: {} regions, {} staging slots",
        config.world.num_regions,
        config.streaming.staging_slots
    );

    let event_loop = match EventLoop::new() {
        Ok(event_loop) => event_loop,
        Err(e) => {
            log::error!("Failed to create event loop: {}", e);
            std::process::exit(1);
        }
    };
    let mut app = App::new(config);

    if let Err(e) = event_loop.run_app(&mut app) {
        log::error!("Event loop error: {}", e);
        std::process::exit(1);
    }
    std::process::exit(app.exit_code());
}
